use crate::buffer::PAGE_SIZE;
use crate::error::{BurrowDBError, BurrowDBResult};
use crate::storage::codec::{CommonCodec, DecodedData};
use crate::storage::page::{TablePage, TablePageHeader, TupleInfo, TupleMeta};

pub struct TupleMetaCodec;

impl TupleMetaCodec {
    pub const SIZE: usize = 8 + 8 + 1;

    pub fn encode(meta: &TupleMeta) -> Vec<u8> {
        let mut bytes = Vec::with_capacity(Self::SIZE);
        bytes.extend(CommonCodec::encode_u64(meta.insert_txn_id));
        bytes.extend(CommonCodec::encode_u64(meta.delete_txn_id));
        bytes.extend(CommonCodec::encode_bool(meta.is_deleted));
        bytes
    }

    pub fn decode(bytes: &[u8]) -> BurrowDBResult<DecodedData<TupleMeta>> {
        let mut left_bytes = bytes;
        let (insert_txn_id, offset) = CommonCodec::decode_u64(left_bytes)?;
        left_bytes = &left_bytes[offset..];
        let (delete_txn_id, offset) = CommonCodec::decode_u64(left_bytes)?;
        left_bytes = &left_bytes[offset..];
        let (is_deleted, offset) = CommonCodec::decode_bool(left_bytes)?;
        left_bytes = &left_bytes[offset..];
        Ok((
            TupleMeta {
                insert_txn_id,
                delete_txn_id,
                is_deleted,
            },
            bytes.len() - left_bytes.len(),
        ))
    }
}

pub struct TupleInfoCodec;

impl TupleInfoCodec {
    pub const SIZE: usize = 2 + 2 + TupleMetaCodec::SIZE;

    pub fn encode(info: &TupleInfo) -> Vec<u8> {
        let mut bytes = Vec::with_capacity(Self::SIZE);
        bytes.extend(CommonCodec::encode_u16(info.offset));
        bytes.extend(CommonCodec::encode_u16(info.size));
        bytes.extend(TupleMetaCodec::encode(&info.meta));
        bytes
    }

    pub fn decode(bytes: &[u8]) -> BurrowDBResult<DecodedData<TupleInfo>> {
        let mut left_bytes = bytes;
        let (offset_val, offset) = CommonCodec::decode_u16(left_bytes)?;
        left_bytes = &left_bytes[offset..];
        let (size, offset) = CommonCodec::decode_u16(left_bytes)?;
        left_bytes = &left_bytes[offset..];
        let (meta, offset) = TupleMetaCodec::decode(left_bytes)?;
        left_bytes = &left_bytes[offset..];
        Ok((
            TupleInfo {
                offset: offset_val,
                size,
                meta,
            },
            bytes.len() - left_bytes.len(),
        ))
    }
}

pub struct TablePageHeaderCodec;

impl TablePageHeaderCodec {
    pub fn encoded_size(header: &TablePageHeader) -> usize {
        4 + 2 + 2 + header.tuple_infos.len() * TupleInfoCodec::SIZE
    }

    pub fn encode(header: &TablePageHeader) -> Vec<u8> {
        let mut bytes = Vec::with_capacity(Self::encoded_size(header));
        bytes.extend(CommonCodec::encode_u32(header.next_page_id));
        bytes.extend(CommonCodec::encode_u16(header.num_tuples));
        bytes.extend(CommonCodec::encode_u16(header.num_deleted_tuples));
        for info in header.tuple_infos.iter() {
            bytes.extend(TupleInfoCodec::encode(info));
        }
        bytes
    }

    pub fn decode(bytes: &[u8]) -> BurrowDBResult<DecodedData<TablePageHeader>> {
        let mut left_bytes = bytes;
        let (next_page_id, offset) = CommonCodec::decode_u32(left_bytes)?;
        left_bytes = &left_bytes[offset..];
        let (num_tuples, offset) = CommonCodec::decode_u16(left_bytes)?;
        left_bytes = &left_bytes[offset..];
        let (num_deleted_tuples, offset) = CommonCodec::decode_u16(left_bytes)?;
        left_bytes = &left_bytes[offset..];

        let mut tuple_infos = Vec::with_capacity(num_tuples as usize);
        for _ in 0..num_tuples {
            let (info, offset) = TupleInfoCodec::decode(left_bytes)?;
            left_bytes = &left_bytes[offset..];
            tuple_infos.push(info);
        }
        Ok((
            TablePageHeader {
                next_page_id,
                num_tuples,
                num_deleted_tuples,
                tuple_infos,
            },
            bytes.len() - left_bytes.len(),
        ))
    }
}

pub struct TablePageCodec;

impl TablePageCodec {
    pub fn encode(page: &TablePage) -> Vec<u8> {
        let header_bytes = TablePageHeaderCodec::encode(&page.header);
        let mut bytes = page.data.to_vec();
        bytes[0..header_bytes.len()].copy_from_slice(&header_bytes);
        bytes
    }

    pub fn decode(bytes: &[u8]) -> BurrowDBResult<DecodedData<TablePage>> {
        if bytes.len() != PAGE_SIZE {
            return Err(BurrowDBError::Storage(format!(
                "table page size is {} instead of {}",
                bytes.len(),
                PAGE_SIZE
            )));
        }
        let (header, _) = TablePageHeaderCodec::decode(bytes)?;
        let mut data = [0u8; PAGE_SIZE];
        data.copy_from_slice(bytes);
        Ok((TablePage { header, data }, PAGE_SIZE))
    }
}
