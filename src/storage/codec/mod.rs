mod btree_page;
mod table_page;

pub use btree_page::{
    BPlusTreeHeaderPageCodec, BPlusTreeInternalPageCodec, BPlusTreeLeafPageCodec,
    BPlusTreePageCodec, BPlusTreePageTypeCodec,
};
pub use table_page::{TablePageCodec, TablePageHeaderCodec, TupleInfoCodec, TupleMetaCodec};

use crate::error::{BurrowDBError, BurrowDBResult};
use crate::storage::page::RecordId;
use crate::storage::tuple::Tuple;

/// A decoded value plus the number of bytes it consumed.
pub type DecodedData<T> = (T, usize);

pub struct CommonCodec;

impl CommonCodec {
    pub fn encode_bool(data: bool) -> Vec<u8> {
        vec![data as u8]
    }

    pub fn decode_bool(bytes: &[u8]) -> BurrowDBResult<DecodedData<bool>> {
        if bytes.is_empty() {
            return Err(BurrowDBError::Internal(
                "bytes too short for bool".to_string(),
            ));
        }
        Ok((bytes[0] != 0, 1))
    }

    pub fn encode_u16(data: u16) -> Vec<u8> {
        data.to_be_bytes().to_vec()
    }

    pub fn decode_u16(bytes: &[u8]) -> BurrowDBResult<DecodedData<u16>> {
        if bytes.len() < 2 {
            return Err(BurrowDBError::Internal(
                "bytes too short for u16".to_string(),
            ));
        }
        Ok((u16::from_be_bytes([bytes[0], bytes[1]]), 2))
    }

    pub fn encode_u32(data: u32) -> Vec<u8> {
        data.to_be_bytes().to_vec()
    }

    pub fn decode_u32(bytes: &[u8]) -> BurrowDBResult<DecodedData<u32>> {
        if bytes.len() < 4 {
            return Err(BurrowDBError::Internal(
                "bytes too short for u32".to_string(),
            ));
        }
        Ok((
            u32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]),
            4,
        ))
    }

    pub fn encode_u64(data: u64) -> Vec<u8> {
        data.to_be_bytes().to_vec()
    }

    pub fn decode_u64(bytes: &[u8]) -> BurrowDBResult<DecodedData<u64>> {
        if bytes.len() < 8 {
            return Err(BurrowDBError::Internal(
                "bytes too short for u64".to_string(),
            ));
        }
        let data = [
            bytes[0], bytes[1], bytes[2], bytes[3], bytes[4], bytes[5], bytes[6], bytes[7],
        ];
        Ok((u64::from_be_bytes(data), 8))
    }

    pub fn encode_i64(data: i64) -> Vec<u8> {
        data.to_be_bytes().to_vec()
    }

    pub fn decode_i64(bytes: &[u8]) -> BurrowDBResult<DecodedData<i64>> {
        if bytes.len() < 8 {
            return Err(BurrowDBError::Internal(
                "bytes too short for i64".to_string(),
            ));
        }
        let data = [
            bytes[0], bytes[1], bytes[2], bytes[3], bytes[4], bytes[5], bytes[6], bytes[7],
        ];
        Ok((i64::from_be_bytes(data), 8))
    }
}

pub struct RidCodec;

impl RidCodec {
    pub const SIZE: usize = 8;

    pub fn encode(rid: &RecordId) -> Vec<u8> {
        let mut bytes = Vec::with_capacity(Self::SIZE);
        bytes.extend(CommonCodec::encode_u32(rid.page_id));
        bytes.extend(CommonCodec::encode_u32(rid.slot_num));
        bytes
    }

    pub fn decode(bytes: &[u8]) -> BurrowDBResult<DecodedData<RecordId>> {
        let mut left_bytes = bytes;
        let (page_id, offset) = CommonCodec::decode_u32(left_bytes)?;
        left_bytes = &left_bytes[offset..];
        let (slot_num, offset) = CommonCodec::decode_u32(left_bytes)?;
        left_bytes = &left_bytes[offset..];
        Ok((RecordId::new(page_id, slot_num), bytes.len() - left_bytes.len()))
    }
}

pub struct TupleCodec;

impl TupleCodec {
    pub fn encode(tuple: &Tuple) -> Vec<u8> {
        let mut bytes = Vec::with_capacity(4 + tuple.data.len());
        bytes.extend(CommonCodec::encode_u32(tuple.data.len() as u32));
        bytes.extend_from_slice(&tuple.data);
        bytes
    }

    pub fn decode(bytes: &[u8]) -> BurrowDBResult<DecodedData<Tuple>> {
        let (len, offset) = CommonCodec::decode_u32(bytes)?;
        let len = len as usize;
        if bytes.len() < offset + len {
            return Err(BurrowDBError::Internal(format!(
                "bytes length {} is less than expected {}",
                bytes.len(),
                offset + len
            )));
        }
        let data = bytes[offset..offset + len].to_vec();
        Ok((Tuple::new(data), offset + len))
    }
}
