use crate::buffer::PAGE_SIZE;
use crate::error::{BurrowDBError, BurrowDBResult};
use crate::storage::codec::{CommonCodec, DecodedData, RidCodec};
use crate::storage::index::IndexKey;
use crate::storage::page::{
    BPlusTreeHeaderPage, BPlusTreeInternalPage, BPlusTreeInternalPageHeader, BPlusTreeLeafPage,
    BPlusTreeLeafPageHeader, BPlusTreePage, BPlusTreePageType,
};

pub struct BPlusTreePageTypeCodec;

impl BPlusTreePageTypeCodec {
    pub fn encode(page_type: &BPlusTreePageType) -> Vec<u8> {
        match page_type {
            BPlusTreePageType::LeafPage => CommonCodec::encode_u32(1),
            BPlusTreePageType::InternalPage => CommonCodec::encode_u32(2),
        }
    }

    pub fn decode(bytes: &[u8]) -> BurrowDBResult<DecodedData<BPlusTreePageType>> {
        let (tag, offset) = CommonCodec::decode_u32(bytes)?;
        let page_type = match tag {
            1 => BPlusTreePageType::LeafPage,
            2 => BPlusTreePageType::InternalPage,
            other => {
                return Err(BurrowDBError::Storage(format!(
                    "invalid b+tree page type {}",
                    other
                )))
            }
        };
        Ok((page_type, offset))
    }
}

pub struct BPlusTreeHeaderPageCodec;

impl BPlusTreeHeaderPageCodec {
    pub fn encode(page: &BPlusTreeHeaderPage) -> Vec<u8> {
        let mut bytes = CommonCodec::encode_u32(page.root_page_id);
        bytes.resize(PAGE_SIZE, 0);
        bytes
    }

    pub fn decode(bytes: &[u8]) -> BurrowDBResult<DecodedData<BPlusTreeHeaderPage>> {
        let (root_page_id, offset) = CommonCodec::decode_u32(bytes)?;
        Ok((BPlusTreeHeaderPage { root_page_id }, offset))
    }
}

pub struct BPlusTreePageCodec;

impl BPlusTreePageCodec {
    pub fn encode<K: IndexKey>(page: &BPlusTreePage<K>) -> Vec<u8> {
        match page {
            BPlusTreePage::Leaf(page) => BPlusTreeLeafPageCodec::encode(page),
            BPlusTreePage::Internal(page) => BPlusTreeInternalPageCodec::encode(page),
        }
    }

    pub fn decode<K: IndexKey>(bytes: &[u8]) -> BurrowDBResult<DecodedData<BPlusTreePage<K>>> {
        let (page_type, _) = BPlusTreePageTypeCodec::decode(bytes)?;
        match page_type {
            BPlusTreePageType::LeafPage => {
                let (page, offset) = BPlusTreeLeafPageCodec::decode(bytes)?;
                Ok((BPlusTreePage::Leaf(page), offset))
            }
            BPlusTreePageType::InternalPage => {
                let (page, offset) = BPlusTreeInternalPageCodec::decode(bytes)?;
                Ok((BPlusTreePage::Internal(page), offset))
            }
        }
    }
}

pub struct BPlusTreeLeafPageCodec;

impl BPlusTreeLeafPageCodec {
    pub fn encode<K: IndexKey>(page: &BPlusTreeLeafPage<K>) -> Vec<u8> {
        let mut bytes = Vec::with_capacity(PAGE_SIZE);
        bytes.extend(BPlusTreePageTypeCodec::encode(&page.header.page_type));
        bytes.extend(CommonCodec::encode_u32(page.header.current_size));
        bytes.extend(CommonCodec::encode_u32(page.header.max_size));
        bytes.extend(CommonCodec::encode_u32(page.header.next_page_id));
        for (key, rid) in page.array.iter() {
            bytes.extend(key.encode());
            bytes.extend(RidCodec::encode(rid));
        }
        assert!(bytes.len() <= PAGE_SIZE, "leaf page overflows page size");
        bytes.resize(PAGE_SIZE, 0);
        bytes
    }

    pub fn decode<K: IndexKey>(bytes: &[u8]) -> BurrowDBResult<DecodedData<BPlusTreeLeafPage<K>>> {
        let mut left_bytes = bytes;
        let (page_type, offset) = BPlusTreePageTypeCodec::decode(left_bytes)?;
        if !matches!(page_type, BPlusTreePageType::LeafPage) {
            return Err(BurrowDBError::Storage(
                "expected a leaf page".to_string(),
            ));
        }
        left_bytes = &left_bytes[offset..];
        let (current_size, offset) = CommonCodec::decode_u32(left_bytes)?;
        left_bytes = &left_bytes[offset..];
        let (max_size, offset) = CommonCodec::decode_u32(left_bytes)?;
        left_bytes = &left_bytes[offset..];
        let (next_page_id, offset) = CommonCodec::decode_u32(left_bytes)?;
        left_bytes = &left_bytes[offset..];

        let mut array = Vec::with_capacity(current_size as usize);
        for _ in 0..current_size {
            let key = K::decode(left_bytes)?;
            left_bytes = &left_bytes[K::ENCODED_SIZE..];
            let (rid, offset) = RidCodec::decode(left_bytes)?;
            left_bytes = &left_bytes[offset..];
            array.push((key, rid));
        }

        let page = BPlusTreeLeafPage {
            header: BPlusTreeLeafPageHeader {
                page_type,
                current_size,
                max_size,
                next_page_id,
            },
            array,
        };
        Ok((page, bytes.len() - left_bytes.len()))
    }
}

pub struct BPlusTreeInternalPageCodec;

impl BPlusTreeInternalPageCodec {
    pub fn encode<K: IndexKey>(page: &BPlusTreeInternalPage<K>) -> Vec<u8> {
        let mut bytes = Vec::with_capacity(PAGE_SIZE);
        bytes.extend(BPlusTreePageTypeCodec::encode(&page.header.page_type));
        bytes.extend(CommonCodec::encode_u32(page.header.current_size));
        bytes.extend(CommonCodec::encode_u32(page.header.max_size));
        for (key, child) in page.array.iter() {
            bytes.extend(key.encode());
            bytes.extend(CommonCodec::encode_u32(*child));
        }
        assert!(bytes.len() <= PAGE_SIZE, "internal page overflows page size");
        bytes.resize(PAGE_SIZE, 0);
        bytes
    }

    pub fn decode<K: IndexKey>(
        bytes: &[u8],
    ) -> BurrowDBResult<DecodedData<BPlusTreeInternalPage<K>>> {
        let mut left_bytes = bytes;
        let (page_type, offset) = BPlusTreePageTypeCodec::decode(left_bytes)?;
        if !matches!(page_type, BPlusTreePageType::InternalPage) {
            return Err(BurrowDBError::Storage(
                "expected an internal page".to_string(),
            ));
        }
        left_bytes = &left_bytes[offset..];
        let (current_size, offset) = CommonCodec::decode_u32(left_bytes)?;
        left_bytes = &left_bytes[offset..];
        let (max_size, offset) = CommonCodec::decode_u32(left_bytes)?;
        left_bytes = &left_bytes[offset..];

        let mut array = Vec::with_capacity(current_size as usize);
        for _ in 0..current_size {
            let key = K::decode(left_bytes)?;
            left_bytes = &left_bytes[K::ENCODED_SIZE..];
            let (child, offset) = CommonCodec::decode_u32(left_bytes)?;
            left_bytes = &left_bytes[offset..];
            array.push((key, child));
        }

        let page = BPlusTreeInternalPage {
            header: BPlusTreeInternalPageHeader {
                page_type,
                current_size,
                max_size,
            },
            array,
        };
        Ok((page, bytes.len() - left_bytes.len()))
    }
}
