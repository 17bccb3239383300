mod btree_index;
mod btree_iterator;

pub use btree_index::BPlusTreeIndex;
pub use btree_iterator::TreeIndexIterator;

use crate::error::{BurrowDBError, BurrowDBResult};
use crate::storage::codec::CommonCodec;
use crate::storage::page::RecordId;
use std::fmt::Debug;

/// Key requirements of the B+ tree: total ordering plus a fixed-width byte
/// encoding whose order the tree does not rely on (comparison happens on the
/// decoded value). `Default` supplies the throwaway key stored in an
/// internal page's sentinel slot.
pub trait IndexKey:
    Clone + Ord + Debug + Default + Send + Sync + 'static
{
    const ENCODED_SIZE: usize;

    fn encode(&self) -> Vec<u8>;

    fn decode(bytes: &[u8]) -> BurrowDBResult<Self>;
}

impl IndexKey for i64 {
    const ENCODED_SIZE: usize = 8;

    fn encode(&self) -> Vec<u8> {
        CommonCodec::encode_i64(*self)
    }

    fn decode(bytes: &[u8]) -> BurrowDBResult<Self> {
        Ok(CommonCodec::decode_i64(bytes)?.0)
    }
}

impl IndexKey for u64 {
    const ENCODED_SIZE: usize = 8;

    fn encode(&self) -> Vec<u8> {
        CommonCodec::encode_u64(*self)
    }

    fn decode(bytes: &[u8]) -> BurrowDBResult<Self> {
        Ok(CommonCodec::decode_u64(bytes)?.0)
    }
}

impl IndexKey for u32 {
    const ENCODED_SIZE: usize = 4;

    fn encode(&self) -> Vec<u8> {
        CommonCodec::encode_u32(*self)
    }

    fn decode(bytes: &[u8]) -> BurrowDBResult<Self> {
        Ok(CommonCodec::decode_u32(bytes)?.0)
    }
}

/// Key-type-erased handle the transaction manager's index write set holds,
/// so undo can delete and re-insert entries without knowing the key type.
pub trait IndexWriteUndo: Send + Sync + Debug {
    fn insert_encoded(&self, key: &[u8], rid: RecordId) -> BurrowDBResult<()>;

    fn remove_encoded(&self, key: &[u8]) -> BurrowDBResult<()>;
}

pub(crate) fn decode_key<K: IndexKey>(bytes: &[u8]) -> BurrowDBResult<K> {
    if bytes.len() < K::ENCODED_SIZE {
        return Err(BurrowDBError::Internal(format!(
            "key bytes {} shorter than encoded size {}",
            bytes.len(),
            K::ENCODED_SIZE
        )));
    }
    K::decode(&bytes[..K::ENCODED_SIZE])
}
