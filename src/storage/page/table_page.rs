use crate::buffer::{PageId, INVALID_PAGE_ID, PAGE_SIZE};
use crate::error::{BurrowDBError, BurrowDBResult};
use crate::storage::codec::{TablePageHeaderCodec, TupleInfoCodec};
use crate::storage::tuple::Tuple;
use crate::transaction::{TransactionId, INVALID_TRANSACTION_ID};
use std::fmt::{Display, Formatter};

pub const INVALID_RID: RecordId = RecordId {
    page_id: INVALID_PAGE_ID,
    slot_num: 0,
};

/// Row identifier: the page the row lives on plus its slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RecordId {
    pub page_id: PageId,
    pub slot_num: u32,
}

impl RecordId {
    pub fn new(page_id: PageId, slot_num: u32) -> Self {
        Self { page_id, slot_num }
    }
}

impl Display for RecordId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}-{}", self.page_id, self.slot_num)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TupleMeta {
    pub insert_txn_id: TransactionId,
    pub delete_txn_id: TransactionId,
    pub is_deleted: bool,
}

impl TupleMeta {
    pub fn new(insert_txn_id: TransactionId) -> Self {
        Self {
            insert_txn_id,
            delete_txn_id: INVALID_TRANSACTION_ID,
            is_deleted: false,
        }
    }

    pub fn mark_deleted(&mut self, txn_id: TransactionId) {
        self.is_deleted = true;
        self.delete_txn_id = txn_id;
    }

    pub fn clear_deleted(&mut self) {
        self.is_deleted = false;
        self.delete_txn_id = INVALID_TRANSACTION_ID;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TupleInfo {
    pub offset: u16,
    pub size: u16,
    pub meta: TupleMeta,
}

/// Slotted page:
/// ```text
///  ---------------------------------------------------------
///  | HEADER | ... FREE SPACE ... | ... INSERTED TUPLES ... |
///  ---------------------------------------------------------
///                                ^ free space pointer
/// ```
/// The header carries `next_page_id`, tuple counts, and one `TupleInfo`
/// (offset, size, meta) per slot. Tuple bytes grow from the page tail.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TablePage {
    pub header: TablePageHeader,
    pub data: [u8; PAGE_SIZE],
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TablePageHeader {
    pub next_page_id: PageId,
    pub num_tuples: u16,
    pub num_deleted_tuples: u16,
    pub tuple_infos: Vec<TupleInfo>,
}

impl TablePage {
    pub fn new(next_page_id: PageId) -> Self {
        Self {
            header: TablePageHeader {
                next_page_id,
                num_tuples: 0,
                num_deleted_tuples: 0,
                tuple_infos: Vec::new(),
            },
            data: [0; PAGE_SIZE],
        }
    }

    /// Offset the next tuple would be written at, or an error when the page
    /// cannot hold it.
    pub fn next_tuple_offset(&self, tuple: &Tuple) -> BurrowDBResult<usize> {
        let slot_end_offset = if self.header.num_tuples > 0 {
            self.header.tuple_infos[self.header.num_tuples as usize - 1].offset as usize
        } else {
            PAGE_SIZE
        };

        if slot_end_offset < tuple.len() {
            return Err(BurrowDBError::Storage(
                "not enough space to store tuple".to_string(),
            ));
        }
        let tuple_offset = slot_end_offset - tuple.len();

        // The header needs room for one more TupleInfo as well.
        let min_tuple_offset =
            TablePageHeaderCodec::encoded_size(&self.header) + TupleInfoCodec::SIZE;
        if tuple_offset < min_tuple_offset {
            return Err(BurrowDBError::Storage(
                "not enough space to store tuple".to_string(),
            ));
        }
        Ok(tuple_offset)
    }

    pub fn insert_tuple(&mut self, meta: &TupleMeta, tuple: &Tuple) -> BurrowDBResult<u16> {
        let tuple_offset = self.next_tuple_offset(tuple)?;
        let slot_num = self.header.num_tuples;
        debug_assert!(tuple.len() < u16::MAX as usize);

        self.header.tuple_infos.push(TupleInfo {
            offset: tuple_offset as u16,
            size: tuple.len() as u16,
            meta: *meta,
        });
        self.header.num_tuples += 1;
        if meta.is_deleted {
            self.header.num_deleted_tuples += 1;
        }

        self.data[tuple_offset..tuple_offset + tuple.len()].copy_from_slice(&tuple.data);
        Ok(slot_num)
    }

    pub fn tuple(&self, slot_num: u16) -> BurrowDBResult<(TupleMeta, Tuple)> {
        let info = self.tuple_info(slot_num)?;
        let tuple = Tuple::from(&self.data[info.offset as usize..(info.offset + info.size) as usize]);
        Ok((info.meta, tuple))
    }

    pub fn tuple_meta(&self, slot_num: u16) -> BurrowDBResult<TupleMeta> {
        Ok(self.tuple_info(slot_num)?.meta)
    }

    pub fn update_tuple_meta(&mut self, meta: TupleMeta, slot_num: u16) -> BurrowDBResult<()> {
        if slot_num >= self.header.num_tuples {
            return Err(BurrowDBError::Storage(format!(
                "slot {} out of range",
                slot_num
            )));
        }
        let old = &self.header.tuple_infos[slot_num as usize].meta;
        if meta.is_deleted && !old.is_deleted {
            self.header.num_deleted_tuples += 1;
        } else if !meta.is_deleted && old.is_deleted {
            self.header.num_deleted_tuples -= 1;
        }
        self.header.tuple_infos[slot_num as usize].meta = meta;
        Ok(())
    }

    /// Overwrite a tuple's bytes. A same-size tuple is patched in place;
    /// otherwise the page is rebuilt with the replacement.
    pub fn update_tuple(&mut self, tuple: Tuple, slot_num: u16) -> BurrowDBResult<()> {
        if slot_num >= self.header.num_tuples {
            return Err(BurrowDBError::Storage(format!(
                "slot {} out of range",
                slot_num
            )));
        }
        let info = self.header.tuple_infos[slot_num as usize];
        if tuple.len() == info.size as usize {
            self.data[info.offset as usize..(info.offset + info.size) as usize]
                .copy_from_slice(&tuple.data);
            return Ok(());
        }

        let mut full_tuples = Vec::with_capacity(self.header.num_tuples as usize);
        for slot in 0..self.header.num_tuples {
            full_tuples.push(self.tuple(slot)?);
        }
        full_tuples[slot_num as usize].1 = tuple;

        let mut rebuilt = TablePage::new(self.header.next_page_id);
        for (meta, tuple) in full_tuples.iter() {
            rebuilt.insert_tuple(meta, tuple)?;
        }
        *self = rebuilt;
        Ok(())
    }

    fn tuple_info(&self, slot_num: u16) -> BurrowDBResult<TupleInfo> {
        if slot_num >= self.header.num_tuples {
            return Err(BurrowDBError::Storage(format!(
                "slot {} out of range",
                slot_num
            )));
        }
        Ok(self.header.tuple_infos[slot_num as usize])
    }
}
