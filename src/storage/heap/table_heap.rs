use std::sync::atomic::Ordering;
use std::sync::Arc;

use crate::buffer::{AtomicPageId, BufferPoolManager, WritePageGuard, INVALID_PAGE_ID};
use crate::error::BurrowDBResult;
use crate::storage::codec::TablePageCodec;
use crate::storage::page::{RecordId, TablePage, TupleMeta};
use crate::storage::tuple::Tuple;

/// Append-only heap of opaque byte rows across a linked list of slotted
/// pages. Deletes are tombstones in the tuple meta; undo flips them back.
#[derive(Debug)]
pub struct TableHeap {
    pub buffer_pool: Arc<BufferPoolManager>,
    pub first_page_id: AtomicPageId,
    pub last_page_id: AtomicPageId,
}

impl TableHeap {
    pub fn try_new(buffer_pool: Arc<BufferPoolManager>) -> BurrowDBResult<Self> {
        let mut first_page_guard = buffer_pool.new_page()?;
        let first_page_id = first_page_guard.page_id();
        let table_page = TablePage::new(INVALID_PAGE_ID);
        first_page_guard.overwrite(&TablePageCodec::encode(&table_page));
        drop(first_page_guard);

        Ok(Self {
            buffer_pool,
            first_page_id: AtomicPageId::new(first_page_id),
            last_page_id: AtomicPageId::new(first_page_id),
        })
    }

    fn write_back_page(guard: &mut WritePageGuard, table_page: &TablePage) {
        guard.overwrite(&TablePageCodec::encode(table_page));
    }

    /// Insert `tuple`, allocating a fresh tail page when the current one has
    /// no room.
    pub fn insert_tuple(&self, meta: &TupleMeta, tuple: &Tuple) -> BurrowDBResult<RecordId> {
        let mut current_page_id = self.last_page_id.load(Ordering::SeqCst);

        loop {
            let mut current_page_guard = self.buffer_pool.fetch_page_write(current_page_id)?;
            let mut table_page = TablePageCodec::decode(current_page_guard.data())?.0;

            if table_page.next_tuple_offset(tuple).is_ok() {
                let slot_num = table_page.insert_tuple(meta, tuple)?;
                Self::write_back_page(&mut current_page_guard, &table_page);
                return Ok(RecordId::new(current_page_id, slot_num as u32));
            }

            let mut new_page_guard = self.buffer_pool.new_page()?;
            let new_page_id = new_page_guard.page_id();
            let new_table_page = TablePage::new(INVALID_PAGE_ID);
            Self::write_back_page(&mut new_page_guard, &new_table_page);

            table_page.header.next_page_id = new_page_id;
            Self::write_back_page(&mut current_page_guard, &table_page);
            drop(current_page_guard);

            self.last_page_id.store(new_page_id, Ordering::SeqCst);
            current_page_id = new_page_id;
        }
    }

    pub fn full_tuple(&self, rid: RecordId) -> BurrowDBResult<(TupleMeta, Tuple)> {
        let guard = self
            .buffer_pool
            .fetch_page_basic(rid.page_id)?
            .upgrade_read();
        let (table_page, _) = TablePageCodec::decode(guard.data())?;
        table_page.tuple(rid.slot_num as u16)
    }

    pub fn tuple(&self, rid: RecordId) -> BurrowDBResult<Tuple> {
        Ok(self.full_tuple(rid)?.1)
    }

    pub fn tuple_meta(&self, rid: RecordId) -> BurrowDBResult<TupleMeta> {
        Ok(self.full_tuple(rid)?.0)
    }

    pub fn update_tuple_meta(&self, rid: RecordId, meta: TupleMeta) -> BurrowDBResult<()> {
        let mut guard = self.buffer_pool.fetch_page_write(rid.page_id)?;
        let mut table_page = TablePageCodec::decode(guard.data())?.0;
        table_page.update_tuple_meta(meta, rid.slot_num as u16)?;
        Self::write_back_page(&mut guard, &table_page);
        Ok(())
    }

    /// Overwrite the tuple bytes at `rid`, keeping its meta.
    pub fn update_tuple(&self, rid: RecordId, tuple: Tuple) -> BurrowDBResult<()> {
        let mut guard = self.buffer_pool.fetch_page_write(rid.page_id)?;
        let mut table_page = TablePageCodec::decode(guard.data())?.0;
        table_page.update_tuple(tuple, rid.slot_num as u16)?;
        Self::write_back_page(&mut guard, &table_page);
        Ok(())
    }

    pub fn get_first_rid(&self) -> BurrowDBResult<Option<RecordId>> {
        let first_page_id = self.first_page_id.load(Ordering::SeqCst);
        let guard = self.buffer_pool.fetch_page_read(first_page_id)?;
        let (table_page, _) = TablePageCodec::decode(guard.data())?;
        if table_page.header.num_tuples == 0 {
            Ok(None)
        } else {
            Ok(Some(RecordId::new(first_page_id, 0)))
        }
    }

    pub fn get_next_rid(&self, rid: RecordId) -> BurrowDBResult<Option<RecordId>> {
        let guard = self.buffer_pool.fetch_page_read(rid.page_id)?;
        let (table_page, _) = TablePageCodec::decode(guard.data())?;
        if rid.slot_num + 1 < table_page.header.num_tuples as u32 {
            return Ok(Some(RecordId::new(rid.page_id, rid.slot_num + 1)));
        }
        let next_page_id = table_page.header.next_page_id;
        drop(guard);
        if next_page_id == INVALID_PAGE_ID {
            return Ok(None);
        }
        let guard = self.buffer_pool.fetch_page_read(next_page_id)?;
        let (next_page, _) = TablePageCodec::decode(guard.data())?;
        if next_page.header.num_tuples == 0 {
            Ok(None)
        } else {
            Ok(Some(RecordId::new(next_page_id, 0)))
        }
    }

    /// Every non-tombstoned row, in heap order.
    pub fn live_tuples(&self) -> BurrowDBResult<Vec<(RecordId, Tuple)>> {
        let mut result = Vec::new();
        let mut next = self.get_first_rid()?;
        while let Some(rid) = next {
            let (meta, tuple) = self.full_tuple(rid)?;
            if !meta.is_deleted {
                result.push((rid, tuple));
            }
            next = self.get_next_rid(rid)?;
        }
        Ok(result)
    }
}
