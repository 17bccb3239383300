use std::ops::{Bound, RangeBounds};
use std::sync::Arc;

use crate::buffer::{ReadPageGuard, INVALID_PAGE_ID};
use crate::error::BurrowDBResult;
use crate::storage::codec::BPlusTreeLeafPageCodec;
use crate::storage::index::{BPlusTreeIndex, IndexKey};
use crate::storage::page::RecordId;

/// Forward cursor over the leaf chain. Holds a read latch on one leaf at a
/// time, so it is not serializable with concurrent writers: entries are seen
/// as of each leaf's latch acquisition.
#[derive(Debug)]
pub struct TreeIndexIterator<K: IndexKey> {
    index: Arc<BPlusTreeIndex<K>>,
    start_bound: Bound<K>,
    end_bound: Bound<K>,
    current_guard: Option<ReadPageGuard>,
    cursor: usize,
    started: bool,
}

impl<K: IndexKey> TreeIndexIterator<K> {
    pub fn new<R: RangeBounds<K>>(index: Arc<BPlusTreeIndex<K>>, range: R) -> Self {
        Self {
            index,
            start_bound: range.start_bound().cloned(),
            end_bound: range.end_bound().cloned(),
            current_guard: None,
            cursor: 0,
            started: false,
        }
    }

    pub fn next(&mut self) -> BurrowDBResult<Option<(K, RecordId)>> {
        if !self.started {
            self.started = true;
            match self.start_bound.clone() {
                Bound::Included(key) => self.seek(&key, true)?,
                Bound::Excluded(key) => self.seek(&key, false)?,
                Bound::Unbounded => {
                    self.current_guard = self.index.find_first_leaf()?;
                    self.cursor = 0;
                }
            }
        }

        loop {
            let Some(guard) = self.current_guard.as_ref() else {
                return Ok(None);
            };
            let (leaf, _) = BPlusTreeLeafPageCodec::decode::<K>(guard.data())?;

            if self.cursor >= leaf.header.current_size as usize {
                let next_page_id = leaf.header.next_page_id;
                // Release the current leaf before latching the next one.
                self.current_guard = None;
                if next_page_id == INVALID_PAGE_ID {
                    return Ok(None);
                }
                self.current_guard = Some(self.index.buffer_pool.fetch_page_read(next_page_id)?);
                self.cursor = 0;
                continue;
            }

            let (key, rid) = leaf.kv_at(self.cursor).clone();
            let in_range = match &self.end_bound {
                Bound::Included(end) => key <= *end,
                Bound::Excluded(end) => key < *end,
                Bound::Unbounded => true,
            };
            if !in_range {
                self.current_guard = None;
                return Ok(None);
            }
            self.cursor += 1;
            return Ok(Some((key, rid)));
        }
    }

    fn seek(&mut self, key: &K, included: bool) -> BurrowDBResult<()> {
        let Some(guard) = self.index.find_leaf_read(key)? else {
            return Ok(());
        };
        let (leaf, _) = BPlusTreeLeafPageCodec::decode::<K>(guard.data())?;
        self.cursor = leaf
            .next_closest(key, included)
            .unwrap_or(leaf.header.current_size as usize);
        self.current_guard = Some(guard);
        Ok(())
    }
}
