use std::collections::VecDeque;
use std::marker::PhantomData;
use std::sync::Arc;

use log::trace;

use crate::buffer::{
    BufferPoolManager, PageId, ReadPageGuard, WritePageGuard, INVALID_PAGE_ID, PAGE_SIZE,
};
use crate::error::{BurrowDBError, BurrowDBResult};
use crate::storage::codec::{
    BPlusTreeHeaderPageCodec, BPlusTreeInternalPageCodec, BPlusTreeLeafPageCodec,
    BPlusTreePageCodec, RidCodec,
};
use crate::storage::index::{decode_key, IndexKey, IndexWriteUndo};
use crate::storage::page::{
    BPlusTreeHeaderPage, BPlusTreeInternalPage, BPlusTreeLeafPage, BPlusTreePage, RecordId,
};
use crate::transaction::{Transaction, TransactionState};

/// Write latches held along a pessimistic descent, header page first. When a
/// node proves safe for the operation every ancestor is dropped at once.
#[derive(Debug)]
struct Context {
    header_guard: Option<WritePageGuard>,
    write_set: VecDeque<WritePageGuard>,
}

impl Context {
    fn new() -> Self {
        Self {
            header_guard: None,
            write_set: VecDeque::new(),
        }
    }

    fn release_ancestors(&mut self) {
        self.write_set.clear();
        self.header_guard = None;
    }
}

enum OptimisticInsert {
    Inserted,
    Duplicate,
    NeedsPessimistic,
}

/// Concurrent B+ tree mapping fixed-width keys to RIDs on top of the buffer
/// pool. Readers crab with read latches; writers go optimistic first and
/// fall back to a pessimistic descent that write-latches from the header
/// page down.
#[derive(Debug)]
pub struct BPlusTreeIndex<K: IndexKey> {
    pub buffer_pool: Arc<BufferPoolManager>,
    pub leaf_max_size: u32,
    pub internal_max_size: u32,
    pub header_page_id: PageId,
    _marker: PhantomData<K>,
}

impl<K: IndexKey> BPlusTreeIndex<K> {
    pub fn new(
        buffer_pool: Arc<BufferPoolManager>,
        internal_max_size: u32,
        leaf_max_size: u32,
    ) -> BurrowDBResult<Self> {
        let mut header_guard = buffer_pool.new_page()?;
        let header_page_id = header_guard.page_id();
        header_guard.overwrite(&BPlusTreeHeaderPageCodec::encode(&BPlusTreeHeaderPage {
            root_page_id: INVALID_PAGE_ID,
        }));
        drop(header_guard);

        Ok(Self::open(
            buffer_pool,
            internal_max_size,
            leaf_max_size,
            header_page_id,
        ))
    }

    pub fn new_with_config(
        buffer_pool: Arc<BufferPoolManager>,
        config: crate::config::BTreeConfig,
    ) -> BurrowDBResult<Self> {
        Self::new(buffer_pool, config.internal_max_size, config.leaf_max_size)
    }

    /// Attach to an existing tree through its header page.
    pub fn open(
        buffer_pool: Arc<BufferPoolManager>,
        internal_max_size: u32,
        leaf_max_size: u32,
        header_page_id: PageId,
    ) -> Self {
        let leaf_fit = ((PAGE_SIZE - 16) / (K::ENCODED_SIZE + RidCodec::SIZE)) as u32;
        let internal_fit = ((PAGE_SIZE - 12) / (K::ENCODED_SIZE + 4)) as u32;
        let leaf_max_size = leaf_max_size.min(leaf_fit);
        let internal_max_size = internal_max_size.min(internal_fit);
        assert!(leaf_max_size >= 2, "leaf_max_size must be at least 2");
        assert!(
            internal_max_size >= 3,
            "internal_max_size must be at least 3"
        );

        Self {
            buffer_pool,
            leaf_max_size,
            internal_max_size,
            header_page_id,
            _marker: PhantomData,
        }
    }

    pub fn get_root_page_id(&self) -> BurrowDBResult<PageId> {
        let header_guard = self.buffer_pool.fetch_page_read(self.header_page_id)?;
        let (header, _) = BPlusTreeHeaderPageCodec::decode(header_guard.data())?;
        Ok(header.root_page_id)
    }

    pub fn is_empty(&self) -> BurrowDBResult<bool> {
        Ok(self.get_root_page_id()? == INVALID_PAGE_ID)
    }

    /// Point lookup via read-latch crabbing: the child is latched before the
    /// parent is released, so no descent ever sees a half-restructured path.
    pub fn get(&self, key: &K) -> BurrowDBResult<Option<RecordId>> {
        let header_guard = self.buffer_pool.fetch_page_read(self.header_page_id)?;
        let (header, _) = BPlusTreeHeaderPageCodec::decode(header_guard.data())?;
        if header.root_page_id == INVALID_PAGE_ID {
            return Ok(None);
        }
        let mut current_guard = self.buffer_pool.fetch_page_read(header.root_page_id)?;
        drop(header_guard);

        loop {
            let (page, _) = BPlusTreePageCodec::decode::<K>(current_guard.data())?;
            match page {
                BPlusTreePage::Internal(internal) => {
                    let child_guard = self.buffer_pool.fetch_page_read(internal.look_up(key))?;
                    current_guard = child_guard;
                }
                BPlusTreePage::Leaf(leaf) => return Ok(leaf.look_up(key)),
            }
        }
    }

    pub fn insert(&self, key: &K, rid: RecordId) -> BurrowDBResult<()> {
        self.insert_inner(key, rid, None)
    }

    pub fn insert_with_txn(
        &self,
        key: &K,
        rid: RecordId,
        txn: &Transaction,
    ) -> BurrowDBResult<()> {
        self.insert_inner(key, rid, Some(txn))
    }

    fn insert_inner(
        &self,
        key: &K,
        rid: RecordId,
        txn: Option<&Transaction>,
    ) -> BurrowDBResult<()> {
        check_unwind(txn)?;

        match self.insert_optimistic(key, rid)? {
            OptimisticInsert::Inserted => return Ok(()),
            OptimisticInsert::Duplicate => {
                return Err(BurrowDBError::DuplicateKey(format!("{:?}", key)))
            }
            OptimisticInsert::NeedsPessimistic => {}
        }

        check_unwind(txn)?;
        self.insert_pessimistic(key, rid)
    }

    /// Read-latch the descent path and write-latch only the target leaf.
    /// Succeeds when the leaf has room; anything structural bails out.
    fn insert_optimistic(&self, key: &K, rid: RecordId) -> BurrowDBResult<OptimisticInsert> {
        let header_guard = self.buffer_pool.fetch_page_read(self.header_page_id)?;
        let (header, _) = BPlusTreeHeaderPageCodec::decode(header_guard.data())?;
        if header.root_page_id == INVALID_PAGE_ID {
            return Ok(OptimisticInsert::NeedsPessimistic);
        }
        let mut parent_guard = self.buffer_pool.fetch_page_read(header.root_page_id)?;
        drop(header_guard);

        loop {
            let (page, _) = BPlusTreePageCodec::decode::<K>(parent_guard.data())?;
            let internal = match page {
                BPlusTreePage::Internal(internal) => internal,
                // A root that is still a leaf needs the full write path.
                BPlusTreePage::Leaf(_) => return Ok(OptimisticInsert::NeedsPessimistic),
            };

            let child_id = internal.look_up(key);
            let child_guard = self.buffer_pool.fetch_page_read(child_id)?;
            let (child, _) = BPlusTreePageCodec::decode::<K>(child_guard.data())?;
            match child {
                BPlusTreePage::Internal(_) => {
                    parent_guard = child_guard;
                }
                BPlusTreePage::Leaf(_) => {
                    // Holding the parent's read latch pins the leaf's key
                    // range: no writer can split it until we are done.
                    drop(child_guard);
                    let mut leaf_guard = self.buffer_pool.fetch_page_write(child_id)?;
                    let (mut leaf, _) =
                        BPlusTreeLeafPageCodec::decode::<K>(leaf_guard.data())?;
                    if leaf.look_up(key).is_some() {
                        return Ok(OptimisticInsert::Duplicate);
                    }
                    if leaf.header.current_size >= leaf.header.max_size {
                        return Ok(OptimisticInsert::NeedsPessimistic);
                    }
                    leaf.insert(key.clone(), rid);
                    leaf_guard.overwrite(&BPlusTreeLeafPageCodec::encode(&leaf));
                    return Ok(OptimisticInsert::Inserted);
                }
            }
        }
    }

    fn insert_pessimistic(&self, key: &K, rid: RecordId) -> BurrowDBResult<()> {
        let mut context = Context::new();
        let mut header_guard = self.buffer_pool.fetch_page_write(self.header_page_id)?;
        let (header, _) = BPlusTreeHeaderPageCodec::decode(header_guard.data())?;

        if header.root_page_id == INVALID_PAGE_ID {
            return self.start_new_tree(header_guard, key, rid);
        }
        context.header_guard = Some(header_guard);
        let mut current_guard = self.buffer_pool.fetch_page_write(header.root_page_id)?;

        loop {
            let (page, _) = BPlusTreePageCodec::decode::<K>(current_guard.data())?;
            match page {
                BPlusTreePage::Internal(internal) => {
                    let child_id = internal.look_up(key);
                    let child_guard = self.buffer_pool.fetch_page_write(child_id)?;
                    let (child, _) = BPlusTreePageCodec::decode::<K>(child_guard.data())?;
                    context.write_set.push_back(current_guard);
                    if child.is_safe_for_insert() {
                        context.release_ancestors();
                    }
                    current_guard = child_guard;
                }
                BPlusTreePage::Leaf(mut leaf) => {
                    if leaf.look_up(key).is_some() {
                        return Err(BurrowDBError::DuplicateKey(format!("{:?}", key)));
                    }
                    leaf.insert(key.clone(), rid);
                    if !leaf.is_overflow() {
                        current_guard.overwrite(&BPlusTreeLeafPageCodec::encode(&leaf));
                        return Ok(());
                    }
                    return self.split_leaf_and_propagate(current_guard, leaf, context);
                }
            }
        }
    }

    /// First key of an empty tree: install a root leaf under the header
    /// page's write latch.
    fn start_new_tree(
        &self,
        mut header_guard: WritePageGuard,
        key: &K,
        rid: RecordId,
    ) -> BurrowDBResult<()> {
        let mut root_guard = self.buffer_pool.new_page()?;
        let root_page_id = root_guard.page_id();
        let mut leaf = BPlusTreeLeafPage::new(self.leaf_max_size);
        leaf.insert(key.clone(), rid);
        root_guard.overwrite(&BPlusTreeLeafPageCodec::encode(&leaf));
        drop(root_guard);

        header_guard.overwrite(&BPlusTreeHeaderPageCodec::encode(&BPlusTreeHeaderPage {
            root_page_id,
        }));
        trace!("btree: new root leaf {}", root_page_id);
        Ok(())
    }

    /// Split an overflowing leaf, then push separators upward while parents
    /// overflow. Each node is split in memory before its page is written, so
    /// an over-full image never reaches a frame.
    fn split_leaf_and_propagate(
        &self,
        mut leaf_guard: WritePageGuard,
        mut leaf: BPlusTreeLeafPage<K>,
        mut context: Context,
    ) -> BurrowDBResult<()> {
        let mut new_leaf_guard = self.buffer_pool.new_page()?;
        let new_leaf_id = new_leaf_guard.page_id();

        let split_at = leaf.header.current_size as usize / 2;
        let mut new_leaf = BPlusTreeLeafPage::new(self.leaf_max_size);
        new_leaf.extend(leaf.split_off(split_at));
        new_leaf.header.next_page_id = leaf.header.next_page_id;
        leaf.header.next_page_id = new_leaf_id;
        let mut separator = new_leaf.key_at(0).clone();

        new_leaf_guard.overwrite(&BPlusTreeLeafPageCodec::encode(&new_leaf));
        leaf_guard.overwrite(&BPlusTreeLeafPageCodec::encode(&leaf));
        let mut left_id = leaf_guard.page_id();
        let mut right_id = new_leaf_id;
        trace!("btree: leaf {} split, new leaf {}", left_id, right_id);
        drop(new_leaf_guard);
        drop(leaf_guard);

        loop {
            let Some(mut parent_guard) = context.write_set.pop_back() else {
                // The split reached the top of the latched path, so the left
                // node is the root and the header latch is still ours.
                return self.install_new_root(left_id, separator, right_id, context);
            };

            let (mut parent, _) = BPlusTreeInternalPageCodec::decode::<K>(parent_guard.data())?;
            parent.insert_after(left_id, separator, right_id);
            if !parent.is_overflow() {
                parent_guard.overwrite(&BPlusTreeInternalPageCodec::encode(&parent));
                return Ok(());
            }

            // Promote the median; the right half keeps the sentinel shape.
            let num_pointers = parent.header.current_size as usize;
            let promote_idx = 1 + (num_pointers - 1) / 2;
            let mut moved = parent.split_off(promote_idx);
            let middle_key = moved[0].0.clone();
            let mut new_internal = BPlusTreeInternalPage::new(self.internal_max_size);
            new_internal.init_sentinel(moved[0].1);
            if moved.len() > 1 {
                new_internal.extend(moved.split_off(1));
            }

            let mut new_internal_guard = self.buffer_pool.new_page()?;
            let new_internal_id = new_internal_guard.page_id();
            new_internal_guard.overwrite(&BPlusTreeInternalPageCodec::encode(&new_internal));
            parent_guard.overwrite(&BPlusTreeInternalPageCodec::encode(&parent));
            trace!(
                "btree: internal {} split, new internal {}",
                parent_guard.page_id(),
                new_internal_id
            );

            left_id = parent_guard.page_id();
            right_id = new_internal_id;
            separator = middle_key;
            drop(new_internal_guard);
            drop(parent_guard);
        }
    }

    fn install_new_root(
        &self,
        left_id: PageId,
        separator: K,
        right_id: PageId,
        mut context: Context,
    ) -> BurrowDBResult<()> {
        let Some(mut header_guard) = context.header_guard.take() else {
            return Err(BurrowDBError::Internal(
                "root split without the header latch".to_string(),
            ));
        };
        let mut new_root_guard = self.buffer_pool.new_page()?;
        let root_page_id = new_root_guard.page_id();
        let mut new_root = BPlusTreeInternalPage::new(self.internal_max_size);
        new_root.init_sentinel(left_id);
        new_root.insert_after(left_id, separator, right_id);
        new_root_guard.overwrite(&BPlusTreeInternalPageCodec::encode(&new_root));
        drop(new_root_guard);

        header_guard.overwrite(&BPlusTreeHeaderPageCodec::encode(&BPlusTreeHeaderPage {
            root_page_id,
        }));
        trace!("btree: new root internal {}", root_page_id);
        Ok(())
    }

    pub fn remove(&self, key: &K) -> BurrowDBResult<()> {
        self.remove_inner(key, None)
    }

    pub fn remove_with_txn(&self, key: &K, txn: &Transaction) -> BurrowDBResult<()> {
        self.remove_inner(key, Some(txn))
    }

    /// Pessimistic descent with write latches, releasing ancestors once a
    /// node can lose an entry without underflowing.
    fn remove_inner(&self, key: &K, txn: Option<&Transaction>) -> BurrowDBResult<()> {
        check_unwind(txn)?;

        let mut context = Context::new();
        let header_guard = self.buffer_pool.fetch_page_write(self.header_page_id)?;
        let (header, _) = BPlusTreeHeaderPageCodec::decode(header_guard.data())?;
        if header.root_page_id == INVALID_PAGE_ID {
            return Ok(());
        }
        context.header_guard = Some(header_guard);
        let mut current_guard = self.buffer_pool.fetch_page_write(header.root_page_id)?;

        loop {
            let (page, _) = BPlusTreePageCodec::decode::<K>(current_guard.data())?;
            match page {
                BPlusTreePage::Internal(internal) => {
                    let child_id = internal.look_up(key);
                    let child_guard = self.buffer_pool.fetch_page_write(child_id)?;
                    let (child, _) = BPlusTreePageCodec::decode::<K>(child_guard.data())?;
                    context.write_set.push_back(current_guard);
                    if child.is_safe_for_delete() {
                        context.release_ancestors();
                    }
                    current_guard = child_guard;
                }
                BPlusTreePage::Leaf(mut leaf) => {
                    if leaf.delete(key).is_none() {
                        return Ok(());
                    }

                    let is_root =
                        context.write_set.is_empty() && context.header_guard.is_some();
                    if is_root {
                        if leaf.header.current_size == 0 {
                            return self.reset_empty_root(current_guard, context);
                        }
                        current_guard.overwrite(&BPlusTreeLeafPageCodec::encode(&leaf));
                        return Ok(());
                    }

                    current_guard.overwrite(&BPlusTreeLeafPageCodec::encode(&leaf));
                    if leaf.header.current_size >= leaf.min_size() {
                        return Ok(());
                    }
                    return self.handle_underflow(
                        current_guard,
                        BPlusTreePage::Leaf(leaf),
                        &mut context,
                    );
                }
            }
        }
    }

    /// The last key left the root leaf: the tree is empty again.
    fn reset_empty_root(
        &self,
        root_guard: WritePageGuard,
        mut context: Context,
    ) -> BurrowDBResult<()> {
        let root_page_id = root_guard.page_id();
        drop(root_guard);
        let Some(mut header_guard) = context.header_guard.take() else {
            return Err(BurrowDBError::Internal(
                "root reset without the header latch".to_string(),
            ));
        };
        header_guard.overwrite(&BPlusTreeHeaderPageCodec::encode(&BPlusTreeHeaderPage {
            root_page_id: INVALID_PAGE_ID,
        }));
        drop(header_guard);
        let _ = self.buffer_pool.delete_page(root_page_id)?;
        trace!("btree: tree emptied, root {} freed", root_page_id);
        Ok(())
    }

    /// Rebalance an underflowing node: borrow from the right sibling, then
    /// the left; otherwise merge with the right sibling when present, else
    /// the left. Merges can cascade into the parent.
    fn handle_underflow(
        &self,
        node_guard: WritePageGuard,
        node: BPlusTreePage<K>,
        context: &mut Context,
    ) -> BurrowDBResult<()> {
        let Some(mut parent_guard) = context.write_set.pop_back() else {
            return Err(BurrowDBError::Internal(
                "underflow without a latched parent".to_string(),
            ));
        };
        let (mut parent, _) = BPlusTreeInternalPageCodec::decode::<K>(parent_guard.data())?;
        let node_id = node_guard.page_id();
        let Some(node_idx) = parent.value_index(node_id) else {
            return Err(BurrowDBError::Internal(format!(
                "underflow: node {} missing from its parent",
                node_id
            )));
        };

        let right_id = if node_idx + 1 < parent.header.current_size as usize {
            Some(parent.value_at(node_idx + 1))
        } else {
            None
        };
        let left_id = if node_idx > 0 {
            Some(parent.value_at(node_idx - 1))
        } else {
            None
        };

        let mut node_guard = node_guard;
        let mut node = node;

        // Borrow from the right sibling.
        if let Some(right_id) = right_id {
            let mut right_guard = self.buffer_pool.fetch_page_write(right_id)?;
            let (mut right, _) = BPlusTreePageCodec::decode::<K>(right_guard.data())?;
            if right.can_lend() {
                self.borrow_from_right(&mut node, &mut right, &mut parent, node_idx)?;
                node_guard.overwrite(&BPlusTreePageCodec::encode(&node));
                right_guard.overwrite(&BPlusTreePageCodec::encode(&right));
                parent_guard.overwrite(&BPlusTreeInternalPageCodec::encode(&parent));
                return Ok(());
            }
        }

        // Borrow from the left sibling.
        if let Some(left_id) = left_id {
            let mut left_guard = self.buffer_pool.fetch_page_write(left_id)?;
            let (mut left, _) = BPlusTreePageCodec::decode::<K>(left_guard.data())?;
            if left.can_lend() {
                self.borrow_from_left(&mut node, &mut left, &mut parent, node_idx)?;
                node_guard.overwrite(&BPlusTreePageCodec::encode(&node));
                left_guard.overwrite(&BPlusTreePageCodec::encode(&left));
                parent_guard.overwrite(&BPlusTreeInternalPageCodec::encode(&parent));
                return Ok(());
            }
        }

        // Neither sibling can lend; merge. The surviving node is the left
        // one of the pair.
        if let Some(right_id) = right_id {
            let right_guard = self.buffer_pool.fetch_page_write(right_id)?;
            let (mut right, _) = BPlusTreePageCodec::decode::<K>(right_guard.data())?;
            let Some(middle_key) = parent.remove_entry_for(right_id) else {
                return Err(BurrowDBError::Internal(
                    "merge: right sibling missing from parent".to_string(),
                ));
            };
            self.merge_pages(&mut node, &mut right, middle_key)?;
            node_guard.overwrite(&BPlusTreePageCodec::encode(&node));
            drop(right_guard);
            let _ = self.buffer_pool.delete_page(right_id)?;
            trace!("btree: merged {} into {}", right_id, node_id);
        } else if let Some(left_id) = left_id {
            let mut left_guard = self.buffer_pool.fetch_page_write(left_id)?;
            let (mut left, _) = BPlusTreePageCodec::decode::<K>(left_guard.data())?;
            let Some(middle_key) = parent.remove_entry_for(node_id) else {
                return Err(BurrowDBError::Internal(
                    "merge: node missing from parent".to_string(),
                ));
            };
            self.merge_pages(&mut left, &mut node, middle_key)?;
            left_guard.overwrite(&BPlusTreePageCodec::encode(&left));
            drop(node_guard);
            let _ = self.buffer_pool.delete_page(node_id)?;
            trace!("btree: merged {} into {}", node_id, left_id);
        } else {
            return Err(BurrowDBError::Internal(
                "underflowing node has no siblings".to_string(),
            ));
        }

        // The parent lost an entry; it may shrink the tree or cascade.
        let parent_is_root = context.write_set.is_empty() && context.header_guard.is_some();
        if parent_is_root {
            if parent.header.current_size == 1 {
                return self.adopt_single_child_root(parent_guard, &parent, context);
            }
            parent_guard.overwrite(&BPlusTreeInternalPageCodec::encode(&parent));
            return Ok(());
        }

        parent_guard.overwrite(&BPlusTreeInternalPageCodec::encode(&parent));
        if parent.header.current_size < parent.min_size() {
            return self.handle_underflow(parent_guard, BPlusTreePage::Internal(parent), context);
        }
        Ok(())
    }

    fn borrow_from_right(
        &self,
        node: &mut BPlusTreePage<K>,
        right: &mut BPlusTreePage<K>,
        parent: &mut BPlusTreeInternalPage<K>,
        node_idx: usize,
    ) -> BurrowDBResult<()> {
        let separator_idx = node_idx + 1;
        match (node, right) {
            (BPlusTreePage::Leaf(node), BPlusTreePage::Leaf(right)) => {
                let (key, rid) = right.remove_first_kv();
                node.array.push((key, rid));
                node.header.current_size += 1;
                parent.set_key_at(separator_idx, right.key_at(0).clone());
            }
            (BPlusTreePage::Internal(node), BPlusTreePage::Internal(right)) => {
                // The parent separator travels down onto the right node's
                // sentinel child; the right node's first real key replaces it.
                let separator = parent.key_at(separator_idx).clone();
                let (_, transferred_child) = right.remove_first_kv();
                node.array.push((separator, transferred_child));
                node.header.current_size += 1;
                parent.set_key_at(separator_idx, right.key_at(0).clone());
            }
            _ => {
                return Err(BurrowDBError::Internal(
                    "borrow: sibling kinds differ".to_string(),
                ))
            }
        }
        Ok(())
    }

    fn borrow_from_left(
        &self,
        node: &mut BPlusTreePage<K>,
        left: &mut BPlusTreePage<K>,
        parent: &mut BPlusTreeInternalPage<K>,
        node_idx: usize,
    ) -> BurrowDBResult<()> {
        let separator_idx = node_idx;
        match (node, left) {
            (BPlusTreePage::Leaf(node), BPlusTreePage::Leaf(left)) => {
                let (key, rid) = left.remove_last_kv();
                parent.set_key_at(separator_idx, key.clone());
                node.array.insert(0, (key, rid));
                node.header.current_size += 1;
            }
            (BPlusTreePage::Internal(node), BPlusTreePage::Internal(left)) => {
                // The old sentinel child gets the parent separator as its
                // key; the moved child becomes the new sentinel.
                let separator = parent.key_at(separator_idx).clone();
                let (moved_key, moved_child) = left.remove_last_kv();
                node.array[0].0 = separator;
                node.array.insert(0, (K::default(), moved_child));
                node.header.current_size += 1;
                parent.set_key_at(separator_idx, moved_key);
            }
            _ => {
                return Err(BurrowDBError::Internal(
                    "borrow: sibling kinds differ".to_string(),
                ))
            }
        }
        Ok(())
    }

    fn merge_pages(
        &self,
        left: &mut BPlusTreePage<K>,
        right: &mut BPlusTreePage<K>,
        middle_key: K,
    ) -> BurrowDBResult<()> {
        match (left, right) {
            (BPlusTreePage::Leaf(left), BPlusTreePage::Leaf(right)) => {
                left.merge(right);
            }
            (BPlusTreePage::Internal(left), BPlusTreePage::Internal(right)) => {
                left.merge(middle_key, right);
            }
            _ => {
                return Err(BurrowDBError::Internal(
                    "merge: sibling kinds differ".to_string(),
                ))
            }
        }
        Ok(())
    }

    /// The root internal collapsed to one child: that child becomes the new
    /// root and the tree loses a level.
    fn adopt_single_child_root(
        &self,
        root_guard: WritePageGuard,
        root: &BPlusTreeInternalPage<K>,
        context: &mut Context,
    ) -> BurrowDBResult<()> {
        let new_root_id = root.value_at(0);
        let old_root_id = root_guard.page_id();
        drop(root_guard);
        let Some(mut header_guard) = context.header_guard.take() else {
            return Err(BurrowDBError::Internal(
                "root adoption without the header latch".to_string(),
            ));
        };
        header_guard.overwrite(&BPlusTreeHeaderPageCodec::encode(&BPlusTreeHeaderPage {
            root_page_id: new_root_id,
        }));
        drop(header_guard);
        let _ = self.buffer_pool.delete_page(old_root_id)?;
        trace!("btree: root {} adopted child {}", old_root_id, new_root_id);
        Ok(())
    }

    /// Leftmost leaf, read latched. None when the tree is empty.
    pub(crate) fn find_first_leaf(&self) -> BurrowDBResult<Option<ReadPageGuard>> {
        let header_guard = self.buffer_pool.fetch_page_read(self.header_page_id)?;
        let (header, _) = BPlusTreeHeaderPageCodec::decode(header_guard.data())?;
        if header.root_page_id == INVALID_PAGE_ID {
            return Ok(None);
        }
        let mut current_guard = self.buffer_pool.fetch_page_read(header.root_page_id)?;
        drop(header_guard);
        loop {
            let (page, _) = BPlusTreePageCodec::decode::<K>(current_guard.data())?;
            match page {
                BPlusTreePage::Internal(internal) => {
                    current_guard = self.buffer_pool.fetch_page_read(internal.value_at(0))?;
                }
                BPlusTreePage::Leaf(_) => return Ok(Some(current_guard)),
            }
        }
    }

    /// Leaf that covers `key`, read latched. None when the tree is empty.
    pub(crate) fn find_leaf_read(&self, key: &K) -> BurrowDBResult<Option<ReadPageGuard>> {
        let header_guard = self.buffer_pool.fetch_page_read(self.header_page_id)?;
        let (header, _) = BPlusTreeHeaderPageCodec::decode(header_guard.data())?;
        if header.root_page_id == INVALID_PAGE_ID {
            return Ok(None);
        }
        let mut current_guard = self.buffer_pool.fetch_page_read(header.root_page_id)?;
        drop(header_guard);
        loop {
            let (page, _) = BPlusTreePageCodec::decode::<K>(current_guard.data())?;
            match page {
                BPlusTreePage::Internal(internal) => {
                    current_guard = self.buffer_pool.fetch_page_read(internal.look_up(key))?;
                }
                BPlusTreePage::Leaf(_) => return Ok(Some(current_guard)),
            }
        }
    }
}

impl<K: IndexKey> IndexWriteUndo for BPlusTreeIndex<K> {
    fn insert_encoded(&self, key: &[u8], rid: RecordId) -> BurrowDBResult<()> {
        let key = decode_key::<K>(key)?;
        match self.insert(&key, rid) {
            // Undo re-inserts may race an entry that never left; that is fine.
            Err(BurrowDBError::DuplicateKey(_)) => Ok(()),
            other => other,
        }
    }

    fn remove_encoded(&self, key: &[u8]) -> BurrowDBResult<()> {
        self.remove(&decode_key::<K>(key)?)
    }
}

fn check_unwind(txn: Option<&Transaction>) -> BurrowDBResult<()> {
    if let Some(txn) = txn {
        if txn.state() == TransactionState::Aborted {
            return Err(BurrowDBError::Unwind);
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::disk_manager::DiskManager;
    use crate::storage::disk_scheduler::DiskScheduler;
    use crate::storage::index::TreeIndexIterator;
    use parking_lot::deadlock;
    use std::sync::{Arc, Barrier, Once};
    use std::time::Duration;
    use tempfile::TempDir;

    fn ensure_deadlock_watchdog() {
        static START: Once = Once::new();
        START.call_once(|| {
            std::thread::spawn(|| loop {
                std::thread::sleep(Duration::from_millis(500));
                let deadlocks = deadlock::check_deadlock();
                if !deadlocks.is_empty() {
                    eprintln!("DEADLOCK DETECTED: {} cycles", deadlocks.len());
                    for (i, threads) in deadlocks.iter().enumerate() {
                        eprintln!("Cycle {}:", i);
                        for t in threads {
                            eprintln!("  ThreadId={:?}\n{:?}", t.thread_id(), t.backtrace());
                        }
                    }
                    panic!("deadlock detected");
                }
            });
        });
    }

    fn create_test_index(
        buffer_pool_size: usize,
        internal_max_size: u32,
        leaf_max_size: u32,
    ) -> (TempDir, BPlusTreeIndex<i64>) {
        let temp_dir = TempDir::new().unwrap();
        let disk_manager = DiskManager::try_new(temp_dir.path().join("index.db")).unwrap();
        let disk_scheduler = Arc::new(DiskScheduler::new(Arc::new(disk_manager)));
        let buffer_pool = Arc::new(BufferPoolManager::new(buffer_pool_size, disk_scheduler));
        let index = BPlusTreeIndex::new(buffer_pool, internal_max_size, leaf_max_size).unwrap();
        (temp_dir, index)
    }

    fn rid_from_key(key: i64) -> RecordId {
        RecordId::new((key >> 32) as u32, (key & 0xFFFF_FFFF) as u32)
    }

    #[test]
    fn basic_insert() {
        let (_temp_dir, index) = create_test_index(50, 4, 4);
        index.insert(&42, rid_from_key(42)).unwrap();

        let root_page_id = index.get_root_page_id().unwrap();
        assert_ne!(root_page_id, INVALID_PAGE_ID);
        assert_eq!(index.get(&42).unwrap(), Some(rid_from_key(42)));
        assert_eq!(index.get(&41).unwrap(), None);
    }

    #[test]
    fn duplicate_insert_fails_without_mutation() {
        let (_temp_dir, index) = create_test_index(50, 4, 4);
        index.insert(&7, rid_from_key(7)).unwrap();
        let err = index.insert(&7, RecordId::new(9, 9)).unwrap_err();
        assert!(matches!(err, BurrowDBError::DuplicateKey(_)));
        // The original mapping is untouched.
        assert_eq!(index.get(&7).unwrap(), Some(rid_from_key(7)));
    }

    #[test]
    fn first_split_produces_expected_shape() {
        // leaf_max = 3, internal_max = 3: inserting 1..=3 keeps a root leaf,
        // inserting 4 splits it into [1,2] and [3,4] under a new root with
        // separator 3.
        let (_temp_dir, index) = create_test_index(50, 3, 3);
        for key in 1..=3i64 {
            index.insert(&key, rid_from_key(key)).unwrap();
        }
        {
            let root_guard = index
                .buffer_pool
                .fetch_page_read(index.get_root_page_id().unwrap())
                .unwrap();
            let (root, _) = BPlusTreePageCodec::decode::<i64>(root_guard.data()).unwrap();
            let BPlusTreePage::Leaf(leaf) = root else {
                panic!("root should still be a leaf");
            };
            assert_eq!(leaf.header.current_size, 3);
        }

        index.insert(&4, rid_from_key(4)).unwrap();
        let root_guard = index
            .buffer_pool
            .fetch_page_read(index.get_root_page_id().unwrap())
            .unwrap();
        let (root, _) = BPlusTreePageCodec::decode::<i64>(root_guard.data()).unwrap();
        let BPlusTreePage::Internal(root) = root else {
            panic!("root should be internal after the split");
        };
        assert_eq!(root.header.current_size, 2);
        assert_eq!(*root.key_at(1), 3);

        let left_guard = index.buffer_pool.fetch_page_read(root.value_at(0)).unwrap();
        let (left, _) = BPlusTreeLeafPageCodec::decode::<i64>(left_guard.data()).unwrap();
        assert_eq!(left.array.iter().map(|(k, _)| *k).collect::<Vec<_>>(), [1, 2]);
        let right_guard = index.buffer_pool.fetch_page_read(root.value_at(1)).unwrap();
        let (right, _) = BPlusTreeLeafPageCodec::decode::<i64>(right_guard.data()).unwrap();
        assert_eq!(
            right.array.iter().map(|(k, _)| *k).collect::<Vec<_>>(),
            [3, 4]
        );

        for key in 1..=4i64 {
            assert_eq!(index.get(&key).unwrap(), Some(rid_from_key(key)));
        }
    }

    #[test]
    fn insert_reverse_order_and_iterate() {
        let (_temp_dir, index) = create_test_index(50, 3, 3);
        for key in (1..=64i64).rev() {
            index.insert(&key, rid_from_key(key)).unwrap();
        }
        for key in 1..=64i64 {
            assert_eq!(index.get(&key).unwrap(), Some(rid_from_key(key)), "key {}", key);
        }

        let index = Arc::new(index);
        let mut iter = TreeIndexIterator::new(index, ..);
        let mut expected = 1i64;
        while let Some((key, rid)) = iter.next().unwrap() {
            assert_eq!(key, expected);
            assert_eq!(rid, rid_from_key(expected));
            expected += 1;
        }
        assert_eq!(expected, 65);
    }

    #[test]
    fn delete_until_empty() {
        let (_temp_dir, index) = create_test_index(50, 3, 3);
        let keys = [1i64, 2, 3, 4, 5];
        for key in keys {
            index.insert(&key, rid_from_key(key)).unwrap();
        }

        for key in [1i64, 5, 3, 4] {
            index.remove(&key).unwrap();
        }
        assert_eq!(index.get(&2).unwrap(), Some(rid_from_key(2)));
        for key in [1i64, 3, 4, 5] {
            assert_eq!(index.get(&key).unwrap(), None);
        }

        index.remove(&2).unwrap();
        assert!(index.is_empty().unwrap());

        // Removing from an empty tree is a no-op, and the tree is reusable.
        index.remove(&2).unwrap();
        index.insert(&10, rid_from_key(10)).unwrap();
        assert_eq!(index.get(&10).unwrap(), Some(rid_from_key(10)));
    }

    #[test]
    fn delete_with_merges_keeps_order() {
        let (_temp_dir, index) = create_test_index(64, 3, 3);
        let keys: Vec<i64> = (-5..=14).collect();
        for key in &keys {
            index.insert(key, rid_from_key(*key)).unwrap();
        }
        for key in -5..=2i64 {
            index.remove(&key).unwrap();
        }

        for key in &keys {
            let got = index.get(key).unwrap();
            if *key <= 2 {
                assert_eq!(got, None, "key {} should be gone", key);
            } else {
                assert_eq!(got, Some(rid_from_key(*key)), "key {} should remain", key);
            }
        }

        let index = Arc::new(index);
        let mut iter = TreeIndexIterator::new(index, ..);
        let mut expected = 3i64;
        while let Some((key, _)) = iter.next().unwrap() {
            assert_eq!(key, expected);
            expected += 1;
        }
        assert_eq!(expected, 15);
    }

    #[test]
    fn random_churn_matches_reference_model() {
        use rand::prelude::*;
        let (_temp_dir, index) = create_test_index(128, 4, 4);
        let mut reference = std::collections::BTreeMap::new();
        let mut rng = StdRng::seed_from_u64(0xB7EE);

        for _ in 0..2000 {
            let key = rng.gen_range(0..300i64);
            if rng.gen_bool(0.6) {
                let inserted = index.insert(&key, rid_from_key(key));
                match reference.entry(key) {
                    std::collections::btree_map::Entry::Vacant(e) => {
                        inserted.unwrap();
                        e.insert(rid_from_key(key));
                    }
                    std::collections::btree_map::Entry::Occupied(_) => {
                        assert!(matches!(
                            inserted.unwrap_err(),
                            BurrowDBError::DuplicateKey(_)
                        ));
                    }
                }
            } else {
                index.remove(&key).unwrap();
                reference.remove(&key);
            }
        }

        for key in 0..300i64 {
            assert_eq!(index.get(&key).unwrap(), reference.get(&key).copied());
        }

        let index = Arc::new(index);
        let mut iter = TreeIndexIterator::new(index, ..);
        let mut seen = Vec::new();
        while let Some((key, _)) = iter.next().unwrap() {
            seen.push(key);
        }
        let expected: Vec<i64> = reference.keys().copied().collect();
        assert_eq!(seen, expected);
    }

    #[test]
    fn sequential_scale_with_small_pool() {
        let (_temp_dir, index) = create_test_index(16, 8, 8);
        for key in 1..=1000i64 {
            index.insert(&key, rid_from_key(key)).unwrap();
        }
        for key in 1..=1000i64 {
            assert_eq!(index.get(&key).unwrap(), Some(rid_from_key(key)));
        }
    }

    #[test]
    fn concurrent_insert_disjoint_partitions() {
        ensure_deadlock_watchdog();
        const THREADS: i64 = 4;
        const PER_THREAD: i64 = 500;
        let (_temp_dir, index) = create_test_index(256, 16, 16);
        let index = Arc::new(index);

        let barrier = Arc::new(Barrier::new(THREADS as usize));
        let mut handles = Vec::new();
        for t in 0..THREADS {
            let index = index.clone();
            let barrier = barrier.clone();
            handles.push(std::thread::spawn(move || {
                barrier.wait();
                for i in 0..PER_THREAD {
                    let key = t * PER_THREAD + i + 1;
                    index.insert(&key, rid_from_key(key)).unwrap();
                }
            }));
        }
        for handle in handles {
            handle.join().unwrap();
        }

        for key in 1..=THREADS * PER_THREAD {
            assert_eq!(index.get(&key).unwrap(), Some(rid_from_key(key)), "key {}", key);
        }

        // In-order iteration at quiescence sees every key, ascending.
        let mut iter = TreeIndexIterator::new(index.clone(), ..);
        let mut expected = 1i64;
        while let Some((key, _)) = iter.next().unwrap() {
            assert_eq!(key, expected);
            expected += 1;
        }
        assert_eq!(expected, THREADS * PER_THREAD + 1);
    }

    #[test]
    fn concurrent_lookups_during_inserts() {
        ensure_deadlock_watchdog();
        let (_temp_dir, index) = create_test_index(256, 8, 8);
        let index = Arc::new(index);

        // Pre-load a prefix readers can rely on.
        for key in 1..=200i64 {
            index.insert(&key, rid_from_key(key)).unwrap();
        }

        let writer = {
            let index = index.clone();
            std::thread::spawn(move || {
                for key in 201..=600i64 {
                    index.insert(&key, rid_from_key(key)).unwrap();
                }
            })
        };
        let mut readers = Vec::new();
        for _ in 0..3 {
            let index = index.clone();
            readers.push(std::thread::spawn(move || {
                for _ in 0..5 {
                    for key in 1..=200i64 {
                        assert_eq!(index.get(&key).unwrap(), Some(rid_from_key(key)));
                    }
                }
            }));
        }
        writer.join().unwrap();
        for reader in readers {
            reader.join().unwrap();
        }
        for key in 1..=600i64 {
            assert_eq!(index.get(&key).unwrap(), Some(rid_from_key(key)));
        }
    }

    #[test]
    fn iteration_during_inserts_stays_sorted() {
        ensure_deadlock_watchdog();
        let (_temp_dir, index) = create_test_index(256, 8, 8);
        let index = Arc::new(index);
        for key in (1..=300i64).step_by(3) {
            index.insert(&key, rid_from_key(key)).unwrap();
        }

        let writer = {
            let index = index.clone();
            std::thread::spawn(move || {
                for key in (2..=300i64).step_by(3) {
                    index.insert(&key, rid_from_key(key)).unwrap();
                }
            })
        };

        // The cursor is not serializable with the writer, but whatever it
        // yields must be strictly ascending and correctly mapped.
        for _ in 0..5 {
            let mut iter = TreeIndexIterator::new(index.clone(), ..);
            let mut last = i64::MIN;
            while let Some((key, rid)) = iter.next().unwrap() {
                assert!(key > last, "iterator went backwards: {} after {}", key, last);
                assert_eq!(rid, rid_from_key(key));
                last = key;
            }
        }
        writer.join().unwrap();

        // At quiescence every key that was ever inserted is visible.
        let mut iter = TreeIndexIterator::new(index.clone(), ..);
        let mut count = 0;
        while let Some((key, _)) = iter.next().unwrap() {
            assert!(key % 3 == 1 || key % 3 == 2);
            count += 1;
        }
        assert_eq!(count, 200);
    }

    #[test]
    fn concurrent_mixed_insert_delete() {
        ensure_deadlock_watchdog();
        let (_temp_dir, index) = create_test_index(256, 8, 8);
        let index = Arc::new(index);
        for key in 1..=400i64 {
            index.insert(&key, rid_from_key(key)).unwrap();
        }

        let deleter = {
            let index = index.clone();
            std::thread::spawn(move || {
                for key in 1..=200i64 {
                    index.remove(&key).unwrap();
                }
            })
        };
        let inserter = {
            let index = index.clone();
            std::thread::spawn(move || {
                for key in 401..=600i64 {
                    index.insert(&key, rid_from_key(key)).unwrap();
                }
            })
        };
        deleter.join().unwrap();
        inserter.join().unwrap();

        for key in 1..=200i64 {
            assert_eq!(index.get(&key).unwrap(), None);
        }
        for key in 201..=600i64 {
            assert_eq!(index.get(&key).unwrap(), Some(rid_from_key(key)));
        }
    }
}
