//! BufferPoolManager pins and unpins pages, drives the LRU-K replacer, and
//! schedules disk I/O through the shared frame arena.

use std::sync::Arc;

use bytes::Bytes;
use dashmap::DashMap;
use parking_lot::Mutex;

use crate::buffer::buffer_pool::{BufferPool, FrameId};
use crate::buffer::page::{self, BasicPageGuard, PageId, ReadPageGuard, WritePageGuard, INVALID_PAGE_ID};
use crate::config::BufferPoolConfig;
use crate::error::{BurrowDBError, BurrowDBResult};
use crate::storage::disk_scheduler::DiskScheduler;
use crate::utils::cache::lru_k::LRUKReplacer;
use crate::utils::cache::Replacer;

#[derive(Debug)]
pub struct BufferPoolManager {
    pool: Arc<BufferPool>,
    replacer: Mutex<LRUKReplacer>,
    // One marker per page id being loaded or deleted, so a frame mid-install
    // is never observed by a second thread.
    inflight_loads: DashMap<PageId, Arc<Mutex<()>>>,
}

impl BufferPoolManager {
    pub fn new(num_pages: usize, disk_scheduler: Arc<DiskScheduler>) -> Self {
        Self::new_with_config(
            BufferPoolConfig {
                buffer_pool_size: num_pages,
                ..Default::default()
            },
            disk_scheduler,
        )
    }

    pub fn new_with_config(config: BufferPoolConfig, disk_scheduler: Arc<DiskScheduler>) -> Self {
        let pool = Arc::new(BufferPool::new(config.buffer_pool_size, disk_scheduler));
        let replacer = Mutex::new(LRUKReplacer::with_k(pool.capacity(), config.lru_k_k));
        Self {
            pool,
            replacer,
            inflight_loads: DashMap::new(),
        }
    }

    pub fn buffer_pool(&self) -> Arc<BufferPool> {
        self.pool.clone()
    }

    /// Allocate a fresh page pinned once and handed back behind a write
    /// latch. Fails only when every frame is pinned.
    pub fn new_page(self: &Arc<Self>) -> BurrowDBResult<WritePageGuard> {
        if !self.pool.has_free_frame() && self.replacer.lock().size() == 0 {
            return Err(BurrowDBError::Storage(
                "cannot allocate page: buffer pool is full and no frame is evictable".to_string(),
            ));
        }

        let frame_id = self.allocate_frame()?;
        let page_id = self.pool.allocate_page_id()?;
        self.pool.insert_mapping(page_id, frame_id);

        {
            let mut meta = self.pool.frame_meta(frame_id);
            meta.page_id = page_id;
            meta.pin_count = 1;
            meta.is_dirty = false;
        }
        self.pool.reset_frame(frame_id);
        self.replacer_record_access(frame_id);
        self.mark_non_evictable(frame_id);
        Ok(page::new_write_guard(Arc::clone(self), frame_id))
    }

    pub fn fetch_page_basic(self: &Arc<Self>, page_id: PageId) -> BurrowDBResult<BasicPageGuard> {
        let frame_id = self.pin_page(page_id)?;
        Ok(page::new_basic_guard(Arc::clone(self), frame_id))
    }

    pub fn fetch_page_read(self: &Arc<Self>, page_id: PageId) -> BurrowDBResult<ReadPageGuard> {
        let frame_id = self.pin_page(page_id)?;
        Ok(page::new_read_guard(Arc::clone(self), frame_id))
    }

    pub fn fetch_page_write(self: &Arc<Self>, page_id: PageId) -> BurrowDBResult<WritePageGuard> {
        let frame_id = self.pin_page(page_id)?;
        Ok(page::new_write_guard(Arc::clone(self), frame_id))
    }

    fn pin_page(&self, page_id: PageId) -> BurrowDBResult<FrameId> {
        if page_id == INVALID_PAGE_ID {
            return Err(BurrowDBError::Storage(
                "cannot fetch the invalid page".to_string(),
            ));
        }
        loop {
            let frame_id = self.ensure_frame(page_id)?;
            {
                // An eviction may have claimed the frame after the lookup;
                // its claim and this pin are ordered by the meta lock.
                let mut meta = self.pool.frame_meta(frame_id);
                if meta.page_id != page_id {
                    continue;
                }
                meta.pin_count += 1;
            }
            self.replacer_record_access(frame_id);
            self.mark_non_evictable(frame_id);
            return Ok(frame_id);
        }
    }

    /// Decrement the pin count; the dirty flag is OR-folded so a clean
    /// caller never clears a previous writer's mark. Returns false when the
    /// page is absent or already unpinned.
    pub fn complete_unpin(&self, page_id: PageId, is_dirty: bool) -> BurrowDBResult<bool> {
        let Some(frame_id) = self.pool.lookup_frame(page_id) else {
            return Ok(false);
        };
        let mut meta = self.pool.frame_meta(frame_id);
        if meta.pin_count == 0 {
            return Ok(false);
        }
        meta.pin_count -= 1;
        if is_dirty {
            meta.is_dirty = true;
        }
        let now_unpinned = meta.pin_count == 0;
        drop(meta);
        if now_unpinned {
            self.mark_evictable(frame_id);
        }
        Ok(true)
    }

    /// Write the current bytes back to disk and clear the dirty flag. No
    /// eviction happens.
    pub fn flush_page(&self, page_id: PageId) -> BurrowDBResult<bool> {
        let Some(frame_id) = self.pool.lookup_frame(page_id) else {
            return Ok(false);
        };
        let bytes = {
            let _latch = self.pool.frame_lock(frame_id).read();
            Bytes::copy_from_slice(unsafe { self.pool.frame_slice(frame_id) })
        };
        self.pool.write_page_to_disk(page_id, bytes)?;
        self.pool.frame_meta(frame_id).is_dirty = false;
        Ok(true)
    }

    pub fn flush_all_pages(&self) -> BurrowDBResult<()> {
        for page_id in self.pool.resident_page_ids() {
            self.flush_page(page_id)?;
        }
        Ok(())
    }

    /// Drop a page from memory and hand its id back to the disk allocator.
    /// Pinned pages are refused.
    pub fn delete_page(&self, page_id: PageId) -> BurrowDBResult<bool> {
        let (marker, _lock) = self.acquire_inflight(page_id);
        let result = self.delete_page_inner(page_id);
        drop(_lock);
        self.release_inflight(page_id, &marker);
        result
    }

    fn delete_page_inner(&self, page_id: PageId) -> BurrowDBResult<bool> {
        if let Some(frame_id) = self.pool.lookup_frame(page_id) {
            {
                // Claim the frame under the meta lock so a racing pin sees
                // the page gone and retries its lookup.
                let mut meta = self.pool.frame_meta(frame_id);
                if meta.page_id != page_id {
                    drop(meta);
                    self.pool.remove_mapping_if(page_id, frame_id);
                    return self.delete_page_inner(page_id);
                }
                if meta.pin_count > 0 {
                    return Ok(false);
                }
                meta.page_id = INVALID_PAGE_ID;
            }
            self.pool.remove_mapping_if(page_id, frame_id);
            self.pool.clear_frame_meta(frame_id);
            self.pool.reset_frame(frame_id);
            {
                let mut rep = self.replacer.lock();
                let _ = rep.set_evictable(frame_id, true);
                let _ = rep.remove(frame_id);
            }
            self.pool.push_free_frame(frame_id);
        }
        self.pool.deallocate_page_on_disk(page_id)?;
        Ok(true)
    }

    /// Take the in-flight marker for `page_id`, retrying if the marker we
    /// grabbed was retired by its owner before we locked it.
    fn acquire_inflight(
        &self,
        page_id: PageId,
    ) -> (Arc<Mutex<()>>, parking_lot::ArcMutexGuard<parking_lot::RawMutex, ()>) {
        loop {
            let marker = self
                .inflight_loads
                .entry(page_id)
                .or_insert_with(|| Arc::new(Mutex::new(())))
                .clone();
            let lock = marker.lock_arc();
            let still_registered = self
                .inflight_loads
                .get(&page_id)
                .map(|m| Arc::ptr_eq(m.value(), &marker))
                .unwrap_or(false);
            if still_registered {
                return (marker, lock);
            }
        }
    }

    fn release_inflight(&self, page_id: PageId, marker: &Arc<Mutex<()>>) {
        self.inflight_loads
            .remove_if(&page_id, |_, m| Arc::ptr_eq(m, marker));
    }

    /// Map `page_id` to a frame, loading from disk if it is not resident.
    /// A resident page is never evicted by its own fetch.
    fn ensure_frame(&self, page_id: PageId) -> BurrowDBResult<FrameId> {
        if let Some(frame_id) = self.pool.lookup_frame(page_id) {
            return Ok(frame_id);
        }

        let (marker, lock) = self.acquire_inflight(page_id);

        // Another thread may have finished the load while we waited.
        if let Some(frame_id) = self.pool.lookup_frame(page_id) {
            drop(lock);
            self.release_inflight(page_id, &marker);
            return Ok(frame_id);
        }

        let frame_id = self.allocate_frame()?;
        self.pool.load_page_into_frame(page_id, frame_id)?;
        {
            let mut meta = self.pool.frame_meta(frame_id);
            meta.page_id = page_id;
            meta.pin_count = 0;
            meta.is_dirty = false;
        }
        self.pool.insert_mapping(page_id, frame_id);
        drop(lock);
        self.release_inflight(page_id, &marker);
        Ok(frame_id)
    }

    fn allocate_frame(&self) -> BurrowDBResult<FrameId> {
        if let Some(frame_id) = self.pool.pop_free_frame() {
            return Ok(frame_id);
        }
        self.evict_victim_frame()
    }

    fn evict_victim_frame(&self) -> BurrowDBResult<FrameId> {
        loop {
            let victim = match self.replacer.lock().evict() {
                Some(frame_id) => frame_id,
                None => {
                    return Err(BurrowDBError::Storage(
                        "cannot allocate frame: every frame is pinned".to_string(),
                    ))
                }
            };

            let page_id = self.pool.frame_meta(victim).page_id;
            if page_id == INVALID_PAGE_ID {
                // Frame holds no page; nothing to write back.
                self.pool.clear_frame_meta(victim);
                self.pool.reset_frame(victim);
                return Ok(victim);
            }

            // Hold the victim's in-flight marker across unmap + writeback so
            // a concurrent fetch of the same page waits for the disk image
            // instead of reading stale bytes.
            let (marker, lock) = self.acquire_inflight(page_id);

            // Re-validate under the marker: the frame may have been deleted
            // out from under us, or re-pinned by a fetch that raced the
            // eviction decision. Claiming the frame (page_id reset) under
            // the meta lock fences out concurrent pinners.
            let is_dirty = {
                let mut meta = self.pool.frame_meta(victim);
                if meta.page_id != page_id {
                    drop(meta);
                    drop(lock);
                    self.release_inflight(page_id, &marker);
                    continue;
                }
                if meta.pin_count > 0 {
                    drop(meta);
                    let mut rep = self.replacer.lock();
                    let _ = rep.record_access(victim);
                    let _ = rep.set_evictable(victim, false);
                    drop(rep);
                    drop(lock);
                    self.release_inflight(page_id, &marker);
                    continue;
                }
                meta.page_id = INVALID_PAGE_ID;
                meta.is_dirty
            };

            self.pool.remove_mapping(page_id);
            if is_dirty {
                let bytes = {
                    let _latch = self.pool.frame_lock(victim).read();
                    Bytes::copy_from_slice(unsafe { self.pool.frame_slice(victim) })
                };
                self.pool.write_page_to_disk(page_id, bytes)?;
            }
            drop(lock);
            self.release_inflight(page_id, &marker);

            self.pool.clear_frame_meta(victim);
            self.pool.reset_frame(victim);
            return Ok(victim);
        }
    }

    fn replacer_record_access(&self, frame_id: FrameId) {
        let _ = self.replacer.lock().record_access(frame_id);
    }

    fn mark_evictable(&self, frame_id: FrameId) {
        let _ = self.replacer.lock().set_evictable(frame_id, true);
    }

    fn mark_non_evictable(&self, frame_id: FrameId) {
        let _ = self.replacer.lock().set_evictable(frame_id, false);
    }

    pub fn evictable_count(&self) -> usize {
        self.replacer.lock().size()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::disk_manager::DiskManager;
    use std::sync::{Arc, Barrier};
    use std::thread;
    use tempfile::TempDir;

    fn setup_manager(num_pages: usize) -> (TempDir, Arc<BufferPoolManager>) {
        let temp_dir = TempDir::new().unwrap();
        let db_file = temp_dir.path().join("test.db");
        let disk_manager = Arc::new(DiskManager::try_new(db_file).unwrap());
        let disk_scheduler = Arc::new(DiskScheduler::new(disk_manager));
        let manager = Arc::new(BufferPoolManager::new(num_pages, disk_scheduler));
        (temp_dir, manager)
    }

    #[test]
    fn new_page_initializes_frame() {
        let (_tmp, manager) = setup_manager(2);
        let guard = manager.new_page().unwrap();
        let page_id = guard.page_id();
        let frame_id = guard.frame_id();

        assert!(guard.data().iter().all(|b| *b == 0));
        assert!(!guard.is_dirty());
        drop(guard);

        let meta = manager.buffer_pool().frame_meta(frame_id).clone();
        assert_eq!(meta.page_id, page_id);
        assert_eq!(meta.pin_count, 0);
        assert!(!meta.is_dirty);
    }

    #[test]
    fn pool_exhausts_when_all_frames_pinned() {
        let (_tmp, manager) = setup_manager(3);
        let p1 = manager.new_page().unwrap();
        let _p2 = manager.new_page().unwrap();
        let _p3 = manager.new_page().unwrap();
        assert!(manager.new_page().is_err());

        let page1_id = p1.page_id();
        drop(p1);
        assert_eq!(manager.evictable_count(), 1);

        // Frame freed by p1 is reused and page 1 is evicted.
        let p5 = manager.new_page().unwrap();
        assert_ne!(p5.page_id(), page1_id);
        assert!(manager.buffer_pool().lookup_frame(page1_id).is_none());
    }

    #[test]
    fn fetch_resident_page_does_not_evict() {
        let (_tmp, manager) = setup_manager(3);
        let mut ids = Vec::new();
        for i in 0..3u8 {
            let mut guard = manager.new_page().unwrap();
            guard.data_mut()[0] = i + 1;
            ids.push(guard.page_id());
        }
        assert_eq!(manager.evictable_count(), 3);

        let guard = manager.fetch_page_read(ids[0]).unwrap();
        assert_eq!(guard.page_id(), ids[0]);
        assert_eq!(guard.data()[0], 1);
        assert_eq!(manager.evictable_count(), 2);
        drop(guard);
        assert_eq!(manager.evictable_count(), 3);
    }

    #[test]
    fn evicted_dirty_page_is_written_back_and_reloadable() {
        let (_tmp, manager) = setup_manager(2);
        let first_id = {
            let mut guard = manager.new_page().unwrap();
            guard.data_mut()[100] = 0x5A;
            guard.page_id()
        };

        // Fill the pool so `first_id` gets evicted.
        let _keep1 = manager.new_page().unwrap();
        let _keep2 = manager.new_page().unwrap();
        assert!(manager.buffer_pool().lookup_frame(first_id).is_none());

        drop(_keep1);
        let reloaded = manager.fetch_page_read(first_id).unwrap();
        assert_eq!(reloaded.page_id(), first_id);
        assert_eq!(reloaded.data()[100], 0x5A);
    }

    #[test]
    fn unpin_or_folds_dirty_flag() {
        let (_tmp, manager) = setup_manager(2);
        let mut guard = manager.new_page().unwrap();
        let page_id = guard.page_id();
        let frame_id = guard.frame_id();
        guard.data_mut()[0] = 1;
        drop(guard);
        assert!(manager.buffer_pool().frame_meta(frame_id).is_dirty);

        // A clean reader must not clear the dirty mark.
        let read = manager.fetch_page_read(page_id).unwrap();
        drop(read);
        assert!(manager.buffer_pool().frame_meta(frame_id).is_dirty);
    }

    #[test]
    fn complete_unpin_rejects_absent_or_unpinned_pages() {
        let (_tmp, manager) = setup_manager(2);
        assert!(!manager.complete_unpin(999, false).unwrap());

        let page_id = {
            let guard = manager.new_page().unwrap();
            guard.page_id()
        };
        // Already unpinned by the guard drop.
        assert!(!manager.complete_unpin(page_id, false).unwrap());
    }

    #[test]
    fn flush_page_clears_dirty_flag() {
        let (_tmp, manager) = setup_manager(2);
        let mut guard = manager.new_page().unwrap();
        let page_id = guard.page_id();
        let frame_id = guard.frame_id();
        guard.data_mut()[0] = 42;
        drop(guard);

        assert!(manager.flush_page(page_id).unwrap());
        assert!(!manager.buffer_pool().frame_meta(frame_id).is_dirty);
        assert!(!manager.flush_page(INVALID_PAGE_ID + 9999).unwrap());
    }

    #[test]
    fn delete_page_releases_frame_and_refuses_pinned() {
        let (_tmp, manager) = setup_manager(2);
        let guard = manager.new_page().unwrap();
        let page_id = guard.page_id();
        assert!(!manager.delete_page(page_id).unwrap());
        drop(guard);

        assert!(manager.delete_page(page_id).unwrap());
        assert!(manager.buffer_pool().lookup_frame(page_id).is_none());
        assert!(manager.buffer_pool().has_free_frame());
    }

    #[test]
    fn concurrent_new_pages_have_distinct_ids() {
        const THREADS: usize = 8;
        let (_tmp, manager) = setup_manager(64);
        let barrier = Arc::new(Barrier::new(THREADS));
        let mut handles = Vec::new();
        for _ in 0..THREADS {
            let mgr = manager.clone();
            let barrier = barrier.clone();
            handles.push(thread::spawn(move || {
                barrier.wait();
                let mut ids = Vec::new();
                for _ in 0..4 {
                    ids.push(mgr.new_page().unwrap().page_id());
                }
                ids
            }));
        }
        let mut all: Vec<PageId> = handles
            .into_iter()
            .flat_map(|h| h.join().unwrap())
            .collect();
        all.sort_unstable();
        all.dedup();
        assert_eq!(all.len(), THREADS * 4);
    }

    #[test]
    fn concurrent_reads_do_not_leak_pins() {
        const THREADS: usize = 8;
        let (_tmp, manager) = setup_manager(4);
        let (page_id, frame_id) = {
            let mut guard = manager.new_page().unwrap();
            guard.data_mut()[0] = 42;
            (guard.page_id(), guard.frame_id())
        };

        let barrier = Arc::new(Barrier::new(THREADS));
        let mut handles = Vec::with_capacity(THREADS);
        for _ in 0..THREADS {
            let mgr = manager.clone();
            let barrier = barrier.clone();
            handles.push(thread::spawn(move || {
                barrier.wait();
                for _ in 0..50 {
                    let guard = mgr.fetch_page_read(page_id).expect("read page");
                    assert_eq!(guard.data()[0], 42);
                }
            }));
        }
        for handle in handles {
            handle.join().unwrap();
        }

        let meta = manager.buffer_pool().frame_meta(frame_id).clone();
        assert_eq!(meta.pin_count, 0);
        assert_eq!(meta.page_id, page_id);
    }
}
