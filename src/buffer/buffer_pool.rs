use std::cell::UnsafeCell;
use std::collections::VecDeque;
use std::sync::Arc;

use bytes::Bytes;
use dashmap::DashMap;
use parking_lot::{Mutex, MutexGuard, RwLock};

use crate::buffer::page::{PageId, INVALID_PAGE_ID, PAGE_SIZE};
use crate::error::{BurrowDBError, BurrowDBResult};
use crate::storage::disk_scheduler::DiskScheduler;

pub type FrameId = usize;

#[derive(Debug, Clone)]
pub struct FrameMeta {
    pub page_id: PageId,
    pub pin_count: u32,
    pub is_dirty: bool,
}

impl Default for FrameMeta {
    fn default() -> Self {
        Self {
            page_id: INVALID_PAGE_ID,
            pin_count: 0,
            is_dirty: false,
        }
    }
}

/// One slot of the in-memory page array: the page bytes, the frame latch
/// guarding them, and the frame meta guarded by its own mutex.
#[derive(Debug)]
struct Frame {
    data: UnsafeCell<Box<[u8; PAGE_SIZE]>>,
    latch: RwLock<()>,
    meta: Mutex<FrameMeta>,
}

// Frame bytes are only touched while the frame latch is held; meta sits
// behind its own mutex.
unsafe impl Sync for Frame {}

impl Frame {
    fn new() -> Self {
        Self {
            data: UnsafeCell::new(Box::new([0; PAGE_SIZE])),
            latch: RwLock::new(()),
            meta: Mutex::new(FrameMeta::default()),
        }
    }
}

/// Fixed-size frame arena shared by the buffer pool manager and the page
/// guards: page bytes, per-frame latches and meta, the page table, and the
/// free list. Residency policy lives in `BufferPoolManager`.
#[derive(Debug)]
pub struct BufferPool {
    frames: Vec<Frame>,
    page_table: DashMap<PageId, FrameId>,
    free_list: Mutex<VecDeque<FrameId>>,
    disk_scheduler: Arc<DiskScheduler>,
}

impl BufferPool {
    pub fn new(num_frames: usize, disk_scheduler: Arc<DiskScheduler>) -> Self {
        let mut frames = Vec::with_capacity(num_frames);
        let mut free_list = VecDeque::with_capacity(num_frames);
        for i in 0..num_frames {
            frames.push(Frame::new());
            free_list.push_back(i);
        }
        Self {
            frames,
            page_table: DashMap::new(),
            free_list: Mutex::new(free_list),
            disk_scheduler,
        }
    }

    pub fn capacity(&self) -> usize {
        self.frames.len()
    }

    pub fn disk_scheduler(&self) -> &Arc<DiskScheduler> {
        &self.disk_scheduler
    }

    pub fn has_free_frame(&self) -> bool {
        !self.free_list.lock().is_empty()
    }

    pub fn pop_free_frame(&self) -> Option<FrameId> {
        self.free_list.lock().pop_front()
    }

    pub fn push_free_frame(&self, frame_id: FrameId) {
        self.free_list.lock().push_back(frame_id);
    }

    pub fn frame_meta(&self, frame_id: FrameId) -> MutexGuard<'_, FrameMeta> {
        self.frames[frame_id].meta.lock()
    }

    pub fn frame_lock(&self, frame_id: FrameId) -> &RwLock<()> {
        &self.frames[frame_id].latch
    }

    /// # Safety
    /// The caller must hold the frame latch (read or write) for `frame_id`,
    /// or otherwise guarantee the frame is not concurrently mutated.
    pub unsafe fn frame_slice(&self, frame_id: FrameId) -> &[u8] {
        &(&*self.frames[frame_id].data.get())[..]
    }

    /// # Safety
    /// The caller must hold the frame's write latch, or otherwise guarantee
    /// exclusive access to the frame bytes.
    #[allow(clippy::mut_from_ref)]
    pub unsafe fn frame_slice_mut(&self, frame_id: FrameId) -> &mut [u8] {
        &mut (&mut *self.frames[frame_id].data.get())[..]
    }

    pub fn reset_frame(&self, frame_id: FrameId) {
        let _latch = self.frames[frame_id].latch.write();
        unsafe {
            self.frame_slice_mut(frame_id).fill(0);
        }
    }

    pub fn clear_frame_meta(&self, frame_id: FrameId) {
        *self.frames[frame_id].meta.lock() = FrameMeta::default();
    }

    pub fn lookup_frame(&self, page_id: PageId) -> Option<FrameId> {
        self.page_table.get(&page_id).map(|entry| *entry.value())
    }

    pub fn insert_mapping(&self, page_id: PageId, frame_id: FrameId) {
        self.page_table.insert(page_id, frame_id);
    }

    pub fn remove_mapping(&self, page_id: PageId) {
        self.page_table.remove(&page_id);
    }

    /// Remove the mapping only if it still points at `frame_id`.
    pub fn remove_mapping_if(&self, page_id: PageId, frame_id: FrameId) -> bool {
        self.page_table
            .remove_if(&page_id, |_, mapped| *mapped == frame_id)
            .is_some()
    }

    pub fn resident_page_ids(&self) -> Vec<PageId> {
        self.page_table.iter().map(|entry| *entry.key()).collect()
    }

    pub fn allocate_page_id(&self) -> BurrowDBResult<PageId> {
        self.disk_scheduler
            .schedule_allocate()?
            .recv()
            .map_err(|e| BurrowDBError::Internal(format!("allocate channel closed: {}", e)))?
    }

    /// Read `page_id` from disk into the frame. The frame must not be
    /// reachable through the page table yet.
    pub fn load_page_into_frame(&self, page_id: PageId, frame_id: FrameId) -> BurrowDBResult<()> {
        let data = self
            .disk_scheduler
            .schedule_read(page_id)?
            .recv()
            .map_err(|e| BurrowDBError::Internal(format!("read channel closed: {}", e)))??;
        let _latch = self.frames[frame_id].latch.write();
        let slice = unsafe { self.frame_slice_mut(frame_id) };
        let copy_len = data.len().min(PAGE_SIZE);
        slice[..copy_len].copy_from_slice(&data[..copy_len]);
        if copy_len < PAGE_SIZE {
            slice[copy_len..].fill(0);
        }
        Ok(())
    }

    pub fn write_page_to_disk(&self, page_id: PageId, data: Bytes) -> BurrowDBResult<()> {
        self.disk_scheduler
            .schedule_write(page_id, data)?
            .recv()
            .map_err(|e| BurrowDBError::Internal(format!("write channel closed: {}", e)))?
    }

    pub fn deallocate_page_on_disk(&self, page_id: PageId) -> BurrowDBResult<()> {
        self.disk_scheduler
            .schedule_deallocate(page_id)?
            .recv()
            .map_err(|e| BurrowDBError::Internal(format!("deallocate channel closed: {}", e)))?
    }
}
