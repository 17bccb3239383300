use log::error;
use parking_lot::{RwLockReadGuard, RwLockWriteGuard};
use std::mem::{self, ManuallyDrop};
use std::sync::atomic::AtomicU32;
use std::sync::Arc;

use super::buffer_manager::BufferPoolManager;
use super::buffer_pool::{BufferPool, FrameId, FrameMeta};

pub type PageId = u32;
pub type AtomicPageId = AtomicU32;

pub const INVALID_PAGE_ID: PageId = 0;
pub const PAGE_SIZE: usize = 4096;

/// Scoped pin without a latch. Upgrades into a latched guard without
/// touching the pin count.
#[derive(Debug)]
pub struct BasicPageGuard {
    bpm: Arc<BufferPoolManager>,
    pool: Arc<BufferPool>,
    frame_id: FrameId,
}

impl BasicPageGuard {
    pub fn page_id(&self) -> PageId {
        self.meta_snapshot().page_id
    }

    pub fn frame_id(&self) -> FrameId {
        self.frame_id
    }

    pub fn pin_count(&self) -> u32 {
        self.meta_snapshot().pin_count
    }

    fn meta_snapshot(&self) -> FrameMeta {
        self.pool.frame_meta(self.frame_id).clone()
    }

    /// Trade the bare pin for a pin plus read latch. The pin is carried
    /// over, not re-acquired.
    pub fn upgrade_read(self) -> ReadPageGuard {
        let (bpm, frame_id) = self.into_parts();
        new_read_guard(bpm, frame_id)
    }

    /// Trade the bare pin for a pin plus write latch.
    pub fn upgrade_write(self) -> WritePageGuard {
        let (bpm, frame_id) = self.into_parts();
        new_write_guard(bpm, frame_id)
    }

    /// Disarm the destructor and move the fields out so an upgrade does not
    /// release the pin it hands over.
    fn into_parts(self) -> (Arc<BufferPoolManager>, FrameId) {
        let this = ManuallyDrop::new(self);
        let bpm = unsafe { std::ptr::read(&this.bpm) };
        let _pool = unsafe { std::ptr::read(&this.pool) };
        (bpm, this.frame_id)
    }
}

impl Drop for BasicPageGuard {
    fn drop(&mut self) {
        let page_id = self.meta_snapshot().page_id;
        if let Err(e) = self.bpm.complete_unpin(page_id, false) {
            error!("failed to unpin page {}: {}", page_id, e);
        }
    }
}

/// Scoped pin plus shared frame latch. Dropping releases the latch first,
/// then the pin.
#[derive(Debug)]
pub struct ReadPageGuard {
    bpm: Arc<BufferPoolManager>,
    pool: Arc<BufferPool>,
    frame_id: FrameId,
    guard: ManuallyDrop<RwLockReadGuard<'static, ()>>,
}

impl ReadPageGuard {
    pub fn data(&self) -> &[u8] {
        unsafe { self.pool.frame_slice(self.frame_id) }
    }

    pub fn page_id(&self) -> PageId {
        self.meta_snapshot().page_id
    }

    pub fn frame_id(&self) -> FrameId {
        self.frame_id
    }

    pub fn pin_count(&self) -> u32 {
        self.meta_snapshot().pin_count
    }

    pub fn is_dirty(&self) -> bool {
        self.meta_snapshot().is_dirty
    }

    pub fn meta_snapshot(&self) -> FrameMeta {
        self.pool.frame_meta(self.frame_id).clone()
    }
}

impl Drop for ReadPageGuard {
    fn drop(&mut self) {
        let page_id = self.meta_snapshot().page_id;
        unsafe {
            ManuallyDrop::drop(&mut self.guard);
        }
        if let Err(e) = self.bpm.complete_unpin(page_id, false) {
            error!("failed to unpin page {}: {}", page_id, e);
        }
    }
}

/// Scoped pin plus exclusive frame latch. `data_mut` is the only route to
/// the bytes and marks the frame dirty on use.
#[derive(Debug)]
pub struct WritePageGuard {
    bpm: Arc<BufferPoolManager>,
    pool: Arc<BufferPool>,
    frame_id: FrameId,
    guard: ManuallyDrop<RwLockWriteGuard<'static, ()>>,
    dirtied: bool,
}

impl WritePageGuard {
    pub fn data(&self) -> &[u8] {
        unsafe { self.pool.frame_slice(self.frame_id) }
    }

    pub fn data_mut(&mut self) -> &mut [u8] {
        self.mark_dirty();
        unsafe { self.pool.frame_slice_mut(self.frame_id) }
    }

    /// Replace the whole page image.
    pub fn overwrite(&mut self, data: &[u8]) {
        debug_assert_eq!(data.len(), PAGE_SIZE);
        self.data_mut().copy_from_slice(data);
    }

    pub fn page_id(&self) -> PageId {
        self.meta_snapshot().page_id
    }

    pub fn frame_id(&self) -> FrameId {
        self.frame_id
    }

    pub fn pin_count(&self) -> u32 {
        self.meta_snapshot().pin_count
    }

    pub fn is_dirty(&self) -> bool {
        self.meta_snapshot().is_dirty
    }

    pub fn meta_snapshot(&self) -> FrameMeta {
        self.pool.frame_meta(self.frame_id).clone()
    }

    fn mark_dirty(&mut self) {
        if !self.dirtied {
            self.dirtied = true;
        }
        self.pool.frame_meta(self.frame_id).is_dirty = true;
    }
}

impl Drop for WritePageGuard {
    fn drop(&mut self) {
        let page_id = self.meta_snapshot().page_id;
        let dirtied = self.dirtied;
        unsafe {
            ManuallyDrop::drop(&mut self.guard);
        }
        if let Err(e) = self.bpm.complete_unpin(page_id, dirtied) {
            error!("failed to unpin page {}: {}", page_id, e);
        }
    }
}

pub(crate) fn new_basic_guard(bpm: Arc<BufferPoolManager>, frame_id: FrameId) -> BasicPageGuard {
    let pool = bpm.buffer_pool();
    BasicPageGuard {
        bpm,
        pool,
        frame_id,
    }
}

pub(crate) fn new_read_guard(bpm: Arc<BufferPoolManager>, frame_id: FrameId) -> ReadPageGuard {
    let pool = bpm.buffer_pool();
    let lock = pool.frame_lock(frame_id);
    let guard = lock.read();
    // The pool Arc stored alongside keeps the latch alive for the guard's
    // real lifetime.
    let guard_static: RwLockReadGuard<'static, ()> =
        unsafe { mem::transmute::<RwLockReadGuard<'_, ()>, RwLockReadGuard<'static, ()>>(guard) };
    ReadPageGuard {
        bpm,
        pool,
        frame_id,
        guard: ManuallyDrop::new(guard_static),
    }
}

pub(crate) fn new_write_guard(bpm: Arc<BufferPoolManager>, frame_id: FrameId) -> WritePageGuard {
    let pool = bpm.buffer_pool();
    let lock = pool.frame_lock(frame_id);
    let guard = lock.write();
    let guard_static: RwLockWriteGuard<'static, ()> =
        unsafe { mem::transmute::<RwLockWriteGuard<'_, ()>, RwLockWriteGuard<'static, ()>>(guard) };
    WritePageGuard {
        bpm,
        pool,
        frame_id,
        guard: ManuallyDrop::new(guard_static),
        dirtied: false,
    }
}
