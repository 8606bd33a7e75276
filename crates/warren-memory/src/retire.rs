//! Deferred buffer reclamation.
//!
//! When a buffer backing a published snapshot view is superseded (the vector
//! grew, the array defragmented), it cannot be freed immediately: a
//! concurrent reader may still hold the old `(ptr, len)` snapshot. The
//! [`RetireBin`] queues such buffers; [`RetireBin::drain`] frees them and is
//! only called at quiescent points — under the owner's unique lock, after
//! pin counters confirm no reader from the prior epoch can still be running.
//! The bin itself cannot verify quiescence; callers uphold it.

use std::alloc::{dealloc, Layout};
use std::sync::Mutex;

/// A queued allocation awaiting reclamation.
struct Retired {
    ptr: *mut u8,
    layout: Layout,
}

// SAFETY: a retired block is owned exclusively by the bin; the pointer is
// never dereferenced, only passed back to the allocator.
unsafe impl Send for Retired {}

/// Queue of memory blocks whose release is deferred to a safe point.
#[derive(Default)]
pub struct RetireBin {
    queue: Mutex<Vec<Retired>>,
}

impl RetireBin {
    /// Create an empty bin.
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue a block for deferred release.
    ///
    /// # Safety
    ///
    /// `ptr` must have been allocated with the global allocator using
    /// `layout`, and ownership transfers to the bin — the caller must not
    /// free or reuse it. Readers may continue to *read* through previously
    /// published snapshots of the block until the next [`RetireBin::drain`].
    pub unsafe fn retire(&self, ptr: *mut u8, layout: Layout) {
        if layout.size() == 0 {
            return;
        }
        self.queue.lock().unwrap().push(Retired { ptr, layout });
    }

    /// Free every queued block.
    ///
    /// Only call at a quiescent point: unique lock held and no snapshot
    /// published before the retirements can still be in use.
    pub fn drain(&self) {
        let drained: Vec<Retired> = {
            let mut queue = self.queue.lock().unwrap();
            std::mem::take(&mut *queue)
        };
        for block in drained {
            // SAFETY: retire() took ownership; each block is freed once,
            // with the layout it was allocated with.
            unsafe { dealloc(block.ptr, block.layout) };
        }
    }

    /// Total bytes currently queued.
    pub fn queued_bytes(&self) -> usize {
        self.queue.lock().unwrap().iter().map(|b| b.layout.size()).sum()
    }

    /// Number of blocks currently queued.
    pub fn queued_blocks(&self) -> usize {
        self.queue.lock().unwrap().len()
    }
}

impl Drop for RetireBin {
    fn drop(&mut self) {
        self.drain();
    }
}
