//! Sparse `id → (data pointer, dense index)` map.
//!
//! Indexed directly by sector id, giving O(1) random access into the dense
//! arrays and the chunk storage. Absent ids hold the invalid slot (null
//! data, [`INVALID_DENSE`]). The writer mutates entries in place under the
//! owning array's unique lock; lock-free readers go through a published
//! [`SparseSnapshot`]. Both slot words are accessed atomically, so a racing
//! reader sees either the old or the new value of each word — never torn
//! bytes. A reader that catches a slot mid-update resolves the usual way:
//! the data pointer it loads is null (absent) or points into chunk storage
//! that the pin discipline keeps allocated.

use std::ptr::NonNull;
use std::sync::atomic::{AtomicPtr, AtomicU32, Ordering};
use std::sync::Arc;

use warren_core::{SectorId, INVALID_DENSE};
use warren_memory::retire::RetireBin;
use warren_memory::snap::RawBuf;

/// One sparse entry: direct sector data pointer plus dense index.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SlotInfo {
    /// Pointer to the sector's chunk storage; null when absent.
    pub data: *mut u8,
    /// Dense index of the sector; `INVALID_DENSE` when absent.
    pub dense_idx: u32,
}

impl SlotInfo {
    /// The invalid slot.
    pub const INVALID: SlotInfo = SlotInfo {
        data: std::ptr::null_mut(),
        dense_idx: INVALID_DENSE,
    };

    /// Whether the slot designates a present sector.
    pub fn is_valid(&self) -> bool {
        !self.data.is_null()
    }
}

/// Heap record the published snapshot pointer designates.
struct SparseViewRaw {
    data: *const AtomicPtr<u8>,
    dense: *const AtomicU32,
    len: usize,
}

/// Shared publication cell for the sparse snapshot.
///
/// Behind `Arc` so the owning array (and through it, the view layer) can
/// look sectors up without the writer-side lock — see `DenseCell`.
pub struct SparseCell {
    view: AtomicPtr<SparseViewRaw>,
    bin: Arc<RetireBin>,
}

// SAFETY: atomic pointer to an immutable heap record covered by the retire
// discipline.
unsafe impl Send for SparseCell {}
unsafe impl Sync for SparseCell {}

impl SparseCell {
    /// Load the current published snapshot.
    pub fn snapshot(&self) -> SparseSnapshot {
        let raw = self.view.load(Ordering::Acquire);
        // SAFETY: live per the retire discipline.
        let raw = unsafe { &*raw };
        SparseSnapshot {
            data: raw.data,
            dense: raw.dense,
            len: raw.len,
        }
    }
}

impl Drop for SparseCell {
    fn drop(&mut self) {
        let view = self.view.load(Ordering::Relaxed);
        // SAFETY: final owner of the current view record.
        unsafe {
            self.bin.retire(
                view as *mut u8,
                std::alloc::Layout::new::<SparseViewRaw>(),
            )
        };
    }
}

/// Writer side of the sparse map.
pub struct SparseMap {
    data: RawBuf<AtomicPtr<u8>>,
    dense: RawBuf<AtomicU32>,
    len: usize,
    cell: Arc<SparseCell>,
    bin: Arc<RetireBin>,
}

// SAFETY: word-atomic element access; structural mutation serialized by the
// owning array's unique lock.
unsafe impl Send for SparseMap {}
unsafe impl Sync for SparseMap {}

impl SparseMap {
    /// Create an empty map retiring superseded buffers into `bin`.
    pub fn new(bin: Arc<RetireBin>) -> Self {
        let initial = Box::into_raw(Box::new(SparseViewRaw {
            data: std::ptr::null(),
            dense: std::ptr::null(),
            len: 0,
        }));
        Self {
            data: RawBuf::new(Arc::clone(&bin)),
            dense: RawBuf::new(Arc::clone(&bin)),
            len: 0,
            cell: Arc::new(SparseCell {
                view: AtomicPtr::new(initial),
                bin: Arc::clone(&bin),
            }),
            bin,
        }
    }

    /// Shared handle to the publication cell.
    pub fn cell(&self) -> Arc<SparseCell> {
        Arc::clone(&self.cell)
    }

    /// Number of addressable ids (the map is indexed directly by id).
    pub fn capacity(&self) -> usize {
        self.len
    }

    /// Grow so ids below `new_cap` are addressable; fresh slots invalid.
    ///
    /// Publishes the new snapshot: growth must be visible before the slot
    /// for a fresh id is populated.
    pub fn resize(&mut self, new_cap: usize) {
        if new_cap <= self.len {
            return;
        }
        if new_cap > self.data.capacity() {
            let target = new_cap.max(self.data.capacity() * 2).max(8);
            self.data.grow_exact(target, self.len);
            self.dense.grow_exact(target, self.len);
        }
        for i in self.len..new_cap {
            // Null data is already the zero pattern; the dense word needs
            // the explicit invalid marker.
            // SAFETY: in bounds of the grown allocation.
            unsafe {
                (*self.data.ptr().add(i)).store(std::ptr::null_mut(), Ordering::Relaxed);
                (*self.dense.ptr().add(i)).store(INVALID_DENSE, Ordering::Release);
            }
        }
        self.len = new_cap;
        self.publish();
    }

    /// Read the slot for `id` through the writer side.
    pub fn get(&self, id: SectorId) -> SlotInfo {
        let i = id as usize;
        if i >= self.len {
            return SlotInfo::INVALID;
        }
        // SAFETY: in bounds.
        unsafe {
            SlotInfo {
                data: (*self.data.ptr().add(i)).load(Ordering::Relaxed),
                dense_idx: (*self.dense.ptr().add(i)).load(Ordering::Relaxed),
            }
        }
    }

    /// Write the slot for `id`. The id must be addressable.
    pub fn set(&mut self, id: SectorId, slot: SlotInfo) {
        let i = id as usize;
        debug_assert!(i < self.len, "sparse map not resized for id {id}");
        // SAFETY: in bounds; release stores so lock-free readers observe
        // fully written words.
        unsafe {
            (*self.dense.ptr().add(i)).store(slot.dense_idx, Ordering::Release);
            (*self.data.ptr().add(i)).store(slot.data, Ordering::Release);
        }
    }

    /// Reset the slot for `id` to invalid. No-op when out of range.
    pub fn clear_slot(&mut self, id: SectorId) {
        let i = id as usize;
        if i < self.len {
            // SAFETY: in bounds.
            unsafe {
                (*self.data.ptr().add(i)).store(std::ptr::null_mut(), Ordering::Release);
                (*self.dense.ptr().add(i)).store(INVALID_DENSE, Ordering::Release);
            }
        }
    }

    /// Reset every slot to invalid.
    pub fn clear_all(&mut self) {
        for i in 0..self.len {
            // SAFETY: in bounds.
            unsafe {
                (*self.data.ptr().add(i)).store(std::ptr::null_mut(), Ordering::Release);
                (*self.dense.ptr().add(i)).store(INVALID_DENSE, Ordering::Release);
            }
        }
    }

    /// Publish the current buffer as the lock-free snapshot.
    pub fn publish(&mut self) {
        let fresh = Box::into_raw(Box::new(SparseViewRaw {
            data: self.data.ptr() as *const AtomicPtr<u8>,
            dense: self.dense.ptr() as *const AtomicU32,
            len: self.len,
        }));
        let old = self.cell.view.swap(fresh, Ordering::Release);
        // SAFETY: old came from Box::into_raw; freed at the next drain.
        unsafe {
            self.bin.retire(
                old as *mut u8,
                std::alloc::Layout::new::<SparseViewRaw>(),
            )
        };
    }

    /// Load the current published snapshot.
    pub fn snapshot(&self) -> SparseSnapshot {
        self.cell.snapshot()
    }
}

/// Published lock-free snapshot of the sparse map.
#[derive(Clone, Copy)]
pub struct SparseSnapshot {
    data: *const AtomicPtr<u8>,
    dense: *const AtomicU32,
    len: usize,
}

impl SparseSnapshot {
    /// Number of addressable ids in the snapshot.
    pub fn capacity(&self) -> usize {
        self.len
    }

    /// Look up a sector's data pointer and dense index.
    pub fn find(&self, id: SectorId) -> Option<(NonNull<u8>, u32)> {
        let i = id as usize;
        if i >= self.len {
            return None;
        }
        // SAFETY: within the published length.
        let data = unsafe { (*self.data.add(i)).load(Ordering::Acquire) };
        let dense_idx = unsafe { (*self.dense.add(i)).load(Ordering::Acquire) };
        NonNull::new(data).map(|p| (p, dense_idx))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn make() -> SparseMap {
        SparseMap::new(Arc::new(RetireBin::new()))
    }

    #[test]
    fn absent_ids_are_invalid() {
        let map = make();
        assert!(!map.get(0).is_valid());
        assert!(map.snapshot().find(5).is_none());
    }

    #[test]
    fn resize_initializes_fresh_slots_invalid() {
        let mut map = make();
        map.resize(10);
        for id in 0..10 {
            let slot = map.get(id);
            assert!(!slot.is_valid());
            assert_eq!(slot.dense_idx, INVALID_DENSE);
        }
    }

    #[test]
    fn set_then_find_round_trips() {
        let mut map = make();
        map.resize(8);
        let mut payload = 0u64;
        let ptr = &mut payload as *mut u64 as *mut u8;

        map.set(3, SlotInfo { data: ptr, dense_idx: 1 });
        assert_eq!(map.get(3).dense_idx, 1);

        let (found, idx) = map.snapshot().find(3).unwrap();
        assert_eq!(found.as_ptr(), ptr);
        assert_eq!(idx, 1);
    }

    #[test]
    fn clear_slot_returns_to_invalid() {
        let mut map = make();
        map.resize(4);
        let mut payload = 0u8;
        map.set(2, SlotInfo { data: &mut payload, dense_idx: 0 });
        map.clear_slot(2);
        assert!(!map.get(2).is_valid());
        assert!(map.snapshot().find(2).is_none());
        // Out of range is a no-op, not a panic.
        map.clear_slot(400);
    }

    #[test]
    fn old_snapshot_survives_resize() {
        let mut map = make();
        map.resize(4);
        let mut payload = 0u8;
        map.set(1, SlotInfo { data: &mut payload, dense_idx: 7 });
        let old = map.snapshot();

        map.resize(4096);
        assert_eq!(old.capacity(), 4);
        let (_, idx) = old.find(1).unwrap();
        assert_eq!(idx, 7);
        assert!(old.find(100).is_none(), "old snapshot never covers new ids");
    }

    #[test]
    fn clear_all_wipes_every_slot() {
        let mut map = make();
        map.resize(6);
        let mut payload = 0u8;
        for id in 0..6 {
            map.set(id, SlotInfo { data: &mut payload, dense_idx: id });
        }
        map.clear_all();
        for id in 0..6 {
            assert!(!map.get(id).is_valid());
        }
    }
}
