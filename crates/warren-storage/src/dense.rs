//! Parallel sorted dense arrays with a combined published view.
//!
//! [`DenseArrays`] keeps the `ids[]` and `alive[]` columns of a sectors
//! array: both the same length, `ids` strictly ascending. The writer
//! mutates entries in place under the owner's unique lock; readers iterate
//! a [`DenseView`] snapshot published atomically after each structural
//! change. Because visible entries are rewritten in place (a destroy clears
//! an alive word, a shift rewrites a suffix), every element access is
//! word-atomic: release stores on the writer side, acquire loads on the
//! reader side.

use std::sync::atomic::{AtomicPtr, AtomicU32, Ordering};
use std::sync::Arc;

use warren_core::SectorId;
use warren_memory::retire::RetireBin;
use warren_memory::snap::RawBuf;

/// Heap record the published view pointer designates.
struct DenseViewRaw {
    ids: *const AtomicU32,
    alive: *const AtomicU32,
    len: usize,
}

/// Shared publication cell for the dense view.
///
/// Lives behind `Arc` so the owning array can load snapshots without going
/// through the lock that guards the writer side — lock-free readers must
/// stay lock-free even while a writer holds the unique lock and waits on
/// pins those readers hold.
pub struct DenseCell {
    view: AtomicPtr<DenseViewRaw>,
    bin: Arc<RetireBin>,
}

// SAFETY: the cell holds an atomic pointer to an immutable heap record
// whose lifetime the retire discipline covers.
unsafe impl Send for DenseCell {}
unsafe impl Sync for DenseCell {}

impl DenseCell {
    /// Load the current published snapshot.
    pub fn view(&self) -> DenseView {
        let raw = self.view.load(Ordering::Acquire);
        // SAFETY: the record is live per the retire discipline.
        let raw = unsafe { &*raw };
        DenseView {
            ids: raw.ids,
            alive: raw.alive,
            len: raw.len,
        }
    }
}

impl Drop for DenseCell {
    fn drop(&mut self) {
        let view = self.view.load(Ordering::Relaxed);
        // SAFETY: final owner of the current view record.
        unsafe {
            self.bin.retire(
                view as *mut u8,
                std::alloc::Layout::new::<DenseViewRaw>(),
            )
        };
    }
}

/// Writer side of the dense `ids` / `alive` columns.
pub struct DenseArrays {
    ids: RawBuf<AtomicU32>,
    alive: RawBuf<AtomicU32>,
    len: usize,
    cell: Arc<DenseCell>,
    bin: Arc<RetireBin>,
}

// SAFETY: element access is word-atomic; structural mutation is serialized
// by the owning array's unique lock.
unsafe impl Send for DenseArrays {}
unsafe impl Sync for DenseArrays {}

impl DenseArrays {
    /// Create empty columns retiring superseded buffers into `bin`.
    pub fn new(bin: Arc<RetireBin>) -> Self {
        let initial = Box::into_raw(Box::new(DenseViewRaw {
            ids: std::ptr::null(),
            alive: std::ptr::null(),
            len: 0,
        }));
        Self {
            ids: RawBuf::new(Arc::clone(&bin)),
            alive: RawBuf::new(Arc::clone(&bin)),
            len: 0,
            cell: Arc::new(DenseCell {
                view: AtomicPtr::new(initial),
                bin: Arc::clone(&bin),
            }),
            bin,
        }
    }

    /// Shared handle to the publication cell.
    pub fn cell(&self) -> Arc<DenseCell> {
        Arc::clone(&self.cell)
    }

    /// Writer-side length.
    pub fn len(&self) -> usize {
        self.len
    }

    /// Whether the writer side holds no entries.
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Writer-side capacity.
    pub fn capacity(&self) -> usize {
        self.ids.capacity()
    }

    /// Resize to `new_len`; fresh entries read as id 0 / alive 0.
    pub fn resize(&mut self, new_len: usize) {
        if new_len > self.ids.capacity() {
            let target = new_len.max(self.ids.capacity() * 2).max(8);
            self.ids.grow_exact(target, self.len);
            self.alive.grow_exact(target, self.len);
        }
        if new_len > self.len {
            for i in self.len..new_len {
                self.store_id(i, 0);
                self.store_alive(i, 0);
            }
        }
        self.len = new_len;
    }

    /// Ensure capacity for `n` entries.
    pub fn reserve(&mut self, n: usize) {
        if n > self.ids.capacity() {
            self.ids.grow_exact(n, self.len);
            self.alive.grow_exact(n, self.len);
        }
    }

    /// Shrink the length without touching storage or the published view.
    pub fn truncate(&mut self, new_len: usize) {
        debug_assert!(new_len <= self.len);
        self.len = new_len;
    }

    /// Drop all entries (length reset only).
    pub fn clear(&mut self) {
        self.len = 0;
    }

    /// Reallocate down to the current length, retiring the old buffers.
    ///
    /// Callers must re-publish afterwards.
    pub fn shrink_to_fit(&mut self) {
        if self.ids.capacity() > self.len {
            self.ids.grow_exact(self.len, self.len);
            self.alive.grow_exact(self.len, self.len);
        }
    }

    /// Read the id at dense index `i`.
    pub fn id_at(&self, i: usize) -> SectorId {
        debug_assert!(i < self.len);
        // SAFETY: in bounds of the current allocation.
        unsafe { (*self.ids.ptr().add(i)).load(Ordering::Relaxed) }
    }

    /// Write the id at dense index `i`.
    pub fn store_id(&mut self, i: usize, id: SectorId) {
        debug_assert!(i < self.ids.capacity());
        // SAFETY: in bounds; release so snapshot readers see the value.
        unsafe { (*self.ids.ptr().add(i)).store(id, Ordering::Release) }
    }

    /// Read the alive bits at dense index `i`.
    pub fn alive_at(&self, i: usize) -> u32 {
        debug_assert!(i < self.len);
        // SAFETY: in bounds.
        unsafe { (*self.alive.ptr().add(i)).load(Ordering::Relaxed) }
    }

    /// Write the alive bits at dense index `i`.
    pub fn store_alive(&mut self, i: usize, alive: u32) {
        debug_assert!(i < self.alive.capacity());
        // SAFETY: in bounds; release for snapshot readers.
        unsafe { (*self.alive.ptr().add(i)).store(alive, Ordering::Release) }
    }

    /// Publish a view exposing the first `visible` entries.
    pub fn publish(&mut self, visible: usize) {
        debug_assert!(visible <= self.len);
        let fresh = Box::into_raw(Box::new(DenseViewRaw {
            ids: self.ids.ptr() as *const AtomicU32,
            alive: self.alive.ptr() as *const AtomicU32,
            len: visible,
        }));
        let old = self.cell.view.swap(fresh, Ordering::Release);
        // SAFETY: old came from Box::into_raw; the bin frees it at the next
        // quiescent drain.
        unsafe {
            self.bin.retire(
                old as *mut u8,
                std::alloc::Layout::new::<DenseViewRaw>(),
            )
        };
    }

    /// Load the current published snapshot.
    pub fn view(&self) -> DenseView {
        self.cell.view()
    }
}

/// Published snapshot of the dense columns.
///
/// Valid until the owning bin drains (a quiescent point holders are, by
/// contract, keeping away with a pin or a lock).
#[derive(Clone, Copy)]
pub struct DenseView {
    ids: *const AtomicU32,
    alive: *const AtomicU32,
    len: usize,
}

impl DenseView {
    /// Number of visible entries.
    pub fn len(&self) -> usize {
        self.len
    }

    /// Whether the snapshot is empty.
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Id at dense index `i`.
    pub fn id_at(&self, i: usize) -> SectorId {
        debug_assert!(i < self.len);
        // SAFETY: within the published length.
        unsafe { (*self.ids.add(i)).load(Ordering::Acquire) }
    }

    /// Alive bits at dense index `i`.
    pub fn alive_at(&self, i: usize) -> u32 {
        debug_assert!(i < self.len);
        // SAFETY: within the published length.
        unsafe { (*self.alive.add(i)).load(Ordering::Acquire) }
    }

    /// First dense index whose id is `>= id` (the ids are sorted).
    pub fn lower_bound(&self, id: SectorId) -> usize {
        let mut left = 0;
        let mut right = self.len;
        while left < right {
            let mid = left + (right - left) / 2;
            if self.id_at(mid) < id {
                left = mid + 1;
            } else {
                right = mid;
            }
        }
        left
    }
}
