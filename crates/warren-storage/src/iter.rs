//! Snapshot iterators over a sectors array.
//!
//! All three flavors capture the published `(ids, alive, len)` triple and
//! the chunk table at construction and traverse that snapshot: inserts
//! published later are not observed, slots that die later may still be
//! yielded, and the bounds always stay within the snapshot. Data pointers
//! advance by the sector stride and cross chunk boundaries without per-step
//! indirection.
//!
//! Dereferencing [`SlotRef::data`] is `unsafe` and relies on the engine's
//! pin discipline: the caller (typically the view layer) holds a pin on the
//! iteration bound, which blocks relocation and destruction of every
//! sector the snapshot covers.

use std::marker::PhantomData;

use smallvec::SmallVec;
use warren_core::{Ranges, SectorId};
use warren_memory::snap::SnapView;

use crate::dense::DenseView;

/// A captured `(ids, alive, len)` + chunk-table snapshot that mints
/// iterators.
///
/// Taken once (e.g. at view construction) so that repeated traversals
/// replay the same state regardless of later inserts. Validity follows the
/// retire discipline: hold a pin on the iteration bound (views do), or
/// otherwise keep the array away from its quiescent drain points while the
/// snapshot is alive.
#[derive(Clone, Copy)]
pub struct ArraySnapshot {
    pub(crate) view: DenseView,
    pub(crate) chunks: SnapView<*mut u8>,
    pub(crate) stride: usize,
    pub(crate) chunk_capacity: u32,
    /// Whether the array had no dead slots at capture time.
    pub(crate) packed: bool,
    /// Alive mask covering every member of the array's layout.
    pub(crate) full_mask: u32,
}

impl ArraySnapshot {
    /// Number of dense slots captured.
    pub fn len(&self) -> usize {
        self.view.len()
    }

    /// Whether the snapshot holds no slots.
    pub fn is_empty(&self) -> bool {
        self.view.is_empty()
    }

    /// Linear iterator over every captured slot.
    pub fn iter(&self) -> SectorIter<'_> {
        SectorIter::new(self.view, self.chunks, self.stride, self.chunk_capacity)
    }

    /// Iterator over captured slots whose alive bits intersect `mask`.
    pub fn iter_alive_mask(&self, mask: u32) -> AliveIter<'_> {
        let packed = self.packed && mask == self.full_mask;
        AliveIter::new(
            self.view,
            self.chunks,
            self.stride,
            self.chunk_capacity,
            mask,
            packed,
        )
    }

    /// Iterator over the dense runs covered by sector id ranges.
    pub fn iter_ranged(&self, ranges: &Ranges) -> RangedIter<'_> {
        RangedIter::new(
            self.view,
            self.chunks,
            self.stride,
            self.chunk_capacity,
            ranges,
        )
    }
}

/// One iteration step: the dense entry plus the sector data pointer.
#[derive(Clone, Copy, Debug)]
pub struct SlotRef {
    /// Sector id at this dense position.
    pub id: SectorId,
    /// Alive bits snapshot for the sector.
    pub alive: u32,
    /// Pointer to the sector's chunk storage.
    pub data: *mut u8,
    /// Dense index within the snapshot.
    pub dense_idx: usize,
}

/// Chunk-crossing data pointer cursor shared by the iterator flavors.
struct SnapCursor {
    chunks: SnapView<*mut u8>,
    stride: usize,
    shift: u32,
    mask: usize,
    data: *mut u8,
    in_chunk: usize,
    chunk_idx: usize,
}

impl SnapCursor {
    fn new(chunks: SnapView<*mut u8>, stride: usize, chunk_capacity: u32) -> Self {
        Self {
            chunks,
            stride,
            shift: chunk_capacity.trailing_zeros(),
            mask: chunk_capacity as usize - 1,
            data: std::ptr::null_mut(),
            in_chunk: 0,
            chunk_idx: 0,
        }
    }

    fn seek(&mut self, idx: usize) {
        self.chunk_idx = idx >> self.shift;
        self.in_chunk = idx & self.mask;
        match self.chunks.get(self.chunk_idx) {
            // SAFETY: in-chunk offset below the chunk capacity.
            Some(base) => self.data = unsafe { base.add(self.in_chunk * self.stride) },
            None => self.data = std::ptr::null_mut(),
        }
    }

    fn advance(&mut self) {
        self.in_chunk += 1;
        if self.in_chunk > self.mask {
            self.in_chunk = 0;
            self.chunk_idx += 1;
            self.data = self.chunks.get(self.chunk_idx).unwrap_or(std::ptr::null_mut());
        } else if !self.data.is_null() {
            // SAFETY: still inside the current chunk.
            self.data = unsafe { self.data.add(self.stride) };
        }
    }
}

/// Linear iterator over every dense slot, alive or dead.
pub struct SectorIter<'a> {
    view: DenseView,
    cursor: SnapCursor,
    idx: usize,
    _array: PhantomData<&'a ()>,
}

impl<'a> SectorIter<'a> {
    pub(crate) fn new(
        view: DenseView,
        chunks: SnapView<*mut u8>,
        stride: usize,
        chunk_capacity: u32,
    ) -> Self {
        let mut cursor = SnapCursor::new(chunks, stride, chunk_capacity);
        cursor.seek(0);
        Self {
            view,
            cursor,
            idx: 0,
            _array: PhantomData,
        }
    }

    /// Number of slots in the snapshot.
    pub fn snapshot_len(&self) -> usize {
        self.view.len()
    }
}

impl Iterator for SectorIter<'_> {
    type Item = SlotRef;

    fn next(&mut self) -> Option<SlotRef> {
        if self.idx >= self.view.len() {
            return None;
        }
        let item = SlotRef {
            id: self.view.id_at(self.idx),
            alive: self.view.alive_at(self.idx),
            data: self.cursor.data,
            dense_idx: self.idx,
        };
        self.idx += 1;
        self.cursor.advance();
        Some(item)
    }
}

/// Iterator skipping slots whose alive bits miss the requested mask.
///
/// Skipping checks four alive words per step before falling back to a
/// bit-precise scan. When the snapshot is packed (no dead slots and the
/// mask covers the whole sector) filtering is bypassed entirely.
pub struct AliveIter<'a> {
    view: DenseView,
    cursor: SnapCursor,
    idx: usize,
    mask: u32,
    packed: bool,
    _array: PhantomData<&'a ()>,
}

impl<'a> AliveIter<'a> {
    pub(crate) fn new(
        view: DenseView,
        chunks: SnapView<*mut u8>,
        stride: usize,
        chunk_capacity: u32,
        mask: u32,
        packed: bool,
    ) -> Self {
        let mut iter = Self {
            view,
            cursor: SnapCursor::new(chunks, stride, chunk_capacity),
            idx: 0,
            mask,
            packed,
            _array: PhantomData,
        };
        if iter.packed {
            iter.cursor.seek(0);
        } else {
            iter.skip_dead();
        }
        iter
    }

    /// Advance `idx` to the next slot matching the mask and resync the
    /// data cursor once.
    fn skip_dead(&mut self) {
        let mask = self.mask;
        let len = self.view.len();
        while self.idx + 4 <= len {
            let batch = self.view.alive_at(self.idx)
                | self.view.alive_at(self.idx + 1)
                | self.view.alive_at(self.idx + 2)
                | self.view.alive_at(self.idx + 3);
            if batch & mask != 0 {
                break;
            }
            self.idx += 4;
        }
        while self.idx < len && self.view.alive_at(self.idx) & mask == 0 {
            self.idx += 1;
        }
        self.cursor.seek(self.idx);
    }
}

impl Iterator for AliveIter<'_> {
    type Item = SlotRef;

    fn next(&mut self) -> Option<SlotRef> {
        if self.idx >= self.view.len() {
            return None;
        }
        let item = SlotRef {
            id: self.view.id_at(self.idx),
            alive: self.view.alive_at(self.idx),
            data: self.cursor.data,
            dense_idx: self.idx,
        };
        self.idx += 1;
        if self.packed {
            self.cursor.advance();
        } else {
            self.skip_dead();
        }
        Some(item)
    }
}

/// Iterator over dense runs derived from sector id ranges.
///
/// Each id range converts to a `[lo, hi)` dense run by binary search in the
/// snapshot's sorted ids; runs empty after clamping are dropped. Slots are
/// yielded without alive filtering — callers that need liveness check the
/// alive bits per slot.
pub struct RangedIter<'a> {
    view: DenseView,
    cursor: SnapCursor,
    runs: SmallVec<[(usize, usize); 4]>,
    run_idx: usize,
    idx: usize,
    _array: PhantomData<&'a ()>,
}

impl<'a> RangedIter<'a> {
    pub(crate) fn new(
        view: DenseView,
        chunks: SnapView<*mut u8>,
        stride: usize,
        chunk_capacity: u32,
        ranges: &Ranges,
    ) -> Self {
        let mut runs: SmallVec<[(usize, usize); 4]> = SmallVec::new();
        for range in ranges.iter() {
            let lo = view.lower_bound(range.start);
            let hi = view.lower_bound(range.end);
            if lo < hi {
                runs.push((lo, hi));
            }
        }

        let mut iter = Self {
            view,
            cursor: SnapCursor::new(chunks, stride, chunk_capacity),
            runs,
            run_idx: 0,
            idx: 0,
            _array: PhantomData,
        };
        if let Some(&(lo, _)) = iter.runs.first() {
            iter.idx = lo;
            iter.cursor.seek(lo);
        } else {
            iter.idx = iter.view.len();
        }
        iter
    }

    /// Total slots covered by the clamped runs.
    pub fn covered_len(&self) -> usize {
        self.runs.iter().map(|(lo, hi)| hi - lo).sum()
    }
}

impl Iterator for RangedIter<'_> {
    type Item = SlotRef;

    fn next(&mut self) -> Option<SlotRef> {
        let &(_, hi) = self.runs.get(self.run_idx)?;
        debug_assert!(self.idx < hi);

        let item = SlotRef {
            id: self.view.id_at(self.idx),
            alive: self.view.alive_at(self.idx),
            data: self.cursor.data,
            dense_idx: self.idx,
        };

        self.idx += 1;
        if self.idx >= hi {
            self.run_idx += 1;
            if let Some(&(lo, _)) = self.runs.get(self.run_idx) {
                self.idx = lo;
                self.cursor.seek(lo);
            }
        } else {
            self.cursor.advance();
        }
        Some(item)
    }
}
