//! Chunked sector storage with stable addresses.
//!
//! [`ChunkAllocator`] owns sector memory as fixed-capacity chunks: each
//! chunk is one zero-initialized heap allocation holding `chunk_capacity`
//! sectors. Growing appends chunks, so existing sector addresses never move
//! — the property the pin discipline and the sparse map's cached data
//! pointers rely on. Individual sectors are never freed; reclamation is
//! whole chunks at the tail ([`ChunkAllocator::deallocate`]).
//!
//! The chunk pointer table itself is a [`SnapVec`] so that iterators can
//! snapshot it and keep walking while a concurrent insert appends chunks.
//! Chunk capacity is a power of two; index → (chunk, offset) splits are a
//! shift and a mask.

use std::alloc::{alloc_zeroed, dealloc, handle_alloc_error, Layout};
use std::sync::Arc;

use crate::layout::SectorLayout;
use crate::retire::RetireBin;
use crate::snap::{SnapVec, SnapView};

/// Chunked, stable-address storage for fixed-size sectors.
pub struct ChunkAllocator {
    chunks: SnapVec<*mut u8>,
    layout: Arc<SectorLayout>,
    stride: usize,
    chunk_capacity: u32,
    shift: u32,
    mask: u32,
}

impl ChunkAllocator {
    /// Create an empty allocator for sectors of the given layout.
    ///
    /// `chunk_capacity` must be a non-zero power of two (validated by
    /// `StorageConfig`); superseded chunk-table buffers retire into `bin`.
    pub fn new(layout: Arc<SectorLayout>, chunk_capacity: u32, bin: Arc<RetireBin>) -> Self {
        debug_assert!(chunk_capacity.is_power_of_two());
        let stride = layout.size() as usize;
        Self {
            chunks: SnapVec::new(bin),
            layout,
            stride,
            chunk_capacity,
            shift: chunk_capacity.trailing_zeros(),
            mask: chunk_capacity - 1,
        }
    }

    /// The sector layout this allocator serves.
    pub fn layout(&self) -> &Arc<SectorLayout> {
        &self.layout
    }

    /// Bytes per sector.
    pub fn stride(&self) -> usize {
        self.stride
    }

    /// Sectors per chunk.
    pub fn chunk_capacity(&self) -> u32 {
        self.chunk_capacity
    }

    /// Total sectors currently backed by chunks.
    pub fn capacity(&self) -> usize {
        self.chunks.len() << self.shift
    }

    /// Stable pointer to sector `i`.
    ///
    /// Valid for `i < capacity()`; the address holds until the containing
    /// chunk is deallocated.
    pub fn at(&self, i: usize) -> *mut u8 {
        debug_assert!(i < self.capacity());
        let chunk = self.chunks.get(i >> self.shift);
        // SAFETY: in-bounds sector within the chunk allocation.
        unsafe { chunk.add((i & self.mask as usize) * self.stride) }
    }

    /// Grow until `capacity() >= n` by appending zeroed chunks.
    pub fn allocate(&mut self, n: usize) {
        while self.capacity() < n {
            let layout = self.chunk_layout();
            // SAFETY: chunk size is non-zero (header is at least 8 bytes).
            let ptr = unsafe { alloc_zeroed(layout) };
            if ptr.is_null() {
                handle_alloc_error(layout);
            }
            self.chunks.push(ptr);
        }
        self.chunks.publish(self.chunks.len());
    }

    /// Free whole chunks strictly contained in the sector range `[from, to)`.
    ///
    /// Chunks only partially covered are retained. Only tail ranges release
    /// memory (`to == capacity()`): freeing interior chunks would shift the
    /// addressing of everything behind them.
    pub fn deallocate(&mut self, from: usize, to: usize) {
        let first = from.div_ceil(self.chunk_capacity as usize);
        let last = (to >> self.shift).min(self.chunks.len());
        if first >= last || last != self.chunks.len() {
            return;
        }

        let layout = self.chunk_layout();
        for i in first..last {
            // SAFETY: chunk i was allocated in allocate() with this layout;
            // callers only deallocate at quiescent points (no pins, no
            // snapshot readers of the dropped tail).
            unsafe { dealloc(self.chunks.get(i), layout) };
        }
        self.chunks.truncate(first);
        self.chunks.publish(first);
    }

    /// Relocate `n` sectors from dense index `src` to `dst`.
    ///
    /// Runs are bounded by chunk edges on both sides and moved bitwise;
    /// overlapping ranges are handled by walking forward when moving down
    /// and backward when moving up, as a `memmove` would.
    ///
    /// The caller owns liveness bookkeeping: source slots are logically dead
    /// afterwards and must not be dropped through.
    pub fn move_sectors(&self, dst: usize, src: usize, n: usize) {
        if n == 0 || dst == src {
            return;
        }
        let cap = self.chunk_capacity as usize;

        if dst < src {
            let (mut dst, mut src, mut n) = (dst, src, n);
            while n > 0 {
                let src_room = cap - (src & self.mask as usize);
                let dst_room = cap - (dst & self.mask as usize);
                let run = n.min(src_room).min(dst_room);
                // SAFETY: both runs stay inside single chunks; copy handles
                // the same-chunk overlap case.
                unsafe {
                    std::ptr::copy(self.at(src), self.at(dst), run * self.stride);
                }
                dst += run;
                src += run;
                n -= run;
            }
        } else {
            let (mut dst_end, mut src_end, mut n) = (dst + n, src + n, n);
            while n > 0 {
                let src_in = src_end & self.mask as usize;
                let dst_in = dst_end & self.mask as usize;
                let src_room = if src_in == 0 { cap } else { src_in };
                let dst_room = if dst_in == 0 { cap } else { dst_in };
                let run = n.min(src_room).min(dst_room);
                // SAFETY: as above.
                unsafe {
                    std::ptr::copy(
                        self.at(src_end - run),
                        self.at(dst_end - run),
                        run * self.stride,
                    );
                }
                src_end -= run;
                dst_end -= run;
                n -= run;
            }
        }
    }

    /// Recover the dense index of a sector pointer, if it lives here.
    ///
    /// O(chunks): tests each chunk's address range.
    pub fn find(&self, ptr: *const u8) -> Option<usize> {
        let chunk_bytes = self.chunk_capacity as usize * self.stride;
        for i in 0..self.chunks.len() {
            let base = self.chunks.get(i) as usize;
            let p = ptr as usize;
            if p >= base && p < base + chunk_bytes {
                return Some((i << self.shift) + (p - base) / self.stride);
            }
        }
        None
    }

    /// A byte cursor positioned at sector `i` over the published chunk table.
    pub fn cursor(&self, i: usize) -> SectorCursor {
        SectorCursor::new(
            self.chunks.view(),
            self.stride,
            self.shift,
            self.mask,
            i,
        )
    }

    /// Published snapshot of the chunk table, for iterator construction.
    pub fn chunk_table(&self) -> SnapView<*mut u8> {
        self.chunks.view()
    }

    fn chunk_layout(&self) -> Layout {
        Layout::from_size_align(
            self.chunk_capacity as usize * self.stride,
            self.layout.align() as usize,
        )
        .expect("chunk layout overflow")
    }
}

impl Drop for ChunkAllocator {
    fn drop(&mut self) {
        let layout = self.chunk_layout();
        for i in 0..self.chunks.len() {
            // SAFETY: each chunk was allocated with this layout; sector
            // contents were destroyed by the owning array before drop.
            unsafe { dealloc(self.chunks.get(i), layout) };
        }
    }
}

/// Byte cursor over a chunk-table snapshot, advancing by the sector stride
/// and crossing chunk boundaries without per-step indirection.
pub struct SectorCursor {
    chunks: SnapView<*mut u8>,
    stride: usize,
    shift: u32,
    mask: u32,
    linear: usize,
    cur: *mut u8,
    chunk_end: *mut u8,
}

impl SectorCursor {
    fn new(chunks: SnapView<*mut u8>, stride: usize, shift: u32, mask: u32, i: usize) -> Self {
        let mut cursor = Self {
            chunks,
            stride,
            shift,
            mask,
            linear: 0,
            cur: std::ptr::null_mut(),
            chunk_end: std::ptr::null_mut(),
        };
        cursor.seek(i);
        cursor
    }

    /// Current sector pointer, or null past the last chunk.
    pub fn ptr(&self) -> *mut u8 {
        self.cur
    }

    /// Current linear sector index.
    pub fn linear_index(&self) -> usize {
        self.linear
    }

    /// Step to the next sector.
    pub fn advance(&mut self) {
        self.linear += 1;
        if self.cur.is_null() {
            return;
        }
        // SAFETY: cur stays within or one-past its chunk.
        self.cur = unsafe { self.cur.add(self.stride) };
        if self.cur == self.chunk_end {
            self.enter_chunk(self.linear >> self.shift, 0);
        }
    }

    /// Reposition at an arbitrary linear index.
    pub fn seek(&mut self, i: usize) {
        self.linear = i;
        self.enter_chunk(i >> self.shift, i & self.mask as usize);
    }

    fn enter_chunk(&mut self, chunk_idx: usize, in_chunk: usize) {
        match self.chunks.get(chunk_idx) {
            Some(base) => {
                let chunk_bytes = ((self.mask as usize) + 1) * self.stride;
                // SAFETY: in-chunk offset is below the chunk capacity.
                self.cur = unsafe { base.add(in_chunk * self.stride) };
                self.chunk_end = unsafe { base.add(chunk_bytes) };
            }
            None => {
                self.cur = std::ptr::null_mut();
                self.chunk_end = std::ptr::null_mut();
            }
        }
    }
}
