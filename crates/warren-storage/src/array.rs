//! The sectors array: sorted-dense sector storage with pin arbitration.
//!
//! See the crate docs for the concurrency contract. Internally the array is
//! an `RwLock` over its structural state (allocator, dense columns, sparse
//! map, counters) plus pin counters that live outside the lock: readers pin
//! without blocking writers' lock acquisition, and writers wait on the pins
//! — not the other way around — before touching memory a reader may hold.
//!
//! A note on the slot state machine: `destroy_member` / `destroy_sector`
//! leave the slot mapped, so a later insert at the same id revives it in
//! place. The `erase` family unmaps the slot immediately; the dense entry
//! stays behind as a dead stale record until defragmentation sweeps it out.

use std::ptr::NonNull;
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};

use warren_core::{ConfigError, Ranges, SectorId, INVALID_ID};
use warren_memory::chunks::ChunkAllocator;
use warren_memory::config::StorageConfig;
use warren_memory::layout::{Component, SectorLayout};
use warren_memory::retire::RetireBin;
use warren_memory::sector;
use warren_sync::PinCounters;

use crate::dense::{DenseArrays, DenseCell};
use crate::iter::{AliveIter, ArraySnapshot, RangedIter, SectorIter};
use crate::pin::PinnedSector;
use crate::sparse::{SlotInfo, SparseCell, SparseMap};

/// Structural state guarded by the array's lock.
struct ArrayState {
    alloc: ChunkAllocator,
    dense: DenseArrays,
    sparse: SparseMap,
    size: usize,
    defrag_size: u32,
    defrag_threshold: f32,
    pending_erase: Vec<SectorId>,
}

/// SoA sector store with O(1) id lookup and sorted-dense iteration.
pub struct SectorsArray {
    state: RwLock<ArrayState>,
    /// Publication cells, duplicated outside the lock so snapshot lookups
    /// stay lock-free even while a writer holds the unique lock and waits
    /// on pins — see [`SectorsArray::slot_snapshot`].
    dense_cell: Arc<DenseCell>,
    sparse_cell: Arc<SparseCell>,
    pins: PinCounters,
    layout: Arc<SectorLayout>,
    bin: Arc<RetireBin>,
}

impl SectorsArray {
    /// Create an empty array for the given layout.
    pub fn new(layout: Arc<SectorLayout>, config: StorageConfig) -> Result<Self, ConfigError> {
        config.validate()?;
        let bin = Arc::new(RetireBin::new());
        let dense = DenseArrays::new(Arc::clone(&bin));
        let sparse = SparseMap::new(Arc::clone(&bin));
        let dense_cell = dense.cell();
        let sparse_cell = sparse.cell();
        Ok(Self {
            state: RwLock::new(ArrayState {
                alloc: ChunkAllocator::new(
                    Arc::clone(&layout),
                    config.chunk_capacity,
                    Arc::clone(&bin),
                ),
                dense,
                sparse,
                size: 0,
                defrag_size: 0,
                defrag_threshold: config.defrag_threshold.clamp(0.0, 1.0),
                pending_erase: Vec::new(),
            }),
            dense_cell,
            sparse_cell,
            pins: PinCounters::new(),
            layout,
            bin,
        })
    }

    /// Convenience constructor for a single-component array.
    pub fn of<T: Component>(config: StorageConfig) -> Result<Self, ConfigError> {
        Self::new(Arc::new(SectorLayout::of::<T>()), config)
    }

    /// The sector layout this array stores.
    pub fn layout(&self) -> &Arc<SectorLayout> {
        &self.layout
    }

    /// The array's pin counters.
    pub(crate) fn pin_counters(&self) -> &PinCounters {
        &self.pins
    }

    // ==================== Insert / emplace ====================

    /// Add or overwrite member `T` of the sector at `id`.
    ///
    /// Acquires a slot for `id` (appending or shifting to keep the dense
    /// ids sorted), destroys a previous live value, and constructs the new
    /// one in place.
    ///
    /// # Panics
    ///
    /// Panics when `T` is not part of this array's layout, or on
    /// `INVALID_ID`.
    pub fn insert<T: Component>(&self, id: SectorId, value: T) {
        self.emplace_with(id, move || value)
    }

    /// Like [`SectorsArray::insert`], constructing the value inside the
    /// array's critical section.
    pub fn emplace_with<T: Component>(&self, id: SectorId, make: impl FnOnce() -> T) {
        assert_ne!(id, INVALID_ID, "cannot insert the invalid sector id");
        let member = self
            .layout
            .member_of::<T>()
            .expect("component type is not part of this array's layout");

        let mut state = self.write();
        self.pins.wait_until_changeable(id);

        let (idx, existed) = state.acquire_slot(id);
        let ptr = state.alloc.at(idx);
        // SAFETY: unique lock held, slot owned by this array, header kept
        // truthful by every mutation path.
        let (was_alive, now_alive) = unsafe {
            let was = sector::header(ptr).alive;
            sector::emplace_member(ptr, member, make());
            (was, sector::header(ptr).alive)
        };
        state.dense.store_alive(idx, now_alive);
        if existed && was_alive == 0 && now_alive != 0 {
            // Revived a dead slot that defragmentation had been owed.
            state.defrag_size -= 1;
        }
    }

    /// Insert a batch of members under a single unique-lock acquisition.
    ///
    /// Equivalent to calling [`SectorsArray::insert`] per item, minus the
    /// per-item lock traffic.
    ///
    /// # Panics
    ///
    /// Panics when `T` is not part of this array's layout, or on
    /// `INVALID_ID`.
    pub fn insert_batch<T: Component>(&self, items: impl IntoIterator<Item = (SectorId, T)>) {
        let member = self
            .layout
            .member_of::<T>()
            .expect("component type is not part of this array's layout");

        let mut state = self.write();
        for (id, value) in items {
            assert_ne!(id, INVALID_ID, "cannot insert the invalid sector id");
            self.pins.wait_until_changeable(id);
            let (idx, existed) = state.acquire_slot(id);
            let ptr = state.alloc.at(idx);
            // SAFETY: unique lock held for the whole batch.
            let (was_alive, now_alive) = unsafe {
                let was = sector::header(ptr).alive;
                sector::emplace_member(ptr, member, value);
                (was, sector::header(ptr).alive)
            };
            state.dense.store_alive(idx, now_alive);
            if existed && was_alive == 0 && now_alive != 0 {
                state.defrag_size -= 1;
            }
        }
    }

    /// Destroy member `T` for a batch of ids under one lock acquisition.
    ///
    /// Ids are sorted and clamped to the sparse capacity internally; one
    /// changeability wait on the lowest surviving id covers the batch.
    ///
    /// # Panics
    ///
    /// Panics when `T` is not part of this array's layout.
    pub fn destroy_members<T: Component>(&self, ids: &[SectorId]) {
        let member = self
            .layout
            .member_of::<T>()
            .expect("component type is not part of this array's layout");
        if ids.is_empty() {
            return;
        }

        let mut state = self.write();
        let mut ids: Vec<SectorId> = ids.to_vec();
        ids.sort_unstable();
        let cap = state.sparse.capacity() as u32;
        ids.truncate(ids.partition_point(|&id| id < cap));
        let Some(&first) = ids.first() else {
            return;
        };

        self.pins.wait_until_changeable(first);
        for id in ids {
            let slot = state.sparse.get(id);
            if !slot.is_valid() {
                continue;
            }
            let idx = slot.dense_idx as usize;
            let ptr = state.alloc.at(idx);
            // SAFETY: unique lock + changeability wait.
            if unsafe { sector::destroy_member(ptr, member) } {
                let now = unsafe { sector::header(ptr) }.alive;
                state.dense.store_alive(idx, now);
                if now == 0 {
                    state.defrag_size += 1;
                }
            }
        }
    }

    // ==================== Lookup ====================

    /// Dense index of the sector at `id`.
    pub fn find_dense_idx(&self, id: SectorId) -> Option<usize> {
        let state = self.read();
        let slot = state.sparse.get(id);
        slot.is_valid().then_some(slot.dense_idx as usize)
    }

    /// Whether a sector (alive or dead) is mapped at `id`.
    pub fn contains_sector(&self, id: SectorId) -> bool {
        self.read().sparse.get(id).is_valid()
    }

    /// Raw data pointer of the sector at `id`.
    ///
    /// The pointer is stable only while the caller prevents structural
    /// mutation (a pin, or the single-threaded case). Prefer
    /// [`PinSectors::pin_sector`].
    pub fn find_sector_data(&self, id: SectorId) -> Option<NonNull<u8>> {
        NonNull::new(self.read().sparse.get(id).data)
    }

    /// Alive bits of the sector at `id`, 0 when absent.
    pub fn alive_bits(&self, id: SectorId) -> u32 {
        let state = self.read();
        let slot = state.sparse.get(id);
        if slot.is_valid() {
            state.dense.alive_at(slot.dense_idx as usize)
        } else {
            0
        }
    }

    /// Whether member `T` of the sector at `id` is alive.
    pub fn has_member<T: Component>(&self, id: SectorId) -> bool {
        match self.layout.member_of::<T>() {
            Some(member) => self.alive_bits(id) & member.alive_mask != 0,
            None => false,
        }
    }

    /// Id stored at a dense index.
    pub fn id_at(&self, dense_idx: usize) -> Option<SectorId> {
        let state = self.read();
        (dense_idx < state.size).then(|| state.dense.id_at(dense_idx))
    }

    /// Lock-free published lookup: sector data pointer plus the alive bits
    /// the current dense snapshot carries for it.
    ///
    /// Used by the view layer for secondary projections, which must not
    /// touch the array lock mid-iteration (a writer may already hold it
    /// while waiting on the view's own pins). A fresh insert not yet
    /// covered by the published dense view reads as absent.
    pub fn slot_snapshot(&self, id: SectorId) -> Option<(NonNull<u8>, u32)> {
        let (data, dense_idx) = self.sparse_cell.snapshot().find(id)?;
        let dense = self.dense_cell.view();
        let alive = if (dense_idx as usize) < dense.len() {
            dense.alive_at(dense_idx as usize)
        } else {
            0
        };
        Some((data, alive))
    }

    // ==================== Capacity ====================

    /// Number of dense slots (alive and dead).
    pub fn size(&self) -> usize {
        self.read().size
    }

    /// Whether the array holds no slots.
    pub fn is_empty(&self) -> bool {
        self.size() == 0
    }

    /// Sectors currently backed by allocated chunks.
    pub fn capacity(&self) -> usize {
        self.read().alloc.capacity()
    }

    /// Ids addressable by the sparse map.
    pub fn sparse_capacity(&self) -> usize {
        self.read().sparse.capacity()
    }

    /// Grow allocator and dense capacity to at least `n` sectors.
    pub fn reserve(&self, n: usize) {
        let mut state = self.write();
        if state.alloc.capacity() < n {
            state.alloc.allocate(n);
        }
        state.dense.reserve(n);
    }

    /// Release allocator tail chunks and dense capacity beyond the current
    /// size. Waits until no pin could reference a stale snapshot.
    pub fn shrink_to_fit(&self) {
        let mut state = self.write();
        self.pins.wait_until_changeable(0);
        state.shrink_to_fit();
        self.bin.drain();
    }

    /// Destroy all sectors and reset to empty, retaining allocator chunks.
    pub fn clear(&self) {
        let mut state = self.write();
        self.pins.wait_until_changeable(0);
        state.clear();
    }

    // ==================== Destroy ====================

    /// Destroy member `T` of the sector at `id`.
    ///
    /// Returns whether a live value was destroyed. The slot stays mapped;
    /// if the sector died, the dead slot is owed to defragmentation.
    ///
    /// # Panics
    ///
    /// Panics when `T` is not part of this array's layout.
    pub fn destroy_member<T: Component>(&self, id: SectorId) -> bool {
        let member = self
            .layout
            .member_of::<T>()
            .expect("component type is not part of this array's layout");

        let mut state = self.write();
        let slot = state.sparse.get(id);
        if !slot.is_valid() {
            return false;
        }
        self.pins.wait_until_changeable(id);

        let idx = slot.dense_idx as usize;
        let ptr = state.alloc.at(idx);
        // SAFETY: unique lock + changeability wait.
        let destroyed = unsafe { sector::destroy_member(ptr, member) };
        if destroyed {
            let now = unsafe { sector::header(ptr) }.alive;
            state.dense.store_alive(idx, now);
            if now == 0 {
                state.defrag_size += 1;
            }
        }
        destroyed
    }

    /// Destroy every live member of the sector at `id`, keeping the slot
    /// mapped (dead, reusable until defragmentation).
    ///
    /// Returns whether the sector was alive.
    pub fn destroy_sector(&self, id: SectorId) -> bool {
        let mut state = self.write();
        let slot = state.sparse.get(id);
        if !slot.is_valid() {
            return false;
        }
        self.pins.wait_until_changeable(id);
        state.destroy_mapped(slot)
    }

    /// Destroy the sectors at the given ids.
    ///
    /// Ids are sorted and clamped to the sparse capacity internally; one
    /// changeability wait on the lowest surviving id covers the batch.
    pub fn destroy_sectors(&self, ids: &[SectorId]) {
        if ids.is_empty() {
            return;
        }
        let mut state = self.write();

        let mut ids: Vec<SectorId> = ids.to_vec();
        ids.sort_unstable();
        let cap = state.sparse.capacity() as u32;
        ids.truncate(ids.partition_point(|&id| id < cap));
        let Some(&first) = ids.first() else {
            return;
        };

        self.pins.wait_until_changeable(first);
        for id in ids {
            let slot = state.sparse.get(id);
            if slot.is_valid() {
                state.destroy_mapped(slot);
            }
        }
    }

    // ==================== Erase & maintenance ====================

    /// Destroy `count` sectors starting at a dense index and unmap them.
    ///
    /// With `compact`, the suffix shifts left to close the gap and the
    /// array shrinks; otherwise the slots stay behind dead and unmapped
    /// until defragmentation.
    pub fn erase(&self, dense_idx: usize, count: usize, compact: bool) {
        let mut state = self.write();
        if dense_idx >= state.size || count == 0 {
            return;
        }
        self.pins.wait_until_changeable(state.dense.id_at(dense_idx));
        state.erase_range(dense_idx, count, compact);
    }

    /// Thread-safe deferred erase of the sector at `id`.
    ///
    /// Fast path: absent ids return immediately under the shared lock.
    /// When the sector is unpinned and movable the erase happens now;
    /// otherwise the id joins the pending list for the next maintenance
    /// pass.
    pub fn erase_async(&self, id: SectorId) {
        {
            let state = self.read();
            if !state.sparse.get(id).is_valid() {
                return;
            }
        }

        if !self.pins.is_pinned(id) {
            let mut state = self.write();
            let slot = state.sparse.get(id);
            if !slot.is_valid() {
                return;
            }
            if self.pins.can_move(id) {
                state.erase_mapped(id, slot);
            } else {
                state.pending_erase.push(id);
            }
        } else {
            let mut state = self.write();
            state.pending_erase.push(id);
        }
    }

    /// Process the pending-erase list and optionally defragment.
    ///
    /// Pending ids are sorted and deduplicated; each that is still present
    /// and movable is erased, the rest are re-queued. Afterwards (or when
    /// the list was empty) the array compacts if the dead ratio exceeds the
    /// threshold and `with_defragment` is set.
    pub fn process_pending_erases(&self, with_defragment: bool) {
        let mut state = self.write();

        if !state.pending_erase.is_empty() {
            let mut pending = std::mem::take(&mut state.pending_erase);
            pending.sort_unstable();
            pending.dedup();

            for id in pending {
                let slot = state.sparse.get(id);
                if !slot.is_valid() {
                    continue;
                }
                if self.pins.can_move(id) {
                    state.erase_mapped(id, slot);
                } else {
                    state.pending_erase.push(id);
                }
            }
        }

        if with_defragment && state.needs_defragment() {
            self.pins.wait_until_changeable(0);
            state.defragment();
            self.bin.drain();
        }
    }

    /// Number of ids queued for deferred erase.
    pub fn pending_erase_len(&self) -> usize {
        self.read().pending_erase.len()
    }

    // ==================== Defragmentation ====================

    /// Compact the dense storage, removing every dead slot.
    ///
    /// Waits for all pins to clear, then runs the two-pointer compaction,
    /// shrinks, and drains retired buffers (the wait made this a quiescent
    /// point).
    pub fn defragment(&self) {
        let mut state = self.write();
        self.pins.wait_until_changeable(0);
        state.defragment();
        self.bin.drain();
    }

    /// Compact only if no pin is currently held; returns whether a
    /// compaction ran.
    pub fn try_defragment(&self) -> bool {
        let mut state = self.write();
        if self.pins.has_any_pins() {
            return false;
        }
        state.defragment();
        self.bin.drain();
        true
    }

    /// Number of dead slots among the dense entries.
    pub fn defragment_size(&self) -> u32 {
        self.read().defrag_size
    }

    /// Dead-slot ratio, 0 when empty.
    pub fn defragment_ratio(&self) -> f32 {
        let state = self.read();
        state.ratio()
    }

    /// Whether the dead-slot ratio exceeds the threshold.
    pub fn needs_defragment(&self) -> bool {
        self.read().needs_defragment()
    }

    /// Adjust the defragment threshold (clamped to `[0, 1]`).
    pub fn set_defragment_threshold(&self, threshold: f32) {
        self.write().defrag_threshold = threshold.clamp(0.0, 1.0);
    }

    /// Whether the array has no dead slots.
    pub fn is_packed(&self) -> bool {
        self.read().defrag_size == 0
    }

    // ==================== Iteration ====================

    /// Capture the published state once for repeated traversal.
    ///
    /// Views take one of these at construction so every traversal replays
    /// the same snapshot; the view's pins keep it valid.
    pub fn snapshot(&self) -> ArraySnapshot {
        let state = self.read();
        ArraySnapshot {
            view: state.dense.view(),
            chunks: state.alloc.chunk_table(),
            stride: state.alloc.stride(),
            chunk_capacity: state.alloc.chunk_capacity(),
            packed: state.defrag_size == 0,
            full_mask: self.layout.full_alive_mask(),
        }
    }

    /// Snapshot iterator over every dense slot.
    pub fn iter(&self) -> SectorIter<'_> {
        let state = self.read();
        SectorIter::new(
            state.dense.view(),
            state.alloc.chunk_table(),
            state.alloc.stride(),
            state.alloc.chunk_capacity(),
        )
    }

    /// Snapshot iterator over slots where member `T` is alive.
    ///
    /// # Panics
    ///
    /// Panics when `T` is not part of this array's layout.
    pub fn iter_alive<T: Component>(&self) -> AliveIter<'_> {
        let mask = self
            .layout
            .member_of::<T>()
            .expect("component type is not part of this array's layout")
            .alive_mask;
        self.iter_alive_mask(mask)
    }

    /// Snapshot iterator over slots whose alive bits intersect `mask`.
    ///
    /// The packed fast path (no filtering at all) engages when the array
    /// has no dead slots and the mask covers the whole sector.
    pub fn iter_alive_mask(&self, mask: u32) -> AliveIter<'_> {
        let state = self.read();
        let packed = state.defrag_size == 0 && mask == self.layout.full_alive_mask();
        AliveIter::new(
            state.dense.view(),
            state.alloc.chunk_table(),
            state.alloc.stride(),
            state.alloc.chunk_capacity(),
            mask,
            packed,
        )
    }

    /// Snapshot iterator over the dense runs covered by sector id ranges.
    pub fn iter_ranged(&self, ranges: &Ranges) -> RangedIter<'_> {
        let state = self.read();
        RangedIter::new(
            state.dense.view(),
            state.alloc.chunk_table(),
            state.alloc.stride(),
            state.alloc.chunk_capacity(),
            ranges,
        )
    }

    /// Invoke `f` for every sector whose member `T` is alive, holding the
    /// shared lock for the duration.
    ///
    /// Writers block until the traversal finishes, which is what makes the
    /// `&T` references safe without pinning. For long traversals under
    /// concurrency prefer a view, which pins instead of locking.
    pub fn for_each_alive<T: Component>(&self, mut f: impl FnMut(SectorId, &T)) {
        let member = self
            .layout
            .member_of::<T>()
            .expect("component type is not part of this array's layout");
        let state = self.read();
        let iter = AliveIter::new(
            state.dense.view(),
            state.alloc.chunk_table(),
            state.alloc.stride(),
            state.alloc.chunk_capacity(),
            member.alive_mask,
            false,
        );
        for slot in iter {
            // SAFETY: the shared lock blocks every mutator for the whole
            // traversal; the alive mask was checked by the iterator.
            let value = unsafe { &*(slot.data.add(member.offset as usize) as *const T) };
            f(slot.id, value);
        }
    }

    // ==================== Internals ====================

    fn read(&self) -> RwLockReadGuard<'_, ArrayState> {
        self.state.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write(&self) -> RwLockWriteGuard<'_, ArrayState> {
        self.state.write().unwrap_or_else(|e| e.into_inner())
    }
}

impl Drop for SectorsArray {
    fn drop(&mut self) {
        let state = self.state.get_mut().unwrap_or_else(|e| e.into_inner());
        state.clear();
    }
}

/// Pinning entry points on a shared array handle.
///
/// Pin handles capture the owning `Arc`, so a pinned sector keeps its whole
/// array alive — the storage a [`PinnedSector`] points into cannot drop out
/// from under it. Implemented on `Arc<SectorsArray>` because the handle
/// must take an owning reference.
pub trait PinSectors {
    /// Pin the sector at `id`; empty handle when absent.
    fn pin_sector(&self, id: SectorId) -> PinnedSector;

    /// Pin the sector at a dense index; empty handle when out of range.
    fn pin_sector_at(&self, dense_idx: usize) -> PinnedSector;

    /// Pin the highest-id sector; empty handle when the array is empty.
    fn pin_back_sector(&self) -> PinnedSector;

    /// Watermark pin on an arbitrary id (the sector need not exist).
    ///
    /// Blocks structural mutation at and below `id` for the handle's
    /// lifetime; views use it to keep their iteration bounds valid.
    fn pin_watermark(&self, id: SectorId) -> PinnedSector;

    /// Clone member `T` of the sector at `id` out under a transient pin.
    fn get_cloned<T: Component>(&self, id: SectorId) -> Option<T>;
}

impl PinSectors for Arc<SectorsArray> {
    fn pin_sector(&self, id: SectorId) -> PinnedSector {
        let state = self.read();
        let slot = state.sparse.get(id);
        if !slot.is_valid() {
            return PinnedSector::empty();
        }
        let alive = state.dense.alive_at(slot.dense_idx as usize);
        PinnedSector::new(Arc::clone(self), id, slot.data, alive)
    }

    fn pin_sector_at(&self, dense_idx: usize) -> PinnedSector {
        let state = self.read();
        if dense_idx >= state.size {
            return PinnedSector::empty();
        }
        PinnedSector::new(
            Arc::clone(self),
            state.dense.id_at(dense_idx),
            state.alloc.at(dense_idx),
            state.dense.alive_at(dense_idx),
        )
    }

    fn pin_back_sector(&self) -> PinnedSector {
        let state = self.read();
        if state.size == 0 {
            return PinnedSector::empty();
        }
        let idx = state.size - 1;
        PinnedSector::new(
            Arc::clone(self),
            state.dense.id_at(idx),
            state.alloc.at(idx),
            state.dense.alive_at(idx),
        )
    }

    fn pin_watermark(&self, id: SectorId) -> PinnedSector {
        PinnedSector::watermark(Arc::clone(self), id)
    }

    fn get_cloned<T: Component>(&self, id: SectorId) -> Option<T> {
        let pinned = self.pin_sector(id);
        let value = pinned.member::<T>().cloned();
        value
    }
}

impl ArrayState {
    fn ratio(&self) -> f32 {
        if self.size == 0 {
            0.0
        } else {
            self.defrag_size as f32 / self.size as f32
        }
    }

    fn needs_defragment(&self) -> bool {
        self.ratio() > self.defrag_threshold
    }

    /// Map `id` to a dense slot, creating one if absent.
    ///
    /// Returns the dense index and whether the slot already existed. A new
    /// slot appends at the tail; when that breaks the sort order, the
    /// insert position is found by binary search and the suffix shifts
    /// right by one. The dense view republishes only after the slot is
    /// fully initialized.
    fn acquire_slot(&mut self, id: SectorId) -> (usize, bool) {
        if id as usize >= self.sparse.capacity() {
            self.sparse.resize(id as usize + 1);
        }

        let existing = self.sparse.get(id);
        if existing.is_valid() {
            return (existing.dense_idx as usize, true);
        }

        self.alloc.allocate(self.size + 1);
        self.dense.resize(self.size + 1);
        let old_size = self.size;
        self.size += 1;

        let mut pos = old_size;
        if !(pos == 0 || id > self.dense.id_at(pos - 1)) {
            pos = self.find_insert_position(id, old_size);
            self.shift_right(pos, 1);
        }

        self.dense.store_id(pos, id);
        self.dense.store_alive(pos, 0);
        // SAFETY: slot memory owned by the allocator; a reused chunk slot
        // may hold stale bytes, so the header is written outright.
        unsafe {
            let hdr = sector::header_mut(self.alloc.at(pos));
            hdr.id = id;
            hdr.alive = 0;
        }
        self.sparse.set(
            id,
            SlotInfo {
                data: self.alloc.at(pos),
                dense_idx: pos as u32,
            },
        );
        self.dense.publish(self.size);

        (pos, false)
    }

    /// First dense position in `[0, len)` whose id is not below `id`.
    fn find_insert_position(&self, id: SectorId, len: usize) -> usize {
        let mut left = 0;
        let mut right = len;
        while left < right {
            let mid = left + (right - left) / 2;
            if self.dense.id_at(mid) < id {
                left = mid + 1;
            } else {
                right = mid;
            }
        }
        left
    }

    /// Shift dense entries and payloads `[from, size - count)` right by
    /// `count`, rewriting the sparse mapping of every moved id.
    fn shift_right(&mut self, from: usize, count: usize) {
        let old_size = self.size - count;
        if old_size <= from {
            return;
        }
        let tail = old_size - from;

        self.alloc.move_sectors(from + count, from, tail);
        for i in (from + count..old_size + count).rev() {
            let id = self.dense.id_at(i - count);
            self.dense.store_id(i, id);
            self.dense.store_alive(i, self.dense.alive_at(i - count));
            self.sparse.set(
                id,
                SlotInfo {
                    data: self.alloc.at(i),
                    dense_idx: i as u32,
                },
            );
        }
    }

    /// Shift dense entries and payloads `[from, size)` left by `count`.
    fn shift_left(&mut self, from: usize, count: usize) {
        if from < count || from > self.size {
            return;
        }
        let tail = self.size - from;
        if tail == 0 {
            return;
        }

        self.alloc.move_sectors(from - count, from, tail);
        for i in 0..tail {
            let dst = from - count + i;
            let id = self.dense.id_at(from + i);
            self.dense.store_id(dst, id);
            self.dense.store_alive(dst, self.dense.alive_at(from + i));
            self.sparse.set(
                id,
                SlotInfo {
                    data: self.alloc.at(dst),
                    dense_idx: dst as u32,
                },
            );
        }
    }

    /// Destroy the members of a mapped slot, keeping the mapping.
    fn destroy_mapped(&mut self, slot: SlotInfo) -> bool {
        let idx = slot.dense_idx as usize;
        let ptr = self.alloc.at(idx);
        let was_alive = self.dense.alive_at(idx) != 0;
        // SAFETY: unique lock held by the caller.
        unsafe { sector::destroy_sector(ptr, self.alloc.layout()) };
        self.dense.store_alive(idx, 0);
        if was_alive {
            self.defrag_size += 1;
        }
        was_alive
    }

    /// Destroy a mapped slot and remove its sparse mapping.
    fn erase_mapped(&mut self, id: SectorId, slot: SlotInfo) {
        self.destroy_mapped(slot);
        self.sparse.clear_slot(id);
    }

    /// Destroy and unmap `count` slots from `begin`, optionally compacting.
    fn erase_range(&mut self, begin: usize, count: usize, compact: bool) {
        let count = count.min(self.size - begin);
        let mut died = 0u32;

        for i in begin..begin + count {
            let id = self.dense.id_at(i);
            // Clear the mapping only if this slot still owns it: a stale
            // dead record may share its id with a reinserted live slot.
            if self.sparse.get(id).dense_idx == i as u32 {
                self.sparse.clear_slot(id);
            }
            if self.dense.alive_at(i) != 0 {
                died += 1;
            }
            // SAFETY: unique lock held by the caller.
            unsafe { sector::destroy_sector(self.alloc.at(i), self.alloc.layout()) };
            self.dense.store_alive(i, 0);
        }

        if compact {
            let dead_before = count as u32 - died;
            self.shift_left(begin + count, count);
            self.size -= count;
            self.defrag_size -= dead_before.min(self.defrag_size);
            self.dense.truncate(self.size);
            self.dense.publish(self.size);
        } else {
            self.defrag_size += died;
        }
    }

    /// Two-pointer compaction over the dense entries and chunk payloads.
    ///
    /// Dead runs are skipped (their still-owned sparse entries cleared);
    /// alive runs move down to the write cursor bitwise, with dense entries
    /// and sparse mappings rewritten per moved sector. The caller has
    /// already established quiescence (no pins).
    fn defragment(&mut self) {
        let n = self.size;
        let mut read = 0;
        let mut write = 0;
        let mut deleted = 0;

        while read < n {
            while read < n && self.dense.alive_at(read) == 0 {
                let id = self.dense.id_at(read);
                if self.sparse.get(id).dense_idx == read as u32 {
                    self.sparse.clear_slot(id);
                }
                read += 1;
                deleted += 1;
            }
            if read >= n {
                break;
            }

            let run_beg = read;
            while read < n && self.dense.alive_at(read) != 0 {
                read += 1;
            }
            let run_len = read - run_beg;

            if write != run_beg {
                self.alloc.move_sectors(write, run_beg, run_len);
                for i in 0..run_len {
                    let id = self.dense.id_at(run_beg + i);
                    self.dense.store_id(write + i, id);
                    self.dense.store_alive(write + i, self.dense.alive_at(run_beg + i));
                    self.sparse.set(
                        id,
                        SlotInfo {
                            data: self.alloc.at(write + i),
                            dense_idx: (write + i) as u32,
                        },
                    );
                }
            }
            write += run_len;
        }

        self.size -= deleted;
        self.defrag_size = 0;
        self.dense.truncate(self.size);
        self.dense.publish(self.size);
        self.shrink_to_fit();
    }

    /// Release tail chunks and dense capacity beyond `size`; republish.
    fn shrink_to_fit(&mut self) {
        let cap = self.alloc.capacity();
        self.alloc.deallocate(self.size, cap);
        self.dense.shrink_to_fit();
        self.dense.publish(self.size);
    }

    /// Destroy every sector and reset to empty, retaining chunks.
    fn clear(&mut self) {
        if self.size == 0 {
            self.pending_erase.clear();
            return;
        }
        if !self.alloc.layout().is_trivial() {
            for i in 0..self.size {
                // SAFETY: unique access via the caller.
                unsafe {
                    sector::destroy_sector(self.alloc.at(i), self.alloc.layout());
                }
            }
        }
        self.sparse.clear_all();
        self.dense.clear();
        self.dense.publish(0);
        self.pending_erase.clear();
        self.size = 0;
        self.defrag_size = 0;
    }
}
