//! Per-sector pin tracking and the changeability wait.
//!
//! [`PinCounters`] arbitrates between readers holding pointers into sector
//! storage and mutators wishing to relocate or destroy sectors:
//!
//! - A reader pins a sector id, works through the pinned pointer, unpins.
//! - A mutator calls [`PinCounters::wait_until_changeable`] before touching
//!   the sector at a given id; it blocks while any pin at or below the
//!   highest-pinned watermark covers the target.
//!
//! Aggregates kept alongside the raw counters: the number of distinct
//! pinned ids, the highest pinned id (−1 when none), and a [`PinBitTree`]
//! that recomputes the highest in O(log n) after a last unpin. A mutation
//! epoch guards that recompute: when a concurrent pin races in and raises
//! the watermark, the stale recomputation loses the compare-exchange and
//! the raised value survives.

use std::sync::atomic::{AtomicI64, AtomicU16, AtomicU32, AtomicU64, Ordering};
use std::sync::{Condvar, Mutex, RwLock};

use warren_core::{SectorId, INVALID_ID};

use crate::bitmask::PinBitTree;

/// Counters per lazily allocated block.
const BLOCK: usize = 4096;

/// Per-sector pin counters with wait/notify coordination.
pub struct PinCounters {
    /// Lazily allocated counter blocks; a block, once created, lives until
    /// the counters are dropped.
    blocks: RwLock<Vec<Option<Box<[AtomicU16; BLOCK]>>>>,
    /// Presence bitmap of pinned ids.
    bits: PinBitTree,
    /// Highest currently pinned id, or −1.
    max_pinned: AtomicI64,
    /// Distinct ids with counter > 0.
    distinct: AtomicU32,
    /// Mutation epoch; bumped on every pin and unpin.
    epoch: AtomicU64,
    /// Waiter parking for `wait_until_changeable`.
    wait_lock: Mutex<()>,
    wait_cv: Condvar,
}

// Compile-time assertion: PinCounters must be Send + Sync.
const _: fn() = || {
    fn assert<T: Send + Sync>() {}
    assert::<PinCounters>();
};

impl Default for PinCounters {
    fn default() -> Self {
        Self::new()
    }
}

impl PinCounters {
    /// Create with no pins.
    pub fn new() -> Self {
        Self {
            blocks: RwLock::new(Vec::new()),
            bits: PinBitTree::new(),
            max_pinned: AtomicI64::new(-1),
            distinct: AtomicU32::new(0),
            epoch: AtomicU64::new(0),
            wait_lock: Mutex::new(()),
            wait_cv: Condvar::new(),
        }
    }

    /// Increment the pin counter for `id`.
    ///
    /// The first pin on an id publishes its presence bit, bumps the
    /// distinct count, and raises the highest-pinned watermark if `id`
    /// exceeds it.
    ///
    /// # Panics
    ///
    /// Panics on `INVALID_ID` and on counter overflow (more than 65535
    /// simultaneous pins of one sector).
    pub fn pin(&self, id: SectorId) {
        assert_ne!(id, INVALID_ID, "cannot pin the invalid sector id");

        self.epoch.fetch_add(1, Ordering::Release);
        let prev = self.counter(id).fetch_add(1, Ordering::Release);
        assert_ne!(prev, u16::MAX, "pin counter overflow for sector {id}");
        if prev == 0 {
            self.bits.set(id);
            self.distinct.fetch_add(1, Ordering::AcqRel);
        }

        let want = id as i64;
        let mut cur = self.max_pinned.load(Ordering::Relaxed);
        while want > cur {
            match self.max_pinned.compare_exchange_weak(
                cur,
                want,
                Ordering::Release,
                Ordering::Relaxed,
            ) {
                Ok(_) => break,
                Err(actual) => cur = actual,
            }
        }
    }

    /// Decrement the pin counter for `id`.
    ///
    /// The last unpin clears the presence bit, recomputes the watermark,
    /// and wakes every waiter.
    ///
    /// # Panics
    ///
    /// Panics on `INVALID_ID`; unpinning an unpinned id is a logic error
    /// caught by a debug assertion.
    pub fn unpin(&self, id: SectorId) {
        assert_ne!(id, INVALID_ID, "cannot unpin the invalid sector id");

        self.epoch.fetch_add(1, Ordering::Release);
        let prev = self.counter(id).fetch_sub(1, Ordering::Release);
        debug_assert!(prev > 0, "unpin without matching pin for sector {id}");

        if prev == 1 {
            self.bits.clear(id);
            self.distinct.fetch_sub(1, Ordering::AcqRel);
            self.update_max_pinned();
            self.notify_waiters();
        }
    }

    /// Fast test whether the sector at `id` may be relocated right now:
    /// above the watermark and itself unpinned.
    pub fn can_move(&self, id: SectorId) -> bool {
        debug_assert_ne!(id, INVALID_ID);
        id as i64 > self.max_pinned.load(Ordering::Acquire)
            && self.counter(id).load(Ordering::Acquire) == 0
    }

    /// Whether `id` currently has a non-zero pin counter.
    pub fn is_pinned(&self, id: SectorId) -> bool {
        self.counter(id).load(Ordering::Acquire) != 0
    }

    /// Whether any sector is pinned.
    pub fn has_any_pins(&self) -> bool {
        self.distinct.load(Ordering::Acquire) != 0
    }

    /// Number of distinct pinned ids.
    pub fn distinct_pinned(&self) -> u32 {
        self.distinct.load(Ordering::Acquire)
    }

    /// Highest pinned id, or −1 when none.
    pub fn max_pinned(&self) -> i64 {
        self.max_pinned.load(Ordering::Acquire)
    }

    /// Block until the sector at `id` is safe to mutate structurally.
    ///
    /// Two-phase wait: first while `id <= max_pinned` (some pin at or above
    /// the target blocks relocation of the sorted suffix), then while the
    /// per-id counter is non-zero. `id = 0` is the full barrier used before
    /// whole-array compaction. Spurious wakeups are tolerated; there is no
    /// timeout.
    pub fn wait_until_changeable(&self, id: SectorId) {
        debug_assert_ne!(id, INVALID_ID);
        loop {
            if id as i64 <= self.max_pinned.load(Ordering::Acquire) {
                self.park_while(|| id as i64 <= self.max_pinned.load(Ordering::Acquire));
                continue;
            }
            if self.counter(id).load(Ordering::Acquire) != 0 {
                self.park_while(|| self.counter(id).load(Ordering::Acquire) != 0);
                continue;
            }
            return;
        }
    }

    /// Counter for `id`, allocating its block on first touch.
    ///
    /// Blocks are never freed before the counters drop, so the returned
    /// reference stays valid for `&self`'s lifetime even though the block
    /// vector may grow concurrently.
    fn counter(&self, id: SectorId) -> &AtomicU16 {
        let block_idx = id as usize / BLOCK;
        let offset = id as usize % BLOCK;

        {
            let blocks = self.blocks.read().unwrap();
            if let Some(Some(block)) = blocks.get(block_idx) {
                // SAFETY: the box's heap allocation outlives &self; growth
                // of the outer vec moves the Box pointer, not the block.
                return unsafe { &*(&block[offset] as *const AtomicU16) };
            }
        }

        let mut blocks = self.blocks.write().unwrap();
        if blocks.len() <= block_idx {
            blocks.resize_with(block_idx + 1, || None);
        }
        let block = blocks[block_idx]
            .get_or_insert_with(|| Box::new(std::array::from_fn(|_| AtomicU16::new(0))));
        // SAFETY: as above.
        unsafe { &*(&block[offset] as *const AtomicU16) }
    }

    /// Recompute the watermark after a last unpin.
    ///
    /// The epoch re-check drops the recompute when a concurrent pin or
    /// unpin moved the state mid-flight; the racing operation's own update
    /// (or recompute) wins instead.
    fn update_max_pinned(&self) {
        let observed_epoch = self.epoch.load(Ordering::Acquire);
        let cur = self.max_pinned.load(Ordering::Relaxed);
        if cur == -1 {
            return;
        }
        let recomputed = self.bits.highest_set();
        if self.epoch.load(Ordering::Acquire) == observed_epoch
            && self
                .max_pinned
                .compare_exchange(cur, recomputed, Ordering::Release, Ordering::Relaxed)
                .is_ok()
        {
            self.notify_waiters();
        }
    }

    fn notify_waiters(&self) {
        // Taking the lock orders the notify after any waiter's predicate
        // check, so a wakeup between check and sleep cannot be lost.
        drop(self.wait_lock.lock().unwrap());
        self.wait_cv.notify_all();
    }

    fn park_while(&self, blocked: impl Fn() -> bool) {
        let mut guard = self.wait_lock.lock().unwrap();
        while blocked() {
            guard = self.wait_cv.wait(guard).unwrap();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicBool;
    use std::sync::Arc;
    use std::thread;
    use std::time::Duration;

    #[test]
    fn pin_unpin_updates_aggregates() {
        let pins = PinCounters::new();
        assert!(!pins.has_any_pins());
        assert_eq!(pins.max_pinned(), -1);

        pins.pin(7);
        assert!(pins.is_pinned(7));
        assert!(pins.has_any_pins());
        assert_eq!(pins.distinct_pinned(), 1);
        assert_eq!(pins.max_pinned(), 7);

        pins.unpin(7);
        assert!(!pins.is_pinned(7));
        assert!(!pins.has_any_pins());
        assert_eq!(pins.max_pinned(), -1);
    }

    #[test]
    fn nested_pins_count_distinct_once() {
        let pins = PinCounters::new();
        pins.pin(3);
        pins.pin(3);
        pins.pin(3);
        assert_eq!(pins.distinct_pinned(), 1);

        pins.unpin(3);
        pins.unpin(3);
        assert!(pins.is_pinned(3), "two unpins of three");
        assert_eq!(pins.max_pinned(), 3);

        pins.unpin(3);
        assert_eq!(pins.distinct_pinned(), 0);
        assert_eq!(pins.max_pinned(), -1);
    }

    #[test]
    fn watermark_steps_down_through_pinned_ids() {
        let pins = PinCounters::new();
        pins.pin(0);
        pins.pin(5);
        pins.pin(3);
        assert_eq!(pins.max_pinned(), 5);

        pins.unpin(5);
        assert_eq!(pins.max_pinned(), 3);
        pins.unpin(3);
        assert_eq!(pins.max_pinned(), 0);
        pins.unpin(0);
        assert_eq!(pins.max_pinned(), -1);
    }

    #[test]
    fn watermark_handles_multi_level_ids() {
        let pins = PinCounters::new();
        pins.pin(0);
        pins.pin(300_000_000);
        pins.pin(3);
        assert_eq!(pins.max_pinned(), 300_000_000);

        pins.unpin(300_000_000);
        assert_eq!(pins.max_pinned(), 3);
        pins.unpin(3);
        assert_eq!(pins.max_pinned(), 0);
        pins.unpin(0);
        assert_eq!(pins.max_pinned(), -1);
    }

    #[test]
    fn can_move_respects_watermark_and_counter() {
        let pins = PinCounters::new();
        pins.pin(200);
        assert!(!pins.can_move(50), "below the watermark");
        assert!(!pins.can_move(200), "pinned itself");
        assert!(pins.can_move(201), "above every pin");

        pins.unpin(200);
        assert!(pins.can_move(50));
        assert!(pins.can_move(200));
    }

    #[test]
    fn wait_returns_immediately_when_clear() {
        let pins = PinCounters::new();
        pins.wait_until_changeable(0);
        pins.wait_until_changeable(12345);
    }

    #[test]
    fn wait_blocks_until_blocking_pin_released() {
        let pins = Arc::new(PinCounters::new());
        pins.pin(200);

        let released = Arc::new(AtomicBool::new(false));
        let waiter = {
            let pins = Arc::clone(&pins);
            let released = Arc::clone(&released);
            thread::spawn(move || {
                // 50 <= 200 = max_pinned, so this parks until the unpin.
                pins.wait_until_changeable(50);
                assert!(released.load(Ordering::Acquire), "woke before release");
            })
        };

        thread::sleep(Duration::from_millis(50));
        released.store(true, Ordering::Release);
        pins.unpin(200);
        waiter.join().unwrap();
    }

    #[test]
    fn wait_blocks_on_per_id_counter() {
        let pins = Arc::new(PinCounters::new());
        pins.pin(10);

        let waiter = {
            let pins = Arc::clone(&pins);
            thread::spawn(move || {
                pins.wait_until_changeable(10);
                assert!(!pins.is_pinned(10));
            })
        };

        thread::sleep(Duration::from_millis(30));
        pins.unpin(10);
        waiter.join().unwrap();
    }

    #[test]
    fn concurrent_pin_unpin_keeps_invariants() {
        let pins = Arc::new(PinCounters::new());
        let mut handles = Vec::new();
        for t in 0..8u32 {
            let pins = Arc::clone(&pins);
            handles.push(thread::spawn(move || {
                for i in 0..1000u32 {
                    let id = (t * 131 + i) % 512;
                    pins.pin(id);
                    assert!(pins.max_pinned() >= id as i64);
                    pins.unpin(id);
                }
            }));
        }
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(pins.distinct_pinned(), 0);
        assert_eq!(pins.max_pinned(), -1);
        assert!(!pins.has_any_pins());
    }

    #[test]
    fn counter_blocks_span_block_boundaries() {
        let pins = PinCounters::new();
        let ids = [0u32, BLOCK as u32 - 1, BLOCK as u32, 3 * BLOCK as u32 + 17];
        for &id in &ids {
            pins.pin(id);
        }
        assert_eq!(pins.distinct_pinned(), ids.len() as u32);
        for &id in &ids {
            assert!(pins.is_pinned(id));
            pins.unpin(id);
        }
        assert_eq!(pins.max_pinned(), -1);
    }

    #[test]
    #[should_panic(expected = "invalid sector id")]
    fn pinning_invalid_id_panics() {
        PinCounters::new().pin(INVALID_ID);
    }
}
