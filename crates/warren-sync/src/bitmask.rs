//! Hierarchical bitmap over pinned sector ids.
//!
//! [`PinBitTree`] answers two questions for the pin counters: "is this id's
//! presence bit set?" in O(1), and "what is the highest set id?" in O(log n)
//! of the id range. Level 0 stores one bit per sector id in 64-bit words;
//! each higher level stores one bit per non-empty child word, so the top
//! level is a single word and `highest_set` walks down by picking the
//! highest set bit of one word per level.
//!
//! Structural growth of the level vectors takes the internal write lock;
//! bit flips take the read lock and use atomic fetch-or / fetch-and with
//! acquire-release ordering, so concurrent set/clear/query never block each
//! other once the path exists.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::RwLock;

use warren_core::SectorId;

/// Bits per word; the fan-out of every tree level.
const FANOUT_SHIFT: u32 = 6;
const FANOUT_MASK: u64 = 63;

/// Enough levels to cover the full u32 id range: 32 bits / 6 bits-per-level.
const MAX_LEVELS: usize = 6;

/// Hierarchical presence bitmap with an O(log n) highest-set query.
pub struct PinBitTree {
    levels: RwLock<Vec<Vec<AtomicU64>>>,
}

// Compile-time assertion: the tree must be shareable across threads.
const _: fn() = || {
    fn assert<T: Send + Sync>() {}
    assert::<PinBitTree>();
};

impl Default for PinBitTree {
    fn default() -> Self {
        Self::new()
    }
}

impl PinBitTree {
    /// Create an empty tree.
    pub fn new() -> Self {
        let mut levels = Vec::with_capacity(MAX_LEVELS);
        for _ in 0..MAX_LEVELS {
            levels.push(Vec::new());
        }
        Self {
            levels: RwLock::new(levels),
        }
    }

    /// Number of levels a path for `id` touches (level 0 included).
    fn levels_for(id: SectorId) -> usize {
        let mut levels = 1;
        let mut word = (id as u64) >> FANOUT_SHIFT;
        while word != 0 {
            levels += 1;
            word >>= FANOUT_SHIFT;
        }
        levels
    }

    /// Word index of `id` at each touched level, bottom-up.
    fn path_for(id: SectorId) -> ([usize; MAX_LEVELS], usize) {
        let mut path = [0usize; MAX_LEVELS];
        let mut word = id as u64;
        let mut level = 0;
        loop {
            word >>= FANOUT_SHIFT;
            path[level] = word as usize;
            level += 1;
            if word == 0 {
                break;
            }
        }
        (path, level)
    }

    /// Grow level vectors so every word on `id`'s path exists.
    fn ensure_path(&self, path: &[usize], depth: usize) {
        {
            let levels = self.levels.read().unwrap();
            if (0..depth).all(|l| levels[l].len() > path[l]) {
                return;
            }
        }
        let mut levels = self.levels.write().unwrap();
        for l in 0..depth {
            if levels[l].len() <= path[l] {
                levels[l].resize_with(path[l] + 1, || AtomicU64::new(0));
            }
        }
    }

    /// Set the presence bit for `id`.
    ///
    /// Propagates upward until an ancestor word was already marked.
    pub fn set(&self, id: SectorId) {
        let (path, depth) = Self::path_for(id);
        debug_assert_eq!(depth, Self::levels_for(id));
        self.ensure_path(&path, depth);

        let levels = self.levels.read().unwrap();
        let bit = 1u64 << (id as u64 & FANOUT_MASK);
        let before = levels[0][path[0]].fetch_or(bit, Ordering::AcqRel);
        if before & bit != 0 {
            return;
        }

        for l in 1..depth {
            let child_word = path[l - 1];
            let bit = 1u64 << (child_word as u64 & FANOUT_MASK);
            let before = levels[l][path[l]].fetch_or(bit, Ordering::AcqRel);
            if before & bit != 0 {
                break;
            }
        }
    }

    /// Clear the presence bit for `id`.
    ///
    /// Propagates upward while words empty out; stops at the first level
    /// where a sibling bit remains set.
    pub fn clear(&self, id: SectorId) {
        let (path, depth) = Self::path_for(id);
        let levels = self.levels.read().unwrap();
        if levels[0].len() <= path[0] {
            return;
        }

        let bit = 1u64 << (id as u64 & FANOUT_MASK);
        let before = levels[0][path[0]].fetch_and(!bit, Ordering::AcqRel);
        if before & !bit != 0 {
            return;
        }

        for l in 1..depth {
            if levels[l].len() <= path[l] {
                return;
            }
            let child_word = path[l - 1];
            let bit = 1u64 << (child_word as u64 & FANOUT_MASK);
            let before = levels[l][path[l]].fetch_and(!bit, Ordering::AcqRel);
            if before & !bit != 0 {
                break;
            }
        }
    }

    /// Whether the presence bit for `id` is set.
    pub fn test(&self, id: SectorId) -> bool {
        let word_idx = (id as u64 >> FANOUT_SHIFT) as usize;
        let levels = self.levels.read().unwrap();
        let Some(word) = levels[0].get(word_idx) else {
            return false;
        };
        word.load(Ordering::Acquire) & (1u64 << (id as u64 & FANOUT_MASK)) != 0
    }

    /// Highest set id, or −1 when the tree is empty.
    ///
    /// Walks top-down, taking the highest set bit of one word per level.
    /// Concurrent mutation may make the result stale but never invents ids
    /// that were never set.
    pub fn highest_set(&self) -> i64 {
        let levels = self.levels.read().unwrap();

        // Topmost level whose root word is non-empty. Levels above the
        // currently grown range are empty vectors and skip naturally.
        let mut top: i64 = -1;
        for l in (0..MAX_LEVELS).rev() {
            if !levels[l].is_empty() && levels[l][0].load(Ordering::Acquire) != 0 {
                top = l as i64;
                break;
            }
        }
        if top < 0 {
            return -1;
        }

        let word = levels[top as usize][0].load(Ordering::Acquire);
        let mut idx = (FANOUT_MASK - word.leading_zeros() as u64) as i64;
        for l in (0..top).rev() {
            let Some(word) = levels[l as usize].get(idx as usize) else {
                return -1;
            };
            let word = word.load(Ordering::Acquire);
            if word == 0 {
                return -1; // racing clear emptied the path mid-walk
            }
            let bit = FANOUT_MASK - word.leading_zeros() as u64;
            idx = (idx << FANOUT_SHIFT) | bit as i64;
        }
        idx
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_tree_has_no_highest() {
        let tree = PinBitTree::new();
        assert_eq!(tree.highest_set(), -1);
        assert!(!tree.test(0));
        assert!(!tree.test(1_000_000));
    }

    #[test]
    fn set_then_test_then_clear() {
        let tree = PinBitTree::new();
        tree.set(42);
        assert!(tree.test(42));
        assert!(!tree.test(41));
        tree.clear(42);
        assert!(!tree.test(42));
        assert_eq!(tree.highest_set(), -1);
    }

    #[test]
    fn highest_tracks_scattered_ids() {
        let tree = PinBitTree::new();
        tree.set(0);
        assert_eq!(tree.highest_set(), 0);
        tree.set(5);
        assert_eq!(tree.highest_set(), 5);
        tree.set(3);
        assert_eq!(tree.highest_set(), 5);

        tree.clear(5);
        assert_eq!(tree.highest_set(), 3);
        tree.clear(3);
        assert_eq!(tree.highest_set(), 0);
        tree.clear(0);
        assert_eq!(tree.highest_set(), -1);
    }

    #[test]
    fn multi_level_ids_traverse_correctly() {
        let tree = PinBitTree::new();
        // 300 million needs several levels of the tree.
        tree.set(300_000_000);
        assert!(tree.test(300_000_000));
        assert_eq!(tree.highest_set(), 300_000_000);

        tree.set(7);
        assert_eq!(tree.highest_set(), 300_000_000);

        tree.clear(300_000_000);
        assert_eq!(tree.highest_set(), 7);
        assert!(!tree.test(300_000_000));
    }

    #[test]
    fn clear_keeps_siblings_in_same_word() {
        let tree = PinBitTree::new();
        tree.set(64);
        tree.set(65);
        tree.clear(65);
        assert!(tree.test(64));
        assert_eq!(tree.highest_set(), 64);
    }

    #[test]
    fn clear_absent_id_is_noop() {
        let tree = PinBitTree::new();
        tree.clear(12345);
        assert_eq!(tree.highest_set(), -1);
        tree.set(3);
        tree.clear(9_999_999);
        assert_eq!(tree.highest_set(), 3);
    }

    #[test]
    fn dense_block_highest_descends_to_exact_bit() {
        let tree = PinBitTree::new();
        for id in 1000..1100 {
            tree.set(id);
        }
        assert_eq!(tree.highest_set(), 1099);
        for id in (1000..1100).rev() {
            tree.clear(id);
            let expected = if id == 1000 { -1 } else { id as i64 - 1 };
            assert_eq!(tree.highest_set(), expected);
        }
    }

    #[test]
    fn concurrent_set_clear_converges() {
        use std::sync::Arc;
        let tree = Arc::new(PinBitTree::new());
        let mut handles = Vec::new();
        for t in 0..4u32 {
            let tree = Arc::clone(&tree);
            handles.push(std::thread::spawn(move || {
                for i in 0..500u32 {
                    let id = t * 10_000 + i;
                    tree.set(id);
                    assert!(tree.test(id));
                    tree.clear(id);
                }
            }));
        }
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(tree.highest_set(), -1);
    }

    #[cfg(not(miri))]
    mod proptests {
        use super::*;
        use proptest::prelude::*;
        use std::collections::BTreeSet;

        proptest! {
            #[test]
            fn highest_matches_model(ops in proptest::collection::vec((0u32..200_000, proptest::bool::ANY), 1..100)) {
                let tree = PinBitTree::new();
                let mut model = BTreeSet::new();
                for (id, set) in ops {
                    if set {
                        tree.set(id);
                        model.insert(id);
                    } else {
                        tree.clear(id);
                        model.remove(&id);
                    }
                    let expected = model.iter().next_back().map_or(-1, |&v| v as i64);
                    prop_assert_eq!(tree.highest_set(), expected);
                    for &probe in model.iter().take(5) {
                        prop_assert!(tree.test(probe));
                    }
                }
            }
        }
    }
}
