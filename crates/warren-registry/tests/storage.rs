//! End-to-end storage behavior: sorted dense order, sparse agreement,
//! defragment stability, and drop accounting.

use std::sync::Arc;

use warren_memory::StorageConfig;
use warren_storage::{PinSectors, SectorsArray};
use warren_test_utils::{DropLedger, Name, Pos, Tracked};

fn array_of<T: warren_memory::Component>() -> Arc<SectorsArray> {
    Arc::new(SectorsArray::of::<T>(StorageConfig::new().with_chunk_capacity(64)).unwrap())
}

#[test]
fn sorted_storage_scenario() {
    // Insert out of order; iteration yields ascending ids with their data.
    let array = array_of::<Pos>();
    for id in [5u32, 1, 3, 4, 2] {
        array.insert(id, Pos::at(id as f32, 0.0));
    }

    assert_eq!(array.size(), 5);
    let ids: Vec<u32> = array.iter().map(|s| s.id).collect();
    assert_eq!(ids, vec![1, 2, 3, 4, 5]);
    for id in 1..=5u32 {
        assert_eq!(array.get_cloned::<Pos>(id).unwrap().x, id as f32);
    }
}

#[test]
fn defragment_stability_scenario() {
    // 1000 sectors, every third destroyed; compaction preserves the
    // survivors in order with correct sparse mappings.
    let array = array_of::<Pos>();
    for id in 0..1000u32 {
        array.insert(id, Pos::at(id as f32, -(id as f32)));
    }
    for id in (0..1000u32).step_by(3) {
        array.destroy_member::<Pos>(id);
    }

    array.defragment();

    let survivors: Vec<u32> = (0..1000).filter(|id| id % 3 != 0).collect();
    assert_eq!(array.size(), survivors.len());
    assert_eq!(array.defragment_size(), 0);

    let yielded: Vec<u32> = array.iter().map(|s| s.id).collect();
    assert_eq!(yielded, survivors, "no dead slot yielded, order kept");

    for &id in &survivors {
        let data = array.find_sector_data(id).expect("survivor mapped");
        let via_iter = array
            .iter()
            .find(|s| s.id == id)
            .expect("survivor iterated");
        assert_eq!(data.as_ptr(), via_iter.data, "sparse points at the moved address");
        assert_eq!(array.get_cloned::<Pos>(id).unwrap().x, id as f32);
    }
}

#[test]
fn erase_compact_updates_survivor_mappings() {
    let array = array_of::<Pos>();
    for id in 0..32u32 {
        array.insert(id, Pos::at(id as f32, 0.0));
    }
    array.erase(10, 5, true); // ids 10..15

    assert_eq!(array.size(), 27);
    let ids: Vec<u32> = array.iter().map(|s| s.id).collect();
    assert!(ids.windows(2).all(|w| w[0] < w[1]), "still strictly sorted");
    for id in 15..32u32 {
        assert_eq!(
            array.find_dense_idx(id),
            ids.iter().position(|&x| x == id),
            "sparse map tracks the shifted position"
        );
    }
}

#[test]
fn member_destroy_then_reinsert_round_trips() {
    let array = array_of::<Name>();
    array.insert(7, Name::new("first"));
    assert!(array.destroy_member::<Name>(7));
    assert_eq!(array.get_cloned::<Name>(7), None);

    array.insert(7, Name::new("second"));
    assert_eq!(array.get_cloned::<Name>(7), Some(Name::new("second")));
    assert_eq!(array.defragment_size(), 0, "revived slot repaid the debt");
}

#[test]
fn every_tracked_value_drops_exactly_once() {
    let ledger = DropLedger::new();
    {
        let array = array_of::<Tracked>();
        for id in 0..100u32 {
            array.insert(id, ledger.make(id as u64));
        }
        assert_eq!(ledger.live(), 100);

        // Overwrites drop the previous values.
        for id in 0..10u32 {
            array.insert(id, ledger.make(1000 + id as u64));
        }
        assert_eq!(ledger.live(), 100);

        // Destroy a stripe, defragment (moves must not double-drop).
        for id in (0..100u32).step_by(4) {
            array.destroy_member::<Tracked>(id);
        }
        assert_eq!(ledger.live(), 75);
        array.defragment();
        assert_eq!(ledger.live(), 75);

        // Erase a range without compaction, then clear the rest.
        array.erase(0, 10, false);
        array.clear();
        assert_eq!(ledger.live(), 0);
    }
    ledger.assert_balanced();
}

#[test]
fn clear_then_reuse_keeps_layout_working() {
    let ledger = DropLedger::new();
    let array = array_of::<Tracked>();
    for id in 0..20u32 {
        array.insert(id, ledger.make(id as u64));
    }
    array.clear();
    assert_eq!(ledger.live(), 0);

    array.insert(5, ledger.make(55));
    assert_eq!(array.get_cloned::<Tracked>(5).unwrap().value, 55);
    drop(array);
    ledger.assert_balanced();
}

#[test]
fn co_located_members_are_independent() {
    use warren_memory::SectorLayoutBuilder;
    use warren_test_utils::Vel;

    let layout = SectorLayoutBuilder::new()
        .member::<Pos>()
        .member::<Vel>()
        .build()
        .unwrap();
    let array = Arc::new(SectorsArray::new(Arc::new(layout), StorageConfig::new()).unwrap());

    array.insert(3, Pos::at(1.0, 2.0));
    array.insert(3, Vel { dx: 9.0, dy: 9.0 });
    assert_eq!(array.size(), 1);

    let before = array.find_sector_data(3).unwrap();
    assert!(array.destroy_member::<Vel>(3));

    // The other member and the sector address are untouched.
    assert_eq!(array.get_cloned::<Pos>(3), Some(Pos::at(1.0, 2.0)));
    assert_eq!(array.get_cloned::<Vel>(3), None);
    assert_eq!(array.find_sector_data(3).unwrap(), before);
    assert!(array.has_member::<Pos>(3));
    assert!(!array.has_member::<Vel>(3));
    assert_eq!(array.defragment_size(), 0, "sector still alive");
}

#[test]
fn reserve_prevents_chunk_growth_during_fill() {
    let array = array_of::<Pos>();
    array.reserve(1000);
    let cap = array.capacity();
    for id in 0..1000u32 {
        array.insert(id, Pos::default());
    }
    assert_eq!(array.capacity(), cap);

    array.erase(0, 990, true);
    array.shrink_to_fit();
    assert!(array.capacity() < cap);
}

#[test]
fn randomized_churn_preserves_invariants() {
    use rand::seq::SliceRandom;
    use rand::{RngExt, SeedableRng};
    use rand_chacha::ChaCha8Rng;

    let mut rng = ChaCha8Rng::seed_from_u64(0x5ec7);
    let array = array_of::<Pos>();
    let mut model: std::collections::BTreeMap<u32, f32> = std::collections::BTreeMap::new();

    let mut ids: Vec<u32> = (0..400).collect();
    ids.shuffle(&mut rng);

    for (round, &id) in ids.iter().enumerate() {
        match rng.random_range(0..10u32) {
            0..=5 => {
                let x = round as f32;
                array.insert(id, Pos::at(x, 0.0));
                model.insert(id, x);
            }
            6..=7 => {
                let destroyed = array.destroy_member::<Pos>(id);
                assert_eq!(destroyed, model.remove(&id).is_some());
            }
            _ => array.defragment(),
        }

        // Dense order is strictly ascending at every step.
        let dense: Vec<u32> = array.iter().map(|s| s.id).collect();
        assert!(dense.windows(2).all(|w| w[0] < w[1]));
    }

    array.defragment();
    let alive: Vec<u32> = array.iter_alive::<Pos>().map(|s| s.id).collect();
    let expected: Vec<u32> = model.keys().copied().collect();
    assert_eq!(alive, expected);
    for (&id, &x) in &model {
        assert_eq!(array.get_cloned::<Pos>(id).unwrap().x, x);
    }
}

#[test]
fn stale_ids_after_async_erase_and_reinsert() {
    // erase_async unmaps immediately (no pins held); reinserting the same
    // id must look up the fresh value, and a later defragment must keep it.
    let array = array_of::<Pos>();
    for id in 0..16u32 {
        array.insert(id, Pos::at(id as f32, 0.0));
    }
    array.erase_async(6);
    assert!(!array.contains_sector(6));

    array.insert(6, Pos::at(66.0, 0.0));
    assert_eq!(array.get_cloned::<Pos>(6).unwrap().x, 66.0);

    array.defragment();
    assert_eq!(array.get_cloned::<Pos>(6).unwrap().x, 66.0);
    assert_eq!(array.defragment_size(), 0);
}
