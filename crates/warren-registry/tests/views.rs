//! View semantics: alive filtering, multi-array projection, ranged
//! iteration, and `each` skipping.

use warren_core::Ranges;
use warren_registry::Registry;
use warren_test_utils::{Name, Pos, Tag, Vel};

#[test]
fn alive_filter_scenario() {
    // Vel everywhere, Pos only on even ids: a Pos-driven view yields the
    // even ids; destroying two positions narrows it further.
    let registry = Registry::new();
    for id in 0..10u32 {
        let e = registry.take_entity();
        assert_eq!(e, id);
        registry.add_component(e, Vel { dx: 1.0, dy: 0.0 });
        if id % 2 == 0 {
            registry.add_component(e, Pos::at(id as f32, 0.0));
        }
    }

    let collect = || -> Vec<u32> {
        registry
            .view::<(Pos,)>()
            .iter()
            .map(|(id, _)| id)
            .collect()
    };
    assert_eq!(collect(), vec![0, 2, 4, 6, 8]);

    registry.destroy_component::<Pos>(2);
    registry.destroy_component::<Pos>(8);
    assert_eq!(collect(), vec![0, 4, 6]);
}

#[test]
fn secondary_projection_is_optional_per_row() {
    let registry = Registry::new();
    for id in 0..6u32 {
        let e = registry.take_entity();
        registry.add_component(e, Pos::at(id as f32, 0.0));
        if id % 3 == 0 {
            registry.add_component(e, Tag(id * 10));
        }
    }

    let rows: Vec<(u32, f32, Option<u32>)> = registry
        .view::<(Pos, Tag)>()
        .iter()
        .map(|(id, (pos, tag))| (id, pos.x, tag.map(|t| t.0)))
        .collect();

    assert_eq!(
        rows,
        vec![
            (0, 0.0, Some(0)),
            (1, 1.0, None),
            (2, 2.0, None),
            (3, 3.0, Some(30)),
            (4, 4.0, None),
            (5, 5.0, None),
        ]
    );
}

#[test]
fn each_skips_rows_missing_any_component() {
    let registry = Registry::new();
    for id in 0..8u32 {
        let e = registry.take_entity();
        registry.add_component(e, Pos::at(id as f32, 0.0));
        if id % 2 == 1 {
            registry.add_component(e, Vel { dx: id as f32, dy: 0.0 });
        }
    }

    let mut seen = Vec::new();
    registry.view::<(Pos, Vel)>().each(|id, (pos, vel)| {
        assert_eq!(pos.x, vel.dx);
        seen.push(id);
    });
    assert_eq!(seen, vec![1, 3, 5, 7]);
}

#[test]
fn co_located_group_projects_without_lookup() {
    let registry = Registry::new();
    registry.register_array::<(Pos, Vel)>(0).unwrap();
    for id in 0..5u32 {
        let e = registry.take_entity();
        registry.add_component(e, Pos::at(id as f32, 0.0));
        registry.add_component(e, Vel { dx: -(id as f32), dy: 0.0 });
    }

    let mut count = 0;
    registry.view::<(Pos, Vel)>().each(|id, (pos, vel)| {
        assert_eq!(pos.x, id as f32);
        assert_eq!(vel.dx, -(id as f32));
        count += 1;
    });
    assert_eq!(count, 5);
}

#[test]
fn ranged_view_respects_id_ranges() {
    let registry = Registry::new();
    for id in 0..50u32 {
        let e = registry.take_entity();
        registry.add_component(e, Pos::at(id as f32, 0.0));
    }

    let mut ranges = Ranges::new();
    for id in 5..10u32 {
        ranges.insert(id);
    }
    for id in 30..33u32 {
        ranges.insert(id);
    }

    let ids: Vec<u32> = registry
        .view_ranged::<(Pos,)>(ranges)
        .iter()
        .map(|(id, _)| id)
        .collect();
    assert_eq!(ids, vec![5, 6, 7, 8, 9, 30, 31, 32]);
}

#[test]
fn ranged_view_clamps_to_existing_ids() {
    let registry = Registry::new();
    for id in [2u32, 3, 7, 20] {
        registry.add_component(id, Pos::at(id as f32, 0.0));
    }

    // Covers absent ids on both sides of the present ones.
    let ranges = Ranges::from_sorted_ids(&[0, 1, 2, 3, 4, 5, 6, 7, 8]);
    let ids: Vec<u32> = registry
        .view_ranged::<(Pos,)>(ranges)
        .iter()
        .map(|(id, _)| id)
        .collect();
    assert_eq!(ids, vec![2, 3, 7]);

    // Entirely out-of-range request yields nothing.
    let empty = Ranges::from_sorted_ids(&[100, 101]);
    assert!(registry.view_ranged::<(Pos,)>(empty).is_empty());
}

#[test]
fn ranged_view_skips_dead_primaries() {
    let registry = Registry::new();
    for id in 0..10u32 {
        registry.add_component(id, Pos::at(id as f32, 0.0));
    }
    registry.destroy_component::<Pos>(4);

    let ranges = Ranges::from_sorted_ids(&(0..10).collect::<Vec<_>>());
    let ids: Vec<u32> = registry
        .view_ranged::<(Pos,)>(ranges)
        .iter()
        .map(|(id, _)| id)
        .collect();
    assert_eq!(ids, vec![0, 1, 2, 3, 5, 6, 7, 8, 9]);
}

#[test]
fn view_over_empty_registry_is_empty() {
    let registry = Registry::new();
    assert!(registry.view::<(Pos,)>().is_empty());
    assert!(registry.view::<(Pos, Vel)>().is_empty());
}

#[test]
fn view_misses_inserts_made_after_construction() {
    let registry = Registry::new();
    for id in 0..4u32 {
        registry.add_component(id, Pos::at(id as f32, 0.0));
    }

    let view = registry.view::<(Pos,)>();
    // Appending above the pinned back sector is allowed mid-view.
    registry.add_component(100, Pos::at(100.0, 0.0));

    let ids: Vec<u32> = view.iter().map(|(id, _)| id).collect();
    assert_eq!(ids, vec![0, 1, 2, 3], "snapshot bounded at construction");
    drop(view);

    let ids: Vec<u32> = registry.view::<(Pos,)>().iter().map(|(id, _)| id).collect();
    assert_eq!(ids, vec![0, 1, 2, 3, 100]);
}

#[test]
fn view_blocks_erase_of_covered_sectors_until_drop() {
    let registry = Registry::new();
    for id in 0..8u32 {
        registry.add_component(id, Pos::at(id as f32, 0.0));
    }
    let array = registry.array_for::<Pos>();

    {
        let view = registry.view::<(Pos,)>();
        array.erase_async(3);
        assert!(array.contains_sector(3), "covered sector survives the view");
        let ids: Vec<u32> = view.iter().map(|(id, _)| id).collect();
        assert_eq!(ids, vec![0, 1, 2, 3, 4, 5, 6, 7]);
    }

    array.process_pending_erases(false);
    assert!(!array.contains_sector(3));
}

#[test]
fn three_and_four_type_views_project() {
    let registry = Registry::new();
    for id in 0..4u32 {
        registry.add_component(id, Pos::at(id as f32, 0.0));
        registry.add_component(id, Vel { dx: 1.0, dy: 1.0 });
        registry.add_component(id, Tag(id));
        registry.add_component(id, Name::new(format!("e{id}")));
    }
    registry.destroy_component::<Tag>(2);

    let mut rows = Vec::new();
    for (id, (_pos, vel, tag, name)) in registry.view::<(Pos, Vel, Tag, Name)>().iter() {
        rows.push((id, vel.is_some(), tag.is_some(), name.is_some()));
    }
    assert_eq!(
        rows,
        vec![
            (0, true, true, true),
            (1, true, true, true),
            (2, true, false, true),
            (3, true, true, true),
        ]
    );

    let mut strict_count = 0;
    registry
        .view::<(Pos, Vel, Tag)>()
        .each(|_, (_, _, _)| strict_count += 1);
    assert_eq!(strict_count, 3, "entity 2 lacks Tag");
}
