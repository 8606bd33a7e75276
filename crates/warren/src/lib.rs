//! Warren: a sector-based ECS storage engine.
//!
//! Components belonging to one entity are co-located in a *sector* — a
//! fixed-size memory record with a `{id, alive bits}` header — stored in
//! chunked, stable-address memory, indexed both densely (sorted by id, for
//! cache-friendly iteration) and sparsely (directly by id, for O(1)
//! lookup). Concurrent readers pin sectors; structural mutators wait until
//! no pin blocks them, or defer the work to a maintenance pass.
//!
//! # Quick start
//!
//! ```
//! use warren::Registry;
//!
//! #[derive(Clone, Copy, Debug, PartialEq)]
//! struct Pos { x: f32, y: f32 }
//!
//! #[derive(Clone, Copy, Debug, PartialEq)]
//! struct Vel { dx: f32, dy: f32 }
//!
//! let registry = Registry::new();
//! let e = registry.take_entity();
//! registry.add_component(e, Pos { x: 0.0, y: 0.0 });
//! registry.add_component(e, Vel { dx: 1.0, dy: 2.0 });
//!
//! registry.view::<(Pos, Vel)>().each(|id, (pos, vel)| {
//!     assert_eq!(id, e);
//!     assert_eq!(vel.dx, 1.0);
//!     assert_eq!(pos.x, 0.0);
//! });
//! ```
//!
//! The crates underneath, leaves first: `warren-core` (ids, errors, the id
//! range set), `warren-memory` (chunk allocator, sector layouts, retire
//! bin), `warren-sync` (pin counters), `warren-storage` (the sectors
//! array), `warren-registry` (registry and views).

#![deny(missing_docs)]
#![deny(rustdoc::broken_intra_doc_links)]
#![forbid(unsafe_code)]

pub use warren_core::{
    ComponentTypeId, ConfigError, EntityId, IdRange, LayoutError, Ranges, RegistryError,
    SectorId, INVALID_ID,
};
pub use warren_memory::{Component, SectorLayout, SectorLayoutBuilder, StorageConfig};
pub use warren_registry::{
    ArrayMetrics, ComponentGroup, ComponentQuery, PinnedComponent, Registry, RegistryMetrics,
    View, ViewIter,
};
pub use warren_storage::{PinSectors, PinnedSector, SectorsArray};
pub use warren_sync::PinCounters;
