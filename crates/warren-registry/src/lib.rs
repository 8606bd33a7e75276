//! Registry coordinator and views for the Warren storage engine.
//!
//! The [`Registry`] owns one [`SectorsArray`](warren_storage::SectorsArray)
//! per component type (or per explicitly registered co-located group),
//! allocates entity ids from a run-length range set, routes component
//! operations, and builds [`View`]s — typed projections that iterate one
//! primary component and resolve any number of secondaries in O(1) per
//! step.

#![deny(missing_docs)]
#![deny(rustdoc::broken_intra_doc_links)]

pub mod metrics;
pub mod registry;
pub mod type_map;
pub mod view;

pub use metrics::{ArrayMetrics, RegistryMetrics};
pub use registry::{PinnedComponent, Registry};
pub use type_map::TypeRegistry;
pub use view::{ComponentGroup, ComponentQuery, View, ViewIter};
