//! Sorted-dense sector storage for the Warren engine.
//!
//! [`SectorsArray`] is the central store: a chunked allocator holding the
//! sector payloads, parallel dense `ids` / `alive` arrays sorted by id, a
//! sparse `id → (data, dense index)` map for O(1) random access, deferred
//! erase with pin arbitration, and two-pointer defragmentation. Iteration
//! happens over atomically published snapshots and never blocks writers.
//!
//! # Concurrency contract
//!
//! - Reading APIs take the array's shared lock; mutating APIs take the
//!   unique lock and wait on the pin counters before relocating or
//!   destroying any sector a pin covers.
//! - A [`PinnedSector`] guarantees its sector is neither relocated nor
//!   destroyed for the handle's lifetime. Pin protects the address and the
//!   engine blocks member mutation at or below the highest pinned id, so
//!   shared references served under a pin stay valid.
//! - Snapshot iterators ([`SectorIter`], [`AliveIter`], [`RangedIter`])
//!   observe the `(ids, alive, len)` triple published at construction. They
//!   may miss later inserts and may expose slots that died afterwards; the
//!   traversal itself stays in bounds. Concurrent *relocation* is kept away
//!   by a pin on the iteration bound — the view layer pins the back sector,
//!   and lock-holding helpers like [`SectorsArray::for_each_alive`] block
//!   writers outright.

#![deny(missing_docs)]
#![deny(rustdoc::broken_intra_doc_links)]

pub mod array;
pub mod dense;
pub mod iter;
pub mod pin;
pub mod sparse;

pub use array::{PinSectors, SectorsArray};
pub use iter::{AliveIter, ArraySnapshot, RangedIter, SectorIter, SlotRef};
pub use pin::PinnedSector;
