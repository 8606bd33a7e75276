//! Pin counters and wait primitives for the Warren storage engine.
//!
//! Readers pin a sector id before touching its memory; structural mutators
//! wait until no pin blocks their target. The substrate is fully atomic in
//! the fast path: per-id counters, an aggregated distinct-pinned count, a
//! monotone highest-pinned watermark, and a hierarchical bitmap that makes
//! recomputing the watermark after an unpin logarithmic in the id range.

#![deny(missing_docs)]
#![deny(rustdoc::broken_intra_doc_links)]

pub mod bitmask;
pub mod pins;

pub use bitmask::PinBitTree;
pub use pins::PinCounters;
