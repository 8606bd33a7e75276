//! Sector memory substrate for the Warren storage engine.
//!
//! This crate owns the raw-memory layer: chunked sector storage with stable
//! addresses, compile-once sector layouts with a type-erased operation trio,
//! deferred buffer reclamation, and snapshot-published vectors. It is the
//! home of the workspace's `unsafe` core; every unsafe surface documents the
//! contract it relies on, and the higher layers (`warren-storage`,
//! `warren-registry`) uphold those contracts through the pin and lock
//! discipline described there.

#![deny(missing_docs)]
#![deny(rustdoc::broken_intra_doc_links)]

pub mod chunks;
pub mod config;
pub mod layout;
pub mod retire;
pub mod sector;
pub mod snap;

pub use chunks::{ChunkAllocator, SectorCursor};
pub use config::StorageConfig;
pub use layout::{Component, MemberLayout, MemberOps, SectorLayout, SectorLayoutBuilder};
pub use retire::RetireBin;
pub use sector::SectorHeader;
pub use snap::{RawBuf, SnapVec, SnapView};
