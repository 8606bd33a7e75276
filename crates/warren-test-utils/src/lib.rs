//! Test fixtures for Warren development.
//!
//! Component types with known sizes and drop behavior, plus a drop ledger
//! for verifying that every constructed value is destroyed exactly once
//! across overwrite, erase, defragment, and clear paths.

#![forbid(unsafe_code)]
#![allow(missing_docs)]
#![deny(rustdoc::broken_intra_doc_links)]

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

/// Plain-old-data position component.
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct Pos {
    pub x: f32,
    pub y: f32,
}

impl Pos {
    pub fn at(x: f32, y: f32) -> Self {
        Self { x, y }
    }
}

/// Plain-old-data velocity component.
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct Vel {
    pub dx: f32,
    pub dy: f32,
}

/// Small marker component.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Tag(pub u32);

/// Heap-owning component: exercises the non-trivial drop paths.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Name(pub String);

impl Name {
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }
}

/// Shared ledger counting constructions and drops of [`Tracked`] values.
///
/// Clones count as constructions, so at any quiescent point
/// `constructed - dropped` equals the number of live values.
#[derive(Clone, Debug, Default)]
pub struct DropLedger {
    constructed: Arc<AtomicUsize>,
    dropped: Arc<AtomicUsize>,
}

impl DropLedger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a tracked value charged to this ledger.
    pub fn make(&self, value: u64) -> Tracked {
        self.constructed.fetch_add(1, Ordering::Relaxed);
        Tracked {
            value,
            ledger: self.clone(),
        }
    }

    pub fn constructed(&self) -> usize {
        self.constructed.load(Ordering::Relaxed)
    }

    pub fn dropped(&self) -> usize {
        self.dropped.load(Ordering::Relaxed)
    }

    pub fn live(&self) -> usize {
        self.constructed() - self.dropped()
    }

    /// Panic unless every constructed value has dropped exactly once.
    pub fn assert_balanced(&self) {
        assert_eq!(
            self.constructed(),
            self.dropped(),
            "leaked or double-dropped tracked values"
        );
    }
}

/// Drop-counting component backed by a [`DropLedger`].
#[derive(Debug)]
pub struct Tracked {
    pub value: u64,
    ledger: DropLedger,
}

impl Clone for Tracked {
    fn clone(&self) -> Self {
        self.ledger.make(self.value)
    }
}

impl Drop for Tracked {
    fn drop(&mut self) {
        self.ledger.dropped.fetch_add(1, Ordering::Relaxed);
    }
}

impl PartialEq for Tracked {
    fn eq(&self, other: &Self) -> bool {
        self.value == other.value
    }
}
