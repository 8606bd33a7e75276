//! Error types for the Warren storage engine.
//!
//! Hot paths never return errors — absent lookups yield `None` and contract
//! violations panic (see the crate-level docs of `warren-storage`). These
//! enums cover construction-time failures: layout building, configuration
//! validation, and array registration.

use std::error::Error;
use std::fmt;

/// Errors from building a sector layout.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum LayoutError {
    /// More component types than the alive bitfield can track (max 32).
    TooManyMembers {
        /// Number of members requested.
        count: usize,
    },
    /// The same component type was listed twice.
    DuplicateMember {
        /// Name of the duplicated type.
        type_name: &'static str,
    },
    /// The computed sector size does not fit the layout's size field.
    SectorTooLarge {
        /// Total bytes the sector would occupy.
        bytes: usize,
    },
}

impl fmt::Display for LayoutError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::TooManyMembers { count } => {
                write!(f, "sector layout holds at most 32 member types, got {count}")
            }
            Self::DuplicateMember { type_name } => {
                write!(f, "duplicate member type in sector layout: {type_name}")
            }
            Self::SectorTooLarge { bytes } => {
                write!(f, "sector size {bytes} bytes exceeds the layout limit")
            }
        }
    }
}

impl Error for LayoutError {}

/// Errors from registering component arrays in a registry.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum RegistryError {
    /// A group registration overlaps an existing group only partially.
    ///
    /// Either all listed types must be new, or all must already be
    /// co-located in the same array.
    PartialGroupOverlap {
        /// Name of the first type found in an existing group.
        type_name: &'static str,
    },
    /// The underlying layout could not be built.
    Layout(LayoutError),
}

impl fmt::Display for RegistryError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::PartialGroupOverlap { type_name } => {
                write!(
                    f,
                    "partial group registration: {type_name} already belongs to another array"
                )
            }
            Self::Layout(err) => write!(f, "layout error: {err}"),
        }
    }
}

impl Error for RegistryError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            Self::Layout(err) => Some(err),
            _ => None,
        }
    }
}

impl From<LayoutError> for RegistryError {
    fn from(err: LayoutError) -> Self {
        Self::Layout(err)
    }
}

/// Errors from validating a storage configuration.
#[derive(Clone, Debug, PartialEq)]
pub enum ConfigError {
    /// Chunk capacity must be a non-zero power of two.
    ChunkCapacityNotPowerOfTwo {
        /// The rejected value.
        got: u32,
    },
    /// Defragment threshold must lie in `[0, 1]`.
    ThresholdOutOfRange {
        /// The rejected value.
        got: f32,
    },
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ChunkCapacityNotPowerOfTwo { got } => {
                write!(f, "chunk capacity must be a power of two, got {got}")
            }
            Self::ThresholdOutOfRange { got } => {
                write!(f, "defragment threshold must be in [0, 1], got {got}")
            }
        }
    }
}

impl Error for ConfigError {}
