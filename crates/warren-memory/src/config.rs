//! Storage configuration parameters.

use warren_core::ConfigError;

/// Configuration for a sectors array and its chunk allocator.
///
/// Validated at array construction; all values are immutable after creation.
#[derive(Clone, Copy, Debug)]
pub struct StorageConfig {
    /// Number of sectors per allocator chunk.
    ///
    /// Must be a non-zero power of two so sector indexing reduces to
    /// shift/mask. Default: 8192.
    pub chunk_capacity: u32,

    /// Dead-slot ratio above which a maintenance pass compacts the array.
    ///
    /// Clamped to `[0, 1]`. Default: 0.2.
    pub defrag_threshold: f32,
}

impl StorageConfig {
    /// Default sectors per chunk.
    pub const DEFAULT_CHUNK_CAPACITY: u32 = 8192;

    /// Default defragment threshold.
    pub const DEFAULT_DEFRAG_THRESHOLD: f32 = 0.2;

    /// Create a config with default values.
    pub fn new() -> Self {
        Self {
            chunk_capacity: Self::DEFAULT_CHUNK_CAPACITY,
            defrag_threshold: Self::DEFAULT_DEFRAG_THRESHOLD,
        }
    }

    /// Override the chunk capacity.
    pub fn with_chunk_capacity(mut self, sectors: u32) -> Self {
        self.chunk_capacity = sectors;
        self
    }

    /// Override the defragment threshold.
    pub fn with_defrag_threshold(mut self, threshold: f32) -> Self {
        self.defrag_threshold = threshold;
        self
    }

    /// Check the constraints documented on each field.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.chunk_capacity == 0 || !self.chunk_capacity.is_power_of_two() {
            return Err(ConfigError::ChunkCapacityNotPowerOfTwo {
                got: self.chunk_capacity,
            });
        }
        if !(0.0..=1.0).contains(&self.defrag_threshold) {
            return Err(ConfigError::ThresholdOutOfRange {
                got: self.defrag_threshold,
            });
        }
        Ok(())
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self::new()
    }
}
