//! Occupancy metrics for a registry and its arrays.

/// Point-in-time occupancy of one sectors array.
#[derive(Clone, Debug, Default)]
pub struct ArrayMetrics {
    /// Dense slots, alive and dead.
    pub size: usize,
    /// Sectors backed by allocated chunks.
    pub capacity: usize,
    /// Dead slots awaiting defragmentation.
    pub dead_slots: u32,
    /// Ids queued for deferred erase.
    pub pending_erases: usize,
    /// Ids addressable by the sparse map.
    pub sparse_capacity: usize,
}

/// Point-in-time occupancy of a registry.
#[derive(Clone, Debug, Default)]
pub struct RegistryMetrics {
    /// Live entity ids.
    pub entities: usize,
    /// Per-array occupancy, in registration order.
    pub arrays: Vec<ArrayMetrics>,
}
