//! Collection statistics.

/// Cumulative counters kept by the collector.
///
/// Snapshot values; obtained through [`crate::collector_stats`].
#[derive(Clone, Copy, Debug, Default)]
pub struct CollectorStats {
    /// Number of collections run since process start.
    pub collections_run: u64,
    /// User objects freed across all collections.
    pub total_objects_freed: u64,
    /// User objects freed by the most recent collection.
    pub last_objects_freed: u64,
}
