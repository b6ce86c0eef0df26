//! Boundary to the segment-lifecycle authority
//!
//! The coordinator never decides whether a segment exists. It asks the
//! broker, and treats every answer as a snapshot that may already be stale.

use idxcoord_core::{CollectionId, PartitionId, Result, SegmentId, SegmentInfo};

/// Segment authority consumed by the dispatcher, the service and GC
pub trait Broker: Send + Sync {
    /// Flushed, non-dropped segments of a collection, optionally limited to
    /// one partition
    fn get_flushed_segments(
        &self,
        collection_id: CollectionId,
        partition_id: Option<PartitionId>,
    ) -> Result<Vec<SegmentId>>;

    /// Info of the requested segments; unknown ids are omitted
    fn get_segment_info(&self, segment_ids: &[SegmentId]) -> Result<Vec<SegmentInfo>>;
}
