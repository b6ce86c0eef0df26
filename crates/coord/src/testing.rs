//! In-memory collaborators for tests and embedded deployments

use crate::broker::Broker;
use idxcoord_core::{
    CollectionId, CoordError, FieldId, PartitionId, Result, SegmentId, SegmentInfo, SegmentState,
};
use parking_lot::RwLock;
use std::collections::{BTreeMap, HashSet};

/// Segment authority backed by a map, with failure injection
#[derive(Default)]
pub struct MemoryBroker {
    segments: RwLock<BTreeMap<SegmentId, SegmentInfo>>,
    failing: RwLock<HashSet<CollectionId>>,
}

impl MemoryBroker {
    /// Empty broker
    pub fn new() -> Self {
        Self::default()
    }

    /// Add or replace a segment
    pub fn upsert_segment(&self, info: SegmentInfo) {
        self.segments.write().insert(info.id, info);
    }

    /// Add a flushed segment whose single field has one data file
    pub fn add_flushed_segment(
        &self,
        collection_id: CollectionId,
        partition_id: PartitionId,
        segment_id: SegmentId,
        num_rows: i64,
        field_id: FieldId,
        data_path: impl Into<String>,
    ) -> SegmentInfo {
        let info = SegmentInfo {
            id: segment_id,
            collection_id,
            partition_id,
            num_rows,
            state: SegmentState::Flushed,
            data_paths: vec![(field_id, vec![data_path.into()])],
        };
        self.upsert_segment(info.clone());
        info
    }

    /// Mark a segment dropped (compaction or collection drop)
    pub fn drop_segment(&self, segment_id: SegmentId) {
        if let Some(info) = self.segments.write().get_mut(&segment_id) {
            info.state = SegmentState::Dropped;
        }
    }

    /// Make every call about `collection_id` fail until cleared
    pub fn fail_collection(&self, collection_id: CollectionId) {
        self.failing.write().insert(collection_id);
    }

    /// Stop failing calls about `collection_id`
    pub fn heal_collection(&self, collection_id: CollectionId) {
        self.failing.write().remove(&collection_id);
    }

    fn check(&self, collection_id: CollectionId) -> Result<()> {
        if self.failing.read().contains(&collection_id) {
            return Err(CoordError::Broker(format!(
                "segment authority unavailable for collection {}",
                collection_id
            )));
        }
        Ok(())
    }
}

impl Broker for MemoryBroker {
    fn get_flushed_segments(
        &self,
        collection_id: CollectionId,
        partition_id: Option<PartitionId>,
    ) -> Result<Vec<SegmentId>> {
        self.check(collection_id)?;
        Ok(self
            .segments
            .read()
            .values()
            .filter(|s| s.collection_id == collection_id && s.state == SegmentState::Flushed)
            .filter(|s| partition_id.map_or(true, |p| s.partition_id == p))
            .map(|s| s.id)
            .collect())
    }

    fn get_segment_info(&self, segment_ids: &[SegmentId]) -> Result<Vec<SegmentInfo>> {
        let segments = self.segments.read();
        let mut out = Vec::with_capacity(segment_ids.len());
        for id in segment_ids {
            if let Some(info) = segments.get(id) {
                self.check(info.collection_id)?;
                out.push(info.clone());
            }
        }
        Ok(out)
    }
}
