//! Request and response shapes of the coordinator service

use idxcoord_core::{
    BuildId, CollectionId, FieldId, IndexId, IndexState, KeyValuePair, PartitionId, SegmentId,
    Status,
};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Register an index definition
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CreateIndexRequest {
    /// Tenant owning the collection
    #[serde(default)]
    pub tenant_id: String,
    /// Collection
    pub collection_id: CollectionId,
    /// Indexed field
    pub field_id: FieldId,
    /// Index name, unique among the collection's active indexes
    pub index_name: String,
    /// Field type params
    pub type_params: Vec<KeyValuePair>,
    /// Effective index params
    pub index_params: Vec<KeyValuePair>,
    /// Params as the user supplied them
    #[serde(default)]
    pub user_index_params: Vec<KeyValuePair>,
    /// Whether params were chosen automatically
    #[serde(default)]
    pub is_auto_index: bool,
}

/// Aggregate state of one index
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GetIndexStateResponse {
    /// Call status
    pub status: Status,
    /// Aggregate build state
    pub state: IndexState,
    /// Reason of the first failed build
    pub fail_reason: String,
}

/// State of one segment's build
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SegmentIndexState {
    /// Segment
    pub segment_id: SegmentId,
    /// `None` when the segment has no build row
    pub state: IndexState,
    /// Failure reason when `Failed`
    pub fail_reason: String,
}

/// Per-segment build states
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GetSegmentIndexStateResponse {
    /// Call status
    pub status: Status,
    /// One entry per requested segment, in request order
    pub states: Vec<SegmentIndexState>,
}

/// Row-count progress of one index
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct BuildProgress {
    /// Rows covered by finished builds
    pub indexed_rows: i64,
    /// Rows in flushed segments
    pub total_rows: i64,
    /// `total_rows - indexed_rows`
    pub pending_index_rows: i64,
}

/// Progress response
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GetIndexBuildProgressResponse {
    /// Call status
    pub status: Status,
    /// Progress, zero on error
    pub progress: BuildProgress,
}

/// File-level detail of one finished build
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexFilePathInfo {
    /// Segment
    pub segment_id: SegmentId,
    /// Indexed field
    pub field_id: FieldId,
    /// Index
    pub index_id: IndexId,
    /// Build that produced the files
    pub build_id: BuildId,
    /// Index name
    pub index_name: String,
    /// Index params
    pub index_params: Vec<KeyValuePair>,
    /// Full object-store keys of the files
    pub index_file_paths: Vec<String>,
    /// Total bytes
    pub serialized_size: u64,
    /// Build version
    pub index_version: i64,
    /// Rows in the segment
    pub num_rows: i64,
}

/// Finished builds of one segment
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SegmentIndexInfos {
    /// Collection
    pub collection_id: CollectionId,
    /// Segment
    pub segment_id: SegmentId,
    /// Whether any finished build exists
    pub enable_index: bool,
    /// Finished builds
    pub index_infos: Vec<IndexFilePathInfo>,
}

/// File-level detail per segment
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GetIndexInfosResponse {
    /// Call status
    pub status: Status,
    /// Keyed by segment
    pub segment_info: BTreeMap<SegmentId, SegmentIndexInfos>,
}

/// Definition and state of one index
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexDescription {
    /// Name
    pub index_name: String,
    /// Id
    pub index_id: IndexId,
    /// Indexed field
    pub field_id: FieldId,
    /// Field type params
    pub type_params: Vec<KeyValuePair>,
    /// Effective index params
    pub index_params: Vec<KeyValuePair>,
    /// User-supplied params
    pub user_index_params: Vec<KeyValuePair>,
    /// Auto index flag
    pub is_auto_index: bool,
    /// Aggregate state
    pub state: IndexState,
    /// Reason of the first failed build
    pub fail_reason: String,
    /// Row-count progress
    pub progress: BuildProgress,
}

/// DescribeIndex response
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DescribeIndexResponse {
    /// Call status
    pub status: Status,
    /// Matching indexes
    pub index_infos: Vec<IndexDescription>,
}

/// Soft-delete one or all indexes of a collection
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DropIndexRequest {
    /// Collection
    pub collection_id: CollectionId,
    /// When non-empty, only builds of these partitions are dropped and the
    /// index itself is kept
    #[serde(default)]
    pub partition_ids: Vec<PartitionId>,
    /// Index name; empty means the collection's only index
    pub index_name: String,
    /// Drop every index of the collection
    #[serde(default)]
    pub drop_all: bool,
}

/// Metrics response
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GetMetricsResponse {
    /// Call status
    pub status: Status,
    /// JSON topology document
    pub response: String,
    /// Component that produced it
    pub component_name: String,
}
