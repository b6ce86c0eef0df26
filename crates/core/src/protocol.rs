//! Request/response shapes exchanged between the coordinator and workers
//!
//! These are plain data; transport and encoding are up to the caller.

use crate::error::Status;
use crate::timestamp::Timestamp;
use crate::types::{
    BuildId, CollectionId, FieldId, IndexId, IndexState, KeyValuePair, NodeId, PartitionId,
    SegmentId,
};
use serde::{Deserialize, Serialize};

/// Kind of object store a worker should open for a job
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum StorageType {
    /// Directory on the local filesystem
    Local,
    /// Process-local in-memory store
    Memory,
}

/// Object-store configuration shipped with every build job
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct StorageConfig {
    /// Store kind
    pub storage_type: StorageType,
    /// Bucket name (informational for local stores)
    pub bucket_name: String,
    /// Root path all keys live under
    pub root_path: String,
}

impl StorageConfig {
    /// Local filesystem store rooted at `root_path`
    pub fn local(root_path: impl Into<String>) -> Self {
        Self {
            storage_type: StorageType::Local,
            bucket_name: "local".to_string(),
            root_path: root_path.into(),
        }
    }

    /// In-memory store rooted at `root_path`
    pub fn memory(root_path: impl Into<String>) -> Self {
        Self {
            storage_type: StorageType::Memory,
            bucket_name: "memory".to_string(),
            root_path: root_path.into(),
        }
    }
}

/// Build job submitted to a worker
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CreateJobRequest {
    /// Coordinator cluster the job belongs to
    pub cluster_id: String,
    /// Build attempt handle
    pub build_id: BuildId,
    /// Index definition id
    pub index_id: IndexId,
    /// Index name
    pub index_name: String,
    /// Root under which index files are written
    pub index_file_prefix: String,
    /// Build attempt version
    pub index_version: i64,
    /// Object-store keys of the raw column data
    pub data_paths: Vec<String>,
    /// Field type params
    pub type_params: Vec<KeyValuePair>,
    /// Index params
    pub index_params: Vec<KeyValuePair>,
    /// Rows in the segment
    pub num_rows: i64,
    /// Object store to read from and write to
    pub storage_config: StorageConfig,
    /// Owning collection
    pub collection_id: CollectionId,
    /// Owning partition
    pub partition_id: PartitionId,
    /// Indexed segment
    pub segment_id: SegmentId,
    /// Indexed field
    pub field_id: FieldId,
}

/// Point-in-time state of one build on a worker
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobInfo {
    /// Build id
    pub build_id: BuildId,
    /// `None` when the worker does not track the build
    pub state: IndexState,
    /// Produced files, valid when `Finished`
    pub index_file_keys: Vec<String>,
    /// Total bytes of produced files
    pub serialized_size: u64,
    /// Failure reason when `Failed`
    pub fail_reason: String,
}

impl JobInfo {
    /// Report for a build the worker does not know
    pub fn unknown(build_id: BuildId) -> Self {
        Self {
            build_id,
            state: IndexState::None,
            index_file_keys: Vec::new(),
            serialized_size: 0,
            fail_reason: String::new(),
        }
    }
}

/// Poll request for a set of builds
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueryJobsRequest {
    /// Cluster scope
    pub cluster_id: String,
    /// Builds to report
    pub build_ids: Vec<BuildId>,
}

/// Poll response, one entry per requested build in request order
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueryJobsResponse {
    /// Call status
    pub status: Status,
    /// Cluster scope
    pub cluster_id: String,
    /// Per-build state
    pub index_infos: Vec<JobInfo>,
}

/// Cancel/forget request
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DropJobsRequest {
    /// Cluster scope
    pub cluster_id: String,
    /// Builds to drop
    pub build_ids: Vec<BuildId>,
}

/// Per-task statistics recorded by a worker
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskStatistic {
    /// Build id
    pub build_id: BuildId,
    /// Rows built
    pub num_rows: i64,
    /// Execution start
    pub start_time: Timestamp,
    /// Execution end, `None` while running
    pub end_time: Option<Timestamp>,
}

/// Queue/slot report used for capacity-aware placement
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobStats {
    /// Call status
    pub status: Status,
    /// Queued plus active
    pub total_job_num: i64,
    /// Executing
    pub in_progress_job_num: i64,
    /// Waiting in the intake queue
    pub enqueue_job_num: i64,
    /// `parallelism - queued - active`, floored at zero
    pub task_slots: i64,
    /// Statistics of tracked tasks
    pub job_infos: Vec<TaskStatistic>,
}

/// Health probe response
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HealthReport {
    /// Reporting node
    pub node_id: NodeId,
    /// Whether the node can accept work
    pub is_healthy: bool,
    /// Reasons when unhealthy
    pub reasons: Vec<String>,
}

/// Free build slots given the configured parallelism and current load
pub fn free_slots(parallelism: usize, queued: usize, active: usize) -> usize {
    parallelism.saturating_sub(queued + active)
}
