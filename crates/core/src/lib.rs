//! Core types for index-build coordination
//!
//! This crate defines the foundational types used throughout the system:
//! - Identifiers: CollectionId, SegmentId, IndexId, BuildId, NodeId
//! - IndexState: the build state machine
//! - Index / SegmentIndex: persisted rows with a Liveness tombstone tag
//! - Protocol: coordinator <-> worker job messages
//! - Error: CoordError and the stable Status/ErrorCode pair
//! - Paths: object-storage layout of build artifacts
//! - RetryConfig: bounded retry with exponential backoff
//! - ConfigManager: priority-merged configuration sources

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod config;
pub mod error;
pub mod model;
pub mod paths;
pub mod protocol;
pub mod retry;
pub mod timestamp;
pub mod types;

pub use config::{ConfigEvent, ConfigManager, EventType, Filter, MapSource, Source, TomlFileSource};
pub use error::{CoordError, ErrorCode, Result, Status};
pub use model::{Index, Liveness, SegmentIndex};
pub use protocol::{
    free_slots, CreateJobRequest, DropJobsRequest, HealthReport, JobInfo, JobStats,
    QueryJobsRequest, QueryJobsResponse, StorageConfig, StorageType, TaskStatistic,
};
pub use retry::{retry, RetryConfig};
pub use timestamp::Timestamp;
pub use types::{
    params_equal, BuildId, CollectionId, FieldId, IndexId, IndexState, KeyValuePair, NodeId,
    PartitionId, SegmentId, SegmentInfo, SegmentState, StateCode, UniqueId, UNASSIGNED_NODE,
};
