//! Error types for index-build coordination
//!
//! `CoordError` is the internal error type used by every crate. Service
//! boundaries never hand it to callers directly: they translate it into a
//! stable [`Status`] (error code plus reason) via [`Status::from_error`].

use crate::types::{BuildId, CollectionId, IndexId, IndexState, NodeId};
use serde::{Deserialize, Serialize};
use std::io;
use thiserror::Error;

/// Result type alias for coordination operations
pub type Result<T> = std::result::Result<T, CoordError>;

/// Error types for index-build coordination
#[derive(Debug, Error)]
pub enum CoordError {
    /// No active index matches the request
    #[error("index not exist: {0}")]
    IndexNotExist(String),

    /// An active index with the same name exists with different params
    #[error("index already exists with different params: {0}")]
    AlreadyExists(String),

    /// Empty index name resolved to more than one active index
    #[error("there are multiple indexes on collection {collection_id}, please specify the index name")]
    AmbiguousIndexName {
        /// Collection that was queried
        collection_id: CollectionId,
    },

    /// Request shape is invalid
    #[error("invalid input: {0}")]
    InvalidInput(String),

    /// State machine rejected a transition
    #[error("invalid state transition for build {build_id}: {from} -> {to}")]
    InvalidStateTransition {
        /// Build id
        build_id: BuildId,
        /// Current state
        from: IndexState,
        /// Requested state
        to: IndexState,
    },

    /// No SegmentIndex row for the build id
    #[error("build id not found: {0}")]
    BuildIdNotFound(BuildId),

    /// Physical removal rejected because a worker still owns the build
    #[error("build {build_id} is still owned by node {node_id}")]
    BuildInUse {
        /// Build id
        build_id: BuildId,
        /// Owning node
        node_id: NodeId,
    },

    /// Physical removal rejected because the row is still live
    #[error("{0} is not marked deleted")]
    NotDeleted(String),

    /// Physical index removal rejected because build rows still reference it
    #[error("index {index_id} is still referenced by {builds} builds")]
    IndexInUse {
        /// Index id
        index_id: IndexId,
        /// Remaining build rows
        builds: usize,
    },

    /// Worker already tracks the (cluster, build) pair
    #[error("duplicated index build task")]
    DuplicateTask,

    /// Worker intake queue is full
    #[error("index build queue is full")]
    QueueFull,

    /// No live, non-stopping worker to place on
    #[error("no available index node")]
    NoAvailableNode,

    /// Worker is not registered
    #[error("node not found: {0}")]
    NodeNotFound(NodeId),

    /// Component is not in a serving state
    #[error("{0} is not healthy")]
    NotHealthy(String),

    /// Durable store failure
    #[error("storage error: {0}")]
    Storage(String),

    /// Object store failure
    #[error("object store error: {0}")]
    ObjectStore(String),

    /// Segment authority failure
    #[error("broker error: {0}")]
    Broker(String),

    /// Worker RPC failure
    #[error("worker error: {0}")]
    Worker(String),

    /// Index build failure
    #[error("build failed: {0}")]
    BuildFailed(String),

    /// Build cancelled by DropJobs
    #[error("build cancelled")]
    Cancelled,

    /// Serialization/deserialization error
    #[error("serialization error: {0}")]
    Serialization(String),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Configuration error
    #[error("config error: {0}")]
    Config(String),
}

impl CoordError {
    /// Create an invalid-input error
    pub fn invalid_input(msg: impl Into<String>) -> Self {
        CoordError::InvalidInput(msg.into())
    }

    /// Create a storage error
    pub fn storage(msg: impl Into<String>) -> Self {
        CoordError::Storage(msg.into())
    }

    /// Create an object store error
    pub fn object_store(msg: impl Into<String>) -> Self {
        CoordError::ObjectStore(msg.into())
    }

    /// Whether the failure is an infrastructure fault worth retrying
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            CoordError::Storage(_)
                | CoordError::ObjectStore(_)
                | CoordError::Broker(_)
                | CoordError::Worker(_)
                | CoordError::Io(_)
        )
    }
}

/// Stable error code returned across service boundaries
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ErrorCode {
    /// Request succeeded
    Success,
    /// Catch-all failure
    UnexpectedError,
    /// No index matches
    IndexNotExist,
    /// Worker refused or failed the build
    BuildIndexError,
    /// Component not serving
    NotReady,
}

/// Error-code-plus-reason pair carried by every response
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Status {
    /// Stable code
    pub code: ErrorCode,
    /// Human readable reason, empty on success
    pub reason: String,
}

impl Status {
    /// Successful status
    pub fn success() -> Self {
        Self {
            code: ErrorCode::Success,
            reason: String::new(),
        }
    }

    /// Failure with an explicit code
    pub fn with_code(code: ErrorCode, reason: impl Into<String>) -> Self {
        Self {
            code,
            reason: reason.into(),
        }
    }

    /// Translate an internal error into a stable status
    pub fn from_error(err: &CoordError) -> Self {
        let code = match err {
            CoordError::IndexNotExist(_) => ErrorCode::IndexNotExist,
            CoordError::DuplicateTask | CoordError::BuildFailed(_) => ErrorCode::BuildIndexError,
            CoordError::NotHealthy(_) => ErrorCode::NotReady,
            _ => ErrorCode::UnexpectedError,
        };
        Self {
            code,
            reason: err.to_string(),
        }
    }

    /// Whether the code is `Success`
    pub fn is_success(&self) -> bool {
        self.code == ErrorCode::Success
    }
}

impl From<toml::de::Error> for CoordError {
    fn from(e: toml::de::Error) -> Self {
        CoordError::Config(e.to_string())
    }
}
