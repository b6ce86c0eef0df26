//! Identifier aliases and shared enums
//!
//! All entity identifiers are signed 64-bit integers allocated by the
//! coordinator. Zero is reserved: a `NodeId` of zero means "no worker owns
//! this build".

use serde::{Deserialize, Serialize};
use std::fmt;

/// Globally unique identifier allocated by the coordinator
pub type UniqueId = i64;
/// Collection identifier
pub type CollectionId = UniqueId;
/// Partition identifier
pub type PartitionId = UniqueId;
/// Segment identifier
pub type SegmentId = UniqueId;
/// Field identifier within a collection schema
pub type FieldId = UniqueId;
/// Index identifier, immutable for the lifetime of an index definition
pub type IndexId = UniqueId;
/// Handle for one build attempt; never reused
pub type BuildId = UniqueId;
/// Worker node identifier; `0` means unowned
pub type NodeId = UniqueId;

/// NodeId value meaning "no worker currently owns the build"
pub const UNASSIGNED_NODE: NodeId = 0;

/// Key/value parameter pair (type params, index params)
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct KeyValuePair {
    /// Parameter name
    pub key: String,
    /// Parameter value
    pub value: String,
}

impl KeyValuePair {
    /// Create a new pair
    pub fn new(key: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            value: value.into(),
        }
    }
}

/// Compare two parameter lists ignoring order
pub fn params_equal(a: &[KeyValuePair], b: &[KeyValuePair]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    let mut a = a.to_vec();
    let mut b = b.to_vec();
    a.sort();
    b.sort();
    a == b
}

/// Build state of one SegmentIndex row
///
/// ```text
/// Unissued -> InProgress -> Finished
///                        -> Failed -> Unissued (explicit retry only)
/// ```
///
/// `None` is only reported by workers for build ids they do not track.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum IndexState {
    /// Unknown to the reporter
    None,
    /// Waiting for placement on a worker
    Unissued,
    /// Accepted by a worker and building
    InProgress,
    /// Build completed; file keys are valid
    Finished,
    /// Build failed; terminal for this build id
    Failed,
}

impl IndexState {
    /// Whether the state machine permits `self -> next`.
    ///
    /// Same-state writes are not transitions and are handled by callers as
    /// idempotent no-ops.
    pub fn can_transition_to(self, next: IndexState) -> bool {
        use IndexState::*;
        matches!(
            (self, next),
            (Unissued, InProgress)
                | (Unissued, Failed)
                | (InProgress, Finished)
                | (InProgress, Failed)
                | (Failed, Unissued)
        )
    }

    /// Finished or Failed
    pub fn is_terminal(self) -> bool {
        matches!(self, IndexState::Finished | IndexState::Failed)
    }

    /// Stable lowercase name
    pub fn name(self) -> &'static str {
        match self {
            IndexState::None => "none",
            IndexState::Unissued => "unissued",
            IndexState::InProgress => "in_progress",
            IndexState::Finished => "finished",
            IndexState::Failed => "failed",
        }
    }
}

impl fmt::Display for IndexState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Segment lifecycle as reported by the segment authority
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SegmentState {
    /// Accepting writes
    Growing,
    /// Sealed, not yet persisted
    Sealed,
    /// Being persisted
    Flushing,
    /// Persisted and immutable; eligible for indexing
    Flushed,
    /// Dropped by compaction or collection drop
    Dropped,
}

/// Segment metadata returned by the segment authority
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SegmentInfo {
    /// Segment id
    pub id: SegmentId,
    /// Owning collection
    pub collection_id: CollectionId,
    /// Owning partition
    pub partition_id: PartitionId,
    /// Row count
    pub num_rows: i64,
    /// Lifecycle state
    pub state: SegmentState,
    /// Object-storage keys of the raw column data, by field
    pub data_paths: Vec<(FieldId, Vec<String>)>,
}

impl SegmentInfo {
    /// Data paths for one field, empty if the field has none
    pub fn field_data_paths(&self, field_id: FieldId) -> Vec<String> {
        self.data_paths
            .iter()
            .find(|(id, _)| *id == field_id)
            .map(|(_, paths)| paths.clone())
            .unwrap_or_default()
    }
}

/// Health of a coordinator or worker process
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum StateCode {
    /// Starting up, not serving
    Initializing,
    /// Serving
    Healthy,
    /// Draining for graceful shutdown
    Stopping,
    /// Failed, not serving
    Abnormal,
}

impl StateCode {
    /// Healthy only
    pub fn is_healthy(self) -> bool {
        self == StateCode::Healthy
    }

    /// Healthy or draining
    pub fn is_healthy_or_stopping(self) -> bool {
        matches!(self, StateCode::Healthy | StateCode::Stopping)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn forward_transitions_allowed() {
        assert!(IndexState::Unissued.can_transition_to(IndexState::InProgress));
        assert!(IndexState::InProgress.can_transition_to(IndexState::Finished));
        assert!(IndexState::InProgress.can_transition_to(IndexState::Failed));
        assert!(IndexState::Failed.can_transition_to(IndexState::Unissued));
    }

    #[test]
    fn backward_transitions_rejected() {
        assert!(!IndexState::Finished.can_transition_to(IndexState::InProgress));
        assert!(!IndexState::Finished.can_transition_to(IndexState::Unissued));
        assert!(!IndexState::InProgress.can_transition_to(IndexState::Unissued));
        assert!(!IndexState::Failed.can_transition_to(IndexState::InProgress));
        assert!(!IndexState::Unissued.can_transition_to(IndexState::None));
    }

    #[test]
    fn params_equal_ignores_order() {
        let a = vec![KeyValuePair::new("dim", "128"), KeyValuePair::new("m", "4")];
        let b = vec![KeyValuePair::new("m", "4"), KeyValuePair::new("dim", "128")];
        assert!(params_equal(&a, &b));
        assert!(!params_equal(&a, &b[..1]));
    }

    #[test]
    fn field_data_paths_lookup() {
        let info = SegmentInfo {
            id: 1,
            collection_id: 1,
            partition_id: 2,
            num_rows: 10,
            state: SegmentState::Flushed,
            data_paths: vec![(10, vec!["a".into(), "b".into()])],
        };
        assert_eq!(info.field_data_paths(10), vec!["a", "b"]);
        assert!(info.field_data_paths(11).is_empty());
    }
}
