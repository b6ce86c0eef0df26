//! Index and SegmentIndex rows
//!
//! Rows are never physically removed when they are dropped. They carry a
//! [`Liveness`] tag instead, and the garbage collector reaps `Deleted` rows
//! once no worker still references their build.

use crate::timestamp::Timestamp;
use crate::types::{
    params_equal, BuildId, CollectionId, FieldId, IndexId, IndexState, KeyValuePair, NodeId,
    PartitionId, SegmentId, UNASSIGNED_NODE,
};
use serde::{Deserialize, Serialize};

/// Tombstone tag carried by every row
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
pub enum Liveness {
    /// Visible
    #[default]
    Active,
    /// Soft-deleted, pending reclamation
    Deleted,
}

/// Index definition over one field of a collection
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Index {
    /// Tenant owning the collection
    pub tenant_id: String,
    /// Collection the index belongs to
    pub collection_id: CollectionId,
    /// Indexed field
    pub field_id: FieldId,
    /// Immutable, globally unique id
    pub index_id: IndexId,
    /// Name, unique among active indexes of the collection
    pub index_name: String,
    /// Field type params (e.g. `dim`)
    pub type_params: Vec<KeyValuePair>,
    /// Effective index params (e.g. `index_type`)
    pub index_params: Vec<KeyValuePair>,
    /// Params as supplied by the user
    pub user_index_params: Vec<KeyValuePair>,
    /// Whether params were chosen automatically
    pub is_auto_index: bool,
    /// Tombstone tag
    pub liveness: Liveness,
    /// Creation time
    pub create_time: Timestamp,
}

impl Index {
    /// Soft-deleted
    pub fn is_deleted(&self) -> bool {
        self.liveness == Liveness::Deleted
    }

    /// Same type and index params, ignoring order
    pub fn params_match(&self, other: &Index) -> bool {
        params_equal(&self.type_params, &other.type_params)
            && params_equal(&self.index_params, &other.index_params)
    }
}

/// One build attempt of one index over one segment
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SegmentIndex {
    /// Owning collection
    pub collection_id: CollectionId,
    /// Owning partition
    pub partition_id: PartitionId,
    /// Indexed segment
    pub segment_id: SegmentId,
    /// Rows in the segment
    pub num_rows: i64,
    /// Index definition
    pub index_id: IndexId,
    /// Build attempt handle
    pub build_id: BuildId,
    /// Worker owning the attempt, [`UNASSIGNED_NODE`] if none
    pub node_id: NodeId,
    /// Monotonic per (segment, index)
    pub index_version: i64,
    /// Build state
    pub index_state: IndexState,
    /// Worker-reported failure reason
    pub fail_reason: String,
    /// Produced files; meaningful only when `Finished`
    pub index_file_keys: Vec<String>,
    /// Tombstone tag
    pub liveness: Liveness,
    /// Creation time
    pub create_time: Timestamp,
    /// Serialized size of the produced files in bytes
    pub index_size: u64,
    /// Whether the result was handed off to query nodes
    pub write_handoff: bool,
}

impl SegmentIndex {
    /// New `Unissued` row for a fresh build attempt
    pub fn unissued(
        collection_id: CollectionId,
        partition_id: PartitionId,
        segment_id: SegmentId,
        num_rows: i64,
        index_id: IndexId,
        build_id: BuildId,
        index_version: i64,
    ) -> Self {
        Self {
            collection_id,
            partition_id,
            segment_id,
            num_rows,
            index_id,
            build_id,
            node_id: UNASSIGNED_NODE,
            index_version,
            index_state: IndexState::Unissued,
            fail_reason: String::new(),
            index_file_keys: Vec::new(),
            liveness: Liveness::Active,
            create_time: Timestamp::now(),
            index_size: 0,
            write_handoff: false,
        }
    }

    /// Soft-deleted
    pub fn is_deleted(&self) -> bool {
        self.liveness == Liveness::Deleted
    }

    /// A worker currently holds a reference to this build
    pub fn is_owned(&self) -> bool {
        self.node_id != UNASSIGNED_NODE
    }

    /// Eligible for placement on a worker
    pub fn is_dispatchable(&self) -> bool {
        !self.is_deleted() && !self.is_owned() && self.index_state == IndexState::Unissued
    }

    /// Build artifacts are stable: nobody is writing them anymore
    pub fn files_recyclable(&self) -> bool {
        !self.is_owned() && self.index_state.is_terminal()
    }
}
