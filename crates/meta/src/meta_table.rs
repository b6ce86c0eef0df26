//! MetaTable: the authoritative Index / SegmentIndex table
//!
//! The table is mirrored in memory and written through to the [`Catalog`].
//! Every mutation persists first and applies to the mirror only after the
//! durable write succeeded, so a failed write is invisible.
//!
//! The two logical tables have separate locks:
//! - `indexes`: collection -> index id -> Index
//! - `segment_indexes`: build id -> row, plus (segment, index) -> version -> build id
//!   and index id -> build ids
//!
//! Operations touching both take `indexes` first.

use crate::catalog::Catalog;
use idxcoord_core::{
    BuildId, CollectionId, CoordError, Index, IndexId, IndexState, Liveness, NodeId, Result,
    SegmentId, SegmentIndex, UNASSIGNED_NODE,
};
use parking_lot::RwLock;
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use tracing::{debug, info, warn};

/// Fields a state update may carry besides the new state
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StateUpdate {
    /// Target state
    pub state: IndexState,
    /// Failure reason, kept only for `Failed`
    pub fail_reason: String,
    /// Produced files, kept only for `Finished`
    pub index_file_keys: Vec<String>,
    /// Serialized size, kept only for `Finished`
    pub index_size: u64,
}

impl StateUpdate {
    /// Bare state change
    pub fn to(state: IndexState) -> Self {
        Self {
            state,
            fail_reason: String::new(),
            index_file_keys: Vec::new(),
            index_size: 0,
        }
    }

    /// Successful build
    pub fn finished(index_file_keys: Vec<String>, index_size: u64) -> Self {
        Self {
            index_file_keys,
            index_size,
            ..Self::to(IndexState::Finished)
        }
    }

    /// Failed build
    pub fn failed(reason: impl Into<String>) -> Self {
        Self {
            fail_reason: reason.into(),
            ..Self::to(IndexState::Failed)
        }
    }
}

#[derive(Default)]
struct IndexMap {
    by_collection: HashMap<CollectionId, HashMap<IndexId, Index>>,
}

impl IndexMap {
    fn get(&self, collection_id: CollectionId, index_id: IndexId) -> Option<&Index> {
        self.by_collection.get(&collection_id)?.get(&index_id)
    }

    fn active(&self, collection_id: CollectionId) -> impl Iterator<Item = &Index> {
        self.by_collection
            .get(&collection_id)
            .into_iter()
            .flat_map(|m| m.values())
            .filter(|i| !i.is_deleted())
    }

    fn insert(&mut self, index: Index) {
        self.by_collection
            .entry(index.collection_id)
            .or_default()
            .insert(index.index_id, index);
    }

    fn remove(&mut self, collection_id: CollectionId, index_id: IndexId) {
        if let Some(m) = self.by_collection.get_mut(&collection_id) {
            m.remove(&index_id);
            if m.is_empty() {
                self.by_collection.remove(&collection_id);
            }
        }
    }

    fn is_deleted(&self, collection_id: CollectionId, index_id: IndexId) -> bool {
        self.get(collection_id, index_id).map_or(true, Index::is_deleted)
    }
}

#[derive(Default)]
struct SegmentIndexTable {
    by_build: HashMap<BuildId, SegmentIndex>,
    versions: HashMap<(SegmentId, IndexId), BTreeMap<i64, BuildId>>,
    by_index: HashMap<IndexId, HashSet<BuildId>>,
}

impl SegmentIndexTable {
    fn insert(&mut self, row: SegmentIndex) {
        self.versions
            .entry((row.segment_id, row.index_id))
            .or_default()
            .insert(row.index_version, row.build_id);
        self.by_index
            .entry(row.index_id)
            .or_default()
            .insert(row.build_id);
        self.by_build.insert(row.build_id, row);
    }

    fn remove(&mut self, build_id: BuildId) -> Option<SegmentIndex> {
        let row = self.by_build.remove(&build_id)?;
        let pair = (row.segment_id, row.index_id);
        if let Some(versions) = self.versions.get_mut(&pair) {
            versions.remove(&row.index_version);
            if versions.is_empty() {
                self.versions.remove(&pair);
            }
        }
        if let Some(builds) = self.by_index.get_mut(&row.index_id) {
            builds.remove(&build_id);
            if builds.is_empty() {
                self.by_index.remove(&row.index_id);
            }
        }
        Some(row)
    }

    /// Highest-version row for a (segment, index) pair
    fn latest(&self, segment_id: SegmentId, index_id: IndexId) -> Option<&SegmentIndex> {
        let (_, build_id) = self.versions.get(&(segment_id, index_id))?.iter().next_back()?;
        self.by_build.get(build_id)
    }

    fn at_version(
        &self,
        segment_id: SegmentId,
        index_id: IndexId,
        version: i64,
    ) -> Option<&SegmentIndex> {
        let build_id = self.versions.get(&(segment_id, index_id))?.get(&version)?;
        self.by_build.get(build_id)
    }

    /// Active rows of a pair below `version`
    fn superseded_by(
        &self,
        segment_id: SegmentId,
        index_id: IndexId,
        version: i64,
    ) -> Vec<SegmentIndex> {
        self.versions
            .get(&(segment_id, index_id))
            .into_iter()
            .flat_map(|v| v.range(..version).map(|(_, b)| b))
            .filter_map(|b| self.by_build.get(b))
            .filter(|r| !r.is_deleted())
            .cloned()
            .collect()
    }

    fn get_mut_checked(&mut self, build_id: BuildId) -> Result<&mut SegmentIndex> {
        self.by_build
            .get_mut(&build_id)
            .ok_or(CoordError::BuildIdNotFound(build_id))
    }
}

/// Authoritative Index / SegmentIndex table
pub struct MetaTable {
    catalog: Catalog,
    indexes: RwLock<IndexMap>,
    segment_indexes: RwLock<SegmentIndexTable>,
}

impl MetaTable {
    /// Load every row from the catalog
    pub fn new(catalog: Catalog) -> Result<Self> {
        let mut indexes = IndexMap::default();
        for index in catalog.list_indexes()? {
            indexes.insert(index);
        }
        let mut segment_indexes = SegmentIndexTable::default();
        for row in catalog.list_segment_indexes()? {
            segment_indexes.insert(row);
        }
        info!(
            target: "idxcoord::meta",
            indexes = indexes.by_collection.values().map(HashMap::len).sum::<usize>(),
            segment_indexes = segment_indexes.by_build.len(),
            "meta table loaded"
        );
        Ok(Self {
            catalog,
            indexes: RwLock::new(indexes),
            segment_indexes: RwLock::new(segment_indexes),
        })
    }

    /// Catalog the table writes through to
    pub fn catalog(&self) -> &Catalog {
        &self.catalog
    }

    // ------------------------------------------------------------------
    // Index rows
    // ------------------------------------------------------------------

    /// Register an index definition.
    ///
    /// Returns the existing id when an active index with the same name and
    /// params exists. Fails with `AlreadyExists` when the name is taken with
    /// different params, or when the field already carries an index under
    /// another name.
    pub fn create_index(&self, index: Index) -> Result<IndexId> {
        let mut indexes = self.indexes.write();
        for existing in indexes.active(index.collection_id) {
            if existing.index_name == index.index_name {
                if existing.params_match(&index) {
                    debug!(
                        target: "idxcoord::meta",
                        collection_id = index.collection_id,
                        index_id = existing.index_id,
                        "index already exists with same params"
                    );
                    return Ok(existing.index_id);
                }
                return Err(CoordError::AlreadyExists(format!(
                    "index {} on collection {} has different params",
                    index.index_name, index.collection_id
                )));
            }
            if existing.field_id == index.field_id {
                return Err(CoordError::AlreadyExists(format!(
                    "field {} already has index {}",
                    index.field_id, existing.index_name
                )));
            }
        }
        if indexes.get(index.collection_id, index.index_id).is_some() {
            return Err(CoordError::invalid_input(format!(
                "index id {} is already in use",
                index.index_id
            )));
        }

        let mut index = index;
        index.liveness = Liveness::Active;
        self.catalog.save_index(&index)?;
        let index_id = index.index_id;
        info!(
            target: "idxcoord::meta",
            collection_id = index.collection_id,
            index_id,
            index_name = %index.index_name,
            "index created"
        );
        indexes.insert(index);
        Ok(index_id)
    }

    /// Ids of active indexes matching `name`; an empty name matches all
    pub fn get_index_id_by_name(
        &self,
        collection_id: CollectionId,
        name: &str,
    ) -> BTreeSet<IndexId> {
        self.indexes
            .read()
            .active(collection_id)
            .filter(|i| name.is_empty() || i.index_name == name)
            .map(|i| i.index_id)
            .collect()
    }

    /// Resolve `name` to exactly one active index.
    ///
    /// An empty name is accepted only when the collection has a single index.
    pub fn resolve_index(&self, collection_id: CollectionId, name: &str) -> Result<Index> {
        let indexes = self.indexes.read();
        let matches: Vec<&Index> = indexes
            .active(collection_id)
            .filter(|i| name.is_empty() || i.index_name == name)
            .collect();
        match matches.as_slice() {
            [] => Err(CoordError::IndexNotExist(if name.is_empty() {
                format!("collection {} has no index", collection_id)
            } else {
                name.to_string()
            })),
            [one] => Ok((*one).clone()),
            _ => Err(CoordError::AmbiguousIndexName { collection_id }),
        }
    }

    /// Index row, deleted or not
    pub fn get_index(&self, collection_id: CollectionId, index_id: IndexId) -> Option<Index> {
        self.indexes.read().get(collection_id, index_id).cloned()
    }

    /// Active indexes of a collection, ordered by id
    pub fn list_indexes(&self, collection_id: CollectionId) -> Vec<Index> {
        let mut out: Vec<Index> = self.indexes.read().active(collection_id).cloned().collect();
        out.sort_by_key(|i| i.index_id);
        out
    }

    /// Whether the index is soft-deleted or unknown
    pub fn is_index_deleted(&self, collection_id: CollectionId, index_id: IndexId) -> bool {
        self.indexes.read().is_deleted(collection_id, index_id)
    }

    /// Soft-delete indexes of a collection.
    ///
    /// With `drop_all` every active index is marked; otherwise only
    /// `index_id`. Unknown or already deleted ids are a no-op. Returns the ids
    /// that changed.
    pub fn mark_index_deleted(
        &self,
        collection_id: CollectionId,
        index_id: Option<IndexId>,
        drop_all: bool,
    ) -> Result<Vec<IndexId>> {
        let mut indexes = self.indexes.write();
        let mut marked: Vec<Index> = indexes
            .active(collection_id)
            .filter(|i| drop_all || Some(i.index_id) == index_id)
            .cloned()
            .collect();
        if marked.is_empty() {
            return Ok(Vec::new());
        }
        for index in &mut marked {
            index.liveness = Liveness::Deleted;
        }
        self.catalog.save_indexes(&marked)?;

        let ids: Vec<IndexId> = marked.iter().map(|i| i.index_id).collect();
        for index in marked {
            indexes.insert(index);
        }
        info!(target: "idxcoord::meta", collection_id, index_ids = ?ids, "indexes marked deleted");
        Ok(ids)
    }

    /// Soft-deleted indexes
    pub fn get_deleted_indexes(&self) -> Vec<Index> {
        self.indexes
            .read()
            .by_collection
            .values()
            .flat_map(|m| m.values())
            .filter(|i| i.is_deleted())
            .cloned()
            .collect()
    }

    /// Physically remove a soft-deleted index with no remaining build rows.
    /// Unknown ids are a no-op.
    pub fn remove_index(&self, collection_id: CollectionId, index_id: IndexId) -> Result<()> {
        let mut indexes = self.indexes.write();
        let Some(index) = indexes.get(collection_id, index_id) else {
            return Ok(());
        };
        if !index.is_deleted() {
            return Err(CoordError::NotDeleted(format!("index {}", index_id)));
        }
        let builds = self
            .segment_indexes
            .read()
            .by_index
            .get(&index_id)
            .map_or(0, HashSet::len);
        if builds > 0 {
            return Err(CoordError::IndexInUse { index_id, builds });
        }
        self.catalog.drop_index(collection_id, index_id)?;
        indexes.remove(collection_id, index_id);
        info!(target: "idxcoord::meta", collection_id, index_id, "index removed");
        Ok(())
    }

    // ------------------------------------------------------------------
    // SegmentIndex rows
    // ------------------------------------------------------------------

    /// Add a build row for a (segment, index) pair.
    ///
    /// A row already present at the same version makes this a no-op. Active
    /// rows of the pair at lower versions are superseded (soft-deleted) in the
    /// same write.
    pub fn add_segment_index(&self, row: SegmentIndex) -> Result<()> {
        let mut table = self.segment_indexes.write();
        if table
            .at_version(row.segment_id, row.index_id, row.index_version)
            .is_some()
        {
            return Ok(());
        }
        if let Some(latest) = table.latest(row.segment_id, row.index_id) {
            if latest.index_version > row.index_version {
                return Err(CoordError::invalid_input(format!(
                    "segment {} index {} already at version {}",
                    row.segment_id, row.index_id, latest.index_version
                )));
            }
        }
        if table.by_build.contains_key(&row.build_id) {
            return Err(CoordError::invalid_input(format!(
                "build id {} is already in use",
                row.build_id
            )));
        }

        let mut writes = table.superseded_by(row.segment_id, row.index_id, row.index_version);
        for old in &mut writes {
            old.liveness = Liveness::Deleted;
        }
        writes.push(row);
        self.catalog.save_segment_indexes(&writes)?;

        for written in writes {
            debug!(
                target: "idxcoord::meta",
                build_id = written.build_id,
                segment_id = written.segment_id,
                state = %written.index_state,
                liveness = ?written.liveness,
                "segment index written"
            );
            table.insert(written);
        }
        Ok(())
    }

    /// Advance a build's state.
    ///
    /// Writing the current state again is a no-op; any other transition must
    /// be allowed by [`IndexState::can_transition_to`].
    pub fn update_state(&self, build_id: BuildId, update: StateUpdate) -> Result<()> {
        let mut table = self.segment_indexes.write();
        let current = table.get_mut_checked(build_id)?;
        if current.index_state == update.state {
            return Ok(());
        }
        if !current.index_state.can_transition_to(update.state) {
            return Err(CoordError::InvalidStateTransition {
                build_id,
                from: current.index_state,
                to: update.state,
            });
        }

        let mut next = current.clone();
        let from = next.index_state;
        next.index_state = update.state;
        match update.state {
            IndexState::Finished => {
                next.index_file_keys = update.index_file_keys;
                next.index_size = update.index_size;
                next.fail_reason.clear();
            }
            IndexState::Failed => {
                next.fail_reason = update.fail_reason;
                next.index_file_keys.clear();
                next.index_size = 0;
            }
            _ => {
                next.fail_reason.clear();
                next.index_file_keys.clear();
                next.index_size = 0;
            }
        }
        self.catalog.save_segment_index(&next)?;
        info!(
            target: "idxcoord::meta",
            build_id,
            from = %from,
            to = %next.index_state,
            "segment index state updated"
        );
        *current = next;
        Ok(())
    }

    /// Hand an unissued build to a worker: sets the owner and moves to `InProgress`.
    ///
    /// Re-assigning to the same owner is a no-op.
    pub fn assign_node(&self, build_id: BuildId, node_id: NodeId) -> Result<()> {
        if node_id == UNASSIGNED_NODE {
            return Err(CoordError::invalid_input("cannot assign build to node 0"));
        }
        let mut table = self.segment_indexes.write();
        let current = table.get_mut_checked(build_id)?;
        if current.node_id == node_id && current.index_state == IndexState::InProgress {
            return Ok(());
        }
        if current.is_owned() {
            return Err(CoordError::BuildInUse {
                build_id,
                node_id: current.node_id,
            });
        }
        if current.is_deleted() {
            return Err(CoordError::invalid_input(format!("build {} is deleted", build_id)));
        }
        if !current.index_state.can_transition_to(IndexState::InProgress) {
            return Err(CoordError::InvalidStateTransition {
                build_id,
                from: current.index_state,
                to: IndexState::InProgress,
            });
        }

        let mut next = current.clone();
        next.node_id = node_id;
        next.index_state = IndexState::InProgress;
        self.catalog.save_segment_index(&next)?;
        info!(target: "idxcoord::meta", build_id, node_id, "build assigned");
        *current = next;
        Ok(())
    }

    /// Drop the worker reference of a build
    pub fn release_node(&self, build_id: BuildId) -> Result<()> {
        let mut table = self.segment_indexes.write();
        let current = table.get_mut_checked(build_id)?;
        if !current.is_owned() {
            return Ok(());
        }
        let mut next = current.clone();
        let node_id = next.node_id;
        next.node_id = UNASSIGNED_NODE;
        self.catalog.save_segment_index(&next)?;
        debug!(target: "idxcoord::meta", build_id, node_id, "build released");
        *current = next;
        Ok(())
    }

    /// Supersede a build with a fresh `Unissued` attempt under `new_build_id`
    /// at the next version. The old row is released and soft-deleted.
    pub fn reissue(&self, build_id: BuildId, new_build_id: BuildId) -> Result<SegmentIndex> {
        let mut table = self.segment_indexes.write();
        let old = table
            .by_build
            .get(&build_id)
            .cloned()
            .ok_or(CoordError::BuildIdNotFound(build_id))?;
        if old.is_deleted() {
            return Err(CoordError::invalid_input(format!(
                "build {} is already superseded",
                build_id
            )));
        }
        if table.by_build.contains_key(&new_build_id) {
            return Err(CoordError::invalid_input(format!(
                "build id {} is already in use",
                new_build_id
            )));
        }
        let next_version = table
            .latest(old.segment_id, old.index_id)
            .map_or(old.index_version, |r| r.index_version)
            + 1;

        let mut retired = old.clone();
        retired.liveness = Liveness::Deleted;
        retired.node_id = UNASSIGNED_NODE;
        let fresh = SegmentIndex::unissued(
            old.collection_id,
            old.partition_id,
            old.segment_id,
            old.num_rows,
            old.index_id,
            new_build_id,
            next_version,
        );
        self.catalog
            .save_segment_indexes(&[retired.clone(), fresh.clone()])?;

        info!(
            target: "idxcoord::meta",
            old_build_id = build_id,
            build_id = new_build_id,
            index_version = next_version,
            "build reissued"
        );
        table.insert(retired);
        table.insert(fresh.clone());
        Ok(fresh)
    }

    /// Soft-delete every active row matching `pred`; returns how many changed
    pub fn mark_segment_indexes_deleted<F>(&self, pred: F) -> Result<usize>
    where
        F: Fn(&SegmentIndex) -> bool,
    {
        let mut table = self.segment_indexes.write();
        let mut marked: Vec<SegmentIndex> = table
            .by_build
            .values()
            .filter(|r| !r.is_deleted() && pred(r))
            .cloned()
            .collect();
        if marked.is_empty() {
            return Ok(0);
        }
        for row in &mut marked {
            row.liveness = Liveness::Deleted;
        }
        self.catalog.save_segment_indexes(&marked)?;
        let count = marked.len();
        for row in marked {
            table.insert(row);
        }
        info!(target: "idxcoord::meta", count, "segment indexes marked deleted");
        Ok(count)
    }

    /// Physically remove a build row.
    ///
    /// The row must be soft-deleted or belong to a deleted index, and no
    /// worker may own it. Unknown ids are a no-op.
    pub fn remove_segment_index(&self, build_id: BuildId) -> Result<()> {
        let indexes = self.indexes.read();
        let mut table = self.segment_indexes.write();
        let Some(row) = table.by_build.get(&build_id) else {
            return Ok(());
        };
        if row.is_owned() {
            warn!(
                target: "idxcoord::meta",
                build_id,
                node_id = row.node_id,
                "refusing to remove segment index owned by a worker"
            );
            return Err(CoordError::BuildInUse {
                build_id,
                node_id: row.node_id,
            });
        }
        if !row.is_deleted() && !indexes.is_deleted(row.collection_id, row.index_id) {
            return Err(CoordError::NotDeleted(format!("build {}", build_id)));
        }
        self.catalog.drop_segment_index(row)?;
        table.remove(build_id);
        info!(target: "idxcoord::meta", build_id, "segment index removed");
        Ok(())
    }

    /// Build ids referencing an index, sorted
    pub fn get_build_ids_from_index_id(&self, index_id: IndexId) -> Vec<BuildId> {
        let mut ids: Vec<BuildId> = self
            .segment_indexes
            .read()
            .by_index
            .get(&index_id)
            .map(|s| s.iter().copied().collect())
            .unwrap_or_default();
        ids.sort_unstable();
        ids
    }

    /// Row of a build, deleted or not
    pub fn get_segment_index_by_build_id(&self, build_id: BuildId) -> Option<SegmentIndex> {
        self.segment_indexes.read().by_build.get(&build_id).cloned()
    }

    /// Whether any row carries this build id
    pub fn has_build_id(&self, build_id: BuildId) -> bool {
        self.segment_indexes.read().by_build.contains_key(&build_id)
    }

    /// Every row, deleted ones included, ordered by build id
    pub fn get_all_seg_indexes(&self) -> Vec<SegmentIndex> {
        let mut rows: Vec<SegmentIndex> =
            self.segment_indexes.read().by_build.values().cloned().collect();
        rows.sort_by_key(|r| r.build_id);
        rows
    }

    /// Current (highest-version, active) row of a pair
    pub fn get_current_segment_index(
        &self,
        segment_id: SegmentId,
        index_id: IndexId,
    ) -> Option<SegmentIndex> {
        self.segment_indexes
            .read()
            .latest(segment_id, index_id)
            .filter(|r| !r.is_deleted())
            .cloned()
    }

    /// Current rows of one index across segments, ordered by segment
    pub fn list_segment_indexes(&self, index_id: IndexId) -> Vec<SegmentIndex> {
        let table = self.segment_indexes.read();
        let mut rows: Vec<SegmentIndex> = table
            .versions
            .keys()
            .filter(|(_, idx)| *idx == index_id)
            .filter_map(|(seg, idx)| table.latest(*seg, *idx))
            .filter(|r| !r.is_deleted())
            .cloned()
            .collect();
        rows.sort_by_key(|r| r.segment_id);
        rows
    }

    /// Rows waiting for placement, ordered by build id
    pub fn list_unissued(&self) -> Vec<SegmentIndex> {
        let mut rows: Vec<SegmentIndex> = self
            .segment_indexes
            .read()
            .by_build
            .values()
            .filter(|r| r.is_dispatchable())
            .cloned()
            .collect();
        rows.sort_by_key(|r| r.build_id);
        rows
    }

    /// Rows a worker still holds (building, or reported but not yet
    /// released), grouped by owner
    pub fn list_in_progress_by_node(&self) -> HashMap<NodeId, Vec<SegmentIndex>> {
        let mut out: HashMap<NodeId, Vec<SegmentIndex>> = HashMap::new();
        for row in self.segment_indexes.read().by_build.values() {
            if row.is_owned() {
                out.entry(row.node_id).or_default().push(row.clone());
            }
        }
        for rows in out.values_mut() {
            rows.sort_by_key(|r| r.build_id);
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use idxcoord_core::{KeyValuePair, Timestamp};
    use idxcoord_storage::{KvStore, MetaKv};
    use std::sync::Arc;

    fn table() -> MetaTable {
        MetaTable::new(Catalog::new(Arc::new(KvStore::ephemeral()))).unwrap()
    }

    fn index(index_id: IndexId, field_id: i64, name: &str, index_type: &str) -> Index {
        Index {
            tenant_id: String::new(),
            collection_id: 1,
            field_id,
            index_id,
            index_name: name.into(),
            type_params: vec![KeyValuePair::new("dim", "128")],
            index_params: vec![KeyValuePair::new("index_type", index_type)],
            user_index_params: Vec::new(),
            is_auto_index: false,
            liveness: Liveness::Active,
            create_time: Timestamp::EPOCH,
        }
    }

    fn row(segment_id: SegmentId, build_id: BuildId, version: i64) -> SegmentIndex {
        SegmentIndex::unissued(1, 2, segment_id, 1000, 100, build_id, version)
    }

    #[test]
    fn test_create_index_idempotent_and_conflicting() {
        let meta = table();
        assert_eq!(meta.create_index(index(100, 10, "idx", "IVF_FLAT")).unwrap(), 100);
        assert_eq!(meta.create_index(index(101, 10, "idx", "IVF_FLAT")).unwrap(), 100);

        let err = meta.create_index(index(102, 10, "idx", "HNSW")).unwrap_err();
        assert!(matches!(err, CoordError::AlreadyExists(_)));
        assert_eq!(meta.get_index(1, 100).unwrap().index_params[0].value, "IVF_FLAT");

        let err = meta.create_index(index(103, 10, "other", "IVF_FLAT")).unwrap_err();
        assert!(matches!(err, CoordError::AlreadyExists(_)));
        assert_eq!(meta.create_index(index(104, 11, "other", "HNSW")).unwrap(), 104);
    }

    #[test]
    fn test_name_can_be_reused_after_drop() {
        let meta = table();
        meta.create_index(index(100, 10, "idx", "IVF_FLAT")).unwrap();
        meta.mark_index_deleted(1, Some(100), false).unwrap();
        assert_eq!(meta.create_index(index(101, 10, "idx", "HNSW")).unwrap(), 101);
        assert!(meta.is_index_deleted(1, 100));
        assert!(!meta.is_index_deleted(1, 101));
    }

    #[test]
    fn test_get_index_id_by_name_and_resolve() {
        let meta = table();
        assert!(matches!(meta.resolve_index(1, ""), Err(CoordError::IndexNotExist(_))));
        meta.create_index(index(100, 10, "a", "IVF_FLAT")).unwrap();
        assert_eq!(meta.resolve_index(1, "").unwrap().index_id, 100);
        meta.create_index(index(101, 11, "b", "HNSW")).unwrap();

        assert_eq!(meta.get_index_id_by_name(1, "").len(), 2);
        assert_eq!(meta.get_index_id_by_name(1, "b").into_iter().collect::<Vec<_>>(), vec![101]);
        assert!(matches!(
            meta.resolve_index(1, ""),
            Err(CoordError::AmbiguousIndexName { collection_id: 1 })
        ));
        assert!(matches!(meta.resolve_index(1, "zzz"), Err(CoordError::IndexNotExist(_))));
    }

    #[test]
    fn test_mark_index_deleted_drop_all_is_idempotent() {
        let meta = table();
        meta.create_index(index(100, 10, "a", "IVF_FLAT")).unwrap();
        meta.create_index(index(101, 11, "b", "HNSW")).unwrap();

        let mut dropped = meta.mark_index_deleted(1, None, true).unwrap();
        dropped.sort_unstable();
        assert_eq!(dropped, vec![100, 101]);
        assert!(meta.mark_index_deleted(1, None, true).unwrap().is_empty());
        assert!(meta.mark_index_deleted(1, Some(999), false).unwrap().is_empty());
        assert_eq!(meta.get_deleted_indexes().len(), 2);
        assert!(meta.list_indexes(1).is_empty());
    }

    #[test]
    fn test_add_segment_index_noop_and_supersede() {
        let meta = table();
        meta.add_segment_index(row(1000, 10, 1)).unwrap();
        meta.add_segment_index(row(1000, 11, 1)).unwrap();
        assert!(!meta.has_build_id(11));

        meta.add_segment_index(row(1000, 12, 2)).unwrap();
        assert!(meta.get_segment_index_by_build_id(10).unwrap().is_deleted());
        assert_eq!(meta.get_current_segment_index(1000, 100).unwrap().build_id, 12);

        assert!(meta.add_segment_index(row(1000, 13, 1)).is_ok());
        assert!(!meta.has_build_id(13));
        assert!(meta.add_segment_index(row(1001, 12, 1)).is_err());
    }

    #[test]
    fn test_state_machine_enforced() {
        let meta = table();
        meta.add_segment_index(row(1000, 10, 1)).unwrap();
        meta.assign_node(10, 7).unwrap();
        meta.update_state(10, StateUpdate::to(IndexState::InProgress)).unwrap();
        meta.update_state(10, StateUpdate::finished(vec!["a".into()], 42)).unwrap();

        let err = meta
            .update_state(10, StateUpdate::to(IndexState::InProgress))
            .unwrap_err();
        assert!(matches!(err, CoordError::InvalidStateTransition { .. }));
        let stored = meta.get_segment_index_by_build_id(10).unwrap();
        assert_eq!(stored.index_state, IndexState::Finished);
        assert_eq!(stored.index_file_keys, vec!["a".to_string()]);
        assert_eq!(stored.index_size, 42);

        assert!(matches!(
            meta.update_state(99, StateUpdate::to(IndexState::Finished)),
            Err(CoordError::BuildIdNotFound(99))
        ));
    }

    #[test]
    fn test_assign_and_release() {
        let meta = table();
        meta.add_segment_index(row(1000, 10, 1)).unwrap();
        assert_eq!(meta.list_unissued().len(), 1);

        meta.assign_node(10, 7).unwrap();
        meta.assign_node(10, 7).unwrap();
        assert!(matches!(meta.assign_node(10, 8), Err(CoordError::BuildInUse { .. })));
        assert!(meta.list_unissued().is_empty());
        assert_eq!(meta.list_in_progress_by_node()[&7].len(), 1);

        meta.release_node(10).unwrap();
        assert!(meta.list_in_progress_by_node().is_empty());
        assert_eq!(
            meta.get_segment_index_by_build_id(10).unwrap().index_state,
            IndexState::InProgress
        );
    }

    #[test]
    fn test_reissue_creates_next_version() {
        let meta = table();
        meta.add_segment_index(row(1000, 10, 1)).unwrap();
        meta.assign_node(10, 7).unwrap();
        meta.update_state(10, StateUpdate::failed("oom")).unwrap();

        let fresh = meta.reissue(10, 20).unwrap();
        assert_eq!(fresh.index_version, 2);
        assert_eq!(fresh.index_state, IndexState::Unissued);

        let old = meta.get_segment_index_by_build_id(10).unwrap();
        assert!(old.is_deleted());
        assert_eq!(old.node_id, UNASSIGNED_NODE);
        assert_eq!(old.fail_reason, "oom");
        assert_eq!(meta.get_current_segment_index(1000, 100).unwrap().build_id, 20);
        assert!(meta.reissue(10, 21).is_err());
    }

    #[test]
    fn test_remove_segment_index_guards() {
        let meta = table();
        meta.create_index(index(100, 10, "idx", "IVF_FLAT")).unwrap();
        meta.add_segment_index(row(1000, 10, 1)).unwrap();
        meta.assign_node(10, 7).unwrap();

        assert!(matches!(meta.remove_segment_index(10), Err(CoordError::NotDeleted(_))
            | Err(CoordError::BuildInUse { .. })));
        meta.mark_index_deleted(1, Some(100), false).unwrap();
        assert!(matches!(meta.remove_segment_index(10), Err(CoordError::BuildInUse { .. })));
        assert!(matches!(meta.remove_index(1, 100), Err(CoordError::IndexInUse { .. })));

        meta.release_node(10).unwrap();
        meta.remove_segment_index(10).unwrap();
        meta.remove_segment_index(10).unwrap();
        meta.remove_index(1, 100).unwrap();
        assert!(meta.get_index(1, 100).is_none());
    }

    #[test]
    fn test_remove_active_index_rejected() {
        let meta = table();
        meta.create_index(index(100, 10, "idx", "IVF_FLAT")).unwrap();
        assert!(matches!(meta.remove_index(1, 100), Err(CoordError::NotDeleted(_))));
        meta.remove_index(1, 999).unwrap();
    }

    #[test]
    fn test_mark_segment_indexes_deleted_by_predicate() {
        let meta = table();
        meta.add_segment_index(row(1000, 10, 1)).unwrap();
        meta.add_segment_index(row(1001, 11, 1)).unwrap();
        assert_eq!(meta.mark_segment_indexes_deleted(|r| r.segment_id == 1000).unwrap(), 1);
        assert_eq!(meta.mark_segment_indexes_deleted(|r| r.segment_id == 1000).unwrap(), 0);
        assert_eq!(meta.list_segment_indexes(100).len(), 1);
        assert_eq!(meta.get_build_ids_from_index_id(100), vec![10, 11]);
    }

    #[test]
    fn test_reload_from_catalog() {
        let kv: Arc<dyn MetaKv> = Arc::new(KvStore::ephemeral());
        {
            let meta = MetaTable::new(Catalog::new(Arc::clone(&kv))).unwrap();
            meta.create_index(index(100, 10, "idx", "IVF_FLAT")).unwrap();
            meta.add_segment_index(row(1000, 10, 1)).unwrap();
            meta.assign_node(10, 7).unwrap();
        }
        let meta = MetaTable::new(Catalog::new(kv)).unwrap();
        assert_eq!(meta.list_indexes(1).len(), 1);
        let restored = meta.get_segment_index_by_build_id(10).unwrap();
        assert_eq!(restored.node_id, 7);
        assert_eq!(restored.index_state, IndexState::InProgress);
    }
}
