//! Garbage collection of index metadata and index files
//!
//! Metadata reconciliation removes rows whose index was dropped or whose
//! segment no longer exists. File reconciliation removes objects no row
//! accounts for. Neither touches a row a worker still owns: an owned row
//! may belong to a build that is still writing.
//!
//! Every pass is idempotent. A failure on one item is logged and the pass
//! moves on; whatever was missed is picked up on the next cycle.

use crate::background::LoopGroup;
use crate::broker::Broker;
use idxcoord_core::paths::{
    build_prefix, index_files_root, parse_build_id_from_path, segment_index_file_path,
};
use idxcoord_core::{BuildId, CollectionId, Result, SegmentId};
use idxcoord_meta::MetaTable;
use idxcoord_storage::ObjectStore;
use std::collections::{BTreeSet, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Metadata and file reaper
pub struct GarbageCollector {
    meta: Arc<MetaTable>,
    broker: Arc<dyn Broker>,
    store: Arc<dyn ObjectStore>,
    root_path: String,
}

impl GarbageCollector {
    /// Collector over `store`, whose index files live under `root_path`
    pub fn new(
        meta: Arc<MetaTable>,
        broker: Arc<dyn Broker>,
        store: Arc<dyn ObjectStore>,
        root_path: impl Into<String>,
    ) -> Self {
        Self {
            meta,
            broker,
            store,
            root_path: root_path.into(),
        }
    }

    /// Start the metadata and file loops in `group`
    pub fn start(
        self: &Arc<Self>,
        group: &LoopGroup,
        meta_interval: Duration,
        file_interval: Duration,
    ) -> std::io::Result<()> {
        let gc = Arc::clone(self);
        group.spawn("idxcoord-gc-meta", meta_interval, move || {
            gc.recycle_unused_indexes();
            gc.recycle_segment_indexes_meta();
        })?;
        let gc = Arc::clone(self);
        group.spawn("idxcoord-gc-files", file_interval, move || {
            gc.recycle_unused_index_files();
        })
    }

    /// Remove dropped indexes. An index still referenced by build rows has
    /// its unowned rows removed first and goes away on a later cycle.
    ///
    /// Returns the number of indexes removed.
    pub fn recycle_unused_indexes(&self) -> usize {
        let mut removed = 0;
        for index in self.meta.get_deleted_indexes() {
            let build_ids = self.meta.get_build_ids_from_index_id(index.index_id);
            if build_ids.is_empty() {
                match self.meta.remove_index(index.collection_id, index.index_id) {
                    Ok(()) => removed += 1,
                    Err(e) => {
                        warn!(
                            target: "idxcoord::gc",
                            index_id = index.index_id,
                            error = %e,
                            "remove index failed"
                        );
                    }
                }
                continue;
            }
            for build_id in build_ids {
                let Some(row) = self.meta.get_segment_index_by_build_id(build_id) else {
                    continue;
                };
                if row.is_owned() {
                    debug!(
                        target: "idxcoord::gc",
                        build_id,
                        node_id = row.node_id,
                        "build still owned, keeping"
                    );
                    continue;
                }
                if let Err(e) = self.meta.remove_segment_index(build_id) {
                    warn!(
                        target: "idxcoord::gc",
                        build_id,
                        error = %e,
                        "remove segment index failed"
                    );
                }
            }
        }
        if removed > 0 {
            info!(target: "idxcoord::gc", removed, "recycled dropped indexes");
        }
        removed
    }

    /// Tombstone rows of segments that are no longer flushed, then remove
    /// every unowned tombstoned row (or row of a dropped index).
    ///
    /// Returns the number of rows removed.
    pub fn recycle_segment_indexes_meta(&self) -> usize {
        let collections: BTreeSet<CollectionId> = self
            .meta
            .get_all_seg_indexes()
            .iter()
            .filter(|r| !r.is_deleted())
            .map(|r| r.collection_id)
            .collect();

        for collection_id in collections {
            let flushed: HashSet<SegmentId> =
                match self.broker.get_flushed_segments(collection_id, None) {
                    Ok(segments) => segments.into_iter().collect(),
                    Err(e) => {
                        warn!(
                            target: "idxcoord::gc",
                            collection_id,
                            error = %e,
                            "list flushed segments failed, skipping collection"
                        );
                        continue;
                    }
                };
            let marked = self.meta.mark_segment_indexes_deleted(|r| {
                r.collection_id == collection_id && !flushed.contains(&r.segment_id)
            });
            match marked {
                Ok(0) => {}
                Ok(count) => {
                    info!(
                        target: "idxcoord::gc",
                        collection_id,
                        count,
                        "segment indexes of dropped segments marked deleted"
                    );
                }
                Err(e) => {
                    warn!(
                        target: "idxcoord::gc",
                        collection_id,
                        error = %e,
                        "mark segment indexes deleted failed"
                    );
                }
            }
        }

        let mut removed = 0;
        for row in self.meta.get_all_seg_indexes() {
            let garbage =
                row.is_deleted() || self.meta.is_index_deleted(row.collection_id, row.index_id);
            if !garbage || row.is_owned() {
                continue;
            }
            match self.meta.remove_segment_index(row.build_id) {
                Ok(()) => removed += 1,
                Err(e) => {
                    warn!(
                        target: "idxcoord::gc",
                        build_id = row.build_id,
                        error = %e,
                        "remove segment index failed"
                    );
                }
            }
        }
        if removed > 0 {
            info!(target: "idxcoord::gc", removed, "recycled segment index meta");
        }
        removed
    }

    /// Remove build directories no row accounts for, and files of settled
    /// builds that are not among the row's file keys.
    ///
    /// Returns the number of objects or directories removed.
    pub fn recycle_unused_index_files(&self) -> usize {
        let root = index_files_root(&self.root_path);
        let entries = match self.store.list_with_prefix(&root, false) {
            Ok(entries) => entries,
            Err(e) => {
                warn!(
                    target: "idxcoord::gc",
                    prefix = %root,
                    error = %e,
                    "list index files failed"
                );
                return 0;
            }
        };

        let mut removed = 0;
        for entry in entries {
            let build_id = match parse_build_id_from_path(&entry) {
                Ok(id) => id,
                Err(e) => {
                    warn!(
                        target: "idxcoord::gc",
                        key = %entry,
                        error = %e,
                        "unrecognized index file entry"
                    );
                    continue;
                }
            };
            match self.recycle_build_files(build_id) {
                Ok(count) => removed += count,
                Err(e) => {
                    warn!(
                        target: "idxcoord::gc",
                        build_id,
                        error = %e,
                        "recycle build files failed"
                    );
                }
            }
        }
        if removed > 0 {
            info!(target: "idxcoord::gc", removed, "recycled index files");
        }
        removed
    }

    fn recycle_build_files(&self, build_id: BuildId) -> Result<usize> {
        let prefix = build_prefix(&self.root_path, build_id);
        let Some(row) = self.meta.get_segment_index_by_build_id(build_id) else {
            self.store.remove_with_prefix(&prefix)?;
            info!(target: "idxcoord::gc", build_id, "removed files of unknown build");
            return Ok(1);
        };
        if !row.files_recyclable() {
            return Ok(0);
        }

        let expected: HashSet<String> = row
            .index_file_keys
            .iter()
            .map(|key| {
                segment_index_file_path(
                    &self.root_path,
                    build_id,
                    row.index_version,
                    row.partition_id,
                    row.segment_id,
                    key,
                )
            })
            .collect();
        let mut removed = 0;
        for key in self.store.list_with_prefix(&prefix, true)? {
            if expected.contains(&key) {
                continue;
            }
            match self.store.remove(&key) {
                Ok(()) => {
                    debug!(
                        target: "idxcoord::gc",
                        build_id,
                        key = %key,
                        "removed stale index file"
                    );
                    removed += 1;
                }
                Err(e) => {
                    warn!(
                        target: "idxcoord::gc",
                        build_id,
                        key = %key,
                        error = %e,
                        "remove index file failed"
                    );
                }
            }
        }
        Ok(removed)
    }
}
