//! Garbage collection against a live metadata table
//!
//! - Owned rows survive every pass, whatever their index or segment
//! - File reconciliation removes exactly what no row accounts for
//! - Broker failures skip one collection only

use std::sync::Arc;

use idxcoord_coord::{GarbageCollector, MemoryBroker};
use idxcoord_core::paths::segment_index_file_path;
use idxcoord_core::{Index, IndexState, KeyValuePair, Liveness, SegmentIndex, Timestamp};
use idxcoord_meta::{Catalog, MetaTable, StateUpdate};
use idxcoord_storage::{KvStore, MemoryObjectStore, ObjectStore};
use proptest::prelude::*;

// ============================================================================
// Helpers
// ============================================================================

struct Fixture {
    meta: Arc<MetaTable>,
    broker: Arc<MemoryBroker>,
    store: Arc<MemoryObjectStore>,
    gc: GarbageCollector,
}

impl Fixture {
    fn new() -> Self {
        let kv = Arc::new(KvStore::ephemeral());
        let meta = Arc::new(MetaTable::new(Catalog::new(kv)).unwrap());
        let broker = Arc::new(MemoryBroker::new());
        let store = Arc::new(MemoryObjectStore::new("files"));
        let gc = GarbageCollector::new(meta.clone(), broker.clone(), store.clone(), "files");
        Self {
            meta,
            broker,
            store,
            gc,
        }
    }

    fn index(&self, collection_id: i64, index_id: i64) {
        self.meta
            .create_index(Index {
                tenant_id: String::new(),
                collection_id,
                field_id: 100 + index_id,
                index_id,
                index_name: format!("idx_{}", index_id),
                type_params: vec![KeyValuePair::new("dim", "8")],
                index_params: vec![KeyValuePair::new("index_type", "FLAT")],
                user_index_params: Vec::new(),
                is_auto_index: false,
                liveness: Liveness::Active,
                create_time: Timestamp::now(),
            })
            .unwrap();
    }

    /// Flushed segment plus an `Unissued` build row for it
    fn build(&self, collection_id: i64, segment_id: i64, index_id: i64, build_id: i64) {
        self.broker
            .add_flushed_segment(collection_id, 1, segment_id, 100, 100 + index_id, "files/data");
        self.meta
            .add_segment_index(SegmentIndex::unissued(
                collection_id,
                1,
                segment_id,
                100,
                index_id,
                build_id,
                1,
            ))
            .unwrap();
    }

    /// Drive a build to `Finished` with `keys` and release it
    fn finish(&self, build_id: i64, keys: &[&str]) {
        self.meta.assign_node(build_id, 7).unwrap();
        self.meta
            .update_state(
                build_id,
                StateUpdate::finished(keys.iter().map(|k| k.to_string()).collect(), 64),
            )
            .unwrap();
        self.meta.release_node(build_id).unwrap();
    }

    fn file(&self, build_id: i64, segment_id: i64, key: &str) -> String {
        let path = segment_index_file_path("files", build_id, 1, 1, segment_id, key);
        self.store.write(&path, b"blob").unwrap();
        path
    }
}

// ============================================================================
// Metadata
// ============================================================================

#[test]
fn owned_rows_of_a_dropped_index_are_kept_until_released() {
    let f = Fixture::new();
    f.index(1, 10);
    f.build(1, 1000, 10, 500);
    f.meta.assign_node(500, 7).unwrap();
    f.meta.mark_index_deleted(1, Some(10), false).unwrap();

    for _ in 0..3 {
        assert_eq!(f.gc.recycle_segment_indexes_meta(), 0);
        assert_eq!(f.gc.recycle_unused_indexes(), 0);
    }
    assert!(f.meta.has_build_id(500));
    assert!(f.meta.get_index(1, 10).is_some());

    f.meta.release_node(500).unwrap();
    assert_eq!(f.gc.recycle_segment_indexes_meta(), 1);
    assert!(!f.meta.has_build_id(500));
    assert_eq!(f.gc.recycle_unused_indexes(), 1);
    assert!(f.meta.get_index(1, 10).is_none());
}

#[test]
fn rows_of_dropped_segments_are_tombstoned_then_removed() {
    let f = Fixture::new();
    f.index(1, 10);
    f.build(1, 1000, 10, 500);
    f.build(1, 1001, 10, 501);
    f.meta.assign_node(501, 7).unwrap();

    f.broker.drop_segment(1000);
    f.broker.drop_segment(1001);
    assert_eq!(f.gc.recycle_segment_indexes_meta(), 1);
    assert!(!f.meta.has_build_id(500));

    let owned = f.meta.get_segment_index_by_build_id(501).unwrap();
    assert!(owned.is_deleted());
    assert!(owned.is_owned());
}

#[test]
fn broker_failure_skips_only_that_collection() {
    let f = Fixture::new();
    f.index(1, 10);
    f.index(2, 20);
    f.build(1, 1000, 10, 500);
    f.build(2, 2000, 20, 600);
    f.broker.drop_segment(1000);
    f.broker.drop_segment(2000);
    f.broker.fail_collection(1);

    assert_eq!(f.gc.recycle_segment_indexes_meta(), 1);
    assert!(f.meta.has_build_id(500));
    assert!(!f.meta.has_build_id(600));

    f.broker.heal_collection(1);
    assert_eq!(f.gc.recycle_segment_indexes_meta(), 1);
    assert!(!f.meta.has_build_id(500));
}

// ============================================================================
// Files
// ============================================================================

#[test]
fn only_files_missing_from_the_row_are_removed() {
    let f = Fixture::new();
    f.index(1, 10);
    f.build(1, 1000, 10, 500);
    f.finish(500, &["a", "b"]);
    let a = f.file(500, 1000, "a");
    let b = f.file(500, 1000, "b");
    let c = f.file(500, 1000, "c");

    assert_eq!(f.gc.recycle_unused_index_files(), 1);
    assert!(f.store.exists(&a).unwrap());
    assert!(f.store.exists(&b).unwrap());
    assert!(!f.store.exists(&c).unwrap());

    assert_eq!(f.gc.recycle_unused_index_files(), 0);
}

#[test]
fn in_flight_builds_keep_partial_files() {
    let f = Fixture::new();
    f.index(1, 10);
    f.build(1, 1000, 10, 500);
    f.meta.assign_node(500, 7).unwrap();
    let partial = f.file(500, 1000, "partial");

    assert_eq!(f.gc.recycle_unused_index_files(), 0);
    assert!(f.store.exists(&partial).unwrap());
}

#[test]
fn files_of_unknown_builds_are_removed_wholesale() {
    let f = Fixture::new();
    let x = f.file(999, 1000, "x");
    let y = f.file(999, 1001, "y");
    f.store.write("files/other/keep", b"1").unwrap();

    assert_eq!(f.gc.recycle_unused_index_files(), 1);
    assert!(!f.store.exists(&x).unwrap());
    assert!(!f.store.exists(&y).unwrap());
    assert!(f.store.exists("files/other/keep").unwrap());
}

#[test]
fn failed_builds_lose_all_their_files() {
    let f = Fixture::new();
    f.index(1, 10);
    f.build(1, 1000, 10, 500);
    f.meta.assign_node(500, 7).unwrap();
    f.meta.update_state(500, StateUpdate::failed("oom")).unwrap();
    f.meta.release_node(500).unwrap();
    f.file(500, 1000, "half_written");

    assert_eq!(f.gc.recycle_unused_index_files(), 1);
    assert_eq!(
        f.meta.get_segment_index_by_build_id(500).unwrap().index_state,
        IndexState::Failed
    );
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(32))]

    #[test]
    fn file_reconciliation_keeps_exactly_the_expected_set(
        expected in proptest::collection::btree_set("[a-z]{1,6}", 0..6),
        stray in proptest::collection::btree_set("[A-Z]{1,6}", 0..6),
    ) {
        let f = Fixture::new();
        f.index(1, 10);
        f.build(1, 1000, 10, 500);
        let keys: Vec<&str> = expected.iter().map(String::as_str).collect();
        f.finish(500, &keys);
        for key in expected.iter().chain(stray.iter()) {
            f.file(500, 1000, key);
        }

        prop_assert_eq!(f.gc.recycle_unused_index_files(), stray.len());
        for key in &expected {
            let path = segment_index_file_path("files", 500, 1, 1, 1000, key);
            prop_assert!(f.store.exists(&path).unwrap());
        }
        for key in &stray {
            let path = segment_index_file_path("files", 500, 1, 1, 1000, key);
            prop_assert!(!f.store.exists(&path).unwrap());
        }
    }
}
