//! Integration tests for MetaTable
//!
//! - Write-through failures leave the mirror untouched
//! - State monotonicity under arbitrary update sequences
//! - Concurrent mutation of distinct rows
//! - Restart recovery from a journaled store

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use crossbeam_channel::Receiver;
use idxcoord_core::{
    CoordError, Index, IndexState, KeyValuePair, Liveness, Result, SegmentIndex, Status, ErrorCode,
    Timestamp,
};
use idxcoord_meta::{Catalog, MetaTable, StateUpdate};
use idxcoord_storage::{KvStore, LeaseId, MetaKv, SyncMode, WatchEvent};
use proptest::prelude::*;
use tempfile::TempDir;

// ============================================================================
// Helpers
// ============================================================================

/// KvStore whose mutations can be switched to fail
struct FlakyKv {
    inner: KvStore,
    failing: AtomicBool,
}

impl FlakyKv {
    fn new() -> Self {
        Self {
            inner: KvStore::ephemeral(),
            failing: AtomicBool::new(false),
        }
    }

    fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    fn check(&self) -> Result<()> {
        if self.failing.load(Ordering::SeqCst) {
            Err(CoordError::storage("injected write failure"))
        } else {
            Ok(())
        }
    }
}

impl MetaKv for FlakyKv {
    fn load(&self, key: &str) -> Result<Option<Vec<u8>>> {
        self.inner.load(key)
    }

    fn load_with_prefix(&self, prefix: &str) -> Result<Vec<(String, Vec<u8>)>> {
        self.inner.load_with_prefix(prefix)
    }

    fn multi_save_and_remove(
        &self,
        saves: Vec<(String, Vec<u8>)>,
        removals: Vec<String>,
    ) -> Result<()> {
        self.check()?;
        self.inner.multi_save_and_remove(saves, removals)
    }

    fn remove_with_prefix(&self, prefix: &str) -> Result<()> {
        self.check()?;
        self.inner.remove_with_prefix(prefix)
    }

    fn watch_prefix(&self, prefix: &str) -> Receiver<WatchEvent> {
        self.inner.watch_prefix(prefix)
    }

    fn revision(&self) -> u64 {
        self.inner.revision()
    }

    fn grant(&self, ttl: Duration) -> Result<LeaseId> {
        self.inner.grant(ttl)
    }

    fn keep_alive(&self, lease: LeaseId) -> Result<()> {
        self.inner.keep_alive(lease)
    }

    fn revoke(&self, lease: LeaseId) -> Result<()> {
        self.inner.revoke(lease)
    }

    fn save_with_lease(&self, key: &str, value: Vec<u8>, lease: LeaseId) -> Result<()> {
        self.check()?;
        self.inner.save_with_lease(key, value, lease)
    }

    fn expire_leases(&self, now: Instant) -> usize {
        self.inner.expire_leases(now)
    }
}

fn index(index_id: i64, field_id: i64, name: &str) -> Index {
    Index {
        tenant_id: String::new(),
        collection_id: 1,
        field_id,
        index_id,
        index_name: name.into(),
        type_params: vec![KeyValuePair::new("dim", "128")],
        index_params: vec![KeyValuePair::new("index_type", "IVF_FLAT")],
        user_index_params: Vec::new(),
        is_auto_index: false,
        liveness: Liveness::Active,
        create_time: Timestamp::EPOCH,
    }
}

fn row(segment_id: i64, build_id: i64) -> SegmentIndex {
    SegmentIndex::unissued(1, 2, segment_id, 1000, 100, build_id, 1)
}

// ============================================================================
// Write-through failures
// ============================================================================

mod write_through {
    use super::*;

    fn setup() -> (Arc<FlakyKv>, MetaTable) {
        let kv = Arc::new(FlakyKv::new());
        let meta = MetaTable::new(Catalog::new(kv.clone())).unwrap();
        (kv, meta)
    }

    #[test]
    fn test_failed_create_index_is_invisible() {
        let (kv, meta) = setup();
        kv.set_failing(true);
        let err = meta.create_index(index(100, 10, "idx")).unwrap_err();
        assert_eq!(Status::from_error(&err).code, ErrorCode::UnexpectedError);
        assert!(meta.list_indexes(1).is_empty());

        kv.set_failing(false);
        assert_eq!(meta.create_index(index(100, 10, "idx")).unwrap(), 100);
    }

    #[test]
    fn test_failed_state_update_is_invisible() {
        let (kv, meta) = setup();
        meta.add_segment_index(row(1000, 10)).unwrap();
        meta.assign_node(10, 3).unwrap();

        kv.set_failing(true);
        assert!(meta.update_state(10, StateUpdate::finished(vec!["f".into()], 1)).is_err());
        assert!(meta.release_node(10).is_err());
        assert!(meta.reissue(10, 11).is_err());
        let stored = meta.get_segment_index_by_build_id(10).unwrap();
        assert_eq!(stored.index_state, IndexState::InProgress);
        assert_eq!(stored.node_id, 3);
        assert!(!meta.has_build_id(11));
    }

    #[test]
    fn test_failed_soft_delete_is_invisible() {
        let (kv, meta) = setup();
        meta.create_index(index(100, 10, "a")).unwrap();
        meta.add_segment_index(row(1000, 10)).unwrap();

        kv.set_failing(true);
        assert!(meta.mark_index_deleted(1, None, true).is_err());
        assert!(meta.mark_segment_indexes_deleted(|_| true).is_err());
        assert!(!meta.is_index_deleted(1, 100));
        assert!(!meta.get_segment_index_by_build_id(10).unwrap().is_deleted());
    }

    #[test]
    fn test_failed_remove_keeps_row() {
        let (kv, meta) = setup();
        meta.add_segment_index(row(1000, 10)).unwrap();
        meta.mark_segment_indexes_deleted(|_| true).unwrap();

        kv.set_failing(true);
        assert!(meta.remove_segment_index(10).is_err());
        assert!(meta.has_build_id(10));
        kv.set_failing(false);
        meta.remove_segment_index(10).unwrap();
        assert!(!meta.has_build_id(10));
    }
}

// ============================================================================
// State monotonicity
// ============================================================================

fn arb_state() -> impl Strategy<Value = IndexState> {
    prop_oneof![
        Just(IndexState::Unissued),
        Just(IndexState::InProgress),
        Just(IndexState::Finished),
        Just(IndexState::Failed),
    ]
}

proptest! {
    #[test]
    fn state_updates_only_follow_the_state_machine(
        updates in prop::collection::vec(arb_state(), 1..40),
    ) {
        let meta = MetaTable::new(Catalog::new(Arc::new(KvStore::ephemeral()))).unwrap();
        meta.add_segment_index(row(1000, 10)).unwrap();

        let mut previous = IndexState::Unissued;
        for next in updates {
            let result = meta.update_state(10, StateUpdate::to(next));
            let stored = meta.get_segment_index_by_build_id(10).unwrap().index_state;
            if next == previous || previous.can_transition_to(next) {
                prop_assert!(result.is_ok());
                prop_assert_eq!(stored, next);
            } else {
                prop_assert!(result.is_err());
                prop_assert_eq!(stored, previous);
            }
            prop_assert!(!(previous == IndexState::Finished && stored == IndexState::InProgress));
            previous = stored;
        }
    }
}

// ============================================================================
// Concurrency
// ============================================================================

#[test]
fn test_concurrent_rows_advance_independently() {
    let meta = Arc::new(MetaTable::new(Catalog::new(Arc::new(KvStore::ephemeral()))).unwrap());
    for build in 0..64 {
        meta.add_segment_index(row(1000 + build, 10 + build)).unwrap();
    }

    let handles: Vec<_> = (0..4)
        .map(|t| {
            let meta = Arc::clone(&meta);
            thread::spawn(move || {
                for build in (0..64).filter(|b| b % 4 == t) {
                    let build_id = 10 + build;
                    meta.assign_node(build_id, t + 1).unwrap();
                    meta.update_state(
                        build_id,
                        StateUpdate::finished(vec![format!("f{}", build)], 1),
                    )
                    .unwrap();
                    meta.release_node(build_id).unwrap();
                }
            })
        })
        .collect();
    for handle in handles {
        handle.join().unwrap();
    }

    let rows = meta.get_all_seg_indexes();
    assert_eq!(rows.len(), 64);
    assert!(rows.iter().all(|r| r.index_state == IndexState::Finished && r.node_id == 0));
}

#[test]
fn test_racing_finish_and_fail_only_one_wins() {
    let meta = Arc::new(MetaTable::new(Catalog::new(Arc::new(KvStore::ephemeral()))).unwrap());
    meta.add_segment_index(row(1000, 10)).unwrap();
    meta.assign_node(10, 1).unwrap();

    let a = {
        let meta = Arc::clone(&meta);
        thread::spawn(move || {
            meta.update_state(10, StateUpdate::finished(vec!["f".into()], 1))
                .is_ok()
        })
    };
    let b = {
        let meta = Arc::clone(&meta);
        thread::spawn(move || meta.update_state(10, StateUpdate::failed("lost")).is_ok())
    };
    let (a, b) = (a.join().unwrap(), b.join().unwrap());
    assert!(a ^ b);
    assert!(meta
        .get_segment_index_by_build_id(10)
        .unwrap()
        .index_state
        .is_terminal());
}

// ============================================================================
// Restart recovery
// ============================================================================

#[test]
fn test_journaled_store_survives_restart() {
    let dir = TempDir::new().unwrap();
    {
        let kv = Arc::new(KvStore::open(dir.path(), SyncMode::Always).unwrap());
        let meta = MetaTable::new(Catalog::new(kv)).unwrap();
        meta.create_index(index(100, 10, "idx")).unwrap();
        meta.add_segment_index(row(1000, 10)).unwrap();
        meta.assign_node(10, 3).unwrap();
        meta.update_state(10, StateUpdate::finished(vec!["a".into(), "b".into()], 77)).unwrap();
        meta.release_node(10).unwrap();
        meta.add_segment_index(row(1001, 11)).unwrap();
        meta.mark_segment_indexes_deleted(|r| r.segment_id == 1001).unwrap();
        meta.remove_segment_index(11).unwrap();
    }

    let kv = Arc::new(KvStore::open(dir.path(), SyncMode::Always).unwrap());
    let meta = MetaTable::new(Catalog::new(kv)).unwrap();
    assert_eq!(meta.resolve_index(1, "idx").unwrap().index_id, 100);
    let finished = meta.get_segment_index_by_build_id(10).unwrap();
    assert_eq!(finished.index_state, IndexState::Finished);
    assert_eq!(finished.index_file_keys, vec!["a".to_string(), "b".to_string()]);
    assert_eq!(finished.index_size, 77);
    assert!(!meta.has_build_id(11));
}
