//! Integration tests for the durable KV store
//!
//! - Crash recovery from a torn journal tail
//! - Concurrent writers on disjoint keys
//! - Session expiry observed through a watch
//! - Local object store layout on disk

use std::fs::OpenOptions;
use std::io::Write;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use idxcoord_storage::journal::JOURNAL_FILE_NAME;
use idxcoord_storage::{
    list_sessions, KvStore, LeaseReaper, LocalObjectStore, MetaKv, NodeSession, ObjectStore,
    Session, SyncMode, WatchEventKind, SESSION_PREFIX,
};
use proptest::prelude::*;
use tempfile::TempDir;

// ============================================================================
// Crash recovery
// ============================================================================

#[test]
fn torn_tail_is_dropped_and_appends_resume() {
    let dir = TempDir::new().unwrap();
    {
        let kv = KvStore::open(dir.path(), SyncMode::Always).unwrap();
        kv.save("meta/1", b"a".to_vec()).unwrap();
        kv.save("meta/2", b"b".to_vec()).unwrap();
    }

    // half-written frame: a header promising more bytes than follow
    let mut file = OpenOptions::new()
        .append(true)
        .open(dir.path().join(JOURNAL_FILE_NAME))
        .unwrap();
    file.write_all(&[0xff, 0x00, 0x00, 0x00, 0xde, 0xad, 0xbe, 0xef, 0x01]).unwrap();
    drop(file);

    {
        let kv = KvStore::open(dir.path(), SyncMode::Always).unwrap();
        assert_eq!(kv.load("meta/1").unwrap(), Some(b"a".to_vec()));
        assert_eq!(kv.load("meta/2").unwrap(), Some(b"b".to_vec()));
        kv.save("meta/3", b"c".to_vec()).unwrap();
    }

    let kv = KvStore::open(dir.path(), SyncMode::Always).unwrap();
    assert_eq!(kv.len(), 3);
    assert_eq!(kv.load("meta/3").unwrap(), Some(b"c".to_vec()));
}

#[test]
fn batches_are_replayed_atomically() {
    let dir = TempDir::new().unwrap();
    {
        let kv = KvStore::open(dir.path(), SyncMode::Always).unwrap();
        kv.save("idx/old", b"1".to_vec()).unwrap();
        kv.multi_save_and_remove(
            vec![("idx/a".into(), b"2".to_vec()), ("idx/b".into(), b"3".to_vec())],
            vec!["idx/old".into()],
        )
        .unwrap();
    }
    let kv = KvStore::open(dir.path(), SyncMode::Always).unwrap();
    let keys: Vec<String> = kv
        .load_with_prefix("idx/")
        .unwrap()
        .into_iter()
        .map(|(k, _)| k)
        .collect();
    assert_eq!(keys, vec!["idx/a".to_string(), "idx/b".to_string()]);
}

#[test]
fn writes_that_trigger_auto_compaction_survive_restart() {
    let dir = TempDir::new().unwrap();
    {
        let kv = KvStore::open(dir.path(), SyncMode::Buffered).unwrap();
        for i in 0..5000 {
            kv.save(&format!("k{:05}", i), i.to_string().into_bytes()).unwrap();
        }
        kv.remove_with_prefix("k0000").unwrap();
    }

    let kv = KvStore::open(dir.path(), SyncMode::Buffered).unwrap();
    let missing: Vec<String> = (10..5000)
        .map(|i| format!("k{:05}", i))
        .filter(|key| kv.load(key).unwrap().is_none())
        .collect();
    assert!(missing.is_empty(), "missing after restart: {:?}", missing);
    assert_eq!(kv.load("k04095").unwrap(), Some(b"4095".to_vec()));
    assert!(kv.load_with_prefix("k0000").unwrap().is_empty());
    assert_eq!(kv.len(), 4990);
}

// ============================================================================
// Concurrency
// ============================================================================

#[test]
fn concurrent_writers_on_disjoint_keys() {
    let kv = Arc::new(KvStore::ephemeral());
    let start = kv.revision();
    let handles: Vec<_> = (0..8)
        .map(|t| {
            let kv = Arc::clone(&kv);
            thread::spawn(move || {
                for i in 0..100 {
                    kv.save(&format!("t{}/{:03}", t, i), vec![t as u8]).unwrap();
                }
            })
        })
        .collect();
    for handle in handles {
        handle.join().unwrap();
    }

    assert_eq!(kv.len(), 800);
    assert_eq!(kv.revision(), start + 800);
    for t in 0..8 {
        assert_eq!(kv.load_with_prefix(&format!("t{}/", t)).unwrap().len(), 100);
    }
}

// ============================================================================
// Sessions and leases
// ============================================================================

#[test]
fn expired_session_is_observed_as_a_delete() {
    let kv = Arc::new(KvStore::ephemeral());
    let events = kv.watch_prefix(SESSION_PREFIX);
    let reaper = LeaseReaper::new(kv.clone(), Duration::from_millis(10));
    let handle = reaper.start();

    let session = Session::register(
        kv.clone(),
        NodeSession::new(4, "worker-4:21121"),
        Duration::from_millis(50),
    )
    .unwrap();
    assert_eq!(list_sessions(kv.as_ref()).unwrap().len(), 1);

    // no keep-alive: the reaper expires the lease
    let delete = events
        .iter()
        .find(|e| e.kind == WatchEventKind::Delete)
        .unwrap();
    assert!(delete.key.ends_with('4'));
    assert!(list_sessions(kv.as_ref()).unwrap().is_empty());
    assert!(session.keep_alive().is_err());

    reaper.shutdown();
    handle.join().unwrap();
}

#[test]
fn kept_alive_session_survives_its_ttl() {
    let kv = Arc::new(KvStore::ephemeral());
    let reaper = LeaseReaper::new(kv.clone(), Duration::from_millis(10));
    let handle = reaper.start();

    let session = Arc::new(
        Session::register(
            kv.clone(),
            NodeSession::new(5, "worker-5:21121"),
            Duration::from_millis(100),
        )
        .unwrap(),
    );
    let mut keep_alive = session.start_keep_alive(Duration::from_millis(20));
    thread::sleep(Duration::from_millis(300));
    assert_eq!(list_sessions(kv.as_ref()).unwrap().len(), 1);

    keep_alive.stop();
    session.revoke().unwrap();
    assert!(list_sessions(kv.as_ref()).unwrap().is_empty());

    reaper.shutdown();
    handle.join().unwrap();
}

// ============================================================================
// Object store
// ============================================================================

#[test]
fn local_object_store_lists_and_removes_by_prefix() {
    let dir = TempDir::new().unwrap();
    let store = LocalObjectStore::new(dir.path(), "files").unwrap();
    store.write("files/index_files/10/1/2/1000/a", b"a").unwrap();
    store.write("files/index_files/10/1/2/1000/b", b"b").unwrap();
    store.write("files/index_files/11/1/2/1001/a", b"a").unwrap();

    let builds = store.list_with_prefix("files/index_files/", false).unwrap();
    assert_eq!(
        builds,
        vec![
            "files/index_files/10/".to_string(),
            "files/index_files/11/".to_string()
        ]
    );

    store.remove_with_prefix("files/index_files/10/").unwrap();
    assert!(!store.exists("files/index_files/10/1/2/1000/a").unwrap());
    assert!(store.exists("files/index_files/11/1/2/1001/a").unwrap());
    assert_eq!(store.read("files/index_files/11/1/2/1001/a").unwrap(), b"a");
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(24))]

    #[test]
    fn reopen_matches_the_last_written_state(
        ops in proptest::collection::vec((0u8..16, proptest::option::of(any::<u8>())), 1..60)
    ) {
        let dir = TempDir::new().unwrap();
        let mut expected = std::collections::BTreeMap::new();
        {
            let kv = KvStore::open(dir.path(), SyncMode::Buffered).unwrap();
            for (key, value) in &ops {
                let key = format!("k{:02}", key);
                match value {
                    Some(v) => {
                        kv.save(&key, vec![*v]).unwrap();
                        expected.insert(key, vec![*v]);
                    }
                    None => {
                        kv.remove(&key).unwrap();
                        expected.remove(&key);
                    }
                }
            }
        }
        let kv = KvStore::open(dir.path(), SyncMode::Buffered).unwrap();
        let actual: std::collections::BTreeMap<String, Vec<u8>> =
            kv.load_with_prefix("").unwrap().into_iter().collect();
        prop_assert_eq!(actual, expected);
    }
}
