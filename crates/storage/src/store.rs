//! In-process [`MetaKv`] implementation
//!
//! `KvStore` keeps the whole keyspace in an ordered map behind one RwLock.
//! A store opened on a directory is write-through: each batch is appended to
//! the journal before it touches the map, so a failed append leaves the map
//! unchanged. Keys bound to a lease are never journaled; they vanish on
//! restart the same way they vanish on lease expiry.

use crate::journal::{Journal, JournalOp, JournalRecord, SyncMode};
use crate::kv::{LeaseId, MetaKv, WatchEvent, WatchEventKind};
use crate::lease::LeaseTable;
use crossbeam_channel::{unbounded, Receiver, Sender};
use idxcoord_core::{CoordError, Result};
use parking_lot::{Mutex, RwLock};
use std::collections::BTreeMap;
use std::path::Path;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// Journal frames between automatic compactions
const COMPACT_EVERY: u64 = 4096;

#[derive(Debug, Clone)]
struct Entry {
    value: Vec<u8>,
    lease: Option<LeaseId>,
}

struct State {
    entries: BTreeMap<String, Entry>,
    revision: u64,
    leases: LeaseTable,
    journal: Option<Journal>,
}

impl State {
    fn persistent_snapshot(&self) -> Vec<(String, Vec<u8>)> {
        self.entries
            .iter()
            .filter(|(_, e)| e.lease.is_none())
            .map(|(k, e)| (k.clone(), e.value.clone()))
            .collect()
    }

    fn log(&mut self, ops: Vec<JournalOp>) -> Result<()> {
        if ops.is_empty() {
            return Ok(());
        }
        let Some(journal) = self.journal.as_mut() else {
            return Ok(());
        };
        journal.append(&JournalRecord::Batch(ops))
    }

    /// Rewrite the journal once it grows past [`COMPACT_EVERY`] frames.
    /// Must run after the logged batch is applied to `entries`.
    fn maybe_compact(&mut self) {
        let due = self
            .journal
            .as_ref()
            .is_some_and(|j| j.frames_written() >= COMPACT_EVERY);
        if !due {
            return;
        }
        let snapshot = self.persistent_snapshot();
        let keys = snapshot.len();
        if let Some(journal) = self.journal.as_mut() {
            // the batch is already durable; a failed rewrite leaves the old log in place
            match journal.rewrite(snapshot) {
                Ok(()) => debug!(target: "idxcoord::kv", keys, "journal auto-compacted"),
                Err(e) => {
                    warn!(target: "idxcoord::kv", error = %e, "journal auto-compaction failed")
                }
            }
        }
    }

    /// Remove a key from the map and from its lease, if any
    fn take(&mut self, key: &str) -> Option<Entry> {
        let entry = self.entries.remove(key)?;
        if let Some(lease) = entry.lease {
            self.leases.detach(lease, key);
        }
        Some(entry)
    }

    fn keys_with_prefix(&self, prefix: &str) -> Vec<String> {
        self.entries
            .range(prefix.to_string()..)
            .take_while(|(k, _)| k.starts_with(prefix))
            .map(|(k, _)| k.clone())
            .collect()
    }

    fn expire(&mut self, now: Instant) -> Vec<WatchEvent> {
        let mut events = Vec::new();
        let expired = self.leases.find_expired(now);
        if expired.is_empty() {
            return events;
        }
        self.revision += 1;
        for lease in expired {
            for key in self.leases.remove(lease) {
                self.entries.remove(&key);
                events.push(WatchEvent {
                    kind: WatchEventKind::Delete,
                    key,
                    value: None,
                    revision: self.revision,
                });
            }
            debug!(target: "idxcoord::kv", lease, "lease expired");
        }
        events
    }
}

/// Ordered key/value store with prefix watches and leases
pub struct KvStore {
    state: RwLock<State>,
    watchers: Mutex<Vec<(String, Sender<WatchEvent>)>>,
}

impl KvStore {
    fn with_state(entries: BTreeMap<String, Entry>, journal: Option<Journal>) -> Self {
        KvStore {
            state: RwLock::new(State {
                entries,
                revision: 0,
                leases: LeaseTable::new(),
                journal,
            }),
            watchers: Mutex::new(Vec::new()),
        }
    }

    /// Memory-only store; contents are lost on drop
    pub fn ephemeral() -> Self {
        Self::with_state(BTreeMap::new(), None)
    }

    /// Open a journaled store in `dir`, replaying existing state
    pub fn open(dir: &Path, sync: SyncMode) -> Result<Self> {
        let (journal, replay) = Journal::open(dir, sync)?;
        let mut entries = BTreeMap::new();
        for record in replay.records {
            match record {
                JournalRecord::Snapshot(kvs) => {
                    entries.clear();
                    for (key, value) in kvs {
                        entries.insert(key, Entry { value, lease: None });
                    }
                }
                JournalRecord::Batch(ops) => {
                    for op in ops {
                        match op {
                            JournalOp::Put { key, value } => {
                                entries.insert(key, Entry { value, lease: None });
                            }
                            JournalOp::Delete { key } => {
                                entries.remove(&key);
                            }
                            JournalOp::DeletePrefix { prefix } => {
                                entries.retain(|k: &String, _| !k.starts_with(&prefix));
                            }
                        }
                    }
                }
            }
        }
        info!(
            target: "idxcoord::kv",
            dir = %dir.display(),
            keys = entries.len(),
            "kv store opened"
        );
        Ok(Self::with_state(entries, Some(journal)))
    }

    fn notify(&self, events: Vec<WatchEvent>) {
        if events.is_empty() {
            return;
        }
        let mut watchers = self.watchers.lock();
        watchers.retain(|(prefix, tx)| {
            for event in events.iter().filter(|e| e.key.starts_with(prefix.as_str())) {
                if tx.send(event.clone()).is_err() {
                    return false;
                }
            }
            true
        });
    }

    /// Collapse the journal into a single snapshot frame
    pub fn compact(&self) -> Result<()> {
        let mut state = self.state.write();
        let snapshot = state.persistent_snapshot();
        let keys = snapshot.len();
        if let Some(journal) = state.journal.as_mut() {
            journal.rewrite(snapshot)?;
            info!(target: "idxcoord::kv", keys, "journal compacted");
        }
        Ok(())
    }

    /// Number of keys, leased ones included
    pub fn len(&self) -> usize {
        self.state.read().entries.len()
    }

    /// Whether the store holds no keys
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Number of live leases
    pub fn lease_count(&self) -> usize {
        self.state.read().leases.len()
    }
}

impl MetaKv for KvStore {
    fn load(&self, key: &str) -> Result<Option<Vec<u8>>> {
        Ok(self.state.read().entries.get(key).map(|e| e.value.clone()))
    }

    fn load_with_prefix(&self, prefix: &str) -> Result<Vec<(String, Vec<u8>)>> {
        let state = self.state.read();
        Ok(state
            .entries
            .range(prefix.to_string()..)
            .take_while(|(k, _)| k.starts_with(prefix))
            .map(|(k, e)| (k.clone(), e.value.clone()))
            .collect())
    }

    fn multi_save_and_remove(
        &self,
        saves: Vec<(String, Vec<u8>)>,
        removals: Vec<String>,
    ) -> Result<()> {
        if saves.is_empty() && removals.is_empty() {
            return Ok(());
        }
        let mut state = self.state.write();
        let mut ops: Vec<JournalOp> = saves
            .iter()
            .map(|(key, value)| JournalOp::Put {
                key: key.clone(),
                value: value.clone(),
            })
            .collect();
        for key in &removals {
            if matches!(state.entries.get(key), Some(Entry { lease: None, .. })) {
                ops.push(JournalOp::Delete { key: key.clone() });
            }
        }
        state.log(ops)?;

        state.revision += 1;
        let revision = state.revision;
        let mut events = Vec::with_capacity(saves.len() + removals.len());
        for (key, value) in saves {
            state.take(&key);
            state.entries.insert(
                key.clone(),
                Entry {
                    value: value.clone(),
                    lease: None,
                },
            );
            events.push(WatchEvent {
                kind: WatchEventKind::Put,
                key,
                value: Some(value),
                revision,
            });
        }
        for key in removals {
            if state.take(&key).is_some() {
                events.push(WatchEvent {
                    kind: WatchEventKind::Delete,
                    key,
                    value: None,
                    revision,
                });
            }
        }
        state.maybe_compact();
        self.notify(events);
        Ok(())
    }

    fn remove_with_prefix(&self, prefix: &str) -> Result<()> {
        let mut state = self.state.write();
        let keys = state.keys_with_prefix(prefix);
        if keys.is_empty() {
            return Ok(());
        }
        state.log(vec![JournalOp::DeletePrefix {
            prefix: prefix.to_string(),
        }])?;
        state.revision += 1;
        let revision = state.revision;
        let events = keys
            .into_iter()
            .filter_map(|key| {
                state.take(&key).map(|_| WatchEvent {
                    kind: WatchEventKind::Delete,
                    key,
                    value: None,
                    revision,
                })
            })
            .collect();
        state.maybe_compact();
        self.notify(events);
        Ok(())
    }

    fn watch_prefix(&self, prefix: &str) -> Receiver<WatchEvent> {
        let (tx, rx) = unbounded();
        self.watchers.lock().push((prefix.to_string(), tx));
        rx
    }

    fn revision(&self) -> u64 {
        self.state.read().revision
    }

    fn grant(&self, ttl: Duration) -> Result<LeaseId> {
        if ttl.is_zero() {
            return Err(CoordError::invalid_input("lease ttl must be positive"));
        }
        Ok(self.state.write().leases.grant(ttl, Instant::now()))
    }

    fn keep_alive(&self, lease: LeaseId) -> Result<()> {
        let now = Instant::now();
        let mut state = self.state.write();
        let events = state.expire(now);
        let renewed = state.leases.renew(lease, now);
        self.notify(events);
        if renewed {
            Ok(())
        } else {
            Err(CoordError::storage(format!("lease {} not found or expired", lease)))
        }
    }

    fn revoke(&self, lease: LeaseId) -> Result<()> {
        let mut state = self.state.write();
        if !state.leases.contains(lease) {
            return Ok(());
        }
        state.revision += 1;
        let revision = state.revision;
        let events = state
            .leases
            .remove(lease)
            .into_iter()
            .filter_map(|key| {
                state.entries.remove(&key).map(|_| WatchEvent {
                    kind: WatchEventKind::Delete,
                    key,
                    value: None,
                    revision,
                })
            })
            .collect();
        self.notify(events);
        Ok(())
    }

    fn save_with_lease(&self, key: &str, value: Vec<u8>, lease: LeaseId) -> Result<()> {
        let mut state = self.state.write();
        if !state.leases.contains(lease) {
            return Err(CoordError::storage(format!("lease {} not found or expired", lease)));
        }
        // a persisted key turning ephemeral must not come back on replay
        if matches!(state.entries.get(key), Some(Entry { lease: None, .. })) {
            state.log(vec![JournalOp::Delete { key: key.to_string() }])?;
        }
        state.take(key);
        state.leases.attach(lease, key);
        state.entries.insert(
            key.to_string(),
            Entry {
                value: value.clone(),
                lease: Some(lease),
            },
        );
        state.maybe_compact();
        state.revision += 1;
        let event = WatchEvent {
            kind: WatchEventKind::Put,
            key: key.to_string(),
            value: Some(value),
            revision: state.revision,
        };
        self.notify(vec![event]);
        Ok(())
    }

    fn expire_leases(&self, now: Instant) -> usize {
        let mut state = self.state.write();
        let events = state.expire(now);
        let removed = events.len();
        self.notify(events);
        removed
    }
}
