//! Durable key/value interface consumed by the metadata layer
//!
//! Implementations must be linearizable: a successful mutation is visible to
//! every subsequent read, and a failed mutation leaves no trace.

use crossbeam_channel::Receiver;
use idxcoord_core::Result;
use std::time::{Duration, Instant};

/// Lease handle returned by [`MetaKv::grant`]
pub type LeaseId = i64;

/// Kind of change in a [`WatchEvent`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WatchEventKind {
    /// Key created or overwritten
    Put,
    /// Key removed (explicitly or by lease expiry)
    Delete,
}

/// Change notification delivered to prefix watchers
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WatchEvent {
    /// Kind of change
    pub kind: WatchEventKind,
    /// Affected key
    pub key: String,
    /// New value for puts, `None` for deletes
    pub value: Option<Vec<u8>>,
    /// Store revision after the change
    pub revision: u64,
}

/// Linearizable key/value store with prefix watches and leases
pub trait MetaKv: Send + Sync {
    /// Value of a key
    fn load(&self, key: &str) -> Result<Option<Vec<u8>>>;

    /// Every key/value under a prefix, ordered by key
    fn load_with_prefix(&self, prefix: &str) -> Result<Vec<(String, Vec<u8>)>>;

    /// Atomically apply puts then removals
    fn multi_save_and_remove(
        &self,
        saves: Vec<(String, Vec<u8>)>,
        removals: Vec<String>,
    ) -> Result<()>;

    /// Remove every key under a prefix
    fn remove_with_prefix(&self, prefix: &str) -> Result<()>;

    /// Subscribe to changes under a prefix
    fn watch_prefix(&self, prefix: &str) -> Receiver<WatchEvent>;

    /// Current revision
    fn revision(&self) -> u64;

    /// Create a lease that expires unless renewed within `ttl`
    fn grant(&self, ttl: Duration) -> Result<LeaseId>;

    /// Renew a lease; fails if it already expired
    fn keep_alive(&self, lease: LeaseId) -> Result<()>;

    /// Drop a lease and every key bound to it
    fn revoke(&self, lease: LeaseId) -> Result<()>;

    /// Store a key bound to a lease; it disappears with the lease
    fn save_with_lease(&self, key: &str, value: Vec<u8>, lease: LeaseId) -> Result<()>;

    /// Drop every lease whose deadline is before `now`, with its keys.
    /// Returns the number of keys removed.
    fn expire_leases(&self, now: Instant) -> usize;

    /// Store one key
    fn save(&self, key: &str, value: Vec<u8>) -> Result<()> {
        self.multi_save_and_remove(vec![(key.to_string(), value)], Vec::new())
    }

    /// Atomically store several keys
    fn multi_save(&self, kvs: Vec<(String, Vec<u8>)>) -> Result<()> {
        self.multi_save_and_remove(kvs, Vec::new())
    }

    /// Remove one key
    fn remove(&self, key: &str) -> Result<()> {
        self.multi_save_and_remove(Vec::new(), vec![key.to_string()])
    }

    /// Atomically remove several keys
    fn multi_remove(&self, keys: Vec<String>) -> Result<()> {
        self.multi_save_and_remove(Vec::new(), keys)
    }
}
