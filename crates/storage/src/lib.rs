//! Storage layer for idxcoord
//!
//! This crate implements the persistence primitives the coordinator and
//! workers share:
//! - MetaKv: linearizable key/value interface with prefix watches and leases
//! - KvStore: ordered in-process MetaKv, optionally journaled to disk
//! - Journal: crc32-framed append-only log with torn-tail recovery
//! - LeaseTable / LeaseReaper: lease deadlines and background expiry
//! - Session: worker liveness records bound to a lease
//! - ObjectStore: blob storage for built index files (memory and local fs)

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod journal;
pub mod kv;
pub mod lease;
pub mod object_store;
pub mod reaper;
pub mod session;
pub mod store;

pub use journal::{Journal, JournalOp, JournalRecord, SyncMode};
pub use kv::{LeaseId, MetaKv, WatchEvent, WatchEventKind};
pub use lease::LeaseTable;
pub use object_store::{LocalObjectStore, MemoryObjectStore, ObjectStore};
pub use reaper::LeaseReaper;
pub use session::{
    list_sessions, node_id_from_key, session_key, KeepAlive, NodeSession, Session, SESSION_PREFIX,
};
pub use store::KvStore;
