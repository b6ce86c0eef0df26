//! Worker liveness sessions
//!
//! A worker registers a [`NodeSession`] under `session/indexnode/{node_id}`,
//! bound to a lease it keeps alive. The coordinator watches the prefix: a put
//! announces or updates a node, a delete (lease expiry or revoke) retires it.

use crate::kv::{LeaseId, MetaKv};
use idxcoord_core::{CoordError, NodeId, Result};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;
use tracing::{info, warn};

/// Key prefix of worker sessions
pub const SESSION_PREFIX: &str = "session/indexnode/";

/// Session key for a node
pub fn session_key(node_id: NodeId) -> String {
    format!("{}{}", SESSION_PREFIX, node_id)
}

/// Node id encoded in a session key
pub fn node_id_from_key(key: &str) -> Option<NodeId> {
    key.strip_prefix(SESSION_PREFIX)?.parse().ok()
}

/// Advertised worker identity
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeSession {
    /// Worker id
    pub node_id: NodeId,
    /// Address the coordinator dials
    pub address: String,
    /// Set once the worker begins graceful shutdown
    #[serde(default)]
    pub stopping: bool,
}

impl NodeSession {
    /// A fresh, serving session
    pub fn new(node_id: NodeId, address: impl Into<String>) -> Self {
        Self {
            node_id,
            address: address.into(),
            stopping: false,
        }
    }

    /// JSON encoding stored in the KV
    pub fn encode(&self) -> Result<Vec<u8>> {
        serde_json::to_vec(self).map_err(|e| CoordError::Serialization(e.to_string()))
    }

    /// Decode a stored session
    pub fn decode(bytes: &[u8]) -> Result<Self> {
        serde_json::from_slice(bytes).map_err(|e| CoordError::Serialization(e.to_string()))
    }
}

/// Every currently registered session
pub fn list_sessions(kv: &dyn MetaKv) -> Result<Vec<NodeSession>> {
    kv.load_with_prefix(SESSION_PREFIX)?
        .into_iter()
        .map(|(_, value)| NodeSession::decode(&value))
        .collect()
}

/// A worker's registration, held for its lifetime
pub struct Session {
    kv: Arc<dyn MetaKv>,
    lease: LeaseId,
    info: Mutex<NodeSession>,
}

impl Session {
    /// Grant a lease of `ttl` and publish the session under it
    pub fn register(kv: Arc<dyn MetaKv>, info: NodeSession, ttl: Duration) -> Result<Self> {
        let lease = kv.grant(ttl)?;
        kv.save_with_lease(&session_key(info.node_id), info.encode()?, lease)?;
        info!(
            target: "idxcoord::registry",
            node_id = info.node_id,
            address = %info.address,
            "session registered"
        );
        Ok(Self {
            kv,
            lease,
            info: Mutex::new(info),
        })
    }

    /// Node id of this session
    pub fn node_id(&self) -> NodeId {
        self.info.lock().node_id
    }

    /// Current advertised session
    pub fn info(&self) -> NodeSession {
        self.info.lock().clone()
    }

    /// Renew the lease
    pub fn keep_alive(&self) -> Result<()> {
        self.kv.keep_alive(self.lease)
    }

    /// Republish the session with the stopping flag set
    pub fn mark_stopping(&self) -> Result<()> {
        let mut info = self.info.lock();
        if info.stopping {
            return Ok(());
        }
        let mut next = info.clone();
        next.stopping = true;
        self.kv
            .save_with_lease(&session_key(next.node_id), next.encode()?, self.lease)?;
        *info = next;
        info!(target: "idxcoord::registry", node_id = info.node_id, "session marked stopping");
        Ok(())
    }

    /// Drop the lease; the session key disappears with it
    pub fn revoke(&self) -> Result<()> {
        self.kv.revoke(self.lease)?;
        info!(target: "idxcoord::registry", node_id = self.node_id(), "session revoked");
        Ok(())
    }

    /// Renew the lease every `interval` on a background thread
    pub fn start_keep_alive(self: &Arc<Self>, interval: Duration) -> KeepAlive {
        let session = Arc::clone(self);
        let shutdown = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&shutdown);
        let handle = thread::spawn(move || {
            let slice = Duration::from_millis(20).min(interval);
            while !flag.load(Ordering::Relaxed) {
                let mut elapsed = Duration::ZERO;
                while elapsed < interval {
                    if flag.load(Ordering::Relaxed) {
                        return;
                    }
                    thread::sleep(slice);
                    elapsed += slice;
                }
                if let Err(e) = session.keep_alive() {
                    warn!(
                        target: "idxcoord::registry",
                        node_id = session.node_id(),
                        error = %e,
                        "session keep-alive failed"
                    );
                    return;
                }
            }
        });
        KeepAlive {
            shutdown,
            handle: Some(handle),
        }
    }
}

/// Handle to a running keep-alive thread; stops it on drop
pub struct KeepAlive {
    shutdown: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
}

impl KeepAlive {
    /// Stop renewing and wait for the thread
    pub fn stop(&mut self) {
        self.shutdown.store(true, Ordering::Relaxed);
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

impl Drop for KeepAlive {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::KvStore;
    use std::time::Instant;

    #[test]
    fn test_register_and_list() {
        let kv: Arc<dyn MetaKv> = Arc::new(KvStore::ephemeral());
        let _a = Session::register(
            Arc::clone(&kv),
            NodeSession::new(1, "a:1"),
            Duration::from_secs(10),
        )
        .unwrap();
        let _b = Session::register(
            Arc::clone(&kv),
            NodeSession::new(2, "b:1"),
            Duration::from_secs(10),
        )
        .unwrap();

        let sessions = list_sessions(kv.as_ref()).unwrap();
        assert_eq!(sessions.len(), 2);
        assert_eq!(sessions[0], NodeSession::new(1, "a:1"));
    }

    #[test]
    fn test_mark_stopping_republishes() {
        let kv: Arc<dyn MetaKv> = Arc::new(KvStore::ephemeral());
        let session = Session::register(
            Arc::clone(&kv),
            NodeSession::new(3, "c:1"),
            Duration::from_secs(10),
        )
        .unwrap();
        session.mark_stopping().unwrap();

        let stored = NodeSession::decode(&kv.load(&session_key(3)).unwrap().unwrap()).unwrap();
        assert!(stored.stopping);
        assert!(session.info().stopping);
    }

    #[test]
    fn test_revoke_removes_key() {
        let kv: Arc<dyn MetaKv> = Arc::new(KvStore::ephemeral());
        let session = Session::register(
            Arc::clone(&kv),
            NodeSession::new(4, "d:1"),
            Duration::from_secs(10),
        )
        .unwrap();
        session.revoke().unwrap();
        assert!(kv.load(&session_key(4)).unwrap().is_none());
    }

    #[test]
    fn test_keep_alive_holds_session_past_ttl() {
        let store = Arc::new(KvStore::ephemeral());
        let kv: Arc<dyn MetaKv> = store.clone();
        let session = Arc::new(
            Session::register(kv, NodeSession::new(5, "e:1"), Duration::from_millis(200)).unwrap(),
        );
        let mut keep_alive = session.start_keep_alive(Duration::from_millis(40));

        thread::sleep(Duration::from_millis(400));
        store.expire_leases(Instant::now());
        assert!(store.load(&session_key(5)).unwrap().is_some());

        keep_alive.stop();
        store.expire_leases(Instant::now() + Duration::from_secs(1));
        assert!(store.load(&session_key(5)).unwrap().is_none());
    }

    #[test]
    fn test_node_id_from_key() {
        assert_eq!(node_id_from_key("session/indexnode/42"), Some(42));
        assert_eq!(node_id_from_key("session/datanode/42"), None);
        assert_eq!(node_id_from_key("session/indexnode/x"), None);
    }
}
