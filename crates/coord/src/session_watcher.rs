//! Worker discovery from session keys
//!
//! Workers publish themselves under [`SESSION_PREFIX`] bound to a lease.
//! The watcher mirrors those keys into the [`NodeRegistry`]: a put registers
//! the node (or marks it stopping), a delete (revoke or lease expiry)
//! unregisters it.

use crate::background::LoopGroup;
use crate::client::WorkerConnector;
use crate::registry::NodeRegistry;
use idxcoord_core::{NodeId, Result};
use idxcoord_storage::{
    list_sessions, node_id_from_key, MetaKv, NodeSession, WatchEvent, WatchEventKind,
    SESSION_PREFIX,
};
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

/// Keeps the registry in step with worker sessions
pub struct SessionWatcher {
    kv: Arc<dyn MetaKv>,
    registry: Arc<NodeRegistry>,
    connector: Arc<dyn WorkerConnector>,
}

impl SessionWatcher {
    /// Watcher feeding `registry`, opening clients through `connector`
    pub fn new(
        kv: Arc<dyn MetaKv>,
        registry: Arc<NodeRegistry>,
        connector: Arc<dyn WorkerConnector>,
    ) -> Self {
        Self {
            kv,
            registry,
            connector,
        }
    }

    /// Bring the registry in line with the current sessions; returns the
    /// number of live sessions
    pub fn sync(&self) -> Result<usize> {
        let sessions = list_sessions(self.kv.as_ref())?;
        let present: HashSet<NodeId> = sessions.iter().map(|s| s.node_id).collect();
        for node in self.registry.nodes() {
            if !present.contains(&node.node_id) {
                self.registry.unregister(node.node_id);
            }
        }
        for session in &sessions {
            self.apply_session(session);
        }
        Ok(sessions.len())
    }

    fn apply_session(&self, session: &NodeSession) {
        let known = self.registry.state(session.node_id).is_some();
        if session.stopping {
            if known {
                self.registry.mark_stopping(session.node_id);
            }
            return;
        }
        match self.connector.connect(session) {
            Ok(client) => self.registry.register(session.node_id, session.address.clone(), client),
            Err(e) => {
                warn!(
                    target: "idxcoord::registry",
                    node_id = session.node_id,
                    address = %session.address,
                    error = %e,
                    "cannot connect to node"
                );
            }
        }
    }

    /// Apply one watch event
    pub fn apply(&self, event: &WatchEvent) {
        match event.kind {
            WatchEventKind::Put => {
                let Some(value) = event.value.as_deref() else {
                    return;
                };
                match NodeSession::decode(value) {
                    Ok(session) => self.apply_session(&session),
                    Err(e) => {
                        warn!(
                            target: "idxcoord::registry",
                            key = %event.key,
                            error = %e,
                            "bad session value"
                        );
                    }
                }
            }
            WatchEventKind::Delete => {
                if let Some(node_id) = node_id_from_key(&event.key) {
                    debug!(
                        target: "idxcoord::registry",
                        node_id,
                        revision = event.revision,
                        "session removed"
                    );
                    self.registry.unregister(node_id);
                }
            }
        }
    }

    /// Subscribe, sync, then apply watch events every `interval` in `group`
    pub fn start(self: &Arc<Self>, group: &LoopGroup, interval: Duration) -> Result<()> {
        let events = self.kv.watch_prefix(SESSION_PREFIX);
        self.sync()?;
        let watcher = Arc::clone(self);
        group.spawn("idxcoord-session-watch", interval, move || {
            while let Ok(event) = events.try_recv() {
                watcher.apply(&event);
            }
        })?;
        Ok(())
    }
}
