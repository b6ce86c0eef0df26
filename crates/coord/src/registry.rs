//! Worker registry
//!
//! Tracks every known worker through three states:
//!
//! ```text
//! Live --mark_stopping--> Stopping
//!   \                        |
//!    +-- unhealthy/silent ---+--> Gone --expire--> (removed)
//! ```
//!
//! `Stopping` workers stay addressable so their in-flight builds can be
//! polled and released, but receive no new placements. `Gone` workers are
//! never contacted for new work; their builds are re-dispatched.
//!
//! The registry lock guards only the node map and is never held across a
//! worker call.

use crate::client::WorkerClient;
use idxcoord_core::{CoordError, NodeId, Result, Timestamp};
use parking_lot::RwLock;
use rand::seq::SliceRandom;
use serde::Serialize;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// Liveness of a registered worker
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum NodeState {
    /// Accepting placements
    Live,
    /// Draining; polled but not placed on
    Stopping,
    /// Failed detection; pending removal
    Gone,
}

/// Point-in-time view of a worker
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct NodeInfo {
    /// Worker id
    pub node_id: NodeId,
    /// Advertised address
    pub address: String,
    /// Liveness
    pub state: NodeState,
    /// Free build slots from the last stats report
    pub task_slots: i64,
    /// Builds the coordinator currently has placed on the node
    pub assigned: usize,
    /// Last successful health probe (wall clock)
    pub last_heartbeat: Timestamp,
}

struct NodeEntry {
    info: NodeInfo,
    client: Arc<dyn WorkerClient>,
    last_seen: Instant,
    unhealthy_since: Option<Instant>,
}

/// Liveness-tracked placement target pool
pub struct NodeRegistry {
    nodes: RwLock<HashMap<NodeId, NodeEntry>>,
    node_ttl: Duration,
    health_window: Duration,
}

impl NodeRegistry {
    /// Registry retiring nodes silent for `node_ttl` or unhealthy for
    /// `health_window`
    pub fn new(node_ttl: Duration, health_window: Duration) -> Self {
        Self {
            nodes: RwLock::new(HashMap::new()),
            node_ttl,
            health_window,
        }
    }

    /// Register a worker, or refresh it as `Live` if already known
    pub fn register(
        &self,
        node_id: NodeId,
        address: impl Into<String>,
        client: Arc<dyn WorkerClient>,
    ) {
        let address = address.into();
        let now = Instant::now();
        let mut nodes = self.nodes.write();
        let assigned = nodes.get(&node_id).map_or(0, |e| e.info.assigned);
        nodes.insert(
            node_id,
            NodeEntry {
                info: NodeInfo {
                    node_id,
                    address: address.clone(),
                    state: NodeState::Live,
                    task_slots: 0,
                    assigned,
                    last_heartbeat: Timestamp::now(),
                },
                client,
                last_seen: now,
                unhealthy_since: None,
            },
        );
        info!(target: "idxcoord::registry", node_id, address = %address, "node registered");
    }

    /// Forget a worker; returns whether it was known
    pub fn unregister(&self, node_id: NodeId) -> bool {
        let removed = self.nodes.write().remove(&node_id).is_some();
        if removed {
            info!(target: "idxcoord::registry", node_id, "node unregistered");
        }
        removed
    }

    /// Exclude a worker from placement while it drains
    pub fn mark_stopping(&self, node_id: NodeId) -> bool {
        let mut nodes = self.nodes.write();
        match nodes.get_mut(&node_id) {
            Some(entry) if entry.info.state == NodeState::Live => {
                entry.info.state = NodeState::Stopping;
                info!(target: "idxcoord::registry", node_id, "node stopping");
                true
            }
            _ => false,
        }
    }

    /// Liveness of a worker, `None` if unknown
    pub fn state(&self, node_id: NodeId) -> Option<NodeState> {
        self.nodes.read().get(&node_id).map(|e| e.info.state)
    }

    /// Known and not `Gone`
    pub fn is_alive(&self, node_id: NodeId) -> bool {
        matches!(self.state(node_id), Some(NodeState::Live | NodeState::Stopping))
    }

    /// Client of a known worker, whatever its state
    pub fn client(&self, node_id: NodeId) -> Option<Arc<dyn WorkerClient>> {
        self.nodes.read().get(&node_id).map(|e| Arc::clone(&e.client))
    }

    /// Every non-`Gone` worker with its state and client
    pub fn alive_clients(&self) -> Vec<(NodeId, NodeState, Arc<dyn WorkerClient>)> {
        let mut out: Vec<_> = self
            .nodes
            .read()
            .values()
            .filter(|e| e.info.state != NodeState::Gone)
            .map(|e| (e.info.node_id, e.info.state, Arc::clone(&e.client)))
            .collect();
        out.sort_by_key(|(id, _, _)| *id);
        out
    }

    /// Pick a `Live` node not in `exclude`.
    ///
    /// Prefers the fewest placed builds, then the most free slots; remaining
    /// ties are broken at random.
    pub fn pick_node(&self, exclude: &HashSet<NodeId>) -> Result<(NodeId, Arc<dyn WorkerClient>)> {
        let nodes = self.nodes.read();
        let candidates: Vec<&NodeEntry> = nodes
            .values()
            .filter(|e| e.info.state == NodeState::Live && !exclude.contains(&e.info.node_id))
            .collect();
        let best = candidates
            .iter()
            .map(|e| (e.info.assigned, -e.info.task_slots))
            .min()
            .ok_or(CoordError::NoAvailableNode)?;
        let tied: Vec<&&NodeEntry> = candidates
            .iter()
            .filter(|e| (e.info.assigned, -e.info.task_slots) == best)
            .collect();
        let chosen = tied
            .choose(&mut rand::thread_rng())
            .ok_or(CoordError::NoAvailableNode)?;
        Ok((chosen.info.node_id, Arc::clone(&chosen.client)))
    }

    /// Count one more build placed on a node
    pub fn note_assigned(&self, node_id: NodeId) {
        if let Some(entry) = self.nodes.write().get_mut(&node_id) {
            entry.info.assigned += 1;
        }
    }

    /// Replace placed-build counts with a fresh tally; absent nodes get zero
    pub fn set_assigned(&self, counts: &HashMap<NodeId, usize>) {
        for entry in self.nodes.write().values_mut() {
            entry.info.assigned = counts.get(&entry.info.node_id).copied().unwrap_or(0);
        }
    }

    /// Record the free-slot figure a node reported
    pub fn record_slots(&self, node_id: NodeId, task_slots: i64) {
        if let Some(entry) = self.nodes.write().get_mut(&node_id) {
            entry.info.task_slots = task_slots;
        }
    }

    /// Record a health probe result observed at `now`
    pub fn heartbeat(&self, node_id: NodeId, healthy: bool, now: Instant) {
        let mut nodes = self.nodes.write();
        let Some(entry) = nodes.get_mut(&node_id) else {
            return;
        };
        if healthy {
            entry.last_seen = now;
            entry.unhealthy_since = None;
            entry.info.last_heartbeat = Timestamp::now();
        } else if entry.unhealthy_since.is_none() {
            debug!(target: "idxcoord::registry", node_id, "node reported unhealthy");
            entry.unhealthy_since = Some(now);
        }
    }

    /// Move nodes unhealthy beyond the window, or silent beyond the ttl, to
    /// `Gone`; returns the nodes that changed
    pub fn evaluate(&self, now: Instant) -> Vec<NodeId> {
        let mut gone = Vec::new();
        for entry in self.nodes.write().values_mut() {
            if entry.info.state == NodeState::Gone {
                continue;
            }
            let unhealthy_too_long = entry
                .unhealthy_since
                .map_or(false, |since| now.saturating_duration_since(since) >= self.health_window);
            let silent_too_long = now.saturating_duration_since(entry.last_seen) >= self.node_ttl;
            if unhealthy_too_long || silent_too_long {
                entry.info.state = NodeState::Gone;
                warn!(
                    target: "idxcoord::registry",
                    node_id = entry.info.node_id,
                    unhealthy_too_long,
                    silent_too_long,
                    "node is gone"
                );
                gone.push(entry.info.node_id);
            }
        }
        gone.sort_unstable();
        gone
    }

    /// Remove `Gone` nodes; returns their ids
    pub fn expire(&self) -> Vec<NodeId> {
        let mut nodes = self.nodes.write();
        let mut expired: Vec<NodeId> = nodes
            .values()
            .filter(|e| e.info.state == NodeState::Gone)
            .map(|e| e.info.node_id)
            .collect();
        for id in &expired {
            nodes.remove(id);
        }
        expired.sort_unstable();
        expired
    }

    /// Every registered node, ordered by id
    pub fn nodes(&self) -> Vec<NodeInfo> {
        let mut out: Vec<NodeInfo> = self.nodes.read().values().map(|e| e.info.clone()).collect();
        out.sort_by_key(|n| n.node_id);
        out
    }

    /// Registered nodes
    pub fn len(&self) -> usize {
        self.nodes.read().len()
    }

    /// Whether no node is registered
    pub fn is_empty(&self) -> bool {
        self.nodes.read().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use idxcoord_core::{
        CreateJobRequest, DropJobsRequest, HealthReport, JobStats, QueryJobsRequest,
        QueryJobsResponse, Status,
    };

    struct NullClient;

    impl WorkerClient for NullClient {
        fn create_job(&self, _req: CreateJobRequest) -> Result<Status> {
            Ok(Status::success())
        }
        fn query_jobs(&self, req: QueryJobsRequest) -> Result<QueryJobsResponse> {
            Ok(QueryJobsResponse {
                status: Status::success(),
                cluster_id: req.cluster_id,
                index_infos: Vec::new(),
            })
        }
        fn drop_jobs(&self, _req: DropJobsRequest) -> Result<Status> {
            Ok(Status::success())
        }
        fn get_job_stats(&self) -> Result<JobStats> {
            Err(CoordError::Worker("unsupported".into()))
        }
        fn check_health(&self) -> Result<HealthReport> {
            Err(CoordError::Worker("unsupported".into()))
        }
    }

    fn registry() -> NodeRegistry {
        NodeRegistry::new(Duration::from_secs(30), Duration::from_secs(10))
    }

    #[test]
    fn test_pick_requires_live_node() {
        let reg = registry();
        assert!(matches!(reg.pick_node(&HashSet::new()), Err(CoordError::NoAvailableNode)));

        reg.register(1, "a:1", Arc::new(NullClient));
        assert_eq!(reg.pick_node(&HashSet::new()).unwrap().0, 1);

        reg.mark_stopping(1);
        assert!(reg.is_alive(1));
        assert!(reg.pick_node(&HashSet::new()).is_err());
    }

    #[test]
    fn test_pick_prefers_least_loaded() {
        let reg = registry();
        reg.register(1, "a:1", Arc::new(NullClient));
        reg.register(2, "b:1", Arc::new(NullClient));
        reg.note_assigned(1);
        for _ in 0..10 {
            assert_eq!(reg.pick_node(&HashSet::new()).unwrap().0, 2);
        }
        let exclude: HashSet<NodeId> = [2].into_iter().collect();
        assert_eq!(reg.pick_node(&exclude).unwrap().0, 1);

        reg.set_assigned(&HashMap::from([(2, 3)]));
        assert_eq!(reg.pick_node(&HashSet::new()).unwrap().0, 1);
    }

    #[test]
    fn test_ties_break_on_free_slots() {
        let reg = registry();
        reg.register(1, "a:1", Arc::new(NullClient));
        reg.register(2, "b:1", Arc::new(NullClient));
        reg.record_slots(1, 4);
        reg.record_slots(2, 1);
        assert_eq!(reg.pick_node(&HashSet::new()).unwrap().0, 1);
    }

    #[test]
    fn test_unhealthy_window_retires_node() {
        let reg = registry();
        reg.register(1, "a:1", Arc::new(NullClient));
        let t0 = Instant::now();
        reg.heartbeat(1, false, t0);
        assert!(reg.evaluate(t0 + Duration::from_secs(5)).is_empty());
        reg.heartbeat(1, false, t0 + Duration::from_secs(6));
        assert_eq!(reg.evaluate(t0 + Duration::from_secs(11)), vec![1]);
        assert_eq!(reg.state(1), Some(NodeState::Gone));
        assert!(!reg.is_alive(1));
        assert!(reg.client(1).is_some());

        assert_eq!(reg.expire(), vec![1]);
        assert!(reg.is_empty());
    }

    #[test]
    fn test_recovery_resets_window() {
        let reg = registry();
        reg.register(1, "a:1", Arc::new(NullClient));
        let t0 = Instant::now();
        reg.heartbeat(1, false, t0);
        reg.heartbeat(1, true, t0 + Duration::from_secs(8));
        assert!(reg.evaluate(t0 + Duration::from_secs(12)).is_empty());
        assert_eq!(reg.state(1), Some(NodeState::Live));
    }

    #[test]
    fn test_silence_retires_node() {
        let reg = registry();
        reg.register(1, "a:1", Arc::new(NullClient));
        assert_eq!(reg.evaluate(Instant::now() + Duration::from_secs(31)), vec![1]);
    }

    #[test]
    fn test_reregister_revives() {
        let reg = registry();
        reg.register(1, "a:1", Arc::new(NullClient));
        reg.mark_stopping(1);
        reg.register(1, "a:2", Arc::new(NullClient));
        let nodes = reg.nodes();
        assert_eq!(nodes[0].state, NodeState::Live);
        assert_eq!(nodes[0].address, "a:2");
        assert!(reg.unregister(1));
        assert!(!reg.unregister(1));
    }
}
