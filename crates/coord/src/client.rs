//! Coordinator-side handle to a worker
//!
//! Transport is not part of this crate. A [`WorkerClient`] returns
//! `Err(CoordError::Worker)` when the worker cannot be reached and the
//! worker's own [`Status`] when it answered.

use idxcoord_core::{
    CoordError, CreateJobRequest, DropJobsRequest, HealthReport, JobStats, NodeId,
    QueryJobsRequest, QueryJobsResponse, Result, Status,
};
use idxcoord_storage::NodeSession;
use idxcoord_worker::IndexNode;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Worker RPC surface used by the dispatcher and the health probe
pub trait WorkerClient: Send + Sync {
    /// Submit a build job
    fn create_job(&self, req: CreateJobRequest) -> Result<Status>;
    /// Poll build states
    fn query_jobs(&self, req: QueryJobsRequest) -> Result<QueryJobsResponse>;
    /// Cancel and forget builds
    fn drop_jobs(&self, req: DropJobsRequest) -> Result<Status>;
    /// Queue and slot report
    fn get_job_stats(&self) -> Result<JobStats>;
    /// Health probe
    fn check_health(&self) -> Result<HealthReport>;
}

/// Opens clients for workers discovered through their sessions
pub trait WorkerConnector: Send + Sync {
    /// Client for the worker advertising `session`
    fn connect(&self, session: &NodeSession) -> Result<Arc<dyn WorkerClient>>;
}

/// In-process client calling an [`IndexNode`] directly
pub struct LocalWorkerClient {
    node: Arc<IndexNode>,
    reachable: AtomicBool,
}

impl LocalWorkerClient {
    /// Client for a node in this process
    pub fn new(node: Arc<IndexNode>) -> Self {
        Self {
            node,
            reachable: AtomicBool::new(true),
        }
    }

    /// The wrapped node
    pub fn node(&self) -> &Arc<IndexNode> {
        &self.node
    }

    /// Simulate a network partition; every call fails while unreachable
    pub fn set_reachable(&self, reachable: bool) {
        self.reachable.store(reachable, Ordering::SeqCst);
    }

    fn check(&self) -> Result<()> {
        if self.reachable.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(CoordError::Worker(format!(
                "index node {} is unreachable",
                self.node.node_id()
            )))
        }
    }
}

impl WorkerClient for LocalWorkerClient {
    fn create_job(&self, req: CreateJobRequest) -> Result<Status> {
        self.check()?;
        Ok(self.node.create_job(req))
    }

    fn query_jobs(&self, req: QueryJobsRequest) -> Result<QueryJobsResponse> {
        self.check()?;
        Ok(self.node.query_jobs(&req))
    }

    fn drop_jobs(&self, req: DropJobsRequest) -> Result<Status> {
        self.check()?;
        Ok(self.node.drop_jobs(&req))
    }

    fn get_job_stats(&self) -> Result<JobStats> {
        self.check()?;
        Ok(self.node.get_job_stats())
    }

    fn check_health(&self) -> Result<HealthReport> {
        self.check()?;
        Ok(self.node.check_health())
    }
}

/// Connector resolving node ids to clients registered up front
#[derive(Default)]
pub struct LocalConnector {
    clients: RwLock<HashMap<NodeId, Arc<dyn WorkerClient>>>,
}

impl LocalConnector {
    /// Empty connector
    pub fn new() -> Self {
        Self::default()
    }

    /// Serve `client` for sessions of `node_id`
    pub fn add(&self, node_id: NodeId, client: Arc<dyn WorkerClient>) {
        self.clients.write().insert(node_id, client);
    }
}

impl WorkerConnector for LocalConnector {
    fn connect(&self, session: &NodeSession) -> Result<Arc<dyn WorkerClient>> {
        self.clients
            .read()
            .get(&session.node_id)
            .cloned()
            .ok_or(CoordError::NodeNotFound(session.node_id))
    }
}
