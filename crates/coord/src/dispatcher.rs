//! Build dispatch
//!
//! Three passes, each run by its own loop:
//!
//! - **assign**: place `Unissued`, unowned rows on a live worker and record
//!   the owner (`InProgress`).
//! - **poll**: ask every owner for the state of its builds, persist terminal
//!   reports, then drop the job on the worker and release the row. Builds of
//!   gone workers, and builds a worker no longer knows, are reissued under a
//!   fresh build id.
//! - **probe**: health-check every worker and retire the ones that stay
//!   unhealthy or silent.
//!
//! Passes race with each other and with GC on individual rows. MetaTable's
//! state machine is the synchronization point: a losing write is rejected
//! and retried on a later pass.

use crate::allocator::IdAllocator;
use crate::broker::Broker;
use crate::client::WorkerClient;
use crate::registry::{NodeRegistry, NodeState};
use idxcoord_core::{
    BuildId, CoordError, CreateJobRequest, DropJobsRequest, ErrorCode, IndexId, IndexState,
    JobInfo, NodeId, QueryJobsRequest, Result, RetryConfig, SegmentId, SegmentIndex, SegmentState,
    Status, StorageConfig,
};
use idxcoord_meta::{MetaTable, StateUpdate};
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info, warn};

/// Fail reason recorded once a (segment, index) exhausts its re-dispatches
pub const REDISPATCH_EXHAUSTED: &str = "exceeded max re-dispatch attempts";

/// Dispatch settings
#[derive(Debug, Clone)]
pub struct DispatchConfig {
    /// Cluster id stamped on jobs
    pub cluster_id: String,
    /// Object store the workers use
    pub storage: StorageConfig,
    /// Candidate nodes tried per row per assign pass
    pub max_placement_attempts: usize,
    /// Re-dispatch bound and backoff per (segment, index)
    pub redispatch: RetryConfig,
}

/// Outcome counts of one poll pass
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PollReport {
    /// Builds recorded `Finished`
    pub finished: usize,
    /// Builds recorded `Failed`
    pub failed: usize,
    /// Rows released from their worker
    pub released: usize,
    /// Rows reissued under a new build id
    pub reissued: usize,
}

#[derive(Debug, Clone, Copy)]
struct Redispatch {
    attempts: usize,
    not_before: Instant,
}

/// Coordinator-side placement and status reconciliation
pub struct Dispatcher {
    config: DispatchConfig,
    meta: Arc<MetaTable>,
    registry: Arc<NodeRegistry>,
    broker: Arc<dyn Broker>,
    allocator: Arc<IdAllocator>,
    redispatch: Mutex<HashMap<(SegmentId, IndexId), Redispatch>>,
}

fn is_duplicate(status: &Status) -> bool {
    status.code == ErrorCode::BuildIndexError
        && status.reason == CoordError::DuplicateTask.to_string()
}

impl Dispatcher {
    /// Create a dispatcher
    pub fn new(
        config: DispatchConfig,
        meta: Arc<MetaTable>,
        registry: Arc<NodeRegistry>,
        broker: Arc<dyn Broker>,
        allocator: Arc<IdAllocator>,
    ) -> Self {
        Self {
            config,
            meta,
            registry,
            broker,
            allocator,
            redispatch: Mutex::new(HashMap::new()),
        }
    }

    /// Settings in use
    pub fn config(&self) -> &DispatchConfig {
        &self.config
    }

    /// (segment, index) pairs with re-dispatch bookkeeping
    pub fn pending_redispatches(&self) -> usize {
        self.redispatch.lock().len()
    }

    /// Reset the re-dispatch budget of a (segment, index) pair
    pub fn forget_redispatch(&self, segment_id: SegmentId, index_id: IndexId) {
        self.redispatch.lock().remove(&(segment_id, index_id));
    }

    /// Drop bookkeeping of pairs whose current build is settled or gone
    fn prune_redispatch(&self) {
        let mut redispatch = self.redispatch.lock();
        if redispatch.is_empty() {
            return;
        }
        redispatch.retain(|&(segment_id, index_id), _| {
            match self.meta.get_current_segment_index(segment_id, index_id) {
                Some(row) => {
                    !row.is_deleted()
                        && !row.index_state.is_terminal()
                        && !self.meta.is_index_deleted(row.collection_id, index_id)
                }
                None => false,
            }
        });
    }

    // ------------------------------------------------------------------
    // assign
    // ------------------------------------------------------------------

    /// Place every dispatchable row; returns how many were placed
    pub fn assign_pass(&self) -> usize {
        let now = Instant::now();
        let mut assigned = 0;
        for row in self.meta.list_unissued() {
            if self.in_backoff(&row, now) {
                continue;
            }
            match self.assign_one(&row) {
                Ok(true) => assigned += 1,
                Ok(false) => {}
                Err(e) => {
                    warn!(
                        target: "idxcoord::dispatch",
                        build_id = row.build_id,
                        error = %e,
                        "assign failed"
                    );
                }
            }
        }
        if assigned > 0 {
            debug!(target: "idxcoord::dispatch", assigned, "assign pass done");
        }
        assigned
    }

    fn in_backoff(&self, row: &SegmentIndex, now: Instant) -> bool {
        self.redispatch
            .lock()
            .get(&(row.segment_id, row.index_id))
            .map_or(false, |r| now < r.not_before)
    }

    /// Place one row. `Ok(false)` means it was not placed this pass.
    fn assign_one(&self, row: &SegmentIndex) -> Result<bool> {
        let Some(index) = self.meta.get_index(row.collection_id, row.index_id) else {
            return Ok(false);
        };
        if index.is_deleted() {
            return Ok(false);
        }
        let segment = self
            .broker
            .get_segment_info(&[row.segment_id])?
            .into_iter()
            .next()
            .filter(|s| s.state != SegmentState::Dropped);
        let Some(segment) = segment else {
            info!(
                target: "idxcoord::dispatch",
                build_id = row.build_id,
                segment_id = row.segment_id,
                "segment is gone, dropping its build"
            );
            let build_id = row.build_id;
            self.meta.mark_segment_indexes_deleted(|r| r.build_id == build_id)?;
            return Ok(false);
        };

        let req = CreateJobRequest {
            cluster_id: self.config.cluster_id.clone(),
            build_id: row.build_id,
            index_id: index.index_id,
            index_name: index.index_name.clone(),
            index_file_prefix: self.config.storage.root_path.clone(),
            index_version: row.index_version,
            data_paths: segment.field_data_paths(index.field_id),
            type_params: index.type_params.clone(),
            index_params: index.index_params.clone(),
            num_rows: row.num_rows,
            storage_config: self.config.storage.clone(),
            collection_id: row.collection_id,
            partition_id: row.partition_id,
            segment_id: row.segment_id,
            field_id: index.field_id,
        };

        let mut tried = HashSet::new();
        for _ in 0..self.config.max_placement_attempts {
            let (node_id, client) = match self.registry.pick_node(&tried) {
                Ok(picked) => picked,
                Err(CoordError::NoAvailableNode) => break,
                Err(e) => return Err(e),
            };
            tried.insert(node_id);
            match client.create_job(req.clone()) {
                Ok(status) if status.is_success() || is_duplicate(&status) => {
                    return self.record_assignment(row.build_id, node_id, client.as_ref());
                }
                Ok(status) => {
                    debug!(
                        target: "idxcoord::dispatch",
                        build_id = row.build_id,
                        node_id,
                        reason = %status.reason,
                        "node rejected job"
                    );
                }
                Err(e) => {
                    warn!(
                        target: "idxcoord::dispatch",
                        build_id = row.build_id,
                        node_id,
                        error = %e,
                        "create job failed"
                    );
                }
            }
        }
        debug!(
            target: "idxcoord::dispatch",
            build_id = row.build_id,
            tried = tried.len(),
            "no node accepted build"
        );
        Ok(false)
    }

    fn record_assignment(
        &self,
        build_id: BuildId,
        node_id: NodeId,
        client: &dyn WorkerClient,
    ) -> Result<bool> {
        match self.meta.assign_node(build_id, node_id) {
            Ok(()) => {
                self.registry.note_assigned(node_id);
                info!(target: "idxcoord::dispatch", build_id, node_id, "build dispatched");
                Ok(true)
            }
            Err(e) => {
                // the row moved on meanwhile; the worker must not keep building it
                self.drop_on_worker(client, node_id, &[build_id]);
                Err(e)
            }
        }
    }

    fn drop_on_worker(&self, client: &dyn WorkerClient, node_id: NodeId, build_ids: &[BuildId]) {
        let req = DropJobsRequest {
            cluster_id: self.config.cluster_id.clone(),
            build_ids: build_ids.to_vec(),
        };
        match client.drop_jobs(req) {
            Ok(status) if status.is_success() => {}
            Ok(status) => {
                warn!(
                    target: "idxcoord::dispatch",
                    node_id,
                    reason = %status.reason,
                    "drop jobs refused"
                );
            }
            Err(e) => {
                warn!(target: "idxcoord::dispatch", node_id, error = %e, "drop jobs failed");
            }
        }
    }

    // ------------------------------------------------------------------
    // poll
    // ------------------------------------------------------------------

    /// Reconcile every owned row with its worker
    pub fn poll_pass(&self) -> PollReport {
        self.prune_redispatch();
        let mut report = PollReport::default();
        let owned = self.meta.list_in_progress_by_node();
        let counts: HashMap<NodeId, usize> =
            owned.iter().map(|(n, rows)| (*n, rows.len())).collect();
        self.registry.set_assigned(&counts);

        for (node_id, rows) in owned {
            if !self.registry.is_alive(node_id) {
                for row in &rows {
                    self.recover(row, "node is gone", &mut report);
                }
                continue;
            }
            let Some(client) = self.registry.client(node_id) else {
                continue;
            };
            self.poll_node(node_id, client.as_ref(), &rows, &mut report);
        }
        report
    }

    fn poll_node(
        &self,
        node_id: NodeId,
        client: &dyn WorkerClient,
        rows: &[SegmentIndex],
        report: &mut PollReport,
    ) {
        let req = QueryJobsRequest {
            cluster_id: self.config.cluster_id.clone(),
            build_ids: rows.iter().map(|r| r.build_id).collect(),
        };
        let resp = match client.query_jobs(req) {
            Ok(resp) if resp.status.is_success() => resp,
            Ok(resp) => {
                debug!(
                    target: "idxcoord::dispatch",
                    node_id,
                    reason = %resp.status.reason,
                    "query jobs refused"
                );
                return;
            }
            Err(e) => {
                warn!(target: "idxcoord::dispatch", node_id, error = %e, "query jobs failed");
                return;
            }
        };
        let infos: HashMap<BuildId, JobInfo> = resp
            .index_infos
            .into_iter()
            .map(|info| (info.build_id, info))
            .collect();

        for row in rows {
            let reported = infos
                .get(&row.build_id)
                .cloned()
                .unwrap_or_else(|| JobInfo::unknown(row.build_id));
            if let Err(e) = self.reconcile(node_id, client, row, reported, report) {
                warn!(
                    target: "idxcoord::dispatch",
                    build_id = row.build_id,
                    node_id,
                    error = %e,
                    "reconcile failed"
                );
            }
        }
    }

    fn reconcile(
        &self,
        node_id: NodeId,
        client: &dyn WorkerClient,
        row: &SegmentIndex,
        info: JobInfo,
        report: &mut PollReport,
    ) -> Result<()> {
        if row.index_state.is_terminal() {
            // reported earlier, release did not land
            return self.release(node_id, client, row.build_id, report);
        }
        match info.state {
            IndexState::Finished => {
                self.meta.update_state(
                    row.build_id,
                    StateUpdate::finished(info.index_file_keys, info.serialized_size),
                )?;
                self.forget_redispatch(row.segment_id, row.index_id);
                report.finished += 1;
                self.release(node_id, client, row.build_id, report)
            }
            IndexState::Failed => {
                self.meta
                    .update_state(row.build_id, StateUpdate::failed(info.fail_reason))?;
                self.forget_redispatch(row.segment_id, row.index_id);
                report.failed += 1;
                self.release(node_id, client, row.build_id, report)
            }
            IndexState::None => {
                self.recover(row, "worker lost the build", report);
                Ok(())
            }
            IndexState::Unissued | IndexState::InProgress => Ok(()),
        }
    }

    fn release(
        &self,
        node_id: NodeId,
        client: &dyn WorkerClient,
        build_id: BuildId,
        report: &mut PollReport,
    ) -> Result<()> {
        self.drop_on_worker(client, node_id, &[build_id]);
        self.meta.release_node(build_id)?;
        report.released += 1;
        Ok(())
    }

    /// Recover a row whose worker no longer holds it
    fn recover(&self, row: &SegmentIndex, cause: &str, report: &mut PollReport) {
        if let Err(e) = self.try_recover(row, cause, report) {
            warn!(
                target: "idxcoord::dispatch",
                build_id = row.build_id,
                error = %e,
                "recovery failed"
            );
        }
    }

    fn try_recover(&self, row: &SegmentIndex, cause: &str, report: &mut PollReport) -> Result<()> {
        if row.index_state.is_terminal()
            || row.is_deleted()
            || self.meta.is_index_deleted(row.collection_id, row.index_id)
        {
            self.meta.release_node(row.build_id)?;
            self.forget_redispatch(row.segment_id, row.index_id);
            report.released += 1;
            return Ok(());
        }

        let key = (row.segment_id, row.index_id);
        let attempts = self.redispatch.lock().get(&key).map_or(0, |r| r.attempts);
        if attempts >= self.config.redispatch.max_retries {
            warn!(
                target: "idxcoord::dispatch",
                build_id = row.build_id,
                segment_id = row.segment_id,
                attempts,
                "giving up on build"
            );
            self.meta
                .update_state(row.build_id, StateUpdate::failed(REDISPATCH_EXHAUSTED))?;
            self.meta.release_node(row.build_id)?;
            self.forget_redispatch(row.segment_id, row.index_id);
            report.failed += 1;
            report.released += 1;
            return Ok(());
        }

        let new_build_id = self.allocator.alloc_one()?;
        let fresh = self.meta.reissue(row.build_id, new_build_id)?;
        let delay = self.config.redispatch.calculate_delay(attempts);
        self.redispatch.lock().insert(
            key,
            Redispatch {
                attempts: attempts + 1,
                not_before: Instant::now() + delay,
            },
        );
        info!(
            target: "idxcoord::dispatch",
            old_build_id = row.build_id,
            build_id = fresh.build_id,
            node_id = row.node_id,
            attempt = attempts + 1,
            cause,
            ?delay,
            "build reissued"
        );
        report.reissued += 1;
        Ok(())
    }

    // ------------------------------------------------------------------
    // probe
    // ------------------------------------------------------------------

    /// Health-check every worker and retire the ones past their window;
    /// returns nodes removed this pass
    pub fn probe_pass(&self) -> Vec<NodeId> {
        let now = Instant::now();
        for (node_id, state, client) in self.registry.alive_clients() {
            let healthy = match client.check_health() {
                // a draining node reports unhealthy but is still serving polls
                Ok(report) => report.is_healthy || state == NodeState::Stopping,
                Err(e) => {
                    debug!(
                        target: "idxcoord::dispatch",
                        node_id,
                        error = %e,
                        "health check failed"
                    );
                    false
                }
            };
            if healthy {
                if let Ok(stats) = client.get_job_stats() {
                    if stats.status.is_success() {
                        self.registry.record_slots(node_id, stats.task_slots);
                    }
                }
            }
            self.registry.heartbeat(node_id, healthy, now);
        }
        self.registry.evaluate(now);
        self.registry.expire()
    }
}
