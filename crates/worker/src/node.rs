//! Index node: the worker side of the build protocol
//!
//! An `IndexNode` accepts build jobs, runs them on its [`JobScheduler`] and
//! answers status polls from the task table. Job state is volatile; the
//! coordinator re-issues anything a restarted node forgot.

use crate::build::BuildTask;
use crate::builder::{CancelToken, IndexBuilder};
use crate::config::IndexNodeConfig;
use crate::scheduler::JobScheduler;
use crate::stores::ObjectStoreFactory;
use crate::task::{TaskInfo, TaskKey, TaskTable};
use idxcoord_core::{
    free_slots, CoordError, CreateJobRequest, DropJobsRequest, ErrorCode, HealthReport, JobStats,
    NodeId, QueryJobsRequest, QueryJobsResponse, Result, StateCode, Status,
};
use idxcoord_storage::{KeepAlive, MetaKv, NodeSession, Session};
use parking_lot::{Mutex, RwLock};
use std::sync::Arc;
use tracing::{debug, info, warn};

struct Registration {
    session: Arc<Session>,
    keep_alive: KeepAlive,
}

/// A worker process
pub struct IndexNode {
    config: IndexNodeConfig,
    state: RwLock<StateCode>,
    tasks: Arc<TaskTable>,
    scheduler: JobScheduler,
    builder: Arc<dyn IndexBuilder>,
    stores: Arc<dyn ObjectStoreFactory>,
    registration: Mutex<Option<Registration>>,
}

impl IndexNode {
    /// Create a node in the `Initializing` state
    pub fn new(
        config: IndexNodeConfig,
        builder: Arc<dyn IndexBuilder>,
        stores: Arc<dyn ObjectStoreFactory>,
    ) -> Result<Self> {
        config.validate()?;
        let scheduler = JobScheduler::new(config.build_parallelism, config.max_queue_len)?;
        Ok(Self {
            config,
            state: RwLock::new(StateCode::Initializing),
            tasks: Arc::new(TaskTable::new()),
            scheduler,
            builder,
            stores,
            registration: Mutex::new(None),
        })
    }

    /// Begin serving
    pub fn start(&self) {
        *self.state.write() = StateCode::Healthy;
        info!(
            target: "idxcoord::worker",
            node_id = self.config.node_id,
            parallelism = self.config.build_parallelism,
            "index node started"
        );
    }

    /// Publish the liveness session and keep it renewed
    pub fn register(&self, kv: Arc<dyn MetaKv>) -> Result<()> {
        let info = NodeSession::new(self.config.node_id, self.config.address.clone());
        let session = Arc::new(Session::register(kv, info, self.config.session_ttl())?);
        let keep_alive = session.start_keep_alive(self.config.keep_alive_interval());
        let previous = self.registration.lock().replace(Registration {
            session,
            keep_alive,
        });
        if let Some(mut old) = previous {
            old.keep_alive.stop();
            if let Err(e) = old.session.revoke() {
                warn!(target: "idxcoord::worker", error = %e, "failed to revoke previous session");
            }
        }
        Ok(())
    }

    /// Node id
    pub fn node_id(&self) -> NodeId {
        self.config.node_id
    }

    /// Current state code
    pub fn state_code(&self) -> StateCode {
        *self.state.read()
    }

    /// Configuration the node runs with
    pub fn config(&self) -> &IndexNodeConfig {
        &self.config
    }

    fn not_ready(&self) -> CoordError {
        CoordError::NotHealthy(format!("index node {}", self.config.node_id))
    }

    /// Accept a build job.
    ///
    /// A (cluster, build) pair already tracked is refused with
    /// `BuildIndexError`; the tracked task keeps running.
    pub fn create_job(&self, req: CreateJobRequest) -> Status {
        if !self.state_code().is_healthy() {
            return Status::from_error(&self.not_ready());
        }
        let key = TaskKey::new(req.cluster_id.clone(), req.build_id);
        let build_id = req.build_id;
        let cancel = CancelToken::new();
        if !self.tasks.insert_if_absent(key.clone(), TaskInfo::in_progress(cancel.clone())) {
            warn!(target: "idxcoord::worker", build_id, "duplicated index build task");
            return Status::from_error(&CoordError::DuplicateTask);
        }

        let store = match self.stores.open(&req.storage_config) {
            Ok(store) => store,
            Err(e) => {
                self.tasks.remove_many(&[key]);
                warn!(
                    target: "idxcoord::worker",
                    build_id,
                    error = %e,
                    "failed to open object store"
                );
                return Status::with_code(
                    ErrorCode::BuildIndexError,
                    format!("create object store failed: {}", e),
                );
            }
        };

        let task = BuildTask::new(
            req,
            store,
            Arc::clone(&self.builder),
            Arc::clone(&self.tasks),
            cancel,
        );
        if let Err(e) = self.scheduler.submit(move || task.run()) {
            self.tasks.remove_many(&[key]);
            warn!(target: "idxcoord::worker", build_id, error = %e, "failed to enqueue build");
            return Status::from_error(&e);
        }
        debug!(target: "idxcoord::worker", build_id, "build enqueued");
        Status::success()
    }

    /// Report the state of builds of one cluster
    pub fn query_jobs(&self, req: &QueryJobsRequest) -> QueryJobsResponse {
        if !self.state_code().is_healthy_or_stopping() {
            return QueryJobsResponse {
                status: Status::from_error(&self.not_ready()),
                cluster_id: req.cluster_id.clone(),
                index_infos: Vec::new(),
            };
        }
        QueryJobsResponse {
            status: Status::success(),
            cluster_id: req.cluster_id.clone(),
            index_infos: self.tasks.query(&req.cluster_id, &req.build_ids),
        }
    }

    /// Forget builds and cancel the ones still running
    pub fn drop_jobs(&self, req: &DropJobsRequest) -> Status {
        if !self.state_code().is_healthy_or_stopping() {
            return Status::from_error(&self.not_ready());
        }
        let keys: Vec<TaskKey> = req
            .build_ids
            .iter()
            .map(|id| TaskKey::new(req.cluster_id.clone(), *id))
            .collect();
        let removed = self.tasks.remove_many(&keys);
        for info in &removed {
            info.cancel.cancel();
        }
        debug!(
            target: "idxcoord::worker",
            requested = keys.len(),
            dropped = removed.len(),
            "dropped jobs"
        );
        Status::success()
    }

    /// Queue and slot report
    pub fn get_job_stats(&self) -> JobStats {
        if !self.state_code().is_healthy_or_stopping() {
            return JobStats {
                status: Status::from_error(&self.not_ready()),
                total_job_num: 0,
                in_progress_job_num: 0,
                enqueue_job_num: 0,
                task_slots: 0,
                job_infos: Vec::new(),
            };
        }
        let stats = self.scheduler.stats();
        JobStats {
            status: Status::success(),
            total_job_num: (stats.queued + stats.active) as i64,
            in_progress_job_num: stats.active as i64,
            enqueue_job_num: stats.queued as i64,
            task_slots: free_slots(stats.parallelism, stats.queued, stats.active) as i64,
            job_infos: self.tasks.statistics(),
        }
    }

    /// Health probe
    pub fn check_health(&self) -> HealthReport {
        let state = self.state_code();
        let reasons = if state.is_healthy() {
            Vec::new()
        } else {
            vec![format!("index node {} is {:?}", self.config.node_id, state)]
        };
        HealthReport {
            node_id: self.config.node_id,
            is_healthy: state.is_healthy(),
            reasons,
        }
    }

    /// Graceful stop: refuse new jobs, advertise stopping, finish queued
    /// builds, then drop the session
    pub fn stop(&self) {
        {
            let mut state = self.state.write();
            if !state.is_healthy_or_stopping() && *state != StateCode::Initializing {
                return;
            }
            *state = StateCode::Stopping;
        }
        let registration = self.registration.lock().take();
        if let Some(reg) = &registration {
            if let Err(e) = reg.session.mark_stopping() {
                warn!(target: "idxcoord::worker", error = %e, "failed to mark session stopping");
            }
        }

        self.scheduler.drain();
        self.scheduler.shutdown();

        if let Some(mut reg) = registration {
            reg.keep_alive.stop();
            if let Err(e) = reg.session.revoke() {
                warn!(target: "idxcoord::worker", error = %e, "failed to revoke session");
            }
        }
        *self.state.write() = StateCode::Abnormal;
        info!(target: "idxcoord::worker", node_id = self.config.node_id, "index node stopped");
    }
}
