//! The index coordinator
//!
//! [`IndexCoord`] owns the metadata, the worker registry and the background
//! loops, and answers the coordinator RPCs. Handlers never return internal
//! error types: every failure is folded into a [`Status`].
//!
//! # Lifecycle
//!
//! ```text
//! Initializing --start/init--> Healthy --stop--> Stopping --> Abnormal
//! ```
//!
//! Every RPC answers `NotReady` outside `Healthy`.

use crate::allocator::IdAllocator;
use crate::api::{
    BuildProgress, CreateIndexRequest, DescribeIndexResponse, DropIndexRequest,
    GetIndexBuildProgressResponse, GetIndexInfosResponse, GetIndexStateResponse,
    GetMetricsResponse, GetSegmentIndexStateResponse, IndexDescription, IndexFilePathInfo,
    SegmentIndexInfos, SegmentIndexState,
};
use crate::background::LoopGroup;
use crate::broker::Broker;
use crate::client::WorkerConnector;
use crate::config::IndexCoordConfig;
use crate::dispatcher::{DispatchConfig, Dispatcher};
use crate::gc::GarbageCollector;
use crate::registry::{NodeRegistry, NodeState};
use crate::session_watcher::SessionWatcher;
use idxcoord_core::paths::segment_index_file_path;
use idxcoord_core::{
    BuildId, CollectionId, CoordError, HealthReport, Index, IndexId, IndexState, Liveness,
    PartitionId, Result, SegmentId, SegmentIndex, SegmentInfo, SegmentState, StateCode, Status,
    Timestamp,
};
use idxcoord_meta::{Catalog, MetaTable};
use idxcoord_storage::{LeaseReaper, MetaKv, ObjectStore};
use parking_lot::{Mutex, RwLock};
use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;
use std::thread::JoinHandle;
use tracing::{debug, info, warn};

/// Component name reported in metrics
pub const COMPONENT_NAME: &str = "indexcoord";

/// Coordinator service
pub struct IndexCoord {
    config: IndexCoordConfig,
    state: RwLock<StateCode>,
    meta: Arc<MetaTable>,
    broker: Arc<dyn Broker>,
    allocator: Arc<IdAllocator>,
    registry: Arc<NodeRegistry>,
    dispatcher: Arc<Dispatcher>,
    gc: Arc<GarbageCollector>,
    watcher: Arc<SessionWatcher>,
    reaper: LeaseReaper,
    reaper_handle: Mutex<Option<JoinHandle<()>>>,
    loops: LoopGroup,
}

impl IndexCoord {
    /// Build a coordinator over `kv`, reloading persisted metadata.
    ///
    /// The coordinator starts `Initializing`; call [`start`](Self::start)
    /// (or [`init`](Self::init) to serve without background loops).
    pub fn new(
        config: IndexCoordConfig,
        kv: Arc<dyn MetaKv>,
        broker: Arc<dyn Broker>,
        store: Arc<dyn ObjectStore>,
        connector: Arc<dyn WorkerConnector>,
    ) -> Result<Self> {
        config.validate()?;
        let meta = Arc::new(MetaTable::new(Catalog::new(Arc::clone(&kv)))?);
        let allocator = Arc::new(IdAllocator::new(
            Arc::clone(&kv),
            config.id_alloc_batch,
            config.alloc_retry.clone(),
        ));
        let registry = Arc::new(NodeRegistry::new(config.node_ttl(), config.health_window()));
        let dispatcher = Arc::new(Dispatcher::new(
            DispatchConfig {
                cluster_id: config.cluster_id.clone(),
                storage: config.storage.clone(),
                max_placement_attempts: config.max_placement_attempts,
                redispatch: config.redispatch.clone(),
            },
            Arc::clone(&meta),
            Arc::clone(&registry),
            Arc::clone(&broker),
            Arc::clone(&allocator),
        ));
        let gc = Arc::new(GarbageCollector::new(
            Arc::clone(&meta),
            Arc::clone(&broker),
            store,
            config.storage.root_path.clone(),
        ));
        let reaper = LeaseReaper::new(Arc::clone(&kv), config.lease_check_interval());
        let watcher = Arc::new(SessionWatcher::new(kv, Arc::clone(&registry), connector));

        Ok(Self {
            config,
            state: RwLock::new(StateCode::Initializing),
            meta,
            broker,
            allocator,
            registry,
            dispatcher,
            gc,
            watcher,
            reaper,
            reaper_handle: Mutex::new(None),
            loops: LoopGroup::new(),
        })
    }

    /// Sync workers from their sessions and start serving, without
    /// background loops. Passes are then driven through
    /// [`dispatcher`](Self::dispatcher) and [`gc`](Self::gc).
    pub fn init(&self) -> Result<()> {
        self.ensure_initializing()?;
        let sessions = self.watcher.sync()?;
        self.set_healthy(sessions);
        Ok(())
    }

    /// Start the session lease reaper, the session watcher, the dispatch,
    /// poll and probe loops and the GC loops, then begin serving
    pub fn start(&self) -> Result<()> {
        self.ensure_initializing()?;
        *self.reaper_handle.lock() = Some(self.reaper.start());
        self.watcher.start(&self.loops, self.config.dispatch_interval())?;

        let dispatcher = Arc::clone(&self.dispatcher);
        self.loops
            .spawn("idxcoord-assign", self.config.dispatch_interval(), move || {
                dispatcher.assign_pass();
            })?;
        let dispatcher = Arc::clone(&self.dispatcher);
        self.loops
            .spawn("idxcoord-poll", self.config.poll_interval(), move || {
                dispatcher.poll_pass();
            })?;
        let dispatcher = Arc::clone(&self.dispatcher);
        self.loops
            .spawn("idxcoord-probe", self.config.health_check_interval(), move || {
                dispatcher.probe_pass();
            })?;
        self.gc.start(
            &self.loops,
            self.config.gc_meta_interval(),
            self.config.gc_file_interval(),
        )?;

        self.set_healthy(self.registry.len());
        Ok(())
    }

    fn ensure_initializing(&self) -> Result<()> {
        let state = self.state_code();
        if state != StateCode::Initializing {
            return Err(CoordError::invalid_input(format!(
                "index coord cannot start from {:?}",
                state
            )));
        }
        Ok(())
    }

    fn set_healthy(&self, nodes: usize) {
        *self.state.write() = StateCode::Healthy;
        info!(
            target: "idxcoord::service",
            coordinator_id = self.config.coordinator_id,
            nodes,
            loops = self.loops.len(),
            "index coord serving"
        );
    }

    /// Stop serving and join every background loop
    pub fn stop(&self) {
        {
            let mut state = self.state.write();
            if *state == StateCode::Abnormal {
                return;
            }
            *state = StateCode::Stopping;
        }
        self.loops.stop();
        self.stop_reaper();
        *self.state.write() = StateCode::Abnormal;
        info!(
            target: "idxcoord::service",
            coordinator_id = self.config.coordinator_id,
            "index coord stopped"
        );
    }

    fn stop_reaper(&self) {
        self.reaper.shutdown();
        if let Some(handle) = self.reaper_handle.lock().take() {
            if handle.join().is_err() {
                warn!(target: "idxcoord::service", "lease reaper panicked");
            }
        }
    }

    /// Whether the session lease reaper is running
    pub fn is_reaping_leases(&self) -> bool {
        self.reaper_handle.lock().is_some() && !self.reaper.is_shutdown()
    }

    /// Current state code
    pub fn state_code(&self) -> StateCode {
        *self.state.read()
    }

    /// Configuration in use
    pub fn config(&self) -> &IndexCoordConfig {
        &self.config
    }

    /// Index metadata
    pub fn meta(&self) -> &Arc<MetaTable> {
        &self.meta
    }

    /// Worker registry
    pub fn registry(&self) -> &Arc<NodeRegistry> {
        &self.registry
    }

    /// Build dispatcher
    pub fn dispatcher(&self) -> &Arc<Dispatcher> {
        &self.dispatcher
    }

    /// Garbage collector
    pub fn gc(&self) -> &Arc<GarbageCollector> {
        &self.gc
    }

    /// Session watcher
    pub fn session_watcher(&self) -> &Arc<SessionWatcher> {
        &self.watcher
    }

    fn not_ready(&self) -> Option<Status> {
        if self.state_code().is_healthy() {
            return None;
        }
        let err = CoordError::NotHealthy(format!("index coord {}", self.config.coordinator_id));
        Some(Status::from_error(&err))
    }

    // ------------------------------------------------------------------
    // index definitions
    // ------------------------------------------------------------------

    /// Register an index and create build rows for every flushed segment
    /// of the collection. Re-creating the same name with the same params is
    /// a success.
    pub fn create_index(&self, req: CreateIndexRequest) -> Status {
        if let Some(status) = self.not_ready() {
            return status;
        }
        info!(
            target: "idxcoord::service",
            collection_id = req.collection_id,
            field_id = req.field_id,
            index_name = %req.index_name,
            "create index"
        );
        match self.try_create_index(req) {
            Ok(_) => Status::success(),
            Err(e) => {
                warn!(target: "idxcoord::service", error = %e, "create index failed");
                Status::from_error(&e)
            }
        }
    }

    fn try_create_index(&self, req: CreateIndexRequest) -> Result<IndexId> {
        let collection_id = req.collection_id;
        let index = Index {
            tenant_id: req.tenant_id,
            collection_id,
            field_id: req.field_id,
            index_id: self.allocator.alloc_one()?,
            index_name: req.index_name,
            type_params: req.type_params,
            index_params: req.index_params,
            user_index_params: req.user_index_params,
            is_auto_index: req.is_auto_index,
            liveness: Liveness::Active,
            create_time: Timestamp::now(),
        };
        let index_id = self.meta.create_index(index)?;
        let index = self
            .meta
            .get_index(collection_id, index_id)
            .ok_or_else(|| CoordError::IndexNotExist(index_id.to_string()))?;

        let flushed = self.broker.get_flushed_segments(collection_id, None)?;
        let segments = self.broker.get_segment_info(&flushed)?;
        let created = self.fan_out(&index, &segments)?;
        debug!(
            target: "idxcoord::service",
            collection_id,
            index_id,
            created,
            "segment indexes created"
        );
        Ok(index_id)
    }

    /// Create build rows of `index` for the flushed segments among
    /// `segments` that have none yet
    fn fan_out(&self, index: &Index, segments: &[SegmentInfo]) -> Result<usize> {
        let mut created = 0;
        for segment in segments {
            if segment.state != SegmentState::Flushed
                || segment.collection_id != index.collection_id
            {
                continue;
            }
            if self
                .meta
                .get_current_segment_index(segment.id, index.index_id)
                .is_some()
            {
                continue;
            }
            let build_id = self.allocator.alloc_one()?;
            let mut row = SegmentIndex::unissued(
                segment.collection_id,
                segment.partition_id,
                segment.id,
                segment.num_rows,
                index.index_id,
                build_id,
                1,
            );
            if segment.num_rows < self.config.min_segment_num_rows_to_index {
                debug!(
                    target: "idxcoord::service",
                    segment_id = segment.id,
                    num_rows = segment.num_rows,
                    "segment too small to index"
                );
                row.index_state = IndexState::Finished;
            }
            self.meta.add_segment_index(row)?;
            created += 1;
        }
        Ok(created)
    }

    /// Flush-time fan-out: create build rows for every index of the
    /// segment's collection
    pub fn on_segment_flushed(&self, segment: SegmentInfo) -> Status {
        if let Some(status) = self.not_ready() {
            return status;
        }
        let mut created = 0;
        for index in self.meta.list_indexes(segment.collection_id) {
            match self.fan_out(&index, std::slice::from_ref(&segment)) {
                Ok(n) => created += n,
                Err(e) => {
                    warn!(
                        target: "idxcoord::service",
                        segment_id = segment.id,
                        index_id = index.index_id,
                        error = %e,
                        "flush fan-out failed"
                    );
                    return Status::from_error(&e);
                }
            }
        }
        debug!(target: "idxcoord::service", segment_id = segment.id, created, "segment flushed");
        Status::success()
    }

    /// Soft-delete one or all indexes of a collection, or only their builds
    /// on the given partitions. Dropping a name that does not exist succeeds.
    pub fn drop_index(&self, req: DropIndexRequest) -> Status {
        if let Some(status) = self.not_ready() {
            return status;
        }
        info!(
            target: "idxcoord::service",
            collection_id = req.collection_id,
            index_name = %req.index_name,
            drop_all = req.drop_all,
            partitions = req.partition_ids.len(),
            "drop index"
        );
        match self.try_drop_index(&req) {
            Ok(()) => Status::success(),
            Err(e) => {
                warn!(
                    target: "idxcoord::service",
                    collection_id = req.collection_id,
                    error = %e,
                    "drop index failed"
                );
                Status::from_error(&e)
            }
        }
    }

    fn try_drop_index(&self, req: &DropIndexRequest) -> Result<()> {
        let collection_id = req.collection_id;
        let ids = self.meta.get_index_id_by_name(collection_id, &req.index_name);
        if !req.drop_all && req.index_name.is_empty() && ids.len() > 1 {
            return Err(CoordError::AmbiguousIndexName { collection_id });
        }
        if ids.is_empty() {
            debug!(
                target: "idxcoord::service",
                collection_id,
                index_name = %req.index_name,
                "no index to drop"
            );
            return Ok(());
        }

        if req.partition_ids.is_empty() {
            for index_id in ids {
                self.meta.mark_index_deleted(collection_id, Some(index_id), false)?;
            }
            return Ok(());
        }
        let partitions: HashSet<PartitionId> = req.partition_ids.iter().copied().collect();
        let marked = self.meta.mark_segment_indexes_deleted(|r| {
            r.collection_id == collection_id
                && ids.contains(&r.index_id)
                && partitions.contains(&r.partition_id)
        })?;
        debug!(target: "idxcoord::service", collection_id, marked, "partition builds dropped");
        Ok(())
    }

    /// Supersede a failed build with a fresh attempt
    pub fn retry_segment_index(&self, build_id: BuildId) -> Status {
        if let Some(status) = self.not_ready() {
            return status;
        }
        match self.try_retry(build_id) {
            Ok(fresh) => {
                info!(
                    target: "idxcoord::service",
                    old_build_id = build_id,
                    build_id = fresh.build_id,
                    "failed build retried"
                );
                Status::success()
            }
            Err(e) => {
                warn!(target: "idxcoord::service", build_id, error = %e, "retry failed");
                Status::from_error(&e)
            }
        }
    }

    fn try_retry(&self, build_id: BuildId) -> Result<SegmentIndex> {
        let row = self
            .meta
            .get_segment_index_by_build_id(build_id)
            .ok_or(CoordError::BuildIdNotFound(build_id))?;
        if row.is_deleted() {
            return Err(CoordError::invalid_input(format!("build {} was dropped", build_id)));
        }
        if row.index_state != IndexState::Failed {
            return Err(CoordError::invalid_input(format!(
                "build {} is {}, only failed builds can be retried",
                build_id,
                row.index_state.name()
            )));
        }
        if row.is_owned() {
            return Err(CoordError::BuildInUse {
                build_id,
                node_id: row.node_id,
            });
        }
        let new_build_id = self.allocator.alloc_one()?;
        let fresh = self.meta.reissue(build_id, new_build_id)?;
        self.dispatcher.forget_redispatch(row.segment_id, row.index_id);
        Ok(fresh)
    }

    // ------------------------------------------------------------------
    // queries
    // ------------------------------------------------------------------

    /// Aggregate build state of one index
    pub fn get_index_state(
        &self,
        collection_id: CollectionId,
        index_name: &str,
    ) -> GetIndexStateResponse {
        let failed = |status| GetIndexStateResponse {
            status,
            state: IndexState::None,
            fail_reason: String::new(),
        };
        if let Some(status) = self.not_ready() {
            return failed(status);
        }
        match self.meta.resolve_index(collection_id, index_name) {
            Ok(index) => {
                let (state, fail_reason) = self.aggregate_state(index.index_id);
                GetIndexStateResponse {
                    status: Status::success(),
                    state,
                    fail_reason,
                }
            }
            Err(e) => failed(Status::from_error(&e)),
        }
    }

    /// Any failed build makes the index failed; all unissued is unissued;
    /// anything unfinished is in progress
    fn aggregate_state(&self, index_id: IndexId) -> (IndexState, String) {
        let rows = self.meta.list_segment_indexes(index_id);
        if let Some(failed) = rows.iter().find(|r| r.index_state == IndexState::Failed) {
            return (IndexState::Failed, failed.fail_reason.clone());
        }
        if !rows.is_empty() && rows.iter().all(|r| r.index_state == IndexState::Unissued) {
            return (IndexState::Unissued, String::new());
        }
        if rows.iter().any(|r| r.index_state != IndexState::Finished) {
            return (IndexState::InProgress, String::new());
        }
        (IndexState::Finished, String::new())
    }

    /// Per-segment build state; segments without a build report `None`
    pub fn get_segment_index_state(
        &self,
        collection_id: CollectionId,
        index_name: &str,
        segment_ids: &[SegmentId],
    ) -> GetSegmentIndexStateResponse {
        if let Some(status) = self.not_ready() {
            return GetSegmentIndexStateResponse {
                status,
                states: Vec::new(),
            };
        }
        let index = match self.meta.resolve_index(collection_id, index_name) {
            Ok(index) => index,
            Err(e) => {
                return GetSegmentIndexStateResponse {
                    status: Status::from_error(&e),
                    states: Vec::new(),
                }
            }
        };
        let states = segment_ids
            .iter()
            .map(|&segment_id| {
                match self.meta.get_current_segment_index(segment_id, index.index_id) {
                    Some(row) => SegmentIndexState {
                        segment_id,
                        state: row.index_state,
                        fail_reason: row.fail_reason,
                    },
                    None => SegmentIndexState {
                        segment_id,
                        state: IndexState::None,
                        fail_reason: String::new(),
                    },
                }
            })
            .collect();
        GetSegmentIndexStateResponse {
            status: Status::success(),
            states,
        }
    }

    /// Row counts over the collection's flushed segments
    pub fn get_index_build_progress(
        &self,
        collection_id: CollectionId,
        index_name: &str,
    ) -> GetIndexBuildProgressResponse {
        if let Some(status) = self.not_ready() {
            return GetIndexBuildProgressResponse {
                status,
                progress: BuildProgress::default(),
            };
        }
        let result = self
            .meta
            .resolve_index(collection_id, index_name)
            .and_then(|index| self.progress(&index));
        match result {
            Ok(progress) => GetIndexBuildProgressResponse {
                status: Status::success(),
                progress,
            },
            Err(e) => GetIndexBuildProgressResponse {
                status: Status::from_error(&e),
                progress: BuildProgress::default(),
            },
        }
    }

    fn progress(&self, index: &Index) -> Result<BuildProgress> {
        let flushed = self.broker.get_flushed_segments(index.collection_id, None)?;
        let segments = self.broker.get_segment_info(&flushed)?;
        let mut progress = BuildProgress::default();
        for segment in &segments {
            progress.total_rows += segment.num_rows;
            if let Some(row) = self.meta.get_current_segment_index(segment.id, index.index_id) {
                if row.index_state == IndexState::Finished {
                    progress.indexed_rows += row.num_rows;
                }
            }
        }
        progress.pending_index_rows = (progress.total_rows - progress.indexed_rows).max(0);
        Ok(progress)
    }

    /// Finished builds with full file paths, per segment. An empty name
    /// covers every index of the collection.
    pub fn get_index_infos(
        &self,
        collection_id: CollectionId,
        segment_ids: &[SegmentId],
        index_name: &str,
    ) -> GetIndexInfosResponse {
        if let Some(status) = self.not_ready() {
            return GetIndexInfosResponse {
                status,
                segment_info: BTreeMap::new(),
            };
        }
        let indexes: Vec<Index> = self
            .meta
            .list_indexes(collection_id)
            .into_iter()
            .filter(|i| index_name.is_empty() || i.index_name == index_name)
            .collect();

        let mut segment_info = BTreeMap::new();
        for &segment_id in segment_ids {
            let index_infos: Vec<IndexFilePathInfo> = indexes
                .iter()
                .filter_map(|index| {
                    let row = self.meta.get_current_segment_index(segment_id, index.index_id)?;
                    (row.index_state == IndexState::Finished)
                        .then(|| self.file_path_info(index, &row))
                })
                .collect();
            segment_info.insert(
                segment_id,
                SegmentIndexInfos {
                    collection_id,
                    segment_id,
                    enable_index: !index_infos.is_empty(),
                    index_infos,
                },
            );
        }
        GetIndexInfosResponse {
            status: Status::success(),
            segment_info,
        }
    }

    fn file_path_info(&self, index: &Index, row: &SegmentIndex) -> IndexFilePathInfo {
        let index_file_paths = row
            .index_file_keys
            .iter()
            .map(|key| {
                segment_index_file_path(
                    &self.config.storage.root_path,
                    row.build_id,
                    row.index_version,
                    row.partition_id,
                    row.segment_id,
                    key,
                )
            })
            .collect();
        IndexFilePathInfo {
            segment_id: row.segment_id,
            field_id: index.field_id,
            index_id: index.index_id,
            build_id: row.build_id,
            index_name: index.index_name.clone(),
            index_params: index.index_params.clone(),
            index_file_paths,
            serialized_size: row.index_size,
            index_version: row.index_version,
            num_rows: row.num_rows,
        }
    }

    /// Definition, aggregate state and progress of one index. An empty name
    /// resolves only when the collection has a single index.
    pub fn describe_index(
        &self,
        collection_id: CollectionId,
        index_name: &str,
    ) -> DescribeIndexResponse {
        if let Some(status) = self.not_ready() {
            return DescribeIndexResponse {
                status,
                index_infos: Vec::new(),
            };
        }
        match self.try_describe(collection_id, index_name) {
            Ok(description) => DescribeIndexResponse {
                status: Status::success(),
                index_infos: vec![description],
            },
            Err(e) => DescribeIndexResponse {
                status: Status::from_error(&e),
                index_infos: Vec::new(),
            },
        }
    }

    fn try_describe(
        &self,
        collection_id: CollectionId,
        index_name: &str,
    ) -> Result<IndexDescription> {
        let index = self.meta.resolve_index(collection_id, index_name)?;
        let progress = self.progress(&index)?;
        let (state, fail_reason) = self.aggregate_state(index.index_id);
        Ok(IndexDescription {
            index_name: index.index_name,
            index_id: index.index_id,
            field_id: index.field_id,
            type_params: index.type_params,
            index_params: index.index_params,
            user_index_params: index.user_index_params,
            is_auto_index: index.is_auto_index,
            state,
            fail_reason,
            progress,
        })
    }

    // ------------------------------------------------------------------
    // observability
    // ------------------------------------------------------------------

    /// JSON topology: coordinator identity, registered workers and build
    /// counts by state
    pub fn get_metrics(&self) -> GetMetricsResponse {
        let response = |status, response| GetMetricsResponse {
            status,
            response,
            component_name: COMPONENT_NAME.to_string(),
        };
        if let Some(status) = self.not_ready() {
            return response(status, String::new());
        }

        let mut builds: BTreeMap<&'static str, usize> = BTreeMap::new();
        for row in self.meta.get_all_seg_indexes() {
            if !row.is_deleted() {
                *builds.entry(row.index_state.name()).or_default() += 1;
            }
        }
        let topology = serde_json::json!({
            "component": COMPONENT_NAME,
            "coordinator_id": self.config.coordinator_id,
            "cluster_id": self.config.cluster_id,
            "state": format!("{:?}", self.state_code()),
            "generated_at": chrono::Utc::now().to_rfc3339(),
            "nodes": self.registry.nodes(),
            "builds": builds,
        });
        match serde_json::to_string(&topology) {
            Ok(json) => response(Status::success(), json),
            Err(e) => response(
                Status::from_error(&CoordError::Serialization(e.to_string())),
                String::new(),
            ),
        }
    }

    /// Coordinator health plus every worker that is gone or fails its probe
    pub fn check_health(&self) -> HealthReport {
        let mut reasons = Vec::new();
        let state = self.state_code();
        if !state.is_healthy() {
            reasons.push(format!("index coord {} is {:?}", self.config.coordinator_id, state));
        }
        for node in self.registry.nodes() {
            if node.state == NodeState::Gone {
                reasons.push(format!("index node {} is gone", node.node_id));
            }
        }
        for (node_id, state, client) in self.registry.alive_clients() {
            match client.check_health() {
                Ok(report) if report.is_healthy || state == NodeState::Stopping => {}
                Ok(report) => reasons.extend(report.reasons),
                Err(e) => reasons.push(format!("index node {} is unreachable: {}", node_id, e)),
            }
        }
        HealthReport {
            node_id: self.config.coordinator_id,
            is_healthy: reasons.is_empty(),
            reasons,
        }
    }
}

impl Drop for IndexCoord {
    fn drop(&mut self) {
        self.loops.stop();
        self.stop_reaper();
    }
}
