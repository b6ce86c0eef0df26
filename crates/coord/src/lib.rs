//! Index coordinator
//!
//! - IndexCoord: the coordinator service and its RPC handlers
//! - NodeRegistry / SessionWatcher: worker discovery and liveness
//! - Dispatcher: placement, status polling, re-dispatch of lost builds
//! - GarbageCollector: reclamation of dropped metadata and stale files
//! - IdAllocator: durable id reservation for indexes and builds

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod allocator;
pub mod api;
pub mod background;
pub mod broker;
pub mod client;
pub mod config;
pub mod dispatcher;
pub mod gc;
pub mod logging;
pub mod registry;
pub mod service;
pub mod session_watcher;
pub mod testing;

pub use allocator::{IdAllocator, ID_ALLOCATOR_KEY};
pub use api::{
    BuildProgress, CreateIndexRequest, DescribeIndexResponse, DropIndexRequest,
    GetIndexBuildProgressResponse, GetIndexInfosResponse, GetIndexStateResponse,
    GetMetricsResponse, GetSegmentIndexStateResponse, IndexDescription, IndexFilePathInfo,
    SegmentIndexInfos, SegmentIndexState,
};
pub use background::LoopGroup;
pub use broker::Broker;
pub use client::{LocalConnector, LocalWorkerClient, WorkerClient, WorkerConnector};
pub use config::{IndexCoordConfig, CONFIG_FILE_NAME, CONFIG_PREFIX};
pub use dispatcher::{DispatchConfig, Dispatcher, PollReport, REDISPATCH_EXHAUSTED};
pub use gc::GarbageCollector;
pub use registry::{NodeInfo, NodeRegistry, NodeState};
pub use service::{IndexCoord, COMPONENT_NAME};
pub use session_watcher::SessionWatcher;
pub use testing::MemoryBroker;
