//! idxcoord - coordination and reclamation of asynchronous index builds
//!
//! A coordinator tracks which secondary indexes exist on which segments,
//! dispatches build jobs to a pool of worker nodes, reconciles their reports,
//! and reclaims metadata and files once indexes or segments are dropped.
//!
//! # Quick Start
//!
//! ```ignore
//! use idxcoord::coord::{
//!     CreateIndexRequest, IndexCoord, IndexCoordConfig, LocalConnector, MemoryBroker,
//! };
//! use idxcoord::storage::{KvStore, MemoryObjectStore};
//! use std::sync::Arc;
//!
//! let coord = IndexCoord::new(
//!     IndexCoordConfig::default(),
//!     Arc::new(KvStore::ephemeral()),
//!     Arc::new(MemoryBroker::new()),
//!     Arc::new(MemoryObjectStore::new("files")),
//!     Arc::new(LocalConnector::new()),
//! )?;
//! coord.start()?;
//! let status = coord.create_index(request);
//! ```
//!
//! # Architecture
//!
//! - [`core`]: identifiers, rows, the build state machine, errors, config
//! - [`storage`]: durable KV with leases and watches, sessions, object stores
//! - [`meta`]: the MetaTable mirror over the catalog
//! - [`worker`]: the index node and its job scheduler
//! - [`coord`]: the coordinator service, dispatcher and garbage collector

pub use idxcoord_coord as coord;
pub use idxcoord_core as core;
pub use idxcoord_meta as meta;
pub use idxcoord_storage as storage;
pub use idxcoord_worker as worker;

pub use idxcoord_coord::{IndexCoord, IndexCoordConfig};
pub use idxcoord_core::{CoordError, ErrorCode, IndexState, Result, Status};
pub use idxcoord_worker::{IndexNode, IndexNodeConfig};
