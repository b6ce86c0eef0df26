//! Index node for index-build coordination
//!
//! - [`IndexNode`]: CreateJob / QueryJobs / DropJobs / GetJobStats
//! - [`JobScheduler`]: bounded intake queue over a fixed executor pool
//! - [`TaskTable`]: volatile per-(cluster, build) task state
//! - [`IndexBuilder`]: the index algorithm seam
//! - [`StoreFactory`]: object stores opened from a job's storage config

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod build;
pub mod builder;
pub mod config;
pub mod node;
pub mod scheduler;
pub mod stores;
pub mod task;

pub use build::BuildTask;
pub use builder::{BuildInput, CancelToken, IndexBlob, IndexBuilder, RawDataBuilder};
pub use config::{IndexNodeConfig, CONFIG_FILE_NAME};
pub use node::IndexNode;
pub use scheduler::{JobScheduler, SchedulerStats};
pub use stores::{ObjectStoreFactory, StoreFactory};
pub use task::{TaskInfo, TaskKey, TaskTable};
