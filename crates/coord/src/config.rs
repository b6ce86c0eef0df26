//! Coordinator configuration via `indexcoord.toml`
//!
//! The file is the base layer. [`IndexCoordConfig::from_manager`] reads the
//! same keys through a [`ConfigManager`] under the `indexcoord.` prefix so
//! deployments can override individual values from higher-priority sources.

use idxcoord_core::{ConfigManager, CoordError, Result, RetryConfig, StorageConfig};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

/// Config file name
pub const CONFIG_FILE_NAME: &str = "indexcoord.toml";

/// Key prefix used when reading through a [`ConfigManager`]
pub const CONFIG_PREFIX: &str = "indexcoord";

/// Coordinator configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexCoordConfig {
    /// Cluster id stamped on every job
    #[serde(default = "default_cluster_id")]
    pub cluster_id: String,
    /// Coordinator id reported in metrics
    #[serde(default = "default_coordinator_id")]
    pub coordinator_id: i64,
    /// Period of the assign loop
    #[serde(default = "default_dispatch_interval_ms")]
    pub dispatch_interval_ms: u64,
    /// Period of the status poll loop
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    /// Period of the worker health probe
    #[serde(default = "default_health_check_interval_ms")]
    pub health_check_interval_ms: u64,
    /// A worker unhealthy for this long is treated as gone
    #[serde(default = "default_health_window_ms")]
    pub health_window_ms: u64,
    /// A worker not heard from for this long is treated as gone
    #[serde(default = "default_node_ttl_ms")]
    pub node_ttl_ms: u64,
    /// Period of session lease expiry
    #[serde(default = "default_lease_check_interval_ms")]
    pub lease_check_interval_ms: u64,
    /// Candidate nodes tried per row per assign round
    #[serde(default = "default_max_placement_attempts")]
    pub max_placement_attempts: usize,
    /// Period of the metadata reconciliation loop
    #[serde(default = "default_gc_meta_interval_ms")]
    pub gc_meta_interval_ms: u64,
    /// Period of the file reconciliation loop
    #[serde(default = "default_gc_file_interval_ms")]
    pub gc_file_interval_ms: u64,
    /// Segments with fewer rows are recorded finished without a build
    #[serde(default)]
    pub min_segment_num_rows_to_index: i64,
    /// Ids reserved per allocator round trip
    #[serde(default = "default_id_alloc_batch")]
    pub id_alloc_batch: u64,
    /// Object store the workers read from and write to
    #[serde(default = "default_storage")]
    pub storage: StorageConfig,
    /// Bound and backoff for re-dispatching lost builds
    #[serde(default = "default_redispatch")]
    pub redispatch: RetryConfig,
    /// Retry budget for ID allocation on the request path
    #[serde(default)]
    pub alloc_retry: RetryConfig,
}

fn default_cluster_id() -> String {
    "by-dev".to_string()
}

fn default_coordinator_id() -> i64 {
    1
}

fn default_dispatch_interval_ms() -> u64 {
    200
}

fn default_poll_interval_ms() -> u64 {
    500
}

fn default_health_check_interval_ms() -> u64 {
    1_000
}

fn default_health_window_ms() -> u64 {
    10_000
}

fn default_node_ttl_ms() -> u64 {
    30_000
}

fn default_lease_check_interval_ms() -> u64 {
    1_000
}

fn default_max_placement_attempts() -> usize {
    3
}

fn default_gc_meta_interval_ms() -> u64 {
    60_000
}

fn default_gc_file_interval_ms() -> u64 {
    600_000
}

fn default_id_alloc_batch() -> u64 {
    1_000
}

fn default_storage() -> StorageConfig {
    StorageConfig::local("files")
}

fn default_redispatch() -> RetryConfig {
    RetryConfig {
        max_retries: 3,
        base_delay_ms: 1_000,
        max_delay_ms: 30_000,
    }
}

impl Default for IndexCoordConfig {
    fn default() -> Self {
        Self {
            cluster_id: default_cluster_id(),
            coordinator_id: default_coordinator_id(),
            dispatch_interval_ms: default_dispatch_interval_ms(),
            poll_interval_ms: default_poll_interval_ms(),
            health_check_interval_ms: default_health_check_interval_ms(),
            health_window_ms: default_health_window_ms(),
            node_ttl_ms: default_node_ttl_ms(),
            lease_check_interval_ms: default_lease_check_interval_ms(),
            max_placement_attempts: default_max_placement_attempts(),
            gc_meta_interval_ms: default_gc_meta_interval_ms(),
            gc_file_interval_ms: default_gc_file_interval_ms(),
            min_segment_num_rows_to_index: 0,
            id_alloc_batch: default_id_alloc_batch(),
            storage: default_storage(),
            redispatch: default_redispatch(),
            alloc_retry: RetryConfig::default(),
        }
    }
}

impl IndexCoordConfig {
    /// Reject values the coordinator cannot run with
    pub fn validate(&self) -> Result<()> {
        if self.cluster_id.is_empty() {
            return Err(CoordError::Config("cluster_id must not be empty".into()));
        }
        let intervals = [
            ("dispatch_interval_ms", self.dispatch_interval_ms),
            ("poll_interval_ms", self.poll_interval_ms),
            ("health_check_interval_ms", self.health_check_interval_ms),
            ("lease_check_interval_ms", self.lease_check_interval_ms),
            ("gc_meta_interval_ms", self.gc_meta_interval_ms),
            ("gc_file_interval_ms", self.gc_file_interval_ms),
        ];
        for (name, value) in intervals {
            if value == 0 {
                return Err(CoordError::Config(format!("{} must be positive", name)));
            }
        }
        if self.max_placement_attempts == 0 {
            return Err(CoordError::Config("max_placement_attempts must be at least 1".into()));
        }
        if self.id_alloc_batch == 0 {
            return Err(CoordError::Config("id_alloc_batch must be at least 1".into()));
        }
        if self.min_segment_num_rows_to_index < 0 {
            return Err(CoordError::Config(
                "min_segment_num_rows_to_index must not be negative".into(),
            ));
        }
        if self.storage.bucket_name.is_empty() {
            return Err(CoordError::Config("storage.bucket_name must not be empty".into()));
        }
        Ok(())
    }

    /// Assign loop period
    pub fn dispatch_interval(&self) -> Duration {
        Duration::from_millis(self.dispatch_interval_ms)
    }

    /// Poll loop period
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    /// Health probe period
    pub fn health_check_interval(&self) -> Duration {
        Duration::from_millis(self.health_check_interval_ms)
    }

    /// Unhealthy window before a node is gone
    pub fn health_window(&self) -> Duration {
        Duration::from_millis(self.health_window_ms)
    }

    /// Silence window before a node is gone
    pub fn node_ttl(&self) -> Duration {
        Duration::from_millis(self.node_ttl_ms)
    }

    /// Session lease expiry period
    pub fn lease_check_interval(&self) -> Duration {
        Duration::from_millis(self.lease_check_interval_ms)
    }

    /// Metadata GC period
    pub fn gc_meta_interval(&self) -> Duration {
        Duration::from_millis(self.gc_meta_interval_ms)
    }

    /// File GC period
    pub fn gc_file_interval(&self) -> Duration {
        Duration::from_millis(self.gc_file_interval_ms)
    }

    /// Default config file content with comments
    pub fn default_toml() -> &'static str {
        r#"# idxcoord coordinator configuration

cluster_id = "by-dev"
coordinator_id = 1

# Loop periods in milliseconds.
dispatch_interval_ms = 200
poll_interval_ms = 500
health_check_interval_ms = 1000
gc_meta_interval_ms = 60000
gc_file_interval_ms = 600000

# Worker liveness. A node unhealthy for health_window_ms, or silent for
# node_ttl_ms, is retired and its builds are re-dispatched.
health_window_ms = 10000
node_ttl_ms = 30000

# Expiry of worker session leases.
lease_check_interval_ms = 1000

# Candidate nodes tried per build per assign round.
max_placement_attempts = 3

# Segments with fewer rows are recorded finished without building. 0 disables.
min_segment_num_rows_to_index = 0

id_alloc_batch = 1000

[storage]
storage_type = "Local"
bucket_name = "local"
root_path = "files"

# Re-dispatch of builds lost with their worker.
[redispatch]
max_retries = 3
base_delay_ms = 1000
max_delay_ms = 30000

[alloc_retry]
max_retries = 3
base_delay_ms = 10
max_delay_ms = 100
"#
    }

    /// Read, parse and validate a config file
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            CoordError::Config(format!("failed to read config file '{}': {}", path.display(), e))
        })?;
        let config: IndexCoordConfig = toml::from_str(&content).map_err(|e| {
            CoordError::Config(format!("failed to parse config file '{}': {}", path.display(), e))
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Write the default config file if it does not exist yet
    pub fn write_default_if_missing(path: &Path) -> Result<()> {
        if !path.exists() {
            std::fs::write(path, Self::default_toml()).map_err(|e| {
                CoordError::Config(format!(
                    "failed to write default config file '{}': {}",
                    path.display(),
                    e
                ))
            })?;
        }
        Ok(())
    }

    /// Defaults overridden by every `indexcoord.*` key the manager resolves
    pub fn from_manager(manager: &ConfigManager) -> Result<Self> {
        let mut config = Self::default();
        override_with(manager, "cluster_id", &mut config.cluster_id)?;
        override_with(manager, "coordinator_id", &mut config.coordinator_id)?;
        override_with(manager, "dispatch_interval_ms", &mut config.dispatch_interval_ms)?;
        override_with(manager, "poll_interval_ms", &mut config.poll_interval_ms)?;
        override_with(manager, "health_check_interval_ms", &mut config.health_check_interval_ms)?;
        override_with(manager, "health_window_ms", &mut config.health_window_ms)?;
        override_with(manager, "node_ttl_ms", &mut config.node_ttl_ms)?;
        override_with(manager, "lease_check_interval_ms", &mut config.lease_check_interval_ms)?;
        override_with(manager, "max_placement_attempts", &mut config.max_placement_attempts)?;
        override_with(manager, "gc_meta_interval_ms", &mut config.gc_meta_interval_ms)?;
        override_with(manager, "gc_file_interval_ms", &mut config.gc_file_interval_ms)?;
        override_with(
            manager,
            "min_segment_num_rows_to_index",
            &mut config.min_segment_num_rows_to_index,
        )?;
        override_with(manager, "id_alloc_batch", &mut config.id_alloc_batch)?;
        override_with(manager, "storage.bucket_name", &mut config.storage.bucket_name)?;
        override_with(manager, "storage.root_path", &mut config.storage.root_path)?;
        override_with(manager, "redispatch.max_retries", &mut config.redispatch.max_retries)?;
        override_with(manager, "redispatch.base_delay_ms", &mut config.redispatch.base_delay_ms)?;
        override_with(manager, "redispatch.max_delay_ms", &mut config.redispatch.max_delay_ms)?;
        config.validate()?;
        Ok(config)
    }
}

fn override_with<T: FromStr>(manager: &ConfigManager, key: &str, slot: &mut T) -> Result<()> {
    if let Some(value) = manager.get_parsed::<T>(&format!("{}.{}", CONFIG_PREFIX, key))? {
        *slot = value;
    }
    Ok(())
}
