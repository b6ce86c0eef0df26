//! Worker configuration via `indexnode.toml`

use idxcoord_core::{CoordError, NodeId, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Config file name
pub const CONFIG_FILE_NAME: &str = "indexnode.toml";

/// Worker configuration loaded from `indexnode.toml`.
///
/// ```toml
/// node_id = 1
/// address = "127.0.0.1:21121"
/// build_parallelism = 1
/// max_queue_len = 1024
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexNodeConfig {
    /// Worker id, must be non-zero
    pub node_id: NodeId,
    /// Address advertised in the session
    #[serde(default = "default_address")]
    pub address: String,
    /// Concurrent builds
    #[serde(default = "default_build_parallelism")]
    pub build_parallelism: usize,
    /// Jobs that may wait for a build slot
    #[serde(default = "default_max_queue_len")]
    pub max_queue_len: usize,
    /// Session lease ttl in milliseconds
    #[serde(default = "default_session_ttl_ms")]
    pub session_ttl_ms: u64,
    /// Session renewal period in milliseconds, below the ttl
    #[serde(default = "default_keep_alive_interval_ms")]
    pub keep_alive_interval_ms: u64,
    /// Directory local object stores are opened under
    #[serde(default = "default_local_storage_dir")]
    pub local_storage_dir: String,
}

fn default_address() -> String {
    "127.0.0.1:21121".to_string()
}

fn default_build_parallelism() -> usize {
    1
}

fn default_max_queue_len() -> usize {
    1024
}

fn default_session_ttl_ms() -> u64 {
    10_000
}

fn default_keep_alive_interval_ms() -> u64 {
    3_000
}

fn default_local_storage_dir() -> String {
    "data/objects".to_string()
}

impl Default for IndexNodeConfig {
    fn default() -> Self {
        Self {
            node_id: 1,
            address: default_address(),
            build_parallelism: default_build_parallelism(),
            max_queue_len: default_max_queue_len(),
            session_ttl_ms: default_session_ttl_ms(),
            keep_alive_interval_ms: default_keep_alive_interval_ms(),
            local_storage_dir: default_local_storage_dir(),
        }
    }
}

impl IndexNodeConfig {
    /// Reject values the node cannot run with
    pub fn validate(&self) -> Result<()> {
        if self.node_id == 0 {
            return Err(CoordError::Config("node_id must be non-zero".into()));
        }
        if self.build_parallelism == 0 {
            return Err(CoordError::Config("build_parallelism must be at least 1".into()));
        }
        if self.keep_alive_interval_ms == 0 || self.keep_alive_interval_ms >= self.session_ttl_ms {
            return Err(CoordError::Config(format!(
                "keep_alive_interval_ms ({}) must be positive and below session_ttl_ms ({})",
                self.keep_alive_interval_ms, self.session_ttl_ms
            )));
        }
        Ok(())
    }

    /// Session lease ttl
    pub fn session_ttl(&self) -> Duration {
        Duration::from_millis(self.session_ttl_ms)
    }

    /// Session renewal period
    pub fn keep_alive_interval(&self) -> Duration {
        Duration::from_millis(self.keep_alive_interval_ms)
    }

    /// Default config file content with comments
    pub fn default_toml() -> &'static str {
        r#"# idxcoord index node configuration

# Worker id advertised to the coordinator; must be unique and non-zero.
node_id = 1
address = "127.0.0.1:21121"

# Concurrent builds. Jobs beyond this wait in the intake queue.
build_parallelism = 1

# Jobs that may wait for a build slot before CreateJob is rejected.
max_queue_len = 1024

# Liveness lease. The coordinator retires the node if it is not renewed.
session_ttl_ms = 10000
keep_alive_interval_ms = 3000

# Directory local object stores are opened under.
local_storage_dir = "data/objects"
"#
    }

    /// Read, parse and validate a config file
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            CoordError::Config(format!("failed to read config file '{}': {}", path.display(), e))
        })?;
        let config: IndexNodeConfig = toml::from_str(&content).map_err(|e| {
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
}
