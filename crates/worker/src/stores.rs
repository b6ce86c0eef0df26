//! Object stores opened from a job's storage configuration

use idxcoord_core::{CoordError, Result, StorageConfig, StorageType};
use idxcoord_storage::{LocalObjectStore, MemoryObjectStore, ObjectStore};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

/// Opens the object store a job reads from and writes to
pub trait ObjectStoreFactory: Send + Sync {
    /// Store for a job's storage configuration
    fn open(&self, config: &StorageConfig) -> Result<Arc<dyn ObjectStore>>;
}

/// Factory for local-filesystem and in-memory stores.
///
/// Local stores live under `{local_base}/{bucket_name}`. Memory stores are
/// shared per (bucket, root) so every job of a process sees the same blobs.
pub struct StoreFactory {
    local_base: Option<PathBuf>,
    memory: Mutex<HashMap<(String, String), Arc<MemoryObjectStore>>>,
}

impl StoreFactory {
    /// Factory that can open local stores under `local_base`
    pub fn new(local_base: impl Into<PathBuf>) -> Self {
        Self {
            local_base: Some(local_base.into()),
            memory: Mutex::new(HashMap::new()),
        }
    }

    /// Factory that only serves in-memory stores
    pub fn memory_only() -> Self {
        Self {
            local_base: None,
            memory: Mutex::new(HashMap::new()),
        }
    }

    /// Serve `store` for memory configs with this bucket and root
    pub fn register_memory(&self, bucket_name: &str, store: Arc<MemoryObjectStore>) {
        let key = (bucket_name.to_string(), store.root_path().to_string());
        self.memory.lock().insert(key, store);
    }
}

impl ObjectStoreFactory for StoreFactory {
    fn open(&self, config: &StorageConfig) -> Result<Arc<dyn ObjectStore>> {
        if config.bucket_name.is_empty() {
            return Err(CoordError::object_store("bucket name is empty"));
        }
        match config.storage_type {
            StorageType::Memory => {
                let key = (config.bucket_name.clone(), config.root_path.clone());
                let store = self
                    .memory
                    .lock()
                    .entry(key)
                    .or_insert_with(|| Arc::new(MemoryObjectStore::new(config.root_path.clone())))
                    .clone();
                Ok(store)
            }
            StorageType::Local => {
                let base = self
                    .local_base
                    .as_ref()
                    .ok_or_else(|| CoordError::object_store("local storage is not configured"))?;
                let store = LocalObjectStore::new(
                    base.join(&config.bucket_name),
                    config.root_path.clone(),
                )?;
                Ok(Arc::new(store))
            }
        }
    }
}
