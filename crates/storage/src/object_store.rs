//! Blob storage for built index files
//!
//! Keys are `/`-separated paths relative to the store's root. Listing with
//! `recursive = false` returns the immediate children of a prefix, with
//! directories reported once and ending in `/`.

use idxcoord_core::{CoordError, Result};
use parking_lot::RwLock;
use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use tracing::debug;

/// Blob store used by workers to upload artifacts and by GC to remove them
pub trait ObjectStore: Send + Sync {
    /// Root path keys are laid out under
    fn root_path(&self) -> &str;

    /// Write (or overwrite) a blob
    fn write(&self, key: &str, data: &[u8]) -> Result<()>;

    /// Read a blob
    fn read(&self, key: &str) -> Result<Vec<u8>>;

    /// Whether a blob exists
    fn exists(&self, key: &str) -> Result<bool>;

    /// Keys under a prefix; see module docs for `recursive`
    fn list_with_prefix(&self, prefix: &str, recursive: bool) -> Result<Vec<String>>;

    /// Remove a blob; removing a missing blob is not an error
    fn remove(&self, key: &str) -> Result<()>;

    /// Remove every blob under a prefix
    fn remove_with_prefix(&self, prefix: &str) -> Result<()>;
}

/// Collapse a flat key list into the immediate children of `prefix`
fn immediate_children<'a>(prefix: &str, keys: impl Iterator<Item = &'a str>) -> Vec<String> {
    let mut out = BTreeSet::new();
    for key in keys {
        let Some(rest) = key.strip_prefix(prefix) else {
            continue;
        };
        match rest.find('/') {
            Some(pos) => out.insert(format!("{}{}", prefix, &rest[..=pos])),
            None => out.insert(key.to_string()),
        };
    }
    out.into_iter().collect()
}

/// In-memory object store
#[derive(Default)]
pub struct MemoryObjectStore {
    root: String,
    blobs: RwLock<BTreeMap<String, Vec<u8>>>,
}

impl MemoryObjectStore {
    /// Empty store rooted at `root`
    pub fn new(root: impl Into<String>) -> Self {
        Self {
            root: root.into(),
            blobs: RwLock::new(BTreeMap::new()),
        }
    }

    /// Number of blobs
    pub fn len(&self) -> usize {
        self.blobs.read().len()
    }

    /// Whether the store is empty
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl ObjectStore for MemoryObjectStore {
    fn root_path(&self) -> &str {
        &self.root
    }

    fn write(&self, key: &str, data: &[u8]) -> Result<()> {
        self.blobs.write().insert(key.to_string(), data.to_vec());
        Ok(())
    }

    fn read(&self, key: &str) -> Result<Vec<u8>> {
        self.blobs
            .read()
            .get(key)
            .cloned()
            .ok_or_else(|| CoordError::object_store(format!("no such key: {}", key)))
    }

    fn exists(&self, key: &str) -> Result<bool> {
        Ok(self.blobs.read().contains_key(key))
    }

    fn list_with_prefix(&self, prefix: &str, recursive: bool) -> Result<Vec<String>> {
        let blobs = self.blobs.read();
        let keys = blobs
            .range(prefix.to_string()..)
            .take_while(|(k, _)| k.starts_with(prefix))
            .map(|(k, _)| k.as_str());
        if recursive {
            Ok(keys.map(str::to_string).collect())
        } else {
            Ok(immediate_children(prefix, keys))
        }
    }

    fn remove(&self, key: &str) -> Result<()> {
        self.blobs.write().remove(key);
        Ok(())
    }

    fn remove_with_prefix(&self, prefix: &str) -> Result<()> {
        self.blobs.write().retain(|k, _| !k.starts_with(prefix));
        Ok(())
    }
}

/// Object store on the local filesystem; keys map to paths under a base dir
pub struct LocalObjectStore {
    base: PathBuf,
    root: String,
}

fn fs_err(path: &Path, e: std::io::Error) -> CoordError {
    CoordError::object_store(format!("{}: {}", path.display(), e))
}

impl LocalObjectStore {
    /// Store keys under `base`; `root` is the logical root path handed to callers
    pub fn new(base: impl Into<PathBuf>, root: impl Into<String>) -> Result<Self> {
        let base = base.into();
        fs::create_dir_all(&base).map_err(|e| fs_err(&base, e))?;
        Ok(Self {
            base,
            root: root.into(),
        })
    }

    fn path_of(&self, key: &str) -> Result<PathBuf> {
        let trimmed = key.trim_start_matches('/');
        if trimmed.split('/').any(|part| part == "..") {
            return Err(CoordError::invalid_input(format!("key escapes store: {}", key)));
        }
        Ok(self.base.join(trimmed))
    }

    fn walk(&self, dir: &Path, out: &mut Vec<String>) -> Result<()> {
        let entries = match fs::read_dir(dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(()),
            Err(e) => return Err(fs_err(dir, e)),
        };
        for entry in entries {
            let entry = entry.map_err(|e| fs_err(dir, e))?;
            let path = entry.path();
            if path.is_dir() {
                self.walk(&path, out)?;
            } else if let Ok(rel) = path.strip_prefix(&self.base) {
                let key: Vec<_> = rel
                    .components()
                    .map(|c| c.as_os_str().to_string_lossy())
                    .collect();
                let key = key.join("/");
                // in-flight writes are not visible
                if !key.ends_with(".tmp") {
                    out.push(key);
                }
            }
        }
        Ok(())
    }

    /// Every key, sorted
    fn all_keys(&self) -> Result<Vec<String>> {
        let mut keys = Vec::new();
        self.walk(&self.base, &mut keys)?;
        keys.sort();
        Ok(keys)
    }
}

impl ObjectStore for LocalObjectStore {
    fn root_path(&self) -> &str {
        &self.root
    }

    fn write(&self, key: &str, data: &[u8]) -> Result<()> {
        let path = self.path_of(key)?;
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(|e| fs_err(parent, e))?;
        }
        let tmp = path.with_file_name(format!(".{}.tmp", uuid::Uuid::new_v4()));
        fs::write(&tmp, data).map_err(|e| fs_err(&tmp, e))?;
        fs::rename(&tmp, &path).map_err(|e| fs_err(&path, e))?;
        debug!(target: "idxcoord::worker", key, bytes = data.len(), "object written");
        Ok(())
    }

    fn read(&self, key: &str) -> Result<Vec<u8>> {
        let path = self.path_of(key)?;
        fs::read(&path).map_err(|e| fs_err(&path, e))
    }

    fn exists(&self, key: &str) -> Result<bool> {
        Ok(self.path_of(key)?.is_file())
    }

    fn list_with_prefix(&self, prefix: &str, recursive: bool) -> Result<Vec<String>> {
        let prefix = prefix.trim_start_matches('/');
        let keys = self.all_keys()?;
        let matching = keys.iter().filter(|k| k.starts_with(prefix)).map(String::as_str);
        if recursive {
            Ok(matching.map(str::to_string).collect())
        } else {
            Ok(immediate_children(prefix, matching))
        }
    }

    fn remove(&self, key: &str) -> Result<()> {
        let path = self.path_of(key)?;
        match fs::remove_file(&path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(fs_err(&path, e)),
        }
    }

    fn remove_with_prefix(&self, prefix: &str) -> Result<()> {
        for key in self.list_with_prefix(prefix, true)? {
            self.remove(&key)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn exercise(store: &dyn ObjectStore) {
        store.write("files/index_files/1/1/10/100/a", b"aa").unwrap();
        store.write("files/index_files/1/1/10/100/b", b"bb").unwrap();
        store.write("files/index_files/2/1/10/101/a", b"cc").unwrap();

        assert_eq!(store.read("files/index_files/1/1/10/100/a").unwrap(), b"aa");
        assert!(store.exists("files/index_files/2/1/10/101/a").unwrap());
        assert!(!store.exists("files/index_files/3").unwrap());

        let top = store.list_with_prefix("files/index_files/", false).unwrap();
        assert_eq!(top, vec!["files/index_files/1/", "files/index_files/2/"]);

        let all = store.list_with_prefix("files/index_files/1/", true).unwrap();
        assert_eq!(all.len(), 2);

        store.remove_with_prefix("files/index_files/1/").unwrap();
        assert!(store.list_with_prefix("files/index_files/1/", true).unwrap().is_empty());
        store.remove("files/index_files/2/1/10/101/a").unwrap();
        store.remove("files/index_files/2/1/10/101/a").unwrap();
        assert!(store.read("files/index_files/2/1/10/101/a").is_err());
    }

    #[test]
    fn test_memory_store() {
        exercise(&MemoryObjectStore::new("files"));
    }

    #[test]
    fn test_local_store() {
        let dir = TempDir::new().unwrap();
        exercise(&LocalObjectStore::new(dir.path(), "files").unwrap());
    }

    #[test]
    fn test_local_store_rejects_escape() {
        let dir = TempDir::new().unwrap();
        let store = LocalObjectStore::new(dir.path(), "files").unwrap();
        assert!(store.write("../outside", b"x").is_err());
    }

    #[test]
    fn test_immediate_children_files_and_dirs() {
        let keys = ["p/a", "p/b/c", "p/b/d", "q/x"];
        let children = immediate_children("p/", keys.iter().copied());
        assert_eq!(children, vec!["p/a", "p/b/"]);
    }
}
