//! Globally unique id allocation
//!
//! Ids come from a counter persisted in the KV store. The allocator reserves
//! a batch at a time by advancing the persisted high-water mark before
//! handing any id of the batch out, so a restart never reissues an id.

use idxcoord_core::{retry, CoordError, Result, RetryConfig, UniqueId};
use idxcoord_storage::MetaKv;
use parking_lot::Mutex;
use std::sync::Arc;
use tracing::debug;

/// KV key of the persisted high-water mark
pub const ID_ALLOCATOR_KEY: &str = "idxcoord/id-allocator";

struct Range {
    next: UniqueId,
    end: UniqueId,
}

/// Batching id allocator backed by a [`MetaKv`]
pub struct IdAllocator {
    kv: Arc<dyn MetaKv>,
    batch: u64,
    retry: RetryConfig,
    range: Mutex<Range>,
}

impl IdAllocator {
    /// Allocator reserving `batch` ids per KV round trip; transient KV
    /// failures are retried per `retry`
    pub fn new(kv: Arc<dyn MetaKv>, batch: u64, retry: RetryConfig) -> Self {
        Self {
            kv,
            batch: batch.max(1),
            retry,
            range: Mutex::new(Range { next: 0, end: 0 }),
        }
    }

    /// One fresh id
    pub fn alloc_one(&self) -> Result<UniqueId> {
        let (start, _) = self.alloc(1)?;
        Ok(start)
    }

    /// `count` consecutive fresh ids as `[start, end)`
    pub fn alloc(&self, count: u64) -> Result<(UniqueId, UniqueId)> {
        if count == 0 {
            return Err(CoordError::invalid_input("cannot allocate zero ids"));
        }
        let count = count as i64;
        let mut range = self.range.lock();
        if range.end - range.next < count {
            let reserve = count.max(self.batch as i64);
            let (start, end) = retry(&self.retry, "reserve ids", || self.reserve(reserve))?;
            range.next = start;
            range.end = end;
        }
        let start = range.next;
        range.next += count;
        Ok((start, start + count))
    }

    fn reserve(&self, count: i64) -> Result<(UniqueId, UniqueId)> {
        let current = match self.kv.load(ID_ALLOCATOR_KEY)? {
            Some(raw) => std::str::from_utf8(&raw)
                .ok()
                .and_then(|s| s.parse::<i64>().ok())
                .ok_or_else(|| CoordError::storage("corrupt id allocator value"))?,
            // 0 is reserved
            None => 1,
        };
        let end = current + count;
        self.kv.save(ID_ALLOCATOR_KEY, end.to_string().into_bytes())?;
        debug!(target: "idxcoord::service", start = current, end, "reserved id range");
        Ok((current, end))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use idxcoord_storage::KvStore;
    use std::collections::HashSet;
    use tempfile::TempDir;

    #[test]
    fn test_ids_are_unique_and_nonzero() {
        let kv: Arc<dyn MetaKv> = Arc::new(KvStore::ephemeral());
        let alloc = IdAllocator::new(kv, 4, RetryConfig::no_retry());
        let mut seen = HashSet::new();
        for _ in 0..20 {
            let id = alloc.alloc_one().unwrap();
            assert!(id > 0);
            assert!(seen.insert(id));
        }
        let (start, end) = alloc.alloc(10).unwrap();
        assert_eq!(end - start, 10);
        assert!((start..end).all(|id| !seen.contains(&id)));
    }

    #[test]
    fn test_restart_never_reissues() {
        let dir = TempDir::new().unwrap();
        let first = {
            let kv: Arc<dyn MetaKv> =
                Arc::new(KvStore::open(dir.path(), Default::default()).unwrap());
            let alloc = IdAllocator::new(kv, 100, RetryConfig::no_retry());
            alloc.alloc_one().unwrap()
        };
        let kv: Arc<dyn MetaKv> = Arc::new(KvStore::open(dir.path(), Default::default()).unwrap());
        let alloc = IdAllocator::new(kv, 100, RetryConfig::no_retry());
        assert!(alloc.alloc_one().unwrap() >= first + 100);
    }

    #[test]
    fn test_zero_count_rejected() {
        let alloc = IdAllocator::new(Arc::new(KvStore::ephemeral()), 4, RetryConfig::no_retry());
        assert!(alloc.alloc(0).is_err());
    }
}
