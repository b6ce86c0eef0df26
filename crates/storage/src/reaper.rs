//! Background lease expiry
//!
//! `LeaseReaper` wakes on a fixed interval and drops expired leases (and the
//! keys bound to them) from a [`MetaKv`]. Expiry of a session lease is how
//! the coordinator learns a worker has gone away.

use crate::kv::MetaKv;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use tracing::debug;

/// Background lease expiry task
pub struct LeaseReaper {
    store: Arc<dyn MetaKv>,
    check_interval: Duration,
    shutdown: Arc<AtomicBool>,
}

impl LeaseReaper {
    /// Create a reaper for `store` that checks every `check_interval`
    pub fn new(store: Arc<dyn MetaKv>, check_interval: Duration) -> Self {
        Self {
            store,
            check_interval,
            shutdown: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Spawn the reaper thread; it runs until [`shutdown`](Self::shutdown)
    pub fn start(&self) -> JoinHandle<()> {
        let store = Arc::clone(&self.store);
        let shutdown = Arc::clone(&self.shutdown);
        let check_interval = self.check_interval;

        thread::spawn(move || {
            while !shutdown.load(Ordering::Relaxed) {
                let slice = Duration::from_millis(20).min(check_interval);
                let mut elapsed = Duration::ZERO;
                while elapsed < check_interval {
                    if shutdown.load(Ordering::Relaxed) {
                        return;
                    }
                    thread::sleep(slice);
                    elapsed += slice;
                }

                let removed = store.expire_leases(Instant::now());
                if removed > 0 {
                    debug!(target: "idxcoord::kv", removed, "reaped leased keys");
                }
            }
        })
    }

    /// Signal the thread to exit at its next wake-up
    pub fn shutdown(&self) {
        self.shutdown.store(true, Ordering::Relaxed);
    }

    /// Whether shutdown was signaled
    pub fn is_shutdown(&self) -> bool {
        self.shutdown.load(Ordering::Relaxed)
    }
}
