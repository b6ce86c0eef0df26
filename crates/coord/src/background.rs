//! Periodic background loops
//!
//! Every coordinator loop is a thread that wakes on a fixed interval and runs
//! one pass. Sleeps are sliced so shutdown is noticed within a few
//! milliseconds regardless of the interval.

use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;
use tracing::{debug, error};

const SLEEP_SLICE: Duration = Duration::from_millis(20);

/// A set of periodic loops sharing one shutdown flag
#[derive(Default)]
pub struct LoopGroup {
    shutdown: Arc<AtomicBool>,
    handles: Mutex<Vec<JoinHandle<()>>>,
}

impl LoopGroup {
    /// Empty group
    pub fn new() -> Self {
        Self::default()
    }

    /// Run `pass` every `interval` on a thread named `name` until
    /// [`stop`](Self::stop). A panicking pass is logged and the loop goes on.
    pub fn spawn<F>(&self, name: &str, interval: Duration, mut pass: F) -> std::io::Result<()>
    where
        F: FnMut() + Send + 'static,
    {
        let shutdown = Arc::clone(&self.shutdown);
        let loop_name = name.to_string();
        let handle = thread::Builder::new().name(name.to_string()).spawn(move || {
            debug!(target: "idxcoord::service", name = %loop_name, ?interval, "loop started");
            while !shutdown.load(Ordering::Relaxed) {
                let slice = SLEEP_SLICE.min(interval);
                let mut elapsed = Duration::ZERO;
                while elapsed < interval {
                    if shutdown.load(Ordering::Relaxed) {
                        debug!(target: "idxcoord::service", name = %loop_name, "loop stopped");
                        return;
                    }
                    thread::sleep(slice);
                    elapsed += slice;
                }
                if let Err(e) = std::panic::catch_unwind(std::panic::AssertUnwindSafe(&mut pass)) {
                    error!(
                        target: "idxcoord::service",
                        name = %loop_name,
                        "loop pass panicked: {}",
                        e.downcast_ref::<&str>().copied().unwrap_or("(non-string panic)")
                    );
                }
            }
        })?;
        self.handles.lock().push(handle);
        Ok(())
    }

    /// Signal every loop and wait for them to exit
    pub fn stop(&self) {
        self.shutdown.store(true, Ordering::Relaxed);
        let handles: Vec<JoinHandle<()>> = self.handles.lock().drain(..).collect();
        for handle in handles {
            let _ = handle.join();
        }
    }

    /// Whether stop was signaled
    pub fn is_stopped(&self) -> bool {
        self.shutdown.load(Ordering::Relaxed)
    }

    /// Running loops
    pub fn len(&self) -> usize {
        self.handles.lock().len()
    }

    /// Whether no loop is running
    pub fn is_empty(&self) -> bool {
        self.handles.lock().is_empty()
    }
}

impl Drop for LoopGroup {
    fn drop(&mut self) {
        self.stop();
    }
}
