//! Retry configuration and bounded retry helper
//!
//! Used in two places with different budgets: the synchronous hot path
//! (ID allocation, a handful of fast attempts) and dead-node re-dispatch
//! (attempt cap and backoff between reissues of the same segment/index).

use crate::error::Result;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::debug;

// ============================================================================
// Retry Configuration
// ============================================================================

/// Configuration for retry behavior
///
/// # Example
/// ```ignore
/// let config = RetryConfig::default().with_max_retries(5).with_base_delay_ms(20);
/// let id = retry(&config, "alloc id", || allocator.alloc_one())?;
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryConfig {
    /// Maximum number of retry attempts (0 = no retries)
    pub max_retries: usize,
    /// Base delay between retries in milliseconds (exponential backoff)
    pub base_delay_ms: u64,
    /// Maximum delay between retries in milliseconds
    pub max_delay_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay_ms: 10,
            max_delay_ms: 100,
        }
    }
}

impl RetryConfig {
    /// Create a new RetryConfig with default values
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a RetryConfig with no retries
    pub fn no_retry() -> Self {
        Self {
            max_retries: 0,
            ..Default::default()
        }
    }

    /// Set maximum number of retries
    pub fn with_max_retries(mut self, max_retries: usize) -> Self {
        self.max_retries = max_retries;
        self
    }

    /// Set base delay for exponential backoff
    pub fn with_base_delay_ms(mut self, base_delay_ms: u64) -> Self {
        self.base_delay_ms = base_delay_ms;
        self
    }

    /// Set maximum delay between retries
    pub fn with_max_delay_ms(mut self, max_delay_ms: u64) -> Self {
        self.max_delay_ms = max_delay_ms;
        self
    }

    /// Calculate delay for a given attempt (exponential backoff)
    pub fn calculate_delay(&self, attempt: usize) -> Duration {
        // Cap the shift to prevent overflow (1 << 63 is the max for u64)
        let shift = attempt.min(63);
        let multiplier = 1u64 << shift;
        let delay_ms = self.base_delay_ms.saturating_mul(multiplier);
        Duration::from_millis(delay_ms.min(self.max_delay_ms))
    }
}

/// Run `op` until it succeeds, a non-transient error occurs, or the retry
/// budget is exhausted. Returns the last error.
pub fn retry<T, F>(config: &RetryConfig, what: &str, mut op: F) -> Result<T>
where
    F: FnMut() -> Result<T>,
{
    let mut attempt = 0;
    loop {
        match op() {
            Ok(value) => return Ok(value),
            Err(e) if e.is_transient() && attempt < config.max_retries => {
                let delay = config.calculate_delay(attempt);
                debug!(target: "idxcoord::retry", what, attempt, error = %e, ?delay, "retrying");
                std::thread::sleep(delay);
                attempt += 1;
            }
            Err(e) => return Err(e),
        }
    }
}
