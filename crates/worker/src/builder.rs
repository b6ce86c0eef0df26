//! Index building seam
//!
//! The index algorithm lives behind [`IndexBuilder`]. A build receives the raw
//! column data of one segment field and returns named blobs; the worker
//! uploads them and reports their names as the build's file keys.

use idxcoord_core::{BuildId, CoordError, KeyValuePair, Result};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Cooperative cancellation flag shared between a task and its build
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    /// Fresh, not cancelled
    pub fn new() -> Self {
        Self::default()
    }

    /// Request cancellation
    pub fn cancel(&self) {
        self.0.store(true, Ordering::Release);
    }

    /// Whether cancellation was requested
    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }

    /// `Err(Cancelled)` once cancellation was requested
    pub fn check(&self) -> Result<()> {
        if self.is_cancelled() {
            Err(CoordError::Cancelled)
        } else {
            Ok(())
        }
    }
}

/// Input of one build
#[derive(Debug, Clone)]
pub struct BuildInput {
    /// Build attempt
    pub build_id: BuildId,
    /// Field type params
    pub type_params: Vec<KeyValuePair>,
    /// Index params
    pub index_params: Vec<KeyValuePair>,
    /// Rows in the segment
    pub num_rows: i64,
    /// Raw column data, one entry per data path
    pub data: Vec<Vec<u8>>,
}

impl BuildInput {
    /// Value of an index or type param
    pub fn param(&self, key: &str) -> Option<&str> {
        self.index_params
            .iter()
            .chain(self.type_params.iter())
            .find(|kv| kv.key == key)
            .map(|kv| kv.value.as_str())
    }
}

/// One produced file
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IndexBlob {
    /// File key, relative to the build's directory
    pub key: String,
    /// Content
    pub data: Vec<u8>,
}

/// Index algorithm
pub trait IndexBuilder: Send + Sync {
    /// Build an index; implementations should poll `cancel` between phases
    fn build(&self, input: &BuildInput, cancel: &CancelToken) -> Result<Vec<IndexBlob>>;
}

/// Builder that stores the raw data unchanged alongside a params header.
///
/// Produces `index_params` (the effective params, one `key=value` per line)
/// and one `raw_{i}` blob per input. Rejects input without an `index_type`.
#[derive(Debug, Default, Clone, Copy)]
pub struct RawDataBuilder;

impl IndexBuilder for RawDataBuilder {
    fn build(&self, input: &BuildInput, cancel: &CancelToken) -> Result<Vec<IndexBlob>> {
        let index_type = input
            .param("index_type")
            .ok_or_else(|| CoordError::BuildFailed("index_type is not specified".into()))?;

        let mut header = format!("index_type={}\nnum_rows={}\n", index_type, input.num_rows);
        for kv in input.index_params.iter().filter(|kv| kv.key != "index_type") {
            header.push_str(&format!("{}={}\n", kv.key, kv.value));
        }
        let mut blobs = vec![IndexBlob {
            key: "index_params".to_string(),
            data: header.into_bytes(),
        }];
        for (i, data) in input.data.iter().enumerate() {
            cancel.check()?;
            blobs.push(IndexBlob {
                key: format!("raw_{}", i),
                data: data.clone(),
            });
        }
        Ok(blobs)
    }
}
