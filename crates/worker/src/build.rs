//! Execution of one accepted build job

use crate::builder::{BuildInput, CancelToken, IndexBuilder};
use crate::task::{TaskKey, TaskTable};
use idxcoord_core::paths::segment_index_file_path;
use idxcoord_core::{CoordError, CreateJobRequest, Result};
use idxcoord_storage::ObjectStore;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// A build job bound to its store, builder and task entry
pub struct BuildTask {
    key: TaskKey,
    req: CreateJobRequest,
    store: Arc<dyn ObjectStore>,
    builder: Arc<dyn IndexBuilder>,
    tasks: Arc<TaskTable>,
    cancel: CancelToken,
}

impl BuildTask {
    /// Bind a job to the resources it runs with
    pub fn new(
        req: CreateJobRequest,
        store: Arc<dyn ObjectStore>,
        builder: Arc<dyn IndexBuilder>,
        tasks: Arc<TaskTable>,
        cancel: CancelToken,
    ) -> Self {
        Self {
            key: TaskKey::new(req.cluster_id.clone(), req.build_id),
            req,
            store,
            builder,
            tasks,
            cancel,
        }
    }

    /// Run the build and record its outcome in the task table.
    ///
    /// Nothing is recorded for a task that was dropped or cancelled.
    pub fn run(self) {
        let build_id = self.req.build_id;
        if self.cancel.is_cancelled() || !self.tasks.mark_started(&self.key, self.req.num_rows) {
            debug!(target: "idxcoord::worker", build_id, "build dropped before start");
            return;
        }

        match self.execute() {
            Ok((file_keys, size)) => {
                let files = file_keys.len();
                if self.tasks.finish(&self.key, file_keys, size) && !self.cancel.is_cancelled() {
                    info!(target: "idxcoord::worker", build_id, files, size, "build finished");
                } else {
                    debug!(target: "idxcoord::worker", build_id, "build outcome discarded");
                }
            }
            Err(CoordError::Cancelled) => {
                debug!(target: "idxcoord::worker", build_id, "build cancelled");
            }
            Err(e) => {
                warn!(target: "idxcoord::worker", build_id, error = %e, "build failed");
                self.tasks.fail(&self.key, e.to_string());
            }
        }
    }

    fn execute(&self) -> Result<(Vec<String>, u64)> {
        let mut data = Vec::with_capacity(self.req.data_paths.len());
        for path in &self.req.data_paths {
            self.cancel.check()?;
            data.push(self.store.read(path)?);
        }

        let input = BuildInput {
            build_id: self.req.build_id,
            type_params: self.req.type_params.clone(),
            index_params: self.req.index_params.clone(),
            num_rows: self.req.num_rows,
            data,
        };
        let blobs = self.builder.build(&input, &self.cancel)?;

        let root = if self.req.index_file_prefix.is_empty() {
            self.store.root_path()
        } else {
            self.req.index_file_prefix.as_str()
        };
        let mut file_keys = Vec::with_capacity(blobs.len());
        let mut size = 0u64;
        for blob in blobs {
            self.cancel.check()?;
            let path = segment_index_file_path(
                root,
                self.req.build_id,
                self.req.index_version,
                self.req.partition_id,
                self.req.segment_id,
                &blob.key,
            );
            self.store.write(&path, &blob.data)?;
            size += blob.data.len() as u64;
            file_keys.push(blob.key);
        }
        Ok((file_keys, size))
    }
}
