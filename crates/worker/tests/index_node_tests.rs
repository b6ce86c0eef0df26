//! Index node behaviour under duplicates, cancellation and back-pressure

use idxcoord_core::{
    CreateJobRequest, DropJobsRequest, ErrorCode, IndexState, KeyValuePair, QueryJobsRequest,
    Result, StorageConfig,
};
use idxcoord_storage::{MemoryObjectStore, ObjectStore};
use idxcoord_worker::{
    BuildInput, CancelToken, IndexBlob, IndexBuilder, IndexNode, IndexNodeConfig, StoreFactory,
};
use parking_lot::{Condvar, Mutex};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Builder that blocks until the gate opens or the build is cancelled
#[derive(Default)]
struct GatedBuilder {
    open: Mutex<bool>,
    cond: Condvar,
    started: AtomicUsize,
}

impl GatedBuilder {
    fn release(&self) {
        *self.open.lock() = true;
        self.cond.notify_all();
    }

    fn wait_started(&self, n: usize) {
        for _ in 0..400 {
            if self.started.load(Ordering::SeqCst) >= n {
                return;
            }
            std::thread::sleep(Duration::from_millis(5));
        }
        panic!("builds never started");
    }
}

impl IndexBuilder for GatedBuilder {
    fn build(&self, input: &BuildInput, cancel: &CancelToken) -> Result<Vec<IndexBlob>> {
        self.started.fetch_add(1, Ordering::SeqCst);
        let mut open = self.open.lock();
        while !*open {
            cancel.check()?;
            self.cond.wait_for(&mut open, Duration::from_millis(5));
        }
        Ok(vec![IndexBlob {
            key: format!("blob_{}", input.build_id),
            data: vec![1, 2, 3],
        }])
    }
}

fn setup(
    parallelism: usize,
    max_queue_len: usize,
) -> (IndexNode, Arc<GatedBuilder>, Arc<MemoryObjectStore>) {
    let store = Arc::new(MemoryObjectStore::new("files"));
    store.write("files/data/0", b"rows").unwrap();
    let factory = StoreFactory::memory_only();
    factory.register_memory("memory", Arc::clone(&store));
    let builder = Arc::new(GatedBuilder::default());
    let config = IndexNodeConfig {
        build_parallelism: parallelism,
        max_queue_len,
        ..IndexNodeConfig::default()
    };
    let node = IndexNode::new(config, builder.clone(), Arc::new(factory)).unwrap();
    node.start();
    (node, builder, store)
}

fn job(build_id: i64) -> CreateJobRequest {
    CreateJobRequest {
        cluster_id: "by-dev".into(),
        build_id,
        index_id: 100,
        index_name: "vec_idx".into(),
        index_file_prefix: String::new(),
        index_version: 1,
        data_paths: vec!["files/data/0".into()],
        type_params: vec![KeyValuePair::new("dim", "8")],
        index_params: vec![KeyValuePair::new("index_type", "IVF_FLAT")],
        num_rows: 2048,
        storage_config: StorageConfig::memory("files"),
        collection_id: 1,
        partition_id: 2,
        segment_id: 1000,
        field_id: 101,
    }
}

fn state_of(node: &IndexNode, build_id: i64) -> IndexState {
    node.query_jobs(&QueryJobsRequest {
        cluster_id: "by-dev".into(),
        build_ids: vec![build_id],
    })
    .index_infos[0]
        .state
}

fn wait_state(node: &IndexNode, build_id: i64, state: IndexState) {
    for _ in 0..400 {
        if state_of(node, build_id) == state {
            return;
        }
        std::thread::sleep(Duration::from_millis(5));
    }
    panic!("build {} never reached {:?}", build_id, state);
}

#[test]
fn duplicate_create_job_is_refused_and_first_keeps_running() {
    let (node, builder, store) = setup(1, 16);

    assert!(node.create_job(job(10)).is_success());
    builder.wait_started(1);

    let second = node.create_job(job(10));
    assert_eq!(second.code, ErrorCode::BuildIndexError);
    assert_eq!(second.reason, "duplicated index build task");
    assert_eq!(state_of(&node, 10), IndexState::InProgress);

    builder.release();
    wait_state(&node, 10, IndexState::Finished);
    assert_eq!(builder.started.load(Ordering::SeqCst), 1);
    assert!(store.exists("files/index_files/10/1/2/1000/blob_10").unwrap());
}

#[test]
fn same_build_id_in_another_cluster_is_independent() {
    let (node, builder, _) = setup(2, 16);
    assert!(node.create_job(job(10)).is_success());
    let mut other = job(10);
    other.cluster_id = "other".into();
    assert!(node.create_job(other).is_success());
    builder.release();
    wait_state(&node, 10, IndexState::Finished);
}

#[test]
fn drop_jobs_cancels_running_build() {
    let (node, builder, store) = setup(1, 16);
    assert!(node.create_job(job(20)).is_success());
    builder.wait_started(1);

    let status = node.drop_jobs(&DropJobsRequest {
        cluster_id: "by-dev".into(),
        build_ids: vec![20],
    });
    assert!(status.is_success());
    assert_eq!(state_of(&node, 20), IndexState::None);

    // the freed slot picks up the next job once the cancelled build unwinds
    builder.release();
    assert!(node.create_job(job(21)).is_success());
    wait_state(&node, 21, IndexState::Finished);
    assert_eq!(state_of(&node, 20), IndexState::None);
    assert!(!store.exists("files/index_files/20/1/2/1000/blob_20").unwrap());
}

#[test]
fn dropping_unknown_builds_is_a_no_op() {
    let (node, _, _) = setup(1, 16);
    let status = node.drop_jobs(&DropJobsRequest {
        cluster_id: "by-dev".into(),
        build_ids: vec![1, 2, 3],
    });
    assert!(status.is_success());
}

#[test]
fn full_queue_rejects_and_forgets_the_job() {
    let (node, builder, _) = setup(1, 1);
    assert!(node.create_job(job(1)).is_success());
    builder.wait_started(1);
    assert!(node.create_job(job(2)).is_success());

    let rejected = node.create_job(job(3));
    assert!(!rejected.is_success());
    assert_eq!(state_of(&node, 3), IndexState::None);

    let stats = node.get_job_stats();
    assert_eq!(stats.in_progress_job_num, 1);
    assert_eq!(stats.enqueue_job_num, 1);
    assert_eq!(stats.task_slots, 0);

    builder.release();
    wait_state(&node, 2, IndexState::Finished);
}

#[test]
fn stop_finishes_queued_builds() {
    let (node, builder, store) = setup(1, 16);
    assert!(node.create_job(job(1)).is_success());
    assert!(node.create_job(job(2)).is_success());
    builder.release();
    node.stop();
    assert_eq!(node.create_job(job(3)).code, ErrorCode::NotReady);
    assert!(store.exists("files/index_files/2/1/2/1000/blob_2").unwrap());
}
