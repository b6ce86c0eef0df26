//! Worker-local task table
//!
//! Tracks every accepted build keyed by (cluster id, build id). Entries are
//! never persisted; a restarted worker starts empty and the coordinator
//! re-issues whatever it lost.

use crate::builder::CancelToken;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use idxcoord_core::{BuildId, IndexState, JobInfo, TaskStatistic, Timestamp};
use std::collections::HashMap;

/// Task identity
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TaskKey {
    /// Coordinator cluster
    pub cluster_id: String,
    /// Build attempt
    pub build_id: BuildId,
}

impl TaskKey {
    /// Key for a (cluster, build) pair
    pub fn new(cluster_id: impl Into<String>, build_id: BuildId) -> Self {
        Self {
            cluster_id: cluster_id.into(),
            build_id,
        }
    }
}

/// State of one accepted build
#[derive(Debug, Clone)]
pub struct TaskInfo {
    /// Build state
    pub state: IndexState,
    /// Produced file keys, valid when `Finished`
    pub file_keys: Vec<String>,
    /// Total uploaded bytes
    pub serialized_size: u64,
    /// Failure reason when `Failed`
    pub fail_reason: String,
    /// Cancels the running build
    pub cancel: CancelToken,
    /// Execution statistics, set once the build starts
    pub statistic: Option<TaskStatistic>,
}

impl TaskInfo {
    /// Freshly accepted task
    pub fn in_progress(cancel: CancelToken) -> Self {
        Self {
            state: IndexState::InProgress,
            file_keys: Vec::new(),
            serialized_size: 0,
            fail_reason: String::new(),
            cancel,
            statistic: None,
        }
    }

    fn job_info(&self, build_id: BuildId) -> JobInfo {
        JobInfo {
            build_id,
            state: self.state,
            index_file_keys: self.file_keys.clone(),
            serialized_size: self.serialized_size,
            fail_reason: self.fail_reason.clone(),
        }
    }
}

/// Concurrent map of tracked tasks
#[derive(Default)]
pub struct TaskTable {
    tasks: DashMap<TaskKey, TaskInfo>,
}

impl TaskTable {
    /// Empty table
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert `info` unless the key is tracked; returns whether it was inserted
    pub fn insert_if_absent(&self, key: TaskKey, info: TaskInfo) -> bool {
        match self.tasks.entry(key) {
            Entry::Occupied(_) => false,
            Entry::Vacant(slot) => {
                slot.insert(info);
                true
            }
        }
    }

    /// Mutate a tracked task; returns false if it is gone
    pub fn update<F>(&self, key: &TaskKey, f: F) -> bool
    where
        F: FnOnce(&mut TaskInfo),
    {
        match self.tasks.get_mut(key) {
            Some(mut info) => {
                f(&mut info);
                true
            }
            None => false,
        }
    }

    /// Record that the build started executing
    pub fn mark_started(&self, key: &TaskKey, num_rows: i64) -> bool {
        self.update(key, |info| {
            info.statistic = Some(TaskStatistic {
                build_id: key.build_id,
                num_rows,
                start_time: Timestamp::now(),
                end_time: None,
            });
        })
    }

    /// Record a successful build, unless the task was dropped or cancelled
    pub fn finish(&self, key: &TaskKey, file_keys: Vec<String>, serialized_size: u64) -> bool {
        self.update(key, |info| {
            if info.cancel.is_cancelled() {
                return;
            }
            info.state = IndexState::Finished;
            info.file_keys = file_keys;
            info.serialized_size = serialized_size;
            if let Some(stat) = info.statistic.as_mut() {
                stat.end_time = Some(Timestamp::now());
            }
        })
    }

    /// Record a failed build, unless the task was dropped or cancelled
    pub fn fail(&self, key: &TaskKey, reason: impl Into<String>) -> bool {
        let reason = reason.into();
        self.update(key, |info| {
            if info.cancel.is_cancelled() {
                return;
            }
            info.state = IndexState::Failed;
            info.fail_reason = reason;
            if let Some(stat) = info.statistic.as_mut() {
                stat.end_time = Some(Timestamp::now());
            }
        })
    }

    /// Current state of a task
    pub fn state(&self, key: &TaskKey) -> Option<IndexState> {
        self.tasks.get(key).map(|info| info.state)
    }

    /// Whether a task is tracked
    pub fn contains(&self, key: &TaskKey) -> bool {
        self.tasks.contains_key(key)
    }

    /// Remove tasks, returning what was removed
    pub fn remove_many(&self, keys: &[TaskKey]) -> Vec<TaskInfo> {
        keys.iter()
            .filter_map(|key| self.tasks.remove(key).map(|(_, info)| info))
            .collect()
    }

    /// Point-in-time report for `build_ids` of one cluster, in request order.
    /// Untracked builds report `None`.
    pub fn query(&self, cluster_id: &str, build_ids: &[BuildId]) -> Vec<JobInfo> {
        let snapshot: HashMap<BuildId, JobInfo> = self
            .tasks
            .iter()
            .filter(|entry| entry.key().cluster_id == cluster_id)
            .map(|entry| (entry.key().build_id, entry.value().job_info(entry.key().build_id)))
            .collect();
        build_ids
            .iter()
            .map(|id| snapshot.get(id).cloned().unwrap_or_else(|| JobInfo::unknown(*id)))
            .collect()
    }

    /// Statistics of every task that has started
    pub fn statistics(&self) -> Vec<TaskStatistic> {
        let mut stats: Vec<TaskStatistic> = self
            .tasks
            .iter()
            .filter_map(|entry| entry.value().statistic.clone())
            .collect();
        stats.sort_by_key(|s| s.build_id);
        stats
    }

    /// Tasks still building
    pub fn in_progress(&self) -> usize {
        self.tasks
            .iter()
            .filter(|entry| entry.value().state == IndexState::InProgress)
            .count()
    }

    /// Tracked tasks
    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    /// Whether no tasks are tracked
    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_insert_if_absent_detects_duplicates() {
        let table = TaskTable::new();
        let key = TaskKey::new("c1", 10);
        assert!(table.insert_if_absent(key.clone(), TaskInfo::in_progress(CancelToken::new())));
        assert!(!table.insert_if_absent(key.clone(), TaskInfo::in_progress(CancelToken::new())));
        assert!(table.insert_if_absent(
            TaskKey::new("c2", 10),
            TaskInfo::in_progress(CancelToken::new())
        ));
        assert_eq!(table.len(), 2);
    }

    #[test]
    fn test_query_is_cluster_scoped_and_ordered() {
        let table = TaskTable::new();
        table.insert_if_absent(TaskKey::new("c1", 10), TaskInfo::in_progress(CancelToken::new()));
        table.insert_if_absent(TaskKey::new("c2", 11), TaskInfo::in_progress(CancelToken::new()));
        table.finish(&TaskKey::new("c1", 10), vec!["a".into()], 5);

        let infos = table.query("c1", &[11, 10]);
        assert_eq!(infos[0], JobInfo::unknown(11));
        assert_eq!(infos[1].state, IndexState::Finished);
        assert_eq!(infos[1].index_file_keys, vec!["a".to_string()]);
        assert_eq!(infos[1].serialized_size, 5);
    }

    #[test]
    fn test_cancelled_outcome_is_discarded() {
        let table = TaskTable::new();
        let key = TaskKey::new("c1", 10);
        let cancel = CancelToken::new();
        table.insert_if_absent(key.clone(), TaskInfo::in_progress(cancel.clone()));
        cancel.cancel();
        table.fail(&key, "boom");
        assert_eq!(table.state(&key), Some(IndexState::InProgress));

        let removed = table.remove_many(&[key.clone()]);
        assert_eq!(removed.len(), 1);
        assert!(!table.finish(&key, Vec::new(), 0));
        assert!(table.is_empty());
    }

    #[test]
    fn test_statistics_track_started_tasks() {
        let table = TaskTable::new();
        let key = TaskKey::new("c1", 10);
        table.insert_if_absent(key.clone(), TaskInfo::in_progress(CancelToken::new()));
        table.insert_if_absent(TaskKey::new("c1", 11), TaskInfo::in_progress(CancelToken::new()));
        assert!(table.statistics().is_empty());

        table.mark_started(&key, 100);
        table.finish(&key, Vec::new(), 0);
        let stats = table.statistics();
        assert_eq!(stats.len(), 1);
        assert_eq!(stats[0].num_rows, 100);
        assert!(stats[0].end_time.is_some());
        assert_eq!(table.in_progress(), 1);
    }

    proptest::proptest! {
        #[test]
        fn prop_query_reports_every_requested_build(
            tracked in proptest::collection::btree_set(0i64..64, 0..16),
            requested in proptest::collection::vec(0i64..64, 0..24),
        ) {
            let table = TaskTable::new();
            for id in &tracked {
                table.insert_if_absent(
                    TaskKey::new("c1", *id),
                    TaskInfo::in_progress(CancelToken::new()),
                );
            }
            let infos = table.query("c1", &requested);
            proptest::prop_assert_eq!(infos.len(), requested.len());
            for (info, id) in infos.iter().zip(&requested) {
                proptest::prop_assert_eq!(info.build_id, *id);
                let expected = if tracked.contains(id) {
                    IndexState::InProgress
                } else {
                    IndexState::None
                };
                proptest::prop_assert_eq!(info.state, expected);
            }
            proptest::prop_assert_eq!(table.in_progress(), tracked.len());
        }
    }
}
