//! Named queue/concurrency limits.

use crate::domain::TaskCycleKey;
use std::collections::{HashMap, HashSet};

#[derive(Debug, Clone)]
pub struct QueueConfig {
    pub name: String,
    pub members: HashSet<String>,
    pub concurrency_limit: Option<usize>,
}

/// Tracks how many members of each named queue are currently submitted
/// (in `Submitted`/`Running` state) so a `preparing` proxy can be told to
/// wait if its queue is at capacity.
#[derive(Default)]
pub struct QueueTracker {
    configs: Vec<QueueConfig>,
    active_counts: HashMap<String, usize>,
}

impl QueueTracker {
    pub fn new(configs: Vec<QueueConfig>) -> Self {
        Self { configs, active_counts: HashMap::new() }
    }

    fn queue_for(&self, task_name: &str) -> Option<&QueueConfig> {
        self.configs.iter().find(|q| q.members.contains(task_name))
    }

    /// Whether a `preparing` proxy for `task_name` may advance to actual
    /// submission right now.
    pub fn may_submit(&self, task_name: &str) -> bool {
        match self.queue_for(task_name) {
            None => true,
            Some(q) => match q.concurrency_limit {
                None => true,
                Some(limit) => *self.active_counts.get(&q.name).unwrap_or(&0) < limit,
            },
        }
    }

    pub fn record_submitted(&mut self, task_name: &str) {
        if let Some(q) = self.queue_for(task_name) {
            *self.active_counts.entry(q.name.clone()).or_insert(0) += 1;
        }
    }

    pub fn record_finished(&mut self, task_name: &str) {
        if let Some(q) = self.queue_for(task_name) {
            let name = q.name.clone();
            if let Some(count) = self.active_counts.get_mut(&name) {
                *count = count.saturating_sub(1);
            }
        }
    }
}

/// The subset of `preparing` proxies a readiness scan produced, split into
/// those cleared by their queue's cap and those still waiting.
pub fn partition_by_queue_cap(
    tracker: &QueueTracker,
    candidates: Vec<(TaskCycleKey, String)>,
) -> (Vec<TaskCycleKey>, Vec<TaskCycleKey>) {
    let mut ready = Vec::new();
    let mut queued = Vec::new();
    for (key, task_name) in candidates {
        if tracker.may_submit(&task_name) {
            ready.push(key);
        } else {
            queued.push(key);
        }
    }
    (ready, queued)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{CycleId, TaskId};

    #[test]
    fn concurrency_cap_blocks_further_submission() {
        let config = QueueConfig {
            name: "default".to_string(),
            members: HashSet::from(["foo".to_string()]),
            concurrency_limit: Some(1),
        };
        let mut tracker = QueueTracker::new(vec![config]);
        assert!(tracker.may_submit("foo"));
        tracker.record_submitted("foo");
        assert!(!tracker.may_submit("foo"));
        tracker.record_finished("foo");
        assert!(tracker.may_submit("foo"));
    }

    #[test]
    fn unqueued_tasks_always_submit() {
        let tracker = QueueTracker::new(vec![]);
        assert!(tracker.may_submit("anything"));
    }

    #[test]
    fn partition_splits_candidates_by_cap() {
        let config = QueueConfig {
            name: "q".to_string(),
            members: HashSet::from(["foo".to_string()]),
            concurrency_limit: Some(0),
        };
        let tracker = QueueTracker::new(vec![config]);
        let key = TaskCycleKey { task: TaskId(0), cycle: CycleId(0) };
        let (ready, queued) = partition_by_queue_cap(&tracker, vec![(key, "foo".to_string())]);
        assert!(ready.is_empty());
        assert_eq!(queued, vec![key]);
    }
}
