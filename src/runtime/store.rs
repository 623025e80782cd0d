//! In-memory task store.
//!
//! Tasks live behind a per-task mutex: the executing engine is the only
//! writer during a run, external callers take snapshots or flip the status
//! to cancelled. Terminal tasks stay queryable for a grace period and are
//! then evicted by the dispatcher's periodic sweep.

use chrono::Utc;
use dashmap::DashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::{info, warn};

use super::task::{Task, TaskStatus};

/// Shared handle to a stored task. Lock scope stays small and never spans
/// an `.await`.
pub type SharedTask = Arc<Mutex<Task>>;

/// Concurrent task registry keyed by task id.
#[derive(Debug, Default)]
pub struct TaskStore {
    tasks: DashMap<String, SharedTask>,
}

impl TaskStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Inserts a task and returns its shared handle.
    pub fn insert(&self, task: Task) -> SharedTask {
        let id = task.task_id.clone();
        let shared = Arc::new(Mutex::new(task));
        self.tasks.insert(id, Arc::clone(&shared));
        shared
    }

    /// Shared handle for direct mutation (worker/engine side).
    #[must_use]
    pub fn handle(&self, task_id: &str) -> Option<SharedTask> {
        self.tasks.get(task_id).map(|e| Arc::clone(&e))
    }

    /// Snapshot clone for external queries.
    #[must_use]
    pub fn snapshot(&self, task_id: &str) -> Option<Task> {
        self.tasks
            .get(task_id)
            .map(|e| e.lock().expect("task lock poisoned").clone())
    }

    /// Number of stored tasks (terminal included, until eviction).
    #[must_use]
    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    /// Flips a task to cancelled.
    ///
    /// Idempotent: repeated calls are equivalent to one. Returns the status
    /// the task held before this call, or `None` for an unknown id. The
    /// caller decides whether an in-flight robot command needs cancelling.
    pub fn cancel(&self, task_id: &str) -> Option<TaskStatus> {
        let entry = self.tasks.get(task_id)?;
        let mut task = entry.lock().expect("task lock poisoned");
        let before = task.status;
        match before {
            TaskStatus::Cancelled => Some(before),
            _ => match task.transition(TaskStatus::Cancelled) {
                Ok(()) => {
                    if before == TaskStatus::Queued {
                        task.finished_at = Some(Utc::now());
                    }
                    info!(task_id = %task_id, from = %before, "task cancelled");
                    Some(before)
                }
                Err(e) => {
                    warn!(task_id = %task_id, error = %e, "cancel rejected");
                    Some(before)
                }
            },
        }
    }

    /// Removes terminal tasks older than `grace` (measured from
    /// `finished_at`). Returns the number evicted.
    pub fn evict_terminal(&self, grace: Duration) -> usize {
        let now = Utc::now();
        let grace = chrono::Duration::from_std(grace).unwrap_or(chrono::Duration::MAX);

        let evictable: Vec<String> = self
            .tasks
            .iter()
            .filter_map(|entry| {
                let task = entry.lock().expect("task lock poisoned");
                match (task.status.is_terminal(), task.finished_at) {
                    (true, Some(finished)) if now - finished > grace => {
                        Some(task.task_id.clone())
                    }
                    _ => None,
                }
            })
            .collect();

        let count = evictable.len();
        for id in evictable {
            self.tasks.remove(&id);
        }
        if count > 0 {
            info!(evicted = count, "evicted terminal tasks");
        }
        count
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn queued_task(id: &str) -> Task {
        Task::new(id, None, vec![])
    }

    #[test]
    fn insert_snapshot_roundtrip() {
        let store = TaskStore::new();
        store.insert(queued_task("t1"));

        let snap = store.snapshot("t1").unwrap();
        assert_eq!(snap.task_id, "t1");
        assert_eq!(snap.status, TaskStatus::Queued);
        assert!(store.snapshot("ghost").is_none());
    }

    #[test]
    fn cancel_is_idempotent() {
        let store = TaskStore::new();
        store.insert(queued_task("t1"));

        assert_eq!(store.cancel("t1"), Some(TaskStatus::Queued));
        assert_eq!(store.cancel("t1"), Some(TaskStatus::Cancelled));
        assert_eq!(store.cancel("t1"), Some(TaskStatus::Cancelled));
        assert_eq!(
            store.snapshot("t1").unwrap().status,
            TaskStatus::Cancelled
        );
        assert_eq!(store.cancel("ghost"), None);
    }

    #[test]
    fn cancel_does_not_disturb_other_terminal_states() {
        let store = TaskStore::new();
        let handle = store.insert(queued_task("t1"));
        {
            let mut task = handle.lock().unwrap();
            task.transition(TaskStatus::InProgress).unwrap();
            task.transition(TaskStatus::Done).unwrap();
        }

        assert_eq!(store.cancel("t1"), Some(TaskStatus::Done));
        assert_eq!(store.snapshot("t1").unwrap().status, TaskStatus::Done);
    }

    #[test]
    fn eviction_respects_grace_period() {
        let store = TaskStore::new();
        let done = store.insert(queued_task("old"));
        {
            let mut task = done.lock().unwrap();
            task.transition(TaskStatus::InProgress).unwrap();
            task.transition(TaskStatus::Done).unwrap();
            task.finished_at = Some(Utc::now() - chrono::Duration::hours(2));
        }
        store.insert(queued_task("fresh"));

        let evicted = store.evict_terminal(Duration::from_secs(3600));
        assert_eq!(evicted, 1);
        assert!(store.snapshot("old").is_none());
        assert!(store.snapshot("fresh").is_some());
    }
}
