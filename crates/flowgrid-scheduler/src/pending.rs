//! PendingQueue — tasks of every session waiting for resources.
//!
//! Session actors publish and withdraw entries; the driver snapshots the
//! queue for each allocation pass and removes the tasks it assigned.

use std::collections::{BTreeMap, BTreeSet};

use flowgrid_core::{ANY_ROLE, TaskRef};
use flowgrid_placement::PendingTask;

#[derive(Debug, Clone)]
struct Entry {
    task: PendingTask,
    /// Epoch ms the task first entered the queue.
    queued_at: u64,
}

#[derive(Debug, Default)]
pub struct PendingQueue {
    entries: BTreeMap<TaskRef, Entry>,
}

impl PendingQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or refresh a task. A refresh keeps the original queue time.
    pub fn upsert(&mut self, task: PendingTask, now: u64) {
        match self.entries.get_mut(&task.task) {
            Some(entry) => entry.task = task,
            None => {
                self.entries.insert(task.task.clone(), Entry { task, queued_at: now });
            }
        }
    }

    pub fn remove(&mut self, task: &TaskRef) -> Option<PendingTask> {
        self.entries.remove(task).map(|e| e.task)
    }

    /// Drop every entry of a session. Returns how many were removed.
    pub fn remove_session(&mut self, session: &str) -> usize {
        let before = self.entries.len();
        self.entries.retain(|task, _| task.session != session);
        before - self.entries.len()
    }

    pub fn get(&self, task: &TaskRef) -> Option<&PendingTask> {
        self.entries.get(task).map(|e| &e.task)
    }

    pub fn contains(&self, task: &TaskRef) -> bool {
        self.entries.contains_key(task)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// All entries, ordered by task reference.
    pub fn snapshot(&self) -> Vec<PendingTask> {
        self.entries.values().map(|e| e.task.clone()).collect()
    }

    /// Distinct roles the queued tasks ask for (`*` when unrestricted).
    pub fn roles(&self) -> BTreeSet<String> {
        self.entries
            .values()
            .map(|e| e.task.request.role.clone().unwrap_or_else(|| ANY_ROLE.to_string()))
            .collect()
    }

    /// Queue time of the longest-waiting placeable task.
    pub fn oldest_waiting(&self, now: u64) -> Option<u64> {
        self.entries
            .values()
            .filter(|e| e.task.not_before <= now)
            .map(|e| e.queued_at)
            .min()
    }
}

#[cfg(test)]
mod tests {
    use flowgrid_core::ResourceRequest;

    use super::*;

    fn pending(session: &str, task: &str) -> PendingTask {
        PendingTask::new(TaskRef::new(session, task), ResourceRequest::new().with_cores(100))
    }

    #[test]
    fn refresh_keeps_queue_time() {
        let mut q = PendingQueue::new();
        q.upsert(pending("s1", "a"), 10);
        q.upsert(pending("s1", "a").with_dependency_ready(false), 50);

        assert_eq!(q.len(), 1);
        assert!(!q.get(&TaskRef::new("s1", "a")).unwrap().dependency_ready);
        assert_eq!(q.oldest_waiting(100), Some(10));
    }

    #[test]
    fn remove_session_leaves_others() {
        let mut q = PendingQueue::new();
        q.upsert(pending("s1", "a"), 1);
        q.upsert(pending("s1", "b"), 1);
        q.upsert(pending("s2", "a"), 1);

        assert_eq!(q.remove_session("s1"), 2);
        assert_eq!(q.snapshot().len(), 1);
        assert!(q.contains(&TaskRef::new("s2", "a")));
    }

    #[test]
    fn roles_default_to_any() {
        let mut q = PendingQueue::new();
        q.upsert(pending("s1", "a"), 1);
        let mut gpu = pending("s1", "b");
        gpu.request = gpu.request.with_role("gpu");
        q.upsert(gpu, 1);

        let roles: Vec<String> = q.roles().into_iter().collect();
        assert_eq!(roles, vec!["*".to_string(), "gpu".to_string()]);
    }

    #[test]
    fn backoff_tasks_do_not_count_as_waiting() {
        let mut q = PendingQueue::new();
        q.upsert(pending("s1", "a").not_before(500), 1);
        assert_eq!(q.oldest_waiting(100), None);
        assert_eq!(q.oldest_waiting(500), Some(1));
    }
}
