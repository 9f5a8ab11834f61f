//! Per-agent priority queue.

use chrono::{DateTime, Utc};
use parking_lot::Mutex;

use crate::models::AgentTask;

/// Ordered task list guarded by one mutex.
///
/// Always sorted by `(priority asc, created_at asc)`; the sort is stable so
/// equal keys keep insertion order. Duplicate ids are accepted.
#[derive(Debug, Default)]
pub struct TaskQueue {
    tasks: Mutex<Vec<AgentTask>>,
}

impl TaskQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn enqueue(&self, task: AgentTask) {
        let mut tasks = self.tasks.lock();
        tasks.push(task);
        sort_tasks(&mut tasks);
    }

    /// Remove every task carrying `task_id`. Returns how many were removed.
    pub fn remove(&self, task_id: &str) -> usize {
        let mut tasks = self.tasks.lock();
        let before = tasks.len();
        tasks.retain(|task| task.id != task_id);
        before - tasks.len()
    }

    /// Replace the first task with the same id. Returns false when absent.
    pub fn update(&self, task: AgentTask) -> bool {
        let mut tasks = self.tasks.lock();
        let Some(slot) = tasks.iter_mut().find(|t| t.id == task.id) else {
            return false;
        };
        *slot = task;
        sort_tasks(&mut tasks);
        true
    }

    /// Eligible tasks in queue order. The queue itself is not modified.
    pub fn due_tasks(&self) -> Vec<AgentTask> {
        self.due_tasks_at(Utc::now())
    }

    pub fn due_tasks_at(&self, now: DateTime<Utc>) -> Vec<AgentTask> {
        self.tasks
            .lock()
            .iter()
            .filter(|task| task.should_run_at(now))
            .cloned()
            .collect()
    }

    /// Every queued task in order, due or not.
    pub fn snapshot(&self) -> Vec<AgentTask> {
        self.tasks.lock().clone()
    }

    /// Replace the whole queue, e.g. when loading persisted state.
    pub fn restore(&self, restored: Vec<AgentTask>) {
        let mut tasks = self.tasks.lock();
        *tasks = restored;
        sort_tasks(&mut tasks);
    }

    pub fn get(&self, task_id: &str) -> Option<AgentTask> {
        self.tasks.lock().iter().find(|t| t.id == task_id).cloned()
    }

    pub fn contains(&self, task_id: &str) -> bool {
        self.tasks.lock().iter().any(|t| t.id == task_id)
    }

    pub fn len(&self) -> usize {
        self.tasks.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.lock().is_empty()
    }
}

fn sort_tasks(tasks: &mut [AgentTask]) {
    tasks.sort_by(|a, b| {
        a.priority
            .cmp(&b.priority)
            .then_with(|| a.created_at.cmp(&b.created_at))
    });
}
