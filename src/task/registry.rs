//! In-memory task registry with lifecycle, TTL eviction, and a concurrency
//! cap.
//!
//! The registry is the single mutable shared structure of the system. Every
//! mutation goes through a synchronous method holding the lock, so each one
//! is atomic; workflows running in the background only ever see records
//! through [`TaskRegistry::get`] clones.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use chrono::{DateTime, Utc};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::config::TaskConfig;
use crate::error::{TaskError, WorkflowError};
use crate::task::state::{Task, TaskProgress, TaskStatus};

struct TaskEntry {
    task: Task,
    cancel: CancellationToken,
}

/// In-memory store of task records.
pub struct TaskRegistry {
    config: TaskConfig,
    tasks: Mutex<HashMap<String, TaskEntry>>,
    sweeper: Mutex<Option<JoinHandle<()>>>,
}

impl TaskRegistry {
    /// Create a registry without the background sweep. Use [`shared`] for
    /// the production form.
    ///
    /// [`shared`]: TaskRegistry::shared
    pub fn new(config: TaskConfig) -> Self {
        Self {
            config,
            tasks: Mutex::new(HashMap::new()),
            sweeper: Mutex::new(None),
        }
    }

    /// Create a shared registry and start the periodic eviction sweep.
    ///
    /// The sweep task holds only a weak reference, so dropping the last
    /// `Arc` stops it; the registry never keeps the process alive for its
    /// own sake. Must be called within a tokio runtime.
    pub fn shared(config: TaskConfig) -> Arc<Self> {
        let interval = config.cleanup_interval;
        let registry = Arc::new(Self::new(config));

        let weak = Arc::downgrade(&registry);
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await; // consume the immediate first tick
            loop {
                ticker.tick().await;
                let Some(registry) = weak.upgrade() else { break };
                let removed = registry.cleanup();
                if removed > 0 {
                    tracing::debug!(removed, "Swept expired tasks");
                }
            }
        });
        *registry.lock_sweeper() = Some(handle);

        registry
    }

    fn lock_tasks(&self) -> MutexGuard<'_, HashMap<String, TaskEntry>> {
        self.tasks.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn lock_sweeper(&self) -> MutexGuard<'_, Option<JoinHandle<()>>> {
        self.sweeper.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn expiry(&self) -> DateTime<Utc> {
        let ttl = chrono::Duration::from_std(self.config.ttl)
            .unwrap_or_else(|_| chrono::Duration::hours(1));
        Utc::now() + ttl
    }

    /// Create a new pending task. Fails when the active-task count has
    /// reached the configured cap.
    pub fn create(&self, kind: &str, args: serde_json::Value) -> Result<Task, TaskError> {
        let mut tasks = self.lock_tasks();

        let active = tasks
            .values()
            .filter(|entry| entry.task.status.is_active())
            .count();
        if active >= self.config.max_concurrent {
            return Err(TaskError::MaxConcurrent {
                max: self.config.max_concurrent,
            });
        }

        let task = Task::new(kind, args);
        tasks.insert(
            task.id.clone(),
            TaskEntry {
                task: task.clone(),
                cancel: CancellationToken::new(),
            },
        );
        tracing::debug!(task = %task.id, kind, "Created task");
        Ok(task)
    }

    /// Fetch a snapshot of a task record.
    pub fn get(&self, id: &str) -> Option<Task> {
        self.lock_tasks().get(id).map(|entry| entry.task.clone())
    }

    /// The cancellation token bound to a task, for handing to its workflow.
    pub fn cancel_token(&self, id: &str) -> Option<CancellationToken> {
        self.lock_tasks().get(id).map(|entry| entry.cancel.clone())
    }

    /// List tasks, optionally filtered by status.
    pub fn list(&self, status: Option<TaskStatus>) -> Vec<Task> {
        self.lock_tasks()
            .values()
            .filter(|entry| status.is_none_or(|s| entry.task.status == s))
            .map(|entry| entry.task.clone())
            .collect()
    }

    /// Record progress and move the task to `working`. Ignored once the
    /// task is terminal — a cancelled status is never resurrected.
    pub fn update_progress(&self, id: &str, progress: TaskProgress) {
        let mut tasks = self.lock_tasks();
        let Some(entry) = tasks.get_mut(id) else { return };
        if entry.task.status.is_terminal() {
            return;
        }
        entry.task.status = TaskStatus::Working;
        entry.task.progress = Some(progress);
        entry.task.updated_at = Utc::now();
    }

    /// Record the final result and complete the task. Ignored once the task
    /// is terminal.
    pub fn set_result(&self, id: &str, result: serde_json::Value) {
        let expires_at = self.expiry();
        let mut tasks = self.lock_tasks();
        let Some(entry) = tasks.get_mut(id) else { return };
        if entry.task.status.is_terminal() {
            return;
        }
        entry.task.status = TaskStatus::Completed;
        entry.task.result = Some(result);
        entry.task.updated_at = Utc::now();
        entry.task.expires_at = Some(expires_at);
    }

    /// Record a failure and fail the task. Ignored once the task is
    /// terminal.
    pub fn set_error(&self, id: &str, error: WorkflowError) {
        let expires_at = self.expiry();
        let mut tasks = self.lock_tasks();
        let Some(entry) = tasks.get_mut(id) else { return };
        if entry.task.status.is_terminal() {
            return;
        }
        entry.task.status = TaskStatus::Failed;
        entry.task.error = Some(error);
        entry.task.updated_at = Utc::now();
        entry.task.expires_at = Some(expires_at);
    }

    /// Record a mid-run checkpoint without changing status.
    pub fn set_partial_result(&self, id: &str, partial: serde_json::Value) {
        let mut tasks = self.lock_tasks();
        let Some(entry) = tasks.get_mut(id) else { return };
        if entry.task.status.is_terminal() {
            return;
        }
        entry.task.partial_result = Some(partial);
        entry.task.updated_at = Utc::now();
    }

    /// Cancel a pending or working task. Returns `false` for unknown or
    /// already-terminal tasks. Cancels the task's token so the workflow
    /// observes it at its next checkpoint.
    pub fn cancel(&self, id: &str) -> bool {
        let expires_at = self.expiry();
        let mut tasks = self.lock_tasks();
        let Some(entry) = tasks.get_mut(id) else {
            return false;
        };
        if entry.task.status.is_terminal() {
            return false;
        }
        entry.task.status = TaskStatus::Cancelled;
        entry.task.updated_at = Utc::now();
        entry.task.expires_at = Some(expires_at);
        entry.cancel.cancel();
        tracing::info!(task = %id, "Cancelled task");
        true
    }

    /// Remove terminal tasks whose TTL has passed. Returns how many were
    /// removed.
    pub fn cleanup(&self) -> usize {
        let now = Utc::now();
        let mut tasks = self.lock_tasks();
        let before = tasks.len();
        tasks.retain(|_, entry| {
            entry
                .task
                .expires_at
                .is_none_or(|expires_at| expires_at > now)
        });
        before - tasks.len()
    }

    /// Stop the sweep and drop all state.
    pub fn dispose(&self) {
        if let Some(handle) = self.lock_sweeper().take() {
            handle.abort();
        }
        self.lock_tasks().clear();
    }

    /// Tasks currently counting against the concurrency cap.
    pub fn active_count(&self) -> usize {
        self.lock_tasks()
            .values()
            .filter(|entry| entry.task.status.is_active())
            .count()
    }
}

impl Drop for TaskRegistry {
    fn drop(&mut self) {
        if let Some(handle) = self.lock_sweeper().take() {
            handle.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    fn registry_with_cap(max_concurrent: usize) -> TaskRegistry {
        TaskRegistry::new(TaskConfig {
            max_concurrent,
            ..TaskConfig::default()
        })
    }

    fn args() -> serde_json::Value {
        serde_json::json!({})
    }

    #[test]
    fn create_and_get() {
        let registry = registry_with_cap(5);
        let task = registry.create("echo", args()).unwrap();
        let fetched = registry.get(&task.id).unwrap();
        assert_eq!(fetched.kind, "echo");
        assert_eq!(fetched.status, TaskStatus::Pending);
        assert!(registry.get("task_nope").is_none());
    }

    #[test]
    fn create_fails_beyond_cap() {
        let registry = registry_with_cap(2);
        registry.create("echo", args()).unwrap();
        registry.create("echo", args()).unwrap();

        let err = registry.create("echo", args()).unwrap_err();
        assert!(matches!(err, TaskError::MaxConcurrent { max: 2 }));
        assert!(err.to_string().contains("Max concurrent tasks (2)"));
    }

    #[test]
    fn terminal_tasks_free_cap_slots() {
        let registry = registry_with_cap(1);
        let task = registry.create("echo", args()).unwrap();
        registry.set_result(&task.id, args());

        // The completed task no longer counts against the cap.
        registry.create("echo", args()).unwrap();
    }

    #[test]
    fn progress_moves_to_working() {
        let registry = registry_with_cap(5);
        let task = registry.create("echo", args()).unwrap();

        registry.update_progress(&task.id, TaskProgress::new("collecting", 3, 8));
        let fetched = registry.get(&task.id).unwrap();
        assert_eq!(fetched.status, TaskStatus::Working);
        assert_eq!(fetched.progress.unwrap().step, "collecting");
    }

    #[test]
    fn result_is_terminal_and_sets_expiry() {
        let registry = registry_with_cap(5);
        let task = registry.create("echo", args()).unwrap();
        assert!(registry.get(&task.id).unwrap().expires_at.is_none());

        registry.set_result(&task.id, serde_json::json!({"ok": true}));
        let fetched = registry.get(&task.id).unwrap();
        assert_eq!(fetched.status, TaskStatus::Completed);
        assert!(fetched.expires_at.is_some());
        assert_eq!(fetched.result.unwrap()["ok"], true);
    }

    #[test]
    fn error_is_terminal() {
        let registry = registry_with_cap(5);
        let task = registry.create("echo", args()).unwrap();

        registry.set_error(&task.id, WorkflowError::at_step("polling", "gone"));
        let fetched = registry.get(&task.id).unwrap();
        assert_eq!(fetched.status, TaskStatus::Failed);
        assert_eq!(fetched.error.unwrap().step, "polling");
        assert!(fetched.expires_at.is_some());
    }

    #[test]
    fn partial_result_does_not_change_status() {
        let registry = registry_with_cap(5);
        let task = registry.create("echo", args()).unwrap();

        registry.set_partial_result(&task.id, serde_json::json!({"ids": ["col_1"]}));
        let fetched = registry.get(&task.id).unwrap();
        assert_eq!(fetched.status, TaskStatus::Pending);
        assert!(fetched.partial_result.is_some());
    }

    #[test]
    fn cancel_semantics() {
        let registry = registry_with_cap(5);
        let task = registry.create("echo", args()).unwrap();
        let token = registry.cancel_token(&task.id).unwrap();
        assert!(!token.is_cancelled());

        assert!(registry.cancel(&task.id));
        assert!(token.is_cancelled());
        assert_eq!(registry.get(&task.id).unwrap().status, TaskStatus::Cancelled);

        // Already terminal: false. Unknown: false.
        assert!(!registry.cancel(&task.id));
        assert!(!registry.cancel("task_nope"));

        let done = registry.create("echo", args()).unwrap();
        registry.set_result(&done.id, args());
        assert!(!registry.cancel(&done.id));
    }

    #[test]
    fn terminal_status_is_never_resurrected() {
        let registry = registry_with_cap(5);
        let task = registry.create("echo", args()).unwrap();
        registry.cancel(&task.id);

        registry.update_progress(&task.id, TaskProgress::new("searching", 2, 8));
        registry.set_result(&task.id, args());
        registry.set_error(&task.id, WorkflowError::at_step("join", "late"));
        registry.set_partial_result(&task.id, args());

        let fetched = registry.get(&task.id).unwrap();
        assert_eq!(fetched.status, TaskStatus::Cancelled);
        assert!(fetched.result.is_none());
        assert!(fetched.error.is_none());
        assert!(fetched.partial_result.is_none());
    }

    #[test]
    fn list_filters_by_status() {
        let registry = registry_with_cap(5);
        let a = registry.create("echo", args()).unwrap();
        let b = registry.create("echo", args()).unwrap();
        registry.set_result(&b.id, args());

        assert_eq!(registry.list(None).len(), 2);
        let pending = registry.list(Some(TaskStatus::Pending));
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].id, a.id);
        assert_eq!(registry.list(Some(TaskStatus::Completed)).len(), 1);
    }

    #[test]
    fn cleanup_removes_only_expired_terminal_tasks() {
        let registry = TaskRegistry::new(TaskConfig {
            ttl: Duration::ZERO,
            ..TaskConfig::default()
        });
        let active = registry.create("echo", args()).unwrap();
        let done = registry.create("echo", args()).unwrap();
        registry.set_result(&done.id, args());

        // ttl of zero means the terminal task is already expired.
        std::thread::sleep(Duration::from_millis(5));
        assert_eq!(registry.cleanup(), 1);
        assert!(registry.get(&done.id).is_none());
        assert!(registry.get(&active.id).is_some());
    }

    #[tokio::test]
    async fn sweep_runs_in_background() {
        tokio::time::pause();
        let registry = TaskRegistry::shared(TaskConfig {
            ttl: Duration::ZERO,
            cleanup_interval: Duration::from_millis(50),
            ..TaskConfig::default()
        });
        let done = registry.create("echo", args()).unwrap();
        registry.set_result(&done.id, args());

        tokio::time::sleep(Duration::from_millis(200)).await;
        // Give the sweep task a real scheduling turn.
        tokio::task::yield_now().await;
        assert!(registry.get(&done.id).is_none());
    }

    #[tokio::test]
    async fn dispose_clears_state() {
        let registry = TaskRegistry::shared(TaskConfig::default());
        registry.create("echo", args()).unwrap();
        registry.dispose();
        assert!(registry.list(None).is_empty());
    }
}
