//! Workflow execution: the workflow trait, the key → handler registry, and
//! the dispatcher that runs workflows in the background.
//!
//! A workflow is a cancellable, resumable background unit of work. The
//! dispatcher creates a task record, spawns the workflow, and returns
//! immediately; the workflow's outcome settles into the task registry when
//! the run finishes.

pub mod echo;
pub mod helpers;
pub mod research;

use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use async_trait::async_trait;
use futures::FutureExt;
use tokio_util::sync::CancellationToken;

use crate::collections::CollectionService;
use crate::config::WorkflowConfig;
use crate::error::{TaskError, WorkflowError};
use crate::task::{Task, TaskProgress, TaskRegistry};

/// Everything a workflow run needs, handed over by the dispatcher.
pub struct WorkflowContext {
    pub task_id: String,
    pub args: serde_json::Value,
    pub service: Arc<dyn CollectionService>,
    pub registry: Arc<TaskRegistry>,
    /// Cancelled when the caller cancels the task; checked at every state
    /// boundary. Cancellation is cooperative — a run mid-flight on a remote
    /// call completes that call before the next checkpoint observes it.
    pub cancel: CancellationToken,
    pub config: WorkflowConfig,
}

impl WorkflowContext {
    pub fn cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Report progress on this run's task.
    pub fn progress(&self, step: impl Into<String>, completed: u32, total: u32) {
        self.registry
            .update_progress(&self.task_id, TaskProgress::new(step, completed, total));
    }

    /// Report progress with an extra human-readable message.
    pub fn progress_message(
        &self,
        step: impl Into<String>,
        completed: u32,
        total: u32,
        message: impl Into<String>,
    ) {
        self.registry.update_progress(
            &self.task_id,
            TaskProgress::new(step, completed, total).with_message(message),
        );
    }

    /// Checkpoint a partial result on this run's task.
    pub fn checkpoint(&self, partial: serde_json::Value) {
        self.registry.set_partial_result(&self.task_id, partial);
    }
}

/// Outcome of a workflow run: a JSON result, or `None` when the run
/// observed cancellation and unwound cooperatively. Cancellation is not an
/// error — the task's own cancelled status is authoritative.
pub type WorkflowOutcome = Option<serde_json::Value>;

/// A background workflow implementation, registered by kind.
#[async_trait]
pub trait Workflow: Send + Sync {
    /// Registry key, e.g. `"semantic.cron"`.
    fn kind(&self) -> &'static str;

    async fn run(&self, ctx: &WorkflowContext) -> Result<WorkflowOutcome, WorkflowError>;
}

/// Explicit kind → workflow map, assembled at startup.
#[derive(Default)]
pub struct WorkflowRegistry {
    workflows: HashMap<&'static str, Arc<dyn Workflow>>,
}

impl WorkflowRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// A registry with every built-in workflow.
    pub fn builtin() -> Self {
        let mut registry = Self::new();
        registry.register(Arc::new(echo::EchoWorkflow));
        registry.register(Arc::new(research::VerifiedResearchWorkflow));
        registry.register(Arc::new(crate::semantic::workflow::SemanticCronWorkflow));
        registry
    }

    pub fn register(&mut self, workflow: Arc<dyn Workflow>) {
        self.workflows.insert(workflow.kind(), workflow);
    }

    pub fn get(&self, kind: &str) -> Option<Arc<dyn Workflow>> {
        self.workflows.get(kind).cloned()
    }

    /// Registered kinds, sorted for stable error messages.
    pub fn kinds(&self) -> Vec<&'static str> {
        let mut kinds: Vec<_> = self.workflows.keys().copied().collect();
        kinds.sort_unstable();
        kinds
    }
}

/// Starts workflows in the background and settles their outcomes into the
/// task registry.
pub struct Dispatcher {
    workflows: Arc<WorkflowRegistry>,
    tasks: Arc<TaskRegistry>,
    service: Arc<dyn CollectionService>,
    config: WorkflowConfig,
}

impl Dispatcher {
    pub fn new(
        workflows: Arc<WorkflowRegistry>,
        tasks: Arc<TaskRegistry>,
        service: Arc<dyn CollectionService>,
        config: WorkflowConfig,
    ) -> Self {
        Self {
            workflows,
            tasks,
            service,
            config,
        }
    }

    pub fn tasks(&self) -> &Arc<TaskRegistry> {
        &self.tasks
    }

    /// Create a task for `kind` and spawn its workflow. Returns the pending
    /// task immediately; the outcome is written to the registry when the
    /// run settles.
    pub fn start(&self, kind: &str, args: serde_json::Value) -> Result<Task, TaskError> {
        let Some(workflow) = self.workflows.get(kind) else {
            let kinds = self.workflows.kinds();
            let available = if kinds.is_empty() {
                "(none)".to_string()
            } else {
                kinds.join(", ")
            };
            return Err(TaskError::UnknownKind {
                kind: kind.to_string(),
                available,
            });
        };

        let task = self.tasks.create(kind, args.clone())?;
        let cancel = self
            .tasks
            .cancel_token(&task.id)
            .unwrap_or_else(CancellationToken::new);

        let ctx = WorkflowContext {
            task_id: task.id.clone(),
            args,
            service: Arc::clone(&self.service),
            registry: Arc::clone(&self.tasks),
            cancel,
            config: self.config.clone(),
        };

        let registry = Arc::clone(&self.tasks);
        let task_id = task.id.clone();
        tokio::spawn(async move {
            match AssertUnwindSafe(workflow.run(&ctx)).catch_unwind().await {
                Ok(Ok(Some(result))) => {
                    tracing::info!(task = %task_id, "Workflow completed");
                    registry.set_result(&task_id, result);
                }
                Ok(Ok(None)) => {
                    tracing::info!(task = %task_id, "Workflow unwound after cancellation");
                }
                Ok(Err(err)) => {
                    tracing::warn!(task = %task_id, error = %err, "Workflow failed");
                    registry.set_error(&task_id, err);
                }
                Err(panic) => {
                    let message = panic
                        .downcast_ref::<&str>()
                        .map(|s| (*s).to_string())
                        .or_else(|| panic.downcast_ref::<String>().cloned())
                        .unwrap_or_else(|| "workflow panicked".to_string());
                    tracing::error!(task = %task_id, message, "Workflow panicked");
                    registry.set_error(
                        &task_id,
                        WorkflowError {
                            step: "unknown".to_string(),
                            message,
                            recoverable: false,
                        },
                    );
                }
            }
        });

        Ok(task)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct NamedWorkflow(&'static str);

    #[async_trait]
    impl Workflow for NamedWorkflow {
        fn kind(&self) -> &'static str {
            self.0
        }

        async fn run(&self, _ctx: &WorkflowContext) -> Result<WorkflowOutcome, WorkflowError> {
            Ok(Some(serde_json::json!({})))
        }
    }

    #[test]
    fn registry_lookup_and_kinds() {
        let mut registry = WorkflowRegistry::new();
        registry.register(Arc::new(NamedWorkflow("b.second")));
        registry.register(Arc::new(NamedWorkflow("a.first")));

        assert!(registry.get("a.first").is_some());
        assert!(registry.get("missing").is_none());
        assert_eq!(registry.kinds(), vec!["a.first", "b.second"]);
    }

    #[test]
    fn builtin_registry_covers_all_workflows() {
        let registry = WorkflowRegistry::builtin();
        assert_eq!(
            registry.kinds(),
            vec!["echo", "research.verified", "semantic.cron"]
        );
    }

    #[test]
    fn re_registering_a_kind_replaces_it() {
        let mut registry = WorkflowRegistry::new();
        registry.register(Arc::new(NamedWorkflow("echo")));
        registry.register(Arc::new(NamedWorkflow("echo")));
        assert_eq!(registry.kinds().len(), 1);
    }
}
