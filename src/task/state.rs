//! Task records and status lifecycle.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::WorkflowError;

/// Status of a background task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    /// Created, workflow not yet reporting progress.
    Pending,
    /// Workflow is running and has reported progress.
    Working,
    /// Workflow finished and its result is recorded.
    Completed,
    /// Workflow failed and the failure is recorded.
    Failed,
    /// Cancelled by the caller.
    Cancelled,
}

impl TaskStatus {
    /// Terminal statuses never change again and start the TTL clock.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }

    /// Active tasks count against the registry's concurrency cap.
    pub fn is_active(&self) -> bool {
        !self.is_terminal()
    }
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Pending => "pending",
            Self::Working => "working",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        };
        write!(f, "{s}")
    }
}

/// Progress of a running task.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskProgress {
    /// Human-readable step label, e.g. `"polling lens 2/3: funding"`.
    pub step: String,
    pub completed: u32,
    pub total: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl TaskProgress {
    pub fn new(step: impl Into<String>, completed: u32, total: u32) -> Self {
        Self {
            step: step.into(),
            completed,
            total,
            message: None,
        }
    }

    pub fn with_message(mut self, message: impl Into<String>) -> Self {
        self.message = Some(message.into());
        self
    }
}

/// A tracked background task.
///
/// The registry exclusively owns these records; callers get clones and
/// mutate only through the registry's methods.
#[derive(Debug, Clone, Serialize)]
pub struct Task {
    pub id: String,
    /// Workflow kind that produced this task, e.g. `"semantic.cron"`.
    #[serde(rename = "type")]
    pub kind: String,
    pub status: TaskStatus,
    pub progress: Option<TaskProgress>,
    pub args: serde_json::Value,
    pub result: Option<serde_json::Value>,
    pub error: Option<WorkflowError>,
    /// Checkpoint written mid-run so a caller can recover remote resources
    /// from a task that later fails or is cancelled.
    pub partial_result: Option<serde_json::Value>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    /// Set when the task reaches a terminal status; the sweep removes the
    /// record once this passes.
    pub expires_at: Option<DateTime<Utc>>,
}

impl Task {
    pub(crate) fn new(kind: &str, args: serde_json::Value) -> Self {
        let now = Utc::now();
        Self {
            id: format!("task_{}", Uuid::new_v4()),
            kind: kind.to_string(),
            status: TaskStatus::Pending,
            progress: None,
            args,
            result: None,
            error: None,
            partial_result: None,
            created_at: now,
            updated_at: now,
            expires_at: None,
        }
    }
}
