//! Echo workflow — returns its arguments after a short delay.
//!
//! Exists to exercise dispatcher plumbing end-to-end without touching the
//! remote service.

use async_trait::async_trait;
use chrono::Utc;

use crate::error::WorkflowError;
use crate::workflow::{Workflow, WorkflowContext, WorkflowOutcome};

pub struct EchoWorkflow;

#[async_trait]
impl Workflow for EchoWorkflow {
    fn kind(&self) -> &'static str {
        "echo"
    }

    async fn run(&self, ctx: &WorkflowContext) -> Result<WorkflowOutcome, WorkflowError> {
        let delay_ms = ctx
            .args
            .get("delay_ms")
            .and_then(serde_json::Value::as_u64)
            .unwrap_or(100);
        tokio::time::sleep(std::time::Duration::from_millis(delay_ms)).await;

        if ctx.cancelled() {
            return Ok(None);
        }

        ctx.progress("echoing", 1, 1);
        Ok(Some(serde_json::json!({
            "echo": ctx.args.get("message").cloned().unwrap_or(serde_json::Value::Null),
            "timestamp": Utc::now(),
        })))
    }
}
