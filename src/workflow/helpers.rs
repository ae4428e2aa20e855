//! Shared workflow utilities: step timing, collection polling, item
//! collection, result summaries.

use std::time::Instant;

use futures::StreamExt;
use serde::Serialize;

use crate::collections::{Collection, CollectionStatus, RawItem};
use crate::error::{CollectionError, WorkflowError};
use crate::workflow::WorkflowContext;

/// One timed workflow step.
#[derive(Debug, Clone, Serialize)]
pub struct StepTiming {
    pub name: String,
    pub duration_ms: u64,
}

/// Accumulates per-step timings for diagnostic reporting. Purely additive;
/// never affects control flow.
#[derive(Debug, Default)]
pub struct StepTracker {
    steps: Vec<StepTiming>,
}

impl StepTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a step that started at `started`.
    pub fn track(&mut self, name: impl Into<String>, started: Instant) {
        self.steps.push(StepTiming {
            name: name.into(),
            duration_ms: started.elapsed().as_millis() as u64,
        });
    }

    pub fn steps(&self) -> &[StepTiming] {
        &self.steps
    }

    pub fn into_steps(self) -> Vec<StepTiming> {
        self.steps
    }
}

/// Outcome of polling a collection to idle.
pub struct PollOutcome {
    pub collection: Collection,
    /// The deadline passed before the collection went idle. Not an error;
    /// the caller reports it alongside a best-effort result.
    pub timed_out: bool,
    /// Cancellation was observed mid-poll. The collection has already been
    /// cancelled remotely, best-effort.
    pub cancelled: bool,
}

/// Poll a collection at the configured interval until it goes idle, the
/// deadline passes, or the run is cancelled. Search progress is mirrored
/// onto the task record while waiting.
pub async fn poll_until_idle(
    ctx: &WorkflowContext,
    collection_id: &str,
    timeout: std::time::Duration,
    step_num: u32,
    total_steps: u32,
) -> Result<PollOutcome, WorkflowError> {
    let deadline = tokio::time::Instant::now() + timeout;

    loop {
        let collection = ctx
            .service
            .get_collection(collection_id)
            .await
            .map_err(|e| WorkflowError::remote("polling", e))?;

        match collection.status {
            CollectionStatus::Idle => {
                return Ok(PollOutcome {
                    collection,
                    timed_out: false,
                    cancelled: false,
                });
            }
            CollectionStatus::Paused => {
                return Err(WorkflowError::at_step(
                    "polling",
                    format!("Collection {collection_id} was paused unexpectedly"),
                ));
            }
            CollectionStatus::Running => {}
        }

        if tokio::time::Instant::now() >= deadline {
            tracing::warn!(collection = %collection_id, "Poll deadline passed before idle");
            return Ok(PollOutcome {
                collection,
                timed_out: true,
                cancelled: false,
            });
        }

        if let Some(progress) = collection.searches.last().and_then(|s| s.progress) {
            ctx.progress_message(
                "searching",
                step_num,
                total_steps,
                format!("Found {}/{} analyzed", progress.found, progress.analyzed),
            );
        }

        if ctx.cancelled() {
            let _ = ctx.service.cancel_collection(collection_id).await;
            return Ok(PollOutcome {
                collection,
                timed_out: false,
                cancelled: true,
            });
        }

        tokio::time::sleep(ctx.config.poll_interval).await;
    }
}

/// Drain a collection's item stream, bounded by the configured cap.
pub async fn collect_items(
    ctx: &WorkflowContext,
    collection_id: &str,
) -> Result<Vec<RawItem>, CollectionError> {
    let mut stream = ctx.service.stream_items(collection_id).await?;
    let mut items = Vec::new();
    while let Some(item) = stream.next().await {
        items.push(item?);
        if items.len() >= ctx.config.item_cap {
            tracing::debug!(
                collection = %collection_id,
                cap = ctx.config.item_cap,
                "Item cap reached; truncating collection read"
            );
            break;
        }
    }
    Ok(items)
}

/// Attach a one-line human summary to a JSON object result.
pub fn with_summary(mut result: serde_json::Value, summary: impl Into<String>) -> serde_json::Value {
    if let Some(map) = result.as_object_mut() {
        map.insert(
            "summary".to_string(),
            serde_json::Value::String(summary.into()),
        );
    }
    result
}
