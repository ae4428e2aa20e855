//! Verified research workflow: build a criteria-checked collection, then run
//! a research call per entity through the fan-out limiter.
//!
//! Research failures are isolated to the item they happened on; one bad
//! entity never aborts the batch.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::json;

use crate::collections::{
    Criterion, EnrichmentSpec, EntityKind, RawItem, ResearchRequest,
};
use crate::error::WorkflowError;
use crate::limiter::Limiter;
use crate::workflow::helpers::{self, StepTracker, with_summary};
use crate::workflow::{Workflow, WorkflowContext, WorkflowOutcome};

/// Ceiling on a single research call regardless of the run timeout.
const RESEARCH_CALL_TIMEOUT: Duration = Duration::from_secs(120);

#[derive(Debug, Deserialize)]
struct ResearchArgs {
    query: String,
    entity: EntityKind,
    #[serde(default)]
    criteria: Vec<Criterion>,
    #[serde(default = "default_count")]
    count: u32,
    #[serde(default)]
    enrichments: Vec<EnrichmentSpec>,
    research_prompt: String,
    #[serde(default)]
    research_schema: Option<serde_json::Value>,
    #[serde(default = "default_model")]
    research_model: String,
    #[serde(default = "default_limit")]
    research_limit: usize,
    #[serde(default)]
    timeout_ms: Option<u64>,
}

fn default_count() -> u32 {
    25
}

fn default_model() -> String {
    "research".to_string()
}

fn default_limit() -> usize {
    10
}

/// Substitute `{{name}}`, `{{url}}`, and `{{description}}` from an item into
/// a research prompt template.
fn expand_prompt(template: &str, item: &RawItem) -> String {
    let name = item.display_name().unwrap_or("unknown");
    let url = item.url().unwrap_or("");
    let description = item
        .properties
        .get("description")
        .and_then(|v| v.as_str())
        .map(str::to_string)
        .unwrap_or_else(|| item.summarize());

    template
        .replace("{{name}}", name)
        .replace("{{url}}", url)
        .replace("{{description}}", &description)
}

pub struct VerifiedResearchWorkflow;

#[async_trait]
impl Workflow for VerifiedResearchWorkflow {
    fn kind(&self) -> &'static str {
        "research.verified"
    }

    async fn run(&self, ctx: &WorkflowContext) -> Result<WorkflowOutcome, WorkflowError> {
        let started = Instant::now();
        let mut tracker = StepTracker::new();

        let step0 = Instant::now();
        let args: ResearchArgs = serde_json::from_value(ctx.args.clone())
            .map_err(|e| WorkflowError::validation(e.to_string()))?;
        let timeout = args
            .timeout_ms
            .map(Duration::from_millis)
            .unwrap_or(ctx.config.default_timeout);
        tracker.track("validate", step0);

        if ctx.cancelled() {
            return Ok(None);
        }

        // Create the collection.
        let step1 = Instant::now();
        ctx.progress("creating collection", 1, 5);
        let collection = ctx
            .service
            .create_collection(crate::collections::CreateCollection {
                query: args.query.clone(),
                count: args.count,
                entity: Some(args.entity),
                criteria: args.criteria,
                enrichments: args.enrichments,
            })
            .await
            .map_err(|e| WorkflowError::remote("creating collection", e))?;
        let collection_id = collection.id;
        tracker.track("create", step1);

        if ctx.cancelled() {
            let _ = ctx.service.cancel_collection(&collection_id).await;
            return Ok(None);
        }

        // Poll until idle.
        let step2 = Instant::now();
        ctx.progress("polling", 2, 5);
        let poll = helpers::poll_until_idle(ctx, &collection_id, timeout, 2, 5).await?;
        tracker.track("poll", step2);
        if poll.cancelled {
            return Ok(None);
        }

        // Collect items.
        let step3 = Instant::now();
        ctx.progress("collecting", 3, 5);
        let all_items = helpers::collect_items(ctx, &collection_id)
            .await
            .map_err(|e| WorkflowError::remote("collecting", e))?;
        tracker.track("collect", step3);

        let selected: Vec<RawItem> = all_items
            .iter()
            .take(args.research_limit)
            .cloned()
            .collect();

        ctx.checkpoint(json!({
            "collection_id": collection_id,
            "total_items": all_items.len(),
            "selected_for_research": selected.len(),
        }));

        if ctx.cancelled() {
            return Ok(None);
        }

        // Per-entity research with bounded fan-out.
        let step4 = Instant::now();
        ctx.progress_message(
            "researching",
            4,
            5,
            format!("Researching {} entities", selected.len()),
        );

        let limiter = Limiter::new(ctx.config.research_concurrency);
        let finished = Arc::new(AtomicUsize::new(0));
        let total = selected.len();

        let runs = selected.into_iter().map(|item| {
            let limiter = limiter.clone();
            let finished = Arc::clone(&finished);
            let prompt = expand_prompt(&args.research_prompt, &item);
            let model = args.research_model.clone();
            let schema = args.research_schema.clone();
            async move {
                limiter
                    .run(async {
                        if ctx.cancelled() {
                            return item_entry(&item, None);
                        }

                        let call_started = Instant::now();
                        let research = run_research(ctx, prompt, model, schema, timeout).await;
                        let done = finished.fetch_add(1, Ordering::SeqCst) + 1;
                        ctx.progress_message(
                            "researching",
                            4,
                            5,
                            format!("Completed {done}/{total}"),
                        );

                        match research {
                            Ok((research_id, content)) => item_entry(
                                &item,
                                Some(json!({
                                    "research_id": research_id,
                                    "result": content,
                                    "duration_ms": call_started.elapsed().as_millis() as u64,
                                })),
                            ),
                            Err(err) => {
                                tracing::warn!(
                                    item = %item.id,
                                    error = %err,
                                    "Per-entity research failed; continuing batch"
                                );
                                item_entry(
                                    &item,
                                    Some(json!({
                                        "research_id": "error",
                                        "result": format!("Research failed: {err}"),
                                        "duration_ms": call_started.elapsed().as_millis() as u64,
                                    })),
                                )
                            }
                        }
                    })
                    .await
            }
        });

        let researched: Vec<serde_json::Value> = futures::future::join_all(runs).await;
        tracker.track("research", step4);

        ctx.progress("complete", 5, 5);

        let researched_count = researched
            .iter()
            .filter(|entry| {
                entry
                    .get("research")
                    .and_then(|r| r.get("research_id"))
                    .and_then(|v| v.as_str())
                    .is_some_and(|id| id != "error")
            })
            .count();

        let duration_ms = started.elapsed().as_millis() as u64;
        let result = json!({
            "collection_id": collection_id,
            "items": researched,
            "total_items": all_items.len(),
            "researched_count": researched_count,
            "duration_ms": duration_ms,
            "steps": tracker.into_steps(),
        });

        Ok(Some(with_summary(
            result,
            format!(
                "{} items collected, {researched_count}/{total} researched in {}s",
                all_items.len(),
                duration_ms / 1000
            ),
        )))
    }
}

fn item_entry(item: &RawItem, research: Option<serde_json::Value>) -> serde_json::Value {
    json!({
        "id": item.id,
        "name": item.display_name().unwrap_or("unknown"),
        "url": item.url().unwrap_or(""),
        "research": research,
    })
}

async fn run_research(
    ctx: &WorkflowContext,
    instructions: String,
    model: String,
    output_schema: Option<serde_json::Value>,
    timeout: Duration,
) -> Result<(String, String), crate::error::CollectionError> {
    let job = ctx
        .service
        .create_research(ResearchRequest {
            instructions,
            model,
            output_schema,
        })
        .await?;
    let output = ctx
        .service
        .poll_research(&job.id, timeout.min(RESEARCH_CALL_TIMEOUT))
        .await?;
    Ok((job.id, output.content))
}
