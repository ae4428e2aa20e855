//! The semantic cron orchestrating workflow.
//!
//! One run: validate → create or fetch collections → poll to idle →
//! collect + shape → join → signal → snapshot → optional monitors →
//! optional delta. Cancellation is checked at every state boundary;
//! collections created this run are best-effort cancelled when the run
//! unwinds early, and best-effort released when it fails mid-flight.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::json;

use crate::collections::{Collection, CreateCollection};
use crate::error::WorkflowError;
use crate::semantic::condition::{evaluate_shape, resolve_enrichments};
use crate::semantic::join::join_lens_results;
use crate::semantic::signal::evaluate_signal;
use crate::semantic::snapshot::{Snapshot, build_snapshot, compute_delta};
use crate::semantic::template::expand_templates;
use crate::semantic::{LensResult, SemanticCronConfig, ShapedItem};
use crate::workflow::helpers::{self, StepTracker, with_summary};
use crate::workflow::{Workflow, WorkflowContext, WorkflowOutcome};

const TOTAL_STEPS: u32 = 8;

#[derive(Debug, Deserialize)]
struct SemanticCronArgs {
    config: serde_json::Value,
    #[serde(default)]
    variables: Option<HashMap<String, String>>,
    /// Lens ID → collection ID from a prior run; supplying this switches
    /// the run into re-evaluation mode.
    #[serde(default)]
    existing_collections: Option<HashMap<String, String>>,
    #[serde(default)]
    previous_snapshot: Option<Snapshot>,
    #[serde(default)]
    timeout_ms: Option<u64>,
}

pub struct SemanticCronWorkflow;

#[async_trait]
impl Workflow for SemanticCronWorkflow {
    fn kind(&self) -> &'static str {
        "semantic.cron"
    }

    async fn run(&self, ctx: &WorkflowContext) -> Result<WorkflowOutcome, WorkflowError> {
        let started = Instant::now();
        let mut tracker = StepTracker::new();

        // Validate and expand templates. All deterministic; no remote calls.
        let step0 = Instant::now();
        ctx.progress("validating", 0, TOTAL_STEPS);

        let args: SemanticCronArgs = serde_json::from_value(ctx.args.clone())
            .map_err(|e| WorkflowError::validation(e.to_string()))?;

        let config_value = match &args.variables {
            Some(variables) => expand_templates(&args.config, variables)?,
            None => args.config.clone(),
        };
        let config: SemanticCronConfig = serde_json::from_value(config_value)
            .map_err(|e| WorkflowError::validation(e.to_string()))?;
        config.validate()?;

        let is_reeval = args.existing_collections.is_some();
        if let Some(existing) = &args.existing_collections {
            for lens in &config.lenses {
                if !existing.contains_key(&lens.id) {
                    return Err(WorkflowError::validation(format!(
                        "existing_collections missing ID for lens \"{}\"",
                        lens.id
                    )));
                }
            }
        }

        let timeout = args
            .timeout_ms
            .map(Duration::from_millis)
            .unwrap_or(ctx.config.default_timeout);
        let lens_ids = config.lens_ids();
        tracker.track("validate", step0);

        if ctx.cancelled() {
            return Ok(None);
        }

        let mut collection_ids: HashMap<String, String> =
            args.existing_collections.clone().unwrap_or_default();
        // Only collections this run created are released on unwind.
        let mut created_ids: Vec<String> = Vec::new();
        let mut enrichment_maps: HashMap<String, HashMap<String, String>> = HashMap::new();
        let total_lenses = config.lenses.len();
        let mut any_timed_out = false;

        // Create or fetch one collection per lens, in declaration order.
        for (i, lens) in config.lenses.iter().enumerate() {
            let step_started = Instant::now();
            if is_reeval {
                ctx.progress(
                    format!("fetching lens {}/{}: {}", i + 1, total_lenses, lens.id),
                    1,
                    TOTAL_STEPS,
                );
            } else {
                ctx.progress_message(
                    format!("creating lens {}/{}: {}", i + 1, total_lenses, lens.id),
                    1,
                    TOTAL_STEPS,
                    format!("Lens {} of {}", i + 1, total_lenses),
                );
            }

            if ctx.cancelled() {
                release_collections(ctx, &created_ids).await;
                return Ok(None);
            }

            let collection = self
                .create_or_fetch(ctx, &config, lens, &mut collection_ids, &mut created_ids)
                .await?;
            enrichment_maps.insert(lens.id.clone(), enrichment_map(&collection));

            if !is_reeval {
                tracker.track(format!("create-{}", lens.id), step_started);
            }
        }

        if ctx.cancelled() {
            release_collections(ctx, &created_ids).await;
            return Ok(None);
        }

        // Checkpoint the remote resources so a caller can recover them from
        // a task that later fails or is cancelled.
        ctx.checkpoint(json!({ "collection_ids": collection_ids }));

        // Poll freshly created collections to idle, in declaration order.
        if !is_reeval {
            for (i, lens) in config.lenses.iter().enumerate() {
                if lens.source.collection_id.is_some() {
                    continue;
                }
                let Some(collection_id) = collection_ids.get(&lens.id).cloned() else {
                    continue;
                };

                let step_started = Instant::now();
                ctx.progress(
                    format!("polling lens {}/{}: {}", i + 1, total_lenses, lens.id),
                    2,
                    TOTAL_STEPS,
                );

                let outcome =
                    helpers::poll_until_idle(ctx, &collection_id, timeout, 2, TOTAL_STEPS).await;
                let outcome = match outcome {
                    Ok(outcome) => outcome,
                    Err(err) => {
                        release_collections(ctx, &created_ids).await;
                        return Err(err);
                    }
                };
                if outcome.timed_out {
                    any_timed_out = true;
                }
                tracker.track(format!("poll-{}", lens.id), step_started);

                if outcome.cancelled || ctx.cancelled() {
                    release_collections(ctx, &created_ids).await;
                    return Ok(None);
                }
            }
        }

        // Collect, shape, join, signal, snapshot. Remote resources created
        // this run are released before an error propagates.
        let phase = self
            .evaluate(
                ctx,
                &config,
                &lens_ids,
                &collection_ids,
                &enrichment_maps,
                &mut tracker,
                is_reeval,
            )
            .await;

        let (lens_results, snapshot, monitor_errors) = match phase {
            Ok(Some(outputs)) => outputs,
            Ok(None) => {
                release_collections(ctx, &created_ids).await;
                return Ok(None);
            }
            Err(err) => {
                release_collections(ctx, &created_ids).await;
                return Err(err);
            }
        };

        ctx.progress("complete", 8, TOTAL_STEPS);

        let total_items: usize = lens_results.iter().map(|lr| lr.total_items).sum();
        let total_shaped: usize = lens_results.iter().map(|lr| lr.shaped_items.len()).sum();
        let joined_count = snapshot.join.entities.len();
        let signal_fired = snapshot.signal.fired;
        let signal_text = if signal_fired {
            format!("FIRED ({} entities)", snapshot.signal.entities.len())
        } else {
            "not fired".to_string()
        };

        let duration_ms = started.elapsed().as_millis() as u64;
        let delta = match (&args.previous_snapshot, is_reeval) {
            (Some(previous), true) => Some(compute_delta(&snapshot, previous)),
            _ => None,
        };

        let mut result = json!({
            "collection_ids": collection_ids,
            "snapshot": snapshot,
            "duration_ms": duration_ms,
            "steps": tracker.into_steps(),
        });
        if let Some(map) = result.as_object_mut() {
            if any_timed_out {
                map.insert("timed_out".into(), json!(true));
            }
            if !monitor_errors.is_empty() {
                map.insert("monitor_errors".into(), json!(monitor_errors));
            }
            if let Some(delta) = delta {
                map.insert("delta".into(), json!(delta));
            }
        }

        tracing::info!(
            task = %ctx.task_id,
            lenses = total_lenses,
            shaped = total_shaped,
            joined = joined_count,
            fired = signal_fired,
            "Semantic cron evaluation finished"
        );

        Ok(Some(with_summary(
            result,
            format!(
                "{total_lenses} lenses, {total_items} items → {total_shaped} shaped, \
                 {joined_count} joined entities, signal: {signal_text} in {}s",
                duration_ms / 1000
            ),
        )))
    }
}

impl SemanticCronWorkflow {
    async fn create_or_fetch(
        &self,
        ctx: &WorkflowContext,
        config: &SemanticCronConfig,
        lens: &crate::semantic::LensConfig,
        collection_ids: &mut HashMap<String, String>,
        created_ids: &mut Vec<String>,
    ) -> Result<Collection, WorkflowError> {
        // Re-evaluation and pinned-collection lenses fetch; the rest create.
        if let Some(existing_id) = collection_ids.get(&lens.id).cloned() {
            return ctx
                .service
                .get_collection(&existing_id)
                .await
                .map_err(|e| WorkflowError::remote("fetching lens", e));
        }
        if let Some(pinned) = &lens.source.collection_id {
            collection_ids.insert(lens.id.clone(), pinned.clone());
            return ctx
                .service
                .get_collection(pinned)
                .await
                .map_err(|e| WorkflowError::remote("fetching lens", e));
        }

        let query = lens.source.query.clone().unwrap_or_default();
        let created = ctx
            .service
            .create_collection(CreateCollection {
                query,
                count: lens.source.count.unwrap_or(50),
                entity: lens.source.entity.clone(),
                criteria: lens.source.criteria.clone(),
                enrichments: lens.source.enrichments.clone(),
            })
            .await
            .map_err(|e| WorkflowError::remote("creating lens", e))?;

        collection_ids.insert(lens.id.clone(), created.id.clone());
        created_ids.push(created.id.clone());
        tracing::debug!(
            lens = %lens.id,
            collection = %created.id,
            total = config.lenses.len(),
            "Created collection for lens"
        );
        Ok(created)
    }

    /// Steps 3–7: collect + shape, join, signal, snapshot, monitors.
    /// Returns `None` when cancellation was observed at a boundary.
    #[allow(clippy::too_many_arguments)]
    async fn evaluate(
        &self,
        ctx: &WorkflowContext,
        config: &SemanticCronConfig,
        lens_ids: &[String],
        collection_ids: &HashMap<String, String>,
        enrichment_maps: &HashMap<String, HashMap<String, String>>,
        tracker: &mut StepTracker,
        is_reeval: bool,
    ) -> Result<Option<(Vec<LensResult>, Snapshot, Vec<String>)>, WorkflowError> {
        // Collect items and apply shapes.
        let step_collect = Instant::now();
        ctx.progress("collecting items", 3, TOTAL_STEPS);

        let empty_map = HashMap::new();
        let mut lens_results = Vec::with_capacity(config.lenses.len());
        for lens in &config.lenses {
            let Some(collection_id) = collection_ids.get(&lens.id).cloned() else {
                continue;
            };
            let raw_items = helpers::collect_items(ctx, &collection_id)
                .await
                .map_err(|e| WorkflowError::remote("collecting items", e))?;

            let descriptions = enrichment_maps.get(&lens.id).unwrap_or(&empty_map);
            let shapes_for_lens: Vec<_> = config
                .shapes
                .iter()
                .filter(|s| s.lens_id == lens.id)
                .collect();

            let mut shaped_items = Vec::new();
            for item in raw_items.iter().filter(|item| item.passes_evaluations()) {
                let enrichments = resolve_enrichments(item, descriptions);
                let passes = shapes_for_lens.is_empty()
                    || shapes_for_lens
                        .iter()
                        .any(|shape| evaluate_shape(shape, &enrichments));
                if !passes {
                    continue;
                }

                shaped_items.push(ShapedItem {
                    id: item.id.clone(),
                    name: item.display_name().unwrap_or_default().to_string(),
                    url: item.url().unwrap_or_default().to_string(),
                    enrichments: enrichments
                        .iter()
                        .map(|e| {
                            (
                                e.description.clone(),
                                e.result.as_ref().and_then(|r| r.first().cloned()),
                            )
                        })
                        .collect(),
                    created_at: item.created_at,
                });
            }

            lens_results.push(LensResult {
                lens_id: lens.id.clone(),
                collection_id,
                total_items: raw_items.len(),
                shaped_items,
            });
        }
        tracker.track("collect-shape", step_collect);

        if ctx.cancelled() {
            return Ok(None);
        }

        // Join.
        let step_join = Instant::now();
        ctx.progress("joining lenses", 4, TOTAL_STEPS);
        let join_result = join_lens_results(&lens_results, &config.join);
        tracker.track("join", step_join);

        // Signal.
        let step_signal = Instant::now();
        ctx.progress("evaluating signal", 5, TOTAL_STEPS);
        let signal_result = evaluate_signal(&join_result, &config.signal, lens_ids)?;
        tracker.track("signal", step_signal);

        // Snapshot.
        ctx.progress("building snapshot", 6, TOTAL_STEPS);
        let snapshot = build_snapshot(&lens_results, join_result, signal_result);

        // Monitors: initial runs only; failures are collected, not fatal.
        let mut monitor_errors = Vec::new();
        if !is_reeval {
            if let Some(monitor) = &config.monitor {
                let step_monitors = Instant::now();
                ctx.progress("creating monitors", 7, TOTAL_STEPS);

                for lens in &config.lenses {
                    let Some(collection_id) = collection_ids.get(&lens.id) else {
                        continue;
                    };
                    let schedule = crate::collections::ScheduleSpec {
                        cron: monitor.cron.clone(),
                        timezone: monitor.timezone.clone(),
                    };
                    if let Err(err) = ctx.service.create_schedule(collection_id, schedule).await {
                        tracing::warn!(
                            lens = %lens.id,
                            error = %err,
                            "Monitor schedule creation failed"
                        );
                        monitor_errors.push(format!("{}: {err}", lens.id));
                    }
                }
                tracker.track("monitors", step_monitors);
            }
        }

        Ok(Some((lens_results, snapshot, monitor_errors)))
    }
}

fn enrichment_map(collection: &Collection) -> HashMap<String, String> {
    collection
        .enrichments
        .iter()
        .map(|def| (def.id.clone(), def.description.clone()))
        .collect()
}

/// Best-effort remote cancel of collections created this run.
async fn release_collections(ctx: &WorkflowContext, created_ids: &[String]) {
    for collection_id in created_ids {
        if let Err(err) = ctx.service.cancel_collection(collection_id).await {
            tracing::warn!(
                collection = %collection_id,
                error = %err,
                "Best-effort collection release failed"
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collections::EnrichmentDef;

    #[test]
    fn enrichment_map_keys_by_id() {
        let collection = Collection {
            id: "col_1".into(),
            status: crate::collections::CollectionStatus::Idle,
            searches: vec![],
            enrichments: vec![
                EnrichmentDef {
                    id: "enr_1".into(),
                    description: "Open roles count".into(),
                    format: Some("number".into()),
                },
                EnrichmentDef {
                    id: "enr_2".into(),
                    description: "Latest funding".into(),
                    format: None,
                },
            ],
        };
        let map = enrichment_map(&collection);
        assert_eq!(map["enr_1"], "Open roles count");
        assert_eq!(map["enr_2"], "Latest funding");
    }

    #[test]
    fn args_reject_missing_config() {
        let err = serde_json::from_value::<SemanticCronArgs>(json!({})).unwrap_err();
        assert!(err.to_string().contains("config"));
    }

    #[test]
    fn args_accept_minimal_form() {
        let args: SemanticCronArgs = serde_json::from_value(json!({
            "config": { "anything": true },
        }))
        .unwrap();
        assert!(args.variables.is_none());
        assert!(args.existing_collections.is_none());
        assert!(args.previous_snapshot.is_none());
    }
}
