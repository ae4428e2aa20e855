//! Evaluation snapshots and the delta between two of them.
//!
//! A snapshot is the durable, caller-retained artifact of one evaluation;
//! passing it back in on the next run enables change detection. Both
//! structures are pure outputs, immutable once built.

use std::collections::{BTreeMap, HashSet};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::semantic::LensResult;
use crate::semantic::join::JoinResult;
use crate::semantic::signal::SignalResult;

/// One shaped item as retained in a snapshot.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SnapshotShape {
    pub name: String,
    pub url: String,
    pub enrichments: BTreeMap<String, Option<String>>,
}

/// Per-lens evaluation summary.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SnapshotLens {
    pub collection_id: String,
    pub total_items: usize,
    pub shaped_count: usize,
    pub shapes: Vec<SnapshotShape>,
}

/// The full artifact of one evaluation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Snapshot {
    pub evaluated_at: DateTime<Utc>,
    pub lenses: BTreeMap<String, SnapshotLens>,
    pub join: JoinResult,
    pub signal: SignalResult,
}

/// How the signal changed between two evaluations.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SignalTransition {
    pub was: bool,
    pub now: bool,
    pub changed: bool,
    pub new_entities: Vec<String>,
    pub lost_entities: Vec<String>,
}

/// What changed between two evaluation snapshots.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Delta {
    /// Per-lens count of newly shaped items; never negative — a shrink
    /// reports zero.
    pub new_shaped_items: BTreeMap<String, usize>,
    pub new_joins: Vec<String>,
    pub lost_joins: Vec<String>,
    pub signal_transition: SignalTransition,
    /// Compact elapsed rendering, e.g. `"7d 2h 30m"`.
    pub time_since_last_eval: String,
}

/// Assemble the snapshot for one finished evaluation.
pub fn build_snapshot(
    lens_results: &[LensResult],
    join: JoinResult,
    signal: SignalResult,
) -> Snapshot {
    let lenses = lens_results
        .iter()
        .map(|lr| {
            (
                lr.lens_id.clone(),
                SnapshotLens {
                    collection_id: lr.collection_id.clone(),
                    total_items: lr.total_items,
                    shaped_count: lr.shaped_items.len(),
                    shapes: lr
                        .shaped_items
                        .iter()
                        .map(|item| SnapshotShape {
                            name: item.name.clone(),
                            url: item.url.clone(),
                            enrichments: item.enrichments.clone(),
                        })
                        .collect(),
                },
            )
        })
        .collect();

    Snapshot {
        evaluated_at: Utc::now(),
        lenses,
        join,
        signal,
    }
}

/// Diff two snapshots. Pure function of its inputs.
pub fn compute_delta(current: &Snapshot, previous: &Snapshot) -> Delta {
    let mut new_shaped_items = BTreeMap::new();
    for (lens_id, lens) in &current.lenses {
        let prev_count = previous
            .lenses
            .get(lens_id)
            .map(|l| l.shaped_count)
            .unwrap_or(0);
        new_shaped_items.insert(
            lens_id.clone(),
            lens.shaped_count.saturating_sub(prev_count),
        );
    }

    // Entity identity: URL when present, else name.
    let entity_key = |e: &crate::semantic::join::JoinedEntity| {
        if e.url.is_empty() {
            e.entity.clone()
        } else {
            e.url.clone()
        }
    };
    let current_keys: Vec<String> = current.join.entities.iter().map(entity_key).collect();
    let previous_keys: Vec<String> = previous.join.entities.iter().map(entity_key).collect();
    let current_set: HashSet<&String> = current_keys.iter().collect();
    let previous_set: HashSet<&String> = previous_keys.iter().collect();

    let new_joins = current_keys
        .iter()
        .filter(|k| !previous_set.contains(k))
        .cloned()
        .collect();
    let lost_joins = previous_keys
        .iter()
        .filter(|k| !current_set.contains(k))
        .cloned()
        .collect();

    let current_names: HashSet<&String> = current.signal.entities.iter().collect();
    let previous_names: HashSet<&String> = previous.signal.entities.iter().collect();
    let signal_transition = SignalTransition {
        was: previous.signal.fired,
        now: current.signal.fired,
        changed: previous.signal.fired != current.signal.fired,
        new_entities: current
            .signal
            .entities
            .iter()
            .filter(|n| !previous_names.contains(n))
            .cloned()
            .collect(),
        lost_entities: previous
            .signal
            .entities
            .iter()
            .filter(|n| !current_names.contains(n))
            .cloned()
            .collect(),
    };

    let elapsed_ms = (current.evaluated_at - previous.evaluated_at).num_milliseconds();
    Delta {
        new_shaped_items,
        new_joins,
        lost_joins,
        signal_transition,
        time_since_last_eval: format_duration(elapsed_ms),
    }
}

/// Render elapsed milliseconds as `"7d 2h 30m"`, omitting zero-valued
/// leading units and always showing minutes when everything else is zero.
pub fn format_duration(ms: i64) -> String {
    let total_minutes = (ms / 60_000).max(0);
    let days = total_minutes / 1440;
    let hours = (total_minutes % 1440) / 60;
    let minutes = total_minutes % 60;

    let mut parts = Vec::new();
    if days > 0 {
        parts.push(format!("{days}d"));
    }
    if hours > 0 {
        parts.push(format!("{hours}h"));
    }
    if minutes > 0 || parts.is_empty() {
        parts.push(format!("{minutes}m"));
    }
    parts.join(" ")
}
