//! Semantic cron engine: multi-lens entity resolution, signal rules, and
//! change detection over evaluation snapshots.
//!
//! A run watches several independently-sourced *lenses* (e.g. "hiring",
//! "funding", "patents"), keeps only items matching each lens's *shape*,
//! joins the survivors into entities seen across lenses, and fires a
//! *signal* when the configured rule is met. Re-evaluating against a prior
//! snapshot yields a *delta* of what changed.

pub mod condition;
pub mod join;
pub mod signal;
pub mod snapshot;
pub mod template;
pub mod workflow;

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::collections::{Criterion, EnrichmentSpec, EntityKind};
use crate::error::WorkflowError;

/// Hard limit on lenses per run.
pub const MAX_LENSES: usize = 10;
/// Hard limit on conditions per shape.
pub const MAX_CONDITIONS_PER_SHAPE: usize = 20;

pub(crate) const MS_PER_DAY: f64 = 86_400_000.0;

/// Full configuration for one semantic cron run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SemanticCronConfig {
    pub lenses: Vec<LensConfig>,
    pub shapes: Vec<ShapeConfig>,
    pub join: JoinConfig,
    pub signal: SignalConfig,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub monitor: Option<MonitorConfig>,
}

/// One named source the run watches.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LensConfig {
    pub id: String,
    pub source: LensSource,
}

/// Where a lens's items come from: a fresh query, or an existing
/// collection.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LensSource {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub query: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub collection_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub entity: Option<EntityKind>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub criteria: Vec<Criterion>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub enrichments: Vec<EnrichmentSpec>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub count: Option<u32>,
}

/// How a shape's condition results are combined.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ShapeLogic {
    #[default]
    All,
    Any,
}

/// A predicate over one lens's resolved enrichment values.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ShapeConfig {
    pub lens_id: String,
    pub conditions: Vec<Condition>,
    #[serde(default)]
    pub logic: ShapeLogic,
}

/// Comparison operator in a shape condition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ConditionOperator {
    Gte,
    Gt,
    Lte,
    Lt,
    Eq,
    Contains,
    Matches,
    OneOf,
    Exists,
    WithinDays,
}

/// One comparison against a named enrichment.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Condition {
    /// Enrichment description to look up on the item.
    pub enrichment: String,
    pub operator: ConditionOperator,
    /// Comparison operand; the expected JSON type depends on the operator.
    /// A value of the wrong type makes the condition evaluate to `false`
    /// rather than erroring.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<serde_json::Value>,
}

/// Join strategy across lenses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JoinStrategy {
    Entity,
    #[serde(rename = "entity+temporal")]
    EntityTemporal,
    Temporal,
    Cooccurrence,
}

impl std::fmt::Display for JoinStrategy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Entity => "entity",
            Self::EntityTemporal => "entity+temporal",
            Self::Temporal => "temporal",
            Self::Cooccurrence => "cooccurrence",
        };
        write!(f, "{s}")
    }
}

/// Fuzzy entity-match tuning.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct EntityMatch {
    /// Dice-coefficient threshold above which two names are the same
    /// entity. Defaults to 0.85.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name_threshold: Option<f64>,
}

/// Temporal proximity window.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct TemporalWindow {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub days: Option<f64>,
}

/// How lens results are joined into entities or evidence.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JoinConfig {
    pub by: JoinStrategy,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub entity_match: Option<EntityMatch>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub temporal: Option<TemporalWindow>,
    /// Entities seen in fewer lenses than this are dropped. Defaults to 2.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub min_lens_overlap: Option<usize>,
}

impl JoinConfig {
    pub(crate) fn name_threshold(&self) -> f64 {
        self.entity_match
            .and_then(|m| m.name_threshold)
            .unwrap_or(0.85)
    }

    pub(crate) fn min_lens_overlap(&self) -> usize {
        self.min_lens_overlap.unwrap_or(2)
    }

    pub(crate) fn temporal_days(&self) -> Option<f64> {
        self.temporal.and_then(|t| t.days)
    }
}

/// Signal firing rule.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SignalRule {
    All,
    Any,
    Threshold,
    Combination,
}

/// The firing requirement for a signal.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SignalRequires {
    #[serde(rename = "type")]
    pub rule: SignalRule,
    /// Minimum lens count for `threshold`. Defaults to 2.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub min: Option<usize>,
    /// Lens-ID combinations for `combination`, tried in order.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sufficient: Option<Vec<Vec<String>>>,
}

/// Signal configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SignalConfig {
    pub requires: SignalRequires,
}

impl SignalConfig {
    /// Fail-fast check that every lens ID referenced in a combination rule
    /// is a configured lens.
    pub fn validate(&self, lens_ids: &[String]) -> Result<(), WorkflowError> {
        if self.requires.rule != SignalRule::Combination {
            return Ok(());
        }
        let Some(combos) = self
            .requires
            .sufficient
            .as_ref()
            .filter(|c| !c.is_empty())
        else {
            return Err(WorkflowError::validation(
                "signal.requires.sufficient must be provided for combination type",
            ));
        };
        for combo in combos {
            for lens_id in combo {
                if !lens_ids.contains(lens_id) {
                    return Err(WorkflowError::validation(format!(
                        "Unknown lens ID \"{lens_id}\" in signal.requires.sufficient. Available: {}",
                        lens_ids.join(", ")
                    )));
                }
            }
        }
        Ok(())
    }
}

/// Recurring remote refresh for created collections.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MonitorConfig {
    pub cron: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timezone: Option<String>,
}

impl SemanticCronConfig {
    pub fn lens_ids(&self) -> Vec<String> {
        self.lenses.iter().map(|l| l.id.clone()).collect()
    }

    /// Deterministic input validation, run before any remote call.
    pub fn validate(&self) -> Result<(), WorkflowError> {
        if self.lenses.is_empty() {
            return Err(WorkflowError::validation(
                "config.lenses is required and must be non-empty",
            ));
        }
        if self.lenses.len() > MAX_LENSES {
            return Err(WorkflowError::validation(format!(
                "Maximum {MAX_LENSES} lenses allowed (got {})",
                self.lenses.len()
            )));
        }
        if self.shapes.is_empty() {
            return Err(WorkflowError::validation(
                "config.shapes is required and must be non-empty",
            ));
        }

        for lens in &self.lenses {
            if lens.source.query.is_none() && lens.source.collection_id.is_none() {
                return Err(WorkflowError::validation(format!(
                    "Lens \"{}\" requires source.query or source.collection_id",
                    lens.id
                )));
            }
        }

        let lens_ids = self.lens_ids();
        for shape in &self.shapes {
            if !lens_ids.contains(&shape.lens_id) {
                return Err(WorkflowError::validation(format!(
                    "Shape references unknown lens \"{}\". Available: {}",
                    shape.lens_id,
                    lens_ids.join(", ")
                )));
            }
            if shape.conditions.len() > MAX_CONDITIONS_PER_SHAPE {
                return Err(WorkflowError::validation(format!(
                    "Maximum {MAX_CONDITIONS_PER_SHAPE} conditions per shape (got {})",
                    shape.conditions.len()
                )));
            }
        }

        self.signal.validate(&lens_ids)
    }
}

/// A record that passed its lens's shapes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ShapedItem {
    pub id: String,
    pub name: String,
    pub url: String,
    /// Enrichment description → first result value.
    pub enrichments: BTreeMap<String, Option<String>>,
    pub created_at: DateTime<Utc>,
}

/// Everything collected for one lens in one evaluation.
#[derive(Debug, Clone)]
pub struct LensResult {
    pub lens_id: String,
    pub collection_id: String,
    pub total_items: usize,
    pub shaped_items: Vec<ShapedItem>,
}
