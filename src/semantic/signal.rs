//! Signal rule evaluation over join results.
//!
//! Entity-oriented join results are judged by entity lens membership;
//! evidence-oriented ones by the per-lens evidence list.

use std::collections::HashSet;

use serde::{Deserialize, Serialize};

use crate::error::WorkflowError;
use crate::semantic::join::{JoinResult, JoinedEntity};
use crate::semantic::{SignalConfig, SignalRule};

/// Outcome of applying a signal rule.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SignalResult {
    pub fired: bool,
    /// Lens IDs that satisfied the rule.
    pub satisfied_by: Vec<String>,
    pub rule: SignalRule,
    /// Which `sufficient` combination matched, for the combination rule.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub matched_combination: Option<Vec<String>>,
    /// Names of the entities that satisfied the rule (entity mode only).
    pub entities: Vec<String>,
}

/// Apply the configured firing rule to a join result.
///
/// Combination rules referencing unknown lens IDs fail validation here
/// rather than evaluating to a silent `false`.
pub fn evaluate_signal(
    join: &JoinResult,
    config: &SignalConfig,
    lens_ids: &[String],
) -> Result<SignalResult, WorkflowError> {
    config.validate(lens_ids)?;

    if join.entities.is_empty() {
        Ok(evaluate_with_evidence(join, config, lens_ids))
    } else {
        Ok(evaluate_with_entities(join, config, lens_ids))
    }
}

fn evaluate_with_entities(
    join: &JoinResult,
    config: &SignalConfig,
    lens_ids: &[String],
) -> SignalResult {
    let requires = &config.requires;

    let mut matched_combination = None;
    let matching: Vec<&JoinedEntity> = match requires.rule {
        SignalRule::All => join
            .entities
            .iter()
            .filter(|e| lens_ids.iter().all(|id| e.present_in_lenses.contains(id)))
            .collect(),
        SignalRule::Any => join.entities.iter().collect(),
        SignalRule::Threshold => {
            let min = requires.min.unwrap_or(2);
            join.entities
                .iter()
                .filter(|e| e.lens_count >= min)
                .collect()
        }
        SignalRule::Combination => {
            let combos = requires.sufficient.as_deref().unwrap_or_default();
            let mut matching = Vec::new();
            for combo in combos {
                let covered: Vec<&JoinedEntity> = join
                    .entities
                    .iter()
                    .filter(|e| combo.iter().all(|id| e.present_in_lenses.contains(id)))
                    .collect();
                if !covered.is_empty() {
                    matched_combination = Some(combo.clone());
                    matching = covered;
                    break;
                }
            }
            matching
        }
    };

    let mut seen = HashSet::new();
    let satisfied_by: Vec<String> = matching
        .iter()
        .flat_map(|e| e.present_in_lenses.iter())
        .filter(|id| seen.insert((*id).clone()))
        .cloned()
        .collect();

    SignalResult {
        fired: !matching.is_empty(),
        satisfied_by,
        rule: requires.rule,
        matched_combination,
        entities: matching.iter().map(|e| e.entity.clone()).collect(),
    }
}

fn evaluate_with_evidence(
    join: &JoinResult,
    config: &SignalConfig,
    lens_ids: &[String],
) -> SignalResult {
    let requires = &config.requires;
    let evidence = &join.lenses_with_evidence;

    let mut matched_combination = None;
    let fired = match requires.rule {
        SignalRule::All => lens_ids.iter().all(|id| evidence.contains(id)),
        SignalRule::Any => !evidence.is_empty(),
        SignalRule::Threshold => evidence.len() >= requires.min.unwrap_or(2),
        SignalRule::Combination => {
            let combos = requires.sufficient.as_deref().unwrap_or_default();
            combos
                .iter()
                .find(|combo| combo.iter().all(|id| evidence.contains(id)))
                .inspect(|combo| matched_combination = Some((*combo).clone()))
                .is_some()
        }
    };

    SignalResult {
        fired,
        satisfied_by: evidence.clone(),
        rule: requires.rule,
        matched_combination,
        entities: Vec::new(),
    }
}
