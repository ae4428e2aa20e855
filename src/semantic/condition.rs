//! Condition and shape evaluation over resolved enrichment values.
//!
//! Evaluation fails closed: malformed operands, unparsable values, and
//! oversized or invalid regex patterns all yield `false`, never an error.

use std::collections::HashMap;

use chrono::{DateTime, NaiveDate, Utc};
use regex::Regex;

use crate::collections::RawItem;
use crate::semantic::{Condition, ConditionOperator, MS_PER_DAY, ShapeConfig, ShapeLogic};

/// Longest pattern `matches` will compile. Guards against pathological
/// caller-supplied regexes.
pub const MAX_REGEX_LENGTH: usize = 200;

/// An enrichment value resolved from its ID to its human description.
#[derive(Debug, Clone)]
pub struct ResolvedEnrichment {
    pub description: String,
    pub result: Option<Vec<String>>,
}

/// Map an item's enrichment results through the collection's ID →
/// description table. Results with unknown IDs are dropped.
pub fn resolve_enrichments(
    item: &RawItem,
    descriptions: &HashMap<String, String>,
) -> Vec<ResolvedEnrichment> {
    item.enrichments
        .iter()
        .filter_map(|e| {
            descriptions
                .get(&e.enrichment_id)
                .map(|description| ResolvedEnrichment {
                    description: description.clone(),
                    result: e.result.clone(),
                })
        })
        .collect()
}

/// Evaluate one condition against a resolved enrichment result.
pub fn evaluate_condition(condition: &Condition, result: Option<&[String]>) -> bool {
    if condition.operator == ConditionOperator::Exists {
        return matches!(result, Some(values) if !values.is_empty() && !values[0].is_empty());
    }

    let Some(values) = result else { return false };
    let Some(raw) = values.first() else {
        return false;
    };

    match condition.operator {
        ConditionOperator::Gte
        | ConditionOperator::Gt
        | ConditionOperator::Lte
        | ConditionOperator::Lt
        | ConditionOperator::Eq => {
            let Some(target) = condition.value.as_ref().and_then(serde_json::Value::as_f64)
            else {
                return false;
            };
            let Ok(num) = raw.trim().parse::<f64>() else {
                return false;
            };
            if !num.is_finite() {
                return false;
            }
            match condition.operator {
                ConditionOperator::Gte => num >= target,
                ConditionOperator::Gt => num > target,
                ConditionOperator::Lte => num <= target,
                ConditionOperator::Lt => num < target,
                ConditionOperator::Eq => num == target,
                _ => false,
            }
        }
        ConditionOperator::Contains => {
            let Some(needle) = condition.value.as_ref().and_then(serde_json::Value::as_str)
            else {
                return false;
            };
            raw.to_lowercase().contains(&needle.to_lowercase())
        }
        ConditionOperator::Matches => {
            let Some(pattern) = condition.value.as_ref().and_then(serde_json::Value::as_str)
            else {
                return false;
            };
            if pattern.len() > MAX_REGEX_LENGTH {
                return false;
            }
            match Regex::new(pattern) {
                Ok(re) => re.is_match(raw),
                Err(_) => false,
            }
        }
        ConditionOperator::OneOf => {
            let Some(options) = condition.value.as_ref().and_then(serde_json::Value::as_array)
            else {
                return false;
            };
            let raw_lower = raw.to_lowercase();
            options
                .iter()
                .filter_map(|opt| opt.as_str())
                .any(|opt| opt.to_lowercase() == raw_lower)
        }
        ConditionOperator::WithinDays => {
            let Some(days) = condition.value.as_ref().and_then(serde_json::Value::as_f64)
            else {
                return false;
            };
            let Some(parsed) = parse_timestamp(raw) else {
                return false;
            };
            let elapsed_ms = (Utc::now() - parsed).num_milliseconds().unsigned_abs() as f64;
            elapsed_ms <= days * MS_PER_DAY
        }
        ConditionOperator::Exists => unreachable!("handled above"),
    }
}

/// Evaluate a shape: each condition looks up its enrichment by description,
/// then the results reduce with the shape's logic. `all` over zero
/// conditions is vacuously true.
pub fn evaluate_shape(shape: &ShapeConfig, enrichments: &[ResolvedEnrichment]) -> bool {
    let mut results = shape.conditions.iter().map(|condition| {
        let resolved = enrichments
            .iter()
            .find(|e| e.description == condition.enrichment);
        evaluate_condition(condition, resolved.and_then(|e| e.result.as_deref()))
    });

    match shape.logic {
        ShapeLogic::All => results.all(|passed| passed),
        ShapeLogic::Any => results.any(|passed| passed),
    }
}

fn parse_timestamp(raw: &str) -> Option<DateTime<Utc>> {
    if let Ok(parsed) = DateTime::parse_from_rfc3339(raw) {
        return Some(parsed.with_timezone(&Utc));
    }
    // Bare dates are common in enrichment output.
    NaiveDate::parse_from_str(raw, "%Y-%m-%d")
        .ok()
        .and_then(|date| date.and_hms_opt(0, 0, 0))
        .map(|naive| naive.and_utc())
}
