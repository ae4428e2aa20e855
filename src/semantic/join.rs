//! Entity join engine: resolves records observed across lenses into joined
//! entities, or into per-lens evidence for the identity-free strategies.
//!
//! Clusters live in an arena indexed by position, with lens membership as
//! ID sets per cluster; a URL hash index gives exact matches an O(1) fast
//! path before the fuzzy name scan.

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::semantic::{JoinConfig, JoinStrategy, LensResult, MS_PER_DAY};

/// Bigram (Dice) similarity between two strings, case-insensitive.
///
/// Identical strings score 1; non-identical strings shorter than two
/// characters score 0; otherwise
/// `2 × |bigram intersection| / (|bigrams(a)| + |bigrams(b)|)`.
pub fn dice_coefficient(a: &str, b: &str) -> f64 {
    let na = a.trim().to_lowercase();
    let nb = b.trim().to_lowercase();
    if na == nb {
        return 1.0;
    }

    let chars_a: Vec<char> = na.chars().collect();
    let chars_b: Vec<char> = nb.chars().collect();
    if chars_a.len() < 2 || chars_b.len() < 2 {
        return 0.0;
    }

    let bigrams = |chars: &[char]| -> HashSet<(char, char)> {
        chars.windows(2).map(|w| (w[0], w[1])).collect()
    };

    let bigrams_a = bigrams(&chars_a);
    let bigrams_b = bigrams(&chars_b);
    let intersection = bigrams_a.intersection(&bigrams_b).count();

    (2 * intersection) as f64 / (bigrams_a.len() + bigrams_b.len()) as f64
}

/// One physical entity inferred to be present in one or more lenses.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JoinedEntity {
    pub entity: String,
    pub url: String,
    pub present_in_lenses: Vec<String>,
    pub lens_count: usize,
    /// Lens ID → that lens's enrichment values for this entity.
    pub shapes: BTreeMap<String, BTreeMap<String, Option<String>>>,
}

/// Result of joining all lens results under one strategy.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JoinResult {
    #[serde(rename = "type")]
    pub strategy: JoinStrategy,
    /// Populated for the entity-oriented strategies.
    pub entities: Vec<JoinedEntity>,
    /// Populated for the evidence-oriented strategies, and derived from
    /// `entities` for the entity-oriented ones.
    pub lenses_with_evidence: Vec<String>,
}

struct Cluster {
    entity: String,
    url: String,
    lenses: BTreeSet<String>,
    shapes: BTreeMap<String, BTreeMap<String, Option<String>>>,
    timestamps: Vec<(String, DateTime<Utc>)>,
}

/// Join shaped lens results under the configured strategy.
pub fn join_lens_results(lens_results: &[LensResult], config: &JoinConfig) -> JoinResult {
    match config.by {
        JoinStrategy::Cooccurrence => join_by_cooccurrence(lens_results, config.temporal_days()),
        JoinStrategy::Temporal => {
            join_by_temporal(lens_results, config.temporal_days().unwrap_or(7.0))
        }
        JoinStrategy::Entity | JoinStrategy::EntityTemporal => {
            join_by_entity(lens_results, config)
        }
    }
}

fn join_by_entity(lens_results: &[LensResult], config: &JoinConfig) -> JoinResult {
    let threshold = config.name_threshold();

    let mut clusters: Vec<Cluster> = Vec::new();
    let mut url_index: HashMap<String, usize> = HashMap::new();

    for lr in lens_results {
        for item in &lr.shaped_items {
            // Fast path: exact URL match through the index.
            let matched = if !item.url.is_empty() {
                url_index.get(&item.url).copied()
            } else {
                None
            };

            // Slow path: fuzzy name match against each cluster's
            // representative name, first hit wins.
            let matched = matched.or_else(|| {
                if item.name.is_empty() {
                    return None;
                }
                clusters.iter().position(|cluster| {
                    !cluster.entity.is_empty()
                        && dice_coefficient(&item.name, &cluster.entity) > threshold
                })
            });

            match matched {
                Some(index) => {
                    let cluster = &mut clusters[index];
                    cluster.lenses.insert(lr.lens_id.clone());
                    cluster
                        .shapes
                        .insert(lr.lens_id.clone(), item.enrichments.clone());
                    cluster
                        .timestamps
                        .push((lr.lens_id.clone(), item.created_at));
                }
                None => {
                    clusters.push(Cluster {
                        entity: item.name.clone(),
                        url: item.url.clone(),
                        lenses: BTreeSet::from([lr.lens_id.clone()]),
                        shapes: BTreeMap::from([(
                            lr.lens_id.clone(),
                            item.enrichments.clone(),
                        )]),
                        timestamps: vec![(lr.lens_id.clone(), item.created_at)],
                    });
                    if !item.url.is_empty() {
                        url_index.insert(item.url.clone(), clusters.len() - 1);
                    }
                }
            }
        }
    }

    // entity+temporal additionally requires two member items from
    // different lenses within the window.
    if config.by == JoinStrategy::EntityTemporal {
        if let Some(days) = config.temporal_days() {
            clusters.retain(|cluster| has_cross_lens_pair_within(&cluster.timestamps, days));
        }
    }

    let min_overlap = config.min_lens_overlap();
    let entities: Vec<JoinedEntity> = clusters
        .into_iter()
        .filter(|cluster| cluster.lenses.len() >= min_overlap)
        .map(|cluster| JoinedEntity {
            entity: cluster.entity,
            url: cluster.url,
            present_in_lenses: cluster.lenses.iter().cloned().collect(),
            lens_count: cluster.lenses.len(),
            shapes: cluster.shapes,
        })
        .collect();

    let mut seen = HashSet::new();
    let lenses_with_evidence: Vec<String> = entities
        .iter()
        .flat_map(|e| e.present_in_lenses.iter())
        .filter(|lens_id| seen.insert((*lens_id).clone()))
        .cloned()
        .collect();

    JoinResult {
        strategy: config.by,
        entities,
        lenses_with_evidence,
    }
}

fn has_cross_lens_pair_within(timestamps: &[(String, DateTime<Utc>)], days: f64) -> bool {
    let window_ms = days * MS_PER_DAY;
    for (i, (lens_a, time_a)) in timestamps.iter().enumerate() {
        for (lens_b, time_b) in &timestamps[i + 1..] {
            if lens_a != lens_b {
                let diff_ms = (*time_a - *time_b).num_milliseconds().unsigned_abs() as f64;
                if diff_ms <= window_ms {
                    return true;
                }
            }
        }
    }
    false
}

fn join_by_cooccurrence(lens_results: &[LensResult], temporal_days: Option<f64>) -> JoinResult {
    let lenses_with_evidence = match temporal_days {
        Some(days) => {
            let all_timestamps: Vec<(&str, DateTime<Utc>)> = lens_results
                .iter()
                .flat_map(|lr| {
                    lr.shaped_items
                        .iter()
                        .map(|item| (lr.lens_id.as_str(), item.created_at))
                })
                .collect();

            match all_timestamps.iter().map(|(_, t)| *t).min() {
                None => Vec::new(),
                Some(earliest) => {
                    // One-sided window anchored at the earliest timestamp.
                    let window_ms = days * MS_PER_DAY;
                    let mut seen = HashSet::new();
                    all_timestamps
                        .iter()
                        .filter(|(_, time)| {
                            (*time - earliest).num_milliseconds() as f64 <= window_ms
                        })
                        .filter(|(lens_id, _)| seen.insert((*lens_id).to_string()))
                        .map(|(lens_id, _)| (*lens_id).to_string())
                        .collect()
                }
            }
        }
        None => lens_results
            .iter()
            .filter(|lr| !lr.shaped_items.is_empty())
            .map(|lr| lr.lens_id.clone())
            .collect(),
    };

    JoinResult {
        strategy: JoinStrategy::Cooccurrence,
        entities: Vec::new(),
        lenses_with_evidence,
    }
}

fn join_by_temporal(lens_results: &[LensResult], days: f64) -> JoinResult {
    let window_ms = days * MS_PER_DAY;

    let lens_times: Vec<(&str, Vec<DateTime<Utc>>)> = lens_results
        .iter()
        .filter(|lr| !lr.shaped_items.is_empty())
        .map(|lr| {
            (
                lr.lens_id.as_str(),
                lr.shaped_items.iter().map(|item| item.created_at).collect(),
            )
        })
        .collect();

    let mut qualifying: BTreeSet<String> = BTreeSet::new();
    for (i, (lens_a, times_a)) in lens_times.iter().enumerate() {
        for (lens_b, times_b) in &lens_times[i + 1..] {
            if qualifying.contains(*lens_a) && qualifying.contains(*lens_b) {
                continue;
            }

            let pair_found = times_a.iter().any(|ta| {
                times_b
                    .iter()
                    .any(|tb| (*ta - *tb).num_milliseconds().unsigned_abs() as f64 <= window_ms)
            });
            if pair_found {
                qualifying.insert((*lens_a).to_string());
                qualifying.insert((*lens_b).to_string());
            }
        }
    }

    JoinResult {
        strategy: JoinStrategy::Temporal,
        entities: Vec::new(),
        lenses_with_evidence: qualifying.into_iter().collect(),
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use super::*;
    use crate::semantic::ShapedItem;

    fn item(id: &str, name: &str, url: &str, created_at: &str) -> ShapedItem {
        ShapedItem {
            id: id.to_string(),
            name: name.to_string(),
            url: url.to_string(),
            enrichments: BTreeMap::new(),
            created_at: created_at.parse().unwrap(),
        }
    }

    fn lens(lens_id: &str, items: Vec<ShapedItem>) -> LensResult {
        LensResult {
            lens_id: lens_id.to_string(),
            collection_id: format!("col_{lens_id}"),
            total_items: items.len(),
            shaped_items: items,
        }
    }

    fn entity_config() -> JoinConfig {
        JoinConfig {
            by: JoinStrategy::Entity,
            entity_match: None,
            temporal: None,
            min_lens_overlap: None,
        }
    }

    #[test]
    fn dice_identical_strings_score_one() {
        assert_eq!(dice_coefficient("Acme Corp", "Acme Corp"), 1.0);
        assert_eq!(dice_coefficient("ACME corp", "acme CORP"), 1.0);
        assert_eq!(dice_coefficient("a", "a"), 1.0);
    }

    #[test]
    fn dice_is_symmetric() {
        let ab = dice_coefficient("night", "nacht");
        let ba = dice_coefficient("nacht", "night");
        assert_eq!(ab, ba);
    }

    #[test]
    fn dice_short_non_identical_scores_zero() {
        assert_eq!(dice_coefficient("a", "b"), 0.0);
        assert_eq!(dice_coefficient("ab", "x"), 0.0);
    }

    #[test]
    fn dice_decreases_as_shared_bigrams_shrink() {
        let close = dice_coefficient("acme corporation", "acme corp");
        let far = dice_coefficient("acme corporation", "zenith labs");
        assert!(close > far);
        assert!(close > 0.5);
        assert!(far < 0.2);
    }

    #[test]
    fn joins_by_exact_url_regardless_of_name() {
        let results = vec![
            lens(
                "hiring",
                vec![item("1", "Acme Corp", "https://acme.dev", "2026-01-10T00:00:00Z")],
            ),
            lens(
                "funding",
                vec![item(
                    "2",
                    "Totally Different Name",
                    "https://acme.dev",
                    "2026-01-12T00:00:00Z",
                )],
            ),
        ];
        let joined = join_lens_results(&results, &entity_config());
        assert_eq!(joined.entities.len(), 1);
        assert_eq!(joined.entities[0].lens_count, 2);
        assert_eq!(joined.entities[0].url, "https://acme.dev");
    }

    #[test]
    fn joins_by_fuzzy_name_above_threshold() {
        let results = vec![
            lens(
                "hiring",
                vec![item("1", "Acme Corporation", "https://a.example", "2026-01-10T00:00:00Z")],
            ),
            lens(
                "funding",
                vec![item("2", "Acme Corporations", "https://b.example", "2026-01-12T00:00:00Z")],
            ),
        ];
        let joined = join_lens_results(&results, &entity_config());
        assert_eq!(joined.entities.len(), 1);
        assert_eq!(joined.entities[0].present_in_lenses.len(), 2);
    }

    #[test]
    fn dissimilar_items_never_join() {
        let results = vec![
            lens(
                "hiring",
                vec![item("1", "Acme Corp", "https://a.example", "2026-01-10T00:00:00Z")],
            ),
            lens(
                "funding",
                vec![item("2", "Zenith Labs", "https://b.example", "2026-01-12T00:00:00Z")],
            ),
        ];
        let joined = join_lens_results(&results, &entity_config());
        // Both clusters fall below the default min_lens_overlap of 2.
        assert!(joined.entities.is_empty());
        assert!(joined.lenses_with_evidence.is_empty());
    }

    #[test]
    fn min_lens_overlap_discards_single_lens_entities() {
        let results = vec![
            lens(
                "hiring",
                vec![
                    item("1", "Acme Corp", "https://acme.dev", "2026-01-10T00:00:00Z"),
                    item("2", "Solo Co", "https://solo.example", "2026-01-10T00:00:00Z"),
                ],
            ),
            lens(
                "funding",
                vec![item("3", "Acme Corp", "https://acme.dev", "2026-01-12T00:00:00Z")],
            ),
        ];
        let joined = join_lens_results(&results, &entity_config());
        assert_eq!(joined.entities.len(), 1);
        assert_eq!(joined.entities[0].entity, "Acme Corp");

        let mut config = entity_config();
        config.min_lens_overlap = Some(1);
        let joined = join_lens_results(&results, &config);
        assert_eq!(joined.entities.len(), 2);
    }

    #[test]
    fn shapes_are_recorded_per_lens() {
        let mut hiring_item = item("1", "Acme", "https://acme.dev", "2026-01-10T00:00:00Z");
        hiring_item
            .enrichments
            .insert("Open roles count".into(), Some("25".into()));
        let mut funding_item = item("2", "Acme", "https://acme.dev", "2026-01-12T00:00:00Z");
        funding_item
            .enrichments
            .insert("Latest funding".into(), Some("$40M".into()));

        let results = vec![
            lens("hiring", vec![hiring_item]),
            lens("funding", vec![funding_item]),
        ];
        let joined = join_lens_results(&results, &entity_config());
        let entity = &joined.entities[0];
        assert_eq!(
            entity.shapes["hiring"]["Open roles count"],
            Some("25".to_string())
        );
        assert_eq!(
            entity.shapes["funding"]["Latest funding"],
            Some("$40M".to_string())
        );
    }

    #[test]
    fn entity_temporal_requires_cross_lens_pair_within_window() {
        let config = JoinConfig {
            by: JoinStrategy::EntityTemporal,
            entity_match: None,
            temporal: Some(crate::semantic::TemporalWindow { days: Some(7.0) }),
            min_lens_overlap: None,
        };

        // Two days apart: joins.
        let close = vec![
            lens(
                "hiring",
                vec![item("1", "Acme", "https://acme.dev", "2026-01-10T00:00:00Z")],
            ),
            lens(
                "funding",
                vec![item("2", "Acme", "https://acme.dev", "2026-01-12T00:00:00Z")],
            ),
        ];
        assert_eq!(join_lens_results(&close, &config).entities.len(), 1);

        // Five months apart: dropped.
        let far = vec![
            lens(
                "hiring",
                vec![item("1", "Acme", "https://acme.dev", "2026-01-10T00:00:00Z")],
            ),
            lens(
                "funding",
                vec![item("2", "Acme", "https://acme.dev", "2026-06-10T00:00:00Z")],
            ),
        ];
        assert!(join_lens_results(&far, &config).entities.is_empty());
    }

    #[test]
    fn cooccurrence_lists_lenses_with_shaped_items() {
        let results = vec![
            lens("a", vec![item("1", "X", "", "2026-01-15T00:00:00Z")]),
            lens("b", vec![]),
            lens("c", vec![item("2", "Y", "", "2026-01-15T00:00:00Z")]),
        ];
        let config = JoinConfig {
            by: JoinStrategy::Cooccurrence,
            entity_match: None,
            temporal: None,
            min_lens_overlap: None,
        };
        let joined = join_lens_results(&results, &config);
        assert!(joined.entities.is_empty());
        assert_eq!(joined.lenses_with_evidence, vec!["a", "c"]);
    }

    #[test]
    fn cooccurrence_with_window_anchors_at_earliest() {
        let results = vec![
            lens("a", vec![item("1", "X", "", "2026-01-15T00:00:00Z")]),
            lens("b", vec![item("2", "Y", "", "2026-12-01T00:00:00Z")]),
        ];
        let config = JoinConfig {
            by: JoinStrategy::Cooccurrence,
            entity_match: None,
            temporal: Some(crate::semantic::TemporalWindow { days: Some(7.0) }),
            min_lens_overlap: None,
        };
        let joined = join_lens_results(&results, &config);
        assert_eq!(joined.lenses_with_evidence, vec!["a"]);
    }

    #[test]
    fn temporal_pairs_lenses_with_overlapping_timestamps() {
        let results = vec![
            lens("a", vec![item("1", "X", "", "2026-01-15T00:00:00Z")]),
            lens("b", vec![item("2", "Y", "", "2026-01-16T00:00:00Z")]),
            lens("c", vec![item("3", "Z", "", "2026-06-01T00:00:00Z")]),
        ];
        let config = JoinConfig {
            by: JoinStrategy::Temporal,
            entity_match: None,
            temporal: Some(crate::semantic::TemporalWindow { days: Some(7.0) }),
            min_lens_overlap: None,
        };
        let joined = join_lens_results(&results, &config);
        assert!(joined.lenses_with_evidence.contains(&"a".to_string()));
        assert!(joined.lenses_with_evidence.contains(&"b".to_string()));
        assert!(!joined.lenses_with_evidence.contains(&"c".to_string()));
    }

    #[test]
    fn empty_input_produces_empty_result() {
        let config = JoinConfig {
            by: JoinStrategy::Cooccurrence,
            entity_match: None,
            temporal: None,
            min_lens_overlap: None,
        };
        let joined = join_lens_results(&[], &config);
        assert!(joined.entities.is_empty());
        assert!(joined.lenses_with_evidence.is_empty());
    }

    #[test]
    fn url_index_takes_priority_over_name_scan() {
        // Same URL but names far apart: one cluster. A third item whose
        // name matches the first also lands in it via the fuzzy path.
        let results = vec![
            lens(
                "a",
                vec![item("1", "Acme Corporation", "https://acme.dev", "2026-01-10T00:00:00Z")],
            ),
            lens(
                "b",
                vec![item("2", "Unrelated Name", "https://acme.dev", "2026-01-11T00:00:00Z")],
            ),
            lens(
                "c",
                vec![item("3", "Acme Corporations", "", "2026-01-12T00:00:00Z")],
            ),
        ];
        let joined = join_lens_results(&results, &entity_config());
        assert_eq!(joined.entities.len(), 1);
        assert_eq!(joined.entities[0].lens_count, 3);
    }
}
