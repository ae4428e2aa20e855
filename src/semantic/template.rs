//! Template variable expansion over configuration trees.
//!
//! Substitution happens only inside string leaf values, walking the JSON
//! tree directly. A variable value is inserted verbatim into a `String`; it
//! can never introduce keys or otherwise alter structure, so no escaping is
//! needed.

use std::collections::BTreeSet;
use std::sync::LazyLock;

use regex::Regex;
use serde_json::Value;

use crate::error::WorkflowError;

static MARKER: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\{\{[^}]+\}\}").unwrap());

/// Replace every `{{name}}` occurrence in every string leaf of `value` with
/// the corresponding variable. Returns a new tree; the input is untouched.
///
/// Markers still present after substitution — unknown names, or markers in
/// object keys, which are never substituted — fail with the deduplicated
/// list of offenders.
pub fn expand_templates(
    value: &Value,
    variables: &std::collections::HashMap<String, String>,
) -> Result<Value, WorkflowError> {
    // Sorted iteration keeps substitution order deterministic when one
    // variable's value itself contains another marker.
    let mut sorted: Vec<(&String, &String)> = variables.iter().collect();
    sorted.sort_by_key(|(name, _)| name.as_str());

    let expanded = expand_value(value, &sorted);

    let mut unresolved = BTreeSet::new();
    collect_unresolved(&expanded, &mut unresolved);
    if !unresolved.is_empty() {
        return Err(WorkflowError::validation(format!(
            "Unresolved template variables: {}",
            unresolved.into_iter().collect::<Vec<_>>().join(", ")
        )));
    }

    Ok(expanded)
}

fn expand_value(value: &Value, variables: &[(&String, &String)]) -> Value {
    match value {
        Value::String(s) => {
            let mut expanded = s.clone();
            for (name, replacement) in variables {
                let marker = format!("{{{{{name}}}}}");
                if expanded.contains(&marker) {
                    expanded = expanded.replace(&marker, replacement);
                }
            }
            Value::String(expanded)
        }
        Value::Array(items) => Value::Array(
            items
                .iter()
                .map(|item| expand_value(item, variables))
                .collect(),
        ),
        Value::Object(map) => Value::Object(
            map.iter()
                .map(|(key, item)| (key.clone(), expand_value(item, variables)))
                .collect(),
        ),
        other => other.clone(),
    }
}

fn collect_unresolved(value: &Value, out: &mut BTreeSet<String>) {
    match value {
        Value::String(s) => {
            for found in MARKER.find_iter(s) {
                out.insert(found.as_str().to_string());
            }
        }
        Value::Array(items) => {
            for item in items {
                collect_unresolved(item, out);
            }
        }
        Value::Object(map) => {
            for (key, item) in map {
                for found in MARKER.find_iter(key) {
                    out.insert(found.as_str().to_string());
                }
                collect_unresolved(item, out);
            }
        }
        _ => {}
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use serde_json::json;

    use super::*;

    fn vars(pairs: &[(&str, &str)]) -> HashMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn replaces_variables_in_nested_strings() {
        let config = json!({
            "lenses": [{
                "id": "hiring",
                "source": {
                    "query": "{{sector}} companies hiring in {{region}}",
                    "criteria": [{ "description": "Based in {{region}}" }],
                },
            }],
        });
        let expanded = expand_templates(&config, &vars(&[("sector", "fintech"), ("region", "EU")]))
            .unwrap();
        assert_eq!(
            expanded["lenses"][0]["source"]["query"],
            "fintech companies hiring in EU"
        );
        assert_eq!(
            expanded["lenses"][0]["source"]["criteria"][0]["description"],
            "Based in EU"
        );
    }

    #[test]
    fn replaces_multiple_occurrences_of_same_variable() {
        let config = json!({ "query": "{{x}} and {{x}} again" });
        let expanded = expand_templates(&config, &vars(&[("x", "AI")])).unwrap();
        assert_eq!(expanded["query"], "AI and AI again");
    }

    #[test]
    fn fails_on_unresolved_variables_with_deduplicated_list() {
        let config = json!({
            "a": "{{missing}}",
            "b": "{{missing}} and {{also_gone}}",
        });
        let err = expand_templates(&config, &vars(&[])).unwrap_err();
        assert_eq!(err.step, "validate");
        assert_eq!(
            err.message,
            "Unresolved template variables: {{also_gone}}, {{missing}}"
        );
    }

    #[test]
    fn passes_through_without_markers() {
        let config = json!({ "query": "plain", "count": 5, "nested": [true, null] });
        let expanded = expand_templates(&config, &vars(&[("unused", "x")])).unwrap();
        assert_eq!(expanded, config);
    }

    #[test]
    fn does_not_modify_the_input() {
        let config = json!({ "query": "{{x}}" });
        let before = config.clone();
        let _ = expand_templates(&config, &vars(&[("x", "expanded")])).unwrap();
        assert_eq!(config, before);
    }

    #[test]
    fn values_with_quotes_and_backslashes_stay_verbatim() {
        let config = json!({ "query": "find {{q}}" });
        let expanded =
            expand_templates(&config, &vars(&[("q", r#"a "quoted" \ payload"#)])).unwrap();
        assert_eq!(expanded["query"], r#"find a "quoted" \ payload"#);
        // Structure is untouched: still exactly one key.
        assert_eq!(expanded.as_object().unwrap().len(), 1);
    }

    #[test]
    fn markers_in_object_keys_are_reported_not_substituted() {
        let config = json!({ "{{key}}": "value" });
        let err = expand_templates(&config, &vars(&[("key", "replaced")])).unwrap_err();
        assert!(err.message.contains("{{key}}"));
    }
}
