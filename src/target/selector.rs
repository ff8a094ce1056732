/* Copyright (C) 2025 Pedro Henrique / phkaiser13
* File: src/target/selector.rs
* Label selector evaluation. The matcher evaluates `LabelSelector`s from
* bundle targets, target restrictions, rollout partitions, and cluster
* groups against object label maps. The operator set is closed (In, NotIn,
* Exists, DoesNotExist); anything else is a targeting error surfaced on the
* owning bundle rather than silently matching nothing.
* SPDX-License-Identifier: Apache-2.0 */

use k8s_openapi::apimachinery::pkg::apis::meta::v1::LabelSelector;
use std::collections::BTreeMap;

use crate::error::{Error, Result};

/// Evaluate `selector` against `labels`. An empty selector (no terms at
/// all) matches everything, matching the Kubernetes convention.
pub fn matches(selector: &LabelSelector, labels: &BTreeMap<String, String>) -> Result<bool> {
    if let Some(match_labels) = &selector.match_labels {
        for (key, value) in match_labels {
            if labels.get(key) != Some(value) {
                return Ok(false);
            }
        }
    }

    if let Some(expressions) = &selector.match_expressions {
        for expr in expressions {
            let actual = labels.get(&expr.key);
            let values = expr.values.clone().unwrap_or_default();
            let matched = match expr.operator.as_str() {
                "In" => {
                    if values.is_empty() {
                        return Err(Error::TargetingError(format!(
                            "selector key {:?}: operator In requires values",
                            expr.key
                        )));
                    }
                    actual.map(|v| values.iter().any(|c| c == v)).unwrap_or(false)
                }
                "NotIn" => {
                    if values.is_empty() {
                        return Err(Error::TargetingError(format!(
                            "selector key {:?}: operator NotIn requires values",
                            expr.key
                        )));
                    }
                    actual.map(|v| values.iter().all(|c| c != v)).unwrap_or(true)
                }
                "Exists" => actual.is_some(),
                "DoesNotExist" => actual.is_none(),
                other => {
                    return Err(Error::TargetingError(format!(
                        "selector key {:?}: unknown operator {other:?}",
                        expr.key
                    )))
                }
            };
            if !matched {
                return Ok(false);
            }
        }
    }

    Ok(true)
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::LabelSelectorRequirement;

    fn labels(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    fn expr(key: &str, op: &str, values: &[&str]) -> LabelSelectorRequirement {
        LabelSelectorRequirement {
            key: key.to_string(),
            operator: op.to_string(),
            values: if values.is_empty() {
                None
            } else {
                Some(values.iter().map(|v| v.to_string()).collect())
            },
        }
    }

    #[test]
    fn empty_selector_matches_all() {
        let selector = LabelSelector::default();
        assert!(matches(&selector, &labels(&[("env", "prod")])).unwrap());
        assert!(matches(&selector, &BTreeMap::new()).unwrap());
    }

    #[test]
    fn match_labels_is_conjunctive() {
        let selector = LabelSelector {
            match_labels: Some(labels(&[("env", "prod"), ("region", "eu")])),
            match_expressions: None,
        };
        assert!(matches(&selector, &labels(&[("env", "prod"), ("region", "eu")])).unwrap());
        assert!(!matches(&selector, &labels(&[("env", "prod")])).unwrap());
    }

    #[test]
    fn expressions() {
        let sel = |e| LabelSelector {
            match_labels: None,
            match_expressions: Some(vec![e]),
        };

        assert!(matches(&sel(expr("env", "In", &["prod", "stage"])), &labels(&[("env", "prod")]))
            .unwrap());
        assert!(!matches(&sel(expr("env", "NotIn", &["prod"])), &labels(&[("env", "prod")]))
            .unwrap());
        // NotIn matches when the key is absent.
        assert!(matches(&sel(expr("env", "NotIn", &["prod"])), &BTreeMap::new()).unwrap());
        assert!(matches(&sel(expr("env", "Exists", &[])), &labels(&[("env", "prod")])).unwrap());
        assert!(matches(&sel(expr("env", "DoesNotExist", &[])), &BTreeMap::new()).unwrap());
    }

    #[test]
    fn unknown_operator_is_a_targeting_error() {
        let selector = LabelSelector {
            match_labels: None,
            match_expressions: Some(vec![expr("env", "Near", &["prod"])]),
        };
        let err = matches(&selector, &BTreeMap::new()).unwrap_err();
        assert!(matches!(err, Error::TargetingError(_)));
    }
}
