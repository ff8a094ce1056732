/* Copyright (C) 2025 Pedro Henrique / phkaiser13
* File: src/options.rs
* Deployment-option merging and hashing. The matcher merges a target's
* option overlay over the bundle defaults with a deep, left-biased merge:
* maps merge key-wise with the overlay winning, arrays replace wholesale.
* The merged options are hashed into the second half of the deployment ID,
* `<contentDigest>:<optionsHash>`, so spec-equivalent no-ops are detected
* by string comparison alone.
* SPDX-License-Identifier: Apache-2.0 */

use serde_json::Value;
use sha2::{Digest, Sha256};

use crate::crds::BundleDeploymentOptions;
use crate::error::{Error, Result};

/// Deep, left-biased merge: `overlay` wins over `base`. Objects merge
/// key-wise; every other value type (arrays included) replaces.
pub fn merge_values(base: Value, overlay: Value) -> Value {
    match (base, overlay) {
        (Value::Object(mut base_map), Value::Object(overlay_map)) => {
            for (key, overlay_val) in overlay_map {
                let merged = match base_map.remove(&key) {
                    Some(base_val) => merge_values(base_val, overlay_val),
                    None => overlay_val,
                };
                base_map.insert(key, merged);
            }
            Value::Object(base_map)
        }
        (_, overlay) => overlay,
    }
}

/// Merge a target overlay over the bundle default options.
pub fn merge_options(
    default: &BundleDeploymentOptions,
    overlay: Option<&BundleDeploymentOptions>,
) -> Result<BundleDeploymentOptions> {
    let Some(overlay) = overlay else {
        return Ok(default.clone());
    };
    let base = serde_json::to_value(default)?;
    let over = serde_json::to_value(overlay)?;
    let merged = merge_values(base, over);
    Ok(serde_json::from_value(merged)?)
}

/// Digest of the canonical JSON of the options. serde_json's default map
/// keeps keys sorted, and struct fields serialize in declaration order, so
/// the serialization is stable across invocations.
pub fn options_hash(options: &BundleDeploymentOptions) -> Result<String> {
    let bytes = serde_json::to_vec(options)?;
    let mut hasher = Sha256::new();
    hasher.update(&bytes);
    Ok(hex::encode(hasher.finalize()))
}

/// `<contentDigest>:<optionsHash>`; equality means "spec-equivalent".
pub fn deployment_id(content_digest: &str, options: &BundleDeploymentOptions) -> Result<String> {
    Ok(format!("{}:{}", content_digest, options_hash(options)?))
}

/// Extract the Helm values bytes carried by a set of options, if any.
/// These become the `values` / `stagedValues` keys of the per-deployment
/// options secret.
pub fn values_bytes(options: &BundleDeploymentOptions) -> Result<Option<Vec<u8>>> {
    match options.helm.as_ref().and_then(|h| h.values.as_ref()) {
        Some(values) if !values.is_empty() => Ok(Some(serde_json::to_vec(values)?)),
        _ => Ok(None),
    }
}

/// Digest used as `valuesHash` on the deployment spec and checked against
/// the per-bundle values secret.
pub fn hash_bytes(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hex::encode(hasher.finalize())
}

/// Splice values from the per-bundle values secret back into an in-memory
/// copy of the options, verifying the digest recorded on the bundle spec.
pub fn splice_values(
    options: &mut BundleDeploymentOptions,
    secret_values: &[u8],
    expected_hash: &str,
) -> Result<()> {
    let actual = hash_bytes(secret_values);
    if actual != expected_hash {
        return Err(Error::ValuesHashMismatch(format!(
            "digest {actual} does not match spec.valuesHash {expected_hash}"
        )));
    }
    let parsed: std::collections::BTreeMap<String, Value> = serde_json::from_slice(secret_values)?;
    options.helm.get_or_insert_with(Default::default).values = Some(parsed);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crds::HelmOptions;
    use serde_json::json;

    fn options_with_values(values: Value) -> BundleDeploymentOptions {
        let map = values
            .as_object()
            .expect("object")
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        BundleDeploymentOptions {
            helm: Some(HelmOptions {
                values: Some(map),
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    #[test]
    fn overlay_wins_and_maps_merge_keywise() {
        let base = options_with_values(json!({
            "replicas": "4",
            "image": {"tag": "v1", "pullPolicy": "IfNotPresent"},
            "args": ["a", "b"],
        }));
        let overlay = options_with_values(json!({
            "replicas": "1",
            "image": {"tag": "v2"},
            "args": ["c"],
        }));

        let merged = merge_options(&base, Some(&overlay)).unwrap();
        let values = merged.helm.unwrap().values.unwrap();
        assert_eq!(values["replicas"], json!("1"));
        // Maps merge key-wise: untouched keys survive, overlay keys win.
        assert_eq!(values["image"], json!({"tag": "v2", "pullPolicy": "IfNotPresent"}));
        // Arrays replace.
        assert_eq!(values["args"], json!(["c"]));
    }

    #[test]
    fn no_overlay_is_identity() {
        let base = options_with_values(json!({"replicas": "4"}));
        let merged = merge_options(&base, None).unwrap();
        assert_eq!(merged, base);
    }

    #[test]
    fn deployment_id_is_deterministic_and_options_sensitive() {
        let a = options_with_values(json!({"replicas": "4"}));
        let b = options_with_values(json!({"replicas": "1"}));

        let id_a1 = deployment_id("s-abc", &a).unwrap();
        let id_a2 = deployment_id("s-abc", &a).unwrap();
        let id_b = deployment_id("s-abc", &b).unwrap();

        assert_eq!(id_a1, id_a2);
        assert_ne!(id_a1, id_b);
        assert!(id_a1.starts_with("s-abc:"));
    }

    #[test]
    fn splice_rejects_hash_mismatch() {
        let mut options = BundleDeploymentOptions::default();
        let bytes = serde_json::to_vec(&json!({"replicas": "2"})).unwrap();
        let err = splice_values(&mut options, &bytes, "deadbeef").unwrap_err();
        assert!(matches!(err, Error::ValuesHashMismatch(_)));

        let good = hash_bytes(&bytes);
        splice_values(&mut options, &bytes, &good).unwrap();
        assert_eq!(
            options.helm.unwrap().values.unwrap()["replicas"],
            json!("2")
        );
    }
}
