/*
 * Copyright (C) 2025 Pedro Henrique / phkaiser13
 *
 * File: helmop_controller.rs
 *
 * The HelmOp reconciler. A HelmOp is the chart-coordinate twin of a
 * GitRepo: instead of cloning, it resolves the configured version (which
 * may be a SemVer range) against the chart repository index and authors a
 * single bundle whose options carry the strict version for the agents'
 * server-side pull. The bundle reconciler refuses to deploy until the
 * version is strict, so resolution failures stay visible on the HelmOp.
 *
 * SPDX-License-Identifier: Apache-2.0
 */

use chrono::Utc;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::Time;
use kube::api::{Api, ObjectMeta, Patch, PatchParams, PostParams};
use kube::runtime::controller::Action;
use kube::ResourceExt;
use serde::Deserialize;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

use super::{ensure_finalizer, patch_status, remove_finalizer, required_namespace, warn_event, Context};
use crate::crds::condition::{set_condition, Condition, CONDITION_READY};
use crate::crds::{
    Bundle, BundleHelmOptions, BundleSpec, HelmOp, HelmOptions, HELMOP_FINALIZER, REPO_LABEL,
};
use crate::duration::parse_or_default;
use crate::error::{Error, Result};
use crate::metrics;
use crate::summary;
use crate::purge;

const DEFAULT_POLLING_INTERVAL: Duration = Duration::from_secs(15 * 60);
const DELETE_REQUEUE: Duration = Duration::from_secs(2);

/// Slice of a Helm repository index we care about.
#[derive(Deserialize, Debug)]
struct HelmIndex {
    #[serde(default)]
    entries: BTreeMap<String, Vec<HelmIndexEntry>>,
}

#[derive(Deserialize, Debug)]
struct HelmIndexEntry {
    #[serde(default)]
    version: String,
}

pub async fn reconcile(op: Arc<HelmOp>, ctx: Arc<Context>) -> Result<Action> {
    metrics::RECONCILE_TOTAL.with_label_values(&["helmop"]).inc();

    let namespace = required_namespace(op.as_ref())?;
    let name = op.name_any();
    let api: Api<HelmOp> = Api::namespaced(ctx.client.clone(), &namespace);

    if op.metadata.deletion_timestamp.is_some() {
        return cleanup(&op, &namespace, &ctx).await;
    }

    if ensure_finalizer(&api, op.as_ref(), HELMOP_FINALIZER).await? {
        return Ok(Action::await_change());
    }

    let mut status = op.status.clone().unwrap_or_default();
    let interval = parse_or_default(op.spec.polling_interval.as_deref(), DEFAULT_POLLING_INTERVAL);

    // Resolve the version when due: spec change, no resolution yet, or the
    // re-resolve cadence elapsed (a range can acquire new releases).
    let due = status.version.is_none()
        || status.observed_generation != op.metadata.generation
        || status
            .last_polling_time
            .as_ref()
            .and_then(|t| Utc::now().signed_duration_since(t.0).to_std().ok())
            .map(|elapsed| elapsed >= interval)
            .unwrap_or(true);

    if due {
        status.last_polling_time = Some(Time(Utc::now()));
        match resolve_version(&op).await {
            Ok(version) => {
                if status.version.as_deref() != Some(version.as_str()) {
                    info!("helmop {namespace}/{name} resolved chart version {version}");
                }
                status.version = Some(version);
            }
            Err(err) => {
                set_condition(
                    &mut status.conditions,
                    Condition::new_false(CONDITION_READY, "VersionResolution", &err.to_string()),
                );
                status.observed_generation = op.metadata.generation;
                patch_status(&api, &name, &status).await?;
                warn_event(&ctx, op.as_ref(), "FailedToResolveVersion", err.to_string()).await;
                return Ok(Action::requeue(interval));
            }
        }
    }

    if let Some(version) = status.version.clone() {
        converge_bundle(&ctx, &op, &version).await?;
    }

    // Fold the child bundle into the source rollup.
    let bundles = purge::owned_bundles(&ctx.client, &namespace, &name).await?;
    let (folded, desired_ready, ready) = summary::fold_source(&bundles);
    status.summary = folded;
    status.desired_ready_clusters = desired_ready;
    status.ready_clusters = ready;
    status.display.ready_clusters = Some(format!("{ready}/{desired_ready}"));
    let worst = summary::worst_bundle_state(&bundles);
    status.display.state = worst.map(|s| s.to_string());

    if worst.is_none() && status.version.is_some() {
        set_condition(&mut status.conditions, Condition::new_true(CONDITION_READY));
    }
    status.observed_generation = op.metadata.generation;

    let changed = op
        .status
        .as_ref()
        .map(|old| serde_json::to_value(old).ok() != serde_json::to_value(&status).ok())
        .unwrap_or(true);
    if changed {
        patch_status(&api, &name, &status).await?;
    }

    Ok(Action::requeue(interval))
}

pub fn error_policy(_op: Arc<HelmOp>, error: &Error, _ctx: Arc<Context>) -> Action {
    metrics::RECONCILE_ERRORS.with_label_values(&["helmop"]).inc();
    warn!("helmop reconciliation failed: {error:?}");
    Action::requeue(Duration::from_secs(5))
}

/// Resolve the spec version against the repository index. Exact versions
/// pass through; ranges pick the highest matching release.
async fn resolve_version(op: &HelmOp) -> Result<String> {
    let requested = op.spec.version.clone().unwrap_or_default();
    let requested = requested.trim();

    if !requested.is_empty() {
        if let Ok(exact) = semver::Version::parse(requested.trim_start_matches('v')) {
            return Ok(exact.to_string());
        }
    }

    let requirement = if requested.is_empty() || requested == "*" {
        None
    } else {
        Some(semver::VersionReq::parse(requested).map_err(|e| {
            Error::UserInputError(format!("invalid version range {requested:?}: {e}"))
        })?)
    };

    let index = fetch_index(op).await?;
    let entries = index.entries.get(&op.spec.chart).ok_or_else(|| {
        Error::RetryableError(format!(
            "chart {:?} not found in repository index",
            op.spec.chart
        ))
    })?;

    let mut best: Option<semver::Version> = None;
    for entry in entries {
        let Ok(version) = semver::Version::parse(entry.version.trim_start_matches('v')) else {
            continue;
        };
        if let Some(req) = &requirement {
            if !req.matches(&version) {
                continue;
            }
        }
        best = Some(match best {
            Some(current) if current >= version => current,
            _ => version,
        });
    }

    best.map(|v| v.to_string()).ok_or_else(|| {
        Error::RetryableError(format!(
            "no release of {:?} matches {requested:?}",
            op.spec.chart
        ))
    })
}

async fn fetch_index(op: &HelmOp) -> Result<HelmIndex> {
    let mut builder = reqwest::Client::builder();
    if op.spec.insecure_skip_tls_verify {
        builder = builder.danger_accept_invalid_certs(true);
    }
    let client = builder
        .build()
        .map_err(|e| Error::RetryableError(format!("http client construction failed: {e}")))?;

    let url = format!("{}/index.yaml", op.spec.repo.trim_end_matches('/'));
    let response = client
        .get(&url)
        .send()
        .await
        .map_err(|e| Error::RetryableError(format!("index fetch failed: {e}")))?;
    if !response.status().is_success() {
        return Err(Error::RetryableError(format!(
            "index fetch returned {}",
            response.status()
        )));
    }
    let body = response
        .text()
        .await
        .map_err(|e| Error::RetryableError(format!("index read failed: {e}")))?;
    serde_yaml::from_str(&body)
        .map_err(|e| Error::UserInputError(format!("malformed repository index: {e}")))
}

/// Author (or refresh) the single bundle of this HelmOp.
async fn converge_bundle(ctx: &Context, op: &HelmOp, version: &str) -> Result<()> {
    let namespace = op.namespace().unwrap_or_default();
    let name = op.name_any();
    let api: Api<Bundle> = Api::namespaced(ctx.client.clone(), &namespace);

    let spec = BundleSpec {
        // The agent pulls the chart itself; the contents pointer is a
        // stable synthetic ID so deployment IDs react to version changes.
        contents_id: Some(format!("helm-{}-{version}", op.spec.chart)),
        helm_op_options: Some(BundleHelmOptions {
            secret_name: op.spec.helm_secret_name.clone(),
            insecure_skip_tls_verify: op.spec.insecure_skip_tls_verify,
        }),
        options: crate::crds::BundleDeploymentOptions {
            target_namespace: op.spec.target_namespace.clone(),
            helm: Some(HelmOptions {
                repo: Some(op.spec.repo.clone()),
                chart: Some(op.spec.chart.clone()),
                version: Some(version.to_string()),
                ..Default::default()
            }),
            ..Default::default()
        },
        delete_namespace: op.spec.delete_namespace,
        keep_resources: op.spec.keep_resources,
        paused: op.spec.paused,
        ..Default::default()
    };

    let labels: BTreeMap<String, String> = [(REPO_LABEL.to_string(), name.clone())].into();

    match api.get_opt(&name).await? {
        None => {
            let mut bundle = Bundle::new(&name, spec);
            bundle.metadata = ObjectMeta {
                name: Some(name.clone()),
                namespace: Some(namespace.clone()),
                labels: Some(labels),
                ..Default::default()
            };
            api.create(&PostParams::default(), &bundle).await?;
            info!("authored bundle {namespace}/{name} for chart version {version}");
        }
        Some(live) => {
            let current_version = live
                .spec
                .options
                .helm
                .as_ref()
                .and_then(|h| h.version.as_deref());
            if current_version != Some(version) || live.labels().get(REPO_LABEL) != Some(&name) {
                let patch = serde_json::json!({
                    "metadata": { "labels": labels },
                    "spec": spec,
                });
                api.patch(&name, &PatchParams::default(), &Patch::Merge(&patch))
                    .await?;
                debug!("updated bundle {namespace}/{name} to chart version {version}");
            }
        }
    }
    Ok(())
}

async fn cleanup(op: &HelmOp, namespace: &str, ctx: &Context) -> Result<Action> {
    let name = op.name_any();

    let (remaining, target_namespace) =
        purge::delete_bundles(&ctx.client, namespace, &name, op.spec.keep_resources).await?;
    if remaining > 0 {
        return Ok(Action::requeue(DELETE_REQUEUE));
    }

    if op.spec.delete_namespace && !op.spec.keep_resources {
        let target = target_namespace.or_else(|| op.spec.target_namespace.clone());
        if let Some(target) = target {
            purge::delete_target_namespace(&ctx.client, &target).await?;
        }
    }

    metrics::forget(&name, namespace);
    let api: Api<HelmOp> = Api::namespaced(ctx.client.clone(), namespace);
    remove_finalizer(&api, op, HELMOP_FINALIZER).await?;
    info!("helmop {namespace}/{name} cleaned up");
    Ok(Action::await_change())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn index_parses_and_versions_order() {
        let raw = r#"
apiVersion: v1
entries:
  nginx:
    - version: 1.2.3
    - version: 1.10.0
    - version: 2.0.0-rc.1
  redis:
    - version: 0.9.1
"#;
        let index: HelmIndex = serde_yaml::from_str(raw).unwrap();
        assert_eq!(index.entries["nginx"].len(), 3);
        assert_eq!(index.entries["redis"][0].version, "0.9.1");
    }

    #[tokio::test]
    async fn exact_versions_resolve_without_network() {
        let op = HelmOp::new(
            "db",
            crate::crds::HelmOpSpec {
                repo: "https://charts.example.com".to_string(),
                chart: "redis".to_string(),
                version: Some("1.4.2".to_string()),
                ..Default::default()
            },
        );
        assert_eq!(resolve_version(&op).await.unwrap(), "1.4.2");
    }
}
