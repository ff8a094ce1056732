/*
 * Copyright (C) 2025 Pedro Henrique / phkaiser13
 *
 * File: cluster_controller.rs
 *
 * Cluster lifecycle. On creation (or any reconcile that finds an empty
 * status.namespace) it synthesizes the deterministic per-cluster namespace,
 * writes it to status, and ensures the Namespace object exists on the
 * upstream cluster with the managed label and back-reference annotations.
 * The per-cluster namespace holds upstream BundleDeployment records, not
 * downstream workloads. On deletion the namespace is removed.
 *
 * Every reconcile also folds the deployments living in that namespace into
 * the cluster's summary, repo readiness counters, and display state; a
 * cluster whose agent has never checked in displays WaitCheckIn.
 *
 * SPDX-License-Identifier: Apache-2.0
 */

use k8s_openapi::api::core::v1::Namespace;
use kube::api::{Api, DeleteParams, ListParams, ObjectMeta, Patch, PatchParams};
use kube::runtime::controller::Action;
use kube::runtime::finalizer::{finalizer, Event as FinalizerEvent};
use kube::ResourceExt;
use sha2::{Digest, Sha256};
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

use super::{patch_status, required_namespace, Context, FIELD_MANAGER};
use crate::crds::{
    BundleDeployment, Cluster, ClusterStatus, CLUSTER_ANNOTATION, CLUSTER_NAMESPACE_ANNOTATION,
    MANAGED_LABEL,
};
use crate::duration::parse_or_default;
use crate::error::{Error, Result};
use crate::metrics;
use crate::summary;
use crate::{config, purge};

static CLUSTER_FINALIZER: &str = "fleet.phgit.io/cluster-finalizer";

/// Deterministic per-cluster namespace: same cluster, same name, across
/// operator restarts. Components are truncated to stay inside the 63-char
/// namespace limit; the digest suffix keeps truncated names unique.
pub fn per_cluster_namespace(namespace: &str, name: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(namespace.as_bytes());
    hasher.update(b"/");
    hasher.update(name.as_bytes());
    let digest = hex::encode(hasher.finalize());
    let suffix = &digest[..8];

    let mut ns = namespace.to_string();
    ns.truncate(20);
    let mut cluster = name.to_string();
    cluster.truncate(20);
    format!("cluster-{ns}-{cluster}-{suffix}")
}

pub async fn reconcile(cluster: Arc<Cluster>, ctx: Arc<Context>) -> Result<Action> {
    metrics::RECONCILE_TOTAL.with_label_values(&["cluster"]).inc();

    let namespace = required_namespace(cluster.as_ref())?;
    let api: Api<Cluster> = Api::namespaced(ctx.client.clone(), &namespace);

    finalizer(&api, CLUSTER_FINALIZER, cluster, |event| async {
        match event {
            FinalizerEvent::Apply(cluster) => apply(cluster, ctx.clone()).await,
            FinalizerEvent::Cleanup(cluster) => cleanup(cluster, ctx.clone()).await,
        }
    })
    .await
    .map_err(|e| e.into())
}

pub fn error_policy(_cluster: Arc<Cluster>, error: &Error, _ctx: Arc<Context>) -> Action {
    metrics::RECONCILE_ERRORS
        .with_label_values(&["cluster"])
        .inc();
    warn!("cluster reconciliation failed: {error:?}");
    Action::requeue(Duration::from_secs(5))
}

async fn apply(cluster: Arc<Cluster>, ctx: Arc<Context>) -> Result<Action> {
    let namespace = required_namespace(cluster.as_ref())?;
    let name = cluster.name_any();
    let api: Api<Cluster> = Api::namespaced(ctx.client.clone(), &namespace);

    let mut status = cluster.status.clone().unwrap_or_default();
    status.observed_generation = cluster.metadata.generation;

    // Assign the per-cluster namespace once.
    let cluster_namespace = match &status.namespace {
        Some(ns) if !ns.is_empty() => ns.clone(),
        _ => {
            let ns = per_cluster_namespace(&namespace, &name);
            status.namespace = Some(ns.clone());
            ns
        }
    };

    ensure_namespace(&ctx, &namespace, &name, &cluster_namespace).await?;

    // Fold the deployments hosted in the per-cluster namespace.
    let deployments: Api<BundleDeployment> = Api::namespaced(ctx.client.clone(), &cluster_namespace);
    let items = deployments.list(&ListParams::default()).await?.items;

    let (folded, desired_repos, ready_repos) = summary::fold_cluster(&items);
    status.display.ready_bundles = Some(format!("{}/{}", folded.ready, folded.desired_ready));
    status.display.state = summary::cluster_state(&cluster, &folded);
    status.summary = folded;
    status.desired_ready_git_repos = desired_repos;
    status.ready_git_repos = ready_repos;

    if !cluster_status_equal(cluster.status.as_ref(), &status) {
        patch_status(&api, &name, &status).await?;
    }

    // Re-enqueue on the configured cadence so agent check-in staleness is
    // eventually observed even without events.
    let delay = parse_or_default(
        config::get().cluster_enqueue_delay.as_deref(),
        Duration::from_secs(60),
    );
    Ok(Action::requeue(delay))
}

fn cluster_status_equal(old: Option<&ClusterStatus>, new: &ClusterStatus) -> bool {
    match old {
        None => false,
        Some(old) => serde_json::to_value(old).ok() == serde_json::to_value(new).ok(),
    }
}

async fn ensure_namespace(
    ctx: &Context,
    cluster_ns: &str,
    cluster_name: &str,
    namespace: &str,
) -> Result<()> {
    let api: Api<Namespace> = Api::all(ctx.client.clone());

    let desired = Namespace {
        metadata: ObjectMeta {
            name: Some(namespace.to_string()),
            labels: Some([(MANAGED_LABEL.to_string(), "true".to_string())].into()),
            annotations: Some(
                [
                    (CLUSTER_ANNOTATION.to_string(), cluster_name.to_string()),
                    (CLUSTER_NAMESPACE_ANNOTATION.to_string(), cluster_ns.to_string()),
                ]
                .into(),
            ),
            ..Default::default()
        },
        ..Default::default()
    };

    // Server-side apply keeps this idempotent across restarts.
    let params = PatchParams::apply(FIELD_MANAGER);
    api.patch(namespace, &params, &Patch::Apply(&desired)).await?;
    Ok(())
}

async fn cleanup(cluster: Arc<Cluster>, ctx: Arc<Context>) -> Result<Action> {
    let name = cluster.name_any();
    let Some(cluster_namespace) = cluster.status.as_ref().and_then(|s| s.namespace.clone()) else {
        return Ok(Action::await_change());
    };

    if purge::is_protected_namespace(&cluster_namespace) {
        warn!("cluster {name} points at protected namespace {cluster_namespace}, skipping delete");
        return Ok(Action::await_change());
    }

    let api: Api<Namespace> = Api::all(ctx.client.clone());
    match api.delete(&cluster_namespace, &DeleteParams::default()).await {
        Ok(_) => info!("deleted per-cluster namespace {cluster_namespace}"),
        Err(kube::Error::Api(e)) if e.code == 404 => {}
        Err(e) => return Err(e.into()),
    }
    Ok(Action::await_change())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn namespace_is_deterministic_and_unique() {
        let a = per_cluster_namespace("fleet-default", "edge-1");
        let b = per_cluster_namespace("fleet-default", "edge-1");
        let c = per_cluster_namespace("fleet-default", "edge-2");
        let d = per_cluster_namespace("fleet-other", "edge-1");

        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_ne!(a, d);
        assert!(a.starts_with("cluster-fleet-default-edge-1-"));
    }

    #[test]
    fn namespace_fits_length_limit_for_long_names() {
        let ns = per_cluster_namespace(
            "a-namespace-with-a-very-long-name-indeed",
            "a-cluster-with-an-even-longer-name-than-that",
        );
        assert!(ns.len() <= 63, "{ns} is {} chars", ns.len());
    }
}
