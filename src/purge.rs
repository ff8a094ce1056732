/*
 * Copyright (C) 2025 Pedro Henrique / phkaiser13
 *
 * File: purge.rs
 *
 * Cascading cleanup shared by the GitRepo and HelmOp reconcilers. While a
 * source's finalizer is present, its reconciler drives this cascade: delete
 * owned bundles (each bundle's own finalizer drains its deployments and
 * releases content references), optionally delete the target namespace on
 * the upstream side, purge the source's ImageScans, and drain its schedule
 * tickets. Only then is the source finalizer cleared.
 *
 * SPDX-License-Identifier: Apache-2.0
 */

use k8s_openapi::api::core::v1::Namespace;
use kube::api::{Api, DeleteParams, ListParams};
use kube::{Client, ResourceExt};
use tracing::{info, warn};

use crate::crds::{Bundle, ImageScan, REPO_LABEL, SCHEDULE_FINALIZER};
use crate::error::Result;
use crate::scan;

/// Namespaces the cascade must never delete, plus anything `kube-*`.
const PROTECTED_NAMESPACES: [&str; 5] = [
    "fleet-local",
    "cattle-fleet-system",
    "fleet-default",
    "cattle-fleet-clusters-system",
    "default",
];

pub fn is_protected_namespace(namespace: &str) -> bool {
    namespace.starts_with("kube-") || PROTECTED_NAMESPACES.contains(&namespace)
}

/// List the bundles a source owns, by repo label.
pub async fn owned_bundles(client: &Client, namespace: &str, source: &str) -> Result<Vec<Bundle>> {
    let api: Api<Bundle> = Api::namespaced(client.clone(), namespace);
    let params = ListParams::default().labels(&format!("{REPO_LABEL}={source}"));
    Ok(api.list(&params).await?.items)
}

/// Delete every owned bundle, capturing the namespace-deletion decision
/// from the first bundle seen. `keepResources` forces the decision off.
/// Returns `(remaining, target_namespace_to_delete)`.
pub async fn delete_bundles(
    client: &Client,
    namespace: &str,
    source: &str,
    keep_resources: bool,
) -> Result<(usize, Option<String>)> {
    let bundles = owned_bundles(client, namespace, source).await?;
    let api: Api<Bundle> = Api::namespaced(client.clone(), namespace);

    let mut target_namespace = None;
    let mut remaining = 0usize;
    for bundle in &bundles {
        if !keep_resources && bundle.spec.delete_namespace && target_namespace.is_none() {
            target_namespace = bundle
                .spec
                .options
                .target_namespace
                .clone()
                .or(bundle.spec.options.default_namespace.clone());
        }
        remaining += 1;
        if bundle.metadata.deletion_timestamp.is_some() {
            continue;
        }
        match api.delete(&bundle.name_any(), &DeleteParams::default()).await {
            Ok(_) => info!("deleting bundle {}/{}", namespace, bundle.name_any()),
            Err(kube::Error::Api(e)) if e.code == 404 => {}
            Err(e) => return Err(e.into()),
        }
    }

    Ok((remaining, target_namespace))
}

/// Delete the target namespace on the upstream cluster, unless it is a
/// default or `kube-*` namespace. Downstream namespaces are the agent's
/// business, driven by the deployment spec.
pub async fn delete_target_namespace(client: &Client, namespace: &str) -> Result<()> {
    if is_protected_namespace(namespace) {
        warn!("refusing to delete protected namespace {namespace}");
        return Ok(());
    }
    let api: Api<Namespace> = Api::all(client.clone());
    match api.delete(namespace, &DeleteParams::default()).await {
        Ok(_) => info!("deleted target namespace {namespace}"),
        Err(kube::Error::Api(e)) if e.code == 404 => {}
        Err(e) => return Err(e.into()),
    }
    Ok(())
}

/// Purge the ImageScans pointing at a GitRepo and drain their schedule
/// tickets, clearing the schedule finalizer on each scan first.
pub async fn purge_image_scans(client: &Client, namespace: &str, repo: &str) -> Result<()> {
    let api: Api<ImageScan> = Api::namespaced(client.clone(), namespace);
    let scans = api.list(&ListParams::default()).await?.items;

    for scan_obj in scans {
        if scan_obj.spec.git_repo_name != repo {
            continue;
        }
        let name = scan_obj.name_any();
        if scan_obj.finalizers().iter().any(|f| f == SCHEDULE_FINALIZER) {
            let patch = serde_json::json!({
                "metadata": {
                    "finalizers": scan_obj
                        .finalizers()
                        .iter()
                        .filter(|f| f.as_str() != SCHEDULE_FINALIZER)
                        .collect::<Vec<_>>(),
                }
            });
            api.patch(
                &name,
                &kube::api::PatchParams::default(),
                &kube::api::Patch::Merge(&patch),
            )
            .await?;
        }
        match api.delete(&name, &DeleteParams::default()).await {
            Ok(_) => info!("purged image scan {namespace}/{name}"),
            Err(kube::Error::Api(e)) if e.code == 404 => {}
            Err(e) => return Err(e.into()),
        }
    }

    for ticket in scan::drain(namespace, repo) {
        info!("dropped scheduled scan {ticket} for {namespace}/{repo}");
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn protected_namespaces() {
        for ns in [
            "fleet-local",
            "cattle-fleet-system",
            "fleet-default",
            "cattle-fleet-clusters-system",
            "default",
            "kube-system",
            "kube-public",
        ] {
            assert!(is_protected_namespace(ns), "{ns} must be protected");
        }
        assert!(!is_protected_namespace("team-a"));
        assert!(!is_protected_namespace("cluster-fleet-default-c1-abcd1234"));
    }
}
