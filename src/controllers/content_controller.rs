/*
 * Copyright (C) 2025 Pedro Henrique / phkaiser13
 *
 * File: content_controller.rs
 *
 * Garbage collection for the inline content backend. Content objects are
 * reference-counted by finalizers named after their referring
 * BundleDeployments. This reconciler runs on every Content change and on
 * every change of a deployment labeled with a content ID: it counts the
 * live (non-deleting) references, prunes finalizers whose deployment is
 * gone, and deletes the object when no references remain.
 *
 * SPDX-License-Identifier: Apache-2.0
 */

use kube::api::{Api, DeleteParams, ListParams, Patch, PatchParams};
use kube::runtime::controller::Action;
use kube::ResourceExt;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

use super::Context;
use crate::crds::{BundleDeployment, Content, CONTENT_FINALIZER_PREFIX, CONTENT_ID_LABEL};
use crate::error::{Error, Result};
use crate::metrics;

pub async fn reconcile(content: Arc<Content>, ctx: Arc<Context>) -> Result<Action> {
    metrics::RECONCILE_TOTAL.with_label_values(&["content"]).inc();

    let name = content.name_any();

    // Live references: deployments labeled with this content ID that are
    // not already going away.
    let deployments: Api<BundleDeployment> = Api::all(ctx.client.clone());
    let params = ListParams::default().labels(&format!("{CONTENT_ID_LABEL}={name}"));
    let referring = deployments.list(&params).await?.items;

    let live: Vec<&BundleDeployment> = referring
        .iter()
        .filter(|bd| bd.metadata.deletion_timestamp.is_none())
        .collect();

    // Prune finalizers left behind by deployments that no longer exist;
    // normal removal happens in deployment finalization.
    let wanted: Vec<String> = live
        .iter()
        .map(|bd| {
            crate::crds::content_finalizer(&bd.namespace().unwrap_or_default(), &bd.name_any())
        })
        .collect();
    let kept: Vec<String> = content
        .finalizers()
        .iter()
        .filter(|f| !f.starts_with(CONTENT_FINALIZER_PREFIX) || wanted.contains(f))
        .cloned()
        .collect();

    let api: Api<Content> = Api::all(ctx.client.clone());
    if kept.len() != content.finalizers().len() {
        let patch = serde_json::json!({ "metadata": { "finalizers": kept } });
        match api
            .patch(&name, &PatchParams::default(), &Patch::Merge(&patch))
            .await
        {
            Ok(_) => debug!("pruned stale references on content {name}"),
            Err(kube::Error::Api(e)) if e.code == 404 => return Ok(Action::await_change()),
            Err(e) => return Err(e.into()),
        }
    }

    if live.is_empty() {
        match api.delete(&name, &DeleteParams::default()).await {
            Ok(_) => info!("garbage collected content {name}"),
            Err(kube::Error::Api(e)) if e.code == 404 => {}
            Err(e) => return Err(e.into()),
        }
        return Ok(Action::await_change());
    }

    // Deployments that moved to different content stop triggering this
    // object through the label watch; sweep periodically for that case.
    Ok(Action::requeue(Duration::from_secs(600)))
}

pub fn error_policy(_content: Arc<Content>, error: &Error, _ctx: Arc<Context>) -> Action {
    metrics::RECONCILE_ERRORS
        .with_label_values(&["content"])
        .inc();
    warn!("content reconciliation failed: {error:?}");
    Action::requeue(Duration::from_secs(5))
}
