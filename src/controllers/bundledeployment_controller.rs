/*
 * Copyright (C) 2025 Pedro Henrique / phkaiser13
 *
 * File: bundledeployment_controller.rs
 *
 * The upstream-side BundleDeployment reconciler. The downstream agent owns
 * the status; this reconciler only projects the agent's Deployed/Monitored
 * conditions into human-readable display strings and computes the single
 * display state. Its patch is restricted to the display field so it never
 * races the agent's writes.
 *
 * On deletion it releases the deployment's reference on its Content object
 * and then clears the deployment finalizer; the cloned secrets ride on
 * owner references and need no explicit cleanup.
 *
 * SPDX-License-Identifier: Apache-2.0
 */

use kube::api::{Api, Patch, PatchParams};
use kube::runtime::controller::Action;
use kube::ResourceExt;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

use super::{remove_finalizer, required_namespace, Context};
use crate::crds::condition::{CONDITION_DEPLOYED, CONDITION_MONITORED};
use crate::crds::{
    BundleDeployment, BundleDeploymentDisplay, Content, BUNDLE_DEPLOYMENT_FINALIZER,
    CONTENT_ID_LABEL,
};
use crate::error::{Error, Result};
use crate::metrics;
use crate::summary;

pub async fn reconcile(bd: Arc<BundleDeployment>, ctx: Arc<Context>) -> Result<Action> {
    metrics::RECONCILE_TOTAL
        .with_label_values(&["bundledeployment"])
        .inc();

    let namespace = required_namespace(bd.as_ref())?;
    let name = bd.name_any();
    let api: Api<BundleDeployment> = Api::namespaced(ctx.client.clone(), &namespace);

    if bd.metadata.deletion_timestamp.is_some() {
        release_content_reference(&ctx, &bd).await?;
        remove_finalizer(&api, bd.as_ref(), BUNDLE_DEPLOYMENT_FINALIZER).await?;
        debug!("released deployment {namespace}/{name}");
        return Ok(Action::await_change());
    }

    let display = BundleDeploymentDisplay {
        deployed: Some(summary::condition_display(&bd, CONDITION_DEPLOYED)),
        monitored: Some(summary::condition_display(&bd, CONDITION_MONITORED)),
        state: Some(summary::deployment_state(&bd).to_string()),
    };

    let current = bd.status.as_ref().map(|s| &s.display);
    if current == Some(&display) {
        // Steady state; nothing to write.
        return Ok(Action::await_change());
    }

    let patch = serde_json::json!({ "status": { "display": display } });
    api.patch_status(&name, &PatchParams::default(), &Patch::Merge(&patch))
        .await?;
    Ok(Action::await_change())
}

pub fn error_policy(_bd: Arc<BundleDeployment>, error: &Error, _ctx: Arc<Context>) -> Action {
    metrics::RECONCILE_ERRORS
        .with_label_values(&["bundledeployment"])
        .inc();
    warn!("bundledeployment reconciliation failed: {error:?}");
    Action::requeue(Duration::from_secs(5))
}

/// Remove this deployment's finalizer from its Content object; the content
/// reconciler deletes the object once the live reference count hits zero.
async fn release_content_reference(ctx: &Context, bd: &BundleDeployment) -> Result<()> {
    let Some(content_id) = bd.labels().get(CONTENT_ID_LABEL).cloned() else {
        return Ok(());
    };
    let api: Api<Content> = Api::all(ctx.client.clone());
    let Some(content) = api.get_opt(&content_id).await? else {
        return Ok(());
    };
    let finalizer = crate::crds::content_finalizer(
        &bd.namespace().unwrap_or_default(),
        &bd.name_any(),
    );
    remove_finalizer(&api, &content, &finalizer).await
}
