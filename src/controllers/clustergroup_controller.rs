/*
 * Copyright (C) 2025 Pedro Henrique / phkaiser13
 *
 * File: clustergroup_controller.rs
 *
 * ClusterGroup status fold: counts the clusters selected by the group,
 * counts the non-ready ones, sums their bundle summaries, and writes the
 * display strings. Groups are externally owned; this reconciler only
 * writes status. Membership changes ride on the periodic requeue.
 *
 * SPDX-License-Identifier: Apache-2.0
 */

use kube::api::{Api, ListParams};
use kube::runtime::controller::Action;
use kube::ResourceExt;
use std::sync::Arc;
use std::time::Duration;
use tracing::warn;

use super::{patch_status, required_namespace, Context};
use crate::crds::{Cluster, ClusterGroup, ClusterGroupStatus};
use crate::error::{Error, Result};
use crate::metrics;
use crate::target::selector;

const RESYNC: Duration = Duration::from_secs(60);
const NON_READY_CAP: usize = 10;

pub async fn reconcile(group: Arc<ClusterGroup>, ctx: Arc<Context>) -> Result<Action> {
    metrics::RECONCILE_TOTAL
        .with_label_values(&["clustergroup"])
        .inc();

    let namespace = required_namespace(group.as_ref())?;
    let name = group.name_any();
    let api: Api<ClusterGroup> = Api::namespaced(ctx.client.clone(), &namespace);

    if group.metadata.deletion_timestamp.is_some() {
        return Ok(Action::await_change());
    }

    let clusters: Vec<Cluster> = Api::<Cluster>::namespaced(ctx.client.clone(), &namespace)
        .list(&ListParams::default())
        .await?
        .items;

    let mut status = ClusterGroupStatus {
        observed_generation: group.metadata.generation,
        // The group's namespace doubles as a stable indexable key.
        namespace: Some(namespace.clone()),
        ..Default::default()
    };
    status.conditions = group
        .status
        .as_ref()
        .map(|s| s.conditions.clone())
        .unwrap_or_default();

    for cluster in &clusters {
        let labels = cluster.metadata.labels.clone().unwrap_or_default();
        let selected = match &group.spec.selector {
            Some(sel) => selector::matches(sel, &labels).unwrap_or(false),
            // A missing selector matches nothing.
            None => false,
        };
        if !selected {
            continue;
        }

        status.cluster_count += 1;
        if let Some(cluster_status) = &cluster.status {
            status.summary.add(&cluster_status.summary);
            let ready = cluster_status.summary.ready == cluster_status.summary.desired_ready
                && cluster_status.agent.last_seen.is_some();
            if !ready {
                status.non_ready_cluster_count += 1;
                if status.non_ready_clusters.len() < NON_READY_CAP {
                    status.non_ready_clusters.push(cluster.name_any());
                }
            }
        } else {
            status.non_ready_cluster_count += 1;
            if status.non_ready_clusters.len() < NON_READY_CAP {
                status.non_ready_clusters.push(cluster.name_any());
            }
        }
    }

    status.display.ready_clusters = Some(format!(
        "{}/{}",
        status.cluster_count - status.non_ready_cluster_count,
        status.cluster_count
    ));
    status.display.state = if status.non_ready_cluster_count > 0 {
        Some("NotReady".to_string())
    } else {
        None
    };

    let changed = group
        .status
        .as_ref()
        .map(|old| serde_json::to_value(old).ok() != serde_json::to_value(&status).ok())
        .unwrap_or(true);
    if changed {
        patch_status(&api, &name, &status).await?;
    }

    Ok(Action::requeue(RESYNC))
}

pub fn error_policy(_group: Arc<ClusterGroup>, error: &Error, _ctx: Arc<Context>) -> Action {
    metrics::RECONCILE_ERRORS
        .with_label_values(&["clustergroup"])
        .inc();
    warn!("clustergroup reconciliation failed: {error:?}");
    Action::requeue(Duration::from_secs(5))
}
