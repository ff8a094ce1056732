/*
 * Copyright (C) 2025 Pedro Henrique / phkaiser13
 *
 * File: cluster.rs
 *
 * The Cluster and ClusterGroup custom resources. A Cluster represents a
 * registered downstream Kubernetes cluster; its labels are what targeting
 * selectors match against, and its `status.namespace` names the upstream
 * namespace holding that cluster's BundleDeployments. A ClusterGroup is a
 * named label selector over Clusters in the same namespace, addressable by
 * name from bundle targets.
 *
 * SPDX-License-Identifier: Apache-2.0
 */

use k8s_openapi::apimachinery::pkg::apis::meta::v1::{LabelSelector, Time};
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use super::bundle::BundleSummary;
use super::condition::Condition;

/// # Cluster
/// A registered downstream cluster. Externally owned; the cluster
/// reconciler only assigns the per-cluster namespace and folds status.
#[derive(CustomResource, Deserialize, Serialize, Clone, Debug, Default, JsonSchema)]
#[kube(
    group = "fleet.phgit.io",
    version = "v1alpha1",
    kind = "Cluster",
    namespaced,
    status = "ClusterStatus",
    printcolumn = r#"{"name":"Bundles-Ready", "type":"string", "jsonPath":".status.display.readyBundles"}"#,
    printcolumn = r#"{"name":"Last-Seen", "type":"date", "jsonPath":".status.agent.lastSeen"}"#,
    shortname = "fcl"
)]
#[serde(rename_all = "camelCase")]
pub struct ClusterSpec {
    /// Paused clusters receive staged spec updates but no rollout advances,
    /// and they are excluded from desired-ready accounting.
    #[serde(default)]
    pub paused: bool,

    /// Identity the agent registered with; informational upstream.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_id: Option<String>,

    /// Override for the agent's resync cadence, e.g. "15m".
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub agent_resync_interval: Option<String>,
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct AgentStatus {
    /// Written by the downstream agent on every check-in.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_seen: Option<Time>,

    /// Namespace the agent runs in on the downstream cluster.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ClusterDisplay {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ready_bundles: Option<String>,
    /// "WaitCheckIn" until the agent reports for the first time.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub state: Option<String>,
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ClusterStatus {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub observed_generation: Option<i64>,

    #[serde(default)]
    pub conditions: Vec<Condition>,

    /// Upstream namespace holding this cluster's BundleDeployments.
    /// Assigned once, deterministically, by the cluster reconciler.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,

    #[serde(default)]
    pub agent: AgentStatus,

    #[serde(default)]
    pub summary: BundleSummary,

    #[serde(default)]
    pub display: ClusterDisplay,

    #[serde(default)]
    pub desired_ready_git_repos: i64,
    #[serde(default)]
    pub ready_git_repos: i64,
}

/// # ClusterGroup
/// A named selector over Clusters in the same namespace.
#[derive(CustomResource, Deserialize, Serialize, Clone, Debug, Default, JsonSchema)]
#[kube(
    group = "fleet.phgit.io",
    version = "v1alpha1",
    kind = "ClusterGroup",
    namespaced,
    status = "ClusterGroupStatus",
    printcolumn = r#"{"name":"Clusters-Ready", "type":"string", "jsonPath":".status.display.readyClusters"}"#,
    shortname = "fcg"
)]
#[serde(rename_all = "camelCase")]
pub struct ClusterGroupSpec {
    /// Selector over clusters; a missing selector matches nothing.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub selector: Option<LabelSelector>,
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ClusterGroupDisplay {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ready_clusters: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub state: Option<String>,
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ClusterGroupStatus {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub observed_generation: Option<i64>,

    #[serde(default)]
    pub conditions: Vec<Condition>,

    /// Equals the group's own namespace; kept in status as a stable
    /// indexable key.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,

    #[serde(default)]
    pub cluster_count: i64,
    #[serde(default)]
    pub non_ready_cluster_count: i64,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub non_ready_clusters: Vec<String>,

    #[serde(default)]
    pub summary: BundleSummary,

    #[serde(default)]
    pub display: ClusterGroupDisplay,
}
