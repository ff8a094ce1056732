/*
 * Copyright (C) 2025 Pedro Henrique / phkaiser13
 *
 * File: bundle_deployment.rs
 *
 * The BundleDeployment custom resource: the per-cluster realization of a
 * Bundle. It lives in the target cluster's per-cluster namespace on the
 * management cluster. The bundle reconciler is the sole writer of its spec;
 * the downstream agent is the sole writer of its status. The split between
 * `deploymentId` (what the agent is asked to apply now) and
 * `stagedDeploymentId` (the latest desired spec) is what lets option churn
 * propagate without tripping simultaneous rollouts everywhere.
 *
 * SPDX-License-Identifier: Apache-2.0
 */

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use super::bundle::BundleDeploymentOptions;
use super::condition::Condition;

/// # BundleDeployment
/// One per matched (Bundle, Cluster) pair.
#[derive(CustomResource, Deserialize, Serialize, Clone, Debug, Default, JsonSchema, PartialEq)]
#[kube(
    group = "fleet.phgit.io",
    version = "v1alpha1",
    kind = "BundleDeployment",
    namespaced,
    status = "BundleDeploymentStatus",
    printcolumn = r#"{"name":"Deployed", "type":"string", "jsonPath":".status.display.deployed"}"#,
    printcolumn = r#"{"name":"Monitored", "type":"string", "jsonPath":".status.display.monitored"}"#,
    printcolumn = r#"{"name":"Status", "type":"string", "jsonPath":".status.display.state"}"#,
    shortname = "fbd"
)]
#[serde(rename_all = "camelCase")]
pub struct BundleDeploymentSpec {
    /// `<contentDigest>:<optionsHash>` the agent is currently asked to
    /// apply. Equal to `stagedDeploymentId` when the deployment is synced.
    #[serde(default)]
    pub deployment_id: String,

    /// The latest desired spec; advanced into `deploymentId` by the rollout
    /// governor.
    #[serde(default)]
    pub staged_deployment_id: String,

    #[serde(default)]
    pub options: BundleDeploymentOptions,

    #[serde(default)]
    pub staged_options: BundleDeploymentOptions,

    /// Frozen deployments keep serving their active ID; staging continues.
    #[serde(default)]
    pub paused: bool,

    /// The content for this deployment is pulled from an OCI registry using
    /// the cloned access secret, not from a Content object.
    #[serde(default)]
    pub oci_contents: bool,

    /// The agent resolves the chart itself (server-side Helm pull).
    #[serde(default)]
    pub helm_chart_options: bool,

    /// Digest of the options secret contents, when one exists.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub values_hash: Option<String>,
}

/// Per-resource drift entry reported by the agent.
#[derive(Deserialize, Serialize, Clone, Debug, Default, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ModifiedStatus {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kind: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_version: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default)]
    pub create: bool,
    #[serde(default)]
    pub delete: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub patch: Option<String>,
}

/// Per-resource readiness entry reported by the agent.
#[derive(Deserialize, Serialize, Clone, Debug, Default, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct NonReadyStatus {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub uid: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kind: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub summary: Option<String>,
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct BundleDeploymentDisplay {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deployed: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub monitored: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub state: Option<String>,
}

/// Written by the downstream agent; the upstream side only projects it.
#[derive(Deserialize, Serialize, Clone, Debug, Default, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct BundleDeploymentStatus {
    #[serde(default)]
    pub conditions: Vec<Condition>,

    #[serde(default)]
    pub ready: bool,

    #[serde(default)]
    pub non_modified: bool,

    /// Set to `spec.deploymentId` on successful apply.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub applied_deployment_id: Option<String>,

    #[serde(default)]
    pub display: BundleDeploymentDisplay,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub modified_status: Vec<ModifiedStatus>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub non_ready_status: Vec<NonReadyStatus>,
}

impl BundleDeployment {
    /// A deployment is synced when its active and staged IDs agree;
    /// otherwise it is upgrading.
    pub fn is_synced(&self) -> bool {
        self.spec.deployment_id == self.spec.staged_deployment_id
    }

    /// Unavailability per the rollout governor: the agent has not applied
    /// the active ID, or it has and reports not-ready.
    pub fn is_unavailable(&self) -> bool {
        match &self.status {
            None => true,
            Some(status) => {
                status.applied_deployment_id.as_deref() != Some(self.spec.deployment_id.as_str())
                    || !status.ready
            }
        }
    }
}
