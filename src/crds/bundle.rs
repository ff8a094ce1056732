/*
 * Copyright (C) 2025 Pedro Henrique / phkaiser13
 *
 * File: bundle.rs
 *
 * The Bundle custom resource: the canonical deployment unit of the fleet
 * control plane. A Bundle carries either inline rendered manifests or a
 * pointer to external content, a list of targeting rules with per-target
 * option overlays, a whitelist of target restrictions, and a rollout
 * strategy. Its spec is authored by the CLI or by the GitRepo/HelmOp
 * reconcilers; the controllers here only read it and write status.
 *
 * The BundleDeploymentOptions struct defined in this file is shared with
 * the BundleDeployment spec: the bundle reconciler computes the merged
 * options for each matched cluster and copies them into the child.
 *
 * SPDX-License-Identifier: Apache-2.0
 */

use k8s_openapi::apimachinery::pkg::apis::meta::v1::LabelSelector;
use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use super::condition::Condition;

/// # Bundle
/// A deployable unit plus its selector rules. The bundle reconciler matches
/// it against clusters, stages content, and owns one BundleDeployment per
/// matched cluster.
#[derive(CustomResource, Deserialize, Serialize, Clone, Debug, Default, JsonSchema)]
#[kube(
    group = "fleet.phgit.io",
    version = "v1alpha1",
    kind = "Bundle",
    namespaced,
    status = "BundleStatus",
    printcolumn = r#"{"name":"Deployments-Ready", "type":"string", "jsonPath":".status.display.readyClusters"}"#,
    printcolumn = r#"{"name":"Status", "type":"string", "jsonPath":".status.display.state"}"#,
    shortname = "fb"
)]
#[serde(rename_all = "camelCase")]
pub struct BundleSpec {
    /// Inline rendered manifests. Mutually exclusive with `contentsId`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resources: Option<Vec<BundleResource>>,

    /// Pointer to pre-pushed external content (OCI backend or server-side
    /// Helm pull). Mutually exclusive with `resources`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub contents_id: Option<String>,

    /// Set by the HelmOp reconciler for server-side chart pulls. The version
    /// must be strict before deployments are created.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub helm_op_options: Option<BundleHelmOptions>,

    /// Default deployment options; per-target overlays win over these.
    #[serde(default)]
    pub options: BundleDeploymentOptions,

    /// Customization rules, evaluated in declaration order; the first match
    /// contributes its overlay.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub targets: Vec<BundleTarget>,

    /// Whitelist of selectors. Empty means "allow all".
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub target_restrictions: Vec<BundleTargetRestriction>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rollout_strategy: Option<RolloutStrategy>,

    /// Stored for the agent; not evaluated upstream.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub depends_on: Option<Vec<BundleRef>>,

    /// Digest of the per-bundle values secret written by the CLI.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub values_hash: Option<String>,

    /// Ask the downstream agent to delete the target namespace on removal.
    #[serde(default)]
    pub delete_namespace: bool,

    /// Leave deployed resources in place on removal.
    #[serde(default)]
    pub keep_resources: bool,

    #[serde(default)]
    pub paused: bool,
}

/// A single rendered manifest carried inline.
#[derive(Deserialize, Serialize, Clone, Debug, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct BundleResource {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,

    pub content: String,

    /// "base64+gz" for compressed payloads; absent for plain text. Carried
    /// opaquely upstream; the downstream agent decodes at apply time.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub encoding: Option<String>,
}

/// Reference to another bundle, used by `dependsOn`.
#[derive(Deserialize, Serialize, Clone, Debug, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct BundleRef {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub selector: Option<LabelSelector>,
}

/// Chart coordinate recorded on bundles produced by a HelmOp.
#[derive(Deserialize, Serialize, Clone, Debug, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct BundleHelmOptions {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub secret_name: Option<String>,

    #[serde(default, rename = "insecureSkipTLSVerify")]
    pub insecure_skip_tls_verify: bool,
}

/// A customization rule: a selection predicate plus an options overlay.
#[derive(Deserialize, Serialize, Clone, Debug, Default, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct BundleTarget {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cluster_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cluster_selector: Option<LabelSelector>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cluster_group: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cluster_group_selector: Option<LabelSelector>,

    /// Overlay merged over the bundle's default options on match.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub options: Option<BundleDeploymentOptions>,
}

/// A whitelist predicate. A cluster matching no restriction is excluded
/// even when a target would match it.
#[derive(Deserialize, Serialize, Clone, Debug, Default, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct BundleTargetRestriction {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cluster_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cluster_selector: Option<LabelSelector>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cluster_group: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cluster_group_selector: Option<LabelSelector>,
}

/// Rollout budgeting for a bundle's deployments.
#[derive(Deserialize, Serialize, Clone, Debug, Default, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct RolloutStrategy {
    /// Integer or percentage of targets that may be unavailable during a
    /// rollout. Defaults to 25%.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_unavailable: Option<IntOrString>,

    /// Integer or percentage of partitions that may be unavailable.
    /// Defaults to 1.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_unavailable_partitions: Option<IntOrString>,

    /// Size of automatic partitions. Defaults to 25% of targets.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub auto_partition_size: Option<IntOrString>,

    /// Per-reconcile budget of first-time deployment creations.
    /// Defaults to 50.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_new: Option<i64>,

    /// Explicit named partitions; the remainder is auto-partitioned.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub partitions: Option<Vec<PartitionSpec>>,
}

/// An explicit rollout partition: a sub-selector with its own budget.
#[derive(Deserialize, Serialize, Clone, Debug, Default, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct PartitionSpec {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_unavailable: Option<IntOrString>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cluster_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cluster_selector: Option<LabelSelector>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cluster_group: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cluster_group_selector: Option<LabelSelector>,
}

/// Deployment options for one cluster, fully merged. Maps merge key-wise,
/// arrays replace, the overlay wins.
#[derive(Deserialize, Serialize, Clone, Debug, Default, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct BundleDeploymentOptions {
    /// Namespace resources are applied into when they carry none.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default_namespace: Option<String>,

    /// Namespace every resource is forced into.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target_namespace: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub service_account: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub helm: Option<HelmOptions>,

    /// The agent reverts manual changes when set.
    #[serde(default)]
    pub correct_drift: bool,

    /// Force-apply even when another manager owns a field.
    #[serde(default)]
    pub force_sync_before_apply: bool,
}

/// Helm-specific deployment options.
#[derive(Deserialize, Serialize, Clone, Debug, Default, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct HelmOptions {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub chart: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub repo: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub release_name: Option<String>,

    /// Helm values; merged key-wise across target overlays.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub values: Option<BTreeMap<String, serde_json::Value>>,

    #[serde(default)]
    pub take_ownership: bool,
}

/// Counter buckets folded from owned deployments, one per display state.
#[derive(Deserialize, Serialize, Clone, Debug, Default, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct BundleSummary {
    #[serde(default)]
    pub ready: i64,
    #[serde(default)]
    pub desired_ready: i64,
    #[serde(default)]
    pub not_ready: i64,
    #[serde(default)]
    pub pending: i64,
    #[serde(default)]
    pub out_of_sync: i64,
    #[serde(default)]
    pub modified: i64,
    #[serde(default)]
    pub wait_applied: i64,
    #[serde(default)]
    pub err_applied: i64,

    /// Human strings for the worst non-ready deployments, capped.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub non_ready_resources: Vec<String>,
}

impl BundleSummary {
    pub fn add(&mut self, other: &BundleSummary) {
        self.ready += other.ready;
        self.desired_ready += other.desired_ready;
        self.not_ready += other.not_ready;
        self.pending += other.pending;
        self.out_of_sync += other.out_of_sync;
        self.modified += other.modified;
        self.wait_applied += other.wait_applied;
        self.err_applied += other.err_applied;
    }
}

/// Per-partition rollout view written to bundle status.
#[derive(Deserialize, Serialize, Clone, Debug, Default, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct PartitionStatus {
    pub name: String,
    #[serde(default)]
    pub count: i64,
    #[serde(default)]
    pub max_unavailable: i64,
    #[serde(default)]
    pub unavailable: i64,
    #[serde(default)]
    pub summary: BundleSummary,
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct BundleDisplay {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ready_clusters: Option<String>,
    /// Highest-ranked deployment state; empty when everything is ready.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub state: Option<String>,
}

/// The observed state of a Bundle, recomputed on every reconcile.
#[derive(Deserialize, Serialize, Clone, Debug, Default, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct BundleStatus {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub observed_generation: Option<i64>,

    #[serde(default)]
    pub conditions: Vec<Condition>,

    #[serde(default)]
    pub summary: BundleSummary,

    #[serde(default)]
    pub display: BundleDisplay,

    /// Digest of the canonical manifest serialization.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resources_sha256_sum: Option<String>,

    /// Content name (inline backend) or registry reference (OCI backend).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub contents_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub oci_reference: Option<String>,

    /// Budget view: recomputed before the governor runs, incremented as it
    /// advances.
    #[serde(default)]
    pub max_unavailable: i64,
    #[serde(default)]
    pub unavailable: i64,
    #[serde(default)]
    pub max_new: i64,
    #[serde(default)]
    pub newly_created: i64,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub partitions: Vec<PartitionStatus>,
}
