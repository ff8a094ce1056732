/*
 * Copyright (C) 2025 Pedro Henrique / phkaiser13
 *
 * File: source.rs
 *
 * Source-of-truth custom resources: GitRepo (a git URL plus branch or
 * revision, polled for new commits and materialized through clone Jobs),
 * HelmOp (a chart coordinate resolved to a strict version), and ImageScan
 * (a tag-selection policy attached to a GitRepo; only a purge target for
 * the controllers in this repository). Both source kinds carry the same
 * rollup status fields fanned in from their child bundles.
 *
 * SPDX-License-Identifier: Apache-2.0
 */

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use super::bundle::BundleSummary;
use super::condition::Condition;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::Time;

/// # GitRepo
/// Source pointer producing bundles through the git poller and clone jobs.
#[derive(CustomResource, Deserialize, Serialize, Clone, Debug, Default, JsonSchema)]
#[kube(
    group = "fleet.phgit.io",
    version = "v1alpha1",
    kind = "GitRepo",
    namespaced,
    status = "GitRepoStatus",
    printcolumn = r#"{"name":"Repo", "type":"string", "jsonPath":".spec.repo"}"#,
    printcolumn = r#"{"name":"Commit", "type":"string", "jsonPath":".status.commit"}"#,
    printcolumn = r#"{"name":"Bundles-Ready", "type":"string", "jsonPath":".status.display.readyClusters"}"#,
    shortname = "fgr"
)]
#[serde(rename_all = "camelCase")]
pub struct GitRepoSpec {
    /// Repository URL, HTTPS or SSH.
    pub repo: String,

    /// Branch to follow. Mutually exclusive with `revision`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub branch: Option<String>,

    /// Exact revision (tag or commit) to pin.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub revision: Option<String>,

    /// Paths inside the repository scanned by the clone job.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub paths: Vec<String>,

    /// BasicAuth or SSHAuth secret for the remote.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_secret_name: Option<String>,

    /// Helm credential secrets consumed by the clone job. Validated before
    /// a job is created.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub helm_secret_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub helm_secret_name_for_paths: Option<String>,

    #[serde(default, rename = "insecureSkipTLSVerify")]
    pub insecure_skip_tls_verify: bool,

    /// PEM bundle for the remote, when not using system roots.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ca_bundle: Option<String>,

    /// Duration string, e.g. "15s", "1m". Defaults to 15s.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub polling_interval: Option<String>,

    #[serde(default)]
    pub disable_polling: bool,

    /// Bumping this forces a fresh clone job for the current commit.
    #[serde(default)]
    pub force_sync_generation: i64,

    /// Namespace every bundle resource is forced into.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target_namespace: Option<String>,

    #[serde(default)]
    pub paused: bool,

    #[serde(default)]
    pub delete_namespace: bool,

    #[serde(default)]
    pub keep_resources: bool,

    /// Commit template for image-scan write-backs.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image_scan_commit: Option<CommitSpec>,
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct CommitSpec {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub author_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub author_email: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message_template: Option<String>,
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct SourceDisplay {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ready_clusters: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub state: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<bool>,
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct GitRepoStatus {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub observed_generation: Option<i64>,

    #[serde(default)]
    pub conditions: Vec<Condition>,

    /// Last commit observed by the poller (or stamped from a finished job).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub commit: Option<String>,

    /// Written by an external webhook receiver; trumps polling.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub webhook_commit: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_polling_time: Option<Time>,

    /// Current | InProgress | Failed | Terminating
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub git_job_status: Option<String>,

    #[serde(default)]
    pub summary: BundleSummary,

    #[serde(default)]
    pub display: SourceDisplay,

    #[serde(default)]
    pub desired_ready_clusters: i64,
    #[serde(default)]
    pub ready_clusters: i64,

    /// Aggregated per-kind resource counts across child bundles.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub resource_counts: BTreeMap<String, i64>,
}

/// # HelmOp
/// Symmetric to GitRepo; the source is a chart coordinate. The reconciler
/// resolves version ranges against the repository index and authors a
/// single bundle with server-side pull options.
#[derive(CustomResource, Deserialize, Serialize, Clone, Debug, Default, JsonSchema)]
#[kube(
    group = "fleet.phgit.io",
    version = "v1alpha1",
    kind = "HelmOp",
    namespaced,
    status = "HelmOpStatus",
    printcolumn = r#"{"name":"Chart", "type":"string", "jsonPath":".spec.chart"}"#,
    printcolumn = r#"{"name":"Version", "type":"string", "jsonPath":".status.version"}"#,
    shortname = "fho"
)]
#[serde(rename_all = "camelCase")]
pub struct HelmOpSpec {
    /// Chart repository URL.
    pub repo: String,

    pub chart: String,

    /// Strict version or SemVer range; ranges are resolved before bundles
    /// deploy.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,

    /// Credential secret for the chart repository and for agent-side pulls.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub helm_secret_name: Option<String>,

    #[serde(default, rename = "insecureSkipTLSVerify")]
    pub insecure_skip_tls_verify: bool,

    /// Duration string; re-resolve cadence for version ranges.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub polling_interval: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target_namespace: Option<String>,

    #[serde(default)]
    pub paused: bool,

    #[serde(default)]
    pub delete_namespace: bool,

    #[serde(default)]
    pub keep_resources: bool,
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct HelmOpStatus {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub observed_generation: Option<i64>,

    #[serde(default)]
    pub conditions: Vec<Condition>,

    /// Strict version the range resolved to.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_polling_time: Option<Time>,

    #[serde(default)]
    pub summary: BundleSummary,

    #[serde(default)]
    pub display: SourceDisplay,

    #[serde(default)]
    pub desired_ready_clusters: i64,
    #[serde(default)]
    pub ready_clusters: i64,
}

/// # ImageScan
/// Tag-selection policy attached to a GitRepo. The scan executor is
/// external; these objects are purged when their GitRepo goes away.
#[derive(CustomResource, Deserialize, Serialize, Clone, Debug, Default, JsonSchema)]
#[kube(
    group = "fleet.phgit.io",
    version = "v1alpha1",
    kind = "ImageScan",
    namespaced,
    status = "ImageScanStatus",
    shortname = "fis"
)]
#[serde(rename_all = "camelCase")]
pub struct ImageScanSpec {
    /// Owning GitRepo, by name, in the same namespace.
    pub git_repo_name: String,

    /// Image reference to scan.
    pub image: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tag_name: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub interval: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub policy: Option<ImageScanPolicy>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub secret_ref: Option<String>,
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ImageScanPolicy {
    /// SemVer range, e.g. ">=1.0.0 <2.0.0".
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub semver_range: Option<String>,

    /// "asc" or "desc" alphabetical selection.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub alphabetical_order: Option<String>,
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ImageScanStatus {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub observed_generation: Option<i64>,

    #[serde(default)]
    pub conditions: Vec<Condition>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub latest_tag: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub latest_digest: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_scan_time: Option<Time>,
}
