/*
 * Copyright (C) 2025 Pedro Henrique / phkaiser13
 *
 * File: mod.rs
 *
 * This module gathers the Rust data structures that correspond to the fleet
 * Custom Resource Definitions, one file per kind family, plus the label,
 * annotation, finalizer, and secret-type constants every controller shares.
 * The `kube::CustomResource` derive macro on each top-level spec struct maps
 * it to its API Kind; `schemars` generates the embedded OpenAPI schema; and
 * `serde` attributes map idiomatic Rust `snake_case` onto the Kubernetes
 * `camelCase` wire form.
 *
 * The constants below are the only place label/finalizer strings are
 * spelled out. Cross-object references in this system are expressed purely
 * as labels and finalizers; every index and garbage-collection pass keys off
 * the values defined here.
 *
 * SPDX-License-Identifier: Apache-2.0
 */

pub mod bundle;
pub mod bundle_deployment;
pub mod cluster;
pub mod condition;
pub mod content;
pub mod source;

pub use bundle::{
    Bundle, BundleDeploymentOptions, BundleDisplay, BundleHelmOptions, BundleRef, BundleResource,
    BundleSpec, BundleStatus, BundleSummary, BundleTarget, BundleTargetRestriction, HelmOptions,
    PartitionSpec, PartitionStatus, RolloutStrategy,
};
pub use bundle_deployment::{
    BundleDeployment, BundleDeploymentDisplay, BundleDeploymentSpec, BundleDeploymentStatus,
    ModifiedStatus, NonReadyStatus,
};
pub use cluster::{
    AgentStatus, Cluster, ClusterDisplay, ClusterGroup, ClusterGroupDisplay, ClusterGroupSpec,
    ClusterGroupStatus, ClusterSpec, ClusterStatus,
};
pub use condition::Condition;
pub use content::{Content, ContentSpec};
pub use source::{
    CommitSpec, GitRepo, GitRepoSpec, GitRepoStatus, HelmOp, HelmOpSpec, HelmOpStatus, ImageScan,
    ImageScanPolicy, ImageScanSpec, ImageScanStatus, SourceDisplay,
};

/// API group for every fleet kind.
pub const GROUP: &str = "fleet.phgit.io";
pub const VERSION: &str = "v1alpha1";

// --- Labels ---

/// Owning bundle of a BundleDeployment.
pub const BUNDLE_NAME_LABEL: &str = "fleet.phgit.io/bundle-name";
pub const BUNDLE_NAMESPACE_LABEL: &str = "fleet.phgit.io/bundle-namespace";
/// Target cluster of a BundleDeployment.
pub const CLUSTER_LABEL: &str = "fleet.phgit.io/cluster";
pub const CLUSTER_NAMESPACE_LABEL: &str = "fleet.phgit.io/cluster-namespace";
/// Source (GitRepo or HelmOp) that authored a Bundle.
pub const REPO_LABEL: &str = "fleet.phgit.io/repo-name";
/// Content object referenced by a BundleDeployment (inline backend only).
pub const CONTENT_ID_LABEL: &str = "fleet.phgit.io/content-id";
/// Marks namespaces and secrets created by the operator.
pub const MANAGED_LABEL: &str = "fleet.phgit.io/managed";
/// Marks secrets cloned into per-cluster namespaces for agent consumption.
pub const INTERNAL_SECRET_LABEL: &str = "fleet.phgit.io/internal-secret";
/// Horizontal sharding of the controller set.
pub const SHARD_LABEL: &str = "fleet.phgit.io/shard-id";
/// Generation labels stamped on git clone jobs.
pub const GITREPO_GENERATION_LABEL: &str = "fleet.phgit.io/gitrepo-generation";
pub const FORCE_SYNC_GENERATION_LABEL: &str = "fleet.phgit.io/force-sync-generation";

// --- Annotations ---

/// Commit a git clone job was created for.
pub const COMMIT_ANNOTATION: &str = "fleet.phgit.io/commit";
pub const CLUSTER_ANNOTATION: &str = "fleet.phgit.io/cluster";
pub const CLUSTER_NAMESPACE_ANNOTATION: &str = "fleet.phgit.io/cluster-namespace";

// --- Finalizers ---

pub const GITREPO_FINALIZER: &str = "fleet.phgit.io/gitrepo-finalizer";
pub const HELMOP_FINALIZER: &str = "fleet.phgit.io/helmop-finalizer";
pub const BUNDLE_FINALIZER: &str = "fleet.phgit.io/bundle-finalizer";
pub const BUNDLE_DEPLOYMENT_FINALIZER: &str = "fleet.phgit.io/bundle-deployment-finalizer";
pub const SCHEDULE_FINALIZER: &str = "fleet.phgit.io/schedule-finalizer";
/// Per-consumer finalizers on Content objects are this prefix plus the
/// referring deployment's namespace and name.
pub const CONTENT_FINALIZER_PREFIX: &str = "fleet.phgit.io/bd-";

// --- Secret types ---

pub const SECRET_TYPE_VALUES: &str = "fleet.phgit.io/bundle-values/v1alpha1";
pub const SECRET_TYPE_OPTIONS: &str = "fleet.phgit.io/bundle-deployment-options/v1alpha1";
pub const SECRET_TYPE_OCI: &str = "fleet.phgit.io/oci-access/v1alpha1";

/// Finalizer a BundleDeployment holds on its Content object.
pub fn content_finalizer(bd_namespace: &str, bd_name: &str) -> String {
    format!("{CONTENT_FINALIZER_PREFIX}{bd_namespace}-{bd_name}")
}
