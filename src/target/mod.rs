/*
 * Copyright (C) 2025 Pedro Henrique / phkaiser13
 *
 * File: mod.rs
 *
 * The target matcher: a pure function from (bundle spec, clusters, cluster
 * groups) to the ordered list of targets the bundle reconciler materializes
 * as BundleDeployments. Restrictions form a whitelist (union of predicates,
 * empty list allows all); targets are customization rules evaluated in
 * declaration order with first-match-wins option overlays; the result is
 * sorted by cluster name so downstream diffs are deterministic.
 *
 * All four predicate fields of a tuple are conjunctive: every field that is
 * set must match. A tuple with no fields set matches every cluster.
 *
 * SPDX-License-Identifier: Apache-2.0
 */

pub mod selector;

use k8s_openapi::apimachinery::pkg::apis::meta::v1::LabelSelector;
use kube::ResourceExt;
use std::collections::BTreeMap;

use crate::crds::{
    Bundle, BundleDeploymentOptions, BundleTarget, BundleTargetRestriction, Cluster, ClusterGroup,
    PartitionSpec,
};
use crate::error::Result;
use crate::options;

/// A (bundle, cluster) pairing with fully merged options, ready to be
/// realized as a BundleDeployment.
#[derive(Debug, Clone)]
pub struct Target {
    pub cluster_name: String,
    /// The cluster's per-cluster namespace on the upstream cluster.
    pub cluster_namespace: String,
    /// Labels of the cluster; partition assignment matches against these.
    pub cluster_labels: BTreeMap<String, String>,
    /// Cluster or bundle is paused; staged but never advanced.
    pub paused: bool,
    pub options: BundleDeploymentOptions,
    pub deployment_id: String,
}

/// The predicate tuple shared by targets, restrictions, and partitions.
pub struct Predicate<'a> {
    pub cluster_name: Option<&'a str>,
    pub cluster_selector: Option<&'a LabelSelector>,
    pub cluster_group: Option<&'a str>,
    pub cluster_group_selector: Option<&'a LabelSelector>,
}

impl<'a> From<&'a BundleTarget> for Predicate<'a> {
    fn from(t: &'a BundleTarget) -> Self {
        Predicate {
            cluster_name: t.cluster_name.as_deref(),
            cluster_selector: t.cluster_selector.as_ref(),
            cluster_group: t.cluster_group.as_deref(),
            cluster_group_selector: t.cluster_group_selector.as_ref(),
        }
    }
}

impl<'a> From<&'a BundleTargetRestriction> for Predicate<'a> {
    fn from(r: &'a BundleTargetRestriction) -> Self {
        Predicate {
            cluster_name: r.cluster_name.as_deref(),
            cluster_selector: r.cluster_selector.as_ref(),
            cluster_group: r.cluster_group.as_deref(),
            cluster_group_selector: r.cluster_group_selector.as_ref(),
        }
    }
}

impl<'a> From<&'a PartitionSpec> for Predicate<'a> {
    fn from(p: &'a PartitionSpec) -> Self {
        Predicate {
            cluster_name: p.cluster_name.as_deref(),
            cluster_selector: p.cluster_selector.as_ref(),
            cluster_group: p.cluster_group.as_deref(),
            cluster_group_selector: p.cluster_group_selector.as_ref(),
        }
    }
}

/// Does `predicate` match the cluster? Group membership is evaluated
/// against the groups that contain the cluster: a named group must be one
/// of them, a group selector must match at least one of them.
pub fn predicate_matches(
    predicate: &Predicate<'_>,
    cluster_name: &str,
    cluster_labels: &BTreeMap<String, String>,
    containing_groups: &[&ClusterGroup],
) -> Result<bool> {
    if let Some(name) = predicate.cluster_name {
        if name != cluster_name {
            return Ok(false);
        }
    }

    if let Some(sel) = predicate.cluster_selector {
        if !selector::matches(sel, cluster_labels)? {
            return Ok(false);
        }
    }

    if let Some(group_name) = predicate.cluster_group {
        if !containing_groups.iter().any(|g| g.name_any() == group_name) {
            return Ok(false);
        }
    }

    if let Some(group_sel) = predicate.cluster_group_selector {
        let mut any = false;
        for group in containing_groups {
            let group_labels = group.metadata.labels.clone().unwrap_or_default();
            if selector::matches(group_sel, &group_labels)? {
                any = true;
                break;
            }
        }
        if !any {
            return Ok(false);
        }
    }

    Ok(true)
}

/// Compute the groups whose selector contains the cluster.
fn groups_containing<'a>(
    cluster_labels: &BTreeMap<String, String>,
    groups: &'a [ClusterGroup],
) -> Result<Vec<&'a ClusterGroup>> {
    let mut containing = Vec::new();
    for group in groups {
        let Some(sel) = &group.spec.selector else { continue };
        if selector::matches(sel, cluster_labels)? {
            containing.push(group);
        }
    }
    Ok(containing)
}

/// Match a bundle against the clusters in its namespace. `content_digest`
/// is the manifest ID the bundle reconciler staged; it forms the first half
/// of every deployment ID.
///
/// Clusters without an assigned per-cluster namespace cannot host
/// deployments yet and are skipped; the cluster reconciler's namespace
/// assignment re-triggers the bundle.
pub fn match_targets(
    bundle: &Bundle,
    content_digest: &str,
    clusters: &[Cluster],
    groups: &[ClusterGroup],
) -> Result<Vec<Target>> {
    let mut sorted: Vec<&Cluster> = clusters.iter().collect();
    sorted.sort_by_key(|c| c.name_any());

    let mut targets = Vec::new();
    for cluster in sorted {
        let cluster_name = cluster.name_any();
        let cluster_namespace = match cluster.status.as_ref().and_then(|s| s.namespace.clone()) {
            Some(ns) if !ns.is_empty() => ns,
            _ => continue,
        };
        let cluster_labels = cluster.metadata.labels.clone().unwrap_or_default();
        let containing = groups_containing(&cluster_labels, groups)?;

        // Whitelist: union of restrictions; empty list allows all.
        if !bundle.spec.target_restrictions.is_empty() {
            let mut allowed = false;
            for restriction in &bundle.spec.target_restrictions {
                if predicate_matches(
                    &restriction.into(),
                    &cluster_name,
                    &cluster_labels,
                    &containing,
                )? {
                    allowed = true;
                    break;
                }
            }
            if !allowed {
                continue;
            }
        }

        // First matching target contributes its overlay; clusters matched
        // by no target still receive the bundle with default options.
        let mut overlay: Option<&BundleDeploymentOptions> = None;
        let mut matched_any_predicate = bundle.spec.targets.is_empty();
        for target in &bundle.spec.targets {
            if predicate_matches(&target.into(), &cluster_name, &cluster_labels, &containing)? {
                overlay = target.options.as_ref();
                matched_any_predicate = true;
                break;
            }
        }

        // With explicit targets and no restrictions, a cluster matching no
        // target is not part of this bundle at all.
        if !matched_any_predicate && bundle.spec.target_restrictions.is_empty() {
            continue;
        }

        let merged = options::merge_options(&bundle.spec.options, overlay)?;
        let deployment_id = options::deployment_id(content_digest, &merged)?;

        targets.push(Target {
            cluster_name,
            cluster_namespace,
            cluster_labels,
            paused: bundle.spec.paused || cluster.spec.paused,
            options: merged,
            deployment_id,
        });
    }

    Ok(targets)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crds::{
        BundleSpec, ClusterGroupSpec, ClusterSpec, ClusterStatus, HelmOptions,
    };
    use kube::core::ObjectMeta;
    use serde_json::json;

    fn cluster(name: &str, labels: &[(&str, &str)]) -> Cluster {
        Cluster {
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                namespace: Some("fleet-default".to_string()),
                labels: Some(
                    labels
                        .iter()
                        .map(|(k, v)| (k.to_string(), v.to_string()))
                        .collect(),
                ),
                ..Default::default()
            },
            spec: ClusterSpec::default(),
            status: Some(ClusterStatus {
                namespace: Some(format!("cluster-fleet-default-{name}-abcd1234")),
                ..Default::default()
            }),
        }
    }

    fn group(name: &str, match_labels: &[(&str, &str)]) -> ClusterGroup {
        ClusterGroup {
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                namespace: Some("fleet-default".to_string()),
                ..Default::default()
            },
            spec: ClusterGroupSpec {
                selector: Some(LabelSelector {
                    match_labels: Some(
                        match_labels
                            .iter()
                            .map(|(k, v)| (k.to_string(), v.to_string()))
                            .collect(),
                    ),
                    match_expressions: None,
                }),
            },
            status: None,
        }
    }

    fn bundle(targets: Vec<BundleTarget>, restrictions: Vec<BundleTargetRestriction>) -> Bundle {
        Bundle {
            metadata: ObjectMeta {
                name: Some("app".to_string()),
                namespace: Some("fleet-default".to_string()),
                ..Default::default()
            },
            spec: BundleSpec {
                targets,
                target_restrictions: restrictions,
                ..Default::default()
            },
            status: None,
        }
    }

    fn selector_target(key: &str, value: &str) -> BundleTarget {
        BundleTarget {
            cluster_selector: Some(LabelSelector {
                match_labels: Some([(key.to_string(), value.to_string())].into()),
                match_expressions: None,
            }),
            ..Default::default()
        }
    }

    fn options_with_replicas(replicas: &str) -> BundleDeploymentOptions {
        BundleDeploymentOptions {
            helm: Some(HelmOptions {
                values: Some([("replicas".to_string(), json!(replicas))].into()),
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    #[test]
    fn selector_target_matches_labeled_cluster() {
        let clusters = vec![cluster("c1", &[("env", "prod")]), cluster("c2", &[])];
        let b = bundle(vec![selector_target("env", "prod")], vec![]);

        let targets = match_targets(&b, "s-abc", &clusters, &[]).unwrap();
        assert_eq!(targets.len(), 1);
        assert_eq!(targets[0].cluster_name, "c1");
        assert!(!targets[0].deployment_id.is_empty());
        assert!(targets[0].deployment_id.starts_with("s-abc:"));
    }

    #[test]
    fn result_is_sorted_and_deterministic() {
        let clusters = vec![
            cluster("zeta", &[("env", "prod")]),
            cluster("alpha", &[("env", "prod")]),
        ];
        let b = bundle(vec![selector_target("env", "prod")], vec![]);

        let first = match_targets(&b, "s-abc", &clusters, &[]).unwrap();
        let second = match_targets(&b, "s-abc", &clusters, &[]).unwrap();

        let names: Vec<_> = first.iter().map(|t| t.cluster_name.clone()).collect();
        assert_eq!(names, vec!["alpha", "zeta"]);
        let ids_first: Vec<_> = first.iter().map(|t| t.deployment_id.clone()).collect();
        let ids_second: Vec<_> = second.iter().map(|t| t.deployment_id.clone()).collect();
        assert_eq!(ids_first, ids_second);
    }

    #[test]
    fn first_matching_target_wins_customization() {
        // Clusters `one` and `two`, both in group `all`; `one` also in
        // group `one`. The first target customizes group `one`, the second
        // covers everyone else.
        let clusters = vec![
            cluster("one", &[("name", "one"), ("fleet", "yes")]),
            cluster("two", &[("name", "two"), ("fleet", "yes")]),
        ];
        let groups = vec![group("one", &[("name", "one")]), group("all", &[("fleet", "yes")])];

        let b = bundle(
            vec![
                BundleTarget {
                    cluster_group: Some("one".to_string()),
                    options: Some(options_with_replicas("1")),
                    ..Default::default()
                },
                BundleTarget {
                    cluster_group: Some("all".to_string()),
                    options: Some(options_with_replicas("4")),
                    ..Default::default()
                },
            ],
            vec![],
        );

        let targets = match_targets(&b, "s-abc", &clusters, &groups).unwrap();
        assert_eq!(targets.len(), 2);

        let replicas = |t: &Target| {
            t.options.helm.as_ref().unwrap().values.as_ref().unwrap()["replicas"].clone()
        };
        assert_eq!(targets[0].cluster_name, "one");
        assert_eq!(replicas(&targets[0]), json!("1"));
        assert_eq!(targets[1].cluster_name, "two");
        assert_eq!(replicas(&targets[1]), json!("4"));
        assert_ne!(targets[0].deployment_id, targets[1].deployment_id);
    }

    #[test]
    fn restrictions_are_a_whitelist() {
        let clusters = vec![
            cluster("c1", &[("env", "prod")]),
            cluster("c2", &[("env", "prod")]),
        ];
        let b = bundle(
            vec![selector_target("env", "prod")],
            vec![BundleTargetRestriction {
                cluster_name: Some("c1".to_string()),
                ..Default::default()
            }],
        );

        let targets = match_targets(&b, "s-abc", &clusters, &[]).unwrap();
        // c2 matches a target but is not whitelisted.
        assert_eq!(targets.len(), 1);
        assert_eq!(targets[0].cluster_name, "c1");
    }

    #[test]
    fn cluster_without_namespace_is_skipped() {
        let mut c = cluster("c1", &[("env", "prod")]);
        c.status = None;
        let b = bundle(vec![selector_target("env", "prod")], vec![]);
        let targets = match_targets(&b, "s-abc", &[c], &[]).unwrap();
        assert!(targets.is_empty());
    }

    #[test]
    fn invalid_selector_surfaces_targeting_error() {
        use k8s_openapi::apimachinery::pkg::apis::meta::v1::LabelSelectorRequirement;

        let clusters = vec![cluster("c1", &[])];
        let b = bundle(
            vec![BundleTarget {
                cluster_selector: Some(LabelSelector {
                    match_labels: None,
                    match_expressions: Some(vec![LabelSelectorRequirement {
                        key: "env".to_string(),
                        operator: "Near".to_string(),
                        values: None,
                    }]),
                }),
                ..Default::default()
            }],
            vec![],
        );

        assert!(match_targets(&b, "s-abc", &clusters, &[]).is_err());
    }

    #[test]
    fn paused_cluster_produces_paused_target() {
        let mut c = cluster("c1", &[("env", "prod")]);
        c.spec.paused = true;
        let b = bundle(vec![selector_target("env", "prod")], vec![]);
        let targets = match_targets(&b, "s-abc", &[c], &[]).unwrap();
        assert_eq!(targets.len(), 1);
        assert!(targets[0].paused);
    }
}
