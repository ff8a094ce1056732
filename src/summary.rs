/*
 * Copyright (C) 2025 Pedro Henrique / phkaiser13
 *
 * File: summary.rs
 *
 * Status aggregation: the pure folds that turn BundleDeployment states into
 * Bundle summaries, Bundle summaries into GitRepo/HelmOp rollups, and
 * per-cluster deployment lists into Cluster and ClusterGroup rollups.
 * Deployment states form a closed, ranked enum; every fold walks its
 * children in a stable order and records the highest-ranked state as the
 * display state, with "all ready" rendering as an empty string.
 *
 * Everything in this file is a pure function of the listed children so the
 * aggregation rules can be tested without an API server.
 *
 * SPDX-License-Identifier: Apache-2.0
 */

use std::collections::BTreeMap;

use crate::crds::condition::{get_condition, CONDITION_DEPLOYED};
use crate::crds::{Bundle, BundleDeployment, BundleSummary, Cluster};

/// Per-deployment display state. Declaration order is rank order: a later
/// variant always wins the display fold.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum BundleState {
    Ready,
    NotReady,
    Pending,
    OutOfSync,
    Modified,
    WaitApplied,
    ErrApplied,
}

impl BundleState {
    pub fn as_str(&self) -> &'static str {
        match self {
            BundleState::Ready => "Ready",
            BundleState::NotReady => "NotReady",
            BundleState::Pending => "Pending",
            BundleState::OutOfSync => "OutOfSync",
            BundleState::Modified => "Modified",
            BundleState::WaitApplied => "WaitApplied",
            BundleState::ErrApplied => "ErrApplied",
        }
    }

    pub const ALL: [BundleState; 7] = [
        BundleState::Ready,
        BundleState::NotReady,
        BundleState::Pending,
        BundleState::OutOfSync,
        BundleState::Modified,
        BundleState::WaitApplied,
        BundleState::ErrApplied,
    ];
}

impl std::fmt::Display for BundleState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for BundleState {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        BundleState::ALL
            .into_iter()
            .find(|state| state.as_str() == s)
            .ok_or(())
    }
}

/// Worst display state across a set of bundles, from their folded display
/// strings. Empty display strings mean ready and never win.
pub fn worst_bundle_state(bundles: &[Bundle]) -> Option<BundleState> {
    bundles
        .iter()
        .filter_map(|b| b.status.as_ref())
        .filter_map(|s| s.display.state.as_deref())
        .filter_map(|s| s.parse::<BundleState>().ok())
        .max()
}

/// Compute the display state of one deployment from its spec/status pair.
/// Checked most-severe first; the first hit wins.
pub fn deployment_state(bd: &BundleDeployment) -> BundleState {
    let status = match &bd.status {
        // The agent has never reported.
        None => return BundleState::Pending,
        Some(status) => status,
    };

    if let Some(deployed) = get_condition(&status.conditions, CONDITION_DEPLOYED) {
        if !deployed.is_true() && deployed.message.is_some() {
            return BundleState::ErrApplied;
        }
    }

    let applied = status.applied_deployment_id.as_deref();
    if applied.is_none() {
        return BundleState::Pending;
    }
    if applied != Some(bd.spec.deployment_id.as_str()) {
        return BundleState::WaitApplied;
    }
    if !status.non_modified {
        return BundleState::Modified;
    }
    if bd.spec.deployment_id != bd.spec.staged_deployment_id {
        return BundleState::OutOfSync;
    }
    if !status.ready {
        return BundleState::NotReady;
    }
    BundleState::Ready
}

/// Human string for a deployment's `Deployed`/`Monitored` condition.
pub fn condition_display(bd: &BundleDeployment, condition_type: &str) -> String {
    let Some(status) = &bd.status else {
        return "Unknown".to_string();
    };
    match get_condition(&status.conditions, condition_type) {
        None => "Unknown".to_string(),
        Some(cond) if cond.is_true() => "True".to_string(),
        Some(cond) => match &cond.message {
            Some(message) => format!("False: {message}"),
            None => "False".to_string(),
        },
    }
}

fn bucket(summary: &mut BundleSummary, state: BundleState) {
    match state {
        BundleState::Ready => summary.ready += 1,
        BundleState::NotReady => summary.not_ready += 1,
        BundleState::Pending => summary.pending += 1,
        BundleState::OutOfSync => summary.out_of_sync += 1,
        BundleState::Modified => summary.modified += 1,
        BundleState::WaitApplied => summary.wait_applied += 1,
        BundleState::ErrApplied => summary.err_applied += 1,
    }
}

const NON_READY_CAP: usize = 10;

/// Fold owned deployments into a bundle summary plus the display state.
/// Deployments are walked in stable UID order so two folds over the same
/// children yield identical output. Paused deployments are excluded from
/// the desired-ready count.
pub fn fold_bundle(deployments: &[BundleDeployment]) -> (BundleSummary, Option<BundleState>) {
    let mut sorted: Vec<&BundleDeployment> = deployments.iter().collect();
    sorted.sort_by_key(|bd| bd.metadata.uid.clone().unwrap_or_default());

    let mut summary = BundleSummary::default();
    let mut worst: Option<BundleState> = None;

    for bd in sorted {
        if !bd.spec.paused {
            summary.desired_ready += 1;
        }
        let state = deployment_state(bd);
        bucket(&mut summary, state);
        if state != BundleState::Ready {
            if summary.non_ready_resources.len() < NON_READY_CAP {
                summary
                    .non_ready_resources
                    .push(format!("{}: {}", bd.metadata.name.clone().unwrap_or_default(), state));
            }
            worst = Some(match worst {
                Some(prev) if prev >= state => prev,
                _ => state,
            });
        }
    }

    (summary, worst)
}

/// `ready/desiredReady` display string.
pub fn ready_clusters_display(summary: &BundleSummary) -> String {
    format!("{}/{}", summary.ready, summary.desired_ready)
}

/// Fold child bundles into a source-level cluster rollup. A source is as
/// ready as its worst bundle on the cluster axis: desired-ready is the max
/// over bundles, ready is the min over bundles that want any clusters.
pub fn fold_source(bundles: &[Bundle]) -> (BundleSummary, i64, i64) {
    let mut summary = BundleSummary::default();
    let mut desired_ready = 0i64;
    let mut ready: Option<i64> = None;

    for bundle in bundles {
        let Some(status) = &bundle.status else { continue };
        summary.add(&status.summary);
        desired_ready = desired_ready.max(status.summary.desired_ready);
        if status.summary.desired_ready > 0 {
            ready = Some(match ready {
                Some(r) => r.min(status.summary.ready),
                None => status.summary.ready,
            });
        }
    }

    (summary, desired_ready, ready.unwrap_or(0))
}

/// Aggregate per-kind resource counts across bundles; keys are supplied by
/// the agent in each bundle's summary buckets, so upstream just sums what
/// the children expose.
pub fn fold_resource_counts(bundles: &[Bundle]) -> BTreeMap<String, i64> {
    let mut counts = BTreeMap::new();
    for bundle in bundles {
        if let Some(status) = &bundle.status {
            *counts.entry("desiredReady".to_string()).or_insert(0) +=
                status.summary.desired_ready;
            *counts.entry("ready".to_string()).or_insert(0) += status.summary.ready;
        }
    }
    counts
}

/// Fold the deployments living in one cluster's namespace. Returns the
/// summed summary plus `(desiredReadyGitRepos, readyGitRepos)`: a
/// (repo, repoNamespace) pair counts ready iff all of its deployments are
/// ready.
pub fn fold_cluster(deployments: &[BundleDeployment]) -> (BundleSummary, i64, i64) {
    use crate::crds::{BUNDLE_NAMESPACE_LABEL, REPO_LABEL};

    let mut summary = BundleSummary::default();
    let mut repos: BTreeMap<(String, String), bool> = BTreeMap::new();

    for bd in deployments {
        if !bd.spec.paused {
            summary.desired_ready += 1;
        }
        let state = deployment_state(bd);
        bucket(&mut summary, state);

        let labels = bd.metadata.labels.clone().unwrap_or_default();
        let (Some(repo), Some(repo_ns)) = (
            labels.get(REPO_LABEL).cloned(),
            labels.get(BUNDLE_NAMESPACE_LABEL).cloned(),
        ) else {
            continue;
        };
        let entry = repos.entry((repo, repo_ns)).or_insert(true);
        *entry = *entry && state == BundleState::Ready;
    }

    let desired = repos.len() as i64;
    let ready = repos.values().filter(|ok| **ok).count() as i64;
    (summary, desired, ready)
}

/// Display state for a cluster: `WaitCheckIn` until the agent reports.
pub fn cluster_state(cluster: &Cluster, summary: &BundleSummary) -> Option<String> {
    let checked_in = cluster
        .status
        .as_ref()
        .and_then(|s| s.agent.last_seen.as_ref())
        .is_some();
    if !checked_in {
        return Some("WaitCheckIn".to_string());
    }
    if summary.ready < summary.desired_ready {
        return Some("NotReady".to_string());
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crds::condition::Condition;
    use crate::crds::{BundleDeploymentSpec, BundleDeploymentStatus};
    use kube::core::ObjectMeta;

    fn bd(
        uid: &str,
        deployment_id: &str,
        staged: &str,
        applied: Option<&str>,
        ready: bool,
    ) -> BundleDeployment {
        BundleDeployment {
            metadata: ObjectMeta {
                name: Some(format!("bd-{uid}")),
                uid: Some(uid.to_string()),
                ..Default::default()
            },
            spec: BundleDeploymentSpec {
                deployment_id: deployment_id.to_string(),
                staged_deployment_id: staged.to_string(),
                ..Default::default()
            },
            status: Some(BundleDeploymentStatus {
                ready,
                non_modified: true,
                applied_deployment_id: applied.map(str::to_string),
                ..Default::default()
            }),
        }
    }

    #[test]
    fn state_ranking_matches_severity() {
        assert!(BundleState::Ready < BundleState::NotReady);
        assert!(BundleState::NotReady < BundleState::Pending);
        assert!(BundleState::Pending < BundleState::OutOfSync);
        assert!(BundleState::OutOfSync < BundleState::Modified);
        assert!(BundleState::Modified < BundleState::WaitApplied);
        assert!(BundleState::WaitApplied < BundleState::ErrApplied);
    }

    #[test]
    fn deployment_states() {
        // Fresh deployment, no agent report.
        let mut fresh = bd("u1", "s-a:1", "s-a:1", None, false);
        fresh.status = None;
        assert_eq!(deployment_state(&fresh), BundleState::Pending);

        // Agent applied an older ID.
        let upgrading = bd("u2", "s-a:2", "s-a:2", Some("s-a:1"), true);
        assert_eq!(deployment_state(&upgrading), BundleState::WaitApplied);

        // Staged ahead of active.
        let staged = bd("u3", "s-a:1", "s-a:2", Some("s-a:1"), true);
        assert_eq!(deployment_state(&staged), BundleState::OutOfSync);

        // Applied but not ready.
        let not_ready = bd("u4", "s-a:1", "s-a:1", Some("s-a:1"), false);
        assert_eq!(deployment_state(&not_ready), BundleState::NotReady);

        // Everything agrees.
        let ready = bd("u5", "s-a:1", "s-a:1", Some("s-a:1"), true);
        assert_eq!(deployment_state(&ready), BundleState::Ready);

        // Deployed condition carries an error.
        let mut err = bd("u6", "s-a:1", "s-a:1", Some("s-a:1"), true);
        err.status.as_mut().unwrap().conditions.push(Condition::new_false(
            CONDITION_DEPLOYED,
            "Error",
            "helm install failed",
        ));
        assert_eq!(deployment_state(&err), BundleState::ErrApplied);
    }

    #[test]
    fn fold_bundle_counts_and_display() {
        let deployments = vec![
            bd("a", "s-a:1", "s-a:1", Some("s-a:1"), true),
            bd("b", "s-a:1", "s-a:1", Some("s-a:1"), false),
            bd("c", "s-a:2", "s-a:2", Some("s-a:1"), true),
        ];
        let (summary, worst) = fold_bundle(&deployments);
        assert_eq!(summary.desired_ready, 3);
        assert_eq!(summary.ready, 1);
        assert_eq!(summary.not_ready, 1);
        assert_eq!(summary.wait_applied, 1);
        // WaitApplied outranks NotReady.
        assert_eq!(worst, Some(BundleState::WaitApplied));
        assert_eq!(ready_clusters_display(&summary), "1/3");
    }

    #[test]
    fn fold_bundle_all_ready_has_empty_display() {
        let deployments = vec![bd("a", "s-a:1", "s-a:1", Some("s-a:1"), true)];
        let (summary, worst) = fold_bundle(&deployments);
        assert_eq!(summary.ready, 1);
        assert_eq!(worst, None);
    }

    #[test]
    fn fold_bundle_excludes_paused_from_desired_ready() {
        let mut paused = bd("a", "s-a:1", "s-a:1", Some("s-a:1"), true);
        paused.spec.paused = true;
        let live = bd("b", "s-a:1", "s-a:1", Some("s-a:1"), true);
        let (summary, _) = fold_bundle(&[paused, live]);
        assert_eq!(summary.desired_ready, 1);
        assert_eq!(summary.ready, 2);
    }

    #[test]
    fn fold_source_is_min_over_worst_bundle() {
        use crate::crds::{BundleSpec, BundleStatus};

        let mk = |ready: i64, desired: i64| Bundle {
            metadata: ObjectMeta::default(),
            spec: BundleSpec::default(),
            status: Some(BundleStatus {
                summary: BundleSummary {
                    ready,
                    desired_ready: desired,
                    ..Default::default()
                },
                ..Default::default()
            }),
        };

        let bundles = vec![mk(3, 3), mk(1, 3), mk(0, 0)];
        let (_, desired, ready) = fold_source(&bundles);
        assert_eq!(desired, 3);
        // The zero-desired bundle does not drag the minimum down.
        assert_eq!(ready, 1);
    }

    #[test]
    fn fold_cluster_counts_repo_pairs() {
        use crate::crds::{BUNDLE_NAMESPACE_LABEL, REPO_LABEL};

        let mut a = bd("a", "s-a:1", "s-a:1", Some("s-a:1"), true);
        a.metadata.labels = Some(
            [
                (REPO_LABEL.to_string(), "repo1".to_string()),
                (BUNDLE_NAMESPACE_LABEL.to_string(), "fleet-default".to_string()),
            ]
            .into(),
        );
        let mut b = bd("b", "s-a:1", "s-a:1", Some("s-a:1"), false);
        b.metadata.labels = Some(
            [
                (REPO_LABEL.to_string(), "repo2".to_string()),
                (BUNDLE_NAMESPACE_LABEL.to_string(), "fleet-default".to_string()),
            ]
            .into(),
        );

        let (summary, desired_repos, ready_repos) = fold_cluster(&[a, b]);
        assert_eq!(summary.desired_ready, 2);
        assert_eq!(desired_repos, 2);
        // repo2 has a non-ready deployment, so only repo1 counts ready.
        assert_eq!(ready_repos, 1);
    }
}
