/*
 * Copyright (C) 2025 Pedro Henrique / phkaiser13
 *
 * File: mod.rs
 *
 * The rollout governor. Given the matched targets of a bundle, their
 * current deployment state, and the bundle's rollout strategy, it decides
 * which targets advance from staged to active deployment ID this tick.
 * Staging is unconditional: every child always carries the latest desired
 * spec. Activation is gated by the global and per-partition maxUnavailable
 * budgets, so targeting-driven spec churn propagates without triggering
 * simultaneous rollouts across all clusters.
 *
 * Budget discipline: the pre-advance unavailability count is the budget
 * input; the governor increments the counters as it advances and creates,
 * and the post-advance numbers are what the bundle status reports. A target
 * that is already unavailable counts against the budget but is still
 * allowed to proceed; only advancing a currently-available target consumes
 * budget headroom.
 *
 * SPDX-License-Identifier: Apache-2.0
 */

use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;

use crate::crds::{ClusterGroup, PartitionStatus, RolloutStrategy};
use crate::error::{Error, Result};
use crate::target::{predicate_matches, Target};

const DEFAULT_MAX_UNAVAILABLE: &str = "25%";
const DEFAULT_MAX_UNAVAILABLE_PARTITIONS: i64 = 1;
const DEFAULT_AUTO_PARTITION_SIZE: &str = "25%";
const DEFAULT_MAX_NEW: i64 = 50;

/// Current deployment state of one target, as observed before this tick.
#[derive(Debug, Clone, Default)]
pub struct CurrentState {
    pub exists: bool,
    /// Active deployment ID of the existing child; empty when absent.
    pub active_id: String,
    /// `appliedDeploymentId != deploymentId || !ready`.
    pub unavailable: bool,
}

/// What the bundle reconciler should write for one target. The staged
/// fields always follow the target's computed deployment ID; only the
/// active ID is governed.
#[derive(Debug, Clone, Default)]
pub struct Decision {
    /// Create the deployment this tick. False for targets beyond the
    /// `maxNew` budget: those get no child at all until a later tick.
    pub create: bool,
    /// Skipped entirely (over the creation budget).
    pub deferred: bool,
    /// Active deployment ID after governing.
    pub active_id: String,
    /// The active options follow the staged options iff the ID advanced.
    pub advanced: bool,
}

/// Post-advance budget view, written to bundle status.
#[derive(Debug, Clone, Default)]
pub struct RolloutView {
    pub max_unavailable: i64,
    pub unavailable: i64,
    pub max_new: i64,
    pub newly_created: i64,
    pub partitions: Vec<PartitionStatus>,
}

pub struct Outcome {
    /// One decision per target, same order as the input.
    pub decisions: Vec<Decision>,
    pub view: RolloutView,
}

/// Parse an int-or-percent budget. Integers are taken verbatim (clamped to
/// zero); `N%` floors against `count` and is clamped to at least one.
pub fn limit(value: Option<&IntOrString>, default: &IntOrString, count: usize) -> Result<i64> {
    let value = value.unwrap_or(default);
    match value {
        IntOrString::Int(i) => Ok((*i as i64).max(0)),
        IntOrString::String(s) => {
            let Some(percent_str) = s.strip_suffix('%') else {
                return s.parse::<i64>().map(|i| i.max(0)).map_err(|_| {
                    Error::UserInputError(format!("invalid unavailable limit {s:?}"))
                });
            };
            let percent: i64 = percent_str.trim().parse().map_err(|_| {
                Error::UserInputError(format!("invalid unavailable percentage {s:?}"))
            })?;
            Ok(((count as i64 * percent) / 100).max(1))
        }
    }
}

struct Partition {
    name: String,
    max_unavailable: i64,
    /// Indices into the target slice, preserving the matcher's order.
    members: Vec<usize>,
}

/// Assign each target to a partition: explicit selectors in declaration
/// order first, the remainder chunked into automatic partitions.
fn assign_partitions(
    strategy: &RolloutStrategy,
    targets: &[Target],
    groups: &[ClusterGroup],
    global_max_unavailable: &IntOrString,
) -> Result<Vec<Partition>> {
    let mut assigned = vec![false; targets.len()];
    let mut partitions = Vec::new();

    for (i, spec) in strategy.partitions.iter().flatten().enumerate() {
        let mut members = Vec::new();
        for (idx, target) in targets.iter().enumerate() {
            if assigned[idx] {
                continue;
            }
            let containing: Vec<&ClusterGroup> = groups
                .iter()
                .filter(|g| match &g.spec.selector {
                    Some(sel) => {
                        crate::target::selector::matches(sel, &target.cluster_labels)
                            .unwrap_or(false)
                    }
                    None => false,
                })
                .collect();
            if predicate_matches(
                &spec.into(),
                &target.cluster_name,
                &target.cluster_labels,
                &containing,
            )? {
                assigned[idx] = true;
                members.push(idx);
            }
        }
        let max_unavailable = limit(
            spec.max_unavailable.as_ref(),
            global_max_unavailable,
            members.len(),
        )?;
        partitions.push(Partition {
            name: spec
                .name
                .clone()
                .unwrap_or_else(|| format!("partition-{i}")),
            max_unavailable,
            members,
        });
    }

    let remainder: Vec<usize> = (0..targets.len()).filter(|i| !assigned[*i]).collect();
    if !remainder.is_empty() {
        let auto_size = limit(
            strategy.auto_partition_size.as_ref(),
            &IntOrString::String(DEFAULT_AUTO_PARTITION_SIZE.to_string()),
            targets.len(),
        )?
        .max(1) as usize;

        for (i, chunk) in remainder.chunks(auto_size).enumerate() {
            let max_unavailable =
                limit(None, global_max_unavailable, chunk.len())?;
            partitions.push(Partition {
                name: format!("auto-{i}"),
                max_unavailable,
                members: chunk.to_vec(),
            });
        }
    }

    Ok(partitions)
}

/// Run the governor. `current[i]` describes the live deployment of
/// `targets[i]`, and `decisions[i]` in the outcome says what to write.
pub fn govern(
    strategy: Option<&RolloutStrategy>,
    targets: &[Target],
    current: &[CurrentState],
    groups: &[ClusterGroup],
) -> Result<Outcome> {
    let default_strategy = RolloutStrategy::default();
    let strategy = strategy.unwrap_or(&default_strategy);

    let global_max_spec = strategy
        .max_unavailable
        .clone()
        .unwrap_or(IntOrString::String(DEFAULT_MAX_UNAVAILABLE.to_string()));
    let max_unavailable = limit(Some(&global_max_spec), &global_max_spec, targets.len())?;
    let max_unavailable_partitions = limit(
        strategy.max_unavailable_partitions.as_ref(),
        &IntOrString::Int(DEFAULT_MAX_UNAVAILABLE_PARTITIONS as i32),
        targets.len(),
    )?;
    let max_new = strategy.max_new.unwrap_or(DEFAULT_MAX_NEW);

    let partitions = assign_partitions(strategy, targets, groups, &global_max_spec)?;

    // Pre-advance budget input: the unavailability of what already exists.
    let mut global_unavailable: i64 = current
        .iter()
        .filter(|c| c.exists && c.unavailable)
        .count() as i64;

    let mut decisions: Vec<Decision> = current
        .iter()
        .map(|c| Decision {
            create: false,
            deferred: false,
            active_id: c.active_id.clone(),
            advanced: false,
        })
        .collect();

    let mut view = RolloutView {
        max_unavailable,
        unavailable: global_unavailable,
        max_new,
        newly_created: 0,
        ..Default::default()
    };

    let mut unavailable_partitions: i64 = 0;
    let mut halted = false;

    for partition in &partitions {
        let mut partition_unavailable: i64 = partition
            .members
            .iter()
            .filter(|&&i| current[i].exists && current[i].unavailable)
            .count() as i64;

        if !halted {
            for &i in &partition.members {
                let target = &targets[i];
                let state = &current[i];
                let decision = &mut decisions[i];

                let mut unavailable = state.unavailable;

                if !state.exists {
                    // First-time deployments are capped per reconcile.
                    if view.newly_created >= max_new {
                        decision.deferred = true;
                        continue;
                    }
                    decision.create = true;
                    view.newly_created += 1;
                    // A fresh child has no status; it is unavailable by
                    // definition and joins the counters immediately.
                    unavailable = true;
                    global_unavailable += 1;
                    partition_unavailable += 1;
                }

                let staged = &target.deployment_id;
                let out_of_sync = decision.active_id != *staged;
                if target.paused || staged.is_empty() || !out_of_sync {
                    continue;
                }

                if unavailable {
                    // Already counted; advancing cannot make things worse.
                    decision.active_id = staged.clone();
                    decision.advanced = true;
                    continue;
                }

                if global_unavailable < max_unavailable
                    && partition_unavailable < partition.max_unavailable
                {
                    decision.active_id = staged.clone();
                    decision.advanced = true;
                    global_unavailable += 1;
                    partition_unavailable += 1;
                }
            }
        }

        view.partitions.push(PartitionStatus {
            name: partition.name.clone(),
            count: partition.members.len() as i64,
            max_unavailable: partition.max_unavailable,
            unavailable: partition_unavailable,
            summary: Default::default(),
        });

        if partition_unavailable > partition.max_unavailable {
            unavailable_partitions += 1;
            if unavailable_partitions >= max_unavailable_partitions {
                // Later partitions stay staged; a subsequent reconcile
                // advances them once earlier partitions heal.
                halted = true;
            }
        }
    }

    view.unavailable = global_unavailable;
    Ok(Outcome { decisions, view })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crds::BundleDeploymentOptions;
    use std::collections::BTreeMap;

    fn target(name: &str, deployment_id: &str) -> Target {
        Target {
            cluster_name: name.to_string(),
            cluster_namespace: format!("cluster-ns-{name}"),
            cluster_labels: BTreeMap::new(),
            paused: false,
            options: BundleDeploymentOptions::default(),
            deployment_id: deployment_id.to_string(),
        }
    }

    fn synced_ready(active: &str) -> CurrentState {
        CurrentState {
            exists: true,
            active_id: active.to_string(),
            unavailable: false,
        }
    }

    #[test]
    fn limit_parses_ints_and_percentages() {
        let pct = IntOrString::String("25%".to_string());
        assert_eq!(limit(None, &pct, 10).unwrap(), 2);
        // Percentages clamp to at least one.
        assert_eq!(limit(None, &pct, 1).unwrap(), 1);
        assert_eq!(
            limit(Some(&IntOrString::Int(0)), &pct, 10).unwrap(),
            0
        );
        assert_eq!(
            limit(Some(&IntOrString::String("50%".to_string())), &pct, 7).unwrap(),
            3
        );
        assert!(limit(Some(&IntOrString::String("many".to_string())), &pct, 7).is_err());
    }

    #[test]
    fn upgrade_respects_max_unavailable() {
        // Ten synced, ready targets at the old ID; resources changed.
        let targets: Vec<Target> = (0..10).map(|i| target(&format!("c{i:02}"), "s-new:1")).collect();
        let current: Vec<CurrentState> = (0..10).map(|_| synced_ready("s-old:1")).collect();

        let strategy = RolloutStrategy {
            max_unavailable: Some(IntOrString::Int(2)),
            ..Default::default()
        };

        let outcome = govern(Some(&strategy), &targets, &current, &[]).unwrap();
        let advanced = outcome.decisions.iter().filter(|d| d.advanced).count();
        assert_eq!(advanced, 2);
        // The rest stay staged at the old active ID.
        for d in outcome.decisions.iter().filter(|d| !d.advanced) {
            assert_eq!(d.active_id, "s-old:1");
        }
        assert_eq!(outcome.view.unavailable, 2);
        assert_eq!(outcome.view.max_unavailable, 2);
    }

    #[test]
    fn already_unavailable_targets_advance_anyway() {
        let targets: Vec<Target> = (0..3).map(|i| target(&format!("c{i}"), "s-new:1")).collect();
        let current = vec![
            CurrentState {
                exists: true,
                active_id: "s-old:1".to_string(),
                unavailable: true,
            },
            synced_ready("s-old:1"),
            synced_ready("s-old:1"),
        ];

        let strategy = RolloutStrategy {
            max_unavailable: Some(IntOrString::Int(1)),
            ..Default::default()
        };

        let outcome = govern(Some(&strategy), &targets, &current, &[]).unwrap();
        // The unavailable one advances without consuming budget headroom;
        // with maxUnavailable=1 already spent, no available target moves.
        assert!(outcome.decisions[0].advanced);
        assert!(!outcome.decisions[1].advanced);
        assert!(!outcome.decisions[2].advanced);
    }

    #[test]
    fn fresh_targets_are_created_and_advanced_immediately() {
        let targets: Vec<Target> = (0..3).map(|i| target(&format!("c{i}"), "s-a:1")).collect();
        let current = vec![CurrentState::default(), CurrentState::default(), CurrentState::default()];

        let outcome = govern(None, &targets, &current, &[]).unwrap();
        for d in &outcome.decisions {
            assert!(d.create);
            assert!(d.advanced);
            assert_eq!(d.active_id, "s-a:1");
        }
        assert_eq!(outcome.view.newly_created, 3);
    }

    #[test]
    fn max_new_defers_creations() {
        let targets: Vec<Target> = (0..5).map(|i| target(&format!("c{i}"), "s-a:1")).collect();
        let current = vec![CurrentState::default(); 5];

        let strategy = RolloutStrategy {
            max_new: Some(2),
            ..Default::default()
        };

        let outcome = govern(Some(&strategy), &targets, &current, &[]).unwrap();
        let created = outcome.decisions.iter().filter(|d| d.create).count();
        let deferred = outcome.decisions.iter().filter(|d| d.deferred).count();
        assert_eq!(created, 2);
        assert_eq!(deferred, 3);
        assert_eq!(outcome.view.newly_created, 2);
    }

    #[test]
    fn paused_targets_stage_but_never_advance() {
        let mut t = target("c0", "s-new:1");
        t.paused = true;
        let current = vec![synced_ready("s-old:1")];

        let outcome = govern(None, &[t], &current, &[]).unwrap();
        assert!(!outcome.decisions[0].advanced);
        assert_eq!(outcome.decisions[0].active_id, "s-old:1");
    }

    #[test]
    fn synced_targets_are_noops() {
        let targets = vec![target("c0", "s-a:1")];
        let current = vec![synced_ready("s-a:1")];

        let outcome = govern(None, &targets, &current, &[]).unwrap();
        assert!(!outcome.decisions[0].advanced);
        assert!(!outcome.decisions[0].create);
        assert_eq!(outcome.view.unavailable, 0);
    }

    #[test]
    fn explicit_partitions_gate_in_order() {
        use crate::crds::PartitionSpec;

        // Two named partitions by cluster name; canary first.
        let mut canary = target("canary", "s-new:1");
        canary.cluster_labels = BTreeMap::new();
        let prod: Vec<Target> = (0..2).map(|i| target(&format!("prod{i}"), "s-new:1")).collect();
        let targets = vec![canary, prod[0].clone(), prod[1].clone()];
        let current = vec![
            synced_ready("s-old:1"),
            synced_ready("s-old:1"),
            synced_ready("s-old:1"),
        ];

        let strategy = RolloutStrategy {
            max_unavailable: Some(IntOrString::Int(3)),
            partitions: Some(vec![
                PartitionSpec {
                    name: Some("canary".to_string()),
                    max_unavailable: Some(IntOrString::Int(1)),
                    cluster_name: Some("canary".to_string()),
                    ..Default::default()
                },
                PartitionSpec {
                    name: Some("prod".to_string()),
                    max_unavailable: Some(IntOrString::Int(1)),
                    cluster_selector: Some(Default::default()),
                    ..Default::default()
                },
            ]),
            ..Default::default()
        };

        let outcome = govern(Some(&strategy), &targets, &current, &[]).unwrap();
        // Canary advances; prod partition gets one advance under its own
        // budget; the third target waits.
        assert!(outcome.decisions[0].advanced);
        let prod_advanced = outcome.decisions[1..]
            .iter()
            .filter(|d| d.advanced)
            .count();
        assert_eq!(prod_advanced, 1);
        assert_eq!(outcome.view.partitions.len(), 2);
        assert_eq!(outcome.view.partitions[0].name, "canary");
    }

    #[test]
    fn unavailability_never_exceeds_budget_across_ticks() {
        // Ten synced targets upgrade under maxUnavailable=2; after every
        // tick some advanced targets become ready again. At no point may
        // the governor push more targets out than the budget allows.
        let targets: Vec<Target> = (0..10).map(|i| target(&format!("c{i:02}"), "s-new:1")).collect();
        let mut current: Vec<CurrentState> = (0..10).map(|_| synced_ready("s-old:1")).collect();

        let strategy = RolloutStrategy {
            max_unavailable: Some(IntOrString::Int(2)),
            ..Default::default()
        };

        for _tick in 0..12 {
            let before_unavailable = current.iter().filter(|c| c.unavailable).count() as i64;
            let outcome = govern(Some(&strategy), &targets, &current, &[]).unwrap();

            let newly_pushed = outcome
                .decisions
                .iter()
                .zip(current.iter())
                .filter(|(d, c)| d.advanced && !c.unavailable)
                .count() as i64;
            assert!(
                before_unavailable + newly_pushed <= 2,
                "tick pushed {newly_pushed} with {before_unavailable} already out"
            );

            // Apply the decisions, then let one advanced target heal.
            let mut healed = false;
            for (state, decision) in current.iter_mut().zip(outcome.decisions.iter()) {
                state.active_id = decision.active_id.clone();
                if decision.advanced {
                    if healed {
                        state.unavailable = true;
                    } else {
                        state.unavailable = false;
                        healed = true;
                    }
                }
            }
            if current.iter().all(|c| c.active_id == "s-new:1" && !c.unavailable) {
                return;
            }
            // Agents eventually report the stragglers ready too.
            for state in current.iter_mut() {
                if state.active_id == "s-new:1" {
                    state.unavailable = false;
                }
            }
        }
        panic!("rollout never converged");
    }

    #[test]
    fn governor_is_deterministic() {
        let targets: Vec<Target> = (0..6).map(|i| target(&format!("c{i}"), "s-new:1")).collect();
        let current: Vec<CurrentState> = (0..6).map(|_| synced_ready("s-old:1")).collect();

        let a = govern(None, &targets, &current, &[]).unwrap();
        let b = govern(None, &targets, &current, &[]).unwrap();
        let ids_a: Vec<_> = a.decisions.iter().map(|d| (d.advanced, d.active_id.clone())).collect();
        let ids_b: Vec<_> = b.decisions.iter().map(|d| (d.advanced, d.active_id.clone())).collect();
        assert_eq!(ids_a, ids_b);
    }
}
