/*
 * Copyright (C) 2025 Pedro Henrique / phkaiser13
 *
 * File: git_job.rs
 *
 * Clone-job plumbing for the GitRepo controller: building the Kubernetes
 * Job that clones the repository and applies its bundle definitions,
 * mapping Job status to the GitRepo's gitJobStatus field, and digging the
 * actual failure message out of pod termination messages. The CLI inside
 * the job logs JSON lines with a `fleetErrorMessage` field; only those
 * surface to the user, not raw library noise.
 *
 * SPDX-License-Identifier: Apache-2.0
 */

use k8s_openapi::api::batch::v1::{Job, JobSpec};
use k8s_openapi::api::core::v1::{
    Container, EnvVar, Pod, PodSpec, PodTemplateSpec,
};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::OwnerReference;
use kube::api::ObjectMeta;
use kube::{Resource, ResourceExt};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;

use crate::config;
use crate::crds::{
    GitRepo, COMMIT_ANNOTATION, FORCE_SYNC_GENERATION_LABEL, GITREPO_GENERATION_LABEL,
};

/// Init container that clones; its termination messages are infrastructure
/// noise and never surface to users.
pub const GIT_SOURCE_CONTAINER: &str = "step-git-source";
/// Main container running the bundle compiler.
pub const APPLY_CONTAINER: &str = "fleet-apply";

const DEFAULT_CLI_IMAGE: &str = "phgit/fleet-cli:latest";

/// Job display states surfaced on GitRepo status.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GitJobState {
    Current,
    InProgress,
    Failed,
    Terminating,
}

impl GitJobState {
    pub fn as_str(&self) -> &'static str {
        match self {
            GitJobState::Current => "Current",
            GitJobState::InProgress => "InProgress",
            GitJobState::Failed => "Failed",
            GitJobState::Terminating => "Terminating",
        }
    }
}

/// Deterministic job name for a (repo, commit, generation, force-sync)
/// tuple; a change in any component yields a different job.
pub fn job_name(repo: &str, commit: &str, generation: i64, force_sync: i64) -> String {
    let mut hasher = Sha256::new();
    hasher.update(commit.as_bytes());
    hasher.update(generation.to_le_bytes());
    hasher.update(force_sync.to_le_bytes());
    let digest = hex::encode(hasher.finalize());

    let mut prefix = repo.to_string();
    prefix.truncate(45);
    format!("{prefix}-{}", &digest[..8])
}

fn cli_image() -> String {
    match config::get().system_default_registry.as_deref() {
        Some(registry) if !registry.is_empty() => {
            format!("{}/{}", registry.trim_end_matches('/'), DEFAULT_CLI_IMAGE)
        }
        _ => DEFAULT_CLI_IMAGE.to_string(),
    }
}

/// Build the clone job for one observed commit. Jobs are immutable; the
/// controller deletes and recreates rather than patching.
pub fn build_job(repo: &GitRepo, commit: &str) -> Job {
    let name = repo.name_any();
    let namespace = repo.namespace().unwrap_or_default();
    let generation = repo.metadata.generation.unwrap_or_default();
    let force_sync = repo.spec.force_sync_generation;

    let mut labels = BTreeMap::new();
    labels.insert(GITREPO_GENERATION_LABEL.to_string(), generation.to_string());
    labels.insert(FORCE_SYNC_GENERATION_LABEL.to_string(), force_sync.to_string());

    let mut annotations = BTreeMap::new();
    annotations.insert(COMMIT_ANNOTATION.to_string(), commit.to_string());

    let owner = OwnerReference {
        api_version: GitRepo::api_version(&()).to_string(),
        kind: GitRepo::kind(&()).to_string(),
        name: name.clone(),
        uid: repo.uid().unwrap_or_default(),
        controller: Some(true),
        block_owner_deletion: Some(true),
    };

    let mut apply_args = vec![
        "apply".to_string(),
        "--commit".to_string(),
        commit.to_string(),
        "--namespace".to_string(),
        namespace.clone(),
        name.clone(),
    ];
    for path in &repo.spec.paths {
        apply_args.push("--path".to_string());
        apply_args.push(path.clone());
    }
    if let Some(target_ns) = &repo.spec.target_namespace {
        apply_args.push("--target-namespace".to_string());
        apply_args.push(target_ns.clone());
    }

    let clone_container = Container {
        name: GIT_SOURCE_CONTAINER.to_string(),
        image: Some(cli_image()),
        command: Some(vec!["fleet".to_string()]),
        args: Some(vec![
            "gitcloner".to_string(),
            repo.spec.repo.clone(),
            "/workspace".to_string(),
            "--revision".to_string(),
            commit.to_string(),
        ]),
        env: Some(vec![EnvVar {
            name: "GIT_SSL_NO_VERIFY".to_string(),
            value: Some(repo.spec.insecure_skip_tls_verify.to_string()),
            ..Default::default()
        }]),
        ..Default::default()
    };

    let apply_container = Container {
        name: APPLY_CONTAINER.to_string(),
        image: Some(cli_image()),
        command: Some(vec!["fleet".to_string()]),
        args: Some(apply_args),
        ..Default::default()
    };

    Job {
        metadata: ObjectMeta {
            name: Some(job_name(&name, commit, generation, force_sync)),
            namespace: Some(namespace),
            labels: Some(labels),
            annotations: Some(annotations),
            owner_references: Some(vec![owner]),
            ..Default::default()
        },
        spec: Some(JobSpec {
            backoff_limit: Some(2),
            template: PodTemplateSpec {
                metadata: Some(ObjectMeta::default()),
                spec: Some(PodSpec {
                    restart_policy: Some("Never".to_string()),
                    init_containers: Some(vec![clone_container]),
                    containers: vec![apply_container],
                    ..Default::default()
                }),
            },
            ..Default::default()
        }),
        status: None,
    }
}

/// Project a Job's status onto the GitRepo display state.
pub fn job_state(job: &Job) -> GitJobState {
    if job.metadata.deletion_timestamp.is_some() {
        return GitJobState::Terminating;
    }
    let Some(status) = &job.status else {
        return GitJobState::InProgress;
    };
    if status.succeeded.unwrap_or(0) > 0 {
        return GitJobState::Current;
    }
    let failed_condition = status
        .conditions
        .iter()
        .flatten()
        .any(|c| c.type_ == "Failed" && c.status == "True");
    if failed_condition || status.failed.unwrap_or(0) > 0 {
        return GitJobState::Failed;
    }
    GitJobState::InProgress
}

/// Commit a job was created for, from its annotation.
pub fn job_commit(job: &Job) -> Option<String> {
    job.annotations().get(COMMIT_ANNOTATION).cloned()
}

/// Parse a termination-message line for the CLI's structured error field.
fn fleet_error_of_line(line: &str) -> Option<String> {
    let parsed: serde_json::Value = serde_json::from_str(line.trim()).ok()?;
    parsed
        .get("fleetErrorMessage")
        .and_then(|v| v.as_str())
        .map(str::to_string)
}

/// Concatenate the structured errors from a failed job's newest pod,
/// skipping the git-source init container.
pub fn extract_failure_message(pods: &[Pod]) -> Option<String> {
    let newest = pods
        .iter()
        .max_by_key(|pod| pod.creation_timestamp().map(|t| t.0))?;

    let status = newest.status.as_ref()?;
    let mut messages = Vec::new();

    let statuses = status
        .init_container_statuses
        .iter()
        .flatten()
        .chain(status.container_statuses.iter().flatten());
    for container in statuses {
        if container.name == GIT_SOURCE_CONTAINER {
            continue;
        }
        let Some(message) = container
            .state
            .as_ref()
            .and_then(|s| s.terminated.as_ref())
            .and_then(|t| t.message.as_ref())
        else {
            continue;
        };
        for line in message.lines() {
            if let Some(err) = fleet_error_of_line(line) {
                messages.push(err);
            }
        }
    }

    if messages.is_empty() {
        None
    } else {
        Some(messages.join("; "))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crds::GitRepoSpec;
    use k8s_openapi::api::batch::v1::{JobCondition, JobStatus};
    use k8s_openapi::api::core::v1::{
        ContainerState, ContainerStateTerminated, ContainerStatus, PodStatus,
    };

    fn repo() -> GitRepo {
        let mut repo = GitRepo::new(
            "infra",
            GitRepoSpec {
                repo: "https://git.example.com/infra.git".to_string(),
                branch: Some("main".to_string()),
                paths: vec!["clusters/prod".to_string()],
                ..Default::default()
            },
        );
        repo.metadata.namespace = Some("fleet-default".to_string());
        repo.metadata.generation = Some(3);
        repo.metadata.uid = Some("uid-1".to_string());
        repo
    }

    #[test]
    fn job_carries_generation_labels_and_commit_annotation() {
        let job = build_job(&repo(), "abc123");
        let labels = job.metadata.labels.clone().unwrap();
        assert_eq!(labels.get(GITREPO_GENERATION_LABEL).unwrap(), "3");
        assert_eq!(labels.get(FORCE_SYNC_GENERATION_LABEL).unwrap(), "0");
        assert_eq!(job_commit(&job).unwrap(), "abc123");

        let owners = job.metadata.owner_references.unwrap();
        assert_eq!(owners[0].kind, "GitRepo");
        assert_eq!(owners[0].name, "infra");
    }

    #[test]
    fn job_name_changes_with_inputs() {
        let a = job_name("infra", "abc", 1, 0);
        let b = job_name("infra", "abc", 1, 0);
        let c = job_name("infra", "def", 1, 0);
        let d = job_name("infra", "abc", 2, 0);
        let e = job_name("infra", "abc", 1, 1);
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_ne!(a, d);
        assert_ne!(a, e);
        assert!(a.starts_with("infra-"));
    }

    #[test]
    fn job_state_mapping() {
        let mut job = build_job(&repo(), "abc");
        assert_eq!(job_state(&job), GitJobState::InProgress);

        job.status = Some(JobStatus {
            succeeded: Some(1),
            ..Default::default()
        });
        assert_eq!(job_state(&job), GitJobState::Current);

        job.status = Some(JobStatus {
            conditions: Some(vec![JobCondition {
                type_: "Failed".to_string(),
                status: "True".to_string(),
                ..Default::default()
            }]),
            ..Default::default()
        });
        assert_eq!(job_state(&job), GitJobState::Failed);

        job.metadata.deletion_timestamp =
            Some(k8s_openapi::apimachinery::pkg::apis::meta::v1::Time(
                chrono::Utc::now(),
            ));
        assert_eq!(job_state(&job), GitJobState::Terminating);
    }

    fn pod_with_message(container: &str, message: &str) -> Pod {
        Pod {
            status: Some(PodStatus {
                container_statuses: Some(vec![ContainerStatus {
                    name: container.to_string(),
                    state: Some(ContainerState {
                        terminated: Some(ContainerStateTerminated {
                            exit_code: 1,
                            message: Some(message.to_string()),
                            ..Default::default()
                        }),
                        ..Default::default()
                    }),
                    ..Default::default()
                }]),
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    #[test]
    fn failure_messages_filter_for_fleet_errors() {
        let pod = pod_with_message(
            APPLY_CONTAINER,
            "{\"level\":\"fatal\",\"fleetErrorMessage\":\"no fleet.yaml found\"}\nrandom library noise\n",
        );
        assert_eq!(
            extract_failure_message(&[pod]).unwrap(),
            "no fleet.yaml found"
        );
    }

    #[test]
    fn git_source_container_is_ignored() {
        let pod = pod_with_message(
            GIT_SOURCE_CONTAINER,
            "{\"fleetErrorMessage\":\"clone noise\"}",
        );
        assert!(extract_failure_message(&[pod]).is_none());
    }
}
