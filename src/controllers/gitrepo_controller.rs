/*
 * Copyright (C) 2025 Pedro Henrique / phkaiser13
 *
 * File: gitrepo_controller.rs
 *
 * The GitRepo reconciler: the poller and clone-job state machine, plus the
 * deletion cascade for everything a repo owns.
 *
 *   IDLE -> OBSERVING -> JOB_PENDING -> JOB_RUNNING -> {SUCCEEDED, FAILED} -> IDLE
 *
 * Polling fetches the latest commit with an ls-remote equivalent on the
 * blocking pool, records fetch metrics, and always advances the polling
 * timestamp so failures back off at the same cadence as successes. A new
 * commit (polled or webhook-delivered), a bumped forceSyncGeneration, or a
 * spec generation change materializes a fresh clone job; Kubernetes Jobs
 * are immutable, so the stale job is deleted first. Job failure surfaces
 * the CLI's structured error lines; job success stamps the commit and
 * removes the job.
 *
 * The reconcile result always requeues at `pollingInterval - elapsed`
 * (floored, with jitter) so the polling cadence survives event storms.
 *
 * SPDX-License-Identifier: Apache-2.0
 */

use chrono::Utc;
use k8s_openapi::api::batch::v1::Job;
use k8s_openapi::api::core::v1::{Pod, Secret};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::Time;
use kube::api::{Api, DeleteParams, ListParams, PropagationPolicy};
use kube::runtime::controller::Action;
use kube::ResourceExt;
use rand::Rng;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

use super::git_job::{self, GitJobState};
use super::{ensure_finalizer, patch_status, remove_finalizer, required_namespace, warn_event, Context};
use crate::crds::condition::{
    clear_condition, set_condition, Condition, CONDITION_GIT_POLLING, CONDITION_READY,
};
use crate::crds::{GitRepo, GitRepoStatus, ImageScan, GITREPO_FINALIZER};
use crate::duration::parse_or_default;
use crate::error::{Error, Result};
use crate::git::{self, GitAuth, RefSpec};
use crate::metrics;
use crate::summary;
use crate::{purge, scan};

const DEFAULT_POLLING_INTERVAL: Duration = Duration::from_secs(15);
/// Floor for the computed requeue so a busy repo cannot spin.
const REQUEUE_FLOOR: Duration = Duration::from_secs(5);
const DELETE_REQUEUE: Duration = Duration::from_secs(2);

pub async fn reconcile(repo: Arc<GitRepo>, ctx: Arc<Context>) -> Result<Action> {
    metrics::RECONCILE_TOTAL.with_label_values(&["gitrepo"]).inc();

    let namespace = required_namespace(repo.as_ref())?;
    let name = repo.name_any();
    let api: Api<GitRepo> = Api::namespaced(ctx.client.clone(), &namespace);

    if repo.metadata.deletion_timestamp.is_some() {
        return cleanup(&repo, &namespace, &ctx).await;
    }

    if ensure_finalizer(&api, repo.as_ref(), GITREPO_FINALIZER).await? {
        return Ok(Action::await_change());
    }

    let mut status = repo.status.clone().unwrap_or_default();
    let spec_changed = status.observed_generation != repo.metadata.generation;

    // Referenced helm secrets must exist before any job runs.
    if let Err(err) = validate_secrets(&ctx, &namespace, &repo).await {
        set_condition(
            &mut status.conditions,
            Condition::new_false(CONDITION_READY, "FailedValidation", &err.to_string()),
        );
        status.observed_generation = repo.metadata.generation;
        patch_status(&api, &name, &status).await?;
        warn_event(&ctx, repo.as_ref(), "FailedValidation", err.to_string()).await;
        // The missing secret is not watched; poll for it.
        return Ok(Action::requeue(Duration::from_secs(30)));
    }

    let interval = parse_or_default(repo.spec.polling_interval.as_deref(), DEFAULT_POLLING_INTERVAL);
    poll_if_due(&ctx, &repo, &mut status, interval, spec_changed).await;

    // Webhook-delivered commits trump polled ones.
    let desired_commit = status
        .webhook_commit
        .clone()
        .or_else(|| status.commit.clone());

    if let Some(commit) = desired_commit.filter(|c| !c.is_empty()) {
        if let Err(err) = converge_job(&ctx, &repo, &commit, &mut status).await {
            warn!("job convergence for {namespace}/{name} failed: {err}");
            warn_event(&ctx, repo.as_ref(), "Failed", err.to_string()).await;
        }
    }

    // Register the repo's scans so the deletion cascade can drain them.
    let scans: Api<ImageScan> = Api::namespaced(ctx.client.clone(), &namespace);
    for scan_obj in scans.list(&ListParams::default()).await?.items {
        if scan_obj.spec.git_repo_name == name {
            scan::register(&namespace, &name, &scan_obj.name_any());
        }
    }

    // Fold child bundles into the source rollup.
    let bundles = purge::owned_bundles(&ctx.client, &namespace, &name).await?;
    let (folded, desired_ready, ready) = summary::fold_source(&bundles);
    status.resource_counts = summary::fold_resource_counts(&bundles);
    status.summary = folded;
    status.desired_ready_clusters = desired_ready;
    status.ready_clusters = ready;
    status.display.ready_clusters = Some(format!("{ready}/{desired_ready}"));
    let worst = summary::worst_bundle_state(&bundles);
    status.display.state = worst.map(|s| s.to_string());
    status.display.error = Some(
        status
            .conditions
            .iter()
            .any(|c| c.type_ == CONDITION_READY && !c.is_true()),
    );

    let job_ok = status.git_job_status.as_deref() != Some(GitJobState::Failed.as_str());
    if job_ok && worst.is_none() {
        set_condition(&mut status.conditions, Condition::new_true(CONDITION_READY));
        status.display.error = Some(false);
    }
    status.observed_generation = repo.metadata.generation;

    let changed = repo
        .status
        .as_ref()
        .map(|old| serde_json::to_value(old).ok() != serde_json::to_value(&status).ok())
        .unwrap_or(true);
    if changed {
        patch_status(&api, &name, &status).await?;
    }

    Ok(Action::requeue(next_requeue(&status, interval)))
}

pub fn error_policy(_repo: Arc<GitRepo>, error: &Error, _ctx: Arc<Context>) -> Action {
    metrics::RECONCILE_ERRORS.with_label_values(&["gitrepo"]).inc();
    warn!("gitrepo reconciliation failed: {error:?}");
    Action::requeue(Duration::from_secs(5))
}

async fn validate_secrets(ctx: &Context, namespace: &str, repo: &GitRepo) -> Result<()> {
    let secrets: Api<Secret> = Api::namespaced(ctx.client.clone(), namespace);
    for reference in [
        repo.spec.helm_secret_name.as_deref(),
        repo.spec.helm_secret_name_for_paths.as_deref(),
    ]
    .into_iter()
    .flatten()
    {
        if secrets.get_opt(reference).await?.is_none() {
            return Err(Error::SecretError {
                name: reference.to_string(),
                reason: "referenced secret does not exist".to_string(),
            });
        }
    }
    Ok(())
}

/// Poll the remote when the interval elapsed or the spec changed. The
/// polling timestamp advances on failure too, preserving the backoff
/// cadence.
async fn poll_if_due(
    ctx: &Context,
    repo: &GitRepo,
    status: &mut GitRepoStatus,
    interval: Duration,
    spec_changed: bool,
) {
    if repo.spec.disable_polling {
        return;
    }
    // Webhook delivery makes polling redundant.
    if status.webhook_commit.is_some() {
        return;
    }

    let due = match &status.last_polling_time {
        None => true,
        Some(last) => {
            let elapsed = Utc::now().signed_duration_since(last.0);
            elapsed.to_std().map(|e| e >= interval).unwrap_or(true)
        }
    };
    if !due && !spec_changed {
        return;
    }

    let namespace = repo.namespace().unwrap_or_default();
    let name = repo.name_any();
    status.last_polling_time = Some(Time(Utc::now()));

    let auth = match load_git_auth(ctx, repo).await {
        Ok(auth) => auth,
        Err(err) => {
            metrics::FETCH_TOTAL
                .with_label_values(&[&name, &namespace, "fail"])
                .inc();
            set_condition(
                &mut status.conditions,
                Condition::new_false(CONDITION_GIT_POLLING, "AuthSecret", &err.to_string()),
            );
            warn_event(ctx, repo, "FailedToGetNewCommit", err.to_string()).await;
            return;
        }
    };

    let url = repo.spec.repo.clone();
    let refspec = RefSpec::from_spec(repo.spec.branch.as_deref(), repo.spec.revision.as_deref());
    let started = Instant::now();
    let fetched = tokio::task::spawn_blocking(move || git::latest_commit(&url, &refspec, &auth))
        .await
        .map_err(|e| Error::RetryableError(format!("fetch task failed: {e}")))
        .and_then(|r| r);

    metrics::FETCH_DURATION
        .with_label_values(&[&name, &namespace])
        .observe(started.elapsed().as_secs_f64());

    match fetched {
        Ok(commit) => {
            metrics::FETCH_TOTAL
                .with_label_values(&[&name, &namespace, "success"])
                .inc();
            if status.commit.as_deref() != Some(commit.as_str()) {
                info!("gitrepo {namespace}/{name} observed commit {commit}");
            }
            status.commit = Some(commit);
            clear_condition(&mut status.conditions, CONDITION_GIT_POLLING);
        }
        Err(err) => {
            metrics::FETCH_TOTAL
                .with_label_values(&[&name, &namespace, "fail"])
                .inc();
            set_condition(
                &mut status.conditions,
                Condition::new_false(CONDITION_GIT_POLLING, "FetchFailed", &err.to_string()),
            );
            warn_event(ctx, repo, "FailedToGetNewCommit", err.to_string()).await;
        }
    }
}

async fn load_git_auth(ctx: &Context, repo: &GitRepo) -> Result<GitAuth> {
    let Some(secret_name) = &repo.spec.client_secret_name else {
        return Ok(GitAuth {
            insecure_skip_tls: repo.spec.insecure_skip_tls_verify,
            ..Default::default()
        });
    };
    let namespace = repo.namespace().unwrap_or_default();
    let secrets: Api<Secret> = Api::namespaced(ctx.client.clone(), &namespace);
    let secret = secrets
        .get_opt(secret_name)
        .await?
        .ok_or_else(|| Error::SecretError {
            name: secret_name.clone(),
            reason: "git credential secret not found".to_string(),
        })?;
    Ok(GitAuth::from_secret(
        &secret,
        repo.spec.insecure_skip_tls_verify,
    ))
}

/// Jobs a repo owns, by owner reference.
async fn owned_jobs(ctx: &Context, namespace: &str, repo: &GitRepo) -> Result<Vec<Job>> {
    let api: Api<Job> = Api::namespaced(ctx.client.clone(), namespace);
    let uid = repo.uid().unwrap_or_default();
    Ok(api
        .list(&ListParams::default())
        .await?
        .items
        .into_iter()
        .filter(|job| {
            job.owner_references()
                .iter()
                .any(|owner| owner.uid == uid)
        })
        .collect())
}

/// Drive the clone-job state machine for the desired commit.
async fn converge_job(
    ctx: &Context,
    repo: &GitRepo,
    commit: &str,
    status: &mut GitRepoStatus,
) -> Result<()> {
    let namespace = repo.namespace().unwrap_or_default();
    let name = repo.name_any();
    let api: Api<Job> = Api::namespaced(ctx.client.clone(), &namespace);

    let desired_name = git_job::job_name(
        &name,
        commit,
        repo.metadata.generation.unwrap_or_default(),
        repo.spec.force_sync_generation,
    );

    let jobs = owned_jobs(ctx, &namespace, repo).await?;
    let current = jobs.iter().find(|job| job.name_any() == desired_name);

    // Stale jobs (older commit or generation) are deleted; jobs are
    // immutable, recreation is the only path.
    for job in jobs.iter().filter(|job| job.name_any() != desired_name) {
        match api
            .delete(
                &job.name_any(),
                &DeleteParams {
                    propagation_policy: Some(PropagationPolicy::Background),
                    ..Default::default()
                },
            )
            .await
        {
            Ok(_) => debug!("deleted stale clone job {}", job.name_any()),
            Err(kube::Error::Api(e)) if e.code == 404 => {}
            Err(e) => return Err(e.into()),
        }
    }

    let Some(job) = current else {
        if repo.spec.paused {
            return Ok(());
        }
        let desired = git_job::build_job(repo, commit);
        api.create(&Default::default(), &desired).await?;
        info!("created clone job {desired_name} for commit {commit}");
        status.git_job_status = Some(GitJobState::InProgress.as_str().to_string());
        return Ok(());
    };

    let state = git_job::job_state(job);
    status.git_job_status = Some(state.as_str().to_string());

    match state {
        GitJobState::Current => {
            // Stamp the commit the job actually processed and record its
            // wall time before removing it.
            if let Some(job_commit) = git_job::job_commit(job) {
                status.commit = Some(job_commit);
            }
            if let (Some(start), Some(end)) = (
                job.status.as_ref().and_then(|s| s.start_time.as_ref()),
                job.status.as_ref().and_then(|s| s.completion_time.as_ref()),
            ) {
                let seconds = end.0.signed_duration_since(start.0).num_milliseconds() as f64 / 1000.0;
                metrics::GITJOB_DURATION
                    .with_label_values(&[&name, &namespace])
                    .observe(seconds.max(0.0));
            }
            set_condition(&mut status.conditions, Condition::new_true(CONDITION_READY));
            match api
                .delete(
                    &job.name_any(),
                    &DeleteParams {
                        propagation_policy: Some(PropagationPolicy::Background),
                        ..Default::default()
                    },
                )
                .await
            {
                Ok(_) => info!("clone job {} succeeded, removed", job.name_any()),
                Err(kube::Error::Api(e)) if e.code == 404 => {}
                Err(e) => return Err(e.into()),
            }
        }
        GitJobState::Failed => {
            let pods: Api<Pod> = Api::namespaced(ctx.client.clone(), &namespace);
            let params = ListParams::default().labels(&format!("job-name={}", job.name_any()));
            let pod_list = pods.list(&params).await?.items;
            let message = git_job::extract_failure_message(&pod_list)
                .unwrap_or_else(|| "git job failed; see job logs".to_string());
            set_condition(
                &mut status.conditions,
                Condition::new_false(CONDITION_READY, "GitJobFailed", &message),
            );
            warn_event(ctx, repo, "Failed", message).await;
        }
        GitJobState::InProgress | GitJobState::Terminating => {}
    }

    Ok(())
}

/// Requeue at `interval - elapsed`, floored, with ±10% jitter so a fleet
/// of repos does not poll in lockstep.
fn next_requeue(status: &GitRepoStatus, interval: Duration) -> Duration {
    let elapsed = status
        .last_polling_time
        .as_ref()
        .and_then(|t| Utc::now().signed_duration_since(t.0).to_std().ok())
        .unwrap_or(Duration::ZERO);
    let base = interval.saturating_sub(elapsed).max(REQUEUE_FLOOR);
    let jitter = rand::thread_rng().gen_range(0.9..1.1);
    base.mul_f64(jitter)
}

/// Deletion cascade: bundles drain first, then the optional target
/// namespace, the image scans, and finally the finalizer.
async fn cleanup(repo: &GitRepo, namespace: &str, ctx: &Context) -> Result<Action> {
    let name = repo.name_any();

    let (remaining, target_namespace) = purge::delete_bundles(
        &ctx.client,
        namespace,
        &name,
        repo.spec.keep_resources,
    )
    .await?;
    if remaining > 0 {
        return Ok(Action::requeue(DELETE_REQUEUE));
    }

    if repo.spec.delete_namespace && !repo.spec.keep_resources {
        let target = target_namespace.or_else(|| repo.spec.target_namespace.clone());
        if let Some(target) = target {
            purge::delete_target_namespace(&ctx.client, &target).await?;
        }
    }

    purge::purge_image_scans(&ctx.client, namespace, &name).await?;

    metrics::forget(&name, namespace);
    let api: Api<GitRepo> = Api::namespaced(ctx.client.clone(), namespace);
    remove_finalizer(&api, repo, GITREPO_FINALIZER).await?;
    info!("gitrepo {namespace}/{name} cleaned up");
    Ok(Action::await_change())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn requeue_preserves_cadence_with_jitter() {
        let interval = Duration::from_secs(100);
        let status = GitRepoStatus {
            last_polling_time: Some(Time(Utc::now())),
            ..Default::default()
        };
        for _ in 0..20 {
            let delay = next_requeue(&status, interval);
            assert!(delay >= Duration::from_secs(89), "{delay:?}");
            assert!(delay <= Duration::from_secs(111), "{delay:?}");
        }
    }

    #[test]
    fn requeue_floors_when_overdue() {
        let long_ago = Utc::now() - chrono::Duration::hours(1);
        let status = GitRepoStatus {
            last_polling_time: Some(Time(long_ago)),
            ..Default::default()
        };
        let delay = next_requeue(&status, Duration::from_secs(15));
        assert!(delay >= REQUEUE_FLOOR.mul_f64(0.9));
        assert!(delay <= REQUEUE_FLOOR.mul_f64(1.1) + Duration::from_millis(1));
    }
}
