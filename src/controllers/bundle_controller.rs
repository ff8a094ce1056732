/*
 * Copyright (C) 2025 Pedro Henrique / phkaiser13
 *
 * File: bundle_controller.rs
 *
 * The bundle reconciler: owner of every BundleDeployment. On each tick it
 * splices the values secret back into the spec, stages content for the
 * selected backend, matches targets, runs the rollout governor, converges
 * the child set (create, patch, orphan-purge), maintains the per-deployment
 * option and credential secrets, folds the summary, and patches status.
 *
 * Deletion drains the children first: live deployments get deletion
 * requests and the reconcile requeues until none remain, then the OCI
 * artifact (if any) is garbage collected and the finalizer cleared.
 *
 * Error discipline: failures before children are touched set Ready=False
 * and requeue without deleting anything; failures during child convergence
 * are logged and the status patch is still attempted so partial progress
 * stays visible.
 *
 * SPDX-License-Identifier: Apache-2.0
 */

use k8s_openapi::api::core::v1::Secret;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::OwnerReference;
use k8s_openapi::ByteString;
use kube::api::{Api, DeleteParams, ListParams, ObjectMeta, Patch, PatchParams, PostParams};
use kube::runtime::controller::Action;
use kube::{Resource, ResourceExt};
use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

use super::{
    ensure_finalizer, patch_status, remove_finalizer, required_namespace, warn_event, Context,
};
use crate::content::oci::{OciAccess, OciClient};
use crate::content::{content_object, Manifest};
use crate::crds::condition::{set_condition, Condition, CONDITION_READY};
use crate::crds::{
    Bundle, BundleDeployment, BundleDeploymentOptions, BundleDeploymentSpec, BundleSpec,
    BundleStatus, Cluster, ClusterGroup, Content, BUNDLE_DEPLOYMENT_FINALIZER, BUNDLE_FINALIZER,
    BUNDLE_NAMESPACE_LABEL, BUNDLE_NAME_LABEL, CLUSTER_LABEL, CLUSTER_NAMESPACE_LABEL,
    CONTENT_ID_LABEL, INTERNAL_SECRET_LABEL, REPO_LABEL, SECRET_TYPE_OCI, SECRET_TYPE_OPTIONS,
};
use crate::error::{Error, Result};
use crate::metrics;
use crate::options;
use crate::rollout::{self, CurrentState};
use crate::summary;
use crate::target::{self, Target};

/// Requeue delay while draining children during deletion.
const DELETE_REQUEUE: Duration = Duration::from_secs(2);
/// Steady-state resync; retargeting after cluster relabeling rides on this.
const RESYNC: Duration = Duration::from_secs(15 * 60);

/// Name of the per-bundle OCI access secret the CLI writes.
pub fn oci_secret_name(bundle: &str) -> String {
    format!("{bundle}-oci")
}

/// Experimental gate for the OCI content backend.
fn oci_storage_enabled() -> bool {
    std::env::var("FLEET_EXPERIMENTAL_OCI_STORAGE").as_deref() == Ok("true")
}

/// The content backend selected for one bundle on one tick.
enum Backend {
    /// Inline resources, staged as a cluster-scoped Content object.
    Inline { manifest: Manifest, id: String, digest: String },
    /// Pre-pushed OCI artifact; the access secret carries the reference.
    Oci { secret: Secret, reference: String, contents_id: String },
    /// Externally staged content (server-side Helm pull).
    External { contents_id: String },
}

impl Backend {
    fn content_digest(&self) -> &str {
        match self {
            Backend::Inline { id, .. } => id,
            Backend::Oci { contents_id, .. } => contents_id,
            Backend::External { contents_id } => contents_id,
        }
    }

    fn is_oci(&self) -> bool {
        matches!(self, Backend::Oci { .. })
    }
}

pub async fn reconcile(bundle: Arc<Bundle>, ctx: Arc<Context>) -> Result<Action> {
    metrics::RECONCILE_TOTAL.with_label_values(&["bundle"]).inc();

    let namespace = required_namespace(bundle.as_ref())?;
    let name = bundle.name_any();
    let api: Api<Bundle> = Api::namespaced(ctx.client.clone(), &namespace);

    if bundle.metadata.deletion_timestamp.is_some() {
        return cleanup(&bundle, &namespace, &ctx).await;
    }

    if ensure_finalizer(&api, bundle.as_ref(), BUNDLE_FINALIZER).await? {
        return Ok(Action::await_change());
    }

    debug!(name = %name, namespace = %namespace, "reconciling bundle");

    let mut status = bundle
        .status
        .clone()
        .unwrap_or_default();
    status.observed_generation = bundle.metadata.generation;

    // Values secret: verify the digest and splice the values back into an
    // in-memory copy of the spec. Retryable; the CLI may still be writing.
    let mut spec = bundle.spec.clone();
    if let Err(err) = load_values(&ctx, &namespace, &name, &mut spec).await {
        let message = format!("failed to load values secret: {err}");
        set_condition(
            &mut status.conditions,
            Condition::new_false(CONDITION_READY, "ValuesSecret", &message),
        );
        patch_status(&api, &name, &status).await?;
        warn_event(&ctx, bundle.as_ref(), "FailedToGetValuesSecret", message).await;
        return Err(err);
    }

    // Bundles produced by a HelmOp must carry a strict chart version; a
    // still-unresolved range never reaches the agents.
    if spec.helm_op_options.is_some() {
        let version = spec
            .options
            .helm
            .as_ref()
            .and_then(|h| h.version.as_deref())
            .unwrap_or_default();
        if !version_is_strict(version) {
            set_condition(
                &mut status.conditions,
                Condition::new_false(
                    CONDITION_READY,
                    "VersionNotStrict",
                    "chart version cannot be deployed; check HelmOp status",
                ),
            );
            patch_status(&api, &name, &status).await?;
            return Ok(Action::await_change());
        }
    }

    // Select the content backend for this tick.
    let backend = match resolve_backend(&ctx, &namespace, &name, &spec).await {
        Ok(backend) => backend,
        Err(err) => {
            set_condition(
                &mut status.conditions,
                Condition::new_false(CONDITION_READY, "ContentStaging", &err.to_string()),
            );
            patch_status(&api, &name, &status).await?;
            warn_event(&ctx, bundle.as_ref(), "FailedValidation", err.to_string()).await;
            return if err.is_retryable() { Err(err) } else { Ok(Action::await_change()) };
        }
    };

    // Target matching over the clusters and groups of this namespace.
    let clusters: Vec<Cluster> = Api::<Cluster>::namespaced(ctx.client.clone(), &namespace)
        .list(&ListParams::default())
        .await?
        .items;
    let groups: Vec<ClusterGroup> = Api::<ClusterGroup>::namespaced(ctx.client.clone(), &namespace)
        .list(&ListParams::default())
        .await?
        .items;

    let mut spliced = (*bundle).clone();
    spliced.spec = spec.clone();
    let targets = match target::match_targets(&spliced, backend.content_digest(), &clusters, &groups)
    {
        Ok(targets) => targets,
        Err(err) => {
            let message = format!("targeting error: {err}");
            set_condition(
                &mut status.conditions,
                Condition::new_false(CONDITION_READY, "TargetingError", &message),
            );
            patch_status(&api, &name, &status).await?;
            warn_event(&ctx, bundle.as_ref(), "FailedValidation", message).await;
            return Ok(Action::await_change());
        }
    };

    // Stage the content. Rendering is skipped entirely with zero targets.
    if !targets.is_empty() {
        stage_content(&ctx, &backend).await?;
    }
    match &backend {
        Backend::Inline { id, digest, .. } => {
            status.resources_sha256_sum = Some(digest.clone());
            status.contents_id = Some(id.clone());
            status.oci_reference = None;
        }
        Backend::Oci { reference, contents_id, .. } => {
            status.contents_id = Some(contents_id.clone());
            status.oci_reference = Some(reference.clone());
        }
        Backend::External { contents_id } => {
            status.contents_id = Some(contents_id.clone());
        }
    }

    // Existing children, keyed by their per-cluster namespace.
    let existing = owned_deployments(&ctx, &namespace, &name).await?;
    let existing_by_ns: BTreeMap<String, &BundleDeployment> = existing
        .iter()
        .filter_map(|bd| bd.namespace().map(|ns| (ns, bd)))
        .collect();

    // A bundle that already deployed through one backend must not silently
    // switch to the other.
    for bd in &existing {
        if bd.spec.oci_contents != backend.is_oci() && !bd.spec.deployment_id.is_empty() {
            let message = "content backend changed for deployed bundle".to_string();
            set_condition(
                &mut status.conditions,
                Condition::new_false(CONDITION_READY, "BackendChanged", &message),
            );
            patch_status(&api, &name, &status).await?;
            warn_event(&ctx, bundle.as_ref(), "FailedValidation", message).await;
            return Ok(Action::await_change());
        }
    }

    let current: Vec<CurrentState> = targets
        .iter()
        .map(|t| match existing_by_ns.get(&t.cluster_namespace) {
            Some(bd) => CurrentState {
                exists: true,
                active_id: bd.spec.deployment_id.clone(),
                unavailable: bd.is_unavailable(),
            },
            None => CurrentState::default(),
        })
        .collect();

    // Stage and advance under the rollout budgets. The pre-advance counts
    // feed the budget; the post-advance counts land in status.
    let outcome = rollout::govern(spec.rollout_strategy.as_ref(), &targets, &current, &groups)?;
    status.max_unavailable = outcome.view.max_unavailable;
    status.unavailable = outcome.view.unavailable;
    status.max_new = outcome.view.max_new;
    status.newly_created = outcome.view.newly_created;
    status.partitions = outcome.view.partitions.clone();

    // Converge the child set.
    let mut seen: HashSet<String> = HashSet::new();
    let mut written: Vec<BundleDeployment> = Vec::new();
    for (target, decision) in targets.iter().zip(outcome.decisions.iter()) {
        if decision.deferred {
            continue;
        }
        let live = existing_by_ns.get(&target.cluster_namespace).copied();
        match converge_deployment(&ctx, &spliced, &backend, target, decision, live).await {
            Ok(bd) => {
                if let Some(uid) = bd.uid() {
                    seen.insert(uid);
                }
                written.push(bd);
            }
            Err(err) => {
                // Leave the rest of the tick running; the status patch
                // below still exposes partial progress.
                warn!(
                    "failed to converge deployment for cluster {}: {err}",
                    target.cluster_name
                );
                warn_event(&ctx, bundle.as_ref(), "Failed", err.to_string()).await;
            }
        }
    }

    // Orphan purge: any owned deployment not observed this tick.
    for bd in &existing {
        let uid = bd.uid().unwrap_or_default();
        if seen.contains(&uid) || bd.metadata.deletion_timestamp.is_some() {
            continue;
        }
        let Some(bd_ns) = bd.namespace() else { continue };
        let bd_api: Api<BundleDeployment> = Api::namespaced(ctx.client.clone(), &bd_ns);
        match bd_api.delete(&bd.name_any(), &DeleteParams::default()).await {
            Ok(_) => info!("purged orphaned deployment {}/{}", bd_ns, bd.name_any()),
            Err(kube::Error::Api(e)) if e.code == 404 => {}
            Err(e) => warn!("failed to purge orphaned deployment: {e}"),
        }
    }

    // Fold the summary from the children as written this tick.
    let (folded, worst) = summary::fold_bundle(&written);
    status.summary = folded;
    status.display.ready_clusters = Some(summary::ready_clusters_display(&status.summary));
    status.display.state = worst.map(|s| s.to_string());
    metrics::set_bundle_state(&name, &namespace, worst);

    // Paused deployments stay out of desiredReady but still report ready,
    // so ready can exceed the desired count.
    let all_ready = status.summary.ready >= status.summary.desired_ready
        && worst.is_none()
        && status.observed_generation == bundle.metadata.generation;
    if all_ready {
        set_condition(&mut status.conditions, Condition::new_true(CONDITION_READY));
    } else if worst.is_some() {
        set_condition(
            &mut status.conditions,
            Condition::new_false(
                CONDITION_READY,
                "NotReady",
                &format!(
                    "{} of {} deployments ready",
                    status.summary.ready, status.summary.desired_ready
                ),
            ),
        );
    }

    // Skip the write when nothing changed; steady state is a no-op.
    if !status_equal(bundle.status.as_ref(), &status) {
        patch_status(&api, &name, &status).await?;
    }

    Ok(Action::requeue(RESYNC))
}

pub fn error_policy(_bundle: Arc<Bundle>, error: &Error, _ctx: Arc<Context>) -> Action {
    metrics::RECONCILE_ERRORS.with_label_values(&["bundle"]).inc();
    warn!("bundle reconciliation failed: {error:?}");
    Action::requeue(Duration::from_secs(5))
}

fn status_equal(old: Option<&BundleStatus>, new: &BundleStatus) -> bool {
    match old {
        None => false,
        Some(old) => {
            serde_json::to_value(old).ok() == serde_json::to_value(new).ok()
        }
    }
}

/// Strict versions parse as exact SemVer; anything else is a range.
fn version_is_strict(version: &str) -> bool {
    semver::Version::parse(version.trim_start_matches('v')).is_ok()
}

async fn load_values(
    ctx: &Context,
    namespace: &str,
    name: &str,
    spec: &mut BundleSpec,
) -> Result<()> {
    let Some(expected) = spec.values_hash.clone() else {
        return Ok(());
    };
    let secrets: Api<Secret> = Api::namespaced(ctx.client.clone(), namespace);
    let secret = secrets
        .get_opt(name)
        .await?
        .ok_or_else(|| Error::SecretError {
            name: name.to_string(),
            reason: "values secret not found".to_string(),
        })?;
    let values = secret
        .data
        .as_ref()
        .and_then(|d| d.get("values"))
        .ok_or_else(|| Error::SecretError {
            name: name.to_string(),
            reason: "values secret has no values key".to_string(),
        })?;
    options::splice_values(&mut spec.options, &values.0, &expected)
}

async fn resolve_backend(
    ctx: &Context,
    namespace: &str,
    name: &str,
    spec: &BundleSpec,
) -> Result<Backend> {
    if spec.resources.is_some() && spec.contents_id.is_some() {
        return Err(Error::UserInputError(
            "bundle sets both resources and contentsId".to_string(),
        ));
    }

    let secrets: Api<Secret> = Api::namespaced(ctx.client.clone(), namespace);
    let oci_secret = if oci_storage_enabled() {
        secrets.get_opt(&oci_secret_name(name)).await?
    } else {
        None
    };

    if let Some(secret) = oci_secret {
        if spec.resources.is_some() {
            return Err(Error::UserInputError(
                "bundle carries inline resources and an OCI access secret".to_string(),
            ));
        }
        let access = OciAccess::from_secret(&secret)?;
        let contents_id = spec.contents_id.clone().ok_or_else(|| {
            Error::UserInputError("OCI-backed bundle has no contentsId".to_string())
        })?;
        let reference = format!("{}:{}", access.reference, contents_id);
        return Ok(Backend::Oci { secret, reference, contents_id });
    }

    if let Some(contents_id) = &spec.contents_id {
        return Ok(Backend::External { contents_id: contents_id.clone() });
    }

    let manifest = Manifest::new(spec.resources.clone().unwrap_or_default());
    let (id, digest) = manifest.id()?;
    Ok(Backend::Inline { manifest, id, digest })
}

/// Write the Content object for the inline backend (create-or-update; the
/// object is immutable by construction, so update is a no-op touch).
async fn stage_content(ctx: &Context, backend: &Backend) -> Result<()> {
    let Backend::Inline { manifest, id, .. } = backend else {
        return Ok(());
    };
    let api: Api<Content> = Api::all(ctx.client.clone());
    if api.get_opt(id).await?.is_none() {
        let desired = content_object(manifest)?;
        match api.create(&PostParams::default(), &desired).await {
            Ok(_) => info!("staged content {id}"),
            // Another bundle with identical content raced us; same bytes.
            Err(kube::Error::Api(e)) if e.code == 409 => {}
            Err(e) => return Err(e.into()),
        }
    }
    Ok(())
}

async fn owned_deployments(
    ctx: &Context,
    namespace: &str,
    name: &str,
) -> Result<Vec<BundleDeployment>> {
    let api: Api<BundleDeployment> = Api::all(ctx.client.clone());
    let params = ListParams::default().labels(&format!(
        "{BUNDLE_NAME_LABEL}={name},{BUNDLE_NAMESPACE_LABEL}={namespace}"
    ));
    Ok(api.list(&params).await?.items)
}

fn deployment_labels(bundle: &Bundle, target: &Target, backend: &Backend) -> BTreeMap<String, String> {
    let mut labels = BTreeMap::new();
    labels.insert(BUNDLE_NAME_LABEL.to_string(), bundle.name_any());
    labels.insert(
        BUNDLE_NAMESPACE_LABEL.to_string(),
        bundle.namespace().unwrap_or_default(),
    );
    labels.insert(CLUSTER_LABEL.to_string(), target.cluster_name.clone());
    labels.insert(
        CLUSTER_NAMESPACE_LABEL.to_string(),
        bundle.namespace().unwrap_or_default(),
    );
    if let Backend::Inline { id, .. } = backend {
        labels.insert(CONTENT_ID_LABEL.to_string(), id.clone());
    }
    if let Some(repo) = bundle.labels().get(REPO_LABEL) {
        labels.insert(REPO_LABEL.to_string(), repo.clone());
    }
    // Sharded replicas must see the children of their own bundles.
    if let Some(shard) = bundle.labels().get(crate::crds::SHARD_LABEL) {
        labels.insert(crate::crds::SHARD_LABEL.to_string(), shard.clone());
    }
    labels
}

/// Build the desired child for one target, given the governor's decision
/// and the live object (for preserved active options).
fn desired_deployment(
    bundle: &Bundle,
    backend: &Backend,
    target: &Target,
    decision: &rollout::Decision,
    live: Option<&BundleDeployment>,
) -> Result<BundleDeployment> {
    let active_options: BundleDeploymentOptions = if decision.advanced || live.is_none() {
        target.options.clone()
    } else {
        live.map(|bd| bd.spec.options.clone()).unwrap_or_default()
    };

    let values = options::values_bytes(&active_options)?;
    let values_hash = values.as_deref().map(options::hash_bytes);

    let mut bd = BundleDeployment::new(
        &bundle.name_any(),
        BundleDeploymentSpec {
            deployment_id: decision.active_id.clone(),
            staged_deployment_id: target.deployment_id.clone(),
            options: active_options,
            staged_options: target.options.clone(),
            paused: target.paused,
            oci_contents: backend.is_oci(),
            helm_chart_options: bundle.spec.helm_op_options.is_some(),
            values_hash,
        },
    );
    bd.metadata = ObjectMeta {
        name: Some(bundle.name_any()),
        namespace: Some(target.cluster_namespace.clone()),
        labels: Some(deployment_labels(bundle, target, backend)),
        finalizers: Some(vec![BUNDLE_DEPLOYMENT_FINALIZER.to_string()]),
        ..Default::default()
    };
    Ok(bd)
}

/// Create or patch the child for one target, then sync its secrets and
/// content finalizer. Returns the object as written (status preserved from
/// the live copy for the summary fold).
async fn converge_deployment(
    ctx: &Context,
    bundle: &Bundle,
    backend: &Backend,
    target: &Target,
    decision: &rollout::Decision,
    live: Option<&BundleDeployment>,
) -> Result<BundleDeployment> {
    let desired = desired_deployment(bundle, backend, target, decision, live)?;
    let api: Api<BundleDeployment> = Api::namespaced(ctx.client.clone(), &target.cluster_namespace);

    let written = match live {
        None => {
            let created = api.create(&PostParams::default(), &desired).await?;
            info!(
                "created deployment {}/{}",
                target.cluster_namespace,
                created.name_any()
            );
            created
        }
        Some(live_bd) => {
            let labels_changed = live_bd.metadata.labels.as_ref() != desired.metadata.labels.as_ref();
            if live_bd.spec != desired.spec || labels_changed {
                let patch = serde_json::json!({
                    "metadata": { "labels": desired.metadata.labels },
                    "spec": desired.spec,
                });
                api.patch(
                    &desired.name_any(),
                    &PatchParams::default(),
                    &Patch::Merge(&patch),
                )
                .await?
            } else {
                live_bd.clone()
            }
        }
    };

    // The live status rides along for the summary fold.
    let mut result = written;
    if result.status.is_none() {
        result.status = live.and_then(|bd| bd.status.clone());
    }

    if let Backend::Inline { id, .. } = backend {
        add_content_finalizer(ctx, id, &result).await?;
    }
    sync_options_secret(ctx, &result).await?;
    sync_cloned_secrets(ctx, bundle, backend, &result).await?;

    Ok(result)
}

/// Reference-count the Content object: one finalizer per referring
/// deployment, added when the deployment is created.
async fn add_content_finalizer(ctx: &Context, content_id: &str, bd: &BundleDeployment) -> Result<()> {
    let api: Api<Content> = Api::all(ctx.client.clone());
    let Some(content) = api.get_opt(content_id).await? else {
        return Ok(());
    };
    let finalizer = crate::crds::content_finalizer(
        &bd.namespace().unwrap_or_default(),
        &bd.name_any(),
    );
    ensure_finalizer(&api, &content, &finalizer).await?;
    Ok(())
}

fn controller_owner_ref(bd: &BundleDeployment) -> Option<OwnerReference> {
    Some(OwnerReference {
        api_version: BundleDeployment::api_version(&()).to_string(),
        kind: BundleDeployment::kind(&()).to_string(),
        name: bd.name_any(),
        uid: bd.uid()?,
        controller: Some(true),
        block_owner_deletion: Some(true),
    })
}

/// Maintain the per-deployment options secret: keys `values` and
/// `stagedValues`, deleted when both are empty.
async fn sync_options_secret(ctx: &Context, bd: &BundleDeployment) -> Result<()> {
    let namespace = bd.namespace().unwrap_or_default();
    let api: Api<Secret> = Api::namespaced(ctx.client.clone(), &namespace);
    let name = bd.name_any();

    let values = options::values_bytes(&bd.spec.options)?;
    let staged_values = options::values_bytes(&bd.spec.staged_options)?;

    if values.is_none() && staged_values.is_none() {
        match api.delete(&name, &DeleteParams::default()).await {
            Ok(_) => debug!("removed empty options secret {namespace}/{name}"),
            Err(kube::Error::Api(e)) if e.code == 404 => {}
            Err(e) => return Err(e.into()),
        }
        return Ok(());
    }

    let mut data: BTreeMap<String, ByteString> = BTreeMap::new();
    if let Some(bytes) = values {
        data.insert("values".to_string(), ByteString(bytes));
    }
    if let Some(bytes) = staged_values {
        data.insert("stagedValues".to_string(), ByteString(bytes));
    }

    let secret = Secret {
        metadata: ObjectMeta {
            name: Some(name.clone()),
            namespace: Some(namespace.clone()),
            owner_references: controller_owner_ref(bd).map(|r| vec![r]),
            ..Default::default()
        },
        type_: Some(SECRET_TYPE_OPTIONS.to_string()),
        data: Some(data),
        ..Default::default()
    };

    match api.get_opt(&name).await? {
        None => {
            api.create(&PostParams::default(), &secret).await?;
        }
        Some(_) => {
            api.patch(&name, &PatchParams::default(), &Patch::Merge(&secret))
                .await?;
        }
    }
    Ok(())
}

/// Clone the OCI access secret (agent credentials only) and any Helm pull
/// secret into the per-cluster namespace, owner-ref'd by the deployment.
async fn sync_cloned_secrets(
    ctx: &Context,
    bundle: &Bundle,
    backend: &Backend,
    bd: &BundleDeployment,
) -> Result<()> {
    let namespace = bd.namespace().unwrap_or_default();
    let api: Api<Secret> = Api::namespaced(ctx.client.clone(), &namespace);

    if let Backend::Oci { secret, .. } = backend {
        let access = OciAccess::from_secret(secret)?;
        let mut data: BTreeMap<String, ByteString> = BTreeMap::new();
        data.insert(
            crate::content::oci::KEY_REFERENCE.to_string(),
            ByteString(access.reference.clone().into_bytes()),
        );
        if let Some(user) = &access.agent_username {
            data.insert(
                crate::content::oci::KEY_USERNAME.to_string(),
                ByteString(user.clone().into_bytes()),
            );
        }
        if let Some(password) = &access.agent_password {
            data.insert(
                crate::content::oci::KEY_PASSWORD.to_string(),
                ByteString(password.clone().into_bytes()),
            );
        }
        data.insert(
            crate::content::oci::KEY_BASIC_HTTP.to_string(),
            ByteString(access.basic_http.to_string().into_bytes()),
        );
        data.insert(
            crate::content::oci::KEY_INSECURE_SKIP_TLS.to_string(),
            ByteString(access.insecure_skip_tls.to_string().into_bytes()),
        );

        let clone_name = oci_secret_name(&bd.name_any());
        let clone = Secret {
            metadata: ObjectMeta {
                name: Some(clone_name.clone()),
                namespace: Some(namespace.clone()),
                labels: Some([(INTERNAL_SECRET_LABEL.to_string(), "true".to_string())].into()),
                owner_references: controller_owner_ref(bd).map(|r| vec![r]),
                ..Default::default()
            },
            type_: Some(SECRET_TYPE_OCI.to_string()),
            data: Some(data),
            ..Default::default()
        };
        match api.get_opt(&clone_name).await? {
            None => {
                api.create(&PostParams::default(), &clone).await?;
            }
            Some(_) => {
                api.patch(&clone_name, &PatchParams::default(), &Patch::Merge(&clone))
                    .await?;
            }
        }
    }

    if let Some(helm_secret) = bundle
        .spec
        .helm_op_options
        .as_ref()
        .and_then(|h| h.secret_name.clone())
    {
        let source_ns = bundle.namespace().unwrap_or_default();
        let source_api: Api<Secret> = Api::namespaced(ctx.client.clone(), &source_ns);
        let Some(source) = source_api.get_opt(&helm_secret).await? else {
            return Err(Error::SecretError {
                name: helm_secret,
                reason: "helm secret not found".to_string(),
            });
        };
        let clone = Secret {
            metadata: ObjectMeta {
                name: Some(helm_secret.clone()),
                namespace: Some(namespace.clone()),
                labels: Some([(INTERNAL_SECRET_LABEL.to_string(), "true".to_string())].into()),
                owner_references: controller_owner_ref(bd).map(|r| vec![r]),
                ..Default::default()
            },
            type_: source.type_.clone(),
            data: source.data.clone(),
            ..Default::default()
        };
        match api.get_opt(&helm_secret).await? {
            None => {
                api.create(&PostParams::default(), &clone).await?;
            }
            Some(_) => {
                api.patch(&helm_secret, &PatchParams::default(), &Patch::Merge(&clone))
                    .await?;
            }
        }
    }

    Ok(())
}

/// Deletion: drain children, then GC the OCI artifact and clear the
/// finalizer.
async fn cleanup(bundle: &Bundle, namespace: &str, ctx: &Context) -> Result<Action> {
    let name = bundle.name_any();
    let owned = owned_deployments(ctx, namespace, &name).await?;

    let mut remaining = 0usize;
    for bd in &owned {
        remaining += 1;
        if bd.metadata.deletion_timestamp.is_some() {
            continue;
        }
        let Some(bd_ns) = bd.namespace() else { continue };
        let api: Api<BundleDeployment> = Api::namespaced(ctx.client.clone(), &bd_ns);
        match api.delete(&bd.name_any(), &DeleteParams::default()).await {
            Ok(_) => info!("deleting deployment {}/{}", bd_ns, bd.name_any()),
            Err(kube::Error::Api(e)) if e.code == 404 => remaining -= 1,
            Err(e) => return Err(e.into()),
        }
    }

    if remaining > 0 {
        return Ok(Action::requeue(DELETE_REQUEUE));
    }

    // Last consumer gone: best-effort delete of the OCI artifact.
    if let (Some(contents_id), true) = (
        bundle.status.as_ref().and_then(|s| s.contents_id.clone()),
        bundle
            .status
            .as_ref()
            .and_then(|s| s.oci_reference.as_ref())
            .is_some(),
    ) {
        let secrets: Api<Secret> = Api::namespaced(ctx.client.clone(), namespace);
        if let Some(secret) = secrets.get_opt(&oci_secret_name(&name)).await? {
            match OciAccess::from_secret(&secret).and_then(OciClient::new) {
                Ok(client) => {
                    if let Err(err) = client.delete_manifest(&contents_id).await {
                        warn!("failed to delete OCI artifact for {name}: {err}");
                    }
                }
                Err(err) => warn!("failed to build OCI client for {name}: {err}"),
            }
        }
    }

    metrics::forget(&name, namespace);
    let api: Api<Bundle> = Api::namespaced(ctx.client.clone(), namespace);
    remove_finalizer(&api, bundle, BUNDLE_FINALIZER).await?;
    info!("bundle {namespace}/{name} cleaned up");
    Ok(Action::await_change())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crds::HelmOptions;
    use serde_json::json;

    fn bundle_named(name: &str) -> Bundle {
        let mut bundle = Bundle::new(name, BundleSpec::default());
        bundle.metadata.namespace = Some("fleet-default".to_string());
        bundle
    }

    fn target_for(cluster: &str, deployment_id: &str) -> Target {
        Target {
            cluster_name: cluster.to_string(),
            cluster_namespace: format!("cluster-fleet-default-{cluster}-abcd1234"),
            cluster_labels: BTreeMap::new(),
            paused: false,
            options: BundleDeploymentOptions::default(),
            deployment_id: deployment_id.to_string(),
        }
    }

    fn inline_backend() -> Backend {
        let manifest = Manifest::new(vec![]);
        let (id, digest) = manifest.id().unwrap();
        Backend::Inline { manifest, id, digest }
    }

    #[test]
    fn strict_version_detection() {
        assert!(version_is_strict("1.2.3"));
        assert!(version_is_strict("v1.2.3"));
        assert!(!version_is_strict(">=1.0.0 <2.0.0"));
        assert!(!version_is_strict("1.x"));
        assert!(!version_is_strict(""));
    }

    #[test]
    fn desired_deployment_carries_labels_and_ids() {
        let bundle = bundle_named("app");
        let target = target_for("c1", "s-abc:h1");
        let decision = rollout::Decision {
            create: true,
            deferred: false,
            active_id: "s-abc:h1".to_string(),
            advanced: true,
        };

        let backend = inline_backend();
        let bd = desired_deployment(&bundle, &backend, &target, &decision, None).unwrap();

        assert_eq!(bd.name_any(), "app");
        assert_eq!(
            bd.namespace().as_deref(),
            Some("cluster-fleet-default-c1-abcd1234")
        );
        assert_eq!(bd.spec.deployment_id, "s-abc:h1");
        assert_eq!(bd.spec.staged_deployment_id, "s-abc:h1");
        assert!(!bd.spec.oci_contents);

        let labels = bd.metadata.labels.unwrap();
        assert_eq!(labels.get(BUNDLE_NAME_LABEL).unwrap(), "app");
        assert_eq!(labels.get(BUNDLE_NAMESPACE_LABEL).unwrap(), "fleet-default");
        assert_eq!(labels.get(CLUSTER_LABEL).unwrap(), "c1");
        assert!(labels.contains_key(CONTENT_ID_LABEL));
        assert_eq!(
            bd.metadata.finalizers.unwrap(),
            vec![BUNDLE_DEPLOYMENT_FINALIZER.to_string()]
        );
    }

    #[test]
    fn staged_but_not_advanced_keeps_active_options() {
        let bundle = bundle_named("app");
        let mut target = target_for("c1", "s-new:h2");
        target.options = BundleDeploymentOptions {
            helm: Some(HelmOptions {
                values: Some([("replicas".to_string(), json!("5"))].into()),
                ..Default::default()
            }),
            ..Default::default()
        };

        let mut live = BundleDeployment::new("app", BundleDeploymentSpec::default());
        live.spec.deployment_id = "s-old:h1".to_string();
        live.spec.options = BundleDeploymentOptions {
            helm: Some(HelmOptions {
                values: Some([("replicas".to_string(), json!("2"))].into()),
                ..Default::default()
            }),
            ..Default::default()
        };

        let decision = rollout::Decision {
            create: false,
            deferred: false,
            active_id: "s-old:h1".to_string(),
            advanced: false,
        };

        let backend = inline_backend();
        let bd = desired_deployment(&bundle, &backend, &target, &decision, Some(&live)).unwrap();

        // Active half frozen, staged half current.
        assert_eq!(bd.spec.deployment_id, "s-old:h1");
        assert_eq!(bd.spec.staged_deployment_id, "s-new:h2");
        assert_eq!(
            bd.spec.options.helm.as_ref().unwrap().values.as_ref().unwrap()["replicas"],
            json!("2")
        );
        assert_eq!(
            bd.spec.staged_options.helm.as_ref().unwrap().values.as_ref().unwrap()["replicas"],
            json!("5")
        );
    }

    #[test]
    fn oci_secret_name_is_stable() {
        assert_eq!(oci_secret_name("app"), "app-oci");
    }
}
