/*
 * Copyright (C) 2025 Pedro Henrique / phkaiser13
 *
 * File: mod.rs
 *
 * Controller wiring and the helpers every reconciler shares. One
 * kube-runtime Controller is instantiated per primary kind; all of them run
 * concurrently on the same client and shared context, joined in run().
 * Watch configurations honor the shard label so replicas can partition the
 * object space without coordination.
 *
 * Shared helpers: finalizer add/remove via merge patches, status patching
 * with conflict retry (two controllers may touch status on the same
 * object), and Warning event publication with categorized reasons.
 *
 * SPDX-License-Identifier: Apache-2.0
 */

pub mod bundle_controller;
pub mod bundledeployment_controller;
pub mod cluster_controller;
pub mod clustergroup_controller;
pub mod content_controller;
pub mod git_job;
pub mod gitrepo_controller;
pub mod helmop_controller;

use futures::stream::StreamExt;
use kube::api::{Api, Patch, PatchParams};
use kube::core::object::HasStatus;
use kube::runtime::controller::Controller;
use kube::runtime::events::{Event, EventType, Recorder, Reporter};
use kube::runtime::reflector::ObjectRef;
use kube::runtime::watcher;
use kube::{Client, Resource, ResourceExt};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::fmt::Debug;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

use crate::config;
use crate::crds::{
    Bundle, BundleDeployment, Cluster, ClusterGroup, Content, GitRepo, HelmOp,
    BUNDLE_NAME_LABEL, BUNDLE_NAMESPACE_LABEL, CLUSTER_LABEL, CLUSTER_NAMESPACE_LABEL,
    CONTENT_ID_LABEL, REPO_LABEL,
};
use crate::error::{Error, Result};

/// Attempts for status patches racing other controllers.
const STATUS_PATCH_ATTEMPTS: u32 = 5;
/// Field manager name for server-side applies.
pub const FIELD_MANAGER: &str = "phgit-fleet-operator";

/// Shared context passed to every reconciliation loop.
pub struct Context {
    pub client: Client,
    pub reporter: Reporter,
}

impl Context {
    pub fn new(client: Client) -> Arc<Self> {
        Arc::new(Context {
            client,
            reporter: Reporter {
                controller: FIELD_MANAGER.into(),
                instance: config::shard_id(),
            },
        })
    }
}

/// Watcher configuration honoring the shard label: a sharded replica only
/// sees objects carrying its shard ID.
pub fn watcher_config() -> watcher::Config {
    match config::shard_id() {
        Some(shard) => watcher::Config::default()
            .labels(&format!("{}={}", crate::crds::SHARD_LABEL, shard)),
        None => watcher::Config::default(),
    }
}

/// Add a finalizer if absent. Returns true when a write happened; the
/// caller should end the reconcile and let the write re-queue it.
pub async fn ensure_finalizer<K>(api: &Api<K>, obj: &K, finalizer: &str) -> Result<bool>
where
    K: Resource<DynamicType = ()> + Clone + DeserializeOwned + Debug,
{
    if obj.finalizers().iter().any(|f| f == finalizer) {
        return Ok(false);
    }
    let mut finalizers: Vec<String> = obj.finalizers().to_vec();
    finalizers.push(finalizer.to_string());
    let patch = serde_json::json!({ "metadata": { "finalizers": finalizers } });
    api.patch(
        &obj.name_any(),
        &PatchParams::default(),
        &Patch::Merge(&patch),
    )
    .await?;
    Ok(true)
}

/// Remove a finalizer if present. Missing objects are fine; the cascade
/// already won.
pub async fn remove_finalizer<K>(api: &Api<K>, obj: &K, finalizer: &str) -> Result<()>
where
    K: Resource<DynamicType = ()> + Clone + DeserializeOwned + Debug,
{
    if !obj.finalizers().iter().any(|f| f == finalizer) {
        return Ok(());
    }
    let finalizers: Vec<String> = obj
        .finalizers()
        .iter()
        .filter(|f| f.as_str() != finalizer)
        .cloned()
        .collect();
    let patch = serde_json::json!({ "metadata": { "finalizers": finalizers } });
    match api
        .patch(
            &obj.name_any(),
            &PatchParams::default(),
            &Patch::Merge(&patch),
        )
        .await
    {
        Ok(_) => Ok(()),
        Err(kube::Error::Api(e)) if e.code == 404 => Ok(()),
        Err(e) => Err(e.into()),
    }
}

/// Patch the status subresource with merge semantics, retrying conflicts
/// with a short exponential backoff. Conflicts after the last attempt are
/// swallowed; the next tick re-observes.
pub async fn patch_status<K, S>(api: &Api<K>, name: &str, status: &S) -> Result<()>
where
    K: Resource<DynamicType = ()> + HasStatus + Clone + DeserializeOwned + Debug,
    S: Serialize,
{
    let patch = serde_json::json!({ "status": status });
    let mut delay = Duration::from_millis(100);
    for attempt in 0..STATUS_PATCH_ATTEMPTS {
        match api
            .patch_status(name, &PatchParams::default(), &Patch::Merge(&patch))
            .await
        {
            Ok(_) => return Ok(()),
            Err(kube::Error::Api(e)) if e.code == 409 => {
                if attempt + 1 == STATUS_PATCH_ATTEMPTS {
                    warn!("status patch for {name} kept conflicting, leaving it to the next tick");
                    return Ok(());
                }
                tokio::time::sleep(delay).await;
                delay *= 2;
            }
            Err(kube::Error::Api(e)) if e.code == 404 => return Ok(()),
            Err(e) => return Err(e.into()),
        }
    }
    Ok(())
}

/// Publish a Warning event with a categorized reason.
pub async fn warn_event<K>(ctx: &Context, obj: &K, reason: &str, note: String)
where
    K: Resource<DynamicType = ()>,
{
    let recorder = Recorder::new(ctx.client.clone(), ctx.reporter.clone(), obj.object_ref(&()));
    let event = Event {
        type_: EventType::Warning,
        reason: reason.to_string(),
        note: Some(note),
        action: "Reconciling".to_string(),
        secondary: None,
    };
    if let Err(err) = recorder.publish(event).await {
        warn!("failed to publish event: {err}");
    }
}

/// Map a BundleDeployment event back to its owning Bundle.
fn bundle_of(bd: &BundleDeployment) -> Option<ObjectRef<Bundle>> {
    let labels = bd.metadata.labels.as_ref()?;
    let name = labels.get(BUNDLE_NAME_LABEL)?;
    let namespace = labels.get(BUNDLE_NAMESPACE_LABEL)?;
    Some(ObjectRef::new(name).within(namespace))
}

/// Map a BundleDeployment event to its Content object.
fn content_of(bd: &BundleDeployment) -> Option<ObjectRef<Content>> {
    let labels = bd.metadata.labels.as_ref()?;
    labels.get(CONTENT_ID_LABEL).map(|id| ObjectRef::new(id))
}

/// Map a BundleDeployment event to its Cluster.
fn cluster_of(bd: &BundleDeployment) -> Option<ObjectRef<Cluster>> {
    let labels = bd.metadata.labels.as_ref()?;
    let name = labels.get(CLUSTER_LABEL)?;
    let namespace = labels.get(CLUSTER_NAMESPACE_LABEL)?;
    Some(ObjectRef::new(name).within(namespace))
}

/// Map a Bundle event back to its source (GitRepo or HelmOp) by repo label.
fn source_of<K>(bundle: &Bundle) -> Option<ObjectRef<K>>
where
    K: Resource<DynamicType = ()>,
{
    let labels = bundle.metadata.labels.as_ref()?;
    let name = labels.get(REPO_LABEL)?;
    let namespace = bundle.metadata.namespace.as_ref()?;
    Some(ObjectRef::new(name).within(namespace))
}

/// Run every controller until the process shuts down.
pub async fn run(client: Client) {
    let ctx = Context::new(client.clone());

    let bundles = Controller::new(Api::<Bundle>::all(client.clone()), watcher_config())
        .watches(
            Api::<BundleDeployment>::all(client.clone()),
            watcher::Config::default(),
            |bd| bundle_of(&bd),
        )
        .run(
            bundle_controller::reconcile,
            bundle_controller::error_policy,
            ctx.clone(),
        )
        .for_each(|res| async move {
            match res {
                Ok(obj) => info!("reconciled Bundle {:?}", obj),
                Err(e) => warn!("Bundle reconcile error: {e}"),
            }
        });

    let bundle_deployments = Controller::new(
        Api::<BundleDeployment>::all(client.clone()),
        watcher_config(),
    )
    .run(
        bundledeployment_controller::reconcile,
        bundledeployment_controller::error_policy,
        ctx.clone(),
    )
    .for_each(|res| async move {
        match res {
            Ok(obj) => info!("reconciled BundleDeployment {:?}", obj),
            Err(e) => warn!("BundleDeployment reconcile error: {e}"),
        }
    });

    let contents = Controller::new(Api::<Content>::all(client.clone()), watcher::Config::default())
        .watches(
            Api::<BundleDeployment>::all(client.clone()),
            watcher::Config::default(),
            |bd| content_of(&bd),
        )
        .run(
            content_controller::reconcile,
            content_controller::error_policy,
            ctx.clone(),
        )
        .for_each(|res| async move {
            match res {
                Ok(obj) => info!("reconciled Content {:?}", obj),
                Err(e) => warn!("Content reconcile error: {e}"),
            }
        });

    let git_repos = Controller::new(Api::<GitRepo>::all(client.clone()), watcher_config())
        .owns(
            Api::<k8s_openapi::api::batch::v1::Job>::all(client.clone()),
            watcher::Config::default(),
        )
        .watches(
            Api::<Bundle>::all(client.clone()),
            watcher::Config::default(),
            |bundle| source_of::<GitRepo>(&bundle),
        )
        .run(
            gitrepo_controller::reconcile,
            gitrepo_controller::error_policy,
            ctx.clone(),
        )
        .for_each(|res| async move {
            match res {
                Ok(obj) => info!("reconciled GitRepo {:?}", obj),
                Err(e) => warn!("GitRepo reconcile error: {e}"),
            }
        });

    let helm_ops = Controller::new(Api::<HelmOp>::all(client.clone()), watcher_config())
        .watches(
            Api::<Bundle>::all(client.clone()),
            watcher::Config::default(),
            |bundle| source_of::<HelmOp>(&bundle),
        )
        .run(
            helmop_controller::reconcile,
            helmop_controller::error_policy,
            ctx.clone(),
        )
        .for_each(|res| async move {
            match res {
                Ok(obj) => info!("reconciled HelmOp {:?}", obj),
                Err(e) => warn!("HelmOp reconcile error: {e}"),
            }
        });

    let clusters = Controller::new(Api::<Cluster>::all(client.clone()), watcher_config())
        .watches(
            Api::<BundleDeployment>::all(client.clone()),
            watcher::Config::default(),
            |bd| cluster_of(&bd),
        )
        .run(
            cluster_controller::reconcile,
            cluster_controller::error_policy,
            ctx.clone(),
        )
        .for_each(|res| async move {
            match res {
                Ok(obj) => info!("reconciled Cluster {:?}", obj),
                Err(e) => warn!("Cluster reconcile error: {e}"),
            }
        });

    let cluster_groups = Controller::new(Api::<ClusterGroup>::all(client.clone()), watcher_config())
        .run(
            clustergroup_controller::reconcile,
            clustergroup_controller::error_policy,
            ctx.clone(),
        )
        .for_each(|res| async move {
            match res {
                Ok(obj) => info!("reconciled ClusterGroup {:?}", obj),
                Err(e) => warn!("ClusterGroup reconcile error: {e}"),
            }
        });

    tokio::join!(
        bundles,
        bundle_deployments,
        contents,
        git_repos,
        helm_ops,
        clusters,
        cluster_groups,
    );
}

/// Shared namespace guard for namespaced reconcilers.
pub fn required_namespace<K>(obj: &K) -> Result<String>
where
    K: Resource<DynamicType = ()>,
{
    obj.namespace().ok_or_else(|| {
        Error::UserInputError(format!(
            "expected {} to be namespaced",
            obj.name_any()
        ))
    })
}
