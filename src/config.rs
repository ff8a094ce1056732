/*
 * Copyright (C) 2025 Pedro Henrique / phkaiser13
 *
 * File: config.rs
 *
 * Process-wide configuration. A single FleetConfig is deserialized from the
 * `fleet-controller` ConfigMap in the system namespace before any
 * controller starts, and a watch task hot-reloads it on change. Readers
 * snapshot an Arc under a read lock; reconcilers never mutate it.
 *
 * SPDX-License-Identifier: Apache-2.0
 */

use futures::StreamExt;
use k8s_openapi::api::core::v1::ConfigMap;
use kube::api::Api;
use kube::runtime::{watcher, WatchStreamExt};
use kube::Client;
use lazy_static::lazy_static;
use serde::{Deserialize, Serialize};
use std::sync::{Arc, RwLock};
use tracing::{info, warn};

use crate::error::{Error, Result};

/// ConfigMap the operator reads its configuration from.
pub const CONFIG_MAP_NAME: &str = "fleet-controller";
/// Key inside the ConfigMap holding the JSON document.
pub const CONFIG_KEY: &str = "config";
/// Default system namespace; overridable via FLEET_SYSTEM_NAMESPACE.
pub const DEFAULT_SYSTEM_NAMESPACE: &str = "cattle-fleet-system";

#[derive(Deserialize, Serialize, Clone, Debug, Default)]
#[serde(rename_all = "camelCase")]
pub struct FleetConfig {
    /// Upstream API server URL published to agents.
    #[serde(default, rename = "apiServerURL")]
    pub api_server_url: Option<String>,

    /// CA bundle agents use to trust the upstream API server.
    #[serde(default, rename = "apiServerCA")]
    pub api_server_ca: Option<String>,

    /// Image prefix for agent images.
    #[serde(default)]
    pub system_default_registry: Option<String>,

    /// "system-store" or "strict".
    #[serde(default)]
    pub agent_tls_mode: Option<String>,

    /// Delay before clusters are re-enqueued after registration events,
    /// e.g. "10s".
    #[serde(default)]
    pub cluster_enqueue_delay: Option<String>,

    #[serde(default)]
    pub manage_agent: Option<bool>,

    /// Agent resync cadence, e.g. "30m".
    #[serde(default)]
    pub default_resync_agent: Option<String>,

    #[serde(default)]
    pub ignore_cluster_registration_labels: bool,
}

lazy_static! {
    static ref CURRENT: RwLock<Arc<FleetConfig>> = RwLock::new(Arc::new(FleetConfig::default()));
}

/// Snapshot the current configuration.
pub fn get() -> Arc<FleetConfig> {
    CURRENT
        .read()
        .map(|guard| guard.clone())
        .unwrap_or_else(|poisoned| poisoned.into_inner().clone())
}

/// Replace the current configuration.
pub fn set(config: FleetConfig) {
    let mut guard = match CURRENT.write() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    };
    *guard = Arc::new(config);
}

/// System namespace the operator itself runs in.
pub fn system_namespace() -> String {
    std::env::var("FLEET_SYSTEM_NAMESPACE").unwrap_or_else(|_| DEFAULT_SYSTEM_NAMESPACE.to_string())
}

/// Shard identity of this controller replica, if any.
pub fn shard_id() -> Option<String> {
    std::env::var("FLEET_SHARD_ID").ok().filter(|s| !s.is_empty())
}

fn parse(cm: &ConfigMap) -> Result<FleetConfig> {
    let Some(raw) = cm.data.as_ref().and_then(|d| d.get(CONFIG_KEY)) else {
        return Ok(FleetConfig::default());
    };
    serde_json::from_str(raw).map_err(Error::SerializationError)
}

/// Load the configuration once at startup. A missing ConfigMap is not an
/// error; the defaults apply until one appears.
pub async fn load(client: &Client) -> Result<()> {
    let api: Api<ConfigMap> = Api::namespaced(client.clone(), &system_namespace());
    match api.get_opt(CONFIG_MAP_NAME).await? {
        Some(cm) => {
            set(parse(&cm)?);
            info!("loaded configuration from {}/{}", system_namespace(), CONFIG_MAP_NAME);
        }
        None => {
            info!(
                "configmap {}/{} not found, using defaults",
                system_namespace(),
                CONFIG_MAP_NAME
            );
        }
    }
    Ok(())
}

/// Watch the ConfigMap and hot-reload on every change. Runs for the
/// lifetime of the process.
pub async fn watch(client: Client) {
    let api: Api<ConfigMap> = Api::namespaced(client, &system_namespace());
    let config = watcher::Config::default()
        .fields(&format!("metadata.name={CONFIG_MAP_NAME}"));

    let mut stream = watcher(api, config).applied_objects().boxed();
    while let Some(event) = stream.next().await {
        match event {
            Ok(cm) => match parse(&cm) {
                Ok(parsed) => {
                    set(parsed);
                    info!("reloaded configuration");
                }
                Err(err) => warn!("ignoring malformed configuration: {err}"),
            },
            Err(err) => warn!("configuration watch error: {err}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    #[test]
    fn parse_reads_recognized_options() {
        let mut data = BTreeMap::new();
        data.insert(
            CONFIG_KEY.to_string(),
            serde_json::json!({
                "apiServerURL": "https://upstream.example.com",
                "systemDefaultRegistry": "registry.example.com",
                "manageAgent": true,
                "ignoreClusterRegistrationLabels": true,
            })
            .to_string(),
        );
        let cm = ConfigMap {
            data: Some(data),
            ..Default::default()
        };

        let config = parse(&cm).unwrap();
        assert_eq!(
            config.api_server_url.as_deref(),
            Some("https://upstream.example.com")
        );
        assert_eq!(
            config.system_default_registry.as_deref(),
            Some("registry.example.com")
        );
        assert_eq!(config.manage_agent, Some(true));
        assert!(config.ignore_cluster_registration_labels);
    }

    #[test]
    fn missing_key_yields_defaults() {
        let cm = ConfigMap::default();
        let config = parse(&cm).unwrap();
        assert!(config.api_server_url.is_none());
        assert!(!config.ignore_cluster_registration_labels);
    }

    #[test]
    fn set_and_get_round_trip() {
        set(FleetConfig {
            agent_tls_mode: Some("strict".to_string()),
            ..Default::default()
        });
        assert_eq!(get().agent_tls_mode.as_deref(), Some("strict"));
        set(FleetConfig::default());
    }
}
