/*
 * Copyright (C) 2025 Pedro Henrique / phkaiser13
 *
 * File: main.rs
 *
 * This file is the main entry point for the fleet Kubernetes operator: the
 * upstream control plane that compiles GitRepo and HelmOp sources into
 * Bundles, fans Bundles out to per-cluster BundleDeployments, governs
 * rollouts, and folds agent-reported status back up the ownership chain.
 *
 * Architecture:
 * The program follows the standard `kube-rs` operator structure.
 * 1.  **Initialization**: A Kubernetes client is created for the management
 *     cluster and tracing is configured from RUST_LOG.
 * 2.  **Configuration**: The process-wide configuration is loaded from the
 *     fleet-controller ConfigMap, then kept hot by a watch task.
 * 3.  **Controller set**: One controller per custom resource kind (Bundle,
 *     BundleDeployment, Content, GitRepo, HelmOp, Cluster, ClusterGroup),
 *     all run concurrently; see controllers::run for the wiring.
 *
 * There is no central orchestrator; ordering emerges from watch fan-out
 * and object ownership.
 *
 * SPDX-License-Identifier: Apache-2.0
 */

use kube::Client;
use tracing::info;
use tracing_subscriber::EnvFilter;

use phgit_fleet_operator::{config, controllers};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    // 1. Initialize the Kubernetes client for the management cluster.
    let client = Client::try_default().await?;

    // 2. Load configuration, then keep it hot for the process lifetime.
    config::load(&client).await?;
    tokio::spawn(config::watch(client.clone()));

    info!(
        shard = ?config::shard_id(),
        "fleet operator starting in {}",
        config::system_namespace()
    );

    // 3. Run every controller until shutdown.
    controllers::run(client).await;

    info!("fleet operator shutting down");
    Ok(())
}
