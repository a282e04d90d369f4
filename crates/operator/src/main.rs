//! Agents operator
//!
//! Runs as a single Deployment and keeps the CPU/memory of the managed agent
//! Deployments proportional to the cluster node count.

use agents_operator::{api, config::OperatorConfig};
use anyhow::{Context, Result};
use kube::runtime::watcher;
use operator_lib::{
    cluster::{run_event_source, ConfigTracker, KubeCluster, NodeTracker, WorkloadTracker},
    coordinator::{Collaborators, EventCoordinator},
    formula::ExprEvaluator,
    health::{components, HealthRegistry},
    installer::HelmInstaller,
    observability::OperatorMetrics,
};
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::{error, info};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

async fn shutdown_signal() -> Result<()> {
    #[cfg(unix)]
    {
        let mut terminate =
            tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())?;
        tokio::select! {
            result = tokio::signal::ctrl_c() => result?,
            _ = terminate.recv() => {}
        }
    }
    #[cfg(not(unix))]
    tokio::signal::ctrl_c().await?;

    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing with JSON output and env filter
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(fmt::layer().json())
        .init();

    info!("Starting agents-operator");

    let config = OperatorConfig::load()?;
    info!(
        namespace = %config.namespace,
        config_map = %config.config_map_name,
        bound_policy = ?config.bound_policy,
        "Operator configured"
    );

    let health_registry = HealthRegistry::new();
    health_registry.register_all().await;
    let metrics = OperatorMetrics::new();

    let (shutdown_tx, _) = broadcast::channel::<()>(1);

    // probes answer during bootstrap, readiness stays false until it succeeds
    let app_state = Arc::new(api::ApiState::new(health_registry.clone(), metrics));
    let api_handle = tokio::spawn(api::serve(
        config.api_port,
        app_state,
        shutdown_tx.subscribe(),
    ));

    let cluster = Arc::new(
        KubeCluster::try_default(
            &config.namespace,
            &config.config_map_name,
            &config.config_key,
        )
        .await?,
    );

    let collaborators = Collaborators {
        workloads: cluster.clone(),
        config_source: cluster.clone(),
        nodes: cluster.clone(),
        installer: Arc::new(HelmInstaller::new(&config.helm_binary)),
        evaluator: Arc::new(ExprEvaluator),
    };

    let coordinator = EventCoordinator::bootstrap(
        config.coordinator_config(),
        collaborators,
        health_registry.clone(),
    )
    .await
    .context("Operator bootstrap failed")?;

    let events = coordinator.sender();
    let node_source = tokio::spawn(run_event_source(
        cluster.nodes(),
        watcher::Config::default(),
        NodeTracker::new(coordinator.known_nodes().to_vec()),
        events.clone(),
        health_registry.clone(),
        components::NODE_WATCHER,
        shutdown_tx.subscribe(),
    ));
    let workload_source = tokio::spawn(run_event_source(
        cluster.deployments(),
        watcher::Config::default(),
        WorkloadTracker::new(),
        events.clone(),
        health_registry.clone(),
        components::WORKLOAD_WATCHER,
        shutdown_tx.subscribe(),
    ));
    let config_source = tokio::spawn(run_event_source(
        cluster.config_maps(),
        watcher::Config::default().fields(&format!("metadata.name={}", config.config_map_name)),
        ConfigTracker::new(&config.config_map_name),
        events,
        health_registry.clone(),
        components::CONFIG_WATCHER,
        shutdown_tx.subscribe(),
    ));

    let coordinator_handle = tokio::spawn(coordinator.run(shutdown_tx.subscribe()));

    health_registry.set_ready(true).await;

    shutdown_signal().await?;
    info!("Shutdown signal received");
    health_registry.set_ready(false).await;
    let _ = shutdown_tx.send(());

    for handle in [node_source, workload_source, config_source, coordinator_handle] {
        if let Err(e) = handle.await {
            error!(error = %e, "Task failed during shutdown");
        }
    }
    match api_handle.await {
        Ok(Err(e)) => error!(error = %e, "API server failed"),
        Err(e) => error!(error = %e, "API server task failed"),
        Ok(Ok(())) => {}
    }

    info!("Shutdown complete");
    Ok(())
}
