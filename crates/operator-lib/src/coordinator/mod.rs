//! Event coordinator
//!
//! Node membership, workload readiness and configuration changes arrive as
//! `ClusterEvent`s on one channel. A single loop consumes them, updates the
//! shared `ClusterState` and runs reconciliation passes one at a time.
//!
//! Readiness waits run on their own task so a slow rollout never blocks
//! node events. When the wait settles it posts back to the loop, which then
//! runs the pass itself.

mod readiness;
mod state;


pub use readiness::{wait_for_all_ready, ReadinessConfig, ReadinessOutcome};
pub use state::{ClusterSnapshot, ClusterState};

use anyhow::{Context, Result};
use std::collections::HashSet;
use std::fmt;
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::calculator::{BoundPolicy, ResourceCalculator};
use crate::cluster::{ConfigSource, NodeLister, WorkloadClient};
use crate::error::SizingError;
use crate::formula::FormulaEvaluator;
use crate::health::{components, HealthRegistry};
use crate::installer::{ChartInstaller, InstallIdentity};
use crate::observability::{OperatorMetrics, StructuredLogger};
use crate::reconciler::{PatchReconciler, ReconcileOutcome};
use crate::sizing::SizingConfig;

/// Change observed in the cluster
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClusterEvent {
    NodeJoined(String),
    NodeLeft(String),
    WorkloadBecameReady(String),
    ConfigurationChanged,
}

/// Why a reconciliation pass ran
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PassTrigger {
    Startup,
    NodeJoined,
    NodeLeft,
    ReadinessSettled,
    ConfigurationChanged,
}

impl PassTrigger {
    pub fn as_str(&self) -> &'static str {
        match self {
            PassTrigger::Startup => "startup",
            PassTrigger::NodeJoined => "node_joined",
            PassTrigger::NodeLeft => "node_left",
            PassTrigger::ReadinessSettled => "readiness_settled",
            PassTrigger::ConfigurationChanged => "configuration_changed",
        }
    }
}

impl fmt::Display for PassTrigger {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Counts from one reconciliation pass
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PassSummary {
    pub node_count: i64,
    pub applied: usize,
    pub unchanged: usize,
    pub failed: usize,
    /// The configuration could not be fetched or parsed; no workload was touched
    pub aborted: bool,
}

/// Configuration for the event coordinator
#[derive(Debug, Clone)]
pub struct CoordinatorConfig {
    /// Namespace holding the managed workloads
    pub namespace: String,
    pub readiness: ReadinessConfig,
    /// Capacity of the event channel shared by all event sources
    pub channel_capacity: usize,
    pub bound_policy: BoundPolicy,
    pub identity: InstallIdentity,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            namespace: "accuknox-agents".to_string(),
            readiness: ReadinessConfig::default(),
            channel_capacity: 256,
            bound_policy: BoundPolicy::default(),
            identity: InstallIdentity::default(),
        }
    }
}

/// External collaborators the coordinator drives
#[derive(Clone)]
pub struct Collaborators {
    pub workloads: Arc<dyn WorkloadClient>,
    pub config_source: Arc<dyn ConfigSource>,
    pub nodes: Arc<dyn NodeLister>,
    pub installer: Arc<dyn ChartInstaller>,
    pub evaluator: Arc<dyn FormulaEvaluator>,
}

/// Serializes cluster events into reconciliation passes
pub struct EventCoordinator {
    config: CoordinatorConfig,
    state: Arc<ClusterState>,
    workloads: Arc<dyn WorkloadClient>,
    config_source: Arc<dyn ConfigSource>,
    calculator: ResourceCalculator,
    reconciler: PatchReconciler,
    /// Last fetched raw configuration document
    document: String,
    /// Names of managed workloads from the last document that parsed
    managed: HashSet<String>,
    known_nodes: Vec<String>,
    events_tx: mpsc::Sender<ClusterEvent>,
    events_rx: mpsc::Receiver<ClusterEvent>,
    settled_tx: mpsc::Sender<()>,
    settled_rx: mpsc::Receiver<()>,
    cancel_tx: broadcast::Sender<()>,
    waiter: Option<JoinHandle<()>>,
    health: HealthRegistry,
    metrics: OperatorMetrics,
    logger: StructuredLogger,
}

impl EventCoordinator {
    /// Take the initial snapshot and install missing workloads
    ///
    /// Fails if the node list or the configuration cannot be obtained; in
    /// that case nothing is started.
    pub async fn bootstrap(
        config: CoordinatorConfig,
        collaborators: Collaborators,
        health: HealthRegistry,
    ) -> Result<Self> {
        let metrics = OperatorMetrics::new();
        let logger = StructuredLogger::new(&config.namespace);

        let known_nodes = collaborators
            .nodes
            .list_node_names()
            .await
            .context("Failed to list cluster nodes")?;
        let node_count = known_nodes.len() as i64;
        let state = Arc::new(ClusterState::new(node_count));
        metrics.set_node_count(node_count);

        // the startup fetch satisfies the initial stale flag
        state.take_config_stale().await;
        let document = collaborators
            .config_source
            .fetch_document()
            .await
            .map_err(|e| SizingError::ConfigFetch(format!("{:#}", e)))?;
        let sizing = SizingConfig::parse(&document)?;
        metrics.inc_config_reload(true);

        info!(
            namespace = %config.namespace,
            node_count = node_count,
            workloads = sizing.len(),
            "Loaded initial cluster snapshot"
        );

        let (events_tx, events_rx) = mpsc::channel(config.channel_capacity.max(1));
        let (settled_tx, settled_rx) = mpsc::channel(1);
        let (cancel_tx, _) = broadcast::channel(1);

        let coordinator = Self {
            calculator: ResourceCalculator::new(collaborators.evaluator, config.bound_policy),
            reconciler: PatchReconciler::new(collaborators.workloads.clone()),
            workloads: collaborators.workloads,
            config_source: collaborators.config_source,
            state,
            document,
            managed: sizing.workloads().iter().map(|w| w.name.clone()).collect(),
            known_nodes,
            events_tx,
            events_rx,
            settled_tx,
            settled_rx,
            cancel_tx,
            waiter: None,
            health,
            metrics,
            logger,
            config,
        };

        coordinator
            .install_missing(&sizing, collaborators.installer.as_ref())
            .await;
        coordinator
            .logger
            .log_startup(env!("CARGO_PKG_VERSION"), node_count, sizing.len());

        Ok(coordinator)
    }

    /// Sender for event sources
    pub fn sender(&self) -> mpsc::Sender<ClusterEvent> {
        self.events_tx.clone()
    }

    pub fn state(&self) -> Arc<ClusterState> {
        self.state.clone()
    }

    /// Node names from the startup listing
    pub fn known_nodes(&self) -> &[String] {
        &self.known_nodes
    }

    async fn install_missing(&self, sizing: &SizingConfig, installer: &dyn ChartInstaller) {
        let namespace = self.config.namespace.as_str();
        let values = self.config.identity.values(namespace);

        for workload in sizing.workloads() {
            match self.workloads.get_workload(&workload.name).await {
                Ok(Some(_)) => {
                    debug!(workload = %workload.name, "Workload present, no install needed");
                }
                Ok(None) => {
                    info!(
                        workload = %workload.name,
                        chart = %workload.chart_reference,
                        "Workload missing, installing"
                    );
                    match installer
                        .install(&workload.chart_reference, &workload.name, namespace, &values)
                        .await
                    {
                        Ok(()) => self.metrics.inc_install("installed"),
                        Err(e) => {
                            let err = SizingError::Install {
                                workload: workload.name.clone(),
                                chart: workload.chart_reference.clone(),
                                reason: format!("{:#}", e),
                            };
                            self.logger.log_install_failed(
                                &workload.name,
                                &workload.chart_reference,
                                &err.to_string(),
                            );
                            self.metrics.inc_install("failed");
                        }
                    }
                }
                Err(e) => {
                    warn!(
                        workload = %workload.name,
                        error = %format!("{:#}", e),
                        "Could not check whether workload exists, skipping install"
                    );
                    self.metrics.inc_install("skipped");
                }
            }
        }
    }

    /// Re-fetch the document if it was marked stale
    async fn refresh_config(&mut self) -> Result<(), SizingError> {
        if !self.state.take_config_stale().await {
            return Ok(());
        }

        match self.config_source.fetch_document().await {
            Ok(document) => {
                debug!(bytes = document.len(), "Fetched sizing configuration");
                self.document = document;
                self.metrics.inc_config_reload(true);
                Ok(())
            }
            Err(e) => {
                // retry on the next pass
                self.state.mark_config_stale().await;
                self.metrics.inc_config_reload(false);
                Err(SizingError::ConfigFetch(format!("{:#}", e)))
            }
        }
    }

    /// Size and reconcile every managed workload once
    pub async fn reconcile_pass(&mut self, trigger: PassTrigger) -> PassSummary {
        let start = Instant::now();
        let node_count = self.state.node_count().await;
        let mut summary = PassSummary {
            node_count,
            ..Default::default()
        };
        self.metrics.inc_passes(trigger.as_str());

        let sizing = match self.refresh_config().await.and_then(|_| SizingConfig::parse(&self.document)) {
            Ok(sizing) => sizing,
            Err(e) => {
                warn!(
                    trigger = %trigger,
                    reason = e.kind_label(),
                    error = %e,
                    "Skipping reconciliation pass, configuration unavailable"
                );
                self.metrics.inc_aborted_pass(e.kind_label());
                summary.aborted = true;
                return summary;
            }
        };
        self.managed = sizing.workloads().iter().map(|w| w.name.clone()).collect();

        for (index, workload) in sizing.workloads().iter().enumerate() {
            let desired = self.calculator.desired_spec(&sizing, index, node_count);
            match self.reconciler.reconcile_one(workload, desired).await {
                Ok(ReconcileOutcome::Applied { changes }) => {
                    summary.applied += 1;
                    self.metrics.inc_patches_applied();
                    self.logger
                        .log_workload_patched(&workload.name, node_count, &changes);
                }
                Ok(ReconcileOutcome::NoOp) => {
                    summary.unchanged += 1;
                    self.metrics.inc_noop();
                }
                Err(e) => {
                    summary.failed += 1;
                    self.metrics.inc_workload_failure(e.kind_label());
                    self.logger
                        .log_sizing_failed(&workload.name, e.kind_label(), &e.to_string());
                }
            }
        }

        let elapsed = start.elapsed();
        self.metrics.observe_pass_latency(elapsed.as_secs_f64());
        self.logger.log_pass_completed(
            trigger.as_str(),
            node_count,
            summary.applied,
            summary.unchanged,
            summary.failed,
            elapsed.as_millis(),
        );
        summary
    }

    /// Apply one event; returns the pass summary if a pass ran inline
    pub async fn handle_event(&mut self, event: ClusterEvent) -> Option<PassSummary> {
        match event {
            ClusterEvent::NodeJoined(node) => {
                let count = self.state.node_joined().await;
                self.metrics.set_node_count(count);
                self.logger.log_node_count_changed(&node, "joined", count);
                Some(self.reconcile_pass(PassTrigger::NodeJoined).await)
            }
            ClusterEvent::NodeLeft(node) => {
                let count = self.state.node_left().await;
                self.metrics.set_node_count(count);
                self.logger.log_node_count_changed(&node, "left", count);
                Some(self.reconcile_pass(PassTrigger::NodeLeft).await)
            }
            ClusterEvent::WorkloadBecameReady(workload) => {
                if self.managed.contains(&workload) {
                    self.start_readiness_wait(&workload);
                } else {
                    debug!(workload = %workload, "Ignoring readiness of unmanaged workload");
                }
                None
            }
            ClusterEvent::ConfigurationChanged => {
                self.state.mark_config_stale().await;
                Some(self.reconcile_pass(PassTrigger::ConfigurationChanged).await)
            }
        }
    }

    fn start_readiness_wait(&mut self, workload: &str) {
        if self.waiter.as_ref().map_or(false, |h| !h.is_finished()) {
            debug!(workload = %workload, "Readiness wait already in flight");
            return;
        }

        info!(workload = %workload, "Waiting for deployments to become ready");
        let client = self.workloads.clone();
        let config = self.config.readiness;
        let settled = self.settled_tx.clone();
        let mut cancel = self.cancel_tx.subscribe();

        self.waiter = Some(tokio::spawn(async move {
            match wait_for_all_ready(client.as_ref(), &config, &mut cancel).await {
                ReadinessOutcome::Ready => {
                    let _ = settled.send(()).await;
                }
                ReadinessOutcome::TimedOut => {
                    warn!(
                        timeout_secs = config.timeout.as_secs(),
                        "Timed out waiting for deployments to become ready"
                    );
                }
                ReadinessOutcome::Cancelled => {
                    debug!("Readiness wait cancelled");
                }
            }
        }));
    }

    /// Run the initial pass, then process events until shutdown
    pub async fn run(mut self, mut shutdown: broadcast::Receiver<()>) {
        info!("Starting event coordinator");
        self.health.set_healthy(components::COORDINATOR).await;

        self.reconcile_pass(PassTrigger::Startup).await;

        loop {
            tokio::select! {
                biased;
                _ = shutdown.recv() => {
                    info!("Shutting down event coordinator");
                    break;
                }
                Some(()) = self.settled_rx.recv() => {
                    self.reconcile_pass(PassTrigger::ReadinessSettled).await;
                }
                event = self.events_rx.recv() => match event {
                    Some(event) => {
                        debug!(event = ?event, "Handling cluster event");
                        self.handle_event(event).await;
                    }
                    None => {
                        warn!("Event channel closed");
                        self.health
                            .set_unhealthy(components::COORDINATOR, "event channel closed")
                            .await;
                        break;
                    }
                },
            }
        }

        let _ = self.cancel_tx.send(());
        self.logger.log_shutdown("shutdown signal received");
    }
}
