//! Observability infrastructure for the operator
//!
//! Provides:
//! - Prometheus metrics (pass latency, patches, failures, node count)
//! - Structured JSON logging with tracing

use prometheus::{
    register_histogram, register_int_counter, register_int_counter_vec, register_int_gauge,
    Encoder, Histogram, IntCounter, IntCounterVec, IntGauge, TextEncoder,
};
use std::sync::OnceLock;
use tracing::{info, warn};

use crate::reconciler::FieldChange;

/// Histogram buckets for reconciliation pass latency (in seconds)
const PASS_LATENCY_BUCKETS: &[f64] = &[0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0];

/// Global metrics instance (registered once)
static GLOBAL_METRICS: OnceLock<OperatorMetricsInner> = OnceLock::new();

struct OperatorMetricsInner {
    pass_latency_seconds: Histogram,
    passes_total: IntCounterVec,
    patches_applied: IntCounter,
    noop_reconciliations: IntCounter,
    workload_failures: IntCounterVec,
    aborted_passes: IntCounterVec,
    node_count: IntGauge,
    config_reloads: IntCounterVec,
    installs: IntCounterVec,
}

impl OperatorMetricsInner {
    fn new() -> Self {
        Self {
            pass_latency_seconds: register_histogram!(
                "agents_operator_reconcile_pass_latency_seconds",
                "Time spent in one reconciliation pass over all managed workloads",
                PASS_LATENCY_BUCKETS.to_vec()
            )
            .expect("Failed to register reconcile_pass_latency_seconds"),

            passes_total: register_int_counter_vec!(
                "agents_operator_reconcile_passes_total",
                "Reconciliation passes by trigger",
                &["trigger"]
            )
            .expect("Failed to register reconcile_passes_total"),

            patches_applied: register_int_counter!(
                "agents_operator_patches_applied_total",
                "Workload patches written to the cluster"
            )
            .expect("Failed to register patches_applied_total"),

            noop_reconciliations: register_int_counter!(
                "agents_operator_noop_reconciliations_total",
                "Reconciliations where live resources already matched"
            )
            .expect("Failed to register noop_reconciliations_total"),

            workload_failures: register_int_counter_vec!(
                "agents_operator_workload_failures_total",
                "Per-workload sizing or reconciliation failures by reason",
                &["reason"]
            )
            .expect("Failed to register workload_failures_total"),

            aborted_passes: register_int_counter_vec!(
                "agents_operator_aborted_passes_total",
                "Passes skipped before any workload was touched, by reason",
                &["reason"]
            )
            .expect("Failed to register aborted_passes_total"),

            node_count: register_int_gauge!(
                "agents_operator_node_count",
                "Cluster node count used for sizing"
            )
            .expect("Failed to register node_count"),

            config_reloads: register_int_counter_vec!(
                "agents_operator_config_reloads_total",
                "Sizing configuration fetches by result",
                &["result"]
            )
            .expect("Failed to register config_reloads_total"),

            installs: register_int_counter_vec!(
                "agents_operator_installs_total",
                "Install-if-absent attempts by result",
                &["result"]
            )
            .expect("Failed to register installs_total"),
        }
    }
}

/// Operator metrics for Prometheus exposition
///
/// Lightweight handle to the global metrics instance; clones share the
/// same underlying metrics.
#[derive(Clone)]
pub struct OperatorMetrics {
    _private: (),
}

impl Default for OperatorMetrics {
    fn default() -> Self {
        Self::new()
    }
}

impl OperatorMetrics {
    /// Create a new metrics handle (initializes global metrics if needed)
    pub fn new() -> Self {
        GLOBAL_METRICS.get_or_init(OperatorMetricsInner::new);
        Self { _private: () }
    }

    fn inner(&self) -> &OperatorMetricsInner {
        GLOBAL_METRICS.get_or_init(OperatorMetricsInner::new)
    }

    pub fn observe_pass_latency(&self, duration_secs: f64) {
        self.inner().pass_latency_seconds.observe(duration_secs);
    }

    pub fn inc_passes(&self, trigger: &str) {
        self.inner().passes_total.with_label_values(&[trigger]).inc();
    }

    pub fn inc_patches_applied(&self) {
        self.inner().patches_applied.inc();
    }

    pub fn inc_noop(&self) {
        self.inner().noop_reconciliations.inc();
    }

    /// Count a failure under the error's short label
    pub fn inc_workload_failure(&self, reason: &str) {
        self.inner()
            .workload_failures
            .with_label_values(&[reason])
            .inc();
    }

    /// Count a pass abandoned because the sizing configuration was unusable
    pub fn inc_aborted_pass(&self, reason: &str) {
        self.inner()
            .aborted_passes
            .with_label_values(&[reason])
            .inc();
    }

    pub fn set_node_count(&self, count: i64) {
        self.inner().node_count.set(count);
    }

    pub fn inc_config_reload(&self, success: bool) {
        let result = if success { "success" } else { "failure" };
        self.inner().config_reloads.with_label_values(&[result]).inc();
    }

    pub fn inc_install(&self, result: &str) {
        self.inner().installs.with_label_values(&[result]).inc();
    }

    /// Content type of [`OperatorMetrics::encode`] output
    pub fn content_type(&self) -> String {
        TextEncoder::new().format_type().to_string()
    }

    /// Render the default registry in the Prometheus text format
    pub fn encode(&self) -> Result<Vec<u8>, prometheus::Error> {
        self.inner();
        let mut buffer = Vec::new();
        TextEncoder::new().encode(&prometheus::gather(), &mut buffer)?;
        Ok(buffer)
    }
}

/// Structured logger for operator events
///
/// Every event carries the managed namespace so logs from several operator
/// deployments can be told apart.
#[derive(Clone)]
pub struct StructuredLogger {
    namespace: String,
}

impl StructuredLogger {
    pub fn new(namespace: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
        }
    }

    pub fn log_startup(&self, version: &str, node_count: i64, workloads: usize) {
        info!(
            event = "operator_started",
            namespace = %self.namespace,
            operator_version = %version,
            node_count = node_count,
            managed_workloads = workloads,
            "Agents operator started"
        );
    }

    pub fn log_shutdown(&self, reason: &str) {
        info!(
            event = "operator_shutdown",
            namespace = %self.namespace,
            reason = %reason,
            "Agents operator shutting down"
        );
    }

    /// `change` is `joined` or `left`
    pub fn log_node_count_changed(&self, node: &str, change: &str, node_count: i64) {
        info!(
            event = "node_count_changed",
            namespace = %self.namespace,
            node = %node,
            change = %change,
            node_count = node_count,
            "Cluster node count changed"
        );
    }

    /// Log a patch written to a workload, one field per change
    pub fn log_workload_patched(&self, workload: &str, node_count: i64, changes: &[FieldChange]) {
        let summary = changes
            .iter()
            .map(|c| c.to_string())
            .collect::<Vec<_>>()
            .join(", ");

        info!(
            event = "workload_patched",
            namespace = %self.namespace,
            workload = %workload,
            node_count = node_count,
            changed_fields = changes.len(),
            changes = %summary,
            "Workload resources updated"
        );
    }

    pub fn log_sizing_failed(&self, workload: &str, reason: &str, error: &str) {
        warn!(
            event = "sizing_failed",
            namespace = %self.namespace,
            workload = %workload,
            reason = %reason,
            error = %error,
            "Workload sizing failed, leaving live resources untouched"
        );
    }

    pub fn log_install_failed(&self, workload: &str, chart: &str, error: &str) {
        warn!(
            event = "workload_install_failed",
            namespace = %self.namespace,
            workload = %workload,
            chart = %chart,
            error = %error,
            "Install of missing workload failed"
        );
    }

    pub fn log_pass_completed(
        &self,
        trigger: &str,
        node_count: i64,
        applied: usize,
        unchanged: usize,
        failed: usize,
        duration_ms: u128,
    ) {
        if failed > 0 {
            warn!(
                event = "reconcile_pass_completed",
                namespace = %self.namespace,
                trigger = %trigger,
                node_count = node_count,
                applied = applied,
                unchanged = unchanged,
                failed = failed,
                duration_ms = duration_ms as u64,
                "Reconciliation pass completed with failures"
            );
        } else {
            info!(
                event = "reconcile_pass_completed",
                namespace = %self.namespace,
                trigger = %trigger,
                node_count = node_count,
                applied = applied,
                unchanged = unchanged,
                failed = failed,
                duration_ms = duration_ms as u64,
                "Reconciliation pass completed"
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_operator_metrics_handles_share_registry() {
        let first = OperatorMetrics::new();
        let second = first.clone();

        first.inc_patches_applied();
        second.inc_patches_applied();
        first.set_node_count(7);
        second.inc_passes("node_joined");
        second.inc_workload_failure("formula");
        first.inc_config_reload(false);
        first.inc_install("installed");
        first.observe_pass_latency(0.02);

        let families = prometheus::gather();
        assert!(families
            .iter()
            .any(|f| f.get_name() == "agents_operator_node_count"));

        let patches = families
            .iter()
            .find(|f| f.get_name() == "agents_operator_patches_applied_total")
            .unwrap();
        assert!(patches.get_metric()[0].get_counter().get_value() >= 2.0);
    }

    #[test]
    fn test_encode_renders_operator_families() {
        let metrics = OperatorMetrics::new();
        metrics.inc_aborted_pass("config_parse");

        let text = String::from_utf8(metrics.encode().unwrap()).unwrap();
        assert!(text.contains("agents_operator_aborted_passes_total{reason=\"config_parse\"}"));
        assert!(text.contains("# TYPE agents_operator_patches_applied_total counter"));
        assert!(metrics.content_type().starts_with("text/plain"));
    }

    #[test]
    fn test_structured_logger_creation() {
        let logger = StructuredLogger::new("accuknox-agents");
        assert_eq!(logger.namespace, "accuknox-agents");
    }
}
