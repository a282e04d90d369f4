//! Operator library for cluster-size-adaptive agent sizing
//!
//! This crate provides the core functionality for:
//! - Evaluating sizing formulas against the cluster node count
//! - Computing bounded resource requests and limits
//! - Idempotent patching of managed Deployments
//! - Coordinating node, readiness and configuration events
//! - Health checks and observability

pub mod calculator;
pub mod cluster;
pub mod coordinator;
pub mod error;
pub mod formula;
pub mod health;
pub mod installer;
pub mod observability;
pub mod quantity;
pub mod reconciler;
pub mod sizing;

#[cfg(test)]
mod testing;

pub use calculator::{BoundPolicy, DesiredResourceSpec, ResourceCalculator};
pub use coordinator::{ClusterEvent, Collaborators, CoordinatorConfig, EventCoordinator};
pub use error::{FormulaError, SizingError};
pub use formula::{ExprEvaluator, FormulaEvaluator};
pub use health::{
    ComponentHealth, ComponentStatus, HealthRegistry, HealthResponse, ReadinessResponse,
};
pub use observability::{OperatorMetrics, StructuredLogger};
pub use reconciler::{PatchReconciler, ReconcileOutcome};
pub use sizing::{ResourceKind, SizingConfig, WorkloadSpec};
