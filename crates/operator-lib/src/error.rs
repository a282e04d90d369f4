//! Error taxonomy for the sizing and reconciliation core
//!
//! Errors are scoped to the smallest unit that can fail: a whole
//! configuration document, one workload, or one resource kind of a workload.

use thiserror::Error;

use crate::sizing::ResourceKind;

/// Failure to evaluate a sizing formula
#[derive(Error, Debug, Clone, PartialEq)]
pub enum FormulaError {
    #[error("failed to compile formula `{formula}`: {reason}")]
    Compile { formula: String, reason: String },

    #[error("failed to evaluate formula `{formula}`: {reason}")]
    Runtime { formula: String, reason: String },

    #[error("formula `{formula}` produced {value}, expected an integer")]
    NotInteger { formula: String, value: String },

    #[error("formula `{formula}` produced non-positive value {value}")]
    NonPositive { formula: String, value: i64 },

    #[error("formula `{formula}` value {value} overflows when scaled by {scale}")]
    Overflow {
        formula: String,
        value: i64,
        scale: i64,
    },
}

/// Errors raised while sizing and reconciling managed workloads
#[derive(Error, Debug)]
pub enum SizingError {
    #[error("invalid sizing configuration: {0}")]
    ConfigParse(String),

    #[error("failed to fetch sizing configuration: {0}")]
    ConfigFetch(String),

    #[error("workload {workload}: {kind} sizing failed: {source}")]
    Formula {
        workload: String,
        kind: ResourceKind,
        #[source]
        source: FormulaError,
    },

    #[error("workload {workload}: no {kind} rule in primary container")]
    MissingRule { workload: String, kind: ResourceKind },

    #[error("workload {workload}: cluster API call failed: {reason}")]
    ClusterApi { workload: String, reason: String },

    #[error("workload {workload}: not found in cluster")]
    WorkloadNotFound { workload: String },

    #[error("workload {workload}: pod template has no containers")]
    NoPrimaryContainer { workload: String },

    #[error("workload {workload}: install from chart {chart} failed: {reason}")]
    Install {
        workload: String,
        chart: String,
        reason: String,
    },
}

impl SizingError {
    /// Wrap a collaborator failure with the workload it was issued for
    pub fn cluster_api(workload: impl Into<String>, err: &anyhow::Error) -> Self {
        SizingError::ClusterApi {
            workload: workload.into(),
            reason: format!("{:#}", err),
        }
    }

    /// Short machine-readable label used in metrics and log fields
    pub fn kind_label(&self) -> &'static str {
        match self {
            SizingError::ConfigParse(_) => "config_parse",
            SizingError::ConfigFetch(_) => "config_fetch",
            SizingError::Formula { .. } => "formula",
            SizingError::MissingRule { .. } => "missing_rule",
            SizingError::ClusterApi { .. } => "cluster_api",
            SizingError::WorkloadNotFound { .. } => "cluster_api",
            SizingError::NoPrimaryContainer { .. } => "cluster_api",
            SizingError::Install { .. } => "install",
        }
    }
}

impl From<serde_yaml::Error> for SizingError {
    fn from(err: serde_yaml::Error) -> Self {
        SizingError::ConfigParse(err.to_string())
    }
}
