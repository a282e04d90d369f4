//! Resource request/limit calculation
//!
//! Turns the sizing rules of a workload into concrete requests and limits
//! for the current node count: evaluate, scale to stored units, clamp to the
//! configured ceiling, then force `request <= limit`.

use serde::Deserialize;
use std::sync::Arc;
use tracing::debug;

use crate::error::{FormulaError, SizingError};
use crate::formula::FormulaEvaluator;
use crate::sizing::{ResourceKind, ResourceRule, SizingConfig};

/// Which upper bound the request is clamped against
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BoundPolicy {
    /// Request and limit share the limit rule's upper bound
    #[default]
    Shared,
    /// Request uses the request rule's bound, limit uses the limit rule's
    Independent,
}

/// Computed request and limit for one resource kind, in stored units
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RequestLimit {
    pub request: i64,
    pub limit: i64,
}

/// CPU in milli-cores, memory in bytes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ResourceAmounts {
    pub cpu_millis: i64,
    pub memory_bytes: i64,
}

impl ResourceAmounts {
    pub fn get(&self, kind: ResourceKind) -> i64 {
        match kind {
            ResourceKind::Cpu => self.cpu_millis,
            ResourceKind::Memory => self.memory_bytes,
        }
    }

    fn set(&mut self, kind: ResourceKind, value: i64) {
        match kind {
            ResourceKind::Cpu => self.cpu_millis = value,
            ResourceKind::Memory => self.memory_bytes = value,
        }
    }
}

/// Target resources for a workload's primary container
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct DesiredResourceSpec {
    pub requests: ResourceAmounts,
    pub limits: ResourceAmounts,
}

/// Derives requests and limits from sizing rules
#[derive(Clone)]
pub struct ResourceCalculator {
    evaluator: Arc<dyn FormulaEvaluator>,
    policy: BoundPolicy,
}

impl ResourceCalculator {
    pub fn new(evaluator: Arc<dyn FormulaEvaluator>, policy: BoundPolicy) -> Self {
        Self { evaluator, policy }
    }

    pub fn policy(&self) -> BoundPolicy {
        self.policy
    }

    /// Compute the (request, limit) pair for one workload and resource kind
    pub fn compute_request_limit(
        &self,
        config: &SizingConfig,
        workload_index: usize,
        kind: ResourceKind,
        node_count: i64,
    ) -> Result<RequestLimit, SizingError> {
        let workload = config
            .get(workload_index)
            .ok_or_else(|| SizingError::MissingRule {
                workload: format!("#{}", workload_index),
                kind,
            })?;

        let rule = workload
            .primary_container()
            .and_then(|c| c.rule(kind))
            .ok_or_else(|| SizingError::MissingRule {
                workload: workload.name.clone(),
                kind,
            })?;

        let result = self
            .compute_rule(rule, node_count)
            .map_err(|source| SizingError::Formula {
                workload: workload.name.clone(),
                kind,
                source,
            })?;

        debug!(
            workload = %workload.name,
            kind = %kind,
            node_count = node_count,
            request = result.request,
            limit = result.limit,
            "Computed request/limit"
        );
        Ok(result)
    }

    /// Compute CPU and memory targets for one workload
    pub fn desired_spec(
        &self,
        config: &SizingConfig,
        workload_index: usize,
        node_count: i64,
    ) -> Result<DesiredResourceSpec, SizingError> {
        let mut spec = DesiredResourceSpec::default();
        for kind in ResourceKind::ALL {
            let pair = self.compute_request_limit(config, workload_index, kind, node_count)?;
            spec.requests.set(kind, pair.request);
            spec.limits.set(kind, pair.limit);
        }
        Ok(spec)
    }

    fn compute_rule(&self, rule: &ResourceRule, node_count: i64) -> Result<RequestLimit, FormulaError> {
        let scale = rule.kind.scale();

        let request = self.evaluate_scaled(&rule.request_formula, node_count, scale)?;
        let limit = self.evaluate_scaled(&rule.limit_formula, node_count, scale)?;

        let request_bound = match self.policy {
            BoundPolicy::Shared => rule.limit_upper_bound,
            BoundPolicy::Independent => rule.request_upper_bound,
        };

        let request = request.min(request_bound.saturating_mul(scale));
        let limit = limit.min(rule.limit_upper_bound.saturating_mul(scale));

        // limit is never raised to meet the request
        Ok(RequestLimit {
            request: request.min(limit),
            limit,
        })
    }

    fn evaluate_scaled(&self, formula: &str, node_count: i64, scale: i64) -> Result<i64, FormulaError> {
        let value = self.evaluator.evaluate(formula, node_count)?;
        if value <= 0 {
            return Err(FormulaError::NonPositive {
                formula: formula.to_string(),
                value,
            });
        }
        value.checked_mul(scale).ok_or_else(|| FormulaError::Overflow {
            formula: formula.to_string(),
            value,
            scale,
        })
    }
}
