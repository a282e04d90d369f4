//! Sizing configuration model
//!
//! The configuration document is YAML stored in a ConfigMap:
//!
//! ```yaml
//! agent:
//!   - name: feeder-service
//!     chartname: accuknox/feeder-service
//!     container:
//!       - resource:
//!           - type: cpu
//!             request: [{value: "n*10"}, {upper-bound: 500}]
//!             limit: [{value: "n*20"}, {upper-bound: 1000}]
//! ```
//!
//! `request` and `limit` are positional: entry 0 carries the formula and
//! entry 1 carries the upper bound. A document that fails to parse or
//! validate is rejected as a whole.

use serde::Deserialize;
use std::collections::HashSet;
use std::fmt;
use std::str::FromStr;

use crate::error::SizingError;

/// Bytes per mebibyte; memory formulas are expressed in MiB
pub const MEBIBYTE: i64 = 1_048_576;

/// Resource kinds managed by the operator
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ResourceKind {
    Cpu,
    Memory,
}

impl ResourceKind {
    pub const ALL: [ResourceKind; 2] = [ResourceKind::Cpu, ResourceKind::Memory];

    /// Resource name as used in Kubernetes resource lists
    pub fn as_str(&self) -> &'static str {
        match self {
            ResourceKind::Cpu => "cpu",
            ResourceKind::Memory => "memory",
        }
    }

    /// Multiplier from formula units to stored units.
    /// CPU formulas yield milli-cores, memory formulas yield MiB.
    pub fn scale(&self) -> i64 {
        match self {
            ResourceKind::Cpu => 1,
            ResourceKind::Memory => MEBIBYTE,
        }
    }
}

impl fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ResourceKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "cpu" => Ok(ResourceKind::Cpu),
            "memory" => Ok(ResourceKind::Memory),
            other => Err(format!("unknown resource type `{}`", other)),
        }
    }
}

/// Request/limit formulas and bounds for one resource kind
#[derive(Debug, Clone, PartialEq)]
pub struct ResourceRule {
    pub kind: ResourceKind,
    pub request_formula: String,
    pub request_upper_bound: i64,
    pub limit_formula: String,
    pub limit_upper_bound: i64,
}

/// Sizing rules for one container
#[derive(Debug, Clone, PartialEq, Default)]
pub struct ContainerSpec {
    pub resources: Vec<ResourceRule>,
}

impl ContainerSpec {
    /// Rule for `kind`, if configured
    pub fn rule(&self, kind: ResourceKind) -> Option<&ResourceRule> {
        self.resources.iter().find(|r| r.kind == kind)
    }
}

/// A managed workload and how to size it
#[derive(Debug, Clone, PartialEq)]
pub struct WorkloadSpec {
    pub name: String,
    pub chart_reference: String,
    pub containers: Vec<ContainerSpec>,
}

impl WorkloadSpec {
    /// The container whose resources are sized
    pub fn primary_container(&self) -> Option<&ContainerSpec> {
        self.containers.first()
    }
}

/// Parsed sizing configuration, in document order
#[derive(Debug, Clone, PartialEq, Default)]
pub struct SizingConfig {
    workloads: Vec<WorkloadSpec>,
}

impl SizingConfig {
    /// Parse and validate a YAML configuration document
    pub fn parse(document: &str) -> Result<Self, SizingError> {
        let raw: RawDocument = serde_yaml::from_str(document)?;
        let raw_workloads = raw.agent.unwrap_or_default();

        let mut seen = HashSet::new();
        let mut workloads = Vec::with_capacity(raw_workloads.len());

        for (index, raw_workload) in raw_workloads.into_iter().enumerate() {
            let workload = raw_workload.into_spec(index)?;
            if !seen.insert(workload.name.clone()) {
                return Err(SizingError::ConfigParse(format!(
                    "duplicate workload name `{}`",
                    workload.name
                )));
            }
            workloads.push(workload);
        }

        Ok(Self { workloads })
    }

    #[cfg(test)]
    pub(crate) fn from_workloads(workloads: Vec<WorkloadSpec>) -> Self {
        Self { workloads }
    }

    pub fn workloads(&self) -> &[WorkloadSpec] {
        &self.workloads
    }

    pub fn get(&self, index: usize) -> Option<&WorkloadSpec> {
        self.workloads.get(index)
    }

    /// Whether `name` is a managed workload
    pub fn contains(&self, name: &str) -> bool {
        self.workloads.iter().any(|w| w.name == name)
    }

    pub fn len(&self) -> usize {
        self.workloads.len()
    }

    pub fn is_empty(&self) -> bool {
        self.workloads.is_empty()
    }
}

#[derive(Debug, Deserialize)]
struct RawDocument {
    #[serde(default)]
    agent: Option<Vec<RawWorkload>>,
}

#[derive(Debug, Deserialize)]
struct RawWorkload {
    #[serde(default)]
    name: String,
    #[serde(default)]
    chartname: String,
    #[serde(default)]
    container: Vec<RawContainer>,
}

#[derive(Debug, Deserialize)]
struct RawContainer {
    #[serde(default)]
    resource: Vec<RawResource>,
}

#[derive(Debug, Deserialize)]
struct RawResource {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    request: Vec<RawEntry>,
    #[serde(default)]
    limit: Vec<RawEntry>,
}

#[derive(Debug, Deserialize)]
struct RawEntry {
    #[serde(default)]
    value: Option<Scalar>,
    #[serde(rename = "upper-bound", default)]
    upper_bound: Option<i64>,
}

/// Formulas may be written as bare numbers (`value: 250`)
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum Scalar {
    Int(i64),
    Float(f64),
    Text(String),
}

impl Scalar {
    fn into_formula(self) -> String {
        match self {
            Scalar::Int(v) => v.to_string(),
            Scalar::Float(v) => v.to_string(),
            Scalar::Text(s) => s,
        }
    }
}

impl RawWorkload {
    fn into_spec(self, index: usize) -> Result<WorkloadSpec, SizingError> {
        let name = self.name.trim().to_string();
        if name.is_empty() {
            return Err(SizingError::ConfigParse(format!(
                "workload #{} has no name",
                index
            )));
        }

        let containers = self
            .container
            .into_iter()
            .map(|c| c.into_spec(&name))
            .collect::<Result<Vec<_>, _>>()?;

        Ok(WorkloadSpec {
            name,
            chart_reference: self.chartname.trim().to_string(),
            containers,
        })
    }
}

impl RawContainer {
    fn into_spec(self, workload: &str) -> Result<ContainerSpec, SizingError> {
        let mut resources: Vec<ResourceRule> = Vec::with_capacity(self.resource.len());

        for raw in self.resource {
            let rule = raw.into_rule(workload)?;
            if resources.iter().any(|r| r.kind == rule.kind) {
                return Err(SizingError::ConfigParse(format!(
                    "workload `{}` has more than one {} rule",
                    workload, rule.kind
                )));
            }
            resources.push(rule);
        }

        Ok(ContainerSpec { resources })
    }
}

impl RawResource {
    fn into_rule(self, workload: &str) -> Result<ResourceRule, SizingError> {
        let kind: ResourceKind = self
            .kind
            .parse()
            .map_err(|e| SizingError::ConfigParse(format!("workload `{}`: {}", workload, e)))?;

        let context = |field: &str| format!("workload `{}` {} {}", workload, kind, field);
        let (request_formula, request_upper_bound) =
            positional_pair(self.request, &context("request"))?;
        let (limit_formula, limit_upper_bound) = positional_pair(self.limit, &context("limit"))?;

        Ok(ResourceRule {
            kind,
            request_formula,
            request_upper_bound,
            limit_formula,
            limit_upper_bound,
        })
    }
}

/// Entry 0 holds the formula, entry 1 the upper bound
fn positional_pair(entries: Vec<RawEntry>, context: &str) -> Result<(String, i64), SizingError> {
    let mut entries = entries.into_iter();

    let formula = entries
        .next()
        .and_then(|e| e.value)
        .map(Scalar::into_formula)
        .filter(|f| !f.trim().is_empty())
        .ok_or_else(|| SizingError::ConfigParse(format!("{}: missing formula at entry 0", context)))?;

    let upper_bound = entries
        .next()
        .and_then(|e| e.upper_bound)
        .ok_or_else(|| {
            SizingError::ConfigParse(format!("{}: missing upper-bound at entry 1", context))
        })?;

    if upper_bound <= 0 {
        return Err(SizingError::ConfigParse(format!(
            "{}: upper-bound must be positive, got {}",
            context, upper_bound
        )));
    }

    Ok((formula, upper_bound))
}
