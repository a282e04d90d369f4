//! Idempotent patching of workload resources
//!
//! The live primary container is compared field by field with the desired
//! spec. Quantities are compared by value, so `1` and `1000m` are equal and
//! produce no write. Only differing fields go into the patch.

use k8s_openapi::api::apps::v1::Deployment;
use k8s_openapi::api::core::v1::Container;
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use serde_json::{json, Map, Value};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use tracing::{debug, info};

use crate::calculator::{DesiredResourceSpec, ResourceAmounts};
use crate::cluster::WorkloadClient;
use crate::error::SizingError;
use crate::quantity;
use crate::sizing::{ResourceKind, WorkloadSpec};

const REQUESTS: &str = "requests";
const LIMITS: &str = "limits";

/// One changed resource field, e.g. `limits.memory`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FieldChange {
    pub field: String,
    pub from: Option<String>,
    pub to: Option<String>,
}

impl fmt::Display for FieldChange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}: {} -> {}",
            self.field,
            self.from.as_deref().unwrap_or("<unset>"),
            self.to.as_deref().unwrap_or("<unset>")
        )
    }
}

/// Result of reconciling one workload
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReconcileOutcome {
    Applied { changes: Vec<FieldChange> },
    NoOp,
}

/// Strategic merge patch for one container plus the changes it carries
#[derive(Debug, Clone, PartialEq)]
pub struct ResourcePatch {
    pub container: String,
    pub changes: Vec<FieldChange>,
    pub body: Value,
}

fn primary_container(deployment: &Deployment) -> Option<&Container> {
    deployment
        .spec
        .as_ref()?
        .template
        .spec
        .as_ref()?
        .containers
        .first()
}

fn live_equals(kind: ResourceKind, live: &Quantity, desired: i64) -> bool {
    // unparseable live values are treated as different and overwritten
    quantity::canonical(kind, &live.0).map_or(false, |v| v == desired)
}

fn diff_section(
    section: &str,
    live: Option<&BTreeMap<String, Quantity>>,
    desired: &ResourceAmounts,
    fields: &mut Map<String, Value>,
    changes: &mut Vec<FieldChange>,
) {
    for kind in ResourceKind::ALL {
        let amount = desired.get(kind);
        let current = live.and_then(|m| m.get(kind.as_str()));
        if current.map_or(false, |q| live_equals(kind, q, amount)) {
            continue;
        }

        let formatted = quantity::format(kind, amount);
        fields.insert(kind.as_str().to_string(), Value::String(formatted.clone()));
        changes.push(FieldChange {
            field: format!("{}.{}", section, kind),
            from: current.map(|q| q.0.clone()),
            to: Some(formatted),
        });
    }

    // anything other than cpu and memory is dropped from the managed lists
    let extras = live
        .into_iter()
        .flat_map(|m| m.iter())
        .filter(|(name, _)| name.parse::<ResourceKind>().is_err());
    for (name, value) in extras {
        fields.insert(name.clone(), Value::Null);
        changes.push(FieldChange {
            field: format!("{}.{}", section, name),
            from: Some(value.0.clone()),
            to: None,
        });
    }
}

/// Work out the patch needed to bring a live Deployment to `desired`
///
/// Returns `Ok(None)` when nothing differs.
pub fn plan_patch(
    workload: &str,
    live: &Deployment,
    desired: &DesiredResourceSpec,
) -> Result<Option<ResourcePatch>, SizingError> {
    let container = primary_container(live).ok_or_else(|| SizingError::NoPrimaryContainer {
        workload: workload.to_string(),
    })?;
    let resources = container.resources.as_ref();

    let mut changes = Vec::new();
    let mut requests = Map::new();
    let mut limits = Map::new();

    diff_section(
        REQUESTS,
        resources.and_then(|r| r.requests.as_ref()),
        &desired.requests,
        &mut requests,
        &mut changes,
    );
    diff_section(
        LIMITS,
        resources.and_then(|r| r.limits.as_ref()),
        &desired.limits,
        &mut limits,
        &mut changes,
    );

    if changes.is_empty() {
        return Ok(None);
    }

    let mut patched_resources = Map::new();
    if !requests.is_empty() {
        patched_resources.insert(REQUESTS.to_string(), Value::Object(requests));
    }
    if !limits.is_empty() {
        patched_resources.insert(LIMITS.to_string(), Value::Object(limits));
    }

    let body = json!({
        "spec": {
            "template": {
                "spec": {
                    "containers": [{
                        "name": container.name,
                        "resources": patched_resources,
                    }]
                }
            }
        }
    });

    Ok(Some(ResourcePatch {
        container: container.name.clone(),
        changes,
        body,
    }))
}

/// Applies desired resources to live workloads, writing only on change
#[derive(Clone)]
pub struct PatchReconciler {
    client: Arc<dyn WorkloadClient>,
}

impl PatchReconciler {
    pub fn new(client: Arc<dyn WorkloadClient>) -> Self {
        Self { client }
    }

    /// Reconcile one workload against its computed target
    ///
    /// An upstream sizing failure is returned as-is and the live object is
    /// not read or written.
    pub async fn reconcile_one(
        &self,
        workload: &WorkloadSpec,
        desired: Result<DesiredResourceSpec, SizingError>,
    ) -> Result<ReconcileOutcome, SizingError> {
        let desired = desired?;
        let name = workload.name.as_str();

        let live = self
            .client
            .get_workload(name)
            .await
            .map_err(|e| SizingError::cluster_api(name, &e))?
            .ok_or_else(|| SizingError::WorkloadNotFound {
                workload: name.to_string(),
            })?;

        let Some(patch) = plan_patch(name, &live, &desired)? else {
            debug!(workload = %name, "Live resources already match");
            return Ok(ReconcileOutcome::NoOp);
        };

        self.client
            .patch_workload(name, &patch.body)
            .await
            .map_err(|e| SizingError::cluster_api(name, &e))?;

        info!(
            workload = %name,
            container = %patch.container,
            changed_fields = patch.changes.len(),
            "Patched workload resources"
        );
        Ok(ReconcileOutcome::Applied {
            changes: patch.changes,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::FormulaError;
    use crate::sizing::{ContainerSpec, MEBIBYTE};
    use crate::testing::{deployment, deployment_with_resources, live_quantity, FakeCluster, CONTAINER};

    fn desired(cpu_req: i64, cpu_lim: i64, mem_req_mib: i64, mem_lim_mib: i64) -> DesiredResourceSpec {
        DesiredResourceSpec {
            requests: ResourceAmounts {
                cpu_millis: cpu_req,
                memory_bytes: mem_req_mib * MEBIBYTE,
            },
            limits: ResourceAmounts {
                cpu_millis: cpu_lim,
                memory_bytes: mem_lim_mib * MEBIBYTE,
            },
        }
    }

    fn workload(name: &str) -> WorkloadSpec {
        WorkloadSpec {
            name: name.to_string(),
            chart_reference: format!("accuknox/{}", name),
            containers: vec![ContainerSpec { resources: vec![] }],
        }
    }

    #[test]
    fn test_plan_patch_for_unset_resources() {
        let live = deployment("relay", 1, 1);
        let patch = plan_patch("relay", &live, &desired(100, 200, 64, 128))
            .unwrap()
            .unwrap();

        assert_eq!(patch.container, CONTAINER);
        assert_eq!(patch.changes.len(), 4);
        assert_eq!(
            patch.body.pointer("/spec/template/spec/containers/0/resources/requests/cpu"),
            Some(&json!("100m"))
        );
        assert_eq!(
            patch.body.pointer("/spec/template/spec/containers/0/resources/limits/memory"),
            Some(&json!("128Mi"))
        );
        assert_eq!(
            patch.body.pointer("/spec/template/spec/containers/0/name"),
            Some(&json!(CONTAINER))
        );
    }

    #[test]
    fn test_plan_patch_only_includes_changed_fields() {
        let live = deployment_with_resources(
            "relay",
            &[("cpu", "100m"), ("memory", "64Mi")],
            &[("cpu", "200m"), ("memory", "128Mi")],
        );
        let patch = plan_patch("relay", &live, &desired(100, 300, 64, 128))
            .unwrap()
            .unwrap();

        assert_eq!(
            patch.changes,
            vec![FieldChange {
                field: "limits.cpu".to_string(),
                from: Some("200m".to_string()),
                to: Some("300m".to_string()),
            }]
        );
        let resources = patch
            .body
            .pointer("/spec/template/spec/containers/0/resources")
            .unwrap();
        assert!(resources.get("requests").is_none());
        assert_eq!(resources["limits"], json!({"cpu": "300m"}));
    }

    #[test]
    fn test_plan_patch_compares_quantities_by_value() {
        let live = deployment_with_resources(
            "relay",
            &[("cpu", "1"), ("memory", "67108864")],
            &[("cpu", "2000m"), ("memory", "0.125Gi")],
        );
        let plan = plan_patch("relay", &live, &desired(1000, 2000, 64, 128)).unwrap();
        assert!(plan.is_none());
    }

    #[test]
    fn test_plan_patch_removes_unmanaged_resource_names() {
        let live = deployment_with_resources(
            "relay",
            &[("cpu", "100m"), ("memory", "64Mi"), ("ephemeral-storage", "1Gi")],
            &[("cpu", "200m"), ("memory", "128Mi")],
        );
        let patch = plan_patch("relay", &live, &desired(100, 200, 64, 128))
            .unwrap()
            .unwrap();

        assert_eq!(patch.changes.len(), 1);
        assert_eq!(patch.changes[0].field, "requests.ephemeral-storage");
        assert_eq!(patch.changes[0].to, None);
        assert_eq!(
            patch
                .body
                .pointer("/spec/template/spec/containers/0/resources/requests/ephemeral-storage"),
            Some(&Value::Null)
        );
    }

    #[test]
    fn test_plan_patch_requires_a_container() {
        let mut live = deployment("relay", 1, 1);
        if let Some(spec) = live.spec.as_mut().and_then(|s| s.template.spec.as_mut()) {
            spec.containers.clear();
        }
        let err = plan_patch("relay", &live, &desired(1, 1, 1, 1)).unwrap_err();
        assert!(matches!(err, SizingError::NoPrimaryContainer { .. }));
    }

    #[test]
    fn test_field_change_display() {
        let change = FieldChange {
            field: "requests.cpu".to_string(),
            from: None,
            to: Some("250m".to_string()),
        };
        assert_eq!(change.to_string(), "requests.cpu: <unset> -> 250m");
    }

    #[tokio::test]
    async fn test_reconcile_is_idempotent() {
        let cluster = Arc::new(FakeCluster::new().with_deployment(deployment("relay", 1, 1)));
        let reconciler = PatchReconciler::new(cluster.clone());
        let target = desired(250, 500, 64, 128);

        let first = tokio_test::assert_ok!(
            reconciler
                .reconcile_one(&workload("relay"), Ok(target))
                .await
        );
        assert!(matches!(first, ReconcileOutcome::Applied { ref changes } if changes.len() == 4));
        assert_eq!(cluster.patch_count(), 1);

        let live = cluster.get("relay").unwrap();
        assert_eq!(live_quantity(&live, "requests", "cpu").as_deref(), Some("250m"));
        assert_eq!(live_quantity(&live, "limits", "memory").as_deref(), Some("128Mi"));

        let second = reconciler
            .reconcile_one(&workload("relay"), Ok(target))
            .await
            .unwrap();
        assert_eq!(second, ReconcileOutcome::NoOp);
        assert_eq!(cluster.patch_count(), 1);
    }

    #[tokio::test]
    async fn test_upstream_failure_leaves_workload_untouched() {
        let cluster = Arc::new(FakeCluster::new().with_deployment(deployment("relay", 1, 1)));
        let reconciler = PatchReconciler::new(cluster.clone());

        let upstream = Err(SizingError::Formula {
            workload: "relay".to_string(),
            kind: ResourceKind::Cpu,
            source: FormulaError::NonPositive {
                formula: "n-3".to_string(),
                value: 0,
            },
        });
        let err = reconciler
            .reconcile_one(&workload("relay"), upstream)
            .await
            .unwrap_err();

        assert_eq!(err.kind_label(), "formula");
        assert_eq!(cluster.gets.load(std::sync::atomic::Ordering::SeqCst), 0);
        assert_eq!(cluster.patch_count(), 0);
    }

    #[tokio::test]
    async fn test_missing_workload_is_reported() {
        let cluster = Arc::new(FakeCluster::new());
        let reconciler = PatchReconciler::new(cluster.clone());

        let err = reconciler
            .reconcile_one(&workload("relay"), Ok(desired(1, 1, 1, 1)))
            .await
            .unwrap_err();
        assert!(matches!(err, SizingError::WorkloadNotFound { .. }));
        assert_eq!(cluster.patch_count(), 0);
    }

    #[tokio::test]
    async fn test_get_failure_maps_to_cluster_api_error() {
        let cluster = Arc::new(FakeCluster::new().with_deployment(deployment("relay", 1, 1)));
        cluster.fail_get_for("relay");
        let reconciler = PatchReconciler::new(cluster.clone());

        let err = reconciler
            .reconcile_one(&workload("relay"), Ok(desired(1, 1, 1, 1)))
            .await
            .unwrap_err();
        assert!(matches!(err, SizingError::ClusterApi { .. }));
        assert!(err.to_string().contains("connection refused"));
    }
}
