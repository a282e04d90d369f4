//! In-memory collaborators shared by unit tests

use crate::cluster::{async_trait, ConfigSource, NodeLister, WorkloadClient};
use crate::installer::ChartInstaller;
use anyhow::{anyhow, Result};
use k8s_openapi::api::apps::v1::{Deployment, DeploymentSpec, DeploymentStatus};
use k8s_openapi::api::core::v1::{Container, PodSpec, PodTemplateSpec, ResourceRequirements};
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Mutex;

pub(crate) const CONTAINER: &str = "agent";

/// Deployment with one container and no resources set
pub(crate) fn deployment(name: &str, replicas: i32, ready: i32) -> Deployment {
    Deployment {
        metadata: ObjectMeta {
            name: Some(name.to_string()),
            namespace: Some("accuknox-agents".to_string()),
            ..Default::default()
        },
        spec: Some(DeploymentSpec {
            replicas: Some(replicas),
            template: PodTemplateSpec {
                spec: Some(PodSpec {
                    containers: vec![Container {
                        name: CONTAINER.to_string(),
                        image: Some("accuknox/agent:latest".to_string()),
                        ..Default::default()
                    }],
                    ..Default::default()
                }),
                ..Default::default()
            },
            ..Default::default()
        }),
        status: Some(DeploymentStatus {
            ready_replicas: Some(ready),
            ..Default::default()
        }),
    }
}

/// Deployment whose primary container carries the given requests and limits
pub(crate) fn deployment_with_resources(
    name: &str,
    requests: &[(&str, &str)],
    limits: &[(&str, &str)],
) -> Deployment {
    let mut d = deployment(name, 1, 1);
    set_resources(&mut d, requests, limits);
    d
}

fn quantities(pairs: &[(&str, &str)]) -> Option<BTreeMap<String, Quantity>> {
    if pairs.is_empty() {
        return None;
    }
    Some(
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), Quantity(v.to_string())))
            .collect(),
    )
}

fn set_resources(d: &mut Deployment, requests: &[(&str, &str)], limits: &[(&str, &str)]) {
    if let Some(container) = first_container_mut(d) {
        container.resources = Some(ResourceRequirements {
            requests: quantities(requests),
            limits: quantities(limits),
            ..Default::default()
        });
    }
}

fn first_container_mut(d: &mut Deployment) -> Option<&mut Container> {
    d.spec
        .as_mut()?
        .template
        .spec
        .as_mut()?
        .containers
        .first_mut()
}

/// Live quantity of one resource field, for assertions
pub(crate) fn live_quantity(d: &Deployment, section: &str, resource: &str) -> Option<String> {
    let container = d.spec.as_ref()?.template.spec.as_ref()?.containers.first()?;
    let resources = container.resources.as_ref()?;
    let map = match section {
        "requests" => resources.requests.as_ref()?,
        _ => resources.limits.as_ref()?,
    };
    map.get(resource).map(|q| q.0.clone())
}

/// Applies the resources fragment of a strategic merge patch the way the
/// API server would: keys merge into the named container, null removes.
fn apply_resource_patch(d: &mut Deployment, patch: &serde_json::Value) -> Result<()> {
    let containers = patch
        .pointer("/spec/template/spec/containers")
        .and_then(|c| c.as_array())
        .ok_or_else(|| anyhow!("patch has no container list"))?;

    for entry in containers {
        let name = entry
            .get("name")
            .and_then(|n| n.as_str())
            .ok_or_else(|| anyhow!("patched container has no name"))?;

        let container = d
            .spec
            .as_mut()
            .and_then(|s| s.template.spec.as_mut())
            .and_then(|s| s.containers.iter_mut().find(|c| c.name == name))
            .ok_or_else(|| anyhow!("container {} not found", name))?;

        let Some(resources) = entry.get("resources") else {
            continue;
        };
        let current = container.resources.get_or_insert_with(Default::default);

        for section in ["requests", "limits"] {
            let Some(fields) = resources.get(section).and_then(|s| s.as_object()) else {
                continue;
            };
            let map = match section {
                "requests" => current.requests.get_or_insert_with(BTreeMap::new),
                _ => current.limits.get_or_insert_with(BTreeMap::new),
            };
            for (key, value) in fields {
                match value.as_str() {
                    Some(q) => {
                        map.insert(key.clone(), Quantity(q.to_string()));
                    }
                    None => {
                        map.remove(key);
                    }
                }
            }
        }
    }
    Ok(())
}

/// Cluster fake backed by a map of Deployments
#[derive(Default)]
pub(crate) struct FakeCluster {
    deployments: Mutex<HashMap<String, Deployment>>,
    document: Mutex<Option<String>>,
    nodes: Mutex<Vec<String>>,
    fail_get: Mutex<HashSet<String>>,
    fail_list: AtomicBool,
    fail_nodes: AtomicBool,
    pub(crate) gets: AtomicUsize,
    pub(crate) patches: AtomicUsize,
    pub(crate) fetches: AtomicUsize,
}

impl FakeCluster {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn with_document(self, document: &str) -> Self {
        self.set_document(Some(document));
        self
    }

    pub(crate) fn with_nodes(self, count: usize) -> Self {
        *self.nodes.lock().unwrap() = (0..count).map(|i| format!("node-{}", i)).collect();
        self
    }

    pub(crate) fn with_deployment(self, d: Deployment) -> Self {
        self.insert(d);
        self
    }

    pub(crate) fn insert(&self, d: Deployment) {
        let name = d.metadata.name.clone().unwrap_or_default();
        self.deployments.lock().unwrap().insert(name, d);
    }

    pub(crate) fn set_document(&self, document: Option<&str>) {
        *self.document.lock().unwrap() = document.map(str::to_string);
    }

    pub(crate) fn set_ready(&self, name: &str, ready: i32) {
        if let Some(d) = self.deployments.lock().unwrap().get_mut(name) {
            d.status.get_or_insert_with(Default::default).ready_replicas = Some(ready);
        }
    }

    pub(crate) fn fail_get_for(&self, name: &str) {
        self.fail_get.lock().unwrap().insert(name.to_string());
    }

    pub(crate) fn fail_node_listing(&self) {
        self.fail_nodes.store(true, Ordering::SeqCst);
    }

    pub(crate) fn fail_listing(&self, fail: bool) {
        self.fail_list.store(fail, Ordering::SeqCst);
    }

    pub(crate) fn get(&self, name: &str) -> Option<Deployment> {
        self.deployments.lock().unwrap().get(name).cloned()
    }

    pub(crate) fn patch_count(&self) -> usize {
        self.patches.load(Ordering::SeqCst)
    }

    pub(crate) fn fetch_count(&self) -> usize {
        self.fetches.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl WorkloadClient for FakeCluster {
    async fn get_workload(&self, name: &str) -> Result<Option<Deployment>> {
        self.gets.fetch_add(1, Ordering::SeqCst);
        if self.fail_get.lock().unwrap().contains(name) {
            return Err(anyhow!("connection refused"));
        }
        Ok(self.get(name))
    }

    async fn list_workloads(&self) -> Result<Vec<Deployment>> {
        if self.fail_list.load(Ordering::SeqCst) {
            return Err(anyhow!("list timed out"));
        }
        Ok(self.deployments.lock().unwrap().values().cloned().collect())
    }

    async fn patch_workload(&self, name: &str, patch: &serde_json::Value) -> Result<()> {
        self.patches.fetch_add(1, Ordering::SeqCst);
        let mut deployments = self.deployments.lock().unwrap();
        let d = deployments
            .get_mut(name)
            .ok_or_else(|| anyhow!("deployment {} not found", name))?;
        apply_resource_patch(d, patch)
    }
}

#[async_trait]
impl ConfigSource for FakeCluster {
    async fn fetch_document(&self) -> Result<String> {
        self.fetches.fetch_add(1, Ordering::SeqCst);
        self.document
            .lock()
            .unwrap()
            .clone()
            .ok_or_else(|| anyhow!("configmap not found"))
    }
}

#[async_trait]
impl NodeLister for FakeCluster {
    async fn list_node_names(&self) -> Result<Vec<String>> {
        if self.fail_nodes.load(Ordering::SeqCst) {
            return Err(anyhow!("nodes is forbidden"));
        }
        Ok(self.nodes.lock().unwrap().clone())
    }
}

/// Recorded `install` call
#[derive(Debug, Clone, PartialEq)]
pub(crate) struct InstallCall {
    pub chart: String,
    pub workload: String,
    pub namespace: String,
    pub values: BTreeMap<String, String>,
}

/// Installer fake that records calls and optionally fails per chart
#[derive(Default)]
pub(crate) struct FakeInstaller {
    calls: Mutex<Vec<InstallCall>>,
    failing: Mutex<HashSet<String>>,
}

impl FakeInstaller {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn fail_chart(&self, chart: &str) {
        self.failing.lock().unwrap().insert(chart.to_string());
    }

    pub(crate) fn calls(&self) -> Vec<InstallCall> {
        self.calls.lock().unwrap().clone()
    }
}

#[async_trait]
impl ChartInstaller for FakeInstaller {
    async fn install(
        &self,
        chart_reference: &str,
        workload_name: &str,
        namespace: &str,
        values: &BTreeMap<String, String>,
    ) -> Result<()> {
        self.calls.lock().unwrap().push(InstallCall {
            chart: chart_reference.to_string(),
            workload: workload_name.to_string(),
            namespace: namespace.to_string(),
            values: values.clone(),
        });
        if self.failing.lock().unwrap().contains(chart_reference) {
            return Err(anyhow!("chart {} not found in repository", chart_reference));
        }
        Ok(())
    }
}
