//! Kubernetes API implementation of the cluster traits

use super::{async_trait, ConfigSource, NodeLister, WorkloadClient};
use anyhow::{Context, Result};
use k8s_openapi::api::apps::v1::Deployment;
use k8s_openapi::api::core::v1::{ConfigMap, Node};
use kube::api::{Api, ListParams, Patch, PatchParams};
use kube::{Client, ResourceExt};
use tracing::debug;

/// Cluster access scoped to the operator's namespace and ConfigMap
#[derive(Clone)]
pub struct KubeCluster {
    client: Client,
    namespace: String,
    config_map: String,
    config_key: String,
}

impl KubeCluster {
    pub fn new(
        client: Client,
        namespace: impl Into<String>,
        config_map: impl Into<String>,
        config_key: impl Into<String>,
    ) -> Self {
        Self {
            client,
            namespace: namespace.into(),
            config_map: config_map.into(),
            config_key: config_key.into(),
        }
    }

    /// Connect using in-cluster configuration or the local kubeconfig
    pub async fn try_default(
        namespace: impl Into<String>,
        config_map: impl Into<String>,
        config_key: impl Into<String>,
    ) -> Result<Self> {
        let client = Client::try_default()
            .await
            .context("Failed to create Kubernetes client")?;
        Ok(Self::new(client, namespace, config_map, config_key))
    }

    pub fn client(&self) -> Client {
        self.client.clone()
    }

    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    pub fn config_map(&self) -> &str {
        &self.config_map
    }

    pub fn deployments(&self) -> Api<Deployment> {
        Api::namespaced(self.client.clone(), &self.namespace)
    }

    pub fn config_maps(&self) -> Api<ConfigMap> {
        Api::namespaced(self.client.clone(), &self.namespace)
    }

    pub fn nodes(&self) -> Api<Node> {
        Api::all(self.client.clone())
    }
}

#[async_trait]
impl WorkloadClient for KubeCluster {
    async fn get_workload(&self, name: &str) -> Result<Option<Deployment>> {
        self.deployments()
            .get_opt(name)
            .await
            .with_context(|| format!("Failed to get deployment {}/{}", self.namespace, name))
    }

    async fn list_workloads(&self) -> Result<Vec<Deployment>> {
        let list = self
            .deployments()
            .list(&ListParams::default())
            .await
            .with_context(|| format!("Failed to list deployments in {}", self.namespace))?;
        Ok(list.items)
    }

    async fn patch_workload(&self, name: &str, patch: &serde_json::Value) -> Result<()> {
        debug!(namespace = %self.namespace, deployment = %name, patch = %patch, "Patching deployment");
        self.deployments()
            .patch(name, &PatchParams::default(), &Patch::Strategic(patch))
            .await
            .with_context(|| format!("Failed to patch deployment {}/{}", self.namespace, name))?;
        Ok(())
    }
}

#[async_trait]
impl ConfigSource for KubeCluster {
    async fn fetch_document(&self) -> Result<String> {
        let config_map = self
            .config_maps()
            .get(&self.config_map)
            .await
            .with_context(|| {
                format!(
                    "Failed to get ConfigMap {}/{}",
                    self.namespace, self.config_map
                )
            })?;

        config_map
            .data
            .and_then(|mut data| data.remove(&self.config_key))
            .with_context(|| {
                format!(
                    "ConfigMap {}/{} has no key {}",
                    self.namespace, self.config_map, self.config_key
                )
            })
    }
}

#[async_trait]
impl NodeLister for KubeCluster {
    async fn list_node_names(&self) -> Result<Vec<String>> {
        let list = self
            .nodes()
            .list(&ListParams::default())
            .await
            .context("Failed to list nodes")?;
        Ok(list.items.iter().map(|node| node.name_any()).collect())
    }
}
