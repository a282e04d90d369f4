//! Cluster access for the operator
//!
//! The sizing core talks to the cluster only through the traits in this
//! module. `KubeCluster` implements them against the Kubernetes API, and
//! the watch module turns object changes into coordinator events.

mod client;
mod watch;

pub use client::KubeCluster;
pub use watch::{
    run_event_source, ConfigTracker, EventTranslator, NodeTracker, WorkloadTracker,
};

use anyhow::Result;
use k8s_openapi::api::apps::v1::Deployment;

pub use async_trait::async_trait;

/// Access to the managed workload objects
#[async_trait]
pub trait WorkloadClient: Send + Sync {
    /// Fetch a workload by name, `None` when it does not exist
    async fn get_workload(&self, name: &str) -> Result<Option<Deployment>>;

    /// List all workloads in the managed namespace
    async fn list_workloads(&self) -> Result<Vec<Deployment>>;

    /// Apply a strategic merge patch to a workload
    async fn patch_workload(&self, name: &str, patch: &serde_json::Value) -> Result<()>;
}

/// Source of the raw sizing configuration document
#[async_trait]
pub trait ConfigSource: Send + Sync {
    async fn fetch_document(&self) -> Result<String>;
}

/// Authoritative node listing, used once at startup
#[async_trait]
pub trait NodeLister: Send + Sync {
    async fn list_node_names(&self) -> Result<Vec<String>>;
}

/// Whether a Deployment reports as many ready replicas as it wants
pub fn deployment_ready(deployment: &Deployment) -> bool {
    let desired = deployment
        .spec
        .as_ref()
        .and_then(|s| s.replicas)
        .unwrap_or(1);
    let ready = deployment
        .status
        .as_ref()
        .and_then(|s| s.ready_replicas)
        .unwrap_or(0);
    ready == desired
}
