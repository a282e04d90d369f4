//! Watch-based event sources
//!
//! Each source runs one `kube::runtime::watcher` stream and translates its
//! events into `ClusterEvent`s on the coordinator channel. Translation is
//! kept separate from the stream so it can be tested with plain objects.

use super::deployment_ready;
use crate::coordinator::ClusterEvent;
use crate::health::HealthRegistry;
use k8s_openapi::api::apps::v1::Deployment;
use k8s_openapi::api::core::v1::{ConfigMap, Node};
use kube::runtime::watcher;
use kube::{Api, Resource, ResourceExt};
use serde::de::DeserializeOwned;
use std::collections::{HashMap, HashSet};
use std::fmt::Debug;
use tokio::sync::{broadcast, mpsc};
use tokio_stream::StreamExt;
use tracing::{debug, info, warn};

/// Translates watch events of one resource type into coordinator events
pub trait EventTranslator<K>: Send {
    fn translate(&mut self, event: watcher::Event<K>) -> Vec<ClusterEvent>;
}

/// Tracks node membership
///
/// Seeded with the startup listing so the initial watch list does not
/// count existing nodes a second time.
#[derive(Debug, Default)]
pub struct NodeTracker {
    known: HashSet<String>,
}

impl NodeTracker {
    pub fn new(known: impl IntoIterator<Item = String>) -> Self {
        Self {
            known: known.into_iter().collect(),
        }
    }

    pub fn len(&self) -> usize {
        self.known.len()
    }

    pub fn is_empty(&self) -> bool {
        self.known.is_empty()
    }
}

impl EventTranslator<Node> for NodeTracker {
    fn translate(&mut self, event: watcher::Event<Node>) -> Vec<ClusterEvent> {
        match event {
            watcher::Event::Applied(node) => {
                let name = node.name_any();
                if self.known.insert(name.clone()) {
                    vec![ClusterEvent::NodeJoined(name)]
                } else {
                    Vec::new()
                }
            }
            watcher::Event::Deleted(node) => {
                let name = node.name_any();
                if self.known.remove(&name) {
                    vec![ClusterEvent::NodeLeft(name)]
                } else {
                    Vec::new()
                }
            }
            watcher::Event::Restarted(nodes) => {
                let current: HashSet<String> = nodes.iter().map(|n| n.name_any()).collect();

                let mut left: Vec<String> = self.known.difference(&current).cloned().collect();
                let mut joined: Vec<String> = current.difference(&self.known).cloned().collect();
                left.sort();
                joined.sort();

                self.known = current;
                left.into_iter()
                    .map(ClusterEvent::NodeLeft)
                    .chain(joined.into_iter().map(ClusterEvent::NodeJoined))
                    .collect()
            }
        }
    }
}

/// Tracks workload readiness transitions by resourceVersion
#[derive(Debug, Default)]
pub struct WorkloadTracker {
    versions: HashMap<String, Option<String>>,
}

impl WorkloadTracker {
    pub fn new() -> Self {
        Self::default()
    }

    fn observe(&mut self, deployment: &Deployment) -> Option<ClusterEvent> {
        let name = deployment.name_any();
        let version = deployment.resource_version();

        match self.versions.insert(name.clone(), version.clone()) {
            None => {
                info!(deployment = %name, "New deployment detected");
                Some(ClusterEvent::WorkloadBecameReady(name))
            }
            Some(previous) if previous != version && deployment_ready(deployment) => {
                info!(deployment = %name, "Deployment updated and ready");
                Some(ClusterEvent::WorkloadBecameReady(name))
            }
            Some(_) => None,
        }
    }
}

impl EventTranslator<Deployment> for WorkloadTracker {
    fn translate(&mut self, event: watcher::Event<Deployment>) -> Vec<ClusterEvent> {
        match event {
            watcher::Event::Applied(deployment) => self.observe(&deployment).into_iter().collect(),
            watcher::Event::Deleted(deployment) => {
                let name = deployment.name_any();
                info!(deployment = %name, "Deployment deleted");
                self.versions.remove(&name);
                Vec::new()
            }
            watcher::Event::Restarted(deployments) => {
                let current: HashSet<String> = deployments.iter().map(|d| d.name_any()).collect();
                self.versions.retain(|name, _| current.contains(name));
                deployments.iter().filter_map(|d| self.observe(d)).collect()
            }
        }
    }
}

/// Tracks the sizing ConfigMap's resourceVersion
#[derive(Debug)]
pub struct ConfigTracker {
    name: String,
    version: Option<String>,
}

impl ConfigTracker {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            version: None,
        }
    }

    fn observe(&mut self, config_map: &ConfigMap) -> Option<ClusterEvent> {
        if config_map.name_any() != self.name {
            return None;
        }

        let version = config_map.resource_version();
        let previous = std::mem::replace(&mut self.version, version.clone());
        match previous {
            Some(prev) if Some(&prev) != version.as_ref() => {
                info!(config_map = %self.name, "ConfigMap updated");
                Some(ClusterEvent::ConfigurationChanged)
            }
            _ => None,
        }
    }
}

impl EventTranslator<ConfigMap> for ConfigTracker {
    fn translate(&mut self, event: watcher::Event<ConfigMap>) -> Vec<ClusterEvent> {
        match event {
            watcher::Event::Applied(config_map) => self.observe(&config_map).into_iter().collect(),
            watcher::Event::Deleted(config_map) => {
                if config_map.name_any() == self.name {
                    warn!(config_map = %self.name, "Sizing ConfigMap deleted");
                    self.version = None;
                }
                Vec::new()
            }
            watcher::Event::Restarted(config_maps) => {
                config_maps.iter().filter_map(|cm| self.observe(cm)).collect()
            }
        }
    }
}

/// Run one watch stream until shutdown, forwarding translated events
pub async fn run_event_source<K, T>(
    api: Api<K>,
    config: watcher::Config,
    mut translator: T,
    events: mpsc::Sender<ClusterEvent>,
    health: HealthRegistry,
    component: &'static str,
    mut shutdown: broadcast::Receiver<()>,
) where
    K: Resource + Clone + DeserializeOwned + Debug + Send + 'static,
    T: EventTranslator<K>,
{
    info!(source = component, "Starting event source");
    let mut stream = Box::pin(watcher(api, config));

    loop {
        tokio::select! {
            item = stream.next() => match item {
                Some(Ok(event)) => {
                    health.set_healthy(component).await;
                    for cluster_event in translator.translate(event) {
                        debug!(source = component, event = ?cluster_event, "Forwarding event");
                        if events.send(cluster_event).await.is_err() {
                            info!(source = component, "Coordinator gone, stopping event source");
                            return;
                        }
                    }
                }
                Some(Err(e)) => {
                    warn!(source = component, error = %e, "Watch error, stream will retry");
                    health.set_degraded(component, e.to_string()).await;
                }
                None => {
                    warn!(source = component, "Watch stream ended");
                    health.set_unhealthy(component, "watch stream ended").await;
                    break;
                }
            },
            _ = shutdown.recv() => {
                info!(source = component, "Shutting down event source");
                break;
            }
        }
    }
}
