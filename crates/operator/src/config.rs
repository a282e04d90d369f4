//! Operator configuration

use anyhow::{Context, Result};
use operator_lib::calculator::BoundPolicy;
use operator_lib::coordinator::{CoordinatorConfig, ReadinessConfig};
use operator_lib::installer::InstallIdentity;
use serde::Deserialize;
use std::time::Duration;

/// Operator configuration, read from `OPERATOR_*` environment variables
#[derive(Debug, Clone, Deserialize)]
pub struct OperatorConfig {
    /// Namespace holding the managed workloads and the sizing ConfigMap
    #[serde(default = "default_namespace")]
    pub namespace: String,

    #[serde(default = "default_config_map_name")]
    pub config_map_name: String,

    /// Key inside the ConfigMap holding the YAML document
    #[serde(default = "default_config_key")]
    pub config_key: String,

    /// API server port for health/metrics
    #[serde(default = "default_api_port")]
    pub api_port: u16,

    #[serde(default = "default_readiness_poll_interval")]
    pub readiness_poll_interval_secs: u64,

    #[serde(default = "default_readiness_timeout")]
    pub readiness_timeout_secs: u64,

    #[serde(default)]
    pub bound_policy: BoundPolicy,

    #[serde(default = "default_helm_binary")]
    pub helm_binary: String,

    #[serde(default = "default_channel_capacity")]
    pub channel_capacity: usize,
}

impl Default for OperatorConfig {
    fn default() -> Self {
        Self {
            namespace: default_namespace(),
            config_map_name: default_config_map_name(),
            config_key: default_config_key(),
            api_port: default_api_port(),
            readiness_poll_interval_secs: default_readiness_poll_interval(),
            readiness_timeout_secs: default_readiness_timeout(),
            bound_policy: BoundPolicy::default(),
            helm_binary: default_helm_binary(),
            channel_capacity: default_channel_capacity(),
        }
    }
}

fn default_namespace() -> String {
    "accuknox-agents".to_string()
}

fn default_config_map_name() -> String {
    "agents-operator-config".to_string()
}

fn default_config_key() -> String {
    "conf.yaml".to_string()
}

fn default_api_port() -> u16 {
    8080
}

fn default_readiness_poll_interval() -> u64 {
    2
}

fn default_readiness_timeout() -> u64 {
    600
}

fn default_helm_binary() -> String {
    "helm".to_string()
}

fn default_channel_capacity() -> usize {
    256
}

impl OperatorConfig {
    /// Load configuration from the environment
    pub fn load() -> Result<Self> {
        Self::from_source(config::Environment::with_prefix("OPERATOR"))
    }

    fn from_source<S>(source: S) -> Result<Self>
    where
        S: config::Source + Send + Sync + 'static,
    {
        config::Config::builder()
            .add_source(source)
            .build()
            .context("Failed to read operator configuration")?
            .try_deserialize()
            .context("Invalid operator configuration")
    }

    /// Coordinator settings; install identity comes from the environment
    pub fn coordinator_config(&self) -> CoordinatorConfig {
        CoordinatorConfig {
            namespace: self.namespace.clone(),
            readiness: ReadinessConfig {
                poll_interval: Duration::from_secs(self.readiness_poll_interval_secs.max(1)),
                timeout: Duration::from_secs(self.readiness_timeout_secs),
            },
            channel_capacity: self.channel_capacity,
            bound_policy: self.bound_policy,
            identity: InstallIdentity::from_env(),
        }
    }
}
