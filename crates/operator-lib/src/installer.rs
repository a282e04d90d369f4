//! Install-if-absent support
//!
//! Workloads missing from the cluster at startup are installed from their
//! chart reference. The installer is a trait so tests never shell out.

use anyhow::{bail, Context, Result};
use std::collections::BTreeMap;
use tokio::process::Command;
use tracing::{debug, info};

pub use async_trait::async_trait;

/// Installs a workload from a packaged chart
#[async_trait]
pub trait ChartInstaller: Send + Sync {
    async fn install(
        &self,
        chart_reference: &str,
        workload_name: &str,
        namespace: &str,
        values: &BTreeMap<String, String>,
    ) -> Result<()>;
}

/// Tenant and cluster identity passed to installed charts
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstallIdentity {
    pub tenant_id: String,
    pub cluster_id: String,
    pub cluster_name: String,
    pub workspace_id: String,
}

impl Default for InstallIdentity {
    fn default() -> Self {
        Self {
            tenant_id: "0".to_string(),
            cluster_id: "0".to_string(),
            cluster_name: "default".to_string(),
            workspace_id: "0".to_string(),
        }
    }
}

impl InstallIdentity {
    /// Read identity from the process environment, falling back to defaults
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let defaults = Self::default();
        let read = |key: &str, default: String| {
            lookup(key).filter(|v| !v.is_empty()).unwrap_or(default)
        };

        Self {
            tenant_id: read("tenant_id", defaults.tenant_id),
            cluster_id: read("cluster_id", defaults.cluster_id),
            cluster_name: read("cluster_name", defaults.cluster_name),
            workspace_id: read("workspace_id", defaults.workspace_id),
        }
    }

    /// Chart values for an install into `namespace`
    pub fn values(&self, namespace: &str) -> BTreeMap<String, String> {
        BTreeMap::from([
            ("serviceAccount.Namespace".to_string(), namespace.to_string()),
            ("env.tenant_id".to_string(), self.tenant_id.clone()),
            ("env.workspace_id".to_string(), self.workspace_id.clone()),
            ("env.cluster_name".to_string(), self.cluster_name.clone()),
            ("env.cluster_id".to_string(), self.cluster_id.clone()),
        ])
    }
}

/// Installs charts by running the helm CLI
#[derive(Debug, Clone)]
pub struct HelmInstaller {
    binary: String,
}

impl Default for HelmInstaller {
    fn default() -> Self {
        Self::new("helm")
    }
}

impl HelmInstaller {
    pub fn new(binary: impl Into<String>) -> Self {
        Self {
            binary: binary.into(),
        }
    }

    /// Arguments for `helm install`
    pub fn install_args(
        chart_reference: &str,
        workload_name: &str,
        namespace: &str,
        values: &BTreeMap<String, String>,
    ) -> Vec<String> {
        let mut args = vec![
            "install".to_string(),
            workload_name.to_string(),
            chart_reference.to_string(),
            "--namespace".to_string(),
            namespace.to_string(),
        ];

        if !values.is_empty() {
            let set = values
                .iter()
                .map(|(k, v)| format!("{}={}", k, v))
                .collect::<Vec<_>>()
                .join(",");
            args.push("--set".to_string());
            args.push(set);
        }
        args
    }
}

#[async_trait]
impl ChartInstaller for HelmInstaller {
    async fn install(
        &self,
        chart_reference: &str,
        workload_name: &str,
        namespace: &str,
        values: &BTreeMap<String, String>,
    ) -> Result<()> {
        let args = Self::install_args(chart_reference, workload_name, namespace, values);
        debug!(binary = %self.binary, args = ?args, "Running chart install");

        let output = Command::new(&self.binary)
            .args(&args)
            .output()
            .await
            .with_context(|| format!("Failed to run {}", self.binary))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            bail!(
                "{} install exited with {}: {}",
                self.binary,
                output.status,
                stderr.trim()
            );
        }

        info!(
            workload = %workload_name,
            chart = %chart_reference,
            namespace = %namespace,
            "Installed workload from chart"
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn test_identity_defaults() {
        let identity = InstallIdentity::from_lookup(|_| None);
        assert_eq!(identity, InstallIdentity::default());
        assert_eq!(identity.cluster_name, "default");
    }

    #[test]
    fn test_identity_from_lookup() {
        let env: HashMap<&str, &str> = [
            ("tenant_id", "42"),
            ("cluster_name", "prod-east"),
            ("workspace_id", ""),
        ]
        .into_iter()
        .collect();

        let identity = InstallIdentity::from_lookup(|k| env.get(k).map(|v| v.to_string()));
        assert_eq!(identity.tenant_id, "42");
        assert_eq!(identity.cluster_name, "prod-east");
        assert_eq!(identity.cluster_id, "0");
        // empty values fall back to the default
        assert_eq!(identity.workspace_id, "0");
    }

    #[test]
    fn test_values_include_namespace_and_identity() {
        let values = InstallIdentity::default().values("accuknox-agents");
        assert_eq!(values.len(), 5);
        assert_eq!(values["serviceAccount.Namespace"], "accuknox-agents");
        assert_eq!(values["env.cluster_name"], "default");
    }

    #[test]
    fn test_helm_install_args() {
        let values = BTreeMap::from([
            ("env.cluster_id".to_string(), "7".to_string()),
            ("env.tenant_id".to_string(), "3".to_string()),
        ]);
        let args = HelmInstaller::install_args(
            "accuknox/feeder-service",
            "feeder-service",
            "accuknox-agents",
            &values,
        );

        assert_eq!(
            args,
            vec![
                "install",
                "feeder-service",
                "accuknox/feeder-service",
                "--namespace",
                "accuknox-agents",
                "--set",
                "env.cluster_id=7,env.tenant_id=3",
            ]
        );
    }

    #[tokio::test]
    async fn test_missing_binary_is_an_error() {
        let installer = HelmInstaller::new("/nonexistent/helm-binary");
        let err = tokio_test::assert_err!(
            installer
                .install("chart", "relay", "ns", &BTreeMap::new())
                .await
        );
        assert!(err.to_string().contains("Failed to run"));
    }
}
