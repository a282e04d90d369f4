//! Bounded wait for workloads to become ready

use std::time::Duration;
use tokio::sync::broadcast;
use tokio::time::{sleep, Instant};
use tracing::{debug, warn};

use crate::cluster::{deployment_ready, WorkloadClient};

#[derive(Debug, Clone, Copy)]
pub struct ReadinessConfig {
    pub poll_interval: Duration,
    pub timeout: Duration,
}

impl Default for ReadinessConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(2),
            timeout: Duration::from_secs(600),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadinessOutcome {
    Ready,
    TimedOut,
    Cancelled,
}

async fn all_ready(client: &dyn WorkloadClient) -> bool {
    match client.list_workloads().await {
        Ok(deployments) => {
            let pending: Vec<_> = deployments
                .iter()
                .filter(|d| !deployment_ready(d))
                .filter_map(|d| d.metadata.name.as_deref())
                .collect();
            if !pending.is_empty() {
                debug!(pending = ?pending, "Waiting for deployments to become ready");
            }
            pending.is_empty()
        }
        Err(e) => {
            warn!(error = %e, "Failed to list deployments while waiting for readiness");
            false
        }
    }
}

/// Poll until every workload in the namespace has all replicas ready
///
/// Gives up after `timeout` and returns early on shutdown.
pub async fn wait_for_all_ready(
    client: &dyn WorkloadClient,
    config: &ReadinessConfig,
    shutdown: &mut broadcast::Receiver<()>,
) -> ReadinessOutcome {
    let deadline = Instant::now() + config.timeout;

    loop {
        if all_ready(client).await {
            return ReadinessOutcome::Ready;
        }

        let now = Instant::now();
        if now >= deadline {
            return ReadinessOutcome::TimedOut;
        }
        let nap = config.poll_interval.min(deadline - now);

        tokio::select! {
            _ = sleep(nap) => {}
            _ = shutdown.recv() => return ReadinessOutcome::Cancelled,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{deployment, FakeCluster};
    use std::sync::Arc;

    fn fast() -> ReadinessConfig {
        ReadinessConfig {
            poll_interval: Duration::from_millis(5),
            timeout: Duration::from_millis(200),
        }
    }

    #[tokio::test]
    async fn test_ready_immediately() {
        let cluster = FakeCluster::new().with_deployment(deployment("relay", 2, 2));
        let (_tx, mut rx) = broadcast::channel(1);

        let outcome = wait_for_all_ready(&cluster, &fast(), &mut rx).await;
        assert_eq!(outcome, ReadinessOutcome::Ready);
    }

    #[tokio::test]
    async fn test_becomes_ready_while_polling() {
        let cluster = Arc::new(
            FakeCluster::new()
                .with_deployment(deployment("relay", 1, 1))
                .with_deployment(deployment("feeder", 2, 0)),
        );
        let (_tx, mut rx) = broadcast::channel(1);

        let setter = cluster.clone();
        tokio::spawn(async move {
            sleep(Duration::from_millis(20)).await;
            setter.set_ready("feeder", 2);
        });

        let outcome = wait_for_all_ready(cluster.as_ref(), &fast(), &mut rx).await;
        assert_eq!(outcome, ReadinessOutcome::Ready);
    }

    #[tokio::test]
    async fn test_times_out() {
        let cluster = FakeCluster::new().with_deployment(deployment("feeder", 2, 1));
        let (_tx, mut rx) = broadcast::channel(1);

        let started = Instant::now();
        let outcome = wait_for_all_ready(&cluster, &fast(), &mut rx).await;
        assert_eq!(outcome, ReadinessOutcome::TimedOut);
        assert!(started.elapsed() >= Duration::from_millis(200));
    }

    #[tokio::test]
    async fn test_list_errors_count_as_not_ready() {
        let cluster = FakeCluster::new().with_deployment(deployment("relay", 1, 1));
        cluster.fail_listing(true);
        let (_tx, mut rx) = broadcast::channel(1);

        let outcome = wait_for_all_ready(&cluster, &fast(), &mut rx).await;
        assert_eq!(outcome, ReadinessOutcome::TimedOut);
    }

    #[tokio::test]
    async fn test_cancelled_by_shutdown() {
        let cluster = FakeCluster::new().with_deployment(deployment("feeder", 1, 0));
        let (tx, mut rx) = broadcast::channel(1);
        let config = ReadinessConfig {
            poll_interval: Duration::from_millis(5),
            timeout: Duration::from_secs(60),
        };

        tokio::spawn(async move {
            sleep(Duration::from_millis(20)).await;
            let _ = tx.send(());
        });

        let outcome = wait_for_all_ready(&cluster, &config, &mut rx).await;
        assert_eq!(outcome, ReadinessOutcome::Cancelled);
    }
}
