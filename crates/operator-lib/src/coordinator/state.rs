//! Shared cluster state
//!
//! All reads and writes go through methods that hold the lock for the whole
//! read-modify-write.

use tokio::sync::Mutex;
use tracing::warn;

/// Point-in-time copy of the cluster state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ClusterSnapshot {
    pub node_count: i64,
    pub config_stale: bool,
}

#[derive(Debug)]
struct Inner {
    node_count: i64,
    config_stale: bool,
}

/// Node count and configuration staleness, guarded by one async mutex
#[derive(Debug)]
pub struct ClusterState {
    inner: Mutex<Inner>,
}

impl ClusterState {
    /// Configuration starts stale so the first pass fetches it
    pub fn new(node_count: i64) -> Self {
        Self {
            inner: Mutex::new(Inner {
                node_count: node_count.max(0),
                config_stale: true,
            }),
        }
    }

    /// Returns the new node count
    pub async fn node_joined(&self) -> i64 {
        let mut inner = self.inner.lock().await;
        inner.node_count = inner.node_count.saturating_add(1);
        inner.node_count
    }

    /// Returns the new node count, never below zero
    pub async fn node_left(&self) -> i64 {
        let mut inner = self.inner.lock().await;
        if inner.node_count == 0 {
            warn!("Node removal observed with node count already zero");
        } else {
            inner.node_count -= 1;
        }
        inner.node_count
    }

    pub async fn node_count(&self) -> i64 {
        self.inner.lock().await.node_count
    }

    pub async fn mark_config_stale(&self) {
        self.inner.lock().await.config_stale = true;
    }

    /// Clear the stale flag, returning whether it was set
    pub async fn take_config_stale(&self) -> bool {
        std::mem::replace(&mut self.inner.lock().await.config_stale, false)
    }

    pub async fn snapshot(&self) -> ClusterSnapshot {
        let inner = self.inner.lock().await;
        ClusterSnapshot {
            node_count: inner.node_count,
            config_stale: inner.config_stale,
        }
    }
}
