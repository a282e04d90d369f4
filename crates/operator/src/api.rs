//! Probe and metrics endpoints
//!
//! `/healthz` is the liveness probe: a watch error only degrades a
//! component, while a stopped watcher or event loop cannot recover without a
//! restart and answers 503. `/readyz` stays 503 until bootstrap has taken
//! the node and configuration snapshot, and names any stopped component.

use axum::{
    extract::State,
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use operator_lib::{
    health::{ComponentStatus, HealthRegistry},
    observability::OperatorMetrics,
};
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

/// State shared by the probe handlers
#[derive(Clone)]
pub struct ApiState {
    pub health_registry: HealthRegistry,
    pub metrics: OperatorMetrics,
}

impl ApiState {
    pub fn new(health_registry: HealthRegistry, metrics: OperatorMetrics) -> Self {
        Self {
            health_registry,
            metrics,
        }
    }
}

fn liveness_status(status: ComponentStatus) -> StatusCode {
    if status.is_operational() {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    }
}

async fn healthz(State(state): State<Arc<ApiState>>) -> impl IntoResponse {
    let health = state.health_registry.health().await;
    (liveness_status(health.status), Json(health))
}

async fn readyz(State(state): State<Arc<ApiState>>) -> impl IntoResponse {
    let readiness = state.health_registry.readiness().await;
    if readiness.ready {
        return (StatusCode::OK, Json(readiness));
    }

    debug!(reason = ?readiness.reason, "Readiness probe failing");
    (StatusCode::SERVICE_UNAVAILABLE, Json(readiness))
}

async fn metrics(State(state): State<Arc<ApiState>>) -> Response {
    match state.metrics.encode() {
        Ok(body) => (
            StatusCode::OK,
            [(header::CONTENT_TYPE, state.metrics.content_type())],
            body,
        )
            .into_response(),
        Err(e) => {
            warn!(error = %e, "Failed to encode metrics");
            (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()).into_response()
        }
    }
}

/// Router serving `/healthz`, `/readyz` and `/metrics`
pub fn create_router(state: Arc<ApiState>) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/readyz", get(readyz))
        .route("/metrics", get(metrics))
        .with_state(state)
}

/// Serve the probes until `shutdown` fires
pub async fn serve(
    port: u16,
    state: Arc<ApiState>,
    mut shutdown: broadcast::Receiver<()>,
) -> anyhow::Result<()> {
    let addr = format!("0.0.0.0:{}", port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    info!(addr = %addr, "Probe server listening");

    axum::serve(listener, create_router(state))
        .with_graceful_shutdown(async move {
            let _ = shutdown.recv().await;
        })
        .await?;

    info!("Probe server stopped");
    Ok(())
}
