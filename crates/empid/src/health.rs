//! Daemon status endpoints.
//!
//! `/healthz` reports the worker's identity and whether a matching job is
//! currently in flight; `/metrics` exposes the Prometheus registry. There is
//! no separate readiness probe: the worker polls for jobs as soon as it is
//! connected, so liveness and readiness coincide.

use std::sync::Arc;

use axum::{extract::State, routing::get, Json, Router};
use serde::Serialize;

use crate::metrics::MatcherMetrics;

/// State behind the status endpoints.
pub struct DaemonStatus {
    pub worker_id: String,
    pub metrics: MatcherMetrics,
}

#[derive(Serialize)]
struct HealthReport {
    status: &'static str,
    worker_id: String,
    job_in_flight: bool,
}

pub fn status_router(status: Arc<DaemonStatus>) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/metrics", get(metrics))
        .with_state(status)
}

async fn healthz(State(status): State<Arc<DaemonStatus>>) -> Json<HealthReport> {
    Json(HealthReport {
        status: "ok",
        worker_id: status.worker_id.clone(),
        job_in_flight: status.metrics.active_job.get() > 0,
    })
}

async fn metrics(State(status): State<Arc<DaemonStatus>>) -> String {
    status.metrics.encode()
}
