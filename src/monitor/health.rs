//! Health endpoint for external consumption.

use std::sync::Arc;

use axum::{Json, Router, extract::State, routing::get};
use serde::Serialize;

use crate::scheduler::MemScheduler;

/// Snapshot returned by `GET /health`.
#[derive(Debug, Clone, Serialize)]
pub struct HealthSnapshot {
    /// Lifecycle state: stopped / starting / running / stopping.
    pub state: String,
    /// True while the queue backend is unreachable.
    pub degraded: bool,
    /// Messages waiting for delivery.
    pub queued: usize,
    /// Tasks currently owned by workers.
    pub running: usize,
    pub dead_lettered: u64,
    pub succeeded: u64,
    pub failed: u64,
    /// Workers with a stale heartbeat.
    pub stale_workers: usize,
}

/// Build the axum router exposing the health surface.
pub fn health_routes(scheduler: Arc<MemScheduler>) -> Router {
    Router::new()
        .route("/health", get(health))
        .with_state(scheduler)
}

async fn health(State(scheduler): State<Arc<MemScheduler>>) -> Json<HealthSnapshot> {
    Json(scheduler.health().await)
}
