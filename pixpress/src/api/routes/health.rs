//! Health check routes.

use axum::{Json, Router, extract::State, routing::get};

use crate::api::models::{HealthResponse, PoolHealth, QueueHealth};
use crate::api::server::AppState;

/// Create the health router.
pub fn router() -> Router<AppState> {
    Router::new().route("/", get(health_check))
}

/// Health check endpoint.
async fn health_check(State(state): State<AppState>) -> Json<HealthResponse> {
    let engine = &state.engine;
    let queue = engine.queue();
    let pool = engine.pool();

    let status = if pool.is_closed() { "closed" } else { "ok" };

    Json(HealthResponse {
        status: status.to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        uptime_secs: state.start_time.elapsed().as_secs(),
        queue: QueueHealth {
            queued: queue.depth(),
            capacity: queue.capacity(),
        },
        pool: PoolHealth {
            kind: pool.kind().to_string(),
            size: pool.size(),
            live: pool.live_count(),
            idle: pool.idle_count(),
            running: pool.running_count(),
        },
    })
}
