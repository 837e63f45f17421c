//! API route modules.
//!
//! Organizes routes by resource type.

pub mod batches;
pub mod health;
pub mod jobs;
pub mod logging;
mod ws;

use axum::{Router, routing::get};

use crate::api::server::AppState;

/// Create the main API router with all routes.
pub fn create_router(state: AppState) -> Router {
    Router::new()
        .nest("/api/jobs", jobs::router())
        .nest("/api/batches", batches::router())
        .nest("/api/logging", logging::router())
        .nest("/health", health::router())
        .route("/ping", get(|| async { "pong" }))
        .with_state(state)
}
