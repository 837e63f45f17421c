//! HTTP and WebSocket API.
//!
//! Exposes job submission, state queries, cancellation, batch submission and
//! per-job / per-batch result streams over the engine.

pub mod error;
pub mod models;
pub mod routes;
pub mod server;

pub use server::{ApiServer, ApiServerConfig, AppState};
