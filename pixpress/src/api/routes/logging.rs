//! Logging API routes.
//!
//! `GET /` returns the active filter directive; `PUT /` replaces it at
//! runtime.

use axum::{Json, Router, extract::State, routing::get};

use crate::api::error::{ApiError, ApiResult};
use crate::api::models::{LogFilterResponse, UpdateLogFilterRequest};
use crate::api::server::AppState;
use crate::logging::LoggingConfig;

/// Create the logging router.
pub fn router() -> Router<AppState> {
    Router::new().route("/", get(get_log_filter).put(update_log_filter))
}

fn logging_config(state: &AppState) -> ApiResult<&LoggingConfig> {
    state
        .logging_config
        .as_deref()
        .ok_or_else(|| ApiError::service_unavailable("Logging configuration not available"))
}

async fn get_log_filter(State(state): State<AppState>) -> ApiResult<Json<LogFilterResponse>> {
    let config = logging_config(&state)?;
    Ok(Json(LogFilterResponse {
        filter: config.get_filter(),
    }))
}

async fn update_log_filter(
    State(state): State<AppState>,
    Json(request): Json<UpdateLogFilterRequest>,
) -> ApiResult<Json<LogFilterResponse>> {
    let config = logging_config(&state)?;
    config
        .set_filter(&request.filter)
        .map_err(|e| ApiError::bad_request(e.to_string()))?;

    Ok(Json(LogFilterResponse {
        filter: config.get_filter(),
    }))
}
