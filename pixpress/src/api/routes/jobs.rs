//! Job routes.
//!
//! - `POST /` admits a job
//! - `GET /{id}` returns its state
//! - `POST /{id}/cancel` cancels it while still queued
//! - `GET /{id}/stream` streams its progress and lifecycle events over a
//!   WebSocket, closing after the terminal event

use std::time::Duration;

use axum::{
    Json, Router,
    extract::{
        Path, State,
        ws::{WebSocket, WebSocketUpgrade},
    },
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
};
use futures::{SinkExt, StreamExt};
use tokio::sync::broadcast;
use tokio::time::{Instant, interval_at};
use tracing::{debug, warn};

use super::ws::{Flow, HEARTBEAT_INTERVAL_SECS, WsSender, on_client_frame, on_heartbeat, send_json};
use crate::api::error::{ApiError, ApiResult};
use crate::api::models::{
    CancelJobResponse, SubmitJobRequest, SubmitJobResponse, terminal_event_from_state,
};
use crate::api::server::AppState;
use crate::engine::{AddOptions, JobState, JobStatus};

/// Create the jobs router.
pub fn router() -> Router<AppState> {
    Router::new()
        .route("/", post(submit_job))
        .route("/{id}", get(get_job))
        .route("/{id}/cancel", post(cancel_job))
        .route("/{id}/stream", get(job_stream_ws))
}

async fn submit_job(
    State(state): State<AppState>,
    Json(request): Json<SubmitJobRequest>,
) -> ApiResult<(StatusCode, Json<SubmitJobResponse>)> {
    let mut options = AddOptions::default().with_priority(request.priority);
    if let Some(key) = request.idempotency_key.filter(|k| !k.is_empty()) {
        options = options.with_idempotency_key(key);
    }

    let admitted = state
        .engine
        .submit(request.task_kind, request.payload, options)?;

    Ok((
        StatusCode::CREATED,
        Json(SubmitJobResponse {
            job_id: admitted.job_id,
            deduplicated: admitted.deduplicated,
        }),
    ))
}

async fn get_job(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<Json<JobState>> {
    Ok(Json(state.engine.get_state(&id)?))
}

async fn cancel_job(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<Json<CancelJobResponse>> {
    state.engine.cancel(&id)?;
    Ok(Json(CancelJobResponse {
        status: JobStatus::Cancelled,
        job_id: id,
    }))
}

/// WebSocket stream of one job's events.
///
/// Unknown jobs are rejected with 404 before the upgrade. Each engine event
/// for the job is sent as a JSON text frame; the socket is closed after the
/// terminal event. A job that already finished gets its terminal event
/// immediately.
async fn job_stream_ws(
    ws: WebSocketUpgrade,
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    state.engine.get_state(&id)?;
    Ok(ws.on_upgrade(move |socket| handle_socket(socket, state, id)))
}

async fn handle_socket(socket: WebSocket, state: AppState, job_id: String) {
    let (mut sender, mut receiver) = socket.split();

    // Subscribe before reading the state so no terminal event slips between.
    let mut event_rx = state.engine.subscribe();
    if send_if_finished(&state, &job_id, &mut sender).await {
        let _ = sender.close().await;
        return;
    }

    let period = Duration::from_secs(HEARTBEAT_INTERVAL_SECS);
    let mut heartbeat_interval = interval_at(Instant::now() + period, period);
    let mut awaiting_pong = false;

    loop {
        tokio::select! {
            msg = receiver.next() => {
                if on_client_frame(msg, &mut sender, &mut awaiting_pong).await == Flow::Close {
                    break;
                }
            }

            event = event_rx.recv() => {
                match event {
                    Ok(event) if event.job_id() == job_id => {
                        let terminal = event.terminal_kind().is_some();
                        if send_json(&mut sender, &event).await == Flow::Close || terminal {
                            break;
                        }
                    }
                    Ok(_) => {}
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        warn!(job_id = %job_id, "Job stream lagged by {} events", n);
                        // The terminal event may have been among the dropped ones.
                        if send_if_finished(&state, &job_id, &mut sender).await {
                            break;
                        }
                    }
                    Err(broadcast::error::RecvError::Closed) => {
                        debug!("Event bus closed");
                        break;
                    }
                }
            }

            _ = heartbeat_interval.tick() => {
                if on_heartbeat(&mut sender, &mut awaiting_pong).await == Flow::Close {
                    break;
                }
            }
        }
    }

    let _ = sender.close().await;
}

/// Send the terminal event if the job already finished (or vanished).
/// Returns true when the stream should end.
async fn send_if_finished(state: &AppState, job_id: &str, sender: &mut WsSender) -> bool {
    match state.engine.get_state(job_id) {
        Ok(job) => match terminal_event_from_state(&job) {
            Some(event) => {
                let _ = send_json(sender, &event).await;
                true
            }
            None => false,
        },
        Err(_) => true,
    }
}
