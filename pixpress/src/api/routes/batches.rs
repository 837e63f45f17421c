//! Batch routes.
//!
//! A batch is a set of jobs whose terminal events are routed to one
//! subscriber stream. Items are admitted one by one; each accepted job is
//! bound to the batch's `stream_id` together with the caller's `client_id`,
//! and `GET /{stream_id}` delivers `{event, client_id, job_id, result|error}`
//! once per finished job.
//!
//! A stream handler watches both the event bus and bind announcements. A job
//! that finished before it was bound is picked up from its stored state when
//! the announcement arrives.

use std::time::Duration;

use axum::{
    Json, Router,
    extract::{
        Path, State,
        ws::{WebSocket, WebSocketUpgrade},
    },
    response::IntoResponse,
    routing::{get, post},
};
use futures::{SinkExt, StreamExt};
use serde_json::Value;
use tokio::sync::broadcast;
use tokio::time::{Instant, interval_at};
use tracing::{debug, info, warn};

use super::ws::{Flow, HEARTBEAT_INTERVAL_SECS, WsSender, on_client_frame, on_heartbeat, send_json};
use crate::api::error::{ApiError, ApiResult};
use crate::api::models::{
    AcceptedItem, BatchStreamMessage, RejectedItem, SubmitBatchRequest, SubmitBatchResponse,
    terminal_event_from_state,
};
use crate::api::server::AppState;
use crate::engine::{AddOptions, EngineEvent};

/// Create the batches router.
pub fn router() -> Router<AppState> {
    Router::new()
        .route("/", post(submit_batch))
        .route("/{stream_id}", get(batch_stream_ws))
}

/// Idempotency key of a batch item: the task kind plus the canonical JSON of
/// its payload. Object keys serialize sorted, so equal payloads give equal
/// keys regardless of field order.
pub fn batch_idempotency_key(task_kind: &str, payload: &Value) -> crate::Result<String> {
    Ok(format!("{}|{}", task_kind, serde_json::to_string(payload)?))
}

async fn submit_batch(
    State(state): State<AppState>,
    Json(request): Json<SubmitBatchRequest>,
) -> ApiResult<Json<SubmitBatchResponse>> {
    if request.stream_id.trim().is_empty() {
        return Err(ApiError::validation("stream_id must not be empty"));
    }

    let batch_id = uuid::Uuid::new_v4().to_string();
    let mut accepted = Vec::with_capacity(request.items.len());
    let mut rejected = Vec::new();

    for item in request.items {
        let admitted = batch_idempotency_key(&item.task_kind, &item.payload).and_then(|key| {
            state.engine.submit(
                item.task_kind,
                item.payload,
                AddOptions::default()
                    .with_priority(item.priority)
                    .with_idempotency_key(key),
            )
        });

        match admitted {
            Ok(admitted) => {
                state
                    .engine
                    .bindings()
                    .bind(admitted.job_id.clone(), &request.stream_id, &item.client_id);
                accepted.push(AcceptedItem {
                    client_id: item.client_id,
                    job_id: admitted.job_id,
                    deduplicated: admitted.deduplicated,
                });
            }
            Err(e) => {
                let err = ApiError::from(e);
                rejected.push(RejectedItem {
                    client_id: item.client_id,
                    code: err.code,
                    message: err.message,
                });
            }
        }
    }

    info!(
        batch_id = %batch_id,
        stream_id = %request.stream_id,
        accepted = accepted.len(),
        rejected = rejected.len(),
        "Batch submitted"
    );

    Ok(Json(SubmitBatchResponse {
        batch_id,
        accepted,
        rejected,
    }))
}

/// WebSocket stream of a batch's results.
async fn batch_stream_ws(
    ws: WebSocketUpgrade,
    State(state): State<AppState>,
    Path(stream_id): Path<String>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, state, stream_id))
}

async fn handle_socket(socket: WebSocket, state: AppState, stream_id: String) {
    let (mut sender, mut receiver) = socket.split();
    let mut event_rx = state.engine.subscribe();
    let mut bound_rx = state.engine.bindings().subscribe();

    // Jobs that finished before the subscriber connected.
    if sweep_finished(&state, &stream_id, &mut sender).await == Flow::Close {
        state.engine.bindings().clear_stream(&stream_id);
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
                    Ok(event) => {
                        if deliver(&state, &stream_id, event, &mut sender).await == Flow::Close {
                            break;
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        warn!(stream_id = %stream_id, "Batch stream lagged by {} events", n);
                        if sweep_finished(&state, &stream_id, &mut sender).await == Flow::Close {
                            break;
                        }
                    }
                    Err(broadcast::error::RecvError::Closed) => {
                        debug!("Event bus closed");
                        break;
                    }
                }
            }

            bound = bound_rx.recv() => {
                let flow = match bound {
                    Ok(bound) if bound.stream_id == stream_id => {
                        deliver_if_finished(&state, &stream_id, &bound.job_id, &mut sender).await
                    }
                    Ok(_) => Flow::Continue,
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        debug!(stream_id = %stream_id, "Missed {} bind announcements", n);
                        sweep_finished(&state, &stream_id, &mut sender).await
                    }
                    Err(broadcast::error::RecvError::Closed) => Flow::Close,
                };
                if flow == Flow::Close {
                    break;
                }
            }

            _ = heartbeat_interval.tick() => {
                if on_heartbeat(&mut sender, &mut awaiting_pong).await == Flow::Close {
                    break;
                }
                if sweep_finished(&state, &stream_id, &mut sender).await == Flow::Close {
                    break;
                }
            }
        }
    }

    let cleared = state.engine.bindings().clear_stream(&stream_id);
    if cleared > 0 {
        debug!(stream_id = %stream_id, cleared, "Dropped bindings of closed batch stream");
    }
    let _ = sender.close().await;
}

/// Forward a terminal event if its job is bound to this stream.
async fn deliver(
    state: &AppState,
    stream_id: &str,
    event: EngineEvent,
    sender: &mut WsSender,
) -> Flow {
    if event.terminal_kind().is_none() {
        return Flow::Continue;
    }
    let Some(binding) = state
        .engine
        .bindings()
        .take_for_stream(event.job_id(), stream_id)
    else {
        return Flow::Continue;
    };
    match BatchStreamMessage::from_event(event, binding.client_id) {
        Some(message) => send_json(sender, &message).await,
        None => Flow::Continue,
    }
}

/// Deliver a bound job's result if it is already terminal.
async fn deliver_if_finished(
    state: &AppState,
    stream_id: &str,
    job_id: &str,
    sender: &mut WsSender,
) -> Flow {
    match state.engine.get_state(job_id) {
        Ok(job) => match terminal_event_from_state(&job) {
            Some(event) => deliver(state, stream_id, event, sender).await,
            None => Flow::Continue,
        },
        Err(_) => {
            state.engine.bindings().remove(job_id);
            Flow::Continue
        }
    }
}

/// Deliver every bound job that is already terminal.
async fn sweep_finished(state: &AppState, stream_id: &str, sender: &mut WsSender) -> Flow {
    for job_id in state.engine.bindings().jobs_for_stream(stream_id) {
        if deliver_if_finished(state, stream_id, &job_id, sender).await == Flow::Close {
            return Flow::Close;
        }
    }
    Flow::Continue
}
