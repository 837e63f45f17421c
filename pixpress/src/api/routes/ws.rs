//! Shared WebSocket plumbing for the job and batch streams.

use axum::body::Bytes;
use axum::extract::ws::{Message, WebSocket};
use futures::SinkExt;
use futures::stream::SplitSink;
use serde::Serialize;
use tracing::debug;

/// Heartbeat ping interval in seconds.
pub(super) const HEARTBEAT_INTERVAL_SECS: u64 = 30;

pub(super) type WsSender = SplitSink<WebSocket, Message>;

/// Whether the connection loop keeps going after a client frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(super) enum Flow {
    Continue,
    Close,
}

/// Send `value` as a JSON text frame.
pub(super) async fn send_json<T: Serialize>(sender: &mut WsSender, value: &T) -> Flow {
    let text = match serde_json::to_string(value) {
        Ok(text) => text,
        Err(e) => {
            debug!("Failed to serialize stream message: {}", e);
            return Flow::Continue;
        }
    };
    match sender.send(Message::Text(text.into())).await {
        Ok(()) => Flow::Continue,
        Err(e) => {
            debug!("Failed to send message, client disconnected: {}", e);
            Flow::Close
        }
    }
}

/// React to a frame from the client. The streams are push-only, so only
/// control frames matter.
pub(super) async fn on_client_frame(
    msg: Option<Result<Message, axum::Error>>,
    sender: &mut WsSender,
    awaiting_pong: &mut bool,
) -> Flow {
    match msg {
        Some(Ok(Message::Close(_))) | None => Flow::Close,
        Some(Ok(Message::Ping(data))) => {
            if sender.send(Message::Pong(data)).await.is_err() {
                Flow::Close
            } else {
                Flow::Continue
            }
        }
        Some(Ok(Message::Pong(_))) => {
            *awaiting_pong = false;
            Flow::Continue
        }
        Some(Err(e)) => {
            debug!("WebSocket error: {}", e);
            Flow::Close
        }
        Some(Ok(_)) => Flow::Continue,
    }
}

/// Heartbeat tick: close if the previous ping went unanswered, else ping.
pub(super) async fn on_heartbeat(sender: &mut WsSender, awaiting_pong: &mut bool) -> Flow {
    if *awaiting_pong {
        debug!("Client failed to respond to Ping, closing connection");
        return Flow::Close;
    }
    if sender.send(Message::Ping(Bytes::new())).await.is_ok() {
        *awaiting_pong = true;
        Flow::Continue
    } else {
        debug!("Failed to send Ping, closing connection");
        Flow::Close
    }
}
