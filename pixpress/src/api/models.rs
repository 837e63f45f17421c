//! API request and response DTOs.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::engine::{EngineEvent, JobEventKind, JobId, JobState, JobStatus};

// ============================================================================
// Jobs
// ============================================================================

/// Request body for `POST /api/jobs`.
#[derive(Debug, Clone, Deserialize)]
pub struct SubmitJobRequest {
    pub task_kind: String,
    #[serde(default)]
    pub payload: Value,
    /// Higher runs first.
    #[serde(default)]
    pub priority: i32,
    pub idempotency_key: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubmitJobResponse {
    pub job_id: JobId,
    /// True when the request joined an existing pending or running job.
    pub deduplicated: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CancelJobResponse {
    pub status: JobStatus,
    pub job_id: JobId,
}

/// Build the terminal stream event for a job that already finished.
pub fn terminal_event_from_state(state: &JobState) -> Option<EngineEvent> {
    let event = match state.status {
        JobStatus::Succeeded => JobEventKind::Completed,
        JobStatus::Failed => JobEventKind::Failed,
        JobStatus::Cancelled => JobEventKind::Cancelled,
        JobStatus::Queued | JobStatus::Running => return None,
    };
    Some(EngineEvent::Job {
        job_id: state.id.clone(),
        event,
        result: state.result.clone(),
        error: state.error.clone(),
    })
}

// ============================================================================
// Batches
// ============================================================================

/// One file of a batch.
#[derive(Debug, Clone, Deserialize)]
pub struct BatchItem {
    /// Caller-chosen id echoed back on the batch stream.
    pub client_id: String,
    pub task_kind: String,
    #[serde(default)]
    pub payload: Value,
    #[serde(default)]
    pub priority: i32,
}

/// Request body for `POST /api/batches`.
#[derive(Debug, Clone, Deserialize)]
pub struct SubmitBatchRequest {
    pub stream_id: String,
    pub items: Vec<BatchItem>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AcceptedItem {
    pub client_id: String,
    pub job_id: JobId,
    pub deduplicated: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RejectedItem {
    pub client_id: String,
    pub code: String,
    pub message: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubmitBatchResponse {
    pub batch_id: String,
    pub accepted: Vec<AcceptedItem>,
    pub rejected: Vec<RejectedItem>,
}

/// Message pushed on a batch stream when a bound job finishes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BatchStreamMessage {
    pub event: JobEventKind,
    pub client_id: String,
    pub job_id: JobId,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl BatchStreamMessage {
    /// Pair a terminal event with the client id it was bound to.
    pub fn from_event(event: EngineEvent, client_id: String) -> Option<Self> {
        match event {
            EngineEvent::Job {
                job_id,
                event,
                result,
                error,
            } if event.is_terminal() => Some(Self {
                event,
                client_id,
                job_id,
                result,
                error,
            }),
            _ => None,
        }
    }
}

// ============================================================================
// Health
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueHealth {
    pub queued: usize,
    pub capacity: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PoolHealth {
    pub kind: String,
    pub size: usize,
    pub live: usize,
    pub idle: usize,
    pub running: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: String,
    pub version: String,
    pub uptime_secs: u64,
    pub queue: QueueHealth,
    pub pool: PoolHealth,
}

// ============================================================================
// Logging
// ============================================================================

#[derive(Debug, Clone, Deserialize)]
pub struct UpdateLogFilterRequest {
    pub filter: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogFilterResponse {
    pub filter: String,
}
