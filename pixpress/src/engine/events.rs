//! Process-wide event bus for job progress and lifecycle events.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::broadcast;

use super::job::JobId;
use crate::error::JobError;

/// Default broadcast capacity.
pub const EVENT_BUS_CAPACITY: usize = 1024;

/// Lifecycle transition carried by [`EngineEvent::Job`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobEventKind {
    Started,
    Completed,
    Failed,
    Cancelled,
}

impl JobEventKind {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, JobEventKind::Started)
    }
}

/// Event published by the engine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EngineEvent {
    Progress {
        job_id: JobId,
        stage: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        percent: Option<u8>,
    },
    #[serde(rename = "job_event")]
    Job {
        job_id: JobId,
        event: JobEventKind,
        #[serde(skip_serializing_if = "Option::is_none")]
        result: Option<Value>,
        #[serde(skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },
}

impl EngineEvent {
    pub fn progress(job_id: &str, stage: impl Into<String>, percent: Option<u8>) -> Self {
        Self::Progress {
            job_id: job_id.to_string(),
            stage: stage.into(),
            percent,
        }
    }

    pub fn started(job_id: &str) -> Self {
        Self::lifecycle(job_id, JobEventKind::Started, None, None)
    }

    pub fn completed(job_id: &str, result: Value) -> Self {
        Self::lifecycle(job_id, JobEventKind::Completed, Some(result), None)
    }

    pub fn failed(job_id: &str, error: &JobError) -> Self {
        Self::lifecycle(job_id, JobEventKind::Failed, None, Some(error.to_string()))
    }

    pub fn cancelled(job_id: &str) -> Self {
        Self::lifecycle(
            job_id,
            JobEventKind::Cancelled,
            None,
            Some(JobError::Cancelled.to_string()),
        )
    }

    fn lifecycle(
        job_id: &str,
        event: JobEventKind,
        result: Option<Value>,
        error: Option<String>,
    ) -> Self {
        Self::Job {
            job_id: job_id.to_string(),
            event,
            result,
            error,
        }
    }

    pub fn job_id(&self) -> &str {
        match self {
            EngineEvent::Progress { job_id, .. } | EngineEvent::Job { job_id, .. } => job_id,
        }
    }

    /// The lifecycle kind, if this is a terminal event.
    pub fn terminal_kind(&self) -> Option<JobEventKind> {
        match self {
            EngineEvent::Job { event, .. } if event.is_terminal() => Some(*event),
            _ => None,
        }
    }
}

/// Fan-out publisher for [`EngineEvent`]s. Fire-and-forget: events published
/// without subscribers are dropped.
#[derive(Debug, Clone)]
pub struct EventBus {
    tx: broadcast::Sender<EngineEvent>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx }
    }

    /// Publish an event; returns the number of receivers.
    pub fn publish(&self, event: EngineEvent) -> usize {
        self.tx.send(event).unwrap_or(0)
    }

    pub fn subscribe(&self) -> broadcast::Receiver<EngineEvent> {
        self.tx.subscribe()
    }

    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(EVENT_BUS_CAPACITY)
    }
}
