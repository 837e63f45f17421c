//! Job records, observable job state and result handles.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use tokio::sync::watch;

use crate::error::JobError;

/// Opaque job identifier (UUID v4 string).
pub type JobId = String;

/// Outcome a job handle resolves to.
pub type JobOutcome = std::result::Result<Value, JobError>;

/// Immutable description of one unit of work.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    pub id: JobId,
    /// Selects the codec that runs the payload.
    pub task_kind: String,
    /// Task-specific payload, opaque to the scheduler.
    pub payload: Value,
    /// Higher values are dispatched first.
    pub priority: i32,
    /// Execution attempts so far.
    pub attempts: u32,
    pub created_at: DateTime<Utc>,
}

/// Job lifecycle status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Queued,
    Running,
    Succeeded,
    Failed,
    Cancelled,
}

impl JobStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobStatus::Succeeded | JobStatus::Failed | JobStatus::Cancelled
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Queued => "queued",
            JobStatus::Running => "running",
            JobStatus::Succeeded => "succeeded",
            JobStatus::Failed => "failed",
            JobStatus::Cancelled => "cancelled",
        }
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Externally observable projection of a job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobState {
    pub id: JobId,
    pub task_kind: String,
    pub status: JobStatus,
    pub priority: i32,
    pub queued_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<DateTime<Utc>>,
    pub attempts: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Last reported progress, 0-100.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub progress: Option<u8>,
}

impl JobState {
    pub(crate) fn queued(job: &Job) -> Self {
        Self {
            id: job.id.clone(),
            task_kind: job.task_kind.clone(),
            status: JobStatus::Queued,
            priority: job.priority,
            queued_at: job.created_at,
            started_at: None,
            finished_at: None,
            attempts: 0,
            result: None,
            error: None,
            progress: None,
        }
    }
}

/// Partial update merged into a [`JobState`] by `JobQueue::set_state`.
#[derive(Debug, Clone, Default)]
pub struct JobStatePatch {
    pub status: Option<JobStatus>,
    pub started_at: Option<DateTime<Utc>>,
    pub attempts: Option<u32>,
    pub progress: Option<u8>,
}

impl JobStatePatch {
    pub fn attempts(attempts: u32) -> Self {
        Self {
            attempts: Some(attempts),
            ..Self::default()
        }
    }
}

/// Options accepted by `JobQueue::add`.
#[derive(Debug, Clone, Default)]
pub struct AddOptions {
    pub priority: i32,
    pub idempotency_key: Option<String>,
}

impl AddOptions {
    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_idempotency_key(mut self, key: impl Into<String>) -> Self {
        self.idempotency_key = Some(key.into());
        self
    }
}

/// Awaitable handle to a job's final outcome.
///
/// Handles are cheap to clone; every clone observes the same outcome. An
/// idempotent resubmission receives a handle to the existing job.
#[derive(Debug, Clone)]
pub struct JobHandle {
    job_id: JobId,
    rx: watch::Receiver<Option<JobOutcome>>,
}

impl JobHandle {
    pub(crate) fn new(job_id: JobId, rx: watch::Receiver<Option<JobOutcome>>) -> Self {
        Self { job_id, rx }
    }

    pub fn job_id(&self) -> &str {
        &self.job_id
    }

    /// The outcome, if the job already reached a terminal state.
    pub fn outcome(&self) -> Option<JobOutcome> {
        self.rx.borrow().clone()
    }

    /// Wait until the job reaches a terminal state.
    pub async fn wait(mut self) -> JobOutcome {
        match self.rx.wait_for(Option::is_some).await {
            Ok(outcome) => outcome.clone().unwrap_or(Err(JobError::PoolClosed)),
            // The queue was dropped before the job finished.
            Err(_) => Err(JobError::PoolClosed),
        }
    }
}
