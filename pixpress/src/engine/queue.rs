//! In-memory job queue.
//!
//! The queue owns admission control, idempotency deduplication, priority
//! ordering and the single [`JobState`] entry of every admitted job. Each
//! operation runs under one lock, so admission and dispatch never observe a
//! half-applied update.

use chrono::Utc;
use parking_lot::Mutex;
use serde_json::Value;
use std::cmp::Reverse;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use tokio::sync::{Notify, watch};
use tracing::debug;
use uuid::Uuid;

use super::job::{
    AddOptions, Job, JobHandle, JobId, JobOutcome, JobState, JobStatePatch, JobStatus,
};
use crate::error::{Error, JobError, Result};

/// Ordering key of a pending job: priority descending, then admission order.
type PendingKey = (Reverse<i32>, u64);

/// Result of a successful `add`.
#[derive(Debug, Clone)]
pub struct AdmittedJob {
    pub job_id: JobId,
    pub handle: JobHandle,
    /// True when an idempotency key matched a live job.
    pub deduplicated: bool,
}

#[derive(Default)]
struct QueueInner {
    pending: BTreeMap<PendingKey, Job>,
    pending_keys: HashMap<JobId, PendingKey>,
    states: HashMap<JobId, JobState>,
    outcomes: HashMap<JobId, watch::Sender<Option<JobOutcome>>>,
    idempotency: HashMap<String, JobId>,
    next_seq: u64,
}

impl QueueInner {
    fn handle(&self, job_id: &str) -> Option<JobHandle> {
        self.outcomes
            .get(job_id)
            .map(|tx| JobHandle::new(job_id.to_string(), tx.subscribe()))
    }

    fn resolve(&self, job_id: &str, outcome: JobOutcome) {
        if let Some(tx) = self.outcomes.get(job_id) {
            tx.send_replace(Some(outcome));
        }
    }

    fn state_mut(&mut self, job_id: &str) -> Result<&mut JobState> {
        self.states
            .get_mut(job_id)
            .ok_or_else(|| Error::not_found("Job", job_id))
    }
}

/// In-memory priority queue with idempotent admission.
pub struct JobQueue {
    capacity: usize,
    inner: Mutex<QueueInner>,
    notify: Arc<Notify>,
}

impl JobQueue {
    /// Create a queue that holds at most `capacity` queued jobs.
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            inner: Mutex::new(QueueInner::default()),
            notify: Arc::new(Notify::new()),
        }
    }

    /// Admit a job.
    ///
    /// A key that maps to a job that is not yet terminal returns that job.
    /// Otherwise the job is admitted unless `capacity` jobs are already
    /// waiting, in which case [`Error::QueueFull`] is returned.
    pub fn add(
        &self,
        task_kind: impl Into<String>,
        payload: Value,
        options: AddOptions,
    ) -> Result<AdmittedJob> {
        let mut inner = self.inner.lock();

        if let Some(key) = options.idempotency_key.as_deref()
            && let Some(existing) = inner.idempotency.get(key)
            && let Some(state) = inner.states.get(existing)
            && !state.status.is_terminal()
            && let Some(handle) = inner.handle(existing)
        {
            debug!(job_id = %existing, "Idempotency key matched a live job");
            return Ok(AdmittedJob {
                job_id: existing.clone(),
                handle,
                deduplicated: true,
            });
        }

        if inner.pending.len() >= self.capacity {
            return Err(Error::QueueFull {
                capacity: self.capacity,
            });
        }

        let job = Job {
            id: Uuid::new_v4().to_string(),
            task_kind: task_kind.into(),
            payload,
            priority: options.priority,
            attempts: 0,
            created_at: Utc::now(),
        };
        let job_id = job.id.clone();
        let key = (Reverse(job.priority), inner.next_seq);
        inner.next_seq += 1;

        let (tx, rx) = watch::channel(None);
        inner.states.insert(job_id.clone(), JobState::queued(&job));
        inner.outcomes.insert(job_id.clone(), tx);
        inner.pending_keys.insert(job_id.clone(), key);
        if let Some(idempotency_key) = options.idempotency_key {
            inner.idempotency.insert(idempotency_key, job_id.clone());
        }
        debug!(job_id = %job_id, task_kind = %job.task_kind, priority = job.priority, "Job admitted");
        inner.pending.insert(key, job);
        drop(inner);

        self.notify.notify_one();

        Ok(AdmittedJob {
            handle: JobHandle::new(job_id.clone(), rx),
            job_id,
            deduplicated: false,
        })
    }

    /// Remove the highest-priority queued job and mark it running for its
    /// next attempt. Never blocks.
    ///
    /// The status change happens under the same lock as the removal, so a
    /// reader sees the job either queued and cancellable or running.
    pub fn take(&self) -> Option<Job> {
        let mut inner = self.inner.lock();
        let (_, mut job) = inner.pending.pop_first()?;
        inner.pending_keys.remove(&job.id);

        job.attempts += 1;
        if let Some(state) = inner.states.get_mut(&job.id) {
            state.status = JobStatus::Running;
            state.started_at = Some(Utc::now());
            state.attempts = job.attempts;
        }
        Some(job)
    }

    /// Current state of a job.
    pub fn get_state(&self, job_id: &str) -> Result<JobState> {
        self.inner
            .lock()
            .states
            .get(job_id)
            .cloned()
            .ok_or_else(|| Error::not_found("Job", job_id))
    }

    /// Merge a partial update into a non-terminal job.
    ///
    /// Terminal statuses are only reachable through `succeed`, `fail` and
    /// `cancel`.
    pub fn set_state(&self, job_id: &str, patch: JobStatePatch) -> Result<()> {
        let mut inner = self.inner.lock();
        let state = inner.state_mut(job_id)?;

        if state.status.is_terminal() {
            return Err(Error::InvalidStateTransition {
                from: state.status.to_string(),
                to: patch.status.unwrap_or(state.status).to_string(),
            });
        }
        if let Some(status) = patch.status {
            if status.is_terminal() {
                return Err(Error::InvalidStateTransition {
                    from: state.status.to_string(),
                    to: status.to_string(),
                });
            }
            state.status = status;
        }
        if let Some(started_at) = patch.started_at {
            state.started_at = Some(started_at);
        }
        if let Some(attempts) = patch.attempts {
            state.attempts = attempts;
        }
        if let Some(progress) = patch.progress {
            state.progress = Some(progress.min(100));
        }
        Ok(())
    }

    /// Record a successful result.
    ///
    /// Returns `false` without changing anything unless the job is running,
    /// so a late result can never overwrite a terminal state.
    pub fn succeed(&self, job_id: &str, result: Value) -> Result<bool> {
        let mut inner = self.inner.lock();
        let state = inner.state_mut(job_id)?;
        if state.status != JobStatus::Running {
            return Ok(false);
        }
        state.status = JobStatus::Succeeded;
        state.finished_at = Some(Utc::now());
        state.result = Some(result.clone());
        inner.resolve(job_id, Ok(result));
        Ok(true)
    }

    /// Record a failure. Same running-only rule as [`JobQueue::succeed`].
    pub fn fail(&self, job_id: &str, error: &JobError) -> Result<bool> {
        let mut inner = self.inner.lock();
        let state = inner.state_mut(job_id)?;
        if state.status != JobStatus::Running {
            return Ok(false);
        }
        state.status = JobStatus::Failed;
        state.finished_at = Some(Utc::now());
        state.error = Some(error.to_string());
        inner.resolve(job_id, Err(error.clone()));
        Ok(true)
    }

    /// Cancel a job that is still queued.
    ///
    /// Returns `false` and changes nothing when the job was already taken
    /// for dispatch or is terminal. The job's handle resolves to
    /// [`JobError::Cancelled`].
    pub fn cancel(&self, job_id: &str) -> Result<bool> {
        let mut inner = self.inner.lock();
        if !inner.states.contains_key(job_id) {
            return Err(Error::not_found("Job", job_id));
        }
        let Some(key) = inner.pending_keys.remove(job_id) else {
            return Ok(false);
        };
        inner.pending.remove(&key);

        let state = inner.state_mut(job_id)?;
        state.status = JobStatus::Cancelled;
        state.finished_at = Some(Utc::now());
        state.error = Some(JobError::Cancelled.to_string());
        inner.resolve(job_id, Err(JobError::Cancelled));
        Ok(true)
    }

    /// Store the latest progress of a running job. Ignored otherwise.
    pub fn record_progress(&self, job_id: &str, percent: u8) -> bool {
        let mut inner = self.inner.lock();
        match inner.states.get_mut(job_id) {
            Some(state) if state.status == JobStatus::Running => {
                state.progress = Some(percent.min(100));
                true
            }
            _ => false,
        }
    }

    /// Handle to the outcome of an admitted job.
    pub fn handle(&self, job_id: &str) -> Option<JobHandle> {
        self.inner.lock().handle(job_id)
    }

    /// Number of queued jobs waiting for dispatch.
    pub fn depth(&self) -> usize {
        self.inner.lock().pending.len()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Signalled once per admission; used to wake the dispatch loop.
    pub fn notifier(&self) -> Arc<Notify> {
        self.notify.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn add(queue: &JobQueue, priority: i32) -> AdmittedJob {
        queue
            .add("png", json!({}), AddOptions::default().with_priority(priority))
            .unwrap()
    }

    #[test]
    fn test_take_orders_by_priority() {
        let queue = JobQueue::new(10);
        add(&queue, 1);
        add(&queue, 5);
        add(&queue, 3);

        let order: Vec<i32> = std::iter::from_fn(|| queue.take())
            .map(|job| job.priority)
            .collect();
        assert_eq!(order, vec![5, 3, 1]);
        assert!(queue.take().is_none());
    }

    #[test]
    fn test_take_marks_job_running() {
        let queue = JobQueue::new(10);
        let admitted = add(&queue, 0);
        assert_eq!(queue.get_state(&admitted.job_id).unwrap().attempts, 0);

        let job = queue.take().unwrap();
        assert_eq!(job.attempts, 1);

        let state = queue.get_state(&admitted.job_id).unwrap();
        assert_eq!(state.status, JobStatus::Running);
        assert_eq!(state.attempts, 1);
        assert!(state.started_at.is_some());
        assert!(!queue.cancel(&admitted.job_id).unwrap());
    }

    #[test]
    fn test_take_keeps_insertion_order_for_ties() {
        let queue = JobQueue::new(10);
        let first = add(&queue, 2).job_id;
        let second = add(&queue, 2).job_id;
        let third = add(&queue, 2).job_id;

        assert_eq!(queue.take().unwrap().id, first);
        assert_eq!(queue.take().unwrap().id, second);
        assert_eq!(queue.take().unwrap().id, third);
    }

    #[test]
    fn test_idempotent_add_returns_same_job() {
        let queue = JobQueue::new(10);
        let opts = AddOptions::default().with_idempotency_key("a.png|png");

        let first = queue.add("png", json!({"n": 1}), opts.clone()).unwrap();
        let second = queue.add("png", json!({"n": 1}), opts).unwrap();

        assert_eq!(first.job_id, second.job_id);
        assert!(!first.deduplicated);
        assert!(second.deduplicated);
        assert_eq!(queue.depth(), 1);
    }

    #[test]
    fn test_idempotent_add_while_running() {
        let queue = JobQueue::new(10);
        let opts = AddOptions::default().with_idempotency_key("k");
        let first = queue.add("png", json!({}), opts.clone()).unwrap();
        queue.take().unwrap();

        let second = queue.add("png", json!({}), opts).unwrap();
        assert_eq!(second.job_id, first.job_id);
        assert_eq!(queue.depth(), 0);
    }

    #[test]
    fn test_idempotency_key_remapped_after_terminal() {
        let queue = JobQueue::new(10);
        let opts = AddOptions::default().with_idempotency_key("k");
        let first = queue.add("png", json!({}), opts.clone()).unwrap();
        assert!(queue.cancel(&first.job_id).unwrap());

        let second = queue.add("png", json!({}), opts.clone()).unwrap();
        assert_ne!(second.job_id, first.job_id);
        assert!(!second.deduplicated);

        let third = queue.add("png", json!({}), opts).unwrap();
        assert_eq!(third.job_id, second.job_id);
    }

    #[test]
    fn test_backpressure_rejects_over_capacity() {
        let queue = JobQueue::new(3);
        let admitted: Vec<_> = (0..3).map(|_| add(&queue, 0).job_id).collect();

        let err = queue.add("png", json!({}), AddOptions::default()).unwrap_err();
        assert!(matches!(err, Error::QueueFull { capacity: 3 }));

        assert_eq!(queue.depth(), 3);
        for id in &admitted {
            assert_eq!(queue.get_state(id).unwrap().status, JobStatus::Queued);
        }
    }

    #[test]
    fn test_dedup_bypasses_capacity_check() {
        let queue = JobQueue::new(1);
        let opts = AddOptions::default().with_idempotency_key("k");
        let first = queue.add("png", json!({}), opts.clone()).unwrap();

        let again = queue.add("png", json!({}), opts).unwrap();
        assert_eq!(again.job_id, first.job_id);
    }

    #[test]
    fn test_taken_jobs_free_capacity() {
        let queue = JobQueue::new(1);
        add(&queue, 0);
        assert!(queue.add("png", json!({}), AddOptions::default()).is_err());
        queue.take().unwrap();
        assert!(queue.add("png", json!({}), AddOptions::default()).is_ok());
    }

    #[tokio::test]
    async fn test_cancel_queued_job() {
        let queue = JobQueue::new(10);
        let admitted = add(&queue, 0);

        assert!(queue.cancel(&admitted.job_id).unwrap());

        let state = queue.get_state(&admitted.job_id).unwrap();
        assert_eq!(state.status, JobStatus::Cancelled);
        assert!(state.finished_at.is_some());
        assert!(queue.take().is_none());
        assert_eq!(admitted.handle.wait().await, Err(JobError::Cancelled));
    }

    #[test]
    fn test_cancel_running_job_is_refused() {
        let queue = JobQueue::new(10);
        let admitted = add(&queue, 0);
        queue.take().unwrap();

        assert!(!queue.cancel(&admitted.job_id).unwrap());
        let state = queue.get_state(&admitted.job_id).unwrap();
        assert_eq!(state.status, JobStatus::Running);
    }

    #[test]
    fn test_cancel_unknown_job() {
        let queue = JobQueue::new(10);
        assert!(matches!(
            queue.cancel("missing"),
            Err(Error::NotFound { .. })
        ));
    }

    #[tokio::test]
    async fn test_succeed_resolves_handle() {
        let queue = JobQueue::new(10);
        let admitted = add(&queue, 0);
        queue.take().unwrap();

        assert!(queue.succeed(&admitted.job_id, json!({"ok": true})).unwrap());

        let state = queue.get_state(&admitted.job_id).unwrap();
        assert_eq!(state.status, JobStatus::Succeeded);
        assert!(state.finished_at.is_some());
        assert_eq!(state.attempts, 1);
        assert_eq!(admitted.handle.wait().await, Ok(json!({"ok": true})));
    }

    #[test]
    fn test_late_result_does_not_resurrect_terminal_job() {
        let queue = JobQueue::new(10);
        let admitted = add(&queue, 0);
        queue.take().unwrap();
        assert!(queue.fail(&admitted.job_id, &JobError::Timeout(5)).unwrap());

        assert!(!queue.succeed(&admitted.job_id, json!({})).unwrap());

        let state = queue.get_state(&admitted.job_id).unwrap();
        assert_eq!(state.status, JobStatus::Failed);
        assert_eq!(state.error.as_deref(), Some("Task timeout after 5 ms"));
        assert!(state.result.is_none());
    }

    #[test]
    fn test_set_state_rejects_terminal_status() {
        let queue = JobQueue::new(10);
        let admitted = add(&queue, 0);
        let patch = JobStatePatch {
            status: Some(JobStatus::Succeeded),
            ..JobStatePatch::default()
        };
        assert!(matches!(
            queue.set_state(&admitted.job_id, patch),
            Err(Error::InvalidStateTransition { .. })
        ));
    }

    #[test]
    fn test_record_progress_only_while_running() {
        let queue = JobQueue::new(10);
        let admitted = add(&queue, 0);
        assert!(!queue.record_progress(&admitted.job_id, 10));

        queue.take().unwrap();
        assert!(queue.record_progress(&admitted.job_id, 40));
        assert_eq!(
            queue.get_state(&admitted.job_id).unwrap().progress,
            Some(40)
        );
    }

    #[test]
    fn test_get_state_unknown() {
        let queue = JobQueue::new(10);
        assert!(queue.get_state("nope").is_err());
    }
}
