//! Dispatch loop.
//!
//! One control loop pulls admitted jobs in priority order and hands each to
//! a spawned execution task. The loop reserves a unit slot before it takes a
//! job, so waiting jobs stay queued (and cancellable) until the pool can
//! actually run them. The loop itself never does CPU-bound work.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, warn};

use super::events::{EngineEvent, EventBus};
use super::job::{Job, JobStatePatch};
use super::pool::ExecutionPool;
use super::queue::JobQueue;
use crate::config::RetryPolicy;
use crate::error::JobError;

/// Drives jobs from the queue through the execution pool.
pub struct Scheduler {
    queue: Arc<JobQueue>,
    pool: Arc<ExecutionPool>,
    events: EventBus,
    retry: RetryPolicy,
    permits: Arc<Semaphore>,
    cancel: CancellationToken,
    tracker: TaskTracker,
    started: AtomicBool,
}

impl Scheduler {
    pub fn new(
        queue: Arc<JobQueue>,
        pool: Arc<ExecutionPool>,
        events: EventBus,
        retry: RetryPolicy,
    ) -> Self {
        let permits = Arc::new(Semaphore::new(pool.size()));
        Self {
            queue,
            pool,
            events,
            retry,
            permits,
            cancel: CancellationToken::new(),
            tracker: TaskTracker::new(),
            started: AtomicBool::new(false),
        }
    }

    /// Start the dispatch loop. Returns `false` if it was already started.
    pub fn start(self: &Arc<Self>) -> bool {
        if self.started.swap(true, Ordering::SeqCst) {
            return false;
        }
        let this = self.clone();
        self.tracker.spawn(async move { this.run_loop().await });
        info!(
            "Scheduler started with {} dispatch slots",
            self.pool.size()
        );
        true
    }

    async fn run_loop(self: Arc<Self>) {
        let notify = self.queue.notifier();
        loop {
            let permit = tokio::select! {
                _ = self.cancel.cancelled() => break,
                permit = self.permits.clone().acquire_owned() => match permit {
                    Ok(permit) => permit,
                    Err(_) => break,
                },
            };

            let job = loop {
                if let Some(job) = self.queue.take() {
                    break Some(job);
                }
                tokio::select! {
                    _ = self.cancel.cancelled() => break None,
                    _ = notify.notified() => {}
                }
            };
            let Some(job) = job else { break };

            self.dispatch(job, permit);
        }
        debug!("Scheduler loop stopped");
    }

    /// `job` was already marked running by `take`.
    fn dispatch(self: &Arc<Self>, job: Job, permit: OwnedSemaphorePermit) {
        self.events.publish(EngineEvent::started(&job.id));
        info!("Started job {} of type {}", job.id, job.task_kind);

        let this = self.clone();
        self.tracker.spawn(async move {
            this.execute(job).await;
            drop(permit);
        });
    }

    /// Run a job until it succeeds or the retry policy gives up.
    async fn execute(&self, mut job: Job) {
        loop {
            let outcome = self
                .pool
                .run(&job.id, &job.task_kind, job.payload.clone())
                .await;

            let err = match outcome {
                Ok(result) => {
                    if let Ok(true) = self.queue.succeed(&job.id, result.clone()) {
                        self.events.publish(EngineEvent::completed(&job.id, result));
                        info!(job_id = %job.id, attempts = job.attempts, "Job completed");
                    }
                    return;
                }
                Err(err) => err,
            };

            if err.is_retryable() && self.retry.should_retry(job.attempts) {
                let delay = self.retry.backoff_for(job.attempts);
                warn!(
                    job_id = %job.id,
                    attempt = job.attempts,
                    delay_ms = delay.as_millis() as u64,
                    error = %err,
                    "Job attempt failed; retrying"
                );
                let stopped = tokio::select! {
                    _ = self.cancel.cancelled() => true,
                    _ = tokio::time::sleep(delay) => false,
                };
                if !stopped {
                    job.attempts += 1;
                    if let Err(e) = self
                        .queue
                        .set_state(&job.id, JobStatePatch::attempts(job.attempts))
                    {
                        error!(job_id = %job.id, error = %e, "Failed to record attempt");
                    }
                    continue;
                }
                self.finish_failed(&job, &JobError::PoolClosed);
                return;
            }

            self.finish_failed(&job, &err);
            return;
        }
    }

    fn finish_failed(&self, job: &Job, err: &JobError) {
        if let Ok(true) = self.queue.fail(&job.id, err) {
            self.events.publish(EngineEvent::failed(&job.id, err));
            warn!(job_id = %job.id, attempts = job.attempts, error = %err, "Job failed");
        }
    }

    /// Stop dispatching. Jobs still queued stay queued.
    pub fn stop(&self) {
        self.cancel.cancel();
        self.permits.close();
        self.tracker.close();
    }

    /// Wait for the loop and every in-flight execution to finish.
    pub async fn wait(&self) {
        self.tracker.close();
        self.tracker.wait().await;
    }

    /// Executions currently holding a unit slot.
    pub fn in_flight(&self) -> usize {
        self.pool
            .size()
            .saturating_sub(self.permits.available_permits())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::{Codec, CodecError, CodecRegistry, ProgressFn, ProgressStage};
    use crate::engine::job::{AddOptions, JobStatus};
    use crate::engine::pool::{PoolConfig, ThreadSpawner};
    use serde_json::{Value, json};
    use std::sync::atomic::AtomicU32;
    use std::time::Duration;

    /// Fails until it has been called `succeed_on` times.
    struct Flaky {
        calls: AtomicU32,
        succeed_on: u32,
    }

    impl Codec for Flaky {
        fn kind(&self) -> &str {
            "flaky"
        }

        fn execute(
            &self,
            _payload: &Value,
            progress: &mut ProgressFn<'_>,
        ) -> Result<Value, CodecError> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
            progress(ProgressStage::Processing, Some(50));
            if call < self.succeed_on {
                Err(CodecError::Failed(format!("attempt {call} failed")))
            } else {
                Ok(json!({ "call": call }))
            }
        }
    }

    struct Harness {
        queue: Arc<JobQueue>,
        events: EventBus,
        scheduler: Arc<Scheduler>,
    }

    fn harness(succeed_on: u32, retry: RetryPolicy) -> Harness {
        let mut registry = CodecRegistry::new();
        registry.register(Arc::new(Flaky {
            calls: AtomicU32::new(0),
            succeed_on,
        }));
        let events = EventBus::default();
        let pool = ExecutionPool::start(
            PoolConfig {
                size: 1,
                job_timeout: Duration::from_secs(5),
            },
            Arc::new(ThreadSpawner::new(Arc::new(registry))),
            events.clone(),
        )
        .unwrap();
        let queue = Arc::new(JobQueue::new(16));
        let scheduler = Arc::new(Scheduler::new(
            queue.clone(),
            Arc::new(pool),
            events.clone(),
            retry,
        ));
        Harness {
            queue,
            events,
            scheduler,
        }
    }

    fn fast_retry(max_attempts: u32) -> RetryPolicy {
        RetryPolicy {
            enable: true,
            max_attempts,
            backoff_initial_ms: 5,
            backoff_max_ms: 20,
        }
    }

    #[tokio::test]
    async fn test_retry_until_success() {
        let h = harness(3, fast_retry(3));
        h.scheduler.start();

        let admitted = h.queue.add("flaky", json!({}), AddOptions::default()).unwrap();
        let outcome = admitted.handle.wait().await;

        assert_eq!(outcome, Ok(json!({ "call": 3 })));
        let state = h.queue.get_state(&admitted.job_id).unwrap();
        assert_eq!(state.status, JobStatus::Succeeded);
        assert_eq!(state.attempts, 3);
    }

    #[tokio::test]
    async fn test_retry_exhausted() {
        let h = harness(3, fast_retry(2));
        h.scheduler.start();

        let admitted = h.queue.add("flaky", json!({}), AddOptions::default()).unwrap();
        let outcome = admitted.handle.wait().await;

        assert_eq!(
            outcome,
            Err(JobError::Execution("attempt 2 failed".into()))
        );
        let state = h.queue.get_state(&admitted.job_id).unwrap();
        assert_eq!(state.status, JobStatus::Failed);
        assert_eq!(state.attempts, 2);
        assert_eq!(state.error.as_deref(), Some("attempt 2 failed"));
    }

    #[tokio::test]
    async fn test_retry_disabled_fails_first_time() {
        let h = harness(2, RetryPolicy::disabled());
        h.scheduler.start();

        let admitted = h.queue.add("flaky", json!({}), AddOptions::default()).unwrap();
        assert!(admitted.handle.wait().await.is_err());
        assert_eq!(h.queue.get_state(&admitted.job_id).unwrap().attempts, 1);
    }

    #[tokio::test]
    async fn test_event_order_for_one_job() {
        let h = harness(2, fast_retry(3));
        let mut rx = h.events.subscribe();
        h.scheduler.start();

        let admitted = h.queue.add("flaky", json!({}), AddOptions::default()).unwrap();

        let mut events = Vec::new();
        tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                let event = rx.recv().await.unwrap();
                if event.job_id() != admitted.job_id {
                    continue;
                }
                let terminal = event.terminal_kind().is_some();
                events.push(event);
                if terminal {
                    break;
                }
            }
        })
        .await
        .expect("terminal event");

        assert_eq!(events.first(), Some(&EngineEvent::started(&admitted.job_id)));
        assert_eq!(
            events.last().and_then(|e| e.terminal_kind()),
            Some(crate::engine::events::JobEventKind::Completed)
        );
        let progress = events
            .iter()
            .filter(|e| matches!(e, EngineEvent::Progress { .. }))
            .count();
        assert!(progress >= 1);

        // Nothing else arrives for the job after its terminal event.
        tokio::time::sleep(Duration::from_millis(50)).await;
        while let Ok(event) = rx.try_recv() {
            assert_ne!(event.job_id(), admitted.job_id);
        }
    }

    #[tokio::test]
    async fn test_backlog_stays_queued_and_cancellable() {
        let h = harness(1, RetryPolicy::disabled());

        let first = h.queue.add("flaky", json!({}), AddOptions::default()).unwrap();
        let second = h.queue.add("flaky", json!({}), AddOptions::default()).unwrap();
        let third = h.queue.add("flaky", json!({}), AddOptions::default()).unwrap();
        assert!(h.queue.cancel(&third.job_id).unwrap());

        h.scheduler.start();
        assert!(first.handle.wait().await.is_ok());
        assert!(second.handle.wait().await.is_ok());
        assert_eq!(third.handle.wait().await, Err(JobError::Cancelled));
        assert_eq!(
            h.queue.get_state(&third.job_id).unwrap().status,
            JobStatus::Cancelled
        );
    }

    #[tokio::test]
    async fn test_start_is_idempotent_and_stop_waits() {
        let h = harness(1, RetryPolicy::disabled());
        assert!(h.scheduler.start());
        assert!(!h.scheduler.start());

        h.scheduler.stop();
        tokio::time::timeout(Duration::from_secs(2), h.scheduler.wait())
            .await
            .expect("scheduler should stop");

        let admitted = h.queue.add("flaky", json!({}), AddOptions::default()).unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(
            h.queue.get_state(&admitted.job_id).unwrap().status,
            JobStatus::Queued
        );
    }
}
