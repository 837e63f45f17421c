//! Job admission, scheduling and execution.
//!
//! [`Engine`] composes the pieces:
//! - [`JobQueue`]: admission, deduplication, priority order, job state
//! - [`Scheduler`]: dispatch loop with retry and backoff
//! - [`ExecutionPool`]: fixed-size set of thread or process units
//! - [`EventBus`]: progress and lifecycle events
//! - [`BindingRegistry`]: job-to-stream routing for the transport layer

pub mod bindings;
pub mod events;
pub mod job;
pub mod pool;
pub mod queue;
pub mod scheduler;

pub use bindings::{Binding, BindingRegistry, BoundJob};
pub use events::{EngineEvent, EventBus, JobEventKind};
pub use job::{AddOptions, Job, JobHandle, JobId, JobOutcome, JobState, JobStatus};
pub use pool::{
    ExecutionPool, PoolConfig, ProcessSpawner, ProcessUnitCommand, ThreadSpawner, UnitSpawner,
};
pub use queue::{AdmittedJob, JobQueue};
pub use scheduler::Scheduler;

use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::codec::CodecRegistry;
use crate::config::{EngineConfig, PoolKind};
use crate::error::{Error, Result};

/// The running job engine.
pub struct Engine {
    config: EngineConfig,
    queue: Arc<JobQueue>,
    pool: Arc<ExecutionPool>,
    scheduler: Arc<Scheduler>,
    events: EventBus,
    bindings: Arc<BindingRegistry>,
    cancel: CancellationToken,
}

impl Engine {
    /// Start an engine whose units run codecs from `registry`.
    ///
    /// Thread units share the registry directly; process units start
    /// `config.process_command` (or `<current exe> unit`), which builds its
    /// own registry.
    pub fn start(config: EngineConfig, registry: Arc<CodecRegistry>) -> Result<Self> {
        let spawner: Arc<dyn UnitSpawner> = match config.pool_kind {
            PoolKind::Thread => Arc::new(ThreadSpawner::new(registry)),
            PoolKind::Process => {
                let command = match &config.process_command {
                    Some(command) => command.clone(),
                    None => ProcessUnitCommand::current_exe()?,
                };
                Arc::new(ProcessSpawner::new(command))
            }
        };
        Self::with_spawner(config, spawner)
    }

    /// Start an engine on a custom unit spawner.
    pub fn with_spawner(config: EngineConfig, spawner: Arc<dyn UnitSpawner>) -> Result<Self> {
        config.validate()?;

        let events = EventBus::default();
        let queue = Arc::new(JobQueue::new(config.queue_max));
        let pool = Arc::new(ExecutionPool::start(
            PoolConfig {
                size: config.concurrency,
                job_timeout: config.job_timeout(),
            },
            spawner,
            events.clone(),
        )?);
        let scheduler = Arc::new(Scheduler::new(
            queue.clone(),
            pool.clone(),
            events.clone(),
            config.retry.clone(),
        ));

        let cancel = CancellationToken::new();
        spawn_progress_recorder(queue.clone(), events.subscribe(), cancel.clone());
        scheduler.start();

        info!(
            pool = %config.pool_kind,
            concurrency = config.concurrency,
            queue_max = config.queue_max,
            "Engine started"
        );

        Ok(Self {
            config,
            queue,
            pool,
            scheduler,
            events,
            bindings: Arc::new(BindingRegistry::new()),
            cancel,
        })
    }

    /// Admit a job. See [`JobQueue::add`].
    pub fn submit(
        &self,
        task_kind: impl Into<String>,
        payload: Value,
        options: AddOptions,
    ) -> Result<AdmittedJob> {
        let task_kind = task_kind.into();
        if task_kind.trim().is_empty() {
            return Err(Error::validation("task_kind must not be empty"));
        }
        let admitted = self.queue.add(task_kind.clone(), payload, options)?;
        if !admitted.deduplicated {
            info!("Enqueued job {} of type {}", admitted.job_id, task_kind);
        }
        Ok(admitted)
    }

    pub fn get_state(&self, job_id: &str) -> Result<JobState> {
        self.queue.get_state(job_id)
    }

    /// Cancel a queued job.
    ///
    /// Fails with [`Error::NotCancellable`] once the job is running or
    /// terminal.
    pub fn cancel(&self, job_id: &str) -> Result<()> {
        if !self.queue.cancel(job_id)? {
            return Err(Error::NotCancellable(job_id.to_string()));
        }
        self.events.publish(EngineEvent::cancelled(job_id));
        info!(job_id = %job_id, "Job cancelled");
        Ok(())
    }

    pub fn subscribe(&self) -> broadcast::Receiver<EngineEvent> {
        self.events.subscribe()
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn queue(&self) -> &Arc<JobQueue> {
        &self.queue
    }

    pub fn pool(&self) -> &Arc<ExecutionPool> {
        &self.pool
    }

    pub fn events(&self) -> &EventBus {
        &self.events
    }

    pub fn bindings(&self) -> &Arc<BindingRegistry> {
        &self.bindings
    }

    /// Stop dispatching, give in-flight jobs `grace` to finish, then close
    /// the pool.
    pub async fn shutdown(&self, grace: Duration) {
        self.scheduler.stop();
        if tokio::time::timeout(grace, self.scheduler.wait())
            .await
            .is_err()
        {
            warn!(
                in_flight = self.scheduler.in_flight(),
                "In-flight jobs did not finish in time; closing the pool"
            );
        }
        self.pool.shutdown().await;
        self.scheduler.wait().await;
        self.cancel.cancel();
        info!("Engine shut down");
    }
}

/// Copy the latest progress percent of running jobs into their state.
fn spawn_progress_recorder(
    queue: Arc<JobQueue>,
    mut rx: broadcast::Receiver<EngineEvent>,
    cancel: CancellationToken,
) {
    tokio::spawn(async move {
        loop {
            let event = tokio::select! {
                _ = cancel.cancelled() => break,
                event = rx.recv() => event,
            };
            match event {
                Ok(EngineEvent::Progress {
                    job_id,
                    percent: Some(percent),
                    ..
                }) => {
                    queue.record_progress(&job_id, percent);
                }
                Ok(_) => {}
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    debug!("Progress recorder lagged by {} events", n);
                }
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    });
}

impl Drop for Engine {
    fn drop(&mut self) {
        self.scheduler.stop();
        self.cancel.cancel();
    }
}
