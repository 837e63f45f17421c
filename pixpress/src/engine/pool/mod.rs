//! Fixed-size execution pool.
//!
//! The pool keeps every live unit and the subset that is idle. A caller
//! acquires an idle unit (waiting if none is available), sends it one
//! request tagged with a fresh request id and waits for the reply with the
//! same id. When a unit exits, the request it was serving is rejected and a
//! replacement is spawned so the live count returns to the configured size.
//!
//! A timed-out request is abandoned but keeps running inside its unit, so the
//! next request sent to that unit waits behind it. Each unit therefore keeps
//! the ids it was sent in order; the front one is the request it is actually
//! executing. If the unit dies, only that request fails and the ones behind it
//! are dispatched again.
//!
//! Units are created by a [`UnitSpawner`]: [`ThreadSpawner`] runs them as OS
//! threads in this process, [`ProcessSpawner`] as child processes.

pub mod process;
pub mod protocol;
pub mod thread;

pub use process::{ProcessSpawner, ProcessUnitCommand, run_unit_stdio};
pub use protocol::{UnitReply, UnitRequest, execute_request};
pub use thread::ThreadSpawner;

use parking_lot::Mutex;
use serde_json::Value;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use tokio::sync::{Notify, mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use super::events::{EngineEvent, EventBus};
use super::job::JobOutcome;
use crate::config::PoolKind;
use crate::error::{Error, JobError, Result};

/// Channels connecting the pool to one unit.
///
/// Dropping `requests` tells the unit to exit. The unit dropping its reply
/// sender (returning, panicking or its process exiting) ends `replies`,
/// which the pool treats as the unit's exit.
pub struct UnitLink {
    pub requests: mpsc::UnboundedSender<UnitRequest>,
    pub replies: mpsc::UnboundedReceiver<UnitReply>,
}

/// Starts execution units.
pub trait UnitSpawner: Send + Sync + 'static {
    fn kind(&self) -> PoolKind;

    /// Start one unit. The unit must send [`UnitReply::Ready`] before it is
    /// handed work.
    fn spawn(&self, unit_id: usize) -> Result<UnitLink>;
}

/// Configuration for an [`ExecutionPool`].
#[derive(Debug, Clone)]
pub struct PoolConfig {
    pub size: usize,
    /// Wall-clock bound for one request.
    pub job_timeout: Duration,
}

struct UnitSlot {
    requests: mpsc::UnboundedSender<UnitRequest>,
    /// Request that keeps the unit busy from the pool's point of view.
    current: Option<String>,
    /// Requests sent to the unit and not yet answered, oldest first.
    sent: VecDeque<String>,
    ready: bool,
}

/// What a waiting caller receives.
enum Delivery {
    Done(JobOutcome),
    /// The unit exited before starting the request.
    Requeue,
}

struct Pending {
    job_id: String,
    unit_id: usize,
    reply: oneshot::Sender<Delivery>,
}

#[derive(Default)]
struct PoolState {
    units: HashMap<usize, UnitSlot>,
    idle: VecDeque<usize>,
    pending: HashMap<String, Pending>,
    closed: bool,
}

struct PoolShared {
    kind: PoolKind,
    size: usize,
    job_timeout: Duration,
    spawner: Arc<dyn UnitSpawner>,
    events: EventBus,
    state: Mutex<PoolState>,
    idle_notify: Notify,
    next_unit_id: AtomicUsize,
    cancel: CancellationToken,
    tracker: TaskTracker,
}

impl PoolShared {
    fn spawn_unit(self: &Arc<Self>) -> Result<usize> {
        let unit_id = self.next_unit_id.fetch_add(1, Ordering::Relaxed);
        let UnitLink { requests, replies } = self.spawner.spawn(unit_id)?;

        {
            let mut state = self.state.lock();
            if state.closed {
                return Err(Error::Other("execution pool is closed".to_string()));
            }
            state.units.insert(
                unit_id,
                UnitSlot {
                    requests,
                    current: None,
                    sent: VecDeque::new(),
                    ready: false,
                },
            );
        }

        let this = self.clone();
        self.tracker.spawn(async move {
            this.read_replies(unit_id, replies).await;
        });
        debug!(unit_id, kind = %self.kind, "Spawned execution unit");
        Ok(unit_id)
    }

    async fn read_replies(
        self: Arc<Self>,
        unit_id: usize,
        mut replies: mpsc::UnboundedReceiver<UnitReply>,
    ) {
        loop {
            let reply = tokio::select! {
                _ = self.cancel.cancelled() => return,
                reply = replies.recv() => reply,
            };
            match reply {
                Some(reply) => self.handle_reply(unit_id, reply),
                None => break,
            }
        }
        self.handle_unit_exit(unit_id).await;
    }

    fn handle_reply(&self, unit_id: usize, reply: UnitReply) {
        match reply {
            UnitReply::Ready => {
                let mut guard = self.state.lock();
                let state = &mut *guard;
                let Some(slot) = state.units.get_mut(&unit_id) else {
                    return;
                };
                if slot.ready {
                    return;
                }
                slot.ready = true;
                if slot.current.is_none() {
                    state.idle.push_back(unit_id);
                }
                drop(guard);
                debug!(unit_id, "Execution unit ready");
                self.idle_notify.notify_one();
            }
            UnitReply::Progress {
                request_id,
                stage,
                percent,
            } => {
                let job_id = self
                    .state
                    .lock()
                    .pending
                    .get(&request_id)
                    .map(|p| p.job_id.clone());
                if let Some(job_id) = job_id {
                    self.events
                        .publish(EngineEvent::progress(&job_id, stage, percent));
                }
            }
            UnitReply::Result { request_id, data } => {
                self.complete(unit_id, &request_id, Ok(data));
            }
            UnitReply::Error {
                request_id,
                message,
            } => {
                self.complete(unit_id, &request_id, Err(JobError::Execution(message)));
            }
        }
    }

    fn complete(&self, unit_id: usize, request_id: &str, outcome: JobOutcome) {
        let mut guard = self.state.lock();
        let state = &mut *guard;
        let pending = state.pending.remove(request_id);

        let mut released = false;
        if let Some(slot) = state.units.get_mut(&unit_id) {
            slot.sent.retain(|id| id != request_id);
            if slot.current.as_deref() == Some(request_id) {
                slot.current = None;
                state.idle.push_back(unit_id);
                released = true;
            }
        }
        drop(guard);

        if released {
            self.idle_notify.notify_one();
        }
        match pending {
            Some(pending) => {
                let _ = pending.reply.send(Delivery::Done(outcome));
            }
            None => debug!(unit_id, request_id, "Discarding reply for abandoned request"),
        }
    }

    async fn handle_unit_exit(self: &Arc<Self>, unit_id: usize) {
        let (running, waiting, closed) = {
            let mut guard = self.state.lock();
            let state = &mut *guard;
            state.idle.retain(|id| *id != unit_id);
            let mut sent = state
                .units
                .remove(&unit_id)
                .map(|slot| slot.sent)
                .unwrap_or_default();

            let running = sent.pop_front().and_then(|id| state.pending.remove(&id));
            let waiting: Vec<Pending> = sent
                .iter()
                .filter_map(|id| state.pending.remove(id))
                .collect();
            (running, waiting, state.closed)
        };

        if let Some(pending) = running {
            let err = if closed {
                JobError::PoolClosed
            } else {
                warn!(job_id = %pending.job_id, unit_id, "Execution unit exited while running a job");
                JobError::UnitCrashed(format!("unit {} exited unexpectedly", unit_id))
            };
            let _ = pending.reply.send(Delivery::Done(Err(err)));
        }
        for pending in waiting {
            let delivery = if closed {
                Delivery::Done(Err(JobError::PoolClosed))
            } else {
                debug!(job_id = %pending.job_id, unit_id, "Request never started on exited unit");
                Delivery::Requeue
            };
            let _ = pending.reply.send(delivery);
        }

        if closed {
            return;
        }
        warn!(unit_id, "Execution unit exited; spawning a replacement");
        self.respawn().await;
    }

    async fn respawn(self: &Arc<Self>) {
        let mut delay = Duration::from_millis(100);
        loop {
            match self.spawn_unit() {
                Ok(unit_id) => {
                    info!(unit_id, "Replacement execution unit started");
                    return;
                }
                Err(e) => error!(error = %e, "Failed to spawn replacement execution unit"),
            }
            tokio::select! {
                _ = self.cancel.cancelled() => return,
                _ = tokio::time::sleep(delay) => {}
            }
            delay = (delay * 2).min(Duration::from_secs(5));
        }
    }

    async fn acquire(&self) -> std::result::Result<usize, JobError> {
        loop {
            let notified = self.idle_notify.notified();
            {
                let mut state = self.state.lock();
                if state.closed {
                    return Err(JobError::PoolClosed);
                }
                if let Some(unit_id) = state.idle.pop_front() {
                    return Ok(unit_id);
                }
            }
            notified.await;
        }
    }

    /// Hand `request` to an acquired unit.
    ///
    /// Returns `Ok(None)` when the unit went away after it was acquired.
    fn dispatch(
        &self,
        unit_id: usize,
        request: &UnitRequest,
    ) -> std::result::Result<Option<oneshot::Receiver<Delivery>>, JobError> {
        let mut guard = self.state.lock();
        let state = &mut *guard;
        if state.closed {
            return Err(JobError::PoolClosed);
        }
        let Some(slot) = state.units.get_mut(&unit_id) else {
            return Ok(None);
        };
        if slot.requests.send(request.clone()).is_err() {
            return Ok(None);
        }
        slot.current = Some(request.request_id.clone());
        slot.sent.push_back(request.request_id.clone());

        let (tx, rx) = oneshot::channel();
        state.pending.insert(
            request.request_id.clone(),
            Pending {
                job_id: request.job_id.clone(),
                unit_id,
                reply: tx,
            },
        );
        Ok(Some(rx))
    }

    /// Drop a timed-out request and return its unit to idle.
    ///
    /// Returns `false` when the reply already arrived.
    fn abandon(&self, request_id: &str) -> bool {
        let mut guard = self.state.lock();
        let state = &mut *guard;
        let Some(pending) = state.pending.remove(request_id) else {
            return false;
        };
        if let Some(slot) = state.units.get_mut(&pending.unit_id)
            && slot.current.as_deref() == Some(request_id)
        {
            slot.current = None;
            state.idle.push_back(pending.unit_id);
        }
        drop(guard);
        self.idle_notify.notify_one();
        true
    }

    /// Close the pool. Returns `false` if it was already closed.
    fn close(&self) -> bool {
        let pending: Vec<Pending> = {
            let mut state = self.state.lock();
            if state.closed {
                return false;
            }
            state.closed = true;
            state.units.clear();
            state.idle.clear();
            state.pending.drain().map(|(_, p)| p).collect()
        };
        for pending in pending {
            let _ = pending.reply.send(Delivery::Done(Err(JobError::PoolClosed)));
        }
        self.idle_notify.notify_waiters();
        self.cancel.cancel();
        self.tracker.close();
        true
    }
}

/// Fixed-size pool of execution units.
pub struct ExecutionPool {
    shared: Arc<PoolShared>,
}

impl ExecutionPool {
    /// Start `config.size` units.
    pub fn start(
        config: PoolConfig,
        spawner: Arc<dyn UnitSpawner>,
        events: EventBus,
    ) -> Result<Self> {
        if config.size == 0 {
            return Err(Error::config("pool size must be at least 1"));
        }

        let shared = Arc::new(PoolShared {
            kind: spawner.kind(),
            size: config.size,
            job_timeout: config.job_timeout,
            spawner,
            events,
            state: Mutex::new(PoolState::default()),
            idle_notify: Notify::new(),
            next_unit_id: AtomicUsize::new(0),
            cancel: CancellationToken::new(),
            tracker: TaskTracker::new(),
        });

        for _ in 0..config.size {
            if let Err(e) = shared.spawn_unit() {
                shared.close();
                return Err(e);
            }
        }

        info!(
            "Started {} execution pool with {} units",
            shared.kind, shared.size
        );
        Ok(Self { shared })
    }

    /// Execute one request on the next idle unit.
    ///
    /// Waits for an idle unit, then for the reply or the job timeout. On
    /// timeout the unit goes back to idle and its eventual reply is dropped.
    /// A request whose unit exits before starting it is sent to another unit.
    pub async fn run(&self, job_id: &str, task_kind: &str, payload: Value) -> JobOutcome {
        let request = UnitRequest {
            request_id: Uuid::new_v4().to_string(),
            job_id: job_id.to_string(),
            task_kind: task_kind.to_string(),
            payload,
        };
        let timeout_ms = self.shared.job_timeout.as_millis() as u64;

        loop {
            let unit_id = self.shared.acquire().await?;
            let Some(mut rx) = self.shared.dispatch(unit_id, &request)? else {
                continue;
            };
            debug!(job_id, unit_id, request_id = %request.request_id, "Dispatched request");

            let delivery = match tokio::time::timeout(self.shared.job_timeout, &mut rx).await {
                Ok(Ok(delivery)) => delivery,
                Ok(Err(_)) => return Err(JobError::PoolClosed),
                Err(_) => {
                    if self.shared.abandon(&request.request_id) {
                        warn!(job_id, timeout_ms, "Request timed out; abandoning it");
                        return Err(JobError::Timeout(timeout_ms));
                    }
                    match rx.try_recv() {
                        Ok(delivery) => delivery,
                        Err(_) => return Err(JobError::Timeout(timeout_ms)),
                    }
                }
            };

            match delivery {
                Delivery::Done(outcome) => return outcome,
                Delivery::Requeue => {
                    debug!(job_id, unit_id, "Unit exited before starting the request; dispatching again");
                }
            }
        }
    }

    pub fn kind(&self) -> PoolKind {
        self.shared.kind
    }

    /// Configured number of units.
    pub fn size(&self) -> usize {
        self.shared.size
    }

    /// Units currently alive, ready or starting.
    pub fn live_count(&self) -> usize {
        self.shared.state.lock().units.len()
    }

    pub fn idle_count(&self) -> usize {
        self.shared.state.lock().idle.len()
    }

    /// Requests waiting for a reply.
    pub fn running_count(&self) -> usize {
        self.shared.state.lock().pending.len()
    }

    pub fn is_closed(&self) -> bool {
        self.shared.state.lock().closed
    }

    /// Stop all units and reject waiting callers with [`JobError::PoolClosed`].
    pub async fn shutdown(&self) {
        if self.shared.close() {
            self.shared.tracker.wait().await;
            info!("Execution pool shut down");
        }
    }
}

impl Drop for ExecutionPool {
    fn drop(&mut self) {
        self.shared.close();
    }
}
