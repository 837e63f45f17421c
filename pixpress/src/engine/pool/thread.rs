//! Thread-backed execution units.

use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::debug;

use super::protocol::{UnitReply, UnitRequest, execute_request};
use super::{UnitLink, UnitSpawner};
use crate::codec::CodecRegistry;
use crate::config::PoolKind;
use crate::error::Result;

/// Runs each unit on a dedicated OS thread.
///
/// A panic inside a codec unwinds the thread and drops its reply sender,
/// which the pool handles like any other unit exit.
pub struct ThreadSpawner {
    registry: Arc<CodecRegistry>,
}

impl ThreadSpawner {
    pub fn new(registry: Arc<CodecRegistry>) -> Self {
        Self { registry }
    }
}

impl UnitSpawner for ThreadSpawner {
    fn kind(&self) -> PoolKind {
        PoolKind::Thread
    }

    fn spawn(&self, unit_id: usize) -> Result<UnitLink> {
        let (request_tx, mut request_rx) = mpsc::unbounded_channel::<UnitRequest>();
        let (reply_tx, reply_rx) = mpsc::unbounded_channel::<UnitReply>();
        let registry = self.registry.clone();

        std::thread::Builder::new()
            .name(format!("pixpress-unit-{}", unit_id))
            .spawn(move || {
                if reply_tx.send(UnitReply::Ready).is_err() {
                    return;
                }
                while let Some(request) = request_rx.blocking_recv() {
                    let reply = execute_request(&registry, request, |progress| {
                        let _ = reply_tx.send(progress);
                    });
                    if reply_tx.send(reply).is_err() {
                        break;
                    }
                }
                debug!(unit_id, "Thread unit stopped");
            })?;

        Ok(UnitLink {
            requests: request_tx,
            replies: reply_rx,
        })
    }
}
