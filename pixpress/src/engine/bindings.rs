//! Job-to-stream bindings used to route completion events to subscribers.
//!
//! A job can finish before its binding is created, in which case the
//! terminal event goes out while nobody knows where to route it. Every
//! `bind` is therefore announced on a broadcast channel so that stream
//! handlers can look at the newly bound job's current state.

use dashmap::DashMap;
use serde::Serialize;
use tokio::sync::broadcast;

use super::job::JobId;

const BOUND_CHANNEL_CAPACITY: usize = 1024;

/// The subscriber a job's terminal event is delivered to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Binding {
    pub stream_id: String,
    pub client_id: String,
}

/// Announcement that `job_id` was bound to `stream_id`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BoundJob {
    pub job_id: JobId,
    pub stream_id: String,
}

/// Lookup table of `job_id -> (stream_id, client_id)`.
#[derive(Debug)]
pub struct BindingRegistry {
    bindings: DashMap<JobId, Binding>,
    bound_tx: broadcast::Sender<BoundJob>,
}

impl Default for BindingRegistry {
    fn default() -> Self {
        let (bound_tx, _) = broadcast::channel(BOUND_CHANNEL_CAPACITY);
        Self {
            bindings: DashMap::new(),
            bound_tx,
        }
    }
}

impl BindingRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Receive an announcement after every `bind`.
    pub fn subscribe(&self) -> broadcast::Receiver<BoundJob> {
        self.bound_tx.subscribe()
    }

    pub fn bind(
        &self,
        job_id: impl Into<JobId>,
        stream_id: impl Into<String>,
        client_id: impl Into<String>,
    ) {
        let job_id = job_id.into();
        let stream_id = stream_id.into();
        self.bindings.insert(
            job_id.clone(),
            Binding {
                stream_id: stream_id.clone(),
                client_id: client_id.into(),
            },
        );
        // No receivers just means no stream is connected.
        let _ = self.bound_tx.send(BoundJob { job_id, stream_id });
    }

    pub fn get(&self, job_id: &str) -> Option<Binding> {
        self.bindings.get(job_id).map(|b| b.value().clone())
    }

    pub fn remove(&self, job_id: &str) -> Option<Binding> {
        self.bindings.remove(job_id).map(|(_, b)| b)
    }

    /// Remove the binding only if it belongs to `stream_id`.
    ///
    /// At most one caller receives the binding, so a terminal event is
    /// delivered once even with several sockets on the same stream.
    pub fn take_for_stream(&self, job_id: &str, stream_id: &str) -> Option<Binding> {
        self.bindings
            .remove_if(job_id, |_, b| b.stream_id == stream_id)
            .map(|(_, b)| b)
    }

    /// Job ids currently bound to `stream_id`.
    pub fn jobs_for_stream(&self, stream_id: &str) -> Vec<JobId> {
        self.bindings
            .iter()
            .filter(|entry| entry.value().stream_id == stream_id)
            .map(|entry| entry.key().clone())
            .collect()
    }

    /// Drop every binding of a stream; returns how many were removed.
    pub fn clear_stream(&self, stream_id: &str) -> usize {
        let before = self.bindings.len();
        self.bindings.retain(|_, b| b.stream_id != stream_id);
        before.saturating_sub(self.bindings.len())
    }

    pub fn len(&self) -> usize {
        self.bindings.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bindings.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bind_and_get() {
        let registry = BindingRegistry::new();
        registry.bind("job-1", "stream-a", "client-1");

        let binding = registry.get("job-1").unwrap();
        assert_eq!(binding.stream_id, "stream-a");
        assert_eq!(binding.client_id, "client-1");
        assert!(registry.get("job-2").is_none());
    }

    #[test]
    fn test_take_for_stream_is_exclusive() {
        let registry = BindingRegistry::new();
        registry.bind("job-1", "stream-a", "client-1");

        assert!(registry.take_for_stream("job-1", "stream-b").is_none());
        assert!(registry.take_for_stream("job-1", "stream-a").is_some());
        assert!(registry.take_for_stream("job-1", "stream-a").is_none());
        assert!(registry.is_empty());
    }

    #[test]
    fn test_bind_is_announced() {
        let registry = BindingRegistry::new();
        registry.bind("job-0", "stream-a", "client-0");

        let mut rx = registry.subscribe();
        registry.bind("job-1", "stream-a", "client-1");

        assert_eq!(
            rx.try_recv().unwrap(),
            BoundJob {
                job_id: "job-1".into(),
                stream_id: "stream-a".into(),
            }
        );
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_clear_stream() {
        let registry = BindingRegistry::new();
        registry.bind("job-1", "stream-a", "c1");
        registry.bind("job-2", "stream-a", "c2");
        registry.bind("job-3", "stream-b", "c3");

        let mut jobs = registry.jobs_for_stream("stream-a");
        jobs.sort();
        assert_eq!(jobs, vec!["job-1".to_string(), "job-2".to_string()]);

        assert_eq!(registry.clear_stream("stream-a"), 2);
        assert_eq!(registry.len(), 1);
        assert!(registry.get("job-3").is_some());
    }
}
