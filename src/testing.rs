//! In-memory container runtime for tests.
//!
//! [`StubDocker`] implements [`DockerApi`] over a mutable container list, with
//! switches to fail individual calls and a hand-driven event stream.
//!
//! ```rust,no_run
//! use indocker::docker::ContainerRecord;
//! use indocker::testing::StubDocker;
//!
//! let stub = StubDocker::new();
//! stub.set_containers(vec![
//!     ContainerRecord::new("c1")
//!         .with_label("indocker.host", "foo")
//!         .with_network("bridge", "10.0.0.5"),
//! ]);
//! ```

use crate::docker::{ContainerRecord, DaemonEvent, DockerApi, DockerError, ResourceUsage};
use async_trait::async_trait;
use bollard::models::ContainerInspectResponse;
use futures::stream::BoxStream;
use futures::StreamExt;
use parking_lot::Mutex;
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use tokio::sync::mpsc;

type EventSender = mpsc::UnboundedSender<Result<DaemonEvent, DockerError>>;

#[derive(Default)]
pub struct StubDocker {
    containers: Mutex<Vec<ContainerRecord>>,
    fail_list: AtomicBool,
    failing_inspect: Mutex<HashSet<String>>,
    failing_stats: Mutex<HashSet<String>>,
    list_calls: AtomicUsize,
    inspect_calls: AtomicUsize,
    stats_calls: AtomicUsize,
    events_opened: AtomicUsize,
    event_stream: Mutex<Option<EventSender>>,
}

impl StubDocker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_containers(&self, containers: Vec<ContainerRecord>) {
        *self.containers.lock() = containers;
    }

    pub fn fail_list(&self, fail: bool) {
        self.fail_list.store(fail, Ordering::SeqCst);
    }

    pub fn fail_inspect(&self, id: &str) {
        self.failing_inspect.lock().insert(id.to_string());
    }

    pub fn fail_stats(&self, id: &str) {
        self.failing_stats.lock().insert(id.to_string());
    }

    /// Number of list calls made so far
    pub fn list_calls(&self) -> usize {
        self.list_calls.load(Ordering::SeqCst)
    }

    pub fn inspect_calls(&self) -> usize {
        self.inspect_calls.load(Ordering::SeqCst)
    }

    pub fn stats_calls(&self) -> usize {
        self.stats_calls.load(Ordering::SeqCst)
    }

    /// Number of times the event stream has been opened
    pub fn events_opened(&self) -> usize {
        self.events_opened.load(Ordering::SeqCst)
    }

    /// Push an event into the most recently opened stream. Returns false if none is open.
    pub fn emit_event(&self, event: DaemonEvent) -> bool {
        self.send_event(Ok(event))
    }

    /// Make the most recently opened stream yield an error
    pub fn break_event_stream(&self) -> bool {
        self.send_event(Err(DockerError::Other("event stream broken".to_string())))
    }

    fn send_event(&self, item: Result<DaemonEvent, DockerError>) -> bool {
        match self.event_stream.lock().as_ref() {
            Some(tx) => tx.send(item).is_ok(),
            None => false,
        }
    }
}

#[async_trait]
impl DockerApi for StubDocker {
    async fn list_alive_containers(&self) -> Result<Vec<ContainerRecord>, DockerError> {
        self.list_calls.fetch_add(1, Ordering::SeqCst);
        if self.fail_list.load(Ordering::SeqCst) {
            return Err(DockerError::Other("daemon unavailable".to_string()));
        }
        Ok(self.containers.lock().clone())
    }

    async fn inspect_container(&self, id: &str) -> Result<ContainerInspectResponse, DockerError> {
        self.inspect_calls.fetch_add(1, Ordering::SeqCst);
        if self.failing_inspect.lock().contains(id) {
            return Err(DockerError::Other(format!("inspect failed for {}", id)));
        }
        Ok(ContainerInspectResponse {
            id: Some(id.to_string()),
            ..Default::default()
        })
    }

    async fn container_stats(&self, id: &str) -> Result<ResourceUsage, DockerError> {
        self.stats_calls.fetch_add(1, Ordering::SeqCst);
        if self.failing_stats.lock().contains(id) {
            return Err(DockerError::NoStats(id.to_string()));
        }
        Ok(ResourceUsage {
            read: "2024-01-01T00:00:00Z".to_string(),
            pids: Some(1),
            ..Default::default()
        })
    }

    fn events(&self) -> BoxStream<'static, Result<DaemonEvent, DockerError>> {
        let (tx, rx) = mpsc::unbounded_channel();
        *self.event_stream.lock() = Some(tx);
        self.events_opened.fetch_add(1, Ordering::SeqCst);

        futures::stream::unfold(rx, |mut rx| async move {
            rx.recv().await.map(|item| (item, rx))
        })
        .boxed()
    }
}
