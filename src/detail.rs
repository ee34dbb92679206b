//! Container detail watcher
//!
//! Follows a [`ContainerSource`] and, for every snapshot, fetches inspect data
//! and a one-shot stats sample for each container. The aggregated map is
//! published once every fetch of the batch has finished, and the last
//! [`HISTORY_CAPACITY`] batches are kept for late readers.

use crate::broadcast::Broadcaster;
use crate::docker::{DockerApi, ResourceUsage};
use crate::error::{SubscriptionError, WatchError};
use crate::source::{ContainerSource, Snapshot};
use bollard::models::ContainerInspectResponse;
use chrono::{DateTime, Utc};
use futures::future::join_all;
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

/// Inspect and stats for one container. A failed fetch leaves its field empty.
#[derive(Debug, Clone, Default, Serialize)]
pub struct ContainerDetail {
    pub inspect: Option<ContainerInspectResponse>,
    pub stats: Option<ResourceUsage>,
}

/// Details keyed by container id
pub type DetailMap = HashMap<String, ContainerDetail>;

/// Number of batches kept by [`DetailWatcher::snapshots`]
pub const HISTORY_CAPACITY: usize = 20;

/// One completed batch of container details
#[derive(Debug, Clone, Serialize)]
pub struct DetailSnapshot {
    pub created_at: DateTime<Utc>,
    pub containers: DetailMap,
}

impl DetailSnapshot {
    pub fn new(containers: DetailMap) -> Self {
        Self {
            created_at: Utc::now(),
            containers,
        }
    }
}

pub struct DetailWatcher {
    api: Arc<dyn DockerApi>,
    subscribers: Broadcaster<Arc<DetailSnapshot>>,
    history: Mutex<VecDeque<Arc<DetailSnapshot>>>,
}

impl DetailWatcher {
    pub fn new(api: Arc<dyn DockerApi>) -> Self {
        Self {
            api,
            subscribers: Broadcaster::new(),
            history: Mutex::new(VecDeque::with_capacity(HISTORY_CAPACITY)),
        }
    }

    pub fn subscribe(&self, tx: mpsc::Sender<Arc<DetailSnapshot>>) -> Result<(), SubscriptionError> {
        self.subscribers.subscribe(tx)
    }

    pub fn unsubscribe(&self, tx: &mpsc::Sender<Arc<DetailSnapshot>>) -> Result<(), SubscriptionError> {
        self.subscribers.unsubscribe(tx)
    }

    /// Copy of the retained batches, oldest first
    pub fn snapshots(&self) -> Vec<Arc<DetailSnapshot>> {
        self.history.lock().iter().cloned().collect()
    }

    /// Append `snapshot` to the history, evicting the oldest batch when full
    fn record(&self, snapshot: Arc<DetailSnapshot>) {
        let mut history = self.history.lock();
        if history.len() == HISTORY_CAPACITY {
            history.pop_front();
        }
        history.push_back(snapshot);
    }

    /// Follow `source` until `ctx` is cancelled
    pub async fn watch(&self, ctx: CancellationToken, source: &ContainerSource) -> Result<(), WatchError> {
        let (tx, mut rx) = mpsc::channel::<Snapshot>(1);
        source.subscribe(tx.clone())?;

        info!("Detail watcher started");

        let result = loop {
            tokio::select! {
                biased;
                _ = ctx.cancelled() => break Err(WatchError::Cancelled),
                snapshot = rx.recv() => {
                    let Some(snapshot) = snapshot else { continue };
                    if self.subscribers.is_empty() {
                        continue;
                    }

                    let details = tokio::select! {
                        _ = ctx.cancelled() => break Err(WatchError::Cancelled),
                        details = self.collect(&snapshot) => details,
                    };
                    let batch = Arc::new(DetailSnapshot::new(details));
                    self.record(Arc::clone(&batch));
                    self.subscribers.publish(batch, &ctx);
                }
            }
        };

        let _ = source.unsubscribe(&tx);
        debug!("Detail watcher stopped");
        result
    }

    /// Fetch inspect and stats for every container in `snapshot`
    pub async fn collect(&self, snapshot: &Snapshot) -> DetailMap {
        let fetches = snapshot.keys().map(|id| async move {
            let (inspect, stats) = tokio::join!(
                self.api.inspect_container(id),
                self.api.container_stats(id)
            );

            let inspect = inspect
                .map_err(|e| debug!(container = %id, error = %e, "Inspect failed"))
                .ok();
            let stats = stats
                .map_err(|e| debug!(container = %id, error = %e, "Stats failed"))
                .ok();

            (id.clone(), ContainerDetail { inspect, stats })
        });

        join_all(fetches).await.into_iter().collect()
    }
}
