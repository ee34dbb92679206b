//! Container source: polls the daemon for alive containers and republishes
//! every successful listing as an immutable [`Snapshot`].

use crate::broadcast::Broadcaster;
use crate::docker::{ContainerRecord, DockerApi};
use crate::error::{SubscriptionError, WatchError};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// All alive containers as of one poll, keyed by container id
pub type Snapshot = Arc<HashMap<String, ContainerRecord>>;

/// Polling faster than this only loads the daemon
pub const MIN_POLL_INTERVAL: Duration = Duration::from_millis(100);

pub struct ContainerSource {
    api: Arc<dyn DockerApi>,
    interval: Duration,
    subscribers: Broadcaster<Snapshot>,
}

impl ContainerSource {
    pub fn new(api: Arc<dyn DockerApi>, interval: Duration) -> Self {
        let interval = if interval < MIN_POLL_INTERVAL {
            warn!(
                requested_ms = interval.as_millis() as u64,
                min_ms = MIN_POLL_INTERVAL.as_millis() as u64,
                "Poll interval too short, using minimum"
            );
            MIN_POLL_INTERVAL
        } else {
            interval
        };

        Self {
            api,
            interval,
            subscribers: Broadcaster::new(),
        }
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    /// Register a channel for snapshots. Do not forget to [`unsubscribe`](Self::unsubscribe).
    pub fn subscribe(&self, tx: mpsc::Sender<Snapshot>) -> Result<(), SubscriptionError> {
        self.subscribers.subscribe(tx)
    }

    pub fn unsubscribe(&self, tx: &mpsc::Sender<Snapshot>) -> Result<(), SubscriptionError> {
        self.subscribers.unsubscribe(tx)
    }

    /// Poll until `ctx` is cancelled. Only ever returns [`WatchError::Cancelled`].
    pub async fn watch(&self, ctx: CancellationToken) -> Result<(), WatchError> {
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        info!(interval_ms = self.interval.as_millis() as u64, "Container source started");

        loop {
            tokio::select! {
                biased;
                _ = ctx.cancelled() => {
                    debug!("Container source stopped");
                    return Err(WatchError::Cancelled);
                }
                _ = ticker.tick() => {}
            }

            self.poll_once(&ctx).await;
        }
    }

    /// List containers and fan the snapshot out. Returns whether anything was published.
    ///
    /// Skipped when nobody listens. A failed listing leaves subscribers with
    /// the previous snapshot; the next tick retries.
    pub async fn poll_once(&self, ctx: &CancellationToken) -> bool {
        if self.subscribers.is_empty() {
            return false;
        }

        let result = tokio::select! {
            _ = ctx.cancelled() => return false,
            result = self.api.list_alive_containers() => result,
        };

        match result {
            Ok(list) => {
                let snapshot: Snapshot = Arc::new(
                    list.into_iter()
                        .map(|c| (c.id.clone(), c))
                        .collect(),
                );
                debug!(containers = snapshot.len(), "Publishing container snapshot");
                self.subscribers.publish(snapshot, ctx);
                true
            }
            Err(e) => {
                debug!(error = %e, "Failed to list containers, keeping previous snapshot");
                false
            }
        }
    }
}
