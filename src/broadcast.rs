//! Fan-out of immutable values to registered channels
//!
//! Every component that pushes updates (container source, routing table,
//! detail watcher) owns one [`Broadcaster`]. A subscriber is identified by its
//! `mpsc::Sender`; each registration carries its own stop token, so a slow or
//! departed subscriber never holds up delivery to the others.
//!
//! Each subscriber has a single pending slot and at most one delivery task.
//! Publishing while a delivery is still waiting for channel capacity replaces
//! the pending value, so a subscriber that falls behind only ever sees the
//! latest value, in publish order.

use crate::error::SubscriptionError;
use parking_lot::Mutex;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::trace;

/// Latest undelivered value for one subscriber
struct Pending<T> {
    value: Option<T>,
    delivering: bool,
}

struct Subscriber<T> {
    tx: mpsc::Sender<T>,
    stop: CancellationToken,
    pending: Arc<Mutex<Pending<T>>>,
}

/// Subscriber set guarded by its own mutex
pub struct Broadcaster<T> {
    subscribers: Mutex<Vec<Subscriber<T>>>,
}

impl<T> Default for Broadcaster<T> {
    fn default() -> Self {
        Self {
            subscribers: Mutex::new(Vec::new()),
        }
    }
}

impl<T> Broadcaster<T>
where
    T: Clone + Send + 'static,
{
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a delivery channel.
    ///
    /// Callers own cleanup: the registration lives until [`unsubscribe`](Self::unsubscribe).
    pub fn subscribe(&self, tx: mpsc::Sender<T>) -> Result<(), SubscriptionError> {
        let mut subscribers = self.subscribers.lock();
        if subscribers.iter().any(|s| s.tx.same_channel(&tx)) {
            return Err(SubscriptionError::AlreadySubscribed);
        }

        subscribers.push(Subscriber {
            tx,
            stop: CancellationToken::new(),
            pending: Arc::new(Mutex::new(Pending {
                value: None,
                delivering: false,
            })),
        });
        Ok(())
    }

    /// Remove a delivery channel and stop any in-flight delivery to it
    pub fn unsubscribe(&self, tx: &mpsc::Sender<T>) -> Result<(), SubscriptionError> {
        let mut subscribers = self.subscribers.lock();
        let pos = subscribers
            .iter()
            .position(|s| s.tx.same_channel(tx))
            .ok_or(SubscriptionError::NotSubscribed)?;

        let removed = subscribers.swap_remove(pos);
        removed.stop.cancel();
        removed.pending.lock().value = None;
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.subscribers.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.subscribers.lock().is_empty()
    }

    /// Deliver `value` to every subscriber without waiting for any of them.
    ///
    /// A subscriber with a delivery already in flight has its pending value
    /// replaced; otherwise a task is spawned that races the send against the
    /// subscriber's stop token and `ctx`. Returns the number of subscribers.
    pub fn publish(&self, value: T, ctx: &CancellationToken) -> usize {
        let subscribers = self.subscribers.lock();

        for subscriber in subscribers.iter() {
            let mut pending = subscriber.pending.lock();
            if pending.value.replace(value.clone()).is_some() {
                trace!("Replaced undelivered value for a slow subscriber");
            }
            if pending.delivering {
                continue;
            }
            pending.delivering = true;
            drop(pending);

            tokio::spawn(deliver(
                subscriber.tx.clone(),
                subscriber.stop.clone(),
                ctx.clone(),
                Arc::clone(&subscriber.pending),
            ));
        }

        subscribers.len()
    }
}

/// Drain the pending slot into `tx` until it is empty.
///
/// Capacity is reserved before the value is taken, so a value published while
/// this task waits replaces the older one instead of queueing behind it.
async fn deliver<T>(
    tx: mpsc::Sender<T>,
    stop: CancellationToken,
    ctx: CancellationToken,
    pending: Arc<Mutex<Pending<T>>>,
) {
    loop {
        {
            let mut slot = pending.lock();
            if slot.value.is_none() {
                slot.delivering = false;
                return;
            }
        }

        let permit = tokio::select! {
            biased;
            _ = stop.cancelled() => break,
            _ = ctx.cancelled() => break,
            permit = tx.reserve() => match permit {
                Ok(permit) => permit,
                Err(_) => {
                    trace!("Subscriber receiver dropped before delivery");
                    break;
                }
            },
        };

        let mut slot = pending.lock();
        match slot.value.take() {
            Some(value) => permit.send(value),
            None => {
                slot.delivering = false;
                return;
            }
        }
    }

    let mut slot = pending.lock();
    slot.value = None;
    slot.delivering = false;
}
