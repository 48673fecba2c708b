//! Fan-out of notifications to observers.
//!
//! Delivery rides on a bounded `tokio::sync::broadcast` ring, so `publish` never
//! blocks. An observer that falls more than `capacity` notifications behind loses its
//! oldest unread ones and carries on from the oldest still retained; nobody else is
//! affected.

use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use log::{debug, error, info, warn};
use tokio::sync::{Notify, broadcast, watch};
use tokio::task::JoinHandle;

use crate::error::DeliveryError;
use crate::messages::{Notification, Snapshot};

pub type ObserverId = u64;

/// Something that can carry notifications to a remote party.
pub trait ObserverSink: Send + 'static {
    fn name(&self) -> String;

    fn deliver_snapshot(
        &mut self,
        snapshot: &Snapshot,
    ) -> impl Future<Output = Result<(), DeliveryError>> + Send;

    fn deliver(
        &mut self,
        notification: &Notification,
    ) -> impl Future<Output = Result<(), DeliveryError>> + Send;
}

struct Membership {
    active: AtomicBool,
    closed: Notify,
}

pub struct BroadcastHub {
    tx: broadcast::Sender<Notification>,
    observers: Mutex<HashMap<ObserverId, Arc<Membership>>>,
    next_id: AtomicU64,
}

/// Receiving end held by one observer.
pub struct Observer {
    id: ObserverId,
    rx: broadcast::Receiver<Notification>,
    membership: Arc<Membership>,
}

impl Observer {
    pub fn id(&self) -> ObserverId {
        self.id
    }

    /// Next notification, or `None` once unsubscribed or the hub is gone.
    pub async fn recv(&mut self) -> Option<Notification> {
        loop {
            if !self.membership.active.load(Ordering::Acquire) {
                return None;
            }
            tokio::select! {
                _ = self.membership.closed.notified() => return None,
                received = self.rx.recv() => match received {
                    Ok(notification) => return Some(notification),
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!("Observer {} lagged, dropped {} oldest notifications", self.id, skipped);
                    }
                    Err(broadcast::error::RecvError::Closed) => return None,
                },
            }
        }
    }
}

impl BroadcastHub {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        BroadcastHub {
            tx,
            observers: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(1),
        }
    }

    pub fn subscribe(&self) -> Observer {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let membership = Arc::new(Membership {
            active: AtomicBool::new(true),
            closed: Notify::new(),
        });
        self.observers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(id, membership.clone());
        debug!("Observer {} subscribed", id);
        Observer {
            id,
            rx: self.tx.subscribe(),
            membership,
        }
    }

    /// Removes an observer. Returns whether it was still subscribed.
    pub fn unsubscribe(&self, id: ObserverId) -> bool {
        let removed = self
            .observers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&id);
        match removed {
            Some(membership) => {
                membership.active.store(false, Ordering::Release);
                membership.closed.notify_one();
                debug!("Observer {} unsubscribed", id);
                true
            }
            None => false,
        }
    }

    /// Hands a notification to every current observer without waiting on any of them.
    pub fn publish(&self, notification: Notification) -> usize {
        // No receivers is not an error; there is simply nobody listening.
        self.tx.send(notification).unwrap_or(0)
    }

    pub fn observer_count(&self) -> usize {
        self.observers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    /// Spawns a task that feeds `sink` the snapshot and then the live stream. A
    /// delivery failure unsubscribes this observer only. Shutdown interrupts a delivery
    /// that is still in flight.
    pub fn attach<S: ObserverSink>(
        self: &Arc<Self>,
        mut observer: Observer,
        snapshot: Snapshot,
        mut sink: S,
        mut shutdown: watch::Receiver<bool>,
    ) -> JoinHandle<()> {
        let hub = Arc::clone(self);
        tokio::spawn(async move {
            let id = observer.id();
            let name = sink.name();
            info!("Observer {} attached ({})", id, name);

            let delivered = tokio::select! {
                _ = shutdown.changed() => Ok(false),
                result = sink.deliver_snapshot(&snapshot) => result.map(|()| true),
            };
            let mut running = match delivered {
                Ok(running) => running,
                Err(err) => {
                    error!("Dropping observer {} ({}): {}", id, name, err);
                    false
                }
            };

            while running {
                let notification = tokio::select! {
                    _ = shutdown.changed() => break,
                    next = observer.recv() => match next {
                        Some(notification) => notification,
                        None => break,
                    },
                };
                running = tokio::select! {
                    _ = shutdown.changed() => false,
                    result = sink.deliver(&notification) => match result {
                        Ok(()) => true,
                        Err(err) => {
                            error!("Dropping observer {} ({}): {}", id, name, err);
                            false
                        }
                    },
                };
            }

            hub.unsubscribe(id);
            info!("Observer {} detached ({})", id, name);
        })
    }
}
