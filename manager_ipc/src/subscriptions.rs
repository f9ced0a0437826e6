//! Notification subscriptions for the client side.
//!
//! Observers subscribe to one [`NotificationKind`] and receive every event of
//! that kind, in the order the events arrived. Each observer runs on its own
//! thread fed by a queue, so a slow observer never holds up the notification
//! reader or other observers.

use crate::messages::{NotificationEvent, NotificationKind};
use log::{trace, warn};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::mpsc::{channel, Sender};
use std::sync::{Mutex, PoisonError};
use std::thread;

/// Handle returned by [`Subscribers::subscribe`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Subscription {
    id: u64,
    kind: NotificationKind,
}

impl Subscription {
    pub fn kind(&self) -> NotificationKind {
        self.kind
    }
}

/// Registered observers, keyed by subscription id
#[derive(Default)]
pub struct Subscribers {
    next_id: AtomicU64,
    observers: Mutex<HashMap<u64, (NotificationKind, Sender<NotificationEvent>)>>,
}

impl Subscribers {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an observer for one kind of notification
    pub fn subscribe<F>(&self, kind: NotificationKind, observer: F) -> Subscription
    where
        F: Fn(NotificationEvent) + Send + 'static,
    {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = channel::<NotificationEvent>();

        // Ends once the subscription is removed and its sender dropped
        let spawned = thread::Builder::new()
            .name(format!("observer-{id}"))
            .spawn(move || {
                for event in rx {
                    observer(event);
                }
            });
        match spawned {
            Ok(_) => {
                self.observers
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .insert(id, (kind, tx));
            }
            Err(e) => warn!("Failed to start observer for {:?}: {}", kind, e),
        }
        Subscription { id, kind }
    }

    /// Remove an observer. Returns false if it was already removed.
    pub fn unsubscribe(&self, subscription: Subscription) -> bool {
        self.observers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&subscription.id)
            .is_some()
    }

    /// Number of observers registered for a kind
    pub fn count(&self, kind: NotificationKind) -> usize {
        self.observers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .filter(|(k, _)| *k == kind)
            .count()
    }

    /// Queue the event for every matching observer. Returns how many were
    /// handed the event; it does not wait for them to run.
    pub fn dispatch(&self, event: &NotificationEvent) -> usize {
        let kind = event.kind();
        let observers = self.observers.lock().unwrap_or_else(PoisonError::into_inner);

        let mut dispatched = 0;
        for (k, queue) in observers.values() {
            if *k != kind {
                continue;
            }
            // A panicked observer has dropped its queue
            if queue.send(event.clone()).is_ok() {
                dispatched += 1;
            }
        }
        trace!("Dispatched {:?} to {} observer(s)", kind, dispatched);
        dispatched
    }
}
