use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use chrono::Utc;
use parking_lot::Mutex;
use tracing::debug;
use uuid::Uuid;

use crate::types::{NotificationEvent, Severity};

type Handler = Arc<dyn Fn(&NotificationEvent) + Send + Sync>;

struct Inner {
    next_subscriber: AtomicU64,
    // Keyed by a monotonically increasing id, so iteration is subscription order.
    handlers: Mutex<BTreeMap<u64, Handler>>,
    active: Mutex<Vec<NotificationEvent>>,
    display_for: Duration,
}

/// Session-wide bus for transient user-facing messages.
///
/// Constructed once per session and handed to every producer and display
/// surface. Delivery is synchronous: `emit` returns after every subscribed
/// handler has seen the event.
#[derive(Clone)]
pub struct NotificationChannel {
    inner: Arc<Inner>,
}

impl NotificationChannel {
    pub fn new(display_for: Duration) -> Self {
        Self {
            inner: Arc::new(Inner {
                next_subscriber: AtomicU64::new(0),
                handlers: Mutex::new(BTreeMap::new()),
                active: Mutex::new(Vec::new()),
                display_for,
            }),
        }
    }

    pub fn emit(&self, message: impl Into<String>, severity: Severity) -> NotificationEvent {
        let event = NotificationEvent {
            id: Uuid::new_v4(),
            message: message.into(),
            severity,
            emitted_at: Utc::now(),
        };

        {
            let mut active = self.inner.active.lock();
            self.prune(&mut active);
            active.push(event.clone());
        }

        // Snapshot first: a handler may subscribe or unsubscribe re-entrantly.
        let handlers: Vec<Handler> = self.inner.handlers.lock().values().cloned().collect();
        debug!(
            id = %event.id,
            ?severity,
            subscribers = handlers.len(),
            "notification emitted"
        );
        for handler in handlers {
            handler(&event);
        }

        event
    }

    pub fn subscribe<F>(&self, handler: F) -> Subscription
    where
        F: Fn(&NotificationEvent) + Send + Sync + 'static,
    {
        let id = self.inner.next_subscriber.fetch_add(1, Ordering::SeqCst);
        self.inner.handlers.lock().insert(id, Arc::new(handler));
        debug!(subscriber = id, "notification subscriber added");
        Subscription {
            id,
            channel: Arc::downgrade(&self.inner),
        }
    }

    /// Events still inside their display window, oldest first.
    pub fn active(&self) -> Vec<NotificationEvent> {
        let mut active = self.inner.active.lock();
        self.prune(&mut active);
        active.clone()
    }

    pub fn subscriber_count(&self) -> usize {
        self.inner.handlers.lock().len()
    }

    fn prune(&self, active: &mut Vec<NotificationEvent>) {
        let now = Utc::now();
        let display_for = chrono::Duration::from_std(self.inner.display_for)
            .unwrap_or_else(|_| chrono::Duration::weeks(52));
        active.retain(|event| now.signed_duration_since(event.emitted_at) < display_for);
    }
}

/// Handle returned by [`NotificationChannel::subscribe`]. Dropping it
/// unsubscribes the handler.
#[must_use = "dropping a subscription unsubscribes it"]
pub struct Subscription {
    id: u64,
    channel: Weak<Inner>,
}

impl Subscription {
    pub fn unsubscribe(self) {}
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(inner) = self.channel.upgrade() {
            inner.handlers.lock().remove(&self.id);
            debug!(subscriber = self.id, "notification subscriber removed");
        }
    }
}
