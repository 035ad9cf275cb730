//! Broadcast layer: publishes applied changes to subscribers.

use std::sync::Mutex;

use keel_core::event::UpdateEvent;

type Subscriber = Box<dyn Fn(&UpdateEvent) + Send + Sync>;

/// Delivers every published event to every subscriber, at-least-once.
/// Subscribers must be idempotent keyed on
/// `(resource_id, applied_version)`.
#[derive(Default)]
pub struct Broadcaster {
    subscribers: Mutex<Vec<Subscriber>>,
}

impl Broadcaster {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe<F>(&self, callback: F)
    where
        F: Fn(&UpdateEvent) + Send + Sync + 'static,
    {
        self.subscribers
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(Box::new(callback));
    }

    pub fn publish(&self, event: &UpdateEvent) {
        tracing::debug!(
            "broadcast: {}/{} v{} by {:?}",
            event.resource_type,
            event.resource_id,
            event.applied_version,
            event.actor
        );
        let subscribers = self.subscribers.lock().unwrap_or_else(|e| e.into_inner());
        for subscriber in subscribers.iter() {
            subscriber(event);
        }
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .len()
    }
}
