//! Change-event bus.
//!
//! Storage writes emit `<collection>.<create|update|delete>` events; the sync
//! layer subscribes exporters to the collections it watches.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};

use tracing::trace;

use crate::sync::types::BoxFuture;

/// Event action suffixes emitted for every watched collection.
pub const ACTIONS: [&str; 3] = ["create", "update", "delete"];

/// Handler invoked with the event name.
pub type EventHandler = Arc<dyn Fn(&str) -> BoxFuture<'static, ()> + Send + Sync>;

/// Full event name for a collection action, e.g. `posts.update`.
#[must_use]
pub fn event_name(collection: &str, action: &str) -> String {
    format!("{collection}.{action}")
}

/// In-process publish/subscribe registry.
#[derive(Clone, Default)]
pub struct EventBus {
    handlers: Arc<Mutex<HashMap<String, Vec<EventHandler>>>>,
}

impl std::fmt::Debug for EventBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let handlers = self.lock();
        let mut events: Vec<&String> = handlers.keys().collect();
        events.sort();
        f.debug_struct("EventBus").field("events", &events).finish()
    }
}

impl EventBus {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Subscribe `handler` to `event`.
    pub fn on(&self, event: impl Into<String>, handler: EventHandler) {
        self.lock().entry(event.into()).or_default().push(handler);
    }

    /// Emit `event`, awaiting every subscribed handler in registration order.
    pub async fn emit(&self, event: &str) {
        let handlers: Vec<EventHandler> = self.lock().get(event).cloned().unwrap_or_default();
        trace!(event, handlers = handlers.len(), "Emitting event");
        for handler in handlers {
            handler(event).await;
        }
    }

    /// Number of handlers subscribed to `event`.
    #[must_use]
    pub fn handler_count(&self, event: &str) -> usize {
        self.lock().get(event).map_or(0, Vec::len)
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, Vec<EventHandler>>> {
        self.handlers.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[tokio::test]
    async fn test_emit_reaches_only_subscribers() {
        let bus = EventBus::new();
        let hits = Arc::new(AtomicUsize::new(0));

        let counter = Arc::clone(&hits);
        bus.on(
            event_name("posts", "update"),
            Arc::new(move |_: &str| -> BoxFuture<'static, ()> {
                let counter = Arc::clone(&counter);
                Box::pin(async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                })
            }),
        );

        bus.emit("posts.update").await;
        bus.emit("posts.create").await;
        bus.emit("tags.update").await;

        assert_eq!(hits.load(Ordering::SeqCst), 1);
        assert_eq!(bus.handler_count("posts.update"), 1);
        assert_eq!(bus.handler_count("posts.delete"), 0);
    }
}
