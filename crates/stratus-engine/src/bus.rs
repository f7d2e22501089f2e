use std::any::{Any, TypeId};
use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use parking_lot::RwLock;
use tracing::error;

type Handler = Arc<dyn Fn(&dyn Any) + Send + Sync>;

/// In-process event bus.
///
/// Publishers emit typed events on state transitions; subscribers register by
/// event type. Delivery is synchronous and ordered within a single publisher.
/// A panicking subscriber is caught and logged so it never crashes the
/// publisher.
#[derive(Clone, Default)]
pub struct EventBus {
    handlers: Arc<RwLock<HashMap<TypeId, Vec<Handler>>>>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe<E, F>(&self, handler: F)
    where
        E: Any,
        F: Fn(&E) + Send + Sync + 'static,
    {
        let handler: Handler = Arc::new(move |event: &dyn Any| {
            if let Some(event) = event.downcast_ref::<E>() {
                handler(event);
            }
        });
        self.handlers
            .write()
            .entry(TypeId::of::<E>())
            .or_default()
            .push(handler);
    }

    pub fn publish<E: Any>(&self, event: E) {
        let handlers = self.handlers.read().get(&TypeId::of::<E>()).cloned();
        let Some(handlers) = handlers else { return };

        for handler in handlers {
            if let Err(panic) = std::panic::catch_unwind(AssertUnwindSafe(|| handler(&event))) {
                error!(reason = %panic_message(panic), "event subscriber panicked");
            }
        }
    }
}

/// Best-effort extraction of a panic payload.
pub(crate) fn panic_message(panic: Box<dyn Any + Send>) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Debug)]
    struct Ping(u32);

    #[derive(Debug)]
    struct Pong;

    #[test]
    fn test_delivers_to_matching_subscribers_in_order() {
        let bus = EventBus::new();
        let seen = Arc::new(parking_lot::Mutex::new(Vec::new()));

        let first = seen.clone();
        bus.subscribe::<Ping, _>(move |event| first.lock().push(("first", event.0)));
        let second = seen.clone();
        bus.subscribe::<Ping, _>(move |event| second.lock().push(("second", event.0)));

        bus.publish(Ping(7));
        bus.publish(Pong);

        assert_eq!(*seen.lock(), vec![("first", 7), ("second", 7)]);
    }

    #[test]
    fn test_panicking_subscriber_does_not_stop_delivery() {
        let bus = EventBus::new();
        let delivered = Arc::new(AtomicUsize::new(0));

        bus.subscribe::<Ping, _>(|_| panic!("subscriber exploded"));
        let counter = delivered.clone();
        bus.subscribe::<Ping, _>(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        bus.publish(Ping(1));
        assert_eq!(delivered.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_publish_without_subscribers_is_a_noop() {
        let bus = EventBus::new();
        bus.publish(Ping(1));
    }
}
