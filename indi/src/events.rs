//! Protocol event dispatcher
//!
//! Subscribers are plain closures called synchronously, in subscription
//! order, on the thread that raised the event. For inbound traffic that is the
//! connection's read task, so a slow subscriber slows protocol processing.
//! Subscribers that must not block should forward into their own task, e.g.
//! through [`EventDispatcher::subscribe_channel`].

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};

use tokio::sync::broadcast;

use crate::message::{ClientMessage, ServerMessage};
use crate::vector::Property;

/// Protocol lifecycle event
#[derive(Debug, Clone)]
pub enum IndiEvent {
    ServerConnected,
    ServerDisconnected,
    MessageSent(ClientMessage),
    MessageReceived(ServerMessage),
    PropertyDefined {
        device: String,
        name: String,
        value: Arc<Property>,
    },
    PropertyDeleted {
        device: String,
        name: String,
        last_value: Arc<Property>,
    },
    PropertyChanged {
        device: String,
        name: String,
        previous: Arc<Property>,
        next: Arc<Property>,
    },
    DeviceFound(String),
    DeviceRemoved(String),
    Notification {
        device: Option<String>,
        message: String,
    },
}

/// Discriminant of [`IndiEvent`], for filtered subscriptions
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    ServerConnected,
    ServerDisconnected,
    MessageSent,
    MessageReceived,
    PropertyDefined,
    PropertyDeleted,
    PropertyChanged,
    DeviceFound,
    DeviceRemoved,
    Notification,
}

impl IndiEvent {
    pub fn kind(&self) -> EventKind {
        match self {
            IndiEvent::ServerConnected => EventKind::ServerConnected,
            IndiEvent::ServerDisconnected => EventKind::ServerDisconnected,
            IndiEvent::MessageSent(_) => EventKind::MessageSent,
            IndiEvent::MessageReceived(_) => EventKind::MessageReceived,
            IndiEvent::PropertyDefined { .. } => EventKind::PropertyDefined,
            IndiEvent::PropertyDeleted { .. } => EventKind::PropertyDeleted,
            IndiEvent::PropertyChanged { .. } => EventKind::PropertyChanged,
            IndiEvent::DeviceFound(_) => EventKind::DeviceFound,
            IndiEvent::DeviceRemoved(_) => EventKind::DeviceRemoved,
            IndiEvent::Notification { .. } => EventKind::Notification,
        }
    }

    /// Device the event concerns, if any
    pub fn device(&self) -> Option<&str> {
        match self {
            IndiEvent::PropertyDefined { device, .. }
            | IndiEvent::PropertyDeleted { device, .. }
            | IndiEvent::PropertyChanged { device, .. }
            | IndiEvent::DeviceFound(device)
            | IndiEvent::DeviceRemoved(device) => Some(device),
            IndiEvent::Notification { device, .. } => device.as_deref(),
            IndiEvent::MessageReceived(message) => message.device(),
            _ => None,
        }
    }
}

/// Handle returned by `subscribe`, used to unsubscribe
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

type Subscriber = Arc<dyn Fn(&IndiEvent) + Send + Sync>;

/// Synchronous publish-subscribe broadcaster
#[derive(Default)]
pub struct EventDispatcher {
    subscribers: RwLock<Vec<(SubscriptionId, Subscriber)>>,
    next_id: AtomicU64,
}

impl std::fmt::Debug for EventDispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventDispatcher")
            .field("subscribers", &self.subscriber_count())
            .finish()
    }
}

impl EventDispatcher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a callback for every event
    pub fn subscribe<F>(&self, callback: F) -> SubscriptionId
    where
        F: Fn(&IndiEvent) + Send + Sync + 'static,
    {
        let id = SubscriptionId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.subscribers
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .push((id, Arc::new(callback)));
        id
    }

    /// Register a callback for one kind of event
    pub fn subscribe_to<F>(&self, kind: EventKind, callback: F) -> SubscriptionId
    where
        F: Fn(&IndiEvent) + Send + Sync + 'static,
    {
        self.subscribe(move |event| {
            if event.kind() == kind {
                callback(event)
            }
        })
    }

    /// Forward every event into a broadcast channel.
    ///
    /// Lagging receivers lose the oldest events, as with any broadcast channel.
    pub fn subscribe_channel(&self, capacity: usize) -> (SubscriptionId, broadcast::Receiver<IndiEvent>) {
        let (tx, rx) = broadcast::channel(capacity.max(1));
        let id = self.subscribe(move |event| {
            // No receivers left is fine
            let _ = tx.send(event.clone());
        });
        (id, rx)
    }

    /// Returns false if the subscription was already gone
    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        let mut subscribers = self
            .subscribers
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        let before = subscribers.len();
        subscribers.retain(|(sid, _)| *sid != id);
        subscribers.len() != before
    }

    pub fn unsubscribe_all(&self) {
        self.subscribers
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clear();
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .len()
    }

    /// Deliver an event to every subscriber, in subscription order.
    ///
    /// The subscriber list is copied first so callbacks may subscribe or
    /// unsubscribe without deadlocking.
    pub fn dispatch(&self, event: &IndiEvent) {
        let subscribers: Vec<Subscriber> = self
            .subscribers
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .iter()
            .map(|(_, s)| Arc::clone(s))
            .collect();
        for subscriber in subscribers {
            subscriber(event);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    fn recorder() -> (Arc<Mutex<Vec<String>>>, impl Fn(&str) -> Box<dyn Fn(&IndiEvent) + Send + Sync>) {
        let log = Arc::new(Mutex::new(Vec::new()));
        let log2 = Arc::clone(&log);
        let make = move |tag: &str| {
            let log = Arc::clone(&log2);
            let tag = tag.to_string();
            Box::new(move |event: &IndiEvent| {
                log.lock().unwrap().push(format!("{}:{:?}", tag, event.kind()));
            }) as Box<dyn Fn(&IndiEvent) + Send + Sync>
        };
        (log, make)
    }

    #[test]
    fn test_dispatch_in_subscription_order() {
        let dispatcher = EventDispatcher::new();
        let (log, make) = recorder();
        dispatcher.subscribe(make("first"));
        dispatcher.subscribe(make("second"));

        dispatcher.dispatch(&IndiEvent::ServerConnected);
        dispatcher.dispatch(&IndiEvent::DeviceFound("Mount".to_string()));

        assert_eq!(
            *log.lock().unwrap(),
            vec![
                "first:ServerConnected",
                "second:ServerConnected",
                "first:DeviceFound",
                "second:DeviceFound",
            ]
        );
    }

    #[test]
    fn test_unsubscribe() {
        let dispatcher = EventDispatcher::new();
        let (log, make) = recorder();
        let id = dispatcher.subscribe(make("a"));
        dispatcher.subscribe(make("b"));

        assert!(dispatcher.unsubscribe(id));
        assert!(!dispatcher.unsubscribe(id));
        dispatcher.dispatch(&IndiEvent::ServerDisconnected);

        assert_eq!(*log.lock().unwrap(), vec!["b:ServerDisconnected"]);
        assert_eq!(dispatcher.subscriber_count(), 1);
    }

    #[test]
    fn test_filtered_subscription() {
        let dispatcher = EventDispatcher::new();
        let (log, make) = recorder();
        dispatcher.subscribe_to(EventKind::DeviceFound, make("found"));

        dispatcher.dispatch(&IndiEvent::ServerConnected);
        dispatcher.dispatch(&IndiEvent::DeviceFound("CCD".to_string()));

        assert_eq!(*log.lock().unwrap(), vec!["found:DeviceFound"]);
    }

    #[test]
    fn test_subscribing_from_a_callback_does_not_deadlock() {
        let dispatcher = Arc::new(EventDispatcher::new());
        let inner = Arc::clone(&dispatcher);
        dispatcher.subscribe(move |_| {
            inner.subscribe(|_| {});
        });
        dispatcher.dispatch(&IndiEvent::ServerConnected);
        assert_eq!(dispatcher.subscriber_count(), 2);
    }

    #[tokio::test]
    async fn test_channel_bridge() {
        let dispatcher = EventDispatcher::new();
        let (_, mut rx) = dispatcher.subscribe_channel(16);
        dispatcher.dispatch(&IndiEvent::Notification {
            device: Some("Dome".to_string()),
            message: "Shutter open".to_string(),
        });

        let event = rx.recv().await.unwrap();
        assert_eq!(event.kind(), EventKind::Notification);
        assert_eq!(event.device(), Some("Dome"));
    }
}
