//! # Event Bus
//!
//! Named-event publish/subscribe used by the core to notify observers
//! (trigger engine, script host, UI glue) of protocol and transfer
//! activity. The core only emits; consumers subscribe by event name or to
//! all events with `"*"`.
//!
//! Payloads are JSON maps so observers can match on fields without the bus
//! knowing every payload shape. Subscribers run synchronously in
//! subscription order on the emitting task and must be brief.

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde_json::Value;
use tracing::trace;

/// A single emitted event.
#[derive(Debug, Clone)]
pub struct Event {
    /// Event name, e.g. `CHANNEL_FULLY_JOINED`.
    pub name: String,
    /// Structured payload; shape is documented per event name.
    pub payload: Value,
    /// Emission time.
    pub timestamp: DateTime<Utc>,
}

type Subscriber = Box<dyn Fn(&Event) + Send + Sync>;

/// Publish/subscribe hub for named events.
pub struct EventBus {
    subscribers: RwLock<Vec<(String, Subscriber)>>,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

impl EventBus {
    pub fn new() -> Self {
        Self {
            subscribers: RwLock::new(Vec::new()),
        }
    }

    /// Register a callback for `name`, or for every event with `"*"`.
    pub fn subscribe<F>(&self, name: &str, callback: F)
    where
        F: Fn(&Event) + Send + Sync + 'static,
    {
        self.subscribers
            .write()
            .push((name.to_string(), Box::new(callback)));
    }

    /// Emit an event to all matching subscribers, in subscription order.
    pub fn emit(&self, name: &str, payload: Value) {
        let event = Event {
            name: name.to_string(),
            payload,
            timestamp: Utc::now(),
        };
        trace!("event: {} {}", event.name, event.payload);
        let subscribers = self.subscribers.read();
        for (filter, callback) in subscribers.iter() {
            if filter == "*" || filter == name {
                callback(&event);
            }
        }
    }
}
