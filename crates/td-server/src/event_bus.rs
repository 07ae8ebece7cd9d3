use std::sync::{Arc, Mutex};

use td_sync::Event;

/// A broadcast-style event bus built on top of flume channels.
///
/// The push endpoint publishes freshly sequenced events here so SSE
/// subscribers see them immediately instead of waiting for the next poll.
/// Each call to [`subscribe`](EventBus::subscribe) creates a new receiver
/// that observes every event published afterwards. Cloning is cheap (the
/// internals live behind an `Arc`).
#[derive(Clone)]
pub struct EventBus {
    inner: Arc<Mutex<Vec<flume::Sender<Event>>>>,
}

impl EventBus {
    pub fn new() -> Self {
        Self { inner: Arc::new(Mutex::new(Vec::new())) }
    }

    /// Register a new subscriber and return its receiving end.
    pub fn subscribe(&self) -> flume::Receiver<Event> {
        let (tx, rx) = flume::unbounded();
        let mut senders = self.inner.lock().expect("EventBus lock poisoned");
        senders.push(tx);
        rx
    }

    /// Publish an event to all current subscribers. Disconnected
    /// subscribers are pruned.
    pub fn publish(&self, event: Event) {
        let mut senders = self.inner.lock().expect("EventBus lock poisoned");
        senders.retain(|tx| tx.send(event.clone()).is_ok());
    }

    pub fn subscriber_count(&self) -> usize {
        self.inner.lock().expect("EventBus lock poisoned").len()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn event(seq: i64) -> Event {
        Event {
            server_seq: seq,
            device_id: "dev".into(),
            session_id: "s".into(),
            client_action_id: seq,
            action_type: "create".into(),
            entity_type: "issues".into(),
            entity_id: "td-1".into(),
            payload: serde_json::json!({}),
            client_timestamp: Utc::now(),
            server_timestamp: Utc::now(),
        }
    }

    #[test]
    fn subscribers_receive_later_events() {
        let bus = EventBus::new();
        let rx = bus.subscribe();
        bus.publish(event(1));
        assert_eq!(rx.recv().unwrap().server_seq, 1);
    }

    #[test]
    fn dropped_subscribers_are_pruned() {
        let bus = EventBus::new();
        let rx = bus.subscribe();
        drop(rx);
        bus.publish(event(1));
        assert_eq!(bus.subscriber_count(), 0);
    }
}
