use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};

use super::{MessageHandler, Subscriber, Transport};
use crate::error::{RelayError, RelayResult};

/// In-process pub/sub bus.
///
/// Publishes are recorded and delivered synchronously to exact-topic
/// subscribers. Marking the bus unavailable makes every publish fail with
/// `TransportUnavailable`, the same way a disconnected broker does.
pub struct MemoryTransport {
    name: String,
    available: AtomicBool,
    published: Mutex<Vec<(String, Vec<u8>)>>,
    handlers: Mutex<Vec<(String, MessageHandler)>>,
}

impl MemoryTransport {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            available: AtomicBool::new(true),
            published: Mutex::new(Vec::new()),
            handlers: Mutex::new(Vec::new()),
        }
    }

    pub fn unavailable(name: impl Into<String>) -> Self {
        let transport = Self::new(name);
        transport.set_available(false);
        transport
    }

    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    /// Everything published so far, in order.
    pub fn published(&self) -> Vec<(String, Vec<u8>)> {
        lock(&self.published).clone()
    }

    pub fn published_on(&self, topic: &str) -> Vec<Vec<u8>> {
        lock(&self.published)
            .iter()
            .filter(|(t, _)| t == topic)
            .map(|(_, payload)| payload.clone())
            .collect()
    }

    /// Deliver a message to subscribers as if it came from a remote peer.
    pub fn inject(&self, topic: &str, payload: &[u8]) {
        let matching: Vec<MessageHandler> = lock(&self.handlers)
            .iter()
            .filter(|(subscribed, _)| subscribed == topic)
            .map(|(_, handler)| handler.clone())
            .collect();
        for handler in matching {
            handler(topic, payload);
        }
    }
}

impl Transport for MemoryTransport {
    fn name(&self) -> &str {
        &self.name
    }

    fn is_connected(&self) -> bool {
        self.available.load(Ordering::SeqCst)
    }

    fn publish(&self, topic: &str, payload: &[u8]) -> RelayResult<()> {
        if !self.is_connected() {
            return Err(RelayError::TransportUnavailable {
                transport: self.name.clone(),
            });
        }
        lock(&self.published).push((topic.to_string(), payload.to_vec()));
        self.inject(topic, payload);
        Ok(())
    }
}

impl Subscriber for MemoryTransport {
    fn subscribe(&self, topic: &str, handler: MessageHandler) -> RelayResult<()> {
        lock(&self.handlers).push((topic.to_string(), handler));
        Ok(())
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn publish_reaches_exact_topic_subscribers() {
        let bus = MemoryTransport::new("bus");
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        bus.subscribe(
            "a/b",
            Arc::new(move |topic: &str, payload: &[u8]| {
                sink.lock().unwrap().push((topic.to_string(), payload.to_vec()))
            }),
        )
        .unwrap();

        bus.publish("a/b", b"1").unwrap();
        bus.publish("a/c", b"2").unwrap();

        assert_eq!(*seen.lock().unwrap(), vec![("a/b".to_string(), b"1".to_vec())]);
        assert_eq!(bus.published().len(), 2);
    }

    #[test]
    fn unavailable_bus_rejects_publish() {
        let bus = MemoryTransport::unavailable("down");
        let err = bus.publish("t", b"x").unwrap_err();
        assert!(matches!(err, RelayError::TransportUnavailable { .. }));
        assert!(bus.published().is_empty());
    }
}
