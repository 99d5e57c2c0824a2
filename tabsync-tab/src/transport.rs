use std::sync::{Arc, Mutex};

use tabsync_core::{MAX_TOPIC_LEN, TabId};
use tokio::sync::mpsc;

use crate::error::TransportError;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Delivery {
    pub sender: TabId,
    pub payload: Vec<u8>,
}

pub trait BroadcastTransport: Send + Sync {
    fn is_available(&self) -> bool;

    fn publish(&self, topic: &str, payload: &[u8]) -> Result<(), TransportError>;

    fn subscribe(&self, topic: &str) -> Subscription;
}

#[derive(Debug)]
pub struct Subscription {
    topic: String,
    rx: mpsc::UnboundedReceiver<Delivery>,
}

impl Subscription {
    pub fn topic(&self) -> &str {
        &self.topic
    }

    pub async fn recv(&mut self) -> Option<Delivery> {
        self.rx.recv().await
    }

    pub fn try_recv(&mut self) -> Option<Delivery> {
        self.rx.try_recv().ok()
    }

    pub fn unsubscribe(self) {}
}

#[derive(Debug)]
struct Subscriber {
    owner: TabId,
    topic: String,
    tx: mpsc::UnboundedSender<Delivery>,
}

#[derive(Debug, Clone, Default)]
pub(crate) struct SubscriberRegistry {
    inner: Arc<Mutex<Vec<Subscriber>>>,
}

impl SubscriberRegistry {
    pub(crate) fn register(&self, owner: &TabId, topic: &str) -> Subscription {
        let (tx, rx) = mpsc::unbounded_channel();
        if let Ok(mut subscribers) = self.inner.lock() {
            subscribers.push(Subscriber {
                owner: owner.clone(),
                topic: topic.to_owned(),
                tx,
            });
        }
        Subscription {
            topic: topic.to_owned(),
            rx,
        }
    }

    pub(crate) fn dispatch(&self, skip_owner: Option<&TabId>, topic: &str, delivery: &Delivery) {
        if let Ok(mut subscribers) = self.inner.lock() {
            subscribers.retain(|sub| {
                if sub.topic != topic || skip_owner.is_some_and(|owner| *owner == sub.owner) {
                    return !sub.tx.is_closed();
                }
                sub.tx.send(delivery.clone()).is_ok()
            });
        }
    }

    pub(crate) fn clear(&self) {
        if let Ok(mut subscribers) = self.inner.lock() {
            subscribers.clear();
        }
    }
}

pub(crate) fn check_topic(topic: &str) -> Result<(), TransportError> {
    if topic.is_empty() || topic.len() > MAX_TOPIC_LEN {
        return Err(TransportError::Codec(tabsync_core::CoreError::InvalidTopic));
    }
    Ok(())
}

#[derive(Debug, Clone, Default)]
pub struct MemoryBus {
    registry: SubscriberRegistry,
}

impl MemoryBus {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn endpoint(&self, tab_id: &TabId) -> MemoryTransport {
        MemoryTransport {
            tab_id: tab_id.clone(),
            registry: self.registry.clone(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct MemoryTransport {
    tab_id: TabId,
    registry: SubscriberRegistry,
}

impl BroadcastTransport for MemoryTransport {
    fn is_available(&self) -> bool {
        true
    }

    fn publish(&self, topic: &str, payload: &[u8]) -> Result<(), TransportError> {
        check_topic(topic)?;
        let delivery = Delivery {
            sender: self.tab_id.clone(),
            payload: payload.to_vec(),
        };
        self.registry.dispatch(Some(&self.tab_id), topic, &delivery);
        Ok(())
    }

    fn subscribe(&self, topic: &str) -> Subscription {
        self.registry.register(&self.tab_id, topic)
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct NoopTransport;

impl BroadcastTransport for NoopTransport {
    fn is_available(&self) -> bool {
        false
    }

    fn publish(&self, _topic: &str, _payload: &[u8]) -> Result<(), TransportError> {
        Ok(())
    }

    fn subscribe(&self, topic: &str) -> Subscription {
        let (_tx, rx) = mpsc::unbounded_channel();
        Subscription {
            topic: topic.to_owned(),
            rx,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn publisher_does_not_hear_itself() {
        let bus = MemoryBus::new();
        let a = bus.endpoint(&TabId::generate());
        let b = bus.endpoint(&TabId::generate());
        let mut sub_a = a.subscribe("presence");
        let mut sub_b = b.subscribe("presence");

        a.publish("presence", b"ping").unwrap();

        assert!(sub_a.try_recv().is_none());
        let delivery = sub_b.try_recv().expect("peer delivery");
        assert_eq!(delivery.payload, b"ping");
    }

    #[test]
    fn topics_are_filtered() {
        let bus = MemoryBus::new();
        let a = bus.endpoint(&TabId::generate());
        let b = bus.endpoint(&TabId::generate());
        let mut election = b.subscribe("election");

        a.publish("presence", b"beacon").unwrap();
        assert!(election.try_recv().is_none());

        a.publish("election", b"discover").unwrap();
        assert_eq!(election.try_recv().unwrap().payload, b"discover");
    }

    #[test]
    fn per_sender_order_is_kept() {
        let bus = MemoryBus::new();
        let a = bus.endpoint(&TabId::generate());
        let b = bus.endpoint(&TabId::generate());
        let mut sub = b.subscribe("replication");

        for index in 0..10_u8 {
            a.publish("replication", &[index]).unwrap();
        }
        for expected in 0..10_u8 {
            assert_eq!(sub.try_recv().unwrap().payload, vec![expected]);
        }
    }

    #[test]
    fn dropped_subscription_is_pruned() {
        let bus = MemoryBus::new();
        let a = bus.endpoint(&TabId::generate());
        let b = bus.endpoint(&TabId::generate());
        let sub = b.subscribe("presence");
        sub.unsubscribe();

        a.publish("presence", b"ping").unwrap();
        assert_eq!(bus.registry.inner.lock().unwrap().len(), 0);
    }

    #[test]
    fn noop_transport_reports_unavailable() {
        let transport = NoopTransport;
        assert!(!transport.is_available());
        transport.publish("presence", b"ping").unwrap();
        let mut sub = transport.subscribe("presence");
        assert!(sub.try_recv().is_none());
    }

    #[test]
    fn empty_topic_is_refused() {
        let bus = MemoryBus::new();
        let a = bus.endpoint(&TabId::generate());
        assert!(a.publish("", b"x").is_err());
    }
}
