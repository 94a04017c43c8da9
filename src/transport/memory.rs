use std::collections::BTreeSet;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};

use crate::entity::Entity;
use crate::error::TransportError;
use crate::message::{Channel, Message};

use super::Transport;

#[derive(Debug, Default)]
struct Recorded {
    published: Vec<(Channel, Message)>,
    subscribed: BTreeSet<String>,
}

/// Transport that records traffic instead of sending it.
///
/// Used by tests and by hosts that wire several engines together in-process
/// by draining one transport and feeding the messages to another engine.
#[derive(Debug)]
pub struct InMemoryTransport {
    recorded: Mutex<Recorded>,
    connected: AtomicBool,
    reconnects: AtomicU64,
    fail_publish: AtomicBool,
    fail_reconnect: AtomicBool,
}

impl InMemoryTransport {
    #[must_use]
    pub fn new() -> Self {
        Self {
            recorded: Mutex::new(Recorded::default()),
            connected: AtomicBool::new(true),
            reconnects: AtomicU64::new(0),
            fail_publish: AtomicBool::new(false),
            fail_reconnect: AtomicBool::new(false),
        }
    }

    fn recorded(&self) -> MutexGuard<'_, Recorded> {
        self.recorded.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Everything published so far, in order.
    #[must_use]
    pub fn published(&self) -> Vec<(Channel, Message)> {
        self.recorded().published.clone()
    }

    /// Messages published on one channel.
    #[must_use]
    pub fn published_on(&self, channel: &Channel) -> Vec<Message> {
        self.recorded()
            .published
            .iter()
            .filter(|(c, _)| c == channel)
            .map(|(_, m)| m.clone())
            .collect()
    }

    /// Drains the published log.
    pub fn take_published(&self) -> Vec<(Channel, Message)> {
        std::mem::take(&mut self.recorded().published)
    }

    #[must_use]
    pub fn is_subscribed(&self, channel: &Channel) -> bool {
        self.recorded().subscribed.contains(channel.name())
    }

    /// Names of the currently subscribed channels.
    #[must_use]
    pub fn subscriptions(&self) -> Vec<String> {
        self.recorded().subscribed.iter().cloned().collect()
    }

    #[must_use]
    pub fn reconnects(&self) -> u64 {
        self.reconnects.load(Ordering::Relaxed)
    }

    #[must_use]
    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Acquire)
    }

    /// Makes subsequent publishes fail.
    pub fn set_fail_publish(&self, fail: bool) {
        self.fail_publish.store(fail, Ordering::Release);
    }

    /// Makes subsequent reconnects fail.
    pub fn set_fail_reconnect(&self, fail: bool) {
        self.fail_reconnect.store(fail, Ordering::Release);
    }

    fn ensure_connected(&self) -> Result<(), TransportError> {
        if self.is_connected() {
            Ok(())
        } else {
            Err(TransportError::ConnectionFailed {
                message: "not connected".to_string(),
            })
        }
    }
}

impl Default for InMemoryTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl Transport for InMemoryTransport {
    fn publish(&self, channel: &Channel, message: &Message) -> Result<(), TransportError> {
        self.ensure_connected()?;
        if self.fail_publish.load(Ordering::Acquire) {
            return Err(TransportError::PublishFailed {
                channel: channel.name().to_string(),
                message: "injected failure".to_string(),
            });
        }
        self.recorded().published.push((channel.clone(), message.clone()));
        Ok(())
    }

    fn subscribe(&self, channel: &Channel) -> Result<(), TransportError> {
        self.ensure_connected()?;
        self.recorded().subscribed.insert(channel.name().to_string());
        Ok(())
    }

    fn unsubscribe(&self, channel: &Channel) -> Result<(), TransportError> {
        self.recorded().subscribed.remove(channel.name());
        Ok(())
    }

    fn reconnect(&self, _self_entity: &Entity) -> Result<(), TransportError> {
        if self.fail_reconnect.load(Ordering::Acquire) {
            return Err(TransportError::ConnectionFailed {
                message: "injected reconnect failure".to_string(),
            });
        }
        self.reconnects.fetch_add(1, Ordering::Relaxed);
        self.recorded().subscribed.clear();
        self.connected.store(true, Ordering::Release);
        Ok(())
    }

    fn disconnect(&self) -> Result<(), TransportError> {
        self.connected.store(false, Ordering::Release);
        self.recorded().subscribed.clear();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entity::{EntityId, EntityType};
    use crate::message::MessageBody;

    fn check_in(id: &str) -> Message {
        let e = Entity::new(id, EntityType::Device);
        Message::new(e.id.clone(), "", MessageBody::CheckIn { entity: e })
    }

    #[test]
    fn test_records_publishes_per_channel() {
        let t = InMemoryTransport::new();
        t.publish(&Channel::Broadcast, &check_in("a")).unwrap();
        t.publish(&Channel::Group, &check_in("b")).unwrap();
        assert_eq!(t.published().len(), 2);
        assert_eq!(t.published_on(&Channel::Broadcast).len(), 1);
        assert_eq!(t.take_published().len(), 2);
        assert!(t.published().is_empty());
    }

    #[test]
    fn test_subscriptions_and_reconnect() {
        let t = InMemoryTransport::new();
        t.subscribe(&Channel::Proximity).unwrap();
        t.subscribe(&Channel::Entity(EntityId::new("Me"))).unwrap();
        assert!(t.is_subscribed(&Channel::Entity(EntityId::new("me"))));
        t.reconnect(&Entity::new("me", EntityType::Device)).unwrap();
        assert_eq!(t.reconnects(), 1);
        assert!(t.subscriptions().is_empty());
    }

    #[test]
    fn test_injected_failures() {
        let t = InMemoryTransport::new();
        t.set_fail_publish(true);
        assert!(matches!(
            t.publish(&Channel::Broadcast, &check_in("a")),
            Err(TransportError::PublishFailed { .. })
        ));
        t.set_fail_reconnect(true);
        assert!(t.reconnect(&Entity::new("a", EntityType::Device)).is_err());
        assert_eq!(t.reconnects(), 0);
    }

    #[test]
    fn test_disconnected_transport_rejects_publish() {
        let t = InMemoryTransport::new();
        t.disconnect().unwrap();
        assert!(!t.is_connected());
        assert!(t.publish(&Channel::Broadcast, &check_in("a")).is_err());
    }
}
