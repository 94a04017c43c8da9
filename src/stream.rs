//! Channel-backed event sink.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use crossbeam_channel::{bounded, Receiver, RecvTimeoutError, Sender, TrySendError};

use crate::distance::DistanceRange;
use crate::entity::Entity;
use crate::error::{ExecutionError, ProxError, ProxResult};
use crate::events::{
    EntityEvent, ErrorEvent, EventPayload, EventRecord, GroupEvent, SubscriptionCallback,
};
use crate::group::Group;
use crate::poi::Poi;
use crate::subscription::Subscription;

/// Default buffer size of an [`EventStream`].
pub const DEFAULT_STREAM_CAPACITY: usize = 1024;

/// A [`SubscriptionCallback`] that buffers events in a bounded channel.
///
/// Delivery never blocks the evaluation worker: when the buffer is full the
/// event is dropped and counted.
///
/// ```
/// use std::sync::Arc;
/// use proxmesh::EventStream;
///
/// let stream = Arc::new(EventStream::new(16));
/// assert!(stream.try_recv().is_none());
/// assert_eq!(stream.dropped_events(), 0);
/// ```
#[derive(Debug)]
pub struct EventStream {
    tx: Sender<EventRecord>,
    rx: Receiver<EventRecord>,
    dropped: AtomicU64,
}

impl EventStream {
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        let (tx, rx) = bounded::<EventRecord>(capacity.max(1));
        Self {
            tx,
            rx,
            dropped: AtomicU64::new(0),
        }
    }

    fn push(&self, record: EventRecord) {
        match self.tx.try_send(record) {
            Ok(()) => {}
            Err(TrySendError::Full(_)) | Err(TrySendError::Disconnected(_)) => {
                self.dropped.fetch_add(1, Ordering::Relaxed);
            }
        }
    }

    /// Receive the next event (blocking).
    pub fn recv(&self) -> ProxResult<EventRecord> {
        self.rx.recv().map_err(|_| {
            ProxError::Execution(ExecutionError::Disconnected {
                path: "event_stream".to_string(),
            })
        })
    }

    /// Receive the next event with a timeout.
    pub fn recv_timeout(&self, timeout: Duration) -> ProxResult<EventRecord> {
        self.rx.recv_timeout(timeout).map_err(|err| match err {
            RecvTimeoutError::Timeout => ProxError::Execution(ExecutionError::Timeout {
                duration_ms: timeout.as_millis().min(u128::from(u64::MAX)) as u64,
            }),
            RecvTimeoutError::Disconnected => ProxError::Execution(ExecutionError::Disconnected {
                path: "event_stream".to_string(),
            }),
        })
    }

    /// Next buffered event, if any.
    #[must_use]
    pub fn try_recv(&self) -> Option<EventRecord> {
        self.rx.try_recv().ok()
    }

    /// Drains everything currently buffered.
    #[must_use]
    pub fn drain(&self) -> Vec<EventRecord> {
        self.rx.try_iter().collect()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.rx.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.rx.is_empty()
    }

    /// Events lost because the buffer was full.
    #[must_use]
    pub fn dropped_events(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

impl Default for EventStream {
    fn default() -> Self {
        Self::new(DEFAULT_STREAM_CAPACITY)
    }
}

impl SubscriptionCallback for EventStream {
    fn on_entity_event(
        &self,
        subscription: &Subscription,
        event: EntityEvent,
        e1: &Entity,
        e2: &Entity,
        distance: DistanceRange,
    ) {
        self.push(EventRecord::new(
            Some(subscription.id()),
            EventPayload::Entity {
                event,
                e1: e1.clone(),
                e2: e2.clone(),
                distance,
            },
        ));
    }

    fn on_group_event(&self, subscription: &Subscription, event: GroupEvent, entity: &Entity, group: &Group) {
        self.push(EventRecord::new(
            Some(subscription.id()),
            EventPayload::Group {
                event,
                entity: entity.clone(),
                group: group.clone(),
            },
        ));
    }

    fn on_subscription_error(&self, subscription: &Subscription, error: ErrorEvent) {
        self.push(EventRecord::new(Some(subscription.id()), EventPayload::Error { error }));
    }

    fn on_poi_event(&self, entity: &Entity, poi: &Poi, entered: bool) {
        self.push(EventRecord::new(
            None,
            EventPayload::Poi {
                entity: entity.clone(),
                poi: poi.clone(),
                entered,
            },
        ));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entity::EntityType;

    #[test]
    fn test_records_events_in_order() {
        let stream = EventStream::new(8);
        let sub = Subscription::group(Group::new("g"));
        let e = Entity::new("a", EntityType::Device);
        stream.on_group_event(&sub, GroupEvent::CheckIn, &e, &Group::new("g"));
        stream.on_subscription_error(&sub, ErrorEvent::NotValid);

        let first = stream.try_recv().unwrap();
        assert_eq!(first.group_event(), Some(GroupEvent::CheckIn));
        assert_eq!(first.subscription_id, Some(sub.id()));
        let second = stream.try_recv().unwrap();
        assert_eq!(second.error_event(), Some(ErrorEvent::NotValid));
        assert!(stream.is_empty());
    }

    #[test]
    fn test_full_buffer_counts_drops() {
        let stream = EventStream::new(1);
        let sub = Subscription::group(Group::new("g"));
        stream.on_subscription_error(&sub, ErrorEvent::NotValid);
        stream.on_subscription_error(&sub, ErrorEvent::NotValid);
        assert_eq!(stream.len(), 1);
        assert_eq!(stream.dropped_events(), 1);
    }

    #[test]
    fn test_recv_timeout_reports_timeout() {
        let stream = EventStream::new(1);
        let err = stream.recv_timeout(Duration::from_millis(5)).unwrap_err();
        assert!(matches!(
            err,
            ProxError::Execution(ExecutionError::Timeout { duration_ms: 5 })
        ));
    }
}
