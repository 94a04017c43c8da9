//! Events delivered to the hosting application.
//!
//! The engine reports through a [`SubscriptionCallback`]. Three event families
//! exist: entity (proximity and geofence), group (presence and membership)
//! and subscription errors. Point-of-interest notifications use a fourth,
//! optional hook.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::distance::DistanceRange;
use crate::entity::Entity;
use crate::group::Group;
use crate::poi::Poi;
use crate::subscription::{Subscription, SubscriptionId};

/// Proximity and geofence events.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EntityEvent {
    /// Distance between two entities changed.
    ProximityUpdate,
    /// An entity entered a geofence.
    GeofenceEntry,
    /// An entity left a geofence.
    GeofenceExit,
}

/// Presence and membership events.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum GroupEvent {
    /// An entity entered the network.
    CheckIn,
    /// An entity left the network.
    CheckOut,
    /// An entity's properties changed so that it now belongs to the group.
    GroupJoin,
    /// An entity's properties changed so that it no longer belongs to the group.
    GroupLeave,
}

/// Subscription rejections.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorEvent {
    /// A geofence subscription already tracks the maximum number of entities.
    EntitySizeExceeded,
    /// The maximum number of geofence subscriptions is registered.
    NumberLimitExceeded,
    /// The anchor entity is neither a beacon nor the local entity.
    NotValid,
}

impl ErrorEvent {
    /// Human-readable description.
    #[must_use]
    pub const fn message(self) -> &'static str {
        match self {
            Self::EntitySizeExceeded => "geofence subscription reached its maximum number of tracked entities",
            Self::NumberLimitExceeded => "maximum number of geofence subscriptions reached",
            Self::NotValid => "anchor entity must be a BLE beacon or the local entity",
        }
    }
}

impl fmt::Display for ErrorEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.message())
    }
}

/// Application sink for engine events.
///
/// Called from evaluation worker threads, possibly concurrently. Keep
/// implementations short; a panic is contained to the task that raised it.
pub trait SubscriptionCallback: Send + Sync {
    /// A proximity update or geofence transition between `e1` and `e2`.
    fn on_entity_event(
        &self,
        subscription: &Subscription,
        event: EntityEvent,
        e1: &Entity,
        e2: &Entity,
        distance: DistanceRange,
    );

    /// A check-in, check-out, join or leave of `entity` for `group`.
    fn on_group_event(&self, subscription: &Subscription, event: GroupEvent, entity: &Entity, group: &Group);

    /// `subscription` was rejected or could not track another entity.
    fn on_subscription_error(&self, subscription: &Subscription, error: ErrorEvent);

    /// The local entity entered or left a registered point of interest.
    fn on_poi_event(&self, _entity: &Entity, _poi: &Poi, _entered: bool) {}
}

/// Serializable snapshot of one delivered event.
#[allow(missing_docs)]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EventPayload {
    Entity {
        event: EntityEvent,
        e1: Entity,
        e2: Entity,
        distance: DistanceRange,
    },
    Group {
        event: GroupEvent,
        entity: Entity,
        group: Group,
    },
    Error {
        error: ErrorEvent,
    },
    Poi {
        entity: Entity,
        poi: Poi,
        entered: bool,
    },
}

/// A recorded event.
#[allow(missing_docs)]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventRecord {
    pub event_id: Uuid,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub subscription_id: Option<SubscriptionId>,
    pub timestamp: DateTime<Utc>,
    pub payload: EventPayload,
}

impl EventRecord {
    #[must_use]
    pub fn new(subscription_id: Option<SubscriptionId>, payload: EventPayload) -> Self {
        Self {
            event_id: Uuid::new_v4(),
            subscription_id,
            timestamp: Utc::now(),
            payload,
        }
    }

    /// The entity event kind, if this is one.
    #[must_use]
    pub fn entity_event(&self) -> Option<EntityEvent> {
        match &self.payload {
            EventPayload::Entity { event, .. } => Some(*event),
            _ => None,
        }
    }

    /// The group event kind, if this is one.
    #[must_use]
    pub fn group_event(&self) -> Option<GroupEvent> {
        match &self.payload {
            EventPayload::Group { event, .. } => Some(*event),
            _ => None,
        }
    }

    /// The error kind, if this is one.
    #[must_use]
    pub fn error_event(&self) -> Option<ErrorEvent> {
        match &self.payload {
            EventPayload::Error { error } => Some(*error),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_event_messages_are_distinct() {
        let all = [
            ErrorEvent::EntitySizeExceeded,
            ErrorEvent::NumberLimitExceeded,
            ErrorEvent::NotValid,
        ];
        for (i, a) in all.iter().enumerate() {
            for b in &all[i + 1..] {
                assert_ne!(a.message(), b.message());
            }
        }
    }

    #[test]
    fn test_record_accessors() {
        let rec = EventRecord::new(
            Some(SubscriptionId::new()),
            EventPayload::Error {
                error: ErrorEvent::NotValid,
            },
        );
        assert_eq!(rec.error_event(), Some(ErrorEvent::NotValid));
        assert_eq!(rec.entity_event(), None);
        assert_eq!(rec.group_event(), None);
    }

    #[test]
    fn test_wire_names() {
        assert_eq!(
            serde_json::to_string(&GroupEvent::CheckOut).unwrap(),
            "\"CHECK_OUT\""
        );
        assert_eq!(
            serde_json::to_string(&EntityEvent::GeofenceEntry).unwrap(),
            "\"GEOFENCE_ENTRY\""
        );
    }
}
