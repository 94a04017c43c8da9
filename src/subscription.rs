//! Subscriptions and their per-subscription geofence state.

use std::fmt;
use std::sync::{Arc, Mutex, PoisonError};

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::distance::DistanceRange;
use crate::entity::{Entity, EntityId};
use crate::group::Group;

/// Maximum number of entities a geofence subscription tracks as inside.
pub const MAX_DETECTED_ENTITIES: usize = 50;

/// Unique identifier for a subscription handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SubscriptionId(Uuid);

impl SubscriptionId {
    /// Create a new random subscription id.
    #[must_use]
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Wrap an existing UUID.
    #[must_use]
    pub const fn from_uuid(uuid: Uuid) -> Self {
        Self(uuid)
    }
}

impl Default for SubscriptionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for SubscriptionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// What a subscription watches.
#[allow(missing_docs)]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SubscriptionKind {
    /// Distance updates between members of `tracked` and members of `other`.
    Proximity { tracked: Group, other: Group },

    /// Entry/exit of `group` members around `center` within `radius`.
    Geofence {
        center: Entity,
        group: Group,
        radius: DistanceRange,
    },

    /// Check-in/out and join/leave of `group` members.
    Group { group: Group },
}

impl SubscriptionKind {
    /// Natural-key comparison: two kinds are the same subscription if they
    /// watch the same operands.
    fn same_key(&self, other: &Self) -> bool {
        match (self, other) {
            (
                Self::Proximity { tracked: a1, other: a2 },
                Self::Proximity { tracked: b1, other: b2 },
            ) => a1 == b1 && a2 == b2,
            (
                Self::Geofence { center: c1, group: g1, radius: r1 },
                Self::Geofence { center: c2, group: g2, radius: r2 },
            ) => c1 == c2 && g1 == g2 && r1 == r2,
            (Self::Group { group: a }, Self::Group { group: b }) => a == b,
            _ => false,
        }
    }
}

/// Bounded ordered set of entity ids currently inside a geofence.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DetectedEntities {
    ids: Vec<EntityId>,
}

impl DetectedEntities {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn contains(&self, id: &EntityId) -> bool {
        self.ids.contains(id)
    }

    /// Adds `id` unless the set is full. Returns false when at capacity.
    ///
    /// Adding an id already present is a successful no-op.
    pub fn insert(&mut self, id: EntityId) -> bool {
        if self.ids.contains(&id) {
            return true;
        }
        if self.ids.len() >= MAX_DETECTED_ENTITIES {
            return false;
        }
        self.ids.push(id);
        true
    }

    /// Removes `id`, returning whether it was present.
    pub fn remove(&mut self, id: &EntityId) -> bool {
        match self.ids.iter().position(|x| x == id) {
            Some(pos) => {
                self.ids.remove(pos);
                true
            }
            None => false,
        }
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.ids.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }

    #[must_use]
    pub fn is_full(&self) -> bool {
        self.ids.len() >= MAX_DETECTED_ENTITIES
    }

    pub fn iter(&self) -> impl Iterator<Item = &EntityId> {
        self.ids.iter()
    }
}

#[derive(Debug)]
struct SubscriptionInner {
    id: SubscriptionId,
    kind: SubscriptionKind,
    detected: Mutex<DetectedEntities>,
}

/// A standing request for proximity, geofence or group events.
///
/// Cheap to clone: clones share the same geofence state. Equality is by
/// natural key (the watched operands), not by handle, so an equal value
/// built elsewhere can be used to unsubscribe.
#[derive(Debug, Clone)]
pub struct Subscription {
    inner: Arc<SubscriptionInner>,
}

impl Subscription {
    fn from_kind(kind: SubscriptionKind) -> Self {
        Self {
            inner: Arc::new(SubscriptionInner {
                id: SubscriptionId::new(),
                kind,
                detected: Mutex::new(DetectedEntities::new()),
            }),
        }
    }

    /// Proximity subscription between `tracked` entities and `other` group members.
    #[must_use]
    pub fn proximity(tracked: Group, other: Group) -> Self {
        Self::from_kind(SubscriptionKind::Proximity { tracked, other })
    }

    /// Geofence subscription around `center` with an inclusive `radius`.
    #[must_use]
    pub fn geofence(center: Entity, group: Group, radius: DistanceRange) -> Self {
        Self::from_kind(SubscriptionKind::Geofence { center, group, radius })
    }

    /// Group-change subscription.
    #[must_use]
    pub fn group(group: Group) -> Self {
        Self::from_kind(SubscriptionKind::Group { group })
    }

    #[must_use]
    pub fn id(&self) -> SubscriptionId {
        self.inner.id
    }

    #[must_use]
    pub fn kind(&self) -> &SubscriptionKind {
        &self.inner.kind
    }

    /// Group operands, first and optional second.
    #[must_use]
    pub fn groups(&self) -> (&Group, Option<&Group>) {
        match &self.inner.kind {
            SubscriptionKind::Proximity { tracked, other } => (tracked, Some(other)),
            SubscriptionKind::Geofence { group, .. } => (group, None),
            SubscriptionKind::Group { group } => (group, None),
        }
    }

    /// Snapshot of the ids currently inside the geofence.
    #[must_use]
    pub fn detected(&self) -> DetectedEntities {
        self.with_detected(|d| d.clone())
    }

    pub(crate) fn with_detected<R>(&self, f: impl FnOnce(&mut DetectedEntities) -> R) -> R {
        let mut guard = self.inner.detected.lock().unwrap_or_else(PoisonError::into_inner);
        f(&mut guard)
    }

    /// Returns true if both handles point to the same registration.
    #[must_use]
    pub fn same_handle(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl PartialEq for Subscription {
    fn eq(&self, other: &Self) -> bool {
        self.same_handle(other) || self.inner.kind.same_key(&other.inner.kind)
    }
}

impl fmt::Display for Subscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.inner.kind {
            SubscriptionKind::Proximity { tracked, other } => write!(f, "{tracked} - {other}"),
            SubscriptionKind::Geofence { center, group, radius } => {
                write!(f, "{} - {group} dist: {radius}", center.id)
            }
            SubscriptionKind::Group { group } => write!(f, "{group}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entity::EntityType;

    #[test]
    fn test_detected_insert_is_idempotent() {
        let mut d = DetectedEntities::new();
        assert!(d.insert(EntityId::new("a")));
        assert!(d.insert(EntityId::new("A")));
        assert_eq!(d.len(), 1);
        assert!(d.remove(&EntityId::new("a")));
        assert!(!d.remove(&EntityId::new("a")));
        assert!(d.is_empty());
    }

    #[test]
    fn test_detected_capacity() {
        let mut d = DetectedEntities::new();
        for i in 0..MAX_DETECTED_ENTITIES {
            assert!(d.insert(EntityId::new(format!("e{i}"))));
        }
        assert!(d.is_full());
        assert!(!d.insert(EntityId::new("one-too-many")));
        assert_eq!(d.len(), MAX_DETECTED_ENTITIES);
        assert!(d.insert(EntityId::new("e0")));
    }

    #[test]
    fn test_natural_key_equality() {
        let center = Entity::new("e", EntityType::Device);
        let a = Subscription::geofence(center.clone(), Group::new("g"), DistanceRange::Near);
        let b = Subscription::geofence(center.clone(), Group::new("g"), DistanceRange::Near);
        let c = Subscription::geofence(center, Group::new("g"), DistanceRange::Far);
        assert_ne!(a.id(), b.id());
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_ne!(Subscription::group(Group::new("g")), a);
    }

    #[test]
    fn test_clones_share_detected_state() {
        let s = Subscription::group(Group::new("g"));
        let clone = s.clone();
        s.with_detected(|d| d.insert(EntityId::new("x")));
        assert!(clone.detected().contains(&EntityId::new("x")));
        assert!(clone.same_handle(&s));
    }

    #[test]
    fn test_groups_accessor() {
        let p = Subscription::proximity(Group::new("a"), Group::new("b"));
        let (g1, g2) = p.groups();
        assert_eq!(g1.description, "a");
        assert_eq!(g2.map(|g| g.description.as_str()), Some("b"));
        assert!(Subscription::group(Group::new("c")).groups().1.is_none());
    }
}
