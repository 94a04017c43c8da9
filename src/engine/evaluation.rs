//! Evaluation tasks: proximity, geofence, group and check-in/out.
//!
//! Every `evaluate_*` method schedules one task. The task takes a
//! [`Snapshot`](super::Snapshot) first and works on it only.

use std::sync::Arc;

use serde_json::{Map, Value as JsonValue};
use tracing::{debug, warn};

use crate::distance::{fuse_distance, DistanceRange};
use crate::entity::{Entity, PROPERTIES_KEY};
use crate::events::{EntityEvent, ErrorEvent, GroupEvent, SubscriptionCallback};
use crate::group::Group;
use crate::message::{Channel, MessageBody};
use crate::subscription::{Subscription, SubscriptionKind};

use super::{Inner, TimerKey};

/// Delivers events to the (possibly absent) application sink.
pub(super) struct Notifier {
    callback: Option<Arc<dyn SubscriptionCallback>>,
    log_id: String,
}

impl Notifier {
    pub(super) fn new(callback: Option<Arc<dyn SubscriptionCallback>>, log_id: &str) -> Self {
        Self {
            callback,
            log_id: log_id.to_string(),
        }
    }

    fn entity(
        &self,
        subscription: &Subscription,
        event: EntityEvent,
        e1: &Entity,
        e2: &Entity,
        distance: DistanceRange,
    ) {
        debug!(
            log_id = %self.log_id,
            subscription = %subscription.id(),
            event = ?event,
            e1 = %e1.id,
            e2 = %e2.id,
            distance = %distance,
            "entity event"
        );
        if let Some(cb) = &self.callback {
            cb.on_entity_event(subscription, event, e1, e2, distance);
        }
    }

    fn group(&self, subscription: &Subscription, event: GroupEvent, entity: &Entity, group: &Group) {
        debug!(
            log_id = %self.log_id,
            subscription = %subscription.id(),
            event = ?event,
            entity_id = %entity.id,
            group = %group,
            "group event"
        );
        if let Some(cb) = &self.callback {
            cb.on_group_event(subscription, event, entity, group);
        }
    }

    fn error(&self, subscription: &Subscription, error: ErrorEvent) {
        warn!(log_id = %self.log_id, subscription = %subscription.id(), error = %error, "subscription error");
        if let Some(cb) = &self.callback {
            cb.on_subscription_error(subscription, error);
        }
    }
}

enum Transition {
    Entry,
    Exit,
    Full,
    Unchanged,
}

/// Applies one observation to a geofence subscription's detected set.
///
/// Entry when an absent candidate is within the radius, exit when a present
/// one moved beyond it. The detected set is checked and updated atomically;
/// events fire after its lock is released.
fn geofence_transition(
    notify: &Notifier,
    subscription: &Subscription,
    center: &Entity,
    radius: DistanceRange,
    candidate: &Entity,
    observed: DistanceRange,
) {
    let transition = subscription.with_detected(|detected| {
        if detected.contains(&candidate.id) {
            if observed > radius {
                detected.remove(&candidate.id);
                Transition::Exit
            } else {
                Transition::Unchanged
            }
        } else if observed <= radius {
            if detected.insert(candidate.id.clone()) {
                Transition::Entry
            } else {
                Transition::Full
            }
        } else {
            Transition::Unchanged
        }
    });

    match transition {
        Transition::Entry => {
            notify.entity(subscription, EntityEvent::GeofenceEntry, center, candidate, observed);
        }
        Transition::Exit => {
            notify.entity(subscription, EntityEvent::GeofenceExit, center, candidate, observed);
        }
        Transition::Full => notify.error(subscription, ErrorEvent::EntitySizeExceeded),
        Transition::Unchanged => {}
    }
}

/// Rebuilds an entity from a wire property bag, tolerating a bare map.
fn with_bag(entity: &Entity, bag: Map<String, JsonValue>) -> Entity {
    let base = Entity::new(entity.id.clone(), entity.entity_type);
    if bag.contains_key(PROPERTIES_KEY) {
        match base.clone().with_properties(JsonValue::Object(bag)) {
            Ok(old) => old,
            Err(err) => {
                debug!(entity_id = %entity.id, error = %err, "malformed old properties");
                base
            }
        }
    } else {
        base.with_property_map(bag)
    }
}

impl Inner {
    /// Fires `ProximityUpdate` for every proximity subscription pairing
    /// `e1` and `e2`, in either order.
    pub(super) fn evaluate_proximity(
        self: &Arc<Self>,
        e1: Entity,
        e2: Entity,
        distance: DistanceRange,
        log_id: String,
    ) {
        if e1.id == e2.id {
            return;
        }
        self.spawn("proximity", move |inner| {
            let snap = inner.snapshot();
            let notify = snap.notifier(&log_id);
            for subscription in &snap.proximity {
                let (tracked, Some(other)) = subscription.groups() else {
                    continue;
                };
                let forward = tracked.evaluate(&e1) && other.evaluate(&e2);
                if forward || (tracked.evaluate(&e2) && other.evaluate(&e1)) {
                    notify.entity(subscription, EntityEvent::ProximityUpdate, &e1, &e2, distance);
                }
            }
        });
    }

    /// Estimates the distance to `peer` from the beacons we both see.
    ///
    /// With proximity advertising on, the estimate goes to the peer as a
    /// `PROXIMITY_UPDATE`; otherwise it is evaluated locally. Either way it
    /// feeds device-to-device geofencing.
    pub(super) fn evaluate_proximity_d2d(self: &Arc<Self>, peer: Entity, peer_beacons: Vec<Entity>, log_id: String) {
        if peer_beacons.is_empty() {
            return;
        }
        self.spawn("proximity_d2d", move |inner| {
            let me = inner.self_entity();
            if peer.id == me.id {
                return;
            }
            let mine = inner.beacons.snapshot();
            let common: Vec<Entity> = peer_beacons
                .into_iter()
                .filter(|b| mine.iter().any(|m| m.id == b.id))
                .collect();
            if common.is_empty() {
                return;
            }

            let fused = fuse_distance(&common, &mine);
            debug!(log_id = %log_id, peer = %peer.id, distance = %fused, "fused peer distance");
            if inner.advertise().proximity_changes_enabled {
                let out_log_id = inner.new_log_id();
                inner.publish(
                    &Channel::Entity(peer.id.clone()),
                    MessageBody::ProximityUpdate {
                        entity1: me.clone(),
                        entity2: peer.clone(),
                        distance_range: fused,
                    },
                    out_log_id,
                );
            } else {
                inner.evaluate_proximity(me.clone(), peer.clone(), fused, log_id.clone());
            }
            inner.evaluate_geofence_d2d(me, peer, fused, log_id);
        });
    }

    /// Beacon-anchored geofencing for a beacon report from `sender`.
    pub(super) fn evaluate_geofence(self: &Arc<Self>, sender: Entity, beacons: Vec<Entity>, log_id: String) {
        self.spawn("geofence", move |inner| {
            let snap = inner.snapshot();
            let notify = snap.notifier(&log_id);
            for subscription in &snap.geofence {
                let SubscriptionKind::Geofence { center, group, radius } = subscription.kind() else {
                    continue;
                };

                if sender == *center {
                    for beacon in beacons.iter().filter(|b| group.evaluate(b)) {
                        geofence_transition(&notify, subscription, center, *radius, beacon, beacon.distance);
                    }
                } else if group.evaluate(&sender) {
                    if beacons.is_empty() {
                        // Co-presence without beacon evidence.
                        geofence_transition(
                            &notify,
                            subscription,
                            center,
                            *radius,
                            &sender,
                            DistanceRange::SameWifi,
                        );
                    } else {
                        for beacon in beacons.iter().filter(|b| b.id == center.id) {
                            geofence_transition(&notify, subscription, center, *radius, &sender, beacon.distance);
                        }
                    }
                }
            }
        });
    }

    /// Device-to-device geofencing: whichever of `e1`/`e2` is a center, the
    /// other is the candidate.
    pub(super) fn evaluate_geofence_d2d(
        self: &Arc<Self>,
        e1: Entity,
        e2: Entity,
        distance: DistanceRange,
        log_id: String,
    ) {
        self.spawn("geofence_d2d", move |inner| {
            let snap = inner.snapshot();
            let notify = snap.notifier(&log_id);
            for subscription in &snap.geofence {
                let SubscriptionKind::Geofence { center, group, radius } = subscription.kind() else {
                    continue;
                };
                let candidate = if e1 == *center {
                    &e2
                } else if e2 == *center {
                    &e1
                } else {
                    continue;
                };
                if group.evaluate(candidate) {
                    geofence_transition(&notify, subscription, center, *radius, candidate, distance);
                }
            }
        });
    }

    /// Join/leave detection for a property change of `entity`.
    ///
    /// Join and leave are two independent predicate tests.
    pub(super) fn evaluate_group(
        self: &Arc<Self>,
        entity: Entity,
        old_properties: Map<String, JsonValue>,
        log_id: String,
    ) {
        self.spawn("group", move |inner| {
            let snap = inner.snapshot();
            if snap.group.is_empty() {
                return;
            }
            let notify = snap.notifier(&log_id);
            let old = with_bag(&entity, old_properties);
            for subscription in &snap.group {
                let (group, _) = subscription.groups();
                let was = group.evaluate(&old);
                let is = group.evaluate(&entity);
                if !was && is {
                    notify.group(subscription, GroupEvent::GroupJoin, &entity, group);
                }
                if !is && was {
                    notify.group(subscription, GroupEvent::GroupLeave, &entity, group);
                }
            }
        });
    }

    pub(super) fn evaluate_check_in(self: &Arc<Self>, entity: Entity, log_id: String) {
        self.spawn("check_in", move |inner| {
            let snap = inner.snapshot();
            if entity.id == snap.self_entity.id {
                return;
            }
            let notify = snap.notifier(&log_id);
            for subscription in &snap.group {
                let (group, _) = subscription.groups();
                if group.evaluate(&entity) {
                    notify.group(subscription, GroupEvent::CheckIn, &entity, group);
                }
            }
        });
    }

    /// Confirmed check-outs fire at once and end any pending one;
    /// unconfirmed ones wait for the grace period unless a property update
    /// from the entity arrives first.
    pub(super) fn evaluate_check_out(self: &Arc<Self>, entity: Entity, valid: bool, log_id: String) {
        if !valid {
            self.arm_checkout(entity, log_id);
            return;
        }
        self.cancel_checkout(&entity);
        self.fire_check_out(entity, log_id);
    }

    fn fire_check_out(self: &Arc<Self>, entity: Entity, log_id: String) {
        self.spawn("check_out", move |inner| {
            let snap = inner.snapshot();
            let notify = snap.notifier(&log_id);
            for subscription in &snap.group {
                let (group, _) = subscription.groups();
                if group.evaluate(&entity) {
                    notify.group(subscription, GroupEvent::CheckOut, &entity, group);
                }
            }
        });
    }

    fn arm_checkout(self: &Arc<Self>, entity: Entity, log_id: String) {
        let id = entity.id.clone();
        let weak = Arc::downgrade(self);
        let armed = self.timers.schedule(
            TimerKey::Checkout(id.clone()),
            self.config.checkout_grace,
            move || {
                if let Some(inner) = weak.upgrade() {
                    debug!(entity_id = %entity.id, "check-out grace expired");
                    inner.fire_check_out(entity, log_id);
                }
            },
        );
        match armed {
            Ok(true) => debug!(entity_id = %id, "check-out pending"),
            Ok(false) => debug!(entity_id = %id, "check-out already pending"),
            Err(err) => warn!(entity_id = %id, error = %err, "cannot arm check-out timer"),
        }
    }

    /// Drops a pending check-out: the entity is still around.
    pub(super) fn cancel_checkout(&self, entity: &Entity) {
        if self.timers.cancel(&TimerKey::Checkout(entity.id.clone())) {
            debug!(entity_id = %entity.id, "pending check-out cancelled");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entity::EntityType;
    use crate::events::EventPayload;
    use crate::stream::EventStream;
    use crate::subscription::MAX_DETECTED_ENTITIES;
    use serde_json::json;

    fn notifier() -> (Notifier, Arc<EventStream>) {
        let stream = Arc::new(EventStream::new(128));
        let cb: Arc<dyn SubscriptionCallback> = stream.clone();
        (Notifier::new(Some(cb), "test"), stream)
    }

    #[test]
    fn test_transition_entry_is_not_repeated() {
        let (notify, events) = notifier();
        let center = Entity::new("center", EntityType::Device);
        let sub = Subscription::geofence(center.clone(), Group::new("all"), DistanceRange::Near);
        let peer = Entity::new("peer", EntityType::Device);

        geofence_transition(&notify, &sub, &center, DistanceRange::Near, &peer, DistanceRange::NextTo);
        geofence_transition(&notify, &sub, &center, DistanceRange::Near, &peer, DistanceRange::Immediate);
        assert_eq!(events.len(), 1);
        assert_eq!(sub.detected().len(), 1);

        geofence_transition(&notify, &sub, &center, DistanceRange::Near, &peer, DistanceRange::Far);
        let recorded = events.drain();
        assert_eq!(recorded[0].entity_event(), Some(EntityEvent::GeofenceEntry));
        assert_eq!(recorded[1].entity_event(), Some(EntityEvent::GeofenceExit));
        assert!(sub.detected().is_empty());
    }

    #[test]
    fn test_transition_outside_while_absent_is_noop() {
        let (notify, events) = notifier();
        let center = Entity::new("center", EntityType::Device);
        let sub = Subscription::geofence(center.clone(), Group::new("all"), DistanceRange::Near);
        let peer = Entity::new("peer", EntityType::Device);
        geofence_transition(&notify, &sub, &center, DistanceRange::Near, &peer, DistanceRange::Far);
        assert!(events.is_empty());
    }

    #[test]
    fn test_transition_reports_full_set() {
        let (notify, events) = notifier();
        let center = Entity::new("center", EntityType::Device);
        let sub = Subscription::geofence(center.clone(), Group::new("all"), DistanceRange::Far);
        for i in 0..=MAX_DETECTED_ENTITIES {
            let peer = Entity::new(format!("peer-{i}"), EntityType::Device);
            geofence_transition(&notify, &sub, &center, DistanceRange::Far, &peer, DistanceRange::Near);
        }
        assert_eq!(sub.detected().len(), MAX_DETECTED_ENTITIES);
        let last = events.drain().pop().unwrap();
        assert_eq!(last.error_event(), Some(ErrorEvent::EntitySizeExceeded));
    }

    #[test]
    fn test_entry_event_carries_center_and_candidate() {
        let (notify, events) = notifier();
        let center = Entity::new("center", EntityType::Device);
        let sub = Subscription::geofence(center.clone(), Group::new("all"), DistanceRange::Near);
        let peer = Entity::new("peer", EntityType::Device);
        geofence_transition(&notify, &sub, &center, DistanceRange::Near, &peer, DistanceRange::Near);
        match events.try_recv().unwrap().payload {
            EventPayload::Entity { e1, e2, distance, .. } => {
                assert_eq!(e1.id, center.id);
                assert_eq!(e2.id, peer.id);
                assert_eq!(distance, DistanceRange::Near);
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_absent_sink_is_noop() {
        let notify = Notifier::new(None, "");
        let sub = Subscription::group(Group::new("g"));
        notify.error(&sub, ErrorEvent::NotValid);
    }

    #[test]
    fn test_with_bag_accepts_bag_or_bare_map() {
        let e = Entity::new("a", EntityType::Device);
        let bag = json!({"properties": {"x": 1}}).as_object().cloned().unwrap();
        assert_eq!(with_bag(&e, bag).property("x"), Some(&json!(1)));
        let bare = json!({"x": 2}).as_object().cloned().unwrap();
        assert_eq!(with_bag(&e, bare).property("x"), Some(&json!(2)));
    }
}
