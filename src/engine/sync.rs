//! Network-wide "who is near me" queries.
//!
//! A query broadcasts a `SYNC_REQ` naming a fresh reply channel. Peers that
//! match the group and are close enough answer with `SYNC_RESP` on that
//! channel. Only one query is outstanding at a time; its timer alone ends
//! the wait.

use std::sync::{Arc, PoisonError};
use std::time::Duration;

use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::distance::{fuse_distance, DistanceRange};
use crate::entity::{Entity, EntityType};
use crate::group::Group;
use crate::message::{Channel, MessageBody};

use super::{Inner, TimerKey};

/// The outstanding query.
#[derive(Debug)]
pub(super) struct PendingQuery {
    pub(super) topic: String,
    results: Vec<Entity>,
}

impl Inner {
    pub(super) fn start_query<F>(
        self: &Arc<Self>,
        max_distance: DistanceRange,
        group: Group,
        timeout: Duration,
        on_complete: F,
    ) -> bool
    where
        F: FnOnce(Vec<Entity>) + Send + 'static,
    {
        if self.is_stopped() {
            return false;
        }
        let topic = format!("{}-reqTopic", Uuid::new_v4());
        {
            let mut slot = self.query.lock().unwrap_or_else(PoisonError::into_inner);
            if slot.is_some() {
                debug!("proximity query already outstanding");
                return false;
            }
            *slot = Some(PendingQuery {
                topic: topic.clone(),
                results: Vec::new(),
            });
        }

        let reply = Channel::Reply(topic.clone());
        if let Err(err) = self.transport.subscribe(&reply) {
            warn!(topic = %topic, error = %err, "reply channel subscribe failed");
        }

        let weak = Arc::downgrade(self);
        let armed = self.timers.schedule(TimerKey::SyncQuery, timeout, move || {
            if let Some(inner) = weak.upgrade() {
                let results = inner.finish_query(max_distance);
                on_complete(results);
            }
        });
        if let Err(err) = armed {
            warn!(error = %err, "cannot arm proximity query timer");
            self.query.lock().unwrap_or_else(PoisonError::into_inner).take();
            if let Err(err) = self.transport.unsubscribe(&reply) {
                warn!(topic = %topic, error = %err, "reply channel unsubscribe failed");
            }
            return false;
        }

        let log_id = self.new_log_id();
        info!(topic = %topic, group = %group, max_distance = %max_distance, "proximity query started");
        self.publish(
            &Channel::Broadcast,
            MessageBody::SyncRequest {
                topic_reply: topic,
                beacons: self.beacons.snapshot(),
                group,
                distance_range: max_distance,
            },
            log_id,
        );
        true
    }

    /// Closes the outstanding query and returns its result: the replies
    /// followed by cached beacons within `max_distance`.
    fn finish_query(&self, max_distance: DistanceRange) -> Vec<Entity> {
        let Some(query) = self.query.lock().unwrap_or_else(PoisonError::into_inner).take() else {
            return Vec::new();
        };
        if let Err(err) = self.transport.unsubscribe(&Channel::Reply(query.topic.clone())) {
            warn!(topic = %query.topic, error = %err, "reply channel unsubscribe failed");
        }

        let mut results = query.results;
        results.extend(
            self.beacons
                .snapshot()
                .into_iter()
                .filter(|b| b.distance <= max_distance),
        );
        info!(topic = %query.topic, results = results.len(), "proximity query finished");
        results
    }

    /// Answers a peer's query if we match its group and distance bound.
    pub(super) fn answer_query(
        self: &Arc<Self>,
        topic: String,
        beacons: Vec<Entity>,
        group: Group,
        max_distance: DistanceRange,
    ) {
        if !self.advertise().proximity_changes_enabled {
            debug!(topic = %topic, "query ignored: proximity advertising off");
            return;
        }
        self.spawn("sync_request", move |inner| {
            let me = inner.self_entity();
            if !group.evaluate(&me) {
                return;
            }
            // No beacon in common leaves us at SameWifi.
            let distance = fuse_distance(&beacons, &inner.beacons.snapshot());
            if distance > max_distance {
                return;
            }

            let mut reply = me.with_distance(distance);
            reply.entity_type = EntityType::Device;
            debug!(topic = %topic, distance = %distance, "answering proximity query");
            inner.publish(&Channel::Reply(topic.clone()), MessageBody::SyncResponse { entity: reply }, topic);
        });
    }

    pub(super) fn collect_reply(&self, entity: Entity) {
        let mut slot = self.query.lock().unwrap_or_else(PoisonError::into_inner);
        match slot.as_mut() {
            Some(query) => {
                debug!(entity_id = %entity.id, topic = %query.topic, "query reply collected");
                query.results.push(entity);
            }
            None => debug!(entity_id = %entity.id, "reply without outstanding query"),
        }
    }
}
