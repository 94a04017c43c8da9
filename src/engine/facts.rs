//! Inbound fact routing.

use std::sync::Arc;

use tracing::{debug, warn};

use crate::distance::DistanceRange;
use crate::message::{Message, MessageBody};
use crate::transport::MAX_MESSAGE_BYTES;

use super::Inner;

impl Inner {
    pub(super) fn handle_payload(self: &Arc<Self>, payload: &[u8]) -> bool {
        if payload.len() > MAX_MESSAGE_BYTES {
            warn!(
                len = payload.len(),
                max = MAX_MESSAGE_BYTES,
                "oversized payload dropped"
            );
            return false;
        }
        match Message::from_json(payload) {
            Ok(message) => {
                self.handle_message(message);
                true
            }
            Err(err) => {
                warn!(error = %err, "undecodable payload dropped");
                false
            }
        }
    }

    pub(super) fn handle_message(self: &Arc<Self>, message: Message) {
        if self.is_stopped() {
            debug!(kind = message.kind(), "fact ignored after stop");
            return;
        }
        let me = self.self_entity();
        if message.sender == me.id {
            return;
        }
        debug!(
            kind = message.kind(),
            sender = %message.sender,
            log_id = %message.log_id,
            "fact received"
        );

        let Message { log_id, body, .. } = message;
        match body {
            MessageBody::CheckIn { entity } => {
                self.evaluate_proximity(me, entity.clone(), DistanceRange::SameWifi, log_id.clone());
                self.evaluate_check_in(entity, log_id);
            }
            MessageBody::CheckOut { entity, valid } => {
                self.evaluate_check_out(entity, valid, log_id);
            }
            MessageBody::PropertiesUpdate {
                entity,
                old_properties,
            } => {
                self.cancel_checkout(&entity);
                self.evaluate_group(entity, old_properties, log_id);
            }
            MessageBody::ProximityUpdate {
                entity1,
                entity2,
                distance_range,
            } => {
                self.evaluate_proximity(entity1.clone(), entity2.clone(), distance_range, log_id.clone());
                self.evaluate_geofence_d2d(entity1, entity2, distance_range, log_id);
            }
            MessageBody::ProxBeacons { entity, beacons } => {
                self.evaluate_geofence(entity.clone(), beacons.clone(), log_id.clone());
                if beacons.is_empty() {
                    return;
                }
                for beacon in &beacons {
                    self.evaluate_proximity(entity.clone(), beacon.clone(), beacon.distance, log_id.clone());
                }
                self.evaluate_proximity_d2d(entity, beacons, log_id);
            }
            MessageBody::SyncRequest {
                topic_reply,
                beacons,
                group,
                distance_range,
            } => {
                self.answer_query(topic_reply, beacons, group, distance_range);
            }
            MessageBody::SyncResponse { entity } => {
                self.collect_reply(entity);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use crate::engine::{EngineConfig, ProximityEngine};
    use crate::entity::{Entity, EntityType};
    use crate::events::GroupEvent;
    use crate::group::Group;
    use crate::message::{Message, MessageBody};
    use crate::transport::{InMemoryTransport, MAX_MESSAGE_BYTES};

    fn engine() -> (ProximityEngine, Arc<crate::stream::EventStream>) {
        let transport = Arc::new(InMemoryTransport::new());
        ProximityEngine::with_event_stream(
            Entity::new("me", EntityType::Device),
            transport,
            EngineConfig::default(),
        )
        .unwrap()
    }

    #[test]
    fn test_own_messages_are_ignored() {
        let (engine, events) = engine();
        engine.subscribe_group_changes(Group::new("all"));
        let me = engine.self_entity();
        engine.handle_message(Message::new(me.id.clone(), "", MessageBody::CheckIn { entity: me }));
        assert!(engine.wait_idle(Duration::from_secs(5)));
        assert!(events.is_empty());
    }

    #[test]
    fn test_check_in_fires_for_matching_groups() {
        let (engine, events) = engine();
        engine.subscribe_group_changes(Group::new("all"));
        engine.subscribe_group_changes(Group::new("beacons").with_entity_type(EntityType::BleBeacon));
        let peer = Entity::new("peer", EntityType::Device);
        engine.handle_message(Message::new(peer.id.clone(), "l1", MessageBody::CheckIn { entity: peer }));
        assert!(engine.wait_idle(Duration::from_secs(5)));
        let recorded = events.drain();
        assert_eq!(recorded.len(), 1);
        assert_eq!(recorded[0].group_event(), Some(GroupEvent::CheckIn));
    }

    #[test]
    fn test_payload_boundary() {
        let (engine, _) = engine();
        assert!(!engine.handle_payload(b"not json"));
        assert!(!engine.handle_payload(br#"{"message": {"sender": "x", "msg_type": "NOPE"}}"#));
        assert!(!engine.handle_payload(&vec![b' '; MAX_MESSAGE_BYTES + 1]));

        let peer = Entity::new("peer", EntityType::Device);
        let bytes = Message::new(peer.id.clone(), "", MessageBody::CheckIn { entity: peer })
            .to_json()
            .unwrap();
        assert!(engine.handle_payload(&bytes));
    }

    #[test]
    fn test_facts_after_stop_are_ignored() {
        let (engine, events) = engine();
        engine.subscribe_group_changes(Group::new("all"));
        engine.stop();
        let peer = Entity::new("peer", EntityType::Device);
        engine.handle_message(Message::new(peer.id.clone(), "", MessageBody::CheckIn { entity: peer }));
        assert!(events.is_empty());
    }
}
