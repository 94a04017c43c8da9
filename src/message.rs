//! Network messages and channels.
//!
//! Messages travel as JSON objects of the form
//! `{"message": {"sender": .., "msg_type": .., "log_id": .., ...}}`.
//! Decoding happens once at the boundary; the engine only ever sees typed
//! [`Message`] values.

use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value as JsonValue};

use crate::distance::DistanceRange;
use crate::entity::{Entity, EntityId};
use crate::error::TransportError;
use crate::group::Group;

/// Publish/subscribe channels used by the engine.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Channel {
    /// Presence announcements and sync requests.
    Broadcast,
    /// Beacon reports.
    Proximity,
    /// Property updates.
    Group,
    /// Private channel of one entity, named by its id.
    Entity(EntityId),
    /// Single-use reply channel of a sync request.
    Reply(String),
}

impl Channel {
    /// Topic name on the wire.
    #[must_use]
    pub fn name(&self) -> &str {
        match self {
            Self::Broadcast => "BROADCAST",
            Self::Proximity => "PROXIMITY",
            Self::Group => "GROUP",
            Self::Entity(id) => id.as_str(),
            Self::Reply(topic) => topic,
        }
    }

    /// The shared topics every engine listens to.
    #[must_use]
    pub fn shared() -> [Self; 3] {
        [Self::Broadcast, Self::Proximity, Self::Group]
    }
}

impl fmt::Display for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Message kinds and their payloads.
#[allow(missing_docs)]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "msg_type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MessageBody {
    CheckIn {
        entity: Entity,
    },
    CheckOut {
        entity: Entity,
        /// `false` when the sender lost connectivity rather than leaving.
        valid: bool,
    },
    PropertiesUpdate {
        entity: Entity,
        #[serde(default)]
        old_properties: Map<String, JsonValue>,
    },
    ProximityUpdate {
        entity1: Entity,
        entity2: Entity,
        distance_range: DistanceRange,
    },
    ProxBeacons {
        entity: Entity,
        #[serde(with = "beacon_list")]
        beacons: Vec<Entity>,
    },
    #[serde(rename = "SYNC_REQ")]
    SyncRequest {
        topic_reply: String,
        #[serde(with = "beacon_list")]
        beacons: Vec<Entity>,
        group: Group,
        distance_range: DistanceRange,
    },
    #[serde(rename = "SYNC_RESP")]
    SyncResponse {
        entity: Entity,
    },
}

impl MessageBody {
    /// Wire name of the kind.
    #[must_use]
    pub const fn kind(&self) -> &'static str {
        match self {
            Self::CheckIn { .. } => "CHECK_IN",
            Self::CheckOut { .. } => "CHECK_OUT",
            Self::PropertiesUpdate { .. } => "PROPERTIES_UPDATE",
            Self::ProximityUpdate { .. } => "PROXIMITY_UPDATE",
            Self::ProxBeacons { .. } => "PROX_BEACONS",
            Self::SyncRequest { .. } => "SYNC_REQ",
            Self::SyncResponse { .. } => "SYNC_RESP",
        }
    }
}

/// A typed network message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub sender: EntityId,
    /// Correlation id carried into the logs of everything this message causes.
    #[serde(default)]
    pub log_id: String,
    #[serde(flatten)]
    pub body: MessageBody,
}

#[derive(Deserialize)]
struct Envelope {
    message: Message,
}

impl Message {
    #[must_use]
    pub fn new(sender: EntityId, log_id: impl Into<String>, body: MessageBody) -> Self {
        Self {
            sender,
            log_id: log_id.into(),
            body,
        }
    }

    /// Encodes into the enveloped JSON form.
    pub fn to_json(&self) -> Result<Vec<u8>, TransportError> {
        let envelope = EnvelopeRef { message: self };
        serde_json::to_vec(&envelope).map_err(|e| TransportError::EncodeFailed {
            message: e.to_string(),
        })
    }

    /// Decodes the enveloped JSON form.
    pub fn from_json(bytes: &[u8]) -> Result<Self, TransportError> {
        serde_json::from_slice::<Envelope>(bytes)
            .map(|env| env.message)
            .map_err(|e| TransportError::DecodeFailed {
                message: e.to_string(),
            })
    }

    #[must_use]
    pub const fn kind(&self) -> &'static str {
        self.body.kind()
    }
}

#[derive(Serialize)]
struct EnvelopeRef<'a> {
    message: &'a Message,
}

/// Beacons travel as `{"beacon_id", "distance_range"}` pairs.
mod beacon_list {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};

    use crate::distance::DistanceRange;
    use crate::entity::{Entity, EntityId, EntityType};

    #[derive(Serialize, Deserialize)]
    struct BeaconReport {
        beacon_id: EntityId,
        #[serde(default)]
        distance_range: DistanceRange,
    }

    pub fn serialize<S: Serializer>(beacons: &[Entity], serializer: S) -> Result<S::Ok, S::Error> {
        let reports: Vec<BeaconReport> = beacons
            .iter()
            .map(|b| BeaconReport {
                beacon_id: b.id.clone(),
                distance_range: b.distance,
            })
            .collect();
        reports.serialize(serializer)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<Entity>, D::Error> {
        let reports = Vec::<BeaconReport>::deserialize(deserializer)?;
        reports
            .into_iter()
            .map(|r| {
                Entity::try_new(r.beacon_id, EntityType::BleBeacon)
                    .map(|e| e.with_distance(r.distance_range))
                    .map_err(serde::de::Error::custom)
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entity::EntityType;
    use serde_json::json;

    #[test]
    fn test_check_out_wire_shape() {
        let me = Entity::new("phone-a", EntityType::Device);
        let msg = Message::new(
            me.id.clone(),
            "phone-a1700000000",
            MessageBody::CheckOut {
                entity: me,
                valid: false,
            },
        );
        let value: JsonValue = serde_json::from_slice(&msg.to_json().unwrap()).unwrap();
        let inner = &value["message"];
        assert_eq!(inner["sender"], json!("phone-a"));
        assert_eq!(inner["msg_type"], json!("CHECK_OUT"));
        assert_eq!(inner["valid"], json!(false));
        assert_eq!(inner["entity"]["entity_id"], json!("phone-a"));
    }

    #[test]
    fn test_decode_prox_beacons() {
        let raw = json!({
            "message": {
                "sender": "Phone-B",
                "msg_type": "PROX_BEACONS",
                "log_id": "x",
                "entity": {"entity_id": "phone-b", "entity_type": "DEVICE"},
                "beacons": [{"beacon_id": "U:1:2", "distance_range": "NEAR"}]
            }
        });
        let msg = Message::from_json(raw.to_string().as_bytes()).unwrap();
        assert_eq!(msg.sender.as_str(), "phone-b");
        match msg.body {
            MessageBody::ProxBeacons { beacons, .. } => {
                assert_eq!(beacons.len(), 1);
                assert_eq!(beacons[0].id.as_str(), "u:1:2");
                assert_eq!(beacons[0].distance, DistanceRange::Near);
                assert!(beacons[0].is_beacon());
            }
            other => panic!("unexpected body {other:?}"),
        }
    }

    #[test]
    fn test_sync_request_carries_group() {
        let group = Group::new("guides").with_entity_type(EntityType::Device);
        let msg = Message::new(
            EntityId::new("a"),
            "",
            MessageBody::SyncRequest {
                topic_reply: "r-1".to_string(),
                beacons: vec![Entity::beacon("u", 1, 1, DistanceRange::Immediate)],
                group: group.clone(),
                distance_range: DistanceRange::Near,
            },
        );
        let back = Message::from_json(&msg.to_json().unwrap()).unwrap();
        assert_eq!(back, msg);
        assert_eq!(back.kind(), "SYNC_REQ");
    }

    #[test]
    fn test_malformed_payloads_are_decode_errors() {
        for raw in [
            "not json",
            r#"{"message": {"sender": "a", "msg_type": "TELEPORT"}}"#,
            r#"{"message": {"sender": "a", "msg_type": "CHECK_IN"}}"#,
            r#"{"sender": "a", "msg_type": "CHECK_IN"}"#,
        ] {
            assert!(matches!(
                Message::from_json(raw.as_bytes()),
                Err(TransportError::DecodeFailed { .. })
            ));
        }
    }

    #[test]
    fn test_channel_names() {
        assert_eq!(Channel::Broadcast.name(), "BROADCAST");
        assert_eq!(Channel::Entity(EntityId::new("Phone")).name(), "phone");
        assert_eq!(Channel::Reply("42-req".to_string()).to_string(), "42-req");
    }
}
