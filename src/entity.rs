//! Entity types and identity.
//!
//! An entity is any participant of the proximity network: a device running
//! the engine or a BLE beacon seen by one. Entities are immutable values;
//! updates produce a new `Entity`.

use std::fmt;
use std::hash::{Hash, Hasher};

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value as JsonValue};

use crate::distance::DistanceRange;
use crate::error::ValidationError;

/// Key holding the property map inside an entity's property bag.
pub const PROPERTIES_KEY: &str = "properties";

/// Case-insensitive entity identifier.
///
/// Ids are normalized to lower case on construction, so comparison and
/// hashing are case-insensitive.
///
/// # Examples
///
/// ```
/// use proxmesh::EntityId;
///
/// assert_eq!(EntityId::new("Phone-A"), EntityId::new("phone-a"));
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub struct EntityId(String);

impl EntityId {
    /// Creates an id, normalizing case.
    #[must_use]
    pub fn new(id: impl AsRef<str>) -> Self {
        Self(id.as_ref().trim().to_lowercase())
    }

    /// Returns the normalized id.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Returns true if the id is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Splits a beacon id of the form `uuid[:major[:minor]]` into its tokens.
    pub fn tokens(&self) -> impl Iterator<Item = &str> {
        self.0.split(':').filter(|t| !t.is_empty())
    }
}

impl fmt::Display for EntityId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<String> for EntityId {
    fn from(value: String) -> Self {
        Self::new(value)
    }
}

impl From<&str> for EntityId {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

impl From<EntityId> for String {
    fn from(id: EntityId) -> Self {
        id.0
    }
}

/// Kind of network participant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EntityType {
    /// A device running the engine.
    Device,
    /// A BLE beacon, identified as `uuid:major:minor`.
    BleBeacon,
}

impl fmt::Display for EntityType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Device => write!(f, "DEVICE"),
            Self::BleBeacon => write!(f, "BLE_BEACON"),
        }
    }
}

/// A network participant.
///
/// Equality and hashing use the id only.
///
/// # Examples
///
/// ```
/// use proxmesh::{DistanceRange, Entity, EntityType};
/// use serde_json::json;
///
/// let phone = Entity::new("phone-a", EntityType::Device)
///     .with_properties(json!({"properties": {"role": "guide"}}))
///     .unwrap();
/// assert_eq!(phone.property("role"), Some(&json!("guide")));
/// assert_eq!(phone.distance, DistanceRange::Unknown);
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(try_from = "EntityRecord", into = "EntityRecord")]
pub struct Entity {
    /// Normalized identifier.
    pub id: EntityId,
    /// Participant kind.
    pub entity_type: EntityType,
    /// Distance attached by whoever observed this entity.
    pub distance: DistanceRange,
    properties: Map<String, JsonValue>,
}

impl Entity {
    /// Creates an entity with an empty property map and `Unknown` distance.
    #[must_use]
    pub fn new(id: impl Into<EntityId>, entity_type: EntityType) -> Self {
        Self {
            id: id.into(),
            entity_type,
            distance: DistanceRange::Unknown,
            properties: empty_bag(),
        }
    }

    /// Like [`Entity::new`] but rejects an empty id.
    pub fn try_new(id: impl Into<EntityId>, entity_type: EntityType) -> Result<Self, ValidationError> {
        let id = id.into();
        if id.is_empty() {
            return Err(ValidationError::EmptyEntityId);
        }
        Ok(Self::new(id, entity_type))
    }

    /// Creates a beacon entity from its identifiers and ranged distance.
    #[must_use]
    pub fn beacon(uuid: &str, major: u16, minor: u16, distance: DistanceRange) -> Self {
        Self::new(format!("{uuid}:{major}:{minor}"), EntityType::BleBeacon).with_distance(distance)
    }

    /// Replaces the property bag.
    ///
    /// The bag must be an object with exactly one key, `"properties"`, whose
    /// value is itself an object.
    pub fn with_properties(mut self, bag: JsonValue) -> Result<Self, ValidationError> {
        self.properties = validate_bag(bag)?;
        Ok(self)
    }

    /// Replaces the property map, wrapping it into a bag.
    #[must_use]
    pub fn with_property_map(mut self, map: Map<String, JsonValue>) -> Self {
        self.properties = wrap_properties(map);
        self
    }

    /// Sets the observed distance.
    #[must_use]
    pub fn with_distance(mut self, distance: DistanceRange) -> Self {
        self.distance = distance;
        self
    }

    /// The whole property bag (`{"properties": {...}}`).
    #[must_use]
    pub const fn properties(&self) -> &Map<String, JsonValue> {
        &self.properties
    }

    /// The inner property map.
    #[must_use]
    pub fn property_map(&self) -> Option<&Map<String, JsonValue>> {
        self.properties.get(PROPERTIES_KEY).and_then(JsonValue::as_object)
    }

    /// Looks up a top-level property by name.
    #[must_use]
    pub fn property(&self, name: &str) -> Option<&JsonValue> {
        self.property_map().and_then(|m| m.get(name))
    }

    /// Returns true if this is a BLE beacon.
    #[must_use]
    pub fn is_beacon(&self) -> bool {
        self.entity_type == EntityType::BleBeacon
    }
}

impl PartialEq for Entity {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for Entity {}

impl Hash for Entity {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.id.hash(state);
    }
}

impl fmt::Display for Entity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}({})", self.id, self.entity_type)
    }
}

/// Wraps a property map into a bag.
#[must_use]
pub fn wrap_properties(map: Map<String, JsonValue>) -> Map<String, JsonValue> {
    let mut bag = Map::new();
    bag.insert(PROPERTIES_KEY.to_string(), JsonValue::Object(map));
    bag
}

fn empty_bag() -> Map<String, JsonValue> {
    wrap_properties(Map::new())
}

pub(crate) fn validate_bag(bag: JsonValue) -> Result<Map<String, JsonValue>, ValidationError> {
    let JsonValue::Object(map) = bag else {
        return Err(ValidationError::InvalidPropertyBag { keys: Vec::new() });
    };
    let valid = map.len() == 1 && map.get(PROPERTIES_KEY).is_some_and(JsonValue::is_object);
    if valid {
        Ok(map)
    } else {
        Err(ValidationError::InvalidPropertyBag {
            keys: map.keys().cloned().collect(),
        })
    }
}

/// Wire representation of an entity.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct EntityRecord {
    entity_id: EntityId,
    entity_type: EntityType,
    #[serde(default)]
    distance_range: DistanceRange,
    #[serde(default = "default_bag_value")]
    properties: JsonValue,
}

fn default_bag_value() -> JsonValue {
    JsonValue::Object(empty_bag())
}

impl TryFrom<EntityRecord> for Entity {
    type Error = ValidationError;

    fn try_from(record: EntityRecord) -> Result<Self, Self::Error> {
        Entity::try_new(record.entity_id, record.entity_type)?
            .with_distance(record.distance_range)
            .with_properties(record.properties)
    }
}

impl From<Entity> for EntityRecord {
    fn from(entity: Entity) -> Self {
        Self {
            entity_id: entity.id,
            entity_type: entity.entity_type,
            distance_range: entity.distance,
            properties: JsonValue::Object(entity.properties),
        }
    }
}
