//! Group predicates over entities.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::entity::{Entity, EntityId, EntityType};
use crate::filter::PropertiesFilter;

/// A predicate selecting a subset of entities by id, type and properties.
///
/// Every filter is optional; `evaluate` is the conjunction of those present,
/// so `Group::new("anyone")` matches every entity.
///
/// For beacons the id filter is hierarchical over `uuid[:major[:minor]]`:
/// `"u"` matches any major/minor of `u`, `"u:10"` any minor of major 10.
///
/// # Examples
///
/// ```
/// use proxmesh::{Entity, EntityType, Group};
///
/// let museum = Group::new("museum beacons")
///     .with_entity_id("b9407f30:10")
///     .with_entity_type(EntityType::BleBeacon);
///
/// assert!(museum.evaluate(&Entity::new("B9407F30:10:20", EntityType::BleBeacon)));
/// assert!(!museum.evaluate(&Entity::new("b9407f30:11:1", EntityType::BleBeacon)));
/// ```
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct Group {
    /// Free-form label used in logs.
    #[serde(default)]
    pub description: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub entity_id: Option<EntityId>,
    /// `None` matches every type.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub entity_type: Option<EntityType>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub filter: Option<PropertiesFilter>,
}

impl Group {
    /// Creates a group matching every entity.
    #[must_use]
    pub fn new(description: impl Into<String>) -> Self {
        Self {
            description: description.into(),
            ..Self::default()
        }
    }

    /// Creates a group matching exactly one entity.
    #[must_use]
    pub fn single(entity: &Entity) -> Self {
        Self::new(entity.id.to_string())
            .with_entity_id(entity.id.clone())
            .with_entity_type(entity.entity_type)
    }

    /// Restricts the group to one id (or beacon id prefix).
    #[must_use]
    pub fn with_entity_id(mut self, id: impl Into<EntityId>) -> Self {
        let id = id.into();
        self.entity_id = (!id.is_empty()).then_some(id);
        self
    }

    #[must_use]
    pub fn with_entity_type(mut self, entity_type: EntityType) -> Self {
        self.entity_type = Some(entity_type);
        self
    }

    #[must_use]
    pub fn with_filter(mut self, filter: PropertiesFilter) -> Self {
        self.filter = Some(filter);
        self
    }

    /// Tests whether `entity` belongs to the group.
    #[must_use]
    pub fn evaluate(&self, entity: &Entity) -> bool {
        if let Some(id) = &self.entity_id {
            if !id_matches(id, entity) {
                return false;
            }
        }

        if let Some(t) = self.entity_type {
            if t != entity.entity_type {
                return false;
            }
        }

        match &self.filter {
            Some(filter) => entity.property_map().is_some_and(|props| filter.evaluate(props)),
            None => true,
        }
    }
}

impl fmt::Display for Group {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.description)
    }
}

fn id_matches(filter: &EntityId, entity: &Entity) -> bool {
    if entity.entity_type != EntityType::BleBeacon {
        return filter == &entity.id;
    }
    let mut received = entity.id.tokens();
    filter
        .tokens()
        .all(|wanted| received.next().is_some_and(|got| got == wanted))
}
