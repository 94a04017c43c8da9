//! # proxmesh - peer-to-peer proximity awareness
//!
//! Mobile nodes exchange presence, distance and property-change messages over
//! a publish/subscribe transport. A local [`ProximityEngine`] on each node
//! evaluates live subscriptions against those facts and fires proximity,
//! geofence and group-membership events to the hosting application.
//!
//! ## Core Concepts
//!
//! - **Entity**: a device or a BLE beacon taking part in the network
//! - **Group**: a predicate over entity id, type and properties
//! - **Subscription**: a standing request for proximity, geofence or group events
//! - **DistanceRange**: an ordered, coarse distance bucket
//!
//! ## Usage
//!
//! ```rust
//! use proxmesh::{DistanceRange, Entity, EntityType, Group, PropertiesFilter};
//! use serde_json::json;
//!
//! let guide = Entity::new("phone-7", EntityType::Device)
//!     .with_properties(json!({"properties": {"role": "guide", "floor": 2}}))
//!     .unwrap();
//!
//! let guides = Group::new("guides")
//!     .with_entity_type(EntityType::Device)
//!     .with_filter(PropertiesFilter::equals("role", json!("guide")));
//! assert!(guides.evaluate(&guide));
//!
//! let beacon = Entity::beacon("b9407f30", 10, 20, DistanceRange::Near);
//! assert!(Group::new("hall").with_entity_id("b9407f30:10").evaluate(&beacon));
//! assert!(DistanceRange::Immediate < DistanceRange::Near);
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

// Data model
pub mod distance;
pub mod entity;
pub mod error;
pub mod filter;
pub mod group;
pub mod poi;
pub mod policy;
pub mod subscription;

// Events and wire
pub mod events;
pub mod message;
pub mod stream;
pub mod transport;

// Evaluation
pub mod engine;
pub mod runtime;

pub use distance::{fuse_distance, DistanceRange};
pub use entity::{Entity, EntityId, EntityType};
pub use error::{ExecutionError, ProxError, ProxResult, TransportError, ValidationError};
pub use filter::{FilterOp, PropertiesFilter};
pub use group::Group;
pub use poi::Poi;
pub use policy::AdvertisePolicy;
pub use subscription::{DetectedEntities, Subscription, SubscriptionId, SubscriptionKind};

pub use events::{
    EntityEvent, ErrorEvent, EventPayload, EventRecord, GroupEvent, SubscriptionCallback,
};
pub use message::{Channel, Message, MessageBody};
pub use stream::EventStream;
pub use transport::{InMemoryTransport, Transport};

pub use engine::{BeaconReading, EngineConfig, ProximityEngine};
pub use runtime::{DeferredTasks, Scheduler, SchedulerConfig};
