//! Publish/subscribe transport seam.
//!
//! The engine never talks to a broker directly. Hosts implement
//! [`Transport`] over their broker client and feed inbound payloads back via
//! [`ProximityEngine::handle_payload`](crate::ProximityEngine::handle_payload).

mod memory;

pub use memory::InMemoryTransport;

use crate::entity::Entity;
use crate::error::TransportError;
use crate::message::{Channel, Message};

/// Maximum size of an inbound JSON payload.
pub const MAX_MESSAGE_BYTES: usize = 1024 * 1024; // 1 MiB

/// Outbound side of the broker connection.
///
/// Implementations must be callable from any thread. All calls may block;
/// `reconnect` is expected to block until the new session is established or
/// has failed.
pub trait Transport: Send + Sync {
    /// Publishes `message` on `channel`.
    fn publish(&self, channel: &Channel, message: &Message) -> Result<(), TransportError>;

    /// Starts delivering messages from `channel`.
    fn subscribe(&self, channel: &Channel) -> Result<(), TransportError>;

    /// Stops delivering messages from `channel`.
    fn unsubscribe(&self, channel: &Channel) -> Result<(), TransportError>;

    /// Re-establishes the session for an updated local entity.
    fn reconnect(&self, self_entity: &Entity) -> Result<(), TransportError>;

    /// Closes the session. Called once on shutdown.
    fn disconnect(&self) -> Result<(), TransportError>;
}
