//! Cluster Messaging Layer
//!
//! The envelope format and outbound queue that sit between the core and the
//! external group-messaging bus. The bus itself (ordered multicast and
//! membership callbacks) is a collaborator behind the [`ClusterBus`] trait;
//! this module owns what goes over it: the binary envelope with conditional
//! payload compression, receive-side filtering, and the never-drop outbound
//! queue with depth-scaled retry.

pub mod envelope;
pub mod outbox;

use std::fmt;

use async_trait::async_trait;

pub use envelope::{Envelope, EnvelopeError, MsgRecipient, MsgSender, MsgType};
pub use outbox::{FlushOutcome, Outbox};

/// Errors surfaced by the messaging bus.
#[derive(Debug, Clone)]
pub enum BusError {
    /// Transient: the bus asked us to retry later.
    TryAgain,
    /// The connection to the bus is gone.
    NotConnected,
    /// Anything else; not retryable.
    Other(String),
}

impl fmt::Display for BusError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BusError::TryAgain => write!(f, "Bus busy, try again"),
            BusError::NotConnected => write!(f, "Not connected to the messaging bus"),
            BusError::Other(msg) => write!(f, "Bus error: {}", msg),
        }
    }
}

impl std::error::Error for BusError {}

impl BusError {
    /// Transient errors leave the message queued for the next flush.
    pub fn is_transient(&self) -> bool {
        matches!(self, BusError::TryAgain)
    }
}

/// External group-messaging bus. Implementations must deliver messages to a
/// given peer in order and present the same order to all peers.
#[async_trait]
pub trait ClusterBus: Send + Sync {
    /// Multicast one envelope to the process group.
    async fn publish(&self, envelope: &Envelope) -> Result<(), BusError>;

    /// The local node's id on the bus.
    fn local_node_id(&self) -> u32;
}
