//! # Network Module
//!
//! Peer-to-peer transport for Bazaar nodes. Plain TCP with length-prefixed
//! bincode envelopes, per-connection abuse control, and a manager that
//! fans inbound traffic out to the offer and trade layers.
//!
//! ## Architecture
//!
//! ```text
//! message.rs       Envelope, Message and payload types, NodeAddress
//! codec.rs         Length-prefixed framing with skip-on-oversize
//! throttle.rs      Sliding-window inbound rate limit
//! violation.rs     Rule violations and tolerance counting
//! connection.rs    One peer: writer lock, read task, idempotent shutdown
//! manager.rs       All peers: accept/dial, listeners, keep-alive, reconnect
//! ```
//!
//! ## Design Decisions
//!
//! - A connection's writer sits behind a `tokio::sync::Mutex`. It is fair,
//!   so concurrent senders are served in arrival order and one large
//!   message never interleaves with another.
//! - Connection state flags (`stopped`, peer address) use atomics and
//!   `parking_lot` locks that are never held across an `.await`.
//! - Upper layers talk to the network through [`PeerMessenger`] so the
//!   offer and trade managers can be tested without sockets.

pub mod codec;
pub mod connection;
pub mod error;
pub mod manager;
pub mod message;
pub mod throttle;
pub mod violation;

use async_trait::async_trait;

pub use codec::{EnvelopeCodec, InboundFrame};
pub use connection::{
    CloseReason, ConnectionEvent, ConnectionId, ConnectionStatistics, Direction, PeerConnection,
    PeerType,
};
pub use error::NetworkError;
pub use manager::{ConnectionManager, ListenerId, NetworkEvent};
pub use message::{
    AddOfferMessage, Envelope, Message, NodeAddress, OfferAvailabilityRequest,
    OfferAvailabilityResponse, RefreshOfferMessage, RemoveOfferMessage, TradeMessage,
    TradePayload,
};
pub use throttle::{Admission, ThrottleWindow};
pub use violation::{RuleViolation, ViolationLedger};

/// Outbound messaging as seen by the offer and trade layers.
#[async_trait]
pub trait PeerMessenger: Send + Sync {
    /// The address peers should use to reach this node.
    fn own_address(&self) -> NodeAddress;

    /// Deliver a direct message, dialing the peer if needed.
    async fn send_direct(&self, peer: &NodeAddress, message: Message) -> Result<(), NetworkError>;

    /// Send to every connected peer. Fails with [`NetworkError::NoPeers`]
    /// when nobody received it.
    async fn broadcast(&self, message: Message) -> Result<usize, NetworkError>;
}
