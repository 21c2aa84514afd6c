//! # Wire Messages
//!
//! Everything two Bazaar nodes say to each other is a [`Message`] wrapped in
//! an [`Envelope`] carrying the sender's protocol version. The envelope is
//! bincode-encoded and length-prefixed by the codec.
//!
//! Messages fall into three groups:
//!
//! ```text
//! liveness   Ping, Pong, CloseConnection
//! overlay    AddOffer, RefreshOffer, RemoveOffer           (broadcast)
//! direct     OfferAvailabilityRequest/Response, Trade(..)  (peer to peer)
//! ```
//!
//! Direct messages name their sender. The transport binds that address to
//! the connection the first time it sees one.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::crypto::{NodePublicKey, NodeSignature};
use crate::offer::{Offer, OfferId};
use crate::payment::PaymentAccount;

// ---------------------------------------------------------------------------
// Node Address
// ---------------------------------------------------------------------------

/// The stable, dialable address of a node. Not the ephemeral socket address
/// of an inbound connection.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct NodeAddress {
    pub host: String,
    pub port: u16,
}

#[derive(Debug, Error)]
#[error("invalid node address {0:?}, expected host:port")]
pub struct AddressParseError(String);

impl NodeAddress {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }

    pub fn localhost(port: u16) -> Self {
        Self::new("127.0.0.1", port)
    }
}

impl fmt::Display for NodeAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

impl FromStr for NodeAddress {
    type Err = AddressParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (host, port) = s
            .rsplit_once(':')
            .ok_or_else(|| AddressParseError(s.to_string()))?;
        if host.is_empty() {
            return Err(AddressParseError(s.to_string()));
        }
        let port = port.parse().map_err(|_| AddressParseError(s.to_string()))?;
        Ok(Self::new(host, port))
    }
}

// ---------------------------------------------------------------------------
// Envelope
// ---------------------------------------------------------------------------

/// The unit the codec frames.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    pub protocol_version: u32,
    pub message: Message,
}

impl Envelope {
    pub fn new(protocol_version: u32, message: Message) -> Self {
        Self {
            protocol_version,
            message,
        }
    }
}

// ---------------------------------------------------------------------------
// Messages
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Message {
    Ping { nonce: u64 },
    Pong { nonce: u64 },
    /// Sent once, best effort, before a graceful close.
    CloseConnection { reason: String },

    OfferAvailabilityRequest(OfferAvailabilityRequest),
    OfferAvailabilityResponse(OfferAvailabilityResponse),

    AddOffer(AddOfferMessage),
    RefreshOffer(RefreshOfferMessage),
    RemoveOffer(RemoveOfferMessage),

    Trade(TradeMessage),
}

impl Message {
    /// Short stable name, used for logging and per-type statistics.
    pub fn type_name(&self) -> &'static str {
        match self {
            Message::Ping { .. } => "ping",
            Message::Pong { .. } => "pong",
            Message::CloseConnection { .. } => "close_connection",
            Message::OfferAvailabilityRequest(_) => "offer_availability_request",
            Message::OfferAvailabilityResponse(_) => "offer_availability_response",
            Message::AddOffer(_) => "add_offer",
            Message::RefreshOffer(_) => "refresh_offer",
            Message::RemoveOffer(_) => "remove_offer",
            Message::Trade(msg) => msg.payload.type_name(),
        }
    }

    /// Keep-alive traffic. Does not count as activity on a connection.
    pub fn is_liveness(&self) -> bool {
        matches!(self, Message::Ping { .. } | Message::Pong { .. })
    }

    /// Peer-to-peer messages, as opposed to overlay broadcasts.
    pub fn is_direct(&self) -> bool {
        matches!(
            self,
            Message::OfferAvailabilityRequest(_)
                | Message::OfferAvailabilityResponse(_)
                | Message::Trade(_)
        )
    }

    /// The sender's stable address, for messages that carry one.
    pub fn sender_address(&self) -> Option<&NodeAddress> {
        match self {
            Message::OfferAvailabilityRequest(req) => Some(&req.sender),
            Message::OfferAvailabilityResponse(resp) => Some(&resp.sender),
            Message::Trade(msg) => Some(&msg.sender),
            _ => None,
        }
    }
}

// ---------------------------------------------------------------------------
// Availability
// ---------------------------------------------------------------------------

/// Taker asks the maker whether an offer can still be taken.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OfferAvailabilityRequest {
    pub offer_id: OfferId,
    pub sender: NodeAddress,
    pub requester_pub_key: NodePublicKey,
    /// Correlates the response with the check that asked.
    pub uid: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OfferAvailabilityResponse {
    pub offer_id: OfferId,
    pub sender: NodeAddress,
    pub available: bool,
    pub uid: String,
}

// ---------------------------------------------------------------------------
// Overlay records
// ---------------------------------------------------------------------------

/// Announces an offer. `signature` covers
/// `sequenced_hash(offer.hash(), sequence_number)` under the maker's key.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AddOfferMessage {
    pub offer: Offer,
    pub sequence_number: u64,
    pub signature: NodeSignature,
}

/// Extends the TTL of an already announced offer without resending it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RefreshOfferMessage {
    pub offer_id: OfferId,
    pub offer_hash: [u8; 32],
    pub sequence_number: u64,
    pub signature: NodeSignature,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RemoveOfferMessage {
    pub offer_id: OfferId,
    pub offer_hash: [u8; 32],
    pub sequence_number: u64,
    pub signature: NodeSignature,
}

// ---------------------------------------------------------------------------
// Trade protocol
// ---------------------------------------------------------------------------

/// One step of the trade protocol. The trade id equals the offer id.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TradeMessage {
    pub trade_id: String,
    pub sender: NodeAddress,
    pub uid: String,
    pub payload: TradePayload,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum TradePayload {
    /// Taker to maker: start the trade.
    PayDepositRequest {
        trade_amount: u64,
        taker_fee_tx_id: String,
        taker_payout_address: String,
        taker_payment_account: PaymentAccount,
        taker_pub_key: NodePublicKey,
    },
    /// Maker to taker: the maker's half of the deposit, ready to publish.
    PublishDepositTxRequest {
        maker_payout_address: String,
        maker_payment_account: PaymentAccount,
        prepared_deposit_tx: Vec<u8>,
    },
    /// Taker to maker: the deposit transaction is on the network.
    DepositTxPublished {
        deposit_tx_id: String,
        deposit_tx: Vec<u8>,
    },
    /// Buyer to seller: the counter-currency transfer was started.
    FiatTransferStarted { buyer_payout_address: String },
    /// Seller to buyer: payment received, here is my payout signature.
    FinalizePayoutTxRequest {
        seller_signature: Vec<u8>,
        seller_payout_address: String,
    },
    /// Buyer to seller: the payout transaction is on the network.
    PayoutTxPublished { payout_tx_id: String, payout_tx: Vec<u8> },
    OpenDispute { reason: String },
    DisputeClosed { summary: String },
}

impl TradePayload {
    pub fn type_name(&self) -> &'static str {
        match self {
            TradePayload::PayDepositRequest { .. } => "pay_deposit_request",
            TradePayload::PublishDepositTxRequest { .. } => "publish_deposit_tx_request",
            TradePayload::DepositTxPublished { .. } => "deposit_tx_published",
            TradePayload::FiatTransferStarted { .. } => "fiat_transfer_started",
            TradePayload::FinalizePayoutTxRequest { .. } => "finalize_payout_tx_request",
            TradePayload::PayoutTxPublished { .. } => "payout_tx_published",
            TradePayload::OpenDispute { .. } => "open_dispute",
            TradePayload::DisputeClosed { .. } => "dispute_closed",
        }
    }
}
