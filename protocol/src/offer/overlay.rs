//! # Offer Overlay
//!
//! The distributed record store offers live in. A maker announces an offer
//! with [`AddOfferMessage`], keeps it alive with cheap
//! [`RefreshOfferMessage`]s, and withdraws it with a [`RemoveOfferMessage`].
//! Every announcement is signed by the maker over the offer hash and a
//! strictly increasing sequence number, so peers can tell a fresh refresh
//! from a replayed one.

use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;
use tracing::debug;

use super::types::{Offer, OfferId};
use crate::crypto::hash::sequenced_hash;
use crate::crypto::{NodeKeypair, NodePublicKey, NodeSignature};
use crate::network::{
    AddOfferMessage, Message, NetworkError, PeerMessenger, RefreshOfferMessage,
    RemoveOfferMessage,
};

#[derive(Debug, Error)]
pub enum OverlayError {
    #[error("no peer accepted the announcement")]
    NoPeers,

    #[error("network: {0}")]
    Network(NetworkError),

    #[error("invalid signature on offer {0}")]
    InvalidSignature(OfferId),
}

impl From<NetworkError> for OverlayError {
    fn from(err: NetworkError) -> Self {
        match err {
            NetworkError::NoPeers => OverlayError::NoPeers,
            other => OverlayError::Network(other),
        }
    }
}

/// Where open offers are published.
#[async_trait]
pub trait OfferOverlay: Send + Sync {
    async fn add_offer(&self, message: AddOfferMessage) -> Result<(), OverlayError>;
    async fn refresh_offer(&self, message: RefreshOfferMessage) -> Result<(), OverlayError>;
    async fn remove_offer(&self, message: RemoveOfferMessage) -> Result<(), OverlayError>;
}

/// Overlay that floods announcements to every connected peer.
pub struct BroadcastOverlay {
    messenger: Arc<dyn PeerMessenger>,
}

impl BroadcastOverlay {
    pub fn new(messenger: Arc<dyn PeerMessenger>) -> Self {
        Self { messenger }
    }

    async fn publish(&self, message: Message) -> Result<(), OverlayError> {
        let kind = message.type_name();
        let peers = self.messenger.broadcast(message).await?;
        debug!(kind, peers, "overlay announcement sent");
        Ok(())
    }
}

#[async_trait]
impl OfferOverlay for BroadcastOverlay {
    async fn add_offer(&self, message: AddOfferMessage) -> Result<(), OverlayError> {
        self.publish(Message::AddOffer(message)).await
    }

    async fn refresh_offer(&self, message: RefreshOfferMessage) -> Result<(), OverlayError> {
        self.publish(Message::RefreshOffer(message)).await
    }

    async fn remove_offer(&self, message: RemoveOfferMessage) -> Result<(), OverlayError> {
        self.publish(Message::RemoveOffer(message)).await
    }
}

// ---------------------------------------------------------------------------
// Signing
// ---------------------------------------------------------------------------

pub fn sign_add(keypair: &NodeKeypair, offer: &Offer, sequence_number: u64) -> AddOfferMessage {
    AddOfferMessage {
        offer: offer.clone(),
        sequence_number,
        signature: keypair.sign(&sequenced_hash(&offer.hash(), sequence_number)),
    }
}

pub fn sign_refresh(
    keypair: &NodeKeypair,
    offer: &Offer,
    sequence_number: u64,
) -> RefreshOfferMessage {
    let offer_hash = offer.hash();
    RefreshOfferMessage {
        offer_id: offer.id().to_string(),
        offer_hash,
        sequence_number,
        signature: keypair.sign(&sequenced_hash(&offer_hash, sequence_number)),
    }
}

pub fn sign_remove(
    keypair: &NodeKeypair,
    offer: &Offer,
    sequence_number: u64,
) -> RemoveOfferMessage {
    let offer_hash = offer.hash();
    RemoveOfferMessage {
        offer_id: offer.id().to_string(),
        offer_hash,
        sequence_number,
        signature: keypair.sign(&sequenced_hash(&offer_hash, sequence_number)),
    }
}

/// Check an announcement signature against the maker's key.
pub fn verify_record(
    maker_key: &NodePublicKey,
    offer_hash: &[u8; 32],
    sequence_number: u64,
    signature: &NodeSignature,
) -> bool {
    maker_key.verify(&sequenced_hash(offer_hash, sequence_number), signature)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::offer::test_support::{maker_keypair, sample_offer};

    #[test]
    fn signed_add_verifies_with_maker_key() {
        let kp = maker_keypair();
        let offer = sample_offer("o-1");
        let msg = sign_add(&kp, &offer, 3);
        assert!(verify_record(
            offer.maker_pub_key(),
            &msg.offer.hash(),
            msg.sequence_number,
            &msg.signature
        ));
        // Replaying with another sequence number fails.
        assert!(!verify_record(offer.maker_pub_key(), &offer.hash(), 4, &msg.signature));
    }

    #[test]
    fn refresh_signed_by_someone_else_fails() {
        let offer = sample_offer("o-1");
        let msg = sign_refresh(&NodeKeypair::generate(), &offer, 2);
        assert!(!verify_record(
            offer.maker_pub_key(),
            &msg.offer_hash,
            msg.sequence_number,
            &msg.signature
        ));
    }

    #[test]
    fn no_peers_maps_to_overlay_error() {
        assert!(matches!(
            OverlayError::from(NetworkError::NoPeers),
            OverlayError::NoPeers
        ));
    }
}
