//! The offer record a maker publishes to the overlay.

use std::fmt;
use std::hash::{Hash, Hasher};

use chrono::Utc;
use serde::{Deserialize, Serialize};

use super::error::OfferError;
use crate::crypto::{blake3_hash, NodePublicKey};
use crate::network::NodeAddress;
use crate::payment::PaymentMethod;

pub type OfferId = String;

/// Direction from the maker's point of view, in terms of the base asset.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum OfferDirection {
    Buy,
    Sell,
}

impl OfferDirection {
    pub fn mirror(self) -> Self {
        match self {
            OfferDirection::Buy => OfferDirection::Sell,
            OfferDirection::Sell => OfferDirection::Buy,
        }
    }
}

/// Local view of an offer's availability. Never part of offer identity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum OfferState {
    #[default]
    Undefined,
    OfferFeePaid,
    Available,
    NotAvailable,
    Reserved,
    Removed,
    OffererOffline,
}

impl OfferState {
    /// States in which a taker must not try to take the offer.
    pub fn blocks_taking(self) -> bool {
        matches!(
            self,
            OfferState::NotAvailable
                | OfferState::Removed
                | OfferState::OffererOffline
                | OfferState::Reserved
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Price {
    /// Counter-currency minor units per whole base unit.
    Fixed(u64),
    /// Distance from the market price, in basis points.
    MarketRelative { basis_points: i32 },
}

/// The identity-bearing content of an offer. Frozen once published.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct OfferPayload {
    pub id: OfferId,
    pub direction: OfferDirection,
    pub base_currency: String,
    pub counter_currency: String,
    /// Unix millis.
    pub created_at: i64,
    pub protocol_version: u32,
    pub maker_address: NodeAddress,
    pub maker_pub_key: NodePublicKey,
    /// Smallest tradable amount, base-asset minor units.
    pub min_amount: u64,
    /// Largest tradable amount, base-asset minor units.
    pub amount: u64,
    pub price: Price,
    pub payment_method: PaymentMethod,
    pub accepted_country_codes: Option<Vec<String>>,
    pub accepted_bank_ids: Option<Vec<String>>,
    pub arbitrators: Vec<NodeAddress>,
    pub security_deposit: u64,
    pub offer_fee_tx_id: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Offer {
    payload: OfferPayload,
    #[serde(skip)]
    state: OfferState,
}

impl Offer {
    pub fn new(payload: OfferPayload) -> Self {
        Self {
            payload,
            state: OfferState::Undefined,
        }
    }

    pub fn payload(&self) -> &OfferPayload {
        &self.payload
    }

    pub fn id(&self) -> &str {
        &self.payload.id
    }

    pub fn direction(&self) -> OfferDirection {
        self.payload.direction
    }

    pub fn maker_address(&self) -> &NodeAddress {
        &self.payload.maker_address
    }

    pub fn maker_pub_key(&self) -> &NodePublicKey {
        &self.payload.maker_pub_key
    }

    pub fn min_amount(&self) -> u64 {
        self.payload.min_amount
    }

    pub fn amount(&self) -> u64 {
        self.payload.amount
    }

    pub fn security_deposit(&self) -> u64 {
        self.payload.security_deposit
    }

    pub fn is_range(&self) -> bool {
        self.payload.min_amount < self.payload.amount
    }

    pub fn state(&self) -> OfferState {
        self.state
    }

    pub fn set_state(&mut self, state: OfferState) {
        self.state = state;
    }

    /// Content hash over the payload. Signed (with a sequence number) in
    /// overlay announcements.
    pub fn hash(&self) -> [u8; 32] {
        blake3_hash(&bincode::serialize(&self.payload).unwrap_or_default())
    }

    pub fn age_millis(&self) -> i64 {
        Utc::now().timestamp_millis() - self.payload.created_at
    }

    /// Structural checks a maker runs before publishing.
    pub fn validate(&self) -> Result<(), OfferError> {
        let p = &self.payload;
        if p.id.is_empty() {
            return Err(OfferError::Invalid("empty offer id".into()));
        }
        if p.amount == 0 || p.min_amount == 0 {
            return Err(OfferError::Invalid("amount must be positive".into()));
        }
        if p.min_amount > p.amount {
            return Err(OfferError::Invalid(format!(
                "min amount {} above amount {}",
                p.min_amount, p.amount
            )));
        }
        if let Price::Fixed(0) = p.price {
            return Err(OfferError::Invalid("fixed price must be positive".into()));
        }
        if p.security_deposit == 0 {
            return Err(OfferError::Invalid("security deposit must be positive".into()));
        }
        if p.counter_currency.is_empty() || p.base_currency.is_empty() {
            return Err(OfferError::Invalid("currency codes required".into()));
        }
        if !p.maker_pub_key.is_present() {
            return Err(OfferError::Invalid("maker key missing".into()));
        }
        Ok(())
    }
}

impl PartialEq for Offer {
    fn eq(&self, other: &Self) -> bool {
        self.payload == other.payload
    }
}

impl Eq for Offer {}

impl Hash for Offer {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.payload.hash(state);
    }
}

impl fmt::Display for Offer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} {:?} {}-{} {}/{} ({:?})",
            self.payload.id,
            self.payload.direction,
            self.payload.min_amount,
            self.payload.amount,
            self.payload.base_currency,
            self.payload.counter_currency,
            self.state
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::offer::test_support::sample_offer;
    use std::collections::HashSet;

    #[test]
    fn state_is_not_part_of_identity() {
        let a = sample_offer("o-1");
        let mut b = a.clone();
        b.set_state(OfferState::Reserved);
        assert_eq!(a, b);

        let mut set = HashSet::new();
        set.insert(a);
        assert!(set.contains(&b));
    }

    #[test]
    fn serialized_offer_drops_local_state() {
        let mut offer = sample_offer("o-1");
        offer.set_state(OfferState::Available);
        let bytes = bincode::serialize(&offer).unwrap();
        let restored: Offer = bincode::deserialize(&bytes).unwrap();
        assert_eq!(restored, offer);
        assert_eq!(restored.state(), OfferState::Undefined);
        assert_eq!(restored.hash(), offer.hash());
    }

    #[test]
    fn hash_changes_with_content() {
        assert_ne!(sample_offer("o-1").hash(), sample_offer("o-2").hash());
    }

    #[test]
    fn validation_catches_bad_ranges() {
        assert!(sample_offer("o-1").validate().is_ok());

        let mut payload = sample_offer("o-1").payload().clone();
        payload.min_amount = payload.amount + 1;
        assert!(Offer::new(payload).validate().is_err());

        let mut payload = sample_offer("o-1").payload().clone();
        payload.price = Price::Fixed(0);
        assert!(Offer::new(payload).validate().is_err());
    }

    #[test]
    fn blocking_states() {
        assert!(OfferState::OffererOffline.blocks_taking());
        assert!(OfferState::Removed.blocks_taking());
        assert!(!OfferState::Available.blocks_taking());
        assert!(!OfferState::Undefined.blocks_taking());
    }
}
