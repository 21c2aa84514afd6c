//! # Offer Module
//!
//! Offers from both sides of the book:
//!
//! ```text
//! types.rs         Offer, OfferPayload, OfferState, Price
//! open_offer.rs    A maker's own offer and its lifecycle
//! overlay.rs       Publication: signed add/refresh/remove announcements
//! book.rs          Other makers' offers as learned from the overlay
//! manager.rs       OpenOfferManager: place, answer, republish, reserve
//! ```

pub mod book;
pub mod error;
pub mod manager;
pub mod open_offer;
pub mod overlay;
pub mod types;

pub use book::{BookUpdate, OfferBook};
pub use error::OfferError;
pub use manager::{OfferTimerEvent, OpenOfferManager, PlaceOfferRequest};
pub use open_offer::{OpenOffer, OpenOfferState};
pub use overlay::{BroadcastOverlay, OfferOverlay, OverlayError};
pub use types::{Offer, OfferDirection, OfferId, OfferPayload, OfferState, Price};

#[cfg(test)]
pub mod test_support {
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    use async_trait::async_trait;
    use parking_lot::Mutex;

    use super::*;
    use crate::crypto::NodeKeypair;
    use crate::network::{
        AddOfferMessage, Message, NetworkError, NodeAddress, PeerMessenger, RefreshOfferMessage,
        RemoveOfferMessage,
    };
    use crate::payment::{PaymentAccount, PaymentMethod};

    pub fn maker_keypair() -> NodeKeypair {
        NodeKeypair::from_seed(&[7u8; 32])
    }

    pub fn sample_offer(id: &str) -> Offer {
        Offer::new(OfferPayload {
            id: id.to_string(),
            direction: OfferDirection::Sell,
            base_currency: "BTC".into(),
            counter_currency: "EUR".into(),
            created_at: 1_700_000_000_000,
            protocol_version: 1,
            maker_address: NodeAddress::localhost(9000),
            maker_pub_key: maker_keypair().public_key(),
            min_amount: 50_000,
            amount: 100_000,
            price: Price::Fixed(6_000_000),
            payment_method: PaymentMethod::Sepa,
            accepted_country_codes: Some(vec!["DE".into(), "FR".into(), "AT".into()]),
            accepted_bank_ids: None,
            arbitrators: vec![],
            security_deposit: 20_000,
            offer_fee_tx_id: Some("fee-tx".into()),
        })
    }

    pub fn sepa_account(country: &str) -> PaymentAccount {
        PaymentAccount {
            id: format!("sepa-{country}"),
            method: PaymentMethod::Sepa,
            holder_name: "Test Holder".into(),
            currencies: vec!["EUR".into()],
            country_code: Some(country.to_string()),
            bank_id: None,
        }
    }

    /// Messenger that records what would have gone out.
    pub struct RecordingMessenger {
        own: NodeAddress,
        direct: Mutex<Vec<(NodeAddress, Message)>>,
        broadcasts: Mutex<Vec<Message>>,
        fail_direct: AtomicBool,
    }

    impl RecordingMessenger {
        pub fn new(own: NodeAddress) -> Self {
            Self {
                own,
                direct: Mutex::new(Vec::new()),
                broadcasts: Mutex::new(Vec::new()),
                fail_direct: AtomicBool::new(false),
            }
        }

        pub fn direct(&self) -> Vec<(NodeAddress, Message)> {
            self.direct.lock().clone()
        }

        /// Drain the recorded direct messages.
        pub fn take_direct(&self) -> Vec<(NodeAddress, Message)> {
            std::mem::take(&mut *self.direct.lock())
        }

        /// Make direct sends fail as if the peer were unreachable.
        pub fn fail_direct(&self, fail: bool) {
            self.fail_direct.store(fail, Ordering::SeqCst);
        }

        pub fn broadcasts(&self) -> Vec<Message> {
            self.broadcasts.lock().clone()
        }
    }

    #[async_trait]
    impl PeerMessenger for RecordingMessenger {
        fn own_address(&self) -> NodeAddress {
            self.own.clone()
        }

        async fn send_direct(
            &self,
            peer: &NodeAddress,
            message: Message,
        ) -> Result<(), NetworkError> {
            if self.fail_direct.load(Ordering::SeqCst) {
                return Err(NetworkError::PeerUnreachable {
                    peer: peer.clone(),
                    reason: "refused".into(),
                });
            }
            self.direct.lock().push((peer.clone(), message));
            Ok(())
        }

        async fn broadcast(&self, message: Message) -> Result<usize, NetworkError> {
            self.broadcasts.lock().push(message);
            Ok(1)
        }
    }

    /// Overlay that counts announcements and can be told to fail adds.
    #[derive(Default)]
    pub struct RecordingOverlay {
        add_attempts: AtomicUsize,
        adds: AtomicUsize,
        refreshes: AtomicUsize,
        removes: AtomicUsize,
        fail_adds: AtomicBool,
    }

    impl RecordingOverlay {
        pub fn fail_adds(&self, fail: bool) {
            self.fail_adds.store(fail, Ordering::SeqCst);
        }

        /// Successful adds.
        pub fn adds(&self) -> usize {
            self.adds.load(Ordering::SeqCst)
        }

        pub fn add_attempts(&self) -> usize {
            self.add_attempts.load(Ordering::SeqCst)
        }

        pub fn refreshes(&self) -> usize {
            self.refreshes.load(Ordering::SeqCst)
        }

        pub fn removes(&self) -> usize {
            self.removes.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl OfferOverlay for RecordingOverlay {
        async fn add_offer(&self, _message: AddOfferMessage) -> Result<(), OverlayError> {
            self.add_attempts.fetch_add(1, Ordering::SeqCst);
            if self.fail_adds.load(Ordering::SeqCst) {
                return Err(OverlayError::NoPeers);
            }
            self.adds.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        async fn refresh_offer(&self, _message: RefreshOfferMessage) -> Result<(), OverlayError> {
            self.refreshes.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        async fn remove_offer(&self, _message: RemoveOfferMessage) -> Result<(), OverlayError> {
            self.removes.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }
}
