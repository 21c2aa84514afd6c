//! A maker's own offer together with its local lifecycle.
//!
//! ```text
//! AVAILABLE ──reserve──> RESERVED ──close──> CLOSED
//!     │
//!     └──────cancel────> CANCELED
//! ```
//!
//! CLOSED and CANCELED are terminal. A reserved offer is bound to a trade
//! in progress and can only end by closing.

use serde::{Deserialize, Serialize};

use super::error::OfferError;
use super::types::{Offer, OfferState};
use crate::payment::PaymentAccount;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum OpenOfferState {
    Available,
    Reserved,
    Closed,
    Canceled,
}

impl OpenOfferState {
    pub fn can_transition_to(self, next: OpenOfferState) -> bool {
        use OpenOfferState::*;
        matches!(
            (self, next),
            (Available, Reserved) | (Reserved, Closed) | (Available, Canceled)
        )
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, OpenOfferState::Closed | OpenOfferState::Canceled)
    }

    /// The offer state that goes with this lifecycle state.
    fn offer_state(self) -> OfferState {
        match self {
            OpenOfferState::Available => OfferState::Available,
            OpenOfferState::Reserved => OfferState::Reserved,
            OpenOfferState::Closed | OpenOfferState::Canceled => OfferState::Removed,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OpenOffer {
    offer: Offer,
    state: OpenOfferState,
    /// The maker's account the counter-currency leg settles to.
    payment_account: PaymentAccount,
    /// Last sequence number used in an overlay announcement.
    sequence_number: u64,
}

impl OpenOffer {
    pub fn new(mut offer: Offer, payment_account: PaymentAccount) -> Self {
        offer.set_state(OfferState::Available);
        Self {
            offer,
            state: OpenOfferState::Available,
            payment_account,
            sequence_number: 0,
        }
    }

    pub fn offer(&self) -> &Offer {
        &self.offer
    }

    pub fn id(&self) -> &str {
        self.offer.id()
    }

    pub fn state(&self) -> OpenOfferState {
        self.state
    }

    pub fn payment_account(&self) -> &PaymentAccount {
        &self.payment_account
    }

    pub fn sequence_number(&self) -> u64 {
        self.sequence_number
    }

    /// Advance and return the sequence number for the next announcement.
    pub fn next_sequence_number(&mut self) -> u64 {
        self.sequence_number += 1;
        self.sequence_number
    }

    pub fn reserve(&mut self) -> Result<(), OfferError> {
        self.transition(OpenOfferState::Reserved)
    }

    pub fn close(&mut self) -> Result<(), OfferError> {
        self.transition(OpenOfferState::Closed)
    }

    pub fn cancel(&mut self) -> Result<(), OfferError> {
        self.transition(OpenOfferState::Canceled)
    }

    /// Re-derive the offer's local state after loading from disk, where it
    /// is not stored.
    pub fn restore(&mut self) {
        self.offer.set_state(self.state.offer_state());
    }

    fn transition(&mut self, next: OpenOfferState) -> Result<(), OfferError> {
        if !self.state.can_transition_to(next) {
            return Err(OfferError::IllegalTransition {
                offer_id: self.id().to_string(),
                from: self.state,
                to: next,
            });
        }
        self.state = next;
        self.offer.set_state(next.offer_state());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::offer::test_support::{sample_offer, sepa_account};

    #[test]
    fn reserve_then_close() {
        let mut open = OpenOffer::new(sample_offer("o-1"), sepa_account("DE"));
        assert_eq!(open.offer().state(), OfferState::Available);
        open.reserve().unwrap();
        assert_eq!(open.offer().state(), OfferState::Reserved);
        open.close().unwrap();
        assert_eq!(open.state(), OpenOfferState::Closed);
        assert_eq!(open.offer().state(), OfferState::Removed);
    }

    #[test]
    fn cancel_only_from_available() {
        let mut open = OpenOffer::new(sample_offer("o-1"), sepa_account("DE"));
        open.reserve().unwrap();
        assert!(matches!(
            open.cancel(),
            Err(OfferError::IllegalTransition {
                from: OpenOfferState::Reserved,
                to: OpenOfferState::Canceled,
                ..
            })
        ));

        let mut open = OpenOffer::new(sample_offer("o-2"), sepa_account("DE"));
        open.cancel().unwrap();
        assert!(open.state().is_terminal());
    }

    #[test]
    fn terminal_states_are_final() {
        let mut open = OpenOffer::new(sample_offer("o-1"), sepa_account("DE"));
        open.cancel().unwrap();
        assert!(open.reserve().is_err());
        assert!(open.close().is_err());
        assert!(open.cancel().is_err());
    }

    #[test]
    fn available_cannot_close_directly() {
        let mut open = OpenOffer::new(sample_offer("o-1"), sepa_account("DE"));
        assert!(open.close().is_err());
        assert_eq!(open.state(), OpenOfferState::Available);
    }

    #[test]
    fn restore_rebuilds_offer_state() {
        let mut open = OpenOffer::new(sample_offer("o-1"), sepa_account("DE"));
        open.reserve().unwrap();
        let bytes = bincode::serialize(&open).unwrap();
        let mut loaded: OpenOffer = bincode::deserialize(&bytes).unwrap();
        assert_eq!(loaded.offer().state(), OfferState::Undefined);
        loaded.restore();
        assert_eq!(loaded.offer().state(), OfferState::Reserved);
    }

    #[test]
    fn sequence_numbers_increase() {
        let mut open = OpenOffer::new(sample_offer("o-1"), sepa_account("DE"));
        assert_eq!(open.next_sequence_number(), 1);
        assert_eq!(open.next_sequence_number(), 2);
        assert_eq!(open.sequence_number(), 2);
    }
}
