//! Taker-side availability checks.
//!
//! Before committing fees, a taker asks the maker whether the offer is
//! still available. At most one check per offer runs at a time; a second
//! request for the same offer is refused while the first is pending.
//!
//! Each check carries the reply channel of whoever asked. Canceling a
//! check drops that channel, so the waiting caller sees the cancellation
//! instead of hanging.

use std::collections::HashMap;

use tokio::sync::oneshot;

use super::error::TradeError;
use super::types::TradeId;
use crate::offer::{Offer, OfferId};
use crate::payment::PaymentAccount;
use crate::timer::Timer;

/// Why the availability was asked for, and where the answer goes.
pub enum AvailabilityPurpose {
    /// Just asking.
    Probe {
        reply: oneshot::Sender<Result<bool, TradeError>>,
    },
    /// Take the offer if it is available.
    Take {
        amount: u64,
        payment_account: PaymentAccount,
        reply: oneshot::Sender<Result<TradeId, TradeError>>,
    },
}

impl AvailabilityPurpose {
    /// Answer with an error.
    pub fn fail(self, err: TradeError) {
        match self {
            AvailabilityPurpose::Probe { reply } => {
                let _ = reply.send(Err(err));
            }
            AvailabilityPurpose::Take { reply, .. } => {
                let _ = reply.send(Err(err));
            }
        }
    }
}

pub struct AvailabilityCheck {
    pub offer: Offer,
    pub uid: String,
    pub purpose: AvailabilityPurpose,
    /// Fires the timeout event; dropped with the check.
    pub timeout: Timer,
}

#[derive(Default)]
pub struct AvailabilityChecks {
    checks: HashMap<OfferId, AvailabilityCheck>,
}

impl AvailabilityChecks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Track a new check. Hands the check back if one is already pending
    /// for the same offer.
    pub fn start(&mut self, check: AvailabilityCheck) -> Result<(), AvailabilityCheck> {
        let offer_id = check.offer.id().to_string();
        if self.checks.contains_key(&offer_id) {
            return Err(check);
        }
        self.checks.insert(offer_id, check);
        Ok(())
    }

    /// Remove and return the check a response or timeout belongs to. A
    /// stale `uid` from an earlier check leaves the current one alone.
    pub fn take_matching(&mut self, offer_id: &str, uid: &str) -> Option<AvailabilityCheck> {
        if self.checks.get(offer_id)?.uid != uid {
            return None;
        }
        self.checks.remove(offer_id)
    }

    /// Drop the pending check for `offer_id`, if any.
    pub fn cancel(&mut self, offer_id: &str) -> bool {
        self.checks.remove(offer_id).is_some()
    }

    pub fn cancel_all(&mut self) {
        self.checks.clear();
    }

    pub fn contains(&self, offer_id: &str) -> bool {
        self.checks.contains_key(offer_id)
    }

    pub fn len(&self) -> usize {
        self.checks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.checks.is_empty()
    }
}

/// Map a dropped reply channel to [`TradeError::Canceled`].
pub async fn await_answer<T>(
    rx: oneshot::Receiver<Result<T, TradeError>>,
) -> Result<T, TradeError> {
    rx.await.unwrap_or(Err(TradeError::Canceled))
}
