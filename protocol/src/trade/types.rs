//! Core type definitions for trades.
//!
//! A trade has two orthogonal state dimensions. [`ProcessState`] records
//! how far the protocol has progressed; [`LifeCycleState`] records what the
//! trade is as a whole. Both live on the single [`Trade`] record, which
//! carries an explicit [`TradeRole`] instead of being one of four types.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::error::TradeError;
use crate::network::NodeAddress;
use crate::offer::{Offer, OfferDirection};
use crate::payment::PaymentAccount;

pub type TradeId = String;

// ---------------------------------------------------------------------------
// TradeRole
// ---------------------------------------------------------------------------

/// Which side of the trade this node is on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TradeRole {
    BuyerAsMaker,
    BuyerAsTaker,
    SellerAsMaker,
    SellerAsTaker,
}

impl TradeRole {
    /// Role of the node that published an offer in `direction`.
    pub fn for_maker(direction: OfferDirection) -> Self {
        match direction {
            OfferDirection::Buy => TradeRole::BuyerAsMaker,
            OfferDirection::Sell => TradeRole::SellerAsMaker,
        }
    }

    /// Role of the node taking an offer published in `direction`.
    pub fn for_taker(direction: OfferDirection) -> Self {
        match direction.mirror() {
            OfferDirection::Buy => TradeRole::BuyerAsTaker,
            OfferDirection::Sell => TradeRole::SellerAsTaker,
        }
    }

    pub fn is_buyer(self) -> bool {
        matches!(self, TradeRole::BuyerAsMaker | TradeRole::BuyerAsTaker)
    }

    pub fn is_seller(self) -> bool {
        !self.is_buyer()
    }

    pub fn is_maker(self) -> bool {
        matches!(self, TradeRole::BuyerAsMaker | TradeRole::SellerAsMaker)
    }

    pub fn is_taker(self) -> bool {
        !self.is_maker()
    }
}

impl fmt::Display for TradeRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::BuyerAsMaker => write!(f, "BuyerAsMaker"),
            Self::BuyerAsTaker => write!(f, "BuyerAsTaker"),
            Self::SellerAsMaker => write!(f, "SellerAsMaker"),
            Self::SellerAsTaker => write!(f, "SellerAsTaker"),
        }
    }
}

// ---------------------------------------------------------------------------
// ProcessState
// ---------------------------------------------------------------------------

/// Protocol milestones.
///
/// ```text
/// PREPARATION -> DEPOSIT_PUBLISHED -> DEPOSIT_CONFIRMED -> FIAT_PAYMENT_STARTED
///     -> FIAT_PAYMENT_RECEIVED (seller only) -> PAYOUT_PUBLISHED -> WITHDRAW_COMPLETED
/// ```
///
/// Milestones only move forward. `MESSAGE_SENDING_FAILED` and `EXCEPTION`
/// can be entered from any non-terminal state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ProcessState {
    Preparation,
    DepositPublished,
    DepositConfirmed,
    FiatPaymentStarted,
    FiatPaymentReceived,
    PayoutPublished,
    WithdrawCompleted,
    MessageSendingFailed,
    Exception,
}

impl ProcessState {
    /// Position on the milestone line; `None` for the failure states.
    fn rank(self) -> Option<u8> {
        match self {
            Self::Preparation => Some(0),
            Self::DepositPublished => Some(1),
            Self::DepositConfirmed => Some(2),
            Self::FiatPaymentStarted => Some(3),
            Self::FiatPaymentReceived => Some(4),
            Self::PayoutPublished => Some(5),
            Self::WithdrawCompleted => Some(6),
            Self::MessageSendingFailed | Self::Exception => None,
        }
    }

    pub fn is_failure(self) -> bool {
        self.rank().is_none()
    }

    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            Self::WithdrawCompleted | Self::MessageSendingFailed | Self::Exception
        )
    }

    /// Whether a trade in `role` may move from `self` to `next`.
    ///
    /// A buyer never passes through `FIAT_PAYMENT_RECEIVED`: only the seller
    /// confirms receipt. Skipping ahead is allowed because a message can
    /// overtake a wallet event (the payout can arrive before this node saw
    /// the deposit confirm).
    pub fn can_transition_to(self, next: ProcessState, role: TradeRole) -> bool {
        if self.is_terminal() {
            return false;
        }
        if next == Self::FiatPaymentReceived && role.is_buyer() {
            return false;
        }
        match (self.rank(), next.rank()) {
            (_, None) => true,
            (Some(from), Some(to)) => to > from,
            (None, Some(_)) => false,
        }
    }
}

impl fmt::Display for ProcessState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Preparation => "PREPARATION",
            Self::DepositPublished => "DEPOSIT_PUBLISHED",
            Self::DepositConfirmed => "DEPOSIT_CONFIRMED",
            Self::FiatPaymentStarted => "FIAT_PAYMENT_STARTED",
            Self::FiatPaymentReceived => "FIAT_PAYMENT_RECEIVED",
            Self::PayoutPublished => "PAYOUT_PUBLISHED",
            Self::WithdrawCompleted => "WITHDRAW_COMPLETED",
            Self::MessageSendingFailed => "MESSAGE_SENDING_FAILED",
            Self::Exception => "EXCEPTION",
        };
        f.write_str(name)
    }
}

// ---------------------------------------------------------------------------
// LifeCycleState / DisputeState
// ---------------------------------------------------------------------------

/// Overall disposition of a trade.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum LifeCycleState {
    /// Maker side: the offer is reserved for this trade, deposit not yet seen.
    OfferReserved,
    /// Maker side: the trade was abandoned before the deposit.
    OfferCanceled,
    Pending,
    Completed,
    Failed,
}

impl LifeCycleState {
    pub fn is_final(self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::OfferCanceled)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum DisputeState {
    #[default]
    None,
    Opened,
    Closed,
}

// ---------------------------------------------------------------------------
// Trade
// ---------------------------------------------------------------------------

/// One trade, as tracked by the trade manager.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Trade {
    id: TradeId,
    role: TradeRole,
    offer: Offer,
    /// Agreed amount in base-asset minor units.
    amount: u64,
    trading_peer: NodeAddress,
    process_state: ProcessState,
    life_cycle_state: LifeCycleState,
    dispute_state: DisputeState,
    /// Whether the trade's protocol instance is still alive. The life cycle
    /// can only reach `Completed` or `Failed` once this is false.
    protocol_active: bool,
    created_at: DateTime<Utc>,
    pub payment_account: PaymentAccount,
    pub tx_fee: u64,
    pub taker_fee_tx_id: Option<String>,
    pub deposit_tx_id: Option<String>,
    pub payout_tx_id: Option<String>,
    pub peer_payment_account: Option<PaymentAccount>,
    pub peer_payout_address: Option<String>,
    pub error_message: Option<String>,
}

impl Trade {
    pub fn new(
        role: TradeRole,
        offer: Offer,
        amount: u64,
        trading_peer: NodeAddress,
        payment_account: PaymentAccount,
        tx_fee: u64,
    ) -> Self {
        let life_cycle_state = if role.is_maker() {
            LifeCycleState::OfferReserved
        } else {
            LifeCycleState::Pending
        };
        Self {
            id: offer.id().to_string(),
            role,
            offer,
            amount,
            trading_peer,
            process_state: ProcessState::Preparation,
            life_cycle_state,
            dispute_state: DisputeState::None,
            protocol_active: true,
            created_at: Utc::now(),
            payment_account,
            tx_fee,
            taker_fee_tx_id: None,
            deposit_tx_id: None,
            payout_tx_id: None,
            peer_payment_account: None,
            peer_payout_address: None,
            error_message: None,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn role(&self) -> TradeRole {
        self.role
    }

    pub fn offer(&self) -> &Offer {
        &self.offer
    }

    pub fn amount(&self) -> u64 {
        self.amount
    }

    pub fn trading_peer(&self) -> &NodeAddress {
        &self.trading_peer
    }

    pub fn process_state(&self) -> ProcessState {
        self.process_state
    }

    pub fn life_cycle_state(&self) -> LifeCycleState {
        self.life_cycle_state
    }

    pub fn dispute_state(&self) -> DisputeState {
        self.dispute_state
    }

    pub fn is_protocol_active(&self) -> bool {
        self.protocol_active
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub fn security_deposit(&self) -> u64 {
        self.offer.security_deposit()
    }

    pub fn set_process_state(&mut self, next: ProcessState) -> Result<(), TradeError> {
        if !self.process_state.can_transition_to(next, self.role) {
            return Err(TradeError::StateMismatch {
                trade_id: self.id.clone(),
                expected: next,
                actual: self.process_state,
            });
        }
        self.process_state = next;
        Ok(())
    }

    pub fn set_life_cycle_state(&mut self, next: LifeCycleState) -> Result<(), TradeError> {
        if matches!(next, LifeCycleState::Completed | LifeCycleState::Failed) && self.protocol_active
        {
            return Err(TradeError::ProtocolStillActive(self.id.clone()));
        }
        if self.life_cycle_state.is_final() {
            return Err(TradeError::ProtocolViolation(format!(
                "trade {} already {:?}",
                self.id, self.life_cycle_state
            )));
        }
        self.life_cycle_state = next;
        Ok(())
    }

    pub fn set_dispute_state(&mut self, state: DisputeState) {
        self.dispute_state = state;
    }

    /// Mark the protocol instance as disposed.
    pub fn dispose_protocol(&mut self) {
        self.protocol_active = false;
    }

    /// Record a failure milestone. Always allowed unless the trade already
    /// finished.
    pub fn set_failed_state(&mut self, state: ProcessState, error: impl Into<String>) {
        if !self.process_state.is_terminal() {
            self.process_state = state;
        }
        self.error_message = Some(error.into());
    }
}

impl fmt::Display for Trade {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} {} {} with {} ({}, {:?})",
            self.id,
            self.role,
            self.amount,
            self.trading_peer,
            self.process_state,
            self.life_cycle_state
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::offer::test_support::{sample_offer, sepa_account};

    fn trade(role: TradeRole) -> Trade {
        Trade::new(
            role,
            sample_offer("t-1"),
            80_000,
            NodeAddress::localhost(9100),
            sepa_account("DE"),
            1_000,
        )
    }

    #[test]
    fn roles_mirror_the_offer_direction() {
        assert_eq!(TradeRole::for_maker(OfferDirection::Sell), TradeRole::SellerAsMaker);
        assert_eq!(TradeRole::for_taker(OfferDirection::Sell), TradeRole::BuyerAsTaker);
        assert_eq!(TradeRole::for_maker(OfferDirection::Buy), TradeRole::BuyerAsMaker);
        assert_eq!(TradeRole::for_taker(OfferDirection::Buy), TradeRole::SellerAsTaker);
        assert!(TradeRole::SellerAsTaker.is_seller() && TradeRole::SellerAsTaker.is_taker());
    }

    #[test]
    fn milestones_only_move_forward() {
        let mut t = trade(TradeRole::SellerAsTaker);
        t.set_process_state(ProcessState::DepositPublished).unwrap();
        t.set_process_state(ProcessState::DepositConfirmed).unwrap();
        assert!(matches!(
            t.set_process_state(ProcessState::DepositPublished),
            Err(TradeError::StateMismatch { .. })
        ));
        t.set_process_state(ProcessState::FiatPaymentStarted).unwrap();
        t.set_process_state(ProcessState::FiatPaymentReceived).unwrap();
        t.set_process_state(ProcessState::PayoutPublished).unwrap();
    }

    #[test]
    fn buyer_never_records_payment_received() {
        assert!(!ProcessState::FiatPaymentStarted
            .can_transition_to(ProcessState::FiatPaymentReceived, TradeRole::BuyerAsMaker));
        assert!(ProcessState::FiatPaymentStarted
            .can_transition_to(ProcessState::PayoutPublished, TradeRole::BuyerAsMaker));
    }

    #[test]
    fn failure_reachable_from_any_open_state() {
        for from in [
            ProcessState::Preparation,
            ProcessState::DepositConfirmed,
            ProcessState::PayoutPublished,
        ] {
            assert!(from.can_transition_to(ProcessState::Exception, TradeRole::BuyerAsTaker));
        }
        assert!(!ProcessState::WithdrawCompleted
            .can_transition_to(ProcessState::Exception, TradeRole::BuyerAsTaker));
        assert!(!ProcessState::Exception
            .can_transition_to(ProcessState::DepositPublished, TradeRole::BuyerAsTaker));
    }

    #[test]
    fn completion_requires_disposed_protocol() {
        let mut t = trade(TradeRole::BuyerAsTaker);
        assert_eq!(t.life_cycle_state(), LifeCycleState::Pending);
        assert!(matches!(
            t.set_life_cycle_state(LifeCycleState::Completed),
            Err(TradeError::ProtocolStillActive(_))
        ));
        t.dispose_protocol();
        t.set_life_cycle_state(LifeCycleState::Completed).unwrap();
        assert!(t.set_life_cycle_state(LifeCycleState::Failed).is_err());
    }

    #[test]
    fn maker_trades_start_reserved_and_share_the_offer_id() {
        let t = trade(TradeRole::BuyerAsMaker);
        assert_eq!(t.life_cycle_state(), LifeCycleState::OfferReserved);
        assert_eq!(t.id(), t.offer().id());
    }

    #[test]
    fn trade_survives_persistence_roundtrip() {
        let mut t = trade(TradeRole::SellerAsMaker);
        t.deposit_tx_id = Some("dep".into());
        t.set_dispute_state(DisputeState::Opened);
        let restored: Trade = bincode::deserialize(&bincode::serialize(&t).unwrap()).unwrap();
        assert_eq!(restored, t);
    }
}
