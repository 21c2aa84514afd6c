//! The per-trade protocol instance.
//!
//! A [`TradeProtocol`] holds nothing but the trade id, the role's behavior
//! and which message the trade is waiting for. The trade itself stays in
//! the manager. Messages that arrive out of turn are refused here before
//! they can touch trade state. Dispute messages are accepted at any point.
//!
//! ```text
//! taker   PayDepositRequest ->                  <- PublishDepositTxRequest   maker
//!         DepositTxPublished ->
//! buyer   FiatTransferStarted ->                <- FinalizePayoutTxRequest   seller
//!         PayoutTxPublished ->
//! ```

use super::role::{behavior_for, RoleBehavior};
use super::types::{ProcessState, Trade, TradeId, TradeRole};
use crate::network::TradePayload;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExpectedMessage {
    PublishDepositTxRequest,
    DepositTxPublished,
    FiatTransferStarted,
    FinalizePayoutTxRequest,
    PayoutTxPublished,
    /// Waiting on a local action or a wallet event, not on the peer.
    Nothing,
}

impl ExpectedMessage {
    fn matches(self, payload: &TradePayload) -> bool {
        matches!(
            (self, payload),
            (Self::PublishDepositTxRequest, TradePayload::PublishDepositTxRequest { .. })
                | (Self::DepositTxPublished, TradePayload::DepositTxPublished { .. })
                | (Self::FiatTransferStarted, TradePayload::FiatTransferStarted { .. })
                | (Self::FinalizePayoutTxRequest, TradePayload::FinalizePayoutTxRequest { .. })
                | (Self::PayoutTxPublished, TradePayload::PayoutTxPublished { .. })
        )
    }
}

pub struct TradeProtocol {
    trade_id: TradeId,
    behavior: &'static dyn RoleBehavior,
    expected: ExpectedMessage,
}

impl TradeProtocol {
    pub fn new(trade_id: impl Into<TradeId>, role: TradeRole) -> Self {
        let behavior = behavior_for(role);
        Self {
            trade_id: trade_id.into(),
            behavior,
            expected: behavior.initial_expectation(),
        }
    }

    /// Rebuild the protocol instance of a trade loaded from disk.
    pub fn resume(trade: &Trade) -> Self {
        let mut protocol = Self::new(trade.id(), trade.role());
        let behavior = protocol.behavior;
        protocol.expected = match trade.process_state() {
            ProcessState::Preparation => behavior.initial_expectation(),
            ProcessState::DepositPublished | ProcessState::DepositConfirmed => {
                behavior.after_deposit()
            }
            ProcessState::FiatPaymentStarted if behavior.publishes_payout_tx() => {
                ExpectedMessage::FinalizePayoutTxRequest
            }
            ProcessState::FiatPaymentReceived => ExpectedMessage::PayoutTxPublished,
            _ => ExpectedMessage::Nothing,
        };
        protocol
    }

    pub fn trade_id(&self) -> &str {
        &self.trade_id
    }

    pub fn behavior(&self) -> &'static dyn RoleBehavior {
        self.behavior
    }

    pub fn expected(&self) -> ExpectedMessage {
        self.expected
    }

    pub fn expect(&mut self, next: ExpectedMessage) {
        self.expected = next;
    }

    pub fn accepts(&self, payload: &TradePayload) -> bool {
        match payload {
            TradePayload::OpenDispute { .. } | TradePayload::DisputeClosed { .. } => true,
            other => self.expected.matches(other),
        }
    }
}
