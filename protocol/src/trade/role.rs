//! Per-role behavior.
//!
//! The four roles run the same state machine but do different things at
//! the same points: the taker completes and broadcasts the deposit, the
//! buyer announces the fiat payment and broadcasts the payout, the seller
//! confirms receipt and signs the payout. Each role answers those
//! questions once, here, and the trade manager asks instead of matching on
//! the role everywhere.

use super::funds::funds_needed_for_trade;
use super::protocol::ExpectedMessage;
use super::types::TradeRole;

pub trait RoleBehavior: Send + Sync {
    fn role(&self) -> TradeRole;

    /// Completes the maker's prepared deposit and broadcasts it.
    fn publishes_deposit_tx(&self) -> bool;

    /// Pays the counter-currency and announces it.
    fn sends_payment_started(&self) -> bool;

    /// Confirms the counter-currency arrived and signs the payout.
    fn confirms_payment_received(&self) -> bool;

    /// Co-signs and broadcasts the payout.
    fn publishes_payout_tx(&self) -> bool;

    /// First protocol message this role waits for after entering a trade.
    fn initial_expectation(&self) -> ExpectedMessage;

    /// What this role waits for once the deposit is published. The buyer
    /// waits for nothing until it has announced the payment itself.
    fn after_deposit(&self) -> ExpectedMessage;

    fn funds_needed(&self, amount: u64, security_deposit: u64, tx_fee: u64) -> u64 {
        funds_needed_for_trade(self.role().is_seller(), amount, security_deposit, tx_fee)
    }
}

pub struct BuyerAsMaker;
pub struct BuyerAsTaker;
pub struct SellerAsMaker;
pub struct SellerAsTaker;

impl RoleBehavior for BuyerAsMaker {
    fn role(&self) -> TradeRole {
        TradeRole::BuyerAsMaker
    }
    fn publishes_deposit_tx(&self) -> bool {
        false
    }
    fn sends_payment_started(&self) -> bool {
        true
    }
    fn confirms_payment_received(&self) -> bool {
        false
    }
    fn publishes_payout_tx(&self) -> bool {
        true
    }
    fn initial_expectation(&self) -> ExpectedMessage {
        ExpectedMessage::DepositTxPublished
    }
    fn after_deposit(&self) -> ExpectedMessage {
        ExpectedMessage::Nothing
    }
}

impl RoleBehavior for BuyerAsTaker {
    fn role(&self) -> TradeRole {
        TradeRole::BuyerAsTaker
    }
    fn publishes_deposit_tx(&self) -> bool {
        true
    }
    fn sends_payment_started(&self) -> bool {
        true
    }
    fn confirms_payment_received(&self) -> bool {
        false
    }
    fn publishes_payout_tx(&self) -> bool {
        true
    }
    fn initial_expectation(&self) -> ExpectedMessage {
        ExpectedMessage::PublishDepositTxRequest
    }
    fn after_deposit(&self) -> ExpectedMessage {
        ExpectedMessage::Nothing
    }
}

impl RoleBehavior for SellerAsMaker {
    fn role(&self) -> TradeRole {
        TradeRole::SellerAsMaker
    }
    fn publishes_deposit_tx(&self) -> bool {
        false
    }
    fn sends_payment_started(&self) -> bool {
        false
    }
    fn confirms_payment_received(&self) -> bool {
        true
    }
    fn publishes_payout_tx(&self) -> bool {
        false
    }
    fn initial_expectation(&self) -> ExpectedMessage {
        ExpectedMessage::DepositTxPublished
    }
    fn after_deposit(&self) -> ExpectedMessage {
        ExpectedMessage::FiatTransferStarted
    }
}

impl RoleBehavior for SellerAsTaker {
    fn role(&self) -> TradeRole {
        TradeRole::SellerAsTaker
    }
    fn publishes_deposit_tx(&self) -> bool {
        true
    }
    fn sends_payment_started(&self) -> bool {
        false
    }
    fn confirms_payment_received(&self) -> bool {
        true
    }
    fn publishes_payout_tx(&self) -> bool {
        false
    }
    fn initial_expectation(&self) -> ExpectedMessage {
        ExpectedMessage::PublishDepositTxRequest
    }
    fn after_deposit(&self) -> ExpectedMessage {
        ExpectedMessage::FiatTransferStarted
    }
}

pub fn behavior_for(role: TradeRole) -> &'static dyn RoleBehavior {
    match role {
        TradeRole::BuyerAsMaker => &BuyerAsMaker,
        TradeRole::BuyerAsTaker => &BuyerAsTaker,
        TradeRole::SellerAsMaker => &SellerAsMaker,
        TradeRole::SellerAsTaker => &SellerAsTaker,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const ROLES: [TradeRole; 4] = [
        TradeRole::BuyerAsMaker,
        TradeRole::BuyerAsTaker,
        TradeRole::SellerAsMaker,
        TradeRole::SellerAsTaker,
    ];

    #[test]
    fn behavior_matches_its_role() {
        for role in ROLES {
            let b = behavior_for(role);
            assert_eq!(b.role(), role);
            assert_eq!(b.publishes_deposit_tx(), role.is_taker());
            assert_eq!(b.sends_payment_started(), role.is_buyer());
            assert_eq!(b.publishes_payout_tx(), role.is_buyer());
            assert_eq!(b.confirms_payment_received(), role.is_seller());
        }
    }

    #[test]
    fn exactly_one_side_of_each_duty() {
        // Maker and taker of the same offer never both publish the deposit,
        // buyer and seller never both publish the payout.
        for (maker, taker) in [
            (TradeRole::BuyerAsMaker, TradeRole::SellerAsTaker),
            (TradeRole::SellerAsMaker, TradeRole::BuyerAsTaker),
        ] {
            let (m, t) = (behavior_for(maker), behavior_for(taker));
            assert_ne!(m.publishes_deposit_tx(), t.publishes_deposit_tx());
            assert_ne!(m.publishes_payout_tx(), t.publishes_payout_tx());
            assert_ne!(m.sends_payment_started(), t.sends_payment_started());
        }
    }

    #[test]
    fn seller_funds_include_amount() {
        assert_eq!(behavior_for(TradeRole::SellerAsTaker).funds_needed(100, 10, 1), 112);
        assert_eq!(behavior_for(TradeRole::BuyerAsTaker).funds_needed(100, 10, 1), 12);
    }
}
