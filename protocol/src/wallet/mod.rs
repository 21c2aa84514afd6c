//! # Wallet Service
//!
//! The trade core does not hold keys for the base asset. It asks a
//! [`WalletService`] to reserve funds, build and broadcast deposit and
//! payout transactions, and report deposit confirmations as
//! [`WalletEvent`]s.
//!
//! [`InMemoryWallet`] is a complete in-process implementation used by the
//! tests and by nodes running in development mode.

pub mod memory;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub use memory::InMemoryWallet;

#[derive(Debug, Error)]
pub enum WalletError {
    #[error("insufficient funds: need {needed}, available {available}")]
    InsufficientFunds { needed: u64, available: u64 },

    #[error("nothing reserved under {0}")]
    UnknownReservation(String),

    #[error("transaction rejected: {0}")]
    TransactionRejected(String),

    #[error("wallet unavailable: {0}")]
    Unavailable(String),
}

/// What an address entry is currently used for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum AddressContext {
    OfferFunding,
    MultiSig,
    TradePayout,
    Available,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublishedTx {
    pub tx_id: String,
    pub raw: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WalletEvent {
    DepositConfirmed {
        trade_id: String,
        tx_id: String,
        confirmations: u32,
    },
}

#[async_trait]
pub trait WalletService: Send + Sync {
    /// Spendable balance, net of reservations.
    fn available_balance(&self) -> u64;

    /// Pay a maker or taker fee. Returns the fee transaction id.
    async fn pay_trade_fee(&self, reference_id: &str, fee: u64) -> Result<String, WalletError>;

    /// Earmark `amount` for an offer or trade.
    fn reserve_funds(&self, reference_id: &str, amount: u64) -> Result<(), WalletError>;

    /// Release a reservation. Returns the amount released.
    fn release_funds(&self, reference_id: &str) -> u64;

    /// Address the counterparty should pay this node's payout to.
    fn payout_address(&self, trade_id: &str) -> String;

    /// The maker's half of the deposit transaction.
    async fn prepare_deposit_tx(
        &self,
        trade_id: &str,
        contribution: u64,
    ) -> Result<Vec<u8>, WalletError>;

    /// Complete the maker's prepared deposit with this node's inputs and
    /// broadcast it.
    async fn publish_deposit_tx(
        &self,
        trade_id: &str,
        prepared: &[u8],
    ) -> Result<PublishedTx, WalletError>;

    /// Start reporting confirmations of `tx_id` as wallet events.
    fn watch_deposit(&self, trade_id: &str, tx_id: &str);

    /// The seller's signature over the payout transaction.
    fn sign_payout_tx(&self, trade_id: &str) -> Result<Vec<u8>, WalletError>;

    /// Co-sign and broadcast the payout.
    async fn publish_payout_tx(
        &self,
        trade_id: &str,
        seller_signature: &[u8],
    ) -> Result<PublishedTx, WalletError>;

    /// Return the address entry used by `trade_id` in `context` to the
    /// pool of available addresses, releasing anything still held for it.
    fn swap_trade_entry_to_available(&self, trade_id: &str, context: AddressContext);
}
