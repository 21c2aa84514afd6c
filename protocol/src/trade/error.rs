use thiserror::Error;

use super::types::{ProcessState, TradeId};
use crate::network::NetworkError;
use crate::offer::{OfferError, OfferId};
use crate::payment::PaymentMismatch;
use crate::storage::StoreError;
use crate::wallet::WalletError;

#[derive(Debug, Error)]
pub enum TradeError {
    #[error("offer {0} is not available")]
    OfferNotAvailable(OfferId),

    #[error("payment account incompatible with offer: {0}")]
    PaymentAccount(#[from] PaymentMismatch),

    #[error("amount {amount} outside offer range {min}..={max}")]
    InvalidAmount { amount: u64, min: u64, max: u64 },

    #[error("insufficient funds: need {needed}, available {available}")]
    InsufficientFunds { needed: u64, available: u64 },

    #[error("trade {trade_id}: expected state {expected}, trade is in {actual}")]
    StateMismatch {
        trade_id: TradeId,
        expected: ProcessState,
        actual: ProcessState,
    },

    #[error("trade {0} not found")]
    NotFound(TradeId),

    #[error("trade {0} already exists")]
    AlreadyExists(TradeId),

    #[error("availability check for offer {0} already in progress")]
    AvailabilityCheckInProgress(OfferId),

    #[error("trade {0} cannot finish while its protocol is active")]
    ProtocolStillActive(TradeId),

    #[error("this role cannot {0}")]
    WrongRole(&'static str),

    #[error("protocol violation: {0}")]
    ProtocolViolation(String),

    #[error("timed out waiting for {0}")]
    Timeout(String),

    #[error("canceled")]
    Canceled,

    #[error("offer: {0}")]
    Offer(#[from] OfferError),

    #[error("network: {0}")]
    Network(#[from] NetworkError),

    #[error("wallet: {0}")]
    Wallet(#[from] WalletError),

    #[error("storage: {0}")]
    Storage(#[from] StoreError),

    #[error("trade manager is shut down")]
    ShutDown,
}
