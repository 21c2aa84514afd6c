use thiserror::Error;

use super::open_offer::OpenOfferState;
use super::overlay::OverlayError;
use super::types::OfferId;
use crate::payment::PaymentMismatch;
use crate::storage::StoreError;
use crate::wallet::WalletError;

#[derive(Debug, Error)]
pub enum OfferError {
    #[error("invalid offer: {0}")]
    Invalid(String),

    #[error("offer {0} not found")]
    NotFound(OfferId),

    #[error("offer {0} already exists")]
    AlreadyExists(OfferId),

    #[error("offer {offer_id}: illegal transition {from:?} -> {to:?}")]
    IllegalTransition {
        offer_id: OfferId,
        from: OpenOfferState,
        to: OpenOfferState,
    },

    #[error("insufficient funds: need {needed}, have {available}")]
    InsufficientFunds { needed: u64, available: u64 },

    #[error("payment account: {0}")]
    PaymentAccount(#[from] PaymentMismatch),

    #[error("overlay: {0}")]
    Overlay(#[from] OverlayError),

    #[error("wallet: {0}")]
    Wallet(#[from] WalletError),

    #[error("storage: {0}")]
    Storage(#[from] StoreError),

    #[error("offer manager is shut down")]
    ShutDown,
}
