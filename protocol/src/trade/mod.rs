//! # Trade Module
//!
//! The trade protocol between a maker and a taker, from the availability
//! check to the withdrawal of the payout.
//!
//! ```text
//! types.rs          Trade, TradeRole, ProcessState, LifeCycleState, DisputeState
//! funds.rs          Funds a role must commit to a trade
//! role.rs           What each of the four roles does at each step
//! protocol.rs       Per-trade protocol instance: which message is expected next
//! availability.rs   Taker-side availability checks, one per offer
//! manager.rs        TradeManager: owns all trades and drives the protocol
//! ```
//!
//! ## Message flow
//!
//! ```text
//! taker                                   maker
//!   | -- OfferAvailabilityRequest -------> |
//!   | <------- OfferAvailabilityResponse - |
//!   | -- PayDepositRequest --------------> |   (taker fee paid)
//!   | <---------- PublishDepositTxRequest  |   (maker half of deposit)
//!   | -- DepositTxPublished -------------> |   (offer closed)
//!
//! buyer                                   seller
//!   | -- FiatTransferStarted ------------> |
//!   | <---------- FinalizePayoutTxRequest  |   (seller signature)
//!   | -- PayoutTxPublished --------------> |
//! ```

pub mod availability;
pub mod error;
pub mod funds;
pub mod manager;
pub mod protocol;
pub mod role;
pub mod types;

pub use availability::{await_answer, AvailabilityChecks};
pub use error::TradeError;
pub use funds::funds_needed_for_trade;
pub use manager::{TradeManager, TradeTimerEvent};
pub use protocol::{ExpectedMessage, TradeProtocol};
pub use role::{behavior_for, RoleBehavior};
pub use types::{DisputeState, LifeCycleState, ProcessState, Trade, TradeId, TradeRole};
