// Copyright (c) 2026 ALAS Technology. MIT License.
// See LICENSE for details.

//! # Bazaar Protocol Core Library
//!
//! Coordination core of a peer-to-peer exchange. Makers publish offers to
//! an overlay of peers, takers check that an offer is still there and take
//! it, and both sides then run a trade protocol that moves the base asset
//! through a shared deposit while the counter-currency is paid outside the
//! system.
//!
//! ## Architecture
//!
//! - **network**: TCP peer connections with framing, throttling, rule
//!   violations, keep-alive and reconnect.
//! - **offer**: The maker's open offers, their publication on the overlay,
//!   and the book of everyone else's offers.
//! - **trade**: Availability checks and the four-role trade protocol.
//! - **app**: The single context that owns the managers, and the handle
//!   that talks to it.
//! - **wallet**: Interface to the base-asset wallet, plus an in-memory one.
//! - **storage**: Persistence of offers and trades (sled).
//! - **payment**: Payment accounts and their compatibility with offers.
//! - **crypto**: Node keys and hashing.
//! - **config**: Protocol constants and runtime configuration.
//! - **timer**, **events**: Cancellable timers and change notifications.
//!
//! ## Design Philosophy
//!
//! 1. One logical thread of control for offer and trade state. Timers,
//!    network messages and user commands are all events on it.
//! 2. Collaborators at the edges are traits (`PeerMessenger`,
//!    `OfferOverlay`, `WalletService`, `PersistenceStore`) so the state
//!    machines are tested without sockets or a blockchain.
//! 3. If it touches money, it has tests. Plural.

pub mod app;
pub mod config;
pub mod crypto;
pub mod events;
pub mod network;
pub mod offer;
pub mod payment;
pub mod storage;
pub mod timer;
pub mod trade;
pub mod wallet;

pub use app::{AppConfig, AppError, AppEvent, AppHandle, Application};
