//! # Protocol Configuration & Constants
//!
//! Every tunable number in Bazaar lives here. The constants are the network
//! defaults; the `*Config` structs carry them at runtime so a node (or a test)
//! can override individual values without touching code paths.
//!
//! Changing the wire-level values (protocol version, message size limit,
//! throttle windows) after release splits the network, so treat them with
//! the respect they deserve.

use std::time::Duration;

use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// Protocol Version
// ---------------------------------------------------------------------------

/// Wire protocol version carried in every envelope. Peers speaking a
/// different version are disconnected on the first message.
pub const PROTOCOL_VERSION: u32 = 1;

/// Crate version string, for logs and the node's `version` command.
pub const CRATE_VERSION: &str = env!("CARGO_PKG_VERSION");

// ---------------------------------------------------------------------------
// Transport Limits
// ---------------------------------------------------------------------------

/// Maximum size of a single encoded envelope. 100 KiB holds the largest
/// legitimate trade message (a prepared deposit transaction) with headroom.
pub const MAX_MESSAGE_SIZE: usize = 100 * 1024;

/// Frames announcing more than this many bytes are not skipped, they kill
/// the stream outright. Skipping a gigabyte of garbage is not "tolerance".
pub const MAX_SKIPPABLE_FRAME: usize = 10 * MAX_MESSAGE_SIZE;

/// Throttle: at most this many messages in the short window...
pub const THROTTLE_SHORT_LIMIT: usize = 10;

/// ...whose length is one second.
pub const THROTTLE_SHORT_WINDOW: Duration = Duration::from_secs(1);

/// Throttle: at most this many messages in the long window...
pub const THROTTLE_LONG_LIMIT: usize = 100;

/// ...whose length is ten seconds. Also the bound on the timestamp ring.
pub const THROTTLE_LONG_WINDOW: Duration = Duration::from_secs(10);

/// A connection that has not received anything for this long is closed.
pub const SOCKET_IDLE_TIMEOUT: Duration = Duration::from_secs(60);

/// Idle connections get a ping after this long so the idle timeout does not
/// fire on a healthy but quiet peer.
pub const KEEP_ALIVE_INTERVAL: Duration = Duration::from_secs(30);

/// Time we give a close-connection notice to reach the peer before the
/// socket is torn down.
pub const CLOSE_GRACE_PERIOD: Duration = Duration::from_millis(200);

/// Outbound dial timeout.
pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// How many times the connection manager retries the seed nodes after the
/// last connection dropped.
pub const MAX_RECONNECT_ATTEMPTS: u32 = 5;

/// Delay between reconnect attempts.
pub const RECONNECT_DELAY: Duration = Duration::from_secs(5);

/// Default P2P listening port.
pub const DEFAULT_P2P_PORT: u16 = 9860;

/// Default metrics (Prometheus) port.
pub const DEFAULT_METRICS_PORT: u16 = 9862;

// ---------------------------------------------------------------------------
// Offer Lifecycle
// ---------------------------------------------------------------------------

/// Time-to-live of an offer record in the overlay. Records not refreshed
/// within this window are considered stale by every other node.
pub const OFFER_TTL: Duration = Duration::from_secs(4 * 60);

/// Full republish happens every `REPUBLISH_FACTOR x TTL`.
pub const REPUBLISH_FACTOR: u32 = 10;

/// Upper bound of the random per-offer delay inside a republish pass.
pub const REPUBLISH_MAX_JITTER: Duration = Duration::from_millis(1000);

/// Delay before a failed republish pass is retried.
pub const REPUBLISH_RETRY_DELAY: Duration = Duration::from_secs(5);

/// Extra republish pass after the network came back, for overlay peers that
/// joined after our first pass and have not seen the records yet.
pub const REPUBLISH_AFTER_RECONNECT_DELAY: Duration = Duration::from_secs(20);

/// Fee the maker pays for publishing an offer, in satoshis.
pub const DEFAULT_MAKER_FEE: u64 = 20_000;

/// Fee the taker pays for taking an offer, in satoshis.
pub const DEFAULT_TAKER_FEE: u64 = 20_000;

// ---------------------------------------------------------------------------
// Trade Protocol
// ---------------------------------------------------------------------------

/// Mining fee allowance per transaction, in satoshis. Funds checks reserve
/// two of these (deposit and payout).
pub const DEFAULT_TX_FEE: u64 = 10_000;

/// Default security deposit each party locks into the deposit transaction.
pub const DEFAULT_SECURITY_DEPOSIT: u64 = 1_000_000;

/// An availability request that gets no answer within this window is
/// treated as "maker offline".
pub const AVAILABILITY_CHECK_TIMEOUT: Duration = Duration::from_secs(30);

/// Default timeout for calls into the application context.
pub const COMMAND_TIMEOUT: Duration = Duration::from_secs(60);

// ---------------------------------------------------------------------------
// Runtime Configuration
// ---------------------------------------------------------------------------

/// Transport-level configuration for connections and the connection manager.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkConfig {
    /// Protocol version we speak and expect.
    pub protocol_version: u32,
    /// Largest envelope we accept or produce.
    pub max_message_size: usize,
    /// Throttle: messages allowed in the short window.
    pub throttle_short_limit: usize,
    /// Throttle: short window length in milliseconds.
    pub throttle_short_window_ms: u64,
    /// Throttle: messages allowed in the long window.
    pub throttle_long_limit: usize,
    /// Throttle: long window length in milliseconds.
    pub throttle_long_window_ms: u64,
    /// Idle timeout in milliseconds.
    pub idle_timeout_ms: u64,
    /// Keep-alive ping interval in milliseconds.
    pub keep_alive_interval_ms: u64,
    /// Grace period after sending a close notice, in milliseconds.
    pub close_grace_period_ms: u64,
    /// Dial timeout in milliseconds.
    pub connect_timeout_ms: u64,
    /// Reconnect attempts after losing every connection.
    pub max_reconnect_attempts: u32,
    /// Delay between reconnect attempts in milliseconds.
    pub reconnect_delay_ms: u64,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            protocol_version: PROTOCOL_VERSION,
            max_message_size: MAX_MESSAGE_SIZE,
            throttle_short_limit: THROTTLE_SHORT_LIMIT,
            throttle_short_window_ms: THROTTLE_SHORT_WINDOW.as_millis() as u64,
            throttle_long_limit: THROTTLE_LONG_LIMIT,
            throttle_long_window_ms: THROTTLE_LONG_WINDOW.as_millis() as u64,
            idle_timeout_ms: SOCKET_IDLE_TIMEOUT.as_millis() as u64,
            keep_alive_interval_ms: KEEP_ALIVE_INTERVAL.as_millis() as u64,
            close_grace_period_ms: CLOSE_GRACE_PERIOD.as_millis() as u64,
            connect_timeout_ms: CONNECT_TIMEOUT.as_millis() as u64,
            max_reconnect_attempts: MAX_RECONNECT_ATTEMPTS,
            reconnect_delay_ms: RECONNECT_DELAY.as_millis() as u64,
        }
    }
}

impl NetworkConfig {
    pub fn idle_timeout(&self) -> Duration {
        Duration::from_millis(self.idle_timeout_ms)
    }

    pub fn keep_alive_interval(&self) -> Duration {
        Duration::from_millis(self.keep_alive_interval_ms)
    }

    pub fn close_grace_period(&self) -> Duration {
        Duration::from_millis(self.close_grace_period_ms)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn reconnect_delay(&self) -> Duration {
        Duration::from_millis(self.reconnect_delay_ms)
    }
}

/// Offer lifecycle configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct OfferConfig {
    /// Overlay time-to-live in milliseconds.
    pub ttl_ms: u64,
    /// Overrides the republish interval (normally `10 x TTL`). Tests use a
    /// short fixed value here.
    pub republish_interval_ms: Option<u64>,
    /// Upper bound for per-offer republish jitter in milliseconds.
    pub republish_max_jitter_ms: u64,
    /// Retry delay after a failed republish, in milliseconds.
    pub retry_delay_ms: u64,
    /// Delay of the extra republish pass after reconnecting, in milliseconds.
    pub after_reconnect_delay_ms: u64,
    /// Maker fee in satoshis.
    pub maker_fee: u64,
}

impl Default for OfferConfig {
    fn default() -> Self {
        Self {
            ttl_ms: OFFER_TTL.as_millis() as u64,
            republish_interval_ms: None,
            republish_max_jitter_ms: REPUBLISH_MAX_JITTER.as_millis() as u64,
            retry_delay_ms: REPUBLISH_RETRY_DELAY.as_millis() as u64,
            after_reconnect_delay_ms: REPUBLISH_AFTER_RECONNECT_DELAY.as_millis() as u64,
            maker_fee: DEFAULT_MAKER_FEE,
        }
    }
}

impl OfferConfig {
    pub fn ttl(&self) -> Duration {
        Duration::from_millis(self.ttl_ms)
    }

    /// Full republish interval: the override if set, else `10 x TTL`.
    pub fn republish_interval(&self) -> Duration {
        match self.republish_interval_ms {
            Some(ms) => Duration::from_millis(ms),
            None => self.ttl() * REPUBLISH_FACTOR,
        }
    }

    /// Lightweight refresh interval: half the TTL.
    pub fn refresh_interval(&self) -> Duration {
        self.ttl() / 2
    }

    pub fn max_jitter(&self) -> Duration {
        Duration::from_millis(self.republish_max_jitter_ms)
    }

    pub fn retry_delay(&self) -> Duration {
        Duration::from_millis(self.retry_delay_ms)
    }

    pub fn after_reconnect_delay(&self) -> Duration {
        Duration::from_millis(self.after_reconnect_delay_ms)
    }
}

/// Trade protocol configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TradeConfig {
    /// Mining fee allowance per transaction, in satoshis.
    pub tx_fee: u64,
    /// Taker fee in satoshis.
    pub taker_fee: u64,
    /// Availability check timeout in milliseconds.
    pub availability_timeout_ms: u64,
}

impl Default for TradeConfig {
    fn default() -> Self {
        Self {
            tx_fee: DEFAULT_TX_FEE,
            taker_fee: DEFAULT_TAKER_FEE,
            availability_timeout_ms: AVAILABILITY_CHECK_TIMEOUT.as_millis() as u64,
        }
    }
}

impl TradeConfig {
    pub fn availability_timeout(&self) -> Duration {
        Duration::from_millis(self.availability_timeout_ms)
    }
}
