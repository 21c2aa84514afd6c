//! # Prometheus Metrics
//!
//! Exposes operational metrics for the exchange node. Scraped by Prometheus
//! at the `/metrics` HTTP endpoint on the configured metrics port.
//!
//! Counters are driven by [`AppEvent`]s; gauges are sampled from the
//! [`AppHandle`] snapshots on every event and on a slow timer.
//!
//! All metrics are registered in a dedicated [`prometheus::Registry`] so they
//! do not collide with any default global registry consumers.

use axum::http::StatusCode;
use axum::response::IntoResponse;
use prometheus::{Encoder, IntCounter, IntCounterVec, IntGauge, Opts, Registry, TextEncoder};
use std::sync::Arc;

use bazaar_protocol::events::{OfferEvent, TradeEvent};
use bazaar_protocol::{AppEvent, AppHandle};

/// Holds all Prometheus metric handles for the node.
#[derive(Clone)]
pub struct NodeMetrics {
    /// Prometheus registry that owns all metrics below.
    registry: Registry,
    /// Number of currently connected peers.
    pub connected_peers: IntGauge,
    /// Offers this node currently publishes.
    pub open_offers: IntGauge,
    /// Other makers' offers in the local book.
    pub book_offers: IntGauge,
    /// Trades past the deposit and not yet closed.
    pub pending_trades: IntGauge,
    /// Messages received, by message kind.
    pub messages_received_total: IntCounterVec,
    /// Messages successfully written to a peer.
    pub messages_sent_total: IntCounter,
    /// Connections closed because the peer broke a rule.
    pub rule_violations_total: IntCounter,
    pub offers_placed_total: IntCounter,
    pub trades_completed_total: IntCounter,
    pub trades_failed_total: IntCounter,
}

impl NodeMetrics {
    /// Creates and registers all metrics. Call once at startup.
    pub fn new() -> Result<Self, prometheus::Error> {
        let registry = Registry::new_custom(Some("bazaar".into()), None)?;

        let connected_peers = IntGauge::new("connected_peers", "Number of connected peers")?;
        let open_offers = IntGauge::new("open_offers", "Offers published by this node")?;
        let book_offers = IntGauge::new("book_offers", "Offers from other makers in the book")?;
        let pending_trades =
            IntGauge::new("pending_trades", "Trades with a published deposit")?;
        let messages_received_total = IntCounterVec::new(
            Opts::new("messages_received_total", "Messages received by kind"),
            &["kind"],
        )?;
        let messages_sent_total =
            IntCounter::new("messages_sent_total", "Messages written to peers")?;
        let rule_violations_total = IntCounter::new(
            "rule_violations_total",
            "Connections closed after a protocol rule violation",
        )?;
        let offers_placed_total =
            IntCounter::new("offers_placed_total", "Offers placed by this node")?;
        let trades_completed_total =
            IntCounter::new("trades_completed_total", "Trades withdrawn to savings")?;
        let trades_failed_total = IntCounter::new("trades_failed_total", "Trades that failed")?;

        registry.register(Box::new(connected_peers.clone()))?;
        registry.register(Box::new(open_offers.clone()))?;
        registry.register(Box::new(book_offers.clone()))?;
        registry.register(Box::new(pending_trades.clone()))?;
        registry.register(Box::new(messages_received_total.clone()))?;
        registry.register(Box::new(messages_sent_total.clone()))?;
        registry.register(Box::new(rule_violations_total.clone()))?;
        registry.register(Box::new(offers_placed_total.clone()))?;
        registry.register(Box::new(trades_completed_total.clone()))?;
        registry.register(Box::new(trades_failed_total.clone()))?;

        Ok(Self {
            registry,
            connected_peers,
            open_offers,
            book_offers,
            pending_trades,
            messages_received_total,
            messages_sent_total,
            rule_violations_total,
            offers_placed_total,
            trades_completed_total,
            trades_failed_total,
        })
    }

    /// Count one application event.
    pub fn observe(&self, event: &AppEvent) {
        match event {
            AppEvent::MessageReceived { kind } => {
                self.messages_received_total.with_label_values(&[*kind]).inc();
            }
            AppEvent::PeerDisconnected { reason, .. } if reason.is_rule_violation() => {
                self.rule_violations_total.inc();
            }
            AppEvent::Offer(OfferEvent::Placed { .. }) => self.offers_placed_total.inc(),
            AppEvent::Trade(TradeEvent::Completed { .. }) => self.trades_completed_total.inc(),
            AppEvent::Trade(TradeEvent::Failed { .. }) => self.trades_failed_total.inc(),
            _ => {}
        }
    }

    /// Refresh the gauges from the node's current state.
    pub fn sample(&self, handle: &AppHandle) {
        self.connected_peers.set(handle.connection_count() as i64);
        self.open_offers.set(handle.open_offers().len() as i64);
        self.book_offers.set(handle.book_offers().len() as i64);
        self.pending_trades.set(handle.pending_trades().len() as i64);

        // The network layer keeps the running total; catch the counter up.
        let sent = handle.messages_sent();
        let seen = self.messages_sent_total.get();
        if sent > seen {
            self.messages_sent_total.inc_by(sent - seen);
        }
    }

    /// Encodes all registered metrics into the Prometheus text exposition format.
    pub fn encode(&self) -> Result<String, prometheus::Error> {
        let encoder = TextEncoder::new();
        let metric_families = self.registry.gather();
        let mut buffer = Vec::new();
        encoder.encode(&metric_families, &mut buffer)?;
        Ok(String::from_utf8_lossy(&buffer).into_owned())
    }
}

/// Shared metrics state passed to axum handlers.
pub type SharedMetrics = Arc<NodeMetrics>;

/// Axum handler that renders `/metrics` in Prometheus text format.
pub async fn metrics_handler(
    axum::extract::State(metrics): axum::extract::State<SharedMetrics>,
) -> impl IntoResponse {
    match metrics.encode() {
        Ok(body) => (
            StatusCode::OK,
            [("content-type", "text/plain; version=0.0.4; charset=utf-8")],
            body,
        )
            .into_response(),
        Err(e) => {
            tracing::error!("failed to encode metrics: {}", e);
            (StatusCode::INTERNAL_SERVER_ERROR, "metrics encoding failed").into_response()
        }
    }
}
