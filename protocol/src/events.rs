//! Change notifications for presentation layers.
//!
//! Offer and trade managers publish on `tokio::sync::broadcast` channels.
//! Subscribers that fall behind lose the oldest events, which is fine for
//! UIs that re-query state anyway.

use tokio::sync::broadcast;

use crate::offer::OfferId;
use crate::trade::{ProcessState, TradeId, TradeRole};

pub const EVENT_CAPACITY: usize = 256;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OfferEvent {
    Placed { offer_id: OfferId },
    Reserved { offer_id: OfferId },
    Closed { offer_id: OfferId },
    Removed { offer_id: OfferId },
    BookAdded { offer_id: OfferId },
    BookRemoved { offer_id: OfferId },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TradeEvent {
    Created {
        trade_id: TradeId,
        role: TradeRole,
    },
    StateChanged {
        trade_id: TradeId,
        state: ProcessState,
    },
    DisputeOpened {
        trade_id: TradeId,
    },
    Completed {
        trade_id: TradeId,
    },
    Failed {
        trade_id: TradeId,
        error: String,
    },
}

pub fn offer_channel() -> broadcast::Sender<OfferEvent> {
    broadcast::channel(EVENT_CAPACITY).0
}

pub fn trade_channel() -> broadcast::Sender<TradeEvent> {
    broadcast::channel(EVENT_CAPACITY).0
}
