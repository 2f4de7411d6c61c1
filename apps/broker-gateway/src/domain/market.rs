//! Market data value objects.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use super::identifiers::InstrumentKey;

/// Top-of-book quote.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QuoteEvent {
    /// Instrument.
    pub instrument: InstrumentKey,
    /// Best bid.
    pub bid: Option<Decimal>,
    /// Best ask.
    pub ask: Option<Decimal>,
    /// Bid size.
    pub bid_size: Option<Decimal>,
    /// Ask size.
    pub ask_size: Option<Decimal>,
    /// Last trade price.
    pub last: Option<Decimal>,
    /// Exchange timestamp.
    pub timestamp: DateTime<Utc>,
}

impl QuoteEvent {
    /// Midpoint when both sides are present.
    #[must_use]
    pub fn mid(&self) -> Option<Decimal> {
        match (self.bid, self.ask) {
            (Some(bid), Some(ask)) => Some((bid + ask) / Decimal::TWO),
            _ => None,
        }
    }
}

/// Market data subscription request.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct MarketDataSubscription {
    /// Instrument.
    pub instrument: InstrumentKey,
    /// Include depth beyond top-of-book.
    #[serde(default)]
    pub depth: bool,
}
