//! Top-of-book quotes.
//!
//! A [`Quote`] is the best bid and ask for one (exchange, pair), stamped
//! with a monotonic ingestion timestamp and a per-key sequence number.
//! The top-of-book store replaces a quote only when the incoming sequence
//! is strictly greater, so reordered updates are discarded.

use std::sync::OnceLock;
use std::time::Instant;

use rust_decimal::Decimal;

use super::id::{BookKey, CanonicalPair, Exchange};

/// Seconds (fractional) since process start, from a monotonic clock.
///
/// Wall-clock time is unsuitable for ordering and age checks: it can jump.
pub fn monotonic_secs() -> f64 {
    static START: OnceLock<Instant> = OnceLock::new();
    START.get_or_init(Instant::now).elapsed().as_secs_f64()
}

/// Best bid/ask snapshot for one (exchange, pair).
#[derive(Debug, Clone, PartialEq)]
pub struct Quote {
    pub exchange: Exchange,
    pub pair: CanonicalPair,
    pub bid_price: Decimal,
    pub bid_volume: Decimal,
    pub ask_price: Decimal,
    pub ask_volume: Decimal,
    /// Monotonic ingestion instant, fractional seconds.
    pub timestamp: f64,
    /// Monotonically non-decreasing per (exchange, pair).
    pub sequence: u64,
}

impl Quote {
    /// Build a quote stamped with the current monotonic time.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        exchange: Exchange,
        pair: CanonicalPair,
        bid_price: Decimal,
        bid_volume: Decimal,
        ask_price: Decimal,
        ask_volume: Decimal,
        sequence: u64,
    ) -> Self {
        Self {
            exchange,
            pair,
            bid_price,
            bid_volume,
            ask_price,
            ask_volume,
            timestamp: monotonic_secs(),
            sequence,
        }
    }

    #[must_use]
    pub fn key(&self) -> BookKey {
        BookKey::new(self.exchange, self.pair.clone())
    }

    /// Both sides populated with positive prices.
    #[must_use]
    pub fn is_two_sided(&self) -> bool {
        self.bid_price > Decimal::ZERO && self.ask_price > Decimal::ZERO
    }

    /// Sanity check: an uncrossed quote has `ask >= bid` when both sides
    /// are populated. One-sided quotes pass trivially.
    #[must_use]
    pub fn is_coherent(&self) -> bool {
        !self.is_two_sided() || self.ask_price >= self.bid_price
    }
}
