//! Builders for domain fixtures used across test suites.

use rust_decimal::Decimal;

use crate::domain::{CanonicalPair, Exchange, Opportunity, Quote};

/// A two-sided quote with equal volume on both sides.
pub fn quote(
    exchange: Exchange,
    pair: &str,
    bid: Decimal,
    ask: Decimal,
    sequence: u64,
) -> Quote {
    Quote::new(
        exchange,
        CanonicalPair::from(pair),
        bid,
        Decimal::TEN,
        ask,
        Decimal::TEN,
        sequence,
    )
}

/// A quote with explicit per-side volumes.
#[allow(clippy::too_many_arguments)]
pub fn quote_with_volumes(
    exchange: Exchange,
    pair: &str,
    bid: Decimal,
    bid_volume: Decimal,
    ask: Decimal,
    ask_volume: Decimal,
    sequence: u64,
) -> Quote {
    Quote::new(
        exchange,
        CanonicalPair::from(pair),
        bid,
        bid_volume,
        ask,
        ask_volume,
        sequence,
    )
}

/// An opportunity between two fixed venues at the given prices.
pub fn opportunity(pair: &str, buy: Decimal, sell: Decimal, volume: Decimal) -> Opportunity {
    Opportunity::new(
        CanonicalPair::from(pair),
        Exchange::Bingx,
        Exchange::Wallex,
        buy,
        sell,
        volume,
        volume,
    )
}
