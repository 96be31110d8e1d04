//! Arbitrage opportunity type.
//!
//! An [`Opportunity`] is a detected edge: the best bid on one venue exceeds
//! the best ask on another for the same canonical pair. The executable size
//! is capped by the top-of-book volume on both legs.
//!
//! # Fingerprint
//!
//! Repeated detections of the same edge must collapse into one cache entry.
//! The fingerprint concatenates both venues, the pair, prices at 10 decimal
//! places and volumes at 8, so an edge keeps its identity exactly as long
//! as the participating tops do not move.
//!
//! # Example
//!
//! ```
//! use arbwatch::domain::{CanonicalPair, Exchange, Opportunity};
//! use rust_decimal::Decimal;
//!
//! let opp = Opportunity::new(
//!     CanonicalPair::from("ETH/USDT"),
//!     Exchange::Bingx,
//!     Exchange::Wallex,
//!     Decimal::from(2001),
//!     Decimal::from(2010),
//!     Decimal::from(10),
//!     Decimal::from(5),
//! );
//!
//! assert_eq!(opp.trade_volume, Decimal::from(5));
//! assert!(opp.profit_percentage > Decimal::ZERO);
//! ```

use rust_decimal::Decimal;

use super::id::{CanonicalPair, Exchange};
use super::quote::monotonic_secs;

#[derive(Debug, Clone, PartialEq)]
pub struct Opportunity {
    pub pair: CanonicalPair,
    /// Venue to buy on (its ask is crossed).
    pub buy_exchange: Exchange,
    /// Venue to sell on (its bid is crossed).
    pub sell_exchange: Exchange,
    /// Ask price on the buy venue.
    pub buy_price: Decimal,
    /// Bid price on the sell venue.
    pub sell_price: Decimal,
    /// Top-of-book volume available at `buy_price`.
    pub buy_volume: Decimal,
    /// Top-of-book volume available at `sell_price`.
    pub sell_volume: Decimal,
    /// Executable size: `min(buy_volume, sell_volume)`, possibly clamped
    /// by per-pair limits at detection time.
    pub trade_volume: Decimal,
    /// `(sell - buy) / buy * 100`.
    pub profit_percentage: Decimal,
    /// `(sell - buy) * trade_volume`.
    pub profit_amount: Decimal,
    pub first_seen: f64,
    pub last_seen: f64,
    /// Bumped on every repeat detection of the same fingerprint.
    pub seen_count: u64,
}

impl Opportunity {
    /// Build an opportunity from the two crossed tops.
    ///
    /// Derived fields (`trade_volume`, `profit_percentage`, `profit_amount`,
    /// timestamps) are computed here; `seen_count` starts at 1.
    pub fn new(
        pair: CanonicalPair,
        buy_exchange: Exchange,
        sell_exchange: Exchange,
        buy_price: Decimal,
        sell_price: Decimal,
        buy_volume: Decimal,
        sell_volume: Decimal,
    ) -> Self {
        let trade_volume = buy_volume.min(sell_volume);
        let spread = sell_price - buy_price;
        let profit_percentage = if buy_price.is_zero() {
            Decimal::ZERO
        } else {
            spread / buy_price * Decimal::from(100)
        };
        let now = monotonic_secs();
        Self {
            pair,
            buy_exchange,
            sell_exchange,
            buy_price,
            sell_price,
            buy_volume,
            sell_volume,
            trade_volume,
            profit_percentage,
            profit_amount: spread * trade_volume,
            first_seen: now,
            last_seen: now,
            seen_count: 1,
        }
    }

    /// Stable identity across repeated detections.
    #[must_use]
    pub fn fingerprint(&self) -> String {
        format!(
            "{}|{}|{}|{:.10}|{:.10}|{:.8}|{:.8}",
            self.buy_exchange,
            self.sell_exchange,
            self.pair,
            self.buy_price,
            self.sell_price,
            self.buy_volume,
            self.sell_volume,
        )
    }

    /// Clamp `trade_volume` to a ceiling, recomputing the profit amount.
    pub fn clamp_volume(&mut self, max_volume: Decimal) {
        if self.trade_volume > max_volume {
            self.trade_volume = max_volume;
            self.profit_amount = (self.sell_price - self.buy_price) * self.trade_volume;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn eth() -> CanonicalPair {
        CanonicalPair::from("ETH/USDT")
    }

    fn sample() -> Opportunity {
        Opportunity::new(
            eth(),
            Exchange::Bingx,
            Exchange::Wallex,
            dec!(2001),
            dec!(2010),
            dec!(10),
            dec!(5),
        )
    }

    #[test]
    fn trade_volume_is_min_of_both_legs() {
        assert_eq!(sample().trade_volume, dec!(5));
    }

    // (2010 - 2001) / 2001 * 100 is just under 0.4498%.
    #[test]
    fn profit_percentage_matches_reference_value() {
        let profit = sample().profit_percentage;
        assert!(profit > dec!(0.4497));
        assert!(profit < dec!(0.4498));
    }

    #[test]
    fn profit_amount_is_spread_times_volume() {
        assert_eq!(sample().profit_amount, dec!(45)); // 9 * 5
    }

    #[test]
    fn fingerprint_pins_prices_and_volumes() {
        let fp = sample().fingerprint();
        assert_eq!(
            fp,
            "bingx|wallex|ETH/USDT|2001.0000000000|2010.0000000000|10.00000000|5.00000000"
        );
    }

    #[test]
    fn identical_edges_share_a_fingerprint() {
        assert_eq!(sample().fingerprint(), sample().fingerprint());
    }

    #[test]
    fn moved_top_changes_the_fingerprint() {
        let mut other = sample();
        other.sell_price = dec!(2011);
        assert_ne!(sample().fingerprint(), other.fingerprint());
    }

    #[test]
    fn clamp_volume_recomputes_profit_amount() {
        let mut opp = sample();
        opp.clamp_volume(dec!(2));
        assert_eq!(opp.trade_volume, dec!(2));
        assert_eq!(opp.profit_amount, dec!(18)); // 9 * 2
    }

    #[test]
    fn clamp_volume_leaves_smaller_sizes_alone() {
        let mut opp = sample();
        opp.clamp_volume(dec!(100));
        assert_eq!(opp.trade_volume, dec!(5));
    }

    #[test]
    fn zero_buy_price_yields_zero_profit_percentage() {
        let opp = Opportunity::new(
            eth(),
            Exchange::Bingx,
            Exchange::Wallex,
            Decimal::ZERO,
            dec!(1),
            dec!(1),
            dec!(1),
        );
        assert_eq!(opp.profit_percentage, Decimal::ZERO);
    }
}
