//! Dashboard wire schema.
//!
//! Every frame is `{"type": <snake_case name>, "data": <payload>}`. Quotes
//! are stamped with display metadata from the symbol registry before they
//! leave the process, so subscribers never need a second lookup table.

use rust_decimal::Decimal;
use serde::Serialize;

use crate::domain::{Opportunity, Quote, StatsSnapshot};
use crate::registry::SymbolRegistry;

#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub enum ServerMessage {
    InitialPrices(Vec<QuoteDto>),
    PriceUpdate(QuoteDto),
    InitialOpportunities(Vec<OpportunityDto>),
    OpportunitiesUpdate(Vec<OpportunityDto>),
    BestOpportunityUpdate(Option<OpportunityDto>),
    RedisStats(SessionStats),
}

impl ServerMessage {
    /// Best updates are control traffic: they bypass the bulk queue and
    /// are never shed.
    #[must_use]
    pub fn is_control(&self) -> bool {
        matches!(self, Self::BestOpportunityUpdate(_))
    }
}

/// A quote as subscribers see it: self-describing.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct QuoteDto {
    pub exchange: String,
    pub symbol: String,
    pub display_symbol: String,
    pub base_currency: String,
    pub currency_name: String,
    pub bid_price: Decimal,
    pub ask_price: Decimal,
    pub bid_volume: Decimal,
    pub ask_volume: Decimal,
    pub timestamp: f64,
}

impl QuoteDto {
    pub fn from_quote(quote: &Quote, registry: &SymbolRegistry) -> Self {
        let meta = registry.describe(&quote.pair);
        Self {
            exchange: quote.exchange.to_string(),
            symbol: quote.pair.as_str().to_string(),
            display_symbol: meta
                .map(|m| m.display_name.clone())
                .unwrap_or_else(|| quote.pair.as_str().to_string()),
            base_currency: meta
                .map(|m| m.base.clone())
                .unwrap_or_else(|| quote.pair.base().to_string()),
            currency_name: meta
                .map(|m| m.currency_name.clone())
                .unwrap_or_else(|| quote.pair.base().to_string()),
            bid_price: quote.bid_price,
            ask_price: quote.ask_price,
            bid_volume: quote.bid_volume,
            ask_volume: quote.ask_volume,
            timestamp: quote.timestamp,
        }
    }
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct OpportunityDto {
    pub symbol: String,
    pub buy_exchange: String,
    pub sell_exchange: String,
    pub buy_price: Decimal,
    pub sell_price: Decimal,
    pub buy_volume: Decimal,
    pub sell_volume: Decimal,
    pub trade_volume: Decimal,
    pub profit_percentage: Decimal,
    pub profit_amount: Decimal,
    pub first_seen: f64,
    pub last_seen: f64,
    pub seen_count: u64,
    pub fingerprint: String,
}

impl From<&Opportunity> for OpportunityDto {
    fn from(opp: &Opportunity) -> Self {
        Self {
            symbol: opp.pair.as_str().to_string(),
            buy_exchange: opp.buy_exchange.to_string(),
            sell_exchange: opp.sell_exchange.to_string(),
            buy_price: opp.buy_price,
            sell_price: opp.sell_price,
            buy_volume: opp.buy_volume,
            sell_volume: opp.sell_volume,
            trade_volume: opp.trade_volume,
            profit_percentage: opp.profit_percentage.round_dp(4),
            profit_amount: opp.profit_amount.round_dp(8),
            first_seen: opp.first_seen,
            last_seen: opp.last_seen,
            seen_count: opp.seen_count,
            fingerprint: opp.fingerprint(),
        }
    }
}

/// Periodic counters plus the per-session stale flag.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct SessionStats {
    #[serde(flatten)]
    pub system: StatsSnapshot,
    /// Set once this session has shed events; the client should refresh.
    pub stale: bool,
}
