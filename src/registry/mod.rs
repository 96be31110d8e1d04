//! Symbol registry: canonical market identities and per-venue aliases.
//!
//! Loaded once at startup from a TOML export of the operator's metadata
//! store (`markets` and `exchange_aliases` tables) and immutable for the
//! process lifetime, so every read is lock-free behind an `Arc`. Changing
//! the market set requires a restart; that is intentional.
//!
//! The alias table must be injective per exchange: two native symbols may
//! map to the same canonical pair, but one native symbol cannot map twice.
//! Ramzinex's opaque numeric pair ids are just another alias spelling.

use std::collections::HashMap;
use std::path::Path;

use rust_decimal::Decimal;
use serde::Deserialize;
use tracing::info;

use crate::domain::{CanonicalPair, Exchange};
use crate::error::{ConfigError, Result};

/// Display and precision metadata for one canonical market.
#[derive(Debug, Clone, PartialEq)]
pub struct SymbolMetadata {
    pub pair: CanonicalPair,
    pub base: String,
    pub quote: String,
    pub display_name: String,
    pub currency_name: String,
    pub price_precision: u32,
    pub amount_precision: u32,
    /// Per-pair profit threshold override, percent.
    pub min_profit: Option<Decimal>,
    /// Smallest executable size worth surfacing.
    pub min_volume: Option<Decimal>,
    /// Ceiling applied to `trade_volume`.
    pub max_volume: Option<Decimal>,
}

#[derive(Debug, Deserialize)]
struct MetadataFile {
    #[serde(default)]
    markets: Vec<MarketRow>,
    #[serde(default)]
    aliases: Vec<AliasRow>,
}

#[derive(Debug, Deserialize)]
struct MarketRow {
    base: String,
    quote: String,
    #[serde(default)]
    display_name: Option<String>,
    #[serde(default)]
    currency_name: Option<String>,
    #[serde(default = "default_price_precision")]
    price_precision: u32,
    #[serde(default = "default_amount_precision")]
    amount_precision: u32,
    #[serde(default = "default_enabled")]
    enabled: bool,
    #[serde(default)]
    min_profit: Option<Decimal>,
    #[serde(default)]
    min_volume: Option<Decimal>,
    #[serde(default)]
    max_volume: Option<Decimal>,
}

#[derive(Debug, Deserialize)]
struct AliasRow {
    exchange: Exchange,
    native: String,
    canonical: String,
}

fn default_price_precision() -> u32 {
    8
}

fn default_amount_precision() -> u32 {
    8
}

fn default_enabled() -> bool {
    true
}

#[derive(Debug, Default)]
pub struct SymbolRegistry {
    markets: HashMap<CanonicalPair, SymbolMetadata>,
    aliases: HashMap<(Exchange, String), CanonicalPair>,
}

impl SymbolRegistry {
    /// Load and validate the metadata file. Any inconsistency is fatal:
    /// the process must not start with a broken market map.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(ConfigError::ReadMetadata)?;
        let file: MetadataFile = toml::from_str(&content).map_err(ConfigError::ParseMetadata)?;
        let registry = Self::from_rows(file)?;
        info!(
            markets = registry.markets.len(),
            aliases = registry.aliases.len(),
            "Symbol registry loaded"
        );
        Ok(registry)
    }

    fn from_rows(file: MetadataFile) -> Result<Self> {
        let mut markets = HashMap::new();
        let mut disabled = std::collections::HashSet::new();
        for row in file.markets {
            if !row.enabled {
                disabled.insert(CanonicalPair::from_assets(&row.base, &row.quote));
                continue;
            }
            let pair = CanonicalPair::from_assets(&row.base, &row.quote);
            let display_name = row.display_name.unwrap_or_else(|| pair.as_str().to_string());
            let currency_name = row.currency_name.unwrap_or_else(|| row.base.clone());
            markets.insert(
                pair.clone(),
                SymbolMetadata {
                    pair,
                    base: row.base.to_ascii_uppercase(),
                    quote: row.quote.to_ascii_uppercase(),
                    display_name,
                    currency_name,
                    price_precision: row.price_precision,
                    amount_precision: row.amount_precision,
                    min_profit: row.min_profit,
                    min_volume: row.min_volume,
                    max_volume: row.max_volume,
                },
            );
        }

        let mut aliases = HashMap::new();
        for row in file.aliases {
            let canonical = CanonicalPair::new(&row.canonical);
            if !markets.contains_key(&canonical) {
                // Aliases for disabled markets are dropped; aliases for
                // markets that never existed are a config bug.
                if disabled.contains(&canonical) {
                    continue;
                }
                return Err(ConfigError::UnknownMarket {
                    exchange: row.exchange.to_string(),
                    native: row.native,
                    canonical: row.canonical,
                }
                .into());
            }
            let key = (row.exchange, row.native.clone());
            if aliases.insert(key, canonical).is_some() {
                return Err(ConfigError::DuplicateAlias {
                    exchange: row.exchange.to_string(),
                    native: row.native,
                }
                .into());
            }
        }

        Ok(Self { markets, aliases })
    }

    /// Map a venue-native symbol to its canonical pair.
    #[must_use]
    pub fn canonicalize(&self, exchange: Exchange, native: &str) -> Option<&CanonicalPair> {
        self.aliases.get(&(exchange, native.to_string()))
    }

    /// Metadata for a canonical pair.
    #[must_use]
    pub fn describe(&self, pair: &CanonicalPair) -> Option<&SymbolMetadata> {
        self.markets.get(pair)
    }

    /// The subscription set for one venue: `(native_symbol, canonical_pair)`.
    #[must_use]
    pub fn for_exchange(&self, exchange: Exchange) -> Vec<(String, CanonicalPair)> {
        let mut targets: Vec<_> = self
            .aliases
            .iter()
            .filter(|((ex, _), _)| *ex == exchange)
            .map(|((_, native), pair)| (native.clone(), pair.clone()))
            .collect();
        targets.sort_by(|a, b| a.0.cmp(&b.0));
        targets
    }

    #[must_use]
    pub fn market_count(&self) -> usize {
        self.markets.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.markets.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const METADATA: &str = r#"
        [[markets]]
        base = "ETH"
        quote = "USDT"
        currency_name = "Ethereum"
        price_precision = 2
        amount_precision = 6

        [[markets]]
        base = "DOGE"
        quote = "USDT"
        display_name = "Dogecoin / Tether"
        enabled = false

        [[aliases]]
        exchange = "bingx"
        native = "ETH-USDT"
        canonical = "ETH/USDT"

        [[aliases]]
        exchange = "wallex"
        native = "ETHUSDT"
        canonical = "ETH/USDT"

        [[aliases]]
        exchange = "ramzinex"
        native = "13"
        canonical = "ETH/USDT"

        [[aliases]]
        exchange = "ramzinex"
        native = "432"
        canonical = "DOGE/USDT"
    "#;

    fn load() -> SymbolRegistry {
        let file: MetadataFile = toml::from_str(METADATA).unwrap();
        SymbolRegistry::from_rows(file).unwrap()
    }

    #[test]
    fn canonicalize_resolves_each_alias_form() {
        let registry = load();
        let eth = CanonicalPair::from("ETH/USDT");
        assert_eq!(registry.canonicalize(Exchange::Bingx, "ETH-USDT"), Some(&eth));
        assert_eq!(registry.canonicalize(Exchange::Wallex, "ETHUSDT"), Some(&eth));
        // Numeric pair id is just another alias spelling.
        assert_eq!(registry.canonicalize(Exchange::Ramzinex, "13"), Some(&eth));
    }

    #[test]
    fn unknown_native_symbol_is_none() {
        let registry = load();
        assert!(registry.canonicalize(Exchange::Bingx, "BTC-USDT").is_none());
        // Same native string on the wrong exchange does not resolve.
        assert!(registry.canonicalize(Exchange::Wallex, "ETH-USDT").is_none());
    }

    #[test]
    fn describe_carries_display_metadata() {
        let registry = load();
        let meta = registry.describe(&CanonicalPair::from("ETH/USDT")).unwrap();
        assert_eq!(meta.currency_name, "Ethereum");
        assert_eq!(meta.price_precision, 2);
        assert_eq!(meta.amount_precision, 6);
        assert_eq!(meta.display_name, "ETH/USDT");
    }

    #[test]
    fn disabled_markets_are_skipped_with_their_aliases() {
        let registry = load();
        assert_eq!(registry.market_count(), 1);
        assert!(registry
            .canonicalize(Exchange::Ramzinex, "432")
            .is_none());
    }

    #[test]
    fn for_exchange_builds_the_subscription_set() {
        let registry = load();
        let targets = registry.for_exchange(Exchange::Ramzinex);
        assert_eq!(targets.len(), 1);
        assert_eq!(targets[0].0, "13");
        assert_eq!(targets[0].1.as_str(), "ETH/USDT");
    }

    #[test]
    fn duplicate_alias_is_fatal() {
        let doubled = format!(
            "{METADATA}\n[[aliases]]\nexchange = \"bingx\"\nnative = \"ETH-USDT\"\ncanonical = \"ETH/USDT\"\n"
        );
        let file: MetadataFile = toml::from_str(&doubled).unwrap();
        assert!(SymbolRegistry::from_rows(file).is_err());
    }

    #[test]
    fn alias_to_missing_market_is_fatal() {
        let bad = r#"
            [[markets]]
            base = "ETH"
            quote = "USDT"

            [[aliases]]
            exchange = "ramzinex"
            native = "999"
            canonical = "999"
        "#;
        let file: MetadataFile = toml::from_str(bad).unwrap();
        assert!(SymbolRegistry::from_rows(file).is_err());
    }
}
