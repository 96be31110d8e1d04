//! Strongly-typed identifiers for venues and canonical trading pairs.
//!
//! Using newtypes instead of raw strings prevents accidental mixing of
//! exchange-native symbols (which differ per venue) with canonical pair
//! identifiers (which are venue-independent).

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// A monitored venue.
///
/// The set of venues is closed: each one requires a hand-written collector
/// speaking its wire protocol, so a new variant is a code change anyway.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Exchange {
    Bingx,
    Wallex,
    Ramzinex,
}

impl Exchange {
    /// All venues, in a stable order.
    pub const ALL: [Self; 3] = [Self::Bingx, Self::Wallex, Self::Ramzinex];

    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Bingx => "bingx",
            Self::Wallex => "wallex",
            Self::Ramzinex => "ramzinex",
        }
    }
}

impl fmt::Display for Exchange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Exchange {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "bingx" => Ok(Self::Bingx),
            "wallex" => Ok(Self::Wallex),
            "ramzinex" => Ok(Self::Ramzinex),
            other => Err(format!("unknown exchange: {other}")),
        }
    }
}

/// Canonical market identity: `BASE/QUOTE`, uppercased (e.g. `ETH/USDT`).
///
/// Venue-native symbols (`ETH-USDT`, `ETHUSDT`, Ramzinex numeric pair ids)
/// are mapped to this form by the symbol registry.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CanonicalPair(String);

impl CanonicalPair {
    /// Build a canonical pair from base and quote asset codes.
    pub fn from_assets(base: &str, quote: &str) -> Self {
        Self(format!(
            "{}/{}",
            base.to_ascii_uppercase(),
            quote.to_ascii_uppercase()
        ))
    }

    /// Construct from an already-canonical `BASE/QUOTE` string.
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into().to_ascii_uppercase())
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Base asset code (the part before the slash).
    #[must_use]
    pub fn base(&self) -> &str {
        self.0.split('/').next().unwrap_or(&self.0)
    }

    /// Quote asset code (the part after the slash).
    #[must_use]
    pub fn quote(&self) -> &str {
        self.0.split('/').nth(1).unwrap_or("")
    }
}

impl fmt::Display for CanonicalPair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for CanonicalPair {
    fn from(s: &str) -> Self {
        Self::new(s)
    }
}

/// Key for the top-of-book store: one quote per (exchange, pair).
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct BookKey {
    pub exchange: Exchange,
    pub pair: CanonicalPair,
}

impl BookKey {
    pub fn new(exchange: Exchange, pair: CanonicalPair) -> Self {
        Self { exchange, pair }
    }
}

impl fmt::Display for BookKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.exchange, self.pair)
    }
}
