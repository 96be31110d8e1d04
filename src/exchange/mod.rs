//! Exchange collectors: one implementation per venue wire protocol.
//!
//! Every collector exposes the same small capability set (connect,
//! subscribe, stream events) behind the [`Collector`] trait; the
//! venue-agnostic [`supervisor`] owns reconnection, deadlines and the
//! connection state machine. Venue selection is a closed sum type
//! ([`CollectorKind`]) resolved from configuration at startup.

pub mod bingx;
pub mod ramzinex;
pub mod supervisor;
pub mod wallex;

use async_trait::async_trait;

use crate::domain::{CanonicalPair, Exchange, Quote};
use crate::error::Result;

/// One subscription entry: the venue-native symbol and its canonical pair.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubscriptionTarget {
    pub native: String,
    pub pair: CanonicalPair,
}

impl SubscriptionTarget {
    pub fn new(native: impl Into<String>, pair: CanonicalPair) -> Self {
        Self {
            native: native.into(),
            pair,
        }
    }
}

/// Events surfaced by a collector to its supervisor.
#[derive(Debug, Clone)]
pub enum CollectorEvent {
    /// A normalized top-of-book update.
    Quote(Quote),
    /// A frame that could not be decoded; the frame is dropped, the book
    /// is untouched, and the supervisor tracks the error rate.
    DecodeError { detail: String },
    /// The connection is gone; the supervisor reconnects with backoff.
    Disconnected { reason: String },
}

/// Connection lifecycle, tracked by the supervisor and logged on every
/// transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionPhase {
    Disconnected,
    Connecting,
    Handshaking,
    Subscribing,
    Streaming,
    ReconnectBackoff,
    Shutdown,
}

impl ConnectionPhase {
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Disconnected => "disconnected",
            Self::Connecting => "connecting",
            Self::Handshaking => "handshaking",
            Self::Subscribing => "subscribing",
            Self::Streaming => "streaming",
            Self::ReconnectBackoff => "reconnect_backoff",
            Self::Shutdown => "shutdown",
        }
    }
}

/// A venue market-data connection.
///
/// Implementations handle framing, compression, heartbeats and symbol
/// normalization for their venue; they do not reconnect themselves. The
/// supervisor tears a failed collector down and starts over.
#[async_trait]
pub trait Collector: Send {
    fn exchange(&self) -> Exchange;

    /// Open the socket and complete the venue handshake.
    async fn connect(&mut self) -> Result<()>;

    /// Subscribe to the given markets. Called once per connection, after
    /// `connect`.
    async fn subscribe(&mut self, targets: &[SubscriptionTarget]) -> Result<()>;

    /// Next event from the venue. `None` means the stream ended.
    async fn next_event(&mut self) -> Option<CollectorEvent>;

    /// Release sockets and background tasks. Default: drop does it.
    async fn shutdown(&mut self) {}
}

/// The closed set of venue collectors, selected from configuration.
pub enum CollectorKind {
    Bingx(bingx::BingxCollector),
    Wallex(wallex::WallexCollector),
    Ramzinex(ramzinex::RamzinexCollector),
}

#[async_trait]
impl Collector for CollectorKind {
    fn exchange(&self) -> Exchange {
        match self {
            Self::Bingx(c) => c.exchange(),
            Self::Wallex(c) => c.exchange(),
            Self::Ramzinex(c) => c.exchange(),
        }
    }

    async fn connect(&mut self) -> Result<()> {
        match self {
            Self::Bingx(c) => c.connect().await,
            Self::Wallex(c) => c.connect().await,
            Self::Ramzinex(c) => c.connect().await,
        }
    }

    async fn subscribe(&mut self, targets: &[SubscriptionTarget]) -> Result<()> {
        match self {
            Self::Bingx(c) => c.subscribe(targets).await,
            Self::Wallex(c) => c.subscribe(targets).await,
            Self::Ramzinex(c) => c.subscribe(targets).await,
        }
    }

    async fn next_event(&mut self) -> Option<CollectorEvent> {
        match self {
            Self::Bingx(c) => c.next_event().await,
            Self::Wallex(c) => c.next_event().await,
            Self::Ramzinex(c) => c.next_event().await,
        }
    }

    async fn shutdown(&mut self) {
        match self {
            Self::Bingx(c) => c.shutdown().await,
            Self::Wallex(c) => c.shutdown().await,
            Self::Ramzinex(c) => c.shutdown().await,
        }
    }
}

/// Strip the stray U+064E (Arabic fatha) seen prefixed to one venue's
/// channel names in operator configs. The venue accepts only the clean
/// spelling.
#[must_use]
pub fn clean_channel(name: &str) -> &str {
    name.trim_start_matches('\u{064E}')
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn clean_channel_strips_stray_diacritic() {
        assert_eq!(clean_channel("\u{064E}USDTTMN@buyDepth"), "USDTTMN@buyDepth");
    }

    #[test]
    fn clean_channel_keeps_clean_names() {
        assert_eq!(clean_channel("USDTTMN@buyDepth"), "USDTTMN@buyDepth");
    }

    #[test]
    fn phase_names_are_stable() {
        assert_eq!(ConnectionPhase::Streaming.as_str(), "streaming");
        assert_eq!(ConnectionPhase::ReconnectBackoff.as_str(), "reconnect_backoff");
    }
}
