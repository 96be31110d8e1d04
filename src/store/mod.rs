//! Top-of-book store: the authoritative hot path.
//!
//! One [`Quote`] per (exchange, pair), replaced only when the incoming
//! sequence is strictly newer. Accepted replacements fan out as
//! [`QuoteChanged`] events through per-subscriber conflating queues, so a
//! slow consumer degrades to "latest per key" instead of back-pressuring
//! collectors. The store itself stays ground truth: consumers that missed
//! intermediate states can always re-read or snapshot.
//!
//! Writers are the collectors (naturally partitioned by key), readers are
//! the detector and the hub. A venue whose collector has been down past
//! the grace period is marked stale; its quotes stay visible in snapshots
//! but are excluded from detection.

mod conflate;

pub use conflate::ConflatingQueue;

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use tracing::debug;

use crate::domain::{BookKey, Exchange, Quote, SystemStats};

/// An accepted quote replacement: the new quote and what it displaced.
#[derive(Debug, Clone)]
pub struct QuoteChanged {
    pub quote: Quote,
    pub previous: Option<Quote>,
}

/// Subscriber handle: a conflating stream of [`QuoteChanged`] events.
pub type QuoteEvents = Arc<ConflatingQueue<BookKey, QuoteChanged>>;

pub struct TopOfBookStore {
    quotes: RwLock<HashMap<BookKey, Quote>>,
    stale: RwLock<HashSet<Exchange>>,
    subscribers: Mutex<Vec<QuoteEvents>>,
    stats: Arc<SystemStats>,
}

impl TopOfBookStore {
    #[must_use]
    pub fn new(stats: Arc<SystemStats>) -> Self {
        Self {
            quotes: RwLock::new(HashMap::new()),
            stale: RwLock::new(HashSet::new()),
            subscribers: Mutex::new(Vec::new()),
            stats,
        }
    }

    /// Register a consumer. Events accepted after this call are delivered,
    /// conflated per key.
    pub fn subscribe(&self) -> QuoteEvents {
        let queue = ConflatingQueue::new();
        self.subscribers.lock().push(queue.clone());
        queue
    }

    /// Insert or replace the quote for its key.
    ///
    /// Rejected (returning `false`) when the stored sequence is equal or
    /// newer; the rejection counter feeds the stats stream.
    pub fn put(&self, quote: Quote) -> bool {
        let key = quote.key();
        let previous = {
            let mut quotes = self.quotes.write();
            if let Some(current) = quotes.get(&key) {
                if quote.sequence <= current.sequence {
                    let stored = current.sequence;
                    drop(quotes);
                    SystemStats::incr(&self.stats.stale_quotes_rejected);
                    debug!(
                        key = %key,
                        incoming = quote.sequence,
                        stored,
                        "Rejected stale quote"
                    );
                    return false;
                }
            }
            quotes.insert(key.clone(), quote.clone())
        };

        let event = QuoteChanged { quote, previous };
        let subscribers = self.subscribers.lock();
        for queue in subscribers.iter() {
            if queue.push(key.clone(), event.clone()) {
                SystemStats::incr(&self.stats.quotes_conflated);
            }
        }
        true
    }

    #[must_use]
    pub fn get(&self, key: &BookKey) -> Option<Quote> {
        self.quotes.read().get(key).cloned()
    }

    /// Consistent point-in-time copy of every stored quote.
    #[must_use]
    pub fn snapshot(&self) -> Vec<Quote> {
        let mut quotes: Vec<_> = self.quotes.read().values().cloned().collect();
        quotes.sort_by(|a, b| {
            a.pair
                .as_str()
                .cmp(b.pair.as_str())
                .then(a.exchange.as_str().cmp(b.exchange.as_str()))
        });
        quotes
    }

    /// All non-stale quotes for one pair, across exchanges.
    #[must_use]
    pub fn quotes_for_pair(&self, pair: &crate::domain::CanonicalPair) -> Vec<Quote> {
        let stale = self.stale.read();
        self.quotes
            .read()
            .values()
            .filter(|q| &q.pair == pair && !stale.contains(&q.exchange))
            .cloned()
            .collect()
    }

    /// Exclude a venue from detection after a protracted disconnect.
    pub fn mark_exchange_stale(&self, exchange: Exchange) {
        if self.stale.write().insert(exchange) {
            debug!(exchange = %exchange, "Exchange marked stale");
        }
    }

    /// Re-admit a venue once its collector is streaming again.
    pub fn mark_exchange_live(&self, exchange: Exchange) {
        if self.stale.write().remove(&exchange) {
            debug!(exchange = %exchange, "Exchange live again");
        }
    }

    /// Drop every quote belonging to a venue (operator stop, long outage).
    pub fn clear_exchange(&self, exchange: Exchange) {
        self.quotes.write().retain(|key, _| key.exchange != exchange);
    }

    #[must_use]
    pub fn is_stale(&self, exchange: Exchange) -> bool {
        self.stale.read().contains(&exchange)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.quotes.read().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
