//! Arbitrage detector: reacts to quote changes, scans counter-venues.
//!
//! A router task pops conflated [`QuoteChanged`] events from the store and
//! dispatches each to one of `worker_count` workers by pair hash, so
//! updates for a given pair are always handled by the same worker in
//! order. Each worker scans the other venues holding the same pair
//! (O(exchanges) per update, both directions) and sends surviving
//! opportunities to the cache inbox.
//!
//! Thresholds come from the registry when a pair carries its own
//! (`min(buy_side, sell_side)` as the original operator tooling did),
//! falling back to the global `min_profit`.

use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::sync::Arc;

use rust_decimal::Decimal;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, trace};

use crate::domain::{Opportunity, Quote, SystemStats};
use crate::registry::SymbolRegistry;
use crate::store::{QuoteChanged, TopOfBookStore};

#[derive(Debug, Clone)]
pub struct DetectorConfig {
    /// Worker parallelism (`WORKER_COUNT`, default 8).
    pub workers: usize,
    /// Global minimum profit percentage.
    pub min_profit: Decimal,
}

impl Default for DetectorConfig {
    fn default() -> Self {
        Self {
            workers: 8,
            min_profit: Decimal::ZERO,
        }
    }
}

/// Scan counter-venues for one updated quote. Pure: no channels, no tasks.
///
/// For every other exchange holding a non-stale quote for the same pair,
/// both directions are considered: buy where the ask is low, sell where
/// the bid is high. An opportunity survives when `sell > buy`, the profit
/// percentage clears the threshold, and the executable volume fits the
/// pair's bounds.
pub fn scan(
    store: &TopOfBookStore,
    registry: &SymbolRegistry,
    updated: &Quote,
    global_min_profit: Decimal,
) -> Vec<Opportunity> {
    if !updated.is_two_sided() {
        return Vec::new();
    }

    let meta = registry.describe(&updated.pair);
    let pair_threshold = meta.and_then(|m| m.min_profit);
    let min_volume = meta.and_then(|m| m.min_volume);
    let max_volume = meta.and_then(|m| m.max_volume);

    let mut opportunities = Vec::new();
    for counter in store.quotes_for_pair(&updated.pair) {
        if counter.exchange == updated.exchange || !counter.is_two_sided() {
            continue;
        }
        let threshold = pair_threshold.unwrap_or(global_min_profit);
        for (buy, sell) in [(updated, &counter), (&counter, updated)] {
            if let Some(opp) = evaluate(buy, sell, threshold, min_volume, max_volume) {
                opportunities.push(opp);
            }
        }
    }
    opportunities
}

/// Evaluate one direction: buy at `buy.ask`, sell at `sell.bid`.
fn evaluate(
    buy: &Quote,
    sell: &Quote,
    threshold: Decimal,
    min_volume: Option<Decimal>,
    max_volume: Option<Decimal>,
) -> Option<Opportunity> {
    if sell.bid_price <= buy.ask_price {
        return None;
    }

    let mut opp = Opportunity::new(
        buy.pair.clone(),
        buy.exchange,
        sell.exchange,
        buy.ask_price,
        sell.bid_price,
        buy.ask_volume,
        sell.bid_volume,
    );

    if opp.profit_percentage < threshold {
        return None;
    }
    if let Some(max) = max_volume {
        opp.clamp_volume(max);
    }
    if let Some(min) = min_volume {
        if opp.trade_volume < min {
            trace!(
                pair = %opp.pair,
                volume = %opp.trade_volume,
                "Opportunity below minimum volume"
            );
            return None;
        }
    }
    Some(opp)
}

/// Spawn the router plus worker pool. Resolves when the shutdown signal
/// fires or the store closes its event stream.
pub fn spawn(
    store: Arc<TopOfBookStore>,
    registry: Arc<SymbolRegistry>,
    stats: Arc<SystemStats>,
    config: DetectorConfig,
    opportunities: mpsc::Sender<Opportunity>,
    mut shutdown: watch::Receiver<bool>,
) -> JoinHandle<()> {
    let workers = config.workers.max(1);
    let events = store.subscribe();

    tokio::spawn(async move {
        info!(workers, min_profit = %config.min_profit, "Detector started");

        // Per-worker conflating inboxes keep per-pair ordering: the router
        // always maps a pair to the same worker. A full inbox conflates to
        // the latest update per key rather than dropping keys outright.
        let inboxes: Vec<_> = (0..workers).map(|_| crate::store::ConflatingQueue::new()).collect();
        let mut handles = Vec::with_capacity(workers);
        for inbox in &inboxes {
            let inbox = inbox.clone();
            let store = store.clone();
            let registry = registry.clone();
            let stats = stats.clone();
            let opportunities = opportunities.clone();
            let min_profit = config.min_profit;
            handles.push(tokio::spawn(async move {
                while let Some((_, event)) = inbox.pop().await {
                    let event: QuoteChanged = event;
                    let found = scan(&store, &registry, &event.quote, min_profit);
                    for opp in found {
                        SystemStats::incr(&stats.opportunities_detected);
                        if opportunities.send(opp).await.is_err() {
                            return;
                        }
                    }
                }
            }));
        }

        loop {
            tokio::select! {
                event = events.pop() => {
                    let Some((key, changed)) = event else { break };
                    let mut hasher = DefaultHasher::new();
                    key.pair.hash(&mut hasher);
                    let slot = (hasher.finish() as usize) % workers;
                    inboxes[slot].push(key, changed);
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }

        // Drain: let workers finish what is already routed.
        for inbox in &inboxes {
            inbox.close();
        }
        for handle in handles {
            let _ = handle.await;
        }
        debug!("Detector stopped");
    })
}
