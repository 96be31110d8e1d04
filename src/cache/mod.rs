//! Opportunity cache: dedup by fingerprint, TTL retention, best tracking.
//!
//! A single task owns all cache state (the detector pushes into its inbox),
//! so there is no lock contention under burst. Readers get point-in-time
//! snapshots through oneshot queries on the same inbox, which also keeps
//! snapshot ordering consistent with upserts.
//!
//! Repeat detections of a known fingerprint refresh `last_seen` and bump
//! `seen_count` without re-announcing the opportunity; only genuinely new
//! entries reach subscribers. "Best" is replaced only when a newcomer
//! clears the incumbent by a small epsilon, which stops two equal edges
//! from flapping the dashboard banner.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use rust_decimal::Decimal;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info};

use crate::domain::{monotonic_secs, Opportunity};

/// Hysteresis for replacing the best opportunity, in profit percent.
const BEST_EPSILON: Decimal = Decimal::from_parts(1, 0, 0, false, 2); // 0.01

/// How often expired entries are swept out.
const SWEEP_INTERVAL: Duration = Duration::from_secs(1);

#[derive(Debug, Clone)]
pub struct CacheConfig {
    /// Entries idle past this are dropped (default 60 s).
    pub opportunity_ttl: Duration,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            opportunity_ttl: Duration::from_secs(60),
        }
    }
}

/// Events announced to the hub.
#[derive(Debug, Clone)]
pub enum CacheEvent {
    /// A fingerprint never seen before (repeats are silent).
    Inserted(Opportunity),
    /// The best opportunity changed, possibly to nothing.
    BestChanged(Option<Opportunity>),
}

enum CacheMsg {
    Upsert(Opportunity),
    Snapshot(oneshot::Sender<CacheSnapshot>),
}

/// Point-in-time view: entries ordered by `last_seen` descending.
#[derive(Debug, Clone, Default)]
pub struct CacheSnapshot {
    pub opportunities: Vec<Opportunity>,
    pub best: Option<Opportunity>,
}

/// Handle used by the detector (upserts) and the hub (snapshots).
#[derive(Clone)]
pub struct CacheHandle {
    tx: mpsc::Sender<CacheMsg>,
}

impl CacheHandle {
    pub async fn upsert(&self, opportunity: Opportunity) -> bool {
        self.tx.send(CacheMsg::Upsert(opportunity)).await.is_ok()
    }

    /// Forward opportunities from a detector output channel until it closes.
    pub async fn pump(&self, mut rx: mpsc::Receiver<Opportunity>) {
        while let Some(opp) = rx.recv().await {
            if !self.upsert(opp).await {
                break;
            }
        }
    }

    pub async fn snapshot(&self) -> CacheSnapshot {
        let (tx, rx) = oneshot::channel();
        if self.tx.send(CacheMsg::Snapshot(tx)).await.is_err() {
            return CacheSnapshot::default();
        }
        rx.await.unwrap_or_default()
    }
}

/// Cache state, separated from the task loop so the semantics are testable
/// without spawning anything.
#[derive(Debug, Default)]
pub struct CacheState {
    by_fingerprint: HashMap<String, Opportunity>,
    best_fingerprint: Option<String>,
}

impl CacheState {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or refresh. Returns the events this upsert produced.
    pub fn upsert(&mut self, mut opp: Opportunity) -> Vec<CacheEvent> {
        let fingerprint = opp.fingerprint();
        let mut events = Vec::new();

        if let Some(existing) = self.by_fingerprint.get_mut(&fingerprint) {
            existing.last_seen = monotonic_secs();
            existing.seen_count += 1;
            return events;
        }

        opp.seen_count = 1;
        let is_new_best = match self.best() {
            Some(best) => opp.profit_percentage > best.profit_percentage + BEST_EPSILON,
            None => true,
        };
        self.by_fingerprint.insert(fingerprint.clone(), opp.clone());
        events.push(CacheEvent::Inserted(opp.clone()));
        if is_new_best {
            self.best_fingerprint = Some(fingerprint);
            events.push(CacheEvent::BestChanged(Some(opp)));
        }
        events
    }

    /// Drop entries idle past `ttl`. When the best expires, the survivors
    /// are rescanned and a `BestChanged` is produced (possibly `None`).
    pub fn sweep(&mut self, ttl: Duration) -> Vec<CacheEvent> {
        let cutoff = monotonic_secs() - ttl.as_secs_f64();
        let before = self.by_fingerprint.len();
        self.by_fingerprint.retain(|_, opp| opp.last_seen > cutoff);
        let removed = before - self.by_fingerprint.len();

        let best_lost = self
            .best_fingerprint
            .as_ref()
            .is_some_and(|fp| !self.by_fingerprint.contains_key(fp));
        if !best_lost {
            if removed > 0 {
                debug!(removed, remaining = self.by_fingerprint.len(), "Swept opportunities");
            }
            return Vec::new();
        }

        let new_best = self.rescan_best();
        self.best_fingerprint = new_best.as_ref().map(Opportunity::fingerprint);
        vec![CacheEvent::BestChanged(new_best)]
    }

    /// Highest profit wins; equal profit prefers the larger executable size.
    fn rescan_best(&self) -> Option<Opportunity> {
        self.by_fingerprint
            .values()
            .max_by(|a, b| {
                a.profit_percentage
                    .cmp(&b.profit_percentage)
                    .then(a.trade_volume.cmp(&b.trade_volume))
            })
            .cloned()
    }

    #[must_use]
    pub fn best(&self) -> Option<&Opportunity> {
        self.best_fingerprint
            .as_ref()
            .and_then(|fp| self.by_fingerprint.get(fp))
    }

    #[must_use]
    pub fn get(&self, fingerprint: &str) -> Option<&Opportunity> {
        self.by_fingerprint.get(fingerprint)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.by_fingerprint.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.by_fingerprint.is_empty()
    }

    #[must_use]
    pub fn snapshot(&self) -> CacheSnapshot {
        let mut opportunities: Vec<_> = self.by_fingerprint.values().cloned().collect();
        opportunities.sort_by(|a, b| {
            b.last_seen
                .partial_cmp(&a.last_seen)
                .unwrap_or(std::cmp::Ordering::Equal)
        });
        CacheSnapshot {
            opportunities,
            best: self.best().cloned(),
        }
    }
}

/// Spawn the cache task. Returns the handle plus the join handle.
pub fn spawn(
    config: CacheConfig,
    events: mpsc::Sender<CacheEvent>,
    mut shutdown: watch::Receiver<bool>,
) -> (CacheHandle, Arc<CacheSizeProbe>, JoinHandle<()>) {
    let (tx, mut rx) = mpsc::channel(1024);
    let probe = Arc::new(CacheSizeProbe::default());
    let probe_inner = probe.clone();

    let handle = tokio::spawn(async move {
        info!(ttl_secs = config.opportunity_ttl.as_secs(), "Opportunity cache started");
        let mut state = CacheState::new();
        let mut sweeper = tokio::time::interval(SWEEP_INTERVAL);
        sweeper.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            let produced = tokio::select! {
                msg = rx.recv() => match msg {
                    Some(CacheMsg::Upsert(opp)) => state.upsert(opp),
                    Some(CacheMsg::Snapshot(reply)) => {
                        let _ = reply.send(state.snapshot());
                        Vec::new()
                    }
                    None => break,
                },
                _ = sweeper.tick() => state.sweep(config.opportunity_ttl),
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                    Vec::new()
                }
            };

            probe_inner.set(state.len());
            for event in produced {
                if events.send(event).await.is_err() {
                    return;
                }
            }
        }
        debug!("Opportunity cache stopped");
    });

    (CacheHandle { tx }, probe, handle)
}

/// Lock-free size mirror for the stats reporter: the cache task owns its
/// state, so outsiders read the count from here instead of querying it.
#[derive(Debug, Default)]
pub struct CacheSizeProbe(std::sync::atomic::AtomicUsize);

impl CacheSizeProbe {
    fn set(&self, len: usize) {
        self.0.store(len, std::sync::atomic::Ordering::Relaxed);
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.0.load(std::sync::atomic::Ordering::Relaxed)
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{CanonicalPair, Exchange};
    use rust_decimal_macros::dec;

    fn opp(sell_price: Decimal, volume: Decimal) -> Opportunity {
        Opportunity::new(
            CanonicalPair::from("ETH/USDT"),
            Exchange::Bingx,
            Exchange::Wallex,
            dec!(2001),
            sell_price,
            volume,
            volume,
        )
    }

    #[test]
    fn first_upsert_inserts_and_becomes_best() {
        let mut state = CacheState::new();
        let events = state.upsert(opp(dec!(2010), dec!(5)));

        assert_eq!(state.len(), 1);
        assert!(matches!(events[0], CacheEvent::Inserted(_)));
        assert!(matches!(events[1], CacheEvent::BestChanged(Some(_))));
    }

    // Replaying the same edge must collapse into one entry.
    #[test]
    fn repeated_upserts_bump_seen_count_silently() {
        let mut state = CacheState::new();
        state.upsert(opp(dec!(2010), dec!(5)));

        for _ in 0..99 {
            let events = state.upsert(opp(dec!(2010), dec!(5)));
            assert!(events.is_empty());
        }

        assert_eq!(state.len(), 1);
        let fp = opp(dec!(2010), dec!(5)).fingerprint();
        assert_eq!(state.get(&fp).unwrap().seen_count, 100);
    }

    // seen_count grows monotonically per fingerprint.
    #[test]
    fn seen_count_is_monotone() {
        let mut state = CacheState::new();
        let fp = opp(dec!(2010), dec!(5)).fingerprint();
        let mut last = 0;
        for _ in 0..10 {
            state.upsert(opp(dec!(2010), dec!(5)));
            let count = state.get(&fp).unwrap().seen_count;
            assert!(count > last);
            last = count;
        }
    }

    // A clearly better edge replaces the best.
    #[test]
    fn strictly_better_profit_replaces_best() {
        let mut state = CacheState::new();
        state.upsert(opp(dec!(2010), dec!(5)));

        let events = state.upsert(opp(dec!(2050), dec!(3)));
        assert!(matches!(
            events.last(),
            Some(CacheEvent::BestChanged(Some(best))) if best.sell_price == dec!(2050)
        ));
        assert_eq!(state.best().unwrap().sell_price, dec!(2050));
    }

    #[test]
    fn marginally_better_profit_does_not_flap_best() {
        let mut state = CacheState::new();
        state.upsert(opp(dec!(2010), dec!(5)));

        // ~0.0005% more profit: inside epsilon, best stays put.
        let events = state.upsert(opp(dec!(2010.01), dec!(5)));
        assert_eq!(events.len(), 1);
        assert!(matches!(events[0], CacheEvent::Inserted(_)));
        assert_eq!(state.best().unwrap().sell_price, dec!(2010));
    }

    #[test]
    fn sweep_removes_idle_entries() {
        let mut state = CacheState::new();
        state.upsert(opp(dec!(2010), dec!(5)));

        // Zero TTL expires everything immediately.
        let events = state.sweep(Duration::ZERO);
        assert!(state.is_empty());
        assert!(matches!(events[0], CacheEvent::BestChanged(None)));
    }

    // After ttl with no new detections the cache is empty and best is
    // gone.
    #[test]
    fn sweep_drains_everything_after_ttl() {
        let mut state = CacheState::new();
        state.upsert(opp(dec!(2010), dec!(5)));
        state.upsert(opp(dec!(2020), dec!(2)));
        state.upsert(opp(dec!(2050), dec!(1)));

        state.sweep(Duration::ZERO);
        assert!(state.is_empty());
        assert!(state.best().is_none());
    }

    #[test]
    fn sweep_rescans_best_among_survivors() {
        let mut state = CacheState::new();
        state.upsert(opp(dec!(2050), dec!(3)));
        state.upsert(opp(dec!(2010), dec!(5)));

        // Age only the best entry past the cutoff.
        let best_fp = opp(dec!(2050), dec!(3)).fingerprint();
        state.by_fingerprint.get_mut(&best_fp).unwrap().last_seen -= 120.0;

        let events = state.sweep(Duration::from_secs(60));
        assert_eq!(state.len(), 1);
        assert!(matches!(
            &events[0],
            CacheEvent::BestChanged(Some(best)) if best.sell_price == dec!(2010)
        ));
    }

    #[test]
    fn equal_profit_prefers_larger_volume_on_rescan() {
        let mut state = CacheState::new();
        // Same prices, different volumes: distinct fingerprints, equal profit.
        state.upsert(opp(dec!(2010), dec!(2)));
        state.upsert(opp(dec!(2010), dec!(8)));

        let best = state.rescan_best().unwrap();
        assert_eq!(best.trade_volume, dec!(8));
    }

    #[test]
    fn snapshot_orders_by_recency() {
        let mut state = CacheState::new();
        state.upsert(opp(dec!(2010), dec!(5)));
        state.upsert(opp(dec!(2020), dec!(3)));
        let old_fp = opp(dec!(2010), dec!(5)).fingerprint();
        state.by_fingerprint.get_mut(&old_fp).unwrap().last_seen -= 10.0;

        let snap = state.snapshot();
        assert_eq!(snap.opportunities.len(), 2);
        assert_eq!(snap.opportunities[0].sell_price, dec!(2020));
        assert_eq!(snap.opportunities[1].sell_price, dec!(2010));
    }

    #[tokio::test]
    async fn cache_task_round_trips_upsert_and_snapshot() {
        let (events_tx, mut events_rx) = mpsc::channel(16);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let (handle, probe, join) = spawn(CacheConfig::default(), events_tx, shutdown_rx);

        assert!(handle.upsert(opp(dec!(2010), dec!(5))).await);

        let first = events_rx.recv().await.unwrap();
        assert!(matches!(first, CacheEvent::Inserted(_)));
        let second = events_rx.recv().await.unwrap();
        assert!(matches!(second, CacheEvent::BestChanged(Some(_))));

        let snap = handle.snapshot().await;
        assert_eq!(snap.opportunities.len(), 1);
        assert!(snap.best.is_some());
        assert_eq!(probe.len(), 1);

        shutdown_tx.send(true).unwrap();
        join.await.unwrap();
    }
}
