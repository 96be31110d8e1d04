//! Broadcast hub: multiplexes quotes, opportunities, best and stats to
//! dashboard sessions.
//!
//! The hub owns only the subscriber sessions; all upstream state belongs
//! to the store and the cache, from which new sessions take snapshots at
//! open. One pump task fans live events into every session queue:
//!
//! - `price_update` per accepted quote change (conflated when lagging),
//! - `opportunities_update` batches of newly inserted entries, flushed
//!   every 100 ms or at 64 entries,
//! - `best_opportunity_update` immediately, on the control lane,
//! - `redis_stats` every 30 s, carrying each session's stale flag.

pub mod messages;
pub mod server;
mod session;

pub use messages::{OpportunityDto, QuoteDto, ServerMessage, SessionStats};
pub use session::SessionQueue;

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info};

use crate::cache::{CacheEvent, CacheHandle, CacheSizeProbe};
use crate::domain::SystemStats;
use crate::registry::SymbolRegistry;
use crate::store::{QuoteEvents, TopOfBookStore};

#[derive(Debug, Clone)]
pub struct HubConfig {
    /// Data-lane bound per session.
    pub session_queue: usize,
    /// Opportunity batch flush size.
    pub batch_max: usize,
    /// Opportunity batch flush interval.
    pub batch_interval: Duration,
    /// Stats cadence.
    pub stats_interval: Duration,
}

impl Default for HubConfig {
    fn default() -> Self {
        Self {
            session_queue: 1024,
            batch_max: 64,
            batch_interval: Duration::from_millis(100),
            stats_interval: Duration::from_secs(30),
        }
    }
}

pub struct Hub {
    sessions: Mutex<Vec<Arc<SessionQueue>>>,
    registry: Arc<SymbolRegistry>,
    store: Arc<TopOfBookStore>,
    cache: CacheHandle,
    cache_size: Arc<CacheSizeProbe>,
    stats: Arc<SystemStats>,
    config: HubConfig,
}

impl Hub {
    pub fn new(
        registry: Arc<SymbolRegistry>,
        store: Arc<TopOfBookStore>,
        cache: CacheHandle,
        cache_size: Arc<CacheSizeProbe>,
        stats: Arc<SystemStats>,
        config: HubConfig,
    ) -> Self {
        Self {
            sessions: Mutex::new(Vec::new()),
            registry,
            store,
            cache,
            cache_size,
            stats,
            config,
        }
    }

    /// Open a session: deliver the snapshot trio, then register for live
    /// events. The snapshots are taken before registration, so anything
    /// the session misses in between is covered by later live updates.
    pub async fn open_session(&self) -> Arc<SessionQueue> {
        let queue = Arc::new(SessionQueue::new(self.config.session_queue));

        let prices: Vec<_> = self
            .store
            .snapshot()
            .iter()
            .map(|q| QuoteDto::from_quote(q, &self.registry))
            .collect();
        queue.push_ordered(ServerMessage::InitialPrices(prices));

        // The snapshot best summarizes the snapshot it follows, so it is
        // delivered in sequence; only live best changes jump the queue.
        let cache_snap = self.cache.snapshot().await;
        queue.push_ordered(ServerMessage::InitialOpportunities(
            cache_snap.opportunities.iter().map(OpportunityDto::from).collect(),
        ));
        queue.push_ordered(ServerMessage::BestOpportunityUpdate(
            cache_snap.best.as_ref().map(OpportunityDto::from),
        ));

        self.sessions.lock().push(queue.clone());
        info!(sessions = self.session_count(), "Dashboard session opened");
        queue
    }

    #[must_use]
    pub fn session_count(&self) -> usize {
        self.sessions.lock().len()
    }

    /// Push to every live session, dropping closed ones from the registry.
    fn broadcast(&self, message: &ServerMessage) {
        let mut sessions = self.sessions.lock();
        sessions.retain(|s| !s.is_closed());
        for session in sessions.iter() {
            if !session.push(message.clone()) {
                SystemStats::incr(&self.stats.events_shed);
            }
        }
    }

    fn broadcast_stats(&self) {
        let snapshot = self
            .stats
            .snapshot(self.store.len(), self.cache_size.len());
        let mut sessions = self.sessions.lock();
        sessions.retain(|s| !s.is_closed());
        for session in sessions.iter() {
            session.push(ServerMessage::RedisStats(SessionStats {
                system: snapshot.clone(),
                stale: session.is_stale(),
            }));
        }
    }

    /// Run the pump until shutdown. Consumes the store's quote stream and
    /// the cache's event stream.
    pub fn run(
        self: Arc<Self>,
        quote_events: QuoteEvents,
        mut cache_events: mpsc::Receiver<CacheEvent>,
        mut shutdown: watch::Receiver<bool>,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut batch: Vec<OpportunityDto> = Vec::new();
            let mut flush = tokio::time::interval(self.config.batch_interval);
            flush.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            let mut stats_tick = tokio::time::interval(self.config.stats_interval);
            stats_tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    event = quote_events.pop() => {
                        let Some((_, changed)) = event else { break };
                        let dto = QuoteDto::from_quote(&changed.quote, &self.registry);
                        self.broadcast(&ServerMessage::PriceUpdate(dto));
                    }
                    event = cache_events.recv() => {
                        match event {
                            Some(CacheEvent::Inserted(opp)) => {
                                batch.push(OpportunityDto::from(&opp));
                                if batch.len() >= self.config.batch_max {
                                    let full = std::mem::take(&mut batch);
                                    self.broadcast(&ServerMessage::OpportunitiesUpdate(full));
                                }
                            }
                            Some(CacheEvent::BestChanged(best)) => {
                                self.broadcast(&ServerMessage::BestOpportunityUpdate(
                                    best.as_ref().map(OpportunityDto::from),
                                ));
                            }
                            None => break,
                        }
                    }
                    _ = flush.tick() => {
                        if !batch.is_empty() {
                            let full = std::mem::take(&mut batch);
                            self.broadcast(&ServerMessage::OpportunitiesUpdate(full));
                        }
                    }
                    _ = stats_tick.tick() => {
                        self.broadcast_stats();
                    }
                    changed = shutdown.changed() => {
                        if changed.is_err() || *shutdown.borrow() {
                            break;
                        }
                    }
                }
            }

            // Graceful close: sessions drain what they already hold.
            let sessions = self.sessions.lock();
            for session in sessions.iter() {
                session.close();
            }
            debug!("Broadcast hub stopped");
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::CacheConfig;
    use crate::domain::{CanonicalPair, Exchange, Opportunity, Quote};
    use rust_decimal_macros::dec;

    fn quote(seq: u64, bid: rust_decimal::Decimal) -> Quote {
        Quote::new(
            Exchange::Bingx,
            CanonicalPair::from("ETH/USDT"),
            bid,
            dec!(10),
            bid + dec!(1),
            dec!(10),
            seq,
        )
    }

    fn opportunity(sell: rust_decimal::Decimal) -> Opportunity {
        Opportunity::new(
            CanonicalPair::from("ETH/USDT"),
            Exchange::Bingx,
            Exchange::Wallex,
            dec!(2001),
            sell,
            dec!(10),
            dec!(5),
        )
    }

    struct Fixture {
        hub: Arc<Hub>,
        store: Arc<TopOfBookStore>,
        cache: CacheHandle,
        shutdown: watch::Sender<bool>,
        pump: JoinHandle<()>,
        _cache_task: JoinHandle<()>,
    }

    async fn fixture(config: HubConfig) -> Fixture {
        let stats = Arc::new(SystemStats::new());
        let store = Arc::new(TopOfBookStore::new(stats.clone()));
        let registry = Arc::new(SymbolRegistry::default());
        let (cache_events_tx, cache_events_rx) = mpsc::channel(64);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let (cache, cache_size, cache_task) =
            crate::cache::spawn(CacheConfig::default(), cache_events_tx, shutdown_rx.clone());

        let hub = Arc::new(Hub::new(
            registry,
            store.clone(),
            cache.clone(),
            cache_size,
            stats,
            config,
        ));
        let quote_events = store.subscribe();
        let pump = hub.clone().run(quote_events, cache_events_rx, shutdown_rx);

        Fixture {
            hub,
            store,
            cache,
            shutdown: shutdown_tx,
            pump,
            _cache_task: cache_task,
        }
    }

    async fn next_message(queue: &Arc<SessionQueue>) -> ServerMessage {
        tokio::time::timeout(Duration::from_secs(1), queue.pop())
            .await
            .expect("message within deadline")
            .expect("open queue")
    }

    #[tokio::test]
    async fn new_session_receives_snapshot_trio() {
        let f = fixture(HubConfig::default()).await;
        f.store.put(quote(1, dec!(2000)));
        f.cache.upsert(opportunity(dec!(2010))).await;
        // Let the cache task process the upsert before snapshotting.
        tokio::time::sleep(Duration::from_millis(20)).await;

        let session = f.hub.open_session().await;

        match next_message(&session).await {
            ServerMessage::InitialPrices(prices) => assert_eq!(prices.len(), 1),
            other => panic!("expected initial_prices, got {other:?}"),
        }
        match next_message(&session).await {
            ServerMessage::InitialOpportunities(opps) => assert_eq!(opps.len(), 1),
            other => panic!("expected initial_opportunities, got {other:?}"),
        }
        match next_message(&session).await {
            ServerMessage::BestOpportunityUpdate(Some(best)) => {
                assert_eq!(best.sell_price, dec!(2010));
            }
            other => panic!("expected best_opportunity_update, got {other:?}"),
        }

        f.shutdown.send(true).unwrap();
        f.pump.await.unwrap();
    }

    #[tokio::test]
    async fn live_price_updates_reach_registered_sessions() {
        let f = fixture(HubConfig::default()).await;
        let session = f.hub.open_session().await;
        // Drain the snapshot trio.
        for _ in 0..3 {
            next_message(&session).await;
        }

        f.store.put(quote(1, dec!(2005)));
        match next_message(&session).await {
            ServerMessage::PriceUpdate(dto) => assert_eq!(dto.bid_price, dec!(2005)),
            other => panic!("expected price_update, got {other:?}"),
        }

        f.shutdown.send(true).unwrap();
        f.pump.await.unwrap();
    }

    #[tokio::test]
    async fn inserted_opportunities_arrive_batched() {
        let f = fixture(HubConfig {
            batch_interval: Duration::from_millis(20),
            ..HubConfig::default()
        })
        .await;
        let session = f.hub.open_session().await;
        for _ in 0..3 {
            next_message(&session).await;
        }

        f.cache.upsert(opportunity(dec!(2010))).await;
        f.cache.upsert(opportunity(dec!(2020))).await;

        // Cache events also produce best changes on the control lane, and
        // a flush tick may split the two inserts across batches; count the
        // batched opportunities rather than assuming one batch.
        let mut batched = 0;
        for _ in 0..6 {
            match next_message(&session).await {
                ServerMessage::OpportunitiesUpdate(batch) => {
                    batched += batch.len();
                    if batched >= 2 {
                        break;
                    }
                }
                _ => continue,
            }
        }
        assert_eq!(batched, 2);

        f.shutdown.send(true).unwrap();
        f.pump.await.unwrap();
    }

    #[tokio::test]
    async fn best_changes_bypass_batching() {
        let f = fixture(HubConfig {
            // Long flush interval: a batched message would not arrive in time.
            batch_interval: Duration::from_secs(30),
            ..HubConfig::default()
        })
        .await;
        let session = f.hub.open_session().await;
        for _ in 0..3 {
            next_message(&session).await;
        }

        f.cache.upsert(opportunity(dec!(2010))).await;
        match next_message(&session).await {
            ServerMessage::BestOpportunityUpdate(Some(best)) => {
                assert_eq!(best.sell_price, dec!(2010));
            }
            other => panic!("expected best_opportunity_update, got {other:?}"),
        }

        f.shutdown.send(true).unwrap();
        f.pump.await.unwrap();
    }

    #[tokio::test]
    async fn closed_sessions_are_pruned() {
        let f = fixture(HubConfig::default()).await;
        let session = f.hub.open_session().await;
        assert_eq!(f.hub.session_count(), 1);

        session.close();
        f.store.put(quote(1, dec!(2000)));
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(f.hub.session_count(), 0);

        f.shutdown.send(true).unwrap();
        f.pump.await.unwrap();
    }
}
