//! Dashboard WebSocket endpoint, exercised over a real socket.

use std::sync::Arc;
use std::time::Duration;

use futures_util::{Stream, StreamExt};
use rust_decimal_macros::dec;
use tokio::net::TcpListener;
use tokio::sync::{mpsc, watch};
use tokio_tungstenite::tungstenite::Message;

use arbwatch::cache::{self, CacheConfig};
use arbwatch::domain::{Exchange, SystemStats};
use arbwatch::hub::{server, Hub, HubConfig};
use arbwatch::registry::SymbolRegistry;
use arbwatch::store::TopOfBookStore;
use arbwatch::testkit::domain::quote;

struct Harness {
    url: String,
    store: Arc<TopOfBookStore>,
    shutdown: watch::Sender<bool>,
}

async fn harness() -> Harness {
    let stats = Arc::new(SystemStats::new());
    let store = Arc::new(TopOfBookStore::new(stats.clone()));
    let registry = Arc::new(SymbolRegistry::default());
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let (cache_events_tx, cache_events_rx) = mpsc::channel(64);
    let (cache, cache_size, _cache_task) =
        cache::spawn(CacheConfig::default(), cache_events_tx, shutdown_rx.clone());

    let hub = Arc::new(Hub::new(
        registry,
        store.clone(),
        cache,
        cache_size,
        stats,
        HubConfig {
            stats_interval: Duration::from_millis(200),
            ..HubConfig::default()
        },
    ));
    let _pump = hub
        .clone()
        .run(store.subscribe(), cache_events_rx, shutdown_rx.clone());

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(server::serve_on(listener, hub, shutdown_rx));

    Harness {
        url: format!("ws://{addr}"),
        store,
        shutdown: shutdown_tx,
    }
}

async fn next_json(
    ws: &mut (impl Stream<Item = Result<Message, tokio_tungstenite::tungstenite::Error>> + Unpin),
) -> serde_json::Value {
    loop {
        let frame = tokio::time::timeout(Duration::from_secs(2), ws.next())
            .await
            .expect("frame within deadline")
            .expect("stream open")
            .expect("frame ok");
        if let Message::Text(text) = frame {
            return serde_json::from_str(&text).unwrap();
        }
    }
}

#[tokio::test]
async fn session_open_delivers_snapshots_then_live_updates() {
    let h = harness().await;
    h.store
        .put(quote(Exchange::Bingx, "ETH/USDT", dec!(2000), dec!(2001), 1));

    let (mut ws, _) = tokio_tungstenite::connect_async(&h.url).await.unwrap();

    // Snapshot trio, in the documented open sequence.
    let first = next_json(&mut ws).await;
    assert_eq!(first["type"], "initial_prices");
    assert_eq!(first["data"].as_array().unwrap().len(), 1);
    assert_eq!(first["data"][0]["exchange"], "bingx");
    assert_eq!(first["data"][0]["symbol"], "ETH/USDT");

    assert_eq!(next_json(&mut ws).await["type"], "initial_opportunities");
    assert_eq!(next_json(&mut ws).await["type"], "best_opportunity_update");

    // A live update follows (periodic stats frames may interleave).
    h.store
        .put(quote(Exchange::Bingx, "ETH/USDT", dec!(2002), dec!(2003), 2));
    let update = loop {
        let frame = next_json(&mut ws).await;
        if frame["type"] == "price_update" {
            break frame;
        }
    };
    assert_eq!(update["data"]["bid_price"], "2002");

    h.shutdown.send(true).unwrap();
}

#[tokio::test]
async fn stats_frames_arrive_periodically() {
    let h = harness().await;
    let (mut ws, _) = tokio_tungstenite::connect_async(&h.url).await.unwrap();

    // Skip the snapshot trio, then wait for a stats frame.
    for _ in 0..3 {
        next_json(&mut ws).await;
    }
    let mut saw_stats = false;
    for _ in 0..5 {
        let frame = next_json(&mut ws).await;
        if frame["type"] == "redis_stats" {
            assert!(frame["data"]["uptime"].is_f64());
            assert_eq!(frame["data"]["stale"], false);
            saw_stats = true;
            break;
        }
    }
    assert!(saw_stats);

    h.shutdown.send(true).unwrap();
}

// Per-type delivery order matches production order.
#[tokio::test]
async fn price_updates_arrive_in_production_order() {
    let h = harness().await;
    let (mut ws, _) = tokio_tungstenite::connect_async(&h.url).await.unwrap();
    for _ in 0..3 {
        next_json(&mut ws).await;
    }

    // Distinct pairs so per-key conflation cannot merge them.
    for (i, pair) in ["ETH/USDT", "BTC/USDT", "DOGE/USDT"].iter().enumerate() {
        h.store.put(quote(
            Exchange::Bingx,
            pair,
            dec!(100) + rust_decimal::Decimal::from(i as u32),
            dec!(200),
            1,
        ));
        // Pace the puts so fan-out order is the production order.
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    let mut symbols = Vec::new();
    while symbols.len() < 3 {
        let frame = next_json(&mut ws).await;
        if frame["type"] == "price_update" {
            symbols.push(frame["data"]["symbol"].as_str().unwrap().to_string());
        }
    }
    assert_eq!(symbols, ["ETH/USDT", "BTC/USDT", "DOGE/USDT"]);

    h.shutdown.send(true).unwrap();
}
