//! BingX collector (futures-style venue).
//!
//! Wire protocol:
//! - Binary frames are gzip-compressed JSON; text frames are plain JSON.
//! - The server sends a textual heartbeat `"Ping"`; the client must answer
//!   `"Pong"` before the next ~5 s tick or the server drops the socket.
//! - Subscriptions: `{"id":"<uuid>","reqType":"sub","dataType":"<SYM>@<chan>"}`,
//!   acknowledged with `{"id":"<uuid>","code":0,"msg":""}`.
//! - `bookTicker` delivers tops directly; `incrDepth` delivers a snapshot
//!   tagged `lastUpdateId` followed by diffs whose ids must be contiguous.
//!
//! The venue caps 200 subscriptions per socket and 60 sockets per source
//! IP, so subscriptions are greedily sharded: each shard runs its own
//! socket task feeding a shared bounded channel. Any shard failure tears
//! the whole collector down; the supervisor reconnects everything, which
//! also refreshes all books.

use std::collections::HashMap;
use std::io::Read;
use std::sync::Arc;

use async_trait::async_trait;
use flate2::read::GzDecoder;
use futures_util::{SinkExt, StreamExt};
use rust_decimal::Decimal;
use serde::Deserialize;
use serde_json::json;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::{debug, trace, warn};

use super::{Collector, CollectorEvent, SubscriptionTarget};
use crate::domain::{BookSynchronizer, CanonicalPair, Exchange, Quote, SyncOutcome, SystemStats};
use crate::error::{Error, Result};

/// Venue limit: topics per socket.
pub const MAX_TOPICS_PER_SOCKET: usize = 200;
/// Venue limit: sockets per source IP.
pub const MAX_SOCKETS: usize = 60;

#[derive(Debug, Clone)]
pub struct BingxConfig {
    pub ws_url: String,
    /// Subscribe to `incrDepth` (reconstructed books) instead of
    /// `bookTicker` (server-side tops).
    pub incremental_depth: bool,
    pub max_topics_per_socket: usize,
    pub max_sockets: usize,
}

impl Default for BingxConfig {
    fn default() -> Self {
        Self {
            ws_url: "wss://open-api-swap.bingx.com/swap-market".into(),
            incremental_depth: false,
            max_topics_per_socket: MAX_TOPICS_PER_SOCKET,
            max_sockets: MAX_SOCKETS,
        }
    }
}

pub struct BingxCollector {
    config: BingxConfig,
    stats: Arc<SystemStats>,
    events_tx: mpsc::Sender<CollectorEvent>,
    events_rx: mpsc::Receiver<CollectorEvent>,
    sockets: Vec<JoinHandle<()>>,
}

impl BingxCollector {
    #[must_use]
    pub fn new(config: BingxConfig, stats: Arc<SystemStats>) -> Self {
        let (events_tx, events_rx) = mpsc::channel(1024);
        Self {
            config,
            stats,
            events_tx,
            events_rx,
            sockets: Vec::new(),
        }
    }
}

#[async_trait]
impl Collector for BingxCollector {
    fn exchange(&self) -> Exchange {
        Exchange::Bingx
    }

    async fn connect(&mut self) -> Result<()> {
        // Sockets are opened per shard at subscribe time; validate the
        // endpoint here so a bad URL fails fast.
        url::Url::parse(&self.config.ws_url)?;
        Ok(())
    }

    async fn subscribe(&mut self, targets: &[SubscriptionTarget]) -> Result<()> {
        let shards = shard(targets, self.config.max_topics_per_socket, self.config.max_sockets);
        let covered: usize = shards.iter().map(Vec::len).sum();
        if covered < targets.len() {
            warn!(
                dropped = targets.len() - covered,
                sockets = shards.len(),
                "BingX socket cap reached, some markets not subscribed"
            );
        }

        for chunk in shards {
            let url = self.config.ws_url.clone();
            let incremental = self.config.incremental_depth;
            let events = self.events_tx.clone();
            let stats = self.stats.clone();
            self.sockets.push(tokio::spawn(async move {
                let reason = match socket_task(&url, incremental, &chunk, &events, &stats).await {
                    Ok(()) => "socket closed".to_string(),
                    Err(e) => e.to_string(),
                };
                let _ = events
                    .send(CollectorEvent::Disconnected { reason })
                    .await;
            }));
        }
        Ok(())
    }

    async fn next_event(&mut self) -> Option<CollectorEvent> {
        self.events_rx.recv().await
    }

    async fn shutdown(&mut self) {
        for socket in self.sockets.drain(..) {
            socket.abort();
        }
        // Drop stale events from the torn-down sockets.
        while self.events_rx.try_recv().is_ok() {}
    }
}

/// Greedy sharding: fill each socket to the topic cap, stop at the socket
/// cap.
fn shard(
    targets: &[SubscriptionTarget],
    per_socket: usize,
    max_sockets: usize,
) -> Vec<Vec<SubscriptionTarget>> {
    targets
        .chunks(per_socket.max(1))
        .take(max_sockets.max(1))
        .map(<[SubscriptionTarget]>::to_vec)
        .collect()
}

/// One socket: connect, subscribe its chunk, stream until close or error.
async fn socket_task(
    url: &str,
    incremental: bool,
    chunk: &[SubscriptionTarget],
    events: &mpsc::Sender<CollectorEvent>,
    stats: &SystemStats,
) -> Result<()> {
    let (mut ws, _) = connect_async(url).await?;
    let channel = if incremental { "incrDepth" } else { "bookTicker" };

    for target in chunk {
        let sub = json!({
            "id": uuid::Uuid::new_v4().to_string(),
            "reqType": "sub",
            "dataType": format!("{}@{}", target.native, channel),
        });
        ws.send(Message::Text(sub.to_string())).await?;
    }
    debug!(topics = chunk.len(), channel, "BingX socket subscribed");

    let pairs: HashMap<&str, &CanonicalPair> = chunk
        .iter()
        .map(|t| (t.native.as_str(), &t.pair))
        .collect();
    let mut books: HashMap<String, BookSynchronizer> = HashMap::new();
    let mut ticker_seq: HashMap<String, u64> = HashMap::new();

    while let Some(frame) = ws.next().await {
        let text = match frame? {
            Message::Binary(bytes) => match inflate(&bytes) {
                Ok(text) => text,
                Err(e) => {
                    let _ = events
                        .send(CollectorEvent::DecodeError {
                            detail: format!("gzip: {e}"),
                        })
                        .await;
                    continue;
                }
            },
            Message::Text(text) => text,
            Message::Ping(payload) => {
                ws.send(Message::Pong(payload)).await?;
                continue;
            }
            Message::Close(frame) => {
                return Err(Error::Connection(format!("server close: {frame:?}")));
            }
            _ => continue,
        };

        match parse_frame(&text) {
            Ok(Inbound::Ping) => {
                // Textual heartbeat: answer before the next server tick.
                ws.send(Message::Text("Pong".into())).await?;
                trace!("BingX Pong sent");
            }
            Ok(Inbound::Ack { id, code, msg }) => {
                if code != 0 {
                    SystemStats::incr(&stats.protocol_errors);
                    warn!(id = %id, code, msg = %msg, "BingX subscription rejected");
                }
            }
            Ok(Inbound::BookTicker { symbol, payload }) => {
                let Some(pair) = pairs.get(symbol.as_str()) else {
                    SystemStats::incr(&stats.unknown_symbols);
                    debug!(symbol = %symbol, "Unknown BingX symbol");
                    continue;
                };
                let seq = ticker_seq.entry(symbol.clone()).or_insert(0);
                *seq += 1;
                match payload.to_quote((*pair).clone(), *seq) {
                    Ok(quote) => {
                        let _ = events.send(CollectorEvent::Quote(quote)).await;
                    }
                    Err(e) => {
                        let _ = events
                            .send(CollectorEvent::DecodeError {
                                detail: format!("bookTicker {symbol}: {e}"),
                            })
                            .await;
                    }
                }
            }
            Ok(Inbound::IncrDepth { symbol, payload }) => {
                let Some(pair) = pairs.get(symbol.as_str()) else {
                    SystemStats::incr(&stats.unknown_symbols);
                    debug!(symbol = %symbol, "Unknown BingX symbol");
                    continue;
                };
                let sync = books.entry(symbol.clone()).or_default();
                match apply_depth(sync, &payload) {
                    Ok(true) => {
                        if let Some(quote) = project_quote(sync, (*pair).clone()) {
                            let _ = events.send(CollectorEvent::Quote(quote)).await;
                        }
                    }
                    Ok(false) => {}
                    Err(gap) => {
                        SystemStats::incr(&stats.sequence_gaps);
                        // A resubscribe re-snapshots every topic on this
                        // socket; the cheapest correct recovery.
                        return Err(gap);
                    }
                }
            }
            Ok(Inbound::Other) => {}
            Err(e) => {
                let _ = events
                    .send(CollectorEvent::DecodeError {
                        detail: e.to_string(),
                    })
                    .await;
            }
        }
    }

    Ok(())
}

/// Decompress one gzip frame into text.
fn inflate(bytes: &[u8]) -> Result<String> {
    let mut text = String::new();
    GzDecoder::new(bytes)
        .read_to_string(&mut text)
        .map_err(|e| Error::Decode(format!("gzip inflate: {e}")))?;
    Ok(text)
}

/// Frames the venue sends after subscription.
#[derive(Debug)]
enum Inbound {
    Ping,
    Ack {
        id: String,
        code: i64,
        msg: String,
    },
    BookTicker {
        symbol: String,
        payload: BookTickerPayload,
    },
    IncrDepth {
        symbol: String,
        payload: DepthPayload,
    },
    Other,
}

#[derive(Debug, Deserialize)]
struct BookTickerPayload {
    /// Best bid price.
    b: String,
    /// Best bid volume.
    #[serde(rename = "B")]
    bid_volume: String,
    /// Best ask price.
    a: String,
    /// Best ask volume.
    #[serde(rename = "A")]
    ask_volume: String,
}

impl BookTickerPayload {
    fn to_quote(&self, pair: CanonicalPair, sequence: u64) -> Result<Quote> {
        let parse = |s: &str| -> Result<Decimal> {
            s.parse()
                .map_err(|_| Error::Decode(format!("bad decimal {s:?}")))
        };
        Ok(Quote::new(
            Exchange::Bingx,
            pair,
            parse(&self.b)?,
            parse(&self.bid_volume)?,
            parse(&self.a)?,
            parse(&self.ask_volume)?,
            sequence,
        ))
    }
}

#[derive(Debug, Deserialize)]
struct DepthPayload {
    #[serde(rename = "lastUpdateId")]
    last_update_id: u64,
    /// `"all"` marks a snapshot; anything else is a diff.
    #[serde(default)]
    action: String,
    #[serde(default)]
    bids: Vec<[String; 2]>,
    #[serde(default)]
    asks: Vec<[String; 2]>,
}

impl DepthPayload {
    fn is_snapshot(&self) -> bool {
        self.action == "all"
    }

    fn levels(raw: &[[String; 2]]) -> Result<Vec<(Decimal, Decimal)>> {
        raw.iter()
            .map(|[price, volume]| {
                let price = price
                    .parse()
                    .map_err(|_| Error::Decode(format!("bad price {price:?}")))?;
                let volume = volume
                    .parse()
                    .map_err(|_| Error::Decode(format!("bad volume {volume:?}")))?;
                Ok((price, volume))
            })
            .collect()
    }
}

/// Feed one depth payload into the synchronizer. `Ok(true)` when the book
/// advanced, `Ok(false)` when the diff was buffered, `Err` when
/// continuity is lost and the socket must resubscribe.
fn apply_depth(sync: &mut BookSynchronizer, payload: &DepthPayload) -> Result<bool> {
    let bids = DepthPayload::levels(&payload.bids)?;
    let asks = DepthPayload::levels(&payload.asks)?;

    if payload.is_snapshot() {
        sync.apply_snapshot(&bids, &asks, payload.last_update_id);
        return Ok(true);
    }

    match sync.apply_diff(crate::domain::BookDiff {
        update_id: payload.last_update_id,
        bids,
        asks,
    }) {
        SyncOutcome::Applied => Ok(true),
        SyncOutcome::Buffered => Ok(false),
        SyncOutcome::Resync => Err(Error::SequenceGap {
            expected: sync.book().last_update_id() + 1,
            received: payload.last_update_id,
        }),
    }
}

/// Project the book's tops into a quote; `None` while one side is empty.
fn project_quote(sync: &BookSynchronizer, pair: CanonicalPair) -> Option<Quote> {
    let bid = sync.book().best_bid()?;
    let ask = sync.book().best_ask()?;
    Some(Quote::new(
        Exchange::Bingx,
        pair,
        bid.price,
        bid.volume,
        ask.price,
        ask.volume,
        sync.book().last_update_id(),
    ))
}

fn parse_frame(text: &str) -> Result<Inbound> {
    if text.trim() == "Ping" {
        return Ok(Inbound::Ping);
    }

    let value: serde_json::Value =
        serde_json::from_str(text).map_err(|e| Error::Decode(format!("bad json: {e}")))?;

    if value.get("code").is_some() && value.get("id").is_some() {
        return Ok(Inbound::Ack {
            id: value["id"].as_str().unwrap_or_default().to_string(),
            code: value["code"].as_i64().unwrap_or(-1),
            msg: value["msg"].as_str().unwrap_or_default().to_string(),
        });
    }

    let Some(data_type) = value.get("dataType").and_then(|v| v.as_str()) else {
        return Ok(Inbound::Other);
    };
    let Some((symbol, channel)) = data_type.split_once('@') else {
        return Ok(Inbound::Other);
    };
    let Some(data) = value.get("data") else {
        return Ok(Inbound::Other);
    };

    match channel {
        "bookTicker" => Ok(Inbound::BookTicker {
            symbol: symbol.to_string(),
            payload: serde_json::from_value(data.clone())
                .map_err(|e| Error::Decode(format!("bookTicker payload: {e}")))?,
        }),
        "incrDepth" => Ok(Inbound::IncrDepth {
            symbol: symbol.to_string(),
            payload: serde_json::from_value(data.clone())
                .map_err(|e| Error::Decode(format!("incrDepth payload: {e}")))?,
        }),
        _ => Ok(Inbound::Other),
    }
}
