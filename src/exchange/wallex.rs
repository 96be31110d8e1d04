//! Wallex collector (spot venue, REST + Socket.IO-framed WebSocket).
//!
//! Wire protocol:
//! - Engine.IO framing over WebSocket text frames: `"0"`+JSON handshake,
//!   `"2"` server ping answered with `"3"`, `"4"`+JSON for messages.
//! - Subscribe: `4["subscribe",{"channel":"<SYMBOL>@buyDepth"}]` and the
//!   `sellDepth` twin. Each channel delivers ONE side of the book as an
//!   array of `{price, quantity, sum}` rows, best first; a full quote
//!   exists only once both halves have been seen.
//! - REST `GET /v1/depth?symbol=` primes both halves at subscribe time so
//!   the first quote does not wait for two pushes.
//!
//! Channel names coming from operator config occasionally carry a stray
//! leading U+064E; subscription always uses the sanitized spelling.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use rust_decimal::Decimal;
use serde::Deserialize;
use serde_json::json;
use tokio::net::TcpStream;
use tokio_tungstenite::{connect_async, tungstenite::Message, MaybeTlsStream, WebSocketStream};
use tracing::{debug, trace};

use super::{clean_channel, Collector, CollectorEvent, SubscriptionTarget};
use crate::domain::{monotonic_secs, CanonicalPair, Exchange, Quote, SystemStats};
use crate::error::{Error, Result};

type Socket = WebSocketStream<MaybeTlsStream<TcpStream>>;

#[derive(Debug, Clone)]
pub struct WallexConfig {
    pub ws_url: String,
    pub api_url: String,
    pub api_key: Option<String>,
}

impl Default for WallexConfig {
    fn default() -> Self {
        Self {
            ws_url: "wss://api.wallex.ir/ws".into(),
            api_url: "https://api.wallex.ir".into(),
            api_key: None,
        }
    }
}

/// One side of a pair's book as last delivered by its channel.
#[derive(Debug, Clone, Default)]
struct HalfBook {
    bid: Option<(Decimal, Decimal)>,
    ask: Option<(Decimal, Decimal)>,
}

pub struct WallexCollector {
    config: WallexConfig,
    stats: Arc<SystemStats>,
    http: reqwest::Client,
    ws: Option<Socket>,
    halves: HashMap<String, HalfBook>,
    sequences: HashMap<String, u64>,
    targets: HashMap<String, CanonicalPair>,
    pending: VecDeque<CollectorEvent>,
}

impl WallexCollector {
    #[must_use]
    pub fn new(config: WallexConfig, stats: Arc<SystemStats>) -> Self {
        Self {
            config,
            stats,
            http: reqwest::Client::new(),
            ws: None,
            halves: HashMap::new(),
            sequences: HashMap::new(),
            targets: HashMap::new(),
            pending: VecDeque::new(),
        }
    }

    /// Merge one delivered side into the pair's state; emits a quote once
    /// both sides are known.
    fn merge_side(&mut self, symbol: &str, side: Side, top: Option<(Decimal, Decimal)>) {
        let Some(pair) = self.targets.get(symbol).cloned() else {
            SystemStats::incr(&self.stats.unknown_symbols);
            debug!(symbol, "Unknown Wallex symbol");
            return;
        };

        let half = self.halves.entry(symbol.to_string()).or_default();
        match side {
            Side::Buy => half.bid = top,
            Side::Sell => half.ask = top,
        }

        let (Some((bid_price, bid_volume)), Some((ask_price, ask_volume))) = (half.bid, half.ask)
        else {
            return;
        };

        let seq = self.sequences.entry(symbol.to_string()).or_insert(0);
        *seq += 1;
        let quote = Quote {
            exchange: Exchange::Wallex,
            pair,
            bid_price,
            bid_volume,
            ask_price,
            ask_volume,
            timestamp: monotonic_secs(),
            sequence: *seq,
        };
        // The two halves update independently; while one is stale the
        // combined quote can cross itself. Wait for the other half.
        if !quote.is_coherent() {
            trace!(symbol, "Skipping transiently crossed quote");
            return;
        }
        self.pending.push_back(CollectorEvent::Quote(quote));
    }

    /// REST depth snapshot: primes both halves so the first quote is
    /// immediate.
    async fn prime_from_rest(&mut self, symbol: &str) -> Result<()> {
        let mut request = self
            .http
            .get(format!("{}/v1/depth", self.config.api_url))
            .query(&[("symbol", symbol)]);
        if let Some(key) = &self.config.api_key {
            request = request.header("x-api-key", key);
        }

        let body: DepthResponse = request.send().await?.error_for_status()?.json().await?;
        if !body.success {
            return Err(Error::Protocol(format!("depth request failed for {symbol}")));
        }

        self.merge_side(symbol, Side::Buy, body.result.top_bid()?);
        self.merge_side(symbol, Side::Sell, body.result.top_ask()?);
        Ok(())
    }
}

#[async_trait]
impl Collector for WallexCollector {
    fn exchange(&self) -> Exchange {
        Exchange::Wallex
    }

    async fn connect(&mut self) -> Result<()> {
        let url = format!("{}/?EIO=4&transport=websocket", self.config.ws_url);
        let (mut ws, _) = connect_async(&url).await?;

        // Engine.IO handshake: the server leads with an open frame.
        loop {
            let Some(frame) = ws.next().await else {
                return Err(Error::Connection("closed during handshake".into()));
            };
            if let Message::Text(text) = frame? {
                match parse_frame(&text)? {
                    SioFrame::Open(session) => {
                        debug!(sid = %session.sid, "Wallex Socket.IO session open");
                        break;
                    }
                    SioFrame::Ping => {
                        ws.send(Message::Text("3".into())).await?;
                    }
                    _ => {}
                }
            }
        }

        self.ws = Some(ws);
        self.halves.clear();
        self.pending.clear();
        Ok(())
    }

    async fn subscribe(&mut self, targets: &[SubscriptionTarget]) -> Result<()> {
        self.targets = targets
            .iter()
            .map(|t| (clean_channel(&t.native).to_string(), t.pair.clone()))
            .collect();

        // Prime from REST first: subscription pushes then refresh halves.
        let symbols: Vec<String> = self.targets.keys().cloned().collect();
        for symbol in &symbols {
            if let Err(e) = self.prime_from_rest(symbol).await {
                // The stream will fill the halves shortly; priming is an
                // optimization, not a correctness requirement.
                debug!(symbol = %symbol, error = %e, "Wallex REST priming failed");
            }
        }

        let ws = self.ws.as_mut().ok_or(Error::Connection("not connected".into()))?;
        for symbol in &symbols {
            for channel_kind in ["buyDepth", "sellDepth"] {
                let frame = format!(
                    "4{}",
                    json!(["subscribe", { "channel": format!("{symbol}@{channel_kind}") }])
                );
                ws.send(Message::Text(frame)).await?;
            }
        }
        debug!(markets = symbols.len(), "Wallex subscriptions sent");
        Ok(())
    }

    async fn next_event(&mut self) -> Option<CollectorEvent> {
        loop {
            if let Some(event) = self.pending.pop_front() {
                return Some(event);
            }
            let ws = self.ws.as_mut()?;

            let frame = match ws.next().await? {
                Ok(frame) => frame,
                Err(e) => {
                    return Some(CollectorEvent::Disconnected {
                        reason: e.to_string(),
                    });
                }
            };

            let text = match frame {
                Message::Text(text) => text,
                Message::Ping(payload) => {
                    if ws.send(Message::Pong(payload)).await.is_err() {
                        return Some(CollectorEvent::Disconnected {
                            reason: "pong send failed".into(),
                        });
                    }
                    continue;
                }
                Message::Close(frame) => {
                    return Some(CollectorEvent::Disconnected {
                        reason: format!("server close: {frame:?}"),
                    });
                }
                _ => continue,
            };

            match parse_frame(&text) {
                Ok(SioFrame::Ping) => {
                    if ws.send(Message::Text("3".into())).await.is_err() {
                        return Some(CollectorEvent::Disconnected {
                            reason: "heartbeat send failed".into(),
                        });
                    }
                    trace!("Wallex Socket.IO pong sent");
                }
                Ok(SioFrame::Depth { channel, rows }) => {
                    let Some((symbol, side)) = split_channel(&channel) else {
                        continue;
                    };
                    match top_of_rows(&rows) {
                        Ok(top) => self.merge_side(&symbol, side, top),
                        Err(e) => {
                            return Some(CollectorEvent::DecodeError {
                                detail: format!("{channel}: {e}"),
                            });
                        }
                    }
                }
                Ok(SioFrame::Close) => {
                    return Some(CollectorEvent::Disconnected {
                        reason: "socket.io close".into(),
                    });
                }
                Ok(_) => {}
                Err(e) => {
                    return Some(CollectorEvent::DecodeError {
                        detail: e.to_string(),
                    });
                }
            }
        }
    }

    async fn shutdown(&mut self) {
        if let Some(mut ws) = self.ws.take() {
            let _ = ws.close(None).await;
        }
        self.halves.clear();
        self.pending.clear();
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Side {
    Buy,
    Sell,
}

/// Parsed Engine.IO / Socket.IO frame.
#[derive(Debug)]
enum SioFrame {
    Open(OpenSession),
    Ping,
    Pong,
    Depth { channel: String, rows: Vec<DepthRow> },
    Ack,
    Close,
    Noop,
}

#[derive(Debug, Deserialize)]
struct OpenSession {
    #[serde(default)]
    sid: String,
}

/// REST `GET /v1/depth` body: `{success, result: {ask: [...], bid: [...]}}`.
#[derive(Debug, Deserialize)]
struct DepthResponse {
    #[serde(default)]
    success: bool,
    #[serde(default)]
    result: DepthResult,
}

#[derive(Debug, Default, Deserialize)]
struct DepthResult {
    #[serde(default)]
    ask: Vec<DepthRow>,
    #[serde(default)]
    bid: Vec<DepthRow>,
}

impl DepthResult {
    fn top_bid(&self) -> Result<Option<(Decimal, Decimal)>> {
        top_of_rows(&self.bid)
    }

    fn top_ask(&self) -> Result<Option<(Decimal, Decimal)>> {
        top_of_rows(&self.ask)
    }
}

#[derive(Debug, Deserialize)]
struct DepthRow {
    price: serde_json::Value,
    quantity: serde_json::Value,
    #[serde(default, rename = "sum")]
    _sum: serde_json::Value,
}

fn parse_frame(text: &str) -> Result<SioFrame> {
    let (kind, payload) = text.split_at(text.len().min(1));
    match kind {
        "0" => Ok(SioFrame::Open(
            serde_json::from_str(payload).map_err(|e| Error::Decode(format!("open frame: {e}")))?,
        )),
        "1" => Ok(SioFrame::Close),
        "2" => Ok(SioFrame::Ping),
        "3" => Ok(SioFrame::Pong),
        "6" => Ok(SioFrame::Noop),
        "4" => parse_message(payload),
        _ => Ok(SioFrame::Noop),
    }
}

/// A `4`-frame is a JSON array: `[channel, rows]` for data pushes,
/// anything else is an ack or server notice.
fn parse_message(payload: &str) -> Result<SioFrame> {
    let value: serde_json::Value =
        serde_json::from_str(payload).map_err(|e| Error::Decode(format!("message frame: {e}")))?;
    let Some(items) = value.as_array() else {
        return Ok(SioFrame::Ack);
    };
    if items.len() != 2 {
        return Ok(SioFrame::Ack);
    }
    let Some(channel) = items[0].as_str() else {
        return Ok(SioFrame::Ack);
    };
    if !channel.contains("@buyDepth") && !channel.contains("@sellDepth") {
        return Ok(SioFrame::Ack);
    }
    let rows = serde_json::from_value(items[1].clone())
        .map_err(|e| Error::Decode(format!("depth rows: {e}")))?;
    Ok(SioFrame::Depth {
        channel: channel.to_string(),
        rows,
    })
}

/// `"<SYMBOL>@buyDepth"` → symbol + side.
fn split_channel(channel: &str) -> Option<(String, Side)> {
    let clean = clean_channel(channel);
    let (symbol, kind) = clean.split_once('@')?;
    let side = match kind {
        "buyDepth" => Side::Buy,
        "sellDepth" => Side::Sell,
        _ => return None,
    };
    Some((symbol.to_string(), side))
}

/// The best row of a delivered side; rows arrive best-first. An empty
/// side clears that half.
fn top_of_rows(rows: &[DepthRow]) -> Result<Option<(Decimal, Decimal)>> {
    let Some(first) = rows.first() else {
        return Ok(None);
    };
    Ok(Some((
        decimal_field(&first.price)?,
        decimal_field(&first.quantity)?,
    )))
}

/// Depth rows carry numbers either as JSON strings or raw numbers.
fn decimal_field(value: &serde_json::Value) -> Result<Decimal> {
    let parsed = match value {
        serde_json::Value::String(s) => s.parse().ok(),
        serde_json::Value::Number(n) => n.to_string().parse().ok(),
        _ => None,
    };
    parsed.ok_or_else(|| Error::Decode(format!("bad decimal: {value}")))
}
