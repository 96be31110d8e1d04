//! Ramzinex collector (Centrifugo-based venue).
//!
//! Wire protocol:
//! - Bidirectional JSON envelopes: `{"connect":{...},"id":1}` handshake,
//!   `{"subscribe":{"channel":"orderbook:<pair_id>","recover":true,
//!   "delta":"fossil"},"id":n}`, publications under `push.pub`.
//! - The server pings with an empty `{}`; the client must answer `{}`
//!   within 25 s or be dropped.
//! - Orderbook payloads carry sorted arrays `buys` and `sells` of
//!   `[price, amount, ...]` tuples. Buys are best-first; sells are
//!   best-LAST (the venue sorts both descending). Normalizing into the
//!   local book makes the projection orientation-proof.
//! - In fossil mode each publication carries a channel `offset`; a
//!   publication flagged as delta holds diffs (amount 0 deletes a level)
//!   and offsets must be contiguous. Continuity is guarded by
//!   [`BookSynchronizer`]; a lost run re-subscribes the channel, which
//!   re-snapshots it.
//!
//! Markets are addressed by opaque numeric pair ids; the registry maps
//! them like any other alias.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use rust_decimal::Decimal;
use serde::Deserialize;
use serde_json::json;
use tokio::net::TcpStream;
use tokio_tungstenite::{connect_async, tungstenite::Message, MaybeTlsStream, WebSocketStream};
use tracing::{debug, trace, warn};

use super::{Collector, CollectorEvent, SubscriptionTarget};
use crate::domain::{BookDiff, BookSynchronizer, CanonicalPair, Exchange, Quote, SyncOutcome, SystemStats};
use crate::error::{Error, Result};

type Socket = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Client name announced in the connect envelope.
const CLIENT_NAME: &str = "arbwatch";

#[derive(Debug, Clone)]
pub struct RamzinexConfig {
    pub ws_url: String,
}

impl Default for RamzinexConfig {
    fn default() -> Self {
        Self {
            ws_url: "wss://websocket.ramzinex.com/websocket".into(),
        }
    }
}

pub struct RamzinexCollector {
    config: RamzinexConfig,
    stats: Arc<SystemStats>,
    ws: Option<Socket>,
    books: HashMap<String, BookSynchronizer>,
    targets: HashMap<String, CanonicalPair>,
    next_id: u64,
    pending: VecDeque<CollectorEvent>,
}

impl RamzinexCollector {
    #[must_use]
    pub fn new(config: RamzinexConfig, stats: Arc<SystemStats>) -> Self {
        Self {
            config,
            stats,
            ws: None,
            books: HashMap::new(),
            targets: HashMap::new(),
            next_id: 1,
            pending: VecDeque::new(),
        }
    }

    fn take_id(&mut self) -> u64 {
        let id = self.next_id;
        self.next_id += 1;
        id
    }

    async fn send_subscribe(&mut self, pair_id: &str) -> Result<()> {
        let id = self.take_id();
        let ws = self.ws.as_mut().ok_or(Error::Connection("not connected".into()))?;
        let envelope = json!({
            "subscribe": {
                "channel": format!("orderbook:{pair_id}"),
                "recover": true,
                "delta": "fossil",
            },
            "id": id,
        });
        ws.send(Message::Text(envelope.to_string())).await?;
        Ok(())
    }

    /// Handle one publication; pushes quote/decode events onto `pending`.
    fn handle_publication(&mut self, channel: &str, publication: Publication) {
        let Some(pair_id) = channel.strip_prefix("orderbook:") else {
            return;
        };
        let Some(pair) = self.targets.get(pair_id).cloned() else {
            SystemStats::incr(&self.stats.unknown_symbols);
            debug!(pair_id, "Unknown Ramzinex pair id");
            return;
        };

        let payload: OrderbookPayload = match serde_json::from_value(publication.data) {
            Ok(payload) => payload,
            Err(e) => {
                self.pending.push_back(CollectorEvent::DecodeError {
                    detail: format!("orderbook:{pair_id}: {e}"),
                });
                return;
            }
        };

        let offset = publication.offset;
        let sync = self.books.entry(pair_id.to_string()).or_default();
        let advanced = if payload.delta {
            match (payload.levels(LevelKind::Buys), payload.levels(LevelKind::Sells)) {
                (Ok(bids), Ok(asks)) => match sync.apply_diff(BookDiff {
                    update_id: offset,
                    bids,
                    asks,
                }) {
                    SyncOutcome::Applied => true,
                    SyncOutcome::Buffered => false,
                    SyncOutcome::Resync => {
                        SystemStats::incr(&self.stats.sequence_gaps);
                        warn!(pair_id, offset, "Ramzinex delta continuity lost");
                        self.books.remove(pair_id);
                        self.pending.push_back(CollectorEvent::Disconnected {
                            reason: format!("orderbook:{pair_id} resync required"),
                        });
                        return;
                    }
                },
                (Err(e), _) | (_, Err(e)) => {
                    self.pending.push_back(CollectorEvent::DecodeError {
                        detail: format!("orderbook:{pair_id}: {e}"),
                    });
                    return;
                }
            }
        } else {
            match (payload.levels(LevelKind::Buys), payload.levels(LevelKind::Sells)) {
                (Ok(bids), Ok(asks)) => {
                    sync.apply_snapshot(&bids, &asks, offset);
                    true
                }
                (Err(e), _) | (_, Err(e)) => {
                    self.pending.push_back(CollectorEvent::DecodeError {
                        detail: format!("orderbook:{pair_id}: {e}"),
                    });
                    return;
                }
            }
        };

        if !advanced {
            return;
        }
        let Some(sync) = self.books.get(pair_id) else {
            return;
        };
        let (Some(bid), Some(ask)) = (sync.book().best_bid(), sync.book().best_ask()) else {
            return;
        };
        self.pending.push_back(CollectorEvent::Quote(Quote::new(
            Exchange::Ramzinex,
            pair,
            bid.price,
            bid.volume,
            ask.price,
            ask.volume,
            sync.book().last_update_id(),
        )));
    }
}

#[async_trait]
impl Collector for RamzinexCollector {
    fn exchange(&self) -> Exchange {
        Exchange::Ramzinex
    }

    async fn connect(&mut self) -> Result<()> {
        let (mut ws, _) = connect_async(&self.config.ws_url).await?;
        self.next_id = 1;
        self.books.clear();
        self.pending.clear();

        let id = self.next_id;
        self.next_id += 1;
        let connect = json!({"connect": {"name": CLIENT_NAME}, "id": id});
        ws.send(Message::Text(connect.to_string())).await?;

        // The reply to our connect id completes the handshake; pings that
        // arrive first are answered inline.
        loop {
            let Some(frame) = ws.next().await else {
                return Err(Error::Connection("closed during handshake".into()));
            };
            if let Message::Text(text) = frame? {
                match parse_envelope(&text)? {
                    Envelope::Ping => {
                        ws.send(Message::Text("{}".into())).await?;
                    }
                    Envelope::Reply { id: reply_id } if reply_id == id => {
                        debug!("Ramzinex Centrifugo handshake complete");
                        break;
                    }
                    _ => {}
                }
            }
        }

        self.ws = Some(ws);
        Ok(())
    }

    async fn subscribe(&mut self, targets: &[SubscriptionTarget]) -> Result<()> {
        self.targets = targets
            .iter()
            .map(|t| (t.native.clone(), t.pair.clone()))
            .collect();
        let pair_ids: Vec<String> = self.targets.keys().cloned().collect();
        for pair_id in pair_ids {
            self.send_subscribe(&pair_id).await?;
        }
        debug!(markets = self.targets.len(), "Ramzinex subscriptions sent");
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

            match parse_envelope(&text) {
                Ok(Envelope::Ping) => {
                    // Empty-object heartbeat: answer in kind within 25 s.
                    if ws.send(Message::Text("{}".into())).await.is_err() {
                        return Some(CollectorEvent::Disconnected {
                            reason: "heartbeat send failed".into(),
                        });
                    }
                    trace!("Ramzinex heartbeat answered");
                }
                Ok(Envelope::Push { channel, publication }) => {
                    self.handle_publication(&channel, publication);
                }
                Ok(Envelope::Reply { .. } | Envelope::Other) => {}
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
        self.books.clear();
        self.pending.clear();
    }
}

/// Decoded Centrifugo envelope.
#[derive(Debug)]
enum Envelope {
    /// Empty `{}` server ping.
    Ping,
    /// Reply to a client command (connect or subscribe ack).
    Reply { id: u64 },
    /// Server push with a publication.
    Push {
        channel: String,
        publication: Publication,
    },
    Other,
}

#[derive(Debug, Deserialize)]
struct Publication {
    data: serde_json::Value,
    #[serde(default)]
    offset: u64,
}

fn parse_envelope(text: &str) -> Result<Envelope> {
    let value: serde_json::Value =
        serde_json::from_str(text).map_err(|e| Error::Decode(format!("bad envelope: {e}")))?;
    let Some(object) = value.as_object() else {
        return Ok(Envelope::Other);
    };
    if object.is_empty() {
        return Ok(Envelope::Ping);
    }

    if let Some(push) = object.get("push") {
        let channel = push
            .get("channel")
            .and_then(|v| v.as_str())
            .unwrap_or_default()
            .to_string();
        let publication = push
            .get("pub")
            .cloned()
            .ok_or_else(|| Error::Decode("push without pub".into()))?;
        return Ok(Envelope::Push {
            channel,
            publication: serde_json::from_value(publication)
                .map_err(|e| Error::Decode(format!("bad publication: {e}")))?,
        });
    }

    if let Some(id) = object.get("id").and_then(|v| v.as_u64()) {
        return Ok(Envelope::Reply { id });
    }
    Ok(Envelope::Other)
}

#[derive(Debug, Clone, Copy)]
enum LevelKind {
    Buys,
    Sells,
}

/// Orderbook publication body. Full books and fossil deltas share the
/// shape; `delta` distinguishes them.
#[derive(Debug, Deserialize)]
struct OrderbookPayload {
    #[serde(default)]
    buys: Vec<serde_json::Value>,
    #[serde(default)]
    sells: Vec<serde_json::Value>,
    #[serde(default)]
    delta: bool,
}

impl OrderbookPayload {
    /// Decode one side's `[price, amount, ...]` tuples. Extra tuple
    /// elements (order counts, totals) are ignored.
    fn levels(&self, kind: LevelKind) -> Result<Vec<(Decimal, Decimal)>> {
        let rows = match kind {
            LevelKind::Buys => &self.buys,
            LevelKind::Sells => &self.sells,
        };
        rows.iter()
            .map(|row| {
                let items = row
                    .as_array()
                    .ok_or_else(|| Error::Decode(format!("level not an array: {row}")))?;
                if items.len() < 2 {
                    return Err(Error::Decode(format!("short level: {row}")));
                }
                Ok((tuple_decimal(&items[0])?, tuple_decimal(&items[1])?))
            })
            .collect()
    }
}

fn tuple_decimal(value: &serde_json::Value) -> Result<Decimal> {
    let parsed = match value {
        serde_json::Value::String(s) => s.parse().ok(),
        serde_json::Value::Number(n) => n.to_string().parse().ok(),
        _ => None,
    };
    parsed.ok_or_else(|| Error::Decode(format!("bad decimal: {value}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn collector() -> RamzinexCollector {
        let mut c = RamzinexCollector::new(RamzinexConfig::default(), Arc::new(SystemStats::new()));
        c.targets.insert("13".into(), CanonicalPair::from("ETH/USDT"));
        c
    }

    fn publication(data: serde_json::Value, offset: u64) -> Publication {
        Publication { data, offset }
    }

    #[test]
    fn empty_object_is_ping() {
        assert!(matches!(parse_envelope("{}").unwrap(), Envelope::Ping));
    }

    #[test]
    fn reply_envelope_carries_id() {
        match parse_envelope(r#"{"id":1,"connect":{"client":"x","version":"4"}}"#).unwrap() {
            Envelope::Reply { id } => assert_eq!(id, 1),
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[test]
    fn push_envelope_parses_channel_and_offset() {
        let text = r#"{
            "push": {
                "channel": "orderbook:13",
                "pub": {"data": {"buys": [], "sells": []}, "offset": 42}
            }
        }"#;
        match parse_envelope(text).unwrap() {
            Envelope::Push { channel, publication } => {
                assert_eq!(channel, "orderbook:13");
                assert_eq!(publication.offset, 42);
            }
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[test]
    fn full_book_projects_best_ask_from_sells_tail() {
        let mut c = collector();
        // Sells arrive best-LAST: 2010 then 2005; the ask must be 2005.
        let data = json!({
            "buys": [["2000", "10"], ["1999", "4"]],
            "sells": [["2010", "3"], ["2005", "2"]]
        });
        c.handle_publication("orderbook:13", publication(data, 100));

        match c.pending.pop_front().unwrap() {
            CollectorEvent::Quote(quote) => {
                assert_eq!(quote.bid_price, dec!(2000));
                assert_eq!(quote.ask_price, dec!(2005));
                assert_eq!(quote.ask_volume, dec!(2));
                assert_eq!(quote.sequence, 100);
            }
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[test]
    fn fossil_delta_applies_and_projects() {
        let mut c = collector();
        let full = json!({"buys": [["2000", "10"]], "sells": [["2005", "2"]]});
        c.handle_publication("orderbook:13", publication(full, 100));
        c.pending.clear();

        let delta = json!({
            "delta": true,
            "buys": [["2000", "0"], ["1998", "6"]],
            "sells": []
        });
        c.handle_publication("orderbook:13", publication(delta, 101));

        match c.pending.pop_front().unwrap() {
            CollectorEvent::Quote(quote) => {
                assert_eq!(quote.bid_price, dec!(1998));
                assert_eq!(quote.sequence, 101);
            }
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[test]
    fn offset_gap_past_buffer_requests_resync() {
        let mut c = collector();
        let full = json!({"buys": [["2000", "10"]], "sells": [["2005", "2"]]});
        c.handle_publication("orderbook:13", publication(full, 100));
        c.pending.clear();

        for offset in [103u64, 104, 105, 106] {
            let delta = json!({"delta": true, "buys": [], "sells": []});
            c.handle_publication("orderbook:13", publication(delta, offset));
        }

        assert!(c
            .pending
            .iter()
            .any(|e| matches!(e, CollectorEvent::Disconnected { .. })));
    }

    #[test]
    fn unknown_pair_id_is_dropped() {
        let mut c = collector();
        let data = json!({"buys": [["1", "1"]], "sells": [["2", "1"]]});
        c.handle_publication("orderbook:999", publication(data, 1));
        assert!(c.pending.is_empty());
    }

    #[test]
    fn malformed_levels_are_decode_errors() {
        let mut c = collector();
        let data = json!({"buys": [["2000"]], "sells": []});
        c.handle_publication("orderbook:13", publication(data, 1));
        assert!(matches!(
            c.pending.pop_front().unwrap(),
            CollectorEvent::DecodeError { .. }
        ));
    }

    #[test]
    fn one_sided_book_emits_no_quote() {
        let mut c = collector();
        let data = json!({"buys": [["2000", "10"]], "sells": []});
        c.handle_publication("orderbook:13", publication(data, 1));
        assert!(c.pending.is_empty());
    }

    #[test]
    fn numeric_tuples_decode_like_strings() {
        let payload: OrderbookPayload =
            serde_json::from_value(json!({"buys": [[2000.5, 10]], "sells": [["2005", "2"]]}))
                .unwrap();
        let buys = payload.levels(LevelKind::Buys).unwrap();
        assert_eq!(buys[0], (dec!(2000.5), dec!(10)));
    }
}
