//! Per-subscriber session queue with back-pressure shedding.
//!
//! Each dashboard connection owns one [`SessionQueue`]. Control traffic
//! (best-opportunity updates) rides a separate lane that is drained first
//! and never shed, so the headline number on the dashboard is always
//! current even when the session is drowning in bulk updates. The data
//! lane is bounded: on overflow the oldest data event is dropped and the
//! session is flagged stale so the client knows to refresh from snapshots.
//!
//! Within each lane delivery is FIFO, which is exactly the ordering
//! contract the dashboard relies on.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use parking_lot::Mutex;
use tokio::sync::Notify;

use super::messages::ServerMessage;

#[derive(Debug, Default)]
struct Lanes {
    control: VecDeque<ServerMessage>,
    data: VecDeque<ServerMessage>,
    closed: bool,
}

pub struct SessionQueue {
    lanes: Mutex<Lanes>,
    notify: Notify,
    capacity: usize,
    stale: AtomicBool,
    shed: AtomicU64,
}

impl SessionQueue {
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        Self {
            lanes: Mutex::new(Lanes::default()),
            notify: Notify::new(),
            capacity: capacity.max(1),
            stale: AtomicBool::new(false),
            shed: AtomicU64::new(0),
        }
    }

    /// Enqueue for delivery. Returns `false` when a data event was shed to
    /// make room (the caller counts those).
    pub fn push(&self, message: ServerMessage) -> bool {
        let control = message.is_control();
        self.enqueue(message, control)
    }

    /// Enqueue strictly in order on the data lane, regardless of message
    /// kind. Used for the session-open snapshot sequence, where the best
    /// update must FOLLOW the snapshots it summarizes.
    pub fn push_ordered(&self, message: ServerMessage) -> bool {
        self.enqueue(message, false)
    }

    fn enqueue(&self, message: ServerMessage, control: bool) -> bool {
        let mut kept_all = true;
        {
            let mut lanes = self.lanes.lock();
            if lanes.closed {
                return true;
            }
            if control {
                lanes.control.push_back(message);
            } else {
                if lanes.data.len() >= self.capacity {
                    lanes.data.pop_front();
                    self.stale.store(true, Ordering::Relaxed);
                    self.shed.fetch_add(1, Ordering::Relaxed);
                    kept_all = false;
                }
                lanes.data.push_back(message);
            }
        }
        self.notify.notify_one();
        kept_all
    }

    /// Await the next message, control lane first. `None` once closed and
    /// fully drained.
    pub async fn pop(&self) -> Option<ServerMessage> {
        loop {
            let notified = self.notify.notified();
            {
                let mut lanes = self.lanes.lock();
                if let Some(msg) = lanes.control.pop_front() {
                    self.notify.notify_one();
                    return Some(msg);
                }
                if let Some(msg) = lanes.data.pop_front() {
                    self.notify.notify_one();
                    return Some(msg);
                }
                if lanes.closed {
                    return None;
                }
            }
            notified.await;
        }
    }

    /// Non-blocking pop, used by tests and the writer's drain-on-close.
    pub fn try_pop(&self) -> Option<ServerMessage> {
        let mut lanes = self.lanes.lock();
        lanes.control.pop_front().or_else(|| lanes.data.pop_front())
    }

    pub fn close(&self) {
        self.lanes.lock().closed = true;
        self.notify.notify_waiters();
        self.notify.notify_one();
    }

    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.lanes.lock().closed
    }

    /// Whether this session has ever shed an event.
    #[must_use]
    pub fn is_stale(&self) -> bool {
        self.stale.load(Ordering::Relaxed)
    }

    #[must_use]
    pub fn shed_count(&self) -> u64 {
        self.shed.load(Ordering::Relaxed)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        let lanes = self.lanes.lock();
        lanes.control.len() + lanes.data.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hub::messages::{OpportunityDto, QuoteDto};
    use crate::domain::{CanonicalPair, Exchange, Opportunity, Quote};
    use rust_decimal_macros::dec;

    fn price_update(seq: u64) -> ServerMessage {
        let quote = Quote::new(
            Exchange::Bingx,
            CanonicalPair::from("ETH/USDT"),
            dec!(2000) + rust_decimal::Decimal::from(seq),
            dec!(1),
            dec!(2001) + rust_decimal::Decimal::from(seq),
            dec!(1),
            seq,
        );
        ServerMessage::PriceUpdate(QuoteDto::from_quote(
            &quote,
            &crate::registry::SymbolRegistry::default(),
        ))
    }

    fn best_update() -> ServerMessage {
        let opp = Opportunity::new(
            CanonicalPair::from("ETH/USDT"),
            Exchange::Bingx,
            Exchange::Wallex,
            dec!(2001),
            dec!(2010),
            dec!(5),
            dec!(5),
        );
        ServerMessage::BestOpportunityUpdate(Some(OpportunityDto::from(&opp)))
    }

    #[tokio::test]
    async fn fifo_within_data_lane() {
        let queue = SessionQueue::new(16);
        queue.push(price_update(1));
        queue.push(price_update(2));
        queue.push(price_update(3));

        for expected in 1..=3u64 {
            match queue.pop().await.unwrap() {
                ServerMessage::PriceUpdate(dto) => {
                    assert_eq!(dto.bid_price, dec!(2000) + rust_decimal::Decimal::from(expected));
                }
                other => panic!("unexpected message: {other:?}"),
            }
        }
    }

    #[tokio::test]
    async fn control_lane_jumps_ahead_of_data() {
        let queue = SessionQueue::new(16);
        queue.push(price_update(1));
        queue.push(best_update());

        assert!(queue.pop().await.unwrap().is_control());
        assert!(!queue.pop().await.unwrap().is_control());
    }

    // A 4-slot queue fed 10 price updates and 1 best update.
    #[tokio::test]
    async fn overflow_sheds_oldest_data_and_flags_stale() {
        let queue = SessionQueue::new(4);
        for seq in 1..=10 {
            queue.push(price_update(seq));
        }
        queue.push(best_update());

        assert!(queue.is_stale());
        assert_eq!(queue.shed_count(), 6);

        // Best first, then the surviving last four updates in order.
        assert!(queue.pop().await.unwrap().is_control());
        let mut delivered = Vec::new();
        while let Some(msg) = queue.try_pop() {
            if let ServerMessage::PriceUpdate(dto) = msg {
                delivered.push(dto.bid_price - dec!(2000));
            }
        }
        assert_eq!(
            delivered,
            vec![dec!(7), dec!(8), dec!(9), dec!(10)]
        );
    }

    #[tokio::test]
    async fn best_update_is_never_shed() {
        let queue = SessionQueue::new(1);
        for _ in 0..5 {
            queue.push(best_update());
        }
        queue.push(price_update(1));

        let mut best_count = 0;
        while let Some(msg) = queue.try_pop() {
            if msg.is_control() {
                best_count += 1;
            }
        }
        assert_eq!(best_count, 5);
    }

    #[tokio::test]
    async fn close_drains_then_ends() {
        let queue = SessionQueue::new(4);
        queue.push(price_update(1));
        queue.close();

        assert!(queue.pop().await.is_some());
        assert!(queue.pop().await.is_none());
    }

    #[tokio::test]
    async fn push_after_close_is_ignored() {
        let queue = SessionQueue::new(4);
        queue.close();
        queue.push(price_update(1));
        assert!(queue.pop().await.is_none());
    }
}
