//! Mock [`Collector`] implementations.
//!
//! [`ScriptedCollector`] replays a fixed event queue, then blocks forever
//! (a quiet but healthy connection). Connect/subscribe results can be
//! scripted per call; shared counters let tests assert reconnect and
//! resubscribe behavior.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;

use crate::domain::Exchange;
use crate::error::{Error, Result};
use crate::exchange::{Collector, CollectorEvent, SubscriptionTarget};

/// Shared call counters for a [`ScriptedCollector`].
#[derive(Clone, Default)]
pub struct CollectorCounters {
    connects: Arc<AtomicU32>,
    subscribes: Arc<AtomicU32>,
}

impl CollectorCounters {
    #[must_use]
    pub fn connects(&self) -> u32 {
        self.connects.load(Ordering::SeqCst)
    }

    #[must_use]
    pub fn subscribes(&self) -> u32 {
        self.subscribes.load(Ordering::SeqCst)
    }
}

pub struct ScriptedCollector {
    exchange: Exchange,
    events: Arc<Mutex<VecDeque<CollectorEvent>>>,
    counters: CollectorCounters,
    fail_connects: bool,
}

impl ScriptedCollector {
    #[must_use]
    pub fn new(exchange: Exchange) -> Self {
        Self {
            exchange,
            events: Arc::new(Mutex::new(VecDeque::new())),
            counters: CollectorCounters::default(),
            fail_connects: false,
        }
    }

    /// Queue events replayed across connections (the queue survives
    /// reconnects, so a disconnect event can be followed by post-reconnect
    /// data).
    #[must_use]
    pub fn with_events(self, events: Vec<CollectorEvent>) -> Self {
        *self.events.lock().unwrap() = events.into();
        self
    }

    /// Every connect attempt fails.
    #[must_use]
    pub fn failing_connects(mut self) -> Self {
        self.fail_connects = true;
        self
    }

    #[must_use]
    pub fn counters(&self) -> CollectorCounters {
        self.counters.clone()
    }
}

#[async_trait]
impl Collector for ScriptedCollector {
    fn exchange(&self) -> Exchange {
        self.exchange
    }

    async fn connect(&mut self) -> Result<()> {
        self.counters.connects.fetch_add(1, Ordering::SeqCst);
        if self.fail_connects {
            return Err(Error::Connection("scripted connect failure".into()));
        }
        Ok(())
    }

    async fn subscribe(&mut self, _targets: &[SubscriptionTarget]) -> Result<()> {
        self.counters.subscribes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn next_event(&mut self) -> Option<CollectorEvent> {
        let next = self.events.lock().unwrap().pop_front();
        match next {
            Some(event) => Some(event),
            // Script exhausted: stay quiet like a healthy idle connection.
            None => std::future::pending().await,
        }
    }
}
