//! Per-key conflating event queue.
//!
//! The hot path is single-producer-per-key, many-consumer, and consumers
//! may be slow. Dropping events wholesale would lose updates for quiet
//! keys; blocking would stall collectors. Conflation resolves this: at
//! most one pending event per key, replaced in place when a newer one
//! arrives for the same key. Keys are served FIFO, so a burst on one pair
//! cannot starve the others, and each consumer converges to the latest
//! state of every key it has seen.

use std::collections::{HashMap, VecDeque};
use std::hash::Hash;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::Notify;

struct Inner<K, V> {
    pending: HashMap<K, V>,
    order: VecDeque<K>,
    closed: bool,
}

pub struct ConflatingQueue<K, V> {
    inner: Mutex<Inner<K, V>>,
    notify: Notify,
}

impl<K, V> ConflatingQueue<K, V>
where
    K: Hash + Eq + Clone,
{
    #[must_use]
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            inner: Mutex::new(Inner {
                pending: HashMap::new(),
                order: VecDeque::new(),
                closed: false,
            }),
            notify: Notify::new(),
        })
    }

    /// Enqueue an event, replacing any pending event for the same key.
    /// Returns `true` when an older event was conflated away.
    pub fn push(&self, key: K, value: V) -> bool {
        let conflated = {
            let mut inner = self.inner.lock();
            if inner.closed {
                return false;
            }
            let replaced = inner.pending.insert(key.clone(), value).is_some();
            if !replaced {
                inner.order.push_back(key);
            }
            replaced
        };
        self.notify.notify_one();
        conflated
    }

    /// Await the next event. Returns `None` once the queue is closed and
    /// drained.
    pub async fn pop(&self) -> Option<(K, V)> {
        loop {
            let notified = self.notify.notified();
            {
                let mut inner = self.inner.lock();
                if let Some(key) = inner.order.pop_front() {
                    // notify_one tokens are not counted; wake a sibling in
                    // case more items remain.
                    self.notify.notify_one();
                    let value = inner.pending.remove(&key)?;
                    return Some((key, value));
                }
                if inner.closed {
                    return None;
                }
            }
            notified.await;
        }
    }

    /// Non-blocking pop, for tests and drain loops.
    pub fn try_pop(&self) -> Option<(K, V)> {
        let mut inner = self.inner.lock();
        let key = inner.order.pop_front()?;
        inner.pending.remove(&key).map(|v| (key, v))
    }

    pub fn close(&self) {
        self.inner.lock().closed = true;
        self.notify.notify_waiters();
        self.notify.notify_one();
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.inner.lock().order.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
