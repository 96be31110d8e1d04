//! Venue-agnostic collector supervision.
//!
//! Owns the connection state machine for any [`Collector`]:
//!
//! ```text
//! Disconnected → Connecting → Handshaking → Subscribing → Streaming
//!        ↑                                                   │
//!        └────────────── ReconnectBackoff ←──────────────────┘
//! ```
//!
//! Backoff is exponential with jitter, 1 s up to 60 s, and resets once a
//! connection has streamed for 30 s. Every external wait carries a
//! deadline: connect and subscribe-ack 10 s, socket idle 30 s (which also
//! covers venue heartbeat loss: a healthy venue always talks within
//! that window). A decode-error rate above 5/min cycles the connection.
//! When a venue stays down past the grace period its quotes are marked
//! stale so the detector stops trusting them.

use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{sleep, timeout};
use tracing::{debug, info, warn};

use super::{Collector, CollectorEvent, ConnectionPhase, SubscriptionTarget};
use crate::domain::SystemStats;
use crate::store::TopOfBookStore;

#[derive(Debug, Clone)]
pub struct SupervisorConfig {
    pub initial_delay: Duration,
    pub max_delay: Duration,
    /// Streaming this long proves the connection; backoff resets.
    pub reset_after: Duration,
    /// No frame at all within this window means the connection is dead.
    pub idle_timeout: Duration,
    pub connect_timeout: Duration,
    pub subscribe_timeout: Duration,
    /// Downtime beyond this marks the venue stale for detection.
    pub stale_grace: Duration,
    /// Decode errors per minute that force a reconnect.
    pub max_decode_errors_per_min: u32,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(60),
            reset_after: Duration::from_secs(30),
            idle_timeout: Duration::from_secs(30),
            connect_timeout: Duration::from_secs(10),
            subscribe_timeout: Duration::from_secs(10),
            stale_grace: Duration::from_secs(30),
            max_decode_errors_per_min: 5,
        }
    }
}

/// Exponential backoff with up to 20% jitter.
#[derive(Debug)]
pub struct Backoff {
    initial: Duration,
    max: Duration,
    current: Duration,
}

impl Backoff {
    #[must_use]
    pub fn new(initial: Duration, max: Duration) -> Self {
        Self {
            initial,
            max,
            current: initial,
        }
    }

    /// Current delay plus jitter; doubles the base for the next call,
    /// capped at the maximum.
    pub fn next_delay(&mut self) -> Duration {
        let base = self.current;
        self.current = (self.current * 2).min(self.max);
        base + jitter(base)
    }

    pub fn reset(&mut self) {
        self.current = self.initial;
    }

    #[must_use]
    pub fn current(&self) -> Duration {
        self.current
    }
}

/// Deterministic-free jitter without a PRNG dependency: sub-second clock
/// noise is plenty to de-synchronize reconnect storms.
fn jitter(base: Duration) -> Duration {
    let range_ms = (base.as_millis() as u64) / 5;
    if range_ms == 0 {
        return Duration::ZERO;
    }
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.subsec_nanos())
        .unwrap_or(0);
    Duration::from_millis(u64::from(nanos) % (range_ms + 1))
}

/// Sliding one-minute decode-error window.
#[derive(Debug)]
struct ErrorRate {
    window: Duration,
    timestamps: Vec<Instant>,
}

impl ErrorRate {
    fn new() -> Self {
        Self {
            window: Duration::from_secs(60),
            timestamps: Vec::new(),
        }
    }

    fn record(&mut self) -> u32 {
        let now = Instant::now();
        self.timestamps.retain(|t| now.duration_since(*t) < self.window);
        self.timestamps.push(now);
        self.timestamps.len() as u32
    }

    fn clear(&mut self) {
        self.timestamps.clear();
    }
}

/// Spawn a supervised collector; the task runs until shutdown.
pub fn spawn<C>(
    collector: C,
    targets: Vec<SubscriptionTarget>,
    store: Arc<TopOfBookStore>,
    stats: Arc<SystemStats>,
    config: SupervisorConfig,
    shutdown: watch::Receiver<bool>,
) -> JoinHandle<()>
where
    C: Collector + 'static,
{
    tokio::spawn(run(collector, targets, store, stats, config, shutdown))
}

/// Supervision loop. Returns only on shutdown.
pub async fn run<C>(
    mut collector: C,
    targets: Vec<SubscriptionTarget>,
    store: Arc<TopOfBookStore>,
    stats: Arc<SystemStats>,
    config: SupervisorConfig,
    mut shutdown: watch::Receiver<bool>,
) where
    C: Collector,
{
    let exchange = collector.exchange();
    let mut backoff = Backoff::new(config.initial_delay, config.max_delay);
    let mut decode_errors = ErrorRate::new();
    let mut disconnected_at: Option<Instant> = None;
    let mut phase = ConnectionPhase::Disconnected;

    if targets.is_empty() {
        info!(exchange = %exchange, "No markets configured, collector idle");
        let _ = shutdown.wait_for(|stop| *stop).await;
        return;
    }

    info!(exchange = %exchange, markets = targets.len(), "Collector supervisor started");

    'reconnect: loop {
        if *shutdown.borrow() {
            break;
        }

        transition(exchange, &mut phase, ConnectionPhase::Connecting);
        // Connect covers socket open plus venue handshake.
        match timeout(config.connect_timeout, collector.connect()).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                warn!(exchange = %exchange, error = %e, "Connect failed");
                if backoff_or_shutdown(
                    exchange, &mut phase, &mut backoff, &mut disconnected_at,
                    &store, &config, &mut shutdown,
                )
                .await
                {
                    break 'reconnect;
                }
                continue;
            }
            Err(_) => {
                warn!(exchange = %exchange, "Connect timed out");
                if backoff_or_shutdown(
                    exchange, &mut phase, &mut backoff, &mut disconnected_at,
                    &store, &config, &mut shutdown,
                )
                .await
                {
                    break 'reconnect;
                }
                continue;
            }
        }

        // Connect returns once the socket is open and the venue handshake
        // is done; the phase trace records both steps.
        transition(exchange, &mut phase, ConnectionPhase::Handshaking);
        transition(exchange, &mut phase, ConnectionPhase::Subscribing);
        match timeout(config.subscribe_timeout, collector.subscribe(&targets)).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                warn!(exchange = %exchange, error = %e, "Subscribe failed");
                collector.shutdown().await;
                if backoff_or_shutdown(
                    exchange, &mut phase, &mut backoff, &mut disconnected_at,
                    &store, &config, &mut shutdown,
                )
                .await
                {
                    break 'reconnect;
                }
                continue;
            }
            Err(_) => {
                warn!(exchange = %exchange, "Subscribe ack timed out");
                collector.shutdown().await;
                if backoff_or_shutdown(
                    exchange, &mut phase, &mut backoff, &mut disconnected_at,
                    &store, &config, &mut shutdown,
                )
                .await
                {
                    break 'reconnect;
                }
                continue;
            }
        }

        transition(exchange, &mut phase, ConnectionPhase::Streaming);
        store.mark_exchange_live(exchange);
        disconnected_at = None;
        decode_errors.clear();
        let streaming_since = Instant::now();

        let reason = 'streaming: loop {
            tokio::select! {
                event = timeout(config.idle_timeout, collector.next_event()) => {
                    match event {
                        Ok(Some(CollectorEvent::Quote(quote))) => {
                            SystemStats::incr(&stats.messages_processed);
                            store.put(quote);
                        }
                        Ok(Some(CollectorEvent::DecodeError { detail })) => {
                            SystemStats::incr(&stats.decode_errors);
                            let rate = decode_errors.record();
                            if rate > config.max_decode_errors_per_min {
                                warn!(exchange = %exchange, rate, "Decode error rate too high");
                                break 'streaming "decode error rate".to_string();
                            }
                            debug!(exchange = %exchange, detail = %detail, "Dropped undecodable frame");
                        }
                        Ok(Some(CollectorEvent::Disconnected { reason })) => {
                            break 'streaming reason;
                        }
                        Ok(None) => break 'streaming "stream ended".to_string(),
                        Err(_) => break 'streaming "idle timeout".to_string(),
                    }
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break 'reconnect;
                    }
                }
            }
        };

        SystemStats::incr(&stats.reconnects);
        warn!(exchange = %exchange, reason = %reason, "Connection lost");
        collector.shutdown().await;

        if streaming_since.elapsed() >= config.reset_after {
            backoff.reset();
        }
        if backoff_or_shutdown(
            exchange, &mut phase, &mut backoff, &mut disconnected_at,
            &store, &config, &mut shutdown,
        )
        .await
        {
            break 'reconnect;
        }
    }

    transition(exchange, &mut phase, ConnectionPhase::Shutdown);
    collector.shutdown().await;
    store.mark_exchange_stale(exchange);
    info!(exchange = %exchange, "Collector supervisor stopped");
}

fn transition(
    exchange: crate::domain::Exchange,
    phase: &mut ConnectionPhase,
    next: ConnectionPhase,
) {
    if *phase != next {
        debug!(exchange = %exchange, from = phase.as_str(), to = next.as_str(), "Phase");
        *phase = next;
    }
}

/// Wait out the backoff delay. Returns `true` when shutdown fired during
/// the wait. Marks the venue stale once downtime exceeds the grace period.
async fn backoff_or_shutdown(
    exchange: crate::domain::Exchange,
    phase: &mut ConnectionPhase,
    backoff: &mut Backoff,
    disconnected_at: &mut Option<Instant>,
    store: &TopOfBookStore,
    config: &SupervisorConfig,
    shutdown: &mut watch::Receiver<bool>,
) -> bool {
    transition(exchange, phase, ConnectionPhase::ReconnectBackoff);
    let since = *disconnected_at.get_or_insert_with(Instant::now);
    if since.elapsed() > config.stale_grace {
        store.mark_exchange_stale(exchange);
    }

    let delay = backoff.next_delay();
    debug!(exchange = %exchange, delay_ms = delay.as_millis() as u64, "Reconnect backoff");
    tokio::select! {
        () = sleep(delay) => false,
        changed = shutdown.changed() => changed.is_err() || *shutdown.borrow(),
    }
}
