//! Runtime counters shared across the pipeline.
//!
//! Every recoverable failure in the error policy table is observable here:
//! transport drops, protocol and decode errors, sequence gaps, stale-quote
//! rejections, conflated and shed events. Counters are lock-free atomics;
//! readers take point-in-time [`StatsSnapshot`]s.

use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;

use super::quote::monotonic_secs;

#[derive(Debug, Default)]
pub struct SystemStats {
    pub messages_processed: AtomicU64,
    pub decode_errors: AtomicU64,
    pub protocol_errors: AtomicU64,
    pub sequence_gaps: AtomicU64,
    pub reconnects: AtomicU64,
    pub stale_quotes_rejected: AtomicU64,
    pub unknown_symbols: AtomicU64,
    pub quotes_conflated: AtomicU64,
    pub events_shed: AtomicU64,
    pub opportunities_detected: AtomicU64,
}

impl SystemStats {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[inline]
    pub fn incr(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    /// Point-in-time copy plus the live store/cache sizes supplied by the
    /// caller (the stats task reads those from the owning components).
    pub fn snapshot(&self, prices_count: usize, opportunities_count: usize) -> StatsSnapshot {
        StatsSnapshot {
            prices_count,
            opportunities_count,
            uptime: monotonic_secs(),
            messages_processed: self.messages_processed.load(Ordering::Relaxed),
            decode_errors: self.decode_errors.load(Ordering::Relaxed),
            protocol_errors: self.protocol_errors.load(Ordering::Relaxed),
            sequence_gaps: self.sequence_gaps.load(Ordering::Relaxed),
            reconnects: self.reconnects.load(Ordering::Relaxed),
            stale_quotes_rejected: self.stale_quotes_rejected.load(Ordering::Relaxed),
            unknown_symbols: self.unknown_symbols.load(Ordering::Relaxed),
            quotes_conflated: self.quotes_conflated.load(Ordering::Relaxed),
            events_shed: self.events_shed.load(Ordering::Relaxed),
            opportunities_detected: self.opportunities_detected.load(Ordering::Relaxed),
        }
    }
}

/// Serializable counter snapshot, the payload of the periodic stats event.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct StatsSnapshot {
    pub prices_count: usize,
    pub opportunities_count: usize,
    /// Seconds since process start.
    pub uptime: f64,
    pub messages_processed: u64,
    pub decode_errors: u64,
    pub protocol_errors: u64,
    pub sequence_gaps: u64,
    pub reconnects: u64,
    pub stale_quotes_rejected: u64,
    pub unknown_symbols: u64,
    pub quotes_conflated: u64,
    pub events_shed: u64,
    pub opportunities_detected: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counters_start_at_zero() {
        let stats = SystemStats::new();
        let snap = stats.snapshot(0, 0);
        assert_eq!(snap.messages_processed, 0);
        assert_eq!(snap.decode_errors, 0);
        assert_eq!(snap.reconnects, 0);
    }

    #[test]
    fn incr_is_visible_in_snapshot() {
        let stats = SystemStats::new();
        SystemStats::incr(&stats.messages_processed);
        SystemStats::incr(&stats.messages_processed);
        SystemStats::incr(&stats.stale_quotes_rejected);

        let snap = stats.snapshot(3, 1);
        assert_eq!(snap.messages_processed, 2);
        assert_eq!(snap.stale_quotes_rejected, 1);
        assert_eq!(snap.prices_count, 3);
        assert_eq!(snap.opportunities_count, 1);
    }

    #[test]
    fn snapshot_serializes_with_field_names() {
        let stats = SystemStats::new();
        let json = serde_json::to_value(stats.snapshot(2, 5)).unwrap();
        assert_eq!(json["prices_count"], 2);
        assert_eq!(json["opportunities_count"], 5);
        assert!(json["uptime"].is_f64());
    }
}
