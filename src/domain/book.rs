//! Collector-local L2 order book with incremental reconstruction.
//!
//! Venues that stream diffs (BingX `incrDepth`, Ramzinex fossil mode) send
//! a full snapshot tagged with an update id, then diffs whose ids must be
//! contiguous. [`OrderBook`] holds the sorted levels; [`BookSynchronizer`]
//! enforces continuity, buffering up to three out-of-order diffs and
//! merging them when a contiguous run can be rebuilt. Anything worse means
//! the caller must resubscribe and take a fresh snapshot.
//!
//! Bids are keyed with [`std::cmp::Reverse`] so `BTreeMap` iteration yields
//! the highest bid first; asks use natural ordering.

use std::cmp::Reverse;
use std::collections::{BTreeMap, VecDeque};

use rust_decimal::Decimal;

/// One side level: price and resting volume.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BookLevel {
    pub price: Decimal,
    pub volume: Decimal,
}

/// An incremental update: level lists per side plus the venue update id.
///
/// A zero volume deletes the level; non-zero inserts or replaces it.
#[derive(Debug, Clone, PartialEq)]
pub struct BookDiff {
    pub update_id: u64,
    pub bids: Vec<(Decimal, Decimal)>,
    pub asks: Vec<(Decimal, Decimal)>,
}

#[derive(Debug, Default)]
pub struct OrderBook {
    bids: BTreeMap<Reverse<Decimal>, Decimal>,
    asks: BTreeMap<Decimal, Decimal>,
    last_update_id: u64,
    initialized: bool,
}

impl OrderBook {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn is_initialized(&self) -> bool {
        self.initialized
    }

    #[must_use]
    pub fn last_update_id(&self) -> u64 {
        self.last_update_id
    }

    /// Replace the whole book with a snapshot. Zero-volume levels are skipped.
    pub fn apply_snapshot(
        &mut self,
        bids: &[(Decimal, Decimal)],
        asks: &[(Decimal, Decimal)],
        update_id: u64,
    ) {
        self.bids.clear();
        self.asks.clear();
        for &(price, volume) in bids {
            if !volume.is_zero() {
                self.bids.insert(Reverse(price), volume);
            }
        }
        for &(price, volume) in asks {
            if !volume.is_zero() {
                self.asks.insert(price, volume);
            }
        }
        self.last_update_id = update_id;
        self.initialized = true;
    }

    /// Apply one diff without checking continuity (the synchronizer does that).
    fn apply_diff_unchecked(&mut self, diff: &BookDiff) {
        for &(price, volume) in &diff.bids {
            if volume.is_zero() {
                self.bids.remove(&Reverse(price));
            } else {
                self.bids.insert(Reverse(price), volume);
            }
        }
        for &(price, volume) in &diff.asks {
            if volume.is_zero() {
                self.asks.remove(&price);
            } else {
                self.asks.insert(price, volume);
            }
        }
        self.last_update_id = diff.update_id;
    }

    #[must_use]
    pub fn best_bid(&self) -> Option<BookLevel> {
        self.bids.iter().next().map(|(Reverse(price), volume)| BookLevel {
            price: *price,
            volume: *volume,
        })
    }

    #[must_use]
    pub fn best_ask(&self) -> Option<BookLevel> {
        self.asks.iter().next().map(|(price, volume)| BookLevel {
            price: *price,
            volume: *volume,
        })
    }

    #[must_use]
    pub fn level_count(&self) -> (usize, usize) {
        (self.bids.len(), self.asks.len())
    }
}

/// Outcome of feeding a diff into a [`BookSynchronizer`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncOutcome {
    /// Diff (and possibly buffered successors) applied; tops may have moved.
    Applied,
    /// Diff arrived ahead of a gap and was buffered.
    Buffered,
    /// Continuity is lost beyond repair; resubscribe and re-snapshot.
    Resync,
}

/// How many out-of-order diffs are retained while waiting for a gap to fill.
const DIFF_BUFFER_LEN: usize = 3;

/// Continuity-checked wrapper around an [`OrderBook`].
#[derive(Debug, Default)]
pub struct BookSynchronizer {
    book: OrderBook,
    pending: VecDeque<BookDiff>,
}

impl BookSynchronizer {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn book(&self) -> &OrderBook {
        &self.book
    }

    /// Install a fresh snapshot, discarding any buffered diffs that it
    /// supersedes. Buffered diffs newer than the snapshot are replayed.
    pub fn apply_snapshot(
        &mut self,
        bids: &[(Decimal, Decimal)],
        asks: &[(Decimal, Decimal)],
        update_id: u64,
    ) {
        self.book.apply_snapshot(bids, asks, update_id);
        self.pending.retain(|d| d.update_id > update_id);
        self.drain_contiguous();
    }

    /// Feed one diff. The Nth diff's id must equal the previous id + 1;
    /// small gaps are bridged from the buffer, larger ones demand a resync.
    pub fn apply_diff(&mut self, diff: BookDiff) -> SyncOutcome {
        if !self.book.is_initialized() {
            return SyncOutcome::Resync;
        }

        let expected = self.book.last_update_id() + 1;
        if diff.update_id < expected {
            // Replay of something already applied; ignore.
            return SyncOutcome::Applied;
        }

        if diff.update_id == expected {
            self.book.apply_diff_unchecked(&diff);
            self.drain_contiguous();
            return SyncOutcome::Applied;
        }

        // Out of order: keep it and see whether the run can still be rebuilt.
        if self.pending.len() == DIFF_BUFFER_LEN {
            self.pending.clear();
            return SyncOutcome::Resync;
        }
        let slot = self
            .pending
            .iter()
            .position(|d| d.update_id >= diff.update_id);
        match slot {
            Some(i) if self.pending[i].update_id == diff.update_id => {}
            Some(i) => self.pending.insert(i, diff),
            None => self.pending.push_back(diff),
        }
        SyncOutcome::Buffered
    }

    /// Apply buffered diffs that now continue the chain.
    fn drain_contiguous(&mut self) {
        while let Some(front_id) = self.pending.front().map(|d| d.update_id) {
            let expected = self.book.last_update_id() + 1;
            if front_id > expected {
                break;
            }
            if let Some(diff) = self.pending.pop_front() {
                if front_id == expected {
                    self.book.apply_diff_unchecked(&diff);
                }
            }
        }
    }
}


#[cfg(test)]
mod prop_tests {
    use super::*;
    use proptest::prelude::*;
    use rust_decimal::Decimal;

    fn arb_levels(max: usize) -> impl Strategy<Value = Vec<(Decimal, Decimal)>> {
        proptest::collection::vec(
            ((1i64..10_000i64), (0i64..1_000i64))
                .prop_map(|(p, v)| (Decimal::new(p, 2), Decimal::new(v, 4))),
            0..max,
        )
    }

    proptest! {
        // A snapshot plus contiguous diffs converges to the same top of
        // book as replaying the same history into a fresh book.
        #[test]
        fn diffs_and_resnapshot_agree_on_tops(
            bids in arb_levels(12),
            asks in arb_levels(12),
            diffs in proptest::collection::vec((arb_levels(4), arb_levels(4)), 0..8),
        ) {
            let mut incremental = BookSynchronizer::new();
            incremental.apply_snapshot(&bids, &asks, 100);
            for (i, (db, da)) in diffs.iter().enumerate() {
                let outcome = incremental.apply_diff(BookDiff {
                    update_id: 101 + i as u64,
                    bids: db.clone(),
                    asks: da.clone(),
                });
                prop_assert_eq!(outcome, SyncOutcome::Applied);
            }

            // Rebuild by replaying everything into a fresh book.
            let mut replay = OrderBook::new();
            replay.apply_snapshot(&bids, &asks, 100);
            for (i, (db, da)) in diffs.iter().enumerate() {
                replay.apply_diff_unchecked(&BookDiff {
                    update_id: 101 + i as u64,
                    bids: db.clone(),
                    asks: da.clone(),
                });
            }

            prop_assert_eq!(incremental.book().best_bid(), replay.best_bid());
            prop_assert_eq!(incremental.book().best_ask(), replay.best_ask());
        }

        #[test]
        fn zero_volume_always_removes_level(
            price in (1i64..10_000i64).prop_map(|p| Decimal::new(p, 2)),
            volume in (1i64..1_000i64).prop_map(|v| Decimal::new(v, 4)),
        ) {
            let mut book = OrderBook::new();
            book.apply_snapshot(&[(price, volume)], &[(price + Decimal::ONE, volume)], 1);
            book.apply_diff_unchecked(&BookDiff {
                update_id: 2,
                bids: vec![(price, Decimal::ZERO)],
                asks: vec![(price + Decimal::ONE, Decimal::ZERO)],
            });
            prop_assert_eq!(book.level_count(), (0, 0));
        }
    }
}
