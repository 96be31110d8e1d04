//! Exchange-agnostic domain types.

pub mod book;
pub mod id;
pub mod opportunity;
pub mod quote;
pub mod stats;

pub use book::{BookDiff, BookLevel, BookSynchronizer, OrderBook, SyncOutcome};
pub use id::{BookKey, CanonicalPair, Exchange};
pub use opportunity::Opportunity;
pub use quote::{monotonic_secs, Quote};
pub use stats::{StatsSnapshot, SystemStats};
