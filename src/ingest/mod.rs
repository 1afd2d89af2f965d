//! Ingest Client (spec.md §4.5).

pub mod history;
pub mod http;
pub mod names;
pub mod orders;
pub mod ratelimit;

pub use history::{fetch_history_fanout, HistoryResult, RawHistoryRecord};
pub use orders::{fetch_region_orders, fetch_structure_orders, OrderFetchOutcome, OrderType, RawMarketOrder};
