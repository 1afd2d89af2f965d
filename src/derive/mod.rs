//! Derivation Engine (spec.md §4.7).

pub mod doctrines;
pub mod stats;

pub use doctrines::{calculate_doctrine_stats, DoctrineRow};
pub use stats::{calculate_market_stats, MarketStatRow};
