//! Replicated Store + Schema/Entities + Upsert Engine (spec.md §4.3, §4.4, §4.6).

pub mod replicated;
pub mod schema;
pub mod upsert;

pub use replicated::ReplicatedStore;
pub use schema::Table;
