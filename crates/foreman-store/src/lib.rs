//! Record persistence for the workflow coordinator.
//!
//! Storage engine choice is left to implementors of [`PersistentStore`]; the
//! coordinator only relies on upsert-by-id and equality filtering over JSON
//! records.
//!
//! # Main types
//!
//! - [`PersistentStore`] — Async put/query interface over named tables.
//! - [`MemoryStore`] — In-process store, the default when nothing is configured.
//! - [`FileStore`] — Append-only JSONL file per table, last write wins per id.
//! - [`RecordFilter`] — Field-equality filter for queries.

/// Query filters.
pub mod filter;
/// Store trait and implementations.
pub mod store;

pub use filter::RecordFilter;
pub use store::{tables, FileStore, MemoryStore, PersistentStore};
