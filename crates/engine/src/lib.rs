//! The database engine: entity store, index catalog, transaction manager,
//! background workers and the `Database` facade tying them together.
//!
//! Mutation path: `Database::begin` -> `Transaction::{put, delete, ...}`
//! staging entity writes plus every derived index mutation into one batch ->
//! `commit` locks, validates, appends to the WAL, applies atomically and
//! publishes the changefeed. Read path: snapshots from the engine, index
//! scans through the crates one level down.

pub mod background;
pub mod catalog;
pub mod database;
pub mod indexer;
pub mod stats;
pub mod txn;

pub use catalog::IndexDescriptor;
pub use database::Database;
pub use txn::{RetryConfig, Transaction};
