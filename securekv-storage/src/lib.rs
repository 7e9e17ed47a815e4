//! Persistent key-value byte stores for SecureKV.
//!
//! The secure store never touches a database directly; it talks to the
//! [`KvStore`] trait. Two backends ship here:
//!
//! - [`MemoryKvStore`]: volatile, for tests and ephemeral sessions
//! - [`DuckDbKvStore`]: a single DuckDB table, for on-device persistence
//!
//! Values are opaque strings. Encryption happens above this layer.

mod duckdb_store;
mod error;
mod kv;
mod memory;

pub use duckdb_store::{DuckDbKvStore, DuckDbLimits};
pub use error::{StorageError, StorageResult};
pub use kv::KvStore;
pub use memory::MemoryKvStore;
