//! Encrypted, self-healing key-value storage for on-device secrets.
//!
//! Provides the secure storage layer for session tokens, user identifiers and
//! cached profiles:
//! - Every value sealed with AES-256-CBC under a per-record random IV
//! - SHA-256 integrity checksum verified before any decryption
//! - Periodic key rotation with re-encryption of existing records
//! - Damaged records deleted on read instead of surfacing as errors
//! - Bounded retry for storage-boundary failures
//!
//! # Architecture
//!
//! ```text
//! caller → SecureStore → RetryExecutor → KeyManager (rotate if due)
//!                                      → codec (securekv-crypto)
//!                                      → KvStore (securekv-storage)
//! Diagnostics → KvStore + codec (read-only scan, no retry)
//! ```
//!
//! There is no global instance. Hosts construct one [`SecureStore`] over a
//! shared [`KvStore`] and pass it around.
//!
//! Records live under a reserved key prefix (`secure_` by default), so
//! clearing, rotation and diagnostics never touch unrelated entries in the
//! same byte store.
//!
//! # Fallback key
//!
//! If device key derivation fails, the store keeps working with a fixed key
//! shared by every installation. This trades confidentiality for
//! availability. [`SecureStore::fallback_key_in_use`] and the
//! `fallback_key_in_use` field of [`SecurityStats`] expose it, and a warning
//! is logged whenever it engages.

pub mod clock;
pub mod config;
pub mod diagnostics;
mod error;
pub mod key_manager;
pub mod keychain;
pub mod retry;
mod store;

pub use clock::{Clock, ManualClock, SystemClock};
pub use config::SecureStoreConfig;
pub use diagnostics::{Diagnostics, IntegrityIssue, IntegrityReport, IssueKind, SecurityStats};
pub use error::{SecureStoreError, SecureStoreResult};
pub use key_manager::{KeyManager, MigrationSummary, RotationPolicy};
pub use keychain::{Keychain, MemoryKeychain};
pub use retry::RetryExecutor;
pub use store::{PurgeReason, ReadOutcome, SecureStore};

pub use securekv_storage::{DuckDbKvStore, KvStore, MemoryKvStore, StorageError};
