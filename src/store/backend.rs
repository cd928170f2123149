//! Low-level key-value storage backend trait and supporting types.
//!
//! The [`StorageBackend`] trait defines the contract every storage engine
//! implements. It is a dumb KV store over `(key, bytes)` pairs -- no row
//! schema, no cascade logic, no version semantics beyond a monotonic
//! per-key counter. Everything domain-shaped (task/dependency rows,
//! cascade delete, the tree-wide version counter used for optimistic
//! concurrency) lives one layer up, in [`crate::store::generic::GenericStore`].
//!
//! # Key structure
//!
//! Keys are composite strings namespaced by logical table:
//! `tasks:<id>`, `deps:<dependent>:<dependency>`, `context:<id>`, and a
//! single `meta:version` row holding the tree-wide version counter.
//! Prefix queries (`tasks:`, `deps:`) scope a listing to one table.
//!
//! # Versioning
//!
//! Each stored record carries a monotonic `u64` version starting at 1,
//! incremented on every successful write. [`StorageBackend::put_if_version`]
//! gives compare-and-swap semantics for optimistic concurrency; the
//! generic store layer uses it to detect a conflicting write landing
//! between a transaction's read snapshot and its commit.

use std::fmt;

use async_trait::async_trait;

/// A stored record paired with its monotonic version number.
#[derive(Debug, Clone)]
pub struct VersionedRecord {
    /// The serialized row bytes (canonical JSON, produced by
    /// [`crate::store::generic::GenericStore`]).
    pub data: Vec<u8>,

    /// Monotonic version number. Starts at 1, increments on each
    /// successful write.
    pub version: u64,
}

/// Errors from a raw storage operation.
///
/// These are backend-level errors; [`crate::store::generic::GenericStore`]
/// maps them to domain-aware [`crate::error::EngineError`] variants before
/// surfacing them to callers.
#[derive(Debug)]
pub enum StorageError {
    /// The requested key was not present.
    NotFound {
        /// The key that was not found.
        key: String,
    },

    /// A [`put_if_version`](StorageBackend::put_if_version) call failed
    /// because the stored version did not match the expected version.
    VersionConflict {
        /// The key where the conflict occurred.
        key: String,
        /// The version the caller expected.
        expected: u64,
        /// The version actually found in storage.
        actual: u64,
    },

    /// An I/O or backend-specific error occurred.
    Backend {
        /// Human-readable description of the error.
        message: String,
        /// The underlying error, if available.
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },
}

impl fmt::Display for StorageError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NotFound { key } => write!(f, "key not found: {key}"),
            Self::VersionConflict {
                key,
                expected,
                actual,
            } => write!(
                f,
                "version conflict on key {key}: expected {expected}, found {actual}"
            ),
            Self::Backend { message, .. } => write!(f, "backend error: {message}"),
        }
    }
}

impl std::error::Error for StorageError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Backend {
                source: Some(src), ..
            } => Some(src.as_ref()),
            _ => None,
        }
    }
}

/// Key-value storage backend underlying the task/dependency store.
///
/// Implementations provide raw storage primitives only. All domain logic
/// (cascade delete, status rules, version-counter semantics) lives in
/// [`crate::store::generic::GenericStore`], never here.
///
/// # Thread safety
///
/// Implementations must be `Send + Sync`; readers may run concurrently
/// with the single writer the cooperative file lock admits.
#[async_trait]
pub trait StorageBackend: Send + Sync {
    /// Retrieves a record by key.
    ///
    /// # Errors
    ///
    /// [`StorageError::NotFound`] if no record exists for `key`;
    /// [`StorageError::Backend`] on I/O failure.
    async fn get(&self, key: &str) -> Result<VersionedRecord, StorageError>;

    /// Stores a record unconditionally (create or overwrite), returning the
    /// newly assigned version (1 for a fresh key, `current + 1` otherwise).
    async fn put(&self, key: &str, data: &[u8]) -> Result<u64, StorageError>;

    /// Compare-and-swap: stores `data` only if the current version equals
    /// `expected_version`, returning the new version on success.
    ///
    /// # Errors
    ///
    /// [`StorageError::NotFound`] if no record exists for `key`;
    /// [`StorageError::VersionConflict`] on a stale `expected_version`.
    async fn put_if_version(
        &self,
        key: &str,
        data: &[u8],
        expected_version: u64,
    ) -> Result<u64, StorageError>;

    /// Deletes a record by key. Idempotent: returns `true` iff a record
    /// existed to delete.
    async fn delete(&self, key: &str) -> Result<bool, StorageError>;

    /// Lists all records whose key starts with `prefix`, as `(key, record)`
    /// pairs. Order is unspecified.
    async fn list_by_prefix(
        &self,
        prefix: &str,
    ) -> Result<Vec<(String, VersionedRecord)>, StorageError>;
}

/// Table namespace for task rows.
pub const TABLE_TASKS: &str = "tasks";
/// Table namespace for dependency-edge rows.
pub const TABLE_DEPS: &str = "deps";
/// Table namespace for context-slice rows.
pub const TABLE_CONTEXT: &str = "context";
/// Reserved key holding the tree-wide version counter.
pub const KEY_TREE_VERSION: &str = "meta:version";

/// Builds a storage key for a task row: `tasks:<id>`.
pub fn task_key(id: &str) -> String {
    format!("{TABLE_TASKS}:{id}")
}

/// Builds a storage key for a dependency edge row:
/// `deps:<dependent_id>:<dependency_id>`.
pub fn dependency_key(dependent_id: &str, dependency_id: &str) -> String {
    format!("{TABLE_DEPS}:{dependent_id}:{dependency_id}")
}

/// Builds a storage key for a context-slice row: `context:<id>`.
pub fn context_key(id: &str) -> String {
    format!("{TABLE_CONTEXT}:{id}")
}

/// Prefix matching every task row.
pub fn tasks_prefix() -> String {
    format!("{TABLE_TASKS}:")
}

/// Prefix matching every dependency-edge row whose `dependent_id` is `id`.
pub fn deps_prefix_for(id: &str) -> String {
    format!("{TABLE_DEPS}:{id}:")
}

/// Prefix matching every dependency-edge row in the store.
pub fn deps_prefix() -> String {
    format!("{TABLE_DEPS}:")
}
