//! Persistence backends.
//!
//! The cache talks to durable storage through [`CacheBackend`] only. Any
//! conforming backend must provide upsert `put` semantics, idempotent
//! `remove`, and a `get` that hides expired rows.

use crate::element::CacheElement;
use crate::error::BackendError;
use std::collections::HashSet;

pub mod memory;
pub mod sql;

/// Contract between the cache and durable storage.
///
/// Implementations are shared between callers and the writer thread and
/// must provide their own internal synchronization.
pub trait CacheBackend: Send + Sync {
    /// Persist an element, replacing any existing row for its key.
    fn put(&self, element: &CacheElement) -> Result<(), BackendError>;

    /// Fetch an element. Absent and expired rows both read as `None`.
    fn get(&self, key: &str) -> Result<Option<CacheElement>, BackendError>;

    /// Remove a key. Removing an absent key succeeds and returns `false`.
    /// A key ending in the name-component delimiter removes the whole
    /// group under that prefix.
    fn remove(&self, key: &str) -> Result<bool, BackendError>;

    /// Remove every row in this backend's region.
    fn remove_all(&self) -> Result<(), BackendError>;

    /// Number of rows currently stored in this backend's region.
    fn size(&self) -> Result<u64, BackendError>;

    /// Release backend resources. Must be safe to call more than once.
    fn dispose(&self);

    /// Keys belonging to a group. Optional; backends without group
    /// indexing report `Unsupported`.
    fn get_group_keys(&self, _group: &str) -> Result<HashSet<String>, BackendError> {
        Err(BackendError::Unsupported("get_group_keys"))
    }
}
