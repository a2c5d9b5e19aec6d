//! Per-key reader/writer locks with refcounted reclamation.
//!
//! The cache, the writer thread, and synchronous removals all coordinate
//! mutations of a key's staged state through this registry. Lock entries
//! are created on demand and dropped again once no holder remains, so the
//! registry stays bounded under key churn.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, RwLock, RwLockReadGuard, RwLockWriteGuard};

#[derive(Debug, Default)]
struct KeyLock {
    rw: RwLock<()>,
    /// Live handles, maintained under the registry mutex.
    holders: AtomicUsize,
}

/// Registry of per-key reader/writer locks.
#[derive(Debug, Default)]
pub struct LockRegistry {
    locks: Mutex<HashMap<String, Arc<KeyLock>>>,
}

impl LockRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Obtain a handle to the lock for `key`, creating the entry if needed.
    ///
    /// Two handles for the same key share the same underlying lock for as
    /// long as either is alive.
    pub fn handle(&self, key: &str) -> KeyLockHandle<'_> {
        let mut locks = self.locks.lock().unwrap();
        let entry = locks.entry(key.to_string()).or_default().clone();
        entry.holders.fetch_add(1, Ordering::Relaxed);
        KeyLockHandle {
            registry: self,
            key: key.to_string(),
            entry,
        }
    }

    /// Number of live lock entries.
    pub fn len(&self) -> usize {
        self.locks.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// A refcounted handle to one key's lock.
///
/// Dropping the last handle for a key reclaims the registry entry.
pub struct KeyLockHandle<'r> {
    registry: &'r LockRegistry,
    key: String,
    entry: Arc<KeyLock>,
}

impl KeyLockHandle<'_> {
    /// Acquire the write side. A poisoned lock is logged and reported as a
    /// failed acquisition; the caller aborts its operation.
    pub fn write(&self) -> Option<RwLockWriteGuard<'_, ()>> {
        match self.entry.rw.write() {
            Ok(guard) => Some(guard),
            Err(_) => {
                tracing::warn!("write lock for key '{}' poisoned; aborting", self.key);
                None
            }
        }
    }

    /// Acquire the read side. Poisoning is treated as failure to acquire.
    pub fn read(&self) -> Option<RwLockReadGuard<'_, ()>> {
        match self.entry.rw.read() {
            Ok(guard) => Some(guard),
            Err(_) => {
                tracing::warn!("read lock for key '{}' poisoned; aborting", self.key);
                None
            }
        }
    }

    pub fn key(&self) -> &str {
        &self.key
    }
}

impl Drop for KeyLockHandle<'_> {
    fn drop(&mut self) {
        let mut locks = self.registry.locks.lock().unwrap();
        // Holder counts only change under the registry mutex, so a zero
        // count here means no other handle can appear before we remove.
        if self.entry.holders.fetch_sub(1, Ordering::Relaxed) == 1 {
            if let Some(current) = locks.get(&self.key) {
                if current.holders.load(Ordering::Relaxed) == 0 {
                    locks.remove(&self.key);
                }
            }
        }
    }
}
