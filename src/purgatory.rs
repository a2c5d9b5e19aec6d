//! Purgatory: the staging map of accepted-but-not-yet-persisted elements.
//!
//! Every `update` lands here before its persistence event is queued. The
//! writer thread reads items back out by key; a read that arrives first
//! rescues the item instead, which is how a pending write gets cancelled
//! without scanning the queue.

use crate::element::CacheElement;
use std::collections::HashMap;
use std::sync::Mutex;

/// An element staged for persistence.
#[derive(Debug, Clone)]
pub struct PurgatoryItem {
    pub element: CacheElement,
    /// Whether the writer is still permitted to persist this item.
    /// Flipped to `false` only while the per-key write lock is held.
    pub spoolable: bool,
}

/// Key → staged item. All operations are atomic per key.
#[derive(Debug, Default)]
pub struct Purgatory {
    items: Mutex<HashMap<String, PurgatoryItem>>,
}

impl Purgatory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Stage an element. Overwrites any prior item for the key; the prior
    /// item becomes unreachable and its queued event will no-op.
    pub fn put(&self, element: CacheElement) {
        let key = element.key.clone();
        self.items.lock().unwrap().insert(
            key,
            PurgatoryItem {
                element,
                spoolable: true,
            },
        );
    }

    /// Copy of the staged item for `key`, if any.
    pub fn get(&self, key: &str) -> Option<PurgatoryItem> {
        self.items.lock().unwrap().get(key).cloned()
    }

    /// Drop the staged item for `key`.
    pub fn remove(&self, key: &str) -> Option<PurgatoryItem> {
        self.items.lock().unwrap().remove(key)
    }

    /// Cancellation path: flip `spoolable` off, then take the element out.
    ///
    /// The caller must hold the per-key write lock, so a writer racing on
    /// the same key either sees the item non-spoolable or already gone.
    pub fn mark_unspoolable(&self, key: &str) -> Option<CacheElement> {
        let mut items = self.items.lock().unwrap();
        if let Some(item) = items.get_mut(key) {
            item.spoolable = false;
        } else {
            return None;
        }
        items.remove(key).map(|item| item.element)
    }

    pub fn contains(&self, key: &str) -> bool {
        self.items.lock().unwrap().contains_key(key)
    }

    /// Replace the map with a fresh empty one, returning the old contents.
    /// Queued events for the old contents find nothing and no-op.
    pub fn swap_empty(&self) -> HashMap<String, PurgatoryItem> {
        std::mem::take(&mut *self.items.lock().unwrap())
    }

    pub fn len(&self) -> usize {
        self.items.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Keys currently staged under a group prefix.
    pub fn keys_with_prefix(&self, prefix: &str) -> Vec<String> {
        self.items
            .lock()
            .unwrap()
            .keys()
            .filter(|k| k.starts_with(prefix))
            .cloned()
            .collect()
    }
}
