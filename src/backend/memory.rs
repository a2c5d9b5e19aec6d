//! In-memory backend.
//!
//! A `HashMap` behind a mutex with the same observable semantics as the
//! tabular backend: upsert on collision, expired entries read as absent,
//! group-prefix removal. Useful for tests and for deployments that want
//! the write-back machinery without durable storage.

use crate::backend::CacheBackend;
use crate::element::{CacheElement, NAME_COMPONENT_DELIMITER};
use crate::error::BackendError;
use chrono::Utc;
use std::collections::{HashMap, HashSet};
use std::sync::Mutex;

#[derive(Debug, Default)]
pub struct MemoryBackend {
    rows: Mutex<HashMap<String, CacheElement>>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    fn now_ms() -> u64 {
        Utc::now().timestamp_millis() as u64
    }
}

impl CacheBackend for MemoryBackend {
    fn put(&self, element: &CacheElement) -> Result<(), BackendError> {
        self.rows
            .lock()
            .unwrap()
            .insert(element.key.clone(), element.clone());
        Ok(())
    }

    fn get(&self, key: &str) -> Result<Option<CacheElement>, BackendError> {
        let rows = self.rows.lock().unwrap();
        match rows.get(key) {
            Some(el) if el.attributes.is_expired_at_ms(Self::now_ms()) => Ok(None),
            Some(el) => Ok(Some(el.clone())),
            None => Ok(None),
        }
    }

    fn remove(&self, key: &str) -> Result<bool, BackendError> {
        let mut rows = self.rows.lock().unwrap();
        if key.ends_with(NAME_COMPONENT_DELIMITER) {
            let before = rows.len();
            rows.retain(|k, _| !k.starts_with(key));
            Ok(rows.len() < before)
        } else {
            Ok(rows.remove(key).is_some())
        }
    }

    fn remove_all(&self) -> Result<(), BackendError> {
        self.rows.lock().unwrap().clear();
        Ok(())
    }

    fn size(&self) -> Result<u64, BackendError> {
        Ok(self.rows.lock().unwrap().len() as u64)
    }

    fn dispose(&self) {}

    fn get_group_keys(&self, group: &str) -> Result<HashSet<String>, BackendError> {
        let prefix = format!("{group}{NAME_COMPONENT_DELIMITER}");
        Ok(self
            .rows
            .lock()
            .unwrap()
            .keys()
            .filter(|k| k.starts_with(&prefix))
            .cloned()
            .collect())
    }
}
