//! Cache element: the unit handed to the disk tier.
//!
//! An element couples an opaque value payload with the attributes the
//! backend needs to decide row lifetime (creation time, max life, eternal
//! flag). Keys are strings so any backend can use them as row keys.

use chrono::Utc;
use serde::{Deserialize, Serialize};

/// Trailing delimiter that marks a key as a group prefix.
///
/// A `remove("images:")` call widens to every key under the `images` group.
pub const NAME_COMPONENT_DELIMITER: char = ':';

/// Lifetime attributes carried by every element.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ElementAttributes {
    /// Epoch millis of first acceptance. Stamped by the cache when zero.
    pub create_time_ms: u64,
    /// Maximum life in seconds once created. Ignored for eternal elements.
    pub max_life_s: u64,
    /// Eternal elements are never expired or swept.
    pub is_eternal: bool,
}

impl Default for ElementAttributes {
    fn default() -> Self {
        Self {
            create_time_ms: 0,
            max_life_s: 0,
            is_eternal: true,
        }
    }
}

impl ElementAttributes {
    /// Whether the element is past its lifetime at `now_ms`.
    pub fn is_expired_at_ms(&self, now_ms: u64) -> bool {
        if self.is_eternal {
            return false;
        }
        now_ms
            >= self
                .create_time_ms
                .saturating_add(self.max_life_s.saturating_mul(1000))
    }
}

/// A single cache entry: key, encoded payload, lifetime attributes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheElement {
    pub key: String,
    pub value: Vec<u8>,
    pub attributes: ElementAttributes,
}

impl CacheElement {
    /// Create an eternal element with default attributes.
    pub fn new(key: impl Into<String>, value: Vec<u8>) -> Self {
        Self {
            key: key.into(),
            value,
            attributes: ElementAttributes::default(),
        }
    }

    /// Create an element with explicit attributes.
    pub fn with_attributes(
        key: impl Into<String>,
        value: Vec<u8>,
        attributes: ElementAttributes,
    ) -> Self {
        Self {
            key: key.into(),
            value,
            attributes,
        }
    }

    /// Stamp the creation time if the caller left it unset.
    pub(crate) fn stamp_create_time(&mut self) {
        if self.attributes.create_time_ms == 0 {
            self.attributes.create_time_ms = Utc::now().timestamp_millis() as u64;
        }
    }
}
