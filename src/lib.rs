//! Write-back auxiliary cache tier.
//!
//! Sits behind a fast in-memory cache and persists evicted or overflow
//! elements to durable storage without putting serialization or I/O on
//! the caller's path. Callers get immediate acknowledgement; a dedicated
//! writer thread does the persisting. Until the writer reaches an
//! element it waits in "purgatory", and a read that arrives first rescues
//! it from there, cancelling the pending write.
//!
//! ```text
//! update(el) ──→ Purgatory ──→ [event queue] ──→ writer ──→ Backend
//!                    ▲                              │
//! get(key) ──────────┘ (rescue: cancels the write) ─┘
//! ```
//!
//! Losing queued writes on crash is by contract acceptable: this tier is
//! an optimization, not a write-ahead log.
//!
//! # Example
//!
//! ```no_run
//! use spoolcache::{CacheElement, DiskCache, DiskCacheConfig, JsonCodec, SqlBackend,
//!                  SqlBackendConfig};
//! use std::sync::Arc;
//!
//! let backend = Arc::new(SqlBackend::new(
//!     SqlBackendConfig::default(),
//!     Arc::new(JsonCodec),
//! )?);
//! let cache = DiskCache::new(DiskCacheConfig::default(), backend)?;
//!
//! cache.update(CacheElement::new("user:42", b"profile bytes".to_vec()))?;
//! let _rescued = cache.get("user:42"); // served from staging if not yet written
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! ```

pub mod backend;
pub mod cache;
pub mod codec;
pub mod element;
pub mod error;
pub mod locks;
pub mod purgatory;
pub mod stats;

mod queue;
mod config;

pub use backend::memory::MemoryBackend;
pub use backend::sql::SqlBackend;
pub use backend::CacheBackend;
pub use cache::{CacheStatus, DiskCache};
pub use codec::{ElementCodec, JsonCodec};
pub use element::{CacheElement, ElementAttributes, NAME_COMPONENT_DELIMITER};
pub use error::{BackendError, CacheError, CodecError};
pub use config::{DiskCacheConfig, FileConfig, SqlBackendConfig};
pub use stats::{CacheStatsSnapshot, QueueMetricsSnapshot};
