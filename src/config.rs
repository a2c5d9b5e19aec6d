//! Configuration for the cache facade and the SQL backend.
//!
//! Runtime structs carry working defaults; the `File*` structs are the
//! TOML overlay that deployments may merge on top of them. Precedence:
//! explicit struct fields, then TOML file values, then built-in defaults.

use serde::Deserialize;
use std::path::PathBuf;
use std::time::Duration;

// ─────────────────────────────────────────────────────────────────────────────
// Runtime configuration
// ─────────────────────────────────────────────────────────────────────────────

/// Tuning for the cache facade and its event queue.
#[derive(Debug, Clone)]
pub struct DiskCacheConfig {
    /// Partition label scoping this cache's keys within a shared backend.
    pub region: String,
    /// Event queue bound. Writes beyond it wait, then drop.
    pub queue_capacity: usize,
    /// How long an `update` may wait on a full queue before dropping.
    pub enqueue_timeout: Duration,
    /// Consecutive backend failures before the queue destroys itself.
    pub error_threshold: u32,
    /// How long `dispose` waits for the writer to drain.
    pub dispose_timeout: Duration,
}

impl Default for DiskCacheConfig {
    fn default() -> Self {
        Self {
            region: "default".to_string(),
            queue_capacity: 5_000,
            enqueue_timeout: Duration::from_millis(50),
            error_threshold: 5,
            dispose_timeout: Duration::from_secs(5),
        }
    }
}

/// Settings for the SQLite row-store backend.
#[derive(Debug, Clone)]
pub struct SqlBackendConfig {
    /// Path to the database file.
    pub db_path: PathBuf,
    /// Table holding the cache rows.
    pub table: String,
    /// Partition label written into every row.
    pub region: String,
    /// Maximum pooled connections.
    pub max_active: u32,
    /// Check row existence before insert instead of relying on the
    /// unique-violation fallback.
    pub test_before_insert: bool,
    /// When false, `remove_all` is logged and ignored. Protects shared
    /// tables from accidental wipes.
    pub allow_remove_all: bool,
    /// Expiry sweep cadence. Zero disables the sweeper thread.
    pub shrink_interval: Duration,
}

impl Default for SqlBackendConfig {
    fn default() -> Self {
        Self {
            db_path: PathBuf::from("./data/spoolcache.db"),
            table: "disk_cache".to_string(),
            region: "default".to_string(),
            max_active: 4,
            test_before_insert: true,
            allow_remove_all: true,
            shrink_interval: Duration::from_secs(300),
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// TOML overlay
// ─────────────────────────────────────────────────────────────────────────────

/// Top-level TOML document.
///
/// ```toml
/// region = "products"
///
/// [cache]
/// queue_capacity = 10000
/// enqueue_timeout_ms = 25
///
/// [sql]
/// db_path = "/var/cache/products.db"
/// table = "product_cache"
/// shrink_interval_s = 600
/// ```
#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct FileConfig {
    /// Region applied to both the cache and the backend.
    pub region: Option<String>,
    #[serde(default)]
    pub cache: FileDiskCacheConfig,
    #[serde(default)]
    pub sql: FileSqlBackendConfig,
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct FileDiskCacheConfig {
    pub queue_capacity: Option<usize>,
    pub enqueue_timeout_ms: Option<u64>,
    pub error_threshold: Option<u32>,
    pub dispose_timeout_ms: Option<u64>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct FileSqlBackendConfig {
    pub db_path: Option<PathBuf>,
    pub table: Option<String>,
    pub max_active: Option<u32>,
    pub test_before_insert: Option<bool>,
    pub allow_remove_all: Option<bool>,
    pub shrink_interval_s: Option<u64>,
}

impl FileConfig {
    /// Parse a TOML document. Unknown fields are rejected so typos fail
    /// loudly instead of silently falling back to defaults.
    pub fn from_toml_str(text: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(text)
    }

    /// Merge this overlay onto the built-in defaults.
    pub fn resolve(&self) -> (DiskCacheConfig, SqlBackendConfig) {
        let mut cache = DiskCacheConfig::default();
        let mut sql = SqlBackendConfig::default();

        if let Some(region) = &self.region {
            cache.region = region.clone();
            sql.region = region.clone();
        }
        if let Some(capacity) = self.cache.queue_capacity {
            cache.queue_capacity = capacity;
        }
        if let Some(ms) = self.cache.enqueue_timeout_ms {
            cache.enqueue_timeout = Duration::from_millis(ms);
        }
        if let Some(threshold) = self.cache.error_threshold {
            cache.error_threshold = threshold;
        }
        if let Some(ms) = self.cache.dispose_timeout_ms {
            cache.dispose_timeout = Duration::from_millis(ms);
        }

        if let Some(path) = &self.sql.db_path {
            sql.db_path = path.clone();
        }
        if let Some(table) = &self.sql.table {
            sql.table = table.clone();
        }
        if let Some(max_active) = self.sql.max_active {
            sql.max_active = max_active;
        }
        if let Some(check) = self.sql.test_before_insert {
            sql.test_before_insert = check;
        }
        if let Some(allow) = self.sql.allow_remove_all {
            sql.allow_remove_all = allow;
        }
        if let Some(secs) = self.sql.shrink_interval_s {
            sql.shrink_interval = Duration::from_secs(secs);
        }

        (cache, sql)
    }
}
