//! SQLite row-store backend.
//!
//! One row per `(region, key)` with the element blob and its lifetime
//! columns. `expire_time_s` is precomputed at write time so the expiry
//! sweep is a single scalar comparison instead of per-row arithmetic.
//!
//! # Architecture
//!
//! ```text
//! DiskCache writer thread ──→ SqlBackend
//!                                │
//!                                ├──→ r2d2 pool ──→ SQLite (WAL mode)
//!                                │
//!                                └──→ Shrinker Thread
//!                                        └──→ DELETE expired rows
//! ```
//!
//! Upserts go through insert-then-update: attempt the `INSERT`, and on a
//! unique violation fall through to an `UPDATE` of the existing row. The
//! violation is recognized by the constraint error code, with an
//! error-text match kept as fallback.

use crate::backend::CacheBackend;
use crate::codec::ElementCodec;
use crate::config::SqlBackendConfig;
use crate::element::{CacheElement, NAME_COMPONENT_DELIMITER};
use crate::error::BackendError;
use chrono::Utc;
use r2d2::{Pool, PooledConnection};
use r2d2_sqlite::SqliteConnectionManager;
use rusqlite::{params, OptionalExtension};
use std::sync::mpsc::{self, RecvTimeoutError, SyncSender};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};

/// Tabular backend over SQLite with pooled connections.
pub struct SqlBackend {
    pool: Pool<SqliteConnectionManager>,
    codec: Arc<dyn ElementCodec>,
    config: SqlBackendConfig,
    shrinker: Mutex<Option<Shrinker>>,
}

struct Shrinker {
    stop_tx: SyncSender<()>,
    handle: JoinHandle<()>,
}

impl SqlBackend {
    /// Open (or create) the database, initialize the schema, and start the
    /// expiry sweeper when an interval is configured.
    pub fn new(
        config: SqlBackendConfig,
        codec: Arc<dyn ElementCodec>,
    ) -> Result<Self, BackendError> {
        if !valid_identifier(&config.table) {
            return Err(BackendError::Fatal(format!(
                "invalid table name '{}'",
                config.table
            )));
        }
        if let Some(parent) = config.db_path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| BackendError::Fatal(format!("create db directory: {e}")))?;
        }

        let manager = SqliteConnectionManager::file(&config.db_path).with_init(|conn| {
            conn.execute_batch(
                r#"
                PRAGMA journal_mode=WAL;
                PRAGMA synchronous=NORMAL;
                PRAGMA busy_timeout=5000;
                "#,
            )
        });
        let pool = Pool::builder()
            .max_size(config.max_active.max(1))
            .build(manager)?;

        let init_conn = pool.get()?;
        init_schema(&init_conn, &config.table)?;

        let backend = Self {
            pool,
            codec,
            config,
            shrinker: Mutex::new(None),
        };
        backend.start_shrinker();
        Ok(backend)
    }

    fn conn(&self) -> Result<PooledConnection<SqliteConnectionManager>, BackendError> {
        Ok(self.pool.get()?)
    }

    /// Delete expired non-eternal rows now. Returns the number removed.
    pub fn sweep_expired(&self) -> Result<usize, BackendError> {
        sweep(&self.pool, &self.config.table, &self.config.region)
            .map_err(|e| BackendError::Transient(e.to_string()))
    }

    fn start_shrinker(&self) {
        if self.config.shrink_interval.is_zero() {
            return;
        }
        let (stop_tx, stop_rx) = mpsc::sync_channel::<()>(1);
        let pool = self.pool.clone();
        let table = self.config.table.clone();
        let region = self.config.region.clone();
        let interval = self.config.shrink_interval;

        let handle = thread::Builder::new()
            .name("spool-shrinker".into())
            .spawn(move || loop {
                match stop_rx.recv_timeout(interval) {
                    Err(RecvTimeoutError::Timeout) => {
                        if let Err(e) = sweep(&pool, &table, &region) {
                            tracing::warn!("expiry sweep failed: {e}");
                        }
                    }
                    Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
                }
            });

        match handle {
            Ok(handle) => {
                *self.shrinker.lock().unwrap() = Some(Shrinker { stop_tx, handle });
            }
            Err(e) => tracing::error!("failed to spawn shrinker thread: {e}"),
        }
    }

    fn update_row(
        &self,
        conn: &rusqlite::Connection,
        element: &CacheElement,
        blob: &[u8],
        create_time: &str,
        create_time_s: i64,
        expire_time_s: i64,
    ) -> Result<(), BackendError> {
        conn.execute(
            &format!(
                "UPDATE {} SET blob = ?1, create_time = ?2, create_time_s = ?3, \
                 expire_time_s = ?4 WHERE region = ?5 AND key = ?6",
                self.config.table
            ),
            params![
                blob,
                create_time,
                create_time_s,
                expire_time_s,
                self.config.region,
                element.key
            ],
        )?;
        Ok(())
    }

    fn row_exists(&self, conn: &rusqlite::Connection, key: &str) -> Result<bool, BackendError> {
        let found: Option<String> = conn
            .query_row(
                &format!(
                    "SELECT key FROM {} WHERE region = ?1 AND key = ?2",
                    self.config.table
                ),
                params![self.config.region, key],
                |row| row.get(0),
            )
            .optional()?;
        Ok(found.is_some())
    }
}

impl CacheBackend for SqlBackend {
    fn put(&self, element: &CacheElement) -> Result<(), BackendError> {
        let blob = self.codec.encode(element)?;
        let conn = self.conn()?;

        let now = Utc::now();
        let create_time = now.to_rfc3339();
        let create_time_s = now.timestamp();
        let expire_time_s = create_time_s.saturating_add(element.attributes.max_life_s as i64);
        let eternal = if element.attributes.is_eternal { "T" } else { "F" };

        if self.config.test_before_insert && self.row_exists(&conn, &element.key)? {
            return self.update_row(
                &conn,
                element,
                &blob,
                &create_time,
                create_time_s,
                expire_time_s,
            );
        }

        let insert = conn.execute(
            &format!(
                "INSERT INTO {} \
                 (region, key, blob, create_time, create_time_s, max_life_s, expire_time_s, eternal) \
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
                self.config.table
            ),
            params![
                self.config.region,
                element.key,
                blob,
                create_time,
                create_time_s,
                element.attributes.max_life_s as i64,
                expire_time_s,
                eternal
            ],
        );

        match insert {
            Ok(_) => Ok(()),
            Err(e) if is_unique_violation(&e) => {
                // Lost the insert race; the row exists now.
                self.update_row(
                    &conn,
                    element,
                    &blob,
                    &create_time,
                    create_time_s,
                    expire_time_s,
                )
            }
            Err(e) => Err(e.into()),
        }
    }

    fn get(&self, key: &str) -> Result<Option<CacheElement>, BackendError> {
        let conn = self.conn()?;
        let row: Option<(Vec<u8>, String, i64)> = conn
            .query_row(
                &format!(
                    "SELECT blob, eternal, expire_time_s FROM {} WHERE region = ?1 AND key = ?2",
                    self.config.table
                ),
                params![self.config.region, key],
                |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
            )
            .optional()?;

        let Some((blob, eternal, expire_time_s)) = row else {
            return Ok(None);
        };
        if eternal != "T" && expire_time_s < Utc::now().timestamp() {
            return Ok(None);
        }
        Ok(Some(self.codec.decode(&blob)?))
    }

    fn remove(&self, key: &str) -> Result<bool, BackendError> {
        let conn = self.conn()?;
        let deleted = if key.ends_with(NAME_COMPONENT_DELIMITER) {
            // Trailing delimiter widens the delete to the whole group.
            conn.execute(
                &format!(
                    "DELETE FROM {} WHERE region = ?1 AND key LIKE ?2",
                    self.config.table
                ),
                params![self.config.region, format!("{key}%")],
            )?
        } else {
            conn.execute(
                &format!(
                    "DELETE FROM {} WHERE region = ?1 AND key = ?2",
                    self.config.table
                ),
                params![self.config.region, key],
            )?
        };
        Ok(deleted > 0)
    }

    fn remove_all(&self) -> Result<(), BackendError> {
        if !self.config.allow_remove_all {
            tracing::warn!(
                "remove_all disabled for table '{}'; ignoring",
                self.config.table
            );
            return Ok(());
        }
        let conn = self.conn()?;
        conn.execute(
            &format!("DELETE FROM {} WHERE region = ?1", self.config.table),
            params![self.config.region],
        )?;
        Ok(())
    }

    fn size(&self) -> Result<u64, BackendError> {
        let conn = self.conn()?;
        let count: i64 = conn.query_row(
            &format!(
                "SELECT COUNT(*) FROM {} WHERE region = ?1",
                self.config.table
            ),
            params![self.config.region],
            |row| row.get(0),
        )?;
        Ok(count as u64)
    }

    fn dispose(&self) {
        if let Some(shrinker) = self.shrinker.lock().unwrap().take() {
            let _ = shrinker.stop_tx.send(());
            if shrinker.handle.join().is_err() {
                tracing::warn!("shrinker thread panicked during dispose");
            }
        }
    }
}

impl Drop for SqlBackend {
    fn drop(&mut self) {
        self.dispose();
    }
}

fn sweep(
    pool: &Pool<SqliteConnectionManager>,
    table: &str,
    region: &str,
) -> anyhow::Result<usize> {
    let conn = pool.get()?;
    let deleted = conn.execute(
        &format!("DELETE FROM {table} WHERE region = ?1 AND eternal = 'F' AND expire_time_s < ?2"),
        params![region, Utc::now().timestamp()],
    )?;
    if deleted > 0 {
        tracing::info!("expiry sweep removed {} rows from region '{}'", deleted, region);
    }
    Ok(deleted)
}

fn init_schema(conn: &rusqlite::Connection, table: &str) -> Result<(), BackendError> {
    conn.execute_batch(&format!(
        r#"
        CREATE TABLE IF NOT EXISTS {table} (
            region TEXT NOT NULL,
            key TEXT NOT NULL,
            blob BLOB,
            create_time TEXT,
            create_time_s INTEGER,
            max_life_s INTEGER,
            expire_time_s INTEGER,
            eternal TEXT,
            PRIMARY KEY (region, key)
        );
        CREATE INDEX IF NOT EXISTS idx_{table}_expiry
            ON {table} (region, eternal, expire_time_s);
        "#
    ))?;
    Ok(())
}

/// Table names are interpolated into SQL, so they are restricted to
/// identifier characters.
fn valid_identifier(name: &str) -> bool {
    !name.is_empty()
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_')
        && !name.chars().next().is_some_and(|c| c.is_ascii_digit())
}

fn is_unique_violation(e: &rusqlite::Error) -> bool {
    match e {
        rusqlite::Error::SqliteFailure(err, message) => {
            err.code == rusqlite::ErrorCode::ConstraintViolation
                || message
                    .as_deref()
                    .is_some_and(|m| m.contains("UNIQUE constraint failed"))
        }
        _ => false,
    }
}
