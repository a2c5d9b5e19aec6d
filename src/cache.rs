//! Disk cache facade.
//!
//! The public face of the write-back tier. `update` stages the element and
//! queues a persistence event; `get` checks the staging map first and
//! rescues a pending write when it finds one; `remove` and `remove_all`
//! are synchronous and bypass the queue entirely.
//!
//! # Architecture
//!
//! ```text
//! caller ──→ DiskCache
//!               │  update: Purgatory.put + enqueue Put(key)
//!               │  get:    Purgatory rescue, else Backend.get
//!               │  remove: Purgatory.remove + Backend.remove (sync)
//!               │
//!               ├──→ Purgatory       (staging map)
//!               ├──→ LockRegistry    (per-key write locks)
//!               ├──→ EventQueue      (writer thread)
//!               └──→ CacheBackend    (durable rows)
//! ```
//!
//! Durability note: elements still in the queue are lost on crash. This
//! tier is an optimization behind a primary in-memory cache, not a log.

use crate::backend::CacheBackend;
use crate::config::DiskCacheConfig;
use crate::element::{CacheElement, NAME_COMPONENT_DELIMITER};
use crate::error::CacheError;
use crate::locks::LockRegistry;
use crate::purgatory::Purgatory;
use crate::queue::{EventQueue, SpoolEvent};
use crate::stats::{CacheStats, CacheStatsSnapshot, QueueMetricsSnapshot};
use std::collections::HashSet;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Lifecycle of a cache instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum CacheStatus {
    Uninitialized = 0,
    Alive = 1,
    Disposing = 2,
    Disposed = 3,
}

impl CacheStatus {
    fn from_u8(raw: u8) -> Self {
        match raw {
            1 => CacheStatus::Alive,
            2 => CacheStatus::Disposing,
            3 => CacheStatus::Disposed,
            _ => CacheStatus::Uninitialized,
        }
    }
}

/// Write-back auxiliary cache over a pluggable persistence backend.
///
/// All operations are callable from any thread. Operations invoked
/// outside the `Alive` state are no-ops that return empty results.
pub struct DiskCache {
    region: String,
    status: AtomicU8,
    purgatory: Arc<Purgatory>,
    locks: Arc<LockRegistry>,
    queue: EventQueue,
    backend: Arc<dyn CacheBackend>,
    stats: CacheStats,
    dispose_timeout: Duration,
}

impl DiskCache {
    /// Wire up the staging map, the lock registry and the writer thread
    /// over `backend`, and bring the cache alive.
    pub fn new(
        config: DiskCacheConfig,
        backend: Arc<dyn CacheBackend>,
    ) -> Result<Self, CacheError> {
        let purgatory = Arc::new(Purgatory::new());
        let locks = Arc::new(LockRegistry::new());
        let queue = EventQueue::start(&config, purgatory.clone(), locks.clone(), backend.clone())?;

        tracing::info!("disk cache for region '{}' is alive", config.region);
        Ok(Self {
            region: config.region,
            status: AtomicU8::new(CacheStatus::Alive as u8),
            purgatory,
            locks,
            queue,
            backend,
            stats: CacheStats::default(),
            dispose_timeout: config.dispose_timeout,
        })
    }

    fn is_alive(&self) -> bool {
        self.status.load(Ordering::Acquire) == CacheStatus::Alive as u8
    }

    /// Accept an element for asynchronous persistence.
    ///
    /// Returns as soon as the element is staged and its event queued;
    /// never waits on the backend. A full queue may briefly block and
    /// then drop the event (counted, logged). The only hard failure is a
    /// destroyed queue.
    pub fn update(&self, mut element: CacheElement) -> Result<(), CacheError> {
        if !self.is_alive() {
            tracing::debug!("update ignored; region '{}' is not alive", self.region);
            return Ok(());
        }
        if element.key.is_empty() {
            return Err(CacheError::EmptyKey);
        }
        // Refuse before staging so a dead write path leaves no orphaned
        // purgatory items behind.
        if self.queue.is_destroyed() {
            return Err(CacheError::QueueDestroyed);
        }
        element.stamp_create_time();

        self.stats.update_count.fetch_add(1, Ordering::Relaxed);
        let key = element.key.clone();
        self.purgatory.put(element);
        self.queue.append(SpoolEvent::Put(key))
    }

    /// Fetch an element.
    ///
    /// A hit in the staging map cancels the pending write and returns the
    /// staged element synchronously. Otherwise the backend is consulted;
    /// a backend failure is logged, destroys the queue, and reads as a
    /// miss. The cache stays alive either way.
    pub fn get(&self, key: &str) -> Option<CacheElement> {
        if !self.is_alive() {
            return None;
        }
        self.stats.get_count.fetch_add(1, Ordering::Relaxed);

        let handle = self.locks.handle(key);
        {
            let _guard = handle.write()?;
            if let Some(element) = self.purgatory.mark_unspoolable(key) {
                self.stats.purgatory_hits.fetch_add(1, Ordering::Relaxed);
                return Some(element);
            }
        }

        // Hold the read side so a writer mid-flight on this key finishes
        // before we consult the backend.
        let _guard = handle.read()?;
        match self.backend.get(key) {
            Ok(Some(element)) => {
                self.stats.backend_hits.fetch_add(1, Ordering::Relaxed);
                Some(element)
            }
            Ok(None) => {
                self.stats.backend_misses.fetch_add(1, Ordering::Relaxed);
                None
            }
            Err(e) => {
                tracing::error!("backend get for '{key}' failed: {e}");
                self.queue.destroy();
                None
            }
        }
    }

    /// Remove a key synchronously from both the staging map and the
    /// backend. Returns the backend's report of whether a row existed.
    /// A key ending in the name-component delimiter removes the group.
    pub fn remove(&self, key: &str) -> bool {
        if !self.is_alive() {
            return false;
        }
        self.stats.remove_count.fetch_add(1, Ordering::Relaxed);

        let handle = self.locks.handle(key);
        let Some(_guard) = handle.write() else {
            return false;
        };

        if key.ends_with(NAME_COMPONENT_DELIMITER) {
            // Each staged sub-key is cancelled under its own lock, so a
            // writer already holding one finishes (or skips) before the
            // item disappears; the group lock alone would not serialize
            // against it.
            for staged in self.purgatory.keys_with_prefix(key) {
                let sub = self.locks.handle(&staged);
                let guard = sub.write();
                if guard.is_some() {
                    self.purgatory.mark_unspoolable(&staged);
                }
            }
        } else {
            self.purgatory.remove(key);
        }

        match self.backend.remove(key) {
            Ok(existed) => existed,
            Err(e) => {
                tracing::error!("backend remove for '{key}' failed: {e}");
                false
            }
        }
    }

    /// Queue a removal instead of performing it synchronously.
    ///
    /// The removal is sequenced behind every event already queued, so an
    /// `update` submitted before this call persists first and is then
    /// removed, and one submitted after wins. Use [`DiskCache::remove`]
    /// when the row must be gone on return.
    pub fn remove_async(&self, key: &str) -> Result<(), CacheError> {
        if !self.is_alive() {
            return Ok(());
        }
        self.stats.remove_count.fetch_add(1, Ordering::Relaxed);
        self.queue.append(SpoolEvent::Remove(key.to_string()))
    }

    /// Queue a region wipe behind every pending event.
    pub fn remove_all_async(&self) -> Result<(), CacheError> {
        if !self.is_alive() {
            return Ok(());
        }
        self.queue.append(SpoolEvent::RemoveAll)
    }

    /// Drop everything in this region: the staging map is swapped for a
    /// fresh one (stale queued events become no-ops) and the backend is
    /// cleared.
    pub fn remove_all(&self) {
        if !self.is_alive() {
            return;
        }
        let discarded = self.purgatory.swap_empty();
        if !discarded.is_empty() {
            tracing::debug!("remove_all discarded {} staged elements", discarded.len());
        }
        if let Err(e) = self.backend.remove_all() {
            tracing::error!("backend remove_all failed: {e}");
        }
    }

    /// Shut down: drain the queue, then dispose the backend.
    ///
    /// Everything queued before this call is persisted in FIFO order
    /// (bounded by the configured dispose timeout) before the backend is
    /// released. Subsequent operations are no-ops. Idempotent.
    pub fn dispose(&self) {
        if self
            .status
            .compare_exchange(
                CacheStatus::Alive as u8,
                CacheStatus::Disposing as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_err()
        {
            return;
        }

        self.queue.stop_and_join(self.dispose_timeout);
        self.backend.dispose();
        self.status
            .store(CacheStatus::Disposed as u8, Ordering::Release);
        tracing::info!("disk cache for region '{}' disposed", self.region);
    }

    /// Rows reachable through this cache: staged elements plus backend
    /// rows. A key both staged and already persisted counts twice; the
    /// figure is a monitoring aid, not an exact cardinality.
    pub fn size(&self) -> u64 {
        if !self.is_alive() {
            return 0;
        }
        let backend = match self.backend.size() {
            Ok(n) => n,
            Err(e) => {
                tracing::warn!("backend size failed: {e}");
                0
            }
        };
        self.purgatory.len() as u64 + backend
    }

    /// `Alive` once constructed, `Disposed` after `dispose`.
    pub fn status(&self) -> CacheStatus {
        match CacheStatus::from_u8(self.status.load(Ordering::Acquire)) {
            CacheStatus::Alive => CacheStatus::Alive,
            _ => CacheStatus::Disposed,
        }
    }

    /// Keys in `group`, unioned across the staging map and the backend.
    /// Backends without group indexing contribute nothing.
    pub fn get_group_keys(&self, group: &str) -> HashSet<String> {
        if !self.is_alive() {
            return HashSet::new();
        }
        let prefix = format!("{group}{NAME_COMPONENT_DELIMITER}");
        let mut keys: HashSet<String> =
            self.purgatory.keys_with_prefix(&prefix).into_iter().collect();
        match self.backend.get_group_keys(group) {
            Ok(backend_keys) => keys.extend(backend_keys),
            Err(crate::error::BackendError::Unsupported(_)) => {
                tracing::debug!("backend does not index groups; staging keys only");
            }
            Err(e) => tracing::warn!("backend get_group_keys failed: {e}"),
        }
        keys
    }

    /// Block until the writer thread has caught up with everything
    /// accepted so far, or the timeout passes. Returns `true` if drained.
    pub fn flush(&self, timeout: Duration) -> bool {
        self.queue.wait_drained(timeout)
    }

    /// Facade counters.
    pub fn stats(&self) -> CacheStatsSnapshot {
        self.stats.snapshot()
    }

    /// Writer-side counters.
    pub fn queue_metrics(&self) -> QueueMetricsSnapshot {
        self.queue.metrics().snapshot()
    }

    /// Events accepted but not yet processed.
    pub fn queue_depth(&self) -> u64 {
        self.queue.depth()
    }

    pub fn region(&self) -> &str {
        &self.region
    }
}

impl Drop for DiskCache {
    fn drop(&mut self) {
        self.dispose();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::memory::MemoryBackend;
    use crate::backend::sql::SqlBackend;
    use crate::backend::CacheBackend;
    use crate::codec::JsonCodec;
    use crate::config::SqlBackendConfig;
    use crate::element::ElementAttributes;
    use crate::error::BackendError;
    use tempfile::TempDir;

    const DRAIN: Duration = Duration::from_secs(5);

    /// Route writer-thread logs through the test harness when RUST_LOG is
    /// set.
    fn init_logs() {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .with_test_writer()
            .try_init();
    }

    fn cache_over(backend: Arc<dyn CacheBackend>) -> DiskCache {
        init_logs();
        DiskCache::new(DiskCacheConfig::default(), backend).unwrap()
    }

    fn element(key: &str, byte: u8) -> CacheElement {
        CacheElement::new(key, vec![byte])
    }

    /// Backend whose `put` parks until the test releases it, reporting
    /// when the writer has entered. Parking the writer on a barrier key
    /// keeps staged elements in purgatory for as long as a test needs.
    struct GatedBackend {
        entered: std::sync::mpsc::Sender<()>,
        gate: Arc<std::sync::Mutex<()>>,
        inner: MemoryBackend,
    }

    impl GatedBackend {
        fn create() -> (Arc<Self>, std::sync::mpsc::Receiver<()>, Arc<std::sync::Mutex<()>>) {
            let (entered_tx, entered_rx) = std::sync::mpsc::channel();
            let gate = Arc::new(std::sync::Mutex::new(()));
            let backend = Arc::new(Self {
                entered: entered_tx,
                gate: gate.clone(),
                inner: MemoryBackend::new(),
            });
            (backend, entered_rx, gate)
        }
    }

    impl CacheBackend for GatedBackend {
        fn put(&self, element: &CacheElement) -> Result<(), BackendError> {
            let _ = self.entered.send(());
            let _hold = self.gate.lock().unwrap();
            self.inner.put(element)
        }
        fn get(&self, key: &str) -> Result<Option<CacheElement>, BackendError> {
            self.inner.get(key)
        }
        fn remove(&self, key: &str) -> Result<bool, BackendError> {
            self.inner.remove(key)
        }
        fn remove_all(&self) -> Result<(), BackendError> {
            self.inner.remove_all()
        }
        fn size(&self) -> Result<u64, BackendError> {
            self.inner.size()
        }
        fn dispose(&self) {}
    }

    /// A read before the drain rescues the staged element; nothing ever
    /// reaches the backend.
    #[test]
    fn test_read_cancels_pending_write() {
        let (backend, entered_rx, gate) = GatedBackend::create();
        let cache = cache_over(backend.clone());

        // Park the writer on an unrelated key so "a" stays staged.
        let hold = gate.lock().unwrap();
        cache.update(element("barrier", 0)).unwrap();
        entered_rx.recv_timeout(DRAIN).unwrap();

        cache.update(element("a", 1)).unwrap();
        let got = cache.get("a").unwrap();
        assert_eq!(got.value, vec![1]);
        assert!(!cache.purgatory.contains("a"));
        assert_eq!(cache.stats().purgatory_hits, 1);

        drop(hold);
        assert!(cache.flush(DRAIN));
        assert!(backend.inner.get("a").unwrap().is_none());
    }

    /// Left alone, the element flows through to the backend and is served
    /// from there.
    #[test]
    fn test_unread_write_is_persisted() {
        let backend = Arc::new(MemoryBackend::new());
        let cache = cache_over(backend.clone());

        cache.update(element("b", 2)).unwrap();
        assert!(cache.flush(DRAIN));

        assert!(cache.purgatory.is_empty());
        assert_eq!(backend.get("b").unwrap().unwrap().value, vec![2]);
        let got = cache.get("b").unwrap();
        assert_eq!(got.value, vec![2]);
        assert_eq!(cache.stats().backend_hits, 1);
    }

    /// An overwrite supersedes the staged item; a read then rescues the
    /// second value and neither version is persisted.
    #[test]
    fn test_overwrite_then_cancel() {
        let (backend, entered_rx, gate) = GatedBackend::create();
        let cache = cache_over(backend.clone());

        let hold = gate.lock().unwrap();
        cache.update(element("barrier", 0)).unwrap();
        entered_rx.recv_timeout(DRAIN).unwrap();

        cache.update(element("c", 10)).unwrap();
        cache.update(element("c", 20)).unwrap();
        assert_eq!(cache.get("c").unwrap().value, vec![20]);

        drop(hold);
        assert!(cache.flush(DRAIN));
        assert!(backend.inner.get("c").unwrap().is_none());
    }

    #[test]
    fn test_overwrite_without_read_persists_latest() {
        let backend = Arc::new(MemoryBackend::new());
        let cache = cache_over(backend.clone());

        cache.update(element("k", 1)).unwrap();
        cache.update(element("k", 2)).unwrap();
        assert!(cache.flush(DRAIN));

        assert_eq!(backend.get("k").unwrap().unwrap().value, vec![2]);
        assert_eq!(backend.size().unwrap(), 1);
    }

    #[test]
    fn test_update_then_get_never_misses() {
        let backend = Arc::new(MemoryBackend::new());
        let cache = cache_over(backend);

        // Whether or not the writer has run, the element must be visible.
        for i in 0..100u8 {
            let key = format!("k{i}");
            cache.update(element(&key, i)).unwrap();
            assert_eq!(cache.get(&key).unwrap().value, vec![i]);
        }
    }

    #[test]
    fn test_dispose_rejects_subsequent_operations() {
        let backend = Arc::new(MemoryBackend::new());
        let cache = cache_over(backend.clone());

        cache.dispose();
        assert_eq!(cache.status(), CacheStatus::Disposed);

        let before = cache.stats().update_count;
        cache.update(element("f", 5)).unwrap();
        assert_eq!(cache.stats().update_count, before);
        assert!(cache.get("f").is_none());
        assert!(backend.get("f").unwrap().is_none());

        // Idempotent.
        cache.dispose();
        assert_eq!(cache.status(), CacheStatus::Disposed);
    }

    #[test]
    fn test_dispose_drains_queued_writes() {
        let backend = Arc::new(MemoryBackend::new());
        let cache = cache_over(backend.clone());

        for i in 0..20u8 {
            cache.update(element(&format!("k{i}"), i)).unwrap();
        }
        cache.dispose();
        assert_eq!(backend.size().unwrap(), 20);
    }

    #[test]
    fn test_remove_reports_backend_truth() {
        let backend = Arc::new(MemoryBackend::new());
        let cache = cache_over(backend);

        cache.update(element("r", 1)).unwrap();
        assert!(cache.flush(DRAIN));

        assert!(cache.remove("r"));
        assert!(!cache.remove("r"));
        assert!(cache.get("r").is_none());
    }

    #[test]
    fn test_remove_drops_staged_element_too() {
        let backend = Arc::new(MemoryBackend::new());
        let cache = cache_over(backend.clone());

        cache.update(element("r", 1)).unwrap();
        // Staged but likely unpersisted; remove must win either way.
        let _ = cache.remove("r");
        assert!(cache.flush(DRAIN));
        assert!(cache.get("r").is_none());
        assert!(backend.get("r").unwrap().is_none());
    }

    #[test]
    fn test_group_remove_clears_staging_and_backend() {
        let backend = Arc::new(MemoryBackend::new());
        let cache = cache_over(backend.clone());

        cache.update(element("g:1", 1)).unwrap();
        cache.update(element("g:2", 2)).unwrap();
        cache.update(element("solo", 3)).unwrap();
        assert!(cache.flush(DRAIN));

        assert!(cache.remove("g:"));
        assert!(cache.get("g:1").is_none());
        assert!(cache.get("g:2").is_none());
        assert!(cache.get("solo").is_some());
    }

    /// A group remove must wait for a writer already persisting one of
    /// the group's keys, so its backend delete lands after the write and
    /// the row cannot be resurrected.
    #[test]
    fn test_group_remove_waits_for_inflight_write() {
        let (backend, entered_rx, gate) = GatedBackend::create();
        let cache = cache_over(backend.clone());

        let hold = gate.lock().unwrap();
        cache.update(element("g:1", 1)).unwrap();
        // Writer is parked inside backend.put("g:1"), holding its key lock.
        entered_rx.recv_timeout(DRAIN).unwrap();

        std::thread::scope(|s| {
            let remover = s.spawn(|| cache.remove("g:"));
            // Let the remover reach the sub-key lock, then release the
            // writer under it.
            std::thread::sleep(Duration::from_millis(50));
            drop(hold);
            assert!(remover.join().unwrap());
        });

        assert!(cache.flush(DRAIN));
        assert!(backend.inner.get("g:1").unwrap().is_none());
        assert_eq!(backend.inner.size().unwrap(), 0);
    }

    #[test]
    fn test_async_removals_sequence_behind_pending_puts() {
        let backend = Arc::new(MemoryBackend::new());
        let cache = cache_over(backend.clone());

        cache.update(element("k", 1)).unwrap();
        cache.remove_async("k").unwrap();
        assert!(cache.flush(DRAIN));
        assert!(backend.get("k").unwrap().is_none());
        assert!(cache.purgatory.is_empty());

        cache.update(element("x", 9)).unwrap();
        cache.remove_all_async().unwrap();
        assert!(cache.flush(DRAIN));
        assert_eq!(backend.size().unwrap(), 0);
    }

    #[test]
    fn test_remove_all_empties_purgatory_and_backend() {
        let backend = Arc::new(MemoryBackend::new());
        let cache = cache_over(backend.clone());

        for i in 0..10u8 {
            cache.update(element(&format!("k{i}"), i)).unwrap();
        }
        cache.remove_all();

        assert_eq!(cache.purgatory.len(), 0);
        assert!(cache.flush(DRAIN));
        assert_eq!(backend.size().unwrap(), 0);
    }

    #[test]
    fn test_update_count_increments_once_per_accepted_update() {
        let backend = Arc::new(MemoryBackend::new());
        let cache = cache_over(backend);

        for _ in 0..7 {
            cache.update(element("same", 0)).unwrap();
        }
        assert_eq!(cache.stats().update_count, 7);
        assert!(matches!(
            cache.update(CacheElement::new("", vec![])),
            Err(CacheError::EmptyKey)
        ));
        assert_eq!(cache.stats().update_count, 7);
    }

    #[test]
    fn test_get_group_keys_unions_staging_and_backend() {
        let backend = Arc::new(MemoryBackend::new());
        let cache = cache_over(backend.clone());

        backend.put(&element("g:persisted", 1)).unwrap();
        cache.update(element("g:staged", 2)).unwrap();

        let keys = cache.get_group_keys("g");
        assert!(keys.contains("g:persisted"));
        assert!(keys.contains("g:staged"));
        assert_eq!(keys.len(), 2);
    }

    /// Backend read failures degrade to a miss and stop the write path,
    /// but the cache itself stays alive for reads.
    #[test]
    fn test_backend_get_error_destroys_queue_only() {
        struct ReadFailBackend(MemoryBackend);
        impl CacheBackend for ReadFailBackend {
            fn put(&self, element: &CacheElement) -> Result<(), BackendError> {
                self.0.put(element)
            }
            fn get(&self, _key: &str) -> Result<Option<CacheElement>, BackendError> {
                Err(BackendError::Transient("read failed".into()))
            }
            fn remove(&self, key: &str) -> Result<bool, BackendError> {
                self.0.remove(key)
            }
            fn remove_all(&self) -> Result<(), BackendError> {
                self.0.remove_all()
            }
            fn size(&self) -> Result<u64, BackendError> {
                self.0.size()
            }
            fn dispose(&self) {}
        }

        let cache = cache_over(Arc::new(ReadFailBackend(MemoryBackend::new())));
        assert!(cache.get("anything").is_none());

        // Still alive, but the write path is closed.
        assert_eq!(cache.status(), CacheStatus::Alive);
        assert!(matches!(
            cache.update(element("x", 1)),
            Err(CacheError::QueueDestroyed)
        ));
    }

    #[test]
    fn test_end_to_end_over_sql_backend() {
        let dir = TempDir::new().unwrap();
        let backend = Arc::new(
            SqlBackend::new(
                SqlBackendConfig {
                    db_path: dir.path().join("cache.db"),
                    region: "e2e".to_string(),
                    shrink_interval: Duration::ZERO,
                    ..SqlBackendConfig::default()
                },
                Arc::new(JsonCodec),
            )
            .unwrap(),
        );
        let cache = DiskCache::new(
            DiskCacheConfig {
                region: "e2e".to_string(),
                ..DiskCacheConfig::default()
            },
            backend.clone(),
        )
        .unwrap();

        let el = CacheElement::with_attributes(
            "row",
            b"payload".to_vec(),
            ElementAttributes {
                create_time_ms: 0,
                max_life_s: 3600,
                is_eternal: false,
            },
        );
        cache.update(el).unwrap();
        assert!(cache.flush(DRAIN));

        let got = cache.get("row").unwrap();
        assert_eq!(got.value, b"payload");
        assert_eq!(cache.size(), 1);

        assert!(cache.remove("row"));
        assert!(cache.get("row").is_none());
        cache.dispose();
    }
}
