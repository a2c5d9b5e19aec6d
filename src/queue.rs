//! Event queue and writer thread.
//!
//! Persistence runs on a dedicated OS thread fed by a bounded channel, so
//! callers never block on the backend. Events carry keys only; the writer
//! reads the element back out of purgatory when it gets there, which is
//! what lets a read cancel a pending write without scanning the queue.
//!
//! # Architecture
//!
//! ```text
//! DiskCache.update()
//!     │
//!     └──→ std::sync::mpsc::SyncSender (bounded)
//!             │
//!             └──→ Writer Thread ("spool-writer")
//!                     │
//!                     ├──→ Purgatory (fetch-and-validate under key lock)
//!                     └──→ CacheBackend.put / remove / remove_all
//! ```
//!
//! Repeated backend failures push the queue into a terminal destroyed
//! state: appends are rejected and anything still buffered drains as a
//! no-op. Codec failures drop only their own event.

use crate::backend::CacheBackend;
use crate::config::DiskCacheConfig;
use crate::error::{BackendError, CacheError};
use crate::locks::LockRegistry;
use crate::purgatory::Purgatory;
use crate::stats::QueueMetrics;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Receiver, SyncSender, TrySendError};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

/// One unit of work for the writer thread.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum SpoolEvent {
    /// Persist the purgatory item for this key, if still spoolable.
    Put(String),
    /// Remove this key from the backend.
    Remove(String),
    /// Clear the backend region.
    RemoveAll,
    /// Drain and exit.
    Dispose,
}

/// Count of events accepted but not yet finished by the writer.
///
/// `wait_empty` is what `flush` and orderly shutdown block on.
#[derive(Debug, Default)]
struct DepthGauge {
    depth: Mutex<u64>,
    drained: Condvar,
}

impl DepthGauge {
    fn inc(&self) {
        *self.depth.lock().unwrap() += 1;
    }

    fn dec(&self) {
        let mut depth = self.depth.lock().unwrap();
        *depth = depth.saturating_sub(1);
        if *depth == 0 {
            self.drained.notify_all();
        }
    }

    fn current(&self) -> u64 {
        *self.depth.lock().unwrap()
    }

    fn wait_empty(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut depth = self.depth.lock().unwrap();
        while *depth > 0 {
            let now = Instant::now();
            if now >= deadline {
                return false;
            }
            let (guard, result) = self
                .drained
                .wait_timeout(depth, deadline - now)
                .unwrap();
            depth = guard;
            if result.timed_out() && *depth > 0 {
                return false;
            }
        }
        true
    }
}

/// Latch the writer thread completes on exit.
#[derive(Debug, Default)]
struct CompletionSignal {
    done: Mutex<bool>,
    signal: Condvar,
}

impl CompletionSignal {
    fn complete(&self) {
        *self.done.lock().unwrap() = true;
        self.signal.notify_all();
    }

    fn wait(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut done = self.done.lock().unwrap();
        while !*done {
            let now = Instant::now();
            if now >= deadline {
                return false;
            }
            let (guard, result) = self.signal.wait_timeout(done, deadline - now).unwrap();
            done = guard;
            if result.timed_out() && !*done {
                return false;
            }
        }
        true
    }
}

/// Bounded FIFO of persistence events with one writer thread.
pub(crate) struct EventQueue {
    tx: SyncSender<SpoolEvent>,
    worker: Mutex<Option<JoinHandle<()>>>,
    destroyed: Arc<AtomicBool>,
    depth: Arc<DepthGauge>,
    completion: Arc<CompletionSignal>,
    metrics: Arc<QueueMetrics>,
    enqueue_timeout: Duration,
}

impl EventQueue {
    /// Start the writer thread. The writer holds the purgatory, the lock
    /// registry and the backend; it never sees the cache facade.
    pub(crate) fn start(
        config: &DiskCacheConfig,
        purgatory: Arc<Purgatory>,
        locks: Arc<LockRegistry>,
        backend: Arc<dyn CacheBackend>,
    ) -> Result<Self, CacheError> {
        let (tx, rx) = mpsc::sync_channel::<SpoolEvent>(config.queue_capacity.max(1));
        let destroyed = Arc::new(AtomicBool::new(false));
        let depth = Arc::new(DepthGauge::default());
        let completion = Arc::new(CompletionSignal::default());
        let metrics = Arc::new(QueueMetrics::default());

        let worker = Worker {
            rx,
            purgatory,
            locks,
            backend,
            destroyed: destroyed.clone(),
            depth: depth.clone(),
            metrics: metrics.clone(),
            error_threshold: config.error_threshold.max(1),
        };
        let writer_completion = completion.clone();
        let region = config.region.clone();

        let handle = thread::Builder::new()
            .name("spool-writer".into())
            .spawn(move || {
                if let Err(e) = worker.run() {
                    tracing::error!("writer thread for region '{}' failed: {e}", region);
                }
                writer_completion.complete();
            })
            .map_err(|e| CacheError::WorkerSpawn(e.to_string()))?;

        Ok(Self {
            tx,
            worker: Mutex::new(Some(handle)),
            destroyed,
            depth,
            completion,
            metrics,
            enqueue_timeout: config.enqueue_timeout,
        })
    }

    /// Append an event.
    ///
    /// A full channel is retried in small slices up to the configured
    /// grace, then the event is dropped and counted; the cache tier is
    /// auxiliary, so losing a write is a performance event, not an error.
    /// Only a destroyed queue rejects the append outright.
    pub(crate) fn append(&self, event: SpoolEvent) -> Result<(), CacheError> {
        if self.destroyed.load(Ordering::Acquire) {
            return Err(CacheError::QueueDestroyed);
        }

        let mut event = event;
        let deadline = Instant::now() + self.enqueue_timeout;
        loop {
            match self.tx.try_send(event) {
                Ok(()) => {
                    self.depth.inc();
                    self.metrics.events_enqueued.fetch_add(1, Ordering::Relaxed);
                    return Ok(());
                }
                Err(TrySendError::Full(returned)) => {
                    if Instant::now() >= deadline {
                        self.metrics.events_dropped.fetch_add(1, Ordering::Relaxed);
                        tracing::warn!(
                            "event queue full; dropped event (total dropped: {})",
                            self.metrics.events_dropped.load(Ordering::Relaxed)
                        );
                        return Ok(());
                    }
                    event = returned;
                    thread::sleep(Duration::from_millis(1));
                }
                Err(TrySendError::Disconnected(_)) => {
                    self.destroyed.store(true, Ordering::Release);
                    return Err(CacheError::QueueDestroyed);
                }
            }
        }
    }

    /// Terminal stop: reject all future appends and drain the rest as
    /// no-ops. The writer thread keeps running until disposed.
    pub(crate) fn destroy(&self) {
        if !self.destroyed.swap(true, Ordering::AcqRel) {
            tracing::error!("event queue destroyed; further updates are rejected");
        }
    }

    pub(crate) fn is_destroyed(&self) -> bool {
        self.destroyed.load(Ordering::Acquire)
    }

    /// Block until everything accepted so far has been processed.
    pub(crate) fn wait_drained(&self, timeout: Duration) -> bool {
        self.depth.wait_empty(timeout)
    }

    pub(crate) fn depth(&self) -> u64 {
        self.depth.current()
    }

    pub(crate) fn metrics(&self) -> &QueueMetrics {
        &self.metrics
    }

    /// Graceful drain: everything queued ahead of the dispose event is
    /// processed in FIFO order, then the writer exits and is joined.
    pub(crate) fn stop_and_join(&self, timeout: Duration) {
        // `send` rather than `append`: the dispose event must not be
        // droppable, and it must get through even when destroyed.
        self.depth.inc();
        if self.tx.send(SpoolEvent::Dispose).is_err() {
            self.depth.dec();
        }

        if !self.completion.wait(timeout) {
            tracing::warn!("writer thread did not drain within {:?}", timeout);
        }
        if let Some(handle) = self.worker.lock().unwrap().take() {
            if handle.join().is_err() {
                tracing::warn!("writer thread panicked");
            }
        }
    }
}

impl Drop for EventQueue {
    fn drop(&mut self) {
        let _ = self.tx.send(SpoolEvent::Dispose);
        if let Some(handle) = self.worker.lock().unwrap().take() {
            let _ = handle.join();
        }
    }
}

/// State owned by the writer thread.
struct Worker {
    rx: Receiver<SpoolEvent>,
    purgatory: Arc<Purgatory>,
    locks: Arc<LockRegistry>,
    backend: Arc<dyn CacheBackend>,
    destroyed: Arc<AtomicBool>,
    depth: Arc<DepthGauge>,
    metrics: Arc<QueueMetrics>,
    error_threshold: u32,
}

impl Worker {
    fn run(&self) -> anyhow::Result<()> {
        let mut consecutive_errors = 0u32;

        while let Ok(event) = self.rx.recv() {
            let dispose = matches!(event, SpoolEvent::Dispose);

            if !dispose && !self.destroyed.load(Ordering::Acquire) {
                match self.dispatch(event) {
                    Ok(()) => consecutive_errors = 0,
                    Err(BackendError::Codec(e)) => {
                        // A bad element drops alone; the queue stays up.
                        tracing::warn!("dropping unencodable element: {e}");
                    }
                    Err(e) => {
                        consecutive_errors += 1;
                        self.metrics.backend_errors.fetch_add(1, Ordering::Relaxed);
                        tracing::warn!(
                            "backend error ({consecutive_errors}/{}): {e}",
                            self.error_threshold
                        );
                        if consecutive_errors >= self.error_threshold {
                            self.destroyed.store(true, Ordering::Release);
                            tracing::error!(
                                "backend failed {consecutive_errors} times in a row; \
                                 event queue destroyed"
                            );
                        }
                    }
                }
            }

            self.metrics.events_processed.fetch_add(1, Ordering::Relaxed);
            self.depth.dec();

            if dispose {
                tracing::debug!("writer thread draining complete");
                break;
            }
        }
        Ok(())
    }

    fn dispatch(&self, event: SpoolEvent) -> Result<(), BackendError> {
        match event {
            SpoolEvent::Put(key) => self.handle_put(&key),
            SpoolEvent::Remove(key) => self.handle_remove(&key),
            SpoolEvent::RemoveAll => self.backend.remove_all(),
            SpoolEvent::Dispose => Ok(()),
        }
    }

    /// Fetch-and-validate: only write the item if it is still present and
    /// still spoolable, all under the per-key write lock. A read racing on
    /// the key either flipped `spoolable` off or already removed the item;
    /// both mean skip.
    fn handle_put(&self, key: &str) -> Result<(), BackendError> {
        let handle = self.locks.handle(key);
        let Some(_guard) = handle.write() else {
            return Ok(());
        };

        let Some(item) = self.purgatory.get(key) else {
            // Rescued by a read, dropped by a remove, or superseded.
            return Ok(());
        };
        if !item.spoolable {
            self.metrics.puts_cancelled.fetch_add(1, Ordering::Relaxed);
            return Ok(());
        }

        match self.backend.put(&item.element) {
            Ok(()) => {
                self.purgatory.remove(key);
                self.metrics.puts_written.fetch_add(1, Ordering::Relaxed);
                Ok(())
            }
            Err(e) => {
                // The write is lost either way; do not leave the item
                // stranded in the staging map.
                self.purgatory.remove(key);
                Err(e)
            }
        }
    }

    fn handle_remove(&self, key: &str) -> Result<(), BackendError> {
        let handle = self.locks.handle(key);
        let Some(_guard) = handle.write() else {
            return Ok(());
        };
        self.backend.remove(key).map(|_| ())
    }
}
