//! # Cache Orchestrator
//!
//! [`CachedStore`] puts the [`SecondaryStore`] in front of a slow
//! [`PersistentStore`] and owns the background thread that flushes the
//! secondary store's queue.
//!
//! ## Read and Write Paths
//!
//! ```text
//! load(path)                         store(entity)
//!   │                                  │
//!   ├─► secondary ── hit ──► done      ├─► persistent (synchronous)
//!   │                                  │
//!   └─► persistent ── found ──┐        └─► secondary queue ──┐
//!                             ▼                              ▼
//!                    secondary queue              flush worker commits later
//! ```
//!
//! ## Flush Worker
//!
//! One dedicated thread per store runs a single-threaded tokio runtime and
//! waits on a signal channel with a timeout:
//!
//! - timeout (`flush_interval`) or a write-threshold signal (sent every
//!   `flush_write_threshold` writes) starts a flush cycle
//! - a cycle is skipped if a load happened within `load_quiescence`, so an
//!   interactive query is not stalled by the flush's write lock
//! - shutdown runs one last flush, quiescence or not
//!
//! Flush failures are logged and forwarded to the channel returned by
//! [`CachedStore::take_flush_errors`]; no caller waits on them.

use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;

use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::time::timeout;
use tracing::{debug, info, warn};

use crate::codec::{current_time_ms, duration_to_ms};
use crate::config::CacheConfig;
use crate::entity::{Entity, EntityPath};
use crate::error::{Error, Result};
use crate::manager::{AttributeStore, EntityReader};
use crate::persistent::PersistentStore;
use crate::secondary::{FlushStats, SecondaryReader, SecondaryStore};

/// Pending wake-ups beyond this are dropped; one is enough to flush.
const SIGNAL_CHANNEL_SIZE: usize = 16;

/// Flush errors nobody collected are dropped past this many.
const FLUSH_ERROR_CHANNEL_SIZE: usize = 64;

const WORKER_THREAD_NAME: &str = "attrcache-flush";

// =============================================================================
// Statistics
// =============================================================================

/// Counters since the store was opened.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CacheStats {
    pub loads: u64,
    pub secondary_hits: u64,
    pub persistent_hits: u64,
    pub writes: u64,
    pub flushes: u64,
    pub skipped_flushes: u64,
    pub failed_flushes: u64,
    pub evicted: u64,
    /// Paths waiting in the secondary store's queue right now.
    pub pending: usize,
}

#[derive(Debug, Default)]
struct Counters {
    loads: AtomicU64,
    secondary_hits: AtomicU64,
    persistent_hits: AtomicU64,
    writes: AtomicU64,
    flushes: AtomicU64,
    skipped_flushes: AtomicU64,
    failed_flushes: AtomicU64,
    evicted: AtomicU64,
}

// =============================================================================
// Shared State
// =============================================================================

enum FlushSignal {
    WriteThreshold,
    Shutdown,
}

/// State shared by the store handle, its readers and the flush worker.
struct Shared {
    persistent: Arc<dyn PersistentStore>,
    secondary: Arc<SecondaryStore>,
    config: CacheConfig,
    counters: Counters,
    last_load_ms: AtomicU64,
    writes_since_flush: AtomicUsize,
    signal: Mutex<Option<mpsc::Sender<FlushSignal>>>,
    shut_down: AtomicBool,
}

impl Shared {
    fn ensure_running(&self) -> Result<()> {
        if self.shut_down.load(Ordering::Acquire) {
            return Err(Error::Shutdown);
        }
        Ok(())
    }

    /// Counts a write and wakes the worker every `flush_write_threshold`.
    fn note_write(&self) {
        self.counters.writes.fetch_add(1, Ordering::Relaxed);
        let writes = self.writes_since_flush.fetch_add(1, Ordering::AcqRel) + 1;
        if writes % self.config.flush_write_threshold == 0 {
            if let Some(signal) = self.signal.lock().as_ref() {
                // A full channel already holds a wake-up.
                let _ = signal.try_send(FlushSignal::WriteThreshold);
            }
        }
    }

    fn loaded_recently(&self) -> bool {
        let last = self.last_load_ms.load(Ordering::Acquire);
        let quiescence = duration_to_ms(self.config.load_quiescence);
        last != 0 && current_time_ms().saturating_sub(last) < quiescence
    }

    /// Secondary first, then persistent; a persistent hit is queued into the
    /// secondary store.
    fn load(
        &self,
        path: &EntityPath,
        secondary: impl FnOnce(&EntityPath) -> Result<Option<Entity>>,
    ) -> Result<Option<Entity>> {
        self.counters.loads.fetch_add(1, Ordering::Relaxed);
        self.last_load_ms.store(current_time_ms(), Ordering::Release);

        if let Some(entity) = secondary(path)? {
            self.counters.secondary_hits.fetch_add(1, Ordering::Relaxed);
            return Ok(Some(entity));
        }

        let loaded = self.persistent.load(path)?;
        if let Some(entity) = &loaded {
            self.counters.persistent_hits.fetch_add(1, Ordering::Relaxed);
            self.secondary.store(entity)?;
            self.note_write();
        }
        Ok(loaded)
    }

    fn flush(&self) -> Result<FlushStats> {
        self.writes_since_flush.store(0, Ordering::Release);
        self.counters.flushes.fetch_add(1, Ordering::Relaxed);

        let result = self.secondary.apply_changes();
        match &result {
            Ok(stats) => {
                self.counters
                    .evicted
                    .fetch_add(stats.evicted as u64, Ordering::Relaxed);
            }
            Err(_) => {
                self.counters.failed_flushes.fetch_add(1, Ordering::Relaxed);
            }
        }
        result
    }
}

// =============================================================================
// Cached Store
// =============================================================================

/// Read-through, write-back cache over a persistent store.
///
/// Dropping the store stops the flush worker after a final flush.
pub struct CachedStore {
    shared: Arc<Shared>,
    worker: Mutex<Option<JoinHandle<()>>>,
    flush_errors: Mutex<Option<mpsc::Receiver<Error>>>,
}

impl std::fmt::Debug for CachedStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CachedStore")
            .field("secondary", &self.shared.secondary)
            .field("shut_down", &self.shared.shut_down.load(Ordering::Relaxed))
            .finish_non_exhaustive()
    }
}

impl CachedStore {
    /// Composes the two tiers and starts the flush worker.
    ///
    /// Flush scheduling uses the secondary store's configuration.
    ///
    /// # Errors
    ///
    /// `Error::Io` if the worker thread or its runtime cannot be created.
    pub fn open(persistent: Arc<dyn PersistentStore>, secondary: Arc<SecondaryStore>) -> Result<Self> {
        let config = secondary.config().clone();
        let (signal_tx, signal_rx) = mpsc::channel(SIGNAL_CHANNEL_SIZE);
        let (errors_tx, errors_rx) = mpsc::channel(FLUSH_ERROR_CHANNEL_SIZE);

        let shared = Arc::new(Shared {
            persistent,
            secondary,
            config,
            counters: Counters::default(),
            last_load_ms: AtomicU64::new(0),
            writes_since_flush: AtomicUsize::new(0),
            signal: Mutex::new(Some(signal_tx)),
            shut_down: AtomicBool::new(false),
        });

        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_time()
            .build()
            .map_err(|e| Error::io(WORKER_THREAD_NAME, e))?;

        let worker_shared = Arc::clone(&shared);
        let worker = std::thread::Builder::new()
            .name(WORKER_THREAD_NAME.to_string())
            .spawn(move || {
                runtime.block_on(run_flush_worker(worker_shared, signal_rx, errors_tx));
            })
            .map_err(|e| Error::io(WORKER_THREAD_NAME, e))?;

        info!(
            flush_interval_ms = duration_to_ms(shared.config.flush_interval),
            write_threshold = shared.config.flush_write_threshold,
            "started flush worker"
        );

        Ok(Self {
            shared,
            worker: Mutex::new(Some(worker)),
            flush_errors: Mutex::new(Some(errors_rx)),
        })
    }

    pub fn secondary(&self) -> &Arc<SecondaryStore> {
        &self.shared.secondary
    }

    pub fn persistent(&self) -> &Arc<dyn PersistentStore> {
        &self.shared.persistent
    }

    /// Hands out the receiver of background flush failures.
    ///
    /// Returns `None` after the first call.
    pub fn take_flush_errors(&self) -> Option<mpsc::Receiver<Error>> {
        self.flush_errors.lock().take()
    }

    /// Flushes on the calling thread, ignoring load quiescence.
    pub fn flush_now(&self) -> Result<FlushStats> {
        self.shared.flush()
    }

    /// Stops the flush worker after a final flush and waits for it.
    ///
    /// Later writes fail with `Error::Shutdown`; loads keep working. Calling
    /// this more than once is harmless.
    pub fn shutdown(&self) {
        self.shared.shut_down.store(true, Ordering::Release);
        if let Some(signal) = self.shared.signal.lock().take() {
            let _ = signal.try_send(FlushSignal::Shutdown);
        }
        if let Some(worker) = self.worker.lock().take() {
            if worker.join().is_err() {
                warn!("flush worker panicked");
            }
        }
    }

    pub fn stats(&self) -> CacheStats {
        let c = &self.shared.counters;
        CacheStats {
            loads: c.loads.load(Ordering::Relaxed),
            secondary_hits: c.secondary_hits.load(Ordering::Relaxed),
            persistent_hits: c.persistent_hits.load(Ordering::Relaxed),
            writes: c.writes.load(Ordering::Relaxed),
            flushes: c.flushes.load(Ordering::Relaxed),
            skipped_flushes: c.skipped_flushes.load(Ordering::Relaxed),
            failed_flushes: c.failed_flushes.load(Ordering::Relaxed),
            evicted: c.evicted.load(Ordering::Relaxed),
            pending: self.shared.secondary.pending_len(),
        }
    }
}

impl Drop for CachedStore {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl AttributeStore for CachedStore {
    fn load(&self, path: &EntityPath) -> Result<Option<Entity>> {
        let secondary = &self.shared.secondary;
        self.shared.load(path, |path| secondary.load(path))
    }

    fn store(&self, entity: &Entity) -> Result<()> {
        self.shared.ensure_running()?;
        self.shared.persistent.store(entity)?;
        self.shared.secondary.store(entity)?;
        self.shared.note_write();
        Ok(())
    }

    /// Thumbnails are derived from the file, so they only go to the cache.
    fn store_thumbnail(&self, entity: &Entity) -> Result<()> {
        self.shared.ensure_running()?;
        self.shared.secondary.store_thumbnail(entity)?;
        self.shared.note_write();
        Ok(())
    }

    fn delete(&self, entity: &Entity) -> Result<()> {
        self.shared.ensure_running()?;
        self.shared.persistent.delete(entity)?;
        self.shared.secondary.delete(entity)?;
        self.shared.note_write();
        Ok(())
    }

    fn move_entity(&self, entity: &Entity, new_path: &EntityPath) -> Result<()> {
        self.shared.ensure_running()?;
        self.shared.persistent.move_entity(entity, new_path)?;
        self.shared.secondary.move_entity(entity, new_path)
    }

    fn create_reader(&self) -> Result<Box<dyn EntityReader>> {
        Ok(Box::new(CachedReader {
            shared: Arc::clone(&self.shared),
            secondary: self.shared.secondary.create_reader()?,
        }))
    }
}

// =============================================================================
// Cached Reader
// =============================================================================

/// Batch reader over both tiers; shares one secondary connection across
/// loads.
pub struct CachedReader {
    shared: Arc<Shared>,
    secondary: SecondaryReader,
}

impl EntityReader for CachedReader {
    fn load(&mut self, path: &EntityPath) -> Result<Option<Entity>> {
        let secondary = &mut self.secondary;
        self.shared.load(path, |path| secondary.load(path))
    }
}

// =============================================================================
// Flush Worker
// =============================================================================

async fn run_flush_worker(
    shared: Arc<Shared>,
    mut signals: mpsc::Receiver<FlushSignal>,
    errors: mpsc::Sender<Error>,
) {
    let interval = shared.config.flush_interval;

    loop {
        match timeout(interval, signals.recv()).await {
            Ok(Some(FlushSignal::WriteThreshold)) | Err(_) => {
                if shared.loaded_recently() {
                    shared
                        .counters
                        .skipped_flushes
                        .fetch_add(1, Ordering::Relaxed);
                    debug!("flush skipped, recent load");
                    continue;
                }
                flush_cycle(&shared, &errors);
            }
            Ok(Some(FlushSignal::Shutdown)) | Ok(None) => {
                flush_cycle(&shared, &errors);
                break;
            }
        }
    }

    debug!("flush worker stopped");
}

fn flush_cycle(shared: &Shared, errors: &mpsc::Sender<Error>) {
    if let Err(error) = shared.flush() {
        warn!(error = %error, "background flush failed");
        // Already logged; an uncollected channel just drops it.
        let _ = errors.try_send(error);
    }
}

// =============================================================================
// Tests
// =============================================================================
