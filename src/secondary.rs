//! # Secondary Store
//!
//! The fast cache tier: a SQLite database in front of the slow persistent
//! store. Callers never wait for SQLite writes. Writes land in a
//! [`RequestQueue`] and [`SecondaryStore::apply_changes`] later commits the
//! whole queue as one transaction.
//!
//! ## Flush Anatomy
//!
//! ```text
//! drain queue ──► BEGIN IMMEDIATE
//!                   SAVEPOINT req_0 ── store a.jpg ── RELEASE
//!                   SAVEPOINT req_1 ── store b.jpg ── ROLLBACK TO, RELEASE   (collected)
//!                   SAVEPOINT req_2 ── touch c.jpg ── RELEASE
//!                 COMMIT
//!                 evict (only if no reader holds the gate)
//!                 Err(PartialFlush { failures: [b.jpg] })
//! ```
//!
//! A request that fails is rolled back alone; the others commit. If the
//! transaction itself cannot begin or commit, the drained requests go back
//! into the queue.
//!
//! ## Reads
//!
//! A load consults the queue before SQLite: a pending `Store` is the freshest
//! data there is, and a pending `Delete` means the record is gone. Records
//! built from an older version of the file than the one on disk are ignored.
//! Every hit queues a `Touch`, and the refreshed access time drives eviction.
//!
//! ## Eviction vs. Readers
//!
//! Each [`SecondaryReader`] holds a ticket on the [`EvictionGate`] for as long
//! as it lives. Eviction waits a bounded time for the gate to empty and skips
//! the cycle if it does not.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};
use rusqlite::{params, Connection, OptionalExtension};
use tracing::{debug, info, warn};

use crate::attribute::{Attribute, AttributeSource};
use crate::codec::{current_time_ms, decode_value, duration_to_ms, encode_value, EncodedValue};
use crate::config::CacheConfig;
use crate::entity::{Entity, EntityPath, THUMBNAIL_ATTRIBUTE};
use crate::error::{Error, RequestFailure, Result};
use crate::file_times::FileTimes;
use crate::queue::{PendingRequest, RequestQueue};
use crate::schema::Database;
use crate::value::Value;

// =============================================================================
// Eviction Gate
// =============================================================================

/// Reader/writer gate between cache readers and eviction.
///
/// Readers enter without waiting (unless an eviction is running right now)
/// and hold a [`GateTicket`] for their lifetime. Eviction runs only when no
/// ticket is outstanding, waiting at most a bounded time for that.
#[derive(Debug, Default)]
pub struct EvictionGate {
    readers: Mutex<usize>,
    idle: Condvar,
}

impl EvictionGate {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a reader until the returned ticket is dropped.
    pub fn enter(self: &Arc<Self>) -> GateTicket {
        *self.readers.lock() += 1;
        GateTicket {
            gate: Arc::clone(self),
        }
    }

    pub fn active_readers(&self) -> usize {
        *self.readers.lock()
    }

    /// Runs `f` while no reader is active.
    ///
    /// Waits up to `timeout` for outstanding tickets to be dropped and returns
    /// `None` without running `f` if some remain. New readers block in
    /// [`enter`](Self::enter) until `f` returns.
    pub fn try_exclusive<T>(&self, timeout: Duration, f: impl FnOnce() -> T) -> Option<T> {
        let deadline = Instant::now() + timeout;
        let mut readers = self.readers.lock();
        while *readers > 0 {
            if self.idle.wait_until(&mut readers, deadline).timed_out() && *readers > 0 {
                return None;
            }
        }
        Some(f())
    }
}

/// A reader's registration with an [`EvictionGate`].
#[derive(Debug)]
pub struct GateTicket {
    gate: Arc<EvictionGate>,
}

impl Drop for GateTicket {
    fn drop(&mut self) {
        let mut readers = self.gate.readers.lock();
        *readers -= 1;
        if *readers == 0 {
            self.gate.idle.notify_all();
        }
    }
}

// =============================================================================
// Flush Statistics
// =============================================================================

/// Outcome of one [`SecondaryStore::apply_changes`] call.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FlushStats {
    /// Requests drained from the queue.
    pub drained: usize,
    /// Requests committed.
    pub applied: usize,
    /// Requests rolled back.
    pub failed: usize,
    /// Rows removed by eviction.
    pub evicted: usize,
    /// Eviction did not run because readers were active.
    pub eviction_skipped: bool,
}

// =============================================================================
// Secondary Store
// =============================================================================

/// SQLite-backed attribute cache with a coalescing write queue.
pub struct SecondaryStore {
    conn: Mutex<Connection>,
    /// `None` for in-memory stores; readers then share `conn`.
    db_path: Option<PathBuf>,
    queue: Mutex<RequestQueue>,
    gate: Arc<EvictionGate>,
    config: CacheConfig,
    file_times: Arc<dyn FileTimes>,
}

impl std::fmt::Debug for SecondaryStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SecondaryStore")
            .field("db_path", &self.db_path)
            .field("pending", &self.pending_len())
            .finish_non_exhaustive()
    }
}

impl SecondaryStore {
    /// Opens (or creates) a cache file.
    pub fn open(
        path: impl AsRef<Path>,
        config: CacheConfig,
        file_times: Arc<dyn FileTimes>,
    ) -> Result<Self> {
        config.validate()?;
        let path = path.as_ref();
        let db = Database::open(path)?;
        info!(path = %path.display(), "opened attribute cache");
        Ok(Self::from_database(db, Some(path.to_path_buf()), config, file_times))
    }

    /// Creates a cache that lives only as long as this store.
    pub fn open_in_memory(config: CacheConfig, file_times: Arc<dyn FileTimes>) -> Result<Self> {
        config.validate()?;
        let db = Database::open_in_memory()?;
        Ok(Self::from_database(db, None, config, file_times))
    }

    fn from_database(
        db: Database,
        db_path: Option<PathBuf>,
        config: CacheConfig,
        file_times: Arc<dyn FileTimes>,
    ) -> Self {
        Self {
            conn: Mutex::new(db.into_connection()),
            db_path,
            queue: Mutex::new(RequestQueue::new()),
            gate: Arc::new(EvictionGate::new()),
            config,
            file_times,
        }
    }

    pub fn config(&self) -> &CacheConfig {
        &self.config
    }

    pub fn gate(&self) -> &Arc<EvictionGate> {
        &self.gate
    }

    // =========================================================================
    // Reads
    // =========================================================================

    /// Loads the cached entity for `path`.
    ///
    /// Returns `None` on a miss, for a pending delete, and for a record built
    /// from an older version of the file.
    ///
    /// A hit queues a `Touch` so the record's access time reflects its use;
    /// a miss has no record to touch and queues nothing.
    pub fn load(&self, path: &EntityPath) -> Result<Option<Entity>> {
        self.load_via(path, None)
    }

    /// Opens a reader for loading many paths.
    ///
    /// File-backed stores give every reader its own read-only connection.
    pub fn create_reader(self: &Arc<Self>) -> Result<SecondaryReader> {
        let conn = match &self.db_path {
            Some(path) => Some(Database::open_read_only(path)?),
            None => None,
        };
        Ok(SecondaryReader {
            store: Arc::clone(self),
            conn,
            _ticket: self.gate.enter(),
        })
    }

    fn load_via(&self, path: &EntityPath, reader_conn: Option<&Connection>) -> Result<Option<Entity>> {
        let pending_thumbnail = match self.queue.lock().get(path) {
            Some(PendingRequest::Store { entity, .. }) => return Ok(Some(entity.clone())),
            Some(PendingRequest::Delete) => return Ok(None),
            Some(PendingRequest::StoreThumbnail { thumbnail }) => Some(thumbnail.clone()),
            Some(PendingRequest::Touch { .. }) | None => None,
        };

        let min_write_ms = self.file_times.last_write_ms(path);
        let loaded = match reader_conn {
            Some(conn) => query_entity(conn, path, min_write_ms)?,
            None => query_entity(&self.conn.lock(), path, min_write_ms)?,
        };
        let Some(entity) = loaded else {
            return Ok(None);
        };

        if let Some(thumbnail) = pending_thumbnail {
            entity.set_attribute(Attribute::metadata(
                THUMBNAIL_ATTRIBUTE,
                Value::image(thumbnail),
            )?)?;
        }

        let now = current_time_ms();
        entity.set_last_access_ms(now);
        self.queue
            .lock()
            .push(path.clone(), PendingRequest::Touch { access_ms: now });
        Ok(Some(entity))
    }

    // =========================================================================
    // Deferred Writes
    // =========================================================================

    /// Queues a snapshot of `entity`. Directories are not cached.
    pub fn store(&self, entity: &Entity) -> Result<()> {
        if entity.is_directory() {
            return Ok(());
        }
        let path = entity.path();
        let observed_write_ms = self
            .file_times
            .last_write_ms(&path)
            .unwrap_or_else(current_time_ms);
        self.queue.lock().push(
            path,
            PendingRequest::Store {
                entity: entity.clone(),
                observed_write_ms,
            },
        );
        Ok(())
    }

    /// Queues an update of the cached thumbnail only.
    ///
    /// Does nothing if `entity` has no thumbnail attribute.
    pub fn store_thumbnail(&self, entity: &Entity) -> Result<()> {
        if let Some(thumbnail) = entity.thumbnail() {
            self.queue
                .lock()
                .push(entity.path(), PendingRequest::StoreThumbnail { thumbnail });
        }
        Ok(())
    }

    /// Queues a refresh of the record's last access time.
    pub fn touch(&self, path: &EntityPath) -> Result<()> {
        self.queue.lock().push(
            path.clone(),
            PendingRequest::Touch {
                access_ms: current_time_ms(),
            },
        );
        Ok(())
    }

    pub fn delete(&self, entity: &Entity) -> Result<()> {
        self.queue.lock().push(entity.path(), PendingRequest::Delete);
        Ok(())
    }

    /// Renames the cached record of `entity` (still labelled with its old
    /// path) to `new_path`.
    ///
    /// Unlike the other writes this is applied right away; a pending request
    /// for the old path follows it to the new one.
    ///
    /// Waits for a running flush. The queue is only locked for the rekey, and
    /// the rekey happens before the connection is released, so a flush never
    /// sees the renamed record next to a request still keyed by the old path.
    pub fn move_entity(&self, entity: &Entity, new_path: &EntityPath) -> Result<()> {
        let old_path = entity.path();

        let conn = self.conn.lock();
        let tx = conn.unchecked_transaction()?;
        if old_path != *new_path {
            tx.execute("DELETE FROM files WHERE path = ?1", [new_path.key()])?;
        }
        tx.execute(
            "UPDATE files SET path = ?2, display_path = ?3 WHERE path = ?1",
            params![old_path.key(), new_path.key(), new_path.as_str()],
        )?;
        tx.commit()?;
        self.queue.lock().rekey(&old_path, new_path);
        drop(conn);

        debug!(from = %old_path, to = %new_path, "moved cached record");
        Ok(())
    }

    // =========================================================================
    // Flush
    // =========================================================================

    /// Commits every pending request, then evicts stale records.
    ///
    /// # Errors
    ///
    /// - `Error::PartialFlush` if some requests failed; all others were
    ///   committed and the failed ones are not retried
    /// - `Error::Sqlite` if the transaction could not begin or commit; the
    ///   drained requests are queued again
    pub fn apply_changes(&self) -> Result<FlushStats> {
        // Lock order is connection, then queue. Draining under the connection
        // keeps a move from slipping between the drain and the commit.
        let conn = self.conn.lock();
        let requests = self.queue.lock().drain();
        let mut stats = FlushStats {
            drained: requests.len(),
            ..Default::default()
        };
        let mut failures = Vec::new();

        if !requests.is_empty() {
            let now = current_time_ms();
            if let Err(e) = conn.execute_batch("BEGIN IMMEDIATE") {
                self.queue.lock().restore(requests);
                return Err(e.into());
            }

            for (n, (path, request)) in requests.iter().enumerate() {
                match apply_in_savepoint(&conn, n, path, request, now) {
                    Ok(()) => stats.applied += 1,
                    Err(error) => {
                        warn!(path = %path, operation = request.operation(), error = %error, "queued request failed");
                        failures.push(RequestFailure {
                            path: path.to_string(),
                            operation: request.operation(),
                            error: Box::new(error),
                        });
                    }
                }
            }

            if let Err(e) = conn.execute_batch("COMMIT") {
                let _ = conn.execute_batch("ROLLBACK");
                self.queue.lock().restore(requests);
                return Err(e.into());
            }
            stats.failed = failures.len();
        }

        let evicted = self
            .gate
            .try_exclusive(self.config.eviction_lock_timeout, || {
                evict(&conn, &self.config, current_time_ms())
            });
        match evicted {
            Some(Ok(count)) => stats.evicted = count,
            Some(Err(error)) => warn!(error = %error, "eviction failed"),
            None => {
                stats.eviction_skipped = true;
                debug!(readers = self.gate.active_readers(), "eviction skipped, readers active");
            }
        }
        drop(conn);

        debug!(
            drained = stats.drained,
            applied = stats.applied,
            failed = stats.failed,
            evicted = stats.evicted,
            "flushed attribute cache"
        );

        if failures.is_empty() {
            Ok(stats)
        } else {
            Err(Error::PartialFlush {
                total: stats.drained,
                failures,
            })
        }
    }

    // =========================================================================
    // Introspection
    // =========================================================================

    /// Number of paths with a pending request.
    pub fn pending_len(&self) -> usize {
        self.queue.lock().len()
    }

    /// Number of records committed to the cache database.
    pub fn cached_file_count(&self) -> Result<usize> {
        let count: i64 = self
            .conn
            .lock()
            .query_row("SELECT COUNT(*) FROM files", [], |row| row.get(0))?;
        Ok(count as usize)
    }
}

// =============================================================================
// Secondary Reader
// =============================================================================

/// A batch reader over a [`SecondaryStore`].
///
/// Holds an eviction gate ticket until dropped, so keep it only as long as
/// the scan runs.
pub struct SecondaryReader {
    store: Arc<SecondaryStore>,
    conn: Option<Connection>,
    _ticket: GateTicket,
}

impl SecondaryReader {
    /// Same as [`SecondaryStore::load`], on this reader's connection.
    pub fn load(&mut self, path: &EntityPath) -> Result<Option<Entity>> {
        self.store.load_via(path, self.conn.as_ref())
    }
}

impl std::fmt::Debug for SecondaryReader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SecondaryReader")
            .field("own_connection", &self.conn.is_some())
            .finish_non_exhaustive()
    }
}

// =============================================================================
// SQL Helpers
// =============================================================================

fn query_entity(
    conn: &Connection,
    path: &EntityPath,
    min_write_ms: Option<u64>,
) -> Result<Option<Entity>> {
    let row = conn
        .prepare_cached(
            "SELECT file_id, display_path, last_write_ms, last_access_ms, thumbnail
             FROM files
             WHERE path = ?1 AND (?2 IS NULL OR last_write_ms >= ?2)",
        )?
        .query_row(params![path.key(), min_write_ms.map(|ms| ms as i64)], |row| {
            Ok((
                row.get::<_, i64>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, i64>(2)?,
                row.get::<_, i64>(3)?,
                row.get::<_, Option<Vec<u8>>>(4)?,
            ))
        })
        .optional()?;

    let Some((file_id, display_path, last_write_ms, last_access_ms, thumbnail)) = row else {
        return Ok(None);
    };

    let entity = Entity::file(display_path);
    entity.set_last_write_ms(last_write_ms as u64);
    entity.set_last_access_ms(last_access_ms as u64);

    let mut stmt = conn.prepare_cached(
        "SELECT name, source, kind, int_value, real_value, text_value, blob_value
         FROM attributes WHERE file_id = ?1",
    )?;
    let rows = stmt.query_map([file_id], |row| {
        Ok((
            row.get::<_, String>(0)?,
            row.get::<_, i64>(1)?,
            EncodedValue {
                kind: row.get(2)?,
                int_value: row.get(3)?,
                real_value: row.get(4)?,
                text_value: row.get(5)?,
                blob_value: row.get(6)?,
            },
        ))
    })?;

    for row in rows {
        let (name, source, encoded) = row?;
        let source = AttributeSource::from_raw(source)
            .ok_or_else(|| Error::Schema(format!("unknown attribute source {source}")))?;
        entity.set_attribute(Attribute::new(name, decode_value(encoded)?, source)?)?;
    }

    if let Some(thumbnail) = thumbnail {
        entity.set_attribute(Attribute::metadata(
            THUMBNAIL_ATTRIBUTE,
            Value::image(thumbnail),
        )?)?;
    }

    Ok(Some(entity))
}

fn apply_in_savepoint(
    conn: &Connection,
    n: usize,
    path: &EntityPath,
    request: &PendingRequest,
    now_ms: u64,
) -> Result<()> {
    let savepoint = format!("req_{n}");
    conn.execute_batch(&format!("SAVEPOINT {savepoint}"))?;

    match apply_request(conn, path, request, now_ms) {
        Ok(()) => {
            conn.execute_batch(&format!("RELEASE {savepoint}"))?;
            Ok(())
        }
        Err(e) => {
            conn.execute_batch(&format!("ROLLBACK TO {savepoint}"))?;
            conn.execute_batch(&format!("RELEASE {savepoint}"))?;
            Err(e)
        }
    }
}

fn apply_request(
    conn: &Connection,
    path: &EntityPath,
    request: &PendingRequest,
    now_ms: u64,
) -> Result<()> {
    match request {
        PendingRequest::Store {
            entity,
            observed_write_ms,
        } => {
            // Attributes are replaced wholesale, never patched.
            conn.execute("DELETE FROM files WHERE path = ?1", [path.key()])?;
            conn.execute(
                "INSERT INTO files (path, display_path, last_write_ms, last_access_ms, thumbnail)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                params![
                    path.key(),
                    path.as_str(),
                    *observed_write_ms as i64,
                    now_ms as i64,
                    entity.thumbnail()
                ],
            )?;
            let file_id = conn.last_insert_rowid();

            let mut stmt = conn.prepare_cached(
                "INSERT INTO attributes
                 (file_id, name, source, kind, int_value, real_value, text_value, blob_value)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            )?;
            for attribute in entity.attributes() {
                if attribute.name() == THUMBNAIL_ATTRIBUTE {
                    continue;
                }
                let encoded = encode_value(attribute.value());
                stmt.execute(params![
                    file_id,
                    attribute.name(),
                    attribute.source().as_raw(),
                    encoded.kind,
                    encoded.int_value,
                    encoded.real_value,
                    encoded.text_value,
                    encoded.blob_value,
                ])?;
            }
        }
        PendingRequest::StoreThumbnail { thumbnail } => {
            conn.execute(
                "UPDATE files SET thumbnail = ?2 WHERE path = ?1",
                params![path.key(), thumbnail],
            )?;
        }
        PendingRequest::Touch { access_ms } => {
            conn.execute(
                "UPDATE files SET last_access_ms = MAX(last_access_ms, ?2) WHERE path = ?1",
                params![path.key(), *access_ms as i64],
            )?;
        }
        PendingRequest::Delete => {
            conn.execute("DELETE FROM files WHERE path = ?1", [path.key()])?;
        }
    }
    Ok(())
}

/// Deletes records past their lifespan, then the least recently accessed
/// records beyond the file count cap.
fn evict(conn: &Connection, config: &CacheConfig, now_ms: u64) -> Result<usize> {
    let lifespan_ms = duration_to_ms(config.cache_lifespan);
    let cutoff = now_ms.saturating_sub(lifespan_ms) as i64;
    let mut removed = conn.execute("DELETE FROM files WHERE last_access_ms < ?1", [cutoff])?;

    let count: i64 = conn.query_row("SELECT COUNT(*) FROM files", [], |row| row.get(0))?;
    let surplus = count - config.cache_max_file_count as i64;
    if surplus > 0 {
        removed += conn.execute(
            "DELETE FROM files WHERE file_id IN (
                 SELECT file_id FROM files ORDER BY last_access_ms ASC, file_id ASC LIMIT ?1
             )",
            [surplus],
        )?;
    }

    if removed > 0 {
        info!(removed, "evicted cached records");
    }
    Ok(removed)
}

// =============================================================================
// Tests
// =============================================================================
