//! # SQLite Schema for the Secondary Store
//!
//! The secondary store keeps one row per cached file and one row per
//! attribute, so a load is two indexed lookups and an eviction is a single
//! range delete on `last_access_ms`.
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │                                                              │
//! │  files                         attributes                    │
//! │  ┌──────────────────┐          ┌────────────────────┐        │
//! │  │ file_id (PK)     │◄─────────│ file_id (FK)       │        │
//! │  │ path (UNIQUE)    │          │ name               │        │
//! │  │ display_path     │          │ source, kind       │        │
//! │  │ last_write_ms    │          │ int/real/text/blob │        │
//! │  │ last_access_ms   │          └────────────────────┘        │
//! │  │ thumbnail BLOB   │                                        │
//! │  └──────────────────┘          attrcache_metadata            │
//! │                                ┌────────────────────┐        │
//! │                                │ key (PK), value    │        │
//! │                                └────────────────────┘        │
//! │                                                              │
//! └──────────────────────────────────────────────────────────────┘
//! ```
//!
//! `path` holds the case-folded [`EntityPath::key`](crate::EntityPath::key);
//! `display_path` the caller's casing. The thumbnail lives in its own column
//! rather than in `attributes` so it can be patched without rewriting the
//! rest of the record.

use std::path::Path;

use rusqlite::{Connection, OpenFlags};

use crate::error::{Error, Result};

// =============================================================================
// Schema Version
// =============================================================================

/// Bumped on incompatible layout changes. There are no migrations: a cache
/// with another version is rejected and can simply be deleted.
const SCHEMA_VERSION: i32 = 1;

// =============================================================================
// DDL Statements
// =============================================================================

/// One row per cached file.
///
/// - `path`: case-folded lookup key
/// - `last_write_ms`: file modification time the record was built from
/// - `last_access_ms`: last cache hit, drives eviction
const CREATE_FILES: &str = r#"
CREATE TABLE IF NOT EXISTS files (
    file_id        INTEGER PRIMARY KEY AUTOINCREMENT,
    path           TEXT NOT NULL UNIQUE,
    display_path   TEXT NOT NULL,
    last_write_ms  INTEGER NOT NULL,
    last_access_ms INTEGER NOT NULL,
    thumbnail      BLOB
)
"#;

/// Eviction scans by access time.
const CREATE_FILES_ACCESS_INDEX: &str = r#"
CREATE INDEX IF NOT EXISTS files_last_access
ON files(last_access_ms)
"#;

/// One row per attribute. Exactly one of the value columns is set, chosen by
/// `kind` (see [`crate::codec`]).
const CREATE_ATTRIBUTES: &str = r#"
CREATE TABLE IF NOT EXISTS attributes (
    file_id    INTEGER NOT NULL REFERENCES files(file_id) ON DELETE CASCADE,
    name       TEXT NOT NULL,
    source     INTEGER NOT NULL,
    kind       INTEGER NOT NULL,
    int_value  INTEGER,
    real_value REAL,
    text_value TEXT,
    blob_value BLOB,
    PRIMARY KEY (file_id, name)
)
"#;

const CREATE_METADATA: &str = r#"
CREATE TABLE IF NOT EXISTS attrcache_metadata (
    key   TEXT PRIMARY KEY,
    value TEXT NOT NULL
)
"#;

// =============================================================================
// Database Wrapper
// =============================================================================

/// A SQLite connection with the attribute cache schema applied.
#[derive(Debug)]
pub struct Database {
    conn: Connection,
}

impl Database {
    /// Opens a cache file, creating and initializing it if necessary.
    ///
    /// # Errors
    ///
    /// - `Error::Sqlite` if the file can't be opened or created
    /// - `Error::Schema` if the file was written by an incompatible version
    ///
    /// # Example
    ///
    /// ```rust,no_run
    /// use attrcache::Database;
    ///
    /// let db = Database::open("attributes.db")?;
    /// # Ok::<(), attrcache::Error>(())
    /// ```
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let conn = Connection::open(path)?;
        let mut db = Self { conn };
        db.initialize()?;
        Ok(db)
    }

    /// Creates an in-memory cache, lost when the connection closes.
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        let mut db = Self { conn };
        db.initialize()?;
        Ok(db)
    }

    /// Opens an extra read-only connection to an existing cache file.
    ///
    /// Readers use these so they never contend with the flush on the write
    /// connection. WAL mode lets them see the last committed state.
    pub fn open_read_only(path: impl AsRef<Path>) -> Result<Connection> {
        let conn = Connection::open_with_flags(
            path,
            OpenFlags::SQLITE_OPEN_READ_ONLY | OpenFlags::SQLITE_OPEN_NO_MUTEX,
        )?;
        Ok(conn)
    }

    fn initialize(&mut self) -> Result<()> {
        // WAL so that reader connections see a stable snapshot during a flush.
        // journal_mode returns a row, so it goes through query_row.
        let _mode: String = self
            .conn
            .query_row("PRAGMA journal_mode = WAL", [], |row| row.get(0))?;
        self.conn.execute_batch("PRAGMA synchronous = NORMAL")?;
        self.conn.execute_batch("PRAGMA foreign_keys = ON")?;

        self.conn.execute_batch(CREATE_METADATA)?;
        self.conn.execute_batch(CREATE_FILES)?;
        self.conn.execute_batch(CREATE_FILES_ACCESS_INDEX)?;
        self.conn.execute_batch(CREATE_ATTRIBUTES)?;

        self.verify_or_set_version()
    }

    fn verify_or_set_version(&mut self) -> Result<()> {
        let existing: Option<String> = match self.conn.query_row(
            "SELECT value FROM attrcache_metadata WHERE key = 'schema_version'",
            [],
            |row| row.get(0),
        ) {
            Ok(value) => Some(value),
            Err(rusqlite::Error::QueryReturnedNoRows) => None,
            Err(e) => return Err(e.into()),
        };

        match existing {
            None => {
                self.conn.execute(
                    "INSERT INTO attrcache_metadata (key, value) VALUES ('schema_version', ?)",
                    [SCHEMA_VERSION.to_string()],
                )?;
            }
            Some(v) if v.parse::<i32>().ok() == Some(SCHEMA_VERSION) => {}
            Some(v) => {
                return Err(Error::Schema(format!(
                    "schema version mismatch: cache has version {v}, this build requires {SCHEMA_VERSION}"
                )));
            }
        }

        Ok(())
    }

    pub fn connection(&self) -> &Connection {
        &self.conn
    }

    /// Consumes the wrapper, handing the connection to its owner.
    pub fn into_connection(self) -> Connection {
        self.conn
    }
}

// =============================================================================
// Tests
// =============================================================================
