//! # Error Handling for attrcache
//!
//! This module defines the error types used throughout the crate. A single
//! error enum ([`Error`]) represents every failure mode, so callers of the
//! entity manager, the orchestrator and the secondary store all match on the
//! same type.
//!
//! ## Rust Pattern: thiserror
//!
//! We use the `thiserror` crate to derive `std::error::Error` implementations:
//! - `Display` comes from the `#[error(...)]` attributes
//! - `From` conversions come from `#[from]`
//! - Error sources are chained via `#[source]`
//!
//! ## Error Categories
//!
//! | Category | Examples | Typical Response |
//! |----------|----------|------------------|
//! | Not found | Path absent in every tier | Not an error: `Ok(None)` |
//! | Transient I/O | File locked, permission denied | Return the edit to the modified list, retry later |
//! | Partial flush | One queued request violated a constraint | Reported once per flush, others committed |
//! | Internal | SQLite error, schema mismatch | Log and investigate |
//! | Caller | Invalid argument, bad configuration | Fix the call site |

use thiserror::Error;

// =============================================================================
// Error Type
// =============================================================================

/// All errors that can occur in attrcache operations.
#[derive(Error, Debug)]
pub enum Error {
    // =========================================================================
    // Storage Errors
    // =========================================================================

    /// SQLite operation failed.
    ///
    /// Wraps any error from the `rusqlite` crate: the cache file is locked by
    /// another process, the disk is full, the file is corrupted, or a
    /// constraint was violated.
    ///
    /// # Rust Pattern: #[from]
    ///
    /// The `#[from]` attribute generates `impl From<rusqlite::Error> for Error`,
    /// so `?` converts rusqlite errors automatically.
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    /// Schema version mismatch or corruption detected in the cache database.
    #[error("schema error: {0}")]
    Schema(String),

    /// The persistent store could not read or write a file.
    ///
    /// # When This Happens
    ///
    /// The file is locked by another program, permission was denied, or the
    /// disk failed. These failures are transient from the user's point of
    /// view: the entity manager keeps the edit so it can be saved again.
    #[error("i/o error on '{path}': {source}")]
    Io {
        /// Path of the file that could not be accessed
        path: String,
        /// The underlying I/O error
        #[source]
        source: std::io::Error,
    },

    // =========================================================================
    // Batch Errors
    // =========================================================================

    /// Some requests of a flush failed; the rest were committed.
    ///
    /// # Systems Concept: Partial Failure
    ///
    /// Each queued request runs in its own SAVEPOINT. A failing request is
    /// rolled back alone and collected here; the surrounding transaction still
    /// commits every other request. Failed requests are not re-queued.
    #[error("{} of {total} queued requests failed: {}", .failures.len(), describe_failures(.failures))]
    PartialFlush {
        /// Number of requests drained for this flush
        total: usize,
        /// The requests that were rolled back
        failures: Vec<RequestFailure>,
    },

    // =========================================================================
    // Caller Errors
    // =========================================================================

    /// An argument violated a documented precondition.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// A configuration value is missing or malformed.
    #[error("configuration error: {0}")]
    Config(String),

    /// The background flush worker is no longer running.
    #[error("cache has shut down")]
    Shutdown,
}

/// One request that was rolled back during a flush.
#[derive(Debug)]
pub struct RequestFailure {
    /// Display form of the request's path
    pub path: String,
    /// Request kind (`store`, `store_thumbnail`, `touch`, `delete`)
    pub operation: &'static str,
    /// Why it failed
    pub error: Box<Error>,
}

impl std::fmt::Display for RequestFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} '{}': {}", self.operation, self.path, self.error)
    }
}

fn describe_failures(failures: &[RequestFailure]) -> String {
    failures
        .iter()
        .map(|failure| failure.to_string())
        .collect::<Vec<_>>()
        .join("; ")
}

impl Error {
    /// Creates an [`Error::Io`] for a path.
    pub fn io(path: impl Into<String>, source: std::io::Error) -> Self {
        Error::Io {
            path: path.into(),
            source,
        }
    }

    /// Returns true if retrying the same operation later may succeed.
    ///
    /// The save workflow uses this to decide whether to hand an edit back to
    /// the modified list instead of surfacing it as a hard failure.
    pub fn is_transient(&self) -> bool {
        match self {
            Error::Io { .. } => true,
            Error::Sqlite(rusqlite::Error::SqliteFailure(e, _)) => matches!(
                e.code,
                rusqlite::ErrorCode::DatabaseBusy | rusqlite::ErrorCode::DatabaseLocked
            ),
            _ => false,
        }
    }
}

// =============================================================================
// Result Type Alias
// =============================================================================

/// A `Result` type alias using [`Error`] as the error type.
pub type Result<T> = std::result::Result<T, Error>;

// =============================================================================
// Tests
// =============================================================================
