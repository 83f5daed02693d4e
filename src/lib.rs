//! # attrcache - Attribute Storage and Caching Core
//!
//! attrcache keeps per-file metadata ("attributes") of a large photo
//! collection fast to read and safe to edit. The authoritative copy of each
//! file's attributes lives inside the file; reading it on every access is too
//! slow, so this crate layers:
//!
//! - **Unsaved edits**: tracked by the [`EntityManager`], visible to every
//!   reader before they are saved
//! - **Secondary store**: a SQLite cache whose writes are queued, coalesced
//!   per path and committed in batches by a background thread
//! - **Persistent store**: the slow authoritative store, behind the
//!   [`PersistentStore`] trait
//!
//! ## Architecture Overview
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │              Query engine / attribute editor                    │
//! └─────────────────────────────┬───────────────────────────────────┘
//!                               │ get_entity, set_entity, get_modified
//!                               ▼
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                      Entity Manager                             │
//! │           (proxies for edited entities, events)                 │
//! └─────────────────────────────┬───────────────────────────────────┘
//!                               │ AttributeStore
//!                               ▼
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                       Cached Store                              │
//! │  ┌──────────────────────────┐     ┌──────────────────────────┐  │
//! │  │ Secondary Store (SQLite) │     │  Persistent Store        │  │
//! │  │  request queue, flush,   │     │  (inside the files)      │  │
//! │  │  eviction gate           │     │                          │  │
//! │  └────────────▲─────────────┘     └──────────────────────────┘  │
//! │               │ apply_changes                                   │
//! │        attrcache-flush thread                                   │
//! └─────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Core Invariants
//!
//! 1. **One proxy per path**: the manager tracks at most one edit per path
//! 2. **One pending request per path**: rapid writes coalesce; a touch never
//!    downgrades a pending store or delete
//! 3. **Isolated requests**: one failing request in a flush never rolls back
//!    the others
//! 4. **Eviction never races a reader**: it waits a bounded time, then skips
//! 5. **Null means absent**: setting a null value removes the attribute
//!
//! ## Example
//!
//! ```rust
//! use std::sync::Arc;
//! use attrcache::{
//!     Attribute, CacheConfig, CachedStore, EntityManager, FixedFileTimes, MemoryStore,
//!     SecondaryStore, Value,
//! };
//!
//! let persistent = Arc::new(MemoryStore::new());
//! let secondary = Arc::new(SecondaryStore::open_in_memory(
//!     CacheConfig::default(),
//!     Arc::new(FixedFileTimes::new()),
//! )?);
//! let store = Arc::new(CachedStore::open(persistent.clone(), secondary)?);
//! let manager = EntityManager::new(store);
//!
//! let photo = manager.get_entity("photos/a.jpg")?;
//! photo.set_attribute(Attribute::custom("rating", Value::int(5))?)?;
//! manager.set_entity(photo, true);
//!
//! for modified in manager.get_modified() {
//!     modified.save()?;
//! }
//! assert!(persistent.get(&"photos/a.jpg".into()).is_some());
//! # Ok::<(), attrcache::Error>(())
//! ```
//!
//! ## Module Organization
//!
//! - [`error`]: the crate-wide error type
//! - [`config`]: eviction and flush tuning
//! - [`value`], [`attribute`], [`entity`]: the data model
//! - [`queue`]: coalescing queue of pending cache writes
//! - [`schema`], [`codec`]: SQLite layout and value encoding
//! - [`secondary`]: the SQLite cache tier
//! - [`persistent`], [`file_times`]: collaborators the cache consults
//! - [`cached`]: tier composition and the flush worker
//! - [`manager`]: edit tracking

/// Error types for attrcache operations.
pub mod error;

/// Cache and flush configuration.
pub mod config;

/// Typed attribute values and their ordering.
pub mod value;

pub mod attribute;

/// Files and directories with their attributes.
pub mod entity;

/// Pending write requests of the secondary store.
///
/// Holds at most one request per path; see the module docs for how requests
/// coalesce.
pub mod queue;

/// SQLite schema definitions and database initialization.
pub mod schema;

/// Value encoding for attribute rows.
pub mod codec;

/// The SQLite-backed cache tier.
///
/// Queues writes, commits them in batches with one SAVEPOINT per request,
/// and evicts records past their lifespan when no reader is active.
pub mod secondary;

/// The authoritative store contract.
pub mod persistent;

pub mod file_times;

/// Composition of the cache tiers and the background flush worker.
pub mod cached;

/// Tracking of edited entities.
pub mod manager;

// =============================================================================
// Re-exports
// =============================================================================

pub use attribute::{Attribute, AttributeSource};
pub use cached::{CacheStats, CachedReader, CachedStore};
pub use config::CacheConfig;
pub use entity::{DirectoryEntity, Entity, EntityPath, FileEntity, SharedEntity, THUMBNAIL_ATTRIBUTE};
pub use error::{Error, RequestFailure, Result};
pub use file_times::{DiskFileTimes, FileTimes, FixedFileTimes};
pub use manager::{
    AttributeStore, EntityEvent, EntityManager, EntityReader, ManagedReader, ModifiedEntity,
    ProxyState,
};
pub use persistent::{MemoryStore, MemoryStoreCalls, PersistentStore};
pub use queue::{PendingRequest, RequestQueue};
pub use schema::Database;
pub use secondary::{EvictionGate, FlushStats, GateTicket, SecondaryReader, SecondaryStore};
pub use value::{Culture, Value, ValueComparer, ValueKind};
