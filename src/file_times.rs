//! # File Modification Times
//!
//! The secondary store only serves a cached record if it was built from the
//! file's current contents. [`FileTimes`] is where it asks for the file's
//! last write time; `None` means "unknown" and disables the staleness check
//! for that lookup.

use std::collections::HashMap;
use std::fs;
use std::time::UNIX_EPOCH;

use parking_lot::RwLock;

use crate::codec::duration_to_ms;
use crate::entity::EntityPath;

/// Source of file modification times, in ms since the Unix epoch.
pub trait FileTimes: Send + Sync {
    fn last_write_ms(&self, path: &EntityPath) -> Option<u64>;
}

/// Reads modification times from the file system.
#[derive(Debug, Default, Clone, Copy)]
pub struct DiskFileTimes;

impl FileTimes for DiskFileTimes {
    fn last_write_ms(&self, path: &EntityPath) -> Option<u64> {
        let modified = fs::metadata(path.as_str()).ok()?.modified().ok()?;
        let since_epoch = modified.duration_since(UNIX_EPOCH).ok()?;
        Some(duration_to_ms(since_epoch))
    }
}

/// Modification times set by hand. Paths never set report `None`.
#[derive(Debug, Default)]
pub struct FixedFileTimes {
    times: RwLock<HashMap<EntityPath, u64>>,
}

impl FixedFileTimes {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&self, path: impl Into<EntityPath>, last_write_ms: u64) {
        self.times.write().insert(path.into(), last_write_ms);
    }

    pub fn clear(&self, path: &EntityPath) {
        self.times.write().remove(path);
    }
}

impl FileTimes for FixedFileTimes {
    fn last_write_ms(&self, path: &EntityPath) -> Option<u64> {
        self.times.read().get(path).copied()
    }
}
