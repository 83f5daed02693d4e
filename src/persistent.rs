//! # Persistent Store
//!
//! The authoritative copy of a file's attributes lives inside the file
//! itself. How it is encoded there is not this crate's business: the cache
//! only talks to it through [`PersistentStore`]. Calls are synchronous and
//! may be slow; the orchestrator makes sure foreground reads rarely reach it.
//!
//! [`MemoryStore`] keeps everything in a map. It backs the tests and is a
//! reference for what implementations must do.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};

use parking_lot::Mutex;

use crate::entity::{Entity, EntityPath};
use crate::error::Result;

/// The slow, authoritative attribute store.
///
/// Transient failures (file locked, permission denied) should be reported as
/// [`Error::Io`](crate::Error::Io) so callers can retry later.
pub trait PersistentStore: Send + Sync {
    /// Reads the attributes of `path`, or `None` if the file has none.
    fn load(&self, path: &EntityPath) -> Result<Option<Entity>>;

    /// Writes `entity`, replacing whatever was stored for its path.
    fn store(&self, entity: &Entity) -> Result<()>;

    /// Removes the attributes stored for `entity`'s path.
    fn delete(&self, entity: &Entity) -> Result<()>;

    /// Moves `entity` (still labelled with its old path) to `new_path`.
    fn move_entity(&self, entity: &Entity, new_path: &EntityPath) -> Result<()>;
}

/// Call counts of a [`MemoryStore`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MemoryStoreCalls {
    pub loads: usize,
    pub stores: usize,
    pub deletes: usize,
    pub moves: usize,
}

/// An in-memory [`PersistentStore`].
///
/// Entities are deep-copied on the way in and out, so later edits by the
/// caller never leak into the stored state.
#[derive(Debug, Default)]
pub struct MemoryStore {
    entities: Mutex<HashMap<EntityPath, Entity>>,
    loads: AtomicUsize,
    stores: AtomicUsize,
    deletes: AtomicUsize,
    moves: AtomicUsize,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seeds the store without counting a `store` call.
    pub fn insert(&self, entity: Entity) {
        self.entities.lock().insert(entity.path(), entity);
    }

    /// A copy of what is stored for `path`, without counting a `load` call.
    pub fn get(&self, path: &EntityPath) -> Option<Entity> {
        self.entities.lock().get(path).cloned()
    }

    pub fn len(&self) -> usize {
        self.entities.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entities.lock().is_empty()
    }

    pub fn calls(&self) -> MemoryStoreCalls {
        MemoryStoreCalls {
            loads: self.loads.load(Ordering::Relaxed),
            stores: self.stores.load(Ordering::Relaxed),
            deletes: self.deletes.load(Ordering::Relaxed),
            moves: self.moves.load(Ordering::Relaxed),
        }
    }
}

impl PersistentStore for MemoryStore {
    fn load(&self, path: &EntityPath) -> Result<Option<Entity>> {
        self.loads.fetch_add(1, Ordering::Relaxed);
        Ok(self.get(path))
    }

    fn store(&self, entity: &Entity) -> Result<()> {
        self.stores.fetch_add(1, Ordering::Relaxed);
        self.entities.lock().insert(entity.path(), entity.clone());
        Ok(())
    }

    fn delete(&self, entity: &Entity) -> Result<()> {
        self.deletes.fetch_add(1, Ordering::Relaxed);
        self.entities.lock().remove(&entity.path());
        Ok(())
    }

    fn move_entity(&self, entity: &Entity, new_path: &EntityPath) -> Result<()> {
        self.moves.fetch_add(1, Ordering::Relaxed);
        let mut entities = self.entities.lock();
        if let Some(stored) = entities.remove(&entity.path()) {
            stored.change_path(new_path.clone());
            entities.insert(new_path.clone(), stored);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::attribute::Attribute;
    use crate::value::Value;

    #[test]
    fn test_stored_copy_is_independent() {
        let store = MemoryStore::new();
        let entity = Entity::file("a.jpg");
        entity
            .set_attribute(Attribute::custom("rating", Value::int(1)).unwrap())
            .unwrap();
        store.store(&entity).unwrap();

        entity
            .set_attribute(Attribute::custom("rating", Value::int(5)).unwrap())
            .unwrap();

        let loaded = store.load(&EntityPath::new("A.JPG")).unwrap().unwrap();
        assert_eq!(loaded.get_attribute("rating").unwrap().value(), &Value::int(1));
        assert_eq!(
            store.calls(),
            MemoryStoreCalls {
                loads: 1,
                stores: 1,
                ..Default::default()
            }
        );
    }

    #[test]
    fn test_move_relabels_entity() {
        let store = MemoryStore::new();
        store.insert(Entity::file("old.jpg"));

        let entity = Entity::file("old.jpg");
        store.move_entity(&entity, &EntityPath::new("new.jpg")).unwrap();

        assert!(store.get(&EntityPath::new("old.jpg")).is_none());
        let moved = store.get(&EntityPath::new("new.jpg")).unwrap();
        assert_eq!(moved.path(), EntityPath::new("new.jpg"));
    }

    #[test]
    fn test_delete_missing_is_ok() {
        let store = MemoryStore::new();
        store.delete(&Entity::file("nothing.jpg")).unwrap();
        assert_eq!(store.calls().deletes, 1);
        assert!(store.is_empty());
    }
}
