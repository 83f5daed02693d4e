//! # Entity Manager
//!
//! The one place that knows which entities have been edited but not saved.
//! Every reader in the process goes through it, so a query running while the
//! user edits a photo sees the edit, not the stale copy on disk.
//!
//! ## Proxy Lifecycle
//!
//! Each tracked path has one proxy record holding the state captured when
//! tracking began (for revert), the live shared entity, and a state:
//!
//! ```text
//! (absent) ──set_entity──► Modified ──get_modified──► Saving ──save──► (absent)
//!    ▲                        ▲                          │
//!    │                        └───return_to_modified─────┘
//!    └──────────revert (from Modified or Saving)─────────┘
//! ```
//!
//! `get_modified` is how a save batch claims work: it flips every `Modified`
//! proxy to `Saving` and hands out [`ModifiedEntity`] handles. Proxies that
//! are already `Saving` are left out, so two save batches never write the
//! same edit.
//!
//! ## Generations
//!
//! Every proxy record carries a generation id and every handle remembers the
//! id it was issued for. When `set_entity` replaces a `Saving` proxy with a
//! fresh one, the old handle's `save` still persists its own snapshot but
//! no longer touches the newer record.
//!
//! ## Locking
//!
//! The proxy table is behind one mutex that is only held for map operations,
//! never across a store call.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::broadcast;
use tracing::{debug, warn};

use crate::entity::{Entity, EntityPath, SharedEntity};
use crate::error::Result;

/// Capacity of the event channel; slow subscribers lag instead of blocking.
const EVENT_CHANNEL_CAPACITY: usize = 256;

// =============================================================================
// Store Traits
// =============================================================================

/// The storage the manager reads from and saves to.
///
/// [`CachedStore`](crate::CachedStore) is the production implementation.
pub trait AttributeStore: Send + Sync {
    fn load(&self, path: &EntityPath) -> Result<Option<Entity>>;

    fn store(&self, entity: &Entity) -> Result<()>;

    /// Stores only the entity's thumbnail; may be cache-only.
    fn store_thumbnail(&self, entity: &Entity) -> Result<()>;

    fn delete(&self, entity: &Entity) -> Result<()>;

    /// Moves `entity`, still labelled with its old path, to `new_path`.
    fn move_entity(&self, entity: &Entity, new_path: &EntityPath) -> Result<()>;

    fn create_reader(&self) -> Result<Box<dyn EntityReader>>;
}

/// Loads many paths, possibly sharing a connection between calls.
pub trait EntityReader: Send {
    fn load(&mut self, path: &EntityPath) -> Result<Option<Entity>>;
}

// =============================================================================
// Events
// =============================================================================

/// Notifications for views that display entities.
#[derive(Debug, Clone)]
pub enum EntityEvent {
    /// An entity started being tracked, was replaced, or was reverted.
    Changed(SharedEntity),
    Deleted(SharedEntity),
    Moved {
        old_path: EntityPath,
        entity: SharedEntity,
    },
}

// =============================================================================
// Proxy Table
// =============================================================================

/// Lifecycle state of a tracked entity.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProxyState {
    Modified,
    Saving,
}

#[derive(Debug)]
struct ProxyRecord {
    id: u64,
    /// Deep copy taken when tracking began.
    initial: Entity,
    current: SharedEntity,
    state: ProxyState,
}

#[derive(Debug, Default)]
struct ProxyTable {
    records: HashMap<EntityPath, ProxyRecord>,
    next_id: u64,
}

impl ProxyTable {
    fn track(&mut self, path: EntityPath, entity: &SharedEntity) {
        let id = self.next_id;
        self.next_id += 1;
        self.records.insert(
            path,
            ProxyRecord {
                id,
                initial: Entity::clone(entity),
                current: Arc::clone(entity),
                state: ProxyState::Modified,
            },
        );
    }

    fn current(&self, path: &EntityPath) -> Option<SharedEntity> {
        self.records.get(path).map(|record| Arc::clone(&record.current))
    }

    /// The record at `path`, only if it is still generation `id`.
    fn get_mut(&mut self, path: &EntityPath, id: u64) -> Option<&mut ProxyRecord> {
        self.records.get_mut(path).filter(|record| record.id == id)
    }
}

struct Shared {
    store: Arc<dyn AttributeStore>,
    proxies: Mutex<ProxyTable>,
    events: broadcast::Sender<EntityEvent>,
}

impl Shared {
    fn publish(&self, event: EntityEvent) {
        // No subscribers is fine.
        let _ = self.events.send(event);
    }

    fn tracked(&self, path: &EntityPath) -> Option<SharedEntity> {
        self.proxies.lock().current(path)
    }

    /// Merges a store lookup with the tracked edits.
    fn resolve(&self, path: &EntityPath, loaded: Option<Entity>) -> Option<SharedEntity> {
        // A proxy created while the store was being read wins.
        if let Some(entity) = self.tracked(path) {
            return Some(entity);
        }
        loaded.map(Entity::into_shared)
    }
}

// =============================================================================
// Entity Manager
// =============================================================================

/// Tracks unsaved edits and serves reads that include them.
///
/// Cloning is cheap and every clone sees the same proxies.
#[derive(Clone)]
pub struct EntityManager {
    shared: Arc<Shared>,
}

impl std::fmt::Debug for EntityManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EntityManager")
            .field("tracked", &self.modified_count())
            .finish_non_exhaustive()
    }
}

impl EntityManager {
    pub fn new(store: Arc<dyn AttributeStore>) -> Self {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            shared: Arc::new(Shared {
                store,
                proxies: Mutex::new(ProxyTable::default()),
                events,
            }),
        }
    }

    // =========================================================================
    // Reads
    // =========================================================================

    /// Returns the entity at `path`, including unsaved edits.
    ///
    /// A path unknown to every tier yields a new file entity without
    /// attributes, ready to be edited.
    pub fn get_entity(&self, path: impl Into<EntityPath>) -> Result<SharedEntity> {
        let path = path.into();
        Ok(self
            .find_entity(&path)?
            .unwrap_or_else(|| Entity::file(path).into_shared()))
    }

    /// Like [`get_entity`](Self::get_entity) but `None` for unknown paths.
    pub fn find_entity(&self, path: impl Into<EntityPath>) -> Result<Option<SharedEntity>> {
        let path = path.into();
        if let Some(entity) = self.shared.tracked(&path) {
            return Ok(Some(entity));
        }
        let loaded = self.shared.store.load(&path)?;
        Ok(self.shared.resolve(&path, loaded))
    }

    /// Opens a reader for bulk loads with the same merge rules as
    /// [`get_entity`](Self::get_entity).
    pub fn create_reader(&self) -> Result<ManagedReader> {
        Ok(ManagedReader {
            shared: Arc::clone(&self.shared),
            inner: self.shared.store.create_reader()?,
        })
    }

    // =========================================================================
    // Tracking
    // =========================================================================

    /// Registers `entity` as edited.
    ///
    /// If the path is already tracked and `Modified`, the tracked entity is
    /// only replaced when `replace` is true. A `Saving` proxy is left to its
    /// save and a new one starts tracking `entity`.
    pub fn set_entity(&self, entity: SharedEntity, replace: bool) {
        let path = entity.path();
        let changed = {
            let mut proxies = self.shared.proxies.lock();
            let existing = proxies.records.get(&path).map(|record| record.state);
            match existing {
                Some(ProxyState::Modified) => {
                    if let Some(record) = proxies.records.get_mut(&path).filter(|_| replace) {
                        record.current = Arc::clone(&entity);
                    }
                    replace
                }
                Some(ProxyState::Saving) | None => {
                    proxies.track(path.clone(), &entity);
                    true
                }
            }
        };

        if changed {
            debug!(path = %path, "entity modified");
            self.shared.publish(EntityEvent::Changed(entity));
        }
    }

    /// Moves `entity` to `new_path` in the store, then relabels it and any
    /// proxy tracking it.
    pub fn move_entity(&self, entity: &SharedEntity, new_path: impl Into<EntityPath>) -> Result<()> {
        let old_path = entity.path();
        let new_path = new_path.into();
        self.shared.store.move_entity(entity, &new_path)?;

        {
            let mut proxies = self.shared.proxies.lock();
            if let Some(record) = proxies.records.remove(&old_path) {
                record.initial.change_path(new_path.clone());
                record.current.change_path(new_path.clone());
                proxies.records.insert(new_path.clone(), record);
            }
        }
        entity.change_path(new_path);

        self.shared.publish(EntityEvent::Moved {
            old_path,
            entity: Arc::clone(entity),
        });
        Ok(())
    }

    /// Deletes `entity` from the store and stops tracking it.
    pub fn remove_entity(&self, entity: &SharedEntity) -> Result<()> {
        self.shared.store.delete(entity)?;
        self.shared.proxies.lock().records.remove(&entity.path());
        self.shared
            .publish(EntityEvent::Deleted(Arc::clone(entity)));
        Ok(())
    }

    /// Stores the thumbnail of `entity` without touching its other attributes.
    pub fn store_thumbnail(&self, entity: &Entity) -> Result<()> {
        self.shared.store.store_thumbnail(entity)
    }

    /// Claims every `Modified` entity for saving.
    pub fn get_modified(&self) -> Vec<ModifiedEntity> {
        let mut proxies = self.shared.proxies.lock();
        proxies
            .records
            .values_mut()
            .filter(|record| record.state == ProxyState::Modified)
            .map(|record| {
                record.state = ProxyState::Saving;
                ModifiedEntity {
                    shared: Arc::clone(&self.shared),
                    id: record.id,
                    entity: Arc::clone(&record.current),
                    snapshot: Entity::clone(&record.current),
                }
            })
            .collect()
    }

    /// Whether `path` has a tracked proxy, in either state.
    pub fn is_modified(&self, path: impl Into<EntityPath>) -> bool {
        self.shared.proxies.lock().records.contains_key(&path.into())
    }

    /// The state of the proxy tracking `path`, if any.
    pub fn state_of(&self, path: impl Into<EntityPath>) -> Option<ProxyState> {
        self.shared
            .proxies
            .lock()
            .records
            .get(&path.into())
            .map(|record| record.state)
    }

    /// Number of tracked proxies, in either state.
    pub fn modified_count(&self) -> usize {
        self.shared.proxies.lock().records.len()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<EntityEvent> {
        self.shared.events.subscribe()
    }
}

// =============================================================================
// Modified Entity Handle
// =============================================================================

/// An edit claimed by [`EntityManager::get_modified`].
pub struct ModifiedEntity {
    shared: Arc<Shared>,
    id: u64,
    entity: SharedEntity,
    /// State at claim time; this is what `save` writes.
    snapshot: Entity,
}

impl std::fmt::Debug for ModifiedEntity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ModifiedEntity")
            .field("id", &self.id)
            .field("path", &self.path())
            .finish_non_exhaustive()
    }
}

impl ModifiedEntity {
    pub fn path(&self) -> EntityPath {
        self.entity.path()
    }

    /// The live shared entity.
    pub fn entity(&self) -> &SharedEntity {
        &self.entity
    }

    /// The state that [`save`](Self::save) writes.
    pub fn snapshot(&self) -> &Entity {
        &self.snapshot
    }

    /// Writes the claimed state to the store, then stops tracking the path
    /// unless a newer proxy took over.
    ///
    /// # Errors
    ///
    /// The store's error. The proxy stays `Saving`; call
    /// [`return_to_modified`](Self::return_to_modified) to retry it with the
    /// next batch.
    pub fn save(&self) -> Result<()> {
        let path = self.path();
        self.snapshot.change_path(path.clone());

        if let Err(error) = self.shared.store.store(&self.snapshot) {
            warn!(path = %path, error = %error, transient = error.is_transient(), "save failed");
            return Err(error);
        }

        let mut proxies = self.shared.proxies.lock();
        if proxies.get_mut(&path, self.id).is_some() {
            proxies.records.remove(&path);
        }
        debug!(path = %path, "entity saved");
        Ok(())
    }

    /// Puts the proxy back to `Modified` so a later
    /// [`get_modified`](EntityManager::get_modified) claims it again.
    pub fn return_to_modified(&self) {
        let path = self.path();
        if let Some(record) = self.shared.proxies.lock().get_mut(&path, self.id) {
            record.state = ProxyState::Modified;
        }
    }

    /// Restores the state captured when tracking began, in the shared entity
    /// itself, and stops tracking the path.
    pub fn revert(&self) -> Result<()> {
        let path = self.path();
        let record = {
            let mut proxies = self.shared.proxies.lock();
            if proxies.get_mut(&path, self.id).is_none() {
                return Ok(());
            }
            proxies.records.remove(&path)
        };

        if let Some(record) = record {
            record.current.restore_from(&record.initial)?;
            record.current.change_path(path);
            self.shared
                .publish(EntityEvent::Changed(record.current));
        }
        Ok(())
    }
}

// =============================================================================
// Managed Reader
// =============================================================================

/// Bulk reader returned by [`EntityManager::create_reader`].
pub struct ManagedReader {
    shared: Arc<Shared>,
    inner: Box<dyn EntityReader>,
}

impl ManagedReader {
    /// Same as [`EntityManager::get_entity`].
    pub fn load(&mut self, path: impl Into<EntityPath>) -> Result<SharedEntity> {
        let path = path.into();
        Ok(self
            .find(&path)?
            .unwrap_or_else(|| Entity::file(path).into_shared()))
    }

    /// Same as [`EntityManager::find_entity`].
    pub fn find(&mut self, path: impl Into<EntityPath>) -> Result<Option<SharedEntity>> {
        let path = path.into();
        if let Some(entity) = self.shared.tracked(&path) {
            return Ok(Some(entity));
        }
        let loaded = self.inner.load(&path)?;
        Ok(self.shared.resolve(&path, loaded))
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::attribute::Attribute;
    use crate::error::Error;
    use crate::value::Value;
    use std::sync::atomic::{AtomicBool, Ordering};

    /// Map-backed store that can be told to fail writes.
    #[derive(Default)]
    struct MapStore {
        entities: Mutex<HashMap<EntityPath, Entity>>,
        fail_writes: AtomicBool,
    }

    impl MapStore {
        fn rating(&self, path: &str) -> Option<i64> {
            self.entities
                .lock()
                .get(&EntityPath::new(path))
                .and_then(|e| e.get_attribute("rating"))
                .and_then(|a| a.value().as_int())
        }
    }

    impl AttributeStore for MapStore {
        fn load(&self, path: &EntityPath) -> Result<Option<Entity>> {
            Ok(self.entities.lock().get(path).cloned())
        }

        fn store(&self, entity: &Entity) -> Result<()> {
            if self.fail_writes.load(Ordering::SeqCst) {
                return Err(Error::io(
                    entity.path().to_string(),
                    std::io::Error::from(std::io::ErrorKind::PermissionDenied),
                ));
            }
            self.entities.lock().insert(entity.path(), entity.clone());
            Ok(())
        }

        fn store_thumbnail(&self, _entity: &Entity) -> Result<()> {
            Ok(())
        }

        fn delete(&self, entity: &Entity) -> Result<()> {
            self.entities.lock().remove(&entity.path());
            Ok(())
        }

        fn move_entity(&self, entity: &Entity, new_path: &EntityPath) -> Result<()> {
            let mut entities = self.entities.lock();
            if let Some(stored) = entities.remove(&entity.path()) {
                stored.change_path(new_path.clone());
                entities.insert(new_path.clone(), stored);
            }
            Ok(())
        }

        fn create_reader(&self) -> Result<Box<dyn EntityReader>> {
            Err(Error::InvalidArgument("no reader".to_string()))
        }
    }

    fn manager() -> (EntityManager, Arc<MapStore>) {
        let store = Arc::new(MapStore::default());
        (EntityManager::new(store.clone()), store)
    }

    fn rate(entity: &Entity, rating: i64) {
        entity
            .set_attribute(Attribute::custom("rating", Value::int(rating)).unwrap())
            .unwrap();
    }

    fn rating_of(entity: &Entity) -> Option<i64> {
        entity.get_attribute("rating").and_then(|a| a.value().as_int())
    }

    #[test]
    fn test_unknown_path_gives_empty_entity() {
        let (manager, _) = manager();
        let entity = manager.get_entity("a.jpg").unwrap();
        assert!(entity.is_file());
        assert_eq!(entity.attribute_count(), 0);
        assert!(manager.find_entity("a.jpg").unwrap().is_none());
    }

    #[test]
    fn test_read_your_writes() {
        let (manager, _) = manager();
        let entity = manager.get_entity("a.jpg").unwrap();
        rate(&entity, 5);
        manager.set_entity(entity, true);

        let seen = manager.get_entity("A.JPG").unwrap();
        assert_eq!(rating_of(&seen), Some(5));
    }

    #[test]
    fn test_set_without_replace_keeps_existing() {
        let (manager, _) = manager();
        let first = Entity::file("a.jpg").into_shared();
        rate(&first, 1);
        manager.set_entity(first, true);

        let probe = Entity::file("a.jpg").into_shared();
        rate(&probe, 9);
        manager.set_entity(probe.clone(), false);
        assert_eq!(rating_of(&manager.get_entity("a.jpg").unwrap()), Some(1));

        manager.set_entity(probe, true);
        assert_eq!(rating_of(&manager.get_entity("a.jpg").unwrap()), Some(9));
        assert_eq!(manager.get_modified().len(), 1);
    }

    #[test]
    fn test_revert_restores_initial_state() {
        let (manager, _) = manager();
        let entity = Entity::file("a.jpg").into_shared();
        rate(&entity, 1);
        manager.set_entity(entity.clone(), true);

        rate(&entity, 4);
        manager.set_entity(entity.clone(), true);

        let claimed = manager.get_modified();
        claimed[0].revert().unwrap();

        assert_eq!(rating_of(&entity), Some(1));
        assert!(manager.get_modified().is_empty());
        assert!(!manager.is_modified("a.jpg"));
    }

    #[test]
    fn test_claimed_entities_not_claimed_twice() {
        let (manager, _) = manager();
        manager.set_entity(Entity::file("a.jpg").into_shared(), true);
        manager.set_entity(Entity::file("b.jpg").into_shared(), true);

        assert_eq!(manager.get_modified().len(), 2);
        assert!(manager.get_modified().is_empty());
        assert_eq!(manager.state_of("a.jpg"), Some(ProxyState::Saving));
    }

    #[test]
    fn test_save_persists_and_untracks() {
        let (manager, store) = manager();
        let entity = manager.get_entity("a.jpg").unwrap();
        rate(&entity, 5);
        manager.set_entity(entity, true);

        let claimed = manager.get_modified();
        assert_eq!(claimed.len(), 1);
        claimed[0].save().unwrap();

        assert_eq!(store.rating("a.jpg"), Some(5));
        assert_eq!(manager.modified_count(), 0);
    }

    #[test]
    fn test_failed_save_can_be_returned() {
        let (manager, store) = manager();
        let entity = Entity::file("a.jpg").into_shared();
        rate(&entity, 2);
        manager.set_entity(entity, true);

        store.fail_writes.store(true, Ordering::SeqCst);
        let claimed = manager.get_modified();
        let err = claimed[0].save().unwrap_err();
        assert!(err.is_transient());
        assert_eq!(manager.state_of("a.jpg"), Some(ProxyState::Saving));

        claimed[0].return_to_modified();
        store.fail_writes.store(false, Ordering::SeqCst);

        let retried = manager.get_modified();
        assert_eq!(retried.len(), 1);
        retried[0].save().unwrap();
        assert_eq!(store.rating("a.jpg"), Some(2));
    }

    #[test]
    fn test_set_while_saving_starts_new_proxy() {
        let (manager, store) = manager();
        let entity = Entity::file("a.jpg").into_shared();
        rate(&entity, 1);
        manager.set_entity(entity.clone(), true);
        let claimed = manager.get_modified();

        rate(&entity, 2);
        manager.set_entity(entity.clone(), false);
        assert_eq!(manager.state_of("a.jpg"), Some(ProxyState::Modified));

        // The old save writes its own snapshot and leaves the new proxy alone.
        claimed[0].save().unwrap();
        assert_eq!(store.rating("a.jpg"), Some(1));
        assert!(manager.is_modified("a.jpg"));

        claimed[0].return_to_modified();
        let next = manager.get_modified();
        assert_eq!(next.len(), 1);
        next[0].save().unwrap();
        assert_eq!(store.rating("a.jpg"), Some(2));
    }

    #[test]
    fn test_move_relabels_proxy() {
        let (manager, store) = manager();
        let entity = Entity::file("old.jpg").into_shared();
        rate(&entity, 3);
        store.store(&entity).unwrap();
        manager.set_entity(entity.clone(), true);

        manager.move_entity(&entity, "new.jpg").unwrap();

        assert!(!manager.is_modified("old.jpg"));
        assert!(manager.is_modified("new.jpg"));
        assert_eq!(entity.path(), EntityPath::new("new.jpg"));
        assert_eq!(store.rating("new.jpg"), Some(3));
    }

    #[test]
    fn test_remove_drops_proxy() {
        let (manager, store) = manager();
        let entity = Entity::file("a.jpg").into_shared();
        store.store(&entity).unwrap();
        manager.set_entity(entity.clone(), true);

        manager.remove_entity(&entity).unwrap();
        assert_eq!(manager.modified_count(), 0);
        assert!(manager.find_entity("a.jpg").unwrap().is_none());
    }

    #[tokio::test]
    async fn test_events_published() {
        let (manager, _) = manager();
        let mut events = manager.subscribe();

        let entity = Entity::file("a.jpg").into_shared();
        manager.set_entity(entity.clone(), true);
        manager.move_entity(&entity, "b.jpg").unwrap();
        manager.remove_entity(&entity).unwrap();

        assert!(matches!(events.recv().await.unwrap(), EntityEvent::Changed(_)));
        match events.recv().await.unwrap() {
            EntityEvent::Moved { old_path, entity } => {
                assert_eq!(old_path, EntityPath::new("a.jpg"));
                assert_eq!(entity.path(), EntityPath::new("b.jpg"));
            }
            other => panic!("expected move, got {other:?}"),
        }
        assert!(matches!(events.recv().await.unwrap(), EntityEvent::Deleted(_)));
    }
}
