//! # Pending Request Queue
//!
//! The secondary store never writes to SQLite on the caller's thread. Every
//! write becomes a [`PendingRequest`] in a [`RequestQueue`], and the flush
//! worker commits the queue as one batch.
//!
//! ## Coalescing
//!
//! The queue holds at most one request per path. Ten edits of the same photo
//! between two flushes therefore cost one insert:
//!
//! ```text
//! push(a.jpg, Store v1)   ┐
//! push(a.jpg, Store v2)   ├──►  { a.jpg: Store v3 }  ──►  1 INSERT on flush
//! push(a.jpg, Store v3)   ┘
//! ```
//!
//! | Pending \ Incoming | Store | StoreThumbnail | Touch | Delete |
//! |--------------------|-------|----------------|-------|--------|
//! | (none)             | new   | new            | new   | new    |
//! | Store              | replace | merged into the Store | kept | replace |
//! | StoreThumbnail     | replace | replace      | kept  | replace |
//! | Touch              | replace | replace      | replace | replace |
//! | Delete             | replace | dropped      | kept  | replace |
//!
//! A `Touch` only refreshes an access time, so it must never downgrade a
//! pending write.

use std::collections::HashMap;

use crate::attribute::Attribute;
use crate::entity::{Entity, EntityPath, THUMBNAIL_ATTRIBUTE};
use crate::value::Value;

// =============================================================================
// Request Types
// =============================================================================

/// A write waiting for the next flush.
#[derive(Debug, Clone)]
pub enum PendingRequest {
    /// Replace the cached record with this snapshot.
    Store {
        entity: Entity,
        /// File modification time observed when the snapshot was queued.
        observed_write_ms: u64,
    },

    /// Replace only the cached thumbnail.
    StoreThumbnail { thumbnail: Vec<u8> },

    /// Refresh the record's last access time.
    Touch { access_ms: u64 },

    /// Remove the cached record.
    Delete,
}

impl PendingRequest {
    /// Short name used in logs and failure reports.
    pub fn operation(&self) -> &'static str {
        match self {
            PendingRequest::Store { .. } => "store",
            PendingRequest::StoreThumbnail { .. } => "store_thumbnail",
            PendingRequest::Touch { .. } => "touch",
            PendingRequest::Delete => "delete",
        }
    }
}

#[derive(Debug)]
struct QueueEntry {
    /// Order in which the path first entered the queue.
    seq: u64,
    path: EntityPath,
    request: PendingRequest,
}

// =============================================================================
// Request Queue
// =============================================================================

/// One pending request per path, drained in first-queued order.
///
/// Not synchronized itself; the secondary store keeps it behind a mutex.
#[derive(Debug, Default)]
pub struct RequestQueue {
    entries: HashMap<EntityPath, QueueEntry>,
    next_seq: u64,
}

impl RequestQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn get(&self, path: &EntityPath) -> Option<&PendingRequest> {
        self.entries.get(path).map(|entry| &entry.request)
    }

    /// Queues `request` for `path`, coalescing with any pending request.
    pub fn push(&mut self, path: EntityPath, request: PendingRequest) {
        if let Some(entry) = self.entries.get_mut(&path) {
            let keep_pending = matches!(
                (&entry.request, &request),
                (
                    PendingRequest::Store { .. }
                        | PendingRequest::StoreThumbnail { .. }
                        | PendingRequest::Delete,
                    PendingRequest::Touch { .. },
                ) | (PendingRequest::Delete, PendingRequest::StoreThumbnail { .. })
            );
            if keep_pending {
                return;
            }

            if let PendingRequest::Store { entity, .. } = &entry.request {
                if let PendingRequest::StoreThumbnail { thumbnail } = request {
                    // Only fails for an empty name, which the constant is not.
                    if let Ok(attr) = Attribute::metadata(THUMBNAIL_ATTRIBUTE, Value::image(thumbnail)) {
                        let _ = entity.set_attribute(attr);
                    }
                    return;
                }
            }

            entry.request = request;
            entry.path = path;
            return;
        }

        let seq = self.next_seq;
        self.next_seq += 1;
        self.entries.insert(
            path.clone(),
            QueueEntry {
                seq,
                path,
                request,
            },
        );
    }

    /// Moves the pending request of `old` (if any) to `new`.
    ///
    /// A request already pending for `new` is superseded.
    pub fn rekey(&mut self, old: &EntityPath, new: &EntityPath) {
        if let Some(mut entry) = self.entries.remove(old) {
            if let PendingRequest::Store { entity, .. } = &entry.request {
                entity.change_path(new.clone());
            }
            entry.path = new.clone();
            self.entries.insert(new.clone(), entry);
        }
    }

    /// Empties the queue, returning its requests in first-queued order.
    pub fn drain(&mut self) -> Vec<(EntityPath, PendingRequest)> {
        let mut entries: Vec<QueueEntry> = self.entries.drain().map(|(_, entry)| entry).collect();
        entries.sort_by_key(|entry| entry.seq);
        entries
            .into_iter()
            .map(|entry| (entry.path, entry.request))
            .collect()
    }

    /// Puts drained requests back after a batch could not be committed.
    ///
    /// A path that received a newer request in the meantime keeps the newer
    /// one. Restored entries are ordered before anything queued since.
    pub fn restore(&mut self, requests: Vec<(EntityPath, PendingRequest)>) {
        let count = requests.len() as u64;
        for entry in self.entries.values_mut() {
            entry.seq += count;
        }
        for (seq, (path, request)) in requests.into_iter().enumerate() {
            self.entries.entry(path.clone()).or_insert(QueueEntry {
                seq: seq as u64,
                path,
                request,
            });
        }
        self.next_seq += count;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store(path: &str, rating: i64) -> PendingRequest {
        let entity = Entity::file(path);
        entity
            .set_attribute(Attribute::custom("rating", Value::int(rating)).unwrap())
            .unwrap();
        PendingRequest::Store {
            entity,
            observed_write_ms: 10,
        }
    }

    fn stored_rating(request: &PendingRequest) -> Option<i64> {
        match request {
            PendingRequest::Store { entity, .. } => entity
                .get_attribute("rating")
                .and_then(|a| a.value().as_int()),
            _ => None,
        }
    }

    #[test]
    fn test_rapid_stores_coalesce_to_last() {
        let mut queue = RequestQueue::new();
        let path = EntityPath::new("a.jpg");
        for rating in 1..=5 {
            queue.push(path.clone(), store("a.jpg", rating));
        }

        assert_eq!(queue.len(), 1);
        let drained = queue.drain();
        assert_eq!(drained.len(), 1);
        assert_eq!(stored_rating(&drained[0].1), Some(5));
        assert!(queue.is_empty());
    }

    #[test]
    fn test_touch_does_not_downgrade() {
        let mut queue = RequestQueue::new();
        let path = EntityPath::new("a.jpg");

        queue.push(path.clone(), store("a.jpg", 3));
        queue.push(path.clone(), PendingRequest::Touch { access_ms: 99 });
        assert_eq!(stored_rating(queue.get(&path).unwrap()), Some(3));

        queue.push(path.clone(), PendingRequest::Delete);
        queue.push(path.clone(), PendingRequest::Touch { access_ms: 100 });
        assert!(matches!(queue.get(&path), Some(PendingRequest::Delete)));
    }

    #[test]
    fn test_store_after_touch_wins() {
        let mut queue = RequestQueue::new();
        let path = EntityPath::new("a.jpg");

        queue.push(path.clone(), PendingRequest::Touch { access_ms: 1 });
        queue.push(path.clone(), store("a.jpg", 4));
        assert_eq!(stored_rating(queue.get(&path).unwrap()), Some(4));
    }

    #[test]
    fn test_thumbnail_merges_into_pending_store() {
        let mut queue = RequestQueue::new();
        let path = EntityPath::new("a.jpg");

        queue.push(path.clone(), store("a.jpg", 2));
        queue.push(
            path.clone(),
            PendingRequest::StoreThumbnail {
                thumbnail: vec![1, 2, 3],
            },
        );

        match queue.get(&path).unwrap() {
            PendingRequest::Store { entity, .. } => {
                assert_eq!(entity.thumbnail(), Some(vec![1, 2, 3]));
                assert!(entity.get_attribute("rating").is_some());
            }
            other => panic!("expected store, got {other:?}"),
        }
    }

    #[test]
    fn test_thumbnail_after_delete_dropped() {
        let mut queue = RequestQueue::new();
        let path = EntityPath::new("a.jpg");
        queue.push(path.clone(), PendingRequest::Delete);
        queue.push(path.clone(), PendingRequest::StoreThumbnail { thumbnail: vec![1] });
        assert!(matches!(queue.get(&path), Some(PendingRequest::Delete)));
    }

    #[test]
    fn test_drain_in_first_queued_order() {
        let mut queue = RequestQueue::new();
        queue.push(EntityPath::new("c.jpg"), PendingRequest::Delete);
        queue.push(EntityPath::new("a.jpg"), store("a.jpg", 1));
        queue.push(EntityPath::new("b.jpg"), PendingRequest::Touch { access_ms: 5 });
        queue.push(EntityPath::new("c.jpg"), store("c.jpg", 2));

        let order: Vec<String> = queue
            .drain()
            .into_iter()
            .map(|(path, _)| path.to_string())
            .collect();
        assert_eq!(order, vec!["c.jpg", "a.jpg", "b.jpg"]);
    }

    #[test]
    fn test_restore_keeps_newer_requests() {
        let mut queue = RequestQueue::new();
        queue.push(EntityPath::new("a.jpg"), store("a.jpg", 1));
        queue.push(EntityPath::new("b.jpg"), store("b.jpg", 1));
        let drained = queue.drain();

        queue.push(EntityPath::new("b.jpg"), store("b.jpg", 9));
        queue.restore(drained);

        let restored = queue.drain();
        assert_eq!(restored.len(), 2);
        assert_eq!(restored[0].0, EntityPath::new("a.jpg"));
        assert_eq!(stored_rating(&restored[1].1), Some(9));
    }

    #[test]
    fn test_rekey_moves_pending_store() {
        let mut queue = RequestQueue::new();
        let old = EntityPath::new("old.jpg");
        let new = EntityPath::new("new.jpg");
        queue.push(old.clone(), store("old.jpg", 7));

        queue.rekey(&old, &new);

        assert!(queue.get(&old).is_none());
        match queue.get(&new).unwrap() {
            PendingRequest::Store { entity, .. } => assert_eq!(entity.path(), new),
            other => panic!("expected store, got {other:?}"),
        }
        let drained = queue.drain();
        assert_eq!(drained[0].0, new);
    }
}
