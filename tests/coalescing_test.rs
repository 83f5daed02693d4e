//! Write Coalescing Tests
//!
//! The secondary store keeps one pending request per path:
//! - N stores of a path before a flush become one insert of the last data
//! - A touch never downgrades a pending store or delete
//! - Reads see pending requests before they are committed

mod common;

use attrcache::{Attribute, EntityPath, Value, THUMBNAIL_ATTRIBUTE};

#[test]
fn rapid_stores_commit_one_insert() {
    let (_dir, path) = common::create_temp_cache("coalesce.db");
    common::install_insert_log(&path);
    let (store, _) = common::open_secondary(&path, common::manual_config());

    for rating in 1..=20 {
        store.store(&common::photo("a.jpg", rating)).unwrap();
    }
    assert_eq!(store.pending_len(), 1);

    let stats = store.apply_changes().unwrap();
    assert_eq!(stats.drained, 1);
    assert_eq!(stats.applied, 1);

    let read_conn = common::open_read_only(&path);
    assert_eq!(common::insert_count(&read_conn, "a.jpg"), 1);
    assert_eq!(common::raw_rating(&read_conn, "a.jpg"), Some(20));
}

#[test]
fn store_after_touch_commits_data() {
    let (_dir, path) = common::create_temp_cache("touch_then_store.db");
    let (store, _) = common::open_secondary(&path, common::manual_config());

    let a = EntityPath::new("a.jpg");
    store.touch(&a).unwrap();
    store.store(&common::photo("a.jpg", 4)).unwrap();
    store.apply_changes().unwrap();

    let read_conn = common::open_read_only(&path);
    assert_eq!(common::raw_rating(&read_conn, "a.jpg"), Some(4));
}

#[test]
fn touch_after_store_keeps_data() {
    let (_dir, path) = common::create_temp_cache("store_then_touch.db");
    let (store, _) = common::open_secondary(&path, common::manual_config());

    let a = EntityPath::new("a.jpg");
    store.store(&common::photo("a.jpg", 4)).unwrap();
    store.touch(&a).unwrap();
    store.apply_changes().unwrap();

    let read_conn = common::open_read_only(&path);
    assert_eq!(common::raw_rating(&read_conn, "a.jpg"), Some(4));
}

#[test]
fn touch_after_delete_keeps_delete() {
    let (_dir, path) = common::create_temp_cache("delete_then_touch.db");
    let (store, _) = common::open_secondary(&path, common::manual_config());

    let entity = common::photo("a.jpg", 1);
    store.store(&entity).unwrap();
    store.apply_changes().unwrap();

    store.delete(&entity).unwrap();
    store.touch(&entity.path()).unwrap();
    store.apply_changes().unwrap();

    let read_conn = common::open_read_only(&path);
    assert!(common::raw_cached_paths(&read_conn).is_empty());
}

#[test]
fn pending_store_snapshot_is_independent() {
    let (_dir, path) = common::create_temp_cache("snapshot.db");
    let (store, _) = common::open_secondary(&path, common::manual_config());

    let entity = common::photo("a.jpg", 1);
    store.store(&entity).unwrap();
    entity
        .set_attribute(Attribute::custom("rating", Value::int(7)).unwrap())
        .unwrap();

    let loaded = store.load(&EntityPath::new("a.jpg")).unwrap().unwrap();
    assert_eq!(common::rating_of(&loaded), Some(1));
}

#[test]
fn thumbnail_merges_into_pending_store() {
    let (_dir, path) = common::create_temp_cache("thumbnail_merge.db");
    common::install_insert_log(&path);
    let (store, _) = common::open_secondary(&path, common::manual_config());

    let entity = common::photo("a.jpg", 5);
    store.store(&entity).unwrap();
    entity
        .set_attribute(Attribute::metadata(THUMBNAIL_ATTRIBUTE, Value::image(vec![1, 2])).unwrap())
        .unwrap();
    store.store_thumbnail(&entity).unwrap();
    store.apply_changes().unwrap();

    let read_conn = common::open_read_only(&path);
    assert_eq!(common::insert_count(&read_conn, "a.jpg"), 1);
    let thumbnail: Vec<u8> = read_conn
        .query_row("SELECT thumbnail FROM files WHERE path = 'a.jpg'", [], |row| row.get(0))
        .unwrap();
    assert_eq!(thumbnail, vec![1, 2]);
    assert_eq!(common::raw_rating(&read_conn, "a.jpg"), Some(5));
}
