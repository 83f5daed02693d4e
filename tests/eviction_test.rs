//! Eviction Tests
//!
//! After each flush the secondary store removes records not accessed within
//! the cache lifespan, then trims the least recently accessed records beyond
//! the file count cap. Eviction never runs while a reader is alive.

mod common;

use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use attrcache::{CacheConfig, EntityPath};

const HOUR_MS: i64 = 60 * 60 * 1000;

fn lifespan_config() -> CacheConfig {
    CacheConfig {
        cache_lifespan: Duration::from_secs(3600),
        eviction_lock_timeout: Duration::from_millis(20),
        ..common::manual_config()
    }
}

fn age_record(path: &std::path::Path, key: &str, by_ms: i64) {
    common::open_read_write(path)
        .execute(
            "UPDATE files SET last_access_ms = last_access_ms - ?2 WHERE path = ?1",
            rusqlite::params![key, by_ms],
        )
        .unwrap();
}

#[test]
fn records_past_lifespan_are_evicted() {
    let (_dir, path) = common::create_temp_cache("lifespan.db");
    let (store, _) = common::open_secondary(&path, lifespan_config());

    store.store(&common::photo("old.jpg", 1)).unwrap();
    store.store(&common::photo("fresh.jpg", 2)).unwrap();
    store.apply_changes().unwrap();

    age_record(&path, "old.jpg", 2 * HOUR_MS);

    let stats = store.apply_changes().unwrap();
    assert_eq!(stats.evicted, 1);

    let read_conn = common::open_read_only(&path);
    assert_eq!(common::raw_cached_paths(&read_conn), vec!["fresh.jpg"]);
    assert!(store.load(&EntityPath::new("old.jpg")).unwrap().is_none());
    assert!(store.load(&EntityPath::new("fresh.jpg")).unwrap().is_some());
}

#[test]
fn loads_refresh_access_time() {
    let (_dir, path) = common::create_temp_cache("refresh.db");
    let (store, _) = common::open_secondary(&path, lifespan_config());

    store.store(&common::photo("a.jpg", 1)).unwrap();
    store.apply_changes().unwrap();
    age_record(&path, "a.jpg", 2 * HOUR_MS);

    // The hit queues a touch, which commits before eviction runs.
    assert!(store.load(&EntityPath::new("a.jpg")).unwrap().is_some());
    let stats = store.apply_changes().unwrap();
    assert_eq!(stats.evicted, 0);

    let read_conn = common::open_read_only(&path);
    assert_eq!(common::raw_cached_paths(&read_conn), vec!["a.jpg"]);
}

#[test]
fn live_reader_blocks_eviction() {
    let (_dir, path) = common::create_temp_cache("reader_gate.db");
    let (store, _) = common::open_secondary(&path, lifespan_config());

    store.store(&common::photo("old.jpg", 1)).unwrap();
    store.apply_changes().unwrap();
    age_record(&path, "old.jpg", 2 * HOUR_MS);

    let reader = store.create_reader().unwrap();
    let stats = store.apply_changes().unwrap();
    assert!(stats.eviction_skipped);
    assert_eq!(stats.evicted, 0);

    drop(reader);
    let stats = store.apply_changes().unwrap();
    assert!(!stats.eviction_skipped);
    assert_eq!(stats.evicted, 1);
}

#[test]
fn reader_on_own_connection_sees_committed_records() {
    let (_dir, path) = common::create_temp_cache("reader_conn.db");
    let (store, _) = common::open_secondary(&path, lifespan_config());

    store.store(&common::photo("a.jpg", 6)).unwrap();
    store.apply_changes().unwrap();

    let mut reader = store.create_reader().unwrap();
    let loaded = reader.load(&EntityPath::new("A.JPG")).unwrap().unwrap();
    assert_eq!(common::rating_of(&loaded), Some(6));
    assert!(reader.load(&EntityPath::new("b.jpg")).unwrap().is_none());
}

#[test]
fn file_count_cap_trims_least_recent() {
    let (_dir, path) = common::create_temp_cache("cap.db");
    let config = CacheConfig {
        cache_max_file_count: 2,
        ..lifespan_config()
    };
    let (store, _) = common::open_secondary(&path, config);

    store.store(&common::photo("a.jpg", 1)).unwrap();
    store.store(&common::photo("b.jpg", 2)).unwrap();
    store.apply_changes().unwrap();
    age_record(&path, "a.jpg", 1_000);

    store.store(&common::photo("c.jpg", 3)).unwrap();
    let stats = store.apply_changes().unwrap();
    assert_eq!(stats.evicted, 1);

    let read_conn = common::open_read_only(&path);
    assert_eq!(common::raw_cached_paths(&read_conn), vec!["b.jpg", "c.jpg"]);
}

/// A move waits for a flush stuck in the eviction wait, but writes that only
/// touch the queue keep going. The move then applies to the committed record.
#[test]
fn move_waiting_on_flush_leaves_queue_writes_fast() {
    let (_dir, path) = common::create_temp_cache("move_during_flush.db");
    let config = CacheConfig {
        eviction_lock_timeout: Duration::from_secs(5),
        ..lifespan_config()
    };
    let (store, _) = common::open_secondary(&path, config);
    store.store(&common::photo("m.jpg", 4)).unwrap();

    // The live reader holds the flush in its eviction wait, with the
    // connection locked and the queue already drained.
    let reader = store.create_reader().unwrap();
    let flusher = {
        let store = Arc::clone(&store);
        thread::spawn(move || store.apply_changes())
    };
    thread::sleep(Duration::from_millis(200));
    assert_eq!(store.pending_len(), 0);

    let mover = {
        let store = Arc::clone(&store);
        thread::spawn(move || {
            store.move_entity(&common::photo("m.jpg", 4), &EntityPath::new("n.jpg"))
        })
    };
    thread::sleep(Duration::from_millis(100));

    let started = Instant::now();
    store.store(&common::photo("y.jpg", 1)).unwrap();
    store.touch(&EntityPath::new("z.jpg")).unwrap();
    let elapsed = started.elapsed();
    assert!(elapsed < Duration::from_millis(500), "queue write took {elapsed:?}");

    drop(reader);
    flusher.join().unwrap().unwrap();
    mover.join().unwrap().unwrap();

    let read_conn = common::open_read_only(&path);
    assert_eq!(common::raw_cached_paths(&read_conn), vec!["n.jpg"]);
    assert_eq!(common::raw_rating(&read_conn, "n.jpg"), Some(4));
}
