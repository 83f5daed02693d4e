#![allow(dead_code)]

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use attrcache::{
    Attribute, CacheConfig, Database, Entity, EntityPath, Error, FixedFileTimes, MemoryStore,
    PersistentStore, Result, SecondaryStore, Value,
};
use rusqlite::{Connection, OpenFlags};

pub fn create_temp_cache(name: &str) -> (tempfile::TempDir, PathBuf) {
    let dir = tempfile::TempDir::new().expect("create temp dir");
    let path = dir.path().join(name);
    let _ = Database::open(&path).expect("initialize cache");
    (dir, path)
}

pub fn open_read_only(path: &Path) -> Connection {
    Connection::open_with_flags(
        path,
        OpenFlags::SQLITE_OPEN_READ_ONLY | OpenFlags::SQLITE_OPEN_NO_MUTEX,
    )
    .expect("open read-only connection")
}

pub fn open_read_write(path: &Path) -> Connection {
    Connection::open(path).expect("open read-write connection")
}

/// Flushes only when the test asks for it.
pub fn manual_config() -> CacheConfig {
    CacheConfig {
        flush_interval: Duration::from_secs(3600),
        load_quiescence: Duration::ZERO,
        ..CacheConfig::default()
    }
}

pub fn open_secondary(path: &Path, config: CacheConfig) -> (Arc<SecondaryStore>, Arc<FixedFileTimes>) {
    let times = Arc::new(FixedFileTimes::new());
    let store = SecondaryStore::open(path, config, times.clone()).expect("open secondary store");
    (Arc::new(store), times)
}

pub fn photo(path: &str, rating: i64) -> Entity {
    let entity = Entity::file(path);
    entity
        .set_attribute(Attribute::custom("rating", Value::int(rating)).unwrap())
        .unwrap();
    entity
}

pub fn rating_of(entity: &Entity) -> Option<i64> {
    entity.get_attribute("rating").and_then(|a| a.value().as_int())
}

/// Paths (case-folded) of the committed cache records, sorted.
pub fn raw_cached_paths(conn: &Connection) -> Vec<String> {
    let mut stmt = conn
        .prepare("SELECT path FROM files ORDER BY path")
        .expect("prepare");
    stmt.query_map([], |row| row.get(0))
        .expect("query")
        .collect::<std::result::Result<Vec<_>, _>>()
        .expect("collect")
}

pub fn raw_rating(conn: &Connection, path: &str) -> Option<i64> {
    conn.query_row(
        "SELECT a.int_value FROM attributes a JOIN files f ON f.file_id = a.file_id
         WHERE f.path = ?1 AND a.name = 'rating'",
        [path],
        |row| row.get(0),
    )
    .ok()
}

/// Records every insert into `files` in an `insert_log` table.
pub fn install_insert_log(path: &Path) {
    open_read_write(path)
        .execute_batch(
            "CREATE TABLE insert_log (path TEXT NOT NULL);
             CREATE TRIGGER log_file_insert AFTER INSERT ON files
             BEGIN INSERT INTO insert_log (path) VALUES (NEW.path); END;",
        )
        .expect("install insert log");
}

pub fn insert_count(conn: &Connection, path: &str) -> i64 {
    conn.query_row(
        "SELECT COUNT(*) FROM insert_log WHERE path = ?1",
        [path],
        |row| row.get(0),
    )
    .expect("count inserts")
}

/// Makes every insert of `key` into `files` fail.
pub fn reject_inserts_for(path: &Path, key: &str) {
    open_read_write(path)
        .execute_batch(&format!(
            "CREATE TRIGGER reject_insert BEFORE INSERT ON files WHEN NEW.path = '{key}'
             BEGIN SELECT RAISE(ABORT, 'rejected by test'); END;"
        ))
        .expect("install reject trigger");
}

/// A persistent store whose writes can be switched to fail like a locked file.
#[derive(Debug, Default)]
pub struct FlakyStore {
    pub inner: MemoryStore,
    failing: AtomicBool,
}

impl FlakyStore {
    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    fn check(&self, path: &EntityPath) -> Result<()> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(Error::io(
                path.to_string(),
                std::io::Error::new(std::io::ErrorKind::PermissionDenied, "file is locked"),
            ));
        }
        Ok(())
    }
}

impl PersistentStore for FlakyStore {
    fn load(&self, path: &EntityPath) -> Result<Option<Entity>> {
        self.inner.load(path)
    }

    fn store(&self, entity: &Entity) -> Result<()> {
        self.check(&entity.path())?;
        self.inner.store(entity)
    }

    fn delete(&self, entity: &Entity) -> Result<()> {
        self.check(&entity.path())?;
        self.inner.delete(entity)
    }

    fn move_entity(&self, entity: &Entity, new_path: &EntityPath) -> Result<()> {
        self.check(&entity.path())?;
        self.inner.move_entity(entity, new_path)
    }
}

pub async fn eventually<T>(
    timeout: Duration,
    interval: Duration,
    mut f: impl FnMut() -> Option<T>,
) -> T {
    let start = std::time::Instant::now();
    loop {
        if let Some(v) = f() {
            return v;
        }
        if start.elapsed() > timeout {
            panic!("condition not met within {:?}", timeout);
        }
        tokio::time::sleep(interval).await;
    }
}
