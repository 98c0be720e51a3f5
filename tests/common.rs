#![allow(dead_code)]

use std::path::{Path, PathBuf};
use std::time::Duration;

use rusqlite::Connection;
use picklejson::{source, Database, Record, RecordConverter, Updater, UpdaterConfig};

pub fn create_temp_db_file(name: &str) -> (tempfile::TempDir, PathBuf) {
    let dir = tempfile::TempDir::new().expect("create temp dir");
    let path = dir.path().join(name);
    let _ = Database::open(&path).expect("initialize database");
    (dir, path)
}

/// A separate connection for inspecting the projection.
///
/// Read-write so it can open the file even when no other connection holds
/// the WAL index.
pub fn open_reader(path: &Path) -> Connection {
    Connection::open(path).expect("open reader connection")
}

/// A producer connection that appends to the log.
pub fn open_producer(path: &Path) -> Database {
    Database::open(path).expect("open producer database")
}

pub fn config(path: &Path) -> UpdaterConfig {
    UpdaterConfig::new(path).with_watch_interval(None)
}

pub fn open_updater(config: &UpdaterConfig) -> Updater {
    Updater::open(config).expect("open updater")
}

pub fn open_updater_with(config: &UpdaterConfig, converter: RecordConverter) -> Updater {
    let db = Database::open(&config.database).expect("open database");
    Updater::new(db, converter, config).expect("create updater")
}

pub fn seed(path: &Path, records: &[Record]) {
    let producer = open_producer(path);
    source::append_records(producer.connection(), records).expect("append records");
}

/// Every projection row as `(zoid, class_name, class_pickle, state)`.
pub fn projection(path: &Path) -> Vec<(i64, String, Vec<u8>, String)> {
    let conn = open_reader(path);
    let mut stmt = conn
        .prepare("SELECT zoid, class_name, class_pickle, state FROM object_json ORDER BY zoid")
        .expect("prepare");
    stmt.query_map([], |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?)))
        .expect("query")
        .collect::<std::result::Result<Vec<_>, _>>()
        .expect("collect")
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
