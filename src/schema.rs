//! # SQLite Schema for picklejson
//!
//! This module defines the database schema and handles initialization. One
//! database file holds both sides of the pipeline: the upstream object log
//! that writers append to, and the JSON projection this crate maintains.
//!
//! ## Table Overview
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                           Schema Overview                               │
//! ├─────────────────────────────────────────────────────────────────────────┤
//! │                                                                         │
//! │  object_state (log)          object_json (projection)                   │
//! │  ┌─────────────────┐         ┌──────────────────────┐                   │
//! │  │ zoid (PK)       │ ──────► │ zoid (PK)            │                   │
//! │  │ tid  (indexed)  │ convert │ class_name   TEXT    │                   │
//! │  │ state BLOB      │         │ class_pickle BLOB    │                   │
//! │  └─────────────────┘         │ state        TEXT    │                   │
//! │                              └──────────────────────┘                   │
//! │                                                                         │
//! │  object_json_tid             picklejson_metadata                        │
//! │  ┌─────────────────┐         ┌─────────────────┐                        │
//! │  │ id = 1 (CHECK)  │         │ key (PK)        │                        │
//! │  │ tid (watermark) │         │ value           │                        │
//! │  └─────────────────┘         └─────────────────┘                        │
//! │                                                                         │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Design Decisions
//!
//! ### One current row per object in the log
//!
//! `object_state` keeps the latest state of each object, stamped with the
//! transaction id that wrote it. Reading `tid > watermark` in tid order
//! therefore yields every object changed since the watermark exactly once,
//! at its newest version.
//!
//! ### Watermark in the projection database
//!
//! The watermark row lives next to the projection and is updated in the
//! same transaction as the rows it accounts for, so the two can never
//! disagree after a crash.

use std::time::Duration;

use rusqlite::Connection;

use crate::error::{Error, Result};

// =============================================================================
// Schema Version
// =============================================================================

/// Current schema version. Increment when making breaking schema changes.
///
/// A mismatch is an error; there are no migrations.
const SCHEMA_VERSION: i32 = 1;

/// How long a statement waits on a lock held by another connection.
const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

// =============================================================================
// DDL Statements
// =============================================================================

/// The upstream log: latest pickled state of every object.
///
/// # Columns
///
/// - `zoid`: Object id (PK)
/// - `tid`: Transaction id that wrote this state; the log position
/// - `state`: Two concatenated pickles, class descriptor then state
const CREATE_OBJECT_STATE: &str = r#"
CREATE TABLE IF NOT EXISTS object_state (
    zoid  INTEGER PRIMARY KEY,
    tid   INTEGER NOT NULL,
    state BLOB NOT NULL
)
"#;

/// Supports `WHERE tid > ? ORDER BY tid` without a full scan.
const CREATE_OBJECT_STATE_TID_INDEX: &str = r#"
CREATE INDEX IF NOT EXISTS object_state_tid
ON object_state(tid)
"#;

/// The projection: canonical JSON for every converted object.
///
/// # Columns
///
/// - `zoid`: Object id (PK, upsert key)
/// - `class_name`: Dotted class name
/// - `class_pickle`: Verbatim class descriptor bytes, for rebuilding ghosts
/// - `state`: Canonical JSON text
const CREATE_OBJECT_JSON: &str = r#"
CREATE TABLE IF NOT EXISTS object_json (
    zoid         INTEGER PRIMARY KEY,
    class_name   TEXT NOT NULL,
    class_pickle BLOB NOT NULL,
    state        TEXT NOT NULL
)
"#;

/// Lets consumers find all objects of a class.
const CREATE_OBJECT_JSON_CLASS_INDEX: &str = r#"
CREATE INDEX IF NOT EXISTS object_json_class_name
ON object_json(class_name)
"#;

/// The single watermark row.
///
/// # Invariants
///
/// - Exactly one row, `id = 1`, enforced by the CHECK constraint
/// - `tid` never decreases
const CREATE_OBJECT_JSON_TID: &str = r#"
CREATE TABLE IF NOT EXISTS object_json_tid (
    id  INTEGER PRIMARY KEY CHECK (id = 1),
    tid INTEGER NOT NULL
)
"#;

/// A fresh projection starts before the first version.
const INIT_OBJECT_JSON_TID: &str = r#"
INSERT OR IGNORE INTO object_json_tid (id, tid) VALUES (1, 0)
"#;

/// Metadata table for schema versioning.
const CREATE_METADATA: &str = r#"
CREATE TABLE IF NOT EXISTS picklejson_metadata (
    key   TEXT PRIMARY KEY,
    value TEXT NOT NULL
)
"#;

// =============================================================================
// Database Wrapper
// =============================================================================

/// A SQLite connection with the picklejson schema in place.
///
/// # Rust Pattern: Newtype Wrapper
///
/// Wrapping `Connection` means every `Database` value has been initialized:
/// the tables exist, the watermark row exists and the schema version
/// matches. Code that holds a `Database` never has to check.
#[derive(Debug)]
pub struct Database {
    conn: Connection,
}

impl Database {
    /// Opens a database file, creating and initializing it if necessary.
    ///
    /// # Errors
    ///
    /// - `Error::Sqlite` if the file can't be opened or created
    /// - `Error::Schema` if the schema version doesn't match
    ///
    /// # Example
    ///
    /// ```rust,no_run
    /// use picklejson::Database;
    ///
    /// let db = Database::open("objects.db")?;
    /// # Ok::<(), picklejson::Error>(())
    /// ```
    pub fn open(path: impl AsRef<std::path::Path>) -> Result<Self> {
        let conn = Connection::open(path)?;
        let mut db = Self { conn };
        db.initialize()?;
        Ok(db)
    }

    /// Creates an in-memory database for testing.
    ///
    /// ```rust
    /// use picklejson::Database;
    ///
    /// let db = Database::open_in_memory()?;
    /// # Ok::<(), picklejson::Error>(())
    /// ```
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        let mut db = Self { conn };
        db.initialize()?;
        Ok(db)
    }

    fn initialize(&mut self) -> Result<()> {
        // WAL lets projection readers see a consistent snapshot while a
        // catch-up transaction is open.
        self.conn.execute_batch("PRAGMA journal_mode = WAL")?;
        self.conn.execute_batch("PRAGMA synchronous = NORMAL")?;
        self.conn.busy_timeout(BUSY_TIMEOUT)?;

        self.conn.execute_batch(CREATE_METADATA)?;
        self.conn.execute_batch(CREATE_OBJECT_STATE)?;
        self.conn.execute_batch(CREATE_OBJECT_STATE_TID_INDEX)?;
        self.conn.execute_batch(CREATE_OBJECT_JSON)?;
        self.conn.execute_batch(CREATE_OBJECT_JSON_CLASS_INDEX)?;
        self.conn.execute_batch(CREATE_OBJECT_JSON_TID)?;
        self.conn.execute_batch(INIT_OBJECT_JSON_TID)?;

        self.verify_or_set_version()?;

        Ok(())
    }

    /// Verifies the schema version, or sets it if this is a new database.
    fn verify_or_set_version(&mut self) -> Result<()> {
        let existing: Option<String> = self
            .conn
            .query_row(
                "SELECT value FROM picklejson_metadata WHERE key = 'schema_version'",
                [],
                |row| row.get(0),
            )
            // query_row returns Err if no rows found; convert to None
            .ok();

        match existing {
            None => {
                self.conn.execute(
                    "INSERT INTO picklejson_metadata (key, value) VALUES ('schema_version', ?)",
                    [SCHEMA_VERSION.to_string()],
                )?;
            }
            Some(v) if v == SCHEMA_VERSION.to_string() => {}
            Some(v) => {
                return Err(Error::Schema(format!(
                    "schema version mismatch: database has version {v}, but this picklejson version requires {SCHEMA_VERSION}"
                )));
            }
        }

        Ok(())
    }

    /// Returns a reference to the underlying SQLite connection.
    ///
    /// Callers must not modify the schema. The watermark row is owned by the
    /// batch engine.
    pub fn connection(&self) -> &Connection {
        &self.conn
    }

    /// Consumes the wrapper, returning the connection.
    pub fn into_connection(self) -> Connection {
        self.conn
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn table_count(db: &Database) -> i32 {
        db.conn
            .query_row(
                "SELECT COUNT(*) FROM sqlite_master WHERE type = 'table' AND name NOT LIKE 'sqlite_%'",
                [],
                |row| row.get(0),
            )
            .expect("should query tables")
    }

    #[test]
    fn test_open_in_memory() {
        let db = Database::open_in_memory().expect("should create in-memory db");

        // metadata, object_state, object_json, object_json_tid
        assert_eq!(table_count(&db), 4);
    }

    #[test]
    fn test_watermark_row_starts_at_zero() {
        let db = Database::open_in_memory().expect("should create db");

        let tid: i64 = db
            .conn
            .query_row("SELECT tid FROM object_json_tid WHERE id = 1", [], |row| row.get(0))
            .expect("should read watermark");
        assert_eq!(tid, 0);

        // The CHECK constraint keeps it a single row.
        let second = db
            .conn
            .execute("INSERT INTO object_json_tid (id, tid) VALUES (2, 5)", []);
        assert!(second.is_err());
    }

    #[test]
    fn test_indexes_created() {
        let db = Database::open_in_memory().expect("should create db");

        let indexes: Vec<String> = {
            let mut stmt = db
                .conn
                .prepare("SELECT name FROM sqlite_master WHERE type = 'index' AND name NOT LIKE 'sqlite_%'")
                .expect("should prepare");

            stmt.query_map([], |row| row.get(0))
                .expect("should query")
                .collect::<std::result::Result<Vec<_>, _>>()
                .expect("should collect")
        };

        assert!(indexes.contains(&"object_state_tid".to_string()));
        assert!(indexes.contains(&"object_json_class_name".to_string()));
    }

    #[test]
    fn test_schema_version_mismatch() {
        let dir = tempfile::tempdir().expect("should create temp dir");
        let path = dir.path().join("test.db");

        {
            let db = Database::open(&path).expect("first open should work");
            db.conn
                .execute(
                    "UPDATE picklejson_metadata SET value = '99' WHERE key = 'schema_version'",
                    [],
                )
                .expect("should update version");
        }

        let err = Database::open(&path).unwrap_err();
        assert!(matches!(err, Error::Schema(_)));
    }

    /// Reopening keeps data and the watermark.
    #[test]
    fn test_double_initialization() {
        let dir = tempfile::tempdir().expect("should create temp dir");
        let path = dir.path().join("test.db");

        {
            let db = Database::open(&path).expect("first open should work");
            db.conn
                .execute("UPDATE object_json_tid SET tid = 42 WHERE id = 1", [])
                .expect("should set watermark");
        }

        let db = Database::open(&path).expect("second open should work");
        assert_eq!(table_count(&db), 4);
        let tid: i64 = db
            .conn
            .query_row("SELECT tid FROM object_json_tid", [], |row| row.get(0))
            .expect("should read watermark");
        assert_eq!(tid, 42);
    }
}
