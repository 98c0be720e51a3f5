//! # The Upstream Object Log
//!
//! Query and append access to `object_state`, the log the batch engine
//! consumes. Writers upsert one row per object per transaction; the engine
//! reads rows in `tid` order starting after its watermark.
//!
//! ## Streaming
//!
//! [`for_each_record`] walks a live `rusqlite` cursor and hands each record
//! to a callback, so a catch-up over millions of rows never materializes
//! them. The callback stops the walk early by returning
//! [`ControlFlow::Break`].

use std::ops::ControlFlow;

use rusqlite::{params, Connection};

use crate::error::Result;
use crate::types::{ObjectId, Record, Version, VersionRange};

/// Records in `(after, until]`, oldest version first.
const UPDATES_SQL: &str = "
SELECT tid, zoid, state FROM object_state
WHERE tid > ?1 AND (?2 IS NULL OR tid <= ?2)
ORDER BY tid, zoid";

const APPEND_SQL: &str = "
INSERT INTO object_state (zoid, tid, state) VALUES (?1, ?2, ?3)
ON CONFLICT (zoid) DO UPDATE SET tid = excluded.tid, state = excluded.state";

// =============================================================================
// Reading
// =============================================================================

/// Streams the records of `range` to `f` in version order.
///
/// Returns the number of records handed to `f`.
pub fn for_each_record<F>(conn: &Connection, range: VersionRange, mut f: F) -> Result<usize>
where
    F: FnMut(Record) -> Result<ControlFlow<()>>,
{
    let mut stmt = conn.prepare_cached(UPDATES_SQL)?;
    let mut rows = stmt.query(params![
        range.after.as_raw(),
        range.until.map(|v| v.as_raw())
    ])?;

    let mut seen = 0;
    while let Some(row) = rows.next()? {
        let record = Record {
            version: Version::from_raw(row.get(0)?),
            zoid: ObjectId::from_raw(row.get(1)?),
            state: row.get(2)?,
        };
        seen += 1;
        if f(record)?.is_break() {
            break;
        }
    }
    Ok(seen)
}

/// Collects the records of `range`. Intended for small ranges and tests.
pub fn read_records(conn: &Connection, range: VersionRange) -> Result<Vec<Record>> {
    let mut records = Vec::new();
    for_each_record(conn, range, |record| {
        records.push(record);
        Ok(ControlFlow::Continue(()))
    })?;
    Ok(records)
}

/// Highest version in the log, or [`Version::ZERO`] if it is empty.
pub fn head(conn: &Connection) -> Result<Version> {
    let tid: Option<i64> = conn.query_row("SELECT MAX(tid) FROM object_state", [], |row| row.get(0))?;
    Ok(tid.map_or(Version::ZERO, Version::from_raw))
}

// =============================================================================
// Appending
// =============================================================================

/// Writes the state of one object at `version`, replacing any older state.
pub fn append(conn: &Connection, version: Version, zoid: ObjectId, state: &[u8]) -> Result<()> {
    conn.prepare_cached(APPEND_SQL)?
        .execute(params![zoid.as_raw(), version.as_raw(), state])?;
    Ok(())
}

/// Writes a set of records in one transaction.
pub fn append_records(conn: &Connection, records: &[Record]) -> Result<usize> {
    conn.execute_batch("BEGIN IMMEDIATE")?;
    let result = (|| -> Result<usize> {
        for record in records {
            append(conn, record.version, record.zoid, &record.state)?;
        }
        Ok(records.len())
    })();

    match result {
        Ok(n) => {
            conn.execute_batch("COMMIT")?;
            Ok(n)
        }
        Err(err) => {
            let _ = conn.execute_batch("ROLLBACK");
            Err(err)
        }
    }
}
