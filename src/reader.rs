//! # Projection Reader
//!
//! Direct reads of the projection for consumers and tests. Reads go straight
//! to SQLite; with WAL a reader on its own connection always sees the last
//! committed catch-up transaction and never a partial one.

use rusqlite::{params, Connection, OptionalExtension};

use crate::error::{Error, Result};
use crate::types::{ObjectId, ProjectionRow, Version};

/// Reads the projection row of one object.
pub fn read_row(conn: &Connection, zoid: ObjectId) -> Result<Option<ProjectionRow>> {
    let row = conn
        .query_row(
            "SELECT zoid, class_name, class_pickle, state FROM object_json WHERE zoid = ?",
            params![zoid.as_raw()],
            |row| {
                Ok(ProjectionRow {
                    zoid: ObjectId::from_raw(row.get(0)?),
                    class_name: row.get(1)?,
                    class_pickle: row.get(2)?,
                    state: row.get(3)?,
                })
            },
        )
        .optional()?;
    Ok(row)
}

/// Reads the state of one object as parsed JSON.
pub fn read_state(conn: &Connection, zoid: ObjectId) -> Result<Option<serde_json::Value>> {
    read_row(conn, zoid)?
        .map(|row| serde_json::from_str(&row.state).map_err(Error::from))
        .transpose()
}

/// Reads the watermark: the highest version fully applied to the projection.
pub fn read_watermark(conn: &Connection) -> Result<Version> {
    conn.query_row("SELECT tid FROM object_json_tid WHERE id = 1", [], |row| {
        row.get::<_, i64>(0)
    })
    .optional()?
    .map(Version::from_raw)
    .ok_or_else(|| Error::Schema("watermark row is missing".to_string()))
}

/// Number of rows in the projection.
pub fn count_rows(conn: &Connection) -> Result<usize> {
    let n: i64 = conn.query_row("SELECT COUNT(*) FROM object_json", [], |row| row.get(0))?;
    Ok(n as usize)
}

/// Object ids of every projected object of `class_name`, in id order.
pub fn zoids_of_class(conn: &Connection, class_name: &str) -> Result<Vec<ObjectId>> {
    let mut stmt = conn.prepare("SELECT zoid FROM object_json WHERE class_name = ? ORDER BY zoid")?;
    let zoids = stmt
        .query_map(params![class_name], |row| row.get::<_, i64>(0))?
        .map(|zoid| zoid.map(ObjectId::from_raw))
        .collect::<std::result::Result<Vec<_>, _>>()?;
    Ok(zoids)
}
