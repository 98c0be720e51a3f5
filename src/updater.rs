//! # Batch/Watermark Engine
//!
//! This module keeps the JSON projection in step with the upstream log. A
//! catch-up cycle reads every record after the watermark, converts it and
//! upserts the rows, then moves the watermark, all in one SQLite
//! transaction.
//!
//! ## One Cycle
//!
//! ```text
//! BEGIN IMMEDIATE
//! │
//! ├── FETCHING     cursor over object_state WHERE tid > watermark ORDER BY tid
//! │
//! ├── CONVERTING   record → RecordConverter → page buffer
//! │     │           (skip / decode failure: logged, no row)
//! │     └── page full ──► flush
//! │
//! ├── COMMITTING   flush remaining page
//! │     │
//! │     │   SAVEPOINT bulk
//! │     │     INSERT … VALUES (…), (…), … ON CONFLICT(zoid) DO UPDATE
//! │     │   ok:   RELEASE bulk
//! │     │   fail: ROLLBACK TO bulk, then per row:
//! │     │           SAVEPOINT row / upsert / RELEASE or ROLLBACK TO
//! │     │
//! │     └── UPDATE object_json_tid SET tid = last version WHERE tid < it
//! │
//! COMMIT ──► Advanced | HaltedAtLimit | Idle
//! ```
//!
//! ## Version Boundaries
//!
//! A version is never split across two transactions. The engine counts the
//! rows it has prepared; when the first record of a *new* version arrives
//! and the count is already past the transaction size limit, the cycle
//! stops before touching that record. Everything buffered belongs to fully
//! read versions, so the watermark can move to the last one.
//!
//! ```text
//! limit = 20, 7 records per version
//!
//! v1: 7   v2: 14   v3: 21   v4 first record, 21 > 20 → halt, watermark = v3
//! ```
//!
//! Pages are independent of this: a page may hold part of a version because
//! it commits with the rest of that version in the same transaction.
//!
//! ## Failure Handling
//!
//! - Decode and hook failures drop the record (`warn!`) and the watermark
//!   still moves past it
//! - A failing bulk upsert falls back to one savepoint per row; a row that
//!   fails alone is dropped (`error!`)
//! - Anything else (cursor, watermark, commit) rolls the whole cycle back
//!   and is returned to the caller
//!
//! ## Invariants
//!
//! - The watermark and the rows it accounts for commit together
//! - The watermark never decreases
//! - Re-applying a range is a no-op (upsert by object id)

use std::ops::ControlFlow;

use rusqlite::{params, params_from_iter, Connection, ToSql};

use crate::config::UpdaterConfig;
use crate::convert::{Conversion, RecordConverter};
use crate::error::{Error, Result};
use crate::reader;
use crate::schema::Database;
use crate::source;
use crate::types::{PreparedRow, Record, Version, VersionRange};

const UPSERT_PREFIX: &str = "INSERT INTO object_json (zoid, class_name, class_pickle, state) VALUES ";

const UPSERT_SUFFIX: &str = "
ON CONFLICT (zoid) DO UPDATE SET
    class_name = excluded.class_name,
    class_pickle = excluded.class_pickle,
    state = excluded.state";

const ADVANCE_WATERMARK_SQL: &str = "UPDATE object_json_tid SET tid = ?1 WHERE id = 1 AND tid < ?1";

// =============================================================================
// Cycle Report
// =============================================================================

/// How a catch-up cycle ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CycleOutcome {
    /// No records in range; nothing changed.
    Idle,
    /// Every record in range was applied.
    Advanced,
    /// Stopped at a version boundary after passing the size limit. More
    /// records remain.
    HaltedAtLimit,
}

/// What one catch-up cycle did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CycleReport {
    /// Exclusive lower bound the cycle read from.
    pub start: Version,
    /// Last fully applied version, `start` if none.
    pub end: Version,
    /// Records consumed, including skipped and failed ones.
    pub records_read: usize,
    /// Records converted to rows; the count the size limit applies to.
    pub rows_prepared: usize,
    /// Rows upserted.
    pub rows_written: usize,
    /// Rows whose upsert failed even on its own.
    pub rows_failed: usize,
    /// Records dropped by the skip pattern.
    pub records_skipped: usize,
    /// Records dropped by a decode or hook failure.
    pub records_failed: usize,
    /// How the cycle ended.
    pub outcome: CycleOutcome,
}

impl CycleReport {
    fn new(start: Version) -> Self {
        Self {
            start,
            end: start,
            records_read: 0,
            rows_prepared: 0,
            rows_written: 0,
            rows_failed: 0,
            records_skipped: 0,
            records_failed: 0,
            outcome: CycleOutcome::Idle,
        }
    }
}

// =============================================================================
// Updater
// =============================================================================

/// The batch engine: one database, one converter, run sequentially.
///
/// # Rust Pattern: Single Owner
///
/// `Updater` owns its `Database`, so there is exactly one writer of the
/// projection and the watermark. Concurrent readers open their own
/// connections; WAL shows them the last committed cycle.
#[derive(Debug)]
pub struct Updater {
    db: Database,
    converter: RecordConverter,
    transaction_size_limit: usize,
    page_size: usize,
}

impl Updater {
    /// Creates an engine over an open database.
    pub fn new(db: Database, converter: RecordConverter, config: &UpdaterConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            db,
            converter,
            transaction_size_limit: config.transaction_size_limit,
            page_size: config.page_size,
        })
    }

    /// Opens `config.database` and builds the converter `config` describes.
    pub fn open(config: &UpdaterConfig) -> Result<Self> {
        let db = Database::open(&config.database)?;
        let converter = RecordConverter::from_config(config)?;
        Self::new(db, converter, config)
    }

    /// The underlying database.
    pub fn database(&self) -> &Database {
        &self.db
    }

    /// The highest version fully applied to the projection.
    pub fn watermark(&self) -> Result<Version> {
        reader::read_watermark(self.db.connection())
    }

    // =========================================================================
    // Catch-up
    // =========================================================================

    /// Applies records until a cycle finds nothing new.
    ///
    /// Returns the final watermark.
    pub fn catch_up(&self) -> Result<Version> {
        let mut watermark = self.watermark()?;
        loop {
            let report = self.catch_up_cycle(VersionRange::after(watermark), true)?;
            if report.records_read == 0 {
                return Ok(watermark);
            }
            watermark = report.end;
        }
    }

    /// Reconverts every object at or below the watermark without moving it.
    ///
    /// Used after changing the state transformation. Returns the number of
    /// records read.
    pub fn redo(&self) -> Result<usize> {
        let until = self.watermark()?;
        tracing::info!(watermark = %until, "redo starting");

        let mut range = VersionRange::between(Version::ZERO, until);
        let mut total = 0;
        while !range.is_empty() {
            let report = self.catch_up_cycle(range, false)?;
            if report.records_read == 0 {
                break;
            }
            total += report.records_read;
            range = range.resume_after(report.end);
        }

        tracing::info!(records = total, "redo finished");
        Ok(total)
    }

    /// Runs one cycle over `range` in a single transaction.
    ///
    /// With `advance_watermark` the watermark moves to the last applied
    /// version as part of the same transaction. On error everything the
    /// cycle did is rolled back.
    pub fn catch_up_cycle(&self, range: VersionRange, advance_watermark: bool) -> Result<CycleReport> {
        let conn = self.db.connection();
        conn.execute_batch("BEGIN IMMEDIATE")?;

        let report = match self.run_cycle(conn, range, advance_watermark) {
            Ok(report) => report,
            Err(e) => {
                let _ = conn.execute_batch("ROLLBACK");
                return Err(e);
            }
        };

        match conn.execute_batch("COMMIT") {
            Ok(()) => {}
            Err(e) => {
                let _ = conn.execute_batch("ROLLBACK");
                return Err(e.into());
            }
        }

        if report.records_read > 0 {
            tracing::debug!(
                start = %report.start,
                end = %report.end,
                records = report.records_read,
                written = report.rows_written,
                skipped = report.records_skipped,
                failed = report.records_failed + report.rows_failed,
                "cycle committed"
            );
        }
        Ok(report)
    }

    fn run_cycle(
        &self,
        conn: &Connection,
        range: VersionRange,
        advance_watermark: bool,
    ) -> Result<CycleReport> {
        let mut report = CycleReport::new(range.after);
        let mut page: Vec<PreparedRow> = Vec::with_capacity(self.page_size);

        source::for_each_record(conn, range, |record| {
            if record.version != report.end
                && report.records_read > 0
                && report.rows_prepared > self.transaction_size_limit
            {
                tracing::info!(
                    rows = report.rows_prepared,
                    version = %report.end,
                    "catch up halting"
                );
                report.outcome = CycleOutcome::HaltedAtLimit;
                return Ok(ControlFlow::Break(()));
            }

            report.records_read += 1;
            report.end = record.version;
            if let Some(row) = self.prepare(record, &mut report)? {
                page.push(row);
                if page.len() >= self.page_size {
                    flush_page(conn, &page, &mut report)?;
                    page.clear();
                }
            }
            Ok(ControlFlow::Continue(()))
        })?;
        flush_page(conn, &page, &mut report)?;

        if report.records_read == 0 {
            return Ok(report);
        }
        if report.outcome != CycleOutcome::HaltedAtLimit {
            report.outcome = CycleOutcome::Advanced;
        }
        if advance_watermark && report.end > range.after {
            conn.prepare_cached(ADVANCE_WATERMARK_SQL)?
                .execute(params![report.end.as_raw()])?;
        }
        Ok(report)
    }

    /// Converts one record, absorbing record-level failures.
    fn prepare(&self, record: Record, report: &mut CycleReport) -> Result<Option<PreparedRow>> {
        match self.converter.convert(&record) {
            Ok(Conversion::Row(row)) => {
                report.rows_prepared += 1;
                Ok(Some(PreparedRow {
                    version: record.version,
                    row,
                }))
            }
            Ok(Conversion::Skipped { class_name }) => {
                report.records_skipped += 1;
                tracing::trace!(zoid = %record.zoid, class_name = %class_name, "skipped");
                Ok(None)
            }
            Err(e) if e.is_record_level() => {
                report.records_failed += 1;
                tracing::warn!(
                    version = %record.version,
                    zoid = %record.zoid,
                    error = %e,
                    "failed to convert record"
                );
                Ok(None)
            }
            Err(e) => Err(e),
        }
    }
}

// =============================================================================
// Writing Rows
// =============================================================================

/// Upserts a page in one statement, falling back to one row at a time.
fn flush_page(conn: &Connection, page: &[PreparedRow], report: &mut CycleReport) -> Result<()> {
    if page.is_empty() {
        return Ok(());
    }

    conn.execute_batch("SAVEPOINT bulk")?;
    match upsert_rows(conn, page) {
        Ok(()) => {
            conn.execute_batch("RELEASE bulk")?;
            report.rows_written += page.len();
            return Ok(());
        }
        Err(e) => {
            conn.execute_batch("ROLLBACK TO bulk")?;
            conn.execute_batch("RELEASE bulk")?;
            tracing::debug!(rows = page.len(), error = %e, "bulk upsert failed, retrying rows singly");
        }
    }

    for prepared in page {
        conn.execute_batch("SAVEPOINT row")?;
        match upsert_rows(conn, std::slice::from_ref(prepared)) {
            Ok(()) => {
                conn.execute_batch("RELEASE row")?;
                report.rows_written += 1;
            }
            Err(e) => {
                conn.execute_batch("ROLLBACK TO row")?;
                conn.execute_batch("RELEASE row")?;
                report.rows_failed += 1;
                tracing::error!(
                    version = %prepared.version,
                    zoid = %prepared.row.zoid,
                    error = %e,
                    "failed to upsert row"
                );
            }
        }
    }
    Ok(())
}

/// One multi-row upsert statement for `rows`.
fn upsert_rows(conn: &Connection, rows: &[PreparedRow]) -> Result<()> {
    let placeholders = vec!["(?, ?, ?, ?)"; rows.len()].join(", ");
    let sql = format!("{UPSERT_PREFIX}{placeholders}{UPSERT_SUFFIX}");

    let zoids: Vec<i64> = rows.iter().map(|r| r.row.zoid.as_raw()).collect();
    let mut values: Vec<&dyn ToSql> = Vec::with_capacity(rows.len() * 4);
    for (prepared, zoid) in rows.iter().zip(&zoids) {
        values.push(zoid);
        values.push(&prepared.row.class_name);
        values.push(&prepared.row.class_pickle);
        values.push(&prepared.row.state);
    }

    let written = conn.prepare_cached(&sql)?.execute(params_from_iter(values))?;
    if written != rows.len() {
        return Err(Error::Schema(format!(
            "upsert wrote {written} of {} rows",
            rows.len()
        )));
    }
    Ok(())
}

// =============================================================================
// Tests
// =============================================================================
