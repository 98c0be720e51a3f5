//! Version-Boundary Batching Tests
//!
//! Tests that catch-up transactions respect the size limit without ever
//! splitting a version:
//! - A cycle halts on the first record of a new version once past the limit
//! - The watermark after each cycle is the last fully applied version
//! - Page size changes statement size, never transaction boundaries

mod common;

use picklejson::test_support::grouped_records;
use picklejson::types::VersionRange;
use picklejson::{reader, CycleOutcome, Version};

/// 99 records, 7 per version (the last version holds one), limit 20.
#[test]
fn batches_end_on_version_boundaries() {
    let (_dir, path) = common::create_temp_db_file("batching.db");
    common::seed(&path, &grouped_records(99, 7));

    let config = common::config(&path).with_transaction_size_limit(20);
    let updater = common::open_updater(&config);

    let mut sizes = Vec::new();
    let mut watermarks = Vec::new();
    loop {
        let watermark = updater.watermark().unwrap();
        let report = updater
            .catch_up_cycle(VersionRange::after(watermark), true)
            .unwrap();
        if report.outcome == CycleOutcome::Idle {
            break;
        }
        sizes.push(report.rows_written);
        watermarks.push(report.end.as_raw());
    }

    assert_eq!(sizes, vec![21, 21, 21, 21, 15]);
    assert_eq!(watermarks, vec![3, 6, 9, 12, 15]);
    assert_eq!(reader::count_rows(updater.database().connection()).unwrap(), 99);
}

#[test]
fn halted_cycle_reports_limit() {
    let (_dir, path) = common::create_temp_db_file("halted.db");
    common::seed(&path, &grouped_records(99, 7));

    let config = common::config(&path).with_transaction_size_limit(20);
    let updater = common::open_updater(&config);

    let first = updater
        .catch_up_cycle(VersionRange::after(Version::ZERO), true)
        .unwrap();
    assert_eq!(first.outcome, CycleOutcome::HaltedAtLimit);
    assert_eq!(first.rows_prepared, 21);

    // Nothing of version 4 is visible yet.
    let conn = common::open_reader(&path);
    let beyond: i64 = conn
        .query_row("SELECT COUNT(*) FROM object_json WHERE zoid > 21", [], |row| row.get(0))
        .unwrap();
    assert_eq!(beyond, 0);
}

#[test]
fn page_size_does_not_change_batches() {
    for page_size in [1, 4, 7, 100] {
        let (_dir, path) = common::create_temp_db_file("pages.db");
        common::seed(&path, &grouped_records(50, 5));

        let config = common::config(&path)
            .with_transaction_size_limit(12)
            .with_page_size(page_size);
        let updater = common::open_updater(&config);

        let first = updater
            .catch_up_cycle(VersionRange::after(Version::ZERO), true)
            .unwrap();
        assert_eq!(first.rows_written, 15, "page size {page_size}");
        assert_eq!(first.end, Version::from_raw(3), "page size {page_size}");

        assert_eq!(updater.catch_up().unwrap(), Version::from_raw(10));
        assert_eq!(common::projection(&path).len(), 50);
    }
}

/// A limit larger than the backlog applies everything in one cycle.
#[test]
fn large_limit_single_cycle() {
    let (_dir, path) = common::create_temp_db_file("single.db");
    common::seed(&path, &grouped_records(40, 3));

    let updater = common::open_updater(&common::config(&path));
    let report = updater
        .catch_up_cycle(VersionRange::after(Version::ZERO), true)
        .unwrap();
    assert_eq!(report.outcome, CycleOutcome::Advanced);
    assert_eq!(report.records_read, 40);
    assert_eq!(report.end, Version::from_raw(14));
}
