//! Restart and Replay Tests
//!
//! Tests that the projection survives restarts:
//! - A new updater resumes from the persisted watermark
//! - Replaying an applied range leaves the projection unchanged
//! - Redo reconverts without moving the watermark

mod common;

use std::sync::Arc;

use picklejson::test_support::{grouped_records, simple_record};
use picklejson::transform::HookError;
use picklejson::types::VersionRange;
use picklejson::{reader, ObjectId, RecordConverter, Transformed, Version};
use serde_json::json;

#[test]
fn resumes_from_persisted_watermark() {
    let (_dir, path) = common::create_temp_db_file("resume.db");
    common::seed(&path, &grouped_records(30, 3));
    let config = common::config(&path).with_transaction_size_limit(5);

    {
        let updater = common::open_updater(&config);
        let report = updater
            .catch_up_cycle(VersionRange::after(Version::ZERO), true)
            .unwrap();
        assert_eq!(report.end, Version::from_raw(2));
    }

    let updater = common::open_updater(&config);
    assert_eq!(updater.watermark().unwrap(), Version::from_raw(2));
    assert_eq!(updater.catch_up().unwrap(), Version::from_raw(10));
    assert_eq!(common::projection(&path).len(), 30);
}

#[test]
fn replaying_a_range_is_idempotent() {
    let (_dir, path) = common::create_temp_db_file("replay.db");
    common::seed(&path, &grouped_records(20, 4));
    let config = common::config(&path);

    let updater = common::open_updater(&config);
    updater.catch_up().unwrap();
    let once = common::projection(&path);

    // Crash-restart simulation: the same range is applied again.
    let report = updater
        .catch_up_cycle(VersionRange::between(Version::ZERO, Version::from_raw(5)), true)
        .unwrap();
    assert_eq!(report.records_read, 20);
    assert_eq!(common::projection(&path), once);
    assert_eq!(updater.watermark().unwrap(), Version::from_raw(5));
}

#[test]
fn newer_state_replaces_row() {
    let (_dir, path) = common::create_temp_db_file("newer.db");
    common::seed(&path, &[simple_record(1, 1, "app", "Old")]);

    let updater = common::open_updater(&common::config(&path));
    updater.catch_up().unwrap();

    common::seed(&path, &[simple_record(2, 1, "app", "New")]);
    assert_eq!(updater.catch_up().unwrap(), Version::from_raw(2));

    let conn = common::open_reader(&path);
    let row = reader::read_row(&conn, ObjectId::from_raw(1)).unwrap().unwrap();
    assert_eq!(row.class_name, "app.New");
}

#[test]
fn redo_applies_new_transformation() {
    let (_dir, path) = common::create_temp_db_file("redo.db");
    common::seed(&path, &grouped_records(6, 2));
    let config = common::config(&path);

    common::open_updater(&config).catch_up().unwrap();

    let hook = Arc::new(
        |zoid: ObjectId, _class: &str, _state: &str| -> Result<Transformed, HookError> {
            Ok(Transformed::Json(json!({ "redone": zoid.as_raw() })))
        },
    );
    let updater = common::open_updater_with(&config, RecordConverter::new().with_transform(hook));
    assert_eq!(updater.redo().unwrap(), 6);
    assert_eq!(updater.watermark().unwrap(), Version::from_raw(3));

    let conn = common::open_reader(&path);
    assert_eq!(
        reader::read_state(&conn, ObjectId::from_raw(4)).unwrap(),
        Some(json!({ "redone": 4 }))
    );
}
