//! Live-Follow Tests
//!
//! Tests the follower running on its own thread against a file database
//! written by a separate producer connection:
//! - Notified changes reach the projection
//! - The change watcher picks up commits without in-process notifications
//! - A stop payload ends the loop with its stats

mod common;

use std::time::Duration;

use picklejson::test_support::simple_record;
use picklejson::{channel, reader, source, spawn_follower, ObjectId, Version};

const WAIT: Duration = Duration::from_secs(10);
const TICK: Duration = Duration::from_millis(10);

fn has_row(path: &std::path::Path, zoid: i64) -> Option<()> {
    let conn = common::open_reader(path);
    reader::read_row(&conn, ObjectId::from_raw(zoid))
        .unwrap()
        .map(|_| ())
}

#[tokio::test]
async fn notified_changes_reach_projection() {
    let (_dir, path) = common::create_temp_db_file("follow.db");
    common::seed(&path, &[simple_record(1, 1, "app", "Thing")]);

    let config = common::config(&path).with_poll_timeout(Duration::from_secs(60));
    let (notifier, listener) = channel();
    let follower = spawn_follower(common::open_updater(&config), listener, &config).unwrap();

    // The backlog is applied at startup without any notification.
    common::eventually(WAIT, TICK, || has_row(&path, 1)).await;

    let producer = common::open_producer(&path);
    let record = simple_record(2, 2, "app", "Thing");
    source::append(producer.connection(), record.version, record.zoid, &record.state).unwrap();
    notifier.notify("2").unwrap();
    common::eventually(WAIT, TICK, || has_row(&path, 2)).await;

    notifier.stop().unwrap();
    let stats = tokio::task::spawn_blocking(move || follower.join())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(stats.watermark, Version::from_raw(2));
    assert!(stats.notifications >= 1);
    assert_eq!(stats.missed_notifications, 0);
    assert_eq!(stats.failures, 0);
}

#[tokio::test]
async fn watcher_wakes_follower_for_other_processes() {
    let (_dir, path) = common::create_temp_db_file("watch.db");

    let config = common::config(&path)
        .with_poll_timeout(Duration::from_secs(60))
        .with_watch_interval(Some(Duration::from_millis(10)));
    let (notifier, listener) = channel();
    let follower = spawn_follower(common::open_updater(&config), listener, &config).unwrap();
    let watcher = tokio::spawn(picklejson::follow::watch_changes(
        path.clone(),
        Duration::from_millis(10),
        notifier.clone(),
    ));

    // Let the watcher take its starting snapshot.
    tokio::time::sleep(Duration::from_millis(100)).await;
    common::seed(&path, &[simple_record(1, 7, "app", "Thing")]);
    common::eventually(WAIT, TICK, || has_row(&path, 7)).await;

    notifier.stop().unwrap();
    let stats = tokio::task::spawn_blocking(move || follower.join())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(stats.watermark, Version::from_raw(1));
    assert_eq!(stats.timeouts, 0);

    // With the listener gone the watcher exits on its next change.
    common::seed(&path, &[simple_record(2, 8, "app", "Thing")]);
    tokio::time::timeout(WAIT, watcher).await.unwrap().unwrap().unwrap();
}

#[tokio::test]
async fn closed_channel_falls_back_to_polling() {
    let (_dir, path) = common::create_temp_db_file("poll.db");

    let config = common::config(&path).with_poll_timeout(Duration::from_millis(20));
    let (notifier, listener) = channel();
    let follower = spawn_follower(common::open_updater(&config), listener, &config).unwrap();
    drop(notifier);

    common::seed(&path, &[simple_record(1, 3, "app", "Thing")]);
    common::eventually(WAIT, TICK, || has_row(&path, 3)).await;
    assert!(!follower.is_finished());
}
