//! # Live-Follow Driver
//!
//! After the backlog is applied the updater waits for change notifications
//! and runs a catch-up after each wake.
//!
//! ```text
//!   producer                         follower thread (current_thread runtime)
//!   ────────                         ─────────────────────────────────────────
//!   append to object_state           catch_up()            ◄── Wake::Startup
//!   notifier.notify("…") ──mpsc──►   loop {
//!                                        wait(poll_timeout)
//!                                          Timeout      → catch_up()
//!                                          Notified(n)  → catch_up()
//!                                          Stop         → return stats
//!                                    }
//! ```
//!
//! ## Wakes
//!
//! Notifications that queue up while a cycle runs are drained together and
//! produce one wake. A [`STOP_PAYLOAD`] anywhere in the drained set stops
//! the loop; stop is only observed between cycles, never during one.
//!
//! If the channel closes (every [`Notifier`] dropped) the driver keeps
//! going as a plain poller, running a cycle every `poll_timeout`.
//!
//! ## Missed Notifications
//!
//! A timeout wake whose cycle still moves the watermark means a change
//! arrived without a notification. That is logged as `missed change`. The
//! first wait after startup is exempt: changes committed between the
//! startup catch-up and the first wait can legitimately be unannounced.
//!
//! ## Change Watcher
//!
//! Producers in the same process notify through a [`Notifier`]. Producers
//! in other processes are picked up by [`watch_changes`], which polls
//! SQLite's `PRAGMA data_version` on its own read-only connection and
//! notifies whenever another connection has committed.
//!
//! ## Failures
//!
//! A failed cycle is logged and retried on the next wake. After
//! `max_consecutive_failures` failures in a row the error is returned and
//! the thread exits, leaving restarts to a supervisor.

use std::path::PathBuf;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use rusqlite::{Connection, OpenFlags};
use tokio::sync::mpsc;
use tokio::time::MissedTickBehavior;

use crate::config::UpdaterConfig;
use crate::error::{Error, Result};
use crate::types::Version;
use crate::updater::Updater;

/// Payload that asks the follow loop to exit.
pub const STOP_PAYLOAD: &str = "STOP";

// =============================================================================
// Notification Channel
// =============================================================================

/// Creates a connected notifier/listener pair.
pub fn channel() -> (Notifier, Listener) {
    let (tx, rx) = mpsc::unbounded_channel();
    (Notifier { tx }, Listener { rx, closed: false })
}

/// Sending half: announces that new versions were appended to the log.
#[derive(Debug, Clone)]
pub struct Notifier {
    tx: mpsc::UnboundedSender<String>,
}

impl Notifier {
    /// Announces a change. The payload is only inspected for [`STOP_PAYLOAD`].
    pub fn notify(&self, payload: impl Into<String>) -> Result<()> {
        self.tx
            .send(payload.into())
            .map_err(|_| Error::Channel("follow loop is gone".to_string()))
    }

    /// Asks the follow loop to exit after its current cycle.
    pub fn stop(&self) -> Result<()> {
        self.notify(STOP_PAYLOAD)
    }
}

/// Why the follow loop woke up.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Wake {
    /// The catch-up before the first wait.
    Startup,
    /// The poll timeout elapsed without a notification.
    Timeout,
    /// One or more notifications arrived.
    Notified(usize),
    /// A stop payload arrived.
    Stop,
}

/// Receiving half, owned by the follow loop.
#[derive(Debug)]
pub struct Listener {
    rx: mpsc::UnboundedReceiver<String>,
    closed: bool,
}

impl Listener {
    /// Waits up to `timeout` for notifications.
    ///
    /// This is the only suspension point of the follow loop.
    pub async fn wait(&mut self, timeout: Duration) -> Wake {
        if self.closed {
            tokio::time::sleep(timeout).await;
            return Wake::Timeout;
        }

        let first = match tokio::time::timeout(timeout, self.rx.recv()).await {
            Err(_) => return Wake::Timeout,
            Ok(None) => {
                tracing::warn!("notification channel closed, polling only");
                self.closed = true;
                tokio::time::sleep(timeout).await;
                return Wake::Timeout;
            }
            Ok(Some(payload)) => payload,
        };

        let mut count = 1;
        let mut stop = first == STOP_PAYLOAD;
        while let Ok(payload) = self.rx.try_recv() {
            count += 1;
            stop |= payload == STOP_PAYLOAD;
        }

        if stop {
            Wake::Stop
        } else {
            Wake::Notified(count)
        }
    }
}

/// Payload sent by [`watch_changes`].
const DATA_VERSION_PAYLOAD: &str = "data_version";

/// Notifies `notifier` whenever another connection commits to the database
/// at `path`, checking every `interval`.
///
/// Returns once the listener is gone.
pub async fn watch_changes(path: PathBuf, interval: Duration, notifier: Notifier) -> Result<()> {
    let conn = Connection::open_with_flags(
        &path,
        OpenFlags::SQLITE_OPEN_READ_ONLY | OpenFlags::SQLITE_OPEN_NO_MUTEX,
    )?;
    let mut last = data_version(&conn)?;

    let mut ticks = tokio::time::interval(interval);
    ticks.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        ticks.tick().await;
        let current = data_version(&conn)?;
        if current == last {
            continue;
        }
        last = current;
        if notifier.notify(DATA_VERSION_PAYLOAD).is_err() {
            tracing::debug!("listener gone, change watcher exiting");
            return Ok(());
        }
    }
}

fn data_version(conn: &Connection) -> Result<i64> {
    Ok(conn.query_row("PRAGMA data_version", [], |row| row.get(0))?)
}

// =============================================================================
// Follower
// =============================================================================

/// Counters for a follow run.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FollowStats {
    /// Catch-ups run, including the startup one.
    pub cycles: u64,
    /// Notifications received (coalesced ones counted individually).
    pub notifications: u64,
    /// Wakes caused by the poll timeout.
    pub timeouts: u64,
    /// Timeout wakes that still found new versions.
    pub missed_notifications: u64,
    /// Failed catch-ups.
    pub failures: u64,
    /// Watermark after the last successful catch-up.
    pub watermark: Version,
}

/// The catch-up-then-follow loop.
#[derive(Debug)]
pub struct Follower {
    updater: Updater,
    listener: Listener,
    poll_timeout: Duration,
    max_consecutive_failures: u32,
    consecutive_failures: u32,
    first_wait: bool,
    stats: FollowStats,
}

impl Follower {
    /// Creates a follower that has not caught up yet.
    pub fn new(updater: Updater, listener: Listener, config: &UpdaterConfig) -> Self {
        Self {
            updater,
            listener,
            poll_timeout: config.poll_timeout,
            max_consecutive_failures: config.max_consecutive_failures,
            consecutive_failures: 0,
            first_wait: true,
            stats: FollowStats::default(),
        }
    }

    /// The engine this follower drives.
    pub fn updater(&self) -> &Updater {
        &self.updater
    }

    /// Counters so far.
    pub fn stats(&self) -> &FollowStats {
        &self.stats
    }

    /// Runs the catch-up for one wake.
    ///
    /// Returns an error only once the failure limit is reached.
    pub fn on_wake(&mut self, wake: &Wake) -> Result<()> {
        let exempt = match wake {
            Wake::Stop => return Ok(()),
            Wake::Startup => true,
            Wake::Timeout => {
                self.stats.timeouts += 1;
                std::mem::replace(&mut self.first_wait, false)
            }
            Wake::Notified(count) => {
                self.stats.notifications += *count as u64;
                self.first_wait = false;
                true
            }
        };

        let before = self.stats.watermark;
        self.stats.cycles += 1;
        match self.updater.catch_up() {
            Ok(after) => {
                self.consecutive_failures = 0;
                if after > before && !exempt {
                    self.stats.missed_notifications += 1;
                    tracing::warn!(before = %before, after = %after, "missed change");
                }
                self.stats.watermark = after;
                Ok(())
            }
            Err(e) => {
                // Cycles before the failing one stay committed.
                if let Ok(watermark) = self.updater.watermark() {
                    self.stats.watermark = watermark;
                }
                self.stats.failures += 1;
                self.consecutive_failures += 1;
                tracing::error!(
                    error = %e,
                    consecutive = self.consecutive_failures,
                    "catch up failed"
                );
                if self.consecutive_failures >= self.max_consecutive_failures {
                    Err(e)
                } else {
                    Ok(())
                }
            }
        }
    }

    /// Catches up, then follows until a stop payload arrives.
    pub async fn run(mut self) -> Result<FollowStats> {
        let watermark = self.updater.watermark()?;
        tracing::info!("starting updater");
        tracing::info!(watermark = %watermark, "initial watermark");
        self.stats.watermark = watermark;

        self.on_wake(&Wake::Startup)?;
        loop {
            let wake = self.listener.wait(self.poll_timeout).await;
            if wake == Wake::Stop {
                tracing::info!(watermark = %self.stats.watermark, "stopping updater");
                return Ok(self.stats);
            }
            self.on_wake(&wake)?;
        }
    }
}

// =============================================================================
// Dedicated Thread
// =============================================================================

/// Handle to a follower running on its own thread.
#[derive(Debug)]
pub struct FollowerHandle {
    thread: JoinHandle<Result<FollowStats>>,
}

impl FollowerHandle {
    /// Waits for the follower to exit and returns its result.
    pub fn join(self) -> Result<FollowStats> {
        self.thread
            .join()
            .map_err(|_| Error::Channel("follower thread panicked".to_string()))?
    }

    /// True once the follower thread has exited.
    pub fn is_finished(&self) -> bool {
        self.thread.is_finished()
    }
}

/// Runs a [`Follower`] on a dedicated thread with a current-thread runtime.
///
/// Stop it through the [`Notifier`] paired with `listener`.
pub fn spawn_follower(
    updater: Updater,
    listener: Listener,
    config: &UpdaterConfig,
) -> Result<FollowerHandle> {
    let follower = Follower::new(updater, listener, config);

    let thread = thread::Builder::new()
        .name("picklejson-follower".to_string())
        .spawn(move || -> Result<FollowStats> {
            let rt = tokio::runtime::Builder::new_current_thread()
                .enable_all()
                .build()?;
            rt.block_on(follower.run())
        })?;

    Ok(FollowerHandle { thread })
}

// =============================================================================
// Tests
// =============================================================================
