//! # Updater Configuration
//!
//! One explicit [`UpdaterConfig`] is built at process start (from the
//! command line in `json-updater`, directly in tests) and passed by
//! reference to the batch engine and the follow driver. Nothing reads
//! configuration from global state.

use std::path::PathBuf;
use std::time::Duration;

use regex::Regex;

use crate::error::{Error, Result};
use crate::transform;

// =============================================================================
// Defaults
// =============================================================================

/// Default wait for a change notification before polling anyway.
pub const DEFAULT_POLL_TIMEOUT_SECS: u64 = 30;

/// Default number of prepared rows after which a cycle halts at the next
/// version boundary.
///
/// Transactions can exceed this by up to one version's worth of rows.
pub const DEFAULT_TRANSACTION_SIZE_LIMIT: usize = 100_000;

/// Default rows per bulk upsert statement.
///
/// Bounds memory and statement size; unrelated to transaction size.
pub const DEFAULT_PAGE_SIZE: usize = 100;

/// Classes whose records never reach the projection: B-tree buckets and
/// blob records carry no searchable state.
pub const DEFAULT_SKIP_CLASSES: &str = "BTrees[.]|ZODB.blob";

/// Failed cycles in a row after which the follow loop gives up.
pub const DEFAULT_MAX_CONSECUTIVE_FAILURES: u32 = 5;

/// Default interval between checks for commits by other connections.
pub const DEFAULT_WATCH_INTERVAL_MS: u64 = 500;

/// Default `tracing` filter directive.
pub const DEFAULT_LOG_FILTER: &str = "info";

// =============================================================================
// UpdaterConfig
// =============================================================================

/// Configuration for the batch engine and follow driver.
#[derive(Debug, Clone)]
pub struct UpdaterConfig {
    /// SQLite database holding both the log and the projection.
    pub database: PathBuf,

    /// How long the follow loop waits for a notification before running a
    /// cycle anyway.
    pub poll_timeout: Duration,

    /// Prepared-row count after which a cycle halts at a version boundary.
    pub transaction_size_limit: usize,

    /// Rows per bulk upsert.
    pub page_size: usize,

    /// Class-name pattern for records to drop, matched at the start of the
    /// name. `None` keeps every record.
    pub skip_classes: Option<String>,

    /// Name of a built-in state transformation, see [`transform::builtin`].
    pub transformation: Option<String>,

    /// Reprocess `(0, watermark]` instead of following new versions.
    pub redo: bool,

    /// Consecutive failed cycles tolerated by the follow loop.
    pub max_consecutive_failures: u32,

    /// How often the change watcher checks the database for commits by
    /// other connections. `None` leaves waking to notifications sent
    /// in-process and the poll timeout.
    pub watch_interval: Option<Duration>,

    /// `tracing` filter directive, or a bare level name.
    pub log_filter: String,
}

impl Default for UpdaterConfig {
    fn default() -> Self {
        Self {
            database: PathBuf::from("picklejson.db"),
            poll_timeout: Duration::from_secs(DEFAULT_POLL_TIMEOUT_SECS),
            transaction_size_limit: DEFAULT_TRANSACTION_SIZE_LIMIT,
            page_size: DEFAULT_PAGE_SIZE,
            skip_classes: Some(DEFAULT_SKIP_CLASSES.to_string()),
            transformation: None,
            redo: false,
            max_consecutive_failures: DEFAULT_MAX_CONSECUTIVE_FAILURES,
            watch_interval: Some(Duration::from_millis(DEFAULT_WATCH_INTERVAL_MS)),
            log_filter: DEFAULT_LOG_FILTER.to_string(),
        }
    }
}

impl UpdaterConfig {
    /// Default configuration for the database at `path`.
    pub fn new(database: impl Into<PathBuf>) -> Self {
        Self {
            database: database.into(),
            ..Self::default()
        }
    }

    /// Sets how long the follower waits for a notification.
    pub fn with_poll_timeout(mut self, timeout: Duration) -> Self {
        self.poll_timeout = timeout;
        self
    }

    /// Sets the row count past which a cycle halts at the next version.
    pub fn with_transaction_size_limit(mut self, limit: usize) -> Self {
        self.transaction_size_limit = limit;
        self
    }

    /// Sets the rows per bulk upsert statement.
    pub fn with_page_size(mut self, page_size: usize) -> Self {
        self.page_size = page_size;
        self
    }

    /// Sets the class-name skip pattern; `None` skips nothing.
    pub fn with_skip_classes(mut self, pattern: Option<&str>) -> Self {
        self.skip_classes = pattern.map(str::to_string);
        self
    }

    /// Selects a built-in state transformation by name.
    pub fn with_transformation(mut self, name: Option<&str>) -> Self {
        self.transformation = name.map(str::to_string);
        self
    }

    /// Reprocesses `(0, watermark]` and exits instead of following.
    pub fn with_redo(mut self, redo: bool) -> Self {
        self.redo = redo;
        self
    }

    /// Sets how many failed cycles in a row end the follow loop.
    pub fn with_max_consecutive_failures(mut self, failures: u32) -> Self {
        self.max_consecutive_failures = failures;
        self
    }

    /// Sets the change-watcher poll period; `None` disables it.
    pub fn with_watch_interval(mut self, interval: Option<Duration>) -> Self {
        self.watch_interval = interval;
        self
    }

    /// Sets the tracing filter directive.
    pub fn with_log_filter(mut self, filter: impl Into<String>) -> Self {
        self.log_filter = filter.into();
        self
    }

    /// Compiles the skip pattern, anchored at the start of the class name.
    pub fn skip_regex(&self) -> Result<Option<Regex>> {
        self.skip_classes
            .as_deref()
            .map(|pattern| {
                Regex::new(&format!("^(?:{pattern})"))
                    .map_err(|e| Error::Config(format!("invalid skip pattern {pattern:?}: {e}")))
            })
            .transpose()
    }

    /// Rejects settings the engine cannot run with.
    pub fn validate(&self) -> Result<()> {
        if self.transaction_size_limit == 0 {
            return Err(Error::Config(
                "transaction size limit must be positive".to_string(),
            ));
        }
        if self.page_size == 0 {
            return Err(Error::Config("page size must be positive".to_string()));
        }
        if self.poll_timeout.is_zero() {
            return Err(Error::Config("poll timeout must be positive".to_string()));
        }
        if self.max_consecutive_failures == 0 {
            return Err(Error::Config(
                "max consecutive failures must be positive".to_string(),
            ));
        }
        if self.watch_interval.is_some_and(|interval| interval.is_zero()) {
            return Err(Error::Config("watch interval must be positive".to_string()));
        }
        self.skip_regex()?;
        if let Some(name) = &self.transformation {
            transform::builtin(name)?;
        }
        Ok(())
    }
}
