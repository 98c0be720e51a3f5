//! json-updater - keeps the JSON projection in step with the object log
//!
//! Catches up from the stored watermark, then follows new versions until
//! interrupted. With `--redo` it reconverts everything at or below the
//! watermark and exits.
//!
//! # Examples
//!
//! ```bash
//! # Follow with defaults
//! json-updater objects.db
//!
//! # Smaller transactions, debug logging
//! json-updater objects.db -m 10000 -l debug
//!
//! # Reconvert after enabling a transformation
//! json-updater objects.db -x cached-data --redo
//! ```

use std::path::PathBuf;
use std::process::ExitCode;
use std::time::Duration;

use clap::Parser;
use picklejson::config::{
    DEFAULT_LOG_FILTER, DEFAULT_MAX_CONSECUTIVE_FAILURES, DEFAULT_PAGE_SIZE,
    DEFAULT_POLL_TIMEOUT_SECS, DEFAULT_SKIP_CLASSES, DEFAULT_TRANSACTION_SIZE_LIMIT,
    DEFAULT_WATCH_INTERVAL_MS,
};
use picklejson::follow::watch_changes;
use picklejson::{channel, spawn_follower, Error, FollowStats, Result, Updater, UpdaterConfig};
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[derive(Parser, Debug)]
#[command(name = "json-updater")]
#[command(about = "Maintain a JSON projection of pickled object states")]
struct Cli {
    /// SQLite database holding the object log and the projection
    database: PathBuf,

    /// Seconds to wait for a change notification before polling anyway
    #[arg(short = 't', long, default_value_t = DEFAULT_POLL_TIMEOUT_SECS)]
    poll_timeout: u64,

    /// Rows after which a transaction ends at the next version boundary
    #[arg(short = 'm', long, default_value_t = DEFAULT_TRANSACTION_SIZE_LIMIT)]
    transaction_size_limit: usize,

    /// Rows per bulk upsert statement
    #[arg(long, default_value_t = DEFAULT_PAGE_SIZE)]
    page_size: usize,

    /// Class-name pattern of records to leave out; empty keeps everything
    #[arg(long, default_value = DEFAULT_SKIP_CLASSES)]
    skip_classes: String,

    /// Built-in state transformation to apply (e.g. cached-data)
    #[arg(short = 'x', long)]
    transformation: Option<String>,

    /// Reconvert versions up to the watermark, then exit
    #[arg(long)]
    redo: bool,

    /// Failed cycles in a row before giving up
    #[arg(long, default_value_t = DEFAULT_MAX_CONSECUTIVE_FAILURES)]
    max_failures: u32,

    /// Milliseconds between checks for commits by other processes; 0 disables
    #[arg(long, default_value_t = DEFAULT_WATCH_INTERVAL_MS)]
    watch_interval_ms: u64,

    /// Log level or tracing filter directive
    #[arg(short = 'l', long, default_value = DEFAULT_LOG_FILTER)]
    log_level: String,
}

impl Cli {
    fn into_config(self) -> UpdaterConfig {
        let skip = (!self.skip_classes.is_empty()).then_some(self.skip_classes.as_str());
        let watch = (self.watch_interval_ms > 0).then(|| Duration::from_millis(self.watch_interval_ms));

        UpdaterConfig::new(&self.database)
            .with_poll_timeout(Duration::from_secs(self.poll_timeout))
            .with_transaction_size_limit(self.transaction_size_limit)
            .with_page_size(self.page_size)
            .with_skip_classes(skip)
            .with_transformation(self.transformation.as_deref())
            .with_redo(self.redo)
            .with_max_consecutive_failures(self.max_failures)
            .with_watch_interval(watch)
            .with_log_filter(self.log_level.as_str())
    }
}

fn init_tracing(filter: &str) -> Result<()> {
    let filter = EnvFilter::try_new(filter)
        .map_err(|e| Error::Config(format!("invalid log filter {filter:?}: {e}")))?;
    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .init();
    Ok(())
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> ExitCode {
    let config = Cli::parse().into_config();
    if let Err(e) = init_tracing(&config.log_filter) {
        eprintln!("json-updater: {e}");
        return ExitCode::FAILURE;
    }

    match run(config).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!(error = %e, "json-updater failed");
            ExitCode::FAILURE
        }
    }
}

async fn run(config: UpdaterConfig) -> Result<()> {
    config.validate()?;
    let updater = Updater::open(&config)?;

    if config.redo {
        updater.redo()?;
        return Ok(());
    }

    let (notifier, listener) = channel();
    if let Some(interval) = config.watch_interval {
        let watcher = watch_changes(config.database.clone(), interval, notifier.clone());
        tokio::spawn(async move {
            if let Err(e) = watcher.await {
                error!(error = %e, "change watcher failed");
            }
        });
    }

    let follower = spawn_follower(updater, listener, &config)?;
    let mut joined = tokio::task::spawn_blocking(move || follower.join());

    let stats = tokio::select! {
        result = &mut joined => join_result(result)?,
        signal = tokio::signal::ctrl_c() => {
            signal?;
            info!("interrupted, stopping after the current cycle");
            notifier.stop()?;
            join_result(joined.await)?
        }
    };

    info!(
        cycles = stats.cycles,
        notifications = stats.notifications,
        missed = stats.missed_notifications,
        failures = stats.failures,
        watermark = %stats.watermark,
        "updater stopped"
    );
    Ok(())
}

fn join_result(
    result: std::result::Result<Result<FollowStats>, tokio::task::JoinError>,
) -> Result<FollowStats> {
    result.map_err(|e| Error::Channel(format!("follower join failed: {e}")))?
}
