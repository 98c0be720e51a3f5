//! # picklejson - JSON Projection of a Pickle Object Log
//!
//! picklejson keeps a queryable JSON copy of an object database whose states
//! are stored as pickles. It provides:
//!
//! - **A pickle decoder**: a stack machine over the opcodes object databases
//!   emit, with a memo heap that survives shared and cyclic references
//! - **Canonical JSON**: tagged markers for bytes, globals, persistent
//!   references, instances and (only when needed) shared/back-references
//! - **Watermarked batching**: version-ordered catch-up in bounded
//!   transactions that never split a version
//! - **Live follow**: notification-driven catch-up with timeout polling
//!
//! ## Architecture Overview
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                     object_state (log)                          │
//! │              (tid, zoid, class pickle + state pickle)           │
//! └─────────────────────────────┬───────────────────────────────────┘
//!                               │ tid > watermark, tid order
//!                               ▼
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                    Updater (single writer)                      │
//! │                                                                 │
//! │  ┌─────────────┐  ┌─────────────┐  ┌─────────────────────────┐ │
//! │  │  Machine +  │  │   Reduce    │  │  SAVEPOINT bulk upsert  │ │
//! │  │  memo Heap  │─►│ to JSON     │─►│  + watermark, 1 txn     │ │
//! │  └─────────────┘  └─────────────┘  └─────────────────────────┘ │
//! └─────────────────────────────┬───────────────────────────────────┘
//!                               │
//!                               ▼
//! ┌─────────────────────────────────────────────────────────────────┐
//! │           object_json (projection) + object_json_tid            │
//! └─────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Core Invariants
//!
//! 1. **Whole versions**: a transaction applies every record of a version
//!    or none of them
//! 2. **Atomic watermark**: the watermark commits with the rows it covers
//!    and never decreases
//! 3. **Bad records don't block**: decode failures, skipped classes and
//!    failed rows are dropped and the watermark moves past them
//! 4. **Idempotent replay**: rows are upserted by object id
//!
//! ## Module Organization
//!
//! - [`error`]: The crate-wide error type
//! - [`types`]: Versions, object ids, records and rows
//! - [`opcode`], [`literal`], [`value`], [`machine`]: pickle decoding
//! - [`reduce`]: Value tree to canonical JSON
//! - [`convert`], [`transform`]: Record to projection row
//! - [`schema`], [`source`], [`reader`]: SQLite storage
//! - [`updater`]: Batch/watermark engine
//! - [`follow`]: Notification channel and follow loop
//! - [`config`]: Updater configuration

// =============================================================================
// Module Declarations
// =============================================================================

/// Error types for picklejson operations.
pub mod error;

/// Domain types: versions, object ids, log records, projection rows.
pub mod types;

/// Pickle opcodes and the byte → opcode dispatch table.
pub mod opcode;

/// Decoders for the textual and packed literals inside pickles.
pub mod literal;

/// Values produced by the stack machine and the memo heap they live in.
pub mod value;

/// The pickle stack machine.
///
/// One [`Machine`](machine::Machine) decodes consecutive pickles from one
/// buffer, sharing a memo heap between them.
pub mod machine;

/// Reduction of decoded values to canonical JSON.
///
/// Tries a plain rendering first and falls back to shared/ref markers only
/// when the value graph is cyclic.
pub mod reduce;

/// Conversion of log records to projection rows.
pub mod convert;

/// State transformation hooks.
pub mod transform;

/// SQLite schema definitions and database initialization.
pub mod schema;

/// Reads and appends on the upstream object log.
pub mod source;

/// Read operations on the projection.
pub mod reader;

/// Batch/watermark engine.
///
/// Applies the log to the projection in bounded transactions, using
/// SAVEPOINTs so one bad row never takes down its batch.
pub mod updater;

/// Live-follow driver.
///
/// Waits for change notifications (or a poll timeout) on a dedicated thread
/// and runs the batch engine after each wake.
pub mod follow;

/// Updater configuration.
pub mod config;

#[doc(hidden)]
pub mod test_support;

// =============================================================================
// Re-exports
// =============================================================================

pub use config::UpdaterConfig;
pub use convert::{class_name_from_pickle, scrub_surrogates, Conversion, RecordConverter};
pub use error::{Error, Result};
pub use follow::{channel, spawn_follower, FollowStats, Follower, FollowerHandle, Listener, Notifier, Wake};
pub use schema::Database;
pub use transform::{StateTransform, Transformed};
pub use types::{ObjectId, ProjectionRow, Record, Version, VersionRange};
pub use updater::{CycleOutcome, CycleReport, Updater};
