//! # Error Handling for picklejson
//!
//! This module defines the error type used throughout the crate. A single
//! error enum ([`Error`]) represents every failure mode, from a malformed
//! opcode in one record to a lost database connection.
//!
//! ## Rust Pattern: thiserror
//!
//! We use the `thiserror` crate to derive `std::error::Error` implementations:
//! - `Display` comes from the `#[error(...)]` attributes
//! - `From` conversions come from the `#[from]` attributes, so `?` works on
//!   `rusqlite`, `serde_json` and I/O errors
//!
//! ## Error Categories
//!
//! | Category | Variants | Typical Response |
//! |----------|----------|------------------|
//! | Decode | `Truncated`, `UnknownOpcode`, `Malformed`, `Unrepresentable` | Log, drop the record, keep going |
//! | Hook | `Transform` | Same as decode: record-level failure |
//! | Infrastructure | `Sqlite`, `Io`, `Channel` | Roll back the cycle, retry on next wake |
//! | Setup | `Schema`, `Config`, `Json` | Fix the deployment |
//!
//! Record-level errors never stop the pipeline; only infrastructure errors
//! propagate out of the batch engine.

use thiserror::Error;

// =============================================================================
// Error Type
// =============================================================================

/// All errors that can occur in picklejson operations.
#[derive(Error, Debug)]
pub enum Error {
    // =========================================================================
    // Decode Errors (fatal for one record only)
    // =========================================================================

    /// The stream ended before an opcode's operand could be read.
    ///
    /// # When This Happens
    ///
    /// A length prefix claims more bytes than remain, a newline-terminated
    /// operand has no newline, or the stream stops in the middle of a value.
    #[error("truncated pickle: needed {needed} more bytes at offset {offset}")]
    Truncated {
        /// Offset of the read that failed.
        offset: usize,
        /// Number of bytes the read required (1 for a missing newline).
        needed: usize,
    },

    /// An opcode byte outside the supported subset.
    #[error("unknown opcode 0x{opcode:02x} at offset {offset}")]
    UnknownOpcode {
        /// The offending byte.
        opcode: u8,
        /// Offset of the opcode byte.
        offset: usize,
    },

    /// A structurally invalid stream: stack underflow, missing mark, an
    /// unknown memo key, a bad literal, or an operand of the wrong kind.
    #[error("malformed pickle at offset {offset}: {reason}")]
    Malformed {
        /// Offset of the opcode being executed.
        offset: usize,
        /// Human-readable description.
        reason: String,
    },

    /// The decoded graph cannot be rendered as canonical JSON: a cycle that
    /// never went through the memo, or nesting deeper than the reducer allows.
    #[error("value cannot be represented as JSON: {0}")]
    Unrepresentable(String),

    // =========================================================================
    // Hook Errors
    // =========================================================================

    /// The user-supplied state transformation failed.
    ///
    /// The hook is trusted code; its failures are not retried and are handled
    /// exactly like a decode failure for that record.
    #[error("state transformation failed for object {zoid}: {message}")]
    Transform {
        /// Object id of the record being transformed.
        zoid: i64,
        /// The hook's error message.
        message: String,
    },

    // =========================================================================
    // Infrastructure Errors
    // =========================================================================

    /// SQLite operation failed.
    ///
    /// # Rust Pattern: #[from]
    ///
    /// The `#[from]` attribute generates `impl From<rusqlite::Error> for Error`,
    /// which lets the `?` operator convert rusqlite errors automatically.
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    /// JSON (de)serialization failed.
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    /// File system or thread spawning failed.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// The notification channel or follower thread is gone.
    #[error("channel error: {0}")]
    Channel(String),

    /// Schema version mismatch or a missing watermark row.
    #[error("schema error: {0}")]
    Schema(String),

    /// Invalid configuration (zero limits, bad skip pattern, unknown hook).
    #[error("configuration error: {0}")]
    Config(String),
}

impl Error {
    /// Builds a [`Error::Malformed`] at `offset`.
    pub fn malformed(offset: usize, reason: impl Into<String>) -> Self {
        Error::Malformed {
            offset,
            reason: reason.into(),
        }
    }

    /// Returns true for errors caused by the content of one pickle.
    ///
    /// These are the errors the batch engine logs and skips; everything else
    /// aborts the current cycle.
    pub fn is_decode(&self) -> bool {
        matches!(
            self,
            Error::Truncated { .. }
                | Error::UnknownOpcode { .. }
                | Error::Malformed { .. }
                | Error::Unrepresentable(_)
        )
    }

    /// Returns true for errors confined to a single record.
    pub fn is_record_level(&self) -> bool {
        self.is_decode() || matches!(self, Error::Transform { .. })
    }
}

// =============================================================================
// Result Type Alias
// =============================================================================

/// A `Result` type alias using [`Error`] as the error type.
pub type Result<T> = std::result::Result<T, Error>;

// =============================================================================
// Tests
// =============================================================================
