//! # Domain Types for picklejson
//!
//! This module defines the types that flow through the pipeline: log
//! positions, object ids, raw log records and the projection rows derived
//! from them.
//!
//! ## Design Philosophy: Newtypes for Safety
//!
//! Versions and object ids are both 64-bit integers in the database. Wrapping
//! them in distinct types means a `Version` can never be passed where an
//! `ObjectId` is expected:
//!
//! ```rust
//! use picklejson::types::{ObjectId, Version};
//!
//! fn example(version: Version, zoid: ObjectId) {
//!     // version == zoid  // Won't compile
//! }
//! ```
//!
//! ## Invariants
//!
//! - [`Version`]: log positions are totally ordered; the watermark only moves
//!   forward
//! - [`ProjectionRow`]: one row per [`ObjectId`], replaced wholesale on update

use std::fmt;

// =============================================================================
// Log Positions
// =============================================================================

/// A position in the upstream object log (a transaction id).
///
/// Many records may share one version; the batch engine never splits a
/// version across two transactions.
///
/// # Storage
///
/// Stored as INTEGER in SQLite (8 bytes, signed).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct Version(i64);

impl Version {
    /// The position before any record. A fresh projection starts here.
    pub const ZERO: Version = Version(0);

    /// Creates a version from its raw database value.
    pub fn from_raw(value: i64) -> Self {
        Self(value)
    }

    /// Returns the raw value for database storage.
    pub fn as_raw(&self) -> i64 {
        self.0
    }
}

impl fmt::Display for Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// The half-open range of versions a catch-up cycle reads: `(after, until]`.
///
/// `until = None` means "up to the current head of the log".
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VersionRange {
    /// Exclusive lower bound (normally the watermark).
    pub after: Version,
    /// Inclusive upper bound, if any.
    pub until: Option<Version>,
}

impl VersionRange {
    /// Everything after `after`.
    pub fn after(after: Version) -> Self {
        Self { after, until: None }
    }

    /// Versions in `(after, until]`.
    pub fn between(after: Version, until: Version) -> Self {
        Self {
            after,
            until: Some(until),
        }
    }

    /// The same upper bound, starting after a new position.
    pub fn resume_after(&self, after: Version) -> Self {
        Self {
            after,
            until: self.until,
        }
    }

    /// Returns true when no version can satisfy the range.
    pub fn is_empty(&self) -> bool {
        matches!(self.until, Some(until) if until <= self.after)
    }
}

// =============================================================================
// Object Identification
// =============================================================================

/// The identifier of a persistent object (the projection's primary key).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ObjectId(i64);

impl ObjectId {
    /// Creates an object id from its raw database value.
    pub fn from_raw(value: i64) -> Self {
        Self(value)
    }

    /// Returns the raw value for database storage.
    pub fn as_raw(&self) -> i64 {
        self.0
    }
}

impl fmt::Display for ObjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

// =============================================================================
// Records and Rows
// =============================================================================

/// One row of the upstream log: a serialized object state at a version.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Record {
    /// Log position of the state change.
    pub version: Version,
    /// Object the state belongs to.
    pub zoid: ObjectId,
    /// Two concatenated pickles: the class descriptor, then the state.
    pub state: Vec<u8>,
}

impl Record {
    /// Creates a record.
    pub fn new(version: Version, zoid: ObjectId, state: impl Into<Vec<u8>>) -> Self {
        Self {
            version,
            zoid,
            state: state.into(),
        }
    }
}

/// A converted record, ready to upsert into the projection table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProjectionRow {
    /// Primary key.
    pub zoid: ObjectId,
    /// Flat class name derived from the descriptor.
    pub class_name: String,
    /// The descriptor pickle, byte-for-byte as it appeared in the record.
    pub class_pickle: Vec<u8>,
    /// Canonical JSON text of the state.
    pub state: String,
}

/// A projection row tagged with the log version it came from.
///
/// The version is not stored; it exists so per-row failures can be logged
/// with their log position.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PreparedRow {
    /// Version of the record the row came from.
    pub version: Version,
    /// The row itself.
    pub row: ProjectionRow,
}

// =============================================================================
// Tests
// =============================================================================
