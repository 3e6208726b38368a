//! Log positions.
//!
//! A [`LogAnchor`] names a byte-exact position in the log stream: the segment file
//! number, the byte offset of a frame within that segment, and the LSN of the record
//! stored there.
//!
//! ## Ordering
//!
//! The LSN is canonical. File number and offset are a physical locator that the
//! engine keeps consistent with LSN order by construction (LSNs are allocated in
//! append order, and appends only move forward through segments). `Ord` therefore
//! compares `lsn` first and only uses `(file_number, file_offset)` to break ties, which
//! matters only for anchors whose LSN is still `UNKNOWN_LSN`.

use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::fmt;

/// Reserved LSN meaning "not yet assigned" (or, for `sync`, "everything buffered").
pub const UNKNOWN_LSN: i64 = i64::MIN;

/// A (file number, file offset, LSN) position in the log.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct LogAnchor {
    file_number: u64,
    file_offset: u64,
    lsn: i64,
}

impl LogAnchor {
    /// The minimum position: file 0, offset 0, unknown LSN.
    pub const MIN: LogAnchor = LogAnchor {
        file_number: 0,
        file_offset: 0,
        lsn: UNKNOWN_LSN,
    };

    /// Create an anchor.
    pub const fn new(file_number: u64, file_offset: u64, lsn: i64) -> Self {
        Self {
            file_number,
            file_offset,
            lsn,
        }
    }

    /// A physical position with no LSN attached.
    pub const fn at(file_number: u64, file_offset: u64) -> Self {
        Self::new(file_number, file_offset, UNKNOWN_LSN)
    }

    /// Segment file number.
    pub fn file_number(&self) -> u64 {
        self.file_number
    }

    /// Byte offset within the segment.
    pub fn file_offset(&self) -> u64 {
        self.file_offset
    }

    /// Log sequence number (`UNKNOWN_LSN` if unassigned).
    pub fn lsn(&self) -> i64 {
        self.lsn
    }

    /// Whether an LSN has been assigned.
    pub fn has_lsn(&self) -> bool {
        self.lsn != UNKNOWN_LSN
    }

    /// Same position, different LSN.
    #[must_use]
    pub fn with_lsn(self, lsn: i64) -> Self {
        Self { lsn, ..self }
    }

    /// Compare physical locators only.
    pub fn cmp_position(&self, other: &Self) -> Ordering {
        (self.file_number, self.file_offset).cmp(&(other.file_number, other.file_offset))
    }
}

impl Default for LogAnchor {
    fn default() -> Self {
        Self::MIN
    }
}

impl Ord for LogAnchor {
    fn cmp(&self, other: &Self) -> Ordering {
        self.lsn
            .cmp(&other.lsn)
            .then_with(|| self.cmp_position(other))
    }
}

impl PartialOrd for LogAnchor {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl fmt::Display for LogAnchor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.has_lsn() {
            write!(f, "{}:{}@{}", self.file_number, self.file_offset, self.lsn)
        } else {
            write!(f, "{}:{}@?", self.file_number, self.file_offset)
        }
    }
}
