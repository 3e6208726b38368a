//! Error types for `txnlog`.

use std::path::PathBuf;

/// Result type for log operations.
pub type LogResult<T> = Result<T, LogError>;

/// Errors returned by the `txnlog` crate.
#[derive(thiserror::Error, Debug)]
pub enum LogError {
    /// I/O error (permission, disk full, device error).
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    /// A framed record is internally inconsistent at a known position.
    #[error("corrupt log at file {file_number} offset {offset}: {reason}")]
    Corrupt {
        /// Segment file number holding the bad frame.
        file_number: u64,
        /// Byte offset of the bad frame within that segment.
        offset: u64,
        /// Human-readable description of the inconsistency.
        reason: String,
    },

    /// Format error (bad magic, unsupported version, malformed header).
    #[error("format error: {0}")]
    Format(String),

    /// CRC mismatch (data corruption detected).
    #[error("crc mismatch (expected {expected:#010x}, got {actual:#010x})")]
    CrcMismatch {
        /// CRC stored in the file/record.
        expected: u32,
        /// CRC computed from the bytes that were read.
        actual: u32,
    },

    /// Encoding error.
    #[error("encode error: {0}")]
    Encode(String),

    /// Decoding error.
    #[error("decode error: {0}")]
    Decode(String),

    /// `sync` was asked to flush through an LSN that `log` never issued.
    #[error("lsn {requested} was never issued (last issued: {last_issued})")]
    InvalidLsn {
        /// The LSN passed by the caller.
        requested: i64,
        /// The highest LSN handed out so far.
        last_issued: i64,
    },

    /// The record payload exceeds the per-record cap.
    #[error("record too large: {len} bytes (max {max})")]
    RecordTooLarge {
        /// Payload length in bytes.
        len: usize,
        /// Maximum accepted payload length.
        max: usize,
    },

    /// The caller handed in a malformed record (e.g. `valid_length` beyond the buffer).
    #[error("invalid record: {0}")]
    InvalidRecord(String),

    /// Invalid state (operation not allowed in current state).
    #[error("invalid state: {0}")]
    InvalidState(String),

    /// Invalid configuration.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// Operation not supported by the storage backend.
    #[error("operation not supported: {0}")]
    NotSupported(String),

    /// Lock acquisition failed (poisoned lock).
    #[error("lock failed on {resource}: {reason}")]
    LockFailed {
        /// What we were trying to lock.
        resource: String,
        /// Human-readable reason.
        reason: String,
    },

    /// Resource not found (file/segment/etc).
    #[error("not found: {0}")]
    NotFound(String),

    /// Requested path does not exist.
    #[error("missing path: {0}")]
    MissingPath(PathBuf),

    /// The log was closed.
    #[error("log is closed")]
    Closed,
}

impl LogError {
    /// Whether this error reports on-disk corruption rather than an operational failure.
    pub fn is_corruption(&self) -> bool {
        matches!(
            self,
            LogError::Corrupt { .. }
                | LogError::Format(_)
                | LogError::CrcMismatch { .. }
                | LogError::Decode(_)
        )
    }

    pub(crate) fn corrupt(file_number: u64, offset: u64, reason: impl Into<String>) -> Self {
        LogError::Corrupt {
            file_number,
            offset,
            reason: reason.into(),
        }
    }

    pub(crate) fn poisoned(resource: &str) -> Self {
        LogError::LockFailed {
            resource: resource.to_string(),
            reason: "lock poisoned".to_string(),
        }
    }
}
