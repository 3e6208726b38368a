//! On-disk format constants.

/// Magic bytes for log segment files.
pub const LOG_MAGIC: [u8; 4] = *b"TXLG";
/// Magic bytes for checkpoint files.
pub const CHECKPOINT_MAGIC: [u8; 4] = *b"TXCK";
/// Current on-disk format version.
pub const FORMAT_VERSION: u32 = 1;

/// Segment file name prefix (`log_<n>.<suffix>`).
pub const SEGMENT_PREFIX: &str = "log_";
/// Name of the persisted min-needed anchor.
pub const CHECKPOINT_FILE: &str = "checkpoint.anchor";

/// File number of the first segment ever created.
pub const FIRST_FILE_NUMBER: u64 = 0;
/// LSN carried by the first record ever logged.
pub const FIRST_LSN: i64 = 0;

/// Hard cap on a single record payload, to avoid unbounded allocations on corrupt logs.
pub const MAX_RECORD_BYTES: usize = 64 * 1024 * 1024; // 64 MiB
