//! Log configuration.
//!
//! Loading the configuration (file, environment, flags) belongs to the embedding
//! service; `LogConfig` is `serde`-friendly so it can be nested in that service's own
//! config structure.

use crate::error::{LogError, LogResult};
use crate::record::RecordFrame;
use crate::segment::SegmentHeader;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Default write-buffer size in bytes.
pub const DEFAULT_BUFFER_SIZE: usize = 64 * 1024; // 64 KiB
/// Default soft per-segment size limit in bytes.
pub const DEFAULT_SOFT_FILE_SIZE_LIMIT: u64 = 16 * 1024 * 1024; // 16 MiB

/// Initialization parameters for a [`crate::log::Log`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LogConfig {
    /// Directory holding the segment files.
    pub path: PathBuf,
    /// File-name suffix for segment files (`log_<n>.<suffix>`).
    pub suffix: String,
    /// Write-buffer size in bytes. `0` disables buffering: every `log()` call is
    /// flushed and synced as if `sync` were requested.
    pub buffer_size: usize,
    /// Soft per-segment size limit in bytes. A record is never split across
    /// segments, so a segment may exceed this by at most one record.
    pub soft_file_size_limit: u64,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("data/txnlog"),
            suffix: "log".to_string(),
            buffer_size: DEFAULT_BUFFER_SIZE,
            soft_file_size_limit: DEFAULT_SOFT_FILE_SIZE_LIMIT,
        }
    }
}

impl LogConfig {
    /// Configuration rooted at `path` with default sizes.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            ..Default::default()
        }
    }

    /// Sets the segment file suffix.
    #[must_use]
    pub fn with_suffix(mut self, suffix: impl Into<String>) -> Self {
        self.suffix = suffix.into();
        self
    }

    /// Sets the write-buffer size.
    #[must_use]
    pub fn with_buffer_size(mut self, bytes: usize) -> Self {
        self.buffer_size = bytes;
        self
    }

    /// Sets the soft segment size limit.
    #[must_use]
    pub fn with_soft_file_size_limit(mut self, bytes: u64) -> Self {
        self.soft_file_size_limit = bytes;
        self
    }

    /// Smallest soft limit that can hold a header and one empty record.
    pub fn min_soft_file_size_limit() -> u64 {
        (SegmentHeader::SIZE + RecordFrame::OVERHEAD) as u64
    }

    /// Check the configuration for values the log cannot work with.
    pub fn validate(&self) -> LogResult<()> {
        if self.suffix.is_empty() {
            return Err(LogError::InvalidConfig("suffix must not be empty".into()));
        }
        if !self
            .suffix
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
        {
            return Err(LogError::InvalidConfig(format!(
                "suffix {:?} may only contain ASCII letters, digits, '_' and '-'",
                self.suffix
            )));
        }
        let min = Self::min_soft_file_size_limit();
        if self.soft_file_size_limit < min {
            return Err(LogError::InvalidConfig(format!(
                "soft_file_size_limit {} is below the minimum of {min} bytes",
                self.soft_file_size_limit
            )));
        }
        Ok(())
    }
}
