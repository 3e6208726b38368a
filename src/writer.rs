//! LSN allocation and the write buffer.
//!
//! `LogWriter` owns the active (highest-numbered) segment. It hands out LSNs in
//! append order, frames records into an in-memory buffer and drains that buffer to
//! the segment file once it reaches `buffer_limit` (or when asked).
//!
//! Positions are assigned at append time: a record's offset is the end of the file
//! plus whatever is already buffered, which is where the bytes will land when the
//! buffer drains. After each drain the writer publishes a write mark so scanners of
//! the live segment stop at the last fully written frame.
//!
//! The writer is not internally synchronized; `Log` keeps it behind a mutex.

use crate::anchor::{LogAnchor, UNKNOWN_LSN};
use crate::error::{LogError, LogResult};
use crate::formats::{FIRST_FILE_NUMBER, FIRST_LSN, MAX_RECORD_BYTES};
use crate::record::{RecordFrame, UserLogRecord};
use crate::recover::RecoveredTail;
use crate::segment::{SegmentHeader, SegmentStore, SegmentTracker};
use std::io::Write;
use std::sync::Arc;
use tracing::{debug, error, info};

/// Outcome of one append.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Appended {
    pub(crate) anchor: LogAnchor,
    /// The append started a new segment.
    pub(crate) rolled_over: bool,
}

pub(crate) struct LogWriter {
    store: SegmentStore,
    tracker: Arc<SegmentTracker>,
    file_number: u64,
    /// Bytes already handed to the segment file.
    file_offset: u64,
    file: Option<Box<dyn Write + Send>>,
    buffer: Vec<u8>,
    buffer_limit: usize,
    soft_limit: u64,
    next_lsn: i64,
    /// Highest LSN sitting in `buffer`.
    buffered_lsn: i64,
    /// Highest LSN handed to a segment file.
    written_lsn: i64,
    /// Set when a drain or rollover left the file in an unknown state.
    failed: Option<String>,
}

impl LogWriter {
    /// Resume appending after `tail`, or start a fresh log when there is none.
    pub(crate) fn open(
        store: SegmentStore,
        tracker: Arc<SegmentTracker>,
        tail: Option<&RecoveredTail>,
        buffer_limit: usize,
        soft_limit: u64,
    ) -> LogResult<Self> {
        let (file_number, file_offset, next_lsn, written_lsn, file) = match tail {
            Some(t) => (
                t.file_number,
                t.valid_len,
                t.next_lsn,
                t.last_lsn.unwrap_or(UNKNOWN_LSN),
                store.open_append(t.file_number)?,
            ),
            None => {
                let file = store.create(FIRST_FILE_NUMBER, FIRST_LSN)?;
                info!(file_number = FIRST_FILE_NUMBER, "created first log segment");
                (
                    FIRST_FILE_NUMBER,
                    SegmentHeader::SIZE as u64,
                    FIRST_LSN,
                    UNKNOWN_LSN,
                    file,
                )
            }
        };
        tracker.set_write_mark(file_number, file_offset)?;

        Ok(Self {
            store,
            tracker,
            file_number,
            file_offset,
            file: Some(file),
            buffer: Vec::with_capacity(buffer_limit),
            buffer_limit,
            soft_limit,
            next_lsn,
            buffered_lsn: written_lsn,
            written_lsn,
            failed: None,
        })
    }

    /// Number of the active segment.
    pub(crate) fn file_number(&self) -> u64 {
        self.file_number
    }

    /// Highest LSN handed to a segment file (`UNKNOWN_LSN` if none).
    pub(crate) fn written_lsn(&self) -> i64 {
        self.written_lsn
    }

    /// LSN the next append receives.
    pub(crate) fn next_lsn(&self) -> i64 {
        self.next_lsn
    }

    fn check_usable(&self) -> LogResult<()> {
        match &self.failed {
            Some(reason) => Err(LogError::InvalidState(format!(
                "log writer failed earlier ({reason}); reopen the log"
            ))),
            None if self.file.is_none() => Err(LogError::Closed),
            None => Ok(()),
        }
    }

    /// Frame `record` into the buffer, rolling over first if the segment is full.
    pub(crate) fn append(&mut self, record: &UserLogRecord) -> LogResult<Appended> {
        self.check_usable()?;
        let len = record.valid_length();
        if len > MAX_RECORD_BYTES {
            return Err(LogError::RecordTooLarge {
                len,
                max: MAX_RECORD_BYTES,
            });
        }

        // A record is never split; a segment that already holds a record rolls over
        // instead of growing past the soft limit.
        let frame_len = RecordFrame::encoded_len(len) as u64;
        let pending = self.file_offset + self.buffer.len() as u64;
        let mut rolled_over = false;
        if pending + frame_len > self.soft_limit && pending > SegmentHeader::SIZE as u64 {
            self.roll_over()?;
            rolled_over = true;
        }

        let offset = self.file_offset + self.buffer.len() as u64;
        let anchor = LogAnchor::new(self.file_number, offset, self.next_lsn);
        RecordFrame::encode_into(record, anchor, &mut self.buffer)?;
        self.next_lsn += 1;
        self.buffered_lsn = anchor.lsn();

        if self.buffer.len() >= self.buffer_limit {
            self.drain()?;
        }
        Ok(Appended {
            anchor,
            rolled_over,
        })
    }

    /// Hand buffered bytes to the segment file. Returns the highest written LSN.
    ///
    /// This is a visibility boundary, not a durability one.
    pub(crate) fn drain(&mut self) -> LogResult<i64> {
        self.check_usable()?;
        if self.buffer.is_empty() {
            return Ok(self.written_lsn);
        }
        let Some(file) = self.file.as_mut() else {
            return Err(LogError::Closed);
        };
        // A failed write may have left part of a frame in the file; nothing more may be
        // appended behind it in this process.
        if let Err(e) = file.write_all(&self.buffer).and_then(|_| file.flush()) {
            error!(file_number = self.file_number, error = %e, "segment write failed");
            self.failed = Some(e.to_string());
            return Err(e.into());
        }
        self.file_offset += self.buffer.len() as u64;
        self.buffer.clear();
        self.written_lsn = self.buffered_lsn;
        self.tracker
            .set_write_mark(self.file_number, self.file_offset)?;
        Ok(self.written_lsn)
    }

    /// Seal the active segment and start the next one.
    pub(crate) fn roll_over(&mut self) -> LogResult<()> {
        self.drain()?;
        let sealed = self.file_number;
        let next = sealed + 1;
        let result = self
            .store
            .sync(sealed)
            .and_then(|_| self.store.create(next, self.next_lsn));
        match result {
            Ok(file) => {
                self.file = Some(file);
                self.file_number = next;
                self.file_offset = SegmentHeader::SIZE as u64;
                self.tracker.set_write_mark(next, self.file_offset)?;
                info!(sealed, file_number = next, start_lsn = self.next_lsn, "rolled over log segment");
                Ok(())
            }
            Err(e) => {
                error!(sealed, error = %e, "log segment rollover failed");
                self.failed = Some(e.to_string());
                Err(e)
            }
        }
    }

    /// Refuse further appends and drains. Used when a barrier failed and the state
    /// of the written bytes on stable storage is unknown.
    pub(crate) fn mark_failed(&mut self, reason: String) {
        self.failed.get_or_insert(reason);
    }

    /// Drain and release the segment file. Further appends return `Closed`.
    pub(crate) fn close(&mut self) -> LogResult<i64> {
        if self.file.is_none() {
            return Ok(self.written_lsn);
        }
        let written = if self.failed.is_none() {
            self.drain()?
        } else {
            self.written_lsn
        };
        self.file = None;
        debug!(file_number = self.file_number, written, "log writer closed");
        Ok(written)
    }
}
