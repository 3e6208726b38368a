//! Forward-only scanning over framed records.
//!
//! A [`LogScanner`] reads segments in file-number order, validating every frame
//! (checksum, trailer anchor, LSN order) before handing it out.
//!
//! ## End of log vs corruption
//!
//! - On the live segment the scanner reads only up to the writer's write mark, so it
//!   never sees a frame that is still being written. Records flushed after a scanner
//!   returned `false` are returned by later calls.
//! - An incomplete or inconsistent frame at the end of the newest segment is a torn
//!   write and ends the scan (`Ok(false)`).
//! - A bad frame inside a sealed segment, or one that is followed by a valid frame,
//!   is reported as `LogError::Corrupt`.
//!
//! While open, a scanner pins the segment it is reading so reclamation cannot delete
//! it. Moving to the next segment pins that one before releasing the current pin.

use crate::anchor::{LogAnchor, UNKNOWN_LSN};
use crate::error::{LogError, LogResult};
use crate::record::{FrameParse, RecordFrame, UserLogRecord};
use crate::segment::{self, SegmentHeader, SegmentStore, SegmentTracker, WriteMark};
use std::sync::Arc;
use tracing::debug;

/// Cursor over the records of a log, in LSN order.
pub struct LogScanner {
    store: SegmentStore,
    tracker: Arc<SegmentTracker>,
    file_number: u64,
    /// Bytes of the current segment, starting at file offset `base`.
    chunk: Vec<u8>,
    base: u64,
    /// Consumed prefix of `chunk`.
    pos: usize,
    /// Records below this LSN are skipped.
    min_lsn: i64,
    /// Records of the start segment before this offset are skipped.
    min_offset: Option<u64>,
    /// `start_lsn` from the header while the segment's first frame is still unread.
    segment_start_lsn: Option<i64>,
    last_lsn: Option<i64>,
    last_good: (u64, u64),
    pinned: Option<u64>,
}

impl std::fmt::Debug for LogScanner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LogScanner")
            .field("file_number", &self.file_number)
            .field("offset", &(self.base + self.pos as u64))
            .field("last_lsn", &self.last_lsn)
            .field("closed", &self.pinned.is_none())
            .finish()
    }
}

impl LogScanner {
    /// Open a scanner at the first record at or after `start`.
    ///
    /// Positions inside reclaimed segments resolve to the oldest retained segment.
    /// Records whose LSN is below `start`'s LSN are skipped. An offset that is not a
    /// frame boundary rescans its segment from the first frame, skipping by LSN, or by
    /// position when `start` carries no LSN.
    pub(crate) fn open(
        store: SegmentStore,
        tracker: Arc<SegmentTracker>,
        start: LogAnchor,
    ) -> LogResult<Self> {
        let header_end = SegmentHeader::SIZE as u64;
        let (file_number, offset) = {
            // Resolve and pin under the pins lock so reclamation cannot race us.
            let mut pins = tracker.lock_pins()?;
            let segments = store.list()?;
            let (Some(&oldest), Some(&newest)) = (segments.first(), segments.last()) else {
                return Err(LogError::NotFound("log has no segments".into()));
            };
            let resolved = if start.file_number() < oldest {
                (oldest, header_end)
            } else if start.file_number() > newest {
                return Err(LogError::NotFound(format!(
                    "scan start {start} is past the newest segment {newest}"
                )));
            } else {
                (start.file_number(), start.file_offset().max(header_end))
            };
            *pins.entry(resolved.0).or_insert(0) += 1;
            resolved
        };

        let mut scanner = Self {
            store,
            tracker,
            file_number,
            chunk: Vec::new(),
            base: offset,
            pos: 0,
            min_lsn: start.lsn(),
            min_offset: None,
            segment_start_lsn: None,
            last_lsn: None,
            last_good: (file_number, offset),
            pinned: Some(file_number),
        };
        let header = scanner.store.read_header(file_number)?;
        if offset > header_end && !frame_boundary(&scanner.store, file_number, offset)? {
            // Not a frame start: rescan the segment and skip up to the requested position.
            debug!(file_number, offset, "scan start is not a frame boundary");
            scanner.base = header_end;
            scanner.last_good = (file_number, header_end);
            if !start.has_lsn() {
                scanner.min_offset = Some(offset);
            }
        }
        if scanner.base == header_end {
            scanner.segment_start_lsn = Some(header.start_lsn);
        }
        debug!(file_number, offset, min_lsn = scanner.min_lsn, "opened log scanner");
        Ok(scanner)
    }

    /// Read the next record into `out`.
    ///
    /// Returns `Ok(false)`, leaving `out` untouched, when no further complete record
    /// exists (end of written data or a torn tail). The payload written into `out`
    /// is only valid until the next call.
    pub fn next_record(&mut self, out: &mut UserLogRecord) -> LogResult<bool> {
        if self.pinned.is_none() {
            return Err(LogError::Closed);
        }
        loop {
            if self.pos < self.chunk.len() {
                let at = self.base + self.pos as u64;
                match RecordFrame::parse_at(&self.chunk[self.pos..], self.file_number, at) {
                    FrameParse::Complete(f) => {
                        let lsn = f.anchor.lsn();
                        let first = self.segment_start_lsn.take();
                        check_frame_lsn(self.file_number, at, first, self.last_lsn, lsn)?;
                        self.pos += f.frame_len;
                        self.last_lsn = Some(lsn);
                        self.last_good = (self.file_number, self.base + self.pos as u64);
                        if (self.min_lsn != UNKNOWN_LSN && lsn < self.min_lsn)
                            || self.min_offset.is_some_and(|min| at < min)
                        {
                            continue;
                        }
                        out.fill_from(&f);
                        return Ok(true);
                    }
                    FrameParse::Incomplete => {}
                    FrameParse::Invalid { reason, .. } => {
                        let rest = &self.chunk[self.pos..];
                        if self.is_sealed()?
                            || segment::valid_frame_after(rest, at, self.file_number)
                        {
                            return Err(LogError::corrupt(self.file_number, at, reason));
                        }
                        debug!(
                            file_number = self.file_number,
                            offset = at,
                            %reason,
                            "scan stopped at torn tail"
                        );
                        return Ok(false);
                    }
                }
            }
            if !self.advance()? {
                return Ok(false);
            }
        }
    }

    /// Whether the current segment can no longer grow.
    fn is_sealed(&self) -> LogResult<bool> {
        Ok(self.sealed_given(self.tracker.write_mark()?))
    }

    fn sealed_given(&self, mark: Option<WriteMark>) -> bool {
        match mark {
            Some(m) => m.file_number > self.file_number,
            None => self.store.exists(self.file_number + 1),
        }
    }

    /// Load more bytes, moving to the next segment when the current one is done.
    /// Returns `false` when nothing more is readable right now.
    fn advance(&mut self) -> LogResult<bool> {
        // One snapshot: the read limit and the sealed flag must agree.
        let mark = self.tracker.write_mark()?;
        let sealed = self.sealed_given(mark);
        let limit = match mark {
            Some(m) if m.file_number == self.file_number => Some(m.offset),
            _ => None,
        };

        let consumed = self.base + self.pos as u64;
        let leftover = self.chunk.len() - self.pos;
        let bytes = self.store.read_range(self.file_number, consumed, limit)?;
        if bytes.len() > leftover {
            self.chunk = bytes;
            self.base = consumed;
            self.pos = 0;
            return Ok(true);
        }

        if leftover > 0 {
            if sealed {
                return Err(LogError::corrupt(
                    self.file_number,
                    consumed,
                    "truncated frame at end of sealed segment",
                ));
            }
            if segment::valid_frame_after(&self.chunk[self.pos..], consumed, self.file_number) {
                return Err(LogError::corrupt(
                    self.file_number,
                    consumed,
                    "frame length overruns valid frames that follow it",
                ));
            }
            return Ok(false);
        }
        if !sealed {
            return Ok(false);
        }

        // Pin the successor before letting go of the current segment.
        let next = self.file_number + 1;
        self.tracker.pin(next)?;
        let header = match self.store.read_header(next) {
            Ok(h) => h,
            Err(e) => {
                self.tracker.unpin(next);
                return Err(match e {
                    LogError::NotFound(_) | LogError::MissingPath(_) => {
                        LogError::corrupt(next, 0, "next segment is missing")
                    }
                    other => other,
                });
            }
        };
        if let Some(prev) = self.last_lsn {
            if header.start_lsn != prev + 1 {
                self.tracker.unpin(next);
                return Err(LogError::corrupt(
                    next,
                    0,
                    format!("segment starts at lsn {}, expected {}", header.start_lsn, prev + 1),
                ));
            }
        }
        if let Some(old) = self.pinned.replace(next) {
            self.tracker.unpin(old);
        }
        self.file_number = next;
        self.base = SegmentHeader::SIZE as u64;
        self.chunk.clear();
        self.pos = 0;
        self.segment_start_lsn = Some(header.start_lsn);
        self.min_offset = None;
        Ok(true)
    }

    /// Segment number of the last valid position reached.
    pub fn last_good_file_number(&self) -> u64 {
        self.last_good.0
    }

    /// Offset just past the last valid record read (or the scan start before any).
    ///
    /// After a torn tail this is where a repaired log resumes appending.
    pub fn last_good_offset(&self) -> u64 {
        self.last_good.1
    }

    /// Last good position as an anchor, carrying the last LSN read.
    pub fn last_good_anchor(&self) -> LogAnchor {
        LogAnchor::new(
            self.last_good.0,
            self.last_good.1,
            self.last_lsn.unwrap_or(UNKNOWN_LSN),
        )
    }

    /// Release the scanner's segment pin. Idempotent.
    pub fn close(&mut self) {
        if let Some(n) = self.pinned.take() {
            self.tracker.unpin(n);
            self.chunk = Vec::new();
            debug!(file_number = n, "closed log scanner");
        }
    }

    /// Whether `close` has been called.
    pub fn is_closed(&self) -> bool {
        self.pinned.is_none()
    }
}

/// Whether `offset` in segment `file_number` is the end of the written data or the
/// start of a frame whose trailer names that position.
fn frame_boundary(store: &SegmentStore, file_number: u64, offset: u64) -> LogResult<bool> {
    let head = store.read_range(
        file_number,
        offset,
        Some(offset + RecordFrame::HEADER_SIZE as u64),
    )?;
    if head.is_empty() {
        return Ok(true);
    }
    let bytes = match RecordFrame::claimed_len(&head) {
        Some(len) => store.read_range(file_number, offset, Some(offset + len as u64))?,
        None => return Ok(false),
    };
    Ok(matches!(
        RecordFrame::parse_at(&bytes, file_number, offset),
        FrameParse::Complete(_)
    ))
}

fn check_frame_lsn(
    file_number: u64,
    at: u64,
    segment_start: Option<i64>,
    previous: Option<i64>,
    lsn: i64,
) -> LogResult<()> {
    if let Some(start) = segment_start {
        if lsn != start {
            return Err(LogError::corrupt(
                file_number,
                at,
                format!("first record has lsn {lsn}, header says {start}"),
            ));
        }
    }
    match previous {
        _ if !segment::lsn_in_range(lsn) => Err(LogError::corrupt(
            file_number,
            at,
            format!("lsn {lsn} out of range"),
        )),
        Some(prev) if lsn <= prev => Err(LogError::corrupt(
            file_number,
            at,
            format!("lsn is not strictly increasing (prev={prev}, got={lsn})"),
        )),
        _ => Ok(()),
    }
}

impl Drop for LogScanner {
    fn drop(&mut self) {
        self.close();
    }
}
