//! The log engine.
//!
//! [`Log`] ties together recovery, the write buffer, scanning and reclamation.
//!
//! ## Concurrency
//!
//! - `log()` allocates the LSN and appends to the write buffer under one mutex, so
//!   LSN order, position order and on-disk order always agree.
//! - `sync()` drains the buffer under that mutex but issues the `fsync` outside it,
//!   under a separate sync lock. Appends without `sync` never wait for a disk flush.
//! - Scanners read sealed segments freely and the live segment up to the write mark.
//!
//! ## Reclamation
//!
//! `advance_min_needed_log_position` only records the new mark. Segments are deleted
//! in batches: lazily after every segment rollover, or when the owner calls
//! [`Log::reclaim_obsolete_segments`]. Each cycle first persists the mark to the
//! checkpoint file, then deletes the segments that lie entirely before it, oldest
//! first, stopping at a segment an open scanner still reads.

use crate::anchor::{LogAnchor, UNKNOWN_LSN};
use crate::checkpoint::CheckpointFile;
use crate::config::LogConfig;
use crate::error::{LogError, LogResult};
use crate::formats::{CHECKPOINT_FILE, FIRST_LSN};
use crate::record::UserLogRecord;
use crate::recover;
use crate::scanner::LogScanner;
use crate::segment::{SegmentStore, SegmentTracker};
use crate::storage::{Directory, FsDirectory};
use crate::writer::LogWriter;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use tracing::{debug, error, info, warn};

/// A segment-based, crash-recoverable write-ahead log.
pub struct Log {
    config: LogConfig,
    store: SegmentStore,
    tracker: Arc<SegmentTracker>,
    checkpoint: CheckpointFile,
    writer: Mutex<LogWriter>,
    sync_lock: Mutex<()>,
    last_issued: AtomicI64,
    durable_lsn: AtomicI64,
    /// Declared by the owner; only moves forward.
    min_needed: Mutex<Option<LogAnchor>>,
    /// Last mark written to the checkpoint file. Its lock also serializes reclamation.
    persisted: Mutex<Option<LogAnchor>>,
    closed: AtomicBool,
}

impl std::fmt::Debug for Log {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Log")
            .field("config", &self.config)
            .field("last_issued", &self.last_issued)
            .field("durable_lsn", &self.durable_lsn)
            .field("closed", &self.closed)
            .finish_non_exhaustive()
    }
}

impl Log {
    /// Open (or create) the log at `path` on the local filesystem.
    pub fn init(
        path: impl Into<PathBuf>,
        suffix: &str,
        buffer_size: usize,
        soft_file_size_limit: u64,
    ) -> LogResult<Self> {
        Self::open(
            LogConfig::new(path)
                .with_suffix(suffix)
                .with_buffer_size(buffer_size)
                .with_soft_file_size_limit(soft_file_size_limit),
        )
    }

    /// Open (or create) the log described by `config` on the local filesystem.
    pub fn open(config: LogConfig) -> LogResult<Self> {
        config.validate()?;
        let dir = FsDirectory::new(&config.path)?;
        Self::with_directory(Arc::new(dir), config)
    }

    /// Open (or create) a log in an arbitrary storage backend.
    ///
    /// `config.path` is informational here; the directory decides where files live.
    pub fn with_directory(dir: Arc<dyn Directory>, config: LogConfig) -> LogResult<Self> {
        config.validate()?;
        let store = SegmentStore::new(dir.clone(), config.suffix.clone());
        let checkpoint = CheckpointFile::new(dir);

        let tail = recover::recover_tail(&store)?;
        let next_lsn = tail.as_ref().map_or(FIRST_LSN, |t| t.next_lsn);

        let persisted = match checkpoint.read_anchor(CHECKPOINT_FILE) {
            Ok(Some(a)) if a.lsn() > next_lsn => {
                warn!(anchor = %a, next_lsn, "ignoring checkpoint beyond the end of the log");
                None
            }
            Ok(a) => a,
            Err(e) if e.is_corruption() => {
                warn!(error = %e, "ignoring unreadable checkpoint");
                None
            }
            Err(e) => return Err(e),
        };

        let tracker = Arc::new(SegmentTracker::default());
        let writer = LogWriter::open(
            store.clone(),
            tracker.clone(),
            tail.as_ref(),
            config.buffer_size,
            config.soft_file_size_limit,
        )?;
        let last = if writer.next_lsn() > FIRST_LSN {
            writer.next_lsn() - 1
        } else {
            UNKNOWN_LSN
        };

        info!(
            path = %config.path.display(),
            suffix = %config.suffix,
            file_number = writer.file_number(),
            next_lsn = writer.next_lsn(),
            min_needed = ?persisted,
            "opened log"
        );

        Ok(Self {
            config,
            store,
            tracker,
            checkpoint,
            writer: Mutex::new(writer),
            sync_lock: Mutex::new(()),
            last_issued: AtomicI64::new(last),
            durable_lsn: AtomicI64::new(last),
            min_needed: Mutex::new(persisted),
            persisted: Mutex::new(persisted),
            closed: AtomicBool::new(false),
        })
    }

    fn ensure_open(&self) -> LogResult<()> {
        if self.closed.load(Ordering::Acquire) {
            Err(LogError::Closed)
        } else {
            Ok(())
        }
    }

    fn lock_writer(&self) -> LogResult<MutexGuard<'_, LogWriter>> {
        self.writer.lock().map_err(|_| LogError::poisoned("log writer"))
    }

    /// Append `record` and write its assigned anchor back into it.
    ///
    /// With `sync`, returns only once the record and everything logged before it is
    /// on stable storage. Otherwise the record may still sit in the write buffer.
    /// A zero-sized write buffer makes every call behave as if `sync` were set.
    pub fn log(&self, record: &mut UserLogRecord, sync: bool) -> LogResult<LogAnchor> {
        self.ensure_open()?;
        let appended = {
            let mut writer = self.lock_writer()?;
            let appended = writer.append(record)?;
            self.last_issued
                .fetch_max(appended.anchor.lsn(), Ordering::AcqRel);
            appended
        };
        record.set_anchor(appended.anchor);

        if appended.rolled_over {
            self.reclaim_lazily();
        }
        if sync || self.config.buffer_size == 0 {
            self.sync(appended.anchor.lsn())?;
        }
        Ok(appended.anchor)
    }

    /// Make records durable through `upto_lsn`, or everything logged so far when
    /// `upto_lsn` is `UNKNOWN_LSN`.
    ///
    /// Asking for an LSN that `log` never issued is `InvalidLsn`.
    pub fn sync(&self, upto_lsn: i64) -> LogResult<()> {
        self.ensure_open()?;
        let last = self.last_issued.load(Ordering::Acquire);
        let target = if upto_lsn == UNKNOWN_LSN {
            last
        } else if upto_lsn < FIRST_LSN || upto_lsn > last {
            return Err(LogError::InvalidLsn {
                requested: upto_lsn,
                last_issued: last,
            });
        } else {
            upto_lsn
        };
        if self.durable_lsn.load(Ordering::Acquire) >= target {
            return Ok(());
        }

        let _sync = self
            .sync_lock
            .lock()
            .map_err(|_| LogError::poisoned("log sync"))?;
        // Another caller may have covered us while we waited.
        if self.durable_lsn.load(Ordering::Acquire) >= target {
            return Ok(());
        }
        let (file_number, written) = {
            let mut writer = self.lock_writer()?;
            let written = writer.drain()?;
            (writer.file_number(), written)
        };
        if let Err(e) = self.sync_segment(file_number) {
            self.fail_writer(file_number, &e);
            return Err(e);
        }
        self.durable_lsn.fetch_max(written, Ordering::AcqRel);
        debug!(file_number, durable_lsn = written, "synced log");
        Ok(())
    }

    /// After a failed fsync the kernel may have dropped the dirty pages, so a retry
    /// could report success for lost data. The writer stays failed until reopen.
    fn fail_writer(&self, file_number: u64, e: &LogError) {
        error!(file_number, error = %e, "log sync failed");
        let mut writer = match self.writer.lock() {
            Ok(g) => g,
            Err(poisoned) => poisoned.into_inner(),
        };
        writer.mark_failed(format!("sync of segment {file_number} failed: {e}"));
    }

    /// Flush segment `file_number` to stable storage.
    fn sync_segment(&self, file_number: u64) -> LogResult<()> {
        match self.store.sync(file_number) {
            // Rolled over (and sealed with a sync) or reclaimed since we drained.
            Err(_) if !self.store.exists(file_number) => Ok(()),
            other => other,
        }
    }

    /// Scan from the current min-needed position, or from the oldest retained
    /// segment if none was ever declared.
    pub fn begin_scan(&self) -> LogResult<LogScanner> {
        let start = self.min_needed_position().unwrap_or(LogAnchor::MIN);
        self.begin_scan_at(start)
    }

    /// Scan from the first record at or after `start`.
    pub fn begin_scan_at(&self, start: LogAnchor) -> LogResult<LogScanner> {
        self.ensure_open()?;
        LogScanner::open(self.store.clone(), self.tracker.clone(), start)
    }

    /// Declare that nothing before `anchor` is needed any more.
    ///
    /// Regressions, anchors without an LSN and LSNs never issued are ignored.
    /// Segments become reclaimable but are deleted on a later reclamation cycle.
    pub fn advance_min_needed_log_position(&self, anchor: LogAnchor) {
        if !anchor.has_lsn() || anchor.lsn() > self.last_issued.load(Ordering::Acquire) {
            warn!(%anchor, "ignoring min-needed position that was never issued");
            return;
        }
        let mut current = match self.min_needed.lock() {
            Ok(g) => g,
            Err(poisoned) => poisoned.into_inner(),
        };
        if current.is_some_and(|c| anchor <= c) {
            return;
        }
        *current = Some(anchor);
        debug!(%anchor, "advanced min-needed position");
    }

    /// Run one reclamation cycle now. Returns the number of segments deleted.
    pub fn reclaim_obsolete_segments(&self) -> LogResult<usize> {
        self.ensure_open()?;
        let Some(target) = self.min_needed_position() else {
            return Ok(0);
        };

        let mut persisted = self
            .persisted
            .lock()
            .map_err(|_| LogError::poisoned("log checkpoint"))?;
        if persisted.map_or(true, |p| p < target) {
            self.checkpoint.write_anchor(CHECKPOINT_FILE, target)?;
            *persisted = Some(target);
            debug!(anchor = %target, "persisted min-needed position");
        }

        let floor = self.reclaim_floor(target)?;
        let out = self.store.reclaim_below(floor, &self.tracker)?;
        if !out.deleted.is_empty() {
            info!(deleted = ?out.deleted, floor, "reclaimed log segments");
        }
        if let Some(pinned) = out.deferred {
            debug!(file_number = pinned, "segment reclamation deferred by open scanner");
        }
        Ok(out.deleted.len())
    }

    /// First segment that may hold a record at or after `target`.
    ///
    /// The LSN decides: the floor is the newest segment at or before the anchor's
    /// file number whose first LSN does not exceed the anchor's LSN.
    fn reclaim_floor(&self, target: LogAnchor) -> LogResult<u64> {
        let segments = self.store.list()?;
        for &n in segments.iter().rev() {
            if n > target.file_number() {
                continue;
            }
            if self.store.read_header(n)?.start_lsn <= target.lsn() {
                return Ok(n);
            }
        }
        Ok(segments.first().copied().unwrap_or(0))
    }

    fn reclaim_lazily(&self) {
        if let Err(e) = self.reclaim_obsolete_segments() {
            warn!(error = %e, "lazy segment reclamation failed");
        }
    }

    /// Flush, sync and persist the min-needed position. Later calls return `Closed`.
    pub fn close(&self) -> LogResult<()> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        let _sync = self
            .sync_lock
            .lock()
            .map_err(|_| LogError::poisoned("log sync"))?;
        let (file_number, written) = {
            let mut writer = self.lock_writer()?;
            let written = writer.close()?;
            (writer.file_number(), written)
        };
        if let Err(e) = self.sync_segment(file_number) {
            self.fail_writer(file_number, &e);
            return Err(e);
        }
        self.durable_lsn.fetch_max(written, Ordering::AcqRel);

        if let Some(target) = self.min_needed_position() {
            let mut persisted = self
                .persisted
                .lock()
                .map_err(|_| LogError::poisoned("log checkpoint"))?;
            if persisted.map_or(true, |p| p < target) {
                self.checkpoint.write_anchor(CHECKPOINT_FILE, target)?;
                *persisted = Some(target);
            }
        }
        info!(durable_lsn = written, "closed log");
        Ok(())
    }

    /// Highest LSN handed out by `log` (`UNKNOWN_LSN` for an empty log).
    pub fn last_issued_lsn(&self) -> i64 {
        self.last_issued.load(Ordering::Acquire)
    }

    /// Highest LSN known to be on stable storage.
    pub fn durable_lsn(&self) -> i64 {
        self.durable_lsn.load(Ordering::Acquire)
    }

    /// The current min-needed position, if one was declared (or recovered).
    pub fn min_needed_position(&self) -> Option<LogAnchor> {
        match self.min_needed.lock() {
            Ok(g) => *g,
            Err(poisoned) => *poisoned.into_inner(),
        }
    }

    /// Retained segment numbers, ascending.
    pub fn segment_numbers(&self) -> LogResult<Vec<u64>> {
        self.store.list()
    }

    /// The configuration this log was opened with.
    pub fn config(&self) -> &LogConfig {
        &self.config
    }
}
