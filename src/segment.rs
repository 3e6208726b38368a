//! Segment files: naming, headers, reads, creation and reclamation.
//!
//! ## Public invariants (must not change without a format bump)
//!
//! - **Naming**: `log_<file_number>.<suffix>`, decimal, zero-based. Segments are
//!   ordered by numeric file number (never lexicographically).
//! - **Header**: `[LOG_MAGIC][FORMAT_VERSION][file_number:u64][start_lsn:i64]`
//!   (little-endian). `start_lsn` is the LSN carried by the segment's first record.
//! - **Contiguity**: retained segment numbers form one contiguous run. Reclamation
//!   deletes from the oldest end only.
//! - Segments other than the highest-numbered one are sealed and never modified again.

use crate::error::{LogError, LogResult};
use crate::formats::{FIRST_LSN, FORMAT_VERSION, LOG_MAGIC, SEGMENT_PREFIX};
use crate::record::{FrameParse, LogEditType, RecordFrame};
use crate::storage::{self, Directory, DurableDirectory};
use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use std::collections::BTreeMap;
use std::io::{Read, Write};
use std::sync::{Arc, Mutex, MutexGuard};

/// Per-file header for a log segment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SegmentHeader {
    /// Magic bytes (should equal `LOG_MAGIC`).
    pub magic: [u8; 4],
    /// Format version.
    pub version: u32,
    /// Segment file number; must match the file name.
    pub file_number: u64,
    /// LSN of the first record in this segment.
    pub start_lsn: i64,
}

impl SegmentHeader {
    /// Number of bytes in the serialized header.
    pub const SIZE: usize = 4 + 4 + 8 + 8;

    /// Header for a new segment.
    pub fn new(file_number: u64, start_lsn: i64) -> Self {
        Self {
            magic: LOG_MAGIC,
            version: FORMAT_VERSION,
            file_number,
            start_lsn,
        }
    }

    /// Write the header to a stream.
    pub fn write<W: Write + ?Sized>(&self, writer: &mut W) -> LogResult<()> {
        writer.write_all(&self.magic)?;
        writer.write_u32::<LittleEndian>(self.version)?;
        writer.write_u64::<LittleEndian>(self.file_number)?;
        writer.write_i64::<LittleEndian>(self.start_lsn)?;
        Ok(())
    }

    /// Read the header from a stream.
    pub fn read<R: Read + ?Sized>(reader: &mut R) -> LogResult<Self> {
        let mut magic = [0u8; 4];
        reader.read_exact(&mut magic)?;
        if magic != LOG_MAGIC {
            return Err(LogError::Format("invalid log segment magic".into()));
        }

        let version = reader.read_u32::<LittleEndian>()?;
        if version != FORMAT_VERSION {
            return Err(LogError::Format(format!(
                "log segment version mismatch (got {version}, expected {FORMAT_VERSION})"
            )));
        }

        Ok(Self {
            magic,
            version,
            file_number: reader.read_u64::<LittleEndian>()?,
            start_lsn: reader.read_i64::<LittleEndian>()?,
        })
    }

    /// Serialized header bytes.
    pub fn to_bytes(&self) -> LogResult<Vec<u8>> {
        let mut buf = Vec::with_capacity(Self::SIZE);
        self.write(&mut buf)?;
        Ok(buf)
    }
}

/// The end of the bytes the writer has handed to the active segment file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct WriteMark {
    pub(crate) file_number: u64,
    pub(crate) offset: u64,
}

/// State shared between the writer, scanners and reclamation.
///
/// - `pins` counts open scanners per segment; pinned segments are never deleted.
/// - `mark` bounds what scanners may read from the active segment so they never see
///   a frame that is still being written. `None` means no live writer (offline scan).
///
/// Lock order: `pins` before `mark`.
#[derive(Debug, Default)]
pub(crate) struct SegmentTracker {
    pins: Mutex<BTreeMap<u64, usize>>,
    mark: Mutex<Option<WriteMark>>,
}

impl SegmentTracker {
    pub(crate) fn lock_pins(&self) -> LogResult<MutexGuard<'_, BTreeMap<u64, usize>>> {
        self.pins.lock().map_err(|_| LogError::poisoned("segment pins"))
    }

    pub(crate) fn pin(&self, file_number: u64) -> LogResult<()> {
        *self.lock_pins()?.entry(file_number).or_insert(0) += 1;
        Ok(())
    }

    /// Release one pin. Never fails: a poisoned table is still updated.
    pub(crate) fn unpin(&self, file_number: u64) {
        let mut pins = match self.pins.lock() {
            Ok(g) => g,
            Err(poisoned) => poisoned.into_inner(),
        };
        if let Some(n) = pins.get_mut(&file_number) {
            *n -= 1;
            if *n == 0 {
                pins.remove(&file_number);
            }
        }
    }

    pub(crate) fn write_mark(&self) -> LogResult<Option<WriteMark>> {
        Ok(*self.mark.lock().map_err(|_| LogError::poisoned("write mark"))?)
    }

    pub(crate) fn set_write_mark(&self, file_number: u64, offset: u64) -> LogResult<()> {
        *self.mark.lock().map_err(|_| LogError::poisoned("write mark"))? = Some(WriteMark {
            file_number,
            offset,
        });
        Ok(())
    }
}

/// Result of one reclamation cycle.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Reclaimed {
    /// Segment numbers deleted, ascending.
    pub deleted: Vec<u64>,
    /// First eligible segment that was kept because a scanner still has it open.
    pub deferred: Option<u64>,
}

/// Segment files of one log inside a `Directory`.
#[derive(Clone)]
pub struct SegmentStore {
    directory: Arc<dyn Directory>,
    suffix: String,
}

impl SegmentStore {
    /// Segment store for files named `log_<n>.<suffix>` at the root of `directory`.
    pub fn new(directory: Arc<dyn Directory>, suffix: impl Into<String>) -> Self {
        Self {
            directory,
            suffix: suffix.into(),
        }
    }

    /// The backing directory.
    pub fn directory(&self) -> &Arc<dyn Directory> {
        &self.directory
    }

    /// File name of segment `file_number`.
    pub fn segment_name(&self, file_number: u64) -> String {
        format!("{SEGMENT_PREFIX}{file_number}.{}", self.suffix)
    }

    /// Parse a segment file name back into its number.
    pub fn parse_segment_name(&self, name: &str) -> Option<u64> {
        let raw = name
            .strip_prefix(SEGMENT_PREFIX)?
            .strip_suffix(self.suffix.as_str())?
            .strip_suffix('.')?;
        if raw.is_empty() || !raw.bytes().all(|b| b.is_ascii_digit()) {
            return None;
        }
        raw.parse::<u64>().ok()
    }

    /// Existing segment numbers, ascending.
    pub fn list(&self) -> LogResult<Vec<u64>> {
        // IMPORTANT: do not sort lexicographically (`log_10` < `log_2`).
        let mut out: Vec<u64> = self
            .directory
            .list_dir("")?
            .iter()
            .filter_map(|n| self.parse_segment_name(n))
            .collect();
        out.sort_unstable();
        Ok(out)
    }

    /// Whether segment `file_number` exists.
    pub fn exists(&self, file_number: u64) -> bool {
        self.directory.exists(&self.segment_name(file_number))
    }

    /// Create segment `file_number` holding only its header, and open it for appends.
    ///
    /// The header is published atomically, so a crash never leaves a torn header
    /// behind. The new name is made durable when the backend supports it.
    pub fn create(&self, file_number: u64, start_lsn: i64) -> LogResult<Box<dyn Write + Send>> {
        let name = self.segment_name(file_number);
        let header = SegmentHeader::new(file_number, start_lsn).to_bytes()?;
        if self.directory.supports_sync(&name) {
            self.directory.atomic_write_durable(&name, &header)?;
        } else {
            self.directory.atomic_write(&name, &header)?;
        }
        self.directory.append_file(&name)
    }

    /// Open segment `file_number` for appends.
    pub fn open_append(&self, file_number: u64) -> LogResult<Box<dyn Write + Send>> {
        self.directory.append_file(&self.segment_name(file_number))
    }

    /// Read segment bytes starting at `offset`, stopping at `limit` when given.
    pub fn read_range(&self, file_number: u64, offset: u64, limit: Option<u64>) -> LogResult<Vec<u8>> {
        let r = self
            .directory
            .open_file_at(&self.segment_name(file_number), offset)?;
        let mut buf = Vec::new();
        match limit {
            Some(end) => {
                r.take(end.saturating_sub(offset)).read_to_end(&mut buf)?;
            }
            None => {
                let mut r = r;
                r.read_to_end(&mut buf)?;
            }
        }
        Ok(buf)
    }

    /// Read the whole segment.
    pub fn read_all(&self, file_number: u64) -> LogResult<Vec<u8>> {
        self.read_range(file_number, 0, None)
    }

    /// Read and validate the header of segment `file_number`.
    pub fn read_header(&self, file_number: u64) -> LogResult<SegmentHeader> {
        let bytes = self.read_range(file_number, 0, Some(SegmentHeader::SIZE as u64))?;
        decode_header(&bytes, file_number)
    }

    /// Replace segment `file_number` with its first `valid_len` bytes.
    pub fn truncate(&self, file_number: u64, bytes: &[u8], valid_len: usize) -> LogResult<()> {
        let name = self.segment_name(file_number);
        let prefix = &bytes[..valid_len.min(bytes.len())];
        if self.directory.supports_sync(&name) {
            self.directory.atomic_write_durable(&name, prefix)
        } else {
            self.directory.atomic_write(&name, prefix)
        }
    }

    /// Flush segment `file_number` to stable storage, if the backend can.
    pub fn sync(&self, file_number: u64) -> LogResult<()> {
        let name = self.segment_name(file_number);
        if self.directory.supports_sync(&name) {
            storage::sync_file(&*self.directory, &name)?;
        }
        Ok(())
    }

    /// Delete segment `file_number`.
    pub fn delete(&self, file_number: u64) -> LogResult<()> {
        self.directory.delete(&self.segment_name(file_number))
    }

    /// Delete every segment numbered below `floor`, oldest first.
    ///
    /// Never deletes the newest segment. Stops at the first pinned segment so the
    /// retained set stays contiguous; that segment is reported as `deferred` and is
    /// picked up by a later cycle.
    pub(crate) fn reclaim_below(&self, floor: u64, tracker: &SegmentTracker) -> LogResult<Reclaimed> {
        let pins = tracker.lock_pins()?;
        let segments = self.list()?;
        let newest = segments.last().copied();
        let mut out = Reclaimed::default();
        for n in segments {
            if n >= floor || Some(n) == newest {
                break;
            }
            if pins.get(&n).copied().unwrap_or(0) > 0 {
                out.deferred = Some(n);
                break;
            }
            self.delete(n)?;
            out.deleted.push(n);
        }
        Ok(out)
    }
}

/// Decode and check a segment header read from segment `file_number`.
pub(crate) fn decode_header(bytes: &[u8], file_number: u64) -> LogResult<SegmentHeader> {
    if bytes.len() < SegmentHeader::SIZE {
        return Err(LogError::corrupt(
            file_number,
            0,
            format!("segment header truncated ({} bytes)", bytes.len()),
        ));
    }
    let header = SegmentHeader::read(&mut &bytes[..SegmentHeader::SIZE])?;
    if header.file_number != file_number {
        return Err(LogError::corrupt(
            file_number,
            0,
            format!("header names file {}", header.file_number),
        ));
    }
    if !lsn_in_range(header.start_lsn) {
        return Err(LogError::corrupt(
            file_number,
            0,
            format!("header start lsn {} out of range", header.start_lsn),
        ));
    }
    Ok(header)
}

/// Whether a fully valid frame, positioned where it was read, starts anywhere after the
/// first byte of `bytes`.
///
/// Tells a torn tail (garbage up to EOF) from a damaged record in the middle of the
/// log. A damaged length field makes the bad frame's claimed end meaningless, so every
/// later offset is tried; the CRC plus the trailer anchor make a false match
/// negligible. `bytes` starts at file offset `base`.
pub(crate) fn valid_frame_after(bytes: &[u8], base: u64, file_number: u64) -> bool {
    let last = bytes.len().saturating_sub(RecordFrame::OVERHEAD);
    (1..=last).any(|o| {
        LogEditType::from_tag(bytes[o]).is_some()
            && matches!(
                RecordFrame::parse_at(&bytes[o..], file_number, base + o as u64),
                FrameParse::Complete(_)
            )
    })
}

/// Summary of a segment's valid prefix.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct SegmentScan {
    pub(crate) header: SegmentHeader,
    /// Length of the prefix ending on the last valid frame boundary.
    pub(crate) valid_len: usize,
    pub(crate) records: u64,
    pub(crate) last_lsn: Option<i64>,
}

/// Validate the frames of a whole segment image.
///
/// In the tail segment an incomplete or inconsistent frame with no valid frame anywhere
/// after it ends the valid prefix (torn write). Anywhere else, and for damage followed
/// by valid frames, the segment is corrupt.
pub(crate) fn scan_segment(bytes: &[u8], file_number: u64, is_tail: bool) -> LogResult<SegmentScan> {
    let header = decode_header(bytes, file_number)?;
    let mut pos = SegmentHeader::SIZE;
    let mut records = 0u64;
    let mut last_lsn: Option<i64> = None;

    while pos < bytes.len() {
        match RecordFrame::parse_at(&bytes[pos..], file_number, pos as u64) {
            FrameParse::Complete(f) => {
                let lsn = f.anchor.lsn();
                check_lsn_order(file_number, pos as u64, header.start_lsn, last_lsn, lsn)?;
                last_lsn = Some(lsn);
                records += 1;
                pos += f.frame_len;
            }
            FrameParse::Incomplete => {
                if is_tail && !valid_frame_after(&bytes[pos..], pos as u64, file_number) {
                    break;
                }
                let reason = if is_tail {
                    "frame length overruns valid frames that follow it"
                } else {
                    "truncated frame in sealed segment"
                };
                return Err(LogError::corrupt(file_number, pos as u64, reason));
            }
            FrameParse::Invalid { reason, .. } => {
                if is_tail && !valid_frame_after(&bytes[pos..], pos as u64, file_number) {
                    break;
                }
                return Err(LogError::corrupt(file_number, pos as u64, reason));
            }
        }
    }

    Ok(SegmentScan {
        header,
        valid_len: pos,
        records,
        last_lsn,
    })
}

/// Whether `lsn` can be stored on disk and still have a successor.
pub(crate) fn lsn_in_range(lsn: i64) -> bool {
    (FIRST_LSN..i64::MAX).contains(&lsn)
}

/// LSNs are strictly increasing, and a segment's first record carries its `start_lsn`.
pub(crate) fn check_lsn_order(
    file_number: u64,
    offset: u64,
    start_lsn: i64,
    previous: Option<i64>,
    lsn: i64,
) -> LogResult<()> {
    match previous {
        _ if !lsn_in_range(lsn) => Err(LogError::corrupt(
            file_number,
            offset,
            format!("lsn {lsn} out of range"),
        )),
        None if lsn != start_lsn => Err(LogError::corrupt(
            file_number,
            offset,
            format!("first record has lsn {lsn}, header says {start_lsn}"),
        )),
        Some(prev) if lsn <= prev => Err(LogError::corrupt(
            file_number,
            offset,
            format!("lsn is not strictly increasing (prev={prev}, got={lsn})"),
        )),
        _ => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::anchor::LogAnchor;
    use crate::record::{LogEditType, UserLogRecord};
    use crate::storage::MemoryDirectory;

    fn segment_image(file_number: u64, start_lsn: i64, payloads: &[&[u8]]) -> Vec<u8> {
        let mut bytes = SegmentHeader::new(file_number, start_lsn).to_bytes().unwrap();
        for (i, p) in payloads.iter().enumerate() {
            let anchor = LogAnchor::new(file_number, bytes.len() as u64, start_lsn + i as i64);
            RecordFrame::encode_into(&UserLogRecord::new(LogEditType::Data, *p), anchor, &mut bytes)
                .unwrap();
        }
        bytes
    }

    fn store() -> SegmentStore {
        SegmentStore::new(Arc::new(MemoryDirectory::new()) as Arc<dyn Directory>, "log")
    }

    #[test]
    fn names_roundtrip_and_foreign_files_are_ignored() {
        let s = store();
        assert_eq!(s.segment_name(12), "log_12.log");
        assert_eq!(s.parse_segment_name("log_12.log"), Some(12));
        assert_eq!(s.parse_segment_name("log_12.wal"), None);
        assert_eq!(s.parse_segment_name("log_.log"), None);
        assert_eq!(s.parse_segment_name("log_+1.log"), None);
        assert_eq!(s.parse_segment_name("checkpoint.anchor"), None);
    }

    #[test]
    fn list_sorts_numerically() {
        let s = store();
        for n in [10u64, 2, 1] {
            s.create(n, 0).unwrap();
        }
        s.directory().atomic_write("checkpoint.anchor", b"x").unwrap();
        assert_eq!(s.list().unwrap(), vec![1, 2, 10]);
    }

    #[test]
    fn create_writes_header_and_appends_after_it() {
        let s = store();
        let mut w = s.create(3, 77).unwrap();
        w.write_all(b"tail").unwrap();
        let h = s.read_header(3).unwrap();
        assert_eq!(h, SegmentHeader::new(3, 77));
        let bytes = s.read_all(3).unwrap();
        assert_eq!(&bytes[SegmentHeader::SIZE..], b"tail");
    }

    #[test]
    fn header_rejects_bad_magic_and_wrong_number() {
        let mut bytes = SegmentHeader::new(1, 0).to_bytes().unwrap();
        assert!(decode_header(&bytes, 2).unwrap_err().is_corruption());
        bytes[0] ^= 0xFF;
        let err = decode_header(&bytes, 1).unwrap_err();
        assert!(err.to_string().contains("invalid log segment magic"));
    }

    #[test]
    fn scan_counts_records_and_stops_at_torn_tail() {
        let mut bytes = segment_image(0, 5, &[b"a", b"bb", b"ccc"]);
        let full = bytes.len();
        let scan = scan_segment(&bytes, 0, true).unwrap();
        assert_eq!((scan.records, scan.last_lsn, scan.valid_len), (3, Some(7), full));

        bytes.truncate(full - 3);
        let scan = scan_segment(&bytes, 0, true).unwrap();
        assert_eq!(scan.records, 2);
        assert_eq!(scan.last_lsn, Some(6));
        assert!(scan.valid_len < bytes.len());

        // The same tear in a sealed segment is corruption.
        assert!(scan_segment(&bytes, 0, false).unwrap_err().is_corruption());
    }

    #[test]
    fn damaged_middle_record_is_corruption_even_in_tail() {
        let mut bytes = segment_image(0, 0, &[b"first", b"second", b"third"]);
        // Flip a payload byte of the middle record.
        let second = SegmentHeader::SIZE + RecordFrame::encoded_len(5);
        bytes[second + RecordFrame::HEADER_SIZE] ^= 0x40;
        let err = scan_segment(&bytes, 0, true).unwrap_err();
        match err {
            LogError::Corrupt { offset, .. } => assert_eq!(offset, second as u64),
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn damaged_capacity_in_tail_is_corruption() {
        let bytes = segment_image(0, 0, &[b"first", b"second", b"third"]);
        let second = SegmentHeader::SIZE + RecordFrame::encoded_len(5);
        let cap = second + 5;

        // Off by one: the claimed end lands inside the next frame.
        let mut shifted = bytes.clone();
        shifted[cap] ^= 0x01;
        // Far past EOF: the frame looks incomplete.
        let mut overrun = bytes.clone();
        overrun[cap + 1] = 0x10;
        // Beyond the per-record cap: no claimed end at all.
        let mut huge = bytes;
        huge[cap + 3] = 0x7F;

        for image in [shifted, overrun, huge] {
            match scan_segment(&image, 0, true).unwrap_err() {
                LogError::Corrupt { offset, .. } => assert_eq!(offset, second as u64),
                other => panic!("unexpected error: {other}"),
            }
        }
    }

    #[test]
    fn damaged_capacity_of_last_frame_is_torn() {
        let mut bytes = segment_image(0, 0, &[b"first", b"second"]);
        let second = SegmentHeader::SIZE + RecordFrame::encoded_len(5);
        bytes[second + 5] ^= 0x01;
        let scan = scan_segment(&bytes, 0, true).unwrap();
        assert_eq!((scan.records, scan.valid_len), (1, second));
    }

    #[test]
    fn garbage_tail_is_torn_not_corrupt() {
        let mut bytes = segment_image(0, 0, &[b"ok"]);
        let good = bytes.len();
        bytes.extend_from_slice(&[0xAB; 50]);
        let scan = scan_segment(&bytes, 0, true).unwrap();
        assert_eq!(scan.valid_len, good);
        assert_eq!(scan.records, 1);
    }

    #[test]
    fn first_lsn_must_match_header() {
        let mut bytes = segment_image(0, 0, &[b"a"]);
        // Rewrite the header's start_lsn.
        bytes[16..24].copy_from_slice(&9i64.to_le_bytes());
        assert!(scan_segment(&bytes, 0, true).unwrap_err().is_corruption());
    }

    #[test]
    fn reclaim_keeps_pinned_and_newer_segments() {
        let s = store();
        for n in 0..5u64 {
            s.create(n, n as i64).unwrap();
        }
        let tracker = SegmentTracker::default();
        tracker.pin(2).unwrap();

        let out = s.reclaim_below(4, &tracker).unwrap();
        assert_eq!(out.deleted, vec![0, 1]);
        assert_eq!(out.deferred, Some(2));
        assert_eq!(s.list().unwrap(), vec![2, 3, 4]);

        tracker.unpin(2);
        let out = s.reclaim_below(4, &tracker).unwrap();
        assert_eq!(out.deleted, vec![2, 3]);
        assert_eq!(s.list().unwrap(), vec![4]);

        // The newest segment survives even a floor above it.
        let out = s.reclaim_below(100, &tracker).unwrap();
        assert!(out.deleted.is_empty());
        assert_eq!(s.list().unwrap(), vec![4]);
    }
}
