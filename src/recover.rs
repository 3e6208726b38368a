//! Startup recovery of the log tail.
//!
//! Recovery validates the retained segments and finds the append position:
//!
//! - segment numbers must be contiguous (a gap means lost data and is an error)
//! - every sealed segment must parse completely
//! - the tail segment may end in a torn write, which is truncated away
//! - a tail too short to hold its header (crash during creation) is discarded
//!
//! Damage that is followed by valid frames is never treated as a torn tail.

use crate::error::{LogError, LogResult};
use crate::formats::{FIRST_FILE_NUMBER, FIRST_LSN};
use crate::segment::{self, SegmentHeader, SegmentStore};
use tracing::{debug, info, warn};

/// Where appends resume after recovery.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecoveredTail {
    /// Number of the segment that receives new appends.
    pub file_number: u64,
    /// Length of the tail's valid prefix (the next append offset).
    pub valid_len: u64,
    /// LSN the next record receives.
    pub next_lsn: i64,
    /// Highest LSN found on disk, if any record survived.
    pub last_lsn: Option<i64>,
    /// Oldest retained segment.
    pub oldest: u64,
    /// Number of retained segments.
    pub segment_count: usize,
    /// Bytes dropped from a torn tail.
    pub truncated_bytes: u64,
}

/// Validate the segments in `store` and repair a torn tail.
///
/// Returns `None` when the store holds no segments.
pub fn recover_tail(store: &SegmentStore) -> LogResult<Option<RecoveredTail>> {
    let mut segments = store.list()?;
    if segments.is_empty() {
        return Ok(None);
    }
    check_contiguous(&segments)?;

    // A tail shorter than its header never received a record: the crash hit
    // segment creation. Drop it and resume in its predecessor.
    let mut truncated_bytes = 0u64;
    let tail_bytes = loop {
        let Some(&tail) = segments.last() else {
            return Ok(None);
        };
        let bytes = store.read_all(tail)?;
        if bytes.len() >= SegmentHeader::SIZE {
            break bytes;
        }
        if segments.len() > 1 {
            warn!(
                file_number = tail,
                len = bytes.len(),
                "discarding tail segment with truncated header"
            );
            store.delete(tail)?;
            truncated_bytes += bytes.len() as u64;
            segments.pop();
        } else if tail == FIRST_FILE_NUMBER {
            warn!(
                file_number = tail,
                len = bytes.len(),
                "discarding empty log with truncated header"
            );
            store.delete(tail)?;
            return Ok(None);
        } else {
            return Err(LogError::corrupt(
                tail,
                0,
                format!("only segment has a truncated header ({} bytes)", bytes.len()),
            ));
        }
    };

    let tail = *segments.last().unwrap_or(&FIRST_FILE_NUMBER);
    let oldest = segments[0];

    // Sealed segments must parse end to end and continue the LSN sequence.
    let mut last_lsn: Option<i64> = None;
    for &n in &segments[..segments.len() - 1] {
        let bytes = store.read_all(n)?;
        let scan = segment::scan_segment(&bytes, n, false)?;
        check_start_lsn(n, scan.header.start_lsn, last_lsn)?;
        if let Some(lsn) = scan.last_lsn {
            last_lsn = Some(lsn);
        } else {
            return Err(LogError::corrupt(
                n,
                SegmentHeader::SIZE as u64,
                "sealed segment holds no records",
            ));
        }
        debug!(file_number = n, records = scan.records, "validated sealed segment");
    }

    let scan = segment::scan_segment(&tail_bytes, tail, true)?;
    check_start_lsn(tail, scan.header.start_lsn, last_lsn)?;
    if scan.valid_len < tail_bytes.len() {
        let dropped = (tail_bytes.len() - scan.valid_len) as u64;
        warn!(
            file_number = tail,
            valid_len = scan.valid_len,
            dropped,
            "truncating torn tail"
        );
        store.truncate(tail, &tail_bytes, scan.valid_len)?;
        truncated_bytes += dropped;
    }

    let next_lsn = match scan.last_lsn {
        Some(lsn) => {
            last_lsn = Some(lsn);
            lsn + 1
        }
        None => scan.header.start_lsn,
    };

    info!(
        oldest,
        tail,
        segments = segments.len(),
        next_lsn,
        "recovered log tail"
    );

    Ok(Some(RecoveredTail {
        file_number: tail,
        valid_len: scan.valid_len as u64,
        next_lsn,
        last_lsn,
        oldest,
        segment_count: segments.len(),
        truncated_bytes,
    }))
}

fn check_contiguous(segments: &[u64]) -> LogResult<()> {
    for pair in segments.windows(2) {
        if pair[1] != pair[0] + 1 {
            return Err(LogError::corrupt(
                pair[0] + 1,
                0,
                format!("missing segment between {} and {}", pair[0], pair[1]),
            ));
        }
    }
    Ok(())
}

/// A segment starts exactly one past its predecessor's last LSN. The oldest retained
/// segment may start anywhere at or after `FIRST_LSN`.
fn check_start_lsn(file_number: u64, start_lsn: i64, previous: Option<i64>) -> LogResult<()> {
    let ok = match previous {
        Some(prev) => start_lsn == prev + 1,
        None => start_lsn >= FIRST_LSN,
    };
    if ok {
        Ok(())
    } else {
        Err(LogError::corrupt(
            file_number,
            0,
            format!("segment start lsn {start_lsn} does not follow {previous:?}"),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::anchor::LogAnchor;
    use crate::record::{LogEditType, RecordFrame, UserLogRecord};
    use crate::storage::MemoryDirectory;
    use std::io::Write;
    use std::sync::Arc;

    fn store() -> SegmentStore {
        SegmentStore::new(Arc::new(MemoryDirectory::new()), "log")
    }

    /// Write `count` one-byte records into a new segment.
    fn write_segment(s: &SegmentStore, n: u64, start_lsn: i64, count: usize) {
        let mut w = s.create(n, start_lsn).unwrap();
        let mut buf = Vec::new();
        for i in 0..count {
            let off = (SegmentHeader::SIZE + buf.len()) as u64;
            let rec = UserLogRecord::new(LogEditType::Data, vec![i as u8]);
            RecordFrame::encode_into(&rec, LogAnchor::new(n, off, start_lsn + i as i64), &mut buf)
                .unwrap();
        }
        w.write_all(&buf).unwrap();
    }

    #[test]
    fn empty_store_recovers_to_nothing() {
        assert_eq!(recover_tail(&store()).unwrap(), None);
    }

    #[test]
    fn resumes_after_last_record() {
        let s = store();
        write_segment(&s, 0, 0, 3);
        write_segment(&s, 1, 3, 2);
        let t = recover_tail(&s).unwrap().unwrap();
        assert_eq!(t.file_number, 1);
        assert_eq!(t.next_lsn, 5);
        assert_eq!(t.last_lsn, Some(4));
        assert_eq!(t.segment_count, 2);
        assert_eq!(t.truncated_bytes, 0);
        assert_eq!(
            t.valid_len,
            (SegmentHeader::SIZE + 2 * RecordFrame::encoded_len(1)) as u64
        );
    }

    #[test]
    fn torn_tail_is_truncated_on_disk() {
        let s = store();
        write_segment(&s, 0, 0, 2);
        let mut w = s.open_append(0).unwrap();
        w.write_all(&[2, 9, 0, 0]).unwrap();

        let t = recover_tail(&s).unwrap().unwrap();
        assert_eq!(t.next_lsn, 2);
        assert_eq!(t.truncated_bytes, 4);
        assert_eq!(s.read_all(0).unwrap().len() as u64, t.valid_len);
    }

    #[test]
    fn gap_in_segment_numbers_is_corruption() {
        let s = store();
        write_segment(&s, 0, 0, 1);
        write_segment(&s, 2, 1, 1);
        let err = recover_tail(&s).unwrap_err();
        assert!(err.is_corruption(), "{err}");
    }

    #[test]
    fn half_created_tail_is_discarded() {
        let s = store();
        write_segment(&s, 0, 0, 2);
        s.directory()
            .atomic_write(&s.segment_name(1), b"TXLG")
            .unwrap();
        let t = recover_tail(&s).unwrap().unwrap();
        assert_eq!(t.file_number, 0);
        assert_eq!(t.next_lsn, 2);
        assert_eq!(s.list().unwrap(), vec![0]);
    }

    #[test]
    fn lsn_discontinuity_between_segments_is_corruption() {
        let s = store();
        write_segment(&s, 0, 0, 2);
        write_segment(&s, 1, 7, 1);
        assert!(recover_tail(&s).unwrap_err().is_corruption());
    }

    #[test]
    fn header_only_tail_resumes_at_its_start_lsn() {
        let s = store();
        write_segment(&s, 0, 0, 2);
        write_segment(&s, 1, 2, 0);
        let t = recover_tail(&s).unwrap().unwrap();
        assert_eq!((t.file_number, t.next_lsn), (1, 2));
        assert_eq!(t.last_lsn, Some(1));
        assert_eq!(t.valid_len, SegmentHeader::SIZE as u64);
    }
}
