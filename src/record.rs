//! User records and their on-disk framing.
//!
//! ## Public invariants (must not change without a format bump)
//!
//! - **Frame layout** (little-endian):
//!   `type:u8 | valid_length:u32 | buffer_capacity:u32 | payload[buffer_capacity] |
//!   file_number:u64 | file_offset:u64 | lsn:i64 | crc32:u32`
//! - **Type tags**: `1 = Txn`, `2 = Data`. Tag `0` is never written, so zero-filled
//!   tails do not parse.
//! - **Trailer anchor**: the position the frame was written at. Readers compare it with
//!   the position they actually read the frame from.
//! - **Checksum**: `crc32fast` over every byte that precedes the checksum.
//! - **Limits**: `buffer_capacity` is capped at `MAX_RECORD_BYTES`.
//!
//! The writer stores only the valid bytes of a record (`buffer_capacity == valid_length`);
//! the decoder accepts any `valid_length <= buffer_capacity`.

use crate::anchor::{LogAnchor, UNKNOWN_LSN};
use crate::error::{LogError, LogResult};
use crate::formats::MAX_RECORD_BYTES;
use byteorder::{ByteOrder, LittleEndian};

/// Kind of a logged record. Its interpretation belongs to the caller.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LogEditType {
    /// Transaction metadata (begin/commit/abort markers and the like).
    Txn,
    /// Data edits.
    Data,
}

impl LogEditType {
    /// On-disk tag byte.
    pub fn tag(self) -> u8 {
        match self {
            LogEditType::Txn => 1,
            LogEditType::Data => 2,
        }
    }

    /// Parse an on-disk tag byte.
    pub fn from_tag(tag: u8) -> Option<Self> {
        match tag {
            1 => Some(LogEditType::Txn),
            2 => Some(LogEditType::Data),
            _ => None,
        }
    }
}

/// A caller payload plus the position the log recorded it at.
///
/// The backing buffer may be larger than the payload; only the first `valid_length`
/// bytes are logged. When a scanner refills a record, the buffer is reused and grown as
/// needed, so its contents are only meaningful until the next refill.
#[derive(Debug, Clone)]
pub struct UserLogRecord {
    record_type: LogEditType,
    buffer: Vec<u8>,
    valid_length: usize,
    anchor: LogAnchor,
}

impl UserLogRecord {
    /// A record whose whole buffer is payload.
    pub fn new(record_type: LogEditType, data: impl Into<Vec<u8>>) -> Self {
        let buffer = data.into();
        let valid_length = buffer.len();
        Self {
            record_type,
            buffer,
            valid_length,
            anchor: LogAnchor::MIN,
        }
    }

    /// A record backed by `buffer`, of which only the first `valid_length` bytes count.
    pub fn with_buffer(
        record_type: LogEditType,
        buffer: Vec<u8>,
        valid_length: usize,
    ) -> LogResult<Self> {
        let mut r = Self::new(record_type, Vec::new());
        r.set_data(buffer, valid_length)?;
        Ok(r)
    }

    /// An empty `Data` record, typically used as a scan target.
    pub fn empty() -> Self {
        Self::new(LogEditType::Data, Vec::new())
    }

    /// Record kind.
    pub fn record_type(&self) -> LogEditType {
        self.record_type
    }

    /// Change the record kind.
    pub fn set_record_type(&mut self, record_type: LogEditType) {
        self.record_type = record_type;
    }

    /// The valid payload bytes.
    pub fn payload(&self) -> &[u8] {
        &self.buffer[..self.valid_length]
    }

    /// The full backing buffer, including slack past `valid_length`.
    pub fn buffer(&self) -> &[u8] {
        &self.buffer
    }

    /// Number of valid payload bytes.
    pub fn valid_length(&self) -> usize {
        self.valid_length
    }

    /// Replace the backing buffer.
    pub fn set_data(&mut self, buffer: Vec<u8>, valid_length: usize) -> LogResult<()> {
        if valid_length > buffer.len() {
            return Err(LogError::InvalidRecord(format!(
                "valid_length {valid_length} exceeds buffer capacity {}",
                buffer.len()
            )));
        }
        self.buffer = buffer;
        self.valid_length = valid_length;
        Ok(())
    }

    /// Position assigned by the log (`LogAnchor::MIN` until logged or scanned).
    pub fn anchor(&self) -> LogAnchor {
        self.anchor
    }

    pub(crate) fn set_anchor(&mut self, anchor: LogAnchor) {
        self.anchor = anchor;
    }

    /// Overwrite this record from a decoded frame, reusing the buffer.
    pub(crate) fn fill_from(&mut self, frame: &DecodedFrame<'_>) {
        let n = frame.payload.len();
        if self.buffer.len() < n {
            self.buffer.resize(n, 0);
        }
        self.buffer[..n].copy_from_slice(frame.payload);
        self.valid_length = n;
        self.record_type = frame.record_type;
        self.anchor = frame.anchor;
    }
}

impl Default for UserLogRecord {
    fn default() -> Self {
        Self::empty()
    }
}

/// Records compare by type, valid payload and anchor; buffer slack is ignored.
impl PartialEq for UserLogRecord {
    fn eq(&self, other: &Self) -> bool {
        self.record_type == other.record_type
            && self.payload() == other.payload()
            && self.anchor == other.anchor
    }
}

impl Eq for UserLogRecord {}

/// A frame decoded in place; borrows its payload from the input bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DecodedFrame<'a> {
    /// Record kind.
    pub record_type: LogEditType,
    /// Valid payload bytes.
    pub payload: &'a [u8],
    /// Anchor stored in the trailer.
    pub anchor: LogAnchor,
    /// Total frame length in bytes.
    pub frame_len: usize,
}

/// Outcome of parsing the bytes at a frame boundary.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FrameParse<'a> {
    /// A complete, self-consistent frame.
    Complete(DecodedFrame<'a>),
    /// Not enough bytes for a complete frame (clean end or torn write).
    Incomplete,
    /// Enough bytes, but the frame is inconsistent.
    Invalid {
        /// What was wrong.
        reason: String,
        /// Frame length implied by the header, if it was plausible.
        claimed_len: Option<usize>,
    },
}

/// Helper for encoding/decoding record frames.
pub struct RecordFrame;

impl RecordFrame {
    /// Bytes before the payload: type, valid length, capacity.
    pub const HEADER_SIZE: usize = 1 + 4 + 4;
    /// Bytes after the payload: anchor (file, offset, lsn) and crc.
    pub const TRAILER_SIZE: usize = 8 + 8 + 8 + 4;
    /// Fixed per-frame overhead.
    pub const OVERHEAD: usize = Self::HEADER_SIZE + Self::TRAILER_SIZE;

    /// Encoded size of a frame carrying `valid_length` payload bytes.
    pub fn encoded_len(valid_length: usize) -> usize {
        Self::OVERHEAD + valid_length
    }

    /// Append the frame for `record`, positioned at `anchor`, to `out`.
    pub fn encode_into(
        record: &UserLogRecord,
        anchor: LogAnchor,
        out: &mut Vec<u8>,
    ) -> LogResult<()> {
        let payload = record.payload();
        if payload.len() > MAX_RECORD_BYTES {
            return Err(LogError::RecordTooLarge {
                len: payload.len(),
                max: MAX_RECORD_BYTES,
            });
        }
        if !anchor.has_lsn() {
            return Err(LogError::Encode("frame anchor has no lsn".into()));
        }
        let len = u32::try_from(payload.len())
            .map_err(|_| LogError::Encode("record length overflows u32".into()))?;

        let start = out.len();
        out.reserve(Self::encoded_len(payload.len()));
        out.push(record.record_type().tag());
        out.extend_from_slice(&len.to_le_bytes());
        out.extend_from_slice(&len.to_le_bytes());
        out.extend_from_slice(payload);
        out.extend_from_slice(&anchor.file_number().to_le_bytes());
        out.extend_from_slice(&anchor.file_offset().to_le_bytes());
        out.extend_from_slice(&anchor.lsn().to_le_bytes());
        let crc = crc32fast::hash(&out[start..]);
        out.extend_from_slice(&crc.to_le_bytes());
        Ok(())
    }

    /// Frame length announced by a frame header, if the header is complete and its
    /// capacity plausible.
    pub fn claimed_len(header: &[u8]) -> Option<usize> {
        if header.len() < Self::HEADER_SIZE {
            return None;
        }
        let capacity = LittleEndian::read_u32(&header[5..9]) as usize;
        (capacity <= MAX_RECORD_BYTES).then(|| Self::encoded_len(capacity))
    }

    /// Encode the frame for `record`, positioned at `anchor`.
    pub fn encode(record: &UserLogRecord, anchor: LogAnchor) -> LogResult<Vec<u8>> {
        let mut out = Vec::new();
        Self::encode_into(record, anchor, &mut out)?;
        Ok(out)
    }

    /// Parse the frame starting at `bytes[0]` without checking where it claims to live.
    pub fn parse(bytes: &[u8]) -> FrameParse<'_> {
        if bytes.len() < Self::HEADER_SIZE {
            return FrameParse::Incomplete;
        }
        let tag = bytes[0];
        let valid_length = LittleEndian::read_u32(&bytes[1..5]) as usize;
        let capacity = LittleEndian::read_u32(&bytes[5..9]) as usize;

        if capacity > MAX_RECORD_BYTES {
            return FrameParse::Invalid {
                reason: format!("buffer capacity too large: {capacity} (max {MAX_RECORD_BYTES})"),
                claimed_len: None,
            };
        }
        let frame_len = Self::encoded_len(capacity);
        let Some(record_type) = LogEditType::from_tag(tag) else {
            return FrameParse::Invalid {
                reason: format!("unknown record type tag {tag}"),
                claimed_len: Some(frame_len),
            };
        };
        if valid_length > capacity {
            return FrameParse::Invalid {
                reason: format!("valid_length {valid_length} exceeds capacity {capacity}"),
                claimed_len: Some(frame_len),
            };
        }
        if bytes.len() < frame_len {
            return FrameParse::Incomplete;
        }

        let crc_at = frame_len - 4;
        let expected = LittleEndian::read_u32(&bytes[crc_at..frame_len]);
        let actual = crc32fast::hash(&bytes[..crc_at]);
        if expected != actual {
            return FrameParse::Invalid {
                reason: format!("crc mismatch (expected {expected:#010x}, got {actual:#010x})"),
                claimed_len: Some(frame_len),
            };
        }

        let t = Self::HEADER_SIZE + capacity;
        let file_number = LittleEndian::read_u64(&bytes[t..t + 8]);
        let file_offset = LittleEndian::read_u64(&bytes[t + 8..t + 16]);
        let lsn = LittleEndian::read_i64(&bytes[t + 16..t + 24]);
        if lsn == UNKNOWN_LSN {
            return FrameParse::Invalid {
                reason: "trailer carries the unknown lsn".into(),
                claimed_len: Some(frame_len),
            };
        }

        FrameParse::Complete(DecodedFrame {
            record_type,
            payload: &bytes[Self::HEADER_SIZE..Self::HEADER_SIZE + valid_length],
            anchor: LogAnchor::new(file_number, file_offset, lsn),
            frame_len,
        })
    }

    /// Parse the frame read from `file_number`/`file_offset` and check that its trailer
    /// agrees with that position.
    pub fn parse_at(bytes: &[u8], file_number: u64, file_offset: u64) -> FrameParse<'_> {
        match Self::parse(bytes) {
            FrameParse::Complete(f)
                if f.anchor.file_number() != file_number
                    || f.anchor.file_offset() != file_offset =>
            {
                FrameParse::Invalid {
                    reason: format!(
                        "trailer anchor {} does not match read position {file_number}:{file_offset}",
                        f.anchor
                    ),
                    claimed_len: Some(f.frame_len),
                }
            }
            other => other,
        }
    }

    /// Strictly decode one frame into an owned record, returning it and the frame length.
    pub fn decode(bytes: &[u8]) -> LogResult<(UserLogRecord, usize)> {
        match Self::parse(bytes) {
            FrameParse::Complete(f) => {
                let mut r = UserLogRecord::empty();
                r.fill_from(&f);
                Ok((r, f.frame_len))
            }
            FrameParse::Incomplete => Err(LogError::Decode("truncated frame".into())),
            FrameParse::Invalid { reason, .. } => Err(LogError::Decode(reason)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn frame(payload: &[u8], anchor: LogAnchor) -> Vec<u8> {
        RecordFrame::encode(&UserLogRecord::new(LogEditType::Data, payload), anchor).unwrap()
    }

    #[test]
    fn encode_then_decode_preserves_record() {
        let mut rec = UserLogRecord::with_buffer(LogEditType::Txn, b"commit-7____".to_vec(), 8)
            .unwrap();
        let anchor = LogAnchor::new(3, 24, 41);
        let bytes = RecordFrame::encode(&rec, anchor).unwrap();
        assert_eq!(bytes.len(), RecordFrame::encoded_len(8));

        let (out, used) = RecordFrame::decode(&bytes).unwrap();
        rec.set_anchor(anchor);
        assert_eq!(used, bytes.len());
        assert_eq!(out, rec);
        assert_eq!(out.payload(), b"commit-7");
    }

    #[test]
    fn valid_length_beyond_buffer_is_rejected() {
        let err = UserLogRecord::with_buffer(LogEditType::Data, vec![0; 4], 5).unwrap_err();
        assert!(matches!(err, LogError::InvalidRecord(_)));
    }

    #[test]
    fn every_strict_prefix_is_incomplete() {
        let bytes = frame(b"hello", LogAnchor::new(0, 24, 0));
        for cut in 0..bytes.len() {
            assert_eq!(RecordFrame::parse(&bytes[..cut]), FrameParse::Incomplete, "cut={cut}");
        }
    }

    #[test]
    fn flipped_payload_bit_is_invalid() {
        let mut bytes = frame(b"hello", LogAnchor::new(0, 24, 0));
        bytes[RecordFrame::HEADER_SIZE + 1] ^= 0x01;
        match RecordFrame::parse(&bytes) {
            FrameParse::Invalid {
                reason,
                claimed_len,
            } => {
                assert!(reason.contains("crc mismatch"));
                assert_eq!(claimed_len, Some(bytes.len()));
            }
            other => panic!("unexpected parse: {other:?}"),
        }
    }

    #[test]
    fn zero_fill_is_invalid_not_a_record() {
        let zeros = vec![0u8; 64];
        assert!(matches!(
            RecordFrame::parse(&zeros),
            FrameParse::Invalid { .. }
        ));
    }

    #[test]
    fn trailer_must_match_read_position() {
        let bytes = frame(b"x", LogAnchor::new(2, 24, 9));
        assert!(matches!(
            RecordFrame::parse_at(&bytes, 2, 24),
            FrameParse::Complete(_)
        ));
        assert!(matches!(
            RecordFrame::parse_at(&bytes, 2, 62),
            FrameParse::Invalid { .. }
        ));
        assert!(matches!(
            RecordFrame::parse_at(&bytes, 3, 24),
            FrameParse::Invalid { .. }
        ));
    }

    #[test]
    fn oversized_capacity_is_rejected_before_allocation() {
        let mut bytes = vec![2u8];
        bytes.extend_from_slice(&1u32.to_le_bytes());
        bytes.extend_from_slice(&u32::MAX.to_le_bytes());
        match RecordFrame::parse(&bytes) {
            FrameParse::Invalid { claimed_len, .. } => assert_eq!(claimed_len, None),
            other => panic!("unexpected parse: {other:?}"),
        }
    }

    #[test]
    fn unknown_lsn_anchor_cannot_be_encoded() {
        let rec = UserLogRecord::new(LogEditType::Data, b"a".to_vec());
        assert!(RecordFrame::encode(&rec, LogAnchor::at(0, 24)).is_err());
    }

    #[test]
    fn fill_from_grows_and_reuses_buffer() {
        let long = frame(b"a longer payload", LogAnchor::new(0, 24, 0));
        let short = frame(b"ab", LogAnchor::new(0, 24 + long.len() as u64, 1));

        let mut out = UserLogRecord::empty();
        let FrameParse::Complete(f) = RecordFrame::parse(&long) else {
            panic!("expected complete frame");
        };
        out.fill_from(&f);
        assert_eq!(out.payload(), b"a longer payload");

        let FrameParse::Complete(f) = RecordFrame::parse(&short) else {
            panic!("expected complete frame");
        };
        out.fill_from(&f);
        assert_eq!(out.payload(), b"ab");
        assert_eq!(out.valid_length(), 2);
        assert!(out.buffer().len() >= 16);
        assert_eq!(out.anchor().lsn(), 1);
    }
}
