//! Checkpoint file for the min-needed anchor.
//!
//! The log persists the oldest position its owner still needs, so that segments
//! reclaimed before a crash stay reclaimed, and a reopened log scans from the
//! right place.
//!
//! ## Public invariants (must not change without a format bump)
//!
//! - **Header**: `[CHECKPOINT_MAGIC][FORMAT_VERSION][lsn:i64][payload_len:u64][crc32:u32]`
//!   (little-endian for integers).
//! - **Payload**: the postcard-encoded value (a `LogAnchor` for the log's checkpoint).
//! - **Checksum**: `crc32fast` over the payload bytes.
//! - **Atomicity**: writes go through `Directory::atomic_write` (durable variant when
//!   the backend supports barriers), so readers see the old or the new checkpoint.

use crate::anchor::LogAnchor;
use crate::error::{LogError, LogResult};
use crate::formats::{CHECKPOINT_MAGIC, FORMAT_VERSION};
use crate::storage::{Directory, DurableDirectory};
use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use std::io::{Read, Write};
use std::sync::Arc;

/// Upper bound on checkpoint payload size, to avoid allocating from corrupt headers.
pub const MAX_CHECKPOINT_PAYLOAD_BYTES: usize = 64 * 1024;

/// Fixed-size header stored at the start of a checkpoint file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CheckpointHeader {
    /// Magic bytes (should equal `CHECKPOINT_MAGIC`).
    pub magic: [u8; 4],
    /// Format version (should equal `FORMAT_VERSION`).
    pub version: u32,
    /// LSN the checkpoint covers. Monotone across successive checkpoints.
    pub lsn: i64,
    /// Payload length in bytes.
    pub payload_len: u64,
    /// CRC32 computed over payload bytes.
    pub checksum: u32,
}

impl CheckpointHeader {
    /// Number of bytes in the serialized header.
    pub const SIZE: usize = 4 + 4 + 8 + 8 + 4;

    /// Write the header to a stream.
    pub fn write<W: Write>(&self, w: &mut W) -> LogResult<()> {
        w.write_all(&self.magic)?;
        w.write_u32::<LittleEndian>(self.version)?;
        w.write_i64::<LittleEndian>(self.lsn)?;
        w.write_u64::<LittleEndian>(self.payload_len)?;
        w.write_u32::<LittleEndian>(self.checksum)?;
        Ok(())
    }

    /// Read the header from a stream.
    pub fn read<R: Read + ?Sized>(r: &mut R) -> LogResult<Self> {
        let mut magic = [0u8; 4];
        r.read_exact(&mut magic)?;
        if magic != CHECKPOINT_MAGIC {
            return Err(LogError::Format("invalid checkpoint magic".into()));
        }
        let version = r.read_u32::<LittleEndian>()?;
        if version != FORMAT_VERSION {
            return Err(LogError::Format("checkpoint version mismatch".into()));
        }
        Ok(Self {
            magic,
            version,
            lsn: r.read_i64::<LittleEndian>()?,
            payload_len: r.read_u64::<LittleEndian>()?,
            checksum: r.read_u32::<LittleEndian>()?,
        })
    }
}

/// Read/write checkpoint files in a `Directory`.
pub struct CheckpointFile {
    dir: Arc<dyn Directory>,
}

impl CheckpointFile {
    /// Create a checkpoint helper for `dir`.
    pub fn new(dir: Arc<dyn Directory>) -> Self {
        Self { dir }
    }

    /// Write `value` to `path` as postcard bytes with header and CRC.
    ///
    /// Uses the durable publish path when the backend supports barriers.
    pub fn write_postcard<T: serde::Serialize>(
        &self,
        path: &str,
        lsn: i64,
        value: &T,
    ) -> LogResult<()> {
        let payload = postcard::to_allocvec(value).map_err(|e| LogError::Encode(e.to_string()))?;
        if payload.len() > MAX_CHECKPOINT_PAYLOAD_BYTES {
            return Err(LogError::Format(format!(
                "checkpoint payload too large: {} bytes (max {MAX_CHECKPOINT_PAYLOAD_BYTES})",
                payload.len()
            )));
        }
        let h = CheckpointHeader {
            magic: CHECKPOINT_MAGIC,
            version: FORMAT_VERSION,
            lsn,
            payload_len: payload.len() as u64,
            checksum: crc32fast::hash(&payload),
        };
        let mut buf = Vec::with_capacity(CheckpointHeader::SIZE + payload.len());
        h.write(&mut buf)?;
        buf.extend_from_slice(&payload);
        if self.dir.supports_sync(path) {
            self.dir.atomic_write_durable(path, &buf)
        } else {
            self.dir.atomic_write(path, &buf)
        }
    }

    /// Read `path` and decode postcard bytes after CRC validation.
    ///
    /// Returns `(lsn, value)`.
    pub fn read_postcard<T: serde::de::DeserializeOwned>(&self, path: &str) -> LogResult<(i64, T)> {
        let mut f = self.dir.open_file(path)?;
        let h = CheckpointHeader::read(&mut *f)?;
        let len = usize::try_from(h.payload_len)
            .map_err(|_| LogError::Format("payload_len overflow".into()))?;
        if len > MAX_CHECKPOINT_PAYLOAD_BYTES {
            return Err(LogError::Format(format!(
                "checkpoint payload too large: {len} bytes (max {MAX_CHECKPOINT_PAYLOAD_BYTES})"
            )));
        }
        let mut payload = vec![0u8; len];
        f.read_exact(&mut payload)?;
        let got = crc32fast::hash(&payload);
        if got != h.checksum {
            return Err(LogError::CrcMismatch {
                expected: h.checksum,
                actual: got,
            });
        }
        let val: T = postcard::from_bytes(&payload).map_err(|e| LogError::Decode(e.to_string()))?;
        Ok((h.lsn, val))
    }

    /// Persist the min-needed anchor.
    pub fn write_anchor(&self, path: &str, anchor: LogAnchor) -> LogResult<()> {
        self.write_postcard(path, anchor.lsn(), &anchor)
    }

    /// Load the min-needed anchor, or `None` if no checkpoint was ever written.
    pub fn read_anchor(&self, path: &str) -> LogResult<Option<LogAnchor>> {
        if !self.dir.exists(path) {
            return Ok(None);
        }
        let (lsn, anchor): (i64, LogAnchor) = self.read_postcard(path)?;
        if lsn != anchor.lsn() {
            return Err(LogError::Format(format!(
                "checkpoint header lsn {lsn} disagrees with anchor {anchor}"
            )));
        }
        Ok(Some(anchor))
    }
}
