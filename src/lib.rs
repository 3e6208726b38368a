//! `txnlog`: a segment-based, crash-recoverable transactional write-ahead log.
//!
//! Scope:
//! - position model (`anchor`)
//! - record framing (`record`)
//! - segment files and reclamation (`segment`)
//! - LSN allocation and write buffering (`writer`)
//! - startup recovery (`recover`)
//! - the engine façade (`log`) and forward scanning (`scanner`)
//! - directory abstraction (`storage`) and the persisted min-needed anchor (`checkpoint`)
//!
//! Non-goal: interpreting payloads. Records are opaque bytes tagged `Txn` or `Data`;
//! their meaning belongs to the transaction manager that logs them.
//!
//! ## Contract (what you can rely on)
//!
//! - **Total order**: every record gets a [`LogAnchor`] (file number, offset, LSN).
//!   LSNs strictly increase in append order, and file/offset order agrees with them.
//! - **Durability on request**: once `log(record, true)` or `sync(lsn)` returns, the
//!   record and everything before it survive a crash (on filesystem backends).
//! - **Prefix recovery**: reopening a log recovers exactly the fully written records.
//!   A torn write at the tail is truncated; damage anywhere else is an error, never
//!   silently skipped.
//! - **Reclamation safety**: a segment is deleted only once it lies entirely before
//!   the declared min-needed position and no scanner has it open.
//!
//! Terminology:
//! - `flush` (writer drain) is a **visibility boundary**; `sync` adds the stable-storage
//!   barrier.
//! - Reclamation is deferred and batched; see [`Log::reclaim_obsolete_segments`].
//!
//! ```no_run
//! use txnlog::{Log, LogEditType, UserLogRecord, UNKNOWN_LSN};
//!
//! # fn main() -> txnlog::LogResult<()> {
//! let log = Log::init("/var/lib/app/txlog", "log", 64 * 1024, 16 * 1024 * 1024)?;
//! let mut rec = UserLogRecord::new(LogEditType::Txn, b"begin 42".to_vec());
//! let anchor = log.log(&mut rec, false)?;
//! log.sync(UNKNOWN_LSN)?;
//!
//! let mut scan = log.begin_scan_at(anchor)?;
//! let mut out = UserLogRecord::empty();
//! while scan.next_record(&mut out)? {
//!     println!("{} {:?}", out.anchor(), out.payload());
//! }
//! # Ok(())
//! # }
//! ```

pub mod anchor;
pub mod checkpoint;
pub mod config;
pub mod error;
pub mod formats;
pub mod log;
pub mod record;
pub mod recover;
pub mod scanner;
pub mod segment;
pub mod storage;
mod writer;

pub use anchor::{LogAnchor, UNKNOWN_LSN};
pub use config::LogConfig;
pub use error::{LogError, LogResult};
pub use log::Log;
pub use record::{LogEditType, RecordFrame, UserLogRecord};
pub use scanner::LogScanner;
pub use storage::{Directory, DurableDirectory, FsDirectory, MemoryDirectory};
