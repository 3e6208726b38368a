//! Shared helpers for integration tests.

#![allow(dead_code)]

mod faulty_directory;

pub use faulty_directory::{FaultConfig, FaultyDirectory};

use txnlog::{Log, LogResult, LogScanner, UserLogRecord};

/// Drain a scanner, returning `(lsn, payload)` pairs.
pub fn collect(scan: &mut LogScanner) -> LogResult<Vec<(i64, Vec<u8>)>> {
    let mut out = UserLogRecord::empty();
    let mut seen = Vec::new();
    while scan.next_record(&mut out)? {
        seen.push((out.anchor().lsn(), out.payload().to_vec()));
    }
    Ok(seen)
}

/// Payloads visible from `log.begin_scan()`.
pub fn payloads(log: &Log) -> Vec<Vec<u8>> {
    let mut scan = log.begin_scan().unwrap();
    collect(&mut scan)
        .unwrap()
        .into_iter()
        .map(|(_, p)| p)
        .collect()
}
