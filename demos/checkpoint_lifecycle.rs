//! Minimal "consumer" example for `txnlog`.
//!
//! It exercises the log lifecycle end to end:
//! - logging data records and a transaction record
//! - advancing the min-needed position and reclaiming old segments
//! - reopening and scanning from the persisted position
//!
//! Run:
//! `cargo run --example checkpoint_lifecycle`

use txnlog::{Log, LogConfig, LogEditType, UserLogRecord, UNKNOWN_LSN};

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let tmp = tempfile::tempdir()?;
    let config = LogConfig::new(tmp.path())
        .with_buffer_size(4 * 1024)
        .with_soft_file_size_limit(1024);

    let log = Log::open(config.clone())?;
    let mut commit = None;
    for txn in 0..20u32 {
        for i in 0..8u32 {
            let body = format!("txn {txn} edit {i}");
            log.log(&mut UserLogRecord::new(LogEditType::Data, body), false)?;
        }
        // The commit record is the one the caller must be able to replay from.
        let anchor = log.log(
            &mut UserLogRecord::new(LogEditType::Txn, txn.to_le_bytes().to_vec()),
            true,
        )?;
        if txn == 14 {
            commit = Some(anchor);
        }
    }
    log.sync(UNKNOWN_LSN)?;
    println!(
        "wrote lsn 0..={} across segments {:?}",
        log.last_issued_lsn(),
        log.segment_numbers()?
    );

    if let Some(anchor) = commit {
        log.advance_min_needed_log_position(anchor);
        let removed = log.reclaim_obsolete_segments()?;
        println!("reclaimed {removed} segment(s), kept {:?}", log.segment_numbers()?);
    }
    log.close()?;

    // Reopen: the min-needed position is restored from the checkpoint file.
    let log = Log::open(config)?;
    let start = log.min_needed_position().ok_or("no persisted position")?;
    println!("resuming from {start}");

    let mut scan = log.begin_scan_at(start)?;
    let mut out = UserLogRecord::empty();
    let mut txns = 0;
    while scan.next_record(&mut out)? {
        if out.record_type() == LogEditType::Txn {
            txns += 1;
        }
    }
    println!(
        "scanned {txns} transaction(s), last good anchor {}",
        scan.last_good_anchor()
    );
    Ok(())
}
