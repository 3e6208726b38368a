//! Concurrency: many threads logging, syncing and scanning one log.

mod support;

use std::collections::HashSet;
use std::sync::Arc;
use std::thread;
use txnlog::{Log, LogAnchor, LogConfig, LogEditType, UserLogRecord, UNKNOWN_LSN};

use support::collect;

const THREADS: usize = 8;
const PER_THREAD: usize = 200;

fn payload(t: usize, i: usize) -> Vec<u8> {
    format!("t{t}-r{i}").into_bytes()
}

#[test]
fn concurrent_appends_get_unique_ordered_positions() {
    let tmp = tempfile::tempdir().unwrap();
    let log = Arc::new(
        Log::open(
            LogConfig::new(tmp.path())
                .with_buffer_size(1024)
                .with_soft_file_size_limit(8 * 1024),
        )
        .unwrap(),
    );

    let handles: Vec<_> = (0..THREADS)
        .map(|t| {
            let log = log.clone();
            thread::spawn(move || {
                let mut anchors: Vec<LogAnchor> = Vec::with_capacity(PER_THREAD);
                for i in 0..PER_THREAD {
                    let mut r = UserLogRecord::new(LogEditType::Data, payload(t, i));
                    // Every tenth record asks for durability.
                    anchors.push(log.log(&mut r, i % 10 == 9).unwrap());
                }
                anchors
            })
        })
        .collect();

    let mut all = Vec::new();
    for h in handles {
        let anchors = h.join().unwrap();
        // Program order within a thread is LSN order.
        assert!(anchors.windows(2).all(|w| w[0] < w[1]));
        all.extend(anchors);
    }
    let lsns: HashSet<i64> = all.iter().map(|a| a.lsn()).collect();
    assert_eq!(lsns.len(), THREADS * PER_THREAD);
    let positions: HashSet<(u64, u64)> = all
        .iter()
        .map(|a| (a.file_number(), a.file_offset()))
        .collect();
    assert_eq!(positions.len(), THREADS * PER_THREAD);

    log.sync(UNKNOWN_LSN).unwrap();
    let mut scan = log.begin_scan().unwrap();
    let records = collect(&mut scan).unwrap();
    assert_eq!(records.len(), THREADS * PER_THREAD);
    // Scan order is LSN order with no gaps.
    for (i, (lsn, _)) in records.iter().enumerate() {
        assert_eq!(*lsn, i as i64);
    }

    // Per-thread payload order survives interleaving.
    for t in 0..THREADS {
        let prefix = format!("t{t}-");
        let mine: Vec<&Vec<u8>> = records
            .iter()
            .map(|(_, p)| p)
            .filter(|p| p.starts_with(prefix.as_bytes()))
            .collect();
        let want: Vec<Vec<u8>> = (0..PER_THREAD).map(|i| payload(t, i)).collect();
        assert_eq!(mine, want.iter().collect::<Vec<_>>());
    }
}

#[test]
fn scanners_run_alongside_writers() {
    let tmp = tempfile::tempdir().unwrap();
    let log = Arc::new(
        Log::open(
            LogConfig::new(tmp.path())
                .with_buffer_size(256)
                .with_soft_file_size_limit(2048),
        )
        .unwrap(),
    );

    let writer = {
        let log = log.clone();
        thread::spawn(move || {
            for i in 0..500usize {
                let mut r = UserLogRecord::new(LogEditType::Data, i.to_le_bytes().to_vec());
                let a = log.log(&mut r, i % 7 == 0).unwrap();
                if i % 50 == 49 {
                    log.advance_min_needed_log_position(a);
                }
            }
            log.sync(UNKNOWN_LSN).unwrap();
        })
    };

    let readers: Vec<_> = (0..3)
        .map(|_| {
            let log = log.clone();
            thread::spawn(move || {
                for _ in 0..20 {
                    let mut scan = log.begin_scan().unwrap();
                    let records = collect(&mut scan).unwrap();
                    // Every pass sees a gap-free run of LSNs.
                    assert!(records.windows(2).all(|w| w[1].0 == w[0].0 + 1));
                    scan.close();
                }
            })
        })
        .collect();

    writer.join().unwrap();
    for r in readers {
        r.join().unwrap();
    }

    let mut scan = log.begin_scan().unwrap();
    let records = collect(&mut scan).unwrap();
    assert_eq!(records.last().map(|(l, _)| *l), Some(499));
}
