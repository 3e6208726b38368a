#![no_main]

use libfuzzer_sys::fuzz_target;
use std::sync::Arc;
use txnlog::storage::{Directory, MemoryDirectory};
use txnlog::{Log, LogConfig, UserLogRecord};

/// Interpret input bytes as a bounded set of log segment blobs.
///
/// Layout:
/// - byte 0: n = number of segments (0..=7)
/// - then n chunks: [len:u16 LE][len bytes]
fuzz_target!(|data: &[u8]| {
    if data.is_empty() {
        return;
    }
    let n = (data[0] % 8) as usize;
    let mut i = 1usize;

    let dir = MemoryDirectory::new();
    for seg in 0..n {
        if i + 2 > data.len() {
            break;
        }
        let len = u16::from_le_bytes([data[i], data[i + 1]]) as usize;
        i += 2;
        let end = (i + len).min(data.len());
        let blob = &data[i..end];
        i = end;

        let blob = if blob.len() > 4096 { &blob[..4096] } else { blob };
        let _ = dir.atomic_write(&format!("log_{seg}.log"), blob);
    }

    // Recovery may reject the directory; it must never panic.
    let Ok(log) = Log::with_directory(Arc::new(dir), LogConfig::new("mem")) else {
        return;
    };
    if let Ok(mut scan) = log.begin_scan() {
        let mut out = UserLogRecord::empty();
        while let Ok(true) = scan.next_record(&mut out) {}
    }
    let _ = log.log(&mut UserLogRecord::empty(), true);
});
