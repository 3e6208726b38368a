#![no_main]

use libfuzzer_sys::fuzz_target;
use std::sync::Arc;
use txnlog::checkpoint::{CheckpointFile, CheckpointHeader};
use txnlog::formats::CHECKPOINT_FILE;
use txnlog::storage::{Directory, MemoryDirectory};

fuzz_target!(|data: &[u8]| {
    let mut cur = std::io::Cursor::new(data);
    let _ = CheckpointHeader::read(&mut cur);

    let dir = MemoryDirectory::new();
    if dir.atomic_write(CHECKPOINT_FILE, data).is_ok() {
        let _ = CheckpointFile::new(Arc::new(dir)).read_anchor(CHECKPOINT_FILE);
    }
});
