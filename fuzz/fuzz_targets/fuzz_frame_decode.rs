#![no_main]

use libfuzzer_sys::fuzz_target;
use txnlog::record::FrameParse;
use txnlog::RecordFrame;

fuzz_target!(|data: &[u8]| {
    if let FrameParse::Complete(frame) = RecordFrame::parse(data) {
        assert!(frame.frame_len <= data.len());
    }
    let _ = RecordFrame::parse_at(data, 0, 24);
    let _ = RecordFrame::decode(data);
});
