#![no_main]

use libfuzzer_sys::fuzz_target;
use map_router::core::packet::{DemuxEnd, SubPackets};

fuzz_target!(|data: &[u8]| {
    let mut iter = SubPackets::new(data);
    let mut consumed = 0;
    for raw in iter.by_ref() {
        assert!(raw.bytes.len() >= 4);
        consumed += raw.bytes.len();
        let _ = raw.to_owned();
    }
    assert!(consumed <= data.len());
    assert_eq!(iter.position(), consumed);
    assert_ne!(iter.end(), DemuxEnd::Running);
});
