#![no_main]

use autocode_worker::{decode_payload, encode_payload, WorkerLine, WorkerMarkers};
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    let raw = String::from_utf8_lossy(data);
    let markers = WorkerMarkers::with_nonce("00ff00ff00ff00ff");
    let line = markers.classify(&raw);
    if let WorkerLine::Output(text) = &line {
        assert!(!line.is_terminal());
        assert!(!text.ends_with('\n'));
    }
    assert_eq!(decode_payload(&encode_payload(&raw)), raw);
});
