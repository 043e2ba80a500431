#![no_main]

use autocode_mcp::jsonrpc::{parse_line, parse_request, InboundLine, ERROR_PARSE};
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    let raw = String::from_utf8_lossy(data);
    match parse_line(&raw) {
        Ok(InboundLine::Single(value)) => {
            if let Err(error) = parse_request(&value) {
                assert!(error.into_frame()["error"]["code"].is_i64());
            }
        }
        Ok(InboundLine::Batch(values)) => {
            for value in &values {
                let _ = parse_request(value);
            }
        }
        Err(error) => {
            let frame = error.into_frame();
            assert_eq!(frame["error"]["code"], ERROR_PARSE);
            assert!(frame["id"].is_null());
        }
    }
});
