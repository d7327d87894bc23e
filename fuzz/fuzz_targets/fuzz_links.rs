//! Fuzz target for LINKS parsing.

#![no_main]

use carton::format::Links;
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    if let Ok(text) = std::str::from_utf8(data) {
        let _ = Links::parse(text);
    }
});
