//! Fuzz target for MANIFEST parsing.
//!
//! Whatever parses must serialize back to text that parses to the same
//! manifest.

#![no_main]

use carton::format::Manifest;
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    if let Ok(text) = std::str::from_utf8(data) {
        if let Ok(manifest) = Manifest::parse(text) {
            let again = Manifest::parse(&manifest.to_text()).expect("canonical text parses");
            assert_eq!(manifest.digest(), again.digest());
        }
    }
});
