//! Fuzz target for runner-side request decoding.
//!
//! Arbitrary bytes must decode to a request or an error, never a panic.

#![no_main]

use carton::runner::protocol::{decode_payload, RpcRequest};
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    let _ = decode_payload::<RpcRequest>(data, 1024 * 1024);
});
