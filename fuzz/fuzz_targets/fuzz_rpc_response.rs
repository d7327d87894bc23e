//! Fuzz target for loader-side response decoding.

#![no_main]

use carton::runner::protocol::{decode_payload, RpcResponse};
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    let _ = decode_payload::<RpcResponse>(data, 1024 * 1024);
});
