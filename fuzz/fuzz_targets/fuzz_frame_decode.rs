//! Fuzz target for length-prefixed frame decoding.
//!
//! Arbitrary bytes must never panic the decoder, and a decoded frame must
//! never claim more bytes than it was given.

#![no_main]

use cloudhub::transport::codec::decode_frame;
use libfuzzer_sys::fuzz_target;

const MAX_FRAME: usize = 64 * 1024;

fuzz_target!(|data: &[u8]| {
    if let Ok(Some((_, used))) = decode_frame(data, MAX_FRAME) {
        assert!(used <= data.len());
        assert!(used >= 4);
    }
});
