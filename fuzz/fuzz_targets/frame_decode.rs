//! Fuzz target for frame decoding
//!
//! Tests that the frame decoder handles arbitrary input without panicking,
//! and that anything it accepts encodes back to the same frame.

#![no_main]

use libfuzzer_sys::fuzz_target;
use wisp_core::{DEFAULT_MAX_FRAME_SIZE, decode_frame, encode_frame, parse_frame};

fuzz_target!(|data: &[u8]| {
    // Bare bodies, as handed over by the length-prefix reader
    if let Ok(message) = decode_frame(data) {
        let frame = encode_frame(&message, DEFAULT_MAX_FRAME_SIZE).expect("decoded message must encode");
        assert_eq!(&frame[4..], data, "re-encoding changed the body");
    }

    // Whole buffers, possibly holding several frames
    let mut offset = 0;
    while let Ok(Some((_, used))) = parse_frame(&data[offset..], DEFAULT_MAX_FRAME_SIZE) {
        assert!(used > 0);
        offset += used;
    }
});
