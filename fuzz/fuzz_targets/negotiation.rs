//! Fuzz test for multistream message decoding
//!
//! Arbitrary bytes must never panic the decoder, and any message it accepts
//! must re-encode to the bytes it consumed.

#![no_main]

use libfuzzer_sys::fuzz_target;
use tether_core::select::{decode_message, encode_message};

fuzz_target!(|data: &[u8]| {
    if let Ok(Some((text, consumed))) = decode_message(data) {
        assert!(consumed <= data.len());
        // Non-minimal varints decode fine but re-encode shorter.
        if let Ok(encoded) = encode_message(&text) {
            assert!(encoded.len() <= consumed);
            assert!(data[..consumed].ends_with(&encoded[encoded.len() - text.len() - 1..]));
        }
    }
});
