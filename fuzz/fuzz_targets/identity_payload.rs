//! Fuzz test for handshake identity payloads
//!
//! Decoding and verifying attacker-controlled payloads must fail cleanly.

#![no_main]

use libfuzzer_sys::fuzz_target;
use tether_core::handshake::{IDENTITY_PAYLOAD_SIZE, IdentityPayload};

fuzz_target!(|data: &[u8]| {
    let Ok(payload) = IdentityPayload::decode(data) else {
        return;
    };
    assert_eq!(data.len(), IDENTITY_PAYLOAD_SIZE);
    assert_eq!(&payload.encode()[..], data);

    // A random signature over a random static key almost never verifies;
    // either way it must not panic.
    let mut noise_static = [0u8; 32];
    noise_static.copy_from_slice(&data[..32]);
    let _ = payload.verify(&noise_static);
});
