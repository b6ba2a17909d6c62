//! Fuzz test for swarm key parsing
//!
//! Any key file that parses must survive an encode/parse cycle unchanged.

#![no_main]

use libfuzzer_sys::fuzz_target;
use tether_crypto::pnet::NetworkSecret;

fuzz_target!(|data: &[u8]| {
    let Ok(contents) = std::str::from_utf8(data) else {
        return;
    };
    if let Ok(secret) = NetworkSecret::parse(contents) {
        let reparsed = NetworkSecret::parse(&secret.encode()).expect("encoded key parses");
        assert_eq!(reparsed.as_bytes(), secret.as_bytes());
    }
});
