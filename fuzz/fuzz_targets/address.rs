//! Fuzz test for transport address parsing

#![no_main]

use libfuzzer_sys::fuzz_target;
use tether_crypto::PeerId;
use tether_transport::Address;

fuzz_target!(|data: &[u8]| {
    let Ok(s) = std::str::from_utf8(data) else {
        return;
    };

    if let Ok(addr) = Address::parse(s) {
        assert!(!addr.host().is_empty());
        let _ = addr.socket_addr();
        let _ = Address::parse(addr.as_str());
    }

    if let Ok(peer) = s.parse::<PeerId>() {
        assert_eq!(peer.to_string().parse::<PeerId>().ok(), Some(peer));
    }
});
