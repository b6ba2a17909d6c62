//! Process-wide default timeouts.
//!
//! These mutate global state, so they live in their own test binary with a
//! single test.

use std::time::Duration;
use tether_core::UpgradeConfig;
use tether_core::config::{
    default_accept_timeout, default_dial_timeout, set_default_accept_timeout,
    set_default_dial_timeout,
};

#[test]
fn test_process_defaults_seed_new_configs_only() {
    let before = UpgradeConfig::default();
    assert_eq!(before.dial_timeout, default_dial_timeout());
    assert_eq!(before.accept_timeout, default_accept_timeout());

    set_default_dial_timeout(Duration::from_millis(1234));
    set_default_accept_timeout(Duration::from_millis(4321));
    let after = UpgradeConfig::default();
    assert_eq!(after.dial_timeout, Duration::from_millis(1234));
    assert_eq!(after.accept_timeout, Duration::from_millis(4321));
    assert_ne!(before, after);

    // Sub-millisecond values never produce an invalid default.
    set_default_dial_timeout(Duration::from_micros(300));
    set_default_accept_timeout(Duration::ZERO);
    let tiny = UpgradeConfig::default();
    assert_eq!(tiny.dial_timeout, Duration::from_millis(1));
    assert_eq!(tiny.accept_timeout, Duration::from_millis(1));
    assert!(tiny.validate().is_ok());
}
