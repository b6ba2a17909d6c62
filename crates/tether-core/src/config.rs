//! Upgrade configuration

use crate::error::UpgradeError;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

/// Default security protocol tag
pub const DEFAULT_PROTOCOL: &str = "/tether/noise-xx/1.0.0";

/// Default capacity of the listener's ready queue
pub const DEFAULT_ACCEPT_BACKLOG: usize = 128;

/// Environment variable forcing private network protection
pub const FORCE_PNET_ENV: &str = "TETHER_FORCE_PNET";

static DEFAULT_DIAL_TIMEOUT_MS: AtomicU64 = AtomicU64::new(10_000);
static DEFAULT_ACCEPT_TIMEOUT_MS: AtomicU64 = AtomicU64::new(10_000);

/// Set the dial timeout picked up by later [`UpgradeConfig::default`] calls.
///
/// Existing dialers and listeners are unaffected. The stored value has
/// millisecond resolution and is never below 1 ms.
pub fn set_default_dial_timeout(timeout: Duration) {
    DEFAULT_DIAL_TIMEOUT_MS.store(duration_to_ms(timeout), Ordering::Relaxed);
}

/// Set the accept timeout picked up by later [`UpgradeConfig::default`] calls.
///
/// Rounded like [`set_default_dial_timeout`].
pub fn set_default_accept_timeout(timeout: Duration) {
    DEFAULT_ACCEPT_TIMEOUT_MS.store(duration_to_ms(timeout), Ordering::Relaxed);
}

/// Current process-wide default dial timeout
#[must_use]
pub fn default_dial_timeout() -> Duration {
    Duration::from_millis(DEFAULT_DIAL_TIMEOUT_MS.load(Ordering::Relaxed))
}

/// Current process-wide default accept timeout
#[must_use]
pub fn default_accept_timeout() -> Duration {
    Duration::from_millis(DEFAULT_ACCEPT_TIMEOUT_MS.load(Ordering::Relaxed))
}

/// Whole milliseconds, rounded up, at least one.
fn duration_to_ms(timeout: Duration) -> u64 {
    let ms = timeout.as_nanos().div_ceil(1_000_000);
    u64::try_from(ms).unwrap_or(u64::MAX).max(1)
}

/// Whether [`FORCE_PNET_ENV`] asks for mandatory protection
#[must_use]
pub fn force_private_network() -> bool {
    parse_force_flag(std::env::var(FORCE_PNET_ENV).ok().as_deref())
}

fn parse_force_flag(value: Option<&str>) -> bool {
    matches!(
        value.map(|v| v.trim().to_ascii_lowercase()).as_deref(),
        Some("1" | "true" | "yes")
    )
}

/// Configuration shared by dialers and listeners.
///
/// Each dialer or listener uses the config it was constructed with; the
/// process-wide defaults only seed [`UpgradeConfig::default`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UpgradeConfig {
    /// Deadline for the whole outbound upgrade, including the raw dial
    pub dial_timeout: Duration,

    /// Deadline for each inbound upgrade, starting at raw accept
    pub accept_timeout: Duration,

    /// Refuse to operate without a private network protector
    pub require_protection: bool,

    /// Security protocol tag offered and accepted during negotiation
    pub protocol: String,

    /// Secured connections buffered while waiting for `accept`
    pub accept_backlog: usize,
}

impl Default for UpgradeConfig {
    fn default() -> Self {
        Self {
            dial_timeout: default_dial_timeout(),
            accept_timeout: default_accept_timeout(),
            require_protection: force_private_network(),
            protocol: DEFAULT_PROTOCOL.to_string(),
            accept_backlog: DEFAULT_ACCEPT_BACKLOG,
        }
    }
}

impl UpgradeConfig {
    /// Set the dial timeout
    #[must_use]
    pub fn with_dial_timeout(mut self, timeout: Duration) -> Self {
        self.dial_timeout = timeout;
        self
    }

    /// Set the accept timeout
    #[must_use]
    pub fn with_accept_timeout(mut self, timeout: Duration) -> Self {
        self.accept_timeout = timeout;
        self
    }

    /// Require (or stop requiring) private network protection
    #[must_use]
    pub fn with_require_protection(mut self, require: bool) -> Self {
        self.require_protection = require;
        self
    }

    /// Set the security protocol tag
    #[must_use]
    pub fn with_protocol(mut self, protocol: impl Into<String>) -> Self {
        self.protocol = protocol.into();
        self
    }

    /// Set the ready queue capacity
    #[must_use]
    pub fn with_accept_backlog(mut self, backlog: usize) -> Self {
        self.accept_backlog = backlog;
        self
    }

    /// Check the configuration for values the upgrader cannot work with.
    ///
    /// # Errors
    ///
    /// Returns [`UpgradeError::InvalidConfig`] for zero timeouts, a zero
    /// backlog, or a protocol tag that is empty, lacks a leading `/`, or
    /// contains a newline.
    pub fn validate(&self) -> Result<(), UpgradeError> {
        if self.dial_timeout.is_zero() {
            return Err(UpgradeError::invalid_config("dial timeout must be non-zero"));
        }
        if self.accept_timeout.is_zero() {
            return Err(UpgradeError::invalid_config("accept timeout must be non-zero"));
        }
        if self.accept_backlog == 0 {
            return Err(UpgradeError::invalid_config("accept backlog must be non-zero"));
        }
        if !self.protocol.starts_with('/') || self.protocol.len() < 2 {
            return Err(UpgradeError::InvalidConfig(
                format!("protocol tag {:?} must start with '/'", self.protocol).into(),
            ));
        }
        if self.protocol.contains('\n') {
            return Err(UpgradeError::invalid_config(
                "protocol tag must not contain newlines",
            ));
        }
        Ok(())
    }
}
