//! Error types for connection upgrades
//!
//! Errors are categorized to support retry decisions at the call site.
//!
//! # Error Categories
//!
//! - **Transient**: may succeed if the dial is attempted again (timeouts,
//!   refused or reset raw connections)
//! - **Permanent**: will not succeed without intervention (missing
//!   transport, protection required, identity mismatch, invalid config)
//!
//! On the dial path every error is returned to the caller. On the accept path
//! per-connection errors are logged and counted by the listener, and only
//! listener-fatal conditions reach [`crate::Listener::accept`].

use std::borrow::Cow;
use std::io;
use tether_crypto::{CryptoError, PeerId};
use tether_transport::TransportError;
use thiserror::Error;

/// Protocol negotiation failures
#[derive(Debug, Error)]
pub enum NegotiationError {
    /// Length prefix is not a valid unsigned varint
    #[error("invalid length prefix")]
    InvalidVarint,

    /// Message exceeds the negotiation size limit
    #[error("message of {0} bytes exceeds limit")]
    MessageTooLarge(usize),

    /// Message does not end with a newline
    #[error("message missing trailing newline")]
    MissingNewline,

    /// Message is not valid UTF-8
    #[error("message is not valid UTF-8")]
    InvalidUtf8,

    /// Peer did not open with the expected header
    #[error("unexpected negotiation header: {0:?}")]
    UnexpectedHeader(String),

    /// Peer refused the proposed protocol
    #[error("protocol {0} rejected by peer")]
    Rejected(String),

    /// Peer answered with something other than an echo or rejection
    #[error("unexpected negotiation response: {0:?}")]
    UnexpectedMessage(String),

    /// Peer proposed too many unsupported protocols
    #[error("too many protocol proposals")]
    TooManyProposals,

    /// I/O failure while negotiating
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

/// Secure handshake failures
#[derive(Debug, Error)]
pub enum HandshakeError {
    /// Noise protocol failure
    #[error("noise: {0}")]
    Crypto(#[from] CryptoError),

    /// Identity payload is malformed
    #[error("invalid identity payload: {0}")]
    InvalidPayload(Cow<'static, str>),

    /// Identity signature does not bind the Noise static key
    #[error("identity signature does not match session key")]
    InvalidSignature,

    /// Remote proved a different identity than the one dialed
    #[error("peer id mismatch: expected {}, got {}", .expected.short(), .actual.short())]
    PeerMismatch {
        /// Identity the caller asked for
        expected: PeerId,
        /// Identity the remote proved
        actual: PeerId,
    },

    /// Remote presented our own identity
    #[error("connection to self")]
    SelfConnection,

    /// Handshake frame exceeds the Noise message limit
    #[error("handshake frame of {0} bytes exceeds limit")]
    FrameTooLarge(usize),

    /// I/O failure during the handshake
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

/// Errors returned by dialers, listeners and secure connections
#[derive(Debug, Error)]
pub enum UpgradeError {
    /// No transport registered for the address scheme
    #[error("no transport for scheme {0:?}")]
    NoTransport(String),

    /// Private network protection is required but not configured
    #[error("private network protection required but no protector configured")]
    ProtectionRequired,

    /// Private network protector rejected the connection
    #[error("protection failed: {0}")]
    Protection(Cow<'static, str>),

    /// Protocol negotiation failed
    #[error("negotiation failed: {0}")]
    Negotiation(#[from] NegotiationError),

    /// Secure handshake failed
    #[error("handshake failed: {0}")]
    Handshake(#[from] HandshakeError),

    /// Session encryption or decryption failed
    #[error("crypto error: {0}")]
    Crypto(#[from] CryptoError),

    /// Operation exceeded its deadline
    #[error("operation timed out: {0}")]
    Timeout(Cow<'static, str>),

    /// Connection or listener is closed
    #[error("closed")]
    Closed,

    /// Raw transport failure
    #[error("transport error: {0}")]
    Transport(#[from] TransportError),

    /// I/O failure on an established connection
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Invalid configuration
    #[error("invalid configuration: {0}")]
    InvalidConfig(Cow<'static, str>),
}

impl UpgradeError {
    /// Returns true if a new attempt may succeed
    #[must_use]
    pub fn is_transient(&self) -> bool {
        match self {
            UpgradeError::Timeout(_) | UpgradeError::Io(_) => true,
            UpgradeError::Transport(e) => {
                e.is_temporary() || matches!(e, TransportError::ConnectionFailed(_))
            }
            UpgradeError::Negotiation(NegotiationError::Io(_))
            | UpgradeError::Handshake(HandshakeError::Io(_)) => true,
            _ => false,
        }
    }

    /// Returns true if retrying without intervention cannot succeed
    #[must_use]
    pub fn is_permanent(&self) -> bool {
        matches!(
            self,
            UpgradeError::NoTransport(_)
                | UpgradeError::ProtectionRequired
                | UpgradeError::InvalidConfig(_)
                | UpgradeError::Closed
                | UpgradeError::Handshake(
                    HandshakeError::PeerMismatch { .. } | HandshakeError::SelfConnection
                )
                | UpgradeError::Negotiation(NegotiationError::Rejected(_))
        )
    }

    /// Create a timeout error with static context
    #[must_use]
    pub const fn timeout(context: &'static str) -> Self {
        UpgradeError::Timeout(Cow::Borrowed(context))
    }

    /// Create a protection error with static context
    #[must_use]
    pub const fn protection(context: &'static str) -> Self {
        UpgradeError::Protection(Cow::Borrowed(context))
    }

    /// Create an invalid configuration error with static context
    #[must_use]
    pub const fn invalid_config(context: &'static str) -> Self {
        UpgradeError::InvalidConfig(Cow::Borrowed(context))
    }
}

/// Result type for upgrade operations
pub type Result<T> = std::result::Result<T, UpgradeError>;
