//! Transport trait abstraction for raw stream backends.
//!
//! The upgrader never talks to sockets directly. It dials and listens through
//! a [`Transport`] selected by address scheme, and works on
//! [`BoxedConnection`]s that are plain unauthenticated byte streams.

use crate::address::Address;
use async_trait::async_trait;
use std::io;
use tokio::io::{AsyncRead, AsyncWrite};

/// Transport layer errors
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    /// I/O error from underlying transport
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Transport or listener is closed
    #[error("transport is closed")]
    Closed,

    /// Address binding failed
    #[error("failed to bind to address: {0}")]
    BindFailed(String),

    /// Connection failed
    #[error("connection failed: {0}")]
    ConnectionFailed(String),

    /// Address could not be parsed or used by this transport
    #[error("invalid address: {0}")]
    InvalidAddress(String),

    /// Listener stopped accepting after a fatal error
    #[error("listener failed: {0}")]
    ListenerFailed(String),
}

impl TransportError {
    /// Whether an accept loop should retry after this error.
    ///
    /// Covers connections the peer aborted or reset, interrupted calls and
    /// running out of file descriptors.
    #[must_use]
    pub fn is_temporary(&self) -> bool {
        match self {
            TransportError::Io(e) => {
                matches!(
                    e.kind(),
                    io::ErrorKind::ConnectionAborted
                        | io::ErrorKind::ConnectionReset
                        | io::ErrorKind::NotConnected
                        | io::ErrorKind::Interrupted
                        | io::ErrorKind::WouldBlock
                        | io::ErrorKind::TimedOut
                ) || is_fd_exhaustion(e)
            }
            _ => false,
        }
    }
}

#[cfg(unix)]
fn is_fd_exhaustion(e: &io::Error) -> bool {
    // EMFILE and ENFILE
    matches!(e.raw_os_error(), Some(24 | 23))
}

#[cfg(not(unix))]
fn is_fd_exhaustion(_e: &io::Error) -> bool {
    false
}

/// Result type for transport operations
pub type TransportResult<T> = Result<T, TransportError>;

/// A raw, unauthenticated, bidirectional byte stream.
///
/// Dropping the connection closes it.
pub trait RawConnection: AsyncRead + AsyncWrite + Send + Unpin {
    /// Local endpoint address
    fn local_addr(&self) -> &Address;

    /// Remote endpoint address
    fn remote_addr(&self) -> &Address;
}

/// Owned, type-erased raw connection.
pub type BoxedConnection = Box<dyn RawConnection>;

impl RawConnection for BoxedConnection {
    fn local_addr(&self) -> &Address {
        (**self).local_addr()
    }

    fn remote_addr(&self) -> &Address {
        (**self).remote_addr()
    }
}

/// A source of inbound raw connections.
#[async_trait]
pub trait RawListener: Send {
    /// Wait for the next inbound connection.
    ///
    /// Must be cancel-safe: dropping the future loses no connection.
    ///
    /// # Errors
    ///
    /// Returns `TransportError`; callers use
    /// [`TransportError::is_temporary`] to decide whether to keep accepting.
    async fn accept(&mut self) -> TransportResult<BoxedConnection>;

    /// Address the listener is bound to
    fn local_addr(&self) -> &Address;
}

/// Owned, type-erased raw listener.
pub type BoxedListener = Box<dyn RawListener>;

/// A raw stream transport for one address scheme.
#[async_trait]
pub trait Transport: Send + Sync {
    /// The address scheme this transport serves (e.g. `tcp`)
    fn scheme(&self) -> &str;

    /// Open a raw connection to `addr`.
    ///
    /// # Errors
    ///
    /// Returns `TransportError` if the address is unusable or the connection
    /// cannot be established.
    async fn dial(&self, addr: &Address) -> TransportResult<BoxedConnection>;

    /// Start listening on `addr`.
    ///
    /// # Errors
    ///
    /// Returns `TransportError` if the address is unusable or cannot be bound.
    async fn listen(&self, addr: &Address) -> TransportResult<BoxedListener>;
}

/// Reject addresses whose scheme does not belong to `transport`.
pub(crate) fn check_scheme(transport: &dyn Transport, addr: &Address) -> TransportResult<()> {
    if addr.scheme() == transport.scheme() {
        Ok(())
    } else {
        Err(TransportError::InvalidAddress(format!(
            "{addr}: expected scheme {}",
            transport.scheme()
        )))
    }
}
