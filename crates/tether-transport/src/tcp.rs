//! TCP transport.
//!
//! Listening sockets are created through `socket2` so `SO_REUSEADDR` can be
//! set before binding; streams have `TCP_NODELAY` enabled since handshake
//! messages are small and latency bound.

use crate::address::Address;
use crate::transport::{
    BoxedConnection, BoxedListener, RawConnection, RawListener, Transport, TransportError,
    TransportResult, check_scheme,
};
use async_trait::async_trait;
use socket2::{Domain, Protocol, Socket, Type};
use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::net::{TcpListener, TcpStream};
use tracing::debug;

/// Address scheme served by [`TcpTransport`].
pub const TCP_SCHEME: &str = "tcp";

/// Listen backlog passed to the kernel.
const LISTEN_BACKLOG: i32 = 1024;

/// TCP transport.
#[derive(Debug, Clone)]
pub struct TcpTransport {
    nodelay: bool,
}

impl TcpTransport {
    /// Create a TCP transport with `TCP_NODELAY` enabled
    #[must_use]
    pub fn new() -> Self {
        Self { nodelay: true }
    }

    /// Enable or disable `TCP_NODELAY` on new streams
    #[must_use]
    pub fn with_nodelay(mut self, nodelay: bool) -> Self {
        self.nodelay = nodelay;
        self
    }

    fn wrap(&self, stream: TcpStream) -> TransportResult<TcpConnection> {
        if self.nodelay {
            stream.set_nodelay(true)?;
        }
        TcpConnection::new(stream)
    }
}

impl Default for TcpTransport {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Transport for TcpTransport {
    fn scheme(&self) -> &str {
        TCP_SCHEME
    }

    async fn dial(&self, addr: &Address) -> TransportResult<BoxedConnection> {
        check_scheme(self, addr)?;
        let socket_addr = addr.socket_addr()?;
        let stream = TcpStream::connect(socket_addr)
            .await
            .map_err(|e| TransportError::ConnectionFailed(format!("{addr}: {e}")))?;
        let conn = self.wrap(stream)?;
        debug!("Dialed {} from {}", conn.remote, conn.local);
        Ok(Box::new(conn))
    }

    async fn listen(&self, addr: &Address) -> TransportResult<BoxedListener> {
        check_scheme(self, addr)?;
        let socket_addr = addr.socket_addr()?;

        let socket = Socket::new(
            Domain::for_address(socket_addr),
            Type::STREAM,
            Some(Protocol::TCP),
        )
        .map_err(|e| TransportError::BindFailed(e.to_string()))?;
        socket
            .set_reuse_address(true)
            .map_err(|e| TransportError::BindFailed(e.to_string()))?;
        socket
            .bind(&socket_addr.into())
            .map_err(|e| TransportError::BindFailed(format!("{addr}: {e}")))?;
        socket
            .listen(LISTEN_BACKLOG)
            .map_err(|e| TransportError::BindFailed(e.to_string()))?;
        socket
            .set_nonblocking(true)
            .map_err(|e| TransportError::BindFailed(e.to_string()))?;

        let std_listener: std::net::TcpListener = socket.into();
        let listener = TcpListener::from_std(std_listener)
            .map_err(|e| TransportError::BindFailed(e.to_string()))?;
        let local = Address::tcp(listener.local_addr()?)?;
        debug!("TCP listener bound to {}", local);

        Ok(Box::new(TcpRawListener {
            listener,
            local,
            transport: self.clone(),
        }))
    }
}

/// Listening TCP socket.
struct TcpRawListener {
    listener: TcpListener,
    local: Address,
    transport: TcpTransport,
}

#[async_trait]
impl RawListener for TcpRawListener {
    async fn accept(&mut self) -> TransportResult<BoxedConnection> {
        loop {
            let (stream, remote) = self.listener.accept().await?;
            // A peer that resets before we get here leaves a dead stream.
            match self.transport.wrap(stream) {
                Ok(conn) => return Ok(Box::new(conn)),
                Err(e) => debug!("Dropping inbound stream from {}: {}", remote, e),
            }
        }
    }

    fn local_addr(&self) -> &Address {
        &self.local
    }
}

/// An established TCP stream.
#[derive(Debug)]
pub struct TcpConnection {
    stream: TcpStream,
    local: Address,
    remote: Address,
}

impl TcpConnection {
    /// Wrap a connected stream
    ///
    /// # Errors
    ///
    /// Returns `TransportError` if the socket addresses cannot be read.
    pub fn new(stream: TcpStream) -> TransportResult<Self> {
        let local = Address::tcp(stream.local_addr()?)?;
        let remote = Address::tcp(stream.peer_addr()?)?;
        Ok(Self {
            stream,
            local,
            remote,
        })
    }
}

impl RawConnection for TcpConnection {
    fn local_addr(&self) -> &Address {
        &self.local
    }

    fn remote_addr(&self) -> &Address {
        &self.remote
    }
}

impl AsyncRead for TcpConnection {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        Pin::new(&mut self.stream).poll_read(cx, buf)
    }
}

impl AsyncWrite for TcpConnection {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.stream).poll_write(cx, buf)
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.stream).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.stream).poll_shutdown(cx)
    }
}
