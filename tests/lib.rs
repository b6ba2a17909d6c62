//! Shared fixtures for the TETHER integration tests.
//!
//! - [`RotProtector`]: a trivially reversible protector that records use
//! - [`RecordingTransport`]: wraps a transport and captures written bytes
//! - [`secure_pair`]: two ends of a secured in-memory connection

use async_trait::async_trait;
use std::io;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll, ready};
use tether_core::{Protector, SecureConnection, UpgradeConfig, UpgradeError, Upgrader};
use tether_crypto::Keypair;
use tether_crypto::pnet::Fingerprint;
use tether_transport::{
    Address, BoxedConnection, BoxedListener, MemoryTransport, RawConnection, RawListener,
    Transport, TransportResult,
};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};

/// Upgrade config that ignores `TETHER_FORCE_PNET`
pub fn plain_config() -> UpgradeConfig {
    UpgradeConfig::default().with_require_protection(false)
}

/// Fresh identity
pub fn keypair() -> Arc<Keypair> {
    Arc::new(Keypair::generate(&mut rand_core::OsRng))
}

/// Upgrader with a fresh identity
pub fn upgrader(config: UpgradeConfig) -> Upgrader {
    Upgrader::new(keypair(), config)
}

/// A memory address unique within the test binary
pub fn unique_memory_addr(prefix: &str) -> Address {
    static NEXT: AtomicU64 = AtomicU64::new(0);
    let n = NEXT.fetch_add(1, Ordering::Relaxed);
    Address::memory(&format!("{prefix}-{n}")).expect("valid memory address")
}

/// Loopback TCP address with a kernel-assigned port
pub fn tcp_loopback() -> Address {
    "tcp://127.0.0.1:0".parse().expect("valid tcp address")
}

/// Both ends of a secured in-memory connection, dialer end first
pub async fn secure_pair(config: UpgradeConfig) -> (SecureConnection, SecureConnection) {
    let transport = MemoryTransport::new();
    let addr = unique_memory_addr("pair");
    let mut listener = transport.listen(&addr).await.expect("listen");
    let client = transport.dial(&addr).await.expect("dial");
    let server = listener.accept().await.expect("accept");

    let dialer = upgrader(config.clone());
    let responder = upgrader(config);
    let (outbound, inbound) = tokio::join!(
        dialer.upgrade_outbound(client, responder.local_peer()),
        responder.upgrade_inbound(server),
    );
    (
        outbound.expect("outbound upgrade"),
        inbound.expect("inbound upgrade"),
    )
}

/// Read until EOF
pub async fn read_to_end(conn: &SecureConnection) -> Result<Vec<u8>, UpgradeError> {
    let mut out = Vec::new();
    let mut buf = vec![0u8; 8 * 1024];
    loop {
        let n = conn.read(&mut buf).await?;
        if n == 0 {
            return Ok(out);
        }
        out.extend_from_slice(&buf[..n]);
    }
}

/// Read exactly `len` bytes
pub async fn read_exact(conn: &SecureConnection, len: usize) -> Result<Vec<u8>, UpgradeError> {
    let mut out = vec![0u8; len];
    let mut filled = 0;
    while filled < len {
        let n = conn.read(&mut out[filled..]).await?;
        if n == 0 {
            return Err(UpgradeError::Closed);
        }
        filled += n;
    }
    Ok(out)
}

/// Echo everything read back to the peer until EOF
pub async fn echo(conn: SecureConnection) {
    let mut buf = vec![0u8; 8 * 1024];
    while let Ok(n) = conn.read(&mut buf).await {
        if n == 0 || conn.write(&buf[..n]).await.is_err() {
            break;
        }
    }
    let _ = conn.close().await;
}

/// Protector that shifts every byte by 13 and remembers it was used.
///
/// Both peers must use it; it provides no security.
#[derive(Debug, Default)]
pub struct RotProtector {
    used: AtomicBool,
}

impl RotProtector {
    /// Create an unused protector
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether `protect` has been called
    pub fn used(&self) -> bool {
        self.used.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Protector for RotProtector {
    async fn protect(&self, conn: BoxedConnection) -> Result<BoxedConnection, UpgradeError> {
        self.used.store(true, Ordering::SeqCst);
        Ok(Box::new(RotConnection {
            inner: conn,
            pending: Vec::new(),
        }))
    }

    fn fingerprint(&self) -> Fingerprint {
        Fingerprint::from_bytes([0u8; 32])
    }
}

struct RotConnection {
    inner: BoxedConnection,
    pending: Vec<u8>,
}

impl RawConnection for RotConnection {
    fn local_addr(&self) -> &Address {
        self.inner.local_addr()
    }

    fn remote_addr(&self) -> &Address {
        self.inner.remote_addr()
    }
}

impl RotConnection {
    fn poll_drain(&mut self, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        while !self.pending.is_empty() {
            let n = ready!(Pin::new(&mut self.inner).poll_write(cx, &self.pending))?;
            if n == 0 {
                return Poll::Ready(Err(io::ErrorKind::WriteZero.into()));
            }
            self.pending.drain(..n);
        }
        Poll::Ready(Ok(()))
    }
}

impl AsyncRead for RotConnection {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let start = buf.filled().len();
        ready!(Pin::new(&mut self.inner).poll_read(cx, buf))?;
        for byte in &mut buf.filled_mut()[start..] {
            *byte = byte.wrapping_sub(13);
        }
        Poll::Ready(Ok(()))
    }
}

impl AsyncWrite for RotConnection {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        ready!(self.poll_drain(cx))?;
        self.pending.extend(buf.iter().map(|b| b.wrapping_add(13)));
        Poll::Ready(Ok(buf.len()))
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        ready!(self.poll_drain(cx))?;
        Pin::new(&mut self.inner).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        ready!(self.poll_drain(cx))?;
        Pin::new(&mut self.inner).poll_shutdown(cx)
    }
}

/// Transport wrapper recording every byte written on its connections.
///
/// Dialed and accepted connections are captured separately.
pub struct RecordingTransport {
    inner: Arc<dyn Transport>,
    dialed: Arc<Mutex<Vec<u8>>>,
    accepted: Arc<Mutex<Vec<u8>>>,
}

impl RecordingTransport {
    /// Wrap `inner`
    pub fn new(inner: Arc<dyn Transport>) -> Self {
        Self {
            inner,
            dialed: Arc::new(Mutex::new(Vec::new())),
            accepted: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// Bytes written so far on dialed connections
    pub fn dialed(&self) -> Vec<u8> {
        self.dialed.lock().map(|w| w.clone()).unwrap_or_default()
    }

    /// Bytes written so far on accepted connections
    pub fn accepted(&self) -> Vec<u8> {
        self.accepted.lock().map(|w| w.clone()).unwrap_or_default()
    }
}

#[async_trait]
impl Transport for RecordingTransport {
    fn scheme(&self) -> &str {
        self.inner.scheme()
    }

    async fn dial(&self, addr: &Address) -> TransportResult<BoxedConnection> {
        let inner = self.inner.dial(addr).await?;
        Ok(Box::new(RecordingConnection {
            inner,
            written: Arc::clone(&self.dialed),
        }))
    }

    async fn listen(&self, addr: &Address) -> TransportResult<BoxedListener> {
        let inner = self.inner.listen(addr).await?;
        Ok(Box::new(RecordingListener {
            inner,
            written: Arc::clone(&self.accepted),
        }))
    }
}

struct RecordingListener {
    inner: BoxedListener,
    written: Arc<Mutex<Vec<u8>>>,
}

#[async_trait]
impl RawListener for RecordingListener {
    async fn accept(&mut self) -> TransportResult<BoxedConnection> {
        let inner = self.inner.accept().await?;
        Ok(Box::new(RecordingConnection {
            inner,
            written: Arc::clone(&self.written),
        }))
    }

    fn local_addr(&self) -> &Address {
        self.inner.local_addr()
    }
}

struct RecordingConnection {
    inner: BoxedConnection,
    written: Arc<Mutex<Vec<u8>>>,
}

impl RawConnection for RecordingConnection {
    fn local_addr(&self) -> &Address {
        self.inner.local_addr()
    }

    fn remote_addr(&self) -> &Address {
        self.inner.remote_addr()
    }
}

impl AsyncRead for RecordingConnection {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_read(cx, buf)
    }
}

impl AsyncWrite for RecordingConnection {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let n = ready!(Pin::new(&mut self.inner).poll_write(cx, buf))?;
        if let Ok(mut written) = self.written.lock() {
            written.extend_from_slice(&buf[..n]);
        }
        Poll::Ready(Ok(n))
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_shutdown(cx)
    }
}

/// Whether `needle` occurs in `haystack`
pub fn contains(haystack: &[u8], needle: &[u8]) -> bool {
    haystack.windows(needle.len()).any(|w| w == needle)
}
