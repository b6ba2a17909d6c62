//! Private network protection.
//!
//! A [`Protector`] wraps a raw connection before negotiation starts, so
//! peers without the network secret cannot see or take part in anything that
//! follows.
//!
//! The [`PskProtector`] exchange:
//!
//! ```text
//! -> nonce_a (24 bytes, clear)
//! <- nonce_b (24 bytes, clear)
//! ... both directions now XChaCha20(secret, sender's nonce) ...
//! -> fingerprint(secret)
//! <- fingerprint(secret)
//! ```

use crate::error::UpgradeError;
use async_trait::async_trait;
use std::fmt;
use std::io;
use std::pin::Pin;
use std::task::{Context, Poll, ready};
use tether_crypto::PNET_NONCE_SIZE;
use tether_crypto::pnet::{Fingerprint, Keystream, NetworkSecret};
use tether_crypto::random::random_24;
use tether_transport::{Address, BoxedConnection, RawConnection};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadBuf};
use tracing::debug;

/// Largest chunk encrypted per `poll_write`.
const MAX_WRITE_CHUNK: usize = 64 * 1024;

/// Wraps raw connections for a private network.
#[async_trait]
pub trait Protector: Send + Sync {
    /// Wrap `conn` so all further traffic is protected.
    ///
    /// # Errors
    ///
    /// Returns an error if the peer is not part of the same network or the
    /// connection fails; the raw connection is dropped in that case.
    async fn protect(&self, conn: BoxedConnection) -> Result<BoxedConnection, UpgradeError>;

    /// Fingerprint of the protected network
    fn fingerprint(&self) -> Fingerprint;
}

/// Pre-shared key protector using XChaCha20 keystreams.
pub struct PskProtector {
    secret: NetworkSecret,
    fingerprint: Fingerprint,
}

impl PskProtector {
    /// Create a protector for `secret`
    #[must_use]
    pub fn new(secret: NetworkSecret) -> Self {
        let fingerprint = secret.fingerprint();
        Self {
            secret,
            fingerprint,
        }
    }

    /// Create a protector from swarm key file contents
    ///
    /// # Errors
    ///
    /// Returns [`UpgradeError::Crypto`] if the key cannot be parsed.
    pub fn from_swarm_key(contents: &str) -> Result<Self, UpgradeError> {
        Ok(Self::new(NetworkSecret::parse(contents)?))
    }
}

impl fmt::Debug for PskProtector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PskProtector")
            .field("fingerprint", &self.fingerprint)
            .finish_non_exhaustive()
    }
}

#[async_trait]
impl Protector for PskProtector {
    async fn protect(&self, mut conn: BoxedConnection) -> Result<BoxedConnection, UpgradeError> {
        let local_nonce = random_24()?;
        conn.write_all(&local_nonce).await?;
        conn.flush().await?;

        let mut remote_nonce = [0u8; PNET_NONCE_SIZE];
        conn.read_exact(&mut remote_nonce).await?;

        let mut protected = ProtectedConnection {
            inner: conn,
            outbound: Keystream::new(&self.secret, &local_nonce),
            inbound: Keystream::new(&self.secret, &remote_nonce),
            pending: Vec::new(),
        };

        protected.write_all(self.fingerprint.as_bytes()).await?;
        protected.flush().await?;

        let mut remote_fingerprint = [0u8; 32];
        protected.read_exact(&mut remote_fingerprint).await?;
        if !self.fingerprint.matches(&remote_fingerprint) {
            debug!(
                "Private network mismatch with {}",
                protected.inner.remote_addr()
            );
            return Err(UpgradeError::protection("network fingerprint mismatch"));
        }

        Ok(Box::new(protected))
    }

    fn fingerprint(&self) -> Fingerprint {
        self.fingerprint
    }
}

/// Raw connection with both directions under a keystream.
struct ProtectedConnection {
    inner: BoxedConnection,
    outbound: Keystream,
    inbound: Keystream,
    /// Encrypted bytes accepted from the caller but not yet written
    pending: Vec<u8>,
}

impl ProtectedConnection {
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

impl RawConnection for ProtectedConnection {
    fn local_addr(&self) -> &Address {
        self.inner.local_addr()
    }

    fn remote_addr(&self) -> &Address {
        self.inner.remote_addr()
    }
}

impl AsyncRead for ProtectedConnection {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        let before = buf.filled().len();
        ready!(Pin::new(&mut this.inner).poll_read(cx, buf))?;
        this.inbound
            .apply(&mut buf.filled_mut()[before..])
            .map_err(io::Error::other)?;
        Poll::Ready(Ok(()))
    }
}

impl AsyncWrite for ProtectedConnection {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let this = self.get_mut();
        ready!(this.poll_drain(cx))?;

        let n = buf.len().min(MAX_WRITE_CHUNK);
        let start = this.pending.len();
        this.pending.extend_from_slice(&buf[..n]);
        if let Err(e) = this.outbound.apply(&mut this.pending[start..]) {
            this.pending.truncate(start);
            return Poll::Ready(Err(io::Error::other(e)));
        }

        // The bytes are committed to the keystream; write errors surface on
        // the next call.
        if let Poll::Ready(Err(e)) = this.poll_drain(cx) {
            debug!("Deferred protected write error: {}", e);
        }
        Poll::Ready(Ok(n))
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        ready!(this.poll_drain(cx))?;
        Pin::new(&mut this.inner).poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        ready!(this.poll_drain(cx))?;
        Pin::new(&mut this.inner).poll_shutdown(cx)
    }
}
