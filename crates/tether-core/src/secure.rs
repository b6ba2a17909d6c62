//! Encrypted, peer-identified connections.
//!
//! Transport frames are `u16 big-endian length || Noise ciphertext`, each
//! carrying at most [`MAX_FRAME_PLAINTEXT`] bytes of application data.
//!
//! All operations take `&self`, so one connection can be read and written
//! concurrently from different tasks (e.g. behind an `Arc`). `close` wakes
//! any blocked `read` or `write`.

use crate::error::UpgradeError;
use std::fmt;
use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tether_crypto::noise::{
    MAX_NOISE_PAYLOAD_SIZE, NOISE_TAG_SIZE, NoiseReceiver, NoiseSender, NoiseTransport,
};
use tether_crypto::{PeerId, PublicKey};
use tether_transport::{Address, BoxedConnection, RawConnection};
use tokio::io::{AsyncReadExt, AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::sync::{Mutex, watch};
use tracing::debug;

/// Largest plaintext carried in one frame
pub const MAX_FRAME_PLAINTEXT: usize = MAX_NOISE_PAYLOAD_SIZE;

/// Bytes requested from the raw connection per read
const READ_CHUNK: usize = 16 * 1024;

/// How long `close` waits to flush buffered output
const CLOSE_FLUSH_TIMEOUT: Duration = Duration::from_secs(1);

struct ReadState {
    half: Option<ReadHalf<BoxedConnection>>,
    receiver: NoiseReceiver,
    /// Ciphertext received but not yet decrypted
    raw: Vec<u8>,
    /// Decrypted bytes not yet returned
    plaintext: Vec<u8>,
    offset: usize,
    eof: bool,
}

impl ReadState {
    /// Decrypt the next complete frame in `raw`, if any.
    fn decrypt_buffered(&mut self) -> Result<bool, UpgradeError> {
        if self.raw.len() < 2 {
            return Ok(false);
        }
        let len = usize::from(u16::from_be_bytes([self.raw[0], self.raw[1]]));
        if len < NOISE_TAG_SIZE {
            return Err(UpgradeError::Io(io::Error::new(
                io::ErrorKind::InvalidData,
                "secure frame shorter than authentication tag",
            )));
        }
        if self.raw.len() < 2 + len {
            return Ok(false);
        }
        let plaintext = self.receiver.decrypt(&self.raw[2..2 + len])?;
        self.raw.drain(..2 + len);
        self.plaintext = plaintext;
        self.offset = 0;
        Ok(true)
    }
}

struct WriteState {
    half: Option<WriteHalf<BoxedConnection>>,
    sender: NoiseSender,
}

/// An authenticated, encrypted connection to a known peer.
///
/// Only produced by a successful handshake.
pub struct SecureConnection {
    reader: Mutex<ReadState>,
    writer: Mutex<WriteState>,
    close_signal: watch::Sender<bool>,
    closed: AtomicBool,
    local_peer: PeerId,
    remote_peer: PeerId,
    remote_public_key: PublicKey,
    local_addr: Address,
    remote_addr: Address,
    protocol: String,
}

impl SecureConnection {
    pub(crate) fn new(
        conn: BoxedConnection,
        transport: NoiseTransport,
        local_peer: PeerId,
        remote_peer: PeerId,
        remote_public_key: PublicKey,
        protocol: String,
    ) -> Self {
        let local_addr = conn.local_addr().clone();
        let remote_addr = conn.remote_addr().clone();
        let (sender, receiver) = transport.split();
        let (read_half, write_half) = tokio::io::split(conn);
        let (close_signal, _) = watch::channel(false);

        Self {
            reader: Mutex::new(ReadState {
                half: Some(read_half),
                receiver,
                raw: Vec::new(),
                plaintext: Vec::new(),
                offset: 0,
                eof: false,
            }),
            writer: Mutex::new(WriteState {
                half: Some(write_half),
                sender,
            }),
            close_signal,
            closed: AtomicBool::new(false),
            local_peer,
            remote_peer,
            remote_public_key,
            local_addr,
            remote_addr,
            protocol,
        }
    }

    /// Read decrypted bytes into `buf`.
    ///
    /// Returns `Ok(0)` at end of stream, after `close`, or when a blocked
    /// read is interrupted by `close`.
    ///
    /// # Errors
    ///
    /// Returns an error if a frame fails authentication or the raw
    /// connection fails.
    pub async fn read(&self, buf: &mut [u8]) -> Result<usize, UpgradeError> {
        if buf.is_empty() {
            return Ok(0);
        }
        let mut close_rx = self.close_signal.subscribe();
        if self.is_closed() {
            return Ok(0);
        }

        let mut guard = tokio::select! {
            guard = self.reader.lock() => guard,
            _ = close_rx.wait_for(|closed| *closed) => return Ok(0),
        };
        let state = &mut *guard;

        loop {
            if state.offset < state.plaintext.len() {
                let available = &state.plaintext[state.offset..];
                let n = available.len().min(buf.len());
                buf[..n].copy_from_slice(&available[..n]);
                state.offset += n;
                return Ok(n);
            }
            if state.decrypt_buffered()? {
                continue;
            }
            if state.eof {
                return Ok(0);
            }
            let Some(half) = state.half.as_mut() else {
                return Ok(0);
            };

            state.raw.reserve(READ_CHUNK);
            let n = tokio::select! {
                n = half.read_buf(&mut state.raw) => n?,
                _ = close_rx.wait_for(|closed| *closed) => return Ok(0),
            };
            if n == 0 {
                state.eof = true;
                if !state.raw.is_empty() {
                    return Err(UpgradeError::Io(io::Error::new(
                        io::ErrorKind::UnexpectedEof,
                        "connection closed mid-frame",
                    )));
                }
            }
        }
    }

    /// Encrypt and write all of `buf`.
    ///
    /// # Errors
    ///
    /// Returns [`UpgradeError::Closed`] after `close` or `close_write`, and
    /// an I/O error if the raw connection fails.
    pub async fn write(&self, buf: &[u8]) -> Result<usize, UpgradeError> {
        let mut close_rx = self.close_signal.subscribe();
        if self.is_closed() {
            return Err(UpgradeError::Closed);
        }

        let mut guard = tokio::select! {
            guard = self.writer.lock() => guard,
            _ = close_rx.wait_for(|closed| *closed) => return Err(UpgradeError::Closed),
        };
        let state = &mut *guard;
        let Some(half) = state.half.as_mut() else {
            return Err(UpgradeError::Closed);
        };

        for chunk in buf.chunks(MAX_FRAME_PLAINTEXT) {
            let ciphertext = state.sender.encrypt(chunk)?;
            let len = u16::try_from(ciphertext.len()).map_err(|_| {
                UpgradeError::Io(io::Error::new(io::ErrorKind::InvalidInput, "frame too large"))
            })?;
            let mut frame = Vec::with_capacity(2 + ciphertext.len());
            frame.extend_from_slice(&len.to_be_bytes());
            frame.extend_from_slice(&ciphertext);

            tokio::select! {
                result = half.write_all(&frame) => result?,
                _ = close_rx.wait_for(|closed| *closed) => return Err(UpgradeError::Closed),
            }
        }

        tokio::select! {
            result = half.flush() => result?,
            _ = close_rx.wait_for(|closed| *closed) => return Err(UpgradeError::Closed),
        }
        Ok(buf.len())
    }

    /// Close the write direction; the peer reads end of stream.
    ///
    /// # Errors
    ///
    /// Returns [`UpgradeError::Closed`] if already closed in that direction.
    pub async fn close_write(&self) -> Result<(), UpgradeError> {
        if self.is_closed() {
            return Err(UpgradeError::Closed);
        }
        let mut state = self.writer.lock().await;
        let Some(half) = state.half.as_mut() else {
            return Err(UpgradeError::Closed);
        };
        half.shutdown().await?;
        // The raw connection lives on in the read half.
        state.half = None;
        Ok(())
    }

    /// Close the connection and the raw connection beneath it.
    ///
    /// Blocked reads return `Ok(0)` and blocked writes `Err(Closed)`.
    ///
    /// # Errors
    ///
    /// Returns [`UpgradeError::Closed`] if the connection was already closed.
    pub async fn close(&self) -> Result<(), UpgradeError> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Err(UpgradeError::Closed);
        }
        self.close_signal.send_replace(true);

        let write_half = self.writer.lock().await.half.take();
        let read_half = self.reader.lock().await.half.take();

        if let Some(mut half) = write_half {
            if let Ok(Err(e)) = tokio::time::timeout(CLOSE_FLUSH_TIMEOUT, half.shutdown()).await {
                debug!("Shutdown of connection to {} failed: {}", self.remote_addr, e);
            }
            drop(half);
        }
        drop(read_half);
        debug!("Closed secure connection to {}", self.remote_peer.short());
        Ok(())
    }

    /// Whether `close` has been called
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Our peer id
    #[must_use]
    pub fn local_peer(&self) -> PeerId {
        self.local_peer
    }

    /// The authenticated remote peer id
    #[must_use]
    pub fn remote_peer(&self) -> PeerId {
        self.remote_peer
    }

    /// The remote peer's identity key
    #[must_use]
    pub fn remote_public_key(&self) -> &PublicKey {
        &self.remote_public_key
    }

    /// Local address of the raw connection
    #[must_use]
    pub fn local_addr(&self) -> &Address {
        &self.local_addr
    }

    /// Remote address of the raw connection
    #[must_use]
    pub fn remote_addr(&self) -> &Address {
        &self.remote_addr
    }

    /// Negotiated security protocol tag
    #[must_use]
    pub fn protocol(&self) -> &str {
        &self.protocol
    }
}

impl fmt::Debug for SecureConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SecureConnection")
            .field("local_peer", &self.local_peer)
            .field("remote_peer", &self.remote_peer)
            .field("remote_addr", &self.remote_addr)
            .field("protocol", &self.protocol)
            .field("closed", &self.is_closed())
            .finish_non_exhaustive()
    }
}
