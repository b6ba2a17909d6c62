//! In-process memory transport.
//!
//! A [`MemoryTransport`] is a hub of named listeners. Dialing
//! `memory://name` creates a `tokio::io::duplex` pipe and hands one end to the
//! listener bound under that name. Clones share the same hub.

use crate::address::Address;
use crate::transport::{
    BoxedConnection, BoxedListener, RawConnection, RawListener, Transport, TransportError,
    TransportResult, check_scheme,
};
use async_trait::async_trait;
use std::collections::HashMap;
use std::io;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll};
use tokio::io::{AsyncRead, AsyncWrite, DuplexStream, ReadBuf};
use tokio::sync::mpsc;
use tracing::debug;

/// Address scheme served by [`MemoryTransport`].
pub const MEMORY_SCHEME: &str = "memory";

/// Buffer size of each pipe direction.
const PIPE_CAPACITY: usize = 64 * 1024;

/// Pending connections queued per listener.
const ACCEPT_QUEUE: usize = 1024;

#[derive(Default)]
struct Hub {
    listeners: Mutex<HashMap<String, mpsc::Sender<MemoryConnection>>>,
    next_dialer: AtomicU64,
}

/// In-process transport.
#[derive(Clone, Default)]
pub struct MemoryTransport {
    hub: Arc<Hub>,
}

impl MemoryTransport {
    /// Create a transport with its own empty hub
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of names currently bound
    #[must_use]
    pub fn listener_count(&self) -> usize {
        self.hub.listeners.lock().map(|l| l.len()).unwrap_or(0)
    }

    fn lookup(&self, name: &str) -> TransportResult<mpsc::Sender<MemoryConnection>> {
        let listeners = self
            .hub
            .listeners
            .lock()
            .map_err(|_| TransportError::Closed)?;
        listeners
            .get(name)
            .cloned()
            .ok_or_else(|| TransportError::ConnectionFailed(format!("memory://{name}: refused")))
    }
}

impl std::fmt::Debug for MemoryTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryTransport")
            .field("listeners", &self.listener_count())
            .finish()
    }
}

#[async_trait]
impl Transport for MemoryTransport {
    fn scheme(&self) -> &str {
        MEMORY_SCHEME
    }

    async fn dial(&self, addr: &Address) -> TransportResult<BoxedConnection> {
        check_scheme(self, addr)?;
        let tx = self.lookup(addr.host())?;

        let id = self.hub.next_dialer.fetch_add(1, Ordering::Relaxed);
        let dialer_addr = Address::memory(&format!("dialer-{id}"))?;
        let (local, remote) = tokio::io::duplex(PIPE_CAPACITY);

        let server_side = MemoryConnection {
            pipe: remote,
            local: addr.clone(),
            remote: dialer_addr.clone(),
        };
        tx.send(server_side)
            .await
            .map_err(|_| TransportError::ConnectionFailed(format!("{addr}: refused")))?;

        Ok(Box::new(MemoryConnection {
            pipe: local,
            local: dialer_addr,
            remote: addr.clone(),
        }))
    }

    async fn listen(&self, addr: &Address) -> TransportResult<BoxedListener> {
        check_scheme(self, addr)?;
        let name = addr.host().to_string();
        let (tx, rx) = mpsc::channel(ACCEPT_QUEUE);

        {
            let mut listeners = self
                .hub
                .listeners
                .lock()
                .map_err(|_| TransportError::Closed)?;
            if listeners.get(&name).is_some_and(|existing| !existing.is_closed()) {
                return Err(TransportError::BindFailed(format!("{addr}: address in use")));
            }
            listeners.insert(name.clone(), tx.clone());
        }
        debug!("Memory listener bound to {}", addr);

        Ok(Box::new(MemoryListener {
            hub: Arc::clone(&self.hub),
            name,
            local: addr.clone(),
            tx,
            rx,
        }))
    }
}

struct MemoryListener {
    hub: Arc<Hub>,
    name: String,
    local: Address,
    tx: mpsc::Sender<MemoryConnection>,
    rx: mpsc::Receiver<MemoryConnection>,
}

#[async_trait]
impl RawListener for MemoryListener {
    async fn accept(&mut self) -> TransportResult<BoxedConnection> {
        match self.rx.recv().await {
            Some(conn) => Ok(Box::new(conn)),
            None => Err(TransportError::Closed),
        }
    }

    fn local_addr(&self) -> &Address {
        &self.local
    }
}

impl Drop for MemoryListener {
    fn drop(&mut self) {
        if let Ok(mut listeners) = self.hub.listeners.lock() {
            if listeners
                .get(&self.name)
                .is_some_and(|tx| tx.same_channel(&self.tx))
            {
                listeners.remove(&self.name);
            }
        }
    }
}

/// One end of an in-memory pipe.
#[derive(Debug)]
pub struct MemoryConnection {
    pipe: DuplexStream,
    local: Address,
    remote: Address,
}

impl RawConnection for MemoryConnection {
    fn local_addr(&self) -> &Address {
        &self.local
    }

    fn remote_addr(&self) -> &Address {
        &self.remote
    }
}

impl AsyncRead for MemoryConnection {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        Pin::new(&mut self.pipe).poll_read(cx, buf)
    }
}

impl AsyncWrite for MemoryConnection {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.pipe).poll_write(cx, buf)
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.pipe).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.pipe).poll_shutdown(cx)
    }
}
