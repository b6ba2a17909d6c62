//! Inbound connections.
//!
//! A [`Listener`] runs a background accept loop that owns the raw listener.
//! Every accepted raw connection is upgraded in its own task, bounded by the
//! accept timeout, so slow or hostile peers never hold up the others.
//! Finished upgrades go into a ready queue drained by [`Listener::accept`],
//! in completion order rather than arrival order.
//!
//! ```text
//! raw accept -> spawn upgrade task -> ready queue -> accept()
//!                    |
//!                    +-> failed / timed out: logged and counted
//! ```

use crate::error::UpgradeError;
use crate::secure::SecureConnection;
use crate::tracker::ResourceTracker;
use crate::upgrader::Upgrader;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::Duration;
use tether_crypto::PeerId;
use tether_transport::{Address, BoxedConnection, BoxedListener, Transport, TransportError};
use tokio::sync::{Mutex, mpsc, watch};
use tokio::task::{JoinHandle, JoinSet};
use tracing::{debug, info, warn};

/// Pause before retrying after a temporary accept error
const ACCEPT_RETRY_DELAY: Duration = Duration::from_millis(10);

/// Accepts and upgrades inbound connections.
pub struct Listener {
    local_addr: Address,
    local_peer: PeerId,
    ready: Mutex<mpsc::Receiver<SecureConnection>>,
    shutdown: watch::Sender<bool>,
    accept_loop: Mutex<Option<JoinHandle<()>>>,
    closed: AtomicBool,
    failure: Arc<OnceLock<String>>,
    tracker: ResourceTracker,
}

impl Listener {
    /// Listen on `addr` through `transport`.
    ///
    /// # Errors
    ///
    /// Returns [`UpgradeError::ProtectionRequired`] before binding if
    /// protection is required but missing, [`UpgradeError::InvalidConfig`]
    /// for an invalid configuration, or the transport's bind error.
    pub async fn bind(
        transport: &dyn Transport,
        addr: &Address,
        upgrader: Upgrader,
    ) -> Result<Self, UpgradeError> {
        upgrader.ensure_protection()?;
        upgrader.config().validate()?;
        let raw = transport.listen(addr).await?;
        Self::new(raw, upgrader)
    }

    /// Start upgrading connections accepted by `raw`.
    ///
    /// Must be called within a tokio runtime.
    ///
    /// # Errors
    ///
    /// Returns [`UpgradeError::ProtectionRequired`] if protection is required
    /// but missing, or [`UpgradeError::InvalidConfig`]. `raw` is dropped in
    /// both cases.
    pub fn new(raw: BoxedListener, upgrader: Upgrader) -> Result<Self, UpgradeError> {
        upgrader.ensure_protection()?;
        upgrader.config().validate()?;

        let local_addr = raw.local_addr().clone();
        let local_peer = upgrader.local_peer();
        let (ready_tx, ready_rx) = mpsc::channel(upgrader.config().accept_backlog);
        let (shutdown, shutdown_rx) = watch::channel(false);
        let failure = Arc::new(OnceLock::new());
        let tracker = upgrader.tracker().clone();

        let accept_loop = tokio::spawn(accept_loop(
            raw,
            upgrader,
            ready_tx,
            shutdown_rx,
            Arc::clone(&failure),
        ));
        info!("Listening on {} as {}", local_addr, local_peer.short());

        Ok(Self {
            local_addr,
            local_peer,
            ready: Mutex::new(ready_rx),
            shutdown,
            accept_loop: Mutex::new(Some(accept_loop)),
            closed: AtomicBool::new(false),
            failure,
            tracker,
        })
    }

    /// Wait for the next secured connection.
    ///
    /// Connections are delivered in the order their upgrades complete; each
    /// is delivered to exactly one caller.
    ///
    /// # Errors
    ///
    /// Returns [`UpgradeError::Closed`] once the listener is closed, or
    /// `Transport(ListenerFailed)` after the raw listener failed and all
    /// pending upgrades have drained.
    pub async fn accept(&self) -> Result<SecureConnection, UpgradeError> {
        let mut shutdown = self.shutdown.subscribe();
        if self.is_closed() {
            return Err(UpgradeError::Closed);
        }

        let mut ready = tokio::select! {
            ready = self.ready.lock() => ready,
            () = closed(&mut shutdown) => return Err(UpgradeError::Closed),
        };

        tokio::select! {
            biased;
            () = closed(&mut shutdown) => Err(UpgradeError::Closed),
            conn = ready.recv() => match conn {
                Some(conn) => Ok(conn),
                None => match self.failure.get() {
                    Some(reason) => Err(UpgradeError::Transport(TransportError::ListenerFailed(
                        reason.clone(),
                    ))),
                    None => Err(UpgradeError::Closed),
                },
            },
        }
    }

    /// Stop accepting, abort in-flight upgrades and discard unclaimed
    /// connections.
    ///
    /// # Errors
    ///
    /// Returns [`UpgradeError::Closed`] if the listener was already closed.
    pub async fn close(&self) -> Result<(), UpgradeError> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Err(UpgradeError::Closed);
        }
        self.shutdown.send_replace(true);

        if let Some(handle) = self.accept_loop.lock().await.take() {
            if let Err(e) = handle.await {
                warn!("Accept loop for {} ended abnormally: {}", self.local_addr, e);
            }
        }

        let mut ready = self.ready.lock().await;
        ready.close();
        let mut discarded = 0usize;
        while let Ok(conn) = ready.try_recv() {
            drop(conn);
            discarded += 1;
        }
        if discarded > 0 {
            warn!(
                "Discarded {} unclaimed connections on {}",
                discarded, self.local_addr
            );
        }
        info!("Listener on {} closed", self.local_addr);
        Ok(())
    }

    /// Whether `close` has been called
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Address the raw listener is bound to
    #[must_use]
    pub fn local_addr(&self) -> &Address {
        &self.local_addr
    }

    /// Our peer id
    #[must_use]
    pub fn local_peer(&self) -> PeerId {
        self.local_peer
    }

    /// Resource tracker shared with the upgrade tasks
    #[must_use]
    pub fn tracker(&self) -> &ResourceTracker {
        &self.tracker
    }
}

impl Drop for Listener {
    fn drop(&mut self) {
        self.shutdown.send_replace(true);
        // Aborting the loop drops its JoinSet, which aborts every upgrade.
        if let Some(handle) = self.accept_loop.get_mut().take() {
            handle.abort();
        }
    }
}

impl std::fmt::Debug for Listener {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Listener")
            .field("local_addr", &self.local_addr)
            .field("local_peer", &self.local_peer)
            .field("closed", &self.is_closed())
            .finish_non_exhaustive()
    }
}

/// Resolves once `close` has been signalled or the listener is gone.
///
/// The `watch::Ref` from `wait_for` is not `Send`, so it must not reach a
/// `select!` output that is held across an await.
async fn closed(shutdown: &mut watch::Receiver<bool>) {
    let _ = shutdown.wait_for(|closed| *closed).await;
}

async fn accept_loop(
    mut raw: BoxedListener,
    upgrader: Upgrader,
    ready: mpsc::Sender<SecureConnection>,
    mut shutdown: watch::Receiver<bool>,
    failure: Arc<OnceLock<String>>,
) {
    let local_addr = raw.local_addr().clone();
    let tracker = upgrader.tracker().clone();
    let mut upgrades = JoinSet::new();

    let fatal = loop {
        tokio::select! {
            biased;
            () = closed(&mut shutdown) => break false,
            Some(joined) = upgrades.join_next(), if !upgrades.is_empty() => {
                if let Err(e) = joined {
                    if e.is_panic() {
                        warn!("Upgrade task on {} panicked", local_addr);
                    }
                }
            }
            accepted = raw.accept() => match accepted {
                Ok(conn) => {
                    let conn = tracker.track(conn);
                    let guard = tracker.task_guard();
                    let upgrader = upgrader.clone();
                    let ready = ready.clone();
                    upgrades.spawn(async move {
                        let _guard = guard;
                        upgrade_inbound(upgrader, conn, ready).await;
                    });
                }
                Err(e) if e.is_temporary() => {
                    warn!("Temporary accept error on {}: {}", local_addr, e);
                    tokio::time::sleep(ACCEPT_RETRY_DELAY).await;
                }
                Err(e) => {
                    warn!("Listener on {} failed: {}", local_addr, e);
                    let _ = failure.set(e.to_string());
                    break true;
                }
            },
        }
    };

    // Stop accepting before draining.
    drop(raw);

    if fatal {
        // Let in-flight upgrades finish unless the listener is closed.
        loop {
            tokio::select! {
                biased;
                () = closed(&mut shutdown) => break,
                joined = upgrades.join_next() => {
                    if joined.is_none() {
                        break;
                    }
                }
            }
        }
    }

    upgrades.shutdown().await;
    debug!("Accept loop on {} stopped", local_addr);
}

async fn upgrade_inbound(
    upgrader: Upgrader,
    conn: BoxedConnection,
    ready: mpsc::Sender<SecureConnection>,
) {
    let remote = conn.remote_addr().clone();
    let tracker = upgrader.tracker().clone();
    let deadline = upgrader.config().accept_timeout;

    match tokio::time::timeout(deadline, upgrader.upgrade_inbound(conn)).await {
        Ok(Ok(secure)) => {
            tracker.record_completed();
            debug!(
                "Secured inbound connection from {} ({})",
                remote,
                secure.remote_peer().short()
            );
            if ready.send(secure).await.is_err() {
                debug!("Listener closed, dropping connection from {}", remote);
            }
        }
        Ok(Err(e)) => {
            tracker.record_failed();
            debug!("Inbound upgrade from {} failed: {}", remote, e);
        }
        Err(_) => {
            tracker.record_timed_out();
            debug!("Inbound upgrade from {} timed out", remote);
        }
    }
}
