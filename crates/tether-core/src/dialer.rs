//! Outbound connections.
//!
//! A [`Dialer`] picks a raw transport from its [`DialerRegistry`] by address
//! scheme, opens a raw connection, and runs the outbound upgrade under the
//! configured dial timeout.

use crate::config::UpgradeConfig;
use crate::error::UpgradeError;
use crate::protector::Protector;
use crate::secure::SecureConnection;
use crate::tracker::ResourceTracker;
use crate::upgrader::Upgrader;
use std::fmt;
use std::sync::Arc;
use tether_crypto::{Keypair, PeerId};
use tether_transport::{Address, TcpTransport, Transport};
use tracing::debug;

/// Raw transports keyed by address scheme.
///
/// Holds at most one transport per scheme; inserting a transport for a
/// scheme already present replaces the old one in place.
#[derive(Clone, Default)]
pub struct DialerRegistry {
    transports: Vec<Arc<dyn Transport>>,
}

impl DialerRegistry {
    /// Create an empty registry
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a registry holding only the TCP transport
    #[must_use]
    pub fn with_tcp() -> Self {
        let mut registry = Self::new();
        registry.insert(Arc::new(TcpTransport::new()));
        registry
    }

    /// Add `transport`, returning the transport it replaced, if any
    pub fn insert(&mut self, transport: Arc<dyn Transport>) -> Option<Arc<dyn Transport>> {
        match self
            .transports
            .iter_mut()
            .find(|t| t.scheme() == transport.scheme())
        {
            Some(slot) => Some(std::mem::replace(slot, transport)),
            None => {
                self.transports.push(transport);
                None
            }
        }
    }

    /// Transport registered for `scheme`
    #[must_use]
    pub fn get(&self, scheme: &str) -> Option<Arc<dyn Transport>> {
        self.transports
            .iter()
            .find(|t| t.scheme() == scheme)
            .cloned()
    }

    /// Remove the transport for `scheme`
    pub fn remove(&mut self, scheme: &str) -> Option<Arc<dyn Transport>> {
        let index = self.transports.iter().position(|t| t.scheme() == scheme)?;
        Some(self.transports.remove(index))
    }

    /// Registered schemes in insertion order
    #[must_use]
    pub fn schemes(&self) -> Vec<String> {
        self.transports
            .iter()
            .map(|t| t.scheme().to_string())
            .collect()
    }

    /// Number of registered transports
    #[must_use]
    pub fn len(&self) -> usize {
        self.transports.len()
    }

    /// Whether no transport is registered
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.transports.is_empty()
    }
}

impl fmt::Debug for DialerRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DialerRegistry")
            .field("schemes", &self.schemes())
            .finish()
    }
}

/// Opens secure connections to remote peers.
#[derive(Debug, Clone)]
pub struct Dialer {
    upgrader: Upgrader,
    registry: DialerRegistry,
}

impl Dialer {
    /// Create a dialer with the TCP transport registered
    #[must_use]
    pub fn new(keypair: Arc<Keypair>, config: UpgradeConfig) -> Self {
        Self {
            upgrader: Upgrader::new(keypair, config),
            registry: DialerRegistry::with_tcp(),
        }
    }

    /// Protect every dialed connection with `protector`
    #[must_use]
    pub fn with_protector(mut self, protector: Arc<dyn Protector>) -> Self {
        self.upgrader = self.upgrader.with_protector(protector);
        self
    }

    /// Replace the transport registry
    #[must_use]
    pub fn with_registry(mut self, registry: DialerRegistry) -> Self {
        self.registry = registry;
        self
    }

    /// Report resource usage to `tracker`
    #[must_use]
    pub fn with_tracker(mut self, tracker: ResourceTracker) -> Self {
        self.upgrader = self.upgrader.with_tracker(tracker);
        self
    }

    /// Register `transport`, replacing any transport for the same scheme
    pub fn add_transport(&mut self, transport: Arc<dyn Transport>) {
        if let Some(old) = self.registry.insert(transport) {
            debug!("Replaced dial transport for scheme {}", old.scheme());
        }
    }

    /// Our peer id
    #[must_use]
    pub fn local_peer(&self) -> PeerId {
        self.upgrader.local_peer()
    }

    /// Registered transports
    #[must_use]
    pub fn registry(&self) -> &DialerRegistry {
        &self.registry
    }

    /// Active configuration
    #[must_use]
    pub fn config(&self) -> &UpgradeConfig {
        self.upgrader.config()
    }

    /// Resource tracker
    #[must_use]
    pub fn tracker(&self) -> &ResourceTracker {
        self.upgrader.tracker()
    }

    /// Dial `addr` and authenticate the remote as `peer`.
    ///
    /// The raw dial and the whole upgrade share one deadline. Dropping the
    /// returned future cancels the attempt and closes any raw connection it
    /// opened.
    ///
    /// # Errors
    ///
    /// - [`UpgradeError::ProtectionRequired`] before any I/O if protection is
    ///   required and missing
    /// - [`UpgradeError::InvalidConfig`] before any I/O for an invalid
    ///   configuration
    /// - [`UpgradeError::NoTransport`] if no transport serves the scheme
    /// - [`UpgradeError::Timeout`] if the deadline passes
    /// - the failing stage's error otherwise
    pub async fn dial(
        &self,
        addr: &Address,
        peer: &PeerId,
    ) -> Result<SecureConnection, UpgradeError> {
        self.upgrader.ensure_protection()?;
        self.config().validate()?;
        let transport = self
            .registry
            .get(addr.scheme())
            .ok_or_else(|| UpgradeError::NoTransport(addr.scheme().to_string()))?;

        let tracker = self.upgrader.tracker();
        let attempt = async {
            let raw = tracker.track(transport.dial(addr).await?);
            self.upgrader.upgrade_outbound(raw, *peer).await
        };

        match tokio::time::timeout(self.config().dial_timeout, attempt).await {
            Ok(Ok(conn)) => {
                tracker.record_completed();
                debug!("Dialed {} at {}", peer.short(), addr);
                Ok(conn)
            }
            Ok(Err(e)) => {
                tracker.record_failed();
                debug!("Dial to {} at {} failed: {}", peer.short(), addr, e);
                Err(e)
            }
            Err(_) => {
                tracker.record_timed_out();
                debug!("Dial to {} at {} timed out", peer.short(), addr);
                Err(UpgradeError::timeout("dial"))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand_core::OsRng;
    use std::time::Duration;
    use tether_transport::MemoryTransport;
    use tokio::io::AsyncReadExt;

    fn keypair() -> Arc<Keypair> {
        Arc::new(Keypair::generate(&mut OsRng))
    }

    fn plain_config() -> UpgradeConfig {
        UpgradeConfig::default().with_require_protection(false)
    }

    #[test]
    fn test_registry_replaces_same_scheme() {
        let mut registry = DialerRegistry::with_tcp();
        assert_eq!(registry.schemes(), vec!["tcp".to_string()]);

        let first: Arc<dyn Transport> = Arc::new(MemoryTransport::new());
        let second: Arc<dyn Transport> = Arc::new(MemoryTransport::new());
        assert!(registry.insert(Arc::clone(&first)).is_none());
        let replaced = registry.insert(Arc::clone(&second)).unwrap();

        assert!(Arc::ptr_eq(&replaced, &first));
        assert_eq!(registry.len(), 2);
        assert!(Arc::ptr_eq(&registry.get("memory").unwrap(), &second));
        assert!(registry.remove("memory").is_some());
        assert!(registry.get("memory").is_none());
    }

    #[test]
    fn test_new_dialer_registers_tcp() {
        let dialer = Dialer::new(keypair(), plain_config());
        assert!(dialer.registry().get("tcp").is_some());
    }

    #[tokio::test]
    async fn test_dial_unknown_scheme() {
        let dialer = Dialer::new(keypair(), plain_config());
        let addr = Address::memory("nowhere").unwrap();
        let peer = PeerId::from_bytes([0u8; 32]);
        assert!(matches!(
            dialer.dial(&addr, &peer).await,
            Err(UpgradeError::NoTransport(scheme)) if scheme == "memory"
        ));
    }

    #[tokio::test]
    async fn test_dial_requires_protection_before_io() {
        let transport = MemoryTransport::new();
        let addr = Address::memory("guarded").unwrap();
        let mut raw = transport.listen(&addr).await.unwrap();

        let mut dialer = Dialer::new(keypair(), plain_config().with_require_protection(true));
        dialer.add_transport(Arc::new(transport));

        let peer = PeerId::from_bytes([0u8; 32]);
        assert!(matches!(
            dialer.dial(&addr, &peer).await,
            Err(UpgradeError::ProtectionRequired)
        ));
        // Nothing reached the listener.
        assert!(
            tokio::time::timeout(Duration::from_millis(50), raw.accept())
                .await
                .is_err()
        );
    }

    #[tokio::test]
    async fn test_dial_rejects_invalid_config_before_io() {
        let transport = MemoryTransport::new();
        let addr = Address::memory("misconfigured").unwrap();
        let mut raw = transport.listen(&addr).await.unwrap();
        let peer = PeerId::from_bytes([0u8; 32]);

        for config in [
            plain_config().with_dial_timeout(Duration::ZERO),
            plain_config().with_protocol("/tether/1.0\n/other"),
        ] {
            let mut dialer = Dialer::new(keypair(), config);
            dialer.add_transport(Arc::new(transport.clone()));
            assert!(matches!(
                dialer.dial(&addr, &peer).await,
                Err(UpgradeError::InvalidConfig(_))
            ));
        }
        assert!(
            tokio::time::timeout(Duration::from_millis(50), raw.accept())
                .await
                .is_err()
        );
    }

    #[tokio::test]
    async fn test_dial_times_out_and_releases_connection() {
        let transport = MemoryTransport::new();
        let addr = Address::memory("silent").unwrap();
        let mut raw = transport.listen(&addr).await.unwrap();

        let tracker = ResourceTracker::new();
        let mut dialer = Dialer::new(
            keypair(),
            plain_config().with_dial_timeout(Duration::from_millis(100)),
        )
        .with_tracker(tracker.clone());
        dialer.add_transport(Arc::new(transport));

        let silent = tokio::spawn(async move {
            let mut conn = raw.accept().await.unwrap();
            let mut sink = Vec::new();
            let _ = conn.read_to_end(&mut sink).await;
        });

        let peer = PeerId::from_bytes([9u8; 32]);
        assert!(matches!(
            dialer.dial(&addr, &peer).await,
            Err(UpgradeError::Timeout(_))
        ));
        assert_eq!(tracker.snapshot().timed_out, 1);
        assert_eq!(tracker.open_connections(), 0);

        // The silent side sees the connection close.
        tokio::time::timeout(Duration::from_secs(1), silent)
            .await
            .unwrap()
            .unwrap();
    }
}
