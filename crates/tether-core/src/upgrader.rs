//! The upgrade pipeline shared by dialers and listeners.
//!
//! ```text
//! raw -> [protector] -> negotiation -> Noise XX handshake -> SecureConnection
//! ```

use crate::config::UpgradeConfig;
use crate::error::UpgradeError;
use crate::handshake::handshake;
use crate::protector::Protector;
use crate::secure::SecureConnection;
use crate::select::{select_as_initiator, select_as_responder};
use crate::tracker::ResourceTracker;
use std::fmt;
use std::sync::Arc;
use tether_crypto::noise::Role;
use tether_crypto::{Keypair, PeerId};
use tether_transport::BoxedConnection;

/// Turns raw connections into [`SecureConnection`]s.
///
/// Cheap to clone; clones share the identity, protector and tracker.
#[derive(Clone)]
pub struct Upgrader {
    keypair: Arc<Keypair>,
    local_peer: PeerId,
    protector: Option<Arc<dyn Protector>>,
    config: UpgradeConfig,
    tracker: ResourceTracker,
}

impl Upgrader {
    /// Create an upgrader for `keypair` without private network protection
    #[must_use]
    pub fn new(keypair: Arc<Keypair>, config: UpgradeConfig) -> Self {
        let local_peer = keypair.peer_id();
        Self {
            keypair,
            local_peer,
            protector: None,
            config,
            tracker: ResourceTracker::new(),
        }
    }

    /// Protect every connection with `protector`
    #[must_use]
    pub fn with_protector(mut self, protector: Arc<dyn Protector>) -> Self {
        self.protector = Some(protector);
        self
    }

    /// Report resource usage to `tracker`
    #[must_use]
    pub fn with_tracker(mut self, tracker: ResourceTracker) -> Self {
        self.tracker = tracker;
        self
    }

    /// Our peer id
    #[must_use]
    pub fn local_peer(&self) -> PeerId {
        self.local_peer
    }

    /// Our identity keypair
    #[must_use]
    pub fn keypair(&self) -> &Arc<Keypair> {
        &self.keypair
    }

    /// Active configuration
    #[must_use]
    pub fn config(&self) -> &UpgradeConfig {
        &self.config
    }

    /// Resource tracker
    #[must_use]
    pub fn tracker(&self) -> &ResourceTracker {
        &self.tracker
    }

    /// Configured protector, if any
    #[must_use]
    pub fn protector(&self) -> Option<&Arc<dyn Protector>> {
        self.protector.as_ref()
    }

    /// Fail if protection is required but not configured.
    ///
    /// # Errors
    ///
    /// Returns [`UpgradeError::ProtectionRequired`].
    pub fn ensure_protection(&self) -> Result<(), UpgradeError> {
        if self.config.require_protection && self.protector.is_none() {
            return Err(UpgradeError::ProtectionRequired);
        }
        Ok(())
    }

    async fn protect(&self, conn: BoxedConnection) -> Result<BoxedConnection, UpgradeError> {
        match &self.protector {
            Some(protector) => protector.protect(conn).await,
            None => Ok(conn),
        }
    }

    /// Upgrade a dialed connection, requiring the remote to be `expected`.
    ///
    /// # Errors
    ///
    /// Returns the first failing stage's error; `conn` is dropped.
    pub async fn upgrade_outbound(
        &self,
        conn: BoxedConnection,
        expected: PeerId,
    ) -> Result<SecureConnection, UpgradeError> {
        self.ensure_protection()?;
        let mut conn = self.protect(conn).await?;
        select_as_initiator(&mut conn, &self.config.protocol).await?;
        handshake(
            conn,
            &self.keypair,
            Role::Initiator,
            Some(expected),
            self.config.protocol.clone(),
        )
        .await
    }

    /// Upgrade an accepted connection, learning the remote identity.
    ///
    /// # Errors
    ///
    /// Returns the first failing stage's error; `conn` is dropped.
    pub async fn upgrade_inbound(
        &self,
        conn: BoxedConnection,
    ) -> Result<SecureConnection, UpgradeError> {
        self.ensure_protection()?;
        let mut conn = self.protect(conn).await?;
        let protocol =
            select_as_responder(&mut conn, std::slice::from_ref(&self.config.protocol)).await?;
        handshake(conn, &self.keypair, Role::Responder, None, protocol).await
    }
}

impl fmt::Debug for Upgrader {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Upgrader")
            .field("local_peer", &self.local_peer)
            .field(
                "protector",
                &self.protector.as_ref().map(|p| p.fingerprint()),
            )
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}
