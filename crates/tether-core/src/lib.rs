//! # TETHER Core
//!
//! Connection upgrader for peer-to-peer transports.
//!
//! A raw byte stream becomes a [`SecureConnection`] in three stages:
//!
//! 1. **Protection** (optional): a [`Protector`] wraps the stream in a
//!    pre-shared-key keystream so that only members of the same private
//!    network can talk at all.
//! 2. **Negotiation**: multistream-select agrees on the security protocol.
//! 3. **Handshake**: `Noise_XX` with identity payloads authenticates both
//!    peers and derives the session keys.
//!
//! [`Dialer`] runs the outbound side under a dial deadline. [`Listener`]
//! upgrades inbound connections concurrently, each under its own accept
//! deadline, and hands them out in completion order.
//!
//! ## Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use tether_core::{Dialer, UpgradeConfig};
//! use tether_crypto::{Keypair, PeerId};
//! use tether_transport::Address;
//!
//! # async fn run(remote: PeerId) -> tether_core::Result<()> {
//! let keypair = Arc::new(Keypair::generate(&mut rand_core::OsRng));
//! let dialer = Dialer::new(keypair, UpgradeConfig::default());
//! let addr: Address = "tcp://127.0.0.1:4001".parse()?;
//!
//! let conn = dialer.dial(&addr, &remote).await?;
//! conn.write(b"hello").await?;
//! conn.close().await?;
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]
#![deny(unsafe_code)]

pub mod config;
pub mod dialer;
pub mod error;
pub mod handshake;
pub mod listener;
pub mod protector;
pub mod secure;
pub mod select;
pub mod tracker;
pub mod upgrader;

pub use config::UpgradeConfig;
pub use dialer::{Dialer, DialerRegistry};
pub use error::{HandshakeError, NegotiationError, Result, UpgradeError};
pub use listener::Listener;
pub use protector::{Protector, PskProtector};
pub use secure::SecureConnection;
pub use tracker::{ResourceTracker, TrackerSnapshot};
pub use upgrader::Upgrader;
