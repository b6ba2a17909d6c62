//! # TETHER Transport
//!
//! Raw byte-stream transports consumed by the TETHER upgrader.
//!
//! This crate provides:
//! - [`Address`], a URL-shaped transport address whose scheme selects the transport
//! - The [`RawConnection`], [`RawListener`] and [`Transport`] capability traits
//! - A TCP transport built on `socket2` and tokio
//! - An in-process memory transport for tests and embedding

#![warn(missing_docs)]
#![warn(clippy::all)]
#![deny(unsafe_code)]

pub mod address;
pub mod memory;
pub mod tcp;
pub mod transport;

pub use address::Address;
pub use memory::MemoryTransport;
pub use tcp::TcpTransport;
pub use transport::{
    BoxedConnection, BoxedListener, RawConnection, RawListener, Transport, TransportError,
    TransportResult,
};
