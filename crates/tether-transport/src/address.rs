//! Transport addresses.
//!
//! Addresses are URLs whose scheme names the transport:
//!
//! ```text
//! tcp://127.0.0.1:4001
//! tcp://[::1]:4001
//! memory://node-a
//! ```

use crate::transport::{TransportError, TransportResult};
use std::fmt;
use std::net::{IpAddr, SocketAddr};
use std::str::FromStr;
use url::{Host, Url};

/// A transport address.
#[derive(Clone, PartialEq, Eq, Hash)]
pub struct Address(Url);

impl Address {
    /// Parse an address string.
    ///
    /// # Errors
    ///
    /// Returns [`TransportError::InvalidAddress`] if the string is not a URL
    /// with a host.
    pub fn parse(input: &str) -> TransportResult<Self> {
        let url = Url::parse(input.trim())
            .map_err(|e| TransportError::InvalidAddress(format!("{input}: {e}")))?;
        if url.host_str().is_none_or(str::is_empty) {
            return Err(TransportError::InvalidAddress(format!(
                "{input}: missing host"
            )));
        }
        Ok(Self(url))
    }

    /// Build a `tcp://` address from a socket address.
    ///
    /// # Errors
    ///
    /// Returns [`TransportError::InvalidAddress`] if the result does not parse.
    pub fn tcp(addr: SocketAddr) -> TransportResult<Self> {
        Self::parse(&format!("tcp://{addr}"))
    }

    /// Build a `memory://` address for a named in-process endpoint.
    ///
    /// # Errors
    ///
    /// Returns [`TransportError::InvalidAddress`] if `name` is not a valid host.
    pub fn memory(name: &str) -> TransportResult<Self> {
        Self::parse(&format!("memory://{name}"))
    }

    /// The scheme used to pick a transport
    #[must_use]
    pub fn scheme(&self) -> &str {
        self.0.scheme()
    }

    /// Host portion (an IP literal or a name)
    #[must_use]
    pub fn host(&self) -> &str {
        self.0.host_str().unwrap_or_default()
    }

    /// Port, if present
    #[must_use]
    pub fn port(&self) -> Option<u16> {
        self.0.port()
    }

    /// Full textual form
    #[must_use]
    pub fn as_str(&self) -> &str {
        self.0.as_str()
    }

    /// Interpret the address as an IP socket address.
    ///
    /// Host names are not resolved.
    ///
    /// # Errors
    ///
    /// Returns [`TransportError::InvalidAddress`] if the host is not an IP
    /// literal or the port is missing.
    pub fn socket_addr(&self) -> TransportResult<SocketAddr> {
        let ip = match self.0.host() {
            Some(Host::Ipv4(ip)) => IpAddr::V4(ip),
            Some(Host::Ipv6(ip)) => IpAddr::V6(ip),
            // Non-special schemes keep IPv4 literals as opaque hosts.
            Some(Host::Domain(host)) => host.parse().map_err(|_| {
                TransportError::InvalidAddress(format!("{self}: host is not an IP address"))
            })?,
            None => {
                return Err(TransportError::InvalidAddress(format!(
                    "{self}: missing host"
                )));
            }
        };
        let port = self
            .port()
            .ok_or_else(|| TransportError::InvalidAddress(format!("{self}: missing port")))?;
        Ok(SocketAddr::new(ip, port))
    }
}

impl FromStr for Address {
    type Err = TransportError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.0.as_str())
    }
}

impl fmt::Debug for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Address({})", self.0.as_str())
    }
}
