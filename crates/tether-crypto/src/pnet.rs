//! Private network pre-shared keys.
//!
//! Nodes in a private network share a 32-byte [`NetworkSecret`]. Every raw
//! connection is wrapped in an XChaCha20 keystream keyed by that secret before
//! anything else is sent, so peers outside the network cannot even negotiate.
//!
//! Swarm key files use the conventional three-line format:
//!
//! ```text
//! /key/swarm/psk/1.0.0/
//! /base16/
//! <64 hex characters>
//! ```

use crate::random::random_32;
use crate::{CryptoError, NETWORK_SECRET_SIZE, PNET_NONCE_SIZE};
use chacha20::{Key, XChaCha20, XNonce};
use chacha20::cipher::{KeyIvInit, StreamCipher};
use std::fmt;
use subtle::ConstantTimeEq;
use zeroize::{Zeroize, ZeroizeOnDrop, Zeroizing};

const SWARM_KEY_HEADER: &str = "/key/swarm/psk/1.0.0/";
const SWARM_KEY_ENCODING: &str = "/base16/";
const FINGERPRINT_CONTEXT: &str = "tether pnet fingerprint v1";

/// Shared secret for a private network.
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct NetworkSecret([u8; NETWORK_SECRET_SIZE]);

impl NetworkSecret {
    /// Generate a fresh random secret
    ///
    /// # Errors
    ///
    /// Returns [`CryptoError::RandomFailed`] if the OS CSPRNG fails.
    pub fn generate() -> Result<Self, CryptoError> {
        Ok(Self(random_32()?))
    }

    /// Wrap raw secret bytes
    #[must_use]
    pub fn from_bytes(bytes: [u8; NETWORK_SECRET_SIZE]) -> Self {
        Self(bytes)
    }

    /// Raw secret bytes
    #[must_use]
    pub fn as_bytes(&self) -> &[u8; NETWORK_SECRET_SIZE] {
        &self.0
    }

    /// Parse a swarm key file.
    ///
    /// Blank lines and surrounding whitespace are ignored.
    ///
    /// # Errors
    ///
    /// Returns [`CryptoError::InvalidKeyMaterial`] for an unknown header or
    /// encoding, and [`CryptoError::InvalidKeyLength`] if the key does not
    /// decode to 32 bytes.
    pub fn parse(contents: &str) -> Result<Self, CryptoError> {
        let mut lines = contents.lines().map(str::trim).filter(|l| !l.is_empty());

        match lines.next() {
            Some(SWARM_KEY_HEADER) => {}
            Some(other) => {
                return Err(CryptoError::InvalidKeyMaterial(format!(
                    "unknown swarm key header: {other}"
                )));
            }
            None => return Err(CryptoError::InvalidKeyMaterial("empty swarm key".into())),
        }

        match lines.next() {
            Some(SWARM_KEY_ENCODING) => {}
            Some(other) => {
                return Err(CryptoError::InvalidKeyMaterial(format!(
                    "unsupported swarm key encoding: {other}"
                )));
            }
            None => {
                return Err(CryptoError::InvalidKeyMaterial(
                    "missing swarm key encoding".into(),
                ));
            }
        }

        let encoded = lines
            .next()
            .ok_or_else(|| CryptoError::InvalidKeyMaterial("missing swarm key body".into()))?;
        if lines.next().is_some() {
            return Err(CryptoError::InvalidKeyMaterial(
                "trailing data after swarm key".into(),
            ));
        }

        let bytes = Zeroizing::new(
            hex::decode(encoded).map_err(|e| CryptoError::InvalidKeyMaterial(e.to_string()))?,
        );
        let secret: [u8; NETWORK_SECRET_SIZE] =
            bytes
                .as_slice()
                .try_into()
                .map_err(|_| CryptoError::InvalidKeyLength {
                    expected: NETWORK_SECRET_SIZE,
                    actual: bytes.len(),
                })?;
        Ok(Self(secret))
    }

    /// Encode in swarm key file format
    #[must_use]
    pub fn encode(&self) -> String {
        format!(
            "{SWARM_KEY_HEADER}\n{SWARM_KEY_ENCODING}\n{}\n",
            hex::encode(self.0)
        )
    }

    /// Public fingerprint identifying the network without revealing the secret
    #[must_use]
    pub fn fingerprint(&self) -> Fingerprint {
        Fingerprint(blake3::derive_key(FINGERPRINT_CONTEXT, &self.0))
    }
}

impl fmt::Debug for NetworkSecret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "NetworkSecret({})", self.fingerprint().short())
    }
}

/// Fingerprint of a private network.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct Fingerprint([u8; 32]);

impl Fingerprint {
    /// Wrap raw fingerprint bytes
    #[must_use]
    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    /// Raw fingerprint bytes
    #[must_use]
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    /// Constant-time comparison against bytes received from a peer
    #[must_use]
    pub fn matches(&self, other: &[u8]) -> bool {
        other.len() == self.0.len() && bool::from(self.0.ct_eq(other))
    }

    /// Short form for log lines
    #[must_use]
    pub fn short(&self) -> String {
        hex::encode(&self.0[..8])
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&hex::encode(self.0))
    }
}

impl fmt::Debug for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Fingerprint({})", self.short())
    }
}

/// XChaCha20 keystream for one direction of a protected connection.
pub struct Keystream {
    cipher: XChaCha20,
}

impl Keystream {
    /// Create a keystream from the network secret and a per-direction nonce
    #[must_use]
    pub fn new(secret: &NetworkSecret, nonce: &[u8; PNET_NONCE_SIZE]) -> Self {
        Self {
            cipher: XChaCha20::new(
                Key::from_slice(secret.as_bytes()),
                XNonce::from_slice(nonce),
            ),
        }
    }

    /// XOR the next keystream bytes into `buf` in place.
    ///
    /// # Errors
    ///
    /// Returns [`CryptoError::NonceOverflow`] once the 32-bit block counter
    /// is exhausted; `buf` is left untouched.
    pub fn apply(&mut self, buf: &mut [u8]) -> Result<(), CryptoError> {
        self.cipher
            .try_apply_keystream(buf)
            .map_err(|_| CryptoError::NonceOverflow)
    }
}

impl fmt::Debug for Keystream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Keystream").finish_non_exhaustive()
    }
}
