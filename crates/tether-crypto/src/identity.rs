//! Peer identities backed by Ed25519 keys.
//!
//! Every TETHER node owns a long-term Ed25519 [`Keypair`]. The public half is
//! exchanged (and proven) inside the Noise handshake, and the node's
//! [`PeerId`] is a BLAKE3 derivation of that public key:
//!
//! ```text
//! peer_id = BLAKE3-derive_key("tether peer id v1", ed25519_public_key)
//! ```
//!
//! ## Usage
//!
//! ```
//! use tether_crypto::identity::Keypair;
//! use rand_core::OsRng;
//!
//! let keypair = Keypair::generate(&mut OsRng);
//! let peer_id = keypair.peer_id();
//!
//! let signature = keypair.sign(b"hello");
//! assert!(keypair.public().verify(b"hello", &signature).is_ok());
//! assert_eq!(keypair.public().to_peer_id(), peer_id);
//! ```

use crate::{CryptoError, ED25519_SIGNATURE_SIZE, PEER_ID_SIZE};
use ed25519_dalek::Signer;
use rand_core::{CryptoRng, RngCore};
use std::fmt;
use std::str::FromStr;
use zeroize::{ZeroizeOnDrop, Zeroizing};

/// BLAKE3 context string for peer id derivation.
const PEER_ID_CONTEXT: &str = "tether peer id v1";

/// Ed25519 signature (64 bytes)
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Signature([u8; ED25519_SIGNATURE_SIZE]);

impl Signature {
    /// Create a signature from raw bytes
    #[must_use]
    pub fn from_bytes(bytes: [u8; ED25519_SIGNATURE_SIZE]) -> Self {
        Self(bytes)
    }

    /// Create a signature from a slice
    ///
    /// # Errors
    ///
    /// Returns [`CryptoError::InvalidSignature`] if the slice is not exactly 64 bytes.
    pub fn from_slice(slice: &[u8]) -> Result<Self, CryptoError> {
        let bytes: [u8; ED25519_SIGNATURE_SIZE] =
            slice.try_into().map_err(|_| CryptoError::InvalidSignature)?;
        Ok(Self(bytes))
    }

    /// Get the raw signature bytes
    #[must_use]
    pub fn as_bytes(&self) -> &[u8; ED25519_SIGNATURE_SIZE] {
        &self.0
    }

    fn to_dalek(self) -> ed25519_dalek::Signature {
        ed25519_dalek::Signature::from_bytes(&self.0)
    }
}

/// Long-term identity keypair (Ed25519).
///
/// Owned exclusively by a dialer or listener configuration and never sent
/// over the wire. Zeroized on drop.
#[derive(ZeroizeOnDrop)]
pub struct Keypair {
    inner: ed25519_dalek::SigningKey,
}

impl Keypair {
    /// Generate a new random keypair
    #[must_use]
    pub fn generate<R: RngCore + CryptoRng>(rng: &mut R) -> Self {
        Self {
            inner: ed25519_dalek::SigningKey::generate(rng),
        }
    }

    /// Create from a raw 32-byte seed
    #[must_use]
    pub fn from_bytes(seed: &[u8; 32]) -> Self {
        Self {
            inner: ed25519_dalek::SigningKey::from_bytes(seed),
        }
    }

    /// Parse a hex-encoded 32-byte seed (surrounding whitespace is ignored).
    ///
    /// # Errors
    ///
    /// Returns [`CryptoError::InvalidKeyMaterial`] if the input is not valid
    /// hex or does not decode to exactly 32 bytes.
    pub fn from_hex(encoded: &str) -> Result<Self, CryptoError> {
        let bytes = Zeroizing::new(
            hex::decode(encoded.trim())
                .map_err(|e| CryptoError::InvalidKeyMaterial(e.to_string()))?,
        );
        let seed: &[u8; 32] = bytes.as_slice().try_into().map_err(|_| {
            CryptoError::InvalidKeyMaterial(format!("expected 32 bytes, got {}", bytes.len()))
        })?;
        Ok(Self::from_bytes(seed))
    }

    /// Export the seed bytes (use with extreme caution)
    #[must_use]
    pub fn to_bytes(&self) -> Zeroizing<[u8; 32]> {
        Zeroizing::new(self.inner.to_bytes())
    }

    /// Get the public half of this keypair
    #[must_use]
    pub fn public(&self) -> PublicKey {
        PublicKey {
            inner: self.inner.verifying_key(),
        }
    }

    /// Get the peer identifier derived from the public key
    #[must_use]
    pub fn peer_id(&self) -> PeerId {
        self.public().to_peer_id()
    }

    /// Sign a message (deterministic)
    #[must_use]
    pub fn sign(&self, message: &[u8]) -> Signature {
        Signature(self.inner.sign(message).to_bytes())
    }
}

impl fmt::Debug for Keypair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Keypair")
            .field("peer_id", &self.peer_id())
            .finish_non_exhaustive()
    }
}

/// Identity public key (Ed25519)
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PublicKey {
    inner: ed25519_dalek::VerifyingKey,
}

impl PublicKey {
    /// Create from raw 32-byte public key
    ///
    /// # Errors
    ///
    /// Returns [`CryptoError::InvalidPublicKey`] if the bytes are not a valid
    /// Ed25519 point.
    pub fn from_bytes(bytes: &[u8; 32]) -> Result<Self, CryptoError> {
        let inner = ed25519_dalek::VerifyingKey::from_bytes(bytes)
            .map_err(|_| CryptoError::InvalidPublicKey)?;
        Ok(Self { inner })
    }

    /// Get the raw public key bytes
    #[must_use]
    pub fn to_bytes(&self) -> [u8; 32] {
        self.inner.to_bytes()
    }

    /// Verify a signature on a message
    ///
    /// Uses strict verification (rejects small-order keys and malleable
    /// signatures).
    ///
    /// # Errors
    ///
    /// Returns [`CryptoError::InvalidSignature`] if the signature does not
    /// authenticate the message under this key.
    pub fn verify(&self, message: &[u8], signature: &Signature) -> Result<(), CryptoError> {
        self.inner
            .verify_strict(message, &signature.to_dalek())
            .map_err(|_| CryptoError::InvalidSignature)
    }

    /// Derive the peer identifier bound to this key
    #[must_use]
    pub fn to_peer_id(&self) -> PeerId {
        PeerId(blake3::derive_key(PEER_ID_CONTEXT, self.inner.as_bytes()))
    }
}

/// Content-derived peer identifier.
///
/// Equality is byte-exact. Displays as 64 lowercase hex characters.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PeerId([u8; PEER_ID_SIZE]);

impl PeerId {
    /// Wrap raw identifier bytes
    #[must_use]
    pub const fn from_bytes(bytes: [u8; PEER_ID_SIZE]) -> Self {
        Self(bytes)
    }

    /// Get the raw identifier bytes
    #[must_use]
    pub fn as_bytes(&self) -> &[u8; PEER_ID_SIZE] {
        &self.0
    }

    /// Short form used in log lines (first 8 bytes, hex)
    #[must_use]
    pub fn short(&self) -> String {
        hex::encode(&self.0[..8])
    }
}

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&hex::encode(self.0))
    }
}

impl fmt::Debug for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PeerId({})", self.short())
    }
}

impl FromStr for PeerId {
    type Err = CryptoError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let bytes = hex::decode(s.trim()).map_err(|e| CryptoError::InvalidPeerId(e.to_string()))?;
        let bytes: [u8; PEER_ID_SIZE] = bytes.as_slice().try_into().map_err(|_| {
            CryptoError::InvalidPeerId(format!("expected {PEER_ID_SIZE} bytes, got {}", bytes.len()))
        })?;
        Ok(Self(bytes))
    }
}
