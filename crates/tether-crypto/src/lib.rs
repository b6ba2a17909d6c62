//! # TETHER Crypto
//!
//! Cryptographic building blocks for the TETHER connection upgrader.
//!
//! This crate provides:
//! - Ed25519 identity keys and content-derived peer identifiers
//! - `Noise_XX` handshake state machine for mutual authentication
//! - Private-network pre-shared keys, fingerprints and keystreams
//! - Secure random number generation
//!
//! ## Cryptographic Suite
//!
//! | Function | Algorithm | Security Level |
//! |----------|-----------|----------------|
//! | Identity | Ed25519 | 128-bit |
//! | Key Exchange | X25519 (Noise XX) | 128-bit |
//! | Session AEAD | ChaCha20-Poly1305 | 256-bit key |
//! | Handshake Hash | BLAKE2s | 128-bit collision |
//! | Peer ID / Fingerprint | BLAKE3 derive_key | 128-bit |
//! | Network Protection | XChaCha20 keystream | 256-bit key |

#![warn(missing_docs)]
#![warn(clippy::all)]
#![deny(unsafe_code)]

pub mod error;
pub mod identity;
pub mod noise;
pub mod pnet;
pub mod random;

pub use error::CryptoError;
pub use identity::{Keypair, PeerId, PublicKey, Signature};

/// Ed25519 public key size
pub const ED25519_PUBLIC_KEY_SIZE: usize = 32;

/// Ed25519 secret key size
pub const ED25519_SECRET_KEY_SIZE: usize = 32;

/// Ed25519 signature size
pub const ED25519_SIGNATURE_SIZE: usize = 64;

/// X25519 public key size
pub const X25519_PUBLIC_KEY_SIZE: usize = 32;

/// Peer identifier size
pub const PEER_ID_SIZE: usize = 32;

/// Pre-shared network key size
pub const NETWORK_SECRET_SIZE: usize = 32;

/// XChaCha20 nonce size used by the network protector
pub const PNET_NONCE_SIZE: usize = 24;
