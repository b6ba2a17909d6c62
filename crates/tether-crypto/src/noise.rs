//! `Noise_XX` handshake protocol.
//!
//! Implements the XX pattern for mutual authentication on top of `snow`:
//!
//! ```text
//! -> e
//! <- e, ee, s, es      (+ responder payload)
//! -> s, se             (+ initiator payload)
//! ```
//!
//! Both sides use a fresh X25519 static key per handshake; long-term identity
//! is proven by the caller through the encrypted payloads of messages 2 and 3.
//! After the third message both sides switch to transport mode, which is split
//! into independent send and receive halves with their own nonce counters.

use crate::{CryptoError, X25519_PUBLIC_KEY_SIZE};
use rand_core::OsRng;
use std::sync::Arc;
use zeroize::{ZeroizeOnDrop, Zeroizing};

/// The Noise protocol name used for every TETHER session.
pub const NOISE_PATTERN: &str = "Noise_XX_25519_ChaChaPoly_BLAKE2s";

/// Maximum size of a single Noise message on the wire.
pub const MAX_NOISE_MESSAGE_SIZE: usize = 65535;

/// ChaCha20-Poly1305 authentication tag size.
pub const NOISE_TAG_SIZE: usize = 16;

/// Maximum plaintext carried by one transport message.
pub const MAX_NOISE_PAYLOAD_SIZE: usize = MAX_NOISE_MESSAGE_SIZE - NOISE_TAG_SIZE;

/// Which side of the handshake we are.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    /// Sends the first message (dialer)
    Initiator,
    /// Answers the first message (listener)
    Responder,
}

/// Ephemeral-per-session X25519 static keypair for the Noise handshake.
#[derive(ZeroizeOnDrop)]
pub struct NoiseKeypair {
    secret: x25519_dalek::StaticSecret,
    #[zeroize(skip)]
    public: x25519_dalek::PublicKey,
}

impl NoiseKeypair {
    /// Generate a new random keypair from the OS CSPRNG
    #[must_use]
    pub fn generate() -> Self {
        let secret = x25519_dalek::StaticSecret::random_from_rng(OsRng);
        let public = x25519_dalek::PublicKey::from(&secret);
        Self { secret, public }
    }

    /// Public key bytes
    #[must_use]
    pub fn public_key(&self) -> [u8; X25519_PUBLIC_KEY_SIZE] {
        self.public.to_bytes()
    }
}

/// In-progress Noise handshake.
pub struct NoiseHandshake {
    state: snow::HandshakeState,
    role: Role,
}

impl NoiseHandshake {
    /// Create a new handshake for the given role.
    ///
    /// # Errors
    ///
    /// Returns [`CryptoError::Handshake`] if `snow` rejects the parameters.
    pub fn new(role: Role, keypair: &NoiseKeypair) -> Result<Self, CryptoError> {
        let params: snow::params::NoiseParams = NOISE_PATTERN.parse()?;
        let secret = Zeroizing::new(keypair.secret.to_bytes());
        let builder = snow::Builder::new(params).local_private_key(secret.as_slice())?;
        let state = match role {
            Role::Initiator => builder.build_initiator()?,
            Role::Responder => builder.build_responder()?,
        };
        Ok(Self { state, role })
    }

    /// Create a new handshake as the initiator
    ///
    /// # Errors
    ///
    /// See [`NoiseHandshake::new`].
    pub fn new_initiator(keypair: &NoiseKeypair) -> Result<Self, CryptoError> {
        Self::new(Role::Initiator, keypair)
    }

    /// Create a new handshake as the responder
    ///
    /// # Errors
    ///
    /// See [`NoiseHandshake::new`].
    pub fn new_responder(keypair: &NoiseKeypair) -> Result<Self, CryptoError> {
        Self::new(Role::Responder, keypair)
    }

    /// Our role in this handshake
    #[must_use]
    pub fn role(&self) -> Role {
        self.role
    }

    /// Produce the next handshake message carrying `payload`.
    ///
    /// # Errors
    ///
    /// Returns [`CryptoError::Handshake`] if it is not our turn to write or
    /// the payload does not fit in one message.
    pub fn write_message(&mut self, payload: &[u8]) -> Result<Vec<u8>, CryptoError> {
        let mut message = vec![0u8; MAX_NOISE_MESSAGE_SIZE];
        let len = self.state.write_message(payload, &mut message)?;
        message.truncate(len);
        Ok(message)
    }

    /// Consume the peer's next handshake message and return its payload.
    ///
    /// # Errors
    ///
    /// Returns [`CryptoError::Handshake`] if the message is malformed, fails
    /// authentication, or arrives out of turn.
    pub fn read_message(&mut self, message: &[u8]) -> Result<Vec<u8>, CryptoError> {
        if message.len() > MAX_NOISE_MESSAGE_SIZE {
            return Err(CryptoError::InvalidMessage(format!(
                "handshake message of {} bytes",
                message.len()
            )));
        }
        let mut payload = vec![0u8; MAX_NOISE_MESSAGE_SIZE];
        let len = self.state.read_message(message, &mut payload)?;
        payload.truncate(len);
        Ok(payload)
    }

    /// The peer's Noise static key, once it has been received.
    #[must_use]
    pub fn remote_static(&self) -> Option<[u8; X25519_PUBLIC_KEY_SIZE]> {
        self.state
            .get_remote_static()
            .and_then(|key| key.try_into().ok())
    }

    /// Whether all three messages have been processed
    #[must_use]
    pub fn is_finished(&self) -> bool {
        self.state.is_handshake_finished()
    }

    /// Complete the handshake and switch to transport mode.
    ///
    /// # Errors
    ///
    /// Returns [`CryptoError::InvalidState`] if the handshake has not finished.
    pub fn into_transport(self) -> Result<NoiseTransport, CryptoError> {
        if !self.is_finished() {
            return Err(CryptoError::InvalidState);
        }
        let state = self.state.into_stateless_transport_mode()?;
        Ok(NoiseTransport {
            state: Arc::new(state),
        })
    }
}

/// Established Noise session.
pub struct NoiseTransport {
    state: Arc<snow::StatelessTransportState>,
}

impl NoiseTransport {
    /// Split into independently usable send and receive halves.
    #[must_use]
    pub fn split(self) -> (NoiseSender, NoiseReceiver) {
        (
            NoiseSender {
                state: Arc::clone(&self.state),
                nonce: 0,
            },
            NoiseReceiver {
                state: self.state,
                nonce: 0,
            },
        )
    }
}

/// Sending half of a Noise session.
pub struct NoiseSender {
    state: Arc<snow::StatelessTransportState>,
    nonce: u64,
}

impl NoiseSender {
    /// Encrypt one message (at most [`MAX_NOISE_PAYLOAD_SIZE`] bytes).
    ///
    /// # Errors
    ///
    /// Returns [`CryptoError::NonceOverflow`] when the counter is exhausted
    /// and [`CryptoError::EncryptionFailed`] for oversized payloads.
    pub fn encrypt(&mut self, plaintext: &[u8]) -> Result<Vec<u8>, CryptoError> {
        if self.nonce == u64::MAX {
            return Err(CryptoError::NonceOverflow);
        }
        if plaintext.len() > MAX_NOISE_PAYLOAD_SIZE {
            return Err(CryptoError::EncryptionFailed);
        }
        let mut message = vec![0u8; plaintext.len() + NOISE_TAG_SIZE];
        let len = self
            .state
            .write_message(self.nonce, plaintext, &mut message)
            .map_err(|_| CryptoError::EncryptionFailed)?;
        message.truncate(len);
        self.nonce += 1;
        Ok(message)
    }
}

/// Receiving half of a Noise session.
pub struct NoiseReceiver {
    state: Arc<snow::StatelessTransportState>,
    nonce: u64,
}

impl NoiseReceiver {
    /// Decrypt the next message in sequence.
    ///
    /// # Errors
    ///
    /// Returns [`CryptoError::DecryptionFailed`] if the message was tampered
    /// with, replayed, or reordered.
    pub fn decrypt(&mut self, ciphertext: &[u8]) -> Result<Vec<u8>, CryptoError> {
        if self.nonce == u64::MAX {
            return Err(CryptoError::NonceOverflow);
        }
        if ciphertext.len() < NOISE_TAG_SIZE || ciphertext.len() > MAX_NOISE_MESSAGE_SIZE {
            return Err(CryptoError::DecryptionFailed);
        }
        let mut plaintext = vec![0u8; ciphertext.len()];
        let len = self
            .state
            .read_message(self.nonce, ciphertext, &mut plaintext)
            .map_err(|_| CryptoError::DecryptionFailed)?;
        plaintext.truncate(len);
        self.nonce += 1;
        Ok(plaintext)
    }
}
