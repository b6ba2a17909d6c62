//! Authenticated key exchange.
//!
//! Runs `Noise_XX_25519_ChaChaPoly_BLAKE2s` over length-prefixed frames
//! (2-byte big-endian length). Each side uses a fresh Noise static key and
//! proves its long-term identity with an [`IdentityPayload`] carried inside
//! the encrypted handshake:
//!
//! ```text
//! -> e
//! <- e, ee, s, es    + responder identity
//! -> s, se           + initiator identity
//! ```
//!
//! An identity payload is the Ed25519 public key followed by its signature
//! over `"tether-noise-static-key:" || noise_static_key`, binding the identity
//! to the session.

use crate::error::{HandshakeError, UpgradeError};
use crate::secure::SecureConnection;
use std::borrow::Cow;
use tether_crypto::noise::{MAX_NOISE_MESSAGE_SIZE, NoiseHandshake, NoiseKeypair, Role};
use tether_crypto::{
    ED25519_PUBLIC_KEY_SIZE, ED25519_SIGNATURE_SIZE, Keypair, PeerId, PublicKey, Signature,
    X25519_PUBLIC_KEY_SIZE,
};
use tether_transport::BoxedConnection;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::debug;

/// Size of an encoded [`IdentityPayload`]
pub const IDENTITY_PAYLOAD_SIZE: usize = ED25519_PUBLIC_KEY_SIZE + ED25519_SIGNATURE_SIZE;

const STATIC_KEY_DOMAIN: &[u8] = b"tether-noise-static-key:";

/// Identity proof exchanged inside the handshake.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IdentityPayload {
    /// Sender's long-term identity key
    pub public_key: PublicKey,
    /// Signature binding the identity to the sender's Noise static key
    pub signature: Signature,
}

fn signed_message(noise_static: &[u8; X25519_PUBLIC_KEY_SIZE]) -> Vec<u8> {
    let mut message = Vec::with_capacity(STATIC_KEY_DOMAIN.len() + noise_static.len());
    message.extend_from_slice(STATIC_KEY_DOMAIN);
    message.extend_from_slice(noise_static);
    message
}

impl IdentityPayload {
    /// Sign `noise_static` with `keypair`
    #[must_use]
    pub fn sign(keypair: &Keypair, noise_static: &[u8; X25519_PUBLIC_KEY_SIZE]) -> Self {
        Self {
            public_key: keypair.public(),
            signature: keypair.sign(&signed_message(noise_static)),
        }
    }

    /// Wire encoding
    #[must_use]
    pub fn encode(&self) -> [u8; IDENTITY_PAYLOAD_SIZE] {
        let mut out = [0u8; IDENTITY_PAYLOAD_SIZE];
        out[..ED25519_PUBLIC_KEY_SIZE].copy_from_slice(&self.public_key.to_bytes());
        out[ED25519_PUBLIC_KEY_SIZE..].copy_from_slice(self.signature.as_bytes());
        out
    }

    /// Parse the wire encoding.
    ///
    /// # Errors
    ///
    /// Returns [`HandshakeError::InvalidPayload`] for a wrong length or a
    /// public key that is not a valid Ed25519 point.
    pub fn decode(bytes: &[u8]) -> Result<Self, HandshakeError> {
        if bytes.len() != IDENTITY_PAYLOAD_SIZE {
            return Err(HandshakeError::InvalidPayload(Cow::Owned(format!(
                "expected {IDENTITY_PAYLOAD_SIZE} bytes, got {}",
                bytes.len()
            ))));
        }
        let (key, sig) = bytes.split_at(ED25519_PUBLIC_KEY_SIZE);
        let key: &[u8; ED25519_PUBLIC_KEY_SIZE] = key
            .try_into()
            .map_err(|_| HandshakeError::InvalidPayload(Cow::Borrowed("public key length")))?;
        let public_key = PublicKey::from_bytes(key)
            .map_err(|_| HandshakeError::InvalidPayload(Cow::Borrowed("invalid public key")))?;
        let signature = Signature::from_slice(sig)
            .map_err(|_| HandshakeError::InvalidPayload(Cow::Borrowed("signature length")))?;
        Ok(Self {
            public_key,
            signature,
        })
    }

    /// Check the signature against the Noise static key actually used by the
    /// sender and return the proven peer id.
    ///
    /// # Errors
    ///
    /// Returns [`HandshakeError::InvalidSignature`] if the signature does not
    /// cover `noise_static` under `public_key`.
    pub fn verify(
        &self,
        noise_static: &[u8; X25519_PUBLIC_KEY_SIZE],
    ) -> Result<PeerId, HandshakeError> {
        self.public_key
            .verify(&signed_message(noise_static), &self.signature)
            .map_err(|_| HandshakeError::InvalidSignature)?;
        Ok(self.public_key.to_peer_id())
    }
}

async fn write_frame<S>(conn: &mut S, message: &[u8]) -> Result<(), HandshakeError>
where
    S: AsyncWrite + Unpin + ?Sized,
{
    let len = u16::try_from(message.len())
        .map_err(|_| HandshakeError::FrameTooLarge(message.len()))?;
    let mut frame = Vec::with_capacity(2 + message.len());
    frame.extend_from_slice(&len.to_be_bytes());
    frame.extend_from_slice(message);
    conn.write_all(&frame).await?;
    conn.flush().await?;
    Ok(())
}

async fn read_frame<S>(conn: &mut S) -> Result<Vec<u8>, HandshakeError>
where
    S: AsyncRead + Unpin + ?Sized,
{
    let len = usize::from(conn.read_u16().await?);
    if len > MAX_NOISE_MESSAGE_SIZE {
        return Err(HandshakeError::FrameTooLarge(len));
    }
    let mut message = vec![0u8; len];
    conn.read_exact(&mut message).await?;
    Ok(message)
}

/// Verify a received identity payload and apply the identity policy.
fn authenticate(
    noise: &NoiseHandshake,
    payload: &[u8],
    local_peer: PeerId,
    expected: Option<PeerId>,
) -> Result<(PeerId, PublicKey), HandshakeError> {
    let identity = IdentityPayload::decode(payload)?;
    let remote_static = noise
        .remote_static()
        .ok_or(HandshakeError::InvalidPayload(Cow::Borrowed(
            "identity received before static key",
        )))?;
    let remote_peer = identity.verify(&remote_static)?;

    if remote_peer == local_peer {
        return Err(HandshakeError::SelfConnection);
    }
    if let Some(expected) = expected {
        if expected != remote_peer {
            return Err(HandshakeError::PeerMismatch {
                expected,
                actual: remote_peer,
            });
        }
    }
    Ok((remote_peer, identity.public_key))
}

async fn run_initiator(
    conn: &mut BoxedConnection,
    keypair: &Keypair,
    expected: Option<PeerId>,
) -> Result<(NoiseHandshake, PeerId, PublicKey), HandshakeError> {
    let noise_keys = NoiseKeypair::generate();
    let mut noise = NoiseHandshake::new_initiator(&noise_keys)?;
    let local_peer = keypair.peer_id();

    write_frame(conn, &noise.write_message(&[])?).await?;

    let msg2 = read_frame(conn).await?;
    let payload = noise.read_message(&msg2)?;
    let (remote_peer, remote_key) = authenticate(&noise, &payload, local_peer, expected)?;

    let identity = IdentityPayload::sign(keypair, &noise_keys.public_key());
    write_frame(conn, &noise.write_message(&identity.encode())?).await?;

    Ok((noise, remote_peer, remote_key))
}

async fn run_responder(
    conn: &mut BoxedConnection,
    keypair: &Keypair,
    expected: Option<PeerId>,
) -> Result<(NoiseHandshake, PeerId, PublicKey), HandshakeError> {
    let noise_keys = NoiseKeypair::generate();
    let mut noise = NoiseHandshake::new_responder(&noise_keys)?;
    let local_peer = keypair.peer_id();

    let msg1 = read_frame(conn).await?;
    noise.read_message(&msg1)?;

    let identity = IdentityPayload::sign(keypair, &noise_keys.public_key());
    write_frame(conn, &noise.write_message(&identity.encode())?).await?;

    let msg3 = read_frame(conn).await?;
    let payload = noise.read_message(&msg3)?;
    let (remote_peer, remote_key) = authenticate(&noise, &payload, local_peer, expected)?;

    Ok((noise, remote_peer, remote_key))
}

/// Run the handshake over `conn` and return the secured connection.
///
/// On any failure `conn` is dropped (closed) before the error is returned.
/// `expected` pins the remote identity; the initiator checks it before
/// sending its own identity.
///
/// # Errors
///
/// Returns [`UpgradeError::Handshake`] for any protocol, authentication or
/// identity policy failure.
pub async fn handshake(
    mut conn: BoxedConnection,
    keypair: &Keypair,
    role: Role,
    expected: Option<PeerId>,
    protocol: String,
) -> Result<SecureConnection, UpgradeError> {
    let result = match role {
        Role::Initiator => run_initiator(&mut conn, keypair, expected).await,
        Role::Responder => run_responder(&mut conn, keypair, expected).await,
    };

    let (noise, remote_peer, remote_key) = match result {
        Ok(done) => done,
        Err(e) => {
            debug!("Handshake with {} failed: {}", conn.remote_addr(), e);
            drop(conn);
            return Err(e.into());
        }
    };

    let transport = noise.into_transport().map_err(HandshakeError::from)?;
    debug!(
        "Secured {:?} session with {} at {}",
        role,
        remote_peer.short(),
        conn.remote_addr()
    );
    Ok(SecureConnection::new(
        conn,
        transport,
        keypair.peer_id(),
        remote_peer,
        remote_key,
        protocol,
    ))
}
