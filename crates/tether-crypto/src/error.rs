//! Cryptographic error types.

use thiserror::Error;

/// Cryptographic errors
#[derive(Debug, Error)]
pub enum CryptoError {
    /// Invalid key length
    #[error("invalid key length: expected {expected}, got {actual}")]
    InvalidKeyLength {
        /// Expected length
        expected: usize,
        /// Actual length
        actual: usize,
    },

    /// Noise handshake error
    #[error("handshake error: {0}")]
    Handshake(String),

    /// Invalid state for operation
    #[error("invalid state for operation")]
    InvalidState,

    /// Invalid message format
    #[error("invalid message format: {0}")]
    InvalidMessage(String),

    /// AEAD encryption failed
    #[error("encryption failed")]
    EncryptionFailed,

    /// AEAD decryption failed (authentication failure)
    #[error("decryption failed: authentication failure")]
    DecryptionFailed,

    /// Nonce counter exhausted
    #[error("nonce counter exhausted, rekey required")]
    NonceOverflow,

    /// Random number generation failed
    #[error("random number generation failed")]
    RandomFailed,

    /// Invalid signature
    #[error("invalid signature")]
    InvalidSignature,

    /// Invalid public key
    #[error("invalid public key")]
    InvalidPublicKey,

    /// Invalid peer identifier encoding
    #[error("invalid peer id: {0}")]
    InvalidPeerId(String),

    /// Invalid key material (corrupted or wrong format)
    #[error("invalid key material: {0}")]
    InvalidKeyMaterial(String),
}

impl From<snow::Error> for CryptoError {
    fn from(err: snow::Error) -> Self {
        CryptoError::Handshake(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = CryptoError::InvalidKeyLength {
            expected: 32,
            actual: 31,
        };
        assert_eq!(err.to_string(), "invalid key length: expected 32, got 31");

        let err = CryptoError::InvalidPeerId("bad hex".to_string());
        assert!(err.to_string().contains("bad hex"));
    }
}
