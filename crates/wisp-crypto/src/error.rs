//! Cryptographic error types.

use thiserror::Error;

/// Cryptographic errors
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CryptoError {
    /// Invalid key length
    #[error("invalid key length: expected {expected}, got {actual}")]
    InvalidKeyLength {
        /// Expected length
        expected: usize,
        /// Actual length
        actual: usize,
    },

    /// Operation needs the secret key but the key pair is public-only
    #[error("secret key not available")]
    MissingSecretKey,

    /// Secret key does not belong to the public key it was paired with
    #[error("secret key does not match public key")]
    KeyMismatch,

    /// Noise handshake error
    #[error("handshake error: {0}")]
    Handshake(String),

    /// Handshake used after reaching a terminal state
    #[error("invalid state for operation")]
    InvalidState,

    /// Invalid message format
    #[error("invalid message format: {0}")]
    InvalidMessage(String),

    /// Invalid signature
    #[error("invalid signature")]
    InvalidSignature,

    /// Invalid public key
    #[error("invalid public key")]
    InvalidPublicKey,
}

impl From<snow::Error> for CryptoError {
    fn from(err: snow::Error) -> Self {
        CryptoError::Handshake(err.to_string())
    }
}
