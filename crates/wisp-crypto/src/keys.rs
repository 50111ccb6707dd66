//! Ed25519 identities and signatures.
//!
//! A [`KeyPair`] always carries the 32-byte public key. The 64-byte secret key
//! (`seed ‖ public_key`) is optional: a public-only key pair marks an identity
//! whose secret never leaves its owner, and every operation that needs it must
//! be delegated to the owner instead.
//!
//! ## Usage
//!
//! ```
//! use wisp_crypto::keys::KeyPair;
//!
//! let key_pair = KeyPair::generate();
//! let signature = key_pair.sign(b"announce").unwrap();
//! assert!(signature.verify(&key_pair.public_key, b"announce").is_ok());
//!
//! let public_only = key_pair.public_only();
//! assert!(!public_only.is_custodial());
//! ```

use crate::CryptoError;
use ed25519_dalek::{Signer, Verifier};
use rand_core::OsRng;
use std::fmt;
use zeroize::{Zeroize, ZeroizeOnDrop, Zeroizing};

/// Ed25519 public key (32 bytes)
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub struct PublicKey([u8; 32]);

impl PublicKey {
    /// Create a public key from raw bytes
    #[must_use]
    pub const fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    /// Create a public key from a slice
    ///
    /// # Errors
    ///
    /// Returns [`CryptoError::InvalidKeyLength`] if the slice is not 32 bytes.
    pub fn from_slice(slice: &[u8]) -> Result<Self, CryptoError> {
        let bytes: [u8; 32] = slice.try_into().map_err(|_| CryptoError::InvalidKeyLength {
            expected: 32,
            actual: slice.len(),
        })?;
        Ok(Self(bytes))
    }

    /// Get the raw key bytes
    #[must_use]
    pub const fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    /// Map the Ed25519 point to its X25519 (Montgomery) form for Noise.
    ///
    /// # Errors
    ///
    /// Returns [`CryptoError::InvalidPublicKey`] if the bytes are not a valid
    /// Edwards point.
    pub fn to_x25519(&self) -> Result<[u8; 32], CryptoError> {
        let verifying = ed25519_dalek::VerifyingKey::from_bytes(&self.0)
            .map_err(|_| CryptoError::InvalidPublicKey)?;
        Ok(verifying.to_montgomery().to_bytes())
    }
}

impl fmt::Debug for PublicKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PublicKey({})", hex::encode(&self.0[..8]))
    }
}

impl fmt::Display for PublicKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&hex::encode(self.0))
    }
}

impl From<[u8; 32]> for PublicKey {
    fn from(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }
}

/// Ed25519 secret key in the 64-byte `seed ‖ public_key` layout.
///
/// Zeroized on drop.
#[derive(Clone, Zeroize, ZeroizeOnDrop, PartialEq, Eq)]
pub struct SecretKey([u8; 64]);

impl SecretKey {
    /// Create a secret key from raw bytes
    #[must_use]
    pub const fn from_bytes(bytes: [u8; 64]) -> Self {
        Self(bytes)
    }

    /// Create a secret key from a slice
    ///
    /// # Errors
    ///
    /// Returns [`CryptoError::InvalidKeyLength`] if the slice is not 64 bytes.
    pub fn from_slice(slice: &[u8]) -> Result<Self, CryptoError> {
        let bytes: [u8; 64] = slice.try_into().map_err(|_| CryptoError::InvalidKeyLength {
            expected: 64,
            actual: slice.len(),
        })?;
        Ok(Self(bytes))
    }

    /// Get the raw key bytes (handle with care)
    #[must_use]
    pub const fn as_bytes(&self) -> &[u8; 64] {
        &self.0
    }

    fn signing_key(&self) -> Result<ed25519_dalek::SigningKey, CryptoError> {
        ed25519_dalek::SigningKey::from_keypair_bytes(&self.0).map_err(|_| CryptoError::KeyMismatch)
    }
}

impl fmt::Debug for SecretKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("SecretKey([REDACTED])")
    }
}

/// Ed25519 signature (64 bytes)
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Signature([u8; 64]);

impl Signature {
    /// Create a signature from raw bytes
    #[must_use]
    pub const fn from_bytes(bytes: [u8; 64]) -> Self {
        Self(bytes)
    }

    /// Create a signature from a slice
    ///
    /// # Errors
    ///
    /// Returns [`CryptoError::InvalidSignature`] if the slice is not exactly 64 bytes.
    pub fn from_slice(slice: &[u8]) -> Result<Self, CryptoError> {
        let bytes: [u8; 64] = slice.try_into().map_err(|_| CryptoError::InvalidSignature)?;
        Ok(Self(bytes))
    }

    /// Get the raw signature bytes
    #[must_use]
    pub const fn as_bytes(&self) -> &[u8; 64] {
        &self.0
    }

    /// Verify this signature over `message` for `public_key`.
    ///
    /// # Errors
    ///
    /// Returns [`CryptoError::InvalidPublicKey`] for a malformed key and
    /// [`CryptoError::InvalidSignature`] if the signature does not authenticate
    /// the message.
    pub fn verify(&self, public_key: &PublicKey, message: &[u8]) -> Result<(), CryptoError> {
        let verifying = ed25519_dalek::VerifyingKey::from_bytes(public_key.as_bytes())
            .map_err(|_| CryptoError::InvalidPublicKey)?;
        verifying
            .verify(message, &ed25519_dalek::Signature::from_bytes(&self.0))
            .map_err(|_| CryptoError::InvalidSignature)
    }
}

/// Identity key pair; the secret half is absent in non-custodial use.
#[derive(Clone, PartialEq, Eq)]
pub struct KeyPair {
    /// Public key
    pub public_key: PublicKey,
    /// Secret key, `None` when the owner keeps it elsewhere
    pub secret_key: Option<SecretKey>,
}

impl KeyPair {
    /// Generate a new random key pair
    #[must_use]
    pub fn generate() -> Self {
        let signing = ed25519_dalek::SigningKey::generate(&mut OsRng);
        Self::from_signing_key(&signing)
    }

    /// Derive a key pair deterministically from a 32-byte seed
    #[must_use]
    pub fn from_seed(seed: &[u8; 32]) -> Self {
        let signing = ed25519_dalek::SigningKey::from_bytes(seed);
        Self::from_signing_key(&signing)
    }

    /// Pair a public key with an optional secret key.
    ///
    /// # Errors
    ///
    /// Returns [`CryptoError::KeyMismatch`] if the secret key belongs to a
    /// different public key.
    pub fn new(public_key: PublicKey, secret_key: Option<SecretKey>) -> Result<Self, CryptoError> {
        if let Some(secret) = &secret_key {
            let signing = secret.signing_key()?;
            if signing.verifying_key().to_bytes() != *public_key.as_bytes() {
                return Err(CryptoError::KeyMismatch);
            }
        }
        Ok(Self {
            public_key,
            secret_key,
        })
    }

    /// Key pair holding only the public half
    #[must_use]
    pub fn from_public_key(public_key: PublicKey) -> Self {
        Self {
            public_key,
            secret_key: None,
        }
    }

    /// Copy of this key pair without the secret half
    #[must_use]
    pub fn public_only(&self) -> Self {
        Self::from_public_key(self.public_key)
    }

    /// Whether the secret key is held locally
    #[must_use]
    pub fn is_custodial(&self) -> bool {
        self.secret_key.is_some()
    }

    /// Sign a message
    ///
    /// # Errors
    ///
    /// Returns [`CryptoError::MissingSecretKey`] for a public-only key pair.
    pub fn sign(&self, message: &[u8]) -> Result<Signature, CryptoError> {
        let signing = self.secret()?.signing_key()?;
        Ok(Signature(signing.sign(message).to_bytes()))
    }

    /// X25519 static secret used by Noise, derived from the Ed25519 seed.
    ///
    /// # Errors
    ///
    /// Returns [`CryptoError::MissingSecretKey`] for a public-only key pair.
    pub fn x25519_secret(&self) -> Result<Zeroizing<[u8; 32]>, CryptoError> {
        let signing = self.secret()?.signing_key()?;
        Ok(Zeroizing::new(signing.to_scalar_bytes()))
    }

    fn secret(&self) -> Result<&SecretKey, CryptoError> {
        self.secret_key.as_ref().ok_or(CryptoError::MissingSecretKey)
    }

    fn from_signing_key(signing: &ed25519_dalek::SigningKey) -> Self {
        Self {
            public_key: PublicKey(signing.verifying_key().to_bytes()),
            secret_key: Some(SecretKey(signing.to_keypair_bytes())),
        }
    }
}

impl fmt::Debug for KeyPair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KeyPair")
            .field("public_key", &self.public_key)
            .field("custodial", &self.is_custodial())
            .finish()
    }
}
