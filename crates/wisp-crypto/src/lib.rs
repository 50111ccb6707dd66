//! # WISP Crypto
//!
//! Cryptographic primitives for the WISP relay protocol.
//!
//! This crate provides:
//! - Ed25519 identities with optional secret keys
//! - `Noise_IK` handshake driven one message at a time
//! - Namespaced BLAKE3 derivations for stream ids and record signatures
//!
//! ## Cryptographic Suite
//!
//! | Function | Algorithm | Security Level |
//! |----------|-----------|----------------|
//! | Identity | Ed25519 | 128-bit |
//! | Key Exchange | X25519 (Noise IK) | 128-bit |
//! | Handshake Hash | BLAKE2b | 256-bit |
//! | Derivation | BLAKE3 `derive_key` | 128-bit |

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod error;
pub mod hash;
pub mod keys;
pub mod noise;

pub use error::CryptoError;
pub use keys::{KeyPair, PublicKey, SecretKey, Signature};
pub use noise::{HandshakeHash, HandshakePhase, HandshakeResult, NoiseHandshake};

/// Ed25519 public key size
pub const PUBLIC_KEY_SIZE: usize = 32;

/// Ed25519 secret key size (seed followed by public key)
pub const SECRET_KEY_SIZE: usize = 64;

/// Ed25519 signature size
pub const SIGNATURE_SIZE: usize = 64;

/// BLAKE3 output size
pub const BLAKE3_OUTPUT_SIZE: usize = 32;
