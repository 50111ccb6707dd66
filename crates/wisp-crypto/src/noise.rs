//! Noise_IK handshake.
//!
//! Two messages authenticate both sides when the initiator already knows the
//! responder's static key:
//!
//! ```text
//! Initiator                         Responder
//!     |  -> e, es, s, ss  (msg1)        |
//!     |-------------------------------->|
//!     |  <- e, ee, se     (msg2)        |
//!     |<--------------------------------|
//!     |     [handshake hash shared]     |
//! ```
//!
//! Identities are Ed25519 keys; the Noise static keys are their X25519
//! images. Message 1 carries the initiator's Ed25519 public key ahead of the
//! application payload so the responder can name the peer with the same key
//! type the rest of the system uses. The wrapper is driven one message at a
//! time, which lets the owner of the secret key run it while a relay only
//! moves the opaque messages around.

use crate::hash::{holepunch_secret, stream_id, transport_keys};
use crate::keys::{KeyPair, PublicKey};
use crate::CryptoError;
use std::fmt;
use zeroize::{Zeroize, ZeroizeOnDrop};

/// Noise protocol name
pub const NOISE_PATTERN: &str = "Noise_IK_25519_ChaChaPoly_BLAKE2b";

/// Handshake hash size (BLAKE2b)
pub const HANDSHAKE_HASH_SIZE: usize = 64;

/// Largest Noise message
const MAX_NOISE_MESSAGE: usize = 65535;

/// Transcript hash of a completed handshake
pub type HandshakeHash = [u8; HANDSHAKE_HASH_SIZE];

/// Lifecycle of a handshake
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandshakePhase {
    /// Created, no message processed yet
    Initiated,
    /// At least one message processed
    InProgress,
    /// Both messages processed
    Complete,
    /// A message failed; the session is unusable
    Failed,
}

impl HandshakePhase {
    /// Whether no further messages may be processed
    #[must_use]
    pub fn is_terminal(self) -> bool {
        matches!(self, HandshakePhase::Complete | HandshakePhase::Failed)
    }
}

/// Values both sides derive from the handshake hash
#[derive(Clone, PartialEq, Eq, Zeroize, ZeroizeOnDrop)]
pub struct HandshakeResult {
    /// Whether this side sent message 1
    #[zeroize(skip)]
    pub is_initiator: bool,
    /// Local identity
    #[zeroize(skip)]
    pub public_key: PublicKey,
    /// Authenticated remote identity
    #[zeroize(skip)]
    pub remote_public_key: PublicKey,
    /// Transcript hash
    pub hash: HandshakeHash,
    /// Key this side sends with
    pub tx: [u8; 32],
    /// Key this side receives with
    pub rx: [u8; 32],
    /// Local stream id
    pub stream_id: [u8; 32],
    /// Stream id of the remote side
    pub remote_id: [u8; 32],
    /// Secret shared for holepunching
    pub holepunch_secret: [u8; 32],
}

impl HandshakeResult {
    /// Derive every value from the transcript hash
    #[must_use]
    pub fn from_hash(
        is_initiator: bool,
        public_key: PublicKey,
        remote_public_key: PublicKey,
        hash: HandshakeHash,
    ) -> Self {
        let (tx, rx) = transport_keys(&hash, is_initiator);
        Self {
            is_initiator,
            public_key,
            remote_public_key,
            hash,
            tx,
            rx,
            stream_id: stream_id(&hash, is_initiator),
            remote_id: stream_id(&hash, !is_initiator),
            holepunch_secret: holepunch_secret(&hash),
        }
    }
}

impl fmt::Debug for HandshakeResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HandshakeResult")
            .field("is_initiator", &self.is_initiator)
            .field("public_key", &self.public_key)
            .field("remote_public_key", &self.remote_public_key)
            .field("hash", &hex::encode(&self.hash[..8]))
            .finish_non_exhaustive()
    }
}

/// One side of a Noise IK handshake
pub struct NoiseHandshake {
    inner: snow::HandshakeState,
    is_initiator: bool,
    public_key: PublicKey,
    remote_public_key: Option<PublicKey>,
    messages: usize,
    phase: HandshakePhase,
    result: Option<HandshakeResult>,
}

impl NoiseHandshake {
    /// Start a handshake towards `remote_public_key`
    ///
    /// # Errors
    ///
    /// Returns [`CryptoError::MissingSecretKey`] for a public-only key pair and
    /// [`CryptoError::InvalidPublicKey`] if the remote key is not a valid point.
    pub fn initiator(key_pair: &KeyPair, remote_public_key: &PublicKey) -> Result<Self, CryptoError> {
        let local = key_pair.x25519_secret()?;
        let remote = remote_public_key.to_x25519()?;
        let inner = snow::Builder::new(params()?)
            .local_private_key(&local[..])
            .remote_public_key(&remote)
            .build_initiator()?;
        Ok(Self::with_state(inner, true, key_pair.public_key, Some(*remote_public_key)))
    }

    /// Wait for a handshake as `key_pair`
    ///
    /// # Errors
    ///
    /// Returns [`CryptoError::MissingSecretKey`] for a public-only key pair.
    pub fn responder(key_pair: &KeyPair) -> Result<Self, CryptoError> {
        let local = key_pair.x25519_secret()?;
        let inner = snow::Builder::new(params()?)
            .local_private_key(&local[..])
            .build_responder()?;
        Ok(Self::with_state(inner, false, key_pair.public_key, None))
    }

    fn with_state(
        inner: snow::HandshakeState,
        is_initiator: bool,
        public_key: PublicKey,
        remote_public_key: Option<PublicKey>,
    ) -> Self {
        Self {
            inner,
            is_initiator,
            public_key,
            remote_public_key,
            messages: 0,
            phase: HandshakePhase::Initiated,
            result: None,
        }
    }

    /// Produce the next handshake message carrying `payload`
    ///
    /// # Errors
    ///
    /// Returns [`CryptoError::InvalidState`] after completion or failure and
    /// [`CryptoError::Handshake`] if Noise rejects the step.
    pub fn send(&mut self, payload: &[u8]) -> Result<Vec<u8>, CryptoError> {
        self.ensure_live()?;

        let mut body = Vec::with_capacity(payload.len() + 32);
        if self.is_initiator && self.messages == 0 {
            body.extend_from_slice(self.public_key.as_bytes());
        }
        body.extend_from_slice(payload);

        let mut message = vec![0u8; MAX_NOISE_MESSAGE];
        let len = match self.inner.write_message(&body, &mut message) {
            Ok(len) => len,
            Err(e) => return Err(self.fail(e.into())),
        };
        message.truncate(len);

        self.advance()?;
        Ok(message)
    }

    /// Consume the peer's handshake message, returning its payload
    ///
    /// # Errors
    ///
    /// Returns [`CryptoError::InvalidState`] after completion or failure,
    /// [`CryptoError::Handshake`] if decryption fails and
    /// [`CryptoError::InvalidPublicKey`] if the claimed identity does not
    /// match the authenticated static key.
    pub fn recv(&mut self, message: &[u8]) -> Result<Vec<u8>, CryptoError> {
        self.ensure_live()?;

        let mut body = vec![0u8; MAX_NOISE_MESSAGE];
        let len = match self.inner.read_message(message, &mut body) {
            Ok(len) => len,
            Err(e) => return Err(self.fail(e.into())),
        };
        body.truncate(len);

        if !self.is_initiator && self.messages == 0 {
            match self.take_initiator_identity(&mut body) {
                Ok(key) => self.remote_public_key = Some(key),
                Err(e) => return Err(self.fail(e)),
            }
        }

        self.advance()?;
        Ok(body)
    }

    fn take_initiator_identity(&self, body: &mut Vec<u8>) -> Result<PublicKey, CryptoError> {
        if body.len() < 32 {
            return Err(CryptoError::InvalidMessage("missing initiator identity".into()));
        }
        let claimed = PublicKey::from_slice(&body[..32])?;
        let authenticated = self
            .inner
            .get_remote_static()
            .ok_or_else(|| CryptoError::Handshake("no remote static key".into()))?;
        if claimed.to_x25519()?.as_slice() != authenticated {
            return Err(CryptoError::InvalidPublicKey);
        }
        body.drain(..32);
        Ok(claimed)
    }

    fn ensure_live(&self) -> Result<(), CryptoError> {
        if self.phase.is_terminal() {
            return Err(CryptoError::InvalidState);
        }
        Ok(())
    }

    fn fail(&mut self, err: CryptoError) -> CryptoError {
        self.phase = HandshakePhase::Failed;
        err
    }

    fn advance(&mut self) -> Result<(), CryptoError> {
        self.messages += 1;
        self.phase = HandshakePhase::InProgress;

        if !self.inner.is_handshake_finished() {
            return Ok(());
        }

        let remote = self
            .remote_public_key
            .ok_or_else(|| handshake_error("remote identity unknown"))?;
        let hash: HandshakeHash = self
            .inner
            .get_handshake_hash()
            .try_into()
            .map_err(|_| handshake_error("unexpected handshake hash size"))?;

        self.result = Some(HandshakeResult::from_hash(
            self.is_initiator,
            self.public_key,
            remote,
            hash,
        ));
        self.phase = HandshakePhase::Complete;
        Ok(())
    }

    /// Whether this side started the handshake
    #[must_use]
    pub fn is_initiator(&self) -> bool {
        self.is_initiator
    }

    /// Current phase
    #[must_use]
    pub fn phase(&self) -> HandshakePhase {
        self.phase
    }

    /// Whether both messages have been processed
    #[must_use]
    pub fn is_complete(&self) -> bool {
        self.phase == HandshakePhase::Complete
    }

    /// Remote identity, known from the start for initiators and after
    /// message 1 for responders
    #[must_use]
    pub fn remote_public_key(&self) -> Option<&PublicKey> {
        self.remote_public_key.as_ref()
    }

    /// Derived values, available once complete
    #[must_use]
    pub fn result(&self) -> Option<&HandshakeResult> {
        self.result.as_ref()
    }
}

impl fmt::Debug for NoiseHandshake {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NoiseHandshake")
            .field("is_initiator", &self.is_initiator)
            .field("phase", &self.phase)
            .field("remote_public_key", &self.remote_public_key)
            .finish_non_exhaustive()
    }
}

fn params() -> Result<snow::params::NoiseParams, CryptoError> {
    NOISE_PATTERN.parse().map_err(CryptoError::from)
}

fn handshake_error(reason: &str) -> CryptoError {
    CryptoError::Handshake(reason.to_string())
}
