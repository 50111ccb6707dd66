//! DHT seam.
//!
//! The relay drives a DHT node through the [`Dht`] trait and never looks at
//! routing. Everything that needs a secret key is injected through three
//! smaller seams, so the same node can serve custodial and non-custodial
//! endpoints:
//!
//! - [`Handshaker`]: one side of a Noise IK handshake, driven one message at
//!   a time ([`LocalHandshake`] holds the key, the relay's proxy forwards)
//! - [`Firewall`]: accept/deny decision on the responder after message 1
//! - [`AnnounceSigner`]: signature over an announce/unannounce record
//!
//! [`memory::MemoryDht`] is a complete in-process implementation.

use async_trait::async_trait;
use std::net::SocketAddr;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::mpsc;
use wisp_core::Peer;
use wisp_crypto::hash::{SignNamespace, signable};
use wisp_crypto::{CryptoError, HandshakeResult, KeyPair, NoiseHandshake, PublicKey, Signature};

pub mod memory;
pub mod stream;

pub use memory::{MemoryDht, Swarm};
pub use stream::{DhtStream, QueryStream};

/// DHT operation errors
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum DhtError {
    /// Nobody listens on the requested key
    #[error("peer not found")]
    PeerNotFound,

    /// Handshake or stream setup failed
    #[error("connection failed: {0}")]
    ConnectionFailed(String),

    /// The responder's firewall rejected the connection
    #[error("connection denied by firewall")]
    FirewallDenied,

    /// A server already listens on this key
    #[error("already listening")]
    AlreadyListening,

    /// No signature could be obtained
    #[error("signature unavailable: {0}")]
    SignatureUnavailable(String),

    /// A record signature did not verify
    #[error("invalid record signature")]
    InvalidSignature,

    /// Operation exceeded its deadline
    #[error("timed out")]
    Timeout,

    /// Node or server shut down
    #[error("closed")]
    Closed,

    /// Cryptographic failure
    #[error("crypto error: {0}")]
    Crypto(#[from] CryptoError),
}

/// One side of a handshake, as seen by the DHT
#[async_trait]
pub trait Handshaker: Send {
    /// Produce the next handshake message carrying `payload`
    async fn send(&mut self, payload: &[u8]) -> Result<Vec<u8>, DhtError>;

    /// Consume a handshake message, returning its payload
    async fn recv(&mut self, message: &[u8]) -> Result<Vec<u8>, DhtError>;

    /// Authenticated remote identity, once known
    fn remote_public_key(&self) -> Option<PublicKey>;

    /// Derived values, once complete
    fn result(&self) -> Option<HandshakeResult>;

    /// Correlation id when the handshake runs somewhere else
    fn handshake_id(&self) -> Option<u32> {
        None
    }
}

/// Creates responder handshakes for a server
pub trait HandshakeFactory: Send + Sync {
    /// Start a responder for one incoming connection
    ///
    /// # Errors
    /// Returns `DhtError` if no handshake can be started.
    fn responder(&self) -> Result<Box<dyn Handshaker>, DhtError>;
}

/// Accept/deny gate for incoming connections
#[async_trait]
pub trait Firewall: Send + Sync {
    /// Whether to reject `remote_public_key`, given the payload of its first
    /// handshake message
    async fn deny(&self, remote_public_key: &PublicKey, payload: &[u8], handshake_id: Option<u32>) -> bool;
}

/// What a storage node asks to have signed
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SignRequest {
    /// Target the record is stored under
    pub target: [u8; 32],
    /// Storage node token
    pub token: [u8; 32],
    /// Storage node id
    pub peer_id: [u8; 32],
    /// The record
    pub peer: Peer,
}

impl SignRequest {
    /// Digest the signature must cover
    #[must_use]
    pub fn signable(&self, namespace: SignNamespace) -> [u8; 32] {
        signable(
            namespace,
            &self.target,
            &self.peer_id,
            &self.token,
            &self.peer.to_bytes(),
        )
    }
}

/// Source of announce/unannounce signatures
#[async_trait]
pub trait AnnounceSigner: Send + Sync {
    /// Sign `request` under `namespace`
    async fn sign(&self, namespace: SignNamespace, request: &SignRequest) -> Result<Signature, DhtError>;
}

/// Signs with a key pair held in this process
#[derive(Debug, Clone)]
pub struct LocalSigner {
    key_pair: KeyPair,
}

impl LocalSigner {
    /// Signer for `key_pair`
    #[must_use]
    pub fn new(key_pair: KeyPair) -> Self {
        Self { key_pair }
    }
}

#[async_trait]
impl AnnounceSigner for LocalSigner {
    async fn sign(&self, namespace: SignNamespace, request: &SignRequest) -> Result<Signature, DhtError> {
        self.key_pair
            .sign(&request.signable(namespace))
            .map_err(|e| DhtError::SignatureUnavailable(e.to_string()))
    }
}

/// Handshake run with a key pair held in this process
#[derive(Debug)]
pub struct LocalHandshake {
    noise: NoiseHandshake,
}

impl LocalHandshake {
    /// Initiator towards `remote_public_key`
    ///
    /// # Errors
    /// Returns [`DhtError::Crypto`] for a public-only key pair.
    pub fn initiator(key_pair: &KeyPair, remote_public_key: &PublicKey) -> Result<Self, DhtError> {
        Ok(Self {
            noise: NoiseHandshake::initiator(key_pair, remote_public_key)?,
        })
    }

    /// Responder for `key_pair`
    ///
    /// # Errors
    /// Returns [`DhtError::Crypto`] for a public-only key pair.
    pub fn responder(key_pair: &KeyPair) -> Result<Self, DhtError> {
        Ok(Self {
            noise: NoiseHandshake::responder(key_pair)?,
        })
    }
}

#[async_trait]
impl Handshaker for LocalHandshake {
    async fn send(&mut self, payload: &[u8]) -> Result<Vec<u8>, DhtError> {
        Ok(self.noise.send(payload)?)
    }

    async fn recv(&mut self, message: &[u8]) -> Result<Vec<u8>, DhtError> {
        Ok(self.noise.recv(message)?)
    }

    fn remote_public_key(&self) -> Option<PublicKey> {
        self.noise.remote_public_key().copied()
    }

    fn result(&self) -> Option<HandshakeResult> {
        self.noise.result().cloned()
    }
}

/// Responders backed by a local key pair
#[derive(Debug, Clone)]
pub struct LocalHandshakeFactory {
    key_pair: KeyPair,
}

impl LocalHandshakeFactory {
    /// Factory for `key_pair`
    #[must_use]
    pub fn new(key_pair: KeyPair) -> Self {
        Self { key_pair }
    }
}

impl HandshakeFactory for LocalHandshakeFactory {
    fn responder(&self) -> Result<Box<dyn Handshaker>, DhtError> {
        Ok(Box::new(LocalHandshake::responder(&self.key_pair)?))
    }
}

/// A listening server
pub struct DhtServer {
    public_key: PublicKey,
    address: SocketAddr,
    incoming: mpsc::UnboundedReceiver<DhtStream>,
    on_close: Option<Box<dyn FnOnce() + Send>>,
}

impl DhtServer {
    /// Wrap a stream of incoming connections; `on_close` runs once on close
    /// or drop
    pub fn new(
        public_key: PublicKey,
        address: SocketAddr,
        incoming: mpsc::UnboundedReceiver<DhtStream>,
        on_close: impl FnOnce() + Send + 'static,
    ) -> Self {
        Self {
            public_key,
            address,
            incoming,
            on_close: Some(Box::new(on_close)),
        }
    }

    /// Server identity
    #[must_use]
    pub fn public_key(&self) -> PublicKey {
        self.public_key
    }

    /// Address the node is reachable at
    #[must_use]
    pub fn address(&self) -> SocketAddr {
        self.address
    }

    /// Next incoming connection, `None` once closed
    pub async fn accept(&mut self) -> Option<DhtStream> {
        self.incoming.recv().await
    }

    /// Stop accepting; open streams stay open
    pub fn close(&mut self) {
        if let Some(on_close) = self.on_close.take() {
            on_close();
        }
        self.incoming.close();
    }
}

impl Drop for DhtServer {
    fn drop(&mut self) {
        self.close();
    }
}

impl std::fmt::Debug for DhtServer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DhtServer")
            .field("public_key", &self.public_key)
            .field("address", &self.address)
            .finish_non_exhaustive()
    }
}

/// A DHT node as driven by the relay
#[async_trait]
pub trait Dht: Send + Sync + 'static {
    /// Open an encrypted stream to `remote_public_key`, carrying `payload`
    /// in the first handshake message for the remote firewall
    async fn connect(
        &self,
        remote_public_key: PublicKey,
        handshake: Box<dyn Handshaker>,
        payload: &[u8],
    ) -> Result<DhtStream, DhtError>;

    /// Accept connections for `public_key`
    async fn listen(
        &self,
        public_key: PublicKey,
        handshakes: Arc<dyn HandshakeFactory>,
        firewall: Option<Arc<dyn Firewall>>,
    ) -> Result<DhtServer, DhtError>;

    /// Find peers announced under `target`
    fn lookup(&self, target: [u8; 32]) -> QueryStream;

    /// Store `public_key` under `target`
    fn announce(&self, target: [u8; 32], public_key: PublicKey, signer: Arc<dyn AnnounceSigner>) -> QueryStream;

    /// Remove `public_key` from `target`
    fn unannounce(&self, target: [u8; 32], public_key: PublicKey, signer: Arc<dyn AnnounceSigner>) -> QueryStream;

    /// Address this node is reachable at
    fn local_address(&self) -> SocketAddr;
}
