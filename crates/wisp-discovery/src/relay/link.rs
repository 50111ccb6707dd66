//! Relay-side view of one endpoint.
//!
//! The proxies that stand in for an endpoint's secret key ([`ProxyHandshake`],
//! [`ProxyFirewall`], [`ProxySigner`]) run inside DHT calls on spawned tasks.
//! They reach the endpoint through a shared [`Link`]: send a request frame,
//! park on a one-shot channel, and let the dispatch task resolve it when the
//! matching reply frame arrives. Closing the link drops every waiter.
//!
//! [`ProxyHandshake`]: super::handshake::ProxyHandshake
//! [`ProxyFirewall`]: super::firewall::ProxyFirewall
//! [`ProxySigner`]: super::signing::ProxySigner

use super::error::RelayError;
use super::protocol::ProtocolHandle;
use super::registry::{IdGenerator, PendingRequests};
use dashmap::DashSet;
use std::net::SocketAddr;
use tracing::debug;
use wisp_core::Message;
use wisp_crypto::hash::SignNamespace;
use wisp_crypto::{HandshakeHash, PublicKey, Signature};

/// Reply to one proxied handshake step
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct NoiseOutcome {
    /// Handshake message or decrypted payload
    pub data: Vec<u8>,
    /// Whether the handshake finished
    pub complete: bool,
    /// Transcript hash, with `complete`
    pub handshake_hash: Option<HandshakeHash>,
    /// Remote stream id, with `complete`
    pub remote_id: Option<[u8; 32]>,
    /// Holepunch secret, with `complete`
    pub holepunch_secret: Option<[u8; 32]>,
    /// Authenticated remote identity
    pub remote_public_key: Option<PublicKey>,
    /// Failure text
    pub error: Option<String>,
}

/// Requests the relay sends to an endpoint and awaits
#[derive(Debug)]
pub struct Link {
    protocol: ProtocolHandle,
    handshake_ids: IdGenerator,
    handshakes: DashSet<u32>,
    noise: PendingRequests<NoiseOutcome>,
    firewall: PendingRequests<bool>,
    signatures: PendingRequests<Result<Signature, String>>,
}

impl Link {
    /// Link over `protocol`
    #[must_use]
    pub fn new(protocol: ProtocolHandle) -> Self {
        Self {
            protocol,
            handshake_ids: IdGenerator::new(),
            handshakes: DashSet::new(),
            noise: PendingRequests::new(),
            firewall: PendingRequests::new(),
            signatures: PendingRequests::new(),
        }
    }

    /// Connection to the endpoint
    #[must_use]
    pub fn protocol(&self) -> &ProtocolHandle {
        &self.protocol
    }

    /// Reserve a handshake id
    pub fn allocate_handshake(&self) -> u32 {
        let id = self.handshake_ids.next_free(|id| self.handshakes.contains(&id));
        self.handshakes.insert(id);
        id
    }

    /// Release a handshake id and drop its waiter
    pub fn release_handshake(&self, id: u32) {
        self.handshakes.remove(&id);
        self.noise.cancel(id);
    }

    /// Send one handshake step and wait for its `NoiseReply`.
    ///
    /// # Errors
    ///
    /// Returns [`RelayError::Closed`] if the link closes first.
    pub async fn noise_step(&self, id: u32, request: Message) -> Result<NoiseOutcome, RelayError> {
        let reply = self.noise.insert(id);
        if let Err(e) = self.protocol.send(request) {
            self.noise.cancel(id);
            return Err(e);
        }
        reply.await.map_err(|_| RelayError::Closed)
    }

    /// Ask the endpoint whether to deny an incoming connection; a lost link
    /// denies
    pub async fn firewall(
        &self,
        server_alias: u32,
        remote_public_key: PublicKey,
        payload: &[u8],
        handshake_id: u32,
    ) -> bool {
        let (id, decision) = self.firewall.register();
        let request = Message::Incoming {
            id,
            server_alias,
            remote_public_key,
            payload: payload.to_vec(),
            handshake_id,
        };
        if self.protocol.send(request).is_err() {
            self.firewall.cancel(id);
            return true;
        }
        decision.await.unwrap_or(true)
    }

    /// Ask the endpoint to sign an announce/unannounce record.
    ///
    /// # Errors
    ///
    /// Returns [`RelayError::SignatureUnavailable`] on an error reply or a
    /// lost link.
    pub async fn sign(
        &self,
        namespace: SignNamespace,
        signee: u32,
        token: [u8; 32],
        peer_id: [u8; 32],
        relay_addresses: Vec<SocketAddr>,
    ) -> Result<Signature, RelayError> {
        let (id, reply) = self.signatures.register();
        let request = match namespace {
            SignNamespace::Announce => Message::SignAnnounce {
                id,
                signee,
                token,
                peer_id,
                relay_addresses,
            },
            SignNamespace::Unannounce => Message::SignUnannounce {
                id,
                signee,
                token,
                peer_id,
                relay_addresses,
            },
        };
        if self.protocol.send(request).is_err() {
            self.signatures.cancel(id);
            return Err(RelayError::SignatureUnavailable);
        }
        match reply.await {
            Ok(Ok(signature)) => Ok(signature),
            Ok(Err(error)) => {
                debug!(%error, "endpoint refused to sign");
                Err(RelayError::SignatureUnavailable)
            }
            Err(_) => Err(RelayError::SignatureUnavailable),
        }
    }

    /// Route a reply frame to its waiter. Returns false for stale ids and
    /// for messages that are not replies.
    pub fn resolve(&self, message: Message) -> bool {
        match message {
            Message::NoiseReply {
                id,
                data,
                complete,
                handshake_hash,
                remote_id,
                holepunch_secret,
                remote_public_key,
                error,
            } => self.noise.resolve(
                id,
                NoiseOutcome {
                    data,
                    complete,
                    handshake_hash,
                    remote_id,
                    holepunch_secret,
                    remote_public_key,
                    error,
                },
            ),
            Message::Accept { id } => self.firewall.resolve(id, false),
            Message::Deny { id } => self.firewall.resolve(id, true),
            Message::Signature {
                id,
                signature,
                error,
            } => {
                let outcome = match (signature, error) {
                    (Some(signature), None) => Ok(signature),
                    (_, Some(error)) => Err(error),
                    (None, None) => Err("no signature".to_string()),
                };
                self.signatures.resolve(id, outcome)
            }
            _ => false,
        }
    }

    /// Drop every waiter; handshakes fail, firewalls deny, signatures are
    /// unavailable
    pub fn cancel_all(&self) {
        self.noise.cancel_all();
        self.firewall.cancel_all();
        self.signatures.cancel_all();
        self.handshakes.clear();
    }

    /// Requests still waiting for a reply
    #[must_use]
    pub fn pending(&self) -> usize {
        self.noise.len() + self.firewall.len() + self.signatures.len()
    }
}
