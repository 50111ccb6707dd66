//! In-process DHT.
//!
//! Every [`MemoryDht`] created from the same [`Swarm`] sees the same servers
//! and records. Connections run a real two-message handshake between the
//! caller's initiator and a responder from the target server's factory, the
//! server's firewall sees message 1's payload, and announce/unannounce
//! records are only stored once their signature verifies. There is no
//! routing: one storage node answers every query.

use super::{
    AnnounceSigner, Dht, DhtError, DhtServer, DhtStream, Firewall, HandshakeFactory, Handshaker,
    QueryStream, SignRequest,
};
use async_trait::async_trait;
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use rand::RngCore;
use std::net::{Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::sync::atomic::{AtomicU16, AtomicU64, Ordering};
use tokio::sync::mpsc;
use tracing::debug;
use wisp_core::{Peer, QueryReply};
use wisp_crypto::PublicKey;
use wisp_crypto::hash::{SignNamespace, hash};

/// Buffer of each in-process stream direction
const STREAM_BUFFER: usize = 64 * 1024;

/// First port handed to nodes; the storage node sits one below
const BASE_PORT: u16 = 49737;

struct ServerSlot {
    id: u64,
    handshakes: Arc<dyn HandshakeFactory>,
    firewall: Option<Arc<dyn Firewall>>,
    incoming: mpsc::UnboundedSender<DhtStream>,
}

struct SwarmInner {
    servers: DashMap<PublicKey, ServerSlot>,
    records: DashMap<[u8; 32], Vec<Peer>>,
    node_id: [u8; 32],
    node_secret: [u8; 32],
    address: SocketAddr,
    next_slot: AtomicU64,
    next_port: AtomicU16,
}

impl SwarmInner {
    fn token(&self, public_key: &PublicKey) -> [u8; 32] {
        let mut material = Vec::with_capacity(64);
        material.extend_from_slice(&self.node_secret);
        material.extend_from_slice(public_key.as_bytes());
        hash(&material)
    }

    async fn commit(
        &self,
        namespace: SignNamespace,
        request: SignRequest,
        signer: &dyn AnnounceSigner,
    ) -> Result<QueryReply, DhtError> {
        let signature = signer.sign(namespace, &request).await?;
        let public_key = request.peer.public_key;
        signature
            .verify(&public_key, &request.signable(namespace))
            .map_err(|_| DhtError::InvalidSignature)?;

        let peers = {
            let mut records = self.records.entry(request.target).or_default();
            records.retain(|peer| peer.public_key != public_key);
            if namespace == SignNamespace::Announce {
                records.push(request.peer);
            }
            records.clone()
        };
        if peers.is_empty() {
            self.records.remove_if(&request.target, |_, peers| peers.is_empty());
        }
        debug!(?namespace, records = peers.len(), "record committed");

        Ok(QueryReply {
            from: Some(self.address),
            peers,
        })
    }
}

/// Shared state of a set of in-process nodes
#[derive(Clone)]
pub struct Swarm {
    inner: Arc<SwarmInner>,
}

impl Swarm {
    /// Empty swarm on the loopback address
    #[must_use]
    pub fn new() -> Self {
        let mut node_secret = [0u8; 32];
        rand::thread_rng().fill_bytes(&mut node_secret);
        Self {
            inner: Arc::new(SwarmInner {
                servers: DashMap::new(),
                records: DashMap::new(),
                node_id: hash(&node_secret),
                node_secret,
                address: SocketAddr::from((Ipv4Addr::LOCALHOST, BASE_PORT - 1)),
                next_slot: AtomicU64::new(1),
                next_port: AtomicU16::new(BASE_PORT),
            }),
        }
    }

    /// New node attached to this swarm
    #[must_use]
    pub fn node(&self) -> MemoryDht {
        let port = self.inner.next_port.fetch_add(1, Ordering::Relaxed);
        MemoryDht {
            swarm: Arc::clone(&self.inner),
            address: SocketAddr::from((Ipv4Addr::LOCALHOST, port)),
        }
    }

    /// Address of the storage node that answers queries
    #[must_use]
    pub fn storage_address(&self) -> SocketAddr {
        self.inner.address
    }

    /// Whether a server listens on `public_key`
    #[must_use]
    pub fn is_listening(&self, public_key: &PublicKey) -> bool {
        self.inner.servers.contains_key(public_key)
    }

    /// Records stored under `target`
    #[must_use]
    pub fn records(&self, target: &[u8; 32]) -> Vec<Peer> {
        self.inner
            .records
            .get(target)
            .map(|peers| peers.clone())
            .unwrap_or_default()
    }
}

impl Default for Swarm {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for Swarm {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Swarm")
            .field("servers", &self.inner.servers.len())
            .field("targets", &self.inner.records.len())
            .field("address", &self.inner.address)
            .finish()
    }
}

/// One node of a [`Swarm`]
#[derive(Clone)]
pub struct MemoryDht {
    swarm: Arc<SwarmInner>,
    address: SocketAddr,
}

impl MemoryDht {
    fn commit(
        &self,
        namespace: SignNamespace,
        target: [u8; 32],
        public_key: PublicKey,
        signer: Arc<dyn AnnounceSigner>,
    ) -> QueryStream {
        let (tx, stream) = QueryStream::channel(1);
        let swarm = Arc::clone(&self.swarm);
        tokio::spawn(async move {
            let request = SignRequest {
                target,
                token: swarm.token(&public_key),
                peer_id: swarm.node_id,
                peer: Peer::new(public_key),
            };
            let outcome = tokio::select! {
                outcome = swarm.commit(namespace, request, signer.as_ref()) => outcome,
                () = tx.closed() => return,
            };
            let _ = tx.send(outcome).await;
        });
        stream
    }
}

impl std::fmt::Debug for MemoryDht {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryDht")
            .field("address", &self.address)
            .finish_non_exhaustive()
    }
}

#[async_trait]
impl Dht for MemoryDht {
    async fn connect(
        &self,
        remote_public_key: PublicKey,
        mut initiator: Box<dyn Handshaker>,
        payload: &[u8],
    ) -> Result<DhtStream, DhtError> {
        let (handshakes, firewall, incoming) = {
            let slot = self
                .swarm
                .servers
                .get(&remote_public_key)
                .ok_or(DhtError::PeerNotFound)?;
            (
                Arc::clone(&slot.handshakes),
                slot.firewall.clone(),
                slot.incoming.clone(),
            )
        };
        let mut responder = handshakes.responder()?;

        let msg1 = initiator.send(payload).await?;
        let payload = responder
            .recv(&msg1)
            .await
            .map_err(|e| DhtError::ConnectionFailed(e.to_string()))?;
        let peer = responder
            .remote_public_key()
            .ok_or_else(|| DhtError::ConnectionFailed("responder learned no identity".into()))?;

        if let Some(firewall) = firewall {
            if firewall.deny(&peer, &payload, responder.handshake_id()).await {
                debug!(remote = %remote_public_key, "connection denied by firewall");
                return Err(DhtError::FirewallDenied);
            }
        }

        let msg2 = responder
            .send(&[])
            .await
            .map_err(|e| DhtError::ConnectionFailed(e.to_string()))?;
        initiator.recv(&msg2).await?;

        let (Some(local), Some(remote)) = (initiator.result(), responder.result()) else {
            return Err(DhtError::ConnectionFailed("handshake incomplete".into()));
        };
        let (near, far) = tokio::io::duplex(STREAM_BUFFER);
        incoming
            .send(DhtStream::new(far, remote, responder.handshake_id()))
            .map_err(|_| DhtError::PeerNotFound)?;
        debug!(remote = %remote_public_key, "stream opened");
        Ok(DhtStream::new(near, local, initiator.handshake_id()))
    }

    async fn listen(
        &self,
        public_key: PublicKey,
        handshakes: Arc<dyn HandshakeFactory>,
        firewall: Option<Arc<dyn Firewall>>,
    ) -> Result<DhtServer, DhtError> {
        let (tx, rx) = mpsc::unbounded_channel();
        let id = self.swarm.next_slot.fetch_add(1, Ordering::Relaxed);
        match self.swarm.servers.entry(public_key) {
            Entry::Occupied(_) => return Err(DhtError::AlreadyListening),
            Entry::Vacant(entry) => {
                entry.insert(ServerSlot {
                    id,
                    handshakes,
                    firewall,
                    incoming: tx,
                });
            }
        }
        debug!(%public_key, "server listening");

        let swarm = Arc::clone(&self.swarm);
        Ok(DhtServer::new(public_key, self.address, rx, move || {
            swarm.servers.remove_if(&public_key, |_, slot| slot.id == id);
        }))
    }

    fn lookup(&self, target: [u8; 32]) -> QueryStream {
        let (tx, stream) = QueryStream::channel(1);
        let peers = self
            .swarm
            .records
            .get(&target)
            .map(|peers| peers.clone())
            .unwrap_or_default();
        if !peers.is_empty() {
            let _ = tx.try_send(Ok(QueryReply {
                from: Some(self.swarm.address),
                peers,
            }));
        }
        stream
    }

    fn announce(&self, target: [u8; 32], public_key: PublicKey, signer: Arc<dyn AnnounceSigner>) -> QueryStream {
        self.commit(SignNamespace::Announce, target, public_key, signer)
    }

    fn unannounce(&self, target: [u8; 32], public_key: PublicKey, signer: Arc<dyn AnnounceSigner>) -> QueryStream {
        self.commit(SignNamespace::Unannounce, target, public_key, signer)
    }

    fn local_address(&self) -> SocketAddr {
        self.address
    }
}
