//! Relay side of a relay connection.
//!
//! [`RelayServer`] runs DHT operations on behalf of the endpoints connected
//! to it. Each transport gets one dispatch task that owns every socket,
//! server and query of that endpoint; DHT calls run on spawned tasks and
//! report back through an internal event channel, so the dispatch never
//! waits on the network.

use super::error::RelayError;
use super::firewall::ProxyFirewall;
use super::handshake::{ProxyHandshake, ProxyHandshakeFactory};
use super::link::Link;
use super::protocol::{Protocol, ProtocolConfig, ProtocolEvent, ProtocolHandle};
use super::query::drive;
use super::registry::{AliasGenerator, ConnectionKey, Registry};
use super::signing::ProxySigner;
use crate::dht::{
    AnnounceSigner, Dht, DhtServer, DhtStream, Firewall, HandshakeFactory, Handshaker, LocalHandshake,
    LocalHandshakeFactory, LocalSigner,
};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::sync::mpsc;
use tokio::task::{AbortHandle, JoinHandle};
use tracing::{debug, info};
use wisp_core::Message;
use wisp_crypto::{KeyPair, PublicKey, SecretKey};
use wisp_transport::Duplex;

/// Bytes the pump reads from a DHT stream per `Data` frame
const PUMP_BUFFER_SIZE: usize = 64 * 1024;

/// Default bound on a connect attempt without its own timeout
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(30);

/// Relay server configuration
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Framing and heartbeat
    pub protocol: ProtocolConfig,
    /// Bound on connect attempts that carry no timeout
    pub connect_timeout: Duration,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            protocol: ProtocolConfig::default(),
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
        }
    }
}

/// Relay serving endpoints from one DHT node
#[derive(Debug)]
pub struct RelayServer<D: Dht> {
    dht: Arc<D>,
    config: ServerConfig,
}

impl<D: Dht> RelayServer<D> {
    /// Relay for `dht`
    #[must_use]
    pub fn new(dht: Arc<D>, config: ServerConfig) -> Self {
        Self { dht, config }
    }

    /// The DHT node
    #[must_use]
    pub fn dht(&self) -> &Arc<D> {
        &self.dht
    }

    /// Serve one endpoint on `io`
    pub fn serve<T: Duplex>(&self, io: T) -> RelayConnection {
        let (protocol, events) = Protocol::spawn(io, self.config.protocol.clone());
        let dispatch = Dispatch::new(Arc::clone(&self.dht), protocol.clone(), self.config.connect_timeout);
        let task = tokio::spawn(dispatch.run(events));
        RelayConnection { protocol, task }
    }
}

/// One served endpoint
#[derive(Debug)]
pub struct RelayConnection {
    protocol: ProtocolHandle,
    task: JoinHandle<()>,
}

impl RelayConnection {
    /// Close the connection; everything on it is torn down
    pub fn close(&self) {
        self.protocol.close();
    }

    /// Whether the connection is gone
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.protocol.is_closed()
    }

    /// Wait until the connection is gone and torn down
    pub async fn closed(self) -> Option<RelayError> {
        let reason = self.protocol.closed().await;
        let _ = self.task.await;
        reason
    }
}

/// Results of work the dispatch spawned
enum Event {
    Connected {
        key: ConnectionKey,
        outcome: Result<DhtStream, RelayError>,
    },
    Listened {
        public_key: PublicKey,
        outcome: Result<DhtServer, RelayError>,
    },
    Incoming {
        public_key: PublicKey,
        stream: DhtStream,
    },
    ReadEnded {
        alias: u32,
    },
    ReadFailed {
        alias: u32,
    },
    QueryDone {
        id: u32,
    },
    /// An inbound stream was not paired within the connect timeout
    PairingExpired {
        alias: u32,
    },
}

enum WriteOp {
    Data(Vec<Vec<u8>>),
    End,
}

struct RelaySocket {
    /// Endpoint alias; `None` while an inbound stream waits for `Connected`
    remote_alias: Option<u32>,
    writer: Option<mpsc::UnboundedSender<WriteOp>>,
    /// Read half held back until the endpoint pairs the stream
    pending: Option<ReadHalf<DhtStream>>,
    /// Drops `pending` if the endpoint never answers
    pairing: Option<AbortHandle>,
    pump: Option<AbortHandle>,
    local_ended: bool,
    remote_ended: bool,
}

impl RelaySocket {
    fn abort(&mut self) {
        if let Some(pump) = self.pump.take() {
            pump.abort();
        }
        if let Some(pairing) = self.pairing.take() {
            pairing.abort();
        }
        self.pending = None;
        self.writer = None;
    }
}

struct RelayedListener {
    /// Endpoint server alias
    remote_alias: u32,
    /// Relay alias of the server
    alias: u32,
    /// Pending listen or accept loop
    task: Option<AbortHandle>,
}

struct Dispatch<D: Dht> {
    dht: Arc<D>,
    protocol: ProtocolHandle,
    link: Arc<Link>,
    connect_timeout: Duration,
    aliases: AliasGenerator,
    sockets: Registry<u32, RelaySocket>,
    connecting: Registry<ConnectionKey, AbortHandle>,
    servers: Registry<PublicKey, RelayedListener>,
    queries: Registry<u32, AbortHandle>,
    events_tx: mpsc::UnboundedSender<Event>,
    events_rx: mpsc::UnboundedReceiver<Event>,
}

impl<D: Dht> Dispatch<D> {
    fn new(dht: Arc<D>, protocol: ProtocolHandle, connect_timeout: Duration) -> Self {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        Self {
            dht,
            link: Arc::new(Link::new(protocol.clone())),
            protocol,
            connect_timeout,
            aliases: AliasGenerator::relay(),
            sockets: Registry::new(),
            connecting: Registry::new(),
            servers: Registry::new(),
            queries: Registry::new(),
            events_tx,
            events_rx,
        }
    }

    async fn run(mut self, mut messages: mpsc::Receiver<ProtocolEvent>) {
        info!("endpoint connected");
        let reason = loop {
            tokio::select! {
                message = messages.recv() => match message {
                    Some(ProtocolEvent::Message(message)) => self.on_message(message),
                    Some(ProtocolEvent::Closed(reason)) => break reason,
                    None => break None,
                },
                Some(event) = self.events_rx.recv() => self.on_event(event),
            }
        };
        self.teardown(reason);
    }

    fn next_alias(&self) -> u32 {
        self.aliases.next(|alias| {
            self.sockets.has(&alias) || self.servers.values().any(|server| server.alias == alias)
        })
    }

    fn on_message(&mut self, message: Message) {
        match message {
            Message::Connect {
                alias,
                public_key,
                secret_key,
                remote_public_key,
                timeout_ms,
            } => self.connect(alias, public_key, secret_key, remote_public_key, timeout_ms),
            Message::Connected {
                alias, remote_alias, ..
            } => self.on_paired(alias, remote_alias),
            Message::Destroy { alias, paired, error } => {
                if paired {
                    if let Some(mut socket) = self.sockets.remove(&alias) {
                        debug!(alias, endpoint_alias = ?socket.remote_alias, ?error, "socket destroyed by endpoint");
                        socket.abort();
                    }
                } else if let Some((key, _)) = self.connecting.find(|key, _| key.alias == alias) {
                    let key = *key;
                    if let Some(attempt) = self.connecting.remove(&key) {
                        debug!(endpoint_alias = alias, "connect aborted by endpoint");
                        attempt.abort();
                    }
                }
            }
            Message::Data { alias, chunks } => {
                if let Some(writer) = self.sockets.get(&alias).and_then(|s| s.writer.as_ref()) {
                    let _ = writer.send(WriteOp::Data(chunks));
                }
            }
            Message::End { alias } => {
                if let Some(socket) = self.sockets.get_mut(&alias) {
                    socket.remote_ended = true;
                    if let Some(writer) = &socket.writer {
                        let _ = writer.send(WriteOp::End);
                    }
                    self.release_if_finished(alias);
                }
            }
            Message::Listen {
                alias,
                public_key,
                secret_key,
                firewall,
            } => self.listen(alias, public_key, secret_key, firewall),
            Message::Close { alias } => {
                let key = self
                    .servers
                    .find(|_, server| server.remote_alias == alias)
                    .map(|(key, _)| *key);
                if let Some(mut server) = key.and_then(|key| self.servers.remove(&key)) {
                    if let Some(task) = server.task.take() {
                        task.abort();
                    }
                    debug!(alias, "server closed by endpoint");
                    let _ = self.protocol.send(Message::Closed { alias, error: None });
                }
            }
            Message::Lookup { id, target } => {
                let stream = self.dht.lookup(target);
                self.spawn_query(id, stream);
            }
            Message::Announce {
                id,
                target,
                public_key,
                secret_key,
            } => match self.signer(id, public_key, secret_key) {
                Ok(signer) => {
                    let stream = self.dht.announce(target, public_key, signer);
                    self.spawn_query(id, stream);
                }
                Err(e) => self.fail_query(id, &e),
            },
            Message::Unannounce {
                id,
                target,
                public_key,
                secret_key,
            } => match self.signer(id, public_key, secret_key) {
                Ok(signer) => {
                    let stream = self.dht.unannounce(target, public_key, signer);
                    self.spawn_query(id, stream);
                }
                Err(e) => self.fail_query(id, &e),
            },
            reply @ (Message::NoiseReply { .. }
            | Message::Accept { .. }
            | Message::Deny { .. }
            | Message::Signature { .. }) => {
                let opcode = reply.opcode();
                if !self.link.resolve(reply) {
                    debug!(?opcode, "stale reply");
                }
            }
            other @ (Message::Ping
            | Message::Pong
            | Message::Listening { .. }
            | Message::Connection { .. }
            | Message::Closed { .. }
            | Message::Result { .. }
            | Message::Finished { .. }
            | Message::NoiseSend { .. }
            | Message::NoiseReceive { .. }
            | Message::Incoming { .. }
            | Message::SignAnnounce { .. }
            | Message::SignUnannounce { .. }) => {
                debug!(opcode = ?other.opcode(), "dropping endpoint-bound message");
            }
        }
    }

    fn connect(
        &mut self,
        endpoint_alias: u32,
        public_key: PublicKey,
        secret_key: Option<SecretKey>,
        remote_public_key: PublicKey,
        timeout_ms: Option<u32>,
    ) {
        let key = ConnectionKey::new(endpoint_alias, remote_public_key);
        if self.connecting.has(&key) {
            debug!(endpoint_alias, "duplicate connect ignored");
            return;
        }
        let handshake: Box<dyn Handshaker> = match secret_key {
            Some(secret_key) => {
                match KeyPair::new(public_key, Some(secret_key))
                    .map_err(RelayError::from)
                    .and_then(|kp| LocalHandshake::initiator(&kp, &remote_public_key).map_err(RelayError::from))
                {
                    Ok(handshake) => Box::new(handshake),
                    Err(e) => {
                        self.refuse_connect(endpoint_alias, &e);
                        return;
                    }
                }
            }
            None => Box::new(ProxyHandshake::initiator(
                Arc::clone(&self.link),
                endpoint_alias,
                public_key,
                remote_public_key,
            )),
        };
        let timeout = timeout_ms.map_or(self.connect_timeout, |ms| Duration::from_millis(u64::from(ms)));
        debug!(endpoint_alias, remote = %remote_public_key, ?timeout, "connecting");

        let dht = Arc::clone(&self.dht);
        let events = self.events_tx.clone();
        let task = tokio::spawn(async move {
            // the Connect frame carries no first-message payload
            let connect = dht.connect(remote_public_key, handshake, &[]);
            let outcome = match tokio::time::timeout(timeout, connect).await {
                Ok(outcome) => outcome.map_err(RelayError::from),
                Err(_) => Err(RelayError::ConnectionFailed),
            };
            let _ = events.send(Event::Connected { key, outcome });
        });
        self.connecting.add(key, task.abort_handle());
    }

    fn refuse_connect(&self, endpoint_alias: u32, error: &RelayError) {
        debug!(endpoint_alias, %error, "connect failed");
        let _ = self.protocol.send(Message::Destroy {
            alias: endpoint_alias,
            paired: false,
            error: Some(error.to_wire()),
        });
    }

    fn on_connected(&mut self, key: ConnectionKey, outcome: Result<DhtStream, RelayError>) {
        if self.connecting.remove(&key).is_none() {
            // aborted by the endpoint after the attempt finished
            return;
        }
        let stream = match outcome {
            Ok(stream) => stream,
            Err(e) => {
                self.refuse_connect(key.alias, &e);
                return;
            }
        };
        let alias = self.next_alias();
        let handshake_hash = stream.handshake().hash;
        let handshake_id = stream.handshake_id();
        let (reader, writer) = tokio::io::split(stream);
        let mut socket = RelaySocket {
            remote_alias: Some(key.alias),
            writer: Some(self.spawn_writer(alias, writer)),
            pending: None,
            pairing: None,
            pump: None,
            local_ended: false,
            remote_ended: false,
        };
        let _ = self.protocol.send(Message::Connected {
            alias: key.alias,
            remote_alias: alias,
            handshake_hash: Some(handshake_hash),
            handshake_id,
        });
        socket.pump = Some(self.spawn_pump(alias, key.alias, reader));
        self.sockets.add(alias, socket);
        info!(alias, endpoint_alias = key.alias, remote = %key.public_key, "stream connected");
    }

    fn on_paired(&mut self, alias: u32, remote_alias: u32) {
        let Some(socket) = self.sockets.get_mut(&alias) else {
            // expired or already gone; the endpoint's socket has no peer
            debug!(alias, remote_alias, "connected for an unknown stream");
            let _ = self.protocol.send(Message::Destroy {
                alias: remote_alias,
                paired: true,
                error: Some(RelayError::ConnectionFailed.to_wire()),
            });
            return;
        };
        let Some(reader) = socket.pending.take() else {
            debug!(alias, "connected for a paired stream");
            return;
        };
        if let Some(pairing) = socket.pairing.take() {
            pairing.abort();
        }
        socket.remote_alias = Some(remote_alias);
        let pump = self.spawn_pump(alias, remote_alias, reader);
        if let Some(socket) = self.sockets.get_mut(&alias) {
            socket.pump = Some(pump);
        }
        debug!(alias, remote_alias, "inbound stream paired");
    }

    /// Copies DHT stream bytes to the endpoint
    fn spawn_pump(&self, alias: u32, remote_alias: u32, mut reader: ReadHalf<DhtStream>) -> AbortHandle {
        let protocol = self.protocol.clone();
        let events = self.events_tx.clone();
        tokio::spawn(async move {
            let mut buf = vec![0u8; PUMP_BUFFER_SIZE];
            loop {
                match reader.read(&mut buf).await {
                    Ok(0) => {
                        let _ = protocol.send(Message::End { alias: remote_alias });
                        let _ = events.send(Event::ReadEnded { alias });
                        return;
                    }
                    Ok(n) => {
                        let data = Message::Data {
                            alias: remote_alias,
                            chunks: vec![buf[..n].to_vec()],
                        };
                        if protocol.send(data).is_err() {
                            return;
                        }
                    }
                    Err(e) => {
                        debug!(alias, error = %e, "stream read failed");
                        let _ = protocol.send(Message::Destroy {
                            alias: remote_alias,
                            paired: true,
                            error: Some(RelayError::from(e).to_wire()),
                        });
                        let _ = events.send(Event::ReadFailed { alias });
                        return;
                    }
                }
            }
        })
        .abort_handle()
    }

    /// Copies endpoint data into the DHT stream
    fn spawn_writer(&self, alias: u32, mut writer: WriteHalf<DhtStream>) -> mpsc::UnboundedSender<WriteOp> {
        let (tx, mut rx) = mpsc::unbounded_channel();
        tokio::spawn(async move {
            while let Some(op) = rx.recv().await {
                let result = match op {
                    WriteOp::Data(chunks) => {
                        let mut result = Ok(());
                        for chunk in chunks.iter().filter(|c| !c.is_empty()) {
                            result = writer.write_all(chunk).await;
                            if result.is_err() {
                                break;
                            }
                        }
                        result
                    }
                    WriteOp::End => {
                        let _ = writer.shutdown().await;
                        return;
                    }
                };
                if let Err(e) = result {
                    debug!(alias, error = %e, "stream write failed");
                    return;
                }
            }
        });
        tx
    }

    fn release_if_finished(&mut self, alias: u32) {
        let finished = self
            .sockets
            .get(&alias)
            .is_some_and(|s| s.local_ended && s.remote_ended);
        if finished {
            self.sockets.remove(&alias);
            debug!(alias, "stream finished");
        }
    }

    fn listen(&mut self, endpoint_alias: u32, public_key: PublicKey, secret_key: Option<SecretKey>, firewall: bool) {
        if self.servers.has(&public_key) {
            let _ = self.protocol.send(Message::Closed {
                alias: endpoint_alias,
                error: Some(RelayError::AlreadyListening.to_wire()),
            });
            return;
        }
        let handshakes: Arc<dyn HandshakeFactory> = match secret_key {
            Some(secret_key) => match KeyPair::new(public_key, Some(secret_key)) {
                Ok(key_pair) => Arc::new(LocalHandshakeFactory::new(key_pair)),
                Err(e) => {
                    let _ = self.protocol.send(Message::Closed {
                        alias: endpoint_alias,
                        error: Some(RelayError::from(e).to_wire()),
                    });
                    return;
                }
            },
            None => Arc::new(ProxyHandshakeFactory::new(
                Arc::clone(&self.link),
                endpoint_alias,
                public_key,
            )),
        };
        let firewall: Option<Arc<dyn Firewall>> =
            firewall.then(|| Arc::new(ProxyFirewall::new(Arc::clone(&self.link), endpoint_alias)) as Arc<dyn Firewall>);

        let alias = self.next_alias();
        let dht = Arc::clone(&self.dht);
        let events = self.events_tx.clone();
        let task = tokio::spawn(async move {
            let outcome = dht
                .listen(public_key, handshakes, firewall)
                .await
                .map_err(RelayError::from);
            let _ = events.send(Event::Listened { public_key, outcome });
        });
        self.servers.add(
            public_key,
            RelayedListener {
                remote_alias: endpoint_alias,
                alias,
                task: Some(task.abort_handle()),
            },
        );
    }

    fn on_listened(&mut self, public_key: PublicKey, outcome: Result<DhtServer, RelayError>) {
        let Some(server) = self.servers.get_mut(&public_key) else {
            // closed before the listen finished; dropping the server unregisters it
            return;
        };
        let mut dht_server = match outcome {
            Ok(dht_server) => dht_server,
            Err(e) => {
                let remote_alias = server.remote_alias;
                self.servers.remove(&public_key);
                debug!(alias = remote_alias, error = %e, "listen failed");
                let _ = self.protocol.send(Message::Closed {
                    alias: remote_alias,
                    error: Some(e.to_wire()),
                });
                return;
            }
        };
        let address = dht_server.address();
        let events = self.events_tx.clone();
        let accept = tokio::spawn(async move {
            while let Some(stream) = dht_server.accept().await {
                if events.send(Event::Incoming { public_key, stream }).is_err() {
                    return;
                }
            }
        });
        server.task = Some(accept.abort_handle());
        info!(alias = server.alias, endpoint_alias = server.remote_alias, %public_key, %address, "listening");
        let _ = self.protocol.send(Message::Listening {
            alias: server.remote_alias,
            remote_alias: server.alias,
            address,
        });
    }

    fn on_incoming(&mut self, public_key: PublicKey, stream: DhtStream) {
        let Some(server_alias) = self.servers.get(&public_key).map(|s| s.remote_alias) else {
            return;
        };
        let alias = self.next_alias();
        let remote_public_key = stream.remote_public_key();
        let handshake_hash = stream.handshake().hash;
        let handshake_id = stream.handshake_id();
        let (reader, writer) = tokio::io::split(stream);
        let events = self.events_tx.clone();
        let timeout = self.connect_timeout;
        let pairing = tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            let _ = events.send(Event::PairingExpired { alias });
        });
        let socket = RelaySocket {
            remote_alias: None,
            writer: Some(self.spawn_writer(alias, writer)),
            pending: Some(reader),
            pairing: Some(pairing.abort_handle()),
            pump: None,
            local_ended: false,
            remote_ended: false,
        };
        self.sockets.add(alias, socket);
        debug!(alias, server_alias, remote = %remote_public_key, "incoming stream");
        let _ = self.protocol.send(Message::Connection {
            alias,
            server_alias,
            remote_public_key,
            handshake_hash,
            handshake_id,
        });
    }

    fn signer(
        &self,
        id: u32,
        public_key: PublicKey,
        secret_key: Option<SecretKey>,
    ) -> Result<Arc<dyn AnnounceSigner>, RelayError> {
        Ok(match secret_key {
            Some(secret_key) => Arc::new(LocalSigner::new(KeyPair::new(public_key, Some(secret_key))?)),
            None => Arc::new(ProxySigner::new(Arc::clone(&self.link), id)),
        })
    }

    fn spawn_query(&mut self, id: u32, stream: crate::dht::QueryStream) {
        if let Some(previous) = self.queries.remove(&id) {
            previous.abort();
        }
        let protocol = self.protocol.clone();
        let events = self.events_tx.clone();
        let task = tokio::spawn(async move {
            drive(id, stream, protocol).await;
            let _ = events.send(Event::QueryDone { id });
        });
        self.queries.add(id, task.abort_handle());
    }

    fn fail_query(&self, id: u32, error: &RelayError) {
        let _ = self.protocol.send(Message::Finished {
            id,
            error: Some(error.to_wire()),
        });
    }

    fn on_event(&mut self, event: Event) {
        match event {
            Event::Connected { key, outcome } => self.on_connected(key, outcome),
            Event::Listened { public_key, outcome } => self.on_listened(public_key, outcome),
            Event::Incoming { public_key, stream } => self.on_incoming(public_key, stream),
            Event::ReadEnded { alias } => {
                if let Some(socket) = self.sockets.get_mut(&alias) {
                    socket.local_ended = true;
                    socket.pump = None;
                    self.release_if_finished(alias);
                }
            }
            Event::ReadFailed { alias } => {
                if let Some(mut socket) = self.sockets.remove(&alias) {
                    socket.abort();
                }
            }
            Event::QueryDone { id } => {
                self.queries.remove(&id);
            }
            Event::PairingExpired { alias } => {
                if !self.sockets.get(&alias).is_some_and(|s| s.pending.is_some()) {
                    return;
                }
                if let Some(mut socket) = self.sockets.remove(&alias) {
                    socket.abort();
                    debug!(alias, timeout = ?self.connect_timeout, "inbound stream never paired");
                }
            }
        }
    }

    fn teardown(mut self, reason: Option<RelayError>) {
        info!(
            sockets = self.sockets.len(),
            servers = self.servers.len(),
            queries = self.queries.len(),
            reason = ?reason,
            "endpoint disconnected"
        );
        for (_, attempt) in self.connecting.drain() {
            attempt.abort();
        }
        for (_, mut server) in self.servers.drain() {
            if let Some(task) = server.task.take() {
                task.abort();
            }
        }
        for (_, query) in self.queries.drain() {
            query.abort();
        }
        for (_, mut socket) in self.sockets.drain() {
            socket.abort();
        }
        self.link.cancel_all();
        self.protocol.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dht::{LocalHandshake, Swarm};
    use crate::relay::error::{ALREADY_LISTENING, PEER_CONNECTION_FAILED, PEER_NOT_FOUND};
    use tokio::time::Instant;

    /// Relay over a fresh swarm plus the endpoint end of its transport
    fn relay(swarm: &Swarm) -> (RelayConnection, ProtocolHandle, mpsc::Receiver<ProtocolEvent>) {
        let server = RelayServer::new(Arc::new(swarm.node()), ServerConfig::default());
        let (a, b) = wisp_transport::memory::pipe();
        let connection = server.serve(a);
        let (endpoint, events) = Protocol::spawn(b, ProtocolConfig::default());
        (connection, endpoint, events)
    }

    async fn next(events: &mut mpsc::Receiver<ProtocolEvent>) -> Message {
        match events.recv().await {
            Some(ProtocolEvent::Message(message)) => message,
            other => panic!("unexpected {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_connect_unknown_peer() {
        let swarm = Swarm::new();
        let (_connection, endpoint, mut events) = relay(&swarm);
        let kp = KeyPair::generate();
        endpoint
            .send(Message::Connect {
                alias: 2,
                public_key: kp.public_key,
                secret_key: kp.secret_key.clone(),
                remote_public_key: KeyPair::generate().public_key,
                timeout_ms: None,
            })
            .unwrap();
        match next(&mut events).await {
            Message::Destroy {
                alias: 2,
                paired: false,
                error,
            } => assert_eq!(error.as_deref(), Some(PEER_NOT_FOUND)),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_custodial_listen_and_duplicate() {
        let swarm = Swarm::new();
        let (_connection, endpoint, mut events) = relay(&swarm);
        let kp = KeyPair::generate();
        let listen = |alias| Message::Listen {
            alias,
            public_key: kp.public_key,
            secret_key: kp.secret_key.clone(),
            firewall: false,
        };
        endpoint.send(listen(2)).unwrap();
        match next(&mut events).await {
            Message::Listening {
                alias: 2,
                remote_alias,
                ..
            } => assert_eq!(remote_alias % 2, 1),
            other => panic!("unexpected {other:?}"),
        }
        assert!(swarm.is_listening(&kp.public_key));

        endpoint.send(listen(4)).unwrap();
        match next(&mut events).await {
            Message::Closed { alias: 4, error } => assert_eq!(error.as_deref(), Some(ALREADY_LISTENING)),
            other => panic!("unexpected {other:?}"),
        }

        endpoint.send(Message::Close { alias: 2 }).unwrap();
        assert!(matches!(next(&mut events).await, Message::Closed { alias: 2, error: None }));
    }

    #[tokio::test]
    async fn test_custodial_announce_then_lookup() {
        let swarm = Swarm::new();
        let (_connection, endpoint, mut events) = relay(&swarm);
        let kp = KeyPair::generate();
        let target = [6u8; 32];
        endpoint
            .send(Message::Announce {
                id: 1,
                target,
                public_key: kp.public_key,
                secret_key: kp.secret_key.clone(),
            })
            .unwrap();
        assert!(matches!(next(&mut events).await, Message::Result { id: 1, .. }));
        assert!(matches!(next(&mut events).await, Message::Finished { id: 1, error: None }));

        endpoint.send(Message::Lookup { id: 2, target }).unwrap();
        match next(&mut events).await {
            Message::Result { id: 2, reply } => assert_eq!(reply.peers[0].public_key, kp.public_key),
            other => panic!("unexpected {other:?}"),
        }
        assert!(matches!(next(&mut events).await, Message::Finished { id: 2, error: None }));
    }

    #[tokio::test]
    async fn test_endpoint_close_tears_down() {
        let swarm = Swarm::new();
        let (connection, endpoint, mut events) = relay(&swarm);
        let kp = KeyPair::generate();
        endpoint
            .send(Message::Listen {
                alias: 2,
                public_key: kp.public_key,
                secret_key: kp.secret_key.clone(),
                firewall: false,
            })
            .unwrap();
        assert!(matches!(next(&mut events).await, Message::Listening { .. }));
        endpoint.close();
        connection.closed().await;
        // the aborted accept loop drops the DHT server on its next poll
        for _ in 0..100 {
            if !swarm.is_listening(&kp.public_key) {
                break;
            }
            tokio::task::yield_now().await;
        }
        assert!(!swarm.is_listening(&kp.public_key));
    }

    #[tokio::test(start_paused = true)]
    async fn test_unpaired_inbound_stream_expires() {
        let swarm = Swarm::new();
        let config = ServerConfig {
            connect_timeout: Duration::from_secs(1),
            ..ServerConfig::default()
        };
        let server = RelayServer::new(Arc::new(swarm.node()), config);
        let (a, b) = wisp_transport::memory::pipe();
        let _connection = server.serve(a);
        let (endpoint, mut events) = Protocol::spawn(b, ProtocolConfig::default());

        let kp = KeyPair::generate();
        endpoint
            .send(Message::Listen {
                alias: 2,
                public_key: kp.public_key,
                secret_key: kp.secret_key.clone(),
                firewall: false,
            })
            .unwrap();
        assert!(matches!(next(&mut events).await, Message::Listening { .. }));

        let start = Instant::now();
        let handshake = LocalHandshake::initiator(&KeyPair::generate(), &kp.public_key).unwrap();
        let mut peer = swarm
            .node()
            .connect(kp.public_key, Box::new(handshake), &[])
            .await
            .unwrap();
        let alias = match next(&mut events).await {
            Message::Connection {
                alias, server_alias: 2, ..
            } => alias,
            other => panic!("unexpected {other:?}"),
        };

        // the endpoint never answers, so the relay lets go of the stream
        let mut buf = [0u8; 1];
        assert_eq!(peer.read(&mut buf).await.unwrap(), 0);
        assert!(start.elapsed() >= Duration::from_secs(1));

        endpoint
            .send(Message::Connected {
                alias,
                remote_alias: 4,
                handshake_hash: None,
                handshake_id: None,
            })
            .unwrap();
        match next(&mut events).await {
            Message::Destroy {
                alias: 4,
                paired: true,
                error,
            } => assert_eq!(error.as_deref(), Some(PEER_CONNECTION_FAILED)),
            other => panic!("unexpected {other:?}"),
        }
    }
}
