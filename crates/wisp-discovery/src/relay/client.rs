//! Endpoint side of a relay connection.
//!
//! [`RelayClient`] drives a DHT node that lives on the relay. One dispatch
//! task owns every socket, server, query and handshake session of the
//! connection; the public handles talk to it through commands and never
//! touch the transport themselves.

use super::error::RelayError;
use super::firewall::{FirewallFn, evaluate};
use super::handshake::{HandshakeSessions, NoiseRequest};
use super::protocol::{Protocol, ProtocolConfig, ProtocolEvent, ProtocolHandle};
use super::query::{Query, QueryEvent, QueryKind, QueryRequest};
use super::registry::{AliasGenerator, IdGenerator, Registry};
use super::signing::SignatureRequest;
use super::stream::{
    Activity, RelayedServer, RelayedStream, ServerParts, StreamEvent, StreamInfo, StreamParts, StreamState, touch,
};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::time::Instant;
use tracing::{debug, info};
use wisp_core::Message;
use wisp_crypto::{CryptoError, HandshakeHash, KeyPair, NoiseHandshake, PublicKey};
use wisp_transport::Duplex;

/// Client configuration
#[derive(Debug, Clone, Default)]
pub struct ClientConfig {
    /// Framing and heartbeat
    pub protocol: ProtocolConfig,
}

/// Options for [`RelayClient::connect`]
#[derive(Debug, Clone)]
pub struct ConnectOptions {
    /// Identity to connect as; must hold a secret key
    pub key_pair: KeyPair,
    /// Hand the secret key to the relay instead of answering handshake steps
    pub custodial: bool,
    /// Bound on the relay's connect attempt
    pub timeout: Option<Duration>,
}

impl ConnectOptions {
    /// Non-custodial connect as `key_pair`
    #[must_use]
    pub fn new(key_pair: KeyPair) -> Self {
        Self {
            key_pair,
            custodial: false,
            timeout: None,
        }
    }

    /// Set custodial mode
    #[must_use]
    pub fn custodial(mut self, custodial: bool) -> Self {
        self.custodial = custodial;
        self
    }

    /// Bound the connect attempt
    #[must_use]
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }
}

/// Options for [`RelayClient::listen`]
#[derive(Clone)]
pub struct ServerOptions {
    /// Identity to listen as; must hold a secret key
    pub key_pair: KeyPair,
    /// Hand the secret key to the relay
    pub custodial: bool,
    /// Decides on each incoming connection; `Ok(true)` denies
    pub firewall: Option<FirewallFn>,
}

impl ServerOptions {
    /// Non-custodial server for `key_pair` without a firewall
    #[must_use]
    pub fn new(key_pair: KeyPair) -> Self {
        Self {
            key_pair,
            custodial: false,
            firewall: None,
        }
    }

    /// Set custodial mode
    #[must_use]
    pub fn custodial(mut self, custodial: bool) -> Self {
        self.custodial = custodial;
        self
    }

    /// Install a firewall
    #[must_use]
    pub fn firewall(mut self, firewall: FirewallFn) -> Self {
        self.firewall = Some(firewall);
        self
    }
}

impl std::fmt::Debug for ServerOptions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServerOptions")
            .field("key_pair", &self.key_pair)
            .field("custodial", &self.custodial)
            .field("firewall", &self.firewall.is_some())
            .finish()
    }
}

/// What the handles ask of the dispatch task
#[derive(Debug)]
pub(crate) enum Command {
    Connect {
        remote_public_key: PublicKey,
        options: ConnectOptions,
        reply: oneshot::Sender<StreamParts>,
    },
    Listen {
        options: ServerOptions,
        reply: oneshot::Sender<Result<ServerParts, RelayError>>,
    },
    CloseServer {
        alias: u32,
    },
    Write {
        alias: u32,
        data: Vec<u8>,
    },
    End {
        alias: u32,
    },
    Destroy {
        alias: u32,
        error: Option<RelayError>,
    },
    Query {
        request: QueryRequest,
        events: mpsc::UnboundedSender<QueryEvent>,
    },
    /// The [`Query`] handle was dropped before it finished
    DropQuery {
        id: u32,
    },
    Close,
}

/// Results of work the dispatch spawned
#[derive(Debug)]
enum Internal {
    FirewallDecision { id: u32, handshake_id: u32, deny: bool },
}

#[derive(Debug)]
struct ClientInner {
    commands: mpsc::UnboundedSender<Command>,
    protocol: ProtocolHandle,
}

impl Drop for ClientInner {
    fn drop(&mut self) {
        let _ = self.commands.send(Command::Close);
    }
}

/// Endpoint of a relay connection
#[derive(Debug, Clone)]
pub struct RelayClient {
    inner: Arc<ClientInner>,
}

impl RelayClient {
    /// Start the protocol on `io`
    pub fn new<T: Duplex>(io: T, config: ClientConfig) -> Self {
        let (protocol, events) = Protocol::spawn(io, config.protocol);
        let (commands_tx, commands_rx) = mpsc::unbounded_channel();
        let dispatch = Dispatch::new(protocol.clone());
        tokio::spawn(dispatch.run(events, commands_rx));
        Self {
            inner: Arc::new(ClientInner {
                commands: commands_tx,
                protocol,
            }),
        }
    }

    /// Open a stream to `remote_public_key`.
    ///
    /// The stream is usable at once; writes are held until the relay pairs
    /// it. Await [`RelayedStream::opened`] for the outcome.
    ///
    /// `options.key_pair` must carry its secret key in both modes: custodial
    /// mode hands it to the relay, non-custodial mode answers handshake steps
    /// with it. A public-only key pair is refused before anything is sent.
    ///
    /// # Errors
    ///
    /// Returns [`RelayError::Crypto`] for a key pair without a secret key and
    /// [`RelayError::Closed`] once the client is closed.
    pub async fn connect(
        &self,
        remote_public_key: PublicKey,
        options: ConnectOptions,
    ) -> Result<RelayedStream, RelayError> {
        if !options.key_pair.is_custodial() {
            return Err(CryptoError::MissingSecretKey.into());
        }
        let (reply, parts) = oneshot::channel();
        self.command(Command::Connect {
            remote_public_key,
            options,
            reply,
        })?;
        let parts = parts.await.map_err(|_| RelayError::Closed)?;
        Ok(RelayedStream::new(parts, self.inner.commands.clone()))
    }

    /// Start a server on the relay's node.
    ///
    /// As with [`connect`](Self::connect), `options.key_pair` must carry its
    /// secret key in both modes.
    ///
    /// # Errors
    ///
    /// Returns [`RelayError::Crypto`] for a key pair without a secret key,
    /// [`RelayError::AlreadyListening`] if the key already has a server and
    /// [`RelayError::Closed`] once the client is closed.
    pub async fn listen(&self, options: ServerOptions) -> Result<RelayedServer, RelayError> {
        if !options.key_pair.is_custodial() {
            return Err(CryptoError::MissingSecretKey.into());
        }
        let (reply, parts) = oneshot::channel();
        self.command(Command::Listen { options, reply })?;
        let parts = parts.await.map_err(|_| RelayError::Closed)??;
        Ok(RelayedServer::new(parts, self.inner.commands.clone()))
    }

    /// Find peers announced under `target`
    #[must_use]
    pub fn lookup(&self, target: [u8; 32]) -> Query {
        self.query(QueryRequest {
            kind: QueryKind::Lookup,
            target,
            public_key: PublicKey::default(),
            key_pair: None,
            custodial: false,
        })
    }

    /// Announce `key_pair` under `target`; signatures are made locally
    /// unless `custodial`
    #[must_use]
    pub fn announce(&self, target: [u8; 32], key_pair: KeyPair, custodial: bool) -> Query {
        self.record_query(QueryKind::Announce, target, key_pair, custodial)
    }

    /// Remove the announcement of `key_pair` under `target`
    #[must_use]
    pub fn unannounce(&self, target: [u8; 32], key_pair: KeyPair, custodial: bool) -> Query {
        self.record_query(QueryKind::Unannounce, target, key_pair, custodial)
    }

    fn record_query(&self, kind: QueryKind, target: [u8; 32], key_pair: KeyPair, custodial: bool) -> Query {
        self.query(QueryRequest {
            kind,
            target,
            public_key: key_pair.public_key,
            key_pair: Some(key_pair),
            custodial,
        })
    }

    fn query(&self, request: QueryRequest) -> Query {
        let commands = self.inner.commands.clone();
        let cancel = self.inner.commands.clone();
        Query::new(
            request,
            Box::new(move |request, events| commands.send(Command::Query { request, events }).is_ok()),
            Box::new(move |id| {
                let _ = cancel.send(Command::DropQuery { id });
            }),
        )
    }

    /// Close the connection and everything on it
    pub fn close(&self) {
        let _ = self.inner.commands.send(Command::Close);
    }

    /// Whether the connection is gone
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.inner.protocol.is_closed()
    }

    /// Wait for the connection to close, returning the reason
    pub async fn closed(&self) -> Option<RelayError> {
        self.inner.protocol.closed().await
    }

    fn command(&self, command: Command) -> Result<(), RelayError> {
        if self.is_closed() {
            return Err(RelayError::Closed);
        }
        self.inner.commands.send(command).map_err(|_| RelayError::Closed)
    }
}

#[derive(Debug)]
struct ClientSocket {
    /// Relay alias once paired
    remote_alias: Option<u32>,
    remote_public_key: PublicKey,
    /// Held until the initiator session starts
    key_pair: Option<KeyPair>,
    events: mpsc::UnboundedSender<StreamEvent>,
    state: watch::Sender<StreamState>,
    activity: Activity,
    buffered: Vec<Vec<u8>>,
    local_ended: bool,
    remote_ended: bool,
}

impl ClientSocket {
    fn close(&self, reason: Option<RelayError>) {
        let _ = self.events.send(StreamEvent::Destroyed(reason.clone()));
        self.state.send_replace(StreamState::Closed(reason));
    }
}

struct ClientServer {
    public_key: PublicKey,
    key_pair: KeyPair,
    custodial: bool,
    firewall: Option<FirewallFn>,
    listening: Option<oneshot::Sender<Result<ServerParts, RelayError>>>,
    connections: mpsc::UnboundedSender<StreamParts>,
    pending_connections: Option<mpsc::UnboundedReceiver<StreamParts>>,
}

struct ClientQuery {
    target: [u8; 32],
    key_pair: Option<KeyPair>,
    events: mpsc::UnboundedSender<QueryEvent>,
}

struct Dispatch {
    protocol: ProtocolHandle,
    internal_tx: mpsc::UnboundedSender<Internal>,
    internal_rx: mpsc::UnboundedReceiver<Internal>,
    aliases: AliasGenerator,
    query_ids: IdGenerator,
    sockets: Registry<u32, ClientSocket>,
    servers: Registry<u32, ClientServer>,
    queries: Registry<u32, ClientQuery>,
    sessions: HandshakeSessions,
    deferred: Option<Command>,
}

impl Dispatch {
    fn new(protocol: ProtocolHandle) -> Self {
        let (internal_tx, internal_rx) = mpsc::unbounded_channel();
        Self {
            protocol,
            internal_tx,
            internal_rx,
            aliases: AliasGenerator::endpoint(),
            query_ids: IdGenerator::new(),
            sockets: Registry::new(),
            servers: Registry::new(),
            queries: Registry::new(),
            sessions: HandshakeSessions::new(),
            deferred: None,
        }
    }

    async fn run(
        mut self,
        mut events: mpsc::Receiver<ProtocolEvent>,
        mut commands: mpsc::UnboundedReceiver<Command>,
    ) {
        let reason = loop {
            if let Some(command) = self.deferred.take() {
                if !self.on_command(command, &mut commands) {
                    break None;
                }
                continue;
            }
            tokio::select! {
                event = events.recv() => match event {
                    Some(ProtocolEvent::Message(message)) => self.on_message(message),
                    Some(ProtocolEvent::Closed(reason)) => break reason,
                    None => break Some(RelayError::Closed),
                },
                command = commands.recv() => match command {
                    Some(command) => {
                        if !self.on_command(command, &mut commands) {
                            break None;
                        }
                    }
                    None => break None,
                },
                Some(internal) = self.internal_rx.recv() => self.on_internal(internal),
            }
        };
        self.teardown(reason);
    }

    /// Returns false when the client is closing
    fn on_command(&mut self, command: Command, commands: &mut mpsc::UnboundedReceiver<Command>) -> bool {
        match command {
            Command::Connect {
                remote_public_key,
                options,
                reply,
            } => self.connect(remote_public_key, options, reply),
            Command::Listen { options, reply } => self.listen(options, reply),
            Command::CloseServer { alias } => self.close_server(alias),
            Command::Write { alias, data } => {
                let mut chunks = vec![data];
                // coalesce writes that are already queued for the same socket
                while let Ok(next) = commands.try_recv() {
                    match next {
                        Command::Write { alias: next_alias, data } if next_alias == alias => chunks.push(data),
                        other => {
                            self.deferred = Some(other);
                            break;
                        }
                    }
                }
                self.write(alias, chunks);
            }
            Command::End { alias } => self.end(alias),
            Command::Destroy { alias, error } => self.destroy(alias, error),
            Command::Query { request, events } => self.start_query(request, events),
            Command::DropQuery { id } => {
                if self.queries.remove(&id).is_some() {
                    debug!(id, "query dropped");
                }
            }
            Command::Close => {
                debug!("relay client closing");
                return false;
            }
        }
        true
    }

    fn next_alias(&self) -> u32 {
        self.aliases
            .next(|alias| self.sockets.has(&alias) || self.servers.has(&alias))
    }

    fn connect(&mut self, remote_public_key: PublicKey, options: ConnectOptions, reply: oneshot::Sender<StreamParts>) {
        let alias = self.next_alias();
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (state_tx, state_rx) = watch::channel(StreamState::Opening);
        let activity = Arc::new(watch::channel(Instant::now()).0);

        let request = Message::Connect {
            alias,
            public_key: options.key_pair.public_key,
            secret_key: options
                .custodial
                .then(|| options.key_pair.secret_key.clone())
                .flatten(),
            remote_public_key,
            timeout_ms: options
                .timeout
                .map(|t| u32::try_from(t.as_millis()).unwrap_or(u32::MAX)),
        };
        debug!(alias, remote = %remote_public_key, custodial = options.custodial, "connect");

        let socket = ClientSocket {
            remote_alias: None,
            remote_public_key,
            key_pair: (!options.custodial).then_some(options.key_pair),
            events: events_tx,
            state: state_tx,
            activity: Arc::clone(&activity),
            buffered: Vec::new(),
            local_ended: false,
            remote_ended: false,
        };
        if let Err(e) = self.protocol.send(request) {
            socket.close(Some(e));
        } else {
            self.sockets.add(alias, socket);
        }

        let _ = reply.send(StreamParts {
            alias,
            remote_public_key,
            events: events_rx,
            state: state_rx,
            activity,
        });
    }

    fn listen(&mut self, options: ServerOptions, reply: oneshot::Sender<Result<ServerParts, RelayError>>) {
        let alias = self.next_alias();
        let public_key = options.key_pair.public_key;
        let request = Message::Listen {
            alias,
            public_key,
            secret_key: options
                .custodial
                .then(|| options.key_pair.secret_key.clone())
                .flatten(),
            firewall: options.firewall.is_some(),
        };
        if let Err(e) = self.protocol.send(request) {
            let _ = reply.send(Err(e));
            return;
        }
        debug!(alias, %public_key, "listen");
        let (connections, pending_connections) = mpsc::unbounded_channel();
        self.servers.add(
            alias,
            ClientServer {
                public_key,
                key_pair: options.key_pair,
                custodial: options.custodial,
                firewall: options.firewall,
                listening: Some(reply),
                connections,
                pending_connections: Some(pending_connections),
            },
        );
    }

    fn close_server(&mut self, alias: u32) {
        if self.servers.remove(&alias).is_some() {
            self.sessions.destroy_alias(alias, false);
            let _ = self.protocol.send(Message::Close { alias });
            debug!(alias, "server closed");
        }
    }

    fn write(&mut self, alias: u32, chunks: Vec<Vec<u8>>) {
        let Some(socket) = self.sockets.get_mut(&alias) else {
            return;
        };
        match socket.remote_alias {
            Some(remote_alias) => {
                let _ = self.protocol.send(Message::Data {
                    alias: remote_alias,
                    chunks,
                });
            }
            None => socket.buffered.extend(chunks),
        }
    }

    fn end(&mut self, alias: u32) {
        let Some(socket) = self.sockets.get_mut(&alias) else {
            return;
        };
        socket.local_ended = true;
        if let Some(remote_alias) = socket.remote_alias {
            let _ = self.protocol.send(Message::End { alias: remote_alias });
        }
        self.release_if_finished(alias);
    }

    fn destroy(&mut self, alias: u32, error: Option<RelayError>) {
        let Some(socket) = self.sockets.remove(&alias) else {
            return;
        };
        self.sessions.destroy_alias(alias, true);
        let wire = error.as_ref().map(RelayError::to_wire);
        let frame = match socket.remote_alias {
            Some(remote_alias) => Message::Destroy {
                alias: remote_alias,
                paired: true,
                error: wire,
            },
            None => Message::Destroy {
                alias,
                paired: false,
                error: wire,
            },
        };
        let _ = self.protocol.send(frame);
        debug!(alias, ?error, "socket destroyed locally");
        socket.close(error);
    }

    fn release_if_finished(&mut self, alias: u32) {
        let finished = self
            .sockets
            .get(&alias)
            .is_some_and(|s| s.local_ended && s.remote_ended);
        if finished {
            self.sockets.remove(&alias);
        }
    }

    fn start_query(&mut self, request: QueryRequest, events: mpsc::UnboundedSender<QueryEvent>) {
        let id = self.query_ids.next_free(|id| self.queries.has(&id));
        if events.send(QueryEvent::Started(id)).is_err() {
            // dropped before it got here
            return;
        }
        let secret_key = if request.custodial {
            request.key_pair.as_ref().and_then(|kp| kp.secret_key.clone())
        } else {
            None
        };
        let frame = match request.kind {
            QueryKind::Lookup => Message::Lookup {
                id,
                target: request.target,
            },
            QueryKind::Announce => Message::Announce {
                id,
                target: request.target,
                public_key: request.public_key,
                secret_key,
            },
            QueryKind::Unannounce => Message::Unannounce {
                id,
                target: request.target,
                public_key: request.public_key,
                secret_key,
            },
        };
        if let Err(e) = self.protocol.send(frame) {
            let _ = events.send(QueryEvent::Finished(Some(e)));
            return;
        }
        debug!(id, kind = ?request.kind, "query started");
        self.queries.add(
            id,
            ClientQuery {
                target: request.target,
                key_pair: request.key_pair,
                events,
            },
        );
    }

    fn on_message(&mut self, message: Message) {
        match message {
            Message::Connected {
                alias,
                remote_alias,
                handshake_hash,
                handshake_id,
            } => self.on_connected(alias, remote_alias, handshake_hash, handshake_id),
            Message::Destroy { alias, error, .. } => {
                if let Some(socket) = self.sockets.remove(&alias) {
                    self.sessions.destroy_alias(alias, true);
                    let reason = error.as_deref().map(RelayError::from_wire);
                    debug!(alias, ?reason, "socket destroyed by relay");
                    socket.close(reason);
                }
            }
            Message::End { alias } => {
                if let Some(socket) = self.sockets.get_mut(&alias) {
                    socket.remote_ended = true;
                    let _ = socket.events.send(StreamEvent::End);
                    self.release_if_finished(alias);
                }
            }
            Message::Data { alias, chunks } => {
                if let Some(socket) = self.sockets.get(&alias) {
                    touch(&socket.activity);
                    for chunk in chunks.into_iter().filter(|c| !c.is_empty()) {
                        let _ = socket.events.send(StreamEvent::Data(chunk));
                    }
                }
            }
            Message::Listening {
                alias,
                remote_alias,
                address,
            } => {
                if let Some(server) = self.servers.get_mut(&alias) {
                    if let (Some(reply), Some(connections)) =
                        (server.listening.take(), server.pending_connections.take())
                    {
                        info!(alias, remote_alias, %address, public_key = %server.public_key, "listening");
                        let _ = reply.send(Ok(ServerParts {
                            alias,
                            public_key: server.public_key,
                            address,
                            connections,
                        }));
                    }
                }
            }
            Message::Closed { alias, error } => {
                if let Some(mut server) = self.servers.remove(&alias) {
                    self.sessions.destroy_alias(alias, false);
                    let reason = error.as_deref().map_or(RelayError::Closed, RelayError::from_wire);
                    debug!(alias, %reason, "server closed by relay");
                    if let Some(reply) = server.listening.take() {
                        let _ = reply.send(Err(reason));
                    }
                }
            }
            Message::Connection {
                alias,
                server_alias,
                remote_public_key,
                handshake_hash,
                handshake_id,
            } => self.on_connection(alias, server_alias, remote_public_key, handshake_hash, handshake_id),
            message @ (Message::NoiseSend { .. } | Message::NoiseReceive { .. }) => {
                if let Some(request) = NoiseRequest::from_message(message) {
                    self.on_noise(request);
                }
            }
            Message::Incoming {
                id,
                server_alias,
                remote_public_key,
                payload,
                handshake_id,
            } => self.on_incoming(id, server_alias, remote_public_key, payload, handshake_id),
            message @ (Message::SignAnnounce { .. } | Message::SignUnannounce { .. }) => {
                if let Some(request) = SignatureRequest::from_message(message) {
                    self.on_sign(&request);
                }
            }
            Message::Result { id, reply } => {
                if let Some(query) = self.queries.get(&id) {
                    let _ = query.events.send(QueryEvent::Reply(reply));
                }
            }
            Message::Finished { id, error } => {
                if let Some(query) = self.queries.remove(&id) {
                    debug!(id, ?error, "query finished");
                    let _ = query
                        .events
                        .send(QueryEvent::Finished(error.as_deref().map(RelayError::from_wire)));
                }
            }
            other @ (Message::Ping
            | Message::Pong
            | Message::Connect { .. }
            | Message::Listen { .. }
            | Message::Close { .. }
            | Message::Lookup { .. }
            | Message::Announce { .. }
            | Message::Unannounce { .. }
            | Message::NoiseReply { .. }
            | Message::Accept { .. }
            | Message::Deny { .. }
            | Message::Signature { .. }) => {
                debug!(opcode = ?other.opcode(), "dropping relay-bound message");
            }
        }
    }

    fn on_connected(
        &mut self,
        alias: u32,
        remote_alias: u32,
        handshake_hash: Option<HandshakeHash>,
        handshake_id: Option<u32>,
    ) {
        let Some(socket) = self.sockets.get_mut(&alias) else {
            // destroyed while the relay was still connecting
            let _ = self.protocol.send(Message::Destroy {
                alias: remote_alias,
                paired: true,
                error: None,
            });
            return;
        };
        if socket.remote_alias.is_some() {
            debug!(alias, "duplicate connected");
            return;
        }
        socket.remote_alias = Some(remote_alias);
        socket.key_pair = None;
        if let Some(id) = handshake_id {
            self.sessions.consume(id);
        }
        let buffered = std::mem::take(&mut socket.buffered);
        if !buffered.is_empty() {
            let _ = self.protocol.send(Message::Data {
                alias: remote_alias,
                chunks: buffered,
            });
        }
        if socket.local_ended {
            let _ = self.protocol.send(Message::End { alias: remote_alias });
        }
        touch(&socket.activity);
        socket.state.send_replace(StreamState::Open(StreamInfo {
            remote_alias,
            handshake_hash,
            handshake_id,
        }));
        debug!(alias, remote_alias, "stream open");
    }

    fn on_connection(
        &mut self,
        remote_alias: u32,
        server_alias: u32,
        remote_public_key: PublicKey,
        handshake_hash: HandshakeHash,
        handshake_id: Option<u32>,
    ) {
        if let Some(id) = handshake_id {
            self.sessions.consume(id);
        }
        if !self.servers.has(&server_alias) {
            let _ = self.protocol.send(Message::Destroy {
                alias: remote_alias,
                paired: true,
                error: None,
            });
            return;
        }
        let alias = self.next_alias();
        let info = StreamInfo {
            remote_alias,
            handshake_hash: Some(handshake_hash),
            handshake_id,
        };
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (state_tx, state_rx) = watch::channel(StreamState::Open(info));
        let activity = Arc::new(watch::channel(Instant::now()).0);
        let parts = StreamParts {
            alias,
            remote_public_key,
            events: events_rx,
            state: state_rx,
            activity: Arc::clone(&activity),
        };
        let delivered = self
            .servers
            .get(&server_alias)
            .is_some_and(|server| server.connections.send(parts).is_ok());
        if !delivered {
            let _ = self.protocol.send(Message::Destroy {
                alias: remote_alias,
                paired: true,
                error: None,
            });
            return;
        }
        self.sockets.add(
            alias,
            ClientSocket {
                remote_alias: Some(remote_alias),
                remote_public_key,
                key_pair: None,
                events: events_tx,
                state: state_tx,
                activity,
                buffered: Vec::new(),
                local_ended: false,
                remote_ended: false,
            },
        );
        let _ = self.protocol.send(Message::Connected {
            alias: remote_alias,
            remote_alias: alias,
            handshake_hash: None,
            handshake_id: None,
        });
        debug!(alias, remote_alias, server_alias, remote = %remote_public_key, "inbound stream");
    }

    fn on_noise(&mut self, request: NoiseRequest) {
        let sockets = &self.sockets;
        let servers = &self.servers;
        let reply = self.sessions.handle(request.clone(), || {
            if request.is_initiator {
                let socket = sockets.get(&request.alias)?;
                if socket.remote_alias.is_some() {
                    return None;
                }
                let key_pair = socket.key_pair.as_ref()?;
                Some(NoiseHandshake::initiator(key_pair, &socket.remote_public_key))
            } else {
                let server = servers.get(&request.alias)?;
                if server.custodial {
                    return None;
                }
                Some(NoiseHandshake::responder(&server.key_pair))
            }
        });
        let _ = self.protocol.send(reply);
    }

    fn on_incoming(
        &mut self,
        id: u32,
        server_alias: u32,
        remote_public_key: PublicKey,
        payload: Vec<u8>,
        handshake_id: u32,
    ) {
        let Some(server) = self.servers.get(&server_alias) else {
            self.sessions.deny(handshake_id);
            let _ = self.protocol.send(Message::Deny { id });
            return;
        };
        let Some(firewall) = server.firewall.clone() else {
            let _ = self.protocol.send(Message::Accept { id });
            return;
        };
        let internal = self.internal_tx.clone();
        tokio::spawn(async move {
            let deny = evaluate(firewall, remote_public_key, payload).await;
            let _ = internal.send(Internal::FirewallDecision { id, handshake_id, deny });
        });
    }

    fn on_internal(&mut self, internal: Internal) {
        match internal {
            Internal::FirewallDecision { id, handshake_id, deny } => {
                if deny {
                    self.sessions.deny(handshake_id);
                    debug!(id, handshake_id, "firewall denied");
                    let _ = self.protocol.send(Message::Deny { id });
                } else {
                    let _ = self.protocol.send(Message::Accept { id });
                }
            }
        }
    }

    fn on_sign(&mut self, request: &SignatureRequest) {
        let outcome = match self.queries.get(&request.signee) {
            Some(ClientQuery {
                key_pair: Some(key_pair),
                target,
                ..
            }) => request.sign(key_pair, target).map_err(RelayError::from),
            _ => Err(RelayError::SignatureUnavailable),
        };
        if let Err(e) = &outcome {
            debug!(id = request.id, signee = request.signee, error = %e, "cannot sign");
        }
        let _ = self.protocol.send(request.reply(outcome));
    }

    fn teardown(mut self, reason: Option<RelayError>) {
        let reason = reason.unwrap_or(RelayError::Closed);
        info!(
            sockets = self.sockets.len(),
            servers = self.servers.len(),
            queries = self.queries.len(),
            %reason,
            "relay client closed"
        );
        for (_, socket) in self.sockets.drain() {
            socket.close(Some(reason.clone()));
        }
        for (_, mut server) in self.servers.drain() {
            if let Some(reply) = server.listening.take() {
                let _ = reply.send(Err(reason.clone()));
            }
        }
        for (_, query) in self.queries.drain() {
            let _ = query.events.send(QueryEvent::Finished(Some(reason.clone())));
        }
        self.sessions.clear();
        self.protocol.close();
    }
}
