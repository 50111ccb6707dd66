//! Opcode catalog and message payloads.
//!
//! Aliases name sockets and servers; ids name requests (handshake steps,
//! firewall decisions, signatures, queries). Unless noted otherwise a frame
//! carries the alias its *recipient* allocated.

use crate::codec::{Decoder, Encoder};
use crate::error::CodecError;
use std::net::SocketAddr;
use wisp_crypto::{HandshakeHash, PublicKey, SecretKey, Signature};

/// Wire opcodes, version [`crate::PROTOCOL_VERSION`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Opcode {
    /// Liveness check
    Ping = 1,
    /// Liveness answer
    Pong = 2,
    /// Open a stream to a remote public key
    Connect = 3,
    /// Stream paired with the sender's alias
    Connected = 4,
    /// Abnormal stream teardown
    Destroy = 5,
    /// Half-close
    End = 6,
    /// Stream data
    Data = 7,
    /// Start a server
    Listen = 8,
    /// Server started
    Listening = 9,
    /// Inbound stream on a server
    Connection = 10,
    /// Stop a server
    Close = 11,
    /// Server stopped
    Closed = 12,
    /// Find peers for a target
    Lookup = 13,
    /// Store a peer record under a target
    Announce = 14,
    /// Remove a peer record from a target
    Unannounce = 15,
    /// One query reply
    Result = 16,
    /// Query done
    Finished = 17,
    /// Produce the next handshake message
    NoiseSend = 18,
    /// Consume a handshake message
    NoiseReceive = 19,
    /// Outcome of a handshake step
    NoiseReply = 20,
    /// Firewall decision request
    Incoming = 21,
    /// Reject an incoming connection
    Deny = 22,
    /// Admit an incoming connection
    Accept = 23,
    /// Request an announce signature
    SignAnnounce = 24,
    /// Request an unannounce signature
    SignUnannounce = 25,
    /// Signature answer
    Signature = 26,
}

impl TryFrom<u8> for Opcode {
    type Error = CodecError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        Ok(match value {
            1 => Self::Ping,
            2 => Self::Pong,
            3 => Self::Connect,
            4 => Self::Connected,
            5 => Self::Destroy,
            6 => Self::End,
            7 => Self::Data,
            8 => Self::Listen,
            9 => Self::Listening,
            10 => Self::Connection,
            11 => Self::Close,
            12 => Self::Closed,
            13 => Self::Lookup,
            14 => Self::Announce,
            15 => Self::Unannounce,
            16 => Self::Result,
            17 => Self::Finished,
            18 => Self::NoiseSend,
            19 => Self::NoiseReceive,
            20 => Self::NoiseReply,
            21 => Self::Incoming,
            22 => Self::Deny,
            23 => Self::Accept,
            24 => Self::SignAnnounce,
            25 => Self::SignUnannounce,
            26 => Self::Signature,
            _ => return Err(CodecError::UnknownOpcode(value)),
        })
    }
}

/// A peer record as stored in the DHT
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Peer {
    /// Peer identity
    pub public_key: PublicKey,
    /// Relays the peer can be reached through
    pub relay_addresses: Vec<SocketAddr>,
}

impl Peer {
    /// Peer without relay addresses
    #[must_use]
    pub fn new(public_key: PublicKey) -> Self {
        Self {
            public_key,
            relay_addresses: Vec::new(),
        }
    }

    /// Canonical encoding, also the record bytes covered by signatures
    #[must_use]
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut enc = Encoder::with_capacity(36 + self.relay_addresses.len() * 19);
        self.encode(&mut enc);
        enc.finish()
    }

    fn encode(&self, enc: &mut Encoder) {
        enc.fixed(self.public_key.as_bytes());
        encode_addresses(enc, &self.relay_addresses);
    }

    fn decode(dec: &mut Decoder<'_>) -> Result<Self, CodecError> {
        Ok(Self {
            public_key: PublicKey::from_bytes(dec.fixed()?),
            relay_addresses: decode_addresses(dec)?,
        })
    }
}

/// One reply of a lookup/announce/unannounce query
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct QueryReply {
    /// Node that answered, when known
    pub from: Option<SocketAddr>,
    /// Peers stored under the target
    pub peers: Vec<Peer>,
}

const REPLY_FROM: u8 = 1 << 0;

impl QueryReply {
    fn encode(&self, enc: &mut Encoder) {
        enc.u8(flag(self.from.is_some(), REPLY_FROM));
        if let Some(from) = &self.from {
            enc.socket_addr(from);
        }
        // Peer counts come from a Vec, so they always fit.
        let _ = enc.array(&self.peers, |enc, peer| {
            peer.encode(enc);
            Ok(())
        });
    }

    fn decode(dec: &mut Decoder<'_>) -> Result<Self, CodecError> {
        let flags = dec.flags(REPLY_FROM)?;
        let from = if flags & REPLY_FROM != 0 {
            Some(dec.socket_addr()?)
        } else {
            None
        };
        Ok(Self {
            from,
            peers: dec.array(Peer::decode)?,
        })
    }
}

/// Every message of the relay protocol
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    /// Liveness check
    Ping,
    /// Liveness answer
    Pong,
    /// Open a stream. `alias` is the endpoint's socket alias.
    Connect {
        /// Endpoint socket alias
        alias: u32,
        /// Local identity
        public_key: PublicKey,
        /// Present in custodial mode only
        secret_key: Option<SecretKey>,
        /// Peer to connect to
        remote_public_key: PublicKey,
        /// Bound on the connect attempt
        timeout_ms: Option<u32>,
    },
    /// Pair the recipient's `alias` with the sender's `remote_alias`
    Connected {
        /// Recipient alias
        alias: u32,
        /// Sender alias
        remote_alias: u32,
        /// Transcript hash of the stream's handshake
        handshake_hash: Option<HandshakeHash>,
        /// Handshake session that produced the stream
        handshake_id: Option<u32>,
    },
    /// Tear a stream down.
    ///
    /// When `paired` is false the stream was never paired and `alias` is
    /// the endpoint socket alias from `Connect`.
    Destroy {
        /// Stream alias
        alias: u32,
        /// Whether the recipient knows this stream
        paired: bool,
        /// Failure text
        error: Option<String>,
    },
    /// No more data from the sender
    End {
        /// Recipient alias
        alias: u32,
    },
    /// Stream data; zero-length chunks are keep-alives
    Data {
        /// Recipient alias
        alias: u32,
        /// Chunks in write order
        chunks: Vec<Vec<u8>>,
    },
    /// Start a server. `alias` is the endpoint's server alias.
    Listen {
        /// Endpoint server alias
        alias: u32,
        /// Server identity
        public_key: PublicKey,
        /// Present in custodial mode only
        secret_key: Option<SecretKey>,
        /// Whether incoming connections need a firewall decision
        firewall: bool,
    },
    /// Server started
    Listening {
        /// Endpoint server alias
        alias: u32,
        /// Relay server alias
        remote_alias: u32,
        /// Address the relay's node is reachable at
        address: SocketAddr,
    },
    /// Inbound stream on one of the endpoint's servers
    Connection {
        /// Relay alias of the new stream
        alias: u32,
        /// Endpoint server alias
        server_alias: u32,
        /// Connecting peer
        remote_public_key: PublicKey,
        /// Transcript hash of the stream's handshake
        handshake_hash: HandshakeHash,
        /// Handshake session that produced the stream
        handshake_id: Option<u32>,
    },
    /// Stop a server
    Close {
        /// Endpoint server alias
        alias: u32,
    },
    /// Server stopped or failed to start
    Closed {
        /// Endpoint server alias
        alias: u32,
        /// Failure text
        error: Option<String>,
    },
    /// Find peers announced under `target`
    Lookup {
        /// Query id
        id: u32,
        /// Target hash
        target: [u8; 32],
    },
    /// Announce `public_key` under `target`
    Announce {
        /// Query id
        id: u32,
        /// Target hash
        target: [u8; 32],
        /// Announcing identity
        public_key: PublicKey,
        /// Present in custodial mode only
        secret_key: Option<SecretKey>,
    },
    /// Remove the announcement of `public_key` under `target`
    Unannounce {
        /// Query id
        id: u32,
        /// Target hash
        target: [u8; 32],
        /// Announcing identity
        public_key: PublicKey,
        /// Present in custodial mode only
        secret_key: Option<SecretKey>,
    },
    /// One query reply
    Result {
        /// Query id
        id: u32,
        /// Reply
        reply: QueryReply,
    },
    /// Query done; no `Result` follows
    Finished {
        /// Query id
        id: u32,
        /// Failure text
        error: Option<String>,
    },
    /// Ask the key holder to write the next handshake message
    NoiseSend {
        /// Role of the key holder
        is_initiator: bool,
        /// Handshake id
        id: u32,
        /// Socket alias (initiator) or server alias (responder) of the key holder
        alias: u32,
        /// Application payload to embed
        data: Vec<u8>,
    },
    /// Ask the key holder to read a handshake message
    NoiseReceive {
        /// Role of the key holder
        is_initiator: bool,
        /// Handshake id
        id: u32,
        /// Socket alias (initiator) or server alias (responder) of the key holder
        alias: u32,
        /// Handshake message
        data: Vec<u8>,
    },
    /// Outcome of a handshake step
    NoiseReply {
        /// Handshake id
        id: u32,
        /// Handshake message (after send) or payload (after receive)
        data: Vec<u8>,
        /// Whether the handshake finished with this step
        complete: bool,
        /// Set with `complete`
        handshake_hash: Option<HandshakeHash>,
        /// Set with `complete`
        remote_id: Option<[u8; 32]>,
        /// Set with `complete`
        holepunch_secret: Option<[u8; 32]>,
        /// Authenticated peer identity, once known
        remote_public_key: Option<PublicKey>,
        /// Failure text; the session is gone
        error: Option<String>,
    },
    /// Ask for a firewall decision
    Incoming {
        /// Request id
        id: u32,
        /// Endpoint server alias
        server_alias: u32,
        /// Connecting peer
        remote_public_key: PublicKey,
        /// Payload of the peer's first handshake message
        payload: Vec<u8>,
        /// Handshake session awaiting the decision
        handshake_id: u32,
    },
    /// Reject the connection
    Deny {
        /// Request id
        id: u32,
    },
    /// Admit the connection
    Accept {
        /// Request id
        id: u32,
    },
    /// Ask for an announce signature
    SignAnnounce {
        /// Request id
        id: u32,
        /// Query the signature is for
        signee: u32,
        /// Storage node token
        token: [u8; 32],
        /// Storage node id
        peer_id: [u8; 32],
        /// Relay addresses of the record
        relay_addresses: Vec<SocketAddr>,
    },
    /// Ask for an unannounce signature
    SignUnannounce {
        /// Request id
        id: u32,
        /// Query the signature is for
        signee: u32,
        /// Storage node token
        token: [u8; 32],
        /// Storage node id
        peer_id: [u8; 32],
        /// Relay addresses of the record
        relay_addresses: Vec<SocketAddr>,
    },
    /// Signature answer
    Signature {
        /// Request id
        id: u32,
        /// Signature, absent on failure
        signature: Option<Signature>,
        /// Failure text
        error: Option<String>,
    },
}

const CONNECT_SECRET: u8 = 1 << 0;
const CONNECT_TIMEOUT: u8 = 1 << 1;
const CONNECTED_HASH: u8 = 1 << 0;
const CONNECTED_ID: u8 = 1 << 1;
const DESTROY_PAIRED: u8 = 1 << 0;
const DESTROY_ERROR: u8 = 1 << 1;
const LISTEN_SECRET: u8 = 1 << 0;
const LISTEN_FIREWALL: u8 = 1 << 1;
const CONNECTION_ID: u8 = 1 << 0;
const HAS_ERROR: u8 = 1 << 0;
const HAS_SECRET: u8 = 1 << 0;
const NOISE_INITIATOR: u8 = 1 << 0;
const REPLY_COMPLETE: u8 = 1 << 0;
const REPLY_HASH: u8 = 1 << 1;
const REPLY_REMOTE_ID: u8 = 1 << 2;
const REPLY_HOLEPUNCH: u8 = 1 << 3;
const REPLY_PUBLIC_KEY: u8 = 1 << 4;
const REPLY_ERROR: u8 = 1 << 5;
const SIGNATURE_VALUE: u8 = 1 << 0;
const SIGNATURE_ERROR: u8 = 1 << 1;

fn flag(set: bool, bit: u8) -> u8 {
    if set { bit } else { 0 }
}

fn encode_addresses(enc: &mut Encoder, addresses: &[SocketAddr]) {
    let _ = enc.array(addresses, |enc, addr| {
        enc.socket_addr(addr);
        Ok(())
    });
}

fn decode_addresses(dec: &mut Decoder<'_>) -> Result<Vec<SocketAddr>, CodecError> {
    dec.array(Decoder::socket_addr)
}

fn optional<'a, T>(
    flags: u8,
    bit: u8,
    dec: &mut Decoder<'a>,
    f: impl FnOnce(&mut Decoder<'a>) -> Result<T, CodecError>,
) -> Result<Option<T>, CodecError> {
    if flags & bit != 0 { f(dec).map(Some) } else { Ok(None) }
}

fn secret_key(dec: &mut Decoder<'_>) -> Result<SecretKey, CodecError> {
    Ok(SecretKey::from_bytes(dec.fixed()?))
}

fn public_key(dec: &mut Decoder<'_>) -> Result<PublicKey, CodecError> {
    Ok(PublicKey::from_bytes(dec.fixed()?))
}

impl Message {
    /// Opcode of this message
    #[must_use]
    pub fn opcode(&self) -> Opcode {
        match self {
            Message::Ping => Opcode::Ping,
            Message::Pong => Opcode::Pong,
            Message::Connect { .. } => Opcode::Connect,
            Message::Connected { .. } => Opcode::Connected,
            Message::Destroy { .. } => Opcode::Destroy,
            Message::End { .. } => Opcode::End,
            Message::Data { .. } => Opcode::Data,
            Message::Listen { .. } => Opcode::Listen,
            Message::Listening { .. } => Opcode::Listening,
            Message::Connection { .. } => Opcode::Connection,
            Message::Close { .. } => Opcode::Close,
            Message::Closed { .. } => Opcode::Closed,
            Message::Lookup { .. } => Opcode::Lookup,
            Message::Announce { .. } => Opcode::Announce,
            Message::Unannounce { .. } => Opcode::Unannounce,
            Message::Result { .. } => Opcode::Result,
            Message::Finished { .. } => Opcode::Finished,
            Message::NoiseSend { .. } => Opcode::NoiseSend,
            Message::NoiseReceive { .. } => Opcode::NoiseReceive,
            Message::NoiseReply { .. } => Opcode::NoiseReply,
            Message::Incoming { .. } => Opcode::Incoming,
            Message::Deny { .. } => Opcode::Deny,
            Message::Accept { .. } => Opcode::Accept,
            Message::SignAnnounce { .. } => Opcode::SignAnnounce,
            Message::SignUnannounce { .. } => Opcode::SignUnannounce,
            Message::Signature { .. } => Opcode::Signature,
        }
    }

    /// Encode the payload (without opcode)
    ///
    /// # Errors
    ///
    /// Returns [`CodecError::LengthOverflow`] if a buffer exceeds `u32::MAX`.
    pub fn encode_payload(&self, enc: &mut Encoder) -> Result<(), CodecError> {
        match self {
            Message::Ping | Message::Pong => {}
            Message::Connect {
                alias,
                public_key,
                secret_key,
                remote_public_key,
                timeout_ms,
            } => {
                enc.u8(flag(secret_key.is_some(), CONNECT_SECRET)
                    | flag(timeout_ms.is_some(), CONNECT_TIMEOUT));
                enc.u32(*alias).fixed(public_key.as_bytes());
                if let Some(secret) = secret_key {
                    enc.fixed(secret.as_bytes());
                }
                enc.fixed(remote_public_key.as_bytes());
                if let Some(timeout) = timeout_ms {
                    enc.u32(*timeout);
                }
            }
            Message::Connected {
                alias,
                remote_alias,
                handshake_hash,
                handshake_id,
            } => {
                enc.u8(flag(handshake_hash.is_some(), CONNECTED_HASH)
                    | flag(handshake_id.is_some(), CONNECTED_ID));
                enc.u32(*alias).u32(*remote_alias);
                if let Some(hash) = handshake_hash {
                    enc.fixed(hash);
                }
                if let Some(id) = handshake_id {
                    enc.u32(*id);
                }
            }
            Message::Destroy {
                alias,
                paired,
                error,
            } => {
                enc.u8(flag(*paired, DESTROY_PAIRED) | flag(error.is_some(), DESTROY_ERROR));
                enc.u32(*alias);
                if let Some(error) = error {
                    enc.string(error)?;
                }
            }
            Message::End { alias } | Message::Close { alias } => {
                enc.u32(*alias);
            }
            Message::Data { alias, chunks } => {
                enc.u32(*alias);
                enc.array(chunks, |enc, chunk| enc.buffer(chunk).map(|_| ()))?;
            }
            Message::Listen {
                alias,
                public_key,
                secret_key,
                firewall,
            } => {
                enc.u8(flag(secret_key.is_some(), LISTEN_SECRET) | flag(*firewall, LISTEN_FIREWALL));
                enc.u32(*alias).fixed(public_key.as_bytes());
                if let Some(secret) = secret_key {
                    enc.fixed(secret.as_bytes());
                }
            }
            Message::Listening {
                alias,
                remote_alias,
                address,
            } => {
                enc.u32(*alias).u32(*remote_alias).socket_addr(address);
            }
            Message::Connection {
                alias,
                server_alias,
                remote_public_key,
                handshake_hash,
                handshake_id,
            } => {
                enc.u8(flag(handshake_id.is_some(), CONNECTION_ID));
                enc.u32(*alias)
                    .u32(*server_alias)
                    .fixed(remote_public_key.as_bytes())
                    .fixed(handshake_hash);
                if let Some(id) = handshake_id {
                    enc.u32(*id);
                }
            }
            Message::Closed { alias: id, error } | Message::Finished { id, error } => {
                enc.u8(flag(error.is_some(), HAS_ERROR));
                enc.u32(*id);
                if let Some(error) = error {
                    enc.string(error)?;
                }
            }
            Message::Lookup { id, target } => {
                enc.u32(*id).fixed(target);
            }
            Message::Announce {
                id,
                target,
                public_key,
                secret_key,
            }
            | Message::Unannounce {
                id,
                target,
                public_key,
                secret_key,
            } => {
                enc.u8(flag(secret_key.is_some(), HAS_SECRET));
                enc.u32(*id).fixed(target).fixed(public_key.as_bytes());
                if let Some(secret) = secret_key {
                    enc.fixed(secret.as_bytes());
                }
            }
            Message::Result { id, reply } => {
                enc.u32(*id);
                reply.encode(enc);
            }
            Message::NoiseSend {
                is_initiator,
                id,
                alias,
                data,
            }
            | Message::NoiseReceive {
                is_initiator,
                id,
                alias,
                data,
            } => {
                enc.u8(flag(*is_initiator, NOISE_INITIATOR));
                enc.u32(*id).u32(*alias).buffer(data)?;
            }
            Message::NoiseReply {
                id,
                data,
                complete,
                handshake_hash,
                remote_id,
                holepunch_secret,
                remote_public_key,
                error,
            } => {
                enc.u8(flag(*complete, REPLY_COMPLETE)
                    | flag(handshake_hash.is_some(), REPLY_HASH)
                    | flag(remote_id.is_some(), REPLY_REMOTE_ID)
                    | flag(holepunch_secret.is_some(), REPLY_HOLEPUNCH)
                    | flag(remote_public_key.is_some(), REPLY_PUBLIC_KEY)
                    | flag(error.is_some(), REPLY_ERROR));
                enc.u32(*id).buffer(data)?;
                if let Some(hash) = handshake_hash {
                    enc.fixed(hash);
                }
                if let Some(remote_id) = remote_id {
                    enc.fixed(remote_id);
                }
                if let Some(secret) = holepunch_secret {
                    enc.fixed(secret);
                }
                if let Some(key) = remote_public_key {
                    enc.fixed(key.as_bytes());
                }
                if let Some(error) = error {
                    enc.string(error)?;
                }
            }
            Message::Incoming {
                id,
                server_alias,
                remote_public_key,
                payload,
                handshake_id,
            } => {
                enc.u32(*id)
                    .u32(*server_alias)
                    .fixed(remote_public_key.as_bytes())
                    .buffer(payload)?
                    .u32(*handshake_id);
            }
            Message::Deny { id } | Message::Accept { id } => {
                enc.u32(*id);
            }
            Message::SignAnnounce {
                id,
                signee,
                token,
                peer_id,
                relay_addresses,
            }
            | Message::SignUnannounce {
                id,
                signee,
                token,
                peer_id,
                relay_addresses,
            } => {
                enc.u32(*id).u32(*signee).fixed(token).fixed(peer_id);
                encode_addresses(enc, relay_addresses);
            }
            Message::Signature {
                id,
                signature,
                error,
            } => {
                enc.u8(flag(signature.is_some(), SIGNATURE_VALUE)
                    | flag(error.is_some(), SIGNATURE_ERROR));
                enc.u32(*id);
                if let Some(signature) = signature {
                    enc.fixed(signature.as_bytes());
                }
                if let Some(error) = error {
                    enc.string(error)?;
                }
            }
        }
        Ok(())
    }

    /// Decode a payload for `opcode`, requiring every byte to be consumed
    ///
    /// # Errors
    ///
    /// Returns a [`CodecError`] for any malformed payload.
    pub fn decode_payload(opcode: Opcode, payload: &[u8]) -> Result<Self, CodecError> {
        let mut dec = Decoder::new(payload);
        let message = Self::decode_fields(opcode, &mut dec)?;
        dec.finish()?;
        Ok(message)
    }

    fn decode_fields(opcode: Opcode, dec: &mut Decoder<'_>) -> Result<Self, CodecError> {
        Ok(match opcode {
            Opcode::Ping => Message::Ping,
            Opcode::Pong => Message::Pong,
            Opcode::Connect => {
                let flags = dec.flags(CONNECT_SECRET | CONNECT_TIMEOUT)?;
                Message::Connect {
                    alias: dec.u32()?,
                    public_key: public_key(dec)?,
                    secret_key: optional(flags, CONNECT_SECRET, dec, secret_key)?,
                    remote_public_key: public_key(dec)?,
                    timeout_ms: optional(flags, CONNECT_TIMEOUT, dec, Decoder::u32)?,
                }
            }
            Opcode::Connected => {
                let flags = dec.flags(CONNECTED_HASH | CONNECTED_ID)?;
                Message::Connected {
                    alias: dec.u32()?,
                    remote_alias: dec.u32()?,
                    handshake_hash: optional(flags, CONNECTED_HASH, dec, Decoder::fixed)?,
                    handshake_id: optional(flags, CONNECTED_ID, dec, Decoder::u32)?,
                }
            }
            Opcode::Destroy => {
                let flags = dec.flags(DESTROY_PAIRED | DESTROY_ERROR)?;
                Message::Destroy {
                    alias: dec.u32()?,
                    paired: flags & DESTROY_PAIRED != 0,
                    error: optional(flags, DESTROY_ERROR, dec, Decoder::string)?,
                }
            }
            Opcode::End => Message::End { alias: dec.u32()? },
            Opcode::Data => Message::Data {
                alias: dec.u32()?,
                chunks: dec.array(Decoder::buffer)?,
            },
            Opcode::Listen => {
                let flags = dec.flags(LISTEN_SECRET | LISTEN_FIREWALL)?;
                Message::Listen {
                    alias: dec.u32()?,
                    public_key: public_key(dec)?,
                    secret_key: optional(flags, LISTEN_SECRET, dec, secret_key)?,
                    firewall: flags & LISTEN_FIREWALL != 0,
                }
            }
            Opcode::Listening => Message::Listening {
                alias: dec.u32()?,
                remote_alias: dec.u32()?,
                address: dec.socket_addr()?,
            },
            Opcode::Connection => {
                let flags = dec.flags(CONNECTION_ID)?;
                Message::Connection {
                    alias: dec.u32()?,
                    server_alias: dec.u32()?,
                    remote_public_key: public_key(dec)?,
                    handshake_hash: dec.fixed()?,
                    handshake_id: optional(flags, CONNECTION_ID, dec, Decoder::u32)?,
                }
            }
            Opcode::Close => Message::Close { alias: dec.u32()? },
            Opcode::Closed => {
                let flags = dec.flags(HAS_ERROR)?;
                Message::Closed {
                    alias: dec.u32()?,
                    error: optional(flags, HAS_ERROR, dec, Decoder::string)?,
                }
            }
            Opcode::Lookup => Message::Lookup {
                id: dec.u32()?,
                target: dec.fixed()?,
            },
            Opcode::Announce | Opcode::Unannounce => {
                let flags = dec.flags(HAS_SECRET)?;
                let id = dec.u32()?;
                let target = dec.fixed()?;
                let public_key = public_key(dec)?;
                let secret_key = optional(flags, HAS_SECRET, dec, secret_key)?;
                if opcode == Opcode::Announce {
                    Message::Announce {
                        id,
                        target,
                        public_key,
                        secret_key,
                    }
                } else {
                    Message::Unannounce {
                        id,
                        target,
                        public_key,
                        secret_key,
                    }
                }
            }
            Opcode::Result => Message::Result {
                id: dec.u32()?,
                reply: QueryReply::decode(dec)?,
            },
            Opcode::Finished => {
                let flags = dec.flags(HAS_ERROR)?;
                Message::Finished {
                    id: dec.u32()?,
                    error: optional(flags, HAS_ERROR, dec, Decoder::string)?,
                }
            }
            Opcode::NoiseSend | Opcode::NoiseReceive => {
                let flags = dec.flags(NOISE_INITIATOR)?;
                let is_initiator = flags & NOISE_INITIATOR != 0;
                let id = dec.u32()?;
                let alias = dec.u32()?;
                let data = dec.buffer()?;
                if opcode == Opcode::NoiseSend {
                    Message::NoiseSend {
                        is_initiator,
                        id,
                        alias,
                        data,
                    }
                } else {
                    Message::NoiseReceive {
                        is_initiator,
                        id,
                        alias,
                        data,
                    }
                }
            }
            Opcode::NoiseReply => {
                let flags = dec.flags(
                    REPLY_COMPLETE
                        | REPLY_HASH
                        | REPLY_REMOTE_ID
                        | REPLY_HOLEPUNCH
                        | REPLY_PUBLIC_KEY
                        | REPLY_ERROR,
                )?;
                Message::NoiseReply {
                    id: dec.u32()?,
                    data: dec.buffer()?,
                    complete: flags & REPLY_COMPLETE != 0,
                    handshake_hash: optional(flags, REPLY_HASH, dec, Decoder::fixed)?,
                    remote_id: optional(flags, REPLY_REMOTE_ID, dec, Decoder::fixed)?,
                    holepunch_secret: optional(flags, REPLY_HOLEPUNCH, dec, Decoder::fixed)?,
                    remote_public_key: optional(flags, REPLY_PUBLIC_KEY, dec, public_key)?,
                    error: optional(flags, REPLY_ERROR, dec, Decoder::string)?,
                }
            }
            Opcode::Incoming => Message::Incoming {
                id: dec.u32()?,
                server_alias: dec.u32()?,
                remote_public_key: public_key(dec)?,
                payload: dec.buffer()?,
                handshake_id: dec.u32()?,
            },
            Opcode::Deny => Message::Deny { id: dec.u32()? },
            Opcode::Accept => Message::Accept { id: dec.u32()? },
            Opcode::SignAnnounce | Opcode::SignUnannounce => {
                let id = dec.u32()?;
                let signee = dec.u32()?;
                let token = dec.fixed()?;
                let peer_id = dec.fixed()?;
                let relay_addresses = decode_addresses(dec)?;
                if opcode == Opcode::SignAnnounce {
                    Message::SignAnnounce {
                        id,
                        signee,
                        token,
                        peer_id,
                        relay_addresses,
                    }
                } else {
                    Message::SignUnannounce {
                        id,
                        signee,
                        token,
                        peer_id,
                        relay_addresses,
                    }
                }
            }
            Opcode::Signature => {
                let flags = dec.flags(SIGNATURE_VALUE | SIGNATURE_ERROR)?;
                Message::Signature {
                    id: dec.u32()?,
                    signature: optional(flags, SIGNATURE_VALUE, dec, |dec| {
                        Ok(Signature::from_bytes(dec.fixed()?))
                    })?,
                    error: optional(flags, SIGNATURE_ERROR, dec, Decoder::string)?,
                }
            }
        })
    }
}
