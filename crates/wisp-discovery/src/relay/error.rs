//! Relay error kinds and their wire texts.
//!
//! Only a message string crosses the wire. The canonical texts below are
//! recognised again on decode so both sides agree on the kind; anything else
//! becomes [`RelayError::Remote`].

use crate::dht::DhtError;
use std::io;
use std::sync::Arc;
use thiserror::Error;
use wisp_core::CodecError;
use wisp_crypto::CryptoError;

/// Remote key has no server
pub const PEER_NOT_FOUND: &str = "PEER_NOT_FOUND: Peer not found";
/// Connect attempt failed, including firewall denial
pub const PEER_CONNECTION_FAILED: &str = "PEER_CONNECTION_FAILED: Could not connect to peer";
/// Stream idle past its timeout
pub const STREAM_TIMED_OUT: &str = "Stream timed out";
/// Second server on the same key
pub const ALREADY_LISTENING: &str = "ALREADY_LISTENING: Already listening on this key";
/// Signing authority could not sign
pub const SIGNATURE_UNAVAILABLE: &str = "SIGNATURE_UNAVAILABLE: Could not obtain signature";
/// Relay connection closed
pub const CLOSED: &str = "CLOSED: Relay connection closed";

/// Relay errors
#[derive(Debug, Error, Clone)]
pub enum RelayError {
    /// Malformed frame from the other side
    #[error("protocol violation: {0}")]
    ProtocolViolation(#[from] CodecError),

    /// Remote key has no server
    #[error("{}", PEER_NOT_FOUND)]
    PeerNotFound,

    /// Connect attempt failed
    #[error("{}", PEER_CONNECTION_FAILED)]
    ConnectionFailed,

    /// Connection refused by the remote's firewall
    #[error("connection denied by firewall")]
    FirewallDenied,

    /// Heartbeat failsafe or idle timeout expired
    #[error("{}", STREAM_TIMED_OUT)]
    Timeout,

    /// No signature for an announce/unannounce
    #[error("{}", SIGNATURE_UNAVAILABLE)]
    SignatureUnavailable,

    /// A server already listens on the key
    #[error("{}", ALREADY_LISTENING)]
    AlreadyListening,

    /// Relay connection closed
    #[error("{}", CLOSED)]
    Closed,

    /// Failure reported by the other side
    #[error("{0}")]
    Remote(String),

    /// DHT failure
    #[error("dht error: {0}")]
    Dht(DhtError),

    /// Cryptographic failure
    #[error("crypto error: {0}")]
    Crypto(#[from] CryptoError),

    /// Transport failure
    #[error("i/o error: {0}")]
    Io(Arc<io::Error>),
}

impl RelayError {
    /// Text sent in `error` fields
    #[must_use]
    pub fn to_wire(&self) -> String {
        match self {
            // Denial is not revealed to the initiator.
            RelayError::ConnectionFailed | RelayError::FirewallDenied => {
                PEER_CONNECTION_FAILED.to_string()
            }
            RelayError::Dht(DhtError::FirewallDenied | DhtError::ConnectionFailed(_)) => {
                PEER_CONNECTION_FAILED.to_string()
            }
            RelayError::Dht(DhtError::PeerNotFound) => PEER_NOT_FOUND.to_string(),
            RelayError::Dht(DhtError::AlreadyListening) => ALREADY_LISTENING.to_string(),
            RelayError::Dht(DhtError::Timeout) => STREAM_TIMED_OUT.to_string(),
            RelayError::Dht(DhtError::SignatureUnavailable(_)) => SIGNATURE_UNAVAILABLE.to_string(),
            RelayError::Dht(DhtError::Closed) => CLOSED.to_string(),
            other => other.to_string(),
        }
    }

    /// Rebuild an error from a received `error` field
    #[must_use]
    pub fn from_wire(message: &str) -> Self {
        match message {
            PEER_NOT_FOUND => RelayError::PeerNotFound,
            PEER_CONNECTION_FAILED => RelayError::ConnectionFailed,
            STREAM_TIMED_OUT => RelayError::Timeout,
            ALREADY_LISTENING => RelayError::AlreadyListening,
            SIGNATURE_UNAVAILABLE => RelayError::SignatureUnavailable,
            CLOSED => RelayError::Closed,
            other => RelayError::Remote(other.to_string()),
        }
    }

    /// Whether the connection must be torn down
    #[must_use]
    pub fn is_protocol_violation(&self) -> bool {
        matches!(self, RelayError::ProtocolViolation(_))
    }
}

impl From<io::Error> for RelayError {
    fn from(err: io::Error) -> Self {
        RelayError::Io(Arc::new(err))
    }
}

impl From<DhtError> for RelayError {
    fn from(err: DhtError) -> Self {
        match err {
            DhtError::PeerNotFound => RelayError::PeerNotFound,
            DhtError::AlreadyListening => RelayError::AlreadyListening,
            DhtError::Timeout => RelayError::Timeout,
            DhtError::Closed => RelayError::Closed,
            DhtError::SignatureUnavailable(_) => RelayError::SignatureUnavailable,
            DhtError::FirewallDenied | DhtError::ConnectionFailed(_) => RelayError::ConnectionFailed,
            other => RelayError::Dht(other),
        }
    }
}

impl From<wisp_core::Error> for RelayError {
    fn from(err: wisp_core::Error) -> Self {
        match err {
            wisp_core::Error::Codec(e) => RelayError::ProtocolViolation(e),
            wisp_core::Error::Io(e) => RelayError::Io(Arc::new(e)),
            wisp_core::Error::Crypto(e) => RelayError::Crypto(e),
        }
    }
}

impl From<RelayError> for io::Error {
    fn from(err: RelayError) -> Self {
        let kind = match &err {
            RelayError::Timeout => io::ErrorKind::TimedOut,
            RelayError::Closed => io::ErrorKind::BrokenPipe,
            RelayError::PeerNotFound | RelayError::ConnectionFailed | RelayError::FirewallDenied => {
                io::ErrorKind::ConnectionRefused
            }
            RelayError::Io(e) => e.kind(),
            _ => io::ErrorKind::Other,
        };
        io::Error::new(kind, err)
    }
}
