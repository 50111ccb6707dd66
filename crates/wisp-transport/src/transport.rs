//! Transport abstraction.
//!
//! The relay only needs an ordered, reliable duplex byte stream. Anything that
//! implements tokio's `AsyncRead + AsyncWrite` qualifies; listeners hand out
//! such streams through the [`Acceptor`] trait so the relay loop does not care
//! whether TLS is in the way.

use async_trait::async_trait;
use std::io;
use std::net::SocketAddr;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;

/// Transport layer errors
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    /// I/O error from underlying transport
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Address binding failed
    #[error("Failed to bind to address: {0}")]
    BindFailed(String),

    /// Connection failed
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    /// Invalid configuration
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// TLS setup or handshake failure
    #[error("TLS error: {0}")]
    Tls(String),
}

/// Result type for transport operations
pub type TransportResult<T> = Result<T, TransportError>;

/// An ordered, reliable byte stream in both directions
pub trait Duplex: AsyncRead + AsyncWrite + Send + Unpin + 'static {}

impl<T> Duplex for T where T: AsyncRead + AsyncWrite + Send + Unpin + 'static {}

/// Type-erased duplex stream
pub type BoxedDuplex = Box<dyn Duplex>;

/// Source of inbound duplex streams.
///
/// Accepting is split in two so a listener loop never waits on a slow
/// handshake: `accept` returns the raw connection, `upgrade` finishes any
/// per-connection setup and may run in its own task.
#[async_trait]
pub trait Acceptor: Send + Sync {
    /// Wait for the next raw connection
    ///
    /// # Errors
    /// Returns `TransportError` if the listener fails
    async fn accept(&self) -> TransportResult<(TcpStream, SocketAddr)>;

    /// Turn a raw connection into the stream the relay speaks over
    ///
    /// # Errors
    /// Returns `TransportError` if the per-connection handshake fails
    async fn upgrade(&self, stream: TcpStream) -> TransportResult<BoxedDuplex>;

    /// Local listening address
    ///
    /// # Errors
    /// Returns `TransportError` if the address cannot be determined
    fn local_addr(&self) -> TransportResult<SocketAddr>;

    /// Short name for logs
    fn scheme(&self) -> &'static str;
}
