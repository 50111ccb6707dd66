//! # WISP Transport
//!
//! Byte transports for the WISP relay.
//!
//! This crate provides:
//! - A [`Duplex`] abstraction over any async byte stream
//! - TCP listeners and connectors tuned through socket2
//! - TLS listeners loading PEM certificates
//! - In-memory pipes for embedding and tests

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod memory;
pub mod tcp;
pub mod tls;
pub mod transport;

pub use tcp::TcpAcceptor;
pub use tls::TlsAcceptor;
pub use transport::{Acceptor, BoxedDuplex, Duplex, TransportError, TransportResult};

/// Socket configuration
#[derive(Debug, Clone)]
pub struct TransportConfig {
    /// Disable Nagle's algorithm on connected streams
    pub nodelay: bool,
    /// Listen backlog
    pub backlog: i32,
    /// Receive buffer size
    pub recv_buffer_size: usize,
    /// Send buffer size
    pub send_buffer_size: usize,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            nodelay: true,
            backlog: 1024,
            recv_buffer_size: 256 * 1024,
            send_buffer_size: 256 * 1024,
        }
    }
}
