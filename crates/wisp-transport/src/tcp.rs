//! TCP transport.
//!
//! Listeners are created through socket2 so buffer sizes and address reuse are
//! set before `listen`; connected streams get `TCP_NODELAY` because relay
//! frames are small and latency-sensitive.

use crate::transport::{Acceptor, BoxedDuplex, TransportError, TransportResult};
use crate::TransportConfig;
use async_trait::async_trait;
use socket2::{Domain, Protocol, Socket, Type};
use std::net::SocketAddr;
use tokio::net::{TcpListener, TcpStream};

/// Plain TCP listener
#[derive(Debug)]
pub struct TcpAcceptor {
    listener: TcpListener,
    config: TransportConfig,
}

impl TcpAcceptor {
    /// Bind a listener on `addr`. Port 0 picks a free port.
    ///
    /// # Errors
    /// Returns [`TransportError::BindFailed`] if the address is unavailable.
    pub fn bind(addr: SocketAddr, config: &TransportConfig) -> TransportResult<Self> {
        let domain = if addr.is_ipv4() {
            Domain::IPV4
        } else {
            Domain::IPV6
        };

        let socket = Socket::new(domain, Type::STREAM, Some(Protocol::TCP))?;
        socket.set_nonblocking(true)?;
        socket.set_reuse_address(true)?;
        socket.set_recv_buffer_size(config.recv_buffer_size)?;
        socket.set_send_buffer_size(config.send_buffer_size)?;
        socket
            .bind(&addr.into())
            .map_err(|e| TransportError::BindFailed(format!("{addr}: {e}")))?;
        socket.listen(config.backlog)?;

        let listener = TcpListener::from_std(socket.into())?;
        Ok(Self {
            listener,
            config: config.clone(),
        })
    }

    fn prepare(&self, stream: &TcpStream) -> TransportResult<()> {
        stream.set_nodelay(self.config.nodelay)?;
        Ok(())
    }
}

#[async_trait]
impl Acceptor for TcpAcceptor {
    async fn accept(&self) -> TransportResult<(TcpStream, SocketAddr)> {
        let (stream, peer) = self.listener.accept().await?;
        self.prepare(&stream)?;
        Ok((stream, peer))
    }

    async fn upgrade(&self, stream: TcpStream) -> TransportResult<BoxedDuplex> {
        Ok(Box::new(stream))
    }

    fn local_addr(&self) -> TransportResult<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    fn scheme(&self) -> &'static str {
        "tcp"
    }
}

/// Connect to a relay over TCP
///
/// # Errors
/// Returns [`TransportError::ConnectionFailed`] if the connection is refused.
pub async fn connect(addr: SocketAddr, config: &TransportConfig) -> TransportResult<TcpStream> {
    let stream = TcpStream::connect(addr)
        .await
        .map_err(|e| TransportError::ConnectionFailed(format!("{addr}: {e}")))?;
    stream.set_nodelay(config.nodelay)?;
    Ok(stream)
}
