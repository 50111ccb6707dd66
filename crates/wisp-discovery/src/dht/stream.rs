//! Streams handed out by a DHT node.

use super::DhtError;
use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};
use tokio::io::{AsyncRead, AsyncWrite, DuplexStream, ReadBuf};
use tokio::sync::mpsc;
use wisp_core::QueryReply;
use wisp_crypto::{HandshakeResult, PublicKey};

/// Encrypted peer stream with the handshake that produced it
#[derive(Debug)]
pub struct DhtStream {
    io: DuplexStream,
    result: HandshakeResult,
    handshake_id: Option<u32>,
}

impl DhtStream {
    /// Wrap `io`, authenticated by `result`
    #[must_use]
    pub fn new(io: DuplexStream, result: HandshakeResult, handshake_id: Option<u32>) -> Self {
        Self {
            io,
            result,
            handshake_id,
        }
    }

    /// Handshake values for this side
    #[must_use]
    pub fn handshake(&self) -> &HandshakeResult {
        &self.result
    }

    /// Authenticated peer
    #[must_use]
    pub fn remote_public_key(&self) -> PublicKey {
        self.result.remote_public_key
    }

    /// Whether this side initiated the handshake
    #[must_use]
    pub fn is_initiator(&self) -> bool {
        self.result.is_initiator
    }

    /// Proxied handshake session id, if the handshake ran remotely
    #[must_use]
    pub fn handshake_id(&self) -> Option<u32> {
        self.handshake_id
    }
}

impl AsyncRead for DhtStream {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        Pin::new(&mut self.io).poll_read(cx, buf)
    }
}

impl AsyncWrite for DhtStream {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.io).poll_write(cx, buf)
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.io).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.io).poll_shutdown(cx)
    }
}

/// Replies of a lookup/announce/unannounce, ending when the producer is done.
///
/// Dropping the stream stops the producer at its next send.
#[derive(Debug)]
pub struct QueryStream {
    rx: mpsc::Receiver<Result<QueryReply, DhtError>>,
}

impl QueryStream {
    /// Stream plus the sender its producer writes to
    #[must_use]
    pub fn channel(capacity: usize) -> (mpsc::Sender<Result<QueryReply, DhtError>>, Self) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (tx, Self { rx })
    }

    /// Stream that fails immediately
    #[must_use]
    pub fn failed(error: DhtError) -> Self {
        let (tx, stream) = Self::channel(1);
        let _ = tx.try_send(Err(error));
        stream
    }

    /// Next reply, `None` when the query is done
    pub async fn next(&mut self) -> Option<Result<QueryReply, DhtError>> {
        self.rx.recv().await
    }
}
