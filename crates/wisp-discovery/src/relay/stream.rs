//! Endpoint-side streams and servers.
//!
//! A [`RelayedStream`] is a handle onto a socket owned by the client dispatch
//! task. Writes become commands; reads come back as events on a per-socket
//! channel, so data for one alias always arrives in order.

use super::client::Command;
use super::error::RelayError;
use std::io;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll, ready};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::sync::{mpsc, watch};
use tokio::task::AbortHandle;
use tokio::time::{Instant, sleep_until};
use tracing::debug;
use wisp_crypto::{HandshakeHash, PublicKey};

/// Largest chunk one write hands to the relay
pub const MAX_WRITE: usize = 64 * 1024;

/// What the dispatch delivers to a stream
#[derive(Debug)]
pub(crate) enum StreamEvent {
    Data(Vec<u8>),
    End,
    Destroyed(Option<RelayError>),
}

/// Details of an open stream
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamInfo {
    /// Alias the relay knows the stream by
    pub remote_alias: u32,
    /// Transcript hash of the handshake
    pub handshake_hash: Option<HandshakeHash>,
    /// Handshake session, when it ran on this endpoint
    pub handshake_id: Option<u32>,
}

/// Lifecycle of a stream
#[derive(Debug, Clone)]
pub enum StreamState {
    /// Waiting for the relay to pair it
    Opening,
    /// Paired
    Open(StreamInfo),
    /// Gone, with the reason if it failed
    Closed(Option<RelayError>),
}

impl StreamState {
    /// Whether the stream is gone
    #[must_use]
    pub fn is_closed(&self) -> bool {
        matches!(self, StreamState::Closed(_))
    }

    fn is_settled(&self) -> bool {
        !matches!(self, StreamState::Opening)
    }
}

/// Last time traffic went through a socket
pub(crate) type Activity = Arc<watch::Sender<Instant>>;

pub(crate) fn touch(activity: &Activity) {
    activity.send_replace(Instant::now());
}

/// What the dispatch hands out for a new socket
#[derive(Debug)]
pub(crate) struct StreamParts {
    pub alias: u32,
    pub remote_public_key: PublicKey,
    pub events: mpsc::UnboundedReceiver<StreamEvent>,
    pub state: watch::Receiver<StreamState>,
    pub activity: Activity,
}

/// A stream through the relay
pub struct RelayedStream {
    alias: u32,
    remote_public_key: PublicKey,
    commands: mpsc::UnboundedSender<Command>,
    events: mpsc::UnboundedReceiver<StreamEvent>,
    state: watch::Receiver<StreamState>,
    activity: Activity,
    read_buf: Vec<u8>,
    read_pos: usize,
    read_done: bool,
    write_ended: bool,
    destroyed: bool,
    timeout: Option<AbortHandle>,
    keep_alive: Option<AbortHandle>,
}

impl RelayedStream {
    pub(crate) fn new(parts: StreamParts, commands: mpsc::UnboundedSender<Command>) -> Self {
        Self {
            alias: parts.alias,
            remote_public_key: parts.remote_public_key,
            commands,
            events: parts.events,
            state: parts.state,
            activity: parts.activity,
            read_buf: Vec::new(),
            read_pos: 0,
            read_done: false,
            write_ended: false,
            destroyed: false,
            timeout: None,
            keep_alive: None,
        }
    }

    /// Local alias
    #[must_use]
    pub fn alias(&self) -> u32 {
        self.alias
    }

    /// Peer at the other end
    #[must_use]
    pub fn remote_public_key(&self) -> PublicKey {
        self.remote_public_key
    }

    /// Current state
    #[must_use]
    pub fn state(&self) -> StreamState {
        self.state.borrow().clone()
    }

    /// Details once open
    #[must_use]
    pub fn handshake(&self) -> Option<StreamInfo> {
        match &*self.state.borrow() {
            StreamState::Open(info) => Some(info.clone()),
            _ => None,
        }
    }

    /// Transcript hash once open
    #[must_use]
    pub fn handshake_hash(&self) -> Option<HandshakeHash> {
        self.handshake().and_then(|info| info.handshake_hash)
    }

    /// Wait until the relay paired or failed the stream.
    ///
    /// # Errors
    ///
    /// Returns the reason the stream closed, e.g.
    /// [`RelayError::ConnectionFailed`].
    pub async fn opened(&self) -> Result<StreamInfo, RelayError> {
        let mut state = self.state.clone();
        let settled = state.wait_for(StreamState::is_settled).await.map(|s| s.clone());
        match settled {
            Ok(StreamState::Open(info)) => Ok(info),
            Ok(StreamState::Closed(reason)) => Err(reason.unwrap_or(RelayError::Closed)),
            Ok(StreamState::Opening) | Err(_) => Err(RelayError::Closed),
        }
    }

    /// Destroy the stream after `timeout` without traffic; zero disables
    pub fn set_timeout(&mut self, timeout: Duration) {
        if let Some(previous) = self.timeout.take() {
            previous.abort();
        }
        if timeout.is_zero() {
            return;
        }
        let alias = self.alias;
        let activity = self.activity.subscribe();
        let mut state = self.state.clone();
        let commands = self.commands.clone();
        let task = tokio::spawn(async move {
            loop {
                let deadline = *activity.borrow() + timeout;
                tokio::select! {
                    () = sleep_until(deadline) => {
                        if *activity.borrow() + timeout <= Instant::now() {
                            debug!(alias, ?timeout, "stream timed out");
                            let _ = commands.send(Command::Destroy {
                                alias,
                                error: Some(RelayError::Timeout),
                            });
                            return;
                        }
                    }
                    () = closed(&mut state) => return,
                }
            }
        });
        self.timeout = Some(task.abort_handle());
    }

    /// Send a zero-length keep-alive after `interval` without traffic; zero
    /// disables
    pub fn set_keep_alive(&mut self, interval: Duration) {
        if let Some(previous) = self.keep_alive.take() {
            previous.abort();
        }
        if interval.is_zero() {
            return;
        }
        let alias = self.alias;
        let activity = self.activity.subscribe();
        let mut state = self.state.clone();
        let commands = self.commands.clone();
        let task = tokio::spawn(async move {
            let mut last_sent = Instant::now();
            loop {
                let deadline = (*activity.borrow()).max(last_sent) + interval;
                tokio::select! {
                    () = sleep_until(deadline) => {
                        if (*activity.borrow()).max(last_sent) + interval <= Instant::now() {
                            let keep_alive = Command::Write { alias, data: Vec::new() };
                            if commands.send(keep_alive).is_err() {
                                return;
                            }
                            last_sent = Instant::now();
                        }
                    }
                    () = closed(&mut state) => return,
                }
            }
        });
        self.keep_alive = Some(task.abort_handle());
    }

    /// Tear the stream down, telling the peer why
    pub fn destroy(&mut self, error: Option<RelayError>) {
        if self.destroyed {
            return;
        }
        self.destroyed = true;
        self.stop_watchdogs();
        let _ = self.commands.send(Command::Destroy {
            alias: self.alias,
            error,
        });
    }

    fn stop_watchdogs(&mut self) {
        for task in [self.timeout.take(), self.keep_alive.take()].into_iter().flatten() {
            task.abort();
        }
    }

    fn closed_error(&self) -> Option<io::Error> {
        match &*self.state.borrow() {
            StreamState::Closed(reason) => Some(
                reason
                    .clone()
                    .unwrap_or(RelayError::Closed)
                    .into(),
            ),
            _ => None,
        }
    }
}

async fn closed(state: &mut watch::Receiver<StreamState>) {
    let _ = state.wait_for(StreamState::is_closed).await;
}

impl AsyncRead for RelayedStream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        loop {
            if this.read_pos < this.read_buf.len() {
                let available = &this.read_buf[this.read_pos..];
                let n = available.len().min(buf.remaining());
                buf.put_slice(&available[..n]);
                this.read_pos += n;
                return Poll::Ready(Ok(()));
            }
            if this.read_done {
                return Poll::Ready(Ok(()));
            }
            match ready!(this.events.poll_recv(cx)) {
                Some(StreamEvent::Data(data)) => {
                    this.read_buf = data;
                    this.read_pos = 0;
                }
                Some(StreamEvent::End) | None => this.read_done = true,
                Some(StreamEvent::Destroyed(reason)) => {
                    this.read_done = true;
                    if let Some(reason) = reason {
                        return Poll::Ready(Err(reason.into()));
                    }
                }
            }
        }
    }
}

impl AsyncWrite for RelayedStream {
    fn poll_write(self: Pin<&mut Self>, _cx: &mut Context<'_>, buf: &[u8]) -> Poll<io::Result<usize>> {
        let this = self.get_mut();
        if let Some(err) = this.closed_error() {
            return Poll::Ready(Err(err));
        }
        if this.write_ended || this.destroyed {
            return Poll::Ready(Err(io::ErrorKind::BrokenPipe.into()));
        }
        if buf.is_empty() {
            return Poll::Ready(Ok(0));
        }
        let n = buf.len().min(MAX_WRITE);
        let write = Command::Write {
            alias: this.alias,
            data: buf[..n].to_vec(),
        };
        if this.commands.send(write).is_err() {
            return Poll::Ready(Err(RelayError::Closed.into()));
        }
        touch(&this.activity);
        Poll::Ready(Ok(n))
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }

    fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        if !this.write_ended && !this.destroyed {
            this.write_ended = true;
            let _ = this.commands.send(Command::End { alias: this.alias });
        }
        Poll::Ready(Ok(()))
    }
}

impl Drop for RelayedStream {
    fn drop(&mut self) {
        self.destroy(None);
    }
}

impl std::fmt::Debug for RelayedStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RelayedStream")
            .field("alias", &self.alias)
            .field("remote_public_key", &self.remote_public_key)
            .field("state", &*self.state.borrow())
            .finish_non_exhaustive()
    }
}

/// What the dispatch hands out for a new server
#[derive(Debug)]
pub(crate) struct ServerParts {
    pub alias: u32,
    pub public_key: PublicKey,
    pub address: SocketAddr,
    pub connections: mpsc::UnboundedReceiver<StreamParts>,
}

/// A server listening through the relay
pub struct RelayedServer {
    alias: u32,
    public_key: PublicKey,
    address: SocketAddr,
    connections: mpsc::UnboundedReceiver<StreamParts>,
    commands: mpsc::UnboundedSender<Command>,
    closed: bool,
}

impl RelayedServer {
    pub(crate) fn new(parts: ServerParts, commands: mpsc::UnboundedSender<Command>) -> Self {
        Self {
            alias: parts.alias,
            public_key: parts.public_key,
            address: parts.address,
            connections: parts.connections,
            commands,
            closed: false,
        }
    }

    /// Local alias
    #[must_use]
    pub fn alias(&self) -> u32 {
        self.alias
    }

    /// Identity the server listens as
    #[must_use]
    pub fn public_key(&self) -> PublicKey {
        self.public_key
    }

    /// Address of the relay's DHT node
    #[must_use]
    pub fn address(&self) -> SocketAddr {
        self.address
    }

    /// Next inbound stream; `None` once the server is closed
    pub async fn accept(&mut self) -> Option<RelayedStream> {
        let parts = self.connections.recv().await?;
        Some(RelayedStream::new(parts, self.commands.clone()))
    }

    /// Stop listening; accepted streams stay open
    pub fn close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        let _ = self.commands.send(Command::CloseServer { alias: self.alias });
    }
}

impl Drop for RelayedServer {
    fn drop(&mut self) {
        self.close();
    }
}

impl std::fmt::Debug for RelayedServer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RelayedServer")
            .field("alias", &self.alias)
            .field("public_key", &self.public_key)
            .field("address", &self.address)
            .finish_non_exhaustive()
    }
}
