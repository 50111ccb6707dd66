//! Framed protocol over one relay transport.
//!
//! [`Protocol::spawn`] splits the transport and runs three tasks:
//!
//! - reader: decodes frames, answers `Ping` with `Pong`, hands every other
//!   message to the owner as a [`ProtocolEvent`] and emits the final
//!   [`ProtocolEvent::Closed`]
//! - writer: owns the write half and writes queued frames in order,
//!   flushing when the queue runs dry
//! - heartbeat: pings every interval and closes the connection when no
//!   `Pong` arrived for three intervals
//!
//! Frames are encoded by [`ProtocolHandle::send`] on the caller's task, so an
//! oversized message fails there instead of killing the connection.

use super::error::RelayError;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncWriteExt, BufReader, BufWriter, ReadHalf, WriteHalf};
use tokio::sync::{mpsc, watch};
use tokio::time::{Instant, MissedTickBehavior, interval_at, sleep_until};
use tracing::{debug, trace, warn};
use wisp_core::{DEFAULT_MAX_FRAME_SIZE, Message, encode_frame, read_frame};
use wisp_transport::Duplex;

/// Default interval between pings
pub const DEFAULT_HEARTBEAT_INTERVAL: Duration = Duration::from_secs(15);

/// Missed heartbeat intervals before the peer is considered dead
pub const FAILSAFE_INTERVALS: u32 = 3;

/// Frames written per batch
const WRITE_BATCH: usize = 64;

/// Framed protocol configuration
#[derive(Debug, Clone)]
pub struct ProtocolConfig {
    /// Interval between pings
    pub heartbeat_interval: Duration,
    /// Upper bound on `opcode + payload` in either direction
    pub max_frame_size: usize,
    /// Capacity of the inbound event channel
    pub channel_capacity: usize,
}

impl Default for ProtocolConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval: DEFAULT_HEARTBEAT_INTERVAL,
            max_frame_size: DEFAULT_MAX_FRAME_SIZE,
            channel_capacity: 1024,
        }
    }
}

impl ProtocolConfig {
    /// Time without a pong after which the connection is closed
    #[must_use]
    pub fn failsafe_timeout(&self) -> Duration {
        self.heartbeat_interval * FAILSAFE_INTERVALS
    }
}

/// What the owner of a connection receives
#[derive(Debug)]
pub enum ProtocolEvent {
    /// A decoded message other than `Ping`/`Pong`
    Message(Message),
    /// The connection is gone; `None` for a clean close. Always last.
    Closed(Option<RelayError>),
}

#[derive(Debug, Clone)]
enum State {
    Open,
    Closed(Option<RelayError>),
}

impl State {
    fn is_closed(&self) -> bool {
        matches!(self, State::Closed(_))
    }
}

#[derive(Debug)]
struct Shared {
    outbound: mpsc::UnboundedSender<Vec<u8>>,
    state: watch::Sender<State>,
    max_frame_size: usize,
}

impl Shared {
    fn send(&self, message: &Message) -> Result<(), RelayError> {
        if self.state.borrow().is_closed() {
            return Err(RelayError::Closed);
        }
        let frame = encode_frame(message, self.max_frame_size)?;
        self.outbound.send(frame).map_err(|_| RelayError::Closed)
    }

    fn close(&self, reason: Option<RelayError>) -> bool {
        self.state.send_if_modified(|state| {
            if state.is_closed() {
                return false;
            }
            *state = State::Closed(reason);
            true
        })
    }
}

/// Cloneable sending side of a connection
#[derive(Debug, Clone)]
pub struct ProtocolHandle {
    shared: Arc<Shared>,
}

impl ProtocolHandle {
    /// Queue `message` for the writer.
    ///
    /// Returns as soon as the frame is queued, before it is written or
    /// flushed; `Ok` says nothing about delivery. Queued frames keep their
    /// order and still go out if the connection is closed locally, but are
    /// lost if the transport fails first.
    ///
    /// # Errors
    ///
    /// Returns [`RelayError::Closed`] after close and
    /// [`RelayError::ProtocolViolation`] if the frame exceeds the size limit.
    pub fn send(&self, message: Message) -> Result<(), RelayError> {
        trace!(opcode = ?message.opcode(), "queue frame");
        self.shared.send(&message)
    }

    /// Close the connection; later calls do nothing
    pub fn close(&self) {
        if self.shared.close(None) {
            debug!("protocol closed locally");
        }
    }

    /// Whether the connection is closed
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.shared.state.borrow().is_closed()
    }

    /// Transports are connected before they are handed over, so a handle can
    /// send as soon as it exists. Resolves immediately unless closed.
    ///
    /// # Errors
    ///
    /// Returns [`RelayError::Closed`] if the connection is already gone.
    pub async fn ready(&self) -> Result<(), RelayError> {
        if self.is_closed() {
            return Err(RelayError::Closed);
        }
        Ok(())
    }

    /// Wait until the connection closes, returning the reason
    pub async fn closed(&self) -> Option<RelayError> {
        let mut state = self.shared.state.subscribe();
        match state.wait_for(State::is_closed).await {
            Ok(state) => match &*state {
                State::Closed(reason) => reason.clone(),
                State::Open => None,
            },
            Err(_) => None,
        }
    }
}

/// Spawns the tasks of one framed connection
#[derive(Debug)]
pub struct Protocol;

impl Protocol {
    /// Start reading and writing frames on `io`
    pub fn spawn<T: Duplex>(io: T, config: ProtocolConfig) -> (ProtocolHandle, mpsc::Receiver<ProtocolEvent>) {
        let (read_half, write_half) = tokio::io::split(io);
        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
        let (events_tx, events_rx) = mpsc::channel(config.channel_capacity.max(1));
        let (state_tx, _) = watch::channel(State::Open);
        let (pong_tx, pong_rx) = watch::channel(Instant::now());

        let shared = Arc::new(Shared {
            outbound: outbound_tx,
            state: state_tx,
            max_frame_size: config.max_frame_size,
        });

        tokio::spawn(write_loop(
            write_half,
            outbound_rx,
            Arc::clone(&shared),
        ));
        tokio::spawn(heartbeat_loop(
            Arc::clone(&shared),
            pong_rx,
            config.heartbeat_interval,
        ));
        tokio::spawn(read_loop(
            read_half,
            Arc::clone(&shared),
            events_tx,
            pong_tx,
            config.max_frame_size,
        ));

        (ProtocolHandle { shared }, events_rx)
    }
}

async fn closed(state: &mut watch::Receiver<State>) {
    let _ = state.wait_for(State::is_closed).await;
}

async fn read_loop<T: Duplex>(
    read_half: ReadHalf<T>,
    shared: Arc<Shared>,
    events: mpsc::Sender<ProtocolEvent>,
    pong: watch::Sender<Instant>,
    max_frame_size: usize,
) {
    let mut reader = BufReader::new(read_half);
    let mut state = shared.state.subscribe();

    loop {
        let frame = tokio::select! {
            frame = read_frame(&mut reader, max_frame_size) => frame,
            () = closed(&mut state) => break,
        };
        match frame {
            Ok(Some(Message::Ping)) => {
                let _ = shared.send(&Message::Pong);
            }
            Ok(Some(Message::Pong)) => {
                pong.send_replace(Instant::now());
            }
            Ok(Some(message)) => {
                if events.send(ProtocolEvent::Message(message)).await.is_err() {
                    shared.close(None);
                    break;
                }
            }
            Ok(None) => {
                debug!("transport ended");
                shared.close(None);
                break;
            }
            Err(e) => {
                let err = RelayError::from(e);
                if err.is_protocol_violation() {
                    warn!(error = %err, "closing on protocol violation");
                } else {
                    debug!(error = %err, "transport read failed");
                }
                shared.close(Some(err));
                break;
            }
        }
    }

    let reason = match &*shared.state.borrow() {
        State::Closed(reason) => reason.clone(),
        State::Open => None,
    };
    let _ = events.send(ProtocolEvent::Closed(reason)).await;
}

async fn write_loop<T: Duplex>(
    write_half: WriteHalf<T>,
    mut outbound: mpsc::UnboundedReceiver<Vec<u8>>,
    shared: Arc<Shared>,
) {
    let mut writer = BufWriter::new(write_half);
    let mut state = shared.state.subscribe();
    let mut batch = Vec::with_capacity(WRITE_BATCH);

    loop {
        let count = tokio::select! {
            count = outbound.recv_many(&mut batch, WRITE_BATCH) => count,
            () = closed(&mut state) => break,
        };
        if count == 0 {
            break;
        }
        if let Err(e) = write_batch(&mut writer, &mut batch).await {
            debug!(error = %e, "transport write failed");
            shared.close(Some(e.into()));
            return;
        }
        if outbound.is_empty() {
            if let Err(e) = writer.flush().await {
                shared.close(Some(e.into()));
                return;
            }
        }
    }

    // Frames queued before close still go out.
    while let Ok(frame) = outbound.try_recv() {
        batch.push(frame);
    }
    let _ = write_batch(&mut writer, &mut batch).await;
    let _ = writer.shutdown().await;
}

async fn write_batch<W: tokio::io::AsyncWrite + Unpin>(
    writer: &mut W,
    batch: &mut Vec<Vec<u8>>,
) -> std::io::Result<()> {
    for frame in batch.drain(..) {
        writer.write_all(&frame).await?;
    }
    Ok(())
}

async fn heartbeat_loop(shared: Arc<Shared>, mut pong: watch::Receiver<Instant>, interval: Duration) {
    let failsafe = interval * FAILSAFE_INTERVALS;
    let mut state = shared.state.subscribe();
    let mut ticker = interval_at(Instant::now() + interval, interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut deadline = Instant::now() + failsafe;

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                if shared.send(&Message::Ping).is_err() {
                    break;
                }
            }
            () = sleep_until(deadline) => {
                warn!(?failsafe, "no pong from peer, closing");
                shared.close(Some(RelayError::Timeout));
                break;
            }
            changed = pong.changed() => {
                if changed.is_err() {
                    break;
                }
                deadline = *pong.borrow_and_update() + failsafe;
            }
            () = closed(&mut state) => break,
        }
    }
}
