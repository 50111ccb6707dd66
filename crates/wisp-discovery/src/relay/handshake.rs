//! Noise handshakes run by a key holder on the other end of the relay.
//!
//! Relay side: [`ProxyHandshake`] plugs into the DHT as a [`Handshaker`] and
//! turns every step into a `NoiseSend`/`NoiseReceive` frame, waiting for the
//! endpoint's `NoiseReply`. The relay only ever sees opaque handshake
//! messages and the public values derived from the transcript hash.
//!
//! Endpoint side: [`HandshakeSessions`] owns the real [`NoiseHandshake`]s,
//! keyed by the relay's handshake id, and answers each step.
//!
//! ```text
//!  initiator endpoint        relay          responder endpoint
//!        |<-- NoiseSend ------|                      |
//!        |--- NoiseReply ---->|  (msg1)              |
//!        |                    |-- NoiseReceive ----->|
//!        |                    |<-- NoiseReply -------|  (payload)
//!        |                    |-- Incoming --------->|  firewall
//!        |                    |<-- Accept -----------|
//!        |                    |-- NoiseSend -------->|
//!        |                    |<-- NoiseReply -------|  (msg2, complete)
//!        |<-- NoiseReceive ---|                      |
//!        |--- NoiseReply ---->|  (complete)          |
//! ```

use super::link::{Link, NoiseOutcome};
use super::registry::Registry;
use crate::dht::{DhtError, HandshakeFactory, Handshaker};
use async_trait::async_trait;
use std::sync::Arc;
use tracing::debug;
use wisp_core::Message;
use wisp_crypto::{CryptoError, HandshakePhase, HandshakeResult, NoiseHandshake, PublicKey};

/// Relay-side handshake whose secret key lives on the endpoint
#[derive(Debug)]
pub struct ProxyHandshake {
    link: Arc<Link>,
    id: u32,
    alias: u32,
    is_initiator: bool,
    public_key: PublicKey,
    remote_public_key: Option<PublicKey>,
    result: Option<HandshakeResult>,
    phase: HandshakePhase,
}

impl ProxyHandshake {
    /// Initiator for the endpoint socket `alias`
    #[must_use]
    pub fn initiator(link: Arc<Link>, alias: u32, public_key: PublicKey, remote_public_key: PublicKey) -> Self {
        Self::new(link, alias, true, public_key, Some(remote_public_key))
    }

    /// Responder for the endpoint server `alias`
    #[must_use]
    pub fn responder(link: Arc<Link>, alias: u32, public_key: PublicKey) -> Self {
        Self::new(link, alias, false, public_key, None)
    }

    fn new(
        link: Arc<Link>,
        alias: u32,
        is_initiator: bool,
        public_key: PublicKey,
        remote_public_key: Option<PublicKey>,
    ) -> Self {
        let id = link.allocate_handshake();
        Self {
            link,
            id,
            alias,
            is_initiator,
            public_key,
            remote_public_key,
            result: None,
            phase: HandshakePhase::Initiated,
        }
    }

    /// Handshake id shared with the endpoint
    #[must_use]
    pub fn id(&self) -> u32 {
        self.id
    }

    /// Current phase
    #[must_use]
    pub fn phase(&self) -> HandshakePhase {
        self.phase
    }

    async fn step(&mut self, request: Message) -> Result<Vec<u8>, DhtError> {
        if self.phase.is_terminal() {
            return Err(CryptoError::InvalidState.into());
        }
        let outcome = match self.link.noise_step(self.id, request).await {
            Ok(outcome) => outcome,
            Err(e) => {
                self.phase = HandshakePhase::Failed;
                return Err(DhtError::ConnectionFailed(e.to_string()));
            }
        };
        match self.apply(outcome) {
            Ok(data) => Ok(data),
            Err(e) => {
                self.phase = HandshakePhase::Failed;
                Err(e)
            }
        }
    }

    fn apply(&mut self, outcome: NoiseOutcome) -> Result<Vec<u8>, DhtError> {
        if let Some(error) = outcome.error {
            return Err(CryptoError::Handshake(error).into());
        }
        if let Some(remote) = outcome.remote_public_key {
            match self.remote_public_key {
                Some(known) if known != remote => return Err(CryptoError::InvalidPublicKey.into()),
                _ => self.remote_public_key = Some(remote),
            }
        }

        if !outcome.complete {
            self.phase = HandshakePhase::InProgress;
            return Ok(outcome.data);
        }

        let hash = outcome
            .handshake_hash
            .ok_or_else(|| CryptoError::Handshake("completion without hash".into()))?;
        let remote = self
            .remote_public_key
            .ok_or_else(|| CryptoError::Handshake("completion without identity".into()))?;
        let result = HandshakeResult::from_hash(self.is_initiator, self.public_key, remote, hash);
        if outcome.remote_id != Some(result.remote_id)
            || outcome.holepunch_secret != Some(result.holepunch_secret)
        {
            return Err(CryptoError::Handshake("derived values disagree".into()).into());
        }
        self.result = Some(result);
        self.phase = HandshakePhase::Complete;
        Ok(outcome.data)
    }
}

#[async_trait]
impl Handshaker for ProxyHandshake {
    async fn send(&mut self, payload: &[u8]) -> Result<Vec<u8>, DhtError> {
        let request = Message::NoiseSend {
            is_initiator: self.is_initiator,
            id: self.id,
            alias: self.alias,
            data: payload.to_vec(),
        };
        self.step(request).await
    }

    async fn recv(&mut self, message: &[u8]) -> Result<Vec<u8>, DhtError> {
        let request = Message::NoiseReceive {
            is_initiator: self.is_initiator,
            id: self.id,
            alias: self.alias,
            data: message.to_vec(),
        };
        self.step(request).await
    }

    fn remote_public_key(&self) -> Option<PublicKey> {
        self.remote_public_key
    }

    fn result(&self) -> Option<HandshakeResult> {
        self.result.clone()
    }

    fn handshake_id(&self) -> Option<u32> {
        Some(self.id)
    }
}

impl Drop for ProxyHandshake {
    fn drop(&mut self) {
        self.link.release_handshake(self.id);
    }
}

/// Responders for a non-custodial server
#[derive(Debug)]
pub struct ProxyHandshakeFactory {
    link: Arc<Link>,
    alias: u32,
    public_key: PublicKey,
}

impl ProxyHandshakeFactory {
    /// Factory for the endpoint server `alias` listening as `public_key`
    #[must_use]
    pub fn new(link: Arc<Link>, alias: u32, public_key: PublicKey) -> Self {
        Self {
            link,
            alias,
            public_key,
        }
    }
}

impl HandshakeFactory for ProxyHandshakeFactory {
    fn responder(&self) -> Result<Box<dyn Handshaker>, DhtError> {
        if self.link.protocol().is_closed() {
            return Err(DhtError::Closed);
        }
        Ok(Box::new(ProxyHandshake::responder(
            Arc::clone(&self.link),
            self.alias,
            self.public_key,
        )))
    }
}

/// Lifecycle of an endpoint handshake session
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// Created, no step taken
    Initiated,
    /// At least one step taken
    InProgress,
    /// Both messages processed; waiting to be consumed by its stream
    Complete,
    /// Rejected by the firewall
    Denied,
    /// Torn down with its socket or server
    Destroyed,
}

/// Which step the relay asks for
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NoiseStep {
    /// Write the next message (`NoiseSend`)
    Send,
    /// Read a message (`NoiseReceive`)
    Receive,
}

/// One step request from the relay
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NoiseRequest {
    /// Send or receive
    pub step: NoiseStep,
    /// Role of the key holder
    pub is_initiator: bool,
    /// Handshake id
    pub id: u32,
    /// Socket alias (initiator) or server alias (responder)
    pub alias: u32,
    /// Payload to embed or message to read
    pub data: Vec<u8>,
}

impl NoiseRequest {
    /// Request carried by a `NoiseSend`/`NoiseReceive` frame
    #[must_use]
    pub fn from_message(message: Message) -> Option<Self> {
        let (step, is_initiator, id, alias, data) = match message {
            Message::NoiseSend {
                is_initiator,
                id,
                alias,
                data,
            } => (NoiseStep::Send, is_initiator, id, alias, data),
            Message::NoiseReceive {
                is_initiator,
                id,
                alias,
                data,
            } => (NoiseStep::Receive, is_initiator, id, alias, data),
            _ => return None,
        };
        Some(Self {
            step,
            is_initiator,
            id,
            alias,
            data,
        })
    }

    /// Whether this step may open a new session: initiators start by
    /// writing message 1, responders by reading it
    #[must_use]
    pub fn opens_session(&self) -> bool {
        match self.step {
            NoiseStep::Send => self.is_initiator,
            NoiseStep::Receive => !self.is_initiator,
        }
    }
}

/// An endpoint-held handshake
#[derive(Debug)]
pub struct HandshakeSession {
    alias: u32,
    noise: NoiseHandshake,
    state: SessionState,
}

impl HandshakeSession {
    /// Current state
    #[must_use]
    pub fn state(&self) -> SessionState {
        self.state
    }

    /// Owning socket or server alias
    #[must_use]
    pub fn alias(&self) -> u32 {
        self.alias
    }

    /// Derived values once complete
    #[must_use]
    pub fn result(&self) -> Option<&HandshakeResult> {
        self.noise.result()
    }

    fn step(&mut self, request: &NoiseRequest) -> Result<Vec<u8>, CryptoError> {
        if request.is_initiator != self.noise.is_initiator() || request.alias != self.alias {
            return Err(CryptoError::InvalidMessage("handshake role or alias mismatch".into()));
        }
        if matches!(self.state, SessionState::Complete) {
            return Err(CryptoError::InvalidState);
        }
        let data = match request.step {
            NoiseStep::Send => self.noise.send(&request.data)?,
            NoiseStep::Receive => self.noise.recv(&request.data)?,
        };
        self.state = if self.noise.is_complete() {
            SessionState::Complete
        } else {
            SessionState::InProgress
        };
        Ok(data)
    }

    fn reply(&self, id: u32, data: Vec<u8>) -> Message {
        let result = self.noise.result();
        Message::NoiseReply {
            id,
            data,
            complete: result.is_some(),
            handshake_hash: result.map(|r| r.hash),
            remote_id: result.map(|r| r.remote_id),
            holepunch_secret: result.map(|r| r.holepunch_secret),
            remote_public_key: self.noise.remote_public_key().copied(),
            error: None,
        }
    }
}

/// Endpoint-side handshake sessions by id
#[derive(Debug, Default)]
pub struct HandshakeSessions {
    sessions: Registry<u32, HandshakeSession>,
}

impl HandshakeSessions {
    /// No sessions
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Answer one step with a `NoiseReply`.
    ///
    /// `start` builds the handshake when the step opens a new session; it
    /// returns `None` when the alias may not run one. Any failure answers
    /// with an error and removes the session.
    pub fn handle(
        &mut self,
        request: NoiseRequest,
        start: impl FnOnce() -> Option<Result<NoiseHandshake, CryptoError>>,
    ) -> Message {
        let id = request.id;
        match self.step(&request, start) {
            Ok(reply) => reply,
            Err(e) => {
                debug!(id, error = %e, "handshake step failed");
                self.sessions.remove(&id);
                error_reply(id, &e)
            }
        }
    }

    fn step(
        &mut self,
        request: &NoiseRequest,
        start: impl FnOnce() -> Option<Result<NoiseHandshake, CryptoError>>,
    ) -> Result<Message, CryptoError> {
        if !self.sessions.has(&request.id) {
            if !request.opens_session() {
                return Err(CryptoError::InvalidState);
            }
            let noise = start().ok_or_else(|| CryptoError::Handshake("alias cannot handshake".into()))??;
            if noise.is_initiator() != request.is_initiator {
                return Err(CryptoError::InvalidMessage("handshake role mismatch".into()));
            }
            self.sessions.add(
                request.id,
                HandshakeSession {
                    alias: request.alias,
                    noise,
                    state: SessionState::Initiated,
                },
            );
        }
        let session = self
            .sessions
            .get_mut(&request.id)
            .ok_or(CryptoError::InvalidState)?;
        let data = session.step(request)?;
        Ok(session.reply(request.id, data))
    }

    /// Session by id
    #[must_use]
    pub fn get(&self, id: u32) -> Option<&HandshakeSession> {
        self.sessions.get(&id)
    }

    /// Drop a session the firewall rejected
    pub fn deny(&mut self, id: u32) -> Option<SessionState> {
        self.sessions.remove(&id).map(|_| SessionState::Denied)
    }

    /// Take the result of a completed session, removing it
    pub fn consume(&mut self, id: u32) -> Option<HandshakeResult> {
        let session = self.sessions.remove(&id)?;
        session.noise.result().cloned()
    }

    /// Drop every session owned by `alias` in the given role
    pub fn destroy_alias(&mut self, alias: u32, is_initiator: bool) -> usize {
        let before = self.sessions.len();
        self.sessions
            .retain(|_, s| !(s.alias == alias && s.noise.is_initiator() == is_initiator));
        before - self.sessions.len()
    }

    /// Drop everything
    pub fn clear(&mut self) {
        self.sessions.drain().for_each(drop);
    }

    /// Live sessions
    #[must_use]
    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    /// Whether no session is live
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }
}

fn error_reply(id: u32, error: &CryptoError) -> Message {
    Message::NoiseReply {
        id,
        data: Vec::new(),
        complete: false,
        handshake_hash: None,
        remote_id: None,
        holepunch_secret: None,
        remote_public_key: None,
        error: Some(error.to_string()),
    }
}
