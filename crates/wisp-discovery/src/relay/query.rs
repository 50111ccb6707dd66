//! Lookup/announce/unannounce as streams of replies.
//!
//! On the wire a query is its request frame, zero or more `Result` frames and
//! exactly one `Finished`. The relay side produces that sequence from a DHT
//! [`QueryStream`]; the endpoint side consumes it as a lazy [`Query`].

use super::error::RelayError;
use super::protocol::ProtocolHandle;
use crate::dht::QueryStream;
use tokio::sync::mpsc;
use tracing::debug;
use wisp_core::{Message, QueryReply};
use wisp_crypto::{KeyPair, PublicKey};

/// Which query
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueryKind {
    /// Find peers
    Lookup,
    /// Store our record
    Announce,
    /// Remove our record
    Unannounce,
}

/// Forward every reply of `stream` as a `Result` frame, then one `Finished`.
///
/// Stops early if the transport closes; aborting the task cancels the
/// query without a `Finished`.
pub async fn drive(id: u32, mut stream: QueryStream, protocol: ProtocolHandle) {
    let mut replies = 0usize;
    let mut error = None;
    while let Some(reply) = stream.next().await {
        match reply {
            Ok(reply) => {
                if protocol.send(Message::Result { id, reply }).is_err() {
                    return;
                }
                replies += 1;
            }
            Err(e) => {
                error = Some(RelayError::from(e).to_wire());
                break;
            }
        }
    }
    debug!(id, replies, failed = error.is_some(), "query finished");
    let _ = protocol.send(Message::Finished { id, error });
}

/// What the endpoint dispatch delivers to a [`Query`]
#[derive(Debug)]
pub(crate) enum QueryEvent {
    /// Registered under this id; always first
    Started(u32),
    Reply(QueryReply),
    Finished(Option<RelayError>),
}

/// Everything the dispatch needs to start a query
#[derive(Debug)]
pub(crate) struct QueryRequest {
    pub kind: QueryKind,
    pub target: [u8; 32],
    pub public_key: PublicKey,
    /// Signs announce/unannounce records; sent along in custodial mode
    pub key_pair: Option<KeyPair>,
    pub custodial: bool,
}

/// Hands a started query to the endpoint dispatch
pub(crate) type QueryStarter = Box<dyn FnOnce(QueryRequest, mpsc::UnboundedSender<QueryEvent>) -> bool + Send>;

/// Tells the endpoint dispatch to forget an abandoned query
pub(crate) type QueryCanceller = Box<dyn Fn(u32) + Send>;

/// Endpoint-side query.
///
/// Nothing is sent until the first [`next`](Self::next). After the last reply
/// it only yields `None`. Dropping an unfinished query forgets it on this
/// side: later replies are discarded and the client stops signing for it.
pub struct Query {
    kind: QueryKind,
    request: Option<(QueryRequest, QueryStarter)>,
    events: Option<mpsc::UnboundedReceiver<QueryEvent>>,
    id: Option<u32>,
    cancel: QueryCanceller,
    finished: bool,
}

impl Query {
    pub(crate) fn new(request: QueryRequest, start: QueryStarter, cancel: QueryCanceller) -> Self {
        Self {
            kind: request.kind,
            request: Some((request, start)),
            events: None,
            id: None,
            cancel,
            finished: false,
        }
    }

    /// Which query this is
    #[must_use]
    pub fn kind(&self) -> QueryKind {
        self.kind
    }

    /// Next reply; `None` once the relay finished the query
    pub async fn next(&mut self) -> Option<Result<QueryReply, RelayError>> {
        if self.finished {
            return None;
        }
        if let Some((request, start)) = self.request.take() {
            let (tx, rx) = mpsc::unbounded_channel();
            if !start(request, tx) {
                self.finished = true;
                return Some(Err(RelayError::Closed));
            }
            self.events = Some(rx);
        }
        loop {
            let event = match self.events.as_mut() {
                Some(events) => events.recv().await,
                None => None,
            };
            match event {
                Some(QueryEvent::Started(id)) => self.id = Some(id),
                Some(QueryEvent::Reply(reply)) => return Some(Ok(reply)),
                Some(QueryEvent::Finished(error)) => return self.finish(error),
                None => return self.finish(Some(RelayError::Closed)),
            }
        }
    }

    fn finish(&mut self, error: Option<RelayError>) -> Option<Result<QueryReply, RelayError>> {
        self.finished = true;
        self.events = None;
        error.map(Err)
    }

    /// Whether the query has ended
    #[must_use]
    pub fn is_finished(&self) -> bool {
        self.finished
    }

    /// Run the query to the end.
    ///
    /// # Errors
    ///
    /// Returns the first error the query ends with.
    pub async fn collect(mut self) -> Result<Vec<QueryReply>, RelayError> {
        let mut replies = Vec::new();
        while let Some(reply) = self.next().await {
            replies.push(reply?);
        }
        Ok(replies)
    }
}

impl Drop for Query {
    fn drop(&mut self) {
        if self.finished {
            return;
        }
        if self.id.is_none() {
            if let Some(events) = self.events.as_mut() {
                // a closed channel makes a dispatch that has not registered
                // the query yet skip it; otherwise the id is buffered here
                events.close();
                while let Ok(event) = events.try_recv() {
                    if let QueryEvent::Started(id) = event {
                        self.id = Some(id);
                        break;
                    }
                }
            }
        }
        if let Some(id) = self.id {
            (self.cancel)(id);
        }
    }
}

impl std::fmt::Debug for Query {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Query")
            .field("kind", &self.kind)
            .field("started", &self.request.is_none())
            .field("id", &self.id)
            .field("finished", &self.finished)
            .finish()
    }
}
