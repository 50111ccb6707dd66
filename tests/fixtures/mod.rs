//! Relay fixture for integration testing
//!
//! Runs a [`RelayServer`] over a private [`Swarm`] and hands out endpoints
//! connected to it through in-memory pipes:
//! - [`RelayFixture::client`] for a full [`RelayClient`]
//! - [`RelayFixture::raw`] for a bare framed connection that speaks
//!   [`Message`]s directly
//!
//! # Example
//!
//! ```no_run
//! use wisp_integration_tests::RelayFixture;
//!
//! #[tokio::test]
//! async fn test_lookup() {
//!     let mut fixture = RelayFixture::new();
//!     let client = fixture.client();
//!     let replies = client.lookup([1u8; 32]).collect().await.unwrap();
//!     assert!(replies.iter().all(|reply| reply.peers.is_empty()));
//! }
//! ```

use std::future::Future;
use std::sync::Arc;
use std::sync::Once;
use std::time::Duration;
use tokio::sync::mpsc;
use wisp_core::Message;
use wisp_discovery::dht::{MemoryDht, Swarm};
use wisp_discovery::relay::{
    ClientConfig, Protocol, ProtocolConfig, ProtocolEvent, ProtocolHandle, RelayClient, RelayConnection,
    RelayServer, ServerConfig,
};

/// Upper bound on any single step of a test
pub const STEP_TIMEOUT: Duration = Duration::from_secs(10);

static TRACING: Once = Once::new();

/// Route relay logs to the test harness; `RUST_LOG` picks the level
fn init_tracing() {
    TRACING.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .with_test_writer()
            .try_init();
    });
}

/// One relay and the endpoints connected to it
pub struct RelayFixture {
    /// Network the relay's node lives in
    pub swarm: Swarm,
    relay: RelayServer<MemoryDht>,
    connections: Vec<RelayConnection>,
}

impl RelayFixture {
    /// Relay with default settings
    pub fn new() -> Self {
        Self::with_config(ServerConfig::default())
    }

    /// Relay with `config`
    pub fn with_config(config: ServerConfig) -> Self {
        init_tracing();
        let swarm = Swarm::new();
        let relay = RelayServer::new(Arc::new(swarm.node()), config);
        Self {
            swarm,
            relay,
            connections: Vec::new(),
        }
    }

    /// Endpoint driving the relay through a [`RelayClient`]
    pub fn client(&mut self) -> RelayClient {
        let (near, far) = wisp_transport::memory::pipe();
        self.connections.push(self.relay.serve(far));
        RelayClient::new(near, ClientConfig::default())
    }

    /// Endpoint speaking raw frames to the relay
    pub fn raw(&mut self) -> (ProtocolHandle, mpsc::Receiver<ProtocolEvent>) {
        let (near, far) = wisp_transport::memory::pipe();
        self.connections.push(self.relay.serve(far));
        Protocol::spawn(near, ProtocolConfig::default())
    }

    /// Relay-side connections, in the order endpoints were created
    pub fn connections(&self) -> &[RelayConnection] {
        &self.connections
    }
}

impl Default for RelayFixture {
    fn default() -> Self {
        Self::new()
    }
}

/// Await `future`, failing the test if it takes longer than [`STEP_TIMEOUT`]
pub async fn within<F: Future>(future: F) -> F::Output {
    match tokio::time::timeout(STEP_TIMEOUT, future).await {
        Ok(output) => output,
        Err(_) => panic!("step did not finish within {STEP_TIMEOUT:?}"),
    }
}

/// Poll `condition` until it holds, failing the test after [`STEP_TIMEOUT`]
pub async fn eventually(mut condition: impl FnMut() -> bool) {
    within(async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await;
}

/// Next message on a raw endpoint; panics on close
pub async fn next_message(events: &mut mpsc::Receiver<ProtocolEvent>) -> Message {
    match within(events.recv()).await {
        Some(ProtocolEvent::Message(message)) => message,
        other => panic!("expected a message, got {other:?}"),
    }
}
