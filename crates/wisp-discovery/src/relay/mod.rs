//! # Relay
//!
//! Lets a thin endpoint drive a DHT node that lives on a relay. One
//! bidirectional transport carries every stream, server and query of the
//! endpoint, plus the handshake steps, firewall decisions and signatures
//! the relay needs from the endpoint's key.
//!
//! ## Features
//!
//! - Length-framed binary protocol with heartbeat ([`protocol`])
//! - Many logical streams per transport, named by aliases ([`registry`])
//! - Non-custodial mode: the secret key never leaves the endpoint; the relay
//!   proxies Noise steps ([`handshake`]), firewall decisions ([`firewall`])
//!   and record signatures ([`signing`])
//! - Custodial mode: the endpoint hands its key to the relay
//!
//! ## Architecture
//!
//! ```text
//!   ┌──────────────┐   frames    ┌──────────────┐
//!   │  RelayClient │◄───────────►│  RelayServer │
//!   │  (endpoint)  │  one duplex │   (relay)    │
//!   └──────┬───────┘             └──────┬───────┘
//!          │                            │
//!   RelayedStream /               ┌─────▼─────┐
//!   RelayedServer / Query         │  DHT node │
//!                                 └───────────┘
//! ```
//!
//! ## Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use tokio::io::AsyncWriteExt;
//! use wisp_crypto::KeyPair;
//! use wisp_discovery::dht::Swarm;
//! use wisp_discovery::relay::{ClientConfig, ConnectOptions, RelayClient, RelayServer, ServerConfig};
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let swarm = Swarm::new();
//! let relay = RelayServer::new(Arc::new(swarm.node()), ServerConfig::default());
//!
//! let (near, far) = wisp_transport::memory::pipe();
//! let _connection = relay.serve(far);
//! let client = RelayClient::new(near, ClientConfig::default());
//!
//! let remote = KeyPair::generate().public_key;
//! let mut stream = client.connect(remote, ConnectOptions::new(KeyPair::generate())).await?;
//! stream.write_all(b"hello").await?;
//! stream.opened().await?;
//! # Ok(())
//! # }
//! ```

pub mod client;
pub mod error;
pub mod firewall;
pub mod handshake;
pub mod link;
pub mod protocol;
pub mod query;
pub mod registry;
pub mod server;
pub mod signing;
pub mod stream;

pub use client::{ClientConfig, ConnectOptions, RelayClient, ServerOptions};
pub use error::RelayError;
pub use firewall::{BoxError, FirewallFn, firewall_fn};
pub use protocol::{Protocol, ProtocolConfig, ProtocolEvent, ProtocolHandle};
pub use query::{Query, QueryKind};
pub use registry::{AliasGenerator, ConnectionKey, IdGenerator, Registry};
pub use server::{RelayConnection, RelayServer, ServerConfig};
pub use stream::{RelayedServer, RelayedStream, StreamInfo, StreamState};
