//! # WISP Discovery
//!
//! DHT access for endpoints that cannot reach the network themselves.
//!
//! This crate provides:
//! - The [`dht::Dht`] seam the relay drives, with key-holding operations
//!   injected through [`dht::Handshaker`], [`dht::Firewall`] and
//!   [`dht::AnnounceSigner`]
//! - [`dht::MemoryDht`], a complete in-process node over a shared
//!   [`dht::Swarm`]
//! - The relay: [`relay::RelayServer`] on the reachable side,
//!   [`relay::RelayClient`] on the endpoint
//!
//! ## Example
//!
//! ```rust,no_run
//! use wisp_discovery::dht::{Dht, Swarm};
//!
//! # async fn example() {
//! let swarm = Swarm::new();
//! let node = swarm.node();
//! let mut replies = node.lookup([7u8; 32]);
//! while let Some(reply) = replies.next().await {
//!     println!("{reply:?}");
//! }
//! # }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod dht;
pub mod relay;

pub use dht::{Dht, DhtError, MemoryDht, Swarm};
pub use relay::{
    ClientConfig, ConnectOptions, RelayClient, RelayConnection, RelayError, RelayServer, RelayedServer,
    RelayedStream, ServerConfig, ServerOptions,
};
