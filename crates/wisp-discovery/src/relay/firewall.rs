//! Accept/deny decisions made by the endpoint that owns a server.
//!
//! The relay asks with an `Incoming` frame after the responder has read
//! message 1 and waits for `Accept` or `Deny`. Every path that cannot produce
//! an answer denies: a lost link, a failing callback, a panicking callback.

use super::link::Link;
use crate::dht::Firewall;
use async_trait::async_trait;
use std::error::Error;
use std::sync::Arc;
use tracing::{debug, warn};
use wisp_crypto::PublicKey;

/// Boxed error a firewall callback may return
pub type BoxError = Box<dyn Error + Send + Sync>;

/// Endpoint firewall callback: `Ok(true)` denies the connection
pub type FirewallFn = Arc<dyn Fn(&PublicKey, &[u8]) -> Result<bool, BoxError> + Send + Sync>;

/// Wrap a closure as a [`FirewallFn`]
pub fn firewall_fn<F>(f: F) -> FirewallFn
where
    F: Fn(&PublicKey, &[u8]) -> Result<bool, BoxError> + Send + Sync + 'static,
{
    Arc::new(f)
}

/// Relay-side firewall forwarding to the endpoint
#[derive(Debug)]
pub struct ProxyFirewall {
    link: Arc<Link>,
    server_alias: u32,
}

impl ProxyFirewall {
    /// Firewall for the endpoint server `server_alias`
    #[must_use]
    pub fn new(link: Arc<Link>, server_alias: u32) -> Self {
        Self { link, server_alias }
    }
}

#[async_trait]
impl Firewall for ProxyFirewall {
    async fn deny(&self, remote_public_key: &PublicKey, payload: &[u8], handshake_id: Option<u32>) -> bool {
        let deny = self
            .link
            .firewall(
                self.server_alias,
                *remote_public_key,
                payload,
                handshake_id.unwrap_or(0),
            )
            .await;
        debug!(server = self.server_alias, %remote_public_key, deny, "firewall decision");
        deny
    }
}

/// Run `firewall` off the async runtime; errors and panics deny
pub async fn evaluate(firewall: FirewallFn, remote_public_key: PublicKey, payload: Vec<u8>) -> bool {
    let outcome = tokio::task::spawn_blocking(move || firewall(&remote_public_key, &payload)).await;
    match outcome {
        Ok(Ok(deny)) => deny,
        Ok(Err(e)) => {
            warn!(remote = %remote_public_key, error = %e, "firewall callback failed, denying");
            true
        }
        Err(e) => {
            warn!(remote = %remote_public_key, error = %e, "firewall callback panicked, denying");
            true
        }
    }
}
