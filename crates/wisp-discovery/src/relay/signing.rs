//! Announce/unannounce signatures from the endpoint that owns the key.
//!
//! Records are signed over
//! `signable(namespace, target, peer_id, token, peer_record)`, where the peer
//! record is the announcing key plus the relay addresses the storage node
//! puts in it. The relay asks with `SignAnnounce`/`SignUnannounce`, naming
//! the query the record belongs to; the endpoint signs with that query's key.

use super::error::RelayError;
use super::link::Link;
use crate::dht::{AnnounceSigner, DhtError, SignRequest};
use async_trait::async_trait;
use std::net::SocketAddr;
use std::sync::Arc;
use wisp_core::{Message, Peer};
use wisp_crypto::hash::{SignNamespace, signable};
use wisp_crypto::{CryptoError, KeyPair, Signature};

/// Relay-side signer forwarding to the endpoint
#[derive(Debug)]
pub struct ProxySigner {
    link: Arc<Link>,
    signee: u32,
}

impl ProxySigner {
    /// Signer for the endpoint query `signee`
    #[must_use]
    pub fn new(link: Arc<Link>, signee: u32) -> Self {
        Self { link, signee }
    }
}

#[async_trait]
impl AnnounceSigner for ProxySigner {
    async fn sign(&self, namespace: SignNamespace, request: &SignRequest) -> Result<Signature, DhtError> {
        self.link
            .sign(
                namespace,
                self.signee,
                request.token,
                request.peer_id,
                request.peer.relay_addresses.clone(),
            )
            .await
            .map_err(|e| DhtError::SignatureUnavailable(e.to_string()))
    }
}

/// A signature request as the endpoint receives it
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SignatureRequest {
    /// Request id
    pub id: u32,
    /// Which record operation
    pub namespace: SignNamespace,
    /// Query the signature is for
    pub signee: u32,
    /// Storage node token
    pub token: [u8; 32],
    /// Storage node id
    pub peer_id: [u8; 32],
    /// Relay addresses of the record
    pub relay_addresses: Vec<SocketAddr>,
}

impl SignatureRequest {
    /// Request carried by a `SignAnnounce`/`SignUnannounce` frame
    #[must_use]
    pub fn from_message(message: Message) -> Option<Self> {
        let (namespace, id, signee, token, peer_id, relay_addresses) = match message {
            Message::SignAnnounce {
                id,
                signee,
                token,
                peer_id,
                relay_addresses,
            } => (SignNamespace::Announce, id, signee, token, peer_id, relay_addresses),
            Message::SignUnannounce {
                id,
                signee,
                token,
                peer_id,
                relay_addresses,
            } => (SignNamespace::Unannounce, id, signee, token, peer_id, relay_addresses),
            _ => return None,
        };
        Some(Self {
            id,
            namespace,
            signee,
            token,
            peer_id,
            relay_addresses,
        })
    }

    /// Sign for `target` with `key_pair`.
    ///
    /// # Errors
    ///
    /// Returns [`CryptoError::MissingSecretKey`] for a public-only key pair.
    pub fn sign(&self, key_pair: &KeyPair, target: &[u8; 32]) -> Result<Signature, CryptoError> {
        let record = Peer {
            public_key: key_pair.public_key,
            relay_addresses: self.relay_addresses.clone(),
        };
        key_pair.sign(&signable(
            self.namespace,
            target,
            &self.peer_id,
            &self.token,
            &record.to_bytes(),
        ))
    }

    /// `Signature` frame answering this request
    #[must_use]
    pub fn reply(&self, outcome: Result<Signature, RelayError>) -> Message {
        match outcome {
            Ok(signature) => Message::Signature {
                id: self.id,
                signature: Some(signature),
                error: None,
            },
            Err(e) => Message::Signature {
                id: self.id,
                signature: None,
                error: Some(e.to_wire()),
            },
        }
    }
}
