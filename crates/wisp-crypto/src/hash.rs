//! Namespaced BLAKE3 derivations.
//!
//! Every value derived from a handshake transcript or signed on behalf of a
//! peer is bound to a context string, so the same input bytes can never be
//! confused across purposes:
//!
//! | context | purpose |
//! |---|---|
//! | [`NS_HOLEPUNCH`] | holepunch secret from the handshake hash |
//! | [`NS_STREAM_INITIATOR`] / [`NS_STREAM_RESPONDER`] | stream ids |
//! | [`NS_TX_INITIATOR`] / [`NS_TX_RESPONDER`] | directional transport keys |
//! | [`NS_ANNOUNCE`] / [`NS_UNANNOUNCE`] | record signatures |

/// BLAKE3 hash output (32 bytes).
pub type HashOutput = [u8; 32];

/// Context for the 32-byte holepunch secret
pub const NS_HOLEPUNCH: &str = "wisp v1 holepunch secret";
/// Context for the stream id of the handshake initiator
pub const NS_STREAM_INITIATOR: &str = "wisp v1 stream id initiator";
/// Context for the stream id of the handshake responder
pub const NS_STREAM_RESPONDER: &str = "wisp v1 stream id responder";
/// Context for the key the initiator sends with
pub const NS_TX_INITIATOR: &str = "wisp v1 transport key initiator";
/// Context for the key the responder sends with
pub const NS_TX_RESPONDER: &str = "wisp v1 transport key responder";
/// Context for announce record signatures
pub const NS_ANNOUNCE: &str = "wisp v1 announce";
/// Context for unannounce record signatures
pub const NS_UNANNOUNCE: &str = "wisp v1 unannounce";

/// Compute BLAKE3 hash of input data.
#[must_use]
pub fn hash(data: &[u8]) -> HashOutput {
    *blake3::hash(data).as_bytes()
}

/// Derive 32 bytes from `material` under `context`.
#[must_use]
pub fn derive(context: &'static str, material: &[u8]) -> HashOutput {
    blake3::derive_key(context, material)
}

/// Stream id of one side of a handshake.
///
/// The remote id of a side is the stream id computed with the role flipped.
#[must_use]
pub fn stream_id(handshake_hash: &[u8], is_initiator: bool) -> HashOutput {
    let context = if is_initiator {
        NS_STREAM_INITIATOR
    } else {
        NS_STREAM_RESPONDER
    };
    derive(context, handshake_hash)
}

/// Holepunch secret shared by both sides of a handshake
#[must_use]
pub fn holepunch_secret(handshake_hash: &[u8]) -> HashOutput {
    derive(NS_HOLEPUNCH, handshake_hash)
}

/// Directional transport keys `(tx, rx)` for one side of a handshake
#[must_use]
pub fn transport_keys(handshake_hash: &[u8], is_initiator: bool) -> (HashOutput, HashOutput) {
    let initiator = derive(NS_TX_INITIATOR, handshake_hash);
    let responder = derive(NS_TX_RESPONDER, handshake_hash);
    if is_initiator {
        (initiator, responder)
    } else {
        (responder, initiator)
    }
}

/// Which record operation a signature authorizes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SignNamespace {
    /// Store the peer record under the target
    Announce,
    /// Remove the peer record from the target
    Unannounce,
}

impl SignNamespace {
    fn context(self) -> &'static str {
        match self {
            SignNamespace::Announce => NS_ANNOUNCE,
            SignNamespace::Unannounce => NS_UNANNOUNCE,
        }
    }
}

/// Digest a record signature covers.
///
/// Layout: `target ‖ peer_id ‖ token ‖ record`, hashed under the namespace's
/// context. `record` is the wire encoding of the announced peer record.
#[must_use]
pub fn signable(
    namespace: SignNamespace,
    target: &[u8; 32],
    peer_id: &[u8; 32],
    token: &[u8; 32],
    record: &[u8],
) -> HashOutput {
    let mut hasher = blake3::Hasher::new_derive_key(namespace.context());
    hasher.update(target);
    hasher.update(peer_id);
    hasher.update(token);
    hasher.update(record);
    *hasher.finalize().as_bytes()
}
