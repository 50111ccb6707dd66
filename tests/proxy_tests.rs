//! Key-holder proxies: handshakes, firewall decisions and signatures made by
//! an endpoint on behalf of the relay's DHT node.

use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use wisp_core::Message;
use wisp_crypto::hash::SignNamespace;
use wisp_crypto::{HandshakeHash, HandshakeResult, KeyPair, NoiseHandshake};
use wisp_discovery::relay::error::{PEER_CONNECTION_FAILED, SIGNATURE_UNAVAILABLE};
use wisp_discovery::relay::signing::SignatureRequest;
use wisp_discovery::relay::{BoxError, ConnectOptions, RelayClient, RelayError, ServerOptions, firewall_fn};
use wisp_integration_tests::{RelayFixture, next_message, within};

/// Connect `initiator` to `responder` through `fixture` and return the
/// transcript hash each endpoint observed
async fn relayed_hashes(
    fixture: &mut RelayFixture,
    initiator: ConnectOptions,
    responder: ServerOptions,
) -> (HandshakeHash, HandshakeHash) {
    let a: RelayClient = fixture.client();
    let b: RelayClient = fixture.client();
    let mut server = within(a.listen(responder)).await.unwrap();
    let stream = within(b.connect(server.public_key(), initiator)).await.unwrap();
    let near = within(stream.opened()).await.unwrap();
    let accepted = within(server.accept()).await.unwrap();
    let far = within(accepted.opened()).await.unwrap();
    (near.handshake_hash.unwrap(), far.handshake_hash.unwrap())
}

/// Handshake between two local parties, no relay involved
fn direct_handshake(initiator: &KeyPair, responder: &KeyPair) -> (HandshakeResult, HandshakeResult) {
    let mut init = NoiseHandshake::initiator(initiator, &responder.public_key).unwrap();
    let mut resp = NoiseHandshake::responder(responder).unwrap();
    let msg1 = init.send(&[]).unwrap();
    resp.recv(&msg1).unwrap();
    let msg2 = resp.send(&[]).unwrap();
    init.recv(&msg2).unwrap();
    (init.result().unwrap().clone(), resp.result().unwrap().clone())
}

fn assert_paired(initiator: &HandshakeResult, responder: &HandshakeResult) {
    assert_eq!(initiator.hash, responder.hash);
    assert_eq!(initiator.tx, responder.rx);
    assert_eq!(initiator.rx, responder.tx);
    assert_eq!(initiator.remote_id, responder.stream_id);
    assert_eq!(initiator.stream_id, responder.remote_id);
    assert_eq!(initiator.holepunch_secret, responder.holepunch_secret);
}

// ============================================================================
// Handshake Proxy
// ============================================================================

/// Ephemeral keys make every transcript unique, so equivalence is checked by
/// pairing a proxied half with a direct half and by deriving both sides'
/// values from the relayed hash exactly as a direct handshake does.
#[tokio::test]
async fn test_proxied_handshake_matches_direct() {
    let initiator = KeyPair::generate();
    let responder = KeyPair::generate();

    let (direct_init, direct_resp) = direct_handshake(&initiator, &responder);
    assert_paired(&direct_init, &direct_resp);
    let rederived = HandshakeResult::from_hash(true, initiator.public_key, responder.public_key, direct_init.hash);
    assert_eq!(rederived, direct_init);

    for (initiator_custodial, responder_custodial) in [(false, true), (true, false), (false, false)] {
        let mut fixture = RelayFixture::new();
        let (near, far) = relayed_hashes(
            &mut fixture,
            ConnectOptions::new(initiator.clone()).custodial(initiator_custodial),
            ServerOptions::new(responder.clone()).custodial(responder_custodial),
        )
        .await;
        assert_eq!(near, far, "custodial: {initiator_custodial}/{responder_custodial}");

        let init = HandshakeResult::from_hash(true, initiator.public_key, responder.public_key, near);
        let resp = HandshakeResult::from_hash(false, responder.public_key, initiator.public_key, far);
        assert_paired(&init, &resp);
    }
}

#[tokio::test]
async fn test_relay_never_sees_secret_key() {
    let mut fixture = RelayFixture::new();
    let (relay, mut events) = fixture.raw();
    let b = fixture.client();
    let key = KeyPair::generate();

    relay
        .send(Message::Listen {
            alias: 2,
            public_key: key.public_key,
            secret_key: None,
            firewall: false,
        })
        .unwrap();
    assert!(matches!(next_message(&mut events).await, Message::Listening { alias: 2, .. }));

    // the raw endpoint holds the key and answers the relay's Noise steps itself
    let initiator = KeyPair::generate();
    let stream = within(b.connect(key.public_key, ConnectOptions::new(initiator.clone()))).await.unwrap();
    let mut handshake = NoiseHandshake::responder(&key).unwrap();

    let (id, msg1) = match next_message(&mut events).await {
        Message::NoiseReceive {
            is_initiator: false,
            id,
            alias: 2,
            data,
        } => (id, data),
        other => panic!("unexpected {other:?}"),
    };
    let payload = handshake.recv(&msg1).unwrap();
    relay
        .send(Message::NoiseReply {
            id,
            data: payload,
            complete: false,
            handshake_hash: None,
            remote_id: None,
            holepunch_secret: None,
            remote_public_key: handshake.remote_public_key().copied(),
            error: None,
        })
        .unwrap();

    match next_message(&mut events).await {
        Message::NoiseSend {
            is_initiator: false,
            id: step,
            alias: 2,
            ..
        } => assert_eq!(step, id),
        other => panic!("unexpected {other:?}"),
    }
    let msg2 = handshake.send(&[]).unwrap();
    let result = handshake.result().unwrap().clone();
    relay
        .send(Message::NoiseReply {
            id,
            data: msg2,
            complete: true,
            handshake_hash: Some(result.hash),
            remote_id: Some(result.remote_id),
            holepunch_secret: Some(result.holepunch_secret),
            remote_public_key: Some(result.remote_public_key),
            error: None,
        })
        .unwrap();

    let info = within(stream.opened()).await.unwrap();
    assert_eq!(info.handshake_hash, Some(result.hash));
    match next_message(&mut events).await {
        Message::Connection {
            server_alias: 2,
            remote_public_key,
            handshake_hash,
            ..
        } => {
            assert_eq!(remote_public_key, initiator.public_key);
            assert_eq!(handshake_hash, result.hash);
        }
        other => panic!("unexpected {other:?}"),
    }
}

#[tokio::test]
async fn test_handshake_error_fails_connect() {
    let mut fixture = RelayFixture::new();
    let (relay, mut events) = fixture.raw();
    let b = fixture.client();
    let key = KeyPair::generate();

    relay
        .send(Message::Listen {
            alias: 2,
            public_key: key.public_key,
            secret_key: None,
            firewall: false,
        })
        .unwrap();
    assert!(matches!(next_message(&mut events).await, Message::Listening { .. }));

    let stream = within(b.connect(key.public_key, ConnectOptions::new(KeyPair::generate()))).await.unwrap();
    let id = match next_message(&mut events).await {
        Message::NoiseReceive { id, .. } => id,
        other => panic!("unexpected {other:?}"),
    };
    relay
        .send(Message::NoiseReply {
            id,
            data: Vec::new(),
            complete: false,
            handshake_hash: None,
            remote_id: None,
            holepunch_secret: None,
            remote_public_key: None,
            error: Some("decrypt failed".to_string()),
        })
        .unwrap();

    let err = within(stream.opened()).await.unwrap_err();
    assert_eq!(err.to_string(), PEER_CONNECTION_FAILED);
}

// ============================================================================
// Firewall Proxy
// ============================================================================

async fn connect_through_firewall(firewall: ServerOptions) -> RelayError {
    let mut fixture = RelayFixture::new();
    let a = fixture.client();
    let b = fixture.client();
    let server_key = firewall.key_pair.public_key;
    let _server = within(b.listen(firewall)).await.unwrap();

    let stream = within(a.connect(server_key, ConnectOptions::new(KeyPair::generate())))
        .await
        .unwrap();
    within(stream.opened()).await.unwrap_err()
}

#[tokio::test]
async fn test_failing_firewall_denies() {
    let options = ServerOptions::new(KeyPair::generate())
        .firewall(firewall_fn(|_, _| Err(BoxError::from("policy store unavailable"))));
    let err = connect_through_firewall(options).await;
    assert!(matches!(err, RelayError::ConnectionFailed));
    assert_eq!(err.to_string(), PEER_CONNECTION_FAILED);
}

#[tokio::test]
async fn test_panicking_firewall_denies() {
    let options = ServerOptions::new(KeyPair::generate()).firewall(firewall_fn(|_, _| panic!("firewall bug")));
    let err = connect_through_firewall(options).await;
    assert_eq!(err.to_string(), PEER_CONNECTION_FAILED);
}

#[tokio::test]
async fn test_custodial_server_firewall_runs_on_endpoint() {
    let options = ServerOptions::new(KeyPair::generate())
        .custodial(true)
        .firewall(firewall_fn(|_, _| Ok(true)));
    let err = connect_through_firewall(options).await;
    assert!(matches!(err, RelayError::ConnectionFailed));
}

#[tokio::test]
async fn test_slow_firewall_does_not_block_other_streams() {
    let mut fixture = RelayFixture::new();
    let a = fixture.client();
    let b = fixture.client();

    let slow = KeyPair::generate();
    let _slow_server = within(b.listen(ServerOptions::new(slow.clone()).firewall(firewall_fn(|_, _| {
        std::thread::sleep(Duration::from_millis(300));
        Ok(false)
    }))))
    .await
    .unwrap();
    let fast = KeyPair::generate();
    let mut fast_server = within(b.listen(ServerOptions::new(fast.clone()))).await.unwrap();

    let pending = within(a.connect(slow.public_key, ConnectOptions::new(KeyPair::generate())))
        .await
        .unwrap();
    let mut stream = within(a.connect(fast.public_key, ConnectOptions::new(KeyPair::generate())))
        .await
        .unwrap();
    stream.write_all(b"quick").await.unwrap();
    let mut accepted = within(fast_server.accept()).await.unwrap();
    let mut buf = [0u8; 5];
    within(accepted.read_exact(&mut buf)).await.unwrap();
    assert_eq!(&buf, b"quick");

    within(pending.opened()).await.unwrap();
}

// ============================================================================
// Signing Proxy
// ============================================================================

#[tokio::test]
async fn test_announce_signed_by_endpoint() {
    let mut fixture = RelayFixture::new();
    let (relay, mut events) = fixture.raw();
    let key = KeyPair::generate();
    let target = [0x33u8; 32];

    relay
        .send(Message::Announce {
            id: 1,
            target,
            public_key: key.public_key,
            secret_key: None,
        })
        .unwrap();

    let request = match next_message(&mut events).await {
        message @ Message::SignAnnounce { signee: 1, .. } => SignatureRequest::from_message(message).unwrap(),
        other => panic!("unexpected {other:?}"),
    };
    assert_eq!(request.namespace, SignNamespace::Announce);
    assert!(request.relay_addresses.is_empty());
    relay.send(request.reply(Ok(request.sign(&key, &target).unwrap()))).unwrap();

    match next_message(&mut events).await {
        Message::Result { id: 1, reply } => assert_eq!(reply.peers[0].public_key, key.public_key),
        other => panic!("unexpected {other:?}"),
    }
    assert!(matches!(next_message(&mut events).await, Message::Finished { id: 1, error: None }));
    assert_eq!(fixture.swarm.records(&target).len(), 1);
}

#[tokio::test]
async fn test_refused_signature_fails_announce() {
    let mut fixture = RelayFixture::new();
    let (relay, mut events) = fixture.raw();
    let key = KeyPair::generate();
    let target = [0x34u8; 32];

    relay
        .send(Message::Announce {
            id: 7,
            target,
            public_key: key.public_key,
            secret_key: None,
        })
        .unwrap();
    let id = match next_message(&mut events).await {
        Message::SignAnnounce { id, signee: 7, .. } => id,
        other => panic!("unexpected {other:?}"),
    };
    relay
        .send(Message::Signature {
            id,
            signature: None,
            error: Some("user declined".to_string()),
        })
        .unwrap();

    match next_message(&mut events).await {
        Message::Finished { id: 7, error } => {
            assert_eq!(error.as_deref(), Some(SIGNATURE_UNAVAILABLE));
        }
        other => panic!("unexpected {other:?}"),
    }
    assert!(fixture.swarm.records(&target).is_empty());
}
