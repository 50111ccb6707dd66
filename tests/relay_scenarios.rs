//! End-to-end relay scenarios.
//!
//! Two endpoints share one relay; every byte between them crosses the framed
//! protocol twice (endpoint A to relay, relay to endpoint B).

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use wisp_core::Peer;
use wisp_crypto::KeyPair;
use wisp_discovery::relay::error::PEER_CONNECTION_FAILED;
use wisp_discovery::relay::{ConnectOptions, RelayClient, RelayError, ServerOptions, firewall_fn};
use wisp_integration_tests::{RelayFixture, eventually, within};

/// B writes "ping", A answers "pong"
async fn ping_pong(a: &RelayClient, b: &RelayClient, server: ServerOptions, connect: ConnectOptions) {
    let server_key = server.key_pair.public_key;
    let client_key = connect.key_pair.public_key;
    let mut server = within(a.listen(server)).await.unwrap();
    assert_eq!(server.public_key(), server_key);

    let mut stream = within(b.connect(server_key, connect)).await.unwrap();
    stream.write_all(b"ping").await.unwrap();

    let mut accepted = within(server.accept()).await.unwrap();
    assert_eq!(accepted.remote_public_key(), client_key);
    let mut buf = [0u8; 4];
    within(accepted.read_exact(&mut buf)).await.unwrap();
    assert_eq!(&buf, b"ping");
    accepted.write_all(b"pong").await.unwrap();

    within(stream.read_exact(&mut buf)).await.unwrap();
    assert_eq!(&buf, b"pong");

    let near = within(stream.opened()).await.unwrap();
    let far = within(accepted.opened()).await.unwrap();
    assert!(near.handshake_hash.is_some());
    assert_eq!(near.handshake_hash, far.handshake_hash);
}

// ============================================================================
// Connect
// ============================================================================

#[tokio::test]
async fn test_custodial_connect() {
    let mut fixture = RelayFixture::new();
    let a = fixture.client();
    let b = fixture.client();

    ping_pong(
        &a,
        &b,
        ServerOptions::new(KeyPair::generate()).custodial(true),
        ConnectOptions::new(KeyPair::generate()).custodial(true),
    )
    .await;
}

#[tokio::test]
async fn test_non_custodial_connect() {
    let mut fixture = RelayFixture::new();
    let a = fixture.client();
    let b = fixture.client();

    ping_pong(
        &a,
        &b,
        ServerOptions::new(KeyPair::generate()).custodial(true),
        ConnectOptions::new(KeyPair::generate()),
    )
    .await;
}

#[tokio::test]
async fn test_non_custodial_on_both_sides() {
    let mut fixture = RelayFixture::new();
    let a = fixture.client();
    let b = fixture.client();

    ping_pong(
        &a,
        &b,
        ServerOptions::new(KeyPair::generate()),
        ConnectOptions::new(KeyPair::generate()),
    )
    .await;
}

#[tokio::test]
async fn test_same_endpoint_connects_to_itself() {
    let mut fixture = RelayFixture::new();
    let a = fixture.client();

    ping_pong(
        &a,
        &a,
        ServerOptions::new(KeyPair::generate()),
        ConnectOptions::new(KeyPair::generate()),
    )
    .await;
}

#[tokio::test]
async fn test_firewall_deny() {
    let mut fixture = RelayFixture::new();
    let a = fixture.client();
    let b = fixture.client();

    let server_key = KeyPair::generate();
    let mut server = within(
        b.listen(ServerOptions::new(server_key.clone()).firewall(firewall_fn(|_, _| Ok(true)))),
    )
    .await
    .unwrap();

    let stream = within(a.connect(server_key.public_key, ConnectOptions::new(KeyPair::generate())))
        .await
        .unwrap();
    let err = within(stream.opened()).await.unwrap_err();
    assert!(matches!(err, RelayError::ConnectionFailed));
    assert_eq!(err.to_string(), PEER_CONNECTION_FAILED);

    // nothing reached the server
    server.close();
    assert!(within(server.accept()).await.is_none());
}

#[tokio::test]
async fn test_firewall_allows_by_key() {
    let mut fixture = RelayFixture::new();
    let a = fixture.client();
    let b = fixture.client();

    let trusted = KeyPair::generate();
    let allowed = trusted.public_key;
    let server_key = KeyPair::generate();
    let mut server = within(b.listen(
        ServerOptions::new(server_key.clone()).firewall(firewall_fn(move |remote, _| Ok(*remote != allowed))),
    ))
    .await
    .unwrap();

    let denied = within(a.connect(server_key.public_key, ConnectOptions::new(KeyPair::generate())))
        .await
        .unwrap();
    assert!(within(denied.opened()).await.is_err());

    let stream = within(a.connect(server_key.public_key, ConnectOptions::new(trusted)))
        .await
        .unwrap();
    within(stream.opened()).await.unwrap();
    let accepted = within(server.accept()).await.unwrap();
    assert_eq!(accepted.remote_public_key(), allowed);
}

#[tokio::test]
async fn test_connect_to_unknown_key() {
    let mut fixture = RelayFixture::new();
    let a = fixture.client();

    let stream = within(a.connect(KeyPair::generate().public_key, ConnectOptions::new(KeyPair::generate())))
        .await
        .unwrap();
    assert!(matches!(within(stream.opened()).await, Err(RelayError::PeerNotFound)));
}

// ============================================================================
// Streams
// ============================================================================

#[tokio::test]
async fn test_half_close_in_both_directions() {
    let mut fixture = RelayFixture::new();
    let a = fixture.client();
    let b = fixture.client();

    let server_key = KeyPair::generate();
    let mut server = within(a.listen(ServerOptions::new(server_key.clone()))).await.unwrap();
    let mut stream = within(b.connect(server_key.public_key, ConnectOptions::new(KeyPair::generate())))
        .await
        .unwrap();
    let mut accepted = within(server.accept()).await.unwrap();

    let payload: Vec<u8> = (0..200_000u32).map(|i| (i % 251) as u8).collect();
    stream.write_all(&payload).await.unwrap();
    stream.shutdown().await.unwrap();

    let mut received = Vec::new();
    within(accepted.read_to_end(&mut received)).await.unwrap();
    assert_eq!(received, payload);

    accepted.write_all(b"done").await.unwrap();
    accepted.shutdown().await.unwrap();
    let mut reply = Vec::new();
    within(stream.read_to_end(&mut reply)).await.unwrap();
    assert_eq!(reply, b"done");
}

#[tokio::test]
async fn test_destroy_reaches_remote() {
    let mut fixture = RelayFixture::new();
    let a = fixture.client();
    let b = fixture.client();

    let server_key = KeyPair::generate();
    let mut server = within(a.listen(ServerOptions::new(server_key.clone()))).await.unwrap();
    let mut stream = within(b.connect(server_key.public_key, ConnectOptions::new(KeyPair::generate())))
        .await
        .unwrap();
    let mut accepted = within(server.accept()).await.unwrap();
    within(stream.opened()).await.unwrap();

    stream.destroy(None);
    let mut buf = Vec::new();
    // the relay tears the pair down; the far side sees EOF or an error, never a hang
    let _ = within(accepted.read_to_end(&mut buf)).await;
    assert!(buf.is_empty());
}

#[tokio::test]
async fn test_closing_server_keeps_open_streams() {
    let mut fixture = RelayFixture::new();
    let a = fixture.client();
    let b = fixture.client();

    let server_key = KeyPair::generate();
    let mut server = within(a.listen(ServerOptions::new(server_key.clone()))).await.unwrap();
    let mut stream = within(b.connect(server_key.public_key, ConnectOptions::new(KeyPair::generate())))
        .await
        .unwrap();
    let mut accepted = within(server.accept()).await.unwrap();
    server.close();
    eventually(|| !fixture.swarm.is_listening(&server_key.public_key)).await;

    stream.write_all(b"still here").await.unwrap();
    let mut buf = [0u8; 10];
    within(accepted.read_exact(&mut buf)).await.unwrap();
    assert_eq!(&buf, b"still here");

    let late = within(b.connect(server_key.public_key, ConnectOptions::new(KeyPair::generate())))
        .await
        .unwrap();
    assert!(within(late.opened()).await.is_err());
}

#[tokio::test]
async fn test_listen_twice_on_one_key() {
    let mut fixture = RelayFixture::new();
    let a = fixture.client();
    let b = fixture.client();

    let key = KeyPair::generate();
    let _server = within(a.listen(ServerOptions::new(key.clone()))).await.unwrap();
    let err = within(b.listen(ServerOptions::new(key))).await.unwrap_err();
    assert!(matches!(err, RelayError::AlreadyListening));
}

#[tokio::test]
async fn test_client_close_cascades() {
    let mut fixture = RelayFixture::new();
    let a = fixture.client();
    let b = fixture.client();

    let server_key = KeyPair::generate();
    let mut server = within(a.listen(ServerOptions::new(server_key.clone()))).await.unwrap();
    let mut stream = within(b.connect(server_key.public_key, ConnectOptions::new(KeyPair::generate())))
        .await
        .unwrap();
    let mut accepted = within(server.accept()).await.unwrap();
    within(stream.opened()).await.unwrap();

    a.close();
    within(a.closed()).await;
    assert!(a.is_closed());
    assert!(within(server.accept()).await.is_none());
    let mut buf = Vec::new();
    let _ = within(accepted.read_to_end(&mut buf)).await;
    assert!(accepted.state().is_closed());

    // the relay drops A's server and B's half of the pair
    eventually(|| !fixture.swarm.is_listening(&server_key.public_key)).await;
    let _ = within(stream.read_to_end(&mut buf)).await;
    assert!(!b.is_closed());
}

// ============================================================================
// Queries
// ============================================================================

#[tokio::test]
async fn test_announce_then_lookup() {
    let mut fixture = RelayFixture::new();
    let a = fixture.client();
    let b = fixture.client();

    let topic = [0x54u8; 32];
    let key = KeyPair::generate();
    within(a.announce(topic, key.clone(), false).collect()).await.unwrap();

    let replies = within(b.lookup(topic).collect()).await.unwrap();
    assert_eq!(replies.len(), 1);
    assert_eq!(replies[0].peers, vec![Peer::new(key.public_key)]);
}

#[tokio::test]
async fn test_custodial_announce_then_unannounce() {
    let mut fixture = RelayFixture::new();
    let a = fixture.client();

    let topic = [0x55u8; 32];
    let key = KeyPair::generate();
    within(a.announce(topic, key.clone(), true).collect()).await.unwrap();
    assert_eq!(fixture.swarm.records(&topic).len(), 1);

    within(a.unannounce(topic, key, true).collect()).await.unwrap();
    assert!(fixture.swarm.records(&topic).is_empty());
    assert!(within(a.lookup(topic).collect()).await.unwrap().is_empty());
}

#[tokio::test]
async fn test_announce_without_secret_key_fails() {
    let mut fixture = RelayFixture::new();
    let a = fixture.client();

    let topic = [0x56u8; 32];
    let err = within(a.announce(topic, KeyPair::generate().public_only(), false).collect())
        .await
        .unwrap_err();
    assert!(matches!(err, RelayError::SignatureUnavailable));
    assert!(fixture.swarm.records(&topic).is_empty());
}
