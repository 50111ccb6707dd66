//! Performance benchmarks for wisp-crypto.
//!
//! Run with: `cargo bench -p wisp-crypto`

use criterion::{Criterion, black_box, criterion_group, criterion_main};
use wisp_crypto::hash::{SignNamespace, signable};
use wisp_crypto::{HandshakeResult, KeyPair, NoiseHandshake};

fn bench_noise_ik(c: &mut Criterion) {
    let client = KeyPair::generate();
    let server = KeyPair::generate();

    c.bench_function("noise_ik_full_handshake", |b| {
        b.iter(|| {
            let mut initiator = NoiseHandshake::initiator(&client, &server.public_key).unwrap();
            let mut responder = NoiseHandshake::responder(&server).unwrap();
            let msg1 = initiator.send(b"").unwrap();
            responder.recv(&msg1).unwrap();
            let msg2 = responder.send(b"").unwrap();
            initiator.recv(&msg2).unwrap();
            black_box(initiator.is_complete())
        })
    });
}

fn bench_derivations(c: &mut Criterion) {
    let client = KeyPair::generate().public_key;
    let server = KeyPair::generate().public_key;

    c.bench_function("handshake_result_derive", |b| {
        b.iter(|| HandshakeResult::from_hash(true, client, server, black_box([7u8; 64])))
    });

    c.bench_function("signable_announce", |b| {
        b.iter(|| {
            signable(
                SignNamespace::Announce,
                black_box(&[1u8; 32]),
                black_box(&[2u8; 32]),
                black_box(&[3u8; 32]),
                black_box(&[0u8; 96]),
            )
        })
    });
}

fn bench_sign_verify(c: &mut Criterion) {
    let keys = KeyPair::generate();
    let message = [0x42u8; 32];
    let signature = keys.sign(&message).unwrap();

    c.bench_function("ed25519_sign", |b| b.iter(|| keys.sign(black_box(&message))));
    c.bench_function("ed25519_verify", |b| {
        b.iter(|| signature.verify(&keys.public_key, black_box(&message)))
    });
}

criterion_group!(benches, bench_noise_ik, bench_derivations, bench_sign_verify);
criterion_main!(benches);
