//! Property-based tests for the WISP wire format and alias registries
//!
//! Uses proptest to verify invariants across large input spaces.

use proptest::prelude::*;

// ============================================================================
// Strategies
// ============================================================================

mod strategies {
    use super::*;
    use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr, SocketAddrV4, SocketAddrV6};
    use wisp_core::{Message, Peer, QueryReply};
    use wisp_crypto::{PublicKey, SecretKey, Signature};

    fn bytes64() -> impl Strategy<Value = [u8; 64]> {
        prop::collection::vec(any::<u8>(), 64).prop_map(|v| {
            let mut out = [0u8; 64];
            out.copy_from_slice(&v);
            out
        })
    }

    fn public_key() -> impl Strategy<Value = PublicKey> {
        any::<[u8; 32]>().prop_map(PublicKey::from_bytes)
    }

    fn secret_key() -> impl Strategy<Value = Option<SecretKey>> {
        prop::option::of(bytes64().prop_map(SecretKey::from_bytes))
    }

    fn error() -> impl Strategy<Value = Option<String>> {
        prop::option::of("[A-Za-z_: ]{0,48}")
    }

    fn blob() -> impl Strategy<Value = Vec<u8>> {
        prop::collection::vec(any::<u8>(), 0..256)
    }

    pub fn socket_addr() -> impl Strategy<Value = SocketAddr> {
        prop_oneof![
            (any::<[u8; 4]>(), any::<u16>())
                .prop_map(|(ip, port)| SocketAddr::V4(SocketAddrV4::new(Ipv4Addr::from(ip), port))),
            (any::<[u8; 16]>(), any::<u16>())
                .prop_map(|(ip, port)| SocketAddr::V6(SocketAddrV6::new(Ipv6Addr::from(ip), port, 0, 0))),
        ]
    }

    fn addresses() -> impl Strategy<Value = Vec<SocketAddr>> {
        prop::collection::vec(socket_addr(), 0..4)
    }

    fn reply() -> impl Strategy<Value = QueryReply> {
        (
            prop::option::of(socket_addr()),
            prop::collection::vec((public_key(), addresses()), 0..4),
        )
            .prop_map(|(from, peers)| QueryReply {
                from,
                peers: peers
                    .into_iter()
                    .map(|(public_key, relay_addresses)| Peer {
                        public_key,
                        relay_addresses,
                    })
                    .collect(),
            })
    }

    fn streams() -> impl Strategy<Value = Message> {
        prop_oneof![
            Just(Message::Ping),
            Just(Message::Pong),
            (any::<u32>(), public_key(), secret_key(), public_key(), any::<Option<u32>>()).prop_map(
                |(alias, public_key, secret_key, remote_public_key, timeout_ms)| Message::Connect {
                    alias,
                    public_key,
                    secret_key,
                    remote_public_key,
                    timeout_ms,
                }
            ),
            (any::<u32>(), any::<u32>(), prop::option::of(bytes64()), any::<Option<u32>>()).prop_map(
                |(alias, remote_alias, handshake_hash, handshake_id)| Message::Connected {
                    alias,
                    remote_alias,
                    handshake_hash,
                    handshake_id,
                }
            ),
            (any::<u32>(), any::<bool>(), error())
                .prop_map(|(alias, paired, error)| Message::Destroy { alias, paired, error }),
            any::<u32>().prop_map(|alias| Message::End { alias }),
            (any::<u32>(), prop::collection::vec(blob(), 0..4))
                .prop_map(|(alias, chunks)| Message::Data { alias, chunks }),
        ]
    }

    fn servers() -> impl Strategy<Value = Message> {
        prop_oneof![
            (any::<u32>(), public_key(), secret_key(), any::<bool>()).prop_map(
                |(alias, public_key, secret_key, firewall)| Message::Listen {
                    alias,
                    public_key,
                    secret_key,
                    firewall,
                }
            ),
            (any::<u32>(), any::<u32>(), socket_addr()).prop_map(|(alias, remote_alias, address)| {
                Message::Listening {
                    alias,
                    remote_alias,
                    address,
                }
            }),
            (any::<u32>(), any::<u32>(), public_key(), bytes64(), any::<Option<u32>>()).prop_map(
                |(alias, server_alias, remote_public_key, handshake_hash, handshake_id)| Message::Connection {
                    alias,
                    server_alias,
                    remote_public_key,
                    handshake_hash,
                    handshake_id,
                }
            ),
            any::<u32>().prop_map(|alias| Message::Close { alias }),
            (any::<u32>(), error()).prop_map(|(alias, error)| Message::Closed { alias, error }),
        ]
    }

    fn queries() -> impl Strategy<Value = Message> {
        prop_oneof![
            (any::<u32>(), any::<[u8; 32]>()).prop_map(|(id, target)| Message::Lookup { id, target }),
            (any::<u32>(), any::<[u8; 32]>(), public_key(), secret_key()).prop_map(
                |(id, target, public_key, secret_key)| Message::Announce {
                    id,
                    target,
                    public_key,
                    secret_key,
                }
            ),
            (any::<u32>(), any::<[u8; 32]>(), public_key(), secret_key()).prop_map(
                |(id, target, public_key, secret_key)| Message::Unannounce {
                    id,
                    target,
                    public_key,
                    secret_key,
                }
            ),
            (any::<u32>(), reply()).prop_map(|(id, reply)| Message::Result { id, reply }),
            (any::<u32>(), error()).prop_map(|(id, error)| Message::Finished { id, error }),
        ]
    }

    fn noise() -> impl Strategy<Value = Message> {
        prop_oneof![
            (any::<bool>(), any::<u32>(), any::<u32>(), blob()).prop_map(|(is_initiator, id, alias, data)| {
                Message::NoiseSend {
                    is_initiator,
                    id,
                    alias,
                    data,
                }
            }),
            (any::<bool>(), any::<u32>(), any::<u32>(), blob()).prop_map(|(is_initiator, id, alias, data)| {
                Message::NoiseReceive {
                    is_initiator,
                    id,
                    alias,
                    data,
                }
            }),
            (
                (any::<u32>(), blob(), any::<bool>(), prop::option::of(bytes64())),
                (
                    any::<Option<[u8; 32]>>(),
                    any::<Option<[u8; 32]>>(),
                    prop::option::of(public_key()),
                    error()
                ),
            )
                .prop_map(
                    |(
                        (id, data, complete, handshake_hash),
                        (remote_id, holepunch_secret, remote_public_key, error),
                    )| Message::NoiseReply {
                        id,
                        data,
                        complete,
                        handshake_hash,
                        remote_id,
                        holepunch_secret,
                        remote_public_key,
                        error,
                    }
                ),
        ]
    }

    fn decisions() -> impl Strategy<Value = Message> {
        prop_oneof![
            (any::<u32>(), any::<u32>(), public_key(), blob(), any::<u32>()).prop_map(
                |(id, server_alias, remote_public_key, payload, handshake_id)| Message::Incoming {
                    id,
                    server_alias,
                    remote_public_key,
                    payload,
                    handshake_id,
                }
            ),
            any::<u32>().prop_map(|id| Message::Deny { id }),
            any::<u32>().prop_map(|id| Message::Accept { id }),
            (any::<u32>(), any::<u32>(), any::<[u8; 32]>(), any::<[u8; 32]>(), addresses()).prop_map(
                |(id, signee, token, peer_id, relay_addresses)| Message::SignAnnounce {
                    id,
                    signee,
                    token,
                    peer_id,
                    relay_addresses,
                }
            ),
            (any::<u32>(), any::<u32>(), any::<[u8; 32]>(), any::<[u8; 32]>(), addresses()).prop_map(
                |(id, signee, token, peer_id, relay_addresses)| Message::SignUnannounce {
                    id,
                    signee,
                    token,
                    peer_id,
                    relay_addresses,
                }
            ),
            (any::<u32>(), prop::option::of(bytes64().prop_map(Signature::from_bytes)), error())
                .prop_map(|(id, signature, error)| Message::Signature { id, signature, error }),
        ]
    }

    /// Any message of the catalog
    pub fn message() -> impl Strategy<Value = Message> {
        prop_oneof![streams(), servers(), queries(), noise(), decisions()]
    }
}

// ============================================================================
// Codec Properties
// ============================================================================

mod codec_properties {
    use super::*;
    use wisp_core::{DEFAULT_MAX_FRAME_SIZE, LENGTH_PREFIX_SIZE, decode_frame, encode_frame, parse_frame};

    proptest! {
        /// decode(encode(m)) == m for every message of the catalog
        #[test]
        fn frame_roundtrip(message in strategies::message()) {
            let frame = encode_frame(&message, DEFAULT_MAX_FRAME_SIZE).unwrap();
            let declared = u32::from_le_bytes(frame[..LENGTH_PREFIX_SIZE].try_into().unwrap()) as usize;
            prop_assert_eq!(declared, frame.len() - LENGTH_PREFIX_SIZE);
            prop_assert_eq!(frame[LENGTH_PREFIX_SIZE], message.opcode() as u8);

            let (decoded, used) = parse_frame(&frame, DEFAULT_MAX_FRAME_SIZE).unwrap().unwrap();
            prop_assert_eq!(used, frame.len());
            prop_assert_eq!(decoded, message);
        }

        /// A partial frame is never mistaken for a complete one
        #[test]
        fn partial_frame_waits(message in strategies::message(), cut in any::<prop::sample::Index>()) {
            let frame = encode_frame(&message, DEFAULT_MAX_FRAME_SIZE).unwrap();
            let cut = cut.index(frame.len());
            prop_assert!(parse_frame(&frame[..cut], DEFAULT_MAX_FRAME_SIZE).unwrap().is_none());
        }

        /// A body cut short of its last field is rejected
        #[test]
        fn truncated_body_rejected(message in strategies::message(), cut in any::<prop::sample::Index>()) {
            let frame = encode_frame(&message, DEFAULT_MAX_FRAME_SIZE).unwrap();
            let body = &frame[LENGTH_PREFIX_SIZE..];
            let cut = cut.index(body.len());
            prop_assert!(decode_frame(&body[..cut]).is_err());
        }

        /// Two frames back to back come apart at the right boundary
        #[test]
        fn frames_concatenate(first in strategies::message(), second in strategies::message()) {
            let mut buf = encode_frame(&first, DEFAULT_MAX_FRAME_SIZE).unwrap();
            let split = buf.len();
            buf.extend(encode_frame(&second, DEFAULT_MAX_FRAME_SIZE).unwrap());

            let (decoded, used) = parse_frame(&buf, DEFAULT_MAX_FRAME_SIZE).unwrap().unwrap();
            prop_assert_eq!(used, split);
            prop_assert_eq!(decoded, first);
            let (decoded, _) = parse_frame(&buf[used..], DEFAULT_MAX_FRAME_SIZE).unwrap().unwrap();
            prop_assert_eq!(decoded, second);
        }

        /// Arbitrary bytes never panic the decoder
        #[test]
        fn arbitrary_bytes_do_not_panic(bytes in prop::collection::vec(any::<u8>(), 0..512)) {
            let _ = parse_frame(&bytes, DEFAULT_MAX_FRAME_SIZE);
            let _ = decode_frame(&bytes);
        }

        /// Frames above the limit are refused on both ends
        #[test]
        fn size_limit_enforced(alias in any::<u32>(), len in 64usize..4096) {
            let message = wisp_core::Message::Data { alias, chunks: vec![vec![0u8; len]] };
            let limit = len / 2;
            prop_assert!(encode_frame(&message, limit).is_err());
            let frame = encode_frame(&message, DEFAULT_MAX_FRAME_SIZE).unwrap();
            prop_assert!(parse_frame(&frame, limit).is_err());
        }
    }

    #[test]
    fn unknown_opcodes_rejected() {
        for opcode in [0u8, 27, 100, 255] {
            assert!(matches!(
                decode_frame(&[opcode]),
                Err(wisp_core::CodecError::UnknownOpcode(op)) if op == opcode
            ));
        }
    }
}

// ============================================================================
// Registry Properties
// ============================================================================

mod registry_properties {
    use super::*;
    use std::collections::HashMap;
    use wisp_discovery::relay::registry::Parity;
    use wisp_discovery::relay::{AliasGenerator, Registry};

    #[derive(Debug, Clone)]
    enum Op {
        Add,
        Remove(prop::sample::Index),
    }

    fn op() -> impl Strategy<Value = Op> {
        prop_oneof![
            3 => Just(Op::Add),
            2 => any::<prop::sample::Index>().prop_map(Op::Remove),
        ]
    }

    proptest! {
        /// Live aliases never collide, keep their parity and are never zero
        #[test]
        fn live_aliases_unique(ops in prop::collection::vec(op(), 1..200), even in any::<bool>()) {
            let parity = if even { Parity::Even } else { Parity::Odd };
            let generator = AliasGenerator::new(parity);
            let mut registry: Registry<u32, u64> = Registry::new();
            let mut model: HashMap<u32, u64> = HashMap::new();
            let mut stamp = 0u64;

            for op in ops {
                match op {
                    Op::Add => {
                        let alias = generator.next(|alias| registry.has(&alias));
                        prop_assert_ne!(alias, 0);
                        prop_assert_eq!(alias % 2 == 0, even);
                        stamp += 1;
                        prop_assert!(registry.try_add(alias, stamp).is_ok());
                        prop_assert!(model.insert(alias, stamp).is_none());
                    }
                    Op::Remove(index) => {
                        if model.is_empty() {
                            continue;
                        }
                        let mut keys: Vec<u32> = model.keys().copied().collect();
                        keys.sort_unstable();
                        let alias = keys[index.index(keys.len())];
                        prop_assert_eq!(registry.remove(&alias), model.remove(&alias));
                        prop_assert!(registry.get(&alias).is_none());
                    }
                }
                prop_assert_eq!(registry.len(), model.len());
            }

            for (alias, stamp) in &model {
                prop_assert_eq!(registry.get(alias), Some(stamp));
            }
        }

        /// A removed key can be reused and never yields its old value
        #[test]
        fn removed_key_reusable(key in any::<u32>(), old in any::<u64>(), new in any::<u64>()) {
            let mut registry = Registry::new();
            prop_assert!(registry.try_add(key, old).is_ok());
            prop_assert!(registry.try_add(key, new).is_err());
            prop_assert_eq!(registry.remove(&key), Some(old));
            prop_assert!(registry.get(&key).is_none());
            prop_assert!(registry.try_add(key, new).is_ok());
            prop_assert_eq!(registry.get(&key), Some(&new));
        }
    }

    #[test]
    fn generators_keep_sides_apart() {
        let relay = AliasGenerator::relay();
        let endpoint = AliasGenerator::endpoint();
        for _ in 0..1000 {
            assert_eq!(relay.next(|_| false) % 2, 1);
            assert_eq!(endpoint.next(|_| false) % 2, 0);
        }
    }
}
