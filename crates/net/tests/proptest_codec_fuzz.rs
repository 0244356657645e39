//! Fuzz-style property tests for the message codec.
//!
//! Decoders must survive arbitrary network input, never consume a partial
//! frame, and never read past the frame they parse.

use blockhost_core::{BlockPos, ChunkPos, EntityId, Facing};
use blockhost_net::{
    AttachEntity, Attachment, AuthMode, Beam, BlockAction, Chat, Chunk, ChunkUnchanged,
    CreateEntity, Decoded, DestroyBlock, Login, LoginOk, Message, OpenContainer, ProtocolError,
    Ready, RequestChunk, ServerInfo, SetBlock, Use,
};
use proptest::prelude::*;

fn name(max: usize) -> impl Strategy<Value = String> {
    prop::string::string_regex(&format!("[a-zA-Z0-9_/]{{1,{max}}}")).unwrap()
}

fn facing() -> impl Strategy<Value = Facing> {
    prop::sample::select(Facing::ALL.to_vec())
}

fn message() -> impl Strategy<Value = Message> {
    prop_oneof![client_message(), server_message()]
}

/// Kinds only the host sends.
fn server_message() -> impl Strategy<Value = Message> {
    prop_oneof![
        (prop::sample::select(vec![AuthMode::Open, AuthMode::Key]), any::<u8>())
            .prop_map(|(auth_mode, flags)| Message::from(ServerInfo { auth_mode, flags })),
        any::<u32>().prop_map(|id| Message::from(LoginOk {
            entity_id: EntityId(id)
        })),
        (
            name(24),
            prop::array::uniform3(0.0f32..100_000.0),
            0u16..360,
            prop::array::uniform3(1u16..=u16::MAX),
            prop::array::uniform3(1u8..=u8::MAX),
        )
            .prop_map(|(planet_name, position, angle, planet_size, chunk_size)| {
                Message::from(Beam {
                    planet_name,
                    position,
                    angle,
                    planet_size,
                    chunk_size,
                })
            }),
        any::<[u16; 3]>().prop_map(|c| Message::from(ChunkUnchanged {
            position: ChunkPos::new(c[0], c[1], c[2])
        })),
        any::<[u32; 3]>().prop_map(|p| Message::from(DestroyBlock {
            position: BlockPos::new(p[0], p[1], p[2])
        })),
        any::<u32>().prop_map(|container_id| Message::from(OpenContainer { container_id })),
    ]
}

/// Kinds a client may send, plus the ones both sides relay.
fn client_message() -> impl Strategy<Value = Message> {
    prop_oneof![
        Just(Message::from(Ready)),
        (name(24), name(255)).prop_map(|(u, p)| Message::from(Login::new(u, p))),
        (any::<u16>(), any::<u16>(), any::<u16>(), any::<u32>()).prop_map(|(x, y, z, timestamp)| {
            Message::from(RequestChunk {
                position: ChunkPos::new(x, y, z),
                timestamp,
            })
        }),
        (any::<[u32; 3]>(), name(64)).prop_map(|(p, class_id)| {
            Message::from(SetBlock {
                position: BlockPos::new(p[0], p[1], p[2]),
                class_id,
            })
        }),
        (any::<[u32; 3]>(), facing(), any::<bool>()).prop_map(|(p, facing, primary)| {
            Message::from(BlockAction {
                position: BlockPos::new(p[0], p[1], p[2]),
                facing,
                primary,
            })
        }),
        (any::<u32>(), any::<u32>(), name(32)).prop_map(|(s, t, hook_id)| {
            Message::from(AttachEntity {
                source: EntityId(s),
                target: EntityId(t),
                hook_id,
            })
        }),
        any::<u32>().prop_map(|id| Message::from(Use {
            entity_id: EntityId(id)
        })),
        // At most 4 bytes per char keeps every field inside its prefix.
        (".{0,20}", ".{0,20}", ".{1,300}").prop_map(|(channel, sender, message)| {
            Message::from(Chat {
                channel,
                sender,
                message,
            })
        }),
        (
            any::<u32>(),
            any::<[u16; 3]>(),
            prop::array::uniform3(-1000.0f32..1000.0),
            any::<u8>(),
            name(40),
            prop::option::of((name(16), any::<u32>())),
        )
            .prop_map(|(id, c, offset, heading, class_id, parent)| {
                Message::from(CreateEntity {
                    id: EntityId(id),
                    chunk: ChunkPos::new(c[0], c[1], c[2]),
                    offset,
                    heading,
                    class_id,
                    parent: parent.map(|(hook, p)| Attachment {
                        hook,
                        parent: EntityId(p),
                    }),
                })
            }),
        (
            prop::collection::vec(name(12), 1..8),
            prop::collection::vec((any::<u16>(), 0u8..16), 1..200),
        )
            .prop_map(|(classes, blocks)| {
                let mut chunk = Chunk::new(ChunkPos::new(1, 2, 3), 77);
                for (pick, flags) in blocks {
                    chunk.push_block(&classes[usize::from(pick) % classes.len()], flags);
                }
                Message::from(chunk)
            }),
    ]
}

fn encode(msg: &Message) -> Vec<u8> {
    msg.to_bytes().unwrap()
}

proptest! {
    /// Property: arbitrary bytes never panic the decoder.
    #[test]
    fn arbitrary_bytes_dont_crash_decoder(
        random_bytes in prop::collection::vec(any::<u8>(), 0..2000),
    ) {
        match Message::decode(&random_bytes) {
            Ok(Decoded::Complete { consumed, .. }) => {
                prop_assert!(consumed >= 1 && consumed <= random_bytes.len());
            }
            Ok(Decoded::NeedMoreData) | Err(_) => {}
        }
    }

    /// Property: a leading byte outside the opcode table is always rejected.
    #[test]
    fn unknown_opcodes_are_rejected(
        opcode in prop_oneof![Just(0u8), 0x11u8..=0xff],
        tail in prop::collection::vec(any::<u8>(), 0..64),
    ) {
        let mut bytes = vec![opcode];
        bytes.extend(tail);
        let is_unknown = matches!(
            Message::decode(&bytes),
            Err(ProtocolError::UnknownOpcode(op)) if op == opcode
        );
        prop_assert!(is_unknown);
    }

    /// Property: valid messages survive encode then decode.
    #[test]
    fn messages_roundtrip(msg in message()) {
        let bytes = encode(&msg);
        let decoded = Message::decode(&bytes).unwrap();
        prop_assert_eq!(
            decoded,
            Decoded::Complete { value: msg, consumed: bytes.len() }
        );
    }

    /// Property: every strict prefix of a frame is incomplete.
    #[test]
    fn truncated_frames_need_more_data(msg in message(), cut in any::<prop::sample::Index>()) {
        let bytes = encode(&msg);
        let cut = cut.index(bytes.len());
        prop_assert_eq!(Message::decode(&bytes[..cut]).unwrap(), Decoded::NeedMoreData);
    }

    /// Property: trailing bytes of the next frame are never consumed.
    #[test]
    fn decoding_stops_at_frame_boundary(
        first in message(),
        second in message(),
        extra in 1usize..16,
    ) {
        let head = encode(&first);
        let mut bytes = head.clone();
        let tail = encode(&second);
        bytes.extend_from_slice(&tail[..extra.min(tail.len())]);

        let (value, consumed) = Message::decode(&bytes).unwrap().complete().unwrap();
        prop_assert_eq!(consumed, head.len());
        prop_assert_eq!(value, first);
    }
}
