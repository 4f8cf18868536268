//! Fuzz-style property tests for the packet codec
//!
//! Decoders must survive arbitrary network input, every core packet kind must
//! round-trip, and the bulk-chunk reconstruction check must reject any
//! truncation.

use colonysync_core::{CellRect, MarkerKey, PeerId};
use colonysync_net::cells::{decode_batch, encode_batch};
use colonysync_net::protocol::{
    BuildingState, ChoreState, ChunkAck, ChunkResendRequest, CompatibilityManifest,
    CompatibilityReply, DiggingState, Disconnect, Ping, PlayerCursor, Pong, ReadyStatus,
    ReadyStatusUpdate, SecureTransfer, SnapshotChunk, SnapshotRequest, SyncProgress, WorldUpdate,
};
use colonysync_net::{
    encode_packet, CellUpdate, EnvironmentManifest, Packet, PacketRegistry, ReadyState,
};
use proptest::prelude::*;

fn name() -> impl Strategy<Value = String> {
    "[a-zA-Z0-9._ -]{0,24}"
}

fn names() -> impl Strategy<Value = Vec<String>> {
    prop::collection::vec(name(), 0..5)
}

fn finite() -> impl Strategy<Value = f32> {
    -1.0e6f32..1.0e6f32
}

fn cell_update() -> impl Strategy<Value = CellUpdate> {
    (
        any::<i32>(),
        any::<u16>(),
        finite(),
        finite(),
        any::<u8>(),
        any::<i32>(),
    )
        .prop_map(
            |(cell, element, temperature, mass, disease, disease_count)| CellUpdate {
                cell,
                element,
                temperature,
                mass,
                disease,
                disease_count,
            },
        )
}

fn chunk() -> impl Strategy<Value = SnapshotChunk> {
    (
        name(),
        any::<i32>(),
        any::<i32>(),
        prop::collection::vec(any::<u8>(), 0..256),
    )
        .prop_map(|(file_name, offset, total_size, data)| SnapshotChunk {
            file_name,
            offset,
            total_size,
            data,
        })
}

fn session_packets() -> impl Strategy<Value = Packet> {
    prop_oneof![
        (name(), prop::collection::vec((name(), name()), 0..6)).prop_map(|(version, mods)| {
            let mut manifest = EnvironmentManifest::new(version);
            for (id, v) in mods {
                manifest = manifest.with_mod(id, v);
            }
            Packet::CompatibilityManifest(CompatibilityManifest::new(manifest))
        }),
        (any::<bool>(), name(), names(), names(), names()).prop_map(
            |(compatible, reason, missing, mismatched, extra)| {
                Packet::CompatibilityReply(CompatibilityReply {
                    compatible,
                    reason,
                    missing,
                    mismatched,
                    extra,
                })
            }
        ),
        any::<u64>().prop_map(|id| Packet::SnapshotRequest(SnapshotRequest {
            requester: PeerId(id)
        })),
        (name(), any::<i32>(), any::<i32>(), any::<i32>(), any::<u64>()).prop_map(
            |(file_name, received_chunks, total_chunks, percent, peer)| {
                Packet::SyncProgress(SyncProgress {
                    peer: PeerId(peer),
                    file_name,
                    received_chunks,
                    total_chunks,
                    percent,
                })
            }
        ),
        any::<bool>().prop_map(|ready| Packet::ReadyStatus(ReadyStatus {
            state: if ready {
                ReadyState::Ready
            } else {
                ReadyState::Unready
            },
        })),
        (any::<i32>(), any::<i32>())
            .prop_map(|(ready, total)| Packet::ReadyStatusUpdate(ReadyStatusUpdate {
                ready,
                total
            })),
        Just(()).prop_map(|_| Packet::AllClientsReady),
        Just(()).prop_map(|_| Packet::HardSync),
        any::<i64>().prop_map(|t| Packet::Ping(Ping {
            timestamp_micros: t
        })),
        any::<i64>().prop_map(|t| Packet::Pong(Pong {
            timestamp_micros: t
        })),
    ]
}

fn transfer_packets() -> impl Strategy<Value = Packet> {
    prop_oneof![
        (any::<i32>(), name(), chunk()).prop_map(|(sequence, transfer_id, chunk)| {
            Packet::SecureTransfer(SecureTransfer {
                sequence,
                transfer_id,
                payload: chunk.encode(),
            })
        }),
        (any::<i32>(), name(), any::<u64>()).prop_map(|(sequence, transfer_id, sender)| {
            Packet::ChunkAck(ChunkAck {
                sequence,
                transfer_id,
                sender: PeerId(sender),
            })
        }),
        (any::<i32>(), name()).prop_map(|(sequence, transfer_id)| {
            Packet::ChunkResendRequest(ChunkResendRequest {
                sequence,
                transfer_id,
            })
        }),
        name().prop_map(|reason| Packet::Disconnect(Disconnect { reason })),
    ]
}

fn world_packets() -> impl Strategy<Value = Packet> {
    let keys = || prop::collection::vec((any::<i32>(), any::<i32>()), 0..32);
    prop_oneof![
        (prop::collection::vec(cell_update(), 0..64), 1i32..6).prop_map(|(updates, level)| {
            Packet::WorldUpdate(WorldUpdate::new(updates, level))
        }),
        (
            any::<u64>(),
            finite(),
            finite(),
            (any::<i32>(), any::<i32>(), any::<i32>(), any::<i32>())
        )
            .prop_map(|(peer, x, y, (a, b, c, d))| Packet::PlayerCursor(PlayerCursor {
                peer: PeerId(peer),
                x,
                y,
                viewport: CellRect::new(a, b, c, d),
            })),
        prop::collection::vec(any::<i32>(), 0..64)
            .prop_map(|cells| Packet::DiggingState(DiggingState { cells })),
        prop::collection::vec(any::<i32>(), 0..32).prop_map(|cells| {
            Packet::ChoreState(ChoreState {
                chores: cells.into_iter().map(|c| MarkerKey::new(c, 0)).collect(),
            })
        }),
        keys().prop_map(|pairs| Packet::BuildingState(BuildingState {
            buildings: pairs
                .into_iter()
                .map(|(cell, kind)| MarkerKey::new(cell, kind))
                .collect(),
        })),
    ]
}

fn any_packet() -> impl Strategy<Value = Packet> {
    prop_oneof![session_packets(), transfer_packets(), world_packets()]
}

proptest! {
    /// Property: Arbitrary bytes don't crash the registry decoder
    #[test]
    fn arbitrary_bytes_dont_crash_decoder(
        random_bytes in prop::collection::vec(any::<u8>(), 0..2000),
    ) {
        let registry = PacketRegistry::new();
        let _result = registry.decode(&random_bytes);
    }

    /// Property: Arbitrary bytes behind a valid tag don't crash
    #[test]
    fn arbitrary_payload_behind_valid_tag(
        tag in 1u8..=19,
        body in prop::collection::vec(any::<u8>(), 0..512),
    ) {
        let registry = PacketRegistry::new();
        let mut bytes = vec![tag];
        bytes.extend_from_slice(&body);
        let _result = registry.decode(&bytes);
    }

    /// Property: Arbitrary bytes don't crash chunk reconstruction
    #[test]
    fn arbitrary_bytes_dont_crash_reconstruction(
        random_bytes in prop::collection::vec(any::<u8>(), 0..512),
    ) {
        let _result = SnapshotChunk::reconstruct(&random_bytes);
    }

    /// Property: Every core packet kind round-trips field for field
    #[test]
    fn core_packets_roundtrip(packet in any_packet()) {
        let registry = PacketRegistry::new();
        let encoded = encode_packet(&packet);
        let decoded = registry.decode(&encoded).expect("valid packet decodes");
        prop_assert_eq!(packet, decoded);
    }

    /// Property: Any truncation of a chunk sub-message fails reconstruction
    #[test]
    fn truncated_chunks_rejected(chunk in chunk(), cut in any::<prop::sample::Index>()) {
        let blob = chunk.encode();
        let keep = cut.index(blob.len());
        prop_assert!(SnapshotChunk::reconstruct(&blob[..keep]).is_err());
        prop_assert_eq!(SnapshotChunk::reconstruct(&blob).expect("intact"), chunk);
    }

    /// Property: Any truncation of an encoded packet fails to decode
    #[test]
    fn truncated_packets_rejected(packet in any_packet(), cut in any::<prop::sample::Index>()) {
        let registry = PacketRegistry::new();
        let encoded = encode_packet(&packet);
        let keep = cut.index(encoded.len());
        prop_assert!(registry.decode(&encoded[..keep]).is_err());
    }

    /// Property: Raw cell batches round-trip
    #[test]
    fn cell_batches_roundtrip(updates in prop::collection::vec(cell_update(), 0..200)) {
        let bytes = encode_batch(&updates);
        prop_assert_eq!(decode_batch(&bytes).expect("decodes"), updates);
    }

    /// Property: Oversized count fields are rejected without huge allocations
    #[test]
    fn oversized_counts_handled(claimed in 1i32..i32::MAX) {
        let mut bytes = claimed.to_le_bytes().to_vec();
        bytes.extend_from_slice(&[0, 1, 2, 3]);
        prop_assert!(decode_batch(&bytes).is_err());
    }
}
