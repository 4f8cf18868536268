//! Packet framing and type fingerprints.
//!
//! Frame format: `[tag: u8][fields]`. Plugin packets add a `u32` type hash
//! right after the tag. Decoding lives on [`crate::PacketRegistry`] because it
//! needs the factory table.

use crate::protocol::{Packet, PacketType};
use crate::wire::WireWriter;

/// Bumped whenever a core packet layout changes.
pub const PROTOCOL_VERSION: u16 = 3;

/// Encode `packet` with its tag.
pub fn encode_packet(packet: &Packet) -> Vec<u8> {
    let mut w = WireWriter::with_capacity(64);
    w.write_u8(packet.packet_type().as_u8());
    packet.write_fields(&mut w);
    w.into_bytes()
}

/// Hash of an external payload type name, used as its plugin key.
pub fn plugin_type_hash(type_name: &str) -> u32 {
    let hash = blake3::hash(type_name.as_bytes());
    let bytes = hash.as_bytes();
    u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]])
}

/// Building kind key derived from its type name.
///
/// Host and client compute the same value for the same prefab, so buildings
/// can be compared across the wire without engine handles.
pub fn prefab_hash(type_name: &str) -> i32 {
    plugin_type_hash(type_name) as i32
}

/// Fingerprint of the core packet catalogue.
///
/// Peers built from different catalogues disagree on this value; it is
/// folded into the environment manifest's game version string.
pub fn compute_protocol_hash() -> u64 {
    let mut hasher = blake3::Hasher::new();
    hasher.update(&PROTOCOL_VERSION.to_le_bytes());
    for kind in PacketType::CORE {
        hasher.update(&[kind.as_u8()]);
        hasher.update(format!("{kind:?}").as_bytes());
    }

    let hash = hasher.finalize();
    let mut prefix = [0u8; 8];
    prefix.copy_from_slice(&hash.as_bytes()[..8]);
    u64::from_le_bytes(prefix)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{Ping, ReadyState, ReadyStatus};

    #[test]
    fn test_encode_prefixes_tag() {
        let bytes = encode_packet(&Packet::Ping(Ping {
            timestamp_micros: 5,
        }));
        assert_eq!(bytes[0], PacketType::Ping.as_u8());
        assert_eq!(&bytes[1..], &5i64.to_le_bytes());
    }

    #[test]
    fn test_unit_packets_are_tag_only() {
        assert_eq!(encode_packet(&Packet::HardSync), vec![18]);
        assert_eq!(encode_packet(&Packet::AllClientsReady), vec![10]);
    }

    #[test]
    fn test_ready_status_layout() {
        let bytes = encode_packet(&Packet::ReadyStatus(ReadyStatus {
            state: ReadyState::Ready,
        }));
        assert_eq!(bytes, vec![8, 1]);
    }

    #[test]
    fn test_plugin_hash_is_stable() {
        assert_eq!(plugin_type_hash("Research"), plugin_type_hash("Research"));
        assert_ne!(plugin_type_hash("Research"), plugin_type_hash("Schedule"));
    }

    #[test]
    fn test_prefab_hash_matches_type_hash_bits() {
        let hash = prefab_hash("Ladder");
        assert_eq!(hash as u32, plugin_type_hash("Ladder"));
        assert_ne!(hash, prefab_hash("Tile"));
    }

    #[test]
    fn test_protocol_hash_is_deterministic() {
        assert_eq!(compute_protocol_hash(), compute_protocol_hash());
    }
}
