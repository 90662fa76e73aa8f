//! Bit-exact Art-Net `ArtDMX` packet encoding (§6).

use crate::model::DMX_UNIVERSE_SIZE;

pub const ART_NET_ID: &[u8; 8] = b"Art-Net\0";
pub const OPCODE_ART_DMX: u16 = 0x5000;
pub const PROTOCOL_VERSION: u16 = 0x000E;
pub const ART_NET_PORT: u16 = 6454;
pub const PACKET_LEN: usize = 18 + DMX_UNIVERSE_SIZE;

/// Encodes one `ArtDMX` packet. `universe` is the 1-based universe id used
/// throughout the core; the wire value is `universe - 1` per §6.
///
/// Sequence numbering: this implementation increments a per-universe
/// sequence counter (wrapping `1..=255`, never emitting `0` once started),
/// per §9's "pick one and document it" — `0` is reserved for "sequencing
/// disabled" by the Art-Net spec and some receivers ignore it entirely, so
/// incrementing gives downstream tooling the option to detect drops.
pub fn encode_art_dmx(universe: u16, sequence: u8, data: &[u8; DMX_UNIVERSE_SIZE]) -> [u8; PACKET_LEN] {
    let mut packet = [0u8; PACKET_LEN];
    packet[0..8].copy_from_slice(ART_NET_ID);
    packet[8..10].copy_from_slice(&OPCODE_ART_DMX.to_le_bytes());
    packet[10..12].copy_from_slice(&PROTOCOL_VERSION.to_be_bytes());
    packet[12] = sequence;
    packet[13] = 0; // Physical
    let sub_uni_net = universe.wrapping_sub(1);
    packet[14..16].copy_from_slice(&sub_uni_net.to_le_bytes());
    packet[16..18].copy_from_slice(&(DMX_UNIVERSE_SIZE as u16).to_be_bytes());
    packet[18..].copy_from_slice(data);
    packet
}

/// Advances a sequence counter per the Art-Net convention: wraps `1..=255`,
/// skipping `0`.
pub fn next_sequence(current: u8) -> u8 {
    if current >= 255 {
        1
    } else {
        current + 1
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn packet_layout_matches_spec() {
        let mut data = [0u8; DMX_UNIVERSE_SIZE];
        data[0] = 0x80;
        let packet = encode_art_dmx(1, 7, &data);

        assert_eq!(&packet[0..8], b"Art-Net\0");
        assert_eq!(u16::from_le_bytes([packet[8], packet[9]]), 0x5000);
        assert_eq!(u16::from_be_bytes([packet[10], packet[11]]), 0x000E);
        assert_eq!(packet[12], 7);
        assert_eq!(packet[13], 0);
        // universe 1 -> wire value 0
        assert_eq!(u16::from_le_bytes([packet[14], packet[15]]), 0);
        assert_eq!(u16::from_be_bytes([packet[16], packet[17]]), 512);
        assert_eq!(packet[18], 0x80);
        assert_eq!(packet[19], 0x00);
        assert_eq!(packet[20], 0x00);
        assert_eq!(packet.len(), PACKET_LEN);
    }

    #[test]
    fn universe_ten_wire_value_is_nine() {
        let data = [0u8; DMX_UNIVERSE_SIZE];
        let packet = encode_art_dmx(10, 0, &data);
        assert_eq!(u16::from_le_bytes([packet[14], packet[15]]), 9);
    }

    #[test]
    fn sequence_wraps_skipping_zero() {
        assert_eq!(next_sequence(254), 255);
        assert_eq!(next_sequence(255), 1);
    }
}
