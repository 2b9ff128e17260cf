//! Capture envelope handling
//!
//! The capture helper forwards every queued packet as one UDP datagram and
//! waits for a verdict datagram naming the same packet id.

use redirect_core::PacketAction;

/// Message type for a captured packet
pub const MSG_PACKET: u8 = 0x20;

/// Message type for a verdict
pub const MSG_VERDICT: u8 = 0x21;

/// Type byte + mark + packet id
const PACKET_HEADER_LEN: usize = 9;

/// Type byte + packet id + action
const VERDICT_LEN: usize = 6;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CapturedPacket {
    pub mark: u32,
    pub packet_id: u32,
    pub frame: Vec<u8>,
}

/// Parse a packet message
///
/// Format: [0x20, mark(4 bytes BE), packet_id(4 bytes BE), IPv4 frame...]
pub fn parse_packet(data: &[u8]) -> Option<CapturedPacket> {
    if data.len() <= PACKET_HEADER_LEN {
        return None;
    }

    if data[0] != MSG_PACKET {
        return None;
    }

    let mark = u32::from_be_bytes([data[1], data[2], data[3], data[4]]);
    let packet_id = u32::from_be_bytes([data[5], data[6], data[7], data[8]]);

    Some(CapturedPacket {
        mark,
        packet_id,
        frame: data[PACKET_HEADER_LEN..].to_vec(),
    })
}

/// Build a verdict message
///
/// Format: [0x21, packet_id(4 bytes BE), action(1 byte: 0 drop, 1 accept)]
pub fn encode_verdict(packet_id: u32, action: PacketAction) -> [u8; VERDICT_LEN] {
    let id = packet_id.to_be_bytes();
    let action = match action {
        PacketAction::Drop => 0,
        PacketAction::Accept => 1,
    };
    [MSG_VERDICT, id[0], id[1], id[2], id[3], action]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_packet() {
        let mut msg = vec![0x20, 0, 0, 0, 7, 0, 0, 0x01, 0x02];
        msg.extend_from_slice(&[0x45; 40]);

        let pkt = parse_packet(&msg).unwrap();
        assert_eq!(pkt.mark, 7);
        assert_eq!(pkt.packet_id, 0x0102);
        assert_eq!(pkt.frame.len(), 40);
    }

    #[test]
    fn test_parse_packet_without_frame() {
        let msg = [0x20, 0, 0, 0, 7, 0, 0, 0x01, 0x02];
        assert!(parse_packet(&msg).is_none());
    }

    #[test]
    fn test_parse_packet_wrong_type() {
        let msg = [0x21, 0, 0, 0, 7, 0, 0, 0x01, 0x02, 0x45];
        assert!(parse_packet(&msg).is_none());
    }

    #[test]
    fn test_encode_verdict() {
        assert_eq!(
            encode_verdict(0x0A0B0C0D, PacketAction::Accept),
            [0x21, 0x0A, 0x0B, 0x0C, 0x0D, 1]
        );
        assert_eq!(encode_verdict(5, PacketAction::Drop)[5], 0);
    }
}
