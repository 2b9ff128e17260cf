//! Raw IPv4 frame construction.
//!
//! Used for crafted RST segments and by tests that need realistic traffic.
//! Every frame built here carries valid IP and transport checksums.

use std::net::SocketAddrV4;

use crate::checksum::{
    internet_checksum, transport_checksum, PseudoHeader, PROTO_TCP, PROTO_UDP,
};
use crate::packet::TcpFlags;

const IPV4_HEADER_LEN: usize = 20;
const TCP_HEADER_LEN: usize = 20;
const UDP_HEADER_LEN: usize = 8;
const DEFAULT_TTL: u8 = 64;

/// Fields of a TCP segment to serialize.
#[derive(Debug, Clone, Copy)]
pub struct TcpSegment<'a> {
    pub src: SocketAddrV4,
    pub dst: SocketAddrV4,
    pub seq: u32,
    pub ack: u32,
    pub flags: TcpFlags,
    pub window: u16,
    pub payload: &'a [u8],
}

fn write_ipv4_header(packet: &mut [u8], total_len: usize, protocol: u8, src: &SocketAddrV4, dst: &SocketAddrV4) {
    packet[0] = 0x45; // Version 4, IHL 5
    packet[1] = 0x00; // DSCP/ECN
    packet[2..4].copy_from_slice(&(total_len as u16).to_be_bytes());
    packet[4..6].copy_from_slice(&[0x00, 0x00]); // ID
    packet[6..8].copy_from_slice(&[0x40, 0x00]); // Don't Fragment
    packet[8] = DEFAULT_TTL;
    packet[9] = protocol;
    packet[12..16].copy_from_slice(&src.ip().octets());
    packet[16..20].copy_from_slice(&dst.ip().octets());

    let checksum = internet_checksum(&packet[0..IPV4_HEADER_LEN]);
    packet[10..12].copy_from_slice(&checksum.to_be_bytes());
}

fn pseudo_for(src: &SocketAddrV4, dst: &SocketAddrV4, protocol: u8, length: usize) -> PseudoHeader {
    PseudoHeader {
        src: *src.ip(),
        dst: *dst.ip(),
        protocol,
        length: length as u16,
    }
}

pub fn build_tcp_frame(seg: &TcpSegment<'_>) -> Vec<u8> {
    let tcp_len = TCP_HEADER_LEN + seg.payload.len();
    let total_len = IPV4_HEADER_LEN + tcp_len;
    let mut packet = vec![0u8; total_len];

    write_ipv4_header(&mut packet, total_len, PROTO_TCP, &seg.src, &seg.dst);

    let t = IPV4_HEADER_LEN;
    packet[t..t + 2].copy_from_slice(&seg.src.port().to_be_bytes());
    packet[t + 2..t + 4].copy_from_slice(&seg.dst.port().to_be_bytes());
    packet[t + 4..t + 8].copy_from_slice(&seg.seq.to_be_bytes());
    packet[t + 8..t + 12].copy_from_slice(&seg.ack.to_be_bytes());
    packet[t + 12] = ((TCP_HEADER_LEN / 4) as u8) << 4;
    packet[t + 13] = seg.flags.to_byte();
    packet[t + 14..t + 16].copy_from_slice(&seg.window.to_be_bytes());
    packet[t + TCP_HEADER_LEN..].copy_from_slice(seg.payload);

    let pseudo = pseudo_for(&seg.src, &seg.dst, PROTO_TCP, tcp_len);
    let checksum = transport_checksum(&pseudo, &packet[t..]);
    packet[t + 16..t + 18].copy_from_slice(&checksum.to_be_bytes());

    packet
}

pub fn build_udp_frame(src: SocketAddrV4, dst: SocketAddrV4, payload: &[u8]) -> Vec<u8> {
    let udp_len = UDP_HEADER_LEN + payload.len();
    let total_len = IPV4_HEADER_LEN + udp_len;
    let mut packet = vec![0u8; total_len];

    write_ipv4_header(&mut packet, total_len, PROTO_UDP, &src, &dst);

    let u = IPV4_HEADER_LEN;
    packet[u..u + 2].copy_from_slice(&src.port().to_be_bytes());
    packet[u + 2..u + 4].copy_from_slice(&dst.port().to_be_bytes());
    packet[u + 4..u + 6].copy_from_slice(&(udp_len as u16).to_be_bytes());
    packet[u + UDP_HEADER_LEN..].copy_from_slice(payload);

    let pseudo = pseudo_for(&src, &dst, PROTO_UDP, udp_len);
    let mut checksum = transport_checksum(&pseudo, &packet[u..]);
    if checksum == 0 {
        checksum = 0xFFFF;
    }
    packet[u + 6..u + 8].copy_from_slice(&checksum.to_be_bytes());

    packet
}
