//! IPv4 / TCP / UDP checksum codec.
//!
//! All checksums are the RFC 1071 one's-complement sum of 16-bit big-endian
//! words with end-around carry. The transport checksum covers a 12-byte
//! pseudo-header followed by the transport header and payload.

use std::net::Ipv4Addr;

use crate::error::{EngineError, Result};

pub const PROTO_TCP: u8 = 6;
pub const PROTO_UDP: u8 = 17;

/// Offset of the checksum field inside the TCP header.
const TCP_CHECKSUM_OFFSET: usize = 16;
/// Offset of the checksum field inside the UDP header.
const UDP_CHECKSUM_OFFSET: usize = 6;
/// Offset of the checksum field inside the IPv4 header.
const IP_CHECKSUM_OFFSET: usize = 10;

/// Accumulate `data` into a running 32-bit sum (odd trailing byte is padded).
pub fn ones_complement_sum(data: &[u8], initial: u32) -> u32 {
    let mut sum = initial;
    let mut chunks = data.chunks_exact(2);
    for word in &mut chunks {
        sum = sum.wrapping_add(u32::from(u16::from_be_bytes([word[0], word[1]])));
    }
    if let [last] = chunks.remainder() {
        sum = sum.wrapping_add(u32::from(*last) << 8);
    }
    sum
}

/// Fold carries back into 16 bits and complement.
pub fn fold(mut sum: u32) -> u16 {
    while sum >> 16 != 0 {
        sum = (sum & 0xFFFF) + (sum >> 16);
    }
    !(sum as u16)
}

pub fn internet_checksum(data: &[u8]) -> u16 {
    fold(ones_complement_sum(data, 0))
}

/// Synthetic header prepended to a TCP/UDP segment for checksumming.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PseudoHeader {
    pub src: Ipv4Addr,
    pub dst: Ipv4Addr,
    pub protocol: u8,
    pub length: u16,
}

impl PseudoHeader {
    pub fn to_bytes(&self) -> [u8; 12] {
        let mut out = [0u8; 12];
        out[0..4].copy_from_slice(&self.src.octets());
        out[4..8].copy_from_slice(&self.dst.octets());
        out[8] = 0;
        out[9] = self.protocol;
        out[10..12].copy_from_slice(&self.length.to_be_bytes());
        out
    }
}

/// Checksum of `segment` (header + payload, checksum field zeroed) under `pseudo`.
pub fn transport_checksum(pseudo: &PseudoHeader, segment: &[u8]) -> u16 {
    let sum = ones_complement_sum(&pseudo.to_bytes(), 0);
    fold(ones_complement_sum(segment, sum))
}

/// Layout of a frame as far as the checksum fields are concerned.
struct FrameLayout {
    header_len: usize,
    total_len: usize,
    protocol: u8,
}

fn layout(frame: &[u8]) -> Result<FrameLayout> {
    if frame.len() < 20 {
        return Err(EngineError::MalformedPacket("frame shorter than an IPv4 header"));
    }
    let header_len = usize::from(frame[0] & 0x0F) * 4;
    let total_len = usize::from(u16::from_be_bytes([frame[2], frame[3]]));
    if header_len < 20 || total_len < header_len || total_len > frame.len() {
        return Err(EngineError::MalformedPacket("inconsistent IPv4 lengths"));
    }
    Ok(FrameLayout {
        header_len,
        total_len,
        protocol: frame[9],
    })
}

fn addresses(frame: &[u8]) -> (Ipv4Addr, Ipv4Addr) {
    (
        Ipv4Addr::new(frame[12], frame[13], frame[14], frame[15]),
        Ipv4Addr::new(frame[16], frame[17], frame[18], frame[19]),
    )
}

/// Recompute the IPv4 header checksum in place.
pub fn update_ipv4_checksum(frame: &mut [u8]) -> Result<()> {
    let l = layout(frame)?;
    frame[IP_CHECKSUM_OFFSET] = 0;
    frame[IP_CHECKSUM_OFFSET + 1] = 0;
    let csum = internet_checksum(&frame[..l.header_len]);
    frame[IP_CHECKSUM_OFFSET..IP_CHECKSUM_OFFSET + 2].copy_from_slice(&csum.to_be_bytes());
    Ok(())
}

fn checksum_offset(protocol: u8) -> Result<usize> {
    match protocol {
        PROTO_TCP => Ok(TCP_CHECKSUM_OFFSET),
        PROTO_UDP => Ok(UDP_CHECKSUM_OFFSET),
        other => Err(EngineError::UnsupportedProtocol(other)),
    }
}

/// End of the checksummed transport segment: the UDP length field for UDP,
/// the IP total length for TCP.
fn segment_end(frame: &[u8], l: &FrameLayout) -> Result<usize> {
    if l.protocol != PROTO_UDP {
        return Ok(l.total_len);
    }
    if l.header_len + 8 > l.total_len {
        return Err(EngineError::MalformedPacket("UDP header truncated"));
    }
    let udp_len = usize::from(u16::from_be_bytes([
        frame[l.header_len + 4],
        frame[l.header_len + 5],
    ]));
    if udp_len < 8 || l.header_len + udp_len > l.total_len {
        return Err(EngineError::MalformedPacket("UDP length out of range"));
    }
    Ok(l.header_len + udp_len)
}

/// Recompute the TCP or UDP checksum in place.
pub fn update_transport_checksum(frame: &mut [u8]) -> Result<()> {
    let l = layout(frame)?;
    let offset = l.header_len + checksum_offset(l.protocol)?;
    if offset + 2 > l.total_len {
        return Err(EngineError::MalformedPacket("transport header truncated"));
    }
    let end = segment_end(frame, &l)?;
    let (src, dst) = addresses(frame);
    frame[offset] = 0;
    frame[offset + 1] = 0;
    let segment = &frame[l.header_len..end];
    let pseudo = PseudoHeader {
        src,
        dst,
        protocol: l.protocol,
        length: segment.len() as u16,
    };
    let mut csum = transport_checksum(&pseudo, segment);
    // A computed zero is transmitted as all ones; zero means "no checksum" in UDP.
    if l.protocol == PROTO_UDP && csum == 0 {
        csum = 0xFFFF;
    }
    frame[offset..offset + 2].copy_from_slice(&csum.to_be_bytes());
    Ok(())
}

/// Recompute the transport checksum, then the IP checksum.
pub fn update_checksums(frame: &mut [u8]) -> Result<()> {
    update_transport_checksum(frame)?;
    update_ipv4_checksum(frame)
}

pub fn verify_ipv4_checksum(frame: &[u8]) -> bool {
    match layout(frame) {
        Ok(l) => internet_checksum(&frame[..l.header_len]) == 0,
        Err(_) => false,
    }
}

pub fn verify_transport_checksum(frame: &[u8]) -> bool {
    let Ok(l) = layout(frame) else {
        return false;
    };
    if checksum_offset(l.protocol).is_err() {
        return false;
    }
    let Ok(end) = segment_end(frame, &l) else {
        return false;
    };
    let (src, dst) = addresses(frame);
    let segment = &frame[l.header_len..end];
    let pseudo = PseudoHeader {
        src,
        dst,
        protocol: l.protocol,
        length: segment.len() as u16,
    };
    let sum = ones_complement_sum(&pseudo.to_bytes(), 0);
    fold(ones_complement_sum(segment, sum)) == 0
}
