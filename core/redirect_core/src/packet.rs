//! Packet classification.
//!
//! A raw IPv4 frame is validated and parsed once into owned per-layer header
//! structs. Nothing downstream reinterprets the raw bytes: the forwarder
//! rewrites a copy of the frame at fixed offsets derived from these headers.

use std::fmt;
use std::net::{Ipv4Addr, SocketAddrV4};
use std::sync::{Arc, Weak};

use etherparse::{Ipv4HeaderSlice, TcpHeaderSlice, UdpHeaderSlice};
use serde::{Deserialize, Serialize};

use crate::checksum::{PROTO_TCP, PROTO_UDP};
use crate::error::{EngineError, Result};
use crate::flow::{Connection, FlowKey};

/// Smallest frame the classifier accepts (IPv4 + TCP without options).
pub const MIN_FRAME_LEN: usize = 40;

/// IHL bounds, in 32-bit words.
const MIN_IHL: u8 = 5;
const MAX_IHL: u8 = 8;

const UDP_HEADER_LEN: usize = 8;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    Tcp,
    Udp,
}

impl Protocol {
    pub fn number(self) -> u8 {
        match self {
            Protocol::Tcp => PROTO_TCP,
            Protocol::Udp => PROTO_UDP,
        }
    }

    pub fn from_number(n: u8) -> Option<Self> {
        match n {
            PROTO_TCP => Some(Protocol::Tcp),
            PROTO_UDP => Some(Protocol::Udp),
            _ => None,
        }
    }
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Protocol::Tcp => write!(f, "tcp"),
            Protocol::Udp => write!(f, "udp"),
        }
    }
}

/// Which side of the redirector a packet comes from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Origin {
    /// External peer (attacker/client)
    Ext,
    /// Low-interaction honeypot frontend
    Lih,
    /// High-interaction honeypot backend
    Hih,
}

impl fmt::Display for Origin {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Origin::Ext => write!(f, "EXT"),
            Origin::Lih => write!(f, "LIH"),
            Origin::Hih => write!(f, "HIH"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct TcpFlags {
    pub fin: bool,
    pub syn: bool,
    pub rst: bool,
    pub psh: bool,
    pub ack: bool,
    pub urg: bool,
}

impl TcpFlags {
    pub fn to_byte(self) -> u8 {
        (self.fin as u8)
            | (self.syn as u8) << 1
            | (self.rst as u8) << 2
            | (self.psh as u8) << 3
            | (self.ack as u8) << 4
            | (self.urg as u8) << 5
    }

    pub fn from_byte(b: u8) -> Self {
        TcpFlags {
            fin: b & 0x01 != 0,
            syn: b & 0x02 != 0,
            rst: b & 0x04 != 0,
            psh: b & 0x08 != 0,
            ack: b & 0x10 != 0,
            urg: b & 0x20 != 0,
        }
    }

    /// A bare ACK: no SYN, FIN, RST, PSH or URG.
    pub fn ack_only(self) -> bool {
        self.ack && !self.syn && !self.fin && !self.rst && !self.psh && !self.urg
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Ipv4Header {
    /// Header length in bytes
    pub header_len: usize,
    pub total_len: usize,
    pub protocol: Protocol,
    pub src: Ipv4Addr,
    pub dst: Ipv4Addr,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TcpHeader {
    pub src_port: u16,
    pub dst_port: u16,
    pub seq: u32,
    pub ack: u32,
    /// Header length in bytes
    pub header_len: usize,
    pub flags: TcpFlags,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UdpHeader {
    pub src_port: u16,
    pub dst_port: u16,
    pub length: usize,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Transport {
    Tcp(TcpHeader),
    Udp(UdpHeader),
}

impl Transport {
    pub fn header_len(&self) -> usize {
        match self {
            Transport::Tcp(t) => t.header_len,
            Transport::Udp(_) => UDP_HEADER_LEN,
        }
    }
}

/// One classified frame plus the metadata the engine attaches to it.
#[derive(Debug, Clone)]
pub struct Packet {
    frame: Vec<u8>,
    pub ip: Ipv4Header,
    pub transport: Transport,
    pub origin: Origin,
    /// Ingress mark supplied by the capture layer
    pub mark: u32,
    /// Capture handle identifier, echoed back with the verdict
    pub packet_id: u32,
    pub payload_len: usize,
    /// Index in the owning flow's buffer once stored
    pub position: Option<usize>,
    conn: Option<Weak<Connection>>,
}

/// Parse and validate a raw IPv4 frame.
pub fn classify(frame: &[u8], mark: u32, packet_id: u32) -> Result<Packet> {
    if frame.len() < MIN_FRAME_LEN {
        return Err(EngineError::MalformedPacket("frame shorter than 40 bytes"));
    }

    let ip = Ipv4HeaderSlice::from_slice(frame)
        .map_err(|_| EngineError::MalformedPacket("unreadable IPv4 header"))?;
    let ihl = ip.ihl();
    if !(MIN_IHL..=MAX_IHL).contains(&ihl) {
        return Err(EngineError::MalformedPacket("IP header length out of range"));
    }
    let header_len = usize::from(ihl) * 4;
    let total_len = usize::from(ip.total_len());
    if total_len > frame.len() {
        return Err(EngineError::MalformedPacket("IP total length exceeds buffer"));
    }
    if total_len < header_len {
        return Err(EngineError::MalformedPacket("IP total length below header length"));
    }
    let protocol = Protocol::from_number(ip.protocol())
        .ok_or(EngineError::UnsupportedProtocol(ip.protocol()))?;
    let src = ip.source_addr();
    let dst = ip.destination_addr();

    // Trailing link-layer padding is not part of the datagram.
    let datagram = &frame[..total_len];
    let segment = &datagram[header_len..];

    let (transport, payload_len) = match protocol {
        Protocol::Tcp => {
            let tcp = TcpHeaderSlice::from_slice(segment)
                .map_err(|_| EngineError::MalformedPacket("unreadable TCP header"))?;
            let tcp_len = usize::from(tcp.data_offset()) * 4;
            if tcp.data_offset() < 5 {
                return Err(EngineError::MalformedPacket("TCP header length below 5 words"));
            }
            if tcp.source_port() == 0 || tcp.destination_port() == 0 {
                return Err(EngineError::MalformedPacket("zero TCP port"));
            }
            let payload_len = (total_len as isize) - (header_len as isize) - (tcp_len as isize);
            if payload_len < 0 {
                return Err(EngineError::MalformedPacket("negative TCP payload length"));
            }
            let header = TcpHeader {
                src_port: tcp.source_port(),
                dst_port: tcp.destination_port(),
                seq: tcp.sequence_number(),
                ack: tcp.acknowledgment_number(),
                header_len: tcp_len,
                flags: TcpFlags {
                    fin: tcp.fin(),
                    syn: tcp.syn(),
                    rst: tcp.rst(),
                    psh: tcp.psh(),
                    ack: tcp.ack(),
                    urg: tcp.urg(),
                },
            };
            (Transport::Tcp(header), payload_len as usize)
        }
        Protocol::Udp => {
            let udp = UdpHeaderSlice::from_slice(segment)
                .map_err(|_| EngineError::MalformedPacket("unreadable UDP header"))?;
            let udp_len = usize::from(udp.length());
            let payload_len = (udp_len as isize) - (UDP_HEADER_LEN as isize);
            if payload_len < 0 {
                return Err(EngineError::MalformedPacket("negative UDP payload length"));
            }
            if udp_len > segment.len() {
                return Err(EngineError::MalformedPacket("UDP length exceeds datagram"));
            }
            let header = UdpHeader {
                src_port: udp.source_port(),
                dst_port: udp.destination_port(),
                length: udp_len,
            };
            (Transport::Udp(header), payload_len as usize)
        }
    };

    Ok(Packet {
        frame: datagram.to_vec(),
        ip: Ipv4Header {
            header_len,
            total_len,
            protocol,
            src,
            dst,
        },
        transport,
        origin: Origin::Ext,
        mark,
        packet_id,
        payload_len,
        position: None,
        conn: None,
    })
}

impl Packet {
    pub fn frame(&self) -> &[u8] {
        &self.frame
    }

    pub fn len(&self) -> usize {
        self.frame.len()
    }

    pub fn is_empty(&self) -> bool {
        self.frame.is_empty()
    }

    pub fn protocol(&self) -> Protocol {
        self.ip.protocol
    }

    pub fn src_port(&self) -> u16 {
        match &self.transport {
            Transport::Tcp(t) => t.src_port,
            Transport::Udp(u) => u.src_port,
        }
    }

    pub fn dst_port(&self) -> u16 {
        match &self.transport {
            Transport::Tcp(t) => t.dst_port,
            Transport::Udp(u) => u.dst_port,
        }
    }

    pub fn src(&self) -> SocketAddrV4 {
        SocketAddrV4::new(self.ip.src, self.src_port())
    }

    pub fn dst(&self) -> SocketAddrV4 {
        SocketAddrV4::new(self.ip.dst, self.dst_port())
    }

    /// `ip:port` of the sender.
    pub fn key_src(&self) -> String {
        self.src().to_string()
    }

    /// `ip:port` of the receiver.
    pub fn key_dst(&self) -> String {
        self.dst().to_string()
    }

    /// Flow key in the direction this packet travels.
    pub fn flow_key(&self) -> FlowKey {
        FlowKey::new(self.protocol(), self.src(), self.dst())
    }

    pub fn tcp(&self) -> Option<&TcpHeader> {
        match &self.transport {
            Transport::Tcp(t) => Some(t),
            Transport::Udp(_) => None,
        }
    }

    pub fn is_tcp_syn(&self) -> bool {
        self.tcp().map(|t| t.flags.syn).unwrap_or(false)
    }

    /// Offset of the first payload byte inside the frame.
    pub fn payload_offset(&self) -> usize {
        self.ip.header_len + self.transport.header_len()
    }

    pub fn payload(&self) -> &[u8] {
        let start = self.payload_offset();
        &self.frame[start..start + self.payload_len]
    }

    pub(crate) fn attach(&mut self, conn: &Arc<Connection>) {
        self.conn = Some(Arc::downgrade(conn));
    }

    /// The owning flow, if it has been resolved and is still alive.
    pub fn connection(&self) -> Option<Arc<Connection>> {
        self.conn.as_ref().and_then(Weak::upgrade)
    }
}
