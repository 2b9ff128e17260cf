//! Header rewriting and raw transmission.
//!
//! EXT traffic of a committed flow is re-addressed to the backend, backend
//! traffic is re-addressed so it appears to come from the LIH. TCP sequence
//! numbers are shifted by the flow's delta so the external peer keeps seeing
//! the LIH's sequence space:
//!
//! ```text
//!   HIH -> EXT   src = LIH ip:port      seq' = seq + delta
//!   EXT -> HIH   dst = HIH ip:port      ack' = ack - delta   (ACK set)
//! ```
//!
//! All arithmetic is modulo 2^32.

use std::io;
use std::net::Ipv4Addr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

use crate::builder::{build_tcp_frame, TcpSegment};
use crate::checksum::{update_checksums, PROTO_TCP, PROTO_UDP};
use crate::error::{EngineError, Result};
use crate::flow::HihBinding;
use crate::metrics::Metrics;
use crate::packet::{Origin, Packet, TcpFlags};

// ============================================================================
// Sequence arithmetic
// ============================================================================

/// Offset turning backend sequence numbers into LIH ones.
pub fn delta_between(lih_seq: u32, hih_seq: u32) -> u32 {
    lih_seq.wrapping_sub(hih_seq)
}

pub fn seq_to_ext(hih_seq: u32, delta: u32) -> u32 {
    hih_seq.wrapping_add(delta)
}

pub fn ack_to_hih(ext_ack: u32, delta: u32) -> u32 {
    ext_ack.wrapping_sub(delta)
}

// ============================================================================
// Raw send path
// ============================================================================

/// Sink for complete, checksum-valid IPv4 frames.
pub trait RawSender: Send + Sync {
    fn send(&self, frame: &[u8]) -> io::Result<usize>;
}

/// `SOCK_RAW` sockets with `IP_HDRINCL`, one per transport protocol.
pub struct RawSocketSender {
    tcp_fd: libc::c_int,
    udp_fd: libc::c_int,
}

fn open_raw(protocol: libc::c_int) -> io::Result<libc::c_int> {
    // SAFETY: plain socket(2) call, the descriptor is owned by the caller.
    let fd = unsafe { libc::socket(libc::AF_INET, libc::SOCK_RAW, protocol) };
    if fd < 0 {
        return Err(io::Error::last_os_error());
    }
    let one: libc::c_int = 1;
    // SAFETY: `one` outlives the call and the length matches its type.
    let rc = unsafe {
        libc::setsockopt(
            fd,
            libc::IPPROTO_IP,
            libc::IP_HDRINCL,
            &one as *const libc::c_int as *const libc::c_void,
            std::mem::size_of::<libc::c_int>() as libc::socklen_t,
        )
    };
    if rc < 0 {
        let err = io::Error::last_os_error();
        // SAFETY: fd was returned by socket(2) above and is not shared.
        unsafe { libc::close(fd) };
        return Err(err);
    }
    Ok(fd)
}

impl RawSocketSender {
    /// Needs CAP_NET_RAW.
    pub fn open() -> io::Result<Self> {
        let tcp_fd = open_raw(libc::IPPROTO_TCP)?;
        let udp_fd = match open_raw(libc::IPPROTO_UDP) {
            Ok(fd) => fd,
            Err(e) => {
                // SAFETY: tcp_fd was opened above and is not shared.
                unsafe { libc::close(tcp_fd) };
                return Err(e);
            }
        };
        log::info!("raw sockets open (tcp fd {}, udp fd {})", tcp_fd, udp_fd);
        Ok(RawSocketSender { tcp_fd, udp_fd })
    }
}

impl RawSender for RawSocketSender {
    fn send(&self, frame: &[u8]) -> io::Result<usize> {
        if frame.len() < 20 {
            return Err(io::Error::new(io::ErrorKind::InvalidInput, "frame too short"));
        }
        let fd = match frame[9] {
            PROTO_TCP => self.tcp_fd,
            PROTO_UDP => self.udp_fd,
            other => {
                return Err(io::Error::new(
                    io::ErrorKind::InvalidInput,
                    format!("no raw socket for protocol {}", other),
                ))
            }
        };
        let dst = Ipv4Addr::new(frame[16], frame[17], frame[18], frame[19]);

        // SAFETY: sockaddr_in is plain old data; all-zero is a valid value.
        let mut addr: libc::sockaddr_in = unsafe { std::mem::zeroed() };
        addr.sin_family = libc::AF_INET as libc::sa_family_t;
        addr.sin_port = 0;
        addr.sin_addr = libc::in_addr {
            s_addr: u32::from_ne_bytes(dst.octets()),
        };

        // SAFETY: frame and addr are valid for the duration of the call.
        let rc = unsafe {
            libc::sendto(
                fd,
                frame.as_ptr() as *const libc::c_void,
                frame.len(),
                0,
                &addr as *const libc::sockaddr_in as *const libc::sockaddr,
                std::mem::size_of::<libc::sockaddr_in>() as libc::socklen_t,
            )
        };
        if rc < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(rc as usize)
    }
}

impl Drop for RawSocketSender {
    fn drop(&mut self) {
        // SAFETY: both descriptors are owned by self and closed exactly once.
        unsafe {
            libc::close(self.tcp_fd);
            libc::close(self.udp_fd);
        }
    }
}

/// Keeps every frame in memory. Used for tests and dry runs.
#[derive(Default)]
pub struct MemorySender {
    frames: Mutex<Vec<Vec<u8>>>,
    failing: AtomicBool,
}

impl MemorySender {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make subsequent sends fail with `BrokenPipe`.
    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    pub fn sent(&self) -> Vec<Vec<u8>> {
        self.frames.lock().clone()
    }

    pub fn take(&self) -> Vec<Vec<u8>> {
        std::mem::take(&mut *self.frames.lock())
    }
}

impl RawSender for MemorySender {
    fn send(&self, frame: &[u8]) -> io::Result<usize> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(io::Error::new(io::ErrorKind::BrokenPipe, "send disabled"));
        }
        self.frames.lock().push(frame.to_vec());
        Ok(frame.len())
    }
}

// ============================================================================
// Rewriting
// ============================================================================

/// HIH -> EXT: appear to come from the LIH, shift seq into LIH space.
pub fn rewrite_to_ext(frame: &mut [u8], pkt: &Packet, binding: &HihBinding) {
    let t = pkt.ip.header_len;
    frame[12..16].copy_from_slice(&binding.lih.ip().octets());
    frame[t..t + 2].copy_from_slice(&binding.lih.port().to_be_bytes());
    if let Some(tcp) = pkt.tcp() {
        let seq = seq_to_ext(tcp.seq, binding.delta);
        frame[t + 4..t + 8].copy_from_slice(&seq.to_be_bytes());
    }
}

/// EXT -> HIH: re-address to the backend, shift ack into backend space.
pub fn rewrite_to_hih(frame: &mut [u8], pkt: &Packet, binding: &HihBinding) {
    let t = pkt.ip.header_len;
    frame[16..20].copy_from_slice(&binding.hih.ip().octets());
    frame[t + 2..t + 4].copy_from_slice(&binding.hih.port().to_be_bytes());
    if let Some(tcp) = pkt.tcp() {
        if tcp.flags.ack {
            let ack = ack_to_hih(tcp.ack, binding.delta);
            frame[t + 8..t + 12].copy_from_slice(&ack.to_be_bytes());
        }
    }
}

/// Bare RST+ACK answering `pkt`, addressed back to its sender.
pub fn build_reset(pkt: &Packet) -> Result<Vec<u8>> {
    let tcp = pkt
        .tcp()
        .ok_or(EngineError::UnsupportedProtocol(pkt.protocol().number()))?;
    let seq = if tcp.flags.ack { tcp.ack } else { 0 };
    let ack = tcp
        .seq
        .wrapping_add(tcp.flags.syn as u32)
        .wrapping_add(tcp.flags.fin as u32)
        .wrapping_add(pkt.payload_len as u32);
    Ok(build_tcp_frame(&TcpSegment {
        src: pkt.dst(),
        dst: pkt.src(),
        seq,
        ack,
        flags: TcpFlags {
            rst: true,
            ack: true,
            ..TcpFlags::default()
        },
        window: 0,
        payload: &[],
    }))
}

// ============================================================================
// Forwarder
// ============================================================================

pub struct Forwarder {
    sender: Arc<dyn RawSender>,
    metrics: Arc<Metrics>,
}

impl Forwarder {
    pub fn new(sender: Arc<dyn RawSender>, metrics: Arc<Metrics>) -> Self {
        Forwarder { sender, metrics }
    }

    /// Rewrite a copy of `pkt` for the other side of a committed flow and
    /// send it. At most once: failures are reported, never retried.
    pub fn forward(&self, pkt: &Packet, binding: &HihBinding) -> Result<()> {
        let mut frame = pkt.frame().to_vec();
        match pkt.origin {
            Origin::Hih => rewrite_to_ext(&mut frame, pkt, binding),
            Origin::Ext => rewrite_to_hih(&mut frame, pkt, binding),
            Origin::Lih => return Err(EngineError::InvalidOrigin(Origin::Lih)),
        }
        update_checksums(&mut frame)?;
        self.transmit(&frame)?;
        self.metrics.record_forwarded(frame.len());
        Ok(())
    }

    /// Tear down the sender's side of `pkt` with a crafted RST.
    pub fn reply_reset(&self, pkt: &Packet) -> Result<()> {
        let frame = build_reset(pkt)?;
        self.transmit(&frame)
    }

    fn transmit(&self, frame: &[u8]) -> Result<()> {
        match self.sender.send(frame) {
            Ok(n) => {
                log::trace!("sent {} bytes", n);
                Ok(())
            }
            Err(e) => {
                self.metrics.record_send_failure();
                log::warn!("raw send failed: {}", e);
                Err(EngineError::SendFailure(e.to_string()))
            }
        }
    }
}
