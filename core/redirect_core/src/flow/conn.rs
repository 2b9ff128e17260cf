//! Connection records and their state machine.
//!
//! ```text
//!            ┌─────────┐  LIH-initiated
//!            │ CONTROL │◄──────────────── (new)
//!            └─────────┘                    │
//!                                           ▼
//!   ┌──────┐   decide   ┌──────────┐ accept ┌────────┐ drained ┌─────────┐
//!   │ INIT │───────────►│ DECISION │───────►│ REPLAY │────────►│ FORWARD │
//!   └──────┘◄───────────└──────────┘        └────────┘         └─────────┘
//!          reject/defer
//!
//!   any state ──reaper / FIN teardown──► EXPIRED
//! ```

use std::any::Any;
use std::fmt;
use std::net::SocketAddrV4;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant, SystemTime};

use parking_lot::{RwLock, RwLockReadGuard, RwLockWriteGuard};

use crate::error::{EngineError, Result};
use crate::flow::key::{FlowKey, RedirectKey};
use crate::packet::{Origin, Packet, Protocol};

pub const STATUS_COUNT: usize = 7;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConnStatus {
    Invalid,
    Init,
    Decision,
    Replay,
    Forward,
    Control,
    Expired,
}

impl ConnStatus {
    pub fn index(self) -> usize {
        self as usize
    }

    /// Whether the state machine allows moving from `self` to `to`.
    pub fn can_switch_to(self, to: ConnStatus) -> bool {
        use ConnStatus::*;
        match (self, to) {
            (a, b) if a == b => true,
            (Expired, _) => false,
            (_, Expired) => true,
            (Invalid, Init) | (Invalid, Control) => true,
            (Init, Decision) | (Init, Replay) => true,
            (Decision, Init) | (Decision, Replay) => true,
            (Replay, Forward) => true,
            _ => false,
        }
    }
}

impl fmt::Display for ConnStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ConnStatus::Invalid => "INVALID",
            ConnStatus::Init => "INIT",
            ConnStatus::Decision => "DECISION",
            ConnStatus::Replay => "REPLAY",
            ConnStatus::Forward => "FORWARD",
            ConnStatus::Control => "CONTROL",
            ConnStatus::Expired => "EXPIRED",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct StateStats {
    pub packets: u64,
    pub bytes: u64,
    pub entered_at: Option<Instant>,
}

#[derive(Debug, Clone, Default)]
pub struct ConnStats {
    pub per_state: [StateStats; STATUS_COUNT],
    pub total_packets: u64,
    pub total_bytes: u64,
    pub ext_packets: u64,
    pub lih_packets: u64,
    pub hih_packets: u64,
}

/// Predicted next HIH response while a flow is replaying.
///
/// `tcp_seq` is in the LIH's sequence space, `tcp_ack` in the external
/// peer's (which the backend shares, since EXT sequence numbers are never
/// rewritten).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExpectedData {
    pub protocol: Protocol,
    pub tcp_seq: u32,
    pub tcp_ack: u32,
    pub syn: bool,
    pub payload: Vec<u8>,
}

impl ExpectedData {
    pub fn from_packet(pkt: &Packet) -> Self {
        let (tcp_seq, tcp_ack, syn) = match pkt.tcp() {
            Some(t) => (t.seq, t.ack, t.flags.syn),
            None => (0, 0, false),
        };
        ExpectedData {
            protocol: pkt.protocol(),
            tcp_seq,
            tcp_ack,
            syn,
            payload: pkt.payload().to_vec(),
        }
    }
}

/// Where a committed flow now lives.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HihBinding {
    pub backend_id: u64,
    /// Backend socket EXT traffic is rewritten to
    pub hih: SocketAddrV4,
    /// LIH socket HIH traffic is rewritten from
    pub lih: SocketAddrV4,
    /// `lih_seq - hih_seq`, wrapping
    pub delta: u32,
    /// Set once the backend's SYN has been seen
    pub delta_known: bool,
    pub redirect_key: RedirectKey,
}

/// Per-flow state attached by a decision module.
pub trait ConnExtension: Send + Sync + fmt::Debug {
    fn owner(&self) -> &str;

    fn as_any(&self) -> &dyn Any;

    /// Called once when the flow is reaped.
    fn release(&mut self) {}
}

/// Mutable part of a connection record, guarded by the record lock.
#[derive(Debug)]
pub struct ConnInner {
    pub status: ConnStatus,
    pub last_access: Instant,
    replay_cursor: usize,
    /// FIN seen from the initiator's side
    pub fin_in: bool,
    /// FIN seen from the responder's side
    pub fin_out: bool,
    pub expected: Option<ExpectedData>,
    buffer: Vec<Packet>,
    max_buffer: usize,
    pub stats: ConnStats,
    pub decision_trail: String,
    pub hih: Option<HihBinding>,
    pub uplink_mark: Option<u32>,
    pub downlink_mark: Option<u32>,
    extensions: Vec<Box<dyn ConnExtension>>,
}

impl ConnInner {
    fn new(status: ConnStatus, max_buffer: usize, now: Instant) -> Self {
        let mut stats = ConnStats::default();
        stats.per_state[status.index()].entered_at = Some(now);
        ConnInner {
            status,
            last_access: now,
            replay_cursor: 0,
            fin_in: false,
            fin_out: false,
            expected: None,
            buffer: Vec::new(),
            max_buffer,
            stats,
            decision_trail: String::new(),
            hih: None,
            uplink_mark: None,
            downlink_mark: None,
            extensions: Vec::new(),
        }
    }

    pub fn switch_state(&mut self, id: u64, to: ConnStatus) -> Result<()> {
        let from = self.status;
        if !from.can_switch_to(to) {
            return Err(EngineError::InvalidTransition { from, to });
        }
        if from != to {
            log::info!("flow {}: switching state {} -> {}", id, from, to);
            self.status = to;
            self.stats.per_state[to.index()].entered_at = Some(Instant::now());
        }
        Ok(())
    }

    /// Append to the replay buffer, returning the packet's position.
    pub fn store_packet(&mut self, mut pkt: Packet) -> Result<usize> {
        if self.buffer.len() >= self.max_buffer {
            return Err(EngineError::FlowBufferFull(self.max_buffer));
        }
        let position = self.buffer.len();
        pkt.position = Some(position);
        self.buffer.push(pkt);
        Ok(position)
    }

    pub fn buffer(&self) -> &[Packet] {
        &self.buffer
    }

    pub fn replay_cursor(&self) -> usize {
        self.replay_cursor
    }

    /// Packet under the replay cursor, if any.
    pub fn next_replay(&self) -> Option<&Packet> {
        self.buffer.get(self.replay_cursor)
    }

    /// Move the cursor one packet forward, never past the end.
    pub fn advance_cursor(&mut self) {
        if self.replay_cursor < self.buffer.len() {
            self.replay_cursor += 1;
        }
    }

    pub fn replay_exhausted(&self) -> bool {
        self.replay_cursor >= self.buffer.len()
    }

    /// Most recent buffered packet from the LIH.
    pub fn last_lih_packet(&self) -> Option<&Packet> {
        self.buffer.iter().rev().find(|p| p.origin == Origin::Lih)
    }

    /// Account a packet against the current state.
    pub fn record_packet(&mut self, pkt: &Packet, now: Instant) {
        let len = pkt.len() as u64;
        let slot = &mut self.stats.per_state[self.status.index()];
        slot.packets += 1;
        slot.bytes += len;
        self.stats.total_packets += 1;
        self.stats.total_bytes += len;
        match pkt.origin {
            Origin::Ext => {
                self.stats.ext_packets += 1;
                self.uplink_mark.get_or_insert(pkt.mark);
            }
            Origin::Lih => self.stats.lih_packets += 1,
            Origin::Hih => {
                self.stats.hih_packets += 1;
                self.downlink_mark.get_or_insert(pkt.mark);
            }
        }
        self.last_access = now;
    }

    pub fn fin_both(&self) -> bool {
        self.fin_in && self.fin_out
    }

    pub fn idle_for(&self, now: Instant) -> Duration {
        now.saturating_duration_since(self.last_access)
    }

    pub fn append_trail(&mut self, entry: &str) {
        if !self.decision_trail.is_empty() {
            self.decision_trail.push_str(", ");
        }
        self.decision_trail.push_str(entry);
    }

    pub fn add_extension(&mut self, ext: Box<dyn ConnExtension>) {
        self.extensions.push(ext);
    }

    pub fn extension(&self, owner: &str) -> Option<&dyn ConnExtension> {
        self.extensions
            .iter()
            .find(|e| e.owner() == owner)
            .map(|e| e.as_ref())
    }

    /// Free buffered packets and hand extensions back to their owners.
    /// Returns the number of packets dropped.
    pub(crate) fn release(&mut self) -> usize {
        let freed = self.buffer.len();
        self.buffer.clear();
        self.buffer.shrink_to_fit();
        self.replay_cursor = 0;
        self.expected = None;
        for mut ext in self.extensions.drain(..) {
            ext.release();
        }
        freed
    }
}

/// One tracked bidirectional conversation.
///
/// `key.src` is always the external side and `key.dst` the honeypot side,
/// whoever initiated.
#[derive(Debug)]
pub struct Connection {
    pub id: u64,
    pub key: FlowKey,
    pub initiator: Origin,
    /// Index of the target this flow was matched against
    pub target: usize,
    pub created: SystemTime,
    /// Set once the record is doomed; readable without the record lock
    expired: AtomicBool,
    inner: RwLock<ConnInner>,
}

impl Connection {
    pub fn new(
        id: u64,
        key: FlowKey,
        initiator: Origin,
        target: usize,
        max_buffer: usize,
        now: Instant,
    ) -> Self {
        let status = match initiator {
            Origin::Lih => ConnStatus::Control,
            _ => ConnStatus::Init,
        };
        Connection {
            id,
            key,
            initiator,
            target,
            created: SystemTime::now(),
            expired: AtomicBool::new(false),
            inner: RwLock::new(ConnInner::new(status, max_buffer, now)),
        }
    }

    pub fn read(&self) -> RwLockReadGuard<'_, ConnInner> {
        self.inner.read()
    }

    pub fn write(&self) -> RwLockWriteGuard<'_, ConnInner> {
        self.inner.write()
    }

    pub fn status(&self) -> ConnStatus {
        self.inner.read().status
    }

    pub fn is_expired(&self) -> bool {
        self.expired.load(Ordering::Acquire)
    }

    /// Move `inner` (this record's own guard) to EXPIRED. Returns false if
    /// it already was.
    pub(crate) fn doom(&self, inner: &mut ConnInner) -> bool {
        if self.expired.swap(true, Ordering::AcqRel) {
            return false;
        }
        inner.status = ConnStatus::Expired;
        inner.expected = None;
        log::debug!("flow {}: marked expired", self.id);
        true
    }

    pub fn protocol(&self) -> Protocol {
        self.key.protocol
    }

    pub fn ext_endpoint(&self) -> SocketAddrV4 {
        self.key.src
    }

    pub fn honeypot_endpoint(&self) -> SocketAddrV4 {
        self.key.dst
    }
}
