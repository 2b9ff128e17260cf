//! Redirection orchestrator.
//!
//! Commits a flow to a backend, tears down the LIH side, then replays the
//! buffered conversation to the backend one exchange at a time. Each EXT
//! packet is forwarded as-is; each LIH packet in the buffer becomes the
//! expectation the backend's next reply is checked against.

use std::net::SocketAddrV4;
use std::sync::atomic::Ordering;
use std::sync::Arc;

use crate::decision::Verdict;
use crate::error::{EngineError, Mismatch, Result};
use crate::flow::{
    ConnInner, ConnStatus, Connection, ExpectedData, FlowTable, HihBinding, RedirectKey,
    RedirectTarget,
};
use crate::forward::{delta_between, seq_to_ext, Forwarder};
use crate::metrics::Metrics;
use crate::packet::{Origin, Packet, Protocol};

/// Compare a backend reply with the recorded expectation.
pub fn check_expected(inner: &ConnInner, pkt: &Packet) -> std::result::Result<(), Mismatch> {
    let expected = inner.expected.as_ref().ok_or(Mismatch::NoExpectation)?;
    if expected.protocol != pkt.protocol() {
        return Err(Mismatch::Protocol);
    }
    if let Some(tcp) = pkt.tcp() {
        let delta = inner.hih.map(|h| h.delta).unwrap_or(0);
        if expected.syn != tcp.flags.syn {
            return Err(Mismatch::Sequence);
        }
        // The backend picks its own ISN, so a SYN reply can't be checked.
        if !tcp.flags.syn && seq_to_ext(tcp.seq, delta) != expected.tcp_seq {
            return Err(Mismatch::Sequence);
        }
        if tcp.ack != expected.tcp_ack {
            return Err(Mismatch::Ack);
        }
    }
    if pkt.payload() != expected.payload.as_slice() {
        return Err(Mismatch::Payload);
    }
    Ok(())
}

pub struct Redirector {
    table: Arc<FlowTable>,
    forwarder: Arc<Forwarder>,
    metrics: Arc<Metrics>,
}

impl Redirector {
    pub fn new(table: Arc<FlowTable>, forwarder: Arc<Forwarder>, metrics: Arc<Metrics>) -> Self {
        Redirector {
            table,
            forwarder,
            metrics,
        }
    }

    /// Hand `conn` over to backend `backend_id` and start replaying.
    ///
    /// Fails with `BackendBusy` when the backend already serves a flow from
    /// the same external endpoint; the flow is then left untouched.
    pub fn commit_backend(&self, conn: &Connection, backend_id: u64) -> Result<()> {
        if backend_id == 0 {
            return Err(EngineError::NoBackend);
        }
        let backend = self
            .table
            .target(conn.target)
            .and_then(|t| t.backend(backend_id))
            .ok_or(EngineError::UnknownBackend(backend_id))?;

        let lih = conn.honeypot_endpoint();
        let ext = conn.ext_endpoint();
        let hih = SocketAddrV4::new(backend.addr, backend.port.unwrap_or(lih.port()));
        let redirect_key = RedirectKey {
            protocol: conn.protocol(),
            backend: hih,
            ext,
        };
        let mark = conn.read().uplink_mark.unwrap_or(0);

        // Table lock first, record lock second; never the other way round.
        self.table
            .reserve_redirection(redirect_key, RedirectTarget { lih, mark })?;

        let mut inner = conn.write();
        if !matches!(inner.status, ConnStatus::Init | ConnStatus::Decision) {
            let from = inner.status;
            drop(inner);
            self.table.release_redirection(&redirect_key);
            return Err(EngineError::InvalidTransition {
                from,
                to: ConnStatus::Replay,
            });
        }
        inner.hih = Some(HihBinding {
            backend_id,
            hih,
            lih,
            delta: 0,
            delta_known: false,
            redirect_key,
        });
        inner.switch_state(conn.id, ConnStatus::Replay)?;
        self.metrics.redirections_total.fetch_add(1, Ordering::Relaxed);
        log::info!(
            "flow {}: redirected to backend {} at {} ({} packets buffered)",
            conn.id,
            backend_id,
            hih,
            inner.buffer().len()
        );

        if let Err(e) = self.reset_lih(conn, &inner) {
            log::warn!("flow {}: could not reset LIH side: {}", conn.id, e);
        }
        self.drain(conn, &mut inner);
        Ok(())
    }

    /// Send a RST to the LIH, built from the last packet it sent.
    fn reset_lih(&self, conn: &Connection, inner: &ConnInner) -> Result<()> {
        if conn.protocol() != Protocol::Tcp {
            return Ok(());
        }
        match inner.last_lih_packet() {
            Some(pkt) => {
                self.forwarder.reply_reset(pkt)?;
                log::debug!("flow {}: reset sent to {}", conn.id, pkt.src());
                Ok(())
            }
            None => {
                log::debug!("flow {}: LIH never answered, nothing to reset", conn.id);
                Ok(())
            }
        }
    }

    /// Replay from the cursor until the next LIH packet, which becomes the
    /// expectation, or until the buffer runs out, which ends the replay.
    fn drain(&self, conn: &Connection, inner: &mut ConnInner) {
        let Some(binding) = inner.hih else {
            return;
        };
        while let Some(pkt) = inner.next_replay() {
            let expected = match pkt.origin {
                Origin::Ext => {
                    if let Err(e) = self.forwarder.forward(pkt, &binding) {
                        log::debug!(
                            "flow {}: replay of packet {:?} not delivered: {}",
                            conn.id,
                            pkt.position,
                            e
                        );
                    }
                    None
                }
                Origin::Lih => Some(ExpectedData::from_packet(pkt)),
                Origin::Hih => None,
            };
            inner.advance_cursor();
            if let Some(expected) = expected {
                log::debug!(
                    "flow {}: waiting for backend reply matching packet {}",
                    conn.id,
                    inner.replay_cursor() - 1
                );
                inner.expected = Some(expected);
                return;
            }
        }

        inner.expected = None;
        if let Err(e) = inner.switch_state(conn.id, ConnStatus::Forward) {
            log::warn!("flow {}: replay finished but {}", conn.id, e);
        }
    }

    /// Check a backend reply against the expectation without consuming it.
    pub fn test_expected(&self, conn: &Connection, pkt: &Packet) -> Verdict {
        let inner = conn.write();
        match check_expected(&inner, pkt) {
            Ok(()) => Verdict::Accept,
            Err(m) => {
                log::debug!("flow {}: backend reply rejected: {}", conn.id, m);
                Verdict::Reject
            }
        }
    }

    /// Consume a backend reply during replay and continue draining.
    pub fn replay(&self, conn: &Connection, pkt: &Packet) -> Result<()> {
        let mut inner = conn.write();
        if inner.status != ConnStatus::Replay {
            return Err(EngineError::InvalidTransition {
                from: inner.status,
                to: ConnStatus::Replay,
            });
        }
        if let Err(m) = check_expected(&inner, pkt) {
            self.metrics
                .replay_mismatches_total
                .fetch_add(1, Ordering::Relaxed);
            log::warn!("flow {}: backend reply {} rejected: {}", conn.id, pkt.flow_key(), m);
            return Err(EngineError::ReplayMismatch(m));
        }

        let expected = inner.expected.take();
        if let (Some(expected), Some(tcp), Some(binding)) =
            (expected.as_ref(), pkt.tcp(), inner.hih.as_mut())
        {
            if expected.syn && tcp.flags.syn && !binding.delta_known {
                binding.delta = delta_between(expected.tcp_seq, tcp.seq);
                binding.delta_known = true;
                log::debug!("flow {}: sequence delta {}", conn.id, binding.delta);
            }
        }
        self.drain(conn, &mut inner);
        Ok(())
    }

    /// EXT traffic arriving once a flow is committed: buffered behind the
    /// replay, or sent straight on once forwarding.
    pub fn enqueue(&self, conn: &Connection, pkt: Packet) -> Result<()> {
        let mut inner = conn.write();
        match inner.status {
            ConnStatus::Replay => {
                inner.store_packet(pkt)?;
                if inner.expected.is_none() {
                    self.drain(conn, &mut inner);
                }
                Ok(())
            }
            ConnStatus::Forward => {
                let binding = inner.hih.ok_or(EngineError::NoBackend)?;
                drop(inner);
                self.forwarder.forward(&pkt, &binding)
            }
            from => Err(EngineError::InvalidTransition {
                from,
                to: ConnStatus::Replay,
            }),
        }
    }
}
