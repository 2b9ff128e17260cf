//! The flow table.
//!
//! Owns every connection record and the pending-redirection index. Lookups
//! run under the reader lock; creation, redirection reservations and removal
//! take the writer lock. Removal is always two-phase: records are first
//! marked EXPIRED under their own lock, then stolen from the map in one batch.

use std::collections::HashMap;
use std::net::SocketAddrV4;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::RwLock;

use crate::error::{EngineError, Result};
use crate::flow::conn::{ConnStatus, Connection};
use crate::flow::key::{FlowKey, RedirectKey, RedirectTarget};
use crate::packet::{Origin, Packet};
use crate::target::Target;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TableStats {
    pub flows: usize,
    pub redirections: usize,
    pub created_total: u64,
}

#[derive(Default)]
struct TableState {
    conns: HashMap<FlowKey, Arc<Connection>>,
    redirections: HashMap<RedirectKey, RedirectTarget>,
}

/// A record picked for removal, already EXPIRED.
#[derive(Debug)]
pub(crate) struct Marked {
    key: FlowKey,
    conn: Arc<Connection>,
    redirect: Option<RedirectKey>,
}

pub struct FlowTable {
    state: RwLock<TableState>,
    targets: Vec<Target>,
    max_buffer: usize,
    next_id: AtomicU64,
}

impl FlowTable {
    pub fn new(targets: Vec<Target>, max_buffer: usize) -> Self {
        FlowTable {
            state: RwLock::new(TableState::default()),
            targets,
            max_buffer,
            next_id: AtomicU64::new(1),
        }
    }

    pub fn targets(&self) -> &[Target] {
        &self.targets
    }

    pub fn target(&self, index: usize) -> Option<&Target> {
        self.targets.get(index)
    }

    pub fn len(&self) -> usize {
        self.state.read().conns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn stats(&self) -> TableStats {
        let state = self.state.read();
        TableStats {
            flows: state.conns.len(),
            redirections: state.redirections.len(),
            created_total: self.next_id.load(Ordering::Relaxed) - 1,
        }
    }

    pub fn get(&self, key: &FlowKey) -> Option<Arc<Connection>> {
        self.state.read().conns.get(key).cloned()
    }

    // ========================================================================
    // Lookup
    // ========================================================================

    /// Resolve the flow a packet belongs to and set its origin.
    ///
    /// Tries the packet's own direction, then the reverse, then the
    /// pending-redirection index, then pre-DNAT recognition of replies to
    /// backend-initiated flows. A redirection hit whose flow is gone is an
    /// error rather than a miss.
    pub fn lookup(&self, pkt: &mut Packet) -> Result<Option<Arc<Connection>>> {
        let key = pkt.flow_key();
        let state = self.state.read();

        if let Some(conn) = state.conns.get(&key) {
            pkt.origin = Origin::Ext;
            return Ok(Some(conn.clone()));
        }

        if let Some(conn) = state.conns.get(&key.reversed()) {
            pkt.origin = match conn.initiator {
                Origin::Ext => Origin::Lih,
                Origin::Hih => Origin::Hih,
                Origin::Lih => Origin::Lih,
            };
            return Ok(Some(conn.clone()));
        }

        let redirect = RedirectKey {
            protocol: key.protocol,
            backend: key.src,
            ext: key.dst,
        };
        if let Some(target) = state.redirections.get(&redirect) {
            let flow = FlowKey::new(key.protocol, key.dst, target.lih);
            return match state.conns.get(&flow) {
                Some(conn) => {
                    pkt.origin = Origin::Hih;
                    Ok(Some(conn.clone()))
                }
                None => Err(EngineError::OrphanRedirection(redirect.to_string())),
            };
        }

        for target in self.targets.iter().filter(|t| t.is_uplink(pkt.ip.dst)) {
            for backend in &target.backends {
                let flow = FlowKey::new(
                    key.protocol,
                    key.src,
                    SocketAddrV4::new(backend.addr, key.dst.port()),
                );
                if let Some(conn) = state.conns.get(&flow) {
                    if conn.initiator == Origin::Hih {
                        pkt.origin = Origin::Ext;
                        return Ok(Some(conn.clone()));
                    }
                }
            }
        }

        Ok(None)
    }

    /// Find the packet's flow, creating one when policy allows.
    pub fn lookup_or_create(
        &self,
        pkt: &mut Packet,
        now: Instant,
    ) -> Result<(Arc<Connection>, bool)> {
        if let Some(conn) = self.lookup(pkt)? {
            if !conn.is_expired() {
                let teardown = {
                    let mut inner = conn.write();
                    let teardown = match pkt.tcp() {
                        Some(tcp) => inner.fin_both() && !tcp.flags.ack_only(),
                        None => false,
                    };
                    if !teardown {
                        if pkt.tcp().map(|t| t.flags.fin).unwrap_or(false) {
                            if pkt.origin == conn.initiator {
                                inner.fin_in = true;
                            } else {
                                inner.fin_out = true;
                            }
                        }
                        inner.record_packet(pkt, now);
                    }
                    teardown
                };
                if !teardown {
                    pkt.attach(&conn);
                    return Ok((conn, false));
                }
                log::debug!(
                    "flow {}: both sides closed, expiring before port reuse",
                    conn.id
                );
                self.expire(&conn);
            }
        }
        self.create(pkt, now)
    }

    /// Pick target and initiator for a packet that matched no flow.
    fn route(&self, pkt: &Packet) -> Option<(usize, Origin, FlowKey)> {
        if let Some(i) = self.targets.iter().position(|t| t.matches(pkt)) {
            return Some((i, Origin::Ext, pkt.flow_key()));
        }
        let src = pkt.ip.src;
        self.targets.iter().enumerate().find_map(|(i, t)| {
            if t.lih == src {
                Some((i, Origin::Lih, pkt.flow_key().reversed()))
            } else if t.backend_by_addr(src).is_some() {
                Some((i, Origin::Hih, pkt.flow_key().reversed()))
            } else {
                None
            }
        })
    }

    fn create(&self, pkt: &mut Packet, now: Instant) -> Result<(Arc<Connection>, bool)> {
        if let Some(tcp) = pkt.tcp() {
            if !tcp.flags.syn {
                return Err(EngineError::NoSuchFlow(pkt.flow_key().to_string()));
            }
        }
        let (target, initiator, key) = self
            .route(pkt)
            .ok_or_else(|| EngineError::UnroutablePacket(pkt.flow_key().to_string()))?;
        pkt.origin = initiator;

        let conn = {
            let mut state = self.state.write();
            // Another worker may have created it between our lookup and now.
            let existing = state.conns.get(&key).filter(|c| !c.is_expired()).cloned();
            if let Some(existing) = existing {
                drop(state);
                existing.write().record_packet(pkt, now);
                pkt.attach(&existing);
                return Ok((existing, false));
            }
            let id = self.next_id.fetch_add(1, Ordering::Relaxed);
            let conn = Arc::new(Connection::new(
                id,
                key,
                initiator,
                target,
                self.max_buffer,
                now,
            ));
            state.conns.insert(key, conn.clone());
            conn
        };

        conn.write().record_packet(pkt, now);
        pkt.attach(&conn);
        log::info!(
            "flow {}: new {} flow {} initiated by {} (target {}, {})",
            conn.id,
            key.protocol,
            key,
            initiator,
            target,
            conn.status()
        );
        Ok((conn, true))
    }

    // ========================================================================
    // Pending-redirection index
    // ========================================================================

    /// Admission check: at most one flow per backend x external endpoint.
    pub fn reserve_redirection(&self, key: RedirectKey, target: RedirectTarget) -> Result<()> {
        let mut state = self.state.write();
        if state.redirections.contains_key(&key) {
            return Err(EngineError::BackendBusy(key.to_string()));
        }
        log::debug!("redirection {} -> {} reserved", key, target);
        state.redirections.insert(key, target);
        Ok(())
    }

    pub fn release_redirection(&self, key: &RedirectKey) -> bool {
        self.state.write().redirections.remove(key).is_some()
    }

    pub fn redirection(&self, key: &RedirectKey) -> Option<RedirectTarget> {
        self.state.read().redirections.get(key).copied()
    }

    // ========================================================================
    // Removal
    // ========================================================================

    /// Phase one: mark idle or invalid records EXPIRED without touching the map.
    pub(crate) fn mark_expired(&self, now: Instant, delay: Duration) -> Vec<Marked> {
        let state = self.state.read();
        let mut marked = Vec::new();
        for (key, conn) in state.conns.iter() {
            let mut inner = conn.write();
            let dead = matches!(inner.status, ConnStatus::Invalid | ConnStatus::Expired)
                || inner.idle_for(now) > delay;
            if !dead {
                continue;
            }
            conn.doom(&mut inner);
            marked.push(Marked {
                key: *key,
                conn: conn.clone(),
                redirect: inner.hih.map(|h| h.redirect_key),
            });
        }
        marked
    }

    /// Phase two: remove marked records in one writer-locked batch, then free
    /// their resources outside the lock. Returns how many were removed.
    pub(crate) fn steal(&self, marked: Vec<Marked>) -> usize {
        let mut stolen = Vec::with_capacity(marked.len());
        {
            let mut state = self.state.write();
            for m in marked {
                let same = state
                    .conns
                    .get(&m.key)
                    .map(|c| Arc::ptr_eq(c, &m.conn))
                    .unwrap_or(false);
                // The index entry belongs to the doomed record even when the
                // key has since been reused by a fresh flow.
                if let Some(redirect) = m.redirect {
                    let claimed_by_successor = !same
                        && state
                            .conns
                            .get(&m.key)
                            .and_then(|c| c.read().hih.map(|h| h.redirect_key))
                            == Some(redirect);
                    let owned = !claimed_by_successor
                        && state
                            .redirections
                            .get(&redirect)
                            .map(|t| t.lih == m.key.dst)
                            .unwrap_or(false);
                    if owned {
                        state.redirections.remove(&redirect);
                    }
                }
                if same {
                    state.conns.remove(&m.key);
                }
                stolen.push((m.conn, same));
            }
        }
        let mut removed = 0;
        for (conn, same) in &stolen {
            let freed = conn.write().release();
            if *same {
                removed += 1;
                log::info!(
                    "flow {}: expired and removed ({} buffered packets freed)",
                    conn.id,
                    freed
                );
            } else {
                log::debug!(
                    "flow {}: expired after key reuse ({} buffered packets freed)",
                    conn.id,
                    freed
                );
            }
        }
        removed
    }

    /// Force-expire one record right away.
    pub fn expire(&self, conn: &Arc<Connection>) -> bool {
        let redirect = {
            let mut inner = conn.write();
            if !conn.doom(&mut inner) {
                return false;
            }
            inner.hih.map(|h| h.redirect_key)
        };
        let marked = Marked {
            key: conn.key,
            conn: conn.clone(),
            redirect,
        };
        self.steal(vec![marked]) == 1
    }
}
