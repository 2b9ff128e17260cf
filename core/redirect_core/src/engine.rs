//! The engine context: everything one capture process shares across its
//! workers, and the per-packet pipeline.
//!
//! ```text
//!   frame ─► classify ─► lookup_or_create ─► state dispatch ─► PacketAction
//!                                               │
//!              INIT/DECISION: buffer, decide, maybe commit
//!              REPLAY:        validate HIH replies, queue EXT
//!              FORWARD:       rewrite and send
//!              CONTROL:       pass
//! ```

use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::config::{ConfigError, EngineConfig};
use crate::decision::{DecisionContext, DecisionTree, ModuleRegistry, Verdict};
use crate::error::{EngineError, Result};
use crate::flow::{ConnInner, ConnStatus, Connection, FlowTable};
use crate::forward::{Forwarder, RawSender};
use crate::metrics::Metrics;
use crate::packet::{classify, Origin, Packet};
use crate::reaper::Reaper;
use crate::redirect::Redirector;

/// What the capture layer should do with the original packet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PacketAction {
    Drop,
    Accept,
}

pub struct Engine {
    table: Arc<FlowTable>,
    forwarder: Arc<Forwarder>,
    redirector: Redirector,
    /// Indexed like the table's targets
    trees: Vec<Option<DecisionTree>>,
    metrics: Arc<Metrics>,
    reaper_interval: Duration,
    expiration: Duration,
}

impl Engine {
    pub fn new(
        config: &EngineConfig,
        registry: &ModuleRegistry,
        sender: Arc<dyn RawSender>,
    ) -> std::result::Result<Self, ConfigError> {
        config.validate()?;
        let trees = config
            .targets
            .iter()
            .map(|t| {
                t.rule
                    .as_ref()
                    .map(|rule| DecisionTree::build(rule, registry))
                    .transpose()
            })
            .collect::<std::result::Result<Vec<_>, ConfigError>>()?;

        let metrics = Arc::new(Metrics::new());
        let table = Arc::new(FlowTable::new(
            config.targets.clone(),
            config.max_packet_buffer,
        ));
        let forwarder = Arc::new(Forwarder::new(sender, metrics.clone()));
        let redirector = Redirector::new(table.clone(), forwarder.clone(), metrics.clone());

        log::info!(
            "engine ready: {} targets, {} with decision rules, buffer {} packets",
            config.targets.len(),
            trees.iter().filter(|t| t.is_some()).count(),
            config.max_packet_buffer
        );
        Ok(Engine {
            table,
            forwarder,
            redirector,
            trees,
            metrics,
            reaper_interval: config.reaper_interval(),
            expiration: config.expiration_delay(),
        })
    }

    pub fn table(&self) -> &Arc<FlowTable> {
        &self.table
    }

    pub fn metrics(&self) -> &Arc<Metrics> {
        &self.metrics
    }

    pub fn redirector(&self) -> &Redirector {
        &self.redirector
    }

    /// A reaper over this engine's table, ready to be spawned.
    pub fn reaper(&self) -> Reaper {
        Reaper::new(
            self.table.clone(),
            self.reaper_interval,
            self.expiration,
            self.metrics.clone(),
        )
    }

    pub fn commit_backend(&self, conn: &Connection, backend_id: u64) -> Result<()> {
        self.redirector.commit_backend(conn, backend_id)
    }

    /// Run one captured frame through the pipeline.
    pub fn process(&self, frame: &[u8], mark: u32, packet_id: u32) -> Result<PacketAction> {
        self.metrics.packets_total.fetch_add(1, Ordering::Relaxed);
        let mut pkt = classify(frame, mark, packet_id).map_err(|e| {
            self.metrics
                .classify_drops_total
                .fetch_add(1, Ordering::Relaxed);
            log::debug!("packet {} dropped: {}", packet_id, e);
            e
        })?;

        let (conn, is_new) = self.table.lookup_or_create(&mut pkt, Instant::now())?;
        if is_new {
            self.metrics
                .flows_created_total
                .fetch_add(1, Ordering::Relaxed);
        }
        log::trace!(
            "flow {}: {} packet {} ({} bytes payload)",
            conn.id,
            pkt.origin,
            packet_id,
            pkt.payload_len
        );

        let result = self.dispatch(&conn, pkt);
        if let Err(EngineError::FlowBufferFull(_)) = &result {
            self.metrics.buffer_full_total.fetch_add(1, Ordering::Relaxed);
        }
        result
    }

    fn dispatch(&self, conn: &Arc<Connection>, pkt: Packet) -> Result<PacketAction> {
        let status = conn.status();
        match status {
            ConnStatus::Control => Ok(PacketAction::Accept),
            ConnStatus::Init | ConnStatus::Decision => self.before_decision(conn, pkt),
            ConnStatus::Replay => match pkt.origin {
                Origin::Hih => {
                    self.redirector.replay(conn, &pkt)?;
                    Ok(PacketAction::Drop)
                }
                Origin::Ext => {
                    self.redirector.enqueue(conn, pkt)?;
                    Ok(PacketAction::Drop)
                }
                Origin::Lih => Ok(PacketAction::Drop),
            },
            ConnStatus::Forward => {
                if pkt.origin == Origin::Lih {
                    return Ok(PacketAction::Drop);
                }
                let binding = conn.read().hih.ok_or(EngineError::NoBackend)?;
                self.forwarder.forward(&pkt, &binding)?;
                Ok(PacketAction::Drop)
            }
            ConnStatus::Expired | ConnStatus::Invalid => {
                Err(EngineError::NoSuchFlow(conn.key.to_string()))
            }
        }
    }

    fn before_decision(&self, conn: &Arc<Connection>, pkt: Packet) -> Result<PacketAction> {
        let tree = match self.trees.get(conn.target) {
            Some(Some(tree)) if pkt.origin == Origin::Ext && conn.initiator == Origin::Ext => tree,
            _ => {
                let mut inner = conn.write();
                if matches!(inner.status, ConnStatus::Init | ConnStatus::Decision) {
                    inner.store_packet(pkt)?;
                    return Ok(PacketAction::Accept);
                }
                // Committed by another worker since dispatch read the status.
                drop(inner);
                return self.dispatch(conn, pkt);
            }
        };

        {
            let mut inner = conn.write();
            if inner.status == ConnStatus::Init {
                inner.switch_state(conn.id, ConnStatus::Decision)?;
            }
        }
        let evaluation = tree.evaluate(&DecisionContext {
            conn: conn.as_ref(),
            packet: &pkt,
        });

        {
            let mut inner = conn.write();
            for entry in &evaluation.trail {
                inner.append_trail(entry);
            }
            let status = inner.status;
            match status {
                ConnStatus::Init | ConnStatus::Decision => {
                    if let Err(e) = inner.store_packet(pkt) {
                        revert_to_init(conn.id, &mut inner);
                        return Err(e);
                    }
                }
                // Committed by another worker while we were deciding.
                _ => {
                    drop(inner);
                    return self.dispatch(conn, pkt);
                }
            }
        }

        if evaluation.verdict != Verdict::Accept {
            log::debug!(
                "flow {}: decision {} ({})",
                conn.id,
                evaluation.verdict,
                evaluation.trail.join(", ")
            );
            revert_to_init(conn.id, &mut conn.write());
            return Ok(PacketAction::Accept);
        }

        let backend = self
            .table
            .target(conn.target)
            .and_then(|t| t.default_backend())
            .unwrap_or(0);
        match self.redirector.commit_backend(conn, backend) {
            Ok(()) => Ok(PacketAction::Drop),
            Err(EngineError::BackendBusy(key)) => {
                self.metrics
                    .redirections_busy_total
                    .fetch_add(1, Ordering::Relaxed);
                log::info!("flow {}: backend busy with {}, staying on LIH", conn.id, key);
                let mut inner = conn.write();
                if inner.status == ConnStatus::Decision {
                    revert_to_init(conn.id, &mut inner);
                    Ok(PacketAction::Accept)
                } else {
                    // Our packet is already in the replay buffer.
                    Ok(PacketAction::Drop)
                }
            }
            Err(e) => {
                revert_to_init(conn.id, &mut conn.write());
                Err(e)
            }
        }
    }
}

fn revert_to_init(id: u64, inner: &mut ConnInner) {
    if inner.status == ConnStatus::Decision {
        if let Err(e) = inner.switch_state(id, ConnStatus::Init) {
            log::warn!("flow {}: {}", id, e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::builder::{build_tcp_frame, build_udp_frame, TcpSegment};
    use crate::config::RuleConfig;
    use crate::decision::{DecisionModule, ModuleConfig};
    use crate::flow::FlowKey;
    use crate::forward::MemorySender;
    use crate::packet::{Protocol, TcpFlags};
    use crate::target::{Backend, CaptureFilter, Target};
    use std::net::{Ipv4Addr, SocketAddrV4};

    const LIH: Ipv4Addr = Ipv4Addr::new(10, 0, 0, 9);
    const HIH: Ipv4Addr = Ipv4Addr::new(10, 0, 1, 3);

    fn ext() -> SocketAddrV4 {
        SocketAddrV4::new(Ipv4Addr::new(10, 0, 0, 5), 4444)
    }

    fn lih() -> SocketAddrV4 {
        SocketAddrV4::new(LIH, 80)
    }

    fn config(rule: Option<RuleConfig>) -> EngineConfig {
        EngineConfig {
            max_packet_buffer: 8,
            expiration_delay_secs: 120,
            reaper_interval_secs: 60,
            workers: 1,
            state_dir: None,
            targets: vec![Target {
                filter: CaptureFilter {
                    dst_host: Some(LIH),
                    ..CaptureFilter::default()
                },
                lih: LIH,
                backends: vec![Backend { id: 3, addr: HIH, port: None }],
                uplinks: vec![],
                rule,
                backend: None,
            }],
        }
    }

    fn yesno(value: &str) -> RuleConfig {
        RuleConfig {
            module: "yesno".to_string(),
            config: [("value".to_string(), value.to_string())].into_iter().collect(),
            accept: None,
            reject: None,
        }
    }

    fn engine(rule: Option<RuleConfig>) -> (Engine, Arc<MemorySender>) {
        let sender = Arc::new(MemorySender::new());
        let registry = ModuleRegistry::with_defaults(None).unwrap();
        let engine = Engine::new(&config(rule), &registry, sender.clone()).unwrap();
        (engine, sender)
    }

    fn frame(src: SocketAddrV4, dst: SocketAddrV4, seq: u32, ack: u32, flags: TcpFlags) -> Vec<u8> {
        build_tcp_frame(&TcpSegment { src, dst, seq, ack, flags, window: 1000, payload: &[] })
    }

    fn syn() -> TcpFlags {
        TcpFlags { syn: true, ..TcpFlags::default() }
    }

    #[test]
    fn test_malformed_frame_counted() {
        let (engine, _) = engine(None);
        assert!(matches!(
            engine.process(&[0u8; 10], 0, 1),
            Err(EngineError::MalformedPacket(_))
        ));
        let s = engine.metrics().snapshot();
        assert_eq!(s.packets, 1);
        assert_eq!(s.classify_drops, 1);
        assert!(engine.table().is_empty());
    }

    #[test]
    fn test_no_rule_passes_to_lih() {
        let (engine, sender) = engine(None);
        let action = engine.process(&frame(ext(), lih(), 1, 0, syn()), 0, 1).unwrap();
        assert_eq!(action, PacketAction::Accept);
        assert_eq!(engine.metrics().snapshot().flows_created, 1);
        assert!(sender.sent().is_empty());

        let conn = engine
            .table()
            .get(&FlowKey::new(Protocol::Tcp, ext(), lih()))
            .unwrap();
        assert_eq!(conn.status(), ConnStatus::Init);
        assert_eq!(conn.read().buffer().len(), 1);
    }

    #[test]
    fn test_reject_records_trail_and_accepts() {
        let (engine, sender) = engine(Some(yesno("no")));
        let action = engine.process(&frame(ext(), lih(), 1, 0, syn()), 0, 1).unwrap();
        assert_eq!(action, PacketAction::Accept);
        assert!(sender.sent().is_empty());

        let conn = engine
            .table()
            .get(&FlowKey::new(Protocol::Tcp, ext(), lih()))
            .unwrap();
        assert_eq!(conn.status(), ConnStatus::Init);
        assert_eq!(conn.read().decision_trail, "yesno=reject");
        assert_eq!(conn.read().buffer().len(), 1);
    }

    #[test]
    fn test_accept_on_syn_commits_and_forwards() {
        let (engine, sender) = engine(Some(yesno("yes")));
        let action = engine.process(&frame(ext(), lih(), 1000, 0, syn()), 0, 1).unwrap();
        assert_eq!(action, PacketAction::Drop);

        // No LIH packet to expect, so the flow goes straight to FORWARD.
        let sent = sender.take();
        assert_eq!(sent.len(), 1);
        let out = classify(&sent[0], 0, 0).unwrap();
        assert_eq!(out.dst(), SocketAddrV4::new(HIH, 80));
        assert_eq!(engine.metrics().snapshot().redirections, 1);

        let synack = TcpFlags { syn: true, ack: true, ..TcpFlags::default() };
        let reply = frame(SocketAddrV4::new(HIH, 80), ext(), 7000, 1001, synack);
        assert_eq!(engine.process(&reply, 0, 2).unwrap(), PacketAction::Drop);
        let out = classify(&sender.take()[0], 0, 0).unwrap();
        assert_eq!(out.src(), lih());
        assert_eq!(out.tcp().unwrap().seq, 7000);
    }

    #[test]
    fn test_lih_packet_after_concurrent_commit_not_buffered() {
        let (engine, sender) = engine(None);
        let synack = TcpFlags { syn: true, ack: true, ..TcpFlags::default() };
        let ack = TcpFlags { ack: true, ..TcpFlags::default() };
        engine.process(&frame(ext(), lih(), 1000, 0, syn()), 0, 1).unwrap();
        engine.process(&frame(lih(), ext(), 9000, 1001, synack), 0, 2).unwrap();
        engine.process(&frame(ext(), lih(), 1001, 9001, ack), 0, 3).unwrap();
        let conn = engine
            .table()
            .get(&FlowKey::new(Protocol::Tcp, ext(), lih()))
            .unwrap();

        // This worker saw INIT, then another one committed the flow.
        let banner = build_tcp_frame(&TcpSegment {
            src: lih(),
            dst: ext(),
            seq: 9001,
            ack: 1001,
            flags: ack,
            window: 1000,
            payload: b"220 mail.example ESMTP\r\n",
        });
        let mut pkt = classify(&banner, 0, 4).unwrap();
        engine.table().lookup(&mut pkt).unwrap().unwrap();
        assert_eq!(pkt.origin, Origin::Lih);
        engine.commit_backend(&conn, 3).unwrap();
        sender.take();

        assert_eq!(engine.before_decision(&conn, pkt).unwrap(), PacketAction::Drop);
        let inner = conn.read();
        assert_eq!(inner.status, ConnStatus::Replay);
        assert_eq!(inner.buffer().len(), 3);
        assert!(inner.buffer().iter().all(|p| p.payload().is_empty()));
    }

    #[test]
    fn test_control_flow_passes() {
        let (engine, _) = engine(Some(yesno("yes")));
        let remote = SocketAddrV4::new(Ipv4Addr::new(198, 51, 100, 4), 443);
        let action = engine
            .process(&frame(SocketAddrV4::new(LIH, 50000), remote, 1, 0, syn()), 0, 1)
            .unwrap();
        assert_eq!(action, PacketAction::Accept);
        assert_eq!(engine.metrics().snapshot().redirections, 0);
    }

    #[test]
    fn test_buffer_full_counted() {
        let (engine, _) = engine(None);
        engine.process(&frame(ext(), lih(), 1, 0, syn()), 0, 0).unwrap();
        let ack = TcpFlags { ack: true, ..TcpFlags::default() };
        for i in 1..8 {
            engine.process(&frame(ext(), lih(), 1 + i, 1, ack), 0, i).unwrap();
        }
        assert_eq!(
            engine.process(&frame(ext(), lih(), 9, 1, ack), 0, 9),
            Err(EngineError::FlowBufferFull(8))
        );
        assert_eq!(engine.metrics().snapshot().buffer_full, 1);
    }

    #[test]
    fn test_unknown_module_fails_construction() {
        let sender = Arc::new(MemorySender::new());
        let mut rule = yesno("yes");
        rule.module = "geoip".to_string();
        assert!(matches!(
            Engine::new(&config(Some(rule)), &ModuleRegistry::with_defaults(None).unwrap(), sender),
            Err(ConfigError::Invalid(_))
        ));
    }

    struct OnPayload;

    impl DecisionModule for OnPayload {
        fn name(&self) -> &str {
            "on_payload"
        }

        fn evaluate(&self, ctx: &DecisionContext<'_>, _config: &ModuleConfig) -> Verdict {
            if ctx.packet.payload().is_empty() {
                Verdict::Defer
            } else {
                Verdict::Accept
            }
        }
    }

    #[test]
    fn test_udp_redirect_on_first_datagram() {
        let sender = Arc::new(MemorySender::new());
        let mut registry = ModuleRegistry::new();
        registry.register(Arc::new(OnPayload));
        let rule = RuleConfig {
            module: "on_payload".to_string(),
            config: ModuleConfig::new(),
            accept: None,
            reject: None,
        };
        let engine = Engine::new(&config(Some(rule)), &registry, sender.clone()).unwrap();

        let query = build_udp_frame(SocketAddrV4::new(*ext().ip(), 5353), SocketAddrV4::new(LIH, 53), b"query: a.test");
        assert_eq!(engine.process(&query, 0, 1).unwrap(), PacketAction::Drop);
        let out = classify(&sender.take()[0], 0, 0).unwrap();
        assert_eq!(out.dst(), SocketAddrV4::new(HIH, 53));
        assert_eq!(out.payload(), b"query: a.test");
    }
}
