//! Engine counters.
//!
//! Workers bump plain `AtomicU64`s with relaxed ordering; the daemon dumps
//! them as `redirector_*` lines in Prometheus text format when it exits.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

/// Per-engine counters, shared by every worker and the reaper.
pub struct Metrics {
    /// Total frames handed to the engine (counter)
    pub packets_total: AtomicU64,
    /// Frames dropped as malformed or unsupported (counter)
    pub classify_drops_total: AtomicU64,
    /// Total flows created (counter)
    pub flows_created_total: AtomicU64,
    /// Total flows expired and removed (counter)
    pub flows_expired_total: AtomicU64,
    /// Flows committed to a backend (counter)
    pub redirections_total: AtomicU64,
    /// Commits refused because the backend was busy (counter)
    pub redirections_busy_total: AtomicU64,
    /// Backend replies that failed the replay check (counter)
    pub replay_mismatches_total: AtomicU64,
    /// Packets rewritten and sent (counter)
    pub forwarded_packets_total: AtomicU64,
    /// Bytes rewritten and sent (counter)
    pub forwarded_bytes_total: AtomicU64,
    /// Raw sends that failed (counter)
    pub send_failures_total: AtomicU64,
    /// Packets refused because a flow buffer was full (counter)
    pub buffer_full_total: AtomicU64,
    /// Uptime is measured from here
    pub start_time: Instant,
}

/// Point-in-time copy of the counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MetricsSnapshot {
    pub packets: u64,
    pub classify_drops: u64,
    pub flows_created: u64,
    pub flows_expired: u64,
    pub redirections: u64,
    pub redirections_busy: u64,
    pub replay_mismatches: u64,
    pub forwarded_packets: u64,
    pub forwarded_bytes: u64,
    pub send_failures: u64,
    pub buffer_full: u64,
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

impl Metrics {
    pub fn new() -> Self {
        Self {
            packets_total: AtomicU64::new(0),
            classify_drops_total: AtomicU64::new(0),
            flows_created_total: AtomicU64::new(0),
            flows_expired_total: AtomicU64::new(0),
            redirections_total: AtomicU64::new(0),
            redirections_busy_total: AtomicU64::new(0),
            replay_mismatches_total: AtomicU64::new(0),
            forwarded_packets_total: AtomicU64::new(0),
            forwarded_bytes_total: AtomicU64::new(0),
            send_failures_total: AtomicU64::new(0),
            buffer_full_total: AtomicU64::new(0),
            start_time: Instant::now(),
        }
    }

    pub fn record_forwarded(&self, bytes: usize) {
        self.forwarded_packets_total.fetch_add(1, Ordering::Relaxed);
        self.forwarded_bytes_total.fetch_add(bytes as u64, Ordering::Relaxed);
    }

    pub fn record_send_failure(&self) {
        self.send_failures_total.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            packets: self.packets_total.load(Ordering::Relaxed),
            classify_drops: self.classify_drops_total.load(Ordering::Relaxed),
            flows_created: self.flows_created_total.load(Ordering::Relaxed),
            flows_expired: self.flows_expired_total.load(Ordering::Relaxed),
            redirections: self.redirections_total.load(Ordering::Relaxed),
            redirections_busy: self.redirections_busy_total.load(Ordering::Relaxed),
            replay_mismatches: self.replay_mismatches_total.load(Ordering::Relaxed),
            forwarded_packets: self.forwarded_packets_total.load(Ordering::Relaxed),
            forwarded_bytes: self.forwarded_bytes_total.load(Ordering::Relaxed),
            send_failures: self.send_failures_total.load(Ordering::Relaxed),
            buffer_full: self.buffer_full_total.load(Ordering::Relaxed),
        }
    }

    /// Text dump of every counter plus the active-flow and uptime gauges.
    pub fn render(&self, active_flows: usize) -> String {
        let s = self.snapshot();
        let uptime = self.start_time.elapsed().as_secs();
        format!(
            "# HELP redirector_packets_total Total frames handed to the engine\n\
             # TYPE redirector_packets_total counter\n\
             redirector_packets_total {}\n\
             # HELP redirector_classify_drops_total Frames dropped as malformed or unsupported\n\
             # TYPE redirector_classify_drops_total counter\n\
             redirector_classify_drops_total {}\n\
             # HELP redirector_flows_created_total Total flows created\n\
             # TYPE redirector_flows_created_total counter\n\
             redirector_flows_created_total {}\n\
             # HELP redirector_flows_expired_total Total flows expired and removed\n\
             # TYPE redirector_flows_expired_total counter\n\
             redirector_flows_expired_total {}\n\
             # HELP redirector_redirections_total Flows committed to a backend\n\
             # TYPE redirector_redirections_total counter\n\
             redirector_redirections_total {}\n\
             # HELP redirector_redirections_busy_total Commits refused because the backend was busy\n\
             # TYPE redirector_redirections_busy_total counter\n\
             redirector_redirections_busy_total {}\n\
             # HELP redirector_replay_mismatches_total Backend replies failing the replay check\n\
             # TYPE redirector_replay_mismatches_total counter\n\
             redirector_replay_mismatches_total {}\n\
             # HELP redirector_forwarded_packets_total Packets rewritten and sent\n\
             # TYPE redirector_forwarded_packets_total counter\n\
             redirector_forwarded_packets_total {}\n\
             # HELP redirector_forwarded_bytes_total Bytes rewritten and sent\n\
             # TYPE redirector_forwarded_bytes_total counter\n\
             redirector_forwarded_bytes_total {}\n\
             # HELP redirector_send_failures_total Raw sends that failed\n\
             # TYPE redirector_send_failures_total counter\n\
             redirector_send_failures_total {}\n\
             # HELP redirector_buffer_full_total Packets refused by a full flow buffer\n\
             # TYPE redirector_buffer_full_total counter\n\
             redirector_buffer_full_total {}\n\
             # HELP redirector_active_flows Flows currently tracked\n\
             # TYPE redirector_active_flows gauge\n\
             redirector_active_flows {}\n\
             # HELP redirector_uptime_seconds Engine uptime in seconds\n\
             # TYPE redirector_uptime_seconds gauge\n\
             redirector_uptime_seconds {}\n",
            s.packets,
            s.classify_drops,
            s.flows_created,
            s.flows_expired,
            s.redirections,
            s.redirections_busy,
            s.replay_mismatches,
            s.forwarded_packets,
            s.forwarded_bytes,
            s.send_failures,
            s.buffer_full,
            active_flows,
            uptime,
        )
    }
}
