//! Periodic removal of idle and dead flows.

use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};

use crate::flow::FlowTable;
use crate::metrics::Metrics;

/// Process-wide running flag with an interruptible wait.
pub struct Shutdown {
    running: AtomicBool,
    lock: Mutex<()>,
    cond: Condvar,
}

impl Default for Shutdown {
    fn default() -> Self {
        Self::new()
    }
}

impl Shutdown {
    pub fn new() -> Self {
        Shutdown {
            running: AtomicBool::new(true),
            lock: Mutex::new(()),
            cond: Condvar::new(),
        }
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    pub fn trigger(&self) {
        let _guard = self.lock.lock();
        self.running.store(false, Ordering::Release);
        self.cond.notify_all();
    }

    /// Sleep up to `timeout`. Returns false once shutdown has been triggered.
    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut guard = self.lock.lock();
        while self.is_running() {
            if self.cond.wait_until(&mut guard, deadline).timed_out() {
                break;
            }
        }
        self.is_running()
    }
}

pub struct Reaper {
    table: Arc<FlowTable>,
    interval: Duration,
    expiration: Duration,
    metrics: Arc<Metrics>,
}

impl Reaper {
    pub fn new(
        table: Arc<FlowTable>,
        interval: Duration,
        expiration: Duration,
        metrics: Arc<Metrics>,
    ) -> Self {
        Reaper {
            table,
            interval,
            expiration,
            metrics,
        }
    }

    /// One mark-then-steal pass. Returns how many flows were removed.
    pub fn sweep(&self, now: Instant) -> usize {
        let marked = self.table.mark_expired(now, self.expiration);
        if marked.is_empty() {
            return 0;
        }
        let removed = self.table.steal(marked);
        self.metrics
            .flows_expired_total
            .fetch_add(removed as u64, Ordering::Relaxed);
        log::debug!(
            "reaper: {} flows removed, {} remaining",
            removed,
            self.table.len()
        );
        removed
    }

    /// Run sweeps every `interval` on a dedicated thread until `shutdown`.
    pub fn spawn(self, shutdown: Arc<Shutdown>) -> io::Result<JoinHandle<()>> {
        thread::Builder::new()
            .name("reaper".to_string())
            .spawn(move || {
                log::info!(
                    "reaper started (interval {:?}, expiration {:?})",
                    self.interval,
                    self.expiration
                );
                while shutdown.wait_timeout(self.interval) {
                    self.sweep(Instant::now());
                }
                log::info!("reaper stopped");
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::builder::{build_tcp_frame, TcpSegment};
    use crate::packet::{classify, TcpFlags};
    use crate::target::{CaptureFilter, Target};
    use std::net::{Ipv4Addr, SocketAddrV4};

    fn table() -> Arc<FlowTable> {
        let target = Target {
            filter: CaptureFilter::default(),
            lih: Ipv4Addr::new(10, 0, 0, 9),
            backends: vec![],
            uplinks: vec![],
            rule: None,
            backend: None,
        };
        Arc::new(FlowTable::new(vec![target], 8))
    }

    fn syn(port: u16) -> crate::packet::Packet {
        let frame = build_tcp_frame(&TcpSegment {
            src: SocketAddrV4::new(Ipv4Addr::new(10, 0, 0, 5), port),
            dst: SocketAddrV4::new(Ipv4Addr::new(10, 0, 0, 9), 22),
            seq: 1,
            ack: 0,
            flags: TcpFlags { syn: true, ..TcpFlags::default() },
            window: 64,
            payload: &[],
        });
        classify(&frame, 0, 0).unwrap()
    }

    #[test]
    fn test_sweep_removes_only_idle() {
        let table = table();
        let metrics = Arc::new(Metrics::new());
        let start = Instant::now();
        table.lookup_or_create(&mut syn(1000), start).unwrap();
        table
            .lookup_or_create(&mut syn(1001), start + Duration::from_secs(100))
            .unwrap();

        let reaper = Reaper::new(
            table.clone(),
            Duration::from_secs(60),
            Duration::from_secs(120),
            metrics.clone(),
        );
        assert_eq!(reaper.sweep(start + Duration::from_secs(130)), 1);
        assert_eq!(table.len(), 1);
        assert_eq!(metrics.snapshot().flows_expired, 1);
        assert_eq!(reaper.sweep(start + Duration::from_secs(130)), 0);
    }

    #[test]
    fn test_shutdown_interrupts_wait() {
        let shutdown = Arc::new(Shutdown::new());
        assert!(shutdown.is_running());
        assert!(shutdown.wait_timeout(Duration::from_millis(1)));

        let waiter = {
            let shutdown = shutdown.clone();
            thread::spawn(move || shutdown.wait_timeout(Duration::from_secs(30)))
        };
        thread::sleep(Duration::from_millis(20));
        shutdown.trigger();
        assert!(!waiter.join().unwrap());
        assert!(!shutdown.is_running());
    }

    #[test]
    fn test_spawned_reaper_stops() {
        let shutdown = Arc::new(Shutdown::new());
        let reaper = Reaper::new(
            table(),
            Duration::from_millis(5),
            Duration::from_secs(120),
            Arc::new(Metrics::new()),
        );
        let handle = reaper.spawn(shutdown.clone()).unwrap();
        thread::sleep(Duration::from_millis(20));
        shutdown.trigger();
        handle.join().unwrap();
    }
}
