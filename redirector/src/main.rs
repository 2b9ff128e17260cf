//! Honeypot Redirector
//!
//! A capture-side daemon that:
//! - Receives queued packets from the capture helper over UDP
//! - Runs them through the redirection engine on a worker pool
//! - Answers each packet with a drop/accept verdict
//! - Injects rewritten traffic through raw sockets
//! - Reaps idle flows in the background

use std::io;
use std::net::SocketAddr;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Receiver};
use std::sync::Arc;
use std::time::Duration;

use mio::net::UdpSocket;
use mio::{Events, Interest, Poll, Token, Waker};
use redirect_core::{Engine, EngineConfig, ModuleRegistry, RawSocketSender, Shutdown};

mod capture;
mod workers;

use workers::{Job, VerdictMsg, WorkerPool};

// ============================================================================
// Constants
// ============================================================================

/// Default address the capture helper sends to
const DEFAULT_CAPTURE_ADDR: &str = "127.0.0.1:7010";

/// Largest envelope: header plus a maximum-size IPv4 frame
const MAX_ENVELOPE_SIZE: usize = 65535 + 9;

/// Poll timeout; bounds how long a shutdown signal goes unnoticed
const POLL_TIMEOUT: Duration = Duration::from_millis(100);

/// mio token for the capture socket
const CAPTURE_TOKEN: Token = Token(0);

/// mio token for the worker waker
const WAKER_TOKEN: Token = Token(1);

// ============================================================================
// Main Entry Point
// ============================================================================

fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize logging
    env_logger::Builder::from_env(
        env_logger::Env::default().default_filter_or("info"),
    )
    .init();

    // Parse command line arguments
    let args: Vec<String> = std::env::args().collect();

    // --config <path>        Engine configuration (JSON)
    // --capture <addr:port>  Address to receive captured packets on
    // --workers <n>          Worker count, overrides the configuration

    let config_path = parse_arg(&args, "--config")
        .ok_or("Missing --config <path>")?;
    let capture_addr = parse_arg(&args, "--capture")
        .unwrap_or_else(|| DEFAULT_CAPTURE_ADDR.to_string());
    let capture_addr: SocketAddr = capture_addr.parse()
        .map_err(|_| "Invalid capture address")?;

    let mut config = EngineConfig::from_file(Path::new(&config_path))?;
    if let Some(workers) = parse_arg(&args, "--workers") {
        config.workers = workers.parse().map_err(|_| "Invalid worker count")?;
    }
    if config.workers == 0 {
        return Err("Worker count must be positive".into());
    }

    log::info!("Honeypot redirector starting...");
    log::info!("  Config:  {}", config_path);
    log::info!("  Capture: {}", capture_addr);
    log::info!("  Workers: {}", config.workers);
    log::info!("  Targets: {}", config.targets.len());

    let registry = ModuleRegistry::with_defaults(config.state_dir.as_deref())?;
    log::info!("  Modules: {}", registry.names().join(", "));
    let sender = Arc::new(RawSocketSender::open()?);
    let engine = Arc::new(Engine::new(&config, &registry, sender)?);

    // SIGINT/SIGTERM raise the flag; the poll loop notices within one timeout
    let term = Arc::new(AtomicBool::new(false));
    signal_hook::flag::register(signal_hook::consts::SIGINT, Arc::clone(&term))?;
    signal_hook::flag::register(signal_hook::consts::SIGTERM, Arc::clone(&term))?;

    let shutdown = Arc::new(Shutdown::new());
    let reaper = engine.reaper().spawn(shutdown.clone())?;

    let mut daemon = Daemon::new(capture_addr, engine.clone(), config.workers)?;
    let result = daemon.run(&term);

    shutdown.trigger();
    daemon.finish();
    if reaper.join().is_err() {
        log::error!("reaper thread panicked");
    }

    log::info!(
        "Final metrics:\n{}",
        engine.metrics().render(engine.table().len())
    );
    result
}

fn parse_arg(args: &[String], flag: &str) -> Option<String> {
    args.iter()
        .position(|a| a == flag)
        .and_then(|i| args.get(i + 1))
        .cloned()
}

// ============================================================================
// Daemon Structure
// ============================================================================

struct Daemon {
    poll: Poll,
    socket: UdpSocket,
    pool: WorkerPool,
    verdicts: Receiver<VerdictMsg>,
    recv_buf: Vec<u8>,
}

impl Daemon {
    fn new(addr: SocketAddr, engine: Arc<Engine>, workers: usize) -> io::Result<Self> {
        // Create mio poll
        let poll = Poll::new()?;

        let mut socket = UdpSocket::bind(addr)?;
        poll.registry()
            .register(&mut socket, CAPTURE_TOKEN, Interest::READABLE)?;
        let waker = Arc::new(Waker::new(poll.registry(), WAKER_TOKEN)?);

        let (tx, verdicts) = mpsc::channel();
        let pool = WorkerPool::spawn(workers, engine, tx, waker)?;

        log::info!("Capture socket bound to {}", socket.local_addr()?);

        Ok(Daemon {
            poll,
            socket,
            pool,
            verdicts,
            recv_buf: vec![0u8; MAX_ENVELOPE_SIZE],
        })
    }

    fn run(&mut self, term: &AtomicBool) -> Result<(), Box<dyn std::error::Error>> {
        let mut events = Events::with_capacity(1024);

        while !term.load(Ordering::Relaxed) {
            match self.poll.poll(&mut events, Some(POLL_TIMEOUT)) {
                Ok(()) => {}
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e.into()),
            }

            for event in events.iter() {
                match event.token() {
                    CAPTURE_TOKEN => self.process_capture_socket(),
                    WAKER_TOKEN => {}
                    _ => {}
                }
            }

            self.send_verdicts();
        }

        log::info!("Shutdown requested");
        Ok(())
    }

    fn process_capture_socket(&mut self) {
        loop {
            match self.socket.recv_from(&mut self.recv_buf) {
                Ok((len, from)) => {
                    let Some(packet) = capture::parse_packet(&self.recv_buf[..len]) else {
                        log::debug!("Ignoring malformed envelope ({} bytes) from {}", len, from);
                        continue;
                    };
                    if !self.pool.submit(Job { from, packet }) {
                        log::warn!("Worker pool closed, dropping packet");
                    }
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) => {
                    log::debug!("Capture socket error: {:?}", e);
                    break;
                }
            }
        }
    }

    fn send_verdicts(&mut self) {
        while let Ok(v) = self.verdicts.try_recv() {
            let msg = capture::encode_verdict(v.packet_id, v.action);
            if let Err(e) = self.socket.send_to(&msg, v.to) {
                log::debug!("Verdict for packet {} not sent: {:?}", v.packet_id, e);
            }
        }
    }

    /// Let the workers finish what is queued and flush their verdicts.
    fn finish(mut self) {
        self.pool.close();
        self.send_verdicts();
        log::info!("Workers stopped");
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn args(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_parse_arg() {
        let a = args(&["redirector", "--config", "/etc/redirector.json", "--workers", "8"]);
        assert_eq!(parse_arg(&a, "--config").as_deref(), Some("/etc/redirector.json"));
        assert_eq!(parse_arg(&a, "--workers").as_deref(), Some("8"));
        assert_eq!(parse_arg(&a, "--capture"), None);
    }

    #[test]
    fn test_parse_arg_missing_value() {
        let a = args(&["redirector", "--config"]);
        assert_eq!(parse_arg(&a, "--config"), None);
    }

    #[test]
    fn test_default_capture_addr_parses() {
        let addr: SocketAddr = DEFAULT_CAPTURE_ADDR.parse().unwrap();
        assert_eq!(addr.port(), 7010);
    }
}
