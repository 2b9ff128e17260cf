//! Worker pool running captured packets through the engine.
//!
//! Each worker owns one job channel; the poll loop hands jobs out
//! round-robin and collects verdicts from a shared channel, woken through a
//! mio `Waker`.

use std::io;
use std::net::SocketAddr;
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use mio::Waker;
use redirect_core::{Engine, EngineError, PacketAction};

use crate::capture::CapturedPacket;

pub struct Job {
    /// Capture helper to answer
    pub from: SocketAddr,
    pub packet: CapturedPacket,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VerdictMsg {
    pub to: SocketAddr,
    pub packet_id: u32,
    pub action: PacketAction,
}

pub struct WorkerPool {
    senders: Vec<Sender<Job>>,
    handles: Vec<JoinHandle<()>>,
    next: usize,
}

impl WorkerPool {
    pub fn spawn(
        count: usize,
        engine: Arc<Engine>,
        verdicts: Sender<VerdictMsg>,
        waker: Arc<Waker>,
    ) -> io::Result<Self> {
        let mut senders = Vec::with_capacity(count);
        let mut handles = Vec::with_capacity(count);
        for i in 0..count {
            let (tx, rx) = mpsc::channel();
            let engine = engine.clone();
            let verdicts = verdicts.clone();
            let waker = waker.clone();
            let handle = thread::Builder::new()
                .name(format!("worker-{}", i))
                .spawn(move || worker_loop(i, rx, engine, verdicts, waker))?;
            senders.push(tx);
            handles.push(handle);
        }
        log::info!("{} workers started", count);
        Ok(WorkerPool {
            senders,
            handles,
            next: 0,
        })
    }

    /// Queue a job on the next worker. Returns false once the pool is closed.
    pub fn submit(&mut self, job: Job) -> bool {
        if self.senders.is_empty() {
            return false;
        }
        let i = self.next % self.senders.len();
        self.next = self.next.wrapping_add(1);
        self.senders[i].send(job).is_ok()
    }

    /// Close every job channel and wait for queued jobs to finish.
    pub fn close(&mut self) {
        self.senders.clear();
        for handle in self.handles.drain(..) {
            if handle.join().is_err() {
                log::error!("worker thread panicked");
            }
        }
    }
}

fn worker_loop(
    id: usize,
    jobs: Receiver<Job>,
    engine: Arc<Engine>,
    verdicts: Sender<VerdictMsg>,
    waker: Arc<Waker>,
) {
    log::debug!("worker {} running", id);
    for job in jobs {
        let packet_id = job.packet.packet_id;
        let action = match engine.process(&job.packet.frame, job.packet.mark, packet_id) {
            Ok(action) => action,
            Err(e @ EngineError::ReplayMismatch(_)) | Err(e @ EngineError::SendFailure(_)) => {
                // Already reported at warn level by the engine.
                log::trace!("packet {} dropped: {}", packet_id, e);
                PacketAction::Drop
            }
            Err(e) => {
                log::debug!("packet {} dropped: {}", packet_id, e);
                PacketAction::Drop
            }
        };
        let verdict = VerdictMsg {
            to: job.from,
            packet_id,
            action,
        };
        if verdicts.send(verdict).is_err() {
            break;
        }
        if let Err(e) = waker.wake() {
            log::warn!("worker {}: cannot wake poll loop: {}", id, e);
        }
    }
    log::debug!("worker {} stopped", id);
}
