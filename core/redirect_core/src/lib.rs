//! Redirection core
//!
//! This crate holds the engine that moves a live conversation from a
//! low-interaction honeypot (LIH) to a high-interaction one (HIH):
//! - IPv4/TCP/UDP classification and checksum codec
//! - Flow table with per-flow state machine and replay buffer
//! - Decision modules deciding which flows to escalate
//! - Replay of buffered traffic to the backend and header rewriting
//! - Periodic reaping of idle flows
//!
//! ```text
//!   EXT ──────► LIH          (INIT: packets pass and are buffered)
//!    │
//!    │ decision: accept
//!    ▼
//!   EXT ──┬──► HIH           (REPLAY: buffer replayed, replies checked)
//!         └─ RST ─► LIH
//!    │
//!    ▼
//!   EXT ◄────► HIH           (FORWARD: rewritten so EXT still sees the LIH)
//! ```

// ============================================================================
// Modules
// ============================================================================

pub mod builder;
pub mod checksum;
pub mod config;
pub mod decision;
pub mod engine;
pub mod error;
pub mod flow;
pub mod forward;
pub mod metrics;
pub mod packet;
pub mod reaper;
pub mod redirect;
pub mod target;

// ============================================================================
// Re-exports
// ============================================================================

pub use config::{ConfigError, EngineConfig, RuleConfig};
pub use decision::{DecisionModule, DecisionTree, ModuleRegistry, Verdict};
pub use engine::{Engine, PacketAction};
pub use error::{EngineError, Mismatch, Result};
pub use flow::{ConnStatus, Connection, FlowKey, FlowTable};
pub use forward::{Forwarder, MemorySender, RawSender, RawSocketSender};
pub use metrics::{Metrics, MetricsSnapshot};
pub use packet::{classify, Origin, Packet, Protocol, TcpFlags};
pub use reaper::{Reaper, Shutdown};
pub use redirect::Redirector;
pub use target::{Backend, CaptureFilter, Ipv4Cidr, Target};
