//! Error taxonomy for the redirection engine.
//!
//! Every variant is local to the packet (or commit) that produced it: callers
//! drop the packet and carry on, the flow table is never left half-updated.

use std::fmt;

use crate::flow::ConnStatus;
use crate::packet::Origin;

pub type Result<T> = std::result::Result<T, EngineError>;

/// Which field of a HIH reply disagreed with the recorded expectation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mismatch {
    NoExpectation,
    Protocol,
    Sequence,
    Ack,
    Payload,
}

impl fmt::Display for Mismatch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Mismatch::NoExpectation => write!(f, "no expectation recorded"),
            Mismatch::Protocol => write!(f, "protocol differs"),
            Mismatch::Sequence => write!(f, "sequence number differs"),
            Mismatch::Ack => write!(f, "ack number differs"),
            Mismatch::Payload => write!(f, "payload differs"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum EngineError {
    #[error("malformed packet: {0}")]
    MalformedPacket(&'static str),

    #[error("unsupported IP protocol {0}")]
    UnsupportedProtocol(u8),

    #[error("no capture filter or honeypot address matches {0}")]
    UnroutablePacket(String),

    #[error("no flow for {0}")]
    NoSuchFlow(String),

    #[error("redirection entry {0} points at a flow that no longer exists")]
    OrphanRedirection(String),

    #[error("flow buffer full ({0} packets)")]
    FlowBufferFull(usize),

    #[error("backend busy with {0}")]
    BackendBusy(String),

    #[error("no backend selected")]
    NoBackend,

    #[error("unknown backend id {0}")]
    UnknownBackend(u64),

    #[error("replay mismatch: {0}")]
    ReplayMismatch(Mismatch),

    #[error("invalid state transition {from} -> {to}")]
    InvalidTransition { from: ConnStatus, to: ConnStatus },

    #[error("cannot forward a packet from {0}")]
    InvalidOrigin(Origin),

    #[error("send failed: {0}")]
    SendFailure(String),
}

impl EngineError {
    /// True for the classification failures that never reach the flow table.
    pub fn is_classification(&self) -> bool {
        matches!(
            self,
            EngineError::MalformedPacket(_) | EngineError::UnsupportedProtocol(_)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = EngineError::ReplayMismatch(Mismatch::Sequence);
        assert_eq!(err.to_string(), "replay mismatch: sequence number differs");

        let err = EngineError::InvalidTransition {
            from: ConnStatus::Forward,
            to: ConnStatus::Init,
        };
        assert_eq!(err.to_string(), "invalid state transition FORWARD -> INIT");
    }

    #[test]
    fn test_is_classification() {
        assert!(EngineError::MalformedPacket("short").is_classification());
        assert!(EngineError::UnsupportedProtocol(1).is_classification());
        assert!(!EngineError::NoSuchFlow("x".into()).is_classification());
    }
}
