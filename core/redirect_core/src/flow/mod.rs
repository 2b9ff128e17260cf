//! Flow tracking
//!
//! Connection records, their state machine, and the concurrent table that
//! owns them.
//!
//! # Architecture
//!
//! ```text
//! ┌───────────────────────────────────────────────────────────────┐
//! │                      Flow Module Structure                     │
//! ├───────────────────────────────────────────────────────────────┤
//! │                                                                │
//! │  key.rs   - Flow keys and redirection-index keys              │
//! │  conn.rs  - Connection record, states, buffer, expectation    │
//! │  table.rs - Flow table, lookup policy, mark/steal removal     │
//! │                                                                │
//! └───────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Locking
//!
//! The table (and its redirection index) sits behind one reader/writer
//! lock, every record behind its own. A worker never takes the table lock
//! while holding a record lock; only removal takes a record lock under the
//! table lock.

pub mod conn;
pub mod key;
pub mod table;

// Re-export commonly used types
pub use conn::{
    ConnExtension,
    ConnInner,
    ConnStats,
    ConnStatus,
    Connection,
    ExpectedData,
    HihBinding,
    StateStats,
};

pub use key::{
    FlowKey,
    ParseKeyError,
    RedirectKey,
    RedirectTarget,
};

pub use table::{
    FlowTable,
    TableStats,
};
