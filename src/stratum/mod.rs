// src/stratum/mod.rs
//! Pool-side stratum protocol
//!
//! Line-oriented JSON over TCP: subscribe, authorize, receive jobs and
//! difficulty, submit shares. One [`session::StratumSession`] runs per
//! connected pool; the pool supervisor owns the transports and feeds bytes
//! in and out.

/// Request builders and reply accessors for the wire dialect
pub mod messages;

/// Job templates, merkle folding and difficulty/target arithmetic
pub mod job;

/// The per-pool protocol state machine
pub mod session;

pub use job::JobTemplate;
pub use session::{AuthState, SessionEvent, StratumSession};
