//! oremill - an event-driven cryptocurrency mining supervisor
//!
//! This crate maintains persistent stratum connections to mining pools,
//! dispatches work units to compute workers, validates candidate nonces and
//! submits accepted shares back to the originating pool. A secondary control
//! plane exposes live statistics and administrative actions to local browser
//! clients over a JSON-over-WebSocket protocol.
//!
//! Everything runs on one thread around a single bounded readiness wait;
//! the only auxiliary threads belong to the compute backend.

/// The supervisor loop tying both protocol engines together
pub mod supervisor;

/// Compute backend: the `Miner` interface and its CPU implementation
pub mod miner;

/// Readiness multiplexer, non-blocking connects and the pool supervisor
pub mod network;

/// Pool-side stratum protocol
pub mod stratum;

/// WebSocket service engine for the monitor and admin planes
pub mod ws;

/// Statistics collection and tracked values
pub mod stats;

/// Utility functions and error handling
pub mod utils;

/// Command-line interface definitions
pub mod cli;

/// Configuration management
pub mod config;

/// Shared type definitions
pub mod types;

// Core exports
pub use cli::Commands;
pub use config::Config;
pub use miner::{CpuMiner, Miner, NonceBatch, WorkAssignment};
pub use network::{PoolEvent, PoolSet};
pub use stats::Tracking;
pub use stratum::StratumSession;
pub use supervisor::{ExitReason, LogSink, NotifySink, Supervisor};
pub use types::AlgorithmKind;
pub use utils::{MinerError, init_logging};
pub use ws::server::WsServer;
