// src/utils/mod.rs
//! Cross-cutting support for the supervisor
//!
//! Two concerns every subsystem leans on: the error taxonomy that routes
//! per-connection failures (WebSocket, handshake, stratum, connect) into
//! one [`MinerError`] at the supervisor boundary, and the operator-facing
//! log setup.

/// Error taxonomy
///
/// [`MinerError`] is the top of the funnel: the protocol engines carry
/// their own narrow error enums and convert into it where the supervisor
/// decides between dropping a connection and giving up entirely.
pub mod error;

/// Operator log configuration
///
/// Line format and default filters for supervising runs and benchmarks.
pub mod logging;

// Re-export for easier access
pub use error::MinerError;
pub use logging::init_logging;
