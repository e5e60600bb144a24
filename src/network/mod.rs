// src/network/mod.rs
//! Network plumbing and pool supervision
//!
//! This module holds everything between the OS sockets and the protocol
//! engines:
//! - The readiness multiplexer the supervisor loop sleeps in
//! - Non-blocking TCP connect helpers with the connect error taxonomy
//! - The pool supervisor owning every pool connection

/// Readiness multiplexer over `poll(2)`
pub mod poll;

/// Non-blocking connect and its error taxonomy
pub mod tcp;

/// Pool lifecycle supervision
pub mod pool;

// Re-export main components for cleaner imports
pub use pool::{PoolEvent, PoolSet};
pub use tcp::ConnectError;
