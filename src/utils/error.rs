// src/utils/error.rs
use crate::network::tcp::ConnectError;
use crate::ws::WsError;
use serde_json;
use std::io;
use thiserror::Error;

/// Main error type for the mining supervisor
///
/// This enum represents all possible error conditions that can occur
/// while supervising pools and web clients, including network, I/O,
/// protocol, and configuration errors.
#[derive(Error, Debug)]
pub enum MinerError {
    /// Errors related to mining algorithms (e.g., unsupported algorithm)
    #[error("Algorithm error: {0}")]
    AlgorithmError(String),

    /// Errors related to network connectivity
    #[error("Network connection error: {0}")]
    ConnectionError(String),

    /// Errors in protocol handling or invalid protocol messages
    #[error("Protocol violation: {0}")]
    ProtocolError(String),

    /// Standard I/O operation errors
    #[error("I/O error: {0}")]
    IoError(#[from] io::Error),

    /// JSON serialization/deserialization errors
    #[error("JSON error: {0}")]
    JsonError(#[from] serde_json::Error),

    /// WebSocket service errors, including the upgrade handshake
    #[error("WebSocket error: {0}")]
    WsError(#[from] WsError),

    /// Pool connect errors with their own taxonomy
    #[error("Connect error: {0}")]
    ConnectError(#[from] ConnectError),

    /// Configuration file or parameter errors
    #[error("Configuration error: {0}")]
    ConfigError(String),

    /// Thread communication channel errors
    #[error("Thread communication error: {0}")]
    ChannelError(String),

    /// Invalid user input or parameter errors
    #[error("Invalid input: {0}")]
    InputError(String),

    /// Unrecoverable conditions that terminate the supervisor loop
    #[error("Fatal: {0}")]
    Fatal(String),
}

/// Converts hex decoding errors into MinerError
///
/// Used when invalid hex data is encountered during:
/// - Job notification processing
/// - Extranonce parsing
/// - Share submission encoding
/// Wraps the original error in an `InputError` variant.
impl From<hex::FromHexError> for MinerError {
    fn from(e: hex::FromHexError) -> Self {
        MinerError::InputError(format!("Hex conversion failed: {}", e))
    }
}

/// Converts crossbeam channel send errors for nonce batches into MinerError
///
/// Used when failing to hand verified nonces through inter-thread channels.
/// Wraps the original error in a `ChannelError` variant with context.
impl From<crossbeam_channel::SendError<crate::miner::NonceBatch>> for MinerError {
    fn from(e: crossbeam_channel::SendError<crate::miner::NonceBatch>) -> Self {
        MinerError::ChannelError(format!("Nonce batch send failed: {}", e))
    }
}
