// src/ws/mod.rs
//! WebSocket service engine
//!
//! Everything needed to serve the browser-facing control plane: the HTTP
//! upgrade handshake, the frame codec with its control-frame state machine,
//! message assembly, and the per-client command dispatcher with push
//! streams. Two independent instances run side by side, one for the monitor
//! plane and one for the admin plane.

/// Frame parsing/assembly and the close handshake state machine
pub mod frame;

/// HTTP/1.1 Upgrade validation and 101 response synthesis
pub mod handshake;

/// Data-frame accumulation into whole messages
pub mod connection;

/// Client bookkeeping, command dispatch and the push manager
pub mod server;

/// Command handlers for the monitor and admin planes
pub mod commands;

use handshake::HandshakeReject;
use std::io;
use thiserror::Error;

/// Per-connection WebSocket failures
///
/// All of these fail the single connection they occur on; other clients are
/// unaffected.
#[derive(Error, Debug)]
pub enum WsError {
    /// A frame declared a payload beyond the inbound cap
    #[error("WebSocket frame too big (max size is {} bytes)", frame::MAX_INBOUND_FRAME_SIZE)]
    FrameTooBig,

    /// Accumulated message grew beyond the message cap
    #[error("WebSocket message too big (max size is {} bytes)", connection::MAX_INBOUND_MESSAGE_SIZE)]
    MessageTooBig,

    /// Reserved extension bits were set on an inbound frame
    #[error("extension bits set, invalid frame")]
    ExtensionBits,

    /// A client frame arrived unmasked while we serve as the server role
    #[error("frame from client is unmasked, not allowed")]
    UnmaskedFrame,

    /// Opcode outside the recognized set
    #[error("unrecognized opcode 0x{0:x}")]
    BadOpcode(u8),

    /// A non-continuation opcode appeared in the middle of a message
    #[error("only the first frame of a message can carry an opcode")]
    UnexpectedOpcode,

    /// Control frames must fit a single final frame
    #[error("fragmented control frame")]
    FragmentedControl,

    /// Empty outbound messages have no framing representation here
    #[error("zero-sized messages are not supported")]
    EmptyMessage,

    /// The peer closed the transport under us
    #[error("connection closed by peer")]
    TransportClosed,

    /// The upgrade handshake failed one of its checks
    #[error("handshake rejected: {0}")]
    Handshake(#[from] HandshakeReject),

    /// Inbound text was not parseable JSON
    #[error("invalid JSON received")]
    BadJson,

    /// Transport-level read/write failure
    #[error("transport error: {0}")]
    Io(#[from] io::Error),
}
