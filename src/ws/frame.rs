// src/ws/frame.rs
//! WebSocket frame codec and control-frame handling
//!
//! Takes octets out of a transport and builds frames; emits outbound frames
//! with the masking rules of the configured role. Control frames (ping,
//! pong, close) are intercepted here and never reach upper layers: pings
//! feed the pong slot pair, pongs are dropped, close frames drive the close
//! handshake state machine.

use crate::ws::WsError;
use std::io::{Read, Write};

/// Largest payload a single inbound frame may declare
pub const MAX_INBOUND_FRAME_SIZE: usize = 1024 * 1024 * 4;

/// Which side of the connection this codec plays
///
/// The server role requires inbound frames to be masked and sends its own
/// frames unmasked; the client role is the exact opposite.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Role {
    Server,
    Client,
}

/// Close handshake progress
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum SocketStatus {
    /// No close frame seen or queued
    Operational,
    /// We asked to close and wait for the peer to confirm
    WaitingCloseReply,
    /// The peer asked to close and our confirm is still in flight
    SendingCloseConfirm,
    /// Handshake complete, transport can be torn down
    Closed,
}

/// Close reason codes used by this service
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum CloseReason {
    Done = 1000,
    Away = 1001,
    ProtocolError = 1002,
    NoStatus = 1005,
    MessageTooBig = 1009,
    InternalError = 1011,
}

/// One assembled data frame, payload already unmasked
#[derive(Debug)]
pub struct DataFrame {
    pub payload: Vec<u8>,
    /// Clear on every frame of a fragmented message except the last
    pub final_frame: bool,
    /// Set on the frame that starts a message
    pub first: bool,
}

struct FrameHeader {
    fin: bool,
    opcode: u8,
    masked: bool,
    mask: [u8; 4],
    payload_len: usize,
    header_len: usize,
}

struct CloseSlot {
    frame: Vec<u8>,
    sent: usize,
    wait_for_reply: bool,
    reply_received: bool,
}

/// Frame parser/assembler for one connection
pub struct Framer {
    role: Role,
    inbound: Vec<u8>,
    mid_message: bool,
    outbound: Vec<u8>,
    sent_out: usize,
    // Reply only to the most recent ping, but a pong already on the wire
    // always finishes before the newer one starts.
    pong_queued: Option<Vec<u8>>,
    pong_in_flight: Option<(Vec<u8>, usize)>,
    close: Option<CloseSlot>,
}

impl Framer {
    pub fn new(role: Role) -> Self {
        Framer {
            role,
            inbound: Vec::new(),
            mid_message: false,
            outbound: Vec::new(),
            sent_out: 0,
            pong_queued: None,
            pong_in_flight: None,
            close: None,
        }
    }

    /// Drains every byte the transport currently has into the inbound buffer
    ///
    /// # Errors
    /// `TransportClosed` when the peer shut the stream down, `Io` on any
    /// other read failure. `WouldBlock` simply ends the drain.
    pub fn receive(&mut self, sock: &mut impl Read) -> Result<(), WsError> {
        let mut chunk = [0u8; 4096];
        loop {
            match sock.read(&mut chunk) {
                Ok(0) => return Err(WsError::TransportClosed),
                Ok(got) => self.inbound.extend_from_slice(&chunk[..got]),
                Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => return Ok(()),
                Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(WsError::Io(e)),
            }
        }
    }

    /// Injects bytes already pulled off the transport by someone else, such
    /// as leftovers the handshake engine read past the header end
    pub(crate) fn feed(&mut self, bytes: &[u8]) {
        self.inbound.extend_from_slice(bytes);
    }

    /// Pops the next complete data frame out of the inbound buffer
    ///
    /// Control frames found along the way are consumed here and hidden from
    /// the caller. Returns `None` when no complete frame is buffered.
    pub fn next_frame(&mut self) -> Result<Option<DataFrame>, WsError> {
        loop {
            let header = match parse_header(&self.inbound)? {
                Some(header) => header,
                None => return Ok(None),
            };
            if header.payload_len > MAX_INBOUND_FRAME_SIZE {
                return Err(WsError::FrameTooBig);
            }
            if self.role == Role::Server && !header.masked {
                return Err(WsError::UnmaskedFrame);
            }
            let total = header.header_len + header.payload_len;
            if self.inbound.len() < total {
                return Ok(None);
            }

            let control = header.opcode >= 0x8;
            if control {
                if !header.fin {
                    return Err(WsError::FragmentedControl);
                }
                if self.mid_message {
                    return Err(WsError::UnexpectedOpcode);
                }
                let payload = self.take_payload(&header, total);
                match header.opcode {
                    0x8 => self.close_received(&payload),
                    0x9 => self.queue_pong(&payload),
                    0xA => {} // nothing for that, just ignore it
                    other => return Err(WsError::BadOpcode(other)),
                }
                continue;
            }

            match header.opcode {
                0x0 if !self.mid_message => return Err(WsError::BadOpcode(0)),
                0x0 | 0x1 | 0x2 => {}
                other => return Err(WsError::BadOpcode(other)),
            }
            if self.mid_message && header.opcode != 0 {
                return Err(WsError::UnexpectedOpcode);
            }
            let first = !self.mid_message;
            self.mid_message = !header.fin;
            let payload = self.take_payload(&header, total);
            return Ok(Some(DataFrame {
                payload,
                final_frame: header.fin,
                first,
            }));
        }
    }

    fn take_payload(&mut self, header: &FrameHeader, total: usize) -> Vec<u8> {
        let mut payload: Vec<u8> = self.inbound[header.header_len..total].to_vec();
        if header.masked {
            for (index, byte) in payload.iter_mut().enumerate() {
                *byte ^= header.mask[index % 4];
            }
        }
        self.inbound.drain(..total);
        payload
    }

    fn queue_pong(&mut self, payload: &[u8]) {
        let mut frame = Vec::with_capacity(2 + payload.len());
        frame.push(0x8A);
        frame.push(payload.len() as u8); // control payloads are <= 125 bytes
        frame.extend_from_slice(payload);
        self.pong_queued = Some(frame);
    }

    fn close_received(&mut self, payload: &[u8]) {
        if let Some(close) = &mut self.close {
            if close.wait_for_reply {
                close.reply_received = true;
            }
            // A second close while confirming means nothing, ignore it.
            return;
        }
        let no_status = (CloseReason::NoStatus as u16).to_be_bytes();
        let reason: &[u8] = match payload.len() {
            0 => &[],
            2 => payload,
            // A close frame with any other payload length is answered with
            // reason 1005 instead of failing the connection; revisit against
            // RFC 6455 section 7.1.5.
            _ => &no_status,
        };
        let mut frame = Vec::with_capacity(2 + reason.len());
        frame.push(0x88);
        frame.push(reason.len() as u8);
        frame.extend_from_slice(reason);
        self.close = Some(CloseSlot {
            frame,
            sent: 0,
            wait_for_reply: false,
            reply_received: false,
        });
    }

    /// The application on this peer requested to shut down
    ///
    /// Enqueues a close frame with a 2-byte reason and waits for the peer to
    /// reply with its own close. Only the first request means anything.
    pub fn enqueue_close(&mut self, reason: CloseReason) {
        if self.close.is_some() {
            return;
        }
        let code = (reason as u16).to_be_bytes();
        self.close = Some(CloseSlot {
            frame: vec![0x88, 0x02, code[0], code[1]],
            sent: 0,
            wait_for_reply: true,
            reply_received: false,
        });
    }

    /// Appends a single text frame carrying `msg` to the outbound queue
    ///
    /// Sending happens lazily in [`Framer::send`]; enqueuing just
    /// concatenates bytes. Once a close is pending the message is silently
    /// dropped, the connection is going away anyway.
    pub fn enqueue_text(&mut self, msg: &[u8]) -> Result<(), WsError> {
        if self.close.is_some() {
            return Ok(());
        }
        if msg.is_empty() {
            return Err(WsError::EmptyMessage);
        }
        let mut header = [0u8; 14];
        header[0] = 0x81;
        let mask_bit = if self.role == Role::Client { 0x80 } else { 0x00 };
        let mut hbytes = 2;
        if msg.len() <= 125 {
            header[1] = mask_bit | msg.len() as u8;
        } else if msg.len() < 64 * 1024 {
            header[1] = mask_bit | 126;
            header[2..4].copy_from_slice(&(msg.len() as u16).to_be_bytes());
            hbytes += 2;
        } else {
            header[1] = mask_bit | 127;
            header[2..10].copy_from_slice(&(msg.len() as u64).to_be_bytes());
            hbytes += 8;
        }
        self.outbound.extend_from_slice(&header[..hbytes]);
        if self.role == Role::Client {
            // Mask keys must come from a cryptographically strong source;
            // ThreadRng is a CSPRNG.
            let mask: [u8; 4] = rand::random();
            self.outbound.extend_from_slice(&mask);
            self.outbound
                .extend(msg.iter().enumerate().map(|(i, b)| b ^ mask[i % 4]));
        } else {
            self.outbound.extend_from_slice(msg);
        }
        Ok(())
    }

    /// Whether [`Framer::send`] has work to do
    pub fn needs_to_send(&self) -> bool {
        if let Some(close) = &self.close {
            // Everything after a fully sent close is kept only to mark state.
            return close.sent < close.frame.len();
        }
        self.pong_in_flight.is_some() || self.pong_queued.is_some() || !self.outbound.is_empty()
    }

    /// Pushes queued bytes at the transport, pongs first, then the close
    /// frame, then user data
    ///
    /// Handles partial writes; call again when the endpoint polls writable.
    pub fn send(&mut self, sock: &mut impl Write) -> Result<(), WsError> {
        if self.pong_in_flight.is_none() {
            if let Some(frame) = self.pong_queued.take() {
                self.pong_in_flight = Some((frame, 0));
            }
        }
        if let Some((frame, sent)) = &mut self.pong_in_flight {
            *sent += write_some(sock, &frame[*sent..])?;
            if *sent == frame.len() {
                self.pong_in_flight = None;
            }
            return Ok(());
        }
        if let Some(close) = &mut self.close {
            if close.sent < close.frame.len() {
                close.sent += write_some(sock, &close.frame[close.sent..])?;
            }
            // otherwise we are already closed and goodbye
            return Ok(());
        }
        if !self.outbound.is_empty() {
            self.sent_out += write_some(sock, &self.outbound[self.sent_out..])?;
            if self.sent_out == self.outbound.len() {
                self.outbound.clear();
                self.sent_out = 0;
            }
        }
        Ok(())
    }

    pub fn status(&self) -> SocketStatus {
        let close = match &self.close {
            None => return SocketStatus::Operational,
            Some(close) => close,
        };
        if close.wait_for_reply {
            if close.reply_received {
                SocketStatus::Closed
            } else {
                SocketStatus::WaitingCloseReply
            }
        } else if close.sent == close.frame.len() {
            SocketStatus::Closed
        } else {
            SocketStatus::SendingCloseConfirm
        }
    }
}

fn parse_header(buf: &[u8]) -> Result<Option<FrameHeader>, WsError> {
    if buf.len() < 2 {
        return Ok(None);
    }
    if buf[0] & 0x70 != 0 {
        return Err(WsError::ExtensionBits);
    }
    let fin = buf[0] & 0x80 != 0;
    let opcode = buf[0] & 0x0F;
    let masked = buf[1] & 0x80 != 0;
    let len7 = (buf[1] & 0x7F) as usize;

    let (payload_len, ext) = match len7 {
        126 => {
            if buf.len() < 4 {
                return Ok(None);
            }
            (u16::from_be_bytes([buf[2], buf[3]]) as usize, 2)
        }
        127 => {
            if buf.len() < 10 {
                return Ok(None);
            }
            let mut wide = [0u8; 8];
            wide.copy_from_slice(&buf[2..10]);
            let wide = u64::from_be_bytes(wide);
            if wide > usize::MAX as u64 {
                return Err(WsError::FrameTooBig);
            }
            (wide as usize, 8)
        }
        short => (short, 0),
    };

    let header_len = 2 + ext + if masked { 4 } else { 0 };
    if buf.len() < header_len {
        return Ok(None);
    }
    let mut mask = [0u8; 4];
    if masked {
        mask.copy_from_slice(&buf[2 + ext..2 + ext + 4]);
    }
    Ok(Some(FrameHeader {
        fin,
        opcode,
        masked,
        mask,
        payload_len,
        header_len,
    }))
}

fn write_some(sock: &mut impl Write, bytes: &[u8]) -> Result<usize, WsError> {
    match sock.write(bytes) {
        Ok(put) => Ok(put),
        Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => Ok(0),
        Err(e) if e.kind() == std::io::ErrorKind::Interrupted => Ok(0),
        Err(e) => Err(WsError::Io(e)),
    }
}
