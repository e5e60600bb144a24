// src/ws/handshake.rs
//! HTTP/1.1 upgrade handshake
//!
//! Reads header bytes until the double CRLF, validates the upgrade request,
//! and synthesizes the `101 Switching Protocols` reply including the
//! `Sec-WebSocket-Accept` digest. Every failed check gets its own reject
//! reason; the connection is dropped without an HTTP error body.

use crate::ws::WsError;
use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use sha1::{Digest, Sha1};
use std::io::{Read, Write};
use thiserror::Error;

/// Upper bound on the upgrade request headers
pub const MAX_HEADER_BYTES: usize = 4 * 1024;

/// RFC 6455 magic appended to the client key before hashing
const WS_ACCEPT_GUID: &str = "258EAFA5-E914-47DA-95CA-C5AB0DC85B11";

/// Why an upgrade request was turned down
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandshakeReject {
    #[error("request headers exceed {MAX_HEADER_BYTES} bytes")]
    HeaderTooLarge,

    #[error("malformed HTTP request")]
    BadHeaderSyntax,

    #[error("first line must be a GET request")]
    NotGet,

    #[error("bad resource request")]
    BadResource,

    #[error("invalid HTTP version, expected >= 1.1")]
    BadHttpVersion,

    #[error("missing valid \"Upgrade\" header")]
    MissingUpgrade,

    #[error("missing valid \"Connection\" header")]
    MissingConnectionUpgrade,

    #[error("missing valid \"Sec-WebSocket-Key\" header")]
    BadKey,

    #[error("missing valid \"Sec-WebSocket-Version\" header")]
    BadWsVersion,

    #[error("missing valid \"Sec-WebSocket-Protocol\" header")]
    MissingProtocol,
}

/// Computes the `Sec-WebSocket-Accept` value for a client key
pub fn accept_key(key: &str) -> String {
    let mut sha = Sha1::default();
    sha.update(key.as_bytes());
    sha.update(WS_ACCEPT_GUID.as_bytes());
    BASE64.encode(sha.finalize())
}

/// Drives one connection from raw TCP accept to an upgraded WebSocket
///
/// States: reading the request, writing the 101 reply, upgraded. A failed
/// check surfaces as an error and the server tears the connection down.
pub struct HandShaker {
    resource: String,
    protocol: String,
    header: Vec<u8>,
    excess: Vec<u8>,
    response: Vec<u8>,
    response_sent: usize,
}

impl HandShaker {
    /// # Arguments
    /// * `resource` - Path suffix the request must ask for (`/<resource>`)
    /// * `protocol` - Required `Sec-WebSocket-Protocol` token
    pub fn new(resource: &str, protocol: &str) -> Self {
        HandShaker {
            resource: resource.to_string(),
            protocol: protocol.to_string(),
            header: Vec::new(),
            excess: Vec::new(),
            response: Vec::new(),
            response_sent: 0,
        }
    }

    /// Pulls header bytes off the transport
    ///
    /// Once the terminating empty line arrives the request is validated and
    /// the reply buffer filled; anything read past the terminator is kept
    /// for the upgraded connection.
    pub fn receive(&mut self, sock: &mut impl Read) -> Result<(), WsError> {
        if !self.response.is_empty() {
            return Ok(());
        }
        let mut chunk = [0u8; 512];
        loop {
            match sock.read(&mut chunk) {
                Ok(0) => return Err(WsError::TransportClosed),
                Ok(got) => {
                    self.header.extend_from_slice(&chunk[..got]);
                    if let Some(end) = find_header_end(&self.header) {
                        if end > MAX_HEADER_BYTES {
                            return Err(HandshakeReject::HeaderTooLarge.into());
                        }
                        self.excess = self.header.split_off(end);
                        self.build_response()?;
                        return Ok(());
                    }
                    if self.header.len() >= MAX_HEADER_BYTES {
                        return Err(HandshakeReject::HeaderTooLarge.into());
                    }
                }
                Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => return Ok(()),
                Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(WsError::Io(e)),
            }
        }
    }

    pub fn needs_to_send(&self) -> bool {
        !self.response.is_empty() && self.response_sent < self.response.len()
    }

    pub fn send(&mut self, sock: &mut impl Write) -> Result<(), WsError> {
        if !self.needs_to_send() {
            return Ok(());
        }
        match sock.write(&self.response[self.response_sent..]) {
            Ok(put) => self.response_sent += put,
            Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {}
            Err(e) if e.kind() == std::io::ErrorKind::Interrupted => {}
            Err(e) => return Err(WsError::Io(e)),
        }
        Ok(())
    }

    /// True once the whole 101 reply is on the wire
    pub fn upgraded(&self) -> bool {
        !self.response.is_empty() && self.response_sent == self.response.len()
    }

    /// Bytes received past the header end, to seed the frame codec
    pub fn take_excess(&mut self) -> Vec<u8> {
        std::mem::take(&mut self.excess)
    }

    fn build_response(&mut self) -> Result<(), HandshakeReject> {
        let text =
            std::str::from_utf8(&self.header).map_err(|_| HandshakeReject::BadHeaderSyntax)?;
        let lines = fold_lines(text)?;
        if lines.is_empty() {
            return Err(HandshakeReject::BadHeaderSyntax);
        }
        self.check_request_line(&lines[0])?;

        if !header_value(&lines, "Upgrade")
            .is_some_and(|value| value.eq_ignore_ascii_case("websocket"))
        {
            return Err(HandshakeReject::MissingUpgrade);
        }
        let connection = header_value(&lines, "Connection").unwrap_or_default();
        if !split_tokens(&connection)
            .iter()
            .any(|token| token.eq_ignore_ascii_case("Upgrade"))
        {
            return Err(HandshakeReject::MissingConnectionUpgrade);
        }
        // Must be 16 bytes decoded, 24 chars encoded; it never gets decoded.
        let key = header_value(&lines, "Sec-WebSocket-Key").unwrap_or_default();
        if key.len() != 24 {
            return Err(HandshakeReject::BadKey);
        }
        let version = header_value(&lines, "Sec-WebSocket-Version").unwrap_or_default();
        if version.trim().parse::<u32>() != Ok(13) {
            return Err(HandshakeReject::BadWsVersion);
        }
        let protocols = header_value(&lines, "Sec-WebSocket-Protocol").unwrap_or_default();
        if !split_tokens(&protocols)
            .iter()
            .any(|token| token.eq_ignore_ascii_case(&self.protocol))
        {
            return Err(HandshakeReject::MissingProtocol);
        }

        let reply = format!(
            "HTTP/1.1 101 Switching Protocols\r\n\
             Upgrade: websocket\r\n\
             Connection: Upgrade\r\n\
             Sec-WebSocket-Accept: {}\r\n\
             Sec-WebSocket-Protocol: {}\r\n\
             \r\n",
            accept_key(&key),
            self.protocol
        );
        self.response = reply.into_bytes();
        Ok(())
    }

    fn check_request_line(&self, line: &str) -> Result<(), HandshakeReject> {
        let mut parts = line.split_whitespace();
        let method = parts.next().ok_or(HandshakeReject::BadHeaderSyntax)?;
        if method != "GET" {
            return Err(HandshakeReject::NotGet);
        }
        let path = parts.next().ok_or(HandshakeReject::BadHeaderSyntax)?;
        if path.trim_start_matches('/') != self.resource {
            return Err(HandshakeReject::BadResource);
        }
        let version = parts.next().ok_or(HandshakeReject::BadHeaderSyntax)?;
        let digits = version
            .strip_prefix("HTTP/")
            .ok_or(HandshakeReject::BadHttpVersion)?;
        let (major, minor) = digits.split_once('.').ok_or(HandshakeReject::BadHttpVersion)?;
        let major: u32 = major.parse().map_err(|_| HandshakeReject::BadHttpVersion)?;
        let minor: u32 = minor.parse().map_err(|_| HandshakeReject::BadHttpVersion)?;
        if major < 1 || (major == 1 && minor < 1) {
            return Err(HandshakeReject::BadHttpVersion);
        }
        Ok(())
    }
}

/// Offset one past the CRLFCRLF terminator, if present
fn find_header_end(buf: &[u8]) -> Option<usize> {
    buf.windows(4)
        .position(|window| window == b"\r\n\r\n")
        .map(|at| at + 4)
}

/// Splits into lines, gluing LWS continuation lines onto their parent
fn fold_lines(text: &str) -> Result<Vec<String>, HandshakeReject> {
    let mut lines: Vec<String> = Vec::new();
    for raw in text.split("\r\n") {
        if raw.is_empty() {
            continue;
        }
        if raw.starts_with(' ') || raw.starts_with('\t') {
            match lines.last_mut() {
                Some(prev) => prev.push_str(raw),
                None => return Err(HandshakeReject::BadHeaderSyntax),
            }
        } else {
            lines.push(raw.to_string());
        }
    }
    Ok(lines)
}

/// Last occurrence wins, header names compared case-insensitively
fn header_value(lines: &[String], name: &str) -> Option<String> {
    let mut found = None;
    for line in lines.iter().skip(1) {
        if let Some((header, value)) = line.split_once(':') {
            if header.trim().eq_ignore_ascii_case(name) {
                found = Some(value.trim().to_string());
            }
        }
    }
    found
}

fn split_tokens(list: &str) -> Vec<String> {
    list.split(',')
        .map(|token| token.trim().to_string())
        .filter(|token| !token.is_empty())
        .collect()
}
