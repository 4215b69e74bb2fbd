// Copyright (c) 2016 The Rouille developers
// Licensed under the Apache License, Version 2.0
// <LICENSE-APACHE or
// http://www.apache.org/licenses/LICENSE-2.0> or the MIT
// license <LICENSE-MIT or http://opensource.org/licenses/MIT>,
// at your option. All files in the project carrying such
// notice may not be copied, modified, or distributed except
// according to those terms.

//! WebSocket handshake, frame header decoding and masked payload I/O (RFC 6455).
//!
//! A `WsConnection` is a second, independent pool slot: once an HTTP connection's headers ask
//! for `Upgrade: websocket`, the multiplexer migrates the socket here and the byte-at-a-time
//! header parser (`crate::parser`) never sees it again. Frame headers are decoded the same way
//! HTTP headers are: one byte at a time, resumable across ticks, never blocking.

use std::io::{self, Read, Write};

use log::{trace, warn};
use mio::net::TcpStream;

use crate::router::pattern_matches;

mod handshake;

pub use handshake::accept_token;

const OPCODE_CONT: u8 = 0x0;
const OPCODE_TEXT: u8 = 0x1;
const OPCODE_BIN: u8 = 0x2;
const OPCODE_CLOSE: u8 = 0x8;
const OPCODE_PING: u8 = 0x9;
const OPCODE_PONG: u8 = 0xA;

const FIN: u8 = 0x80;
const MASK_BIT: u8 = 0x80;
const LEN_16BIT: u8 = 126;
const LEN_64BIT: u8 = 127;

/// Sub-state of the resumable frame header decoder. Meaningless once `Ready` is reached and the
/// frame has been fully dispatched. Each extended-length variant carries the `masked` bit read
/// from the second header byte, since a `Mask` phase is only reached for masked frames.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
enum HeaderPhase {
    Opcode,
    MaskAndLen,
    ExtLen16 { index: u8, value: u16, masked: bool },
    ExtLen64 { index: u8, value: u64, masked: bool },
    Mask { index: u8 },
    Ready,
}

/// Payload-accumulation state for frames the multiplexer itself must fully drain before acting:
/// CLOSE (echo + callback + close) and PING (echo as PONG). TEXT/BINARY frames are instead
/// handed to a `WebSocketHandler::on_message` via `read_payload`; CONT/PONG frames are drained
/// and dropped with no callback at all.
#[derive(Debug)]
struct ControlDrain {
    opcode: u8,
    buf: Vec<u8>,
}

/// One slot in the WebSocket connection pool.
pub struct WsConnection {
    socket: Option<TcpStream>,
    handler: Option<&'static dyn crate::handler::WebSocketHandler>,

    header_phase: HeaderPhase,
    control: Option<ControlDrain>,

    pub frame_opcode: u8,
    pub frame_length: u64,
    pub frame_index: u64,
    pub frame_mask: [u8; 4],

    pub(crate) last_active_tick: u64,
}

impl WsConnection {
    pub fn empty() -> WsConnection {
        WsConnection {
            socket: None,
            handler: None,
            header_phase: HeaderPhase::Opcode,
            control: None,
            frame_opcode: 0,
            frame_length: 0,
            frame_index: 0,
            frame_mask: [0; 4],
            last_active_tick: 0,
        }
    }

    pub fn is_free(&self) -> bool {
        self.socket.is_none()
    }

    /// Migrates an already-upgraded HTTP socket into this slot.
    pub fn adopt(
        &mut self,
        socket: TcpStream,
        handler: &'static dyn crate::handler::WebSocketHandler,
        tick: u64,
    ) {
        self.socket = Some(socket);
        self.handler = Some(handler);
        self.header_phase = HeaderPhase::Opcode;
        self.control = None;
        self.frame_opcode = 0;
        self.frame_length = 0;
        self.frame_index = 0;
        self.frame_mask = [0; 4];
        self.last_active_tick = tick;
    }

    pub fn close(&mut self) {
        self.socket = None;
        self.handler = None;
        self.control = None;
        self.header_phase = HeaderPhase::Opcode;
    }

    pub fn handler(&self) -> Option<&'static dyn crate::handler::WebSocketHandler> {
        self.handler
    }

    pub fn socket_mut(&mut self) -> Option<&mut TcpStream> {
        self.socket.as_mut()
    }

    pub fn socket(&self) -> Option<&TcpStream> {
        self.socket.as_ref()
    }

    fn header_ready(&self) -> bool {
        self.header_phase == HeaderPhase::Ready
    }

    /// True while a CLOSE/PING payload is still being drained by the multiplexer itself rather
    /// than handed to a handler callback.
    fn has_pending_control(&self) -> bool {
        self.control.is_some()
    }
}

/// Matched against request paths the same way `crate::router::Router` is: exact, except a
/// trailing `*` wildcard. A separate table because WebSocket routes carry a different handler
/// trait and none of the content-type/streaming concerns an HTTP route has.
#[derive(Default)]
pub struct WsRouter {
    routes: Vec<(String, &'static dyn crate::handler::WebSocketHandler)>,
}

impl WsRouter {
    pub fn new() -> WsRouter {
        WsRouter { routes: Vec::new() }
    }

    pub fn add(&mut self, pattern: impl Into<String>, handler: &'static dyn crate::handler::WebSocketHandler) {
        self.routes.push((pattern.into(), handler));
    }

    pub fn find(&self, path: &str) -> Option<&'static dyn crate::handler::WebSocketHandler> {
        self.routes
            .iter()
            .find(|(pattern, _)| pattern_matches(pattern, path))
            .map(|(_, handler)| *handler)
    }
}

/// Writes the handshake response directly to the (still-HTTP-typed) socket, bypassing
/// `crate::response` entirely: the source emits this as one fixed block of text, never through
/// the general response builder, and this crate keeps that asymmetry since the handshake has
/// none of the framing choices (content-length vs chunked) an ordinary response has.
pub fn write_handshake_response<W: Write>(mut out: W, websocket_key: &str) -> io::Result<()> {
    out.write_all(b"HTTP/1.1 101 Switching Protocols\r\n")?;
    out.write_all(b"Upgrade: websocket\r\n")?;
    out.write_all(b"Connection: Upgrade\r\n")?;
    if !websocket_key.is_empty() {
        out.write_all(b"Sec-WebSocket-Accept: ")?;
        out.write_all(accept_token(websocket_key).as_bytes())?;
        out.write_all(b"\r\n")?;
    }
    out.write_all(b"\r\n")
}

/// Feeds one byte of the frame header into the resumable decoder. Returns `true` once
/// `frame_opcode`/`frame_length`/`frame_mask` are fully populated and `frame_index` has been
/// reset to zero, at which point the caller dispatches on `frame_opcode`.
fn feed_header_byte(conn: &mut WsConnection, byte: u8) -> bool {
    match conn.header_phase {
        HeaderPhase::Opcode => {
            conn.frame_opcode = byte & 0x0F;
            conn.header_phase = HeaderPhase::MaskAndLen;
            false
        }
        HeaderPhase::MaskAndLen => {
            let masked = byte & MASK_BIT != 0;
            let len = byte & 0x7F;
            conn.frame_mask = [0; 4];
            match len {
                LEN_16BIT => {
                    conn.header_phase = HeaderPhase::ExtLen16 { index: 0, value: 0, masked };
                    false
                }
                LEN_64BIT => {
                    conn.header_phase = HeaderPhase::ExtLen64 { index: 0, value: 0, masked };
                    false
                }
                n => {
                    conn.frame_length = n as u64;
                    finish_length(conn, masked)
                }
            }
        }
        HeaderPhase::ExtLen16 { index, value, masked } => {
            let value = (value << 8) | byte as u16;
            if index == 1 {
                conn.frame_length = value as u64;
                finish_length(conn, masked)
            } else {
                conn.header_phase = HeaderPhase::ExtLen16 { index: index + 1, value, masked };
                false
            }
        }
        HeaderPhase::ExtLen64 { index, value, masked } => {
            let value = (value << 8) | byte as u64;
            if index == 7 {
                conn.frame_length = value;
                finish_length(conn, masked)
            } else {
                conn.header_phase = HeaderPhase::ExtLen64 { index: index + 1, value, masked };
                false
            }
        }
        HeaderPhase::Mask { index } => {
            conn.frame_mask[index as usize] = byte;
            if index == 3 {
                conn.header_phase = HeaderPhase::Ready;
                true
            } else {
                conn.header_phase = HeaderPhase::Mask { index: index + 1 };
                false
            }
        }
        HeaderPhase::Ready => true,
    }
}

fn finish_length(conn: &mut WsConnection, masked: bool) -> bool {
    if masked {
        conn.header_phase = HeaderPhase::Mask { index: 0 };
        false
    } else {
        conn.header_phase = HeaderPhase::Ready;
        true
    }
}

/// Reads and decodes as many frame-header bytes as are currently available (non-blocking),
/// pausing (to be resumed on the next readable tick) the moment the socket would block. Returns
/// `Ok(true)` once the header is fully decoded.
pub fn decode_frame_header(conn: &mut WsConnection) -> io::Result<bool> {
    loop {
        if conn.header_ready() {
            return Ok(true);
        }
        let mut byte = [0u8; 1];
        let n = match conn.socket_mut() {
            Some(socket) => match socket.read(&mut byte) {
                Ok(n) => n,
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(false),
                Err(e) => return Err(e),
            },
            None => return Err(io::Error::new(io::ErrorKind::NotConnected, "no socket")),
        };
        if n == 0 {
            return Err(io::Error::new(io::ErrorKind::UnexpectedEof, "peer closed mid-frame-header"));
        }
        if feed_header_byte(conn, byte[0]) {
            conn.frame_index = 0;
            return Ok(true);
        }
    }
}

/// Reads up to `buf.len()` bytes of the current frame's payload, XORing each against
/// `frame_mask` in wire order and advancing `frame_index`. Returns `Ok(0)` once
/// `frame_index == frame_length`, never reading past the frame boundary even if `buf` is larger.
/// A `WouldBlock` error means "nothing available this tick, call again once readable" and is not
/// a protocol failure.
pub fn read_payload(conn: &mut WsConnection, buf: &mut [u8]) -> io::Result<usize> {
    let remaining = conn.frame_length.saturating_sub(conn.frame_index);
    if remaining == 0 {
        return Ok(0);
    }
    let want = (buf.len() as u64).min(remaining) as usize;
    let n = match conn.socket_mut() {
        Some(socket) => socket.read(&mut buf[..want])?,
        None => return Err(io::Error::new(io::ErrorKind::NotConnected, "no socket")),
    };
    for b in &mut buf[..n] {
        *b ^= conn.frame_mask[(conn.frame_index % 4) as usize];
        conn.frame_index += 1;
    }
    Ok(n)
}

/// Sends one complete, unmasked frame: opcode byte (FIN set, as the server never fragments),
/// three-tier length encoding, then the raw payload. Mirrors `websocket_send` in the source.
pub fn send_frame(conn: &mut WsConnection, opcode: u8, data: &[u8]) -> io::Result<()> {
    let mut out = Vec::with_capacity(data.len() + 10);
    out.push(FIN | opcode);

    let len = data.len();
    if len < LEN_16BIT as usize {
        out.push(len as u8);
    } else if len <= u16::MAX as usize {
        out.push(LEN_16BIT);
        out.extend_from_slice(&(len as u16).to_be_bytes());
    } else {
        out.push(LEN_64BIT);
        out.extend_from_slice(&(len as u64).to_be_bytes());
    }
    out.extend_from_slice(data);

    match conn.socket_mut() {
        Some(socket) => write_all_nonblocking(socket, &out),
        None => Ok(()),
    }
}

/// `Write::write_all` that tolerates `WouldBlock` by retrying rather than failing outright: the
/// underlying socket is non-blocking, but a server-originated control/echo frame is small enough
/// to flush within the handful of retries this allows.
fn write_all_nonblocking(socket: &mut TcpStream, mut data: &[u8]) -> io::Result<()> {
    let mut retries = 0;
    while !data.is_empty() {
        match socket.write(data) {
            Ok(0) => return Err(io::Error::new(io::ErrorKind::WriteZero, "socket closed mid-write")),
            Ok(n) => data = &data[n..],
            Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => {
                retries += 1;
                if retries > 10_000 {
                    return Err(io::Error::new(io::ErrorKind::WouldBlock, "send buffer stayed full"));
                }
                std::thread::yield_now();
            }
            Err(e) => return Err(e),
        }
    }
    Ok(())
}

/// Outcome of polling a ws slot for one tick, telling the multiplexer what bookkeeping to do.
pub enum Dispatch {
    /// Header incomplete or control payload still draining; nothing more to do this tick.
    Pending,
    /// A TEXT or BINARY frame is ready for (or mid-way through) delivery; the caller should
    /// invoke `on_message` and then check `message_complete`.
    Message,
    /// A CONT or PONG frame: drained and logged, no callback.
    Ignored,
    /// A CLOSE frame was fully echoed; the caller must invoke `on_close` and free the slot.
    Closed,
    /// A PING was fully echoed as a PONG; nothing further to do.
    Ponged,
}

/// Advances a ws slot by one step: completes the frame header if needed, then either routes to
/// the handler (TEXT/BINARY) or drains+replies to control frames (CLOSE/PING) itself, tolerating
/// partial progress across ticks throughout.
pub fn poll_frame(conn: &mut WsConnection) -> io::Result<Dispatch> {
    if conn.has_pending_control() {
        let mut drain = conn.control.take().unwrap();
        return finish_or_resume_control(conn, &mut drain);
    }

    if !conn.header_ready() {
        if !decode_frame_header(conn)? {
            return Ok(Dispatch::Pending);
        }
    }

    match conn.frame_opcode {
        OPCODE_TEXT | OPCODE_BIN => Ok(Dispatch::Message),
        OPCODE_CONT | OPCODE_PONG => {
            trace!("ws: draining {} frame with no callback", opcode_name(conn.frame_opcode));
            drain_and_discard(conn)?;
            reset_header(conn);
            Ok(Dispatch::Ignored)
        }
        OPCODE_CLOSE | OPCODE_PING => {
            let mut drain = ControlDrain {
                opcode: conn.frame_opcode,
                buf: Vec::with_capacity(conn.frame_length as usize),
            };
            finish_or_resume_control(conn, &mut drain)
        }
        other => {
            warn!("ws: unrecognized opcode 0x{:x}, dropping frame", other);
            drain_and_discard(conn)?;
            reset_header(conn);
            Ok(Dispatch::Ignored)
        }
    }
}

fn finish_or_resume_control(conn: &mut WsConnection, drain: &mut ControlDrain) -> io::Result<Dispatch> {
    let done = drive_control(conn, drain)?;
    if done {
        let opcode = drain.opcode;
        let buf = std::mem::take(&mut drain.buf);
        reset_header(conn);
        Ok(match opcode {
            OPCODE_CLOSE => {
                let _ = send_frame(conn, OPCODE_CLOSE, &buf);
                Dispatch::Closed
            }
            OPCODE_PING => {
                trace!("ws: replying to ping with {} byte payload", buf.len());
                let _ = send_frame(conn, OPCODE_PONG, &buf);
                Dispatch::Ponged
            }
            _ => unreachable!("ControlDrain is only ever built for CLOSE/PING"),
        })
    } else {
        conn.control = Some(ControlDrain {
            opcode: drain.opcode,
            buf: std::mem::take(&mut drain.buf),
        });
        Ok(Dispatch::Pending)
    }
}

/// Called again on a later tick for a TEXT/BINARY frame that `on_message` only partially
/// consumed (`frame_index < frame_length`): the multiplexer re-polls `Dispatch::Message` until
/// the handler has drained the whole frame, then resets for the next header.
pub fn message_complete(conn: &WsConnection) -> bool {
    conn.frame_index >= conn.frame_length
}

pub fn reset_after_message(conn: &mut WsConnection) {
    reset_header(conn);
}

fn reset_header(conn: &mut WsConnection) {
    conn.header_phase = HeaderPhase::Opcode;
    conn.frame_opcode = 0;
    conn.frame_length = 0;
    conn.frame_index = 0;
    conn.frame_mask = [0; 4];
}

fn drain_and_discard(conn: &mut WsConnection) -> io::Result<()> {
    let mut scratch = [0u8; 256];
    while conn.frame_index < conn.frame_length {
        match read_payload(conn, &mut scratch) {
            Ok(0) => break,
            Ok(_) => {}
            Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => break,
            Err(e) => return Err(e),
        }
    }
    Ok(())
}

fn drive_control(conn: &mut WsConnection, drain: &mut ControlDrain) -> io::Result<bool> {
    let mut scratch = [0u8; 256];
    loop {
        if conn.frame_index >= conn.frame_length {
            return Ok(true);
        }
        match read_payload(conn, &mut scratch) {
            Ok(0) => return Ok(conn.frame_index >= conn.frame_length),
            Ok(n) => drain.buf.extend_from_slice(&scratch[..n]),
            Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(false),
            Err(e) => return Err(e),
        }
    }
}

fn opcode_name(opcode: u8) -> &'static str {
    match opcode {
        OPCODE_CONT => "CONT",
        OPCODE_TEXT => "TEXT",
        OPCODE_BIN => "BINARY",
        OPCODE_CLOSE => "CLOSE",
        OPCODE_PING => "PING",
        OPCODE_PONG => "PONG",
        _ => "unknown",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn feed_all(conn: &mut WsConnection, bytes: &[u8]) -> bool {
        let mut ready = false;
        for &b in bytes {
            ready = feed_header_byte(conn, b);
            if ready {
                break;
            }
        }
        ready
    }

    #[test]
    fn short_unmasked_frame_header() {
        let mut conn = WsConnection::empty();
        // FIN+TEXT, unmasked, length 5
        assert!(feed_all(&mut conn, &[0x81, 0x05]));
        assert_eq!(conn.frame_opcode, OPCODE_TEXT);
        assert_eq!(conn.frame_length, 5);
        assert_eq!(conn.frame_mask, [0; 4]);
    }

    #[test]
    fn masked_frame_header_with_16bit_length() {
        let mut conn = WsConnection::empty();
        let bytes = [0x82u8, 0x80 | 126, 0x01, 0x00, 0xDE, 0xAD, 0xBE, 0xEF];
        assert!(feed_all(&mut conn, &bytes));
        assert_eq!(conn.frame_opcode, OPCODE_BIN);
        assert_eq!(conn.frame_length, 256);
        assert_eq!(conn.frame_mask, [0xDE, 0xAD, 0xBE, 0xEF]);
    }

    #[test]
    fn masked_frame_header_with_64bit_length() {
        let mut conn = WsConnection::empty();
        let mut bytes = vec![0x81u8, 0x80 | 127];
        bytes.extend_from_slice(&300u64.to_be_bytes());
        bytes.extend_from_slice(&[1, 2, 3, 4]);
        assert!(feed_all(&mut conn, &bytes));
        assert_eq!(conn.frame_length, 300);
        assert_eq!(conn.frame_mask, [1, 2, 3, 4]);
    }

    #[test]
    fn unmasked_frame_with_16bit_length_skips_mask_phase() {
        let mut conn = WsConnection::empty();
        let bytes = [0x82u8, 126, 0x00, 0x10];
        assert!(feed_all(&mut conn, &bytes));
        assert_eq!(conn.frame_length, 16);
        assert_eq!(conn.frame_mask, [0; 4]);
    }
}
