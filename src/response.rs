// Copyright (c) 2016 The Rouille developers
// Licensed under the Apache License, Version 2.0
// <LICENSE-APACHE or
// http://www.apache.org/licenses/LICENSE-2.0> or the MIT
// license <LICENSE-MIT or http://opensource.org/licenses/MIT>,
// at your option. All files in the project carrying such
// notice may not be copied, modified, or distributed except
// according to those terms.

//! Streaming response writer.
//!
//! Unlike a framework that buffers a whole `Response` object before serializing it, this builder
//! writes status line, headers and body straight onto the connection's socket as a handler
//! produces them, one `write_bytes` at a time, so a slot never needs enough memory to hold a
//! full response.

use std::io::{self, Write};

use itoa::write as write_itoa;
use log::trace;
use mio::net::TcpStream;

use crate::connection::Connection;
use crate::phase::{Flags, Phase, WritePhase};

/// Starts a response: writes the status line and the mandatory `Connection: close` header, plus
/// `Content-Type` if given. Must be called while `conn.phase` is `Write(Begin)`.
pub fn begin_response(
    conn: &mut Connection,
    status: u16,
    content_type: Option<&str>,
) -> io::Result<()> {
    debug_assert_eq!(conn.phase, Phase::Write(WritePhase::Begin));

    let mut line = Vec::with_capacity(32);
    line.extend_from_slice(b"HTTP/1.1 ");
    write_itoa(&mut line, status).ok();
    line.push(b' ');
    line.extend_from_slice(reason_phrase(status).as_bytes());
    line.extend_from_slice(b"\r\n");
    line.extend_from_slice(b"Connection: close\r\n");
    write_raw(conn, &line)?;

    if let Some(ct) = content_type {
        write_header(conn, "Content-Type", ct)?;
    }

    conn.status = status;
    conn.phase = Phase::Write(WritePhase::Header);
    Ok(())
}

/// Emits one `Name: value\r\n` header line. Must be called between `begin_response` and
/// `end_header`.
pub fn write_header(conn: &mut Connection, name: &str, value: &str) -> io::Result<()> {
    debug_assert_eq!(conn.phase, Phase::Write(WritePhase::Header));
    let mut line = Vec::with_capacity(name.len() + value.len() + 4);
    line.extend_from_slice(name.as_bytes());
    line.extend_from_slice(b": ");
    line.extend_from_slice(value.as_bytes());
    line.extend_from_slice(b"\r\n");
    write_raw(conn, &line)
}

/// Writes `Content-Length: n` and records it, so `end_header` does not fall back to
/// chunked framing for this response.
pub fn set_content_length(conn: &mut Connection, n: u64) -> io::Result<()> {
    conn.write_content_length = Some(n);
    let mut value = Vec::new();
    write_itoa(&mut value, n).ok();
    write_header(conn, "Content-Length", std::str::from_utf8(&value).unwrap())
}

/// Terminates the header block. If no content-length was set, switches the connection to
/// chunked response framing.
pub fn end_header(conn: &mut Connection) -> io::Result<()> {
    debug_assert_eq!(conn.phase, Phase::Write(WritePhase::Header));
    if conn.write_content_length.is_none() {
        write_header(conn, "Transfer-Encoding", "chunked")?;
        conn.flags.insert(Flags::WRITE_CHUNKED);
    }
    write_raw(conn, b"\r\n")?;
    conn.phase = Phase::Write(WritePhase::Body);
    Ok(())
}

/// Writes a slice of body bytes, applying chunked framing if active.
pub fn write_body(conn: &mut Connection, data: &[u8]) -> io::Result<()> {
    debug_assert_eq!(conn.phase, Phase::Write(WritePhase::Body));
    if conn.flags.contains(Flags::WRITE_CHUNKED) {
        write_chunk(conn, data)
    } else {
        write_raw(conn, data)
    }
}

/// Finishes the body: emits the terminating zero-length chunk if chunked, then transitions the
/// connection to `READ_DONE` (it will be closed once the peer's side of the socket reaches EOF).
pub fn end_body(conn: &mut Connection) -> io::Result<()> {
    if conn.flags.contains(Flags::WRITE_CHUNKED) {
        write_chunk(conn, &[])?;
    }
    conn.phase = Phase::Read(crate::phase::ReadPhase::Done);
    trace!("response complete, status {}", conn.status);
    Ok(())
}

fn write_chunk(conn: &mut Connection, data: &[u8]) -> io::Result<()> {
    let mut framed = Vec::with_capacity(data.len() + 16);
    crate::util::write_hex(&mut framed, data.len());
    framed.extend_from_slice(b"\r\n");
    framed.extend_from_slice(data);
    framed.extend_from_slice(b"\r\n");
    write_raw(conn, &framed)
}

fn write_raw(conn: &mut Connection, data: &[u8]) -> io::Result<()> {
    match conn.socket_mut() {
        Some(socket) => write_all_nonblocking(socket, data),
        None => Ok(()),
    }
}

/// `Write::write_all` that tolerates `WouldBlock` by retrying rather than failing outright: the
/// underlying socket is non-blocking, so a response built of several small `write_raw` calls would
/// otherwise drop bytes under backpressure and desync Content-Length/chunk framing the moment any
/// one of them hit a full send buffer. Mirrors `websocket::write_all_nonblocking`.
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

/// The phrase corresponding to a status code used anywhere in this crate (handshake, error
/// responses, handler-chosen statuses). Unlisted codes fall back to a generic phrase rather than
/// panicking, since a handler is free to return any status it likes.
pub fn reason_phrase(status_code: u16) -> &'static str {
    match status_code {
        101 => "Switching Protocols",
        200 => "OK",
        204 => "No Content",
        304 => "Not Modified",
        400 => "Bad Request",
        404 => "Not Found",
        405 => "Method Not Allowed",
        500 => "Internal Server Error",
        505 => "HTTP Version Not Supported",
        _ => "Unknown",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn known_status_codes_have_phrases() {
        assert_eq!(reason_phrase(200), "OK");
        assert_eq!(reason_phrase(404), "Not Found");
        assert_eq!(reason_phrase(999), "Unknown");
    }
}
