// Copyright (c) 2016 The Rouille developers
// Licensed under the Apache License, Version 2.0
// <LICENSE-APACHE or
// http://www.apache.org/licenses/LICENSE-2.0> or the MIT
// license <LICENSE-MIT or http://opensource.org/licenses/MIT>,
// at your option. All files in the project carrying such
// notice may not be copied, modified, or distributed except
// according to those terms.

//! Byte-at-a-time body reader: content-length countdown or chunked transfer-encoding, feeding a
//! single reusable [`Connection`] rather than buffering a whole request body.
//!
//! `getc`'s `WouldBlock` errors are not failures: the chunk header and chunk trailer can each
//! span more than one `read(2)` call, and the sub-state needed to resume (`chunk_phase`, plus the
//! header scratch buffer, reused here exactly as the header parser reuses it) lives on the
//! connection, so a `WouldBlock` simply means "call `getc` again once the socket is readable".

use std::io::{self, Read};

use crate::connection::Connection;
use crate::phase::Flags;

const CR: u8 = b'\r';
const LF: u8 = b'\n';

/// Sub-state of the chunked decoder. Meaningless when `Flags::READ_CHUNKED` is not set.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum ChunkPhase {
    /// Accumulating the hex chunk-size line (and any `;extension`, which is discarded) into the
    /// connection's scratch buffer.
    Header,
    /// Chunk-size line's `\r` has been seen, its `\n` has not. Kept separate from
    /// `Flags::EXPECT_NEWLINE` (the header parser's own pending-LF flag) because `service_http`
    /// checks that flag before dispatching on phase to fix up the header/body handoff; a chunked
    /// body byte stuck behind a `WouldBlock` between the CR and LF would otherwise get routed into
    /// `parser::feed` and discarded instead of reaching `getc_chunked`.
    HeaderNewline,
    /// Delivering the `remaining` data bytes of the current chunk.
    Data { remaining: u64 },
    /// Consuming the mandatory `\r\n` after a chunk's data, or after the terminal zero-size
    /// chunk. `then_done` distinguishes the two: after a terminal chunk's trailer, the body ends;
    /// after an ordinary chunk's trailer, another chunk header follows.
    Trailer { remaining: u8, then_done: bool },
    Done,
}

/// Returns the next body byte, `Ok(None)` at the end of the body, or a socket error. A
/// `WouldBlock` error means "not ready yet, call again once the socket is readable" rather than a
/// real failure.
pub fn getc(conn: &mut Connection) -> io::Result<Option<u8>> {
    if let Some(b) = conn.peek_byte.take() {
        return Ok(Some(b));
    }

    if conn.flags.contains(Flags::READ_CHUNKED) {
        getc_chunked(conn)
    } else if let Some(remaining) = conn.read_content_length {
        getc_content_length(conn, remaining)
    } else {
        Ok(None)
    }
}

/// Fills the one-byte pushback via `getc` if it is not already full. Idempotent.
pub fn peek(conn: &mut Connection) -> io::Result<Option<u8>> {
    if conn.peek_byte.is_some() {
        return Ok(conn.peek_byte);
    }
    match getc(conn)? {
        Some(b) => {
            conn.peek_byte = Some(b);
            Ok(Some(b))
        }
        None => Ok(None),
    }
}

fn getc_content_length(conn: &mut Connection, remaining: u64) -> io::Result<Option<u8>> {
    if remaining == 0 {
        return Ok(None);
    }
    let byte = read_raw_byte(conn)?;
    conn.read_content_length = Some(remaining - 1);
    Ok(Some(byte))
}

fn getc_chunked(conn: &mut Connection) -> io::Result<Option<u8>> {
    loop {
        match conn.chunk_phase {
            ChunkPhase::Done => return Ok(None),

            ChunkPhase::Header => {
                let byte = read_raw_byte(conn)?;
                if byte == CR {
                    conn.chunk_phase = ChunkPhase::HeaderNewline;
                } else {
                    conn.scratch_push(byte);
                }
            }

            ChunkPhase::HeaderNewline => {
                let byte = read_raw_byte(conn)?;
                if byte != LF {
                    return Err(malformed("chunk size line missing LF"));
                }
                let size = parse_chunk_size(conn.scratch());
                conn.scratch_clear();
                conn.chunk_phase = if size == 0 {
                    ChunkPhase::Trailer {
                        remaining: 2,
                        then_done: true,
                    }
                } else {
                    ChunkPhase::Data { remaining: size }
                };
            }

            ChunkPhase::Data { remaining } => {
                let byte = read_raw_byte(conn)?;
                conn.chunk_phase = if remaining == 1 {
                    ChunkPhase::Trailer {
                        remaining: 2,
                        then_done: false,
                    }
                } else {
                    ChunkPhase::Data {
                        remaining: remaining - 1,
                    }
                };
                return Ok(Some(byte));
            }

            ChunkPhase::Trailer {
                remaining,
                then_done,
            } => {
                read_raw_byte(conn)?;
                conn.chunk_phase = if remaining == 1 {
                    if then_done {
                        ChunkPhase::Done
                    } else {
                        ChunkPhase::Header
                    }
                } else {
                    ChunkPhase::Trailer {
                        remaining: remaining - 1,
                        then_done,
                    }
                };
                if remaining == 1 && then_done {
                    return Ok(None);
                }
            }
        }
    }
}

/// Parses the hex digits at the start of a chunk-size line, ignoring a trailing `;extension`.
/// Permissive like the rest of the parser: non-hex bytes simply stop the scan rather than
/// rejecting the request.
fn parse_chunk_size(line: &[u8]) -> u64 {
    let mut value: u64 = 0;
    for &b in line {
        if b == b';' {
            break;
        }
        let is_hex = b.is_ascii_hexdigit();
        if !is_hex {
            break;
        }
        value = (value << 4) | crate::util::hex_to_int(b) as u64;
    }
    value
}

fn malformed(msg: &'static str) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidData, msg)
}

fn read_raw_byte(conn: &mut Connection) -> io::Result<u8> {
    let socket = conn
        .socket_mut()
        .ok_or_else(|| io::Error::new(io::ErrorKind::NotConnected, "slot has no socket"))?;
    let mut buf = [0u8; 1];
    match socket.read(&mut buf) {
        Ok(0) => Err(io::Error::new(io::ErrorKind::UnexpectedEof, "peer closed mid-body")),
        Ok(_) => Ok(buf[0]),
        Err(e) => Err(e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::phase::{Phase, ReadPhase};
    use std::io::Write;
    use std::net::{TcpListener, TcpStream as StdTcpStream};

    use mio::net::TcpStream;

    /// A connected pair with the server half wrapped as the `mio::net::TcpStream` that
    /// `Connection` actually stores, and the client half left as a plain blocking socket so test
    /// bodies can write complete fixtures before the non-blocking server half reads them.
    fn connected_pair() -> (StdTcpStream, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let client = StdTcpStream::connect(addr).unwrap();
        let (server, _) = listener.accept().unwrap();
        let server = TcpStream::from_stream(server).unwrap();
        (client, server)
    }

    #[test]
    fn content_length_body_ends_exactly_at_limit() {
        let (mut client, server) = connected_pair();
        client.write_all(b"hello").unwrap();

        let mut conn = Connection::empty();
        conn.accept(server, 0);
        conn.phase = Phase::Read(ReadPhase::Body);
        conn.read_content_length = Some(5);

        let mut collected = Vec::new();
        loop {
            match getc(&mut conn).unwrap() {
                Some(b) => collected.push(b),
                None => break,
            }
        }
        assert_eq!(collected, b"hello");
    }

    #[test]
    fn chunked_body_decodes_across_chunks() {
        let (mut client, server) = connected_pair();
        client.write_all(b"4\r\n0123\r\n4\r\n4567\r\n0\r\n\r\n").unwrap();

        let mut conn = Connection::empty();
        conn.accept(server, 0);
        conn.phase = Phase::Read(ReadPhase::Body);
        conn.flags.insert(Flags::READ_CHUNKED);
        conn.chunk_phase = ChunkPhase::Header;

        let mut collected = Vec::new();
        loop {
            match getc(&mut conn).unwrap() {
                Some(b) => collected.push(b),
                None => break,
            }
        }
        assert_eq!(collected, b"01234567");
    }

    #[test]
    fn peek_does_not_consume() {
        let (mut client, server) = connected_pair();
        client.write_all(b"ab").unwrap();

        let mut conn = Connection::empty();
        conn.accept(server, 0);
        conn.read_content_length = Some(2);

        assert_eq!(peek(&mut conn).unwrap(), Some(b'a'));
        assert_eq!(peek(&mut conn).unwrap(), Some(b'a'));
        assert_eq!(getc(&mut conn).unwrap(), Some(b'a'));
        assert_eq!(getc(&mut conn).unwrap(), Some(b'b'));
        assert_eq!(getc(&mut conn).unwrap(), None);
    }
}
