// Copyright (c) 2016 The Rouille developers
// Licensed under the Apache License, Version 2.0
// <LICENSE-APACHE or
// http://www.apache.org/licenses/LICENSE-2.0> or the MIT
// license <LICENSE-MIT or http://opensource.org/licenses/MIT>,
// at your option. All files in the project carrying such
// notice may not be copied, modified, or distributed except
// according to those terms.

//! A small client-side HTTP/1.1 fetcher.
//!
//! This is not a general-purpose HTTP client: no redirects, no connection pooling, no TLS, one
//! request per connection. Its purpose is to demonstrate that [`crate::parser`] really is a
//! single state machine with a client/server discriminant rather than two separate parsers —
//! the same `feed` function that reads a request line on the server side reads a status line
//! here, with `Flags::IS_CLIENT` set to pick the other branch of each fork in the state machine.

use std::io::{self, Read, Write};
use std::net::TcpStream;
use std::time::Duration;

use crate::connection::Connection;
use crate::phase::{Flags, Phase, ReadPhase};

/// A fetched response: status code and a fully-drained body. Headers besides the ones
/// [`crate::parser`] already recognizes (`Content-Length`, `Transfer-Encoding`) are discarded,
/// matching this fetcher's narrow purpose.
pub struct FetchedResponse {
    pub status: u16,
    pub body: Vec<u8>,
}

/// Fetches `path` from `host:port` with a blocking, synchronous, one-shot GET request.
///
/// Blocking rather than tick-driven is deliberate: the fetcher is a standalone collaborator, not
/// a slot in the multiplexer's pools, so there is no readiness loop to cooperate with. Run it
/// from outside the multiplexer's thread (e.g. from a handler's own background work) if it must
/// coexist with a running `Multiplexer`.
pub fn fetch(host: &str, port: u16, path: &str, timeout: Duration) -> io::Result<FetchedResponse> {
    let mut socket = TcpStream::connect((host, port))?;
    socket.set_read_timeout(Some(timeout))?;
    socket.set_write_timeout(Some(timeout))?;

    let mut request = Vec::with_capacity(64 + path.len() + host.len());
    request.extend_from_slice(b"GET ");
    request.extend_from_slice(path.as_bytes());
    request.extend_from_slice(b" HTTP/1.1\r\nHost: ");
    request.extend_from_slice(host.as_bytes());
    request.extend_from_slice(b"\r\nConnection: close\r\n\r\n");
    socket.write_all(&request)?;

    let mut conn = Connection::empty();
    conn.flags.insert(Flags::IS_CLIENT);
    conn.phase = Phase::Read(ReadPhase::Begin);

    read_response_headers(&mut socket, &mut conn)?;

    if conn.phase.is_error() {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("server sent a malformed response (status {})", conn.error),
        ));
    }

    let body = read_body(&mut socket, &mut conn)?;
    Ok(FetchedResponse { status: conn.status, body })
}

/// Feeds response bytes into the shared parser one at a time until it reaches `READ_BODY` (or
/// `ERROR`), exactly mirroring how the multiplexer drives the server-side request parse.
fn read_response_headers(socket: &mut TcpStream, conn: &mut Connection) -> io::Result<()> {
    let mut byte = [0u8; 1];
    loop {
        match conn.phase {
            Phase::Read(ReadPhase::Body) | Phase::Read(ReadPhase::Done) | Phase::Error(_) => return Ok(()),
            _ => {}
        }
        match socket.read(&mut byte) {
            Ok(0) => return Err(io::Error::new(io::ErrorKind::UnexpectedEof, "server closed before headers ended")),
            Ok(_) => crate::parser::feed(conn, byte[0]),
            Err(e) => return Err(e),
        }
    }
}

/// Drains the response body via [`crate::body::getc`], honoring whichever framing
/// (`Content-Length` or chunked) the headers established — the same body reader the server side
/// uses for request bodies.
fn read_body(socket: &mut TcpStream, conn: &mut Connection) -> io::Result<Vec<u8>> {
    // `crate::body` reads through `conn.socket_mut()`, which expects a `mio::net::TcpStream`; the
    // fetcher instead owns a plain blocking `std::net::TcpStream`, so it drains the body directly
    // rather than routing through the shared body reader. The framing *decision* (how many bytes,
    // whether chunked) still comes from the shared parser via `conn.read_content_length` /
    // `Flags::READ_CHUNKED`; only the raw byte source differs.
    let mut body = Vec::new();
    if conn.flags.contains(Flags::READ_CHUNKED) {
        read_chunked_body(socket, &mut body)?;
    } else if let Some(len) = conn.read_content_length {
        let mut remaining = len;
        let mut byte = [0u8; 1];
        while remaining > 0 {
            match socket.read(&mut byte) {
                Ok(0) => break,
                Ok(_) => {
                    body.push(byte[0]);
                    remaining -= 1;
                }
                Err(e) => return Err(e),
            }
        }
    } else {
        socket.read_to_end(&mut body)?;
    }
    Ok(body)
}

fn read_chunked_body(socket: &mut TcpStream, out: &mut Vec<u8>) -> io::Result<()> {
    loop {
        let size = read_chunk_size_line(socket)?;
        if size == 0 {
            read_exact_discard(socket, 2)?; // trailing CRLF after the terminal zero chunk
            return Ok(());
        }
        let start = out.len();
        out.resize(start + size, 0);
        socket.read_exact(&mut out[start..])?;
        read_exact_discard(socket, 2)?; // CRLF after the chunk's data
    }
}

fn read_chunk_size_line(socket: &mut TcpStream) -> io::Result<usize> {
    let mut line = Vec::new();
    let mut byte = [0u8; 1];
    loop {
        socket.read_exact(&mut byte)?;
        if byte[0] == b'\n' {
            break;
        }
        if byte[0] != b'\r' {
            line.push(byte[0]);
        }
    }
    let hex_part = line.split(|&b| b == b';').next().unwrap_or(&[]);
    let mut value = 0usize;
    for &b in hex_part {
        if !b.is_ascii_hexdigit() {
            break;
        }
        value = (value << 4) | crate::util::hex_to_int(b) as usize;
    }
    Ok(value)
}

fn read_exact_discard(socket: &mut TcpStream, n: usize) -> io::Result<()> {
    let mut buf = vec![0u8; n];
    socket.read_exact(&mut buf)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write as _;
    use std::net::TcpListener;
    use std::thread;

    #[test]
    fn fetch_reads_status_and_body() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();

        let server = thread::spawn(move || {
            let (mut stream, _) = listener.accept().unwrap();
            let mut buf = [0u8; 1024];
            let _ = stream.read(&mut buf);
            stream
                .write_all(b"HTTP/1.1 200 OK\r\nContent-Length: 5\r\n\r\nhello")
                .unwrap();
        });

        let response = fetch("127.0.0.1", addr.port(), "/", Duration::from_secs(2)).unwrap();
        assert_eq!(response.status, 200);
        assert_eq!(response.body, b"hello");
        server.join().unwrap();
    }

    #[test]
    fn fetch_reads_chunked_body() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();

        let server = thread::spawn(move || {
            let (mut stream, _) = listener.accept().unwrap();
            let mut buf = [0u8; 1024];
            let _ = stream.read(&mut buf);
            stream
                .write_all(
                    b"HTTP/1.1 200 OK\r\nTransfer-Encoding: chunked\r\n\r\n\
                      4\r\n0123\r\n4\r\n4567\r\n0\r\n\r\n",
                )
                .unwrap();
        });

        let response = fetch("127.0.0.1", addr.port(), "/", Duration::from_secs(2)).unwrap();
        assert_eq!(response.status, 200);
        assert_eq!(response.body, b"01234567");
        server.join().unwrap();
    }
}
