// Copyright (c) 2016 The Rouille developers
// Licensed under the Apache License, Version 2.0
// <LICENSE-APACHE or
// http://www.apache.org/licenses/LICENSE-2.0> or the MIT
// license <LICENSE-MIT or http://opensource.org/licenses/MIT>,
// at your option. All files in the project carrying such
// notice may not be copied, modified, or distributed except
// according to those terms.

//! End-to-end regression coverage for request-body framing: drives a real `Server` over a real
//! `TcpStream`, request line and headers included, rather than constructing a `Connection` already
//! past the header phase. A handler that builds its `Connection` by hand (as the unit tests in
//! `body.rs` and `mux.rs` do) cannot see a bug in the handoff *between* header parsing and body
//! reading; only a test that goes through both, in order, like a real client would, can.
//!
//! The client writes its whole request and closes its write half before the server ever ticks, so
//! the two sides can run on a single thread: the kernel holds the written bytes (and later the
//! response bytes) in each socket's buffer regardless of which side is actively polling.

use std::io::{Read, Write};
use std::net::{Shutdown, TcpStream};
use std::sync::Mutex;
use std::time::Duration;

use microhttp::{begin_response, end_body, end_header, set_content_length, write_body};
use microhttp::{Connection, HttpHandler, Outcome, Router, Server, ServerConfig, WsRouter};

/// Reads exactly `expected_len` raw bytes off the connection's socket, across as many polls as it
/// takes, then echoes them back as the response body. Deliberately bypasses this crate's own
/// `Content-Length`/chunked body decoder: the point of this test is whether the multiplexer hands
/// the handler the body's true first byte, not whether the decoder can parse one.
struct EchoRawBody {
    expected_len: usize,
    collected: Mutex<Vec<u8>>,
}

impl EchoRawBody {
    fn new(expected_len: usize) -> EchoRawBody {
        EchoRawBody {
            expected_len,
            collected: Mutex::new(Vec::new()),
        }
    }
}

impl HttpHandler for EchoRawBody {
    fn poll(&self, conn: &mut Connection) -> Outcome {
        let mut collected = self.collected.lock().unwrap();
        while collected.len() < self.expected_len {
            let socket = match conn.socket_mut() {
                Some(socket) => socket,
                None => return Outcome::Done,
            };
            let mut byte = [0u8; 1];
            match socket.read(&mut byte) {
                Ok(1) => collected.push(byte[0]),
                Ok(0) => break,
                Err(ref e) if e.kind() == std::io::ErrorKind::WouldBlock => return Outcome::More,
                Err(_) => return Outcome::Done,
            }
        }

        let _ = begin_response(conn, 200, Some("application/octet-stream"));
        let _ = set_content_length(conn, collected.len() as u64);
        let _ = end_header(conn);
        let _ = write_body(conn, &collected);
        let _ = end_body(conn);
        Outcome::Done
    }
}

/// Builds a one-route server bound to an ephemeral port. Kept on the calling thread: `HttpHandler`
/// carries no `Send`/`Sync` bound (a route handler has no business crossing threads, any more than
/// the source's single-threaded `select()` loop did), so the `Router` inside `Server` cannot move
/// to a background thread either.
fn build_server(handler: &'static EchoRawBody) -> (Server, std::net::SocketAddr) {
    let mut router = Router::new();
    router.add("/*", handler);

    let config = ServerConfig {
        http_pool_size: 2,
        websocket_pool_size: 1,
        tick_timeout: Duration::from_millis(20),
    };
    let server = Server::new("127.0.0.1:0", router, WsRouter::new(), config).unwrap();
    let addr = server.local_addr().unwrap();
    (server, addr)
}

/// Ticks the server enough times to read a whole small request byte-by-byte, run the handler and
/// write back a whole small response: generous, since each tick normally advances the state
/// machine by exactly one byte, but still bounded so a real regression fails the test instead of
/// hanging it.
fn drive(server: &mut Server, ticks: usize) {
    for _ in 0..ticks {
        server.poll().unwrap();
    }
}

/// Splits a full HTTP response into its header block and body, the way a test client that already
/// knows what it is looking for is allowed to.
fn split_response(raw: &[u8]) -> (&[u8], &[u8]) {
    let marker = b"\r\n\r\n";
    let pos = raw
        .windows(marker.len())
        .position(|w| w == marker)
        .expect("response had no header terminator");
    (&raw[..pos], &raw[pos + marker.len()..])
}

#[test]
fn content_length_body_reaches_handler_byte_for_byte() {
    let handler: &'static EchoRawBody = Box::leak(Box::new(EchoRawBody::new(5)));
    let (mut server, addr) = build_server(handler);

    let mut client = TcpStream::connect(addr).unwrap();
    client.set_read_timeout(Some(Duration::from_secs(2))).unwrap();
    client
        .write_all(b"POST / HTTP/1.1\r\nHost: x\r\nContent-Length: 5\r\n\r\nhello")
        .unwrap();
    client.shutdown(Shutdown::Write).unwrap();

    drive(&mut server, 300);

    let mut raw = Vec::new();
    client.read_to_end(&mut raw).unwrap();

    let (headers, body) = split_response(&raw);
    assert!(headers.starts_with(b"HTTP/1.1 200"));
    assert_eq!(body, b"hello");
}

#[test]
fn chunked_body_reaches_handler_byte_for_byte() {
    // The literal wire bytes of a two-chunk body; the handler above reads this many raw bytes
    // straight off the socket without decoding the chunk framing, so the assertion below is
    // really checking that none of these bytes were consumed as part of the request headers.
    let wire: &[u8] = b"4\r\n0123\r\n4\r\n4567\r\n0\r\n\r\n";
    let handler: &'static EchoRawBody = Box::leak(Box::new(EchoRawBody::new(wire.len())));
    let (mut server, addr) = build_server(handler);

    let mut client = TcpStream::connect(addr).unwrap();
    client.set_read_timeout(Some(Duration::from_secs(2))).unwrap();
    let mut request = Vec::new();
    request.extend_from_slice(b"POST / HTTP/1.1\r\nHost: x\r\nTransfer-Encoding: chunked\r\n\r\n");
    request.extend_from_slice(wire);
    client.write_all(&request).unwrap();
    client.shutdown(Shutdown::Write).unwrap();

    drive(&mut server, 300);

    let mut raw = Vec::new();
    client.read_to_end(&mut raw).unwrap();

    let (headers, body) = split_response(&raw);
    assert!(headers.starts_with(b"HTTP/1.1 200"));
    assert_eq!(body, wire);
}
