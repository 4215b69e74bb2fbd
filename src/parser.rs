// Copyright (c) 2016 The Rouille developers
// Licensed under the Apache License, Version 2.0
// <LICENSE-APACHE or
// http://www.apache.org/licenses/LICENSE-2.0> or the MIT
// license <LICENSE-MIT or http://opensource.org/licenses/MIT>,
// at your option. All files in the project carrying such
// notice may not be copied, modified, or distributed except
// according to those terms.

//! The byte-at-a-time request/response line and header parser.
//!
//! One alphabet drives both the server reading a request and the client fetcher (`IS_CLIENT` set)
//! reading a response; `feed` is the single entry point called once per byte by the multiplexer.

use log::{trace, warn};

use crate::connection::{Connection, Method};
use crate::phase::{Flags, Phase, ReadPhase};

const SP: u8 = b' ';
const CR: u8 = b'\r';
const LF: u8 = b'\n';

/// Feeds one byte to the parser, advancing `conn.phase` in place.
///
/// Returns nothing: the resulting phase (including `Phase::Error`, `Phase::UpgradePending` or a
/// write/body phase) is read back from `conn.phase` by the caller.
pub fn feed(conn: &mut Connection, byte: u8) {
    if conn.flags.contains(Flags::EXPECT_NEWLINE) {
        conn.flags.remove(Flags::EXPECT_NEWLINE);
        if byte != LF {
            reject(conn, 400);
        }
        return;
    }

    let phase = match conn.phase {
        Phase::Read(p) => p,
        _ => return,
    };

    match phase {
        ReadPhase::Begin => {
            conn.scratch_clear();
            conn.phase = Phase::Read(if conn.flags.contains(Flags::IS_CLIENT) {
                ReadPhase::ClientVersion
            } else {
                ReadPhase::ServerMethod
            });
            feed(conn, byte);
        }
        ReadPhase::ServerMethod => read_method(conn, byte),
        ReadPhase::ServerPath => read_path(conn, byte),
        ReadPhase::ServerQuery => read_query(conn, byte),
        ReadPhase::ServerVersion => read_version(conn, byte, false),
        ReadPhase::ClientVersion => read_version(conn, byte, true),
        ReadPhase::ClientStatus => read_status(conn, byte),
        ReadPhase::ClientStatusDesc => read_status_desc(conn, byte),
        ReadPhase::Header => read_header(conn, byte),
        ReadPhase::Body | ReadPhase::Done => {
            // The multiplexer never feeds bytes to the parser once the body or done phase has
            // been reached; body bytes go through `crate::io` instead.
        }
    }
}

fn on_cr(conn: &mut Connection) {
    conn.flags.insert(Flags::EXPECT_NEWLINE);
}

fn reject(conn: &mut Connection, status: u16) {
    warn!("rejecting request with status {}", status);
    conn.error = status;
    conn.phase = Phase::Error(status);
}

fn read_method(conn: &mut Connection, byte: u8) {
    if byte == SP {
        // DELETE is recognized (vs. falling into the same "unknown verb" bucket) only in that
        // it gets its own log line upstream; the wire outcome is the same 405 either way.
        conn.method = match conn.scratch() {
            b"GET" => Method::Get,
            b"POST" => Method::Post,
            _ => {
                reject(conn, 405);
                return;
            }
        };
        conn.scratch_clear();
        conn.phase = Phase::Read(ReadPhase::ServerPath);
    } else {
        conn.scratch_push(byte);
    }
}

fn read_path(conn: &mut Connection, byte: u8) {
    match byte {
        SP => {
            conn.path.clear();
            conn.path.push_str(conn.scratch_str());
            conn.scratch_clear();
            conn.phase = Phase::Read(ReadPhase::ServerVersion);
        }
        b'?' => {
            conn.path.clear();
            conn.path.push_str(conn.scratch_str());
            conn.scratch_clear();
            conn.phase = Phase::Read(ReadPhase::ServerQuery);
        }
        _ => conn.scratch_push(byte),
    }
}

fn read_query(conn: &mut Connection, byte: u8) {
    if byte == SP {
        conn.query_raw.clear();
        conn.query_raw.push_str(conn.scratch_str());
        conn.scratch_clear();
        conn.phase = Phase::Read(ReadPhase::ServerVersion);
    } else {
        conn.scratch_push(byte);
    }
}

fn read_version(conn: &mut Connection, byte: u8, is_client: bool) {
    if byte == CR {
        let version_ok = match conn.scratch() {
            b"HTTP/1.1" => Some(true),
            b"HTTP/1.0" => Some(false),
            _ => None,
        };
        conn.scratch_clear();
        match version_ok {
            Some(true) => {
                conn.phase = Phase::Read(if is_client {
                    ReadPhase::ClientStatus
                } else {
                    ReadPhase::Header
                });
                on_cr(conn);
            }
            Some(false) => reject(conn, 505),
            None => reject(conn, 400),
        }
    } else {
        conn.scratch_push(byte);
    }
}

fn read_status(conn: &mut Connection, byte: u8) {
    if byte == SP {
        match std::str::from_utf8(conn.scratch())
            .ok()
            .and_then(|s| s.parse::<u16>().ok())
        {
            Some(code) => conn.status = code,
            None => warn!("client fetcher: non-numeric status line, continuing anyway"),
        }
        conn.scratch_clear();
        conn.phase = Phase::Read(ReadPhase::ClientStatusDesc);
    } else {
        conn.scratch_push(byte);
    }
}

fn read_status_desc(conn: &mut Connection, byte: u8) {
    if byte == CR {
        conn.scratch_clear();
        conn.phase = Phase::Read(ReadPhase::Header);
        on_cr(conn);
    } else {
        conn.scratch_push(byte);
    }
}

fn read_header(conn: &mut Connection, byte: u8) {
    if byte == CR {
        if conn.scratch().is_empty() {
            finish_headers(conn);
        } else {
            apply_header_line(conn);
            conn.scratch_clear();
        }
        on_cr(conn);
    } else {
        conn.scratch_push(byte);
    }
}

fn split_header_line(line: &str) -> Option<(&str, &str)> {
    let colon = line.find(':')?;
    let name = &line[..colon];
    let value = line[colon + 1..].trim_start_matches(' ');
    Some((name, value))
}

fn apply_header_line(conn: &mut Connection) {
    let line = conn.scratch_str().to_string();
    let (name, value) = match split_header_line(&line) {
        Some(nv) => nv,
        None => return,
    };

    if name.eq_ignore_ascii_case("Host") {
        conn.host.clear();
        conn.host.push_str(value);
    } else if name.eq_ignore_ascii_case("Accept-Encoding") {
        if value.to_ascii_lowercase().contains("gzip") {
            conn.flags.insert(Flags::ACCEPT_GZIP);
        }
    } else if name.eq_ignore_ascii_case("Transfer-Encoding") {
        if value.to_ascii_lowercase().contains("chunked") {
            conn.flags.insert(Flags::READ_CHUNKED);
        }
    } else if name.eq_ignore_ascii_case("Content-Length") {
        match value.trim().parse::<u64>() {
            Ok(n) => conn.read_content_length = Some(n),
            Err(_) => {
                reject(conn, 400);
            }
        }
    } else if name.eq_ignore_ascii_case("Upgrade") {
        if value.eq_ignore_ascii_case("websocket") {
            conn.flags.insert(Flags::WEBSOCKET_UPGRADE);
        }
    } else if name.eq_ignore_ascii_case("Connection") {
        if value.to_ascii_lowercase().contains("upgrade") {
            conn.flags.insert(Flags::CONNECTION_UPGRADE);
        }
    } else if name.eq_ignore_ascii_case("Sec-WebSocket-Key") {
        conn.websocket_key.clear();
        conn.websocket_key.push_str(value);
    } else if name.eq_ignore_ascii_case("If-None-Match") {
        conn.if_none_match.clear();
        conn.if_none_match.push_str(value);
    } else {
        trace!("ignoring header {}", name);
    }
}

fn finish_headers(conn: &mut Connection) {
    if conn.phase.is_error() {
        return;
    }

    // Both Content-Length and Transfer-Encoding: chunked present: chunked wins, per RFC 7230.
    if conn.flags.contains(Flags::READ_CHUNKED) {
        conn.read_content_length = None;
    }

    let upgrade_requested = conn.flags.contains(Flags::WEBSOCKET_UPGRADE)
        && conn.flags.contains(Flags::CONNECTION_UPGRADE);

    if upgrade_requested {
        conn.phase = Phase::UpgradePending;
    } else if conn.flags.contains(Flags::READ_CHUNKED) || conn.read_content_length.unwrap_or(0) > 0
    {
        conn.chunk_length = 0;
        conn.chunk_phase = crate::body::ChunkPhase::Header;
        conn.phase = Phase::Read(ReadPhase::Body);
    } else if conn.flags.contains(Flags::IS_CLIENT) {
        // No framing header at all: the client fetcher reads the body until the server closes
        // the connection, same as an HTTP/1.0 response. `Read(Body)` with no content-length and
        // `READ_CHUNKED` unset is exactly how `read_body` in `crate::client` recognizes that case.
        conn.phase = Phase::Read(ReadPhase::Body);
    } else {
        conn.phase = crate::phase::Phase::Write(crate::phase::WritePhase::Begin);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn feed_str(conn: &mut Connection, s: &str) {
        for b in s.bytes() {
            feed(conn, b);
        }
    }

    #[test]
    fn simple_get_reaches_dispatch() {
        let mut conn = Connection::empty();
        conn.phase = Phase::Read(ReadPhase::ServerMethod);
        feed_str(&mut conn, "GET /simple HTTP/1.1\r\nHost: x\r\n\r\n");
        assert_eq!(conn.path, "/simple");
        assert_eq!(conn.method, Method::Get);
        assert_eq!(
            conn.phase,
            Phase::Write(crate::phase::WritePhase::Begin)
        );
    }

    #[test]
    fn query_string_is_captured_raw() {
        let mut conn = Connection::empty();
        conn.phase = Phase::Read(ReadPhase::ServerMethod);
        feed_str(&mut conn, "GET /query?a=1&b=2%203 HTTP/1.1\r\nHost: x\r\n\r\n");
        assert_eq!(conn.path, "/query");
        assert_eq!(conn.query_raw, "a=1&b=2%203");
    }

    #[test]
    fn delete_is_rejected_with_405() {
        let mut conn = Connection::empty();
        conn.phase = Phase::Read(ReadPhase::ServerMethod);
        feed_str(&mut conn, "DELETE / HTTP/1.1\r\n");
        assert_eq!(conn.phase, Phase::Error(405));
    }

    #[test]
    fn http_1_0_is_rejected_with_505() {
        let mut conn = Connection::empty();
        conn.phase = Phase::Read(ReadPhase::ServerMethod);
        feed_str(&mut conn, "GET / HTTP/1.0\r\n");
        assert_eq!(conn.phase, Phase::Error(505));
    }

    #[test]
    fn malformed_version_is_rejected_with_400() {
        let mut conn = Connection::empty();
        conn.phase = Phase::Read(ReadPhase::ServerMethod);
        feed_str(&mut conn, "GET / BOGUS\r\n");
        assert_eq!(conn.phase, Phase::Error(400));
    }

    #[test]
    fn content_length_routes_to_body_phase() {
        let mut conn = Connection::empty();
        conn.phase = Phase::Read(ReadPhase::ServerMethod);
        feed_str(&mut conn, "POST / HTTP/1.1\r\nContent-Length: 5\r\n\r\n");
        assert_eq!(conn.phase, Phase::Read(ReadPhase::Body));
        assert_eq!(conn.read_content_length, Some(5));
    }

    #[test]
    fn chunked_wins_over_content_length_when_both_present() {
        let mut conn = Connection::empty();
        conn.phase = Phase::Read(ReadPhase::ServerMethod);
        feed_str(
            &mut conn,
            "POST / HTTP/1.1\r\nContent-Length: 5\r\nTransfer-Encoding: chunked\r\n\r\n",
        );
        assert!(conn.flags.contains(Flags::READ_CHUNKED));
        assert_eq!(conn.read_content_length, None);
        assert_eq!(conn.phase, Phase::Read(ReadPhase::Body));
    }

    #[test]
    fn websocket_upgrade_requires_both_headers() {
        let mut conn = Connection::empty();
        conn.phase = Phase::Read(ReadPhase::ServerMethod);
        feed_str(
            &mut conn,
            "GET /ws HTTP/1.1\r\nUpgrade: websocket\r\nConnection: Upgrade\r\nSec-WebSocket-Key: dGhlIHNhbXBsZSBub25jZQ==\r\n\r\n",
        );
        assert_eq!(conn.phase, Phase::UpgradePending);
        assert_eq!(conn.websocket_key, "dGhlIHNhbXBsZSBub25jZQ==");
    }

    #[test]
    fn header_names_match_case_insensitively() {
        let mut conn = Connection::empty();
        conn.phase = Phase::Read(ReadPhase::ServerMethod);
        feed_str(&mut conn, "GET / HTTP/1.1\r\nhOsT: example\r\n\r\n");
        assert_eq!(conn.host, "example");
    }

    #[test]
    fn overlong_header_line_truncates_but_stays_synchronized() {
        let mut conn = Connection::empty();
        conn.phase = Phase::Read(ReadPhase::ServerMethod);
        let long_value = "x".repeat(500);
        feed_str(&mut conn, "GET / HTTP/1.1\r\n");
        feed_str(&mut conn, &format!("Host: {}\r\n", long_value));
        feed_str(&mut conn, "\r\n");
        assert_eq!(
            conn.phase,
            Phase::Write(crate::phase::WritePhase::Begin)
        );
    }
}
