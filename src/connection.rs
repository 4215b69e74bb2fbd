// Copyright (c) 2016 The Rouille developers
// Licensed under the Apache License, Version 2.0
// <LICENSE-APACHE or
// http://www.apache.org/licenses/LICENSE-2.0> or the MIT
// license <LICENSE-MIT or http://opensource.org/licenses/MIT>,
// at your option. All files in the project carrying such
// notice may not be copied, modified, or distributed except
// according to those terms.

//! The per-slot HTTP connection record.
//!
//! One `Connection` is allocated per pool slot at server start and reused forever: every owned
//! `String` is cleared, not dropped, when a slot closes, so serving ten thousand requests never
//! allocates more than the first handful did.

use arrayvec::ArrayVec;
use mio::net::TcpStream;

use crate::body::ChunkPhase;
use crate::handler::{HandlerState, HttpHandler};
use crate::phase::{Flags, Phase, ReadPhase};
use crate::query::QueryDecoder;

/// Maximum scratch line length; lines longer than this are truncated but the parser stays
/// synchronized on the terminating `\r`.
pub const SCRATCH_CAPACITY: usize = 64;

/// One slot in the HTTP connection pool.
pub struct Connection {
    pub(crate) socket: Option<TcpStream>,
    pub phase: Phase,
    pub flags: Flags,

    /// Line accumulator, logically meaningful only while `phase.is_header_phase()`.
    scratch: ArrayVec<[u8; SCRATCH_CAPACITY]>,

    pub read_content_length: Option<u64>,
    pub write_content_length: Option<u64>,
    /// Bytes remaining in the current chunk; `0` means "read the next chunk header".
    pub chunk_length: u64,
    /// Sub-state of the chunked body reader; meaningless unless `flags.READ_CHUNKED` is set.
    pub(crate) chunk_phase: ChunkPhase,

    /// Single-byte pushback used by the body reader's `peek`.
    pub(crate) peek_byte: Option<u8>,

    pub method: Method,
    pub status: u16,
    /// Set alongside `Phase::Error(status)`; kept as a plain field too so a response can quote it
    /// after the phase has been consumed.
    pub error: u16,

    pub path: String,
    pub query_raw: String,
    pub host: String,
    pub websocket_key: String,
    /// `If-None-Match` request header, consulted by the filesystem handler's ETag check.
    pub if_none_match: String,

    query_decoder: QueryDecoder,

    handler: Option<&'static dyn HttpHandler>,
    pub handler_state: Option<HandlerState>,

    /// Index in the router's table to resume scanning from after an `Outcome::NotFound`; reset to
    /// 0 on every `accept`.
    pub(crate) route_scan_index: usize,

    /// Monotonic tick counter stamped on the last byte of activity; the multiplexer compares this
    /// against the current tick to enforce the idle timeout.
    pub(crate) last_active_tick: u64,
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Method {
    Get,
    Post,
    Unsupported,
}

impl Connection {
    pub fn empty() -> Connection {
        Connection {
            socket: None,
            phase: Phase::Read(ReadPhase::Begin),
            flags: Flags::empty(),
            scratch: ArrayVec::new(),
            read_content_length: None,
            write_content_length: None,
            chunk_length: 0,
            chunk_phase: ChunkPhase::Header,
            peek_byte: None,
            method: Method::Unsupported,
            status: 0,
            error: 0,
            path: String::new(),
            query_raw: String::new(),
            host: String::new(),
            websocket_key: String::new(),
            if_none_match: String::new(),
            query_decoder: QueryDecoder::new(),
            handler: None,
            handler_state: None,
            route_scan_index: 0,
            last_active_tick: 0,
        }
    }

    pub fn is_free(&self) -> bool {
        self.socket.is_none()
    }

    /// Binds a fresh socket into this slot, resetting every field to its just-allocated state.
    pub fn accept(&mut self, socket: TcpStream, tick: u64) {
        self.socket = Some(socket);
        self.phase = Phase::Read(ReadPhase::ServerMethod);
        self.flags = Flags::empty();
        self.scratch.clear();
        self.read_content_length = None;
        self.write_content_length = None;
        self.chunk_length = 0;
        self.chunk_phase = ChunkPhase::Header;
        self.peek_byte = None;
        self.method = Method::Unsupported;
        self.status = 0;
        self.error = 0;
        self.path.clear();
        self.query_raw.clear();
        self.host.clear();
        self.websocket_key.clear();
        self.if_none_match.clear();
        self.query_decoder.reset();
        self.handler = None;
        self.handler_state = None;
        self.route_scan_index = 0;
        self.last_active_tick = tick;
    }

    /// Releases the slot, clearing owned strings without dropping their heap allocations.
    pub fn close(&mut self) {
        self.socket = None;
        self.phase = Phase::Read(ReadPhase::Begin);
        self.path.clear();
        self.query_raw.clear();
        self.host.clear();
        self.websocket_key.clear();
        self.if_none_match.clear();
        self.handler = None;
        self.handler_state = None;
        self.route_scan_index = 0;
    }

    /// Moves the socket out of the slot without touching anything else, for the WebSocket upgrade
    /// migration: the slot is about to be freed via `close`, but the socket itself lives on in the
    /// WebSocket pool.
    pub(crate) fn take_socket(&mut self) -> Option<TcpStream> {
        self.socket.take()
    }

    pub fn scratch(&self) -> &[u8] {
        &self.scratch
    }

    pub fn scratch_clear(&mut self) {
        self.scratch.clear();
    }

    /// Appends a byte to the scratch buffer, silently truncating (but still returning `Ok`) once
    /// capacity is exhausted: the parser must stay synchronized on the line terminator even though
    /// the tail of an over-long header is dropped.
    pub fn scratch_push(&mut self, byte: u8) {
        let _ = self.scratch.try_push(byte);
    }

    pub fn scratch_str(&self) -> &str {
        std::str::from_utf8(&self.scratch).unwrap_or("")
    }

    pub fn handler(&self) -> Option<&'static dyn HttpHandler> {
        self.handler
    }

    pub fn bind_handler(&mut self, handler: &'static dyn HttpHandler) {
        self.handler = Some(handler);
        self.handler_state = None;
    }

    pub fn unbind_handler(&mut self) {
        self.handler = None;
        self.handler_state = None;
    }

    /// Looks up a query parameter, decoding `query_raw` in place on first access.
    pub fn get_query_arg(&mut self, name: &str) -> Option<&str> {
        self.query_decoder.get(&mut self.query_raw, name)
    }

    pub fn socket_mut(&mut self) -> Option<&mut TcpStream> {
        self.socket.as_mut()
    }

    pub fn socket(&self) -> Option<&TcpStream> {
        self.socket.as_ref()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_slot_is_free() {
        let conn = Connection::empty();
        assert!(conn.is_free());
    }

    #[test]
    fn close_clears_owned_strings_but_not_their_allocation() {
        let mut conn = Connection::empty();
        conn.path.push_str("/some/long/path/that/allocated");
        let cap_before = conn.path.capacity();
        conn.close();
        assert!(conn.path.is_empty());
        assert_eq!(conn.path.capacity(), cap_before);
    }

    #[test]
    fn scratch_truncates_without_losing_sync() {
        let mut conn = Connection::empty();
        for _ in 0..(SCRATCH_CAPACITY + 10) {
            conn.scratch_push(b'a');
        }
        assert_eq!(conn.scratch().len(), SCRATCH_CAPACITY);
    }
}
