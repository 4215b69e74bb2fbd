// Copyright (c) 2016 The Rouille developers
// Licensed under the Apache License, Version 2.0
// <LICENSE-APACHE or
// http://www.apache.org/licenses/LICENSE-2.0> or the MIT
// license <LICENSE-MIT or http://opensource.org/licenses/MIT>,
// at your option. All files in the project carrying such
// notice may not be copied, modified, or distributed except
// according to those terms.

//! The streaming handler contract shared by the filesystem handler, the CGI-like handler and any
//! user-supplied route target.
//!
//! There is no stack to suspend a handler onto: a handler that cannot finish in one tick stores
//! whatever continuation it needs in the connection's `handler_state` slot and returns `More`, to
//! be polled again on a later tick. This is the Rust shape of the source's `cgi.rs` "dispatch
//! table of poll functions" pattern.

use std::any::Any;

use crate::connection::Connection;
use crate::websocket::WsConnection;

/// Result of polling a handler once.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Outcome {
    /// The response is complete; the connection can move to `READ_DONE`.
    Done,
    /// Progress was made but the handler needs another tick to finish.
    More,
    /// This handler declines the request; the router should try the next route.
    NotFound,
}

/// A streaming HTTP handler bound to a route.
///
/// Implementors that need to survive across `More` returns stash their continuation in
/// `conn.handler_state` (see [`Connection::handler_state`]) rather than in local state, since the
/// handler itself is a stateless trait object reused across every connection bound to it.
pub trait HttpHandler {
    fn poll(&self, conn: &mut Connection) -> Outcome;
}

/// A WebSocket handler bound to a route.
pub trait WebSocketHandler {
    /// Called once, synchronously, right after the handshake response is written. Returning
    /// `false` rejects the upgrade (the socket is closed without a close frame).
    fn on_open(&self, conn: &mut WsConnection, request_path: &str) -> bool {
        let _ = (conn, request_path);
        true
    }

    /// Called once the frame header has been decoded for a TEXT or BINARY frame, and again on
    /// every later tick while `conn.frame_index < conn.frame_length`. The handler reads masked
    /// bytes itself via [`crate::websocket::read_payload`]; a short read just means it will be
    /// called again once more of the frame has arrived.
    fn on_message(&self, conn: &mut WsConnection);

    fn on_close(&self, conn: &mut WsConnection) {
        let _ = conn;
    }

    /// Called once per multiplexer tick for every open session bound to this handler, whether or
    /// not a frame arrived this tick. This is the generalized form of the source's periodic
    /// WebSocket push (a 10-second POSIX timer whose signal handler reached through a single
    /// saved global connection pointer to broadcast the time): the multiplexer itself calls this
    /// on every tick rather than a signal handler calling it from outside the event loop, so
    /// `conn` can be touched with no synchronization concerns. `tick` is the multiplexer's
    /// monotonic counter; a handler wanting a slower cadence than "every tick" checks it itself
    /// (e.g. `tick % 20 == 0` for roughly ten seconds at the default 500ms tick timeout).
    fn on_broadcast(&self, conn: &mut WsConnection, tick: u64) {
        let _ = (conn, tick);
    }
}

/// Per-handler continuation state, boxed so unrelated handlers can store unrelated shapes of
/// state in the same connection slot field.
pub type HandlerState = Box<dyn Any + Send>;
