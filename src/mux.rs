// Copyright (c) 2016 The Rouille developers
// Licensed under the Apache License, Version 2.0
// <LICENSE-APACHE or
// http://www.apache.org/licenses/LICENSE-2.0> or the MIT
// license <LICENSE-MIT or http://opensource.org/licenses/MIT>,
// at your option. All files in the project carrying such
// notice may not be copied, modified, or distributed except
// according to those terms.

//! The single-threaded event loop: one `mio::Poll`, two fixed-size connection pools, one tick at
//! a time.
//!
//! This is the Rust shape of the source's `select()`-based `http_server_main_loop`: no threads,
//! no async runtime, just a readiness poll and a byte-at-a-time state machine per slot. Unlike the
//! source, which rebuilds its `fd_set`s from scratch every iteration, each connection socket is
//! registered once (level-triggered, both directions) at accept/adopt time and deregistered once
//! at close time; only the listener's registration is toggled, edge-triggered, based on whether a
//! free HTTP slot currently exists, so an exhausted pool does not spin the loop re-delivering the
//! same "listener readable" event every tick.
//!
//! A tick that returns no events at all means the whole timeout elapsed with nothing happening on
//! any registered socket. The source treats this the same way a stuck connection holding a slot
//! forever would be treated: since there is no per-connection read/write timeout tracked
//! independently of the shared `select()` timeout, a quiet tick closes every open connection. This
//! is deliberately aggressive (documented as a design choice, not an accident) and keeps a single
//! slow or abandoned peer from starving the rest of the pool.

use std::io::{self, Read};
use std::net::SocketAddr;

use log::{debug, trace, warn};
use mio::net::TcpListener;
use mio::{Events, Poll, PollOpt, Ready, Token};

use crate::config::ServerConfig;
use crate::connection::Connection;
use crate::error::{Error, Result};
use crate::handler::Outcome;
use crate::phase::{Flags, Phase, ReadPhase, WritePhase};
use crate::response;
use crate::router::{Router, NOT_FOUND};
use crate::websocket::{self, Dispatch, WsConnection, WsRouter};

const TOKEN_LISTENER: Token = Token(usize::MAX);

/// The event loop itself: owns the listener, the poll handle, both connection pools and the two
/// route tables. Constructed once at startup and driven by repeated calls to `tick`.
pub struct Multiplexer {
    listener: TcpListener,
    listener_registered: bool,
    poll: Poll,

    http: Vec<Connection>,
    ws: Vec<WsConnection>,

    router: Router,
    ws_router: WsRouter,

    config: ServerConfig,
    tick: u64,
}

impl Multiplexer {
    /// Binds `addr` and allocates both connection pools up front, per `config`'s pool sizes.
    pub fn bind(
        addr: SocketAddr,
        router: Router,
        ws_router: WsRouter,
        config: ServerConfig,
    ) -> Result<Multiplexer> {
        let listener = TcpListener::bind(&addr).map_err(Error::Listen)?;
        let poll = Poll::new()?;

        let http = (0..config.http_pool_size).map(|_| Connection::empty()).collect();
        let ws = (0..config.websocket_pool_size).map(|_| WsConnection::empty()).collect();

        let mut mux = Multiplexer {
            listener,
            listener_registered: false,
            poll,
            http,
            ws,
            router,
            ws_router,
            config,
            tick: 0,
        };
        mux.update_listener_registration()?;
        Ok(mux)
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Runs forever, one `tick` at a time. Returns only if a tick returns a fatal error (a poll
    /// failure; per-connection I/O errors are handled and logged inside `tick` itself).
    pub fn run(&mut self) -> Result<()> {
        loop {
            self.tick()?;
        }
    }

    /// Services one round of readiness: accepts new connections, advances every ready HTTP and
    /// WebSocket slot by as much as is available without blocking, and closes everything if the
    /// whole tick timed out with nothing ready.
    pub fn tick(&mut self) -> Result<()> {
        self.update_listener_registration()?;

        let mut events = Events::with_capacity(self.http.len() + self.ws.len() + 1);
        self.poll.poll(&mut events, Some(self.config.tick_timeout))?;
        self.tick += 1;
        self.run_broadcast_tick();

        if events.is_empty() {
            self.handle_idle_timeout();
            return Ok(());
        }

        let ws_base = self.http.len();
        for event in &events {
            let token = event.token();
            if token == TOKEN_LISTENER {
                if event.readiness().is_readable() {
                    self.accept_loop();
                }
                continue;
            }
            let index = token.0;
            if index < ws_base {
                self.service_http(index, event.readiness());
            } else {
                self.service_ws(index - ws_base, event.readiness());
            }
        }
        Ok(())
    }

    fn token_for_http(index: usize) -> Token {
        Token(index)
    }

    fn token_for_ws(&self, index: usize) -> Token {
        Token(self.http.len() + index)
    }

    fn update_listener_registration(&mut self) -> Result<()> {
        let free = self.http.iter().any(Connection::is_free);
        if free && !self.listener_registered {
            self.poll
                .register(&self.listener, TOKEN_LISTENER, Ready::readable(), PollOpt::edge())?;
            self.listener_registered = true;
            trace!("listener registered, free http slot available");
        } else if !free && self.listener_registered {
            self.poll.deregister(&self.listener)?;
            self.listener_registered = false;
            trace!("listener deregistered, pool full");
        }
        Ok(())
    }

    /// Accepts until the listener would block or the pool fills up, since the listener is
    /// edge-triggered: a second connection arriving in the same instant as the first would not
    /// fire its own event if we stopped at one `accept`.
    fn accept_loop(&mut self) {
        loop {
            match self.listener.accept() {
                Ok((stream, addr)) => {
                    trace!("accepted connection from {}", addr);
                    match self.http.iter().position(Connection::is_free) {
                        Some(index) => {
                            let _ = stream.set_nodelay(true);
                            self.http[index].accept(stream, self.tick);
                            if let Some(socket) = self.http[index].socket() {
                                if let Err(e) = self.poll.register(
                                    socket,
                                    Self::token_for_http(index),
                                    Ready::readable() | Ready::writable(),
                                    PollOpt::level(),
                                ) {
                                    warn!("failed to register accepted connection: {}", e);
                                    self.http[index].close();
                                }
                            }
                        }
                        None => {
                            debug!("http pool exhausted, leaving connection in the backlog");
                            drop(stream);
                            break;
                        }
                    }
                }
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) => {
                    warn!("accept failed: {}", e);
                    break;
                }
            }
        }
    }

    fn service_http(&mut self, index: usize, readiness: Ready) {
        if self.http[index].is_free() {
            return;
        }
        self.http[index].last_active_tick = self.tick;

        let owes_newline = self.http[index].flags.contains(Flags::EXPECT_NEWLINE);
        if readiness.is_readable() && (self.http[index].phase.wants_read() || owes_newline) {
            // `finish_headers` picks the post-header phase (Body, Write(Begin), UpgradePending,
            // ...) on the blank line's `\r`, one byte before that line's own `\n` has been read
            // off the socket; `Flags::EXPECT_NEWLINE` is what still owes that byte to the parser.
            // Route it there first regardless of the phase finish_headers already moved to, or
            // the blank line's terminator ends up consumed as the body's first byte (or, for an
            // upgrade, as the first byte of the first WebSocket frame header) instead. Note that
            // `UpgradePending` is not itself a `Read` phase, so `owes_newline` has to stand in for
            // `wants_read()` in the outer guard too, or a connection parked in `UpgradePending`
            // with the LF still unread would never be serviced again.
            if owes_newline {
                self.feed_one_byte(index);
            } else {
                match self.http[index].phase {
                    Phase::Read(ReadPhase::Body) => self.call_handler(index),
                    Phase::Read(ReadPhase::Done) => self.drain_after_response(index),
                    _ => self.feed_one_byte(index),
                }
            }
        }

        // A write phase means the handler itself is mid-response; only the handler drives
        // `conn.socket` while in `Phase::Write`, so writable readiness just means "try again".
        if readiness.is_writable() && self.http[index].phase.wants_write() {
            self.call_handler(index);
        }
    }

    fn feed_one_byte(&mut self, index: usize) {
        let mut byte = [0u8; 1];
        let read = match self.http[index].socket_mut() {
            Some(socket) => socket.read(&mut byte),
            None => return,
        };
        match read {
            Ok(0) => {
                trace!("connection {} closed mid-request", index);
                self.close_http(index);
                return;
            }
            Ok(_) => {}
            Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => return,
            Err(e) => {
                debug!("read error on connection {}: {}", index, e);
                self.close_http(index);
                return;
            }
        }

        crate::parser::feed(&mut self.http[index], byte[0]);

        // The byte just fed might have been the blank line's `\r`, which makes `finish_headers`
        // pick the post-header phase in the same step `on_cr` sets `Flags::EXPECT_NEWLINE` — the
        // line's own `\n` is still unread. Acting on the new phase now would be premature: most
        // visibly, `upgrade_to_websocket` would migrate the raw socket into the WebSocket pool
        // with that `\n` still sitting unread, and it would be misread as the first byte of the
        // first frame header. Wait for the next byte (the LF itself, consumed generically by the
        // `EXPECT_NEWLINE` branch at the top of `parser::feed`) to clear the flag before reacting.
        if self.http[index].flags.contains(Flags::EXPECT_NEWLINE) {
            return;
        }

        match self.http[index].phase {
            Phase::UpgradePending => self.upgrade_to_websocket(index),
            Phase::Error(status) => self.write_error_and_close(index, status),
            Phase::Write(WritePhase::Begin) => self.call_handler(index),
            _ => {}
        }
    }

    /// Drains the mandatory EOF after a response has been fully written: this server never keeps
    /// a connection alive for a second request, so anything other than a clean close here is
    /// logged and the connection is dropped anyway.
    fn drain_after_response(&mut self, index: usize) {
        let mut byte = [0u8; 1];
        let read = match self.http[index].socket_mut() {
            Some(socket) => socket.read(&mut byte),
            None => return,
        };
        match read {
            Ok(0) => self.close_http(index),
            Ok(_) => {
                warn!("connection {} sent trailing bytes after its response", index);
                self.close_http(index);
            }
            Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => {}
            Err(_) => self.close_http(index),
        }
    }

    /// Drives the route table against a connection that has a full request ready: finds (or
    /// resumes) a handler, polls it once, and loops past `Outcome::NotFound` to try the next
    /// matching route without waiting for another tick.
    fn call_handler(&mut self, index: usize) {
        loop {
            if self.http[index].handler().is_none() {
                let path = self.http[index].path.clone();
                let start = self.http[index].route_scan_index;
                match self.router.find_from(&path, start) {
                    Some((found, handler)) => {
                        self.http[index].route_scan_index = found + 1;
                        self.http[index].bind_handler(handler);
                    }
                    None => {
                        self.http[index].route_scan_index = usize::MAX;
                        self.http[index].bind_handler(&NOT_FOUND);
                    }
                }
            }
            let handler = self.http[index].handler().expect("just bound above");

            match handler.poll(&mut self.http[index]) {
                Outcome::Done => break,
                Outcome::More => break,
                Outcome::NotFound => {
                    self.http[index].unbind_handler();
                    continue;
                }
            }
        }
    }

    fn upgrade_to_websocket(&mut self, index: usize) {
        let path = self.http[index].path.clone();
        let key = self.http[index].websocket_key.clone();

        let handler = self.ws_router.find(&path);
        let slot = self.ws.iter().position(WsConnection::is_free);

        match (handler, slot) {
            (Some(handler), Some(ws_index)) => {
                let socket = match self.http[index].take_socket() {
                    Some(socket) => socket,
                    None => {
                        self.close_http(index);
                        return;
                    }
                };
                let _ = self.poll.deregister(&socket);
                self.close_http(index);

                self.ws[ws_index].adopt(socket, handler, self.tick);
                let accepted = handler.on_open(&mut self.ws[ws_index], &path);
                if !accepted {
                    debug!("websocket handler rejected the upgrade for {}", path);
                    self.ws[ws_index].close();
                    return;
                }

                let wrote = match self.ws[ws_index].socket_mut() {
                    Some(socket) => websocket::write_handshake_response(socket, &key).is_ok(),
                    None => false,
                };
                if !wrote {
                    self.ws[ws_index].close();
                    return;
                }

                if let Some(socket) = self.ws[ws_index].socket() {
                    if let Err(e) = self.poll.register(
                        socket,
                        self.token_for_ws(ws_index),
                        Ready::readable() | Ready::writable(),
                        PollOpt::level(),
                    ) {
                        warn!("failed to register upgraded websocket: {}", e);
                        self.ws[ws_index].close();
                    }
                }
            }
            (_, None) => {
                warn!("websocket pool exhausted for upgrade request to {}", path);
                self.write_error_and_close(index, 500);
            }
            (None, _) => {
                debug!("no websocket route matches {}", path);
                self.write_error_and_close(index, 404);
            }
        }
    }

    fn write_error_and_close(&mut self, index: usize, status: u16) {
        self.http[index].phase = Phase::Write(WritePhase::Begin);
        let body = response::reason_phrase(status).as_bytes().to_vec();
        let conn = &mut self.http[index];
        let _ = response::begin_response(conn, status, Some("text/plain"));
        let _ = response::set_content_length(conn, body.len() as u64);
        let _ = response::end_header(conn);
        let _ = response::write_body(conn, &body);
        let _ = response::end_body(conn);
        self.close_http(index);
    }

    fn close_http(&mut self, index: usize) {
        if let Some(socket) = self.http[index].socket() {
            let _ = self.poll.deregister(socket);
        }
        self.http[index].close();
    }

    fn service_ws(&mut self, index: usize, readiness: Ready) {
        if self.ws[index].is_free() || !readiness.is_readable() {
            return;
        }
        self.ws[index].last_active_tick = self.tick;

        match websocket::poll_frame(&mut self.ws[index]) {
            Ok(Dispatch::Pending) => {}
            Ok(Dispatch::Message) => {
                if let Some(handler) = self.ws[index].handler() {
                    handler.on_message(&mut self.ws[index]);
                }
                if websocket::message_complete(&self.ws[index]) {
                    websocket::reset_after_message(&mut self.ws[index]);
                }
            }
            Ok(Dispatch::Ignored) | Ok(Dispatch::Ponged) => {}
            Ok(Dispatch::Closed) => {
                if let Some(handler) = self.ws[index].handler() {
                    handler.on_close(&mut self.ws[index]);
                }
                self.close_ws(index);
            }
            Err(e) => {
                debug!("websocket slot {} io error: {}", index, e);
                if let Some(handler) = self.ws[index].handler() {
                    handler.on_close(&mut self.ws[index]);
                }
                self.close_ws(index);
            }
        }
    }

    /// Gives every open WebSocket session a chance to push unsolicited data this tick, independent
    /// of whatever readiness event brought the multiplexer here (or didn't). See
    /// `WebSocketHandler::on_broadcast`.
    fn run_broadcast_tick(&mut self) {
        for index in 0..self.ws.len() {
            if self.ws[index].is_free() {
                continue;
            }
            if let Some(handler) = self.ws[index].handler() {
                handler.on_broadcast(&mut self.ws[index], self.tick);
            }
        }
    }

    fn close_ws(&mut self, index: usize) {
        if let Some(socket) = self.ws[index].socket() {
            let _ = self.poll.deregister(socket);
        }
        self.ws[index].close();
    }

    /// A tick that produced no events at all means nothing on any registered socket moved for the
    /// whole timeout; every open connection (however far into its request or response it is) is
    /// closed rather than tracked against a separate per-connection deadline.
    fn handle_idle_timeout(&mut self) {
        let any_open = self.http.iter().any(|c| !c.is_free()) || self.ws.iter().any(|c| !c.is_free());
        if !any_open {
            return;
        }
        warn!("tick timed out with open connections; closing the pool");
        for index in 0..self.http.len() {
            if !self.http[index].is_free() {
                self.close_http(index);
            }
        }
        for index in 0..self.ws.len() {
            if !self.ws[index].is_free() {
                if let Some(handler) = self.ws[index].handler() {
                    handler.on_close(&mut self.ws[index]);
                }
                self.close_ws(index);
            }
        }
    }
}
