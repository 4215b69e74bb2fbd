// Copyright (c) 2016 The Rouille developers
// Licensed under the Apache License, Version 2.0
// <LICENSE-APACHE or
// http://www.apache.org/licenses/LICENSE-2.0> or the MIT
// license <LICENSE-MIT or http://opensource.org/licenses/MIT>,
// at your option. All files in the project carrying such
// notice may not be copied, modified, or distributed except
// according to those terms.

//! A byte-driven, single-threaded HTTP/1.1 server with in-place WebSocket upgrade, built for
//! memory-constrained devices: no thread pool, no async runtime, two fixed-size connection pools
//! allocated once at startup and reused for the life of the process.
//!
//! ```no_run
//! use microhttp::{FileHandler, Router, Server, ServerConfig, WsRouter};
//!
//! let assets: &'static FileHandler = Box::leak(Box::new(FileHandler::new("/srv/www")));
//!
//! let mut router = Router::new();
//! router.add("/*", assets);
//!
//! let mut server = Server::new("0.0.0.0:8080", router, WsRouter::new(), ServerConfig::default())?;
//! server.run()?;
//! # Ok::<(), microhttp::Error>(())
//! ```
//!
//! Routes are static dispatch (`&'static dyn HttpHandler`): a handler known at compile time is
//! typically a plain `static`, while one built at runtime (like `FileHandler` above, whose
//! document root is a configuration value) is leaked once at startup, the same tradeoff the
//! source makes by wiring its handler table once and never tearing it down.

mod body;
mod cgi;
pub mod client;
mod config;
mod connection;
mod error;
mod fs_handler;
mod handler;
mod mux;
mod parser;
mod phase;
mod query;
mod response;
mod router;
mod util;
mod websocket;

use std::net::{SocketAddr, ToSocketAddrs};

pub use crate::cgi::CgiHandler;
pub use crate::client::{fetch, FetchedResponse};
pub use crate::config::ServerConfig;
pub use crate::connection::{Connection, Method};
pub use crate::error::{Error, Result};
pub use crate::fs_handler::FileHandler;
pub use crate::handler::{HttpHandler, Outcome, WebSocketHandler};
pub use crate::mux::Multiplexer;
pub use crate::response::{begin_response, end_body, end_header, set_content_length, write_body, write_header};
pub use crate::router::Router;
pub use crate::websocket::{read_payload, send_frame, WsConnection, WsRouter};

/// Owns the event loop; construct with [`Server::new`] and drive it with [`Server::run`] or, for
/// an embedder that wants its own loop around other work, one [`Server::poll`] per iteration.
pub struct Server {
    mux: Multiplexer,
}

impl Server {
    /// Binds `addr` and allocates both connection pools according to `config`. Routes are fixed
    /// for the server's lifetime; there is no dynamic route registration after this point, the
    /// same way the source wires its handler table once at startup.
    pub fn new(
        addr: impl ToSocketAddrs,
        router: Router,
        ws_router: WsRouter,
        config: ServerConfig,
    ) -> Result<Server> {
        let addr = resolve_addr(addr)?;
        let mux = Multiplexer::bind(addr, router, ws_router, config)?;
        Ok(Server { mux })
    }

    /// The address actually bound, useful when `addr` asked for an ephemeral port (`:0`).
    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.mux.local_addr()
    }

    /// Runs forever, one tick at a time. Returns only on a fatal poll error.
    pub fn run(&mut self) -> Result<()> {
        self.mux.run()
    }

    /// Services one round of readiness and returns. For an embedder that needs to interleave its
    /// own work between ticks rather than hand the thread over entirely via `run`.
    pub fn poll(&mut self) -> Result<()> {
        self.mux.tick()
    }
}

fn resolve_addr(addr: impl ToSocketAddrs) -> Result<SocketAddr> {
    addr.to_socket_addrs()?
        .next()
        .ok_or_else(|| Error::Listen(std::io::Error::new(std::io::ErrorKind::InvalidInput, "no address resolved")))
}

/// Not part of the public API: gives the `fuzz/` crate access to the byte-at-a-time parser
/// without exposing `crate::parser` itself. The parser never panics and never reads past a
/// request's header terminator on any input, which is exactly the property the fuzz target
/// checks.
#[doc(hidden)]
pub mod fuzz_support {
    pub use crate::connection::Connection;
    pub use crate::phase::{Phase, ReadPhase};

    pub fn feed(conn: &mut Connection, byte: u8) {
        crate::parser::feed(conn, byte);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn server_binds_ephemeral_port() {
        let router = Router::new();
        let ws_router = WsRouter::new();
        let server = Server::new("127.0.0.1:0", router, ws_router, ServerConfig::default()).unwrap();
        assert!(server.local_addr().unwrap().port() > 0);
    }
}
