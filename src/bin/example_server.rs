// Copyright (c) 2016 The Rouille developers
// Licensed under the Apache License, Version 2.0
// <LICENSE-APACHE or
// http://www.apache.org/licenses/LICENSE-2.0> or the MIT
// license <LICENSE-MIT or http://opensource.org/licenses/MIT>,
// at your option. All files in the project carrying such
// notice may not be copied, modified, or distributed except
// according to those terms.

//! A small demonstration binary: static files over `/`, a CGI-style script over `/cgi-bin/*`,
//! and a WebSocket echo endpoint over `/ws`.
//!
//! ```text
//! example-server <document-root> [bind-addr]
//! ```

use std::env;

use microhttp::{
    read_payload, send_frame, CgiHandler, FileHandler, Router, Server, ServerConfig, WebSocketHandler, WsConnection,
    WsRouter,
};

struct Echo;

impl WebSocketHandler for Echo {
    fn on_open(&self, conn: &mut WsConnection, request_path: &str) -> bool {
        log::info!("websocket connected on {}", request_path);
        let _ = conn;
        true
    }

    fn on_message(&self, conn: &mut WsConnection) {
        let mut buf = [0u8; 4096];
        loop {
            match read_payload(conn, &mut buf) {
                Ok(0) => break,
                Ok(n) => {
                    // Opcode 0x1 is TEXT; this demo only ever echoes, so there is no need to
                    // distinguish TEXT from BINARY on the way back out.
                    let _ = send_frame(conn, 0x1, &buf[..n]);
                }
                Err(_) => break,
            }
        }
    }

    fn on_close(&self, _conn: &mut WsConnection) {
        log::info!("websocket disconnected");
    }
}

fn main() {
    env_logger::init();

    let mut args = env::args().skip(1);
    let document_root = args.next().unwrap_or_else(|| ".".to_owned());
    let bind_addr = args.next().unwrap_or_else(|| "127.0.0.1:8080".to_owned());

    let assets: &'static FileHandler = Box::leak(Box::new(FileHandler::new(document_root)));
    let cgi: &'static CgiHandler = Box::leak(Box::new(CgiHandler::new("/usr/bin/env")));

    let mut router = Router::new();
    router.add("/cgi-bin/*", cgi);
    router.add("/*", assets);

    let mut ws_router = WsRouter::new();
    static ECHO: Echo = Echo;
    ws_router.add("/ws", &ECHO);

    let mut server = Server::new(bind_addr.as_str(), router, ws_router, ServerConfig::default())
        .unwrap_or_else(|e| panic!("failed to start on {}: {}", bind_addr, e));
    log::info!("listening on {}", server.local_addr().unwrap());
    server.run().expect("server loop exited with an error");
}
