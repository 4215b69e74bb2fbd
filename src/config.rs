// Copyright (c) 2016 The Rouille developers
// Licensed under the Apache License, Version 2.0
// <LICENSE-APACHE or
// http://www.apache.org/licenses/LICENSE-2.0> or the MIT
// license <LICENSE-MIT or http://opensource.org/licenses/MIT>,
// at your option. All files in the project carrying such
// notice may not be copied, modified, or distributed except
// according to those terms.

use std::time::Duration;

/// Tunable knobs for a [`crate::Server`](crate::Server), mirroring the source's compile-time
/// constants (pool sizes, select() timeout) as runtime defaults instead. The header scratch
/// buffer stays a compile-time constant ([`crate::connection::SCRATCH_CAPACITY`]): it backs an
/// `ArrayVec`, whose capacity is part of its type and so cannot be chosen at runtime.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Number of concurrent HTTP connections the server will hold open at once.
    pub http_pool_size: usize,
    /// Number of concurrent upgraded WebSocket connections.
    pub websocket_pool_size: usize,
    /// How long a single multiplexer tick blocks waiting for readiness before giving up and
    /// closing every open connection. Aggressive by design; see the module docs on `Multiplexer`.
    pub tick_timeout: Duration,
}

impl Default for ServerConfig {
    fn default() -> ServerConfig {
        ServerConfig {
            http_pool_size: 3,
            websocket_pool_size: 3,
            tick_timeout: Duration::from_millis(500),
        }
    }
}
