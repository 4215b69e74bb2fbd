// Copyright (c) 2016 The Rouille developers
// Licensed under the Apache License, Version 2.0
// <LICENSE-APACHE or
// http://www.apache.org/licenses/LICENSE-2.0> or the MIT
// license <LICENSE-MIT or http://opensource.org/licenses/MIT>,
// at your option. All files in the project carrying such
// notice may not be copied, modified, or distributed except
// according to those terms.

use std::io;

use thiserror::Error;

/// Errors that can escape the crate's public API.
///
/// Per-request protocol violations are *not* represented here: they live as a
/// [`crate::phase::Phase::Error`] value threaded through the connection state machine, since a
/// malformed request is an expected, handled outcome and not an exceptional one. This type only
/// covers the setup and resource-exhaustion failures that have nowhere else to go.
#[derive(Debug, Error)]
pub enum Error {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// The listen socket could not be created or bound.
    #[error("failed to start listening: {0}")]
    Listen(io::Error),

    /// No free slot was available in the HTTP or WebSocket connection pool.
    #[error("connection pool exhausted")]
    PoolExhausted,
}

pub type Result<T> = std::result::Result<T, Error>;
