// Copyright (c) 2016 The Rouille developers
// Licensed under the Apache License, Version 2.0
// <LICENSE-APACHE or
// http://www.apache.org/licenses/LICENSE-2.0> or the MIT
// license <LICENSE-MIT or http://opensource.org/licenses/MIT>,
// at your option. All files in the project carrying such
// notice may not be copied, modified, or distributed except
// according to those terms.

//! The connection state machine's phase alphabet.
//!
//! The original source encodes this as an `enum` of OR'd bitflags (a read/write/error bit plus a
//! phase ordinal). A tagged enum says the same thing without letting an invalid combination of
//! bits exist.

/// Sub-phases reached while consuming bytes from the socket.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum ReadPhase {
    /// Waiting for the first byte of a new request/response.
    Begin,
    ServerMethod,
    ServerPath,
    ServerQuery,
    ServerVersion,
    ClientVersion,
    ClientStatus,
    ClientStatusDesc,
    /// Reading header lines, one per `\r\n`-terminated line.
    Header,
    /// Draining the body (content-length or chunked).
    Body,
    /// All of the body has been drained; waiting for the peer to close the socket.
    Done,
}

/// Sub-phases reached while producing bytes for the socket.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum WritePhase {
    /// Nothing has been written yet; the handler has not been invoked.
    Begin,
    Header,
    Body,
    Done,
}

/// The phase of an HTTP connection.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Phase {
    Read(ReadPhase),
    Write(WritePhase),
    /// The parser rejected the input. The carried value is the status code to report.
    Error(u16),
    /// Headers are complete and request an `Upgrade: websocket`; the multiplexer will migrate
    /// this slot to the WebSocket pool on the next tick.
    UpgradePending,
}

impl Phase {
    /// True if the multiplexer should poll this slot for readability.
    pub fn wants_read(&self) -> bool {
        matches!(self, Phase::Read(_))
    }

    /// True if the multiplexer should poll this slot for writability.
    pub fn wants_write(&self) -> bool {
        matches!(self, Phase::Write(_))
    }

    pub fn is_error(&self) -> bool {
        matches!(self, Phase::Error(_))
    }

    pub fn is_header_phase(&self) -> bool {
        matches!(
            self,
            Phase::Read(ReadPhase::ServerMethod)
                | Phase::Read(ReadPhase::ServerPath)
                | Phase::Read(ReadPhase::ServerQuery)
                | Phase::Read(ReadPhase::ServerVersion)
                | Phase::Read(ReadPhase::ClientVersion)
                | Phase::Read(ReadPhase::ClientStatus)
                | Phase::Read(ReadPhase::ClientStatusDesc)
                | Phase::Read(ReadPhase::Header)
        )
    }
}

bitflags::bitflags! {
    /// Orthogonal per-connection flags. Kept as a bitset, matching the source's `http_flags`,
    /// since these really are independent booleans rather than states of a single machine.
    pub struct Flags: u16 {
        const ACCEPT_GZIP         = 0x0001;
        const READ_CHUNKED        = 0x0002;
        const WRITE_CHUNKED       = 0x0004;
        const IS_CLIENT           = 0x0008;
        const EXPECT_NEWLINE      = 0x0010;
        /// `Upgrade: websocket` header seen.
        const WEBSOCKET_UPGRADE   = 0x0020;
        /// `Connection: Upgrade` header seen. Both this and `WEBSOCKET_UPGRADE` are required
        /// before the parser moves to `Phase::UpgradePending`.
        const CONNECTION_UPGRADE  = 0x0040;
    }
}
