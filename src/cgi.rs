// Copyright (c) 2016 The Rouille developers
// Licensed under the Apache License, Version 2.0
// <LICENSE-APACHE or
// http://www.apache.org/licenses/LICENSE-2.0> or the MIT
// license <LICENSE-MIT or http://opensource.org/licenses/MIT>,
// at your option. All files in the project carrying such
// notice may not be copied, modified, or distributed except
// according to those terms.

//! External-process CGI-like handler.
//!
//! A second, independent implementation of the [`HttpHandler`](crate::handler::HttpHandler)
//! contract, generalizing the source's `CgiRun` (a `std::process::Command` extension trait) to
//! the tick-at-a-time world: the request body is drained through the connection's own body
//! reader and handed to the child's stdin, and the child's stdout is parsed the same way the
//! source does (a `Status:` pseudo-header picks the response status, everything else before the
//! blank line becomes a response header, everything after streams as the body).
//!
//! Spawning and writing to the child's stdin are ordinary blocking `std` calls, same as the
//! source: a CGI script is expected to be short-lived, and nothing else can be serviced while a
//! slot's own handler is mid-tick regardless of what kind of handler it is.

use std::any::Any;
use std::io::{self, BufRead, BufReader, Read, Write};
use std::path::PathBuf;
use std::process::{Child, ChildStdout, Command, Stdio};

use log::{debug, warn};

use crate::connection::{Connection, Method};
use crate::handler::{HttpHandler, Outcome};
use crate::phase::{Phase, ReadPhase};
use crate::response;

const CHUNK_SIZE: usize = 8192;

/// Runs `program` as a CGI-style subprocess for every request the route matches, translating the
/// request into the environment variables a CGI script expects.
pub struct CgiHandler {
    program: PathBuf,
}

impl CgiHandler {
    pub fn new(program: impl Into<PathBuf>) -> CgiHandler {
        CgiHandler { program: program.into() }
    }
}

enum CgiState {
    /// Still draining the request body into `body` before the child can be spawned (CGI wants
    /// `CONTENT_LENGTH` and the full body up front, unlike the streaming file handler).
    ReadingBody { body: Vec<u8> },
    /// Child spawned and its stdout headers parsed; streaming the remaining bytes as the
    /// response body.
    Streaming { child: Child, stdout: BufReader<ChildStdout> },
}

impl HttpHandler for CgiHandler {
    fn poll(&self, conn: &mut Connection) -> Outcome {
        if conn.handler_state.is_none() {
            conn.handler_state = Some(Box::new(CgiState::ReadingBody { body: Vec::new() }) as Box<dyn Any + Send>);
        }

        // Unbox into an owned value: the `Read(Body)` and spawn steps each need their own
        // exclusive borrow of `conn`, which isn't possible while `body` stays borrowed out of
        // `conn.handler_state`.
        let mut state = *conn
            .handler_state
            .take()
            .expect("just ensured Some above")
            .downcast::<CgiState>()
            .expect("cgi handler only stores CgiState continuations");

        if let CgiState::ReadingBody { ref mut body } = state {
            if matches!(conn.phase, Phase::Read(ReadPhase::Body)) {
                match drain_body(conn, body) {
                    Ok(true) => {}
                    Ok(false) => {
                        conn.handler_state = Some(Box::new(state) as Box<dyn Any + Send>);
                        return Outcome::More;
                    }
                    Err(e) => {
                        debug!("cgi: error draining request body: {}", e);
                        return write_error(conn, 500);
                    }
                }
            }

            // Body fully drained (or there never was one): spawn the child.
            let body = std::mem::take(body);
            conn.phase = Phase::Write(crate::phase::WritePhase::Begin);
            state = match spawn_and_start(&self.program, conn, &body) {
                Ok(new_state) => new_state,
                Err(e) => {
                    warn!("cgi: failed to spawn {}: {}", self.program.display(), e);
                    return write_error(conn, 500);
                }
            };
        }

        let result = match &mut state {
            CgiState::Streaming { stdout, .. } => stream_chunk(conn, stdout),
            CgiState::ReadingBody { .. } => unreachable!("replaced with Streaming above"),
        };

        match result {
            Outcome::Done => {
                if let CgiState::Streaming { child, .. } = &mut state {
                    let _ = child.wait();
                }
            }
            Outcome::More => conn.handler_state = Some(Box::new(state) as Box<dyn Any + Send>),
            Outcome::NotFound => unreachable!("cgi handler never returns NotFound mid-stream"),
        }
        result
    }
}

fn drain_body(conn: &mut Connection, body: &mut Vec<u8>) -> io::Result<bool> {
    loop {
        match crate::body::getc(conn) {
            Ok(Some(b)) => body.push(b),
            Ok(None) => return Ok(true),
            Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(false),
            Err(e) => return Err(e),
        }
    }
}

fn spawn_and_start(program: &std::path::Path, conn: &mut Connection, body: &[u8]) -> io::Result<CgiState> {
    let method = match conn.method {
        Method::Get => "GET",
        Method::Post => "POST",
        Method::Unsupported => "GET",
    };
    let remote_addr = conn
        .socket()
        .and_then(|s| s.peer_addr().ok())
        .map(|a| a.to_string())
        .unwrap_or_default();

    let mut child = Command::new(program)
        .env("SERVER_SOFTWARE", "microhttp")
        .env("GATEWAY_INTERFACE", "CGI/1.1")
        .env("SERVER_PROTOCOL", "HTTP/1.1")
        .env("REQUEST_METHOD", method)
        .env("PATH_INFO", &conn.path)
        .env("QUERY_STRING", &conn.query_raw)
        .env("REMOTE_ADDR", remote_addr)
        .env("CONTENT_LENGTH", body.len().to_string())
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::inherit())
        .spawn()?;

    child.stdin.take().expect("stdin was piped").write_all(body)?;

    let mut stdout = BufReader::new(child.stdout.take().expect("stdout was piped"));
    read_cgi_headers(conn, &mut stdout)?;
    Ok(CgiState::Streaming { child, stdout })
}

/// Reads the child's `Name: value` header block (terminated by a blank line), recognizing the
/// CGI `Status:` pseudo-header the way the source's `CgiRun` does, and writes the corresponding
/// HTTP response status line and headers.
fn read_cgi_headers(conn: &mut Connection, stdout: &mut BufReader<ChildStdout>) -> io::Result<()> {
    let mut status = 200u16;
    let mut headers = Vec::new();

    loop {
        let mut line = String::new();
        let n = stdout.read_line(&mut line)?;
        if n == 0 || line == "\r\n" || line == "\n" {
            break;
        }
        let line = line.trim_end_matches(|c| c == '\r' || c == '\n');
        let colon = match line.find(':') {
            Some(i) => i,
            None => continue,
        };
        let name = &line[..colon];
        let value = line[colon + 1..].trim_start();
        if name.eq_ignore_ascii_case("Status") {
            if let Some(code) = value.get(0..3).and_then(|s| s.parse::<u16>().ok()) {
                status = code;
            }
        } else {
            headers.push((name.to_owned(), value.to_owned()));
        }
    }

    response::begin_response(conn, status, None)?;
    for (name, value) in headers {
        response::write_header(conn, &name, &value)?;
    }
    response::end_header(conn)
}

fn stream_chunk(conn: &mut Connection, stdout: &mut BufReader<ChildStdout>) -> Outcome {
    let mut buf = [0u8; CHUNK_SIZE];
    match stdout.read(&mut buf) {
        Ok(0) => {
            let _ = response::end_body(conn);
            Outcome::Done
        }
        Ok(n) => {
            let _ = response::write_body(conn, &buf[..n]);
            Outcome::More
        }
        Err(e) => {
            debug!("cgi: error reading child stdout: {}", e);
            let _ = response::end_body(conn);
            Outcome::Done
        }
    }
}

fn write_error(conn: &mut Connection, status: u16) -> Outcome {
    conn.phase = Phase::Write(crate::phase::WritePhase::Begin);
    let body = response::reason_phrase(status).as_bytes().to_vec();
    let _ = response::begin_response(conn, status, Some("text/plain"));
    let _ = response::set_content_length(conn, body.len() as u64);
    let _ = response::end_header(conn);
    let _ = response::write_body(conn, &body);
    let _ = response::end_body(conn);
    conn.unbind_handler();
    Outcome::Done
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_pseudo_header_is_parsed_out_of_headers() {
        let raw = b"Status: 404 Not Found\r\nContent-Type: text/plain\r\n\r\nbody\n";
        let mut reader = BufReader::new(&raw[..]);
        let mut status = 200u16;
        let mut headers = Vec::new();
        loop {
            let mut line = String::new();
            let n = reader.read_line(&mut line).unwrap();
            if n == 0 || line == "\r\n" || line == "\n" {
                break;
            }
            let line = line.trim_end_matches(|c| c == '\r' || c == '\n');
            let colon = line.find(':').unwrap();
            let name = &line[..colon];
            let value = line[colon + 1..].trim_start();
            if name.eq_ignore_ascii_case("Status") {
                status = value.get(0..3).unwrap().parse().unwrap();
            } else {
                headers.push((name.to_owned(), value.to_owned()));
            }
        }
        assert_eq!(status, 404);
        assert_eq!(headers, vec![("Content-Type".to_owned(), "text/plain".to_owned())]);
    }
}
