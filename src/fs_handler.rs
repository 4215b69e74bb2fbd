// Copyright (c) 2016 The Rouille developers
// Licensed under the Apache License, Version 2.0
// <LICENSE-APACHE or
// http://www.apache.org/licenses/LICENSE-2.0> or the MIT
// license <LICENSE-MIT or http://opensource.org/licenses/MIT>,
// at your option. All files in the project carrying such
// notice may not be copied, modified, or distributed except
// according to those terms.

//! Filesystem-backed content handler.
//!
//! Serves files under a document root, following the same `.gz`/`.hs` sidecar convention the
//! source's static-file collaborator uses: a `.gz` variant is preferred when the client
//! advertised gzip support, and a `.hs` sidecar holding a 40-hex-character digest becomes the
//! response's `ETag`, answered with a bodyless 304 when it matches `If-None-Match`. Streams the
//! file in fixed-size chunks across handler ticks rather than reading it into memory at once,
//! the same shape as the CGI-like contract in [`crate::cgi`].

use std::any::Any;
use std::fs::File;
use std::io::Read;
use std::path::{Path, PathBuf};

use log::{debug, trace};

use crate::connection::{Connection, Method};
use crate::handler::{HttpHandler, Outcome};
use crate::phase::Flags;
use crate::response;

/// Bytes read from disk per handler tick; keeps a single slow client from holding an oversized
/// buffer in memory the way reading the whole file up front would.
const CHUNK_SIZE: usize = 8192;

/// Serves static files rooted at a fixed directory.
///
/// Non-GET requests fall through with [`Outcome::NotFound`] so the router can try the next
/// route, rather than answering 405 itself (method-not-allowed is the header parser's job, not a
/// content handler's).
pub struct FileHandler {
    root: PathBuf,
}

impl FileHandler {
    pub fn new(root: impl Into<PathBuf>) -> FileHandler {
        FileHandler { root: root.into() }
    }

    /// Joins `path` onto the document root. `path` always starts with `/` (the parser guarantees
    /// this), so the leading separator is stripped before joining to avoid `Path::join`
    /// replacing the root entirely.
    fn resolve(&self, path: &str) -> PathBuf {
        self.root.join(path.trim_start_matches('/'))
    }
}

/// Per-request continuation: an open file plus its already-decided content type, resumed across
/// `Outcome::More` ticks until EOF.
struct Streaming {
    file: File,
    content_type: &'static str,
}

impl HttpHandler for FileHandler {
    fn poll(&self, conn: &mut Connection) -> Outcome {
        if conn.handler_state.is_none() {
            if conn.method != Method::Get {
                return Outcome::NotFound;
            }
            return begin(self, conn);
        }
        continue_stream(conn)
    }
}

fn begin(handler: &FileHandler, conn: &mut Connection) -> Outcome {
    let path = conn.path.clone();
    let wants_gzip = conn.flags.contains(Flags::ACCEPT_GZIP);
    let base = handler.resolve(&path);

    let etag = read_etag_sidecar(&base);
    if let Some(ref etag) = etag {
        if !conn.if_none_match.is_empty() && conn.if_none_match == *etag {
            trace!("fs handler: {} matches If-None-Match, answering 304", path);
            let _ = response::begin_response(conn, 304, None);
            if let Some(etag) = etag_header(etag) {
                let _ = response::write_header(conn, "ETag", &etag);
            }
            let _ = response::write_header(conn, "Cache-Control", "max-age=3600, must-revalidate");
            let _ = response::set_content_length(conn, 0);
            let _ = response::end_header(conn);
            let _ = response::end_body(conn);
            return Outcome::Done;
        }
    }

    let gz_path = {
        let mut p = base.clone().into_os_string();
        p.push(".gz");
        PathBuf::from(p)
    };

    let (file_path, content_encoding) = if wants_gzip && gz_path.is_file() {
        (gz_path, Some("gzip"))
    } else {
        (base.clone(), None)
    };

    let file = match File::open(&file_path) {
        Ok(f) => f,
        Err(_) => {
            debug!("fs handler: no file at {}", file_path.display());
            return Outcome::NotFound;
        }
    };

    let content_type = content_type_for(&base);

    let _ = response::begin_response(conn, 200, Some(content_type));
    if let Some(encoding) = content_encoding {
        let _ = response::write_header(conn, "Content-Encoding", encoding);
    }
    if let Some(ref etag) = etag {
        if let Some(etag) = etag_header(etag) {
            let _ = response::write_header(conn, "ETag", &etag);
        }
    }
    let _ = response::end_header(conn);

    conn.handler_state = Some(Box::new(Streaming { file, content_type }) as Box<dyn Any + Send>);
    continue_stream(conn)
}

fn continue_stream(conn: &mut Connection) -> Outcome {
    let mut buf = [0u8; CHUNK_SIZE];
    let read = {
        let streaming = conn
            .handler_state
            .as_mut()
            .and_then(|state| state.downcast_mut::<Streaming>())
            .expect("fs handler only stores Streaming continuations");
        streaming.file.read(&mut buf)
    };

    match read {
        Ok(0) => {
            let _ = response::end_body(conn);
            conn.unbind_handler();
            Outcome::Done
        }
        Ok(n) => {
            let _ = response::write_body(conn, &buf[..n]);
            Outcome::More
        }
        Err(e) => {
            debug!("fs handler: read error mid-stream: {}", e);
            let _ = response::end_body(conn);
            conn.unbind_handler();
            Outcome::Done
        }
    }
}

/// Reads a `<path>.hs` sidecar if it exists and holds exactly 40 hex bytes, matching the source's
/// ETag convention (a SHA-1 hex digest computed out of band, e.g. at build time).
fn read_etag_sidecar(base: &Path) -> Option<String> {
    let mut hs_path = base.as_os_str().to_owned();
    hs_path.push(".hs");
    let mut contents = String::new();
    File::open(PathBuf::from(hs_path)).ok()?.read_to_string(&mut contents).ok()?;
    let trimmed = contents.trim();
    if trimmed.len() == 40 && trimmed.bytes().all(|b| b.is_ascii_hexdigit()) {
        Some(trimmed.to_owned())
    } else {
        None
    }
}

/// Quotes an ETag value for the wire (RFC 7232 ETags are quoted strings); returns `None` only if
/// the sidecar contents somehow contained a `"`, which `read_etag_sidecar`'s hex-digit check
/// already rules out, so this never actually fails in practice.
fn etag_header(etag: &str) -> Option<String> {
    if etag.contains('"') {
        None
    } else {
        Some(format!("\"{}\"", etag))
    }
}

/// Maps a file extension to a MIME type via a small static table, defaulting to `text/plain` for
/// anything unrecognized (the source does the same rather than guessing from file contents).
fn content_type_for(path: &Path) -> &'static str {
    match path.extension().and_then(|e| e.to_str()) {
        Some("html") | Some("htm") => "text/html",
        Some("css") => "text/css",
        Some("js") => "application/javascript",
        Some("json") => "application/json",
        Some("png") => "image/png",
        Some("svg") => "image/svg+xml",
        Some("jpg") | Some("jpeg") => "image/jpeg",
        Some("gif") => "image/gif",
        Some("txt") => "text/plain",
        _ => "text/plain",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn content_type_by_extension() {
        assert_eq!(content_type_for(Path::new("a/b.html")), "text/html");
        assert_eq!(content_type_for(Path::new("a/b.css")), "text/css");
        assert_eq!(content_type_for(Path::new("a/b.unknown")), "text/plain");
        assert_eq!(content_type_for(Path::new("a/b")), "text/plain");
    }

    #[test]
    fn resolve_strips_leading_slash() {
        let handler = FileHandler::new("/srv/www");
        assert_eq!(handler.resolve("/index.html"), PathBuf::from("/srv/www/index.html"));
        assert_eq!(handler.resolve("/a/b.css"), PathBuf::from("/srv/www/a/b.css"));
    }

    #[test]
    fn etag_sidecar_rejects_wrong_length() {
        let dir = std::env::temp_dir().join(format!("microhttp-fs-test-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        let sidecar = dir.join("page.html.hs");
        std::fs::write(&sidecar, "not-forty-hex-chars").unwrap();
        assert_eq!(read_etag_sidecar(&dir.join("page.html")), None);
        std::fs::write(&sidecar, "a".repeat(40)).unwrap();
        assert_eq!(read_etag_sidecar(&dir.join("page.html")), Some("a".repeat(40)));
        let _ = std::fs::remove_dir_all(&dir);
    }
}
