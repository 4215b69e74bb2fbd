// Copyright (c) 2016 The Rouille developers
// Licensed under the Apache License, Version 2.0
// <LICENSE-APACHE or
// http://www.apache.org/licenses/LICENSE-2.0> or the MIT
// license <LICENSE-MIT or http://opensource.org/licenses/MIT>,
// at your option. All files in the project carrying such
// notice may not be copied, modified, or distributed except
// according to those terms.

//! Ordered route table with trailing-`*` wildcard matching.
//!
//! The source's `find_route!` macro tries one handler after another until one stops returning
//! "no route found"; a `Router` is the same idea generalized from a fixed macro expansion to a
//! runtime-built table, since routes here are registered by the embedder rather than known at
//! compile time.

use crate::connection::Connection;
use crate::handler::{HttpHandler, Outcome};
use crate::response;

struct RouteEntry {
    pattern: String,
    handler: &'static dyn HttpHandler,
}

/// An ordered, first-match-wins table of routes.
#[derive(Default)]
pub struct Router {
    routes: Vec<RouteEntry>,
}

impl Router {
    pub fn new() -> Router {
        Router { routes: Vec::new() }
    }

    /// Appends a route. Routes are tried in the order they were added.
    pub fn add(&mut self, pattern: impl Into<String>, handler: &'static dyn HttpHandler) {
        self.routes.push(RouteEntry {
            pattern: pattern.into(),
            handler,
        });
    }

    /// Returns the first handler bound to a route whose pattern matches `path`, and the index it
    /// was found at so the caller can resume scanning past it on `Outcome::NotFound`.
    pub fn find_from(&self, path: &str, start: usize) -> Option<(usize, &'static dyn HttpHandler)> {
        self.routes[start..]
            .iter()
            .enumerate()
            .find(|(_, route)| pattern_matches(&route.pattern, path))
            .map(|(offset, route)| (start + offset, route.handler))
    }

    pub fn find(&self, path: &str) -> Option<&'static dyn HttpHandler> {
        self.find_from(path, 0).map(|(_, handler)| handler)
    }
}

/// Matches `pattern` against `path`. A trailing `*` matches any suffix; otherwise the match is
/// exact.
pub fn pattern_matches(pattern: &str, path: &str) -> bool {
    match pattern.strip_suffix('*') {
        Some(prefix) => path.starts_with(prefix),
        None => path == pattern,
    }
}

/// The fallback handler bound once no route in the table matches, writing a minimal 404.
struct NotFoundHandler;

impl HttpHandler for NotFoundHandler {
    fn poll(&self, conn: &mut Connection) -> Outcome {
        let body = b"Not Found";
        let _ = response::begin_response(conn, 404, Some("text/plain"));
        let _ = response::set_content_length(conn, body.len() as u64);
        let _ = response::end_header(conn);
        let _ = response::write_body(conn, body);
        let _ = response::end_body(conn);
        Outcome::Done
    }
}

pub(crate) static NOT_FOUND: NotFoundHandler = NotFoundHandler;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exact_match() {
        assert!(pattern_matches("/a", "/a"));
        assert!(!pattern_matches("/a", "/ab"));
    }

    #[test]
    fn wildcard_match() {
        assert!(pattern_matches("/a/*", "/a/b"));
        assert!(pattern_matches("/a/*", "/a/"));
        assert!(!pattern_matches("/a/*", "/b/c"));
    }

    #[test]
    fn first_match_wins_in_insertion_order() {
        struct Dummy;
        impl HttpHandler for Dummy {
            fn poll(&self, _conn: &mut crate::connection::Connection) -> crate::handler::Outcome {
                crate::handler::Outcome::Done
            }
        }
        static A: Dummy = Dummy;
        static B: Dummy = Dummy;

        let mut router = Router::new();
        router.add("/wildcard/*", &A);
        router.add("/wildcard/specific", &B);

        let (index, _) = router.find_from("/wildcard/specific", 0).unwrap();
        assert_eq!(index, 0, "the earlier wildcard route should win over the later exact one");
    }
}
