// Copyright (c) 2016 The Rouille developers
// Licensed under the Apache License, Version 2.0
// <LICENSE-APACHE or
// http://www.apache.org/licenses/LICENSE-2.0> or the MIT
// license <LICENSE-MIT or http://opensource.org/licenses/MIT>,
// at your option. All files in the project carrying such
// notice may not be copied, modified, or distributed except
// according to those terms.

//! URL-decoding of the query string, in place.
//!
//! Mirrors `http_urldecode` / `parse_query_string` from the source: values are decoded in place
//! (decoding never grows a string, so this is sound), and the query string is split into spans
//! rather than into freshly-allocated strings. The source represents each split as a `char*`
//! pointing into the (mutated) query buffer; here that becomes a `(key_start, key_end, value_end)`
//! triple of offsets into the same buffer, per the design notes' recommendation to avoid interior
//! pointers in owned strings.

/// One decoded `key=value` pair's location within a `query_raw` buffer.
#[derive(Debug, Copy, Clone)]
struct Span {
    key_start: usize,
    key_end: usize,
    value_end: usize,
}

#[derive(Debug, Default)]
pub struct QueryDecoder {
    spans: Vec<Span>,
    decoded: bool,
}

impl QueryDecoder {
    pub fn new() -> QueryDecoder {
        QueryDecoder::default()
    }

    pub fn reset(&mut self) {
        self.spans.clear();
        self.decoded = false;
    }

    /// Decodes `query_raw` in place and indexes it into `k=v` spans. Idempotent after the first
    /// call for a given buffer; callers must `reset()` before decoding a new buffer.
    fn ensure_decoded(&mut self, query_raw: &mut String) {
        if self.decoded {
            return;
        }
        self.decoded = true;

        if query_raw.is_empty() {
            return;
        }

        // SAFETY-free approach: work on raw bytes, since decoding only ever shortens the string
        // and every byte we produce is ASCII-safe (the original bytes were already UTF-8, and
        // percent-decoding can only turn valid UTF-8 input into valid UTF-8 output as long as the
        // caller's input was well-formed; a malformed `%HH` escape decodes to an arbitrary byte,
        // same as the source, and we don't promise UTF-8 in that corner case).
        let bytes = unsafe { query_raw.as_mut_vec() };

        let mut write = 0usize;
        let mut read = 0usize;
        let mut key_start = 0usize;
        let mut key_end: Option<usize> = None;

        while read < bytes.len() {
            let b = bytes[read];
            if b == b'&' {
                let ks = key_start;
                let ke = key_end.unwrap_or(write);
                self.spans.push(Span {
                    key_start: ks,
                    key_end: ke,
                    value_end: write,
                });
                key_start = write;
                key_end = None;
                read += 1;
                continue;
            }

            if b == b'=' && key_end.is_none() {
                key_end = Some(write);
                bytes[write] = b'=';
                write += 1;
                read += 1;
                continue;
            }

            let decoded = match b {
                b'+' => {
                    read += 1;
                    b' '
                }
                b'%' if read + 2 < bytes.len() => {
                    let hi = crate::util::hex_to_int(bytes[read + 1]);
                    let lo = crate::util::hex_to_int(bytes[read + 2]);
                    read += 3;
                    (hi << 4) | lo
                }
                other => {
                    read += 1;
                    other
                }
            };
            bytes[write] = decoded;
            write += 1;
        }

        let ks = key_start;
        let ke = key_end.unwrap_or(write);
        self.spans.push(Span {
            key_start: ks,
            key_end: ke,
            value_end: write,
        });

        bytes.truncate(write);
    }

    /// Looks up `name` in the query string, decoding it on first access.
    ///
    /// Returns `None` both when the name is absent and when it has no `=value` part, matching the
    /// source's "query parameter has no value" tolerance (logged there, silently `None` here since
    /// this is a normal, expected shape for a query string).
    pub fn get<'a>(&mut self, query_raw: &'a mut String, name: &str) -> Option<&'a str> {
        self.ensure_decoded(query_raw);

        for span in &self.spans {
            if span.key_end - span.key_start != name.len() {
                continue;
            }
            if &query_raw[span.key_start..span.key_end] == name {
                if span.key_end < span.value_end {
                    // `key_end` points at the `=`; skip it.
                    return Some(&query_raw[span.key_end + 1..span.value_end]);
                }
                return None;
            }
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn simple_lookup() {
        let mut raw = "a=1&b=2%203&c=4".to_string();
        let mut dec = QueryDecoder::new();
        assert_eq!(dec.get(&mut raw, "a"), Some("1"));
        assert_eq!(dec.get(&mut raw, "b"), Some("2 3"));
        assert_eq!(dec.get(&mut raw, "c"), Some("4"));
        assert_eq!(dec.get(&mut raw, "d"), None);
    }

    #[test]
    fn missing_equals_is_tolerated() {
        let mut raw = "flag&a=1".to_string();
        let mut dec = QueryDecoder::new();
        assert_eq!(dec.get(&mut raw, "flag"), None);
        assert_eq!(dec.get(&mut raw, "a"), Some("1"));
    }

    #[test]
    fn decoding_never_grows() {
        let mut raw = "x=hello%20world%21".to_string();
        let before_len = raw.len();
        let mut dec = QueryDecoder::new();
        let value_len = dec.get(&mut raw, "x").unwrap().len();
        assert!(value_len <= before_len);
    }

    #[test]
    fn plus_decodes_to_space() {
        let mut raw = "q=a+b+c".to_string();
        let mut dec = QueryDecoder::new();
        assert_eq!(dec.get(&mut raw, "q"), Some("a b c"));
    }
}
