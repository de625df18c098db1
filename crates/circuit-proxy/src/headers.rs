//! Hop-by-hop header stripping and sticky-session token extraction.
//!
//! Hop-by-hop headers describe a single transport link and are dropped in
//! both directions. The sticky-session header is proxy-internal: its value
//! selects the circuit and it is never forwarded.
//!
//! Two input shapes are supported. Raw `(name, value)` pairs keep the
//! client's casing and order; a parsed [`HeaderMap`] (upstream responses)
//! is iterated as a fallback and yields lowercase names. Both go through
//! the same filter.

use crate::config::DEFAULT_SESSION_HEADER;
use hyper::header::HeaderMap;
use tracing::debug;

/// Headers that never cross the proxy.
pub const HOP_BY_HOP: [&str; 9] = [
    "Connection",
    "Keep-Alive",
    "Proxy-Authenticate",
    "Proxy-Authorization",
    "TE",
    "Trailers",
    "Transfer-Encoding",
    "Upgrade",
    DEFAULT_SESSION_HEADER,
];

/// Ordered header collection. Repeated names (compared case-sensitively, as
/// received) collect into one entry with several values in arrival order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HeaderSet {
    entries: Vec<(String, Vec<String>)>,
}

impl HeaderSet {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a value, merging with an existing entry of the same name.
    pub fn append(&mut self, name: &str, value: &str) {
        match self.entries.iter_mut().find(|(n, _)| n == name) {
            Some((_, values)) => values.push(value.to_string()),
            None => self
                .entries
                .push((name.to_string(), vec![value.to_string()])),
        }
    }

    /// All values for `name`, matched case-insensitively.
    #[must_use]
    pub fn get_all(&self, name: &str) -> Vec<&str> {
        self.entries
            .iter()
            .filter(|(n, _)| n.eq_ignore_ascii_case(name))
            .flat_map(|(_, values)| values.iter().map(String::as_str))
            .collect()
    }

    /// First value for `name`, matched case-insensitively.
    #[must_use]
    pub fn get(&self, name: &str) -> Option<&str> {
        self.entries
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .and_then(|(_, values)| values.first().map(String::as_str))
    }

    #[must_use]
    pub fn contains(&self, name: &str) -> bool {
        self.get(name).is_some()
    }

    /// Drop every entry named `name` (case-insensitive).
    pub fn remove(&mut self, name: &str) {
        self.entries.retain(|(n, _)| !n.eq_ignore_ascii_case(name));
    }

    /// Flattened `(name, value)` pairs: entries in first-seen order, values
    /// of one entry in arrival order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.entries
            .iter()
            .flat_map(|(n, values)| values.iter().map(move |v| (n.as_str(), v.as_str())))
    }

    /// Number of distinct names.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Result of processing a client's request headers.
#[derive(Debug, Clone, Default)]
pub struct InboundHeaders {
    pub headers: HeaderSet,
    /// Sticky-session token, if the client sent a non-empty one
    pub session_token: Option<String>,
}

/// Header filter shared by both traffic paths.
#[derive(Debug, Clone)]
pub struct HeaderProcessor {
    session_header: String,
}

impl Default for HeaderProcessor {
    fn default() -> Self {
        Self::new(DEFAULT_SESSION_HEADER)
    }
}

impl HeaderProcessor {
    /// Processor that reads the sticky token from `session_header`.
    #[must_use]
    pub fn new(session_header: &str) -> Self {
        Self {
            session_header: session_header.to_string(),
        }
    }

    /// Case-insensitive hop-by-hop check. The configured session header
    /// always counts as hop-by-hop.
    #[must_use]
    pub fn is_hop_by_hop(&self, name: &str) -> bool {
        name.eq_ignore_ascii_case(&self.session_header)
            || HOP_BY_HOP.iter().any(|h| name.eq_ignore_ascii_case(h))
    }

    /// Sanitize client request headers and capture the session token.
    ///
    /// If the session header repeats, the last value wins.
    pub fn extract_inbound<'a, I>(&self, pairs: I) -> InboundHeaders
    where
        I: IntoIterator<Item = (&'a str, &'a str)>,
    {
        let mut session_token = None;
        let headers = self.filter(pairs, |name, value| {
            if name.eq_ignore_ascii_case(&self.session_header) {
                let value = value.trim();
                session_token = (!value.is_empty()).then(|| value.to_string());
            }
        });
        InboundHeaders {
            headers,
            session_token,
        }
    }

    /// Sanitize headers headed to the other side of the proxy.
    pub fn filter_outbound<'a, I>(&self, pairs: I) -> HeaderSet
    where
        I: IntoIterator<Item = (&'a str, &'a str)>,
    {
        self.filter(pairs, |_, _| {})
    }

    /// Sanitize a parsed header map. Names come out lowercase.
    #[must_use]
    pub fn filter_header_map(&self, map: &HeaderMap) -> HeaderSet {
        let owned: Vec<(&str, String)> = map
            .iter()
            .map(|(name, value)| {
                let value = match value.to_str() {
                    Ok(v) => v.to_string(),
                    Err(_) => String::from_utf8_lossy(value.as_bytes()).into_owned(),
                };
                (name.as_str(), value)
            })
            .collect();
        self.filter_outbound(owned.iter().map(|(n, v)| (*n, v.as_str())))
    }

    fn filter<'a, I, F>(&self, pairs: I, mut inspect: F) -> HeaderSet
    where
        I: IntoIterator<Item = (&'a str, &'a str)>,
        F: FnMut(&str, &str),
    {
        let mut headers = HeaderSet::new();
        for (name, value) in pairs {
            inspect(name, value);
            if self.is_hop_by_hop(name) {
                debug!("ignoring hop-by-hop header \"{}\"", name);
                continue;
            }
            headers.append(name, value);
        }
        headers
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use hyper::header::{HeaderValue, SET_COOKIE};

    #[test]
    fn test_all_hop_by_hop_headers_dropped_any_case() {
        let processor = HeaderProcessor::default();
        let lower: Vec<String> = HOP_BY_HOP.iter().map(|h| h.to_lowercase()).collect();
        let upper: Vec<String> = HOP_BY_HOP.iter().map(|h| h.to_uppercase()).collect();

        let mut pairs: Vec<(&str, &str)> = Vec::new();
        for name in HOP_BY_HOP {
            pairs.push((name, "x"));
        }
        for name in lower.iter().chain(upper.iter()) {
            pairs.push((name.as_str(), "x"));
        }
        pairs.push(("Accept", "*/*"));

        let inbound = processor.extract_inbound(pairs.iter().copied());
        assert_eq!(inbound.headers.len(), 1);
        assert_eq!(inbound.headers.get("accept"), Some("*/*"));

        let outbound = processor.filter_outbound(pairs.iter().copied());
        assert_eq!(outbound.len(), 1);
    }

    #[test]
    fn test_session_token_captured_and_stripped() {
        let processor = HeaderProcessor::default();
        let inbound = processor.extract_inbound([
            ("Host", "example.com"),
            ("x-session", "abc"),
            ("Accept", "text/html"),
        ]);
        assert_eq!(inbound.session_token.as_deref(), Some("abc"));
        assert!(!inbound.headers.contains("X-Session"));
        assert_eq!(inbound.headers.len(), 2);
    }

    #[test]
    fn test_empty_session_token_is_no_affinity() {
        let processor = HeaderProcessor::default();
        let inbound = processor.extract_inbound([("X-Session", "  ")]);
        assert!(inbound.session_token.is_none());
        assert!(inbound.headers.is_empty());
    }

    #[test]
    fn test_last_session_header_wins() {
        let processor = HeaderProcessor::default();
        let inbound = processor.extract_inbound([("X-Session", "one"), ("X-Session", "two")]);
        assert_eq!(inbound.session_token.as_deref(), Some("two"));
    }

    #[test]
    fn test_custom_session_header() {
        let processor = HeaderProcessor::new("X-Circuit-Key");
        let inbound =
            processor.extract_inbound([("X-Circuit-Key", "k1"), ("X-Session", "ignored")]);
        assert_eq!(inbound.session_token.as_deref(), Some("k1"));
        assert!(inbound.headers.is_empty());
    }

    #[test]
    fn test_repeated_headers_keep_all_values_in_order() {
        let processor = HeaderProcessor::default();
        let headers = processor.filter_outbound([
            ("Set-Cookie", "a=1"),
            ("Content-Type", "text/plain"),
            ("Set-Cookie", "b=2"),
        ]);
        assert_eq!(headers.get_all("set-cookie"), vec!["a=1", "b=2"]);
        let flattened: Vec<(&str, &str)> = headers.iter().collect();
        assert_eq!(
            flattened,
            vec![
                ("Set-Cookie", "a=1"),
                ("Set-Cookie", "b=2"),
                ("Content-Type", "text/plain"),
            ]
        );
    }

    #[test]
    fn test_raw_casing_preserved() {
        let processor = HeaderProcessor::default();
        let headers = processor.filter_outbound([("X-Custom-ID", "1"), ("x-custom-id", "2")]);
        let names: Vec<&str> = headers.iter().map(|(n, _)| n).collect();
        assert_eq!(names, vec!["X-Custom-ID", "x-custom-id"]);
    }

    #[test]
    fn test_header_map_fallback_filters_identically() {
        let processor = HeaderProcessor::default();
        let mut map = HeaderMap::new();
        map.append(SET_COOKIE, HeaderValue::from_static("a=1"));
        map.append(SET_COOKIE, HeaderValue::from_static("b=2"));
        map.append("transfer-encoding", HeaderValue::from_static("chunked"));
        map.append("connection", HeaderValue::from_static("keep-alive"));
        map.append("content-type", HeaderValue::from_static("text/html"));

        let headers = processor.filter_header_map(&map);
        assert_eq!(headers.get_all("Set-Cookie"), vec!["a=1", "b=2"]);
        assert!(!headers.contains("transfer-encoding"));
        assert!(!headers.contains("connection"));
        assert_eq!(headers.get("content-type"), Some("text/html"));
    }

    #[test]
    fn test_header_set_remove() {
        let mut headers = HeaderSet::new();
        headers.append("Host", "a");
        headers.append("Accept", "b");
        headers.remove("host");
        assert_eq!(headers.len(), 1);
        assert!(!headers.contains("Host"));
    }
}
