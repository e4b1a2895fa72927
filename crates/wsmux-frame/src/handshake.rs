//! Opening handshakes carried inside AddChannel blocks.
//!
//! Requests and responses use HTTP/1.1 message-head syntax: a start line
//! followed by `Name: value` header lines, each ending in CRLF, and an
//! empty line. No body follows.

use std::fmt::Write as _;

use crate::error::{Result, WireError};

/// Ordered header list with case-insensitive names.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Headers {
    entries: Vec<(String, String)>,
}

impl Headers {
    pub fn new() -> Self {
        Self::default()
    }

    /// Value of the first header named `name`.
    pub fn get(&self, name: &str) -> Option<&str> {
        self.entries
            .iter()
            .find(|(key, _)| key.eq_ignore_ascii_case(name))
            .map(|(_, value)| value.as_str())
    }

    pub fn contains(&self, name: &str) -> bool {
        self.get(name).is_some()
    }

    /// Replace every header named `name` with a single entry.
    pub fn set(&mut self, name: impl Into<String>, value: impl Into<String>) {
        let name = name.into();
        let value = value.into();
        match self
            .entries
            .iter()
            .position(|(key, _)| key.eq_ignore_ascii_case(&name))
        {
            Some(index) => {
                self.entries[index].1 = value;
                let mut seen = false;
                self.entries.retain(|(key, _)| {
                    if !key.eq_ignore_ascii_case(&name) {
                        return true;
                    }
                    let keep = !seen;
                    seen = true;
                    keep
                });
            }
            None => self.entries.push((name, value)),
        }
    }

    /// Append without replacing existing entries.
    pub fn append(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.entries.push((name.into(), value.into()));
    }

    /// Remove every header named `name`; returns whether any was present.
    pub fn remove(&mut self, name: &str) -> bool {
        let before = self.entries.len();
        self.entries.retain(|(key, _)| !key.eq_ignore_ascii_case(name));
        self.entries.len() != before
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.entries
            .iter()
            .map(|(key, value)| (key.as_str(), value.as_str()))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Apply a delta: a header with an empty value is removed, any other
    /// header replaces the base value.
    pub fn apply_delta(&self, delta: &Headers) -> Headers {
        let mut merged = self.clone();
        for (name, value) in delta.iter() {
            if value.is_empty() {
                merged.remove(name);
            } else {
                merged.set(name, value);
            }
        }
        merged
    }

    fn write_to(&self, out: &mut String) {
        for (name, value) in self.iter() {
            let _ = write!(out, "{name}: {value}\r\n");
        }
    }
}

impl<K: Into<String>, V: Into<String>> FromIterator<(K, V)> for Headers {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        Self {
            entries: iter
                .into_iter()
                .map(|(key, value)| (key.into(), value.into()))
                .collect(),
        }
    }
}

/// Parsed request line and headers of an opening handshake.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestHead {
    pub method: String,
    pub path: String,
    pub headers: Headers,
}

impl RequestHead {
    pub fn new(method: impl Into<String>, path: impl Into<String>, headers: Headers) -> Self {
        Self {
            method: method.into(),
            path: path.into(),
            headers,
        }
    }

    /// Parse `METHOD PATH HTTP/1.1` followed by header lines.
    pub fn parse(text: &[u8]) -> Result<Self> {
        let (start, headers) = split_head(text)?;
        let mut parts = start.split(' ');
        let (Some(method), Some(path), Some(version), None) =
            (parts.next(), parts.next(), parts.next(), parts.next())
        else {
            return Err(malformed(format!("bad request line: {start:?}")));
        };
        if method.is_empty() || path.is_empty() {
            return Err(malformed(format!("bad request line: {start:?}")));
        }
        if version != "HTTP/1.1" {
            return Err(malformed(format!("unsupported HTTP version: {version:?}")));
        }
        Ok(Self {
            method: method.to_string(),
            path: path.to_string(),
            headers,
        })
    }

    pub fn encode(&self) -> String {
        let mut out = format!("{} {} HTTP/1.1\r\n", self.method, self.path);
        self.headers.write_to(&mut out);
        out.push_str("\r\n");
        out
    }
}

/// Status line and headers of an opening-handshake response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResponseHead {
    pub status: u16,
    pub reason: String,
    pub headers: Headers,
}

impl ResponseHead {
    /// `101 Switching Protocols` with `Connection: Upgrade`, plus `extra`.
    pub fn switching_protocols(extra: &Headers) -> Self {
        let mut headers = Headers::new();
        headers.append("Connection", "Upgrade");
        for (name, value) in extra.iter() {
            headers.append(name, value);
        }
        Self {
            status: 101,
            reason: "Switching Protocols".to_string(),
            headers,
        }
    }

    /// A rejection with the standard reason phrase for `status`.
    pub fn rejection(status: u16) -> Self {
        Self {
            status,
            reason: reason_phrase(status).to_string(),
            headers: Headers::new(),
        }
    }

    pub fn parse(text: &[u8]) -> Result<Self> {
        let (start, headers) = split_head(text)?;
        let mut parts = start.splitn(3, ' ');
        let (Some("HTTP/1.1"), Some(status), reason) = (parts.next(), parts.next(), parts.next())
        else {
            return Err(malformed(format!("bad status line: {start:?}")));
        };
        let status = status
            .parse::<u16>()
            .map_err(|_| malformed(format!("bad status code: {status:?}")))?;
        Ok(Self {
            status,
            reason: reason.unwrap_or_default().to_string(),
            headers,
        })
    }

    pub fn encode(&self) -> String {
        let mut out = format!("HTTP/1.1 {} {}\r\n", self.status, self.reason);
        self.headers.write_to(&mut out);
        out.push_str("\r\n");
        out
    }
}

/// Standard reason phrase for the statuses the engine emits.
pub fn reason_phrase(status: u16) -> &'static str {
    match status {
        101 => "Switching Protocols",
        400 => "Bad Request",
        403 => "Forbidden",
        404 => "Not Found",
        503 => "Service Unavailable",
        _ => "Error",
    }
}

/// Headers that delta-encoded AddChannelRequests are resolved against.
///
/// Also remembers whether a delta was already resolved since the last
/// update: a second delta in a row is ambiguous, since the peer may expect
/// it to build on the first one.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HandshakeBase {
    headers: Headers,
    resolved_since_update: bool,
}

impl HandshakeBase {
    pub fn new(headers: Headers) -> Self {
        Self {
            headers,
            resolved_since_update: false,
        }
    }

    pub fn headers(&self) -> &Headers {
        &self.headers
    }

    /// Replace the base, after an identity-encoded request was accepted.
    pub fn update(&mut self, headers: Headers) {
        self.headers = headers;
        self.resolved_since_update = false;
    }

    /// True when the next delta would follow another delta with no
    /// identity-encoded request in between.
    pub fn is_chained(&self) -> bool {
        self.resolved_since_update
    }

    pub fn resolve(&mut self, delta: &Headers) -> Headers {
        self.resolved_since_update = true;
        self.headers.apply_delta(delta)
    }
}

fn split_head(text: &[u8]) -> Result<(&str, Headers)> {
    let text = std::str::from_utf8(text).map_err(|_| malformed("handshake is not valid UTF-8"))?;
    let mut lines = text.split("\r\n");
    let start = lines
        .next()
        .filter(|line| !line.is_empty())
        .ok_or_else(|| malformed("empty handshake"))?;
    Ok((start, parse_header_lines(lines)?))
}

fn parse_header_lines<'a>(lines: impl Iterator<Item = &'a str>) -> Result<Headers> {
    let mut headers = Headers::new();
    let mut last: Option<(String, String)> = None;
    for line in lines {
        if line.is_empty() {
            break;
        }
        if line.starts_with([' ', '\t']) {
            let Some((_, value)) = last.as_mut() else {
                return Err(malformed("continuation line before any header"));
            };
            value.push(' ');
            value.push_str(line.trim());
            continue;
        }
        let (name, value) = line
            .split_once(':')
            .ok_or_else(|| malformed(format!("bad header line: {line:?}")))?;
        if name.is_empty() || name.contains([' ', '\t']) {
            return Err(malformed(format!("bad header name: {name:?}")));
        }
        if let Some((name, value)) = last.take() {
            headers.append(name, value);
        }
        last = Some((name.to_string(), value.trim().to_string()));
    }
    if let Some((name, value)) = last {
        headers.append(name, value);
    }
    Ok(headers)
}

fn malformed(message: impl Into<String>) -> WireError {
    WireError::MalformedHandshake(message.into())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_request() {
        let text = b"GET /chat HTTP/1.1\r\nHost: example.com\r\nOrigin: http://a\r\n\r\n";
        let request = RequestHead::parse(text).unwrap();
        assert_eq!(request.method, "GET");
        assert_eq!(request.path, "/chat");
        assert_eq!(request.headers.get("host"), Some("example.com"));
        assert_eq!(request.headers.get("ORIGIN"), Some("http://a"));
    }

    #[test]
    fn request_without_trailing_blank_line() {
        let request = RequestHead::parse(b"GET / HTTP/1.1\r\nHost: x").unwrap();
        assert_eq!(request.headers.get("Host"), Some("x"));
    }

    #[test]
    fn folded_header_values_are_joined() {
        let text = b"GET / HTTP/1.1\r\nX-Long: one\r\n  two\r\n\r\n";
        let request = RequestHead::parse(text).unwrap();
        assert_eq!(request.headers.get("x-long"), Some("one two"));
    }

    #[test]
    fn rejects_malformed_requests() {
        for text in [
            &b""[..],
            b"GET /\r\n\r\n",
            b"GET / HTTP/1.0\r\n\r\n",
            b"GET  / HTTP/1.1\r\n\r\n",
            b"GET / HTTP/1.1\r\nNoColon\r\n\r\n",
            b"GET / HTTP/1.1\r\n folded\r\n\r\n",
            b"\xff\xfe",
        ] {
            assert!(
                matches!(RequestHead::parse(text), Err(WireError::MalformedHandshake(_))),
                "{:?}",
                String::from_utf8_lossy(text)
            );
        }
    }

    #[test]
    fn request_encode_parse() {
        let headers: Headers = [("Host", "h"), ("Sec-WebSocket-Protocol", "chat")]
            .into_iter()
            .collect();
        let request = RequestHead::new("GET", "/a", headers);
        let text = request.encode();
        assert_eq!(
            text,
            "GET /a HTTP/1.1\r\nHost: h\r\nSec-WebSocket-Protocol: chat\r\n\r\n"
        );
        assert_eq!(RequestHead::parse(text.as_bytes()).unwrap(), request);
    }

    #[test]
    fn responses() {
        let extra: Headers = [("Sec-WebSocket-Protocol", "chat")].into_iter().collect();
        let accepted = ResponseHead::switching_protocols(&extra).encode();
        assert_eq!(
            accepted,
            "HTTP/1.1 101 Switching Protocols\r\nConnection: Upgrade\r\nSec-WebSocket-Protocol: chat\r\n\r\n"
        );
        assert_eq!(
            ResponseHead::rejection(503).encode(),
            "HTTP/1.1 503 Service Unavailable\r\n\r\n"
        );

        let parsed = ResponseHead::parse(accepted.as_bytes()).unwrap();
        assert_eq!(parsed.status, 101);
        assert_eq!(parsed.headers.get("connection"), Some("Upgrade"));
        assert!(ResponseHead::parse(b"HTTP/1.1 abc\r\n\r\n").is_err());
    }

    #[test]
    fn delta_replaces_and_deletes() {
        let base: Headers = [("Host", "h"), ("Origin", "o"), ("Cookie", "c")]
            .into_iter()
            .collect();
        let delta =
            RequestHead::parse(b"GET /b HTTP/1.1\r\norigin: p\r\nCookie:\r\nX-New: 1\r\n\r\n")
                .unwrap();

        let merged = base.apply_delta(&delta.headers);
        assert_eq!(merged.get("Host"), Some("h"));
        assert_eq!(merged.get("Origin"), Some("p"));
        assert!(!merged.contains("cookie"));
        assert_eq!(merged.get("x-new"), Some("1"));
        assert_eq!(merged.len(), 3);
    }

    #[test]
    fn handshake_base_tracks_updates() {
        let mut base = HandshakeBase::new([("Host", "first")].into_iter().collect());
        let delta: Headers = [("X", "1")].into_iter().collect();
        assert_eq!(base.resolve(&delta).get("host"), Some("first"));

        base.update([("Host", "second")].into_iter().collect());
        assert_eq!(base.resolve(&delta).get("host"), Some("second"));
        assert_eq!(base.headers().len(), 1);
    }

    #[test]
    fn back_to_back_deltas_are_flagged_until_the_next_update() {
        let mut base = HandshakeBase::new([("Host", "first")].into_iter().collect());
        let delta: Headers = [("X", "1")].into_iter().collect();
        assert!(!base.is_chained());

        base.resolve(&delta);
        assert!(base.is_chained());
        let second = base.resolve(&delta);
        assert_eq!(second.get("host"), Some("first"));
        assert_eq!(second.get("x"), Some("1"));
        assert!(base.is_chained());

        base.update([("Host", "second")].into_iter().collect());
        assert!(!base.is_chained());
    }

    #[test]
    fn set_collapses_duplicates() {
        let mut headers = Headers::new();
        headers.append("A", "1");
        headers.append("a", "2");
        headers.set("A", "3");
        assert_eq!(headers.len(), 1);
        assert_eq!(headers.get("a"), Some("3"));
        assert!(headers.remove("A"));
        assert!(!headers.remove("A"));
    }
}
