//! Minimal HTTP/1.1 framing for the telemetry and auth APIs.
//!
//! Requests always carry `Connection: close`, so a response is whatever the
//! peer sent before closing. The parser tolerates arbitrary header order,
//! bare `\n` line endings and chunked bodies.

use std::{collections::HashMap, fmt::Write as _};

use thiserror::Error;

const USER_AGENT: &str = concat!("lagwatch/", env!("CARGO_PKG_VERSION"));

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ParseError {
    #[error("response ended before the header block was complete")]
    Incomplete,
    #[error("malformed status line {0:?}")]
    BadStatusLine(String),
    #[error("body ended after {got} of {expected} bytes")]
    Truncated { expected: usize, got: usize },
    #[error("malformed chunked body")]
    BadChunk,
    #[error("no json payload in response body")]
    NoJsonPayload,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Method {
    Get,
    Post,
}

impl Method {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Get => "GET",
            Self::Post => "POST",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Request {
    method: Method,
    host: String,
    path: String,
    headers: Vec<(String, String)>,
    body: Vec<u8>,
}

impl Request {
    pub fn get(host: &str, path: impl Into<String>) -> Self {
        Self {
            method: Method::Get,
            host: host.to_string(),
            path: path.into(),
            headers: Vec::new(),
            body: Vec::new(),
        }
    }

    pub fn post(host: &str, path: impl Into<String>, content_type: &str, body: Vec<u8>) -> Self {
        Self {
            method: Method::Post,
            host: host.to_string(),
            path: path.into(),
            headers: vec![("Content-Type".to_string(), content_type.to_string())],
            body,
        }
    }

    pub fn bearer(mut self, token: &str) -> Self {
        self.headers
            .push(("Authorization".to_string(), format!("Bearer {token}")));
        self
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut head = String::with_capacity(256);
        let _ = write!(
            head,
            "{} {} HTTP/1.1\r\nHost: {}\r\nUser-Agent: {USER_AGENT}\r\nAccept: application/json\r\nConnection: close\r\n",
            self.method.as_str(),
            self.path,
            self.host
        );
        for (name, value) in &self.headers {
            let _ = write!(head, "{name}: {value}\r\n");
        }
        if self.method == Method::Post {
            let _ = write!(head, "Content-Length: {}\r\n", self.body.len());
        }
        head.push_str("\r\n");

        let mut bytes = head.into_bytes();
        bytes.extend_from_slice(&self.body);
        bytes
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Response {
    pub status: u16,
    headers: HashMap<String, String>,
    pub body: Vec<u8>,
}

impl Response {
    pub fn parse(raw: &[u8]) -> Result<Self, ParseError> {
        let (head, rest) = split_head(raw).ok_or(ParseError::Incomplete)?;
        let head = String::from_utf8_lossy(head);
        let mut lines = head.lines().map(|line| line.trim_end_matches('\r'));

        let status_line = lines
            .by_ref()
            .find(|line| !line.trim().is_empty())
            .ok_or(ParseError::Incomplete)?;
        let status = parse_status_line(status_line)?;

        let mut headers: HashMap<String, String> = HashMap::new();
        for line in lines {
            let Some((name, value)) = line.split_once(':') else {
                continue;
            };
            let name = name.trim().to_ascii_lowercase();
            let value = value.trim();
            headers
                .entry(name)
                .and_modify(|existing| {
                    existing.push_str(", ");
                    existing.push_str(value);
                })
                .or_insert_with(|| value.to_string());
        }

        let chunked = headers
            .get("transfer-encoding")
            .is_some_and(|value| value.to_ascii_lowercase().contains("chunked"));
        let body = if chunked {
            decode_chunked(rest)?
        } else {
            let declared = headers
                .get("content-length")
                .and_then(|value| value.parse::<usize>().ok());
            match declared {
                Some(len) if len > rest.len() => {
                    return Err(ParseError::Truncated {
                        expected: len,
                        got: rest.len(),
                    })
                }
                Some(len) => rest[..len].to_vec(),
                None => rest.to_vec(),
            }
        };

        Ok(Self {
            status,
            headers,
            body,
        })
    }

    /// Case-insensitive header lookup. Repeated headers are joined with `, `.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .get(&name.to_ascii_lowercase())
            .map(String::as_str)
    }

    pub fn json_payload(&self) -> Result<&[u8], ParseError> {
        locate_json(&self.body).ok_or(ParseError::NoJsonPayload)
    }
}

/// Returns the span from the first `{` or `[` to the last matching closer.
pub fn locate_json(body: &[u8]) -> Option<&[u8]> {
    let start = body.iter().position(|b| *b == b'{' || *b == b'[')?;
    let close = if body[start] == b'{' { b'}' } else { b']' };
    let end = body.iter().rposition(|b| *b == close)?;
    (end > start).then(|| &body[start..=end])
}

/// `application/x-www-form-urlencoded` value encoding.
pub fn form_encode(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    for byte in value.bytes() {
        match byte {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'_' | b'.' | b'~' => {
                out.push(char::from(byte));
            }
            _ => {
                let _ = write!(out, "%{byte:02X}");
            }
        }
    }
    out
}

fn split_head(raw: &[u8]) -> Option<(&[u8], &[u8])> {
    let crlf = find(raw, b"\r\n\r\n").map(|at| (at, 4));
    let lf = find(raw, b"\n\n").map(|at| (at, 2));
    let (at, len) = match (crlf, lf) {
        (Some(a), Some(b)) => {
            if a.0 <= b.0 {
                a
            } else {
                b
            }
        }
        (Some(a), None) => a,
        (None, Some(b)) => b,
        (None, None) => return None,
    };
    Some((&raw[..at], &raw[at + len..]))
}

fn parse_status_line(line: &str) -> Result<u16, ParseError> {
    let mut parts = line.split_whitespace();
    let version = parts.next().unwrap_or_default();
    if !version.starts_with("HTTP/") {
        return Err(ParseError::BadStatusLine(line.to_string()));
    }
    parts
        .next()
        .and_then(|code| code.parse::<u16>().ok())
        .filter(|code| (100..=599).contains(code))
        .ok_or_else(|| ParseError::BadStatusLine(line.to_string()))
}

fn decode_chunked(mut data: &[u8]) -> Result<Vec<u8>, ParseError> {
    let mut out = Vec::with_capacity(data.len());
    loop {
        let line_end = find(data, b"\n").ok_or(ParseError::BadChunk)?;
        let size_line = std::str::from_utf8(&data[..line_end]).map_err(|_| ParseError::BadChunk)?;
        let size_hex = size_line.split(';').next().unwrap_or_default().trim();
        let size = usize::from_str_radix(size_hex, 16).map_err(|_| ParseError::BadChunk)?;
        data = &data[line_end + 1..];

        if size == 0 {
            return Ok(out);
        }
        if data.len() < size {
            return Err(ParseError::BadChunk);
        }
        out.extend_from_slice(&data[..size]);
        data = &data[size..];
        data = data.strip_prefix(b"\r").unwrap_or(data);
        data = data.strip_prefix(b"\n").unwrap_or(data);
    }
}

fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack
        .windows(needle.len())
        .position(|window| window == needle)
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    #[test]
    fn header_order_does_not_matter() {
        let a = Response::parse(
            b"HTTP/1.1 200 OK\r\nContent-Type: application/json\r\nContent-Length: 2\r\nX-Trace: 1\r\n\r\n{}",
        )
        .unwrap();
        let b = Response::parse(
            b"HTTP/1.1 200 OK\r\nx-trace: 1\r\ncontent-length: 2\r\nCONTENT-TYPE: application/json\r\n\r\n{}",
        )
        .unwrap();

        assert_eq!(a, b);
        assert_eq!(a.status, 200);
        assert_eq!(a.header("Content-Type"), Some("application/json"));
        assert_eq!(a.header("x-missing"), None);
    }

    #[test]
    fn chunked_body_is_reassembled() {
        let raw = b"HTTP/1.1 200 OK\r\nTransfer-Encoding: chunked\r\n\r\n7\r\n{\"v\":1,\r\n12;ext=1\r\n\"ts\":\"2024-01-01\"}\r\n0\r\n\r\n";
        let response = Response::parse(raw).unwrap();

        assert_eq!(response.body, br#"{"v":1,"ts":"2024-01-01"}"#.to_vec());
    }

    #[test]
    fn truncated_chunk_is_rejected() {
        let raw = b"HTTP/1.1 200 OK\r\nTransfer-Encoding: chunked\r\n\r\n20\r\n{\"v\":1}";
        assert_eq!(Response::parse(raw), Err(ParseError::BadChunk));
    }

    #[test]
    fn bare_newlines_and_content_length_trim() {
        let response = Response::parse(b"HTTP/1.0 401 Unauthorized\nContent-Length: 4\n\nnopetrailing").unwrap();

        assert_eq!(response.status, 401);
        assert_eq!(response.body, b"nope".to_vec());
    }

    #[test]
    fn short_body_is_truncated() {
        let raw = b"HTTP/1.1 200 OK\r\nContent-Length: 40\r\n\r\n{\"value\":\"1709";
        assert_eq!(
            Response::parse(raw),
            Err(ParseError::Truncated {
                expected: 40,
                got: 14,
            })
        );
    }

    #[test]
    fn missing_header_terminator_is_incomplete() {
        assert_eq!(
            Response::parse(b"HTTP/1.1 200 OK\r\nContent-Length: 10"),
            Err(ParseError::Incomplete)
        );
        assert!(matches!(
            Response::parse(b"garbage\r\n\r\n"),
            Err(ParseError::BadStatusLine(_))
        ));
    }

    #[test]
    fn json_is_located_by_outer_delimiters() {
        assert_eq!(
            locate_json(b"\r\n  [{\"v\":1}]\r\n\r\n"),
            Some(&b"[{\"v\":1}]"[..])
        );
        assert_eq!(
            locate_json(b"junk {\"a\":{\"b\":2}} junk"),
            Some(&b"{\"a\":{\"b\":2}}"[..])
        );
        assert_eq!(locate_json(b"no payload"), None);
    }

    #[test]
    fn request_serialization() {
        let request = Request::post("auth.example", "/oauth/token", "application/x-www-form-urlencoded", b"a=1".to_vec())
            .bearer("abc");
        let text = String::from_utf8(request.to_bytes()).unwrap();

        assert!(text.starts_with("POST /oauth/token HTTP/1.1\r\nHost: auth.example\r\n"));
        assert!(text.contains("Connection: close\r\n"));
        assert!(text.contains("Authorization: Bearer abc\r\n"));
        assert!(text.ends_with("Content-Length: 3\r\n\r\na=1"));
    }

    #[test]
    fn form_encoding_escapes_reserved_bytes() {
        assert_eq!(form_encode("a+b/c=d e~"), "a%2Bb%2Fc%3Dd%20e~");
    }
}
