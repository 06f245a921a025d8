//! Hand-rolled HTTP/1.1 framing.
//!
//! The proxy speaks wire-level HTTP itself: responses are assembled
//! here, requests are parsed line by line in the connection handler.
//! Range responses deliberately use `200 OK` plus a `Content-Range`
//! header (not `206 Partial Content`) for compatibility with the
//! package clients this proxy serves.

use chrono::Utc;

/// Value of the `Server` header on every response.
pub const SERVER_NAME: &str = "cpcache";

/// Raw interim response for `Expect: 100-continue`.
pub const CONTINUE_RESPONSE: &str = "HTTP/1.1 100 Continue\r\n\r\n";

/// Response status lines the proxy emits.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Status {
    /// 200 OK
    Ok,
    /// 301 Moved Permanently
    MovedPermanently,
    /// 403 Forbidden
    Forbidden,
    /// 404 Not Found
    NotFound,
    /// 413 Payload Too Large
    PayloadTooLarge,
    /// 416 Range Not Satisfiable
    RangeNotSatisfiable,
    /// 500 Internal Server Error
    InternalServerError,
    /// 501 Not Implemented
    NotImplemented,
}

impl Status {
    fn line(self) -> &'static str {
        match self {
            Status::Ok => "200 OK",
            Status::MovedPermanently => "301 Moved Permanently",
            Status::Forbidden => "403 Forbidden",
            Status::NotFound => "404 Not Found",
            Status::PayloadTooLarge => "413 Payload Too Large",
            Status::RangeNotSatisfiable => "416 Range Not Satisfiable",
            Status::InternalServerError => "500 Internal Server Error",
            Status::NotImplemented => "501 Not Implemented",
        }
    }
}

/// Builder for a response head. Every rendered head carries the
/// `Server`, `Date` and `Connection: close` headers.
#[derive(Debug)]
pub struct ResponseHead {
    status: Status,
    headers: Vec<(String, String)>,
}

impl ResponseHead {
    pub fn new(status: Status) -> Self {
        Self {
            status,
            headers: Vec::new(),
        }
    }

    pub fn header(mut self, name: &str, value: impl Into<String>) -> Self {
        self.headers.push((name.to_string(), value.into()));
        self
    }

    pub fn content_length(self, length: u64) -> Self {
        self.header("Content-Length", length.to_string())
    }

    pub fn render(&self) -> String {
        let mut head = String::with_capacity(256);
        head.push_str("HTTP/1.1 ");
        head.push_str(self.status.line());
        head.push_str("\r\n");
        head.push_str("Server: ");
        head.push_str(SERVER_NAME);
        head.push_str("\r\n");
        head.push_str("Date: ");
        head.push_str(&http_date());
        head.push_str("\r\n");
        head.push_str("Connection: close\r\n");
        for (name, value) in &self.headers {
            head.push_str(name);
            head.push_str(": ");
            head.push_str(value);
            head.push_str("\r\n");
        }
        head.push_str("\r\n");
        head
    }
}

/// Current time in RFC 1123 form, as required for the `Date` header.
pub fn http_date() -> String {
    Utc::now().format("%a, %d %b %Y %H:%M:%S GMT").to_string()
}

/// Request methods the proxy understands.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Method {
    Get,
    Post,
}

/// Parses an HTTP/1.x request line into method and target. Unknown
/// methods and malformed lines yield `None`.
pub fn parse_request_line(line: &str) -> Option<(Method, String)> {
    let mut parts = line.split_whitespace();
    let method = match parts.next()? {
        "GET" => Method::Get,
        "POST" => Method::Post,
        _ => return None,
    };
    let target = parts.next()?;
    let version = parts.next()?;
    if !version.starts_with("HTTP/") || parts.next().is_some() {
        return None;
    }
    Some((method, target.to_string()))
}

/// Parses one header field line into a lowercased name and trimmed
/// value.
pub fn parse_header_field(line: &str) -> Option<(String, String)> {
    let (name, value) = line.split_once(':')?;
    let name = name.trim();
    if name.is_empty() {
        return None;
    }
    Some((name.to_ascii_lowercase(), value.trim().to_string()))
}
