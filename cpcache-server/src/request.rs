//! Extraction of the request headers the proxy cares about.

/// The subset of request headers the proxy understands, extracted from
/// the accumulated header fields once the blank line arrives.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct RequestHeaders {
    /// `Content-Length`, required for uploads.
    pub content_length: Option<u64>,
    /// Start offset from `Range: bytes=N-`. Closed and suffix ranges
    /// are not supported and parse as absent.
    pub range_start: Option<u64>,
    /// `Expect: 100-continue` was sent.
    pub expect_continue: bool,
    /// Hex-encoded HMAC from `Authorization`.
    pub signature: Option<String>,
    /// Unix-seconds `Timestamp` accompanying the signature.
    pub timestamp: Option<u64>,
}

impl RequestHeaders {
    /// Extracts known headers from `(lowercased name, value)` fields.
    pub fn from_fields(fields: &[(String, String)]) -> Self {
        let mut headers = Self::default();
        for (name, value) in fields {
            match name.as_str() {
                "content-length" => headers.content_length = value.parse().ok(),
                "expect" => {
                    headers.expect_continue = value.eq_ignore_ascii_case("100-continue");
                }
                "range" => headers.range_start = parse_range_start(value),
                "authorization" => headers.signature = Some(value.clone()),
                "timestamp" => headers.timestamp = value.parse().ok(),
                _ => {}
            }
        }
        headers
    }
}

/// Parses `bytes=N-` into `N`. Anything else (closed ranges, suffix
/// ranges, multiple ranges, other units) is treated as no range at all.
fn parse_range_start(value: &str) -> Option<u64> {
    let spec = value.strip_prefix("bytes=")?;
    let (start, end) = spec.split_once('-')?;
    if !end.is_empty() {
        return None;
    }
    start.trim().parse().ok()
}
