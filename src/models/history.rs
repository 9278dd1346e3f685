//! History records: one row per HTTP(S) exchange.
//!
//! Raw messages are stored verbatim next to the structured columns. The
//! HTTP version string in the raw form is a placeholder; nothing may parse
//! semantics out of it.

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use url::Url;
use uuid::Uuid;

/// Where an exchange came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HistorySource {
    Crawler,
    Scanner,
    Proxy,
    Hijack,
    Repeater,
}

impl HistorySource {
    pub fn as_str(&self) -> &'static str {
        match self {
            HistorySource::Crawler => "crawler",
            HistorySource::Scanner => "scanner",
            HistorySource::Proxy => "proxy",
            HistorySource::Hijack => "hijack",
            HistorySource::Repeater => "repeater",
        }
    }
}

impl fmt::Display for HistorySource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for HistorySource {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "crawler" => Ok(HistorySource::Crawler),
            "scanner" => Ok(HistorySource::Scanner),
            "proxy" => Ok(HistorySource::Proxy),
            "hijack" => Ok(HistorySource::Hijack),
            "repeater" => Ok(HistorySource::Repeater),
            other => Err(format!("unknown history source: {other}")),
        }
    }
}

/// One persisted HTTP(S) exchange.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct History {
    /// Assigned by the store on save; 0 until then.
    pub id: i64,
    pub workspace_id: i32,
    pub task_id: Option<Uuid>,
    pub scan_id: Option<Uuid>,
    pub job_id: Option<Uuid>,
    pub playground_session_id: Option<Uuid>,
    pub method: String,
    pub url: String,
    /// Number of path segments in the URL.
    pub depth: i32,
    /// 0 is the sentinel for exchanges that never produced a response.
    pub status_code: u16,
    pub request_body_size: i64,
    pub request_content_type: Option<String>,
    pub response_content_type: Option<String>,
    pub raw_request: Vec<u8>,
    pub raw_response: Vec<u8>,
    /// Placeholder version string, e.g. "HTTP/1.1".
    pub proto: String,
    pub source: HistorySource,
    pub note: Option<String>,
    pub evaluated: bool,
    pub duration_ms: i64,
    pub created_at: DateTime<Utc>,
}

impl History {
    pub fn new(workspace_id: i32, method: &str, url: &str, source: HistorySource) -> Self {
        Self {
            id: 0,
            workspace_id,
            task_id: None,
            scan_id: None,
            job_id: None,
            playground_session_id: None,
            method: method.to_string(),
            url: url.to_string(),
            depth: url_depth(url),
            status_code: 0,
            request_body_size: 0,
            request_content_type: None,
            response_content_type: None,
            raw_request: Vec::new(),
            raw_response: Vec::new(),
            proto: "HTTP/1.1".to_string(),
            source,
            note: None,
            evaluated: false,
            duration_ms: 0,
            created_at: Utc::now(),
        }
    }

    pub fn with_duration(mut self, duration: Duration) -> Self {
        self.duration_ms = duration.as_millis() as i64;
        self
    }

    /// Headers parsed back out of the raw response. Empty when no response
    /// was captured.
    pub fn response_headers(&self) -> Vec<(String, String)> {
        parse_raw_headers(&self.raw_response)
    }

    /// Headers parsed back out of the raw request.
    pub fn request_headers(&self) -> Vec<(String, String)> {
        parse_raw_headers(&self.raw_request)
    }

    /// First matching response header value, case-insensitive.
    pub fn response_header(&self, name: &str) -> Option<String> {
        self.response_headers()
            .into_iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v)
    }

    /// First matching request header value, case-insensitive.
    pub fn request_header(&self, name: &str) -> Option<String> {
        self.request_headers()
            .into_iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v)
    }

    /// Body section of the raw response.
    pub fn response_body(&self) -> &[u8] {
        body_of(&self.raw_response)
    }
}

/// Number of path segments in a URL; 0 when the URL does not parse.
pub fn url_depth(raw: &str) -> i32 {
    let Ok(url) = Url::parse(raw) else { return 0 };
    url.path_segments()
        .map(|segments| segments.filter(|s| !s.is_empty()).count() as i32)
        .unwrap_or(0)
}

/// Build raw request bytes:
/// `METHOD SP REQUEST-TARGET SP HTTP/1.1 CRLF (HEADER CRLF)* CRLF BODY?`
pub fn build_raw_request(
    method: &str,
    url: &Url,
    headers: &[(String, String)],
    body: &[u8],
) -> Vec<u8> {
    let mut target = url.path().to_string();
    if let Some(query) = url.query() {
        target.push('?');
        target.push_str(query);
    }

    let mut raw = format!("{method} {target} HTTP/1.1\r\n").into_bytes();
    let has_host = headers.iter().any(|(k, _)| k.eq_ignore_ascii_case("host"));
    if !has_host {
        if let Some(host) = url.host_str() {
            let line = match url.port() {
                Some(port) => format!("Host: {host}:{port}\r\n"),
                None => format!("Host: {host}\r\n"),
            };
            raw.extend_from_slice(line.as_bytes());
        }
    }
    for (name, value) in headers {
        raw.extend_from_slice(format!("{name}: {value}\r\n").as_bytes());
    }
    raw.extend_from_slice(b"\r\n");
    raw.extend_from_slice(body);
    raw
}

/// Build raw response bytes:
/// `HTTP/1.1 SP STATUS SP REASON CRLF (HEADER CRLF)* CRLF BODY?`
pub fn build_raw_response(
    status: u16,
    reason: &str,
    headers: &[(String, String)],
    body: &[u8],
) -> Vec<u8> {
    let mut raw = format!("HTTP/1.1 {status} {reason}\r\n").into_bytes();
    for (name, value) in headers {
        raw.extend_from_slice(format!("{name}: {value}\r\n").as_bytes());
    }
    raw.extend_from_slice(b"\r\n");
    raw.extend_from_slice(body);
    raw
}

fn parse_raw_headers(raw: &[u8]) -> Vec<(String, String)> {
    let text = String::from_utf8_lossy(raw);
    let mut headers = Vec::new();
    // Skip the request/status line, stop at the blank separator.
    for line in text.split("\r\n").skip(1) {
        if line.is_empty() {
            break;
        }
        if let Some((name, value)) = line.split_once(':') {
            headers.push((name.trim().to_string(), value.trim().to_string()));
        }
    }
    headers
}

fn body_of(raw: &[u8]) -> &[u8] {
    let separator = b"\r\n\r\n";
    raw.windows(separator.len())
        .position(|w| w == separator)
        .map(|pos| &raw[pos + separator.len()..])
        .unwrap_or(&[])
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn raw_request_format() {
        let url = Url::parse("http://example.test/a/b?x=1").unwrap();
        let headers = vec![("Accept".to_string(), "*/*".to_string())];
        let raw = build_raw_request("GET", &url, &headers, b"");
        let text = String::from_utf8(raw).unwrap();
        assert_eq!(
            text,
            "GET /a/b?x=1 HTTP/1.1\r\nHost: example.test\r\nAccept: */*\r\n\r\n"
        );
    }

    #[test]
    fn raw_request_preserves_body() {
        let url = Url::parse("https://example.test/submit").unwrap();
        let raw = build_raw_request("POST", &url, &[], b"a=1&b=2");
        assert!(raw.ends_with(b"\r\n\r\na=1&b=2"));
        assert!(raw.starts_with(b"POST /submit HTTP/1.1\r\n"));
    }

    #[test]
    fn raw_response_format_and_body() {
        let headers = vec![("Content-Type".to_string(), "text/html".to_string())];
        let raw = build_raw_response(200, "OK", &headers, b"<html></html>");
        assert!(raw.starts_with(b"HTTP/1.1 200 OK\r\n"));
        assert_eq!(body_of(&raw), b"<html></html>");
    }

    #[test]
    fn header_lookup_is_case_insensitive() {
        let mut history = History::new(1, "GET", "http://example.test/", HistorySource::Crawler);
        history.raw_response = build_raw_response(
            200,
            "OK",
            &[("X-Frame-Options".to_string(), "DENY".to_string())],
            b"",
        );
        assert_eq!(
            history.response_header("x-frame-options").as_deref(),
            Some("DENY")
        );
        assert_eq!(history.response_header("content-type"), None);
    }

    #[test]
    fn depth_counts_path_segments() {
        assert_eq!(url_depth("http://example.test/"), 0);
        assert_eq!(url_depth("http://example.test/a"), 1);
        assert_eq!(url_depth("http://example.test/a/b/c?q=1"), 3);
        assert_eq!(url_depth("not a url"), 0);
    }
}
