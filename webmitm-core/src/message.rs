//! HTTP/1.x message framing: start lines, header blocks, and the
//! request/response records a session mutates through hooks.
//!
//! Duplicate headers are preserved in order and written back verbatim;
//! only the handful of semantically-recognised names are lifted into
//! typed fields.

use std::fmt;

use crate::ProxyError;
use crate::stream::FramedStream;

const MAX_HEADERS: usize = 256;

/// HTTP version as it appears on the wire (`HTTP/<major>.<minor>`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct HttpVersion {
    pub major: u8,
    pub minor: u8,
}

impl HttpVersion {
    pub const V10: HttpVersion = HttpVersion { major: 1, minor: 0 };
    pub const V11: HttpVersion = HttpVersion { major: 1, minor: 1 };

    /// Parses `HTTP/<digit>.<digit>`.
    pub fn parse(token: &str) -> Option<HttpVersion> {
        let rest = token.strip_prefix("HTTP/")?;
        let mut digits = rest.bytes();
        let major = digits.next().filter(u8::is_ascii_digit)? - b'0';
        if digits.next() != Some(b'.') {
            return None;
        }
        let minor = digits.next().filter(u8::is_ascii_digit)? - b'0';
        if digits.next().is_some() {
            return None;
        }
        Some(HttpVersion { major, minor })
    }
}

impl fmt::Display for HttpVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "HTTP/{}.{}", self.major, self.minor)
    }
}

/// Ordered header collection. Lookups are case-insensitive; writes
/// preserve the original casing and ordering.
#[derive(Debug, Clone, Default)]
pub struct Headers {
    entries: Vec<(String, String)>,
}

impl Headers {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.entries.push((name.into(), value.into()));
    }

    /// First value for `name`, if any.
    pub fn get(&self, name: &str) -> Option<&str> {
        self.entries
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    pub fn get_all<'a>(&'a self, name: &'a str) -> impl Iterator<Item = &'a str> {
        self.entries
            .iter()
            .filter(move |(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    /// Replace every occurrence of `name` with a single entry.
    pub fn set(&mut self, name: &str, value: impl Into<String>) {
        let value = value.into();
        let mut replaced = false;
        self.entries.retain_mut(|(n, v)| {
            if n.eq_ignore_ascii_case(name) {
                if replaced {
                    return false;
                }
                *v = value.clone();
                replaced = true;
            }
            true
        });
        if !replaced {
            self.entries.push((name.to_string(), value));
        }
    }

    /// Remove every occurrence of `name`. Returns whether any existed.
    pub fn remove(&mut self, name: &str) -> bool {
        let before = self.entries.len();
        self.entries.retain(|(n, _)| !n.eq_ignore_ascii_case(name));
        before != self.entries.len()
    }

    /// Whether a comma-separated header value contains `token`
    /// (case-insensitive). Used for `Connection` and `Transfer-Encoding`.
    pub fn contains_token(&self, name: &str, token: &str) -> bool {
        self.get_all(name)
            .flat_map(|v| v.split(','))
            .any(|t| t.trim().eq_ignore_ascii_case(token))
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.entries.iter().map(|(n, v)| (n.as_str(), v.as_str()))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Append the canonical `Name: Value\r\n` lines plus the terminating
    /// blank line.
    pub fn write_block(&self, out: &mut Vec<u8>) {
        for (name, value) in &self.entries {
            out.extend_from_slice(name.as_bytes());
            out.extend_from_slice(b": ");
            out.extend_from_slice(value.as_bytes());
            out.extend_from_slice(b"\r\n");
        }
        out.extend_from_slice(b"\r\n");
    }

    /// Read a header block from the stream. Continuation lines (leading
    /// whitespace) are folded into the previous header's value.
    pub async fn read_block(stream: &mut FramedStream) -> Result<Headers, ProxyError> {
        let mut headers = Headers::new();
        loop {
            let line = stream.read_line().await?;
            if line.is_empty() {
                return Ok(headers);
            }
            if headers.entries.len() >= MAX_HEADERS {
                return Err(ProxyError::MalformedFraming("too many headers"));
            }
            if line.starts_with(' ') || line.starts_with('\t') {
                match headers.entries.last_mut() {
                    Some((_, value)) => {
                        value.push(' ');
                        value.push_str(line.trim());
                    }
                    None => {
                        return Err(ProxyError::MalformedFraming(
                            "continuation line before any header",
                        ));
                    }
                }
                continue;
            }
            let colon = line
                .find(':')
                .ok_or(ProxyError::MalformedFraming("header line without colon"))?;
            let name = line[..colon].trim();
            if name.is_empty() {
                return Err(ProxyError::MalformedFraming("empty header name"));
            }
            let value = line[colon + 1..].trim();
            headers.push(name, value);
        }
    }
}

/// Parses a request start line into `(method, target, version)`.
///
/// The method must be ASCII uppercase letters only; the version must
/// match `HTTP/<digit>.<digit>`.
pub fn parse_request_line(line: &str) -> Result<(String, String, HttpVersion), ProxyError> {
    let mut parts = line.split(' ').filter(|p| !p.is_empty());
    let method = parts
        .next()
        .ok_or(ProxyError::MalformedFraming("empty request line"))?;
    if method.is_empty() || !method.bytes().all(|b| b.is_ascii_uppercase()) {
        return Err(ProxyError::MalformedFraming("invalid request method"));
    }
    let target = parts
        .next()
        .ok_or(ProxyError::MalformedFraming("request line without target"))?;
    let version = parts
        .next()
        .and_then(HttpVersion::parse)
        .ok_or(ProxyError::MalformedFraming("invalid HTTP version"))?;
    if parts.next().is_some() {
        return Err(ProxyError::MalformedFraming("trailing request line tokens"));
    }
    Ok((method.to_string(), target.to_string(), version))
}

/// Parses a status line into `(version, status, reason)`.
pub fn parse_status_line(line: &str) -> Result<(HttpVersion, u16, String), ProxyError> {
    let mut parts = line.splitn(3, ' ');
    let version = parts
        .next()
        .and_then(HttpVersion::parse)
        .ok_or(ProxyError::MalformedFraming("invalid status line version"))?;
    let status = parts
        .next()
        .and_then(|s| s.parse::<u16>().ok())
        .filter(|s| (100..1000).contains(s))
        .ok_or(ProxyError::MalformedFraming("invalid status code"))?;
    let reason = parts.next().unwrap_or("").to_string();
    Ok((version, status, reason))
}

/// The pieces of an effective absolute URI the proxy routes on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TargetUri {
    pub tls: bool,
    pub host: String,
    pub port: u16,
    pub path: String,
}

impl TargetUri {
    /// Parses `http://host[:port]/path` or `https://host[:port]/path`.
    pub fn parse_absolute(url: &str) -> Option<TargetUri> {
        let (tls, rest) = if let Some(rest) = url.strip_prefix("http://") {
            (false, rest)
        } else if let Some(rest) = url.strip_prefix("https://") {
            (true, rest)
        } else {
            return None;
        };
        let (authority, path) = match rest.find('/') {
            Some(pos) => (&rest[..pos], &rest[pos..]),
            None => (rest, "/"),
        };
        let (host, port) = split_authority(authority, if tls { 443 } else { 80 })?;
        Some(TargetUri {
            tls,
            host,
            port,
            path: path.to_string(),
        })
    }

    /// Parses a `host:port` CONNECT target. The port is mandatory.
    pub fn parse_authority(target: &str) -> Option<(String, u16)> {
        let colon = target.rfind(':')?;
        let port = target[colon + 1..].parse::<u16>().ok()?;
        let host = &target[..colon];
        if host.is_empty() {
            return None;
        }
        Some((host.to_string(), port))
    }

    pub fn authority(&self) -> String {
        let default = if self.tls { 443 } else { 80 };
        if self.port == default {
            self.host.clone()
        } else {
            format!("{}:{}", self.host, self.port)
        }
    }

    pub fn absolute(&self) -> String {
        let scheme = if self.tls { "https" } else { "http" };
        format!("{}://{}{}", scheme, self.authority(), self.path)
    }
}

/// Split `host[:port]`, falling back to `default_port`.
pub(crate) fn split_authority(authority: &str, default_port: u16) -> Option<(String, u16)> {
    if authority.is_empty() {
        return None;
    }
    match authority.rfind(':') {
        Some(pos) if authority[pos + 1..].bytes().all(|b| b.is_ascii_digit()) => {
            let port = authority[pos + 1..].parse::<u16>().ok()?;
            Some((authority[..pos].to_string(), port))
        }
        _ => Some((authority.to_string(), default_port)),
    }
}

/// One client request as seen (and mutated) by hooks.
#[derive(Debug, Clone)]
pub struct Request {
    pub method: String,
    /// The target exactly as it appeared on the request line.
    pub original_url: String,
    /// The effective absolute URI the exchange routes on.
    pub target: TargetUri,
    pub version: HttpVersion,
    pub headers: Headers,
    /// Present only when a hook (or auth pre-buffering) has read the body.
    pub body: Option<Vec<u8>>,
    pub content_length: Option<u64>,
    pub chunked: bool,
    pub expect_continue: bool,
    pub upgrade_websocket: bool,
    /// Hook-set: abandon the exchange without contacting the origin.
    pub cancel: bool,
    /// Once true the start line and headers are frozen.
    pub locked: bool,
    /// Hook-set upstream proxy override, as "host:port".
    pub upstream_proxy: Option<String>,
}

impl Request {
    pub fn new(
        method: String,
        original_url: String,
        target: TargetUri,
        version: HttpVersion,
        headers: Headers,
    ) -> Self {
        let mut request = Request {
            method,
            original_url,
            target,
            version,
            headers,
            body: None,
            content_length: None,
            chunked: false,
            expect_continue: false,
            upgrade_websocket: false,
            cancel: false,
            locked: false,
            upstream_proxy: None,
        };
        request.absorb_semantics();
        request
    }

    /// Lift the recognised headers into typed fields.
    fn absorb_semantics(&mut self) {
        self.chunked = self.headers.contains_token("Transfer-Encoding", "chunked");
        self.content_length = self
            .headers
            .get("Content-Length")
            .and_then(|v| v.trim().parse::<u64>().ok());
        self.expect_continue = self
            .headers
            .get("Expect")
            .is_some_and(|v| v.trim().eq_ignore_ascii_case("100-continue"));
        self.upgrade_websocket = self.headers.contains_token("Upgrade", "websocket");
    }

    /// Re-derive semantic fields after a hook edited the header set.
    pub fn refresh_semantics(&mut self) {
        self.absorb_semantics();
    }

    pub fn host_header(&self) -> Option<&str> {
        self.headers.get("Host")
    }

    pub fn has_body(&self) -> bool {
        self.chunked || self.content_length.is_some_and(|n| n > 0) || self.body.is_some()
    }

    /// Serialise the start line and header block. `absolute_form` keeps
    /// the full URL on the request line (required when the next hop is an
    /// upstream HTTP proxy); otherwise origin-form is used.
    pub fn write_head(&self, absolute_form: bool) -> Vec<u8> {
        let target = if absolute_form {
            self.target.absolute()
        } else {
            self.target.path.clone()
        };
        let mut out = Vec::with_capacity(256);
        out.extend_from_slice(self.method.as_bytes());
        out.push(b' ');
        out.extend_from_slice(target.as_bytes());
        out.push(b' ');
        out.extend_from_slice(self.version.to_string().as_bytes());
        out.extend_from_slice(b"\r\n");
        self.headers.write_block(&mut out);
        out
    }
}

/// One origin response as seen (and mutated) by hooks.
#[derive(Debug, Clone)]
pub struct Response {
    pub version: HttpVersion,
    pub status: u16,
    pub reason: String,
    pub headers: Headers,
    /// Present only when a hook has read the body.
    pub body: Option<Vec<u8>>,
    pub content_length: Option<u64>,
    pub chunked: bool,
    pub keep_alive: bool,
    /// The origin answered the expectation with `100 Continue`.
    pub continue_received: bool,
    /// The origin answered the expectation with `417`.
    pub expectation_failed: bool,
    /// Once true the status line and headers are frozen.
    pub locked: bool,
    /// Hook-set: discard this response and re-send the request.
    pub re_request: bool,
}

impl Response {
    /// Read a status line and header block from an upstream connection.
    pub async fn read(stream: &mut FramedStream) -> Result<Response, ProxyError> {
        let line = stream.read_line().await?;
        if line.is_empty() {
            return Err(ProxyError::Exchange {
                context: "upstream closed before status line",
                source: Box::new(ProxyError::ClientAborted),
            });
        }
        let (version, status, reason) = parse_status_line(&line)?;
        let headers = Headers::read_block(stream).await?;
        let chunked = headers.contains_token("Transfer-Encoding", "chunked");
        let content_length = headers
            .get("Content-Length")
            .and_then(|v| v.trim().parse::<u64>().ok());
        Ok(Response {
            version,
            status,
            reason,
            headers,
            body: None,
            content_length,
            chunked,
            keep_alive: true,
            continue_received: false,
            expectation_failed: false,
            locked: false,
            re_request: false,
        })
    }

    pub fn is_informational(&self) -> bool {
        (100..200).contains(&self.status)
    }

    /// Statuses that never carry a body regardless of headers.
    pub fn is_bodyless(&self) -> bool {
        self.is_informational() || self.status == 204 || self.status == 304
    }

    /// Serialise the status line and header block.
    pub fn write_head(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(256);
        out.extend_from_slice(self.version.to_string().as_bytes());
        out.push(b' ');
        out.extend_from_slice(self.status.to_string().as_bytes());
        out.push(b' ');
        out.extend_from_slice(self.reason.as_bytes());
        out.extend_from_slice(b"\r\n");
        self.headers.write_block(&mut out);
        out
    }
}

/// Whether the client connection survives this exchange.
///
/// HTTP/1.1 defaults to keep-alive unless either side says `close`;
/// HTTP/1.0 defaults to close unless the response says `keep-alive`.
pub fn compute_keep_alive(request: &Request, response: &Response) -> bool {
    if request.headers.contains_token("Connection", "close")
        || response.headers.contains_token("Connection", "close")
    {
        return false;
    }
    if response.version == HttpVersion::V10 || request.version == HttpVersion::V10 {
        return response.headers.contains_token("Connection", "keep-alive");
    }
    // A response with neither length nor chunking is delimited by close
    if !response.is_bodyless()
        && !response.chunked
        && response.content_length.is_none()
        && response.body.is_none()
    {
        return false;
    }
    true
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncWriteExt;

    fn framed(data: &[u8]) -> FramedStream {
        let (client, mut server) = tokio::io::duplex(65536);
        let data = data.to_vec();
        tokio::spawn(async move {
            server.write_all(&data).await.unwrap();
            server.shutdown().await.unwrap();
        });
        FramedStream::new(Box::new(client), 8192)
    }

    #[test]
    fn request_line_parses() {
        let (method, target, version) =
            parse_request_line("GET http://example.test/hello HTTP/1.1").unwrap();
        assert_eq!(method, "GET");
        assert_eq!(target, "http://example.test/hello");
        assert_eq!(version, HttpVersion::V11);
    }

    #[test]
    fn request_line_rejects_lowercase_method() {
        assert!(parse_request_line("get / HTTP/1.1").is_err());
        assert!(parse_request_line("G3T / HTTP/1.1").is_err());
    }

    #[test]
    fn request_line_rejects_bad_version() {
        assert!(parse_request_line("GET / HTTP/11").is_err());
        assert!(parse_request_line("GET / FTP/1.1").is_err());
        assert!(parse_request_line("GET /").is_err());
    }

    #[test]
    fn status_line_parses() {
        let (version, status, reason) = parse_status_line("HTTP/1.1 200 OK").unwrap();
        assert_eq!(version, HttpVersion::V11);
        assert_eq!(status, 200);
        assert_eq!(reason, "OK");
    }

    #[test]
    fn status_line_reason_may_contain_spaces() {
        let (_, status, reason) = parse_status_line("HTTP/1.1 407 Proxy Authentication Required").unwrap();
        assert_eq!(status, 407);
        assert_eq!(reason, "Proxy Authentication Required");
    }

    #[tokio::test]
    async fn header_block_preserves_duplicates_in_order() {
        let mut stream = framed(b"Set-Cookie: a=1\r\nHost: h\r\nSet-Cookie: b=2\r\n\r\n");
        let headers = Headers::read_block(&mut stream).await.unwrap();
        let cookies: Vec<&str> = headers.get_all("set-cookie").collect();
        assert_eq!(cookies, vec!["a=1", "b=2"]);
        assert_eq!(headers.len(), 3);
    }

    #[tokio::test]
    async fn header_folding_joins_continuations() {
        let mut stream = framed(b"X-Long: first\r\n second\r\n\tthird\r\n\r\n");
        let headers = Headers::read_block(&mut stream).await.unwrap();
        assert_eq!(headers.get("X-Long"), Some("first second third"));
    }

    #[tokio::test]
    async fn header_without_colon_is_malformed() {
        let mut stream = framed(b"Bogus header line\r\n\r\n");
        assert!(matches!(
            Headers::read_block(&mut stream).await,
            Err(ProxyError::MalformedFraming(_))
        ));
    }

    #[test]
    fn absolute_uri_parses() {
        let uri = TargetUri::parse_absolute("http://example.test/hello").unwrap();
        assert!(!uri.tls);
        assert_eq!(uri.host, "example.test");
        assert_eq!(uri.port, 80);
        assert_eq!(uri.path, "/hello");

        let uri = TargetUri::parse_absolute("https://api.test:8443").unwrap();
        assert!(uri.tls);
        assert_eq!(uri.port, 8443);
        assert_eq!(uri.path, "/");
        assert_eq!(uri.absolute(), "https://api.test:8443/");
    }

    #[test]
    fn connect_authority_requires_port() {
        assert_eq!(
            TargetUri::parse_authority("api.test:443"),
            Some(("api.test".to_string(), 443))
        );
        assert_eq!(TargetUri::parse_authority("api.test"), None);
        assert_eq!(TargetUri::parse_authority(":443"), None);
    }

    #[test]
    fn request_semantics_lifted() {
        let mut headers = Headers::new();
        headers.push("Host", "h");
        headers.push("Content-Length", "3");
        headers.push("Expect", "100-continue");
        let request = Request::new(
            "PUT".into(),
            "/x".into(),
            TargetUri::parse_absolute("http://h/x").unwrap(),
            HttpVersion::V11,
            headers,
        );
        assert_eq!(request.content_length, Some(3));
        assert!(request.expect_continue);
        assert!(!request.chunked);
        assert!(request.has_body());
    }

    #[test]
    fn write_head_origin_vs_absolute_form() {
        let mut headers = Headers::new();
        headers.push("Host", "example.test");
        let request = Request::new(
            "GET".into(),
            "http://example.test/hello".into(),
            TargetUri::parse_absolute("http://example.test/hello").unwrap(),
            HttpVersion::V11,
            headers,
        );
        let origin = String::from_utf8(request.write_head(false)).unwrap();
        assert!(origin.starts_with("GET /hello HTTP/1.1\r\n"));
        let absolute = String::from_utf8(request.write_head(true)).unwrap();
        assert!(absolute.starts_with("GET http://example.test/hello HTTP/1.1\r\n"));
    }

    #[test]
    fn keep_alive_defaults_by_version() {
        let request = Request::new(
            "GET".into(),
            "/".into(),
            TargetUri::parse_absolute("http://h/").unwrap(),
            HttpVersion::V11,
            Headers::new(),
        );
        let mut response = Response {
            version: HttpVersion::V11,
            status: 200,
            reason: "OK".into(),
            headers: Headers::new(),
            body: None,
            content_length: Some(0),
            chunked: false,
            keep_alive: true,
            continue_received: false,
            expectation_failed: false,
            locked: false,
            re_request: false,
        };
        assert!(compute_keep_alive(&request, &response));

        response.headers.push("Connection", "close");
        assert!(!compute_keep_alive(&request, &response));

        response.headers = Headers::new();
        response.version = HttpVersion::V10;
        assert!(!compute_keep_alive(&request, &response));
        response.headers.push("Connection", "keep-alive");
        assert!(compute_keep_alive(&request, &response));
    }

    #[test]
    fn close_delimited_response_forces_close() {
        let request = Request::new(
            "GET".into(),
            "/".into(),
            TargetUri::parse_absolute("http://h/").unwrap(),
            HttpVersion::V11,
            Headers::new(),
        );
        let response = Response {
            version: HttpVersion::V11,
            status: 200,
            reason: "OK".into(),
            headers: Headers::new(),
            body: None,
            content_length: None,
            chunked: false,
            keep_alive: true,
            continue_received: false,
            expectation_failed: false,
            locked: false,
            re_request: false,
        };
        assert!(!compute_keep_alive(&request, &response));
    }
}
