//! HTTP request/response model and HTTP/1.1 wire codec
//!
//! [`Request`] and [`Response`] are what consumers of the pipeline see. The
//! codec half of the module (`encode_request`, `parse_head`, `decode_chunked`)
//! is used by the transport to move them over a connection.

use crate::network::errors::FetchError;
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use std::time::Duration;
use url::{Host, Url};

/// Header mapping with case-insensitive, unique names
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Headers {
    entries: BTreeMap<String, String>,
}

impl Headers {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a header, replacing any existing value for the same name
    pub fn insert(&mut self, name: &str, value: impl Into<String>) -> Option<String> {
        self.entries.insert(name.to_ascii_lowercase(), value.into())
    }

    /// Insert a header, joining repeated names with `, `
    pub fn append(&mut self, name: &str, value: &str) {
        self.entries
            .entry(name.to_ascii_lowercase())
            .and_modify(|existing| {
                existing.push_str(", ");
                existing.push_str(value);
            })
            .or_insert_with(|| value.to_string());
    }

    pub fn get(&self, name: &str) -> Option<&str> {
        self.entries.get(&name.to_ascii_lowercase()).map(String::as_str)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.entries.contains_key(&name.to_ascii_lowercase())
    }

    pub fn remove(&mut self, name: &str) -> Option<String> {
        self.entries.remove(&name.to_ascii_lowercase())
    }

    /// Iterate as (lowercase name, value) in name order
    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.entries.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Approximate wire size of all headers
    pub fn byte_size(&self) -> usize {
        self.entries.iter().map(|(k, v)| k.len() + v.len() + 4).sum()
    }
}

impl<K: AsRef<str>, V: Into<String>> FromIterator<(K, V)> for Headers {
    fn from_iter<T: IntoIterator<Item = (K, V)>>(iter: T) -> Self {
        let mut headers = Headers::new();
        for (k, v) in iter {
            headers.insert(k.as_ref(), v);
        }
        headers
    }
}

/// HTTP methods
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum Method {
    #[default]
    Get,
    Post,
    Put,
    Delete,
    Head,
    Options,
    Patch,
}

impl Method {
    pub fn as_str(&self) -> &'static str {
        match self {
            Method::Get => "GET",
            Method::Post => "POST",
            Method::Put => "PUT",
            Method::Delete => "DELETE",
            Method::Head => "HEAD",
            Method::Options => "OPTIONS",
            Method::Patch => "PATCH",
        }
    }

    /// Only safe methods have their responses stored
    pub fn is_cacheable(&self) -> bool {
        matches!(self, Method::Get | Method::Head)
    }
}

impl fmt::Display for Method {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for Method {
    type Err = FetchError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "GET" => Ok(Method::Get),
            "POST" => Ok(Method::Post),
            "PUT" => Ok(Method::Put),
            "DELETE" => Ok(Method::Delete),
            "HEAD" => Ok(Method::Head),
            "OPTIONS" => Ok(Method::Options),
            "PATCH" => Ok(Method::Patch),
            other => Err(FetchError::protocol(format!("unsupported method {}", other))),
        }
    }
}

/// Per-fetch options supplied by the caller
#[derive(Debug, Clone)]
pub struct FetchOptions {
    pub method: Method,
    pub headers: Vec<(String, String)>,
    pub body: Option<Vec<u8>>,
    /// Consult the response cache before touching the network
    pub use_cache: bool,
    /// Store a cacheable response after a network fetch
    pub cache_response: bool,
    /// Force secure transport on or off; `None` follows the URL scheme
    pub use_secure_transport: Option<bool>,
}

impl Default for FetchOptions {
    fn default() -> Self {
        Self {
            method: Method::Get,
            headers: Vec::new(),
            body: None,
            use_cache: true,
            cache_response: true,
            use_secure_transport: None,
        }
    }
}

impl FetchOptions {
    pub fn new() -> Self {
        Self::default()
    }

    /// Options that bypass the response cache in both directions
    pub fn uncached() -> Self {
        Self {
            use_cache: false,
            cache_response: false,
            ..Default::default()
        }
    }

    pub fn method(mut self, method: Method) -> Self {
        self.method = method;
        self
    }

    pub fn header(mut self, name: &str, value: &str) -> Self {
        self.headers.push((name.to_string(), value.to_string()));
        self
    }

    pub fn body(mut self, body: Vec<u8>) -> Self {
        self.body = Some(body);
        self
    }

    pub fn use_cache(mut self, enabled: bool) -> Self {
        self.use_cache = enabled;
        self
    }

    pub fn cache_response(mut self, enabled: bool) -> Self {
        self.cache_response = enabled;
        self
    }

    pub fn secure(mut self, enabled: bool) -> Self {
        self.use_secure_transport = Some(enabled);
        self
    }
}

/// An HTTP request flowing through the pipeline.
///
/// Built with consuming setters, then handed to the pipeline by reference;
/// nothing mutates it afterwards.
#[derive(Debug, Clone, PartialEq)]
pub struct Request {
    method: Method,
    url: Url,
    host: String,
    headers: Headers,
    body: Option<Vec<u8>>,
    use_cache: bool,
    cache_response: bool,
    use_secure_transport: bool,
}

impl Request {
    /// Create a request; the URL must be absolute http(s) with a host
    pub fn new(method: Method, url: &str) -> Result<Self, FetchError> {
        let parsed = Url::parse(url).map_err(|e| FetchError::InvalidUrl {
            url: url.to_string(),
            reason: e.to_string(),
        })?;

        let secure = match parsed.scheme() {
            "http" => false,
            "https" => true,
            other => {
                return Err(FetchError::InvalidUrl {
                    url: url.to_string(),
                    reason: format!("unsupported scheme '{}'", other),
                })
            }
        };

        let host = match parsed.host() {
            Some(Host::Domain(domain)) => domain.to_ascii_lowercase(),
            Some(Host::Ipv4(addr)) => addr.to_string(),
            Some(Host::Ipv6(addr)) => addr.to_string(),
            None => {
                return Err(FetchError::InvalidUrl {
                    url: url.to_string(),
                    reason: "missing host".to_string(),
                })
            }
        };

        Ok(Self {
            method,
            url: parsed,
            host,
            headers: Headers::new(),
            body: None,
            use_cache: true,
            cache_response: true,
            use_secure_transport: secure,
        })
    }

    /// Create a GET request
    pub fn get(url: &str) -> Result<Self, FetchError> {
        Self::new(Method::Get, url)
    }

    /// Build a request from caller options
    pub fn from_options(url: &str, options: &FetchOptions) -> Result<Self, FetchError> {
        let mut request = Self::new(options.method, url)?;
        for (name, value) in &options.headers {
            request.headers.insert(name, value.clone());
        }
        request.body = options.body.clone();
        request.use_cache = options.use_cache;
        request.cache_response = options.cache_response;
        if let Some(secure) = options.use_secure_transport {
            request.use_secure_transport = secure;
        }
        Ok(request)
    }

    /// Add a header
    pub fn header(mut self, name: &str, value: &str) -> Self {
        self.headers.insert(name, value);
        self
    }

    /// Set the body
    pub fn body(mut self, data: Vec<u8>) -> Self {
        self.body = Some(data);
        self
    }

    pub fn with_cache(mut self, use_cache: bool, cache_response: bool) -> Self {
        self.use_cache = use_cache;
        self.cache_response = cache_response;
        self
    }

    pub fn method(&self) -> Method {
        self.method
    }

    pub fn url(&self) -> &Url {
        &self.url
    }

    /// Hostname (lowercase) or IP literal without brackets
    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn port(&self) -> u16 {
        self.url
            .port_or_known_default()
            .unwrap_or(if self.use_secure_transport { 443 } else { 80 })
    }

    pub fn headers(&self) -> &Headers {
        &self.headers
    }

    pub fn body_bytes(&self) -> Option<&[u8]> {
        self.body.as_deref()
    }

    pub fn use_cache(&self) -> bool {
        self.use_cache
    }

    pub fn cache_response(&self) -> bool {
        self.cache_response
    }

    pub fn is_secure(&self) -> bool {
        self.use_secure_transport
    }

    /// Path plus query, as sent on the request line
    pub fn target(&self) -> String {
        match self.url.query() {
            Some(query) => format!("{}?{}", self.url.path(), query),
            None => self.url.path().to_string(),
        }
    }
}

/// Status codes whose responses may be stored without explicit freshness
const CACHEABLE_STATUSES: &[u16] = &[200, 203, 204, 206, 300, 301, 308, 404, 405, 410, 414, 501];

/// HTTP response structure
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Response {
    status: u16,
    reason: String,
    headers: Headers,
    body: Vec<u8>,
    is_cacheable: bool,
}

impl Response {
    /// Create a response; cacheability is derived from status and headers
    pub fn new(status: u16, reason: impl Into<String>, headers: Headers, body: Vec<u8>) -> Self {
        let is_cacheable = CACHEABLE_STATUSES.contains(&status) && {
            let directives = CacheControl::parse(headers.get("cache-control"));
            !directives.no_store && !directives.private
        };
        Self {
            status,
            reason: reason.into(),
            headers,
            body,
            is_cacheable,
        }
    }

    /// Override the derived cacheability
    pub fn with_cacheable(mut self, cacheable: bool) -> Self {
        self.is_cacheable = cacheable;
        self
    }

    pub fn status(&self) -> u16 {
        self.status
    }

    pub fn reason(&self) -> &str {
        &self.reason
    }

    pub fn headers(&self) -> &Headers {
        &self.headers
    }

    pub fn body(&self) -> &[u8] {
        &self.body
    }

    pub fn into_body(self) -> Vec<u8> {
        self.body
    }

    /// Body decoded as UTF-8, lossy
    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }

    pub fn is_cacheable(&self) -> bool {
        self.is_cacheable
    }

    pub fn content_type(&self) -> Option<&str> {
        self.headers.get("content-type")
    }

    pub fn content_length(&self) -> Option<usize> {
        self.headers.get("content-length").and_then(|v| v.trim().parse().ok())
    }

    /// Check if response is successful (2xx)
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }

    /// Check if response is redirect (3xx)
    pub fn is_redirect(&self) -> bool {
        (300..400).contains(&self.status)
    }

    /// Check if response is client error (4xx)
    pub fn is_client_error(&self) -> bool {
        (400..500).contains(&self.status)
    }

    /// Check if response is server error (5xx)
    pub fn is_server_error(&self) -> bool {
        (500..600).contains(&self.status)
    }

    /// Turn 4xx/5xx responses into `FetchError::Status`
    pub fn error_for_status(self, url: &str) -> Result<Self, FetchError> {
        if self.is_client_error() || self.is_server_error() {
            Err(FetchError::Status {
                status: self.status,
                url: url.to_string(),
            })
        } else {
            Ok(self)
        }
    }

    /// Freshness lifetime from `Cache-Control` or `Expires`/`Date`.
    ///
    /// `None` means the response carries no freshness information.
    pub fn freshness_lifetime(&self) -> Option<Duration> {
        let directives = CacheControl::parse(self.headers.get("cache-control"));
        if directives.no_cache {
            return Some(Duration::ZERO);
        }
        if let Some(secs) = directives.s_maxage.or(directives.max_age) {
            return Some(Duration::from_secs(secs));
        }

        let expires = self.headers.get("expires")?;
        let Ok(expires) = chrono::DateTime::parse_from_rfc2822(expires) else {
            // unparseable Expires means already expired
            return Some(Duration::ZERO);
        };
        let date = self
            .headers
            .get("date")
            .and_then(|d| chrono::DateTime::parse_from_rfc2822(d).ok())
            .map(|d| d.with_timezone(&chrono::Utc))
            .unwrap_or_else(chrono::Utc::now);
        let lifetime = expires.with_timezone(&chrono::Utc) - date;
        Some(lifetime.to_std().unwrap_or(Duration::ZERO))
    }

    /// Approximate in-memory size used for cache accounting
    pub fn byte_size(&self) -> usize {
        self.body.len() + self.headers.byte_size() + self.reason.len() + 16
    }
}

impl fmt::Display for Response {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let reason = if self.reason.is_empty() {
            status_description(self.status)
        } else {
            &self.reason
        };
        write!(f, "HTTP/1.1 {} {} ({} bytes)", self.status, reason, self.body.len())
    }
}

/// The subset of `Cache-Control` directives the cache honours
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
struct CacheControl {
    no_store: bool,
    no_cache: bool,
    private: bool,
    max_age: Option<u64>,
    s_maxage: Option<u64>,
}

impl CacheControl {
    fn parse(value: Option<&str>) -> Self {
        let mut directives = CacheControl::default();
        let Some(value) = value else {
            return directives;
        };

        for directive in value.split(',') {
            let directive = directive.trim().to_ascii_lowercase();
            let (name, arg) = match directive.split_once('=') {
                Some((name, arg)) => (name.trim().to_string(), Some(arg.trim().trim_matches('"').to_string())),
                None => (directive.clone(), None),
            };
            match name.as_str() {
                "no-store" => directives.no_store = true,
                "no-cache" => directives.no_cache = true,
                "private" => directives.private = true,
                "max-age" => directives.max_age = arg.and_then(|a| a.parse().ok()),
                "s-maxage" => directives.s_maxage = arg.and_then(|a| a.parse().ok()),
                _ => {}
            }
        }
        directives
    }
}

// =============================================================================
// HTTP/1.1 WIRE CODEC
// =============================================================================

/// Serialize a request for the wire
pub fn encode_request(request: &Request, user_agent: &str) -> Vec<u8> {
    let mut head = format!("{} {} HTTP/1.1\r\n", request.method(), request.target());

    let default_port = if request.is_secure() { 443 } else { 80 };
    let host = match request.url().host() {
        Some(Host::Ipv6(addr)) => format!("[{}]", addr),
        _ => request.host().to_string(),
    };
    if request.port() == default_port {
        head.push_str(&format!("Host: {}\r\n", host));
    } else {
        head.push_str(&format!("Host: {}:{}\r\n", host, request.port()));
    }

    if !request.headers().contains("user-agent") {
        head.push_str(&format!("User-Agent: {}\r\n", user_agent));
    }
    if !request.headers().contains("accept") {
        head.push_str("Accept: */*\r\n");
    }

    for (name, value) in request.headers().iter() {
        if name == "host" || name == "content-length" {
            continue;
        }
        head.push_str(&format!("{}: {}\r\n", name, value));
    }

    let body = request.body_bytes();
    if let Some(body) = body {
        head.push_str(&format!("Content-Length: {}\r\n", body.len()));
    } else if matches!(request.method(), Method::Post | Method::Put | Method::Patch) {
        head.push_str("Content-Length: 0\r\n");
    }

    head.push_str("\r\n");

    let mut bytes = head.into_bytes();
    if let Some(body) = body {
        bytes.extend_from_slice(body);
    }
    bytes
}

/// How the body following a response head is delimited
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BodyFraming {
    Empty,
    Length(usize),
    Chunked,
    /// Body runs until the peer closes the connection
    UntilClose,
}

/// Parsed status line and headers
#[derive(Debug, Clone)]
pub struct ResponseHead {
    pub status: u16,
    pub reason: String,
    pub headers: Headers,
    /// Bytes consumed by the status line and headers
    pub header_len: usize,
    /// `HTTP/1.0` peers close by default
    pub http10: bool,
}

impl ResponseHead {
    /// Body framing for a response to `method`
    pub fn framing(&self, method: Method) -> Result<BodyFraming, FetchError> {
        if method == Method::Head
            || (100..200).contains(&self.status)
            || self.status == 204
            || self.status == 304
        {
            return Ok(BodyFraming::Empty);
        }
        if let Some(te) = self.headers.get("transfer-encoding") {
            if te.to_ascii_lowercase().contains("chunked") {
                return Ok(BodyFraming::Chunked);
            }
        }
        match self.headers.get("content-length") {
            Some(len) => len
                .trim()
                .parse()
                .map(BodyFraming::Length)
                .map_err(|_| FetchError::protocol(format!("invalid Content-Length '{}'", len))),
            None => Ok(BodyFraming::UntilClose),
        }
    }

    /// Whether the connection may carry another request afterwards
    pub fn keep_alive(&self) -> bool {
        match self.headers.get("connection").map(str::to_ascii_lowercase) {
            Some(value) if value.contains("close") => false,
            Some(value) if value.contains("keep-alive") => true,
            _ => !self.http10,
        }
    }
}

/// Parse a response head; `Ok(None)` means more bytes are needed
pub fn parse_head(data: &[u8]) -> Result<Option<ResponseHead>, FetchError> {
    let mut headers = [httparse::EMPTY_HEADER; 64];
    let mut response = httparse::Response::new(&mut headers);

    let status = response
        .parse(data)
        .map_err(|e| FetchError::protocol(format!("failed to parse HTTP response: {}", e)))?;

    let header_len = match status {
        httparse::Status::Complete(len) => len,
        httparse::Status::Partial => return Ok(None),
    };

    let mut header_map = Headers::new();
    for header in response.headers.iter() {
        header_map.append(header.name, &String::from_utf8_lossy(header.value));
    }

    Ok(Some(ResponseHead {
        status: response.code.unwrap_or(0),
        reason: response.reason.unwrap_or("").to_string(),
        headers: header_map,
        header_len,
        http10: response.version == Some(0),
    }))
}

/// Decode a complete chunked body.
///
/// Returns the decoded body and the number of bytes consumed, or `Ok(None)`
/// if `data` does not yet hold the terminating chunk. A body growing past
/// `max_body` bytes is a protocol error.
pub fn decode_chunked(data: &[u8], max_body: usize) -> Result<Option<(Vec<u8>, usize)>, FetchError> {
    let mut body = Vec::new();
    let mut pos = 0;

    loop {
        let Some(line_end) = find_crlf(&data[pos..]) else {
            return Ok(None);
        };
        let size_line = std::str::from_utf8(&data[pos..pos + line_end])
            .map_err(|_| FetchError::protocol("non-ASCII chunk size"))?;
        let size_str = size_line.split(';').next().unwrap_or("").trim();
        let size = usize::from_str_radix(size_str, 16)
            .map_err(|_| FetchError::protocol(format!("invalid chunk size '{}'", size_str)))?;
        pos += line_end + 2;

        if size == 0 {
            // skip trailers up to the blank line
            loop {
                let Some(end) = find_crlf(&data[pos..]) else {
                    return Ok(None);
                };
                pos += end + 2;
                if end == 0 {
                    return Ok(Some((body, pos)));
                }
            }
        }

        if size > max_body.saturating_sub(body.len()) {
            return Err(FetchError::protocol(format!(
                "chunked body exceeds {} bytes",
                max_body
            )));
        }
        let chunk_end = pos
            .checked_add(size)
            .ok_or_else(|| FetchError::protocol("chunk size overflow"))?;
        let next = chunk_end
            .checked_add(2)
            .ok_or_else(|| FetchError::protocol("chunk size overflow"))?;

        if data.len() < next {
            return Ok(None);
        }
        body.extend_from_slice(&data[pos..chunk_end]);
        if &data[chunk_end..next] != b"\r\n" {
            return Err(FetchError::protocol("chunk not terminated by CRLF"));
        }
        pos = next;
    }
}

fn find_crlf(data: &[u8]) -> Option<usize> {
    data.windows(2).position(|w| w == b"\r\n")
}

/// Get HTTP status code description
pub fn status_description(code: u16) -> &'static str {
    match code {
        200 => "OK",
        201 => "Created",
        204 => "No Content",
        206 => "Partial Content",
        301 => "Moved Permanently",
        302 => "Found",
        304 => "Not Modified",
        307 => "Temporary Redirect",
        308 => "Permanent Redirect",
        400 => "Bad Request",
        401 => "Unauthorized",
        403 => "Forbidden",
        404 => "Not Found",
        405 => "Method Not Allowed",
        408 => "Request Timeout",
        410 => "Gone",
        429 => "Too Many Requests",
        500 => "Internal Server Error",
        501 => "Not Implemented",
        502 => "Bad Gateway",
        503 => "Service Unavailable",
        504 => "Gateway Timeout",
        _ => "Unknown",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn headers(pairs: &[(&str, &str)]) -> Headers {
        pairs.iter().map(|(k, v)| (*k, v.to_string())).collect()
    }

    #[test]
    fn test_headers_case_insensitive_unique() {
        let mut h = Headers::new();
        h.insert("Content-Type", "text/html");
        h.insert("content-type", "application/json");

        assert_eq!(h.len(), 1);
        assert_eq!(h.get("CONTENT-TYPE"), Some("application/json"));
        assert!(h.contains("Content-type"));
    }

    #[test]
    fn test_request_from_url() {
        let request = Request::get("https://Example.COM/a?b=1#frag").unwrap();
        assert_eq!(request.host(), "example.com");
        assert_eq!(request.port(), 443);
        assert!(request.is_secure());
        assert_eq!(request.target(), "/a?b=1");
    }

    #[test]
    fn test_request_rejects_bad_urls() {
        assert!(matches!(
            Request::get("ftp://example.com/"),
            Err(FetchError::InvalidUrl { .. })
        ));
        assert!(matches!(Request::get("not a url"), Err(FetchError::InvalidUrl { .. })));
    }

    #[test]
    fn test_request_from_options() {
        let options = FetchOptions::new()
            .method(Method::Post)
            .header("X-Trace", "1")
            .body(b"payload".to_vec())
            .use_cache(false)
            .secure(true);
        let request = Request::from_options("http://example.com:8080/submit", &options).unwrap();

        assert_eq!(request.method(), Method::Post);
        assert_eq!(request.headers().get("x-trace"), Some("1"));
        assert!(!request.use_cache());
        assert!(request.cache_response());
        assert!(request.is_secure());
        assert_eq!(request.port(), 8080);
    }

    #[test]
    fn test_encode_request() {
        let request = Request::get("http://example.com:8080/api/test?x=1")
            .unwrap()
            .header("Accept", "text/plain");

        let text = String::from_utf8(encode_request(&request, "netfetch/test")).unwrap();

        assert!(text.starts_with("GET /api/test?x=1 HTTP/1.1\r\n"));
        assert!(text.contains("Host: example.com:8080\r\n"));
        assert!(text.contains("User-Agent: netfetch/test\r\n"));
        assert!(text.contains("accept: text/plain\r\n"));
        assert!(!text.contains("Accept: */*"));
        assert!(text.ends_with("\r\n\r\n"));
    }

    #[test]
    fn test_encode_request_with_body() {
        let request = Request::new(Method::Post, "http://example.com/")
            .unwrap()
            .body(b"hello".to_vec());
        let bytes = encode_request(&request, "ua");
        let text = String::from_utf8(bytes).unwrap();
        assert!(text.contains("Content-Length: 5\r\n"));
        assert!(text.ends_with("\r\n\r\nhello"));
    }

    #[test]
    fn test_parse_head() {
        let data = b"HTTP/1.1 200 OK\r\nContent-Type: text/html\r\nContent-Length: 13\r\n\r\nHello, World!";

        let head = parse_head(data).unwrap().unwrap();

        assert_eq!(head.status, 200);
        assert_eq!(head.reason, "OK");
        assert_eq!(head.headers.get("content-type"), Some("text/html"));
        assert_eq!(head.framing(Method::Get).unwrap(), BodyFraming::Length(13));
        assert_eq!(&data[head.header_len..], b"Hello, World!");
        assert!(head.keep_alive());
    }

    #[test]
    fn test_parse_head_partial_and_malformed() {
        assert!(parse_head(b"HTTP/1.1 200 OK\r\nContent-").unwrap().is_none());
        assert!(matches!(parse_head(b"garbage\r\n\r\n"), Err(FetchError::Protocol { .. })));
    }

    #[test]
    fn test_framing_rules() {
        let head = parse_head(b"HTTP/1.0 200 OK\r\n\r\n").unwrap().unwrap();
        assert_eq!(head.framing(Method::Get).unwrap(), BodyFraming::UntilClose);
        assert!(!head.keep_alive());
        assert_eq!(head.framing(Method::Head).unwrap(), BodyFraming::Empty);

        let head = parse_head(b"HTTP/1.1 200 OK\r\nTransfer-Encoding: chunked\r\nConnection: close\r\n\r\n")
            .unwrap()
            .unwrap();
        assert_eq!(head.framing(Method::Get).unwrap(), BodyFraming::Chunked);
        assert!(!head.keep_alive());
    }

    #[test]
    fn test_decode_chunked() {
        let data = b"5\r\nHello\r\n7;ext=1\r\n, World\r\n0\r\n\r\n";
        let (body, consumed) = decode_chunked(data, 1024).unwrap().unwrap();
        assert_eq!(body, b"Hello, World");
        assert_eq!(consumed, data.len());

        assert!(decode_chunked(b"5\r\nHel", 1024).unwrap().is_none());
        assert!(decode_chunked(b"zz\r\n", 1024).is_err());
    }

    #[test]
    fn test_decode_chunked_rejects_huge_chunk_size() {
        let data = b"ffffffffffffffff\r\nab\r\n0\r\n\r\n";
        let err = decode_chunked(data, usize::MAX).unwrap_err();
        assert!(matches!(err, FetchError::Protocol { .. }));

        let err = decode_chunked(data, 1024).unwrap_err();
        assert!(err.to_string().contains("exceeds 1024 bytes"));
    }

    #[test]
    fn test_decode_chunked_enforces_body_limit_across_chunks() {
        let data = b"4\r\nabcd\r\n4\r\nefgh\r\n0\r\n\r\n";
        assert!(decode_chunked(data, 8).unwrap().is_some());
        assert!(decode_chunked(data, 6).is_err());
    }

    #[test]
    fn test_response_cacheability() {
        assert!(Response::new(200, "OK", Headers::new(), vec![]).is_cacheable());
        assert!(!Response::new(500, "", Headers::new(), vec![]).is_cacheable());
        assert!(!Response::new(
            200,
            "OK",
            headers(&[("Cache-Control", "no-store")]),
            vec![]
        )
        .is_cacheable());
        assert!(!Response::new(200, "OK", Headers::new(), vec![])
            .with_cacheable(false)
            .is_cacheable());
    }

    #[test]
    fn test_freshness_lifetime() {
        let r = Response::new(200, "OK", headers(&[("cache-control", "public, max-age=60")]), vec![]);
        assert_eq!(r.freshness_lifetime(), Some(Duration::from_secs(60)));

        let r = Response::new(200, "OK", headers(&[("cache-control", "max-age=60, s-maxage=10")]), vec![]);
        assert_eq!(r.freshness_lifetime(), Some(Duration::from_secs(10)));

        let r = Response::new(200, "OK", headers(&[("cache-control", "no-cache")]), vec![]);
        assert_eq!(r.freshness_lifetime(), Some(Duration::ZERO));

        let r = Response::new(
            200,
            "OK",
            headers(&[
                ("date", "Sun, 06 Nov 1994 08:49:37 GMT"),
                ("expires", "Sun, 06 Nov 1994 08:59:37 GMT"),
            ]),
            vec![],
        );
        assert_eq!(r.freshness_lifetime(), Some(Duration::from_secs(600)));

        let r = Response::new(200, "OK", Headers::new(), vec![]);
        assert_eq!(r.freshness_lifetime(), None);
    }

    #[test]
    fn test_error_for_status() {
        let ok = Response::new(200, "OK", Headers::new(), vec![]);
        assert!(ok.error_for_status("http://x/").is_ok());

        let missing = Response::new(404, "Not Found", Headers::new(), vec![]);
        assert!(matches!(
            missing.error_for_status("http://x/"),
            Err(FetchError::Status { status: 404, .. })
        ));
    }

    #[test]
    fn test_status_description() {
        assert_eq!(status_description(200), "OK");
        assert_eq!(status_description(404), "Not Found");
        assert_eq!(status_description(500), "Internal Server Error");
    }
}
