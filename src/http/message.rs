//! HTTP message types
//!
//! This module defines the request and response types and the mutable
//! `HttpMessage` exchange record the sender fills in.

use super::session::{BoxedSessionOps, HttpSession};
use super::{Error, Headers, Result, CRLF};
use crate::auth::Identity;
use bytes::BytesMut;
use std::fmt;
use std::str::FromStr;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, SystemTime};
use url::Url;

/// HTTP methods
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Method {
    Get,
    Head,
    Post,
    Put,
    Delete,
    Connect,
    Options,
    Trace,
    Patch,
}

impl Method {
    /// Convert method to string
    pub fn as_str(&self) -> &'static str {
        match self {
            Method::Get => "GET",
            Method::Head => "HEAD",
            Method::Post => "POST",
            Method::Put => "PUT",
            Method::Delete => "DELETE",
            Method::Connect => "CONNECT",
            Method::Options => "OPTIONS",
            Method::Trace => "TRACE",
            Method::Patch => "PATCH",
        }
    }

    /// Methods whose redirects the transport layer follows on its own.
    pub fn is_get_like(&self) -> bool {
        matches!(self, Method::Get | Method::Head)
    }
}

impl FromStr for Method {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "GET" => Ok(Method::Get),
            "HEAD" => Ok(Method::Head),
            "POST" => Ok(Method::Post),
            "PUT" => Ok(Method::Put),
            "DELETE" => Ok(Method::Delete),
            "CONNECT" => Ok(Method::Connect),
            "OPTIONS" => Ok(Method::Options),
            "TRACE" => Ok(Method::Trace),
            "PATCH" => Ok(Method::Patch),
            _ => Err(Error::InvalidMethod(s.to_string())),
        }
    }
}

impl fmt::Display for Method {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// HTTP version
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum Version {
    Http10,
    #[default]
    Http11,
}

impl Version {
    /// Convert version to string
    pub fn as_str(&self) -> &'static str {
        match self {
            Version::Http10 => "HTTP/1.0",
            Version::Http11 => "HTTP/1.1",
        }
    }
}

impl FromStr for Version {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "HTTP/1.0" => Ok(Version::Http10),
            "HTTP/1.1" => Ok(Version::Http11),
            _ => Err(Error::InvalidVersion(s.to_string())),
        }
    }
}

impl fmt::Display for Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// HTTP status code
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Status {
    code: u16,
}

impl Status {
    /// Create a new status code
    pub fn new(code: u16) -> Result<Self> {
        if (100..600).contains(&code) {
            Ok(Status { code })
        } else {
            Err(Error::InvalidStatus(format!("Invalid status code: {}", code)))
        }
    }

    /// Get the status code
    pub fn code(&self) -> u16 {
        self.code
    }

    /// Get the canonical reason phrase for this status code
    pub fn reason_phrase(&self) -> &'static str {
        match self.code {
            100 => "Continue",
            101 => "Switching Protocols",
            200 => "OK",
            201 => "Created",
            202 => "Accepted",
            204 => "No Content",
            206 => "Partial Content",
            300 => "Multiple Choices",
            301 => "Moved Permanently",
            302 => "Found",
            303 => "See Other",
            304 => "Not Modified",
            305 => "Use Proxy",
            307 => "Temporary Redirect",
            308 => "Permanent Redirect",
            400 => "Bad Request",
            401 => "Unauthorized",
            403 => "Forbidden",
            404 => "Not Found",
            405 => "Method Not Allowed",
            407 => "Proxy Authentication Required",
            408 => "Request Timeout",
            500 => "Internal Server Error",
            502 => "Bad Gateway",
            503 => "Service Unavailable",
            504 => "Gateway Timeout",
            _ => "Unknown",
        }
    }

    /// Check if this is an informational status (1xx)
    pub fn is_informational(&self) -> bool {
        (100..200).contains(&self.code)
    }

    /// Check if this is a success status (2xx)
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.code)
    }

    /// Check if this is a redirection status (3xx)
    pub fn is_redirection(&self) -> bool {
        (300..400).contains(&self.code)
    }

    /// Check if this is a client error status (4xx)
    pub fn is_client_error(&self) -> bool {
        (400..500).contains(&self.code)
    }

    /// Check if this is a server error status (5xx)
    pub fn is_server_error(&self) -> bool {
        (500..600).contains(&self.code)
    }

    pub const OK: Status = Status { code: 200 };
    pub const SWITCHING_PROTOCOLS: Status = Status { code: 101 };
    pub const NO_CONTENT: Status = Status { code: 204 };
    pub const NOT_MODIFIED: Status = Status { code: 304 };
    pub const PROXY_AUTHENTICATION_REQUIRED: Status = Status { code: 407 };
    pub const NOT_FOUND: Status = Status { code: 404 };
    pub const INTERNAL_SERVER_ERROR: Status = Status { code: 500 };
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.code, self.reason_phrase())
    }
}

/// Message body: accumulated bytes plus the charset declared for them.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HttpBody {
    bytes: BytesMut,
    charset: Option<String>,
}

impl HttpBody {
    /// Create an empty body
    pub fn new() -> Self {
        Self::default()
    }

    /// Append bytes to the body
    pub fn append(&mut self, data: &[u8]) {
        self.bytes.extend_from_slice(data);
    }

    /// Number of bytes accumulated so far
    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }

    pub fn clear(&mut self) {
        self.bytes.clear();
    }

    pub fn charset(&self) -> Option<&str> {
        self.charset.as_deref()
    }

    pub fn set_charset(&mut self, charset: Option<String>) {
        self.charset = charset;
    }

    /// Decode the body as text, replacing invalid sequences.
    pub fn to_string_lossy(&self) -> String {
        String::from_utf8_lossy(&self.bytes).into_owned()
    }
}

impl From<Vec<u8>> for HttpBody {
    fn from(data: Vec<u8>) -> Self {
        HttpBody {
            bytes: BytesMut::from(&data[..]),
            charset: None,
        }
    }
}

impl From<&[u8]> for HttpBody {
    fn from(data: &[u8]) -> Self {
        HttpBody {
            bytes: BytesMut::from(data),
            charset: None,
        }
    }
}

/// Extract the `charset` parameter of a `Content-Type` value.
pub fn charset_of(content_type: &str) -> Option<String> {
    content_type.split(';').skip(1).find_map(|param| {
        let (name, value) = param.split_once('=')?;
        if name.trim().eq_ignore_ascii_case("charset") {
            Some(value.trim().trim_matches('"').to_string())
        } else {
            None
        }
    })
}

const IMAGE_EXTENSIONS: &[&str] = &["bmp", "ico", "jpg", "jpeg", "gif", "tiff", "tif", "png"];

/// HTTP request
///
/// The URI is kept absolute (`http://host/path?query`); the request-target
/// written on the wire is chosen per route by the sender.
#[derive(Debug, Clone)]
pub struct HttpRequest {
    method: Method,
    uri: String,
    version: Version,
    headers: Headers,
    body: HttpBody,
}

impl HttpRequest {
    /// Create a new HTTP request
    pub fn new(method: Method, uri: impl Into<String>) -> Self {
        HttpRequest {
            method,
            uri: uri.into(),
            version: Version::default(),
            headers: Headers::new(),
            body: HttpBody::new(),
        }
    }

    /// Create a builder for constructing requests
    pub fn builder() -> HttpRequestBuilder {
        HttpRequestBuilder::default()
    }

    /// Get the request method
    pub fn method(&self) -> Method {
        self.method
    }

    pub fn set_method(&mut self, method: Method) {
        self.method = method;
    }

    /// Get the request URI
    pub fn uri(&self) -> &str {
        &self.uri
    }

    /// Replace the URI and keep the `Host` header in step with it.
    pub fn set_uri(&mut self, url: &Url) {
        self.uri = url.to_string();
        if let Some(host) = host_header_value(url) {
            self.headers.set("Host", host);
        }
    }

    /// Parse the URI.
    ///
    /// Fails with `Error::MalformedRequest` when the URI is not absolute or
    /// has no host.
    pub fn url(&self) -> Result<Url> {
        let url = Url::parse(&self.uri)
            .map_err(|e| Error::MalformedRequest(format!("{}: {}", self.uri, e)))?;
        if url.host_str().map_or(true, str::is_empty) {
            return Err(Error::MalformedRequest(format!("{}: missing host", self.uri)));
        }
        match url.scheme() {
            "http" | "https" => Ok(url),
            other => Err(Error::MalformedRequest(format!(
                "{}: unsupported scheme {}",
                self.uri, other
            ))),
        }
    }

    /// Path and query, as written on a direct connection.
    pub fn origin_form(&self) -> String {
        match Url::parse(&self.uri) {
            Ok(url) => match url.query() {
                Some(q) => format!("{}?{}", url.path(), q),
                None => url.path().to_string(),
            },
            Err(_) => self.uri.clone(),
        }
    }

    /// Get the HTTP version
    pub fn version(&self) -> Version {
        self.version
    }

    /// Get the headers
    pub fn headers(&self) -> &Headers {
        &self.headers
    }

    /// Get mutable headers
    pub fn headers_mut(&mut self) -> &mut Headers {
        &mut self.headers
    }

    /// Get the body bytes
    pub fn body(&self) -> &[u8] {
        self.body.as_bytes()
    }

    pub fn http_body(&self) -> &HttpBody {
        &self.body
    }

    /// Set the body
    pub fn set_body(&mut self, body: impl Into<HttpBody>) {
        self.body = body.into();
    }

    /// Declared `Content-Length`, if present and numeric
    pub fn content_length(&self) -> Option<usize> {
        self.headers
            .get("Content-Length")
            .and_then(|v| v.trim().parse().ok())
    }

    pub fn set_content_length(&mut self, length: usize) {
        self.headers.set("Content-Length", length.to_string());
    }

    /// Whether the request asks for a protocol upgrade on its connection.
    pub fn is_upgrade(&self) -> bool {
        self.headers.has_token("Connection", "upgrade")
    }

    /// Whether the request path names an image resource.
    pub fn is_image(&self) -> bool {
        let path = match Url::parse(&self.uri) {
            Ok(url) => url.path().to_string(),
            Err(_) => self.uri.split('?').next().unwrap_or_default().to_string(),
        };
        match path.rsplit_once('.') {
            Some((_, ext)) => IMAGE_EXTENSIONS
                .iter()
                .any(|candidate| ext.eq_ignore_ascii_case(candidate)),
            None => false,
        }
    }

    /// Convert the request to wire format using the given request-target
    pub fn to_wire(&self, target: &str) -> Vec<u8> {
        let mut buf = Vec::with_capacity(256 + self.body.len());

        // Request line
        buf.extend_from_slice(self.method.as_str().as_bytes());
        buf.push(b' ');
        buf.extend_from_slice(target.as_bytes());
        buf.push(b' ');
        buf.extend_from_slice(self.version.as_str().as_bytes());
        buf.extend_from_slice(CRLF.as_bytes());

        for (name, value) in self.headers.iter() {
            buf.extend_from_slice(name.as_bytes());
            buf.extend_from_slice(b": ");
            buf.extend_from_slice(value.as_bytes());
            buf.extend_from_slice(CRLF.as_bytes());
        }

        buf.extend_from_slice(CRLF.as_bytes());
        buf.extend_from_slice(self.body.as_bytes());

        buf
    }
}

/// `Host` header value for a URL, with the port only when it is not the
/// scheme default.
pub fn host_header_value(url: &Url) -> Option<String> {
    let host = url.host_str()?;
    Some(match url.port() {
        Some(port) => format!("{}:{}", host, port),
        None => host.to_string(),
    })
}

/// Builder for HTTP requests
#[derive(Debug, Default)]
pub struct HttpRequestBuilder {
    method: Option<Method>,
    uri: Option<String>,
    version: Option<Version>,
    headers: Headers,
    body: HttpBody,
}

impl HttpRequestBuilder {
    /// Set the HTTP method
    pub fn method(mut self, method: Method) -> Self {
        self.method = Some(method);
        self
    }

    /// Set the URI
    pub fn uri(mut self, uri: impl Into<String>) -> Self {
        self.uri = Some(uri.into());
        self
    }

    /// Set the HTTP version
    pub fn version(mut self, version: Version) -> Self {
        self.version = Some(version);
        self
    }

    /// Add a header
    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(name, value);
        self
    }

    /// Set the body and a matching `Content-Length`
    pub fn body(mut self, body: impl Into<HttpBody>) -> Self {
        self.body = body.into();
        self.headers.set("Content-Length", self.body.len().to_string());
        self
    }

    /// Build the request
    ///
    /// A `Host` header is derived from an absolute URI when none was given.
    pub fn build(self) -> HttpRequest {
        let uri = self.uri.unwrap_or_else(|| "/".to_string());
        let mut headers = self.headers;
        if !headers.contains("Host") {
            if let Some(host) = Url::parse(&uri).ok().as_ref().and_then(host_header_value) {
                headers.insert("Host", host);
            }
        }
        HttpRequest {
            method: self.method.unwrap_or(Method::Get),
            uri,
            version: self.version.unwrap_or_default(),
            headers,
            body: self.body,
        }
    }
}

/// HTTP response
#[derive(Debug, Clone)]
pub struct HttpResponse {
    version: Version,
    status: Status,
    reason: String,
    headers: Headers,
    body: HttpBody,
}

impl HttpResponse {
    /// Create a new HTTP response
    pub fn new(status: Status) -> Self {
        let reason = status.reason_phrase().to_string();
        HttpResponse {
            version: Version::default(),
            status,
            reason,
            headers: Headers::new(),
            body: HttpBody::new(),
        }
    }

    /// Create a builder for constructing responses
    pub fn builder() -> HttpResponseBuilder {
        HttpResponseBuilder::default()
    }

    /// Get the HTTP version
    pub fn version(&self) -> Version {
        self.version
    }

    /// Get the status code
    pub fn status(&self) -> Status {
        self.status
    }

    /// Get the reason phrase
    pub fn reason(&self) -> &str {
        &self.reason
    }

    /// Get the headers
    pub fn headers(&self) -> &Headers {
        &self.headers
    }

    /// Get mutable headers
    pub fn headers_mut(&mut self) -> &mut Headers {
        &mut self.headers
    }

    /// Get the body bytes
    pub fn body(&self) -> &[u8] {
        self.body.as_bytes()
    }

    pub fn http_body(&self) -> &HttpBody {
        &self.body
    }

    pub fn http_body_mut(&mut self) -> &mut HttpBody {
        &mut self.body
    }

    /// Set the body
    pub fn set_body(&mut self, body: impl Into<HttpBody>) {
        self.body = body.into();
    }

    /// Declared `Content-Length`, if present and numeric
    pub fn content_length(&self) -> Option<usize> {
        self.headers
            .get("Content-Length")
            .and_then(|v| v.trim().parse().ok())
    }

    /// Whether the response carries an image (`Content-Type: image/*`).
    pub fn is_image(&self) -> bool {
        self.headers
            .get("Content-Type")
            .map(|ct| ct.trim().to_ascii_lowercase().starts_with("image/"))
            .unwrap_or(false)
    }

    /// Size of the status line and header block as written on the wire.
    pub fn header_length(&self) -> usize {
        let status_line = self.version.as_str().len() + 1 + 3 + 1 + self.reason.len() + 2;
        let fields: usize = self
            .headers
            .iter()
            .map(|(n, v)| n.len() + 2 + v.len() + 2)
            .sum();
        status_line + fields + 2
    }

    /// Header block plus body length.
    pub fn total_length(&self) -> usize {
        self.header_length() + self.body.len()
    }

    /// Convert the response to wire format
    pub fn to_wire(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(self.total_length());

        buf.extend_from_slice(self.version.as_str().as_bytes());
        buf.push(b' ');
        buf.extend_from_slice(self.status.code().to_string().as_bytes());
        buf.push(b' ');
        buf.extend_from_slice(self.reason.as_bytes());
        buf.extend_from_slice(CRLF.as_bytes());

        for (name, value) in self.headers.iter() {
            buf.extend_from_slice(name.as_bytes());
            buf.extend_from_slice(b": ");
            buf.extend_from_slice(value.as_bytes());
            buf.extend_from_slice(CRLF.as_bytes());
        }

        buf.extend_from_slice(CRLF.as_bytes());
        buf.extend_from_slice(self.body.as_bytes());

        buf
    }
}

/// Builder for HTTP responses
#[derive(Debug, Default)]
pub struct HttpResponseBuilder {
    version: Option<Version>,
    status: Option<Status>,
    reason: Option<String>,
    headers: Headers,
    body: HttpBody,
}

impl HttpResponseBuilder {
    /// Set the HTTP version
    pub fn version(mut self, version: Version) -> Self {
        self.version = Some(version);
        self
    }

    /// Set the status code
    pub fn status(mut self, status: Status) -> Self {
        self.status = Some(status);
        self
    }

    /// Set the reason phrase
    pub fn reason(mut self, reason: impl Into<String>) -> Self {
        self.reason = Some(reason.into());
        self
    }

    /// Add a header
    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(name, value);
        self
    }

    /// Replace all headers
    pub fn headers(mut self, headers: Headers) -> Self {
        self.headers = headers;
        self
    }

    /// Set the body
    pub fn body(mut self, body: impl Into<HttpBody>) -> Self {
        self.body = body.into();
        self
    }

    /// Build the response
    pub fn build(self) -> HttpResponse {
        let status = self.status.unwrap_or(Status::OK);
        let reason = self
            .reason
            .unwrap_or_else(|| status.reason_phrase().to_string());
        let mut body = self.body;
        if let Some(ct) = self.headers.get("Content-Type") {
            body.set_charset(charset_of(ct));
        }
        HttpResponse {
            version: self.version.unwrap_or_default(),
            status,
            reason,
            headers: self.headers,
            body,
        }
    }
}

/// Raw connection handed back after a `101 Switching Protocols` response.
#[derive(Clone)]
pub struct UpgradedConnection {
    session: Arc<Mutex<HttpSession<BoxedSessionOps>>>,
}

impl UpgradedConnection {
    pub(crate) fn new(session: HttpSession<BoxedSessionOps>) -> Self {
        UpgradedConnection {
            session: Arc::new(Mutex::new(session)),
        }
    }

    /// Lock the connection for raw reads and writes.
    pub fn lock(&self) -> MutexGuard<'_, HttpSession<BoxedSessionOps>> {
        match self.session.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

impl fmt::Debug for UpgradedConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("UpgradedConnection").finish_non_exhaustive()
    }
}

/// One logical HTTP exchange
///
/// Created by a caller with a request, filled in by the sender with the
/// response and timing, then read by listeners and the caller.
#[derive(Clone)]
pub struct HttpMessage {
    request: HttpRequest,
    response: Option<HttpResponse>,
    time_sent: Option<SystemTime>,
    elapsed: Option<Duration>,
    requesting_user: Option<Arc<dyn Identity>>,
    upgraded: Option<UpgradedConnection>,
    auth_exchange: bool,
}

impl HttpMessage {
    pub fn new(request: HttpRequest) -> Self {
        HttpMessage {
            request,
            response: None,
            time_sent: None,
            elapsed: None,
            requesting_user: None,
            upgraded: None,
            auth_exchange: false,
        }
    }

    /// Shorthand for a GET of an absolute URI.
    pub fn get(uri: impl Into<String>) -> Self {
        HttpMessage::new(HttpRequest::builder().method(Method::Get).uri(uri).build())
    }

    pub fn request(&self) -> &HttpRequest {
        &self.request
    }

    pub fn request_mut(&mut self) -> &mut HttpRequest {
        &mut self.request
    }

    pub fn set_request(&mut self, request: HttpRequest) {
        self.request = request;
    }

    pub fn response(&self) -> Option<&HttpResponse> {
        self.response.as_ref()
    }

    pub fn response_mut(&mut self) -> Option<&mut HttpResponse> {
        self.response.as_mut()
    }

    pub fn set_response(&mut self, response: HttpResponse) {
        self.response = Some(response);
    }

    pub fn take_response(&mut self) -> Option<HttpResponse> {
        self.response.take()
    }

    /// Status code of the response, if one has been received.
    pub fn status_code(&self) -> Option<u16> {
        self.response.as_ref().map(|r| r.status().code())
    }

    /// Response body, or an empty slice before a response arrives.
    pub fn response_body(&self) -> &[u8] {
        self.response.as_ref().map(|r| r.body()).unwrap_or_default()
    }

    pub fn time_sent(&self) -> Option<SystemTime> {
        self.time_sent
    }

    pub fn elapsed(&self) -> Option<Duration> {
        self.elapsed
    }

    /// Round-trip time in milliseconds, 0 when never sent.
    pub fn elapsed_millis(&self) -> u128 {
        self.elapsed.map(|d| d.as_millis()).unwrap_or(0)
    }

    pub(crate) fn set_timing(&mut self, sent: SystemTime, elapsed: Duration) {
        self.time_sent = Some(sent);
        self.elapsed = Some(elapsed);
    }

    pub fn requesting_user(&self) -> Option<&Arc<dyn Identity>> {
        self.requesting_user.as_ref()
    }

    /// Attach a simulated user whose session state the sender should use.
    pub fn set_requesting_user(&mut self, user: Option<Arc<dyn Identity>>) {
        self.requesting_user = user;
    }

    pub fn upgraded(&self) -> Option<&UpgradedConnection> {
        self.upgraded.as_ref()
    }

    pub(crate) fn set_upgraded(&mut self, connection: Option<UpgradedConnection>) {
        self.upgraded = connection;
    }

    /// Whether this message is itself part of a login/logout exchange.
    pub fn is_auth_exchange(&self) -> bool {
        self.auth_exchange
    }

    pub fn set_auth_exchange(&mut self, auth_exchange: bool) {
        self.auth_exchange = auth_exchange;
    }

    /// Copy of the request with no response or transport state attached.
    pub fn clone_request(&self) -> HttpMessage {
        let mut copy = HttpMessage::new(self.request.clone());
        copy.requesting_user = self.requesting_user.clone();
        copy.auth_exchange = self.auth_exchange;
        copy
    }
}

impl fmt::Debug for HttpMessage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HttpMessage")
            .field("request", &self.request)
            .field("response", &self.response)
            .field("time_sent", &self.time_sent)
            .field("elapsed", &self.elapsed)
            .field(
                "requesting_user",
                &self.requesting_user.as_ref().map(|u| u.name().to_string()),
            )
            .field("auth_exchange", &self.auth_exchange)
            .finish()
    }
}
