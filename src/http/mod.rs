//! HTTP/1.1 wire layer
//!
//! This module provides the message model and the blocking I/O primitives
//! the sender is built on.
//!
//! # Architecture
//!
//! The HTTP layer uses a session operations abstraction pattern that allows
//! seamless switching between plain TCP and TLS connections:
//!
//! - `SessionOps` trait defines operations (poll, read, write, close)
//! - `HttpSession` adds a poll-based timeout and implements `std::io::Read`
//! - `framing` reads a header block byte by byte and bodies through a
//!   reusable buffer, so nothing past the current message is consumed
//! - `HttpClient` performs one request/response exchange on a session
//!
//! # Examples
//!
//! ```no_run
//! use httpsend::http::{HttpClient, HttpRequest, Method};
//! use httpsend::http::session::FdSessionOps;
//! use std::net::TcpStream;
//!
//! let stream = TcpStream::connect("127.0.0.1:8080").unwrap();
//! let mut client = HttpClient::new(FdSessionOps::new(stream));
//!
//! let request = HttpRequest::builder()
//!     .method(Method::Get)
//!     .uri("http://127.0.0.1:8080/")
//!     .build();
//! let response = client.exchange(&request, request.origin_form().as_str()).unwrap();
//! assert_eq!(response.status().code(), 200);
//! ```

pub mod chunked;
pub mod client;
pub mod framing;
pub mod headers;
pub mod message;
pub mod parser;
pub mod session;
pub mod tls;

pub use client::HttpClient;
pub use framing::{BodyLength, BodyReader, CancelToken};
pub use headers::Headers;
pub use message::{
    HttpBody, HttpMessage, HttpRequest, HttpResponse, Method, Status, UpgradedConnection, Version,
};
pub use session::{BoxedSessionOps, HttpSession, SessionOps};

/// Result type for HTTP operations
pub type Result<T> = std::result::Result<T, Error>;

/// HTTP operation errors
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("TLS error: {0}")]
    Tls(#[from] tls::TlsError),

    #[error("Parse error: {0}")]
    Parse(String),

    #[error("Failed to read header: {0}")]
    HeaderRead(String),

    #[error("Malformed request: {0}")]
    MalformedRequest(String),

    #[error("Unknown host: {0}")]
    UnknownHost(String),

    #[error("Invalid HTTP version: {0}")]
    InvalidVersion(String),

    #[error("Invalid HTTP method: {0}")]
    InvalidMethod(String),

    #[error("Invalid HTTP status: {0}")]
    InvalidStatus(String),

    #[error("Invalid header: {0}")]
    InvalidHeader(String),

    #[error("Invalid chunk size: {0}")]
    InvalidChunkSize(String),

    #[error("No connection available for {0}")]
    PoolExhausted(String),

    #[error("Connection pool is shut down")]
    PoolShutdown,

    #[error("Exchange cancelled")]
    Cancelled,

    #[error("Timeout")]
    Timeout,

    #[error("Connection closed")]
    ConnectionClosed,

    #[error("Protocol error: {0}")]
    Protocol(String),
}

impl Error {
    /// Whether this error is an I/O-level transport failure (as opposed to a
    /// malformed request or an unresolvable host).
    pub fn is_transport(&self) -> bool {
        matches!(
            self,
            Error::Io(_)
                | Error::Tls(_)
                | Error::HeaderRead(_)
                | Error::Timeout
                | Error::ConnectionClosed
                | Error::Protocol(_)
                | Error::PoolExhausted(_)
        )
    }
}

/// Maximum number of headers per message
pub const MAX_HEADERS: usize = 256;

/// Maximum size of a header block, in bytes
pub const MAX_HEADER_BYTES: usize = 256 * 1024;

/// Default HTTP port
pub const DEFAULT_HTTP_PORT: u16 = 80;

/// Default HTTPS port
pub const DEFAULT_HTTPS_PORT: u16 = 443;

/// CRLF line ending
pub const CRLF: &str = "\r\n";
