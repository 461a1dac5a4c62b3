//! TLS support for HTTPS targets
//!
//! Client-side TLS over openssl, plugged into the session operations
//! abstraction:
//!
//! 1. `TlsConfig` defines TLS settings (versions, peer verification)
//! 2. `TlsSessionOps` implements the `SessionOps` trait for encrypted I/O
//! 3. All HTTP code remains unchanged - it transparently uses TLS operations
//!
//! The handshake runs over any established `TcpStream`, including a
//! `CONNECT` tunnel through an upstream proxy.
//!
//! # Examples
//!
//! ```no_run
//! use httpsend::http::tls::{TlsConfig, TlsVersion};
//! use httpsend::http::HttpClient;
//! use std::net::TcpStream;
//!
//! let tls_config = TlsConfig::client()
//!     .unwrap()
//!     .version_range(TlsVersion::Tls12, TlsVersion::Tls13)
//!     .unwrap()
//!     .verify_peer(true)
//!     .build();
//!
//! let tcp_stream = TcpStream::connect("example.com:443").unwrap();
//! let tls_session = tls_config.connect(tcp_stream, "example.com").unwrap();
//! let mut client = HttpClient::new(tls_session);
//! ```

pub mod config;
pub mod session;

pub use config::{ClientConfigBuilder, TlsConfig, TlsError, TlsVersion};
pub use session::TlsSessionOps;

/// Result type for TLS operations
pub type Result<T> = std::result::Result<T, TlsError>;
