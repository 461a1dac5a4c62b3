//! TLS configuration
//!
//! This module provides the client TLS configuration builder.

use openssl::ssl::{SslContextBuilder, SslMethod, SslVerifyMode, SslVersion};
use std::net::TcpStream;
use std::str::FromStr;

/// TLS version
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum TlsVersion {
    /// TLS 1.0
    Tls10,
    /// TLS 1.1
    Tls11,
    /// TLS 1.2
    Tls12,
    /// TLS 1.3
    Tls13,
}

impl TlsVersion {
    /// Get OpenSSL protocol version constant
    pub fn to_openssl_version(&self) -> SslVersion {
        match self {
            TlsVersion::Tls10 => SslVersion::TLS1,
            TlsVersion::Tls11 => SslVersion::TLS1_1,
            TlsVersion::Tls12 => SslVersion::TLS1_2,
            TlsVersion::Tls13 => SslVersion::TLS1_3,
        }
    }

    /// Get version as string
    pub fn as_str(&self) -> &'static str {
        match self {
            TlsVersion::Tls10 => "TLSv1.0",
            TlsVersion::Tls11 => "TLSv1.1",
            TlsVersion::Tls12 => "TLSv1.2",
            TlsVersion::Tls13 => "TLSv1.3",
        }
    }
}

impl FromStr for TlsVersion {
    type Err = TlsError;

    /// Parse TLS version from string (case-insensitive)
    fn from_str(s: &str) -> Result<Self, TlsError> {
        match s.to_uppercase().as_str() {
            "TLSV1.0" | "TLS1.0" | "TLSV1" | "TLS1" => Ok(TlsVersion::Tls10),
            "TLSV1.1" | "TLS1.1" => Ok(TlsVersion::Tls11),
            "TLSV1.2" | "TLS1.2" => Ok(TlsVersion::Tls12),
            "TLSV1.3" | "TLS1.3" => Ok(TlsVersion::Tls13),
            _ => Err(TlsError::InvalidVersion(s.to_string())),
        }
    }
}

/// TLS errors
#[derive(Debug, thiserror::Error)]
pub enum TlsError {
    #[error("OpenSSL error: {0}")]
    OpenSsl(#[from] openssl::error::ErrorStack),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid TLS version: {0}")]
    InvalidVersion(String),

    #[error("Handshake failed: {0}")]
    HandshakeFailed(String),
}

/// TLS configuration (immutable after building)
#[derive(Clone)]
pub struct TlsConfig {
    pub(crate) ctx: openssl::ssl::SslContext,
    pub(crate) verify_peer: bool,
}

impl TlsConfig {
    /// Create a new client configuration builder
    pub fn client() -> Result<ClientConfigBuilder, TlsError> {
        ClientConfigBuilder::new()
    }

    /// Whether the peer certificate is verified
    pub fn verify_peer(&self) -> bool {
        self.verify_peer
    }

    /// Connect to a server with TLS, sending `servername` as SNI
    pub fn connect(
        &self,
        stream: TcpStream,
        servername: &str,
    ) -> Result<super::TlsSessionOps, TlsError> {
        super::session::TlsSessionOps::connect(stream, self, servername)
    }
}

impl std::fmt::Debug for TlsConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TlsConfig")
            .field("verify_peer", &self.verify_peer)
            .finish_non_exhaustive()
    }
}

/// Client configuration builder
pub struct ClientConfigBuilder {
    ctx_builder: SslContextBuilder,
    verify_peer: bool,
}

impl ClientConfigBuilder {
    fn new() -> Result<Self, TlsError> {
        let mut ctx_builder = SslContextBuilder::new(SslMethod::tls_client())?;

        // Security testing talks to self-signed targets; verification is opt-in.
        ctx_builder.set_verify(SslVerifyMode::NONE);

        Ok(ClientConfigBuilder {
            ctx_builder,
            verify_peer: false,
        })
    }

    /// Set TLS version (both min and max)
    pub fn version(self, version: TlsVersion) -> Result<Self, TlsError> {
        self.version_range(version, version)
    }

    /// Set TLS version range
    pub fn version_range(mut self, min: TlsVersion, max: TlsVersion) -> Result<Self, TlsError> {
        self.ctx_builder
            .set_min_proto_version(Some(min.to_openssl_version()))?;
        self.ctx_builder
            .set_max_proto_version(Some(max.to_openssl_version()))?;
        Ok(self)
    }

    /// Set cipher list (for TLS <= 1.2)
    pub fn cipher_list(mut self, ciphers: &str) -> Result<Self, TlsError> {
        self.ctx_builder.set_cipher_list(ciphers)?;
        Ok(self)
    }

    /// Enable/disable peer certificate verification
    pub fn verify_peer(mut self, verify: bool) -> Self {
        self.verify_peer = verify;
        if verify {
            self.ctx_builder.set_verify(SslVerifyMode::PEER);
        } else {
            self.ctx_builder.set_verify(SslVerifyMode::NONE);
        }
        self
    }

    /// Load the system default trust store (needed with `verify_peer(true)`)
    pub fn default_verify_paths(mut self) -> Result<Self, TlsError> {
        self.ctx_builder.set_default_verify_paths()?;
        Ok(self)
    }

    /// Build the TLS configuration
    pub fn build(self) -> TlsConfig {
        TlsConfig {
            ctx: self.ctx_builder.build(),
            verify_peer: self.verify_peer,
        }
    }
}
