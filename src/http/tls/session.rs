//! TLS session operations
//!
//! This module implements the SessionOps trait for TLS connections,
//! enabling transparent switching between plain TCP and TLS I/O.

use super::config::{TlsConfig, TlsError};
use crate::http::session::{poll_fd, PollEvents, SessionOps};
use crate::http::{Error, Result as HttpResult};
use openssl::ssl::{Ssl, SslStream};
use std::io::{Read, Write};
use std::net::TcpStream;
use std::os::fd::AsRawFd;
use std::time::Duration;

/// TLS session operations
///
/// Wraps an OpenSSL SslStream and provides poll/read/write/close operations.
pub struct TlsSessionOps {
    stream: SslStream<TcpStream>,
    failed: bool,
}

impl TlsSessionOps {
    /// Create a client TLS connection (perform handshake)
    pub fn connect(
        tcp_stream: TcpStream,
        config: &TlsConfig,
        servername: &str,
    ) -> std::result::Result<Self, TlsError> {
        let mut ssl = Ssl::new(&config.ctx)?;

        // SNI is not sent for IP literals
        if servername.parse::<std::net::IpAddr>().is_err() {
            ssl.set_hostname(servername)?;
        }
        if config.verify_peer {
            ssl.param_mut().set_host(servername)?;
        }

        // Blocking handshake; the socket keeps its connect-time timeouts.
        let ssl_stream = ssl
            .connect(tcp_stream)
            .map_err(|e| TlsError::HandshakeFailed(format!("{}: {}", servername, e)))?;

        log::debug!(
            "TLS established with {} ({})",
            servername,
            ssl_stream.ssl().version_str()
        );

        Ok(TlsSessionOps {
            stream: ssl_stream,
            failed: false,
        })
    }

    /// Check if TLS failed
    pub fn failed(&self) -> bool {
        self.failed
    }

    /// Get reference to underlying TCP stream
    pub fn get_ref(&self) -> &TcpStream {
        self.stream.get_ref()
    }
}

impl SessionOps for TlsSessionOps {
    fn poll(&self, events: PollEvents, timeout: Option<Duration>) -> HttpResult<bool> {
        // Decrypted bytes may already be buffered inside openssl
        if (events == PollEvents::Read || events == PollEvents::Both)
            && self.stream.ssl().pending() > 0
        {
            return Ok(true);
        }

        poll_fd(self.stream.get_ref().as_raw_fd(), events, timeout)
    }

    fn read(&mut self, buf: &mut [u8]) -> HttpResult<usize> {
        match self.stream.read(buf) {
            Ok(n) => Ok(n),
            Err(e) => {
                self.failed = true;
                Err(Error::Io(e))
            }
        }
    }

    fn write(&mut self, buf: &[u8]) -> HttpResult<usize> {
        match self.stream.write(buf) {
            Ok(n) => Ok(n),
            Err(e) => {
                self.failed = true;
                Err(Error::Io(e))
            }
        }
    }

    fn flush(&mut self) -> HttpResult<()> {
        self.stream.flush().map_err(|e| {
            self.failed = true;
            Error::Io(e)
        })
    }

    fn close(&mut self) -> HttpResult<()> {
        if !self.failed {
            let _ = self.stream.shutdown();
        }

        use std::net::Shutdown;
        match self.stream.get_mut().shutdown(Shutdown::Both) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotConnected => Ok(()),
            Err(e) => Err(Error::from(e)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::http::tls::TlsVersion;
    use openssl::asn1::Asn1Time;
    use openssl::hash::MessageDigest;
    use openssl::pkey::{PKey, Private};
    use openssl::rsa::Rsa;
    use openssl::ssl::{SslAcceptor, SslMethod};
    use openssl::x509::{X509, X509NameBuilder};
    use std::net::TcpListener;
    use std::thread;

    fn self_signed() -> (PKey<Private>, X509) {
        let key = PKey::from_rsa(Rsa::generate(2048).unwrap()).unwrap();
        let mut name = X509NameBuilder::new().unwrap();
        name.append_entry_by_text("CN", "localhost").unwrap();
        let name = name.build();

        let mut builder = X509::builder().unwrap();
        builder.set_version(2).unwrap();
        builder.set_subject_name(&name).unwrap();
        builder.set_issuer_name(&name).unwrap();
        builder.set_pubkey(&key).unwrap();
        builder
            .set_not_before(&Asn1Time::days_from_now(0).unwrap())
            .unwrap();
        builder
            .set_not_after(&Asn1Time::days_from_now(1).unwrap())
            .unwrap();
        builder.sign(&key, MessageDigest::sha256()).unwrap();
        (key, builder.build())
    }

    #[test]
    fn test_tls_client_handshake_and_io() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();

        let (key, cert) = self_signed();
        let mut acceptor = SslAcceptor::mozilla_intermediate_v5(SslMethod::tls()).unwrap();
        acceptor.set_private_key(&key).unwrap();
        acceptor.set_certificate(&cert).unwrap();
        let acceptor = acceptor.build();

        let server_handle = thread::spawn(move || {
            let (tcp_stream, _) = listener.accept().unwrap();
            let mut tls = acceptor.accept(tcp_stream).unwrap();

            let mut buf = [0u8; 5];
            tls.read_exact(&mut buf).unwrap();
            assert_eq!(&buf, b"Hello");
            tls.write_all(b"World").unwrap();
        });

        let config = TlsConfig::client()
            .unwrap()
            .version_range(TlsVersion::Tls12, TlsVersion::Tls13)
            .unwrap()
            .build();
        let mut session = config
            .connect(TcpStream::connect(addr).unwrap(), "localhost")
            .unwrap();

        assert!(!session.failed());
        assert_eq!(SessionOps::write(&mut session, b"Hello").unwrap(), 5);

        assert!(session
            .poll(PollEvents::Read, Some(Duration::from_secs(5)))
            .unwrap());
        let mut buf = [0u8; 5];
        let mut read = 0;
        while read < 5 {
            read += SessionOps::read(&mut session, &mut buf[read..]).unwrap();
        }
        assert_eq!(&buf, b"World");

        session.close().unwrap();
        server_handle.join().unwrap();
    }
}
