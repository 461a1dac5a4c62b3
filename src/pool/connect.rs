//! Opening new connections for a route

use super::proxy::{open_tunnel, ProxyCredentials};
use super::{PoolConfig, Route, Target};
use crate::http::session::FdSessionOps;
use crate::http::tls::TlsConfig;
use crate::http::{BoxedSessionOps, Error, HttpClient, HttpSession, Result};
use socket2::{Domain, Protocol, SockAddr, Socket, Type};
use std::net::{TcpStream, ToSocketAddrs};
use std::time::{Duration, Instant};

/// An open connection to one target
pub struct Connection {
    client: HttpClient<BoxedSessionOps>,
    target: Target,
    /// Plain HTTP relayed by a proxy: requests use absolute-form targets
    forwarded: bool,
    proxy_credentials: Option<ProxyCredentials>,
    created: Instant,
    exchanges: usize,
}

impl Connection {
    pub fn target(&self) -> &Target {
        &self.target
    }

    /// Whether requests on this connection are forwarded by a proxy.
    pub fn is_forwarded(&self) -> bool {
        self.forwarded
    }

    /// Credentials of the forwarding proxy, if it has any.
    pub fn proxy_credentials(&self) -> Option<&ProxyCredentials> {
        self.proxy_credentials.as_ref()
    }

    /// Request-target to write for `uri`.
    pub fn request_target(&self, uri: &str, origin_form: String) -> String {
        if self.is_forwarded() {
            uri.to_string()
        } else {
            origin_form
        }
    }

    pub fn client_mut(&mut self) -> &mut HttpClient<BoxedSessionOps> {
        &mut self.client
    }

    pub fn is_stale(&self) -> bool {
        self.client.is_stale()
    }

    pub fn age(&self) -> Duration {
        self.created.elapsed()
    }

    pub fn exchanges(&self) -> usize {
        self.exchanges
    }

    pub(crate) fn record_exchange(&mut self) {
        self.exchanges += 1;
    }

    pub(crate) fn close(&mut self) {
        if let Err(e) = self.client.close() {
            log::trace!("Closing connection to {}: {}", self.target, e);
        }
    }

    pub fn into_session(self) -> HttpSession<BoxedSessionOps> {
        self.client.into_session()
    }
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("target", &self.target)
            .field("forwarded", &self.is_forwarded())
            .field("exchanges", &self.exchanges)
            .finish()
    }
}

/// Resolve and connect with a bounded connect time.
pub(crate) fn connect_tcp(host: &str, port: u16, timeout: Duration) -> Result<TcpStream> {
    let addrs: Vec<_> = (host, port)
        .to_socket_addrs()
        .map_err(|e| Error::UnknownHost(format!("{}: {}", host, e)))?
        .collect();
    if addrs.is_empty() {
        return Err(Error::UnknownHost(host.to_string()));
    }

    let mut last_err = None;
    for addr in addrs {
        let socket = Socket::new(Domain::for_address(addr), Type::STREAM, Some(Protocol::TCP))?;
        socket.set_nodelay(true)?;
        socket.set_keepalive(true)?;
        match socket.connect_timeout(&SockAddr::from(addr), timeout) {
            Ok(()) => {
                let stream: TcpStream = socket.into();
                // Blocking TLS handshakes rely on these.
                stream.set_read_timeout(Some(timeout))?;
                stream.set_write_timeout(Some(timeout))?;
                log::trace!("Connected to {} ({})", host, addr);
                return Ok(stream);
            }
            Err(e) => {
                log::debug!("Connect to {} ({}) failed: {}", host, addr, e);
                last_err = Some(e);
            }
        }
    }

    Err(last_err
        .map(Error::Io)
        .unwrap_or_else(|| Error::UnknownHost(host.to_string())))
}

/// Open a new connection to `target` over `route`.
pub(crate) fn open(
    route: &Route,
    target: &Target,
    config: &PoolConfig,
    tls: &TlsConfig,
) -> Result<Connection> {
    let (stream, forwarded, proxy_credentials) = match route {
        Route::Direct => (
            connect_tcp(&target.host, target.port, config.timeout)?,
            false,
            None,
        ),
        Route::Proxy(chain) if target.is_https() => {
            (open_tunnel(chain, target, config)?, false, None)
        }
        Route::Proxy(chain) => (
            connect_tcp(&chain.host, chain.port, config.timeout)?,
            true,
            chain.credentials.clone(),
        ),
    };

    let session: BoxedSessionOps = if target.is_https() {
        Box::new(tls.connect(stream, &target.host)?)
    } else {
        Box::new(FdSessionOps::new(stream))
    };

    let mut client = HttpClient::new(session).with_buffer_size(config.buffer_size);
    client.set_timeout(config.timeout);

    Ok(Connection {
        client,
        target: target.clone(),
        forwarded,
        proxy_credentials,
        created: Instant::now(),
        exchanges: 0,
    })
}
