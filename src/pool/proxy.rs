//! Upstream proxy chain settings and tunnelling

use super::connect::connect_tcp;
use super::{PoolConfig, Target};
use crate::http::framing::read_header;
use crate::http::parser::parse_response_head;
use crate::http::session::{FdSessionOps, HttpSession};
use crate::http::{Error, Result, CRLF};
use std::net::TcpStream;

/// Credentials for the upstream proxy
#[derive(Clone, PartialEq, Eq)]
pub struct ProxyCredentials {
    pub username: String,
    pub password: String,
    /// Only answer challenges for this realm; `None` sends them up front
    pub realm: Option<String>,
}

impl ProxyCredentials {
    pub fn new(username: impl Into<String>, password: impl Into<String>) -> Self {
        ProxyCredentials {
            username: username.into(),
            password: password.into(),
            realm: None,
        }
    }

    pub fn with_realm(mut self, realm: impl Into<String>) -> Self {
        self.realm = Some(realm.into());
        self
    }

    /// `Proxy-Authorization` value
    pub fn basic_authorization(&self) -> String {
        let raw = format!("{}:{}", self.username, self.password);
        format!("Basic {}", openssl::base64::encode_block(raw.as_bytes()))
    }

    /// Whether credentials go out before any challenge
    pub fn preemptive(&self) -> bool {
        self.realm.is_none()
    }

    /// Whether a `Proxy-Authenticate` challenge is one these credentials answer.
    pub fn answers(&self, challenge: &str) -> bool {
        let trimmed = challenge.trim_start();
        let is_basic = trimmed
            .get(..5)
            .is_some_and(|scheme| scheme.eq_ignore_ascii_case("basic"));
        if !is_basic {
            return false;
        }
        match (&self.realm, realm_of(challenge)) {
            (None, _) => true,
            (Some(expected), Some(actual)) => expected == &actual,
            (Some(_), None) => false,
        }
    }
}

impl std::fmt::Debug for ProxyCredentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProxyCredentials")
            .field("username", &self.username)
            .field("realm", &self.realm)
            .finish_non_exhaustive()
    }
}

/// Extract `realm="..."` from an authentication challenge.
pub fn realm_of(challenge: &str) -> Option<String> {
    let lower = challenge.to_ascii_lowercase();
    let start = lower.find("realm=")? + "realm=".len();
    let rest = &challenge[start..];
    let value = match rest.strip_prefix('"') {
        Some(quoted) => quoted.split('"').next()?,
        None => rest.split([',', ' ']).next()?,
    };
    Some(value.to_string())
}

/// Upstream proxy chain configuration
#[derive(Debug, Clone, Default)]
pub struct ProxyChain {
    pub host: String,
    pub port: u16,
    /// Hosts reached directly: exact names or `*.suffix` patterns
    pub skip_hosts: Vec<String>,
    pub credentials: Option<ProxyCredentials>,
}

impl ProxyChain {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        ProxyChain {
            host: host.into(),
            port,
            skip_hosts: Vec::new(),
            credentials: None,
        }
    }

    pub fn skip_host(mut self, host: impl Into<String>) -> Self {
        self.skip_hosts.push(host.into());
        self
    }

    pub fn credentials(mut self, credentials: ProxyCredentials) -> Self {
        self.credentials = Some(credentials);
        self
    }

    /// A chain without a host is the same as no chain.
    pub fn is_configured(&self) -> bool {
        !self.host.trim().is_empty()
    }

    /// Whether requests to `host` go through this chain.
    pub fn should_proxy(&self, host: &str) -> bool {
        if !self.is_configured() {
            return false;
        }
        let host = host.to_ascii_lowercase();
        !self.skip_hosts.iter().any(|pattern| {
            let pattern = pattern.trim().to_ascii_lowercase();
            match pattern.strip_prefix("*.") {
                Some(suffix) => host == suffix || host.ends_with(&format!(".{}", suffix)),
                None => host == pattern,
            }
        })
    }

    pub fn authority(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

/// Open a `CONNECT` tunnel to `target` through the chain.
///
/// Answers one matching `407` challenge when credentials are not sent up
/// front. The returned stream is positioned right after the proxy's reply.
pub(crate) fn open_tunnel(
    chain: &ProxyChain,
    target: &Target,
    config: &PoolConfig,
) -> Result<TcpStream> {
    let preemptive = chain
        .credentials
        .as_ref()
        .filter(|c| c.preemptive())
        .map(ProxyCredentials::basic_authorization);

    match try_connect(chain, target, config, preemptive.as_deref())? {
        Tunnel::Open(stream) => Ok(stream),
        Tunnel::Challenged(challenges) => {
            let answer = chain
                .credentials
                .as_ref()
                .filter(|c| preemptive.is_none() && challenges.iter().any(|ch| c.answers(ch)));
            match answer {
                Some(credentials) => {
                    log::debug!("Answering proxy challenge from {}", chain.authority());
                    let auth = credentials.basic_authorization();
                    match try_connect(chain, target, config, Some(&auth))? {
                        Tunnel::Open(stream) => Ok(stream),
                        Tunnel::Challenged(_) => Err(Error::Protocol(format!(
                            "proxy {} rejected credentials",
                            chain.authority()
                        ))),
                    }
                }
                None => Err(Error::Protocol(format!(
                    "proxy {} requires authentication",
                    chain.authority()
                ))),
            }
        }
    }
}

enum Tunnel {
    Open(TcpStream),
    Challenged(Vec<String>),
}

fn try_connect(
    chain: &ProxyChain,
    target: &Target,
    config: &PoolConfig,
    authorization: Option<&str>,
) -> Result<Tunnel> {
    let stream = connect_tcp(&chain.host, chain.port, config.timeout)?;
    let mut session = HttpSession::new(FdSessionOps::new(stream));
    session.set_timeout(Some(config.timeout));

    let authority = target.authority();
    let mut request = format!(
        "CONNECT {authority} HTTP/1.1{CRLF}Host: {authority}{CRLF}Proxy-Connection: keep-alive{CRLF}"
    );
    if let Some(auth) = authorization {
        request.push_str(&format!("Proxy-Authorization: {}{}", auth, CRLF));
    }
    request.push_str(CRLF);
    session.write_all(request.as_bytes())?;

    let head = parse_response_head(&read_header(&mut session)?)?;
    let code = head.status.code();
    if head.status.is_success() {
        return Ok(Tunnel::Open(session.into_inner().into_stream()));
    }
    if code == 407 {
        return Ok(Tunnel::Challenged(
            head.headers
                .get_all("Proxy-Authenticate")
                .into_iter()
                .map(str::to_string)
                .collect(),
        ));
    }
    Err(Error::Protocol(format!(
        "proxy {} refused CONNECT {}: {} {}",
        chain.authority(),
        authority,
        code,
        head.reason
    )))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_should_proxy_honours_skip_list() {
        let chain = ProxyChain::new("proxy.local", 3128)
            .skip_host("localhost")
            .skip_host("*.internal.example");

        assert!(chain.should_proxy("example.com"));
        assert!(!chain.should_proxy("LOCALHOST"));
        assert!(!chain.should_proxy("db.internal.example"));
        assert!(!chain.should_proxy("internal.example"));
    }

    #[test]
    fn test_empty_host_is_not_configured() {
        let chain = ProxyChain::new("  ", 8080);
        assert!(!chain.is_configured());
        assert!(!chain.should_proxy("example.com"));
    }

    #[test]
    fn test_basic_authorization() {
        let creds = ProxyCredentials::new("user", "pass");
        assert_eq!(creds.basic_authorization(), "Basic dXNlcjpwYXNz");
        assert!(creds.preemptive());
    }

    #[test]
    fn test_realm_scoped_credentials() {
        let creds = ProxyCredentials::new("u", "p").with_realm("corp");

        assert!(!creds.preemptive());
        assert!(creds.answers("Basic realm=\"corp\""));
        assert!(!creds.answers("Basic realm=\"other\""));
        assert!(!creds.answers("Digest realm=\"corp\", nonce=\"1\""));
        assert_eq!(realm_of("Basic realm=plain, charset=UTF-8").as_deref(), Some("plain"));
    }
}
