//! The outbound HTTP sender
//!
//! A `TransportContext` owns everything process-wide about sending: the
//! connection pools, the listeners, the shared cookie jar and the user
//! agent. `HttpSender` is a cheap handle onto a context, tagged with the
//! subsystem that uses it.
//!
//! A send runs through three layers, outermost first:
//!
//! 1. re-authentication, when the message carries a requesting user
//! 2. redirect following, per the redirection policy
//! 3. the request executor, which does the actual exchange

mod executor;

pub(crate) use executor::redirect_target;

use crate::auth::{self, Identity};
use crate::cookies::CookieJar;
use crate::http::tls::{TlsConfig, TlsError};
use crate::http::{CancelToken, HttpMessage, Result};
use crate::listener::ListenerRegistry;
use crate::pool::{ConnectionManager, ConnectionProvider, PoolConfig, ProxyChain};
use crate::redirect::{PermissiveValidator, RedirectFollower, RedirectOutcome, RedirectionValidator};
use std::fmt;
use std::sync::{Arc, RwLock};

/// Subsystem that started an exchange
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Initiator {
    Proxy,
    ActiveScanner,
    Spider,
    Fuzzer,
    Authentication,
    ManualRequest,
    CheckForUpdates,
    Scripting,
}

impl Initiator {
    pub fn as_str(&self) -> &'static str {
        match self {
            Initiator::Proxy => "proxy",
            Initiator::ActiveScanner => "active-scanner",
            Initiator::Spider => "spider",
            Initiator::Fuzzer => "fuzzer",
            Initiator::Authentication => "authentication",
            Initiator::ManualRequest => "manual-request",
            Initiator::CheckForUpdates => "check-for-updates",
            Initiator::Scripting => "scripting",
        }
    }
}

impl fmt::Display for Initiator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Sender settings
#[derive(Debug, Clone)]
pub struct SenderConfig {
    /// Replaces the `User-Agent` of every request when set
    pub user_agent: Option<String>,
    /// Hop limit when redirects are followed by the transport
    pub max_redirects: usize,
    pub direct_pool: PoolConfig,
    pub proxied_pool: PoolConfig,
    pub proxy_chain: ProxyChain,
    /// Verify server certificates against the system trust store
    pub verify_peer: bool,
}

impl Default for SenderConfig {
    fn default() -> Self {
        SenderConfig {
            user_agent: None,
            max_redirects: 100,
            direct_pool: PoolConfig::default(),
            proxied_pool: PoolConfig::default(),
            proxy_chain: ProxyChain::default(),
            verify_peer: false,
        }
    }
}

impl SenderConfig {
    pub fn user_agent(mut self, user_agent: impl Into<String>) -> Self {
        self.user_agent = Some(user_agent.into());
        self
    }

    pub fn max_redirects(mut self, max: usize) -> Self {
        self.max_redirects = max;
        self
    }

    /// Apply the same pool settings to both pools.
    pub fn pool(mut self, config: PoolConfig) -> Self {
        self.direct_pool = config.clone();
        self.proxied_pool = config;
        self
    }

    pub fn proxy_chain(mut self, chain: ProxyChain) -> Self {
        self.proxy_chain = chain;
        self
    }

    pub fn verify_peer(mut self, verify: bool) -> Self {
        self.verify_peer = verify;
        self
    }
}

/// Shared state behind every sender
pub struct TransportContext {
    connections: Arc<dyn ConnectionProvider>,
    listeners: ListenerRegistry,
    cookies: CookieJar,
    user_agent: RwLock<Option<String>>,
    max_redirects: usize,
}

impl TransportContext {
    /// Build a context with its own connection pools.
    pub fn new(config: SenderConfig) -> std::result::Result<Arc<Self>, TlsError> {
        let mut tls = TlsConfig::client()?.verify_peer(config.verify_peer);
        if config.verify_peer {
            tls = tls.default_verify_paths()?;
        }
        let tls = tls.build();

        let connections = Arc::new(ConnectionManager::with_pools(
            config.direct_pool.clone(),
            config.proxied_pool.clone(),
            tls,
            config.proxy_chain.clone(),
        ));
        Ok(Self::with_connections(config, connections))
    }

    /// Build a context around an existing connection provider.
    pub fn with_connections(config: SenderConfig, connections: Arc<dyn ConnectionProvider>) -> Arc<Self> {
        Arc::new(TransportContext {
            connections,
            listeners: ListenerRegistry::new(),
            cookies: CookieJar::new(),
            user_agent: RwLock::new(config.user_agent),
            max_redirects: config.max_redirects,
        })
    }

    pub fn connections(&self) -> &Arc<dyn ConnectionProvider> {
        &self.connections
    }

    pub fn listeners(&self) -> &ListenerRegistry {
        &self.listeners
    }

    /// Cookie jar used by messages without a requesting user
    pub fn cookies(&self) -> &CookieJar {
        &self.cookies
    }

    pub fn user_agent(&self) -> Option<String> {
        match self.user_agent.read() {
            Ok(guard) => guard.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    pub fn set_user_agent(&self, user_agent: Option<String>) {
        match self.user_agent.write() {
            Ok(mut guard) => *guard = user_agent,
            Err(poisoned) => *poisoned.into_inner() = user_agent,
        }
    }

    pub fn max_redirects(&self) -> usize {
        self.max_redirects
    }

    /// Release every pooled connection.
    pub fn shutdown(&self) {
        self.connections.shutdown();
    }
}

impl fmt::Debug for TransportContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TransportContext")
            .field("listeners", &self.listeners)
            .field("cookies", &self.cookies.len())
            .field("max_redirects", &self.max_redirects)
            .finish_non_exhaustive()
    }
}

/// Handle for sending messages on behalf of one subsystem
#[derive(Clone)]
pub struct HttpSender {
    ctx: Arc<TransportContext>,
    initiator: Initiator,
    validator: Option<Arc<dyn RedirectionValidator>>,
    cancel: CancelToken,
}

impl HttpSender {
    pub fn new(ctx: Arc<TransportContext>, initiator: Initiator) -> Self {
        HttpSender {
            ctx,
            initiator,
            validator: None,
            cancel: CancelToken::new(),
        }
    }

    /// A sender on the same context for another subsystem.
    ///
    /// Shares this sender's cancellation token.
    pub fn with_initiator(&self, initiator: Initiator) -> Self {
        HttpSender {
            initiator,
            ..self.clone()
        }
    }

    /// Use `validator` for every redirect this sender follows.
    pub fn with_redirection_validator(mut self, validator: Arc<dyn RedirectionValidator>) -> Self {
        self.validator = Some(validator);
        self
    }

    pub fn context(&self) -> &Arc<TransportContext> {
        &self.ctx
    }

    pub fn initiator(&self) -> Initiator {
        self.initiator
    }

    pub fn cancel_token(&self) -> &CancelToken {
        &self.cancel
    }

    /// Abort in-flight body reads and refuse further sends.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// Send a message and fill in its response.
    pub fn send_and_receive(&self, msg: &mut HttpMessage, follow_redirects: bool) -> Result<()> {
        let outcome = match self.validator.clone() {
            Some(validator) => self.dispatch(msg, follow_redirects, validator.as_ref(), None),
            None => self.dispatch(msg, follow_redirects, &PermissiveValidator, None),
        };
        outcome.map(|_| ())
    }

    /// Send with an explicit redirection policy, reporting what it rejected.
    pub fn send_and_receive_validated(
        &self,
        msg: &mut HttpMessage,
        follow_redirects: bool,
        validator: &dyn RedirectionValidator,
    ) -> Result<RedirectOutcome> {
        self.dispatch(msg, follow_redirects, validator, None)
    }

    /// Send within a given cookie session, bypassing re-authentication.
    ///
    /// Used by identities to replay their login into their own jar.
    pub fn send_in_session(
        &self,
        msg: &mut HttpMessage,
        jar: &CookieJar,
        follow_redirects: bool,
    ) -> Result<()> {
        self.dispatch(msg, follow_redirects, &PermissiveValidator, Some(jar))
            .map(|_| ())
    }

    fn dispatch(
        &self,
        msg: &mut HttpMessage,
        follow_redirects: bool,
        validator: &dyn RedirectionValidator,
        jar: Option<&CookieJar>,
    ) -> Result<RedirectOutcome> {
        let follower = RedirectFollower::new(validator);
        let user: Option<Arc<dyn Identity>> = msg.requesting_user().cloned();
        match user {
            Some(user) if jar.is_none() && self.reauthenticates(msg) => {
                auth::send_authenticated(self, user.as_ref(), msg, |m| {
                    follower.follow(self, m, follow_redirects, None)
                })
            }
            _ => follower.follow(self, msg, follow_redirects, jar),
        }
    }

    /// Re-authentication never applies to exchanges that are themselves
    /// part of authenticating.
    fn reauthenticates(&self, msg: &HttpMessage) -> bool {
        self.initiator != Initiator::Authentication && !msg.is_auth_exchange()
    }

    /// Release every pooled connection of the context.
    pub fn shutdown(&self) {
        self.ctx.shutdown();
    }
}

impl fmt::Debug for HttpSender {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HttpSender")
            .field("initiator", &self.initiator)
            .field("cancelled", &self.cancel.is_cancelled())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_initiator_names() {
        assert_eq!(Initiator::ActiveScanner.to_string(), "active-scanner");
        assert_eq!(Initiator::CheckForUpdates.as_str(), "check-for-updates");
    }

    #[test]
    fn test_with_initiator_shares_cancellation() {
        let ctx = TransportContext::new(SenderConfig::default()).unwrap();
        let spider = HttpSender::new(ctx.clone(), Initiator::Spider);
        let auth = spider.with_initiator(Initiator::Authentication);

        spider.cancel();
        assert!(auth.cancel_token().is_cancelled());
        assert_eq!(auth.initiator(), Initiator::Authentication);
        assert!(!auth.reauthenticates(&HttpMessage::get("http://example.com/")));
    }

    #[test]
    fn test_user_agent_is_runtime_configurable() {
        let ctx = TransportContext::new(SenderConfig::default().user_agent("agent/1")).unwrap();
        assert_eq!(ctx.user_agent().as_deref(), Some("agent/1"));
        ctx.set_user_agent(None);
        assert!(ctx.user_agent().is_none());
        ctx.shutdown();
    }
}
