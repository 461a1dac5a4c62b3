//! Connection pooling
//!
//! Two pools carry all pooled traffic: one for direct connections and one
//! for connections through the configured upstream proxy chain. Each pool
//! keys idle connections by scheme, host and port, caps open connections
//! per target and in total, and makes callers wait when a cap is reached.
//!
//! Requests that upgrade their connection never touch a pool; they get a
//! dedicated connection of their own.

mod connect;
pub mod proxy;

pub use connect::Connection;
pub use proxy::{ProxyChain, ProxyCredentials};

use crate::http::tls::TlsConfig;
use crate::http::{Error, Result, DEFAULT_HTTPS_PORT, DEFAULT_HTTP_PORT};
use std::collections::HashMap;
use std::fmt;
use std::ops::{Deref, DerefMut};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, RwLock};
use std::time::{Duration, Instant};
use url::Url;

/// Pool key: where a connection goes
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Target {
    pub https: bool,
    pub host: String,
    pub port: u16,
}

impl Target {
    pub fn new(https: bool, host: impl Into<String>, port: u16) -> Self {
        Target {
            https,
            host: host.into().to_ascii_lowercase(),
            port,
        }
    }

    pub fn from_url(url: &Url) -> Result<Self> {
        let https = match url.scheme() {
            "http" => false,
            "https" => true,
            other => return Err(Error::MalformedRequest(format!("unsupported scheme {}", other))),
        };
        let host = url
            .host_str()
            .filter(|h| !h.is_empty())
            .ok_or_else(|| Error::MalformedRequest(format!("{}: missing host", url)))?;
        // IPv6 literals come back bracketed
        let host = host.trim_start_matches('[').trim_end_matches(']');
        let port = url.port().unwrap_or(if https {
            DEFAULT_HTTPS_PORT
        } else {
            DEFAULT_HTTP_PORT
        });
        Ok(Target::new(https, host, port))
    }

    pub fn is_https(&self) -> bool {
        self.https
    }

    /// `host:port`, as used by `CONNECT`
    pub fn authority(&self) -> String {
        if self.host.contains(':') {
            format!("[{}]:{}", self.host, self.port)
        } else {
            format!("{}:{}", self.host, self.port)
        }
    }
}

impl fmt::Display for Target {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let scheme = if self.https { "https" } else { "http" };
        write!(f, "{}://{}", scheme, self.authority())
    }
}

/// Pool limits and connection settings
#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// Open connections allowed per target
    pub max_per_host: usize,
    /// Open connections allowed across all targets
    pub max_total: usize,
    /// Connect and read timeout
    pub timeout: Duration,
    /// Discard idle connections the peer has closed before reusing them
    pub stale_check: bool,
    /// How long a caller waits for a free connection slot
    pub acquire_timeout: Duration,
    /// Body buffer size of each connection
    pub buffer_size: usize,
}

impl Default for PoolConfig {
    fn default() -> Self {
        PoolConfig {
            max_per_host: usize::MAX / 2,
            max_total: 200,
            timeout: Duration::from_secs(60),
            stale_check: true,
            acquire_timeout: Duration::from_secs(60),
            buffer_size: crate::http::framing::DEFAULT_BUFFER_SIZE,
        }
    }
}

impl PoolConfig {
    pub fn max_per_host(mut self, max: usize) -> Self {
        self.max_per_host = max.max(1);
        self
    }

    pub fn max_total(mut self, max: usize) -> Self {
        self.max_total = max.max(1);
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn stale_check(mut self, enabled: bool) -> Self {
        self.stale_check = enabled;
        self
    }

    pub fn acquire_timeout(mut self, timeout: Duration) -> Self {
        self.acquire_timeout = timeout;
        self
    }

    pub fn buffer_size(mut self, size: usize) -> Self {
        self.buffer_size = size.max(1);
        self
    }
}

/// How a pool reaches its targets
#[derive(Debug, Clone)]
pub enum Route {
    Direct,
    Proxy(ProxyChain),
}

#[derive(Default)]
struct PoolState {
    idle: HashMap<Target, Vec<Connection>>,
    open_per_target: HashMap<Target, usize>,
    open_total: usize,
    shutdown: bool,
}

impl PoolState {
    fn open_for(&self, target: &Target) -> usize {
        self.open_per_target.get(target).copied().unwrap_or(0)
    }

    fn reserve(&mut self, target: &Target) {
        *self.open_per_target.entry(target.clone()).or_insert(0) += 1;
        self.open_total += 1;
    }

    fn forget(&mut self, target: &Target) {
        if let Some(count) = self.open_per_target.get_mut(target) {
            *count = count.saturating_sub(1);
            if *count == 0 {
                self.open_per_target.remove(target);
            }
        }
        self.open_total = self.open_total.saturating_sub(1);
    }

    /// Take one idle connection to some other target so its slot can be reused.
    fn evict_idle_except(&mut self, target: &Target) -> Option<Connection> {
        let victim = self
            .idle
            .iter()
            .find(|(key, conns)| *key != target && !conns.is_empty())
            .map(|(key, _)| key.clone())?;
        let conn = self.idle.get_mut(&victim).and_then(Vec::pop)?;
        if self.idle.get(&victim).is_some_and(Vec::is_empty) {
            self.idle.remove(&victim);
        }
        self.forget(&victim);
        Some(conn)
    }

    fn idle_count(&self) -> usize {
        self.idle.values().map(Vec::len).sum()
    }
}

/// A capped pool of connections sharing one route
pub struct ConnectionPool {
    name: &'static str,
    route: Route,
    config: PoolConfig,
    tls: TlsConfig,
    state: Mutex<PoolState>,
    released: Condvar,
}

impl ConnectionPool {
    pub fn new(name: &'static str, route: Route, config: PoolConfig, tls: TlsConfig) -> Self {
        ConnectionPool {
            name,
            route,
            config,
            tls,
            state: Mutex::new(PoolState::default()),
            released: Condvar::new(),
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn route(&self) -> &Route {
        &self.route
    }

    pub fn config(&self) -> &PoolConfig {
        &self.config
    }

    fn lock(&self) -> MutexGuard<'_, PoolState> {
        match self.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// Lease a connection to `target`, reusing an idle one when possible.
    ///
    /// Blocks while the pool is at capacity, up to the acquire timeout.
    pub fn acquire(self: &Arc<Self>, target: &Target) -> Result<PooledConnection> {
        let deadline = Instant::now() + self.config.acquire_timeout;
        let mut discarded = Vec::new();
        let mut state = self.lock();

        loop {
            if state.shutdown {
                return Err(Error::PoolShutdown);
            }

            while let Some(mut conn) = state.idle.get_mut(target).and_then(Vec::pop) {
                if self.config.stale_check && conn.is_stale() {
                    state.forget(target);
                    conn.close();
                    discarded.push(conn);
                    continue;
                }
                drop(state);
                log::trace!("[{}] reusing connection to {}", self.name, target);
                return Ok(PooledConnection::new(self.clone(), conn));
            }

            if state.open_for(target) < self.config.max_per_host {
                if state.open_total >= self.config.max_total {
                    if let Some(mut conn) = state.evict_idle_except(target) {
                        conn.close();
                        discarded.push(conn);
                    }
                }
                if state.open_total < self.config.max_total {
                    state.reserve(target);
                    break;
                }
            }

            let now = Instant::now();
            if now >= deadline {
                log::warn!("[{}] no connection available for {}", self.name, target);
                return Err(Error::PoolExhausted(target.to_string()));
            }
            state = match self.released.wait_timeout(state, deadline - now) {
                Ok((guard, _)) => guard,
                Err(poisoned) => poisoned.into_inner().0,
            };
        }
        drop(state);
        if !discarded.is_empty() {
            log::debug!("[{}] discarded {} stale connection(s)", self.name, discarded.len());
        }

        match connect::open(&self.route, target, &self.config, &self.tls) {
            Ok(conn) => {
                log::debug!("[{}] opened connection to {}", self.name, target);
                Ok(PooledConnection::new(self.clone(), conn))
            }
            Err(e) => {
                self.lock().forget(target);
                self.released.notify_one();
                Err(e)
            }
        }
    }

    /// Open a connection that is never pooled or counted.
    pub fn open_dedicated(&self, target: &Target) -> Result<Connection> {
        if self.lock().shutdown {
            return Err(Error::PoolShutdown);
        }
        connect::open(&self.route, target, &self.config, &self.tls)
    }

    fn release(&self, mut conn: Connection, reusable: bool) {
        let target = conn.target().clone();
        let mut state = self.lock();
        if reusable && !state.shutdown {
            state.idle.entry(target).or_default().push(conn);
        } else {
            state.forget(&target);
            drop(state);
            conn.close();
        }
        self.released.notify_one();
    }

    fn detach(&self, target: &Target) {
        self.lock().forget(target);
        self.released.notify_one();
    }

    /// Close idle connections and refuse further leases.
    ///
    /// Leased connections are closed when they come back.
    pub fn shutdown(&self) {
        let idle: Vec<Connection> = {
            let mut state = self.lock();
            state.shutdown = true;
            let idle: Vec<Connection> = state.idle.drain().flat_map(|(_, conns)| conns).collect();
            for conn in &idle {
                state.forget(conn.target());
            }
            idle
        };
        if !idle.is_empty() {
            log::debug!("[{}] closing {} idle connection(s)", self.name, idle.len());
        }
        for mut conn in idle {
            conn.close();
        }
        self.released.notify_all();
    }

    pub fn is_shutdown(&self) -> bool {
        self.lock().shutdown
    }

    /// Open connections, leased or idle
    pub fn open_count(&self) -> usize {
        self.lock().open_total
    }

    pub fn open_count_for(&self, target: &Target) -> usize {
        self.lock().open_for(target)
    }

    pub fn idle_count(&self) -> usize {
        self.lock().idle_count()
    }
}

impl fmt::Debug for ConnectionPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionPool")
            .field("name", &self.name)
            .field("route", &self.route)
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

/// A leased connection, returned to its pool on drop
pub struct PooledConnection {
    pool: Arc<ConnectionPool>,
    conn: Option<Connection>,
    reusable: bool,
}

impl PooledConnection {
    fn new(pool: Arc<ConnectionPool>, conn: Connection) -> Self {
        PooledConnection {
            pool,
            conn: Some(conn),
            reusable: false,
        }
    }

    /// Mark whether the connection can carry another exchange.
    ///
    /// Connections are closed on release unless marked reusable.
    pub fn set_reusable(&mut self, reusable: bool) {
        self.reusable = reusable;
    }

    /// Take the connection out of the pool for good.
    pub fn detach(mut self) -> Option<Connection> {
        let conn = self.conn.take()?;
        self.pool.detach(conn.target());
        Some(conn)
    }

    pub fn pool_name(&self) -> &'static str {
        self.pool.name()
    }
}

impl fmt::Debug for PooledConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PooledConnection")
            .field("pool", &self.pool.name())
            .field("target", &self.conn.as_ref().map(Connection::target))
            .field("reusable", &self.reusable)
            .finish()
    }
}

impl Deref for PooledConnection {
    type Target = Connection;

    fn deref(&self) -> &Connection {
        // Only `detach` and `drop` take the connection, and both consume the lease.
        match self.conn.as_ref() {
            Some(conn) => conn,
            None => unreachable!("pooled connection used after release"),
        }
    }
}

impl DerefMut for PooledConnection {
    fn deref_mut(&mut self) -> &mut Connection {
        match self.conn.as_mut() {
            Some(conn) => conn,
            None => unreachable!("pooled connection used after release"),
        }
    }
}

impl Drop for PooledConnection {
    fn drop(&mut self) {
        if let Some(conn) = self.conn.take() {
            self.pool.release(conn, self.reusable);
        }
    }
}

/// Source of connections for the sender
pub trait ConnectionProvider: Send + Sync {
    /// Whether requests to `host` go through the proxy chain.
    fn uses_proxy(&self, host: &str) -> bool;

    /// Lease a pooled connection to `target`.
    fn acquire(&self, target: &Target) -> Result<PooledConnection>;

    /// Open an unpooled connection for a request that upgrades it.
    fn open_dedicated(&self, target: &Target) -> Result<Connection>;

    /// Release every pooled connection.
    fn shutdown(&self);
}

/// The direct and proxied pools behind one proxy configuration
pub struct ConnectionManager {
    direct: Arc<ConnectionPool>,
    proxied: RwLock<Arc<ConnectionPool>>,
    chain: RwLock<Arc<ProxyChain>>,
    proxied_config: PoolConfig,
    tls: TlsConfig,
}

impl ConnectionManager {
    pub fn new(config: PoolConfig, tls: TlsConfig) -> Self {
        Self::with_proxy_chain(config, tls, ProxyChain::default())
    }

    pub fn with_proxy_chain(config: PoolConfig, tls: TlsConfig, chain: ProxyChain) -> Self {
        Self::with_pools(config.clone(), config, tls, chain)
    }

    /// Separately configured direct and proxied pools
    pub fn with_pools(
        direct_config: PoolConfig,
        proxied_config: PoolConfig,
        tls: TlsConfig,
        chain: ProxyChain,
    ) -> Self {
        let direct = Arc::new(ConnectionPool::new(
            "direct",
            Route::Direct,
            direct_config,
            tls.clone(),
        ));
        let proxied = Arc::new(Self::proxied_pool(&proxied_config, &tls, &chain));
        ConnectionManager {
            direct,
            proxied: RwLock::new(proxied),
            chain: RwLock::new(Arc::new(chain)),
            proxied_config,
            tls,
        }
    }

    fn proxied_pool(config: &PoolConfig, tls: &TlsConfig, chain: &ProxyChain) -> ConnectionPool {
        // Without a chain host the proxied pool degenerates to direct connections
        let route = if chain.is_configured() {
            Route::Proxy(chain.clone())
        } else {
            Route::Direct
        };
        ConnectionPool::new("proxied", route, config.clone(), tls.clone())
    }

    /// Replace the proxy chain.
    ///
    /// The new chain and its pool are published together; requests already
    /// holding a proxied connection finish on the old one.
    pub fn set_proxy_chain(&self, chain: ProxyChain) {
        let pool = Arc::new(Self::proxied_pool(&self.proxied_config, &self.tls, &chain));
        let old = {
            let mut proxied = match self.proxied.write() {
                Ok(guard) => guard,
                Err(poisoned) => poisoned.into_inner(),
            };
            let mut current = match self.chain.write() {
                Ok(guard) => guard,
                Err(poisoned) => poisoned.into_inner(),
            };
            *current = Arc::new(chain);
            std::mem::replace(&mut *proxied, pool)
        };
        log::info!("Proxy chain reconfigured");
        old.shutdown();
    }

    /// Current proxy chain snapshot
    pub fn proxy_chain(&self) -> Arc<ProxyChain> {
        match self.chain.read() {
            Ok(guard) => guard.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    pub fn direct_pool(&self) -> Arc<ConnectionPool> {
        self.direct.clone()
    }

    pub fn proxied_pool_handle(&self) -> Arc<ConnectionPool> {
        match self.proxied.read() {
            Ok(guard) => guard.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    /// Pool serving `host`
    pub fn pool_for(&self, host: &str) -> Arc<ConnectionPool> {
        if self.uses_proxy(host) {
            self.proxied_pool_handle()
        } else {
            self.direct.clone()
        }
    }
}

impl ConnectionProvider for ConnectionManager {
    fn uses_proxy(&self, host: &str) -> bool {
        self.proxy_chain().should_proxy(host)
    }

    fn acquire(&self, target: &Target) -> Result<PooledConnection> {
        self.pool_for(&target.host).acquire(target)
    }

    fn open_dedicated(&self, target: &Target) -> Result<Connection> {
        self.pool_for(&target.host).open_dedicated(target)
    }

    fn shutdown(&self) {
        self.direct.shutdown();
        self.proxied_pool_handle().shutdown();
    }
}

impl fmt::Debug for ConnectionManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionManager")
            .field("chain", &self.proxy_chain())
            .field("direct", &self.direct.config())
            .field("proxied", &self.proxied_config)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::TcpListener;
    use std::thread;

    fn tls() -> TlsConfig {
        TlsConfig::client().unwrap().build()
    }

    fn listener() -> (TcpListener, Target) {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        (listener, Target::new(false, "127.0.0.1", port))
    }

    #[test]
    fn test_target_from_url() {
        let target = Target::from_url(&Url::parse("https://Example.com/x").unwrap()).unwrap();
        assert_eq!(target, Target::new(true, "example.com", 443));
        assert_eq!(target.to_string(), "https://example.com:443");

        let target = Target::from_url(&Url::parse("http://[::1]:8080/").unwrap()).unwrap();
        assert_eq!(target.authority(), "[::1]:8080");
    }

    #[test]
    fn test_reuse_released_connection() {
        let (_listener, target) = listener();
        let pool = Arc::new(ConnectionPool::new(
            "test",
            Route::Direct,
            PoolConfig::default().stale_check(false),
            tls(),
        ));

        let mut lease = pool.acquire(&target).unwrap();
        lease.set_reusable(true);
        drop(lease);
        assert_eq!(pool.idle_count(), 1);

        let lease = pool.acquire(&target).unwrap();
        assert_eq!(pool.idle_count(), 0);
        assert_eq!(pool.open_count_for(&target), 1);
        drop(lease);

        // Not marked reusable: closed and uncounted
        assert_eq!(pool.open_count(), 0);
    }

    #[test]
    fn test_per_host_cap_blocks_until_release() {
        let (_listener, target) = listener();
        let pool = Arc::new(ConnectionPool::new(
            "test",
            Route::Direct,
            PoolConfig::default()
                .max_per_host(1)
                .stale_check(false)
                .acquire_timeout(Duration::from_secs(5)),
            tls(),
        ));

        let mut first = pool.acquire(&target).unwrap();
        first.set_reusable(true);

        let waiter = {
            let pool = pool.clone();
            let target = target.clone();
            thread::spawn(move || pool.acquire(&target).map(|lease| lease.exchanges()))
        };
        thread::sleep(Duration::from_millis(100));
        drop(first);

        assert_eq!(waiter.join().unwrap().unwrap(), 0);
        assert!(pool.open_count_for(&target) <= 1);
    }

    #[test]
    fn test_exhausted_pool_times_out() {
        let (_listener, target) = listener();
        let pool = Arc::new(ConnectionPool::new(
            "test",
            Route::Direct,
            PoolConfig::default()
                .max_total(1)
                .acquire_timeout(Duration::from_millis(50)),
            tls(),
        ));

        let held = pool.acquire(&target).unwrap();
        let err = pool.acquire(&target).unwrap_err();
        assert!(matches!(err, Error::PoolExhausted(_)));
        assert!(format!("{:?}", held).starts_with("PooledConnection"));
    }

    #[test]
    fn test_total_cap_evicts_idle_connection_to_other_host() {
        let (_a, first) = listener();
        let (_b, second) = listener();
        let pool = Arc::new(ConnectionPool::new(
            "test",
            Route::Direct,
            PoolConfig::default()
                .max_total(1)
                .stale_check(false)
                .acquire_timeout(Duration::from_millis(50)),
            tls(),
        ));

        let mut lease = pool.acquire(&first).unwrap();
        lease.set_reusable(true);
        drop(lease);

        let _lease = pool.acquire(&second).unwrap();
        assert_eq!(pool.open_count_for(&first), 0);
        assert_eq!(pool.open_count_for(&second), 1);
    }

    #[test]
    fn test_stale_idle_connection_is_replaced() {
        let (listener, target) = listener();
        let pool = Arc::new(ConnectionPool::new(
            "test",
            Route::Direct,
            PoolConfig::default(),
            tls(),
        ));

        let mut lease = pool.acquire(&target).unwrap();
        lease.set_reusable(true);
        drop(lease);

        // Peer closes the idle connection
        let (stream, _) = listener.accept().unwrap();
        drop(stream);
        thread::sleep(Duration::from_millis(50));

        let lease = pool.acquire(&target).unwrap();
        assert_eq!(lease.exchanges(), 0);
        assert_eq!(pool.open_count(), 1);
        assert_eq!(pool.idle_count(), 0);
    }

    #[test]
    fn test_shutdown_refuses_leases() {
        let (_listener, target) = listener();
        let pool = Arc::new(ConnectionPool::new(
            "test",
            Route::Direct,
            PoolConfig::default(),
            tls(),
        ));
        pool.shutdown();

        assert!(matches!(pool.acquire(&target), Err(Error::PoolShutdown)));
        assert!(pool.is_shutdown());
    }

    #[test]
    fn test_manager_selects_pool_by_proxy_chain() {
        let manager = ConnectionManager::with_proxy_chain(
            PoolConfig::default(),
            tls(),
            ProxyChain::new("127.0.0.1", 3128).skip_host("localhost"),
        );

        assert!(manager.uses_proxy("example.com"));
        assert!(!manager.uses_proxy("localhost"));
        assert_eq!(manager.pool_for("example.com").name(), "proxied");
        assert_eq!(manager.pool_for("localhost").name(), "direct");

        let old = manager.proxied_pool_handle();
        manager.set_proxy_chain(ProxyChain::default());
        assert!(old.is_shutdown());
        assert!(!manager.uses_proxy("example.com"));
        assert!(matches!(manager.proxied_pool_handle().route(), Route::Direct));
    }

    #[test]
    fn test_shutdown_without_use() {
        let manager = ConnectionManager::new(PoolConfig::default(), tls());
        manager.shutdown();
        manager.shutdown();
    }
}
