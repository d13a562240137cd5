//! Host-keyed façade over [`host::HostPool`].
//!
//! `ConnectionPool` is the only piece of this crate's pool layer most
//! embedders touch directly: it owns one `HostPool` per `"host:port"` key
//! and fans every call out to the right one, exactly as
//! `examples/original_source/src/holytls/pool/connection_pool.cc` does.

pub mod host;

use std::cell::RefCell;
use std::rc::Rc;

use crate::conn::protocol::StreamProtocol;
use crate::conn::tls::TlsSessionFactory;
use crate::dns::Resolver;
use crate::hash::HashMap;
use crate::reactor::Reactor;
use host::{ConnId, HostPool, HostPoolConfig};

/// Tunables shared by every host pool a [`ConnectionPool`] creates, lifted
/// from [`crate::config::Config`] at construction time.
#[derive(Debug, Clone, Copy)]
pub struct ConnectionPoolConfig {
    pub max_connections_per_host: usize,
    pub max_streams_per_connection: usize,
    pub idle_timeout_ms: u64,
    pub connect_timeout_ms: u64,
    pub dns_cache_ttl_ms: u64,
}

impl From<&crate::config::Config> for ConnectionPoolConfig {
    fn from(config: &crate::config::Config) -> Self {
        ConnectionPoolConfig {
            max_connections_per_host: config.max_connections_per_host,
            max_streams_per_connection: config.max_streams_per_connection,
            idle_timeout_ms: config.idle_timeout_ms,
            connect_timeout_ms: config.connect_timeout_ms,
            dns_cache_ttl_ms: config.dns_cache_ttl_ms,
        }
    }
}

/// A handle identifying one connection acquired through a
/// [`ConnectionPool`], combining the host key with the issuing
/// [`HostPool`]'s own [`ConnId`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PooledHandle {
    key: HostKey,
    id: ConnId,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct HostKey(Box<str>);

/// Builds the `"host:port"` cache/pool key: lowercased host, a colon, and
/// the decimal port with no leading zeros. No IDN normalization is
/// performed at this layer.
fn make_host_key(host: &str, port: u16) -> HostKey {
    HostKey(format!("{}:{port}", host.to_ascii_lowercase()).into_boxed_str())
}

/// Top-level connection pool: one [`HostPool`] per host, created on first
/// use and evicted once empty during [`ConnectionPool::cleanup_idle`].
pub struct ConnectionPool<F, P>
where
    F: TlsSessionFactory,
{
    config: ConnectionPoolConfig,
    tls_factory: F,
    host_pools: HashMap<HostKey, HostPool<F, P>>,
    resolver: Rc<RefCell<Resolver>>,
}

impl<F, P> ConnectionPool<F, P>
where
    F: TlsSessionFactory + Clone,
    P: StreamProtocol + Default + 'static,
    F::Session: 'static,
{
    /// Creates an empty pool. `tls_factory` is cloned into every host pool
    /// this façade creates; so is the shared DNS resolver, so hostname
    /// lookups across different host pools still hit one cache.
    pub fn new(config: ConnectionPoolConfig, tls_factory: F) -> Self {
        let resolver = Rc::new(RefCell::new(Resolver::new(config.dns_cache_ttl_ms)));
        ConnectionPool {
            config,
            tls_factory,
            host_pools: HashMap::default(),
            resolver,
        }
    }

    /// Finds or creates the `HostPool` for `host:port`.
    pub fn get_or_create_host_pool(&mut self, host: &str, port: u16) -> &mut HostPool<F, P> {
        let key = make_host_key(host, port);
        let resolver = self.resolver.clone();
        self.host_pools.entry(key.clone()).or_insert_with(|| {
            let host_config = HostPoolConfig {
                max_connections: self.config.max_connections_per_host,
                max_streams_per_connection: self.config.max_streams_per_connection,
                idle_timeout_ms: self.config.idle_timeout_ms,
                connect_timeout_ms: self.config.connect_timeout_ms,
            };
            HostPool::new(host, port, host_config, self.tls_factory.clone(), resolver)
        })
    }

    /// Acquires a connection with capacity for `host:port`, creating one if
    /// none is available. `host` is resolved internally — an IP literal
    /// dials directly, anything else goes through the shared DNS resolver —
    /// so callers never need to resolve an address themselves. Returns
    /// `None` only if the host pool is at capacity and every open connection
    /// already lacks room — callers should queue at a higher layer in that
    /// case.
    pub fn acquire_connection(
        &mut self,
        reactor: &mut Reactor,
        host: &str,
        port: u16,
        now_ms: u64,
    ) -> Option<PooledHandle> {
        let key = make_host_key(host, port);
        let pool = self.get_or_create_host_pool(host, port);
        pool.drive_pending_resolves(reactor);

        if let Some(id) = pool.acquire_connection(now_ms) {
            return Some(PooledHandle { key, id });
        }

        let id = pool.create_connection(reactor, now_ms).ok()?;
        pool.reserve(id, now_ms);
        Some(PooledHandle { key, id })
    }

    /// Releases a stream reservation on `handle`.
    pub fn release_connection(&mut self, reactor: &mut Reactor, handle: PooledHandle, now_ms: u64) {
        if let Some(pool) = self.host_pools.get_mut(&handle.key) {
            pool.drive_pending_resolves(reactor);
            pool.release_connection(reactor, handle.id, now_ms);
        }
    }

    /// Records a stream-level failure on `handle` (the pool-level alias of
    /// `FailConnection` in the original design).
    pub fn remove_connection(&mut self, reactor: &mut Reactor, handle: PooledHandle) {
        if let Some(pool) = self.host_pools.get_mut(&handle.key) {
            pool.fail_connection(reactor, handle.id);
        }
    }

    /// Runs idle cleanup on every host pool, then evicts any host pool left
    /// with zero connections. Returns the total number of connections
    /// closed.
    pub fn cleanup_idle(&mut self, reactor: &mut Reactor, now_ms: u64) -> usize {
        let mut closed = 0;
        for pool in self.host_pools.values_mut() {
            closed += pool.cleanup_idle(reactor, now_ms);
        }
        self.host_pools.retain(|_, pool| pool.total_connections() > 0);
        closed
    }

    /// Total connections across every host pool.
    pub fn total_connections(&self) -> usize {
        self.host_pools.values().map(HostPool::total_connections).sum()
    }

    /// Number of distinct hosts currently tracked.
    pub fn total_hosts(&self) -> usize {
        self.host_pools.len()
    }
}
