//! Cache-then-worker-thread async DNS resolution.
//!
//! [`Resolver`] pairs the fixed-size [`cache::DnsCache`] with
//! [`gai::GaiResolver`]'s blocking-pool worker hop. Cache reads and writes
//! only ever happen from the thread that owns the `Resolver`; the worker
//! side sees nothing but an owned hostname in and an owned address list
//! out, so it can run on any executor thread.

pub mod cache;
pub mod gai;

use std::cell::RefCell;
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::rc::{Rc, Weak};
use std::str::FromStr;
use std::sync::Arc;
use std::task::{Context, Poll};

use tower_service::Service;

use crate::error::{BoxError, Error, Result};
use cache::{DnsCache, ResolvedAddress, DEFAULT_CACHE_TTL_MS};
use gai::GaiResolver;

/// A hostname to resolve, validated enough to rule out the empty string.
#[derive(Clone, Hash, Eq, PartialEq)]
pub struct Name(Box<str>);

impl Name {
    /// Wraps `host` as a [`Name`] without validation.
    pub fn new(host: impl Into<Box<str>>) -> Name {
        Name(host.into())
    }

    /// Borrows the hostname as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for Name {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(&self.0, f)
    }
}

impl fmt::Display for Name {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.0, f)
    }
}

/// Error returned by [`Name::from_str`] for an empty hostname.
#[derive(Debug)]
pub struct InvalidNameError(());

impl fmt::Display for InvalidNameError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("not a valid hostname")
    }
}

impl std::error::Error for InvalidNameError {}

impl FromStr for Name {
    type Err = InvalidNameError;

    fn from_str(host: &str) -> std::result::Result<Self, Self::Err> {
        if host.is_empty() {
            return Err(InvalidNameError(()));
        }
        Ok(Name::new(host))
    }
}

/// Boxed iterator of resolved addresses, the result type a [`Resolve`]
/// implementation produces.
pub type Addrs = Box<dyn Iterator<Item = ResolvedAddress> + Send>;

/// Boxed future a [`Resolve`] implementation returns.
pub type Resolving = Pin<Box<dyn Future<Output = std::result::Result<Addrs, BoxError>> + Send>>;

/// Customization point for DNS resolution, mirroring the collaborator shape
/// this crate's connection state machine expects from its resolver. This
/// crate ships [`gai::GaiResolver`] as the default implementation; embedders
/// may substitute their own (DoH, hosts-file overrides, test doubles).
pub trait Resolve: Send + Sync {
    /// Resolves `name` into zero or more addresses.
    fn resolve(&self, name: Name) -> Resolving;
}

impl Resolve for GaiResolver {
    fn resolve(&self, name: Name) -> Resolving {
        let resolver = *self;
        Box::pin(async move {
            resolver
                .resolve(name.as_str().to_string())
                .await
                .map(|addrs| Box::new(addrs.into_iter()) as Addrs)
                .map_err(|e| Box::new(e) as BoxError)
        })
    }
}

/// Adapts a `Resolve` trait object to `tower_service::Service<Name>`, for
/// embedding into a `tower` stack the way the rest of the connector
/// pipeline is built.
#[derive(Clone)]
pub struct DynResolver {
    resolver: Arc<dyn Resolve>,
}

impl DynResolver {
    /// Wraps `resolver` for use as a `Service<Name>`.
    pub fn new(resolver: Arc<dyn Resolve>) -> Self {
        DynResolver { resolver }
    }
}

impl Service<Name> for DynResolver {
    type Response = Addrs;
    type Error = BoxError;
    type Future = Resolving;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<std::result::Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, name: Name) -> Self::Future {
        self.resolver.resolve(name)
    }
}

/// Cache-then-worker async resolver. Not `Send`/`Sync`: every instance is
/// owned by the single thread that drives its reactor, matching the
/// thread-confinement rule in the resolver's design.
pub struct Resolver {
    cache: DnsCache,
    gai: GaiResolver,
}

impl Resolver {
    /// Creates a resolver whose cache entries live for `ttl_ms`.
    pub fn new(ttl_ms: u64) -> Self {
        Resolver {
            cache: DnsCache::new(ttl_ms),
            gai: GaiResolver::new(),
        }
    }

    /// Synchronous cache-only lookup. Must only be called from the thread
    /// that owns this resolver.
    pub fn lookup(&mut self, hostname: &str, now_ms: u64) -> Option<Vec<ResolvedAddress>> {
        self.cache.find(hostname, now_ms)
    }

    /// Stores a resolution result, typically one produced by a worker task
    /// started from [`resolve_async`].
    pub fn store(&mut self, hostname: &str, addresses: &[ResolvedAddress], now_ms: u64) -> Result<()> {
        self.cache
            .store(hostname, addresses, now_ms)
            .map_err(|_| Error::overloaded("dns cache rejected oversized hostname"))
    }

    /// Clears every cached entry.
    pub fn clear_cache(&mut self) {
        self.cache.clear();
    }

    /// Total cache hits since creation.
    pub fn cache_hits(&self) -> u64 {
        self.cache.hits()
    }

    /// Total cache misses since creation.
    pub fn cache_misses(&self) -> u64 {
        self.cache.misses()
    }
}

impl Default for Resolver {
    fn default() -> Self {
        Resolver::new(DEFAULT_CACHE_TTL_MS)
    }
}

/// Resolves `hostname`, consulting the cache first and falling back to a
/// `tokio` blocking-pool worker on a miss. `callback` always runs on the
/// thread that owns `resolver`: on a cache hit, synchronously before this
/// function returns; on a miss, once the worker task completes.
///
/// The worker hop itself (inside [`gai::GaiResolver::resolve`]) is a real
/// cross-thread jump to the blocking pool and only ever touches an owned
/// hostname `String` and an owned `Vec<ResolvedAddress>`. The task awaiting
/// that hop is spawned with [`tokio::task::spawn_local`] rather than
/// `tokio::spawn`, since it closes over `resolver` itself (`Rc`-based, not
/// `Send`) to store the result — callers must run their reactor loop inside
/// a `tokio::task::LocalSet` for this task to make progress.
///
/// `now_ms` is used both for the cache lookup and, on a miss, to stamp the
/// freshly stored entry — the worker hop is short enough relative to the
/// cache TTL that using the call-time timestamp rather than refetching the
/// clock on completion does not matter in practice.
pub fn resolve_async(
    resolver: &Rc<RefCell<Resolver>>,
    hostname: impl Into<String>,
    now_ms: u64,
    callback: impl FnOnce(Result<Vec<ResolvedAddress>>) + 'static,
) {
    let hostname = hostname.into();

    if let Some(cached) = resolver.borrow_mut().lookup(&hostname, now_ms) {
        trace!(host = %hostname, "dns cache hit");
        callback(Ok(cached));
        return;
    }

    trace!(host = %hostname, "dns cache miss, spawning worker");
    let gai = resolver.borrow().gai;
    let weak: Weak<RefCell<Resolver>> = Rc::downgrade(resolver);
    let worker_hostname = hostname.clone();

    tokio::task::spawn_local(async move {
        let result = gai.resolve(worker_hostname.clone()).await;
        if let (Ok(addrs), Some(resolver)) = (&result, weak.upgrade()) {
            let _ = resolver.borrow_mut().store(&worker_hostname, addrs, now_ms);
        }
        callback(result);
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;

    #[test]
    fn name_rejects_empty_string() {
        assert!(Name::from_str("").is_err());
        assert!(Name::from_str("example.com").is_ok());
    }

    #[test]
    fn cache_hit_then_miss_counts() {
        let mut resolver = Resolver::new(60_000);
        assert!(resolver.lookup("example.com", 0).is_none());
        resolver
            .store(
                "example.com",
                &[ResolvedAddress(std::net::IpAddr::V4(std::net::Ipv4Addr::LOCALHOST))],
                0,
            )
            .unwrap();
        assert!(resolver.lookup("example.com", 0).is_some());
        assert_eq!(resolver.cache_hits(), 1);
        assert_eq!(resolver.cache_misses(), 1);
    }

    #[tokio::test]
    async fn resolve_async_hits_cache_synchronously() {
        let local = tokio::task::LocalSet::new();
        local
            .run_until(async {
                let resolver = Rc::new(RefCell::new(Resolver::new(60_000)));
                resolver
                    .borrow_mut()
                    .store(
                        "cached.example.com",
                        &[ResolvedAddress(std::net::IpAddr::V4(std::net::Ipv4Addr::LOCALHOST))],
                        0,
                    )
                    .unwrap();

                let called = Rc::new(Cell::new(false));
                let c = called.clone();
                resolve_async(&resolver, "cached.example.com", 0, move |result| {
                    assert!(result.is_ok());
                    c.set(true);
                });
                assert!(called.get());
            })
            .await;
    }

    #[tokio::test]
    async fn resolve_async_misses_go_through_worker() {
        let local = tokio::task::LocalSet::new();
        local
            .run_until(async {
                let resolver = Rc::new(RefCell::new(Resolver::new(60_000)));

                let done = Rc::new(Cell::new(false));
                let d = done.clone();
                resolve_async(&resolver, "127.0.0.1", 0, move |result| {
                    assert!(result.is_ok());
                    d.set(true);
                });

                for _ in 0..50 {
                    if done.get() {
                        break;
                    }
                    tokio::time::sleep(std::time::Duration::from_millis(20)).await;
                }
                assert!(done.get());
                assert!(resolver.borrow_mut().lookup("127.0.0.1", 0).is_some());
            })
            .await;
    }
}
