//! Per-host connection bookkeeping: `PooledConnection` wraps a
//! [`Connection`] with acquire/release accounting; `HostPool` holds every
//! connection open to one `host:port` pair.

use std::cell::{Cell, RefCell};
use std::net::{IpAddr, SocketAddr};
use std::rc::Rc;

use crate::conn::protocol::StreamProtocol;
use crate::conn::tls::TlsSessionFactory;
use crate::conn::{ConnState, Connection};
use crate::dns::cache::ResolvedAddress;
use crate::dns::{resolve_async, Resolver};
use crate::error::{Error, Result};
use crate::reactor::{Handler, Reactor};

/// Opaque handle to a connection held by a [`HostPool`]. Stands in for the
/// original pointer-identity scheme: stable across `Vec` reshuffling, and
/// meaningless outside the `HostPool` that issued it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConnId(usize);

/// Per-host tunables, carried down from [`crate::config::Config`] by
/// [`crate::pool::ConnectionPool::get_or_create_host_pool`].
#[derive(Debug, Clone, Copy)]
pub struct HostPoolConfig {
    pub max_connections: usize,
    pub max_streams_per_connection: usize,
    pub idle_timeout_ms: u64,
    pub connect_timeout_ms: u64,
}

struct PooledConnection<F, P>
where
    F: TlsSessionFactory,
{
    id: ConnId,
    connection: Rc<RefCell<Connection<F, P>>>,
    created_ms: u64,
    last_used_ms: Rc<Cell<u64>>,
    active_stream_count: usize,
    max_streams: usize,
    consecutive_errors: u32,
    marked_for_removal: bool,
    /// Fed by `Connection::set_stream_failed_callback`; drained into
    /// `consecutive_errors` by `HostPool::reap_unhealthy` each turn.
    protocol_failures: Rc<Cell<u32>>,
    /// Set by `resolve_async`'s callback when this connection dialed a
    /// hostname rather than an IP literal; consumed by
    /// `HostPool::drive_pending_resolves`.
    resolve_outcome: Rc<RefCell<Option<Result<Vec<ResolvedAddress>>>>>,
}

impl<F, P> PooledConnection<F, P>
where
    F: TlsSessionFactory,
{
    fn is_idle(&self) -> bool {
        self.active_stream_count == 0
    }

    /// The lower of the protocol's own reported ceiling and the pool's
    /// configured one, so a protocol that negotiates a smaller limit (e.g.
    /// an h2 `SETTINGS` frame) is honored rather than overridden.
    fn effective_max_streams(&self) -> usize {
        self.connection
            .borrow()
            .max_streams()
            .map(|reported| reported.min(self.max_streams))
            .unwrap_or(self.max_streams)
    }

    fn has_capacity(&self) -> bool {
        self.active_stream_count < self.effective_max_streams()
    }
}

/// Every connection currently open (or connecting) to one host and port.
///
/// Acquire picks the `Ready` connection with the fewest active streams,
/// ties broken by vector order (the original's iteration-order rule).
/// Release and failure accounting follow
/// `examples/original_source/src/holytls/pool/host_pool.cc` one to one: a
/// connection past three consecutive errors, or already marked for removal,
/// is evicted on the next release (or immediately, if idle when it fails).
pub struct HostPool<F, P>
where
    F: TlsSessionFactory,
{
    host: Box<str>,
    port: u16,
    config: HostPoolConfig,
    tls_factory: F,
    connections: Vec<PooledConnection<F, P>>,
    next_id: usize,
    clock: Rc<Cell<u64>>,
    resolver: Rc<RefCell<Resolver>>,
}

impl<F, P> HostPool<F, P>
where
    F: TlsSessionFactory + Clone,
    P: StreamProtocol + Default + 'static,
    F::Session: 'static,
{
    /// Creates an empty pool for `host:port`.
    pub fn new(
        host: impl Into<Box<str>>,
        port: u16,
        config: HostPoolConfig,
        tls_factory: F,
        resolver: Rc<RefCell<Resolver>>,
    ) -> Self {
        HostPool {
            host: host.into(),
            port,
            config,
            tls_factory,
            connections: Vec::new(),
            next_id: 0,
            clock: Rc::new(Cell::new(0)),
            resolver,
        }
    }

    /// The host this pool serves.
    pub fn host(&self) -> &str {
        &self.host
    }

    /// The port this pool serves.
    pub fn port(&self) -> u16 {
        self.port
    }

    /// Total connections tracked, `Ready` or still connecting.
    pub fn total_connections(&self) -> usize {
        self.connections.len()
    }

    /// Connections currently carrying at least one stream.
    pub fn active_connections(&self) -> usize {
        self.connections.iter().filter(|pc| !pc.is_idle()).count()
    }

    /// Connections currently carrying zero streams.
    pub fn idle_connections(&self) -> usize {
        self.connections.iter().filter(|pc| pc.is_idle()).count()
    }

    /// Finds the `Ready` connection with spare capacity and the fewest
    /// active streams, reserves a stream slot on it, and returns its id.
    /// Returns `None` if no connection qualifies; the caller should then
    /// call [`HostPool::create_connection`].
    pub fn acquire_connection(&mut self, now_ms: u64) -> Option<ConnId> {
        self.clock.set(now_ms);
        let pc = self
            .connections
            .iter_mut()
            .filter(|pc| pc.connection.borrow().is_ready() && pc.has_capacity())
            .min_by_key(|pc| pc.active_stream_count)?;

        pc.active_stream_count += 1;
        pc.last_used_ms.set(now_ms);
        trace!(host = %self.host, id = pc.id.0, "acquired connection");
        Some(pc.id)
    }

    /// Reserves a stream slot on `id` directly, skipping the `Ready`/capacity
    /// checks [`HostPool::acquire_connection`] applies. Intended for the
    /// caller to use right after [`HostPool::create_connection`] hands back
    /// a brand-new connection for its first use.
    pub fn reserve(&mut self, id: ConnId, now_ms: u64) {
        self.clock.set(now_ms);
        if let Some(pc) = self.connections.iter_mut().find(|pc| pc.id == id) {
            pc.active_stream_count += 1;
            pc.last_used_ms.set(now_ms);
        }
    }

    /// Begins a new connection, refusing if the pool is already at
    /// [`HostPoolConfig::max_connections`]. The new connection is counted by
    /// [`HostPool::total_connections`] immediately but is not eligible for
    /// [`HostPool::acquire_connection`] until it reaches `Ready`.
    ///
    /// If this pool's host is an IP literal, the connection dials it
    /// directly; otherwise resolution is kicked off through
    /// [`crate::dns::resolve_async`] and the connection sits in
    /// [`ConnState::Resolving`] until a caller drives
    /// [`HostPool::drive_pending_resolves`]. Either way a connect-timeout
    /// timer is armed so a stalled resolve or handshake doesn't hold the
    /// slot forever.
    pub fn create_connection(&mut self, reactor: &mut Reactor, now_ms: u64) -> Result<ConnId> {
        self.clock.set(now_ms);
        self.reap_unhealthy(reactor);
        if self.connections.len() >= self.config.max_connections {
            return Err(Error::overloaded("host pool at max connections").with_host(self.host.clone()));
        }

        let id = ConnId(self.next_id);
        self.next_id += 1;

        let connection = Rc::new(RefCell::new(Connection::new(
            self.tls_factory.clone(),
            P::default(),
            self.host.clone(),
        )));

        let last_used_ms = Rc::new(Cell::new(now_ms));
        let cb_last_used = last_used_ms.clone();
        let cb_clock = self.clock.clone();
        connection.borrow_mut().set_idle_callback(move || {
            cb_last_used.set(cb_clock.get());
        });

        let protocol_failures = Rc::new(Cell::new(0u32));
        let cb_failures = protocol_failures.clone();
        connection.borrow_mut().set_stream_failed_callback(move |count| {
            cb_failures.set(cb_failures.get() + count);
        });

        let cb_host = self.host.clone();
        connection.borrow_mut().set_failure_callback(move |err| {
            warn!(host = %cb_host, id = id.0, error = %err, "pool noticed connection failure");
        });

        let timeout_conn = connection.clone();
        reactor.schedule_timer(self.config.connect_timeout_ms, move || {
            timeout_conn.borrow_mut().timeout_if_not_ready(Error::connect("connect timed out"));
        });

        let resolve_outcome = Rc::new(RefCell::new(None));

        match self.host.parse::<IpAddr>() {
            Ok(ip) => {
                let handler: Rc<RefCell<dyn Handler>> = connection.clone();
                let weak = Rc::downgrade(&handler);
                connection.borrow_mut().begin_connect(reactor, SocketAddr::new(ip, self.port), weak)?;
            }
            Err(_) => {
                connection.borrow_mut().mark_resolving();
                let cb_outcome = resolve_outcome.clone();
                resolve_async(&self.resolver, self.host.to_string(), now_ms, move |result| {
                    *cb_outcome.borrow_mut() = Some(result);
                });
            }
        }

        self.connections.push(PooledConnection {
            id,
            connection,
            created_ms: now_ms,
            last_used_ms,
            active_stream_count: 0,
            max_streams: self.config.max_streams_per_connection,
            consecutive_errors: 0,
            marked_for_removal: false,
            protocol_failures,
            resolve_outcome,
        });

        trace!(host = %self.host, id = id.0, "created connection");
        Ok(id)
    }

    /// Picks up completed DNS resolutions for connections still in
    /// [`ConnState::Resolving`]: begins the TCP connect on success, or fails
    /// the connection outright on an empty or erroring resolution. Must be
    /// called periodically by whatever owns the reactor (acquire, release,
    /// and cleanup all do this) so a resolved hostname's connect actually
    /// starts.
    pub fn drive_pending_resolves(&mut self, reactor: &mut Reactor) {
        for pc in &self.connections {
            if pc.connection.borrow().state() != ConnState::Resolving {
                continue;
            }
            let Some(result) = pc.resolve_outcome.borrow_mut().take() else {
                continue;
            };

            match result {
                Ok(addrs) if !addrs.is_empty() => {
                    let addr = SocketAddr::new(addrs[0].0, self.port);
                    let handler: Rc<RefCell<dyn Handler>> = pc.connection.clone();
                    let weak = Rc::downgrade(&handler);
                    if let Err(e) = pc.connection.borrow_mut().begin_connect(reactor, addr, weak) {
                        pc.connection.borrow_mut().timeout_if_not_ready(e);
                    }
                }
                Ok(_) => {
                    pc.connection.borrow_mut().timeout_if_not_ready(
                        Error::resolution(format!("{} resolved to no usable addresses", self.host))
                            .with_host(self.host.clone()),
                    );
                }
                Err(e) => {
                    pc.connection.borrow_mut().timeout_if_not_ready(e);
                }
            }
        }
        self.reap_unhealthy(reactor);
    }

    /// Releases one stream reservation on `id`. Unknown ids are ignored.
    /// Eviction of connections past their error threshold or left idle after
    /// marking is handled uniformly by [`HostPool::reap_unhealthy`].
    pub fn release_connection(&mut self, reactor: &mut Reactor, id: ConnId, now_ms: u64) {
        self.clock.set(now_ms);
        let Some(pc) = self.connections.iter_mut().find(|pc| pc.id == id) else {
            return;
        };
        pc.active_stream_count = pc.active_stream_count.saturating_sub(1);
        pc.last_used_ms.set(now_ms);
        self.reap_unhealthy(reactor);
    }

    /// Records a stream-level failure on `id`: increments its consecutive
    /// error count and marks it for removal. If the connection is currently
    /// idle it is removed immediately rather than waiting for a release.
    pub fn fail_connection(&mut self, reactor: &mut Reactor, id: ConnId) {
        let Some(pc) = self.connections.iter_mut().find(|pc| pc.id == id) else {
            return;
        };
        pc.consecutive_errors += 1;
        pc.marked_for_removal = true;
        self.reap_unhealthy(reactor);
    }

    /// Closes and removes `id` outright, regardless of its error or idle
    /// state. Unknown ids are ignored.
    pub fn remove_connection(&mut self, reactor: &mut Reactor, id: ConnId) {
        if let Some(index) = self.connections.iter().position(|pc| pc.id == id) {
            let pc = self.connections.remove(index);
            pc.connection.borrow_mut().close(reactor);
            trace!(host = %self.host, id = id.0, "removed connection");
        }
    }

    /// Closes every idle connection whose last use is at least
    /// `idle_timeout_ms` in the past. Returns the number closed.
    pub fn cleanup_idle(&mut self, reactor: &mut Reactor, now_ms: u64) -> usize {
        self.clock.set(now_ms);
        self.drive_pending_resolves(reactor);
        let expired: Vec<ConnId> = self
            .connections
            .iter()
            .filter(|pc| {
                pc.is_idle() && now_ms.saturating_sub(pc.last_used_ms.get()) >= self.config.idle_timeout_ms
            })
            .map(|pc| pc.id)
            .collect();

        let closed = expired.len();
        for id in expired {
            self.remove_connection(reactor, id);
        }
        closed
    }

    /// Merges accumulated stream-level failures into each connection's
    /// consecutive-error count, then evicts: connections that closed
    /// themselves (an internal connect/handshake/transport failure that
    /// never went through [`HostPool::fail_connection`]), and idle
    /// connections that are marked for removal or past the consecutive-error
    /// threshold.
    fn reap_unhealthy(&mut self, reactor: &mut Reactor) {
        for pc in &mut self.connections {
            let failures = pc.protocol_failures.replace(0);
            if failures > 0 {
                pc.consecutive_errors += failures;
                pc.marked_for_removal = true;
            }
        }

        let doomed: Vec<ConnId> = self
            .connections
            .iter()
            .filter(|pc| {
                pc.connection.borrow().state() == ConnState::Closed
                    || (pc.is_idle() && (pc.marked_for_removal || pc.consecutive_errors > 3))
            })
            .map(|pc| pc.id)
            .collect();

        for id in doomed {
            self.remove_connection(reactor, id);
        }
    }
}
