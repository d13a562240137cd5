//! Per-socket connection state machine: connect, handshake, then hand
//! readiness events to a [`protocol::StreamProtocol`].
//!
//! A [`Connection`] is always owned behind an `Rc<RefCell<_>>` by whatever
//! registers it with a [`Reactor`] — the reactor itself only ever holds the
//! `Weak` half, per [`crate::reactor::Handler`]'s contract. [`pool::host`]
//! is the intended owner; this module has no pool awareness of its own.

pub mod protocol;
pub mod socket;
pub mod tls;

use std::cell::RefCell;
use std::io;
use std::net::SocketAddr;
use std::rc::Weak;

use mio::net::TcpStream;
use socket2::SockRef;

use crate::error::{Error, Result};
use crate::reactor::{Descriptor, EventMask, Handler, Reactor};
use protocol::StreamProtocol;
use tls::{HandshakeStatus, TlsSession, TlsSessionFactory};

/// A connection's position in its connect/handshake/serve lifecycle.
///
/// Transitions are monotonic left to right except `Ready ↔ Idle`, which a
/// connection may cross freely as its stream count goes to and from zero.
/// `Closed` is terminal: once reached, no further transition is valid.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnState {
    /// Constructed but not yet asked to connect.
    Idle,
    /// Hostname resolution is outstanding (driven externally; see
    /// [`crate::dns::resolve_async`]).
    Resolving,
    /// Non-blocking `connect` is outstanding, awaiting writable readiness.
    Connecting,
    /// TCP is up; the TLS/protocol-upgrade handshake is in progress.
    Handshaking,
    /// Handshake complete; readiness events are forwarded to the protocol.
    Ready,
    /// Shutting down: no new streams accepted, waiting for existing ones to
    /// finish before closing.
    Draining,
    /// Terminal. The socket has been deregistered and dropped.
    Closed,
}

/// One TCP socket, optionally wrapped in a TLS session, carrying a
/// [`StreamProtocol`]. Implements [`Handler`] so it can be registered
/// directly with a [`Reactor`].
pub struct Connection<F, P>
where
    F: TlsSessionFactory,
{
    state: ConnState,
    host: Box<str>,
    stream: Option<TcpStream>,
    descriptor: Option<Descriptor>,
    tls_factory: F,
    session: Option<F::Session>,
    protocol: Option<P>,
    was_idle: bool,
    on_idle: Option<Box<dyn FnMut()>>,
    on_failed: Option<Box<dyn FnMut(&Error)>>,
    on_stream_failed: Option<Box<dyn FnMut(u32)>>,
}

impl<F, P> Connection<F, P>
where
    F: TlsSessionFactory,
    P: StreamProtocol,
{
    /// Creates a connection for `host`, not yet connected. `protocol` is
    /// installed up front and only driven once the handshake completes.
    pub fn new(tls_factory: F, protocol: P, host: impl Into<Box<str>>) -> Self {
        Connection {
            state: ConnState::Idle,
            host: host.into(),
            stream: None,
            descriptor: None,
            tls_factory,
            session: None,
            protocol: Some(protocol),
            was_idle: true,
            on_idle: None,
            on_failed: None,
            on_stream_failed: None,
        }
    }

    /// Current lifecycle state.
    pub fn state(&self) -> ConnState {
        self.state
    }

    /// Hostname this connection was opened against, used for error
    /// attribution and SNI.
    pub fn host(&self) -> &str {
        &self.host
    }

    /// True in `Ready`, the only state that may carry active streams.
    pub fn is_ready(&self) -> bool {
        matches!(self.state, ConnState::Ready)
    }

    /// The protocol's own idea of whether it is carrying any streams.
    /// `true` before a protocol is installed or once handshake is done and
    /// nothing is in flight.
    pub fn is_idle(&self) -> bool {
        self.protocol.as_ref().map(StreamProtocol::is_idle).unwrap_or(true)
    }

    /// Installs the callback run (on the reactor thread) the moment this
    /// connection's protocol reports zero active streams, mirroring the
    /// pool's need to refresh `last_used_ms` on every idle transition.
    pub fn set_idle_callback(&mut self, callback: impl FnMut() + 'static) {
        self.on_idle = Some(Box::new(callback));
    }

    /// Installs the callback run when this connection transitions to
    /// `Closed` due to a connect, handshake, or transport error.
    pub fn set_failure_callback(&mut self, callback: impl FnMut(&Error) + 'static) {
        self.on_failed = Some(Box::new(callback));
    }

    /// Installs the callback run (on the reactor thread) whenever the
    /// installed [`StreamProtocol`] reports stream-level failures via
    /// [`StreamProtocol::take_stream_failures`] — failures that don't close
    /// the whole connection but should still count against a pool's
    /// consecutive-error eviction threshold.
    pub fn set_stream_failed_callback(&mut self, callback: impl FnMut(u32) + 'static) {
        self.on_stream_failed = Some(Box::new(callback));
    }

    /// The installed protocol's own idea of its per-connection stream
    /// ceiling (`None` before a protocol is installed, which never happens
    /// outside of tests — [`Connection::new`] always installs one).
    pub fn max_streams(&self) -> Option<usize> {
        self.protocol.as_ref().map(StreamProtocol::max_streams)
    }

    /// Marks the connection as waiting on DNS resolution, for owners that
    /// want a pool-visible placeholder before the address is known.
    pub fn mark_resolving(&mut self) {
        debug_assert!(matches!(self.state, ConnState::Idle));
        self.state = ConnState::Resolving;
    }

    /// Fails the connection with `err` if it hasn't already reached `Ready`
    /// (or beyond). Intended for an owner driving a connect-timeout timer:
    /// calling this after the connection already completed its handshake is
    /// a harmless no-op.
    pub fn timeout_if_not_ready(&mut self, err: Error) {
        if !matches!(self.state, ConnState::Ready | ConnState::Draining | ConnState::Closed) {
            self.fail(err);
        }
    }

    /// Begins a non-blocking connect to `addr` and registers the socket with
    /// `reactor`. `handler` must be a `Weak` reference to the `Rc<RefCell<_>>`
    /// that owns this `Connection`.
    pub fn begin_connect(
        &mut self,
        reactor: &mut Reactor,
        addr: SocketAddr,
        handler: Weak<RefCell<dyn Handler>>,
    ) -> Result<()> {
        debug_assert!(matches!(self.state, ConnState::Idle | ConnState::Resolving));

        let mut stream = socket::connect_nonblocking(addr)
            .map_err(|e| Error::connect(e).with_host(self.host.clone()))?;

        let mask = EventMask::READABLE | EventMask::WRITABLE | EventMask::DISCONNECT;
        let descriptor = reactor
            .add(&mut stream, mask, handler)
            .map_err(|e| e.with_host(self.host.clone()))?;

        self.stream = Some(stream);
        self.descriptor = Some(descriptor);
        self.state = ConnState::Connecting;
        trace!(host = %self.host, "connecting");
        Ok(())
    }

    /// Marks the connection for shutdown: once its protocol goes idle it is
    /// safe for the owner to call [`Connection::close`].
    pub fn mark_draining(&mut self) {
        if matches!(self.state, ConnState::Ready) {
            self.state = ConnState::Draining;
        }
    }

    /// Deregisters the socket from `reactor` and transitions to `Closed`.
    /// Idempotent: closing an already-closed connection is a no-op.
    pub fn close(&mut self, reactor: &mut Reactor) {
        if let (Some(mut stream), Some(descriptor)) = (self.stream.take(), self.descriptor.take())
        {
            let _ = reactor.remove(&mut stream, descriptor);
        }
        self.state = ConnState::Closed;
    }

    fn finish_connect(&self) -> Result<()> {
        let stream = self
            .stream
            .as_ref()
            .expect("finish_connect called without an open socket");
        let sock = SockRef::from(stream);
        match sock.take_error() {
            Ok(None) => Ok(()),
            Ok(Some(e)) | Err(e) => Err(Error::connect(e).with_host(self.host.clone())),
        }
    }

    fn drive_connecting(&mut self) {
        if let Err(e) = self.finish_connect() {
            self.fail(e);
            return;
        }

        self.state = ConnState::Handshaking;
        match self.tls_factory.new_session(&self.host) {
            Ok(session) => {
                self.session = Some(session);
                trace!(host = %self.host, "handshaking");
                self.drive_handshake();
            }
            Err(e) => self.fail(e.with_host(self.host.clone())),
        }
    }

    fn drive_handshake(&mut self) {
        let Some(session) = self.session.as_mut() else {
            return;
        };
        match session.advance_handshake() {
            Ok(HandshakeStatus::InProgress) => {}
            Ok(HandshakeStatus::Complete) => {
                self.state = ConnState::Ready;
                trace!(host = %self.host, "ready");
                self.notify_idle_if_needed();
            }
            Err(e) => self.fail(e.with_host(self.host.clone())),
        }
    }

    fn drive_protocol_readable(&mut self) {
        if let Some(protocol) = self.protocol.as_mut() {
            if let Err(e) = protocol.on_readable() {
                self.fail(e.with_host(self.host.clone()));
                return;
            }
        }
        self.after_protocol_turn();
    }

    fn drive_protocol_writable(&mut self) {
        if let Some(protocol) = self.protocol.as_mut() {
            if let Err(e) = protocol.on_writable() {
                self.fail(e.with_host(self.host.clone()));
                return;
            }
        }
        self.after_protocol_turn();
    }

    fn after_protocol_turn(&mut self) {
        self.notify_idle_if_needed();
        self.notify_stream_failures_if_any();
        if matches!(self.state, ConnState::Draining) && self.is_idle() {
            self.state = ConnState::Closed;
        }
    }

    fn notify_stream_failures_if_any(&mut self) {
        let count = self.protocol.as_mut().map_or(0, StreamProtocol::take_stream_failures);
        if count > 0 {
            if let Some(cb) = self.on_stream_failed.as_mut() {
                cb(count);
            }
        }
    }

    fn notify_idle_if_needed(&mut self) {
        let idle = self.is_idle();
        if idle && !self.was_idle {
            if let Some(cb) = self.on_idle.as_mut() {
                cb();
            }
        }
        self.was_idle = idle;
    }

    fn fail(&mut self, err: Error) {
        warn!(host = %self.host, error = %err, "connection failed");
        self.state = ConnState::Closed;
        if let Some(cb) = self.on_failed.as_mut() {
            cb(&err);
        }
    }
}

impl<F, P> Handler for Connection<F, P>
where
    F: TlsSessionFactory,
    P: StreamProtocol,
{
    fn on_readable(&mut self) {
        match self.state {
            ConnState::Handshaking => self.drive_handshake(),
            ConnState::Ready | ConnState::Draining => self.drive_protocol_readable(),
            _ => {}
        }
    }

    fn on_writable(&mut self) {
        match self.state {
            ConnState::Connecting => self.drive_connecting(),
            ConnState::Handshaking => self.drive_handshake(),
            ConnState::Ready | ConnState::Draining => self.drive_protocol_writable(),
            _ => {}
        }
    }

    fn on_error(&mut self, err: io::Error) {
        self.fail(Error::transport(err).with_host(self.host.clone()));
    }

    fn on_close(&mut self) {
        if !matches!(self.state, ConnState::Closed) {
            self.fail(Error::transport("peer closed connection").with_host(self.host.clone()));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reactor::{Reactor, ReactorConfig};
    use protocol::NullProtocol;
    use std::cell::RefCell;
    use std::net::TcpListener;
    use std::rc::Rc;
    use std::time::Duration;
    use tls::PlaintextSessionFactory;

    fn run_until_ready(
        reactor: &mut Reactor,
        conn: &Rc<RefCell<Connection<PlaintextSessionFactory, NullProtocol>>>,
    ) {
        for _ in 0..50 {
            if conn.borrow().is_ready() {
                return;
            }
            reactor
                .run_once(Some(Duration::from_millis(20)))
                .unwrap();
        }
        panic!("connection never reached Ready");
    }

    #[test]
    fn connects_and_reaches_ready() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();

        let mut reactor = Reactor::new(ReactorConfig::default()).unwrap();
        let conn = Rc::new(RefCell::new(Connection::new(
            PlaintextSessionFactory,
            NullProtocol,
            "127.0.0.1",
        )));

        let handler: Rc<RefCell<dyn Handler>> = conn.clone();
        let weak = Rc::downgrade(&handler);
        conn.borrow_mut()
            .begin_connect(&mut reactor, addr, weak)
            .unwrap();

        run_until_ready(&mut reactor, &conn);
        assert_eq!(conn.borrow().state(), ConnState::Ready);
        assert!(conn.borrow().is_idle());
    }

    #[test]
    fn connect_failure_reaches_closed() {
        let mut reactor = Reactor::new(ReactorConfig::default()).unwrap();
        let conn = Rc::new(RefCell::new(Connection::new(
            PlaintextSessionFactory,
            NullProtocol,
            "127.0.0.1",
        )));

        // Port 1 is reserved and should refuse the connection quickly.
        let addr: SocketAddr = "127.0.0.1:1".parse().unwrap();
        let handler: Rc<RefCell<dyn Handler>> = conn.clone();
        let weak = Rc::downgrade(&handler);

        if conn.borrow_mut().begin_connect(&mut reactor, addr, weak).is_err() {
            assert_eq!(conn.borrow().state(), ConnState::Idle);
            return;
        }

        for _ in 0..50 {
            if matches!(conn.borrow().state(), ConnState::Closed) {
                break;
            }
            reactor.run_once(Some(Duration::from_millis(20))).unwrap();
        }
        assert_eq!(conn.borrow().state(), ConnState::Closed);
    }

    #[test]
    fn mark_draining_closes_once_idle() {
        let mut conn = Connection::new(PlaintextSessionFactory, NullProtocol, "example.com");
        conn.state = ConnState::Ready;
        conn.mark_draining();
        assert_eq!(conn.state(), ConnState::Draining);
        conn.after_protocol_turn();
        assert_eq!(conn.state(), ConnState::Closed);
    }

    #[test]
    fn idle_callback_fires_once_on_transition() {
        let mut conn = Connection::new(PlaintextSessionFactory, NullProtocol, "example.com");
        let fired = Rc::new(RefCell::new(0));
        let f = fired.clone();
        conn.set_idle_callback(move || *f.borrow_mut() += 1);
        conn.was_idle = false;
        conn.notify_idle_if_needed();
        conn.notify_idle_if_needed();
        assert_eq!(*fired.borrow(), 1);
    }
}
