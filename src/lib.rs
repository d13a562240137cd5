//! Networking substrate for a browser-impersonating HTTPS client: a
//! single-threaded reactor, a bounded-cache async DNS resolver, a
//! per-socket connection state machine, and a per-host connection pool.
//!
//! TLS handshakes, HTTP framing, cookies, and redirects are explicitly out
//! of scope — [`conn::tls::TlsSessionFactory`] and
//! [`conn::protocol::StreamProtocol`] are the seams where an embedder plugs
//! those in. Everything here runs on one thread; the only operations safe
//! to call from another thread are [`reactor::Handle::post`] and
//! [`reactor::Handle::stop`].
//!
//! ```no_run
//! use impersonate_net::config::Config;
//! use impersonate_net::conn::protocol::NullProtocol;
//! use impersonate_net::conn::tls::PlaintextSessionFactory;
//! use impersonate_net::pool::{ConnectionPool, ConnectionPoolConfig};
//! use impersonate_net::reactor::{Reactor, ReactorConfig};
//!
//! let config = Config::default();
//! let mut reactor = Reactor::new(ReactorConfig::from(&config)).unwrap();
//! let mut pool: ConnectionPool<PlaintextSessionFactory, NullProtocol> =
//!     ConnectionPool::new(ConnectionPoolConfig::from(&config), PlaintextSessionFactory);
//! let _ = (&mut reactor, &mut pool);
//! ```

#[macro_use]
mod trace;

pub mod arena;
pub mod conn;
pub mod config;
pub mod dns;
pub mod error;
pub mod hash;
pub mod pool;
pub mod reactor;
mod sync;

pub use error::{Error, Kind, Result};
