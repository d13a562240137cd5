//! End-to-end scenarios against a local TCP listener, exercising the
//! reactor/pool stack the way an embedder's connector would: no protocol
//! framing, just the connect/handshake/ready lifecycle and the pool's
//! acquire/release/fail/cleanup bookkeeping.

use std::net::TcpListener;
use std::thread;
use std::time::Duration;

use impersonate_net::conn::protocol::NullProtocol;
use impersonate_net::conn::tls::PlaintextSessionFactory;
use impersonate_net::pool::{ConnectionPool, ConnectionPoolConfig};
use impersonate_net::reactor::{Reactor, ReactorConfig};

fn pool_config(max_connections: usize, max_streams: usize) -> ConnectionPoolConfig {
    ConnectionPoolConfig {
        max_connections_per_host: max_connections,
        max_streams_per_connection: max_streams,
        idle_timeout_ms: 1_000,
        connect_timeout_ms: 30_000,
        dns_cache_ttl_ms: 60_000,
    }
}

fn pump(reactor: &mut Reactor) {
    for _ in 0..100 {
        reactor.run_once(Some(Duration::from_millis(10))).unwrap();
    }
}

/// Scenario 1 (spec §8): cold acquire against an empty pool creates exactly
/// one host pool and one connection.
#[test]
fn cold_acquire_then_warm_reuse() {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();
    let mut reactor = Reactor::new(ReactorConfig::default()).unwrap();
    let mut pool = ConnectionPool::<_, NullProtocol>::new(pool_config(8, 100), PlaintextSessionFactory);

    let first = pool
        .acquire_connection(&mut reactor, "127.0.0.1", addr.port(), 0)
        .expect("cold acquire should succeed");
    pump(&mut reactor);

    assert_eq!(pool.total_connections(), 1);
    assert_eq!(pool.total_hosts(), 1);

    // Scenario 2: release then acquire again reuses the same connection
    // rather than dialing a new one.
    pool.release_connection(&mut reactor, first, 1);
    let second = pool
        .acquire_connection(&mut reactor, "127.0.0.1", addr.port(), 2)
        .expect("warm acquire should succeed");
    pump(&mut reactor);

    assert_eq!(pool.total_connections(), 1);
    pool.release_connection(&mut reactor, second, 3);
}

/// Scenario 3: an idle connection past `idle_timeout_ms` is evicted, and
/// its now-empty host pool is evicted along with it.
#[test]
fn idle_connection_is_evicted_with_its_host_pool() {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();
    let mut reactor = Reactor::new(ReactorConfig::default()).unwrap();
    let mut pool = ConnectionPool::<_, NullProtocol>::new(pool_config(8, 100), PlaintextSessionFactory);

    let handle = pool
        .acquire_connection(&mut reactor, "127.0.0.1", addr.port(), 0)
        .unwrap();
    pump(&mut reactor);
    pool.release_connection(&mut reactor, handle, 0);

    assert_eq!(pool.cleanup_idle(&mut reactor, 1_001), 1);
    assert_eq!(pool.total_connections(), 0);
    assert_eq!(pool.total_hosts(), 0);
}

/// Scenario 4: with a single allowed connection capped at four streams, a
/// fifth acquire is refused outright; releasing one frees a slot and the
/// next acquire is served by the very same connection.
#[test]
fn stream_ceiling_blocks_until_release() {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();
    let mut reactor = Reactor::new(ReactorConfig::default()).unwrap();
    let mut pool = ConnectionPool::<_, NullProtocol>::new(pool_config(1, 4), PlaintextSessionFactory);

    let mut handles = Vec::new();
    for i in 0..4 {
        let h = pool
            .acquire_connection(&mut reactor, "127.0.0.1", addr.port(), i)
            .unwrap_or_else(|| panic!("acquire {i} should have capacity"));
        pump(&mut reactor);
        handles.push(h);
    }
    assert_eq!(pool.total_connections(), 1, "all four streams share one connection");

    let overflow = pool.acquire_connection(&mut reactor, "127.0.0.1", addr.port(), 10);
    assert!(overflow.is_none(), "fifth acquire must be refused, not overflow a connection's cap");

    let freed = handles.pop().unwrap();
    pool.release_connection(&mut reactor, freed, 11);
    let reacquired = pool
        .acquire_connection(&mut reactor, "127.0.0.1", addr.port(), 12)
        .expect("acquire after release should succeed");
    assert_eq!(pool.total_connections(), 1, "still just the one connection");
    let _ = reacquired;
}

/// Scenario 5: three consecutive stream failures mark a connection for
/// removal; it is evicted once its last stream releases.
#[test]
fn three_failures_then_release_evicts() {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();
    let mut reactor = Reactor::new(ReactorConfig::default()).unwrap();
    let mut pool = ConnectionPool::<_, NullProtocol>::new(pool_config(8, 4), PlaintextSessionFactory);

    let handle = pool
        .acquire_connection(&mut reactor, "127.0.0.1", addr.port(), 0)
        .unwrap();
    pump(&mut reactor);

    pool.remove_connection(&mut reactor, handle);
    pool.remove_connection(&mut reactor, handle);
    pool.remove_connection(&mut reactor, handle);
    assert_eq!(pool.total_connections(), 1, "still holding its one active stream");

    pool.release_connection(&mut reactor, handle, 1);
    assert_eq!(pool.total_connections(), 0);
}

/// Scenario 6: `Stop()` called from another thread unblocks a `Run()` loop
/// promptly and leaves it in the stopped state, without deadlocking.
#[test]
fn cross_thread_stop_unblocks_run() {
    let mut reactor = Reactor::new(ReactorConfig::default()).unwrap();
    let handle = reactor.handle();

    let stopper = thread::spawn(move || {
        thread::sleep(Duration::from_millis(50));
        handle.stop();
    });

    let started = std::time::Instant::now();
    reactor.run().unwrap();
    let elapsed = started.elapsed();

    stopper.join().unwrap();
    assert!(!reactor.handle().is_running());
    assert!(
        elapsed < Duration::from_millis(500),
        "run() should return promptly after a cross-thread stop, took {elapsed:?}"
    );
}

/// Round-trip property (spec §8): registering then removing a handler
/// leaves `handler_count()` exactly where it started.
#[test]
fn add_then_remove_is_a_handler_count_no_op() {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();
    let mut reactor = Reactor::new(ReactorConfig::default()).unwrap();
    let before = reactor.handler_count();

    let mut pool = ConnectionPool::<_, NullProtocol>::new(pool_config(8, 4), PlaintextSessionFactory);
    let handle = pool
        .acquire_connection(&mut reactor, "127.0.0.1", addr.port(), 0)
        .unwrap();
    pump(&mut reactor);
    assert!(reactor.handler_count() > before);

    pool.remove_connection(&mut reactor, handle);
    pool.release_connection(&mut reactor, handle, 0);
    pump(&mut reactor);
    assert_eq!(reactor.handler_count(), before);
}
