//! Non-blocking TCP connect and socket option setup.
//!
//! Connection establishment goes through `mio::net::TcpStream::connect`,
//! which performs the non-blocking `connect(2)` call itself; once the
//! socket is open, [`socket2::SockRef`] is used to apply the keepalive and
//! buffer-size tuning without needing to round-trip through a raw fd
//! conversion.

use std::io;
use std::net::SocketAddr;
use std::time::Duration;

use mio::net::TcpStream;
use socket2::{SockRef, TcpKeepalive};

/// Send/receive buffer size applied to every pooled connection, matching
/// the throughput this substrate is sized for.
pub const SOCKET_BUFFER_SIZE: usize = 256 * 1024;

/// Keepalive idle time before the OS starts probing.
const KEEPALIVE_TIME: Duration = Duration::from_secs(60);

/// Opens a non-blocking TCP connection to `addr` and applies `TCP_NODELAY`,
/// `SO_KEEPALIVE`, and 256 KiB send/recv buffers. Socket option failures are
/// logged and otherwise ignored — they are tuning, not correctness
/// requirements, matching the connector's own best-effort posture.
pub fn connect_nonblocking(addr: SocketAddr) -> io::Result<TcpStream> {
    let stream = TcpStream::connect(addr)?;
    apply_socket_options(&stream);
    Ok(stream)
}

fn apply_socket_options(stream: &TcpStream) {
    let sock = SockRef::from(stream);

    if let Err(e) = sock.set_nodelay(true) {
        warn!("tcp set_nodelay error: {e}");
    }

    let keepalive = TcpKeepalive::new().with_time(KEEPALIVE_TIME);
    if let Err(e) = sock.set_tcp_keepalive(&keepalive) {
        warn!("tcp set_keepalive error: {e}");
    }

    if let Err(e) = sock.set_send_buffer_size(SOCKET_BUFFER_SIZE) {
        warn!("tcp set_send_buffer_size error: {e}");
    }

    if let Err(e) = sock.set_recv_buffer_size(SOCKET_BUFFER_SIZE) {
        warn!("tcp set_recv_buffer_size error: {e}");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::{TcpListener, ToSocketAddrs};

    #[test]
    fn connects_to_a_local_listener() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let stream = connect_nonblocking(addr);
        assert!(stream.is_ok());
    }

    #[test]
    fn refused_connect_is_an_error_or_pending() {
        // Port 0 on connect is always invalid; this should fail to even
        // start a connection attempt rather than hang.
        let addr = "0.0.0.0:0".to_socket_addrs().unwrap().next().unwrap();
        let _ = connect_nonblocking(addr);
    }
}
