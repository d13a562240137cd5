//! `StreamProtocol`: the application-protocol collaborator.
//!
//! Request/response framing (HTTP/1.1 vs h2, header compression, cookie
//! jars, redirect following) lives above this crate. Once a [`Connection`]
//! reaches [`ConnState::Ready`](super::ConnState::Ready) it hands readable
//! and writable turns to whatever `StreamProtocol` the embedder installed.

use crate::error::Result;

/// How many concurrently open logical streams a protocol implementation is
/// currently carrying on this connection. The pool uses this to pick which
/// open connection to hand out next and to size eviction decisions.
pub trait StreamProtocol {
    /// Number of streams this protocol instance considers in flight.
    fn active_streams(&self) -> usize;

    /// Maximum number of streams this protocol can multiplex on one
    /// connection (1 for HTTP/1.1, higher for h2).
    fn max_streams(&self) -> usize;

    /// Called when the underlying socket becomes readable.
    fn on_readable(&mut self) -> Result<()>;

    /// Called when the underlying socket becomes writable.
    fn on_writable(&mut self) -> Result<()>;

    /// True once the protocol has no more work and the connection can be
    /// torn down or returned to the pool.
    fn is_idle(&self) -> bool {
        self.active_streams() == 0
    }

    /// Drains the count of stream-level failures (e.g. an individual h2
    /// stream reset) the protocol recorded since the last call, without
    /// treating the whole connection as failed — that only happens when
    /// `on_readable`/`on_writable` itself returns `Err`. The owning
    /// [`Connection`](super::Connection) polls this once per turn and
    /// forwards the count to whatever callback its pool installed, so these
    /// failures still count against the pool's consecutive-error eviction
    /// threshold. Default: a protocol with no notion of per-stream failure
    /// reports none.
    fn take_stream_failures(&mut self) -> u32 {
        0
    }
}

/// A protocol that never carries any streams. Used to exercise
/// [`Connection`](super::Connection) without a real request/response layer.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullProtocol;

impl StreamProtocol for NullProtocol {
    fn active_streams(&self) -> usize {
        0
    }

    fn max_streams(&self) -> usize {
        1
    }

    fn on_readable(&mut self) -> Result<()> {
        Ok(())
    }

    fn on_writable(&mut self) -> Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn null_protocol_is_always_idle() {
        let mut protocol = NullProtocol;
        assert!(protocol.is_idle());
        protocol.on_readable().unwrap();
        protocol.on_writable().unwrap();
        assert!(protocol.is_idle());
        assert_eq!(protocol.max_streams(), 1);
    }
}
