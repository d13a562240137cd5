//! `TlsSessionFactory`/`TlsSession`: the TLS handshake collaborator.
//!
//! Real TLS session construction (certificate verification, ALPN, cipher
//! suite and extension ordering for browser impersonation) is out of scope
//! for this crate — it is built and owned by whatever embeds the connection
//! state machine. [`Connection`](super::Connection) only needs to drive a
//! handshake to completion and learn whether it succeeded.

use crate::error::Result;

/// Outcome of advancing a TLS handshake by one step.
#[derive(Debug)]
pub enum HandshakeStatus {
    /// The handshake needs another readable/writable turn.
    InProgress,
    /// The handshake finished; the session is ready to carry a protocol.
    Complete,
}

/// A single TLS session bound to one TCP connection.
pub trait TlsSession {
    /// Advances the handshake using whatever I/O has become ready. Returns
    /// [`HandshakeStatus::Complete`] once the session is usable.
    fn advance_handshake(&mut self) -> Result<HandshakeStatus>;
}

/// Builds a [`TlsSession`] for a freshly connected socket.
pub trait TlsSessionFactory {
    /// The session type this factory produces.
    type Session: TlsSession;

    /// Creates a session for `host`, used for SNI/certificate verification
    /// by a real implementation.
    fn new_session(&self, host: &str) -> Result<Self::Session>;
}

/// A handshake that completes immediately, performing no I/O and no
/// verification. Used to exercise [`Connection`](super::Connection) in
/// isolation from a real TLS stack.
#[derive(Debug, Default, Clone, Copy)]
pub struct PlaintextSession;

impl TlsSession for PlaintextSession {
    fn advance_handshake(&mut self) -> Result<HandshakeStatus> {
        Ok(HandshakeStatus::Complete)
    }
}

/// Factory for [`PlaintextSession`].
#[derive(Debug, Default, Clone, Copy)]
pub struct PlaintextSessionFactory;

impl TlsSessionFactory for PlaintextSessionFactory {
    type Session = PlaintextSession;

    fn new_session(&self, _host: &str) -> Result<Self::Session> {
        Ok(PlaintextSession)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn plaintext_session_completes_immediately() {
        let factory = PlaintextSessionFactory;
        let mut session = factory.new_session("example.com").unwrap();
        assert!(matches!(
            session.advance_handshake().unwrap(),
            HandshakeStatus::Complete
        ));
    }
}
