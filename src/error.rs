use std::{error::Error as StdError, fmt, io};

/// A `Result` alias where the `Err` case is [`Error`].
pub type Result<T> = std::result::Result<T, Error>;

/// A boxed error type used for dynamic error sources.
pub type BoxError = Box<dyn StdError + Send + Sync>;

/// An error produced by the reactor, resolver, connection, or pool.
pub struct Error {
    inner: Box<Inner>,
}

struct Inner {
    kind: Kind,
    source: Option<BoxError>,
    host: Option<Box<str>>,
}

impl Error {
    /// Builds an error of the given `kind`, wrapping an optional source.
    /// Public so embedders implementing [`crate::conn::tls::TlsSessionFactory`]
    /// or [`crate::conn::protocol::StreamProtocol`] can report their own
    /// failures back through this crate's error type.
    pub fn new<E>(kind: Kind, source: Option<E>) -> Error
    where
        E: Into<BoxError>,
    {
        Error {
            inner: Box::new(Inner {
                kind,
                source: source.map(Into::into),
                host: None,
            }),
        }
    }

    pub fn resolution<E: Into<BoxError>>(e: E) -> Error {
        Error::new(Kind::Resolution, Some(e))
    }

    pub fn connect<E: Into<BoxError>>(e: E) -> Error {
        Error::new(Kind::Connect, Some(e))
    }

    pub fn handshake<E: Into<BoxError>>(e: E) -> Error {
        Error::new(Kind::Handshake, Some(e))
    }

    pub fn transport<E: Into<BoxError>>(e: E) -> Error {
        Error::new(Kind::Transport, Some(e))
    }

    pub fn protocol<E: Into<BoxError>>(e: E) -> Error {
        Error::new(Kind::Protocol, Some(e))
    }

    pub fn cancelled() -> Error {
        Error::new(Kind::Cancelled, None::<BoxError>)
    }

    pub fn overloaded<E: Into<BoxError>>(e: E) -> Error {
        Error::new(Kind::Overloaded, Some(e))
    }

    /// Attach the host this error occurred against (overwriting any existing).
    pub fn with_host(mut self, host: impl Into<Box<str>>) -> Self {
        self.inner.host = Some(host.into());
        self
    }
}

impl Error {
    /// Returns the host this error is related to, if any.
    pub fn host(&self) -> Option<&str> {
        self.inner.host.as_deref()
    }

    /// Returns the kind of this error.
    pub fn kind(&self) -> Kind {
        self.inner.kind
    }

    /// Returns true if the error happened while resolving a hostname.
    pub fn is_resolution(&self) -> bool {
        matches!(self.inner.kind, Kind::Resolution)
    }

    /// Returns true if the error happened while establishing a TCP connection.
    pub fn is_connect(&self) -> bool {
        matches!(self.inner.kind, Kind::Connect)
    }

    /// Returns true if the error happened during the TLS/protocol handshake.
    pub fn is_handshake(&self) -> bool {
        matches!(self.inner.kind, Kind::Handshake)
    }

    /// Returns true if the error happened on an established connection.
    pub fn is_transport(&self) -> bool {
        matches!(self.inner.kind, Kind::Transport)
    }

    /// Returns true if the error is a protocol-level violation.
    pub fn is_protocol(&self) -> bool {
        matches!(self.inner.kind, Kind::Protocol)
    }

    /// Returns true if the operation was cancelled (e.g. reactor stopped).
    pub fn is_cancelled(&self) -> bool {
        matches!(self.inner.kind, Kind::Cancelled)
    }

    /// Returns true if the error is a capacity refusal (pool or reactor at
    /// its configured limit).
    pub fn is_overloaded(&self) -> bool {
        matches!(self.inner.kind, Kind::Overloaded)
    }

    /// Returns true if the error chain bottoms out at an I/O timeout.
    pub fn is_timeout(&self) -> bool {
        let mut source = self.source();
        while let Some(err) = source {
            if let Some(io) = err.downcast_ref::<io::Error>() {
                if io.kind() == io::ErrorKind::TimedOut {
                    return true;
                }
            }
            source = err.source();
        }
        false
    }
}

impl fmt::Debug for Error {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let mut builder = f.debug_struct("Error");
        builder.field("kind", &self.inner.kind);
        if let Some(ref host) = self.inner.host {
            builder.field("host", host);
        }
        if let Some(ref source) = self.inner.source {
            builder.field("source", source);
        }
        builder.finish()
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self.inner.kind {
            Kind::Resolution => f.write_str("dns resolution failed")?,
            Kind::Connect => f.write_str("connect failed")?,
            Kind::Handshake => f.write_str("handshake failed")?,
            Kind::Transport => f.write_str("transport error")?,
            Kind::Protocol => f.write_str("protocol violation")?,
            Kind::Cancelled => f.write_str("operation cancelled")?,
            Kind::Overloaded => f.write_str("resource limit reached")?,
        }

        if let Some(host) = &self.inner.host {
            write!(f, " for host ({host})")?;
        }

        if let Some(e) = &self.inner.source {
            write!(f, ": {e}")?;
        }

        Ok(())
    }
}

impl StdError for Error {
    fn source(&self) -> Option<&(dyn StdError + 'static)> {
        self.inner.source.as_ref().map(|e| &**e as _)
    }
}

/// The seven error categories a connection or pool operation can fail with.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Kind {
    /// Hostname resolution failed, or the resolver/cache refused the lookup.
    Resolution,
    /// The non-blocking TCP connect attempt failed.
    Connect,
    /// The TLS session (or other protocol upgrade) handshake failed.
    Handshake,
    /// An I/O error occurred on an already-established connection.
    Transport,
    /// The peer violated the wire protocol.
    Protocol,
    /// The operation was cancelled, typically by `Reactor::stop`.
    Cancelled,
    /// A capacity limit (pool, reactor descriptor table, DNS cache) refused
    /// the request.
    Overloaded,
}
