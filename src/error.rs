use std::{fmt, io, net::SocketAddr, sync::Arc};

use thiserror::Error;

/// Result type used throughout the crate.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors surfaced by connections, servers and the event loop.
///
/// `Incomplete` is not a failure: it tells a framing read that the buffered
/// bytes do not satisfy the request yet. Handlers may propagate it with `?`;
/// the callback runner treats it like `Ok(false)` and re-invokes the handler
/// once more data has arrived.
#[derive(Debug, Error)]
pub enum Error {
    #[error("insufficient data buffered")]
    Incomplete,

    #[error("max read size {max} exceeded (requested or scanned {requested} bytes)")]
    MaxReadSizeExceeded { max: usize, requested: usize },

    #[error("connection is closed")]
    Closed,

    #[error("operation timed out")]
    Timeout,

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("address {0} is already in use")]
    AddressInUse(SocketAddr),

    #[error("failed to bind {addr}: {source}")]
    Bind {
        addr: SocketAddr,
        #[source]
        source: io::Error,
    },

    #[error("TLS error: {0}")]
    Tls(#[from] rustls::Error),

    #[error("secure mode is not configured for this connection")]
    SecureModeUnavailable,

    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("configuration error: {0}")]
    Configuration(String),

    #[error("connection rejected: {0}")]
    Rejected(String),

    #[error("event loop is shut down")]
    EventLoopGone,
}

impl Error {
    /// True for the transient "not enough data yet" condition.
    pub fn is_incomplete(&self) -> bool {
        matches!(self, Error::Incomplete)
    }

    pub(crate) fn bind(addr: SocketAddr, source: io::Error) -> Self {
        if source.kind() == io::ErrorKind::AddrInUse {
            Error::AddressInUse(addr)
        } else {
            Error::Bind { addr, source }
        }
    }
}

/// Why a connection was closed, handed to `Handler::on_disconnect`.
#[derive(Debug, Clone)]
pub enum DisconnectCause {
    /// Closed locally through `close()`.
    Closed,
    /// The peer closed its side of the stream.
    PeerClosed,
    IdleTimeout,
    ConnectionTimeout,
    /// The owning event loop shut down.
    Shutdown,
    /// A transport, TLS or protocol failure.
    Error(Arc<Error>),
}

impl DisconnectCause {
    pub fn is_error(&self) -> bool {
        matches!(self, DisconnectCause::Error(_))
    }

    pub fn is_timeout(&self) -> bool {
        matches!(
            self,
            DisconnectCause::IdleTimeout | DisconnectCause::ConnectionTimeout
        )
    }
}

impl fmt::Display for DisconnectCause {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DisconnectCause::Closed => write!(f, "closed"),
            DisconnectCause::PeerClosed => write!(f, "closed by peer"),
            DisconnectCause::IdleTimeout => write!(f, "idle timeout"),
            DisconnectCause::ConnectionTimeout => write!(f, "connection timeout"),
            DisconnectCause::Shutdown => write!(f, "event loop shutdown"),
            DisconnectCause::Error(e) => write!(f, "error: {}", e),
        }
    }
}

impl From<Error> for DisconnectCause {
    fn from(err: Error) -> Self {
        DisconnectCause::Error(Arc::new(err))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bind_maps_addr_in_use() {
        let addr: SocketAddr = "127.0.0.1:80".parse().unwrap();
        let err = Error::bind(addr, io::Error::from(io::ErrorKind::AddrInUse));
        assert!(matches!(err, Error::AddressInUse(a) if a == addr));

        let err = Error::bind(addr, io::Error::from(io::ErrorKind::PermissionDenied));
        assert!(matches!(err, Error::Bind { .. }));
    }

    #[test]
    fn test_cause_classification() {
        assert!(DisconnectCause::IdleTimeout.is_timeout());
        assert!(!DisconnectCause::Closed.is_timeout());
        assert!(DisconnectCause::from(Error::Closed).is_error());
        assert_eq!(DisconnectCause::PeerClosed.to_string(), "closed by peer");
    }
}
