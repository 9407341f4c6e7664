//! Application callback contract.
//!
//! A [`Handler`] reacts to connection events. Every callback has a default so
//! an implementation only overrides what it needs, and declares the callbacks
//! it wants through [`Handler::capabilities`]. The capability set is read once
//! when the handler is attached to a connection and stored next to it in a
//! [`HandlerDescriptor`]; the framework checks the descriptor instead of
//! calling into callbacks the handler does not care about.
//!
//! Callbacks run on worker pool threads. For a single connection they never
//! run concurrently; callbacks of different connections may.
//!
//! ```rust
//! use millstream::handler::{Capabilities, Handler};
//! use millstream::{NonBlockingConnection, Result};
//!
//! struct LineEcho;
//!
//! impl Handler for LineEcho {
//!     fn capabilities(&self) -> Capabilities {
//!         Capabilities::DATA
//!     }
//!
//!     fn on_data(&self, conn: &NonBlockingConnection) -> Result<bool> {
//!         let line = conn.read_by_delimiter(b"\r\n")?;
//!         conn.write(&line)?;
//!         conn.write(b"\r\n")?;
//!         Ok(true)
//!     }
//! }
//! ```

use std::{fmt, ops, sync::Arc};

use crate::{connection::NonBlockingConnection, error::DisconnectCause, error::Result};

/// Set of callbacks a handler wants to receive.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct Capabilities(u8);

const CONNECT: u8 = 0b0_0001;
const DATA: u8 = 0b0_0010;
const DISCONNECT: u8 = 0b0_0100;
const TIMEOUT: u8 = 0b0_1000;
const LIFECYCLE: u8 = 0b1_0000;

impl Capabilities {
    pub const CONNECT: Capabilities = Capabilities(CONNECT);
    pub const DATA: Capabilities = Capabilities(DATA);
    pub const DISCONNECT: Capabilities = Capabilities(DISCONNECT);
    /// Both idle and connection timeouts.
    pub const TIMEOUT: Capabilities = Capabilities(TIMEOUT);
    /// `on_init` / `on_destroy`.
    pub const LIFECYCLE: Capabilities = Capabilities(LIFECYCLE);

    pub const fn empty() -> Capabilities {
        Capabilities(0)
    }

    pub const fn all() -> Capabilities {
        Capabilities(CONNECT | DATA | DISCONNECT | TIMEOUT | LIFECYCLE)
    }

    pub const fn add(self, other: Capabilities) -> Capabilities {
        Capabilities(self.0 | other.0)
    }

    pub const fn remove(self, other: Capabilities) -> Capabilities {
        Capabilities(self.0 & !other.0)
    }

    pub const fn contains(self, other: Capabilities) -> bool {
        self.0 & other.0 == other.0
    }

    pub const fn is_empty(self) -> bool {
        self.0 == 0
    }
}

impl ops::BitOr for Capabilities {
    type Output = Self;

    #[inline]
    fn bitor(self, other: Self) -> Self {
        self.add(other)
    }
}

impl ops::BitOrAssign for Capabilities {
    #[inline]
    fn bitor_assign(&mut self, other: Self) {
        self.0 |= other.0;
    }
}

impl fmt::Debug for Capabilities {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let names = [
            (CONNECT, "CONNECT"),
            (DATA, "DATA"),
            (DISCONNECT, "DISCONNECT"),
            (TIMEOUT, "TIMEOUT"),
            (LIFECYCLE, "LIFECYCLE"),
        ];
        let mut one = false;
        for (bit, name) in names {
            if self.0 & bit != 0 {
                if one {
                    write!(f, " | ")?;
                }
                write!(f, "{}", name)?;
                one = true;
            }
        }
        if !one {
            write!(f, "(empty)")?;
        }
        Ok(())
    }
}

/// Callbacks invoked by the framework for a connection.
///
/// ## Errors
///
/// Returning [`Error::Incomplete`](crate::Error::Incomplete) from `on_data`
/// (typically through `?` on a framing read) is equivalent to `Ok(false)`:
/// the handler is called again once more data arrives. Any other error closes
/// the connection and is reported to `on_disconnect` as
/// [`DisconnectCause::Error`].
pub trait Handler: Send + Sync + 'static {
    /// Callbacks this handler wants. Read once at attach time.
    fn capabilities(&self) -> Capabilities {
        Capabilities::all()
    }

    /// Process-scoped setup, called before the handler sees its first
    /// connection.
    fn on_init(&self) {}

    /// Process-scoped teardown, called after the handler's last connection.
    fn on_destroy(&self) {}

    /// Called once the connection is established. Returning `false` rejects
    /// and closes it.
    fn on_connect(&self, conn: &NonBlockingConnection) -> Result<bool> {
        let _ = conn;
        Ok(true)
    }

    /// Called when new bytes are available. Returning `false` means "not
    /// enough yet"; nothing is discarded.
    fn on_data(&self, conn: &NonBlockingConnection) -> Result<bool> {
        let _ = conn;
        Ok(true)
    }

    /// Called exactly once after the connection has closed.
    fn on_disconnect(&self, conn: &NonBlockingConnection, cause: &DisconnectCause) {
        let _ = (conn, cause);
    }

    /// Returns whether the connection should be closed.
    fn on_idle_timeout(&self, conn: &NonBlockingConnection) -> bool {
        let _ = conn;
        true
    }

    /// Returns whether the connection should be closed.
    fn on_connection_timeout(&self, conn: &NonBlockingConnection) -> bool {
        let _ = conn;
        true
    }
}

/// Creates a fresh handler per connection.
pub trait HandlerFactory: Send + Sync + 'static {
    fn create(&self) -> Arc<dyn Handler>;
}

impl<F> HandlerFactory for F
where
    F: Fn() -> Arc<dyn Handler> + Send + Sync + 'static,
{
    fn create(&self) -> Arc<dyn Handler> {
        self()
    }
}

/// Where a server gets the handler for an accepted connection.
#[derive(Clone)]
pub enum HandlerSource {
    /// One instance shared by every connection.
    Shared(Arc<dyn Handler>),
    /// A new instance per connection, initialized and destroyed with it.
    PerConnection(Arc<dyn HandlerFactory>),
}

/// A handler together with the capabilities it declared when attached.
#[derive(Clone)]
pub struct HandlerDescriptor {
    pub handler: Arc<dyn Handler>,
    pub capabilities: Capabilities,
    /// Whether `on_init`/`on_destroy` belong to this connection.
    pub(crate) connection_scoped: bool,
}

impl HandlerDescriptor {
    pub fn new(handler: Arc<dyn Handler>) -> Self {
        let capabilities = handler.capabilities();
        HandlerDescriptor {
            handler,
            capabilities,
            connection_scoped: false,
        }
    }

    pub(crate) fn connection_scoped(handler: Arc<dyn Handler>) -> Self {
        let mut descriptor = Self::new(handler);
        descriptor.connection_scoped = true;
        descriptor
    }

    #[inline]
    pub fn supports(&self, capability: Capabilities) -> bool {
        self.capabilities.contains(capability)
    }
}

impl fmt::Debug for HandlerDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HandlerDescriptor")
            .field("capabilities", &self.capabilities)
            .field("connection_scoped", &self.connection_scoped)
            .finish()
    }
}

/// Handler that declares no capabilities, used by blocking connections.
pub(crate) struct NoopHandler;

impl Handler for NoopHandler {
    fn capabilities(&self) -> Capabilities {
        Capabilities::empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct DataOnly;

    impl Handler for DataOnly {
        fn capabilities(&self) -> Capabilities {
            Capabilities::DATA | Capabilities::DISCONNECT
        }
    }

    #[test]
    fn test_capability_set_operations() {
        let caps = Capabilities::DATA | Capabilities::TIMEOUT;
        assert!(caps.contains(Capabilities::DATA));
        assert!(!caps.contains(Capabilities::CONNECT));
        assert!(Capabilities::all().contains(caps));
        assert!(caps.remove(Capabilities::DATA).contains(Capabilities::TIMEOUT));
        assert!(Capabilities::empty().is_empty());
        assert_eq!(format!("{:?}", caps), "DATA | TIMEOUT");
    }

    #[test]
    fn test_descriptor_reads_capabilities_once() {
        let descriptor = HandlerDescriptor::new(Arc::new(DataOnly));
        assert!(descriptor.supports(Capabilities::DATA));
        assert!(!descriptor.supports(Capabilities::CONNECT));
        assert!(!descriptor.connection_scoped);

        let noop = HandlerDescriptor::connection_scoped(Arc::new(NoopHandler));
        assert!(noop.capabilities.is_empty());
        assert!(noop.connection_scoped);
    }

    #[test]
    fn test_closure_factory() {
        let factory: Arc<dyn HandlerFactory> =
            Arc::new(|| Arc::new(DataOnly) as Arc<dyn Handler>);
        let handler = factory.create();
        assert!(handler.capabilities().contains(Capabilities::DATA));
    }
}
