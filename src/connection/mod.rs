//! Buffered, non-blocking connections.
//!
//! A connection's socket is owned by exactly one dispatcher thread. The
//! application never touches it; it works on two buffers instead:
//!
//! ```text
//!                    dispatcher thread                application / workers
//!  socket ──read──▶ SecureChannel ──▶ inbound FramingBuffer ──▶ read_by_*()
//!  socket ◀─write── outbound queue ◀── SecureChannel ◀──────── write()
//! ```
//!
//! `write` appends to the outbound queue and asks the dispatcher to flush;
//! the dispatcher writes what the socket accepts and keeps write interest
//! armed until the queue is empty. Reads are served from the inbound buffer
//! and follow the [`FramingBuffer`](crate::framing::FramingBuffer) contract:
//! a complete result or `Incomplete`, never a partial read.
//!
//! Handler callbacks for one connection are queued and run one at a time on
//! the worker pool. Closing a connection while a callback runs lets the
//! callback finish; its later writes fail with [`Error::Closed`].

pub mod blocking;
pub(crate) mod shared;

use std::{
    any::Any,
    fmt,
    net::SocketAddr,
    sync::Arc,
    time::{Duration, Instant},
};

use bytes::Bytes;

use crate::{
    error::{DisconnectCause, Error, Result},
    framing::FramingBuffer,
    handler::{Handler, HandlerDescriptor},
    secure::{SecureState, TlsRole},
};
use shared::{ConnectionShared, IoState};

pub use blocking::BlockingConnection;

/// Unique identifier of a connection within an event loop.
///
/// Ids are handed out by the event loop in increasing order and never reused
/// while the loop runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(pub u64);

impl ConnectionId {
    pub fn new(id: u64) -> Self {
        ConnectionId(id)
    }

    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(u8)]
pub enum ConnectionState {
    Connecting = 0,
    Open = 1,
    Closing = 2,
    Closed = 3,
}

impl ConnectionState {
    pub(crate) fn from_u8(value: u8) -> Self {
        match value {
            0 => ConnectionState::Connecting,
            1 => ConnectionState::Open,
            2 => ConnectionState::Closing,
            _ => ConnectionState::Closed,
        }
    }
}

/// Handle to a connection. Cheap to clone; all clones refer to the same
/// connection.
#[derive(Clone)]
pub struct NonBlockingConnection {
    pub(crate) inner: Arc<ConnectionShared>,
}

impl NonBlockingConnection {
    pub(crate) fn from_shared(inner: Arc<ConnectionShared>) -> Self {
        Self { inner }
    }

    pub fn id(&self) -> ConnectionId {
        self.inner.id
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.inner.local_addr
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.inner.peer_addr
    }

    pub fn state(&self) -> ConnectionState {
        self.inner.state()
    }

    pub fn is_open(&self) -> bool {
        self.inner.state() <= ConnectionState::Open
    }

    /// True for connections accepted by a server, false for ones created
    /// with `connect`.
    pub fn is_server_side(&self) -> bool {
        self.inner.role == TlsRole::Server
    }

    pub fn created_at(&self) -> Instant {
        self.inner.created_at()
    }

    /// Time the last bytes were received.
    pub fn last_activity(&self) -> Instant {
        self.inner.last_activity()
    }

    /// Number of received bytes not read yet.
    pub fn available(&self) -> usize {
        self.inner.io.lock().inbound.available()
    }

    pub fn read_by_delimiter(&self, delimiter: &[u8]) -> Result<Bytes> {
        self.read_with(|buf| buf.read_by_delimiter(delimiter))
    }

    pub fn read_by_delimiter_max(&self, delimiter: &[u8], max_length: usize) -> Result<Bytes> {
        self.read_with(|buf| buf.read_by_delimiter_max(delimiter, max_length))
    }

    pub fn read_string_by_delimiter(&self, delimiter: &[u8]) -> Result<String> {
        self.read_with(|buf| buf.read_string_by_delimiter(delimiter))
    }

    pub fn read_by_length(&self, length: usize) -> Result<Bytes> {
        self.read_with(|buf| buf.read_by_length(length))
    }

    /// Everything buffered. Empty if nothing arrived yet; `Closed` once the
    /// connection is closed and drained.
    pub fn read_available(&self) -> Result<Bytes> {
        self.read_with(|buf| {
            if buf.is_empty() {
                Err(Error::Incomplete)
            } else {
                Ok(buf.read_available())
            }
        })
        .or_else(|e| if e.is_incomplete() { Ok(Bytes::new()) } else { Err(e) })
    }

    pub fn read_u8(&self) -> Result<u8> {
        self.read_with(FramingBuffer::read_u8)
    }

    pub fn read_u16(&self) -> Result<u16> {
        self.read_with(FramingBuffer::read_u16)
    }

    pub fn read_u32(&self) -> Result<u32> {
        self.read_with(FramingBuffer::read_u32)
    }

    pub fn read_i32(&self) -> Result<i32> {
        self.read_with(FramingBuffer::read_i32)
    }

    pub fn read_u64(&self) -> Result<u64> {
        self.read_with(FramingBuffer::read_u64)
    }

    /// Copies the first `length` buffered bytes without consuming them.
    pub fn peek(&self, length: usize) -> Result<Bytes> {
        self.read_with(|buf| buf.peek(length).map(Bytes::copy_from_slice))
    }

    pub fn mark_read_position(&self) {
        self.inner.io.lock().inbound.mark_read_position();
    }

    pub fn reset_to_read_mark(&self) -> bool {
        self.inner.io.lock().inbound.reset_to_read_mark()
    }

    pub fn remove_read_mark(&self) {
        self.inner.io.lock().inbound.remove_read_mark();
    }

    pub fn max_read_size(&self) -> usize {
        self.inner.io.lock().inbound.max_read_size()
    }

    pub fn set_max_read_size(&self, max_read_size: usize) {
        self.inner.io.lock().inbound.set_max_read_size(max_read_size);
    }

    pub(crate) fn read_with<T>(&self, f: impl FnOnce(&mut FramingBuffer) -> Result<T>) -> Result<T> {
        let result = f(&mut self.inner.io.lock().inbound);
        match result {
            Err(Error::Incomplete) if self.inner.state() == ConnectionState::Closed => {
                Err(Error::Closed)
            }
            other => other,
        }
    }

    /// Queues `data` for sending and returns its length. Never blocks.
    ///
    /// With autoflush on (the default) the dispatcher is asked to write at
    /// once. With autoflush off the bytes are held until [`flush`](Self::flush).
    ///
    /// ## Errors
    ///
    /// [`Error::Closed`] once `close` was called or the connection failed.
    pub fn write(&self, data: &[u8]) -> Result<usize> {
        if !self.is_open() {
            return Err(Error::Closed);
        }
        if !self.inner.is_autoflush() {
            self.inner.io.lock().staged.extend_from_slice(data);
            return Ok(data.len());
        }
        {
            let mut io = self.inner.io.lock();
            io.commit_staged()?;
            let IoState {
                outbound, secure, ..
            } = &mut *io;
            secure.send(data, outbound)?;
        }
        self.inner.request_flush()?;
        Ok(data.len())
    }

    /// Hands every byte written so far to the dispatcher. Only needed with
    /// autoflush off.
    pub fn flush(&self) -> Result<()> {
        if !self.is_open() {
            return Err(Error::Closed);
        }
        self.inner.flush()
    }

    pub fn is_autoflush(&self) -> bool {
        self.inner.is_autoflush()
    }

    /// Switching autoflush back on does not flush by itself; the next
    /// `write` or `flush` does.
    pub fn set_autoflush(&self, autoflush: bool) {
        self.inner.set_autoflush(autoflush);
    }

    /// Bytes queued but not yet written to the socket.
    pub fn pending_write_size(&self) -> usize {
        self.inner.pending_output()
    }

    /// Closes the connection, flushing queued output first when
    /// `flush_on_close` is set. Idempotent; `on_disconnect` fires once.
    pub fn close(&self) {
        self.inner.close_with(DisconnectCause::Closed);
    }

    /// Stops reading from the socket. Data keeps accumulating in the kernel
    /// until [`resume_receiving`](Self::resume_receiving).
    pub fn suspend_receiving(&self) -> Result<()> {
        self.inner.set_receive_suspended(true)
    }

    pub fn resume_receiving(&self) -> Result<()> {
        self.inner.set_receive_suspended(false)
    }

    pub fn is_receiving_suspended(&self) -> bool {
        self.inner.is_receive_suspended()
    }

    /// Switches the connection to TLS at the current read position.
    ///
    /// Call this only at a message boundary both peers agree on. A write
    /// issued before this call goes out in plaintext, one issued after it is
    /// encrypted; a single write is never split across the switch.
    ///
    /// ## Errors
    ///
    /// [`Error::SecureModeUnavailable`] without a `SecureContext`. A TLS
    /// failure closes the connection.
    pub fn activate_secured_mode(&self) -> Result<()> {
        if !self.is_open() {
            return Err(Error::Closed);
        }
        let has_data = {
            let mut io = self.inner.io.lock();
            // staged bytes were written before the switch
            if let Err(e) = io.commit_staged() {
                drop(io);
                return Err(self.tls_failure(e));
            }
            let IoState {
                inbound,
                outbound,
                secure,
                ..
            } = &mut *io;
            if let Err(e) = secure.activate(inbound, outbound) {
                drop(io);
                return Err(self.tls_failure(e));
            }
            !inbound.is_empty()
        };
        self.inner.request_flush()?;
        if has_data {
            self.inner.schedule_data();
        }
        Ok(())
    }

    /// Ends the TLS session with `close_notify`; later writes are plaintext.
    pub fn deactivate_secured_mode(&self) -> Result<()> {
        if !self.is_open() {
            return Err(Error::Closed);
        }
        {
            let mut io = self.inner.io.lock();
            if let Err(e) = io.commit_staged() {
                drop(io);
                return Err(self.tls_failure(e));
            }
            let IoState {
                outbound, secure, ..
            } = &mut *io;
            if let Err(e) = secure.deactivate(outbound) {
                drop(io);
                return Err(self.tls_failure(e));
            }
        }
        self.inner.request_flush()
    }

    fn tls_failure(&self, err: Error) -> Error {
        if matches!(err, Error::Tls(_) | Error::Io(_)) {
            self.inner
                .close_with(DisconnectCause::Error(Arc::new(Error::Protocol(err.to_string()))));
        }
        err
    }

    pub fn secure_state(&self) -> SecureState {
        self.inner.io.lock().secure.state()
    }

    pub fn is_secure(&self) -> bool {
        self.secure_state() == SecureState::Secured
    }

    /// Whether a `SecureContext` for this connection's role is configured.
    pub fn is_secure_mode_available(&self) -> bool {
        self.inner.io.lock().secure.is_available()
    }

    /// Replaces the handler. Its capabilities are read now; callbacks already
    /// queued are delivered to the new handler.
    pub fn set_handler(&self, handler: Arc<dyn Handler>) {
        self.inner.set_handler(HandlerDescriptor::new(handler));
    }

    pub fn handler(&self) -> Arc<dyn Handler> {
        self.inner.handler().handler.clone()
    }

    pub fn set_attachment(&self, attachment: Arc<dyn Any + Send + Sync>) {
        *self.inner.attachment.lock() = Some(attachment);
    }

    pub fn attachment(&self) -> Option<Arc<dyn Any + Send + Sync>> {
        self.inner.attachment.lock().clone()
    }

    /// The attachment, if it is a `T`.
    pub fn attachment_as<T: Any + Send + Sync>(&self) -> Option<Arc<T>> {
        self.attachment().and_then(|a| a.downcast::<T>().ok())
    }

    pub fn take_attachment(&self) -> Option<Arc<dyn Any + Send + Sync>> {
        self.inner.attachment.lock().take()
    }

    pub fn set_idle_timeout(&self, timeout: Option<Duration>) {
        self.inner.set_idle_timeout(timeout);
    }

    pub fn idle_timeout(&self) -> Option<Duration> {
        self.inner.idle_timeout()
    }

    pub fn set_connection_timeout(&self, timeout: Option<Duration>) {
        self.inner.set_connection_timeout(timeout);
    }

    pub fn connection_timeout(&self) -> Option<Duration> {
        self.inner.connection_timeout()
    }

    /// Queues an `on_data` callback even though no new bytes arrived.
    pub(crate) fn schedule_data(&self) {
        self.inner.schedule_data();
    }
}

impl PartialEq for NonBlockingConnection {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl Eq for NonBlockingConnection {}

impl fmt::Debug for NonBlockingConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NonBlockingConnection")
            .field("id", &self.inner.id)
            .field("peer_addr", &self.inner.peer_addr)
            .field("state", &self.inner.state())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_connection_id() {
        let id = ConnectionId::new(7);
        assert_eq!(id.as_u64(), 7);
        assert_eq!(id.to_string(), "#7");
        assert!(ConnectionId(1) < ConnectionId(2));
    }

    #[test]
    fn test_token_never_collides_with_waker() {
        use super::shared::token_for;

        assert_eq!(token_for(ConnectionId(5)).unwrap(), mio::Token(5));
        assert!(matches!(token_for(ConnectionId(0)), Err(Error::Rejected(_))));
        // ids beyond the pointer width are refused instead of truncated
        assert_eq!(
            token_for(ConnectionId(u64::MAX)).is_ok(),
            usize::BITS >= u64::BITS
        );
    }

    #[test]
    fn test_state_ordering() {
        assert!(ConnectionState::Connecting < ConnectionState::Open);
        assert!(ConnectionState::Closing < ConnectionState::Closed);
        for state in [
            ConnectionState::Connecting,
            ConnectionState::Open,
            ConnectionState::Closing,
            ConnectionState::Closed,
        ] {
            assert_eq!(ConnectionState::from_u8(state as u8), state);
        }
    }
}
