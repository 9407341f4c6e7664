//! Synchronous API over a [`NonBlockingConnection`].
//!
//! Reads wait until the inbound buffer satisfies the request, the read
//! timeout elapses or the connection closes. Writes wait until the outbound
//! queue has drained to the socket. Only the calling thread blocks; the
//! dispatcher keeps serving other connections.

use std::time::{Duration, Instant};

use bytes::Bytes;

use super::{ConnectionState, NonBlockingConnection};
use crate::{
    error::{Error, Result},
    framing::FramingBuffer,
    utils,
};

pub const DEFAULT_READ_TIMEOUT: Duration = Duration::from_secs(60);
pub const DEFAULT_WRITE_TIMEOUT: Duration = Duration::from_secs(60);

#[derive(Debug, Clone)]
pub struct BlockingConnection {
    conn: NonBlockingConnection,
    read_timeout: Duration,
    write_timeout: Duration,
}

impl BlockingConnection {
    pub fn new(conn: NonBlockingConnection) -> Self {
        Self {
            conn,
            read_timeout: DEFAULT_READ_TIMEOUT,
            write_timeout: DEFAULT_WRITE_TIMEOUT,
        }
    }

    pub fn set_read_timeout(&mut self, timeout: Duration) {
        self.read_timeout = timeout;
    }

    pub fn read_timeout(&self) -> Duration {
        self.read_timeout
    }

    pub fn set_write_timeout(&mut self, timeout: Duration) {
        self.write_timeout = timeout;
    }

    pub fn write_timeout(&self) -> Duration {
        self.write_timeout
    }

    /// The underlying non-blocking handle.
    pub fn inner(&self) -> &NonBlockingConnection {
        &self.conn
    }

    pub fn into_inner(self) -> NonBlockingConnection {
        self.conn
    }

    pub fn available(&self) -> usize {
        self.conn.available()
    }

    pub fn is_open(&self) -> bool {
        self.conn.is_open()
    }

    pub fn read_by_delimiter(&self, delimiter: &[u8]) -> Result<Bytes> {
        self.read_blocking(|buf| buf.read_by_delimiter(delimiter))
    }

    pub fn read_by_delimiter_max(&self, delimiter: &[u8], max_length: usize) -> Result<Bytes> {
        self.read_blocking(|buf| buf.read_by_delimiter_max(delimiter, max_length))
    }

    pub fn read_string_by_delimiter(&self, delimiter: &[u8]) -> Result<String> {
        self.read_blocking(|buf| buf.read_string_by_delimiter(delimiter))
    }

    pub fn read_by_length(&self, length: usize) -> Result<Bytes> {
        self.read_blocking(|buf| buf.read_by_length(length))
    }

    /// Waits for at least one byte and returns everything buffered.
    pub fn read_available(&self) -> Result<Bytes> {
        self.read_blocking(|buf| {
            if buf.is_empty() {
                Err(Error::Incomplete)
            } else {
                Ok(buf.read_available())
            }
        })
    }

    pub fn read_u8(&self) -> Result<u8> {
        self.read_blocking(FramingBuffer::read_u8)
    }

    pub fn read_u16(&self) -> Result<u16> {
        self.read_blocking(FramingBuffer::read_u16)
    }

    pub fn read_u32(&self) -> Result<u32> {
        self.read_blocking(FramingBuffer::read_u32)
    }

    pub fn read_i32(&self) -> Result<i32> {
        self.read_blocking(FramingBuffer::read_i32)
    }

    pub fn read_u64(&self) -> Result<u64> {
        self.read_blocking(FramingBuffer::read_u64)
    }

    fn read_blocking<T>(&self, mut f: impl FnMut(&mut FramingBuffer) -> Result<T>) -> Result<T> {
        let deadline = Instant::now() + self.read_timeout;
        let shared = &self.conn.inner;
        let mut io = shared.io.lock();
        loop {
            match f(&mut io.inbound) {
                Err(Error::Incomplete) => {}
                other => return other,
            }
            if shared.state() == ConnectionState::Closed {
                return Err(Error::Closed);
            }
            let Some(remaining) = utils::remaining(deadline) else {
                return Err(Error::Timeout);
            };
            shared.io_cond.wait_for(&mut io, remaining);
        }
    }

    /// Queues `data` and waits until all queued output reached the socket.
    ///
    /// ## Errors
    ///
    /// [`Error::Timeout`] if the queue did not drain within the write
    /// timeout (the data stays queued), [`Error::Closed`] if the connection
    /// closed first.
    pub fn write(&self, data: &[u8]) -> Result<usize> {
        let written = self.conn.write(data)?;
        self.flush()?;
        Ok(written)
    }

    /// Hands bytes held back by manual flushing to the dispatcher, then waits
    /// until the outbound queue is empty.
    pub fn flush(&self) -> Result<()> {
        if !self.conn.is_autoflush() {
            self.conn.flush()?;
        }
        let deadline = Instant::now() + self.write_timeout;
        let shared = &self.conn.inner;
        let mut io = shared.io.lock();
        loop {
            if io.outbound.is_empty() {
                return Ok(());
            }
            if shared.state() == ConnectionState::Closed {
                return Err(Error::Closed);
            }
            let Some(remaining) = utils::remaining(deadline) else {
                return Err(Error::Timeout);
            };
            shared.io_cond.wait_for(&mut io, remaining);
        }
    }

    pub fn activate_secured_mode(&self) -> Result<()> {
        self.conn.activate_secured_mode()
    }

    pub fn deactivate_secured_mode(&self) -> Result<()> {
        self.conn.deactivate_secured_mode()?;
        self.flush()
    }

    pub fn is_secure(&self) -> bool {
        self.conn.is_secure()
    }

    /// Closes the connection and waits (up to the write timeout) until the
    /// dispatcher has released it.
    pub fn close(&self) -> Result<()> {
        self.conn.close();
        let deadline = Instant::now() + self.write_timeout;
        let shared = &self.conn.inner;
        let mut io = shared.io.lock();
        while shared.state() != ConnectionState::Closed {
            let Some(remaining) = utils::remaining(deadline) else {
                return Err(Error::Timeout);
            };
            shared.io_cond.wait_for(&mut io, remaining);
        }
        Ok(())
    }
}

impl From<NonBlockingConnection> for BlockingConnection {
    fn from(conn: NonBlockingConnection) -> Self {
        BlockingConnection::new(conn)
    }
}
