use std::{
    any::Any,
    io::{self, Write},
    net::SocketAddr,
    sync::{
        atomic::{AtomicBool, AtomicU64, AtomicU8, Ordering},
        Arc,
    },
    time::{Duration, Instant},
};

use arc_swap::ArcSwap;
use bytes::{Buf, BytesMut};
use mio::Token;
use parking_lot::{Condvar, Mutex};
use tracing::{debug, trace, warn};

use super::{ConnectionId, ConnectionState, NonBlockingConnection};
use crate::{
    config::ConnectionOptions,
    dispatcher::{Command, DispatcherHandle},
    error::{DisconnectCause, Error, Result},
    framing::FramingBuffer,
    handler::{Capabilities, HandlerDescriptor},
    secure::{SecureChannel, SecureState, TlsRole},
    worker_pool::{SerialExecutor, WorkerPool},
};

pub(crate) type Attachment = Arc<dyn Any + Send + Sync>;
type CloseHook = Box<dyn FnOnce(ConnectionId) + Send>;

/// Buffers touched by both the dispatcher and application threads.
pub(crate) struct IoState {
    pub(crate) inbound: FramingBuffer,
    pub(crate) outbound: BytesMut,
    /// Plaintext written with autoflush off, waiting for `flush`.
    pub(crate) staged: BytesMut,
    pub(crate) secure: SecureChannel,
}

impl IoState {
    /// Passes staged plaintext through the secure channel into the outbound
    /// queue.
    pub(crate) fn commit_staged(&mut self) -> Result<()> {
        if self.staged.is_empty() {
            return Ok(());
        }
        let staged = self.staged.split();
        self.secure.send(&staged, &mut self.outbound)
    }
}

pub(crate) enum CallbackEvent {
    Connect,
    Data,
    IdleTimeout,
    ConnectionTimeout,
    Disconnect(DisconnectCause),
}

impl CallbackEvent {
    fn required(&self) -> Option<Capabilities> {
        match self {
            CallbackEvent::Connect => Some(Capabilities::CONNECT),
            CallbackEvent::Data => Some(Capabilities::DATA),
            CallbackEvent::IdleTimeout | CallbackEvent::ConnectionTimeout => {
                Some(Capabilities::TIMEOUT)
            }
            // always delivered: it also runs close hooks
            CallbackEvent::Disconnect(_) => None,
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub(crate) enum TimeoutKind {
    Idle,
    Connection,
}

struct Timeouts {
    idle: Option<Duration>,
    connection: Option<Duration>,
}

pub(crate) struct ConnectionParams {
    pub(crate) id: ConnectionId,
    pub(crate) local_addr: SocketAddr,
    pub(crate) peer_addr: SocketAddr,
    pub(crate) role: TlsRole,
    pub(crate) options: ConnectionOptions,
    pub(crate) handler: HandlerDescriptor,
    pub(crate) dispatcher: DispatcherHandle,
    pub(crate) pool: Arc<WorkerPool>,
    pub(crate) receive_capacity: usize,
}

/// State shared between the owning dispatcher, the worker running the
/// connection's callbacks and any application thread holding a handle.
pub(crate) struct ConnectionShared {
    pub(crate) id: ConnectionId,
    pub(crate) token: Token,
    pub(crate) local_addr: SocketAddr,
    pub(crate) peer_addr: SocketAddr,
    pub(crate) role: TlsRole,
    state: AtomicU8,
    pub(crate) io: Mutex<IoState>,
    /// Signalled when inbound data arrives, output drains or the connection
    /// closes. Always notified with `io` held.
    pub(crate) io_cond: Condvar,
    handler: ArcSwap<HandlerDescriptor>,
    events: SerialExecutor<CallbackEvent>,
    dispatcher: DispatcherHandle,
    pool: Arc<WorkerPool>,
    created_at: Instant,
    last_activity_ms: AtomicU64,
    timeouts: Mutex<Timeouts>,
    idle_fired: AtomicBool,
    connection_timeout_fired: AtomicBool,
    pub(crate) flush_on_close: bool,
    pub(crate) close_timeout: Duration,
    flush_requested: AtomicBool,
    autoflush: AtomicBool,
    receive_suspended: AtomicBool,
    close_cause: Mutex<Option<DisconnectCause>>,
    disconnected: AtomicBool,
    pub(crate) attachment: Mutex<Option<Attachment>>,
    close_hooks: Mutex<Vec<CloseHook>>,
}

impl ConnectionShared {
    pub(crate) fn new(params: ConnectionParams) -> Result<Arc<Self>> {
        let ConnectionParams {
            id,
            local_addr,
            peer_addr,
            role,
            options,
            handler,
            dispatcher,
            pool,
            receive_capacity,
        } = params;

        let token = token_for(id)?;
        let mut io = IoState {
            inbound: FramingBuffer::with_capacity(receive_capacity, options.max_read_size),
            outbound: BytesMut::new(),
            staged: BytesMut::new(),
            secure: SecureChannel::new(options.secure.clone(), role),
        };
        if options.start_secured {
            let IoState {
                inbound,
                outbound,
                secure,
                ..
            } = &mut io;
            secure.activate(inbound, outbound)?;
        }

        Ok(Arc::new(Self {
            id,
            token,
            local_addr,
            peer_addr,
            role,
            state: AtomicU8::new(ConnectionState::Connecting as u8),
            io: Mutex::new(io),
            io_cond: Condvar::new(),
            handler: ArcSwap::from_pointee(handler),
            events: SerialExecutor::new(),
            dispatcher,
            pool,
            created_at: Instant::now(),
            last_activity_ms: AtomicU64::new(0),
            timeouts: Mutex::new(Timeouts {
                idle: options.idle_timeout,
                connection: options.connection_timeout,
            }),
            idle_fired: AtomicBool::new(false),
            connection_timeout_fired: AtomicBool::new(false),
            flush_on_close: options.flush_on_close,
            close_timeout: options.close_timeout,
            flush_requested: AtomicBool::new(false),
            autoflush: AtomicBool::new(options.autoflush),
            receive_suspended: AtomicBool::new(false),
            close_cause: Mutex::new(None),
            disconnected: AtomicBool::new(false),
            attachment: Mutex::new(None),
            close_hooks: Mutex::new(Vec::new()),
        }))
    }

    pub(crate) fn state(&self) -> ConnectionState {
        ConnectionState::from_u8(self.state.load(Ordering::Acquire))
    }

    pub(crate) fn dispatcher(&self) -> &DispatcherHandle {
        &self.dispatcher
    }

    pub(crate) fn pool(&self) -> &Arc<WorkerPool> {
        &self.pool
    }

    pub(crate) fn handler(&self) -> Arc<HandlerDescriptor> {
        self.handler.load_full()
    }

    pub(crate) fn set_handler(&self, descriptor: HandlerDescriptor) {
        self.handler.store(Arc::new(descriptor));
    }

    pub(crate) fn add_close_hook(&self, hook: CloseHook) {
        self.close_hooks.lock().push(hook);
    }

    /// Called by the dispatcher once the stream is registered.
    pub(crate) fn set_open(&self) -> bool {
        self.state
            .compare_exchange(
                ConnectionState::Connecting as u8,
                ConnectionState::Open as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_ok()
    }

    fn notify_io(&self) {
        let _io = self.io.lock();
        self.io_cond.notify_all();
    }

    fn touch(&self) {
        let elapsed = self.created_at.elapsed().as_millis() as u64;
        self.last_activity_ms.store(elapsed, Ordering::Release);
        self.idle_fired.store(false, Ordering::Release);
    }

    pub(crate) fn last_activity(&self) -> Instant {
        self.created_at + Duration::from_millis(self.last_activity_ms.load(Ordering::Acquire))
    }

    pub(crate) fn created_at(&self) -> Instant {
        self.created_at
    }

    pub(crate) fn set_idle_timeout(&self, timeout: Option<Duration>) {
        self.timeouts.lock().idle = timeout;
        self.idle_fired.store(false, Ordering::Release);
    }

    pub(crate) fn idle_timeout(&self) -> Option<Duration> {
        self.timeouts.lock().idle
    }

    pub(crate) fn set_connection_timeout(&self, timeout: Option<Duration>) {
        self.timeouts.lock().connection = timeout;
        self.connection_timeout_fired.store(false, Ordering::Release);
    }

    pub(crate) fn connection_timeout(&self) -> Option<Duration> {
        self.timeouts.lock().connection
    }

    /// Feeds bytes read from the socket through the security layer into the
    /// inbound buffer. Returns the number of application bytes appended.
    pub(crate) fn receive(&self, raw: &[u8]) -> Result<usize> {
        let appended = {
            let mut io = self.io.lock();
            let IoState {
                inbound,
                outbound,
                secure,
                ..
            } = &mut *io;
            let appended = secure.receive(raw, inbound, outbound)?;
            if appended > 0 {
                self.io_cond.notify_all();
            }
            appended
        };
        self.touch();
        trace!(id = %self.id, raw = raw.len(), appended, "received");
        Ok(appended)
    }

    pub(crate) fn has_pending_output(&self) -> bool {
        !self.io.lock().outbound.is_empty()
    }

    pub(crate) fn pending_output(&self) -> usize {
        let io = self.io.lock();
        io.outbound.len() + io.staged.len()
    }

    /// Whether output queued by a read (handshake records, alerts) should be
    /// written right away. With autoflush off, only an ongoing handshake
    /// does.
    pub(crate) fn flush_after_read(&self) -> bool {
        let io = self.io.lock();
        !io.outbound.is_empty()
            && (self.is_autoflush() || io.secure.state() == SecureState::Handshaking)
    }

    pub(crate) fn is_autoflush(&self) -> bool {
        self.autoflush.load(Ordering::Acquire)
    }

    pub(crate) fn set_autoflush(&self, autoflush: bool) {
        self.autoflush.store(autoflush, Ordering::Release);
    }

    /// Moves staged plaintext to the outbound queue and asks the dispatcher
    /// to write it.
    pub(crate) fn flush(&self) -> Result<()> {
        self.io.lock().commit_staged()?;
        self.request_flush()
    }

    /// Writes as much queued output as the socket accepts. Returns the number
    /// of bytes written and whether the queue is now empty.
    pub(crate) fn write_to<W: Write>(&self, stream: &mut W) -> io::Result<(usize, bool)> {
        let mut io = self.io.lock();
        let mut written = 0;
        let result = loop {
            if io.outbound.is_empty() {
                break Ok(());
            }
            match stream.write(&io.outbound) {
                Ok(0) => break Err(io::Error::from(io::ErrorKind::WriteZero)),
                Ok(n) => {
                    io.outbound.advance(n);
                    written += n;
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break Ok(()),
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => break Err(e),
            }
        };
        let drained = io.outbound.is_empty();
        if written > 0 {
            self.io_cond.notify_all();
        }
        result.map(|()| (written, drained))
    }

    /// Clears the pending flush flag. Returns whether a flush was requested.
    pub(crate) fn take_flush_request(&self) -> bool {
        self.flush_requested.swap(false, Ordering::AcqRel)
    }

    pub(crate) fn request_flush(&self) -> Result<()> {
        if self.flush_requested.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        let sent = self.dispatcher.send(Command::Flush(self.token));
        if sent.is_err() {
            self.flush_requested.store(false, Ordering::Release);
        }
        sent
    }

    pub(crate) fn is_receive_suspended(&self) -> bool {
        self.receive_suspended.load(Ordering::Acquire)
    }

    pub(crate) fn set_receive_suspended(&self, suspended: bool) -> Result<()> {
        if self.receive_suspended.swap(suspended, Ordering::AcqRel) == suspended {
            return Ok(());
        }
        let command = if suspended {
            Command::SuspendRead(self.token)
        } else {
            Command::ResumeRead(self.token)
        };
        self.dispatcher.send(command)
    }

    /// Starts closing the connection. The first recorded cause wins; later
    /// calls are no-ops.
    pub(crate) fn close_with(self: &Arc<Self>, cause: DisconnectCause) {
        {
            let mut current = self.close_cause.lock();
            if current.is_none() {
                *current = Some(cause);
            }
        }

        let mut state = self.state.load(Ordering::Acquire);
        loop {
            if state >= ConnectionState::Closing as u8 {
                return;
            }
            match self.state.compare_exchange(
                state,
                ConnectionState::Closing as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => break,
                Err(actual) => state = actual,
            }
        }
        debug!(id = %self.id, "closing connection");
        if self.wants_graceful_close() {
            if let Err(e) = self.io.lock().commit_staged() {
                debug!(id = %self.id, error = %e, "staged output dropped");
            }
        }
        self.notify_io();

        if self.dispatcher.send(Command::Close(self.token)).is_err() {
            // the dispatcher is gone, so nobody else will finish the close
            self.mark_closed(DisconnectCause::Shutdown);
        }
    }

    /// Whether pending output should be flushed before the socket is closed.
    pub(crate) fn wants_graceful_close(&self) -> bool {
        self.flush_on_close
            && !self
                .close_cause
                .lock()
                .as_ref()
                .map(DisconnectCause::is_error)
                .unwrap_or(false)
    }

    /// Final transition to CLOSED, run by the dispatcher after the stream is
    /// deregistered. Queues the disconnect notification exactly once.
    pub(crate) fn mark_closed(self: &Arc<Self>, fallback: DisconnectCause) {
        self.state
            .store(ConnectionState::Closed as u8, Ordering::Release);
        let cause = self.close_cause.lock().get_or_insert(fallback).clone();
        self.notify_io();

        if !self.disconnected.swap(true, Ordering::AcqRel) {
            debug!(id = %self.id, peer = %self.peer_addr, %cause, "connection closed");
            self.push_event(CallbackEvent::Disconnect(cause));
        }
    }

    /// Checks the configured timeouts. Returns a timeout that expired since
    /// the last check, each kind at most once until reset.
    pub(crate) fn expired_timeout(&self, now: Instant) -> Option<TimeoutKind> {
        let (idle, connection) = {
            let timeouts = self.timeouts.lock();
            (timeouts.idle, timeouts.connection)
        };
        if let Some(limit) = connection {
            if now.saturating_duration_since(self.created_at) >= limit
                && !self.connection_timeout_fired.swap(true, Ordering::AcqRel)
            {
                return Some(TimeoutKind::Connection);
            }
        }
        if let Some(limit) = idle {
            if now.saturating_duration_since(self.last_activity()) >= limit
                && !self.idle_fired.swap(true, Ordering::AcqRel)
            {
                return Some(TimeoutKind::Idle);
            }
        }
        None
    }

    /// Hands an expired timeout to the handler, or closes directly if the
    /// handler does not take timeout callbacks.
    pub(crate) fn on_timeout(self: &Arc<Self>, kind: TimeoutKind) {
        debug!(id = %self.id, ?kind, "timeout expired");
        if self.handler().supports(Capabilities::TIMEOUT) {
            self.push_event(match kind {
                TimeoutKind::Idle => CallbackEvent::IdleTimeout,
                TimeoutKind::Connection => CallbackEvent::ConnectionTimeout,
            });
        } else {
            self.close_with(timeout_cause(kind));
        }
    }

    pub(crate) fn schedule_connect(self: &Arc<Self>) {
        self.push_event(CallbackEvent::Connect);
    }

    pub(crate) fn schedule_data(self: &Arc<Self>) {
        self.push_event(CallbackEvent::Data);
    }

    fn push_event(self: &Arc<Self>, event: CallbackEvent) {
        let is_disconnect = matches!(event, CallbackEvent::Disconnect(_));
        if !is_disconnect && self.disconnected.load(Ordering::Acquire) {
            return;
        }
        if let Some(required) = event.required() {
            if !self.handler().supports(required) {
                return;
            }
        }

        let is_data = matches!(event, CallbackEvent::Data);
        let start = self
            .events
            .push(event, |queued| is_data && matches!(queued, CallbackEvent::Data));
        if start {
            let conn = Arc::clone(self);
            if self.pool.execute(move || conn.drain_events()).is_err() {
                // pool already shut down; deliver on this thread
                self.drain_events();
            }
        }
    }

    fn drain_events(self: &Arc<Self>) {
        let conn = NonBlockingConnection {
            inner: Arc::clone(self),
        };
        while let Some(event) = self.events.next() {
            self.dispatch(&conn, event);
        }
    }

    fn dispatch(self: &Arc<Self>, conn: &NonBlockingConnection, event: CallbackEvent) {
        match event {
            CallbackEvent::Connect => {
                let descriptor = self.handler();
                if !descriptor.supports(Capabilities::CONNECT) {
                    return;
                }
                match descriptor.handler.on_connect(conn) {
                    Ok(true) => {}
                    Ok(false) => {
                        debug!(id = %self.id, "connection rejected by handler");
                        self.close_with(DisconnectCause::Closed);
                    }
                    Err(e) if e.is_incomplete() => {}
                    Err(e) => self.fail(e),
                }
            }
            CallbackEvent::Data => self.run_on_data(conn),
            CallbackEvent::IdleTimeout => {
                if self.handler().handler.on_idle_timeout(conn) {
                    self.close_with(DisconnectCause::IdleTimeout);
                }
            }
            CallbackEvent::ConnectionTimeout => {
                if self.handler().handler.on_connection_timeout(conn) {
                    self.close_with(DisconnectCause::ConnectionTimeout);
                }
            }
            CallbackEvent::Disconnect(cause) => {
                let descriptor = self.handler();
                if descriptor.supports(Capabilities::DISCONNECT) {
                    descriptor.handler.on_disconnect(conn, &cause);
                }
                if descriptor.connection_scoped && descriptor.supports(Capabilities::LIFECYCLE) {
                    descriptor.handler.on_destroy();
                }
                let hooks = std::mem::take(&mut *self.close_hooks.lock());
                for hook in hooks {
                    hook(self.id);
                }
            }
        }
    }

    /// Calls `on_data` while it keeps consuming, so data that arrived while
    /// the previous call ran is not left waiting for the next read event.
    fn run_on_data(self: &Arc<Self>, conn: &NonBlockingConnection) {
        loop {
            let before = self.io.lock().inbound.available();
            if before == 0 {
                return;
            }
            // reloaded each round: the handler may replace itself
            let descriptor = self.handler();
            if !descriptor.supports(Capabilities::DATA) {
                return;
            }
            match descriptor.handler.on_data(conn) {
                Ok(true) => {
                    let after = self.io.lock().inbound.available();
                    if after == 0 || after >= before {
                        return;
                    }
                }
                Ok(false) => return,
                Err(e) if e.is_incomplete() => return,
                Err(e) => {
                    self.fail(e);
                    return;
                }
            }
        }
    }

    fn fail(self: &Arc<Self>, err: Error) {
        if matches!(err, Error::Closed) && self.state() >= ConnectionState::Closing {
            debug!(id = %self.id, "handler observed closed connection");
            return;
        }
        warn!(id = %self.id, peer = %self.peer_addr, error = %err, "handler failed, closing connection");
        self.close_with(DisconnectCause::from(err));
    }
}

/// Selector token of a connection. Token 0 is the dispatcher's waker.
pub(crate) fn token_for(id: ConnectionId) -> Result<Token> {
    match usize::try_from(id.as_u64()) {
        Ok(0) | Err(_) => Err(Error::Rejected(format!(
            "connection id {} has no selector token",
            id
        ))),
        Ok(raw) => Ok(Token(raw)),
    }
}

pub(crate) fn timeout_cause(kind: TimeoutKind) -> DisconnectCause {
    match kind {
        TimeoutKind::Idle => DisconnectCause::IdleTimeout,
        TimeoutKind::Connection => DisconnectCause::ConnectionTimeout,
    }
}
