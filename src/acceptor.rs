//! Listening side: accepts TCP connections and spreads them over the
//! dispatchers.
//!
//! The acceptor runs on its own thread with its own selector, so a burst of
//! connects never delays I/O on established connections. For every accepted
//! stream it:
//!
//! ```text
//! accept() ──> max_connections check ──> socket options
//!          ──> pick dispatcher (round-robin / least-loaded, per-dispatcher cap)
//!          ──> resolve handler (shared or per-connection factory)
//!          ──> insert into LockfreeMap<u64, NonBlockingConnection>
//!          ──> Command::Register to the dispatcher
//! ```
//!
//! The registry entry is removed by a close hook once the connection's
//! disconnect notification has run.

use std::{
    io,
    net::SocketAddr,
    sync::{
        atomic::{AtomicBool, AtomicU64, Ordering},
        Arc, Weak,
    },
    thread::{self, JoinHandle},
    time::Duration,
};

use lockfree::map::Map as LockfreeMap;
use mio::{
    net::{TcpListener, TcpStream},
    Events, Interest, Poll, Token, Waker,
};
use parking_lot::Mutex;
use socket2::{Domain, Protocol, Socket, Type};
use tracing::{debug, error, info, warn};

use crate::{
    config::ServerConfig,
    connection::{ConnectionId, NonBlockingConnection},
    dispatcher::Command,
    error::{Error, Result},
    handler::{Capabilities, HandlerDescriptor, HandlerSource},
    secure::TlsRole,
    LoopCore,
};

const WAKER_TOKEN: Token = Token(0);
const LISTENER_TOKEN: Token = Token(1);
const ACCEPT_POLL_TIMEOUT: Duration = Duration::from_millis(500);

/// Counters of a listening server.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ServerStats {
    pub accepted: u64,
    /// Connections closed right after accept (limits, no free dispatcher,
    /// socket setup failures).
    pub rejected: u64,
    pub open: usize,
}

struct ServerShared {
    local_addr: SocketAddr,
    config: ServerConfig,
    core: Arc<LoopCore>,
    handler: HandlerSource,
    connections: LockfreeMap<u64, NonBlockingConnection>,
    accepted: AtomicU64,
    rejected: AtomicU64,
    open: AtomicBool,
    waker: Waker,
}

/// Handle to a listening server.
///
/// Dropping the handle closes the listener and every connection it accepted.
pub struct Server {
    shared: Arc<ServerShared>,
    thread: Mutex<Option<JoinHandle<()>>>,
}

impl Server {
    pub(crate) fn start(core: Arc<LoopCore>, config: ServerConfig, handler: HandlerSource) -> Result<Server> {
        config.validate()?;

        let std_listener = bind(&config)?;
        let local_addr = std_listener.local_addr()?;
        let mut listener = TcpListener::from_std(std_listener);

        let poll = Poll::new()?;
        poll.registry()
            .register(&mut listener, LISTENER_TOKEN, Interest::READABLE)?;
        let waker = Waker::new(poll.registry(), WAKER_TOKEN)?;

        if let HandlerSource::Shared(handler) = &handler {
            if HandlerDescriptor::new(Arc::clone(handler)).supports(Capabilities::LIFECYCLE) {
                handler.on_init();
            }
        }

        let shared = Arc::new(ServerShared {
            local_addr,
            config,
            core,
            handler,
            connections: LockfreeMap::new(),
            accepted: AtomicU64::new(0),
            rejected: AtomicU64::new(0),
            open: AtomicBool::new(true),
            waker,
        });

        let acceptor = Arc::clone(&shared);
        let thread = thread::Builder::new()
            .name(format!("millstream-acceptor-{}", local_addr.port()))
            .spawn(move || acceptor.run(poll, listener))?;

        info!(addr = %local_addr, "server listening");
        Ok(Server {
            shared,
            thread: Mutex::new(Some(thread)),
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.shared.local_addr
    }

    pub fn is_open(&self) -> bool {
        self.shared.open.load(Ordering::Acquire)
    }

    /// Number of accepted connections that have not disconnected yet.
    pub fn connection_count(&self) -> usize {
        self.shared.connections.iter().count()
    }

    pub fn connection(&self, id: ConnectionId) -> Option<NonBlockingConnection> {
        self.shared
            .connections
            .get(&id.as_u64())
            .map(|entry| entry.val().clone())
    }

    /// Snapshot of the open connections.
    pub fn connections(&self) -> Vec<NonBlockingConnection> {
        self.shared
            .connections
            .iter()
            .map(|entry| entry.val().clone())
            .collect()
    }

    /// Queues `data` on one connection.
    ///
    /// ## Errors
    ///
    /// [`Error::Closed`] if the connection is unknown or already closed.
    pub fn send_to(&self, id: ConnectionId, data: &[u8]) -> Result<usize> {
        match self.connection(id) {
            Some(conn) => conn.write(data),
            None => Err(Error::Closed),
        }
    }

    /// Starts closing one connection. Returns false for an unknown id.
    pub fn close_connection(&self, id: ConnectionId) -> bool {
        match self.connection(id) {
            Some(conn) => {
                conn.close();
                true
            }
            None => false,
        }
    }

    /// Queues `data` on every open connection and returns how many accepted
    /// it.
    pub fn broadcast(&self, data: &[u8]) -> usize {
        let mut delivered = 0;
        for entry in self.shared.connections.iter() {
            match entry.val().write(data) {
                Ok(_) => delivered += 1,
                Err(e) => debug!(id = %entry.val().id(), error = %e, "broadcast skipped connection"),
            }
        }
        delivered
    }

    pub fn stats(&self) -> ServerStats {
        ServerStats {
            accepted: self.shared.accepted.load(Ordering::Relaxed),
            rejected: self.shared.rejected.load(Ordering::Relaxed),
            open: self.connection_count(),
        }
    }

    /// Stops accepting and closes every accepted connection. Waits for the
    /// acceptor thread unless called from it.
    pub fn close(&self) {
        if self.shared.open.swap(false, Ordering::AcqRel) {
            if let Err(e) = self.shared.waker.wake() {
                warn!(addr = %self.shared.local_addr, error = %e, "failed to wake acceptor");
            }
        }
        let Some(thread) = self.thread.lock().take() else {
            return;
        };
        if thread.thread().id() == thread::current().id() {
            return;
        }
        if thread.join().is_err() {
            error!(addr = %self.shared.local_addr, "acceptor thread panicked");
        }
    }
}

impl Drop for Server {
    fn drop(&mut self) {
        self.close();
    }
}

impl std::fmt::Debug for Server {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Server")
            .field("local_addr", &self.shared.local_addr)
            .field("open", &self.is_open())
            .finish()
    }
}

impl ServerShared {
    fn run(self: Arc<Self>, mut poll: Poll, mut listener: TcpListener) {
        let mut events = Events::with_capacity(128);

        while self.open.load(Ordering::Acquire) {
            if let Err(e) = poll.poll(&mut events, Some(ACCEPT_POLL_TIMEOUT)) {
                if e.kind() == io::ErrorKind::Interrupted {
                    continue;
                }
                error!(addr = %self.local_addr, error = %e, "acceptor poll failed");
                self.open.store(false, Ordering::Release);
                break;
            }
            for event in events.iter() {
                if event.token() == LISTENER_TOKEN {
                    self.accept_all(&listener);
                }
            }
        }

        let _ = poll.registry().deregister(&mut listener);
        drop(listener);

        for entry in self.connections.iter() {
            entry.val().close();
        }
        if let HandlerSource::Shared(handler) = &self.handler {
            if HandlerDescriptor::new(Arc::clone(handler)).supports(Capabilities::LIFECYCLE) {
                handler.on_destroy();
            }
        }
        info!(addr = %self.local_addr, "server closed");
    }

    fn accept_all(self: &Arc<Self>, listener: &TcpListener) {
        loop {
            match listener.accept() {
                Ok((stream, peer)) => {
                    if let Err(e) = self.admit(stream, peer) {
                        self.rejected.fetch_add(1, Ordering::Relaxed);
                        warn!(addr = %self.local_addr, %peer, error = %e, "connection rejected");
                    }
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    // e.g. out of file descriptors; retried on the next readiness
                    error!(addr = %self.local_addr, error = %e, "accept failed");
                    break;
                }
            }
        }
    }

    fn admit(self: &Arc<Self>, stream: TcpStream, peer: SocketAddr) -> Result<()> {
        if let Some(max) = self.config.max_connections {
            if self.connections.iter().count() >= max {
                return Err(Error::Rejected(format!("max connections ({}) reached", max)));
            }
        }
        self.config.socket.apply(&stream)?;

        let dispatcher = self
            .core
            .pick_dispatcher(self.config.assignment, self.config.max_handles_per_dispatcher)
            .ok_or_else(|| Error::Rejected("no dispatcher has a free slot".into()))?;

        let descriptor = match &self.handler {
            HandlerSource::Shared(handler) => HandlerDescriptor::new(Arc::clone(handler)),
            HandlerSource::PerConnection(factory) => {
                let descriptor = HandlerDescriptor::connection_scoped(factory.create());
                if descriptor.supports(Capabilities::LIFECYCLE) {
                    descriptor.handler.on_init();
                }
                descriptor
            }
        };
        let connection_scoped = descriptor.connection_scoped;

        let conn = match self.core.attach(
            &stream,
            TlsRole::Server,
            self.config.connection.clone(),
            descriptor.clone(),
            &dispatcher,
        ) {
            Ok(conn) => conn,
            Err(e) => {
                dispatcher.release();
                if connection_scoped && descriptor.supports(Capabilities::LIFECYCLE) {
                    descriptor.handler.on_destroy();
                }
                return Err(e);
            }
        };

        let id = conn.id;
        let server = Arc::downgrade(self);
        conn.add_close_hook(Box::new(move |id| forget(&server, id)));
        self.connections
            .insert(id.as_u64(), NonBlockingConnection::from_shared(Arc::clone(&conn)));

        if let Err(e) = dispatcher.send(Command::Register { stream, conn }) {
            self.connections.remove(&id.as_u64());
            dispatcher.release();
            return Err(e);
        }

        self.accepted.fetch_add(1, Ordering::Relaxed);
        debug!(%id, %peer, dispatcher = dispatcher.name(), "connection accepted");
        Ok(())
    }
}

fn forget(server: &Weak<ServerShared>, id: ConnectionId) {
    if let Some(server) = server.upgrade() {
        server.connections.remove(&id.as_u64());
    }
}

fn bind(config: &ServerConfig) -> Result<std::net::TcpListener> {
    let addr = config.address;
    let socket = Socket::new(Domain::for_address(addr), Type::STREAM, Some(Protocol::TCP))
        .map_err(|e| Error::bind(addr, e))?;
    socket
        .set_reuse_address(config.socket.reuse_address)
        .map_err(|e| Error::bind(addr, e))?;
    socket.set_nonblocking(true)?;
    socket
        .bind(&addr.into())
        .map_err(|e| Error::bind(addr, e))?;
    socket
        .listen(config.backlog)
        .map_err(|e| Error::bind(addr, e))?;
    Ok(socket.into())
}
