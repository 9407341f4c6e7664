//! # Millstream
//! A non-blocking connection framework for Rust: buffered TCP connections with
//! delimiter/length framing, runtime-switchable TLS and logical-stream
//! multiplexing, driven by a small set of [`mio`] reactor threads and a
//! dynamically sized worker pool, without an async runtime.
//!
//! ## Core Philosophy
//! Millstream is built for protocol servers that want:
//! - **Callback-style handlers** that read complete frames instead of raw bytes
//! - **Predictable threading**: a fixed number of dispatcher threads own the
//!   sockets; handler code runs on a bounded worker pool
//! - **Per-connection ordering**: callbacks of one connection never overlap
//! - **Isolation**: a failing connection never disturbs its neighbours
//!
//! ## Architecture Overview
//! ```text
//! ┌─────────────┐  accept   ┌──────────────┐  Register  ┌────────────────┐
//! │  Acceptor   │──────────▶│  LoopCore    │───────────▶│ Dispatcher × N │
//! └─────────────┘           └──────────────┘            └────────────────┘
//!                                                          │ read / write
//!                                                          ▼
//! ┌─────────────┐  callbacks ┌──────────────────────┐  ┌────────────────┐
//! │ WorkerPool  │◀───────────│ NonBlockingConnection│◀─│ FramingBuffer  │
//! └─────────────┘            └──────────────────────┘  │ SecureChannel  │
//!                                       ▲              └────────────────┘
//!                                       │ frames
//!                            ┌──────────────────────┐
//!                            │ MultiplexedConnection│──▶ Pipeline × M
//!                            └──────────────────────┘
//! ```
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use millstream::{prelude::*, ServerConfig};
//! use std::sync::Arc;
//!
//! struct LineEcho;
//!
//! impl Handler for LineEcho {
//!     fn on_data(&self, conn: &NonBlockingConnection) -> millstream::Result<bool> {
//!         let line = conn.read_by_delimiter(b"\r\n")?;
//!         conn.write(&line)?;
//!         conn.write(b"\r\n")?;
//!         Ok(true)
//!     }
//! }
//!
//! fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let event_loop = EventLoop::default();
//!     let config = ServerConfig::builder()
//!         .address("127.0.0.1:7878".parse()?)
//!         .idle_timeout(std::time::Duration::from_secs(30))
//!         .build();
//!     let server = event_loop.listen(config, Arc::new(LineEcho))?;
//!     println!("listening on {}", server.local_addr());
//!
//!     // Blocks until stop() is called from another thread
//!     event_loop.run()?;
//!     Ok(())
//! }
//! ```
//!
//! - [`EventLoop`]: owns the dispatchers and the worker pool; starts servers and
//!   outbound connections
//! - [`Handler`]: callback contract implemented by protocol code
//! - [`NonBlockingConnection`] / [`BlockingConnection`]: the connection API
//! - [`framing`]: the buffered read contract behind every `read_*` call
//! - [`secure`]: TLS contexts for secured mode
//! - [`multiplexed`]: pipelines over a single physical connection
//! - [`error`]: error types and disconnect causes

pub mod acceptor;
pub mod chain;
pub mod config;
pub mod connection;
pub mod dispatcher;
pub mod error;
pub mod framing;
pub mod handler;
pub mod multiplexed;
pub mod object_pool;
pub mod secure;
pub mod utils;
pub mod worker_pool;

use std::{
    net::SocketAddr,
    sync::{
        atomic::{AtomicU64, AtomicUsize, Ordering},
        Arc,
    },
    thread::{self, JoinHandle},
};

use mio::net::TcpStream;
use parking_lot::{Condvar, Mutex};
use tracing::{debug, error, info};

pub use acceptor::{Server, ServerStats};
pub use chain::{HandlerChain, HandlerChainBuilder, NodeId};
pub use config::{
    AssignmentStrategy, ConnectConfig, ConnectionOptions, EventLoopConfig, MultiplexConfig,
    ServerConfig, SocketOptions, SpinDetection,
};
pub use connection::{BlockingConnection, ConnectionId, ConnectionState, NonBlockingConnection};
pub use dispatcher::DispatcherStats;
pub use error::{DisconnectCause, Error, Result};
pub use framing::FramingBuffer;
pub use handler::{Capabilities, Handler, HandlerFactory, HandlerSource};
pub use multiplexed::{
    BlockingPipeline, MultiplexedAdapter, MultiplexedConnection, Pipeline, PipelineHandler,
    PipelineId, PipelineState,
};
pub use object_pool::{ObjectPool, PooledObject};
pub use secure::{SecureContext, SecureState};
pub use worker_pool::{WorkerPool, WorkerPoolStats};

use crate::{
    connection::shared::{ConnectionParams, ConnectionShared},
    dispatcher::{Command, Dispatcher, DispatcherHandle},
    handler::{HandlerDescriptor, NoopHandler},
    secure::TlsRole,
};

/// Commonly used types and traits.
///
/// ```rust
/// use millstream::prelude::*;
/// ```
pub mod prelude {
    pub use crate::connection::{BlockingConnection, NonBlockingConnection};
    pub use crate::error::{DisconnectCause, Error};
    pub use crate::handler::{Capabilities, Handler};
    pub use crate::multiplexed::{MultiplexedConnection, Pipeline, PipelineHandler};
    pub use crate::EventLoop;
}

/// Aggregated counters of an event loop.
#[derive(Debug, Clone)]
pub struct EventLoopStats {
    pub dispatchers: Vec<DispatcherStats>,
    pub workers: WorkerPoolStats,
}

/// State shared by the event loop and the servers it started.
pub(crate) struct LoopCore {
    config: EventLoopConfig,
    dispatchers: Vec<DispatcherHandle>,
    pool: Arc<WorkerPool>,
    next_id: AtomicU64,
    round_robin: AtomicUsize,
}

impl LoopCore {
    /// Picks a dispatcher and reserves a slot on it.
    pub(crate) fn pick_dispatcher(
        &self,
        strategy: AssignmentStrategy,
        max_handles: Option<usize>,
    ) -> Option<DispatcherHandle> {
        let count = self.dispatchers.len();
        match strategy {
            AssignmentStrategy::RoundRobin => {
                let start = self.round_robin.fetch_add(1, Ordering::Relaxed);
                (0..count)
                    .map(|i| &self.dispatchers[(start + i) % count])
                    .find(|d| d.try_reserve(max_handles))
                    .cloned()
            }
            AssignmentStrategy::LeastLoaded => {
                let mut candidates: Vec<&DispatcherHandle> = self.dispatchers.iter().collect();
                candidates.sort_by_key(|d| d.handles());
                candidates
                    .into_iter()
                    .find(|d| d.try_reserve(max_handles))
                    .cloned()
            }
        }
    }

    /// Builds the shared state of a connection for `stream`. The caller
    /// registers it with `dispatcher`.
    pub(crate) fn attach(
        &self,
        stream: &TcpStream,
        role: TlsRole,
        options: ConnectionOptions,
        handler: HandlerDescriptor,
        dispatcher: &DispatcherHandle,
    ) -> Result<Arc<ConnectionShared>> {
        let id = ConnectionId::new(self.next_id.fetch_add(1, Ordering::Relaxed));
        ConnectionShared::new(ConnectionParams {
            id,
            local_addr: stream.local_addr()?,
            peer_addr: stream.peer_addr()?,
            role,
            options,
            handler,
            dispatcher: dispatcher.clone(),
            pool: Arc::clone(&self.pool),
            receive_capacity: self.config.receive_buffer_size,
        })
    }
}

/// Owner of the dispatcher threads and the worker pool.
///
/// `EventLoop` starts servers ([`listen`](Self::listen)) and outbound
/// connections ([`connect`](Self::connect)). All of them share the same
/// dispatchers and workers. Dropping the loop stops it.
///
/// ## Example
///
/// ```rust,no_run
/// use millstream::{EventLoop, EventLoopConfig};
/// use std::time::Duration;
///
/// let config = EventLoopConfig::builder()
///     .dispatchers(4)
///     .worker_pool(2, 32)
///     .select_timeout(Duration::from_millis(200))
///     .build();
/// let event_loop = EventLoop::new(config)?;
/// # Ok::<(), Box<dyn std::error::Error>>(())
/// ```
pub struct EventLoop {
    core: Arc<LoopCore>,
    threads: Mutex<Vec<JoinHandle<()>>>,
    stopped: Mutex<bool>,
    stopped_cond: Condvar,
}

impl Default for EventLoop {
    /// Creates an `EventLoop` with [`EventLoopConfig::default`].
    ///
    /// # Panics
    ///
    /// Panics if the selectors or threads cannot be created.
    fn default() -> Self {
        Self::new(EventLoopConfig::default())
            .expect("failed to start event loop with default configuration")
    }
}

impl EventLoop {
    /// Starts the dispatcher threads and the worker pool.
    ///
    /// ## Errors
    ///
    /// [`Error::Configuration`] for invalid settings, [`Error::Io`] if a
    /// selector or thread cannot be created.
    pub fn new(config: EventLoopConfig) -> Result<Self> {
        config.validate()?;

        let pool = Arc::new(WorkerPool::with_timing(
            config.worker_min,
            config.worker_max,
            config.worker_keep_alive,
            config.worker_adjust_period,
        )?);
        let buffers =
            object_pool::receive_buffers(config.buffer_pool_size, config.receive_buffer_size);

        let mut dispatchers = Vec::with_capacity(config.dispatchers);
        let mut threads = Vec::with_capacity(config.dispatchers);
        for index in 0..config.dispatchers {
            match Dispatcher::spawn(index, &config, buffers.clone()) {
                Ok((handle, thread)) => {
                    dispatchers.push(handle);
                    threads.push(thread);
                }
                Err(e) => {
                    for handle in &dispatchers {
                        let _ = handle.send(Command::Shutdown);
                    }
                    for thread in threads {
                        let _ = thread.join();
                    }
                    pool.shutdown();
                    return Err(e);
                }
            }
        }

        info!(
            dispatchers = config.dispatchers,
            worker_min = config.worker_min,
            worker_max = config.worker_max,
            "event loop started"
        );

        Ok(Self {
            core: Arc::new(LoopCore {
                config,
                dispatchers,
                pool,
                next_id: AtomicU64::new(1),
                round_robin: AtomicUsize::new(0),
            }),
            threads: Mutex::new(threads),
            stopped: Mutex::new(false),
            stopped_cond: Condvar::new(),
        })
    }

    /// Binds `config.address` and serves every accepted connection with one
    /// shared `handler`.
    ///
    /// ## Errors
    ///
    /// [`Error::AddressInUse`] / [`Error::Bind`] if the address cannot be
    /// bound, [`Error::Configuration`] for invalid options.
    pub fn listen(&self, config: ServerConfig, handler: Arc<dyn Handler>) -> Result<Server> {
        self.ensure_running()?;
        Server::start(Arc::clone(&self.core), config, HandlerSource::Shared(handler))
    }

    /// Like [`listen`](Self::listen), but every accepted connection gets its
    /// own handler from `factory`.
    pub fn listen_with_factory<F>(&self, config: ServerConfig, factory: F) -> Result<Server>
    where
        F: HandlerFactory,
    {
        self.ensure_running()?;
        Server::start(
            Arc::clone(&self.core),
            config,
            HandlerSource::PerConnection(Arc::new(factory)),
        )
    }

    /// Opens an outbound connection served by `handler`.
    ///
    /// ## Errors
    ///
    /// [`Error::Timeout`] if the connect did not finish within
    /// `config.connect_timeout`; [`Error::Io`] for other connect failures.
    pub fn connect(
        &self,
        addr: SocketAddr,
        config: ConnectConfig,
        handler: Arc<dyn Handler>,
    ) -> Result<NonBlockingConnection> {
        self.ensure_running()?;
        config.validate()?;

        let stream = std::net::TcpStream::connect_timeout(&addr, config.connect_timeout).map_err(
            |e| match e.kind() {
                std::io::ErrorKind::TimedOut => Error::Timeout,
                _ => Error::Io(e),
            },
        )?;
        stream.set_nonblocking(true)?;
        config.socket.apply(&stream)?;
        let stream = TcpStream::from_std(stream);

        let dispatcher = self
            .core
            .pick_dispatcher(AssignmentStrategy::RoundRobin, None)
            .ok_or(Error::EventLoopGone)?;
        let conn = match self.core.attach(
            &stream,
            TlsRole::Client,
            config.connection,
            HandlerDescriptor::new(handler),
            &dispatcher,
        ) {
            Ok(conn) => conn,
            Err(e) => {
                dispatcher.release();
                return Err(e);
            }
        };

        let handle = NonBlockingConnection::from_shared(Arc::clone(&conn));
        if let Err(e) = dispatcher.send(Command::Register { stream, conn }) {
            dispatcher.release();
            return Err(e);
        }
        debug!(id = %handle.id(), peer = %addr, dispatcher = dispatcher.name(), "connected");
        Ok(handle)
    }

    /// Opens an outbound connection driven through the blocking API.
    pub fn connect_blocking(&self, addr: SocketAddr, config: ConnectConfig) -> Result<BlockingConnection> {
        let conn = self.connect(addr, config, Arc::new(NoopHandler))?;
        Ok(BlockingConnection::new(conn))
    }

    /// Pull-based snapshot of dispatcher and worker counters.
    pub fn stats(&self) -> EventLoopStats {
        EventLoopStats {
            dispatchers: self.core.dispatchers.iter().map(DispatcherHandle::stats).collect(),
            workers: self.core.pool.stats(),
        }
    }

    pub fn config(&self) -> &EventLoopConfig {
        &self.core.config
    }

    pub fn is_running(&self) -> bool {
        !*self.stopped.lock()
    }

    /// Blocks the calling thread until [`stop`](Self::stop) is called.
    ///
    /// The dispatchers run on their own threads from construction on; `run`
    /// only parks the caller, the way a server's main thread waits.
    pub fn run(&self) -> Result<()> {
        let mut stopped = self.stopped.lock();
        while !*stopped {
            self.stopped_cond.wait(&mut stopped);
        }
        Ok(())
    }

    /// Stops the dispatchers and the worker pool.
    ///
    /// Open connections are closed with [`DisconnectCause::Shutdown`] and
    /// their disconnect callbacks run before the pool shuts down. Safe to call
    /// from any thread, including a handler; idempotent.
    pub fn stop(&self) {
        {
            let mut stopped = self.stopped.lock();
            if *stopped {
                return;
            }
            *stopped = true;
        }

        for dispatcher in &self.core.dispatchers {
            if let Err(e) = dispatcher.send(Command::Shutdown) {
                debug!(dispatcher = dispatcher.name(), error = %e, "dispatcher already gone");
            }
        }
        let current = thread::current().id();
        for handle in self.threads.lock().drain(..) {
            if handle.thread().id() == current {
                continue;
            }
            if handle.join().is_err() {
                error!("dispatcher thread panicked");
            }
        }
        self.core.pool.shutdown();

        info!("event loop stopped");
        self.stopped_cond.notify_all();
    }

    fn ensure_running(&self) -> Result<()> {
        if self.is_running() {
            Ok(())
        } else {
            Err(Error::EventLoopGone)
        }
    }
}

impl Drop for EventLoop {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::{
        io::{Read, Write},
        sync::atomic::AtomicBool,
        time::Duration,
    };

    struct Echo;

    impl Handler for Echo {
        fn on_data(&self, conn: &NonBlockingConnection) -> Result<bool> {
            let data = conn.read_available()?;
            conn.write(&data)?;
            Ok(true)
        }
    }

    fn small_loop() -> EventLoop {
        EventLoop::new(
            EventLoopConfig::builder()
                .dispatchers(2)
                .worker_pool(1, 4)
                .build(),
        )
        .unwrap()
    }

    #[test]
    fn test_event_loop_creation() {
        let event_loop = small_loop();
        assert!(event_loop.is_running());
        assert_eq!(event_loop.stats().dispatchers.len(), 2);
    }

    #[test]
    fn test_invalid_config() {
        let config = EventLoopConfig {
            dispatchers: 0,
            ..EventLoopConfig::default()
        };
        assert!(matches!(EventLoop::new(config), Err(Error::Configuration(_))));
    }

    #[test]
    fn test_echo_round_trip() {
        let event_loop = small_loop();
        let server = event_loop
            .listen(
                ServerConfig::builder()
                    .address("127.0.0.1:0".parse().unwrap())
                    .build(),
                Arc::new(Echo),
            )
            .unwrap();

        let mut client = std::net::TcpStream::connect(server.local_addr()).unwrap();
        client
            .set_read_timeout(Some(Duration::from_secs(5)))
            .unwrap();
        client.write_all(b"ping").unwrap();
        let mut buf = [0u8; 4];
        client.read_exact(&mut buf).unwrap();
        assert_eq!(&buf, b"ping");

        let stats = event_loop.stats();
        assert_eq!(stats.dispatchers.iter().map(|d| d.handles).sum::<usize>(), 1);
        assert!(stats.dispatchers.iter().map(|d| d.bytes_received).sum::<u64>() >= 4);
    }

    #[test]
    fn test_run_returns_after_stop() {
        let event_loop = Arc::new(small_loop());
        let returned = Arc::new(AtomicBool::new(false));

        let runner = {
            let event_loop = Arc::clone(&event_loop);
            let returned = Arc::clone(&returned);
            thread::spawn(move || {
                event_loop.run().unwrap();
                returned.store(true, Ordering::SeqCst);
            })
        };

        thread::sleep(Duration::from_millis(50));
        assert!(!returned.load(Ordering::SeqCst));
        event_loop.stop();
        runner.join().unwrap();
        assert!(returned.load(Ordering::SeqCst));
        assert!(!event_loop.is_running());
    }

    #[test]
    fn test_stop_rejects_new_work() {
        let event_loop = small_loop();
        event_loop.stop();
        let err = event_loop
            .listen(ServerConfig::default(), Arc::new(Echo))
            .unwrap_err();
        assert!(matches!(err, Error::EventLoopGone));
    }

    #[test]
    fn test_connect_refused() {
        let event_loop = small_loop();
        // bind then drop to get a port nobody listens on
        let addr = std::net::TcpListener::bind("127.0.0.1:0")
            .unwrap()
            .local_addr()
            .unwrap();
        let result = event_loop.connect(addr, ConnectConfig::default(), Arc::new(Echo));
        assert!(result.is_err());
    }
}
