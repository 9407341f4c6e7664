//! Configuration for the event loop, servers, outbound connections and the
//! multiplexer.
//!
//! Every struct has a `Default` impl with the documented defaults and a builder
//! whose unset fields fall back to those defaults. Configurations are built once
//! at startup and handed to the components that use them; nothing here reads
//! environment variables or global state.
//!
//! ```rust
//! use millstream::config::{EventLoopConfig, ServerConfig};
//! use std::time::Duration;
//!
//! let loop_config = EventLoopConfig::builder()
//!     .dispatchers(2)
//!     .worker_pool(2, 32)
//!     .build();
//!
//! let server_config = ServerConfig::builder()
//!     .address("127.0.0.1:0".parse().unwrap())
//!     .backlog(512)
//!     .idle_timeout(Duration::from_secs(30))
//!     .build();
//! # let _ = (loop_config, server_config);
//! ```

use std::{io, net::SocketAddr, time::Duration};

use socket2::{SockRef, TcpKeepalive};

use crate::{
    error::{Error, Result},
    secure::SecureContext,
    utils,
};

pub const DEFAULT_EVENTS_CAPACITY: usize = 1024;
pub const DEFAULT_SELECT_TIMEOUT: Duration = Duration::from_millis(500);
pub const DEFAULT_SWEEP_INTERVAL: Duration = Duration::from_millis(500);
pub const DEFAULT_RECEIVE_BUFFER_SIZE: usize = 8192;
pub const DEFAULT_BUFFER_POOL_SIZE: usize = 20;
pub const DEFAULT_BACKLOG: i32 = 1024;
pub const DEFAULT_MAX_READ_SIZE: usize = 16 * 1024 * 1024;
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
pub const DEFAULT_CLOSE_TIMEOUT: Duration = Duration::from_secs(5);

/// Selector spin detection and recovery.
///
/// A select call that returns without any ready channel and without any queued
/// command, in less than `window`, counts as a spurious wakeup. After
/// `threshold` consecutive spurious wakeups the dispatcher logs a warning,
/// rebuilds its selector when `reinit` is set, and sleeps for `backoff`.
#[derive(Debug, Clone)]
pub struct SpinDetection {
    pub enabled: bool,
    pub threshold: u32,
    pub window: Duration,
    pub reinit: bool,
    pub backoff: Duration,
}

impl SpinDetection {
    pub fn disabled() -> Self {
        Self {
            enabled: false,
            ..Self::default()
        }
    }
}

impl Default for SpinDetection {
    fn default() -> Self {
        Self {
            enabled: true,
            threshold: 128,
            window: Duration::from_millis(5),
            reinit: true,
            backoff: Duration::from_millis(25),
        }
    }
}

/// Configuration of an [`EventLoop`](crate::EventLoop).
#[derive(Debug, Clone)]
pub struct EventLoopConfig {
    /// Number of dispatcher (reactor) threads.
    pub dispatchers: usize,
    /// Lower bound of the worker pool.
    pub worker_min: usize,
    /// Upper bound of the worker pool.
    pub worker_max: usize,
    /// Grace period an idle worker above `worker_min` survives.
    pub worker_keep_alive: Duration,
    /// Period of the worker pool size adjustment tick.
    pub worker_adjust_period: Duration,
    /// Maximum number of readiness events handled per select call.
    pub events_capacity: usize,
    /// Upper bound on a single select call.
    pub select_timeout: Duration,
    /// How often each dispatcher checks idle and connection timeouts.
    pub sweep_interval: Duration,
    pub spin_detection: SpinDetection,
    /// Size of the scratch buffers the dispatchers read into.
    pub receive_buffer_size: usize,
    /// Number of scratch buffers allocated up front per dispatcher.
    pub buffer_pool_size: usize,
}

impl EventLoopConfig {
    pub fn builder() -> EventLoopConfigBuilder {
        EventLoopConfigBuilder::new()
    }

    pub fn validate(&self) -> Result<()> {
        if self.dispatchers == 0 {
            return Err(Error::Configuration(
                "at least one dispatcher is required".into(),
            ));
        }
        if self.worker_max == 0 {
            return Err(Error::Configuration(
                "worker pool max size must be greater than zero".into(),
            ));
        }
        if self.worker_min > self.worker_max {
            return Err(Error::Configuration(format!(
                "worker pool min size {} exceeds max size {}",
                self.worker_min, self.worker_max
            )));
        }
        if self.events_capacity == 0 || self.receive_buffer_size == 0 {
            return Err(Error::Configuration(
                "events capacity and receive buffer size must be non-zero".into(),
            ));
        }
        Ok(())
    }
}

impl Default for EventLoopConfig {
    fn default() -> Self {
        let cpus = utils::get_default_capacity();
        Self {
            dispatchers: cpus.min(2),
            worker_min: 2,
            worker_max: cpus * 4,
            worker_keep_alive: Duration::from_secs(60),
            worker_adjust_period: Duration::from_secs(1),
            events_capacity: DEFAULT_EVENTS_CAPACITY,
            select_timeout: DEFAULT_SELECT_TIMEOUT,
            sweep_interval: DEFAULT_SWEEP_INTERVAL,
            spin_detection: SpinDetection::default(),
            receive_buffer_size: DEFAULT_RECEIVE_BUFFER_SIZE,
            buffer_pool_size: DEFAULT_BUFFER_POOL_SIZE,
        }
    }
}

/// Builder for [`EventLoopConfig`].
#[derive(Default)]
pub struct EventLoopConfigBuilder {
    dispatchers: Option<usize>,
    worker_bounds: Option<(usize, usize)>,
    worker_keep_alive: Option<Duration>,
    worker_adjust_period: Option<Duration>,
    events_capacity: Option<usize>,
    select_timeout: Option<Duration>,
    sweep_interval: Option<Duration>,
    spin_detection: Option<SpinDetection>,
    receive_buffer_size: Option<usize>,
    buffer_pool_size: Option<usize>,
}

impl EventLoopConfigBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the number of dispatcher threads
    pub fn dispatchers(mut self, count: usize) -> Self {
        self.dispatchers = Some(count);
        self
    }

    /// Set the worker pool bounds
    pub fn worker_pool(mut self, min: usize, max: usize) -> Self {
        self.worker_bounds = Some((min, max));
        self
    }

    pub fn worker_keep_alive(mut self, keep_alive: Duration) -> Self {
        self.worker_keep_alive = Some(keep_alive);
        self
    }

    pub fn worker_adjust_period(mut self, period: Duration) -> Self {
        self.worker_adjust_period = Some(period);
        self
    }

    pub fn events_capacity(mut self, capacity: usize) -> Self {
        self.events_capacity = Some(capacity);
        self
    }

    pub fn select_timeout(mut self, timeout: Duration) -> Self {
        self.select_timeout = Some(timeout);
        self
    }

    pub fn sweep_interval(mut self, interval: Duration) -> Self {
        self.sweep_interval = Some(interval);
        self
    }

    pub fn spin_detection(mut self, spin_detection: SpinDetection) -> Self {
        self.spin_detection = Some(spin_detection);
        self
    }

    /// Set the preallocated size of the per-read receive buffers
    pub fn receive_buffer_size(mut self, size: usize) -> Self {
        self.receive_buffer_size = Some(size);
        self
    }

    pub fn buffer_pool_size(mut self, size: usize) -> Self {
        self.buffer_pool_size = Some(size);
        self
    }

    pub fn build(self) -> EventLoopConfig {
        let default = EventLoopConfig::default();
        let (worker_min, worker_max) = self
            .worker_bounds
            .unwrap_or((default.worker_min, default.worker_max));
        EventLoopConfig {
            dispatchers: self.dispatchers.unwrap_or(default.dispatchers),
            worker_min,
            worker_max,
            worker_keep_alive: self.worker_keep_alive.unwrap_or(default.worker_keep_alive),
            worker_adjust_period: self
                .worker_adjust_period
                .unwrap_or(default.worker_adjust_period),
            events_capacity: self.events_capacity.unwrap_or(default.events_capacity),
            select_timeout: self.select_timeout.unwrap_or(default.select_timeout),
            sweep_interval: self.sweep_interval.unwrap_or(default.sweep_interval),
            spin_detection: self.spin_detection.unwrap_or(default.spin_detection),
            receive_buffer_size: self
                .receive_buffer_size
                .unwrap_or(default.receive_buffer_size),
            buffer_pool_size: self.buffer_pool_size.unwrap_or(default.buffer_pool_size),
        }
    }
}

/// Socket options applied to accepted and connected sockets.
#[derive(Debug, Clone)]
pub struct SocketOptions {
    pub send_buffer_size: Option<usize>,
    pub recv_buffer_size: Option<usize>,
    /// SO_REUSEADDR, applied to listening sockets.
    pub reuse_address: bool,
    /// IP_TOS / traffic class.
    pub traffic_class: Option<u32>,
    /// TCP_NODELAY
    pub no_delay: bool,
    /// SO_KEEPALIVE idle time
    pub keep_alive: Option<Duration>,
}

impl Default for SocketOptions {
    fn default() -> Self {
        Self {
            send_buffer_size: None,
            recv_buffer_size: None,
            reuse_address: true,
            traffic_class: None,
            no_delay: true,
            keep_alive: None,
        }
    }
}

impl SocketOptions {
    /// Applies the per-stream options to a connected socket.
    pub fn apply<S>(&self, stream: &S) -> io::Result<()>
    where
        for<'s> SockRef<'s>: From<&'s S>,
    {
        let sock = SockRef::from(stream);
        sock.set_nodelay(self.no_delay)?;
        if let Some(size) = self.send_buffer_size {
            sock.set_send_buffer_size(size)?;
        }
        if let Some(size) = self.recv_buffer_size {
            sock.set_recv_buffer_size(size)?;
        }
        if let Some(time) = self.keep_alive {
            sock.set_tcp_keepalive(&TcpKeepalive::new().with_time(time))?;
        }
        #[cfg(not(any(target_os = "fuchsia", target_os = "redox", target_os = "solaris", target_os = "illumos", windows)))]
        if let Some(tos) = self.traffic_class {
            // only meaningful for IPv4 sockets
            if let Ok(addr) = sock.local_addr() {
                if addr.is_ipv4() {
                    sock.set_tos(tos)?;
                }
            }
        }
        Ok(())
    }
}

/// How the acceptor picks a dispatcher for a new connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AssignmentStrategy {
    #[default]
    RoundRobin,
    LeastLoaded,
}

/// Per-connection behavior shared by servers and outbound connections.
#[derive(Debug, Clone)]
pub struct ConnectionOptions {
    /// Maximum lifetime of a connection.
    pub connection_timeout: Option<Duration>,
    /// Maximum silence before the connection is closed.
    pub idle_timeout: Option<Duration>,
    /// Flood-control limit for a single framing read.
    pub max_read_size: usize,
    /// Flush pending output before closing.
    pub flush_on_close: bool,
    /// Write as soon as data is queued. Off, output waits for an explicit
    /// `flush`.
    pub autoflush: bool,
    /// Upper bound on the flush performed by a graceful close.
    pub close_timeout: Duration,
    pub secure: Option<SecureContext>,
    /// Start in secure mode instead of waiting for `activate_secured_mode`.
    pub start_secured: bool,
}

impl Default for ConnectionOptions {
    fn default() -> Self {
        Self {
            connection_timeout: None,
            idle_timeout: None,
            max_read_size: DEFAULT_MAX_READ_SIZE,
            flush_on_close: true,
            autoflush: true,
            close_timeout: DEFAULT_CLOSE_TIMEOUT,
            secure: None,
            start_secured: false,
        }
    }
}

impl ConnectionOptions {
    fn validate(&self) -> Result<()> {
        if self.start_secured && self.secure.is_none() {
            return Err(Error::Configuration(
                "start_secured requires a secure context".into(),
            ));
        }
        if self.max_read_size == 0 {
            return Err(Error::Configuration(
                "max read size must be greater than zero".into(),
            ));
        }
        Ok(())
    }
}

/// Configuration of a listening [`Server`](crate::acceptor::Server).
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Address to bind to
    pub address: SocketAddr,
    /// Listen backlog
    pub backlog: i32,
    pub socket: SocketOptions,
    pub connection: ConnectionOptions,
    /// Maximum number of concurrently open connections
    pub max_connections: Option<usize>,
    /// Maximum number of connections a single dispatcher accepts from this server
    pub max_handles_per_dispatcher: Option<usize>,
    pub assignment: AssignmentStrategy,
}

impl ServerConfig {
    pub fn builder() -> ServerConfigBuilder {
        ServerConfigBuilder::new()
    }

    pub fn validate(&self) -> Result<()> {
        if self.backlog <= 0 {
            return Err(Error::Configuration("backlog must be positive".into()));
        }
        self.connection.validate()
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            address: SocketAddr::from(([127, 0, 0, 1], 0)),
            backlog: DEFAULT_BACKLOG,
            socket: SocketOptions::default(),
            connection: ConnectionOptions::default(),
            max_connections: None,
            max_handles_per_dispatcher: None,
            assignment: AssignmentStrategy::default(),
        }
    }
}

/// Builder for [`ServerConfig`].
///
/// All fields are optional and fall back to `ServerConfig::default()`.
#[derive(Default)]
pub struct ServerConfigBuilder {
    config: ServerConfig,
}

impl ServerConfigBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the address to bind to
    pub fn address(mut self, address: SocketAddr) -> Self {
        self.config.address = address;
        self
    }

    pub fn backlog(mut self, backlog: i32) -> Self {
        self.config.backlog = backlog;
        self
    }

    pub fn socket_options(mut self, socket: SocketOptions) -> Self {
        self.config.socket = socket;
        self
    }

    pub fn connection_timeout(mut self, timeout: Duration) -> Self {
        self.config.connection.connection_timeout = Some(timeout);
        self
    }

    pub fn idle_timeout(mut self, timeout: Duration) -> Self {
        self.config.connection.idle_timeout = Some(timeout);
        self
    }

    pub fn max_read_size(mut self, max: usize) -> Self {
        self.config.connection.max_read_size = max;
        self
    }

    pub fn flush_on_close(mut self, enabled: bool) -> Self {
        self.config.connection.flush_on_close = enabled;
        self
    }

    pub fn autoflush(mut self, enabled: bool) -> Self {
        self.config.connection.autoflush = enabled;
        self
    }

    /// Set the maximum number of connections
    pub fn max_connections(mut self, max: usize) -> Self {
        self.config.max_connections = Some(max);
        self
    }

    pub fn max_handles_per_dispatcher(mut self, max: usize) -> Self {
        self.config.max_handles_per_dispatcher = Some(max);
        self
    }

    pub fn assignment(mut self, strategy: AssignmentStrategy) -> Self {
        self.config.assignment = strategy;
        self
    }

    /// Make secure mode available on accepted connections.
    pub fn secure(mut self, context: SecureContext) -> Self {
        self.config.connection.secure = Some(context);
        self
    }

    pub fn start_secured(mut self, enabled: bool) -> Self {
        self.config.connection.start_secured = enabled;
        self
    }

    pub fn build(self) -> ServerConfig {
        self.config
    }
}

/// Configuration of an outbound connection.
#[derive(Debug, Clone)]
pub struct ConnectConfig {
    pub connect_timeout: Duration,
    pub socket: SocketOptions,
    pub connection: ConnectionOptions,
}

impl ConnectConfig {
    pub fn builder() -> ConnectConfigBuilder {
        ConnectConfigBuilder::default()
    }

    pub fn validate(&self) -> Result<()> {
        self.connection.validate()
    }
}

impl Default for ConnectConfig {
    fn default() -> Self {
        Self {
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            socket: SocketOptions::default(),
            connection: ConnectionOptions::default(),
        }
    }
}

/// Builder for [`ConnectConfig`].
#[derive(Default)]
pub struct ConnectConfigBuilder {
    config: ConnectConfig,
}

impl ConnectConfigBuilder {
    pub fn connect_timeout(mut self, timeout: Duration) -> Self {
        self.config.connect_timeout = timeout;
        self
    }

    pub fn socket_options(mut self, socket: SocketOptions) -> Self {
        self.config.socket = socket;
        self
    }

    pub fn connection_timeout(mut self, timeout: Duration) -> Self {
        self.config.connection.connection_timeout = Some(timeout);
        self
    }

    pub fn idle_timeout(mut self, timeout: Duration) -> Self {
        self.config.connection.idle_timeout = Some(timeout);
        self
    }

    pub fn max_read_size(mut self, max: usize) -> Self {
        self.config.connection.max_read_size = max;
        self
    }

    pub fn flush_on_close(mut self, enabled: bool) -> Self {
        self.config.connection.flush_on_close = enabled;
        self
    }

    pub fn autoflush(mut self, enabled: bool) -> Self {
        self.config.connection.autoflush = enabled;
        self
    }

    pub fn secure(mut self, context: SecureContext) -> Self {
        self.config.connection.secure = Some(context);
        self
    }

    pub fn start_secured(mut self, enabled: bool) -> Self {
        self.config.connection.start_secured = enabled;
        self
    }

    pub fn build(self) -> ConnectConfig {
        self.config
    }
}

/// Flow-control settings of a [`MultiplexedConnection`](crate::multiplexed::MultiplexedConnection).
#[derive(Debug, Clone)]
pub struct MultiplexConfig {
    /// DATA for a pipeline holding this many unread bytes is queued instead
    /// of delivered.
    pub high_water_mark: usize,
    /// Queued DATA is replayed once the pipeline is drained below this many
    /// bytes.
    pub low_water_mark: usize,
    /// Largest accepted frame payload. The physical max read size is raised
    /// to fit one frame.
    pub max_frame_size: usize,
    /// Physical receiving is suspended while more than this many bytes are
    /// queued across all pipelines.
    pub physical_limit: usize,
}

impl MultiplexConfig {
    pub fn validate(&self) -> Result<()> {
        if self.low_water_mark >= self.high_water_mark {
            return Err(Error::Configuration(format!(
                "low-water mark {} must be below high-water mark {}",
                self.low_water_mark, self.high_water_mark
            )));
        }
        if self.max_frame_size == 0 || self.max_frame_size > u32::MAX as usize {
            return Err(Error::Configuration(
                "max frame size must fit in a u32 and be non-zero".into(),
            ));
        }
        Ok(())
    }
}

impl Default for MultiplexConfig {
    fn default() -> Self {
        Self {
            high_water_mark: 256 * 1024,
            low_water_mark: 64 * 1024,
            max_frame_size: 1024 * 1024,
            physical_limit: 1024 * 1024,
        }
    }
}
