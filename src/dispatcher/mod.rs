//! Reactor threads.
//!
//! Each [`Dispatcher`] runs one mio selection loop on its own thread and owns
//! the sockets registered with it. Other threads never touch its registration
//! set; they send [`Command`]s through a channel and wake the selector:
//!
//! ```text
//!  acceptor / connect ──Register──┐
//!  write()           ──Flush──────┤   ┌──────────────────────────────────┐
//!  suspend/resume    ──Read*──────┼──▶│ loop {                           │
//!  close()           ──Close──────┘   │   select(timeout)                │
//!                                     │   readable → read into inbound   │
//!                                     │   writable → flush outbound      │
//!                                     │   apply queued commands          │
//!                                     │   sweep timeouts (periodically)  │
//!                                     │   spin check                     │
//!                                     │ }                                │
//!                                     └──────────────────────────────────┘
//! ```
//!
//! Handler callbacks are never run on a dispatcher thread; the dispatcher
//! queues them on the connection, which hands them to the worker pool.
//! Failures of one connection close that connection only.

mod monitor;

use std::{
    collections::HashMap,
    io::{self, Read},
    net::Shutdown,
    sync::{
        atomic::{AtomicU64, AtomicUsize, Ordering},
        mpsc::{self, Receiver, Sender},
        Arc,
    },
    thread::{self, Builder, JoinHandle},
    time::{Duration, Instant},
};

use arc_swap::ArcSwap;
use mio::{net::TcpStream, Events, Interest, Poll, Token, Waker};
use tracing::{debug, error, info, trace, warn};

use crate::{
    config::EventLoopConfig,
    connection::{
        shared::{ConnectionShared, TimeoutKind},
        ConnectionState,
    },
    error::{DisconnectCause, Error, Result},
    object_pool::ObjectPool,
};
use monitor::{SpinMonitor, Verdict};

const WAKER_TOKEN: Token = Token(0);

/// Requests applied on the dispatcher thread.
pub(crate) enum Command {
    Register {
        stream: TcpStream,
        conn: Arc<ConnectionShared>,
    },
    Flush(Token),
    SuspendRead(Token),
    ResumeRead(Token),
    Close(Token),
    Shutdown,
    #[cfg(test)]
    Reinit,
}

#[derive(Default)]
struct Counters {
    handles: AtomicUsize,
    reads: AtomicU64,
    writes: AtomicU64,
    bytes_received: AtomicU64,
    bytes_sent: AtomicU64,
    idle_timeouts: AtomicU64,
    connection_timeouts: AtomicU64,
    spin_detections: AtomicU64,
    reinits: AtomicU64,
}

/// Point-in-time counters of one dispatcher.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DispatcherStats {
    pub name: String,
    /// Connections registered or reserved.
    pub handles: usize,
    pub reads: u64,
    pub writes: u64,
    pub bytes_received: u64,
    pub bytes_sent: u64,
    pub idle_timeouts: u64,
    pub connection_timeouts: u64,
    pub spin_detections: u64,
    pub reinits: u64,
}

/// Cross-thread handle to a dispatcher.
#[derive(Clone)]
pub(crate) struct DispatcherHandle {
    name: Arc<str>,
    sender: Sender<Command>,
    waker: Arc<ArcSwap<Waker>>,
    counters: Arc<Counters>,
}

impl DispatcherHandle {
    pub(crate) fn send(&self, command: Command) -> Result<()> {
        self.sender
            .send(command)
            .map_err(|_| Error::EventLoopGone)?;
        self.waker.load().wake()?;
        Ok(())
    }

    pub(crate) fn name(&self) -> &str {
        &self.name
    }

    pub(crate) fn handles(&self) -> usize {
        self.counters.handles.load(Ordering::Acquire)
    }

    /// Reserves a slot for a new connection unless `max` slots are taken.
    pub(crate) fn try_reserve(&self, max: Option<usize>) -> bool {
        let limit = max.unwrap_or(usize::MAX);
        self.counters
            .handles
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| (n < limit).then_some(n + 1))
            .is_ok()
    }

    /// Gives back a slot whose connection was never registered.
    pub(crate) fn release(&self) {
        self.counters.handles.fetch_sub(1, Ordering::AcqRel);
    }

    pub(crate) fn stats(&self) -> DispatcherStats {
        let c = &self.counters;
        DispatcherStats {
            name: self.name.to_string(),
            handles: c.handles.load(Ordering::Acquire),
            reads: c.reads.load(Ordering::Relaxed),
            writes: c.writes.load(Ordering::Relaxed),
            bytes_received: c.bytes_received.load(Ordering::Relaxed),
            bytes_sent: c.bytes_sent.load(Ordering::Relaxed),
            idle_timeouts: c.idle_timeouts.load(Ordering::Relaxed),
            connection_timeouts: c.connection_timeouts.load(Ordering::Relaxed),
            spin_detections: c.spin_detections.load(Ordering::Relaxed),
            reinits: c.reinits.load(Ordering::Relaxed),
        }
    }
}

struct Entry {
    stream: TcpStream,
    conn: Arc<ConnectionShared>,
    interest: Option<Interest>,
    // set once a graceful close is waiting for output to drain
    close_deadline: Option<Instant>,
}

enum ReadOutcome {
    Open,
    Eof,
    Failed(Error),
}

#[derive(Clone, Copy)]
struct Readiness {
    token: Token,
    readable: bool,
    writable: bool,
    error: bool,
}

pub(crate) struct Dispatcher {
    name: Arc<str>,
    poll: Poll,
    events: Events,
    ready: Vec<Readiness>,
    waker: Arc<ArcSwap<Waker>>,
    commands: Receiver<Command>,
    entries: HashMap<Token, Entry>,
    buffers: ObjectPool<Vec<u8>>,
    counters: Arc<Counters>,
    select_timeout: Duration,
    sweep_interval: Duration,
    monitor: SpinMonitor,
    last_sweep: Instant,
    running: bool,
}

impl Dispatcher {
    /// Starts dispatcher number `index` on its own thread.
    pub(crate) fn spawn(
        index: usize,
        config: &EventLoopConfig,
        buffers: ObjectPool<Vec<u8>>,
    ) -> Result<(DispatcherHandle, JoinHandle<()>)> {
        let poll = Poll::new()?;
        let waker = Arc::new(ArcSwap::from_pointee(Waker::new(poll.registry(), WAKER_TOKEN)?));
        let (sender, commands) = mpsc::channel();
        let counters = Arc::new(Counters::default());
        let name: Arc<str> = Arc::from(format!("millstream-dispatcher-{}", index));

        let dispatcher = Dispatcher {
            name: Arc::clone(&name),
            poll,
            events: Events::with_capacity(config.events_capacity),
            ready: Vec::with_capacity(config.events_capacity),
            waker: Arc::clone(&waker),
            commands,
            entries: HashMap::new(),
            buffers,
            counters: Arc::clone(&counters),
            select_timeout: config.select_timeout,
            sweep_interval: config.sweep_interval,
            monitor: SpinMonitor::new(config.spin_detection.clone()),
            last_sweep: Instant::now(),
            running: true,
        };

        let thread = Builder::new()
            .name(name.to_string())
            .spawn(move || dispatcher.run())?;

        let handle = DispatcherHandle {
            name,
            sender,
            waker,
            counters,
        };
        Ok((handle, thread))
    }

    fn run(mut self) {
        debug!(dispatcher = %self.name, "dispatcher started");

        while self.running {
            let timeout = self
                .select_timeout
                .min(self.sweep_interval.saturating_sub(self.last_sweep.elapsed()));
            let started = Instant::now();

            if let Err(e) = self.poll.poll(&mut self.events, Some(timeout)) {
                if e.kind() == io::ErrorKind::Interrupted {
                    continue;
                }
                error!(dispatcher = %self.name, error = %e, "select failed, rebuilding selector");
                self.reinit();
                thread::sleep(self.monitor.backoff());
                continue;
            }
            let elapsed = started.elapsed();

            self.ready.clear();
            self.ready.extend(self.events.iter().map(|event| Readiness {
                token: event.token(),
                readable: event.is_readable() || event.is_read_closed(),
                writable: event.is_writable() || event.is_write_closed(),
                error: event.is_error(),
            }));

            let mut handled = 0;
            for i in 0..self.ready.len() {
                let readiness = self.ready[i];
                handled += 1;
                if readiness.token != WAKER_TOKEN {
                    self.handle_ready(readiness);
                }
            }
            handled += self.process_commands();

            if self.last_sweep.elapsed() >= self.sweep_interval {
                self.sweep();
            }

            if let Verdict::Spinning { reinit } = self.monitor.record(handled, elapsed, timeout) {
                self.counters.spin_detections.fetch_add(1, Ordering::Relaxed);
                warn!(
                    dispatcher = %self.name,
                    reinit,
                    "selector keeps returning without events"
                );
                if reinit {
                    self.reinit();
                }
                thread::sleep(self.monitor.backoff());
            }
        }

        self.close_all();
        debug!(dispatcher = %self.name, "dispatcher stopped");
    }

    fn handle_ready(&mut self, readiness: Readiness) {
        let token = readiness.token;
        if readiness.error {
            let cause = match self.entries.get(&token).map(|e| e.stream.take_error()) {
                Some(Ok(Some(e))) | Some(Err(e)) => e,
                Some(Ok(None)) => io::Error::from(io::ErrorKind::ConnectionReset),
                None => return,
            };
            debug!(dispatcher = %self.name, ?token, error = %cause, "socket error");
            self.finalize(token, DisconnectCause::from(Error::Io(cause)));
            return;
        }
        if readiness.readable {
            self.read(token);
        }
        if readiness.writable {
            self.flush(token);
        }
    }

    fn read(&mut self, token: Token) {
        let Some(entry) = self.entries.get_mut(&token) else {
            return;
        };
        if entry.conn.is_receive_suspended() || entry.close_deadline.is_some() {
            return;
        }

        let mut buffer = self.buffers.acquire();
        let mut received = 0;
        let mut appended = 0;
        let outcome = loop {
            match entry.stream.read(&mut buffer[..]) {
                Ok(0) => break ReadOutcome::Eof,
                Ok(n) => {
                    received += n;
                    match entry.conn.receive(&buffer[..n]) {
                        Ok(count) => appended += count,
                        Err(e) => break ReadOutcome::Failed(e),
                    }
                    if entry.conn.is_receive_suspended() {
                        break ReadOutcome::Open;
                    }
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break ReadOutcome::Open,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => break ReadOutcome::Failed(e.into()),
            }
        };
        drop(buffer);

        let conn = Arc::clone(&entry.conn);
        if received > 0 {
            self.counters.reads.fetch_add(1, Ordering::Relaxed);
            self.counters
                .bytes_received
                .fetch_add(received as u64, Ordering::Relaxed);
            trace!(dispatcher = %self.name, id = %conn.id, received, "read");
        }
        if appended > 0 {
            conn.schedule_data();
        }
        if conn.flush_after_read() {
            // handshake records or alerts produced by the read
            self.flush(token);
        }

        match outcome {
            ReadOutcome::Open => {}
            ReadOutcome::Eof => self.finalize(token, DisconnectCause::PeerClosed),
            ReadOutcome::Failed(e) => {
                debug!(dispatcher = %self.name, id = %conn.id, error = %e, "read failed");
                self.finalize(token, DisconnectCause::from(e));
            }
        }
    }

    fn flush(&mut self, token: Token) {
        let Some(entry) = self.entries.get_mut(&token) else {
            return;
        };
        match entry.conn.write_to(&mut entry.stream) {
            Ok((written, drained)) => {
                if written > 0 {
                    self.counters.writes.fetch_add(1, Ordering::Relaxed);
                    self.counters
                        .bytes_sent
                        .fetch_add(written as u64, Ordering::Relaxed);
                    trace!(dispatcher = %self.name, id = %entry.conn.id, written, drained, "write");
                }
                if drained && entry.close_deadline.is_some() {
                    self.finalize(token, DisconnectCause::Closed);
                } else {
                    self.update_interest(token);
                }
            }
            Err(e) => {
                debug!(dispatcher = %self.name, id = %entry.conn.id, error = %e, "write failed");
                self.finalize(token, DisconnectCause::from(Error::Io(e)));
            }
        }
    }

    /// Brings the registered interest in line with the connection: read
    /// unless suspended or closing, write while output is queued.
    fn update_interest(&mut self, token: Token) {
        let Some(entry) = self.entries.get_mut(&token) else {
            return;
        };
        let read = !entry.conn.is_receive_suspended() && entry.close_deadline.is_none();
        let write = entry.conn.has_pending_output();
        let desired = match (read, write) {
            (true, true) => Some(Interest::READABLE | Interest::WRITABLE),
            (true, false) => Some(Interest::READABLE),
            (false, true) => Some(Interest::WRITABLE),
            (false, false) => None,
        };
        if desired == entry.interest {
            return;
        }

        let registry = self.poll.registry();
        let result = match (entry.interest, desired) {
            (None, Some(interest)) => registry.register(&mut entry.stream, token, interest),
            (Some(_), Some(interest)) => registry.reregister(&mut entry.stream, token, interest),
            (Some(_), None) => registry.deregister(&mut entry.stream),
            (None, None) => Ok(()),
        };
        match result {
            Ok(()) => entry.interest = desired,
            Err(e) => {
                error!(dispatcher = %self.name, id = %entry.conn.id, error = %e, "failed to update interest");
                self.finalize(token, DisconnectCause::from(Error::Io(e)));
            }
        }
    }

    fn process_commands(&mut self) -> usize {
        let mut processed = 0;
        while let Ok(command) = self.commands.try_recv() {
            processed += 1;
            match command {
                Command::Register { stream, conn } => self.register(stream, conn),
                Command::Flush(token) => {
                    if let Some(entry) = self.entries.get(&token) {
                        entry.conn.take_flush_request();
                        self.flush(token);
                    }
                }
                Command::SuspendRead(token) => self.update_interest(token),
                Command::ResumeRead(token) => {
                    self.update_interest(token);
                    // the readiness edge may have been consumed while suspended
                    self.read(token);
                }
                Command::Close(token) => self.close(token),
                Command::Shutdown => {
                    info!(dispatcher = %self.name, "dispatcher shutting down");
                    self.running = false;
                }
                #[cfg(test)]
                Command::Reinit => self.reinit(),
            }
        }
        processed
    }

    fn register(&mut self, stream: TcpStream, conn: Arc<ConnectionShared>) {
        let token = conn.token;
        if conn.state() >= ConnectionState::Closing {
            self.counters.handles.fetch_sub(1, Ordering::AcqRel);
            conn.mark_closed(DisconnectCause::Closed);
            return;
        }

        debug!(
            dispatcher = %self.name,
            id = %conn.id,
            peer = %conn.peer_addr,
            "connection registered"
        );
        self.entries.insert(
            token,
            Entry {
                stream,
                conn: Arc::clone(&conn),
                interest: None,
                close_deadline: None,
            },
        );
        conn.set_open();
        self.update_interest(token);
        if self.entries.contains_key(&token) {
            conn.schedule_connect();
            if conn.has_pending_output() {
                self.flush(token);
            }
        }
    }

    fn close(&mut self, token: Token) {
        let Some(entry) = self.entries.get_mut(&token) else {
            return;
        };
        if entry.close_deadline.is_some() {
            return;
        }
        if entry.conn.wants_graceful_close() && entry.conn.has_pending_output() {
            entry.close_deadline = Some(Instant::now() + entry.conn.close_timeout);
            self.flush(token);
        } else {
            self.finalize(token, DisconnectCause::Closed);
        }
    }

    /// Deregisters and closes the socket, then marks the connection closed.
    fn finalize(&mut self, token: Token, cause: DisconnectCause) {
        let Some(mut entry) = self.entries.remove(&token) else {
            return;
        };
        if entry.interest.is_some() {
            let _ = self.poll.registry().deregister(&mut entry.stream);
        }
        let _ = entry.stream.shutdown(Shutdown::Both);
        drop(entry.stream);

        self.counters.handles.fetch_sub(1, Ordering::AcqRel);
        entry.conn.mark_closed(cause);
    }

    fn sweep(&mut self) {
        let now = Instant::now();
        self.last_sweep = now;

        let mut abandoned = Vec::new();
        for (token, entry) in &self.entries {
            if let Some(deadline) = entry.close_deadline {
                if now >= deadline {
                    abandoned.push(*token);
                }
                continue;
            }
            if let Some(kind) = entry.conn.expired_timeout(now) {
                let counter = match kind {
                    TimeoutKind::Idle => &self.counters.idle_timeouts,
                    TimeoutKind::Connection => &self.counters.connection_timeouts,
                };
                counter.fetch_add(1, Ordering::Relaxed);
                entry.conn.on_timeout(kind);
            }
        }

        for token in abandoned {
            warn!(dispatcher = %self.name, ?token, "close timeout elapsed, dropping unsent output");
            self.finalize(token, DisconnectCause::Closed);
        }
    }

    /// Replaces the selector and moves every registration to it.
    fn reinit(&mut self) {
        let poll = match Poll::new() {
            Ok(poll) => poll,
            Err(e) => {
                error!(dispatcher = %self.name, error = %e, "could not create selector");
                return;
            }
        };
        let waker = match Waker::new(poll.registry(), WAKER_TOKEN) {
            Ok(waker) => waker,
            Err(e) => {
                error!(dispatcher = %self.name, error = %e, "could not create waker");
                return;
            }
        };

        let mut failed = Vec::new();
        for (token, entry) in self.entries.iter_mut() {
            if let Some(interest) = entry.interest {
                let _ = self.poll.registry().deregister(&mut entry.stream);
                if let Err(e) = poll.registry().register(&mut entry.stream, *token, interest) {
                    warn!(dispatcher = %self.name, id = %entry.conn.id, error = %e, "re-registration failed");
                    entry.interest = None;
                    failed.push((*token, e));
                }
            }
        }

        self.poll = poll;
        self.waker.store(Arc::new(waker));
        self.counters.reinits.fetch_add(1, Ordering::Relaxed);
        warn!(
            dispatcher = %self.name,
            registered = self.entries.len(),
            "selector reinitialized"
        );

        for (token, e) in failed {
            self.finalize(token, DisconnectCause::from(Error::Io(e)));
        }
    }

    fn close_all(&mut self) {
        // connections handed over after the shutdown command
        while let Ok(command) = self.commands.try_recv() {
            if let Command::Register { conn, .. } = command {
                self.counters.handles.fetch_sub(1, Ordering::AcqRel);
                conn.mark_closed(DisconnectCause::Shutdown);
            }
        }

        let tokens: Vec<Token> = self.entries.keys().copied().collect();
        for token in tokens {
            if let Some(entry) = self.entries.get_mut(&token) {
                // best effort; the socket may not take everything
                let _ = entry.conn.write_to(&mut entry.stream);
            }
            self.finalize(token, DisconnectCause::Shutdown);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{handler::Handler, EventLoop, NonBlockingConnection, ServerConfig};
    use std::io::{Read, Write};

    struct LineEcho;

    impl Handler for LineEcho {
        fn on_data(&self, conn: &NonBlockingConnection) -> Result<bool> {
            let line = conn.read_by_delimiter(b"\n")?;
            conn.write(&line)?;
            conn.write(b"\n")?;
            Ok(true)
        }
    }

    fn round_trip(client: &mut std::net::TcpStream, line: &[u8]) -> Vec<u8> {
        client.write_all(line).unwrap();
        let mut buf = vec![0u8; line.len()];
        client.read_exact(&mut buf).unwrap();
        buf
    }

    #[test]
    fn test_reinit_keeps_registered_connections() {
        let event_loop = EventLoop::new(
            EventLoopConfig::builder()
                .dispatchers(1)
                .worker_pool(1, 4)
                .build(),
        )
        .unwrap();
        let server = event_loop
            .listen(
                ServerConfig::builder()
                    .address("127.0.0.1:0".parse().unwrap())
                    .build(),
                Arc::new(LineEcho),
            )
            .unwrap();

        let mut client = std::net::TcpStream::connect(server.local_addr()).unwrap();
        client
            .set_read_timeout(Some(Duration::from_secs(5)))
            .unwrap();
        assert_eq!(round_trip(&mut client, b"before\n"), b"before\n");

        let dispatcher = &event_loop.core.dispatchers[0];
        dispatcher.send(Command::Reinit).unwrap();
        let deadline = Instant::now() + Duration::from_secs(5);
        while dispatcher.stats().reinits == 0 && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(5));
        }
        assert_eq!(dispatcher.stats().reinits, 1);
        assert_eq!(dispatcher.stats().handles, 1);

        // served through the new selector and woken through the new waker
        assert_eq!(round_trip(&mut client, b"after\n"), b"after\n");
        assert_eq!(round_trip(&mut client, b"again\n"), b"again\n");
    }
}
