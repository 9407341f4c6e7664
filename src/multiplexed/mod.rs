//! Many logical pipelines over one physical connection.
//!
//! A [`MultiplexedConnection`] installs itself as the handler of a
//! [`NonBlockingConnection`] and demultiplexes the inbound byte stream into
//! [`Pipeline`]s:
//!
//! ```text
//!  physical inbound ──▶ [hdr|payload][hdr|payload]... ──demux──┬──▶ pipeline 1 inbound
//!                                                              ├──▶ pipeline 2 inbound
//!                                                              └──▶ pipeline N inbound
//!  pipeline.write() ──▶ DATA frames ──▶ physical outbound (one write per call)
//! ```
//!
//! DATA for a pipeline whose inbound buffer reached the high-water mark is
//! queued on that pipeline while the other pipelines keep receiving. Physical
//! receiving is suspended only while the queued bytes of all pipelines exceed
//! the physical limit. Reading a pipeline below the low-water mark replays its
//! queue.
//!
//! Pipeline callbacks ([`PipelineHandler`]) run on the worker pool, one at a
//! time per pipeline. Without a handler, remotely opened pipelines are handed
//! out by [`MultiplexedConnection::accept_pipeline`].

pub mod frame;
mod pipeline;

use std::{
    collections::VecDeque,
    sync::{
        atomic::{AtomicU32, AtomicUsize, Ordering},
        Arc,
    },
    time::{Duration, Instant},
};

use bytes::BytesMut;
use lockfree::map::Map as LockfreeMap;
use parking_lot::{Condvar, Mutex};
use tracing::{debug, trace, warn};

use crate::{
    config::MultiplexConfig,
    connection::{ConnectionId, ConnectionState, NonBlockingConnection},
    error::{DisconnectCause, Error, Result},
    handler::{Capabilities, Handler, NoopHandler},
    utils,
};
use frame::{FrameHeader, Opcode, HEADER_LEN};
use pipeline::PipelineEvent;

pub use pipeline::{BlockingPipeline, Pipeline, PipelineId, PipelineState};

/// Callbacks for pipelines of a multiplexed connection.
pub trait PipelineHandler: Send + Sync + 'static {
    /// A pipeline was opened by the peer.
    fn on_pipeline_open(&self, pipeline: &Pipeline) {
        let _ = pipeline;
    }

    /// New bytes are available on `pipeline`. Same contract as
    /// [`Handler::on_data`].
    fn on_pipeline_data(&self, pipeline: &Pipeline) -> Result<bool> {
        let _ = pipeline;
        Ok(true)
    }

    /// The pipeline is closed; buffered bytes are still readable.
    fn on_pipeline_close(&self, pipeline: &Pipeline) {
        let _ = pipeline;
    }
}

pub(crate) struct MuxShared {
    physical: NonBlockingConnection,
    pub(crate) config: MultiplexConfig,
    handler: Option<Arc<dyn PipelineHandler>>,
    pipelines: LockfreeMap<u32, Pipeline>,
    next_id: AtomicU32,
    incoming: Mutex<VecDeque<Pipeline>>,
    incoming_cond: Condvar,
    // bytes held back on blocked pipelines
    queued: AtomicUsize,
    // physical receiving suspended by back-pressure
    suspended: Mutex<bool>,
}

/// A physical connection carrying framed pipelines.
#[derive(Clone)]
pub struct MultiplexedConnection {
    pub(crate) inner: Arc<MuxShared>,
}

impl MultiplexedConnection {
    /// Takes over `physical`: replaces its handler and starts
    /// demultiplexing any bytes already buffered.
    ///
    /// ## Errors
    ///
    /// [`Error::Configuration`] for invalid flow-control settings,
    /// [`Error::Closed`] if `physical` is no longer open.
    pub fn new(
        physical: NonBlockingConnection,
        config: MultiplexConfig,
        handler: Option<Arc<dyn PipelineHandler>>,
    ) -> Result<Self> {
        config.validate()?;
        if !physical.is_open() {
            return Err(Error::Closed);
        }
        // the physical buffer must hold one complete frame
        let frame_limit = config.max_frame_size + HEADER_LEN;
        if physical.max_read_size() < frame_limit {
            debug!(
                id = %physical.id(),
                from = physical.max_read_size(),
                to = frame_limit,
                "raising max read size to the frame limit"
            );
            physical.set_max_read_size(frame_limit);
        }

        let first_id = if physical.is_server_side() { 2 } else { 1 };
        let inner = Arc::new(MuxShared {
            physical: physical.clone(),
            config,
            handler,
            pipelines: LockfreeMap::new(),
            next_id: AtomicU32::new(first_id),
            incoming: Mutex::new(VecDeque::new()),
            incoming_cond: Condvar::new(),
            queued: AtomicUsize::new(0),
            suspended: Mutex::new(false),
        });

        physical.set_handler(Arc::new(MuxHandler {
            mux: Arc::clone(&inner),
        }));
        if physical.state() == ConnectionState::Closed {
            inner.close_all();
            physical.set_handler(Arc::new(NoopHandler));
            return Err(Error::Closed);
        }
        physical.schedule_data();

        debug!(id = %physical.id(), "multiplexing enabled");
        Ok(Self { inner })
    }

    pub fn id(&self) -> ConnectionId {
        self.inner.physical.id()
    }

    pub fn physical(&self) -> &NonBlockingConnection {
        &self.inner.physical
    }

    pub fn is_open(&self) -> bool {
        self.inner.physical.is_open()
    }

    /// Opens a new pipeline and announces it to the peer.
    pub fn create_pipeline(&self) -> Result<Pipeline> {
        if !self.is_open() {
            return Err(Error::Closed);
        }
        let id = self.inner.next_id.fetch_add(2, Ordering::Relaxed);
        let pipeline = self.inner.new_pipeline(id);
        self.inner.pipelines.insert(id, pipeline.clone());

        if let Err(e) = self.inner.send_control(id, Opcode::Open) {
            self.inner.pipelines.remove(&id);
            pipeline.inner.mark_closed();
            return Err(e);
        }
        trace!(id = %self.id(), pipeline = id, "pipeline created");
        Ok(pipeline)
    }

    pub fn get_pipeline(&self, id: PipelineId) -> Option<Pipeline> {
        self.inner
            .pipelines
            .get(&id.as_u32())
            .map(|entry| entry.val().clone())
    }

    /// Ids of pipelines not fully closed yet, ascending.
    pub fn open_pipelines(&self) -> Vec<PipelineId> {
        let mut ids: Vec<PipelineId> = self
            .inner
            .pipelines
            .iter()
            .map(|entry| PipelineId(*entry.key()))
            .collect();
        ids.sort();
        ids
    }

    /// Waits for a pipeline opened by the peer. Only used when no
    /// [`PipelineHandler`] is installed.
    pub fn accept_pipeline(&self, timeout: Duration) -> Result<Pipeline> {
        let deadline = Instant::now() + timeout;
        let mut incoming = self.inner.incoming.lock();
        loop {
            if let Some(pipeline) = incoming.pop_front() {
                return Ok(pipeline);
            }
            if self.inner.physical.state() == ConnectionState::Closed {
                return Err(Error::Closed);
            }
            let Some(remaining) = utils::remaining(deadline) else {
                return Err(Error::Timeout);
            };
            self.inner.incoming_cond.wait_for(&mut incoming, remaining);
        }
    }

    /// Switches the physical connection to TLS; see
    /// [`NonBlockingConnection::activate_secured_mode`].
    pub fn activate_secured_mode(&self) -> Result<()> {
        self.inner.physical.activate_secured_mode()
    }

    pub fn deactivate_secured_mode(&self) -> Result<()> {
        self.inner.physical.deactivate_secured_mode()
    }

    /// Closes every pipeline, then the physical connection.
    pub fn close(&self) {
        for entry in self.inner.pipelines.iter() {
            entry.val().close();
        }
        self.inner.physical.close();
    }
}

impl std::fmt::Debug for MultiplexedConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MultiplexedConnection")
            .field("physical", &self.inner.physical)
            .field("pipelines", &self.open_pipelines())
            .finish()
    }
}

impl MuxShared {
    fn new_pipeline(self: &Arc<Self>, id: u32) -> Pipeline {
        Pipeline::new(
            PipelineId(id),
            Arc::downgrade(self),
            self.physical.max_read_size(),
        )
    }

    fn send_control(&self, id: u32, opcode: Opcode) -> Result<()> {
        let mut out = BytesMut::with_capacity(HEADER_LEN);
        frame::put_control(&mut out, id, opcode);
        self.physical.write(&out).map(|_| ())
    }

    pub(crate) fn send_data(&self, id: PipelineId, data: &[u8]) -> Result<()> {
        if data.is_empty() {
            return Ok(());
        }
        let mut out = BytesMut::new();
        frame::put_data(&mut out, id.as_u32(), data, self.config.max_frame_size);
        self.physical.write(&out).map(|_| ())
    }

    /// Local side of the close handshake; the pipeline is already
    /// half-closed.
    pub(crate) fn close_local(self: &Arc<Self>, pipeline: &Pipeline) {
        let id = pipeline.id().as_u32();
        if let Err(e) = self.send_control(id, Opcode::Close) {
            debug!(id = %self.physical.id(), pipeline = id, error = %e, "could not send CLOSE");
            self.release(pipeline, usize::MAX);
            if pipeline.inner.mark_closed() {
                self.pipelines.remove(&id);
                self.push_event(pipeline, PipelineEvent::Close);
            }
        }
    }

    /// The reader of `id` drained below the low-water mark.
    pub(crate) fn unblock(self: &Arc<Self>, id: PipelineId) {
        let Some(pipeline) = self
            .pipelines
            .get(&id.as_u32())
            .map(|entry| entry.val().clone())
        else {
            return;
        };
        trace!(id = %self.physical.id(), pipeline = %id, "pipeline drained, replaying");
        if self.release(&pipeline, self.config.high_water_mark) > 0 {
            self.push_event(&pipeline, PipelineEvent::Data);
        }
    }

    /// Replays queued DATA of `pipeline` up to `limit` inbound bytes.
    fn release(&self, pipeline: &Pipeline, limit: usize) -> usize {
        let released = pipeline.inner.replay(limit);
        if released > 0 {
            self.queued.fetch_sub(released, Ordering::AcqRel);
            if let Err(e) = self.apply_back_pressure() {
                debug!(id = %self.physical.id(), error = %e, "resume failed");
            }
        }
        released
    }

    /// Suspends or resumes physical receiving to match the queued total.
    fn apply_back_pressure(&self) -> Result<()> {
        let mut suspended = self.suspended.lock();
        let queued = self.queued.load(Ordering::Acquire);
        let over = queued > self.config.physical_limit;
        if over == *suspended {
            return Ok(());
        }
        if over {
            debug!(id = %self.physical.id(), queued, "suspending physical receive");
            self.physical.suspend_receiving()?;
        } else {
            debug!(id = %self.physical.id(), queued, "resuming physical receive");
            self.physical.resume_receiving()?;
        }
        *suspended = over;
        Ok(())
    }

    /// Routes every complete frame in the physical buffer.
    fn demux(self: &Arc<Self>) -> Result<bool> {
        loop {
            let header = match self
                .physical
                .read_with(|buf| FrameHeader::parse(buf.peek(HEADER_LEN)?))
            {
                Ok(header) => header,
                Err(e) if e.is_incomplete() => return Ok(true),
                Err(e) => return Err(e),
            };
            if header.length as usize > self.config.max_frame_size {
                return Err(Error::Protocol(format!(
                    "frame {} exceeds max frame size {}",
                    header, self.config.max_frame_size
                )));
            }
            if self.physical.available() < header.frame_len() {
                return Ok(true);
            }

            match header.opcode {
                Opcode::Data => {
                    let target = self
                        .pipelines
                        .get(&header.pipeline)
                        .map(|entry| entry.val().clone())
                        .filter(|p| p.state() != PipelineState::Closed);
                    let Some(pipeline) = target else {
                        self.physical.read_by_length(header.frame_len())?;
                        trace!(id = %self.physical.id(), %header, "dropping frame for unknown pipeline");
                        continue;
                    };
                    let frame = self.physical.read_by_length(header.frame_len())?;
                    let held = pipeline.inner.offer(
                        frame.slice(HEADER_LEN..),
                        self.config.high_water_mark,
                        &self.queued,
                    );
                    if !held {
                        self.push_event(&pipeline, PipelineEvent::Data);
                        continue;
                    }
                    trace!(id = %self.physical.id(), %header, "pipeline above high-water mark, frame queued");
                    self.apply_back_pressure()?;
                }
                Opcode::Open => {
                    self.physical.read_by_length(header.frame_len())?;
                    self.open_remote(header.pipeline);
                }
                Opcode::Close => {
                    self.physical.read_by_length(header.frame_len())?;
                    self.close_remote(header.pipeline);
                }
            }
        }
    }

    fn open_remote(self: &Arc<Self>, id: u32) {
        if self.pipelines.get(&id).is_some() {
            warn!(id = %self.physical.id(), pipeline = id, "OPEN for existing pipeline ignored");
            return;
        }
        let pipeline = self.new_pipeline(id);
        self.pipelines.insert(id, pipeline.clone());
        trace!(id = %self.physical.id(), pipeline = id, "pipeline opened by peer");

        if self.handler.is_some() {
            self.push_event(&pipeline, PipelineEvent::Open);
        } else {
            let mut incoming = self.incoming.lock();
            incoming.push_back(pipeline);
            self.incoming_cond.notify_all();
        }
    }

    fn close_remote(self: &Arc<Self>, id: u32) {
        let Some(removed) = self.pipelines.remove(&id) else {
            return;
        };
        let pipeline = removed.val().clone();
        if self.release(&pipeline, usize::MAX) > 0 {
            self.push_event(&pipeline, PipelineEvent::Data);
        }
        if let Some(answer) = pipeline.inner.remote_close() {
            if answer {
                if let Err(e) = self.send_control(id, Opcode::Close) {
                    debug!(id = %self.physical.id(), pipeline = id, error = %e, "could not answer CLOSE");
                }
            }
            trace!(id = %self.physical.id(), pipeline = id, "pipeline closed");
            self.push_event(&pipeline, PipelineEvent::Close);
        }
    }

    /// The physical connection is gone: every pipeline is closed.
    fn close_all(self: &Arc<Self>) {
        let ids: Vec<u32> = self.pipelines.iter().map(|entry| *entry.key()).collect();
        for id in ids {
            if let Some(removed) = self.pipelines.remove(&id) {
                let pipeline = removed.val().clone();
                if self.release(&pipeline, usize::MAX) > 0 {
                    self.push_event(&pipeline, PipelineEvent::Data);
                }
                if pipeline.inner.mark_closed() {
                    self.push_event(&pipeline, PipelineEvent::Close);
                }
            }
        }
        let _incoming = self.incoming.lock();
        self.incoming_cond.notify_all();
    }

    fn push_event(self: &Arc<Self>, pipeline: &Pipeline, event: PipelineEvent) {
        if self.handler.is_none() {
            return;
        }
        let is_data = matches!(event, PipelineEvent::Data);
        let start = pipeline
            .inner
            .events
            .push(event, |queued| is_data && matches!(queued, PipelineEvent::Data));
        if !start {
            return;
        }

        let mux = Arc::clone(self);
        let target = pipeline.clone();
        let pool = Arc::clone(self.physical.inner.pool());
        if pool.execute(move || mux.drain_events(&target)).is_err() {
            self.drain_events(pipeline);
        }
    }

    fn drain_events(&self, pipeline: &Pipeline) {
        let Some(handler) = self.handler.as_ref() else {
            return;
        };
        while let Some(event) = pipeline.inner.events.next() {
            match event {
                PipelineEvent::Open => handler.on_pipeline_open(pipeline),
                PipelineEvent::Data => self.run_on_data(handler.as_ref(), pipeline),
                PipelineEvent::Close => handler.on_pipeline_close(pipeline),
            }
        }
    }

    fn run_on_data(&self, handler: &dyn PipelineHandler, pipeline: &Pipeline) {
        loop {
            let before = pipeline.available();
            if before == 0 {
                return;
            }
            match handler.on_pipeline_data(pipeline) {
                Ok(true) => {
                    let after = pipeline.available();
                    if after == 0 || after >= before {
                        return;
                    }
                }
                Ok(false) => return,
                Err(e) if e.is_incomplete() => return,
                Err(Error::Closed) if pipeline.state() != PipelineState::Open => return,
                Err(e) => {
                    warn!(
                        id = %self.physical.id(),
                        pipeline = %pipeline.id(),
                        error = %e,
                        "pipeline handler failed, closing pipeline"
                    );
                    pipeline.close();
                    return;
                }
            }
        }
    }
}

/// Handler installed on the physical connection.
struct MuxHandler {
    mux: Arc<MuxShared>,
}

impl Handler for MuxHandler {
    fn capabilities(&self) -> Capabilities {
        Capabilities::DATA | Capabilities::DISCONNECT
    }

    fn on_data(&self, _conn: &NonBlockingConnection) -> Result<bool> {
        self.mux.demux()
    }

    fn on_disconnect(&self, conn: &NonBlockingConnection, cause: &DisconnectCause) {
        debug!(id = %conn.id(), %cause, "multiplexed connection closed");
        self.mux.close_all();
        // drops the handler's reference to the multiplexer
        conn.set_handler(Arc::new(NoopHandler));
    }
}

/// Server handler that turns every accepted connection into a
/// [`MultiplexedConnection`] served by one [`PipelineHandler`].
pub struct MultiplexedAdapter {
    config: MultiplexConfig,
    handler: Arc<dyn PipelineHandler>,
}

impl MultiplexedAdapter {
    pub fn new(handler: Arc<dyn PipelineHandler>) -> Self {
        Self::with_config(handler, MultiplexConfig::default())
    }

    pub fn with_config(handler: Arc<dyn PipelineHandler>, config: MultiplexConfig) -> Self {
        Self { config, handler }
    }
}

impl Handler for MultiplexedAdapter {
    fn capabilities(&self) -> Capabilities {
        Capabilities::CONNECT
    }

    fn on_connect(&self, conn: &NonBlockingConnection) -> Result<bool> {
        MultiplexedConnection::new(
            conn.clone(),
            self.config.clone(),
            Some(Arc::clone(&self.handler)),
        )?;
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{ConnectConfig, EventLoop, EventLoopConfig, ServerConfig};
    use std::sync::atomic::AtomicUsize;

    struct LineEcho {
        closed: AtomicUsize,
    }

    impl PipelineHandler for LineEcho {
        fn on_pipeline_data(&self, pipeline: &Pipeline) -> Result<bool> {
            let line = pipeline.read_by_delimiter(b"\n")?;
            pipeline.write(&line)?;
            pipeline.write(b"\n")?;
            Ok(true)
        }

        fn on_pipeline_close(&self, _pipeline: &Pipeline) {
            self.closed.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn event_loop() -> EventLoop {
        EventLoop::new(EventLoopConfig::builder().dispatchers(1).worker_pool(1, 4).build()).unwrap()
    }

    fn client_mux(event_loop: &EventLoop, addr: std::net::SocketAddr) -> MultiplexedConnection {
        let physical = event_loop
            .connect(addr, ConnectConfig::default(), Arc::new(NoopHandler))
            .unwrap();
        MultiplexedConnection::new(physical, MultiplexConfig::default(), None).unwrap()
    }

    #[test]
    fn test_pipeline_echo_and_close_handshake() {
        let event_loop = event_loop();
        let echo = Arc::new(LineEcho {
            closed: AtomicUsize::new(0),
        });
        let server = event_loop
            .listen(
                ServerConfig::builder()
                    .address("127.0.0.1:0".parse().unwrap())
                    .build(),
                Arc::new(MultiplexedAdapter::new(echo.clone())),
            )
            .unwrap();

        let mux = client_mux(&event_loop, server.local_addr());
        let pipeline = mux.create_pipeline().unwrap();
        assert_eq!(pipeline.id().as_u32() % 2, 1);

        let reader = BlockingPipeline::new(pipeline.clone());
        pipeline.write(b"one\n").unwrap();
        assert_eq!(reader.read_string_by_delimiter(b"\n").unwrap(), "one");

        pipeline.close();
        let deadline = Instant::now() + Duration::from_secs(5);
        while pipeline.state() != PipelineState::Closed && Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(10));
        }
        assert_eq!(pipeline.state(), PipelineState::Closed);
        assert!(mux.open_pipelines().is_empty());
        while echo.closed.load(Ordering::SeqCst) == 0 && Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(10));
        }
        assert_eq!(echo.closed.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_accept_pipeline_without_handler() {
        let event_loop = event_loop();
        let (tx, rx) = std::sync::mpsc::channel();

        struct Accepting(Mutex<Option<std::sync::mpsc::Sender<MultiplexedConnection>>>);
        impl Handler for Accepting {
            fn on_connect(&self, conn: &NonBlockingConnection) -> Result<bool> {
                let mux = MultiplexedConnection::new(conn.clone(), MultiplexConfig::default(), None)?;
                if let Some(tx) = self.0.lock().take() {
                    let _ = tx.send(mux);
                }
                Ok(true)
            }
        }

        let server = event_loop
            .listen(
                ServerConfig::builder()
                    .address("127.0.0.1:0".parse().unwrap())
                    .build(),
                Arc::new(Accepting(Mutex::new(Some(tx)))),
            )
            .unwrap();
        let client = client_mux(&event_loop, server.local_addr());
        let server_side = rx.recv_timeout(Duration::from_secs(5)).unwrap();

        let outgoing = client.create_pipeline().unwrap();
        outgoing.write(b"payload").unwrap();

        let incoming = server_side.accept_pipeline(Duration::from_secs(5)).unwrap();
        assert_eq!(incoming.id(), outgoing.id());
        let blocking = BlockingPipeline::new(incoming);
        assert_eq!(&blocking.read_by_length(7).unwrap()[..], b"payload");

        assert!(matches!(
            server_side.accept_pipeline(Duration::from_millis(20)),
            Err(Error::Timeout)
        ));

        let mine = server_side.create_pipeline().unwrap();
        assert_eq!(mine.id().as_u32() % 2, 0);
    }

    #[test]
    fn test_oversized_frame_closes_physical() {
        let event_loop = event_loop();
        let (tx, rx) = std::sync::mpsc::channel();

        struct Capture(Mutex<Option<std::sync::mpsc::Sender<MultiplexedConnection>>>);
        impl Handler for Capture {
            fn on_connect(&self, conn: &NonBlockingConnection) -> Result<bool> {
                let config = MultiplexConfig {
                    max_frame_size: 16,
                    ..MultiplexConfig::default()
                };
                let mux = MultiplexedConnection::new(conn.clone(), config, None)?;
                if let Some(tx) = self.0.lock().take() {
                    let _ = tx.send(mux);
                }
                Ok(true)
            }
        }

        let server = event_loop
            .listen(
                ServerConfig::builder()
                    .address("127.0.0.1:0".parse().unwrap())
                    .build(),
                Arc::new(Capture(Mutex::new(Some(tx)))),
            )
            .unwrap();
        let client = client_mux(&event_loop, server.local_addr());
        let server_side = rx.recv_timeout(Duration::from_secs(5)).unwrap();

        let pipeline = client.create_pipeline().unwrap();
        pipeline.write(&[0u8; 64]).unwrap();

        let deadline = Instant::now() + Duration::from_secs(5);
        while server_side.physical().state() != ConnectionState::Closed && Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(10));
        }
        assert_eq!(server_side.physical().state(), ConnectionState::Closed);
    }
}
