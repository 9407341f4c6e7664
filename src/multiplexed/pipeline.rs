use std::{
    collections::VecDeque,
    fmt,
    sync::{
        atomic::{AtomicBool, AtomicU8, AtomicUsize, Ordering},
        Arc, Weak,
    },
    time::{Duration, Instant},
};

use bytes::Bytes;
use parking_lot::{Condvar, Mutex};

use super::{MultiplexedConnection, MuxShared};
use crate::{
    error::{Error, Result},
    framing::FramingBuffer,
    utils,
    worker_pool::SerialExecutor,
};

/// Identifier of a pipeline within one multiplexed connection.
///
/// Ids allocated by the accepting side are even, ids allocated by the
/// connecting side odd.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PipelineId(pub u32);

impl PipelineId {
    pub fn as_u32(&self) -> u32 {
        self.0
    }
}

impl fmt::Display for PipelineId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "pipeline-{}", self.0)
    }
}

/// `Open` → (local close) → `HalfClosed` → (peer's CLOSE) → `Closed`, or
/// `Open` → (peer's CLOSE, answered) → `Closed`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
#[repr(u8)]
pub enum PipelineState {
    Open = 0,
    HalfClosed = 1,
    Closed = 2,
}

impl PipelineState {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => PipelineState::Open,
            1 => PipelineState::HalfClosed,
            _ => PipelineState::Closed,
        }
    }
}

pub(crate) enum PipelineEvent {
    Open,
    Data,
    Close,
}

pub(crate) struct PipelineShared {
    pub(crate) id: PipelineId,
    mux: Weak<MuxShared>,
    state: AtomicU8,
    inbound: Mutex<FramingBuffer>,
    /// Signalled on delivery, replay and close, always with `inbound` held.
    cond: Condvar,
    /// DATA payloads held back while the inbound buffer is above the
    /// high-water mark, in arrival order. Locked before `inbound`.
    pending: Mutex<VecDeque<Bytes>>,
    /// Set while `pending` is non-empty.
    blocked: AtomicBool,
    pub(crate) events: SerialExecutor<PipelineEvent>,
}

impl PipelineShared {
    pub(crate) fn state(&self) -> PipelineState {
        PipelineState::from_u8(self.state.load(Ordering::Acquire))
    }

    pub(crate) fn available(&self) -> usize {
        self.inbound.lock().available()
    }

    /// Delivers `payload`, or queues it behind earlier held-back payloads
    /// once the inbound buffer reached `high_water_mark`. Queued bytes are
    /// added to `queued` before they can be replayed. Returns whether the
    /// payload was queued.
    pub(crate) fn offer(&self, payload: Bytes, high_water_mark: usize, queued: &AtomicUsize) -> bool {
        if payload.is_empty() {
            return false;
        }
        let mut pending = self.pending.lock();
        if pending.is_empty() {
            let mut inbound = self.inbound.lock();
            if inbound.available() < high_water_mark {
                inbound.append(&payload);
                self.cond.notify_all();
                return false;
            }
            self.blocked.store(true, Ordering::Release);
        }
        queued.fetch_add(payload.len(), Ordering::AcqRel);
        pending.push_back(payload);
        true
    }

    /// Moves held-back payloads into the inbound buffer until it reaches
    /// `limit`. Returns the number of bytes moved.
    pub(crate) fn replay(&self, limit: usize) -> usize {
        let mut pending = self.pending.lock();
        let mut inbound = self.inbound.lock();
        let mut released = 0;
        while inbound.available() < limit {
            let Some(payload) = pending.pop_front() else {
                break;
            };
            released += payload.len();
            inbound.append(&payload);
        }
        self.blocked.store(!pending.is_empty(), Ordering::Release);
        if released > 0 {
            self.cond.notify_all();
        }
        released
    }

    #[cfg(test)]
    fn pending(&self) -> usize {
        self.pending.lock().iter().map(Bytes::len).sum()
    }

    /// Open → HalfClosed. Returns whether this call made the transition.
    pub(crate) fn begin_close(&self) -> bool {
        self.state
            .compare_exchange(
                PipelineState::Open as u8,
                PipelineState::HalfClosed as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_ok()
    }

    /// Applies a CLOSE frame from the peer. `Some(true)` means the close must
    /// be answered, `None` that the pipeline was already closed.
    pub(crate) fn remote_close(&self) -> Option<bool> {
        let previous = PipelineState::from_u8(
            self.state
                .swap(PipelineState::Closed as u8, Ordering::AcqRel),
        );
        let answer = match previous {
            PipelineState::Open => Some(true),
            PipelineState::HalfClosed => Some(false),
            PipelineState::Closed => None,
        };
        if answer.is_some() {
            self.notify();
        }
        answer
    }

    /// Moves to Closed without any handshake. Returns whether the state
    /// changed.
    pub(crate) fn mark_closed(&self) -> bool {
        let previous = self
            .state
            .swap(PipelineState::Closed as u8, Ordering::AcqRel);
        let changed = previous != PipelineState::Closed as u8;
        if changed {
            self.notify();
        }
        changed
    }

    fn notify(&self) {
        let _inbound = self.inbound.lock();
        self.cond.notify_all();
    }

    /// Replays held-back payloads once the reader drained below the
    /// low-water mark.
    fn after_read(&self, remaining: usize) {
        if !self.blocked.load(Ordering::Acquire) {
            return;
        }
        let Some(mux) = self.mux.upgrade() else {
            return;
        };
        if remaining < mux.config.low_water_mark && self.blocked.swap(false, Ordering::AcqRel) {
            mux.unblock(self.id);
        }
    }
}

/// A logical stream inside a [`MultiplexedConnection`].
///
/// Reads follow the same contract as
/// [`NonBlockingConnection`](crate::NonBlockingConnection) reads; writes are
/// framed and queued on the physical connection.
#[derive(Clone)]
pub struct Pipeline {
    pub(crate) inner: Arc<PipelineShared>,
}

impl Pipeline {
    pub(crate) fn new(id: PipelineId, mux: Weak<MuxShared>, max_read_size: usize) -> Self {
        Pipeline {
            inner: Arc::new(PipelineShared {
                id,
                mux,
                state: AtomicU8::new(PipelineState::Open as u8),
                inbound: Mutex::new(FramingBuffer::new(max_read_size)),
                cond: Condvar::new(),
                pending: Mutex::new(VecDeque::new()),
                blocked: AtomicBool::new(false),
                events: SerialExecutor::new(),
            }),
        }
    }

    pub fn id(&self) -> PipelineId {
        self.inner.id
    }

    pub fn state(&self) -> PipelineState {
        self.inner.state()
    }

    /// True until either side closes the pipeline.
    pub fn is_open(&self) -> bool {
        self.state() == PipelineState::Open
    }

    pub fn available(&self) -> usize {
        self.inner.available()
    }

    /// The owning multiplexed connection, while it is alive.
    pub fn connection(&self) -> Option<MultiplexedConnection> {
        self.inner
            .mux
            .upgrade()
            .map(|inner| MultiplexedConnection { inner })
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

    /// Everything buffered; empty if nothing arrived yet.
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

    fn read_with<T>(&self, f: impl FnOnce(&mut FramingBuffer) -> Result<T>) -> Result<T> {
        let (result, remaining) = {
            let mut inbound = self.inner.inbound.lock();
            let result = f(&mut inbound);
            (result, inbound.available())
        };
        if result.is_ok() {
            self.inner.after_read(remaining);
        }
        match result {
            Err(Error::Incomplete) if self.state() == PipelineState::Closed => Err(Error::Closed),
            other => other,
        }
    }

    /// Queues `data` as DATA frames on the physical connection. All frames
    /// of one call are queued together.
    ///
    /// ## Errors
    ///
    /// [`Error::Closed`] once either side closed the pipeline or the
    /// physical connection is gone.
    pub fn write(&self, data: &[u8]) -> Result<usize> {
        if !self.is_open() {
            return Err(Error::Closed);
        }
        let mux = self.inner.mux.upgrade().ok_or(Error::Closed)?;
        mux.send_data(self.inner.id, data)?;
        Ok(data.len())
    }

    /// Sends CLOSE. Buffered inbound bytes stay readable; the pipeline is
    /// fully closed once the peer answers.
    pub fn close(&self) {
        if !self.inner.begin_close() {
            return;
        }
        match self.inner.mux.upgrade() {
            Some(mux) => mux.close_local(self),
            None => {
                self.inner.mark_closed();
            }
        }
    }
}

impl PartialEq for Pipeline {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl Eq for Pipeline {}

impl fmt::Debug for Pipeline {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Pipeline")
            .field("id", &self.inner.id)
            .field("state", &self.state())
            .field("available", &self.available())
            .finish()
    }
}

/// Blocking reads over a [`Pipeline`].
#[derive(Debug, Clone)]
pub struct BlockingPipeline {
    pipeline: Pipeline,
    read_timeout: Duration,
}

impl BlockingPipeline {
    pub fn new(pipeline: Pipeline) -> Self {
        Self {
            pipeline,
            read_timeout: crate::connection::blocking::DEFAULT_READ_TIMEOUT,
        }
    }

    pub fn set_read_timeout(&mut self, timeout: Duration) {
        self.read_timeout = timeout;
    }

    pub fn read_timeout(&self) -> Duration {
        self.read_timeout
    }

    pub fn inner(&self) -> &Pipeline {
        &self.pipeline
    }

    pub fn id(&self) -> PipelineId {
        self.pipeline.id()
    }

    pub fn available(&self) -> usize {
        self.pipeline.available()
    }

    pub fn read_by_delimiter(&self, delimiter: &[u8]) -> Result<Bytes> {
        self.read_blocking(|buf| buf.read_by_delimiter(delimiter))
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

    pub fn read_u32(&self) -> Result<u32> {
        self.read_blocking(FramingBuffer::read_u32)
    }

    fn read_blocking<T>(&self, mut f: impl FnMut(&mut FramingBuffer) -> Result<T>) -> Result<T> {
        let deadline = Instant::now() + self.read_timeout;
        let shared = &self.pipeline.inner;
        let mut inbound = shared.inbound.lock();
        loop {
            match f(&mut inbound) {
                Err(Error::Incomplete) => {}
                other => {
                    let remaining = inbound.available();
                    drop(inbound);
                    if other.is_ok() {
                        shared.after_read(remaining);
                    }
                    return other;
                }
            }
            if shared.state() == PipelineState::Closed {
                return Err(Error::Closed);
            }
            let Some(remaining) = utils::remaining(deadline) else {
                return Err(Error::Timeout);
            };
            shared.cond.wait_for(&mut inbound, remaining);
        }
    }

    pub fn write(&self, data: &[u8]) -> Result<usize> {
        self.pipeline.write(data)
    }

    pub fn close(&self) {
        self.pipeline.close();
    }
}

impl From<Pipeline> for BlockingPipeline {
    fn from(pipeline: Pipeline) -> Self {
        BlockingPipeline::new(pipeline)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    fn detached(id: u32) -> Pipeline {
        Pipeline::new(PipelineId(id), Weak::new(), 1024)
    }

    #[test]
    fn test_close_handshake_states() {
        let local = detached(1);
        assert!(local.inner.begin_close());
        assert_eq!(local.state(), PipelineState::HalfClosed);
        assert!(!local.inner.begin_close());
        assert_eq!(local.inner.remote_close(), Some(false));
        assert_eq!(local.state(), PipelineState::Closed);
        assert_eq!(local.inner.remote_close(), None);

        let remote = detached(2);
        assert_eq!(remote.inner.remote_close(), Some(true));
        assert_eq!(remote.state(), PipelineState::Closed);
    }

    #[test]
    fn test_reads_drain_before_closed() {
        let pipeline = detached(3);
        pipeline.inner.offer(Bytes::from_static(b"tail\n"), usize::MAX, &AtomicUsize::new(0));
        pipeline.inner.mark_closed();

        assert_eq!(&pipeline.read_by_delimiter(b"\n").unwrap()[..], b"tail");
        assert!(matches!(pipeline.read_by_length(1), Err(Error::Closed)));
        assert!(matches!(pipeline.write(b"x"), Err(Error::Closed)));
    }

    #[test]
    fn test_detached_write_fails() {
        let pipeline = detached(5);
        assert!(matches!(pipeline.write(b"x"), Err(Error::Closed)));
        pipeline.close();
        assert_eq!(pipeline.state(), PipelineState::Closed);
    }

    #[test]
    fn test_blocking_read_wakes_on_delivery() {
        let pipeline = detached(7);
        let mut blocking = BlockingPipeline::new(pipeline.clone());
        blocking.set_read_timeout(Duration::from_secs(5));

        let writer = thread::spawn(move || {
            let queued = AtomicUsize::new(0);
            thread::sleep(Duration::from_millis(50));
            pipeline.inner.offer(Bytes::from_static(b"hello "), usize::MAX, &queued);
            pipeline.inner.offer(Bytes::from_static(b"world\r\n"), usize::MAX, &queued);
        });

        let line = blocking.read_string_by_delimiter(b"\r\n").unwrap();
        assert_eq!(line, "hello world");
        writer.join().unwrap();
    }

    #[test]
    fn test_offer_queues_above_high_water_mark() {
        let pipeline = detached(11);
        let queued = AtomicUsize::new(0);
        let offer = |data: &'static [u8]| pipeline.inner.offer(Bytes::from_static(data), 8, &queued);
        assert!(!offer(b"0123456789"));
        assert!(offer(b"abcd"));
        assert!(offer(b"efgh"));
        assert_eq!(pipeline.available(), 10);
        assert_eq!(pipeline.inner.pending(), 8);
        assert_eq!(queued.load(Ordering::SeqCst), 8);

        // drained below the mark, queued frames still come out in order
        assert_eq!(&pipeline.read_by_length(10).unwrap()[..], b"0123456789");
        assert!(offer(b"ijkl"));
        assert_eq!(queued.load(Ordering::SeqCst), 12);
        assert_eq!(pipeline.inner.replay(6), 8);
        assert_eq!(pipeline.inner.pending(), 4);
        assert_eq!(pipeline.inner.replay(usize::MAX), 4);
        assert_eq!(&pipeline.read_available().unwrap()[..], b"abcdefghijkl");
    }

    #[test]
    fn test_blocking_read_times_out_and_closes() {
        let pipeline = detached(9);
        let mut blocking = BlockingPipeline::new(pipeline.clone());
        blocking.set_read_timeout(Duration::from_millis(30));
        assert!(matches!(blocking.read_by_length(4), Err(Error::Timeout)));

        pipeline.inner.mark_closed();
        assert!(matches!(blocking.read_by_length(4), Err(Error::Closed)));
    }
}
