//! Dynamically sized worker pool executing handler callbacks.
//!
//! The pool starts with `min` workers. A background adjuster wakes every
//! adjustment period and, when tasks are waiting while no worker is idle, adds
//! workers up to `max`. Workers above `min` that find no work for the
//! keep-alive period retire themselves; a worker is never retired while it runs
//! a task. With `min == 0` the first submitted task lazily starts one worker,
//! which retires again after idling.
//!
//! ```text
//!   execute() ──▶ ┌──────────────┐   notify   ┌──────────┐
//!                 │ FIFO queue   │──────────▶│ worker 1 │
//!                 └──────────────┘            ├──────────┤
//!                        ▲                    │   ...    │
//!        adjust tick ────┘ (grow to max)      ├──────────┤
//!                                             │ worker N │ ── idle > keep-alive ──▶ retire
//!                                             └──────────┘
//! ```

use std::{
    collections::VecDeque,
    panic::{self, AssertUnwindSafe},
    sync::{
        atomic::{AtomicU64, AtomicUsize, Ordering},
        Arc,
    },
    thread::{self, Builder, JoinHandle},
    time::Duration,
};

use parking_lot::{Condvar, Mutex};
use tracing::{debug, error, trace, warn};

use crate::error::{Error, Result};

pub const DEFAULT_KEEP_ALIVE: Duration = Duration::from_secs(60);
pub const DEFAULT_ADJUST_PERIOD: Duration = Duration::from_secs(1);

pub type Task = Box<dyn FnOnce() + Send + 'static>;

/// Point-in-time view of the pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WorkerPoolStats {
    pub min_size: usize,
    pub max_size: usize,
    pub pool_size: usize,
    pub active: usize,
    pub queued: usize,
    pub completed: u64,
    pub panicked: u64,
}

struct PoolState {
    queue: VecDeque<Task>,
    workers: usize,
    idle: usize,
    shutdown: bool,
    next_worker_id: usize,
    handles: Vec<JoinHandle<()>>,
}

struct Shared {
    state: Mutex<PoolState>,
    task_ready: Condvar,
    adjust_signal: Condvar,
    min_size: usize,
    max_size: usize,
    keep_alive: Duration,
    adjust_period: Duration,
    active: AtomicUsize,
    completed: AtomicU64,
    panicked: AtomicU64,
    name: String,
}

enum Next {
    Run(Task),
    Exit,
}

pub struct WorkerPool {
    shared: Arc<Shared>,
    adjuster: Mutex<Option<JoinHandle<()>>>,
}

impl WorkerPool {
    /// Creates a pool with the default keep-alive and adjustment period.
    pub fn new(min_size: usize, max_size: usize) -> Result<Self> {
        Self::with_timing(min_size, max_size, DEFAULT_KEEP_ALIVE, DEFAULT_ADJUST_PERIOD)
    }

    /// Creates a pool bounded by `[min_size, max_size]`.
    ///
    /// ## Errors
    ///
    /// Returns [`Error::Configuration`] if `max_size` is zero or smaller than
    /// `min_size`, or an I/O error if the adjuster thread cannot be spawned.
    pub fn with_timing(
        min_size: usize,
        max_size: usize,
        keep_alive: Duration,
        adjust_period: Duration,
    ) -> Result<Self> {
        if max_size == 0 || min_size > max_size {
            return Err(Error::Configuration(format!(
                "invalid worker pool bounds [{}, {}]",
                min_size, max_size
            )));
        }

        let shared = Arc::new(Shared {
            state: Mutex::new(PoolState {
                queue: VecDeque::new(),
                workers: 0,
                idle: 0,
                shutdown: false,
                next_worker_id: 0,
                handles: Vec::with_capacity(max_size),
            }),
            task_ready: Condvar::new(),
            adjust_signal: Condvar::new(),
            min_size,
            max_size,
            keep_alive,
            adjust_period,
            active: AtomicUsize::new(0),
            completed: AtomicU64::new(0),
            panicked: AtomicU64::new(0),
            name: "millstream-worker".to_string(),
        });

        {
            let mut state = shared.state.lock();
            for _ in 0..min_size {
                spawn_worker(&shared, &mut state);
            }
        }

        let adjuster_shared = Arc::clone(&shared);
        let adjuster = Builder::new()
            .name("millstream-worker-adjuster".to_string())
            .spawn(move || adjust_loop(adjuster_shared))?;

        Ok(Self {
            shared,
            adjuster: Mutex::new(Some(adjuster)),
        })
    }

    /// Enqueues `task` for asynchronous execution. Never blocks on the task.
    ///
    /// ## Errors
    ///
    /// Returns [`Error::EventLoopGone`] once the pool has been shut down.
    pub fn execute<F>(&self, task: F) -> Result<()>
    where
        F: FnOnce() + Send + 'static,
    {
        let mut state = self.shared.state.lock();
        if state.shutdown {
            return Err(Error::EventLoopGone);
        }
        state.queue.push_back(Box::new(task));

        if state.idle > 0 {
            self.shared.task_ready.notify_one();
        } else if state.workers == 0 {
            // min size 0: lazily bring up one worker
            spawn_worker(&self.shared, &mut state);
        }
        Ok(())
    }

    /// Number of live worker threads.
    pub fn pool_size(&self) -> usize {
        self.shared.state.lock().workers
    }

    /// Number of workers currently running a task.
    pub fn active_count(&self) -> usize {
        self.shared.active.load(Ordering::Acquire)
    }

    pub fn min_size(&self) -> usize {
        self.shared.min_size
    }

    pub fn max_size(&self) -> usize {
        self.shared.max_size
    }

    pub fn is_open(&self) -> bool {
        !self.shared.state.lock().shutdown
    }

    pub fn stats(&self) -> WorkerPoolStats {
        let state = self.shared.state.lock();
        WorkerPoolStats {
            min_size: self.shared.min_size,
            max_size: self.shared.max_size,
            pool_size: state.workers,
            active: self.shared.active.load(Ordering::Acquire),
            queued: state.queue.len(),
            completed: self.shared.completed.load(Ordering::Relaxed),
            panicked: self.shared.panicked.load(Ordering::Relaxed),
        }
    }

    /// Stops accepting tasks, lets the workers drain the queue and joins them.
    pub fn shutdown(&self) {
        let handles = {
            let mut state = self.shared.state.lock();
            if state.shutdown {
                return;
            }
            state.shutdown = true;
            self.shared.task_ready.notify_all();
            self.shared.adjust_signal.notify_all();
            std::mem::take(&mut state.handles)
        };

        let current = thread::current().id();
        if let Some(adjuster) = self.adjuster.lock().take() {
            let _ = adjuster.join();
        }
        for handle in handles {
            // a task may drop the last reference to the pool from a worker
            if handle.thread().id() != current {
                let _ = handle.join();
            }
        }
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn spawn_worker(shared: &Arc<Shared>, state: &mut PoolState) -> bool {
    if state.workers >= shared.max_size {
        return false;
    }
    state.handles.retain(|h| !h.is_finished());

    let id = state.next_worker_id;
    let worker_shared = Arc::clone(shared);
    match Builder::new()
        .name(format!("{}-{}", shared.name, id))
        .spawn(move || worker_loop(worker_shared))
    {
        Ok(handle) => {
            state.next_worker_id += 1;
            state.workers += 1;
            state.handles.push(handle);
            trace!(worker = id, pool_size = state.workers, "worker started");
            true
        }
        Err(e) => {
            error!(error = %e, "failed to spawn worker thread");
            false
        }
    }
}

fn worker_loop(shared: Arc<Shared>) {
    loop {
        let next = {
            let mut state = shared.state.lock();
            loop {
                if let Some(task) = state.queue.pop_front() {
                    break Next::Run(task);
                }
                if state.shutdown {
                    state.workers -= 1;
                    break Next::Exit;
                }

                state.idle += 1;
                let timed_out = shared
                    .task_ready
                    .wait_for(&mut state, shared.keep_alive)
                    .timed_out();
                state.idle -= 1;

                if timed_out
                    && state.queue.is_empty()
                    && !state.shutdown
                    && state.workers > shared.min_size
                {
                    state.workers -= 1;
                    debug!(pool_size = state.workers, "idle worker retired");
                    break Next::Exit;
                }
            }
        };

        match next {
            Next::Run(task) => run_task(&shared, task),
            Next::Exit => return,
        }
    }
}

fn run_task(shared: &Shared, task: Task) {
    shared.active.fetch_add(1, Ordering::AcqRel);
    let outcome = panic::catch_unwind(AssertUnwindSafe(task));
    shared.active.fetch_sub(1, Ordering::AcqRel);

    match outcome {
        Ok(()) => {
            shared.completed.fetch_add(1, Ordering::Relaxed);
        }
        Err(payload) => {
            shared.panicked.fetch_add(1, Ordering::Relaxed);
            let reason = payload
                .downcast_ref::<&str>()
                .map(|s| s.to_string())
                .or_else(|| payload.downcast_ref::<String>().cloned())
                .unwrap_or_else(|| "unknown panic".to_string());
            error!(%reason, "task panicked; worker continues");
        }
    }
}

fn adjust_loop(shared: Arc<Shared>) {
    let mut state = shared.state.lock();
    while !state.shutdown {
        shared
            .adjust_signal
            .wait_for(&mut state, shared.adjust_period);
        if state.shutdown {
            break;
        }

        let backlog = state.queue.len();
        if backlog > 0 && state.idle == 0 && state.workers < shared.max_size {
            let grow = backlog.min(shared.max_size - state.workers);
            for _ in 0..grow {
                if !spawn_worker(&shared, &mut state) {
                    warn!("could not grow worker pool");
                    break;
                }
            }
            debug!(
                pool_size = state.workers,
                backlog,
                max_size = shared.max_size,
                "worker pool increased"
            );
        }
    }
}

/// Event queue that is drained by at most one pool task at a time.
///
/// Owners push events and, when [`push`](Self::push) returns `true`, submit a
/// task that calls [`next`](Self::next) until it returns `None`. This keeps
/// the events of one owner in order and never concurrent, while different
/// owners run in parallel on the pool.
pub(crate) struct SerialExecutor<E> {
    queue: Mutex<SerialQueue<E>>,
}

struct SerialQueue<E> {
    events: VecDeque<E>,
    running: bool,
}

impl<E> SerialExecutor<E> {
    pub(crate) fn new() -> Self {
        Self {
            queue: Mutex::new(SerialQueue {
                events: VecDeque::new(),
                running: false,
            }),
        }
    }

    /// Queues `event` unless `is_duplicate` matches an event still waiting.
    /// Returns `true` if the caller must start a drain task.
    pub(crate) fn push(&self, event: E, is_duplicate: impl Fn(&E) -> bool) -> bool {
        let mut queue = self.queue.lock();
        if queue.events.iter().any(is_duplicate) {
            return false;
        }
        queue.events.push_back(event);
        if queue.running {
            false
        } else {
            queue.running = true;
            true
        }
    }

    /// Next event for the running drain task; clears the running flag when
    /// the queue is empty.
    pub(crate) fn next(&self) -> Option<E> {
        let mut queue = self.queue.lock();
        let event = queue.events.pop_front();
        if event.is_none() {
            queue.running = false;
        }
        event
    }
}
