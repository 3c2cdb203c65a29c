//! Where loads run and how their results get back to the caller.
//!
//! An [Executor] runs the background part of each load.  A [Dispatcher] decides which thread runs the callback once a
//! background load finishes.  A [CancelHandle] lets the caller abandon a load; the background task polls it between
//! stages.
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{channel, Receiver, RecvTimeoutError, Sender};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use rayon::{ThreadPool, ThreadPoolBuilder};
use tracing::{debug, error};

use crate::*;

pub type Task = Box<dyn FnOnce() + Send + 'static>;

pub trait Executor: Send + Sync {
    fn execute(&self, task: Task);
}

/// Pool size for hosts with plenty of parallel decode and network capacity.
pub const LARGE_POOL_THREADS: usize = 5;
/// Pool size for everything else.
pub const SMALL_POOL_THREADS: usize = 2;
/// Hosts reporting at least this much parallelism get the large pool.
const LARGE_HOST_PARALLELISM: usize = 4;

/// A bounded pool of worker threads.
#[derive(Debug)]
pub struct WorkerPool {
    pool: ThreadPool,
    threads: usize,
}

impl WorkerPool {
    pub fn new(threads: usize) -> Result<WorkerPool, rayon::ThreadPoolBuildError> {
        let threads = threads.max(1);
        let pool = ThreadPoolBuilder::new()
            .num_threads(threads)
            .thread_name(|i| format!("bitmap-loader-{}", i))
            .panic_handler(|payload| {
                error!(cause = %LoadError::from_panic(payload), "worker task panicked");
            })
            .build()?;
        debug!(threads, "started worker pool");
        Ok(WorkerPool { pool, threads })
    }

    /// A pool sized for the capability class of the current host.
    pub fn for_host() -> Result<WorkerPool, rayon::ThreadPoolBuildError> {
        WorkerPool::new(host_pool_size())
    }

    pub fn threads(&self) -> usize {
        self.threads
    }
}

pub fn host_pool_size() -> usize {
    let parallelism = std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1);
    if parallelism >= LARGE_HOST_PARALLELISM {
        LARGE_POOL_THREADS
    } else {
        SMALL_POOL_THREADS
    }
}

impl Executor for WorkerPool {
    fn execute(&self, task: Task) {
        self.pool.spawn(task);
    }
}

/// Runs tasks on the calling thread.  Mostly useful for deterministic tests.
#[derive(Copy, Clone, Debug, Default)]
pub struct InlineExecutor;

impl Executor for InlineExecutor {
    fn execute(&self, task: Task) {
        task()
    }
}

pub trait Dispatcher: Send + Sync {
    fn dispatch(&self, task: Task);
}

/// Runs callbacks on whichever worker finished the load.
#[derive(Copy, Clone, Debug, Default)]
pub struct ImmediateDispatcher;

impl Dispatcher for ImmediateDispatcher {
    fn dispatch(&self, task: Task) {
        task()
    }
}

/// Queues callbacks until the owning (usually UI) thread drains them.
pub struct QueueDispatcher {
    sender: Mutex<Sender<Task>>,
    receiver: Mutex<Receiver<Task>>,
}

impl QueueDispatcher {
    pub fn new() -> QueueDispatcher {
        let (sender, receiver) = channel();
        QueueDispatcher {
            sender: Mutex::new(sender),
            receiver: Mutex::new(receiver),
        }
    }

    /// Run every callback queued so far, returning how many ran.
    pub fn run_pending(&self) -> usize {
        let pending = self.receiver.lock().try_iter().collect::<Vec<_>>();
        let count = pending.len();
        for task in pending {
            task();
        }
        count
    }

    /// Wait up to `timeout` for one callback and run it.  Returns whether one ran.
    pub fn run_next_timeout(&self, timeout: Duration) -> bool {
        let next = self.receiver.lock().recv_timeout(timeout);
        match next {
            Ok(task) => {
                task();
                true
            }
            Err(RecvTimeoutError::Timeout) | Err(RecvTimeoutError::Disconnected) => false,
        }
    }
}

impl Default for QueueDispatcher {
    fn default() -> QueueDispatcher {
        QueueDispatcher::new()
    }
}

impl Dispatcher for QueueDispatcher {
    fn dispatch(&self, task: Task) {
        // We hold the receiver ourselves, so the channel can't be disconnected.
        let _ = self.sender.lock().send(task);
    }
}

/// Cancels an in-flight load.
///
/// Loads answered synchronously get an inert handle.  Canceling is idempotent and does nothing once the load has
/// delivered its result.
#[derive(Clone, Debug, Default)]
pub struct CancelHandle {
    flag: Option<Arc<AtomicBool>>,
}

impl CancelHandle {
    pub(crate) fn armed() -> CancelHandle {
        CancelHandle {
            flag: Some(Arc::new(AtomicBool::new(false))),
        }
    }

    pub fn inert() -> CancelHandle {
        CancelHandle { flag: None }
    }

    pub fn cancel(&self) {
        if let Some(f) = &self.flag {
            f.store(true, Ordering::Release);
        }
    }

    pub fn is_cancelled(&self) -> bool {
        self.flag
            .as_ref()
            .map_or(false, |f| f.load(Ordering::Acquire))
    }

    /// Whether this handle controls nothing, because the load completed synchronously.
    pub fn is_inert(&self) -> bool {
        self.flag.is_none()
    }
}
