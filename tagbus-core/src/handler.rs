//! Execution policies
//!
//! Every subscription resolves to an [`EventHandler`] when it is registered.
//! The handler gets one `(subscriber, delivery)` pair per hand-off and must
//! invoke the subscriber exactly once, either inline or on another execution
//! context:
//!
//! | Mode | Handler | Where the callback runs |
//! |------|---------|-------------------------|
//! | `Post` | [`PostingHandler`] | posting thread, before `post` returns |
//! | `Main` | [`MainThreadHandler`] | thread attached to the [`MainLoop`] |
//! | `Async` | [`AsyncHandler`] | [`WorkerPool`] or a custom [`Executor`] |
//! | `Default` | bus default | whatever the bus was configured with |
//!
//! Failures of synchronous hand-offs are returned to the poster. Failures on
//! another context are logged with `tracing::error!`.

use crate::config::ConfigError;
use crate::error::HandlerError;
use crate::event::Delivery;
use crate::subscriber::Subscriber;
use once_cell::sync::OnceCell;
use parking_lot::Mutex;
use serde::Deserialize;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::thread::{self, ThreadId};
use tokio::runtime::{Builder, Handle, Runtime};
use tokio::sync::mpsc;
use tracing::{debug, error};

// ============================================================================
// Thread Mode
// ============================================================================

/// Execution policy of a subscription
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Deserialize)]
#[serde(try_from = "String")]
pub enum ThreadMode {
    /// Whatever the bus is configured to use
    #[default]
    Default,
    /// Synchronously on the posting thread
    Post,
    /// On the main loop thread
    Main,
    /// On the worker pool
    Async,
}

impl ThreadMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            ThreadMode::Default => "Default",
            ThreadMode::Post => "Post",
            ThreadMode::Main => "Main",
            ThreadMode::Async => "Async",
        }
    }
}

impl fmt::Display for ThreadMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ThreadMode {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "default" => Ok(ThreadMode::Default),
            "post" | "posting" => Ok(ThreadMode::Post),
            "main" => Ok(ThreadMode::Main),
            "async" => Ok(ThreadMode::Async),
            _ => Err(ConfigError::UnknownMode(s.to_string())),
        }
    }
}

impl TryFrom<String> for ThreadMode {
    type Error = ConfigError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

// ============================================================================
// Handlers
// ============================================================================

/// Hand-off of one delivery to one subscriber
pub trait EventHandler: Send + Sync + 'static {
    /// Invoke `subscriber` with `delivery`. The event usage is released
    /// once the delivery is dropped, after the callback ran.
    fn handle(&self, subscriber: Arc<dyn Subscriber>, delivery: Delivery) -> Result<(), HandlerError>;

    /// Mode this handler implements
    fn mode(&self) -> ThreadMode;
}

/// Runs the callback inline on the posting thread
#[derive(Debug, Default, Clone, Copy)]
pub struct PostingHandler;

impl EventHandler for PostingHandler {
    fn handle(&self, subscriber: Arc<dyn Subscriber>, delivery: Delivery) -> Result<(), HandlerError> {
        subscriber.on_event(delivery)
    }

    fn mode(&self) -> ThreadMode {
        ThreadMode::Post
    }
}

fn detached(subscriber: Arc<dyn Subscriber>, delivery: Delivery) -> Job {
    Box::new(move || {
        if let Err(e) = subscriber.on_event(delivery) {
            error!(subscriber = subscriber.name(), error = %e, "Event delivery failed");
        }
    })
}

/// Hands every delivery to an [`Executor`]
pub struct AsyncHandler {
    executor: OnceCell<Arc<dyn Executor>>,
    worker_threads: Option<usize>,
}

impl AsyncHandler {
    /// Use a specific executor
    pub fn new(executor: Arc<dyn Executor>) -> Self {
        Self {
            executor: OnceCell::with_value(executor),
            worker_threads: None,
        }
    }

    /// Start a [`WorkerPool`] on first use
    pub fn lazy(worker_threads: Option<usize>) -> Self {
        Self {
            executor: OnceCell::new(),
            worker_threads,
        }
    }

    fn executor(&self) -> Result<&Arc<dyn Executor>, HandlerError> {
        self.executor.get_or_try_init(|| {
            debug!(threads = ?self.worker_threads, "Starting worker pool");
            WorkerPool::new(self.worker_threads)
                .map(|pool| Arc::new(pool) as Arc<dyn Executor>)
                .map_err(|e| HandlerError::Executor(format!("failed to start worker pool: {}", e)))
        })
    }
}

impl EventHandler for AsyncHandler {
    fn handle(&self, subscriber: Arc<dyn Subscriber>, delivery: Delivery) -> Result<(), HandlerError> {
        self.executor()?.execute(detached(subscriber, delivery))
    }

    fn mode(&self) -> ThreadMode {
        ThreadMode::Async
    }
}

impl fmt::Debug for AsyncHandler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AsyncHandler")
            .field("started", &self.executor.get().is_some())
            .field("worker_threads", &self.worker_threads)
            .finish()
    }
}

/// Runs the callback on the main loop thread
#[derive(Debug, Clone)]
pub struct MainThreadHandler {
    main_loop: Arc<MainLoop>,
}

impl MainThreadHandler {
    pub fn new(main_loop: Arc<MainLoop>) -> Self {
        Self { main_loop }
    }
}

impl EventHandler for MainThreadHandler {
    fn handle(&self, subscriber: Arc<dyn Subscriber>, delivery: Delivery) -> Result<(), HandlerError> {
        if self.main_loop.is_main_thread() {
            return subscriber.on_event(delivery);
        }
        self.main_loop.execute(detached(subscriber, delivery))
    }

    fn mode(&self) -> ThreadMode {
        ThreadMode::Main
    }
}

// ============================================================================
// Executors
// ============================================================================

/// A unit of deferred work
pub type Job = Box<dyn FnOnce() + Send + 'static>;

/// Somewhere to run jobs off the posting thread
pub trait Executor: Send + Sync + 'static {
    fn execute(&self, job: Job) -> Result<(), HandlerError>;
}

/// Tokio-backed pool for [`ThreadMode::Async`] deliveries.
///
/// Callbacks are synchronous, so jobs go through `spawn_blocking`.
pub struct WorkerPool {
    handle: Handle,
    runtime: Option<Runtime>,
}

impl WorkerPool {
    /// Start an owned multi-thread runtime
    pub fn new(worker_threads: Option<usize>) -> std::io::Result<Self> {
        let mut builder = Builder::new_multi_thread();
        builder.thread_name("tagbus-worker");
        if let Some(threads) = worker_threads {
            let threads = threads.max(1);
            builder.worker_threads(threads).max_blocking_threads(threads);
        }
        let runtime = builder.build()?;

        Ok(Self {
            handle: runtime.handle().clone(),
            runtime: Some(runtime),
        })
    }

    /// Run jobs on an existing runtime
    pub fn from_handle(handle: Handle) -> Self {
        Self {
            handle,
            runtime: None,
        }
    }

    pub fn handle(&self) -> &Handle {
        &self.handle
    }
}

impl Executor for WorkerPool {
    fn execute(&self, job: Job) -> Result<(), HandlerError> {
        drop(self.handle.spawn_blocking(job));
        Ok(())
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        // Blocking shutdown panics inside an async context
        if let Some(runtime) = self.runtime.take() {
            runtime.shutdown_background();
        }
    }
}

impl fmt::Debug for WorkerPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WorkerPool")
            .field("owned", &self.runtime.is_some())
            .finish()
    }
}

/// Job queue drained by a single attached thread.
///
/// Some thread calls [`attach`](MainLoop::attach) once and then pumps the
/// queue with [`run_pending`](MainLoop::run_pending) or
/// [`run_until_idle`](MainLoop::run_until_idle), typically from its own event
/// loop. Deliveries posted from the attached thread run inline.
pub struct MainLoop {
    sender: mpsc::UnboundedSender<Job>,
    receiver: Mutex<mpsc::UnboundedReceiver<Job>>,
    pending: AtomicUsize,
    thread: OnceCell<ThreadId>,
}

impl MainLoop {
    pub fn new() -> Self {
        let (sender, receiver) = mpsc::unbounded_channel();
        Self {
            sender,
            receiver: Mutex::new(receiver),
            pending: AtomicUsize::new(0),
            thread: OnceCell::new(),
        }
    }

    /// Bind the loop to the current thread. Returns `false` if another
    /// thread is already attached.
    pub fn attach(&self) -> bool {
        let current = thread::current().id();
        *self.thread.get_or_init(|| current) == current
    }

    pub fn is_main_thread(&self) -> bool {
        self.thread.get() == Some(&thread::current().id())
    }

    /// Jobs waiting to run
    pub fn pending(&self) -> usize {
        self.pending.load(Ordering::SeqCst)
    }

    /// Run the jobs queued so far. Jobs queued while running wait for the
    /// next call. Returns the number of jobs run.
    pub fn run_pending(&self) -> usize {
        self.drain(self.pending())
    }

    /// Run jobs until the queue is empty, including jobs queued by jobs
    pub fn run_until_idle(&self) -> usize {
        self.drain(usize::MAX)
    }

    fn drain(&self, limit: usize) -> usize {
        let mut ran = 0;
        while ran < limit {
            // The lock is released before the job runs so jobs can post
            let job = self.receiver.lock().try_recv().ok();
            let Some(job) = job else { break };
            self.pending.fetch_sub(1, Ordering::SeqCst);
            job();
            ran += 1;
        }
        ran
    }
}

impl Default for MainLoop {
    fn default() -> Self {
        Self::new()
    }
}

impl Executor for MainLoop {
    fn execute(&self, job: Job) -> Result<(), HandlerError> {
        self.pending.fetch_add(1, Ordering::SeqCst);
        self.sender.send(job).map_err(|_| {
            self.pending.fetch_sub(1, Ordering::SeqCst);
            HandlerError::Executor("main loop is closed".to_string())
        })
    }
}

impl fmt::Debug for MainLoop {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MainLoop")
            .field("thread", &self.thread.get())
            .field("pending", &self.pending())
            .finish()
    }
}
