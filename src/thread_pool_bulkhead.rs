//! Bulkhead isolating work on a bounded pool of dedicated OS threads.
//!
//! Submission never blocks the caller:
//! 1. fewer than `core_thread_pool_size` workers: start a worker for the task;
//! 2. otherwise, room in the queue: enqueue it;
//! 3. otherwise, fewer than `max_thread_pool_size` workers: start a worker for it;
//! 4. otherwise reject with [`ResilienceError::BulkheadFull`].
//!
//! Workers beyond the core size retire after idling for `keep_alive_duration`. Dropping the last
//! handle shuts the pool down; queued tasks still run.

use crate::error::{ConfigError, ResilienceError};
use crate::events::EventPublisher;
use std::collections::VecDeque;
use std::fmt;
use std::future::Future;
use std::panic::{self, AssertUnwindSafe};
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::task::{Context, Poll};
use std::thread;
use std::time::Duration;
use tokio::sync::oneshot;

type Job = Box<dyn FnOnce() + Send + 'static>;

/// Where a submitted job went. Worker slots are reserved before the lock is released.
enum Admission {
    StartWorker(Job),
    Queued,
    Rejected,
}

/// Validated configuration for a [`ThreadPoolBulkhead`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ThreadPoolBulkheadConfig {
    max_thread_pool_size: usize,
    core_thread_pool_size: usize,
    queue_capacity: usize,
    keep_alive_duration: Duration,
}

impl Default for ThreadPoolBulkheadConfig {
    fn default() -> Self {
        let cores = thread::available_parallelism().map(|n| n.get()).unwrap_or(1);
        Self {
            max_thread_pool_size: cores,
            core_thread_pool_size: cores.saturating_sub(1).max(1),
            queue_capacity: 100,
            keep_alive_duration: Duration::from_millis(20),
        }
    }
}

impl ThreadPoolBulkheadConfig {
    pub fn builder() -> ThreadPoolBulkheadConfigBuilder {
        ThreadPoolBulkheadConfigBuilder { config: Self::default() }
    }

    pub fn max_thread_pool_size(&self) -> usize {
        self.max_thread_pool_size
    }

    pub fn core_thread_pool_size(&self) -> usize {
        self.core_thread_pool_size
    }

    pub fn queue_capacity(&self) -> usize {
        self.queue_capacity
    }

    pub fn keep_alive_duration(&self) -> Duration {
        self.keep_alive_duration
    }
}

#[derive(Debug, Clone)]
pub struct ThreadPoolBulkheadConfigBuilder {
    config: ThreadPoolBulkheadConfig,
}

impl ThreadPoolBulkheadConfigBuilder {
    pub fn max_thread_pool_size(mut self, size: usize) -> Self {
        self.config.max_thread_pool_size = size;
        self
    }

    pub fn core_thread_pool_size(mut self, size: usize) -> Self {
        self.config.core_thread_pool_size = size;
        self
    }

    pub fn queue_capacity(mut self, capacity: usize) -> Self {
        self.config.queue_capacity = capacity;
        self
    }

    pub fn keep_alive_duration(mut self, keep_alive: Duration) -> Self {
        self.config.keep_alive_duration = keep_alive;
        self
    }

    pub fn build(self) -> Result<ThreadPoolBulkheadConfig, ConfigError> {
        let c = &self.config;
        if c.max_thread_pool_size == 0 {
            return Err(ConfigError::Zero { field: "max_thread_pool_size" });
        }
        if c.core_thread_pool_size == 0 {
            return Err(ConfigError::Zero { field: "core_thread_pool_size" });
        }
        if c.core_thread_pool_size > c.max_thread_pool_size {
            return Err(ConfigError::CoreExceedsMax {
                core: c.core_thread_pool_size,
                max: c.max_thread_pool_size,
            });
        }
        if c.queue_capacity == 0 {
            return Err(ConfigError::Zero { field: "queue_capacity" });
        }
        Ok(self.config)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ThreadPoolBulkheadEvent {
    CallPermitted,
    CallRejected,
    CallFinished,
}

impl fmt::Display for ThreadPoolBulkheadEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Self::CallPermitted => "call permitted",
            Self::CallRejected => "call rejected",
            Self::CallFinished => "call finished",
        };
        f.write_str(label)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ThreadPoolBulkheadMetrics {
    pub thread_pool_size: usize,
    pub core_thread_pool_size: usize,
    pub maximum_thread_pool_size: usize,
    pub queue_depth: usize,
    pub queue_capacity: usize,
    pub remaining_queue_capacity: usize,
    pub active_thread_count: usize,
    /// Tasks that completed successfully.
    pub successful_calls: u64,
    /// Tasks that returned an error or panicked.
    pub failed_calls: u64,
    /// Submissions turned away.
    pub rejected_calls: u64,
}

impl ThreadPoolBulkheadMetrics {
    pub fn total_calls(&self) -> u64 {
        self.successful_calls + self.failed_calls + self.rejected_calls
    }
}

/// Outcome counters, kept apart from `PoolShared` so queued jobs never own the pool.
#[derive(Debug, Default)]
struct CallCounts {
    successful: AtomicU64,
    failed: AtomicU64,
    rejected: AtomicU64,
}

#[derive(Default)]
struct PoolState {
    queue: VecDeque<Job>,
    workers: usize,
    active: usize,
    shutdown: bool,
}

struct PoolShared {
    name: String,
    config: ThreadPoolBulkheadConfig,
    state: Mutex<PoolState>,
    work_available: Condvar,
    events: EventPublisher<ThreadPoolBulkheadEvent>,
    next_worker_id: AtomicUsize,
    counts: Arc<CallCounts>,
}

impl PoolShared {
    fn lock(&self) -> std::sync::MutexGuard<'_, PoolState> {
        self.state.lock().expect("thread pool bulkhead poisoned")
    }
}

/// Owner of the pool's lifetime; workers only hold `PoolShared`.
struct PoolHandle {
    shared: Arc<PoolShared>,
}

impl Drop for PoolHandle {
    fn drop(&mut self) {
        shutdown(&self.shared);
    }
}

fn shutdown(shared: &PoolShared) {
    let mut state = shared.lock();
    if !state.shutdown {
        state.shutdown = true;
        tracing::debug!(bulkhead = %shared.name, "Thread pool bulkhead shutting down");
    }
    drop(state);
    shared.work_available.notify_all();
}

/// Fixed worker-pool bulkhead. Clones share the same pool.
#[derive(Clone)]
pub struct ThreadPoolBulkhead {
    handle: Arc<PoolHandle>,
}

impl fmt::Debug for ThreadPoolBulkhead {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ThreadPoolBulkhead")
            .field("name", &self.handle.shared.name)
            .field("metrics", &self.metrics())
            .finish()
    }
}

/// Result of a submitted task.
///
/// Await it from async code, or call [`wait`](Self::wait) from a plain thread. A panic inside
/// the task resumes on the thread that collects the result.
pub struct PendingResult<T, E> {
    rx: oneshot::Receiver<thread::Result<Result<T, ResilienceError<E>>>>,
    name: String,
    max_concurrent_calls: usize,
}

impl<T, E> fmt::Debug for PendingResult<T, E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PendingResult").field("bulkhead", &self.name).finish()
    }
}

impl<T, E> PendingResult<T, E> {
    /// Block the current thread until the task finished.
    ///
    /// Must not be called from within an async runtime; await the handle there instead.
    pub fn wait(self) -> Result<T, ResilienceError<E>> {
        let Self { rx, name, max_concurrent_calls } = self;
        Self::settle(rx.blocking_recv(), name, max_concurrent_calls)
    }

    fn settle(
        received: Result<thread::Result<Result<T, ResilienceError<E>>>, oneshot::error::RecvError>,
        name: String,
        max_concurrent_calls: usize,
    ) -> Result<T, ResilienceError<E>> {
        match received {
            Ok(Ok(result)) => result,
            Ok(Err(payload)) => panic::resume_unwind(payload),
            // The task was dropped unrun: the pool shut down or could not start a worker.
            Err(_) => Err(ResilienceError::BulkheadFull { name, max_concurrent_calls }),
        }
    }
}

impl<T, E> Future for PendingResult<T, E> {
    type Output = Result<T, ResilienceError<E>>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let received = match Pin::new(&mut self.rx).poll(cx) {
            Poll::Ready(received) => received,
            Poll::Pending => return Poll::Pending,
        };
        let name = std::mem::take(&mut self.name);
        Poll::Ready(Self::settle(received, name, self.max_concurrent_calls))
    }
}

impl ThreadPoolBulkhead {
    pub fn new(name: impl Into<String>, config: ThreadPoolBulkheadConfig) -> Self {
        let shared = Arc::new(PoolShared {
            name: name.into(),
            config,
            state: Mutex::new(PoolState::default()),
            work_available: Condvar::new(),
            events: EventPublisher::new(),
            next_worker_id: AtomicUsize::new(0),
            counts: Arc::new(CallCounts::default()),
        });
        Self { handle: Arc::new(PoolHandle { shared }) }
    }

    pub fn of_defaults(name: impl Into<String>) -> Self {
        Self::new(name, ThreadPoolBulkheadConfig::default())
    }

    pub fn name(&self) -> &str {
        &self.handle.shared.name
    }

    pub fn config(&self) -> &ThreadPoolBulkheadConfig {
        &self.handle.shared.config
    }

    pub fn event_publisher(&self) -> &EventPublisher<ThreadPoolBulkheadEvent> {
        &self.handle.shared.events
    }

    /// Run a blocking task on the pool.
    ///
    /// # Errors
    /// `ResilienceError::BulkheadFull` when every worker is busy and the queue is full, or
    /// after [`shutdown`](Self::shutdown).
    pub fn submit<T, E, F>(&self, task: F) -> Result<PendingResult<T, E>, ResilienceError<E>>
    where
        F: FnOnce() -> Result<T, E> + Send + 'static,
        T: Send + 'static,
        E: Send + Sync + 'static,
    {
        self.dispatch(move || task().map_err(ResilienceError::Inner))
    }

    /// Run an async operation on a pool worker and await its result.
    ///
    /// The operation is driven by the tokio runtime the caller runs on (or a local executor
    /// outside tokio). Dropping the returned future does not stop the operation.
    ///
    /// # Errors
    /// `ResilienceError::BulkheadFull` if the pool rejected the submission, otherwise the
    /// operation's own result.
    pub async fn execute<T, E, Fut, Op>(&self, operation: Op) -> Result<T, ResilienceError<E>>
    where
        Op: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = Result<T, ResilienceError<E>>> + 'static,
        T: Send + 'static,
        E: Send + Sync + 'static,
    {
        let runtime = tokio::runtime::Handle::try_current().ok();
        let pending = self.dispatch(move || match runtime {
            Some(runtime) => runtime.block_on(operation()),
            None => futures::executor::block_on(operation()),
        })?;
        pending.await
    }

    fn dispatch<T, E, F>(&self, task: F) -> Result<PendingResult<T, E>, ResilienceError<E>>
    where
        F: FnOnce() -> Result<T, ResilienceError<E>> + Send + 'static,
        T: Send + 'static,
        E: Send + Sync + 'static,
    {
        let shared = &self.handle.shared;
        let (tx, rx) = oneshot::channel();
        let counts = shared.counts.clone();
        let job: Job = Box::new(move || {
            let outcome = panic::catch_unwind(AssertUnwindSafe(task));
            let counter = match &outcome {
                Ok(Ok(_)) => &counts.successful,
                _ => &counts.failed,
            };
            counter.fetch_add(1, Ordering::Relaxed);
            let _ = tx.send(outcome);
        });

        match self.admit(job) {
            Admission::Rejected => {
                tracing::debug!(
                    bulkhead = %shared.name,
                    max_threads = shared.config.max_thread_pool_size,
                    queue_capacity = shared.config.queue_capacity,
                    "Thread pool bulkhead full"
                );
                shared.counts.rejected.fetch_add(1, Ordering::Relaxed);
                shared.events.publish(&ThreadPoolBulkheadEvent::CallRejected);
                Err(ResilienceError::BulkheadFull {
                    name: shared.name.clone(),
                    max_concurrent_calls: self.max_concurrent_calls(),
                })
            }
            admission => {
                shared.events.publish(&ThreadPoolBulkheadEvent::CallPermitted);
                if let Admission::StartWorker(job) = admission {
                    spawn_worker(shared.clone(), job);
                }
                Ok(PendingResult {
                    rx,
                    name: shared.name.clone(),
                    max_concurrent_calls: self.max_concurrent_calls(),
                })
            }
        }
    }

    fn max_concurrent_calls(&self) -> usize {
        let config = &self.handle.shared.config;
        config.max_thread_pool_size + config.queue_capacity
    }

    fn admit(&self, job: Job) -> Admission {
        let shared = &self.handle.shared;
        let config = &shared.config;
        let mut state = shared.lock();
        if state.shutdown {
            return Admission::Rejected;
        }
        if state.workers < config.core_thread_pool_size {
            state.workers += 1;
            return Admission::StartWorker(job);
        }
        if state.queue.len() < config.queue_capacity {
            state.queue.push_back(job);
            drop(state);
            shared.work_available.notify_one();
            return Admission::Queued;
        }
        if state.workers < config.max_thread_pool_size {
            state.workers += 1;
            return Admission::StartWorker(job);
        }
        Admission::Rejected
    }

    /// Stop accepting work. Queued tasks still run; idle workers exit.
    pub fn shutdown(&self) {
        shutdown(&self.handle.shared);
    }

    pub fn is_shutdown(&self) -> bool {
        self.handle.shared.lock().shutdown
    }

    pub fn metrics(&self) -> ThreadPoolBulkheadMetrics {
        let config = &self.handle.shared.config;
        let counts = &self.handle.shared.counts;
        let state = self.handle.shared.lock();
        ThreadPoolBulkheadMetrics {
            thread_pool_size: state.workers,
            core_thread_pool_size: config.core_thread_pool_size,
            maximum_thread_pool_size: config.max_thread_pool_size,
            queue_depth: state.queue.len(),
            queue_capacity: config.queue_capacity,
            remaining_queue_capacity: config.queue_capacity.saturating_sub(state.queue.len()),
            active_thread_count: state.active,
            successful_calls: counts.successful.load(Ordering::Relaxed),
            failed_calls: counts.failed.load(Ordering::Relaxed),
            rejected_calls: counts.rejected.load(Ordering::Relaxed),
        }
    }

    /// True when both handles drive the same pool.
    pub fn ptr_eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.handle, &other.handle)
    }
}

fn spawn_worker(shared: Arc<PoolShared>, first: Job) {
    let id = shared.next_worker_id.fetch_add(1, Ordering::Relaxed);
    let thread_name = format!("{}-worker-{}", shared.name, id);
    let worker_shared = shared.clone();
    let spawned = thread::Builder::new()
        .name(thread_name)
        .spawn(move || run_worker(worker_shared, first));
    if let Err(err) = spawned {
        // The job went down with the closure; its PendingResult reports BulkheadFull.
        tracing::warn!(bulkhead = %shared.name, error = %err, "Failed to start bulkhead worker");
        shared.lock().workers -= 1;
    }
}

fn run_worker(shared: Arc<PoolShared>, first: Job) {
    let config = &shared.config;
    let mut next = Some(first);
    let mut state = shared.lock();
    state.active += 1;
    loop {
        if let Some(job) = next.take() {
            drop(state);
            job();
            shared.events.publish(&ThreadPoolBulkheadEvent::CallFinished);
            state = shared.lock();
            state.active -= 1;
        }

        if let Some(job) = state.queue.pop_front() {
            state.active += 1;
            next = Some(job);
            continue;
        }
        if state.shutdown {
            break;
        }
        if state.workers > config.core_thread_pool_size {
            let (guard, timeout) = shared
                .work_available
                .wait_timeout(state, config.keep_alive_duration)
                .expect("thread pool bulkhead poisoned");
            state = guard;
            if timeout.timed_out()
                && state.queue.is_empty()
                && state.workers > config.core_thread_pool_size
            {
                break;
            }
        } else {
            state = shared.work_available.wait(state).expect("thread pool bulkhead poisoned");
        }
    }
    state.workers -= 1;
    tracing::trace!(bulkhead = %shared.name, remaining = state.workers, "Bulkhead worker exiting");
}
