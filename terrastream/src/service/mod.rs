//! Shared task service: priority work queue plus worker pool.
//!
//! One [`TaskService`] is shared by all tiles of a terrain. Tiles
//! enqueue [`LayerRequest`]s during the update pass; worker threads
//! drain the queue in priority order and run the fetches, blocking in
//! provider I/O as needed. The update pass never blocks on workers - it
//! only observes the atomic request state on later passes.
//!
//! The service also owns the [`SchedulerStamp`], the logical clock that
//! progress monitors compare request stamps against to detect stale
//! work. The clock is advanced once per update pass by the caller (see
//! [`Terrain::begin_update_pass`](crate::terrain::Terrain::begin_update_pass)).

mod queue;

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;

use parking_lot::{Condvar, Mutex};
use tracing::{debug, info};

use crate::tile::LayerRequest;
use queue::RequestQueue;

/// Default number of worker threads.
pub const DEFAULT_TASK_THREADS: usize = 8;

/// The global scheduling-pass clock.
///
/// A plain monotonic counter; reads and writes are relaxed because a
/// stale read merely delays staleness detection by one pass.
pub struct SchedulerStamp(AtomicU64);

impl SchedulerStamp {
    /// Creates a clock starting at zero.
    pub fn new() -> Self {
        Self(AtomicU64::new(0))
    }

    /// Current clock value.
    pub fn current(&self) -> u64 {
        self.0.load(Ordering::Relaxed)
    }

    /// Advance the clock to the given pass stamp.
    pub(crate) fn set(&self, stamp: u64) {
        self.0.store(stamp, Ordering::Relaxed);
    }
}

impl Default for SchedulerStamp {
    fn default() -> Self {
        Self::new()
    }
}

struct ServiceInner {
    queue: Mutex<RequestQueue>,
    available: Condvar,
    shutdown: AtomicBool,
    stamp: Arc<SchedulerStamp>,
}

/// Priority work queue with a fixed pool of fetch worker threads.
///
/// Dropping the service wakes and joins all workers; requests still in
/// the queue are discarded (their owning tiles will observe them as
/// idle and resubmit if the service is recreated).
pub struct TaskService {
    inner: Arc<ServiceInner>,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl TaskService {
    /// Starts a service with the given number of worker threads.
    ///
    /// A thread count of zero is clamped to one.
    pub fn new(num_threads: usize) -> Self {
        let num_threads = num_threads.max(1);
        let inner = Arc::new(ServiceInner {
            queue: Mutex::new(RequestQueue::new()),
            available: Condvar::new(),
            shutdown: AtomicBool::new(false),
            stamp: Arc::new(SchedulerStamp::new()),
        });

        let workers = (0..num_threads)
            .map(|i| {
                let inner = Arc::clone(&inner);
                std::thread::Builder::new()
                    .name(format!("layer-fetch-{}", i))
                    .spawn(move || Self::worker_loop(inner))
                    .expect("failed to spawn layer fetch worker")
            })
            .collect();

        info!(num_threads, "task service started");
        Self {
            inner,
            workers: Mutex::new(workers),
        }
    }

    /// Enqueue a request for servicing.
    ///
    /// No-op after shutdown has begun.
    pub fn add(&self, request: Arc<LayerRequest>) {
        if self.inner.shutdown.load(Ordering::Acquire) {
            return;
        }
        self.inner.queue.lock().push(request);
        self.inner.available.notify_one();
    }

    /// Current scheduling-pass stamp.
    pub fn stamp(&self) -> u64 {
        self.inner.stamp.current()
    }

    /// Advance the scheduling-pass stamp.
    pub fn set_stamp(&self, stamp: u64) {
        self.inner.stamp.set(stamp);
    }

    /// Shared handle to the scheduling clock, for attaching progress
    /// monitors to new requests.
    pub fn scheduler_stamp(&self) -> Arc<SchedulerStamp> {
        Arc::clone(&self.inner.stamp)
    }

    /// Number of queued entries awaiting a worker.
    pub fn queue_len(&self) -> usize {
        self.inner.queue.lock().len()
    }

    fn worker_loop(inner: Arc<ServiceInner>) {
        debug!("fetch worker started");
        loop {
            let request = {
                let mut queue = inner.queue.lock();
                loop {
                    if inner.shutdown.load(Ordering::Acquire) {
                        debug!("fetch worker stopping");
                        return;
                    }
                    match queue.pop() {
                        Some(request) => break request,
                        None => inner.available.wait(&mut queue),
                    }
                }
            };
            request.run();
        }
    }
}

impl Drop for TaskService {
    fn drop(&mut self) {
        self.inner.shutdown.store(true, Ordering::Release);
        self.inner.available.notify_all();
        for worker in self.workers.lock().drain(..) {
            let _ = worker.join();
        }
        debug!("task service stopped");
    }
}
