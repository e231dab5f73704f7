// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! Typed job queues: fixed worker pools per resource class, dedicated
//! threads for long-lived jobs.

use std::collections::BinaryHeap;
use std::sync::{Arc, Condvar, Mutex, Weak};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use prism_request::Identity;
use tracing::{debug, warn};

use crate::controller::JobControl;
use crate::engine::Engine;
use crate::job::{BackgroundJob, JobContext, JobError, JobState, Step};
use crate::lock;

/// Resource class of a job. Each pooled kind has its own fixed worker pool;
/// the two long-lived kinds get one dedicated thread per job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum QueueKind {
    /// CPU-bound in-process calculation.
    Calculation,
    /// Local disk I/O.
    Disk,
    /// Network reads.
    WebRead,
    /// Network writes.
    WebWrite,
    /// Long-lived change-notification watch. One dedicated thread per job.
    NotificationWatch,
    /// Off-process calculation via a provider. One dedicated thread per job.
    RemoteCalculation,
}

impl QueueKind {
    pub(crate) fn pool_index(self) -> Option<usize> {
        match self {
            QueueKind::Calculation => Some(0),
            QueueKind::Disk => Some(1),
            QueueKind::WebRead => Some(2),
            QueueKind::WebWrite => Some(3),
            QueueKind::NotificationWatch | QueueKind::RemoteCalculation => None,
        }
    }

    pub(crate) fn thread_name(self) -> &'static str {
        match self {
            QueueKind::Calculation => "prism-calc",
            QueueKind::Disk => "prism-disk",
            QueueKind::WebRead => "prism-web-read",
            QueueKind::WebWrite => "prism-web-write",
            QueueKind::NotificationWatch => "prism-watch",
            QueueKind::RemoteCalculation => "prism-remote",
        }
    }
}

/// Scheduling priority within one queue. Higher values run sooner; equal
/// priorities run in dispatch order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Priority(pub u8);

impl Priority {
    /// Background work that can wait.
    pub const LOW: Priority = Priority(64);
    /// The default.
    pub const NORMAL: Priority = Priority(128);
    /// Interactive-latency work.
    pub const HIGH: Priority = Priority(192);
}

impl Default for Priority {
    fn default() -> Priority {
        Priority::NORMAL
    }
}

pub(crate) struct QueuedJob {
    pub(crate) key: Identity,
    pub(crate) job: Box<dyn BackgroundJob>,
    pub(crate) control: Arc<JobControl>,
    pub(crate) priority: Priority,
    seq: u64,
    gathered: bool,
}

impl QueuedJob {
    pub(crate) fn new(
        key: Identity,
        job: Box<dyn BackgroundJob>,
        control: Arc<JobControl>,
        priority: Priority,
    ) -> QueuedJob {
        QueuedJob {
            key,
            job,
            control,
            priority,
            seq: 0,
            gathered: false,
        }
    }
}

impl PartialEq for QueuedJob {
    fn eq(&self, other: &Self) -> bool {
        self.priority == other.priority && self.seq == other.seq
    }
}

impl Eq for QueuedJob {}

impl PartialOrd for QueuedJob {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for QueuedJob {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        // Max-heap: highest priority first, then lowest sequence (FIFO).
        self.priority
            .cmp(&other.priority)
            .then(other.seq.cmp(&self.seq))
    }
}

struct PoolQueue {
    heap: BinaryHeap<QueuedJob>,
    /// Jobs waiting on inputs (or between passes). Runnable work in the
    /// heap always outranks these, so a deferred parent can never starve
    /// the children it is waiting for.
    deferred: std::collections::VecDeque<QueuedJob>,
    next_seq: u64,
    closed: bool,
}

pub(crate) struct PoolShared {
    queue: Mutex<PoolQueue>,
    available: Condvar,
}

impl PoolShared {
    fn new() -> PoolShared {
        PoolShared {
            queue: Mutex::new(PoolQueue {
                heap: BinaryHeap::new(),
                deferred: std::collections::VecDeque::new(),
                next_seq: 0,
                closed: false,
            }),
            available: Condvar::new(),
        }
    }

    /// Enqueues a fresh job, assigning it a sequence number so equal
    /// priorities run in dispatch order.
    fn push(&self, mut item: QueuedJob) {
        let mut queue = lock(&self.queue);
        item.seq = queue.next_seq;
        queue.next_seq += 1;
        queue.heap.push(item);
        self.available.notify_one();
    }

    /// Parks a not-ready (or between-passes) job for retry.
    fn defer(&self, item: QueuedJob) {
        let mut queue = lock(&self.queue);
        queue.deferred.push_back(item);
        self.available.notify_one();
    }

    fn heap_is_empty(&self) -> bool {
        lock(&self.queue).heap.is_empty()
    }

    /// Blocks until a job is available or the queue is closed. Returns the
    /// job and whether it came from the deferred queue. Remaining jobs are
    /// drained before the close takes effect.
    fn pop_blocking(&self) -> Option<(QueuedJob, bool)> {
        let mut queue = lock(&self.queue);
        loop {
            if let Some(item) = queue.heap.pop() {
                return Some((item, false));
            }
            if let Some(item) = queue.deferred.pop_front() {
                return Some((item, true));
            }
            if queue.closed {
                return None;
            }
            queue = self
                .available
                .wait(queue)
                .unwrap_or_else(std::sync::PoisonError::into_inner);
        }
    }

    fn close(&self) {
        lock(&self.queue).closed = true;
        self.available.notify_all();
    }
}

pub(crate) struct Pools {
    pooled: [Arc<PoolShared>; 4],
    workers: Mutex<Vec<JoinHandle<()>>>,
    dedicated_controls: Mutex<Vec<Weak<JobControl>>>,
    dedicated_handles: Mutex<Vec<JoinHandle<()>>>,
}

impl Pools {
    pub(crate) fn new() -> Pools {
        Pools {
            pooled: [
                Arc::new(PoolShared::new()),
                Arc::new(PoolShared::new()),
                Arc::new(PoolShared::new()),
                Arc::new(PoolShared::new()),
            ],
            workers: Mutex::new(Vec::new()),
            dedicated_controls: Mutex::new(Vec::new()),
            dedicated_handles: Mutex::new(Vec::new()),
        }
    }

    /// Spawns the fixed worker pools. Called once, right after the engine's
    /// shared state is constructed.
    pub(crate) fn spawn_workers(&self, engine: &Engine) {
        let config = engine.config();
        let widths = [
            (QueueKind::Calculation, config.calculation_threads),
            (QueueKind::Disk, config.disk_threads),
            (QueueKind::WebRead, config.web_read_threads),
            (QueueKind::WebWrite, config.web_write_threads),
        ];
        let mut workers = lock(&self.workers);
        for (kind, width) in widths {
            let Some(index) = kind.pool_index() else {
                continue;
            };
            for n in 0..width.max(1) {
                let engine = engine.clone();
                let pool = Arc::clone(&self.pooled[index]);
                let poll = config.poll_interval;
                let spawned = thread::Builder::new()
                    .name(format!("{}-{n}", kind.thread_name()))
                    .spawn(move || worker_loop(&engine, &pool, poll));
                match spawned {
                    Ok(handle) => workers.push(handle),
                    Err(err) => warn!(?err, ?kind, "failed to spawn pool worker"),
                }
            }
        }
    }

    pub(crate) fn enqueue(&self, kind: QueueKind, item: QueuedJob) {
        if let Some(index) = kind.pool_index() {
            self.pooled[index].push(item);
        }
    }

    /// Runs a long-lived job on its own thread rather than pool scheduling.
    pub(crate) fn spawn_dedicated(&self, engine: &Engine, kind: QueueKind, item: QueuedJob) {
        lock(&self.dedicated_controls).push(Arc::downgrade(&item.control));
        let engine = engine.clone();
        let poll = engine.config().poll_interval;
        let spawned = thread::Builder::new()
            .name(kind.thread_name().to_owned())
            .spawn(move || run_dedicated(&engine, item, poll));
        match spawned {
            Ok(handle) => lock(&self.dedicated_handles).push(handle),
            Err(err) => warn!(?err, ?kind, "failed to spawn dedicated worker"),
        }
    }

    /// Closes every queue, cancels dedicated jobs, and joins all threads.
    pub(crate) fn shutdown(&self) {
        for pool in &self.pooled {
            pool.close();
        }
        for control in lock(&self.dedicated_controls).drain(..) {
            if let Some(control) = control.upgrade() {
                control.cancel.cancel();
            }
        }
        let workers: Vec<JoinHandle<()>> = lock(&self.workers).drain(..).collect();
        for handle in workers {
            let _ = handle.join();
        }
        let dedicated: Vec<JoinHandle<()>> = lock(&self.dedicated_handles).drain(..).collect();
        for handle in dedicated {
            let _ = handle.join();
        }
    }
}

pub(crate) enum JobOutcome {
    Success(prism_request::Value),
    Failure(crate::job::FailurePayload),
    Canceled,
}

fn worker_loop(engine: &Engine, pool: &Arc<PoolShared>, poll: Duration) {
    while let Some((mut item, was_deferred)) = pool.pop_blocking() {
        if item.control.cancel.is_canceled() {
            debug!(key = %item.key, "job canceled while queued");
            engine.finish_job(item.key, &item.control, JobOutcome::Canceled);
            continue;
        }
        if !item.gathered {
            item.job.gather_inputs();
            item.gathered = true;
        }
        if !item.job.inputs_ready() {
            // Park for retry; pace the loop only when retries are the sole
            // remaining work.
            let only_deferred_left = was_deferred && pool.heap_is_empty();
            pool.defer(item);
            if only_deferred_left {
                thread::sleep(poll);
            }
            continue;
        }
        if let Some(item) = run_pass(engine, item) {
            pool.defer(item);
        }
    }
}

/// One execute pass. Returns the job when it yielded `Pending` and should
/// be re-queued.
fn run_pass(engine: &Engine, mut item: QueuedJob) -> Option<QueuedJob> {
    item.control.set_state(JobState::Running);
    let ctx = JobContext {
        key: item.key,
        engine: engine.clone(),
        control: Arc::clone(&item.control),
    };
    match item.job.execute(&ctx) {
        Ok(Step::Finished(value)) => {
            engine.finish_job(item.key, &item.control, JobOutcome::Success(value));
            None
        }
        Ok(Step::Pending) => {
            item.control.set_state(JobState::Queued);
            Some(item)
        }
        Err(JobError::Canceled) => {
            debug!(key = %item.key, job = %item.job.describe(), "job canceled");
            engine.finish_job(item.key, &item.control, JobOutcome::Canceled);
            None
        }
        Err(JobError::Failed(payload)) => {
            warn!(key = %item.key, job = %item.job.describe(), %payload, "job failed");
            engine.finish_job(item.key, &item.control, JobOutcome::Failure(payload));
            None
        }
    }
}

/// Drives one long-lived job to completion on its own thread.
fn run_dedicated(engine: &Engine, mut item: QueuedJob, poll: Duration) {
    item.job.gather_inputs();
    item.gathered = true;
    loop {
        if item.control.cancel.is_canceled() {
            engine.finish_job(item.key, &item.control, JobOutcome::Canceled);
            return;
        }
        if !item.job.inputs_ready() {
            thread::sleep(poll);
            continue;
        }
        match run_pass(engine, item) {
            Some(pending) => {
                item = pending;
                thread::sleep(poll);
            }
            None => return,
        }
    }
}
