// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! The engine core: record map, dispatch, and job-facing entry points.

use std::collections::hash_map::Entry;
use std::sync::{Arc, Condvar, Mutex};
use std::time::Duration;

use prism_request::{EntityId, Identity, Value};
use rustc_hash::FxHashMap;
use tracing::debug;

use crate::controller::{JobControl, JobController};
use crate::job::{BackgroundJob, FailurePayload, JobState};
use crate::lock;
use crate::mutable::{MutableCache, WatchEntry, WatchHandle};
use crate::pointer::DataPointer;
use crate::queue::{JobOutcome, Pools, Priority, QueueKind, QueuedJob};

/// Worker pool widths and polling cadence.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Threads in the CPU-bound calculation pool.
    pub calculation_threads: usize,
    /// Threads in the disk I/O pool.
    pub disk_threads: usize,
    /// Threads in the network-read pool.
    pub web_read_threads: usize,
    /// Threads in the network-write pool.
    pub web_write_threads: usize,
    /// Idle wait between readiness polls of deferred jobs.
    pub poll_interval: Duration,
}

impl Default for EngineConfig {
    fn default() -> EngineConfig {
        EngineConfig {
            calculation_threads: std::thread::available_parallelism()
                .map_or(4, std::num::NonZeroUsize::get),
            disk_threads: 2,
            web_read_threads: 4,
            web_write_threads: 2,
            poll_interval: Duration::from_millis(10),
        }
    }
}

/// State machine of one result record.
///
/// `Nowhere → Computing → Ready`, with `Failed` and `Canceled` as terminal
/// overlays. [`Engine::reset_record`] returns a non-computing record to
/// `Nowhere` so the computation can be restarted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordState {
    /// No computation has been attached yet (or the record was reset).
    Nowhere,
    /// Exactly one job is computing the result.
    Computing,
    /// The result is available.
    Ready,
    /// The computation failed; the failure payload is stored.
    Failed,
    /// The computation was canceled before delivering a result.
    Canceled,
}

pub(crate) struct RecordInner {
    pub(crate) state: RecordState,
    pub(crate) progress: f64,
    pub(crate) value: Option<Value>,
    pub(crate) failure: Option<FailurePayload>,
    pub(crate) pointers: usize,
    pub(crate) control: Option<Arc<JobControl>>,
}

pub(crate) struct RecordCell {
    pub(crate) inner: Mutex<RecordInner>,
    pub(crate) changed: Condvar,
}

impl RecordCell {
    fn new() -> RecordCell {
        RecordCell {
            inner: Mutex::new(RecordInner {
                state: RecordState::Nowhere,
                progress: 0.0,
                value: None,
                failure: None,
                pointers: 0,
                control: None,
            }),
            changed: Condvar::new(),
        }
    }
}

pub(crate) struct EngineShared {
    records: Mutex<FxHashMap<Identity, Arc<RecordCell>>>,
    pools: Pools,
    mutable: MutableCache,
    watches: Mutex<FxHashMap<EntityId, WatchEntry>>,
    config: EngineConfig,
}

/// The background execution engine. Cheap to clone; all clones share state.
/// Every method is safe to call from any thread.
#[derive(Clone)]
pub struct Engine {
    shared: Arc<EngineShared>,
}

impl Engine {
    /// Builds an engine and spawns its worker pools.
    pub fn new(config: EngineConfig) -> Engine {
        let engine = Engine {
            shared: Arc::new(EngineShared {
                records: Mutex::new(FxHashMap::default()),
                pools: Pools::new(),
                mutable: MutableCache::new(),
                watches: Mutex::new(FxHashMap::default()),
                config,
            }),
        };
        engine.shared.pools.spawn_workers(&engine);
        engine
    }

    /// [`Engine::new`] with [`EngineConfig::default`].
    pub fn with_defaults() -> Engine {
        Engine::new(EngineConfig::default())
    }

    pub(crate) fn config(&self) -> &EngineConfig {
        &self.shared.config
    }

    fn cell(&self, key: Identity) -> Arc<RecordCell> {
        let mut records = lock(&self.shared.records);
        Arc::clone(
            records
                .entry(key)
                .or_insert_with(|| Arc::new(RecordCell::new())),
        )
    }

    /// Attaches to the record for `key`, creating it in `Nowhere` if absent.
    ///
    /// The returned pointer adopts the record's current state; a caller that
    /// finds `Nowhere` is expected to either dispatch a job for the key or
    /// release the pointer.
    pub fn acquire(&self, key: Identity) -> DataPointer {
        let cell = self.cell(key);
        lock(&cell.inner).pointers += 1;
        DataPointer::attach(self.clone(), key, cell)
    }

    /// Dispatches `job` to compute `key` on the given queue.
    ///
    /// At most one computation runs per key: if the record is already
    /// `Computing`, this is a no-op returning the live job's controller; if
    /// it is already `Ready` or `Failed`, a settled controller is returned
    /// and the job is dropped. `Nowhere` and `Canceled` records start (or
    /// restart) the computation.
    pub fn dispatch(
        &self,
        key: Identity,
        queue: QueueKind,
        job: Box<dyn BackgroundJob>,
        priority: Priority,
    ) -> JobController {
        let cell = self.cell(key);
        let mut inner = lock(&cell.inner);
        match inner.state {
            RecordState::Computing => {
                if let Some(control) = &inner.control {
                    debug!(%key, "dispatch ignored; computation already in flight");
                    return JobController::attach(control);
                }
                // A computing record always carries a control; restart below
                // if it is somehow missing.
            }
            RecordState::Ready | RecordState::Failed => {
                debug!(%key, state = ?inner.state, "dispatch ignored; record already settled");
                let settled = if inner.state == RecordState::Failed {
                    JobState::Failed
                } else {
                    JobState::Finished
                };
                let control = inner
                    .control
                    .get_or_insert_with(|| {
                        Arc::new(JobControl::already_settled(settled, job.describe()))
                    });
                return JobController::attach(control);
            }
            RecordState::Nowhere | RecordState::Canceled => {}
        }

        inner.state = RecordState::Computing;
        inner.progress = 0.0;
        inner.value = None;
        inner.failure = None;
        let control = Arc::new(JobControl::new(job.describe()));
        inner.control = Some(Arc::clone(&control));
        drop(inner);
        cell.changed.notify_all();

        let item = QueuedJob::new(key, job, Arc::clone(&control), priority);
        match queue {
            QueueKind::NotificationWatch | QueueKind::RemoteCalculation => {
                self.shared.pools.spawn_dedicated(self, queue, item);
            }
            pooled => self.shared.pools.enqueue(pooled, item),
        }
        debug!(%key, ?queue, "job dispatched");
        JobController::attach(&control)
    }

    /// Stores `value` as the result for `key` and wakes every waiter.
    ///
    /// Accepted while the record is `Nowhere` (seeding) or `Computing`;
    /// ignored once the record has settled.
    pub fn set_result(&self, key: Identity, value: Value) {
        let mut records = lock(&self.shared.records);
        let Some(cell) = records.get(&key).map(Arc::clone) else {
            debug!(%key, "set_result on unknown record");
            return;
        };
        let mut inner = lock(&cell.inner);
        match inner.state {
            RecordState::Nowhere | RecordState::Computing => {
                inner.state = RecordState::Ready;
                inner.progress = 1.0;
                inner.value = Some(value);
                inner.failure = None;
                if let Some(control) = &inner.control {
                    control.set_state(JobState::Finished);
                    control.set_progress(1.0);
                }
                cell.changed.notify_all();
                if inner.pointers == 0 {
                    drop(inner);
                    records.remove(&key);
                }
            }
            _ => debug!(%key, state = ?inner.state, "set_result ignored; record already settled"),
        }
    }

    /// Stores a failure for `key`, surfacing it to every observing pointer.
    /// The engine never retries on its own; callers may `reset_record` and
    /// redispatch.
    pub fn fail_record(&self, key: Identity, failure: FailurePayload) {
        let mut records = lock(&self.shared.records);
        let Some(cell) = records.get(&key).map(Arc::clone) else {
            return;
        };
        let mut inner = lock(&cell.inner);
        match inner.state {
            RecordState::Nowhere | RecordState::Computing => {
                inner.state = RecordState::Failed;
                inner.failure = Some(failure);
                inner.value = None;
                if let Some(control) = &inner.control {
                    control.set_state(JobState::Failed);
                }
                cell.changed.notify_all();
                if inner.pointers == 0 {
                    drop(inner);
                    records.remove(&key);
                }
            }
            _ => debug!(%key, "fail_record ignored; record already settled"),
        }
    }

    /// Updates the record's fractional progress while it is computing.
    pub fn report_progress(&self, key: Identity, fraction: f64) {
        let records = lock(&self.shared.records);
        let Some(cell) = records.get(&key).map(Arc::clone) else {
            return;
        };
        drop(records);
        let mut inner = lock(&cell.inner);
        if inner.state == RecordState::Computing {
            inner.progress = fraction.clamp(0.0, 1.0);
            cell.changed.notify_all();
        }
    }

    /// Returns a non-computing record to `Nowhere` so a later caller can
    /// restart the computation. This is the cancel-before-completion path;
    /// a record that is still `Computing` is left alone.
    pub fn reset_record(&self, key: Identity) {
        let mut records = lock(&self.shared.records);
        let Some(cell) = records.get(&key).map(Arc::clone) else {
            return;
        };
        let mut inner = lock(&cell.inner);
        if inner.state == RecordState::Computing {
            debug!(%key, "reset ignored; computation in flight");
            return;
        }
        inner.state = RecordState::Nowhere;
        inner.progress = 0.0;
        inner.value = None;
        inner.failure = None;
        inner.control = None;
        cell.changed.notify_all();
        if inner.pointers == 0 {
            drop(inner);
            records.remove(&key);
        }
    }

    /// Worker-side completion. Guarded by control identity so a stale job
    /// (one whose record was reset and redispatched) cannot clobber the
    /// current computation.
    pub(crate) fn finish_job(
        &self,
        key: Identity,
        control: &Arc<JobControl>,
        outcome: JobOutcome,
    ) {
        match &outcome {
            JobOutcome::Success(_) => {
                control.set_state(JobState::Finished);
                control.set_progress(1.0);
            }
            JobOutcome::Failure(_) => control.set_state(JobState::Failed),
            JobOutcome::Canceled => control.set_state(JobState::Canceled),
        }

        let mut records = lock(&self.shared.records);
        let Some(cell) = records.get(&key).map(Arc::clone) else {
            return;
        };
        let mut inner = lock(&cell.inner);
        let is_current = inner
            .control
            .as_ref()
            .is_some_and(|current| Arc::ptr_eq(current, control));
        if !is_current || inner.state != RecordState::Computing {
            debug!(%key, "stale job completion ignored");
            return;
        }
        match outcome {
            JobOutcome::Success(value) => {
                inner.state = RecordState::Ready;
                inner.progress = 1.0;
                inner.value = Some(value);
            }
            JobOutcome::Failure(payload) => {
                inner.state = RecordState::Failed;
                inner.failure = Some(payload);
            }
            JobOutcome::Canceled => {
                inner.state = RecordState::Canceled;
            }
        }
        cell.changed.notify_all();
        if inner.pointers == 0 {
            drop(inner);
            records.remove(&key);
        }
    }

    pub(crate) fn release_pointer(&self, key: Identity) {
        let mut records = lock(&self.shared.records);
        let Some(cell) = records.get(&key).map(Arc::clone) else {
            return;
        };
        let mut inner = lock(&cell.inner);
        inner.pointers = inner.pointers.saturating_sub(1);
        if inner.pointers == 0 && inner.state != RecordState::Computing {
            drop(inner);
            records.remove(&key);
        }
    }

    /// The mutable entity cache.
    pub fn mutable(&self) -> &MutableCache {
        &self.shared.mutable
    }

    /// Registers interest in change notifications for `entity`.
    ///
    /// Watch registrations are reference counted per entity: the first
    /// watcher runs `factory` to create the long-lived watch job; dropping
    /// the last [`WatchHandle`] cancels it. `factory` must not re-enter the
    /// watch table.
    pub fn watch_entity(
        &self,
        entity: EntityId,
        factory: impl FnOnce() -> JobController,
    ) -> WatchHandle {
        let mut watches = lock(&self.shared.watches);
        match watches.entry(entity) {
            Entry::Occupied(mut occupied) => occupied.get_mut().count += 1,
            Entry::Vacant(vacant) => {
                let controller = factory();
                vacant.insert(WatchEntry {
                    count: 1,
                    controller,
                });
                debug!(%entity, "watch job created");
            }
        }
        WatchHandle::attach(self.clone(), entity)
    }

    pub(crate) fn release_watch(&self, entity: EntityId) {
        let mut watches = lock(&self.shared.watches);
        let Entry::Occupied(mut occupied) = watches.entry(entity) else {
            return;
        };
        occupied.get_mut().count = occupied.get().count.saturating_sub(1);
        if occupied.get().count == 0 {
            let entry = occupied.remove();
            entry.controller.cancel();
            debug!(%entity, "last watcher released; watch job canceled");
        }
    }

    /// Number of live watchers for `entity`.
    pub fn watch_count(&self, entity: EntityId) -> usize {
        lock(&self.shared.watches)
            .get(&entity)
            .map_or(0, |entry| entry.count)
    }

    /// Closes every queue, cancels dedicated jobs, and joins all worker
    /// threads. Records and cached results stay readable afterwards.
    pub fn shutdown(&self) {
        self.shared.pools.shutdown();
    }

    /// Number of live records, for diagnostics.
    pub fn record_count(&self) -> usize {
        lock(&self.shared.records).len()
    }
}

impl std::fmt::Debug for Engine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Engine")
            .field("records", &self.record_count())
            .finish_non_exhaustive()
    }
}
