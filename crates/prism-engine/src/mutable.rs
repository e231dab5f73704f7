// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! Cache for values that legitimately change over time.
//!
//! Distinct from the immutable result records: the same entity id maps to
//! many values over its lifetime, so entries are keyed by [`EntityId`] and
//! overwritten in place. There is no garbage collection beyond the
//! [`sweep`](MutableCache::sweep) refresh-everything pass — entity values
//! are small.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

use prism_request::{EntityId, Value};
use rustc_hash::FxHashMap;
use tracing::debug;

use crate::controller::JobController;
use crate::engine::Engine;
use crate::lock;

/// Behavior flags for [`MutableCache::refresh`].
#[derive(Debug, Clone, Copy, Default)]
pub struct RefreshFlags {
    /// Leave the dispatch latch set: the caller is about to dispatch its own
    /// refresh job, so the next `get_latest` must not dispatch another.
    pub suppress_dispatch: bool,
}

#[derive(Default)]
struct MutableEntry {
    value: Option<Value>,
    stale: bool,
    /// Set while a refresh is outstanding; gates the dispatch callback so
    /// it runs at most once per refresh cycle.
    dispatch_latch: bool,
}

/// The mutable entity cache.
///
/// `get_latest` returns the last known value — possibly stale — and, when
/// the entry is absent or invalidated, invokes the caller-supplied dispatch
/// callback exactly once to create a refresh job. A global monotonic epoch
/// lets observers detect "something changed" without tracking every entity.
pub struct MutableCache {
    entries: Mutex<FxHashMap<EntityId, MutableEntry>>,
    epoch: AtomicU64,
}

impl MutableCache {
    pub(crate) fn new() -> MutableCache {
        MutableCache {
            entries: Mutex::new(FxHashMap::default()),
            epoch: AtomicU64::new(0),
        }
    }

    /// Returns the last known value for `entity` (possibly stale).
    ///
    /// When the value is absent or stale and no refresh is outstanding,
    /// `dispatch_if_absent` is invoked — outside the cache lock — to create
    /// the refresh job. Concurrent callers race on the internal latch, so
    /// the callback runs at most once per refresh cycle.
    pub fn get_latest(
        &self,
        entity: EntityId,
        dispatch_if_absent: Option<&mut dyn FnMut()>,
    ) -> Option<Value> {
        let mut should_dispatch = false;
        let out = {
            let mut entries = lock(&self.entries);
            let entry = entries.entry(entity).or_default();
            if (entry.value.is_none() || entry.stale)
                && !entry.dispatch_latch
                && dispatch_if_absent.is_some()
            {
                entry.dispatch_latch = true;
                should_dispatch = true;
            }
            entry.value.clone()
        };
        if should_dispatch {
            if let Some(dispatch) = dispatch_if_absent {
                debug!(%entity, "dispatching mutable-entity refresh");
                dispatch();
            }
        }
        out
    }

    /// Stores a freshly computed value, clears the staleness and dispatch
    /// latch, and bumps the epoch. Called by refresh jobs.
    pub fn set_latest(&self, entity: EntityId, value: Value) {
        {
            let mut entries = lock(&self.entries);
            let entry = entries.entry(entity).or_default();
            entry.value = Some(value);
            entry.stale = false;
            entry.dispatch_latch = false;
        }
        self.bump_epoch();
    }

    /// Invalidates `entity` without dropping its last known value.
    ///
    /// With `suppress_dispatch` set the latch stays armed, so a caller that
    /// is about to dispatch its own refresh job does not race a redundant
    /// one from `get_latest`.
    pub fn refresh(&self, entity: EntityId, flags: RefreshFlags) {
        {
            let mut entries = lock(&self.entries);
            let entry = entries.entry(entity).or_default();
            entry.stale = true;
            entry.dispatch_latch = flags.suppress_dispatch;
        }
        self.bump_epoch();
    }

    /// Marks every entry stale and re-arms every dispatch latch: the
    /// refresh-everything pass that stands in for garbage collection.
    pub fn sweep(&self) {
        {
            let mut entries = lock(&self.entries);
            for entry in entries.values_mut() {
                entry.stale = true;
                entry.dispatch_latch = false;
            }
        }
        self.bump_epoch();
        debug!("mutable cache swept");
    }

    /// The global monotonic change counter. Bumped by every `set_latest`,
    /// `refresh`, and `sweep`.
    pub fn epoch(&self) -> u64 {
        self.epoch.load(Ordering::Acquire)
    }

    /// Number of entities with a cache entry.
    pub fn len(&self) -> usize {
        lock(&self.entries).len()
    }

    /// Returns `true` when no entity has been cached yet.
    pub fn is_empty(&self) -> bool {
        lock(&self.entries).is_empty()
    }

    fn bump_epoch(&self) {
        self.epoch.fetch_add(1, Ordering::AcqRel);
    }
}

impl std::fmt::Debug for MutableCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MutableCache")
            .field("entries", &self.len())
            .field("epoch", &self.epoch())
            .finish()
    }
}

/// One entity's watch registration: refcount plus the long-lived watch job.
pub(crate) struct WatchEntry {
    pub(crate) count: usize,
    pub(crate) controller: JobController,
}

/// A live watch registration. Dropping the last handle for an entity
/// cancels its watch job.
pub struct WatchHandle {
    engine: Engine,
    entity: EntityId,
}

impl WatchHandle {
    pub(crate) fn attach(engine: Engine, entity: EntityId) -> WatchHandle {
        WatchHandle { engine, entity }
    }

    /// The watched entity.
    pub fn entity(&self) -> EntityId {
        self.entity
    }
}

impl Drop for WatchHandle {
    fn drop(&mut self) {
        self.engine.release_watch(self.entity);
    }
}

impl std::fmt::Debug for WatchHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WatchHandle")
            .field("entity", &self.entity)
            .finish_non_exhaustive()
    }
}
