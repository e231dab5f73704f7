// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! Caller-held interest handles for asynchronous results.

use std::marker::PhantomData;
use std::sync::{Arc, OnceLock};
use std::time::{Duration, Instant};

use prism_request::{Identity, Value};

use crate::engine::{Engine, RecordCell, RecordState};
use crate::job::FailurePayload;
use crate::lock;

/// A caller's interest in a result, keyed by content identity.
///
/// Many pointers may reference the same underlying record; records are
/// reference counted and evicted when the last pointer releases a
/// non-computing record. Once the record is `Ready` the pointer caches a
/// local copy of the value, so repeated [`data`](DataPointer::data) reads
/// never touch the shared record again.
pub struct DataPointer {
    engine: Engine,
    key: Identity,
    cell: Arc<RecordCell>,
    local: OnceLock<Value>,
}

impl DataPointer {
    pub(crate) fn attach(engine: Engine, key: Identity, cell: Arc<RecordCell>) -> DataPointer {
        DataPointer {
            engine,
            key,
            cell,
            local: OnceLock::new(),
        }
    }

    /// The record key this pointer observes.
    pub fn key(&self) -> Identity {
        self.key
    }

    /// Current record state.
    pub fn state(&self) -> RecordState {
        lock(&self.cell.inner).state
    }

    /// Last reported fractional completion in `0.0..=1.0`.
    pub fn progress(&self) -> f64 {
        lock(&self.cell.inner).progress
    }

    /// The stored failure, once the record is `Failed`.
    pub fn failure(&self) -> Option<FailurePayload> {
        lock(&self.cell.inner).failure.clone()
    }

    /// The result, once the record is `Ready`. The first successful read
    /// caches a local copy.
    pub fn data(&self) -> Option<&Value> {
        if self.local.get().is_none() {
            let inner = lock(&self.cell.inner);
            if inner.state == RecordState::Ready {
                if let Some(value) = &inner.value {
                    let _ = self.local.set(value.clone());
                }
            }
        }
        self.local.get()
    }

    /// Blocks until the record is `Ready` or `Failed`, or until `timeout`
    /// elapses. Returns the last observed state. This is an explicit opt-in
    /// for callers that can afford to wait; the interactive thread polls
    /// [`state`](DataPointer::state) instead.
    pub fn wait_ready(&self, timeout: Duration) -> RecordState {
        let deadline = Instant::now() + timeout;
        let mut inner = lock(&self.cell.inner);
        loop {
            match inner.state {
                RecordState::Ready | RecordState::Failed => return inner.state,
                _ => {}
            }
            let now = Instant::now();
            if now >= deadline {
                return inner.state;
            }
            let (guard, _) = self
                .cell
                .changed
                .wait_timeout(inner, deadline - now)
                .unwrap_or_else(std::sync::PoisonError::into_inner);
            inner = guard;
        }
    }
}

impl Clone for DataPointer {
    fn clone(&self) -> DataPointer {
        lock(&self.cell.inner).pointers += 1;
        DataPointer {
            engine: self.engine.clone(),
            key: self.key,
            cell: Arc::clone(&self.cell),
            local: self.local.clone(),
        }
    }
}

impl Drop for DataPointer {
    fn drop(&mut self) {
        self.engine.release_pointer(self.key);
    }
}

impl std::fmt::Debug for DataPointer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DataPointer")
            .field("key", &self.key)
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

/// Typed wrapper over [`DataPointer`] for callers that know the result's
/// shape.
pub struct TypedPointer<T> {
    inner: DataPointer,
    _marker: PhantomData<fn() -> T>,
}

impl<T> TypedPointer<T>
where
    T: TryFrom<Value>,
{
    /// Wraps an untyped pointer.
    pub fn new(inner: DataPointer) -> TypedPointer<T> {
        TypedPointer {
            inner,
            _marker: PhantomData,
        }
    }

    /// The wrapped untyped pointer.
    pub fn untyped(&self) -> &DataPointer {
        &self.inner
    }

    /// Current record state.
    pub fn state(&self) -> RecordState {
        self.inner.state()
    }

    /// Last reported fractional completion.
    pub fn progress(&self) -> f64 {
        self.inner.progress()
    }

    /// The converted result, once ready. Returns `None` both while the
    /// result is pending and when the value does not convert to `T`.
    pub fn data(&self) -> Option<T> {
        self.inner
            .data()
            .cloned()
            .and_then(|value| T::try_from(value).ok())
    }
}

impl<T> std::fmt::Debug for TypedPointer<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TypedPointer")
            .field("key", &self.inner.key())
            .finish_non_exhaustive()
    }
}
