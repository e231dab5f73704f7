// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! Caller-held handles for monitoring and canceling dispatched jobs.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};

use prism_registry::CancelToken;

use crate::job::JobState;
use crate::lock;

/// Shared control block for one dispatched job. The record holds the owning
/// `Arc`; controllers hold weak references.
pub(crate) struct JobControl {
    pub(crate) cancel: CancelToken,
    state: Mutex<JobState>,
    progress: AtomicU64,
    describe: String,
}

impl JobControl {
    pub(crate) fn new(describe: String) -> JobControl {
        JobControl {
            cancel: CancelToken::new(),
            state: Mutex::new(JobState::Queued),
            progress: AtomicU64::new(0),
            describe,
        }
    }

    /// A control block for a job that never ran because the record was
    /// already terminal when dispatch was attempted.
    pub(crate) fn already_settled(state: JobState, describe: String) -> JobControl {
        let control = JobControl::new(describe);
        control.set_state(state);
        control
    }

    pub(crate) fn set_state(&self, state: JobState) {
        *lock(&self.state) = state;
    }

    pub(crate) fn state(&self) -> JobState {
        *lock(&self.state)
    }

    pub(crate) fn set_progress(&self, fraction: f64) {
        self.progress.store(fraction.to_bits(), Ordering::Release);
    }

    pub(crate) fn progress(&self) -> f64 {
        f64::from_bits(self.progress.load(Ordering::Acquire))
    }

    pub(crate) fn describe(&self) -> &str {
        &self.describe
    }
}

/// A cancelable, weak handle to a dispatched job.
///
/// The controller does not own the job and does not keep it alive; once the
/// owning record is reset, state queries report [`JobState::Canceled`].
pub struct JobController {
    control: Weak<JobControl>,
}

impl JobController {
    pub(crate) fn attach(control: &Arc<JobControl>) -> JobController {
        JobController {
            control: Arc::downgrade(control),
        }
    }

    /// Requests cooperative cancellation. The job observes it at its next
    /// check-in; this call never blocks and is idempotent.
    pub fn cancel(&self) {
        if let Some(control) = self.control.upgrade() {
            control.cancel.cancel();
        }
    }

    /// Current lifecycle state of the job.
    pub fn state(&self) -> JobState {
        self.control
            .upgrade()
            .map_or(JobState::Canceled, |control| control.state())
    }

    /// Last reported fractional completion in `0.0..=1.0`.
    pub fn progress(&self) -> f64 {
        self.control
            .upgrade()
            .map_or(0.0, |control| control.progress())
    }

    /// The job's one-line description, if it is still alive.
    pub fn describe(&self) -> Option<String> {
        self.control
            .upgrade()
            .map(|control| control.describe().to_owned())
    }
}

impl std::fmt::Debug for JobController {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JobController")
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}
