// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! The background job contract and its per-run context.

use std::sync::Arc;

use prism_registry::{CalcError, CallContext, CancelToken, Canceled};
use prism_request::{Identity, Value};

use crate::controller::JobControl;
use crate::engine::Engine;

/// Lifecycle of a dispatched job, as observed through its controller.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobState {
    /// Waiting in a queue (or between passes of a multi-phase job).
    Queued,
    /// Executing on a worker thread.
    Running,
    /// Completed and delivered a result.
    Finished,
    /// Completed with a failure.
    Failed,
    /// Canceled before delivering a result.
    Canceled,
}

/// Outcome of one `execute` pass.
#[derive(Debug, Clone, PartialEq)]
pub enum Step {
    /// The job is done; this value becomes the record's result.
    Finished(Value),
    /// The job extended its inputs and wants to run again once they are
    /// ready. The worker re-queues it.
    Pending,
}

/// A stored job failure: the payload surfaced to every observing pointer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FailurePayload {
    /// Stable failure code (`prism-registry`'s `CODE_*` space).
    pub code: u32,
    /// Human-readable description.
    pub message: String,
}

impl FailurePayload {
    /// Builds a failure payload.
    pub fn new(code: u32, message: impl Into<String>) -> FailurePayload {
        FailurePayload {
            code,
            message: message.into(),
        }
    }
}

impl std::fmt::Display for FailurePayload {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "code {}: {}", self.code, self.message)
    }
}

impl From<CalcError> for FailurePayload {
    fn from(err: CalcError) -> FailurePayload {
        FailurePayload {
            code: err.code,
            message: err.message,
        }
    }
}

/// Why a job did not deliver a result.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum JobError {
    /// The job observed cancellation at a check-in. Not a failure: the
    /// record is left restartable.
    #[error("job canceled")]
    Canceled,
    /// The job failed; the payload becomes the record's failure.
    #[error("job failed: {0}")]
    Failed(FailurePayload),
}

impl JobError {
    /// Builds a failure with the execution error code.
    pub fn execution(message: impl Into<String>) -> JobError {
        JobError::Failed(FailurePayload::new(
            prism_registry::CODE_EXECUTION,
            message,
        ))
    }
}

impl From<Canceled> for JobError {
    fn from(_: Canceled) -> JobError {
        JobError::Canceled
    }
}

impl From<CalcError> for JobError {
    fn from(err: CalcError) -> JobError {
        JobError::Failed(err.into())
    }
}

/// A unit of background work owned by the engine once dispatched.
///
/// Jobs operate on private copies of their inputs and communicate results
/// back exclusively through the engine — returning from `execute`, or the
/// progress sink on the context. They never mutate shared state directly.
pub trait BackgroundJob: Send {
    /// Collects (or dispatches) the job's inputs. Runs once, on a worker
    /// thread, before the first `inputs_ready` poll.
    fn gather_inputs(&mut self) {}

    /// Whether every input is settled. Polled by the worker; a not-ready
    /// job rotates to the back of its queue.
    fn inputs_ready(&self) -> bool {
        true
    }

    /// Runs the job. May block on I/O, but must call
    /// [`JobContext::check_in`] at every blocking boundary — that call is
    /// the sole cancellation mechanism.
    fn execute(&mut self, ctx: &JobContext) -> Result<Step, JobError>;

    /// One-line human description, surfaced on the controller and in logs.
    fn describe(&self) -> String;
}

/// Per-run context handed to an executing job.
pub struct JobContext {
    pub(crate) key: Identity,
    pub(crate) engine: Engine,
    pub(crate) control: Arc<JobControl>,
}

impl JobContext {
    /// The record key this job computes.
    pub fn key(&self) -> Identity {
        self.key
    }

    /// Returns `Err(JobError::Canceled)` once cancellation was requested.
    pub fn check_in(&self) -> Result<(), JobError> {
        self.control.cancel.check_in()?;
        Ok(())
    }

    /// The job's cancellation token, for threading into blocking calls.
    pub fn cancel_token(&self) -> &CancelToken {
        &self.control.cancel
    }

    /// Reports fractional completion to the record and the controller.
    pub fn report_progress(&self, fraction: f64) {
        let fraction = fraction.clamp(0.0, 1.0);
        self.control.set_progress(fraction);
        self.engine.report_progress(self.key, fraction);
    }

    /// Bridges this context into the registry's [`CallContext`] so registry
    /// functions see the same cancellation token and progress sink.
    pub fn call_context(&self) -> CallContext {
        let engine = self.engine.clone();
        let key = self.key;
        let control = Arc::clone(&self.control);
        CallContext::new(self.control.cancel.clone(), move |fraction| {
            control.set_progress(fraction);
            engine.report_progress(key, fraction);
        })
    }
}

impl std::fmt::Debug for JobContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JobContext")
            .field("key", &self.key)
            .finish_non_exhaustive()
    }
}
