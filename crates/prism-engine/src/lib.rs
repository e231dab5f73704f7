// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! Background execution engine for Prism.
//!
//! The engine owns typed job queues and a map of result records keyed by
//! content identity. Callers express interest through [`DataPointer`]s and
//! drive work through [`Engine::dispatch`]; jobs run on worker threads and
//! report back exclusively through the engine's entry points
//! ([`Engine::set_result`], [`Engine::report_progress`],
//! [`Engine::reset_record`]). The interactive thread never blocks on job
//! completion — it polls or waits explicitly on a pointer.
//!
//! # At-Most-Once Computation
//!
//! For any record key there is at most one job computing it at a time: a
//! dispatch for a key that is already `Computing` is a no-op that returns
//! the live job's controller. The guarantee is enforced by the lock around
//! record creation and state transitions, never by locking around job
//! bodies.
//!
//! # Queue Classes
//!
//! [`QueueKind`] partitions work by resource class — calculation, disk,
//! web reads, web writes — each with its own fixed worker pool, so disk
//! contention never starves network reads. `NotificationWatch` and
//! `RemoteCalculation` jobs are long-lived and get one dedicated thread per
//! job instead of pool scheduling.
//!
//! # Cancellation
//!
//! Cancellation is cooperative: a job observes it only at
//! [`JobContext::check_in`]. A canceled job leaves its record in the
//! `Canceled` overlay; [`Engine::reset_record`] returns it to `Nowhere` so
//! a later caller can restart the computation.
#![forbid(unsafe_code)]
#![deny(missing_docs, rust_2018_idioms, unused_must_use)]
#![deny(
    clippy::all,
    clippy::pedantic,
    clippy::nursery,
    clippy::cargo,
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::panic,
    clippy::todo,
    clippy::unimplemented,
    clippy::dbg_macro,
    clippy::print_stdout,
    clippy::print_stderr
)]
#![allow(
    clippy::must_use_candidate,
    clippy::return_self_not_must_use,
    clippy::missing_const_for_fn,
    clippy::module_name_repetitions,
    clippy::missing_errors_doc,
    clippy::significant_drop_tightening,
    clippy::option_if_let_else,
    clippy::use_self
)]

mod controller;
mod engine;
mod job;
mod mutable;
mod pointer;
mod queue;
mod remote;
mod resolve;

pub use controller::JobController;
pub use engine::{Engine, EngineConfig, RecordState};
pub use job::{BackgroundJob, FailurePayload, JobContext, JobError, JobState, Step};
pub use mutable::{MutableCache, RefreshFlags, WatchHandle};
pub use pointer::{DataPointer, TypedPointer};
pub use queue::{Priority, QueueKind};
pub use remote::{RemoteBackend, RemoteCall};
pub use resolve::{ResolutionRecord, ResolutionState, Resolver};

use std::sync::{Mutex, MutexGuard, PoisonError};

/// Locks a mutex, taking the data as-is if a worker panicked while holding
/// it. Engine state stays consistent under its own invariants, not the
/// poison flag.
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
