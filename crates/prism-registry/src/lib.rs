// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! Function registry contract shared by in-process jobs and calc providers.
//!
//! A [`Registry`] maps function names to [`CalcFunction`] implementations.
//! Functions receive a [`CallContext`] carrying the cooperative cancellation
//! token and the progress sink; long-running functions are expected to call
//! [`CallContext::check_in`] at every blocking boundary — that call is the
//! sole cancellation mechanism, there is no preemption.
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
    clippy::use_self
)]

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use prism_request::Value;
use rustc_hash::FxHashMap;

/// The calculation was canceled through its [`CancelToken`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("canceled")]
pub struct Canceled;

/// Cooperative cancellation flag, shared between a job and its controller.
///
/// Cancellation is a request, not an interrupt: the running calculation
/// observes it only at its next [`check_in`](CancelToken::check_in).
#[derive(Debug, Clone, Default)]
pub struct CancelToken {
    flag: Arc<AtomicBool>,
}

impl CancelToken {
    /// Creates a fresh, un-canceled token.
    pub fn new() -> CancelToken {
        CancelToken::default()
    }

    /// Requests cancellation. Idempotent.
    pub fn cancel(&self) {
        self.flag.store(true, Ordering::Release);
    }

    /// Returns `true` once cancellation has been requested.
    pub fn is_canceled(&self) -> bool {
        self.flag.load(Ordering::Acquire)
    }

    /// Returns `Err(Canceled)` once cancellation has been requested.
    ///
    /// Calculations call this at every blocking boundary and propagate the
    /// error with `?`.
    pub fn check_in(&self) -> Result<(), Canceled> {
        if self.is_canceled() {
            Err(Canceled)
        } else {
            Ok(())
        }
    }
}

/// Per-call context handed to every registry function.
pub struct CallContext {
    cancel: CancelToken,
    progress: Box<dyn Fn(f64) + Send + Sync>,
}

impl CallContext {
    /// Builds a context from a cancellation token and a progress sink.
    pub fn new(cancel: CancelToken, progress: impl Fn(f64) + Send + Sync + 'static) -> CallContext {
        CallContext {
            cancel,
            progress: Box::new(progress),
        }
    }

    /// A context that ignores progress and is never canceled. Test helper
    /// and default for fire-and-forget calls.
    pub fn detached() -> CallContext {
        CallContext::new(CancelToken::new(), |_| {})
    }

    /// See [`CancelToken::check_in`].
    pub fn check_in(&self) -> Result<(), Canceled> {
        self.cancel.check_in()
    }

    /// The underlying cancellation token.
    pub fn cancel_token(&self) -> &CancelToken {
        &self.cancel
    }

    /// Reports fractional completion in `0.0..=1.0`.
    pub fn report_progress(&self, fraction: f64) {
        (self.progress)(fraction.clamp(0.0, 1.0));
    }
}

impl std::fmt::Debug for CallContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CallContext")
            .field("cancel", &self.cancel)
            .finish_non_exhaustive()
    }
}

/// The function was not found in the registry.
pub const CODE_UNKNOWN_FUNCTION: u32 = 1;
/// Argument count or types did not match what the function expects.
pub const CODE_BAD_ARGUMENTS: u32 = 2;
/// The function itself failed.
pub const CODE_EXECUTION: u32 = 3;

/// A calculation failure, with a stable numeric code for the wire.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("calculation failed (code {code}): {message}")]
pub struct CalcError {
    /// Stable failure code (`CODE_*`).
    pub code: u32,
    /// Human-readable description.
    pub message: String,
}

impl CalcError {
    /// Builds a failure with the given code.
    pub fn new(code: u32, message: impl Into<String>) -> CalcError {
        CalcError {
            code,
            message: message.into(),
        }
    }

    /// The canonical "no such function" failure.
    pub fn unknown_function(name: &str) -> CalcError {
        CalcError::new(CODE_UNKNOWN_FUNCTION, format!("unknown function `{name}`"))
    }

    /// The canonical bad-arguments failure.
    pub fn bad_arguments(detail: impl Into<String>) -> CalcError {
        CalcError::new(CODE_BAD_ARGUMENTS, detail)
    }
}

/// A callable calculation function.
///
/// Implemented for any `Fn(&CallContext, &[Value]) -> Result<Value,
/// CalcError>` closure, so registries are usually populated with plain
/// closures.
pub trait CalcFunction: Send + Sync {
    /// Executes the function over already-resolved argument values.
    fn call(&self, ctx: &CallContext, args: &[Value]) -> Result<Value, CalcError>;
}

impl<F> CalcFunction for F
where
    F: Fn(&CallContext, &[Value]) -> Result<Value, CalcError> + Send + Sync,
{
    fn call(&self, ctx: &CallContext, args: &[Value]) -> Result<Value, CalcError> {
        self(ctx, args)
    }
}

/// Name-keyed registry of calculation functions.
///
/// The registry is populated once at startup and then shared read-only
/// (`Arc<Registry>`) by the engine's in-process jobs and by provider worker
/// threads.
#[derive(Default)]
pub struct Registry {
    functions: FxHashMap<String, Arc<dyn CalcFunction>>,
}

impl Registry {
    /// Creates an empty registry.
    pub fn new() -> Registry {
        Registry::default()
    }

    /// Registers `function` under `name`, replacing any previous entry.
    pub fn register(&mut self, name: impl Into<String>, function: impl CalcFunction + 'static) {
        self.functions.insert(name.into(), Arc::new(function));
    }

    /// Looks up a function by name.
    pub fn lookup(&self, name: &str) -> Option<Arc<dyn CalcFunction>> {
        self.functions.get(name).cloned()
    }

    /// Number of registered functions.
    pub fn len(&self) -> usize {
        self.functions.len()
    }

    /// Returns `true` when no functions are registered.
    pub fn is_empty(&self) -> bool {
        self.functions.is_empty()
    }
}

impl std::fmt::Debug for Registry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Registry")
            .field("functions", &self.functions.len())
            .finish()
    }
}
