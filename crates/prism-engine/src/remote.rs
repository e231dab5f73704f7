// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! The seam between the engine and off-process execution.

use prism_request::Value;

use crate::job::{JobContext, JobError};

/// A fully resolved function call ready for off-process execution.
#[derive(Debug, Clone, PartialEq)]
pub struct RemoteCall {
    /// Publishing account of the function package.
    pub account: String,
    /// Application (package) name within the account.
    pub app: String,
    /// Function name in the provider's registry.
    pub name: String,
    /// Already-resolved argument values.
    pub args: Vec<Value>,
    /// Opaque interface level, forwarded unchanged.
    pub level: u32,
}

/// Executes calls out of process.
///
/// Implementations block the calling thread — remote-calculation jobs run
/// on dedicated threads precisely so that blocking here is cheap. Progress
/// from the far side is pumped into the job context; cancellation is
/// observed through the context's check-ins.
pub trait RemoteBackend: Send + Sync {
    /// Submits `call` and blocks until it yields a value or fails.
    fn submit(&self, call: RemoteCall, ctx: &JobContext) -> Result<Value, JobError>;
}
