// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! Wire schema for the Prism calc provider channel.
//!
//! Two roles share this schema over a persistent byte stream: the
//! supervisor (embeds the execution engine, sends work) and the provider
//! (hosts the function registry, executes it). Exactly one calculation is in
//! flight per connection at a time; liveness pings are answered immediately
//! even while a calculation runs.
//!
//! Supervisor → provider: [`Message::Function`], [`Message::Ping`].
//! Provider → supervisor: [`Message::Registration`] (once, at connect),
//! [`Message::Progress`], [`Message::Result`], [`Message::Failure`],
//! [`Message::Pong`].
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

use serde::{Deserialize, Serialize};

use prism_request::Value;

pub mod wire;

/// A function call for the provider to execute (op tag `0x01`).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FunctionPayload {
    /// Publishing account of the function package.
    pub account: String,
    /// Application (package) name within the account.
    pub app: String,
    /// Function name to look up in the provider's registry.
    pub name: String,
    /// Already-resolved argument values.
    pub args: Vec<Value>,
    /// Opaque interface level, forwarded unchanged.
    pub level: u32,
}

/// Liveness probe (op tag `0x02`). The provider answers with a
/// [`PongPayload`] carrying the same nonce, without waiting for any
/// in-progress calculation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PingPayload {
    /// Echoed back verbatim in the pong.
    pub nonce: u64,
}

/// Provider self-identification, sent exactly once at connect (op tag
/// `0x10`).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegistrationPayload {
    /// Stable identity of the provider process.
    pub provider_id: String,
}

/// Fractional completion of the in-flight calculation (op tag `0x11`).
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ProgressPayload {
    /// Completion in `0.0..=1.0`.
    pub fraction: f64,
}

/// Successful calculation result (op tag `0x12`). Terminal for the
/// in-flight calculation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResultPayload {
    /// The computed value.
    pub value: Value,
}

/// Calculation failure (op tag `0x13`). Terminal for the in-flight
/// calculation; the connection itself stays usable.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FailurePayload {
    /// Stable failure code (see `prism-registry`'s `CODE_*` constants).
    pub code: u32,
    /// Human-readable description.
    pub message: String,
}

/// Liveness answer (op tag `0x14`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PongPayload {
    /// The nonce from the ping being answered.
    pub nonce: u64,
}

/// Wire message kinds carried in tagged frames.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Message {
    /// Execute a function call (supervisor → provider).
    Function(FunctionPayload),
    /// Liveness probe (supervisor → provider).
    Ping(PingPayload),
    /// Provider self-identification (provider → supervisor, once).
    Registration(RegistrationPayload),
    /// Progress of the in-flight calculation (provider → supervisor).
    Progress(ProgressPayload),
    /// Successful result (provider → supervisor).
    Result(ResultPayload),
    /// Calculation failure (provider → supervisor).
    Failure(FailurePayload),
    /// Liveness answer (provider → supervisor).
    Pong(PongPayload),
}

impl Message {
    /// Canonical frame tag for this message kind.
    pub fn tag(&self) -> u8 {
        match self {
            Message::Function(_) => wire::TAG_FUNCTION,
            Message::Ping(_) => wire::TAG_PING,
            Message::Registration(_) => wire::TAG_REGISTRATION,
            Message::Progress(_) => wire::TAG_PROGRESS,
            Message::Result(_) => wire::TAG_RESULT,
            Message::Failure(_) => wire::TAG_FAILURE,
            Message::Pong(_) => wire::TAG_PONG,
        }
    }
}
