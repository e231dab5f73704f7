// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! Content-addressed calculation request trees for Prism.
//!
//! `prism-request` provides the three types every other Prism crate is built
//! on: [`Value`] — the structurally comparable, hashable, serializable data
//! tree; [`Identity`] — a 32-byte BLAKE3 content hash with domain-separated
//! constructors; and [`Request`] — an immutable, shareable expression tree
//! describing a computation.
//!
//! # Identity Invariant
//!
//! Structurally equal values and requests compare equal and hash equal no
//! matter where or how they were built. Every cache in the system (memo
//! tables, result records, wire compaction) keys on this invariant. Identity
//! hashes are computed over a deterministic canonical byte encoding, never
//! over in-memory layout.
//!
//! # Sharing Model
//!
//! A [`Request`] is an `Arc`-backed handle: clones are reference bumps, the
//! tree is immutable once constructed, and arbitrarily many callers may hold
//! the same node. [`Request::same_node`] exposes pointer identity for callers
//! (the composition cache) that need to observe "this is the cached object",
//! while `==` stays structural.
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
    clippy::unreadable_literal,
    clippy::missing_const_for_fn,
    clippy::redundant_pub_crate,
    clippy::module_name_repetitions,
    clippy::missing_errors_doc,
    clippy::use_self
)]

mod ident;
mod request;
mod value;

pub use ident::{make_entity_id, EntityId, Hash, Identity};
pub use request::{Request, RequestError, RequestKind};
pub use value::{Value, ValueTypeError};
