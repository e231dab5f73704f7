// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! Composition-time memoization and wire compaction for request trees.
//!
//! Application code builds request trees through composer functions that all
//! share one data context. [`CompositionCache`] memoizes those composer
//! calls so a shared subexpression is constructed once and every caller
//! receives the same node; [`compact`] then turns the memoization trace into
//! nested `Let` bindings, so a tree with heavy internal sharing travels the
//! wire without duplicating its shared subtrees.
//!
//! # Ordering Invariant
//!
//! [`CompositionCache::order_added`] is a valid dependency order: a memoized
//! subexpression appears strictly before any memoized expression that
//! references it. An entry is appended only after its composer returns, so
//! everything the composer invoked transitively was appended first. The
//! compactor relies on this order exactly; it must be preserved.
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

mod cache;
mod compact;

pub use cache::{make_call_id, ComposeError, CompositionCache};
pub use compact::{compact, Compacted};
