// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! Per-composition memo table for composer function calls.

use blake3::Hasher;
use prism_request::{Identity, Request, RequestKind};
use rustc_hash::{FxHashMap, FxHashSet};
use tracing::trace;

/// Identity of one composer call: the composer's name plus the content
/// identities of its arguments (prefix `call:`).
///
/// The data context does not participate — a cache is scoped to exactly one
/// context, so it is implicit in every call id.
pub fn make_call_id(composer: &str, args: &[Identity]) -> Identity {
    let mut hasher = Hasher::new();
    hasher.update(b"call:");
    hasher.update(&(composer.len() as u64).to_be_bytes());
    hasher.update(composer.as_bytes());
    for arg in args {
        hasher.update(arg.as_bytes());
    }
    Identity(hasher.finalize().into())
}

/// A composition-time construction fault. Unrecoverable: the enclosing
/// composition cannot produce a result.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ComposeError {
    /// A composer call tried to use its own result during its own
    /// construction.
    #[error("self-referential composition of `{composer}`")]
    SelfReferential {
        /// Name of the composer that recursed into itself.
        composer: String,
    },
}

struct Entry {
    call: Identity,
    composing: bool,
    result: Option<Request>,
}

/// Memo table for the composer functions sharing one data context `D`.
///
/// One cache value is scoped to one top-level composition; it owns its
/// entries in an arena (`Vec` + identity index), so in-progress detection
/// keys on content identity, never on addresses. Entries are created in the
/// `composing` state before the composer runs, resolved once it returns, and
/// never mutated again.
pub struct CompositionCache<D> {
    context: D,
    entries: Vec<Entry>,
    index: FxHashMap<Identity, usize>,
    order: Vec<usize>,
    reported: FxHashSet<Identity>,
}

impl<D> CompositionCache<D> {
    /// Creates an empty cache owning the composition's data context.
    pub fn new(context: D) -> CompositionCache<D> {
        CompositionCache {
            context,
            entries: Vec::new(),
            index: FxHashMap::default(),
            order: Vec::new(),
            reported: FxHashSet::default(),
        }
    }

    /// The fixed data context this composition shares.
    pub fn context(&self) -> &D {
        &self.context
    }

    /// Memoized composer invocation.
    ///
    /// On a hit the stored request is returned as-is — the composer does not
    /// run again and the returned handle is the cached node. On a miss an
    /// entry is inserted in the `composing` state, `compose` runs (and may
    /// recurse into this cache), and its result is stored and appended to
    /// the dependency order. Hitting an entry that is still `composing` is
    /// the self-referential composition error.
    pub fn invoke<F>(
        &mut self,
        composer: &str,
        args: &[Identity],
        compose: F,
    ) -> Result<Request, ComposeError>
    where
        F: FnOnce(&mut CompositionCache<D>) -> Result<Request, ComposeError>,
    {
        let call = make_call_id(composer, args);
        if let Some(&slot) = self.index.get(&call) {
            let entry = &self.entries[slot];
            if entry.composing {
                return Err(ComposeError::SelfReferential {
                    composer: composer.to_owned(),
                });
            }
            if let Some(result) = &entry.result {
                trace!(composer, "composition cache hit");
                return Ok(result.clone());
            }
        }

        let slot = self.entries.len();
        self.entries.push(Entry {
            call,
            composing: true,
            result: None,
        });
        self.index.insert(call, slot);

        let result = match compose(self) {
            Ok(result) => result,
            Err(err) => {
                // The placeholder stays in the arena as a dead slot; only
                // the index entry must go so a retry starts clean.
                self.index.remove(&call);
                return Err(err);
            }
        };

        let entry = &mut self.entries[slot];
        entry.result = Some(result.clone());
        entry.composing = false;
        self.order.push(slot);
        Ok(result)
    }

    /// Leaf composer invocation: `compose` sees only the data context and
    /// cannot recurse into the cache.
    pub fn invoke_leaf<F>(
        &mut self,
        composer: &str,
        args: &[Identity],
        compose: F,
    ) -> Result<Request, ComposeError>
    where
        F: FnOnce(&D) -> Request,
    {
        self.invoke(composer, args, |cache| Ok(compose(cache.context())))
    }

    /// Flags `request` for progress visibility: the compactor will give it a
    /// stable variable name even if it is used only once.
    pub fn mark_reported(&mut self, request: &Request) {
        self.reported.insert(request.identity());
    }

    /// Whether `request` — or its core under transparent
    /// `Isolated`/`RemoteCalculation`/`Meta` wrappers — is flagged for
    /// progress visibility.
    pub fn is_reported(&self, request: &Request) -> bool {
        self.reported.contains(&request.identity())
            || self.reported.contains(&reporting_core(request).identity())
    }

    /// Memoized requests in dependency order: every subexpression appears
    /// strictly before any expression that references it.
    pub fn order_added(&self) -> impl Iterator<Item = &Request> + '_ {
        self.order
            .iter()
            .filter_map(|&slot| self.entries[slot].result.as_ref())
    }

    /// Number of resolved memo entries.
    pub fn len(&self) -> usize {
        self.order.len()
    }

    /// Returns `true` when nothing has been memoized yet.
    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }
}

impl<D: std::fmt::Debug> std::fmt::Debug for CompositionCache<D> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CompositionCache")
            .field("context", &self.context)
            .field("entries", &self.entries.len())
            .field("order", &self.order.len())
            .finish()
    }
}

/// Peels transparent wrappers for reporting-eligibility checks.
fn reporting_core(request: &Request) -> &Request {
    let mut current = request;
    loop {
        match current.kind() {
            RequestKind::Isolated(child)
            | RequestKind::RemoteCalculation(child)
            | RequestKind::Meta(child) => current = child,
            _ => return current,
        }
    }
}
