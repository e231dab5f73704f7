// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! Wire compaction: variable extraction over the memoization trace.

use prism_request::{Identity, Request, RequestKind};
use rustc_hash::{FxHashMap, FxHashSet};
use tracing::debug;

use crate::cache::CompositionCache;

/// A compacted request: nested `Let` bindings around a rewritten body, plus
/// the variable names flagged for progress visibility.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Compacted {
    /// The rewritten request, wrapped in one `Let` per declaration.
    pub request: Request,
    /// Names of variables whose subexpressions were marked reported.
    pub reported: Vec<String>,
}

/// Compacts `top_level` against the memoization trace in `cache`.
///
/// Each memoized subexpression that is reused — or marked reported — becomes
/// one variable declaration; every occurrence elsewhere is replaced by a
/// reference to that variable. Declarations are emitted in the cache's
/// dependency order and wrapped most-recent-innermost, so every variable
/// reference sits inside the scope of its binding. Expanding the result
/// (`Request::expand_lets`) reproduces `top_level` exactly.
pub fn compact<D>(cache: &CompositionCache<D>, top_level: &Request) -> Compacted {
    let memoized: Vec<Request> = cache.order_added().cloned().collect();
    let counts = count_uses(&memoized, top_level);

    let mut subst: FxHashMap<Identity, Request> = FxHashMap::default();
    let mut declarations: Vec<(String, Request)> = Vec::new();
    let mut reported: Vec<String> = Vec::new();
    let mut next_index = 0usize;

    for original in &memoized {
        let rewritten = rewrite(original, &subst);

        // A body that rewrote to a bare variable reference is an alias of an
        // existing declaration; declaring it again would be useless.
        if let RequestKind::Variable(existing) = rewritten.kind() {
            if cache.is_reported(original) && !reported.iter().any(|name| name == existing) {
                reported.push(existing.clone());
            }
            subst.insert(original.identity(), rewritten.clone());
            continue;
        }

        let id = original.identity();
        let reused = counts.get(&id).copied().unwrap_or(0) >= 2;
        let is_reported = cache.is_reported(original);
        // Declare iff reused or reported; anything else stays inline.
        if !reused && !is_reported {
            continue;
        }

        let name = format!("v{next_index}");
        next_index += 1;
        if is_reported {
            reported.push(name.clone());
        }
        subst.insert(id, Request::variable(name.clone()));
        declarations.push((name, rewritten));
    }

    let mut body = rewrite(top_level, &subst);

    // A reported top level needs a stable identifier of its own.
    if cache.is_reported(top_level) {
        if let RequestKind::Variable(existing) = body.kind() {
            if !reported.iter().any(|name| name == existing) {
                reported.push(existing.clone());
            }
        } else {
            let name = format!("v{next_index}");
            declarations.push((name.clone(), body.clone()));
            reported.push(name.clone());
            body = Request::variable(name);
        }
    }

    debug!(
        declarations = declarations.len(),
        reported = reported.len(),
        "compacted request"
    );

    // Declarations were produced in dependency order; wrapping from the most
    // recent inward keeps every reference inside its binding's scope.
    for (name, value) in declarations.into_iter().rev() {
        body = Request::let_binding(name, value, body);
    }

    Compacted {
        request: body,
        reported,
    }
}

/// Substitutes every mapped subexpression with its variable reference.
/// Largest match wins: a substituted node is not descended into.
fn rewrite(request: &Request, subst: &FxHashMap<Identity, Request>) -> Request {
    if let Some(replacement) = subst.get(&request.identity()) {
        return replacement.clone();
    }
    request.map_children(&mut |child| rewrite(child, subst))
}

/// Counts how many times each memoized subexpression occurs across all
/// memoized bodies and the top level. The scan stops at memoized boundaries:
/// occurrences inside a memoized subtree are attributed to that subtree's
/// own body, which mirrors how the compacted form nests.
fn count_uses(memoized: &[Request], top_level: &Request) -> FxHashMap<Identity, usize> {
    let memo_ids: FxHashSet<Identity> = memoized.iter().map(Request::identity).collect();
    let mut counts: FxHashMap<Identity, usize> = FxHashMap::default();

    fn walk(
        node: &Request,
        is_body_root: bool,
        memo_ids: &FxHashSet<Identity>,
        counts: &mut FxHashMap<Identity, usize>,
    ) {
        if !is_body_root && memo_ids.contains(&node.identity()) {
            *counts.entry(node.identity()).or_insert(0) += 1;
            return;
        }
        node.for_each_child(&mut |child| walk(child, false, memo_ids, counts));
    }

    for body in memoized {
        walk(body, true, &memo_ids, &mut counts);
    }
    walk(top_level, false, &memo_ids, &mut counts);
    counts
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::panic)]
mod tests {
    use super::*;
    use crate::cache::CompositionCache;
    use prism_request::Value;

    fn int_leaf(cache: &mut CompositionCache<()>, n: i64) -> Request {
        cache
            .invoke_leaf("int", &[Value::Int(n).identity()], |_| {
                Request::call(
                    "pkg",
                    "app",
                    "make_int",
                    vec![Request::immediate(Value::Int(n))],
                    0,
                )
            })
            .unwrap()
    }

    /// Asserts that every variable reference in `request` is inside the
    /// scope of an enclosing binding for that name.
    fn assert_well_scoped(request: &Request, scope: &mut Vec<String>) {
        match request.kind() {
            RequestKind::Variable(name) => {
                assert!(
                    scope.iter().any(|bound| bound == name),
                    "variable `{name}` referenced outside its binding"
                );
            }
            RequestKind::Let { name, value, body } => {
                assert_well_scoped(value, scope);
                scope.push(name.clone());
                assert_well_scoped(body, scope);
                scope.pop();
            }
            _ => request.for_each_child(&mut |child| assert_well_scoped(child, scope)),
        }
    }

    #[test]
    fn reused_subexpression_becomes_one_declaration() {
        let mut cache = CompositionCache::new(());
        let shared = int_leaf(&mut cache, 7);
        let top = Request::array(vec![shared.clone(), shared.clone()]);

        let compacted = compact(&cache, &top);
        // One Let around an array of two references to the same variable.
        let RequestKind::Let { name, body, .. } = compacted.request.kind() else {
            panic!("expected a Let at the root");
        };
        let RequestKind::Array(items) = body.kind() else {
            panic!("expected the array body");
        };
        assert_eq!(items.len(), 2);
        for item in items {
            assert_eq!(item, &Request::variable(name.clone()));
        }
        assert!(compacted.reported.is_empty());
    }

    #[test]
    fn single_use_unreported_subexpression_stays_inline() {
        let mut cache = CompositionCache::new(());
        let only = int_leaf(&mut cache, 3);
        let top = Request::optional(only.clone());

        let compacted = compact(&cache, &top);
        assert!(
            !matches!(compacted.request.kind(), RequestKind::Let { .. }),
            "no declaration expected for a single-use subexpression"
        );
        assert_eq!(compacted.request, top);
    }

    #[test]
    fn single_use_reported_subexpression_gets_a_variable() {
        let mut cache = CompositionCache::new(());
        let only = int_leaf(&mut cache, 3);
        cache.mark_reported(&only);
        let top = Request::optional(only.clone());

        let compacted = compact(&cache, &top);
        assert_eq!(compacted.reported, vec!["v0".to_owned()]);
        let RequestKind::Let { name, .. } = compacted.request.kind() else {
            panic!("reported subexpression must be declared");
        };
        assert_eq!(name, "v0");
    }

    #[test]
    fn expansion_reproduces_the_original_tree() {
        let mut cache = CompositionCache::new(());
        let top = cache
            .invoke("scene", &[], |cache| {
                let mesh = int_leaf(cache, 1);
                let palette = int_leaf(cache, 2);
                let styled = cache.invoke(
                    "styled",
                    &[mesh.identity(), palette.identity()],
                    |_| Ok(Request::array(vec![mesh.clone(), palette.clone()])),
                )?;
                Ok(Request::structure([
                    ("styled".to_owned(), styled.clone()),
                    ("raw".to_owned(), styled),
                    ("extra".to_owned(), palette.clone()),
                ]))
            })
            .unwrap();

        let compacted = compact(&cache, &top);
        assert_well_scoped(&compacted.request, &mut Vec::new());
        assert_eq!(compacted.request.expand_lets(), top);
    }

    #[test]
    fn nested_memo_entries_inline_through_unshared_wrappers() {
        let mut cache = CompositionCache::new(());
        let shared = int_leaf(&mut cache, 5);
        // The top level IS the shared entry, and it is also referenced from
        // another memoized body, so it gets declared.
        let wrapper = cache
            .invoke("wrapper", &[shared.identity()], |_| {
                Ok(Request::array(vec![shared.clone()]))
            })
            .unwrap();
        let top = Request::array(vec![wrapper, shared.clone()]);

        let compacted = compact(&cache, &top);
        assert_well_scoped(&compacted.request, &mut Vec::new());
        assert_eq!(compacted.request.expand_lets(), top);
    }

    #[test]
    fn reported_top_level_gets_a_synthesized_variable() {
        let mut cache = CompositionCache::new(());
        let top = Request::array(vec![int_leaf(&mut cache, 1)]);
        cache.mark_reported(&top);

        let compacted = compact(&cache, &top);
        assert_eq!(compacted.reported.len(), 1);
        // The body is the synthesized variable; expanding still reproduces
        // the original.
        let RequestKind::Let { body, .. } = compacted.request.kind() else {
            panic!("expected a Let for the synthesized top-level variable");
        };
        assert!(matches!(body.kind(), RequestKind::Variable(_)));
        assert_eq!(compacted.request.expand_lets(), top);
    }

    #[test]
    fn alias_entries_are_not_declared_twice() {
        let mut cache = CompositionCache::new(());
        let original = int_leaf(&mut cache, 9);
        // A second composer that returns the same subexpression unchanged.
        let alias = cache
            .invoke("alias", &[original.identity()], |_| Ok(original.clone()))
            .unwrap();
        assert!(alias.same_node(&original));
        let top = Request::array(vec![original.clone(), alias]);

        let compacted = compact(&cache, &top);
        assert_well_scoped(&compacted.request, &mut Vec::new());
        assert_eq!(compacted.request.expand_lets(), top);
        // Exactly one Let despite two memo entries for the same tree.
        let mut lets = 0;
        fn count_lets(request: &Request, lets: &mut usize) {
            if let RequestKind::Let { value, body, .. } = request.kind() {
                *lets += 1;
                count_lets(value, lets);
                count_lets(body, lets);
            } else {
                request.for_each_child(&mut |child| count_lets(child, lets));
            }
        }
        count_lets(&compacted.request, &mut lets);
        assert_eq!(lets, 1);
    }
}
