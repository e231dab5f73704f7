// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! The immutable, content-addressable calculation request tree.

use std::collections::BTreeMap;
use std::hash::{Hash as StdHash, Hasher};
use std::sync::{Arc, OnceLock};

use serde::{Deserialize, Serialize};

use crate::ident::{EntityId, Identity};
use crate::value::Value;

const TAG_IMMEDIATE: u8 = 0x01;
const TAG_CALL: u8 = 0x02;
const TAG_ARRAY: u8 = 0x03;
const TAG_STRUCTURE: u8 = 0x04;
const TAG_PROPERTY: u8 = 0x05;
const TAG_UNION: u8 = 0x06;
const TAG_OPTIONAL: u8 = 0x07;
const TAG_REQUIRED: u8 = 0x08;
const TAG_ISOLATED: u8 = 0x09;
const TAG_REMOTE: u8 = 0x0a;
const TAG_META: u8 = 0x0b;
const TAG_IMMUTABLE_REF: u8 = 0x0c;
const TAG_OBJECT_REF: u8 = 0x0d;
const TAG_VARIABLE: u8 = 0x0e;
const TAG_LET: u8 = 0x0f;

/// One node kind of a [`Request`] tree.
///
/// Payloads are fixed structs per case; nothing here requires runtime type
/// inspection beyond the tag. Child links are `Request` handles, so a kind
/// value is itself cheap to clone.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum RequestKind {
    /// A literal value, already computed.
    Immediate(Value),
    /// A call into the function registry of the named account/app.
    FunctionCall {
        /// Publishing account of the function package.
        account: String,
        /// Application (package) name within the account.
        app: String,
        /// Function name within the package.
        name: String,
        /// Argument subrequests, resolved before the call runs.
        args: Vec<Request>,
        /// Opaque interface level, carried through to the wire unchanged.
        level: u32,
    },
    /// An ordered collection of subrequests.
    Array(Vec<Request>),
    /// A string-keyed collection of subrequests.
    Structure(BTreeMap<String, Request>),
    /// A field access on the resolved value of `base`.
    Property {
        /// Request whose resolved value is read.
        base: Request,
        /// Field name to extract.
        field: String,
    },
    /// A tagged-union wrap of a member request.
    Union {
        /// Member name the value is wrapped under.
        member: String,
        /// The wrapped request.
        value: Request,
    },
    /// Marks the child's value as optional; `Null` passes through.
    Optional(Request),
    /// Unwraps an optional; resolving to `Null` is a failure.
    Required(Request),
    /// Resolution boundary: the subtree is cached independently.
    Isolated(Request),
    /// Forces off-process execution of the child.
    RemoteCalculation(Request),
    /// A request whose resolved value is itself an encoded request to
    /// resolve.
    Meta(Request),
    /// Reference to an already-cached immutable result.
    ImmutableRef(Identity),
    /// Reference to a mutable entity's latest value.
    ObjectRef(EntityId),
    /// A compaction variable reference.
    Variable(String),
    /// A compaction variable binding: `body` with `name` bound to `value`.
    Let {
        /// Variable name introduced for `body`.
        name: String,
        /// The bound subexpression.
        value: Request,
        /// The expression the binding scopes over.
        body: Request,
    },
}

impl RequestKind {
    /// Returns the variant name, for logs and error messages.
    pub fn name(&self) -> &'static str {
        match self {
            RequestKind::Immediate(_) => "immediate",
            RequestKind::FunctionCall { .. } => "function-call",
            RequestKind::Array(_) => "array",
            RequestKind::Structure(_) => "structure",
            RequestKind::Property { .. } => "property",
            RequestKind::Union { .. } => "union",
            RequestKind::Optional(_) => "optional",
            RequestKind::Required(_) => "required",
            RequestKind::Isolated(_) => "isolated",
            RequestKind::RemoteCalculation(_) => "remote-calculation",
            RequestKind::Meta(_) => "meta",
            RequestKind::ImmutableRef(_) => "immutable-ref",
            RequestKind::ObjectRef(_) => "object-ref",
            RequestKind::Variable(_) => "variable",
            RequestKind::Let { .. } => "let",
        }
    }
}

#[derive(Debug)]
struct Inner {
    kind: RequestKind,
    identity: OnceLock<Identity>,
}

/// An immutable, content-addressable description of a computation.
///
/// `Request` is an `Arc`-backed handle: clones are reference bumps and the
/// tree is shared read-only across arbitrarily many callers. `==` is
/// structural (via content identity, with a pointer fast path); use
/// [`Request::same_node`] to observe whether two handles share one
/// allocation.
#[derive(Clone)]
pub struct Request {
    inner: Arc<Inner>,
}

impl Request {
    fn from_kind(kind: RequestKind) -> Request {
        Request {
            inner: Arc::new(Inner {
                kind,
                identity: OnceLock::new(),
            }),
        }
    }

    /// A literal value leaf.
    pub fn immediate(value: impl Into<Value>) -> Request {
        Request::from_kind(RequestKind::Immediate(value.into()))
    }

    /// A registry function call.
    pub fn call(
        account: impl Into<String>,
        app: impl Into<String>,
        name: impl Into<String>,
        args: Vec<Request>,
        level: u32,
    ) -> Request {
        Request::from_kind(RequestKind::FunctionCall {
            account: account.into(),
            app: app.into(),
            name: name.into(),
            args,
            level,
        })
    }

    /// An ordered collection node.
    pub fn array(items: Vec<Request>) -> Request {
        Request::from_kind(RequestKind::Array(items))
    }

    /// A string-keyed collection node.
    pub fn structure(fields: impl IntoIterator<Item = (String, Request)>) -> Request {
        Request::from_kind(RequestKind::Structure(fields.into_iter().collect()))
    }

    /// A field access on `base`'s resolved value.
    pub fn property(base: Request, field: impl Into<String>) -> Request {
        Request::from_kind(RequestKind::Property {
            base,
            field: field.into(),
        })
    }

    /// A tagged-union wrap.
    pub fn union(member: impl Into<String>, value: Request) -> Request {
        Request::from_kind(RequestKind::Union {
            member: member.into(),
            value,
        })
    }

    /// Marks `child` as optional.
    pub fn optional(child: Request) -> Request {
        Request::from_kind(RequestKind::Optional(child))
    }

    /// Unwraps an optional `child`; `Null` becomes a resolution failure.
    pub fn required(child: Request) -> Request {
        Request::from_kind(RequestKind::Required(child))
    }

    /// Marks `child` as an independent caching boundary.
    pub fn isolated(child: Request) -> Request {
        Request::from_kind(RequestKind::Isolated(child))
    }

    /// Forces off-process execution of `child`.
    pub fn remote(child: Request) -> Request {
        Request::from_kind(RequestKind::RemoteCalculation(child))
    }

    /// A request whose resolved value is itself an encoded request.
    pub fn meta(generator: Request) -> Request {
        Request::from_kind(RequestKind::Meta(generator))
    }

    /// Reference to an already-cached immutable result.
    pub fn immutable_ref(id: Identity) -> Request {
        Request::from_kind(RequestKind::ImmutableRef(id))
    }

    /// Reference to a mutable entity's latest value.
    pub fn object_ref(id: EntityId) -> Request {
        Request::from_kind(RequestKind::ObjectRef(id))
    }

    /// A compaction variable reference.
    pub fn variable(name: impl Into<String>) -> Request {
        Request::from_kind(RequestKind::Variable(name.into()))
    }

    /// A compaction variable binding.
    pub fn let_binding(name: impl Into<String>, value: Request, body: Request) -> Request {
        Request::from_kind(RequestKind::Let {
            name: name.into(),
            value,
            body,
        })
    }

    /// The node kind of this request.
    pub fn kind(&self) -> &RequestKind {
        &self.inner.kind
    }

    /// Content identity of this request (prefix `request:`), computed once
    /// per node and cached.
    pub fn identity(&self) -> Identity {
        *self
            .inner
            .identity
            .get_or_init(|| Identity::in_domain("request:", &self.canonical_bytes()))
    }

    /// Returns `true` when both handles share one allocation.
    ///
    /// This is strictly stronger than `==`: structurally equal trees built
    /// at different sites compare equal but are not the same node.
    pub fn same_node(&self, other: &Request) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    /// Deterministic canonical encoding used exclusively for hashing.
    pub fn canonical_bytes(&self) -> Vec<u8> {
        let mut out = Vec::new();
        self.write_canonical(&mut out);
        out
    }

    fn write_canonical(&self, out: &mut Vec<u8>) {
        match self.kind() {
            RequestKind::Immediate(value) => {
                out.push(TAG_IMMEDIATE);
                value.write_canonical(out);
            }
            RequestKind::FunctionCall {
                account,
                app,
                name,
                args,
                level,
            } => {
                out.push(TAG_CALL);
                write_text(account, out);
                write_text(app, out);
                write_text(name, out);
                out.extend_from_slice(&level.to_be_bytes());
                out.extend_from_slice(&(args.len() as u64).to_be_bytes());
                for arg in args {
                    arg.write_canonical(out);
                }
            }
            RequestKind::Array(items) => {
                out.push(TAG_ARRAY);
                out.extend_from_slice(&(items.len() as u64).to_be_bytes());
                for item in items {
                    item.write_canonical(out);
                }
            }
            RequestKind::Structure(fields) => {
                out.push(TAG_STRUCTURE);
                out.extend_from_slice(&(fields.len() as u64).to_be_bytes());
                for (key, value) in fields {
                    write_text(key, out);
                    value.write_canonical(out);
                }
            }
            RequestKind::Property { base, field } => {
                out.push(TAG_PROPERTY);
                write_text(field, out);
                base.write_canonical(out);
            }
            RequestKind::Union { member, value } => {
                out.push(TAG_UNION);
                write_text(member, out);
                value.write_canonical(out);
            }
            RequestKind::Optional(child) => {
                out.push(TAG_OPTIONAL);
                child.write_canonical(out);
            }
            RequestKind::Required(child) => {
                out.push(TAG_REQUIRED);
                child.write_canonical(out);
            }
            RequestKind::Isolated(child) => {
                out.push(TAG_ISOLATED);
                child.write_canonical(out);
            }
            RequestKind::RemoteCalculation(child) => {
                out.push(TAG_REMOTE);
                child.write_canonical(out);
            }
            RequestKind::Meta(generator) => {
                out.push(TAG_META);
                generator.write_canonical(out);
            }
            RequestKind::ImmutableRef(id) => {
                out.push(TAG_IMMUTABLE_REF);
                out.extend_from_slice(id.as_bytes());
            }
            RequestKind::ObjectRef(id) => {
                out.push(TAG_OBJECT_REF);
                out.extend_from_slice(id.as_bytes());
            }
            RequestKind::Variable(name) => {
                out.push(TAG_VARIABLE);
                write_text(name, out);
            }
            RequestKind::Let { name, value, body } => {
                out.push(TAG_LET);
                write_text(name, out);
                value.write_canonical(out);
                body.write_canonical(out);
            }
        }
    }

    /// Rebuilds this node with each direct child replaced by `f(child)`.
    ///
    /// Returns the original handle (same allocation) when no child changed,
    /// so unmodified subtrees keep their sharing and cached identities.
    pub fn map_children<F: FnMut(&Request) -> Request>(&self, f: &mut F) -> Request {
        match self.kind() {
            RequestKind::Immediate(_)
            | RequestKind::ImmutableRef(_)
            | RequestKind::ObjectRef(_)
            | RequestKind::Variable(_) => self.clone(),
            RequestKind::FunctionCall {
                account,
                app,
                name,
                args,
                level,
            } => {
                let mapped: Vec<Request> = args.iter().map(&mut *f).collect();
                if mapped.iter().zip(args).all(|(m, a)| m.same_node(a)) {
                    self.clone()
                } else {
                    Request::call(account.clone(), app.clone(), name.clone(), mapped, *level)
                }
            }
            RequestKind::Array(items) => {
                let mapped: Vec<Request> = items.iter().map(&mut *f).collect();
                if mapped.iter().zip(items).all(|(m, i)| m.same_node(i)) {
                    self.clone()
                } else {
                    Request::array(mapped)
                }
            }
            RequestKind::Structure(fields) => {
                let mapped: BTreeMap<String, Request> = fields
                    .iter()
                    .map(|(key, value)| (key.clone(), f(value)))
                    .collect();
                if mapped
                    .iter()
                    .zip(fields)
                    .all(|((_, m), (_, v))| m.same_node(v))
                {
                    self.clone()
                } else {
                    Request::from_kind(RequestKind::Structure(mapped))
                }
            }
            RequestKind::Property { base, field } => {
                let mapped = f(base);
                if mapped.same_node(base) {
                    self.clone()
                } else {
                    Request::property(mapped, field.clone())
                }
            }
            RequestKind::Union { member, value } => {
                let mapped = f(value);
                if mapped.same_node(value) {
                    self.clone()
                } else {
                    Request::union(member.clone(), mapped)
                }
            }
            RequestKind::Optional(child) => {
                let mapped = f(child);
                if mapped.same_node(child) {
                    self.clone()
                } else {
                    Request::optional(mapped)
                }
            }
            RequestKind::Required(child) => {
                let mapped = f(child);
                if mapped.same_node(child) {
                    self.clone()
                } else {
                    Request::required(mapped)
                }
            }
            RequestKind::Isolated(child) => {
                let mapped = f(child);
                if mapped.same_node(child) {
                    self.clone()
                } else {
                    Request::isolated(mapped)
                }
            }
            RequestKind::RemoteCalculation(child) => {
                let mapped = f(child);
                if mapped.same_node(child) {
                    self.clone()
                } else {
                    Request::remote(mapped)
                }
            }
            RequestKind::Meta(generator) => {
                let mapped = f(generator);
                if mapped.same_node(generator) {
                    self.clone()
                } else {
                    Request::meta(mapped)
                }
            }
            RequestKind::Let { name, value, body } => {
                let mapped_value = f(value);
                let mapped_body = f(body);
                if mapped_value.same_node(value) && mapped_body.same_node(body) {
                    self.clone()
                } else {
                    Request::let_binding(name.clone(), mapped_value, mapped_body)
                }
            }
        }
    }

    /// Visits each direct child of this node, in canonical order.
    pub fn for_each_child<F: FnMut(&Request)>(&self, f: &mut F) {
        match self.kind() {
            RequestKind::Immediate(_)
            | RequestKind::ImmutableRef(_)
            | RequestKind::ObjectRef(_)
            | RequestKind::Variable(_) => {}
            RequestKind::FunctionCall { args, .. } => args.iter().for_each(|arg| f(arg)),
            RequestKind::Array(items) => items.iter().for_each(|item| f(item)),
            RequestKind::Structure(fields) => fields.values().for_each(|value| f(value)),
            RequestKind::Property { base, .. } => f(base),
            RequestKind::Union { value, .. } => f(value),
            RequestKind::Optional(child)
            | RequestKind::Required(child)
            | RequestKind::Isolated(child)
            | RequestKind::RemoteCalculation(child)
            | RequestKind::Meta(child) => f(child),
            RequestKind::Let { value, body, .. } => {
                f(value);
                f(body);
            }
        }
    }

    /// Inlines every `Let` binding, substituting variables with their bound
    /// bodies (innermost binding wins). Unbound variables are left intact.
    ///
    /// This is the inverse of wire compaction: expanding a compacted request
    /// reproduces the tree the compactor started from.
    pub fn expand_lets(&self) -> Request {
        fn go(req: &Request, scope: &mut Vec<(String, Request)>) -> Request {
            match req.kind() {
                RequestKind::Variable(name) => scope
                    .iter()
                    .rev()
                    .find(|(bound_name, _)| bound_name == name)
                    .map_or_else(|| req.clone(), |(_, bound)| bound.clone()),
                RequestKind::Let { name, value, body } => {
                    // The bound value is resolved in the enclosing scope.
                    let bound = go(value, scope);
                    scope.push((name.clone(), bound));
                    let out = go(body, scope);
                    scope.pop();
                    out
                }
                _ => req.map_children(&mut |child| go(child, scope)),
            }
        }
        go(self, &mut Vec::new())
    }

    /// Encodes this request as CBOR. This is the encoding `Meta` generators
    /// produce and the wire carries.
    pub fn encode_cbor(&self) -> Result<Vec<u8>, RequestError> {
        let mut out = Vec::new();
        ciborium::ser::into_writer(self, &mut out)
            .map_err(|err| RequestError::Encode(err.to_string()))?;
        Ok(out)
    }

    /// Decodes a request from its CBOR encoding.
    pub fn decode_cbor(bytes: &[u8]) -> Result<Request, RequestError> {
        ciborium::de::from_reader(bytes).map_err(|err| RequestError::Decode(err.to_string()))
    }
}

fn write_text(text: &str, out: &mut Vec<u8>) {
    out.extend_from_slice(&(text.len() as u64).to_be_bytes());
    out.extend_from_slice(text.as_bytes());
}

impl PartialEq for Request {
    fn eq(&self, other: &Self) -> bool {
        self.same_node(other) || self.identity() == other.identity()
    }
}

impl Eq for Request {}

impl StdHash for Request {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.identity().0.hash(state);
    }
}

impl std::fmt::Debug for Request {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.inner.kind.fmt(f)
    }
}

impl Serialize for Request {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        self.inner.kind.serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for Request {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        RequestKind::deserialize(deserializer).map(Request::from_kind)
    }
}

/// Request encode/decode failure.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RequestError {
    /// CBOR encoding failed.
    #[error("request encode failed: {0}")]
    Encode(String),
    /// CBOR decoding failed.
    #[error("request decode failed: {0}")]
    Decode(String),
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use std::collections::hash_map::DefaultHasher;

    fn double_of(n: i64) -> Request {
        Request::call("pkg", "app", "double", vec![Request::immediate(Value::Int(n))], 1)
    }

    fn hash_of(r: &Request) -> u64 {
        let mut hasher = DefaultHasher::new();
        r.hash(&mut hasher);
        hasher.finish()
    }

    #[test]
    fn structurally_equal_trees_compare_and_hash_equal() {
        let a = double_of(21);
        let b = double_of(21);
        assert!(!a.same_node(&b));
        assert_eq!(a, b);
        assert_eq!(a.identity(), b.identity());
        assert_eq!(hash_of(&a), hash_of(&b));
    }

    #[test]
    fn different_trees_differ() {
        assert_ne!(double_of(21), double_of(22));
        assert_ne!(
            Request::isolated(double_of(21)),
            Request::remote(double_of(21))
        );
        assert_ne!(
            Request::array(vec![double_of(21)]),
            double_of(21),
            "a wrapper node must not collide with its child"
        );
    }

    #[test]
    fn clones_share_the_node() {
        let a = double_of(3);
        let b = a.clone();
        assert!(a.same_node(&b));
        assert_eq!(a, b);
    }

    #[test]
    fn cbor_round_trip_preserves_identity() {
        let original = Request::structure([
            ("lhs".to_owned(), double_of(2)),
            ("rhs".to_owned(), Request::optional(Request::immediate(Value::Null))),
        ]);
        let bytes = original.encode_cbor().unwrap();
        let decoded = Request::decode_cbor(&bytes).unwrap();
        assert_eq!(original, decoded);
        assert_eq!(original.identity(), decoded.identity());
    }

    #[test]
    fn map_children_preserves_untouched_nodes() {
        let tree = Request::array(vec![double_of(1), double_of(2)]);
        let unchanged = tree.map_children(&mut |child: &Request| child.clone());
        assert!(unchanged.same_node(&tree));

        let swapped = tree.map_children(&mut |child| {
            if *child == double_of(1) {
                double_of(9)
            } else {
                child.clone()
            }
        });
        assert!(!swapped.same_node(&tree));
        assert_eq!(swapped, Request::array(vec![double_of(9), double_of(2)]));
    }

    #[test]
    fn expand_lets_substitutes_bindings() {
        let body = Request::array(vec![Request::variable("v0"), Request::variable("v0")]);
        let bound = Request::let_binding("v0", double_of(5), body);
        let expanded = bound.expand_lets();
        assert_eq!(
            expanded,
            Request::array(vec![double_of(5), double_of(5)])
        );
    }

    #[test]
    fn expand_lets_innermost_binding_wins() {
        let inner = Request::let_binding("x", double_of(2), Request::variable("x"));
        let outer = Request::let_binding("x", double_of(1), inner);
        assert_eq!(outer.expand_lets(), double_of(2));
    }

    #[test]
    fn expand_lets_leaves_unbound_variables_intact() {
        let free = Request::variable("free");
        assert_eq!(free.expand_lets(), free);
    }

    #[test]
    fn let_value_is_resolved_in_the_enclosing_scope() {
        // let x = 1 in let y = x in y  ==>  1
        let tree = Request::let_binding(
            "x",
            Request::immediate(Value::Int(1)),
            Request::let_binding("y", Request::variable("x"), Request::variable("y")),
        );
        assert_eq!(tree.expand_lets(), Request::immediate(Value::Int(1)));
    }
}
