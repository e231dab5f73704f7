// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! The self-describing data tree Prism computations produce and consume.

use std::collections::BTreeMap;
use std::hash::{Hash as StdHash, Hasher};

use bytes::Bytes;
use serde::{Deserialize, Serialize};

use crate::ident::Identity;

/// Canonical-encoding tag bytes, one per [`Value`] variant.
const TAG_NULL: u8 = 0x00;
const TAG_BOOL: u8 = 0x01;
const TAG_INT: u8 = 0x02;
const TAG_FLOAT: u8 = 0x03;
const TAG_TEXT: u8 = 0x04;
const TAG_BYTES: u8 = 0x05;
const TAG_LIST: u8 = 0x06;
const TAG_MAP: u8 = 0x07;

/// A self-describing data tree: the result type of every Prism computation
/// and the payload type of every `Immediate` request leaf.
///
/// Equality and hashing are structural. Floats compare and hash by bit
/// pattern so that equal values always hash equal; as with the engine's
/// other float handling, distinct NaN bit patterns are distinct values.
/// Maps are string-keyed and ordered (`BTreeMap`), which keeps both the
/// canonical encoding and serde output deterministic.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Value {
    /// The absent value. `Required` request nodes reject it.
    Null,
    /// A boolean.
    Bool(bool),
    /// A signed integer.
    Int(i64),
    /// A double-precision float. Compares and hashes by bit pattern.
    Float(f64),
    /// A UTF-8 string.
    Text(String),
    /// An opaque byte blob.
    Bytes(Bytes),
    /// An ordered list.
    List(Vec<Value>),
    /// A string-keyed, ordered map.
    Map(BTreeMap<String, Value>),
}

impl Value {
    /// Content identity of this value (prefix `value:`).
    pub fn identity(&self) -> Identity {
        Identity::in_domain("value:", &self.canonical_bytes())
    }

    /// Deterministic canonical encoding used exclusively for hashing.
    ///
    /// Tagged, length-prefixed, big-endian. Two values encode to the same
    /// bytes iff they are structurally equal, so this is the substrate of
    /// the identity invariant. Wire serialization goes through serde/CBOR
    /// instead; the two encodings are independent.
    pub fn canonical_bytes(&self) -> Vec<u8> {
        let mut out = Vec::new();
        self.write_canonical(&mut out);
        out
    }

    pub(crate) fn write_canonical(&self, out: &mut Vec<u8>) {
        match self {
            Value::Null => out.push(TAG_NULL),
            Value::Bool(b) => {
                out.push(TAG_BOOL);
                out.push(u8::from(*b));
            }
            Value::Int(n) => {
                out.push(TAG_INT);
                out.extend_from_slice(&n.to_be_bytes());
            }
            Value::Float(f) => {
                out.push(TAG_FLOAT);
                out.extend_from_slice(&f.to_bits().to_be_bytes());
            }
            Value::Text(s) => {
                out.push(TAG_TEXT);
                write_len_prefixed(s.as_bytes(), out);
            }
            Value::Bytes(b) => {
                out.push(TAG_BYTES);
                write_len_prefixed(b, out);
            }
            Value::List(items) => {
                out.push(TAG_LIST);
                out.extend_from_slice(&(items.len() as u64).to_be_bytes());
                for item in items {
                    item.write_canonical(out);
                }
            }
            Value::Map(map) => {
                out.push(TAG_MAP);
                out.extend_from_slice(&(map.len() as u64).to_be_bytes());
                // BTreeMap iteration order is the canonical key order.
                for (key, value) in map {
                    write_len_prefixed(key.as_bytes(), out);
                    value.write_canonical(out);
                }
            }
        }
    }

    /// Returns the variant name, for error messages.
    pub fn kind_name(&self) -> &'static str {
        match self {
            Value::Null => "null",
            Value::Bool(_) => "bool",
            Value::Int(_) => "int",
            Value::Float(_) => "float",
            Value::Text(_) => "text",
            Value::Bytes(_) => "bytes",
            Value::List(_) => "list",
            Value::Map(_) => "map",
        }
    }

    /// Returns `true` for [`Value::Null`].
    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }
}

fn write_len_prefixed(bytes: &[u8], out: &mut Vec<u8>) {
    out.extend_from_slice(&(bytes.len() as u64).to_be_bytes());
    out.extend_from_slice(bytes);
}

impl PartialEq for Value {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Value::Null, Value::Null) => true,
            (Value::Bool(a), Value::Bool(b)) => a == b,
            (Value::Int(a), Value::Int(b)) => a == b,
            // Bit equality keeps `eq` consistent with `hash`.
            (Value::Float(a), Value::Float(b)) => a.to_bits() == b.to_bits(),
            (Value::Text(a), Value::Text(b)) => a == b,
            (Value::Bytes(a), Value::Bytes(b)) => a == b,
            (Value::List(a), Value::List(b)) => a == b,
            (Value::Map(a), Value::Map(b)) => a == b,
            _ => false,
        }
    }
}

impl Eq for Value {}

impl StdHash for Value {
    fn hash<H: Hasher>(&self, state: &mut H) {
        match self {
            Value::Null => state.write_u8(TAG_NULL),
            Value::Bool(b) => {
                state.write_u8(TAG_BOOL);
                b.hash(state);
            }
            Value::Int(n) => {
                state.write_u8(TAG_INT);
                n.hash(state);
            }
            Value::Float(f) => {
                state.write_u8(TAG_FLOAT);
                f.to_bits().hash(state);
            }
            Value::Text(s) => {
                state.write_u8(TAG_TEXT);
                s.hash(state);
            }
            Value::Bytes(b) => {
                state.write_u8(TAG_BYTES);
                b.hash(state);
            }
            Value::List(items) => {
                state.write_u8(TAG_LIST);
                items.hash(state);
            }
            Value::Map(map) => {
                state.write_u8(TAG_MAP);
                map.hash(state);
            }
        }
    }
}

/// A typed read of a [`Value`] found a different variant than expected.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("expected {expected} value, found {found}")]
pub struct ValueTypeError {
    /// The variant the caller asked for.
    pub expected: &'static str,
    /// The variant actually present.
    pub found: &'static str,
}

impl TryFrom<Value> for i64 {
    type Error = ValueTypeError;

    fn try_from(value: Value) -> Result<Self, Self::Error> {
        match value {
            Value::Int(n) => Ok(n),
            other => Err(ValueTypeError {
                expected: "int",
                found: other.kind_name(),
            }),
        }
    }
}

impl TryFrom<Value> for f64 {
    type Error = ValueTypeError;

    fn try_from(value: Value) -> Result<Self, Self::Error> {
        match value {
            Value::Float(f) => Ok(f),
            other => Err(ValueTypeError {
                expected: "float",
                found: other.kind_name(),
            }),
        }
    }
}

impl TryFrom<Value> for bool {
    type Error = ValueTypeError;

    fn try_from(value: Value) -> Result<Self, Self::Error> {
        match value {
            Value::Bool(b) => Ok(b),
            other => Err(ValueTypeError {
                expected: "bool",
                found: other.kind_name(),
            }),
        }
    }
}

impl TryFrom<Value> for String {
    type Error = ValueTypeError;

    fn try_from(value: Value) -> Result<Self, Self::Error> {
        match value {
            Value::Text(s) => Ok(s),
            other => Err(ValueTypeError {
                expected: "text",
                found: other.kind_name(),
            }),
        }
    }
}

impl From<i64> for Value {
    fn from(n: i64) -> Self {
        Value::Int(n)
    }
}

impl From<f64> for Value {
    fn from(f: f64) -> Self {
        Value::Float(f)
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Value::Bool(b)
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::Text(s.to_owned())
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Value::Text(s)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::float_cmp)]
mod tests {
    use super::*;
    use std::collections::hash_map::DefaultHasher;

    fn hash_of(v: &Value) -> u64 {
        let mut hasher = DefaultHasher::new();
        v.hash(&mut hasher);
        hasher.finish()
    }

    #[test]
    fn structural_equality_implies_equal_identity_and_hash() {
        let a = Value::Map(BTreeMap::from([
            ("x".to_owned(), Value::Int(1)),
            ("y".to_owned(), Value::List(vec![Value::Bool(true), Value::Null])),
        ]));
        // Built in a different insertion order on purpose.
        let b = Value::Map(BTreeMap::from([
            ("y".to_owned(), Value::List(vec![Value::Bool(true), Value::Null])),
            ("x".to_owned(), Value::Int(1)),
        ]));
        assert_eq!(a, b);
        assert_eq!(a.identity(), b.identity());
        assert_eq!(hash_of(&a), hash_of(&b));
    }

    #[test]
    fn distinct_values_get_distinct_identities() {
        let ints = Value::List(vec![Value::Int(1), Value::Int(2)]);
        let texts = Value::List(vec![Value::Text("1".into()), Value::Text("2".into())]);
        assert_ne!(ints.identity(), texts.identity());
        // Scalar vs single-element list must not collide either.
        assert_ne!(Value::Int(1).identity(), Value::List(vec![Value::Int(1)]).identity());
    }

    #[test]
    fn float_equality_is_bitwise() {
        assert_eq!(Value::Float(1.5), Value::Float(1.5));
        assert_ne!(Value::Float(0.0), Value::Float(-0.0));
        assert_eq!(
            hash_of(&Value::Float(2.25)),
            hash_of(&Value::Float(2.25))
        );
    }

    #[test]
    fn typed_reads_report_the_found_variant() {
        let err = i64::try_from(Value::Text("nope".into())).unwrap_err();
        assert_eq!(err.expected, "int");
        assert_eq!(err.found, "text");
        assert_eq!(i64::try_from(Value::Int(7)).unwrap(), 7);
    }

    #[test]
    fn canonical_encoding_is_stable() {
        let v = Value::Map(BTreeMap::from([("k".to_owned(), Value::Int(3))]));
        assert_eq!(v.canonical_bytes(), v.canonical_bytes());
        // Map tag, one entry, key "k", int 3.
        let bytes = v.canonical_bytes();
        assert_eq!(bytes[0], 0x07);
        assert_eq!(&bytes[1..9], 1u64.to_be_bytes().as_slice());
    }
}
