// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! Identity and hashing utilities.

use blake3::Hasher;
use serde::{Deserialize, Serialize};

/// Canonical 256-bit hash used throughout Prism for addressing values,
/// requests, composer calls, and cache records.
pub type Hash = [u8; 32];

/// Content identity of a value, request, or composer call.
///
/// Thin newtype over a 32-byte BLAKE3 hash. The inner bytes are public for
/// zero-cost access; the `Display` impl renders lowercase hex for logging and
/// error messages. Identities are always produced with a domain prefix
/// (`value:`, `request:`, `call:`, `entity:`) so hashes from different
/// namespaces can never collide.
#[repr(transparent)]
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Debug, Serialize, Deserialize)]
pub struct Identity(pub Hash);

impl Identity {
    /// Returns the canonical byte representation of this identity.
    pub fn as_bytes(&self) -> &Hash {
        &self.0
    }

    /// Hashes `payload` under the given domain prefix.
    ///
    /// The prefix is fed to the hasher before the payload, so identical
    /// payloads under different domains produce unrelated identities.
    pub fn in_domain(domain: &str, payload: &[u8]) -> Identity {
        let mut hasher = Hasher::new();
        hasher.update(domain.as_bytes());
        hasher.update(payload);
        Identity(hasher.finalize().into())
    }
}

impl std::fmt::Display for Identity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        for byte in &self.0 {
            write!(f, "{byte:02x}")?;
        }
        Ok(())
    }
}

/// Strongly typed identifier for a mutable entity.
///
/// Entities are application objects whose value legitimately changes over
/// time; the mutable entity cache keys on `EntityId` rather than content
/// identity precisely because the content is not stable. Using a dedicated
/// wrapper prevents accidental mixing of entity and content identifiers.
#[repr(transparent)]
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Debug, Serialize, Deserialize)]
pub struct EntityId(pub Hash);

impl EntityId {
    /// Returns the canonical byte representation of this id.
    pub fn as_bytes(&self) -> &Hash {
        &self.0
    }
}

impl std::fmt::Display for EntityId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        for byte in &self.0 {
            write!(f, "{byte:02x}")?;
        }
        Ok(())
    }
}

/// Produces a stable, domain-separated entity identifier (prefix `entity:`)
/// using BLAKE3.
pub fn make_entity_id(label: &str) -> EntityId {
    let mut hasher = Hasher::new();
    hasher.update(b"entity:");
    hasher.update(label.as_bytes());
    EntityId(hasher.finalize().into())
}
