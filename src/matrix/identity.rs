//! Content-addressed experiment identities.
//!
//! An identity is the SHA-256 of the compact JSON serialization of exactly the
//! parameters that influence a derived dataset. Keys are serialized through a
//! `BTreeMap`, so the digest never depends on declaration order.

use std::fmt;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::types::{ParamGroup, RunSpec};

/// Which derived artifact an identity addresses.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IdentityScope {
    /// Training data: pre-split and split parameters
    Train,
    /// Test data: everything that shapes the dataset
    Test,
}

impl IdentityScope {
    pub fn groups(self) -> &'static [ParamGroup] {
        match self {
            IdentityScope::Train => &[ParamGroup::PreSplit, ParamGroup::Split],
            IdentityScope::Test => &[
                ParamGroup::PreSplit,
                ParamGroup::Split,
                ParamGroup::PostSplit,
                ParamGroup::Test,
            ],
        }
    }
}

/// Lowercase hex digest used as a cache key and path component.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct HashedIdentity(String);

impl HashedIdentity {
    pub fn derive(spec: &RunSpec, scope: IdentityScope) -> Self {
        let scoped = spec.scoped(scope.groups());
        let canonical =
            serde_json::to_vec(&scoped).expect("string-keyed map of scalar ParamValues always serializes to JSON");
        Self::of_bytes(&canonical)
    }

    pub fn of_bytes(bytes: &[u8]) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(bytes);
        HashedIdentity(hex::encode(hasher.finalize()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// First 12 hex chars, for log lines.
    pub fn short(&self) -> &str {
        &self.0[..12.min(self.0.len())]
    }
}

impl fmt::Display for HashedIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}
