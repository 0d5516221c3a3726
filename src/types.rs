//! Identifier value objects shared across the data path.

use serde::{Deserialize, Serialize};

/// Backend shard identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ShardId(pub u32);

impl std::fmt::Display for ShardId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "shard.{}", self.0)
    }
}

/// Placement policy identifier (a "pool").
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PolicyId(pub u64);

impl std::fmt::Display for PolicyId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "policy.{}", self.0)
    }
}

/// Router transaction id, unique for the lifetime of a router.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Tid(pub u64);

impl std::fmt::Display for Tid {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "tid.{}", self.0)
    }
}

/// Backend object name.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ObjectId(String);

impl ObjectId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for ObjectId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ObjectId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for ObjectId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

/// An object together with the placement policy it lives under.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ObjectLocator {
    pub oid: ObjectId,
    pub policy: PolicyId,
}

impl ObjectLocator {
    pub fn new(oid: impl Into<ObjectId>, policy: PolicyId) -> Self {
        Self {
            oid: oid.into(),
            policy,
        }
    }

    /// Ordering token pinning all requests for this object to one target.
    pub fn ordering_token(&self) -> OrderingToken {
        OrderingToken(self.oid.as_str().to_string())
    }
}

impl std::fmt::Display for ObjectLocator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.policy, self.oid)
    }
}

/// Key that pins a sequence of requests to one target and preserves their
/// submission order at the backend.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct OrderingToken(pub String);

impl From<&ObjectId> for OrderingToken {
    fn from(oid: &ObjectId) -> Self {
        Self(oid.as_str().to_string())
    }
}

/// Acknowledgement strength requested for a mutation.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Durability {
    /// Applied at the primary target
    #[default]
    Applied,
    /// Committed to a majority of the acting set
    Committed,
}

/// Semantic rejection reasons reported by the backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RejectCode {
    NotFound,
    InvalidArgument,
    NoSpace,
    PermissionDenied,
    Other(i32),
}

impl std::fmt::Display for RejectCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RejectCode::NotFound => write!(f, "not found"),
            RejectCode::InvalidArgument => write!(f, "invalid argument"),
            RejectCode::NoSpace => write!(f, "no space"),
            RejectCode::PermissionDenied => write!(f, "permission denied"),
            RejectCode::Other(code) => write!(f, "error {}", code),
        }
    }
}
