//! Error types for the object storage client

use std::sync::Arc;

use thiserror::Error;

use crate::types::{PolicyId, RejectCode, ShardId, Tid};

/// Result type alias using our Error type
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur on the client data path
#[derive(Error, Debug)]
pub enum Error {
    // =========================================================================
    // Routing Errors
    // =========================================================================
    /// Shard failed and the retry bound was exhausted
    #[error("Target unreachable for object {object} after {attempts} attempts (last shard: {shard:?})")]
    TargetUnreachable {
        object: String,
        shard: Option<ShardId>,
        attempts: u32,
    },

    /// Backend rejected the operation as referring to an obsolete topology
    #[error("Stale epoch for object {object}: no snapshot newer than {epoch} arrived in time")]
    StaleEpoch { object: String, epoch: u64 },

    /// Operation was cancelled before completion
    #[error("Operation {tid} cancelled")]
    Cancelled { tid: Tid },

    /// Backend returned a semantic error unrelated to topology
    #[error("Backend rejected operation on {object}: {code} ({message})")]
    BackendRejected {
        object: String,
        code: RejectCode,
        message: String,
    },

    /// Placement policy is not part of the current topology
    #[error("Placement policy not found: {0}")]
    PolicyNotFound(PolicyId),

    /// Messaging layer refused a session or a send
    #[error("Transport error: {0}")]
    Transport(String),

    // =========================================================================
    // Extent Errors
    // =========================================================================
    /// Extent reconstruction found an uncovered or doubly covered range
    #[error("Extent gap in [{offset}, {offset}+{length}): {reason}")]
    GapError {
        offset: u64,
        length: u64,
        reason: String,
    },

    /// Striping parameters are not usable
    #[error("Invalid stripe layout: {0}")]
    InvalidLayout(String),

    // =========================================================================
    // Cache Errors
    // =========================================================================
    /// A read or flush sub-request failed terminally
    #[error("Cache I/O failed for object {object}: {source}")]
    CacheIo {
        object: String,
        #[source]
        source: Arc<Error>,
    },

    // =========================================================================
    // Ambient Errors
    // =========================================================================
    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Wrap a sub-request failure into a cache error for `object`.
    pub fn cache_io(object: impl Into<String>, source: Error) -> Self {
        Self::cache_io_shared(object, Arc::new(source))
    }

    /// Same as [`Error::cache_io`] for a failure observed by several waiters.
    pub fn cache_io_shared(object: impl Into<String>, source: Arc<Error>) -> Self {
        Error::CacheIo {
            object: object.into(),
            source,
        }
    }

    /// Build a gap error for the range `[offset, offset + length)`.
    pub fn gap(offset: u64, length: u64, reason: impl Into<String>) -> Self {
        Error::GapError {
            offset,
            length,
            reason: reason.into(),
        }
    }

    /// True for errors the backend reported as a missing object.
    pub fn is_not_found(&self) -> bool {
        matches!(
            self,
            Error::BackendRejected {
                code: RejectCode::NotFound,
                ..
            }
        )
    }
}

impl From<serde_yaml::Error> for Error {
    fn from(e: serde_yaml::Error) -> Self {
        Error::Config(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cache_io_keeps_source() {
        let err = Error::cache_io(
            "10.00000000",
            Error::TargetUnreachable {
                object: "10.00000000".into(),
                shard: Some(ShardId(3)),
                attempts: 4,
            },
        );
        let source = std::error::Error::source(&err).map(|s| s.to_string());
        assert!(source.unwrap().contains("after 4 attempts"));
    }

    #[test]
    fn test_not_found_detection() {
        let err = Error::BackendRejected {
            object: "obj".into(),
            code: RejectCode::NotFound,
            message: "no such object".into(),
        };
        assert!(err.is_not_found());
        assert!(!Error::Internal("x".into()).is_not_found());
    }

    #[test]
    fn test_gap_display() {
        let err = Error::gap(100, 50, "missing 10 bytes at 120");
        assert_eq!(
            err.to_string(),
            "Extent gap in [100, 100+50): missing 10 bytes at 120"
        );
    }
}
