//! Error types surfaced by the tree and the storage contract.

use crate::types::{NodeHash, Version};
use thiserror::Error;

/// Failure reported by a storage backend.
///
/// Backends are free to carry whatever detail they need in the message; the
/// tree never inspects it beyond propagation.
#[derive(Debug, Error)]
#[error("storage backend error: {0}")]
pub struct StoreError(pub String);

/// Error type for all tree and node-database operations.
#[derive(Debug, Error)]
pub enum TreeError {
    /// A node failed to decode, or decoded into an illegal shape.
    #[error("malformed node: {0}")]
    MalformedNode(String),

    /// A referenced node is absent from the cache and from both backends.
    #[error("node {0} missing from all backends")]
    MissingNode(NodeHash),

    /// The requested version is not retained by any backend.
    #[error("version {0} does not exist")]
    VersionDoesNotExist(Version),

    /// The version is real but the operation on it is illegal, e.g.
    /// deleting the latest version or committing over an existing one.
    #[error("invalid version {version}: {reason}")]
    InvalidVersion {
        /// The offending version.
        version: Version,
        /// Why the operation was refused.
        reason: String,
    },

    /// Rejected retention configuration.
    #[error("invalid options: {0}")]
    InvalidOptions(String),

    /// Propagated backend failure.
    #[error(transparent)]
    Store(#[from] StoreError),

    /// Leaf nodes are never cloned; a fresh leaf is created instead. An
    /// attempt to clone one signals a bug in the caller.
    #[error("attempt to clone a leaf node")]
    CannotCloneLeaf,

    /// An inner node was hashed or serialized while a child hash was still
    /// unset. Treated as corruption: the surrounding commit is aborted.
    #[error("found an empty child hash")]
    EmptyChildHash,
}

impl TreeError {
    pub(crate) fn invalid_version(version: Version, reason: impl Into<String>) -> Self {
        Self::InvalidVersion {
            version,
            reason: reason.into(),
        }
    }
}
