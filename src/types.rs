//! Core value types shared across the tree, the node database and the
//! storage backends.

use crate::error::TreeError;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Identifier of a committed snapshot. Version numbers start at 1 and grow
/// by exactly one per commit; `0` is only meaningful as the "latest"
/// sentinel accepted by [`crate::MutableTree::load_version`].
pub type Version = u64;

/// SHA-256 digest identifying a node. The hash binds the node's height,
/// size, creation version and either its key/value (leaf) or its child
/// hashes (inner), so a root hash commits to an entire tree.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct NodeHash([u8; NodeHash::LENGTH]);

impl NodeHash {
    /// Digest width in bytes.
    pub const LENGTH: usize = 32;

    /// Wraps a raw digest.
    #[inline]
    pub const fn new(bytes: [u8; Self::LENGTH]) -> Self {
        Self(bytes)
    }

    /// Parses a digest from a byte slice, rejecting any other length.
    pub fn from_slice(bytes: &[u8]) -> Result<Self, TreeError> {
        let raw: [u8; Self::LENGTH] = bytes.try_into().map_err(|_| {
            TreeError::MalformedNode(format!(
                "hash must be {} bytes, got {}",
                Self::LENGTH,
                bytes.len()
            ))
        })?;
        Ok(Self(raw))
    }

    /// Raw digest bytes.
    #[inline]
    pub const fn as_bytes(&self) -> &[u8; Self::LENGTH] {
        &self.0
    }
}

impl AsRef<[u8]> for NodeHash {
    #[inline]
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}

impl fmt::Display for NodeHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&hex::encode(self.0))
    }
}

impl fmt::Debug for NodeHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "NodeHash({})", hex::encode(&self.0[..8]))
    }
}

/// Retention and durability configuration for a [`crate::MutableTree`].
///
/// Two retention axes cooperate:
///
/// 1. **Snapshot cadence** (`keep_every`): versions divisible by
///    `keep_every` are written to the persistent backend and survive
///    restarts.
/// 2. **Recent window** (`keep_recent`): the most recent `keep_recent`
///    versions are additionally kept in the ephemeral backend, so
///    non-snapshot versions stay queryable until they age out.
///
/// With `keep_recent == 0` there is no window to cover the gap between
/// snapshots, so every version must be a snapshot: `keep_every` has to be 1.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Options {
    /// Persist every n-th version to the disk backend.
    pub keep_every: u64,
    /// Number of most recent versions retained in the memory backend.
    pub keep_recent: u64,
    /// Require durable (synced) disk writes before a commit returns.
    pub sync: bool,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            keep_every: 1,
            keep_recent: 0,
            sync: false,
        }
    }
}

impl Options {
    /// Creates a validated retention configuration.
    pub fn new(keep_every: u64, keep_recent: u64, sync: bool) -> Result<Self, TreeError> {
        let opts = Self {
            keep_every,
            keep_recent,
            sync,
        };
        opts.validate()?;
        Ok(opts)
    }

    /// Checks the retention invariants described on the type.
    pub fn validate(&self) -> Result<(), TreeError> {
        if self.keep_every == 0 {
            return Err(TreeError::InvalidOptions(
                "keep_every must be at least 1".into(),
            ));
        }
        if self.keep_recent == 0 && self.keep_every != 1 {
            return Err(TreeError::InvalidOptions(format!(
                "keep_every = {} requires a non-zero recent window",
                self.keep_every
            )));
        }
        Ok(())
    }

    /// Whether `version` is written to the disk backend.
    #[inline]
    pub(crate) fn is_snapshot_version(&self, version: Version) -> bool {
        version % self.keep_every == 0
    }

    /// Whether any versions are kept in the memory backend at all.
    #[inline]
    pub(crate) fn keeps_recent(&self) -> bool {
        self.keep_recent > 0
    }
}
