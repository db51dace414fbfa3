//! Read-only snapshot of one committed version.

use crate::error::TreeError;
use crate::node::Node;
use crate::nodedb::NodeDb;
use crate::tree::proof::{KeyProof, LeafWitness, ProofStep};
use crate::types::{NodeHash, Version};
use sha2::{Digest, Sha256};
use std::sync::Arc;

/// A read-only view of the tree at a single version.
///
/// Cloning is cheap (the node database is shared), and every method takes
/// `&self`: snapshots may be read from any number of threads while the
/// writer moves on. A snapshot stays internally consistent for as long as
/// the caller holds it, provided its version is not deleted out from under
/// long-running reads (single-writer discipline is the caller's contract).
#[derive(Clone, Debug)]
pub struct ImmutableTree {
    root: Option<NodeHash>,
    version: Version,
    ndb: Arc<NodeDb>,
}

impl ImmutableTree {
    pub(crate) fn new(root: Option<NodeHash>, version: Version, ndb: Arc<NodeDb>) -> Self {
        Self { root, version, ndb }
    }

    /// The version this snapshot was committed as.
    #[inline]
    pub fn version(&self) -> Version {
        self.version
    }

    /// Root hash, or `None` for the empty tree.
    #[inline]
    pub fn root_hash(&self) -> Option<NodeHash> {
        self.root
    }

    fn root_node(&self) -> Result<Option<Arc<Node>>, TreeError> {
        match self.root {
            Some(hash) => Ok(Some(self.ndb.get_node(&hash)?)),
            None => Ok(None),
        }
    }

    /// Number of keys in this snapshot.
    pub fn size(&self) -> Result<i64, TreeError> {
        Ok(self.root_node()?.map_or(0, |root| root.size))
    }

    /// Whether `key` exists.
    pub fn has(&self, key: &[u8]) -> Result<bool, TreeError> {
        match self.root_node()? {
            Some(root) => root.has(&self.ndb, key),
            None => Ok(false),
        }
    }

    /// Looks up `key`, returning its zero-based in-order rank (or insertion
    /// rank) and the value when present.
    pub fn get(&self, key: &[u8]) -> Result<(i64, Option<Vec<u8>>), TreeError> {
        match self.root_node()? {
            Some(root) => root.get(&self.ndb, key),
            None => Ok((0, None)),
        }
    }

    /// Returns the `index`-th key/value pair in key order.
    pub fn get_by_index(&self, index: i64) -> Result<Option<(Vec<u8>, Vec<u8>)>, TreeError> {
        match self.root_node()? {
            Some(root) => {
                if index < 0 {
                    return Ok(None);
                }
                root.get_by_index(&self.ndb, index)
            }
            None => Ok(None),
        }
    }

    /// In-order traversal over all keys. The callback returns `true` to
    /// stop; the result reports whether it did.
    pub fn iterate<F>(&self, cb: F) -> Result<bool, TreeError>
    where
        F: FnMut(&[u8], &[u8]) -> bool,
    {
        self.iterate_range(None, None, true, false, cb)
    }

    /// In-order traversal over `[start, end)` (`[start, end]` when
    /// `inclusive`), descending when `ascending` is false. Unbounded sides
    /// are `None`. Only leaves reach the callback.
    pub fn iterate_range<F>(
        &self,
        start: Option<&[u8]>,
        end: Option<&[u8]>,
        ascending: bool,
        inclusive: bool,
        mut cb: F,
    ) -> Result<bool, TreeError>
    where
        F: FnMut(&[u8], &[u8]) -> bool,
    {
        let Some(root) = self.root_node()? else {
            return Ok(false);
        };
        let mut visit = |node: &Node, _depth: u8| -> bool {
            if !node.is_leaf() {
                return false;
            }
            let value = node.value.as_deref().unwrap_or_default();
            cb(&node.key, value)
        };
        root.traverse_in_range(&self.ndb, start, end, ascending, inclusive, 0, &mut visit)
    }

    /// Looks up `key` and assembles a path proof for its presence or
    /// absence against this snapshot's root hash.
    pub fn get_with_proof(&self, key: &[u8]) -> Result<(Option<Vec<u8>>, KeyProof), TreeError> {
        let Some(root) = self.root_node()? else {
            return Ok((
                None,
                KeyProof {
                    steps: Vec::new(),
                    leaf: None,
                },
            ));
        };

        let mut steps = Vec::new();
        let mut node = root;
        while !node.is_leaf() {
            let (next, sibling, sibling_on_left) = if key < node.key.as_slice() {
                (node.left_hash(), node.right_hash(), false)
            } else {
                (node.right_hash(), node.left_hash(), true)
            };
            steps.push(ProofStep {
                height: node.height,
                size: node.size,
                version: node.version,
                sibling: sibling.ok_or(TreeError::EmptyChildHash)?,
                sibling_on_left,
            });
            let next = next.ok_or(TreeError::EmptyChildHash)?;
            node = self.ndb.get_node(&next)?;
        }
        steps.reverse();

        let leaf_value = node
            .value
            .as_deref()
            .ok_or_else(|| TreeError::MalformedNode("leaf without value".into()))?;
        let witness = LeafWitness {
            key: node.key.clone(),
            value_hash: Sha256::digest(leaf_value).into(),
            version: node.version,
        };
        let value = if node.key == key {
            Some(leaf_value.to_vec())
        } else {
            None
        };
        Ok((
            value,
            KeyProof {
                steps,
                leaf: Some(witness),
            },
        ))
    }
}
