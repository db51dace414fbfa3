//! In-memory tree nodes.
//!
//! A node is either a leaf (height 0, size 1, key and value) or an inner
//! node (key = smallest key of its right subtree, two children). Children
//! of committed nodes are referenced by hash and resolved on demand through
//! the node database; only working-copy nodes own their children directly.
//!
//! Nodes are immutable once hashed: every mutation path goes through
//! [`Node::clone_for`] (inner nodes) or builds a fresh leaf.

use crate::encoding;
use crate::error::TreeError;
use crate::nodedb::NodeDb;
use crate::types::{NodeHash, Version};
use sha2::{Digest, Sha256};
use std::cmp::Ordering;
use std::fmt;
use std::ops::Deref;
use std::sync::Arc;

/// Link from an inner node to one of its children.
pub(crate) enum Child {
    /// A committed node, resolved through the node database when needed.
    Hash(NodeHash),
    /// An owned working-copy node that has not been committed yet.
    Node(Box<Node>),
}

impl Child {
    /// The child's hash, if it is already known.
    pub(crate) fn hash(&self) -> Option<NodeHash> {
        match self {
            Child::Hash(h) => Some(*h),
            Child::Node(node) => node.hash,
        }
    }
}

impl fmt::Debug for Child {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Child::Hash(h) => write!(f, "Child::Hash({})", h),
            Child::Node(n) => write!(f, "Child::Node({:?})", n),
        }
    }
}

/// Resolved handle to a node: either borrowed from the working tree or
/// shared out of the node database.
pub(crate) enum NodeRef<'a> {
    Borrowed(&'a Node),
    Shared(Arc<Node>),
}

impl Deref for NodeRef<'_> {
    type Target = Node;

    fn deref(&self) -> &Node {
        match self {
            NodeRef::Borrowed(node) => node,
            NodeRef::Shared(node) => node,
        }
    }
}

/// A node of the versioned AVL tree.
pub(crate) struct Node {
    pub key: Vec<u8>,
    /// `Some` for leaves, `None` for inner nodes.
    pub value: Option<Vec<u8>>,
    /// Version at which this node was created.
    pub version: Version,
    pub height: i8,
    /// Number of leaves under this node (1 for a leaf).
    pub size: i64,
    /// Set lazily at commit time; a node with a hash is immutable.
    pub hash: Option<NodeHash>,
    pub left: Option<Child>,
    pub right: Option<Child>,
    /// Written to at least one backend.
    pub saved: bool,
    /// Written to the disk backend.
    pub persisted: bool,
}

impl Node {
    /// Creates a fresh leaf at `version`.
    pub(crate) fn new_leaf(key: Vec<u8>, value: Vec<u8>, version: Version) -> Self {
        Self {
            key,
            value: Some(value),
            version,
            height: 0,
            size: 1,
            hash: None,
            left: None,
            right: None,
            saved: false,
            persisted: false,
        }
    }

    #[inline]
    pub(crate) fn is_leaf(&self) -> bool {
        self.height == 0
    }

    /// Shallow copy of an inner node at a new version, with the hash
    /// cleared. Cloning a leaf is a caller bug: leaf mutations always build
    /// a fresh leaf instead.
    pub(crate) fn clone_for(&self, version: Version) -> Result<Box<Node>, TreeError> {
        if self.is_leaf() {
            return Err(TreeError::CannotCloneLeaf);
        }
        let left = self.left_hash().ok_or(TreeError::EmptyChildHash)?;
        let right = self.right_hash().ok_or(TreeError::EmptyChildHash)?;
        Ok(Box::new(Node {
            key: self.key.clone(),
            value: None,
            version,
            height: self.height,
            size: self.size,
            hash: None,
            left: Some(Child::Hash(left)),
            right: Some(Child::Hash(right)),
            saved: false,
            persisted: false,
        }))
    }

    /// Copy with children demoted to hash references, suitable for sharing
    /// through the node cache.
    pub(crate) fn detached(&self) -> Result<Node, TreeError> {
        let (left, right) = if self.is_leaf() {
            (None, None)
        } else {
            let left = self.left_hash().ok_or(TreeError::EmptyChildHash)?;
            let right = self.right_hash().ok_or(TreeError::EmptyChildHash)?;
            (Some(Child::Hash(left)), Some(Child::Hash(right)))
        };
        Ok(Node {
            key: self.key.clone(),
            value: self.value.clone(),
            version: self.version,
            height: self.height,
            size: self.size,
            hash: self.hash,
            left,
            right,
            saved: self.saved,
            persisted: self.persisted,
        })
    }

    pub(crate) fn left_hash(&self) -> Option<NodeHash> {
        self.left.as_ref().and_then(Child::hash)
    }

    pub(crate) fn right_hash(&self) -> Option<NodeHash> {
        self.right.as_ref().and_then(Child::hash)
    }

    /// Resolves the left child, borrowing the in-memory node when present
    /// and falling back to the node database.
    pub(crate) fn left_node<'a>(&'a self, ndb: &NodeDb) -> Result<NodeRef<'a>, TreeError> {
        Self::resolve(self.left.as_ref(), ndb)
    }

    /// Resolves the right child.
    pub(crate) fn right_node<'a>(&'a self, ndb: &NodeDb) -> Result<NodeRef<'a>, TreeError> {
        Self::resolve(self.right.as_ref(), ndb)
    }

    fn resolve<'a>(child: Option<&'a Child>, ndb: &NodeDb) -> Result<NodeRef<'a>, TreeError> {
        match child {
            Some(Child::Node(node)) => Ok(NodeRef::Borrowed(node)),
            Some(Child::Hash(hash)) => Ok(NodeRef::Shared(ndb.get_node(hash)?)),
            None => Err(TreeError::EmptyChildHash),
        }
    }

    /// Whether `key` exists under this node.
    pub(crate) fn has(&self, ndb: &NodeDb, key: &[u8]) -> Result<bool, TreeError> {
        if self.key == key {
            return Ok(true);
        }
        if self.is_leaf() {
            return Ok(false);
        }
        if key < self.key.as_slice() {
            self.left_node(ndb)?.has(ndb, key)
        } else {
            self.right_node(ndb)?.has(ndb, key)
        }
    }

    /// Looks `key` up under this node, returning its zero-based in-order
    /// rank (or the rank it would be inserted at) and its value if present.
    pub(crate) fn get(
        &self,
        ndb: &NodeDb,
        key: &[u8],
    ) -> Result<(i64, Option<Vec<u8>>), TreeError> {
        if self.is_leaf() {
            return Ok(match self.key.as_slice().cmp(key) {
                Ordering::Less => (1, None),
                Ordering::Greater => (0, None),
                Ordering::Equal => (0, self.value.clone()),
            });
        }
        if key < self.key.as_slice() {
            self.left_node(ndb)?.get(ndb, key)
        } else {
            let right = self.right_node(ndb)?;
            let (rank, value) = right.get(ndb, key)?;
            Ok((rank + self.size - right.size, value))
        }
    }

    /// Returns the `index`-th leaf in key order, or `None` when out of
    /// range.
    pub(crate) fn get_by_index(
        &self,
        ndb: &NodeDb,
        index: i64,
    ) -> Result<Option<(Vec<u8>, Vec<u8>)>, TreeError> {
        if self.is_leaf() {
            if index == 0 {
                let value = self
                    .value
                    .clone()
                    .ok_or_else(|| TreeError::MalformedNode("leaf without value".into()))?;
                return Ok(Some((self.key.clone(), value)));
            }
            return Ok(None);
        }
        let left = self.left_node(ndb)?;
        if index < left.size {
            left.get_by_index(ndb, index)
        } else {
            let offset = left.size;
            self.right_node(ndb)?.get_by_index(ndb, index - offset)
        }
    }

    /// Recomputes height and size from the resolved children.
    pub(crate) fn calc_height_and_size(&mut self, ndb: &NodeDb) -> Result<(), TreeError> {
        let (left_height, left_size) = {
            let left = self.left_node(ndb)?;
            (left.height, left.size)
        };
        let (right_height, right_size) = {
            let right = self.right_node(ndb)?;
            (right.height, right.size)
        };
        self.height = left_height.max(right_height) + 1;
        self.size = left_size + right_size;
        Ok(())
    }

    /// Left height minus right height.
    pub(crate) fn calc_balance(&self, ndb: &NodeDb) -> Result<i32, TreeError> {
        let left_height = self.left_node(ndb)?.height;
        let right_height = self.right_node(ndb)?.height;
        Ok(i32::from(left_height) - i32::from(right_height))
    }

    /// Computes this node's hash, assuming child hashes are already set.
    /// Idempotent.
    pub(crate) fn compute_hash(&mut self) -> Result<NodeHash, TreeError> {
        if let Some(hash) = self.hash {
            return Ok(hash);
        }
        let mut buf = Vec::with_capacity(128);
        self.write_hash_input(&mut buf)?;
        let hash = NodeHash::new(Sha256::digest(&buf).into());
        self.hash = Some(hash);
        Ok(hash)
    }

    /// Hashes this node and every dirty descendant, bottom-up. Returns the
    /// node's hash and how many nodes were hashed by this call.
    pub(crate) fn hash_with_count(&mut self) -> Result<(NodeHash, u64), TreeError> {
        if let Some(hash) = self.hash {
            return Ok((hash, 0));
        }
        let mut count = 0;
        if let Some(Child::Node(child)) = self.left.as_mut() {
            count += child.hash_with_count()?.1;
        }
        if let Some(Child::Node(child)) = self.right.as_mut() {
            count += child.hash_with_count()?.1;
        }
        let hash = self.compute_hash()?;
        Ok((hash, count + 1))
    }

    /// Canonical hash-input form. The inner-node key is deliberately
    /// excluded, and a leaf value enters only through its own SHA-256, so
    /// proofs can omit values.
    pub(crate) fn write_hash_input(&self, buf: &mut Vec<u8>) -> Result<(), TreeError> {
        encoding::put_int8(buf, self.height);
        encoding::put_varint(buf, self.size);
        encoding::put_varint(buf, self.version as i64);
        if self.is_leaf() {
            let value = self
                .value
                .as_deref()
                .ok_or_else(|| TreeError::MalformedNode("leaf without value".into()))?;
            encoding::put_bytes(buf, &self.key);
            encoding::put_bytes(buf, Sha256::digest(value).as_slice());
        } else {
            let left = self.left_hash().ok_or(TreeError::EmptyChildHash)?;
            let right = self.right_hash().ok_or(TreeError::EmptyChildHash)?;
            encoding::put_bytes(buf, left.as_ref());
            encoding::put_bytes(buf, right.as_ref());
        }
        Ok(())
    }

    /// Canonical storage form. Unlike the hash input, the key is written
    /// for inner nodes too and leaf values are stored verbatim.
    pub(crate) fn encode(&self) -> Result<Vec<u8>, TreeError> {
        let mut buf = Vec::with_capacity(128);
        encoding::put_int8(&mut buf, self.height);
        encoding::put_varint(&mut buf, self.size);
        encoding::put_varint(&mut buf, self.version as i64);
        encoding::put_bytes(&mut buf, &self.key);
        if self.is_leaf() {
            let value = self
                .value
                .as_deref()
                .ok_or_else(|| TreeError::MalformedNode("leaf without value".into()))?;
            encoding::put_bytes(&mut buf, value);
        } else {
            let left = self.left_hash().ok_or(TreeError::EmptyChildHash)?;
            let right = self.right_hash().ok_or(TreeError::EmptyChildHash)?;
            encoding::put_bytes(&mut buf, left.as_ref());
            encoding::put_bytes(&mut buf, right.as_ref());
        }
        Ok(buf)
    }

    /// Decodes a node from its storage form. The hash is not part of the
    /// encoding; the caller sets it from the storage key.
    pub(crate) fn decode(buf: &[u8]) -> Result<Node, TreeError> {
        let mut at = 0;
        let (height, n) = field("height", encoding::get_int8(&buf[at..]))?;
        at += n;
        let (size, n) = field("size", encoding::get_varint(&buf[at..]))?;
        at += n;
        let (version, n) = field("version", encoding::get_varint(&buf[at..]))?;
        at += n;
        let (key, n) = field("key", encoding::get_bytes(&buf[at..]))?;
        at += n;

        if height < 0 {
            return Err(TreeError::MalformedNode(format!(
                "negative height {}",
                height
            )));
        }
        if size < 1 {
            return Err(TreeError::MalformedNode(format!("size {} below 1", size)));
        }
        if version < 1 {
            return Err(TreeError::MalformedNode(format!(
                "version {} below 1",
                version
            )));
        }

        let mut node = Node {
            key: key.to_vec(),
            value: None,
            version: version as Version,
            height,
            size,
            hash: None,
            left: None,
            right: None,
            saved: false,
            persisted: false,
        };

        if node.is_leaf() {
            let (value, _) = field("value", encoding::get_bytes(&buf[at..]))?;
            node.value = Some(value.to_vec());
        } else {
            let (left, n) = field("left hash", encoding::get_bytes(&buf[at..]))?;
            at += n;
            let (right, _) = field("right hash", encoding::get_bytes(&buf[at..]))?;
            node.left = Some(Child::Hash(NodeHash::from_slice(left)?));
            node.right = Some(Child::Hash(NodeHash::from_slice(right)?));
        }
        node.validate()?;
        Ok(node)
    }

    /// Structural sanity check: shape invariants for leaves and inner
    /// nodes.
    pub(crate) fn validate(&self) -> Result<(), TreeError> {
        if self.version < 1 {
            return Err(TreeError::MalformedNode("version below 1".into()));
        }
        if self.is_leaf() {
            if self.value.is_none() {
                return Err(TreeError::MalformedNode("leaf without value".into()));
            }
            if self.size != 1 {
                return Err(TreeError::MalformedNode(format!(
                    "leaf with size {}",
                    self.size
                )));
            }
            if self.left.is_some() || self.right.is_some() {
                return Err(TreeError::MalformedNode("leaf with children".into()));
            }
        } else {
            if self.value.is_some() {
                return Err(TreeError::MalformedNode("inner node with value".into()));
            }
            if self.height < 1 {
                return Err(TreeError::MalformedNode("negative height".into()));
            }
            if self.size < 2 {
                return Err(TreeError::MalformedNode(format!(
                    "inner node with size {}",
                    self.size
                )));
            }
            if self.left.is_none() || self.right.is_none() {
                return Err(TreeError::MalformedNode(
                    "inner node missing a child".into(),
                ));
            }
        }
        Ok(())
    }

    /// Pre-order traversal over `[start, end)` (`[start, end]` when
    /// `inclusive`), unbounded on a `None` side. The callback sees inner
    /// nodes unconditionally and leaves only when they fall inside the
    /// range; returning `true` stops the walk. Returns whether the walk was
    /// stopped.
    pub(crate) fn traverse_in_range(
        &self,
        ndb: &NodeDb,
        start: Option<&[u8]>,
        end: Option<&[u8]>,
        ascending: bool,
        inclusive: bool,
        depth: u8,
        cb: &mut dyn FnMut(&Node, u8) -> bool,
    ) -> Result<bool, TreeError> {
        let after_start = start.map_or(true, |s| s < self.key.as_slice());
        let start_or_after = start.map_or(true, |s| s <= self.key.as_slice());
        let before_end = match end {
            None => true,
            Some(e) if inclusive => self.key.as_slice() <= e,
            Some(e) => self.key.as_slice() < e,
        };

        if !self.is_leaf() || (start_or_after && before_end) {
            if cb(self, depth) {
                return Ok(true);
            }
        }
        if self.is_leaf() {
            return Ok(false);
        }

        if ascending {
            if after_start
                && self.left_node(ndb)?.traverse_in_range(
                    ndb,
                    start,
                    end,
                    ascending,
                    inclusive,
                    depth + 1,
                    cb,
                )?
            {
                return Ok(true);
            }
            if before_end
                && self.right_node(ndb)?.traverse_in_range(
                    ndb,
                    start,
                    end,
                    ascending,
                    inclusive,
                    depth + 1,
                    cb,
                )?
            {
                return Ok(true);
            }
        } else {
            if before_end
                && self.right_node(ndb)?.traverse_in_range(
                    ndb,
                    start,
                    end,
                    ascending,
                    inclusive,
                    depth + 1,
                    cb,
                )?
            {
                return Ok(true);
            }
            if after_start
                && self.left_node(ndb)?.traverse_in_range(
                    ndb,
                    start,
                    end,
                    ascending,
                    inclusive,
                    depth + 1,
                    cb,
                )?
            {
                return Ok(true);
            }
        }
        Ok(false)
    }
}

impl fmt::Debug for Node {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let hash = match self.hash {
            Some(h) => h.to_string(),
            None => "<unhashed>".into(),
        };
        write!(
            f,
            "Node{{{}@{} h={} s={}}}#{}",
            hex::encode(&self.key),
            self.version,
            self.height,
            self.size,
            hash
        )
    }
}

fn field<T>(name: &str, res: Result<(T, usize), TreeError>) -> Result<(T, usize), TreeError> {
    res.map_err(|err| {
        let detail = match err {
            TreeError::MalformedNode(msg) => msg,
            other => other.to_string(),
        };
        TreeError::MalformedNode(format!("decoding node {}: {}", name, detail))
    })
}
