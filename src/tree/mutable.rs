//! The mutable working copy of the tree.
//!
//! A `MutableTree` owns the node database and a working root. Mutations
//! are copy-on-write: every inner node on a touched path is superseded by
//! an unhashed clone at the next version, and the superseded node is
//! recorded as an orphan of the current working session. Committing hashes
//! the dirty spine bottom-up, persists it, applies retention, and promotes
//! the working state to a new committed version.
//!
//! Reads (`get`, `has`, `size`, iteration) observe the working root, so
//! uncommitted mutations are visible; `hash()` and `version()` always
//! describe the last committed state.

use crate::error::TreeError;
use crate::node::{Child, Node, NodeRef};
use crate::nodedb::NodeDb;
use crate::traits::Database;
use crate::tree::proof::KeyProof;
use crate::tree::ImmutableTree;
use crate::types::{NodeHash, Options, Version};
use std::cmp::Ordering;
use std::collections::HashMap;
use std::sync::Arc;

/// Result of a recursive removal below one child link.
enum Removal {
    /// The key was not present; the link is handed back untouched.
    NotFound(Child),
    /// The key was removed. `replacement` is the new link (or `None` when
    /// the removed leaf was the entire subtree), `new_key` the subtree's
    /// new smallest key when it changed, and `value` the removed value.
    Removed {
        replacement: Option<Child>,
        new_key: Option<Vec<u8>>,
        value: Vec<u8>,
    },
}

/// Single-writer working copy over a node database.
#[derive(Debug)]
pub struct MutableTree {
    ndb: Arc<NodeDb>,
    committed: ImmutableTree,
    working_root: Option<Child>,
    /// Saved nodes superseded in the current working session, keyed by
    /// hash, holding their creation version. Nodes created and dropped
    /// within the session never appear here.
    orphans: HashMap<NodeHash, Version>,
}

impl MutableTree {
    /// Creates a tree over a persistent (`snapshot_db`) and an ephemeral
    /// (`recent_db`) backend. Call [`MutableTree::load`] (or
    /// [`MutableTree::load_version`]) before use when the backends may
    /// hold prior state.
    pub fn new(
        snapshot_db: Box<dyn Database>,
        recent_db: Box<dyn Database>,
        cache_size: usize,
        options: Options,
    ) -> Result<Self, TreeError> {
        options.validate()?;
        let ndb = Arc::new(NodeDb::new(snapshot_db, recent_db, cache_size, options));
        let committed = ImmutableTree::new(None, 0, Arc::clone(&ndb));
        Ok(Self {
            ndb,
            committed,
            working_root: None,
            orphans: HashMap::new(),
        })
    }

    /// Loads the latest committed version.
    pub fn load(&mut self) -> Result<Version, TreeError> {
        self.load_version(0)
    }

    /// Loads `target`, or the latest version when `target` is 0. Discards
    /// any uncommitted working state.
    pub fn load_version(&mut self, target: Version) -> Result<Version, TreeError> {
        self.ndb.load_indexes()?;
        let version = if target == 0 {
            match self.ndb.latest_version() {
                Some(latest) => latest,
                None => {
                    self.committed = ImmutableTree::new(None, 0, Arc::clone(&self.ndb));
                    self.working_root = None;
                    self.orphans.clear();
                    return Ok(0);
                }
            }
        } else {
            if !self.ndb.has_version(target) {
                return Err(TreeError::VersionDoesNotExist(target));
            }
            target
        };
        let root = self.ndb.root_hash_of(version)?;
        self.committed = ImmutableTree::new(root, version, Arc::clone(&self.ndb));
        self.working_root = root.map(Child::Hash);
        self.orphans.clear();
        log::debug!("loaded version {}", version);
        Ok(version)
    }

    /// Last committed version (0 before the first commit).
    #[inline]
    pub fn version(&self) -> Version {
        self.committed.version()
    }

    /// Root hash of the last committed version; `None` for an empty tree.
    #[inline]
    pub fn hash(&self) -> Option<NodeHash> {
        self.committed.root_hash()
    }

    /// The retention configuration in force.
    pub fn options(&self) -> &Options {
        self.ndb.options()
    }

    fn working_version(&self) -> Version {
        self.committed.version() + 1
    }

    fn working_node(&self) -> Result<Option<NodeRef<'_>>, TreeError> {
        match &self.working_root {
            None => Ok(None),
            Some(Child::Node(node)) => Ok(Some(NodeRef::Borrowed(node))),
            Some(Child::Hash(hash)) => Ok(Some(NodeRef::Shared(self.ndb.get_node(hash)?))),
        }
    }

    /// Number of keys in the working tree.
    pub fn size(&self) -> Result<i64, TreeError> {
        Ok(self.working_node()?.map_or(0, |node| node.size))
    }

    /// Whether `key` exists in the working tree.
    pub fn has(&self, key: &[u8]) -> Result<bool, TreeError> {
        match self.working_node()? {
            Some(node) => node.has(&self.ndb, key),
            None => Ok(false),
        }
    }

    /// Looks `key` up in the working tree; see [`ImmutableTree::get`] for
    /// the rank contract.
    pub fn get(&self, key: &[u8]) -> Result<(i64, Option<Vec<u8>>), TreeError> {
        match self.working_node()? {
            Some(node) => node.get(&self.ndb, key),
            None => Ok((0, None)),
        }
    }

    /// Returns the `index`-th key/value pair of the working tree.
    pub fn get_by_index(&self, index: i64) -> Result<Option<(Vec<u8>, Vec<u8>)>, TreeError> {
        match self.working_node()? {
            Some(node) if index >= 0 => node.get_by_index(&self.ndb, index),
            _ => Ok(None),
        }
    }

    /// Looks `key` up at a historical version; `Ok(None)` when the version
    /// is not retained.
    pub fn get_versioned(
        &self,
        key: &[u8],
        version: Version,
    ) -> Result<Option<Vec<u8>>, TreeError> {
        if !self.ndb.has_version(version) {
            return Ok(None);
        }
        Ok(self.get_immutable(version)?.get(key)?.1)
    }

    /// In-order traversal of the working tree.
    pub fn iterate<F>(&self, cb: F) -> Result<bool, TreeError>
    where
        F: FnMut(&[u8], &[u8]) -> bool,
    {
        self.iterate_range(None, None, true, false, cb)
    }

    /// Range traversal of the working tree; see
    /// [`ImmutableTree::iterate_range`].
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
        let Some(root) = self.working_node()? else {
            return Ok(false);
        };
        let mut visit = |node: &Node, _depth: u8| -> bool {
            if !node.is_leaf() {
                return false;
            }
            cb(&node.key, node.value.as_deref().unwrap_or_default())
        };
        root.traverse_in_range(&self.ndb, start, end, ascending, inclusive, 0, &mut visit)
    }

    /// Read-only snapshot of a retained version.
    pub fn get_immutable(&self, version: Version) -> Result<ImmutableTree, TreeError> {
        let root = self.ndb.root_hash_of(version)?;
        Ok(ImmutableTree::new(root, version, Arc::clone(&self.ndb)))
    }

    /// Sorted list of versions currently answerable by
    /// [`MutableTree::get_immutable`].
    pub fn available_versions(&self) -> Vec<Version> {
        self.ndb.available_versions()
    }

    /// Proof against the last committed root; see
    /// [`ImmutableTree::get_with_proof`].
    pub fn get_with_proof(&self, key: &[u8]) -> Result<(Option<Vec<u8>>, KeyProof), TreeError> {
        self.committed.get_with_proof(key)
    }

    /// Inserts or replaces `key`. Returns whether an existing value was
    /// replaced.
    pub fn set(&mut self, key: &[u8], value: &[u8]) -> Result<bool, TreeError> {
        match self.working_root.take() {
            None => {
                let leaf = Node::new_leaf(key.to_vec(), value.to_vec(), self.working_version());
                self.working_root = Some(Child::Node(Box::new(leaf)));
                Ok(false)
            }
            Some(root) => {
                let (root, updated) = self.set_recursive(root, key, value)?;
                self.working_root = Some(root);
                Ok(updated)
            }
        }
    }

    fn set_recursive(
        &mut self,
        child: Child,
        key: &[u8],
        value: &[u8],
    ) -> Result<(Child, bool), TreeError> {
        let version = self.working_version();
        match child {
            Child::Node(node) => {
                if node.is_leaf() {
                    match key.cmp(node.key.as_slice()) {
                        Ordering::Equal => {
                            // A working-session leaf is simply replaced;
                            // it was never saved, so there is no orphan.
                            let leaf =
                                Node::new_leaf(key.to_vec(), value.to_vec(), version);
                            Ok((Child::Node(Box::new(leaf)), true))
                        }
                        _ => {
                            let existing_key = node.key.clone();
                            Ok((
                                self.split_leaf(Child::Node(node), existing_key, key, value),
                                false,
                            ))
                        }
                    }
                } else {
                    self.set_in_inner(node, key, value)
                }
            }
            Child::Hash(hash) => {
                let shared = self.ndb.get_node(&hash)?;
                if shared.is_leaf() {
                    match key.cmp(shared.key.as_slice()) {
                        Ordering::Equal => {
                            self.add_orphan(&shared);
                            let leaf =
                                Node::new_leaf(key.to_vec(), value.to_vec(), version);
                            Ok((Child::Node(Box::new(leaf)), true))
                        }
                        _ => {
                            let existing_key = shared.key.clone();
                            Ok((
                                self.split_leaf(Child::Hash(hash), existing_key, key, value),
                                false,
                            ))
                        }
                    }
                } else {
                    self.add_orphan(&shared);
                    let node = shared.clone_for(version)?;
                    self.set_in_inner(node, key, value)
                }
            }
        }
    }

    /// Descends into an owned inner node, reattaches the rebuilt child and
    /// rebalances. Updates skip the recompute: the shape is unchanged.
    fn set_in_inner(
        &mut self,
        mut node: Box<Node>,
        key: &[u8],
        value: &[u8],
    ) -> Result<(Child, bool), TreeError> {
        let go_left = key < node.key.as_slice();
        let taken = if go_left {
            node.left.take()
        } else {
            node.right.take()
        }
        .ok_or(TreeError::EmptyChildHash)?;
        let (new_child, updated) = self.set_recursive(taken, key, value)?;
        if go_left {
            node.left = Some(new_child);
        } else {
            node.right = Some(new_child);
        }
        if updated {
            return Ok((Child::Node(node), true));
        }
        node.calc_height_and_size(&self.ndb)?;
        let node = self.balance(node)?;
        Ok((Child::Node(node), false))
    }

    /// Splits a leaf into an inner node holding the displaced leaf and a
    /// fresh one. The displaced leaf keeps its link form and is not
    /// orphaned: it remains reachable from the new parent.
    fn split_leaf(&self, existing: Child, existing_key: Vec<u8>, key: &[u8], value: &[u8]) -> Child {
        let version = self.working_version();
        let fresh = Child::Node(Box::new(Node::new_leaf(
            key.to_vec(),
            value.to_vec(),
            version,
        )));
        let (inner_key, left, right) = if key < existing_key.as_slice() {
            (existing_key, fresh, existing)
        } else {
            (key.to_vec(), existing, fresh)
        };
        Child::Node(Box::new(Node {
            key: inner_key,
            value: None,
            version,
            height: 1,
            size: 2,
            hash: None,
            left: Some(left),
            right: Some(right),
            saved: false,
            persisted: false,
        }))
    }

    /// Removes `key`, returning the removed value and whether anything was
    /// removed. Removing from an empty tree or an absent key is `(None,
    /// false)`, not an error.
    pub fn remove(&mut self, key: &[u8]) -> Result<(Option<Vec<u8>>, bool), TreeError> {
        let Some(root) = self.working_root.take() else {
            return Ok((None, false));
        };
        match self.remove_recursive(root, key)? {
            Removal::NotFound(root) => {
                self.working_root = Some(root);
                Ok((None, false))
            }
            Removal::Removed {
                replacement, value, ..
            } => {
                self.working_root = replacement;
                Ok((Some(value), true))
            }
        }
    }

    fn remove_recursive(&mut self, child: Child, key: &[u8]) -> Result<Removal, TreeError> {
        match child {
            Child::Node(mut node) => {
                if node.is_leaf() {
                    if node.key.as_slice() == key {
                        let value = node.value.take().ok_or_else(|| {
                            TreeError::MalformedNode("leaf without value".into())
                        })?;
                        return Ok(Removal::Removed {
                            replacement: None,
                            new_key: None,
                            value,
                        });
                    }
                    return Ok(Removal::NotFound(Child::Node(node)));
                }
                let go_left = key < node.key.as_slice();
                let taken = if go_left {
                    node.left.take()
                } else {
                    node.right.take()
                }
                .ok_or(TreeError::EmptyChildHash)?;
                match self.remove_recursive(taken, key)? {
                    Removal::NotFound(unchanged) => {
                        if go_left {
                            node.left = Some(unchanged);
                        } else {
                            node.right = Some(unchanged);
                        }
                        Ok(Removal::NotFound(Child::Node(node)))
                    }
                    Removal::Removed {
                        replacement: None,
                        value,
                        ..
                    } => {
                        // The removed leaf was a direct child: this node
                        // collapses into its sibling. The node was never
                        // saved, so nothing is orphaned here.
                        if go_left {
                            let right = node.right.take().ok_or(TreeError::EmptyChildHash)?;
                            Ok(Removal::Removed {
                                replacement: Some(right),
                                new_key: Some(std::mem::take(&mut node.key)),
                                value,
                            })
                        } else {
                            let left = node.left.take().ok_or(TreeError::EmptyChildHash)?;
                            Ok(Removal::Removed {
                                replacement: Some(left),
                                new_key: None,
                                value,
                            })
                        }
                    }
                    Removal::Removed {
                        replacement: Some(new_child),
                        new_key,
                        value,
                    } => self.rebuild_after_remove(node, go_left, new_child, new_key, value),
                }
            }
            Child::Hash(hash) => {
                let shared = self.ndb.get_node(&hash)?;
                if shared.is_leaf() {
                    if shared.key.as_slice() == key {
                        self.add_orphan(&shared);
                        let value = shared.value.clone().ok_or_else(|| {
                            TreeError::MalformedNode("leaf without value".into())
                        })?;
                        return Ok(Removal::Removed {
                            replacement: None,
                            new_key: None,
                            value,
                        });
                    }
                    return Ok(Removal::NotFound(Child::Hash(hash)));
                }
                let go_left = key < shared.key.as_slice();
                let taken = Child::Hash(if go_left {
                    shared.left_hash().ok_or(TreeError::EmptyChildHash)?
                } else {
                    shared.right_hash().ok_or(TreeError::EmptyChildHash)?
                });
                match self.remove_recursive(taken, key)? {
                    Removal::NotFound(_) => Ok(Removal::NotFound(Child::Hash(hash))),
                    Removal::Removed {
                        replacement: None,
                        value,
                        ..
                    } => {
                        self.add_orphan(&shared);
                        if go_left {
                            let right = shared.right_hash().ok_or(TreeError::EmptyChildHash)?;
                            Ok(Removal::Removed {
                                replacement: Some(Child::Hash(right)),
                                new_key: Some(shared.key.clone()),
                                value,
                            })
                        } else {
                            let left = shared.left_hash().ok_or(TreeError::EmptyChildHash)?;
                            Ok(Removal::Removed {
                                replacement: Some(Child::Hash(left)),
                                new_key: None,
                                value,
                            })
                        }
                    }
                    Removal::Removed {
                        replacement: Some(new_child),
                        new_key,
                        value,
                    } => {
                        self.add_orphan(&shared);
                        let node = shared.clone_for(self.working_version())?;
                        self.rebuild_after_remove(node, go_left, new_child, new_key, value)
                    }
                }
            }
        }
    }

    /// Reattaches the rebuilt child after a removal, adopts the subtree's
    /// new smallest key when the removal happened to the right, recomputes
    /// and rebalances.
    fn rebuild_after_remove(
        &mut self,
        mut node: Box<Node>,
        go_left: bool,
        new_child: Child,
        new_key: Option<Vec<u8>>,
        value: Vec<u8>,
    ) -> Result<Removal, TreeError> {
        let propagated = if go_left {
            node.left = Some(new_child);
            new_key
        } else {
            node.right = Some(new_child);
            if let Some(key) = new_key {
                node.key = key;
            }
            None
        };
        node.calc_height_and_size(&self.ndb)?;
        let node = self.balance(node)?;
        Ok(Removal::Removed {
            replacement: Some(Child::Node(node)),
            new_key: propagated,
            value,
        })
    }

    /// Records a saved node superseded by the current working session.
    fn add_orphan(&mut self, node: &Node) {
        debug_assert!(node.saved, "only saved nodes become orphans");
        if let Some(hash) = node.hash {
            self.orphans.insert(hash, node.version);
        }
    }

    /// Takes a child link for mutation: owned nodes pass through, saved
    /// nodes are orphaned and cloned at the working version.
    fn take_for_edit(&mut self, child: Child) -> Result<Box<Node>, TreeError> {
        match child {
            Child::Node(node) => Ok(node),
            Child::Hash(hash) => {
                let shared = self.ndb.get_node(&hash)?;
                self.add_orphan(&shared);
                shared.clone_for(self.working_version())
            }
        }
    }

    /// Restores the AVL property at `node` after a mutation changed one
    /// subtree's height by at most one.
    fn balance(&mut self, node: Box<Node>) -> Result<Box<Node>, TreeError> {
        let balance = node.calc_balance(&self.ndb)?;
        if balance > 1 {
            let left_balance = node.left_node(&self.ndb)?.calc_balance(&self.ndb)?;
            if left_balance >= 0 {
                // Left-left case.
                self.rotate_right(Child::Node(node))
            } else {
                // Left-right case.
                let mut node = node;
                let left = node.left.take().ok_or(TreeError::EmptyChildHash)?;
                let new_left = self.rotate_left(left)?;
                node.left = Some(Child::Node(new_left));
                self.rotate_right(Child::Node(node))
            }
        } else if balance < -1 {
            let right_balance = node.right_node(&self.ndb)?.calc_balance(&self.ndb)?;
            if right_balance <= 0 {
                // Right-right case.
                self.rotate_left(Child::Node(node))
            } else {
                // Right-left case.
                let mut node = node;
                let right = node.right.take().ok_or(TreeError::EmptyChildHash)?;
                let new_right = self.rotate_right(right)?;
                node.right = Some(Child::Node(new_right));
                self.rotate_left(Child::Node(node))
            }
        } else {
            Ok(node)
        }
    }

    fn rotate_left(&mut self, node: Child) -> Result<Box<Node>, TreeError> {
        let mut node = self.take_for_edit(node)?;
        let right = node.right.take().ok_or(TreeError::EmptyChildHash)?;
        let mut pivot = self.take_for_edit(right)?;
        let moved = pivot.left.take().ok_or(TreeError::EmptyChildHash)?;
        node.right = Some(moved);
        node.calc_height_and_size(&self.ndb)?;
        pivot.left = Some(Child::Node(node));
        pivot.calc_height_and_size(&self.ndb)?;
        Ok(pivot)
    }

    fn rotate_right(&mut self, node: Child) -> Result<Box<Node>, TreeError> {
        let mut node = self.take_for_edit(node)?;
        let left = node.left.take().ok_or(TreeError::EmptyChildHash)?;
        let mut pivot = self.take_for_edit(left)?;
        let moved = pivot.right.take().ok_or(TreeError::EmptyChildHash)?;
        node.left = Some(moved);
        node.calc_height_and_size(&self.ndb)?;
        pivot.right = Some(Child::Node(node));
        pivot.calc_height_and_size(&self.ndb)?;
        Ok(pivot)
    }

    /// Commits the working tree as the next version: hashes the dirty
    /// spine, persists nodes, orphan markers and the root record, applies
    /// retention, and promotes the committed snapshot. Returns the new
    /// root hash (`None` for an empty tree) and the committed version.
    pub fn save_version(&mut self) -> Result<(Option<NodeHash>, Version), TreeError> {
        let version = self.working_version();
        let (root_hash, written) = match self.working_root.as_mut() {
            Some(Child::Node(node)) => {
                let (hash, _) = node.hash_with_count()?;
                let written =
                    self.ndb
                        .save_version(version, Some(node.as_mut()), Some(hash), &self.orphans)?;
                (Some(hash), written)
            }
            Some(Child::Hash(hash)) => {
                // Clean working tree: the commit re-publishes the same
                // root under the next version.
                let hash = *hash;
                let written = self.ndb.save_version(version, None, Some(hash), &self.orphans)?;
                (Some(hash), written)
            }
            None => {
                let written = self.ndb.save_version(version, None, None, &self.orphans)?;
                (None, written)
            }
        };
        self.ndb.prune_recent(version)?;
        log::debug!(
            "saved version {}: {} nodes written, {} orphans",
            version,
            written,
            self.orphans.len()
        );
        self.orphans.clear();
        self.committed = ImmutableTree::new(root_hash, version, Arc::clone(&self.ndb));
        self.working_root = root_hash.map(Child::Hash);
        Ok((root_hash, version))
    }

    /// Deletes a retained version; the latest version is never deletable.
    pub fn delete_version(&mut self, version: Version) -> Result<(), TreeError> {
        self.ndb.delete_version(version)
    }

    /// Promotes a memory-resident version to disk retention.
    pub fn flush_version(&mut self, version: Version) -> Result<(), TreeError> {
        self.ndb.flush_version(version)?;
        Ok(())
    }

    /// Discards the working state, reverting to the last committed
    /// version.
    pub fn rollback(&mut self) {
        self.working_root = self.committed.root_hash().map(Child::Hash);
        self.orphans.clear();
    }

    #[cfg(test)]
    pub(crate) fn ndb(&self) -> &Arc<NodeDb> {
        &self.ndb
    }

    #[cfg(test)]
    pub(crate) fn working_root_for_audit(&self) -> Result<Option<NodeRef<'_>>, TreeError> {
        self.working_node()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fuzz::{check_committed_on_disk, check_invariants};
    use crate::mem_store::MemStore;

    fn new_tree(options: Options) -> MutableTree {
        MutableTree::new(
            Box::new(MemStore::new()),
            Box::new(MemStore::new()),
            64,
            options,
        )
        .unwrap()
    }

    fn collect(tree: &MutableTree) -> Vec<(Vec<u8>, Vec<u8>)> {
        let mut out = Vec::new();
        tree.iterate(|k, v| {
            out.push((k.to_vec(), v.to_vec()));
            false
        })
        .unwrap();
        out
    }

    /// End-to-end progression: ordered inserts, an update, a removal that
    /// collapses an inner node. Historical versions stay intact.
    #[test]
    fn test_insert_update_remove_progression() {
        let mut tree = new_tree(Options::default());

        assert!(!tree.set(b"a", b"1").unwrap());
        assert!(!tree.set(b"b", b"2").unwrap());
        assert!(!tree.set(b"c", b"3").unwrap());
        let (hash1, v1) = tree.save_version().unwrap();
        assert_eq!(v1, 1);
        let hash1 = hash1.expect("non-empty tree has a root hash");
        assert_eq!(tree.get(b"b").unwrap(), (1, Some(b"2".to_vec())));
        assert_eq!(tree.size().unwrap(), 3);
        check_invariants(&tree);
        check_committed_on_disk(&tree, 1);

        // Update: same key, new value, new version. The old version keeps
        // the old value and the root hashes differ.
        assert!(tree.set(b"b", b"X").unwrap());
        let (hash2, v2) = tree.save_version().unwrap();
        assert_eq!(v2, 2);
        assert_ne!(hash2, Some(hash1));
        assert_eq!(
            tree.get_immutable(1).unwrap().get(b"b").unwrap(),
            (1, Some(b"2".to_vec()))
        );
        assert_eq!(
            tree.get_immutable(2).unwrap().get(b"b").unwrap(),
            (1, Some(b"X".to_vec()))
        );
        check_invariants(&tree);

        // Removal collapses the parent of the removed leaf into its
        // sibling subtree.
        let (old, removed) = tree.remove(b"a").unwrap();
        assert_eq!(old, Some(b"1".to_vec()));
        assert!(removed);
        let (_, v3) = tree.save_version().unwrap();
        assert_eq!(v3, 3);
        assert_eq!(tree.size().unwrap(), 2);
        assert_eq!(
            collect(&tree),
            vec![
                (b"b".to_vec(), b"X".to_vec()),
                (b"c".to_vec(), b"3".to_vec())
            ]
        );
        check_invariants(&tree);
    }

    /// Identical operation sequences must produce identical root hashes.
    #[test]
    fn test_hash_determinism_across_instances() {
        let build = || {
            let mut tree = new_tree(Options::default());
            for i in 0..30u32 {
                let key = format!("key-{:03}", i * 7 % 30);
                tree.set(key.as_bytes(), &i.to_be_bytes()).unwrap();
            }
            tree.remove(b"key-000").unwrap();
            tree.save_version().unwrap()
        };
        assert_eq!(build(), build());
    }

    #[test]
    fn test_empty_tree_behaviors() {
        let mut tree = new_tree(Options::default());
        assert_eq!(tree.get(b"x").unwrap(), (0, None));
        assert!(!tree.has(b"x").unwrap());
        assert_eq!(tree.size().unwrap(), 0);
        assert_eq!(tree.hash(), None);
        assert_eq!(tree.remove(b"x").unwrap(), (None, false));
        assert!(collect(&tree).is_empty());

        // Committing the empty tree publishes the empty root marker.
        let (hash, version) = tree.save_version().unwrap();
        assert_eq!(hash, None);
        assert_eq!(version, 1);
        let snapshot = tree.get_immutable(1).unwrap();
        assert_eq!(snapshot.root_hash(), None);
        assert_eq!(snapshot.size().unwrap(), 0);
    }

    /// Removing the last key yields an absent working root whose commit
    /// records the empty marker.
    #[test]
    fn test_remove_last_key() {
        let mut tree = new_tree(Options::default());
        tree.set(b"only", b"v").unwrap();
        tree.save_version().unwrap();
        let (old, removed) = tree.remove(b"only").unwrap();
        assert_eq!(old, Some(b"v".to_vec()));
        assert!(removed);
        let (hash, version) = tree.save_version().unwrap();
        assert_eq!(hash, None);
        assert_eq!(version, 2);
        assert_eq!(tree.get_immutable(2).unwrap().size().unwrap(), 0);
        // Version 1 still holds the key.
        assert_eq!(
            tree.get_immutable(1).unwrap().get(b"only").unwrap().1,
            Some(b"v".to_vec())
        );
    }

    #[test]
    fn test_version_deletion_guards() {
        let mut tree = new_tree(Options::default());
        tree.set(b"a", b"1").unwrap();
        tree.save_version().unwrap();
        tree.set(b"b", b"2").unwrap();
        tree.save_version().unwrap();

        assert!(matches!(
            tree.delete_version(2),
            Err(TreeError::InvalidVersion { version: 2, .. })
        ));
        assert!(matches!(
            tree.delete_version(0),
            Err(TreeError::InvalidVersion { version: 0, .. })
        ));
        tree.delete_version(1).unwrap();
        assert!(matches!(
            tree.delete_version(1),
            Err(TreeError::VersionDoesNotExist(1))
        ));
        assert!(matches!(
            tree.get_immutable(1),
            Err(TreeError::VersionDoesNotExist(1))
        ));
        // Version 2 is unaffected.
        assert_eq!(
            tree.get_immutable(2).unwrap().get(b"a").unwrap().1,
            Some(b"1".to_vec())
        );
    }

    /// Retention arithmetic: `{keep_every: 5, keep_recent: 2}` after 12
    /// commits retains the snapshots 5 and 10 plus the window 11, 12.
    #[test]
    fn test_pruning_cadence_and_window() {
        let mut tree = new_tree(Options::new(5, 2, false).unwrap());
        for i in 1..=12u32 {
            tree.set(format!("key{}", i).as_bytes(), &i.to_be_bytes())
                .unwrap();
            let (_, version) = tree.save_version().unwrap();
            assert_eq!(version as u32, i);
            let available = tree.available_versions();
            assert_eq!(
                available.last().copied(),
                Some(version),
                "latest is always available"
            );
        }
        assert_eq!(tree.available_versions(), vec![5, 10, 11, 12]);

        // Retained versions answer reads; pruned ones do not.
        assert!(tree.get_immutable(10).unwrap().has(b"key7").unwrap());
        assert!(matches!(
            tree.get_immutable(7),
            Err(TreeError::VersionDoesNotExist(7))
        ));
        check_committed_on_disk(&tree, 10);
    }

    /// Flush promotes a memory-only version to disk; deletion and the
    /// advancing window then reclaim the memory copies.
    #[test]
    fn test_flush_then_delete() {
        let mut tree = new_tree(Options::new(10, 3, false).unwrap());
        for i in 1..=6u32 {
            tree.set(format!("v{}", i).as_bytes(), &i.to_be_bytes())
                .unwrap();
            tree.save_version().unwrap();
        }
        assert_eq!(tree.available_versions(), vec![4, 5, 6]);

        tree.flush_version(4).unwrap();
        tree.delete_version(5).unwrap();
        assert_eq!(tree.available_versions(), vec![4, 6]);

        // The next commit pushes 4 out of the window; its disk copy keeps
        // it available.
        tree.set(b"late", b"x").unwrap();
        tree.save_version().unwrap();
        assert_eq!(tree.available_versions(), vec![4, 6, 7]);

        let snapshot = tree.get_immutable(4).unwrap();
        for i in 1..=4u32 {
            assert!(snapshot.has(format!("v{}", i).as_bytes()).unwrap());
        }
        assert!(!snapshot.has(b"v5").unwrap());
        check_committed_on_disk(&tree, 4);
    }

    /// Rebuilding from the same disk backend recovers exactly the
    /// disk-retained versions with identical root hashes.
    #[test]
    fn test_reload_recovers_disk_versions() {
        let disk = MemStore::new();
        let options = Options::new(5, 2, false).unwrap();
        let mut hashes = std::collections::BTreeMap::new();

        let mut tree = MutableTree::new(
            Box::new(disk.clone()),
            Box::new(MemStore::new()),
            64,
            options,
        )
        .unwrap();
        tree.load().unwrap();
        for i in 1..=12u32 {
            tree.set(format!("key{}", i).as_bytes(), &i.to_be_bytes())
                .unwrap();
            let (hash, version) = tree.save_version().unwrap();
            hashes.insert(version, hash);
        }
        drop(tree);

        // Crash: the memory backend is lost, the disk backend survives.
        let mut reloaded = MutableTree::new(
            Box::new(disk.clone()),
            Box::new(MemStore::new()),
            64,
            options,
        )
        .unwrap();
        let version = reloaded.load().unwrap();
        assert_eq!(version, 10);
        assert_eq!(reloaded.available_versions(), vec![5, 10]);
        for v in [5u64, 10] {
            assert_eq!(reloaded.get_immutable(v).unwrap().root_hash(), hashes[&v]);
        }
        // Targeted loads: exact versions work, pruned ones fail, 0 means
        // latest.
        assert_eq!(reloaded.load_version(5).unwrap(), 5);
        assert!(matches!(
            reloaded.load_version(11),
            Err(TreeError::VersionDoesNotExist(11))
        ));
        assert_eq!(reloaded.load_version(0).unwrap(), 10);
    }

    #[test]
    fn test_rollback_discards_working_state() {
        let mut tree = new_tree(Options::default());
        tree.set(b"a", b"1").unwrap();
        tree.save_version().unwrap();

        tree.set(b"b", b"2").unwrap();
        tree.remove(b"a").unwrap();
        tree.rollback();

        assert!(tree.has(b"a").unwrap());
        assert!(!tree.has(b"b").unwrap());
        assert_eq!(tree.size().unwrap(), 1);

        // A commit after rollback re-publishes the same content.
        let (hash, version) = tree.save_version().unwrap();
        assert_eq!(version, 2);
        assert_eq!(hash, tree.get_immutable(1).unwrap().root_hash());
    }

    #[test]
    fn test_get_versioned_and_rank_queries() {
        let mut tree = new_tree(Options::new(1, 2, false).unwrap());
        tree.set(b"a", b"1").unwrap();
        tree.set(b"c", b"3").unwrap();
        tree.save_version().unwrap();
        tree.set(b"b", b"2").unwrap();
        tree.save_version().unwrap();

        assert_eq!(tree.get_versioned(b"b", 1).unwrap(), None);
        assert_eq!(tree.get_versioned(b"b", 2).unwrap(), Some(b"2".to_vec()));
        assert_eq!(tree.get_versioned(b"b", 9).unwrap(), None);

        // Rank arithmetic: rank of a missing key is its insertion point.
        assert_eq!(tree.get(b"b").unwrap().0, 1);
        assert_eq!(tree.get(b"bb").unwrap(), (2, None));
        assert_eq!(tree.get_by_index(0).unwrap().unwrap().0, b"a".to_vec());
        assert_eq!(tree.get_by_index(2).unwrap().unwrap().0, b"c".to_vec());
        assert_eq!(tree.get_by_index(3).unwrap(), None);
    }

    /// Range iteration bounds: half-open by default, closed when
    /// inclusive, descending reverses, subtrees outside the range are
    /// pruned rather than visited.
    #[test]
    fn test_iterate_range_bounds() {
        let mut tree = new_tree(Options::default());
        for key in ["a", "b", "c", "d", "e"] {
            tree.set(key.as_bytes(), b"x").unwrap();
        }

        let keys = |start: Option<&[u8]>, end: Option<&[u8]>, asc: bool, incl: bool| {
            let mut out = Vec::new();
            tree.iterate_range(start, end, asc, incl, |k, _| {
                out.push(String::from_utf8(k.to_vec()).unwrap());
                false
            })
            .unwrap();
            out
        };

        let b = b"b".as_slice();
        let c = b"c".as_slice();
        let d = b"d".as_slice();
        let e = b"e".as_slice();
        assert_eq!(keys(Some(b), Some(d), true, false), ["b", "c"]);
        assert_eq!(keys(Some(b), Some(d), true, true), ["b", "c", "d"]);
        assert_eq!(keys(None, Some(c), true, false), ["a", "b"]);
        assert_eq!(keys(Some(d), None, true, false), ["d", "e"]);
        assert_eq!(keys(Some(b), Some(e), false, false), ["d", "c", "b"]);

        // Early stop is propagated.
        let mut seen = 0;
        let stopped = tree
            .iterate(|_, _| {
                seen += 1;
                seen == 2
            })
            .unwrap();
        assert!(stopped);
        assert_eq!(seen, 2);
    }

    /// Working-copy reads see uncommitted mutations; committed accessors
    /// do not.
    #[test]
    fn test_working_reads_vs_committed_state() {
        let mut tree = new_tree(Options::default());
        tree.set(b"a", b"1").unwrap();
        tree.save_version().unwrap();
        let committed_hash = tree.hash();

        tree.set(b"b", b"2").unwrap();
        assert!(tree.has(b"b").unwrap());
        assert_eq!(tree.size().unwrap(), 2);
        assert_eq!(tree.version(), 1);
        assert_eq!(tree.hash(), committed_hash);
    }

    /// A cache size of zero disables caching without changing behavior.
    #[test]
    fn test_zero_cache_size() {
        let mut tree = MutableTree::new(
            Box::new(MemStore::new()),
            Box::new(MemStore::new()),
            0,
            Options::default(),
        )
        .unwrap();
        for i in 0..20u32 {
            tree.set(&i.to_be_bytes(), b"v").unwrap();
        }
        tree.save_version().unwrap();
        tree.remove(&3u32.to_be_bytes()).unwrap();
        tree.save_version().unwrap();
        assert_eq!(tree.size().unwrap(), 19);
        check_invariants(&tree);
    }
}
