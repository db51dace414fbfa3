//! The node database: storage, retention and reclamation for tree nodes.
//!
//! Two backends cooperate under one `NodeDb`:
//!
//! - the **snapshot** backend (persistent) holds versions on the
//!   `keep_every` cadence, plus versions explicitly promoted with
//!   [`NodeDb::flush_version`];
//! - the **recent** backend (ephemeral) holds the `keep_recent` most
//!   recent versions, so non-snapshot versions stay queryable until they
//!   age out of the window.
//!
//! Three key prefixes exist in either backend:
//!
//! ```text
//! n/<hash>                                  -> serialized node
//! o/<to_version:8BE>/<from_version:8BE>/<hash> -> orphan marker (empty)
//! r/<version:8BE>                           -> root hash ("" = empty tree)
//! ```
//!
//! An orphan marker records that a node created at `from_version` was
//! superseded right after `to_version`: it is reachable from the versions
//! in `[from, to]` and from nothing newer. Deleting a version consults
//! these intervals to decide which nodes lost their last referencing
//! version and can be reclaimed.

use crate::error::TreeError;
use crate::node::{Child, Node};
use crate::traits::{Database, WriteBatch};
use crate::types::{NodeHash, Options, Version};
use lru::LruCache;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::fmt;
use std::num::NonZeroUsize;
use std::ops::Bound;
use std::sync::{Arc, Mutex, RwLock};

const NODE_PREFIX: &[u8] = b"n/";
const ORPHAN_PREFIX: &[u8] = b"o/";
const ROOT_PREFIX: &[u8] = b"r/";
const SEPARATOR: u8 = b'/';

/// `n/<hash>`
pub(crate) fn node_key(hash: &NodeHash) -> Vec<u8> {
    let mut key = Vec::with_capacity(NODE_PREFIX.len() + NodeHash::LENGTH);
    key.extend_from_slice(NODE_PREFIX);
    key.extend_from_slice(hash.as_ref());
    key
}

/// `o/<to:8BE>/<from:8BE>/<hash>`
pub(crate) fn orphan_key(to: Version, from: Version, hash: &NodeHash) -> Vec<u8> {
    let mut key = Vec::with_capacity(2 + 8 + 1 + 8 + 1 + NodeHash::LENGTH);
    key.extend_from_slice(ORPHAN_PREFIX);
    key.extend_from_slice(&to.to_be_bytes());
    key.push(SEPARATOR);
    key.extend_from_slice(&from.to_be_bytes());
    key.push(SEPARATOR);
    key.extend_from_slice(hash.as_ref());
    key
}

/// `r/<version:8BE>`
pub(crate) fn root_key(version: Version) -> Vec<u8> {
    let mut key = Vec::with_capacity(ROOT_PREFIX.len() + 8);
    key.extend_from_slice(ROOT_PREFIX);
    key.extend_from_slice(&version.to_be_bytes());
    key
}

fn parse_root_key(key: &[u8]) -> Option<Version> {
    let rest = key.strip_prefix(ROOT_PREFIX)?;
    let raw: [u8; 8] = rest.try_into().ok()?;
    Some(Version::from_be_bytes(raw))
}

fn parse_orphan_key(key: &[u8]) -> Option<(Version, Version, NodeHash)> {
    let rest = key.strip_prefix(ORPHAN_PREFIX)?;
    if rest.len() != 8 + 1 + 8 + 1 + NodeHash::LENGTH {
        return None;
    }
    if rest[8] != SEPARATOR || rest[17] != SEPARATOR {
        return None;
    }
    let to = Version::from_be_bytes(rest[..8].try_into().ok()?);
    let from = Version::from_be_bytes(rest[9..17].try_into().ok()?);
    let hash = NodeHash::from_slice(&rest[18..]).ok()?;
    Some((to, from, hash))
}

/// Exclusive upper bound covering every key starting with `prefix`.
fn prefix_end(prefix: &[u8]) -> Vec<u8> {
    let mut end = prefix.to_vec();
    let last = end.last_mut().expect("prefix is never empty");
    *last += 1;
    end
}

/// Which of the two backends an operation targets.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum BackendKind {
    Snapshot,
    Recent,
}

/// Where a version's root record currently lives.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
struct Retention {
    snapshot: bool,
    recent: bool,
}

impl Retention {
    fn has(&self, kind: BackendKind) -> bool {
        match kind {
            BackendKind::Snapshot => self.snapshot,
            BackendKind::Recent => self.recent,
        }
    }

    fn set(&mut self, kind: BackendKind) {
        match kind {
            BackendKind::Snapshot => self.snapshot = true,
            BackendKind::Recent => self.recent = true,
        }
    }

    fn clear(&mut self, kind: BackendKind) {
        match kind {
            BackendKind::Snapshot => self.snapshot = false,
            BackendKind::Recent => self.recent = false,
        }
    }

    fn is_empty(&self) -> bool {
        !self.snapshot && !self.recent
    }
}

/// One orphan record inside a `to_version` group.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
struct Orphan {
    from: Version,
    hash: NodeHash,
}

/// In-memory mirror of the `r/*` and `o/*` records of both backends,
/// grouped so that deleting a version is linear in the orphans touching it.
#[derive(Default)]
struct Indexes {
    versions: BTreeMap<Version, Retention>,
    snapshot_orphans: BTreeMap<Version, Vec<Orphan>>,
    recent_orphans: BTreeMap<Version, Vec<Orphan>>,
}

impl Indexes {
    fn orphans(&self, kind: BackendKind) -> &BTreeMap<Version, Vec<Orphan>> {
        match kind {
            BackendKind::Snapshot => &self.snapshot_orphans,
            BackendKind::Recent => &self.recent_orphans,
        }
    }

    fn orphans_mut(&mut self, kind: BackendKind) -> &mut BTreeMap<Version, Vec<Orphan>> {
        match kind {
            BackendKind::Snapshot => &mut self.snapshot_orphans,
            BackendKind::Recent => &mut self.recent_orphans,
        }
    }
}

/// Node storage shared by every tree handle.
pub struct NodeDb {
    snapshot_db: Box<dyn Database>,
    recent_db: Box<dyn Database>,
    opts: Options,
    cache: Option<Mutex<LruCache<NodeHash, Arc<Node>>>>,
    indexes: RwLock<Indexes>,
}

impl fmt::Debug for NodeDb {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let indexes = self.indexes.read().unwrap();
        f.debug_struct("NodeDb")
            .field("options", &self.opts)
            .field("versions", &indexes.versions.len())
            .field("cache_enabled", &self.cache.is_some())
            .finish()
    }
}

impl NodeDb {
    pub(crate) fn new(
        snapshot_db: Box<dyn Database>,
        recent_db: Box<dyn Database>,
        cache_size: usize,
        opts: Options,
    ) -> Self {
        let cache = NonZeroUsize::new(cache_size).map(|size| Mutex::new(LruCache::new(size)));
        Self {
            snapshot_db,
            recent_db,
            opts,
            cache,
            indexes: RwLock::new(Indexes::default()),
        }
    }

    pub(crate) fn options(&self) -> &Options {
        &self.opts
    }

    fn backend(&self, kind: BackendKind) -> &dyn Database {
        match kind {
            BackendKind::Snapshot => self.snapshot_db.as_ref(),
            BackendKind::Recent => self.recent_db.as_ref(),
        }
    }

    /// Rebuilds the version and orphan indexes by scanning both backends.
    pub(crate) fn load_indexes(&self) -> Result<(), TreeError> {
        let mut indexes = Indexes::default();
        let root_end = prefix_end(ROOT_PREFIX);
        let orphan_end = prefix_end(ORPHAN_PREFIX);
        for kind in [BackendKind::Snapshot, BackendKind::Recent] {
            let db = self.backend(kind);
            let roots = db.iter_range(Some(ROOT_PREFIX), Some(root_end.as_slice()), true)?;
            for (key, _) in roots {
                let version = parse_root_key(&key).ok_or_else(|| {
                    TreeError::MalformedNode(format!("bad root key {}", hex::encode(&key)))
                })?;
                indexes.versions.entry(version).or_default().set(kind);
            }
            let orphans = db.iter_range(Some(ORPHAN_PREFIX), Some(orphan_end.as_slice()), true)?;
            for (key, _) in orphans {
                let (to, from, hash) = parse_orphan_key(&key).ok_or_else(|| {
                    TreeError::MalformedNode(format!("bad orphan key {}", hex::encode(&key)))
                })?;
                indexes
                    .orphans_mut(kind)
                    .entry(to)
                    .or_default()
                    .push(Orphan { from, hash });
            }
        }
        *self.indexes.write().unwrap() = indexes;
        Ok(())
    }

    /// Highest committed version known to either backend.
    pub(crate) fn latest_version(&self) -> Option<Version> {
        self.indexes
            .read()
            .unwrap()
            .versions
            .keys()
            .next_back()
            .copied()
    }

    /// Sorted union of the versions retained by either backend.
    pub(crate) fn available_versions(&self) -> Vec<Version> {
        self.indexes
            .read()
            .unwrap()
            .versions
            .keys()
            .copied()
            .collect()
    }

    pub(crate) fn has_version(&self, version: Version) -> bool {
        self.indexes
            .read()
            .unwrap()
            .versions
            .contains_key(&version)
    }

    /// Root hash recorded for `version`; `Ok(None)` is a committed empty
    /// tree, which is distinct from the version not existing at all.
    pub(crate) fn root_hash_of(&self, version: Version) -> Result<Option<NodeHash>, TreeError> {
        let key = root_key(version);
        let record = match self.snapshot_db.get(&key)? {
            Some(bytes) => Some(bytes),
            None => self.recent_db.get(&key)?,
        };
        match record {
            None => Err(TreeError::VersionDoesNotExist(version)),
            Some(bytes) if bytes.is_empty() => Ok(None),
            Some(bytes) => Ok(Some(NodeHash::from_slice(&bytes)?)),
        }
    }

    /// Fetches a node: cache, then the recent backend, then the snapshot
    /// backend.
    pub(crate) fn get_node(&self, hash: &NodeHash) -> Result<Arc<Node>, TreeError> {
        if let Some(cache) = &self.cache {
            if let Some(node) = cache.lock().unwrap().get(hash) {
                return Ok(Arc::clone(node));
            }
        }
        let key = node_key(hash);
        if let Some(bytes) = self.recent_db.get(&key)? {
            return self.decode_stored(hash, &bytes, false);
        }
        if let Some(bytes) = self.snapshot_db.get(&key)? {
            return self.decode_stored(hash, &bytes, true);
        }
        Err(TreeError::MissingNode(*hash))
    }

    fn decode_stored(
        &self,
        hash: &NodeHash,
        bytes: &[u8],
        persisted: bool,
    ) -> Result<Arc<Node>, TreeError> {
        let mut node = Node::decode(bytes)?;
        node.hash = Some(*hash);
        node.saved = true;
        node.persisted = persisted;
        let node = Arc::new(node);
        self.cache_node(Arc::clone(&node));
        Ok(node)
    }

    fn cache_node(&self, node: Arc<Node>) {
        if let Some(cache) = &self.cache {
            if let Some(hash) = node.hash {
                cache.lock().unwrap().put(hash, node);
            }
        }
    }

    fn uncache_node(&self, hash: &NodeHash) {
        if let Some(cache) = &self.cache {
            cache.lock().unwrap().pop(hash);
        }
    }

    /// Commits one version: new nodes, orphan markers and the root record,
    /// one write batch per backend. Returns the number of nodes written.
    pub(crate) fn save_version(
        &self,
        version: Version,
        root: Option<&mut Node>,
        root_hash: Option<NodeHash>,
        orphans: &HashMap<NodeHash, Version>,
    ) -> Result<u64, TreeError> {
        if self.has_version(version) {
            return Err(TreeError::invalid_version(version, "already committed"));
        }
        let to_snapshot = self.opts.is_snapshot_version(version);
        let to_recent = self.opts.keeps_recent();

        let mut snapshot_batch = WriteBatch::new();
        let mut recent_batch = WriteBatch::new();

        let mut written = 0;
        let mut copied_scratch = Vec::new();
        match root {
            Some(root) => {
                written = self.save_branch(
                    root,
                    to_snapshot,
                    to_recent,
                    &mut snapshot_batch,
                    &mut recent_batch,
                    &mut copied_scratch,
                )?;
            }
            None => {
                // A clean commit at a snapshot version still has to bring
                // the whole (unchanged) tree onto disk.
                if to_snapshot {
                    if let Some(hash) = root_hash {
                        written = self.persist_branch(
                            &hash,
                            &mut snapshot_batch,
                            &mut copied_scratch,
                        )?;
                    }
                }
            }
        }

        // Orphan markers go wherever the superseded node lives. Sorted for
        // deterministic batch contents.
        let mut sorted: Vec<(&NodeHash, &Version)> = orphans.iter().collect();
        sorted.sort();
        let to_version = version - 1;
        let mut new_snapshot_orphans = Vec::new();
        let mut new_recent_orphans = Vec::new();
        for (hash, &from) in sorted {
            let marker = orphan_key(to_version, from, hash);
            let stored_at = node_key(hash);
            let record = Orphan { from, hash: *hash };
            if self.snapshot_db.has(&stored_at)? {
                snapshot_batch.put(marker.clone(), Vec::new());
                new_snapshot_orphans.push(record);
            }
            if self.recent_db.has(&stored_at)? {
                recent_batch.put(marker, Vec::new());
                new_recent_orphans.push(record);
            }
        }

        let root_record: Vec<u8> = match root_hash {
            Some(hash) => hash.as_ref().to_vec(),
            None => Vec::new(),
        };
        if to_snapshot {
            snapshot_batch.put(root_key(version), root_record.clone());
        }
        if to_recent {
            recent_batch.put(root_key(version), root_record);
        }

        if !snapshot_batch.is_empty() {
            self.snapshot_db.write_batch(snapshot_batch, self.opts.sync)?;
        }
        if !recent_batch.is_empty() {
            self.recent_db.write_batch(recent_batch, false)?;
        }

        let mut indexes = self.indexes.write().unwrap();
        indexes.versions.insert(
            version,
            Retention {
                snapshot: to_snapshot,
                recent: to_recent,
            },
        );
        if !new_snapshot_orphans.is_empty() {
            indexes
                .snapshot_orphans
                .entry(to_version)
                .or_default()
                .extend(new_snapshot_orphans);
        }
        if !new_recent_orphans.is_empty() {
            indexes
                .recent_orphans
                .entry(to_version)
                .or_default()
                .extend(new_recent_orphans);
        }
        Ok(written)
    }

    /// Writes every unsaved node below `node` (children first), encoding
    /// each node exactly once and sharing the bytes between backends. At a
    /// snapshot version the walk continues through already-saved subtrees
    /// so the disk backend ends up with the complete tree, not just the
    /// dirty spine.
    fn save_branch(
        &self,
        node: &mut Node,
        to_snapshot: bool,
        to_recent: bool,
        snapshot_batch: &mut WriteBatch,
        recent_batch: &mut WriteBatch,
        copied: &mut Vec<NodeHash>,
    ) -> Result<u64, TreeError> {
        if node.saved {
            if to_snapshot && !node.persisted {
                let hash = node.hash.ok_or(TreeError::EmptyChildHash)?;
                let migrated = self.persist_branch(&hash, snapshot_batch, copied)?;
                node.persisted = true;
                return Ok(migrated);
            }
            return Ok(0);
        }
        let mut written = 0;
        if let Some(child) = node.left.as_mut() {
            written +=
                self.save_child(child, to_snapshot, to_recent, snapshot_batch, recent_batch, copied)?;
        }
        if let Some(child) = node.right.as_mut() {
            written +=
                self.save_child(child, to_snapshot, to_recent, snapshot_batch, recent_batch, copied)?;
        }
        let hash = node.compute_hash()?;
        let bytes = node.encode()?;
        if to_snapshot {
            snapshot_batch.put(node_key(&hash), bytes.clone());
            node.persisted = true;
        }
        if to_recent {
            recent_batch.put(node_key(&hash), bytes);
        }
        node.saved = true;
        self.cache_node(Arc::new(node.detached()?));
        Ok(written + 1)
    }

    fn save_child(
        &self,
        child: &mut Child,
        to_snapshot: bool,
        to_recent: bool,
        snapshot_batch: &mut WriteBatch,
        recent_batch: &mut WriteBatch,
        copied: &mut Vec<NodeHash>,
    ) -> Result<u64, TreeError> {
        match child {
            Child::Node(node) => self.save_branch(
                node,
                to_snapshot,
                to_recent,
                snapshot_batch,
                recent_batch,
                copied,
            ),
            Child::Hash(hash) => {
                if to_snapshot {
                    self.persist_branch(hash, snapshot_batch, copied)
                } else {
                    Ok(0)
                }
            }
        }
    }

    /// Migrates a committed subtree from the recent backend into the
    /// snapshot batch, stopping at nodes the disk already holds. The raw
    /// stored bytes are reused unchanged. A node absent from both backends
    /// is a broken ancestor chain.
    fn persist_branch(
        &self,
        hash: &NodeHash,
        batch: &mut WriteBatch,
        copied: &mut Vec<NodeHash>,
    ) -> Result<u64, TreeError> {
        if self.snapshot_db.has(&node_key(hash))? {
            return Ok(0);
        }
        let bytes = self
            .recent_db
            .get(&node_key(hash))?
            .ok_or(TreeError::MissingNode(*hash))?;
        let node = Node::decode(&bytes)?;
        let mut migrated = 0;
        if !node.is_leaf() {
            let left = node.left_hash().ok_or(TreeError::EmptyChildHash)?;
            let right = node.right_hash().ok_or(TreeError::EmptyChildHash)?;
            migrated += self.persist_branch(&left, batch, copied)?;
            migrated += self.persist_branch(&right, batch, copied)?;
        }
        batch.put(node_key(hash), bytes);
        copied.push(*hash);
        Ok(migrated + 1)
    }

    /// Evicts the version falling out of the recent window after a commit
    /// of `latest`. Snapshot-cadence versions keep their memory copy: their
    /// nodes back newer recent versions too.
    pub(crate) fn prune_recent(&self, latest: Version) -> Result<Option<Version>, TreeError> {
        if !self.opts.keeps_recent() || latest <= self.opts.keep_recent {
            return Ok(None);
        }
        let prune = latest - self.opts.keep_recent;
        if self.opts.is_snapshot_version(prune) {
            return Ok(None);
        }
        let in_recent = {
            let indexes = self.indexes.read().unwrap();
            indexes.versions.get(&prune).map_or(false, |r| r.recent)
        };
        if !in_recent {
            return Ok(None);
        }
        self.delete_version_from(BackendKind::Recent, prune)?;
        log::debug!("pruned version {} from the recent window", prune);
        Ok(Some(prune))
    }

    /// Deletes a committed version from every backend retaining it. The
    /// latest version and version 0 are never deletable.
    pub(crate) fn delete_version(&self, version: Version) -> Result<(), TreeError> {
        if version == 0 {
            return Err(TreeError::invalid_version(
                version,
                "version 0 is never committed",
            ));
        }
        let retention = {
            let indexes = self.indexes.read().unwrap();
            if indexes.versions.keys().next_back() == Some(&version) {
                return Err(TreeError::invalid_version(
                    version,
                    "cannot delete the latest version",
                ));
            }
            match indexes.versions.get(&version) {
                Some(retention) => *retention,
                None => return Err(TreeError::VersionDoesNotExist(version)),
            }
        };
        if retention.recent {
            self.delete_version_from(BackendKind::Recent, version)?;
        }
        if retention.snapshot {
            self.delete_version_from(BackendKind::Snapshot, version)?;
        }
        log::info!("deleted version {}", version);
        Ok(())
    }

    /// Removes one backend's records for `version` and reclaims nodes that
    /// lost their last referencing version there.
    ///
    /// Reachability is judged against this backend's own retained versions:
    /// an orphan that died at `version` survives only through the
    /// predecessor, one born at `version` only through the successor.
    /// Orphan intervals strictly straddling `version` are left untouched.
    fn delete_version_from(&self, kind: BackendKind, version: Version) -> Result<(), TreeError> {
        let (pred, succ, died_here, born_here) = {
            let indexes = self.indexes.read().unwrap();
            let mut pred = None;
            let mut succ = None;
            for (&v, retention) in indexes.versions.iter() {
                if v == version || !retention.has(kind) {
                    continue;
                }
                if v < version {
                    pred = Some(v);
                } else {
                    succ = succ.or(Some(v));
                }
            }
            let orphans = indexes.orphans(kind);
            let died_here: Vec<Orphan> = orphans.get(&version).cloned().unwrap_or_default();
            let born_here: Vec<(Version, Orphan)> = orphans
                .range((Bound::Excluded(version), Bound::Unbounded))
                .flat_map(|(&to, group)| {
                    group
                        .iter()
                        .filter(|orphan| orphan.from == version)
                        .map(move |orphan| (to, *orphan))
                })
                .collect();
            (pred, succ, died_here, born_here)
        };

        let mut batch = WriteBatch::new();
        for orphan in &died_here {
            batch.delete(orphan_key(version, orphan.from, &orphan.hash));
            match pred {
                Some(p) if p >= orphan.from => {
                    // Still reachable through the predecessor: shorten the
                    // lifetime instead of reclaiming.
                    batch.put(orphan_key(p, orphan.from, &orphan.hash), Vec::new());
                }
                _ => {
                    batch.delete(node_key(&orphan.hash));
                    self.uncache_node(&orphan.hash);
                }
            }
        }
        for (to, orphan) in &born_here {
            batch.delete(orphan_key(*to, version, &orphan.hash));
            match succ {
                Some(s) if s <= *to => {
                    batch.put(orphan_key(*to, s, &orphan.hash), Vec::new());
                }
                _ => {
                    batch.delete(node_key(&orphan.hash));
                    self.uncache_node(&orphan.hash);
                }
            }
        }
        batch.delete(root_key(version));

        let sync = kind == BackendKind::Snapshot && self.opts.sync;
        self.backend(kind).write_batch(batch, sync)?;

        let mut indexes = self.indexes.write().unwrap();
        {
            let orphans = indexes.orphans_mut(kind);
            orphans.remove(&version);
            if let Some(p) = pred {
                let survivors: Vec<Orphan> = died_here
                    .iter()
                    .filter(|orphan| p >= orphan.from)
                    .copied()
                    .collect();
                if !survivors.is_empty() {
                    orphans.entry(p).or_default().extend(survivors);
                }
            }
            for (to, orphan) in &born_here {
                if let Some(group) = orphans.get_mut(to) {
                    group.retain(|o| o != orphan);
                    if let Some(s) = succ {
                        if s <= *to {
                            group.push(Orphan {
                                from: s,
                                hash: orphan.hash,
                            });
                        }
                    }
                    if group.is_empty() {
                        orphans.remove(to);
                    }
                }
            }
        }
        if let Some(retention) = indexes.versions.get_mut(&version) {
            retention.clear(kind);
            if retention.is_empty() {
                indexes.versions.remove(&version);
            }
        }
        Ok(())
    }

    /// Promotes a memory-resident version to disk retention, copying every
    /// node absent from the snapshot backend along with the orphan markers
    /// describing the copied nodes. Returns the number of nodes copied.
    pub(crate) fn flush_version(&self, version: Version) -> Result<u64, TreeError> {
        let retention = {
            let indexes = self.indexes.read().unwrap();
            match indexes.versions.get(&version) {
                Some(retention) => *retention,
                None => return Err(TreeError::VersionDoesNotExist(version)),
            }
        };
        if retention.snapshot {
            return Ok(0);
        }
        let root_record = self
            .recent_db
            .get(&root_key(version))?
            .ok_or(TreeError::VersionDoesNotExist(version))?;

        let mut batch = WriteBatch::new();
        let mut copied = Vec::new();
        if !root_record.is_empty() {
            let root = NodeHash::from_slice(&root_record)?;
            self.persist_branch(&root, &mut batch, &mut copied)?;
        }
        batch.put(root_key(version), root_record);

        // Orphan markers describing copied nodes move along, so a later
        // deletion can reclaim the disk copies too.
        let moved_markers: Vec<(Version, Orphan)> = {
            let indexes = self.indexes.read().unwrap();
            let copied_set: HashSet<NodeHash> = copied.iter().copied().collect();
            indexes
                .recent_orphans
                .iter()
                .flat_map(|(&to, group)| {
                    group
                        .iter()
                        .filter(|orphan| copied_set.contains(&orphan.hash))
                        .map(move |orphan| (to, *orphan))
                })
                .collect()
        };
        for (to, orphan) in &moved_markers {
            batch.put(orphan_key(*to, orphan.from, &orphan.hash), Vec::new());
        }

        self.snapshot_db.write_batch(batch, self.opts.sync)?;

        {
            let mut indexes = self.indexes.write().unwrap();
            for (to, orphan) in moved_markers {
                indexes
                    .snapshot_orphans
                    .entry(to)
                    .or_default()
                    .push(orphan);
            }
            if let Some(retention) = indexes.versions.get_mut(&version) {
                retention.set(BackendKind::Snapshot);
            }
        }
        log::info!(
            "flushed version {} to disk ({} nodes copied)",
            version,
            copied.len()
        );

        // A flushed version that already aged out of the recent window no
        // longer needs its memory copy.
        if let Some(latest) = self.latest_version() {
            if self.opts.keeps_recent() && version + self.opts.keep_recent <= latest {
                self.delete_version_from(BackendKind::Recent, version)?;
            }
        }
        Ok(copied.len() as u64)
    }

    /// Whether the snapshot backend holds `hash` (used by structural
    /// audits in tests).
    #[cfg(test)]
    pub(crate) fn snapshot_has_node(&self, hash: &NodeHash) -> Result<bool, TreeError> {
        Ok(self.snapshot_db.has(&node_key(hash))?)
    }
}
