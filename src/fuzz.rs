//! Randomized end-to-end testing against a reference oracle.
//!
//! Drives the public tree API with seeded random operation sequences
//! (insert/update/remove, commits, version deletions, flushes and
//! crash-simulating reloads) while mirroring the expected state in plain
//! `BTreeMap`s:
//!
//! - one mirror of the working tree,
//! - one mirror per disk-retained version,
//! - one mirror per memory-retained version.
//!
//! After every commit the test checks the working tree and every retained
//! version against its mirror, checks `available_versions` against the
//! mirror bookkeeping, and audits the structural invariants (AVL balance,
//! size/height consistency, strict key order, inner keys equal to the
//! smallest key of their right subtree).

use crate::mem_store::MemStore;
use crate::node::Node;
use crate::nodedb::NodeDb;
use crate::tree::{ImmutableTree, MutableTree};
use crate::types::{NodeHash, Options, Version};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::collections::BTreeMap;

/// Structural audit of the working tree.
pub(crate) fn check_invariants(tree: &MutableTree) {
    if let Some(root) = tree.working_root_for_audit().unwrap() {
        audit_node(tree.ndb().as_ref(), &root);
    }
    let mut prev: Option<Vec<u8>> = None;
    let mut count = 0i64;
    tree.iterate(|key, _| {
        if let Some(prev) = &prev {
            assert!(prev.as_slice() < key, "iteration must be strictly ascending");
        }
        prev = Some(key.to_vec());
        count += 1;
        false
    })
    .unwrap();
    assert_eq!(count, tree.size().unwrap());
}

/// Recursive structural audit; returns (height, size, min key, max key).
fn audit_node(ndb: &NodeDb, node: &Node) -> (i8, i64, Vec<u8>, Vec<u8>) {
    node.validate().unwrap();
    if node.is_leaf() {
        return (0, 1, node.key.clone(), node.key.clone());
    }
    let left = node.left_node(ndb).unwrap();
    let right = node.right_node(ndb).unwrap();
    let (left_height, left_size, left_min, left_max) = audit_node(ndb, &left);
    let (right_height, right_size, right_min, right_max) = audit_node(ndb, &right);

    assert_eq!(node.height, left_height.max(right_height) + 1);
    assert_eq!(node.size, left_size + right_size);
    assert!(
        (i32::from(left_height) - i32::from(right_height)).abs() <= 1,
        "AVL balance violated at {:?}",
        node
    );
    assert!(left_max.as_slice() < node.key.as_slice());
    assert_eq!(right_min, node.key, "inner key must start its right subtree");
    (node.height, node.size, left_min, right_max)
}

/// Asserts that every node reachable from a disk-retained version is
/// actually present in the disk backend.
pub(crate) fn check_committed_on_disk(tree: &MutableTree, version: Version) {
    let snapshot = tree.get_immutable(version).unwrap();
    if let Some(root) = snapshot.root_hash() {
        walk_disk(tree.ndb().as_ref(), &root);
    }
}

fn walk_disk(ndb: &NodeDb, hash: &NodeHash) {
    assert!(
        ndb.snapshot_has_node(hash).unwrap(),
        "node {} reachable from a disk root but missing from disk",
        hash
    );
    let node = ndb.get_node(hash).unwrap();
    assert!(node.saved);
    if !node.is_leaf() {
        walk_disk(ndb, &node.left_hash().unwrap());
        walk_disk(ndb, &node.right_hash().unwrap());
    }
}

type Mirror = BTreeMap<Vec<u8>, Vec<u8>>;

fn assert_mirror_snapshot(snapshot: &ImmutableTree, mirror: &Mirror) {
    let mut iterated = 0usize;
    snapshot
        .iterate(|key, value| {
            assert_eq!(
                mirror.get(key).map(|v| v.as_slice()),
                Some(value),
                "unexpected entry {} at version {}",
                hex::encode(key),
                snapshot.version()
            );
            iterated += 1;
            false
        })
        .unwrap();
    assert_eq!(iterated as i64, snapshot.size().unwrap());
    assert_eq!(iterated, mirror.len());
    for (key, value) in mirror {
        assert_eq!(snapshot.get(key).unwrap().1.as_deref(), Some(value.as_slice()));
    }
}

fn assert_mirror_working(tree: &MutableTree, mirror: &Mirror) {
    let mut iterated = 0usize;
    tree.iterate(|key, value| {
        assert_eq!(mirror.get(key).map(|v| v.as_slice()), Some(value));
        iterated += 1;
        false
    })
    .unwrap();
    assert_eq!(iterated, mirror.len());
    for (key, value) in mirror {
        assert_eq!(tree.get(key).unwrap().1.as_deref(), Some(value.as_slice()));
    }
}

fn mirror_versions(disk: &BTreeMap<Version, Mirror>, mem: &BTreeMap<Version, Mirror>) -> Vec<Version> {
    let mut versions: Vec<Version> = disk.keys().chain(mem.keys()).copied().collect();
    versions.sort_unstable();
    versions.dedup();
    versions
}

fn random_key(rng: &mut StdRng) -> Vec<u8> {
    let mut raw = [0u8; 12];
    rng.fill(&mut raw[..]);
    hex::encode(raw).into_bytes()
}

fn load_tree(rng: &mut StdRng, disk: &MemStore) -> (MutableTree, Version, Options) {
    let keep_recent = rng.gen_range(0..=8u64);
    let keep_every = if keep_recent == 0 {
        1
    } else {
        rng.gen_range(1..=8u64)
    };
    let options = Options::new(keep_every, keep_recent, rng.gen_bool(0.3)).unwrap();
    let cache_size = if rng.gen_bool(0.4) {
        rng.gen_range(1..=4096)
    } else {
        0
    };
    let mut tree = MutableTree::new(
        Box::new(disk.clone()),
        Box::new(MemStore::new()),
        cache_size,
        options,
    )
    .unwrap();
    let version = tree.load().unwrap();
    (tree, version, options)
}

/// Orphan interval adjustments when versions die: an interval ending at
/// the deleted version is truncated onto the predecessor, one starting
/// there is shifted onto the successor, and single-version intervals
/// reclaim their node. Historical content must survive every shape.
#[test]
fn test_orphan_interval_adjustments() {
    let mut tree = MutableTree::new(
        Box::new(MemStore::new()),
        Box::new(MemStore::new()),
        64,
        Options::default(),
    )
    .unwrap();

    // v1: both keys; v2: update a; v3: update b; v4: update a again.
    tree.set(b"a", b"a1").unwrap();
    tree.set(b"b", b"b1").unwrap();
    tree.save_version().unwrap();
    tree.set(b"a", b"a2").unwrap();
    tree.save_version().unwrap();
    tree.set(b"b", b"b3").unwrap();
    tree.save_version().unwrap();
    tree.set(b"a", b"a4").unwrap();
    tree.save_version().unwrap();

    // Deleting v2 truncates the lifetime of nodes that died at v2 onto v1
    // (the leaf holding b1 stays reachable there) and shifts the lifetime
    // of nodes born at v2 onto v3 (the leaf holding a2 backs v3).
    tree.delete_version(2).unwrap();
    assert_eq!(tree.available_versions(), vec![1, 3, 4]);
    assert_eq!(tree.get_versioned(b"a", 1).unwrap(), Some(b"a1".to_vec()));
    assert_eq!(tree.get_versioned(b"b", 1).unwrap(), Some(b"b1".to_vec()));
    assert_eq!(tree.get_versioned(b"a", 3).unwrap(), Some(b"a2".to_vec()));
    assert_eq!(tree.get_versioned(b"b", 3).unwrap(), Some(b"b3".to_vec()));

    // Deleting v3 collapses the shifted interval; v1 and v4 keep their
    // exact contents.
    tree.delete_version(3).unwrap();
    assert_eq!(tree.available_versions(), vec![1, 4]);
    assert_eq!(tree.get_versioned(b"a", 1).unwrap(), Some(b"a1".to_vec()));
    assert_eq!(tree.get_versioned(b"b", 1).unwrap(), Some(b"b1".to_vec()));
    assert_eq!(tree.get_versioned(b"a", 4).unwrap(), Some(b"a4".to_vec()));
    assert_eq!(tree.get_versioned(b"b", 4).unwrap(), Some(b"b3".to_vec()));

    tree.delete_version(1).unwrap();
    assert_eq!(tree.available_versions(), vec![4]);
    assert_eq!(tree.get_versioned(b"a", 4).unwrap(), Some(b"a4".to_vec()));
}

/// Randomized operation sequences mirrored in a known-good map, with
/// random version deletion, flushing and crash-simulating reloads.
#[test]
fn test_random_operations_mirror() {
    const SEED: u64 = 49_872_768_940;
    const VERSIONS: Version = 48;
    const VERSION_OPS: usize = 48;
    const UPDATE_RATIO: f64 = 0.4;
    const DELETE_RATIO: f64 = 0.2;
    const RELOAD_CHANCE: f64 = 0.1;
    const DELETE_CHANCE: f64 = 0.1;
    const FLUSH_CHANCE: f64 = 0.1;

    let mut rng = StdRng::seed_from_u64(SEED);
    let disk = MemStore::new();

    let (mut tree, mut version, mut options) = load_tree(&mut rng, &disk);

    let mut mirror: Mirror = Mirror::new();
    let mut mirror_keys: Vec<Vec<u8>> = Vec::new();
    let mut disk_mirrors: BTreeMap<Version, Mirror> = BTreeMap::new();
    let mut mem_mirrors: BTreeMap<Version, Mirror> = BTreeMap::new();

    while version < VERSIONS {
        for _ in 0..VERSION_OPS {
            let roll = rng.gen_range(0.0..1.0);
            if !mirror.is_empty() && roll < DELETE_RATIO {
                let index = rng.gen_range(0..mirror_keys.len());
                let key = mirror_keys.swap_remove(index);
                let (old, removed) = tree.remove(&key).unwrap();
                assert!(removed);
                assert_eq!(old, mirror.remove(&key));
            } else if !mirror.is_empty() && roll < DELETE_RATIO + UPDATE_RATIO {
                let key = mirror_keys[rng.gen_range(0..mirror_keys.len())].clone();
                let value = random_key(&mut rng);
                assert!(tree.set(&key, &value).unwrap());
                mirror.insert(key, value);
            } else {
                let mut key = random_key(&mut rng);
                while tree.has(&key).unwrap() {
                    key = random_key(&mut rng);
                }
                let value = random_key(&mut rng);
                assert!(!tree.set(&key, &value).unwrap());
                mirror.insert(key.clone(), value);
                mirror_keys.push(key);
            }
        }
        let (_, committed) = tree.save_version().unwrap();
        version = committed;

        check_invariants(&tree);
        assert_mirror_working(&tree, &mirror);

        // Mirror the retention policy.
        if version % options.keep_every == 0 {
            disk_mirrors.insert(version, mirror.clone());
        }
        if options.keep_recent > 0 {
            mem_mirrors.insert(version, mirror.clone());
            if version > options.keep_recent {
                mem_mirrors.remove(&(version - options.keep_recent));
            }
        }

        // Randomly flush a non-latest version to disk.
        if rng.gen_bool(FLUSH_CHANCE) {
            let versions = mirror_versions(&disk_mirrors, &mem_mirrors);
            if versions.len() >= 2 {
                let flush = versions[rng.gen_range(0..versions.len() - 1)];
                tree.flush_version(flush).unwrap();
                if let Some(mirrored) = mem_mirrors.get(&flush).cloned() {
                    disk_mirrors.insert(flush, mirrored);
                }
            }
        }

        // Randomly delete a non-latest version.
        if rng.gen_bool(DELETE_CHANCE) {
            let versions = mirror_versions(&disk_mirrors, &mem_mirrors);
            if versions.len() > 2 {
                let doomed = versions[rng.gen_range(0..versions.len() - 1)];
                tree.delete_version(doomed).unwrap();
                disk_mirrors.remove(&doomed);
                mem_mirrors.remove(&doomed);
            }
        }

        // Randomly "crash": rebuild from the disk backend with fresh
        // memory, discarding memory-only versions.
        if rng.gen_bool(RELOAD_CHANCE) {
            let (new_tree, loaded, new_options) = load_tree(&mut rng, &disk);
            tree = new_tree;
            version = loaded;
            options = new_options;
            assert_eq!(
                version,
                disk_mirrors.keys().next_back().copied().unwrap_or(0),
                "reload must land on the latest disk version"
            );
            mem_mirrors.clear();
            mirror = disk_mirrors.get(&version).cloned().unwrap_or_default();
            mirror_keys = mirror.keys().cloned().collect();
        }

        // Every retained version matches its mirror, and the retained set
        // matches the bookkeeping.
        assert_eq!(
            tree.available_versions(),
            mirror_versions(&disk_mirrors, &mem_mirrors)
        );
        for (&v, mirrored) in disk_mirrors.iter().chain(mem_mirrors.iter()) {
            let snapshot = tree.get_immutable(v).unwrap();
            assert_mirror_snapshot(&snapshot, mirrored);
        }
    }
}
