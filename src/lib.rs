#![doc = include_str!("../README.md")]

pub mod encoding;
pub mod error;
pub mod mem_store;
mod node;
mod nodedb;
pub mod traits;
pub mod tree;
pub mod types;

#[cfg(test)]
mod fuzz;

pub use error::{StoreError, TreeError};
pub use mem_store::MemStore;
pub use traits::{Database, WriteBatch, WriteOp};
pub use tree::{ImmutableTree, KeyProof, LeafWitness, MutableTree, ProofError, ProofStep};
pub use types::{NodeHash, Options, Version};

#[cfg(test)]
mod tests {
    use super::*;

    /// A simple end-to-end test demonstrating the complete workflow:
    /// mutate, commit, read historical versions, prove, crash and reload.
    #[test]
    fn basic_integration_test() -> Result<(), TreeError> {
        let disk = MemStore::new();
        let mut tree = MutableTree::new(
            Box::new(disk.clone()),
            Box::new(MemStore::new()),
            256,
            Options::new(2, 3, false)?,
        )?;
        tree.load()?;

        // Build and commit two versions.
        tree.set(b"alpha", b"1")?;
        tree.set(b"beta", b"2")?;
        let (_, v1) = tree.save_version()?;
        tree.set(b"alpha", b"updated")?;
        tree.set(b"gamma", b"3")?;
        let (hash2, v2) = tree.save_version()?;
        assert_eq!((v1, v2), (1, 2));

        // Both versions stay readable with their own contents.
        assert_eq!(tree.get_versioned(b"alpha", 1)?, Some(b"1".to_vec()));
        assert_eq!(tree.get_versioned(b"alpha", 2)?, Some(b"updated".to_vec()));
        assert_eq!(tree.available_versions(), vec![1, 2]);

        // A proof for a committed key verifies against the root hash.
        let (value, proof) = tree.get_with_proof(b"gamma")?;
        assert_eq!(value.as_deref(), Some(b"3".as_slice()));
        proof
            .verify(hash2.as_ref(), b"gamma", value.as_deref())
            .expect("membership proof must verify");

        // Snapshots are independent read handles.
        let snapshot = tree.get_immutable(2)?;
        let mut keys = Vec::new();
        snapshot.iterate(|key, _| {
            keys.push(key.to_vec());
            false
        })?;
        assert_eq!(keys, vec![b"alpha".to_vec(), b"beta".to_vec(), b"gamma".to_vec()]);

        // Crash: the memory backend is lost; disk-retained version 2
        // (2 % keep_every == 0) survives with the same root hash.
        drop(tree);
        let mut reloaded = MutableTree::new(
            Box::new(disk),
            Box::new(MemStore::new()),
            256,
            Options::new(2, 3, false)?,
        )?;
        assert_eq!(reloaded.load()?, 2);
        assert_eq!(reloaded.hash(), hash2);
        assert_eq!(reloaded.get(b"beta")?.1, Some(b"2".to_vec()));
        Ok(())
    }
}
