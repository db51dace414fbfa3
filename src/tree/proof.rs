//! Path proofs binding a key (or its absence) to a root hash.
//!
//! A proof carries the leaf actually visited when descending for the key,
//! plus one step per inner node on the way back up: enough to recompute the
//! root hash without any other tree data. Values enter leaf hashes only
//! through their SHA-256, so a proof never has to reveal sibling values.

use crate::encoding;
use crate::types::{NodeHash, Version};
use sha2::{Digest, Sha256};
use thiserror::Error;

/// Error type for proof verification.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ProofError {
    /// The recomputed root hash does not match the expected one.
    #[error("proof root {computed} does not match expected root {expected}")]
    RootMismatch {
        /// Root hash the verifier trusts.
        expected: NodeHash,
        /// Root hash recomputed from the proof.
        computed: NodeHash,
    },
    /// The witness leaf is incompatible with the claim being verified.
    #[error("witness leaf does not support the claim for this key")]
    KeyMismatch,
    /// The claimed value does not hash to the witness value hash.
    #[error("value does not match the witness value hash")]
    ValueMismatch,
    /// A non-empty tree proof must carry a leaf witness.
    #[error("proof carries no leaf witness for a non-empty root")]
    MissingWitness,
}

/// One inner node on the path from the witness leaf to the root.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ProofStep {
    /// Height of the inner node.
    pub height: i8,
    /// Leaf count of the inner node.
    pub size: i64,
    /// Version the inner node was created at.
    pub version: Version,
    /// Hash of the child not on the path.
    pub sibling: NodeHash,
    /// Whether the sibling is the left child.
    pub sibling_on_left: bool,
}

/// The leaf reached by descending for the proven key. For an absent key
/// this is the leaf occupying the position the key would descend to.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LeafWitness {
    /// Key stored in the visited leaf.
    pub key: Vec<u8>,
    /// SHA-256 of the leaf's value.
    pub value_hash: [u8; 32],
    /// Version the leaf was created at.
    pub version: Version,
}

/// Proof for one key against one root hash.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct KeyProof {
    /// Steps ordered leaf to root.
    pub steps: Vec<ProofStep>,
    /// `None` only for the empty tree.
    pub leaf: Option<LeafWitness>,
}

impl KeyProof {
    /// Verifies this proof against `root`.
    ///
    /// With `value = Some(v)` the proof claims membership: the witness leaf
    /// must hold `key` with a value hashing to the witness hash. With
    /// `value = None` it claims absence: the witness leaf must hold a
    /// *different* key while still folding up to `root`. `root = None`
    /// verifies against the empty tree.
    pub fn verify(
        &self,
        root: Option<&NodeHash>,
        key: &[u8],
        value: Option<&[u8]>,
    ) -> Result<(), ProofError> {
        let Some(root) = root else {
            // The empty tree holds nothing: only absence claims verify.
            return match (value, &self.leaf) {
                (None, None) => Ok(()),
                _ => Err(ProofError::KeyMismatch),
            };
        };
        let witness = self.leaf.as_ref().ok_or(ProofError::MissingWitness)?;

        match value {
            Some(value) => {
                if witness.key != key {
                    return Err(ProofError::KeyMismatch);
                }
                let digest: [u8; 32] = Sha256::digest(value).into();
                if digest != witness.value_hash {
                    return Err(ProofError::ValueMismatch);
                }
            }
            None => {
                if witness.key == key {
                    return Err(ProofError::KeyMismatch);
                }
            }
        }

        let mut current = leaf_hash(witness);
        for step in &self.steps {
            current = step_hash(step, &current);
        }
        if current != *root {
            return Err(ProofError::RootMismatch {
                expected: *root,
                computed: current,
            });
        }
        Ok(())
    }
}

/// Leaf hash from the witness fields alone, mirroring the canonical leaf
/// hash-input encoding.
fn leaf_hash(witness: &LeafWitness) -> NodeHash {
    let mut buf = Vec::with_capacity(64);
    encoding::put_int8(&mut buf, 0);
    encoding::put_varint(&mut buf, 1);
    encoding::put_varint(&mut buf, witness.version as i64);
    encoding::put_bytes(&mut buf, &witness.key);
    encoding::put_bytes(&mut buf, &witness.value_hash);
    NodeHash::new(Sha256::digest(&buf).into())
}

/// Inner-node hash from a step and the hash computed so far. The inner key
/// is not part of the hash input, which is what makes these compact steps
/// sufficient.
fn step_hash(step: &ProofStep, below: &NodeHash) -> NodeHash {
    let (left, right) = if step.sibling_on_left {
        (&step.sibling, below)
    } else {
        (below, &step.sibling)
    };
    let mut buf = Vec::with_capacity(96);
    encoding::put_int8(&mut buf, step.height);
    encoding::put_varint(&mut buf, step.size);
    encoding::put_varint(&mut buf, step.version as i64);
    encoding::put_bytes(&mut buf, left.as_ref());
    encoding::put_bytes(&mut buf, right.as_ref());
    NodeHash::new(Sha256::digest(&buf).into())
}
