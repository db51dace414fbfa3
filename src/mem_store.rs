//! In-memory storage backend.
//!
//! This module provides [`MemStore`], a simple sorted in-memory store
//! implementing the [`Database`] contract with a [`BTreeMap`] behind a
//! [`RwLock`].
//!
//! # Note
//!
//! `MemStore` is not a tree implementation. It is only the key-value
//! substrate underneath the node database, and it plays two roles:
//!
//! - as the **ephemeral backend** holding the recent-version window in
//!   production configurations, and
//! - as a stand-in for the **persistent backend** in tests and examples.
//!
//! # Handle semantics
//!
//! Cloning a `MemStore` yields another handle onto the *same* underlying
//! map, mirroring how an on-disk backend would be reopened at the same
//! path. Tests rely on this to simulate a crash: keep a clone of the "disk"
//! store, drop the tree, and rebuild against the clone while handing the
//! new tree a fresh (empty) memory store.
//!
//! # Thread safety
//!
//! All access goes through the [`RwLock`]; concurrent readers proceed in
//! parallel and writers are exclusive.

use crate::error::StoreError;
use crate::traits::{Database, WriteBatch, WriteOp};
use std::collections::BTreeMap;
use std::ops::Bound;
use std::sync::{Arc, RwLock};

/// Sorted in-memory implementation of [`Database`].
#[derive(Debug, Default, Clone)]
pub struct MemStore {
    kvs: Arc<RwLock<BTreeMap<Vec<u8>, Vec<u8>>>>,
}

impl MemStore {
    /// Creates an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of keys currently stored.
    pub fn len(&self) -> usize {
        self.kvs.read().unwrap().len()
    }

    /// Whether the store holds no keys.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Database for MemStore {
    fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>, StoreError> {
        Ok(self.kvs.read().unwrap().get(key).cloned())
    }

    fn has(&self, key: &[u8]) -> Result<bool, StoreError> {
        Ok(self.kvs.read().unwrap().contains_key(key))
    }

    fn set(&self, key: &[u8], value: &[u8]) -> Result<(), StoreError> {
        self.kvs
            .write()
            .unwrap()
            .insert(key.to_vec(), value.to_vec());
        Ok(())
    }

    fn delete(&self, key: &[u8]) -> Result<(), StoreError> {
        self.kvs.write().unwrap().remove(key);
        Ok(())
    }

    fn write_batch(&self, batch: WriteBatch, _sync: bool) -> Result<(), StoreError> {
        let mut kvs = self.kvs.write().expect("mem store lock poisoned");
        for op in batch.into_ops() {
            match op {
                WriteOp::Put(key, value) => {
                    kvs.insert(key, value);
                }
                WriteOp::Delete(key) => {
                    kvs.remove(&key);
                }
            }
        }
        Ok(())
    }

    fn iter_range<'a>(
        &'a self,
        start: Option<&[u8]>,
        end: Option<&[u8]>,
        ascending: bool,
    ) -> Result<Box<dyn Iterator<Item = (Vec<u8>, Vec<u8>)> + 'a>, StoreError> {
        let lower = match start {
            Some(s) => Bound::Included(s.to_vec()),
            None => Bound::Unbounded,
        };
        let upper = match end {
            Some(e) => Bound::Excluded(e.to_vec()),
            None => Bound::Unbounded,
        };
        let mut entries: Vec<(Vec<u8>, Vec<u8>)> = self
            .kvs
            .read()
            .unwrap()
            .range((lower, upper))
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        if !ascending {
            entries.reverse();
        }
        Ok(Box::new(entries.into_iter()))
    }
}
