// Copyright © Aptos Foundation
// SPDX-License-Identifier: Apache-2.0

use crate::{
    merge_iterator::IterItem,
    types::{TxnIndex, WriteSet},
};
use bytes::Bytes;
use occ_kv_store::{KVStore, KeyRange, StorageError};
use std::collections::BTreeMap;

/// UnsyncMap is designed to mimic the functionality of MVStore for sequential execution.
/// In this case only the latest recorded version is relevant, simplifying the
/// implementation.
#[derive(Default)]
pub struct UnsyncMap {
    // Key -> (index of the last writer, value or deletion).
    map: BTreeMap<Bytes, (TxnIndex, Option<Bytes>)>,
}

impl UnsyncMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Latest write to the key, Some(None) being a deletion. None if the key was not
    /// written during the block.
    pub fn read(&self, key: &[u8]) -> Option<(TxnIndex, Option<Bytes>)> {
        self.map.get(key).cloned()
    }

    pub fn write(&mut self, key: Bytes, txn_idx: TxnIndex, value: Option<Bytes>) {
        self.map.insert(key, (txn_idx, value));
    }

    pub fn apply(&mut self, txn_idx: TxnIndex, write_set: &WriteSet) {
        for (key, value) in write_set {
            self.write(key.clone(), txn_idx, value.clone());
        }
    }

    pub fn collect_iterator_items(&self, range: &KeyRange) -> BTreeMap<Bytes, IterItem> {
        if range.is_empty() {
            return BTreeMap::new();
        }
        self.map
            .iter()
            .filter(|(key, _)| range.contains(key))
            .map(|(key, (txn_idx, value))| {
                (key.clone(), IterItem::Versioned((*txn_idx, 0), value.clone()))
            })
            .collect()
    }

    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }

    /// Applies every overlay entry to the store in key order, returning the number of
    /// keys written.
    pub fn write_to_store<S: KVStore + ?Sized>(&self, store: &mut S) -> Result<usize, StorageError> {
        for (key, (_, value)) in &self.map {
            match value {
                Some(value) => store.set(key.clone(), value.clone())?,
                None => store.delete(key)?,
            }
        }
        Ok(self.map.len())
    }
}
