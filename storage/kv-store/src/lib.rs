// Copyright © Aptos Foundation
// SPDX-License-Identifier: Apache-2.0

#![forbid(unsafe_code)]

//! This crate defines [`trait KVStore`](KVStore), the ordered key-value store that sits
//! beneath the multi-version data-structure during block execution.
//!
//! During parallel execution the store is only read (through `&self`, possibly from many
//! worker threads). The block executor mutates it exactly once, after every transaction
//! of the block has been validated.

use bytes::Bytes;
use std::collections::{btree_map::BTreeMap, Bound};
use thiserror::Error;


/// Error reported by a backing store implementation.
#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum StorageError {
    #[error("Storage backend error: {0}")]
    Backend(String),
}

pub type Result<T, E = StorageError> = std::result::Result<T, E>;

/// Ordered iterator over `(key, value)` pairs produced by a [`KVStore`].
pub type StoreIterator<'a> = Box<dyn Iterator<Item = (Bytes, Bytes)> + 'a>;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum IterDirection {
    Ascending,
    Descending,
}

/// Half-open key range `[start, end)`. A missing bound is unbounded on that side.
#[derive(Clone, Debug, Default, PartialEq, Eq, Hash)]
pub struct KeyRange {
    pub start: Option<Bytes>,
    pub end: Option<Bytes>,
}

impl KeyRange {
    pub fn new(start: Option<Bytes>, end: Option<Bytes>) -> Self {
        Self { start, end }
    }

    pub fn from_slices(start: Option<&[u8]>, end: Option<&[u8]>) -> Self {
        Self {
            start: start.map(Bytes::copy_from_slice),
            end: end.map(Bytes::copy_from_slice),
        }
    }

    pub fn all() -> Self {
        Self::default()
    }

    pub fn contains(&self, key: &[u8]) -> bool {
        self.start.as_ref().map_or(true, |start| key >= start.as_ref())
            && self.end.as_ref().map_or(true, |end| key < end.as_ref())
    }

    /// True if no key can fall into the range.
    pub fn is_empty(&self) -> bool {
        matches!((&self.start, &self.end), (Some(start), Some(end)) if start >= end)
    }

    /// Bounds usable with `BTreeMap::range`, callers must check `is_empty` first.
    pub fn bounds(&self) -> (Bound<Bytes>, Bound<Bytes>) {
        (
            self.start.clone().map_or(Bound::Unbounded, Bound::Included),
            self.end.clone().map_or(Bound::Unbounded, Bound::Excluded),
        )
    }
}

/// `KVStore` is the trait of the durable state a block is executed against.
pub trait KVStore: Send + Sync {
    /// Gets the value stored at the given key.
    fn get(&self, key: &[u8]) -> Result<Option<Bytes>>;

    fn has(&self, key: &[u8]) -> Result<bool> {
        Ok(self.get(key)?.is_some())
    }

    fn set(&mut self, key: Bytes, value: Bytes) -> Result<()>;

    fn delete(&mut self, key: &[u8]) -> Result<()>;

    /// Iterates all keys within the range in the given direction.
    fn iter(&self, range: &KeyRange, direction: IterDirection) -> Result<StoreIterator<'_>>;
}

/// Ordered in-memory implementation of [`KVStore`].
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct InMemoryStore {
    data: BTreeMap<Bytes, Bytes>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// The full contents of the store, in key order.
    pub fn data(&self) -> &BTreeMap<Bytes, Bytes> {
        &self.data
    }
}

impl<K: Into<Bytes>, V: Into<Bytes>> FromIterator<(K, V)> for InMemoryStore {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        Self {
            data: iter
                .into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
        }
    }
}

impl KVStore for InMemoryStore {
    fn get(&self, key: &[u8]) -> Result<Option<Bytes>> {
        Ok(self.data.get(key).cloned())
    }

    fn set(&mut self, key: Bytes, value: Bytes) -> Result<()> {
        self.data.insert(key, value);
        Ok(())
    }

    fn delete(&mut self, key: &[u8]) -> Result<()> {
        self.data.remove(key);
        Ok(())
    }

    fn iter(&self, range: &KeyRange, direction: IterDirection) -> Result<StoreIterator<'_>> {
        if range.is_empty() {
            return Ok(Box::new(std::iter::empty()));
        }
        let entries = self
            .data
            .range(range.bounds())
            .map(|(k, v)| (k.clone(), v.clone()));
        Ok(match direction {
            IterDirection::Ascending => Box::new(entries),
            IterDirection::Descending => Box::new(entries.rev()),
        })
    }
}
