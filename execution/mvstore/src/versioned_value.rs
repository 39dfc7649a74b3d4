// Copyright © Aptos Foundation
// SPDX-License-Identifier: Apache-2.0

use crate::{
    merge_iterator::IterItem,
    types::{Flag, Incarnation, MVDataError, MVDataOutput, TxnIndex},
};
use bytes::Bytes;
use crossbeam::utils::CachePadded;
use std::collections::BTreeMap;

/// Every entry in shared multi-version data-structure has an "estimate" flag
/// and some content.
struct Entry {
    incarnation: Incarnation,
    flag: Flag,
    // None is a deletion marker.
    value: Option<Bytes>,
}

impl Entry {
    fn new(incarnation: Incarnation, value: Option<Bytes>) -> Self {
        Self {
            incarnation,
            flag: Flag::Done,
            value,
        }
    }
}

/// A versioned value internally is represented as a BTreeMap from indices of
/// transactions that update the given access path & the corresponding entries.
///
/// Synchronization is provided by the DashMap that owns the cell: writers hold the
/// shard lock exclusively, readers share it.
#[derive(Default)]
pub(crate) struct VersionedValue {
    versioned_map: BTreeMap<TxnIndex, CachePadded<Entry>>,
}

impl VersionedValue {
    pub(crate) fn write(&mut self, txn_idx: TxnIndex, incarnation: Incarnation, value: Option<Bytes>) {
        self.versioned_map
            .insert(txn_idx, CachePadded::new(Entry::new(incarnation, value)));
    }

    /// Marks the entry written at txn_idx as an estimate. Returns false if there is no
    /// such entry.
    pub(crate) fn mark_estimate(&mut self, txn_idx: TxnIndex) -> bool {
        match self.versioned_map.get_mut(&txn_idx) {
            Some(entry) => {
                entry.flag = Flag::Estimate;
                true
            },
            None => false,
        }
    }

    pub(crate) fn remove(&mut self, txn_idx: TxnIndex) {
        self.versioned_map.remove(&txn_idx);
    }

    /// Resolves the entry with the highest index strictly below txn_idx.
    pub(crate) fn read(&self, txn_idx: TxnIndex) -> Result<MVDataOutput, MVDataError> {
        match self.versioned_map.range(0..txn_idx).next_back() {
            Some((idx, entry)) => match entry.flag {
                Flag::Estimate => Err(MVDataError::Dependency(*idx)),
                Flag::Done => Ok(MVDataOutput::Versioned(
                    (*idx, entry.incarnation),
                    entry.value.clone(),
                )),
            },
            None => Err(MVDataError::NotFound),
        }
    }

    /// Read result in the shape consumed by the merge iterator, None if the reader
    /// should go to storage.
    pub(crate) fn iter_item(&self, txn_idx: TxnIndex) -> Option<IterItem> {
        match self.read(txn_idx) {
            Ok(MVDataOutput::Versioned(version, value)) => Some(IterItem::Versioned(version, value)),
            Err(MVDataError::Dependency(dep_idx)) => Some(IterItem::Estimate(dep_idx)),
            Err(MVDataError::NotFound) => None,
        }
    }

    /// The entry of the highest transaction index, as (index, flag, value).
    pub(crate) fn latest(&self) -> Option<(TxnIndex, bool, Option<Bytes>)> {
        self.versioned_map
            .iter()
            .next_back()
            .map(|(idx, entry)| (*idx, entry.flag == Flag::Estimate, entry.value.clone()))
    }

    #[cfg(test)]
    pub(crate) fn indices(&self) -> Vec<TxnIndex> {
        self.versioned_map.keys().copied().collect()
    }
}
