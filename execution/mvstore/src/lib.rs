// Copyright © Aptos Foundation
// SPDX-License-Identifier: Apache-2.0

#![forbid(unsafe_code)]

use crate::{
    captured_reads::{CapturedReads, IterationTracker, ReadSetValidation, ReplayOutcome},
    merge_iterator::{IterItem, MergeIterator},
    types::{
        code_invariant_error, Incarnation, MVDataError, MVDataOutput, MVStoreError, PanicError,
        TxnIndex, WriteSet,
    },
    versioned_value::VersionedValue,
};
use arc_swap::ArcSwapOption;
use bytes::Bytes;
use crossbeam::utils::CachePadded;
use dashmap::DashMap;
use occ_kv_store::{KVStore, KeyRange, StorageError};
use parking_lot::RwLock;
use std::{
    collections::{BTreeMap, BTreeSet},
    sync::Arc,
};
use tokio_util::sync::CancellationToken;
use tracing::trace;

pub mod captured_reads;
pub mod merge_iterator;
pub mod types;
pub mod unsync_map;
mod versioned_value;

#[cfg(test)]
mod unit_tests;

/// Main multi-version data-structure used by threads to read/write during parallel
/// execution.
///
/// Concurrency is managed by DashMap, i.e. when a method accesses a BTreeMap at a
/// given key, it holds exclusive access and doesn't need to explicitly synchronize
/// with other reader/writers.
///
/// Next to the versioned data the store keeps an ordered index of every written key, and
/// per transaction index, the keys written and the reads captured by the latest recorded
/// incarnation.
pub struct MVStore {
    data: DashMap<Bytes, VersionedValue>,
    // Keys are never removed from the index, a key whose cell has no entries is skipped.
    key_index: RwLock<BTreeSet<Bytes>>,
    last_written_keys: Vec<CachePadded<RwLock<BTreeSet<Bytes>>>>,
    last_reads: Vec<CachePadded<ArcSwapOption<CapturedReads>>>,
}

impl MVStore {
    pub fn new(num_txns: usize) -> Self {
        Self {
            data: DashMap::new(),
            key_index: RwLock::new(BTreeSet::new()),
            last_written_keys: (0..num_txns)
                .map(|_| CachePadded::new(RwLock::new(BTreeSet::new())))
                .collect(),
            last_reads: (0..num_txns)
                .map(|_| CachePadded::new(ArcSwapOption::empty()))
                .collect(),
        }
    }

    pub fn num_txns(&self) -> usize {
        self.last_reads.len()
    }

    fn written_keys(&self, txn_idx: TxnIndex) -> Result<&RwLock<BTreeSet<Bytes>>, PanicError> {
        self.last_written_keys
            .get(txn_idx as usize)
            .map(|keys| &**keys)
            .ok_or_else(|| code_invariant_error(format!("Index {} out of bounds", txn_idx)))
    }

    /// Stores a concrete entry, replacing any prior entry at (key, txn_idx).
    pub fn write(&self, key: Bytes, txn_idx: TxnIndex, incarnation: Incarnation, value: Option<Bytes>) {
        // The index lock is never taken while a shard guard is held.
        if !self.key_index.read().contains(&key) {
            self.key_index.write().insert(key.clone());
        }
        self.data
            .entry(key)
            .or_default()
            .write(txn_idx, incarnation, value);
    }

    /// Marks the entry at (key, txn_idx) as an estimate.
    pub fn write_estimate(&self, key: &[u8], txn_idx: TxnIndex) -> Result<(), PanicError> {
        let marked = self
            .data
            .get_mut(key)
            .map_or(false, |mut cell| cell.mark_estimate(txn_idx));
        if marked {
            Ok(())
        } else {
            Err(code_invariant_error(format!(
                "No entry to mark as estimate for txn {} at key {:?}",
                txn_idx, key
            )))
        }
    }

    /// Marks every key of the last recorded write-set of txn_idx as an estimate.
    pub fn mark_estimates(&self, txn_idx: TxnIndex) -> Result<(), PanicError> {
        let keys = self.written_keys(txn_idx)?.read();
        for key in keys.iter() {
            self.write_estimate(key, txn_idx)?;
        }
        Ok(())
    }

    pub fn remove(&self, key: &[u8], txn_idx: TxnIndex) {
        if let Some(mut cell) = self.data.get_mut(key) {
            cell.remove(txn_idx);
        }
    }

    /// Read the entry written by the highest transaction below txn_idx.
    pub fn read(&self, key: &[u8], txn_idx: TxnIndex) -> Result<MVDataOutput, MVDataError> {
        self.data
            .get(key)
            .map_or(Err(MVDataError::NotFound), |cell| cell.read(txn_idx))
    }

    /// Publishes an incarnation: applies its write-set, removes the entries of keys written
    /// by the previous incarnation but not by this one, and stores the captured reads.
    /// Returns true if a key outside of the previous write-set was written.
    pub fn record(
        &self,
        txn_idx: TxnIndex,
        incarnation: Incarnation,
        write_set: &WriteSet,
        captured_reads: CapturedReads,
    ) -> Result<bool, PanicError> {
        let reads = self
            .last_reads
            .get(txn_idx as usize)
            .ok_or_else(|| code_invariant_error(format!("Index {} out of bounds", txn_idx)))?;
        reads.store(Some(Arc::new(captured_reads)));

        let mut prev_keys = self.written_keys(txn_idx)?.write();
        for (key, value) in write_set {
            self.write(key.clone(), txn_idx, incarnation, value.clone());
        }
        for stale in prev_keys.iter().filter(|key| !write_set.contains_key(*key)) {
            self.remove(stale, txn_idx);
        }

        let wrote_new_key = write_set.keys().any(|key| !prev_keys.contains(key));
        *prev_keys = write_set.keys().cloned().collect();
        Ok(wrote_new_key)
    }

    /// Reads captured by the last recorded incarnation of txn_idx.
    pub fn last_reads(&self, txn_idx: TxnIndex) -> Option<Arc<CapturedReads>> {
        self.last_reads
            .get(txn_idx as usize)
            .and_then(|reads| reads.load_full())
    }

    pub fn has_iterators(&self, txn_idx: TxnIndex) -> bool {
        self.last_reads(txn_idx)
            .map_or(false, |reads| reads.has_iterators())
    }

    /// Snapshot of the versioned items within range visible to txn_idx, including
    /// deletions and estimates.
    pub fn collect_iterator_items(
        &self,
        txn_idx: TxnIndex,
        range: &KeyRange,
    ) -> BTreeMap<Bytes, IterItem> {
        if range.is_empty() {
            return BTreeMap::new();
        }
        let keys: Vec<Bytes> = self
            .key_index
            .read()
            .range(range.bounds())
            .cloned()
            .collect();
        keys.into_iter()
            .filter_map(|key| {
                let item = self.data.get(&key)?.iter_item(txn_idx)?;
                Some((key, item))
            })
            .collect()
    }

    /// Replays the point reads of the last recorded incarnation of txn_idx.
    pub fn validate_read_set(
        &self,
        txn_idx: TxnIndex,
        base: &dyn KVStore,
    ) -> Result<ReadSetValidation, StorageError> {
        let reads = match self.last_reads(txn_idx) {
            Some(reads) => reads,
            // No incarnation recorded, nothing to validate.
            None => {
                return Ok(ReadSetValidation {
                    valid: true,
                    conflicts: Vec::new(),
                })
            },
        };
        if reads.is_inconsistent() {
            return Ok(ReadSetValidation {
                valid: false,
                conflicts: Vec::new(),
            });
        }

        let mut validation = ReadSetValidation {
            valid: true,
            conflicts: Vec::new(),
        };
        for (key, read) in reads.data_reads() {
            let consistent = match self.read(key, txn_idx) {
                Ok(MVDataOutput::Versioned(version, value)) => {
                    read.is_consistent_with(Some(version), value.as_ref())
                },
                Err(MVDataError::Dependency(dep_idx)) => {
                    validation.conflicts.push(dep_idx);
                    false
                },
                // Storage is not modified during the block.
                Err(MVDataError::NotFound) if read.version.is_none() => true,
                Err(MVDataError::NotFound) => read.value == base.get(key)?,
            };
            validation.valid &= consistent;
        }
        validation.conflicts.sort_unstable();
        validation.conflicts.dedup();
        Ok(validation)
    }

    /// Replays a recorded scan through the merge iterator against the current state.
    pub fn validate_iterator(
        &self,
        txn_idx: TxnIndex,
        tracker: &IterationTracker,
        base: &dyn KVStore,
        cancel: &CancellationToken,
    ) -> ReplayOutcome {
        if cancel.is_cancelled() {
            return ReplayOutcome::Cancelled;
        }

        let mut cache = self.collect_iterator_items(txn_idx, &tracker.range);
        for (key, value) in &tracker.own_writes {
            cache.insert(key.clone(), IterItem::Own(value.clone()));
        }
        let parent = match base.iter(&tracker.range, tracker.direction) {
            Ok(parent) => parent,
            Err(err) => return ReplayOutcome::Storage(err),
        };
        let mut replay = MergeIterator::new(parent, cache, tracker.direction);

        for expected in &tracker.produced {
            if cancel.is_cancelled() {
                return ReplayOutcome::Cancelled;
            }
            match replay.next() {
                Some(Ok(item)) if item.key == *expected => {},
                Some(Err(dep_idx)) => return ReplayOutcome::Dependency(dep_idx),
                Some(Ok(_)) | None => return ReplayOutcome::Mismatch,
            }
        }

        if !tracker.exhausted {
            trace!(
                txn_idx = txn_idx,
                early_stop_key = ?tracker.early_stop_key,
                "scan stopped early, replay matched"
            );
            return ReplayOutcome::Valid;
        }
        if cancel.is_cancelled() {
            return ReplayOutcome::Cancelled;
        }
        match replay.next() {
            None => ReplayOutcome::Valid,
            Some(Err(dep_idx)) => ReplayOutcome::Dependency(dep_idx),
            Some(Ok(_)) => ReplayOutcome::Mismatch,
        }
    }

    /// Replays every recorded scan of txn_idx, returning the first outcome that is not
    /// valid.
    pub fn validate_iterators(
        &self,
        txn_idx: TxnIndex,
        base: &dyn KVStore,
        cancel: &CancellationToken,
    ) -> ReplayOutcome {
        let reads = match self.last_reads(txn_idx) {
            Some(reads) => reads,
            None => return ReplayOutcome::Valid,
        };
        for tracker in reads.iterators() {
            let outcome = self.validate_iterator(txn_idx, tracker, base, cancel);
            if !outcome.is_valid() {
                return outcome;
            }
        }
        ReplayOutcome::Valid
    }

    /// Writes the entry of the highest transaction index of every touched key to the
    /// store, in key order. Returns the number of keys written.
    pub fn write_latest_to_store<S: KVStore + ?Sized>(
        &self,
        store: &mut S,
    ) -> Result<usize, MVStoreError> {
        let mut latest: Vec<(Bytes, TxnIndex, bool, Option<Bytes>)> = self
            .data
            .iter()
            .filter_map(|cell| {
                cell.value()
                    .latest()
                    .map(|(idx, is_estimate, value)| (cell.key().clone(), idx, is_estimate, value))
            })
            .collect();
        latest.sort_unstable_by(|a, b| a.0.cmp(&b.0));

        // The store is left untouched if any entry is still an estimate.
        if let Some((key, txn_idx, _, _)) = latest.iter().find(|(_, _, is_estimate, _)| *is_estimate) {
            return Err(code_invariant_error(format!(
                "Estimate written by txn {} at key {:?} during commit",
                txn_idx, key
            ))
            .into());
        }
        for (key, _, _, value) in &latest {
            match value {
                Some(value) => store.set(key.clone(), value.clone())?,
                None => store.delete(key)?,
            }
        }
        Ok(latest.len())
    }
}
