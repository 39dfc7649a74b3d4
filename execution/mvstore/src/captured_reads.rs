// Copyright © Aptos Foundation
// SPDX-License-Identifier: Apache-2.0

use crate::types::{TxnIndex, Version, WriteSet};
use bytes::Bytes;
use occ_kv_store::{IterDirection, KeyRange, StorageError};
use std::collections::{btree_map::Entry, BTreeMap};

/// What a point read observed. `version` is None if the read fell through to the
/// backing store, `value` is None if the key was absent (or deleted).
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DataRead {
    pub version: Option<Version>,
    pub value: Option<Bytes>,
}

impl DataRead {
    pub fn from_storage(value: Option<Bytes>) -> Self {
        Self {
            version: None,
            value,
        }
    }

    pub fn versioned(version: Version, value: Option<Bytes>) -> Self {
        Self {
            version: Some(version),
            value,
        }
    }

    /// A read is still valid if it resolves to the same version, or to a different
    /// version holding an identical value.
    pub fn is_consistent_with(&self, version: Option<Version>, value: Option<&Bytes>) -> bool {
        (self.version.is_some() && self.version == version) || self.value.as_ref() == value
    }
}

/// Records one range scan performed by an incarnation.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct IterationTracker {
    pub range: KeyRange,
    pub direction: IterDirection,
    /// Keys produced to the transaction, in iteration order.
    pub produced: Vec<Bytes>,
    /// True if the scan ran until the merged iterator returned None.
    pub exhausted: bool,
    /// Last produced key if the transaction stopped the scan before it was exhausted.
    pub early_stop_key: Option<Bytes>,
    /// Own pending writes within the range at the time the scan started.
    pub own_writes: WriteSet,
}

impl IterationTracker {
    pub fn new(range: KeyRange, direction: IterDirection, own_writes: WriteSet) -> Self {
        Self {
            range,
            direction,
            produced: Vec::new(),
            exhausted: false,
            early_stop_key: None,
            own_writes,
        }
    }

    pub fn push(&mut self, key: Bytes) {
        self.produced.push(key);
    }

    pub fn mark_exhausted(&mut self) {
        self.exhausted = true;
        self.early_stop_key = None;
    }

    /// Called when the scan is dropped by the transaction.
    pub fn finish(&mut self) {
        if !self.exhausted {
            self.early_stop_key = self.produced.last().cloned();
        }
    }
}

/// Reads captured by a single incarnation, validated after execution.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct CapturedReads {
    data_reads: BTreeMap<Bytes, DataRead>,
    iterators: Vec<IterationTracker>,
    // A key was observed with two different values.
    inconsistent: bool,
}

impl CapturedReads {
    pub fn new() -> Self {
        Self::default()
    }

    /// Only the first observation of a key is recorded. A later observation of a
    /// different value marks the reads as inconsistent, they can no longer be validated.
    pub fn capture_read(&mut self, key: Bytes, read: DataRead) {
        match self.data_reads.entry(key) {
            Entry::Vacant(entry) => {
                entry.insert(read);
            },
            Entry::Occupied(entry) => {
                if entry.get().value != read.value {
                    self.inconsistent = true;
                }
            },
        }
    }

    pub fn is_inconsistent(&self) -> bool {
        self.inconsistent
    }

    pub fn capture_iterator(&mut self, tracker: IterationTracker) {
        self.iterators.push(tracker);
    }

    pub fn get(&self, key: &[u8]) -> Option<&DataRead> {
        self.data_reads.get(key)
    }

    pub fn data_reads(&self) -> &BTreeMap<Bytes, DataRead> {
        &self.data_reads
    }

    pub fn iterators(&self) -> &[IterationTracker] {
        &self.iterators
    }

    pub fn has_iterators(&self) -> bool {
        !self.iterators.is_empty()
    }
}

/// Result of replaying a point read-set.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ReadSetValidation {
    pub valid: bool,
    /// Sorted, deduplicated indices of estimate writers hit during the replay.
    pub conflicts: Vec<TxnIndex>,
}

/// Result of replaying recorded scans.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ReplayOutcome {
    Valid,
    /// The replayed scan produced a different sequence of keys.
    Mismatch,
    /// The replay hit an estimate written by the given index.
    Dependency(TxnIndex),
    Cancelled,
    Storage(StorageError),
}

impl ReplayOutcome {
    pub fn is_valid(&self) -> bool {
        matches!(self, ReplayOutcome::Valid)
    }
}
