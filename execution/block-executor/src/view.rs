// Copyright © Aptos Foundation
// SPDX-License-Identifier: Apache-2.0

use bytes::Bytes;
use occ_kv_store::{IterDirection, KVStore, KeyRange, StorageError, StoreIterator};
use occ_mvstore::{
    captured_reads::{CapturedReads, DataRead, IterationTracker},
    merge_iterator::{IterItem, MergeIterator, MergedItem, ReadOrigin},
    types::{MVDataError, MVDataOutput, TxnIndex, Version, WriteSet},
    unsync_map::UnsyncMap,
    MVStore,
};
use std::{
    cell::{Cell, RefCell},
    collections::BTreeMap,
};
use thiserror::Error;

/// Error returned by the view accessors. Transactions are expected to propagate it (typically
/// through a `From<ViewError>` impl of their error type), the executor inspects the view after
/// execution regardless of what the transaction returned.
#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum ViewError {
    #[error("Read an estimate written by txn {0}")]
    Dependency(TxnIndex),
    #[error(transparent)]
    Storage(#[from] StorageError),
}

pub(crate) enum ViewState<'a> {
    Sync(&'a MVStore),
    Unsync(&'a UnsyncMap),
}

/// A struct which describes the result of the read from the proxy. The client
/// can interpret these types to further resolve the reads.
enum ReadResult {
    Value(DataRead),
    Dependency(TxnIndex),
}

/// The state a transaction incarnation observes: its own pending writes on top of the writes
/// of lower transactions on top of the backing store.
pub struct TransactionView<'a> {
    base_view: &'a dyn KVStore,
    latest_view: ViewState<'a>,
    txn_idx: TxnIndex,
    write_set: RefCell<WriteSet>,
    captured_reads: RefCell<CapturedReads>,
    // Set on the first observed estimate, every further access fails with it.
    dependency: Cell<Option<TxnIndex>>,
    storage_error: RefCell<Option<StorageError>>,
}

impl<'a> TransactionView<'a> {
    pub(crate) fn new(base_view: &'a dyn KVStore, latest_view: ViewState<'a>, txn_idx: TxnIndex) -> Self {
        Self {
            base_view,
            latest_view,
            txn_idx,
            write_set: RefCell::new(WriteSet::new()),
            captured_reads: RefCell::new(CapturedReads::new()),
            dependency: Cell::new(None),
            storage_error: RefCell::new(None),
        }
    }

    pub fn txn_idx(&self) -> TxnIndex {
        self.txn_idx
    }

    pub fn get(&self, key: &[u8]) -> Result<Option<Bytes>, ViewError> {
        self.check_dependency()?;
        if let Some(value) = self.write_set.borrow().get(key) {
            return Ok(value.clone());
        }
        // Repeated reads of a key observe the first captured value.
        if let Some(read) = self.captured_reads.borrow().get(key) {
            return Ok(read.value.clone());
        }

        match self.read_latest(key)? {
            ReadResult::Value(read) => {
                let value = read.value.clone();
                self.captured_reads
                    .borrow_mut()
                    .capture_read(Bytes::copy_from_slice(key), read);
                Ok(value)
            },
            ReadResult::Dependency(dep_idx) => Err(self.set_dependency(dep_idx)),
        }
    }

    pub fn has(&self, key: &[u8]) -> Result<bool, ViewError> {
        Ok(self.get(key)?.is_some())
    }

    pub fn set(&self, key: impl Into<Bytes>, value: impl Into<Bytes>) -> Result<(), ViewError> {
        self.check_dependency()?;
        self.write_set
            .borrow_mut()
            .insert(key.into(), Some(value.into()));
        Ok(())
    }

    pub fn delete(&self, key: impl Into<Bytes>) -> Result<(), ViewError> {
        self.check_dependency()?;
        self.write_set.borrow_mut().insert(key.into(), None);
        Ok(())
    }

    /// Ascending scan over the range.
    pub fn iter(&self, range: KeyRange) -> Result<ViewIterator<'_>, ViewError> {
        self.scan(range, IterDirection::Ascending)
    }

    /// Descending scan over the range.
    pub fn rev_iter(&self, range: KeyRange) -> Result<ViewIterator<'_>, ViewError> {
        self.scan(range, IterDirection::Descending)
    }

    fn scan(&self, range: KeyRange, direction: IterDirection) -> Result<ViewIterator<'_>, ViewError> {
        self.check_dependency()?;

        let own_writes: WriteSet = self
            .write_set
            .borrow()
            .iter()
            .filter(|(key, _)| range.contains(key))
            .map(|(key, value)| (key.clone(), value.clone()))
            .collect();
        let mut cache: BTreeMap<Bytes, IterItem> = match &self.latest_view {
            ViewState::Sync(versioned_cache) => {
                versioned_cache.collect_iterator_items(self.txn_idx, &range)
            },
            ViewState::Unsync(unsync_map) => unsync_map.collect_iterator_items(&range),
        };
        for (key, value) in &own_writes {
            cache.insert(key.clone(), IterItem::Own(value.clone()));
        }

        let parent = self
            .base_view
            .iter(&range, direction)
            .map_err(|err| self.set_storage_error(err))?;
        Ok(ViewIterator {
            view: self,
            merged: MergeIterator::new(parent, cache, direction),
            tracker: Some(IterationTracker::new(range, direction, own_writes)),
        })
    }

    fn read_latest(&self, key: &[u8]) -> Result<ReadResult, ViewError> {
        let from_storage = || -> Result<ReadResult, ViewError> {
            let value = self
                .base_view
                .get(key)
                .map_err(|err| self.set_storage_error(err))?;
            Ok(ReadResult::Value(DataRead::from_storage(value)))
        };

        match &self.latest_view {
            ViewState::Sync(versioned_cache) => match versioned_cache.read(key, self.txn_idx) {
                Ok(MVDataOutput::Versioned(version, value)) => {
                    Ok(ReadResult::Value(DataRead::versioned(version, value)))
                },
                Err(MVDataError::Dependency(dep_idx)) => Ok(ReadResult::Dependency(dep_idx)),
                Err(MVDataError::NotFound) => from_storage(),
            },
            ViewState::Unsync(unsync_map) => match unsync_map.read(key) {
                Some((txn_idx, value)) => Ok(ReadResult::Value(DataRead::versioned((txn_idx, 0), value))),
                None => from_storage(),
            },
        }
    }

    fn check_dependency(&self) -> Result<(), ViewError> {
        match self.dependency.get() {
            Some(dep_idx) => Err(ViewError::Dependency(dep_idx)),
            None => Ok(()),
        }
    }

    fn set_dependency(&self, dep_idx: TxnIndex) -> ViewError {
        if self.dependency.get().is_none() {
            self.dependency.set(Some(dep_idx));
        }
        ViewError::Dependency(dep_idx)
    }

    fn set_storage_error(&self, err: StorageError) -> ViewError {
        self.storage_error.borrow_mut().get_or_insert_with(|| err.clone());
        ViewError::Storage(err)
    }

    /// Value a scan produces for a key it read from the store. A key already read by the
    /// incarnation yields the captured value, as a repeated get would.
    fn observe_scanned(&self, key: Bytes, value: Bytes, version: Option<Version>) -> Bytes {
        let mut captured_reads = self.captured_reads.borrow_mut();
        if let Some(captured) = captured_reads.get(&key).and_then(|read| read.value.clone()) {
            return captured;
        }
        // A key read as absent is now present, capture_read flags the conflict.
        let read = match version {
            Some(version) => DataRead::versioned(version, Some(value.clone())),
            None => DataRead::from_storage(Some(value.clone())),
        };
        captured_reads.capture_read(key, read);
        value
    }

    /// Index of the transaction whose estimate was observed, if any.
    pub(crate) fn dependency(&self) -> Option<TxnIndex> {
        self.dependency.get()
    }

    pub(crate) fn take_storage_error(&self) -> Option<StorageError> {
        self.storage_error.borrow_mut().take()
    }

    pub(crate) fn into_parts(self) -> (WriteSet, CapturedReads) {
        (self.write_set.into_inner(), self.captured_reads.into_inner())
    }
}

/// Range scan over a [`TransactionView`]. The keys produced are recorded for validation when
/// the scan is exhausted or dropped.
pub struct ViewIterator<'a> {
    view: &'a TransactionView<'a>,
    merged: MergeIterator<StoreIterator<'a>>,
    tracker: Option<IterationTracker>,
}

impl<'a> ViewIterator<'a> {
    fn record(&mut self) {
        if let Some(mut tracker) = self.tracker.take() {
            tracker.finish();
            self.view
                .captured_reads
                .borrow_mut()
                .capture_iterator(tracker);
        }
    }
}

impl<'a> Iterator for ViewIterator<'a> {
    type Item = Result<(Bytes, Bytes), ViewError>;

    fn next(&mut self) -> Option<Self::Item> {
        let tracker = self.tracker.as_mut()?;
        if let Some(dep_idx) = self.view.dependency() {
            // The incarnation is discarded, so is the scan.
            self.tracker = None;
            return Some(Err(ViewError::Dependency(dep_idx)));
        }

        match self.merged.next() {
            None => {
                tracker.mark_exhausted();
                self.record();
                None
            },
            Some(Err(dep_idx)) => {
                self.tracker = None;
                Some(Err(self.view.set_dependency(dep_idx)))
            },
            Some(Ok(MergedItem { key, value, origin })) => {
                tracker.push(key.clone());
                let value = match origin {
                    ReadOrigin::Own => value,
                    ReadOrigin::Versioned(version) => {
                        self.view.observe_scanned(key.clone(), value, Some(version))
                    },
                    ReadOrigin::Storage => self.view.observe_scanned(key.clone(), value, None),
                };
                Some(Ok((key, value)))
            },
        }
    }
}

impl<'a> Drop for ViewIterator<'a> {
    fn drop(&mut self) {
        self.record();
    }
}
