// Copyright © Aptos Foundation
// SPDX-License-Identifier: Apache-2.0

use super::{
    captured_reads::{CapturedReads, DataRead, IterationTracker, ReplayOutcome},
    merge_iterator::IterItem,
    types::{MVDataError, MVDataOutput, MVStoreError, WriteSet},
    unsync_map::UnsyncMap,
    MVStore,
};
use bytes::Bytes;
use claims::{assert_err, assert_err_eq, assert_ok, assert_ok_eq};
use occ_kv_store::{InMemoryStore, IterDirection, KVStore, KeyRange};
use tokio_util::sync::CancellationToken;

fn b(s: &str) -> Bytes {
    Bytes::copy_from_slice(s.as_bytes())
}

fn write_set(entries: &[(&str, Option<&str>)]) -> WriteSet {
    entries
        .iter()
        .map(|(k, v)| (b(k), v.map(b)))
        .collect()
}

fn base() -> InMemoryStore {
    [("a", "base-a"), ("c", "base-c"), ("m", "base-m")]
        .into_iter()
        .map(|(k, v)| (b(k), b(v)))
        .collect()
}

/// A tracker as the view would record it for a full ascending scan.
fn recorded_scan(mvstore: &MVStore, txn_idx: u32, base: &InMemoryStore, range: KeyRange) -> CapturedReads {
    let mut tracker = IterationTracker::new(range.clone(), IterDirection::Ascending, WriteSet::new());
    let cache = mvstore.collect_iterator_items(txn_idx, &range);
    let parent = base.iter(&range, IterDirection::Ascending).unwrap();
    for item in super::merge_iterator::MergeIterator::new(parent, cache, IterDirection::Ascending) {
        tracker.push(item.unwrap().key);
    }
    tracker.mark_exhausted();
    let mut reads = CapturedReads::new();
    reads.capture_iterator(tracker);
    reads
}

#[test]
fn read_write_estimate() {
    let mvstore = MVStore::new(10);
    let key = b("k");

    assert_err_eq!(mvstore.read(&key, 5), MVDataError::NotFound);

    mvstore.write(key.clone(), 2, 0, Some(b("v2")));
    mvstore.write(key.clone(), 5, 1, Some(b("v5")));

    // Reads never see their own or higher entries.
    assert_err_eq!(mvstore.read(&key, 2), MVDataError::NotFound);
    assert_ok_eq!(
        mvstore.read(&key, 5),
        MVDataOutput::Versioned((2, 0), Some(b("v2")))
    );
    assert_ok_eq!(
        mvstore.read(&key, 9),
        MVDataOutput::Versioned((5, 1), Some(b("v5")))
    );

    assert_ok!(mvstore.write_estimate(&key, 5));
    assert_err_eq!(mvstore.read(&key, 9), MVDataError::Dependency(5));
    assert_ok_eq!(
        mvstore.read(&key, 4),
        MVDataOutput::Versioned((2, 0), Some(b("v2")))
    );

    // Re-execution overwrites the estimate.
    mvstore.write(key.clone(), 5, 2, None);
    assert_ok_eq!(mvstore.read(&key, 9), MVDataOutput::Versioned((5, 2), None));

    mvstore.remove(&key, 5);
    assert_ok_eq!(
        mvstore.read(&key, 9),
        MVDataOutput::Versioned((2, 0), Some(b("v2")))
    );

    assert_err!(mvstore.write_estimate(&b("missing"), 1));
}

#[test]
fn record_replaces_previous_write_set() {
    let mvstore = MVStore::new(4);

    let first = write_set(&[("x", Some("1")), ("y", Some("1"))]);
    assert_ok_eq!(mvstore.record(1, 0, &first, CapturedReads::new()), true);

    // Subset of the previous keys: nothing new was written.
    let second = write_set(&[("x", Some("2"))]);
    assert_ok_eq!(mvstore.record(1, 1, &second, CapturedReads::new()), false);
    assert_err_eq!(mvstore.read(&b("y"), 3), MVDataError::NotFound);
    assert_ok_eq!(
        mvstore.read(&b("x"), 3),
        MVDataOutput::Versioned((1, 1), Some(b("2")))
    );

    let third = write_set(&[("x", Some("3")), ("z", None)]);
    assert_ok_eq!(mvstore.record(1, 2, &third, CapturedReads::new()), true);

    assert_ok!(mvstore.mark_estimates(1));
    assert_err_eq!(mvstore.read(&b("x"), 2), MVDataError::Dependency(1));
    assert_err_eq!(mvstore.read(&b("z"), 2), MVDataError::Dependency(1));

    let cell = mvstore.data.get(&b("x")[..]).unwrap();
    assert_eq!(cell.indices(), vec![1]);
}

#[test]
fn read_set_validation_is_value_based() {
    let base = base();
    let mvstore = MVStore::new(4);
    mvstore.write(b("a"), 0, 0, Some(b("v")));

    let mut reads = CapturedReads::new();
    reads.capture_read(b("a"), DataRead::versioned((0, 0), Some(b("v"))));
    reads.capture_read(b("c"), DataRead::from_storage(Some(b("base-c"))));
    // Later observations of the same key are ignored.
    reads.capture_read(b("a"), DataRead::versioned((0, 7), Some(b("other"))));
    assert_ok!(mvstore.record(2, 0, &WriteSet::new(), reads));

    let validation = mvstore.validate_read_set(2, &base).unwrap();
    assert!(validation.valid);
    assert!(validation.conflicts.is_empty());

    // Different version, same value.
    mvstore.write(b("a"), 1, 0, Some(b("v")));
    assert!(mvstore.validate_read_set(2, &base).unwrap().valid);

    // Storage read shadowed by a lower write with the same value.
    mvstore.write(b("c"), 0, 0, Some(b("base-c")));
    assert!(mvstore.validate_read_set(2, &base).unwrap().valid);

    mvstore.write(b("c"), 1, 0, Some(b("changed")));
    assert!(!mvstore.validate_read_set(2, &base).unwrap().valid);

    assert_ok!(mvstore.write_estimate(&b("a"), 1));
    assert_ok!(mvstore.write_estimate(&b("c"), 1));
    let validation = mvstore.validate_read_set(2, &base).unwrap();
    assert!(!validation.valid);
    assert_eq!(validation.conflicts, vec![1]);

    // Idempotent.
    assert_eq!(mvstore.validate_read_set(2, &base).unwrap(), validation);
}

#[test]
fn versioned_read_falls_back_to_storage() {
    let base = base();
    let mvstore = MVStore::new(4);
    mvstore.write(b("a"), 0, 0, Some(b("base-a")));

    let mut reads = CapturedReads::new();
    reads.capture_read(b("a"), DataRead::versioned((0, 0), Some(b("base-a"))));
    assert_ok!(mvstore.record(1, 0, &WriteSet::new(), reads));

    // The writer no longer writes the key, storage holds the same value.
    mvstore.remove(&b("a"), 0);
    assert!(mvstore.validate_read_set(1, &base).unwrap().valid);

    let empty = InMemoryStore::new();
    assert!(!mvstore.validate_read_set(1, &empty).unwrap().valid);
}

#[test]
fn iterator_invalidated_by_insert_in_range() {
    let base = base();
    let mvstore = MVStore::new(4);
    let range = KeyRange::from_slices(Some(b"a"), Some(b"k"));
    let cancel = CancellationToken::new();

    let reads = recorded_scan(&mvstore, 3, &base, range.clone());
    assert_eq!(reads.iterators()[0].produced, vec![b("a"), b("c")]);
    assert_ok!(mvstore.record(3, 0, &WriteSet::new(), reads));
    assert!(mvstore.has_iterators(3));

    assert_eq!(mvstore.validate_iterators(3, &base, &cancel), ReplayOutcome::Valid);

    // Writes outside of the range or above the reader do not matter.
    mvstore.write(b("x"), 0, 0, Some(b("x")));
    mvstore.write(b("b"), 3, 0, Some(b("b")));
    assert_eq!(mvstore.validate_iterators(3, &base, &cancel), ReplayOutcome::Valid);
    // Overwriting the value of a produced key keeps the key set.
    mvstore.write(b("c"), 0, 0, Some(b("new-c")));
    assert_eq!(mvstore.validate_iterators(3, &base, &cancel), ReplayOutcome::Valid);

    mvstore.write(b("b"), 1, 0, Some(b("b")));
    assert_eq!(mvstore.validate_iterators(3, &base, &cancel), ReplayOutcome::Mismatch);
    // Idempotent.
    assert_eq!(mvstore.validate_iterators(3, &base, &cancel), ReplayOutcome::Mismatch);

    assert_ok!(mvstore.write_estimate(&b("b"), 1));
    assert_eq!(
        mvstore.validate_iterators(3, &base, &cancel),
        ReplayOutcome::Dependency(1)
    );

    mvstore.remove(&b("b"), 1);
    mvstore.write(b("c"), 2, 0, None);
    assert_eq!(mvstore.validate_iterators(3, &base, &cancel), ReplayOutcome::Mismatch);

    cancel.cancel();
    assert_eq!(mvstore.validate_iterators(3, &base, &cancel), ReplayOutcome::Cancelled);
}

#[test]
fn early_stopped_iterator_ignores_later_keys() {
    let base = base();
    let mvstore = MVStore::new(4);
    let range = KeyRange::all();
    let cancel = CancellationToken::new();

    let own_writes = write_set(&[("b", Some("own"))]);
    let mut tracker = IterationTracker::new(range, IterDirection::Descending, own_writes);
    tracker.push(b("m"));
    tracker.push(b("c"));
    tracker.finish();
    assert_eq!(tracker.early_stop_key, Some(b("c")));

    // A key after the stop point appears.
    mvstore.write(b("b0"), 0, 0, Some(b("v")));
    assert_eq!(mvstore.validate_iterator(2, &tracker, &base, &cancel), ReplayOutcome::Valid);

    // A key before the stop point in descending order appears.
    mvstore.write(b("d"), 1, 0, Some(b("v")));
    assert_eq!(mvstore.validate_iterator(2, &tracker, &base, &cancel), ReplayOutcome::Mismatch);
}

#[test]
fn collect_iterator_items_sees_estimates_and_deletions() {
    let mvstore = MVStore::new(4);
    mvstore.write(b("a"), 0, 0, None);
    mvstore.write(b("b"), 1, 0, Some(b("v")));
    assert_ok!(mvstore.write_estimate(&b("b"), 1));
    mvstore.write(b("c"), 3, 0, Some(b("invisible")));
    mvstore.write(b("z"), 0, 0, Some(b("out-of-range")));

    let items = mvstore.collect_iterator_items(2, &KeyRange::from_slices(None, Some(b"y")));
    assert_eq!(
        items.into_iter().collect::<Vec<_>>(),
        vec![
            (b("a"), IterItem::Versioned((0, 0), None)),
            (b("b"), IterItem::Estimate(1)),
        ]
    );
}

#[test]
fn commit_writes_latest_entries() {
    let mut store = base();
    let mvstore = MVStore::new(4);
    mvstore.write(b("a"), 0, 0, Some(b("0")));
    mvstore.write(b("a"), 2, 1, Some(b("2")));
    mvstore.write(b("c"), 1, 0, None);
    mvstore.write(b("new"), 3, 0, Some(b("3")));
    mvstore.write(b("gone"), 1, 0, Some(b("1")));
    mvstore.remove(&b("gone"), 1);

    assert_ok_eq!(mvstore.write_latest_to_store(&mut store), 3);
    assert_eq!(
        store.data().iter().collect::<Vec<_>>(),
        vec![(&b("a"), &b("2")), (&b("m"), &b("base-m")), (&b("new"), &b("3"))]
    );

    // Keys ordered before the estimate are not written either.
    mvstore.write(b("b"), 1, 0, Some(b("b")));
    mvstore.write(b("m"), 0, 0, Some(b("m")));
    assert_ok!(mvstore.write_estimate(&b("m"), 0));
    let committed = store.clone();
    assert!(matches!(
        mvstore.write_latest_to_store(&mut store),
        Err(MVStoreError::CodeInvariant(_))
    ));
    assert_eq!(store, committed);
}

#[test]
fn read_set_with_conflicting_observations_is_invalid() {
    let base = base();
    let mvstore = MVStore::new(2);

    // Nothing recorded yet.
    assert!(mvstore.validate_read_set(1, &base).unwrap().valid);

    let mut reads = CapturedReads::new();
    reads.capture_read(b("a"), DataRead::from_storage(Some(b("base-a"))));
    reads.capture_read(b("a"), DataRead::from_storage(Some(b("base-a"))));
    assert!(!reads.is_inconsistent());
    reads.capture_read(b("b"), DataRead::from_storage(None));
    reads.capture_read(b("b"), DataRead::versioned((0, 0), Some(b("b"))));
    assert!(reads.is_inconsistent());
    assert_eq!(reads.get(b"b"), Some(&DataRead::from_storage(None)));

    assert_ok!(mvstore.record(1, 0, &WriteSet::new(), reads));
    // Every captured value matches the current state, the reads still disagree.
    assert!(!mvstore.validate_read_set(1, &base).unwrap().valid);
}

#[test]
fn collect_iterator_items_is_range_bounded() {
    let mvstore = MVStore::new(4);
    for key in ["a", "b", "c", "d"] {
        mvstore.write(b(key), 0, 0, Some(b(key)));
    }
    mvstore.write(b("c"), 2, 0, None);
    mvstore.remove(&b("a"), 0);

    assert_eq!(
        mvstore
            .collect_iterator_items(3, &KeyRange::from_slices(Some(b"a"), Some(b"d")))
            .into_iter()
            .collect::<Vec<_>>(),
        vec![
            (b("b"), IterItem::Versioned((0, 0), Some(b("b")))),
            (b("c"), IterItem::Versioned((2, 0), None)),
        ]
    );
    assert!(mvstore
        .collect_iterator_items(3, &KeyRange::from_slices(Some(b"d"), Some(b"a")))
        .is_empty());
}

#[test]
fn unsync_map_overlay() {
    let mut store = base();
    let mut map = UnsyncMap::new();
    map.apply(0, &write_set(&[("a", None), ("b", Some("0"))]));
    map.apply(1, &write_set(&[("b", Some("1"))]));

    assert_eq!(map.read(b"b"), Some((1, Some(b("1")))));
    assert_eq!(map.read(b"a"), Some((0, None)));
    assert_eq!(map.read(b"c"), None);
    assert_eq!(
        map.collect_iterator_items(&KeyRange::from_slices(Some(b"b"), None))
            .into_iter()
            .collect::<Vec<_>>(),
        vec![(b("b"), IterItem::Versioned((1, 0), Some(b("1"))))]
    );

    assert_ok_eq!(map.write_to_store(&mut store), 2);
    assert_eq!(store.get(b"a").unwrap(), None);
    assert_eq!(store.get(b"b").unwrap(), Some(b("1")));
}
