// Copyright © Aptos Foundation
// SPDX-License-Identifier: Apache-2.0

//! Conflict-aware merge of the backing store's ordered iterator with the versioned
//! items visible to a transaction.

use crate::types::{TxnIndex, Version};
use bytes::Bytes;
use occ_kv_store::IterDirection;
use std::{
    cmp::Ordering,
    collections::{BTreeMap, VecDeque},
    iter::Peekable,
};

/// A versioned item shadowing the backing store at some key.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum IterItem {
    /// Pending write of the iterating transaction itself.
    Own(Option<Bytes>),
    /// Entry written by a lower transaction.
    Versioned(Version, Option<Bytes>),
    /// The lower transaction that wrote here is not final yet.
    Estimate(TxnIndex),
}

/// Where the value of a produced item came from.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ReadOrigin {
    Own,
    Versioned(Version),
    Storage,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MergedItem {
    pub key: Bytes,
    pub value: Bytes,
    pub origin: ReadOrigin,
}

/// Yields the union of the parent (backing store) and cache keys, in the iteration
/// direction. On equal keys the cache item wins, deleted keys are skipped. Hitting an
/// estimate yields Err(writer index) once and fuses the iterator.
pub struct MergeIterator<P: Iterator<Item = (Bytes, Bytes)>> {
    parent: Peekable<P>,
    cache: VecDeque<(Bytes, IterItem)>,
    direction: IterDirection,
    fused: bool,
}

impl<P: Iterator<Item = (Bytes, Bytes)>> MergeIterator<P> {
    pub fn new(parent: P, cache: BTreeMap<Bytes, IterItem>, direction: IterDirection) -> Self {
        let cache = match direction {
            IterDirection::Ascending => cache.into_iter().collect(),
            IterDirection::Descending => cache.into_iter().rev().collect(),
        };
        Self {
            parent: parent.peekable(),
            cache,
            direction,
            fused: false,
        }
    }

    /// Ordering of the cache head relative to the parent head, in iteration order.
    fn cache_first(&mut self) -> Option<bool> {
        let ordering = match (self.cache.front(), self.parent.peek()) {
            (None, None) => return None,
            (Some(_), None) => Ordering::Less,
            (None, Some(_)) => Ordering::Greater,
            (Some((cache_key, _)), Some((parent_key, _))) => match self.direction {
                IterDirection::Ascending => cache_key.cmp(parent_key),
                IterDirection::Descending => parent_key.cmp(cache_key),
            },
        };
        if ordering == Ordering::Equal {
            // Shadowed by the cache.
            self.parent.next();
        }
        Some(ordering != Ordering::Greater)
    }
}

impl<P: Iterator<Item = (Bytes, Bytes)>> Iterator for MergeIterator<P> {
    type Item = Result<MergedItem, TxnIndex>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.fused {
            return None;
        }
        loop {
            let from_cache = self.cache_first()?;
            if !from_cache {
                let (key, value) = self.parent.next()?;
                return Some(Ok(MergedItem {
                    key,
                    value,
                    origin: ReadOrigin::Storage,
                }));
            }

            let (key, item) = self.cache.pop_front()?;
            match item {
                IterItem::Estimate(dep_idx) => {
                    self.fused = true;
                    return Some(Err(dep_idx));
                },
                IterItem::Own(None) | IterItem::Versioned(_, None) => continue,
                IterItem::Own(Some(value)) => {
                    return Some(Ok(MergedItem {
                        key,
                        value,
                        origin: ReadOrigin::Own,
                    }))
                },
                IterItem::Versioned(version, Some(value)) => {
                    return Some(Ok(MergedItem {
                        key,
                        value,
                        origin: ReadOrigin::Versioned(version),
                    }))
                },
            }
        }
    }
}
