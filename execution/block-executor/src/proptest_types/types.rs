// Copyright © Aptos Foundation
// SPDX-License-Identifier: Apache-2.0

use crate::{task::Transaction, view::TransactionView, ViewError};
use bytes::Bytes;
use occ_kv_store::{IterDirection, KeyRange};
use proptest::{collection::vec, prelude::*, sample::Index};

pub(crate) fn encode_value(value: u64) -> Bytes {
    Bytes::copy_from_slice(&value.to_be_bytes())
}

pub(crate) fn decode_value(value: Option<&Bytes>) -> u64 {
    value
        .and_then(|bytes| <[u8; 8]>::try_from(bytes.as_ref()).ok())
        .map(u64::from_be_bytes)
        .unwrap_or(0)
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub(crate) enum MockOp {
    Read(Bytes),
    Write(Bytes, Bytes),
    Delete(Bytes),
    /// Read-modify-write of a counter.
    Increment(Bytes),
    Scan {
        range: KeyRange,
        direction: IterDirection,
        limit: Option<usize>,
    },
    /// Writes the sum of the values in the range to dst.
    ScanSum { range: KeyRange, dst: Bytes },
    /// Fails the transaction if the key is present.
    AssertAbsent(Bytes),
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub(crate) enum Observed {
    Value(Option<Bytes>),
    Scan(Vec<(Bytes, Bytes)>),
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub(crate) enum MockError {
    View(ViewError),
    KeyPresent(Bytes),
}

impl From<ViewError> for MockError {
    fn from(err: ViewError) -> Self {
        MockError::View(err)
    }
}

/// A transaction whose behavior only depends on the values it observes.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub(crate) struct MockTransaction {
    pub(crate) ops: Vec<MockOp>,
}

impl MockTransaction {
    pub(crate) fn new(ops: Vec<MockOp>) -> Self {
        Self { ops }
    }
}

impl Transaction for MockTransaction {
    type Error = MockError;
    type Output = Vec<Observed>;

    fn execute(&self, view: &TransactionView<'_>) -> Result<Self::Output, Self::Error> {
        let mut observed = vec![];
        for op in &self.ops {
            match op {
                MockOp::Read(key) => observed.push(Observed::Value(view.get(key)?)),
                MockOp::Write(key, value) => view.set(key.clone(), value.clone())?,
                MockOp::Delete(key) => view.delete(key.clone())?,
                MockOp::Increment(key) => {
                    let value = decode_value(view.get(key)?.as_ref());
                    view.set(key.clone(), encode_value(value.wrapping_add(1)))?;
                },
                MockOp::Scan {
                    range,
                    direction,
                    limit,
                } => {
                    let iter = match direction {
                        IterDirection::Ascending => view.iter(range.clone())?,
                        IterDirection::Descending => view.rev_iter(range.clone())?,
                    };
                    let mut items = vec![];
                    for item in iter.take(limit.unwrap_or(usize::MAX)) {
                        items.push(item?);
                    }
                    observed.push(Observed::Scan(items));
                },
                MockOp::ScanSum { range, dst } => {
                    let mut sum = 0u64;
                    for item in view.iter(range.clone())? {
                        let (_, value) = item?;
                        sum = sum.wrapping_add(decode_value(Some(&value)));
                    }
                    view.set(dst.clone(), encode_value(sum))?;
                },
                MockOp::AssertAbsent(key) => {
                    if view.has(key)? {
                        return Err(MockError::KeyPresent(key.clone()));
                    }
                },
            }
        }
        Ok(observed)
    }
}

#[derive(Clone, Debug)]
enum OpGen {
    Read(Index),
    Write(Index, u64),
    Delete(Index),
    Increment(Index),
    Scan {
        start: Option<Index>,
        end: Option<Index>,
        descending: bool,
        limit: Option<usize>,
    },
    ScanSum {
        start: Index,
        end: Index,
        dst: Index,
    },
    AssertAbsent(Index),
}

impl OpGen {
    fn materialize(&self, universe: &[Bytes]) -> MockOp {
        let key = |idx: &Index| universe[idx.index(universe.len())].clone();
        match self {
            OpGen::Read(idx) => MockOp::Read(key(idx)),
            OpGen::Write(idx, value) => MockOp::Write(key(idx), encode_value(*value)),
            OpGen::Delete(idx) => MockOp::Delete(key(idx)),
            OpGen::Increment(idx) => MockOp::Increment(key(idx)),
            OpGen::Scan {
                start,
                end,
                descending,
                limit,
            } => MockOp::Scan {
                range: KeyRange::new(start.as_ref().map(key), end.as_ref().map(key)),
                direction: if *descending {
                    IterDirection::Descending
                } else {
                    IterDirection::Ascending
                },
                limit: *limit,
            },
            OpGen::ScanSum { start, end, dst } => MockOp::ScanSum {
                range: KeyRange::new(Some(key(start)), Some(key(end))),
                dst: key(dst),
            },
            OpGen::AssertAbsent(idx) => MockOp::AssertAbsent(key(idx)),
        }
    }
}

fn op_strategy() -> impl Strategy<Value = OpGen> {
    prop_oneof![
        4 => any::<Index>().prop_map(OpGen::Read),
        4 => (any::<Index>(), any::<u64>()).prop_map(|(idx, value)| OpGen::Write(idx, value)),
        1 => any::<Index>().prop_map(OpGen::Delete),
        3 => any::<Index>().prop_map(OpGen::Increment),
        2 => (
            proptest::option::of(any::<Index>()),
            proptest::option::of(any::<Index>()),
            any::<bool>(),
            proptest::option::of(1usize..4),
        )
            .prop_map(|(start, end, descending, limit)| OpGen::Scan {
                start,
                end,
                descending,
                limit,
            }),
        1 => (any::<Index>(), any::<Index>(), any::<Index>())
            .prop_map(|(start, end, dst)| OpGen::ScanSum { start, end, dst }),
        1 => any::<Index>().prop_map(OpGen::AssertAbsent),
    ]
}

/// Random transaction over indices into a key universe, turned into a [`MockTransaction`]
/// once the universe is known.
#[derive(Clone, Debug)]
pub(crate) struct TransactionGen {
    ops: Vec<OpGen>,
}

impl TransactionGen {
    pub(crate) fn materialize(&self, universe: &[Bytes]) -> MockTransaction {
        MockTransaction::new(self.ops.iter().map(|op| op.materialize(universe)).collect())
    }
}

impl Arbitrary for TransactionGen {
    type Parameters = ();
    type Strategy = BoxedStrategy<Self>;

    fn arbitrary_with(_args: Self::Parameters) -> Self::Strategy {
        vec(op_strategy(), 1..6)
            .prop_map(|ops| TransactionGen { ops })
            .boxed()
    }
}
