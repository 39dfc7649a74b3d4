// Copyright © Aptos Foundation
// SPDX-License-Identifier: Apache-2.0

use crate::view::TransactionView;
use occ_mvstore::types::{Incarnation, TxnIndex, WriteSet};

/// The execution result of a transaction incarnation.
#[derive(Debug)]
pub enum ExecutionStatus<O, E> {
    /// Transaction was executed successfully.
    Success(O),
    /// Transaction returned an application error. Its writes are discarded, the error is the
    /// final result of the transaction if the incarnation is validated.
    Abort(E),
    /// The incarnation read an estimate written by the given transaction and was discarded.
    SpeculativeAbort(TxnIndex),
}

/// Trait that defines a transaction that could be parallel executed by the scheduler. Each
/// transaction reads and writes the key-value state through the provided view; its writes
/// are its side effect.
///
/// Execution must be deterministic given the values observed through the view, as the
/// same transaction may be executed many times.
pub trait Transaction: Sync {
    type Output: Send + Sync;
    type Error: Send + Sync;

    fn execute(&self, view: &TransactionView<'_>) -> Result<Self::Output, Self::Error>;
}

impl<F, O, E> Transaction for F
where
    F: Fn(&TransactionView<'_>) -> Result<O, E> + Sync,
    O: Send + Sync,
    E: Send + Sync,
{
    type Error = E;
    type Output = O;

    fn execute(&self, view: &TransactionView<'_>) -> Result<O, E> {
        self(view)
    }
}

/// Committed result of a transaction.
#[derive(Debug)]
pub struct TransactionOutput<O, E> {
    pub result: Result<O, E>,
    /// Writes of the committed incarnation, empty if the transaction returned an error.
    pub write_set: WriteSet,
    pub incarnation: Incarnation,
}
