// Copyright © Aptos Foundation
// SPDX-License-Identifier: Apache-2.0

use occ_kv_store::StorageError;
use occ_mvstore::types::{Incarnation, MVStoreError, PanicError, TxnIndex};
use thiserror::Error;

#[derive(Clone, Debug, PartialEq, Eq)]
pub(crate) enum ParallelBlockExecutionError {
    /// A transaction kept being invalidated, parallel execution is halted and the block
    /// may be re-executed sequentially.
    IncarnationLimitExceeded {
        txn_idx: TxnIndex,
        incarnation: Incarnation,
    },
    /// Unrecoverable error, propagated to the caller.
    Fatal(BlockExecutionError),
}

impl From<PanicError> for ParallelBlockExecutionError {
    fn from(err: PanicError) -> Self {
        ParallelBlockExecutionError::Fatal(err.into())
    }
}

impl From<StorageError> for ParallelBlockExecutionError {
    fn from(err: StorageError) -> Self {
        ParallelBlockExecutionError::Fatal(err.into())
    }
}

/// If the unrecoverable error occurs during block execution, the error is propagated back to
/// the caller and the backing store is left untouched (unless the error was returned by the
/// store itself during commit).
#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum BlockExecutionError {
    #[error(transparent)]
    Storage(#[from] StorageError),
    /// unrecoverable BlockSTM error
    #[error(transparent)]
    FatalBlockExecutorError(#[from] PanicError),
    #[error("Transaction {txn_idx} reached incarnation {incarnation}")]
    IncarnationLimitExceeded {
        txn_idx: TxnIndex,
        incarnation: Incarnation,
    },
}

impl From<MVStoreError> for BlockExecutionError {
    fn from(err: MVStoreError) -> Self {
        match err {
            MVStoreError::Storage(err) => BlockExecutionError::Storage(err),
            MVStoreError::CodeInvariant(err) => BlockExecutionError::FatalBlockExecutorError(err),
        }
    }
}

pub type BlockExecutionResult<T> = Result<T, BlockExecutionError>;
