// Copyright © Aptos Foundation
// SPDX-License-Identifier: Apache-2.0

use crate::task::{ExecutionStatus, TransactionOutput};
use arc_swap::ArcSwapOption;
use crossbeam::utils::CachePadded;
use occ_mvstore::types::{code_invariant_error, Incarnation, PanicError, TxnIndex, WriteSet};
use std::sync::Arc;

struct IncarnationOutput<O, E> {
    incarnation: Incarnation,
    status: ExecutionStatus<O, E>,
    write_set: WriteSet,
}

/// Outputs of the latest incarnation of every transaction. The reads of an incarnation are
/// kept by the multi-version store, next to its writes.
pub(crate) struct TxnLastOutput<O, E> {
    outputs: Vec<CachePadded<ArcSwapOption<IncarnationOutput<O, E>>>>, // txn_idx -> output.
}

impl<O: Send + Sync, E: Send + Sync> TxnLastOutput<O, E> {
    pub(crate) fn new(num_txns: usize) -> Self {
        Self {
            outputs: (0..num_txns)
                .map(|_| CachePadded::new(ArcSwapOption::empty()))
                .collect(),
        }
    }

    pub(crate) fn record(
        &self,
        txn_idx: TxnIndex,
        incarnation: Incarnation,
        status: ExecutionStatus<O, E>,
        write_set: WriteSet,
    ) {
        self.outputs[txn_idx as usize].store(Some(Arc::new(IncarnationOutput {
            incarnation,
            status,
            write_set,
        })));
    }

    /// Moves the output of the final incarnation out, must be called once all transactions
    /// are validated.
    pub(crate) fn take_output(
        &self,
        txn_idx: TxnIndex,
    ) -> Result<TransactionOutput<O, E>, PanicError> {
        let owning_ptr = self.outputs[txn_idx as usize].swap(None).ok_or_else(|| {
            code_invariant_error(format!("[Execution]: Output must be recorded for txn {}", txn_idx))
        })?;
        let output = Arc::try_unwrap(owning_ptr).map_err(|_| {
            code_invariant_error("[Execution]: Output must be uniquely owned after parallel execution")
        })?;

        let result = match output.status {
            ExecutionStatus::Success(output) => Ok(output),
            ExecutionStatus::Abort(err) => Err(err),
            ExecutionStatus::SpeculativeAbort(dep_idx) => {
                return Err(code_invariant_error(format!(
                    "[Execution]: Txn {} committed a speculative abort on txn {}",
                    txn_idx, dep_idx
                )))
            },
        };
        Ok(TransactionOutput {
            result,
            write_set: output.write_set,
            incarnation: output.incarnation,
        })
    }
}
