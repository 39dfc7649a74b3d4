// Copyright © Aptos Foundation
// SPDX-License-Identifier: Apache-2.0

#![forbid(unsafe_code)]

/*!
The high level parallel execution logic is implemented in 'executor.rs'. The
input of parallel executor is a block of transactions, containing a sequence
of n transactions tx_1, tx_2, ..., tx_n (this defines the preset serialization
order tx_1< tx_2< ...<tx_n).

Each transaction might be executed several times and we refer to the i-th
execution as incarnation i of a transaction. We say that an incarnation is
aborted when the system decides that a subsequent re-execution with an incremented
incarnation number is needed. A version is a pair of a transaction index and
an incarnation number. To support reads and writes by transactions that may
execute concurrently, parallel execution maintains an in-memory multi-version
data structure that separately stores for each key the latest value written
per transaction, along with the associated transaction version. When transaction
tx reads a key, it obtains from the multi-version data-structure the value
written to this key by the highest transaction that appears before tx in the
preset serialization order, along with the associated version. If no such
write exists, the read falls through to the backing store.

After an incarnation executes it needs to pass validation. The validation re-reads
the read-set and compares the observed values. Range scans are recorded as well
and replayed through the same merge of versioned writes and backing store, so an
insertion or deletion within a scanned range invalidates the scan. If validation
succeeds, the transaction stays validated until an earlier transaction changes
what it observed. Otherwise, the incarnation is aborted, its writes are marked as
ESTIMATEs, and a transaction reading an ESTIMATE aborts its own incarnation and
waits for the writer to be re-executed.

There is no commit wave: the block is done once every transaction is validated and
no task is in progress, and the writes of the final incarnations are then applied to
the backing store in one pass. A transaction that exceeds a configurable number of
incarnations halts parallel execution, the block is then executed sequentially.
*/

pub mod config;
pub mod counters;
pub mod errors;
pub mod executor;
pub mod scheduler;
pub mod task;
mod txn_last_output;
pub mod view;

#[cfg(test)]
mod proptest_types;

pub use config::BlockExecutorConfig;
pub use errors::{BlockExecutionError, BlockExecutionResult};
pub use executor::BlockExecutor;
pub use task::{Transaction, TransactionOutput};
pub use view::{TransactionView, ViewError, ViewIterator};
