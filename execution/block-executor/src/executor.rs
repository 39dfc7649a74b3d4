// Copyright © Aptos Foundation
// SPDX-License-Identifier: Apache-2.0

use crate::{
    config::{BlockExecutorConfig, ConfigError},
    counters,
    counters::{
        PARALLEL_EXECUTION_SECONDS, SEQUENTIAL_EXECUTION_SECONDS, TASK_EXECUTE_SECONDS,
        TASK_VALIDATE_SECONDS,
    },
    errors::*,
    scheduler::{Scheduler, SchedulerTask},
    task::{ExecutionStatus, Transaction, TransactionOutput},
    txn_last_output::TxnLastOutput,
    view::{TransactionView, ViewState},
};
use crossbeam::channel::{bounded, TrySendError};
use occ_kv_store::KVStore;
use occ_mvstore::{
    captured_reads::ReplayOutcome,
    types::{code_invariant_error, Incarnation, TxnIndex, WriteSet},
    unsync_map::UnsyncMap,
    MVStore,
};
use parking_lot::Mutex;
use rayon::ThreadPool;
use std::{
    marker::PhantomData,
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    },
    thread,
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

type Outputs<T> =
    Vec<TransactionOutput<<T as Transaction>::Output, <T as Transaction>::Error>>;

pub struct BlockExecutor<T> {
    config: BlockExecutorConfig,
    executor_thread_pool: Arc<ThreadPool>,
    // Helpers replaying scans that are currently running.
    live_validation_helpers: AtomicUsize,
    spawned_validation_helpers: AtomicUsize,
    phantom: PhantomData<T>,
}

/// Keeps the helper gauges accurate however the helper thread exits.
struct LiveHelperGuard<'a> {
    live_helpers: &'a AtomicUsize,
}

impl<'a> LiveHelperGuard<'a> {
    fn new(live_helpers: &'a AtomicUsize) -> Self {
        live_helpers.fetch_add(1, Ordering::SeqCst);
        counters::LIVE_VALIDATION_HELPERS.inc();
        Self { live_helpers }
    }
}

impl Drop for LiveHelperGuard<'_> {
    fn drop(&mut self) {
        self.live_helpers.fetch_sub(1, Ordering::SeqCst);
        counters::LIVE_VALIDATION_HELPERS.dec();
    }
}

impl<T: Transaction> BlockExecutor<T> {
    pub fn new(
        config: BlockExecutorConfig,
        executor_thread_pool: Arc<ThreadPool>,
    ) -> Result<Self, ConfigError> {
        config.sanitize()?;
        Ok(Self {
            config,
            executor_thread_pool,
            live_validation_helpers: AtomicUsize::new(0),
            spawned_validation_helpers: AtomicUsize::new(0),
            phantom: PhantomData,
        })
    }

    pub fn config(&self) -> &BlockExecutorConfig {
        &self.config
    }

    /// Number of scan replay helpers currently running.
    pub fn live_validation_helpers(&self) -> usize {
        self.live_validation_helpers.load(Ordering::SeqCst)
    }

    /// Number of scan replay helpers spawned by this executor so far.
    pub fn spawned_validation_helpers(&self) -> usize {
        self.spawned_validation_helpers.load(Ordering::SeqCst)
    }

    fn execute<S: KVStore>(
        &self,
        idx_to_execute: TxnIndex,
        incarnation: Incarnation,
        block: &[T],
        last_output: &TxnLastOutput<T::Output, T::Error>,
        versioned_cache: &MVStore,
        scheduler: &Scheduler,
        base_view: &S,
    ) -> Result<SchedulerTask, ParallelBlockExecutionError> {
        let _timer = TASK_EXECUTE_SECONDS.start_timer();
        if incarnation >= self.config.max_incarnations {
            return Err(ParallelBlockExecutionError::IncarnationLimitExceeded {
                txn_idx: idx_to_execute,
                incarnation,
            });
        }
        let txn = &block[idx_to_execute as usize];

        let sync_view =
            TransactionView::new(base_view, ViewState::Sync(versioned_cache), idx_to_execute);
        let execute_result = txn.execute(&sync_view);

        // The view observed an estimate: whatever the transaction returned, the incarnation
        // is discarded without publishing anything.
        if let Some(dep_idx) = sync_view.dependency() {
            counters::DEPENDENCY_ABORT_COUNT.inc();
            debug!(
                txn_idx = idx_to_execute,
                incarnation = incarnation,
                dep_idx = dep_idx,
                "[Execution]: read an estimate, aborting incarnation"
            );
            last_output.record(
                idx_to_execute,
                incarnation,
                ExecutionStatus::SpeculativeAbort(dep_idx),
                WriteSet::new(),
            );
            return Ok(scheduler.abort_on_dependency(idx_to_execute, incarnation, dep_idx)?);
        }
        if let Some(err) = sync_view.take_storage_error() {
            return Err(err.into());
        }

        let (write_set, captured_reads) = sync_view.into_parts();
        let (status, write_set) = match execute_result {
            Ok(output) => (ExecutionStatus::Success(output), write_set),
            // Writes of a failed transaction are discarded, its reads are still validated.
            Err(err) => (ExecutionStatus::Abort(err), WriteSet::new()),
        };

        let updates_outside =
            versioned_cache.record(idx_to_execute, incarnation, &write_set, captured_reads)?;
        last_output.record(idx_to_execute, incarnation, status, write_set);
        Ok(scheduler.finish_execution(idx_to_execute, incarnation, updates_outside)?)
    }

    /// Replays the reads of the last incarnation of txn_idx. Returns whether they are still
    /// valid and the highest estimate writer observed during the replay.
    fn validate_reads<S: KVStore>(
        &self,
        idx_to_validate: TxnIndex,
        versioned_cache: &MVStore,
        base_view: &S,
    ) -> Result<(bool, Option<TxnIndex>), ParallelBlockExecutionError> {
        if !versioned_cache.has_iterators(idx_to_validate) {
            let read_set = versioned_cache.validate_read_set(idx_to_validate, base_view)?;
            return Ok((read_set.valid, read_set.conflicts.last().copied()));
        }

        if !self.config.iterator_validation_helper {
            let read_set = versioned_cache.validate_read_set(idx_to_validate, base_view)?;
            if !read_set.valid {
                return Ok((false, read_set.conflicts.last().copied()));
            }
            let replay = versioned_cache.validate_iterators(
                idx_to_validate,
                base_view,
                &CancellationToken::new(),
            );
            return Self::resolve_replay(idx_to_validate, replay);
        }

        thread::scope(|s| -> Result<(bool, Option<TxnIndex>), ParallelBlockExecutionError> {
            let (sender, receiver) = bounded(1);
            let cancel = CancellationToken::new();
            let helper_cancel = cancel.clone();
            let live_helpers = &self.live_validation_helpers;

            self.spawned_validation_helpers.fetch_add(1, Ordering::SeqCst);
            s.spawn(move || {
                let _guard = LiveHelperGuard::new(live_helpers);
                let replay =
                    versioned_cache.validate_iterators(idx_to_validate, base_view, &helper_cancel);
                if let Err(err) = sender.try_send(replay) {
                    counters::DROPPED_VALIDATION_SIGNALS.inc();
                    let reason = match err {
                        TrySendError::Full(_) => "full",
                        TrySendError::Disconnected(_) => "disconnected",
                    };
                    debug!(
                        txn_idx = idx_to_validate,
                        reason = reason,
                        "[Execution]: dropped scan replay result"
                    );
                }
            });
            // Cancels the helper on every return path.
            let _cancel_on_return = cancel.drop_guard();

            let read_set = versioned_cache.validate_read_set(idx_to_validate, base_view)?;
            if !read_set.valid {
                return Ok((false, read_set.conflicts.last().copied()));
            }
            let replay = receiver.recv().map_err(|_| {
                code_invariant_error(format!(
                    "Scan replay helper of txn {} exited without a result",
                    idx_to_validate
                ))
            })?;
            Self::resolve_replay(idx_to_validate, replay)
        })
    }

    fn resolve_replay(
        idx_to_validate: TxnIndex,
        replay: ReplayOutcome,
    ) -> Result<(bool, Option<TxnIndex>), ParallelBlockExecutionError> {
        match replay {
            ReplayOutcome::Valid => Ok((true, None)),
            ReplayOutcome::Mismatch => Ok((false, None)),
            ReplayOutcome::Dependency(dep_idx) => Ok((false, Some(dep_idx))),
            ReplayOutcome::Storage(err) => Err(err.into()),
            ReplayOutcome::Cancelled => Err(code_invariant_error(format!(
                "Scan replay of txn {} cancelled while awaited",
                idx_to_validate
            ))
            .into()),
        }
    }

    fn validate<S: KVStore>(
        &self,
        idx_to_validate: TxnIndex,
        incarnation: Incarnation,
        versioned_cache: &MVStore,
        scheduler: &Scheduler,
        base_view: &S,
    ) -> Result<SchedulerTask, ParallelBlockExecutionError> {
        let _timer = TASK_VALIDATE_SECONDS.start_timer();
        let (valid, dependency) = self.validate_reads(idx_to_validate, versioned_cache, base_view)?;

        let aborted = !valid && scheduler.try_abort(idx_to_validate, incarnation);

        if aborted {
            counters::SPECULATIVE_ABORT_COUNT.inc();

            // Not valid and successfully aborted, mark the latest write set as estimates.
            versioned_cache.mark_estimates(idx_to_validate)?;

            Ok(scheduler.finish_abort(idx_to_validate, incarnation, dependency)?)
        } else {
            scheduler.finish_validation(idx_to_validate, incarnation, valid);
            Ok(SchedulerTask::NoTask)
        }
    }

    fn worker_loop<S: KVStore>(
        &self,
        block: &[T],
        last_output: &TxnLastOutput<T::Output, T::Error>,
        versioned_cache: &MVStore,
        scheduler: &Scheduler,
        base_view: &S,
        maybe_error: &Mutex<Option<ParallelBlockExecutionError>>,
    ) {
        let mut scheduler_task = SchedulerTask::NoTask;

        loop {
            let next = match scheduler_task {
                SchedulerTask::ValidationTask((txn_idx, incarnation)) => self.validate(
                    txn_idx,
                    incarnation,
                    versioned_cache,
                    scheduler,
                    base_view,
                ),
                SchedulerTask::ExecutionTask((txn_idx, incarnation)) => self.execute(
                    txn_idx,
                    incarnation,
                    block,
                    last_output,
                    versioned_cache,
                    scheduler,
                    base_view,
                ),
                SchedulerTask::NoTask => Ok(scheduler.next_task()),
                SchedulerTask::Done => break,
            };

            scheduler_task = match next {
                Ok(task) => task,
                Err(err) => {
                    // Only the first error is reported.
                    let mut maybe_error = maybe_error.lock();
                    if maybe_error.is_none() {
                        *maybe_error = Some(err);
                    }
                    scheduler.halt();
                    SchedulerTask::Done
                },
            };
        }
    }

    fn execute_transactions_parallel<S: KVStore>(
        &self,
        block: &[T],
        base_view: &mut S,
    ) -> Result<Outputs<T>, ParallelBlockExecutionError> {
        let _timer = PARALLEL_EXECUTION_SECONDS.start_timer();
        let num_txns = block.len();

        let versioned_cache = MVStore::new(num_txns);
        let scheduler = Scheduler::new(num_txns);
        let last_output = TxnLastOutput::new(num_txns);
        let maybe_error = Mutex::new(None);

        {
            let base_view: &S = base_view;
            self.executor_thread_pool.scope(|s| {
                for _ in 0..self.config.concurrency_level {
                    s.spawn(|_| {
                        self.worker_loop(
                            block,
                            &last_output,
                            &versioned_cache,
                            &scheduler,
                            base_view,
                            &maybe_error,
                        );
                    });
                }
            });
        }

        if let Some(err) = maybe_error.into_inner() {
            return Err(err);
        }
        scheduler.ensure_all_validated()?;

        let outputs = (0..num_txns)
            .map(|txn_idx| last_output.take_output(txn_idx as TxnIndex))
            .collect::<Result<Vec<_>, _>>()?;
        let num_keys = versioned_cache
            .write_latest_to_store(base_view)
            .map_err(|err| ParallelBlockExecutionError::Fatal(err.into()))?;

        info!(
            num_txns = num_txns,
            num_keys = num_keys,
            "[Execution]: Parallel execution completed"
        );
        Ok(outputs)
    }

    fn execute_transactions_sequential<S: KVStore>(
        &self,
        block: &[T],
        base_view: &mut S,
    ) -> BlockExecutionResult<Outputs<T>> {
        let _timer = SEQUENTIAL_EXECUTION_SECONDS.start_timer();
        let mut data_map = UnsyncMap::new();
        let mut ret = Vec::with_capacity(block.len());

        for (idx, txn) in block.iter().enumerate() {
            let txn_idx = idx as TxnIndex;
            let (result, write_set) = {
                let unsync_view =
                    TransactionView::new(&*base_view, ViewState::Unsync(&data_map), txn_idx);
                let result = txn.execute(&unsync_view);
                if let Some(dep_idx) = unsync_view.dependency() {
                    return Err(code_invariant_error(format!(
                        "Sequential execution of txn {} observed an estimate of txn {}",
                        txn_idx, dep_idx
                    ))
                    .into());
                }
                if let Some(err) = unsync_view.take_storage_error() {
                    return Err(err.into());
                }
                (result, unsync_view.into_parts().0)
            };

            let write_set = match result {
                Ok(_) => {
                    data_map.apply(txn_idx, &write_set);
                    write_set
                },
                Err(_) => WriteSet::new(),
            };
            ret.push(TransactionOutput {
                result,
                write_set,
                incarnation: 0,
            });
        }

        let num_keys = data_map.write_to_store(base_view)?;
        info!(
            num_txns = block.len(),
            num_keys = num_keys,
            "[Execution]: Sequential execution completed"
        );
        Ok(ret)
    }

    /// Executes the block and commits its writes to the store. The outputs are in block order
    /// and identical to those of executing the transactions one after another.
    pub fn process_all<S: KVStore>(
        &self,
        transactions: &[T],
        store: &mut S,
    ) -> BlockExecutionResult<Outputs<T>> {
        if transactions.is_empty() {
            return Ok(vec![]);
        }

        if self.config.concurrency_level > 1 && transactions.len() > 1 {
            match self.execute_transactions_parallel(transactions, store) {
                Ok(outputs) => return Ok(outputs),
                Err(ParallelBlockExecutionError::IncarnationLimitExceeded {
                    txn_idx,
                    incarnation,
                }) => {
                    if !self.config.sequential_fallback {
                        return Err(BlockExecutionError::IncarnationLimitExceeded {
                            txn_idx,
                            incarnation,
                        });
                    }
                    counters::SEQUENTIAL_FALLBACK_COUNT.inc();
                    warn!(
                        txn_idx = txn_idx,
                        incarnation = incarnation,
                        "[Execution]: Incarnation limit reached, sequential fallback"
                    );
                },
                Err(ParallelBlockExecutionError::Fatal(err)) => return Err(err),
            }
        }

        self.execute_transactions_sequential(transactions, store)
    }
}
