// Copyright © Aptos Foundation
// SPDX-License-Identifier: Apache-2.0

use crossbeam::utils::CachePadded;
use occ_mvstore::types::{code_invariant_error, Incarnation, PanicError, TxnIndex, Version};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

/// A holder for potential task returned from the Scheduler. ExecutionTask and ValidationTask
/// each contain a version of transaction that must be executed or validated, respectively.
/// NoTask holds no task (similar None if we wrapped tasks in Option), and Done implies that
/// there are no more tasks and the scheduler is done.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SchedulerTask {
    ExecutionTask(Version),
    ValidationTask(Version),
    NoTask,
    Done,
}

/// All possible statuses for each transaction. Each status contains the latest incarnation number.
///
/// 'Pending' means that the corresponding incarnation should be executed and the scheduler
/// must eventually create a corresponding execution task. The scheduler ensures that exactly one
/// execution task gets created, changing the status to 'Executing' in the process.
///
/// 'Executing' status of an incarnation turns into 'Executed' if the execution task finishes. If
/// the execution observed an estimate, the incarnation is discarded and the status becomes
/// 'Waiting(incarnation + 1)' until the blocking transaction finishes its execution, at which
/// point it is 'Pending(incarnation + 1)' again. An 'Executed' status allows creation of validation
/// tasks for the corresponding incarnation, a successful validation makes it 'Validated', and a
/// validation failure leads to an abort. The scheduler ensures that there is exactly one abort per
/// version, changing the status to 'Invalidated' in the process. Once the thread that successfully
/// aborted performs everything that's required, it sets the status to 'Pending(incarnation + 1)'
/// or 'Waiting(incarnation + 1)'.
///
/// Status transition diagram:
/// Pending(i)
///    |  try_incarnate (incarnate successfully)
///    |
///    ↓         abort_on_dependency                            resume
/// Executing(i) -----------------------------> Waiting(i+1) ------------> Pending(i+1)
///    |
///    |  finish_execution
///    ↓                   finish_validation
/// Executed(i) -------------------------------> Validated(i)
///    |                                              |
///    |  try_abort (abort successfully)              |
///    ↓                finish_abort                  |
/// Invalidated(i) <----------------------------------+
///    |
///    +-------------------------------------> Pending(i+1) | Waiting(i+1)
///
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TaskStatus {
    Pending(Incarnation),
    Executing(Incarnation),
    Executed(Incarnation),
    Validated(Incarnation),
    Invalidated(Incarnation),
    Waiting(Incarnation),
}

impl TaskStatus {
    fn executed_incarnation(&self) -> Option<Incarnation> {
        match self {
            TaskStatus::Executed(incarnation) | TaskStatus::Validated(incarnation) => {
                Some(*incarnation)
            },
            _ => None,
        }
    }
}

pub struct Scheduler {
    /// Number of txns to execute, immutable.
    num_txns: usize,

    /// A shared index that tracks the minimum of all transaction indices that require execution.
    /// The threads increment the index and attempt to create an execution task for the corresponding
    /// transaction, if the status of the txn is 'Pending'. This implements a counting-based
    /// concurrent ordered set. It is reduced as necessary when transactions become ready to be
    /// executed, in particular, when execution finishes and dependencies are resolved.
    execution_idx: AtomicUsize,
    /// A shared index that tracks the minimum of all transaction indices that require validation.
    /// The threads increment this index and attempt to create a validation task for the
    /// corresponding transaction (if the status of the txn is 'Executed' or 'Validated').
    /// The index is reduced as necessary when transactions require validation, in particular,
    /// after aborts and executions that write outside of the write set of the same transaction's
    /// previous incarnation.
    validation_idx: AtomicUsize,
    /// Incremented every time one of the indices above is decreased, so that a thread checking
    /// for completion can detect a concurrent decrease.
    decrease_cnt: AtomicUsize,
    /// Number of tasks handed out and not yet finished.
    num_active_tasks: AtomicUsize,

    /// Shared marker that is set when a thread detects that all txns are validated, or when
    /// the execution is halted.
    done_marker: AtomicBool,
    halted: AtomicBool,

    /// An index i maps to indices of other transactions that depend on transaction i, i.e. they
    /// should be re-executed once transaction i's next incarnation finishes.
    txn_dependency: Vec<CachePadded<Mutex<Vec<TxnIndex>>>>,
    /// An index i maps to the most up-to-date status of transaction i.
    txn_status: Vec<CachePadded<Mutex<TaskStatus>>>,
}

/// Public Interfaces for the Scheduler
impl Scheduler {
    pub fn new(num_txns: usize) -> Self {
        Self {
            num_txns,
            execution_idx: AtomicUsize::new(0),
            validation_idx: AtomicUsize::new(0),
            decrease_cnt: AtomicUsize::new(0),
            num_active_tasks: AtomicUsize::new(0),
            done_marker: AtomicBool::new(false),
            halted: AtomicBool::new(false),
            txn_dependency: (0..num_txns)
                .map(|_| CachePadded::new(Mutex::new(Vec::new())))
                .collect(),
            txn_status: (0..num_txns)
                .map(|_| CachePadded::new(Mutex::new(TaskStatus::Pending(0))))
                .collect(),
        }
    }

    /// Return the number of transactions to be executed from the block.
    pub fn num_txns(&self) -> usize {
        self.num_txns
    }

    /// Checks whether the done marker is set. The marker can only be set by 'check_done'
    /// or 'halt'.
    pub fn done(&self) -> bool {
        self.done_marker.load(Ordering::Acquire)
    }

    /// Stops all workers. Returns true if this call halted the scheduler.
    pub fn halt(&self) -> bool {
        // The first thread that sets done_marker to be true will be responsible for
        // resolving the halt.
        let first = !self.halted.swap(true, Ordering::SeqCst);
        self.done_marker.store(true, Ordering::Release);
        first
    }

    pub fn is_halted(&self) -> bool {
        self.halted.load(Ordering::Acquire)
    }

    /// Return the next task for the thread.
    pub fn next_task(&self) -> SchedulerTask {
        if self.done() {
            // No more tasks.
            return SchedulerTask::Done;
        }

        let idx_to_validate = self.validation_idx.load(Ordering::Acquire);
        let idx_to_execute = self.execution_idx.load(Ordering::Acquire);

        if idx_to_validate < idx_to_execute {
            if let Some(version_to_validate) = self.try_validate_next_version() {
                return SchedulerTask::ValidationTask(version_to_validate);
            }
        } else if let Some(version_to_execute) = self.try_execute_next_version() {
            return SchedulerTask::ExecutionTask(version_to_execute);
        }
        SchedulerTask::NoTask
    }

    /// After txn is executed, schedule its dependencies for re-execution.
    /// If wrote_new_key is true, decrease validation_idx to schedule all higher transactions
    /// for (re-)validation. Otherwise, in some cases (if validation_idx not already lower),
    /// return a validation task of the transaction to the caller (otherwise NoTask).
    pub fn finish_execution(
        &self,
        txn_idx: TxnIndex,
        incarnation: Incarnation,
        wrote_new_key: bool,
    ) -> Result<SchedulerTask, PanicError> {
        self.set_status(
            txn_idx,
            TaskStatus::Executing(incarnation),
            TaskStatus::Executed(incarnation),
        )?;

        let txn_deps: Vec<TxnIndex> = {
            let mut stored_deps = self.txn_dependency[txn_idx as usize].lock();
            // Holding the lock, take dependency vector.
            std::mem::take(&mut stored_deps)
        };
        self.resume_dependencies(txn_deps)?;

        // If validation_idx is already lower than txn_idx, all required transactions will be
        // considered for validation, and there is nothing to do.
        if self.validation_idx.load(Ordering::Acquire) > txn_idx as usize {
            if wrote_new_key {
                // The transaction execution required revalidating all higher txns (not
                // only itself), currently happens when incarnation writes to a new key
                // (w.r.t. the write-set of its previous completed incarnation).
                self.decrease_validation_idx(txn_idx as usize);
            } else {
                // Only transaction txn_idx requires validation. Return validation task
                // back to the caller, the task stays active.
                return Ok(SchedulerTask::ValidationTask((txn_idx, incarnation)));
            }
        }

        self.finish_task();
        Ok(SchedulerTask::NoTask)
    }

    /// Called when the execution of version (txn_idx, incarnation) observed an estimate written
    /// by dep_txn_idx. The incarnation is discarded. If dep_txn_idx has not finished its execution
    /// in the meantime, the transaction is parked on it and NoTask is returned. Otherwise the
    /// re-execution task of the next incarnation is returned to the caller.
    pub fn abort_on_dependency(
        &self,
        txn_idx: TxnIndex,
        incarnation: Incarnation,
        dep_txn_idx: TxnIndex,
    ) -> Result<SchedulerTask, PanicError> {
        if dep_txn_idx >= txn_idx {
            return Err(code_invariant_error(format!(
                "Txn {} can not depend on txn {}",
                txn_idx, dep_txn_idx
            )));
        }

        let mut stored_deps = self.txn_dependency[dep_txn_idx as usize].lock();
        // Note: acquires status mutexes while holding the dependency mutex, always in this
        // order, so it may not deadlock.
        let dep_executed = self.is_executed(dep_txn_idx).is_some();

        let mut status = self.txn_status[txn_idx as usize].lock();
        if *status != TaskStatus::Executing(incarnation) {
            return Err(code_invariant_error(format!(
                "Dependency abort of txn {} in status {:?}, expected Executing({})",
                txn_idx, *status, incarnation
            )));
        }

        if dep_executed {
            // Dependency got resolved, to avoid a zombie dependency (and losing liveness)
            // the caller re-executes right away with the same active task.
            *status = TaskStatus::Executing(incarnation + 1);
            return Ok(SchedulerTask::ExecutionTask((txn_idx, incarnation + 1)));
        }

        *status = TaskStatus::Waiting(incarnation + 1);
        // Safe to add dependency here (still holding the lock) - finish_execution of txn
        // dep_txn_idx is guaranteed to acquire the same lock later and clear the dependency.
        stored_deps.push(txn_idx);
        drop(status);
        drop(stored_deps);

        self.finish_task();
        Ok(SchedulerTask::NoTask)
    }

    /// Try to abort version = (txn_idx, incarnation), called upon validation failure.
    /// When the invocation manages to update the status of the transaction, it changes
    /// Executed(incarnation) or Validated(incarnation) => Invalidated(incarnation), and returns
    /// true. Otherwise, returns false. Since incarnation numbers never decrease, this also
    /// ensures that the same version may not successfully abort more than once.
    pub fn try_abort(&self, txn_idx: TxnIndex, incarnation: Incarnation) -> bool {
        let mut status = self.txn_status[txn_idx as usize].lock();

        if status.executed_incarnation() == Some(incarnation) {
            *status = TaskStatus::Invalidated(incarnation);
            true
        } else {
            false
        }
    }

    /// Finalize a validation task of version (txn_idx, incarnation) that was not aborted.
    pub fn finish_validation(&self, txn_idx: TxnIndex, incarnation: Incarnation, valid: bool) {
        if valid {
            let mut status = self.txn_status[txn_idx as usize].lock();
            if *status == TaskStatus::Executed(incarnation) {
                *status = TaskStatus::Validated(incarnation);
            }
        }
        self.finish_task();
    }

    /// Finalize a validation task of version (txn_idx, incarnation) after a successful abort.
    /// All higher transactions are scheduled for re-validation. If the validation observed an
    /// estimate of a transaction that has not finished executing, txn_idx is parked on it.
    /// In some cases, may return a re-execution task back to the caller (otherwise, NoTask).
    pub fn finish_abort(
        &self,
        txn_idx: TxnIndex,
        incarnation: Incarnation,
        dependency: Option<TxnIndex>,
    ) -> Result<SchedulerTask, PanicError> {
        // Schedule higher txns for validation, txn_idx itself needs to be re-executed first.
        self.decrease_validation_idx(txn_idx as usize + 1);

        if let Some(dep_txn_idx) = dependency.filter(|dep| *dep < txn_idx) {
            let mut stored_deps = self.txn_dependency[dep_txn_idx as usize].lock();
            if self.is_executed(dep_txn_idx).is_none() {
                self.set_status(
                    txn_idx,
                    TaskStatus::Invalidated(incarnation),
                    TaskStatus::Waiting(incarnation + 1),
                )?;
                stored_deps.push(txn_idx);
                drop(stored_deps);

                self.finish_task();
                return Ok(SchedulerTask::NoTask);
            }
        }

        self.set_status(
            txn_idx,
            TaskStatus::Invalidated(incarnation),
            TaskStatus::Pending(incarnation + 1),
        )?;

        // txn_idx must be re-executed, and if execution_idx is lower, it will be.
        if self.execution_idx.load(Ordering::Acquire) > txn_idx as usize {
            // Optimization: execution_idx is higher than txn_idx, but decreasing it may
            // lead to wasted work for all indices between txn_idx and execution_idx.
            // Instead, attempt to create a new incarnation and return the corresponding
            // re-execution task back to the caller. If incarnation fails, there is
            // nothing to do, as another thread must have succeeded to incarnate and
            // obtain the task for re-execution.
            if let Some(new_incarnation) = self.try_incarnate(txn_idx) {
                return Ok(SchedulerTask::ExecutionTask((txn_idx, new_incarnation)));
            }
        }

        self.finish_task();
        Ok(SchedulerTask::NoTask)
    }

    /// Once the scheduler is done (and was not halted), every transaction must have been
    /// validated.
    pub fn ensure_all_validated(&self) -> Result<(), PanicError> {
        for (txn_idx, status) in self.txn_status.iter().enumerate() {
            let status = *status.lock();
            if !matches!(status, TaskStatus::Validated(_)) {
                return Err(code_invariant_error(format!(
                    "Txn {} in status {:?} after parallel execution",
                    txn_idx, status
                )));
            }
        }
        Ok(())
    }

    pub fn status(&self, txn_idx: TxnIndex) -> TaskStatus {
        *self.txn_status[txn_idx as usize].lock()
    }
}

/// Private functions of the Scheduler
impl Scheduler {
    fn decrease_execution_idx(&self, target_idx: usize) {
        self.execution_idx.fetch_min(target_idx, Ordering::SeqCst);
        self.decrease_cnt.fetch_add(1, Ordering::SeqCst);
    }

    fn decrease_validation_idx(&self, target_idx: usize) {
        self.validation_idx.fetch_min(target_idx, Ordering::SeqCst);
        self.decrease_cnt.fetch_add(1, Ordering::SeqCst);
    }

    fn finish_task(&self) {
        self.num_active_tasks.fetch_sub(1, Ordering::SeqCst);
    }

    /// Sets the done marker if both indices are past the block, no task is in progress and
    /// no index was decreased during the check.
    fn check_done(&self) {
        let observed_cnt = self.decrease_cnt.load(Ordering::SeqCst);
        let idx_to_execute = self.execution_idx.load(Ordering::SeqCst);
        let idx_to_validate = self.validation_idx.load(Ordering::SeqCst);
        if idx_to_execute.min(idx_to_validate) >= self.num_txns
            && self.num_active_tasks.load(Ordering::SeqCst) == 0
            && observed_cnt == self.decrease_cnt.load(Ordering::SeqCst)
        {
            self.done_marker.store(true, Ordering::Release);
        }
    }

    /// Try and incarnate a transaction. Only possible when the status is
    /// Pending(incarnation), in which case Some(incarnation) is returned and the
    /// status is (atomically, due to the mutex) updated to Executing(incarnation).
    /// An unsuccessful incarnation returns None. Since incarnation numbers never decrease
    /// for each transaction, incarnate function may not succeed more than once per version.
    fn try_incarnate(&self, txn_idx: TxnIndex) -> Option<Incarnation> {
        let mut status = self.txn_status.get(txn_idx as usize)?.lock();
        if let TaskStatus::Pending(incarnation) = *status {
            *status = TaskStatus::Executing(incarnation);
            Some(incarnation)
        } else {
            None
        }
    }

    /// If the status of transaction is Executed(incarnation) or Validated(incarnation), returns
    /// Some(incarnation), otherwise returns None. Useful to determine when a transaction can be
    /// validated, and to avoid a race in dependency resolution.
    fn is_executed(&self, txn_idx: TxnIndex) -> Option<Incarnation> {
        self.txn_status
            .get(txn_idx as usize)?
            .lock()
            .executed_incarnation()
    }

    /// Grab an index to try and validate next (by fetch-and-incrementing validation_idx).
    /// - If the index is out of bounds, return None (and invoke a check of whether
    /// all txns are validated).
    /// - If the transaction is ready for validation (EXECUTED or VALIDATED state), return
    /// the version to the caller.
    /// - Otherwise, return None.
    fn try_validate_next_version(&self) -> Option<Version> {
        if self.validation_idx.load(Ordering::Acquire) >= self.num_txns {
            self.check_done();
            return None;
        }

        self.num_active_tasks.fetch_add(1, Ordering::SeqCst);
        let idx_to_validate = self.validation_idx.fetch_add(1, Ordering::SeqCst);
        if idx_to_validate < self.num_txns {
            if let Some(incarnation) = self.is_executed(idx_to_validate as TxnIndex) {
                return Some((idx_to_validate as TxnIndex, incarnation));
            }
        }

        self.finish_task();
        None
    }

    /// Grab an index to try and execute next (by fetch-and-incrementing execution_idx).
    /// - If the index is out of bounds, return None (and invoke a check of whether
    /// all txns are validated).
    /// - If the transaction is ready for execution (Pending state), attempt
    /// to create the next incarnation (should happen exactly once), and if successful,
    /// return the version to the caller for the corresponding ExecutionTask.
    /// - Otherwise, return None.
    fn try_execute_next_version(&self) -> Option<Version> {
        if self.execution_idx.load(Ordering::Acquire) >= self.num_txns {
            self.check_done();
            return None;
        }

        self.num_active_tasks.fetch_add(1, Ordering::SeqCst);
        let idx_to_execute = self.execution_idx.fetch_add(1, Ordering::SeqCst);
        if idx_to_execute < self.num_txns {
            if let Some(incarnation) = self.try_incarnate(idx_to_execute as TxnIndex) {
                return Some((idx_to_execute as TxnIndex, incarnation));
            }
        }

        self.finish_task();
        None
    }

    /// When a dependency is resolved, mark the transactions waiting on it as Pending and
    /// decrease the execution index so they get a chance to be re-executed.
    fn resume_dependencies(&self, txn_deps: Vec<TxnIndex>) -> Result<(), PanicError> {
        let mut min_dep = None;
        for dep in txn_deps {
            let mut status = self.txn_status[dep as usize].lock();
            match *status {
                TaskStatus::Waiting(incarnation) => {
                    *status = TaskStatus::Pending(incarnation);
                },
                other => {
                    return Err(code_invariant_error(format!(
                        "Resuming txn {} in status {:?}, expected Waiting",
                        dep, other
                    )))
                },
            }
            min_dep = Some(min_dep.map_or(dep, |min: TxnIndex| min.min(dep)));
        }
        if let Some(execution_target_idx) = min_dep {
            self.decrease_execution_idx(execution_target_idx as usize);
        }
        Ok(())
    }

    fn set_status(
        &self,
        txn_idx: TxnIndex,
        expected: TaskStatus,
        new_status: TaskStatus,
    ) -> Result<(), PanicError> {
        let mut status = self.txn_status[txn_idx as usize].lock();
        if *status != expected {
            return Err(code_invariant_error(format!(
                "Txn {} in status {:?}, expected {:?}",
                txn_idx, *status, expected
            )));
        }
        *status = new_status;
        Ok(())
    }
}
