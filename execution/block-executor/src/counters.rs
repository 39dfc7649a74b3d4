// Copyright © Aptos Foundation
// SPDX-License-Identifier: Apache-2.0

use once_cell::sync::Lazy;
use prometheus::{
    register_histogram, register_int_counter, register_int_gauge, Histogram, IntCounter, IntGauge,
};

/// Count of times the scheduler aborted a transaction after a failed validation.
pub static SPECULATIVE_ABORT_COUNT: Lazy<IntCounter> = Lazy::new(|| {
    register_int_counter!(
        "occ_execution_speculative_abort_count",
        "Number of speculative aborts in parallel execution (leading to re-execution)"
    )
    .unwrap()
});

/// Count of executions that observed an estimate and were parked on the writer.
pub static DEPENDENCY_ABORT_COUNT: Lazy<IntCounter> = Lazy::new(|| {
    register_int_counter!(
        "occ_execution_dependency_abort_count",
        "Number of executions aborted upon reading an estimate of a lower transaction"
    )
    .unwrap()
});

pub static SEQUENTIAL_FALLBACK_COUNT: Lazy<IntCounter> = Lazy::new(|| {
    register_int_counter!(
        "occ_execution_sequential_fallback_count",
        "Number of blocks re-executed sequentially after parallel execution was halted"
    )
    .unwrap()
});

pub static PARALLEL_EXECUTION_SECONDS: Lazy<Histogram> = Lazy::new(|| {
    register_histogram!(
        "occ_execution_parallel_execution_seconds",
        "Time spent in seconds in parallel execution of a block"
    )
    .unwrap()
});

pub static SEQUENTIAL_EXECUTION_SECONDS: Lazy<Histogram> = Lazy::new(|| {
    register_histogram!(
        "occ_execution_sequential_execution_seconds",
        "Time spent in seconds in sequential execution of a block"
    )
    .unwrap()
});

pub static TASK_EXECUTE_SECONDS: Lazy<Histogram> = Lazy::new(|| {
    register_histogram!(
        "occ_execution_task_execute_seconds",
        "Time spent in seconds for an execution task"
    )
    .unwrap()
});

pub static TASK_VALIDATE_SECONDS: Lazy<Histogram> = Lazy::new(|| {
    register_histogram!(
        "occ_execution_task_validate_seconds",
        "Time spent in seconds for a validation task"
    )
    .unwrap()
});

/// Validation helpers currently running, across all executors of the process.
pub static LIVE_VALIDATION_HELPERS: Lazy<IntGauge> = Lazy::new(|| {
    register_int_gauge!(
        "occ_execution_live_validation_helpers",
        "Number of live helper threads replaying recorded scans"
    )
    .unwrap()
});

pub static DROPPED_VALIDATION_SIGNALS: Lazy<IntCounter> = Lazy::new(|| {
    register_int_counter!(
        "occ_execution_dropped_validation_signals",
        "Number of scan replay results dropped because the validator had already returned"
    )
    .unwrap()
});
