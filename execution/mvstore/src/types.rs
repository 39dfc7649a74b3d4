// Copyright © Aptos Foundation
// SPDX-License-Identifier: Apache-2.0

use bytes::Bytes;
use occ_kv_store::StorageError;
use std::collections::BTreeMap;
use thiserror::Error;
use tracing::error;

pub type TxnIndex = u32;
pub type Incarnation = u32;
pub type Version = (TxnIndex, Incarnation);

/// Keys written by an incarnation, mapped to the written value (`None` is a deletion).
pub type WriteSet = BTreeMap<Bytes, Option<Bytes>>;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum Flag {
    Done,
    Estimate,
}

/// Returned as Err(..) when failed to read from the multi-version data-structure.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MVDataError {
    /// No prior entry is found, the read must fall through to the backing store.
    NotFound,
    /// A dependency on other transaction has been found during the read: the entry
    /// of the returned index is an estimate.
    Dependency(TxnIndex),
}

/// Returned as Ok(..) when read successfully from the multi-version data-structure.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum MVDataOutput {
    /// Information from the last versioned-write below the reader. `None` value is a
    /// deletion.
    Versioned(Version, Option<Bytes>),
}

/// Errors that indicate a bug in the execution algorithm rather than a condition of the
/// block being executed.
#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum PanicError {
    #[error("Code invariant error: {0}")]
    CodeInvariantError(String),
}

pub fn code_invariant_error<M: std::fmt::Debug>(message: M) -> PanicError {
    let msg = format!(
        "Code invariant broken (there is a bug in the code), {:?}",
        message
    );
    error!("{}", msg);
    PanicError::CodeInvariantError(msg)
}

#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum MVStoreError {
    #[error(transparent)]
    Storage(#[from] StorageError),
    #[error(transparent)]
    CodeInvariant(#[from] PanicError),
}
