//! Structural error type for `jungle_db`.
//!
//! Expected outcomes (a failed commit, a missing key) are conveyed as plain
//! return values (`bool`, `Option`) and never appear here; see the
//! propagation policy in the crate's design notes. `Error` covers only
//! structural failures: illegal state transitions, invalid argument
//! combinations, uniqueness violations, and backend I/O failures.

use std::fmt;

use thiserror::Error;

use crate::index_key::KeyPath;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Error)]
pub enum Error {
    /// Operation attempted on a transaction (or index) in the wrong state,
    /// e.g. a write on a COMMITTED transaction, or creating an index while a
    /// transaction is open on the owning store.
    #[error("illegal state: {0}")]
    IllegalState(String),

    /// A unique index already has an entry for the indexed key.
    #[error("uniqueness violation on index {index_name:?} for key path {key_path:?}")]
    UniquenessViolation {
        index_name: String,
        key_path: KeyPath,
    },

    /// A combined transaction was constructed from an invalid set of
    /// members (not OPEN, two members on the same store, cross-database).
    #[error("invalid combined transaction arguments: {0}")]
    InvalidArguments(String),

    /// The backend returned an error while servicing a get/put/range/flush
    /// call. The current commit/flush is aborted; the state stack is left
    /// consistent (the failed state is neither pushed nor popped).
    #[error("backend failure: {0}")]
    BackendFailure(#[source] Box<dyn std::error::Error + Send + Sync + 'static>),
}

impl Error {
    pub fn illegal_state(msg: impl fmt::Display) -> Self {
        Error::IllegalState(msg.to_string())
    }

    pub fn invalid_arguments(msg: impl fmt::Display) -> Self {
        Error::InvalidArguments(msg.to_string())
    }

    pub fn backend_failure<E>(err: E) -> Self
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        Error::BackendFailure(Box::new(err))
    }
}
