use std::path::PathBuf;

use thiserror::Error;

/// Errors that can cross the core's API boundary.
///
/// Only [`TraceError::Io`] is ever propagated out of [`crate::store::EventStore::parse`];
/// every other condition is handled internally and folded into a result value
/// (an empty hit list, a `None`, a partial-result flag) per the boundary contract.
#[derive(Debug, Error)]
pub enum TraceError {
    #[error("failed to read trace file {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("sqlite cache signature mismatch, falling back to a fresh parse")]
    CacheMismatch,

    #[error("effective address could not be resolved for event {index}")]
    UnparseableEffAddr { index: usize },

    #[error("native decoder unavailable, falling back to the mnemonic classifier")]
    DecoderUnavailable,

    #[error("budget of {budget} steps exhausted before the query finished")]
    BudgetExceeded { budget: usize },

    #[error("query was cancelled")]
    Cancelled,
}

pub type Result<T> = std::result::Result<T, TraceError>;
