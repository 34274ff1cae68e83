use std::io;
use thiserror::Error;

/// Errors surfaced by run construction, lookup and merging.
#[derive(Debug, Error)]
pub enum RunError {
    /// An underlying I/O error. Retryable at the caller's discretion.
    #[error("io error: {0}")]
    Io(#[from] io::Error),

    /// An on-disk structure failed a checksum or invariant check.
    #[error("corrupt run data: {0}")]
    Corrupt(&'static str),
}

pub type Result<T> = std::result::Result<T, RunError>;
