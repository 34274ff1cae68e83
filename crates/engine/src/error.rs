use run::RunError;
use std::io;
use thiserror::Error;

/// Errors surfaced by sessions and tables.
#[derive(Debug, Error)]
pub enum Error {
    /// An operation was invoked on a closed table or session.
    #[error("handle already closed")]
    HandleClosed,

    /// `open_snapshot` was given a name the session has no snapshot under.
    #[error("no snapshot named `{0}`")]
    NoSuchSnapshot(String),

    /// The stored snapshot carries a different label than the caller
    /// expected. The label is the caller's witness for the key/value types
    /// it serialized into the snapshot.
    #[error("snapshot `{name}` is labelled `{found}`, expected `{expected}`")]
    SnapshotTypeMismatch {
        name: String,
        expected: String,
        found: String,
    },

    /// The string is not a valid snapshot name (1–64 chars of `[a-z0-9_-]`,
    /// not a reserved device name).
    #[error("invalid snapshot name `{0}`")]
    InvalidSnapshotName(String),

    /// Two tables from different sessions were combined. No current
    /// operation produces this; the kind is reserved.
    #[error("tables belong to different sessions")]
    DifferentSessions,

    /// A key exceeded [`crate::MAX_KEY_SIZE`].
    #[error("key too large: {0} bytes")]
    KeyTooLarge(usize),

    /// A value or blob exceeded [`crate::MAX_VALUE_SIZE`].
    #[error("value too large: {0} bytes")]
    ValueTooLarge(usize),

    /// An underlying I/O failure. Retryable at the caller's discretion.
    #[error("io error: {0}")]
    Io(#[from] io::Error),

    /// A run-level failure: I/O during page or blob access, or corrupt
    /// on-disk structures.
    #[error(transparent)]
    Run(#[from] RunError),
}

pub type Result<T> = std::result::Result<T, Error>;
