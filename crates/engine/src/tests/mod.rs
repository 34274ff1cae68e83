mod table_tests;

use std::sync::Arc;
use tempfile::TempDir;

use crate::{Config, Session};

/// A fresh session in a scratch directory. Keep the `TempDir` alive for the
/// duration of the test.
pub(crate) fn new_session() -> (TempDir, Arc<Session>) {
    let dir = tempfile::tempdir().expect("tempdir");
    let session = Session::open(dir.path().join("db")).expect("session opens");
    (dir, session)
}

/// A configuration that flushes and merges quickly.
pub(crate) fn small_config() -> Config {
    Config::new().write_buffer_capacity(4).max_runs_per_level(2)
}

/// Counts run data files under the session root.
pub(crate) fn keyops_files(session: &Session) -> usize {
    std::fs::read_dir(session.root())
        .expect("session root readable")
        .filter_map(|e| e.ok())
        .filter(|e| {
            e.path()
                .extension()
                .and_then(|s| s.to_str())
                .map(|ext| ext == "keyops")
                .unwrap_or(false)
        })
        .count()
}
