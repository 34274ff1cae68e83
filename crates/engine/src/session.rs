//! Sessions: root-directory ownership, run-id allocation, and the snapshot
//! registry.
//!
//! A session owns one directory and assumes exclusive control of it. Run
//! files are named by a session-monotonic id; opening a session removes
//! leftover run and temp files from a previous process (nothing outside the
//! snapshot registry outlives the process that wrote it).
//!
//! Snapshots are a process-wide map from validated names to frozen table
//! descriptors. The descriptor pins the snapshotted runs by reference, so
//! their files stay on disk for as long as the snapshot (or any table opened
//! from it) lives. Writes to the registry are serialized behind a mutex.

use std::collections::hash_map::Entry as MapEntry;
use std::collections::HashMap;
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use run::{Run, RunPaths};
use writebuffer::WriteBuffer;

use crate::config::Config;
use crate::error::{Error, Result};
use crate::table::Table;

/// File suffixes a session may create under its root.
const RUN_FILE_EXTENSIONS: [&str; 5] = ["keyops", "blobs", "filter", "index", "tmp"];

/// Windows device names a snapshot name must avoid to stay usable as a file
/// name everywhere.
const RESERVED_NAMES: [&str; 22] = [
    "con", "prn", "aux", "nul", "com1", "com2", "com3", "com4", "com5", "com6", "com7", "com8",
    "com9", "lpt1", "lpt2", "lpt3", "lpt4", "lpt5", "lpt6", "lpt7", "lpt8", "lpt9",
];

/// A validated snapshot name: 1–64 characters of `[a-z0-9_-]`, not a
/// reserved device name.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SnapshotName(String);

impl SnapshotName {
    pub fn new(name: &str) -> Result<Self> {
        let valid_chars = name
            .bytes()
            .all(|b| b.is_ascii_lowercase() || b.is_ascii_digit() || b == b'_' || b == b'-');
        if name.is_empty() || name.len() > 64 || !valid_chars {
            return Err(Error::InvalidSnapshotName(name.to_string()));
        }
        if RESERVED_NAMES.contains(&name) {
            return Err(Error::InvalidSnapshotName(name.to_string()));
        }
        Ok(Self(name.to_string()))
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SnapshotName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for SnapshotName {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// A frozen table descriptor stored in the registry.
pub(crate) struct Snapshot {
    pub(crate) label: String,
    pub(crate) config: Config,
    /// Resident runs per level, newest level (and newest run) first.
    pub(crate) levels: Vec<Vec<Arc<Run>>>,
    pub(crate) write_buffer: WriteBuffer,
}

/// A storage session rooted at one directory.
pub struct Session {
    root: PathBuf,
    next_run_id: AtomicU64,
    closed: AtomicBool,
    snapshots: Mutex<HashMap<SnapshotName, Snapshot>>,
}

impl Session {
    /// Opens a session, creating the root directory if needed and removing
    /// run and temp files left behind by a previous process.
    pub fn open(root: impl AsRef<Path>) -> Result<Arc<Session>> {
        let root = root.as_ref().to_path_buf();
        fs::create_dir_all(&root)?;

        let mut removed = 0usize;
        for dir_entry in fs::read_dir(&root)? {
            let path = dir_entry?.path();
            let is_run_file = path
                .extension()
                .and_then(|e| e.to_str())
                .is_some_and(|ext| RUN_FILE_EXTENSIONS.contains(&ext));
            if is_run_file {
                fs::remove_file(&path)?;
                removed += 1;
            }
        }

        log::debug!(
            "opened session at {} ({} stale files removed)",
            root.display(),
            removed,
        );

        Ok(Arc::new(Session {
            root,
            next_run_id: AtomicU64::new(0),
            closed: AtomicBool::new(false),
            snapshots: Mutex::new(HashMap::new()),
        }))
    }

    /// The session's root directory.
    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Creates an empty table in this session.
    pub fn new_table(self: &Arc<Self>, config: Config) -> Result<Table> {
        self.ensure_open()?;
        Ok(Table::create(Arc::clone(self), config))
    }

    /// Opens the snapshot stored under `name` as a fresh, independent table.
    ///
    /// `label` must match the label given at snapshot time; a mismatch means
    /// the caller expects different key/value types than were stored.
    pub fn open_snapshot(self: &Arc<Self>, name: &SnapshotName, label: &str) -> Result<Table> {
        self.ensure_open()?;
        let registry = lock(&self.snapshots);
        let snapshot = registry
            .get(name)
            .ok_or_else(|| Error::NoSuchSnapshot(name.to_string()))?;
        if snapshot.label != label {
            return Err(Error::SnapshotTypeMismatch {
                name: name.to_string(),
                expected: label.to_string(),
                found: snapshot.label.clone(),
            });
        }
        log::debug!("opening snapshot `{name}`");
        Ok(Table::from_snapshot(Arc::clone(self), snapshot))
    }

    /// Removes the snapshot stored under `name`, releasing its run
    /// references.
    pub fn delete_snapshot(&self, name: &SnapshotName) -> Result<()> {
        self.ensure_open()?;
        match lock(&self.snapshots).entry(name.clone()) {
            MapEntry::Occupied(occupied) => {
                occupied.remove();
                log::debug!("deleted snapshot `{name}`");
                Ok(())
            }
            MapEntry::Vacant(_) => Err(Error::NoSuchSnapshot(name.to_string())),
        }
    }

    /// Names of all stored snapshots, unordered.
    #[must_use]
    pub fn snapshot_names(&self) -> Vec<SnapshotName> {
        lock(&self.snapshots).keys().cloned().collect()
    }

    /// Closes the session: drops every snapshot and fails all further
    /// operations on it (and on its tables) with `HandleClosed`.
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        lock(&self.snapshots).clear();
        log::debug!("closed session at {}", self.root.display());
    }

    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    pub(crate) fn ensure_open(&self) -> Result<()> {
        if self.is_closed() {
            Err(Error::HandleClosed)
        } else {
            Ok(())
        }
    }

    /// Allocates a fresh run id and its file paths under the session root.
    pub(crate) fn allocate_run_paths(&self) -> RunPaths {
        let run_id = self.next_run_id.fetch_add(1, Ordering::SeqCst);
        RunPaths::new(&self.root, run_id)
    }

    /// Stores (or replaces) a snapshot under `name`.
    pub(crate) fn store_snapshot(&self, name: SnapshotName, snapshot: Snapshot) {
        log::debug!("storing snapshot `{name}`");
        lock(&self.snapshots).insert(name, snapshot);
    }
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("root", &self.root)
            .field("closed", &self.is_closed())
            .field("snapshots", &lock(&self.snapshots).len())
            .finish()
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(std::sync::PoisonError::into_inner)
}
