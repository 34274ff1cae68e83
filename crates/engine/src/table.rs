//! Tables: the mutable handle over a write buffer and a hierarchy of levels.
//!
//! All table state sits behind one mutex; every public operation locks,
//! performs its step, and unlocks. Shared across threads as `Arc<Table>`,
//! operations on a single table are linearizable.
//!
//! ## Level hierarchy and scheduled merges
//!
//! Level 0 receives write-buffer flushes; every level holds at most
//! `max_runs_per_level` resident runs. When a level fills, its runs become
//! the inputs of an incremental merge whose output lands on the next level.
//! At most one merge runs per level; its inputs stay visible to lookups
//! until it completes.
//!
//! Merges are paid for by *credit*: every update contributes one credit, and
//! each in-flight merge advances by its precomputed share —
//! `ceil(debt / slack)` steps, where debt is the merge's total input entry
//! count and slack the number of updates until the level fills again. A
//! merge therefore retires before its level next overflows; if one ever has
//! not, it is drained to completion before a new merge starts there.
//!
//! ## Duplication
//!
//! [`Table::duplicate`] is O(1) in data: the new table shares every resident
//! run by reference and clones the write buffer. In-flight merges are not
//! carried over — the duplicate sees their inputs as plain resident runs and
//! schedules its own merges from scratch.

use std::sync::{Arc, Mutex, MutexGuard};

use run::{Merge, MergeKind, MergeStatus, PageCache, Run};
use writebuffer::{Blob, Entry, Key, WriteBuffer};

use crate::config::{CachePolicy, Config};
use crate::error::{Error, Result};
use crate::session::{Session, Snapshot, SnapshotName};
use crate::{MAX_KEY_SIZE, MAX_VALUE_SIZE};

/// One level of the tree.
#[derive(Default)]
pub(crate) struct Level {
    /// Resident runs not under merge, newest first.
    pub(crate) runs: Vec<Arc<Run>>,
    /// The at-most-one merge in flight at this level.
    pub(crate) merging: Option<ActiveMerge>,
}

pub(crate) struct ActiveMerge {
    merge: Merge,
    /// The merge's inputs, still visible to lookups (newest first).
    pub(crate) inputs: Vec<Arc<Run>>,
    /// Steps this merge receives per update credit.
    credit_per_update: usize,
}

pub(crate) struct TableInner {
    pub(crate) closed: bool,
    pub(crate) config: Config,
    pub(crate) wb: WriteBuffer,
    /// Level 0 first.
    pub(crate) levels: Vec<Level>,
    pub(crate) cache: Option<Arc<PageCache>>,
}

impl TableInner {
    /// All runs visible to a lookup, newest first: per level, arrivals
    /// before merge inputs, shallow levels before deep ones.
    pub(crate) fn collect_runs(&self) -> Vec<Arc<Run>> {
        let mut runs = Vec::new();
        for level in &self.levels {
            runs.extend(level.runs.iter().cloned());
            if let Some(am) = &level.merging {
                runs.extend(am.inputs.iter().cloned());
            }
        }
        runs
    }
}

/// An ordered key/value table. Cheap to duplicate, cheap to snapshot.
pub struct Table {
    session: Arc<Session>,
    inner: Arc<Mutex<TableInner>>,
}

impl Table {
    pub(crate) fn create(session: Arc<Session>, config: Config) -> Table {
        let cache = new_cache(&config);
        Table {
            session,
            inner: Arc::new(Mutex::new(TableInner {
                closed: false,
                config,
                wb: WriteBuffer::new(),
                levels: Vec::new(),
                cache,
            })),
        }
    }

    pub(crate) fn from_snapshot(session: Arc<Session>, snapshot: &Snapshot) -> Table {
        let config = snapshot.config;
        let cache = new_cache(&config);
        let levels = snapshot
            .levels
            .iter()
            .map(|runs| Level {
                runs: runs.clone(),
                merging: None,
            })
            .collect();
        Table {
            session,
            inner: Arc::new(Mutex::new(TableInner {
                closed: false,
                config,
                wb: snapshot.write_buffer.clone(),
                levels,
                cache,
            })),
        }
    }

    /// The session this table belongs to.
    #[must_use]
    pub fn session(&self) -> &Arc<Session> {
        &self.session
    }

    fn lock_inner(&self) -> MutexGuard<'_, TableInner> {
        self.inner
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    /// Locks the table state, failing if the table or its session is closed.
    pub(crate) fn guard(&self) -> Result<MutexGuard<'_, TableInner>> {
        self.session.ensure_open()?;
        let inner = self.lock_inner();
        if inner.closed {
            return Err(Error::HandleClosed);
        }
        Ok(inner)
    }

    // ---- Updates ----

    /// Sets `key` to `value`.
    pub fn insert(&self, key: &[u8], value: &[u8]) -> Result<()> {
        self.update(key.to_vec(), Entry::Insert(value.to_vec()))
    }

    /// Sets `key` to `value` with an attached out-of-line blob.
    pub fn insert_with_blob(&self, key: &[u8], value: &[u8], blob: &[u8]) -> Result<()> {
        if blob.len() > MAX_VALUE_SIZE {
            return Err(Error::ValueTooLarge(blob.len()));
        }
        self.update(
            key.to_vec(),
            Entry::InsertWithBlob(value.to_vec(), blob.to_vec()),
        )
    }

    /// Monoidal upsert: combines `value` with the key's current resolution
    /// via the configured `⊕`.
    pub fn mupsert(&self, key: &[u8], value: &[u8]) -> Result<()> {
        self.update(key.to_vec(), Entry::Mupdate(value.to_vec()))
    }

    /// Removes `key`.
    pub fn delete(&self, key: &[u8]) -> Result<()> {
        self.update(key.to_vec(), Entry::Delete)
    }

    fn update(&self, key: Key, entry: Entry<Blob>) -> Result<()> {
        if key.len() > MAX_KEY_SIZE {
            return Err(Error::KeyTooLarge(key.len()));
        }
        if let Some(value) = entry.value() {
            if value.len() > MAX_VALUE_SIZE {
                return Err(Error::ValueTooLarge(value.len()));
            }
        }

        let mut inner = self.guard()?;
        let resolve = inner.config.resolve;
        inner.wb.insert(key, entry, resolve);

        // One unit of credit per update keeps in-flight merges ahead of the
        // levels that feed them.
        Self::supply_credit(&mut inner, &self.session)?;

        if inner.wb.num_entries() >= inner.config.write_buffer_capacity {
            Self::flush_inner(&mut inner, &self.session)?;
        }
        Ok(())
    }

    /// Forces the write buffer out to a level-0 run. No-op when empty.
    pub fn flush(&self) -> Result<()> {
        let mut inner = self.guard()?;
        Self::flush_inner(&mut inner, &self.session)
    }

    // ---- Duplication, snapshots, close ----

    /// An independent copy sharing all resident runs by reference. Future
    /// updates on either table leave the other untouched.
    pub fn duplicate(&self) -> Result<Table> {
        let inner = self.guard()?;
        let levels = inner
            .levels
            .iter()
            .map(|level| {
                let mut runs = level.runs.clone();
                if let Some(am) = &level.merging {
                    runs.extend(am.inputs.iter().cloned());
                }
                Level {
                    runs,
                    merging: None,
                }
            })
            .collect();

        Ok(Table {
            session: Arc::clone(&self.session),
            inner: Arc::new(Mutex::new(TableInner {
                closed: false,
                config: inner.config,
                wb: inner.wb.clone(),
                levels,
                cache: inner.cache.clone(),
            })),
        })
    }

    /// Freezes the table's current contents in the session registry under
    /// `name`. `label` travels with the snapshot and must be repeated to
    /// open it.
    pub fn create_snapshot(&self, name: &SnapshotName, label: &str) -> Result<()> {
        let inner = self.guard()?;
        let levels = inner
            .levels
            .iter()
            .map(|level| {
                let mut runs = level.runs.clone();
                if let Some(am) = &level.merging {
                    runs.extend(am.inputs.iter().cloned());
                }
                runs
            })
            .collect();

        self.session.store_snapshot(
            name.clone(),
            Snapshot {
                label: label.to_string(),
                config: inner.config,
                levels,
                write_buffer: inner.wb.clone(),
            },
        );
        Ok(())
    }

    /// Closes the table: cancels in-flight merges, releases every run
    /// reference, and fails all further operations with `HandleClosed`.
    pub fn close(&self) {
        let mut inner = self.lock_inner();
        if inner.closed {
            return;
        }
        inner.closed = true;
        for level in inner.levels.drain(..) {
            if let Some(am) = level.merging {
                am.merge.close();
            }
        }
        inner.wb = WriteBuffer::new();
        log::debug!("closed table");
    }

    // ---- Introspection ----

    #[must_use]
    pub fn num_levels(&self) -> usize {
        self.lock_inner().levels.len()
    }

    /// Resident runs at `level`, merge inputs included.
    #[must_use]
    pub fn runs_at_level(&self, level: usize) -> usize {
        let inner = self.lock_inner();
        inner.levels.get(level).map_or(0, |lv| {
            lv.runs.len() + lv.merging.as_ref().map_or(0, |am| am.inputs.len())
        })
    }

    #[must_use]
    pub fn merge_active_at_level(&self, level: usize) -> bool {
        let inner = self.lock_inner();
        inner
            .levels
            .get(level)
            .is_some_and(|lv| lv.merging.is_some())
    }

    #[must_use]
    pub fn write_buffer_entries(&self) -> usize {
        self.lock_inner().wb.num_entries()
    }

    // ---- Internals ----

    fn flush_inner(inner: &mut TableInner, session: &Session) -> Result<()> {
        if inner.wb.is_empty() {
            return Ok(());
        }
        let wb = std::mem::take(&mut inner.wb);
        let paths = session.allocate_run_paths();
        let run = Arc::new(Run::from_write_buffer(
            paths,
            wb,
            inner.config.run_params(),
        )?);
        Self::install_run(inner, session, 0, run)
    }

    /// Distributes one credit: every in-flight merge advances by its
    /// precomputed share, completed merges move their output down a level.
    fn supply_credit(inner: &mut TableInner, session: &Session) -> Result<()> {
        let mut level_ix = 0;
        while level_ix < inner.levels.len() {
            let completed = match inner.levels[level_ix].merging.as_mut() {
                Some(am) => match am.merge.steps(am.credit_per_update)? {
                    (_, MergeStatus::Complete(run)) => Some(run),
                    (_, MergeStatus::InProgress) => None,
                },
                None => None,
            };
            if let Some(run) = completed {
                // Dropping the merge state releases the input references.
                inner.levels[level_ix].merging = None;
                log::debug!("level {level_ix}: merge complete, output to level {}", level_ix + 1);
                Self::install_run(inner, session, level_ix + 1, run)?;
            }
            level_ix += 1;
        }
        Ok(())
    }

    /// Places a run at the front of `level`, growing the hierarchy if
    /// needed, and reacts to the level overflowing.
    fn install_run(
        inner: &mut TableInner,
        session: &Session,
        level_ix: usize,
        run: Arc<Run>,
    ) -> Result<()> {
        while inner.levels.len() <= level_ix {
            inner.levels.push(Level::default());
        }
        inner.levels[level_ix].runs.insert(0, run);
        Self::check_overflow(inner, session, level_ix)
    }

    fn check_overflow(inner: &mut TableInner, session: &Session, level_ix: usize) -> Result<()> {
        if inner.levels[level_ix].runs.len() < inner.config.max_runs_per_level {
            return Ok(());
        }

        // Credit mathematics retires a merge before its level next fills; if
        // one is somehow still running here, drain it first.
        if let Some(run) = Self::drain_merge(inner, level_ix)? {
            Self::install_run(inner, session, level_ix + 1, run)?;
        }

        let inputs = std::mem::take(&mut inner.levels[level_ix].runs);
        let target = level_ix + 1;
        let kind = if Self::is_last_level_target(inner, target) {
            MergeKind::LastLevel
        } else {
            MergeKind::MidLevel
        };

        if inputs.len() == 1 {
            // A level bound of one run: nothing to merge, move it down.
            let run = inputs.into_iter().next().expect("one input");
            return Self::install_run(inner, session, target, run);
        }

        let debt: u64 = inputs.iter().map(|r| r.num_entries()).sum();
        let slack = inner
            .config
            .write_buffer_capacity
            .saturating_mul(
                inner
                    .config
                    .max_runs_per_level
                    .saturating_pow(level_ix as u32 + 1),
            )
            .max(1);
        let credit_per_update = (debt as usize).div_ceil(slack).max(1);

        log::debug!(
            "level {level_ix}: starting {kind:?} merge over {} runs (debt {debt}, {credit_per_update} steps/update)",
            inputs.len(),
        );

        let paths = session.allocate_run_paths();
        match Merge::new(
            paths,
            inputs.clone(),
            kind,
            inner.config.resolve,
            inner.config.run_params(),
        )? {
            Some(merge) => {
                inner.levels[level_ix].merging = Some(ActiveMerge {
                    merge,
                    inputs,
                    credit_per_update,
                });
            }
            None => {
                // Unreachable with two or more inputs; restore them.
                inner.levels[level_ix].runs = inputs;
            }
        }
        Ok(())
    }

    /// Runs an in-flight merge at `level` to completion, returning its
    /// output.
    fn drain_merge(inner: &mut TableInner, level_ix: usize) -> Result<Option<Arc<Run>>> {
        let Some(mut am) = inner.levels[level_ix].merging.take() else {
            return Ok(None);
        };
        loop {
            if let (_, MergeStatus::Complete(run)) = am.merge.steps(usize::MAX)? {
                return Ok(Some(run));
            }
        }
    }

    /// A merge targets the last level when the target and everything below
    /// it hold no data: only then is there nothing for a tombstone to
    /// shadow.
    fn is_last_level_target(inner: &TableInner, target: usize) -> bool {
        inner
            .levels
            .iter()
            .skip(target)
            .all(|level| level.runs.is_empty() && level.merging.is_none())
    }
}

impl std::fmt::Debug for Table {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let inner = self.lock_inner();
        f.debug_struct("Table")
            .field("closed", &inner.closed)
            .field("write_buffer_entries", &inner.wb.num_entries())
            .field(
                "levels",
                &inner
                    .levels
                    .iter()
                    .map(|lv| {
                        (
                            lv.runs.len(),
                            lv.merging.as_ref().map_or(0, |am| am.inputs.len()),
                        )
                    })
                    .collect::<Vec<_>>(),
            )
            .finish()
    }
}

fn new_cache(config: &Config) -> Option<Arc<PageCache>> {
    match config.cache_policy {
        CachePolicy::CacheRunData => Some(Arc::new(PageCache::with_capacity_pages(
            config.cache_capacity_pages,
        ))),
        CachePolicy::NoCacheRunData => None,
    }
}
