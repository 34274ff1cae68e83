//! Incremental k-way merge of runs.
//!
//! A [`Merge`] owns cursors into its input runs and a partially built output
//! run. It advances in bounded [`steps`](Merge::steps): each call consumes up
//! to `n` input entries (a little more when equal keys straddle the budget),
//! resolving same-key entries monoidally in input order — the earlier an
//! input run is listed, the newer it is. Once every input is exhausted the
//! final page is flushed and the finished run is returned; the step counts
//! over a merge's lifetime sum to exactly the total input entry count.
//!
//! A merge that targets the last level of the tree drops `Delete` entries
//! from its output: there is nothing below for a tombstone to shadow.
//! Mupserts are kept as-is.
//!
//! Dropping or [`close`](Merge::close)-ing an unfinished merge removes the
//! partial output files and releases the input runs.

use std::cmp::Ordering;
use std::collections::BinaryHeap;
use std::sync::Arc;

use writebuffer::{Blob, BlobSpan, Entry, Key, Resolve};

use crate::error::Result;
use crate::format::RunPaths;
use crate::run::{Run, RunBuilder, RunCursor, RunParams};

/// Whether the merge output lands on the last level of the tree.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MergeKind {
    /// Deeper levels exist (or the target level is occupied): tombstones must
    /// be kept.
    MidLevel,
    /// The output is the deepest data in the tree: tombstones are elided.
    LastLevel,
}

/// Progress report from [`Merge::steps`].
#[derive(Debug, Clone)]
pub enum MergeStatus {
    InProgress,
    Complete(Arc<Run>),
}

/// One pending key from one input, ordered for min-first heap traversal.
struct HeapItem {
    key: Key,
    entry: Entry<BlobSpan>,
    /// Index into the input list; lower index = newer run.
    source: usize,
}

impl PartialEq for HeapItem {
    fn eq(&self, other: &Self) -> bool {
        self.key == other.key && self.source == other.source
    }
}

impl Eq for HeapItem {}

impl PartialOrd for HeapItem {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for HeapItem {
    fn cmp(&self, other: &Self) -> Ordering {
        // BinaryHeap is a max-heap; reverse so the smallest key pops first.
        // On equal keys the lowest source index (newest run) pops first.
        other
            .key
            .cmp(&self.key)
            .then_with(|| other.source.cmp(&self.source))
    }
}

/// An in-progress merge of several runs into one.
pub struct Merge {
    inputs: Vec<Arc<Run>>,
    cursors: Vec<RunCursor>,
    heap: BinaryHeap<HeapItem>,
    builder: Option<RunBuilder>,
    kind: MergeKind,
    resolve: Resolve,
    output: Option<Arc<Run>>,
}

impl Merge {
    /// Prepares a merge of `inputs` (newest first) into a run at `paths`.
    ///
    /// Returns `None` when there is nothing to merge — zero or one input.
    /// The output bloom filter is sized for the sum of the input entry
    /// counts.
    pub fn new(
        paths: RunPaths,
        inputs: Vec<Arc<Run>>,
        kind: MergeKind,
        resolve: Resolve,
        params: RunParams,
    ) -> Result<Option<Merge>> {
        if inputs.len() <= 1 {
            return Ok(None);
        }

        let expected: usize = inputs.iter().map(|r| r.num_entries() as usize).sum();
        log::debug!(
            "merging {} runs ({} entries) into run {} ({:?})",
            inputs.len(),
            expected,
            paths.run_id(),
            kind,
        );

        let builder = RunBuilder::new(paths, expected, params)?;
        let mut cursors = inputs
            .iter()
            .map(Run::cursor)
            .collect::<Result<Vec<_>>>()?;

        let mut heap = BinaryHeap::new();
        for (source, cursor) in cursors.iter_mut().enumerate() {
            if let Some((key, entry)) = cursor.next()? {
                heap.push(HeapItem { key, entry, source });
            }
        }

        Ok(Some(Merge {
            inputs,
            cursors,
            heap,
            builder: Some(builder),
            kind,
            resolve,
            output: None,
        }))
    }

    /// Total entries across the inputs — the merge's step debt.
    #[must_use]
    pub fn total_debt(&self) -> u64 {
        self.inputs.iter().map(|r| r.num_entries()).sum()
    }

    #[must_use]
    pub fn is_complete(&self) -> bool {
        self.output.is_some()
    }

    /// Advances the merge by up to `n` input entries.
    ///
    /// Returns how many entries were actually consumed this call (equal-key
    /// groups are never split, so this can slightly exceed `n`) and the
    /// merge status. Once `Complete` is returned the merge holds the
    /// finished run; further calls consume nothing and report `Complete`
    /// again.
    pub fn steps(&mut self, n: usize) -> Result<(usize, MergeStatus)> {
        if let Some(run) = &self.output {
            return Ok((0, MergeStatus::Complete(Arc::clone(run))));
        }

        let mut done = 0;
        while done < n {
            let Some(item) = self.heap.pop() else {
                break;
            };
            done += 1;
            self.refill(item.source)?;

            let key = item.key;
            let mut acc = item.entry;
            // The popped entry came from the newest run containing this key;
            // its blob span (if any) survives every resolution rule below.
            let acc_source = item.source;

            while let Some(top) = self.heap.peek() {
                if top.key != key {
                    break;
                }
                let dup = self.heap.pop().expect("peeked above");
                done += 1;
                self.refill(dup.source)?;
                acc = acc.combine(dup.entry, self.resolve);
            }

            if self.kind == MergeKind::LastLevel && acc.is_delete() {
                continue;
            }

            let entry: Entry<Blob> = match acc {
                Entry::InsertWithBlob(value, span) => {
                    Entry::InsertWithBlob(value, self.inputs[acc_source].read_blob(span)?)
                }
                Entry::Insert(value) => Entry::Insert(value),
                Entry::Mupdate(value) => Entry::Mupdate(value),
                Entry::Delete => Entry::Delete,
            };
            self.builder
                .as_mut()
                .expect("builder present until completion")
                .add(&key, entry)?;
        }

        if self.heap.is_empty() {
            let builder = self
                .builder
                .take()
                .expect("builder present until completion");
            let run = Arc::new(builder.finish()?);
            log::debug!(
                "merge complete: run {} ({} entries)",
                run.run_id(),
                run.num_entries(),
            );
            // Release the input runs and their cursors.
            self.cursors.clear();
            self.inputs.clear();
            self.output = Some(Arc::clone(&run));
            return Ok((done, MergeStatus::Complete(run)));
        }

        Ok((done, MergeStatus::InProgress))
    }

    fn refill(&mut self, source: usize) -> Result<()> {
        if let Some((key, entry)) = self.cursors[source].next()? {
            self.heap.push(HeapItem { key, entry, source });
        }
        Ok(())
    }

    /// Cancels the merge: the partial output files are removed and the input
    /// references released. Dropping the merge has the same effect.
    pub fn close(mut self) {
        if let Some(builder) = self.builder.take() {
            builder.abort();
        }
    }
}
