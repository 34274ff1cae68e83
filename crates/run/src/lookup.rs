//! The batched lookup pipeline: bloom probes, index searches, grouped page
//! I/O, then cross-run resolution.
//!
//! Given a batch of keys and a set of runs (newest first), the pipeline
//! first probes every `(run, key)` pair against the run's bloom filter, then
//! consults the compact index for the survivors, and finally fetches the
//! candidate pages — grouped per run, with adjacent pages coalesced into a
//! single read of at most `batch_size` pages. Results come back in input-key
//! order.
//!
//! When a key appears in several runs the newest wins; while the newest
//! surviving entry is a mupsert, the externally supplied `⊕` folds it into
//! the next-older run's entry until an insert, a delete, or absence
//! terminates the chain.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use writebuffer::{BlobSpan, Entry, Key, Resolve, Value};

use crate::cache::PageCache;
use crate::error::Result;
use crate::format::PAGE_SIZE;
use crate::page::{page_extent, Page};
use crate::run::Run;

/// The per-key outcome of a batched lookup.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LookupResult {
    NotFound(Key),
    Found(Key, Value),
    /// The key resolves to a value with an out-of-line blob; the span points
    /// into the blob file of the run that supplied the entry.
    FoundWithBlob(Key, Value, BlobSpan),
}

impl LookupResult {
    /// The resolved value, if the key was found.
    #[must_use]
    pub fn value(&self) -> Option<&[u8]> {
        match self {
            LookupResult::NotFound(_) => None,
            LookupResult::Found(_, v) | LookupResult::FoundWithBlob(_, v, _) => Some(v),
        }
    }
}

/// Runs the three-stage pipeline for `keys` over `runs` (newest first).
///
/// `batch_size` caps the pages of a single coalesced read; `cache` (when
/// present) is consulted before disk and filled after it.
pub fn lookup_batch(
    runs: &[Arc<Run>],
    keys: &[Key],
    resolve: Resolve,
    batch_size: usize,
    cache: Option<&PageCache>,
) -> Result<Vec<LookupResult>> {
    // Stage 1: bloom probes. Sparse survivor set of (run, key) pairs.
    let mut survivors: Vec<(usize, usize)> = Vec::new();
    for (run_ix, run) in runs.iter().enumerate() {
        for (key_ix, key) in keys.iter().enumerate() {
            if run.may_contain(key) {
                survivors.push((run_ix, key_ix));
            }
        }
    }

    // Stage 2: compact-index searches narrow survivors to page ranges.
    // Grouped by run: page number → interested keys.
    let mut wanted: HashMap<usize, BTreeMap<u32, Vec<usize>>> = HashMap::new();
    for (run_ix, key_ix) in survivors {
        let run = &runs[run_ix];
        let Some(range) = run.search_index(&keys[key_ix]) else {
            continue;
        };
        let per_run = wanted.entry(run_ix).or_default();
        for page_no in range.lo..=range.hi {
            // Continuation pages hold raw value bytes; the entry is found
            // through its first page.
            if run.is_continuation(page_no) {
                continue;
            }
            per_run.entry(page_no).or_default().push(key_ix);
        }
    }

    // Stage 3: grouped page I/O, then in-page binary search.
    let mut hits: HashMap<(usize, usize), Entry<BlobSpan>> = HashMap::new();
    for (run_ix, pages) in &wanted {
        let run = &runs[*run_ix];
        let page_numbers: Vec<u32> = pages.keys().copied().collect();
        let fetched = fetch_pages(run, &page_numbers, batch_size, cache)?;

        for (page_no, key_ixs) in pages {
            let bytes = &fetched[page_no];
            let page = Page::new(bytes.as_ref())?;
            for &key_ix in key_ixs {
                if let Some(i) = page.search(&keys[key_ix]) {
                    hits.insert((*run_ix, key_ix), page.entry(i)?);
                }
            }
        }
    }

    // Resolution: newest run wins; `⊕` accumulates across runs while the
    // newest surviving entry is a mupsert.
    let mut out = Vec::with_capacity(keys.len());
    for (key_ix, key) in keys.iter().enumerate() {
        let mut acc: Option<Entry<BlobSpan>> = None;
        for run_ix in 0..runs.len() {
            let Some(entry) = hits.get(&(run_ix, key_ix)) else {
                continue;
            };
            acc = Some(match acc {
                None => entry.clone(),
                Some(newer) => newer.combine(entry.clone(), resolve),
            });
            if !matches!(acc, Some(Entry::Mupdate(_))) {
                break;
            }
        }

        out.push(match acc {
            None | Some(Entry::Delete) => LookupResult::NotFound(key.clone()),
            // A mupsert with nothing older resolves to its own value.
            Some(Entry::Insert(v)) | Some(Entry::Mupdate(v)) => {
                LookupResult::Found(key.clone(), v)
            }
            Some(Entry::InsertWithBlob(v, span)) => {
                LookupResult::FoundWithBlob(key.clone(), v, span)
            }
        });
    }
    Ok(out)
}

/// Fetches `pages` (sorted, deduplicated) of one run. Cached pages are taken
/// from the cache; the rest are read with adjacent pages coalesced into
/// single reads of at most `batch_size` pages.
fn fetch_pages(
    run: &Arc<Run>,
    pages: &[u32],
    batch_size: usize,
    cache: Option<&PageCache>,
) -> Result<HashMap<u32, Arc<[u8]>>> {
    let batch_size = batch_size.max(1);
    let mut out = HashMap::with_capacity(pages.len());

    let mut missing: Vec<u32> = Vec::new();
    for &page_no in pages {
        match cache.and_then(|c| c.get(run.run_id(), page_no)) {
            Some(bytes) => {
                out.insert(page_no, bytes);
            }
            None => missing.push(page_no),
        }
    }

    let mut i = 0;
    while i < missing.len() {
        let start = missing[i];
        let mut count = 1usize;
        while i + count < missing.len()
            && missing[i + count] == start + count as u32
            && count < batch_size
        {
            count += 1;
        }

        let span = run.read_span(start, count as u32)?;
        for j in 0..count {
            let page_no = start + j as u32;
            let slice = &span[j * PAGE_SIZE..(j + 1) * PAGE_SIZE];
            let cluster: Arc<[u8]> = if page_extent(slice)? > PAGE_SIZE {
                // A multi-page entry: its continuation pages were not part
                // of the span, so fetch the full extent in one piece.
                Arc::from(run.read_page_cluster(page_no)?)
            } else {
                Arc::from(slice.to_vec())
            };
            if let Some(c) = cache {
                c.insert(run.run_id(), page_no, Arc::clone(&cluster));
            }
            out.insert(page_no, cluster);
        }
        i += count;
    }

    Ok(out)
}
