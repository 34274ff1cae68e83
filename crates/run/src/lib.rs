//! # Run — immutable on-disk storage for UndertowKV
//!
//! A *run* is the write-once unit the engine flushes write buffers into and
//! compacts with merges. Each run is four files sharing a numeric id:
//!
//! ```text
//! ┌────────────────────────────────────────────────────────────┐
//! │ <id>.keyops   4 KiB pages of sorted (key, operation) pairs │
//! │               (layout in `page`; a single oversized entry  │
//! │               may span several page slots)                 │
//! ├────────────────────────────────────────────────────────────┤
//! │ <id>.blobs    raw out-of-line payloads, addressed by       │
//! │               BlobSpan (offset, len)                       │
//! ├────────────────────────────────────────────────────────────┤
//! │ <id>.filter   bloom filter over the run's keys             │
//! ├────────────────────────────────────────────────────────────┤
//! │ <id>.index    compact index: bucket array over the top key │
//! │               bits + per-page key prefixes (CRC-guarded)   │
//! └────────────────────────────────────────────────────────────┘
//! ```
//!
//! Point lookups flow through a three-stage pipeline ([`lookup_batch`]):
//! bloom probe → compact-index search → batched page fetch. Compaction is an
//! incremental k-way [`Merge`] that the engine advances a bounded number of
//! entries at a time. Runs are reference-counted (`Arc`); the last reference
//! unlinks the files.

mod cache;
mod error;
mod format;
mod index;
mod lookup;
mod merge;
mod page;
#[allow(clippy::module_inception)]
mod run;

pub use cache::PageCache;
pub use error::{Result, RunError};
pub use format::{RunPaths, PAGE_SIZE};
pub use index::{key_prefix32, key_top_bits, CompactIndex, CompactIndexBuilder, PageRange};
pub use lookup::{lookup_batch, LookupResult};
pub use merge::{Merge, MergeKind, MergeStatus};
pub use page::{page_extent, Page, PageAcc};
pub use run::{BloomFilterAlloc, Run, RunBuilder, RunCursor, RunParams};

#[cfg(test)]
mod tests;
