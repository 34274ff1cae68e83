//! The immutable on-disk run: builder, reader, and pull cursor.
//!
//! A run is four files sharing a numeric id — pages, blobs, filter, index
//! (see [`RunPaths`]) — written once and never modified. Construction streams
//! ordered entries through the page accumulator while the bloom filter and
//! compact index are built alongside; data lands in `.tmp` siblings that are
//! fsynced and renamed into place on [`RunBuilder::finish`]. A builder
//! dropped before finishing removes everything it wrote, which is what makes
//! merge cancellation clean.
//!
//! Runs are shared as `Arc<Run>` between tables, snapshots and in-progress
//! merges; dropping the last reference unlinks the four files.

use bloom::BloomFilter;
use std::fs::{self, File, OpenOptions};
use std::io::{BufWriter, Read, Seek, SeekFrom, Write};
use std::sync::{Arc, Mutex, MutexGuard};

use writebuffer::{Blob, BlobSpan, Entry, Key, WriteBuffer};

use crate::error::{Result, RunError};
use crate::format::{temp_path, RunPaths, PAGE_SIZE};
use crate::index::{CompactIndex, CompactIndexBuilder, PageRange};
use crate::page::{page_extent, Page, PageAcc};

/// How a run's bloom filter is sized at construction time.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum BloomFilterAlloc {
    /// Spend a fixed number of bits per expected entry.
    FixedBitsPerEntry(u32),
    /// Size for a target false positive rate.
    FalsePositiveRate(f64),
}

impl BloomFilterAlloc {
    fn new_filter(&self, expected_entries: usize) -> BloomFilter {
        match *self {
            BloomFilterAlloc::FixedBitsPerEntry(bits) => {
                BloomFilter::with_bits_per_entry(expected_entries, bits)
            }
            BloomFilterAlloc::FalsePositiveRate(fpr) => {
                BloomFilter::with_false_positive_rate(expected_entries.max(1), fpr)
            }
        }
    }
}

/// Construction-time knobs shared by flushes and merges.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RunParams {
    pub bloom: BloomFilterAlloc,
    /// Pages buffered per compact-index chunk.
    pub index_chunk_size: usize,
    /// Leading key bits used for page partitioning and index buckets (0–16).
    pub precision: u8,
}

impl Default for RunParams {
    fn default() -> Self {
        Self {
            bloom: BloomFilterAlloc::FixedBitsPerEntry(10),
            index_chunk_size: 100,
            precision: 10,
        }
    }
}

/// Streams ordered `(key, entry)` pairs into a new run.
pub struct RunBuilder {
    paths: RunPaths,
    acc: PageAcc,
    keyops: BufWriter<File>,
    blobs: BufWriter<File>,
    filter: BloomFilter,
    index: CompactIndexBuilder,
    num_entries: u64,
    num_pages: u32,
    blob_offset: u64,
    finished: bool,
}

impl RunBuilder {
    /// Opens the temp files and sizes the bloom filter for
    /// `expected_entries`. For merges this is the sum of the input entry
    /// counts — an upper bound, never an undercount.
    pub fn new(paths: RunPaths, expected_entries: usize, params: RunParams) -> Result<Self> {
        let keyops = BufWriter::new(create_temp(&paths.keyops())?);
        let blobs = BufWriter::new(create_temp(&paths.blobs())?);

        Ok(Self {
            acc: PageAcc::new(params.precision),
            keyops,
            blobs,
            filter: params.bloom.new_filter(expected_entries),
            index: CompactIndexBuilder::new(params.precision, params.index_chunk_size),
            paths,
            num_entries: 0,
            num_pages: 0,
            blob_offset: 0,
            finished: false,
        })
    }

    /// Appends one entry. Keys must arrive in strictly increasing order;
    /// blob bytes are appended to the blob file and replaced by their span.
    pub fn add(&mut self, key: &[u8], entry: Entry<Blob>) -> Result<()> {
        self.filter.insert(key);

        let entry = match entry {
            Entry::InsertWithBlob(value, blob) => {
                let span = BlobSpan {
                    offset: self.blob_offset,
                    len: blob.len() as u32,
                };
                self.blobs.write_all(&blob)?;
                self.blob_offset += blob.len() as u64;
                Entry::InsertWithBlob(value, span)
            }
            Entry::Insert(value) => Entry::Insert(value),
            Entry::Mupdate(value) => Entry::Mupdate(value),
            Entry::Delete => Entry::Delete,
        };

        if !self.acc.try_add(key, &entry) {
            self.emit_page()?;
            let accepted = self.acc.try_add(key, &entry);
            debug_assert!(accepted, "an empty page accepts any entry");
        }
        self.num_entries += 1;
        Ok(())
    }

    fn emit_page(&mut self) -> Result<()> {
        let bytes = self.acc.build();
        let pages = (bytes.len() / PAGE_SIZE) as u32;
        let first_key = self.acc.first_key().unwrap_or_default().to_vec();
        self.index.append(&first_key, pages - 1);
        self.keyops.write_all(&bytes)?;
        self.num_pages += pages;
        self.acc.clear();
        Ok(())
    }

    /// Flushes the last page, writes the filter and index sidecars, fsyncs
    /// and renames all four files into place, and opens the finished run.
    pub fn finish(mut self) -> Result<Run> {
        if !self.acc.is_empty() {
            self.emit_page()?;
        }

        self.keyops.flush()?;
        self.keyops.get_ref().sync_all()?;
        self.blobs.flush()?;
        self.blobs.get_ref().sync_all()?;
        fs::rename(temp_path(&self.paths.keyops()), self.paths.keyops())?;
        fs::rename(temp_path(&self.paths.blobs()), self.paths.blobs())?;

        let filter = std::mem::replace(&mut self.filter, BloomFilter::with_parameters(8, 1));
        let index_builder = std::mem::replace(&mut self.index, CompactIndexBuilder::new(0, 1));
        let index = index_builder.finish(self.num_entries);

        write_sidecar(&self.paths.filter(), |w| filter.write_to(w))?;
        write_sidecar(&self.paths.index(), |w| index.write_to(w))?;

        self.finished = true;

        log::debug!(
            "finished run {}: {} entries, {} pages, {} blob bytes",
            self.paths.run_id(),
            self.num_entries,
            self.num_pages,
            self.blob_offset,
        );

        let keyops = File::open(self.paths.keyops())?;
        let blobs = File::open(self.paths.blobs())?;
        Ok(Run {
            paths: self.paths.clone(),
            filter,
            index,
            keyops: Mutex::new(keyops),
            blobs: Mutex::new(blobs),
            num_entries: self.num_entries,
        })
    }

    /// Abandons the build, removing everything written so far.
    pub fn abort(self) {
        // Drop handles the cleanup.
    }
}

impl Drop for RunBuilder {
    fn drop(&mut self) {
        if self.finished {
            return;
        }
        for path in self.paths.all() {
            let _ = fs::remove_file(temp_path(&path));
            let _ = fs::remove_file(&path);
        }
    }
}

fn create_temp(path: &std::path::Path) -> Result<File> {
    Ok(OpenOptions::new()
        .create(true)
        .write(true)
        .truncate(true)
        .open(temp_path(path))?)
}

/// Writes a sidecar file through its temp sibling, fsyncs, renames.
fn write_sidecar<E>(
    path: &std::path::Path,
    write: impl FnOnce(&mut BufWriter<File>) -> std::result::Result<(), E>,
) -> Result<()>
where
    RunError: From<E>,
{
    let tmp = temp_path(path);
    let mut w = BufWriter::new(
        OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(&tmp)?,
    );
    write(&mut w)?;
    w.flush()?;
    w.get_ref().sync_all()?;
    fs::rename(tmp, path)?;
    Ok(())
}

/// An immutable, reference-counted on-disk run.
///
/// Carries its bloom filter and compact index in memory plus open handles to
/// the key/ops and blob files. Dropping the last `Arc<Run>` unlinks all four
/// files.
pub struct Run {
    paths: RunPaths,
    filter: BloomFilter,
    index: CompactIndex,
    keyops: Mutex<File>,
    blobs: Mutex<File>,
    num_entries: u64,
}

impl Run {
    /// Streams a write buffer into a new run at `paths`.
    pub fn from_write_buffer(paths: RunPaths, wb: WriteBuffer, params: RunParams) -> Result<Run> {
        log::debug!(
            "flushing write buffer ({} entries) to run {}",
            wb.num_entries(),
            paths.run_id(),
        );
        let mut builder = RunBuilder::new(paths, wb.num_entries(), params)?;
        for (key, entry) in wb.into_map() {
            builder.add(&key, entry)?;
        }
        builder.finish()
    }

    /// Opens an existing run from its four files, restoring the filter,
    /// index and entry count from the sidecars.
    pub fn open(paths: RunPaths) -> Result<Run> {
        let mut filter_file = File::open(paths.filter())?;
        let filter = BloomFilter::read_from(&mut filter_file)?;

        let mut index_file = File::open(paths.index())?;
        let index = CompactIndex::read_from(&mut index_file)?;

        let keyops = File::open(paths.keyops())?;
        let expected = u64::from(index.num_pages()) * PAGE_SIZE as u64;
        if keyops.metadata()?.len() != expected {
            return Err(RunError::Corrupt("key/ops file size mismatch"));
        }
        let blobs = File::open(paths.blobs())?;

        Ok(Run {
            num_entries: index.num_entries(),
            paths,
            filter,
            index,
            keyops: Mutex::new(keyops),
            blobs: Mutex::new(blobs),
        })
    }

    #[must_use]
    pub fn run_id(&self) -> u64 {
        self.paths.run_id()
    }

    #[must_use]
    pub fn paths(&self) -> &RunPaths {
        &self.paths
    }

    #[must_use]
    pub fn num_entries(&self) -> u64 {
        self.num_entries
    }

    #[must_use]
    pub fn num_pages(&self) -> u32 {
        self.index.num_pages()
    }

    /// Bloom probe: `false` means the key is definitely absent.
    #[must_use]
    pub fn may_contain(&self, key: &[u8]) -> bool {
        self.filter.may_contain(key)
    }

    /// Compact-index probe: the page range that could hold `key`.
    #[must_use]
    pub fn search_index(&self, key: &[u8]) -> Option<PageRange> {
        self.index.search(key)
    }

    /// Whether `page` is the continuation of a multi-page entry.
    #[must_use]
    pub fn is_continuation(&self, page: u32) -> bool {
        self.index.is_continuation(page)
    }

    /// Reads the full byte extent of the page starting at `page`.
    pub fn read_page_cluster(&self, page: u32) -> Result<Vec<u8>> {
        let mut file = lock(&self.keyops);
        let mut buf = vec![0u8; PAGE_SIZE];
        file.seek(SeekFrom::Start(u64::from(page) * PAGE_SIZE as u64))?;
        file.read_exact(&mut buf)?;

        let extent = page_extent(&buf)?;
        if extent > PAGE_SIZE {
            buf.resize(extent, 0);
            file.read_exact(&mut buf[PAGE_SIZE..])?;
        }
        Ok(buf)
    }

    /// Reads `num_pages` raw contiguous pages starting at `first_page`, as
    /// one I/O operation.
    pub fn read_span(&self, first_page: u32, num_pages: u32) -> Result<Vec<u8>> {
        let mut file = lock(&self.keyops);
        let mut buf = vec![0u8; num_pages as usize * PAGE_SIZE];
        file.seek(SeekFrom::Start(u64::from(first_page) * PAGE_SIZE as u64))?;
        file.read_exact(&mut buf)?;
        Ok(buf)
    }

    /// Fetches a blob payload from the blob file.
    pub fn read_blob(&self, span: BlobSpan) -> Result<Vec<u8>> {
        let mut file = lock(&self.blobs);
        let mut buf = vec![0u8; span.len as usize];
        file.seek(SeekFrom::Start(span.offset))?;
        file.read_exact(&mut buf)?;
        Ok(buf)
    }

    /// Single-run point lookup: bloom probe, index search, page fetch.
    pub fn get(&self, key: &[u8]) -> Result<Option<Entry<BlobSpan>>> {
        if !self.may_contain(key) {
            return Ok(None);
        }
        let Some(range) = self.search_index(key) else {
            return Ok(None);
        };
        for page_no in range.lo..=range.hi {
            if self.is_continuation(page_no) {
                continue;
            }
            let cluster = self.read_page_cluster(page_no)?;
            let page = Page::new(&cluster)?;
            if let Some(i) = page.search(key) {
                return Ok(Some(page.entry(i)?));
            }
        }
        Ok(None)
    }

    /// A pull cursor over the run's entries in key order.
    pub fn cursor(self: &Arc<Self>) -> Result<RunCursor> {
        RunCursor::new(Arc::clone(self))
    }
}

impl std::fmt::Debug for Run {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Run")
            .field("run_id", &self.paths.run_id())
            .field("num_entries", &self.num_entries)
            .field("num_pages", &self.index.num_pages())
            .finish()
    }
}

impl Drop for Run {
    fn drop(&mut self) {
        log::trace!("unlinking run {} files", self.paths.run_id());
        for path in self.paths.all() {
            let _ = fs::remove_file(path);
        }
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    // A poisoned run mutex means a reader panicked mid-seek; the underlying
    // file state is still valid because every read re-seeks.
    mutex.lock().unwrap_or_else(std::sync::PoisonError::into_inner)
}

/// A finite, pull-based stream of a run's `(key, entry)` pairs.
///
/// Reads one page cluster ahead through its own file handle, so concurrent
/// point lookups on the same run never contend with it.
pub struct RunCursor {
    run: Arc<Run>,
    file: File,
    next_page: u32,
    pending: std::collections::VecDeque<(Key, Entry<BlobSpan>)>,
}

impl RunCursor {
    fn new(run: Arc<Run>) -> Result<Self> {
        let file = File::open(run.paths.keyops())?;
        let mut cursor = Self {
            run,
            file,
            next_page: 0,
            pending: std::collections::VecDeque::new(),
        };
        cursor.load_page()?;
        Ok(cursor)
    }

    /// The run this cursor reads from.
    #[must_use]
    pub fn run(&self) -> &Arc<Run> {
        &self.run
    }

    /// Yields the next pair, or `None` once the run is exhausted.
    pub fn next(&mut self) -> Result<Option<(Key, Entry<BlobSpan>)>> {
        if self.pending.is_empty() {
            self.load_page()?;
        }
        Ok(self.pending.pop_front())
    }

    fn load_page(&mut self) -> Result<()> {
        if self.next_page >= self.run.num_pages() {
            return Ok(());
        }
        let mut buf = vec![0u8; PAGE_SIZE];
        self.file
            .seek(SeekFrom::Start(u64::from(self.next_page) * PAGE_SIZE as u64))?;
        self.file.read_exact(&mut buf)?;
        let extent = page_extent(&buf)?;
        if extent > PAGE_SIZE {
            buf.resize(extent, 0);
            self.file.read_exact(&mut buf[PAGE_SIZE..])?;
        }
        self.next_page += (extent / PAGE_SIZE) as u32;

        let page = Page::new(&buf)?;
        for i in 0..page.num_entries() {
            self.pending.push_back((page.key(i).to_vec(), page.entry(i)?));
        }
        Ok(())
    }
}
