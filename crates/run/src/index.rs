//! The compact index: key → candidate page range within one run.
//!
//! Every key of a page shares the page's leading `precision` bits, so each
//! page belongs to exactly one *bucket* — the integer formed by those bits.
//! The index stores, per bucket, the inclusive range of pages whose first key
//! falls in it, plus one 32-bit key prefix per page for narrowing large
//! buckets by binary search. An empty bucket is a definitive miss.
//!
//! Pages that are continuations of a multi-page entry are recorded in a small
//! side table; a search result never *starts* on a continuation page, and the
//! lookup stage skips them inside a candidate range (an oversized value is
//! reached through its entry's first page).
//!
//! Construction is incremental: the builder is handed the first key of each
//! finished page, buffers appends in fixed-size chunks to bound intermediate
//! state, and folds full chunks into the bucket and prefix arrays in one
//! pass. Bucket range writes rely on pages arriving in key order.

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use std::io::{self, Read, Write};

use crate::error::{Result, RunError};
use crate::format::INDEX_MAGIC;

/// Marks a bucket that holds no page.
const NO_PAGE: u32 = u32::MAX;

/// Upper bound on a plausible page count when deserializing (1 TiB of pages).
const MAX_PAGES: u32 = 1 << 28;

/// An inclusive range of page numbers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PageRange {
    pub lo: u32,
    pub hi: u32,
}

/// The leading `precision` bits of a key, as a bucket number.
///
/// Keys shorter than two bytes are zero-extended, matching the ordering of
/// unsigned lexicographic comparison.
#[must_use]
pub fn key_top_bits(key: &[u8], precision: u8) -> u16 {
    debug_assert!(precision <= 16);
    if precision == 0 {
        return 0;
    }
    let raw = u16::from_be_bytes([
        key.first().copied().unwrap_or(0),
        key.get(1).copied().unwrap_or(0),
    ]);
    raw >> (16 - precision)
}

/// The first four key bytes as a big-endian integer, zero-extended.
///
/// `a < b` (lexicographically) implies `key_prefix32(a) <= key_prefix32(b)`,
/// which is what makes the in-bucket binary search sound.
#[must_use]
pub fn key_prefix32(key: &[u8]) -> u32 {
    u32::from_be_bytes([
        key.first().copied().unwrap_or(0),
        key.get(1).copied().unwrap_or(0),
        key.get(2).copied().unwrap_or(0),
        key.get(3).copied().unwrap_or(0),
    ])
}

/// The memory-resident page index of one run.
#[derive(Debug, PartialEq, Eq)]
pub struct CompactIndex {
    precision: u8,
    num_pages: u32,
    num_entries: u64,
    /// One `(lo, hi)` slot per bucket; `NO_PAGE` marks an empty bucket.
    buckets: Vec<(u32, u32)>,
    /// First-key prefix of every physical page.
    prefixes: Vec<u32>,
    /// Sorted continuation pages of multi-page entries.
    overflow: Vec<u32>,
}

impl CompactIndex {
    #[must_use]
    pub fn num_pages(&self) -> u32 {
        self.num_pages
    }

    /// Total entries of the run this index describes.
    #[must_use]
    pub fn num_entries(&self) -> u64 {
        self.num_entries
    }

    #[must_use]
    pub fn precision(&self) -> u8 {
        self.precision
    }

    /// Returns `true` if `page` is a continuation of a multi-page entry
    /// rather than the start of one.
    #[must_use]
    pub fn is_continuation(&self, page: u32) -> bool {
        self.overflow.binary_search(&page).is_ok()
    }

    /// The page range that could hold `key`, or `None` for a definitive miss.
    ///
    /// If the key is present in the run, the page holding it is inside the
    /// returned range.
    #[must_use]
    pub fn search(&self, key: &[u8]) -> Option<PageRange> {
        if self.num_pages == 0 {
            return None;
        }
        let (lo, hi) = self.buckets[usize::from(key_top_bits(key, self.precision))];
        if lo == NO_PAGE {
            return None;
        }

        let target = key_prefix32(key);
        let slice = &self.prefixes[lo as usize..=hi as usize];

        let n_le = slice.partition_point(|&p| p <= target);
        if n_le == 0 {
            // Every page of the bucket starts past the key.
            return None;
        }
        let n_lt = slice.partition_point(|&p| p < target);

        let hi = lo + n_le as u32 - 1;
        let mut lo = if n_lt == 0 { lo } else { lo + n_lt as u32 - 1 };

        // A range never begins mid-entry.
        while self.is_continuation(lo) {
            lo -= 1;
        }

        Some(PageRange { lo, hi })
    }

    /// Serializes the index. Layout (little-endian):
    ///
    /// ```text
    /// magic: u32 | precision: u16 | 0: u16 | num_pages: u32 | num_entries: u64
    /// buckets: (1 << precision) × (lo: u32, hi: u32)
    /// prefixes: num_pages × u32
    /// overflow_count: u32 | overflow: count × u32
    /// crc32: u32 over everything above
    /// ```
    pub fn write_to<W: Write>(&self, w: &mut W) -> io::Result<()> {
        let mut body = Vec::with_capacity(24 + 8 * self.buckets.len() + 4 * self.prefixes.len());
        body.write_u32::<LittleEndian>(INDEX_MAGIC)?;
        body.write_u16::<LittleEndian>(u16::from(self.precision))?;
        body.write_u16::<LittleEndian>(0)?;
        body.write_u32::<LittleEndian>(self.num_pages)?;
        body.write_u64::<LittleEndian>(self.num_entries)?;
        for &(lo, hi) in &self.buckets {
            body.write_u32::<LittleEndian>(lo)?;
            body.write_u32::<LittleEndian>(hi)?;
        }
        for &prefix in &self.prefixes {
            body.write_u32::<LittleEndian>(prefix)?;
        }
        body.write_u32::<LittleEndian>(self.overflow.len() as u32)?;
        for &page in &self.overflow {
            body.write_u32::<LittleEndian>(page)?;
        }

        let crc = crc32fast::hash(&body);
        w.write_all(&body)?;
        w.write_u32::<LittleEndian>(crc)?;
        Ok(())
    }

    /// Deserializes an index, verifying magic and checksum.
    pub fn read_from<R: Read>(r: &mut R) -> Result<Self> {
        let mut raw = Vec::new();
        r.read_to_end(&mut raw)?;
        if raw.len() < 28 {
            return Err(RunError::Corrupt("index file too small"));
        }

        let (body, crc_bytes) = raw.split_at(raw.len() - 4);
        let stored_crc = u32::from_le_bytes(crc_bytes.try_into().expect("4-byte slice"));
        if crc32fast::hash(body) != stored_crc {
            return Err(RunError::Corrupt("index checksum mismatch"));
        }

        let mut cur = io::Cursor::new(body);
        if cur.read_u32::<LittleEndian>()? != INDEX_MAGIC {
            return Err(RunError::Corrupt("bad index magic"));
        }
        let precision = cur.read_u16::<LittleEndian>()?;
        if precision > 16 {
            return Err(RunError::Corrupt("implausible index precision"));
        }
        let precision = precision as u8;
        let _reserved = cur.read_u16::<LittleEndian>()?;
        let num_pages = cur.read_u32::<LittleEndian>()?;
        if num_pages > MAX_PAGES {
            return Err(RunError::Corrupt("implausible index page count"));
        }
        let num_entries = cur.read_u64::<LittleEndian>()?;

        let mut buckets = Vec::with_capacity(1 << precision);
        for _ in 0..(1usize << precision) {
            let lo = cur.read_u32::<LittleEndian>()?;
            let hi = cur.read_u32::<LittleEndian>()?;
            buckets.push((lo, hi));
        }
        let mut prefixes = Vec::with_capacity(num_pages as usize);
        for _ in 0..num_pages {
            prefixes.push(cur.read_u32::<LittleEndian>()?);
        }
        let overflow_count = cur.read_u32::<LittleEndian>()?;
        if overflow_count > num_pages {
            return Err(RunError::Corrupt("implausible index overflow count"));
        }
        let mut overflow = Vec::with_capacity(overflow_count as usize);
        for _ in 0..overflow_count {
            overflow.push(cur.read_u32::<LittleEndian>()?);
        }

        Ok(Self {
            precision,
            num_pages,
            num_entries,
            buckets,
            prefixes,
            overflow,
        })
    }
}

/// One page waiting in the builder's chunk.
struct PendingPage {
    prefix: u32,
    bucket: u16,
    continuation: bool,
}

/// Incremental, chunked construction of a [`CompactIndex`].
pub struct CompactIndexBuilder {
    precision: u8,
    chunk_size: usize,
    chunk: Vec<PendingPage>,
    buckets: Vec<(u32, u32)>,
    prefixes: Vec<u32>,
    overflow: Vec<u32>,
    next_page: u32,
}

impl CompactIndexBuilder {
    /// `chunk_size` is the number of page appends buffered before they are
    /// folded into the index arrays.
    #[must_use]
    pub fn new(precision: u8, chunk_size: usize) -> Self {
        debug_assert!(precision <= 16);
        Self {
            precision,
            chunk_size: chunk_size.max(1),
            chunk: Vec::new(),
            buckets: vec![(NO_PAGE, NO_PAGE); 1 << precision],
            prefixes: Vec::new(),
            overflow: Vec::new(),
            next_page: 0,
        }
    }

    /// Records a finished page by its first key. `extra_pages` is the number
    /// of continuation pages a multi-page entry spilled into (0 for a normal
    /// page). Pages must be appended in key order.
    pub fn append(&mut self, first_key: &[u8], extra_pages: u32) {
        let bucket = key_top_bits(first_key, self.precision);
        let prefix = key_prefix32(first_key);
        debug_assert!(self
            .chunk
            .last()
            .map(|p| p.bucket)
            .or_else(|| self.last_committed_bucket())
            .is_none_or(|b| b <= bucket));

        self.chunk.push(PendingPage {
            prefix,
            bucket,
            continuation: false,
        });
        for _ in 0..extra_pages {
            self.chunk.push(PendingPage {
                prefix,
                bucket,
                continuation: true,
            });
        }

        while self.chunk.len() >= self.chunk_size {
            let rest = self.chunk.split_off(self.chunk_size);
            let full = std::mem::replace(&mut self.chunk, rest);
            self.flush_chunk(full);
        }
    }

    /// Folds the index state and returns the finished index. `num_entries`
    /// is the total entry count of the run being described.
    #[must_use]
    pub fn finish(mut self, num_entries: u64) -> CompactIndex {
        let tail = std::mem::take(&mut self.chunk);
        self.flush_chunk(tail);
        CompactIndex {
            precision: self.precision,
            num_pages: self.next_page,
            num_entries,
            buckets: self.buckets,
            prefixes: self.prefixes,
            overflow: self.overflow,
        }
    }

    fn last_committed_bucket(&self) -> Option<u16> {
        self.prefixes
            .last()
            .map(|_| {
                // The last committed page's bucket is recoverable from its
                // prefix's top bits.
                if self.precision == 0 {
                    0
                } else {
                    (self.prefixes[self.prefixes.len() - 1] >> (32 - u32::from(self.precision)))
                        as u16
                }
            })
    }

    /// Folds one chunk of pending pages into the bucket and prefix arrays.
    fn flush_chunk(&mut self, chunk: Vec<PendingPage>) {
        let mut i = 0;
        while i < chunk.len() {
            let bucket = chunk[i].bucket;
            let lo = self.next_page + i as u32;
            let mut j = i;
            while j < chunk.len() && chunk[j].bucket == bucket {
                j += 1;
            }
            let hi = self.next_page + j as u32 - 1;
            self.write_bucket_range(bucket, lo, hi);
            i = j;
        }

        for (k, page) in chunk.iter().enumerate() {
            let page_no = self.next_page + k as u32;
            self.prefixes.push(page.prefix);
            if page.continuation {
                self.overflow.push(page_no);
            }
        }
        self.next_page += chunk.len() as u32;
    }

    /// Writes (or extends) a bucket's page range. Pages arrive in order, so
    /// an occupied slot is only ever extended at its high end.
    fn write_bucket_range(&mut self, bucket: u16, lo: u32, hi: u32) {
        let slot = &mut self.buckets[usize::from(bucket)];
        if slot.0 == NO_PAGE {
            *slot = (lo, hi);
        } else {
            debug_assert!(slot.1 < lo, "bucket ranges must be written in page order");
            slot.1 = hi;
        }
    }
}
