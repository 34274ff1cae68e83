//! Page accumulation and the on-disk page layout.
//!
//! A page is the 4 KiB unit of the key/ops file. [`PageAcc`] ingests
//! `(key, entry)` pairs one at a time, accepting until the serialized size
//! would exceed one page; [`PageAcc::build`] then emits the bytes:
//!
//! ```text
//! directory        num_elems: u16 | num_blobs: u16 | key_offsets_offset: u16 | 0: u16
//! blob bitmap      ceil(n/64) × u64, 1 bit per entry
//! op crumbmap      ceil(n/32) × u64, 2 bits per entry
//! blob spans       num_blobs × (offset: u64, len: u32)
//! key offsets      n × u16 (absolute in-page offsets)
//! value offsets    n == 1: (start: u16, end: u32)   n > 1: (n+1) × u16
//! key bytes        concatenated
//! value bytes      concatenated
//! padding          zeros to the next 4 KiB boundary
//! ```
//!
//! All integers little-endian. Operation crumbs: `0` insert (with or without
//! blob), `1` mupsert, `2` delete, `3` reserved.
//!
//! A single entry is accepted into an empty page no matter its size; the
//! resulting bytes span multiple page slots (`n == 1` is the only case where
//! the value-end offset is 32-bit). Every key in a page shares the first
//! `precision` bits of the page's first key, which is what lets the compact
//! index assign each page to exactly one bucket.

use writebuffer::{BlobSpan, Entry, Key};

use crate::error::{Result, RunError};
use crate::format::{round_to_page, PAGE_SIZE};
use crate::index::key_top_bits;

/// Operation crumb codes, 2 bits each.
pub(crate) const OP_INSERT: u8 = 0;
pub(crate) const OP_MUPDATE: u8 = 1;
pub(crate) const OP_DELETE: u8 = 2;

pub(crate) fn op_crumb(entry: &Entry<BlobSpan>) -> u8 {
    match entry {
        Entry::Insert(_) | Entry::InsertWithBlob(..) => OP_INSERT,
        Entry::Mupdate(_) => OP_MUPDATE,
        Entry::Delete => OP_DELETE,
    }
}

fn bitmap_words(n: usize) -> usize {
    n.div_ceil(64)
}

fn crumb_words(n: usize) -> usize {
    n.div_ceil(32)
}

fn value_offsets_len(n: usize) -> usize {
    if n == 1 {
        6
    } else {
        2 * (n + 1)
    }
}

/// The serialized byte count of a page holding the given totals, before
/// padding.
fn serialized_len(n: usize, blobs: usize, key_bytes: usize, value_bytes: usize) -> usize {
    8 + 8 * bitmap_words(n)
        + 8 * crumb_words(n)
        + 12 * blobs
        + 2 * n
        + value_offsets_len(n)
        + key_bytes
        + value_bytes
}

/// A bit-per-entry map packed into 64-bit words. Words are zero on
/// allocation; appending a zero bit leaves the current word untouched.
#[derive(Default)]
struct PackedBits {
    words: Vec<u64>,
    len: usize,
}

impl PackedBits {
    fn push(&mut self, bit: bool) {
        if self.len % 64 == 0 {
            self.words.push(0);
        }
        if bit {
            self.words[self.len / 64] |= 1 << (self.len % 64);
        }
        self.len += 1;
    }
}

/// A 2-bit-per-entry map packed into 64-bit words, same zero-append rule.
#[derive(Default)]
struct PackedCrumbs {
    words: Vec<u64>,
    len: usize,
}

impl PackedCrumbs {
    fn push(&mut self, crumb: u8) {
        debug_assert!(crumb < 4);
        if self.len % 32 == 0 {
            self.words.push(0);
        }
        if crumb != 0 {
            self.words[self.len / 32] |= u64::from(crumb) << ((self.len % 32) * 2);
        }
        self.len += 1;
    }
}

/// Accumulates ordered `(key, entry)` pairs for one page.
pub struct PageAcc {
    precision: u8,
    keys: Vec<Key>,
    entries: Vec<Entry<BlobSpan>>,
    key_bytes: usize,
    value_bytes: usize,
    num_blobs: usize,
}

impl PageAcc {
    /// `precision` is the number of leading key bits all entries of a page
    /// must share (0–16).
    #[must_use]
    pub fn new(precision: u8) -> Self {
        debug_assert!(precision <= 16);
        Self {
            precision,
            keys: Vec::new(),
            entries: Vec::new(),
            key_bytes: 0,
            value_bytes: 0,
            num_blobs: 0,
        }
    }

    /// Tries to take `(key, entry)` into the page.
    ///
    /// Returns `false` when the pair does not fit (the caller must `build`
    /// and `clear`, then re-add) or when the key's leading bits differ from
    /// the page's. An empty page accepts any single pair, however large.
    /// Keys must arrive in strictly increasing order.
    pub fn try_add(&mut self, key: &[u8], entry: &Entry<BlobSpan>) -> bool {
        let value_len = entry.value().map_or(0, <[u8]>::len);

        if let Some(first) = self.keys.first() {
            if key_top_bits(key, self.precision) != key_top_bits(first, self.precision) {
                return false;
            }
            let n = self.keys.len() + 1;
            let blobs = self.num_blobs + usize::from(entry.has_blob());
            let projected = serialized_len(
                n,
                blobs,
                self.key_bytes + key.len(),
                self.value_bytes + value_len,
            );
            if projected > PAGE_SIZE {
                return false;
            }
        }

        debug_assert!(self.keys.last().is_none_or(|last| last.as_slice() < key));

        self.key_bytes += key.len();
        self.value_bytes += value_len;
        self.num_blobs += usize::from(entry.has_blob());
        self.keys.push(key.to_vec());
        self.entries.push(entry.clone());
        true
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }

    #[must_use]
    pub fn num_entries(&self) -> usize {
        self.keys.len()
    }

    /// The first key of the page, once at least one pair was accepted.
    #[must_use]
    pub fn first_key(&self) -> Option<&[u8]> {
        self.keys.first().map(Vec::as_slice)
    }

    /// The serialized size of the current contents, before padding.
    #[must_use]
    pub fn current_size(&self) -> usize {
        serialized_len(
            self.keys.len(),
            self.num_blobs,
            self.key_bytes,
            self.value_bytes,
        )
    }

    /// Drops all accumulated pairs, keeping the configuration.
    pub fn clear(&mut self) {
        self.keys.clear();
        self.entries.clear();
        self.key_bytes = 0;
        self.value_bytes = 0;
        self.num_blobs = 0;
    }

    /// Serializes the accumulated pairs, padded to a page boundary.
    ///
    /// The result is exactly [`PAGE_SIZE`] bytes, except for a single
    /// oversized entry which pads to the next page multiple.
    ///
    /// # Panics
    ///
    /// Panics if the page is empty.
    #[must_use]
    pub fn build(&self) -> Vec<u8> {
        let n = self.keys.len();
        assert!(n > 0, "cannot serialize an empty page");

        let total = serialized_len(n, self.num_blobs, self.key_bytes, self.value_bytes);
        let padded = round_to_page(total);
        debug_assert!(n == 1 || padded == PAGE_SIZE);

        let key_offsets_offset =
            8 + 8 * bitmap_words(n) + 8 * crumb_words(n) + 12 * self.num_blobs;
        let keys_start = key_offsets_offset + 2 * n + value_offsets_len(n);
        let values_start = keys_start + self.key_bytes;
        debug_assert!(values_start <= usize::from(u16::MAX));

        let mut buf = Vec::with_capacity(padded);

        // (1) directory
        buf.extend_from_slice(&(n as u16).to_le_bytes());
        buf.extend_from_slice(&(self.num_blobs as u16).to_le_bytes());
        buf.extend_from_slice(&(key_offsets_offset as u16).to_le_bytes());
        buf.extend_from_slice(&0u16.to_le_bytes());

        // (2) blob-present bitmap
        let mut bitmap = PackedBits::default();
        for entry in &self.entries {
            bitmap.push(entry.has_blob());
        }
        for word in &bitmap.words {
            buf.extend_from_slice(&word.to_le_bytes());
        }

        // (3) operation crumbmap
        let mut crumbs = PackedCrumbs::default();
        for entry in &self.entries {
            crumbs.push(op_crumb(entry));
        }
        for word in &crumbs.words {
            buf.extend_from_slice(&word.to_le_bytes());
        }

        // (4) blob spans, in entry order
        for entry in &self.entries {
            if let Entry::InsertWithBlob(_, span) = entry {
                buf.extend_from_slice(&span.offset.to_le_bytes());
                buf.extend_from_slice(&span.len.to_le_bytes());
            }
        }

        // (5) key offsets
        let mut running = keys_start;
        for key in &self.keys {
            buf.extend_from_slice(&(running as u16).to_le_bytes());
            running += key.len();
        }

        // (6) value offsets
        if n == 1 {
            let end = values_start + self.value_bytes;
            buf.extend_from_slice(&(values_start as u16).to_le_bytes());
            buf.extend_from_slice(&(end as u32).to_le_bytes());
        } else {
            let mut running = values_start;
            for entry in &self.entries {
                buf.extend_from_slice(&(running as u16).to_le_bytes());
                running += entry.value().map_or(0, <[u8]>::len);
            }
            buf.extend_from_slice(&(running as u16).to_le_bytes());
        }

        // (7) keys, (8) values, (9) padding
        for key in &self.keys {
            buf.extend_from_slice(key);
        }
        for entry in &self.entries {
            if let Some(value) = entry.value() {
                buf.extend_from_slice(value);
            }
        }
        debug_assert_eq!(buf.len(), total);
        buf.resize(padded, 0);

        buf
    }
}

/// Peeks at a page's directory to learn its full byte extent.
///
/// `first` must hold at least the leading [`PAGE_SIZE`] bytes. The extent is
/// [`PAGE_SIZE`] for everything but a single-entry page whose value spills
/// past the page boundary.
pub fn page_extent(first: &[u8]) -> Result<usize> {
    if first.len() < PAGE_SIZE {
        return Err(RunError::Corrupt("truncated page"));
    }
    let n = usize::from(u16::from_le_bytes([first[0], first[1]]));
    if n == 0 {
        return Err(RunError::Corrupt("page with zero entries"));
    }
    if n > 1 {
        return Ok(PAGE_SIZE);
    }

    let koo = usize::from(u16::from_le_bytes([first[4], first[5]]));
    let vo = koo + 2;
    if vo + 6 > PAGE_SIZE {
        return Err(RunError::Corrupt("page directory out of bounds"));
    }
    let end = u32::from_le_bytes([first[vo + 2], first[vo + 3], first[vo + 4], first[vo + 5]]);
    Ok(round_to_page(end as usize))
}

/// A decoded view over one page's full byte extent.
pub struct Page<'a> {
    data: &'a [u8],
    num_entries: usize,
    num_blobs: usize,
    key_offsets_offset: usize,
}

impl<'a> Page<'a> {
    /// Validates the directory and offset arrays; `data` must cover the whole
    /// extent reported by [`page_extent`].
    pub fn new(data: &'a [u8]) -> Result<Page<'a>> {
        if data.len() < PAGE_SIZE {
            return Err(RunError::Corrupt("truncated page"));
        }
        let n = usize::from(u16::from_le_bytes([data[0], data[1]]));
        let b = usize::from(u16::from_le_bytes([data[2], data[3]]));
        let koo = usize::from(u16::from_le_bytes([data[4], data[5]]));

        if n == 0 {
            return Err(RunError::Corrupt("page with zero entries"));
        }
        if b > n {
            return Err(RunError::Corrupt("more blobs than entries"));
        }
        if koo != 8 + 8 * bitmap_words(n) + 8 * crumb_words(n) + 12 * b {
            return Err(RunError::Corrupt("page directory mismatch"));
        }

        let keys_start = koo + 2 * n + value_offsets_len(n);
        if keys_start > data.len() {
            return Err(RunError::Corrupt("page offsets out of bounds"));
        }

        let page = Page {
            data,
            num_entries: n,
            num_blobs: b,
            key_offsets_offset: koo,
        };

        let mut prev = keys_start;
        for i in 0..n {
            let off = page.key_offset(i);
            if off < prev || off > data.len() {
                return Err(RunError::Corrupt("key offsets not monotonic"));
            }
            prev = off;
        }
        let values_start = page.value_offset(0);
        if values_start < prev || values_start > data.len() {
            return Err(RunError::Corrupt("value offsets out of bounds"));
        }
        let mut prev = values_start;
        for i in 1..=n {
            let off = page.value_offset(i);
            if off < prev || off > data.len() {
                return Err(RunError::Corrupt("value offsets not monotonic"));
            }
            prev = off;
        }

        Ok(page)
    }

    #[must_use]
    pub fn num_entries(&self) -> usize {
        self.num_entries
    }

    #[must_use]
    pub fn num_blobs(&self) -> usize {
        self.num_blobs
    }

    /// The full byte extent of this page (a multiple of [`PAGE_SIZE`]).
    #[must_use]
    pub fn total_size(&self) -> usize {
        if self.num_entries == 1 {
            round_to_page(self.value_offset(1))
        } else {
            PAGE_SIZE
        }
    }

    fn key_offset(&self, i: usize) -> usize {
        let at = self.key_offsets_offset + 2 * i;
        usize::from(u16::from_le_bytes([self.data[at], self.data[at + 1]]))
    }

    fn value_offset(&self, i: usize) -> usize {
        let base = self.key_offsets_offset + 2 * self.num_entries;
        if self.num_entries == 1 {
            if i == 0 {
                usize::from(u16::from_le_bytes([self.data[base], self.data[base + 1]]))
            } else {
                u32::from_le_bytes([
                    self.data[base + 2],
                    self.data[base + 3],
                    self.data[base + 4],
                    self.data[base + 5],
                ]) as usize
            }
        } else {
            let at = base + 2 * i;
            usize::from(u16::from_le_bytes([self.data[at], self.data[at + 1]]))
        }
    }

    #[must_use]
    pub fn key(&self, i: usize) -> &'a [u8] {
        let start = self.key_offset(i);
        let end = if i + 1 < self.num_entries {
            self.key_offset(i + 1)
        } else {
            self.value_offset(0)
        };
        &self.data[start..end]
    }

    #[must_use]
    pub fn value(&self, i: usize) -> &'a [u8] {
        &self.data[self.value_offset(i)..self.value_offset(i + 1)]
    }

    fn op(&self, i: usize) -> u8 {
        let crumbs_start = 8 + 8 * bitmap_words(self.num_entries);
        let at = crumbs_start + 8 * (i / 32);
        let word = u64::from_le_bytes(self.data[at..at + 8].try_into().expect("8-byte slice"));
        ((word >> ((i % 32) * 2)) & 3) as u8
    }

    fn has_blob(&self, i: usize) -> bool {
        let at = 8 + 8 * (i / 64);
        let word = u64::from_le_bytes(self.data[at..at + 8].try_into().expect("8-byte slice"));
        (word >> (i % 64)) & 1 == 1
    }

    /// The blob span of entry `i`, if it carries one.
    #[must_use]
    pub fn blob_span(&self, i: usize) -> Option<BlobSpan> {
        if !self.has_blob(i) {
            return None;
        }
        // The span array is ordered by entry; rank = blob entries before i.
        let mut rank = 0;
        for j in 0..i {
            rank += usize::from(self.has_blob(j));
        }
        let spans_start = 8 + 8 * bitmap_words(self.num_entries) + 8 * crumb_words(self.num_entries);
        let at = spans_start + 12 * rank;
        Some(BlobSpan {
            offset: u64::from_le_bytes(self.data[at..at + 8].try_into().expect("8-byte slice")),
            len: u32::from_le_bytes(self.data[at + 8..at + 12].try_into().expect("4-byte slice")),
        })
    }

    /// Materializes entry `i`.
    pub fn entry(&self, i: usize) -> Result<Entry<BlobSpan>> {
        match self.op(i) {
            OP_INSERT => match self.blob_span(i) {
                Some(span) => Ok(Entry::InsertWithBlob(self.value(i).to_vec(), span)),
                None => Ok(Entry::Insert(self.value(i).to_vec())),
            },
            OP_MUPDATE => Ok(Entry::Mupdate(self.value(i).to_vec())),
            OP_DELETE => Ok(Entry::Delete),
            _ => Err(RunError::Corrupt("reserved operation code")),
        }
    }

    /// Binary-searches the page for `key`.
    #[must_use]
    pub fn search(&self, key: &[u8]) -> Option<usize> {
        let mut lo = 0;
        let mut hi = self.num_entries;
        while lo < hi {
            let mid = (lo + hi) / 2;
            match self.key(mid).cmp(key) {
                std::cmp::Ordering::Less => lo = mid + 1,
                std::cmp::Ordering::Greater => hi = mid,
                std::cmp::Ordering::Equal => return Some(mid),
            }
        }
        None
    }
}
