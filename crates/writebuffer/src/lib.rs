//! # Write Buffer
//!
//! The in-memory, ordered staging area for pending updates, plus the entry
//! model shared by the whole storage core.
//!
//! An [`Entry`] is one of four operations: plain insert, insert with an
//! out-of-line blob, monoidal upsert ("mupsert"), or delete. Two entries for
//! the same key resolve into one — resolution is applied when an entry is
//! inserted over an existing one, when write buffers are unioned, and when
//! runs are merged on disk. The rules (`newer` over `older`):
//!
//! | newer            | older            | result                 |
//! |------------------|------------------|------------------------|
//! | `Delete`         | anything         | `Delete`               |
//! | `Insert(v)`      | anything         | `Insert(v)`            |
//! | `InsertWithBlob` | anything         | `InsertWithBlob`       |
//! | `Mupdate(v)`     | `Insert(u)`      | `Insert(v ⊕ u)`        |
//! | `Mupdate(v)`     | `InsertWithBlob(u, _)` | `Insert(v ⊕ u)`  |
//! | `Mupdate(v)`     | `Mupdate(u)`     | `Mupdate(v ⊕ u)`       |
//! | `Mupdate(v)`     | `Delete`         | `Insert(v)`            |
//!
//! `⊕` is the caller-supplied [`Resolve`] combine; it must be associative.
//!
//! [`Entry`] is generic over its blob representation: the write buffer holds
//! raw blob bytes (`Entry<Blob>`) because no blob file exists yet, while
//! entries inside a run hold a [`BlobSpan`] pointing into the run's blob file.
//!
//! When the buffer reaches the configured capacity the engine flushes it to a
//! new level-0 run and replaces it with an empty one.

use std::collections::BTreeMap;

/// An opaque lookup key. Ordered by unsigned lexicographic byte comparison.
pub type Key = Vec<u8>;
/// An opaque value payload.
pub type Value = Vec<u8>;
/// Raw out-of-line payload bytes, as held before a flush assigns a span.
pub type Blob = Vec<u8>;

/// The associative combine `⊕` applied during mupsert resolution.
///
/// Arguments are `(newer, older)`; the result replaces both.
pub type Resolve = fn(&[u8], &[u8]) -> Vec<u8>;

/// A reference into a run's blob file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlobSpan {
    /// Byte offset of the blob within the blob file.
    pub offset: u64,
    /// Length of the blob in bytes.
    pub len: u32,
}

/// A single key operation, generic over the blob representation `B`
/// (raw bytes in the write buffer, [`BlobSpan`] inside a run).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Entry<B> {
    /// Sets the key to `value`.
    Insert(Value),
    /// Sets the key to `value` with an attached out-of-line blob.
    InsertWithBlob(Value, B),
    /// Monoidal upsert: combines `value` with whatever the key resolves to.
    Mupdate(Value),
    /// Removes the key.
    Delete,
}

impl<B> Entry<B> {
    /// The value payload, if this operation carries one.
    #[must_use]
    pub fn value(&self) -> Option<&[u8]> {
        match self {
            Entry::Insert(v) | Entry::InsertWithBlob(v, _) | Entry::Mupdate(v) => Some(v),
            Entry::Delete => None,
        }
    }

    /// Returns `true` for `Delete`.
    #[must_use]
    pub fn is_delete(&self) -> bool {
        matches!(self, Entry::Delete)
    }

    /// Returns `true` if this entry carries an out-of-line blob.
    #[must_use]
    pub fn has_blob(&self) -> bool {
        matches!(self, Entry::InsertWithBlob(..))
    }

    /// Maps the blob representation, e.g. raw bytes to a span after the blob
    /// has been appended to a blob file.
    pub fn map_blob<C>(self, f: impl FnOnce(B) -> C) -> Entry<C> {
        match self {
            Entry::Insert(v) => Entry::Insert(v),
            Entry::InsertWithBlob(v, b) => Entry::InsertWithBlob(v, f(b)),
            Entry::Mupdate(v) => Entry::Mupdate(v),
            Entry::Delete => Entry::Delete,
        }
    }

    /// Resolves `self` (the newer entry) against `older`.
    #[must_use]
    pub fn combine(self, older: Entry<B>, resolve: Resolve) -> Entry<B> {
        match (self, older) {
            (Entry::Mupdate(v), Entry::Insert(u)) => Entry::Insert(resolve(&v, &u)),
            (Entry::Mupdate(v), Entry::InsertWithBlob(u, _)) => Entry::Insert(resolve(&v, &u)),
            (Entry::Mupdate(v), Entry::Mupdate(u)) => Entry::Mupdate(resolve(&v, &u)),
            (Entry::Mupdate(v), Entry::Delete) => Entry::Insert(v),
            (newer, _) => newer,
        }
    }
}

/// The default `⊕`: newer bytes followed by older bytes.
#[must_use]
pub fn concat_resolve(newer: &[u8], older: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(newer.len() + older.len());
    out.extend_from_slice(newer);
    out.extend_from_slice(older);
    out
}

/// An ordered map of pending entries, resolved at insertion time.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WriteBuffer {
    map: BTreeMap<Key, Entry<Blob>>,
    approx_size: usize,
}

impl WriteBuffer {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Builds a buffer from an already-resolved map.
    #[must_use]
    pub fn from_map(map: BTreeMap<Key, Entry<Blob>>) -> Self {
        let approx_size = map
            .iter()
            .map(|(k, e)| k.len() + entry_payload_size(e))
            .sum();
        Self { map, approx_size }
    }

    /// Consumes the buffer, yielding the underlying ordered map.
    #[must_use]
    pub fn into_map(self) -> BTreeMap<Key, Entry<Blob>> {
        self.map
    }

    /// Inserts `entry` for `key`, resolving against any existing entry.
    pub fn insert(&mut self, key: Key, entry: Entry<Blob>, resolve: Resolve) {
        match self.map.remove(&key) {
            Some(older) => {
                self.approx_size -= entry_payload_size(&older);
                let resolved = entry.combine(older, resolve);
                self.approx_size += entry_payload_size(&resolved);
                self.map.insert(key, resolved);
            }
            None => {
                self.approx_size += key.len() + entry_payload_size(&entry);
                self.map.insert(key, entry);
            }
        }
    }

    /// The currently resolved entry for `key`, if any.
    #[must_use]
    pub fn get(&self, key: &[u8]) -> Option<&Entry<Blob>> {
        self.map.get(key)
    }

    /// Ordered iterator over `(key, entry)` pairs.
    pub fn iter(&self) -> impl Iterator<Item = (&Key, &Entry<Blob>)> {
        self.map.iter()
    }

    /// Number of buffered entries (deletes included).
    #[must_use]
    pub fn num_entries(&self) -> usize {
        self.map.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }

    /// Approximate memory footprint: key bytes plus entry payload bytes.
    #[must_use]
    pub fn approx_size(&self) -> usize {
        self.approx_size
    }

    /// Unions buffers, `buffers[0]` being the newest. Entries for the same
    /// key resolve newest-over-older, exactly as repeated `insert` calls
    /// would.
    #[must_use]
    pub fn union(buffers: impl IntoIterator<Item = WriteBuffer>, resolve: Resolve) -> WriteBuffer {
        let mut acc = WriteBuffer::new();
        for buffer in buffers {
            for (key, older) in buffer.map {
                match acc.map.remove(&key) {
                    Some(newer) => {
                        acc.approx_size -= entry_payload_size(&newer);
                        let resolved = newer.combine(older, resolve);
                        acc.approx_size += entry_payload_size(&resolved);
                        acc.map.insert(key, resolved);
                    }
                    None => {
                        acc.approx_size += key.len() + entry_payload_size(&older);
                        acc.map.insert(key, older);
                    }
                }
            }
        }
        acc
    }
}

fn entry_payload_size(entry: &Entry<Blob>) -> usize {
    match entry {
        Entry::Insert(v) | Entry::Mupdate(v) => v.len(),
        Entry::InsertWithBlob(v, b) => v.len() + b.len(),
        Entry::Delete => 0,
    }
}
