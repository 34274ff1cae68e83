mod merge_tests;
mod page_tests;

use std::path::Path;
use std::sync::Arc;

use writebuffer::{concat_resolve, Blob, Entry, WriteBuffer};

use crate::{Run, RunParams, RunPaths};

/// Builds a write buffer from literal `(key, entry)` rows.
pub(crate) fn wb_from(entries: &[(&[u8], Entry<Blob>)]) -> WriteBuffer {
    let mut wb = WriteBuffer::new();
    for (key, entry) in entries {
        wb.insert(key.to_vec(), entry.clone(), concat_resolve);
    }
    wb
}

/// Flushes `entries` into a run under `dir`.
pub(crate) fn build_run(dir: &Path, run_id: u64, entries: &[(&[u8], Entry<Blob>)]) -> Arc<Run> {
    let paths = RunPaths::new(dir, run_id);
    let run = Run::from_write_buffer(paths, wb_from(entries), RunParams::default())
        .expect("flush should succeed");
    Arc::new(run)
}

pub(crate) fn insert(value: &[u8]) -> Entry<Blob> {
    Entry::Insert(value.to_vec())
}

pub(crate) fn mupdate(value: &[u8]) -> Entry<Blob> {
    Entry::Mupdate(value.to_vec())
}

pub(crate) fn insert_with_blob(value: &[u8], blob: &[u8]) -> Entry<Blob> {
    Entry::InsertWithBlob(value.to_vec(), blob.to_vec())
}
