//! Read path: point lookups, batched lookups, and range scans.
//!
//! Lookups probe the write buffer first (freshest data, tombstones
//! included), then fan out through the run-level pipeline against every
//! resident run, newest to oldest. A mupsert in the write buffer does not
//! end the search — its value is combined with whatever the runs resolve to.
//!
//! The table mutex is released before any disk I/O: the write-buffer
//! entries and run references the operation needs are cloned out under the
//! lock, and the reference counts keep the runs alive even if a concurrent
//! merge retires them mid-lookup.

use std::collections::{BTreeMap, HashMap};

use run::LookupResult;
use writebuffer::{Entry, Key, Value};

use crate::error::Result;
use crate::table::Table;

impl Table {
    /// Looks up a single key.
    pub fn lookup(&self, key: &[u8]) -> Result<Option<Value>> {
        let mut results = self.lookup_batch(&[key.to_vec()])?;
        Ok(results.pop().flatten())
    }

    /// Looks up a batch of keys; results come back in input order.
    pub fn lookup_batch(&self, keys: &[Key]) -> Result<Vec<Option<Value>>> {
        let (wb_entries, runs, resolve, batch_size, cache) = {
            let inner = self.guard()?;
            (
                keys.iter()
                    .map(|k| inner.wb.get(k).cloned())
                    .collect::<Vec<_>>(),
                inner.collect_runs(),
                inner.config.resolve,
                inner.config.lookup_batch_size,
                inner.cache.clone(),
            )
        };

        // Keys the write buffer could not settle: absent ones, and mupserts
        // whose chain continues into the runs.
        let need: Vec<usize> = wb_entries
            .iter()
            .enumerate()
            .filter(|(_, e)| matches!(e, None | Some(Entry::Mupdate(_))))
            .map(|(i, _)| i)
            .collect();

        let mut from_runs: HashMap<usize, LookupResult> = if need.is_empty() {
            HashMap::new()
        } else {
            let sub_keys: Vec<Key> = need.iter().map(|&i| keys[i].clone()).collect();
            let results =
                run::lookup_batch(&runs, &sub_keys, resolve, batch_size, cache.as_deref())?;
            need.into_iter().zip(results).collect()
        };

        let mut out = Vec::with_capacity(keys.len());
        for (i, wb_entry) in wb_entries.into_iter().enumerate() {
            let value = match wb_entry {
                Some(Entry::Insert(v) | Entry::InsertWithBlob(v, _)) => Some(v),
                Some(Entry::Delete) => None,
                Some(Entry::Mupdate(v)) => match from_runs.remove(&i) {
                    Some(LookupResult::Found(_, u) | LookupResult::FoundWithBlob(_, u, _)) => {
                        Some(resolve(&v, &u))
                    }
                    _ => Some(v),
                },
                None => match from_runs.remove(&i) {
                    Some(LookupResult::Found(_, u) | LookupResult::FoundWithBlob(_, u, _)) => {
                        Some(u)
                    }
                    _ => None,
                },
            };
            out.push(value);
        }
        Ok(out)
    }

    /// Scans `[start, end)`, returning live key/value pairs in ascending key
    /// order. An empty `start` scans from the beginning, an empty `end` to
    /// the end.
    pub fn scan(&self, start: &[u8], end: &[u8]) -> Result<Vec<(Key, Value)>> {
        let (wb, runs, resolve) = {
            let inner = self.guard()?;
            (inner.wb.clone(), inner.collect_runs(), inner.config.resolve)
        };

        let in_range = |k: &[u8]| (start.is_empty() || k >= start) && (end.is_empty() || k < end);

        // Resolve per key, newest source first. Blob payloads are not
        // materialized by a scan, so spans and raw blobs both collapse to
        // unit.
        let mut acc: BTreeMap<Key, Entry<()>> = BTreeMap::new();
        for (k, e) in wb.iter() {
            if in_range(k) {
                acc.insert(k.clone(), e.clone().map_blob(|_| ()));
            }
        }
        for run in &runs {
            let mut cursor = run.cursor()?;
            while let Some((k, e)) = cursor.next()? {
                if !in_range(&k) {
                    continue;
                }
                let older = e.map_blob(|_| ());
                let resolved = match acc.remove(&k) {
                    Some(newer) => newer.combine(older, resolve),
                    None => older,
                };
                acc.insert(k, resolved);
            }
        }

        Ok(acc
            .into_iter()
            .filter_map(|(k, e)| match e {
                Entry::Insert(v) | Entry::InsertWithBlob(v, _) | Entry::Mupdate(v) => Some((k, v)),
                Entry::Delete => None,
            })
            .collect())
    }

    /// Materializes the table's full logical mapping. Intended for tests and
    /// debugging — this walks every run.
    pub fn logical_contents(&self) -> Result<BTreeMap<Key, Value>> {
        Ok(self.scan(b"", b"")?.into_iter().collect())
    }
}
