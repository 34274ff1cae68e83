use anyhow::Result;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::sync::Arc;
use tempfile::tempdir;

use writebuffer::{concat_resolve, Blob, Entry, WriteBuffer};

use super::{build_run, insert, mupdate};
use crate::{Merge, MergeKind, MergeStatus, Run, RunParams, RunPaths};

fn run_merge_to_completion(merge: &mut Merge, step: usize) -> Result<(u64, Arc<Run>)> {
    let mut total = 0u64;
    loop {
        let (done, status) = merge.steps(step)?;
        total += done as u64;
        if let MergeStatus::Complete(run) = status {
            return Ok((total, run));
        }
        assert!(done > 0, "an unfinished merge must make progress");
    }
}

// -------------------- Basic merging --------------------

#[test]
fn merge_requires_two_inputs() -> Result<()> {
    let dir = tempdir()?;
    let single = build_run(dir.path(), 0, &[(b"a", insert(b"1"))]);

    let none = Merge::new(
        RunPaths::new(dir.path(), 100),
        vec![],
        MergeKind::MidLevel,
        concat_resolve,
        RunParams::default(),
    )?;
    assert!(none.is_none());

    let one = Merge::new(
        RunPaths::new(dir.path(), 101),
        vec![single],
        MergeKind::MidLevel,
        concat_resolve,
        RunParams::default(),
    )?;
    assert!(one.is_none());
    Ok(())
}

#[test]
fn disjoint_runs_merge_to_their_union() -> Result<()> {
    let dir = tempdir()?;
    let newer = build_run(dir.path(), 0, &[(b"a", insert(b"1")), (b"c", insert(b"3"))]);
    let older = build_run(dir.path(), 1, &[(b"b", insert(b"2")), (b"d", insert(b"4"))]);

    let mut merge = Merge::new(
        RunPaths::new(dir.path(), 2),
        vec![newer, older],
        MergeKind::MidLevel,
        concat_resolve,
        RunParams::default(),
    )?
    .expect("two inputs merge");
    let (steps, merged) = run_merge_to_completion(&mut merge, 1)?;

    assert_eq!(steps, 4);
    assert_eq!(merged.num_entries(), 4);
    for (key, value) in [(b"a", b"1"), (b"b", b"2"), (b"c", b"3"), (b"d", b"4")] {
        assert_eq!(merged.get(key)?, Some(Entry::Insert(value.to_vec())));
    }
    Ok(())
}

#[test]
fn earlier_inputs_shadow_later_ones() -> Result<()> {
    let dir = tempdir()?;
    let newer = build_run(dir.path(), 0, &[(b"k", insert(b"new"))]);
    let older = build_run(dir.path(), 1, &[(b"k", insert(b"old"))]);

    let mut merge = Merge::new(
        RunPaths::new(dir.path(), 2),
        vec![newer, older],
        MergeKind::MidLevel,
        concat_resolve,
        RunParams::default(),
    )?
    .expect("two inputs merge");
    let (steps, merged) = run_merge_to_completion(&mut merge, 10)?;

    // Both input entries were consumed, one survived.
    assert_eq!(steps, 2);
    assert_eq!(merged.num_entries(), 1);
    assert_eq!(merged.get(b"k")?, Some(Entry::Insert(b"new".to_vec())));
    Ok(())
}

#[test]
fn mupserts_fold_across_runs_in_age_order() -> Result<()> {
    let dir = tempdir()?;
    let r1 = build_run(dir.path(), 0, &[(b"k", mupdate(b"c"))]);
    let r2 = build_run(dir.path(), 1, &[(b"k", mupdate(b"b"))]);
    let r3 = build_run(dir.path(), 2, &[(b"k", insert(b"a"))]);

    let mut merge = Merge::new(
        RunPaths::new(dir.path(), 3),
        vec![r1, r2, r3],
        MergeKind::MidLevel,
        concat_resolve,
        RunParams::default(),
    )?
    .expect("three inputs merge");
    let (_, merged) = run_merge_to_completion(&mut merge, 2)?;

    assert_eq!(merged.get(b"k")?, Some(Entry::Insert(b"cba".to_vec())));
    Ok(())
}

#[test]
fn blobs_are_forwarded_into_the_output_blob_file() -> Result<()> {
    let dir = tempdir()?;
    let newer = build_run(
        dir.path(),
        0,
        &[(b"x", super::insert_with_blob(b"vx", b"blob-x"))],
    );
    let older = build_run(
        dir.path(),
        1,
        &[(b"y", super::insert_with_blob(b"vy", b"blob-y"))],
    );

    let mut merge = Merge::new(
        RunPaths::new(dir.path(), 2),
        vec![newer, older],
        MergeKind::MidLevel,
        concat_resolve,
        RunParams::default(),
    )?
    .expect("two inputs merge");
    let (_, merged) = run_merge_to_completion(&mut merge, 64)?;

    let Some(Entry::InsertWithBlob(value, span)) = merged.get(b"x")? else {
        panic!("blob entry expected");
    };
    assert_eq!(value, b"vx");
    assert_eq!(merged.read_blob(span)?, b"blob-x");

    let Some(Entry::InsertWithBlob(_, span)) = merged.get(b"y")? else {
        panic!("blob entry expected");
    };
    assert_eq!(merged.read_blob(span)?, b"blob-y");
    Ok(())
}

// -------------------- Tombstone elision --------------------

#[test]
fn last_level_merge_elides_deletes() -> Result<()> {
    let dir = tempdir()?;
    let newer = build_run(dir.path(), 0, &[(b"a", Entry::Delete), (b"b", insert(b"2"))]);
    let older = build_run(dir.path(), 1, &[(b"a", insert(b"1")), (b"c", Entry::Delete)]);

    let mut merge = Merge::new(
        RunPaths::new(dir.path(), 2),
        vec![Arc::clone(&newer), Arc::clone(&older)],
        MergeKind::LastLevel,
        concat_resolve,
        RunParams::default(),
    )?
    .expect("two inputs merge");
    let (steps, merged) = run_merge_to_completion(&mut merge, 3)?;

    // All four input entries were consumed, but only `b` survives.
    assert_eq!(steps, 4);
    assert_eq!(merged.num_entries(), 1);
    assert_eq!(merged.get(b"a")?, None);
    assert_eq!(merged.get(b"b")?, Some(Entry::Insert(b"2".to_vec())));
    assert_eq!(merged.get(b"c")?, None);
    Ok(())
}

#[test]
fn mid_level_merge_keeps_deletes() -> Result<()> {
    let dir = tempdir()?;
    let newer = build_run(dir.path(), 0, &[(b"a", Entry::Delete)]);
    let older = build_run(dir.path(), 1, &[(b"a", insert(b"1"))]);

    let mut merge = Merge::new(
        RunPaths::new(dir.path(), 2),
        vec![newer, older],
        MergeKind::MidLevel,
        concat_resolve,
        RunParams::default(),
    )?
    .expect("two inputs merge");
    let (_, merged) = run_merge_to_completion(&mut merge, 8)?;

    // The tombstone must persist to shadow anything deeper.
    assert_eq!(merged.get(b"a")?, Some(Entry::Delete));
    Ok(())
}

// -------------------- Step accounting --------------------

#[test]
fn steps_sum_to_the_total_input_entry_count() -> Result<()> {
    let dir = tempdir()?;
    let mut runs = Vec::new();
    for r in 0..4u64 {
        let mut wb = WriteBuffer::new();
        for i in 0..500u32 {
            // Every other key overlaps with the neighbouring run.
            let key = format!("key-{:06}", u32::try_from(r).unwrap() * 250 + i);
            wb.insert(key.into_bytes(), Entry::Insert(b"v".to_vec()), concat_resolve);
        }
        runs.push(Arc::new(Run::from_write_buffer(
            RunPaths::new(dir.path(), r),
            wb,
            RunParams::default(),
        )?));
    }
    let total_input: u64 = runs.iter().map(|r| r.num_entries()).sum();
    assert_eq!(total_input, 2_000);

    let mut merge = Merge::new(
        RunPaths::new(dir.path(), 10),
        runs,
        MergeKind::MidLevel,
        concat_resolve,
        RunParams::default(),
    )?
    .expect("four inputs merge");
    assert_eq!(merge.total_debt(), 2_000);

    let (steps, merged) = run_merge_to_completion(&mut merge, 100)?;
    assert_eq!(steps, total_input, "every input entry is counted exactly once");
    assert!(merged.num_entries() < total_input, "overlaps were resolved");

    // A completed merge reports completion again without consuming steps.
    let (done, status) = merge.steps(100)?;
    assert_eq!(done, 0);
    assert!(matches!(status, MergeStatus::Complete(_)));
    Ok(())
}

// -------------------- Cancellation --------------------

#[test]
fn closing_a_started_merge_removes_the_partial_output() -> Result<()> {
    let dir = tempdir()?;
    let mut runs = Vec::new();
    for r in 0..4u64 {
        let mut wb = WriteBuffer::new();
        for i in 0..500u32 {
            let key = format!("r{r}-key-{i:05}");
            wb.insert(key.into_bytes(), Entry::Insert(b"v".to_vec()), concat_resolve);
        }
        runs.push(Arc::new(Run::from_write_buffer(
            RunPaths::new(dir.path(), r),
            wb,
            RunParams::default(),
        )?));
    }

    let out_paths = RunPaths::new(dir.path(), 99);
    let mut merge = Merge::new(
        out_paths.clone(),
        runs.clone(),
        MergeKind::MidLevel,
        concat_resolve,
        RunParams::default(),
    )?
    .expect("four inputs merge");

    let (done, status) = merge.steps(100)?;
    assert_eq!(done, 100);
    assert!(matches!(status, MergeStatus::InProgress));

    merge.close();

    for path in out_paths.all() {
        assert!(!path.exists(), "{} must not remain", path.display());
    }
    // The inputs are intact and still readable.
    for run in &runs {
        for path in run.paths().all() {
            assert!(path.exists());
        }
        assert_eq!(
            run.get(format!("r{}-key-00000", run.run_id()).as_bytes())?,
            Some(Entry::Insert(b"v".to_vec()))
        );
    }
    Ok(())
}

// -------------------- Distributivity --------------------

/// Random buffers with overlapping keys, every operation kind represented.
fn random_buffers(seed: u64) -> Vec<WriteBuffer> {
    let mut rng = StdRng::seed_from_u64(seed);
    (0..3)
        .map(|_| {
            let mut wb = WriteBuffer::new();
            for _ in 0..100 {
                let key = format!("key-{:03}", rng.gen_range(0..120)).into_bytes();
                let entry: Entry<Blob> = match rng.gen_range(0..4) {
                    0 => Entry::Insert(vec![b'i'; rng.gen_range(1..40)]),
                    1 => Entry::InsertWithBlob(
                        vec![b'b'; rng.gen_range(1..20)],
                        vec![b'B'; rng.gen_range(1..200)],
                    ),
                    2 => Entry::Mupdate(vec![b'm'; rng.gen_range(1..20)]),
                    _ => Entry::Delete,
                };
                wb.insert(key, entry, concat_resolve);
            }
            wb
        })
        .collect()
}

/// Merging flushed runs and flushing the unioned buffers must produce the
/// same key/ops and blob files (the bloom filter may differ in size, never
/// shrinking).
fn assert_distributive(kind: MergeKind, seed: u64) -> Result<()> {
    let dir = tempdir()?;
    let buffers = random_buffers(seed);

    // Pipeline A: flush each buffer, then merge the runs.
    let runs: Vec<Arc<Run>> = buffers
        .iter()
        .enumerate()
        .map(|(i, wb)| {
            Ok(Arc::new(Run::from_write_buffer(
                RunPaths::new(dir.path(), i as u64),
                wb.clone(),
                RunParams::default(),
            )?))
        })
        .collect::<Result<_>>()?;
    let mut merge = Merge::new(
        RunPaths::new(dir.path(), 10),
        runs,
        kind,
        concat_resolve,
        RunParams::default(),
    )?
    .expect("three inputs merge");
    let (_, merged) = run_merge_to_completion(&mut merge, 37)?;

    // Pipeline B: union the buffers (newest first), then flush once.
    let mut unioned = WriteBuffer::union(buffers, concat_resolve);
    if kind == MergeKind::LastLevel {
        let map = unioned.into_map();
        unioned = WriteBuffer::from_map(
            map.into_iter().filter(|(_, e)| !e.is_delete()).collect(),
        );
    }
    let direct = Run::from_write_buffer(
        RunPaths::new(dir.path(), 11),
        unioned,
        RunParams::default(),
    )?;

    assert_eq!(merged.num_entries(), direct.num_entries());
    assert_eq!(
        std::fs::read(merged.paths().keyops())?,
        std::fs::read(direct.paths().keyops())?,
        "key/ops files must be byte-identical"
    );
    assert_eq!(
        std::fs::read(merged.paths().blobs())?,
        std::fs::read(direct.paths().blobs())?,
        "blob files must be byte-identical"
    );
    assert_eq!(
        std::fs::read(merged.paths().index())?,
        std::fs::read(direct.paths().index())?,
        "identical pages must index identically"
    );

    // The merged filter was sized from the input sum: at least as large.
    let merged_filter = std::fs::metadata(merged.paths().filter())?.len();
    let direct_filter = std::fs::metadata(direct.paths().filter())?.len();
    assert!(merged_filter >= direct_filter);
    Ok(())
}

#[test]
fn merge_distributes_over_flush_mid_level() -> Result<()> {
    for seed in [1, 7, 42] {
        assert_distributive(MergeKind::MidLevel, seed)?;
    }
    Ok(())
}

#[test]
fn merge_distributes_over_flush_last_level() -> Result<()> {
    for seed in [3, 9, 1234] {
        assert_distributive(MergeKind::LastLevel, seed)?;
    }
    Ok(())
}
