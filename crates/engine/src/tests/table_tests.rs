use anyhow::Result;

use super::{new_session, small_config};
use crate::{Config, Error};

// -------------------- Round-trips --------------------

#[test]
fn insert_then_lookup() -> Result<()> {
    let (_dir, session) = new_session();
    let table = session.new_table(Config::new())?;

    table.insert(b"k1", b"v1")?;
    table.insert(b"k2", b"v2")?;

    assert_eq!(table.lookup(b"k1")?, Some(b"v1".to_vec()));
    assert_eq!(table.lookup(b"k2")?, Some(b"v2".to_vec()));
    assert_eq!(table.lookup(b"k3")?, None);
    Ok(())
}

#[test]
fn delete_hides_an_insert() -> Result<()> {
    let (_dir, session) = new_session();
    let table = session.new_table(Config::new())?;

    table.insert(b"a", b"1")?;
    table.delete(b"a")?;
    assert_eq!(table.lookup(b"a")?, None);
    Ok(())
}

#[test]
fn updates_survive_a_flush() -> Result<()> {
    let (_dir, session) = new_session();
    let table = session.new_table(Config::new())?;

    table.insert(b"k", b"flushed")?;
    table.delete(b"gone")?;
    table.flush()?;

    assert_eq!(table.write_buffer_entries(), 0);
    assert_eq!(table.runs_at_level(0), 1);
    assert_eq!(table.lookup(b"k")?, Some(b"flushed".to_vec()));
    assert_eq!(table.lookup(b"gone")?, None);
    Ok(())
}

// -------------------- Mupserts --------------------

fn append_resolve(newer: &[u8], older: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(older.len() + newer.len());
    out.extend_from_slice(older);
    out.extend_from_slice(newer);
    out
}

#[test]
fn mupsert_chain_concatenates() -> Result<()> {
    let (_dir, session) = new_session();
    let table = session.new_table(Config::new().resolve(append_resolve))?;

    table.mupsert(b"k", b"x")?;
    table.mupsert(b"k", b"y")?;
    table.mupsert(b"k", b"z")?;

    assert_eq!(table.lookup(b"k")?, Some(b"xyz".to_vec()));
    Ok(())
}

#[test]
fn mupsert_chain_spans_write_buffer_and_runs() -> Result<()> {
    let (_dir, session) = new_session();
    let table = session.new_table(Config::new().resolve(append_resolve))?;

    table.insert(b"k", b"base")?;
    table.flush()?;
    table.mupsert(b"k", b"-1")?;
    table.flush()?;
    table.mupsert(b"k", b"-2")?;

    // base (run) ⊕ -1 (run) ⊕ -2 (write buffer), oldest first.
    assert_eq!(table.lookup(b"k")?, Some(b"base-1-2".to_vec()));
    Ok(())
}

#[test]
fn mupsert_on_a_missing_key_is_an_insert() -> Result<()> {
    let (_dir, session) = new_session();
    let table = session.new_table(Config::new())?;

    table.mupsert(b"fresh", b"value")?;
    assert_eq!(table.lookup(b"fresh")?, Some(b"value".to_vec()));
    Ok(())
}

#[test]
fn mupsert_grouping_does_not_matter() -> Result<()> {
    // The same three updates, resolved through different flush boundaries,
    // must produce the same logical value.
    let updates: [&[u8]; 3] = [b"u1", b"u2", b"u3"];

    let mut outcomes = Vec::new();
    for flush_after in 0..3usize {
        let (_dir, session) = new_session();
        let table = session.new_table(Config::new().resolve(append_resolve))?;
        for (i, u) in updates.iter().enumerate() {
            table.mupsert(b"k", u)?;
            if i == flush_after {
                table.flush()?;
            }
        }
        outcomes.push(table.lookup(b"k")?);
    }
    assert_eq!(outcomes[0], Some(b"u1u2u3".to_vec()));
    assert!(outcomes.iter().all(|o| o == &outcomes[0]));
    Ok(())
}

// -------------------- Blobs --------------------

#[test]
fn blob_inserts_resolve_to_their_value() -> Result<()> {
    let (_dir, session) = new_session();
    let table = session.new_table(Config::new())?;

    table.insert_with_blob(b"k", b"inline", b"out-of-line payload")?;
    assert_eq!(table.lookup(b"k")?, Some(b"inline".to_vec()));

    table.flush()?;
    assert_eq!(table.lookup(b"k")?, Some(b"inline".to_vec()));
    Ok(())
}

// -------------------- Batched lookups --------------------

#[test]
fn lookup_batch_mixes_buffer_and_run_hits() -> Result<()> {
    let (_dir, session) = new_session();
    let table = session.new_table(Config::new())?;

    table.insert(b"flushed", b"f")?;
    table.insert(b"shadowed", b"old")?;
    table.flush()?;
    table.insert(b"buffered", b"b")?;
    table.insert(b"shadowed", b"new")?;
    table.delete(b"flushed")?;

    let keys = vec![
        b"flushed".to_vec(),
        b"buffered".to_vec(),
        b"shadowed".to_vec(),
        b"missing".to_vec(),
    ];
    let results = table.lookup_batch(&keys)?;
    assert_eq!(
        results,
        vec![
            None,
            Some(b"b".to_vec()),
            Some(b"new".to_vec()),
            None,
        ]
    );
    Ok(())
}

// -------------------- Scans --------------------

#[test]
fn scan_merges_all_sources_in_order() -> Result<()> {
    let (_dir, session) = new_session();
    let table = session.new_table(small_config())?;

    for i in (0..20u32).rev() {
        table.insert(format!("key-{i:02}").as_bytes(), b"v")?;
    }
    table.delete(b"key-05")?;
    table.insert(b"key-07", b"updated")?;

    let all = table.scan(b"", b"")?;
    assert_eq!(all.len(), 19, "one key was deleted");
    let keys: Vec<&[u8]> = all.iter().map(|(k, _)| k.as_slice()).collect();
    let mut sorted = keys.clone();
    sorted.sort();
    assert_eq!(keys, sorted, "scan must ascend");
    assert!(!keys.contains(&&b"key-05"[..]));

    let bounded = table.scan(b"key-03", b"key-10")?;
    let bounded_keys: Vec<&[u8]> = bounded.iter().map(|(k, _)| k.as_slice()).collect();
    assert_eq!(
        bounded_keys,
        vec![
            &b"key-03"[..],
            b"key-04",
            b"key-06",
            b"key-07",
            b"key-08",
            b"key-09",
        ]
    );
    assert_eq!(
        bounded.iter().find(|(k, _)| k == b"key-07").map(|(_, v)| v.as_slice()),
        Some(&b"updated"[..])
    );
    Ok(())
}

// -------------------- Limits --------------------

#[test]
fn oversized_keys_and_values_are_rejected() -> Result<()> {
    let (_dir, session) = new_session();
    let table = session.new_table(Config::new())?;

    let big_key = vec![b'k'; crate::MAX_KEY_SIZE + 1];
    assert!(matches!(
        table.insert(&big_key, b"v"),
        Err(Error::KeyTooLarge(_))
    ));

    let big_value = vec![b'v'; crate::MAX_VALUE_SIZE + 1];
    assert!(matches!(
        table.insert(b"k", &big_value),
        Err(Error::ValueTooLarge(_))
    ));
    assert!(matches!(
        table.insert_with_blob(b"k", b"v", &big_value),
        Err(Error::ValueTooLarge(_))
    ));

    // Nothing was applied.
    assert_eq!(table.lookup(b"k")?, None);
    Ok(())
}

#[test]
fn large_values_inside_the_limit_round_trip() -> Result<()> {
    let (_dir, session) = new_session();
    let table = session.new_table(Config::new())?;

    // Far past one page: exercises multi-page entries end to end.
    let value = vec![0xa5; 100_000];
    table.insert(b"big", &value)?;
    table.flush()?;
    assert_eq!(table.lookup(b"big")?, Some(value));
    Ok(())
}
