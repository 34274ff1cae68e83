use writebuffer::{BlobSpan, Entry};

use crate::format::PAGE_SIZE;
use crate::page::{page_extent, Page, PageAcc};

fn span(offset: u64, len: u32) -> BlobSpan {
    BlobSpan { offset, len }
}

// -------------------- Accumulation --------------------

#[test]
fn accepts_until_full() {
    let mut acc = PageAcc::new(0);
    let mut accepted = 0usize;
    for i in 0..1000u32 {
        let key = format!("key-{i:06}");
        let entry = Entry::Insert(vec![b'v'; 12]);
        if !acc.try_add(key.as_bytes(), &entry) {
            break;
        }
        accepted += 1;
        assert!(
            acc.current_size() <= PAGE_SIZE,
            "a multi-entry page never exceeds one page"
        );
    }
    assert!(accepted > 100, "small entries should pack densely");
    assert_eq!(acc.build().len(), PAGE_SIZE);
}

#[test]
fn rejects_key_with_different_top_bits() {
    // Precision 8: the bucket is the first key byte.
    let mut acc = PageAcc::new(8);
    assert!(acc.try_add(b"apple", &Entry::Insert(b"1".to_vec())));
    assert!(!acc.try_add(b"banana", &Entry::Insert(b"2".to_vec())));
    // Same first byte still fits.
    assert!(acc.try_add(b"avocado", &Entry::Insert(b"3".to_vec())));
}

#[test]
fn single_oversized_entry_is_accepted() {
    let mut acc = PageAcc::new(10);
    let value = vec![0xab; 10_000];
    assert!(acc.try_add(b"big", &Entry::Insert(value)));
    // Nothing else fits next to it.
    assert!(!acc.try_add(b"bigger", &Entry::Insert(b"x".to_vec())));

    let bytes = acc.build();
    assert_eq!(bytes.len() % PAGE_SIZE, 0);
    assert_eq!(bytes.len(), 3 * PAGE_SIZE);
    assert_eq!(page_extent(&bytes).unwrap(), 3 * PAGE_SIZE);
}

#[test]
#[should_panic(expected = "cannot serialize an empty page")]
fn empty_page_does_not_serialize() {
    PageAcc::new(0).build();
}

// -------------------- Round-trips --------------------

#[test]
fn mixed_operations_round_trip() {
    let rows: Vec<(&[u8], Entry<BlobSpan>)> = vec![
        (b"a", Entry::Insert(b"alpha".to_vec())),
        (b"b", Entry::InsertWithBlob(b"beta".to_vec(), span(0, 42))),
        (b"c", Entry::Mupdate(b"gamma".to_vec())),
        (b"d", Entry::Delete),
        (b"e", Entry::InsertWithBlob(b"eps".to_vec(), span(42, 7))),
    ];

    let mut acc = PageAcc::new(0);
    for (key, entry) in &rows {
        assert!(acc.try_add(key, entry));
    }
    let bytes = acc.build();
    assert_eq!(bytes.len(), PAGE_SIZE);

    let page = Page::new(&bytes).unwrap();
    assert_eq!(page.num_entries(), rows.len());
    assert_eq!(page.num_blobs(), 2);
    for (i, (key, entry)) in rows.iter().enumerate() {
        assert_eq!(page.key(i), *key);
        assert_eq!(&page.entry(i).unwrap(), entry);
    }

    // The span array is keyed by blob rank, not entry index.
    assert_eq!(page.blob_span(1), Some(span(0, 42)));
    assert_eq!(page.blob_span(4), Some(span(42, 7)));
    assert_eq!(page.blob_span(0), None);
}

#[test]
fn binary_search_finds_each_key() {
    let mut acc = PageAcc::new(0);
    let keys: Vec<String> = (0..50).map(|i| format!("key-{i:04}")).collect();
    for key in &keys {
        assert!(acc.try_add(key.as_bytes(), &Entry::Insert(b"v".to_vec())));
    }
    let bytes = acc.build();
    let page = Page::new(&bytes).unwrap();

    for (i, key) in keys.iter().enumerate() {
        assert_eq!(page.search(key.as_bytes()), Some(i));
    }
    assert_eq!(page.search(b"key-0000\0"), None);
    assert_eq!(page.search(b"zzz"), None);
    assert_eq!(page.search(b""), None);
}

#[test]
fn oversized_value_round_trips() {
    let value = vec![0x5a; 9_500];
    let mut acc = PageAcc::new(4);
    assert!(acc.try_add(b"huge", &Entry::Insert(value.clone())));
    let bytes = acc.build();

    let page = Page::new(&bytes).unwrap();
    assert_eq!(page.num_entries(), 1);
    assert_eq!(page.total_size(), bytes.len());
    assert_eq!(page.entry(0).unwrap(), Entry::Insert(value));
}

#[test]
fn bitmaps_cross_word_boundaries() {
    // 70 entries: the blob bitmap needs two words, the crumbmap three.
    let mut acc = PageAcc::new(0);
    let mut expected: Vec<Entry<BlobSpan>> = Vec::new();
    for i in 0..70u32 {
        let key = format!("k{i:04}");
        let entry: Entry<BlobSpan> = match i % 4 {
            0 => Entry::Insert(b"i".to_vec()),
            1 => Entry::InsertWithBlob(b"b".to_vec(), span(u64::from(i), i)),
            2 => Entry::Mupdate(b"m".to_vec()),
            _ => Entry::Delete,
        };
        assert!(acc.try_add(key.as_bytes(), &entry));
        expected.push(entry);
    }

    let bytes = acc.build();
    let page = Page::new(&bytes).unwrap();
    assert_eq!(page.num_entries(), 70);
    for (i, entry) in expected.iter().enumerate() {
        assert_eq!(&page.entry(i).unwrap(), entry, "entry {i}");
    }
}

#[test]
fn empty_values_and_empty_key() {
    let mut acc = PageAcc::new(0);
    assert!(acc.try_add(b"", &Entry::Insert(Vec::new())));
    assert!(acc.try_add(b"k", &Entry::Delete));
    let bytes = acc.build();
    let page = Page::new(&bytes).unwrap();
    assert_eq!(page.key(0), b"");
    assert_eq!(page.entry(0).unwrap(), Entry::Insert(Vec::new()));
    assert_eq!(page.entry(1).unwrap(), Entry::Delete);
}

// -------------------- Corruption --------------------

#[test]
fn decode_rejects_truncated_page() {
    assert!(Page::new(&[0u8; 100]).is_err());
    assert!(page_extent(&[0u8; 100]).is_err());
}

#[test]
fn decode_rejects_zero_entry_page() {
    let zeros = vec![0u8; PAGE_SIZE];
    assert!(Page::new(&zeros).is_err());
}

#[test]
fn decode_rejects_mangled_directory() {
    let mut acc = PageAcc::new(0);
    assert!(acc.try_add(b"a", &Entry::Insert(b"1".to_vec())));
    assert!(acc.try_add(b"b", &Entry::Insert(b"2".to_vec())));
    let mut bytes = acc.build();

    // Claim a key-offsets offset that does not match the directory layout.
    bytes[4] = 0xff;
    bytes[5] = 0x0f;
    assert!(Page::new(&bytes).is_err());
}
