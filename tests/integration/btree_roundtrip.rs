use std::convert::TryInto;
use std::sync::Arc;

use ceiba::{CreateOptions, Index, KeyComparator, OpenOptions};
use rand::seq::SliceRandom;
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;
use tempfile::tempdir;

const KEY_COUNT: u32 = 1_000;
const SEED: u64 = 0x5eed_0001;

fn comparator() -> Arc<dyn KeyComparator> {
    Arc::new(|a: &[u8], b: &[u8]| {
        let a = u32::from_be_bytes(a.try_into().expect("key width"));
        let b = u32::from_be_bytes(b.try_into().expect("key width"));
        a.cmp(&b)
    })
}

fn record(key: u32) -> Vec<u8> {
    let mut rec = Vec::with_capacity(12);
    rec.extend_from_slice(&key.to_be_bytes());
    rec.extend_from_slice(&u64::from(key).wrapping_mul(0x9E37_79B9).to_be_bytes());
    rec
}

#[test]
fn close_and_reopen_yields_the_same_key_set() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("roundtrip.db");

    let mut keys: Vec<u32> = (0..KEY_COUNT).collect();
    keys.shuffle(&mut ChaCha8Rng::seed_from_u64(SEED));

    {
        let index = Index::create(
            &path,
            comparator(),
            CreateOptions::new(7, 4).record_size(12),
        )
        .unwrap();
        for &key in &keys {
            assert!(index.insert(&record(key)).is_okay(), "insert {key}");
        }
        assert!(index.close().is_okay());
    }

    let index = Index::open(&path, comparator(), OpenOptions::new()).unwrap();
    assert!(index.verify().is_okay());
    let report = index.check().unwrap();
    assert_eq!(report.record_count, u64::from(KEY_COUNT));

    // every inserted key reads back with its record, independent of the
    // insertion order
    for key in 0..KEY_COUNT {
        let (state, found) = index.find(&key.to_be_bytes());
        assert!(state.is_okay(), "missing key {key}");
        assert_eq!(found, Some(record(key)));
    }
    let (state, found) = index.find(&KEY_COUNT.to_be_bytes());
    assert!(state.is_not_found());
    assert!(found.is_none());

    // the cursor walks exactly the key space in order
    let mut cursor = index.cursor();
    let mut expected = 0u32;
    while let Some(rec) = cursor.next().unwrap() {
        let key = u32::from_be_bytes(rec[..4].try_into().unwrap());
        assert_eq!(key, expected);
        expected += 1;
    }
    assert_eq!(expected, KEY_COUNT);
}

#[test]
fn reopen_read_only_serves_lookups() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("ro.db");
    {
        let index = Index::create(&path, comparator(), CreateOptions::new(5, 4).record_size(12))
            .unwrap();
        for key in 0..100u32 {
            assert!(index.insert(&record(key)).is_okay());
        }
        assert!(index.close().is_okay());
    }
    let index = Index::open(
        &path,
        comparator(),
        OpenOptions::new().read_only(true).recover(true),
    )
    .unwrap();
    let (state, found) = index.find(&42u32.to_be_bytes());
    assert!(state.is_okay());
    assert_eq!(found, Some(record(42)));
    assert!(index.insert(&record(1000)).is_fatal());
}
