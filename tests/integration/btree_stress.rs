//! Multiple threads hammering one shared-mode index with a convergence
//! policy: draw a key, insert it, and treat `Duplicate` as "remove that same
//! key instead". The race is the point — another thread may have removed or
//! re-inserted the key in between — and the tree must come out structurally
//! intact whatever interleaving happens.

use std::convert::TryInto;
use std::sync::Arc;
use std::thread;

use ceiba::{CreateOptions, Index, KeyComparator, OpenOptions};
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use tempfile::tempdir;
use tracing_subscriber::EnvFilter;

const ORDER: u16 = 7;
const MAX_KEY: i32 = 5_000;
const WORKERS: usize = 4;
const OPS_PER_WORKER: usize = 25_000;
const SEED: u64 = 0x5eed_cafe;

fn comparator() -> Arc<dyn KeyComparator> {
    Arc::new(|a: &[u8], b: &[u8]| {
        let a = i32::from_be_bytes(a.try_into().expect("key width"));
        let b = i32::from_be_bytes(b.try_into().expect("key width"));
        a.cmp(&b)
    })
}

#[test]
fn concurrent_insert_remove_churn_keeps_the_tree_consistent() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .try_init();

    let dir = tempdir().unwrap();
    let path = dir.path().join("stress.db");
    {
        let index = Index::create(
            &path,
            comparator(),
            CreateOptions::new(ORDER, 4).shared(true),
        )
        .unwrap();
        assert!(index.close().is_okay());
    }

    let index = Arc::new(Index::open(&path, comparator(), OpenOptions::new()).unwrap());

    let mut handles = Vec::with_capacity(WORKERS);
    for worker in 0..WORKERS {
        let index = Arc::clone(&index);
        handles.push(thread::spawn(move || {
            let mut rng = ChaCha8Rng::seed_from_u64(SEED + worker as u64);
            for _ in 0..OPS_PER_WORKER {
                let key = rng.gen_range(0..MAX_KEY).to_be_bytes();
                let state = index.insert(&key);
                if state.is_duplicate() {
                    // the key may have been removed by another thread in the
                    // meantime; NotFound is an expected outcome of the race
                    let removed = index.remove(&key);
                    assert!(
                        removed.is_okay() || removed.is_not_found(),
                        "remove after duplicate came back fatal"
                    );
                } else {
                    assert!(state.is_okay(), "insert came back fatal");
                }
            }
        }));
    }
    for handle in handles {
        handle.join().expect("worker panicked");
    }

    // all invariants hold after the churn and only drawn keys remain
    assert!(index.verify().is_okay());
    let report = index.check().unwrap();
    assert!(report.record_count <= MAX_KEY as u64);

    let mut cursor = index.cursor();
    let mut previous: Option<i32> = None;
    let mut seen = 0u64;
    while let Some(rec) = cursor.next().unwrap() {
        let key = i32::from_be_bytes(rec[..4].try_into().unwrap());
        assert!((0..MAX_KEY).contains(&key), "key {key} outside drawn range");
        if let Some(prev) = previous {
            assert!(prev < key, "cursor out of order: {prev} then {key}");
        }
        previous = Some(key);
        seen += 1;
    }
    assert_eq!(seen, report.record_count);

    // membership probes are stable once the churn has stopped
    for key in [0i32, 1, MAX_KEY / 2, MAX_KEY - 1] {
        let (first, _) = index.find(&key.to_be_bytes());
        let (second, _) = index.find(&key.to_be_bytes());
        assert_eq!(first.is_okay(), second.is_okay());
    }
}

#[test]
fn process_mode_threads_share_one_handle() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("stress_local.db");
    let index = Arc::new(
        Index::create(&path, comparator(), CreateOptions::new(ORDER, 4)).unwrap(),
    );

    let mut handles = Vec::new();
    for worker in 0..2 {
        let index = Arc::clone(&index);
        handles.push(thread::spawn(move || {
            let mut rng = ChaCha8Rng::seed_from_u64(SEED ^ worker as u64);
            for _ in 0..5_000 {
                let key = rng.gen_range(0..500i32).to_be_bytes();
                if index.insert(&key).is_duplicate() {
                    let removed = index.remove(&key);
                    assert!(removed.is_okay() || removed.is_not_found());
                }
            }
        }));
    }
    for handle in handles {
        handle.join().expect("worker panicked");
    }
    assert!(index.verify().is_okay());
}
