use std::convert::TryInto;
use std::sync::Arc;

use ceiba::{CeibaError, CreateOptions, FatalHook, Index, KeyComparator, OpenOptions};
use parking_lot::Mutex;
use tempfile::tempdir;

fn comparator() -> Arc<dyn KeyComparator> {
    Arc::new(|a: &[u8], b: &[u8]| {
        let a = u32::from_be_bytes(a.try_into().expect("key width"));
        let b = u32::from_be_bytes(b.try_into().expect("key width"));
        a.cmp(&b)
    })
}

/// Records every (operation, error) pair the engine reports.
fn recording_hook() -> (FatalHook, Arc<Mutex<Vec<String>>>) {
    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&seen);
    let hook: FatalHook = Arc::new(move |operation, err| {
        sink.lock().push(format!("{operation}: {err}"));
    });
    (hook, seen)
}

#[test]
fn opening_a_nonexistent_path_reports_an_io_fatal() {
    let dir = tempdir().unwrap();
    let (hook, seen) = recording_hook();
    let result = Index::open(
        dir.path().join("missing.db"),
        comparator(),
        OpenOptions::new().fatal_hook(hook),
    );
    // an absent file is an I/O failure, never Duplicate or NotFound
    assert!(matches!(result, Err(CeibaError::Io(_))));
    let seen = seen.lock();
    assert_eq!(seen.len(), 1);
    assert!(seen[0].starts_with("open: I/O"));
}

#[test]
fn degenerate_order_is_an_invalid_parameter() {
    let dir = tempdir().unwrap();
    let (hook, seen) = recording_hook();
    let result = Index::create(
        dir.path().join("bad.db"),
        comparator(),
        CreateOptions::new(2, 4).fatal_hook(hook),
    );
    assert!(matches!(result, Err(CeibaError::Invalid(_))));
    assert_eq!(seen.lock().len(), 1);
}

#[test]
fn mutating_a_read_only_handle_is_fatal_and_hooked() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("ro.db");
    {
        let index = Index::create(&path, comparator(), CreateOptions::new(7, 4)).unwrap();
        assert!(index.insert(&1u32.to_be_bytes()).is_okay());
        assert!(index.close().is_okay());
    }
    let (hook, seen) = recording_hook();
    let index = Index::open(
        &path,
        comparator(),
        OpenOptions::new().read_only(true).fatal_hook(hook),
    )
    .unwrap();

    let state = index.insert(&2u32.to_be_bytes());
    assert!(matches!(state, ceiba::State::Fatal(CeibaError::Invalid(_))));
    let state = index.remove(&1u32.to_be_bytes());
    assert!(state.is_fatal());
    assert_eq!(seen.lock().len(), 2);

    // reads still work and are never routed to the hook
    let (state, record) = index.find(&1u32.to_be_bytes());
    assert!(state.is_okay());
    assert_eq!(record, Some(1u32.to_be_bytes().to_vec()));
    let (state, _) = index.find(&9u32.to_be_bytes());
    assert!(state.is_not_found());
    assert_eq!(seen.lock().len(), 2);
}

#[test]
fn wrong_key_width_is_an_invalid_parameter() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("width.db");
    let (hook, seen) = recording_hook();
    let index = Index::create(
        &path,
        comparator(),
        CreateOptions::new(7, 4).fatal_hook(hook),
    )
    .unwrap();
    assert!(index.insert(&[1u8, 2, 3]).is_fatal());
    let (state, _) = index.find(&[1u8, 2, 3, 4, 5]);
    assert!(state.is_fatal());
    assert_eq!(seen.lock().len(), 2);
}

#[test]
fn expected_outcomes_never_reach_the_hook() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("quiet.db");
    let (hook, seen) = recording_hook();
    let index = Index::create(
        &path,
        comparator(),
        CreateOptions::new(7, 4).fatal_hook(hook),
    )
    .unwrap();
    assert!(index.insert(&5u32.to_be_bytes()).is_okay());
    assert!(index.insert(&5u32.to_be_bytes()).is_duplicate());
    assert!(index.remove(&6u32.to_be_bytes()).is_not_found());
    let (state, _) = index.find(&6u32.to_be_bytes());
    assert!(state.is_not_found());
    assert!(seen.lock().is_empty());
}
