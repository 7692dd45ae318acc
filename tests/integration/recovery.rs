use std::convert::TryInto;
use std::fs::OpenOptions as FsOpenOptions;
use std::io::{Read, Seek, SeekFrom, Write};
use std::sync::Arc;

use ceiba::{CeibaError, CreateOptions, Index, KeyComparator, OpenOptions};
use tempfile::tempdir;

fn comparator() -> Arc<dyn KeyComparator> {
    Arc::new(|a: &[u8], b: &[u8]| {
        let a = u32::from_be_bytes(a.try_into().expect("key width"));
        let b = u32::from_be_bytes(b.try_into().expect("key width"));
        a.cmp(&b)
    })
}

fn populate(path: &std::path::Path, keys: u32) {
    let index = Index::create(path, comparator(), CreateOptions::new(5, 4)).unwrap();
    for key in 0..keys {
        assert!(index.insert(&key.to_be_bytes()).is_okay());
    }
    assert!(index.close().is_okay());
}

#[test]
fn recovery_reclaims_leaked_pages() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("leak.db");
    populate(&path, 200);

    // simulate a crash between allocation and linking: pages claimed from
    // the allocator but never referenced by the tree
    {
        let index = Index::open(&path, comparator(), OpenOptions::new()).unwrap();
        for _ in 0..3 {
            index.tree().pager().allocate().unwrap();
        }
        assert!(index.close().is_okay());
    }

    {
        let index = Index::open(&path, comparator(), OpenOptions::new()).unwrap();
        let before = index.tree().pager().free_page_count();
        assert!(index.close().is_okay());
        assert_eq!(before, 0, "leaked pages must not be on the free list yet");
    }

    let index = Index::open(&path, comparator(), OpenOptions::new().recover(true)).unwrap();
    assert!(index.verify().is_okay());
    // one reclaimed page is carved out to host the free-list chain itself
    assert!(
        index.tree().pager().free_page_count() >= 2,
        "recovery must reclaim the leaked pages"
    );
    // and the data survived
    let report = index.check().unwrap();
    assert_eq!(report.record_count, 200);
    for key in 0..200u32 {
        let (state, _) = index.find(&key.to_be_bytes());
        assert!(state.is_okay(), "missing key {key} after recovery");
    }
}

#[test]
fn recovery_rejects_a_corrupted_node_page() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("corrupt.db");
    populate(&path, 100);

    // find the page size from the file, then tear a node page in the middle
    let page_size = {
        let index = Index::open(&path, comparator(), OpenOptions::new()).unwrap();
        let size = index.tree().pager().page_size();
        assert!(index.close().is_okay());
        size as u64
    };
    {
        let mut file = FsOpenOptions::new()
            .read(true)
            .write(true)
            .open(&path)
            .unwrap();
        file.seek(SeekFrom::Start(page_size + page_size / 2)).unwrap();
        let mut byte = [0u8; 1];
        file.read_exact(&mut byte).unwrap();
        file.seek(SeekFrom::Start(page_size + page_size / 2)).unwrap();
        file.write_all(&[byte[0] ^ 0xFF]).unwrap();
        file.sync_all().unwrap();
    }

    let result = Index::open(&path, comparator(), OpenOptions::new().recover(true));
    assert!(matches!(result, Err(CeibaError::Corruption(_))));

    // a trusting open succeeds, but touching the torn page is fatal
    let index = Index::open(&path, comparator(), OpenOptions::new()).unwrap();
    let mut hit_fatal = false;
    for key in 0..100u32 {
        let (state, _) = index.find(&key.to_be_bytes());
        if state.is_fatal() {
            hit_fatal = true;
            break;
        }
    }
    assert!(hit_fatal, "lookups never touched the corrupted page");
}

#[test]
fn flush_persists_the_free_list_across_reopen() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("freelist.db");
    {
        let index = Index::create(&path, comparator(), CreateOptions::new(5, 4)).unwrap();
        for key in 0..300u32 {
            assert!(index.insert(&key.to_be_bytes()).is_okay());
        }
        // deleting most keys merges nodes and frees pages
        for key in 0..290u32 {
            assert!(index.remove(&key.to_be_bytes()).is_okay());
        }
        assert!(index.tree().pager().free_page_count() > 0);
        assert!(index.close().is_okay());
    }
    let index = Index::open(&path, comparator(), OpenOptions::new()).unwrap();
    assert!(index.tree().pager().free_page_count() > 0);
    assert!(index.verify().is_okay());
    let report = index.check().unwrap();
    assert_eq!(report.record_count, 10);
}
