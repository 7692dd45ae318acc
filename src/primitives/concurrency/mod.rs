#![allow(unsafe_code)]

//! Latch tables coordinating concurrent access to tree pages.
//!
//! The B-tree core takes latches through the [`LatchTable`] trait and never
//! sees which implementation backs them. [`ProcessLatches`] keeps a table of
//! per-page RwLocks and protects a single process. [`SharedFileLatches`]
//! layers OS file range locks on a sidecar lock file over the in-process
//! table, extending the same discipline to every cooperating process.
//!
//! Within one process all threads must share one handle (and therefore one
//! latch table); file locks arbitrate between processes, not between
//! independent tables in the same process.

use std::collections::HashMap;
use std::fs::{File, OpenOptions};
use std::io;
use std::path::Path;
use std::sync::Arc;

use parking_lot::{
    lock_api::{ArcMutexGuard, ArcRwLockReadGuard, ArcRwLockWriteGuard},
    Mutex, RawMutex, RawRwLock, RwLock,
};

use crate::types::{CeibaError, PageId, Result};

/// Access mode requested for a page latch.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum LatchMode {
    /// Concurrent readers allowed.
    Shared,
    /// Single holder; required for any page mutation.
    Exclusive,
}

/// Issues page latches and the allocation lock.
pub trait LatchTable: Send + Sync + 'static {
    /// Blocks until the requested latch on `page` is granted.
    fn latch(&self, page: PageId, mode: LatchMode) -> Result<Latch>;

    /// Blocks until the free-list allocation lock is granted. Distinct from
    /// every page latch so allocation traffic never serializes unrelated
    /// structural operations.
    fn allocation_lock(&self) -> Result<Latch>;
}

enum ProcessGuard {
    Shared {
        _guard: ArcRwLockReadGuard<RawRwLock, ()>,
    },
    Exclusive {
        _guard: ArcRwLockWriteGuard<RawRwLock, ()>,
    },
    Alloc {
        _guard: ArcMutexGuard<RawMutex, ()>,
    },
}

enum FileGuard {
    /// Exclusive byte lock; this process holds no other lock on the slot.
    Exclusive { file: Arc<File>, start: u64 },
    /// Shared byte lock, reference-counted across this process's threads;
    /// the OS lock is released only when the last holder leaves.
    Shared { shared: Arc<SharedInner>, start: u64 },
}

impl Drop for FileGuard {
    fn drop(&mut self) {
        match self {
            FileGuard::Exclusive { file, start } => {
                if let Err(_err) = unlock_range(file, *start, 1) {
                    #[cfg(debug_assertions)]
                    eprintln!("failed to unlock latch byte {start}: {_err:?}");
                }
            }
            FileGuard::Shared { shared, start } => shared.release_shared(*start),
        }
    }
}

/// RAII token for a held latch; releases on drop.
///
/// The file-range half (when present) unlocks before the in-process half so
/// another process can never observe the page unlocked on disk while this
/// process still considers it held.
pub struct Latch {
    _file: Option<FileGuard>,
    _process: ProcessGuard,
}

/// In-process latch table: one RwLock per page id, plus the allocation mutex.
pub struct ProcessLatches {
    table: Mutex<HashMap<u64, Arc<RwLock<()>>>>,
    alloc: Arc<Mutex<()>>,
}

impl ProcessLatches {
    /// Creates an empty table.
    pub fn new() -> Self {
        Self {
            table: Mutex::new(HashMap::new()),
            alloc: Arc::new(Mutex::new(())),
        }
    }

    fn slot(&self, page: PageId) -> Arc<RwLock<()>> {
        let mut table = self.table.lock();
        Arc::clone(
            table
                .entry(page.0)
                .or_insert_with(|| Arc::new(RwLock::new(()))),
        )
    }

    fn acquire(&self, page: PageId, mode: LatchMode) -> ProcessGuard {
        // the table mutex must not be held while blocking on the slot
        let slot = self.slot(page);
        match mode {
            LatchMode::Shared => ProcessGuard::Shared {
                _guard: slot.read_arc(),
            },
            LatchMode::Exclusive => ProcessGuard::Exclusive {
                _guard: slot.write_arc(),
            },
        }
    }

    fn acquire_alloc(&self) -> ProcessGuard {
        ProcessGuard::Alloc {
            _guard: self.alloc.lock_arc(),
        }
    }
}

impl Default for ProcessLatches {
    fn default() -> Self {
        Self::new()
    }
}

impl LatchTable for ProcessLatches {
    fn latch(&self, page: PageId, mode: LatchMode) -> Result<Latch> {
        Ok(Latch {
            _file: None,
            _process: self.acquire(page, mode),
        })
    }

    fn allocation_lock(&self) -> Result<Latch> {
        Ok(Latch {
            _file: None,
            _process: self.acquire_alloc(),
        })
    }
}

// Byte 0 of the lock file is the allocation lock; page p maps to byte p + 1.
const ALLOC_SLOT: u64 = 0;

fn page_slot(page: PageId) -> u64 {
    page.0 + 1
}

struct SharedInner {
    file: Arc<File>,
    /// Active shared holders per slot within this process. POSIX record
    /// locks are per-process, so one thread's unlock would drop the whole
    /// process's claim; the count defers the unlock to the last holder.
    shared_counts: Mutex<HashMap<u64, u32>>,
}

impl SharedInner {
    fn acquire_shared(&self, start: u64) -> Result<()> {
        let mut counts = self.shared_counts.lock();
        let count = counts.entry(start).or_insert(0);
        if *count == 0 {
            lock_range(&self.file, start, 1, false)?;
        }
        *count += 1;
        Ok(())
    }

    fn release_shared(&self, start: u64) {
        let mut counts = self.shared_counts.lock();
        match counts.get_mut(&start) {
            Some(count) if *count > 1 => *count -= 1,
            Some(_) => {
                counts.remove(&start);
                if let Err(_err) = unlock_range(&self.file, start, 1) {
                    #[cfg(debug_assertions)]
                    eprintln!("failed to unlock latch byte {start}: {_err:?}");
                }
            }
            None => {
                #[cfg(debug_assertions)]
                eprintln!("shared latch byte {start} released without a holder");
            }
        }
    }
}

/// Cross-process latch table backed by file range locks on a sidecar lock
/// file, layered over an in-process table for threads sharing this handle.
pub struct SharedFileLatches {
    local: ProcessLatches,
    shared: Arc<SharedInner>,
}

impl SharedFileLatches {
    /// Opens or creates the lock file at `path`.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)
            .map_err(CeibaError::from)?;
        Ok(Self {
            local: ProcessLatches::new(),
            shared: Arc::new(SharedInner {
                file: Arc::new(file),
                shared_counts: Mutex::new(HashMap::new()),
            }),
        })
    }
}

impl LatchTable for SharedFileLatches {
    fn latch(&self, page: PageId, mode: LatchMode) -> Result<Latch> {
        let process = self.local.acquire(page, mode);
        let start = page_slot(page);
        let file = match mode {
            LatchMode::Shared => {
                self.shared.acquire_shared(start)?;
                FileGuard::Shared {
                    shared: Arc::clone(&self.shared),
                    start,
                }
            }
            LatchMode::Exclusive => {
                // the in-process write latch excludes every sibling thread,
                // so this process holds no shared claim on the slot here
                lock_range(&self.shared.file, start, 1, true)?;
                FileGuard::Exclusive {
                    file: Arc::clone(&self.shared.file),
                    start,
                }
            }
        };
        Ok(Latch {
            _file: Some(file),
            _process: process,
        })
    }

    fn allocation_lock(&self) -> Result<Latch> {
        let process = self.local.acquire_alloc();
        lock_range(&self.shared.file, ALLOC_SLOT, 1, true)?;
        Ok(Latch {
            _file: Some(FileGuard::Exclusive {
                file: Arc::clone(&self.shared.file),
                start: ALLOC_SLOT,
            }),
            _process: process,
        })
    }
}

fn lock_range(file: &Arc<File>, start: u64, len: u64, exclusive: bool) -> Result<()> {
    lock_range_inner(file, start, len, exclusive).map_err(CeibaError::from)
}

fn lock_range_inner(file: &Arc<File>, start: u64, len: u64, exclusive: bool) -> io::Result<()> {
    #[cfg(unix)]
    {
        unix::lock_region(file, start, len, exclusive)
    }
    #[cfg(windows)]
    {
        windows::lock_region(file, start, len, exclusive)
    }
    #[cfg(not(any(unix, windows)))]
    {
        let _ = (file, start, len, exclusive);
        Err(io::Error::new(
            io::ErrorKind::Unsupported,
            "file locking unsupported on this platform",
        ))
    }
}

fn unlock_range(file: &Arc<File>, start: u64, len: u64) -> io::Result<()> {
    #[cfg(unix)]
    {
        unix::unlock_region(file, start, len)
    }
    #[cfg(windows)]
    {
        windows::unlock_region(file, start, len)
    }
    #[cfg(not(any(unix, windows)))]
    {
        let _ = (file, start, len);
        Err(io::Error::new(
            io::ErrorKind::Unsupported,
            "file locking unsupported on this platform",
        ))
    }
}

#[cfg(unix)]
mod unix {
    use super::*;
    use std::os::unix::io::AsRawFd;

    pub fn lock_region(file: &Arc<File>, start: u64, len: u64, exclusive: bool) -> io::Result<()> {
        let fd = file.as_raw_fd();
        let mut flock = libc::flock {
            l_type: if exclusive {
                libc::F_WRLCK as _
            } else {
                libc::F_RDLCK as _
            },
            l_whence: libc::SEEK_SET as _,
            l_start: start as libc::off_t,
            l_len: len as libc::off_t,
            l_pid: 0,
        };
        loop {
            let res = unsafe { libc::fcntl(fd, libc::F_SETLKW, &mut flock) };
            if res == 0 {
                return Ok(());
            }
            let err = io::Error::last_os_error();
            match err.raw_os_error() {
                Some(libc::EINTR) => continue,
                _ => return Err(err),
            }
        }
    }

    pub fn unlock_region(file: &Arc<File>, start: u64, len: u64) -> io::Result<()> {
        let fd = file.as_raw_fd();
        let mut flock = libc::flock {
            l_type: libc::F_UNLCK as _,
            l_whence: libc::SEEK_SET as _,
            l_start: start as libc::off_t,
            l_len: len as libc::off_t,
            l_pid: 0,
        };
        let res = unsafe { libc::fcntl(fd, libc::F_SETLK, &mut flock) };
        if res == 0 {
            Ok(())
        } else {
            Err(io::Error::last_os_error())
        }
    }
}

#[cfg(windows)]
mod windows {
    use super::*;
    use std::mem::zeroed;
    use std::os::windows::io::AsRawHandle;
    use windows_sys::Win32::Storage::FileSystem::{
        LockFileEx, UnlockFileEx, LOCKFILE_EXCLUSIVE_LOCK,
    };
    use windows_sys::Win32::System::IO::OVERLAPPED;

    pub fn lock_region(file: &Arc<File>, start: u64, len: u64, exclusive: bool) -> io::Result<()> {
        unsafe {
            let handle = file.as_raw_handle();
            let mut overlapped: OVERLAPPED = zeroed();
            overlapped.Offset = start as u32;
            overlapped.OffsetHigh = (start >> 32) as u32;
            let flags = if exclusive { LOCKFILE_EXCLUSIVE_LOCK } else { 0 };
            let low = len as u32;
            let high = (len >> 32) as u32;
            let res = LockFileEx(handle as isize, flags, 0, low, high, &mut overlapped);
            if res != 0 {
                Ok(())
            } else {
                Err(io::Error::last_os_error())
            }
        }
    }

    pub fn unlock_region(file: &Arc<File>, start: u64, len: u64) -> io::Result<()> {
        unsafe {
            let handle = file.as_raw_handle();
            let mut overlapped: OVERLAPPED = zeroed();
            overlapped.Offset = start as u32;
            overlapped.OffsetHigh = (start >> 32) as u32;
            let low = len as u32;
            let high = (len >> 32) as u32;
            let res = UnlockFileEx(handle as isize, 0, low, high, &mut overlapped);
            if res != 0 {
                Ok(())
            } else {
                Err(io::Error::last_os_error())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::thread;
    use std::time::Duration;
    use tempfile::tempdir;

    #[test]
    fn shared_latches_stack() -> Result<()> {
        let latches = ProcessLatches::new();
        let _a = latches.latch(PageId(3), LatchMode::Shared)?;
        let _b = latches.latch(PageId(3), LatchMode::Shared)?;
        let _c = latches.latch(PageId(4), LatchMode::Exclusive)?;
        Ok(())
    }

    #[test]
    fn exclusive_latch_blocks_until_release() -> Result<()> {
        let latches = Arc::new(ProcessLatches::new());
        let guard = latches.latch(PageId(7), LatchMode::Exclusive)?;
        let flag = Arc::new(AtomicBool::new(false));

        let waiter_latches = Arc::clone(&latches);
        let waiter_flag = Arc::clone(&flag);
        let handle = thread::spawn(move || {
            let _guard = waiter_latches
                .latch(PageId(7), LatchMode::Exclusive)
                .expect("latch");
            waiter_flag.store(true, Ordering::SeqCst);
        });

        thread::sleep(Duration::from_millis(50));
        assert!(
            !flag.load(Ordering::SeqCst),
            "waiter should block behind the held exclusive latch"
        );
        drop(guard);
        handle.join().unwrap();
        assert!(flag.load(Ordering::SeqCst));
        Ok(())
    }

    #[test]
    fn allocation_lock_is_distinct_from_page_latches() -> Result<()> {
        let latches = ProcessLatches::new();
        let _alloc = latches.allocation_lock()?;
        // page latches stay available while the allocation lock is held
        let _page = latches.latch(PageId(1), LatchMode::Exclusive)?;
        Ok(())
    }

    #[test]
    fn file_latches_block_between_threads() -> Result<()> {
        let dir = tempdir().unwrap();
        let latches = Arc::new(SharedFileLatches::open(dir.path().join("idx.latch"))?);
        let guard = latches.latch(PageId(2), LatchMode::Exclusive)?;
        let flag = Arc::new(AtomicBool::new(false));

        let waiter_latches = Arc::clone(&latches);
        let waiter_flag = Arc::clone(&flag);
        let handle = thread::spawn(move || {
            let _guard = waiter_latches
                .latch(PageId(2), LatchMode::Shared)
                .expect("latch");
            waiter_flag.store(true, Ordering::SeqCst);
        });

        thread::sleep(Duration::from_millis(50));
        assert!(!flag.load(Ordering::SeqCst));
        drop(guard);
        handle.join().unwrap();
        assert!(flag.load(Ordering::SeqCst));
        Ok(())
    }

    #[test]
    fn shared_file_latch_unlocks_only_with_the_last_holder() -> Result<()> {
        let dir = tempdir().unwrap();
        let latches = SharedFileLatches::open(dir.path().join("idx.latch"))?;
        let a = latches.latch(PageId(9), LatchMode::Shared)?;
        let b = latches.latch(PageId(9), LatchMode::Shared)?;
        assert_eq!(
            latches.shared.shared_counts.lock().get(&page_slot(PageId(9))),
            Some(&2)
        );
        drop(a);
        assert_eq!(
            latches.shared.shared_counts.lock().get(&page_slot(PageId(9))),
            Some(&1)
        );
        drop(b);
        assert!(latches
            .shared
            .shared_counts
            .lock()
            .get(&page_slot(PageId(9)))
            .is_none());
        Ok(())
    }
}
