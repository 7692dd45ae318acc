//! Engine facade: the [`Index`] handle, its state-code boundary, and the
//! fatal-error hook.
//!
//! Expected outcomes (`Duplicate`, `NotFound`) come back as plain [`State`]
//! variants. Fatal conditions (I/O failure, corruption, exhaustion, invalid
//! parameters) are reported to the handle's [`FatalHook`] first and then
//! returned as [`State::Fatal`]; the default hook logs and returns, leaving
//! termination policy to the caller.
//!
//! Racing callers that want to converge on membership can layer their own
//! retry policy on these codes — for example "insert, and on `Duplicate`
//! remove the same key instead". That pattern lives above the engine: the
//! engine itself never retries.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use tracing::{error, warn};

use crate::primitives::concurrency::{LatchTable, ProcessLatches, SharedFileLatches};
use crate::primitives::io::StdFileIo;
use crate::primitives::pager::{load_meta, Pager, PagerOptions, META_FLAG_SHARED};
use crate::tree::{BTree, CheckReport, Cursor, InsertOutcome, KeyComparator, NodeLayout, RemoveOutcome};
use crate::types::{CeibaError, Result};

/// Handle-scoped observer for fatal conditions, invoked with the operation
/// name and the error before the fatal state is returned. It may log, abort,
/// or record; it is not required to diverge.
pub type FatalHook = Arc<dyn Fn(&str, &CeibaError) + Send + Sync>;

/// Enumerated outcome of a facade operation.
#[derive(Debug)]
pub enum State {
    /// The operation succeeded.
    Okay,
    /// Insert of a key that already exists; nothing was mutated.
    Duplicate,
    /// Remove or find of a key that is not present.
    NotFound,
    /// An unrecoverable condition, already reported to the fatal hook.
    Fatal(CeibaError),
}

impl State {
    /// True on success.
    pub fn is_okay(&self) -> bool {
        matches!(self, State::Okay)
    }

    /// True when an insert hit an existing key.
    pub fn is_duplicate(&self) -> bool {
        matches!(self, State::Duplicate)
    }

    /// True when a key was absent.
    pub fn is_not_found(&self) -> bool {
        matches!(self, State::NotFound)
    }

    /// True on a fatal condition.
    pub fn is_fatal(&self) -> bool {
        matches!(self, State::Fatal(_))
    }
}

/// Options for [`Index::create`].
#[derive(Clone)]
pub struct CreateOptions {
    /// Tree order: maximum children per internal node. Must be at least 3.
    pub order: u16,
    /// Fixed key size in bytes.
    pub key_size: u32,
    /// Fixed record size in bytes; at least `key_size`, which it defaults to.
    pub record_size: u32,
    /// Create the index for cross-process use: latches move into the sidecar
    /// lock file and the page cache is bypassed.
    pub shared: bool,
    /// Page-store tuning.
    pub pager: PagerOptions,
    /// Fatal-condition observer; defaults to a `tracing` error event.
    pub fatal_hook: Option<FatalHook>,
}

impl CreateOptions {
    /// Options for a tree of the given order whose records are exactly keys.
    pub fn new(order: u16, key_size: u32) -> Self {
        Self {
            order,
            key_size,
            record_size: key_size,
            shared: false,
            pager: PagerOptions::default(),
            fatal_hook: None,
        }
    }

    /// Sets a record size larger than the key prefix.
    pub fn record_size(mut self, record_size: u32) -> Self {
        self.record_size = record_size;
        self
    }

    /// Enables cross-process shared mode.
    pub fn shared(mut self, shared: bool) -> Self {
        self.shared = shared;
        self
    }

    /// Replaces the pager options.
    pub fn pager(mut self, pager: PagerOptions) -> Self {
        self.pager = pager;
        self
    }

    /// Installs a fatal-condition observer.
    pub fn fatal_hook(mut self, hook: FatalHook) -> Self {
        self.fatal_hook = Some(hook);
        self
    }
}

/// Options for [`Index::open`].
#[derive(Clone, Default)]
pub struct OpenOptions {
    /// Open the backing file without write permission; mutations fail with
    /// an invalid-parameter fatal state.
    pub read_only: bool,
    /// Run the full consistency pass before use and (unless read-only)
    /// rebuild the free list from the unreachable-page set, reclaiming pages
    /// leaked by an interrupted structural step.
    pub recover: bool,
    /// Page-store tuning.
    pub pager: PagerOptions,
    /// Fatal-condition observer; defaults to a `tracing` error event.
    pub fatal_hook: Option<FatalHook>,
}

impl OpenOptions {
    /// Default options: writable, trusting the header.
    pub fn new() -> Self {
        Self {
            read_only: false,
            recover: false,
            pager: PagerOptions::default(),
            fatal_hook: None,
        }
    }

    /// Opens without write permission.
    pub fn read_only(mut self, read_only: bool) -> Self {
        self.read_only = read_only;
        self
    }

    /// Requests the consistency pass and free-list rebuild.
    pub fn recover(mut self, recover: bool) -> Self {
        self.recover = recover;
        self
    }

    /// Replaces the pager options.
    pub fn pager(mut self, pager: PagerOptions) -> Self {
        self.pager = pager;
        self
    }

    /// Installs a fatal-condition observer.
    pub fn fatal_hook(mut self, hook: FatalHook) -> Self {
        self.fatal_hook = Some(hook);
        self
    }
}

fn default_hook() -> FatalHook {
    Arc::new(|operation, err| {
        error!(operation, error = %err, "fatal index error");
    })
}

fn latch_path(path: &Path) -> PathBuf {
    let mut os = path.as_os_str().to_os_string();
    os.push(".latch");
    PathBuf::from(os)
}

fn build_latches(path: &Path, shared: bool) -> Result<Arc<dyn LatchTable>> {
    if shared {
        Ok(Arc::new(SharedFileLatches::open(latch_path(path))?))
    } else {
        Ok(Arc::new(ProcessLatches::new()))
    }
}

/// An open index: one B-tree of fixed-size records in one backing file.
///
/// The handle is exclusively owned; share it between threads by wrapping it
/// in an `Arc`. In shared mode every cooperating process must open the same
/// path, and all threads within one process must go through one handle.
pub struct Index {
    pager: Arc<Pager>,
    tree: BTree,
    hook: FatalHook,
}

impl Index {
    /// Creates a fresh index file at `path`, discarding any existing
    /// content, and leaves it open for use.
    pub fn create(
        path: impl AsRef<Path>,
        comparator: Arc<dyn KeyComparator>,
        options: CreateOptions,
    ) -> Result<Self> {
        let hook = options.fatal_hook.clone().unwrap_or_else(default_hook);
        match Self::create_inner(path.as_ref(), comparator, options, Arc::clone(&hook)) {
            Ok(index) => Ok(index),
            Err(err) => {
                hook("create", &err);
                Err(err)
            }
        }
    }

    fn create_inner(
        path: &Path,
        comparator: Arc<dyn KeyComparator>,
        options: CreateOptions,
        hook: FatalHook,
    ) -> Result<Self> {
        let layout = NodeLayout::compute(options.order, options.key_size, options.record_size)?;
        let latches = build_latches(path, options.shared)?;
        let flags = if options.shared { META_FLAG_SHARED } else { 0 };
        let pager = Arc::new(Pager::create(
            path,
            latches,
            options.pager,
            layout.page_size,
            options.order,
            options.key_size,
            options.record_size,
            flags,
        )?);
        let tree = BTree::new(Arc::clone(&pager), comparator)?;
        tree.init_empty()?;
        Ok(Self { pager, tree, hook })
    }

    /// Opens an existing index file. The comparator must be the same total
    /// order the file was created with.
    pub fn open(
        path: impl AsRef<Path>,
        comparator: Arc<dyn KeyComparator>,
        options: OpenOptions,
    ) -> Result<Self> {
        let hook = options.fatal_hook.clone().unwrap_or_else(default_hook);
        match Self::open_inner(path.as_ref(), comparator, options, Arc::clone(&hook)) {
            Ok(index) => Ok(index),
            Err(err) => {
                hook("open", &err);
                Err(err)
            }
        }
    }

    fn open_inner(
        path: &Path,
        comparator: Arc<dyn KeyComparator>,
        options: OpenOptions,
        hook: FatalHook,
    ) -> Result<Self> {
        // the shared flag picks the latch table, so peek at the meta page
        // before the pager attaches
        let probe = StdFileIo::open_read_only(path)?;
        let meta = load_meta(&probe)?;
        drop(probe);
        let latches = build_latches(path, meta.is_shared())?;
        let pager = Arc::new(Pager::open(path, latches, options.pager, options.read_only)?);
        let tree = BTree::new(Arc::clone(&pager), comparator)?;
        if options.recover {
            let report = tree.check()?;
            if !options.read_only {
                pager.rebuild_freelist(&report.reachable)?;
            }
        }
        Ok(Self { pager, tree, hook })
    }

    fn fatal(&self, operation: &'static str, err: CeibaError) -> State {
        (self.hook)(operation, &err);
        State::Fatal(err)
    }

    /// Inserts a record of exactly the configured record size, keyed by its
    /// leading key bytes.
    pub fn insert(&self, record: &[u8]) -> State {
        if self.pager.is_read_only() {
            return self.fatal("insert", CeibaError::Invalid("handle is read-only"));
        }
        match self.tree.insert(record) {
            Ok(InsertOutcome::Inserted) => State::Okay,
            Ok(InsertOutcome::Duplicate) => State::Duplicate,
            Err(err) => self.fatal("insert", err),
        }
    }

    /// Removes the record whose key matches `key`.
    pub fn remove(&self, key: &[u8]) -> State {
        if self.pager.is_read_only() {
            return self.fatal("remove", CeibaError::Invalid("handle is read-only"));
        }
        match self.tree.remove(key) {
            Ok(RemoveOutcome::Removed) => State::Okay,
            Ok(RemoveOutcome::Missing) => State::NotFound,
            Err(err) => self.fatal("remove", err),
        }
    }

    /// Looks up `key`, returning the full record alongside the state code.
    pub fn find(&self, key: &[u8]) -> (State, Option<Vec<u8>>) {
        match self.tree.find(key) {
            Ok(Some(record)) => (State::Okay, Some(record)),
            Ok(None) => (State::NotFound, None),
            Err(err) => (self.fatal("find", err), None),
        }
    }

    /// Runs the full consistency pass.
    pub fn verify(&self) -> State {
        match self.tree.check() {
            Ok(_) => State::Okay,
            Err(err) => self.fatal("verify", err),
        }
    }

    /// Consistency pass returning the collected statistics.
    pub fn check(&self) -> Result<CheckReport> {
        self.tree.check()
    }

    /// Opens a forward cursor over all records in key order.
    pub fn cursor(&self) -> Cursor<'_> {
        self.tree.cursor()
    }

    /// Persists pending allocator state and syncs per the pager policy.
    pub fn flush(&self) -> State {
        match self.pager.flush() {
            Ok(()) => State::Okay,
            Err(err) => self.fatal("flush", err),
        }
    }

    /// Flushes and closes the handle.
    pub fn close(self) -> State {
        match self.pager.flush() {
            Ok(()) => State::Okay,
            Err(err) => self.fatal("close", err),
        }
    }

    /// Tree order recorded at create time.
    pub fn order(&self) -> u16 {
        self.pager.order()
    }

    /// Fixed key size recorded at create time.
    pub fn key_size(&self) -> u32 {
        self.pager.key_size()
    }

    /// Fixed record size recorded at create time.
    pub fn record_size(&self) -> u32 {
        self.pager.record_size()
    }

    /// The underlying tree, for diagnostics and tests.
    pub fn tree(&self) -> &BTree {
        &self.tree
    }
}

impl Drop for Index {
    fn drop(&mut self) {
        if let Err(err) = self.pager.flush() {
            warn!(error = %err, "flush on drop failed");
        }
    }
}
