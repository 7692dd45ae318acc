use std::collections::HashSet;
use std::num::NonZeroUsize;
use std::path::Path;
use std::sync::Arc;

use lru::LruCache;
use parking_lot::Mutex;
use tracing::{debug, info};

use super::freelist::{free_page_capacity, read_free_page, write_free_page, FreeSet};
use super::meta::{create_meta, load_meta, write_meta_page, Meta};
use crate::primitives::concurrency::LatchTable;
use crate::primitives::io::{FileIo, StdFileIo};
use crate::types::{
    page::{self, PageHeader, PAGE_HDR_LEN},
    page_crc32, CeibaError, PageId, Result,
};

/// When to fsync the backing file.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum Synchronous {
    /// Never fsync; durability is left to the OS.
    Off,
    /// Fsync on flush and close.
    Normal,
    /// Fsync after every meta-affecting step.
    Full,
}

/// Configuration for the page store.
#[derive(Clone, Debug)]
pub struct PagerOptions {
    /// Number of pages held in the read cache; 0 disables caching.
    pub cache_pages: usize,
    /// Pages added per file extension, to bound growth cost under small
    /// insert bursts.
    pub grow_batch: u64,
    /// Fsync policy.
    pub synchronous: Synchronous,
    /// Whether to verify page checksums on read.
    pub verify_checksums: bool,
}

impl Default for PagerOptions {
    fn default() -> Self {
        Self {
            cache_pages: 256,
            grow_batch: 16,
            synchronous: Synchronous::Normal,
            verify_checksums: true,
        }
    }
}

struct AllocState {
    meta: Meta,
    free: FreeSet,
    /// Pages currently hosting the persisted free-list chain.
    chain: Vec<PageId>,
    /// File length in pages (growth watermark).
    file_pages: u64,
    /// Free-list state not yet persisted (lazy frees).
    dirty: bool,
}

/// The page store: owns the backing file, the allocation watermark, the free
/// list, and the page cache.
///
/// In shared mode the cache is disabled and allocator state is reloaded from
/// disk under the allocation lock, so cooperating processes always observe
/// each other's published state.
pub struct Pager {
    io: StdFileIo,
    latches: Arc<dyn LatchTable>,
    page_size: usize,
    salt: u64,
    order: u16,
    key_size: u32,
    record_size: u32,
    shared: bool,
    read_only: bool,
    synchronous: Synchronous,
    verify_checksums: bool,
    grow_batch: u64,
    state: Mutex<AllocState>,
    cache: Option<Mutex<LruCache<u64, Arc<[u8]>>>>,
}

impl Pager {
    /// Creates a fresh backing file at `path` with the given geometry. Any
    /// existing content is discarded.
    pub fn create(
        path: impl AsRef<Path>,
        latches: Arc<dyn LatchTable>,
        opts: PagerOptions,
        page_size: u32,
        order: u16,
        key_size: u32,
        record_size: u32,
        flags: u32,
    ) -> Result<Self> {
        let path = path.as_ref();
        let io = StdFileIo::open(path)?;
        io.set_len(0)?;
        let meta = create_meta(&io, page_size, order, key_size, record_size, flags)?;
        info!(path = %path.display(), page_size, order, "created index file");
        Ok(Self::assemble(io, latches, opts, meta, false))
    }

    /// Opens an existing backing file, validating its meta page.
    pub fn open(
        path: impl AsRef<Path>,
        latches: Arc<dyn LatchTable>,
        opts: PagerOptions,
        read_only: bool,
    ) -> Result<Self> {
        let path = path.as_ref();
        let io = if read_only {
            StdFileIo::open_read_only(path)?
        } else {
            StdFileIo::open(path)?
        };
        let meta = load_meta(&io)?;
        if meta.root.0 == 0 {
            return Err(CeibaError::Corruption("index file has no root page"));
        }
        info!(path = %path.display(), meta = %meta, read_only, "opened index file");
        let mut pager = Self::assemble(io, latches, opts, meta, read_only);
        pager.load_chain()?;
        Ok(pager)
    }

    fn assemble(
        io: StdFileIo,
        latches: Arc<dyn LatchTable>,
        opts: PagerOptions,
        meta: Meta,
        read_only: bool,
    ) -> Self {
        let shared = meta.is_shared();
        let cache = if shared || opts.cache_pages == 0 {
            None
        } else {
            let capacity = NonZeroUsize::new(opts.cache_pages).unwrap();
            Some(Mutex::new(LruCache::new(capacity)))
        };
        let page_size = meta.page_size as usize;
        Self {
            latches,
            page_size,
            salt: meta.salt,
            order: meta.order,
            key_size: meta.key_size,
            record_size: meta.record_size,
            shared,
            read_only,
            synchronous: opts.synchronous,
            verify_checksums: opts.verify_checksums,
            grow_batch: opts.grow_batch.max(1),
            state: Mutex::new(AllocState {
                meta,
                free: FreeSet::default(),
                chain: Vec::new(),
                file_pages: 0,
                dirty: false,
            }),
            cache,
            io,
        }
    }

    fn load_chain(&mut self) -> Result<()> {
        let mut st = self.state.lock();
        st.file_pages = self.io.len()? / self.page_size as u64;
        let (free, chain) = self.read_chain(&st.meta)?;
        st.free = free;
        st.chain = chain;
        Ok(())
    }

    fn read_chain(&self, meta: &Meta) -> Result<(FreeSet, Vec<PageId>)> {
        let mut extents = Vec::new();
        let mut chain = Vec::new();
        let mut seen = HashSet::new();
        let mut next = meta.free_head;
        let mut buf = vec![0u8; self.page_size];
        while next.0 != 0 {
            if !seen.insert(next.0) {
                return Err(CeibaError::Corruption("free-list chain contains a cycle"));
            }
            self.io.read_at(next.0 * self.page_size as u64, &mut buf)?;
            let page = read_free_page(&buf, self.page_size, meta)?;
            chain.push(next);
            extents.extend(page.extents);
            next = page.next;
        }
        Ok((FreeSet::from_extents(extents), chain))
    }

    /// Page size in bytes.
    pub fn page_size(&self) -> usize {
        self.page_size
    }

    /// Checksum salt for this file generation.
    pub fn salt(&self) -> u64 {
        self.salt
    }

    /// Tree order recorded at create time.
    pub fn order(&self) -> u16 {
        self.order
    }

    /// Fixed key size recorded at create time.
    pub fn key_size(&self) -> u32 {
        self.key_size
    }

    /// Fixed record size recorded at create time.
    pub fn record_size(&self) -> u32 {
        self.record_size
    }

    /// Whether the file was created for cross-process access.
    pub fn is_shared(&self) -> bool {
        self.shared
    }

    /// Whether this handle was opened read-only.
    pub fn is_read_only(&self) -> bool {
        self.read_only
    }

    /// The latch table coordinating access to this file.
    pub fn latches(&self) -> &Arc<dyn LatchTable> {
        &self.latches
    }

    /// Current root page id. In shared mode the meta page is re-read from
    /// disk; callers hold the anchor latch, which serializes root changes.
    pub fn root(&self) -> Result<PageId> {
        if self.shared {
            Ok(load_meta(&self.io)?.root)
        } else {
            Ok(self.state.lock().meta.root)
        }
    }

    /// Points the meta page at a new root and persists it. The new root page
    /// must already be durably written.
    pub fn set_root(&self, root: PageId) -> Result<()> {
        self.require_writable()?;
        let _alloc = self.latches.allocation_lock()?;
        let mut st = self.state.lock();
        if self.shared {
            self.reload_locked(&mut st)?;
        }
        st.meta.root = root;
        self.persist_meta(&mut st)
    }

    /// Reads and verifies one page. Never valid for page 0.
    pub fn read_page(&self, id: PageId) -> Result<Arc<[u8]>> {
        if id.0 == 0 {
            return Err(CeibaError::Invalid("page 0 is the meta page"));
        }
        if let Some(cache) = &self.cache {
            if let Some(hit) = cache.lock().get(&id.0) {
                return Ok(Arc::clone(hit));
            }
        }
        let mut buf = vec![0u8; self.page_size];
        self.io.read_at(id.0 * self.page_size as u64, &mut buf)?;
        let header = PageHeader::decode(&buf)?;
        if header.page_no != id {
            return Err(CeibaError::Corruption("page number mismatch"));
        }
        if header.page_size as usize != self.page_size {
            return Err(CeibaError::Corruption("page size mismatch"));
        }
        if self.verify_checksums {
            let mut scratch = buf.clone();
            page::clear_crc32(&mut scratch[..PAGE_HDR_LEN])?;
            if page_crc32(id.0, self.salt, &scratch) != header.crc32 {
                return Err(CeibaError::Corruption("page crc mismatch"));
            }
        }
        let image: Arc<[u8]> = Arc::from(buf);
        if let Some(cache) = &self.cache {
            cache.lock().put(id.0, Arc::clone(&image));
        }
        Ok(image)
    }

    /// Writes one fully-encoded page image (header and checksum included).
    /// The caller must hold the page's exclusive latch.
    pub fn write_page(&self, id: PageId, image: &[u8]) -> Result<()> {
        self.require_writable()?;
        if id.0 == 0 {
            return Err(CeibaError::Invalid("page 0 is the meta page"));
        }
        if image.len() != self.page_size {
            return Err(CeibaError::Invalid("page image length mismatch"));
        }
        self.io.write_at(id.0 * self.page_size as u64, image)?;
        if let Some(cache) = &self.cache {
            cache.lock().put(id.0, Arc::from(image.to_vec()));
        }
        Ok(())
    }

    /// Allocates a page: free-list reuse first, then the watermark with
    /// batched file growth. Allocator state is persisted before the id is
    /// returned, so a crash can never hand the same page out twice.
    pub fn allocate(&self) -> Result<PageId> {
        self.require_writable()?;
        let _alloc = self.latches.allocation_lock()?;
        let mut st = self.state.lock();
        if self.shared {
            self.reload_locked(&mut st)?;
        }
        if let Some(id) = st.free.pop() {
            self.persist_allocator(&mut st)?;
            debug!(page = %id, "allocated page from free list");
            return Ok(id);
        }
        let id = self.claim_fresh(&mut st)?;
        self.persist_meta(&mut st)?;
        debug!(page = %id, "allocated fresh page");
        Ok(id)
    }

    /// Returns a page to the free list. Persistence is lazy in process mode
    /// (a crash leaks the page until recovery); shared mode publishes
    /// immediately so other processes observe the free.
    pub fn free(&self, id: PageId) -> Result<()> {
        self.require_writable()?;
        if id.0 == 0 {
            return Err(CeibaError::Invalid("page 0 is the meta page"));
        }
        let _alloc = self.latches.allocation_lock()?;
        let mut st = self.state.lock();
        if self.shared {
            self.reload_locked(&mut st)?;
            st.free.push(id);
            self.persist_allocator(&mut st)?;
        } else {
            st.free.push(id);
            st.dirty = true;
        }
        self.invalidate(id);
        Ok(())
    }

    /// Persists pending allocator state and syncs per the configured policy.
    pub fn flush(&self) -> Result<()> {
        if self.read_only {
            return Ok(());
        }
        let _alloc = self.latches.allocation_lock()?;
        let mut st = self.state.lock();
        if st.dirty {
            self.persist_allocator(&mut st)?;
        }
        if self.synchronous != Synchronous::Off {
            self.io.sync_all()?;
        }
        debug!("flushed allocator state");
        Ok(())
    }

    /// Replaces the free list with every allocated page not in `reachable`,
    /// reclaiming pages leaked by an interrupted structural step.
    pub fn rebuild_freelist(&self, reachable: &HashSet<u64>) -> Result<()> {
        self.require_writable()?;
        let _alloc = self.latches.allocation_lock()?;
        let mut st = self.state.lock();
        if self.shared {
            self.reload_locked(&mut st)?;
        }
        let mut free = FreeSet::default();
        for id in 1..st.meta.next_page.0 {
            if !reachable.contains(&id) {
                free.push(PageId(id));
            }
        }
        let reclaimed = free.page_count();
        st.free = free;
        // the old chain pages are unreachable, so they are already in the set
        st.chain.clear();
        self.persist_allocator(&mut st)?;
        if self.synchronous != Synchronous::Off {
            self.io.sync_all()?;
        }
        info!(reclaimed, "rebuilt free list");
        Ok(())
    }

    /// Number of pages currently on the free list.
    pub fn free_page_count(&self) -> u64 {
        self.state.lock().free.page_count()
    }

    /// Allocation watermark: lowest never-allocated page id.
    pub fn next_page(&self) -> PageId {
        self.state.lock().meta.next_page
    }

    fn require_writable(&self) -> Result<()> {
        if self.read_only {
            return Err(CeibaError::Invalid("handle is read-only"));
        }
        Ok(())
    }

    fn reload_locked(&self, st: &mut AllocState) -> Result<()> {
        st.meta = load_meta(&self.io)?;
        let (free, chain) = self.read_chain(&st.meta)?;
        st.free = free;
        st.chain = chain;
        st.file_pages = self.io.len()? / self.page_size as u64;
        st.dirty = false;
        Ok(())
    }

    fn claim_fresh(&self, st: &mut AllocState) -> Result<PageId> {
        let id = st.meta.next_page;
        if st.file_pages <= id.0 {
            let target = id.0 + self.grow_batch;
            self.io
                .set_len(target * self.page_size as u64)
                .map_err(|_| CeibaError::Exhausted("cannot grow backing file"))?;
            st.file_pages = target;
        }
        st.meta.next_page = PageId(id.0 + 1);
        Ok(id)
    }

    fn persist_meta(&self, st: &mut AllocState) -> Result<()> {
        let mut buf = vec![0u8; self.page_size];
        write_meta_page(&mut buf, &st.meta)?;
        self.io.write_at(0, &buf)?;
        if self.synchronous == Synchronous::Full {
            self.io.sync_all()?;
        }
        Ok(())
    }

    /// Rewrites the free-list chain from the in-memory set, carving chain
    /// pages out of the set itself, then persists the meta page.
    fn persist_allocator(&self, st: &mut AllocState) -> Result<()> {
        let old_chain: Vec<PageId> = st.chain.drain(..).collect();
        for id in old_chain {
            st.free.push(id);
        }
        let capacity = free_page_capacity(self.page_size);
        if capacity == 0 {
            return Err(CeibaError::Invalid("page size too small for free list"));
        }
        let mut chain: Vec<PageId> = Vec::new();
        loop {
            let needed = if st.free.is_empty() {
                0
            } else {
                st.free.extents().len().div_ceil(capacity)
            };
            if chain.len() >= needed {
                break;
            }
            let id = match st.free.pop() {
                Some(id) => id,
                None => self.claim_fresh(st)?,
            };
            chain.push(id);
        }

        let extents = st.free.extents().to_vec();
        let mut buf = vec![0u8; self.page_size];
        let mut chunks = extents.chunks(capacity);
        for (idx, id) in chain.iter().enumerate() {
            let slice = chunks.next().unwrap_or(&[]);
            let next = chain.get(idx + 1).copied().unwrap_or(PageId(0));
            write_free_page(&mut buf, *id, &st.meta, next, slice)?;
            self.io.write_at(id.0 * self.page_size as u64, &buf)?;
            self.invalidate(*id);
        }
        st.meta.free_head = chain.first().copied().unwrap_or(PageId(0));
        st.chain = chain;
        st.dirty = false;
        self.persist_meta(st)
    }

    fn invalidate(&self, id: PageId) {
        if let Some(cache) = &self.cache {
            cache.lock().pop(&id.0);
        }
    }
}
