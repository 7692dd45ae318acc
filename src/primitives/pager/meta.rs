use std::convert::TryInto;
use std::fmt;
use std::io::ErrorKind;
use std::ops::Range;

use rand::{rngs::OsRng, RngCore};

use crate::primitives::io::FileIo;
use crate::types::{
    page::{self, PageHeader, PageKind, PAGE_HDR_LEN},
    page_crc32, CeibaError, PageId, Result,
};

const META_SALT: Range<usize> = PAGE_HDR_LEN..PAGE_HDR_LEN + 8;
const META_PAGE_SIZE: Range<usize> = PAGE_HDR_LEN + 8..PAGE_HDR_LEN + 12;
const META_FORMAT_VERSION: Range<usize> = PAGE_HDR_LEN + 12..PAGE_HDR_LEN + 14;
const META_ORDER: Range<usize> = PAGE_HDR_LEN + 14..PAGE_HDR_LEN + 16;
const META_KEY_SIZE: Range<usize> = PAGE_HDR_LEN + 16..PAGE_HDR_LEN + 20;
const META_RECORD_SIZE: Range<usize> = PAGE_HDR_LEN + 20..PAGE_HDR_LEN + 24;
const META_FLAGS: Range<usize> = PAGE_HDR_LEN + 24..PAGE_HDR_LEN + 28;
const META_RESERVED: Range<usize> = PAGE_HDR_LEN + 28..PAGE_HDR_LEN + 32;
const META_ROOT: Range<usize> = PAGE_HDR_LEN + 32..PAGE_HDR_LEN + 40;
const META_FREE_HEAD: Range<usize> = PAGE_HDR_LEN + 40..PAGE_HDR_LEN + 48;
const META_NEXT_PAGE: Range<usize> = PAGE_HDR_LEN + 48..PAGE_HDR_LEN + 56;
const META_RESERVED_2: Range<usize> = PAGE_HDR_LEN + 56..PAGE_HDR_LEN + 64;

/// Payload bytes the meta page needs beyond the fixed header.
pub const META_PAYLOAD_LEN: usize = 64;

/// Meta flag bit: the index was created for multi-party (cross-process)
/// access and latches live in the sidecar lock file.
pub const META_FLAG_SHARED: u32 = 1;

/// Index metadata stored in page 0: geometry, mode flags, and the root and
/// free-list pointers.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Meta {
    /// Size of each page in bytes.
    pub page_size: u32,
    /// Random salt mixed into every page checksum.
    pub salt: u64,
    /// File format version.
    pub format_version: u16,
    /// Tree order: maximum children per internal node.
    pub order: u16,
    /// Fixed key size in bytes (leading bytes of every record).
    pub key_size: u32,
    /// Fixed record size in bytes.
    pub record_size: u32,
    /// Mode flags ([`META_FLAG_SHARED`]).
    pub flags: u32,
    /// Page id of the tree root.
    pub root: PageId,
    /// Head of the persisted free-list chain, 0 when empty.
    pub free_head: PageId,
    /// Lowest page id never yet allocated (allocation watermark).
    pub next_page: PageId,
}

impl Meta {
    /// Whether the shared (cross-process) mode flag is set.
    pub fn is_shared(&self) -> bool {
        self.flags & META_FLAG_SHARED != 0
    }
}

/// Creates fresh metadata, writes it to page 0, and syncs.
pub fn create_meta(
    io: &dyn FileIo,
    page_size: u32,
    order: u16,
    key_size: u32,
    record_size: u32,
    flags: u32,
) -> Result<Meta> {
    if (page_size as usize) < PAGE_HDR_LEN + META_PAYLOAD_LEN {
        return Err(CeibaError::Invalid("page size smaller than meta payload"));
    }
    let mut rng = OsRng;
    let meta = Meta {
        page_size,
        salt: rng.next_u64(),
        format_version: page::PAGE_FORMAT_VERSION,
        order,
        key_size,
        record_size,
        flags,
        root: PageId(0),
        free_head: PageId(0),
        next_page: PageId(1),
    };
    let mut buf = vec![0u8; page_size as usize];
    write_meta_page(&mut buf, &meta)?;
    io.write_at(0, &buf)?;
    io.sync_all()?;
    Ok(meta)
}

/// Loads and verifies the metadata from page 0. The page size is discovered
/// from the header before the full page is read and checksummed.
pub fn load_meta(io: &dyn FileIo) -> Result<Meta> {
    let mut hdr = [0u8; PAGE_HDR_LEN];
    match io.read_at(0, &mut hdr) {
        Ok(()) => {}
        Err(CeibaError::Io(err)) if err.kind() == ErrorKind::UnexpectedEof => {
            return Err(CeibaError::Corruption("meta page truncated"));
        }
        Err(err) => return Err(err),
    }
    let header = PageHeader::decode(&hdr)?;
    let mut buf = vec![0u8; header.page_size as usize];
    match io.read_at(0, &mut buf) {
        Ok(()) => {}
        Err(CeibaError::Io(err)) if err.kind() == ErrorKind::UnexpectedEof => {
            return Err(CeibaError::Corruption("meta page truncated"));
        }
        Err(err) => return Err(err),
    }
    read_meta_page(&buf)
}

/// Encodes metadata into a page buffer with header and checksum.
pub fn write_meta_page(buf: &mut [u8], meta: &Meta) -> Result<()> {
    let page_size = meta.page_size as usize;
    if buf.len() < page_size {
        return Err(CeibaError::Invalid("meta buffer too small"));
    }
    buf[..page_size].fill(0);
    let header =
        PageHeader::new(PageId(0), PageKind::Meta, meta.page_size, meta.salt)?.with_crc32(0);
    header.encode(&mut buf[..PAGE_HDR_LEN])?;
    buf[META_SALT].copy_from_slice(&meta.salt.to_be_bytes());
    buf[META_PAGE_SIZE].copy_from_slice(&meta.page_size.to_be_bytes());
    buf[META_FORMAT_VERSION].copy_from_slice(&meta.format_version.to_be_bytes());
    buf[META_ORDER].copy_from_slice(&meta.order.to_be_bytes());
    buf[META_KEY_SIZE].copy_from_slice(&meta.key_size.to_be_bytes());
    buf[META_RECORD_SIZE].copy_from_slice(&meta.record_size.to_be_bytes());
    buf[META_FLAGS].copy_from_slice(&meta.flags.to_be_bytes());
    buf[META_RESERVED].fill(0);
    buf[META_ROOT].copy_from_slice(&meta.root.0.to_be_bytes());
    buf[META_FREE_HEAD].copy_from_slice(&meta.free_head.0.to_be_bytes());
    buf[META_NEXT_PAGE].copy_from_slice(&meta.next_page.0.to_be_bytes());
    buf[META_RESERVED_2].fill(0);
    page::clear_crc32(&mut buf[..PAGE_HDR_LEN])?;
    let crc = page_crc32(0, meta.salt, &buf[..page_size]);
    buf[page::header::CRC32].copy_from_slice(&crc.to_be_bytes());
    Ok(())
}

/// Decodes metadata from a page buffer, verifying checksum and sanity of
/// every geometry field.
pub fn read_meta_page(buf: &[u8]) -> Result<Meta> {
    if buf.len() < PAGE_HDR_LEN + META_PAYLOAD_LEN {
        return Err(CeibaError::Corruption("meta page truncated"));
    }
    let header = PageHeader::decode(&buf[..PAGE_HDR_LEN])?;
    if header.kind != PageKind::Meta {
        return Err(CeibaError::Corruption("meta page has wrong kind"));
    }
    let len = header.page_size as usize;
    if buf.len() < len {
        return Err(CeibaError::Corruption("meta page truncated"));
    }
    let mut scratch = buf[..len].to_vec();
    page::clear_crc32(&mut scratch[..PAGE_HDR_LEN])?;
    let crc = page_crc32(header.page_no.0, header.salt, &scratch);
    if crc != header.crc32 {
        return Err(CeibaError::Corruption("meta page crc mismatch"));
    }
    let salt = u64::from_be_bytes(buf[META_SALT].try_into().unwrap());
    let page_size = u32::from_be_bytes(buf[META_PAGE_SIZE].try_into().unwrap());
    let format_version = u16::from_be_bytes(buf[META_FORMAT_VERSION].try_into().unwrap());
    let order = u16::from_be_bytes(buf[META_ORDER].try_into().unwrap());
    let key_size = u32::from_be_bytes(buf[META_KEY_SIZE].try_into().unwrap());
    let record_size = u32::from_be_bytes(buf[META_RECORD_SIZE].try_into().unwrap());
    let flags = u32::from_be_bytes(buf[META_FLAGS].try_into().unwrap());
    if buf[META_RESERVED].iter().any(|b| *b != 0) {
        return Err(CeibaError::Corruption("meta reserved field non-zero"));
    }
    let root = PageId(u64::from_be_bytes(buf[META_ROOT].try_into().unwrap()));
    let free_head = PageId(u64::from_be_bytes(buf[META_FREE_HEAD].try_into().unwrap()));
    let next_page = PageId(u64::from_be_bytes(buf[META_NEXT_PAGE].try_into().unwrap()));
    if buf[META_RESERVED_2].iter().any(|b| *b != 0) {
        return Err(CeibaError::Corruption("meta reserved field non-zero"));
    }
    if page_size != header.page_size {
        return Err(CeibaError::Corruption("meta page size disagrees with header"));
    }
    if order < 3 {
        return Err(CeibaError::Corruption("meta order below minimum"));
    }
    if key_size == 0 || record_size < key_size {
        return Err(CeibaError::Corruption("meta key/record sizes inconsistent"));
    }
    // root stays 0 between file creation and the first root write; opening a
    // finished file with root 0 is rejected by the pager.
    if root >= next_page {
        return Err(CeibaError::Corruption("meta root outside allocated pages"));
    }
    Ok(Meta {
        page_size,
        salt,
        format_version,
        order,
        key_size,
        record_size,
        flags,
        root,
        free_head,
        next_page,
    })
}

impl fmt::Display for Meta {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Meta(page_size={}, salt={}, format_version={}, order={}, key_size={}, record_size={}, flags={}, root={}, free_head={}, next_page={})",
            self.page_size,
            self.salt,
            self.format_version,
            self.order,
            self.key_size,
            self.record_size,
            self.flags,
            self.root,
            self.free_head,
            self.next_page,
        )
    }
}
