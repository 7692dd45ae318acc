//! Core identifiers, error type, and the on-disk page header shared by every
//! component of the engine.

use std::fmt;

/// Identifier of a fixed-size page inside the backing file. Page 0 is always
/// the meta page.
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Debug)]
pub struct PageId(pub u64);

impl fmt::Display for PageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Fatal failure conditions. Expected outcomes (duplicate key, missing key)
/// are not errors; they are reported through [`crate::db::State`].
#[derive(thiserror::Error, Debug)]
pub enum CeibaError {
    /// The backing medium failed a read, write, open, or sync.
    #[error("I/O: {0}")]
    Io(#[from] std::io::Error),
    /// On-disk structure violates header or invariant expectations.
    #[error("corruption: {0}")]
    Corruption(&'static str),
    /// A caller-supplied parameter is outside the engine's contract.
    #[error("invalid argument: {0}")]
    Invalid(&'static str),
    /// The backing file cannot grow to satisfy an allocation.
    #[error("allocation exhausted: {0}")]
    Exhausted(&'static str),
}

/// Crate-wide result alias.
pub type Result<T> = std::result::Result<T, CeibaError>;

/// Checksum covering a page image, keyed by page number and the file salt so
/// a page copied from another file (or another generation of the same file)
/// never verifies.
pub fn page_crc32(page_no: u64, salt: u64, payload: &[u8]) -> u32 {
    let mut hasher = crc32fast::Hasher::new();
    hasher.update(&page_no.to_be_bytes());
    hasher.update(&salt.to_be_bytes());
    hasher.update(payload);
    hasher.finalize()
}

pub mod page {
    //! Fixed page header shared by every on-disk page kind.

    use core::convert::{TryFrom, TryInto};

    use super::{PageId, Result};
    use crate::types::CeibaError;

    /// Magic bytes at the start of every page.
    pub const PAGE_MAGIC: [u8; 4] = *b"CEIB";
    /// On-disk format version stamped into every page header.
    pub const PAGE_FORMAT_VERSION: u16 = 1;
    /// Length of the fixed page header in bytes.
    pub const PAGE_HDR_LEN: usize = 32;

    pub mod header {
        //! Byte offsets for fixed header fields.
        use core::ops::Range;

        pub const MAGIC: Range<usize> = 0..4;
        pub const FORMAT_VERSION: Range<usize> = 4..6;
        pub const PAGE_KIND: usize = 6;
        pub const RESERVED: usize = 7;
        pub const PAGE_SIZE: Range<usize> = 8..12;
        pub const PAGE_NO: Range<usize> = 12..20;
        pub const SALT: Range<usize> = 20..28;
        pub const CRC32: Range<usize> = 28..32;
    }

    /// Logical kind of a page, stored in the header kind byte.
    #[repr(u8)]
    #[derive(Copy, Clone, Debug, Eq, PartialEq)]
    pub enum PageKind {
        /// Page 0: file-wide metadata and root/free-list pointers.
        Meta = 1,
        /// A link in the persisted free-list chain.
        FreeList = 2,
        /// B-tree leaf node (records only).
        Leaf = 3,
        /// B-tree internal node (records plus child pointers).
        Internal = 4,
    }

    impl PageKind {
        /// Byte value stored in the header.
        pub const fn as_u8(self) -> u8 {
            self as u8
        }
    }

    impl TryFrom<u8> for PageKind {
        type Error = CeibaError;

        fn try_from(value: u8) -> Result<Self> {
            match value {
                1 => Ok(PageKind::Meta),
                2 => Ok(PageKind::FreeList),
                3 => Ok(PageKind::Leaf),
                4 => Ok(PageKind::Internal),
                _ => Err(CeibaError::Corruption("unknown page kind")),
            }
        }
    }

    /// Decoded fixed page header.
    #[derive(Clone, Debug, Eq, PartialEq)]
    pub struct PageHeader {
        /// Format version the page was written with.
        pub format_version: u16,
        /// Page kind byte.
        pub kind: PageKind,
        /// Page size recorded when the page was written.
        pub page_size: u32,
        /// The page's own number, for misdirected-write detection.
        pub page_no: PageId,
        /// File salt mixed into the checksum.
        pub salt: u64,
        /// CRC32 over the page image with this field zeroed.
        pub crc32: u32,
    }

    impl PageHeader {
        /// Build a header for a fresh page; the checksum starts at zero.
        pub fn new(page_no: PageId, kind: PageKind, page_size: u32, salt: u64) -> Result<Self> {
            if (page_size as usize) < PAGE_HDR_LEN {
                return Err(CeibaError::Invalid("page size smaller than header"));
            }
            Ok(Self {
                format_version: PAGE_FORMAT_VERSION,
                kind,
                page_size,
                page_no,
                salt,
                crc32: 0,
            })
        }

        /// Attach a computed checksum.
        pub fn with_crc32(mut self, crc32: u32) -> Self {
            self.crc32 = crc32;
            self
        }

        /// Encode into the first [`PAGE_HDR_LEN`] bytes of `dst`.
        pub fn encode(&self, dst: &mut [u8]) -> Result<()> {
            if dst.len() < PAGE_HDR_LEN {
                return Err(CeibaError::Invalid("page header buffer too small"));
            }
            let hdr = &mut dst[..PAGE_HDR_LEN];
            hdr[header::MAGIC].copy_from_slice(&PAGE_MAGIC);
            hdr[header::FORMAT_VERSION].copy_from_slice(&self.format_version.to_be_bytes());
            hdr[header::PAGE_KIND] = self.kind.as_u8();
            hdr[header::RESERVED] = 0;
            hdr[header::PAGE_SIZE].copy_from_slice(&self.page_size.to_be_bytes());
            hdr[header::PAGE_NO].copy_from_slice(&self.page_no.0.to_be_bytes());
            hdr[header::SALT].copy_from_slice(&self.salt.to_be_bytes());
            hdr[header::CRC32].copy_from_slice(&self.crc32.to_be_bytes());
            Ok(())
        }

        /// Decode and validate the fixed fields from `src`.
        pub fn decode(src: &[u8]) -> Result<Self> {
            if src.len() < PAGE_HDR_LEN {
                return Err(CeibaError::Corruption("page header truncated"));
            }
            let hdr = &src[..PAGE_HDR_LEN];
            let magic: [u8; 4] = hdr[header::MAGIC].try_into().unwrap();
            if magic != PAGE_MAGIC {
                return Err(CeibaError::Corruption("invalid page magic"));
            }
            let format_version =
                u16::from_be_bytes(hdr[header::FORMAT_VERSION].try_into().unwrap());
            if format_version != PAGE_FORMAT_VERSION {
                return Err(CeibaError::Corruption("unsupported page format version"));
            }
            if hdr[header::RESERVED] != 0 {
                return Err(CeibaError::Corruption("page header reserved byte not zero"));
            }
            let kind = PageKind::try_from(hdr[header::PAGE_KIND])?;
            let page_size = u32::from_be_bytes(hdr[header::PAGE_SIZE].try_into().unwrap());
            if (page_size as usize) < PAGE_HDR_LEN {
                return Err(CeibaError::Corruption("page size smaller than header"));
            }
            let page_no = PageId(u64::from_be_bytes(hdr[header::PAGE_NO].try_into().unwrap()));
            let salt = u64::from_be_bytes(hdr[header::SALT].try_into().unwrap());
            let crc32 = u32::from_be_bytes(hdr[header::CRC32].try_into().unwrap());
            Ok(Self {
                format_version,
                kind,
                page_size,
                page_no,
                salt,
                crc32,
            })
        }
    }

    /// Zero the checksum field in place so a fresh CRC can be computed.
    pub fn clear_crc32(buf: &mut [u8]) -> Result<()> {
        if buf.len() < header::CRC32.end {
            return Err(CeibaError::Invalid("page header buffer too small"));
        }
        buf[header::CRC32].fill(0);
        Ok(())
    }
}
