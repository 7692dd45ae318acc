use std::convert::TryInto;

use crate::types::{
    page::{self, PageHeader, PageKind, PAGE_HDR_LEN},
    page_crc32, CeibaError, PageId, Result,
};

/// Node payload header: record count (u16) plus reserved padding.
const NODE_HDR_LEN: usize = 8;

/// Meta page 0 needs this much payload; node pages must be at least as big.
const META_PAYLOAD_LEN: usize = 64;

/// Geometry of every node page, derived from the tree order and the fixed
/// key/record sizes at create time.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct NodeLayout {
    /// Maximum children per internal node.
    pub order: u16,
    /// Fixed key size (leading bytes of each record).
    pub key_size: u32,
    /// Fixed record size.
    pub record_size: u32,
    /// Resulting page size in bytes.
    pub page_size: u32,
}

impl NodeLayout {
    /// Validates the geometry and computes the page size. Each node page has
    /// one spare record slot beyond `order - 1` so an overflowing insert can
    /// be materialized before its split.
    pub fn compute(order: u16, key_size: u32, record_size: u32) -> Result<Self> {
        if order < 3 {
            return Err(CeibaError::Invalid("order below minimum of 3"));
        }
        if key_size == 0 {
            return Err(CeibaError::Invalid("key size must be nonzero"));
        }
        if record_size < key_size {
            return Err(CeibaError::Invalid("record size smaller than key size"));
        }
        let order_u = order as u64;
        let raw = PAGE_HDR_LEN as u64
            + NODE_HDR_LEN as u64
            + order_u * record_size as u64
            + (order_u + 1) * 8;
        let min = (PAGE_HDR_LEN + META_PAYLOAD_LEN).max(128) as u64;
        let page_size = raw.max(min).div_ceil(64) * 64;
        if page_size > u32::MAX as u64 {
            return Err(CeibaError::Invalid("page size exceeds format limit"));
        }
        Ok(Self {
            order,
            key_size,
            record_size,
            page_size: page_size as u32,
        })
    }

    /// Maximum records a node may hold at rest.
    pub fn max_records(&self) -> usize {
        self.order as usize - 1
    }

    /// Minimum records every non-root node must hold: ⌈order/2⌉ − 1.
    pub fn min_records(&self) -> usize {
        (self.order as usize + 1) / 2 - 1
    }

    fn records_offset(&self) -> usize {
        PAGE_HDR_LEN + NODE_HDR_LEN
    }

    fn children_offset(&self) -> usize {
        self.records_offset() + self.order as usize * self.record_size as usize
    }
}

/// A materialized node page: records in key order, plus child pointers for
/// internal nodes.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Node {
    /// The page hosting this node.
    pub page_id: PageId,
    /// Leaf or internal.
    pub kind: PageKind,
    /// Records in strictly increasing key order.
    pub records: Vec<Vec<u8>>,
    /// Child page ids; empty for leaves, `records.len() + 1` for internal
    /// nodes.
    pub children: Vec<PageId>,
}

impl Node {
    /// A fresh empty leaf.
    pub fn leaf(page_id: PageId) -> Self {
        Self {
            page_id,
            kind: PageKind::Leaf,
            records: Vec::new(),
            children: Vec::new(),
        }
    }

    /// A fresh empty internal node.
    pub fn internal(page_id: PageId) -> Self {
        Self {
            page_id,
            kind: PageKind::Internal,
            records: Vec::new(),
            children: Vec::new(),
        }
    }

    /// Whether this node is a leaf.
    pub fn is_leaf(&self) -> bool {
        self.kind == PageKind::Leaf
    }

    /// The key bytes of record `idx`.
    pub fn key<'a>(&'a self, layout: &NodeLayout, idx: usize) -> &'a [u8] {
        &self.records[idx][..layout.key_size as usize]
    }

    /// Decodes a node from a verified page image.
    pub fn decode(layout: &NodeLayout, page_id: PageId, buf: &[u8]) -> Result<Self> {
        if buf.len() != layout.page_size as usize {
            return Err(CeibaError::Corruption("node page length mismatch"));
        }
        let header = PageHeader::decode(buf)?;
        let kind = match header.kind {
            PageKind::Leaf | PageKind::Internal => header.kind,
            _ => return Err(CeibaError::Corruption("page is not a tree node")),
        };
        let payload = &buf[PAGE_HDR_LEN..];
        let count = u16::from_be_bytes(payload[0..2].try_into().unwrap()) as usize;
        if payload[2..NODE_HDR_LEN].iter().any(|b| *b != 0) {
            return Err(CeibaError::Corruption("node reserved bytes non-zero"));
        }
        if count > layout.max_records() {
            return Err(CeibaError::Corruption("node record count exceeds order"));
        }
        let record_size = layout.record_size as usize;
        let records_off = layout.records_offset();
        let mut records = Vec::with_capacity(count);
        for i in 0..count {
            let start = records_off + i * record_size;
            records.push(buf[start..start + record_size].to_vec());
        }
        let mut children = Vec::new();
        if kind == PageKind::Internal {
            // count 0 with a single child is a legal transient left behind by
            // an interrupted merge; the consistency checker flags it.
            let children_off = layout.children_offset();
            children.reserve(count + 1);
            for i in 0..count + 1 {
                let start = children_off + i * 8;
                let id = u64::from_be_bytes(buf[start..start + 8].try_into().unwrap());
                if id == 0 {
                    return Err(CeibaError::Corruption("internal node has null child"));
                }
                if id == page_id.0 {
                    return Err(CeibaError::Corruption("node references itself"));
                }
                children.push(PageId(id));
            }
        }
        Ok(Self {
            page_id,
            kind,
            records,
            children,
        })
    }

    /// Encodes this node into a full page image with header and checksum.
    pub fn encode(&self, layout: &NodeLayout, salt: u64) -> Result<Vec<u8>> {
        if self.records.len() > layout.max_records() {
            return Err(CeibaError::Invalid("node exceeds record capacity"));
        }
        match self.kind {
            PageKind::Leaf => {
                if !self.children.is_empty() {
                    return Err(CeibaError::Invalid("leaf node with children"));
                }
            }
            PageKind::Internal => {
                if self.children.len() != self.records.len() + 1 {
                    return Err(CeibaError::Invalid("internal child count mismatch"));
                }
            }
            _ => return Err(CeibaError::Invalid("node kind must be leaf or internal")),
        }
        let record_size = layout.record_size as usize;
        let mut buf = vec![0u8; layout.page_size as usize];
        let header = PageHeader::new(self.page_id, self.kind, layout.page_size, salt)?;
        header.encode(&mut buf[..PAGE_HDR_LEN])?;
        buf[PAGE_HDR_LEN..PAGE_HDR_LEN + 2]
            .copy_from_slice(&(self.records.len() as u16).to_be_bytes());
        let records_off = layout.records_offset();
        for (i, record) in self.records.iter().enumerate() {
            if record.len() != record_size {
                return Err(CeibaError::Invalid("record length mismatch"));
            }
            let start = records_off + i * record_size;
            buf[start..start + record_size].copy_from_slice(record);
        }
        let children_off = layout.children_offset();
        for (i, child) in self.children.iter().enumerate() {
            let start = children_off + i * 8;
            buf[start..start + 8].copy_from_slice(&child.0.to_be_bytes());
        }
        page::clear_crc32(&mut buf[..PAGE_HDR_LEN])?;
        let crc = page_crc32(self.page_id.0, salt, &buf);
        buf[page::header::CRC32].copy_from_slice(&crc.to_be_bytes());
        Ok(buf)
    }
}
