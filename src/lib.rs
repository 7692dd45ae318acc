//! Ceiba: an embedded, file-resident ordered index engine.
//!
//! A single backing file holds a B-tree of fixed-size records ordered by a
//! caller-supplied comparator over the records' leading key bytes. The engine
//! links directly into the application; in shared mode the latch table moves
//! into OS file locks so cooperating processes can mutate the same index
//! safely.

#![warn(missing_docs)]

pub mod db;
pub mod primitives;
pub mod tree;
pub mod types;

pub use db::{CreateOptions, FatalHook, Index, OpenOptions, State};
pub use primitives::pager::{PagerOptions, Synchronous};
pub use tree::{Cursor, KeyComparator};
pub use types::{CeibaError, PageId, Result};
