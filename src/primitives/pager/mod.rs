//! Page store: the backing file as a sequence of fixed-size, checksummed
//! pages with a persistent free list and batched growth.

mod freelist;
mod meta;
#[allow(clippy::module_inception)]
mod pager;

pub use freelist::{free_page_capacity, Extent, FreeSet};
pub use meta::{load_meta, Meta, META_FLAG_SHARED};
pub use pager::{Pager, PagerOptions, Synchronous};
