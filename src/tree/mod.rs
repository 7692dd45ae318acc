//! The B-tree core: node codec, structural algorithms, and cursors.

mod cursor;
mod definition;
mod node;

pub use cursor::Cursor;
pub use definition::{BTree, CheckReport, InsertOutcome, KeyComparator, RemoveOutcome};
pub use node::{Node, NodeLayout};
