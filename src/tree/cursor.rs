use super::definition::BTree;
use crate::types::Result;

/// Forward cursor over the tree's records in key order.
///
/// Each step re-descends from the last key returned, so the cursor holds no
/// latches between steps and tolerates concurrent structural changes: a
/// surviving key is returned exactly once, keys inserted behind the cursor
/// are skipped, and keys removed ahead of it are simply not seen.
pub struct Cursor<'a> {
    tree: &'a BTree,
    last_key: Option<Vec<u8>>,
    done: bool,
}

impl<'a> Cursor<'a> {
    pub(crate) fn new(tree: &'a BTree) -> Self {
        Self {
            tree,
            last_key: None,
            done: false,
        }
    }

    /// Returns the next record, or `None` once the keys are exhausted.
    pub fn next(&mut self) -> Result<Option<Vec<u8>>> {
        if self.done {
            return Ok(None);
        }
        let record = match &self.last_key {
            None => self.tree.first_record()?,
            Some(key) => self.tree.next_after(key)?,
        };
        match record {
            Some(record) => {
                let key_size = self.tree.layout().key_size as usize;
                self.last_key = Some(record[..key_size].to_vec());
                Ok(Some(record))
            }
            None => {
                self.done = true;
                Ok(None)
            }
        }
    }

    /// Rewinds the cursor to the start of the key space.
    pub fn rewind(&mut self) {
        self.last_key = None;
        self.done = false;
    }
}

impl BTree {
    /// Opens a forward cursor over the whole tree.
    pub fn cursor(&self) -> Cursor<'_> {
        Cursor::new(self)
    }
}
