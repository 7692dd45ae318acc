use std::cmp::Ordering;
use std::collections::HashSet;
use std::mem;
use std::sync::Arc;

use smallvec::SmallVec;
use tracing::debug;

use super::node::{Node, NodeLayout};
use crate::primitives::concurrency::{Latch, LatchMode};
use crate::primitives::pager::Pager;
use crate::types::{CeibaError, PageId, Result};

/// Caller-supplied strict total order over two key buffers of the tree's
/// fixed key size. Must be pure and safe to invoke from any thread; the
/// engine never mutates the buffers.
pub trait KeyComparator: Send + Sync + 'static {
    /// Three-way comparison of `a` against `b`.
    fn compare(&self, a: &[u8], b: &[u8]) -> Ordering;
}

impl<F> KeyComparator for F
where
    F: Fn(&[u8], &[u8]) -> Ordering + Send + Sync + 'static,
{
    fn compare(&self, a: &[u8], b: &[u8]) -> Ordering {
        self(a, b)
    }
}

/// Outcome of an insert.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum InsertOutcome {
    /// The record was added.
    Inserted,
    /// The key already exists; nothing was mutated.
    Duplicate,
}

/// Outcome of a remove.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum RemoveOutcome {
    /// The record was deleted.
    Removed,
    /// The key was not present.
    Missing,
}

/// Result of a full consistency pass.
#[derive(Clone, Debug)]
pub struct CheckReport {
    /// Depth of the leaves (root at depth 0).
    pub depth: usize,
    /// Total records in the tree.
    pub record_count: u64,
    /// Every page id reachable from the root.
    pub reachable: HashSet<u64>,
}

/// The meta page doubles as the tree anchor: its latch acts as the root's
/// parent, serializing root splits and collapses.
const ANCHOR: PageId = PageId(0);

/// One level of a retained descent path: the latched page and the child slot
/// the descent took out of it.
struct Step {
    guard: Latch,
    page: PageId,
    child_idx: usize,
}

type Path = SmallVec<[Step; 8]>;

/// The B-tree core: structural algorithms over pages from the [`Pager`],
/// ordered by a [`KeyComparator`], latched through the pager's latch table.
pub struct BTree {
    pager: Arc<Pager>,
    cmp: Arc<dyn KeyComparator>,
    layout: NodeLayout,
}

impl BTree {
    /// Binds a tree to an open pager. The pager's recorded geometry must
    /// reproduce the file's page size exactly.
    pub fn new(pager: Arc<Pager>, cmp: Arc<dyn KeyComparator>) -> Result<Self> {
        let layout = NodeLayout::compute(pager.order(), pager.key_size(), pager.record_size())?;
        if layout.page_size as usize != pager.page_size() {
            return Err(CeibaError::Corruption("page size disagrees with geometry"));
        }
        Ok(Self { pager, cmp, layout })
    }

    /// The tree's page layout.
    pub fn layout(&self) -> &NodeLayout {
        &self.layout
    }

    /// The underlying page store.
    pub fn pager(&self) -> &Arc<Pager> {
        &self.pager
    }

    /// Writes an empty leaf root into a fresh file.
    pub fn init_empty(&self) -> Result<()> {
        let root_id = self.pager.allocate()?;
        let root = Node::leaf(root_id);
        self.store(&root)?;
        self.pager.set_root(root_id)?;
        Ok(())
    }

    fn load(&self, id: PageId) -> Result<Node> {
        let image = self.pager.read_page(id)?;
        Node::decode(&self.layout, id, &image)
    }

    fn store(&self, node: &Node) -> Result<()> {
        let image = node.encode(&self.layout, self.pager.salt())?;
        self.pager.write_page(node.page_id, &image)
    }

    /// Binary search for `key` within `node`: `Ok(idx)` on an exact match,
    /// `Err(idx)` with the child/insertion slot otherwise.
    fn search(&self, node: &Node, key: &[u8]) -> std::result::Result<usize, usize> {
        let mut lo = 0usize;
        let mut hi = node.records.len();
        while lo < hi {
            let mid = (lo + hi) / 2;
            match self.cmp.compare(key, node.key(&self.layout, mid)) {
                Ordering::Less => hi = mid,
                Ordering::Greater => lo = mid + 1,
                Ordering::Equal => return Ok(mid),
            }
        }
        Err(lo)
    }

    fn check_key(&self, key: &[u8]) -> Result<()> {
        if key.len() != self.layout.key_size as usize {
            return Err(CeibaError::Invalid("key length mismatch"));
        }
        Ok(())
    }

    /// Looks up `key`, returning the full record on a match. The record may
    /// sit in an internal node or a leaf.
    pub fn find(&self, key: &[u8]) -> Result<Option<Vec<u8>>> {
        self.check_key(key)?;
        let latches = self.pager.latches();
        let mut guard = latches.latch(ANCHOR, LatchMode::Shared)?;
        let mut current = self.pager.root()?;
        loop {
            // latch coupling: the parent is released only after the child's
            // latch is granted
            let child = latches.latch(current, LatchMode::Shared)?;
            drop(mem::replace(&mut guard, child));
            let node = self.load(current)?;
            match self.search(&node, key) {
                Ok(idx) => return Ok(Some(node.records[idx].clone())),
                Err(idx) => {
                    if node.is_leaf() {
                        return Ok(None);
                    }
                    current = node.children[idx];
                }
            }
        }
    }

    /// Inserts `record` (keyed by its leading bytes) unless the key already
    /// exists. Splits propagate bottom-up along the retained unsafe path.
    pub fn insert(&self, record: &[u8]) -> Result<InsertOutcome> {
        if record.len() != self.layout.record_size as usize {
            return Err(CeibaError::Invalid("record length mismatch"));
        }
        let key = &record[..self.layout.key_size as usize];
        let latches = self.pager.latches();
        let mut path: Path = SmallVec::new();
        path.push(Step {
            guard: latches.latch(ANCHOR, LatchMode::Exclusive)?,
            page: ANCHOR,
            child_idx: 0,
        });
        let mut current = self.pager.root()?;

        // descend, releasing ancestors at every insert-safe node
        let (mut leaf, leaf_guard, leaf_idx) = loop {
            let guard = latches.latch(current, LatchMode::Exclusive)?;
            let node = self.load(current)?;
            if node.records.len() < self.layout.max_records() {
                path.clear();
            }
            match self.search(&node, key) {
                Ok(_) => return Ok(InsertOutcome::Duplicate),
                Err(idx) => {
                    if node.is_leaf() {
                        break (node, guard, idx);
                    }
                    let child = node.children[idx];
                    path.push(Step {
                        guard,
                        page: current,
                        child_idx: idx,
                    });
                    current = child;
                }
            }
        };

        leaf.records.insert(leaf_idx, record.to_vec());
        if leaf.records.len() <= self.layout.max_records() {
            self.store(&leaf)?;
            return Ok(InsertOutcome::Inserted);
        }
        self.split_upward(&mut path, leaf, leaf_guard)
            .map(|()| InsertOutcome::Inserted)
    }

    /// Splits the overflowed `node` and propagates medians up the retained
    /// path.
    ///
    /// Write order keeps every record reachable at each intermediate point:
    /// new right siblings first (unreferenced until a parent is written),
    /// then the topmost modified ancestor, then the shrunken left halves
    /// top-down. A crash in between leaves at worst transient duplicates,
    /// never a dangling reference or a lost record.
    fn split_upward(&self, path: &mut Path, node: Node, node_guard: Latch) -> Result<()> {
        let mut guards: SmallVec<[Latch; 8]> = SmallVec::new();
        guards.push(node_guard);
        let mut lefts: Vec<Node> = Vec::new();
        let mut current = node;
        loop {
            let (median, right_id) = self.split_node(&mut current)?;
            let left_id = current.page_id;
            lefts.push(current);
            let parent_step = path
                .pop()
                .ok_or(CeibaError::Corruption("latch path underflow"))?;
            if parent_step.page == ANCHOR {
                // root split: a new root adopts both halves, height grows
                let root_id = self.pager.allocate()?;
                let mut root = Node::internal(root_id);
                root.records.push(median);
                root.children.push(left_id);
                root.children.push(right_id);
                self.store(&root)?;
                self.pager.set_root(root_id)?;
                debug!(root = %root_id, "root split");
                guards.push(parent_step.guard);
                break;
            }
            let mut parent = self.load(parent_step.page)?;
            let at = parent_step.child_idx;
            parent.records.insert(at, median);
            parent.children.insert(at + 1, right_id);
            guards.push(parent_step.guard);
            if parent.records.len() <= self.layout.max_records() {
                self.store(&parent)?;
                break;
            }
            current = parent;
        }
        for left in lefts.iter().rev() {
            self.store(left)?;
        }
        Ok(())
    }

    /// Splits an overflowed node at the median, writing only the new right
    /// sibling; the caller defers the left half until its parent is durable.
    fn split_node(&self, node: &mut Node) -> Result<(Vec<u8>, PageId)> {
        let mid = node.records.len() / 2;
        let right_id = self.pager.allocate()?;
        let mut right = if node.is_leaf() {
            Node::leaf(right_id)
        } else {
            Node::internal(right_id)
        };
        right.records = node.records.split_off(mid + 1);
        if !node.is_leaf() {
            right.children = node.children.split_off(mid + 1);
        }
        let median = node
            .records
            .pop()
            .ok_or(CeibaError::Corruption("split of an empty node"))?;
        self.store(&right)?;
        debug!(left = %node.page_id, right = %right_id, "split node");
        Ok((median, right_id))
    }

    /// Removes the record for `key`. A match in an internal node is replaced
    /// by its in-order predecessor; underflow is repaired bottom-up by
    /// borrowing from or merging with siblings.
    pub fn remove(&self, key: &[u8]) -> Result<RemoveOutcome> {
        self.check_key(key)?;
        let latches = self.pager.latches();
        let mut path: Path = SmallVec::new();
        path.push(Step {
            guard: latches.latch(ANCHOR, LatchMode::Exclusive)?,
            page: ANCHOR,
            child_idx: 0,
        });
        let mut current = self.pager.root()?;
        let mut is_root = true;
        // (path index, record index) of an internal node holding the key
        let mut target: Option<(usize, usize)> = None;

        let (mut leaf, leaf_guard, leaf_hit) = loop {
            let guard = latches.latch(current, LatchMode::Exclusive)?;
            let node = self.load(current)?;
            if target.is_none() && self.remove_safe(&node, is_root) {
                path.clear();
            }
            is_root = false;
            if target.is_some() {
                // heading for the in-order predecessor: rightmost descent,
                // retaining every latch down from the replaced node
                if node.is_leaf() {
                    break (node, guard, None);
                }
                let idx = node.children.len() - 1;
                let child = node.children[idx];
                path.push(Step {
                    guard,
                    page: current,
                    child_idx: idx,
                });
                current = child;
                continue;
            }
            match self.search(&node, key) {
                Ok(idx) => {
                    if node.is_leaf() {
                        break (node, guard, Some(idx));
                    }
                    target = Some((path.len(), idx));
                    let child = node.children[idx];
                    path.push(Step {
                        guard,
                        page: current,
                        child_idx: idx,
                    });
                    current = child;
                }
                Err(idx) => {
                    if node.is_leaf() {
                        return Ok(RemoveOutcome::Missing);
                    }
                    let child = node.children[idx];
                    path.push(Step {
                        guard,
                        page: current,
                        child_idx: idx,
                    });
                    current = child;
                }
            }
        };

        match (target, leaf_hit) {
            (Some((path_idx, rec_idx)), _) => {
                // the leaf's last record is the predecessor; it moves up to
                // replace the internal match. Leaf first: between the two
                // writes the old key is still present and nothing is lost.
                let pred = leaf
                    .records
                    .pop()
                    .ok_or(CeibaError::Corruption("empty leaf on predecessor path"))?;
                self.store(&leaf)?;
                let internal_page = path[path_idx].page;
                let mut internal = self.load(internal_page)?;
                internal.records[rec_idx] = pred;
                self.store(&internal)?;
            }
            (None, Some(idx)) => {
                leaf.records.remove(idx);
                self.store(&leaf)?;
            }
            (None, None) => return Ok(RemoveOutcome::Missing),
        }
        self.fix_underflow(&mut path, leaf, leaf_guard)?;
        Ok(RemoveOutcome::Removed)
    }

    /// Whether removing one record from `node` can never propagate a
    /// structural change above it.
    fn remove_safe(&self, node: &Node, is_root: bool) -> bool {
        if is_root {
            // a leaf root may empty out legally; an internal root collapses
            // only when its last record leaves
            node.is_leaf() || node.records.len() >= 2
        } else {
            node.records.len() > self.layout.min_records()
        }
    }

    /// Repairs underflow from `node` upward along the retained path.
    ///
    /// Both siblings are latched and loaded before the rebalance decision so
    /// the surplus check and the chosen repair see the same state. The
    /// absorbing or growing page is always written before the page that
    /// sheds records, and a merged-away page is freed only after its parent
    /// no longer references it.
    fn fix_underflow(&self, path: &mut Path, start: Node, start_guard: Latch) -> Result<()> {
        let latches = self.pager.latches();
        let mut node = start;
        let mut node_guard = start_guard;
        loop {
            let parent_info = match path.last() {
                Some(step) if step.page != ANCHOR => Some((step.page, step.child_idx)),
                Some(_) => None,               // node is the root, anchored
                None => return Ok(()),         // released at a safe node
            };
            let Some((parent_page, pos)) = parent_info else {
                // root: collapse when an internal root runs out of records
                if !node.is_leaf() && node.records.is_empty() {
                    let only_child = node.children[0];
                    self.pager.set_root(only_child)?;
                    self.pager.free(node.page_id)?;
                    debug!(old_root = %node.page_id, new_root = %only_child, "root collapse");
                }
                return Ok(());
            };
            if node.records.len() >= self.layout.min_records() {
                return Ok(());
            }

            let mut parent = self.load(parent_page)?;
            let mut left = if pos > 0 {
                let id = parent.children[pos - 1];
                let guard = latches.latch(id, LatchMode::Exclusive)?;
                Some((guard, self.load(id)?))
            } else {
                None
            };
            let mut right = if pos + 1 < parent.children.len() {
                let id = parent.children[pos + 1];
                let guard = latches.latch(id, LatchMode::Exclusive)?;
                Some((guard, self.load(id)?))
            } else {
                None
            };

            // rotate from whichever sibling has surplus
            if let Some((_, left)) = left
                .as_mut()
                .filter(|(_, n)| n.records.len() > self.layout.min_records())
            {
                let sep = mem::replace(
                    &mut parent.records[pos - 1],
                    left.records
                        .pop()
                        .ok_or(CeibaError::Corruption("borrow from empty sibling"))?,
                );
                node.records.insert(0, sep);
                if !node.is_leaf() {
                    let child = left
                        .children
                        .pop()
                        .ok_or(CeibaError::Corruption("internal sibling without children"))?;
                    node.children.insert(0, child);
                }
                self.store(&node)?;
                self.store(&parent)?;
                self.store(left)?;
                debug!(node = %node.page_id, sibling = %left.page_id, "borrowed from left");
                return Ok(());
            }
            if let Some((_, right)) = right
                .as_mut()
                .filter(|(_, n)| n.records.len() > self.layout.min_records())
            {
                let sep = mem::replace(&mut parent.records[pos], right.records.remove(0));
                node.records.push(sep);
                if !node.is_leaf() {
                    node.children.push(right.children.remove(0));
                }
                self.store(&node)?;
                self.store(&parent)?;
                self.store(right)?;
                debug!(node = %node.page_id, sibling = %right.page_id, "borrowed from right");
                return Ok(());
            }

            // no surplus anywhere: merge with a sibling and pull the
            // separator down out of the parent
            let freed = if let Some((_left_guard, mut left)) = left.take() {
                left.records.push(parent.records.remove(pos - 1));
                left.records.append(&mut node.records);
                left.children.append(&mut node.children);
                parent.children.remove(pos);
                self.store(&left)?;
                self.store(&parent)?;
                debug!(into = %left.page_id, from = %node.page_id, "merged with left sibling");
                node.page_id
            } else if let Some((_right_guard, mut right)) = right.take() {
                node.records.push(parent.records.remove(pos));
                node.records.append(&mut right.records);
                node.children.append(&mut right.children);
                parent.children.remove(pos + 1);
                self.store(&node)?;
                self.store(&parent)?;
                debug!(into = %node.page_id, from = %right.page_id, "merged with right sibling");
                right.page_id
            } else {
                return Err(CeibaError::Corruption("underflowed node has no siblings"));
            };
            self.pager.free(freed)?;

            // the parent shed a record; continue the check one level up
            let parent_step = path
                .pop()
                .ok_or(CeibaError::Corruption("latch path underflow"))?;
            node = parent;
            drop(mem::replace(&mut node_guard, parent_step.guard));
        }
    }

    /// Walks the whole tree, validating structural invariants and page
    /// integrity, and collects the reachable page set.
    pub fn check(&self) -> Result<CheckReport> {
        let latches = self.pager.latches();
        // a shared anchor latch quiesces writers for the duration of the pass
        let _anchor = latches.latch(ANCHOR, LatchMode::Shared)?;
        let root = self.pager.root()?;
        let mut report = CheckReport {
            depth: 0,
            record_count: 0,
            reachable: HashSet::new(),
        };
        let depth = self.check_node(root, None, None, 0, true, &mut report)?;
        report.depth = depth;
        Ok(report)
    }

    fn check_node(
        &self,
        id: PageId,
        lower: Option<&[u8]>,
        upper: Option<&[u8]>,
        depth: usize,
        is_root: bool,
        report: &mut CheckReport,
    ) -> Result<usize> {
        if !report.reachable.insert(id.0) {
            return Err(CeibaError::Corruption("page referenced twice"));
        }
        let node = self.load(id)?;
        if node.records.len() > self.layout.max_records() {
            return Err(CeibaError::Corruption("node above maximum fill"));
        }
        if !is_root && node.records.len() < self.layout.min_records() {
            return Err(CeibaError::Corruption("node below minimum fill"));
        }
        if is_root && !node.is_leaf() && node.records.is_empty() {
            return Err(CeibaError::Corruption("internal root without records"));
        }
        for i in 0..node.records.len() {
            let k = node.key(&self.layout, i);
            if i > 0 && self.cmp.compare(node.key(&self.layout, i - 1), k) != Ordering::Less {
                return Err(CeibaError::Corruption("node keys out of order"));
            }
            if let Some(lo) = lower {
                if self.cmp.compare(lo, k) != Ordering::Less {
                    return Err(CeibaError::Corruption("key below subtree bound"));
                }
            }
            if let Some(hi) = upper {
                if self.cmp.compare(k, hi) != Ordering::Less {
                    return Err(CeibaError::Corruption("key above subtree bound"));
                }
            }
        }
        report.record_count += node.records.len() as u64;
        if node.is_leaf() {
            return Ok(depth);
        }
        let mut leaf_depth: Option<usize> = None;
        for i in 0..node.children.len() {
            let lo = if i == 0 {
                lower
            } else {
                Some(node.key(&self.layout, i - 1))
            };
            let hi = if i == node.records.len() {
                upper
            } else {
                Some(node.key(&self.layout, i))
            };
            let d = self.check_node(node.children[i], lo, hi, depth + 1, false, report)?;
            match leaf_depth {
                Some(expected) if expected != d => {
                    return Err(CeibaError::Corruption("leaves at unequal depth"));
                }
                _ => leaf_depth = Some(d),
            }
        }
        leaf_depth.ok_or(CeibaError::Corruption("internal node without children"))
    }

    /// Smallest record in the tree, if any.
    pub(crate) fn first_record(&self) -> Result<Option<Vec<u8>>> {
        let latches = self.pager.latches();
        let mut guard = latches.latch(ANCHOR, LatchMode::Shared)?;
        let mut current = self.pager.root()?;
        loop {
            let child = latches.latch(current, LatchMode::Shared)?;
            drop(mem::replace(&mut guard, child));
            let node = self.load(current)?;
            if node.is_leaf() {
                return Ok(node.records.first().cloned());
            }
            current = node.children[0];
        }
    }

    /// Smallest record whose key compares strictly greater than `key`.
    pub(crate) fn next_after(&self, key: &[u8]) -> Result<Option<Vec<u8>>> {
        self.check_key(key)?;
        let latches = self.pager.latches();
        let mut guard = latches.latch(ANCHOR, LatchMode::Shared)?;
        let mut current = self.pager.root()?;
        let mut candidate: Option<Vec<u8>> = None;
        loop {
            let child = latches.latch(current, LatchMode::Shared)?;
            drop(mem::replace(&mut guard, child));
            let node = self.load(current)?;
            // first slot whose key is strictly greater than the probe
            let idx = match self.search(&node, key) {
                Ok(i) => i + 1,
                Err(i) => i,
            };
            if node.is_leaf() {
                return Ok(node.records.get(idx).cloned().or(candidate));
            }
            if idx < node.records.len() {
                candidate = Some(node.records[idx].clone());
            }
            current = node.children[idx];
        }
    }
}
