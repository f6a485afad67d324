//! Insert, remove and replace.
//!
//! A [`Writer`] runs one mutation under the exclusive tree lock. It works on
//! decoded copies of the nodes along the search path and writes every node
//! it changes back through the transaction. Header changes (root, height,
//! free list) are written once, by [`Writer::finish`].

use crate::duplicate::{DuplicateNode, FragmentNode, MAX_FRAGMENT_VALUES, ValueSlot};
use crate::header::{MAX_HEIGHT, TreeHeader};
use crate::node::{self, NODE_HEADER_SIZE, Node, bad, entry_size};
use crate::{BPlusTree, link};
use bfs_error::{BfsError, Result};
use bfs_journal::Transaction;
use bfs_types::{BlockNumber, NULL_LINK};
use tracing::{debug, trace};

/// Nodes an insert may consume: one split per level, a new root, and one
/// fragment or duplicate node.
pub(crate) fn insert_reserve(header: &TreeHeader) -> usize {
    header.height as usize + 1 + usize::from(header.allows_duplicates())
}

/// Folding a duplicate chain back into a fragment may need a fresh
/// fragment node.
pub(crate) fn remove_reserve(header: &TreeHeader) -> usize {
    usize::from(header.allows_duplicates())
}

/// Encoded size below which a non-root node is merged or refilled.
pub(crate) fn min_fill(node_size: usize) -> usize {
    NODE_HEADER_SIZE + (node_size - NODE_HEADER_SIZE) / 4
}

/// Split position in `lo..=hi` that best balances the encoded bytes of
/// the entries on either side.
fn split_point(keys: &[Vec<u8>], lo: usize, hi: usize) -> usize {
    let total: usize = keys.iter().map(|key| entry_size(key)).sum();
    let mut best = lo;
    let mut best_gap = usize::MAX;
    let mut prefix: usize = keys[..lo].iter().map(|key| entry_size(key)).sum();
    for at in lo..=hi {
        let gap = (2 * prefix).abs_diff(total);
        if gap < best_gap {
            best = at;
            best_gap = gap;
        }
        prefix += entry_size(&keys[at]);
    }
    best
}

/// One node on the path from the root to a leaf.
struct Step {
    block: BlockNumber,
    node: Node,
    /// Child slot followed from this node; unused for the leaf.
    index: usize,
}

pub(crate) struct Writer<'a, 't> {
    tree: &'a BPlusTree,
    txn: &'a Transaction<'t>,
    header: TreeHeader,
    dirty: bool,
}

impl<'a, 't> Writer<'a, 't> {
    /// Start a mutation. `reserved` blocks join the free list first.
    pub(crate) fn new(
        tree: &'a BPlusTree,
        txn: &'a Transaction<'t>,
        reserved: Vec<BlockNumber>,
    ) -> Result<Self> {
        let mut writer = Self {
            tree,
            txn,
            header: tree.read_header()?,
            dirty: false,
        };
        for block in reserved {
            writer.header.node_count += 1;
            writer.release(block)?;
        }
        Ok(writer)
    }

    pub(crate) fn finish(self) -> Result<()> {
        if self.dirty {
            self.write(self.tree.header_block, &self.header.encode())?;
        }
        Ok(())
    }

    // ── Blocks ──────────────────────────────────────────────────────────────

    fn write(&self, block: BlockNumber, bytes: &[u8]) -> Result<()> {
        self.txn.get_writable(block)?.copy_from_slice(bytes);
        Ok(())
    }

    fn store(&self, block: BlockNumber, node: &Node) -> Result<()> {
        self.write(block, &node.encode(self.tree.node_size())?)
    }

    /// Pop a node off the free list.
    fn take(&mut self) -> Result<BlockNumber> {
        if self.header.free_head == NULL_LINK {
            return Err(BfsError::Invariant(format!(
                "tree {} ran out of reserved nodes",
                self.tree.header_block
            )));
        }
        let block = self
            .tree
            .link_block(self.header.free_head, self.tree.header_block)?;
        self.header.free_head = node::decode_free(&self.tree.read_block(block)?, block)?;
        self.dirty = true;
        trace!(target: "bfs::btree", block = block.0, "btree_node_take");
        Ok(block)
    }

    /// Push a node onto the free list.
    fn release(&mut self, block: BlockNumber) -> Result<()> {
        self.write(
            block,
            &node::encode_free(self.tree.node_size(), self.header.free_head),
        )?;
        self.header.free_head = link(block);
        self.dirty = true;
        trace!(target: "bfs::btree", block = block.0, "btree_node_release");
        Ok(())
    }

    /// Detach free-list nodes beyond `keep` from the tree.
    pub(crate) fn detach_free_nodes(&mut self, keep: usize) -> Result<Vec<BlockNumber>> {
        let limit = usize::try_from(self.header.node_count).unwrap_or(usize::MAX);
        let total = self.tree.free_list_len(&self.header, limit)?;
        let mut detached = Vec::with_capacity(total.saturating_sub(keep));
        while total - detached.len() > keep {
            detached.push(self.take()?);
        }
        self.header.node_count -= i64::try_from(detached.len()).unwrap_or(0);
        Ok(detached)
    }

    fn descend(&self, key: &[u8]) -> Result<Vec<Step>> {
        let height = self.header.height;
        let mut path = Vec::with_capacity(height as usize);
        let mut block = self
            .tree
            .link_block(self.header.root, self.tree.header_block)?;
        for depth in 1..=height {
            let node = self.tree.load_node(block)?;
            if node.leaf != (depth == height) {
                return Err(bad(
                    block,
                    format!("node at depth {depth} of {height} has leaf={}", node.leaf),
                ));
            }
            if node.leaf {
                path.push(Step {
                    block,
                    node,
                    index: 0,
                });
                return Ok(path);
            }
            let index = self.tree.child_index(&node, key);
            let child = self.tree.link_block(node.child(index), block)?;
            path.push(Step { block, node, index });
            block = child;
        }
        Err(bad(self.tree.header_block, "tree has no leaf level"))
    }

    // ── Insert ──────────────────────────────────────────────────────────────

    pub(crate) fn insert(&mut self, key: &[u8], value: i64) -> Result<()> {
        let mut path = self.descend(key)?;
        let Some(mut leaf) = path.pop() else {
            return Err(bad(self.tree.header_block, "empty search path"));
        };
        match self.tree.search(&leaf.node, key) {
            Ok(index) => {
                if !self.header.allows_duplicates() {
                    return Err(BfsError::Exists);
                }
                let raw = leaf.node.values[index];
                let updated = self.append_duplicate(leaf.block, &leaf.node, raw, value)?;
                if updated != raw {
                    leaf.node.values[index] = updated;
                    self.store(leaf.block, &leaf.node)?;
                }
                trace!(target: "bfs::btree", leaf = leaf.block.0, "btree_insert_duplicate");
                return Ok(());
            }
            Err(index) => {
                leaf.node.keys.insert(index, key.to_vec());
                leaf.node.values.insert(index, value);
            }
        }
        trace!(target: "bfs::btree", leaf = leaf.block.0, key_len = key.len(), "btree_insert");
        if leaf.node.fits(self.tree.node_size()) {
            return self.store(leaf.block, &leaf.node);
        }

        let (mut separator, mut right) = self.split(leaf.block, leaf.node)?;
        while let Some(mut parent) = path.pop() {
            parent.node.keys.insert(parent.index, separator);
            parent.node.values.insert(parent.index + 1, link(right));
            if parent.node.fits(self.tree.node_size()) {
                return self.store(parent.block, &parent.node);
            }
            (separator, right) = self.split(parent.block, parent.node)?;
        }
        self.grow(separator, right)
    }

    /// Divide an overfull (or, when refilling, a merged) node by encoded
    /// bytes. Returns the left part, the separator and the right part;
    /// sibling links are left for the caller.
    fn halve(&self, mut node: Node, block: BlockNumber) -> Result<(Node, Vec<u8>, Node)> {
        let n = node.len();
        if node.leaf {
            if n < 2 {
                return Err(BfsError::Invariant(format!(
                    "cannot split leaf {block} holding {n} keys"
                )));
            }
            let at = split_point(&node.keys, 1, n - 1);
            let right = Node {
                left: NULL_LINK,
                right: NULL_LINK,
                leaf: true,
                keys: node.keys.split_off(at),
                values: node.values.split_off(at),
            };
            let separator = right.keys[0].clone();
            Ok((node, separator, right))
        } else {
            if n < 3 {
                return Err(BfsError::Invariant(format!(
                    "cannot split internal node {block} holding {n} keys"
                )));
            }
            let at = split_point(&node.keys, 1, n - 2);
            let mut right_keys = node.keys.split_off(at);
            let separator = right_keys.remove(0);
            let right = Node {
                left: NULL_LINK,
                right: NULL_LINK,
                leaf: false,
                keys: right_keys,
                values: node.values.split_off(at + 1),
            };
            Ok((node, separator, right))
        }
    }

    /// Split `node` (stored at `block`) into itself and a new right
    /// sibling. Returns the separator for the parent and the new block.
    fn split(&mut self, block: BlockNumber, node: Node) -> Result<(Vec<u8>, BlockNumber)> {
        let right_block = self.take()?;
        let (mut left, separator, mut right) = self.halve(node, block)?;
        if left.leaf {
            right.left = link(block);
            right.right = left.right;
            if left.right != NULL_LINK {
                let next_block = self.tree.link_block(left.right, block)?;
                let mut next = self.tree.load_node(next_block)?;
                next.left = link(right_block);
                self.store(next_block, &next)?;
            }
            left.right = link(right_block);
        }
        self.store(block, &left)?;
        self.store(right_block, &right)?;
        debug!(
            target: "bfs::btree",
            node = block.0,
            new_node = right_block.0,
            leaf = left.leaf,
            left_keys = left.len(),
            right_keys = right.len(),
            "btree_split"
        );
        Ok((separator, right_block))
    }

    /// Root split: a new root above the old one.
    fn grow(&mut self, separator: Vec<u8>, right: BlockNumber) -> Result<()> {
        if self.header.height >= MAX_HEIGHT {
            return Err(BfsError::NoSpace);
        }
        let root_block = self.take()?;
        let mut root = Node::root_over(self.header.root);
        root.keys.push(separator);
        root.values.push(link(right));
        self.store(root_block, &root)?;
        self.header.root = link(root_block);
        self.header.height += 1;
        self.dirty = true;
        debug!(
            target: "bfs::btree",
            root = root_block.0,
            height = self.header.height,
            "btree_grow"
        );
        Ok(())
    }

    // ── Remove ──────────────────────────────────────────────────────────────

    pub(crate) fn remove(&mut self, key: &[u8], value: i64) -> Result<()> {
        let mut path = self.descend(key)?;
        let Some(leaf) = path.last_mut() else {
            return Err(bad(self.tree.header_block, "empty search path"));
        };
        let index = self
            .tree
            .search(&leaf.node, key)
            .map_err(|_| BfsError::NotFound)?;
        match ValueSlot::decode(leaf.node.values[index], leaf.block)? {
            ValueSlot::Single(stored) if stored == value => {
                leaf.node.keys.remove(index);
                leaf.node.values.remove(index);
                self.store(leaf.block, &leaf.node)?;
                trace!(target: "bfs::btree", leaf = leaf.block.0, "btree_remove");
            }
            ValueSlot::Single(_) => return Err(BfsError::NotFound),
            slot => {
                let updated = self.remove_duplicate(leaf.block, &leaf.node, slot, value)?;
                leaf.node.values[index] = updated;
                self.store(leaf.block, &leaf.node)?;
                trace!(target: "bfs::btree", leaf = leaf.block.0, "btree_remove_duplicate");
                return Ok(());
            }
        }
        self.rebalance(path)?;
        self.collapse_root()
    }

    /// Walk up from the leaf, fixing underfull nodes until one is not.
    fn rebalance(&mut self, mut path: Vec<Step>) -> Result<()> {
        let minimum = min_fill(self.tree.node_size());
        while path.len() >= 2 {
            let Some(child) = path.pop() else { break };
            if child.node.used_bytes() >= minimum {
                break;
            }
            let Some(parent) = path.last_mut() else { break };
            self.fix_underflow(parent, child)?;
        }
        Ok(())
    }

    /// Merge `child` with a sibling under `parent`, or move entries over
    /// from the sibling when the two do not fit one node.
    fn fix_underflow(&mut self, parent: &mut Step, child: Step) -> Result<()> {
        if parent.node.len() == 0 {
            return Ok(());
        }
        let (slot, left_block, left, right_block, right) = if parent.index > 0 {
            let slot = parent.index - 1;
            let block = self.tree.link_block(parent.node.child(slot), parent.block)?;
            let left = self.tree.load_node(block)?;
            (slot, block, left, child.block, child.node)
        } else {
            let block = self.tree.link_block(parent.node.child(1), parent.block)?;
            let right = self.tree.load_node(block)?;
            (0, child.block, child.node, block, right)
        };
        if left.leaf != right.leaf {
            return Err(bad(parent.block, "children of one node on different levels"));
        }

        let leaf = left.leaf;
        let (left_link, right_link) = (left.left, right.right);
        let mut merged = left;
        if !leaf {
            merged.keys.push(parent.node.keys[slot].clone());
            merged.values.extend(right.values.iter().copied());
            merged.keys.extend(right.keys.iter().cloned());
        } else {
            merged.keys.extend(right.keys.iter().cloned());
            merged.values.extend(right.values.iter().copied());
            merged.right = right_link;
        }

        if merged.fits(self.tree.node_size()) {
            if leaf && right_link != NULL_LINK {
                let next_block = self.tree.link_block(right_link, right_block)?;
                let mut next = self.tree.load_node(next_block)?;
                next.left = link(left_block);
                self.store(next_block, &next)?;
            }
            self.store(left_block, &merged)?;
            self.release(right_block)?;
            parent.node.keys.remove(slot);
            parent.node.values.remove(slot + 1);
            self.store(parent.block, &parent.node)?;
            debug!(
                target: "bfs::btree",
                node = left_block.0,
                freed = right_block.0,
                leaf,
                keys = merged.len(),
                "btree_merge"
            );
            return Ok(());
        }

        let (mut new_left, separator, mut new_right) = self.halve(merged, left_block)?;
        let previous = std::mem::replace(&mut parent.node.keys[slot], separator);
        if !parent.node.fits(self.tree.node_size()) {
            // A longer separator would overflow the parent; stay underfull.
            parent.node.keys[slot] = previous;
            return Ok(());
        }
        if leaf {
            new_left.left = left_link;
            new_left.right = link(right_block);
            new_right.left = link(left_block);
            new_right.right = right_link;
        }
        self.store(left_block, &new_left)?;
        self.store(right_block, &new_right)?;
        self.store(parent.block, &parent.node)?;
        debug!(
            target: "bfs::btree",
            left = left_block.0,
            right = right_block.0,
            left_keys = new_left.len(),
            right_keys = new_right.len(),
            "btree_redistribute"
        );
        Ok(())
    }

    /// Drop internal roots that only have their overflow child left.
    fn collapse_root(&mut self) -> Result<()> {
        while self.header.height > 1 {
            let root_block = self
                .tree
                .link_block(self.header.root, self.tree.header_block)?;
            let root = self.tree.load_node(root_block)?;
            if root.leaf || root.len() > 0 {
                break;
            }
            self.header.root = root.child(0);
            self.header.height -= 1;
            self.release(root_block)?;
            debug!(
                target: "bfs::btree",
                root = self.header.root,
                height = self.header.height,
                "btree_shrink"
            );
        }
        Ok(())
    }

    // ── Replace ─────────────────────────────────────────────────────────────

    pub(crate) fn replace(&mut self, key: &[u8], value: i64) -> Result<()> {
        let mut path = self.descend(key)?;
        let Some(leaf) = path.last_mut() else {
            return Err(bad(self.tree.header_block, "empty search path"));
        };
        let index = self
            .tree
            .search(&leaf.node, key)
            .map_err(|_| BfsError::NotFound)?;
        match ValueSlot::decode(leaf.node.values[index], leaf.block)? {
            ValueSlot::Single(_) => {
                leaf.node.values[index] = value;
                self.store(leaf.block, &leaf.node)
            }
            _ => Err(BfsError::InvalidArgument(
                "cannot replace the value of a key holding duplicates".to_owned(),
            )),
        }
    }

    // ── Duplicates ──────────────────────────────────────────────────────────

    /// A free fragment slot: in a fragment node already used by `leaf`, or
    /// in a fresh one.
    fn fragment_slot(
        &mut self,
        leaf_block: BlockNumber,
        leaf: &Node,
    ) -> Result<(BlockNumber, FragmentNode, usize)> {
        let mut seen = Vec::new();
        for raw in &leaf.values {
            if let ValueSlot::Fragment { block, .. } = ValueSlot::decode(*raw, leaf_block)? {
                if seen.contains(&block) {
                    continue;
                }
                seen.push(block);
                let fragment = self.tree.load_fragment(block)?;
                if let Some(index) = fragment.free_slot() {
                    return Ok((block, fragment, index));
                }
            }
        }
        let block = self.take()?;
        Ok((block, FragmentNode::empty(self.tree.node_size()), 0))
    }

    /// Write a fragment node back, or free it once no slot is in use.
    fn store_fragment(&mut self, block: BlockNumber, fragment: &FragmentNode) -> Result<()> {
        if fragment.is_empty() {
            self.release(block)
        } else {
            self.write(block, &fragment.encode(self.tree.node_size()))
        }
    }

    fn fragment_values<'f>(
        fragment: &'f mut FragmentNode,
        block: BlockNumber,
        index: usize,
    ) -> Result<&'f mut Vec<i64>> {
        fragment
            .slots
            .get_mut(index)
            .filter(|values| values.len() >= 2)
            .ok_or_else(|| bad(block, format!("fragment {index} is not a duplicate list")))
    }

    /// Append `value` to the list behind `raw`; returns the new leaf slot.
    fn append_duplicate(
        &mut self,
        leaf_block: BlockNumber,
        leaf: &Node,
        raw: i64,
        value: i64,
    ) -> Result<i64> {
        let node_size = self.tree.node_size();
        match ValueSlot::decode(raw, leaf_block)? {
            ValueSlot::Single(existing) => {
                let (block, mut fragment, index) = self.fragment_slot(leaf_block, leaf)?;
                fragment.slots[index] = vec![existing, value];
                self.store_fragment(block, &fragment)?;
                Ok(ValueSlot::Fragment { block, index }.encode())
            }
            ValueSlot::Fragment { block, index } => {
                let mut fragment = self.tree.load_fragment(block)?;
                let values = Self::fragment_values(&mut fragment, block, index)?;
                if values.len() < MAX_FRAGMENT_VALUES {
                    values.push(value);
                    self.store_fragment(block, &fragment)?;
                    return Ok(raw);
                }
                let mut all = std::mem::take(values);
                all.push(value);
                let first = self.take()?;
                self.write(first, &DuplicateNode::new(all).encode(node_size))?;
                self.store_fragment(block, &fragment)?;
                debug!(
                    target: "bfs::btree",
                    fragment = block.0,
                    duplicates = first.0,
                    "btree_duplicates_spill"
                );
                Ok(ValueSlot::Duplicates { first }.encode())
            }
            ValueSlot::Duplicates { first } => {
                let mut chain = self.tree.duplicate_chain(&self.header, first)?;
                let Some((last_block, last)) = chain.last_mut() else {
                    return Err(bad(first, "empty duplicate chain"));
                };
                if last.values.len() < DuplicateNode::capacity(node_size) {
                    last.values.push(value);
                    self.write(*last_block, &last.encode(node_size))?;
                } else {
                    let block = self.take()?;
                    let mut next = DuplicateNode::new(vec![value]);
                    next.left = link(*last_block);
                    last.right = link(block);
                    self.write(*last_block, &last.encode(node_size))?;
                    self.write(block, &next.encode(node_size))?;
                }
                Ok(raw)
            }
        }
    }

    /// Remove the first occurrence of `value` from a duplicate list;
    /// returns the new leaf slot.
    fn remove_duplicate(
        &mut self,
        leaf_block: BlockNumber,
        leaf: &Node,
        slot: ValueSlot,
        value: i64,
    ) -> Result<i64> {
        let node_size = self.tree.node_size();
        match slot {
            ValueSlot::Single(_) => Err(BfsError::Invariant(
                "single value handed to duplicate removal".to_owned(),
            )),
            ValueSlot::Fragment { block, index } => {
                let mut fragment = self.tree.load_fragment(block)?;
                let values = Self::fragment_values(&mut fragment, block, index)?;
                let at = values
                    .iter()
                    .position(|stored| *stored == value)
                    .ok_or(BfsError::NotFound)?;
                values.remove(at);
                let updated = if values.len() == 1 {
                    let last = values[0];
                    values.clear();
                    ValueSlot::Single(last).encode()
                } else {
                    slot.encode()
                };
                self.store_fragment(block, &fragment)?;
                Ok(updated)
            }
            ValueSlot::Duplicates { first } => {
                let mut chain = self.tree.duplicate_chain(&self.header, first)?;
                let (node_at, value_at) = chain
                    .iter()
                    .enumerate()
                    .find_map(|(i, (_, node))| {
                        node.values
                            .iter()
                            .position(|stored| *stored == value)
                            .map(|at| (i, at))
                    })
                    .ok_or(BfsError::NotFound)?;
                chain[node_at].1.values.remove(value_at);
                if chain[node_at].1.values.is_empty() {
                    let (emptied, _) = chain.remove(node_at);
                    self.release(emptied)?;
                }

                let remaining: Vec<i64> = chain
                    .iter()
                    .flat_map(|(_, node)| node.values.iter().copied())
                    .collect();
                if remaining.len() <= MAX_FRAGMENT_VALUES {
                    for (block, _) in &chain {
                        self.release(*block)?;
                    }
                    if let [only] = remaining[..] {
                        return Ok(ValueSlot::Single(only).encode());
                    }
                    let (block, mut fragment, index) = self.fragment_slot(leaf_block, leaf)?;
                    fragment.slots[index] = remaining;
                    self.store_fragment(block, &fragment)?;
                    debug!(
                        target: "bfs::btree",
                        fragment = block.0,
                        "btree_duplicates_fold"
                    );
                    return Ok(ValueSlot::Fragment { block, index }.encode());
                }

                let links: Vec<i64> = chain.iter().map(|(block, _)| link(*block)).collect();
                for (i, (block, node)) in chain.iter_mut().enumerate() {
                    node.left = if i == 0 { NULL_LINK } else { links[i - 1] };
                    node.right = links.get(i + 1).copied().unwrap_or(NULL_LINK);
                    self.write(*block, &node.encode(node_size))?;
                }
                Ok(ValueSlot::Duplicates { first: chain[0].0 }.encode())
            }
        }
    }
}
