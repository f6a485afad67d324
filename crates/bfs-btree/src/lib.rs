#![forbid(unsafe_code)]
//! Persistent B+tree index.
//!
//! Maps byte-string keys (ordered by the tree's [`KeyType`]) to `i64` values
//! in `0..=MAX_VALUE`. Every node is one block read and written through the
//! block cache; mutations go through a [`Transaction`] so they are journaled
//! with the rest of the metadata change.
//!
//! ```text
//!   header ──root──▶ internal ──▶ internal ──▶ leaf ◀─▶ leaf ◀─▶ leaf
//!                                                │
//!                                   duplicate link ──▶ fragment / duplicate node
//! ```
//!
//! Trees that allow duplicates keep up to [`MAX_FRAGMENT_VALUES`] values of
//! a key in a fragment shared with other keys and move longer lists to a
//! chain of dedicated duplicate nodes.
//!
//! ## Locking
//!
//! Lookups share a reader/writer lock; mutations hold it exclusively.
//! Mutations draw new nodes from the tree's free list, which is topped up
//! through a [`NodeAllocator`] *before* the tree lock is taken, so the
//! allocator lock is never acquired under the tree lock.
//!
//! ## Errors
//!
//! A failed mutation may leave some of its blocks modified; the caller
//! aborts the transaction, which restores them.

mod duplicate;
mod header;
mod iterator;
pub mod key;
mod modify;
mod node;
mod validate;

pub use duplicate::{MAX_FRAGMENT_VALUES, MAX_VALUE};
pub use iterator::{Direction, TreeIterator};
pub use key::{KeyType, MAX_KEY_LENGTH};
pub use validate::TreeStats;

use bfs_block::BlockCache;
use bfs_error::{BfsError, Result};
use bfs_journal::Transaction;
use bfs_types::lock_order::{self, LockLevel};
use bfs_types::{BlockNumber, NULL_LINK, block_to_link, link_to_block};
use duplicate::{DuplicateNode, FragmentNode, ValueSlot};
use header::{FLAG_DUPLICATES, TreeHeader};
use modify::Writer;
use node::{Node, bad};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, info};

/// Source of blocks for tree nodes.
///
/// Implementations take the allocator lock, so the tree only calls them
/// while it does not hold its own lock.
pub trait NodeAllocator {
    /// Allocate one block within `txn`, preferably close to `near`.
    fn allocate_node(&self, txn: &Transaction<'_>, near: BlockNumber) -> Result<BlockNumber>;

    /// Give a block previously returned by `allocate_node` back.
    fn free_node(&self, txn: &Transaction<'_>, block: BlockNumber) -> Result<()>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TreeOptions {
    pub key_type: KeyType,
    pub allow_duplicates: bool,
}

impl Default for TreeOptions {
    fn default() -> Self {
        Self {
            key_type: KeyType::String,
            allow_duplicates: false,
        }
    }
}

/// Handle to one tree, identified by its header block.
pub struct BPlusTree {
    cache: Arc<BlockCache>,
    header_block: BlockNumber,
    node_size: usize,
    key_type: KeyType,
    allow_duplicates: bool,
    lock: RwLock<()>,
}

impl std::fmt::Debug for BPlusTree {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BPlusTree")
            .field("header_block", &self.header_block)
            .field("key_type", &self.key_type)
            .field("allow_duplicates", &self.allow_duplicates)
            .finish_non_exhaustive()
    }
}

pub(crate) fn link(block: BlockNumber) -> i64 {
    block_to_link(Some(block))
}

impl BPlusTree {
    /// Create an empty tree: a header block and a single empty leaf.
    pub fn create(
        txn: &Transaction<'_>,
        nodes: &dyn NodeAllocator,
        options: TreeOptions,
    ) -> Result<Self> {
        let cache = Arc::clone(txn.cache());
        let node_size = cache.block_size();
        let node_size_u32 = u32::try_from(node_size)
            .map_err(|_| BfsError::Format(format!("node size {node_size} exceeds u32")))?;
        let header_block = nodes.allocate_node(txn, BlockNumber(0))?;
        let root = nodes.allocate_node(txn, header_block)?;

        let leaf = Node::empty_leaf().encode(node_size)?;
        txn.get_empty(root)?.copy_from_slice(&leaf);
        let header = TreeHeader {
            node_size: node_size_u32,
            height: 1,
            key_type: options.key_type,
            root: link(root),
            free_head: NULL_LINK,
            node_count: 1,
            flags: if options.allow_duplicates {
                FLAG_DUPLICATES
            } else {
                0
            },
        };
        txn.get_empty(header_block)?.copy_from_slice(&header.encode());
        info!(
            target: "bfs::btree",
            header = header_block.0,
            root = root.0,
            key_type = ?options.key_type,
            duplicates = options.allow_duplicates,
            "btree_create"
        );
        Ok(Self {
            cache,
            header_block,
            node_size,
            key_type: options.key_type,
            allow_duplicates: options.allow_duplicates,
            lock: RwLock::new(()),
        })
    }

    /// Open the tree whose header lives at `header_block`.
    pub fn open(cache: Arc<BlockCache>, header_block: BlockNumber) -> Result<Self> {
        let raw = cache.get(header_block)?.to_vec();
        let header = TreeHeader::decode(&raw, header_block)?;
        debug!(
            target: "bfs::btree",
            header = header_block.0,
            height = header.height,
            nodes = header.node_count,
            "btree_open"
        );
        Ok(Self {
            node_size: cache.block_size(),
            cache,
            header_block,
            key_type: header.key_type,
            allow_duplicates: header.allows_duplicates(),
            lock: RwLock::new(()),
        })
    }

    #[must_use]
    pub fn header_block(&self) -> BlockNumber {
        self.header_block
    }

    #[must_use]
    pub fn key_type(&self) -> KeyType {
        self.key_type
    }

    #[must_use]
    pub fn allows_duplicates(&self) -> bool {
        self.allow_duplicates
    }

    /// Levels from the root to the leaves.
    pub fn height(&self) -> Result<u32> {
        let _level = lock_order::enter(LockLevel::Tree);
        let _guard = self.lock.read();
        Ok(self.read_header()?.height)
    }

    // ── Lookup ──────────────────────────────────────────────────────────────

    /// First value stored under `key`.
    pub fn find(&self, key: &[u8]) -> Result<i64> {
        self.key_type.validate(key)?;
        let _level = lock_order::enter(LockLevel::Tree);
        let _guard = self.lock.read();
        let header = self.read_header()?;
        let (leaf_block, leaf) = self.find_leaf(&header, key)?;
        let index = self.search(&leaf, key).map_err(|_| BfsError::NotFound)?;
        match ValueSlot::decode(leaf.values[index], leaf_block)? {
            ValueSlot::Single(value) => Ok(value),
            slot => self
                .slot_values(&header, slot)?
                .first()
                .copied()
                .ok_or_else(|| bad(leaf_block, "duplicate list is empty")),
        }
    }

    /// Every value stored under `key`, in insertion order.
    pub fn find_all(&self, key: &[u8]) -> Result<Vec<i64>> {
        self.key_type.validate(key)?;
        let _level = lock_order::enter(LockLevel::Tree);
        let _guard = self.lock.read();
        let header = self.read_header()?;
        let (leaf_block, leaf) = self.find_leaf(&header, key)?;
        let index = self.search(&leaf, key).map_err(|_| BfsError::NotFound)?;
        let slot = ValueSlot::decode(leaf.values[index], leaf_block)?;
        self.slot_values(&header, slot)
    }

    /// True when `key` holds at least one value.
    pub fn contains(&self, key: &[u8]) -> Result<bool> {
        match self.find(key) {
            Ok(_) => Ok(true),
            Err(BfsError::NotFound) => Ok(false),
            Err(err) => Err(err),
        }
    }

    #[must_use]
    pub fn iter(&self, direction: Direction) -> TreeIterator<'_> {
        TreeIterator::new(self, direction)
    }

    // ── Mutation ────────────────────────────────────────────────────────────

    /// Insert `value` under `key`.
    ///
    /// A present key fails with `Exists` unless the tree allows duplicates,
    /// in which case `value` is appended to the key's list.
    pub fn insert(
        &self,
        txn: &Transaction<'_>,
        nodes: &dyn NodeAllocator,
        key: &[u8],
        value: i64,
    ) -> Result<()> {
        self.key_type.validate(key)?;
        check_value(value)?;
        let reserved = self.reserve(txn, nodes, modify::insert_reserve)?;
        let _level = lock_order::enter(LockLevel::Tree);
        let _guard = self.lock.write();
        let mut writer = Writer::new(self, txn, reserved)?;
        let outcome = writer.insert(key, value);
        // Reserved nodes stay on the free list even when the change is refused.
        writer.finish()?;
        outcome
    }

    /// Remove one occurrence of `value` under `key`.
    pub fn remove(
        &self,
        txn: &Transaction<'_>,
        nodes: &dyn NodeAllocator,
        key: &[u8],
        value: i64,
    ) -> Result<()> {
        self.key_type.validate(key)?;
        let reserved = self.reserve(txn, nodes, modify::remove_reserve)?;
        let _level = lock_order::enter(LockLevel::Tree);
        let _guard = self.lock.write();
        let mut writer = Writer::new(self, txn, reserved)?;
        let outcome = writer.remove(key, value);
        // Reserved nodes stay on the free list even when the change is refused.
        writer.finish()?;
        outcome
    }

    /// Overwrite the value of a key holding exactly one value.
    pub fn replace(&self, txn: &Transaction<'_>, key: &[u8], value: i64) -> Result<()> {
        self.key_type.validate(key)?;
        check_value(value)?;
        let _level = lock_order::enter(LockLevel::Tree);
        let _guard = self.lock.write();
        let mut writer = Writer::new(self, txn, Vec::new())?;
        writer.replace(key, value)?;
        writer.finish()
    }

    /// Return free-list nodes beyond `keep` to `nodes`.
    pub fn shrink_free_list(
        &self,
        txn: &Transaction<'_>,
        nodes: &dyn NodeAllocator,
        keep: usize,
    ) -> Result<usize> {
        let released = {
            let _level = lock_order::enter(LockLevel::Tree);
            let _guard = self.lock.write();
            let mut writer = Writer::new(self, txn, Vec::new())?;
            let released = writer.detach_free_nodes(keep)?;
            writer.finish()?;
            released
        };
        for block in &released {
            nodes.free_node(txn, *block)?;
        }
        if !released.is_empty() {
            debug!(
                target: "bfs::btree",
                header = self.header_block.0,
                released = released.len(),
                "btree_free_list_shrunk"
            );
        }
        Ok(released.len())
    }

    /// Make sure the free list holds the nodes an operation may need,
    /// allocating the shortfall before the tree lock is taken.
    fn reserve(
        &self,
        txn: &Transaction<'_>,
        nodes: &dyn NodeAllocator,
        need: fn(&TreeHeader) -> usize,
    ) -> Result<Vec<BlockNumber>> {
        let (have, need) = {
            let _level = lock_order::enter(LockLevel::Tree);
            let _guard = self.lock.read();
            let header = self.read_header()?;
            let need = need(&header);
            (self.free_list_len(&header, need)?, need)
        };
        (have..need)
            .map(|_| nodes.allocate_node(txn, self.header_block))
            .collect()
    }

    // ── Block access ────────────────────────────────────────────────────────

    pub(crate) fn node_size(&self) -> usize {
        self.node_size
    }

    pub(crate) fn read_block(&self, block: BlockNumber) -> Result<Vec<u8>> {
        Ok(self.cache.get(block)?.to_vec())
    }

    pub(crate) fn read_header(&self) -> Result<TreeHeader> {
        TreeHeader::decode(&self.read_block(self.header_block)?, self.header_block)
    }

    /// Resolve a link stored in `from` to a block inside the volume.
    pub(crate) fn link_block(&self, value: i64, from: BlockNumber) -> Result<BlockNumber> {
        match link_to_block(value) {
            Some(block) if block.0 < self.cache.block_count() && block != self.header_block => {
                Ok(block)
            }
            _ => Err(bad(from, format!("link {value} points outside the tree"))),
        }
    }

    pub(crate) fn load_node(&self, block: BlockNumber) -> Result<Node> {
        Node::decode(&self.read_block(block)?, block)
    }

    pub(crate) fn load_fragment(&self, block: BlockNumber) -> Result<FragmentNode> {
        FragmentNode::decode(&self.read_block(block)?, block)
    }

    pub(crate) fn load_duplicate(&self, block: BlockNumber) -> Result<DuplicateNode> {
        DuplicateNode::decode(&self.read_block(block)?, block)
    }

    pub(crate) fn search(&self, node: &Node, key: &[u8]) -> std::result::Result<usize, usize> {
        node.keys
            .binary_search_by(|probe| self.key_type.compare(probe, key))
    }

    /// Child slot of an internal node to follow for `key`.
    pub(crate) fn child_index(&self, node: &Node, key: &[u8]) -> usize {
        node.keys
            .partition_point(|probe| self.key_type.compare(probe, key).is_le())
    }

    /// Descend from the root to the leaf that holds (or would hold) `key`.
    pub(crate) fn find_leaf(&self, header: &TreeHeader, key: &[u8]) -> Result<(BlockNumber, Node)> {
        let mut block = self.link_block(header.root, self.header_block)?;
        for depth in 1..=header.height {
            let node = self.load_node(block)?;
            let is_last = depth == header.height;
            if node.leaf != is_last {
                return Err(bad(
                    block,
                    format!("node at depth {depth} of {} has leaf={}", header.height, node.leaf),
                ));
            }
            if is_last {
                return Ok((block, node));
            }
            let index = self.child_index(&node, key);
            block = self.link_block(node.child(index), block)?;
        }
        Err(bad(self.header_block, "tree has no leaf level"))
    }

    /// Leftmost (`Forward`) or rightmost (`Backward`) leaf.
    pub(crate) fn edge_leaf(
        &self,
        header: &TreeHeader,
        direction: Direction,
    ) -> Result<(BlockNumber, Node)> {
        let mut block = self.link_block(header.root, self.header_block)?;
        for depth in 1..=header.height {
            let node = self.load_node(block)?;
            if node.leaf != (depth == header.height) {
                return Err(bad(block, format!("unexpected node kind at depth {depth}")));
            }
            if node.leaf {
                return Ok((block, node));
            }
            let index = match direction {
                Direction::Forward => 0,
                Direction::Backward => node.len(),
            };
            block = self.link_block(node.child(index), block)?;
        }
        Err(bad(self.header_block, "tree has no leaf level"))
    }

    /// All values behind a leaf slot.
    pub(crate) fn slot_values(&self, header: &TreeHeader, slot: ValueSlot) -> Result<Vec<i64>> {
        match slot {
            ValueSlot::Single(value) => Ok(vec![value]),
            ValueSlot::Fragment { block, index } => {
                let fragment = self.load_fragment(block)?;
                match fragment.slots.get(index) {
                    Some(values) if values.len() >= 2 => Ok(values.clone()),
                    _ => Err(bad(block, format!("fragment {index} is not a duplicate list"))),
                }
            }
            ValueSlot::Duplicates { first } => Ok(self
                .duplicate_chain(header, first)?
                .into_iter()
                .flat_map(|(_, node)| node.values)
                .collect()),
        }
    }

    /// Nodes of a duplicate chain from `first` along the right links.
    pub(crate) fn duplicate_chain(
        &self,
        header: &TreeHeader,
        first: BlockNumber,
    ) -> Result<Vec<(BlockNumber, DuplicateNode)>> {
        let limit = usize::try_from(header.node_count).unwrap_or(usize::MAX);
        let mut chain = Vec::new();
        let mut block = first;
        let mut previous = NULL_LINK;
        loop {
            if chain.len() >= limit {
                return Err(bad(first, "duplicate chain loops"));
            }
            let node = self.load_duplicate(block)?;
            if node.left != previous {
                return Err(bad(
                    block,
                    format!("duplicate node left link {} expected {previous}", node.left),
                ));
            }
            let next = node.right;
            chain.push((block, node));
            if next == NULL_LINK {
                return Ok(chain);
            }
            previous = link(block);
            block = self.link_block(next, block)?;
        }
    }

    /// Length of the free list, counting at most `limit` nodes.
    pub(crate) fn free_list_len(&self, header: &TreeHeader, limit: usize) -> Result<usize> {
        let mut count = 0;
        let mut next = header.free_head;
        while next != NULL_LINK && count < limit {
            let block = self.link_block(next, self.header_block)?;
            next = node::decode_free(&self.read_block(block)?, block)?;
            count += 1;
        }
        Ok(count)
    }
}

fn check_value(value: i64) -> Result<()> {
    if (0..=MAX_VALUE).contains(&value) {
        Ok(())
    } else {
        Err(BfsError::InvalidArgument(format!(
            "value {value} outside 0..={MAX_VALUE}"
        )))
    }
}
