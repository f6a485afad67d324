//! Full structural check of a tree.

use crate::duplicate::{FragmentNode, ValueSlot};
use crate::header::TreeHeader;
use crate::node::{self, bad};
use crate::{BPlusTree, link};
use bfs_error::Result;
use bfs_types::lock_order::{self, LockLevel};
use bfs_types::{BlockNumber, NULL_LINK};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use tracing::debug;

/// Node and entry counts gathered by [`BPlusTree::validate`].
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct TreeStats {
    pub height: u32,
    pub leaf_nodes: u64,
    pub internal_nodes: u64,
    pub fragment_nodes: u64,
    pub duplicate_nodes: u64,
    pub free_nodes: u64,
    /// Distinct keys.
    pub keys: u64,
    /// Stored values, duplicates included.
    pub values: u64,
}

struct Checker<'a> {
    tree: &'a BPlusTree,
    header: TreeHeader,
    stats: TreeStats,
    seen: BTreeSet<u64>,
    /// Leaves in key order with their sibling links.
    leaves: Vec<(BlockNumber, i64, i64)>,
    /// Fragment nodes and the number of leaf slots pointing into each.
    fragments: BTreeMap<u64, (FragmentNode, usize)>,
}

impl Checker<'_> {
    fn claim(&mut self, block: BlockNumber, what: &str) -> Result<()> {
        if self.seen.insert(block.0) {
            Ok(())
        } else {
            Err(bad(block, format!("{what} is reachable twice")))
        }
    }

    fn visit(
        &mut self,
        block: BlockNumber,
        depth: u32,
        lower: Option<&[u8]>,
        upper: Option<&[u8]>,
    ) -> Result<()> {
        self.claim(block, "tree node")?;
        let node = self.tree.load_node(block)?;
        if node.leaf != (depth == self.header.height) {
            return Err(bad(
                block,
                format!(
                    "node at depth {depth} of {} has leaf={}",
                    self.header.height, node.leaf
                ),
            ));
        }

        let key_type = self.tree.key_type;
        for (index, key) in node.keys.iter().enumerate() {
            key_type
                .validate(key)
                .map_err(|err| bad(block, format!("key {index}: {err}")))?;
            if index > 0 && key_type.compare(&node.keys[index - 1], key).is_ge() {
                return Err(bad(block, format!("key {index} is out of order")));
            }
            if lower.is_some_and(|lower| key_type.compare(key, lower).is_lt())
                || upper.is_some_and(|upper| key_type.compare(key, upper).is_ge())
            {
                return Err(bad(block, format!("key {index} lies outside its parent's range")));
            }
        }

        if node.leaf {
            self.stats.leaf_nodes += 1;
            self.stats.keys += node.len() as u64;
            for raw in &node.values {
                self.leaf_value(block, *raw)?;
            }
            self.leaves.push((block, node.left, node.right));
            return Ok(());
        }

        self.stats.internal_nodes += 1;
        for index in 0..=node.len() {
            let child = self.tree.link_block(node.child(index), block)?;
            let child_lower = if index == 0 {
                lower
            } else {
                Some(node.keys[index - 1].as_slice())
            };
            let child_upper = if index == node.len() {
                upper
            } else {
                Some(node.keys[index].as_slice())
            };
            self.visit(child, depth + 1, child_lower, child_upper)?;
        }
        Ok(())
    }

    fn leaf_value(&mut self, leaf: BlockNumber, raw: i64) -> Result<()> {
        match ValueSlot::decode(raw, leaf)? {
            ValueSlot::Single(_) => self.stats.values += 1,
            ValueSlot::Fragment { block, index } => {
                if !self.fragments.contains_key(&block.0) {
                    self.claim(block, "fragment node")?;
                    let fragment = self.tree.load_fragment(block)?;
                    self.fragments.insert(block.0, (fragment, 0));
                }
                let Some((fragment, refs)) = self.fragments.get_mut(&block.0) else {
                    return Err(bad(block, "fragment node vanished during the check"));
                };
                *refs += 1;
                match fragment.slots.get(index) {
                    Some(values) if values.len() >= 2 => self.stats.values += values.len() as u64,
                    _ => {
                        return Err(bad(block, format!("fragment {index} is not a duplicate list")));
                    }
                }
            }
            ValueSlot::Duplicates { first } => {
                let chain = self.tree.duplicate_chain(&self.header, first)?;
                for (block, node) in &chain {
                    self.claim(*block, "duplicate node")?;
                    self.stats.duplicate_nodes += 1;
                    self.stats.values += node.values.len() as u64;
                }
            }
        }
        Ok(())
    }

    fn check_leaf_chain(&self) -> Result<()> {
        for (position, (block, left, right)) in self.leaves.iter().enumerate() {
            let expected_left = position
                .checked_sub(1)
                .map_or(NULL_LINK, |prev| link(self.leaves[prev].0));
            let expected_right = self
                .leaves
                .get(position + 1)
                .map_or(NULL_LINK, |next| link(next.0));
            if *left != expected_left || *right != expected_right {
                return Err(bad(
                    *block,
                    format!(
                        "leaf links ({left}, {right}) expected ({expected_left}, {expected_right})"
                    ),
                ));
            }
        }
        Ok(())
    }

    fn check_fragments(&mut self) -> Result<()> {
        for (block, (fragment, refs)) in &self.fragments {
            if fragment.used() != *refs {
                return Err(bad(
                    BlockNumber(*block),
                    format!("{} fragments in use, {refs} referenced", fragment.used()),
                ));
            }
        }
        self.stats.fragment_nodes = self.fragments.len() as u64;
        Ok(())
    }

    fn check_free_list(&mut self) -> Result<()> {
        let mut next = self.header.free_head;
        while next != NULL_LINK {
            let block = self.tree.link_block(next, self.tree.header_block)?;
            self.claim(block, "free node")?;
            next = node::decode_free(&self.tree.read_block(block)?, block)?;
            self.stats.free_nodes += 1;
        }
        Ok(())
    }
}

impl BPlusTree {
    /// Walk every node and check ordering, separator ranges, leaf depth,
    /// sibling links, duplicate storage, the free list and the node count.
    ///
    /// Any inconsistency is reported as `BadData` on the offending block.
    pub fn validate(&self) -> Result<TreeStats> {
        let _level = lock_order::enter(LockLevel::Tree);
        let _guard = self.lock.read();
        let header = self.read_header()?;
        let mut checker = Checker {
            tree: self,
            header,
            stats: TreeStats {
                height: header.height,
                ..TreeStats::default()
            },
            seen: BTreeSet::new(),
            leaves: Vec::new(),
            fragments: BTreeMap::new(),
        };
        let root = self.link_block(header.root, self.header_block)?;
        checker.visit(root, 1, None, None)?;
        checker.check_leaf_chain()?;
        checker.check_fragments()?;
        checker.check_free_list()?;

        let counted = checker.seen.len() as u64;
        if i64::try_from(counted).ok() != Some(header.node_count) {
            return Err(bad(
                self.header_block,
                format!("header counts {} nodes, found {counted}", header.node_count),
            ));
        }
        debug!(
            target: "bfs::btree",
            header = self.header_block.0,
            nodes = counted,
            keys = checker.stats.keys,
            "btree_validated"
        );
        Ok(checker.stats)
    }
}
