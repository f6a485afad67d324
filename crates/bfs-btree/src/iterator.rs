//! Ordered iteration over a tree.
//!
//! The iterator holds no lock between steps. It remembers the last entry it
//! returned and, on the next step, picks up from there: directly in the
//! remembered leaf when that entry is still where it was, otherwise by
//! searching for the key again. Entries inserted behind the cursor are not
//! seen; entries removed ahead of it are skipped.

use crate::duplicate::ValueSlot;
use crate::header::TreeHeader;
use crate::node::{Node, bad};
use crate::BPlusTree;
use bfs_error::Result;
use bfs_types::lock_order::{self, LockLevel};
use bfs_types::{BlockNumber, NULL_LINK};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Forward,
    Backward,
}

/// Where the last value came from inside a duplicate chain.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct ChainSpot {
    first: BlockNumber,
    node: BlockNumber,
    offset: usize,
}

#[derive(Debug, Clone)]
enum Position {
    Start,
    Seek(Vec<u8>),
    /// Last entry returned: its key, the duplicate ordinal, and where it was.
    After {
        key: Vec<u8>,
        dup: usize,
        leaf: BlockNumber,
        index: usize,
        chain: Option<ChainSpot>,
    },
    End,
}

/// Cursor yielding `(key, value)` pairs, one per stored value.
///
/// Duplicates come in insertion order going forward and in reverse going
/// backward.
pub struct TreeIterator<'t> {
    tree: &'t BPlusTree,
    direction: Direction,
    position: Position,
}

impl std::fmt::Debug for TreeIterator<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TreeIterator")
            .field("tree", &self.tree.header_block)
            .field("direction", &self.direction)
            .finish_non_exhaustive()
    }
}

impl<'t> TreeIterator<'t> {
    pub(crate) fn new(tree: &'t BPlusTree, direction: Direction) -> Self {
        Self {
            tree,
            direction,
            position: Position::Start,
        }
    }

    #[must_use]
    pub fn direction(&self) -> Direction {
        self.direction
    }

    /// Restart from the first (or last) key.
    pub fn rewind(&mut self) {
        self.position = Position::Start;
    }

    /// Continue from `key`: forward from the first key at or above it,
    /// backward from the last key at or below it.
    pub fn seek(&mut self, key: &[u8]) -> Result<()> {
        self.tree.key_type.validate(key)?;
        self.position = Position::Seek(key.to_vec());
        Ok(())
    }

    fn first_index(&self, node: &Node) -> Option<usize> {
        match self.direction {
            Direction::Forward => Some(0),
            Direction::Backward => node.len().checked_sub(1),
        }
    }

    fn advance(&self, index: Option<usize>) -> Option<usize> {
        match self.direction {
            Direction::Forward => index.map(|i| i + 1),
            Direction::Backward => index.and_then(|i| i.checked_sub(1)),
        }
    }

    /// Index of the first entry at or past a missing key's insert point.
    fn around(&self, insert_at: usize) -> Option<usize> {
        match self.direction {
            Direction::Forward => Some(insert_at),
            Direction::Backward => insert_at.checked_sub(1),
        }
    }

    fn step(&mut self) -> Result<Option<(Vec<u8>, i64)>> {
        let tree = self.tree;
        let _level = lock_order::enter(LockLevel::Tree);
        let _guard = tree.lock.read();
        let header = tree.read_header()?;
        let (block, node, index, dup, chain) = match std::mem::replace(&mut self.position, Position::End)
        {
            Position::End => return Ok(None),
            Position::Start => {
                let (block, node) = tree.edge_leaf(&header, self.direction)?;
                let index = self.first_index(&node);
                (block, node, index, 0, None)
            }
            Position::Seek(key) => {
                let (block, node) = tree.find_leaf(&header, &key)?;
                let index = match tree.search(&node, &key) {
                    Ok(index) => Some(index),
                    Err(insert_at) => self.around(insert_at),
                };
                (block, node, index, 0, None)
            }
            Position::After {
                key,
                dup,
                leaf,
                index,
                chain,
            } => {
                let (block, node, index, dup) = self.resume(&header, &key, dup, leaf, index)?;
                (block, node, index, dup, chain.filter(|_| dup > 0))
            }
        };
        self.walk(&header, block, node, index, dup, chain)
    }

    fn resume(
        &self,
        header: &TreeHeader,
        key: &[u8],
        dup: usize,
        leaf: BlockNumber,
        index: usize,
    ) -> Result<(BlockNumber, Node, Option<usize>, usize)> {
        let tree = self.tree;
        let unchanged = tree
            .load_node(leaf)
            .ok()
            .filter(|node| node.leaf && node.keys.get(index).is_some_and(|k| k == key));
        let (block, node, found) = match unchanged {
            Some(node) => (leaf, node, Ok(index)),
            None => {
                let (block, node) = tree.find_leaf(header, key)?;
                let found = tree.search(&node, key);
                (block, node, found)
            }
        };
        Ok(match found {
            Ok(index) => (block, node, Some(index), dup + 1),
            Err(insert_at) => (block, node, self.around(insert_at), 0),
        })
    }

    fn walk(
        &mut self,
        header: &TreeHeader,
        mut block: BlockNumber,
        mut node: Node,
        mut index: Option<usize>,
        mut dup: usize,
        mut chain: Option<ChainSpot>,
    ) -> Result<Option<(Vec<u8>, i64)>> {
        let tree = self.tree;
        let limit = header.node_count;
        let mut hops = 0_i64;
        loop {
            if let Some(i) = index.filter(|i| *i < node.len()) {
                let found = match ValueSlot::decode(node.values[i], block)? {
                    ValueSlot::Duplicates { first } => {
                        self.chain_value(header, first, dup, chain.take())?
                    }
                    slot => {
                        let values = tree.slot_values(header, slot)?;
                        (dup < values.len()).then(|| {
                            let value = match self.direction {
                                Direction::Forward => values[dup],
                                Direction::Backward => values[values.len() - 1 - dup],
                            };
                            (value, None)
                        })
                    }
                };
                if let Some((value, spot)) = found {
                    let key = node.keys[i].clone();
                    self.position = Position::After {
                        key: key.clone(),
                        dup,
                        leaf: block,
                        index: i,
                        chain: spot,
                    };
                    return Ok(Some((key, value)));
                }
                index = self.advance(index);
                dup = 0;
                chain = None;
                continue;
            }

            let next = match self.direction {
                Direction::Forward => node.right,
                Direction::Backward => node.left,
            };
            if next == NULL_LINK {
                return Ok(None);
            }
            hops += 1;
            if hops > limit {
                return Err(bad(tree.header_block, "leaf chain loops"));
            }
            let next_block = tree.link_block(next, block)?;
            node = tree.load_node(next_block)?;
            if !node.leaf {
                return Err(bad(next_block, "leaf sibling link reaches an internal node"));
            }
            block = next_block;
            index = self.first_index(&node);
            dup = 0;
            chain = None;
        }
    }

    /// Value `dup` places into the chain starting at `first`, in iteration
    /// order.
    ///
    /// Steps on from `spot` when it is still part of the same chain, so a
    /// walk over the whole chain loads each node about once. Otherwise the
    /// chain is read from the start.
    fn chain_value(
        &self,
        header: &TreeHeader,
        first: BlockNumber,
        dup: usize,
        spot: Option<ChainSpot>,
    ) -> Result<Option<(i64, Option<ChainSpot>)>> {
        if let Some(spot) = spot.filter(|spot| spot.first == first && dup > 0) {
            // A node freed or reused since the last step falls back to a full read.
            if let Ok(next) = self.chain_next(header, spot) {
                return Ok(next.map(|(value, spot)| (value, Some(spot))));
            }
        }

        let chain = self.tree.duplicate_chain(header, first)?;
        let total: usize = chain.iter().map(|(_, node)| node.values.len()).sum();
        if dup >= total {
            return Ok(None);
        }
        let mut ordinal = match self.direction {
            Direction::Forward => dup,
            Direction::Backward => total - 1 - dup,
        };
        for (block, node) in chain {
            if let Some(value) = node.values.get(ordinal) {
                let spot = ChainSpot {
                    first,
                    node: block,
                    offset: ordinal,
                };
                return Ok(Some((*value, Some(spot))));
            }
            ordinal -= node.values.len();
        }
        Ok(None)
    }

    /// The value after `spot` in iteration order, following chain links.
    fn chain_next(
        &self,
        header: &TreeHeader,
        spot: ChainSpot,
    ) -> Result<Option<(i64, ChainSpot)>> {
        let tree = self.tree;
        let mut block = spot.node;
        let mut node = tree.load_duplicate(block)?;
        let mut offset = match self.direction {
            Direction::Forward => Some(spot.offset + 1),
            Direction::Backward => spot.offset.checked_sub(1),
        };
        let mut hops = 0_i64;
        loop {
            if let Some(at) = offset.filter(|at| *at < node.values.len()) {
                let next = ChainSpot {
                    first: spot.first,
                    node: block,
                    offset: at,
                };
                return Ok(Some((node.values[at], next)));
            }
            let link = match self.direction {
                Direction::Forward => node.right,
                Direction::Backward => node.left,
            };
            if link == NULL_LINK {
                return Ok(None);
            }
            hops += 1;
            if hops > header.node_count {
                return Err(bad(spot.first, "duplicate chain loops"));
            }
            block = tree.link_block(link, block)?;
            node = tree.load_duplicate(block)?;
            offset = match self.direction {
                Direction::Forward => Some(0),
                Direction::Backward => node.values.len().checked_sub(1),
            };
        }
    }
}

impl Iterator for TreeIterator<'_> {
    type Item = Result<(Vec<u8>, i64)>;

    fn next(&mut self) -> Option<Self::Item> {
        match self.step() {
            Ok(Some(entry)) => Some(Ok(entry)),
            Ok(None) => None,
            Err(err) => {
                self.position = Position::End;
                Some(Err(err))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::TreeOptions;
    use crate::tests::{Fixture, duplicates, key};

    fn filled(fx: &Fixture, count: u32) -> BPlusTree {
        let tree = fx.create(TreeOptions::default());
        // Insert out of order so splits happen across the whole range.
        for n in (0..count).rev().step_by(2).chain((0..count).step_by(2)) {
            fx.insert(&tree, &key(n), i64::from(n)).unwrap();
        }
        tree
    }

    fn keys(iter: TreeIterator<'_>) -> Vec<Vec<u8>> {
        iter.map(|entry| entry.map(|(k, _)| k))
            .collect::<Result<_>>()
            .unwrap()
    }

    #[test]
    fn walks_every_leaf_in_both_directions() {
        let fx = Fixture::new();
        let tree = filled(&fx, 300);
        assert!(tree.height().unwrap() >= 2);

        let forward = keys(tree.iter(Direction::Forward));
        let expected: Vec<Vec<u8>> = (0..300).map(key).collect();
        assert_eq!(forward, expected);

        let backward = keys(tree.iter(Direction::Backward));
        let mut reversed = expected;
        reversed.reverse();
        assert_eq!(backward, reversed);
    }

    #[test]
    fn empty_tree_yields_nothing() {
        let fx = Fixture::new();
        let tree = fx.create(TreeOptions::default());
        assert!(tree.iter(Direction::Forward).next().is_none());
        assert!(tree.iter(Direction::Backward).next().is_none());
    }

    #[test]
    fn seek_lands_on_or_beside_the_key() {
        let fx = Fixture::new();
        let tree = filled(&fx, 300);

        let mut iter = tree.iter(Direction::Forward);
        iter.seek(&key(150)).unwrap();
        assert_eq!(iter.next().unwrap().unwrap(), (key(150), 150));

        // Sorts between key(150) and key(151).
        let between = b"key-0001505".to_vec();
        iter.seek(&between).unwrap();
        assert_eq!(iter.next().unwrap().unwrap().0, key(151));

        let mut back = tree.iter(Direction::Backward);
        back.seek(&between).unwrap();
        assert_eq!(back.next().unwrap().unwrap().0, key(150));
        back.seek(b"a").unwrap();
        assert!(back.next().is_none());

        back.rewind();
        assert_eq!(back.next().unwrap().unwrap().0, key(299));
        assert!(iter.seek(&[b'x'; 300]).is_err());
    }

    #[test]
    fn picks_up_after_concurrent_changes() {
        let fx = Fixture::new();
        let tree = filled(&fx, 300);
        let mut iter = tree.iter(Direction::Forward);
        let first: Vec<Vec<u8>> = iter.by_ref().take(10).map(|e| e.unwrap().0).collect();
        assert_eq!(first.last(), Some(&key(9)));

        // Drop the entry under the cursor and the next ten, and add one
        // behind it.
        for n in 9..20 {
            fx.remove(&tree, &key(n), i64::from(n)).unwrap();
        }
        fx.insert(&tree, b"key-000005z", 5).unwrap();

        assert_eq!(iter.next().unwrap().unwrap(), (key(20), 20));
        assert_eq!(keys(iter).len(), 279);
    }

    #[test]
    fn duplicates_reverse_when_walking_backward() {
        let fx = Fixture::new();
        let tree = fx.create(duplicates());
        for v in 1..=3 {
            fx.insert(&tree, b"a", v).unwrap();
        }
        fx.insert(&tree, b"b", 4).unwrap();

        let backward: Vec<(Vec<u8>, i64)> = tree
            .iter(Direction::Backward)
            .collect::<Result<_>>()
            .unwrap();
        assert_eq!(
            backward,
            vec![
                (b"b".to_vec(), 4),
                (b"a".to_vec(), 3),
                (b"a".to_vec(), 2),
                (b"a".to_vec(), 1),
            ]
        );

        // A value appended under the cursor's key is still reached.
        let mut iter = tree.iter(Direction::Forward);
        assert_eq!(iter.next().unwrap().unwrap(), (b"a".to_vec(), 1));
        fx.insert(&tree, b"a", 9).unwrap();
        let rest: Vec<i64> = iter.map(|e| e.unwrap().1).collect();
        assert_eq!(rest, vec![2, 3, 9, 4]);
    }

    #[test]
    fn long_duplicate_chain_is_walked_in_linear_reads() {
        let fx = Fixture::new();
        let tree = fx.create(duplicates());
        let count = 1_200_i64;
        fx.txn(|txn| {
            for v in 0..count {
                tree.insert(txn, &fx.nodes, b"dup", v)?;
            }
            tree.insert(txn, &fx.nodes, b"end", -1)
        })
        .unwrap();
        assert_eq!(tree.validate().unwrap().values, 1_201);

        let reads = || {
            let stats = fx.journal.cache().stats();
            stats.hits + stats.misses
        };
        let n = u64::try_from(count).unwrap();

        let before = reads();
        let forward: Vec<i64> = tree
            .iter(Direction::Forward)
            .map(|e| e.unwrap().1)
            .collect();
        let mut expected: Vec<i64> = (0..count).collect();
        expected.push(-1);
        assert_eq!(forward, expected);
        assert!(reads() - before < 4 * n, "forward walk took {} reads", reads() - before);

        let before = reads();
        let backward: Vec<i64> = tree
            .iter(Direction::Backward)
            .map(|e| e.unwrap().1)
            .collect();
        expected.reverse();
        assert_eq!(backward, expected);
        assert!(reads() - before < 4 * n, "backward walk took {} reads", reads() - before);
    }

    #[test]
    fn chain_changes_under_the_cursor_are_seen() {
        let fx = Fixture::new();
        let tree = fx.create(duplicates());
        fx.txn(|txn| {
            for v in 0..300 {
                tree.insert(txn, &fx.nodes, b"dup", v)?;
            }
            Ok(())
        })
        .unwrap();

        let mut iter = tree.iter(Direction::Forward);
        let head: Vec<i64> = iter.by_ref().take(100).map(|e| e.unwrap().1).collect();
        assert_eq!(head, (0..100).collect::<Vec<i64>>());

        // Drop values ahead of the cursor and append one at the end.
        for v in 100..110 {
            fx.remove(&tree, b"dup", v).unwrap();
        }
        fx.insert(&tree, b"dup", 1_000).unwrap();
        let rest: Vec<i64> = iter.map(|e| e.unwrap().1).collect();
        let mut expected: Vec<i64> = (110..300).collect();
        expected.push(1_000);
        assert_eq!(rest, expected);
    }
}
